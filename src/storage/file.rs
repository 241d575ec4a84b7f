//! File-based storage backend
//!
//! Day logs live under `<root>/<namespace>/` (see [`super::schema`]). Every
//! write loads the whole day, appends, and atomically replaces the file;
//! daily volumes are small enough that this beats any index structure.

use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use super::backend::{History, TimeSeriesStore};
use super::error::{StorageError, StorageResult};
use super::schema::{DayFile, DayForm, temp_path};
use crate::observation::Observation;
use crate::target::canonical_name;

/// Time-series store on the local file system
pub struct FileStore {
    /// Root directory holding one directory per namespace
    root: PathBuf,

    /// Per-file write locks (one writer per day log at a time)
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,

    /// Fixed "today", used instead of the host clock when set
    today: Option<NaiveDate>,
}

impl FileStore {
    /// Open a store rooted at `root`
    ///
    /// Nothing is written here: the root is created by the first append. An
    /// existing `root` must be a directory.
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        match fs::metadata(&root).await {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(StorageError::io(
                    &root,
                    std::io::Error::other("not a directory"),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&root, e)),
        }

        debug!("file store opened at {}", root.display());

        Ok(Self {
            root,
            file_locks: Mutex::new(HashMap::new()),
            today: None,
        })
    }

    /// Pin the store's notion of today (for maintenance and history windows)
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    fn namespace_dir(&self, target: &str) -> StorageResult<PathBuf> {
        let namespace = canonical_name(target);
        if namespace.is_empty() {
            return Err(StorageError::InvalidTarget(target.to_string()));
        }
        Ok(self.root.join(namespace))
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().await;
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Forget the write lock of `path` unless another task still holds a handle
    async fn release_lock(&self, path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.file_locks.lock().await;
        // one reference in the map, one in `lock`
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(path);
        }
    }

    /// Day logs of one namespace directory, in no particular order
    async fn day_files(dir: &Path) -> StorageResult<Vec<DayFile>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(StorageError::io(dir, e)),
        };

        let mut files = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(dir, e))?
        {
            if let Some(file) = DayFile::parse(&entry.path()) {
                files.push(file);
            }
        }

        Ok(files)
    }

    /// Namespace directories below the root
    async fn namespace_dirs(&self) -> StorageResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(StorageError::io(&self.root, e)),
        };

        let mut dirs = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.root, e))?
        {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(&path, e))?
                .is_dir();

            if is_dir && !hidden {
                dirs.push(path);
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    /// Raw JSON bytes of a day log, decompressed if necessary
    async fn read_raw(file: &DayFile) -> StorageResult<Vec<u8>> {
        let bytes = fs::read(&file.path)
            .await
            .map_err(|e| StorageError::io(&file.path, e))?;

        match file.form {
            DayForm::Open => Ok(bytes),
            DayForm::Compressed => {
                let mut json = Vec::with_capacity(bytes.len() * 4);
                GzDecoder::new(bytes.as_slice())
                    .read_to_end(&mut json)
                    .map_err(|e| StorageError::io(&file.path, e))?;
                Ok(json)
            }
        }
    }

    async fn read_day(file: &DayFile) -> StorageResult<Vec<Observation>> {
        let raw = Self::read_raw(file).await?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(vec![]);
        }
        serde_json::from_slice(&raw).map_err(|e| StorageError::serialization(&file.path, e))
    }

    fn gzip(path: &Path, json: &[u8]) -> StorageResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(json)
            .map_err(|e| StorageError::io(path, e))?;
        encoder.finish().map_err(|e| StorageError::io(path, e))
    }

    /// Replace `path` with `content` without ever leaving a truncated file
    async fn write_atomic(path: &Path, content: &[u8]) -> StorageResult<()> {
        let temp = temp_path(path);

        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            fs::rename(&temp, path).await?;
            sync_parent(path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::io(path, e));
        }

        Ok(())
    }

    /// Compress one open day log, returns whether a compressed file was written
    async fn compress_day(&self, file: &DayFile) -> StorageResult<bool> {
        let lock = self.lock_for(&file.path).await;
        let result = {
            let _guard = lock.lock().await;
            self.compress_locked(file).await
        };
        self.release_lock(&file.path, lock).await;
        result
    }

    async fn compress_locked(&self, file: &DayFile) -> StorageResult<bool> {
        let dir = file.path.parent().unwrap_or(&self.root);
        let target = DayFile::new(dir, file.date, DayForm::Compressed);

        if fs::try_exists(&target.path)
            .await
            .map_err(|e| StorageError::io(&target.path, e))?
        {
            warn!(
                "{} already has a compressed form, dropping the open one",
                file.path.display()
            );
            fs::remove_file(&file.path)
                .await
                .map_err(|e| StorageError::io(&file.path, e))?;
            return Ok(false);
        }

        let json = Self::read_raw(file).await?;
        let compressed = Self::gzip(&target.path, &json)?;
        Self::write_atomic(&target.path, &compressed).await?;

        fs::remove_file(&file.path)
            .await
            .map_err(|e| StorageError::io(&file.path, e))?;

        trace!(
            "compressed {} ({} -> {} bytes)",
            file.path.display(),
            json.len(),
            compressed.len()
        );

        Ok(true)
    }
}

/// Make a rename in the parent directory durable
#[cfg(unix)]
async fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) => fs::File::open(dir).await?.sync_all().await,
        None => Ok(()),
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl TimeSeriesStore for FileStore {
    #[instrument(skip_all, fields(site = %observation.site_name))]
    async fn append(&self, observation: &Observation) -> StorageResult<()> {
        let dir = self.namespace_dir(&observation.site_name)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let date = observation.timestamp.with_timezone(&Local).date_naive();
        let open = DayFile::new(&dir, date, DayForm::Open);
        let compressed = DayFile::new(&dir, date, DayForm::Compressed);

        // both forms share the open path's lock
        let lock = self.lock_for(&open.path).await;
        let _guard = lock.lock().await;

        // a day that was already compressed is rewritten in compressed form
        let file = if fs::try_exists(&compressed.path)
            .await
            .map_err(|e| StorageError::io(&compressed.path, e))?
        {
            compressed
        } else {
            open
        };

        let mut observations = match Self::read_day(&file).await {
            Ok(observations) => observations,
            Err(StorageError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => vec![],
            Err(e) => return Err(e),
        };
        observations.push(observation.clone());

        let json = serde_json::to_vec(&observations)
            .map_err(|e| StorageError::serialization(&file.path, e))?;
        let content = match file.form {
            DayForm::Open => json,
            DayForm::Compressed => Self::gzip(&file.path, &json)?,
        };

        Self::write_atomic(&file.path, &content).await?;

        trace!(
            "appended to {} ({} observations)",
            file.path.display(),
            observations.len()
        );

        Ok(())
    }

    #[instrument(skip(self))]
    async fn history(&self, target: &str, days: u32) -> StorageResult<History> {
        let mut history = BTreeMap::new();
        if days == 0 {
            return Ok(history);
        }

        let dir = self.namespace_dir(target)?;
        let today = self.today();
        let start = today
            .checked_sub_days(Days::new(u64::from(days - 1)))
            .unwrap_or(NaiveDate::MIN);

        let mut by_date: BTreeMap<NaiveDate, DayFile> = BTreeMap::new();
        for file in Self::day_files(&dir).await? {
            if file.date < start || file.date > today {
                continue;
            }

            if by_date.contains_key(&file.date) {
                warn!("{} has both forms, using the compressed one", file.date);
                if file.form == DayForm::Open {
                    continue;
                }
            }
            by_date.insert(file.date, file);
        }

        for (date, file) in by_date {
            match Self::read_day(&file).await {
                Ok(observations) if !observations.is_empty() => {
                    history.insert(date, observations);
                }
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable day log: {e}"),
            }
        }

        trace!("loaded {} days of history", history.len());

        Ok(history)
    }

    async fn compress_older_than(&self, days: u32) -> StorageResult<usize> {
        let today = self.today();
        let mut compressed = 0;

        for dir in self.namespace_dirs().await? {
            let files = match Self::day_files(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("skipping namespace during compression: {e}");
                    continue;
                }
            };

            for file in files {
                if file.form != DayForm::Open || file.age(today) <= i64::from(days) {
                    continue;
                }

                match self.compress_day(&file).await {
                    Ok(true) => compressed += 1,
                    Ok(false) => {}
                    Err(e) => warn!("failed to compress {}: {e}", file.path.display()),
                }
            }
        }

        if compressed > 0 {
            info!("compressed {compressed} day logs older than {days} days");
        }

        Ok(compressed)
    }

    async fn delete_older_than(&self, days: u32) -> StorageResult<usize> {
        let today = self.today();
        let mut deleted = 0;

        for dir in self.namespace_dirs().await? {
            let files = match Self::day_files(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("skipping namespace during retention cleanup: {e}");
                    continue;
                }
            };

            for file in files {
                if file.age(today) <= i64::from(days) {
                    continue;
                }

                let open = DayFile::path_for(&dir, file.date, DayForm::Open);
                let lock = self.lock_for(&open).await;
                let removed = {
                    let _guard = lock.lock().await;
                    fs::remove_file(&file.path).await
                };
                self.release_lock(&open, lock).await;

                match removed {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("failed to delete {}: {e}", file.path.display()),
                }
            }
        }

        if deleted > 0 {
            info!("deleted {deleted} day logs older than {days} days");
        }

        Ok(deleted)
    }

    async fn list_targets(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .namespace_dirs()
            .await?
            .iter()
            .filter_map(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }
}
