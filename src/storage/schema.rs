//! On-disk layout of the time-series store
//!
//! ```text
//! <root>/
//!   <namespace>/            one directory per canonical target name
//!     2024-05-01.json.gz    compressed day log
//!     2024-05-02.json       open day log (JSON array of observations)
//! ```
//!
//! Both forms decode to the same JSON array; a day is never stored in both.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

/// Extension of an open day log
pub const OPEN_EXTENSION: &str = "json";

/// Extension of a compressed day log
pub const COMPRESSED_EXTENSION: &str = "json.gz";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Representation a day log is stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayForm {
    Open,
    Compressed,
}

impl DayForm {
    fn extension(self) -> &'static str {
        match self {
            DayForm::Open => OPEN_EXTENSION,
            DayForm::Compressed => COMPRESSED_EXTENSION,
        }
    }
}

/// One day log file of a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayFile {
    pub date: NaiveDate,
    pub form: DayForm,
    pub path: PathBuf,
}

impl DayFile {
    /// Path of the day log for `date` in `form` inside `namespace_dir`
    pub fn path_for(namespace_dir: &Path, date: NaiveDate, form: DayForm) -> PathBuf {
        namespace_dir.join(format!("{}.{}", date.format(DATE_FORMAT), form.extension()))
    }

    pub fn new(namespace_dir: &Path, date: NaiveDate, form: DayForm) -> Self {
        Self {
            date,
            form,
            path: Self::path_for(namespace_dir, date, form),
        }
    }

    /// Recognize a day log by its file name, ignoring anything else
    /// (temp files, stray files)
    pub fn parse(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;

        let (stem, form) = if let Some(stem) = file_name.strip_suffix(".json.gz") {
            (stem, DayForm::Compressed)
        } else if let Some(stem) = file_name.strip_suffix(".json") {
            (stem, DayForm::Open)
        } else {
            return None;
        };

        let date = NaiveDate::parse_from_str(stem, DATE_FORMAT).ok()?;

        Some(Self {
            date,
            form,
            path: path.to_path_buf(),
        })
    }

    /// Age of this day relative to `today` in whole days
    pub fn age(&self, today: NaiveDate) -> i64 {
        (today - self.date).num_days()
    }
}

/// Sibling path used while atomically rewriting `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}
