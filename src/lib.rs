pub mod anomaly;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod notify;
pub mod observation;
pub mod probe;
pub mod storage;
pub mod target;

pub use anomaly::{Anomaly, AnomalyKind, Detector, Severity};
pub use coordinator::{Coordinator, RunOutcome, RunState, RunSummary};
pub use observation::{Observation, ProbeErrorCode};
pub use target::Target;
