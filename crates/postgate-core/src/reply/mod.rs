//! Reply pipeline: delayed, exactly-once generation of auto-replies.
//!
//! A reply job moves `SCHEDULED -> RUNNING -> {DONE, FAILED}`, or exits
//! early via `SCHEDULED -> CANCELLED`. The SCHEDULED -> RUNNING edge is a
//! compare-and-set on the job store, so a job is handed out at most once
//! no matter how many dispatchers scan concurrently.
//!
//! # Modules
//!
//! - [`scheduler`]: enqueue, cancel, claim, recover, replay
//! - [`executor`]: re-validate, generate, gate, persist
//! - [`dispatcher`]: timer loop draining due jobs through a worker pool

pub mod dispatcher;
pub mod executor;
pub mod scheduler;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use executor::{clean_reply, ExecutionOutcome, ReplyExecutor, SkipReason};
pub use scheduler::{RecoveryReport, ReplyScheduler, INTERRUPTED_REASON};
