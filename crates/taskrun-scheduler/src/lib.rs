//! Cron-driven task passes with cross-process run coordination.
//!
//! # Overview
//!
//! A [`Scheduler`] pass walks the [`TaskRegistry`] in registration order,
//! decides which tasks are due from their cron schedule and recorded run
//! history, and executes each due task at most once. Runs are recorded through
//! a [`RunStore`]; the store's per-task lock guarantees that overlapping passes
//! (other processes, overlapping cron firings) never execute the same task
//! twice at once.
//!
//! # Eligibility, in order
//!
//! | Check            | Outcome                                                  |
//! |------------------|----------------------------------------------------------|
//! | `enabled=false`  | skipped                                                  |
//! | kill switch      | skipped unless the schedule is `always_enabled`          |
//! | a run is RUNNING | skipped                                                  |
//! | retry pending    | due now (retry-on-fail, failure within the retry window) |
//! | retry done       | skipped until the window expires                         |
//! | cron             | due once the next occurrence after the last start passed |
//!
//! # Stores
//!
//! | Store               | Lock primitive                         |
//! |---------------------|----------------------------------------|
//! | [`SqliteRunStore`]  | conditional insert into `task_locks`   |
//! | [`MemoryRunStore`]  | in-process owner map, manual clock     |

pub mod db;
pub mod engine;
pub mod error;
pub mod lock;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod task;
pub mod types;

pub use engine::{Scheduler, TaskOutcome};
pub use error::{ErrorCode, Result, SchedulerError, StoreError};
pub use lock::lock_id_for;
pub use registry::{RegisteredTask, TaskRegistry};
pub use schedule::CronSchedule;
pub use store::{MemoryRunStore, RunStore, SqliteRunStore};
pub use task::{handler_fn, TaskContext, TaskDefinition, TaskHandler};
pub use types::{
    NewTaskRun, PassSummary, RetryPolicy, RunStatus, TaskRun, TaskRunUpdate, TaskSchedule,
};
