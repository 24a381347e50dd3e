use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{RetryPolicy, TaskSchedule};

/// Upper bound for [`TaskDefinition::timeout_minutes`].
pub const MAX_TIMEOUT_MINUTES: u8 = taskrun_core::config::MAX_TASK_TIMEOUT_MINUTES;

/// Handed to a handler for one execution attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_name: String,
    /// ID of the `RUNNING` record created for this attempt.
    pub run_id: String,
    /// Set when this attempt fills a retry slot.
    pub retry_of_run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Span the handler runs under (`task_run{task, run_id}`).
    pub span: tracing::Span,
}

/// Business logic behind a task.
///
/// Returns a human-readable summary on success. The scheduler never assumes a
/// handler is idempotent; `retry-on-fail` calls it again from scratch.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<String>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<String> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A named unit of background work and the rules for when to run it.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub schedule: TaskSchedule,
    /// Hard limit the scheduler waits for the handler, 1–9 minutes.
    pub timeout_minutes: u8,
    pub retry_policy: RetryPolicy,
    /// Cap on consecutive retries under `retry-on-fail`; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl TaskDefinition {
    pub fn new(
        name: impl Into<String>,
        schedule: TaskSchedule,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            schedule,
            timeout_minutes: 1,
            retry_policy: RetryPolicy::Ignore,
            max_retries: None,
        }
    }

    pub fn timeout_minutes(mut self, minutes: u8) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("timeout_minutes", &self.timeout_minutes)
            .field("retry_policy", &self.retry_policy)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
