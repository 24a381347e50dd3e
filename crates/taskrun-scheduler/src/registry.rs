use std::collections::HashMap;

use tracing::debug;

use crate::{
    error::{Result, SchedulerError},
    lock::lock_id_for,
    schedule::CronSchedule,
    task::{TaskDefinition, MAX_TIMEOUT_MINUTES},
    types::RetryPolicy,
};

/// A validated task with its parsed schedule and derived lock id.
#[derive(Debug, Clone)]
pub struct RegisteredTask {
    pub definition: TaskDefinition,
    pub cron: CronSchedule,
    pub lock_id: i64,
}

impl RegisteredTask {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Immutable, ordered set of tasks built once at startup.
///
/// Construction validates every definition and fails on the first defect, so
/// a bad cron expression stops the process instead of silently never firing.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Vec<RegisteredTask>,
    index: HashMap<String, usize>,
}

impl TaskRegistry {
    pub fn new(definitions: Vec<TaskDefinition>) -> Result<Self> {
        let mut tasks = Vec::with_capacity(definitions.len());
        let mut index = HashMap::with_capacity(definitions.len());

        for definition in definitions {
            validate(&definition)?;
            if index.contains_key(&definition.name) {
                return Err(SchedulerError::InvalidTaskDefinition {
                    task: definition.name,
                    reason: "registered more than once".to_string(),
                });
            }

            let cron = CronSchedule::from_task_schedule(&definition.schedule).map_err(|reason| {
                SchedulerError::InvalidSchedule {
                    task: definition.name.clone(),
                    reason,
                }
            })?;
            let lock_id = lock_id_for(&definition.name);
            debug!(task = %definition.name, lock_id, cron = %cron.expression(), "task registered");

            index.insert(definition.name.clone(), tasks.len());
            tasks.push(RegisteredTask {
                definition,
                cron,
                lock_id,
            });
        }

        Ok(Self { tasks, index })
    }

    /// Tasks in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTask> {
        self.tasks.iter()
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredTask> {
        self.index
            .get(name)
            .map(|&i| &self.tasks[i])
            .ok_or_else(|| SchedulerError::TaskNotFound {
                name: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn validate(def: &TaskDefinition) -> Result<()> {
    let invalid = |reason: String| SchedulerError::InvalidTaskDefinition {
        task: def.name.clone(),
        reason,
    };

    if def.name.trim().is_empty() {
        return Err(invalid("task name must not be empty".to_string()));
    }
    if !(1..=MAX_TIMEOUT_MINUTES).contains(&def.timeout_minutes) {
        return Err(invalid(format!(
            "timeout must be 1-{MAX_TIMEOUT_MINUTES} minutes, got {}",
            def.timeout_minutes
        )));
    }
    if def.max_retries.is_some() && def.retry_policy == RetryPolicy::Ignore {
        return Err(invalid("max_retries requires the retry-on-fail policy".to_string()));
    }
    Ok(())
}
