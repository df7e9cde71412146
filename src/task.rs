//! Task definitions and the execute-function surface.
//!
//! A [`TaskDef`] tree declares the named processing tasks (and nested
//! sub-tasks) that run against each message individually (process-one) or
//! against the whole batch collectively (process-all). The tree is immutable
//! and shared by reference across every message of the invocation; the
//! mutable runtime state lives in [`crate::tracking`].
//!
//! Execute functions receive an explicit [`TaskHandle`] argument rather than
//! any implicit receiver binding: dispositions are expressed through the
//! returned `Result` (`Ok` succeeds, [`TaskError::Failure`] fails and stays
//! retryable, [`TaskError::Rejection`] is terminal).

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::config::ConsumerContext;
use crate::error::{ConsumerError, ErrorInfo};
use crate::tracking::TaskTrackingInstance;
use crate::types::TaskName;

/// The target a task executes against.
#[derive(Clone)]
pub enum TaskTarget {
    /// One message of the batch (process-one tasks)
    Message(Arc<MessagePayload>),
    /// The whole batch (process-all tasks)
    Batch(Arc<BatchPayload>),
}

impl TaskTarget {
    /// Returns the message payload if this target is a single message.
    pub fn message(&self) -> Option<&Arc<MessagePayload>> {
        match self {
            Self::Message(payload) => Some(payload),
            Self::Batch(_) => None,
        }
    }

    /// Returns the batch payload if this target is the whole batch.
    pub fn batch(&self) -> Option<&Arc<BatchPayload>> {
        match self {
            Self::Batch(payload) => Some(payload),
            Self::Message(_) => None,
        }
    }
}

impl std::fmt::Debug for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(_) => f.write_str("TaskTarget::Message"),
            Self::Batch(b) => write!(f, "TaskTarget::Batch({} messages)", b.messages.len()),
        }
    }
}

/// The immutable content of one message: the raw record it came from and the
/// body extracted from it.
#[derive(Debug, Clone)]
pub struct MessagePayload {
    /// The raw stream record as delivered by the host
    pub record: Value,
    /// The message body produced by the extraction collaborator
    pub body: Value,
}

/// The immutable content of the whole batch, given to process-all tasks.
#[derive(Debug, Clone, Default)]
pub struct BatchPayload {
    /// Payloads of every successfully extracted message, in record order
    pub messages: Vec<Arc<MessagePayload>>,
}

/// Error returned by an execute function to dispose of its attempt.
#[derive(Debug, Clone)]
pub enum TaskError {
    /// The attempt failed; the task remains retryable up to the attempt
    /// limit.
    Failure(ErrorInfo),
    /// The developer asserts this task must not be retried; the owning
    /// message routes to the dead message queue.
    Rejection {
        /// Why the task was rejected
        reason: String,
        /// Optional underlying error details
        error: Option<ErrorInfo>,
        /// When true, the developer has asserted this message can never
        /// succeed; attempt-limit evaluation is skipped entirely.
        permanent: bool,
    },
}

impl TaskError {
    /// Creates a retryable failure.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(ErrorInfo::new("TaskFailure", message))
    }

    /// Creates an explicit rejection.
    pub fn rejection(reason: impl Into<String>, permanent: bool) -> Self {
        Self::Rejection {
            reason: reason.into(),
            error: None,
            permanent,
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failure(info) => write!(f, "task failed: {info}"),
            Self::Rejection { reason, permanent, .. } => {
                write!(f, "task rejected (permanent={permanent}): {reason}")
            }
        }
    }
}

impl std::error::Error for TaskError {}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        Self::Failure(ErrorInfo::new("SerDesError", error.to_string()))
    }
}

/// The future returned by an execute function.
pub type TaskFuture = BoxFuture<'static, Result<Option<Value>, TaskError>>;

/// A caller-supplied execute function.
///
/// Returning `Ok(result)` succeeds the task with `result`; returning a
/// [`TaskError`] records the corresponding disposition.
pub type ExecuteFn = Arc<dyn Fn(TaskTarget, TaskHandle) -> TaskFuture + Send + Sync>;

/// The read-only view of a task's runtime state handed to its execute
/// function.
#[derive(Clone)]
pub struct TaskHandle {
    name: TaskName,
    attempt: u32,
    sub_tasks: BTreeMap<String, TaskTrackingInstance>,
    context: Arc<ConsumerContext>,
}

impl TaskHandle {
    pub(crate) fn new(
        name: TaskName,
        attempt: u32,
        sub_tasks: BTreeMap<String, TaskTrackingInstance>,
        context: Arc<ConsumerContext>,
    ) -> Self {
        Self {
            name,
            attempt,
            sub_tasks,
            context,
        }
    }

    /// The name of the executing task.
    pub fn name(&self) -> &TaskName {
        &self.name
    }

    /// The current attempt number (1 for the first execution against this
    /// target, accumulated across redeliveries).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// A snapshot of the named sub-task's tracking state as of this attempt.
    pub fn sub_task(&self, name: &str) -> Option<&TaskTrackingInstance> {
        self.sub_tasks.get(name)
    }

    /// The invocation context (configuration, source stream).
    pub fn context(&self) -> &Arc<ConsumerContext> {
        &self.context
    }

    /// Convenience constructor for a retryable failure disposition.
    pub fn fail(&self, message: impl Into<String>) -> TaskError {
        TaskError::failure(message)
    }

    /// Convenience constructor for an explicit rejection disposition.
    pub fn reject(&self, reason: impl Into<String>, permanent: bool) -> TaskError {
        TaskError::rejection(reason, permanent)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("attempt", &self.attempt)
            .field("sub_tasks", &self.sub_tasks.len())
            .finish()
    }
}

/// A node of the immutable task definition tree.
pub struct TaskDef {
    name: TaskName,
    execute: ExecuteFn,
    sub_task_defs: Vec<Arc<TaskDef>>,
}

impl TaskDef {
    /// Starts building a task definition with the given name.
    pub fn builder(name: impl Into<TaskName>) -> TaskDefBuilder {
        TaskDefBuilder {
            name: name.into(),
            execute: None,
            sub_task_defs: Vec::new(),
        }
    }

    /// Creates a definition whose execute function does nothing and
    /// succeeds. Mostly useful in tests.
    pub fn noop(name: impl Into<TaskName>) -> Self {
        Self {
            name: name.into(),
            execute: Arc::new(|_, _| Box::pin(async { Ok(None) })),
            sub_task_defs: Vec::new(),
        }
    }

    /// The task's name.
    pub fn name(&self) -> &TaskName {
        &self.name
    }

    /// The task's execute function.
    pub fn execute(&self) -> &ExecuteFn {
        &self.execute
    }

    /// The ordered sub-task definitions.
    pub fn sub_task_defs(&self) -> &[Arc<TaskDef>] {
        &self.sub_task_defs
    }
}

impl std::fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("sub_task_defs", &self.sub_task_defs)
            .finish()
    }
}

/// Builder for [`TaskDef`].
pub struct TaskDefBuilder {
    name: TaskName,
    execute: Option<ExecuteFn>,
    sub_task_defs: Vec<Arc<TaskDef>>,
}

impl TaskDefBuilder {
    /// Sets the execute function from a closure returning a boxed future.
    pub fn execute<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskTarget, TaskHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<Value>, TaskError>> + Send + 'static,
    {
        self.execute = Some(Arc::new(move |target, handle| {
            Box::pin(f(target, handle))
        }));
        self
    }

    /// Appends a sub-task definition; sub-tasks execute in the order they
    /// are declared.
    pub fn sub_task(mut self, def: TaskDef) -> Self {
        self.sub_task_defs.push(Arc::new(def));
        self
    }

    /// Finalizes the definition.
    ///
    /// Fails for an empty name or duplicate sub-task names (a malformed
    /// tree is an orchestration-level defect, detected before any record is
    /// processed).
    pub fn build(self) -> Result<TaskDef, ConsumerError> {
        if self.name.is_empty() {
            return Err(ConsumerError::task_definition("task name cannot be empty"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for sub in &self.sub_task_defs {
            if !seen.insert(sub.name().as_str().to_string()) {
                return Err(ConsumerError::task_definition(format!(
                    "duplicate sub-task name '{}' under task '{}'",
                    sub.name(),
                    self.name
                )));
            }
        }
        Ok(TaskDef {
            name: self.name,
            execute: self
                .execute
                .unwrap_or_else(|| Arc::new(|_, _| Box::pin(async { Ok(None) }))),
            sub_task_defs: self.sub_task_defs,
        })
    }
}

/// Validates that a set of same-level task definitions carries no duplicate
/// names.
pub(crate) fn validate_unique_names(defs: &[Arc<TaskDef>]) -> Result<(), ConsumerError> {
    let mut seen = std::collections::BTreeSet::new();
    for def in defs {
        if !seen.insert(def.name().as_str().to_string()) {
            return Err(ConsumerError::task_definition(format!(
                "duplicate task name '{}'",
                def.name()
            )));
        }
    }
    Ok(())
}
