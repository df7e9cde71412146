//! Task tracking state for messages and batches.
//!
//! Tracking is the single source of truth for "is this message done". Every
//! message owns one tracking root for its process-one tasks and one for its
//! process-all participation; the batch owns one more for the batch-level
//! process-all run. Tracking is the only persisted state in the system: it is
//! embedded in resubmitted message bodies so that attempt counts accumulate
//! across redeliveries instead of restarting.
//!
//! ## State machine
//!
//! ```text
//! Unstarted --> Started --> Succeeded | Failed | Rejected
//!                  |
//!                  +--(frozen mid-flight)--> Failed
//! Failed ----(attempt limit sweep)--------> Discarded
//! any -------(definition removed)---------> Abandoned
//! ```
//!
//! `Succeeded`, `Rejected`, `Discarded` and `Abandoned` are terminal.
//! `Started` must never survive a freeze.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConsumerError, ErrorInfo};
use crate::task::TaskDef;

/// The runtime state of one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// The task has not been attempted against this target yet
    Unstarted,
    /// The task is currently executing; only observed mid-execution
    Started,
    /// The task's own execute function completed successfully
    Succeeded,
    /// The last attempt failed; the task is retryable
    Failed,
    /// The task was explicitly rejected by the execute function
    Rejected,
    /// The task exhausted its attempt limit and was dead-lettered locally
    Discarded,
    /// The task definition was removed since the last attempt
    Abandoned,
}

impl TaskState {
    /// Returns true if this state can never progress further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Rejected | Self::Discarded | Self::Abandoned
        )
    }

    /// Returns true if this state counts towards rejecting the owning
    /// message (dead message queue routing).
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected | Self::Discarded | Self::Abandoned)
    }

    /// Returns true if this state still has a local retry path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unstarted | Self::Failed)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Unstarted
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unstarted => "Unstarted",
            Self::Started => "Started",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Rejected => "Rejected",
            Self::Discarded => "Discarded",
            Self::Abandoned => "Abandoned",
        };
        write!(f, "{s}")
    }
}

/// Per (target, task-definition-node) tracking record.
///
/// The serialized form, `{state, attempts, lastError?, subTasks?}`, is the
/// persisted layout embedded in resubmitted message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTrackingInstance {
    /// Current state of this task instance
    #[serde(default)]
    pub state: TaskState,
    /// Number of execution attempts, including ones that errored
    #[serde(default)]
    pub attempts: u32,
    /// Error details from the most recent failed or rejected attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
    /// Tracking for this task's sub-tasks, keyed by sub-task name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_tasks: BTreeMap<String, TaskTrackingInstance>,
}

impl Default for TaskTrackingInstance {
    fn default() -> Self {
        Self {
            state: TaskState::Unstarted,
            attempts: 0,
            last_error: None,
            sub_tasks: BTreeMap::new(),
        }
    }
}

impl TaskTrackingInstance {
    /// Returns true if this task and every sub-task succeeded.
    pub fn is_fully_complete(&self) -> bool {
        self.state == TaskState::Succeeded
            && self.sub_tasks.values().all(|sub| sub.is_fully_complete())
    }

    /// Returns true if this task or any descendant was rejected, discarded
    /// or abandoned.
    pub fn has_rejection(&self) -> bool {
        self.state.is_rejection() || self.sub_tasks.values().any(|sub| sub.has_rejection())
    }

    /// Visits every instance in this subtree whose state is still retryable.
    fn for_each_retryable(&mut self, f: &mut impl FnMut(&mut TaskTrackingInstance)) {
        if self.state.is_retryable() {
            f(self);
        }
        for sub in self.sub_tasks.values_mut() {
            sub.for_each_retryable(f);
        }
    }

    /// Collects the attempt counts of every retryable instance in this
    /// subtree.
    fn retryable_attempts(&self, out: &mut Vec<u32>) {
        if self.state.is_retryable() {
            out.push(self.attempts);
        }
        for sub in self.sub_tasks.values() {
            sub.retryable_attempts(out);
        }
    }

    /// Marks this instance and all of its descendants as abandoned.
    ///
    /// Unconditional, regardless of prior state: an orphaned name means the
    /// code that tracked it is gone, so even a succeeded record of it is no
    /// longer interpretable and the owning message must surface to the dead
    /// message queue rather than silently complete.
    fn abandon(&mut self) {
        self.state = TaskState::Abandoned;
        self.last_error = Some(ErrorInfo::new(
            "AbandonedTaskError",
            "task definition no longer exists; its state can never progress",
        ));
        for sub in self.sub_tasks.values_mut() {
            sub.abandon();
        }
    }

    fn freeze_in_place(&mut self) {
        if self.state == TaskState::Started {
            self.state = TaskState::Failed;
            self.last_error = Some(ErrorInfo::frozen_while_running());
        }
        for sub in self.sub_tasks.values_mut() {
            sub.freeze_in_place();
        }
    }

    /// Applies a settled batch-level task outcome onto this per-message
    /// instance.
    ///
    /// Terminal per-message state is preserved: a message that already
    /// succeeded its participation in a collective task is not re-opened by
    /// a later batch run. Attempt counts accumulate.
    pub(crate) fn apply_batch_outcome(&mut self, batch_inst: &TaskTrackingInstance) {
        if !self.state.is_terminal() {
            self.state = batch_inst.state;
            self.attempts += batch_inst.attempts;
            self.last_error = batch_inst.last_error.clone();
        }
        for (name, batch_sub) in &batch_inst.sub_tasks {
            self.sub_tasks
                .entry(name.clone())
                .or_default()
                .apply_batch_outcome(batch_sub);
        }
    }
}

/// The persisted tracking attribute embedded in a resubmitted message body:
/// both task views, keyed by task name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedState {
    /// Process-one task tracking
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ones: BTreeMap<String, TaskTrackingInstance>,
    /// Process-all task tracking
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alls: BTreeMap<String, TaskTrackingInstance>,
}

/// A root tracking store for one target (message or batch) and one task
/// view.
///
/// Owned exclusively by its target. Freezing makes every instance immutable;
/// any later mutation attempt is a reportable defect, not a silent no-op.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskTracking {
    tasks: BTreeMap<String, TaskTrackingInstance>,
    frozen: bool,
}

impl TaskTracking {
    /// Initializes tracking for the given definitions, merging any tracking
    /// carried over from a prior delivery.
    ///
    /// Definitions not previously seen start `Unstarted`; previously seen
    /// tasks keep their state and attempt counts (merging twice with the
    /// same definitions leaves attempts unchanged). Tracked names that no
    /// longer appear in the definition tree are marked `Abandoned` so the
    /// message is not retried indefinitely for work that can never progress.
    pub fn init_or_merge(
        prior: Option<&BTreeMap<String, TaskTrackingInstance>>,
        defs: &[std::sync::Arc<TaskDef>],
    ) -> Self {
        let mut tasks = BTreeMap::new();
        let empty = BTreeMap::new();
        let prior = prior.unwrap_or(&empty);

        for def in defs {
            let merged = Self::merge_node(prior.get(def.name().as_str()), def);
            tasks.insert(def.name().to_string(), merged);
        }

        // Orphans: tracked tasks the current code no longer defines.
        for (name, instance) in prior {
            if !defs.iter().any(|d| d.name().as_str() == name.as_str()) {
                let mut orphan = instance.clone();
                orphan.abandon();
                tasks.insert(name.clone(), orphan);
            }
        }

        Self {
            tasks,
            frozen: false,
        }
    }

    fn merge_node(prior: Option<&TaskTrackingInstance>, def: &TaskDef) -> TaskTrackingInstance {
        let mut merged = prior.cloned().unwrap_or_default();
        // A Started state in persisted data means a prior invocation died
        // mid-attempt without freezing; treat it as a failed attempt.
        if merged.state == TaskState::Started {
            merged.state = TaskState::Failed;
            merged.last_error = Some(ErrorInfo::frozen_while_running());
        }

        let prior_subs = std::mem::take(&mut merged.sub_tasks);
        for sub_def in def.sub_task_defs() {
            let sub = Self::merge_node(prior_subs.get(sub_def.name().as_str()), sub_def);
            merged.sub_tasks.insert(sub_def.name().to_string(), sub);
        }
        for (name, sub_prior) in prior_subs {
            if !merged.sub_tasks.contains_key(&name) {
                let mut orphan = sub_prior;
                orphan.abandon();
                merged.sub_tasks.insert(name, orphan);
            }
        }
        merged
    }

    /// Returns true if this tracking has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Fails loudly if this tracking has been frozen.
    pub fn ensure_mutable(&self, what: &str) -> Result<(), ConsumerError> {
        if self.frozen {
            tracing::error!(what, "attempted to mutate frozen task tracking");
            return Err(ConsumerError::frozen_state(format!(
                "attempted to mutate frozen task tracking while {what}"
            )));
        }
        Ok(())
    }

    /// Freezes all tracking: lingering `Started` instances become `Failed`
    /// with a synthetic "frozen while running" error, and every instance
    /// becomes immutable.
    pub fn freeze(&mut self) {
        for instance in self.tasks.values_mut() {
            instance.freeze_in_place();
        }
        self.frozen = true;
    }

    /// Looks up the instance at `path` (a sequence of task names from the
    /// root).
    pub fn instance(&self, path: &[String]) -> Option<&TaskTrackingInstance> {
        let (first, rest) = path.split_first()?;
        let mut current = self.tasks.get(first)?;
        for name in rest {
            current = current.sub_tasks.get(name)?;
        }
        Some(current)
    }

    /// Mutable variant of [`TaskTracking::instance`].
    pub fn instance_mut(&mut self, path: &[String]) -> Option<&mut TaskTrackingInstance> {
        let (first, rest) = path.split_first()?;
        let mut current = self.tasks.get_mut(first)?;
        for name in rest {
            current = current.sub_tasks.get_mut(name)?;
        }
        Some(current)
    }

    /// Returns the root task instances.
    pub fn tasks(&self) -> &BTreeMap<String, TaskTrackingInstance> {
        &self.tasks
    }

    /// Clones the root task instances (the persistable snapshot).
    pub fn snapshot(&self) -> BTreeMap<String, TaskTrackingInstance> {
        self.tasks.clone()
    }

    /// Replaces the root instances wholesale; used by tests and fan-out.
    pub(crate) fn tasks_mut(&mut self) -> &mut BTreeMap<String, TaskTrackingInstance> {
        &mut self.tasks
    }

    /// Returns true if every tracked task (and sub-task) succeeded.
    ///
    /// Vacuously true for an empty tracking root.
    pub fn all_complete(&self) -> bool {
        self.tasks.values().all(|t| t.is_fully_complete())
    }

    /// Returns true if any tracked task (or sub-task) was rejected,
    /// discarded or abandoned.
    pub fn any_rejection(&self) -> bool {
        self.tasks.values().any(|t| t.has_rejection())
    }

    /// Collects the attempt counts of every still-retryable instance.
    pub fn retryable_attempts(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for instance in self.tasks.values() {
            instance.retryable_attempts(&mut out);
        }
        out
    }

    /// Transitions every retryable instance that has reached `max_attempts`
    /// to `Discarded`.
    pub fn discard_exhausted(&mut self, max_attempts: u32) {
        for instance in self.tasks.values_mut() {
            instance.for_each_retryable(&mut |inst| {
                if inst.attempts >= max_attempts {
                    inst.state = TaskState::Discarded;
                }
            });
        }
    }
}

/// A tracking root shared between its owning target and any in-flight task
/// executions.
///
/// The lock is only ever held for synchronous bookkeeping, never across an
/// await; the executor releases it before invoking a user execute function.
pub type SharedTracking = std::sync::Arc<std::sync::Mutex<TaskTracking>>;

/// Creates a fresh shared tracking root.
pub fn shared(tracking: TaskTracking) -> SharedTracking {
    std::sync::Arc::new(std::sync::Mutex::new(tracking))
}

/// Locks a shared tracking root, converting poisoning into an orchestration
/// defect.
pub fn lock(
    tracking: &SharedTracking,
) -> Result<std::sync::MutexGuard<'_, TaskTracking>, ConsumerError> {
    tracking
        .lock()
        .map_err(|_| ConsumerError::internal("task tracking lock poisoned"))
}

/// The final partition a message lands in after finalization.
///
/// Exactly one of these holds for every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDisposition {
    /// All tasks succeeded; the message is dropped as done
    Complete,
    /// At least one retryable task remains; the message is resubmitted
    Incomplete,
    /// At least one task was rejected, discarded or abandoned; the message
    /// is routed to the dead message queue
    Rejected,
}

impl std::fmt::Display for MessageDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Classifies a message from its two tracking views.
///
/// Rejection anywhere wins; otherwise the message is complete only if both
/// views are fully complete.
pub fn classify(process_one: &TaskTracking, process_all: &TaskTracking) -> MessageDisposition {
    if process_one.any_rejection() || process_all.any_rejection() {
        MessageDisposition::Rejected
    } else if process_one.all_complete() && process_all.all_complete() {
        MessageDisposition::Complete
    } else {
        MessageDisposition::Incomplete
    }
}
