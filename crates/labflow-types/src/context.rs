//! Layered execution context delivered with every bus event.

use serde::{Deserialize, Serialize};

use crate::ids::{ActionId, MethodId, ThreadId, WorkflowId};
use crate::status::ActionStatus;

/// Where an event originated: workflow → thread → method → action.
///
/// Outer layers are always filled before inner ones; a method-level event
/// carries workflow and thread fields but no action fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workflow_id: Option<WorkflowId>,
    pub workflow_name: Option<String>,
    pub thread_id: Option<ThreadId>,
    pub thread_name: Option<String>,
    pub method_id: Option<MethodId>,
    pub method_name: Option<String>,
    pub action_id: Option<ActionId>,
    pub action_status: Option<ActionStatus>,
    pub action_name: Option<String>,
}

impl ExecutionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a workflow-level context.
    pub fn for_workflow(id: WorkflowId, name: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(id),
            workflow_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Add the thread layer.
    pub fn with_thread(mut self, id: ThreadId, name: impl Into<String>) -> Self {
        self.thread_id = Some(id);
        self.thread_name = Some(name.into());
        self
    }

    /// Add the method layer.
    pub fn with_method(mut self, id: MethodId, name: impl Into<String>) -> Self {
        self.method_id = Some(id);
        self.method_name = Some(name.into());
        self
    }

    /// Add the action layer.
    pub fn with_action(
        mut self,
        id: ActionId,
        name: impl Into<String>,
        status: ActionStatus,
    ) -> Self {
        self.action_id = Some(id);
        self.action_name = Some(name.into());
        self.action_status = Some(status);
        self
    }

    /// True if this context names the given thread and method.
    pub fn matches(&self, thread_name: &str, method_name: &str) -> bool {
        self.thread_name.as_deref() == Some(thread_name)
            && self.method_name.as_deref() == Some(method_name)
    }
}
