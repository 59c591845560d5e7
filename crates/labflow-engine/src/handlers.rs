//! Spawn and join: workflow topology driven by method status events.
//!
//! Both handlers listen on `method.IN_PROGRESS`, ignore events from other
//! workflows, threads or methods, and disarm after their first match.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use labflow_config::{JoinTemplate, SpawnTemplate};
use labflow_types::{ExecutionContext, WorkflowId};

use crate::engine::WeakEngine;
use crate::events::{EventBus, SubscriptionId};

/// Event the handlers subscribe to.
pub const METHOD_IN_PROGRESS: &str = "method.IN_PROGRESS";

/// Starts a new thread the first time a parent method reaches `IN_PROGRESS`.
pub struct SpawnHandler {
    workflow: WorkflowId,
    rule: SpawnTemplate,
    fired: AtomicBool,
    engine: WeakEngine,
}

impl SpawnHandler {
    pub fn new(workflow: WorkflowId, rule: SpawnTemplate, engine: WeakEngine) -> Self {
        Self {
            workflow,
            rule,
            fired: AtomicBool::new(false),
            engine,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// React to one event. Returns true if this call spawned the thread.
    pub fn handle(&self, context: &ExecutionContext) -> bool {
        if context.workflow_id != Some(self.workflow)
            || !context.matches(&self.rule.thread, &self.rule.method)
        {
            return false;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!(spawn = %self.rule.spawn, "spawn already fired");
            return false;
        }
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        match engine.spawn_thread(self.workflow, &self.rule.spawn) {
            Ok(thread) => {
                tracing::info!(
                    parent = %self.rule.thread,
                    method = %self.rule.method,
                    spawned = %thread.name(),
                    "thread spawned"
                );
                true
            }
            Err(err) => {
                tracing::error!(spawn = %self.rule.spawn, error = %err, "spawn failed");
                false
            }
        }
    }

    pub fn attach(self: Arc<Self>, bus: &EventBus) -> SubscriptionId {
        bus.subscribe(METHOD_IN_PROGRESS, move |_, context| {
            self.handle(context);
        })
    }
}

/// Binds a thread's method to another thread's junction the first time the
/// method reaches `IN_PROGRESS`.
pub struct JoinHandler {
    workflow: WorkflowId,
    rule: JoinTemplate,
    fired: AtomicBool,
    engine: WeakEngine,
}

impl JoinHandler {
    pub fn new(workflow: WorkflowId, rule: JoinTemplate, engine: WeakEngine) -> Self {
        Self {
            workflow,
            rule,
            fired: AtomicBool::new(false),
            engine,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn handle(&self, context: &ExecutionContext) -> bool {
        if context.workflow_id != Some(self.workflow)
            || !context.matches(&self.rule.thread, &self.rule.method)
        {
            return false;
        }
        let Some(method_id) = context.method_id else {
            return false;
        };
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        let registry = engine.registry();
        let workflow = match registry.workflow(self.workflow) {
            Ok(workflow) => workflow,
            Err(err) => {
                tracing::error!(error = %err, "join failed");
                return false;
            }
        };

        workflow.bind_junction(&self.rule.attach_thread, &self.rule.junction, method_id);
        // The attaching thread may not exist yet; the junction reads the
        // workflow binding when it runs.
        if let Ok(thread) = registry.thread_by_name(Some(self.workflow), &self.rule.attach_thread)
            && let Some(junction) = thread.method(&self.rule.junction)
        {
            junction.set_wrapped(method_id);
        }
        tracing::info!(
            thread = %self.rule.thread,
            method = %self.rule.method,
            attach = %self.rule.attach_thread,
            junction = %self.rule.junction,
            "join bound"
        );
        true
    }

    pub fn attach(self: Arc<Self>, bus: &EventBus) -> SubscriptionId {
        bus.subscribe(METHOD_IN_PROGRESS, move |_, context| {
            self.handle(context);
        })
    }
}
