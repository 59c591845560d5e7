//! Arena of live workflow, thread and method instances keyed by id.
//!
//! Templates only ever name each other; everything that needs a live
//! instance resolves it here.

use std::collections::HashMap;
use std::sync::Arc;

use labflow_types::{LabwareId, MethodId, ThreadId, WorkflowId};
use parking_lot::RwLock;

use crate::error::{EngineError, Result};
use crate::method::MethodInstance;
use crate::thread::LabwareThread;
use crate::workflow::WorkflowInstance;

#[derive(Default)]
struct Inner {
    workflows: HashMap<WorkflowId, Arc<WorkflowInstance>>,
    threads: HashMap<ThreadId, Arc<LabwareThread>>,
    thread_order: Vec<ThreadId>,
    methods: HashMap<MethodId, Arc<MethodInstance>>,
    labware: HashMap<LabwareId, ThreadId>,
}

/// In-memory registry of running entities.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_workflow(&self, workflow: Arc<WorkflowInstance>) {
        self.inner.write().workflows.insert(workflow.id(), workflow);
    }

    /// Register a thread together with its labware and methods.
    pub fn insert_thread(&self, thread: Arc<LabwareThread>) {
        let mut inner = self.inner.write();
        for method in thread.methods() {
            inner.methods.insert(method.id(), Arc::clone(method));
        }
        inner.labware.insert(thread.labware().id, thread.id());
        inner.thread_order.push(thread.id());
        inner.threads.insert(thread.id(), thread);
    }

    pub fn workflow(&self, id: WorkflowId) -> Result<Arc<WorkflowInstance>> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow", id))
    }

    pub fn workflow_by_name(&self, name: &str) -> Result<Arc<WorkflowInstance>> {
        let inner = self.inner.read();
        let matches: Vec<_> = inner
            .workflows
            .values()
            .filter(|w| w.name() == name)
            .collect();
        unique("workflow", name, matches).cloned()
    }

    pub fn thread(&self, id: ThreadId) -> Result<Arc<LabwareThread>> {
        self.inner
            .read()
            .threads
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("thread", id))
    }

    /// Find a thread by name, optionally within one workflow.
    pub fn thread_by_name(
        &self,
        workflow: Option<WorkflowId>,
        name: &str,
    ) -> Result<Arc<LabwareThread>> {
        let inner = self.inner.read();
        let matches: Vec<_> = inner
            .thread_order
            .iter()
            .filter_map(|id| inner.threads.get(id))
            .filter(|t| t.name() == name && workflow.is_none_or(|w| t.workflow_id() == w))
            .collect();
        unique("thread", name, matches).cloned()
    }

    /// Threads of one workflow in creation order.
    pub fn threads_in(&self, workflow: WorkflowId) -> Vec<Arc<LabwareThread>> {
        let inner = self.inner.read();
        inner
            .thread_order
            .iter()
            .filter_map(|id| inner.threads.get(id))
            .filter(|t| t.workflow_id() == workflow)
            .cloned()
            .collect()
    }

    pub fn method(&self, id: MethodId) -> Result<Arc<MethodInstance>> {
        self.inner
            .read()
            .methods
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("method", id))
    }

    /// Thread that owns `labware`.
    pub fn labware_owner(&self, labware: LabwareId) -> Result<Arc<LabwareThread>> {
        let inner = self.inner.read();
        inner
            .labware
            .get(&labware)
            .and_then(|id| inner.threads.get(id))
            .cloned()
            .ok_or_else(|| EngineError::not_found("labware", labware))
    }

    pub fn thread_count(&self) -> usize {
        self.inner.read().threads.len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("workflows", &inner.workflows.len())
            .field("threads", &inner.threads.len())
            .field("methods", &inner.methods.len())
            .finish()
    }
}

fn unique<T>(kind: &'static str, name: &str, mut matches: Vec<T>) -> Result<T> {
    match matches.len() {
        0 => Err(EngineError::not_found(kind, name)),
        1 => Ok(matches.remove(0)),
        count => Err(EngineError::Ambiguous {
            kind,
            name: name.to_string(),
            count,
        }),
    }
}
