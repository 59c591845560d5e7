//! Workflow instances: thread templates plus spawn/join wiring.

use std::collections::HashMap;

use labflow_config::WorkflowTemplate;
use labflow_types::{ExecutionContext, MethodId, WorkflowId, WorkflowStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::events::SubscriptionId;

/// (attach thread name, junction method name) -> wrapped method.
pub type JunctionBindings = HashMap<(String, String), MethodId>;

/// One run of a workflow template.
pub struct WorkflowInstance {
    id: WorkflowId,
    template: WorkflowTemplate,
    status: RwLock<WorkflowStatus>,
    junctions: watch::Sender<JunctionBindings>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl WorkflowInstance {
    pub fn new(template: WorkflowTemplate) -> Self {
        Self {
            id: WorkflowId::new(),
            template,
            status: RwLock::new(WorkflowStatus::Created),
            junctions: watch::Sender::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: WorkflowStatus) {
        *self.status.write() = status;
    }

    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::for_workflow(self.id, self.name())
    }

    /// Thread templates started with the workflow: all but spawn targets.
    pub fn initial_threads(&self) -> impl Iterator<Item = &labflow_config::ThreadTemplate> {
        self.template
            .threads
            .iter()
            .filter(|t| !self.template.is_spawned(&t.name))
    }

    /// Bind `method` as the wrapped method of a junction. First binding wins.
    pub fn bind_junction(&self, thread: &str, junction: &str, method: MethodId) -> bool {
        let key = (thread.to_string(), junction.to_string());
        self.junctions.send_if_modified(|bindings| {
            if bindings.contains_key(&key) {
                return false;
            }
            bindings.insert(key, method);
            true
        })
    }

    pub fn junction(&self, thread: &str, junction: &str) -> Option<MethodId> {
        self.junctions
            .borrow()
            .get(&(thread.to_string(), junction.to_string()))
            .copied()
    }

    pub fn watch_junctions(&self) -> watch::Receiver<JunctionBindings> {
        self.junctions.subscribe()
    }

    pub(crate) fn add_subscription(&self, id: SubscriptionId) {
        self.subscriptions.lock().push(id);
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<SubscriptionId> {
        std::mem::take(&mut *self.subscriptions.lock())
    }
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labflow_config::{SpawnTemplate, ThreadTemplate};

    fn thread(name: &str) -> ThreadTemplate {
        ThreadTemplate {
            name: name.into(),
            labware: "plate".into(),
            start: "hotel".into(),
            end: None,
            methods: vec!["m".into()],
        }
    }

    #[test]
    fn test_spawn_targets_not_initial() {
        let wf = WorkflowInstance::new(WorkflowTemplate {
            name: "wf".into(),
            threads: vec![thread("parent"), thread("child")],
            spawns: vec![SpawnTemplate {
                thread: "parent".into(),
                method: "m".into(),
                spawn: "child".into(),
            }],
            joins: vec![],
        });
        let names: Vec<_> = wf.initial_threads().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["parent"]);
        assert_eq!(wf.status(), WorkflowStatus::Created);
    }

    #[test]
    fn test_first_junction_binding_wins() {
        let wf = WorkflowInstance::new(WorkflowTemplate {
            name: "wf".into(),
            threads: vec![],
            spawns: vec![],
            joins: vec![],
        });
        let first = MethodId::new();
        assert!(wf.bind_junction("sample", "await_lid", first));
        assert!(!wf.bind_junction("sample", "await_lid", MethodId::new()));
        assert_eq!(wf.junction("sample", "await_lid"), Some(first));
        assert_eq!(wf.junction("sample", "other"), None);
    }
}
