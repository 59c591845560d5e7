//! Method instances: an ordered run of actions bound to one thread.

use std::sync::Arc;

use labflow_config::MethodTemplate;
use labflow_types::{ExecutionContext, LabwareThreadStatus, MethodId, MethodStatus, ThreadId};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::action::Action;
use crate::error::{EngineError, Result};
use crate::status::{EntityKind, StatusManager};
use crate::thread::Runner;

/// A method bound to a thread.
///
/// Status only moves forward: `CREATED → IN_PROGRESS → COMPLETED`. The move
/// to `IN_PROGRESS` is what spawn and join handlers react to.
pub struct MethodInstance {
    id: MethodId,
    template: MethodTemplate,
    thread_id: ThreadId,
    context: ExecutionContext,
    status: watch::Sender<MethodStatus>,
    actions: Vec<Arc<Action>>,
    wrapped: RwLock<Option<MethodId>>,
}

impl MethodInstance {
    pub fn new(template: MethodTemplate, thread_id: ThreadId, thread_context: ExecutionContext) -> Self {
        let id = MethodId::new();
        let context = thread_context.with_method(id, &template.name);
        let actions = template
            .actions
            .iter()
            .map(|a| Arc::new(Action::new(a.clone(), context.clone())))
            .collect();
        Self {
            id,
            template,
            thread_id,
            context,
            status: watch::Sender::new(MethodStatus::Created),
            actions,
            wrapped: RwLock::new(None),
        }
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_junction(&self) -> bool {
        self.template.junction
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    pub fn status(&self) -> MethodStatus {
        *self.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<MethodStatus> {
        self.status.subscribe()
    }

    /// The method a join bound to this junction.
    pub fn wrapped(&self) -> Option<MethodId> {
        *self.wrapped.read()
    }

    pub(crate) fn set_wrapped(&self, method: MethodId) {
        self.wrapped.write().get_or_insert(method);
    }

    fn set_status(&self, status: MethodStatus, manager: &StatusManager) {
        let advanced = self.status.send_if_modified(|current| {
            if *current < status {
                *current = status;
                true
            } else {
                false
            }
        });
        if advanced {
            manager.set_status(EntityKind::Method, self.id, status, &self.context);
        }
    }

    pub(crate) async fn run(&self, runner: &Runner<'_>) -> Result<()> {
        if self.status() == MethodStatus::Completed {
            return Ok(());
        }
        tracing::debug!(thread = %runner.thread().name(), method = %self.name(), "method started");
        self.set_status(MethodStatus::InProgress, runner.engine().status());

        if self.template.junction {
            self.run_junction(runner).await?;
        } else {
            for action in &self.actions {
                runner.checkpoint()?;
                action.run(runner).await?;
            }
        }

        self.set_status(MethodStatus::Completed, runner.engine().status());
        tracing::debug!(thread = %runner.thread().name(), method = %self.name(), "method completed");
        Ok(())
    }

    /// Block until a join binds a method here and that method completes.
    async fn run_junction(&self, runner: &Runner<'_>) -> Result<()> {
        runner.set_status(LabwareThreadStatus::AwaitingCoThreads);
        let workflow = runner.workflow()?;
        let thread_name = runner.thread().name().to_string();

        let wrapped_id = runner
            .wait_for(self.name(), || {
                Ok(self.wrapped().or_else(|| workflow.junction(&thread_name, self.name())))
            })
            .await?;
        self.set_wrapped(wrapped_id);

        let registry = runner.engine().registry();
        let wrapped = registry.method(wrapped_id)?;
        let owner = registry.thread(wrapped.thread_id())?;
        tracing::debug!(
            thread = %thread_name,
            junction = %self.name(),
            wrapped = %wrapped.name(),
            owner = %owner.name(),
            "junction bound"
        );

        runner
            .wait_for(wrapped.name(), || {
                if wrapped.status() == MethodStatus::Completed {
                    Ok(Some(()))
                } else if owner.status().is_finished() {
                    Err(EngineError::invalid_state(format!(
                        "joined method '{}' of thread '{}' did not complete",
                        wrapped.name(),
                        owner.name()
                    )))
                } else {
                    Ok(None)
                }
            })
            .await
    }
}

impl std::fmt::Debug for MethodInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodInstance")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}
