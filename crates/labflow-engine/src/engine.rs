//! The engine: owns the lab, the coordination services and the registry.

use std::sync::{Arc, Weak};

use labflow_config::{EngineConfig, LabConfig, ThreadTemplate};
use labflow_types::{LabwareThreadStatus, ThreadId, WorkflowId, WorkflowStatus};

use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::handlers::{JoinHandler, SpawnHandler};
use crate::lab::{DriverFactory, Lab};
use crate::manager::{RunReport, ThreadManager};
use crate::registry::Registry;
use crate::reservation::ReservationManager;
use crate::router::Router;
use crate::status::{EntityKind, StatusManager};
use crate::thread::LabwareThread;
use crate::workflow::WorkflowInstance;

struct EngineInner {
    lab: Arc<Lab>,
    catalog: LabConfig,
    settings: EngineConfig,
    bus: Arc<EventBus>,
    status: StatusManager,
    reservations: Arc<ReservationManager>,
    router: Router,
    registry: Registry,
}

/// Cheaply cloneable handle to one engine.
///
/// There is no global state: every bus, cache and registry belongs to the
/// engine that created it.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Non-owning engine handle held by threads and event handlers.
#[derive(Clone, Default)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// Wrap an already built lab. The lab should be initialized.
    pub fn new(lab: Arc<Lab>, catalog: LabConfig, settings: EngineConfig) -> Self {
        let bus = Arc::new(EventBus::new(settings.event_feed_capacity));
        let status = StatusManager::new(Arc::clone(&bus));
        let reservations = ReservationManager::new(lab.resource_names());
        let router = Router::new(Arc::clone(&lab));
        Self {
            inner: Arc::new(EngineInner {
                lab,
                catalog,
                settings,
                bus,
                status,
                reservations,
                router,
                registry: Registry::new(),
            }),
        }
    }

    /// Validate the catalog, build the lab through `factory` and initialize it.
    pub async fn from_config(
        catalog: LabConfig,
        factory: &dyn DriverFactory,
        settings: EngineConfig,
    ) -> Result<Self> {
        catalog.validate()?;
        let lab = Lab::from_config(&catalog, factory)?;
        lab.initialize().await?;
        Ok(Self::new(Arc::new(lab), catalog, settings))
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn lab(&self) -> &Arc<Lab> {
        &self.inner.lab
    }

    pub fn catalog(&self) -> &LabConfig {
        &self.inner.catalog
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.inner.settings
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn status(&self) -> &StatusManager {
        &self.inner.status
    }

    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.inner.reservations
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Instantiate a workflow: wire its spawns and joins, create every
    /// thread that is not a spawn target, and mark it `RUNNING`.
    ///
    /// Threads are launched by [`ThreadManager::run_until_complete`].
    pub fn start_workflow(&self, name: &str) -> Result<Arc<WorkflowInstance>> {
        let template = self
            .catalog()
            .workflow(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow template", name))?;
        let workflow = Arc::new(WorkflowInstance::new(template));
        self.registry().insert_workflow(Arc::clone(&workflow));

        for rule in &workflow.template().spawns {
            let handler = Arc::new(SpawnHandler::new(
                workflow.id(),
                rule.clone(),
                self.downgrade(),
            ));
            workflow.add_subscription(handler.attach(self.bus()));
        }
        for rule in &workflow.template().joins {
            let handler = Arc::new(JoinHandler::new(
                workflow.id(),
                rule.clone(),
                self.downgrade(),
            ));
            workflow.add_subscription(handler.attach(self.bus()));
        }

        for template in workflow.initial_threads() {
            self.create_thread(&workflow, template.clone())?;
        }

        self.set_workflow_status(&workflow, WorkflowStatus::Running);
        tracing::info!(workflow = %workflow.name(), id = %workflow.id(), "workflow started");
        Ok(workflow)
    }

    /// Create and register one more thread of a running workflow.
    pub fn spawn_thread(&self, workflow: WorkflowId, template: &str) -> Result<Arc<LabwareThread>> {
        let workflow = self.registry().workflow(workflow)?;
        let template = workflow
            .template()
            .thread(template)
            .cloned()
            .ok_or_else(|| EngineError::not_found("thread template", template))?;
        self.create_thread(&workflow, template)
    }

    fn create_thread(
        &self,
        workflow: &WorkflowInstance,
        template: ThreadTemplate,
    ) -> Result<Arc<LabwareThread>> {
        let thread = Arc::new(LabwareThread::new(
            self.downgrade(),
            workflow,
            template,
            self.catalog(),
        )?);
        self.registry().insert_thread(Arc::clone(&thread));
        thread.set_status(LabwareThreadStatus::Created, self.status());
        tracing::debug!(thread = %thread.name(), workflow = %workflow.name(), "thread created");
        Ok(thread)
    }

    /// Start a workflow and drive it until every thread has finished.
    pub async fn run_workflow(&self, name: &str) -> Result<RunReport> {
        let workflow = self.start_workflow(name)?;
        ThreadManager::new(self.clone())
            .run_until_complete(&workflow)
            .await
    }

    /// Ask one thread to stop at its next checkpoint.
    pub fn stop_thread(&self, id: ThreadId) -> Result<()> {
        self.registry().thread(id)?.stop();
        Ok(())
    }

    /// Ask every thread of a workflow to stop.
    pub fn stop_workflow(&self, id: WorkflowId) -> Result<()> {
        self.registry().workflow(id)?;
        for thread in self.registry().threads_in(id) {
            thread.stop();
        }
        Ok(())
    }

    pub(crate) fn set_workflow_status(&self, workflow: &WorkflowInstance, status: WorkflowStatus) {
        workflow.set_status(status);
        self.status()
            .set_status(EntityKind::Workflow, workflow.id(), status, &workflow.context());
    }

    /// Drop the workflow's event subscriptions and record its final status.
    pub(crate) fn finish_workflow(&self, workflow: &WorkflowInstance, status: WorkflowStatus) {
        for id in workflow.take_subscriptions() {
            self.bus().unsubscribe(id);
        }
        self.set_workflow_status(workflow, status);
        tracing::info!(workflow = %workflow.name(), status = %status, "workflow finished");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("lab", &self.inner.lab)
            .field("registry", &self.inner.registry)
            .finish()
    }
}
