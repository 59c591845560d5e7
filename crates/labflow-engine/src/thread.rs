//! Labware threads: one labware item's path through its methods.
//!
//! A thread runs as one task. Its labware is introduced at the start
//! location, each method runs in order, and the labware is moved to the end
//! location if the template names one. Every claim goes through the
//! reservation manager; whatever the thread still holds when it ends is
//! released, whether it completed, stopped or failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use labflow_config::{LabConfig, ThreadTemplate};
use labflow_types::{ExecutionContext, Labware, LabwareThreadStatus, ThreadId, WorkflowId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::engine::{Engine, WeakEngine};
use crate::equipment::TransporterEquipment;
use crate::error::{EngineError, Result};
use crate::location::Location;
use crate::method::MethodInstance;
use crate::reservation::{ReservationOutcome, ReservationRequest};
use crate::router::RouteStep;
use crate::status::{EntityKind, StatusManager};
use crate::workflow::WorkflowInstance;

/// Where a thread's labware currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum LabwarePosition {
    Location(String),
    Transporter(String),
}

impl std::fmt::Display for LabwarePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabwarePosition::Location(name) => f.write_str(name),
            LabwarePosition::Transporter(name) => write!(f, "on {name}"),
        }
    }
}

/// A running instance of a thread template.
pub struct LabwareThread {
    id: ThreadId,
    template: ThreadTemplate,
    workflow_id: WorkflowId,
    workflow_name: String,
    labware: Labware,
    methods: Vec<Arc<MethodInstance>>,
    engine: WeakEngine,
    status: RwLock<LabwareThreadStatus>,
    position: Mutex<Option<LabwarePosition>>,
    held: Mutex<HashMap<String, Arc<ReservationRequest>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    error: Mutex<Option<EngineError>>,
}

impl LabwareThread {
    /// Instantiate `template`: a fresh labware item and one method
    /// instance per method name.
    pub(crate) fn new(
        engine: WeakEngine,
        workflow: &WorkflowInstance,
        template: ThreadTemplate,
        catalog: &LabConfig,
    ) -> Result<Self> {
        let id = ThreadId::new();
        let labware_template = catalog
            .labware(&template.labware)
            .ok_or_else(|| EngineError::not_found("labware template", &template.labware))?;
        let mut labware = Labware::new(
            format!("{}.{}", template.name, labware_template.name),
            &labware_template.labware_type,
        );
        if let Some(barcode) = &labware_template.barcode {
            labware = labware.with_barcode(barcode);
        }

        let context = workflow.context().with_thread(id, &template.name);
        let methods = template
            .methods
            .iter()
            .map(|name| {
                catalog
                    .method(name)
                    .map(|m| Arc::new(MethodInstance::new(m.clone(), id, context.clone())))
                    .ok_or_else(|| EngineError::not_found("method template", name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            template,
            workflow_id: workflow.id(),
            workflow_name: workflow.name().to_string(),
            labware,
            methods,
            engine,
            status: RwLock::new(LabwareThreadStatus::Uncreated),
            position: Mutex::new(None),
            held: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &ThreadTemplate {
        &self.template
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn labware(&self) -> &Labware {
        &self.labware
    }

    pub fn methods(&self) -> &[Arc<MethodInstance>] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodInstance>> {
        self.methods.iter().find(|m| m.name() == name)
    }

    pub fn status(&self) -> LabwareThreadStatus {
        *self.status.read()
    }

    pub fn position(&self) -> Option<LabwarePosition> {
        self.position.lock().clone()
    }

    /// The error that ended the thread, if it failed.
    pub fn error(&self) -> Option<EngineError> {
        self.error.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Resources this thread holds, sorted by name.
    pub fn held_resources(&self) -> Vec<String> {
        let mut held: Vec<String> = self.held.lock().keys().cloned().collect();
        held.sort();
        held
    }

    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::for_workflow(self.workflow_id, &self.workflow_name)
            .with_thread(self.id, self.name())
    }

    /// Claim the right to launch this thread. True exactly once.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn set_status(&self, status: LabwareThreadStatus, manager: &StatusManager) {
        *self.status.write() = status;
        manager.set_status(EntityKind::Thread, self.id, status, &self.context());
    }

    /// Ask the thread to stop at its next checkpoint.
    ///
    /// In-flight device operations finish first. A thread that never
    /// started settles at once, through `STOPPING` to `STOPPED` like any
    /// other stop.
    pub fn stop(&self) {
        self.cancel.cancel();
        if self.mark_started() {
            if let Some(engine) = self.engine.upgrade() {
                self.set_status(LabwareThreadStatus::Stopping, engine.status());
                self.set_status(LabwareThreadStatus::Stopped, engine.status());
            } else {
                *self.status.write() = LabwareThreadStatus::Stopped;
            }
            tracing::info!(thread = %self.name(), "thread stopped before start");
        }
    }

    /// Run to completion, stop or failure. The final status is always set.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let Some(engine) = self.engine.upgrade() else {
            return Err(EngineError::Stopped);
        };
        tracing::info!(
            thread = %self.name(),
            workflow = %self.workflow_name,
            labware = %self.labware.name,
            "thread started"
        );

        let runner = Runner::new(engine.clone(), self.as_ref());
        let result = runner.execute().await;

        match &result {
            Ok(()) => {
                self.set_status(LabwareThreadStatus::Completed, engine.status());
                tracing::info!(thread = %self.name(), "thread completed");
            }
            Err(EngineError::Stopped) => {
                self.set_status(LabwareThreadStatus::Stopping, engine.status());
                self.set_status(LabwareThreadStatus::Stopped, engine.status());
                tracing::info!(thread = %self.name(), "thread stopped");
            }
            Err(err) => {
                *self.error.lock() = Some(err.clone());
                self.set_status(LabwareThreadStatus::Errored, engine.status());
                tracing::error!(thread = %self.name(), error = %err, "thread failed");
            }
        }

        self.release_all(&engine);
        result
    }

    /// End a thread whose task died without finishing `run`.
    ///
    /// The status becomes `ERRORED` unless a final status was already set.
    /// Everything the thread holds or waits on is given back either way.
    pub(crate) fn fail(&self, err: EngineError, engine: &Engine) {
        if !self.status().is_finished() {
            tracing::error!(thread = %self.name(), error = %err, "thread task aborted");
            *self.error.lock() = Some(err);
            self.set_status(LabwareThreadStatus::Errored, engine.status());
        }
        self.release_all(engine);
    }

    fn release_all(&self, engine: &Engine) {
        self.held.lock().clear();
        engine.reservations().cancel_owner(self.id);
    }
}

impl std::fmt::Debug for LabwareThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabwareThread")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .field("position", &self.position())
            .finish()
    }
}

/// Execution state for one running thread. Methods and actions drive the
/// thread through it.
pub(crate) struct Runner<'a> {
    engine: Engine,
    thread: &'a LabwareThread,
}

impl<'a> Runner<'a> {
    pub(crate) fn new(engine: Engine, thread: &'a LabwareThread) -> Self {
        Self { engine, thread }
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn thread(&self) -> &LabwareThread {
        self.thread
    }

    pub(crate) fn set_status(&self, status: LabwareThreadStatus) {
        self.thread.set_status(status, self.engine.status());
    }

    /// Fail with `Stopped` if a stop was requested.
    pub(crate) fn checkpoint(&self) -> Result<()> {
        if self.thread.cancel.is_cancelled() {
            self.set_status(LabwareThreadStatus::Stopping);
            return Err(EngineError::Stopped);
        }
        Ok(())
    }

    pub(crate) fn position(&self) -> Option<LabwarePosition> {
        self.thread.position()
    }

    fn set_position(&self, position: LabwarePosition) {
        *self.thread.position.lock() = Some(position);
    }

    pub(crate) fn is_at(&self, location: &str) -> bool {
        matches!(self.position(), Some(LabwarePosition::Location(ref l)) if l == location)
    }

    pub(crate) fn holds(&self, resource: &str) -> bool {
        self.thread.held.lock().contains_key(resource)
    }

    /// True if the labware can get to `location` from where it is.
    pub(crate) fn can_reach(&self, location: &str) -> bool {
        match self.position() {
            Some(LabwarePosition::Location(current)) => {
                current == location || self.engine.router().route(&current, location).is_ok()
            }
            Some(LabwarePosition::Transporter(name)) => self
                .engine
                .lab()
                .transporter(&name)
                .is_ok_and(|t| t.is_taught(location)),
            None => false,
        }
    }

    /// Acquire `resource`, waiting in its queue. No-op if already held.
    pub(crate) async fn claim(&self, resource: &str) -> Result<()> {
        if self.holds(resource) {
            return Ok(());
        }
        let reservations = self.engine.reservations();
        let request = reservations.request(resource, self.thread.id, Some(self.thread.labware.id));
        reservations.submit(&request)?;

        let outcome = tokio::select! {
            outcome = request.wait() => outcome,
            _ = self.thread.cancel.cancelled() => return Err(EngineError::Stopped),
        };
        match outcome {
            ReservationOutcome::Granted => {
                self.thread
                    .held
                    .lock()
                    .insert(resource.to_string(), request);
                Ok(())
            }
            ReservationOutcome::Rejected => {
                tracing::warn!(thread = %self.thread.name(), resource = %resource, "claim rejected");
                Err(EngineError::ReservationRejected {
                    resource: resource.to_string(),
                })
            }
            ReservationOutcome::Deadlocked => {
                tracing::warn!(thread = %self.thread.name(), resource = %resource, "claim deadlocked");
                Err(EngineError::Deadlocked {
                    resource: resource.to_string(),
                })
            }
        }
    }

    /// Give back a held resource. No-op if not held.
    pub(crate) fn release(&self, resource: &str) -> Result<()> {
        let request = self.thread.held.lock().remove(resource);
        if let Some(request) = request {
            request.release()?;
        }
        Ok(())
    }

    /// Move the labware to `target`, hop by hop along the planned route.
    ///
    /// `action`, when given, is marked `MOVING` while labware is in motion.
    pub(crate) async fn move_to(&self, target: &str, action: Option<&Action>) -> Result<()> {
        let position = self.position().ok_or_else(|| {
            EngineError::invalid_state(format!(
                "labware of thread '{}' has not been introduced",
                self.thread.name()
            ))
        })?;
        match position {
            LabwarePosition::Location(current) if current == target => Ok(()),
            LabwarePosition::Location(current) => {
                let route = self.engine.router().route(&current, target)?;
                tracing::debug!(thread = %self.thread.name(), route = %route, "moving labware");
                for step in &route.steps {
                    self.hop(step, action).await?;
                }
                Ok(())
            }
            LabwarePosition::Transporter(name) => self.unload(&name, target, action).await,
        }
    }

    async fn hop(&self, step: &RouteStep, action: Option<&Action>) -> Result<()> {
        self.checkpoint()?;
        let lab = self.engine.lab();
        let source = Arc::clone(lab.location(&step.source)?);
        let target = Arc::clone(lab.location(&step.target)?);
        let transporter = Arc::clone(lab.transporter(&step.transporter)?);

        self.set_status(LabwareThreadStatus::AwaitingMoveReservation);
        self.claim(&step.target).await?;
        self.claim(&step.transporter).await?;

        self.set_status(LabwareThreadStatus::AwaitingMoveTargetAvailability);
        self.wait_until_available(&target).await?;

        self.set_status(LabwareThreadStatus::Moving);
        if let Some(action) = action {
            action.mark(labflow_types::ActionStatus::Moving, self.engine.status());
        }
        self.pick_from(&transporter, &source).await?;
        self.place_onto(&transporter, &target).await?;

        self.release(&step.source)?;
        self.release(&step.transporter)?;
        Ok(())
    }

    /// Put labware held by `transporter_name` down at `target`.
    async fn unload(
        &self,
        transporter_name: &str,
        target: &str,
        action: Option<&Action>,
    ) -> Result<()> {
        self.checkpoint()?;
        let lab = self.engine.lab();
        let transporter = Arc::clone(lab.transporter(transporter_name)?);
        let location = Arc::clone(lab.location(target)?);

        self.set_status(LabwareThreadStatus::AwaitingMoveReservation);
        self.claim(target).await?;
        self.claim(transporter_name).await?;

        self.set_status(LabwareThreadStatus::AwaitingMoveTargetAvailability);
        self.wait_until_available(&location).await?;

        self.set_status(LabwareThreadStatus::Moving);
        if let Some(action) = action {
            action.mark(labflow_types::ActionStatus::Moving, self.engine.status());
        }
        self.place_onto(&transporter, &location).await?;
        self.release(transporter_name)?;
        Ok(())
    }

    pub(crate) async fn pick_from(
        &self,
        transporter: &TransporterEquipment,
        location: &Location,
    ) -> Result<()> {
        let placeable = self.engine.lab().placeable_at(location.name());
        transporter
            .pick(location, self.thread.labware.id, placeable.as_ref())
            .await?;
        self.set_position(LabwarePosition::Transporter(transporter.name().to_string()));
        Ok(())
    }

    pub(crate) async fn place_onto(
        &self,
        transporter: &TransporterEquipment,
        location: &Location,
    ) -> Result<()> {
        let placeable = self.engine.lab().placeable_at(location.name());
        transporter.place(location, placeable.as_ref()).await?;
        self.set_position(LabwarePosition::Location(location.name().to_string()));
        Ok(())
    }

    /// Wait until `location` is empty.
    ///
    /// Fails with `TargetOccupied` when the occupant belongs to a thread that
    /// has finished (or to no known thread), since it will never move.
    async fn wait_until_available(&self, location: &Location) -> Result<()> {
        let mut occupancy = location.watch();
        let poll = self.engine.settings().availability_poll();
        loop {
            let occupant = occupancy.borrow_and_update().clone();
            let Some(occupant) = occupant else {
                return Ok(());
            };
            if occupant.id == self.thread.labware.id {
                return Ok(());
            }
            let owner_active = self
                .engine
                .registry()
                .labware_owner(occupant.id)
                .is_ok_and(|owner| !owner.status().is_finished());
            if !owner_active {
                return Err(EngineError::TargetOccupied {
                    location: location.name().to_string(),
                    labware: occupant.name,
                });
            }
            tokio::select! {
                _ = self.thread.cancel.cancelled() => return Err(EngineError::Stopped),
                _ = occupancy.changed() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Poll `check` until it yields a value.
    ///
    /// Gives up with `NotFound` once every other thread of the workflow has
    /// finished, since nothing could change the answer after that.
    pub(crate) async fn wait_for<T>(
        &self,
        what: &str,
        mut check: impl FnMut() -> Result<Option<T>>,
    ) -> Result<T> {
        let poll = self.engine.settings().availability_poll();
        loop {
            if let Some(value) = check()? {
                return Ok(value);
            }
            if self.others_finished() {
                return Err(EngineError::not_found("workflow dependency", what));
            }
            tokio::select! {
                _ = self.thread.cancel.cancelled() => return Err(EngineError::Stopped),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    fn others_finished(&self) -> bool {
        self.engine
            .registry()
            .threads_in(self.thread.workflow_id)
            .iter()
            .filter(|t| t.id() != self.thread.id)
            .all(|t| t.status().is_finished())
    }

    /// Wait for the named thread of this workflow to complete.
    pub(crate) async fn wait_for_thread(&self, name: &str) -> Result<()> {
        let registry = self.engine.registry();
        let workflow = self.thread.workflow_id;
        self.wait_for(name, || match registry.thread_by_name(Some(workflow), name) {
            Ok(thread) => match thread.status() {
                LabwareThreadStatus::Completed => Ok(Some(())),
                status if status.is_finished() => Err(EngineError::invalid_state(format!(
                    "co-thread '{name}' ended {status}"
                ))),
                _ => Ok(None),
            },
            Err(EngineError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        })
        .await
    }

    pub(crate) fn workflow(&self) -> Result<Arc<WorkflowInstance>> {
        self.engine.registry().workflow(self.thread.workflow_id)
    }

    async fn introduce_labware(&self) -> Result<()> {
        let start = Arc::clone(self.engine.lab().location(&self.thread.template.start)?);
        self.set_status(LabwareThreadStatus::AwaitingMoveReservation);
        self.claim(start.name()).await?;
        self.set_status(LabwareThreadStatus::AwaitingMoveTargetAvailability);
        self.wait_until_available(&start).await?;
        start.put(self.thread.labware.clone())?;
        self.set_position(LabwarePosition::Location(start.name().to_string()));
        tracing::debug!(
            thread = %self.thread.name(),
            location = %start.name(),
            "labware introduced"
        );
        Ok(())
    }

    async fn execute(&self) -> Result<()> {
        self.checkpoint()?;
        self.introduce_labware().await?;
        for method in &self.thread.methods {
            self.checkpoint()?;
            method.run(self).await?;
        }
        if let Some(end) = &self.thread.template.end {
            self.checkpoint()?;
            self.move_to(end, None).await?;
        }
        if let Some(LabwarePosition::Transporter(name)) = self.position() {
            tracing::warn!(
                thread = %self.thread.name(),
                transporter = %name,
                "thread finished with labware still on a transporter"
            );
        }
        Ok(())
    }
}
