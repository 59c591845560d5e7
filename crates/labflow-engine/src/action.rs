//! Actions: one pool-bound operation, resolved to equipment at run time.
//!
//! Forward path: `CREATED → RESOLVED → AWAITING_LOCATION_RESERVATION →
//! AWAITING_CO_THREADS → PERFORMING_ACTION → [AWAITING_MOVE_RESERVATION →
//! MOVING →] COMPLETED`. The move leg only runs for actions with an output
//! location. Any error moves the action to `ERRORED` and is returned as is.

use std::sync::Arc;

use labflow_config::ActionTemplate;
use labflow_types::{ActionId, ActionStatus, ExecutionContext, LabwareThreadStatus};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::status::{EntityKind, StatusManager};
use crate::thread::{LabwarePosition, Runner};

const PICK: &str = "pick";
const PLACE: &str = "place";

/// The pool member and location an action was bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub equipment: String,
    pub location: Option<String>,
}

pub struct Action {
    id: ActionId,
    template: ActionTemplate,
    context: ExecutionContext,
    status: RwLock<ActionStatus>,
    resolution: RwLock<Option<Resolution>>,
    output: Mutex<Option<serde_json::Value>>,
}

impl Action {
    pub fn new(template: ActionTemplate, method_context: ExecutionContext) -> Self {
        Self {
            id: ActionId::new(),
            template,
            context: method_context,
            status: RwLock::new(ActionStatus::Created),
            resolution: RwLock::new(None),
            output: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &ActionTemplate {
        &self.template
    }

    pub fn status(&self) -> ActionStatus {
        *self.status.read()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution.read().clone()
    }

    /// What the device returned, for commands that return something.
    pub fn output(&self) -> Option<serde_json::Value> {
        self.output.lock().clone()
    }

    pub(crate) fn mark(&self, status: ActionStatus, manager: &StatusManager) {
        *self.status.write() = status;
        let context = self
            .context
            .clone()
            .with_action(self.id, self.name(), status);
        manager.set_status(EntityKind::Action, self.id, status, &context);
    }

    /// Execute once. A completed action is a no-op; an errored one fails.
    pub(crate) async fn run(&self, runner: &Runner<'_>) -> Result<()> {
        match self.status() {
            ActionStatus::Completed => return Ok(()),
            ActionStatus::Errored => {
                return Err(EngineError::invalid_state(format!(
                    "action '{}' already errored",
                    self.name()
                )));
            }
            _ => {}
        }

        let manager = runner.engine().status();
        match self.perform(runner).await {
            Ok(()) => {
                self.mark(ActionStatus::Completed, manager);
                Ok(())
            }
            Err(err) => {
                self.mark(ActionStatus::Errored, manager);
                if !err.is_stop() {
                    tracing::error!(
                        thread = %runner.thread().name(),
                        action = %self.name(),
                        error = %err,
                        "action failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn perform(&self, runner: &Runner<'_>) -> Result<()> {
        let manager = runner.engine().status();
        let lab = runner.engine().lab();
        let command = self.template.command.as_str();

        let resolution = self.resolve(runner)?;
        *self.resolution.write() = Some(resolution.clone());
        self.mark(ActionStatus::Resolved, manager);
        tracing::debug!(
            action = %self.name(),
            equipment = %resolution.equipment,
            location = ?resolution.location,
            "action resolved"
        );

        self.mark(ActionStatus::AwaitingLocationReservation, manager);
        runner.set_status(LabwareThreadStatus::AwaitingActionReservation);
        match (command, resolution.location.as_deref()) {
            (PLACE, Some(location)) => runner.claim(location).await?,
            (_, Some(location)) => runner.move_to(location, None).await?,
            (_, None) => {}
        }

        self.mark(ActionStatus::AwaitingCoThreads, manager);
        if !self.template.co_threads.is_empty() {
            runner.set_status(LabwareThreadStatus::AwaitingCoThreads);
            for name in &self.template.co_threads {
                runner.wait_for_thread(name).await?;
            }
        }

        runner.checkpoint()?;
        self.mark(ActionStatus::PerformingAction, manager);
        runner.set_status(LabwareThreadStatus::PerformingAction);
        match command {
            PICK | PLACE => {
                let location_name = resolution.location.as_deref().ok_or_else(|| {
                    EngineError::invalid_state(format!("'{}' needs a location", self.name()))
                })?;
                let location = Arc::clone(lab.location(location_name)?);
                let transporter = Arc::clone(lab.transporter(&resolution.equipment)?);
                if command == PICK {
                    runner.claim(&resolution.equipment).await?;
                    runner.pick_from(&transporter, &location).await?;
                    runner.release(location_name)?;
                } else {
                    runner.place_onto(&transporter, &location).await?;
                    runner.release(&resolution.equipment)?;
                }
            }
            _ => {
                let equipment = Arc::clone(lab.equipment(&resolution.equipment)?);
                runner.claim(&resolution.equipment).await?;
                let result = equipment
                    .execute(command, &self.template.options)
                    .await;
                runner.release(&resolution.equipment)?;
                *self.output.lock() = Some(result?);
            }
        }

        if let Some(output) = &self.template.output {
            self.mark(ActionStatus::AwaitingMoveReservation, manager);
            runner.move_to(output, Some(self)).await?;
        }
        Ok(())
    }

    /// Bind the pool to one member.
    ///
    /// Members that are not initialized or cannot be reached are skipped.
    /// Among the rest, prefer the member whose location already holds the
    /// labware, then one nobody holds or waits on, then declaration order.
    fn resolve(&self, runner: &Runner<'_>) -> Result<Resolution> {
        let lab = runner.engine().lab();
        let reservations = runner.engine().reservations();
        let pool = lab.pool(&self.template.pool)?;
        let command = self.template.command.as_str();
        let position = runner.position();

        let mut best: Option<(u8, Resolution)> = None;
        for member in pool.members() {
            let Ok(equipment) = lab.equipment(member) else {
                continue;
            };
            if !equipment.is_initialized() {
                tracing::debug!(pool = %pool.name(), member = %member, "skipping uninitialized member");
                continue;
            }

            let location = match command {
                PICK | PLACE => self.template.location.clone(),
                _ => self
                    .template
                    .location
                    .clone()
                    .or_else(|| equipment.locations().first().cloned()),
            };

            let reachable = match (command, location.as_deref()) {
                (PICK, Some(l)) => {
                    lab.transporter(member).is_ok_and(|t| t.is_taught(l)) && runner.can_reach(l)
                }
                (PLACE, Some(l)) => {
                    position == Some(LabwarePosition::Transporter(member.clone()))
                        && lab.transporter(member).is_ok_and(|t| t.is_taught(l))
                }
                (PICK | PLACE, None) => false,
                (_, Some(l)) => runner.can_reach(l),
                (_, None) => true,
            };
            if !reachable {
                tracing::debug!(pool = %pool.name(), member = %member, "skipping unreachable member");
                continue;
            }

            let rank = match location.as_deref() {
                Some(l) if runner.is_at(l) => 0,
                _ if reservations.is_idle(member)
                    && location
                        .as_deref()
                        .is_none_or(|l| reservations.is_idle(l) || runner.holds(l)) =>
                {
                    1
                }
                _ => 2,
            };
            if best.as_ref().is_none_or(|(r, _)| rank < *r) {
                best = Some((
                    rank,
                    Resolution {
                        equipment: member.clone(),
                        location,
                    },
                ));
            }
        }

        best.map(|(_, r)| r).ok_or_else(|| EngineError::NoAvailableMember {
            pool: pool.name().to_string(),
        })
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::testing::MockDriverFactory;
    use labflow_config::{EngineConfig, LabConfig};

    fn lab(reader_options: &str) -> String {
        format!(
            r#"
[[locations]]
name = "bench"

[[equipment]]
name = "reader"
driver = "mock.device"
options = {reader_options}

[[pools]]
name = "readers"
members = ["reader"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "read"

[[methods.actions]]
name = "read"
pool = "readers"
command = "read"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "t1"
labware = "plate"
start = "bench"
methods = ["read"]
"#
        )
    }

    async fn engine(toml: &str) -> (Engine, MockDriverFactory) {
        let factory = MockDriverFactory::new();
        let catalog = LabConfig::from_toml(toml).unwrap();
        let engine = Engine::from_config(catalog, &factory, EngineConfig::default())
            .await
            .unwrap();
        (engine, factory)
    }

    #[tokio::test]
    async fn test_completed_action_reruns_as_noop() {
        let (engine, factory) = engine(&lab("{}")).await;
        let workflow = engine.start_workflow("wf").unwrap();
        let thread = engine
            .registry()
            .thread_by_name(Some(workflow.id()), "t1")
            .unwrap();
        let action = Arc::clone(&thread.methods()[0].actions()[0]);
        let runner = Runner::new(engine.clone(), thread.as_ref());

        action.run(&runner).await.unwrap();
        assert_eq!(action.status(), ActionStatus::Completed);
        assert_eq!(action.output().unwrap()["command"], "read");

        action.run(&runner).await.unwrap();
        assert_eq!(action.status(), ActionStatus::Completed);
        let reader = factory.device("reader").unwrap();
        assert_eq!(reader.calls(), vec!["execute:read"]);
        assert!(engine.reservations().held_by(thread.id()).is_empty());
    }

    #[tokio::test]
    async fn test_errored_action_refuses_to_rerun() {
        let (engine, factory) = engine(&lab(r#"{ fail_on = "read" }"#)).await;
        let workflow = engine.start_workflow("wf").unwrap();
        let thread = engine
            .registry()
            .thread_by_name(Some(workflow.id()), "t1")
            .unwrap();
        let action = Arc::clone(&thread.methods()[0].actions()[0]);
        let runner = Runner::new(engine.clone(), thread.as_ref());

        let first = action.run(&runner).await.unwrap_err();
        assert!(matches!(first, EngineError::Device(_)));
        assert_eq!(action.status(), ActionStatus::Errored);

        let second = action.run(&runner).await.unwrap_err();
        assert!(matches!(second, EngineError::InvalidState(_)), "{second:?}");
        assert_eq!(action.status(), ActionStatus::Errored);
        let reader = factory.device("reader").unwrap();
        assert_eq!(reader.calls(), vec!["execute:read"]);
    }
}
