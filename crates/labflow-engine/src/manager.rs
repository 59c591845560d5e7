//! The poll loop that launches threads and waits for them to finish.

use std::sync::Arc;
use std::time::Duration;

use labflow_types::{LabwareThreadStatus, ThreadId, WorkflowId, WorkflowStatus};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::thread::LabwareThread;
use crate::workflow::WorkflowInstance;

/// Final state of one thread.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadReport {
    pub id: ThreadId,
    pub name: String,
    pub labware: String,
    pub status: LabwareThreadStatus,
    pub position: Option<String>,
    pub error: Option<String>,
}

/// Outcome of a workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workflow: String,
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub threads: Vec<ThreadReport>,
}

impl RunReport {
    pub fn has_errors(&self) -> bool {
        self.threads
            .iter()
            .any(|t| t.status == LabwareThreadStatus::Errored)
    }

    pub fn thread(&self, name: &str) -> Option<&ThreadReport> {
        self.threads.iter().find(|t| t.name == name)
    }
}

/// Drives the threads of one workflow.
///
/// Each pass launches every registered thread that has not been started as
/// its own task, then sleeps for the poll interval. Threads spawned mid-run
/// are picked up on the next pass. The loop ends once every thread is
/// completed, stopped or errored. A thread whose task panics is marked
/// errored rather than left hanging.
pub struct ThreadManager {
    engine: Engine,
    poll_interval: Duration,
}

impl ThreadManager {
    pub fn new(engine: Engine) -> Self {
        let poll_interval = engine.settings().poll_interval();
        Self {
            engine,
            poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Collect finished tasks. A task that panicked leaves its thread
    /// mid-flight, so the thread is failed here and its claims released.
    async fn reap(&self, tasks: Vec<(Arc<LabwareThread>, JoinHandle<Result<()>>)>) {
        for (thread, task) in tasks {
            if let Err(err) = task.await {
                tracing::error!(thread = %thread.name(), error = %err, "thread task panicked");
                thread.fail(
                    EngineError::invalid_state(format!("thread task panicked: {err}")),
                    &self.engine,
                );
            }
        }
    }

    pub async fn run_until_complete(&self, workflow: &Arc<WorkflowInstance>) -> Result<RunReport> {
        let registry = self.engine.registry();
        let mut tasks: Vec<(Arc<LabwareThread>, JoinHandle<Result<()>>)> = Vec::new();

        loop {
            let threads = registry.threads_in(workflow.id());
            for thread in &threads {
                if thread.mark_started() {
                    tracing::debug!(thread = %thread.name(), "launching thread");
                    tasks.push((Arc::clone(thread), tokio::spawn(Arc::clone(thread).run())));
                }
            }
            let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut tasks)
                .into_iter()
                .partition(|(_, task)| task.is_finished());
            tasks = pending;
            self.reap(done).await;

            if threads.iter().all(|t| t.status().is_finished()) {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        self.reap(tasks).await;

        let threads = registry.threads_in(workflow.id());
        let status = if threads.iter().any(|t| t.status() == LabwareThreadStatus::Errored) {
            WorkflowStatus::Errored
        } else if threads.iter().any(|t| t.status() == LabwareThreadStatus::Stopped) {
            WorkflowStatus::Stopped
        } else {
            WorkflowStatus::Completed
        };
        self.engine.finish_workflow(workflow, status);

        Ok(RunReport {
            workflow: workflow.name().to_string(),
            workflow_id: workflow.id(),
            status,
            threads: threads
                .iter()
                .map(|t| ThreadReport {
                    id: t.id(),
                    name: t.name().to_string(),
                    labware: t.labware().name.clone(),
                    status: t.status(),
                    position: t.position().map(|p| p.to_string()),
                    error: t.error().map(|e| e.to_string()),
                })
                .collect(),
        })
    }
}
