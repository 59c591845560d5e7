//! Arbitration of exclusive claims on locations and transporters.
//!
//! Every claim is a [`ReservationRequest`]. Submitting never blocks; the
//! caller awaits [`ReservationRequest::wait`] to learn whether the claim was
//! granted, rejected, or chosen as a deadlock victim. Each resource has one
//! holder and a FIFO queue of waiters.
//!
//! After every change the manager builds the wait-for graph (waiting owner →
//! owner holding the resource it waits on) and breaks each cycle by marking
//! the most recently submitted pending request in it as deadlocked.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use labflow_types::{LabwareId, ThreadId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{EngineError, Result};

/// Terminal outcome of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationOutcome {
    Granted,
    Rejected,
    Deadlocked,
}

/// Observable request state. `processed` is set together with the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestState {
    pub outcome: Option<ReservationOutcome>,
    pub processed: bool,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A claim on one resource by one thread.
pub struct ReservationRequest {
    id: u64,
    resource: String,
    owner: ThreadId,
    labware: Option<LabwareId>,
    seq: AtomicU64,
    state: watch::Sender<RequestState>,
    release: Mutex<Option<ReleaseFn>>,
    manager: Weak<ReservationManager>,
}

impl ReservationRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn labware(&self) -> Option<LabwareId> {
        self.labware
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    pub fn outcome(&self) -> Option<ReservationOutcome> {
        self.state.borrow().outcome
    }

    pub fn is_granted(&self) -> bool {
        self.outcome() == Some(ReservationOutcome::Granted)
    }

    /// Wait until the manager has processed this request.
    pub async fn wait(&self) -> ReservationOutcome {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.processed).await {
            Ok(state) => state.outcome.unwrap_or(ReservationOutcome::Rejected),
            Err(_) => ReservationOutcome::Rejected,
        }
    }

    /// Reset a request that was not granted so it can be submitted again.
    ///
    /// A pending request is withdrawn from its queue. Clearing a granted
    /// request fails: a grant ends only through [`Self::release`].
    pub fn clear(&self) -> Result<()> {
        match self.manager.upgrade() {
            Some(manager) => manager.withdraw(self),
            None => {
                if self.is_granted() {
                    return Err(self.granted_error());
                }
                self.state.send_replace(RequestState::default());
                Ok(())
            }
        }
    }

    /// Give the resource back. Only valid while granted.
    pub fn release(&self) -> Result<()> {
        let callback = self.release.lock().take();
        match callback {
            Some(callback) => {
                callback();
                Ok(())
            }
            None => Err(EngineError::invalid_state(format!(
                "reservation {} on '{}' is not held",
                self.id, self.resource
            ))),
        }
    }

    fn granted_error(&self) -> EngineError {
        EngineError::invalid_state(format!(
            "cannot clear granted reservation {} on '{}'",
            self.id, self.resource
        ))
    }

    fn finish(&self, outcome: ReservationOutcome) {
        self.state.send_replace(RequestState {
            outcome: Some(outcome),
            processed: true,
        });
    }

    fn reset(&self) {
        self.release.lock().take();
        self.state.send_replace(RequestState::default());
    }
}

impl std::fmt::Debug for ReservationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationRequest")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
struct ResourceState {
    holder: Option<Arc<ReservationRequest>>,
    queue: VecDeque<Arc<ReservationRequest>>,
}

#[derive(Default)]
struct State {
    resources: HashMap<String, ResourceState>,
    next_seq: u64,
}

/// Serializes claims on named resources.
pub struct ReservationManager {
    this: Weak<ReservationManager>,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl ReservationManager {
    /// Create a manager that knows the given resource names.
    pub fn new<I, S>(resources: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resources = resources
            .into_iter()
            .map(|r| (r.into(), ResourceState::default()))
            .collect();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(State {
                resources,
                next_seq: 0,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn register_resource(&self, name: impl Into<String>) {
        self.state.lock().resources.entry(name.into()).or_default();
    }

    /// Create a fresh request. Ids increase monotonically.
    pub fn request(
        &self,
        resource: impl Into<String>,
        owner: ThreadId,
        labware: Option<LabwareId>,
    ) -> Arc<ReservationRequest> {
        Arc::new(ReservationRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            resource: resource.into(),
            owner,
            labware,
            seq: AtomicU64::new(0),
            state: watch::Sender::new(RequestState::default()),
            release: Mutex::new(None),
            manager: self.this.clone(),
        })
    }

    /// Queue `request` for its resource.
    ///
    /// Returns an error only for misuse: submitting a request that already
    /// carries an outcome (it must be cleared first) or is already queued.
    /// Unknown resources and duplicate claims by the same owner are answered
    /// with a `Rejected` outcome instead.
    pub fn submit(&self, request: &Arc<ReservationRequest>) -> Result<()> {
        if let Some(outcome) = request.outcome() {
            return Err(EngineError::invalid_state(format!(
                "reservation {} on '{}' is {:?}; clear it before resubmitting",
                request.id, request.resource, outcome
            )));
        }

        let mut state = self.state.lock();
        let Some(slot) = state.resources.get(&request.resource) else {
            drop(state);
            tracing::warn!(resource = %request.resource, "reservation rejected: unknown resource");
            request.finish(ReservationOutcome::Rejected);
            return Ok(());
        };

        if slot.queue.iter().any(|r| r.id == request.id)
            || slot.holder.as_ref().is_some_and(|h| h.id == request.id)
        {
            return Err(EngineError::invalid_state(format!(
                "reservation {} already submitted",
                request.id
            )));
        }

        let duplicate = slot.holder.as_ref().is_some_and(|h| h.owner == request.owner)
            || slot.queue.iter().any(|r| r.owner == request.owner);
        if duplicate {
            drop(state);
            tracing::warn!(
                resource = %request.resource,
                owner = %request.owner,
                "reservation rejected: duplicate claim"
            );
            request.finish(ReservationOutcome::Rejected);
            return Ok(());
        }

        state.next_seq += 1;
        request.seq.store(state.next_seq, Ordering::Relaxed);
        if let Some(slot) = state.resources.get_mut(&request.resource) {
            slot.queue.push_back(Arc::clone(request));
        }
        tracing::debug!(
            resource = %request.resource,
            owner = %request.owner,
            request = request.id,
            "reservation submitted"
        );

        self.arbitrate(&mut state, &request.resource);
        self.break_deadlocks(&mut state);
        Ok(())
    }

    /// Release everything `owner` holds and reject everything it waits on.
    ///
    /// Returns the number of held resources released.
    pub fn cancel_owner(&self, owner: ThreadId) -> usize {
        let mut state = self.state.lock();
        let mut released = Vec::new();
        for (name, slot) in state.resources.iter_mut() {
            slot.queue.retain(|r| {
                if r.owner == owner {
                    r.finish(ReservationOutcome::Rejected);
                    false
                } else {
                    true
                }
            });
            if slot.holder.as_ref().is_some_and(|h| h.owner == owner) {
                if let Some(holder) = slot.holder.take() {
                    holder.reset();
                }
                released.push(name.clone());
            }
        }
        for name in &released {
            self.arbitrate(&mut state, name);
        }
        self.break_deadlocks(&mut state);
        if !released.is_empty() {
            tracing::debug!(owner = %owner, released = ?released, "owner reservations cancelled");
        }
        released.len()
    }

    /// Owner currently holding `resource`.
    pub fn holder(&self, resource: &str) -> Option<ThreadId> {
        self.state
            .lock()
            .resources
            .get(resource)
            .and_then(|s| s.holder.as_ref().map(|h| h.owner))
    }

    pub fn queue_len(&self, resource: &str) -> usize {
        self.state
            .lock()
            .resources
            .get(resource)
            .map_or(0, |s| s.queue.len())
    }

    /// No holder and nobody waiting.
    pub fn is_idle(&self, resource: &str) -> bool {
        self.state
            .lock()
            .resources
            .get(resource)
            .is_some_and(|s| s.holder.is_none() && s.queue.is_empty())
    }

    /// Resources held by `owner`, sorted by name.
    pub fn held_by(&self, owner: ThreadId) -> Vec<String> {
        let mut held: Vec<String> = self
            .state
            .lock()
            .resources
            .iter()
            .filter(|(_, s)| s.holder.as_ref().is_some_and(|h| h.owner == owner))
            .map(|(name, _)| name.clone())
            .collect();
        held.sort();
        held
    }

    fn release_granted(&self, resource: &str, request_id: u64) {
        let mut state = self.state.lock();
        let Some(slot) = state.resources.get_mut(resource) else {
            return;
        };
        if !slot.holder.as_ref().is_some_and(|h| h.id == request_id) {
            return;
        }
        if let Some(holder) = slot.holder.take() {
            tracing::debug!(resource = %resource, owner = %holder.owner, "reservation released");
            holder.reset();
        }
        self.arbitrate(&mut state, resource);
        self.break_deadlocks(&mut state);
    }

    /// Take a pending request out of its queue and reset it.
    ///
    /// Grants are only made under the state lock, so checking and resetting
    /// here cannot interleave with a release handing the slot over.
    fn withdraw(&self, request: &ReservationRequest) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.resources.get_mut(&request.resource);
        let holds = slot
            .as_ref()
            .is_some_and(|s| s.holder.as_ref().is_some_and(|h| h.id == request.id));
        if holds || request.is_granted() {
            return Err(request.granted_error());
        }
        if let Some(slot) = slot {
            slot.queue.retain(|r| r.id != request.id);
        }
        request.state.send_replace(RequestState::default());
        Ok(())
    }

    /// Grant the resource to the head of its queue if nobody holds it.
    fn arbitrate(&self, state: &mut State, resource: &str) {
        let Some(slot) = state.resources.get_mut(resource) else {
            return;
        };
        if slot.holder.is_some() {
            return;
        }
        let Some(next) = slot.queue.pop_front() else {
            return;
        };

        let manager = self.this.clone();
        let name = resource.to_string();
        let id = next.id;
        *next.release.lock() = Some(Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.release_granted(&name, id);
            }
        }));
        next.finish(ReservationOutcome::Granted);
        tracing::debug!(resource = %resource, owner = %next.owner, request = next.id, "reservation granted");
        slot.holder = Some(next);
    }

    fn break_deadlocks(&self, state: &mut State) {
        while let Some(victim) = find_victim(state) {
            if let Some(slot) = state.resources.get_mut(&victim.resource) {
                slot.queue.retain(|r| r.id != victim.id);
            }
            tracing::warn!(
                resource = %victim.resource,
                owner = %victim.owner,
                request = victim.id,
                "deadlock detected; request marked deadlocked"
            );
            victim.finish(ReservationOutcome::Deadlocked);
        }
    }
}

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager")
            .field("resources", &self.state.lock().resources.len())
            .finish()
    }
}

/// Find one wait-for cycle and return its most recently submitted request.
fn find_victim(state: &State) -> Option<Arc<ReservationRequest>> {
    // waiting owner -> [(holder owner, pending request)]
    let mut edges: HashMap<ThreadId, Vec<(ThreadId, Arc<ReservationRequest>)>> = HashMap::new();
    for slot in state.resources.values() {
        let Some(holder) = &slot.holder else {
            continue;
        };
        for waiting in &slot.queue {
            if waiting.owner != holder.owner {
                edges
                    .entry(waiting.owner)
                    .or_default()
                    .push((holder.owner, Arc::clone(waiting)));
            }
        }
    }

    let mut starts: Vec<ThreadId> = edges.keys().copied().collect();
    starts.sort();
    let mut done = HashSet::new();
    for start in starts {
        let mut path = Vec::new();
        if let Some(cycle) = walk(start, &edges, &mut path, &mut done) {
            return cycle
                .into_iter()
                .max_by_key(|r| r.seq.load(Ordering::Relaxed));
        }
    }
    None
}

/// Depth-first search; `path` holds the requests on the current chain.
fn walk(
    node: ThreadId,
    edges: &HashMap<ThreadId, Vec<(ThreadId, Arc<ReservationRequest>)>>,
    path: &mut Vec<Arc<ReservationRequest>>,
    done: &mut HashSet<ThreadId>,
) -> Option<Vec<Arc<ReservationRequest>>> {
    if done.contains(&node) {
        return None;
    }
    for (next, request) in edges.get(&node).into_iter().flatten() {
        if let Some(pos) = path.iter().position(|r| r.owner == *next) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(Arc::clone(request));
            return Some(cycle);
        }
        if *next == node {
            continue;
        }
        path.push(Arc::clone(request));
        let found = walk(*next, edges, path, done);
        path.pop();
        if found.is_some() {
            return found;
        }
    }
    done.insert(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_to_idle_resource() {
        let manager = ReservationManager::new(["hotel"]);
        let req = manager.request("hotel", ThreadId::new(), None);
        manager.submit(&req).unwrap();
        assert_eq!(req.wait().await, ReservationOutcome::Granted);
        assert!(req.state().processed);
        assert_eq!(manager.holder("hotel"), Some(req.owner()));
    }

    #[tokio::test]
    async fn test_unknown_resource_rejected() {
        let manager = ReservationManager::new(["hotel"]);
        let req = manager.request("nowhere", ThreadId::new(), None);
        manager.submit(&req).unwrap();
        assert_eq!(req.wait().await, ReservationOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_rejected_must_be_cleared_before_resubmit() {
        let manager = ReservationManager::new(["hotel"]);
        let req = manager.request("nowhere", ThreadId::new(), None);
        manager.submit(&req).unwrap();
        req.wait().await;
        assert!(matches!(manager.submit(&req), Err(EngineError::InvalidState(_))));

        req.clear().unwrap();
        assert_eq!(req.state(), RequestState::default());
    }

    #[tokio::test]
    async fn test_clear_granted_fails() {
        let manager = ReservationManager::new(["hotel"]);
        let req = manager.request("hotel", ThreadId::new(), None);
        manager.submit(&req).unwrap();
        req.wait().await;
        assert!(req.clear().is_err());
        assert!(req.is_granted());
    }

    #[tokio::test]
    async fn test_clear_pending_withdraws() {
        let manager = ReservationManager::new(["hotel"]);
        let first = manager.request("hotel", ThreadId::new(), None);
        let second = manager.request("hotel", ThreadId::new(), None);
        manager.submit(&first).unwrap();
        manager.submit(&second).unwrap();
        assert_eq!(manager.queue_len("hotel"), 1);

        second.clear().unwrap();
        assert_eq!(manager.queue_len("hotel"), 0);
        assert_eq!(second.state(), RequestState::default());

        // Cleared requests can be submitted again.
        manager.submit(&second).unwrap();
        assert_eq!(manager.queue_len("hotel"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_claim_rejected() {
        let manager = ReservationManager::new(["hotel"]);
        let owner = ThreadId::new();
        let a = manager.request("hotel", owner, None);
        let b = manager.request("hotel", owner, None);
        manager.submit(&a).unwrap();
        manager.submit(&b).unwrap();
        assert_eq!(a.wait().await, ReservationOutcome::Granted);
        assert_eq!(b.wait().await, ReservationOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_fifo_release_hands_over() {
        let manager = ReservationManager::new(["nest"]);
        let a = manager.request("nest", ThreadId::new(), None);
        let b = manager.request("nest", ThreadId::new(), None);
        let c = manager.request("nest", ThreadId::new(), None);
        for r in [&a, &b, &c] {
            manager.submit(r).unwrap();
        }
        assert!(a.is_granted());
        assert!(!b.state().processed);

        a.release().unwrap();
        assert_eq!(b.wait().await, ReservationOutcome::Granted);
        assert!(!c.state().processed);
        assert_eq!(a.state(), RequestState::default());

        b.release().unwrap();
        assert_eq!(c.wait().await, ReservationOutcome::Granted);
    }

    #[tokio::test]
    async fn test_release_twice_fails() {
        let manager = ReservationManager::new(["nest"]);
        let a = manager.request("nest", ThreadId::new(), None);
        manager.submit(&a).unwrap();
        a.release().unwrap();
        assert!(a.release().is_err());
        assert!(manager.is_idle("nest"));
    }

    #[tokio::test]
    async fn test_cancel_owner() {
        let manager = ReservationManager::new(["a", "b"]);
        let t1 = ThreadId::new();
        let t2 = ThreadId::new();
        let held = manager.request("a", t1, None);
        let other = manager.request("b", t2, None);
        let queued = manager.request("b", t1, None);
        let waiter = manager.request("a", t2, None);
        manager.submit(&held).unwrap();
        manager.submit(&other).unwrap();
        manager.submit(&queued).unwrap();
        manager.submit(&waiter).unwrap();

        // t2 now waits on a (held by t1) and t1 waits on b (held by t2):
        // the later submission (waiter) is the victim.
        assert_eq!(waiter.wait().await, ReservationOutcome::Deadlocked);
        assert!(!queued.state().processed);

        assert_eq!(manager.cancel_owner(t2), 1);
        assert_eq!(queued.wait().await, ReservationOutcome::Granted);
        assert_eq!(manager.held_by(t1), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(manager.cancel_owner(t1), 2);
        assert!(manager.is_idle("a"));
        assert!(manager.is_idle("b"));
    }

    #[tokio::test]
    async fn test_cancel_owner_rejects_queued() {
        let manager = ReservationManager::new(["a"]);
        let t1 = ThreadId::new();
        let t2 = ThreadId::new();
        let held = manager.request("a", t1, None);
        let queued = manager.request("a", t2, None);
        manager.submit(&held).unwrap();
        manager.submit(&queued).unwrap();
        manager.cancel_owner(t2);
        assert_eq!(queued.wait().await, ReservationOutcome::Rejected);
        assert!(held.is_granted());
    }

    #[tokio::test]
    async fn test_three_way_cycle_victim_is_latest() {
        let manager = ReservationManager::new(["x", "y", "z"]);
        let (t1, t2, t3) = (ThreadId::new(), ThreadId::new(), ThreadId::new());
        for (res, owner) in [("x", t1), ("y", t2), ("z", t3)] {
            let r = manager.request(res, owner, None);
            manager.submit(&r).unwrap();
        }
        let w1 = manager.request("y", t1, None);
        let w2 = manager.request("z", t2, None);
        let w3 = manager.request("x", t3, None);
        manager.submit(&w1).unwrap();
        manager.submit(&w2).unwrap();
        assert!(!w1.state().processed);
        assert!(!w2.state().processed);
        manager.submit(&w3).unwrap();

        assert_eq!(w3.wait().await, ReservationOutcome::Deadlocked);
        assert!(!w1.state().processed);
        assert!(!w2.state().processed);
    }

    #[tokio::test]
    async fn test_exactly_one_outcome_under_contention() {
        let manager = ReservationManager::new(["nest"]);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let req = manager.request("nest", ThreadId::new(), None);
                manager.submit(&req).unwrap();
                let outcome = req.wait().await;
                assert_eq!(outcome, ReservationOutcome::Granted);
                assert!(manager.holder("nest") == Some(req.owner()));
                tokio::task::yield_now().await;
                req.release().unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(manager.is_idle("nest"));
    }

    #[test]
    fn test_clear_racing_release_never_drops_a_grant() {
        use std::sync::Barrier;

        for _ in 0..2_000 {
            let manager = ReservationManager::new(["nest"]);
            let holder = manager.request("nest", ThreadId::new(), None);
            let waiter = manager.request("nest", ThreadId::new(), None);
            manager.submit(&holder).unwrap();
            manager.submit(&waiter).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let releaser = {
                let barrier = Arc::clone(&barrier);
                let holder = Arc::clone(&holder);
                std::thread::spawn(move || {
                    barrier.wait();
                    holder.release().unwrap();
                })
            };
            let clearer = {
                let barrier = Arc::clone(&barrier);
                let waiter = Arc::clone(&waiter);
                std::thread::spawn(move || {
                    barrier.wait();
                    waiter.clear()
                })
            };
            releaser.join().unwrap();
            let cleared = clearer.join().unwrap();

            let holds = manager.holder("nest") == Some(waiter.owner());
            match cleared {
                Ok(()) => {
                    assert!(!holds, "cleared request still holds the nest");
                    assert_eq!(waiter.state(), RequestState::default());
                    assert!(manager.is_idle("nest"));
                }
                Err(err) => {
                    assert!(matches!(err, EngineError::InvalidState(_)));
                    assert!(waiter.is_granted());
                    assert!(holds);
                }
            }
        }
    }
}
