//! Strict two-phase locking over record ids, with FIFO per-record queues
//! and a background waits-for cycle detector.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::errors::{AbortReason, StorageError, StorageResult};
use crate::transaction::{IsolationLevel, Transaction, TransactionRegistry, TransactionState};
use crate::{Rid, TxnId};

pub const DEFAULT_CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// At most one upgrade may be in flight per queue.
    upgrading: bool,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// A request may proceed only when every earlier entry in its queue is
/// granted and compatible with it (only S with S).
fn is_lock_compatible(state: &QueueState, txn_id: TxnId, mode: LockMode) -> bool {
    for request in state.requests.iter() {
        if request.txn_id == txn_id {
            return true;
        }
        let compatible = request.granted
            && request.mode != LockMode::Exclusive
            && mode != LockMode::Exclusive;
        if !compatible {
            return false;
        }
    }
    true
}

/// An upgrader sits early in the queue, so it must also wait out granted
/// sharers queued behind it: it may proceed only when nobody else holds a
/// granted lock.
fn is_upgrade_compatible(state: &QueueState, txn_id: TxnId) -> bool {
    !state
        .requests
        .iter()
        .any(|r| r.txn_id != txn_id && r.granted)
}

pub struct LockManager {
    /// Guards the map only; per-queue latches guard the queues. Dropped
    /// before any wait.
    lock_table: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    /// Waits-for graph, rebuilt by the detector on every wake. Kept sorted
    /// so DFS order is deterministic.
    waits_for: Mutex<BTreeMap<TxnId, Vec<TxnId>>>,
    registry: Arc<TransactionRegistry>,
    /// Signalled to wake the detector out of its interval early on stop.
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    detector: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(registry: Arc<TransactionRegistry>) -> Arc<Self> {
        Self::with_interval(registry, DEFAULT_CYCLE_DETECTION_INTERVAL)
    }

    pub fn with_interval(
        registry: Arc<TransactionRegistry>,
        cycle_detection_interval: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            lock_table: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            registry,
            shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            detector: Mutex::new(None),
        });

        let weak: Weak<LockManager> = Arc::downgrade(&manager);
        let shutdown = Arc::clone(&manager.shutdown);
        let handle = thread::spawn(move || loop {
            let (stop_flag, stop_cv) = &*shutdown;
            let stopped = stop_flag.lock().unwrap();
            let (stopped, _timeout) = stop_cv
                .wait_timeout_while(stopped, cycle_detection_interval, |stopped| !*stopped)
                .unwrap();
            if *stopped {
                return;
            }
            drop(stopped);
            let Some(manager) = weak.upgrade() else {
                return;
            };
            manager.detect_and_break_cycles();
        });
        *manager.detector.lock().unwrap() = Some(handle);
        manager
    }

    /// Stops the detector thread. Called by the engine on shutdown and by
    /// Drop as a backstop.
    pub fn stop_cycle_detection(&self) {
        {
            let (stop_flag, stop_cv) = &*self.shutdown;
            *stop_flag.lock().unwrap() = true;
            stop_cv.notify_all();
        }
        if let Some(handle) = self.detector.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn queue_for(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut table = self.lock_table.lock().unwrap();
        Arc::clone(table.entry(rid).or_default())
    }

    fn abort_implicitly<T>(txn: &Arc<Transaction>, reason: AbortReason) -> StorageResult<T> {
        txn.set_state(TransactionState::Aborted);
        Err(StorageError::Abort {
            txn_id: txn.id(),
            reason,
        })
    }

    /// Takes a shared lock, blocking until granted or the transaction is
    /// aborted by the deadlock detector.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> StorageResult<bool> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Self::abort_implicitly(txn, AbortReason::LockSharedOnReadUncommitted);
        }
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Shrinking
        {
            return Self::abort_implicitly(txn, AbortReason::LockOnShrinking);
        }
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock().unwrap();
        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Shared,
            granted: false,
        });

        while !is_lock_compatible(&state, txn.id(), LockMode::Shared)
            && txn.state() != TransactionState::Aborted
        {
            state = queue.cv.wait(state).unwrap();
        }
        if txn.state() == TransactionState::Aborted {
            Self::drop_request(&queue, &mut state, txn.id());
            drop(state);
            return Self::abort_implicitly(txn, AbortReason::Deadlock);
        }

        Self::grant(&mut state, txn.id());
        // A sharer queued behind this one may have re-checked before the
        // grant landed; let it see the updated queue.
        queue.cv.notify_all();
        txn.add_shared_lock(rid);
        Ok(true)
    }

    /// Takes an exclusive lock, blocking as above.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> StorageResult<bool> {
        if txn.state() == TransactionState::Shrinking {
            return Self::abort_implicitly(txn, AbortReason::LockOnShrinking);
        }
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock().unwrap();
        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Exclusive,
            granted: false,
        });

        while !is_lock_compatible(&state, txn.id(), LockMode::Exclusive)
            && txn.state() != TransactionState::Aborted
        {
            state = queue.cv.wait(state).unwrap();
        }
        if txn.state() == TransactionState::Aborted {
            Self::drop_request(&queue, &mut state, txn.id());
            drop(state);
            return Self::abort_implicitly(txn, AbortReason::Deadlock);
        }

        Self::grant(&mut state, txn.id());
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Promotes a granted shared lock to exclusive. Only one upgrade may
    /// wait per queue; a second one aborts with UpgradeConflict.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> StorageResult<bool> {
        if txn.state() == TransactionState::Shrinking {
            return Self::abort_implicitly(txn, AbortReason::LockOnShrinking);
        }
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let queue = self.queue_for(rid);
        let mut state = queue.state.lock().unwrap();
        if state.upgrading {
            drop(state);
            return Self::abort_implicitly(txn, AbortReason::UpgradeConflict);
        }
        state.upgrading = true;

        {
            let request = state
                .requests
                .iter_mut()
                .find(|r| r.txn_id == txn.id())
                .expect("upgrade without a lock request in the queue");
            assert!(request.granted, "upgrade of an ungranted request");
            assert_eq!(request.mode, LockMode::Shared, "upgrade of a non-shared lock");
            request.mode = LockMode::Exclusive;
            request.granted = false;
        }

        while !is_upgrade_compatible(&state, txn.id())
            && txn.state() != TransactionState::Aborted
        {
            state = queue.cv.wait(state).unwrap();
        }
        if txn.state() == TransactionState::Aborted {
            state.upgrading = false;
            Self::drop_request(&queue, &mut state, txn.id());
            drop(state);
            txn.forget_lock(rid);
            return Self::abort_implicitly(txn, AbortReason::Deadlock);
        }

        Self::grant(&mut state, txn.id());
        state.upgrading = false;
        drop(state);
        txn.promote_lock(rid);
        Ok(true)
    }

    /// Releases the lock, moving a REPEATABLE_READ transaction into its
    /// shrinking phase, and wakes the queue if the head waiter can now run.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let queue = {
            let table = self.lock_table.lock().unwrap();
            match table.get(&rid) {
                Some(queue) => Arc::clone(queue),
                None => return false,
            }
        };
        let mut state = queue.state.lock().unwrap();

        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Growing
        {
            txn.set_state(TransactionState::Shrinking);
        }

        let Some(position) = state.requests.iter().position(|r| r.txn_id == txn.id()) else {
            return false;
        };
        state.requests.remove(position);

        // Waiters re-check compatibility themselves; an upgrader can sit
        // ahead of the slot that just opened, so wake the whole queue.
        if state.requests.iter().any(|r| !r.granted) {
            queue.cv.notify_all();
        }
        drop(state);

        txn.forget_lock(rid);
        true
    }

    fn grant(state: &mut QueueState, txn_id: TxnId) {
        let request = state
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn_id)
            .expect("granted request vanished from its queue");
        request.granted = true;
    }

    /// Removes a never-granted request left behind by an aborted waiter so
    /// the FIFO compatibility scan stays sound, and re-wakes the queue.
    fn drop_request(queue: &LockRequestQueue, state: &mut QueueState, txn_id: TxnId) {
        state.requests.retain(|r| r.txn_id != txn_id);
        queue.cv.notify_all();
    }

    // --- waits-for graph -------------------------------------------------

    pub fn add_edge(&self, from: TxnId, to: TxnId) {
        let mut graph = self.waits_for.lock().unwrap();
        let edges = graph.entry(from).or_default();
        if let Err(slot) = edges.binary_search(&to) {
            edges.insert(slot, to);
        }
    }

    pub fn remove_edge(&self, from: TxnId, to: TxnId) {
        let mut graph = self.waits_for.lock().unwrap();
        if let Some(edges) = graph.get_mut(&from) {
            if let Ok(slot) = edges.binary_search(&to) {
                edges.remove(slot);
            }
        }
    }

    /// Every edge as (waiter, holder) pairs. Test instrumentation.
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let graph = self.waits_for.lock().unwrap();
        graph
            .iter()
            .flat_map(|(&from, edges)| edges.iter().map(move |&to| (from, to)))
            .collect()
    }

    /// DFS from vertices in ascending txn id. On a cycle, returns the
    /// youngest (largest id) transaction in it.
    pub fn has_cycle(&self) -> Option<TxnId> {
        let graph = self.waits_for.lock().unwrap();
        Self::find_cycle_victim(&graph)
    }

    fn find_cycle_victim(graph: &BTreeMap<TxnId, Vec<TxnId>>) -> Option<TxnId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Visit {
            InStack,
            Done,
        }

        fn dfs(
            graph: &BTreeMap<TxnId, Vec<TxnId>>,
            stack: &mut Vec<TxnId>,
            visited: &mut HashMap<TxnId, Visit>,
        ) -> Option<TxnId> {
            let top = *stack.last().unwrap();
            let mut found = None;
            let neighbors = graph.get(&top).cloned().unwrap_or_default();
            for next in neighbors {
                match visited.get(&next) {
                    Some(Visit::InStack) => {
                        // The cycle is the stack suffix starting at `next`.
                        let start = stack.iter().position(|&v| v == next).unwrap();
                        found = stack[start..].iter().copied().max();
                        break;
                    }
                    Some(Visit::Done) => {}
                    None => {
                        stack.push(next);
                        visited.insert(next, Visit::InStack);
                        found = dfs(graph, stack, visited);
                        if found.is_some() {
                            break;
                        }
                    }
                }
            }
            visited.insert(top, Visit::Done);
            stack.pop();
            found
        }

        let mut visited: HashMap<TxnId, Visit> = HashMap::new();
        for &vertex in graph.keys() {
            if visited.contains_key(&vertex) {
                continue;
            }
            let mut stack = vec![vertex];
            visited.insert(vertex, Visit::InStack);
            if let Some(victim) = dfs(graph, &mut stack, &mut visited) {
                return Some(victim);
            }
        }
        None
    }

    fn snapshot_queues(&self) -> Vec<(Rid, Arc<LockRequestQueue>)> {
        let table = self.lock_table.lock().unwrap();
        table
            .iter()
            .map(|(&rid, queue)| (rid, Arc::clone(queue)))
            .collect()
    }

    /// Rebuilds the graph from the lock table: every waiter depends on
    /// every granted holder in the same queue. Aborted transactions are
    /// skipped.
    fn build_waits_for_graph(&self, queues: &[(Rid, Arc<LockRequestQueue>)]) {
        let mut graph = self.waits_for.lock().unwrap();
        graph.clear();
        drop(graph);

        for (_rid, queue) in queues {
            let state = queue.state.lock().unwrap();
            let mut holders = Vec::new();
            let mut waiters = Vec::new();
            for request in state.requests.iter() {
                let aborted = self
                    .registry
                    .get(request.txn_id)
                    .map(|txn| txn.state() == TransactionState::Aborted)
                    .unwrap_or(true);
                if aborted {
                    continue;
                }
                if request.granted {
                    holders.push(request.txn_id);
                } else {
                    waiters.push(request.txn_id);
                }
            }
            drop(state);
            for &waiter in &waiters {
                for &holder in &holders {
                    if waiter != holder {
                        self.add_edge(waiter, holder);
                    }
                }
            }
        }
    }

    /// One detector round: rebuild the graph, abort the youngest member of
    /// each cycle and wake its queues, repeat until acyclic.
    pub fn detect_and_break_cycles(&self) {
        let queues = self.snapshot_queues();
        self.build_waits_for_graph(&queues);

        while let Some(victim_id) = self.has_cycle() {
            crate::stratum_debug_log!(
                "[LockManager] deadlock detected, aborting txn {victim_id}"
            );
            if let Some(victim) = self.registry.get(victim_id) {
                victim.set_state(TransactionState::Aborted);
            }
            for (_rid, queue) in &queues {
                let state = queue.state.lock().unwrap();
                let involved = state.requests.iter().any(|r| r.txn_id == victim_id);
                drop(state);
                if involved {
                    queue.cv.notify_all();
                }
            }
            self.build_waits_for_graph(&queues);
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.stop_cycle_detection();
    }
}
