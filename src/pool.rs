use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[cfg(feature = "pool")]
use tracing::trace;

use crate::node::{ClaimAttempt, ConnNode, NodeState};

/// The structural part of a pool: its node list. Protected by a mutex
/// separate from the table's readers-writer lock, since nodes reach a pool
/// both through the table (insert/remove, under the table's write lock)
/// and directly via their own `Weak<Pool>` back-pointer (put, mark_ready),
/// which may run with no table lock held at all.
struct Guts {
    conn_list: Vec<Arc<ConnNode>>,
}

/// Outcome of scanning a pool for an acquirable node, mirroring
/// `connection_get`'s three failure modes plus success.
pub(crate) enum Claimed {
    Node(Arc<ConnNode>),
    NotFound,
    AllPathsDown,
    Busy,
}

/// Outcome of a bounded or unbounded wait on a pool's wait queue.
pub(crate) enum WaitResult {
    /// The idle-connection predicate became true; carries the remaining
    /// budget to keep waiting with (`None` if the original wait was
    /// unbounded).
    Ready(Option<Duration>),
    TimedOut,
}

/// Per-endpoint bundle of connection nodes, counters, and a wait queue.
/// A pool is created on first insert for its endpoint and is never
/// destroyed by node removal alone — an empty pool persists until the
/// table itself is destroyed.
pub(crate) struct Pool {
    ip: String,
    port: u16,
    key: u32,
    guts: Mutex<Guts>,
    nr_connections: AtomicUsize,
    nr_idle_connections: AtomicUsize,
    upref: AtomicUsize,
    nr_waits: AtomicUsize,
    waiting: AtomicUsize,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
}

impl Pool {
    pub(crate) fn new(ip: String, port: u16, key: u32) -> Arc<Pool> {
        Arc::new(Pool {
            ip,
            port,
            key,
            guts: Mutex::new(Guts { conn_list: Vec::new() }),
            nr_connections: AtomicUsize::new(0),
            nr_idle_connections: AtomicUsize::new(0),
            upref: AtomicUsize::new(0),
            nr_waits: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
        })
    }

    pub(crate) fn ip(&self) -> &str {
        &self.ip
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn key(&self) -> u32 {
        self.key
    }

    pub(crate) fn nr_connections(&self) -> usize {
        self.nr_connections.load(Ordering::Acquire)
    }

    pub(crate) fn nr_idle_connections(&self) -> usize {
        self.nr_idle_connections.load(Ordering::Acquire)
    }

    pub(crate) fn nr_waits(&self) -> usize {
        self.nr_waits.load(Ordering::Relaxed)
    }

    pub(crate) fn upref(&self) -> usize {
        self.upref.load(Ordering::Acquire)
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.waiting.load(Ordering::Acquire) > 0
    }

    pub(crate) fn upref_inc(&self) {
        self.upref.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn upref_dec(&self) {
        self.upref.fetch_sub(1, Ordering::AcqRel);
    }

    fn wake_one(&self) {
        let _guard = self.wait_lock.lock().unwrap();
        self.wait_cond.notify_one();
    }

    /// `insert` steps 3-4: binds the node to this pool, head-inserts it
    /// into `conn_list` (newest first — a warm-cache bias, not a
    /// correctness invariant), and sets it `READY`.
    ///
    /// Callers must already hold a pin on this pool (`upref_inc()`, taken
    /// while the table lock that found or linked the pool was still held)
    /// before calling this — linking the node is itself a destroy-visible
    /// mutation, and pinning only here would leave the same window open
    /// that pinning is meant to close.
    pub(crate) fn link_new_node(self: &Arc<Self>, node: &Arc<ConnNode>) {
        node.bind_pool(self);
        {
            let mut guts = self.guts.lock().unwrap();
            guts.conn_list.insert(0, Arc::clone(node));
        }
        self.nr_connections.fetch_add(1, Ordering::AcqRel);
        self.nr_idle_connections.fetch_add(1, Ordering::AcqRel);
        node.set_state(NodeState::Ready);
    }

    /// `insert` steps 5-6: wake one waiter if any, then drop the `upref`
    /// pin the caller took before [`Self::link_new_node`].
    pub(crate) fn finish_insert(&self) {
        self.wake_one();
        self.upref_dec();
    }

    /// `connection_get`: scans `conn_list` head-first, TAS-claiming the
    /// first `READY` node it finds. Distinguishes "list empty", "nothing
    /// acquirable but something is READY-ineligible" (`AllPathsDown`), and
    /// "something is actively locked" (`Busy`) exactly as the algorithm
    /// requires, since the wait path is only entered on `Busy`.
    pub(crate) fn claim(&self, call_start: Instant) -> Claimed {
        let guts = self.guts.lock().unwrap();
        if guts.conn_list.is_empty() {
            return Claimed::NotFound;
        }
        let mut saw_locked = false;
        for node in guts.conn_list.iter() {
            match node.try_claim_ready(call_start) {
                ClaimAttempt::Claimed => {
                    self.nr_idle_connections.fetch_sub(1, Ordering::AcqRel);
                    return Claimed::Node(Arc::clone(node));
                }
                ClaimAttempt::AlreadyLocked => saw_locked = true,
                ClaimAttempt::NotReady => {}
            }
        }
        debug_assert_eq!(
            self.nr_idle_connections(),
            0,
            "connection_get: scan found no READY node yet nr_idle_connections > 0"
        );
        if saw_locked {
            Claimed::Busy
        } else {
            Claimed::AllPathsDown
        }
    }

    /// Blocks (bounded by `budget`, or unboundedly if `None`) until
    /// `nr_idle_connections > 0`. Mirrors `wait_until(pool.wq, pred,
    /// timeout)`: increments the cumulative `nr_waits` counter on entry,
    /// and tracks the currently-blocked count for `destroy`'s refusal
    /// check.
    pub(crate) fn wait_for_idle(&self, budget: Option<Duration>) -> WaitResult {
        self.nr_waits.fetch_add(1, Ordering::Relaxed);
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let guard = self.wait_lock.lock().unwrap();
        let result = match budget {
            None => {
                let _guard = self
                    .wait_cond
                    .wait_while(guard, |_| self.nr_idle_connections() == 0)
                    .unwrap();
                WaitResult::Ready(None)
            }
            Some(budget) => {
                let start = Instant::now();
                let (_guard, timeout_result) = self
                    .wait_cond
                    .wait_timeout_while(guard, budget, |_| self.nr_idle_connections() == 0)
                    .unwrap();
                if timeout_result.timed_out() {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Ready(Some(budget.saturating_sub(start.elapsed())))
                }
            }
        };
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// The pool-side half of `put`: bumps `upref`, bumps
    /// `nr_idle_connections`, then lets the caller clear the node's lock
    /// bit (the release store), then wakes a waiter, then drops the
    /// `upref` pin. This exact order — idle count up, *then* unlock, *then*
    /// wake — is what lets a waiter that wakes on the predicate safely
    /// reuse the node it was notified about.
    pub(crate) fn release_and_wake(&self, node: &ConnNode) {
        self.upref_inc();
        self.nr_idle_connections.fetch_add(1, Ordering::AcqRel);
        node.unlock();
        self.wake_one();
        self.upref_dec();
    }

    /// Bumps the idle count and wakes a waiter without touching the node's
    /// lock bit — used by [`crate::ConnNode::mark_ready`], which clears
    /// the bit itself before calling this.
    pub(crate) fn note_idle_and_wake(&self) {
        self.upref_inc();
        self.nr_idle_connections.fetch_add(1, Ordering::AcqRel);
        self.wake_one();
        self.upref_dec();
    }

    /// `peek`: the head of `conn_list`, without taking the node lock.
    /// Advisory only — by the time the caller looks at it, it may already
    /// be claimed by someone else.
    pub(crate) fn peek_head(&self) -> Option<Arc<ConnNode>> {
        self.guts.lock().unwrap().conn_list.first().cloned()
    }

    /// `remove(table, node)`'s pool-side bookkeeping: unlinks `node` from
    /// `conn_list` and decrements `nr_connections` (and `nr_idle_connections`
    /// if it was `READY`). The caller has already TAS-claimed the node and
    /// asserted it isn't `ACTIVE`.
    pub(crate) fn unlink_node(&self, node: &Arc<ConnNode>, was_ready: bool) {
        let mut guts = self.guts.lock().unwrap();
        if let Some(idx) = guts.conn_list.iter().position(|n| Arc::ptr_eq(n, node)) {
            guts.conn_list.remove(idx);
        }
        drop(guts);
        self.nr_connections.fetch_sub(1, Ordering::AcqRel);
        if was_ready {
            self.nr_idle_connections.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Best-effort drain for `destroy`: claims and zombifies every node it
    /// can, skipping (and leaving linked) any node that is currently
    /// locked. Returns whether the pool is now safe to drop from the table
    /// (empty, unreferenced, no waiters).
    pub(crate) fn drain_for_destroy(&self) -> bool {
        let mut guts = self.guts.lock().unwrap();
        let mut i = 0;
        while i < guts.conn_list.len() {
            let node = Arc::clone(&guts.conn_list[i]);
            if !node.try_lock() {
                #[cfg(feature = "pool")]
                trace!(ip = %self.ip, port = self.port, "destroy: node busy, pool retained");
                i += 1;
                continue;
            }
            let was_ready = node.state() == NodeState::Ready;
            node.set_state(NodeState::Zombie);
            node.unlock();
            guts.conn_list.remove(i);
            self.nr_connections.fetch_sub(1, Ordering::AcqRel);
            if was_ready {
                self.nr_idle_connections.fetch_sub(1, Ordering::AcqRel);
            }
        }
        let drained = guts.conn_list.is_empty();
        drop(guts);
        drained && self.upref() == 0 && !self.has_waiters()
    }

    /// Snapshot of the node list for `dump`, taken under the pool's mutex
    /// and then released before any I/O runs against it.
    pub(crate) fn snapshot_nodes(&self) -> Vec<Arc<ConnNode>> {
        self.guts.lock().unwrap().conn_list.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn ready_node(ip: &str, port: u16) -> Arc<ConnNode> {
        let n = ConnNode::new(ip, port);
        n.set_state(NodeState::Ready);
        n
    }

    #[test]
    fn claim_on_empty_pool_is_not_found() {
        let pool = Pool::new("10.0.0.1".into(), 80, 1);
        assert!(matches!(pool.claim(Instant::now()), Claimed::NotFound));
    }

    #[test]
    fn claim_prefers_head_first_insertion() {
        let pool = Pool::new("10.0.0.1".into(), 80, 1);
        let a = ready_node("10.0.0.1", 80);
        let b = ready_node("10.0.0.1", 80);
        let c = ready_node("10.0.0.1", 80);
        pool.link_new_node(&a);
        pool.link_new_node(&b);
        pool.link_new_node(&c);

        match pool.claim(Instant::now()) {
            Claimed::Node(n) => assert!(Arc::ptr_eq(&n, &c), "expected newest node C first"),
            _ => panic!("expected a claim"),
        }
    }

    #[test]
    fn claim_reports_all_paths_down_when_nothing_ready() {
        let pool = Pool::new("10.0.0.1".into(), 80, 1);
        let n = ConnNode::new("10.0.0.1", 80);
        pool.link_new_node(&n);
        // link_new_node always sets READY; force it back to RETRY to model
        // a pool whose only node is ineligible.
        n.set_state(NodeState::Retry);
        assert!(matches!(pool.claim(Instant::now()), Claimed::AllPathsDown));
    }

    #[test]
    fn claim_reports_busy_when_locked() {
        let pool = Pool::new("10.0.0.1".into(), 80, 1);
        let n = ready_node("10.0.0.1", 80);
        pool.link_new_node(&n);
        assert!(n.try_lock());
        assert!(matches!(pool.claim(Instant::now()), Claimed::Busy));
        n.unlock();
    }

    #[test]
    fn release_and_wake_wakes_a_blocked_waiter() {
        let pool = Pool::new("10.0.0.1".into(), 80, 1);
        let n = ready_node("10.0.0.1", 80);
        pool.link_new_node(&n);
        let claimed = match pool.claim(Instant::now()) {
            Claimed::Node(n) => n,
            _ => panic!("expected a claim"),
        };
        assert!(matches!(pool.claim(Instant::now()), Claimed::Busy));

        let barrier = Arc::new(Barrier::new(2));
        let pool_for_thread = Arc::clone(&pool);
        let barrier_for_thread = Arc::clone(&barrier);
        let waiter = thread::spawn(move || {
            barrier_for_thread.wait();
            matches!(
                pool_for_thread.wait_for_idle(Some(Duration::from_secs(5))),
                WaitResult::Ready(_)
            )
        });

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        pool.release_and_wake(&claimed);

        assert!(waiter.join().unwrap());
        assert_eq!(pool.nr_waits(), 1);
    }
}
