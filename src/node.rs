use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

#[cfg(feature = "pool")]
use tracing::trace;

use crate::pool::Pool;

/// Health state of a [`ConnNode`]. See the module-level state machine in
/// the design notes: `DOWN -> READY <-> ACTIVE`, with `RETRY`/`FAILED` as
/// detours out of `ACTIVE`, and `ZOMBIE` as the terminal state after
/// `Table::remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Down,
    Ready,
    Active,
    Retry,
    Failed,
    Zombie,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::Down => "DOWN",
            NodeState::Ready => "READY",
            NodeState::Active => "ACTIVE",
            NodeState::Retry => "RETRY",
            NodeState::Failed => "FAILED",
            NodeState::Zombie => "ZOMBIE",
        })
    }
}

/// Which operation the caller performed with a node before returning it,
/// used solely to attribute the elapsed checkout time to the right
/// counter (`tot_js_get` vs `tot_js_put`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Put,
}

/// The mutable parts of a node that must change together: the FSM state,
/// the timestamp used to compute elapsed-checkout intervals, and the weak
/// back-pointer to the owning pool. Protected by one small mutex — this is
/// *not* the exclusion mechanism (that's `ConnNode::locked`, a plain
/// atomic); it only exists to make mutation of these fields memory-safe.
struct Claim {
    state: NodeState,
    now: Instant,
    pool: Weak<Pool>,
}

/// A single reusable connection descriptor bound to a pool.
///
/// Mirrors the "connection node" of the design: identity `(ip, port)`, a
/// lock bit acting as a test-and-set mutex, a health state, a weak
/// back-pointer to the owning pool, and monotonic usage counters.
pub struct ConnNode {
    ip: String,
    port: u16,
    locked: AtomicBool,
    claim: Mutex<Claim>,
    nr_lookups: AtomicU64,
    tot_ns_get: AtomicU64,
    tot_ns_put: AtomicU64,
    tot_ns_wait: AtomicU64,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    nr_retry_attempts: AtomicU64,
}

pub(crate) enum ClaimAttempt {
    Claimed,
    NotReady,
    AlreadyLocked,
}

fn dur_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl ConnNode {
    /// `init(node, ip, port)`: a fresh node in state `DOWN`, unbound from
    /// any pool, with all counters zeroed.
    pub fn new(ip: impl Into<String>, port: u16) -> Arc<ConnNode> {
        Arc::new(ConnNode {
            ip: ip.into(),
            port,
            locked: AtomicBool::new(false),
            claim: Mutex::new(Claim {
                state: NodeState::Down,
                now: Instant::now(),
                pool: Weak::new(),
            }),
            nr_lookups: AtomicU64::new(0),
            tot_ns_get: AtomicU64::new(0),
            tot_ns_put: AtomicU64::new(0),
            tot_ns_wait: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            nr_retry_attempts: AtomicU64::new(0),
        })
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> NodeState {
        self.claim.lock().unwrap().state
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn nr_lookups(&self) -> u64 {
        self.nr_lookups.load(Ordering::Relaxed)
    }

    pub fn nr_retry_attempts(&self) -> u64 {
        self.nr_retry_attempts.load(Ordering::Relaxed)
    }

    pub fn tot_ns_get(&self) -> u64 {
        self.tot_ns_get.load(Ordering::Relaxed)
    }

    pub fn tot_ns_put(&self) -> u64 {
        self.tot_ns_put.load(Ordering::Relaxed)
    }

    pub fn tot_ns_wait(&self) -> u64 {
        self.tot_ns_wait.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Records bytes sent on this connection. Socket I/O itself is an
    /// external collaborator; callers report the byte counts they observed.
    pub fn add_tx_bytes(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Records bytes received on this connection. See [`Self::add_tx_bytes`].
    pub fn add_rx_bytes(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// `mark_failed(node)`: precondition — caller holds the node lock and
    /// `state` is `ACTIVE` or `RETRY`. Transitions to `FAILED` and releases
    /// the lock.
    ///
    /// The state mutation happens *before* the lock bit is cleared, not
    /// after: the source sets `state = FAILED` only once the bit is
    /// already released, which lets another thread observe `FAILED`
    /// without ever having held the lock — treated here as a defect and
    /// fixed per the design notes.
    pub fn mark_failed(&self) {
        let mut c = self.claim.lock().unwrap();
        assert!(
            matches!(c.state, NodeState::Active | NodeState::Retry),
            "mark_failed: node must be ACTIVE or RETRY, was {}",
            c.state
        );
        c.state = NodeState::Failed;
        drop(c);
        self.locked.store(false, Ordering::Release);
    }

    /// `mark_retry(node)`: precondition — caller holds the node lock.
    /// Transitions to `RETRY`; the lock remains held (a retrying node is
    /// not a candidate for acquire until [`Self::mark_ready`] runs).
    pub fn mark_retry(&self) {
        assert!(self.is_locked(), "mark_retry: node lock not held");
        let mut c = self.claim.lock().unwrap();
        c.state = NodeState::Retry;
        drop(c);
        self.nr_retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// `mark_ready(node)`: no-op unless `state == RETRY`; otherwise
    /// transitions to `READY` and releases the lock, making the node
    /// acquirable again and waking one waiter on its pool.
    pub fn mark_ready(&self) {
        {
            let mut c = self.claim.lock().unwrap();
            if c.state != NodeState::Retry {
                return;
            }
            c.state = NodeState::Ready;
        }
        self.locked.store(false, Ordering::Release);
        if let Some(pool) = self.pool() {
            pool.note_idle_and_wake();
        }
    }

    pub(crate) fn bind_pool(&self, pool: &Arc<Pool>) {
        self.claim.lock().unwrap().pool = Arc::downgrade(pool);
    }

    pub(crate) fn pool(&self) -> Option<Arc<Pool>> {
        self.claim.lock().unwrap().pool.upgrade()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.claim.lock().unwrap().state = state;
    }

    /// Raw test-and-set on the lock bit. `true` = claimed, `false` = busy.
    pub(crate) fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// The per-node half of `connection_get`'s scan: TAS the lock bit, and
    /// if that succeeds, claim the node only if it is `READY`. On success
    /// the node is `ACTIVE` and still locked; `call_start` is used to
    /// attribute the elapsed wait time.
    pub(crate) fn try_claim_ready(&self, call_start: Instant) -> ClaimAttempt {
        if !self.try_lock() {
            return ClaimAttempt::AlreadyLocked;
        }
        let mut c = self.claim.lock().unwrap();
        if c.state != NodeState::Ready {
            drop(c);
            self.unlock();
            return ClaimAttempt::NotReady;
        }
        let claimed_at = Instant::now();
        c.state = NodeState::Active;
        c.now = claimed_at;
        drop(c);
        self.tot_ns_wait.fetch_add(
            dur_ns(claimed_at.saturating_duration_since(call_start)),
            Ordering::Relaxed,
        );
        self.nr_lookups.fetch_add(1, Ordering::Relaxed);
        ClaimAttempt::Claimed
    }

    /// First half of `put`: if the node is `ACTIVE`, attributes the elapsed
    /// checkout interval to the right counter and transitions to `READY`.
    /// Does *not* clear the lock bit — the caller does that after bumping
    /// the pool's idle count, so a waiter can never observe `READY` before
    /// `nr_idle_connections` reflects it.
    pub(crate) fn finish_active(&self, op: Op) -> bool {
        let mut c = self.claim.lock().unwrap();
        if c.state != NodeState::Active {
            return false;
        }
        let now = Instant::now();
        let elapsed = dur_ns(now.saturating_duration_since(c.now));
        match op {
            Op::Get => self.tot_ns_get.fetch_add(elapsed, Ordering::Relaxed),
            Op::Put => self.tot_ns_put.fetch_add(elapsed, Ordering::Relaxed),
        };
        c.state = NodeState::Ready;
        true
    }

    pub(crate) fn write_row(&self, sink: &mut impl std::io::Write, pool_nr_waits: usize) -> std::io::Result<()> {
        let lookups = self.nr_lookups();
        let avg_us = |total_ns: u64| if lookups == 0 { 0 } else { (total_ns / lookups) / 1_000 };
        writeln!(
            sink,
            "{}:{} {} {} {} {} {} {} {} {} {}",
            self.ip,
            self.port,
            self.state(),
            self.nr_retry_attempts(),
            lookups,
            pool_nr_waits,
            avg_us(self.tot_ns_wait()),
            avg_us(self.tot_ns_get()),
            avg_us(self.tot_ns_put()),
            self.tx_bytes() / 1024,
            self.rx_bytes() / 1024,
        )
    }
}

impl fmt::Debug for ConnNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnNode")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("state", &self.state())
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Drop for ConnNode {
    fn drop(&mut self) {
        // `destroy(node)` in the source must only run on an unlinked node;
        // Rust's Drop reclaims `ip`'s allocation automatically, but we keep
        // the precondition check so caller bugs abort the process, per the
        // fatal-invariant policy every other FSM-violation check in this
        // crate follows (`mark_failed`, `Table::remove`).
        assert_ne!(
            self.state(),
            NodeState::Active,
            "ConnNode dropped while still ACTIVE"
        );
        #[cfg(feature = "pool")]
        trace!(ip = %self.ip, port = self.port, "connection node dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_starts_down() {
        let n = ConnNode::new("10.0.0.1", 80);
        assert_eq!(n.state(), NodeState::Down);
        assert!(!n.is_locked());
    }

    #[test]
    fn try_claim_ready_requires_ready_state() {
        let n = ConnNode::new("10.0.0.1", 80);
        // DOWN is not READY: claim must fail, and must leave the bit clear.
        match n.try_claim_ready(Instant::now()) {
            ClaimAttempt::NotReady => {}
            _ => panic!("expected NotReady"),
        }
        assert!(!n.is_locked());

        n.set_state(NodeState::Ready);
        match n.try_claim_ready(Instant::now()) {
            ClaimAttempt::Claimed => {}
            _ => panic!("expected Claimed"),
        }
        assert_eq!(n.state(), NodeState::Active);
        assert!(n.is_locked());
        assert_eq!(n.nr_lookups(), 1);
    }

    #[test]
    fn try_claim_ready_reports_already_locked() {
        let n = ConnNode::new("10.0.0.1", 80);
        n.set_state(NodeState::Ready);
        assert!(n.try_lock());
        match n.try_claim_ready(Instant::now()) {
            ClaimAttempt::AlreadyLocked => {}
            _ => panic!("expected AlreadyLocked"),
        }
    }

    #[test]
    fn mark_retry_then_mark_ready_round_trips() {
        let n = ConnNode::new("10.0.0.1", 80);
        n.set_state(NodeState::Ready);
        assert!(matches!(n.try_claim_ready(Instant::now()), ClaimAttempt::Claimed));
        n.mark_retry();
        assert_eq!(n.state(), NodeState::Retry);
        assert!(n.is_locked(), "mark_retry must keep the lock bit held");
        assert_eq!(n.nr_retry_attempts(), 1);

        n.mark_ready();
        assert_eq!(n.state(), NodeState::Ready);
        assert!(!n.is_locked());
    }

    #[test]
    fn mark_ready_is_noop_outside_retry() {
        let n = ConnNode::new("10.0.0.1", 80);
        n.set_state(NodeState::Down);
        n.mark_ready();
        assert_eq!(n.state(), NodeState::Down);
    }

    #[test]
    fn mark_failed_from_active_sets_state_before_clearing_bit() {
        let n = ConnNode::new("10.0.0.1", 80);
        n.set_state(NodeState::Ready);
        assert!(matches!(n.try_claim_ready(Instant::now()), ClaimAttempt::Claimed));
        n.mark_failed();
        assert_eq!(n.state(), NodeState::Failed);
        assert!(!n.is_locked());
    }

    #[test]
    #[should_panic(expected = "mark_failed")]
    fn mark_failed_panics_outside_active_or_retry() {
        let n = ConnNode::new("10.0.0.1", 80);
        n.set_state(NodeState::Ready);
        n.mark_failed();
    }

    #[test]
    fn finish_active_requires_active_and_leaves_bit_set() {
        let n = ConnNode::new("10.0.0.1", 80);
        n.set_state(NodeState::Ready);
        assert!(matches!(n.try_claim_ready(Instant::now()), ClaimAttempt::Claimed));
        std::thread::sleep(Duration::from_millis(2));
        assert!(n.finish_active(Op::Get));
        assert_eq!(n.state(), NodeState::Ready);
        assert!(n.is_locked(), "finish_active must not clear the bit itself");
        assert!(n.tot_ns_get() > 0, "expected non-zero elapsed checkout time");
    }

    #[test]
    fn finish_active_is_noop_for_non_active_states() {
        let n = ConnNode::new("10.0.0.1", 80);
        n.set_state(NodeState::Failed);
        assert!(!n.finish_active(Op::Put));
        assert_eq!(n.state(), NodeState::Failed);
    }
}
