use std::io;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[cfg(feature = "pool")]
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::key::endpoint_key;
use crate::node::{ConnNode, Op};
use crate::pool::{Claimed, Pool, WaitResult};

/// Fixed bucket count for the connection table's hash index. Fixed at
/// compile time — no resize path exists, per the design's non-goals. Must
/// stay a power of two so bucket selection can mask instead of mod.
pub const BUCKET_COUNT: usize = 64;

fn bucket_index(key: u32) -> usize {
    (key as usize) & (BUCKET_COUNT - 1)
}

struct TableInner {
    buckets: Vec<Vec<Arc<Pool>>>,
}

impl TableInner {
    fn new() -> TableInner {
        TableInner {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
        }
    }

    /// Finds the pool for `(ip, port)`, disambiguating within a bucket
    /// chain by actual endpoint identity rather than key alone, since two
    /// distinct endpoints can share a bucket.
    fn find(&self, key: u32, ip: &str, port: u16) -> Option<&Arc<Pool>> {
        self.buckets[bucket_index(key)]
            .iter()
            .find(|p| p.port() == port && p.ip() == ip)
    }

    fn link_pool(&mut self, key: u32, pool: Arc<Pool>) {
        self.buckets[bucket_index(key)].push(pool);
    }
}

/// A process-wide, hash-indexed set of per-endpoint connection pools.
///
/// One readers-writer lock guards structural mutation and reads of the
/// bucket index; acquire/release traffic within an already-indexed pool
/// takes only that pool's own finer-grained synchronization (see
/// [`crate::pool::Pool`]), so concurrent callers touching different
/// endpoints don't contend on the table lock at all beyond the brief
/// lookup.
pub struct Table {
    inner: RwLock<TableInner>,
}

impl Table {
    /// `init(table)`.
    pub fn new() -> Table {
        Table {
            inner: RwLock::new(TableInner::new()),
        }
    }

    /// `insert(table, node)`: binds a pre-initialized node to the pool for
    /// its `(ip, port)`, allocating that pool if this is the first node
    /// for the endpoint. Pool allocation happens outside the write lock;
    /// if a concurrent insert already created the pool by the time the
    /// write lock is reacquired, the redundant allocation is discarded
    /// rather than producing a duplicate pool (see SPEC_FULL.md §4.3).
    ///
    /// The pool is pinned with `upref_inc()` while the table lock that
    /// found or linked it is still held — never after that lock has been
    /// dropped. Otherwise a concurrent `Table::destroy()` could observe
    /// the pool linked into its bucket but still empty and unreferenced,
    /// between the lookup here and `link_new_node` actually splicing the
    /// node in, and reap it out from under us (spec.md §3: "a pool exists
    /// in the table iff it holds at least one node OR is in the process
    /// of being populated").
    pub fn insert(&self, node: Arc<ConnNode>) -> Result<(), Error> {
        let key = endpoint_key(node.ip(), node.port())?;

        let existing = {
            let guard = self.inner.read().unwrap();
            guard.find(key, node.ip(), node.port()).map(|pool| {
                pool.upref_inc();
                Arc::clone(pool)
            })
        };

        let pool = match existing {
            Some(pool) => pool,
            None => {
                let candidate = Pool::new(node.ip().to_string(), node.port(), key);
                let mut guard = self.inner.write().unwrap();
                match guard.find(key, node.ip(), node.port()) {
                    Some(pool) => {
                        pool.upref_inc();
                        Arc::clone(pool)
                    }
                    None => {
                        candidate.upref_inc();
                        guard.link_pool(key, Arc::clone(&candidate));
                        candidate
                    }
                }
            }
        };

        pool.link_new_node(&node);
        pool.finish_insert();
        #[cfg(feature = "pool")]
        debug!(ip = node.ip(), port = node.port(), "inserted connection node");
        Ok(())
    }

    /// `remove(table, node)`: unlinks a node from its pool. Fails with
    /// [`Error::Busy`] if the node is currently locked (checked out, or
    /// mid-retry). The pool itself is never destroyed here, even if it
    /// becomes empty.
    pub fn remove(&self, node: &Arc<ConnNode>) -> Result<(), Error> {
        let _guard = self.inner.write().unwrap();

        if !node.try_lock() {
            return Err(Error::Busy);
        }
        let state = node.state();
        assert_ne!(
            state,
            crate::node::NodeState::Active,
            "remove: node must not be ACTIVE"
        );

        let was_ready = state == crate::node::NodeState::Ready;
        if let Some(pool) = node.pool() {
            node.set_state(crate::node::NodeState::Zombie);
            pool.unlink_node(node, was_ready);
        }
        node.unlock();
        Ok(())
    }

    /// `peek(table, ip, port)`: the head node of the pool for this
    /// endpoint, without taking the node lock. Advisory only.
    pub fn peek(&self, ip: &str, port: u16) -> Option<Arc<ConnNode>> {
        let key = endpoint_key(ip, port).ok()?;
        let guard = self.inner.read().unwrap();
        guard.find(key, ip, port)?.peek_head()
    }

    /// `iter(table)`: the first node of the first non-empty pool
    /// encountered. Not a general-purpose iterator — intended to drive
    /// external shutdown sweeps that repeatedly call `iter` then `remove`.
    pub fn iter(&self) -> Option<Arc<ConnNode>> {
        let guard = self.inner.read().unwrap();
        for bucket in &guard.buckets {
            for pool in bucket {
                if let Some(node) = pool.peek_head() {
                    return Some(node);
                }
            }
        }
        None
    }

    /// `timed_get(table, ip, port, timeout)`: the central acquire
    /// algorithm. `timeout` replaces the source's signed-tick convention:
    /// `None` waits indefinitely, `Some(Duration::ZERO)` tries once
    /// without blocking, `Some(d)` waits up to `d`.
    pub fn timed_get(&self, ip: &str, port: u16, timeout: Option<Duration>) -> Result<Arc<ConnNode>, Error> {
        let call_start = Instant::now();
        let mut remaining = timeout;

        loop {
            let guard = self.inner.read().unwrap();
            let key = endpoint_key(ip, port)?;
            let pool = match guard.find(key, ip, port) {
                Some(pool) => Arc::clone(pool),
                None => return Err(Error::NotFound),
            };

            match pool.claim(call_start) {
                Claimed::Node(node) => return Ok(node),
                Claimed::NotFound => return Err(Error::NotFound),
                Claimed::AllPathsDown => {
                    #[cfg(feature = "pool")]
                    warn!(ip, port, "timed_get: all paths down");
                    return Err(Error::AllPathsDown);
                }
                Claimed::Busy => {
                    // upref must be bumped while the read lock is still
                    // held, so a concurrent destroy can't remove this pool
                    // between here and the wait below.
                    pool.upref_inc();
                    drop(guard);

                    let outcome = pool.wait_for_idle(remaining);
                    pool.upref_dec();
                    match outcome {
                        WaitResult::TimedOut => return Err(Error::Timeout),
                        WaitResult::Ready(new_remaining) => {
                            remaining = new_remaining;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// `put(table, node, op)`: returns a previously-acquired node. If the
    /// node was `ACTIVE`, attributes elapsed time, makes it `READY` again,
    /// and wakes one waiter. Otherwise (the caller marked it `FAILED`,
    /// `RETRY`, or it was concurrently removed to `ZOMBIE`), just releases
    /// the lock with no counter updates or wakeup.
    pub fn put(&self, node: Arc<ConnNode>, op: Op) {
        let became_ready = node.finish_active(op);
        if became_ready {
            if let Some(pool) = node.pool() {
                pool.release_and_wake(&node);
                return;
            }
        }
        node.unlock();
    }

    /// `destroy(table)`: best-effort teardown. Every pool is drained of
    /// every node it can safely claim (zombifying them); a node that is
    /// currently locked is left in place and logged. A pool that ends up
    /// empty, unreferenced (`upref == 0`), and without waiters is dropped
    /// from the table; any other pool is retained and its retention
    /// logged. Rust's `Arc` refcounting means a retained pool is not
    /// actually leaked — it simply outlives `destroy` until its last
    /// reference (e.g. a node still referencing it via `Weak`) goes away.
    pub fn destroy(&self) {
        let mut guard = self.inner.write().unwrap();
        for bucket in guard.buckets.iter_mut() {
            bucket.retain(|pool| {
                let destroyable = pool.drain_for_destroy();
                if !destroyable {
                    #[cfg(feature = "pool")]
                    error!(
                        ip = pool.ip(),
                        port = pool.port(),
                        nr_connections = pool.nr_connections(),
                        upref = pool.upref(),
                        "destroy: pool not fully drained, retaining"
                    );
                }
                !destroyable
            });
        }
    }

    /// `dump(table, sink)`: one header row, then one whitespace-separated
    /// row per node across every pool.
    pub fn dump<W: io::Write>(&self, sink: &mut W) -> io::Result<()> {
        writeln!(
            sink,
            "HOST STATE RETRIES LOOKUPS WAITS AVG_WAIT(us) AVG_LAT_GET(us) AVG_LAT_PUT(us) SEND(kb) RCV(kb)"
        )?;
        let guard = self.inner.read().unwrap();
        for bucket in &guard.buckets {
            for pool in bucket {
                let nr_waits = pool.nr_waits();
                for node in pool.snapshot_nodes() {
                    node.write_row(sink, nr_waits)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}
