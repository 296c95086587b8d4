//! A concurrent connection pool registry keyed by remote endpoint.
//!
//! Connections are grouped into per-`(ip, port)` pools inside a single
//! fixed-size hash table ([`Table`]). Callers check a node out with
//! [`Table::timed_get`], use it, and return it with [`Table::put`]; a
//! bounded or unbounded wait queue absorbs contention when every node for
//! an endpoint is busy. See `SPEC_FULL.md` in the repository root for the
//! full design.
//!
//! The entire subsystem sits behind the `pool` feature (enabled by
//! default), which also gates the `tracing` dependency.

#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "pool")]
mod error;
#[cfg(feature = "pool")]
mod key;
#[cfg(feature = "pool")]
mod node;
#[cfg(feature = "pool")]
mod pool;
#[cfg(feature = "pool")]
mod table;

#[cfg(feature = "pool")]
pub use error::Error;
#[cfg(feature = "pool")]
pub use node::{ConnNode, NodeState, Op};
#[cfg(feature = "pool")]
pub use table::{Table, BUCKET_COUNT};
