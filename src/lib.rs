//! Matrix is a framework for building distributed data-acquisition
//! pipelines out of cooperating components.
//!
//! Three pieces carry the architecture:
//!
//! * the **keymaster** ([`keymaster`]) — a hierarchical key/value store
//!   described by a YAML document, with request/reply access and
//!   publish/subscribe change notification down to any subtree;
//! * the **transport layer** ([`transport`]) — factory-dispatched,
//!   reference-shared data channels (networked pub/sub and a lossless
//!   in-process fifo path);
//! * the **architect** ([`architect`]) — reads the configuration out of
//!   the store, instantiates [`component`]s by declared type and drives
//!   them through the shared Standby/Ready/Running lifecycle.
//!
//! Everything runs on plain OS threads; workers cooperate through
//! blocking sockets, bounded fifos and cancellation tokens.

pub mod architect;
pub mod component;
pub mod config;
pub mod error;
pub mod io;
pub mod keymaster;
pub mod prelude;
mod test;
pub mod transport;
pub mod tree;
pub mod utils;
