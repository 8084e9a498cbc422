//! The keymaster: a hierarchical publish/subscribe key/value store.
//!
//! [`KeymasterServer`] owns the value tree and serves a REQ/REP protocol
//! (`GET`/`PUT`/`DEL`/`ping`) next to a PUB socket that broadcasts every
//! change to the mutated path and all of its ancestors. [`Keymaster`] is
//! the client: thread-safe RPC, asynchronous subscriptions with per-key
//! callbacks, and a deferred-put lane for high-rate status updates.

mod client;
mod server;

pub use client::{Keymaster, KeymasterCallback};
pub use server::KeymasterServer;

/// Default RPC timeout, milliseconds.
pub(crate) const KM_TIMEOUT_MS: i64 = 5000;

pub(crate) const PING_REPLY: &str = "I'm not dead yet!";

/// Control-pipe verbs for subscriber workers.
pub(crate) const CTRL_SUBSCRIBE: &str = "SUBSCRIBE";
pub(crate) const CTRL_UNSUBSCRIBE: &str = "UNSUBSCRIBE";
pub(crate) const CTRL_QUIT: &str = "QUIT";

/// Read the remaining frames of a partially received multipart message.
/// Must be called right after the first frame; never blocks for a new
/// message.
pub(crate) fn recv_rest(sock: &zmq::Socket) -> Result<Vec<String>, zmq::Error> {
    let mut frames = Vec::new();
    while sock.get_rcvmore()? {
        let bytes = sock.recv_bytes(0)?;
        frames.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(frames)
}
