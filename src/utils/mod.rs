pub use cancel_token::*;

mod cancel_token;
pub mod logger;
pub mod net;
pub mod time;

use rand::Rng;
use rand::distr::Alphanumeric;
use std::sync::OnceLock;

/// Random alphanumeric string, used for ephemeral endpoint names and
/// control-pipe addresses.
pub fn gen_random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// The process-wide 0MQ context. `inproc` endpoints only rendezvous
/// within one context, so every socket in the process shares this one.
pub fn shared_context() -> &'static zmq::Context {
    static CTX: OnceLock<zmq::Context> = OnceLock::new();
    CTX.get_or_init(zmq::Context::new)
}
