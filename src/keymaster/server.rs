use crate::config;
use crate::error::MatrixError;
use crate::io::Fifo;
use crate::keymaster::{KM_TIMEOUT_MS, PING_REPLY, recv_rest};
use crate::tree::{self, TreeResult};
use crate::utils::net::{bind_endpoint, canonical_hostname, derive_pub_url, most_local, scheme};
use crate::utils::{CancelToken, gen_random_string, shared_context, time};
use crossbeam::channel as cbchan;
use serde_yaml::Value;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long `run()` waits for each worker to come up.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Settle time between the publisher binding and its first send, giving
/// already-subscribed clients a window to reconnect after a restart.
const PUB_SETTLE: Duration = Duration::from_millis(500);

/// The keymaster server: three workers around one value tree.
///
/// * the *state manager* owns the tree exclusively and answers the
///   REQ/REP protocol;
/// * the *publisher* drains a queue of (topic, payload) pairs onto the
///   PUB socket;
/// * the *heartbeat* writes the UTC time to `Keymaster.heartbeat` once a
///   second through the regular protocol.
///
/// The initial tree state is the loaded configuration document.
pub struct KeymasterServer {
    state_urls: Vec<String>,
    pub_urls: Vec<String>,
    realized_state_urls: Vec<String>,
    hostname: String,
    state_pipe_url: String,
    data_queue: Fifo<(String, String)>,
    cancel: CancelToken,
    threads: Vec<JoinHandle<()>>,
    seed: Option<Value>,
}

impl KeymasterServer {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, MatrixError> {
        Self::new(config::load_config_file(path)?)
    }

    /// Build the server from a configuration tree. Validates
    /// `Keymaster.URLS.Initial` and derives the publish endpoints; nothing
    /// binds until [`run`](Self::run).
    pub fn new(seed: Value) -> Result<Self, MatrixError> {
        let initial: Vec<String> = config::require(&seed, "Keymaster.URLS.Initial")?;
        if initial.is_empty() {
            return Err(MatrixError::config("Keymaster.URLS.Initial is empty"));
        }

        // Accepted for configuration compatibility; with this tree
        // representation there is no allocator growth to flush.
        let _clone_interval: u64 = config::optional(&seed, "Keymaster.clone_interval", 1000)?;

        let mut state_urls = Vec::with_capacity(initial.len() + 1);
        let mut pub_urls = Vec::with_capacity(initial.len());

        for url in &initial {
            let url = url.to_lowercase();
            pub_urls.push(derive_pub_url(&url)?);
            state_urls.push(url);
        }

        // The heartbeat and in-process clients always get a local
        // endpoint, even when only tcp was configured.
        if !state_urls.iter().any(|u| scheme(u) == "inproc") {
            state_urls.push(format!("inproc://{}", gen_random_string(20)));
        }

        let hostname = if state_urls.iter().any(|u| scheme(u) == "tcp") {
            canonical_hostname()
        } else {
            String::new()
        };

        Ok(Self {
            state_urls,
            pub_urls,
            realized_state_urls: Vec::new(),
            hostname,
            state_pipe_url: format!("inproc://{}", gen_random_string(20)),
            data_queue: Fifo::bounded(1000),
            cancel: CancelToken::new_root(),
            threads: Vec::new(),
            seed: Some(seed),
        })
    }

    /// Realized request/reply endpoints, available after [`run`](Self::run).
    pub fn state_urls(&self) -> &[String] {
        &self.realized_state_urls
    }

    /// Start the worker threads. Strict order: publisher first (the state
    /// manager records its realized endpoints), then the state manager,
    /// then the heartbeat. Returns once all three are up.
    pub fn run(&mut self) -> Result<(), MatrixError> {
        let tree = self
            .seed
            .take()
            .ok_or_else(|| MatrixError::fatal("KeymasterServer::run called twice"))?;

        // -- publisher
        let (pub_ready_tx, pub_ready_rx) = cbchan::bounded(1);
        {
            let urls = self.pub_urls.clone();
            let host = self.hostname.clone();
            let queue = self.data_queue.clone();
            let cancel = self.cancel.new_child();
            self.threads.push(
                thread::Builder::new()
                    .name("km-pub".into())
                    .spawn(move || publisher_task(urls, host, queue, cancel, pub_ready_tx))
                    .map_err(|e| MatrixError::fatal(format!("cannot spawn publisher: {e}")))?,
            );
        }
        let realized_pub_urls = pub_ready_rx
            .recv_timeout(READY_TIMEOUT)
            .map_err(|_| MatrixError::fatal("timed out waiting for publishing thread"))??;

        // -- state manager
        let (state_ready_tx, state_ready_rx) = cbchan::bounded(1);
        {
            let urls = self.state_urls.clone();
            let host = self.hostname.clone();
            let queue = self.data_queue.clone();
            let pipe_url = self.state_pipe_url.clone();
            self.threads.push(
                thread::Builder::new()
                    .name("km-state".into())
                    .spawn(move || {
                        state_manager_task(
                            tree,
                            urls,
                            realized_pub_urls,
                            host,
                            queue,
                            pipe_url,
                            state_ready_tx,
                        )
                    })
                    .map_err(|e| MatrixError::fatal(format!("cannot spawn state manager: {e}")))?,
            );
        }
        self.realized_state_urls = state_ready_rx
            .recv_timeout(READY_TIMEOUT)
            .map_err(|_| MatrixError::fatal("timed out waiting for state manager thread"))??;

        // -- heartbeat
        {
            let urls = self.realized_state_urls.clone();
            let cancel = self.cancel.new_child();
            self.threads.push(
                thread::Builder::new()
                    .name("km-heartbeat".into())
                    .spawn(move || heartbeat_task(urls, cancel))
                    .map_err(|e| MatrixError::fatal(format!("cannot spawn heartbeat: {e}")))?,
            );
        }

        tracing::info!(state = ?self.realized_state_urls, "keymaster server running");
        Ok(())
    }

    /// Cooperative shutdown: sentinel to the state manager, queue release
    /// for the publisher, cancel for the heartbeat; joins all workers.
    pub fn terminate(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        self.cancel.cancel();

        if let Ok(pipe) = shared_context().socket(zmq::PAIR) {
            let _ = pipe.set_sndtimeo(1000);
            if pipe.connect(&self.state_pipe_url).is_ok() {
                let _ = pipe.send("quit", 0);
            }
        }

        self.data_queue.release();

        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for KeymasterServer {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Enqueue publications for `keychain` and every ancestor, shortest prefix
/// first; the empty keychain publishes the whole tree under `Root`.
/// Returns false when a non-blocking enqueue was dropped on a full queue.
fn publish_prefixes(
    root: &Value,
    queue: &Fifo<(String, String)>,
    keychain: &str,
    block: bool,
    cancel: &CancelToken,
) -> bool {
    let mut all_queued = true;

    let mut enqueue = |key: String, val: String| {
        if block {
            if queue.put((key, val), cancel, None).is_err() {
                all_queued = false;
            }
        } else if let Err(e) = queue.try_put((key, val)) {
            tracing::warn!("publication dropped: {e}");
            all_queued = false;
        }
    };

    if keychain.is_empty() {
        match serde_yaml::to_string(root) {
            Ok(val) => enqueue("Root".to_string(), val),
            Err(e) => {
                tracing::error!("cannot serialize root for publication: {e}");
                return false;
            }
        }
        return all_queued;
    }

    let segs: Vec<&str> = keychain.split('.').collect();
    for i in 1..=segs.len() {
        let key = segs[..i].join(".");
        let r = tree::get_node(root, &key);
        if r.result {
            match serde_yaml::to_string(&r.node) {
                Ok(val) => enqueue(key, val),
                Err(e) => tracing::error!("cannot serialize '{key}' for publication: {e}"),
            }
        }
    }

    all_queued
}

fn publisher_task(
    urls: Vec<String>,
    host: String,
    queue: Fifo<(String, String)>,
    cancel: CancelToken,
    ready: cbchan::Sender<Result<Vec<String>, MatrixError>>,
) {
    let sock = match shared_context().socket(zmq::PUB) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let mut realized = Vec::with_capacity(urls.len());
    for url in &urls {
        match bind_endpoint(&sock, url, &host) {
            Ok(u) => realized.push(u),
            Err(e) if url.starts_with("tcp://") => {
                // Derived port (state + 1) may already be taken; fall back
                // to an ephemeral one rather than failing bring-up.
                tracing::warn!("publisher bind {url} failed ({e}), using ephemeral port");
                match bind_endpoint(&sock, "tcp://*:*", &host) {
                    Ok(u) => realized.push(u),
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        }
    }

    let _ = ready.send(Ok(realized));

    cancel.sleep_cancellable(PUB_SETTLE);

    loop {
        let (key, val) = match queue.get(&cancel, None) {
            Ok(dp) => dp,
            Err(_) => break,
        };

        if let Err(e) = sock
            .send(key.as_bytes(), zmq::SNDMORE)
            .and_then(|_| sock.send(val.as_bytes(), 0))
        {
            if e == zmq::Error::ETERM {
                // context gone, nothing left to close cleanly
                return;
            }
            tracing::error!("publisher send failed for '{key}': {e}");
        }
    }

    let _ = sock.set_linger(0);
}

#[allow(clippy::too_many_arguments)]
fn state_manager_task(
    mut root: Value,
    urls: Vec<String>,
    pub_urls: Vec<String>,
    host: String,
    queue: Fifo<(String, String)>,
    pipe_url: String,
    ready: cbchan::Sender<Result<Vec<String>, MatrixError>>,
) {
    let cancel = CancelToken::new_root();

    let pipe = match shared_context().socket(zmq::PAIR) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    if let Err(e) = pipe.bind(&pipe_url) {
        let _ = ready.send(Err(MatrixError::transport(format!(
            "state manager control pipe bind failed: {e}"
        ))));
        return;
    }

    let state_sock = match shared_context().socket(zmq::REP) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let mut realized = Vec::with_capacity(urls.len());
    for url in &urls {
        match bind_endpoint(&state_sock, url, &host) {
            Ok(u) => realized.push(u),
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        }
    }

    // Record the realized endpoints in the store and broadcast them, then
    // the whole tree so pre-existing subscribers resynchronize.
    let urls_node = |v: &Vec<String>| serde_yaml::to_value(v).unwrap_or(Value::Null);

    let rs = tree::put_node(
        &mut root,
        "KeymasterServer.URLS",
        urls_node(&realized),
        true,
    );
    publish_prefixes(&root, &queue, "KeymasterServer.URLS", true, &cancel);

    let r1 = tree::put_node(
        &mut root,
        "Keymaster.URLS.AsConfigured.State",
        urls_node(&realized),
        true,
    );
    let r2 = tree::put_node(
        &mut root,
        "Keymaster.URLS.AsConfigured.Pub",
        urls_node(&pub_urls),
        true,
    );
    publish_prefixes(&root, &queue, "Keymaster.URLS.AsConfigured.State", true, &cancel);
    publish_prefixes(&root, &queue, "Keymaster.URLS.AsConfigured.Pub", true, &cancel);
    publish_prefixes(&root, &queue, "", true, &cancel);

    if !(rs.result && r1.result && r2.result) {
        let _ = ready.send(Err(MatrixError::fatal(
            "error storing configured URLs into the root node",
        )));
        return;
    }

    let _ = ready.send(Ok(realized));

    loop {
        let mut items = [
            pipe.as_poll_item(zmq::POLLIN),
            state_sock.as_poll_item(zmq::POLLIN),
        ];

        match zmq::poll(&mut items, -1) {
            Ok(_) => {}
            Err(zmq::Error::ETERM) => return,
            Err(e) => {
                tracing::error!("state manager poll: {e}");
                continue;
            }
        }

        if items[0].is_readable() {
            let _ = pipe.recv_bytes(0);
            break;
        }

        if items[1].is_readable()
            && let Err(e) = serve_request(&state_sock, &mut root, &queue, &cancel)
        {
            if e == zmq::Error::ETERM {
                return;
            }
            tracing::error!("state manager request: {e}");
        }
    }

    let _ = state_sock.set_linger(0);
    let _ = pipe.set_linger(0);
}

/// One REQ/REP exchange: `ping`, `GET`, `PUT`, `DEL`, or the legacy
/// unknown-command reply.
fn serve_request(
    sock: &zmq::Socket,
    root: &mut Value,
    queue: &Fifo<(String, String)>,
    cancel: &CancelToken,
) -> Result<(), zmq::Error> {
    let cmd = sock.recv_bytes(0)?;
    let cmd = String::from_utf8_lossy(&cmd).into_owned();
    let frames = recv_rest(sock)?;

    match cmd.as_str() {
        "ping" => sock.send(PING_REPLY, 0),
        "GET" => {
            let Some(keychain) = frames.first() else {
                return sock.send("ERROR: Keychain expected, but not received!", 0);
            };
            let keychain = if keychain == "Root" { "" } else { keychain.as_str() };
            let r = tree::get_node(root, keychain);
            sock.send(r.to_yaml().as_bytes(), 0)
        }
        "PUT" => {
            if frames.len() < 2 {
                return sock.send("ERROR: Keychain and value expected, but not received!", 0);
            }
            let keychain = if frames[0] == "Root" { "" } else { frames[0].as_str() };
            let create = frames.get(2).is_some_and(|f| f == "create");

            let r = match serde_yaml::from_str::<Value>(&frames[1]) {
                Ok(node) => {
                    let r = tree::put_node(root, keychain, node, create);
                    if r.result {
                        publish_prefixes(root, queue, keychain, false, cancel);
                    }
                    r
                }
                Err(e) => TreeResult::fail(keychain, format!("invalid value: {e}")),
            };
            sock.send(r.to_yaml().as_bytes(), 0)
        }
        "DEL" => {
            let Some(keychain) = frames.first() else {
                return sock.send("ERROR: Keychain expected, but not received!", 0);
            };
            let r = tree::delete_node(root, keychain);
            let reply = sock.send(r.to_yaml().as_bytes(), 0);
            if r.result {
                // the deleted node is gone; surviving ancestors still go out
                publish_prefixes(root, queue, keychain, true, cancel);
            }
            reply
        }
        _ => {
            // compatibility: the reply keeps the historical missing quote
            sock.send(format!("Unknown request '{cmd}").as_bytes(), 0)
        }
    }
}

fn heartbeat_task(state_urls: Vec<String>, cancel: CancelToken) {
    let Some(url) = most_local(&state_urls).map(str::to_string) else {
        tracing::error!("heartbeat: no state URL to connect to");
        return;
    };

    let one_sec_ns: i64 = 1_000_000_000;
    let mut wake_ns = time::utc_ns() + one_sec_ns;
    let mut sock: Option<zmq::Socket> = None;

    while cancel.sleep_cancellable(Duration::from_secs(1)) {
        // payload is the scheduled wake time, keeping the published series
        // monotonic even when an RPC stalls
        let val = wake_ns.to_string();
        wake_ns += one_sec_ns;

        if sock.is_none() {
            match connect_req(&url) {
                Ok(s) => sock = Some(s),
                Err(e) => {
                    tracing::error!("heartbeat: cannot connect to {url}: {e}");
                    continue;
                }
            }
        }
        let s = sock.as_ref().expect("connected above");

        let sent = s
            .send("PUT", zmq::SNDMORE)
            .and_then(|_| s.send("Keymaster.heartbeat", zmq::SNDMORE))
            .and_then(|_| s.send(val.as_bytes(), zmq::SNDMORE))
            .and_then(|_| s.send("create", 0))
            .and_then(|_| s.recv_bytes(0));

        if let Err(e) = sent {
            if e == zmq::Error::ETERM {
                return;
            }
            tracing::error!("heartbeat: {e}");
            // REQ sockets wedge after a missed reply; reset and reconnect
            if let Some(s) = sock.take() {
                let _ = s.set_linger(0);
            }
        }
    }

    if let Some(s) = sock.take() {
        let _ = s.set_linger(0);
    }
}

fn connect_req(url: &str) -> Result<zmq::Socket, zmq::Error> {
    let s = shared_context().socket(zmq::REQ)?;
    s.set_sndtimeo(KM_TIMEOUT_MS as i32)?;
    s.set_rcvtimeo(KM_TIMEOUT_MS as i32)?;
    s.connect(url)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_config_without_urls() {
        let cfg = config::load_config_str("Keymaster: {clone_interval: 10}").unwrap();
        assert!(matches!(
            KeymasterServer::new(cfg),
            Err(MatrixError::Config(_))
        ));
    }

    #[test]
    fn derives_publisher_urls_and_local_endpoint() {
        let cfg = config::load_config_str(
            "Keymaster:\n  URLS:\n    Initial: ['tcp://*:43210']\n",
        )
        .unwrap();
        let server = KeymasterServer::new(cfg).unwrap();
        assert_eq!(server.pub_urls, vec!["tcp://*:43211".to_string()]);
        // a random inproc endpoint is appended when none was given
        assert!(server.state_urls.iter().any(|u| u.starts_with("inproc://")));
    }

    #[test]
    fn prefix_publication_covers_all_ancestors() {
        let root: Value =
            serde_yaml::from_str("a:\n  b:\n    c: 42\n").unwrap();
        let queue = Fifo::bounded(16);
        let cancel = CancelToken::new_root();

        assert!(publish_prefixes(&root, &queue, "a.b.c", false, &cancel));

        let topics: Vec<String> = std::iter::from_fn(|| queue.try_get().ok())
            .map(|(k, _)| k)
            .collect();
        assert_eq!(topics, vec!["a", "a.b", "a.b.c"]);
    }

    #[test]
    fn root_publication_uses_root_topic() {
        let root: Value = serde_yaml::from_str("x: 1\n").unwrap();
        let queue = Fifo::bounded(4);
        let cancel = CancelToken::new_root();
        publish_prefixes(&root, &queue, "", false, &cancel);
        let (topic, payload) = queue.try_get().unwrap();
        assert_eq!(topic, "Root");
        let parsed: Value = serde_yaml::from_str(&payload).unwrap();
        assert_eq!(parsed, root);
    }
}
