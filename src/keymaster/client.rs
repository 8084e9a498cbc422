use crate::error::MatrixError;
use crate::io::Fifo;
use crate::keymaster::{
    CTRL_QUIT, CTRL_SUBSCRIBE, CTRL_UNSUBSCRIBE, KM_TIMEOUT_MS, PING_REPLY, recv_rest,
};
use crate::tree::TreeResult;
use crate::utils::net::scheme;
use crate::utils::{CancelToken, gen_random_string, shared_context};
use ahash::AHashMap;
use crossbeam::channel as cbchan;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Subscription callback: invoked with the published key and the
/// deserialized node. Shared handles, so the client never holds a
/// non-owning pointer into someone else's object.
pub type KeymasterCallback = Arc<dyn Fn(&str, &Value) + Send + Sync + 'static>;

const SUB_START_RETRIES: usize = 10;
const SUB_START_DELAY: Duration = Duration::from_millis(100);
const PUT_WORKER_POLL: Duration = Duration::from_millis(5);

struct RpcChannel {
    sock: Option<zmq::Socket>,
    timeout_ms: i64,
}

struct SubWorker {
    join: Option<JoinHandle<()>>,
}

struct PutWorker {
    fifo: Fifo<(String, String, bool)>,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

struct KmInner {
    km_url: String,
    pipe_url: String,
    rpc: Mutex<RpcChannel>,
    last: Mutex<TreeResult>,
    callbacks: Arc<Mutex<AHashMap<String, KeymasterCallback>>>,
    sub_worker: Mutex<Option<SubWorker>>,
    put_worker: Mutex<Option<PutWorker>>,
}

/// Client to the keymaster service.
///
/// Cheap to clone; clones share one request socket (RPCs are serialized
/// under a mutex so concurrent callers cannot interleave frames), one
/// subscriber worker and one deferred-put worker. Construction performs no
/// I/O: sockets and workers come up on first use.
///
/// ```no_run
/// use matrix::keymaster::Keymaster;
///
/// let km = Keymaster::new("inproc://matrix.keymaster");
/// let transports: Vec<String> = km.get_as("components.nettask.Transports.A.Specified")?;
/// # anyhow::Ok(())
/// ```
#[derive(Clone)]
pub struct Keymaster {
    inner: Arc<KmInner>,
}

impl Keymaster {
    pub fn new(keymaster_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(KmInner {
                km_url: keymaster_url.into(),
                pipe_url: format!("inproc://{}", gen_random_string(20)),
                rpc: Mutex::new(RpcChannel {
                    sock: None,
                    timeout_ms: KM_TIMEOUT_MS,
                }),
                last: Mutex::new(TreeResult::fail("", "no request made yet")),
                callbacks: Arc::new(Mutex::new(AHashMap::new())),
                sub_worker: Mutex::new(None),
                put_worker: Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.km_url
    }

    /// Per-RPC deadline; the default is 5000 ms.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.rpc.lock().timeout_ms = timeout.as_millis() as i64;
    }

    /// The result record of the most recent RPC.
    pub fn last_result(&self) -> TreeResult {
        self.inner.last.lock().clone()
    }

    /// Liveness probe against the server.
    pub fn ping(&self) -> bool {
        matches!(self.raw_call(&[b"ping".as_slice()]), Ok(reply) if reply == PING_REPLY)
    }

    /// `GET` returning the full result record; `result == false` with the
    /// error text for unknown paths.
    pub fn get_result(&self, key: &str) -> TreeResult {
        self.call_keymaster("GET", key, None, None)
    }

    /// Fetch the node at `key`.
    pub fn get(&self, key: &str) -> anyhow::Result<Value> {
        let r = self.get_result(key);
        if r.result {
            Ok(r.node)
        } else {
            Err(anyhow::anyhow!(r.err))
        }
    }

    /// Fetch and deserialize the node at `key`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let node = self.get(key)?;
        Ok(serde_yaml::from_value(node)?)
    }

    /// Write `node` at `key`; `create` builds missing intermediate nodes.
    pub fn put(&self, key: &str, node: Value, create: bool) -> bool {
        let val = match serde_yaml::to_string(&node) {
            Ok(v) => v,
            Err(e) => {
                *self.inner.last.lock() = TreeResult::fail(key, format!("unserializable value: {e}"));
                return false;
            }
        };
        self.call_keymaster("PUT", key, Some(&val), create.then_some("create"))
            .result
    }

    /// Serialize any serde value and write it at `key`.
    pub fn put_as<T: Serialize>(&self, key: &str, v: T, create: bool) -> bool {
        match serde_yaml::to_value(v) {
            Ok(node) => self.put(key, node, create),
            Err(e) => {
                *self.inner.last.lock() = TreeResult::fail(key, format!("unserializable value: {e}"));
                false
            }
        }
    }

    /// Delete the node at `key`.
    pub fn del(&self, key: &str) -> bool {
        self.call_keymaster("DEL", key, None, None).result
    }

    /// Non-blocking put: the tuple goes onto the deferred-put queue and a
    /// worker writes it out, skipping values identical to the last one
    /// written for the same key. Intended for high-rate status updates.
    pub fn put_nb(&self, key: impl Into<String>, val: impl Into<String>, create: bool) {
        self.ensure_put_worker();
        let guard = self.inner.put_worker.lock();
        if let Some(w) = guard.as_ref()
            && let Err(e) = w.fifo.try_put((key.into(), val.into(), create))
        {
            tracing::warn!("deferred put dropped: {e}");
        }
    }

    /// Subscribe `cb` to publications of `key` (and, through the server's
    /// fan-out, of everything beneath it). An empty key subscribes to the
    /// whole tree (`Root`).
    pub fn subscribe(&self, key: &str, cb: KeymasterCallback) -> Result<(), MatrixError> {
        self.ensure_sub_worker()?;
        let key = if key.is_empty() { "Root" } else { key };
        self.inner.callbacks.lock().insert(key.to_string(), cb);
        self.control_pipe_cmd(CTRL_SUBSCRIBE, Some(key))?;
        Ok(())
    }

    /// Drop the subscription on `key`. No effect if not subscribed.
    pub fn unsubscribe(&self, key: &str) -> Result<(), MatrixError> {
        if self.inner.sub_worker.lock().is_none() {
            return Ok(());
        }
        let key = if key.is_empty() { "Root" } else { key };
        self.control_pipe_cmd(CTRL_UNSUBSCRIBE, Some(key))?;
        self.inner.callbacks.lock().remove(key);
        Ok(())
    }

    /// RPC over the store ("Linda" style): subscribe to `<key>.reply`,
    /// write `params` to `<key>.request`, wait for the service to write
    /// back. The rendezvous keys must already exist.
    pub fn rpc(&self, key: &str, params: Value, timeout: Duration) -> TreeResult {
        let send_key = format!("{key}.request");
        let reply_key = format!("{key}.reply");

        let (tx, rx) = cbchan::bounded::<Value>(2);
        let cb: KeymasterCallback = Arc::new(move |_k, v| {
            let _ = tx.try_send(v.clone());
        });

        if let Err(e) = self.subscribe(&reply_key, cb) {
            return TreeResult::fail(key, e.to_string());
        }

        let mut reply = TreeResult::fail(key, "Time-out when talking to Keymaster.");
        if self.put(&send_key, params, false)
            && let Ok(v) = rx.recv_timeout(timeout)
        {
            reply = TreeResult::ok(key, v);
        }

        if let Err(e) = self.unsubscribe(&reply_key) {
            tracing::warn!("unable to unsubscribe from {reply_key}: {e}");
        }

        reply
    }

    // ---- internals

    fn call_keymaster(
        &self,
        cmd: &str,
        key: &str,
        val: Option<&str>,
        flag: Option<&str>,
    ) -> TreeResult {
        let mut frames: Vec<&[u8]> = vec![cmd.as_bytes(), key.as_bytes()];
        if let Some(v) = val {
            frames.push(v.as_bytes());
        }
        if let Some(f) = flag {
            frames.push(f.as_bytes());
        }

        let r = match self.raw_call(&frames) {
            Ok(reply) => TreeResult::from_yaml(&reply),
            Err(e) => TreeResult::fail(
                key,
                format!(
                    "Failed to {cmd} key '{key}' from Keymaster at {}: {e}",
                    self.inner.km_url
                ),
            ),
        };

        *self.inner.last.lock() = r.clone();
        r
    }

    /// One serialized REQ/REP exchange. A recoverable failure closes and
    /// drops the socket so the next call reconnects from a clean state; a
    /// fatal one (terminated context) just abandons it.
    fn raw_call(&self, frames: &[&[u8]]) -> Result<String, MatrixError> {
        let mut ch = self.inner.rpc.lock();
        let timeout_ms = ch.timeout_ms as i32;

        if ch.sock.is_none() {
            let s = shared_context().socket(zmq::REQ)?;
            s.set_linger(0)?;
            s.connect(&self.inner.km_url)?;
            ch.sock = Some(s);
        }

        let result = (|| {
            let sock = ch.sock.as_ref().expect("socket created above");
            sock.set_sndtimeo(timeout_ms)?;
            sock.set_rcvtimeo(timeout_ms)?;

            for (i, f) in frames.iter().enumerate() {
                let flags = if i + 1 == frames.len() { 0 } else { zmq::SNDMORE };
                sock.send(*f, flags)?;
            }

            let reply = sock.recv_bytes(0)?;
            let _ = recv_rest(sock);
            Ok::<_, zmq::Error>(String::from_utf8_lossy(&reply).into_owned())
        })();

        match result {
            Ok(r) => Ok(r),
            Err(e) => {
                let e = MatrixError::from(e);
                let sock = ch.sock.take();
                if e.is_recoverable() {
                    // close-and-reset: the next call reconnects cleanly
                    if let Some(s) = sock {
                        let _ = s.set_linger(0);
                    }
                } else {
                    // terminated context: no clean reset is possible
                    drop(sock);
                }
                Err(e)
            }
        }
    }

    fn control_pipe_cmd(&self, cmd: &str, key: Option<&str>) -> Result<(), MatrixError> {
        let pipe = shared_context().socket(zmq::REQ)?;
        pipe.set_linger(0)?;
        pipe.set_sndtimeo(2000)?;
        pipe.set_rcvtimeo(2000)?;
        pipe.connect(&self.inner.pipe_url)?;

        match key {
            Some(k) => {
                pipe.send(cmd, zmq::SNDMORE)?;
                pipe.send(k, 0)?;
            }
            None => pipe.send(cmd, 0)?,
        }

        pipe.recv_bytes(0)?;
        Ok(())
    }

    /// Start the subscriber worker if needed. Fetching the publish URLs is
    /// retried to ride out the server's own startup.
    fn ensure_sub_worker(&self) -> Result<(), MatrixError> {
        let mut guard = self.inner.sub_worker.lock();
        if guard.is_some() {
            return Ok(());
        }

        let mut pub_urls: Vec<String> = Vec::new();
        for attempt in 0..SUB_START_RETRIES {
            match self.get_as::<Vec<String>>("Keymaster.URLS.AsConfigured.Pub") {
                Ok(urls) => {
                    pub_urls = urls;
                    break;
                }
                Err(e) if attempt + 1 == SUB_START_RETRIES => {
                    return Err(MatrixError::transport(format!(
                        "unable to obtain the Keymaster publishing URLs: {e}"
                    )));
                }
                Err(_) => thread::sleep(SUB_START_DELAY),
            }
        }

        // connect over the same kind of endpoint the request socket uses
        let wanted = scheme(&self.inner.km_url).to_string();
        let pub_url = pub_urls
            .iter()
            .find(|u| scheme(u) == wanted)
            .cloned()
            .ok_or_else(|| {
                MatrixError::transport("Publisher URL transport mismatch with the keymaster")
            })?;

        let (ready_tx, ready_rx) = cbchan::bounded(1);
        let pipe_url = self.inner.pipe_url.clone();
        let callbacks = Arc::clone(&self.inner.callbacks);

        let join = thread::Builder::new()
            .name("km-subscriber".into())
            .spawn(move || subscriber_task(pub_url, pipe_url, callbacks, ready_tx))
            .map_err(|e| MatrixError::fatal(format!("cannot spawn subscriber: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => {
                *guard = Some(SubWorker { join: Some(join) });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(MatrixError::fatal("subscriber thread did not start")),
        }
    }

    fn ensure_put_worker(&self) {
        let mut guard = self.inner.put_worker.lock();
        if guard.is_some() {
            return;
        }

        let fifo: Fifo<(String, String, bool)> = Fifo::bounded(1000);
        let cancel = CancelToken::new_root();

        let worker_fifo = fifo.clone();
        let worker_cancel = cancel.clone();
        // a dedicated connection: deferred status traffic never contends
        // with callers on the shared request socket
        let km = Keymaster::new(self.inner.km_url.clone());

        let join = thread::Builder::new()
            .name("km-put".into())
            .spawn(move || put_task(km, worker_fifo, worker_cancel))
            .ok();

        *guard = Some(PutWorker {
            fifo,
            cancel,
            join,
        });
    }
}

impl Drop for KmInner {
    fn drop(&mut self) {
        if let Some(mut w) = self.sub_worker.lock().take() {
            if let Ok(pipe) = shared_context().socket(zmq::REQ) {
                let _ = pipe.set_linger(0);
                let _ = pipe.set_sndtimeo(1000);
                let _ = pipe.set_rcvtimeo(1000);
                if pipe.connect(&self.pipe_url).is_ok() && pipe.send(CTRL_QUIT, 0).is_ok() {
                    let _ = pipe.recv_bytes(0);
                }
            }
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }

        if let Some(mut w) = self.put_worker.lock().take() {
            w.cancel.cancel();
            w.fifo.release();
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }

        if let Some(s) = self.rpc.lock().sock.take() {
            let _ = s.set_linger(0);
        }
    }
}

/// Subscriber worker: polls the control pipe and the SUB socket so the
/// subscription socket is only ever touched from this thread. Callbacks
/// run here, asynchronously from client code.
fn subscriber_task(
    pub_url: String,
    pipe_url: String,
    callbacks: Arc<Mutex<AHashMap<String, KeymasterCallback>>>,
    ready: cbchan::Sender<Result<(), MatrixError>>,
) {
    let setup = || -> Result<(zmq::Socket, zmq::Socket), MatrixError> {
        let sub_sock = shared_context().socket(zmq::SUB)?;
        sub_sock.connect(&pub_url)?;
        let pipe = shared_context().socket(zmq::REP)?;
        pipe.bind(&pipe_url)?;
        Ok((sub_sock, pipe))
    };

    let (sub_sock, pipe) = match setup() {
        Ok(socks) => socks,
        Err(e) => {
            tracing::error!("subscriber setup failed (pub={pub_url}): {e}");
            let _ = ready.send(Err(e));
            return;
        }
    };

    let _ = ready.send(Ok(()));

    'outer: loop {
        let mut items = [
            pipe.as_poll_item(zmq::POLLIN),
            sub_sock.as_poll_item(zmq::POLLIN),
        ];

        match zmq::poll(&mut items, -1) {
            Ok(_) => {}
            Err(zmq::Error::ETERM) => return,
            Err(e) => {
                tracing::error!("subscriber poll: {e}");
                break;
            }
        }

        if items[0].is_readable() {
            let handled = (|| -> Result<bool, zmq::Error> {
                let cmd = pipe.recv_bytes(0)?;
                let frames = recv_rest(&pipe)?;
                let key = frames.first().map(String::as_str).unwrap_or("");

                match cmd.as_slice() {
                    c if c == CTRL_SUBSCRIBE.as_bytes() => {
                        sub_sock.set_subscribe(key.as_bytes())?;
                        pipe.send("1", 0)?;
                        Ok(true)
                    }
                    c if c == CTRL_UNSUBSCRIBE.as_bytes() => {
                        sub_sock.set_unsubscribe(key.as_bytes())?;
                        pipe.send("1", 0)?;
                        Ok(true)
                    }
                    _ => {
                        pipe.send("0", 0)?;
                        Ok(false)
                    }
                }
            })();

            match handled {
                Ok(true) => {}
                Ok(false) => break 'outer,
                Err(zmq::Error::ETERM) => return,
                Err(e) => {
                    tracing::error!("subscriber control pipe: {e}");
                    break 'outer;
                }
            }
        }

        if items[1].is_readable() {
            let received = (|| -> Result<(), zmq::Error> {
                let topic = sub_sock.recv_bytes(0)?;
                let frames = recv_rest(&sub_sock)?;

                if let Some(payload) = frames.first() {
                    let key = String::from_utf8_lossy(&topic).into_owned();
                    let cb = callbacks.lock().get(&key).cloned();
                    if let Some(cb) = cb {
                        match serde_yaml::from_str::<Value>(payload) {
                            Ok(node) => cb(&key, &node),
                            Err(e) => tracing::warn!("undecodable publication on '{key}': {e}"),
                        }
                    }
                }
                Ok(())
            })();

            match received {
                Ok(()) => {}
                Err(zmq::Error::ETERM) => return,
                Err(e) => {
                    tracing::error!("subscriber data socket: {e}");
                    break 'outer;
                }
            }
        }
    }

    let _ = pipe.set_linger(0);
    let _ = sub_sock.set_linger(0);
}

/// Deferred-put worker: drains the queue, memoizes the last value written
/// per key and skips duplicates so high-rate status updates don't flood
/// the server.
fn put_task(km: Keymaster, fifo: Fifo<(String, String, bool)>, cancel: CancelToken) {
    let mut memo: AHashMap<String, String> = AHashMap::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match fifo.timed_get(PUT_WORKER_POLL) {
            Ok((key, val, create)) => {
                let create = match memo.get(&key) {
                    Some(prev) if *prev == val => continue,
                    Some(_) => false,
                    None => create,
                };
                memo.insert(key.clone(), val.clone());
                if !km.put(&key, Value::String(val), create) {
                    tracing::warn!("deferred put of '{key}' failed: {}", km.last_result().err);
                }
            }
            Err(crate::error::RecvError::Disconnected) => break,
            Err(_) => {}
        }
    }
}
