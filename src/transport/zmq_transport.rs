//! Networked pub/sub transport over 0MQ (`tcp`, `ipc`, `inproc`).
//!
//! Lossy by design: a slow subscriber drops messages rather than stalling
//! the publisher. Topic matching is prefix-based on the wire; the client
//! dispatches on the exact subscribed key.

use crate::error::MatrixError;
use crate::keymaster::Keymaster;
use crate::transport::{DataCallback, TransportClient, TransportServer};
use crate::utils::net::{bind_endpoint, canonical_hostname, expand_specifier, scheme};
use crate::utils::{gen_random_string, shared_context};
use ahash::AHashMap;
use crossbeam::channel as cbchan;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CTRL_SUBSCRIBE: &str = "SUBSCRIBE";
const CTRL_UNSUBSCRIBE: &str = "UNSUBSCRIBE";
const CTRL_QUIT: &str = "QUIT";

fn recv_rest_bytes(sock: &zmq::Socket) -> Result<Vec<Vec<u8>>, zmq::Error> {
    let mut frames = Vec::new();
    while sock.get_rcvmore()? {
        frames.push(sock.recv_bytes(0)?);
    }
    Ok(frames)
}

/// Publishing end. Construction reads the `Specified` endpoint list from
/// the store, binds all of them (all-or-nothing) and records the realized
/// URLs under `…AsConfigured`.
pub struct ZmqTransportServer {
    km_url: String,
    transport_key: String,
    urls: Vec<String>,
    pub_sock: Mutex<zmq::Socket>,
}

impl ZmqTransportServer {
    pub fn create(km_url: &str, transport_key: &str) -> Result<Arc<Self>, MatrixError> {
        let km = Keymaster::new(km_url);
        let specified: Vec<String> = km
            .get_as(&format!("{transport_key}.Specified"))
            .map_err(|e| MatrixError::creation(format!("cannot read '{transport_key}': {e}")))?;

        if specified.is_empty() {
            return Err(MatrixError::creation(format!(
                "'{transport_key}.Specified' lists no transports"
            )));
        }

        let expanded: Vec<String> = specified.iter().map(|s| expand_specifier(s)).collect();

        let host = if expanded.iter().any(|u| scheme(u) == "tcp") {
            canonical_hostname()
        } else {
            String::new()
        };

        let sock = shared_context()
            .socket(zmq::PUB)
            .map_err(MatrixError::from)?;
        sock.set_linger(0).map_err(MatrixError::from)?;

        let mut urls = Vec::with_capacity(expanded.len());
        for url in &expanded {
            match bind_endpoint(&sock, url, &host) {
                Ok(u) => urls.push(u),
                Err(e) => {
                    return Err(MatrixError::creation(format!(
                        "Cannot use one or more of the following transports {}: {e}",
                        specified.join(", ")
                    )));
                }
            }
        }

        if !km.put_as(&format!("{transport_key}.AsConfigured"), &urls, true) {
            return Err(MatrixError::creation(format!(
                "cannot record realized URLs for '{transport_key}': {}",
                km.last_result().err
            )));
        }

        Ok(Arc::new(Self {
            km_url: km_url.to_string(),
            transport_key: transport_key.to_string(),
            urls,
            pub_sock: Mutex::new(sock),
        }))
    }
}

impl TransportServer for ZmqTransportServer {
    fn urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn publish(&self, key: &str, data: &[u8]) -> Result<(), MatrixError> {
        let sock = self.pub_sock.lock();
        sock.send(key.as_bytes(), zmq::SNDMORE)
            .and_then(|_| sock.send(data, 0))
            .map_err(|e| {
                tracing::error!("publish of '{key}' failed: {e}");
                e.into()
            })
    }
}

impl Drop for ZmqTransportServer {
    fn drop(&mut self) {
        // the endpoint is gone with us; withdraw the advertisement
        let km = Keymaster::new(self.km_url.clone());
        km.set_timeout(Duration::from_millis(1000));
        km.del(&format!("{}.AsConfigured", self.transport_key));
    }
}

struct ClientState {
    connected: bool,
    join: Option<JoinHandle<()>>,
}

/// Receiving end: one subscriber worker per client, fed subscribe and
/// unsubscribe requests over a control pipe so the SUB socket stays on a
/// single thread.
pub struct ZmqTransportClient {
    url: String,
    pipe_url: String,
    state: Mutex<ClientState>,
    callbacks: Arc<Mutex<AHashMap<String, DataCallback>>>,
}

impl ZmqTransportClient {
    pub fn create(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            pipe_url: format!("inproc://{}", gen_random_string(20)),
            state: Mutex::new(ClientState {
                connected: false,
                join: None,
            }),
            callbacks: Arc::new(Mutex::new(AHashMap::new())),
        })
    }

    fn pipe_cmd(&self, cmd: &str, key: Option<&str>) -> Result<(), MatrixError> {
        let pipe = shared_context().socket(zmq::REQ)?;
        pipe.set_linger(0)?;
        pipe.set_sndtimeo(2000)?;
        pipe.set_rcvtimeo(2000)?;
        pipe.connect(&self.pipe_url)?;

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
}

impl TransportClient for ZmqTransportClient {
    fn url(&self) -> &str {
        &self.url
    }

    fn connect(&self) -> Result<(), MatrixError> {
        let mut state = self.state.lock();
        if state.connected {
            return Ok(());
        }

        let (ready_tx, ready_rx) = cbchan::bounded(1);
        let url = self.url.clone();
        let pipe_url = self.pipe_url.clone();
        let callbacks = Arc::clone(&self.callbacks);

        let join = thread::Builder::new()
            .name("transport-sub".into())
            .spawn(move || sub_task(url, pipe_url, callbacks, ready_tx))
            .map_err(|e| MatrixError::creation(format!("cannot spawn subscriber: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => {
                state.connected = true;
                state.join = Some(join);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(MatrixError::creation(format!(
                "subscriber thread for {} aborted",
                self.url
            ))),
        }
    }

    fn subscribe(&self, key: &str, cb: DataCallback) -> Result<(), MatrixError> {
        if !self.state.lock().connected {
            return Err(MatrixError::transport("client is not connected"));
        }
        self.callbacks.lock().insert(key.to_string(), cb);
        self.pipe_cmd(CTRL_SUBSCRIBE, Some(key))
    }

    fn unsubscribe(&self, key: &str) -> Result<(), MatrixError> {
        if !self.state.lock().connected {
            return Err(MatrixError::transport("client is not connected"));
        }
        self.pipe_cmd(CTRL_UNSUBSCRIBE, Some(key))?;
        self.callbacks.lock().remove(key);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), MatrixError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Ok(());
        }
        self.pipe_cmd(CTRL_QUIT, None)?;
        if let Some(join) = state.join.take() {
            let _ = join.join();
        }
        state.connected = false;
        Ok(())
    }
}

impl Drop for ZmqTransportClient {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

fn sub_task(
    url: String,
    pipe_url: String,
    callbacks: Arc<Mutex<AHashMap<String, DataCallback>>>,
    ready: cbchan::Sender<Result<(), MatrixError>>,
) {
    let setup = || -> Result<(zmq::Socket, zmq::Socket), MatrixError> {
        let sub_sock = shared_context().socket(zmq::SUB)?;
        sub_sock.connect(&url)?;
        let pipe = shared_context().socket(zmq::REP)?;
        pipe.bind(&pipe_url)?;
        Ok((sub_sock, pipe))
    };

    let (sub_sock, pipe) = match setup() {
        Ok(socks) => socks,
        Err(e) => {
            tracing::error!("transport subscriber setup failed for {url}: {e}");
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
                tracing::error!("transport subscriber poll: {e}");
                break;
            }
        }

        if items[0].is_readable() {
            let handled = (|| -> Result<bool, zmq::Error> {
                let cmd = pipe.recv_bytes(0)?;
                let frames = recv_rest_bytes(&pipe)?;
                let key = frames.first().map(Vec::as_slice).unwrap_or(b"");

                match cmd.as_slice() {
                    c if c == CTRL_SUBSCRIBE.as_bytes() => {
                        sub_sock.set_subscribe(key)?;
                        pipe.send("1", 0)?;
                        Ok(true)
                    }
                    c if c == CTRL_UNSUBSCRIBE.as_bytes() => {
                        sub_sock.set_unsubscribe(key)?;
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
                    tracing::error!("transport subscriber control pipe: {e}");
                    break 'outer;
                }
            }
        }

        if items[1].is_readable() {
            let received = (|| -> Result<(), zmq::Error> {
                let topic = sub_sock.recv_bytes(0)?;
                let frames = recv_rest_bytes(&sub_sock)?;

                if let Some(payload) = frames.first() {
                    let key = String::from_utf8_lossy(&topic).into_owned();
                    let cb = callbacks.lock().get(&key).cloned();
                    if let Some(cb) = cb {
                        cb(&key, payload);
                    }
                }
                Ok(())
            })();

            match received {
                Ok(()) => {}
                Err(zmq::Error::ETERM) => return,
                Err(e) => {
                    tracing::error!("transport subscriber data socket: {e}");
                    break 'outer;
                }
            }
        }
    }

    let _ = pipe.set_linger(0);
    let _ = sub_sock.set_linger(0);
}
