//! Lossless in-process transport (`rtinproc`).
//!
//! Data moves through a bounded semaphore-gated fifo per subscriber, with
//! a delivery thread feeding the subscriber's callback. Publishing blocks
//! (bounded) instead of dropping, which is what real-time consumers in the
//! same process want from this path.

use crate::error::{MatrixError, SendFailReason};
use crate::io::Fifo;
use crate::keymaster::Keymaster;
use crate::transport::{DataCallback, TransportClient, TransportServer};
use crate::utils::CancelToken;
use crate::utils::net::expand_specifier;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Per-subscriber queue depth.
const SUB_FIFO_DEPTH: usize = 64;

/// How long a publish may wait on one saturated subscriber.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// In-process lookup table letting clients find their server by realized
/// URL. Owned by the transport registry; nothing process-global.
pub struct RtRendezvous {
    servers: Mutex<AHashMap<String, Weak<RtCore>>>,
}

impl RtRendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(AHashMap::new()),
        })
    }

    fn register(&self, urls: &[String], core: &Arc<RtCore>) -> Result<(), MatrixError> {
        let mut map = self.servers.lock();
        for url in urls {
            if map.get(url).and_then(Weak::upgrade).is_some() {
                return Err(MatrixError::creation(format!(
                    "rt endpoint already in use: {url}"
                )));
            }
        }
        for url in urls {
            map.insert(url.clone(), Arc::downgrade(core));
        }
        Ok(())
    }

    fn find(&self, url: &str) -> Option<Arc<RtCore>> {
        self.servers.lock().get(url).and_then(Weak::upgrade)
    }

    fn forget(&self, urls: &[String]) {
        let mut map = self.servers.lock();
        for url in urls {
            map.remove(url);
        }
    }
}

struct SubEntry {
    id: usize,
    fifo: Fifo<Vec<u8>>,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl SubEntry {
    fn shut_down(mut self) {
        self.cancel.cancel();
        self.fifo.release();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Key → subscriber fifos. Shared between the serving and the client side
/// of the same process.
pub(crate) struct RtCore {
    subs: Mutex<AHashMap<String, Vec<SubEntry>>>,
    next_id: AtomicUsize,
}

impl RtCore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(AHashMap::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    fn subscribe(&self, key: &str, cb: DataCallback) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fifo: Fifo<Vec<u8>> = Fifo::bounded(SUB_FIFO_DEPTH);
        let cancel = CancelToken::new_root();

        let worker_fifo = fifo.clone();
        let worker_cancel = cancel.clone();
        let worker_key = key.to_string();
        let join = thread::Builder::new()
            .name("rt-delivery".into())
            .spawn(move || {
                while let Ok(data) = worker_fifo.get(&worker_cancel, None) {
                    cb(&worker_key, &data);
                }
            })
            .ok();

        self.subs.lock().entry(key.to_string()).or_default().push(SubEntry {
            id,
            fifo,
            cancel,
            join,
        });
        id
    }

    fn unsubscribe(&self, key: &str, id: usize) -> bool {
        let entry = {
            let mut subs = self.subs.lock();
            match subs.get_mut(key) {
                Some(list) => {
                    let pos = list.iter().position(|e| e.id == id);
                    let entry = pos.map(|i| list.remove(i));
                    if list.is_empty() {
                        subs.remove(key);
                    }
                    entry
                }
                None => None,
            }
        };

        match entry {
            Some(e) => {
                e.shut_down();
                true
            }
            None => false,
        }
    }

    fn publish(&self, key: &str, data: &[u8]) -> Result<(), MatrixError> {
        let subs = self.subs.lock();
        let Some(list) = subs.get(key) else {
            return Ok(());
        };

        for entry in list {
            match entry.fifo.put(data.to_vec(), &entry.cancel, Some(PUBLISH_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.reason == SendFailReason::Released => {}
                Err(e) => {
                    return Err(MatrixError::transport(format!(
                        "rt subscriber on '{key}' not draining: {e}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn shut_down_all(&self) {
        let all: Vec<SubEntry> = {
            let mut subs = self.subs.lock();
            subs.drain().flat_map(|(_, list)| list).collect()
        };
        for e in all {
            e.shut_down();
        }
    }
}

/// Serving side of `rtinproc`.
pub struct RtTransportServer {
    km_url: String,
    transport_key: String,
    urls: Vec<String>,
    core: Arc<RtCore>,
    rendezvous: Arc<RtRendezvous>,
}

impl RtTransportServer {
    pub fn create(
        km_url: &str,
        transport_key: &str,
        rendezvous: Arc<RtRendezvous>,
    ) -> Result<Arc<Self>, MatrixError> {
        let km = Keymaster::new(km_url);
        let specified: Vec<String> = km
            .get_as(&format!("{transport_key}.Specified"))
            .map_err(|e| MatrixError::creation(format!("cannot read '{transport_key}': {e}")))?;

        let urls: Vec<String> = specified.iter().map(|s| expand_specifier(s)).collect();

        let core = RtCore::new();
        rendezvous.register(&urls, &core)?;

        if !km.put_as(&format!("{transport_key}.AsConfigured"), &urls, true) {
            rendezvous.forget(&urls);
            return Err(MatrixError::creation(format!(
                "cannot record realized URLs for '{transport_key}': {}",
                km.last_result().err
            )));
        }

        Ok(Arc::new(Self {
            km_url: km_url.to_string(),
            transport_key: transport_key.to_string(),
            urls,
            core,
            rendezvous,
        }))
    }
}

impl TransportServer for RtTransportServer {
    fn urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn publish(&self, key: &str, data: &[u8]) -> Result<(), MatrixError> {
        self.core.publish(key, data)
    }
}

impl Drop for RtTransportServer {
    fn drop(&mut self) {
        self.rendezvous.forget(&self.urls);
        self.core.shut_down_all();

        let km = Keymaster::new(self.km_url.clone());
        km.set_timeout(Duration::from_millis(1000));
        km.del(&format!("{}.AsConfigured", self.transport_key));
    }
}

/// Receiving side of `rtinproc`: finds its server through the rendezvous
/// and hands subscriptions straight to it.
pub struct RtTransportClient {
    url: String,
    rendezvous: Arc<RtRendezvous>,
    subscriptions: Mutex<AHashMap<String, usize>>,
}

impl RtTransportClient {
    pub fn create(url: &str, rendezvous: Arc<RtRendezvous>) -> Result<Arc<Self>, MatrixError> {
        Ok(Arc::new(Self {
            url: url.to_string(),
            rendezvous,
            subscriptions: Mutex::new(AHashMap::new()),
        }))
    }

    fn core(&self) -> Result<Arc<RtCore>, MatrixError> {
        self.rendezvous.find(&self.url).ok_or_else(|| {
            MatrixError::creation(format!("no rt transport server at {}", self.url))
        })
    }
}

impl TransportClient for RtTransportClient {
    fn url(&self) -> &str {
        &self.url
    }

    fn connect(&self) -> Result<(), MatrixError> {
        self.core().map(|_| ())
    }

    fn subscribe(&self, key: &str, cb: DataCallback) -> Result<(), MatrixError> {
        let core = self.core()?;
        let id = core.subscribe(key, cb);
        if let Some(old) = self.subscriptions.lock().insert(key.to_string(), id) {
            core.unsubscribe(key, old);
        }
        Ok(())
    }

    fn unsubscribe(&self, key: &str) -> Result<(), MatrixError> {
        let Some(id) = self.subscriptions.lock().remove(key) else {
            return Ok(());
        };
        let core = self.core()?;
        core.unsubscribe(key, id);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), MatrixError> {
        let held: Vec<(String, usize)> = self.subscriptions.lock().drain().collect();
        if held.is_empty() {
            return Ok(());
        }
        if let Some(core) = self.rendezvous.find(&self.url) {
            for (key, id) in held {
                core.unsubscribe(&key, id);
            }
        }
        Ok(())
    }
}

impl Drop for RtTransportClient {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
