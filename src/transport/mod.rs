//! Pluggable data transports.
//!
//! A [`TransportServer`] carries data from a source to its subscribers; a
//! [`TransportClient`] is the receiving side. Neither end knows how the
//! bytes travel: the URL scheme selects a factory out of the
//! [`TransportRegistry`], which also caches live instances so sinks that
//! need the same endpoint share one underlying transport.

mod rt;
mod zmq_transport;

pub use rt::{RtRendezvous, RtTransportClient, RtTransportServer};
pub use zmq_transport::{ZmqTransportClient, ZmqTransportServer};

use crate::error::MatrixError;
use crate::keymaster::Keymaster;
use crate::utils::net::scheme;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Data-plane callback: invoked with the topic key and the raw payload.
pub type DataCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync + 'static>;

/// Publishing side of a transport. Binding happens at construction; the
/// realized endpoints are what clients connect to.
pub trait TransportServer: Send + Sync {
    /// Realized endpoint URLs (the `AsConfigured` list).
    fn urls(&self) -> Vec<String>;

    /// Publish `data` under the routing key `key`. Ordering is preserved
    /// per key on one server; nothing is guaranteed across keys.
    fn publish(&self, key: &str, data: &[u8]) -> Result<(), MatrixError>;
}

/// Receiving side of a transport.
pub trait TransportClient: Send + Sync {
    fn url(&self) -> &str;

    /// Start the receive machinery. Idempotent.
    fn connect(&self) -> Result<(), MatrixError>;

    fn subscribe(&self, key: &str, cb: DataCallback) -> Result<(), MatrixError>;

    fn unsubscribe(&self, key: &str) -> Result<(), MatrixError>;

    /// Stop receiving. Idempotent.
    fn disconnect(&self) -> Result<(), MatrixError>;
}

impl std::fmt::Debug for dyn TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient").field("url", &self.url()).finish()
    }
}

/// Builds a server for `(keymaster URL, transport key)`.
pub type ServerFactory =
    Arc<dyn Fn(&str, &str) -> Result<Arc<dyn TransportServer>, MatrixError> + Send + Sync>;

/// Builds a client for a fully expanded endpoint URL.
pub type ClientFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn TransportClient>, MatrixError> + Send + Sync>;

/// Scheme-to-factory dispatch plus shared-instance caches.
///
/// Constructed explicitly at startup and passed around by handle; the
/// built-in schemes (`tcp`, `ipc`, `inproc` — networked pub/sub — and
/// `rtinproc` — lossless in-process) are pre-registered. Extension schemes
/// may be added before first use.
///
/// Instance caches hold weak handles: consumers keep the transport alive,
/// and once the last handle drops the next lookup constructs a fresh one.
pub struct TransportRegistry {
    server_factories: Mutex<AHashMap<String, (usize, ServerFactory)>>,
    client_factories: Mutex<AHashMap<String, ClientFactory>>,
    servers: Mutex<AHashMap<(String, String), Weak<dyn TransportServer>>>,
    clients: Mutex<AHashMap<String, Weak<dyn TransportClient>>>,
    next_factory_id: AtomicUsize,
}

impl TransportRegistry {
    pub fn new() -> Arc<Self> {
        let reg = Arc::new(Self {
            server_factories: Mutex::new(AHashMap::new()),
            client_factories: Mutex::new(AHashMap::new()),
            servers: Mutex::new(AHashMap::new()),
            clients: Mutex::new(AHashMap::new()),
            next_factory_id: AtomicUsize::new(0),
        });

        reg.add_server_factory(
            &["tcp", "ipc", "inproc"],
            Arc::new(|km_url, key| {
                Ok(ZmqTransportServer::create(km_url, key)? as Arc<dyn TransportServer>)
            }),
        );
        reg.add_client_factory(
            &["tcp", "ipc", "inproc"],
            Arc::new(|url| Ok(ZmqTransportClient::create(url) as Arc<dyn TransportClient>)),
        );

        let rendezvous = rt::RtRendezvous::new();
        let rv = rendezvous.clone();
        reg.add_server_factory(
            &["rtinproc"],
            Arc::new(move |km_url, key| {
                Ok(RtTransportServer::create(km_url, key, rv.clone())? as Arc<dyn TransportServer>)
            }),
        );
        let rv = rendezvous;
        reg.add_client_factory(
            &["rtinproc"],
            Arc::new(move |url| {
                Ok(RtTransportClient::create(url, rv.clone())? as Arc<dyn TransportClient>)
            }),
        );

        reg
    }

    /// Register one server factory for a set of schemes. A scheme that was
    /// already registered is rebound to the new factory.
    pub fn add_server_factory(&self, schemes: &[&str], factory: ServerFactory) {
        let id = self.next_factory_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.server_factories.lock();
        for s in schemes {
            map.insert((*s).to_string(), (id, factory.clone()));
        }
    }

    pub fn add_client_factory(&self, schemes: &[&str], factory: ClientFactory) {
        let mut map = self.client_factories.lock();
        for s in schemes {
            map.insert((*s).to_string(), factory.clone());
        }
    }

    /// Shared server for `(component, transport name)`, building it on
    /// first use from the `Specified` list in the store.
    ///
    /// Every scheme in the spec must resolve to the same factory: one
    /// server instance serves all of a service's endpoints.
    pub fn get_server(
        &self,
        km_url: &str,
        component: &str,
        transport: &str,
    ) -> Result<Arc<dyn TransportServer>, MatrixError> {
        let cache_key = (component.to_string(), transport.to_string());

        let mut servers = self.servers.lock();
        if let Some(existing) = servers.get(&cache_key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let transport_key = format!("components.{component}.Transports.{transport}");
        let km = Keymaster::new(km_url);
        let specified: Vec<String> = km
            .get_as(&format!("{transport_key}.Specified"))
            .map_err(|e| MatrixError::creation(format!("cannot read transport spec: {e}")))?;

        let factory = {
            let factories = self.server_factories.lock();
            let mut chosen: Option<(usize, ServerFactory)> = None;

            for spec in &specified {
                let (id, f) = factories.get(scheme(spec)).ok_or_else(|| {
                    MatrixError::creation(format!(
                        "Not all transports supported: {}",
                        specified.join(", ")
                    ))
                })?;

                match &chosen {
                    None => chosen = Some((*id, f.clone())),
                    Some((prev, _)) if prev != id => {
                        return Err(MatrixError::creation(format!(
                            "Some transports have different factories: {}",
                            specified.join(", ")
                        )));
                    }
                    Some(_) => {}
                }
            }

            chosen
                .map(|(_, f)| f)
                .ok_or_else(|| MatrixError::creation("empty transport spec"))?
        };

        let server = factory(km_url, &transport_key)?;
        servers.insert(cache_key, Arc::downgrade(&server));
        Ok(server)
    }

    /// Drop the cache entry for a served transport if no consumer holds it
    /// anymore. Call after releasing your own handle.
    pub fn release_server(&self, component: &str, transport: &str) {
        let cache_key = (component.to_string(), transport.to_string());
        let mut servers = self.servers.lock();
        if let Some(w) = servers.get(&cache_key)
            && w.upgrade().is_none()
        {
            servers.remove(&cache_key);
        }
    }

    /// Shared client for a fully expanded URL.
    pub fn get_client(&self, url: &str) -> Result<Arc<dyn TransportClient>, MatrixError> {
        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(url).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let factory = self
            .client_factories
            .lock()
            .get(scheme(url))
            .cloned()
            .ok_or_else(|| MatrixError::creation(format!("No known factory for {}", scheme(url))))?;

        let client = factory(url)?;
        clients.insert(url.to_string(), Arc::downgrade(&client));
        Ok(client)
    }

    pub fn release_client(&self, url: &str) {
        let mut clients = self.clients.lock();
        if let Some(w) = clients.get(url)
            && w.upgrade().is_none()
        {
            clients.remove(url);
        }
    }
}
