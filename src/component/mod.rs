//! Components and their shared lifecycle.
//!
//! A component is a named processing element with typed wiring: named
//! sources (things it publishes) and named sinks (things it consumes).
//! Every component moves through the same three-state lifecycle —
//! Standby, Ready, Running — driven by events the architect broadcasts
//! over the store. The [`ComponentRunner`] supplies the machinery: the
//! control subscription, the FSM worker and status reporting; user code
//! implements the [`Component`] hooks.

pub mod fsm;

use crate::error::MatrixError;
use crate::io::Fifo;
use crate::keymaster::{Keymaster, KeymasterCallback};
use crate::transport::{DataCallback, TransportClient, TransportRegistry, TransportServer};
use crate::utils::CancelToken;
use crate::utils::net::most_local;
use ahash::AHashMap;
use crossbeam::channel as cbchan;
use parking_lot::Mutex;
use serde_yaml::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Store path the architect writes lifecycle events to; every component
/// runner subscribes here.
pub const CONTROL_COMMAND_PATH: &str = "architect.control.command";

/// Store path a component reports its state under.
pub fn status_path(component: &str) -> String {
    format!("components.{component}.status")
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ComponentState {
    Standby,
    Ready,
    Running,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Standby => "Standby",
            ComponentState::Ready => "Ready",
            ComponentState::Running => "Running",
        }
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentState {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Standby" => Ok(ComponentState::Standby),
            "Ready" => Ok(ComponentState::Ready),
            "Running" => Ok(ComponentState::Running),
            other => Err(MatrixError::fatal(format!("unknown component state '{other}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LifecycleEvent {
    Initialize,
    Start,
    Stop,
    StandDown,
}

impl LifecycleEvent {
    pub fn wire_name(&self) -> &'static str {
        match self {
            LifecycleEvent::Initialize => "Initialize",
            LifecycleEvent::Start => "Start",
            LifecycleEvent::Stop => "Stop",
            LifecycleEvent::StandDown => "Stand_down",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Initialize" => Some(LifecycleEvent::Initialize),
            "Start" => Some(LifecycleEvent::Start),
            "Stop" => Some(LifecycleEvent::Stop),
            "Stand_down" => Some(LifecycleEvent::StandDown),
            _ => None,
        }
    }
}

/// User-implemented half of a component. Hooks run on the component's FSM
/// worker thread; a hook that fails keeps the component in its previous
/// state.
pub trait Component: Send + 'static {
    fn name(&self) -> &str;

    /// Standby → Ready: internal initialization. Sinks the architect wired
    /// are already connected when this runs.
    fn on_initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Ready → Running: start producing/consuming data.
    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Running → Ready: stop the data flow.
    fn on_stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Ready → Standby. Sinks are disconnected before this hook runs.
    fn on_stand_down(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Architect-mediated wiring: connect the named sink to a source on
    /// another component.
    fn connect_sink(
        &mut self,
        sink: &str,
        source_component: &str,
        source_name: &str,
    ) -> anyhow::Result<()> {
        let _ = (source_component, source_name);
        anyhow::bail!("component '{}' has no sink '{sink}'", self.name())
    }

    fn disconnect_sinks(&mut self) {}
}

/// Builds a component from its name. Receives the keymaster URL and the
/// transport registry so the instance can wire its sources and sinks.
pub type ComponentFactory = Arc<
    dyn Fn(&str, &str, &Arc<TransportRegistry>) -> anyhow::Result<Box<dyn Component>>
        + Send
        + Sync,
>;

/// Declared-type → factory table the architect instantiates from.
#[derive(Default)]
pub struct ComponentRegistry {
    factories: Mutex<AHashMap<String, ComponentFactory>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, type_name: impl Into<String>, factory: ComponentFactory) {
        self.factories.lock().insert(type_name.into(), factory);
    }

    pub fn lookup(&self, type_name: &str) -> Option<ComponentFactory> {
        self.factories.lock().get(type_name).cloned()
    }
}

enum RunnerCmd {
    Event(LifecycleEvent),
    ConnectSink {
        sink: String,
        source_component: String,
        source_name: String,
        reply: cbchan::Sender<anyhow::Result<()>>,
    },
    Quit,
}

/// Owns a component instance and runs its lifecycle: one worker thread
/// draining commands, the FSM table from the shared state machine, and
/// status reporting to `components.<name>.status`.
pub struct ComponentRunner {
    name: String,
    km: Keymaster,
    queue: Fifo<RunnerCmd>,
    state: Arc<Mutex<ComponentState>>,
    join: Option<JoinHandle<()>>,
}

impl ComponentRunner {
    pub fn start(
        component: Box<dyn Component>,
        km_url: &str,
    ) -> Result<Self, MatrixError> {
        let name = component.name().to_string();
        let km = Keymaster::new(km_url);
        let queue: Fifo<RunnerCmd> = Fifo::bounded(64);
        let state = Arc::new(Mutex::new(ComponentState::Standby));

        // entering Standby is externally visible from the start
        km.put_as(&status_path(&name), ComponentState::Standby.as_str(), true);

        // lifecycle events arrive over the store
        let event_queue = queue.clone();
        let cb: KeymasterCallback = Arc::new(move |_key, node: &Value| {
            if let Some(event) = node.as_str().and_then(LifecycleEvent::from_wire)
                && let Err(e) = event_queue.try_put(RunnerCmd::Event(event))
            {
                tracing::error!("lifecycle event dropped: {e}");
            }
        });
        km.subscribe(CONTROL_COMMAND_PATH, cb)
            .map_err(|e| MatrixError::creation(format!("component '{name}': {e}")))?;

        let worker_km = km.clone();
        let worker_name = name.clone();
        let worker_queue = queue.clone();
        let worker_state = Arc::clone(&state);
        let join = thread::Builder::new()
            .name(format!("component-{name}"))
            .spawn(move || runner_task(component, worker_km, worker_name, worker_queue, worker_state))
            .map_err(|e| MatrixError::fatal(format!("cannot spawn component worker: {e}")))?;

        Ok(Self {
            name,
            km,
            queue,
            state,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    /// Deliver a lifecycle event directly, bypassing the store broadcast.
    pub fn send_event(&self, event: LifecycleEvent) {
        if let Err(e) = self.queue.try_put(RunnerCmd::Event(event)) {
            tracing::error!("component '{}': event dropped: {e}", self.name);
        }
    }

    /// Synchronously wire one sink to a source on another component.
    pub fn connect_sink(
        &self,
        sink: &str,
        source_component: &str,
        source_name: &str,
    ) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = cbchan::bounded(1);
        self.queue
            .try_put(RunnerCmd::ConnectSink {
                sink: sink.to_string(),
                source_component: source_component.to_string(),
                source_name: source_name.to_string(),
                reply: reply_tx,
            })
            .map_err(|e| anyhow::anyhow!("component '{}' queue: {e}", self.name))?;

        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow::anyhow!("component '{}' did not answer wiring request", self.name))?
    }
}

impl Drop for ComponentRunner {
    fn drop(&mut self) {
        let _ = self.km.unsubscribe(CONTROL_COMMAND_PATH);
        let _ = self.queue.try_put(RunnerCmd::Quit);
        self.queue.release();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn lifecycle_fsm() -> fsm::Fsm {
    let mut f = fsm::Fsm::new(ComponentState::Standby.as_str());
    f.add_transition("Standby", "Initialize", "Ready");
    f.add_transition("Ready", "Start", "Running");
    f.add_transition("Ready", "Stand_down", "Standby");
    f.add_transition("Running", "Stop", "Ready");
    f
}

fn runner_task(
    mut component: Box<dyn Component>,
    km: Keymaster,
    name: String,
    queue: Fifo<RunnerCmd>,
    state: Arc<Mutex<ComponentState>>,
) {
    let mut machine = lifecycle_fsm();
    let cancel = CancelToken::new_root();

    loop {
        let cmd = match queue.get(&cancel, None) {
            Ok(cmd) => cmd,
            Err(_) => break,
        };

        match cmd {
            RunnerCmd::Quit => break,
            RunnerCmd::ConnectSink {
                sink,
                source_component,
                source_name,
                reply,
            } => {
                let r = component.connect_sink(&sink, &source_component, &source_name);
                if let Err(e) = &r {
                    tracing::error!("component '{name}': wiring sink '{sink}': {e}");
                }
                let _ = reply.send(r);
            }
            RunnerCmd::Event(event) => {
                let before = machine.current_state().to_string();
                if !machine.handle_event(event.wire_name()) {
                    tracing::debug!(
                        "component '{name}': ignoring {} in {before}",
                        event.wire_name()
                    );
                    continue;
                }

                let hook = match event {
                    LifecycleEvent::Initialize => component.on_initialize(),
                    LifecycleEvent::Start => component.on_start(),
                    LifecycleEvent::Stop => component.on_stop(),
                    LifecycleEvent::StandDown => {
                        component.disconnect_sinks();
                        component.on_stand_down()
                    }
                };

                match hook {
                    Ok(()) => {
                        let after = machine.current_state().to_string();
                        if let Ok(s) = after.parse::<ComponentState>() {
                            *state.lock() = s;
                        }
                        if !km.put_as(&status_path(&name), after.as_str(), true) {
                            tracing::warn!(
                                "component '{name}': status report failed: {}",
                                km.last_result().err
                            );
                        }
                        tracing::info!("component '{name}': {before} -> {after}");
                    }
                    Err(e) => {
                        tracing::error!(
                            "component '{name}': {} failed, staying in {before}: {e}",
                            event.wire_name()
                        );
                        machine.set_state(&before);
                    }
                }
            }
        }
    }
}

/// Publishing handle for one named source. Construction resolves the
/// transport spec, binds the shared server and records the realized
/// endpoints; `publish` sends under the source's name as topic key.
pub struct DataSource {
    component: String,
    name: String,
    registry: Arc<TransportRegistry>,
    server: Option<Arc<dyn TransportServer>>,
}

impl DataSource {
    pub fn new(
        km_url: &str,
        registry: &Arc<TransportRegistry>,
        component: &str,
        name: &str,
    ) -> Result<Self, MatrixError> {
        let km = Keymaster::new(km_url);
        let spec_key = format!("components.{component}.Transports.{name}.Specified");

        // the immutable spec comes either preloaded or from the
        // component's own config block
        if !km.get_result(&spec_key).result {
            let urls: Vec<String> = km
                .get_as(&format!("components.{component}.{name}.URLs"))
                .map_err(|e| {
                    MatrixError::creation(format!(
                        "no transport spec for source '{name}' of '{component}': {e}"
                    ))
                })?;
            if !km.put_as(&spec_key, &urls, true) {
                return Err(MatrixError::creation(format!(
                    "cannot record '{spec_key}': {}",
                    km.last_result().err
                )));
            }
        }

        let server = registry.get_server(km_url, component, name)?;

        Ok(Self {
            component: component.to_string(),
            name: name.to_string(),
            registry: Arc::clone(registry),
            server: Some(server),
        })
    }

    pub fn urls(&self) -> Vec<String> {
        self.server.as_ref().map(|s| s.urls()).unwrap_or_default()
    }

    pub fn publish(&self, data: &[u8]) -> Result<(), MatrixError> {
        match &self.server {
            Some(s) => s.publish(&self.name, data),
            None => Err(MatrixError::transport("source is shut down")),
        }
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        self.server.take();
        self.registry.release_server(&self.component, &self.name);
    }
}

struct SinkConnection {
    client: Arc<dyn TransportClient>,
    url: String,
    key: String,
}

/// Receiving handle: resolves a source's realized endpoints, picks the
/// most local one, shares the transport client and subscribes a callback.
pub struct DataSink {
    km_url: String,
    registry: Arc<TransportRegistry>,
    callback: DataCallback,
    connection: Mutex<Option<SinkConnection>>,
}

impl DataSink {
    pub fn new(km_url: &str, registry: &Arc<TransportRegistry>, callback: DataCallback) -> Self {
        Self {
            km_url: km_url.to_string(),
            registry: Arc::clone(registry),
            callback,
            connection: Mutex::new(None),
        }
    }

    pub fn connect(&self, source_component: &str, source_name: &str) -> Result<(), MatrixError> {
        let km = Keymaster::new(&self.km_url);
        let urls: Vec<String> = km
            .get_as(&format!(
                "components.{source_component}.Transports.{source_name}.AsConfigured"
            ))
            .map_err(|e| {
                MatrixError::creation(format!(
                    "source '{source_name}' of '{source_component}' is not bound: {e}"
                ))
            })?;

        let url = most_local(&urls)
            .ok_or_else(|| {
                MatrixError::creation(format!(
                    "source '{source_name}' of '{source_component}' has no endpoints"
                ))
            })?
            .to_string();

        let client = self.registry.get_client(&url)?;
        client.connect()?;
        client.subscribe(source_name, self.callback.clone())?;

        self.disconnect();
        *self.connection.lock() = Some(SinkConnection {
            client,
            url,
            key: source_name.to_string(),
        });
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().take() {
            if let Err(e) = conn.client.unsubscribe(&conn.key) {
                tracing::warn!("sink unsubscribe from '{}': {e}", conn.key);
            }
            drop(conn.client);
            self.registry.release_client(&conn.url);
        }
    }
}

impl Drop for DataSink {
    fn drop(&mut self) {
        self.disconnect();
    }
}
