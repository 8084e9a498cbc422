//! The architect: reads the wiring out of the store, instantiates
//! components by declared type, mediates source-to-sink connections and
//! drives the shared lifecycle.

use crate::component::{
    CONTROL_COMMAND_PATH, ComponentRegistry, ComponentRunner, ComponentState, LifecycleEvent,
};
use crate::keymaster::Keymaster;
use crate::transport::TransportRegistry;
use ahash::AHashMap;
use anyhow::{Context, bail};
use serde_yaml::Value;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Store path holding the active mode (a key under `connections`).
pub const CONTROL_CONFIGURATION_PATH: &str = "architect.control.configuration";

/// Store path the architect aggregates component states under.
pub const CONTROL_STATE_PATH: &str = "architect.control.state";

const REACHABLE_RETRIES: usize = 10;
const REACHABLE_DELAY: Duration = Duration::from_millis(100);
const STATE_POLL: Duration = Duration::from_millis(100);

pub struct Architect {
    name: String,
    km_url: String,
    km: Keymaster,
    component_registry: ComponentRegistry,
    transport_registry: Arc<TransportRegistry>,
    runners: AHashMap<String, ComponentRunner>,
    timeout: Duration,
}

impl Architect {
    /// Connects to the keymaster (which must already be running — the
    /// whole system configuration lives there) and prepares an empty
    /// component set.
    pub fn new(
        name: impl Into<String>,
        km_url: impl Into<String>,
        component_registry: ComponentRegistry,
        transport_registry: Arc<TransportRegistry>,
    ) -> anyhow::Result<Self> {
        let km_url = km_url.into();
        let km = Keymaster::new(km_url.clone());

        let mut reachable = false;
        for _ in 0..REACHABLE_RETRIES {
            if km.ping() {
                reachable = true;
                break;
            }
            thread::sleep(REACHABLE_DELAY);
        }
        if !reachable {
            bail!("no keymaster reachable at {km_url}");
        }

        Ok(Self {
            name: name.into(),
            km_url,
            km,
            component_registry,
            transport_registry,
            runners: AHashMap::new(),
            timeout: Duration::from_secs(5),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Read `components.*.type` and instantiate every declared component
    /// through the registered factories. An unknown type is fatal.
    pub fn create_components(&mut self) -> anyhow::Result<()> {
        let components: Value = self
            .km
            .get("components")
            .context("no 'components' section in the store")?;

        let map = components
            .as_mapping()
            .context("'components' is not a mapping")?;

        for key in map.keys() {
            let comp_name = key
                .as_str()
                .context("component names must be strings")?
                .to_string();

            let type_name: String = self
                .km
                .get_as(&format!("components.{comp_name}.type"))
                .with_context(|| format!("component '{comp_name}' declares no type"))?;

            let factory = self
                .component_registry
                .lookup(&type_name)
                .with_context(|| format!("unknown component type '{type_name}' for '{comp_name}'"))?;

            let component = factory(&comp_name, &self.km_url, &self.transport_registry)
                .with_context(|| format!("cannot construct component '{comp_name}'"))?;

            let runner = ComponentRunner::start(component, &self.km_url)?;
            self.runners.insert(comp_name.clone(), runner);
            tracing::info!("architect '{}': created component '{comp_name}' ({type_name})", self.name);
        }

        self.update_system_status();
        Ok(())
    }

    /// Modes defined in the `connections` section.
    pub fn system_modes(&self) -> anyhow::Result<Vec<String>> {
        let connections: Value = self.km.get("connections")?;
        let map = connections
            .as_mapping()
            .context("'connections' is not a mapping")?;
        Ok(map
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect())
    }

    /// The active mode. When none was chosen yet and the configuration
    /// defines exactly one, that one is adopted.
    pub fn system_mode(&self) -> anyhow::Result<String> {
        if let Ok(mode) = self.km.get_as::<String>(CONTROL_CONFIGURATION_PATH) {
            return Ok(mode);
        }

        let modes = self.system_modes()?;
        match modes.as_slice() {
            [only] => {
                self.km.put_as(CONTROL_CONFIGURATION_PATH, only, true);
                Ok(only.clone())
            }
            _ => bail!("no system mode selected and {} are defined", modes.len()),
        }
    }

    /// Select a mode. Only allowed while every component is in Standby.
    pub fn set_system_mode(&self, mode: &str) -> anyhow::Result<()> {
        let (all_standby, states) = self.check_all_in_state(ComponentState::Standby);
        if !all_standby {
            bail!("system must be in Standby to change modes, not {states:?}");
        }

        let modes = self.system_modes()?;
        if !modes.iter().any(|m| m == mode) {
            bail!("unknown mode '{mode}'");
        }

        if !self.km.put_as(CONTROL_CONFIGURATION_PATH, mode, true) {
            bail!("could not change mode: {}", self.km.last_result().err);
        }
        Ok(())
    }

    /// Broadcast a lifecycle event to every component via the store.
    pub fn send_event(&self, event: LifecycleEvent) -> anyhow::Result<()> {
        if !self
            .km
            .put_as(CONTROL_COMMAND_PATH, event.wire_name(), true)
        {
            bail!(
                "cannot broadcast '{}': {}",
                event.wire_name(),
                self.km.last_result().err
            );
        }
        Ok(())
    }

    /// Snapshot of every component's current state.
    pub fn component_states(&self) -> AHashMap<String, ComponentState> {
        self.runners
            .iter()
            .map(|(name, r)| (name.clone(), r.state()))
            .collect()
    }

    fn check_all_in_state(&self, state: ComponentState) -> (bool, AHashMap<String, ComponentState>) {
        let states = self.component_states();
        let all = !states.is_empty() && states.values().all(|s| *s == state);
        (all, states)
    }

    fn wait_all_in_state(
        &self,
        state: ComponentState,
    ) -> (bool, AHashMap<String, ComponentState>) {
        let deadline = Instant::now() + self.timeout;
        loop {
            let (ok, states) = self.check_all_in_state(state);
            if ok || Instant::now() >= deadline {
                self.update_system_status();
                return (ok, states);
            }
            thread::sleep(STATE_POLL);
        }
    }

    /// Wire the active mode's edges, then drive every component
    /// Standby → Ready. On failure the survivors are stood down again.
    pub fn ready(&mut self) -> anyhow::Result<()> {
        self.wire_active_mode()?;
        self.send_event(LifecycleEvent::Initialize)?;

        let (ok, states) = self.wait_all_in_state(ComponentState::Ready);
        if !ok {
            let _ = self.send_event(LifecycleEvent::StandDown);
            let _ = self.wait_all_in_state(ComponentState::Standby);
            bail!("not all components reached Ready: {states:?}");
        }
        Ok(())
    }

    /// Drive every component Ready → Running. All components must already
    /// be Ready. A straggler is reported; peers that started are not
    /// rolled back.
    pub fn start(&self) -> anyhow::Result<()> {
        let (all_ready, states) = self.check_all_in_state(ComponentState::Ready);
        if !all_ready {
            bail!("all components must be Ready before Start: {states:?}");
        }

        self.send_event(LifecycleEvent::Start)?;
        let (ok, states) = self.wait_all_in_state(ComponentState::Running);
        if !ok {
            bail!("not all components reached Running: {states:?}");
        }
        Ok(())
    }

    /// Drive every component Running → Ready.
    pub fn stop(&self) -> anyhow::Result<()> {
        self.send_event(LifecycleEvent::Stop)?;
        let (ok, states) = self.wait_all_in_state(ComponentState::Ready);
        if !ok {
            bail!("not all components reached Ready: {states:?}");
        }
        Ok(())
    }

    /// Drive every component Ready → Standby, disconnecting their sinks.
    pub fn standby(&self) -> anyhow::Result<()> {
        self.send_event(LifecycleEvent::StandDown)?;
        let (ok, states) = self.wait_all_in_state(ComponentState::Standby);
        if !ok {
            bail!("not all components reached Standby: {states:?}");
        }
        Ok(())
    }

    /// Resolve the active mode's edges and issue the sink-side connects.
    fn wire_active_mode(&mut self) -> anyhow::Result<()> {
        let mode = self.system_mode()?;
        let edges: Vec<Vec<String>> = self
            .km
            .get_as(&format!("connections.{mode}"))
            .with_context(|| format!("mode '{mode}' has no connection list"))?;

        for edge in &edges {
            let [src_comp, src_name, sink_comp, sink_name] = edge.as_slice() else {
                bail!("malformed connection edge {edge:?} in mode '{mode}'");
            };

            let runner = self
                .runners
                .get(sink_comp.as_str())
                .with_context(|| format!("edge names unknown component '{sink_comp}'"))?;

            runner
                .connect_sink(sink_name, src_comp, src_name)
                .with_context(|| {
                    format!("wiring {src_comp}.{src_name} -> {sink_comp}.{sink_name}")
                })?;

            tracing::info!(
                "architect '{}': wired {src_comp}.{src_name} -> {sink_comp}.{sink_name}",
                self.name
            );
        }
        Ok(())
    }

    /// Aggregate component states into one system snapshot: the common
    /// state name, or `Mixed` while components disagree.
    fn update_system_status(&self) {
        let states = self.component_states();
        let mut values = states.values();
        let agg = match values.next() {
            None => "Standby".to_string(),
            Some(first) => {
                if values.all(|s| s == first) {
                    first.to_string()
                } else {
                    "Mixed".to_string()
                }
            }
        };
        self.km.put_as(CONTROL_STATE_PATH, &agg, true);
    }

    /// Shut down all component runners.
    pub fn terminate(&mut self) {
        self.runners.clear();
        self.update_system_status();
    }
}

impl Drop for Architect {
    fn drop(&mut self) {
        self.runners.clear();
    }
}
