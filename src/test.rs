#[cfg(test)]
mod tests {
    use crate::architect::Architect;
    use crate::component::{
        Component, ComponentRegistry, ComponentState, DataSink, DataSource, LifecycleEvent,
    };
    use crate::config::load_config_str;
    use crate::keymaster::{Keymaster, KeymasterCallback, KeymasterServer};
    use crate::transport::TransportRegistry;
    use crate::utils::gen_random_string;
    use crossbeam::channel as cbchan;
    use serde_yaml::Value;
    use std::sync::Arc;
    use std::time::Duration;

    /// Unique per-test endpoints so scenarios can run in parallel inside
    /// one process (inproc names share the 0MQ context).
    fn inproc_url() -> String {
        format!("inproc://matrix.test.{}", gen_random_string(12))
    }

    fn start_server(extra_yaml: &str) -> (KeymasterServer, String) {
        let km_url = inproc_url();
        let doc = format!(
            "Keymaster:\n  URLS:\n    Initial: [{km_url}]\n  clone_interval: 1000\n{extra_yaml}"
        );
        let mut server = KeymasterServer::new(load_config_str(&doc).unwrap()).unwrap();
        server.run().unwrap();
        (server, km_url)
    }

    fn collect_values(rx: &cbchan::Receiver<(String, Value)>, window: Duration) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(kv) = rx.recv_timeout(window) {
            out.push(kv);
        }
        out
    }

    #[test]
    fn bring_up_publishes_realized_urls() {
        let km_url = inproc_url();
        let port = 42000 + (rand::random::<u16>() % 8000);
        let doc = format!(
            "Keymaster:\n  URLS:\n    Initial: [{km_url}, 'tcp://*:{port}']\n  clone_interval: 1000\n"
        );
        let mut server = KeymasterServer::new(load_config_str(&doc).unwrap()).unwrap();
        server.run().unwrap();

        let km = Keymaster::new(km_url);
        assert!(km.ping());

        let state: Vec<String> = km.get_as("Keymaster.URLS.AsConfigured.State").unwrap();
        let publish: Vec<String> = km.get_as("Keymaster.URLS.AsConfigured.Pub").unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(publish.len(), 2);

        let tcp = state.iter().find(|u| u.starts_with("tcp://")).unwrap();
        assert!(!tcp.contains('*'), "realized tcp URL still has a wildcard: {tcp}");

        let served: Vec<String> = km.get_as("KeymasterServer.URLS").unwrap();
        assert_eq!(served, state);

        server.terminate();
    }

    #[test]
    fn get_put_delete_round_trip_over_the_wire() {
        let (_server, km_url) = start_server("");
        let km = Keymaster::new(km_url);

        assert!(km.put("foo.bar.baz", Value::from(42), true));
        assert_eq!(km.get_as::<i64>("foo.bar.baz").unwrap(), 42);

        // put without create into a missing path is a result-record
        // failure, not a transport error
        assert!(!km.put("foo.nope.x", Value::from(1), false));
        assert!(km.last_result().err.contains("nope"));

        assert!(km.del("foo.bar.baz"));
        let r = km.get_result("foo.bar.baz");
        assert!(!r.result);
        assert!(!km.del("foo.bar.baz"));
    }

    #[test]
    fn ping_and_legacy_unknown_command_replies() {
        let (_server, km_url) = start_server("");
        let km = Keymaster::new(km_url.clone());
        assert!(km.ping());

        let r = km.get_result("Root");
        assert!(r.result);
        assert!(r.node.get("Keymaster").is_some());

        // an unknown verb comes back as the historical unterminated string
        let sock = crate::utils::shared_context().socket(zmq::REQ).unwrap();
        sock.set_rcvtimeo(2000).unwrap();
        sock.connect(&km_url).unwrap();
        sock.send("LIST", zmq::SNDMORE).unwrap();
        sock.send("whatever", 0).unwrap();
        let reply = sock.recv_string(0).unwrap().unwrap();
        assert_eq!(reply, "Unknown request 'LIST");
    }

    #[test]
    fn subscribe_sees_change_and_every_ancestor() {
        let (_server, km_url) = start_server("");
        let km = Keymaster::new(km_url);

        let (tx, rx) = cbchan::unbounded::<(String, Value)>();
        for key in ["foo", "foo.bar", "foo.bar.baz"] {
            let tx = tx.clone();
            let cb: KeymasterCallback = Arc::new(move |k, v| {
                let _ = tx.send((k.to_string(), v.clone()));
            });
            km.subscribe(key, cb).unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));

        assert!(km.put("foo.bar.baz", Value::from(42), true));

        let got = collect_values(&rx, Duration::from_secs(2));
        let keys: Vec<&str> = got.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"foo"), "missing ancestor publication: {keys:?}");
        assert!(keys.contains(&"foo.bar"));
        assert!(keys.contains(&"foo.bar.baz"));
        // exactly once per put
        assert_eq!(keys.iter().filter(|k| **k == "foo.bar.baz").count(), 1);

        let leaf = got.iter().find(|(k, _)| k == "foo.bar.baz").unwrap();
        assert_eq!(leaf.1.as_i64(), Some(42));
    }

    #[test]
    fn publications_on_one_key_stay_ordered() {
        let (_server, km_url) = start_server("");
        let km = Keymaster::new(km_url);

        let (tx, rx) = cbchan::unbounded::<(String, Value)>();
        let cb: KeymasterCallback = Arc::new(move |k, v| {
            let _ = tx.send((k.to_string(), v.clone()));
        });
        km.subscribe("a.b", cb).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(km.put("a.b", Value::from(1), true));
        assert!(km.put("a.b", Value::from(2), false));

        let got = collect_values(&rx, Duration::from_secs(2));
        let values: Vec<i64> = got.iter().filter_map(|(_, v)| v.as_i64()).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn deferred_puts_skip_duplicate_values() {
        let (_server, km_url) = start_server("");
        let km = Keymaster::new(km_url);

        let (tx, rx) = cbchan::unbounded::<(String, Value)>();
        let cb: KeymasterCallback = Arc::new(move |k, v| {
            let _ = tx.send((k.to_string(), v.clone()));
        });
        km.subscribe("stats.packets", cb).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        km.put_nb("stats.packets", "5", true);
        km.put_nb("stats.packets", "5", true);
        km.put_nb("stats.packets", "6", true);

        let got = collect_values(&rx, Duration::from_secs(2));
        let values: Vec<String> = got
            .iter()
            .filter_map(|(_, v)| v.as_str().map(str::to_string))
            .collect();
        assert_eq!(values, vec!["5".to_string(), "6".to_string()]);
    }

    #[test]
    fn rpc_over_the_store_rendezvous() {
        let (_server, km_url) = start_server("");
        let client = Keymaster::new(km_url.clone());
        let service = Keymaster::new(km_url);

        // the rendezvous keys must exist before anyone calls
        assert!(client.put("svc.calc.request", Value::Null, true));
        assert!(client.put("svc.calc.reply", Value::Null, true));

        let responder = service.clone();
        let cb: KeymasterCallback = Arc::new(move |_k, v| {
            if let Some(n) = v.as_i64() {
                responder.put("svc.calc.reply", Value::from(n * 2), false);
            }
        });
        service.subscribe("svc.calc.request", cb).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let reply = client.rpc("svc.calc", Value::from(21), Duration::from_secs(3));
        assert!(reply.result, "rpc failed: {}", reply.err);
        assert_eq!(reply.node.as_i64(), Some(42));

        // no service listening on this key: the call times out
        assert!(client.put("svc.idle.request", Value::Null, true));
        assert!(client.put("svc.idle.reply", Value::Null, true));
        let reply = client.rpc("svc.idle", Value::from(1), Duration::from_millis(200));
        assert!(!reply.result);
    }

    #[test]
    fn heartbeat_is_monotonic() {
        let (_server, km_url) = start_server("");
        let km = Keymaster::new(km_url);

        // first beat lands roughly one second after bring-up
        std::thread::sleep(Duration::from_millis(2300));
        let a: i64 = km.get_as("Keymaster.heartbeat").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let b: i64 = km.get_as("Keymaster.heartbeat").unwrap();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn transport_wiring_realizes_and_shares_instances() {
        let extra = "components:\n  nettask:\n    type: toy\n    source:\n      URLs: [inproc, tcp]\n";
        let (_server, km_url) = start_server(extra);
        let registry = TransportRegistry::new();

        let source = DataSource::new(&km_url, &registry, "nettask", "source").unwrap();

        let km = Keymaster::new(km_url.clone());
        let configured: Vec<String> = km
            .get_as("components.nettask.Transports.source.AsConfigured")
            .unwrap();
        assert_eq!(configured.len(), 2);
        assert!(configured.iter().any(|u| u.starts_with("inproc://")));
        let tcp = configured.iter().find(|u| u.starts_with("tcp://")).unwrap();
        let (host, port) = tcp.strip_prefix("tcp://").unwrap().rsplit_once(':').unwrap();
        assert!(!host.is_empty() && host != "*");
        assert!(port.parse::<u16>().unwrap() > 1024);

        // a second consumer of the same service shares the instance
        let a = registry.get_server(&km_url, "nettask", "source").unwrap();
        let b = registry.get_server(&km_url, "nettask", "source").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        drop(a);
        drop(b);
        drop(source);
        registry.release_server("nettask", "source");

        // realized URLs were withdrawn with the last handle
        assert!(
            !km.get_result("components.nettask.Transports.source.AsConfigured")
                .result
        );
    }

    #[test]
    fn ephemeral_name_substitution_matches_spec_pattern() {
        let extra = "components:\n  nettask:\n    type: toy\n    source:\n      URLs: ['inproc://matrix.X.XXXXX']\n";
        let (_server, km_url) = start_server(extra);
        let registry = TransportRegistry::new();

        let _source = DataSource::new(&km_url, &registry, "nettask", "source").unwrap();

        let km = Keymaster::new(km_url);
        let configured: Vec<String> = km
            .get_as("components.nettask.Transports.source.AsConfigured")
            .unwrap();
        let url = &configured[0];
        let suffix = url.strip_prefix("inproc://matrix.X.").unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(suffix, "XXXXX");
    }

    #[test]
    fn data_flows_source_to_sink_over_most_local_endpoint() {
        let extra = "components:\n  producer:\n    type: toy\n    samples:\n      URLs: [inproc, tcp]\n";
        let (_server, km_url) = start_server(extra);
        let registry = TransportRegistry::new();

        let source = DataSource::new(&km_url, &registry, "producer", "samples").unwrap();

        let (tx, rx) = cbchan::unbounded::<Vec<u8>>();
        let sink = DataSink::new(
            &km_url,
            &registry,
            Arc::new(move |_k, d| {
                let _ = tx.send(d.to_vec());
            }),
        );
        sink.connect("producer", "samples").unwrap();

        // let the inproc subscription settle before publishing
        std::thread::sleep(Duration::from_millis(200));
        for i in 0u8..3 {
            source.publish(&[i, i + 1]).unwrap();
        }

        for i in 0u8..3 {
            let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got, vec![i, i + 1]);
        }

        sink.disconnect();
        assert!(!sink.is_connected());
    }

    // ---- lifecycle scenario

    struct ToyProducer {
        name: String,
        source: DataSource,
        started: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Component for ToyProducer {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_start(&mut self) -> anyhow::Result<()> {
            self.started.store(true, std::sync::atomic::Ordering::SeqCst);
            for i in 0u8..3 {
                self.source.publish(&[i])?;
            }
            Ok(())
        }
    }

    struct ToyConsumer {
        name: String,
        sink: DataSink,
    }

    impl Component for ToyConsumer {
        fn name(&self) -> &str {
            &self.name
        }

        fn connect_sink(
            &mut self,
            sink: &str,
            source_component: &str,
            source_name: &str,
        ) -> anyhow::Result<()> {
            anyhow::ensure!(sink == "input", "no sink '{sink}'");
            self.sink.connect(source_component, source_name)?;
            Ok(())
        }

        fn disconnect_sinks(&mut self) {
            self.sink.disconnect();
        }
    }

    #[test]
    fn two_component_lifecycle_with_wiring() {
        let extra = "\
components:
  producer:
    type: toy_producer
    samples:
      URLs: [inproc]
  consumer:
    type: toy_consumer
connections:
  default:
    - [producer, samples, consumer, input]
";
        let (_server, km_url) = start_server(extra);
        let transports = TransportRegistry::new();

        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (data_tx, data_rx) = cbchan::unbounded::<Vec<u8>>();

        let components = ComponentRegistry::new();
        let started_flag = started.clone();
        components.register(
            "toy_producer",
            Arc::new(move |name, km_url, registry| {
                Ok(Box::new(ToyProducer {
                    name: name.to_string(),
                    source: DataSource::new(km_url, registry, name, "samples")?,
                    started: started_flag.clone(),
                }) as Box<dyn Component>)
            }),
        );
        components.register(
            "toy_consumer",
            Arc::new(move |name, km_url, registry| {
                let tx = data_tx.clone();
                Ok(Box::new(ToyConsumer {
                    name: name.to_string(),
                    sink: DataSink::new(
                        km_url,
                        registry,
                        Arc::new(move |_k, d| {
                            let _ = tx.send(d.to_vec());
                        }),
                    ),
                }) as Box<dyn Component>)
            }),
        );

        let mut architect =
            Architect::new("control", km_url.clone(), components, transports).unwrap();
        architect.set_timeout(Duration::from_secs(5));
        architect.create_components().unwrap();

        let states = architect.component_states();
        assert_eq!(states.len(), 2);
        assert!(states.values().all(|s| *s == ComponentState::Standby));

        architect.ready().unwrap();
        assert!(
            architect
                .component_states()
                .values()
                .all(|s| *s == ComponentState::Ready)
        );

        // a second Initialize is a no-op in Ready
        architect.send_event(LifecycleEvent::Initialize).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(
            architect
                .component_states()
                .values()
                .all(|s| *s == ComponentState::Ready)
        );

        architect.start().unwrap();
        assert!(started.load(std::sync::atomic::Ordering::SeqCst));
        for i in 0u8..3 {
            assert_eq!(
                data_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                vec![i]
            );
        }

        architect.stop().unwrap();
        architect.standby().unwrap();
        assert!(
            architect
                .component_states()
                .values()
                .all(|s| *s == ComponentState::Standby)
        );

        // component status is mirrored into the store
        let km = Keymaster::new(km_url);
        let status: String = km.get_as("components.producer.status").unwrap();
        assert_eq!(status, "Standby");

        architect.terminate();
    }

    #[test]
    fn start_requires_all_components_ready() {
        let extra = "\
components:
  lone:
    type: toy_consumer
connections:
  default: []
";
        let (_server, km_url) = start_server(extra);
        let transports = TransportRegistry::new();

        let components = ComponentRegistry::new();
        components.register(
            "toy_consumer",
            Arc::new(move |name, km_url, registry| {
                Ok(Box::new(ToyConsumer {
                    name: name.to_string(),
                    sink: DataSink::new(km_url, registry, Arc::new(|_k, _d| {})),
                }) as Box<dyn Component>)
            }),
        );

        let mut architect = Architect::new("control", km_url, components, transports).unwrap();
        architect.set_timeout(Duration::from_secs(3));
        architect.create_components().unwrap();

        // Start from Standby must be refused outright
        let err = architect.start().unwrap_err();
        assert!(err.to_string().contains("must be Ready"));

        architect.ready().unwrap();
        architect.start().unwrap();
        architect.stop().unwrap();
        architect.standby().unwrap();
    }

    #[test]
    fn rt_transport_via_registry_is_lossless() {
        let extra = "components:\n  rttask:\n    type: toy\n    feed:\n      URLs: [rtinproc]\n";
        let (_server, km_url) = start_server(extra);
        let registry = TransportRegistry::new();

        let source = DataSource::new(&km_url, &registry, "rttask", "feed").unwrap();
        let urls = source.urls();
        assert!(urls[0].starts_with("rtinproc://"));

        let (tx, rx) = cbchan::unbounded::<Vec<u8>>();
        let sink = DataSink::new(
            &km_url,
            &registry,
            Arc::new(move |_k, d| {
                let _ = tx.send(d.to_vec());
            }),
        );
        sink.connect("rttask", "feed").unwrap();

        for i in 0u16..100 {
            source.publish(&i.to_be_bytes()).unwrap();
        }
        for i in 0u16..100 {
            let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got, i.to_be_bytes().to_vec());
        }
    }
}
