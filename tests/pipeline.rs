//! End-to-end pipeline behaviour over in-memory control and geolocation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use circuitmap::control::event::{ControlEvent, StreamEvent, StreamStatus};
use circuitmap::metrics::Metrics;
use circuitmap::pipeline::event::Payload;
use circuitmap::pipeline::queue;
use circuitmap::pipeline::{
    Classification, Classifier, Dispatcher, DropReason, Listener, SnapshotCollector,
};
use circuitmap::relay::{Enricher, Role};
use circuitmap::testing::{circuit, FakeControl, MemoryGeo, RecordingTransport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FP1: &str = "A1B2C3D4E5F60718293A4B5C6D7E8F9012345678";
const FP2: &str = "B1B2C3D4E5F60718293A4B5C6D7E8F9012345678";
const FP3: &str = "C1B2C3D4E5F60718293A4B5C6D7E8F9012345678";

fn three_relays() -> (Arc<FakeControl>, MemoryGeo) {
    let control = Arc::new(FakeControl::new());
    control.add_relay(FP1, "nickA", "198.51.100.1", Some(1500));
    control.add_relay(FP2, "nickB", "198.51.100.2", Some(2500));
    control.add_relay(FP3, "nickC", "198.51.100.3", Some(3500));
    control.set_country("198.51.100.1", "de");
    control.set_country("198.51.100.2", "nl");
    control.set_country("198.51.100.3", "se");
    control.set_country("93.184.216.34", "us");

    let geo = MemoryGeo::new()
        .with("198.51.100.1", "DE", 50.11, 8.68)
        .with("198.51.100.2", "NL", 52.37, 4.90)
        .with("198.51.100.3", "SE", 59.33, 18.07)
        .with("93.184.216.34", "US", 34.05, -118.24);

    (control, geo)
}

fn succeeded_stream(circuit_id: Option<&str>) -> ControlEvent {
    ControlEvent::Stream(StreamEvent {
        id: "77".to_string(),
        status: StreamStatus::Succeeded,
        circuit_id: circuit_id.map(str::to_string),
        target: Some("93.184.216.34:443".to_string()),
    })
}

/// Runs the listener and dispatcher over `events` until the feed closes and
/// every queued event has been delivered.
async fn run_pipeline(
    control: Arc<FakeControl>,
    geo: MemoryGeo,
    events: Vec<ControlEvent>,
) -> Vec<Payload> {
    let metrics = Arc::new(Metrics::new().unwrap());
    let enricher = Enricher::new(Arc::clone(&control), Arc::new(geo), Arc::clone(&metrics));
    let (queue_tx, queue_rx) = queue::channel(Arc::clone(&metrics));
    let transport = Arc::new(RecordingTransport::new());

    let dispatcher = Dispatcher::new(
        queue_rx,
        SnapshotCollector::new(enricher.clone(), Arc::clone(&metrics)),
        Arc::clone(&transport),
        Arc::clone(&metrics),
    );
    let classifier = Classifier::new(enricher, queue_tx, None, Arc::clone(&metrics));
    let listener = Listener::new(control, classifier, Duration::from_millis(10), metrics);

    let (feed_tx, feed_rx) = mpsc::unbounded_channel();
    for event in events {
        feed_tx.send(event).unwrap();
    }
    drop(feed_tx);

    let cancel = CancellationToken::new();
    let dispatching = tokio::spawn(dispatcher.run(cancel.clone()));
    listener.run(feed_rx, cancel).await.unwrap();
    // The listener owned the only queue sender; the dispatcher drains and stops.
    dispatching.await.unwrap();

    transport.published()
}

#[tokio::test]
async fn test_built_circuit_publishes_entry_middle_exit() {
    let (control, geo) = three_relays();
    let built = circuit("12", &[(FP1, "nickA"), (FP2, "nickB"), (FP3, "nickC")]);
    control.set_circuits(vec![built.clone()]);

    let published = run_pipeline(control, geo, vec![ControlEvent::Circuit(built)]).await;

    assert_eq!(published.len(), 1);
    let Payload::CircuitBuilt { data } = &published[0] else {
        panic!("expected CIRC_BUILT, got {:?}", published[0]);
    };

    let roles: Vec<Role> = data.iter().map(|n| n.role).collect();
    assert_eq!(roles, vec![Role::Entry, Role::Middle, Role::Exit]);

    let countries: Vec<&str> = data.iter().map(|n| n.country.as_deref().unwrap()).collect();
    assert_eq!(countries, vec!["de", "nl", "se"]);

    for node in data {
        assert!(node.latitude.is_some());
        assert!(node.longitude.is_some());
        assert!(node.bandwidth.is_some());
    }
}

#[tokio::test]
async fn test_stream_without_circuit_id_produces_no_payload() {
    let (control, geo) = three_relays();
    let metrics = Arc::new(Metrics::new().unwrap());
    let enricher = Enricher::new(control, Arc::new(geo), Arc::clone(&metrics));
    let (queue_tx, queue_rx) = queue::channel(Arc::clone(&metrics));
    let classifier = Classifier::new(enricher, queue_tx, None, metrics);

    let outcome = classifier.handle(succeeded_stream(None)).await;

    assert_eq!(outcome, Classification::Dropped(DropReason::MissingCircuit));
    assert_eq!(queue_rx.len(), 0);
}

#[tokio::test]
async fn test_snapshot_reflects_state_at_dispatch_time() {
    let (control, geo) = three_relays();
    control.set_circuits(vec![circuit("1", &[(FP1, "nickA")])]);

    let metrics = Arc::new(Metrics::new().unwrap());
    let enricher = Enricher::new(Arc::clone(&control), Arc::new(geo), Arc::clone(&metrics));
    let (queue_tx, queue_rx) = queue::channel(Arc::clone(&metrics));
    let transport = Arc::new(RecordingTransport::new());
    let classifier = Classifier::new(enricher.clone(), queue_tx, None, Arc::clone(&metrics));

    let outcome = classifier
        .handle(ControlEvent::Circuit(circuit("1", &[(FP1, "nickA")])))
        .await;
    assert_eq!(outcome, Classification::Queued);

    // The relay moves on before the dispatcher gets to the event.
    control.set_circuits(vec![
        circuit("1", &[(FP1, "nickA")]),
        circuit("2", &[(FP2, "nickB"), (FP3, "nickC")]),
    ]);
    drop(classifier);

    Dispatcher::new(
        queue_rx,
        SnapshotCollector::new(enricher, Arc::clone(&metrics)),
        Arc::clone(&transport),
        Arc::clone(&metrics),
    )
    .run(CancellationToken::new())
    .await;

    let published = transport.published();
    assert_eq!(published.len(), 1, "exactly one snapshot per built circuit");
    let Payload::CircuitBuilt { data } = &published[0] else {
        panic!("expected CIRC_BUILT");
    };
    let ips: Vec<&str> = data.iter().map(|n| n.ip.as_deref().unwrap()).collect();
    assert_eq!(ips, vec!["198.51.100.1", "198.51.100.2", "198.51.100.3"]);
    assert_eq!(metrics.snapshots_taken.get(), 1.0);
}

#[tokio::test]
async fn test_delivery_order_matches_notification_order() {
    let (control, geo) = three_relays();
    control.set_circuits(vec![circuit("5", &[(FP1, "nickA"), (FP3, "nickC")])]);

    let mut events = Vec::new();
    let mut expected = Vec::new();
    for i in 0..30 {
        if i % 3 == 0 {
            events.push(ControlEvent::Circuit(circuit("5", &[(FP1, "nickA"), (FP3, "nickC")])));
            expected.push(Payload::CIRC_BUILT);
        } else {
            events.push(succeeded_stream(Some("5")));
            expected.push(Payload::STREAM_SUCCEEDED);
        }
    }

    let published = run_pipeline(control, geo, events).await;
    let statuses: Vec<&str> = published.iter().map(Payload::status).collect();
    assert_eq!(statuses, expected);
}

#[tokio::test]
async fn test_stream_payload_carries_enriched_path_and_target() {
    let (control, geo) = three_relays();
    control.set_circuits(vec![circuit(
        "9",
        &[(FP1, "nickA"), (FP2, "nickB"), (FP3, "nickC")],
    )]);

    let published = run_pipeline(control, geo, vec![succeeded_stream(Some("9"))]).await;
    assert_eq!(published.len(), 1);

    let value = serde_json::to_value(&published[0]).unwrap();
    assert_eq!(value["status"], "STREAM_SUCCEEDED");
    assert_eq!(value["circuit_id"], "9");
    assert_eq!(value["target_geolocation"]["latitude"], 34.05);
    // The relay's country label wins over the database's "US".
    assert_eq!(value["target_geolocation"]["country"], "us");
    assert_eq!(value["path"][0]["type"], "Entry");
    assert_eq!(value["path"][0]["fingerprint"], FP1);
    assert_eq!(value["path"][1]["bandwidth"], 2500);
    assert_eq!(value["path"][2]["type"], "Exit");
    assert_eq!(value["path"][2]["country"], "se");
}

#[tokio::test]
async fn test_snapshot_never_repeats_an_address() {
    let (control, geo) = three_relays();
    control.set_circuits(vec![
        circuit("1", &[(FP1, "nickA"), (FP2, "nickB"), (FP3, "nickC")]),
        circuit("2", &[(FP3, "nickC"), (FP2, "nickB"), (FP1, "nickA")]),
        circuit("3", &[(FP2, "nickB"), (FP1, "nickA")]),
    ]);

    let metrics = Arc::new(Metrics::new().unwrap());
    let enricher = Enricher::new(control, Arc::new(geo), Arc::clone(&metrics));
    let nodes = SnapshotCollector::new(enricher, metrics)
        .snapshot()
        .await
        .unwrap();

    let addresses: HashSet<_> = nodes.iter().map(|n| n.address.clone()).collect();
    assert_eq!(addresses.len(), nodes.len());
    assert_eq!(nodes.len(), 3);
}
