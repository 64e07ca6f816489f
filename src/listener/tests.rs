use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::handler::{HandlerFailure, call_handler};
use super::{
    BroadcastListener, BroadcastOutcome, Delivery, QueueHandler, QueueListener, QueueOutcome,
    broadcast_fn, queue_fn,
};
use crate::config::QueueSettings;
use crate::dispatch::{AccessPoint, EntryHandler, GroupEntry, RecordHandler, SubscriptionId};
use crate::interceptor::{Interceptor, InterceptorChain, MessageContext};
use crate::message::{BroadcastMessage, QueueMessage};
use crate::persistence::EntryId;
use crate::utils::error::{AccessError, ListenerError};

type Events = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PriceChanged {
    sku: String,
    cents: u64,
}

impl BroadcastMessage for PriceChanged {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShipOrder {
    order_id: u64,
}

impl QueueMessage for ShipOrder {
    fn topic(&self) -> String {
        "fulfilment.ship".to_string()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Unnamed;

impl QueueMessage for Unnamed {
    fn topic(&self) -> String {
        String::new()
    }
}

struct Tap {
    name: &'static str,
    events: Events,
    fail_before: bool,
}

impl Interceptor for Tap {
    fn name(&self) -> &str {
        self.name
    }

    fn before_handle(&self, ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("before:{}:{}", self.name, ctx.identifier));
        if self.fail_before {
            anyhow::bail!("tap {} failed", self.name);
        }
        Ok(())
    }

    fn after_handle(&self, _ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("after:{}", self.name));
        Ok(())
    }
}

/// Access point double that records acknowledgments into the shared event log.
struct FakeAccess {
    chain: InterceptorChain,
    events: Events,
    fail_ack: bool,
}

impl FakeAccess {
    fn new(events: &Events, taps: &[(&'static str, bool)]) -> Self {
        let chain = taps
            .iter()
            .map(|&(name, fail_before)| {
                Arc::new(Tap {
                    name,
                    events: Arc::clone(events),
                    fail_before,
                }) as Arc<dyn Interceptor>
            })
            .collect();
        Self {
            chain,
            events: Arc::clone(events),
            fail_ack: false,
        }
    }

    fn acks(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("ack"))
            .count()
    }
}

impl AccessPoint for FakeAccess {
    fn acknowledge(&self, topic: &str, group: &str, id: EntryId) -> Result<u64, AccessError> {
        self.events.lock().unwrap().push(format!("ack:{id}"));
        if self.fail_ack {
            return Err(AccessError::UnknownGroup {
                topic: topic.to_string(),
                group: group.to_string(),
            });
        }
        Ok(1)
    }

    fn interceptors(&self) -> &InterceptorChain {
        &self.chain
    }

    fn subscribe(
        &self,
        _channel: &str,
        _handler: Arc<dyn RecordHandler>,
    ) -> Result<SubscriptionId, AccessError> {
        Ok(1)
    }

    fn consume(
        &self,
        _topic: &str,
        _group: &str,
        _consumer: &str,
        _handler: Arc<dyn EntryHandler>,
    ) -> Result<SubscriptionId, AccessError> {
        Ok(2)
    }

    fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), AccessError> {
        Ok(())
    }
}

fn entry(payload: &[u8]) -> GroupEntry {
    GroupEntry {
        id: EntryId { millis: 1, seq: 7 },
        topic: "fulfilment.ship".to_string(),
        group: "warehouse".to_string(),
        consumer: "c1".to_string(),
        payload: Arc::from(payload),
        delivery_count: 1,
    }
}

fn recording_broadcast(
    events: &Events,
    fail: bool,
) -> BroadcastListener<impl super::BroadcastHandler<Message = PriceChanged>> {
    let events = Arc::clone(events);
    BroadcastListener::new(broadcast_fn(move |_channel: &str, m: &PriceChanged| {
        events.lock().unwrap().push(format!("handle:{}", m.sku));
        if fail {
            anyhow::bail!("price feed rejected {}", m.sku);
        }
        Ok(())
    }))
    .unwrap()
}

fn recording_queue(events: &Events, fail: bool) -> QueueListener<impl QueueHandler<Message = ShipOrder>> {
    let events = Arc::clone(events);
    QueueListener::new(
        queue_fn(move |_d: &Delivery<'_>, m: &ShipOrder| {
            events.lock().unwrap().push(format!("handle:{}", m.order_id));
            if fail {
                panic!("carrier unavailable");
            }
            Ok(())
        }),
        "warehouse",
    )
    .unwrap()
}

const PRICE: &[u8] = br#"{"sku":"A-1","cents":250}"#;
const ORDER: &[u8] = br#"{"order_id":9}"#;

#[test]
fn test_broadcast_listener_resolves_channel_from_type() {
    let events = Events::default();
    let listener = recording_broadcast(&events, false);
    assert_eq!(listener.channel(), "PriceChanged");
    assert!(listener.payload_type().type_name.ends_with("PriceChanged"));
}

#[test]
fn test_broadcast_runs_interceptors_around_handler() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[("a", false), ("b", false)]);
    let listener = recording_broadcast(&events, false);

    let outcome = listener.process(&access, "PriceChanged", PRICE);

    assert_eq!(outcome, BroadcastOutcome::Handled);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "before:a:PriceChanged",
            "before:b:PriceChanged",
            "handle:A-1",
            "after:b",
            "after:a"
        ]
    );
}

#[test]
fn test_broadcast_after_interceptors_run_when_handler_fails() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[("a", false), ("b", false)]);
    let listener = recording_broadcast(&events, true);

    let outcome = listener.process(&access, "PriceChanged", PRICE);

    assert_eq!(outcome, BroadcastOutcome::Failed);
    let log = events.lock().unwrap();
    assert_eq!(log.iter().filter(|e| e.starts_with("after:")).count(), 2);
    assert_eq!(&log[3..], ["after:b", "after:a"]);
}

#[test]
fn test_broadcast_drops_undecodable_record() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[("a", false)]);
    let listener = recording_broadcast(&events, false);

    assert_eq!(
        listener.process(&access, "PriceChanged", b"not json"),
        BroadcastOutcome::Dropped
    );
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn test_failing_before_interceptor_does_not_block_handler() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[("broken", true), ("ok", false)]);
    let listener = recording_broadcast(&events, false);

    assert_eq!(
        listener.process(&access, "PriceChanged", PRICE),
        BroadcastOutcome::Handled
    );
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "before:broken:PriceChanged",
            "before:ok:PriceChanged",
            "handle:A-1",
            "after:ok",
            "after:broken"
        ]
    );
}

#[test]
fn test_queue_success_acks_once_before_after_interceptors() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[("a", false)]);
    let listener = recording_queue(&events, false);

    let outcome = listener.process(&access, &entry(ORDER));

    assert_eq!(outcome, QueueOutcome::Acknowledged);
    assert_eq!(access.acks(), 1);
    assert_eq!(
        *events.lock().unwrap(),
        vec!["before:a:fulfilment.ship", "handle:9", "ack:1-7", "after:a"]
    );
}

#[test]
fn test_queue_handler_failure_is_never_acked() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[("a", false)]);
    let listener = recording_queue(&events, true);

    let outcome = listener.process(&access, &entry(ORDER));

    assert_eq!(outcome, QueueOutcome::HandlerFailed);
    assert_eq!(access.acks(), 0);
    assert_eq!(events.lock().unwrap().last().unwrap(), "after:a");
}

#[test]
fn test_queue_poison_entry_is_acked_without_handling() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[("a", false)]);
    let listener = recording_queue(&events, false);

    let outcome = listener.process(&access, &entry(b"{{{"));

    assert_eq!(outcome, QueueOutcome::Poisoned { acknowledged: true });
    assert_eq!(*events.lock().unwrap(), vec!["ack:1-7"]);
}

#[test]
fn test_queue_ack_failure_still_runs_after_interceptors() {
    let events = Events::default();
    let mut access = FakeAccess::new(&events, &[("a", false)]);
    access.fail_ack = true;
    let listener = recording_queue(&events, false);

    let outcome = listener.process(&access, &entry(ORDER));

    assert_eq!(outcome, QueueOutcome::AckFailed);
    assert_eq!(access.acks(), 1);
    assert_eq!(events.lock().unwrap().last().unwrap(), "after:a");
}

struct Shipper {
    seen: Mutex<HashSet<String>>,
    shipments: AtomicUsize,
}

impl QueueHandler for Shipper {
    type Message = ShipOrder;

    fn on_message(&self, delivery: &Delivery<'_>, _message: &ShipOrder) -> anyhow::Result<()> {
        if self.seen.lock().unwrap().insert(delivery.dedup_key()) {
            self.shipments.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn test_redelivered_entry_is_handled_idempotently() {
    let events = Events::default();
    let access = FakeAccess::new(&events, &[]);
    let listener = QueueListener::new(
        Shipper {
            seen: Mutex::default(),
            shipments: AtomicUsize::new(0),
        },
        "warehouse",
    )
    .unwrap();

    let first = entry(ORDER);
    let mut again = entry(ORDER);
    again.delivery_count = 2;

    assert_eq!(listener.process(&access, &first), QueueOutcome::Acknowledged);
    assert_eq!(listener.process(&access, &again), QueueOutcome::Acknowledged);
    assert_eq!(listener.handler().shipments.load(Ordering::SeqCst), 1);
    assert_eq!(access.acks(), 2);
}

#[test]
fn test_queue_listener_requires_group() {
    let err = QueueListener::new(
        queue_fn(|_: &Delivery<'_>, _: &ShipOrder| Ok(())),
        "  ",
    )
    .unwrap_err();
    assert!(matches!(err, ListenerError::MissingGroup { .. }));
}

#[test]
fn test_queue_listener_fails_construction_for_blank_topic() {
    let err = QueueListener::new(queue_fn(|_: &Delivery<'_>, _: &Unnamed| Ok(())), "g").unwrap_err();
    let text = err.to_string();
    assert!(text.contains("Unnamed"));
    assert!(text.contains("type Message = T"));
}

#[test]
fn test_queue_listener_names() {
    let listener = QueueListener::new(queue_fn(|_: &Delivery<'_>, _: &ShipOrder| Ok(())), "g").unwrap();
    assert_eq!(listener.topic(), "fulfilment.ship");
    assert_eq!(listener.group(), "g");
    assert!(listener.consumer().starts_with("consumer-"));

    let settings = QueueSettings {
        group: "warehouse".into(),
        consumer: Some("dock-3".into()),
        ..QueueSettings::default()
    };
    let configured =
        QueueListener::from_settings(queue_fn(|_: &Delivery<'_>, _: &ShipOrder| Ok(())), &settings)
            .unwrap();
    assert_eq!(configured.group(), "warehouse");
    assert_eq!(configured.consumer(), "dock-3");
}

#[test]
fn test_delivery_dedup_key() {
    let delivery = Delivery {
        topic: "fulfilment.ship",
        group: "warehouse",
        consumer: "c1",
        entry_id: EntryId { millis: 5, seq: 3 },
        delivery_count: 2,
    };
    assert_eq!(delivery.dedup_key(), "fulfilment.ship:5-3");
    assert!(delivery.is_redelivery());
}

#[test]
fn test_handler_panic_reports_where_it_happened() {
    let failure = call_handler(|| panic!("carrier unavailable")).unwrap_err();

    match &failure {
        HandlerFailure::Panic {
            message, location, ..
        } => {
            assert_eq!(message, "carrier unavailable");
            assert!(location.as_deref().is_some_and(|l| l.contains("tests.rs")));
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    let rendered = failure.to_string();
    assert!(rendered.starts_with("handler panicked at "));
    assert!(rendered.contains("carrier unavailable"));
}

#[test]
fn test_handler_error_is_not_a_panic() {
    let failure = call_handler(|| anyhow::bail!("ledger offline")).unwrap_err();
    assert!(matches!(failure, HandlerFailure::Error(_)));
    assert!(failure.to_string().contains("ledger offline"));
}
