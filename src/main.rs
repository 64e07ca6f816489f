use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::codec::JsonCodec;
use courier::config::load_config;
use courier::dispatch::MemoryBroker;
use courier::interceptor::LoggingInterceptor;
use courier::listener::{BroadcastListener, Delivery, QueueHandler, QueueListener, broadcast_fn};
use courier::message::{BroadcastMessage, QueueMessage};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheEvicted {
    key: String,
}

impl BroadcastMessage for CacheEvicted {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    total_cents: u64,
}

impl QueueMessage for OrderPlaced {
    fn topic(&self) -> String {
        "orders.placed".to_string()
    }
}

/// Records each order once, however often it is delivered.
#[derive(Default)]
struct OrderLedger {
    seen: Mutex<HashSet<String>>,
}

impl QueueHandler for OrderLedger {
    type Message = OrderPlaced;

    fn on_message(&self, delivery: &Delivery<'_>, order: &OrderPlaced) -> anyhow::Result<()> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if !seen.insert(delivery.dedup_key()) {
            info!(order_id = order.order_id, "duplicate delivery skipped");
            return Ok(());
        }
        info!(
            order_id = order.order_id,
            total_cents = order.total_cents,
            consumer = delivery.consumer,
            "order recorded"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        courier::utils::logging::init("info");
        error!("courier failed: {e:?}");
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_config()?;
    courier::utils::logging::init(&config.logging.level);

    let broker = MemoryBroker::builder()
        .interceptor(LoggingInterceptor)
        .store(config.store.open()?)
        .build()?;

    let evictions = BroadcastListener::new(broadcast_fn(|channel: &str, m: &CacheEvicted| {
        info!(channel, key = %m.key, "cache entry evicted");
        Ok(())
    }))?;
    Arc::new(evictions).start(&broker)?;

    let orders = QueueListener::from_settings(OrderLedger::default(), &config.queue)?;
    Arc::new(orders).start(&broker)?;

    tokio::spawn(broker.clone().run_reclaim_loop(
        Duration::from_millis(config.queue.reclaim_interval_ms),
        Duration::from_millis(config.queue.reclaim_min_idle_ms),
        config.queue.max_deliveries,
    ));

    let codec = JsonCodec;
    broker.publish_message(
        &codec,
        &CacheEvicted {
            key: "user:42".into(),
        },
    )?;
    for order_id in 1..=3 {
        broker.append_message(
            &codec,
            &OrderPlaced {
                order_id,
                total_cents: order_id * 1_250,
            },
        )?;
    }

    info!("courier running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    broker.shutdown();
    broker.store().flush()?;
    Ok(())
}
