//! Two producer tiers feeding one consumer through a bounded channel.
//!
//! The tier 3 producer sends 222 every two seconds, the tier 2 producer
//! relays the externally seeded value 111 every second, and the tier 1
//! consumer drains the queue. Press `r` + enter to inject an urgent message
//! from the pump thread: it goes in at the front of the queue, overtaking the
//! whole backlog, and is dropped with a warning if the queue is full.

use std::time::Duration;

use log::{info, warn};
use roost_demos::trigger::{self, TRIGGER_BYTE};
use roost_sync::channel::{Receiver, Sender, TrySendError};
use roost_sync::{make_channel, Priority};

const QUEUE_DEPTH: usize = 5;

/// Payload of the urgent front-insert.
const URGENT_PAYLOAD: i32 = 123_456_789;

/// The value the slower producer relays on behalf of the outside world.
const SEEDED_VALUE: i32 = 111;

async fn producer(
    mut tx: Sender<'static, i32, QUEUE_DEPTH>,
    tier: Priority,
    payload: i32,
    period_ms: u64,
) {
    loop {
        info!("tier {tier}: sending {payload}");
        if tx.send(payload, tier).await.is_err() {
            warn!("tier {tier}: consumer gone, stopping");
            return;
        }

        tokio::time::sleep(Duration::from_millis(period_ms)).await;
    }
}

async fn consumer(mut rx: Receiver<'static, i32, QUEUE_DEPTH>) {
    let tier = Priority::new(1);

    loop {
        match rx.recv(tier).await {
            Ok(value) => info!("tier {tier}: received {value}"),
            Err(_) => {
                warn!("tier {tier}: every producer is gone, stopping");
                return;
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (tx, rx) = make_channel!(i32, QUEUE_DEPTH);
    info!("relay up: queue depth {QUEUE_DEPTH}");

    // One clone of the sender lives on the pump thread for urgent inserts.
    let mut urgent = tx.clone();

    tokio::spawn(producer(tx.clone(), Priority::new(3), 222, 2000));
    tokio::spawn(producer(tx, Priority::new(2), SEEDED_VALUE, 1000));
    tokio::spawn(consumer(rx));

    trigger::spawn_pump(move |byte| {
        if byte != TRIGGER_BYTE {
            return;
        }

        match urgent.send_front_from_interrupt(URGENT_PAYLOAD) {
            Ok(Some(woken)) => {
                info!("trigger: urgent {URGENT_PAYLOAD} queued, woke the tier {woken} consumer")
            }
            Ok(None) => info!("trigger: urgent {URGENT_PAYLOAD} queued"),
            Err(TrySendError::Full(val)) => warn!("trigger: queue full, dropped urgent {val}"),
            Err(TrySendError::NoReceiver(val)) => {
                warn!("trigger: consumer gone, dropped urgent {val}")
            }
        }
    });
    info!("press 'r' + enter to inject an urgent message");

    std::future::pending::<()>().await;
}
