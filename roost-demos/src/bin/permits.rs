//! Four worker tiers contending for three permits.
//!
//! The guard starts empty. The tier 3 worker seeds it with three releases at
//! startup, after which the only replenishment is the trigger burst: workers
//! read a slot and keep their permit, so the supply drains after three
//! acquires and every tier ends up parked. Press `r` + enter to release a
//! burst of three permits and watch the waiters come back in priority order,
//! highest tier first.
//!
//! The sleep intervals are longer for the higher tiers on purpose, so the
//! low tiers ask for permits more often and are still always overtaken while
//! a higher tier is waiting.

use std::time::Duration;

use log::info;
use roost_demos::pool::SlotPool;
use roost_demos::trigger::{self, TRIGGER_BYTE};
use roost_sync::semaphore::Semaphore;
use roost_sync::Priority;

static GUARD: Semaphore = Semaphore::new(3, 0);
static POOL: SlotPool<3> = SlotPool::new([111, 222, 333]);

/// Permits released per trigger byte.
const BURST: usize = 3;

/// The tier 3 worker. Seeds the permit supply exactly once before entering
/// the same loop as everyone else, and reports the free count on each pass.
async fn lead_worker() {
    let tier = Priority::new(3);

    info!("tier {tier}: seeding {} permits", GUARD.capacity());
    for _ in 0..GUARD.capacity() {
        GUARD.release();
    }

    loop {
        info!("tier {tier}: {} permits free, acquiring", GUARD.count());
        GUARD.acquire(tier).await;

        let value = POOL.read_next();
        info!("tier {tier}: read slot value {value}, keeping the permit");

        tokio::time::sleep(Duration::from_millis(3000)).await;
    }
}

async fn worker(tier: Priority, rest_ms: u64) {
    loop {
        info!("tier {tier}: acquiring");
        GUARD.acquire(tier).await;

        let value = POOL.read_next();
        info!("tier {tier}: read slot value {value}, keeping the permit");

        tokio::time::sleep(Duration::from_millis(rest_ms)).await;
    }
}

/// Runs on the pump thread, so only the interrupt-safe calls are allowed.
fn on_byte(byte: u8) {
    if byte != TRIGGER_BYTE {
        return;
    }

    for _ in 0..BURST {
        match GUARD.release_from_interrupt() {
            Some(woken) => info!("trigger: released one permit, woke a tier {woken} waiter"),
            None => info!("trigger: released one permit, no waiter"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!(
        "guard up: capacity {}, {} permits free",
        GUARD.capacity(),
        GUARD.count()
    );

    tokio::spawn(lead_worker());
    tokio::spawn(worker(Priority::new(2), 3000));
    tokio::spawn(worker(Priority::new(1), 2000));
    tokio::spawn(worker(Priority::new(0), 1000));

    trigger::spawn_pump(on_byte);
    info!("press 'r' + enter to release a burst of {BURST} permits");

    std::future::pending::<()>().await;
}
