//! A test that verifies timeouts wrapped around futures that park in other
//! wait queues.
//!
//! To run this test, you need to activate the `critical-section/std` feature.

use cassette::Cassette;
use parking_lot::Mutex;
use roost_sync::semaphore::Semaphore;
use roost_sync::Priority;
use roost_time::{Monotonic, TimeoutError, TimerQueue};

static NOW: Mutex<Option<Instant>> = Mutex::new(None);
static COMPARE: Mutex<Option<Instant>> = Mutex::new(None);
static TIMER_QUEUE: TimerQueue<TestMono> = TimerQueue::new();

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct Duration(u64);

impl Duration {
    pub fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct Instant(u64);

impl Instant {
    const ZERO: Self = Self(0);

    pub fn tick() {
        // The first tick starts the clock at zero, later ones move it
        // forward by one.
        if NOW.lock().is_none() {
            *NOW.lock() = Some(Instant::ZERO);
        } else {
            let now = Instant::now();
            *NOW.lock() = Some(now + Duration(1));
        }

        TestMono::tick(false);
    }

    pub fn now() -> Self {
        NOW.lock().clone().unwrap_or(Instant::ZERO)
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl core::ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl core::ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Self::Output {
        Duration(self.0 - rhs.0)
    }
}

pub struct TestMono;

impl TestMono {
    pub fn tick(force_interrupt: bool) -> bool {
        let now = Instant::now();

        let compare_reached = Some(now) == *COMPARE.lock();
        let interrupt = compare_reached || force_interrupt;

        if interrupt {
            unsafe {
                TestMono::queue().on_monotonic_interrupt();
            }
            true
        } else {
            false
        }
    }

    /// Initialize the monotonic.
    pub fn init() {
        Self::queue().initialize(Self);
    }

    /// Used to access the underlying timer queue
    pub fn queue() -> &'static TimerQueue<TestMono> {
        &TIMER_QUEUE
    }
}

impl Monotonic for TestMono {
    type Instant = Instant;

    type Duration = Duration;

    fn now() -> Self::Instant {
        Instant::now()
    }

    fn set_compare(instant: Self::Instant) {
        let _ = COMPARE.lock().insert(instant);
    }

    fn clear_compare_flag() {}

    fn pend_interrupt() {
        Self::tick(true);
    }
}

#[test]
fn timeout() {
    TestMono::init();

    static GUARD: Semaphore = Semaphore::new(1, 0);

    // A release arrives before this deadline, so the wrapped wait wins.
    let won = async {
        let res = TestMono::queue()
            .timeout_after(Duration::from_ticks(10), GUARD.acquire(Priority::new(2)))
            .await;
        assert_eq!(res, Ok(()));
        assert_eq!(Instant::now(), Instant(3));
    };

    // No release ever reaches this waiter, so its deadline fires.
    let lost = async {
        let res = TestMono::queue()
            .timeout_after(Duration::from_ticks(5), GUARD.acquire(Priority::new(1)))
            .await;
        assert_eq!(res, Err(TimeoutError));
        assert_eq!(Instant::now(), Instant(5));
    };

    macro_rules! cassette {
        ($($x:ident),* $(,)?) => { $(
            // Move the value to ensure that it is owned
            let mut $x = $x;
            // Shadow the original binding so that it can't be directly accessed
            // ever again.
            #[allow(unused_mut)]
            let mut $x = unsafe {
                core::pin::Pin::new_unchecked(&mut $x)
            };

            let mut $x = Cassette::new($x);
        )* }
    }

    macro_rules! poll {
        ($($fut:ident),*) => {
            $(if !$fut.is_done() {
                    $fut.poll_on();
            })*
        };
    }

    cassette!(won, lost);

    // Park both waiters and both deadlines.
    poll!(won, lost);

    for _ in 0..20 {
        Instant::tick();

        if Instant::now() == Instant(3) {
            GUARD.release();
        }

        poll!(won, lost);
    }

    assert!(won.is_done() && lost.is_done());

    // The timed out waiter left the wait queue behind it, so a release
    // now refills the counter instead of picking a waiter.
    GUARD.release();
    assert_eq!(GUARD.count(), 1);
}
