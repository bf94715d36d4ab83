#![allow(dead_code)]

use cardgate_core::clock::ManualClock;
use cardgate_core::context::{PinPrompt, StatusCallback};
use cardgate_core::soft::SoftDriver;
use cardgate_core::{ContextOptions, CryptoAdapter, SmartcardContext, Status};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const COOLDOWN: Duration = Duration::from_secs(3);

/// Everything a lifecycle test needs to poke at.
pub struct Harness {
    pub driver: Arc<SoftDriver>,
    pub clock: Arc<ManualClock>,
    pub notifications: Arc<AtomicUsize>,
    pub ctx: SmartcardContext,
}

impl Harness {
    pub fn new(
        driver: SoftDriver,
        adapter: Box<dyn CryptoAdapter>,
        on_read_pin: Option<PinPrompt>,
    ) -> Self {
        let driver = Arc::new(driver);
        let clock = Arc::new(ManualClock::new());
        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = notifications.clone();
        let on_status_changed: StatusCallback = Arc::new(move |_ctx: &SmartcardContext| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let options = ContextOptions {
            cooldown: COOLDOWN,
            clock: clock.clone(),
            on_status_changed: Some(on_status_changed),
            on_read_pin,
        };
        let ctx = SmartcardContext::new(driver.clone(), adapter, options);
        Self {
            driver,
            clock,
            notifications,
            ctx,
        }
    }

    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Iterate until `target` is reached, giving up after `max_steps`.
    pub fn run_until(&self, target: Status, max_steps: usize) -> Status {
        let mut status = self.ctx.status();
        for _ in 0..max_steps {
            if status == target {
                break;
            }
            status = self.ctx.iterate();
        }
        status
    }

    /// Iterate `steps` times and return every status observed.
    pub fn steps(&self, steps: usize) -> Vec<Status> {
        (0..steps).map(|_| self.ctx.iterate()).collect()
    }
}
