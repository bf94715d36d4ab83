use cardgate_core::soft::{SoftCard, SoftDriver};
use cardgate_core::{BuiltinAdapter, ContextOptions, SmartcardContext, Status};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const READER: &str = "Soft Contactless 0";

#[test]
fn card_exchanges_never_overlap() {
    let driver = Arc::new(SoftDriver::new([READER]));
    driver.insert_card(READER, SoftCard::new("worker"));
    let ctx = Arc::new(SmartcardContext::new(
        driver.clone(),
        Box::new(BuiltinAdapter::new("contactless")),
        ContextOptions::default(),
    ));

    for _ in 0..4 {
        ctx.iterate();
    }
    assert_eq!(ctx.status(), Status::Authenticated);
    driver.set_exchange_delay(Duration::from_millis(2));

    let running = Arc::new(AtomicBool::new(true));
    let poller = {
        let ctx = ctx.clone();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                assert_eq!(ctx.iterate(), Status::Authenticated);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let signers: Vec<_> = (0..2)
        .map(|worker| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                for round in 0..10 {
                    let payload = format!("worker {worker} round {round}");
                    let mut signature = [0u8; 80];
                    let len = ctx.sign(payload.as_bytes(), &mut signature);
                    assert!(len > 0);
                    assert!(ctx.verify(payload.as_bytes(), &signature[..len]));
                }
            })
        })
        .collect();

    for signer in signers {
        signer.join().unwrap();
    }
    running.store(false, Ordering::SeqCst);
    poller.join().unwrap();

    assert_eq!(driver.overlapping_exchanges(), 0);
    assert!(driver.exchange_count() >= 40);
}
