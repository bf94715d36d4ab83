//! Cardgate daemon: polls the smartcard context and reports card health.

use anyhow::{Context, Result};
use cardgate_core::{
    adapter,
    context::{PinPrompt, StatusCallback},
    logging,
    soft::SoftDriver,
    CardgateConfig, ContextOptions, SmartcardContext, Status,
};
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{
    select, signal,
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use zeroize::Zeroizing;

mod health;

use health::Health;

#[derive(Parser, Debug)]
#[command(
    name = "cardgate-daemon",
    version,
    about = "Smartcard authentication and signing daemon."
)]
struct Args {
    /// Path to the Cardgate configuration file.
    #[arg(short, long, env = "CARDGATE_CONFIG", default_value = "/etc/cardgate.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run(Args::parse()).await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    logging::init("info");
    let config = CardgateConfig::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;

    info!(
        "Cardgate daemon booting (config: {}, protocol: {:?})",
        args.config.display(),
        config.card.protocol
    );

    let driver = Arc::new(SoftDriver::from_config(&config.driver));
    let options = ContextOptions {
        cooldown: config.cooldown(),
        on_status_changed: Some(status_logger()),
        on_read_pin: Some(env_pin_prompt(config.pin.env.clone())),
        ..ContextOptions::default()
    };
    let ctx = SmartcardContext::new(driver, adapter::from_config(&config.card), options);

    let (health_tx, health_rx) = watch::channel(Health::from_snapshot(&ctx.snapshot()));
    let health_handle = tokio::spawn(health::serve(config.health.addr.clone(), health_rx));

    select! {
        res = poll(&ctx, &config, health_tx) => res?,
        res = health_handle => res??,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    ctx.done();
    info!("smartcard context released");
    Ok(())
}

/// Drive the lifecycle one step per tick and publish the result.
async fn poll(
    ctx: &SmartcardContext,
    config: &CardgateConfig,
    health_tx: watch::Sender<Health>,
) -> Result<()> {
    let mut ticker = interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = ctx.status();
    loop {
        ticker.tick().await;
        let status = ctx.iterate();
        if status != last {
            debug!("poll: {last} -> {status}");
            last = status;
        }
        let health = Health::from_snapshot(&ctx.snapshot());
        health_tx.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }
}

fn status_logger() -> StatusCallback {
    Arc::new(|ctx: &SmartcardContext| {
        let snapshot = ctx.snapshot();
        let reader = snapshot.reader_name.as_deref().unwrap_or("?");
        match (snapshot.status, snapshot.display_name) {
            (Status::Authenticated, Some(name)) => {
                info!("card authenticated for {name} on {reader}")
            }
            (status, _) => warn!("card authentication lost on {reader} ({status})"),
        }
    })
}

/// PIN prompt backed by an environment variable. An unset or empty variable
/// declines the prompt.
fn env_pin_prompt(var: String) -> PinPrompt {
    Arc::new(move |_ctx: &SmartcardContext, reader: &str| {
        match std::env::var(&var) {
            Ok(pin) if !pin.is_empty() => {
                debug!("pin for {reader} read from {var}");
                Some(Zeroizing::new(pin.into_bytes()))
            }
            _ => {
                debug!("{var} not set; declining pin for {reader}");
                None
            }
        }
    })
}
