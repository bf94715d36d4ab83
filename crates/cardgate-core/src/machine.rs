//! Single-step lifecycle driver. Every call performs at most one transition
//! and only issues zero-timeout driver waits, so it always returns promptly.

use crate::adapter::{Discovery, Establish};
use crate::context::{clear_identity, CardState, SmartcardContext, Status};
use crate::driver::{CardChannel, NO_WAIT};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::sync::MutexGuard;
use zeroize::Zeroizing;

impl SmartcardContext {
    /// Advance the lifecycle by one step and return the resulting status.
    ///
    /// Meant to be called repeatedly from a single polling thread. The
    /// status-changed callback fires from here, after the lock is released.
    pub fn iterate(&self) -> Status {
        let mut state = self.lock();
        let current = state.status;
        let notify = match current {
            Status::Idle => {
                self.step_idle(&mut state);
                false
            }
            Status::WaitCard => {
                self.step_wait_card(&mut state);
                false
            }
            Status::Activating => {
                self.step_activate(&mut state);
                false
            }
            Status::Credential => {
                let (guard, notify) = self.step_credential(state);
                state = guard;
                notify
            }
            Status::Authenticated => self.step_authenticated(&mut state),
            Status::Error => {
                self.step_error(&mut state);
                false
            }
            Status::Cooldown => {
                self.step_cooldown(&mut state);
                false
            }
            Status::Reset => {
                self.step_reset(&mut state);
                false
            }
        };
        let status = state.status;
        drop(state);

        if notify {
            self.notify_status_changed();
        }
        status
    }

    fn step_idle(&self, state: &mut CardState) {
        let ctx = match state.reader_ctx {
            Some(ctx) => ctx,
            None => match self.driver.connect() {
                Ok(ctx) => {
                    state.reader_ctx = Some(ctx);
                    ctx
                }
                Err(err) => {
                    debug!("smartcard connect failed: {err}");
                    return;
                }
            },
        };

        let readers = match self.driver.list_readers(ctx) {
            Ok(readers) if !readers.is_empty() => readers,
            Ok(_) => {
                debug!("no smartcard readers attached");
                self.release_reader(state);
                return;
            }
            Err(err) => {
                debug!("smartcard reader enumeration failed: {err}");
                self.release_reader(state);
                return;
            }
        };

        state.reader_name = None;
        match self.adapter.discover(self.driver.as_ref(), ctx, &readers) {
            Some(Discovery::Reader(reader)) => {
                state.reader_name = Some(reader);
                enter(state, Status::WaitCard);
            }
            Some(Discovery::Card {
                reader,
                card,
                protocol,
            }) => {
                state.reader_name = Some(reader);
                state.card = Some(card);
                state.protocol = protocol;
                enter(state, Status::Credential);
            }
            None => {}
        }
    }

    fn step_wait_card(&self, state: &mut CardState) {
        let (Some(ctx), Some(reader)) = (state.reader_ctx, state.reader_name.clone()) else {
            enter(state, Status::Reset);
            return;
        };
        match self.driver.wait_for_card(ctx, &reader, NO_WAIT) {
            Ok(true) => enter(state, Status::Activating),
            Ok(false) => {}
            Err(err) => {
                warn!("smartcard error {err}");
                enter(state, Status::Error);
            }
        }
    }

    fn step_activate(&self, state: &mut CardState) {
        let (Some(ctx), Some(reader)) = (state.reader_ctx, state.reader_name.clone()) else {
            enter(state, Status::Reset);
            return;
        };
        match self.driver.activate_card(ctx, &reader) {
            Ok((card, protocol)) => {
                state.card = Some(card);
                state.protocol = protocol;
                enter(state, Status::Credential);
            }
            Err(err) => {
                warn!("smartcard error {err}");
                enter(state, Status::Error);
            }
        }
    }

    /// Establish the card's credential. The PIN prompt runs with the lock
    /// released, so the guard is handed back to the caller.
    fn step_credential<'a>(
        &'a self,
        mut state: MutexGuard<'a, CardState>,
    ) -> (MutexGuard<'a, CardState>, bool) {
        let Some(card) = state.card else {
            enter(&mut state, Status::Error);
            return (state, false);
        };

        let mut pin: Option<Zeroizing<Vec<u8>>> = None;
        if self.adapter.requires_pin() {
            let reader = state.reader_name.clone().unwrap_or_default();
            if let Some(prompt) = self.options.on_read_pin.clone() {
                drop(state);
                pin = prompt(self, &reader);
                state = self.lock();
                if state.status != Status::Credential || state.card != Some(card) {
                    return (state, false);
                }
            }
        }

        let channel = CardChannel::new(self.driver.as_ref(), card, state.protocol);
        match self.adapter.establish(channel, pin.as_ref().map(|p| p.as_slice())) {
            Establish::Ready(identity) => {
                info!(
                    "using smart card for {} (public key sha256 {})",
                    identity.display_name,
                    hex::encode(Sha256::digest(&identity.public_key[..]))
                );
                state.public_key = identity.public_key;
                state.display_name = identity.display_name;
                enter(&mut state, Status::Authenticated);
                (state, true)
            }
            Establish::Declined => {
                info!(
                    "no pin supplied for {}; back to reader discovery",
                    state.reader_name.as_deref().unwrap_or("?")
                );
                self.decline(&mut state);
                (state, false)
            }
            Establish::Failed => {
                enter(&mut state, Status::Error);
                (state, false)
            }
        }
    }

    /// Drop the card without treating it as a fault and rescan the readers.
    /// The driver context stays connected.
    fn decline(&self, state: &mut CardState) {
        self.release_card(state);
        state.reader_name = None;
        enter(state, Status::Idle);
    }

    /// Returns true when authentication was lost, either because the card
    /// left the reader or because a sign/verify exchange hit a driver fault.
    fn step_authenticated(&self, state: &mut CardState) -> bool {
        if state.driver_fault {
            warn!(
                "driver fault on reader {} during card operation",
                state.reader_name.as_deref().unwrap_or("?")
            );
        } else if self.card_removed(state) {
            info!(
                "smart card left reader {}",
                state.reader_name.as_deref().unwrap_or("?")
            );
        } else {
            return false;
        }
        clear_identity(state);
        enter(state, Status::Error);
        true
    }

    fn step_error(&self, state: &mut CardState) {
        self.release_card(state);
        state.cooldown_started = Some(self.options.clock.now());
        enter(state, Status::Cooldown);
    }

    fn step_cooldown(&self, state: &mut CardState) {
        let elapsed = state
            .cooldown_started
            .map(|started| self.options.clock.now().saturating_duration_since(started))
            .unwrap_or(self.options.cooldown);
        if self.card_removed(state) || elapsed >= self.options.cooldown {
            enter(state, Status::Reset);
        }
    }

    fn step_reset(&self, state: &mut CardState) {
        self.release_reader(state);
        state.cooldown_started = None;
        enter(state, Status::Idle);
    }

    /// Non-blocking removal poll; driver faults count as removal.
    fn card_removed(&self, state: &CardState) -> bool {
        let (Some(ctx), Some(reader)) = (state.reader_ctx, state.reader_name.as_deref()) else {
            return true;
        };
        match self.driver.wait_for_card_removal(ctx, reader, NO_WAIT) {
            Ok(removed) => removed,
            Err(err) => {
                warn!("smartcard error {err}");
                true
            }
        }
    }
}

fn enter(state: &mut CardState, next: Status) {
    debug!("smartcard status {} -> {}", state.status, next);
    state.status = next;
}
