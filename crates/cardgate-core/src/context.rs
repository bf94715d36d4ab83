//! Shared smartcard context: the lock-protected record of reader, card,
//! credentials and lifecycle status.

use crate::adapter::CryptoAdapter;
use crate::clock::{Clock, SystemClock};
use crate::driver::{CardChannel, CardDriver, CardHandle, ProtocolId, ReaderContext};
use crate::error::CardgateError;
use log::{debug, error, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use zeroize::{Zeroize, Zeroizing};

/// Lifecycle state of a reader/card pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// No reader bound.
    Idle,
    /// Reader bound, waiting for a card.
    WaitCard,
    /// Card present, not yet activated.
    Activating,
    /// Card activated, credential not yet established.
    Credential,
    /// Card usable for sign and verify.
    Authenticated,
    /// Fault detected; the card handle is released on the next step.
    Error,
    /// Waiting out the minimum dwell after a fault.
    Cooldown,
    /// Reader and card are released on the next step.
    Reset,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::WaitCard => "wait-card",
            Status::Activating => "activating",
            Status::Credential => "credential",
            Status::Authenticated => "authenticated",
            Status::Error => "error",
            Status::Cooldown => "cooldown",
            Status::Reset => "reset",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoked when the context enters or leaves `Authenticated`. Runs without the
/// context lock held and may call back into the context; fields read from it
/// may already have moved on.
pub type StatusCallback = Arc<dyn Fn(&SmartcardContext) + Send + Sync>;

/// Supplies the PIN for the card in the named reader. `None` declines.
pub type PinPrompt = Arc<dyn Fn(&SmartcardContext, &str) -> Option<Zeroizing<Vec<u8>>> + Send + Sync>;

/// Tunables and callbacks fixed at construction time.
#[derive(Clone)]
pub struct ContextOptions {
    pub cooldown: Duration,
    pub clock: Arc<dyn Clock>,
    pub on_status_changed: Option<StatusCallback>,
    pub on_read_pin: Option<PinPrompt>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3),
            clock: Arc::new(SystemClock),
            on_status_changed: None,
            on_read_pin: None,
        }
    }
}

/// Copy of the observable context fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub status: Status,
    pub reader_name: Option<String>,
    pub display_name: Option<String>,
    pub public_key: Vec<u8>,
}

/// Fields guarded by the context lock.
pub(crate) struct CardState {
    pub(crate) status: Status,
    pub(crate) reader_ctx: Option<ReaderContext>,
    pub(crate) card: Option<CardHandle>,
    pub(crate) protocol: ProtocolId,
    pub(crate) reader_name: Option<String>,
    pub(crate) public_key: Zeroizing<Vec<u8>>,
    pub(crate) display_name: String,
    pub(crate) cooldown_started: Option<Instant>,
    /// Set when a sign/verify exchange failed in the driver; the next
    /// `iterate` treats it like a removal.
    pub(crate) driver_fault: bool,
}

impl CardState {
    fn new() -> Self {
        Self {
            status: Status::Idle,
            reader_ctx: None,
            card: None,
            protocol: 0,
            reader_name: None,
            public_key: Zeroizing::new(Vec::new()),
            display_name: String::new(),
            cooldown_started: None,
            driver_fault: false,
        }
    }
}

/// One physical slot: driver, crypto adapter and the state they share.
///
/// `iterate` advances the lifecycle from one polling thread; `sign` and
/// `verify` may be called from any thread at any time. All of them serialize
/// on the same lock, so at most one card exchange is in flight.
pub struct SmartcardContext {
    pub(crate) state: Mutex<CardState>,
    pub(crate) driver: Arc<dyn CardDriver>,
    pub(crate) adapter: Box<dyn CryptoAdapter>,
    pub(crate) options: ContextOptions,
}

impl SmartcardContext {
    pub fn new(
        driver: Arc<dyn CardDriver>,
        adapter: Box<dyn CryptoAdapter>,
        options: ContextOptions,
    ) -> Self {
        debug!("smartcard context created ({} protocol)", adapter.name());
        Self {
            state: Mutex::new(CardState::new()),
            driver,
            adapter,
            options,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn protocol_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == Status::Authenticated
    }

    pub fn reader_name(&self) -> Option<String> {
        self.lock().reader_name.clone()
    }

    /// Public key of the authenticated card.
    pub fn public_key(&self) -> Option<Vec<u8>> {
        let state = self.lock();
        (state.status == Status::Authenticated && !state.public_key.is_empty())
            .then(|| state.public_key.to_vec())
    }

    /// Cardholder name of the authenticated card.
    pub fn display_name(&self) -> Option<String> {
        let state = self.lock();
        (state.status == Status::Authenticated).then(|| state.display_name.clone())
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.lock();
        let authenticated = state.status == Status::Authenticated;
        ContextSnapshot {
            status: state.status,
            reader_name: state.reader_name.clone(),
            display_name: authenticated.then(|| state.display_name.clone()),
            public_key: if authenticated {
                state.public_key.to_vec()
            } else {
                Vec::new()
            },
        }
    }

    /// Sign `payload` with the card. Writes at most `signature.len()` bytes and
    /// returns how many were written; 0 on bad input, when no card is
    /// authenticated, or on any card failure.
    pub fn sign(&self, payload: &[u8], signature: &mut [u8]) -> usize {
        if payload.is_empty() || signature.is_empty() {
            return 0;
        }
        let mut state = self.lock();
        let Some(channel) = self.authenticated_channel(&state) else {
            return 0;
        };
        match self.adapter.sign(channel, payload, signature) {
            Ok(written) => written,
            Err(err) => {
                record_failure(&mut state, "sign", &err);
                0
            }
        }
    }

    /// Ask the card whether `signature` covers `payload`.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        if payload.is_empty() || signature.is_empty() {
            return false;
        }
        let mut state = self.lock();
        let Some(channel) = self.authenticated_channel(&state) else {
            return false;
        };
        match self.adapter.verify(channel, payload, signature) {
            Ok(matched) => matched,
            Err(err) => {
                record_failure(&mut state, "verify", &err);
                false
            }
        }
    }

    fn authenticated_channel(&self, state: &CardState) -> Option<CardChannel<'_>> {
        if state.status != Status::Authenticated {
            return None;
        }
        let card = state.card?;
        Some(CardChannel::new(self.driver.as_ref(), card, state.protocol))
    }

    /// Tear the context down: hand any held handles back to the driver and
    /// release the reader name and credentials. Fires the status-changed
    /// callback once if the context was authenticated.
    pub fn done(self) {
        let mut state = self.lock();
        let was_authenticated = state.status == Status::Authenticated;
        self.release_reader(&mut state);
        clear_identity(&mut state);
        state.status = Status::Idle;
        drop(state);

        if was_authenticated {
            self.notify_status_changed();
        }
        debug!("smartcard context done");
    }

    /// Return the card handle to the driver, giving the adapter a chance to
    /// clean up first.
    pub(crate) fn release_card(&self, state: &mut CardState) {
        if let Some(card) = state.card.take() {
            self.adapter
                .release(CardChannel::new(self.driver.as_ref(), card, state.protocol));
            self.driver.disconnect_card(card);
        }
        state.protocol = 0;
        state.driver_fault = false;
    }

    /// Release the card, the driver context and the bound reader name.
    pub(crate) fn release_reader(&self, state: &mut CardState) {
        self.release_card(state);
        if let Some(ctx) = state.reader_ctx.take() {
            self.driver.disconnect(ctx);
        }
        state.reader_name = None;
    }

    pub(crate) fn notify_status_changed(&self) {
        if let Some(callback) = &self.options.on_status_changed {
            callback(self);
        }
    }
}

/// Driver faults mark the card as lost; anything else is a protocol problem
/// with this one request and leaves the state alone.
fn record_failure(state: &mut CardState, operation: &str, err: &CardgateError) {
    match err {
        CardgateError::Driver(driver) => {
            error!("smartcard error {driver} during {operation}");
            state.driver_fault = true;
        }
        other => warn!("{operation} failed: {other}"),
    }
}

pub(crate) fn clear_identity(state: &mut CardState) {
    state.public_key = Zeroizing::new(Vec::new());
    state.display_name.zeroize();
}
