//! In-process `CardDriver` hosting virtual readers and software cards.

use super::card::SoftCard;
use crate::config::DriverConfig;
use crate::driver::{CardDriver, CardHandle, ProtocolId, ReaderContext};
use crate::error::{DriverError, DriverResult};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

pub const SCARD_F_INTERNAL_ERROR: u32 = 0x8010_0001;
pub const SCARD_E_INVALID_HANDLE: u32 = 0x8010_0003;
pub const SCARD_E_UNKNOWN_READER: u32 = 0x8010_0009;
pub const SCARD_E_NO_SMARTCARD: u32 = 0x8010_000C;
pub const SCARD_W_REMOVED_CARD: u32 = 0x8010_0069;

/// T=1
pub const SOFT_PROTOCOL: ProtocolId = 2;

/// Driver operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    ListReaders,
    WaitForCard,
    Activate,
    Exchange,
    WaitForRemoval,
}

struct SoftReader {
    name: String,
    card: Option<SoftCard>,
    /// Bumped on every insertion so stale sessions notice the swap.
    generation: u64,
}

struct Session {
    reader: String,
    generation: u64,
}

#[derive(Default)]
struct DriverState {
    readers: Vec<SoftReader>,
    next_handle: u64,
    contexts: HashSet<u64>,
    sessions: HashMap<u64, Session>,
    /// Generation last activated per (context, reader).
    activated: HashMap<(u64, String), u64>,
    faults: HashMap<Operation, u32>,
    exchange_delay: Duration,
}

impl DriverState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_fault(&mut self, op: Operation) -> DriverResult<()> {
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(DriverError::new(
                    SCARD_F_INTERNAL_ERROR,
                    format!("injected {op:?} fault"),
                ))
            }
            _ => Ok(()),
        }
    }

    fn check_context(&self, ctx: ReaderContext) -> DriverResult<()> {
        if self.contexts.contains(&ctx.0) {
            Ok(())
        } else {
            Err(DriverError::new(SCARD_E_INVALID_HANDLE, "invalid context handle"))
        }
    }

    fn reader_mut(&mut self, name: &str) -> DriverResult<&mut SoftReader> {
        self.readers
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| DriverError::new(SCARD_E_UNKNOWN_READER, format!("unknown reader {name}")))
    }
}

/// Virtual reader bank.
///
/// Besides serving the context it records every `exchange` that overlaps
/// another one, so callers can check that card access is serialized.
pub struct SoftDriver {
    state: Mutex<DriverState>,
    in_exchange: AtomicBool,
    overlapping: AtomicUsize,
    exchanges: AtomicUsize,
}

impl SoftDriver {
    pub fn new<I, S>(readers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let readers = readers
            .into_iter()
            .map(|name| SoftReader {
                name: name.into(),
                card: None,
                generation: 0,
            })
            .collect();
        Self {
            state: Mutex::new(DriverState {
                readers,
                ..DriverState::default()
            }),
            in_exchange: AtomicBool::new(false),
            overlapping: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
        }
    }

    /// Reader bank described by configuration, with a fresh card inserted in
    /// `card_reader` when one is named.
    pub fn from_config(config: &DriverConfig) -> Self {
        let driver = Self::new(config.readers.iter().cloned());
        if let Some(reader) = &config.card_reader {
            let mut card = SoftCard::new(config.holder.clone());
            if let Some(pin) = &config.card_pin {
                card = card.with_pin(pin);
            }
            driver.insert_card(reader, card);
        }
        driver
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put `card` into `reader`. Returns false when the reader is unknown or
    /// already holds a card.
    pub fn insert_card(&self, reader: &str, card: SoftCard) -> bool {
        let mut state = self.lock();
        match state.reader_mut(reader) {
            Ok(slot) if slot.card.is_none() => {
                debug!("soft card {} inserted into {reader}", card.holder());
                slot.card = Some(card);
                slot.generation += 1;
                true
            }
            _ => false,
        }
    }

    pub fn remove_card(&self, reader: &str) -> Option<SoftCard> {
        let mut state = self.lock();
        let card = state.reader_mut(reader).ok()?.card.take();
        if card.is_some() {
            debug!("soft card removed from {reader}");
        }
        card
    }

    /// Make the next `count` calls of `op` fail.
    pub fn fail_next(&self, op: Operation, count: u32) {
        self.lock().faults.insert(op, count);
    }

    /// Hold every exchange for `delay` before answering.
    pub fn set_exchange_delay(&self, delay: Duration) {
        self.lock().exchange_delay = delay;
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn overlapping_exchanges(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    pub fn open_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn open_cards(&self) -> usize {
        self.lock().sessions.len()
    }

    fn transmit(&self, card: CardHandle, request: &[u8]) -> DriverResult<Vec<u8>> {
        let delay = self.lock().exchange_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        state.take_fault(Operation::Exchange)?;
        let (reader, generation) = match state.sessions.get(&card.0) {
            Some(session) => (session.reader.clone(), session.generation),
            None => return Err(DriverError::new(SCARD_E_INVALID_HANDLE, "invalid card handle")),
        };
        let slot = state.reader_mut(&reader)?;
        if slot.generation != generation {
            return Err(removed_card());
        }
        match slot.card.as_mut() {
            Some(soft) => Ok(soft.process(request)),
            None => Err(removed_card()),
        }
    }
}

fn removed_card() -> DriverError {
    DriverError::new(SCARD_W_REMOVED_CARD, "the smart card has been removed")
}

impl CardDriver for SoftDriver {
    fn connect(&self) -> DriverResult<ReaderContext> {
        let mut state = self.lock();
        state.take_fault(Operation::Connect)?;
        let handle = state.handle();
        state.contexts.insert(handle);
        Ok(ReaderContext(handle))
    }

    fn list_readers(&self, ctx: ReaderContext) -> DriverResult<Vec<String>> {
        let mut state = self.lock();
        state.take_fault(Operation::ListReaders)?;
        state.check_context(ctx)?;
        Ok(state.readers.iter().map(|r| r.name.clone()).collect())
    }

    fn wait_for_card(
        &self,
        ctx: ReaderContext,
        reader: &str,
        _timeout: Duration,
    ) -> DriverResult<bool> {
        let mut state = self.lock();
        state.take_fault(Operation::WaitForCard)?;
        state.check_context(ctx)?;
        Ok(state.reader_mut(reader)?.card.is_some())
    }

    fn activate_card(
        &self,
        ctx: ReaderContext,
        reader: &str,
    ) -> DriverResult<(CardHandle, ProtocolId)> {
        let mut state = self.lock();
        state.take_fault(Operation::Activate)?;
        state.check_context(ctx)?;
        let slot = state.reader_mut(reader)?;
        let generation = slot.generation;
        match slot.card.as_mut() {
            Some(card) => card.reset_session(),
            None => return Err(DriverError::new(SCARD_E_NO_SMARTCARD, "no smart card in reader")),
        }
        state.activated.insert((ctx.0, reader.to_string()), generation);
        let handle = state.handle();
        state.sessions.insert(
            handle,
            Session {
                reader: reader.to_string(),
                generation,
            },
        );
        Ok((CardHandle(handle), SOFT_PROTOCOL))
    }

    fn exchange(
        &self,
        card: CardHandle,
        _protocol: ProtocolId,
        request: &[u8],
    ) -> DriverResult<Vec<u8>> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if self.in_exchange.swap(true, Ordering::SeqCst) {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }
        let result = self.transmit(card, request);
        self.in_exchange.store(false, Ordering::SeqCst);
        result
    }

    fn wait_for_card_removal(
        &self,
        ctx: ReaderContext,
        reader: &str,
        _timeout: Duration,
    ) -> DriverResult<bool> {
        let mut state = self.lock();
        state.take_fault(Operation::WaitForRemoval)?;
        state.check_context(ctx)?;
        let activated = state.activated.get(&(ctx.0, reader.to_string())).copied();
        let slot = state.reader_mut(reader)?;
        let swapped = activated.is_some_and(|generation| generation != slot.generation);
        Ok(slot.card.is_none() || swapped)
    }

    fn disconnect_card(&self, card: CardHandle) {
        self.lock().sessions.remove(&card.0);
    }

    fn disconnect(&self, ctx: ReaderContext) {
        let mut state = self.lock();
        state.contexts.remove(&ctx.0);
        state.activated.retain(|(owner, _), _| *owner != ctx.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::applet::{parse_hello, HELLO};
    use crate::driver::NO_WAIT;

    #[test]
    fn activation_requires_card() {
        let driver = SoftDriver::new(["Reader A"]);
        let ctx = driver.connect().unwrap();
        assert!(!driver.wait_for_card(ctx, "Reader A", NO_WAIT).unwrap());
        let err = driver.activate_card(ctx, "Reader A").unwrap_err();
        assert_eq!(err.code, SCARD_E_NO_SMARTCARD);

        assert!(driver.insert_card("Reader A", SoftCard::new("holder")));
        assert!(driver.wait_for_card(ctx, "Reader A", NO_WAIT).unwrap());
        let (card, protocol) = driver.activate_card(ctx, "Reader A").unwrap();
        assert_eq!(protocol, SOFT_PROTOCOL);
        let response = driver.exchange(card, protocol, &HELLO).unwrap();
        assert_eq!(parse_hello(&response).as_deref(), Some("holder"));
    }

    #[test]
    fn removed_card_invalidates_session() {
        let driver = SoftDriver::new(["Reader A"]);
        driver.insert_card("Reader A", SoftCard::new("first"));
        let ctx = driver.connect().unwrap();
        let (card, protocol) = driver.activate_card(ctx, "Reader A").unwrap();

        driver.remove_card("Reader A");
        assert!(driver
            .wait_for_card_removal(ctx, "Reader A", NO_WAIT)
            .unwrap());
        driver.insert_card("Reader A", SoftCard::new("second"));

        let err = driver.exchange(card, protocol, &HELLO).unwrap_err();
        assert_eq!(err.code, SCARD_W_REMOVED_CARD);
    }

    #[test]
    fn swapped_card_counts_as_removed() {
        let driver = SoftDriver::new(["Reader A"]);
        driver.insert_card("Reader A", SoftCard::new("alice"));
        let ctx = driver.connect().unwrap();
        driver.activate_card(ctx, "Reader A").unwrap();
        assert!(!driver
            .wait_for_card_removal(ctx, "Reader A", NO_WAIT)
            .unwrap());

        driver.remove_card("Reader A");
        driver.insert_card("Reader A", SoftCard::new("mallory"));
        assert!(driver
            .wait_for_card_removal(ctx, "Reader A", NO_WAIT)
            .unwrap());

        driver.activate_card(ctx, "Reader A").unwrap();
        assert!(!driver
            .wait_for_card_removal(ctx, "Reader A", NO_WAIT)
            .unwrap());
    }

    #[test]
    fn injected_faults_are_consumed() {
        let driver = SoftDriver::new(["Reader A"]);
        driver.fail_next(Operation::Connect, 1);
        assert_eq!(driver.connect().unwrap_err().code, SCARD_F_INTERNAL_ERROR);
        assert!(driver.connect().is_ok());
    }

    #[test]
    fn handles_are_tracked() {
        let driver = SoftDriver::new(["Reader A"]);
        driver.insert_card("Reader A", SoftCard::new("holder"));
        let ctx = driver.connect().unwrap();
        let (card, _) = driver.activate_card(ctx, "Reader A").unwrap();
        assert_eq!((driver.open_contexts(), driver.open_cards()), (1, 1));
        driver.disconnect_card(card);
        driver.disconnect(ctx);
        assert_eq!((driver.open_contexts(), driver.open_cards()), (0, 0));
        assert!(driver.list_readers(ctx).is_err());
    }
}
