use crate::error::DriverResult;
use std::time::Duration;

/// Opaque handle to a connected driver (reader) context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderContext(pub u64);

/// Opaque handle to an activated card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardHandle(pub u64);

/// Transmission protocol negotiated during activation (T=0, T=1, ...).
pub type ProtocolId = u32;

/// Zero timeout used for every wait issued by the state machine.
pub const NO_WAIT: Duration = Duration::ZERO;

/// Abstraction over the reader/card transport.
///
/// Handles returned here stay owned by the driver; callers hand them back via
/// `disconnect_card` and `disconnect` once they are done with them.
/// Implementations must not block longer than the timeout they are given.
pub trait CardDriver: Send + Sync {
    /// Establish a driver context.
    fn connect(&self) -> DriverResult<ReaderContext>;

    /// Names of the readers currently attached, in driver order.
    fn list_readers(&self, ctx: ReaderContext) -> DriverResult<Vec<String>>;

    /// Report whether a card is present in `reader`.
    fn wait_for_card(&self, ctx: ReaderContext, reader: &str, timeout: Duration)
        -> DriverResult<bool>;

    /// Power up the card in `reader` and open a session with it.
    fn activate_card(&self, ctx: ReaderContext, reader: &str)
        -> DriverResult<(CardHandle, ProtocolId)>;

    /// Send one command APDU and return the raw response APDU.
    fn exchange(&self, card: CardHandle, protocol: ProtocolId, request: &[u8])
        -> DriverResult<Vec<u8>>;

    /// Report whether the card has left `reader`.
    fn wait_for_card_removal(
        &self,
        ctx: ReaderContext,
        reader: &str,
        timeout: Duration,
    ) -> DriverResult<bool>;

    fn disconnect_card(&self, card: CardHandle);

    fn disconnect(&self, ctx: ReaderContext);
}

/// A card session borrowed from the context for the duration of one locked
/// critical section.
#[derive(Clone, Copy)]
pub struct CardChannel<'a> {
    driver: &'a dyn CardDriver,
    card: CardHandle,
    protocol: ProtocolId,
}

impl<'a> CardChannel<'a> {
    pub fn new(driver: &'a dyn CardDriver, card: CardHandle, protocol: ProtocolId) -> Self {
        Self {
            driver,
            card,
            protocol,
        }
    }

    pub fn card(&self) -> CardHandle {
        self.card
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    /// Exchange a command APDU with the bound card.
    pub fn transmit(&self, apdu: &[u8]) -> DriverResult<Vec<u8>> {
        self.driver.exchange(self.card, self.protocol, apdu)
    }
}
