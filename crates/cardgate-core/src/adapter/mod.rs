//! Crypto adapters: the strategies the state machine drives to discover a
//! card, establish its credential, and sign or verify with it.

pub mod applet;
mod builtin;
mod pin_applet;
mod plugin;

use crate::config::{CardConfig, ProtocolKind};
use crate::driver::{CardChannel, CardDriver, CardHandle, ProtocolId, ReaderContext};
use crate::error::CardgateResult;
use zeroize::Zeroizing;

pub use builtin::{select_reader, BuiltinAdapter, SELF_TEST_PAYLOAD};
pub use pin_applet::PinAppletPlugin;
pub use plugin::{CredentialPlugin, PluginAdapter};

/// Result of reader discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// A reader was picked; the card still has to show up and be activated.
    Reader(String),
    /// A card was found, activated and accepted while probing.
    Card {
        reader: String,
        card: CardHandle,
        protocol: ProtocolId,
    },
}

/// Public identity material read from an authenticated card.
#[derive(Debug, Clone)]
pub struct Identity {
    pub display_name: String,
    pub public_key: Zeroizing<Vec<u8>>,
}

/// Outcome of the credential step.
#[derive(Debug)]
pub enum Establish {
    Ready(Identity),
    /// No PIN was supplied. Not a fault.
    Declined,
    Failed,
}

/// Strategy interface behind which the builtin APDU protocol and the plugin
/// protocol live. Every method runs with the context lock held and must not
/// call back into the context.
pub trait CryptoAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose where to look for a card among `readers` (never empty).
    fn discover(
        &self,
        driver: &dyn CardDriver,
        ctx: ReaderContext,
        readers: &[String],
    ) -> Option<Discovery>;

    /// Whether the credential step asks the prompt callback for a PIN.
    fn requires_pin(&self) -> bool;

    /// Read identity material from the card and prove it is usable. `pin` is
    /// whatever the prompt returned; adapters that need one decline on `None`.
    fn establish(&self, channel: CardChannel<'_>, pin: Option<&[u8]>) -> Establish;

    /// Sign `payload`, writing at most `signature.len()` bytes. Returns the
    /// number of bytes written.
    fn sign(
        &self,
        channel: CardChannel<'_>,
        payload: &[u8],
        signature: &mut [u8],
    ) -> CardgateResult<usize>;

    fn verify(
        &self,
        channel: CardChannel<'_>,
        payload: &[u8],
        signature: &[u8],
    ) -> CardgateResult<bool>;

    /// Called right before the card handle goes back to the driver.
    fn release(&self, channel: CardChannel<'_>);
}

/// Build the adapter selected in configuration.
pub fn from_config(config: &CardConfig) -> Box<dyn CryptoAdapter> {
    match config.protocol {
        ProtocolKind::Builtin => Box::new(BuiltinAdapter::new(config.preferred_reader.clone())),
        ProtocolKind::Plugin => Box::new(PluginAdapter::new(Box::new(PinAppletPlugin))),
    }
}

/// Copy `source` into `target`, truncating to the target's length.
pub(crate) fn copy_truncated(source: &[u8], target: &mut [u8]) -> usize {
    let len = source.len().min(target.len());
    target[..len].copy_from_slice(&source[..len]);
    len
}
