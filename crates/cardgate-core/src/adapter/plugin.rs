//! Plugin protocol: an external credential provider owns the on-card wire
//! format, the context only sequences it.

use super::{copy_truncated, CryptoAdapter, Discovery, Establish, Identity};
use crate::driver::{CardChannel, CardDriver, ReaderContext, NO_WAIT};
use crate::error::CardgateResult;
use log::{error, info, trace, warn};

/// Capability set supplied by a credential plugin.
pub trait CredentialPlugin: Send + Sync {
    /// Check whether the freshly activated card is one this plugin handles.
    fn init_credential(&self, channel: CardChannel<'_>) -> CardgateResult<()>;

    fn deinit_credential(&self, channel: CardChannel<'_>);

    /// Present `pin` to the card. `Ok(false)` means the card rejected it.
    fn verify_credential(&self, channel: CardChannel<'_>, pin: &[u8]) -> CardgateResult<bool>;

    fn sign(&self, channel: CardChannel<'_>, payload: &[u8]) -> CardgateResult<Vec<u8>>;

    fn verify(&self, channel: CardChannel<'_>, payload: &[u8], signature: &[u8])
        -> CardgateResult<bool>;

    fn get_identity(&self, channel: CardChannel<'_>) -> CardgateResult<Identity>;
}

pub struct PluginAdapter {
    plugin: Box<dyn CredentialPlugin>,
}

impl PluginAdapter {
    pub fn new(plugin: Box<dyn CredentialPlugin>) -> Self {
        Self { plugin }
    }
}

impl CryptoAdapter for PluginAdapter {
    fn name(&self) -> &'static str {
        "plugin"
    }

    /// Probe each reader in turn; the first one holding a card the plugin
    /// accepts wins.
    fn discover(
        &self,
        driver: &dyn CardDriver,
        ctx: ReaderContext,
        readers: &[String],
    ) -> Option<Discovery> {
        for reader in readers {
            match driver.wait_for_card(ctx, reader, NO_WAIT) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    trace!("smartcard/reader {reader} not ready: {err}");
                    continue;
                }
            }

            let (card, protocol) = match driver.activate_card(ctx, reader) {
                Ok(activated) => activated,
                Err(err) => {
                    warn!("smartcard/reader {reader} error {err}");
                    continue;
                }
            };

            match self
                .plugin
                .init_credential(CardChannel::new(driver, card, protocol))
            {
                Ok(()) => {
                    info!("using smartcard reader {reader}");
                    return Some(Discovery::Card {
                        reader: reader.clone(),
                        card,
                        protocol,
                    });
                }
                Err(err) => {
                    driver.disconnect_card(card);
                    trace!("unrecognized smartcard ({reader}): {err}");
                }
            }
        }
        None
    }

    fn requires_pin(&self) -> bool {
        true
    }

    /// No PIN means nobody answered the prompt: decline rather than fail.
    fn establish(&self, channel: CardChannel<'_>, pin: Option<&[u8]>) -> Establish {
        let Some(pin) = pin else {
            return Establish::Declined;
        };
        match self.plugin.verify_credential(channel, pin) {
            Ok(true) => info!("pin ok"),
            Ok(false) => {
                error!("invalid pin");
                return Establish::Failed;
            }
            Err(err) => {
                error!("pin verification failed: {err}");
                return Establish::Failed;
            }
        }
        match self.plugin.get_identity(channel) {
            Ok(identity) if !identity.public_key.is_empty() => Establish::Ready(identity),
            Ok(_) => {
                error!("credential plugin returned an empty public key");
                Establish::Failed
            }
            Err(err) => {
                error!("reading card identity failed: {err}");
                Establish::Failed
            }
        }
    }

    fn sign(
        &self,
        channel: CardChannel<'_>,
        payload: &[u8],
        signature: &mut [u8],
    ) -> CardgateResult<usize> {
        self.plugin
            .sign(channel, payload)
            .map(|full| copy_truncated(&full, signature))
    }

    fn verify(
        &self,
        channel: CardChannel<'_>,
        payload: &[u8],
        signature: &[u8],
    ) -> CardgateResult<bool> {
        self.plugin.verify(channel, payload, signature)
    }

    fn release(&self, channel: CardChannel<'_>) {
        self.plugin.deinit_credential(channel);
    }
}
