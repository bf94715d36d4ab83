//! Credential plugin for cards that run the signing applet behind an ISO 7816
//! user PIN.

use super::{applet, CredentialPlugin, Identity};
use crate::driver::CardChannel;
use crate::error::{CardgateError, CardgateResult};
use log::{error, warn};
use zeroize::Zeroizing;

#[derive(Debug, Default, Clone, Copy)]
pub struct PinAppletPlugin;

impl CredentialPlugin for PinAppletPlugin {
    fn init_credential(&self, channel: CardChannel<'_>) -> CardgateResult<()> {
        applet::hello(channel).map(|_| ())
    }

    fn deinit_credential(&self, _channel: CardChannel<'_>) {}

    fn verify_credential(&self, channel: CardChannel<'_>, pin: &[u8]) -> CardgateResult<bool> {
        let frame = applet::verify_pin_frame(pin)
            .ok_or_else(|| CardgateError::Plugin(format!("pin of {} bytes rejected", pin.len())))?;
        let response = channel.transmit(&frame)?;
        match response.as_slice() {
            [0x90, 0x00] => Ok(true),
            [0x63, sw2] if sw2 & 0xF0 == 0xC0 => {
                warn!("pin rejected, {} tries left", sw2 & 0x0F);
                Ok(false)
            }
            [0x69, 0x83] => {
                error!("pin blocked");
                Ok(false)
            }
            other => Err(CardgateError::Protocol(format!(
                "unexpected verify pin status {}",
                hex::encode(other)
            ))),
        }
    }

    fn sign(&self, channel: CardChannel<'_>, payload: &[u8]) -> CardgateResult<Vec<u8>> {
        applet::sign(channel, payload)
    }

    fn verify(
        &self,
        channel: CardChannel<'_>,
        payload: &[u8],
        signature: &[u8],
    ) -> CardgateResult<bool> {
        applet::verify(channel, payload, signature)
    }

    fn get_identity(&self, channel: CardChannel<'_>) -> CardgateResult<Identity> {
        let display_name = applet::hello(channel)?;
        let public_key = Zeroizing::new(applet::public_key(channel)?);
        Ok(Identity {
            display_name,
            public_key,
        })
    }
}
