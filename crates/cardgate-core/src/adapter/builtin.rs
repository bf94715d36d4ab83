//! Builtin protocol: the context talks to the signing applet directly.

use super::{applet, copy_truncated, CryptoAdapter, Discovery, Establish, Identity};
use crate::driver::{CardChannel, CardDriver, ReaderContext};
use crate::error::{CardgateError, CardgateResult};
use log::{error, info, warn};
use zeroize::Zeroizing;

/// Plaintext signed and verified before a card is trusted.
pub const SELF_TEST_PAYLOAD: &[u8] = b"signature";

/// First reader whose name contains `keyword` (ASCII case-insensitive),
/// otherwise the first reader.
pub fn select_reader<'a>(readers: &'a [String], keyword: &str) -> Option<&'a str> {
    let keyword = keyword.to_ascii_lowercase();
    readers
        .iter()
        .find(|name| !keyword.is_empty() && name.to_ascii_lowercase().contains(&keyword))
        .or_else(|| readers.first())
        .map(String::as_str)
}

pub struct BuiltinAdapter {
    preferred_reader: String,
}

impl BuiltinAdapter {
    pub fn new(preferred_reader: impl Into<String>) -> Self {
        Self {
            preferred_reader: preferred_reader.into(),
        }
    }

    fn self_test(&self, channel: CardChannel<'_>) -> bool {
        let signature = match applet::sign(channel, SELF_TEST_PAYLOAD) {
            Ok(signature) => signature,
            Err(err) => {
                log_failure("self-test sign", &err);
                return false;
            }
        };
        match applet::verify(channel, SELF_TEST_PAYLOAD, &signature) {
            Ok(true) => true,
            Ok(false) => {
                warn!("card rejected its own self-test signature");
                false
            }
            Err(err) => {
                log_failure("self-test verify", &err);
                false
            }
        }
    }
}

impl CryptoAdapter for BuiltinAdapter {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn discover(
        &self,
        _driver: &dyn CardDriver,
        _ctx: ReaderContext,
        readers: &[String],
    ) -> Option<Discovery> {
        let reader = select_reader(readers, &self.preferred_reader)?;
        info!("using smartcard reader {reader}");
        Some(Discovery::Reader(reader.to_string()))
    }

    fn requires_pin(&self) -> bool {
        false
    }

    fn establish(&self, channel: CardChannel<'_>, _pin: Option<&[u8]>) -> Establish {
        let public_key = match applet::public_key(channel) {
            Ok(key) => Zeroizing::new(key),
            Err(err) => {
                log_failure("public key", &err);
                return Establish::Failed;
            }
        };
        let display_name = match applet::hello(channel) {
            Ok(name) => name,
            Err(err) => {
                log_failure("identify", &err);
                return Establish::Failed;
            }
        };
        if !self.self_test(channel) {
            return Establish::Failed;
        }
        Establish::Ready(Identity {
            display_name,
            public_key,
        })
    }

    fn sign(
        &self,
        channel: CardChannel<'_>,
        payload: &[u8],
        signature: &mut [u8],
    ) -> CardgateResult<usize> {
        applet::sign(channel, payload).map(|full| copy_truncated(&full, signature))
    }

    fn verify(
        &self,
        channel: CardChannel<'_>,
        payload: &[u8],
        signature: &[u8],
    ) -> CardgateResult<bool> {
        applet::verify(channel, payload, signature)
    }

    fn release(&self, _channel: CardChannel<'_>) {}
}

fn log_failure(operation: &str, err: &CardgateError) {
    match err {
        CardgateError::Driver(driver) => error!("smartcard error {driver} during {operation}"),
        other => warn!("{operation} failed: {other}"),
    }
}
