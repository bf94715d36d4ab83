//! Command set of the signing applet: fixed 5-byte headers, frame builders and
//! response parsers. Shared by the builtin adapter, the PIN applet plugin and
//! the software card.

use crate::driver::CardChannel;
use crate::error::{CardgateError, CardgateResult};

pub const CLA: u8 = 0x10;
pub const INS_HELLO: u8 = 0x01;
pub const INS_PUBLIC_KEY: u8 = 0x45;
pub const INS_SIGN: u8 = 0x48;
pub const INS_VERIFY: u8 = 0x49;

pub const HELLO: [u8; 5] = [CLA, INS_HELLO, 0x00, 0x00, 0x00];
pub const PUBLIC_KEY: [u8; 5] = [CLA, INS_PUBLIC_KEY, 0x00, 0x00, 0x00];
pub const SIGN: [u8; 5] = [CLA, INS_SIGN, 0x00, 0x00, 0x00];
pub const VERIFY: [u8; 5] = [CLA, INS_VERIFY, 0x00, 0x00, 0x00];

/// ISO 7816 VERIFY for the user PIN (reference 0x81).
pub const VERIFY_PIN: [u8; 5] = [0x00, 0x20, 0x00, 0x81, 0x00];

pub const SW_OK: [u8; 2] = [0x90, 0x00];

/// The only response the applet sends for a signature that checks out.
pub const VERIFY_OK: [u8; 3] = [0x01, 0x90, 0x00];

/// Leading bytes of a HELLO response.
pub const HELLO_MAGIC: [u8; 8] = [0x06, 0xED, 0xED, 0xED, 0xED, 0xED, 0x01, 0x01];

/// Longest display name kept from a HELLO response.
pub const MAX_NAME_LEN: usize = 255;

/// Largest command body that fits the single length byte.
pub const MAX_BODY_LEN: usize = u8::MAX as usize;

/// `10 48 00 00 Lc | payload | 00`
pub fn sign_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_BODY_LEN {
        return None;
    }
    let mut frame = Vec::with_capacity(SIGN.len() + payload.len() + 1);
    frame.extend_from_slice(&SIGN);
    frame[4] = payload.len() as u8;
    frame.extend_from_slice(payload);
    frame.push(0x00);
    Some(frame)
}

/// `10 49 Ls 00 Lc | signature | payload | 00` with `Lc = Ls + payload length`.
pub fn verify_frame(payload: &[u8], signature: &[u8]) -> Option<Vec<u8>> {
    let total = payload.len() + signature.len();
    if payload.is_empty() || signature.is_empty() || total > MAX_BODY_LEN {
        return None;
    }
    let mut frame = Vec::with_capacity(VERIFY.len() + total + 1);
    frame.extend_from_slice(&VERIFY);
    frame[2] = signature.len() as u8;
    frame[4] = total as u8;
    frame.extend_from_slice(signature);
    frame.extend_from_slice(payload);
    frame.push(0x00);
    Some(frame)
}

pub fn verify_pin_frame(pin: &[u8]) -> Option<Vec<u8>> {
    if pin.is_empty() || pin.len() > MAX_BODY_LEN {
        return None;
    }
    let mut frame = Vec::with_capacity(VERIFY_PIN.len() + pin.len());
    frame.extend_from_slice(&VERIFY_PIN);
    frame[4] = pin.len() as u8;
    frame.extend_from_slice(pin);
    Some(frame)
}

/// Split a response into data and a `90 00` status word. Returns `None` when
/// the status word is anything else.
pub fn strip_status(response: &[u8]) -> Option<&[u8]> {
    match response {
        [data @ .., 0x90, 0x00] => Some(data),
        _ => None,
    }
}

/// Extract the display name from a HELLO response: magic, one ignored byte,
/// length byte, name.
pub fn parse_hello(response: &[u8]) -> Option<String> {
    if response.len() < 10 || response[..8] != HELLO_MAGIC {
        return None;
    }
    let len = response[9] as usize;
    let name = response[10..].get(..len)?;
    let name = &name[..len.min(MAX_NAME_LEN)];
    Some(String::from_utf8_lossy(name).into_owned())
}

/// Ask the card who it belongs to.
pub fn hello(channel: CardChannel<'_>) -> CardgateResult<String> {
    let response = channel.transmit(&HELLO)?;
    parse_hello(&response)
        .ok_or_else(|| CardgateError::Protocol("malformed identify response".into()))
}

/// Fetch the card's public key.
pub fn public_key(channel: CardChannel<'_>) -> CardgateResult<Vec<u8>> {
    let response = channel.transmit(&PUBLIC_KEY)?;
    match strip_status(&response) {
        Some(key) if !key.is_empty() => Ok(key.to_vec()),
        _ => Err(CardgateError::Protocol(format!(
            "public key response rejected ({} bytes)",
            response.len()
        ))),
    }
}

/// Have the card sign `payload`; returns the full signature.
pub fn sign(channel: CardChannel<'_>, payload: &[u8]) -> CardgateResult<Vec<u8>> {
    let frame = sign_frame(payload).ok_or_else(|| {
        CardgateError::Protocol(format!("payload of {} bytes does not fit", payload.len()))
    })?;
    let response = channel.transmit(&frame)?;
    match strip_status(&response) {
        Some(signature) if !signature.is_empty() => Ok(signature.to_vec()),
        _ => Err(CardgateError::Protocol("sign response rejected".into())),
    }
}

/// Have the card check `signature` over `payload`. Only `01 90 00` counts as
/// a match; every other well-formed answer is a mismatch.
pub fn verify(channel: CardChannel<'_>, payload: &[u8], signature: &[u8]) -> CardgateResult<bool> {
    let frame = verify_frame(payload, signature).ok_or_else(|| {
        CardgateError::Protocol(format!(
            "signature ({} bytes) and payload ({} bytes) do not fit",
            signature.len(),
            payload.len()
        ))
    })?;
    let response = channel.transmit(&frame)?;
    Ok(response == VERIFY_OK)
}
