//! Software implementation of the signing applet: P-256 ECDSA over SHA-256,
//! DER signatures, optional ISO 7816 user PIN.

use crate::adapter::applet::{
    CLA, HELLO_MAGIC, INS_HELLO, INS_PUBLIC_KEY, INS_SIGN, INS_VERIFY, MAX_NAME_LEN, SW_OK,
    VERIFY_OK,
};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

const SW_WRONG_LENGTH: [u8; 2] = [0x67, 0x00];
const SW_SECURITY_NOT_SATISFIED: [u8; 2] = [0x69, 0x82];
const SW_PIN_BLOCKED: [u8; 2] = [0x69, 0x83];
const SW_WRONG_P1P2: [u8; 2] = [0x6A, 0x86];
const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];
const SW_CLA_NOT_SUPPORTED: [u8; 2] = [0x6E, 0x00];

const ISO_CLA: u8 = 0x00;
const INS_VERIFY_PIN: u8 = 0x20;
const PIN_REFERENCE: u8 = 0x81;
const PIN_TRIES: u8 = 3;

pub struct SoftCard {
    holder: String,
    signing_key: SigningKey,
    pin: Option<Zeroizing<Vec<u8>>>,
    tries_left: u8,
    pin_verified: bool,
    broken_verify: bool,
}

impl SoftCard {
    /// Card with a fresh random key pair and no PIN.
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            signing_key: SigningKey::random(&mut OsRng),
            pin: None,
            tries_left: PIN_TRIES,
            pin_verified: false,
            broken_verify: false,
        }
    }

    /// Require `pin` before the card signs anything.
    pub fn with_pin(mut self, pin: impl AsRef<[u8]>) -> Self {
        self.pin = Some(Zeroizing::new(pin.as_ref().to_vec()));
        self
    }

    /// Answer every signature check with a bare `90 00` instead of `01 90 00`.
    pub fn with_broken_verify(mut self) -> Self {
        self.broken_verify = true;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Uncompressed SEC1 public key.
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn pin_tries_left(&self) -> u8 {
        self.tries_left
    }

    /// Power-on reset: PIN state is per session.
    pub fn reset_session(&mut self) {
        self.pin_verified = false;
    }

    /// Handle one command APDU.
    pub fn process(&mut self, apdu: &[u8]) -> Vec<u8> {
        if apdu.len() < 5 {
            return SW_WRONG_LENGTH.to_vec();
        }
        match (apdu[0], apdu[1]) {
            (CLA, INS_HELLO) => self.hello(),
            (CLA, INS_PUBLIC_KEY) => with_status(&self.public_key()),
            (CLA, INS_SIGN) => self.sign(apdu),
            (CLA, INS_VERIFY) => self.verify(apdu),
            (ISO_CLA, INS_VERIFY_PIN) => self.verify_pin(apdu),
            (CLA, _) | (ISO_CLA, _) => SW_INS_NOT_SUPPORTED.to_vec(),
            _ => SW_CLA_NOT_SUPPORTED.to_vec(),
        }
    }

    fn hello(&self) -> Vec<u8> {
        let name = self.holder.as_bytes();
        let name = &name[..name.len().min(MAX_NAME_LEN)];
        let mut response = HELLO_MAGIC.to_vec();
        response.push(0x00);
        response.push(name.len() as u8);
        response.extend_from_slice(name);
        response.extend_from_slice(&SW_OK);
        response
    }

    fn sign(&self, apdu: &[u8]) -> Vec<u8> {
        let Some(payload) = body(apdu) else {
            return SW_WRONG_LENGTH.to_vec();
        };
        if self.pin.is_some() && !self.pin_verified {
            return SW_SECURITY_NOT_SATISFIED.to_vec();
        }
        let signature: Signature = self.signing_key.sign(payload);
        with_status(&signature.to_der().to_bytes())
    }

    fn verify(&self, apdu: &[u8]) -> Vec<u8> {
        let Some(data) = body(apdu) else {
            return SW_WRONG_LENGTH.to_vec();
        };
        let sig_len = apdu[2] as usize;
        if sig_len > data.len() {
            return SW_WRONG_LENGTH.to_vec();
        }
        if self.broken_verify {
            return SW_OK.to_vec();
        }
        let (signature, payload) = data.split_at(sig_len);
        let matched = Signature::from_der(signature)
            .map(|sig| self.signing_key.verifying_key().verify(payload, &sig).is_ok())
            .unwrap_or(false);
        if matched {
            VERIFY_OK.to_vec()
        } else {
            vec![0x00, 0x90, 0x00]
        }
    }

    fn verify_pin(&mut self, apdu: &[u8]) -> Vec<u8> {
        if apdu[2] != 0x00 || apdu[3] != PIN_REFERENCE {
            return SW_WRONG_P1P2.to_vec();
        }
        let Some(candidate) = body(apdu) else {
            return SW_WRONG_LENGTH.to_vec();
        };
        let Some(pin) = &self.pin else {
            return SW_OK.to_vec();
        };
        if self.tries_left == 0 {
            return SW_PIN_BLOCKED.to_vec();
        }
        if candidate == pin.as_slice() {
            self.tries_left = PIN_TRIES;
            self.pin_verified = true;
            SW_OK.to_vec()
        } else {
            self.tries_left -= 1;
            self.pin_verified = false;
            if self.tries_left == 0 {
                SW_PIN_BLOCKED.to_vec()
            } else {
                vec![0x63, 0xC0 | self.tries_left]
            }
        }
    }
}

/// Command body as announced by the Lc byte.
fn body(apdu: &[u8]) -> Option<&[u8]> {
    let len = apdu[4] as usize;
    apdu.get(5..5 + len)
}

fn with_status(data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(data.len() + 2);
    response.extend_from_slice(data);
    response.extend_from_slice(&SW_OK);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::applet::{parse_hello, sign_frame, strip_status, verify_frame, HELLO, PUBLIC_KEY};

    #[test]
    fn hello_reports_holder() {
        let mut card = SoftCard::new("Ada Lovelace");
        let response = card.process(&HELLO);
        assert_eq!(parse_hello(&response).as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn public_key_is_uncompressed_point() {
        let mut card = SoftCard::new("holder");
        let response = card.process(&PUBLIC_KEY);
        let key = strip_status(&response).unwrap();
        assert_eq!(key.len(), 65);
        assert_eq!(key[0], 0x04);
        assert_eq!(key, card.public_key().as_slice());
    }

    #[test]
    fn signature_checks_out_and_tampering_is_caught() {
        let mut card = SoftCard::new("holder");
        let response = card.process(&sign_frame(b"payload").unwrap());
        let signature = strip_status(&response).unwrap().to_vec();

        let ok = card.process(&verify_frame(b"payload", &signature).unwrap());
        assert_eq!(ok, VERIFY_OK.to_vec());

        let mut tampered = signature.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let bad = card.process(&verify_frame(b"payload", &tampered).unwrap());
        assert_ne!(bad, VERIFY_OK.to_vec());
    }

    #[test]
    fn pin_gates_signing_and_counts_down() {
        let mut card = SoftCard::new("holder").with_pin("1234");
        let frame = sign_frame(b"data").unwrap();
        assert_eq!(card.process(&frame), SW_SECURITY_NOT_SATISFIED.to_vec());

        let wrong = [0x00, 0x20, 0x00, 0x81, 0x04, b'0', b'0', b'0', b'0'];
        assert_eq!(card.process(&wrong), vec![0x63, 0xC2]);
        assert_eq!(card.pin_tries_left(), 2);

        let right = [0x00, 0x20, 0x00, 0x81, 0x04, b'1', b'2', b'3', b'4'];
        assert_eq!(card.process(&right), SW_OK.to_vec());
        assert!(strip_status(&card.process(&frame)).is_some());

        card.reset_session();
        assert_eq!(card.process(&frame), SW_SECURITY_NOT_SATISFIED.to_vec());
    }

    #[test]
    fn pin_blocks_after_three_failures() {
        let mut card = SoftCard::new("holder").with_pin("1234");
        let wrong = [0x00, 0x20, 0x00, 0x81, 0x01, b'9'];
        card.process(&wrong);
        card.process(&wrong);
        assert_eq!(card.process(&wrong), SW_PIN_BLOCKED.to_vec());
        let right = [0x00, 0x20, 0x00, 0x81, 0x04, b'1', b'2', b'3', b'4'];
        assert_eq!(card.process(&right), SW_PIN_BLOCKED.to_vec());
    }

    #[test]
    fn unknown_instruction_is_rejected() {
        let mut card = SoftCard::new("holder");
        assert_eq!(card.process(&[0x10, 0x99, 0, 0, 0]), SW_INS_NOT_SUPPORTED.to_vec());
        assert_eq!(card.process(&[0x80, 0x01, 0, 0, 0]), SW_CLA_NOT_SUPPORTED.to_vec());
        assert_eq!(card.process(&[0x10]), SW_WRONG_LENGTH.to_vec());
    }
}
