//! Software card and reader bank. Backs the test suite and lets the daemon
//! run without hardware.

mod card;
mod driver;

pub use card::SoftCard;
pub use driver::{
    Operation, SoftDriver, SCARD_E_INVALID_HANDLE, SCARD_E_NO_SMARTCARD, SCARD_E_UNKNOWN_READER,
    SCARD_F_INTERNAL_ERROR, SCARD_W_REMOVED_CARD, SOFT_PROTOCOL,
};
