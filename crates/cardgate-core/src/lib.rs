pub mod adapter;
pub mod clock;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod logging;
mod machine;
pub mod soft;

pub use adapter::{BuiltinAdapter, CredentialPlugin, CryptoAdapter, PinAppletPlugin, PluginAdapter};
pub use config::{CardConfig, CardgateConfig, DriverConfig, ProtocolKind};
pub use context::{ContextOptions, ContextSnapshot, SmartcardContext, Status};
pub use driver::{CardChannel, CardDriver, CardHandle, ProtocolId, ReaderContext};
pub use error::{CardgateError, CardgateResult, DriverError, DriverResult};
