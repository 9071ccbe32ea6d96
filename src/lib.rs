//! custocrypt - Chunked hybrid file encryption with remote key custody
//!
//! Files are split into fixed-size chunks and encrypted with AES-256-CBC in
//! parallel. The symmetric key is wrapped with RSA-OAEP under a public key
//! held by a remote custodian, or, when the custodian is unreachable, stored
//! in the clear in a clearly-marked local container. Encryption can be gated
//! on a human approval performed on a secondary device.

pub mod accel;
pub mod approval;
pub mod chunk;
pub mod config;
pub mod container;
pub mod crypto;
pub mod custodian;
pub mod engine;
pub mod error;
pub mod executor;
pub mod keys;

pub use config::Config;
pub use engine::{ClientContext, DecryptOptions, EncryptOptions, Engine};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{ClientContext, DecryptOptions, EncryptOptions, Engine};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{ProgressEvent, ProgressObserver};
}
