//! TPM 1.2 authorization sessions.
//!
//! Every privileged TPM 1.2 command is authorized with an HMAC over its
//! parameter digest and a pair of rolling nonces, keyed with the secret of
//! the object it acts on. This crate runs that exchange:
//!
//! - [`OneShotAuth`] opens an OIAP session and signs with an object's secret.
//! - [`SharedSecretSession`] opens an OSAP or DSAP session, derives a shared
//!   secret from a parent's secret, masks a child's new secrets with it and
//!   signs with it.
//! - [`Policy`] objects hold the secrets, resolve them from plain text, a
//!   digest, an interactive prompt or application callbacks, and expire them
//!   after a number of uses or seconds.
//!
//! Talking to the TPM is left to a [`Transport`].

pub mod callbacks;
pub mod config;
pub mod context;
pub mod crypt;
pub mod error;
pub mod handles;
pub mod lifetime;
#[cfg(test)]
mod mocktpm;
pub mod oiap;
pub mod policy;
pub mod retry;
pub mod secret;
pub mod tpm;
pub mod xsap;

pub use callbacks::{AuthCallbacks, SigningStrategy};
pub use config::{EngineConfig, NonceSource, RetryPolicy};
pub use context::{AuthEntity, Context};
pub use error::{Error, ErrorKind, Layer, Result};
pub use handles::PolicyHandle;
pub use lifetime::Lifetime;
pub use oiap::OneShotAuth;
pub use policy::{Delegation, Policy, PolicyKind};
pub use secret::{Secret, SecretMode, SecretPrompt};
pub use tpm::{AuthCommand, AuthHandle, AuthResponse, Nonce, Ordinal, Transport, TransportError};
pub use xsap::{ChildAuth, SharedSecretSession};
