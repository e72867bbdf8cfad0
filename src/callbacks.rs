//! Who computes authorization tags and masks for a session.
//!
//! Sessions either use the engine's own SHA-1 primitives or hand every
//! computation to the application. The choice is made once when the session
//! is set up and covers both the HMAC and the XOR masking, so the two can
//! never come from different sources.

use std::sync::Arc;
use tracing::trace;

use crate::crypt::{self, AuthRound};
use crate::error::{Error, ErrorKind, Result};
use crate::secret::Secret;
use crate::tpm::{Nonce, Ordinal, Sha1Digest};

/// Error type application callbacks report failures with.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Everything a command HMAC is computed over.
#[derive(Debug, Clone, Copy)]
pub struct HmacRequest<'a> {
    /// The command being authorized. Unknown for OIAP sessions.
    pub ordinal: Option<Ordinal>,
    pub digest: &'a Sha1Digest,
    pub round: AuthRound,
    /// Present for OSAP and DSAP sessions.
    pub nonce_even_xsap: Option<Nonce>,
    pub nonce_odd_xsap: Option<Nonce>,
}

/// Inputs for masking a child's new authorization values.
#[derive(Debug, Clone, Copy)]
pub struct XorRequest<'a> {
    pub ordinal: Ordinal,
    pub nonce_even_xsap: Nonce,
    pub nonce_odd_xsap: Nonce,
    pub nonce_even: Nonce,
    pub nonce_odd: Nonce,
    /// `None` when the child's secret is itself held by the application.
    pub usage: Option<&'a Secret>,
    pub migration: Option<&'a Secret>,
}

/// Masked child authorization values, ready for the command payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncAuth {
    pub usage: Option<Sha1Digest>,
    pub migration: Option<Sha1Digest>,
}

/// Application-side signing, registered on a Callback-mode policy.
pub trait AuthCallbacks: Send + Sync {
    fn hmac_sign(&self, request: &HmacRequest<'_>) -> Result<Sha1Digest, CallbackError>;

    fn hmac_verify(
        &self,
        request: &HmacRequest<'_>,
        received: &Sha1Digest,
    ) -> Result<bool, CallbackError>;

    fn xor_enc(&self, request: &XorRequest<'_>) -> Result<EncAuth, CallbackError>;
}

fn callback_failed(err: CallbackError) -> Error {
    Error::tsp(ErrorKind::Callback(err.to_string()))
}

fn missing_key() -> Error {
    Error::internal("built-in signing requested without a key")
}

#[derive(Clone, Default)]
pub enum SigningStrategy {
    #[default]
    Default,
    Application(Arc<dyn AuthCallbacks>),
}

impl std::fmt::Debug for SigningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningStrategy::Default => f.write_str("Default"),
            SigningStrategy::Application(_) => f.write_str("Application"),
        }
    }
}

impl SigningStrategy {
    pub fn is_application(&self) -> bool {
        matches!(self, SigningStrategy::Application(_))
    }

    /// Produces the outbound tag. `key` is the session secret and is only
    /// read by the built-in strategy.
    pub fn sign(&self, key: Option<&Secret>, request: &HmacRequest<'_>) -> Result<Sha1Digest> {
        match self {
            SigningStrategy::Default => {
                crypt::sign(key.ok_or_else(missing_key)?, request.digest, &request.round)
            }
            SigningStrategy::Application(cb) => {
                trace!(ordinal = ?request.ordinal, "signing through application callback");
                cb.hmac_sign(request).map_err(callback_failed)
            }
        }
    }

    pub fn verify(
        &self,
        key: Option<&Secret>,
        request: &HmacRequest<'_>,
        received: &Sha1Digest,
    ) -> Result<bool> {
        match self {
            SigningStrategy::Default => crypt::verify(
                key.ok_or_else(missing_key)?,
                request.digest,
                &request.round,
                received,
            ),
            SigningStrategy::Application(cb) => {
                trace!(ordinal = ?request.ordinal, "verifying through application callback");
                cb.hmac_verify(request, received).map_err(callback_failed)
            }
        }
    }

    /// Masks the child values in `request`. The built-in strategy keys the
    /// usage value with the even auth nonce and the migration value with the
    /// odd one.
    pub fn xor_enc(&self, shared: Option<&Secret>, request: &XorRequest<'_>) -> Result<EncAuth> {
        match self {
            SigningStrategy::Default => {
                let shared = shared.ok_or_else(missing_key)?;
                Ok(EncAuth {
                    usage: request
                        .usage
                        .map(|s| crypt::xor_mask(shared, &request.nonce_even, s.expose())),
                    migration: request
                        .migration
                        .map(|s| crypt::xor_mask(shared, &request.nonce_odd, s.expose())),
                })
            }
            SigningStrategy::Application(cb) => cb.xor_enc(request).map_err(callback_failed),
        }
    }
}
