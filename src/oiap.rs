//! Object-independent authorization (OIAP).
//!
//! An OIAP session authorizes one command against one object with that
//! object's own secret. The handle is released after the response is
//! verified, unless the caller asked for the session to continue.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::callbacks::{HmacRequest, SigningStrategy};
use crate::context::{AuthEntity, Context};
use crate::crypt::AuthRound;
use crate::error::{Error, ErrorKind, Result};
use crate::policy::{Acquired, Policy};
use crate::retry::call_with_retry;
use crate::secret::Secret;
use crate::tpm::{AuthCommand, AuthHandle, AuthResponse, Nonce, Sha1Digest, Transport};

/// Where an OIAP session stands. [`OneShotAuth::begin`] generates the odd
/// nonce and opens the handle in one step, so a session is never observed
/// before `HandleAcquired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OiapState {
    HandleAcquired,
    Signed,
    VerifiedOk,
    Failed,
    Released,
}

pub struct OneShotAuth<'c, T: Transport> {
    ctx: &'c Context<T>,
    policy: Arc<Policy>,
    entity: AuthEntity,
    handle: AuthHandle,
    nonce_even: Nonce,
    nonce_odd: Nonce,
    continue_session: bool,
    signer: Option<(SigningStrategy, Option<Secret>)>,
    command: Option<AuthCommand>,
    state: OiapState,
    released: bool,
}

impl<'c, T: Transport> OneShotAuth<'c, T> {
    /// Opens an OIAP session for `entity`. Fails before touching the TPM if
    /// the entity's policy has expired.
    #[instrument(level = "debug", skip(ctx, entity), fields(entity_type = ?entity.entity_type))]
    pub fn begin(ctx: &'c Context<T>, entity: AuthEntity, continue_session: bool) -> Result<Self> {
        let policy = ctx.policy(entity.policy)?;
        if policy.has_expired()? {
            debug!("policy expired, not opening a session");
            return Err(Error::tsp(ErrorKind::PolicyExpired));
        }

        let nonce_odd = ctx.generate_nonce()?;
        let (handle, nonce_even) =
            call_with_retry(&ctx.config().retry, "OIAP", || ctx.transport().oiap())?;
        debug!(%handle, "OIAP session opened");

        Ok(Self {
            ctx,
            policy,
            entity,
            handle,
            nonce_even,
            nonce_odd,
            continue_session,
            signer: None,
            command: None,
            state: OiapState::HandleAcquired,
            released: false,
        })
    }

    pub fn state(&self) -> OiapState {
        self.state
    }

    pub fn handle(&self) -> AuthHandle {
        self.handle
    }

    pub fn entity(&self) -> &AuthEntity {
        &self.entity
    }

    pub fn nonce_even(&self) -> Nonce {
        self.nonce_even
    }

    pub fn nonce_odd(&self) -> Nonce {
        self.nonce_odd
    }

    /// The trailer produced by the last [`sign`](Self::sign).
    pub fn auth_command(&self) -> Option<&AuthCommand> {
        self.command.as_ref()
    }

    fn round(&self, continue_session: bool) -> AuthRound {
        AuthRound {
            nonce_even: self.nonce_even,
            nonce_odd: self.nonce_odd,
            continue_session,
        }
    }

    /// Releases the handle and marks the session failed.
    fn abort(&mut self, err: Error) -> Error {
        debug!(handle = %self.handle, error = %err, "aborting OIAP session");
        self.release_handle();
        self.state = OiapState::Failed;
        err
    }

    fn release_handle(&mut self) {
        if !self.released {
            self.released = true;
            self.ctx.release_handle(self.handle);
        }
    }

    /// Signs the command's parameter digest.
    ///
    /// A continued session can be signed again after a successful verify; it
    /// gets a fresh odd nonce for every round.
    #[instrument(level = "debug", skip_all, fields(handle = %self.handle))]
    pub fn sign(&mut self, digest: &Sha1Digest) -> Result<AuthCommand> {
        match self.state {
            OiapState::HandleAcquired => {}
            OiapState::VerifiedOk if !self.released => {}
            other => {
                return Err(Error::bad_parameter(format!(
                    "OIAP session cannot sign in state {other:?}"
                )));
            }
        }
        self.sign_round(digest).map_err(|e| self.abort(e))
    }

    fn sign_round(&mut self, digest: &Sha1Digest) -> Result<AuthCommand> {
        if self.state == OiapState::VerifiedOk {
            self.nonce_odd = self.ctx.generate_nonce()?;
        }
        let (strategy, key) = match self.ctx.acquire(&self.policy)? {
            Acquired::Secret(secret) => (SigningStrategy::Default, Some(secret)),
            Acquired::Callbacks(cb) => (SigningStrategy::Application(cb), None),
        };

        let request = HmacRequest {
            ordinal: None,
            digest,
            round: self.round(self.continue_session),
            nonce_even_xsap: None,
            nonce_odd_xsap: None,
        };
        self.policy.take_use()?;
        let hmac = strategy
            .sign(key.as_ref(), &request)
            .inspect_err(|_| self.policy.refund_use())?;

        let command = AuthCommand {
            handle: self.handle,
            nonce_odd: self.nonce_odd,
            continue_session: self.continue_session,
            hmac,
        };
        self.signer = Some((strategy, key));
        self.command = Some(command.clone());
        self.state = OiapState::Signed;
        Ok(command)
    }

    /// Checks the TPM's response trailer against the response parameter
    /// digest. A mismatch releases the handle and fails with `AuthFail`.
    #[instrument(level = "debug", skip_all, fields(handle = %self.handle))]
    pub fn verify(&mut self, digest: &Sha1Digest, response: &AuthResponse) -> Result<()> {
        if self.state != OiapState::Signed {
            return Err(Error::bad_parameter(format!(
                "OIAP session cannot verify in state {:?}",
                self.state
            )));
        }
        self.nonce_even = response.nonce_even;

        let request = HmacRequest {
            ordinal: None,
            digest,
            round: self.round(response.continue_session),
            nonce_even_xsap: None,
            nonce_odd_xsap: None,
        };
        let verified = match &self.signer {
            Some((strategy, key)) => strategy.verify(key.as_ref(), &request, &response.hmac),
            None => Err(Error::internal("verify without a signer")),
        };
        match verified {
            Ok(true) => {}
            Ok(false) => {
                warn!("response HMAC mismatch");
                return Err(self.abort(Error::tsp(ErrorKind::AuthFail)));
            }
            Err(e) => return Err(self.abort(e)),
        }

        self.state = OiapState::VerifiedOk;
        if !(self.continue_session && response.continue_session) {
            self.release_handle();
            self.state = OiapState::Released;
        }
        Ok(())
    }

    /// Releases the handle now, even for a continued session.
    pub fn release(mut self) {
        self.release_handle();
        self.state = OiapState::Released;
    }
}

impl<T: Transport> Drop for OneShotAuth<'_, T> {
    fn drop(&mut self) {
        // A verified continued session stays open for the caller.
        if self.state != OiapState::VerifiedOk {
            self.release_handle();
        }
    }
}
