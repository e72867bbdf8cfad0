//! Shared-secret sessions (OSAP and DSAP).
//!
//! One session authorizes a command against a parent object and carries the
//! child's new authorization values to the TPM masked with a secret both
//! sides derive from the parent's secret and the two session-setup nonces:
//!
//! ```text
//! shared     = HMAC-SHA1(parentSecret, nonceEvenxSAP ‖ nonceOddxSAP)
//! encAuthUse = usageAuth     ⊕ SHA1(shared ‖ nonceEven)
//! encAuthMig = migrationAuth ⊕ SHA1(shared ‖ nonceOdd)
//! ```
//!
//! A parent whose policy carries a delegation opens a DSAP session against
//! the delegation blob or row instead of an OSAP session against the object.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::callbacks::{EncAuth, HmacRequest, SigningStrategy, XorRequest};
use crate::context::{AuthEntity, Context};
use crate::crypt::{self, AuthRound};
use crate::error::{Error, ErrorKind, Result};
use crate::handles::PolicyHandle;
use crate::policy::{Acquired, Policy};
use crate::retry::call_with_retry;
use crate::secret::{Secret, SecretMode};
use crate::tpm::{
    AuthCommand, AuthHandle, AuthResponse, Nonce, Ordinal, Sha1Digest, Transport, XsapReply,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentAuth {
    Required,
    /// The command may run without parent authorization, e.g. defining NV
    /// space before the owner is set.
    NotRequired,
}

/// How a command uses a shared-secret session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XsapCommand {
    pub ordinal: Ordinal,
    pub parent_auth: ParentAuth,
    /// The command carries a new usage secret for the child.
    pub child_usage: bool,
    /// The command carries a migration secret when the child is migratable.
    pub child_migration: bool,
}

impl XsapCommand {
    pub fn for_ordinal(ordinal: Ordinal) -> Result<Self> {
        let (parent_auth, child_migration) = match ordinal {
            Ordinal::CREATE_WRAP_KEY => (ParentAuth::Required, true),
            Ordinal::CHANGE_AUTH
            | Ordinal::CHANGE_AUTH_OWNER
            | Ordinal::SEAL
            | Ordinal::SEALX
            | Ordinal::CREATE_COUNTER
            | Ordinal::DELEGATE_CREATE_KEY_DELEGATION
            | Ordinal::DELEGATE_CREATE_OWNER_DELEGATION => (ParentAuth::Required, false),
            Ordinal::NV_DEFINE_SPACE => (ParentAuth::NotRequired, false),
            other => {
                return Err(Error::bad_parameter(format!(
                    "{other} does not use a shared-secret session"
                )));
            }
        };
        Ok(Self {
            ordinal,
            parent_auth,
            child_usage: true,
            child_migration,
        })
    }
}

/// The object whose new secrets a command installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildAuth {
    pub usage: PolicyHandle,
    pub migration: Option<PolicyHandle>,
    /// Whether the child key can be migrated.
    pub migratable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XsapState {
    /// Set up and ready to sign, or needing no session at all.
    Ready,
    Signed,
    VerifiedOk,
    Failed,
    Released,
}

pub struct SharedSecretSession<'c, T: Transport> {
    ctx: &'c Context<T>,
    command: XsapCommand,
    /// `None` when the command runs without authorization.
    handle: Option<AuthHandle>,
    nonce_even: Nonce,
    nonce_odd: Nonce,
    nonce_even_xsap: Nonce,
    nonce_odd_xsap: Nonce,
    shared: Option<Secret>,
    strategy: SigningStrategy,
    enc: EncAuth,
    participants: Vec<Arc<Policy>>,
    continue_session: bool,
    auth: Option<AuthCommand>,
    state: XsapState,
    released: bool,
}

fn add_participant(participants: &mut Vec<Arc<Policy>>, policy: Arc<Policy>) {
    if !participants.iter().any(|p| Arc::ptr_eq(p, &policy)) {
        participants.push(policy);
    }
}

/// Takes one use from every participant, or none at all.
fn take_uses(participants: &[Arc<Policy>]) -> Result<()> {
    for (taken, policy) in participants.iter().enumerate() {
        if let Err(e) = policy.take_use() {
            refund_uses(&participants[..taken]);
            return Err(e);
        }
    }
    Ok(())
}

fn refund_uses(participants: &[Arc<Policy>]) {
    for policy in participants {
        policy.refund_use();
    }
}

/// Resolves a child secret. A child held by the application can only be
/// paired with an application-signed parent.
fn child_secret<T: Transport>(
    ctx: &Context<T>,
    strategy: &SigningStrategy,
    policy: &Policy,
) -> Result<Option<Secret>> {
    match ctx.acquire(policy)? {
        Acquired::Secret(secret) => Ok(Some(secret)),
        Acquired::Callbacks(_) if strategy.is_application() => Ok(None),
        Acquired::Callbacks(_) => Err(Error::bad_parameter(
            "mixed callback and non-callback modes in one session",
        )),
    }
}

impl<'c, T: Transport> SharedSecretSession<'c, T> {
    /// Sets up a session for `ordinal`: resolves the parent and child
    /// secrets, opens OSAP or DSAP, derives the shared secret and masks the
    /// child's new authorization values.
    ///
    /// Nothing is sent to the TPM until every secret has resolved. Any
    /// failure after the session is open releases its handle.
    #[instrument(
        level = "debug",
        skip(ctx, parent, child),
        fields(parent_handle = parent.handle)
    )]
    pub fn init(
        ctx: &'c Context<T>,
        ordinal: Ordinal,
        parent: AuthEntity,
        child: ChildAuth,
        continue_session: bool,
    ) -> Result<Self> {
        let command = XsapCommand::for_ordinal(ordinal)?;
        let parent_policy = ctx.policy(parent.policy)?;

        let optional = command.parent_auth == ParentAuth::NotRequired;
        let parent_acquired = if optional && parent_policy.mode()? == SecretMode::None {
            None
        } else {
            match ctx.acquire(&parent_policy) {
                Err(e) if optional && e.kind() == &ErrorKind::AuthRequired => None,
                acquired => Some(acquired?),
            }
        };
        let Some(parent_acquired) = parent_acquired else {
            debug!("no parent authorization, running without a session");
            return Self::without_session(ctx, command, &child);
        };

        let (strategy, parent_secret) = match parent_acquired {
            Acquired::Secret(secret) => (SigningStrategy::Default, Some(secret)),
            Acquired::Callbacks(cb) => (SigningStrategy::Application(cb), None),
        };
        let mut participants = vec![parent_policy.clone()];

        let mut usage = None;
        if command.child_usage {
            let policy = ctx.policy(child.usage)?;
            usage = child_secret(ctx, &strategy, &policy)?;
            add_participant(&mut participants, policy);
        }

        let mut migration = None;
        if command.child_migration && child.migratable {
            let handle = child.migration.ok_or_else(|| {
                debug!("migratable child without a migration policy");
                Error::tsp(ErrorKind::KeyNoMigrationPolicy)
            })?;
            let policy = ctx.policy(handle)?;
            migration = child_secret(ctx, &strategy, &policy)?;
            add_participant(&mut participants, policy);
        }

        let nonce_odd_xsap = ctx.generate_nonce()?;
        let reply = Self::open(ctx, &parent, &parent_policy, &nonce_odd_xsap)?;
        debug!(handle = %reply.handle, "shared-secret session opened");

        // From here on, dropping the session releases the handle.
        let mut session = Self {
            ctx,
            command,
            handle: Some(reply.handle),
            nonce_even: reply.nonce_even,
            nonce_odd: Nonce::default(),
            nonce_even_xsap: reply.nonce_even_xsap,
            nonce_odd_xsap,
            shared: None,
            strategy,
            enc: EncAuth::default(),
            participants,
            continue_session,
            auth: None,
            state: XsapState::Ready,
            released: false,
        };
        session.nonce_odd = ctx.generate_nonce()?;

        if let Some(parent_secret) = &parent_secret {
            session.shared = Some(crypt::derive_shared_secret(
                parent_secret,
                &session.nonce_even_xsap,
                &session.nonce_odd_xsap,
            )?);
        }

        let request = XorRequest {
            ordinal,
            nonce_even_xsap: session.nonce_even_xsap,
            nonce_odd_xsap: session.nonce_odd_xsap,
            nonce_even: session.nonce_even,
            nonce_odd: session.nonce_odd,
            usage: usage.as_ref(),
            migration: migration.as_ref(),
        };
        session.enc = session
            .strategy
            .xor_enc(session.shared.as_ref(), &request)?;
        Ok(session)
    }

    /// A command the parent need not authorize, sent with no session. With
    /// no shared secret to mask it, the child's usage secret travels as is.
    fn without_session(
        ctx: &'c Context<T>,
        command: XsapCommand,
        child: &ChildAuth,
    ) -> Result<Self> {
        let strategy = SigningStrategy::Default;
        let mut enc = EncAuth::default();
        if command.child_usage {
            let policy = ctx.policy(child.usage)?;
            enc.usage = child_secret(ctx, &strategy, &policy)?.map(|s| *s.expose());
        }
        Ok(Self {
            ctx,
            command,
            handle: None,
            nonce_even: Nonce::default(),
            nonce_odd: Nonce::default(),
            nonce_even_xsap: Nonce::default(),
            nonce_odd_xsap: Nonce::default(),
            shared: None,
            strategy,
            enc,
            participants: Vec::new(),
            continue_session: false,
            auth: None,
            state: XsapState::Ready,
            released: true,
        })
    }

    fn open(
        ctx: &Context<T>,
        parent: &AuthEntity,
        parent_policy: &Policy,
        nonce_odd_xsap: &Nonce,
    ) -> Result<XsapReply> {
        let retry = &ctx.config().retry;
        let reply = match parent_policy.delegation()? {
            Some(delegation) => {
                let entity_type = delegation.entity_type();
                let entity_value = delegation.entity_value();
                debug!(?entity_type, "opening DSAP session");
                call_with_retry(retry, "DSAP", || {
                    ctx.transport()
                        .dsap(entity_type, parent.handle, nonce_odd_xsap, &entity_value)
                })?
            }
            None => call_with_retry(retry, "OSAP", || {
                ctx.transport()
                    .osap(parent.entity_type, parent.handle, nonce_odd_xsap)
            })?,
        };
        Ok(reply)
    }

    pub fn command(&self) -> &XsapCommand {
        &self.command
    }

    pub fn state(&self) -> XsapState {
        self.state
    }

    /// Whether an authorization session was opened with the TPM.
    pub fn is_established(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<AuthHandle> {
        self.handle
    }

    pub fn nonce_even(&self) -> Nonce {
        self.nonce_even
    }

    pub fn nonce_odd(&self) -> Nonce {
        self.nonce_odd
    }

    pub fn nonce_even_xsap(&self) -> Nonce {
        self.nonce_even_xsap
    }

    pub fn nonce_odd_xsap(&self) -> Nonce {
        self.nonce_odd_xsap
    }

    /// The child's masked usage secret, for the command payload. Without a
    /// session this is the unmasked secret.
    pub fn enc_auth_usage(&self) -> Option<Sha1Digest> {
        self.enc.usage
    }

    pub fn enc_auth_migration(&self) -> Option<Sha1Digest> {
        self.enc.migration
    }

    pub fn auth_command(&self) -> Option<&AuthCommand> {
        self.auth.as_ref()
    }

    fn shared_secret(&self) -> Result<&Secret> {
        self.shared
            .as_ref()
            .ok_or_else(|| Error::internal("shared secret requested before it was derived"))
    }

    /// The key the strategy signs with. Application callbacks bring their own.
    fn signing_key(&self) -> Result<Option<&Secret>> {
        match self.strategy {
            SigningStrategy::Default => self.shared_secret().map(Some),
            SigningStrategy::Application(_) => Ok(None),
        }
    }

    fn request<'d>(&self, digest: &'d Sha1Digest, continue_session: bool) -> HmacRequest<'d> {
        HmacRequest {
            ordinal: Some(self.command.ordinal),
            digest,
            round: AuthRound {
                nonce_even: self.nonce_even,
                nonce_odd: self.nonce_odd,
                continue_session,
            },
            nonce_even_xsap: Some(self.nonce_even_xsap),
            nonce_odd_xsap: Some(self.nonce_odd_xsap),
        }
    }

    fn release_handle(&mut self) {
        if !self.released {
            self.released = true;
            if let Some(handle) = self.handle {
                self.ctx.release_handle(handle);
            }
        }
    }

    fn abort(&mut self, err: Error) -> Error {
        debug!(handle = ?self.handle, error = %err, "aborting shared-secret session");
        self.release_handle();
        self.state = XsapState::Failed;
        err
    }

    /// Signs the command's parameter digest. Without a session this does
    /// nothing and returns `None`.
    ///
    /// Every policy that took part in the session counts one use.
    #[instrument(level = "debug", skip_all, fields(ordinal = %self.command.ordinal))]
    pub fn sign(&mut self, digest: &Sha1Digest) -> Result<Option<AuthCommand>> {
        let Some(handle) = self.handle else {
            return Ok(None);
        };
        match self.state {
            XsapState::Ready => {}
            XsapState::VerifiedOk if !self.released => {}
            other => {
                return Err(Error::bad_parameter(format!(
                    "shared-secret session cannot sign in state {other:?}"
                )));
            }
        }
        self.sign_round(handle, digest)
            .map(Some)
            .map_err(|e| self.abort(e))
    }

    fn sign_round(&mut self, handle: AuthHandle, digest: &Sha1Digest) -> Result<AuthCommand> {
        if self.state == XsapState::VerifiedOk {
            self.nonce_odd = self.ctx.generate_nonce()?;
        }
        take_uses(&self.participants)?;
        let request = self.request(digest, self.continue_session);
        let hmac = self
            .signing_key()
            .and_then(|key| self.strategy.sign(key, &request))
            .inspect_err(|_| refund_uses(&self.participants))?;

        let auth = AuthCommand {
            handle,
            nonce_odd: self.nonce_odd,
            continue_session: self.continue_session,
            hmac,
        };
        self.auth = Some(auth.clone());
        self.state = XsapState::Signed;
        Ok(auth)
    }

    /// Checks the TPM's response trailer. Without a session this does
    /// nothing. A mismatch releases the handle and fails with `AuthFail`.
    #[instrument(level = "debug", skip_all, fields(ordinal = %self.command.ordinal))]
    pub fn verify(&mut self, digest: &Sha1Digest, response: &AuthResponse) -> Result<()> {
        if self.handle.is_none() {
            return Ok(());
        }
        if self.state != XsapState::Signed {
            return Err(Error::bad_parameter(format!(
                "shared-secret session cannot verify in state {:?}",
                self.state
            )));
        }
        self.nonce_even = response.nonce_even;

        let request = self.request(digest, response.continue_session);
        let verified = self
            .signing_key()
            .and_then(|key| self.strategy.verify(key, &request, &response.hmac));
        match verified {
            Ok(true) => {}
            Ok(false) => {
                warn!("response HMAC mismatch");
                return Err(self.abort(Error::tsp(ErrorKind::AuthFail)));
            }
            Err(e) => return Err(self.abort(e)),
        }

        self.state = XsapState::VerifiedOk;
        if !(self.continue_session && response.continue_session) {
            self.release_handle();
            self.state = XsapState::Released;
        }
        Ok(())
    }

    /// Ends the session, releasing a handle that is still open.
    pub fn free(mut self) {
        self.release_handle();
        self.state = XsapState::Released;
    }
}

impl<T: Transport> Drop for SharedSecretSession<'_, T> {
    fn drop(&mut self) {
        if self.state != XsapState::VerifiedOk {
            self.release_handle();
        }
    }
}
