//! The engine context: a transport, its configuration and the policies
//! created against it.

use rand::{RngCore, TryRngCore};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use tsp_rand::{RandError, TpmRand};

use crate::config::{EngineConfig, NonceSource};
use crate::error::{Error, Result};
use crate::handles::{Arena, PolicyHandle};
use crate::policy::{Acquired, Policy, PolicyKind};
use crate::secret::SecretPrompt;
use crate::tpm::{AuthHandle, EntityType, Nonce, SHA1_DIGEST_SIZE, Transport, TransportRandom};

/// An object a session authorizes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthEntity {
    pub entity_type: EntityType,
    /// The TPM handle of the object (a key handle, `KH_OWNER`, ...).
    pub handle: u32,
    pub policy: PolicyHandle,
}

pub struct Context<T> {
    transport: T,
    config: EngineConfig,
    prompt: Option<Arc<dyn SecretPrompt>>,
    policies: RwLock<Arena<Arc<Policy>>>,
}

impl<T: Transport> Context<T> {
    pub fn new(transport: T, config: EngineConfig) -> Self {
        debug!(?config, "creating authorization context");
        Self {
            transport,
            config,
            prompt: None,
            policies: RwLock::new(Arena::new()),
        }
    }

    /// Sets the collaborator Popup-mode policies ask for passphrases.
    pub fn with_prompt(mut self, prompt: Arc<dyn SecretPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn create_policy(&self, kind: PolicyKind) -> Result<PolicyHandle> {
        let handle = self
            .policies
            .write()?
            .insert(Arc::new(Policy::new(kind)))?;
        debug!(?handle, ?kind, "policy created");
        Ok(handle)
    }

    /// Looks up a live policy. The returned reference stays usable after the
    /// policy is closed, but the handle does not.
    pub fn policy(&self, handle: PolicyHandle) -> Result<Arc<Policy>> {
        Ok(self.policies.read()?.get(handle)?.clone())
    }

    pub fn close_policy(&self, handle: PolicyHandle) -> Result<()> {
        self.policies.write()?.remove(handle)?;
        debug!(?handle, "policy closed");
        Ok(())
    }

    pub(crate) fn acquire(&self, policy: &Policy) -> Result<Acquired> {
        policy.acquire(self.prompt.as_deref(), self.config.interactive_prompts)
    }

    /// A fresh odd nonce from the configured source.
    pub(crate) fn generate_nonce(&self) -> Result<Nonce> {
        let mut bytes = [0u8; SHA1_DIGEST_SIZE];
        match self.config.nonce_source {
            NonceSource::Local => rand::rng().fill_bytes(&mut bytes),
            NonceSource::Tpm => TpmRand::new(TransportRandom(&self.transport))
                .try_fill_bytes(&mut bytes)
                .map_err(|e| match e {
                    RandError::Source(t) => Error::from(t),
                    RandError::Exhausted => Error::internal("TPM returned no random bytes"),
                })?,
        }
        Ok(Nonce(bytes))
    }

    /// Best-effort release of an auth handle. Failures are logged only.
    pub(crate) fn release_handle(&self, handle: AuthHandle) {
        match self.transport.terminate_handle(handle) {
            Ok(()) => debug!(%handle, "auth handle released"),
            Err(e) => warn!(%handle, error = %e, "failed to release auth handle"),
        }
    }
}
