//! Policy objects: an authorization secret plus the rules for using it.
//!
//! A policy is shared between every session that authorizes against it, so
//! its state sits behind a mutex. Resolving the secret, checking expiry and
//! recording a use each take the lock once, which keeps a flush from racing a
//! resolve and keeps concurrent counter decrements consistent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, instrument, warn};

use crate::callbacks::AuthCallbacks;
use crate::error::{Error, ErrorKind, Result};
use crate::lifetime::{Lifetime, LifetimeState};
use crate::secret::{PopupHashMode, Resolved, Secret, SecretMode, SecretPrompt, SecretState};
use crate::tpm::{EntityType, TAG_DELG_KEY_BLOB, TAG_DELG_OWNER_BLOB};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    Usage,
    Migration,
    Operator,
}

/// Delegated authority a policy can carry instead of the object's own
/// secret. A parent with a delegation opens DSAP rather than OSAP sessions.
#[derive(Clone, PartialEq, Eq)]
pub enum Delegation {
    OwnerBlob(Vec<u8>),
    KeyBlob(Vec<u8>),
    /// Index of a row in the TPM's delegation table.
    Row(u32),
}

impl fmt::Debug for Delegation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delegation::OwnerBlob(b) => write!(f, "OwnerBlob({} bytes)", b.len()),
            Delegation::KeyBlob(b) => write!(f, "KeyBlob({} bytes)", b.len()),
            Delegation::Row(i) => write!(f, "Row({i})"),
        }
    }
}

impl Delegation {
    fn validate(&self) -> Result<()> {
        let (blob, expected) = match self {
            Delegation::OwnerBlob(b) => (b, TAG_DELG_OWNER_BLOB),
            Delegation::KeyBlob(b) => (b, TAG_DELG_KEY_BLOB),
            Delegation::Row(_) => return Ok(()),
        };
        match blob.get(..2) {
            Some(&[hi, lo]) if u16::from_be_bytes([hi, lo]) == expected => Ok(()),
            Some(&[hi, lo]) => Err(Error::bad_parameter(format!(
                "unsupported delegation blob tag 0x{:04x}",
                u16::from_be_bytes([hi, lo])
            ))),
            _ => Err(Error::bad_parameter("delegation blob is too short")),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Delegation::OwnerBlob(_) => EntityType::DelOwnerBlob,
            Delegation::KeyBlob(_) => EntityType::DelKeyBlob,
            Delegation::Row(_) => EntityType::DelRow,
        }
    }

    /// The bytes DSAP sends as its entity value.
    pub fn entity_value(&self) -> Vec<u8> {
        match self {
            Delegation::OwnerBlob(b) | Delegation::KeyBlob(b) => b.clone(),
            Delegation::Row(index) => index.to_be_bytes().to_vec(),
        }
    }
}

/// What a session gets when it asks a policy for its secret.
pub(crate) enum Acquired {
    Secret(Secret),
    Callbacks(Arc<dyn AuthCallbacks>),
}

#[derive(Default)]
struct PolicyState {
    secret: SecretState,
    lifetime: LifetimeState,
    callbacks: Option<Arc<dyn AuthCallbacks>>,
    delegation: Option<Delegation>,
}

pub struct Policy {
    kind: PolicyKind,
    state: Mutex<PolicyState>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Policy");
        s.field("kind", &self.kind);
        if let Ok(state) = self.state.lock() {
            s.field("secret", &state.secret)
                .field("lifetime", &state.lifetime)
                .field("callbacks", &state.callbacks.is_some())
                .field("delegation", &state.delegation);
        }
        s.finish()
    }
}

impl Policy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            state: Mutex::new(PolicyState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PolicyState>> {
        Ok(self.state.lock()?)
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn mode(&self) -> Result<SecretMode> {
        Ok(self.lock()?.secret.mode())
    }

    pub fn is_set(&self) -> Result<bool> {
        Ok(self.lock()?.secret.is_set())
    }

    /// Sets the secret and its mode. A running timer window starts over; a
    /// use counter is only reset through [`set_lifetime`](Self::set_lifetime).
    #[instrument(level = "debug", skip(self, bytes), fields(kind = ?self.kind))]
    pub fn set_secret(&self, mode: SecretMode, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        if mode == SecretMode::Callback && state.callbacks.is_none() {
            return Err(Error::bad_parameter(
                "callback mode requires registered callbacks",
            ));
        }
        state.secret.set(mode, bytes)?;
        state.lifetime.restart_timer_at(Instant::now());
        Ok(())
    }

    pub fn flush_secret(&self) -> Result<()> {
        self.lock()?.secret.flush();
        Ok(())
    }

    pub fn set_lifetime(&self, lifetime: Lifetime) -> Result<()> {
        debug!(kind = ?self.kind, ?lifetime, "policy lifetime set");
        self.lock()?.lifetime = LifetimeState::arm(lifetime);
        Ok(())
    }

    pub fn lifetime(&self) -> Result<Lifetime> {
        Ok(self.lock()?.lifetime.lifetime())
    }

    pub fn has_expired(&self) -> Result<bool> {
        Ok(self.lock()?.lifetime.has_expired())
    }

    /// Seconds left before a timer-bound secret expires.
    pub fn seconds_until_expired(&self) -> Result<u32> {
        self.lock()?.lifetime.seconds_until_expired()
    }

    /// Signatures left before a counter-bound secret expires.
    pub fn uses_remaining(&self) -> Result<u32> {
        self.lock()?.lifetime.uses_remaining()
    }

    /// Registers application signing callbacks. Clearing them while the
    /// policy is in Callback mode is refused.
    pub fn set_callbacks(&self, callbacks: Option<Arc<dyn AuthCallbacks>>) -> Result<()> {
        let mut state = self.lock()?;
        if callbacks.is_none() && state.secret.mode() == SecretMode::Callback {
            return Err(Error::bad_parameter(
                "cannot remove callbacks from a callback-mode policy",
            ));
        }
        state.callbacks = callbacks;
        Ok(())
    }

    pub fn set_delegation(&self, delegation: Delegation) -> Result<()> {
        delegation.validate()?;
        debug!(kind = ?self.kind, ?delegation, "policy delegation set");
        self.lock()?.delegation = Some(delegation);
        Ok(())
    }

    pub fn clear_delegation(&self) -> Result<()> {
        self.lock()?.delegation = None;
        Ok(())
    }

    pub fn delegation(&self) -> Result<Option<Delegation>> {
        Ok(self.lock()?.delegation.clone())
    }

    pub fn set_prompt_text(&self, text: impl Into<String>) -> Result<()> {
        self.lock()?.secret.set_prompt_text(text);
        Ok(())
    }

    pub fn set_popup_hash_mode(&self, mode: PopupHashMode) -> Result<()> {
        self.lock()?.secret.set_popup_hash_mode(mode);
        Ok(())
    }

    /// Checks expiry and resolves the secret in one critical section.
    pub(crate) fn acquire(
        &self,
        prompt: Option<&dyn SecretPrompt>,
        allow_interactive: bool,
    ) -> Result<Acquired> {
        let mut state = self.lock()?;
        if state.lifetime.has_expired() {
            debug!(kind = ?self.kind, "policy secret has expired");
            return Err(Error::tsp(ErrorKind::PolicyExpired));
        }
        match state.secret.resolve(prompt, allow_interactive)? {
            Resolved::Secret(secret) => Ok(Acquired::Secret(secret)),
            Resolved::Callback => state
                .callbacks
                .clone()
                .map(Acquired::Callbacks)
                .ok_or_else(|| Error::bad_parameter("callback mode without callbacks")),
        }
    }

    /// Takes one use of the secret, failing with `PolicyExpired` if none is
    /// left. The check and the decrement happen under one lock, so two
    /// commands racing for the last use cannot both get it.
    pub(crate) fn take_use(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.lifetime.has_expired() {
            debug!(kind = ?self.kind, "no uses left");
            return Err(Error::tsp(ErrorKind::PolicyExpired));
        }
        state.lifetime.decrement_on_use();
        Ok(())
    }

    /// Hands back a use taken for a signature that was never produced.
    pub(crate) fn refund_use(&self) {
        match self.lock() {
            Ok(mut state) => state.lifetime.refund_use(),
            Err(e) => warn!(kind = ?self.kind, error = %e, "could not hand back a policy use"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{CallbackError, EncAuth, HmacRequest, XorRequest};
    use crate::tpm::Sha1Digest;
    use std::thread;

    struct Noop;

    impl AuthCallbacks for Noop {
        fn hmac_sign(&self, _: &HmacRequest<'_>) -> Result<Sha1Digest, CallbackError> {
            Ok([0; 20])
        }

        fn hmac_verify(&self, _: &HmacRequest<'_>, _: &Sha1Digest) -> Result<bool, CallbackError> {
            Ok(true)
        }

        fn xor_enc(&self, _: &XorRequest<'_>) -> Result<EncAuth, CallbackError> {
            Ok(EncAuth::default())
        }
    }

    fn secret_bytes(acquired: Acquired) -> Sha1Digest {
        match acquired {
            Acquired::Secret(s) => *s.expose(),
            Acquired::Callbacks(_) => panic!("expected a secret"),
        }
    }

    #[test]
    fn test_new_policy_defaults() {
        let policy = Policy::new(PolicyKind::Usage);
        assert_eq!(policy.kind(), PolicyKind::Usage);
        assert_eq!(policy.mode().unwrap(), SecretMode::default());
        assert!(!policy.is_set().unwrap());
        assert!(!policy.has_expired().unwrap());
        assert_eq!(policy.lifetime().unwrap(), Lifetime::Always);
    }

    #[test]
    fn test_set_and_flush() {
        let policy = Policy::new(PolicyKind::Usage);
        policy.set_secret(SecretMode::PreHashed, &[7; 20]).unwrap();
        assert!(policy.is_set().unwrap());
        assert_eq!(secret_bytes(policy.acquire(None, false).unwrap()), [7; 20]);

        policy.flush_secret().unwrap();
        assert!(!policy.is_set().unwrap());
        let err = policy.acquire(None, false).err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::AuthRequired);
    }

    #[test]
    fn test_expired_policy_refuses_to_resolve() {
        let policy = Policy::new(PolicyKind::Usage);
        policy.set_secret(SecretMode::Plain, b"secret").unwrap();
        policy.set_lifetime(Lifetime::Counter(1)).unwrap();

        assert!(policy.acquire(None, false).is_ok());
        policy.take_use().unwrap();
        assert!(policy.has_expired().unwrap());

        let err = policy.acquire(None, false).err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::PolicyExpired);
    }

    #[test]
    fn test_timer_query() {
        let policy = Policy::new(PolicyKind::Usage);
        assert!(policy.seconds_until_expired().is_err());
        policy.set_lifetime(Lifetime::Timer(60)).unwrap();
        let left = policy.seconds_until_expired().unwrap();
        assert!(left <= 60 && left >= 59);
    }

    #[test]
    fn test_callback_mode_needs_callbacks() {
        let policy = Policy::new(PolicyKind::Usage);
        let err = policy.set_secret(SecretMode::Callback, &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::BadParameter(_)));

        policy.set_callbacks(Some(Arc::new(Noop))).unwrap();
        policy.set_secret(SecretMode::Callback, &[]).unwrap();
        assert!(matches!(
            policy.acquire(None, false).ok(),
            Some(Acquired::Callbacks(_))
        ));
        assert!(policy.set_callbacks(None).is_err());
    }

    #[test]
    fn test_delegation_tags() {
        let policy = Policy::new(PolicyKind::Usage);

        let owner = Delegation::OwnerBlob(vec![0x00, 0x2A, 0xff]);
        policy.set_delegation(owner.clone()).unwrap();
        assert_eq!(policy.delegation().unwrap(), Some(owner));

        policy
            .set_delegation(Delegation::KeyBlob(vec![0x00, 0x27]))
            .unwrap();

        for bad in [
            Delegation::OwnerBlob(vec![0x00, 0x27]),
            Delegation::KeyBlob(vec![0x00, 0x2A]),
            Delegation::KeyBlob(vec![0x27]),
        ] {
            let err = policy.set_delegation(bad).unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::BadParameter(_)));
        }

        policy.set_delegation(Delegation::Row(3)).unwrap();
        assert_eq!(Delegation::Row(3).entity_value(), vec![0, 0, 0, 3]);
        assert_eq!(Delegation::Row(3).entity_type(), EntityType::DelRow);

        policy.clear_delegation().unwrap();
        assert_eq!(policy.delegation().unwrap(), None);
    }

    #[test]
    fn test_concurrent_uses_are_counted_once_each() {
        let policy = Arc::new(Policy::new(PolicyKind::Usage));
        policy.set_secret(SecretMode::None, &[]).unwrap();
        policy.set_lifetime(Lifetime::Counter(100)).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let policy = policy.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        policy.acquire(None, false).unwrap();
                        policy.take_use().unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(policy.uses_remaining().unwrap(), 0);
        assert!(policy.has_expired().unwrap());
    }

    #[test]
    fn test_last_use_goes_to_one_caller() {
        let policy = Policy::new(PolicyKind::Usage);
        policy.set_lifetime(Lifetime::Counter(1)).unwrap();

        let taken: Vec<bool> = thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| policy.take_use().is_ok()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(taken.iter().filter(|ok| **ok).count(), 1);
        let err = policy.take_use().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::PolicyExpired);
    }

    #[test]
    fn test_refunded_use_can_be_taken_again() {
        let policy = Policy::new(PolicyKind::Usage);
        policy.set_lifetime(Lifetime::Counter(1)).unwrap();

        policy.take_use().unwrap();
        assert!(policy.has_expired().unwrap());
        policy.refund_use();
        assert_eq!(policy.uses_remaining().unwrap(), 1);
        policy.take_use().unwrap();
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let policy = Policy::new(PolicyKind::Migration);
        policy.set_secret(SecretMode::PreHashed, &[0xAB; 20]).unwrap();
        let out = format!("{policy:?}");
        assert!(out.contains("REDACTED"));
        assert!(!out.contains("171"));
    }
}
