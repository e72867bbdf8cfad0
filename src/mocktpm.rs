//! An in-process TPM 1.2 authorization model for tests.
//!
//! It hands out auth handles and nonces, derives OSAP/DSAP shared secrets
//! from registered entity secrets, checks command HMACs and signs responses
//! the way a TPM does. Transient failures can be injected.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

use crate::crypt::{self, AuthRound};
use crate::secret::Secret;
use crate::tpm::{
    AuthCommand, AuthHandle, AuthResponse, EntityType, Nonce, Sha1Digest, TPM_E_RESOURCES,
    Transport, TransportError, XsapReply,
};

pub const TPM_E_AUTHFAIL: u32 = 0x0001;
pub const TPM_E_INVALID_KEYHANDLE: u32 = 0x000C;
pub const TPM_E_INVALID_AUTHHANDLE: u32 = 0x0022;

/// Routes engine logs to the test harness when `RUST_LOG` is set. Safe to
/// call repeatedly.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub oiap: u32,
    pub osap: u32,
    pub dsap: u32,
    pub terminate: u32,
    pub get_random: u32,
}

struct MockSession {
    nonce_even: Nonce,
    /// `None` for OIAP: the caller names the object secret per command.
    shared: Option<Sha1Digest>,
}

#[derive(Default)]
struct MockState {
    next_handle: u32,
    nonce_counter: u32,
    sessions: HashMap<u32, MockSession>,
    entities: HashMap<(EntityType, u32), Sha1Digest>,
    delegations: HashMap<Vec<u8>, Sha1Digest>,
    transient_failures: u32,
    corrupt_next_response: bool,
    calls: CallCounts,
    terminated: Vec<AuthHandle>,
    last_dsap: Option<(EntityType, u32, Vec<u8>)>,
}

impl MockState {
    fn next_nonce(&mut self) -> Nonce {
        self.nonce_counter += 1;
        Nonce(crypt::sha1(&self.nonce_counter.to_be_bytes()))
    }

    fn take_transient(&mut self) -> Result<(), TransportError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            trace!(left = self.transient_failures, "injecting resources unavailable");
            return Err(TransportError::Tpm(TPM_E_RESOURCES));
        }
        Ok(())
    }

    fn open(&mut self, shared: Option<Sha1Digest>) -> (AuthHandle, Nonce) {
        self.next_handle += 1;
        let handle = 0x0200_0000 + self.next_handle;
        let nonce_even = self.next_nonce();
        self.sessions
            .insert(handle, MockSession { nonce_even, shared });
        (AuthHandle(handle), nonce_even)
    }

    fn open_xsap(&mut self, parent_secret: Sha1Digest, nonce_odd_xsap: &Nonce) -> XsapReply {
        let nonce_even_xsap = self.next_nonce();
        let shared = crypt::derive_shared_secret(
            &Secret::from_bytes(parent_secret),
            &nonce_even_xsap,
            nonce_odd_xsap,
        )
        .map(|s| *s.expose())
        .unwrap_or_default();
        let (handle, nonce_even) = self.open(Some(shared));
        XsapReply {
            handle,
            nonce_even,
            nonce_even_xsap,
        }
    }
}

#[derive(Default)]
pub struct MockTpm {
    state: Mutex<MockState>,
}

impl MockTpm {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    /// Registers the authorization secret of a TPM object.
    pub fn set_entity_secret(&self, entity_type: EntityType, handle: u32, secret: Sha1Digest) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert((entity_type, handle), secret);
    }

    /// Registers the secret a delegation blob or row value unlocks.
    pub fn set_delegation_secret(&self, entity_value: &[u8], secret: Sha1Digest) {
        self.state
            .lock()
            .unwrap()
            .delegations
            .insert(entity_value.to_vec(), secret);
    }

    /// Makes the next `n` session-opening calls fail with `TPM_E_RESOURCES`.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().transient_failures = n;
    }

    /// Flips a bit in the next response HMAC.
    pub fn corrupt_next_response(&self) {
        self.state.lock().unwrap().corrupt_next_response = true;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().unwrap().calls
    }

    pub fn terminated(&self) -> Vec<AuthHandle> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn is_open(&self, handle: AuthHandle) -> bool {
        self.state.lock().unwrap().sessions.contains_key(&handle.0)
    }

    pub fn shared_secret(&self, handle: AuthHandle) -> Option<Sha1Digest> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(&handle.0)
            .and_then(|s| s.shared)
    }

    pub fn last_dsap(&self) -> Option<(EntityType, u32, Vec<u8>)> {
        self.state.lock().unwrap().last_dsap.clone()
    }

    /// Runs an authorized command: checks `auth` against `in_digest` and
    /// answers with a response trailer over `out_digest`. OIAP sessions are
    /// keyed with `object_secret`, OSAP/DSAP sessions with their shared secret.
    pub fn execute(
        &self,
        auth: &AuthCommand,
        in_digest: &Sha1Digest,
        out_digest: &Sha1Digest,
        object_secret: Option<&Sha1Digest>,
    ) -> Result<AuthResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get(&auth.handle.0)
            .ok_or(TransportError::Tpm(TPM_E_INVALID_AUTHHANDLE))?;
        let key = session
            .shared
            .or_else(|| object_secret.copied())
            .ok_or(TransportError::Tpm(TPM_E_AUTHFAIL))?;
        let key = Secret::from_bytes(key);

        let inbound = AuthRound {
            nonce_even: session.nonce_even,
            nonce_odd: auth.nonce_odd,
            continue_session: auth.continue_session,
        };
        if !crypt::verify(&key, in_digest, &inbound, &auth.hmac).unwrap_or(false) {
            state.sessions.remove(&auth.handle.0);
            return Err(TransportError::Tpm(TPM_E_AUTHFAIL));
        }

        let nonce_even = state.next_nonce();
        let outbound = AuthRound {
            nonce_even,
            nonce_odd: auth.nonce_odd,
            continue_session: auth.continue_session,
        };
        let mut hmac = crypt::sign(&key, out_digest, &outbound).unwrap_or_default();
        if std::mem::take(&mut state.corrupt_next_response) {
            hmac[0] ^= 0x01;
        }

        if auth.continue_session {
            if let Some(s) = state.sessions.get_mut(&auth.handle.0) {
                s.nonce_even = nonce_even;
            }
        } else {
            state.sessions.remove(&auth.handle.0);
        }

        Ok(AuthResponse {
            nonce_even,
            continue_session: auth.continue_session,
            hmac,
        })
    }
}

impl Transport for MockTpm {
    fn oiap(&self) -> Result<(AuthHandle, Nonce), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.oiap += 1;
        state.take_transient()?;
        Ok(state.open(None))
    }

    fn osap(
        &self,
        entity_type: EntityType,
        entity_value: u32,
        nonce_odd_osap: &Nonce,
    ) -> Result<XsapReply, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.osap += 1;
        state.take_transient()?;
        let secret = *state
            .entities
            .get(&(entity_type, entity_value))
            .ok_or(TransportError::Tpm(TPM_E_INVALID_KEYHANDLE))?;
        Ok(state.open_xsap(secret, nonce_odd_osap))
    }

    fn dsap(
        &self,
        entity_type: EntityType,
        key_handle: u32,
        nonce_odd_dsap: &Nonce,
        entity_value: &[u8],
    ) -> Result<XsapReply, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.dsap += 1;
        state.take_transient()?;
        state.last_dsap = Some((entity_type, key_handle, entity_value.to_vec()));
        let secret = *state
            .delegations
            .get(entity_value)
            .ok_or(TransportError::Tpm(TPM_E_INVALID_KEYHANDLE))?;
        Ok(state.open_xsap(secret, nonce_odd_dsap))
    }

    fn terminate_handle(&self, handle: AuthHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.terminate += 1;
        state.terminated.push(handle);
        state
            .sessions
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(TransportError::Tpm(TPM_E_INVALID_AUTHHANDLE))
    }

    fn get_random(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.get_random += 1;
        // Short reads, like a TPM with a small output buffer.
        let nonce = state.next_nonce();
        Ok(nonce.0[..len.min(16)].to_vec())
    }
}
