//! The TPM-facing side of the engine.
//!
//! The engine never talks to a TPM directly. It goes through a [`Transport`]
//! (typically an RPC client for the core services daemon), which delivers the
//! OIAP, OSAP and DSAP requests and releases auth handles. This module also
//! holds the TPM 1.2 constants the engine needs and the byte layout of the
//! authorization trailer attached to every authorized command.

use std::fmt;
use thiserror::Error;
use tracing::trace;

use crate::error::{Error, Layer, Result};

pub const SHA1_DIGEST_SIZE: usize = 20;

/// A SHA-1 sized value: parameter digests, HMAC tags and raw secrets.
pub type Sha1Digest = [u8; SHA1_DIGEST_SIZE];

/// `TPM_KH_SRK`
pub const KH_SRK: u32 = 0x4000_0000;
/// `TPM_KH_OWNER`
pub const KH_OWNER: u32 = 0x4000_0001;

/// `TPM_E_RESOURCES`
pub const TPM_E_RESOURCES: u32 = 0x0000_0015;

/// Structure tag of a `TPM_DELEGATE_KEY_BLOB`.
pub const TAG_DELG_KEY_BLOB: u16 = 0x0027;
/// Structure tag of a `TPM_DELEGATE_OWNER_BLOB`.
pub const TAG_DELG_OWNER_BLOB: u16 = 0x002A;

/// A 20-byte nonce exchanged during an authorization round.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Nonce(pub Sha1Digest);

impl Nonce {
    pub fn as_bytes(&self) -> &Sha1Digest {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<Sha1Digest> for Nonce {
    fn from(value: Sha1Digest) -> Self {
        Self(value)
    }
}

/// An authorization session handle as assigned by the TPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthHandle(pub u32);

impl fmt::Display for AuthHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// `TPM_ENTITY_TYPE` values used when opening OSAP and DSAP sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EntityType {
    KeyHandle = 0x0001,
    Owner = 0x0002,
    Data = 0x0003,
    Srk = 0x0004,
    Key = 0x0005,
    Revoke = 0x0006,
    DelOwnerBlob = 0x0007,
    DelRow = 0x0008,
    DelKeyBlob = 0x0009,
    Counter = 0x000A,
    Nv = 0x000B,
    Operator = 0x000C,
}

impl EntityType {
    pub fn value(self) -> u16 {
        self as u16
    }
}

/// A TPM 1.2 command ordinal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ordinal(pub u32);

impl Ordinal {
    pub const OIAP: Ordinal = Ordinal(0x0000_000A);
    pub const OSAP: Ordinal = Ordinal(0x0000_000B);
    pub const CHANGE_AUTH: Ordinal = Ordinal(0x0000_000C);
    pub const CHANGE_AUTH_OWNER: Ordinal = Ordinal(0x0000_0010);
    pub const DSAP: Ordinal = Ordinal(0x0000_0011);
    pub const SEAL: Ordinal = Ordinal(0x0000_0017);
    pub const CREATE_WRAP_KEY: Ordinal = Ordinal(0x0000_001F);
    pub const SEALX: Ordinal = Ordinal(0x0000_003D);
    pub const NV_DEFINE_SPACE: Ordinal = Ordinal(0x0000_00CC);
    pub const DELEGATE_CREATE_KEY_DELEGATION: Ordinal = Ordinal(0x0000_00D4);
    pub const DELEGATE_CREATE_OWNER_DELEGATION: Ordinal = Ordinal(0x0000_00D5);
    pub const CREATE_COUNTER: Ordinal = Ordinal(0x0000_00DC);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Ordinal::OIAP => "OIAP",
            Ordinal::OSAP => "OSAP",
            Ordinal::CHANGE_AUTH => "ChangeAuth",
            Ordinal::CHANGE_AUTH_OWNER => "ChangeAuthOwner",
            Ordinal::DSAP => "DSAP",
            Ordinal::SEAL => "Seal",
            Ordinal::CREATE_WRAP_KEY => "CreateWrapKey",
            Ordinal::SEALX => "Sealx",
            Ordinal::NV_DEFINE_SPACE => "NV_DefineSpace",
            Ordinal::DELEGATE_CREATE_KEY_DELEGATION => "Delegate_CreateKeyDelegation",
            Ordinal::DELEGATE_CREATE_OWNER_DELEGATION => "Delegate_CreateOwnerDelegation",
            Ordinal::CREATE_COUNTER => "CreateCounter",
            _ => return None,
        })
    }
}

impl fmt::Debug for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:08x}", self.0),
        }
    }
}

/// Failures reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The TPM (or the daemon in front of it) is out of session slots for now.
    #[error("TPM resources unavailable")]
    ResourcesUnavailable,

    #[error("TPM returned 0x{0:08x}")]
    Tpm(u32),

    #[error("out of memory")]
    OutOfMemory,

    #[error("connection failed: {0}")]
    Connection(String),
}

impl TransportError {
    /// Whether a later attempt of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::ResourcesUnavailable)
            || matches!(self, TransportError::Tpm(code) if *code == TPM_E_RESOURCES)
    }

    pub fn layer(&self) -> Layer {
        match self {
            TransportError::ResourcesUnavailable | TransportError::Tpm(_) => Layer::Tpm,
            TransportError::OutOfMemory | TransportError::Connection(_) => Layer::Tcs,
        }
    }

    pub(crate) fn code(&self) -> u32 {
        match self {
            TransportError::ResourcesUnavailable => TPM_E_RESOURCES,
            TransportError::Tpm(code) => *code,
            TransportError::OutOfMemory => 0x0005,
            TransportError::Connection(_) => 0x0011,
        }
    }
}

/// Result of an OSAP or DSAP request.
#[derive(Debug, Clone, Copy)]
pub struct XsapReply {
    pub handle: AuthHandle,
    /// The first rolling even nonce of the session.
    pub nonce_even: Nonce,
    /// The TPM's half of the shared-secret derivation.
    pub nonce_even_xsap: Nonce,
}

/// The collaborator that carries session requests to the TPM.
///
/// Implementations are expected to serialize access to the underlying
/// connection themselves; every method takes `&self`.
pub trait Transport {
    /// Opens an object-independent session.
    fn oiap(&self) -> Result<(AuthHandle, Nonce), TransportError>;

    /// Opens an object-specific session for `entity_value`.
    fn osap(
        &self,
        entity_type: EntityType,
        entity_value: u32,
        nonce_odd_osap: &Nonce,
    ) -> Result<XsapReply, TransportError>;

    /// Opens a delegate-specific session. `entity_value` is a delegation blob
    /// or a big-endian row index, depending on `entity_type`.
    fn dsap(
        &self,
        entity_type: EntityType,
        key_handle: u32,
        nonce_odd_dsap: &Nonce,
        entity_value: &[u8],
    ) -> Result<XsapReply, TransportError>;

    /// Releases an auth handle on the TPM.
    fn terminate_handle(&self, handle: AuthHandle) -> Result<(), TransportError>;

    /// Returns up to `len` bytes from the TPM's RNG.
    fn get_random(&self, len: usize) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn oiap(&self) -> Result<(AuthHandle, Nonce), TransportError> {
        (**self).oiap()
    }

    fn osap(
        &self,
        entity_type: EntityType,
        entity_value: u32,
        nonce_odd_osap: &Nonce,
    ) -> Result<XsapReply, TransportError> {
        (**self).osap(entity_type, entity_value, nonce_odd_osap)
    }

    fn dsap(
        &self,
        entity_type: EntityType,
        key_handle: u32,
        nonce_odd_dsap: &Nonce,
        entity_value: &[u8],
    ) -> Result<XsapReply, TransportError> {
        (**self).dsap(entity_type, key_handle, nonce_odd_dsap, entity_value)
    }

    fn terminate_handle(&self, handle: AuthHandle) -> Result<(), TransportError> {
        (**self).terminate_handle(handle)
    }

    fn get_random(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).get_random(len)
    }
}

/// Lets a transport feed [`tsp_rand::TpmRand`].
pub struct TransportRandom<'a, T: ?Sized>(pub &'a T);

impl<T: Transport + ?Sized> tsp_rand::RandomSource for TransportRandom<'_, T> {
    type Error = TransportError;

    fn get_random(&self, len: usize) -> Result<Vec<u8>, Self::Error> {
        self.0.get_random(len)
    }
}

/// The authorization trailer sent with a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCommand {
    pub handle: AuthHandle,
    pub nonce_odd: Nonce,
    pub continue_session: bool,
    pub hmac: Sha1Digest,
}

impl AuthCommand {
    pub const SIZE: usize = 4 + SHA1_DIGEST_SIZE + 1 + SHA1_DIGEST_SIZE;

    /// `authHandle ‖ nonceOdd ‖ continueAuthSession ‖ authData`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.handle.0.to_be_bytes());
        out.extend_from_slice(self.nonce_odd.as_bytes());
        out.push(u8::from(self.continue_session));
        out.extend_from_slice(&self.hmac);
        out
    }
}

/// The authorization trailer returned with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub nonce_even: Nonce,
    pub continue_session: bool,
    pub hmac: Sha1Digest,
}

impl AuthResponse {
    pub const SIZE: usize = SHA1_DIGEST_SIZE + 1 + SHA1_DIGEST_SIZE;

    /// Parses `nonceEven ‖ continueAuthSession ‖ resAuth`. Trailing bytes are
    /// left to the caller.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::bad_parameter(format!(
                "auth response needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        trace!(len = bytes.len(), "parsing auth response trailer");

        let mut nonce_even = [0u8; SHA1_DIGEST_SIZE];
        nonce_even.copy_from_slice(&bytes[..SHA1_DIGEST_SIZE]);
        let continue_session = match bytes[SHA1_DIGEST_SIZE] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::bad_parameter(format!(
                    "continueAuthSession must be 0 or 1, got {other}"
                )));
            }
        };
        let mut hmac = [0u8; SHA1_DIGEST_SIZE];
        hmac.copy_from_slice(&bytes[SHA1_DIGEST_SIZE + 1..Self::SIZE]);

        Ok(Self {
            nonce_even: Nonce(nonce_even),
            continue_session,
            hmac,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(self.nonce_even.as_bytes());
        out.push(u8::from(self.continue_session));
        out.extend_from_slice(&self.hmac);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_auth_command_layout() {
        let cmd = AuthCommand {
            handle: AuthHandle(0x0102_0304),
            nonce_odd: Nonce([0x22; 20]),
            continue_session: true,
            hmac: [0x33; 20],
        };
        let bytes = cmd.to_bytes();

        assert_eq!(bytes.len(), AuthCommand::SIZE);
        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..24], &[0x22; 20]);
        assert_eq!(bytes[24], 1);
        assert_eq!(&bytes[25..], &[0x33; 20]);
    }

    #[test]
    fn test_auth_response_parse() {
        let mut raw = vec![0x44; 20];
        raw.push(0);
        raw.extend_from_slice(&[0x55; 20]);
        raw.extend_from_slice(b"trailing");

        let resp = AuthResponse::from_bytes(&raw).unwrap();
        assert_eq!(resp.nonce_even, Nonce([0x44; 20]));
        assert!(!resp.continue_session);
        assert_eq!(resp.hmac, [0x55; 20]);
    }

    #[test]
    fn test_auth_response_rejects_short_input() {
        let err = AuthResponse::from_bytes(&[0u8; 40]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::BadParameter(_)));
    }

    #[test]
    fn test_auth_response_rejects_bad_continue_flag() {
        let mut raw = vec![0u8; AuthResponse::SIZE];
        raw[20] = 2;
        assert!(AuthResponse::from_bytes(&raw).is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::ResourcesUnavailable.is_transient());
        assert!(TransportError::Tpm(TPM_E_RESOURCES).is_transient());
        assert!(!TransportError::Tpm(0x01).is_transient());
        assert!(!TransportError::Connection("x".into()).is_transient());
    }

    #[test]
    fn test_ordinal_display() {
        assert_eq!(Ordinal::CREATE_WRAP_KEY.to_string(), "CreateWrapKey");
        assert_eq!(Ordinal(0x1234).to_string(), "0x00001234");
    }
}
