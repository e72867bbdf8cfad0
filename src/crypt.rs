//! SHA-1 based authorization primitives.
//!
//! Every authorized TPM 1.2 command carries
//! `HMAC-SHA1(secret, paramDigest ‖ nonceEven ‖ nonceOdd ‖ continueAuthSession)`.
//! OSAP and DSAP sessions additionally derive a shared secret from the
//! parent's secret and the two session-setup nonces, and use it to mask new
//! authorization values before they go on the wire.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::secret::Secret;
use crate::tpm::{Nonce, Sha1Digest};

type HmacSha1 = Hmac<Sha1>;

/// The nonce pair and continue flag a single authorization round is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRound {
    pub nonce_even: Nonce,
    pub nonce_odd: Nonce,
    pub continue_session: bool,
}

pub fn sha1(data: &[u8]) -> Sha1Digest {
    Sha1::digest(data).into()
}

fn keyed(key: &[u8], parts: &[&[u8]]) -> Result<HmacSha1> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key)
        .map_err(|e| Error::internal(format!("HMAC init error: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// `HMAC-SHA1(key, parts[0] ‖ parts[1] ‖ ...)`
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Result<Sha1Digest> {
    Ok(keyed(key, parts)?.finalize().into_bytes().into())
}

fn round_parts<'a>(digest: &'a Sha1Digest, round: &'a AuthRound, flag: &'a [u8; 1]) -> [&'a [u8]; 4] {
    [
        digest.as_slice(),
        round.nonce_even.as_bytes().as_slice(),
        round.nonce_odd.as_bytes().as_slice(),
        flag.as_slice(),
    ]
}

/// Computes the authorization tag for one round.
pub fn sign(secret: &Secret, digest: &Sha1Digest, round: &AuthRound) -> Result<Sha1Digest> {
    let flag = [u8::from(round.continue_session)];
    hmac_sha1(secret.expose(), &round_parts(digest, round, &flag))
}

/// Recomputes the tag for `round` and compares it with `received` in
/// constant time.
pub fn verify(
    secret: &Secret,
    digest: &Sha1Digest,
    round: &AuthRound,
    received: &Sha1Digest,
) -> Result<bool> {
    let flag = [u8::from(round.continue_session)];
    let mac = keyed(secret.expose(), &round_parts(digest, round, &flag))?;
    Ok(mac.verify_slice(received).is_ok())
}

/// `HMAC-SHA1(parentSecret, nonceEvenxSAP ‖ nonceOddxSAP)`
pub fn derive_shared_secret(
    parent: &Secret,
    nonce_even_xsap: &Nonce,
    nonce_odd_xsap: &Nonce,
) -> Result<Secret> {
    let mut shared = hmac_sha1(
        parent.expose(),
        &[nonce_even_xsap.as_bytes(), nonce_odd_xsap.as_bytes()],
    )?;
    let secret = Secret::from_bytes(shared);
    shared.zeroize();
    Ok(secret)
}

/// XOR-encrypts `value` for transmission:
/// `value ⊕ SHA1(sharedSecret ‖ nonce)`.
///
/// The mask is symmetric, so applying it to an encrypted value recovers the
/// original.
pub fn xor_mask(shared: &Secret, nonce: &Nonce, value: &Sha1Digest) -> Sha1Digest {
    let mut hasher = Sha1::new();
    hasher.update(shared.expose());
    hasher.update(nonce.as_bytes());
    let mut pad: Sha1Digest = hasher.finalize().into();

    let mut out = *value;
    for (o, p) in out.iter_mut().zip(pad.iter()) {
        *o ^= p;
    }
    pad.zeroize();
    out
}
