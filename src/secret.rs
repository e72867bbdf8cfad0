use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::crypt;
use crate::error::{Error, ErrorKind, Result};
use crate::tpm::{SHA1_DIGEST_SIZE, Sha1Digest};

/// A 20-byte authorization secret.
///
/// Kept in a [`SecretBox`] so the bytes are wiped when the value is dropped.
/// `Debug` never prints the contents.
pub struct Secret {
    bytes: SecretBox<Sha1Digest>,
}

impl Secret {
    pub fn from_bytes(bytes: Sha1Digest) -> Self {
        Self {
            bytes: SecretBox::new(Box::new(bytes)),
        }
    }

    /// The all-zero secret TPM objects without authorization data are
    /// created with.
    pub fn well_known() -> Self {
        Self::from_bytes([0u8; SHA1_DIGEST_SIZE])
    }

    pub fn expose(&self) -> &Sha1Digest {
        self.bytes.expose_secret()
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Self::from_bytes(*self.expose())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

/// Where a policy's secret comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretMode {
    /// No secret: the well-known value is used.
    None,
    /// Caller-supplied bytes, hashed once when set.
    Plain,
    /// Caller-supplied digest, used verbatim.
    PreHashed,
    /// Asked for interactively the first time it is needed.
    Popup,
    /// Never resolved here: the application's callbacks sign on its behalf.
    Callback,
}

impl Default for SecretMode {
    fn default() -> Self {
        if cfg!(feature = "popup-default") {
            SecretMode::Popup
        } else {
            SecretMode::None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PopupEncoding {
    /// Little-endian UTF-16, as TSS dialogs have always hashed passphrases.
    #[default]
    Utf16Le,
    Utf8,
}

/// How an interactively entered passphrase is turned into bytes before hashing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupHashMode {
    pub encoding: PopupEncoding,
    /// Hash the terminating NUL character too.
    pub include_nul: bool,
}

impl PopupHashMode {
    fn encode(&self, passphrase: &str) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(passphrase.len() * 2 + 2));
        match self.encoding {
            PopupEncoding::Utf16Le => {
                for unit in passphrase.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                if self.include_nul {
                    out.extend_from_slice(&[0, 0]);
                }
            }
            PopupEncoding::Utf8 => {
                out.extend_from_slice(passphrase.as_bytes());
                if self.include_nul {
                    out.push(0);
                }
            }
        }
        out
    }
}

/// The interactive collaborator Popup-mode policies ask for a passphrase.
pub trait SecretPrompt: Send + Sync {
    fn prompt(&self, prompt_text: &str) -> Result<SecretString>;
}

/// What a policy's secret resolved to.
#[derive(Debug, Clone)]
pub enum Resolved {
    Secret(Secret),
    /// Signing is delegated to the application's callbacks.
    Callback,
}

/// The secret half of a policy object: its mode and, once known, its value.
#[derive(Debug, Clone)]
pub struct SecretState {
    mode: SecretMode,
    secret: Option<Secret>,
    prompt_text: String,
    popup_hash: PopupHashMode,
}

impl Default for SecretState {
    fn default() -> Self {
        Self::new(SecretMode::default())
    }
}

impl SecretState {
    pub fn new(mode: SecretMode) -> Self {
        Self {
            mode,
            secret: None,
            prompt_text: String::new(),
            popup_hash: PopupHashMode::default(),
        }
    }

    pub fn mode(&self) -> SecretMode {
        self.mode
    }

    /// Whether a concrete secret value is held.
    pub fn is_set(&self) -> bool {
        self.secret.is_some()
    }

    pub fn prompt_text(&self) -> &str {
        &self.prompt_text
    }

    pub fn set_prompt_text(&mut self, text: impl Into<String>) {
        self.prompt_text = text.into();
    }

    pub fn set_popup_hash_mode(&mut self, mode: PopupHashMode) {
        self.popup_hash = mode;
    }

    /// Switches to `mode`, taking `bytes` as the secret where the mode uses
    /// caller-supplied data. Plain bytes are hashed here, once.
    pub fn set(&mut self, mode: SecretMode, bytes: &[u8]) -> Result<()> {
        let secret = match mode {
            SecretMode::Plain => Some(Secret::from_bytes(crypt::sha1(bytes))),
            SecretMode::PreHashed => {
                let digest: Sha1Digest = bytes.try_into().map_err(|_| {
                    Error::bad_parameter(format!(
                        "pre-hashed secret must be {SHA1_DIGEST_SIZE} bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Some(Secret::from_bytes(digest))
            }
            SecretMode::None | SecretMode::Popup | SecretMode::Callback => None,
        };
        debug!(?mode, "policy secret set");
        self.mode = mode;
        self.secret = secret;
        Ok(())
    }

    /// Forgets the held value. A Popup secret will be asked for again.
    pub fn flush(&mut self) {
        trace!(mode = ?self.mode, "flushing policy secret");
        self.secret = None;
    }

    /// Produces the secret to sign with.
    ///
    /// Only a successful interactive prompt changes the state: its result is
    /// cached until the next [`flush`](Self::flush).
    pub fn resolve(
        &mut self,
        prompt: Option<&dyn SecretPrompt>,
        allow_interactive: bool,
    ) -> Result<Resolved> {
        match self.mode {
            SecretMode::None => Ok(Resolved::Secret(Secret::well_known())),
            SecretMode::Callback => Ok(Resolved::Callback),
            SecretMode::Plain | SecretMode::PreHashed => self
                .secret
                .clone()
                .map(Resolved::Secret)
                .ok_or_else(|| Error::tsp(ErrorKind::AuthRequired)),
            SecretMode::Popup => {
                if let Some(secret) = &self.secret {
                    return Ok(Resolved::Secret(secret.clone()));
                }
                let prompt = match prompt {
                    Some(p) if allow_interactive => p,
                    _ => {
                        debug!("popup secret not set and prompting is unavailable");
                        return Err(Error::tsp(ErrorKind::AuthRequired));
                    }
                };
                let passphrase = prompt.prompt(&self.prompt_text)?;
                let encoded = self.popup_hash.encode(passphrase.expose_secret());
                let secret = Secret::from_bytes(crypt::sha1(&encoded));
                debug!("popup secret obtained");
                self.secret = Some(secret.clone());
                Ok(Resolved::Secret(secret))
            }
        }
    }
}
