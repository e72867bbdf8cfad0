use core::fmt;
use rand_core::{TryCryptoRng, TryRngCore};

/// Largest request a TPM 1.2 `GetRandom` is expected to satisfy in one go.
pub const MAX_TPM_RANDOM_BUF: usize = 48;

/// Something that can hand out TPM-generated random bytes.
pub trait RandomSource {
    type Error: fmt::Debug + fmt::Display;

    /// Returns up to `len` random bytes. A TPM may return fewer than asked.
    fn get_random(&self, len: usize) -> Result<Vec<u8>, Self::Error>;
}

impl<S: RandomSource + ?Sized> RandomSource for &S {
    type Error = S::Error;

    fn get_random(&self, len: usize) -> Result<Vec<u8>, Self::Error> {
        (**self).get_random(len)
    }
}

#[derive(Debug)]
pub enum RandError<E> {
    /// The underlying source failed.
    Source(E),
    /// The source returned no bytes, so filling would never finish.
    Exhausted,
}

impl<E: fmt::Display> fmt::Display for RandError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RandError::Source(e) => write!(f, "TPM random source failed: {e}"),
            RandError::Exhausted => f.write_str("TPM random source returned no data"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RandError<E> {}

pub struct TpmRand<S> {
    source: S,
}

impl<S: RandomSource> TpmRand<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

impl<S: RandomSource> TryRngCore for TpmRand<S> {
    type Error = RandError<S::Error>;

    fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
        let mut buf = [0u8; 4];
        self.try_fill_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
        let mut buf = [0u8; 8];
        self.try_fill_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Self::Error> {
        let mut offset = 0;
        while offset < dest.len() {
            let chunk_size = core::cmp::min(MAX_TPM_RANDOM_BUF, dest.len() - offset);
            let bytes = self
                .source
                .get_random(chunk_size)
                .map_err(RandError::Source)?;
            if bytes.is_empty() {
                return Err(RandError::Exhausted);
            }
            // Short reads are fine, the loop asks again for the remainder.
            let taken = core::cmp::min(bytes.len(), chunk_size);
            dest[offset..offset + taken].copy_from_slice(&bytes[..taken]);
            offset += taken;
        }
        Ok(())
    }
}

impl<S: RandomSource> TryCryptoRng for TpmRand<S> {}
