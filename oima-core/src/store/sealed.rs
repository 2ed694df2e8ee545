//! Encrypted-at-rest secret buffers.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, Zeroizing};

use super::StoreError;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// A secret held only as ciphertext in process memory.
///
/// The plaintext is reachable through [`with_opened`](SealedSecret::with_opened)
/// alone, which decrypts into a buffer that is wiped before the call returns,
/// including when the closure panics. Openings are serialized, so at most one
/// caller holds the plaintext of a given secret at any time.
pub struct SealedSecret {
    ciphertext: Vec<u8>,
    nonce: [u8; NONCE_SIZE],
    key: Zeroizing<[u8; KEY_SIZE]>,
    len: usize,
    open_lock: Mutex<()>,
}

impl SealedSecret {
    /// Seal `data` and wipe it in place.
    ///
    /// Every byte of `data` is zero once this returns, whether sealing
    /// succeeded or not.
    pub fn seal(data: &mut [u8]) -> Result<Self, StoreError> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let sealed = cipher.encrypt(Nonce::from_slice(&nonce), &*data);
        let len = data.len();
        data.zeroize();

        let ciphertext = sealed.map_err(|e| StoreError::Sealing {
            message: e.to_string(),
        })?;

        Ok(Self {
            ciphertext,
            nonce,
            key,
            len,
            open_lock: Mutex::new(()),
        })
    }

    /// Seal an owned buffer, wiping it afterwards.
    pub fn seal_vec(mut data: Vec<u8>) -> Result<Self, StoreError> {
        let sealed = Self::seal(&mut data);
        data.zeroize();
        sealed
    }

    /// Decrypt into a short-lived buffer and hand it to `f`.
    pub fn with_opened<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, StoreError> {
        let _guard = self.open_lock.lock();

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|e| StoreError::Opening {
                message: e.to_string(),
            })?;

        Ok(f(&plaintext))
    }

    /// Like [`with_opened`](Self::with_opened) for secrets that are text.
    pub fn with_opened_str<R>(&self, f: impl FnOnce(&str) -> R) -> Result<R, StoreError> {
        self.with_opened(|bytes| std::str::from_utf8(bytes).map(f))?
            .map_err(|e| StoreError::Opening {
                message: format!("secret is not valid UTF-8: {}", e),
            })
    }

    /// Length of the plaintext in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealedSecret([REDACTED], {} bytes)", self.len)
    }
}

impl Drop for SealedSecret {
    fn drop(&mut self) {
        self.ciphertext.zeroize();
        self.nonce.zeroize();
    }
}
