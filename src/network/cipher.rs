use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::{Error, ErrorKind};

const NONCE_LEN: usize = 12;

/// Symmetric frame encryption keyed by the cluster password.
///
/// Sealed frames are `nonce || ciphertext`, with a fresh random nonce each.
#[derive(Clone)]
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
}

impl FrameCipher {
    pub fn new(password: &str) -> Self {
        let key = Sha256::digest(password.as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "frame encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> std::io::Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "encrypted frame too short"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "frame authentication failed"))
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameCipher")
    }
}
