use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub(crate) const NONCE_LEN: usize = 12;

/// Value encryption under a user supplied key string.
pub(crate) struct Crypter {
    key: Zeroizing<String>,
    cipher: ChaCha20Poly1305,
}

impl Crypter {
    /// An empty key means no encryption.
    pub(crate) fn new(key: &str) -> Option<Self> {
        if key.is_empty() {
            return None;
        }

        let mut digest = Zeroizing::new([0u8; 32]);
        digest.copy_from_slice(&Sha256::digest(key.as_bytes()));
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&digest[..]));
        Some(Crypter {
            key: Zeroizing::new(key.to_owned()),
            cipher,
        })
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Encrypt into `nonce | ciphertext`.
    pub(crate) fn seal(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self.cipher.encrypt(Nonce::from_slice(&nonce), plain).ok()?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Some(out)
    }

    /// `None` if the value was not sealed under this key.
    pub(crate) fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return None;
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
    }
}

/// Turn a stored value into plain bytes under the optional key.
pub(crate) fn reveal(crypter: Option<&Crypter>, stored: &[u8]) -> Option<Vec<u8>> {
    match crypter {
        None => Some(stored.to_vec()),
        Some(crypter) => crypter.open(stored),
    }
}

/// Turn plain bytes into the stored form under the optional key.
pub(crate) fn conceal(crypter: Option<&Crypter>, plain: &[u8]) -> Option<Vec<u8>> {
    match crypter {
        None => Some(plain.to_vec()),
        Some(crypter) => crypter.seal(plain),
    }
}
