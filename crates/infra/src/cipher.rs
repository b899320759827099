//! Session encryption at rest.
//!
//! Worker sessions are stored encrypted and only decrypted in memory right
//! before a transport connect.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
}

pub trait SessionCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Pass-through cipher for development and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl SessionCipher for PlaintextCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.is_empty() {
            return Err(CipherError::Decrypt("empty session".into()));
        }
        Ok(sealed.to_vec())
    }
}
