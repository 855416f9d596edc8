//! Envelope body encryption applied at the transport boundary.

use crate::error::Result;

/// Encrypts and decrypts message bodies, keyed by exchange.
///
/// A failure here propagates as a publish or delivery failure; it is never
/// swallowed.
pub trait MessageEncryptor: Send + Sync {
    /// Encrypt a body for an exchange.
    fn encrypt(&self, exchange_name: &str, body: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a body for an exchange.
    fn decrypt(&self, exchange_name: &str, body: &[u8]) -> Result<Vec<u8>>;
}

/// No-op encryptor used when traffic stays in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncryptor;

impl MessageEncryptor for PassthroughEncryptor {
    fn encrypt(&self, _exchange_name: &str, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body.to_vec())
    }

    fn decrypt(&self, _exchange_name: &str, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_round_trip() {
        let encryptor = PassthroughEncryptor;
        let sealed = encryptor.encrypt("fleet", b"payload").unwrap();
        assert_eq!(encryptor.decrypt("fleet", &sealed).unwrap(), b"payload");
    }
}
