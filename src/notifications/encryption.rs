use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

const NONCE_SIZE: usize = 12; // AES-GCM standard nonce size

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid hex key: {0}")]
    InvalidKeyHex(String),
    #[error("Encryption key must be 32 bytes (256 bits) long")]
    InvalidKeyLength,
    #[error("Invalid hex ciphertext: {0}")]
    InvalidCiphertextHex(String),
    #[error("Ciphertext is too short to contain a nonce")]
    CiphertextTooShort,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid UTF-8 sequence: {0}")]
    InvalidUtf8(String),
}

/// Seals alert channel configurations (webhook URLs, tokens) at rest.
///
/// Output is hex of `nonce || ciphertext`.
#[derive(Clone)]
pub struct ChannelCipher {
    cipher: Aes256Gcm,
}

impl ChannelCipher {
    pub fn from_hex_key(key_hex: &str) -> Result<Self, CipherError> {
        let key_bytes = hex::decode(key_hex).map_err(|e| CipherError::InvalidKeyHex(e.to_string()))?;
        if key_bytes.len() != 32 {
            return Err(CipherError::InvalidKeyLength);
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CipherError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plain_text: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain_text.as_bytes())
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decrypt(&self, cipher_hex: &str) -> Result<String, CipherError> {
        let encrypted = hex::decode(cipher_hex)
            .map_err(|e| CipherError::InvalidCiphertextHex(e.to_string()))?;
        if encrypted.len() < NONCE_SIZE {
            return Err(CipherError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plain = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::DecryptionFailed)?;

        String::from_utf8(plain).map_err(|e| CipherError::InvalidUtf8(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_encrypt_decrypt_success() {
        let cipher = ChannelCipher::from_hex_key(KEY).unwrap();
        let plain_text = r#"[{"type":"slack","webhookUrl":"https://hooks.slack.com/x"}]"#;

        let encrypted = cipher.encrypt(plain_text).unwrap();
        assert_ne!(plain_text, encrypted);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plain_text);
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let cipher1 = ChannelCipher::from_hex_key(KEY).unwrap();
        let cipher2 = ChannelCipher::from_hex_key(
            "f1e1d1c1b1a191817161514131211101f0e0d0c0b0a090807060504030201000",
        )
        .unwrap();

        let encrypted = cipher1.encrypt("another secret").unwrap();
        assert_eq!(cipher2.decrypt(&encrypted), Err(CipherError::DecryptionFailed));
    }

    #[test]
    fn test_invalid_key() {
        assert_eq!(
            ChannelCipher::from_hex_key("1234").err(),
            Some(CipherError::InvalidKeyLength)
        );
        assert!(matches!(
            ChannelCipher::from_hex_key("not-a-hex-string"),
            Err(CipherError::InvalidKeyHex(_))
        ));
    }

    #[test]
    fn test_invalid_ciphertext() {
        let cipher = ChannelCipher::from_hex_key(KEY).unwrap();
        assert!(matches!(
            cipher.decrypt("not-a-hex-cipher"),
            Err(CipherError::InvalidCiphertextHex(_))
        ));
        assert_eq!(cipher.decrypt("abcd"), Err(CipherError::CiphertextTooShort));
    }
}
