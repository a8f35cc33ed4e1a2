use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Result;
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;

type HmacSha256 = hmac::Hmac<Sha256>;

/// Encrypts provider credentials at rest. Values are stored as
/// base64(nonce || ciphertext); the key must be shared by every worker
/// process that claims jobs.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

/// Derive a 256-bit key from the service secret with HMAC-SHA256 so the
/// raw secret never acts as key material directly.
fn derive_key(secret: &str) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"volley-vault-v1")
        .expect("HMAC can take key of any size");
    mac.update(secret.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    key
}

impl CredentialCipher {
    pub fn new(secret: &str) -> Self {
        let key = derive_key(secret);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key is valid for AES-256");
        Self { cipher }
    }

    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("VOLLEY_VAULT_SECRET")
            .map_err(|_| anyhow::anyhow!("VOLLEY_VAULT_SECRET not set"))?;
        Ok(Self::new(&secret))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("base64 decode failed: {e}"))?;

        if combined.len() < 13 {
            anyhow::bail!("encrypted value too short");
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;

        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("utf-8 decode failed: {e}"))
    }
}
