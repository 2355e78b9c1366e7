//! AES-256-GCM encryption for credentials at rest

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use std::path::Path;

use super::env::Environment;
use crate::error::Error;
use crate::Result;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Environment variable carrying a base64-encoded 32-byte master key
pub const MASTER_KEY_ENV: &str = "MAESTRO_ENCRYPTION_KEY";

/// Encrypts credential payloads; output is `nonce || ciphertext`.
#[derive(Clone)]
pub struct SecretEncryptor {
    cipher: Aes256Gcm,
}

impl SecretEncryptor {
    pub fn new(master_key: &[u8]) -> Result<Self> {
        if master_key.len() != KEY_SIZE {
            return Err(Error::Encryption(format!(
                "Master key must be {KEY_SIZE} bytes, got {}",
                master_key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(master_key)
            .map_err(|err| Error::Encryption(format!("Invalid master key length: {err:?}")))?;

        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|err| Error::Encryption(format!("Failed to encrypt payload: {err:?}")))?;
        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.append(&mut ciphertext);
        Ok(output)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(Error::Encryption("Ciphertext is too short".to_string()));
        }

        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, payload)
            .map_err(|err| Error::Encryption(format!("Failed to decrypt payload: {err:?}")))
    }
}

/// Load the master key from [`MASTER_KEY_ENV`], or from `key_path`,
/// generating and saving a fresh key (mode 0600) on first use.
pub async fn load_or_create_master_key(
    env: &dyn Environment,
    key_path: &Path,
) -> Result<Vec<u8>> {
    if let Some(encoded) = env.var(MASTER_KEY_ENV) {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Encryption(format!("{MASTER_KEY_ENV} is not base64: {e}")))?;
        return Ok(key);
    }

    match tokio::fs::read_to_string(key_path).await {
        Ok(encoded) => {
            return STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::Encryption(format!("Corrupt key file {key_path:?}: {e}")));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut key = vec![0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);

    if let Some(parent) = key_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    super::cache::write_private_file(key_path, STANDARD.encode(&key).as_bytes()).await?;
    tracing::info!("Generated new credential encryption key at {:?}", key_path);

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::env::FakeEnv;

    fn test_key() -> [u8; 32] {
        [0xAB; 32]
    }

    #[test]
    fn roundtrip() {
        let encryptor = SecretEncryptor::new(&test_key()).unwrap();
        let ciphertext = encryptor.encrypt(b"{\"api_key\":\"sk-test\"}").unwrap();
        assert_eq!(
            encryptor.decrypt(&ciphertext).unwrap(),
            b"{\"api_key\":\"sk-test\"}"
        );
    }

    #[test]
    fn wrong_key_size() {
        let err = SecretEncryptor::new(&[0u8; 31]).err().unwrap();
        assert!(err.to_string().contains("32"));
    }

    #[test]
    fn tampered_ciphertext() {
        let encryptor = SecretEncryptor::new(&test_key()).unwrap();
        let mut ciphertext = encryptor.encrypt(b"sensitive data").unwrap();
        ciphertext[NONCE_SIZE + 1] ^= 0xFF;
        assert!(encryptor.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn different_key_decrypt() {
        let a = SecretEncryptor::new(&[0x11; 32]).unwrap();
        let b = SecretEncryptor::new(&[0x22; 32]).unwrap();
        let ciphertext = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn nonce_uniqueness() {
        let encryptor = SecretEncryptor::new(&test_key()).unwrap();
        let ct1 = encryptor.encrypt(b"same input").unwrap();
        let ct2 = encryptor.encrypt(b"same input").unwrap();
        assert_ne!(ct1, ct2);
    }

    #[tokio::test]
    async fn master_key_from_env() {
        let encoded = STANDARD.encode([7u8; 32]);
        let env = FakeEnv::new().with_var(MASTER_KEY_ENV, &encoded);
        let dir = tempfile::tempdir().unwrap();
        let key = load_or_create_master_key(&env, &dir.path().join("master.key"))
            .await
            .unwrap();
        assert_eq!(key, vec![7u8; 32]);
    }

    #[tokio::test]
    async fn master_key_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let env = FakeEnv::new();

        let first = load_or_create_master_key(&env, &path).await.unwrap();
        let second = load_or_create_master_key(&env, &path).await.unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
