use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{SecretBackendKind, SecretsConfig};

/// Pluggable credential store. Secret fields never live in plain entity
/// records: the object store diverts them here under
/// `<kind>/<name>/<field>` paths.
pub trait CredentialBackend: Send + Sync {
    fn write(&self, path: &str, value: &str) -> Result<()>;
    fn read(&self, path: &str) -> Result<Option<String>>;
    fn delete(&self, path: &str) -> Result<()>;
}

/// Opaque handle to a stored secret. Holds the backend path only; the
/// plaintext is materialized for the duration of one `resolve` call.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretField {
    path: String,
}

impl SecretField {
    pub fn new(kind: &str, name: &str, field: &str) -> Self {
        Self {
            path: format!("{kind}/{name}/{field}"),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn resolve(&self, backend: &dyn CredentialBackend) -> Result<Option<String>> {
        backend.read(&self.path)
    }

    pub fn store(&self, backend: &dyn CredentialBackend, value: &str) -> Result<()> {
        backend.write(&self.path, value)
    }
}

impl std::fmt::Debug for SecretField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretField({} -> ****)", self.path)
    }
}

/// Simple encryption/decryption using XOR cipher
/// NOTE: This is for demonstration. Production should use proper encryption (AES-GCM, etc.)
pub struct SecretCipher {
    key: Vec<u8>,
}

impl SecretCipher {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let plaintext_bytes = plaintext.as_bytes();
        let mut encrypted = Vec::with_capacity(plaintext_bytes.len());

        for (i, byte) in plaintext_bytes.iter().enumerate() {
            let key_byte = self.key[i % self.key.len()];
            encrypted.push(byte ^ key_byte);
        }

        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &encrypted)
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let encrypted_bytes =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encrypted)
                .context("Failed to decode base64")?;

        let mut decrypted = Vec::with_capacity(encrypted_bytes.len());

        for (i, byte) in encrypted_bytes.iter().enumerate() {
            let key_byte = self.key[i % self.key.len()];
            decrypted.push(byte ^ key_byte);
        }

        String::from_utf8(decrypted).context("Failed to decode UTF-8")
    }

    /// Hash a value for verification
    pub fn hash(value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Encrypted-column backend: values are encrypted at write time and held
/// by the process. Vault-backed deployments substitute their own
/// `CredentialBackend` implementation.
pub struct LocalCredentialStore {
    cipher: SecretCipher,
    values: Mutex<HashMap<String, String>>,
}

impl LocalCredentialStore {
    pub fn new(key: &[u8]) -> Self {
        Self {
            cipher: SecretCipher::new(key),
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl CredentialBackend for LocalCredentialStore {
    fn write(&self, path: &str, value: &str) -> Result<()> {
        let encrypted = self.cipher.encrypt(value);
        self.values
            .lock()
            .unwrap()
            .insert(path.to_string(), encrypted);
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<String>> {
        let encrypted = self.values.lock().unwrap().get(path).cloned();
        match encrypted {
            Some(value) => Ok(Some(self.cipher.decrypt(&value)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.values.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Build the backend named by the configuration. The vault variant is an
/// external collaborator; selecting it without wiring one in is an error.
pub fn backend_from_config(config: &SecretsConfig) -> Result<Arc<dyn CredentialBackend>> {
    match config.backend {
        SecretBackendKind::Local => Ok(Arc::new(LocalCredentialStore::new(
            config.encryption_key.as_bytes(),
        ))),
        SecretBackendKind::Vault => anyhow::bail!(
            "vault backend selected but no vault client is wired in; \
             pass a CredentialBackend to the store explicitly"
        ),
    }
}
