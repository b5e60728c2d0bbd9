//! Device key issuance and verification
//!
//! Pairing mints a random device key per daemon. Keys are persisted as a
//! TOML file so a restart does not orphan paired daemons; only a short
//! fingerprint ever reaches the logs.

use std::path::PathBuf;

use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tether_core::config;
use tether_core::time::current_time_millis;
use tether_core::{ConfigError, DeviceKey};

/// One issued key as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeyRecord {
    /// The key material itself
    pub key: String,
    /// User the key was minted for
    #[serde(default)]
    pub user_id: String,
    /// Mint time, milliseconds since epoch
    pub issued_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default)]
    keys: Vec<DeviceKeyRecord>,
}

/// Issued device keys, persisted across restarts
pub struct DeviceKeyStore {
    path: PathBuf,
    keys: DashMap<String, DeviceKeyRecord>,
}

impl DeviceKeyStore {
    /// Load the store from disk; a missing file means no keys yet
    pub fn load(path: PathBuf) -> Self {
        let keys = DashMap::new();
        match config::load_config::<KeyFile>(&path) {
            Ok(file) => {
                for record in file.keys {
                    keys.insert(record.key.clone(), record);
                }
            }
            Err(ConfigError::NotFound(_)) => {}
            Err(e) => tracing::warn!("Failed to load device keys from {:?}: {}", path, e),
        }
        if !keys.is_empty() {
            tracing::info!("Loaded {} device keys", keys.len());
        }
        Self { path, keys }
    }

    /// Mint and persist a fresh key bound to a user
    pub fn mint(&self, user_id: &str) -> Result<DeviceKey, ConfigError> {
        let mut material = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut material);
        let key = format!("dk_{}", hex_string(&material));

        self.keys.insert(
            key.clone(),
            DeviceKeyRecord {
                key: key.clone(),
                user_id: user_id.to_string(),
                issued_at: current_time_millis(),
            },
        );
        self.persist()?;

        tracing::info!("Minted device key {} for {}", fingerprint(&key), user_id);
        Ok(DeviceKey(key))
    }

    /// Whether this token is an issued device key
    pub fn verify(&self, token: &str) -> bool {
        self.keys.contains_key(token)
    }

    /// User a key was minted for, if the key is known
    pub fn owner(&self, token: &str) -> Option<String> {
        self.keys.get(token).map(|record| record.user_id.clone())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn persist(&self) -> Result<(), ConfigError> {
        let file = KeyFile {
            keys: self.keys.iter().map(|e| e.value().clone()).collect(),
        };
        config::save_config(&self.path, &file)
    }
}

/// Short log-safe identifier for a key
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("sha256:{}", &hex_string(&digest)[..12])
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceKeyStore::load(dir.path().join("keys.toml"));

        let key = store.mint("u1").unwrap();
        assert!(store.verify(key.as_str()));
        assert!(!store.verify("dk_forged"));
    }

    #[test]
    fn test_key_is_bound_to_its_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceKeyStore::load(dir.path().join("keys.toml"));

        let key = store.mint("u1").unwrap();
        assert_eq!(store.owner(key.as_str()).as_deref(), Some("u1"));
        assert_eq!(store.owner("dk_forged"), None);
    }

    #[test]
    fn test_keys_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.toml");

        let key = {
            let store = DeviceKeyStore::load(path.clone());
            store.mint("u1").unwrap()
        };

        let reloaded = DeviceKeyStore::load(path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.verify(key.as_str()));
        assert_eq!(reloaded.owner(key.as_str()).as_deref(), Some("u1"));
    }

    #[test]
    fn test_minted_keys_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceKeyStore::load(dir.path().join("keys.toml"));
        let a = store.mint("u1").unwrap();
        let b = store.mint("u1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_hides_key_material() {
        let fp = fingerprint("dk_secret_material");
        assert!(fp.starts_with("sha256:"));
        assert!(!fp.contains("secret"));
    }
}
