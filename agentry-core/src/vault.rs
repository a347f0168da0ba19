//! Credential vault — AES-256-GCM encryption of per-tenant third-party
//! secrets.
//!
//! Ciphertext format is `enc:<iv_b64>:<tag_b64>:<ct_b64>` with a fresh
//! 12-byte IV per encryption. When no key is configured the vault degrades to
//! `plain:<text>` storage and logs a one-time warning. List operations return
//! metadata only, never plaintext.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, Result, VaultError};
use crate::store::Store;

/// AES-GCM appends the 16-byte tag to the ciphertext; the tagged format
/// stores it as its own segment.
const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;

static PLAINTEXT_WARNING: Once = Once::new();

/// Encrypts and decrypts credential blobs.
#[derive(Clone)]
pub struct Vault {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("keyed", &self.cipher.is_some())
            .finish()
    }
}

impl Vault {
    /// Create a vault from an optional 32-byte key.
    pub fn new(key: Option<[u8; 32]>) -> Self {
        let cipher =
            key.map(|k| Aes256Gcm::new_from_slice(&k).expect("32-byte key is always valid"));
        Self { cipher }
    }

    /// Whether a key is configured.
    pub fn is_keyed(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt `plaintext` into the tagged format, or `plain:<text>` when no
    /// key is configured (one-time warning).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let Some(cipher) = &self.cipher else {
            PLAINTEXT_WARNING.call_once(|| {
                warn!("No encryption key configured; credentials are stored in plaintext");
            });
            return Ok(format!("plain:{plaintext}"));
        };

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut ct_and_tag = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: b"",
                },
            )
            .map_err(|e| EngineError::Vault(VaultError::EncryptFailed(e.to_string())))?;

        let tag = ct_and_tag.split_off(ct_and_tag.len() - TAG_LEN);
        Ok(format!(
            "enc:{}:{}:{}",
            B64.encode(iv),
            B64.encode(&tag),
            B64.encode(&ct_and_tag)
        ))
    }

    /// Decrypt a blob produced by [`Vault::encrypt`].
    pub fn decrypt(&self, blob: &str) -> Result<String> {
        if let Some(plain) = blob.strip_prefix("plain:") {
            return Ok(plain.to_string());
        }

        let rest = blob
            .strip_prefix("enc:")
            .ok_or(EngineError::Vault(VaultError::InvalidFormat))?;
        let mut parts = rest.splitn(3, ':');
        let (iv_b64, tag_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => return Err(EngineError::Vault(VaultError::InvalidFormat)),
        };

        let iv = B64
            .decode(iv_b64)
            .map_err(|_| EngineError::Vault(VaultError::InvalidFormat))?;
        let tag = B64
            .decode(tag_b64)
            .map_err(|_| EngineError::Vault(VaultError::InvalidFormat))?;
        let ct = B64
            .decode(ct_b64)
            .map_err(|_| EngineError::Vault(VaultError::InvalidFormat))?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(EngineError::Vault(VaultError::InvalidFormat));
        }

        let cipher = self
            .cipher
            .as_ref()
            .ok_or(EngineError::Vault(VaultError::DecryptFailed))?;

        let mut ct_and_tag = ct;
        ct_and_tag.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ct_and_tag.as_slice())
            .map_err(|_| EngineError::Vault(VaultError::DecryptFailed))?;

        String::from_utf8(plaintext).map_err(|_| EngineError::Vault(VaultError::DecryptFailed))
    }
}

/// Metadata for a stored credential. Values never leave the vault through
/// listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub service_id: String,
    pub cred_type: String,
    pub configured: bool,
    pub updated_at: DateTime<Utc>,
}

/// Tenant-scoped credential storage on top of the vault.
pub struct CredentialStore<'a> {
    store: &'a Store,
    vault: &'a Vault,
}

impl<'a> CredentialStore<'a> {
    pub fn new(store: &'a Store, vault: &'a Vault) -> Self {
        Self { store, vault }
    }

    /// Store (or replace) a credential for `(team, service)`.
    pub fn put(
        &self,
        team_id: &Uuid,
        service_id: &str,
        cred_type: &str,
        secret: &str,
    ) -> Result<()> {
        let blob = self.vault.encrypt(secret)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credentials (team_id, service_id, cred_type, blob)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (team_id, service_id)
                 DO UPDATE SET blob = excluded.blob,
                               cred_type = excluded.cred_type,
                               updated_at = datetime('now')",
                rusqlite::params![team_id.to_string(), service_id, cred_type, blob],
            )?;
            Ok(())
        })
    }

    /// Fetch and decrypt a credential. `NotFound` when absent.
    pub fn get(&self, team_id: &Uuid, service_id: &str) -> Result<String> {
        let blob: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT blob FROM credentials WHERE team_id = ?1 AND service_id = ?2",
                rusqlite::params![team_id.to_string(), service_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        let blob = blob.ok_or_else(|| EngineError::not_found("credential"))?;
        self.vault.decrypt(&blob)
    }

    /// Delete a credential. `NotFound` when absent.
    pub fn delete(&self, team_id: &Uuid, service_id: &str) -> Result<()> {
        let deleted = self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM credentials WHERE team_id = ?1 AND service_id = ?2",
                rusqlite::params![team_id.to_string(), service_id],
            )
        })?;
        if deleted == 0 {
            return Err(EngineError::not_found("credential"));
        }
        Ok(())
    }

    /// List credential metadata for a team. No plaintext values.
    pub fn list(&self, team_id: &Uuid) -> Result<Vec<CredentialInfo>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT service_id, cred_type, updated_at FROM credentials
                 WHERE team_id = ?1 ORDER BY service_id",
            )?;
            let rows = stmt.query_map([team_id.to_string()], |row| {
                let updated: String = row.get(2)?;
                Ok(CredentialInfo {
                    service_id: row.get(0)?,
                    cred_type: row.get(1)?,
                    configured: true,
                    updated_at: parse_store_time(&updated),
                })
            })?;
            rows.collect()
        })
    }
}

/// Parse the store's `datetime('now')` text format, defaulting to the epoch on
/// malformed rows rather than failing a listing.
pub(crate) fn parse_store_time(s: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    fn keyed_vault() -> Vault {
        Vault::new(Some(test_key()))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vault = keyed_vault();
        let blob = vault.encrypt("sk-secret-token").unwrap();
        assert!(blob.starts_with("enc:"));
        assert_eq!(vault.decrypt(&blob).unwrap(), "sk-secret-token");
    }

    #[test]
    fn test_blob_has_three_segments() {
        let vault = keyed_vault();
        let blob = vault.encrypt("x").unwrap();
        let parts: Vec<&str> = blob.splitn(4, ':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "enc");
        assert_eq!(B64.decode(parts[1]).unwrap().len(), IV_LEN);
        assert_eq!(B64.decode(parts[2]).unwrap().len(), TAG_LEN);
    }

    #[test]
    fn test_unkeyed_vault_falls_back_to_plain() {
        let vault = Vault::new(None);
        let blob = vault.encrypt("visible").unwrap();
        assert_eq!(blob, "plain:visible");
        assert_eq!(vault.decrypt(&blob).unwrap(), "visible");
    }

    #[test]
    fn test_keyed_vault_reads_plain_blobs() {
        // Data written before a key was configured must stay readable.
        let vault = keyed_vault();
        assert_eq!(vault.decrypt("plain:legacy").unwrap(), "legacy");
    }

    #[test]
    fn test_decrypt_rejects_bad_format() {
        let vault = keyed_vault();
        for blob in ["enc:only-two:parts", "garbage", "enc:", "enc:a:b:!!!"] {
            assert!(vault.decrypt(blob).is_err(), "accepted {blob:?}");
        }
    }

    #[test]
    fn test_tamper_detection() {
        let vault = keyed_vault();
        let blob = vault.encrypt("important").unwrap();
        let parts: Vec<String> = blob.splitn(4, ':').map(String::from).collect();

        // Flip one byte in each of iv, tag, and ciphertext.
        for segment in 1..=3 {
            let mut bytes = B64.decode(&parts[segment]).unwrap();
            bytes[0] ^= 0xFF;
            let mut tampered = parts.clone();
            tampered[segment] = B64.encode(&bytes);
            let rejoined = tampered.join(":");
            assert!(
                vault.decrypt(&rejoined).is_err(),
                "tampered segment {segment} accepted"
            );
        }
    }

    #[test]
    fn test_fresh_iv_each_time() {
        let vault = keyed_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unicode_roundtrip() {
        let vault = keyed_vault();
        let secret = "pässwörd-🔑-秘密";
        let blob = vault.encrypt(secret).unwrap();
        assert_eq!(vault.decrypt(&blob).unwrap(), secret);
    }

    #[test]
    fn test_credential_store_put_get_list() {
        let store = Store::open_in_memory().unwrap();
        let vault = keyed_vault();
        let creds = CredentialStore::new(&store, &vault);
        let team = Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't')", [
                    team.to_string()
                ])
            })
            .unwrap();

        creds.put(&team, "slack", "api_key", "xoxb-1").unwrap();
        creds.put(&team, "slack", "api_key", "xoxb-2").unwrap(); // upsert
        assert_eq!(creds.get(&team, "slack").unwrap(), "xoxb-2");

        let listed = creds.list(&team).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].service_id, "slack");
        // Listing must not include the secret anywhere.
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("xoxb"));
    }

    #[test]
    fn test_credential_store_tenant_isolation() {
        let store = Store::open_in_memory().unwrap();
        let vault = keyed_vault();
        let creds = CredentialStore::new(&store, &vault);
        let team_a = Uuid::new_v4();
        let team_b = Uuid::new_v4();
        for team in [&team_a, &team_b] {
            store
                .with_conn(|conn| {
                    conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't')", [
                        team.to_string()
                    ])
                })
                .unwrap();
        }

        creds.put(&team_a, "github", "api_key", "ghp_abc").unwrap();
        let err = creds.get(&team_b, "github").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_delete_missing_credential() {
        let store = Store::open_in_memory().unwrap();
        let vault = keyed_vault();
        let creds = CredentialStore::new(&store, &vault);
        let team = Uuid::new_v4();
        assert!(creds.delete(&team, "nope").is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_roundtrip_any_utf8(secret in "\\PC{0,256}") {
            let vault = keyed_vault();
            let blob = vault.encrypt(&secret).unwrap();
            proptest::prop_assert_eq!(vault.decrypt(&blob).unwrap(), secret);
        }

        #[test]
        fn prop_tampering_any_byte_fails(secret in "\\PC{1,64}", flip in 0usize..1024) {
            let vault = keyed_vault();
            let blob = vault.encrypt(&secret).unwrap();
            let parts: Vec<String> = blob.splitn(4, ':').map(String::from).collect();

            // Pick a byte across iv/tag/ct by the fuzzed index.
            let segment = 1 + (flip % 3);
            let mut bytes = B64.decode(&parts[segment]).unwrap();
            let index = flip % bytes.len().max(1);
            bytes[index] ^= 0x01;

            let mut tampered = parts;
            tampered[segment] = B64.encode(&bytes);
            proptest::prop_assert!(vault.decrypt(&tampered.join(":")).is_err());
        }
    }
}
