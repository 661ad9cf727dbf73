use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::chain::AuditChain;
use crate::vault::KeyVault;
use crate::{now_s, TrustError};

pub const EVENT_PROVISIONING: &str = "provisioning";
pub const EVENT_RE_PROVISIONED: &str = "re_provisioned";
pub const EVENT_CREDENTIAL_ISSUED: &str = "credential_issued";

/// Immutable once provisioned. Destroyed only by an explicit, audited
/// re-provision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DroneIdentity {
    pub drone_id: Uuid,
    pub org_id: String,
    pub public_key: [u8; 32],
    pub hardware_fingerprint: [u8; 32],
    pub created_at: u64,
}

/// Stored operator record. The raw API key exists only transiently at
/// issuance; only its SHA-256 is persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorCredential {
    pub operator_id: Uuid,
    pub api_key_hash: [u8; 32],
    pub issued_at: u64,
}

/// Result of a successful provisioning run. `raw_api_key` is returned
/// exactly once and never retrievable again.
#[derive(Debug)]
pub struct Provisioned {
    pub identity: DroneIdentity,
    pub credential: OperatorCredential,
    pub raw_api_key: String,
}

pub fn api_key_hash(raw_api_key: &str) -> [u8; 32] {
    Sha256::digest(raw_api_key.as_bytes()).into()
}

// -------------------- Store --------------------

pub struct IdentityStore {
    conn: Connection,
}

impl IdentityStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS identity (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              drone_id TEXT NOT NULL,
              org_id TEXT NOT NULL,
              public_key BLOB NOT NULL,
              hardware_fingerprint BLOB NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS operators (
              operator_id TEXT PRIMARY KEY,
              api_key_hash BLOB NOT NULL,
              issued_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn load_identity(&self) -> Result<Option<DroneIdentity>> {
        let row = self
            .conn
            .query_row(
                "SELECT drone_id, org_id, public_key, hardware_fingerprint, created_at
                 FROM identity WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((drone_id, org_id, public_key, fingerprint, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(DroneIdentity {
            drone_id: Uuid::parse_str(&drone_id)
                .map_err(|_| anyhow!("corrupt identity: invalid drone_id"))?,
            org_id,
            public_key: blob32(public_key, "identity.public_key")?,
            hardware_fingerprint: blob32(fingerprint, "identity.hardware_fingerprint")?,
            created_at: created_at as u64,
        }))
    }

    /// Persists the identity row. Write-once: fails with
    /// `AlreadyProvisioned` if a row exists.
    pub fn save_identity(&self, identity: &DroneIdentity) -> Result<()> {
        if self.load_identity()?.is_some() {
            return Err(TrustError::AlreadyProvisioned.into());
        }
        self.conn
            .execute(
                "INSERT INTO identity (id, drone_id, org_id, public_key, hardware_fingerprint, created_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5)",
                params![
                    identity.drone_id.to_string(),
                    identity.org_id,
                    identity.public_key.to_vec(),
                    identity.hardware_fingerprint.to_vec(),
                    identity.created_at as i64
                ],
            )
            .map_err(|e| TrustError::StorageIo(e.to_string()))?;
        Ok(())
    }

    /// Removes the identity and all operator records. Only the audited
    /// re-provision path calls this.
    pub fn clear_identity(&self) -> Result<()> {
        self.conn.execute("DELETE FROM identity WHERE id = 1", [])?;
        self.conn.execute("DELETE FROM operators", [])?;
        Ok(())
    }

    pub fn insert_operator(&self, credential: &OperatorCredential) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO operators (operator_id, api_key_hash, issued_at) VALUES (?1, ?2, ?3)",
                params![
                    credential.operator_id.to_string(),
                    credential.api_key_hash.to_vec(),
                    credential.issued_at as i64
                ],
            )
            .map_err(|e| TrustError::StorageIo(e.to_string()))?;
        Ok(())
    }

    pub fn operators(&self) -> Result<Vec<OperatorCredential>> {
        let mut stmt = self.conn.prepare(
            "SELECT operator_id, api_key_hash, issued_at FROM operators ORDER BY issued_at ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let operator_id: String = row.get(0)?;
            let hash: Vec<u8> = row.get(1)?;
            let issued_at: i64 = row.get(2)?;
            out.push(OperatorCredential {
                operator_id: Uuid::parse_str(&operator_id)
                    .map_err(|_| anyhow!("corrupt operators: invalid operator_id"))?,
                api_key_hash: blob32(hash, "operators.api_key_hash")?,
                issued_at: issued_at as u64,
            });
        }
        Ok(out)
    }

    pub fn operator_key_hash(&self, operator_id: &Uuid) -> Result<Option<[u8; 32]>> {
        let hash: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT api_key_hash FROM operators WHERE operator_id = ?1",
                params![operator_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        hash.map(|h| blob32(h, "operators.api_key_hash")).transpose()
    }

    /// Constant-time check of a presented raw API key against the stored
    /// hash.
    pub fn verify_operator(&self, operator_id: &Uuid, raw_api_key: &str) -> Result<bool> {
        let Some(stored) = self.operator_key_hash(operator_id)? else {
            return Ok(false);
        };
        let presented = api_key_hash(raw_api_key);
        Ok(presented.ct_eq(&stored).into())
    }
}

fn blob32(bytes: Vec<u8>, context: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!(
            "corrupt {}: expected 32 bytes, got {}",
            context,
            bytes.len()
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// -------------------- Provisioner --------------------

/// One-time identity bootstrap. Generates the sealed keypair, binds it to
/// the hardware fingerprint, mints the first operator credential, and puts
/// the whole act on the audit chain.
pub struct IdentityProvisioner<'a> {
    store: &'a IdentityStore,
    vault: &'a KeyVault,
    chain: &'a AuditChain,
}

impl<'a> IdentityProvisioner<'a> {
    pub fn new(store: &'a IdentityStore, vault: &'a KeyVault, chain: &'a AuditChain) -> Self {
        Self {
            store,
            vault,
            chain,
        }
    }

    pub fn provision(&self, org_id: &str, fingerprint: [u8; 32]) -> Result<Provisioned> {
        self.provision_inner(org_id, fingerprint, false)
    }

    /// Explicit re-provision. The destruction of the previous identity is
    /// appended to the audit chain before any material is replaced.
    pub fn provision_force(&self, org_id: &str, fingerprint: [u8; 32]) -> Result<Provisioned> {
        self.provision_inner(org_id, fingerprint, true)
    }

    fn provision_inner(
        &self,
        org_id: &str,
        fingerprint: [u8; 32],
        force: bool,
    ) -> Result<Provisioned> {
        let existing = self.store.load_identity()?;
        if existing.is_some() || self.vault.is_provisioned() {
            if !force {
                return Err(TrustError::AlreadyProvisioned.into());
            }
            self.chain.append(
                EVENT_RE_PROVISIONED,
                serde_json::json!({
                    "previous_drone_id": existing.as_ref().map(|id| id.drone_id.to_string()),
                    "org_id": org_id,
                }),
            )?;
            self.store.clear_identity()?;
        }

        let public_key = self.vault.generate(&fingerprint, force)?;
        let identity = DroneIdentity {
            drone_id: Uuid::now_v7(),
            org_id: org_id.to_string(),
            public_key,
            hardware_fingerprint: fingerprint,
            created_at: now_s()?,
        };
        self.store.save_identity(&identity)?;

        let (credential, raw_api_key) = mint_credential()?;
        self.store.insert_operator(&credential)?;

        self.chain.append(
            EVENT_PROVISIONING,
            serde_json::json!({
                "drone_id": identity.drone_id.to_string(),
                "org_id": identity.org_id,
                "public_key": hex::encode(identity.public_key),
                "hardware_fingerprint": hex::encode(identity.hardware_fingerprint),
                "operator_id": credential.operator_id.to_string(),
            }),
        )?;
        log::info!(
            "provisioned drone {} for org {}",
            identity.drone_id,
            identity.org_id
        );

        Ok(Provisioned {
            identity,
            credential,
            raw_api_key,
        })
    }

    /// Mints an additional operator credential for an already-provisioned
    /// unit. Separate from provisioning and audited on its own; the only
    /// remedy for a lost API key short of re-provisioning.
    pub fn issue_credential(&self) -> Result<(OperatorCredential, String)> {
        let identity = self
            .store
            .load_identity()?
            .ok_or(TrustError::NotProvisioned)?;
        let (credential, raw_api_key) = mint_credential()?;
        self.store.insert_operator(&credential)?;
        self.chain.append(
            EVENT_CREDENTIAL_ISSUED,
            serde_json::json!({
                "drone_id": identity.drone_id.to_string(),
                "operator_id": credential.operator_id.to_string(),
            }),
        )?;
        Ok((credential, raw_api_key))
    }
}

fn mint_credential() -> Result<(OperatorCredential, String)> {
    let mut key_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key_bytes);
    let raw_api_key = hex::encode(key_bytes);
    let credential = OperatorCredential {
        operator_id: Uuid::now_v7(),
        api_key_hash: api_key_hash(&raw_api_key),
        issued_at: now_s()?,
    };
    Ok((credential, raw_api_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainVerification;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: IdentityStore,
        vault: KeyVault,
        chain: AuditChain,
    }

    fn fixture() -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("drone.db");
        let db_path = db_path.to_str().expect("utf8 path");
        let store = IdentityStore::open(db_path)?;
        let vault = KeyVault::open(dir.path().join("identity"));
        let chain = AuditChain::open(db_path)?;
        Ok(Fixture {
            _dir: dir,
            store,
            vault,
            chain,
        })
    }

    #[test]
    fn provision_creates_identity_credential_and_audit_entry() -> Result<()> {
        let fx = fixture()?;
        let provisioner = IdentityProvisioner::new(&fx.store, &fx.vault, &fx.chain);
        let fingerprint = [3u8; 32];
        let result = provisioner.provision("acme", fingerprint)?;

        assert_eq!(result.identity.org_id, "acme");
        assert_eq!(result.identity.hardware_fingerprint, fingerprint);
        assert_eq!(result.raw_api_key.len(), 64);
        assert_eq!(
            result.credential.api_key_hash,
            api_key_hash(&result.raw_api_key)
        );

        let reloaded = fx.store.load_identity()?.expect("identity row");
        assert_eq!(reloaded.drone_id, result.identity.drone_id);
        assert_eq!(reloaded.public_key, result.identity.public_key);

        let entries = fx.chain.recent(10)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, EVENT_PROVISIONING);
        assert_eq!(
            entries[0].payload()?["drone_id"],
            serde_json::json!(result.identity.drone_id.to_string())
        );
        Ok(())
    }

    #[test]
    fn second_provision_fails_without_force() -> Result<()> {
        let fx = fixture()?;
        let provisioner = IdentityProvisioner::new(&fx.store, &fx.vault, &fx.chain);
        provisioner.provision("acme", [3u8; 32])?;
        let err = provisioner.provision("acme", [3u8; 32]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::AlreadyProvisioned)
        );
        Ok(())
    }

    #[test]
    fn forced_reprovision_is_audited_and_replaces_identity() -> Result<()> {
        let fx = fixture()?;
        let provisioner = IdentityProvisioner::new(&fx.store, &fx.vault, &fx.chain);
        let first = provisioner.provision("acme", [3u8; 32])?;
        let second = provisioner.provision_force("acme", [3u8; 32])?;
        assert_ne!(first.identity.drone_id, second.identity.drone_id);
        assert_ne!(first.identity.public_key, second.identity.public_key);

        let entries = fx.chain.recent(10)?;
        let types: Vec<&str> = entries.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![EVENT_PROVISIONING, EVENT_RE_PROVISIONED, EVENT_PROVISIONING]
        );
        // the old credential is gone with the old identity
        assert_eq!(fx.store.operators()?.len(), 1);
        Ok(())
    }

    #[test]
    fn operator_verification_is_hash_based() -> Result<()> {
        let fx = fixture()?;
        let provisioner = IdentityProvisioner::new(&fx.store, &fx.vault, &fx.chain);
        let result = provisioner.provision("acme", [3u8; 32])?;

        let operator_id = result.credential.operator_id;
        assert!(fx.store.verify_operator(&operator_id, &result.raw_api_key)?);
        assert!(!fx.store.verify_operator(&operator_id, "wrong-key")?);
        assert!(!fx
            .store
            .verify_operator(&Uuid::now_v7(), &result.raw_api_key)?);
        Ok(())
    }

    #[test]
    fn issue_credential_requires_provisioning_and_is_audited() -> Result<()> {
        let fx = fixture()?;
        let provisioner = IdentityProvisioner::new(&fx.store, &fx.vault, &fx.chain);

        let err = provisioner.issue_credential().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::NotProvisioned)
        );

        provisioner.provision("acme", [3u8; 32])?;
        let (credential, raw_api_key) = provisioner.issue_credential()?;
        assert!(fx
            .store
            .verify_operator(&credential.operator_id, &raw_api_key)?);
        assert_eq!(fx.store.operators()?.len(), 2);

        let entries = fx.chain.recent(1)?;
        assert_eq!(entries[0].event_type, EVENT_CREDENTIAL_ISSUED);
        Ok(())
    }

    #[test]
    fn drone_ids_are_time_ordered() -> Result<()> {
        let fx = fixture()?;
        let provisioner = IdentityProvisioner::new(&fx.store, &fx.vault, &fx.chain);
        let first = provisioner.provision("acme", [3u8; 32])?;
        let second = provisioner.provision_force("acme", [3u8; 32])?;
        assert!(second.identity.drone_id > first.identity.drone_id);

        // the provisioning trail itself verifies
        let result = fx.chain.verify()?;
        assert_eq!(
            result,
            ChainVerification {
                ok: true,
                entries_verified: 3,
                break_at: None
            }
        );
        Ok(())
    }
}
