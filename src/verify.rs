//! External chain verification.
//!
//! Integrity must be provable without trusting the runtime that wrote the
//! database: everything here works from a raw, read-only SQLite handle and
//! the device public key stored in the identity row.

use anyhow::{anyhow, Result};
use ed25519_dalek::VerifyingKey;
use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::chain::{load_entries, verify_entries, AuditEntry, ChainVerification};
use crate::signer::{verify_attestation, ChainAttestation};

pub fn open_read_only(db_path: &str) -> Result<Connection> {
    Ok(Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?)
}

/// Walks the whole audit log from genesis, recomputing every entry hash
/// and linkage. Returns `(ok, entries_verified, break_at)`.
pub fn verify_chain(conn: &Connection) -> Result<ChainVerification> {
    verify_chain_with(conn, |_| true)
}

/// Like [`verify_chain`], invoking `on_entry` for each verified entry.
/// Returning `false` cancels the walk and yields the partial count.
pub fn verify_chain_with<F>(conn: &Connection, on_entry: F) -> Result<ChainVerification>
where
    F: FnMut(&AuditEntry) -> bool,
{
    let entries = load_entries(conn)?;
    Ok(verify_entries(&entries, on_entry))
}

/// Device public key from the write-once identity row.
pub fn device_public_key(conn: &Connection) -> Result<VerifyingKey> {
    let bytes: Option<Vec<u8>> = conn
        .query_row("SELECT public_key FROM identity WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    let Some(bytes) = bytes else {
        return Err(anyhow!("no identity row: device is not provisioned"));
    };
    if bytes.len() != 32 {
        return Err(anyhow!(
            "corrupt identity.public_key: expected 32 bytes, got {}",
            bytes.len()
        ));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    VerifyingKey::from_bytes(&arr).map_err(|e| anyhow!("invalid device public key: {}", e))
}

/// Checks a detached chain attestation against both the device public key
/// and the stored log: the signature must verify and the attested entry
/// must exist with the same hash.
pub fn verify_chain_attestation(conn: &Connection, attestation: &ChainAttestation) -> Result<()> {
    let verifying_key = device_public_key(conn)?;
    verify_attestation(&verifying_key, attestation)?;

    let entries = load_entries(conn)?;
    let entry = entries
        .iter()
        .find(|e| e.sequence_no == attestation.sequence_no)
        .ok_or_else(|| {
            anyhow!(
                "attested sequence {} not present in audit log",
                attestation.sequence_no
            )
        })?;
    if entry.entry_hash != attestation.entry_hash {
        return Err(anyhow!(
            "attested hash does not match stored entry {}",
            attestation.sequence_no
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::AuditChain;
    use crate::identity::{IdentityProvisioner, IdentityStore};
    use crate::signer::Signer;
    use crate::vault::KeyVault;

    struct Fixture {
        _dir: tempfile::TempDir,
        db_path: String,
        chain: AuditChain,
        vault: KeyVault,
        fingerprint: [u8; 32],
    }

    fn provisioned_fixture() -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let db_path = dir
            .path()
            .join("drone.db")
            .to_str()
            .expect("utf8 path")
            .to_string();
        let store = IdentityStore::open(&db_path)?;
        let vault = KeyVault::open(dir.path().join("identity"));
        let chain = AuditChain::open(&db_path)?;
        let fingerprint = [8u8; 32];
        IdentityProvisioner::new(&store, &vault, &chain).provision("acme", fingerprint)?;
        Ok(Fixture {
            _dir: dir,
            db_path,
            chain,
            vault,
            fingerprint,
        })
    }

    #[test]
    fn external_verifier_agrees_with_the_runtime() -> Result<()> {
        let fx = provisioned_fixture()?;
        for i in 0..5 {
            fx.chain
                .append("mission_event", serde_json::json!({ "i": i }))?;
        }
        let conn = open_read_only(&fx.db_path)?;
        let external = verify_chain(&conn)?;
        let internal = fx.chain.verify()?;
        assert_eq!(external, internal);
        assert!(external.ok);
        assert_eq!(external.entries_verified, 6);
        Ok(())
    }

    #[test]
    fn external_verifier_reports_breaks_without_write_access() -> Result<()> {
        let fx = provisioned_fixture()?;
        for i in 0..5 {
            fx.chain
                .append("mission_event", serde_json::json!({ "i": i }))?;
        }
        {
            let writable = Connection::open(&fx.db_path)?;
            writable.execute(
                "UPDATE audit_log SET payload_json = '{}' WHERE sequence_no = 3",
                [],
            )?;
        }
        let conn = open_read_only(&fx.db_path)?;
        let result = verify_chain(&conn)?;
        assert!(!result.ok);
        assert_eq!(result.break_at, Some(3));
        assert_eq!(result.entries_verified, 2);
        Ok(())
    }

    #[test]
    fn attestation_checks_signature_and_stored_hash() -> Result<()> {
        let fx = provisioned_fixture()?;
        let entry = fx
            .chain
            .append("mission_event", serde_json::json!({ "i": 1 }))?;
        let signer = Signer::new(&fx.vault, fx.fingerprint)?;
        let attestation = signer.attest_chain_head(entry.sequence_no, entry.entry_hash)?;

        let conn = open_read_only(&fx.db_path)?;
        verify_chain_attestation(&conn, &attestation)?;

        let mut wrong_hash = attestation.clone();
        wrong_hash.entry_hash[0] ^= 0x01;
        assert!(verify_chain_attestation(&conn, &wrong_hash).is_err());

        let missing = ChainAttestation {
            sequence_no: 999,
            ..attestation.clone()
        };
        assert!(verify_chain_attestation(&conn, &missing).is_err());
        Ok(())
    }

    #[test]
    fn public_key_requires_a_provisioned_identity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir
            .path()
            .join("empty.db")
            .to_str()
            .expect("utf8 path")
            .to_string();
        // create schema without provisioning
        IdentityStore::open(&db_path)?;
        let conn = open_read_only(&db_path)?;
        assert!(device_public_key(&conn).is_err());
        Ok(())
    }
}
