//! Aerotrust - on-device trust core for autonomous field units
//!
//! This crate implements the security kernel for a single autonomous unit
//! operating offline with no external trust anchor. Identity is self-issued
//! and bound to the physical hardware.
//!
//! # Architecture
//!
//! The core enforces five guarantees by construction:
//!
//! 1. **Hardware-Bound Identity**: the Ed25519 signing key is sealed to a
//!    fingerprint of the physical unit and unusable on any other device.
//! 2. **Evidence Integrity**: findings are signed at capture time over a
//!    canonical byte encoding; any post-hoc field mutation invalidates them.
//! 3. **Tamper-Evident Audit Trail**: every security-relevant event lands in
//!    an append-only, hash-linked chain; modification or deletion breaks it.
//! 4. **Replay-Safe Command Intake**: operator commands are HMAC
//!    authenticated and rejected outside a bounded freshness window.
//! 5. **No Silent Continuation**: a detected chain break halts further
//!    appends until an operator explicitly acknowledges it on the record.
//!
//! # Module Structure
//!
//! - `hardware`: hardware fingerprint derivation
//! - `vault`: sealed keystore and scoped signing
//! - `identity`: provisioning, drone identity, operator credentials
//! - `signer`: canonical finding encoding, signing, verification
//! - `chain`: append-only audit chain with break detection
//! - `command`: inbound command authentication with replay protection
//! - `verify`: external chain verification over a raw database handle

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

pub mod chain;
pub mod command;
pub mod config;
pub mod hardware;
pub mod identity;
pub mod signer;
pub mod vault;
pub mod verify;

pub use chain::{
    hash_entry, AuditChain, AuditEntry, AuditStore, ChainVerification, InMemoryAuditStore,
    SqliteAuditStore, GENESIS_HASH,
};
pub use command::{AuthError, AuthenticatedCommand, CommandAuthenticator, CommandEnvelope};
pub use config::TrustConfig;
pub use hardware::HardwareBinder;
pub use identity::{
    DroneIdentity, IdentityProvisioner, IdentityStore, OperatorCredential, Provisioned,
};
pub use signer::{ChainAttestation, Finding, FindingDraft, Signer};
pub use vault::KeyVault;

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- Error Taxonomy --------------------

/// Identity, keystore, and chain errors.
///
/// `HardwareMismatch`, `CorruptKeyStore`, and `ChainBroken` are fatal to the
/// affected subsystem: the vault refuses to sign and the chain refuses to
/// append until the condition is resolved explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustError {
    /// A hardware attribute needed for the fingerprint could not be read.
    HardwareUnavailable(String),
    /// Identity material already exists and re-provisioning was not requested.
    AlreadyProvisioned,
    /// No identity material exists at the configured location.
    NotProvisioned,
    /// The fingerprint at load time differs from the one used to seal.
    HardwareMismatch,
    /// The sealed keystore failed authentication-tag verification.
    CorruptKeyStore,
    /// A signature did not verify against the device public key.
    SignatureInvalid,
    /// The audit chain has a detected break at the given sequence number.
    ChainBroken(u64),
    /// Persistence failed after bounded retries.
    StorageIo(String),
}

impl fmt::Display for TrustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustError::HardwareUnavailable(what) => {
                write!(f, "hardware attribute unavailable: {}", what)
            }
            TrustError::AlreadyProvisioned => {
                write!(f, "identity already provisioned (re-provision must be explicit)")
            }
            TrustError::NotProvisioned => write!(f, "device is not provisioned"),
            TrustError::HardwareMismatch => {
                write!(f, "hardware fingerprint does not match sealed keystore")
            }
            TrustError::CorruptKeyStore => write!(f, "keystore failed authentication"),
            TrustError::SignatureInvalid => write!(f, "signature verification failed"),
            TrustError::ChainBroken(at) => {
                write!(f, "audit chain break detected at sequence {}", at)
            }
            TrustError::StorageIo(what) => write!(f, "storage failure: {}", what),
        }
    }
}

impl std::error::Error for TrustError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_error_is_downcastable_through_anyhow() {
        let err: anyhow::Error = TrustError::ChainBroken(5).into();
        match err.downcast_ref::<TrustError>() {
            Some(TrustError::ChainBroken(at)) => assert_eq!(*at, 5),
            other => panic!("unexpected downcast result: {:?}", other),
        }
    }

    #[test]
    fn now_s_is_monotonic_enough_for_audit_timestamps() -> Result<()> {
        let a = now_s()?;
        let b = now_s()?;
        assert!(b >= a);
        Ok(())
    }
}
