use anyhow::Result;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::chain::push_bytes;
use crate::vault::KeyVault;
use crate::{now_s, TrustError};

pub const DOMAIN_FINDING: &str = "aerotrust:finding:v1";
pub const DOMAIN_CHAIN_HEAD: &str = "aerotrust:chain-head:v1";

/// A detection event before signing. Collaborators (vision pipeline,
/// mission engine) construct drafts; only [`Signer`] turns them into
/// findings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindingDraft {
    pub finding_id: Uuid,
    pub mission_id: String,
    pub timestamp: u64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub classification: String,
    pub confidence: f32,
    pub image_hash: [u8; 32],
}

impl FindingDraft {
    pub fn new(
        mission_id: &str,
        lat: f64,
        lon: f64,
        alt: f64,
        classification: &str,
        confidence: f32,
        image_hash: [u8; 32],
    ) -> Result<Self> {
        Ok(Self {
            finding_id: Uuid::now_v7(),
            mission_id: mission_id.to_string(),
            timestamp: now_s()?,
            lat,
            lon,
            alt,
            classification: classification.to_string(),
            confidence,
            image_hash,
        })
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_finding_bytes(
            &self.finding_id,
            &self.mission_id,
            self.timestamp,
            self.lat,
            self.lon,
            self.alt,
            &self.classification,
            self.confidence,
            &self.image_hash,
        )
    }
}

/// A signed, immutable evidence record. Any post-hoc mutation of any field
/// invalidates the signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: Uuid,
    pub mission_id: String,
    pub timestamp: u64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub classification: String,
    pub confidence: f32,
    pub image_hash: [u8; 32],
    pub signature: Vec<u8>,
}

impl Finding {
    /// Canonical bytes over the evidentiary fields, signature excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_finding_bytes(
            &self.finding_id,
            &self.mission_id,
            self.timestamp,
            self.lat,
            self.lon,
            self.alt,
            &self.classification,
            self.confidence,
            &self.image_hash,
        )
    }

    pub fn hash_image(image_bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(image_bytes).into()
    }
}

/// Fixed field order and fixed numeric representation: little-endian
/// integers, length-prefixed strings, coordinates as canonical decimal
/// text (8 places for lat/lon, 2 for altitude, 4 for confidence). Sign
/// and verify must byte-match, so nothing here may depend on locale,
/// hash-map ordering, or float display defaults.
#[allow(clippy::too_many_arguments)]
fn canonical_finding_bytes(
    finding_id: &Uuid,
    mission_id: &str,
    timestamp: u64,
    lat: f64,
    lon: f64,
    alt: f64,
    classification: &str,
    confidence: f32,
    image_hash: &[u8; 32],
) -> Vec<u8> {
    let mut out = Vec::new();
    push_bytes(&mut out, DOMAIN_FINDING.as_bytes());
    push_bytes(&mut out, finding_id.to_string().as_bytes());
    push_bytes(&mut out, mission_id.as_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    push_bytes(&mut out, format!("{:.8}", lat).as_bytes());
    push_bytes(&mut out, format!("{:.8}", lon).as_bytes());
    push_bytes(&mut out, format!("{:.2}", alt).as_bytes());
    push_bytes(&mut out, classification.as_bytes());
    push_bytes(&mut out, format!("{:.4}", confidence).as_bytes());
    out.extend_from_slice(image_hash);
    out
}

fn domain_separated_hash(domain: &str, content_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let domain_bytes = domain.as_bytes();
    hasher.update((domain_bytes.len() as u32).to_le_bytes());
    hasher.update(domain_bytes);
    hasher.update(content_hash);
    hasher.finalize().into()
}

/// Detached device signature over the audit-chain tail, produced on demand
/// so an exported database can carry proof of who wrote it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainAttestation {
    pub sequence_no: u64,
    pub entry_hash: [u8; 32],
    pub signature: Vec<u8>,
}

impl ChainAttestation {
    fn signing_hash(sequence_no: u64, entry_hash: &[u8; 32]) -> [u8; 32] {
        let mut content = Vec::with_capacity(8 + 32);
        content.extend_from_slice(&sequence_no.to_le_bytes());
        content.extend_from_slice(entry_hash);
        let content_hash: [u8; 32] = Sha256::digest(&content).into();
        domain_separated_hash(DOMAIN_CHAIN_HEAD, &content_hash)
    }
}

/// Produces and verifies signatures over canonical finding encodings,
/// using the sealed device key for the signing half.
pub struct Signer<'a> {
    vault: &'a KeyVault,
    fingerprint: [u8; 32],
    verifying_key: VerifyingKey,
}

impl<'a> Signer<'a> {
    pub fn new(vault: &'a KeyVault, fingerprint: [u8; 32]) -> Result<Self> {
        let verifying_key = vault.verifying_key()?;
        Ok(Self {
            vault,
            fingerprint,
            verifying_key,
        })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn sign_finding(&self, draft: FindingDraft) -> Result<Finding> {
        let content_hash: [u8; 32] = Sha256::digest(draft.canonical_bytes()).into();
        let signing_hash = domain_separated_hash(DOMAIN_FINDING, &content_hash);
        let signature = self.vault.sign(&self.fingerprint, &signing_hash)?;
        Ok(Finding {
            finding_id: draft.finding_id,
            mission_id: draft.mission_id,
            timestamp: draft.timestamp,
            lat: draft.lat,
            lon: draft.lon,
            alt: draft.alt,
            classification: draft.classification,
            confidence: draft.confidence,
            image_hash: draft.image_hash,
            signature: signature.to_vec(),
        })
    }

    pub fn verify_finding(&self, finding: &Finding) -> bool {
        verify_finding_with_key(&self.verifying_key, finding)
    }

    pub fn attest_chain_head(
        &self,
        sequence_no: u64,
        entry_hash: [u8; 32],
    ) -> Result<ChainAttestation> {
        let signing_hash = ChainAttestation::signing_hash(sequence_no, &entry_hash);
        let signature = self.vault.sign(&self.fingerprint, &signing_hash)?;
        Ok(ChainAttestation {
            sequence_no,
            entry_hash,
            signature: signature.to_vec(),
        })
    }
}

/// Verification half usable without any key material on disk, e.g. by
/// ground tooling holding only the device public key.
pub fn verify_finding_with_key(verifying_key: &VerifyingKey, finding: &Finding) -> bool {
    let Ok(signature_bytes) = <[u8; 64]>::try_from(finding.signature.as_slice()) else {
        return false;
    };
    let content_hash: [u8; 32] = Sha256::digest(finding.canonical_bytes()).into();
    let signing_hash = domain_separated_hash(DOMAIN_FINDING, &content_hash);
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key.verify(&signing_hash, &signature).is_ok()
}

pub fn verify_attestation(
    verifying_key: &VerifyingKey,
    attestation: &ChainAttestation,
) -> Result<()> {
    let signature_bytes = <[u8; 64]>::try_from(attestation.signature.as_slice())
        .map_err(|_| TrustError::SignatureInvalid)?;
    let signing_hash =
        ChainAttestation::signing_hash(attestation.sequence_no, &attestation.entry_hash);
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify(&signing_hash, &signature)
        .map_err(|_| TrustError::SignatureInvalid)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        vault: KeyVault,
        fingerprint: [u8; 32],
    }

    fn fixture() -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let vault = KeyVault::open(dir.path().join("identity"));
        let fingerprint = [4u8; 32];
        vault.generate(&fingerprint, false)?;
        Ok(Fixture {
            _dir: dir,
            vault,
            fingerprint,
        })
    }

    fn draft() -> Result<FindingDraft> {
        FindingDraft::new(
            "mission-1",
            25.033964,
            121.564468,
            30.0,
            "person",
            0.92,
            Finding::hash_image(b"jpeg bytes"),
        )
    }

    #[test]
    fn signed_finding_verifies_unmodified() -> Result<()> {
        let fx = fixture()?;
        let signer = Signer::new(&fx.vault, fx.fingerprint)?;
        let finding = signer.sign_finding(draft()?)?;
        assert!(signer.verify_finding(&finding));
        Ok(())
    }

    #[test]
    fn mutating_any_single_field_invalidates_the_signature() -> Result<()> {
        let fx = fixture()?;
        let signer = Signer::new(&fx.vault, fx.fingerprint)?;
        let finding = signer.sign_finding(draft()?)?;

        let mut lat = finding.clone();
        lat.lat += 0.00000001;
        assert!(!signer.verify_finding(&lat));

        let mut lon = finding.clone();
        lon.lon -= 0.00000001;
        assert!(!signer.verify_finding(&lon));

        let mut alt = finding.clone();
        alt.alt = 31.0;
        assert!(!signer.verify_finding(&alt));

        let mut class = finding.clone();
        class.classification = "vehicle".to_string();
        assert!(!signer.verify_finding(&class));

        let mut confidence = finding.clone();
        confidence.confidence = 0.50;
        assert!(!signer.verify_finding(&confidence));

        let mut image = finding.clone();
        image.image_hash[0] ^= 0x01;
        assert!(!signer.verify_finding(&image));

        let mut ts = finding.clone();
        ts.timestamp += 1;
        assert!(!signer.verify_finding(&ts));

        // the untouched original still verifies
        assert!(signer.verify_finding(&finding));
        Ok(())
    }

    #[test]
    fn verification_works_with_public_key_alone() -> Result<()> {
        let fx = fixture()?;
        let signer = Signer::new(&fx.vault, fx.fingerprint)?;
        let finding = signer.sign_finding(draft()?)?;
        let verifying_key = fx.vault.verifying_key()?;
        assert!(verify_finding_with_key(&verifying_key, &finding));
        Ok(())
    }

    #[test]
    fn foreign_key_does_not_verify() -> Result<()> {
        let fx = fixture()?;
        let signer = Signer::new(&fx.vault, fx.fingerprint)?;
        let finding = signer.sign_finding(draft()?)?;

        let other = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        assert!(!verify_finding_with_key(&other.verifying_key(), &finding));
        Ok(())
    }

    #[test]
    fn truncated_signature_is_rejected_not_panicking() -> Result<()> {
        let fx = fixture()?;
        let signer = Signer::new(&fx.vault, fx.fingerprint)?;
        let mut finding = signer.sign_finding(draft()?)?;
        finding.signature.truncate(10);
        assert!(!signer.verify_finding(&finding));
        Ok(())
    }

    #[test]
    fn chain_attestation_roundtrip_and_tamper() -> Result<()> {
        let fx = fixture()?;
        let signer = Signer::new(&fx.vault, fx.fingerprint)?;
        let attestation = signer.attest_chain_head(42, [7u8; 32])?;
        let verifying_key = fx.vault.verifying_key()?;
        verify_attestation(&verifying_key, &attestation)?;

        let mut tampered = attestation.clone();
        tampered.sequence_no = 43;
        let err = verify_attestation(&verifying_key, &tampered).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::SignatureInvalid)
        );
        Ok(())
    }
}
