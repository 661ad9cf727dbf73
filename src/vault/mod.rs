//! Sealed keystore for the device signing keypair.
//!
//! The private seed exists on disk only as an AES-256-GCM sealed blob keyed
//! by the hardware fingerprint plus a local secret, and in memory only for
//! the duration of a single signing call.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::TrustError;

pub mod crypto;

const SEALED_KEY_FILE: &str = "device_key.sealed";
const DEVICE_SECRET_FILE: &str = "device_secret";
const PUBLIC_KEY_FILE: &str = "device_key.pub";

pub struct KeyVault {
    keystore_dir: PathBuf,
}

impl KeyVault {
    pub fn open(keystore_dir: impl Into<PathBuf>) -> Self {
        Self {
            keystore_dir: keystore_dir.into(),
        }
    }

    pub fn keystore_dir(&self) -> &Path {
        &self.keystore_dir
    }

    /// Whether sealed identity material exists at the configured location.
    pub fn is_provisioned(&self) -> bool {
        self.keystore_dir.join(SEALED_KEY_FILE).exists()
    }

    /// Creates a fresh Ed25519 keypair sealed to the given fingerprint and
    /// returns the public key bytes.
    ///
    /// Fails with `AlreadyProvisioned` if sealed material already exists,
    /// unless `reprovision` is set. Re-provisioning destroys the previous
    /// key material irreversibly; callers must audit it first.
    pub fn generate(&self, fingerprint: &[u8; 32], reprovision: bool) -> Result<[u8; 32]> {
        if self.is_provisioned() {
            if !reprovision {
                return Err(TrustError::AlreadyProvisioned.into());
            }
            self.remove_key_material()?;
        }
        fs::create_dir_all(&self.keystore_dir)?;

        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(seed.as_mut_slice());
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();

        let mut device_secret = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(device_secret.as_mut_slice());

        let sealed = crypto::seal_seed(&seed, fingerprint, &device_secret)?;

        write_secret_file(
            &self.keystore_dir.join(DEVICE_SECRET_FILE),
            device_secret.as_slice(),
        )?;
        write_atomic(&self.keystore_dir.join(SEALED_KEY_FILE), &sealed)?;
        write_atomic(
            &self.keystore_dir.join(PUBLIC_KEY_FILE),
            format!("{}\n", hex::encode(public_key)).as_bytes(),
        )?;

        Ok(public_key)
    }

    /// Loads the stored public key without touching secret material.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let path = self.keystore_dir.join(PUBLIC_KEY_FILE);
        if !path.exists() {
            return Err(TrustError::NotProvisioned.into());
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| anyhow!("failed to read public key {}: {}", path.display(), e))?;
        let bytes = hex::decode(raw.trim())
            .map_err(|_| anyhow!("invalid public key encoding in {}", path.display()))?;
        if bytes.len() != 32 {
            return Err(anyhow!(
                "invalid public key length in {}: expected 32 bytes, got {}",
                path.display(),
                bytes.len()
            ));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        VerifyingKey::from_bytes(&arr).map_err(|e| anyhow!("invalid public key bytes: {}", e))
    }

    /// Signs a message with the sealed private key.
    ///
    /// The seed is unsealed into a zeroizing buffer scoped to this call and
    /// wiped on every exit path. No I/O happens between unsealing and
    /// signing, so contention from concurrent producers stays bounded.
    pub fn sign(&self, fingerprint: &[u8; 32], message: &[u8]) -> Result<[u8; 64]> {
        let seed = self.unseal(fingerprint)?;
        let signing_key = SigningKey::from_bytes(&seed);
        Ok(signing_key.sign(message).to_bytes())
    }

    fn unseal(&self, fingerprint: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        let sealed_path = self.keystore_dir.join(SEALED_KEY_FILE);
        if !sealed_path.exists() {
            return Err(TrustError::NotProvisioned.into());
        }
        let blob = fs::read(&sealed_path)
            .map_err(|e| anyhow!("failed to read keystore {}: {}", sealed_path.display(), e))?;
        let device_secret = self.read_device_secret()?;
        crypto::unseal_seed(&blob, fingerprint, &device_secret)
    }

    fn read_device_secret(&self) -> Result<Zeroizing<[u8; 32]>> {
        let path = self.keystore_dir.join(DEVICE_SECRET_FILE);
        let bytes = fs::read(&path)
            .map_err(|e| anyhow!("failed to read device secret {}: {}", path.display(), e))?;
        if bytes.len() != 32 {
            return Err(TrustError::CorruptKeyStore.into());
        }
        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&bytes);
        Ok(secret)
    }

    fn remove_key_material(&self) -> Result<()> {
        for name in [SEALED_KEY_FILE, DEVICE_SECRET_FILE, PUBLIC_KEY_FILE] {
            let path = self.keystore_dir.join(name);
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    anyhow!("failed to remove key material {}: {}", path.display(), e)
                })?;
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn write_secret_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| anyhow!("failed to create device secret {}: {}", path.display(), e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| anyhow!("failed to write device secret {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn generate_then_sign_verifies_with_stored_public_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = KeyVault::open(dir.path().join("identity"));
        let fingerprint = [5u8; 32];
        let public_key = vault.generate(&fingerprint, false)?;

        let signature = vault.sign(&fingerprint, b"finding bytes")?;
        let verifying_key = vault.verifying_key()?;
        assert_eq!(verifying_key.to_bytes(), public_key);
        let sig = ed25519_dalek::Signature::from_bytes(&signature);
        verifying_key.verify(b"finding bytes", &sig)?;
        Ok(())
    }

    #[test]
    fn second_generate_fails_already_provisioned() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = KeyVault::open(dir.path().join("identity"));
        vault.generate(&[5u8; 32], false)?;
        let err = vault.generate(&[5u8; 32], false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::AlreadyProvisioned)
        );
        Ok(())
    }

    #[test]
    fn explicit_reprovision_replaces_the_keypair() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = KeyVault::open(dir.path().join("identity"));
        let first = vault.generate(&[5u8; 32], false)?;
        let second = vault.generate(&[5u8; 32], true)?;
        assert_ne!(first, second);
        assert_eq!(vault.verifying_key()?.to_bytes(), second);
        Ok(())
    }

    #[test]
    fn sign_under_different_fingerprint_is_hardware_mismatch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vault = KeyVault::open(dir.path().join("identity"));
        vault.generate(&[5u8; 32], false)?;
        let err = vault.sign(&[6u8; 32], b"finding bytes").unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::HardwareMismatch)
        );
        Ok(())
    }

    #[test]
    fn tampered_keystore_is_corrupt_not_usable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let keystore = dir.path().join("identity");
        let vault = KeyVault::open(&keystore);
        let fingerprint = [5u8; 32];
        vault.generate(&fingerprint, false)?;

        let sealed_path = keystore.join("device_key.sealed");
        let mut blob = fs::read(&sealed_path)?;
        let last = blob.len() - 1;
        blob[last] ^= 0x80;
        fs::write(&sealed_path, &blob)?;

        let err = vault.sign(&fingerprint, b"finding bytes").unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::CorruptKeyStore)
        );
        Ok(())
    }

    #[test]
    fn sign_without_provisioning_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = KeyVault::open(dir.path().join("identity"));
        let err = vault.sign(&[5u8; 32], b"finding bytes").unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::NotProvisioned)
        );
    }

    #[cfg(unix)]
    #[test]
    fn device_secret_is_owner_only() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let keystore = dir.path().join("identity");
        KeyVault::open(&keystore).generate(&[5u8; 32], false)?;
        let mode = fs::metadata(keystore.join("device_secret"))?
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }
}
