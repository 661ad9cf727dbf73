use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use anyhow::{anyhow, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::TrustError;

pub const SEALED_KEY_MAGIC: &[u8; 4] = b"AKS1";

const DOMAIN_KEY_SEAL: &str = "aerotrust:key-seal:v1";

/// Maximum sealed ciphertext size. The payload is a 32-byte seed; anything
/// larger than this is a malformed or hostile blob.
const MAX_SEALED_CIPHERTEXT_LEN: usize = 4096;

/// Derives the key-encryption key binding the seed to this physical unit:
/// SHA-256 over a length-prefixed domain string, the hardware fingerprint,
/// and the local device secret.
pub fn derive_kek(fingerprint: &[u8; 32], device_secret: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    let domain = DOMAIN_KEY_SEAL.as_bytes();
    hasher.update((domain.len() as u32).to_le_bytes());
    hasher.update(domain);
    hasher.update(fingerprint);
    hasher.update(device_secret);
    Zeroizing::new(hasher.finalize().into())
}

/// Seals a 32-byte signing seed under AES-256-GCM keyed by the hardware
/// fingerprint and local device secret.
///
/// Blob layout: magic, SHA-256(fingerprint), 12-byte nonce, 16-byte tag,
/// length-prefixed ciphertext. The magic and fingerprint hash are bound as
/// AAD so a blob cannot be re-homed by header surgery.
pub fn seal_seed(
    seed: &[u8; 32],
    fingerprint: &[u8; 32],
    device_secret: &[u8; 32],
) -> Result<Vec<u8>> {
    let kek = derive_kek(fingerprint, device_secret);
    let fingerprint_hash: [u8; 32] = Sha256::digest(fingerprint).into();

    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let aad = seal_aad(&fingerprint_hash);
    let mut ciphertext = seed.to_vec();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
    let tag: [u8; 16] = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut ciphertext)
        .map_err(|_| anyhow!("keystore sealing failed"))?
        .into();

    let mut out = Vec::with_capacity(4 + 32 + 12 + 16 + 4 + ciphertext.len());
    out.extend_from_slice(SEALED_KEY_MAGIC);
    out.extend_from_slice(&fingerprint_hash);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Recovers the signing seed from a sealed blob.
///
/// Fails with `HardwareMismatch` when the fingerprint at load time differs
/// from the one recorded at seal time (checked before any decryption), and
/// with `CorruptKeyStore` when authentication-tag verification fails.
pub fn unseal_seed(
    blob: &[u8],
    fingerprint: &[u8; 32],
    device_secret: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>> {
    let mut cursor = 0usize;
    let magic = read_slice(blob, &mut cursor, 4)?;
    if magic != SEALED_KEY_MAGIC {
        return Err(TrustError::CorruptKeyStore.into());
    }
    let stored_fingerprint_hash = read_array32(blob, &mut cursor)?;
    let nonce = read_slice(blob, &mut cursor, 12)?.to_vec();
    let tag = read_slice(blob, &mut cursor, 16)?.to_vec();
    let ct_len = read_u32(blob, &mut cursor)? as usize;
    if ct_len > MAX_SEALED_CIPHERTEXT_LEN {
        return Err(TrustError::CorruptKeyStore.into());
    }
    let ciphertext = read_slice(blob, &mut cursor, ct_len)?;

    let fingerprint_hash: [u8; 32] = Sha256::digest(fingerprint).into();
    if fingerprint_hash != stored_fingerprint_hash {
        return Err(TrustError::HardwareMismatch.into());
    }

    let kek = derive_kek(fingerprint, device_secret);
    let aad = seal_aad(&stored_fingerprint_hash);
    let mut clear = Zeroizing::new(ciphertext.to_vec());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &aad,
            clear.as_mut_slice(),
            Tag::from_slice(&tag),
        )
        .map_err(|_| TrustError::CorruptKeyStore)?;

    if clear.len() != 32 {
        return Err(TrustError::CorruptKeyStore.into());
    }
    let mut seed = Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(&clear);
    Ok(seed)
}

fn seal_aad(fingerprint_hash: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + 32);
    aad.extend_from_slice(SEALED_KEY_MAGIC);
    aad.extend_from_slice(fingerprint_hash);
    aad
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_array32(bytes: &[u8], cursor: &mut usize) -> Result<[u8; 32]> {
    let slice = read_slice(bytes, cursor, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(slice);
    Ok(out)
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *cursor + len > bytes.len() {
        return Err(TrustError::CorruptKeyStore.into());
    }
    let out = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(out)
}
