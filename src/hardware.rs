use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::TrustError;

/// Derives a stable, non-secret fingerprint from immutable hardware
/// attributes: CPU serial number and the primary network-interface MAC.
///
/// The fingerprint is deterministic across reboots on the same physical
/// unit. It is not a secret; it binds key material to the unit so that a
/// stolen keystore is unusable elsewhere.
pub struct HardwareBinder {
    root: PathBuf,
}

const CPU_SERIAL_PATH: &str = "proc/device-tree/serial-number";
const MACHINE_ID_PATH: &str = "etc/machine-id";
const NET_CLASS_PATH: &str = "sys/class/net";

impl HardwareBinder {
    /// Binder probing the real system paths.
    pub fn system() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    /// Binder probing under an alternate root. Used by tests and by
    /// containerized deployments that remap the host sysfs.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Computes the hardware fingerprint: SHA-256 over
    /// `cpu_serial | primary_mac`.
    ///
    /// Fails with `HardwareUnavailable` if either attribute cannot be read.
    /// Callers in virtualized/SITL environments must opt into a synthetic
    /// fingerprint explicitly; there is no silent fallback here.
    pub fn fingerprint(&self) -> Result<[u8; 32]> {
        let serial = self.cpu_serial()?;
        let mac = self.primary_mac()?;
        let mut hasher = Sha256::new();
        hasher.update(serial.as_bytes());
        hasher.update(b"|");
        hasher.update(mac.as_bytes());
        Ok(hasher.finalize().into())
    }

    /// Deterministic fingerprint for environments without readable hardware
    /// attributes. The label keeps distinct test/SITL instances apart and
    /// makes the substitution visible in provisioning records.
    pub fn synthetic(label: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"synthetic|");
        hasher.update(label.trim().as_bytes());
        hasher.finalize().into()
    }

    fn cpu_serial(&self) -> Result<String> {
        // Jetson-class boards expose the SoC serial in the device tree;
        // generic Linux hosts fall back to the machine id.
        let serial_path = self.root.join(CPU_SERIAL_PATH);
        if let Some(serial) = read_attr(&serial_path) {
            return Ok(serial);
        }
        let machine_id_path = self.root.join(MACHINE_ID_PATH);
        if let Some(machine_id) = read_attr(&machine_id_path) {
            return Ok(machine_id);
        }
        Err(TrustError::HardwareUnavailable("cpu serial".to_string()).into())
    }

    fn primary_mac(&self) -> Result<String> {
        let net_path = self.root.join(NET_CLASS_PATH);
        let entries = match fs::read_dir(&net_path) {
            Ok(entries) => entries,
            Err(_) => {
                return Err(
                    TrustError::HardwareUnavailable("network interface mac".to_string()).into(),
                )
            }
        };

        let mut ifaces: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        ifaces.sort();

        for iface in ifaces {
            if iface.file_name().and_then(|n| n.to_str()) == Some("lo") {
                continue;
            }
            if let Some(mac) = read_attr(&iface.join("address")) {
                if mac != "00:00:00:00:00:00" {
                    return Ok(mac);
                }
            }
        }
        Err(TrustError::HardwareUnavailable("network interface mac".to_string()).into())
    }
}

fn read_attr(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    // device-tree strings are NUL-terminated
    let trimmed = raw.trim().trim_matches('\0').to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_host(serial: Option<&str>, mac: Option<&str>) -> Result<tempfile::TempDir> {
        let root = tempfile::tempdir()?;
        if let Some(serial) = serial {
            let serial_dir = root.path().join("proc/device-tree");
            fs::create_dir_all(&serial_dir)?;
            fs::write(serial_dir.join("serial-number"), serial)?;
        }
        if let Some(mac) = mac {
            let iface_dir = root.path().join("sys/class/net/eth0");
            fs::create_dir_all(&iface_dir)?;
            fs::write(iface_dir.join("address"), mac)?;
        }
        Ok(root)
    }

    #[test]
    fn fingerprint_is_stable_across_reads() -> Result<()> {
        let root = fake_host(Some("SOC-1234\0"), Some("aa:bb:cc:dd:ee:ff"))?;
        let binder = HardwareBinder::with_root(root.path());
        assert_eq!(binder.fingerprint()?, binder.fingerprint()?);
        Ok(())
    }

    #[test]
    fn fingerprint_changes_with_either_attribute() -> Result<()> {
        let a = fake_host(Some("SOC-1234"), Some("aa:bb:cc:dd:ee:ff"))?;
        let b = fake_host(Some("SOC-9999"), Some("aa:bb:cc:dd:ee:ff"))?;
        let c = fake_host(Some("SOC-1234"), Some("11:22:33:44:55:66"))?;
        let fp_a = HardwareBinder::with_root(a.path()).fingerprint()?;
        let fp_b = HardwareBinder::with_root(b.path()).fingerprint()?;
        let fp_c = HardwareBinder::with_root(c.path()).fingerprint()?;
        assert_ne!(fp_a, fp_b);
        assert_ne!(fp_a, fp_c);
        Ok(())
    }

    #[test]
    fn missing_serial_fails_hardware_unavailable() -> Result<()> {
        let root = fake_host(None, Some("aa:bb:cc:dd:ee:ff"))?;
        let err = HardwareBinder::with_root(root.path())
            .fingerprint()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::HardwareUnavailable("cpu serial".to_string()))
        );
        Ok(())
    }

    #[test]
    fn missing_mac_fails_hardware_unavailable() -> Result<()> {
        let root = fake_host(Some("SOC-1234"), None)?;
        let err = HardwareBinder::with_root(root.path())
            .fingerprint()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrustError>(),
            Some(&TrustError::HardwareUnavailable(
                "network interface mac".to_string()
            ))
        );
        Ok(())
    }

    #[test]
    fn all_zero_mac_is_rejected() -> Result<()> {
        let root = fake_host(Some("SOC-1234"), Some("00:00:00:00:00:00"))?;
        assert!(HardwareBinder::with_root(root.path()).fingerprint().is_err());
        Ok(())
    }

    #[test]
    fn machine_id_fallback_is_used_when_device_tree_is_absent() -> Result<()> {
        let root = fake_host(None, Some("aa:bb:cc:dd:ee:ff"))?;
        let etc = root.path().join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(etc.join("machine-id"), "0123456789abcdef\n")?;
        assert!(HardwareBinder::with_root(root.path()).fingerprint().is_ok());
        Ok(())
    }

    #[test]
    fn synthetic_fingerprint_is_deterministic_per_label() {
        assert_eq!(
            HardwareBinder::synthetic("sitl-1"),
            HardwareBinder::synthetic("sitl-1")
        );
        assert_ne!(
            HardwareBinder::synthetic("sitl-1"),
            HardwareBinder::synthetic("sitl-2")
        );
    }
}
