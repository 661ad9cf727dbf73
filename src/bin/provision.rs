//! provision - one-shot identity bootstrap for a field unit
//!
//! Generates the hardware-bound Ed25519 keypair, writes the sealed
//! keystore, records the drone identity, mints the first operator
//! credential, and appends the provisioning event to the audit chain.
//! The raw API key is printed exactly once and never retrievable again.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use aerotrust::{
    AuditChain, HardwareBinder, IdentityProvisioner, IdentityStore, KeyVault, TrustConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "provision",
    about = "Provision a hardware-bound drone identity (run once per device)"
)]
struct Args {
    /// Organization the unit is provisioned for
    #[arg(long)]
    org_id: Option<String>,

    /// Path to the SQLite database
    #[arg(long)]
    db: Option<String>,

    /// Keystore directory for sealed key material
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Explicit, audited re-provision replacing existing identity material
    #[arg(long)]
    force: bool,

    /// Derive a synthetic fingerprint from LABEL instead of reading
    /// hardware attributes (SITL and development hosts only)
    #[arg(long, value_name = "LABEL")]
    synthetic: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = TrustConfig::load()?;
    if let Some(org_id) = args.org_id {
        cfg.org_id = org_id;
    }
    if let Some(db) = args.db {
        cfg.db_path = db;
    }
    if let Some(keystore) = args.keystore {
        cfg.keystore_dir = keystore;
    }
    cfg.validate()?;

    let fingerprint = match &args.synthetic {
        Some(label) => {
            log::warn!("using synthetic fingerprint (label: {})", label);
            HardwareBinder::synthetic(label)
        }
        None => HardwareBinder::system().fingerprint()?,
    };

    let store = IdentityStore::open(&cfg.db_path)?;
    let vault = KeyVault::open(&cfg.keystore_dir);
    let chain = AuditChain::open(&cfg.db_path)?;
    let provisioner = IdentityProvisioner::new(&store, &vault, &chain);

    let result = if args.force {
        provisioner.provision_force(&cfg.org_id, fingerprint)?
    } else {
        provisioner.provision(&cfg.org_id, fingerprint)?
    };

    println!();
    println!("=== PROVISIONING COMPLETE ===");
    println!("  Drone ID:     {}", result.identity.drone_id);
    println!("  Org ID:       {}", result.identity.org_id);
    println!(
        "  HW Finger:    {}...",
        &hex::encode(result.identity.hardware_fingerprint)[..16]
    );
    println!(
        "  Public Key:   {}",
        hex::encode(result.identity.public_key)
    );
    println!("  Operator ID:  {}", result.credential.operator_id);
    println!("  API Key:      {}", result.raw_api_key);
    println!();
    println!("SAVE THE API KEY NOW. It is stored only as a hash and will never be shown again.");
    println!("Keystore written to {}", cfg.keystore_dir.display());
    Ok(())
}
