//! chain_verify - external verifier for the audit chain
//!
//! This tool proves:
//! - The audit log is hash-chained and gapless (tamper-evident)
//! - An optional detached attestation over the chain head carries the
//!   device signature
//!
//! Integrity must be provable without trusting the runtime: the database
//! is opened read-only and every hash is recomputed from genesis.

use anyhow::{anyhow, Result};
use clap::Parser;

use aerotrust::signer::ChainAttestation;
use aerotrust::verify;

#[derive(Parser, Debug)]
#[command(
    name = "chain_verify",
    about = "Verify audit chain integrity (hash linkage + sequence continuity)"
)]
struct Args {
    /// Path to the drone SQLite DB
    #[arg(long, default_value = "drone.db")]
    db: String,

    /// Path to a detached chain attestation JSON to check against the log
    #[arg(long, value_name = "PATH")]
    attestation: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let conn = verify::open_read_only(&args.db)?;

    println!("chain_verify: checking {}", args.db);
    println!();

    let result = verify::verify_chain_with(&conn, |entry| {
        if args.verbose {
            println!(
                "  entry {}: segment={} type={} hash={} OK",
                entry.sequence_no,
                entry.segment,
                entry.event_type,
                &hex::encode(entry.entry_hash)[..16]
            );
        }
        true
    })?;

    println!("verified {} entries", result.entries_verified);
    match result.break_at {
        None => println!("chain linkage: OK"),
        Some(at) => println!("chain linkage: BREAK at sequence {}", at),
    }

    if let Some(path) = &args.attestation {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read attestation {}: {}", path, e))?;
        let attestation: ChainAttestation =
            serde_json::from_str(&raw).map_err(|e| anyhow!("invalid attestation file: {}", e))?;
        verify::verify_chain_attestation(&conn, &attestation)?;
        println!(
            "attestation: device signature over sequence {} OK",
            attestation.sequence_no
        );
    }

    if let Some(at) = result.break_at {
        return Err(anyhow!("audit chain break detected at sequence {}", at));
    }
    println!();
    println!("OK: audit chain verified.");
    Ok(())
}
