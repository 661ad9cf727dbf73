//! demo - end-to-end synthetic run of the trust core
//!
//! Provisions a fresh identity, signs findings, authenticates commands,
//! verifies the audit chain, then tampers with a stored entry to show
//! break detection, refusal, and operator acknowledgment.

use anyhow::{anyhow, Result};
use clap::Parser;
use rusqlite::Connection;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use aerotrust::{
    now_s, verify, AuditChain, CommandAuthenticator, CommandEnvelope, Finding, FindingDraft,
    HardwareBinder, IdentityProvisioner, IdentityStore, KeyVault, Signer, TrustError,
};

const DEFAULT_DB_PATH: &str = "demo_drone.db";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of findings to sign
    #[arg(long, default_value_t = 10)]
    findings: u64,

    /// Path for the demo database (removed and recreated)
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: String,

    /// Output directory for the chain attestation
    #[arg(long, default_value = "demo_out")]
    out: String,
}

fn stage(label: &str) {
    println!();
    println!("==> {}", label);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.findings == 0 {
        return Err(anyhow!("findings must be >= 1"));
    }

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)?;
    let keystore_dir = out_dir.join("identity");
    for stale in [
        PathBuf::from(&args.db),
        PathBuf::from(format!("{}-wal", args.db)),
        PathBuf::from(format!("{}-shm", args.db)),
        keystore_dir.join("device_key.sealed"),
        keystore_dir.join("device_secret"),
        keystore_dir.join("device_key.pub"),
    ] {
        if stale.exists() {
            fs::remove_file(&stale)?;
        }
    }

    stage("provision identity");
    let fingerprint = HardwareBinder::synthetic("demo-unit");
    let store = IdentityStore::open(&args.db)?;
    let vault = KeyVault::open(&keystore_dir);
    let chain = AuditChain::open(&args.db)?;
    let provisioned =
        IdentityProvisioner::new(&store, &vault, &chain).provision("acme", fingerprint)?;
    println!("drone_id={}", provisioned.identity.drone_id);
    println!("operator_id={}", provisioned.credential.operator_id);

    stage("sign findings");
    let signer = Signer::new(&vault, fingerprint)?;
    let mut last_finding = None;
    for i in 0..args.findings {
        let draft = FindingDraft::new(
            "mission-demo",
            25.033964 + i as f64 * 0.0001,
            121.564468,
            30.0,
            "person",
            0.92,
            Finding::hash_image(format!("frame-{}", i).as_bytes()),
        )?;
        let finding = signer.sign_finding(draft)?;
        chain.append(
            "detection",
            serde_json::json!({
                "finding_id": finding.finding_id.to_string(),
                "classification": finding.classification,
                "confidence": finding.confidence,
            }),
        )?;
        last_finding = Some(finding);
    }
    let finding = last_finding.ok_or_else(|| anyhow!("no finding produced"))?;
    println!(
        "signed {} findings; last verifies: {}",
        args.findings,
        signer.verify_finding(&finding)
    );

    stage("authenticate operator command");
    let authenticator =
        CommandAuthenticator::from_store(&chain, &store, Duration::from_secs(30))?;
    let envelope = CommandEnvelope::build(
        provisioned.credential.operator_id,
        "return_to_launch",
        now_s()?,
        &provisioned.raw_api_key,
    );
    let command = authenticator.authenticate(&envelope)?;
    println!("accepted command: {}", command.command);
    match authenticator.authenticate(&envelope) {
        Err(err) => println!("replayed envelope rejected: {}", err),
        Ok(_) => return Err(anyhow!("replayed envelope was accepted")),
    }

    stage("verify chain");
    let result = chain.verify()?;
    println!(
        "ok={} entries_verified={} break_at={:?}",
        result.ok, result.entries_verified, result.break_at
    );

    stage("attest chain head");
    let tail = chain
        .tail()?
        .ok_or_else(|| anyhow!("chain has no tail after appends"))?;
    let attestation = signer.attest_chain_head(tail.sequence_no, tail.entry_hash)?;
    let attestation_path = out_dir.join("chain_attestation.json");
    fs::write(&attestation_path, serde_json::to_string_pretty(&attestation)?)?;
    println!("attestation written to {}", attestation_path.display());

    stage("tamper with entry 5");
    {
        let conn = Connection::open(&args.db)?;
        conn.execute(
            "UPDATE audit_log SET payload_json = '{\"forged\":true}' WHERE sequence_no = 5",
            [],
        )?;
    }
    let result = chain.verify()?;
    println!(
        "ok={} entries_verified={} break_at={:?}",
        result.ok, result.entries_verified, result.break_at
    );
    match chain.append("detection", serde_json::json!({})) {
        Err(err) if err.downcast_ref::<TrustError>().is_some() => {
            println!("append refused: {}", err)
        }
        Err(err) => return Err(err),
        Ok(_) => return Err(anyhow!("append succeeded on a broken chain")),
    }

    stage("operator acknowledges break");
    let ack = chain.acknowledge_break(&provisioned.credential.operator_id.to_string())?;
    println!("segment {} opened by {} entry", ack.segment, ack.event_type);
    chain.append("mission_event", serde_json::json!({ "resumed": true }))?;
    let result = chain.verify()?;
    println!(
        "ok={} entries_verified={} break_at={:?} (history preserved)",
        result.ok, result.entries_verified, result.break_at
    );

    stage("external verification");
    let conn = verify::open_read_only(&args.db)?;
    let external = verify::verify_chain(&conn)?;
    println!(
        "external: ok={} entries_verified={} break_at={:?}",
        external.ok, external.entries_verified, external.break_at
    );

    println!();
    println!("demo complete. database: {}", args.db);
    Ok(())
}
