use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::chain::{push_bytes, AuditChain};
use crate::identity::{api_key_hash, IdentityStore, OperatorCredential};
use crate::now_s;

pub const DOMAIN_COMMAND: &str = "aerotrust:command:v1";

pub const EVENT_COMMAND_ACCEPTED: &str = "command_accepted";
pub const EVENT_COMMAND_REJECTED: &str = "command_rejected";

/// Smallest replay window that is not a misconfiguration. A zero-length
/// window would reject every command including fresh ones.
pub const MIN_REPLAY_WINDOW: Duration = Duration::from_secs(1);

type HmacSha256 = Hmac<Sha256>;

/// Per-command authentication failures. Recoverable: the command is
/// rejected and audited, and the system keeps operating.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthError {
    UnknownOperator,
    Expired { age_s: u64 },
    InvalidSignature,
    ReplayDetected,
}

impl AuthError {
    /// Stable identifier recorded in the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::UnknownOperator => "unknown_operator",
            AuthError::Expired { .. } => "expired",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::ReplayDetected => "replay_detected",
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::UnknownOperator => write!(f, "operator is not recognized"),
            AuthError::Expired { age_s } => {
                write!(f, "command outside replay window (age={}s)", age_s)
            }
            AuthError::InvalidSignature => write!(f, "command hmac verification failed"),
            AuthError::ReplayDetected => write!(f, "command was already accepted"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Inbound operator command as received from the comms collaborator.
/// Transient: nothing of it is persisted beyond the audit record of the
/// authentication outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub operator_id: Uuid,
    pub command: String,
    pub issued_at: u64,
    pub hmac: Vec<u8>,
}

impl CommandEnvelope {
    /// Builds an envelope the way ground-station tooling does: the MAC key
    /// is derived from the raw API key, so the key itself never travels.
    pub fn build(operator_id: Uuid, command: &str, issued_at: u64, raw_api_key: &str) -> Self {
        let mac_key = api_key_hash(raw_api_key);
        let hmac = compute_hmac(&mac_key, &operator_id, command, issued_at);
        Self {
            operator_id,
            command: command.to_string(),
            issued_at,
            hmac: hmac.to_vec(),
        }
    }
}

/// A command that passed authentication. This core does not execute it;
/// the caller decides how to act.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticatedCommand {
    pub operator_id: Uuid,
    pub command: String,
    pub issued_at: u64,
}

fn canonical_command_bytes(operator_id: &Uuid, command: &str, issued_at: u64) -> Vec<u8> {
    let mut out = Vec::new();
    push_bytes(&mut out, DOMAIN_COMMAND.as_bytes());
    push_bytes(&mut out, operator_id.to_string().as_bytes());
    push_bytes(&mut out, command.as_bytes());
    out.extend_from_slice(&issued_at.to_le_bytes());
    out
}

/// HMAC-SHA256 over the canonical command bytes, keyed by the value both
/// sides derive from the operator credential.
pub fn compute_hmac(
    mac_key: &[u8; 32],
    operator_id: &Uuid,
    command: &str,
    issued_at: u64,
) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(&canonical_command_bytes(operator_id, command, issued_at));
    mac.finalize().into_bytes().into()
}

/// Verifies authenticity and freshness of inbound operator commands.
///
/// Every authentication outcome, accepted or rejected, lands on the audit
/// chain; MAC keys and MAC values never do.
pub struct CommandAuthenticator<'a> {
    chain: &'a AuditChain,
    operators: HashMap<Uuid, [u8; 32]>,
    replay_window: Duration,
    accepted: Mutex<HashSet<(Uuid, u64)>>,
}

impl<'a> CommandAuthenticator<'a> {
    pub fn new(chain: &'a AuditChain, replay_window: Duration) -> Result<Self> {
        if replay_window < MIN_REPLAY_WINDOW {
            return Err(anyhow!(
                "replay window must be at least {} second(s)",
                MIN_REPLAY_WINDOW.as_secs()
            ));
        }
        Ok(Self {
            chain,
            operators: HashMap::new(),
            replay_window,
            accepted: Mutex::new(HashSet::new()),
        })
    }

    /// Authenticator primed with every credential on record.
    pub fn from_store(
        chain: &'a AuditChain,
        store: &IdentityStore,
        replay_window: Duration,
    ) -> Result<Self> {
        let mut authenticator = Self::new(chain, replay_window)?;
        for credential in store.operators()? {
            authenticator.register_credential(&credential);
        }
        Ok(authenticator)
    }

    pub fn register_credential(&mut self, credential: &OperatorCredential) {
        self.operators
            .insert(credential.operator_id, credential.api_key_hash);
    }

    /// Authenticates one envelope.
    ///
    /// Rejections come back as a downcastable [`AuthError`]; infrastructure
    /// failures (audit append, clock) surface as ordinary errors.
    pub fn authenticate(&self, envelope: &CommandEnvelope) -> Result<AuthenticatedCommand> {
        let now = now_s()?;
        match self.evaluate(envelope, now)? {
            Ok(command) => {
                self.chain.append(
                    EVENT_COMMAND_ACCEPTED,
                    serde_json::json!({
                        "operator_id": command.operator_id.to_string(),
                        "command": command.command,
                        "issued_at": command.issued_at,
                    }),
                )?;
                Ok(command)
            }
            Err(reason) => {
                log::warn!(
                    "command rejected for operator {}: {}",
                    envelope.operator_id,
                    reason
                );
                self.chain.append(
                    EVENT_COMMAND_REJECTED,
                    serde_json::json!({
                        "operator_id": envelope.operator_id.to_string(),
                        "issued_at": envelope.issued_at,
                        "reason": reason.code(),
                    }),
                )?;
                Err(reason.into())
            }
        }
    }

    fn evaluate(
        &self,
        envelope: &CommandEnvelope,
        now: u64,
    ) -> Result<std::result::Result<AuthenticatedCommand, AuthError>> {
        let Some(mac_key) = self.operators.get(&envelope.operator_id) else {
            return Ok(Err(AuthError::UnknownOperator));
        };

        // freshness first: expired envelopes never touch key material
        let age_s = now.abs_diff(envelope.issued_at);
        if age_s > self.replay_window.as_secs() {
            return Ok(Err(AuthError::Expired { age_s }));
        }

        let mut mac = HmacSha256::new_from_slice(mac_key)
            .map_err(|_| anyhow!("hmac key construction failed"))?;
        mac.update(&canonical_command_bytes(
            &envelope.operator_id,
            &envelope.command,
            envelope.issued_at,
        ));
        if mac.verify_slice(&envelope.hmac).is_err() {
            return Ok(Err(AuthError::InvalidSignature));
        }

        let mut accepted = self
            .accepted
            .lock()
            .map_err(|_| anyhow!("replay cache lock poisoned"))?;
        let window_s = self.replay_window.as_secs();
        accepted.retain(|(_, issued_at)| now.abs_diff(*issued_at) <= window_s);
        if !accepted.insert((envelope.operator_id, envelope.issued_at)) {
            return Ok(Err(AuthError::ReplayDetected));
        }

        Ok(Ok(AuthenticatedCommand {
            operator_id: envelope.operator_id,
            command: envelope.command.clone(),
            issued_at: envelope.issued_at,
        }))
    }
}
