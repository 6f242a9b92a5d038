//! Domain model: pipe identity, snapshots, events, signature states.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::address::PrincipalId;
use crate::error::WatchtowerError;

impl Serialize for PrincipalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PrincipalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PrincipalId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse an unsigned 128-bit decimal, tolerating a leading `u` (Clarity
/// literal form) and surrounding whitespace.
pub fn parse_u128(input: &str) -> Result<u128, WatchtowerError> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('u').unwrap_or(trimmed);
    trimmed
        .parse::<u128>()
        .map_err(|_| WatchtowerError::Validation(format!("expected unsigned integer, got {input:?}")))
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Decode a fixed-length hex field (with or without `0x`).
pub fn decode_hex_exact(input: &str, len: usize, what: &str) -> Result<Vec<u8>, WatchtowerError> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(stripped)
        .map_err(|_| WatchtowerError::Validation(format!("{what} is not valid hex")))?;
    if bytes.len() != len {
        return Err(WatchtowerError::Validation(format!(
            "{what} must be {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Serde adapters: u128 amounts travel as decimal strings in JSON, but
/// submitters may also send plain numbers.
pub mod u128_dec {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        FlexibleUint::deserialize(deserializer)?.into_u128()
    }
}

pub mod u128_dec_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<u128>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u128>, D::Error> {
        Ok(match Option::<FlexibleUint>::deserialize(deserializer)? {
            Some(raw) => Some(raw.into_u128()?),
            None => None,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleUint {
    Number(u64),
    Text(String),
}

impl FlexibleUint {
    fn into_u128<E: serde::de::Error>(self) -> Result<u128, E> {
        match self {
            FlexibleUint::Number(n) => Ok(n as u128),
            FlexibleUint::Text(s) => parse_u128(&s).map_err(E::custom),
        }
    }
}

/// Canonical identity of a pipe. `token: None` denotes the native coin.
/// The principal pair is ordered by the lexicographic byte comparison of the
/// principals' contract-format serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeKey {
    pub token: Option<PrincipalId>,
    #[serde(rename = "principal-1")]
    pub principal_1: PrincipalId,
    #[serde(rename = "principal-2")]
    pub principal_2: PrincipalId,
}

impl PipeKey {
    pub fn canonical(
        a: PrincipalId,
        b: PrincipalId,
        token: Option<PrincipalId>,
    ) -> Result<Self, WatchtowerError> {
        if a == b {
            return Err(WatchtowerError::Validation(format!(
                "pipe principals must differ, got {a} twice"
            )));
        }
        let (principal_1, principal_2) = if a.serialize_clarity() <= b.serialize_clarity() {
            (a, b)
        } else {
            (b, a)
        };
        Ok(Self {
            token,
            principal_1,
            principal_2,
        })
    }

    /// Stable string identity: `token_or_stx|principal-1|principal-2`.
    pub fn pipe_id(&self) -> String {
        let token = self
            .token
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "stx".to_string());
        format!("{token}|{}|{}", self.principal_1, self.principal_2)
    }

    /// The counterparty of `principal` inside this pipe, if it is a member.
    pub fn other(&self, principal: &PrincipalId) -> Option<&PrincipalId> {
        if &self.principal_1 == principal {
            Some(&self.principal_2)
        } else if &self.principal_2 == principal {
            Some(&self.principal_1)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeposit {
    #[serde(with = "u128_dec")]
    pub amount: u128,
    #[serde(rename = "burn-height")]
    pub burn_height: u64,
}

/// Last observed on-chain pipe state. `expires_at: None` means no closure is
/// pending (the contract's sentinel maximum decodes to `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeSnapshot {
    #[serde(rename = "balance-1", with = "u128_dec")]
    pub balance_1: u128,
    #[serde(rename = "balance-2", with = "u128_dec")]
    pub balance_2: u128,
    #[serde(rename = "pending-1", default)]
    pub pending_1: Option<PendingDeposit>,
    #[serde(rename = "pending-2", default)]
    pub pending_2: Option<PendingDeposit>,
    #[serde(rename = "expires-at", default)]
    pub expires_at: Option<u64>,
    #[serde(with = "u128_dec")]
    pub nonce: u128,
    #[serde(default)]
    pub closer: Option<PrincipalId>,
}

impl PipeSnapshot {
    /// Balance accruing to `principal` under canonical orientation.
    pub fn balance_for(&self, key: &PipeKey, principal: &PrincipalId) -> Option<u128> {
        if &key.principal_1 == principal {
            Some(self.balance_1)
        } else if &key.principal_2 == principal {
            Some(self.balance_2)
        } else {
            None
        }
    }
}

/// Decode the contract's expiry field: values at or beyond the u64 range are
/// the "no closure" sentinel.
pub fn expires_at_from_uint(raw: u128) -> Option<u64> {
    if raw >= u64::MAX as u128 {
        None
    } else {
        Some(raw as u64)
    }
}

/// Normalized print event from the chain observer feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeEvent {
    pub contract_id: String,
    pub topic: String,
    pub txid: Option<String>,
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    pub event_index: Option<u64>,
    pub event_name: String,
    pub sender: Option<PrincipalId>,
    pub pipe_key: Option<PipeKey>,
    pub pipe: Option<PipeSnapshot>,
}

impl PipeEvent {
    /// One event per (txid, index, contract, name, sender, pipe).
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.txid.as_deref().unwrap_or(""),
            self.event_index.map(|i| i.to_string()).unwrap_or_default(),
            self.contract_id,
            self.event_name,
            self.sender
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            self.pipe_key
                .as_ref()
                .map(|k| k.pipe_id())
                .unwrap_or_default(),
        )
    }
}

/// State transition kinds carried inside signature states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PipeAction {
    Close = 0,
    Transfer = 1,
    Deposit = 2,
    Withdraw = 3,
}

impl PipeAction {
    pub fn as_u128(self) -> u128 {
        self as u8 as u128
    }
}

impl From<PipeAction> for u8 {
    fn from(action: PipeAction) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for PipeAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PipeAction::Close),
            1 => Ok(PipeAction::Transfer),
            2 => Ok(PipeAction::Deposit),
            3 => Ok(PipeAction::Withdraw),
            other => Err(format!("invalid action {other}, expected 0..=3")),
        }
    }
}

impl fmt::Display for PipeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipeAction::Close => "close",
            PipeAction::Transfer => "transfer",
            PipeAction::Deposit => "deposit",
            PipeAction::Withdraw => "withdraw",
        };
        write!(f, "{name}")
    }
}

/// An off-chain signature state as submitted over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStateInput {
    pub contract_id: String,
    pub for_principal: PrincipalId,
    pub with_principal: PrincipalId,
    #[serde(default)]
    pub token: Option<PrincipalId>,
    #[serde(with = "u128_dec", default)]
    pub amount: u128,
    #[serde(with = "u128_dec")]
    pub my_balance: u128,
    #[serde(with = "u128_dec")]
    pub their_balance: u128,
    pub my_signature: String,
    pub their_signature: String,
    #[serde(with = "u128_dec")]
    pub nonce: u128,
    pub action: PipeAction,
    pub actor: PrincipalId,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, with = "u128_dec_opt")]
    pub valid_after: Option<u128>,
    #[serde(default)]
    pub beneficial_only: Option<bool>,
}

impl SignatureStateInput {
    /// Shape/type validation per the data-model invariants. Returns the
    /// canonical pipe key.
    pub fn validate(&self) -> Result<PipeKey, WatchtowerError> {
        let contract = PrincipalId::parse(&self.contract_id)?;
        if !contract.is_contract() {
            return Err(WatchtowerError::Validation(format!(
                "contractId must be a contract principal, got {}",
                self.contract_id
            )));
        }
        decode_hex_exact(&self.my_signature, 65, "mySignature")?;
        decode_hex_exact(&self.their_signature, 65, "theirSignature")?;
        if let Some(secret) = &self.secret {
            decode_hex_exact(secret, 32, "secret")?;
        }
        if self.action != PipeAction::Transfer && self.action != PipeAction::Close {
            if self.amount == 0 {
                return Err(WatchtowerError::Validation(format!(
                    "amount must be non-zero for {} states",
                    self.action
                )));
            }
        } else if self.amount != 0 {
            return Err(WatchtowerError::Validation(format!(
                "amount must be zero for {} states",
                self.action
            )));
        }
        PipeKey::canonical(
            self.for_principal.clone(),
            self.with_principal.clone(),
            self.token.clone(),
        )
    }

    /// Balances re-oriented to canonical principal order.
    pub fn canonical_balances(&self, pipe_key: &PipeKey) -> (u128, u128) {
        if pipe_key.principal_1 == self.for_principal {
            (self.my_balance, self.their_balance)
        } else {
            (self.their_balance, self.my_balance)
        }
    }

    /// Unique state identity: `contractId|pipeId|forPrincipal`.
    pub fn state_id(&self, pipe_key: &PipeKey) -> String {
        format!(
            "{}|{}|{}",
            self.contract_id,
            pipe_key.pipe_id(),
            self.for_principal
        )
    }
}

/// Stored row types. Amount-bearing fields stay decimal strings end to end;
/// the store and the API never re-interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStateRecord {
    pub state_id: String,
    pub contract_id: String,
    pub pipe_id: String,
    pub for_principal: String,
    pub with_principal: String,
    pub token: Option<String>,
    pub amount: String,
    pub my_balance: String,
    pub their_balance: String,
    pub my_signature: String,
    pub their_signature: String,
    pub nonce: String,
    pub action: u8,
    pub actor: String,
    pub secret: Option<String>,
    pub valid_after: Option<String>,
    pub beneficial_only: bool,
    pub updated_at: String,
}

impl SignatureStateRecord {
    pub fn from_input(
        input: &SignatureStateInput,
        pipe_key: &PipeKey,
        beneficial_only: bool,
    ) -> Self {
        Self {
            state_id: input.state_id(pipe_key),
            contract_id: input.contract_id.clone(),
            pipe_id: pipe_key.pipe_id(),
            for_principal: input.for_principal.to_string(),
            with_principal: input.with_principal.to_string(),
            token: input.token.as_ref().map(|t| t.to_string()),
            amount: input.amount.to_string(),
            my_balance: input.my_balance.to_string(),
            their_balance: input.their_balance.to_string(),
            my_signature: input.my_signature.clone(),
            their_signature: input.their_signature.clone(),
            nonce: input.nonce.to_string(),
            action: input.action.into(),
            actor: input.actor.to_string(),
            secret: input.secret.clone(),
            valid_after: input.valid_after.map(|v| v.to_string()),
            beneficial_only,
            updated_at: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedPipeRecord {
    pub state_id: String,
    pub contract_id: String,
    pub pipe_id: String,
    pub pipe_key: PipeKey,
    pub pipe: PipeSnapshot,
    pub event_name: String,
    pub txid: Option<String>,
    pub block_height: Option<u64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureRecord {
    pub pipe_id: String,
    pub contract_id: String,
    pub pipe_key: PipeKey,
    pub closer: Option<String>,
    pub expires_at: Option<u64>,
    pub nonce: String,
    pub event_name: String,
    pub trigger_txid: Option<String>,
    pub block_height: Option<u64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeAttemptRecord {
    pub attempt_id: String,
    pub contract_id: String,
    pub pipe_id: String,
    pub for_principal: String,
    pub trigger_txid: Option<String>,
    pub success: bool,
    pub dispute_txid: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

/// Idempotency key for closure responses: one attempt per trigger txid.
pub fn dispute_attempt_id(contract_id: &str, pipe_id: &str, trigger_txid: Option<&str>) -> String {
    format!(
        "{contract_id}|{pipe_id}|{}",
        trigger_txid.unwrap_or("no-txid")
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    #[serde(flatten)]
    pub event: PipeEvent,
    pub observed_at: String,
    pub source: String,
}
