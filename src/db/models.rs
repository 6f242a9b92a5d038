//! Row types bridging SQLite columns and the domain records.
//!
//! Pipe keys and snapshots are stored as JSON TEXT; a row that fails to
//! re-parse surfaces as a decode error rather than a panic.

use sqlx::FromRow;

use crate::types::{
    ClosureRecord, DisputeAttemptRecord, ObservedPipeRecord, RecordedEvent, SignatureStateRecord,
};

fn decode_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    what: &str,
) -> Result<T, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| {
        sqlx::Error::Decode(format!("corrupt {what} column: {e}").into())
    })
}

#[derive(Debug, Clone, FromRow)]
pub struct ClosureRow {
    pub pipe_id: String,
    pub contract_id: String,
    pub pipe_key: String,
    pub closer: Option<String>,
    pub expires_at: Option<i64>,
    pub nonce: String,
    pub event_name: String,
    pub trigger_txid: Option<String>,
    pub block_height: Option<i64>,
    pub updated_at: String,
}

impl ClosureRow {
    pub fn into_record(self) -> Result<ClosureRecord, sqlx::Error> {
        Ok(ClosureRecord {
            pipe_id: self.pipe_id,
            contract_id: self.contract_id,
            pipe_key: decode_json(&self.pipe_key, "closures.pipe_key")?,
            closer: self.closer,
            expires_at: self.expires_at.map(|v| v as u64),
            nonce: self.nonce,
            event_name: self.event_name,
            trigger_txid: self.trigger_txid,
            block_height: self.block_height.map(|v| v as u64),
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ObservedPipeRow {
    pub state_id: String,
    pub contract_id: String,
    pub pipe_id: String,
    pub pipe_key: String,
    pub pipe: String,
    pub event_name: String,
    pub txid: Option<String>,
    pub block_height: Option<i64>,
    pub updated_at: String,
}

impl ObservedPipeRow {
    pub fn into_record(self) -> Result<ObservedPipeRecord, sqlx::Error> {
        Ok(ObservedPipeRecord {
            state_id: self.state_id,
            contract_id: self.contract_id,
            pipe_id: self.pipe_id,
            pipe_key: decode_json(&self.pipe_key, "observed_pipes.pipe_key")?,
            pipe: decode_json(&self.pipe, "observed_pipes.pipe")?,
            event_name: self.event_name,
            txid: self.txid,
            block_height: self.block_height.map(|v| v as u64),
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SignatureStateRow {
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
    pub action: i64,
    pub actor: String,
    pub secret: Option<String>,
    pub valid_after: Option<String>,
    pub beneficial_only: bool,
    pub updated_at: String,
}

impl From<SignatureStateRow> for SignatureStateRecord {
    fn from(row: SignatureStateRow) -> Self {
        SignatureStateRecord {
            state_id: row.state_id,
            contract_id: row.contract_id,
            pipe_id: row.pipe_id,
            for_principal: row.for_principal,
            with_principal: row.with_principal,
            token: row.token,
            amount: row.amount,
            my_balance: row.my_balance,
            their_balance: row.their_balance,
            my_signature: row.my_signature,
            their_signature: row.their_signature,
            nonce: row.nonce,
            action: row.action as u8,
            actor: row.actor,
            secret: row.secret,
            valid_after: row.valid_after,
            beneficial_only: row.beneficial_only,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DisputeAttemptRow {
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

impl From<DisputeAttemptRow> for DisputeAttemptRecord {
    fn from(row: DisputeAttemptRow) -> Self {
        DisputeAttemptRecord {
            attempt_id: row.attempt_id,
            contract_id: row.contract_id,
            pipe_id: row.pipe_id,
            for_principal: row.for_principal,
            trigger_txid: row.trigger_txid,
            success: row.success,
            dispute_txid: row.dispute_txid,
            error: row.error,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RecentEventRow {
    pub payload: String,
}

impl RecentEventRow {
    pub fn into_record(self) -> Result<RecordedEvent, sqlx::Error> {
        decode_json(&self.payload, "recent_events.payload")
    }
}
