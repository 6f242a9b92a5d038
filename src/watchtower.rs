//! Watchtower core: event ingestion, closure lifecycle, signature-state
//! upserts and dispute triggering.
//!
//! All durable state lives in the store; this module owns the routing and
//! policy decisions. Dispute idempotency hangs off the trigger txid, so
//! replayed payloads and racing upserts converge on the same attempt set.

use serde::Serialize;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::address::PrincipalId;
use crate::db::{Store, StoreCounts};
use crate::dispute::{DisputeExecutor, DisputeRequest};
use crate::error::{Result, WatchtowerError};
use crate::events::EventParser;
use crate::types::{
    dispute_attempt_id, now_rfc3339, parse_u128, ClosureRecord, DisputeAttemptRecord,
    ObservedPipeRecord, PipeEvent, RecordedEvent, SignatureStateInput, SignatureStateRecord,
};
use crate::verifier::SignatureVerifier;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub observed_events: usize,
    pub active_closures: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub stored: bool,
    pub replaced: bool,
    pub reason: Option<String>,
    pub state: SignatureStateRecord,
}

/// One row of the merged `/pipes` view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedPipeEntry {
    pub state_id: String,
    pub contract_id: String,
    pub pipe_id: String,
    pub source: &'static str,
    pub nonce: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipe: Option<ObservedPipeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_state: Option<SignatureStateRecord>,
}

pub struct Watchtower {
    store: Store,
    parser: EventParser,
    verifier: Arc<dyn SignatureVerifier>,
    executor: Arc<dyn DisputeExecutor>,
    watched_principals: Vec<PrincipalId>,
    dispute_only_beneficial: bool,
}

impl Watchtower {
    pub fn new(
        store: Store,
        parser: EventParser,
        verifier: Arc<dyn SignatureVerifier>,
        executor: Arc<dyn DisputeExecutor>,
        watched_principals: Vec<PrincipalId>,
        dispute_only_beneficial: bool,
    ) -> Self {
        Self {
            store,
            parser,
            verifier,
            executor,
            watched_principals,
            dispute_only_beneficial,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ---- ingestion ----

    /// Parse a chain-observer payload and apply every pipe event, in
    /// envelope order. Each event's mutations complete before the next is
    /// handled.
    pub async fn ingest(&self, payload: &Json, source: &str) -> Result<IngestOutcome> {
        let events = self.parser.parse(payload);
        for event in &events {
            self.store
                .record_event(&RecordedEvent {
                    event: event.clone(),
                    observed_at: now_rfc3339(),
                    source: source.to_string(),
                })
                .await?;
            self.route_event(event).await?;
        }
        Ok(IngestOutcome {
            observed_events: events.len(),
            active_closures: self.store.counts().await?.closures,
        })
    }

    async fn route_event(&self, event: &PipeEvent) -> Result<()> {
        match event.event_name.as_str() {
            "create-pipe" | "fund-pipe" | "deposit" | "withdraw" => {
                self.apply_observed(event).await?;
                // A funded pipe is open again; drop any stale waiting period.
                if let Some(pipe_id) = event.pipe_key.as_ref().map(|k| k.pipe_id()) {
                    if self.store.delete_closure(&pipe_id).await? {
                        debug!(pipe_id, event = %event.event_name, "closure cleared by re-open");
                    }
                }
            }
            "force-cancel" | "force-close" => {
                self.apply_observed(event).await?;
                if let Some(closure) = closure_from_event(event) {
                    info!(
                        pipe_id = %closure.pipe_id,
                        closer = ?closure.closer,
                        expires_at = ?closure.expires_at,
                        "closure observed"
                    );
                    self.store.upsert_closure(&closure).await?;
                    self.respond_to_closure(&closure).await?;
                }
            }
            "finalize" | "dispute-closure" | "close-pipe" => {
                if let Some(pipe_id) = event.pipe_key.as_ref().map(|k| k.pipe_id()) {
                    self.store.delete_closure(&pipe_id).await?;
                    let state_id = format!("{}|{}", event.contract_id, pipe_id);
                    match &event.pipe {
                        Some(pipe) if pipe.balance_1 != 0 || pipe.balance_2 != 0 => {
                            self.apply_observed(event).await?;
                        }
                        // A fully reset pipe leaves no observed row behind.
                        _ => {
                            self.store.delete_observed_pipe(&state_id).await?;
                        }
                    }
                }
            }
            _ => {
                self.apply_observed(event).await?;
            }
        }
        Ok(())
    }

    async fn apply_observed(&self, event: &PipeEvent) -> Result<()> {
        let (Some(pipe_key), Some(pipe)) = (&event.pipe_key, &event.pipe) else {
            return Ok(());
        };
        let pipe_id = pipe_key.pipe_id();
        let record = ObservedPipeRecord {
            state_id: format!("{}|{}", event.contract_id, pipe_id),
            contract_id: event.contract_id.clone(),
            pipe_id,
            pipe_key: pipe_key.clone(),
            pipe: pipe.clone(),
            event_name: event.event_name.clone(),
            txid: event.txid.clone(),
            block_height: event.block_height,
            updated_at: now_rfc3339(),
        };
        self.store.upsert_observed_pipe(&record).await
    }

    /// Sweep closures whose waiting period has elapsed. Closures without an
    /// expiry stay until a terminating event arrives.
    pub async fn ingest_burn_block(&self, burn_height: u64, source: &str) -> Result<usize> {
        let mut expired = 0usize;
        for closure in self.store.list_closures().await? {
            let Some(expires_at) = closure.expires_at else {
                continue;
            };
            if expires_at >= burn_height {
                continue;
            }
            self.store.delete_closure(&closure.pipe_id).await?;
            expired += 1;
            self.store
                .record_event(&RecordedEvent {
                    event: PipeEvent {
                        contract_id: closure.contract_id.clone(),
                        topic: "print".to_string(),
                        txid: None,
                        block_height: Some(burn_height),
                        block_hash: None,
                        event_index: None,
                        event_name: "expired-closure".to_string(),
                        sender: None,
                        pipe_key: Some(closure.pipe_key.clone()),
                        pipe: None,
                    },
                    observed_at: now_rfc3339(),
                    source: source.to_string(),
                })
                .await?;
            info!(pipe_id = %closure.pipe_id, burn_height, "closure expired");
        }
        Ok(expired)
    }

    // ---- closure response ----

    /// Evaluate held signature states against a fresh or re-examined
    /// closure, dispatching at most one dispute per trigger.
    async fn respond_to_closure(&self, closure: &ClosureRecord) -> Result<()> {
        let attempt_id = dispute_attempt_id(
            &closure.contract_id,
            &closure.pipe_id,
            closure.trigger_txid.as_deref(),
        );
        if self.store.get_dispute_attempt(&attempt_id).await?.is_some() {
            return Ok(());
        }

        let closure_nonce = match parse_u128(&closure.nonce) {
            Ok(n) => n,
            Err(_) => {
                warn!(pipe_id = %closure.pipe_id, nonce = %closure.nonce, "closure nonce unparseable");
                return Ok(());
            }
        };
        let observed = self
            .store
            .get_observed_pipe(&format!("{}|{}", closure.contract_id, closure.pipe_id))
            .await?;

        let mut best: Option<(u128, SignatureStateRecord)> = None;
        for state in self
            .store
            .signature_states_for_pipe(&closure.contract_id, &closure.pipe_id)
            .await?
        {
            if closure.closer.as_deref() == Some(state.for_principal.as_str()) {
                continue;
            }
            let Ok(nonce) = parse_u128(&state.nonce) else {
                continue;
            };
            if nonce <= closure_nonce {
                continue;
            }
            if (state.beneficial_only || self.dispute_only_beneficial)
                && !self.state_is_beneficial(&state, observed.as_ref())
            {
                debug!(state_id = %state.state_id, "skipping non-beneficial dispute candidate");
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_nonce, best_state)) => {
                    nonce > *best_nonce
                        || (nonce == *best_nonce && state.updated_at > best_state.updated_at)
                }
            };
            if better {
                best = Some((nonce, state));
            }
        }

        let Some((_, candidate)) = best else {
            return Ok(());
        };

        let request = DisputeRequest {
            state: candidate.clone(),
            closure: closure.clone(),
            trigger_txid: closure.trigger_txid.clone(),
        };
        let (success, dispute_txid, error) = match self.executor.submit_dispute(&request).await {
            Ok(outcome) => {
                info!(txid = %outcome.txid, pipe_id = %closure.pipe_id, "dispute submitted");
                (true, Some(outcome.txid), None)
            }
            Err(e) => {
                warn!(error = %e, pipe_id = %closure.pipe_id, "dispute submission failed");
                (false, None, Some(e.to_string()))
            }
        };
        self.store
            .insert_dispute_attempt(&DisputeAttemptRecord {
                attempt_id,
                contract_id: closure.contract_id.clone(),
                pipe_id: closure.pipe_id.clone(),
                for_principal: candidate.for_principal.clone(),
                trigger_txid: closure.trigger_txid.clone(),
                success,
                dispute_txid,
                error,
                created_at: now_rfc3339(),
            })
            .await
    }

    /// The beneficial gate: the held balance must strictly exceed what the
    /// closure snapshot would pay out to the same principal.
    fn state_is_beneficial(
        &self,
        state: &SignatureStateRecord,
        observed: Option<&ObservedPipeRecord>,
    ) -> bool {
        let Some(observed) = observed else {
            // Without a snapshot there is nothing to improve on.
            return false;
        };
        let Ok(my_balance) = parse_u128(&state.my_balance) else {
            return false;
        };
        let Ok(for_principal) = PrincipalId::parse(&state.for_principal) else {
            return false;
        };
        match observed.pipe.balance_for(&observed.pipe_key, &for_principal) {
            Some(closure_balance) => my_balance > closure_balance,
            None => false,
        }
    }

    // ---- signature states ----

    pub async fn upsert_signature_state(
        &self,
        input: SignatureStateInput,
        skip_verification: bool,
    ) -> Result<UpsertOutcome> {
        let pipe_key = input.validate()?;

        if !self.watched_principals.is_empty()
            && !self.watched_principals.contains(&input.for_principal)
        {
            return Err(WatchtowerError::PrincipalNotWatched(
                input.for_principal.to_string(),
            ));
        }

        if !skip_verification {
            let verification = self.verifier.verify_signature_state(&input).await;
            if !verification.valid {
                return Err(WatchtowerError::SignatureInvalid(
                    verification
                        .reason
                        .unwrap_or_else(|| "invalid-signature".to_string()),
                ));
            }
        }

        let state_id = input.state_id(&pipe_key);
        let existing = self.store.get_signature_state(&state_id).await?;
        let replaced = if let Some(existing) = existing {
            let existing_nonce = parse_u128(&existing.nonce).unwrap_or(0);
            if existing_nonce >= input.nonce {
                return Ok(UpsertOutcome {
                    stored: false,
                    replaced: false,
                    reason: Some("nonce-too-low".to_string()),
                    state: existing,
                });
            }
            true
        } else {
            false
        };

        let beneficial_only = input
            .beneficial_only
            .unwrap_or(self.dispute_only_beneficial);
        let record = SignatureStateRecord::from_input(&input, &pipe_key, beneficial_only);
        self.store.upsert_signature_state(&record).await?;
        debug!(state_id = %record.state_id, nonce = %record.nonce, replaced, "signature state stored");

        // A newer state may supersede a closure already in progress.
        if let Some(closure) = self.store.get_closure(&pipe_key.pipe_id()).await? {
            self.respond_to_closure(&closure).await?;
        }

        Ok(UpsertOutcome {
            stored: true,
            replaced,
            reason: None,
            state: record,
        })
    }

    // ---- views ----

    pub async fn counts(&self) -> Result<StoreCounts> {
        self.store.counts().await
    }

    /// Merged on-chain/off-chain view keyed by `contractId|pipeId`: the
    /// higher nonce wins, ties go to the fresher row, then to the on-chain
    /// side. Sorted by nonce then recency, descending.
    pub async fn merged_pipes(
        &self,
        limit: usize,
        principal: Option<&str>,
    ) -> Result<Vec<MergedPipeEntry>> {
        let mut merged: std::collections::HashMap<String, MergedPipeEntry> =
            std::collections::HashMap::new();

        for record in self.store.list_observed_pipes().await? {
            if let Some(filter) = principal {
                if !observed_involves(&record, filter) {
                    continue;
                }
            }
            let key = format!("{}|{}", record.contract_id, record.pipe_id);
            let entry = MergedPipeEntry {
                state_id: key.clone(),
                contract_id: record.contract_id.clone(),
                pipe_id: record.pipe_id.clone(),
                source: "onchain",
                nonce: record.pipe.nonce.to_string(),
                updated_at: record.updated_at.clone(),
                pipe: Some(record),
                signature_state: None,
            };
            merge_entry(&mut merged, key, entry);
        }

        for record in self.store.list_signature_states(i64::MAX).await? {
            if let Some(filter) = principal {
                if record.for_principal != filter && record.with_principal != filter {
                    continue;
                }
            }
            let key = format!("{}|{}", record.contract_id, record.pipe_id);
            let entry = MergedPipeEntry {
                state_id: key.clone(),
                contract_id: record.contract_id.clone(),
                pipe_id: record.pipe_id.clone(),
                source: "signature-state",
                nonce: record.nonce.clone(),
                updated_at: record.updated_at.clone(),
                pipe: None,
                signature_state: Some(record),
            };
            merge_entry(&mut merged, key, entry);
        }

        let mut entries: Vec<MergedPipeEntry> = merged.into_values().collect();
        entries.sort_by(|a, b| {
            let a_nonce = parse_u128(&a.nonce).unwrap_or(0);
            let b_nonce = parse_u128(&b.nonce).unwrap_or(0);
            b_nonce
                .cmp(&a_nonce)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        entries.truncate(limit);
        Ok(entries)
    }
}

fn observed_involves(record: &ObservedPipeRecord, principal: &str) -> bool {
    record.pipe_key.principal_1.to_string() == principal
        || record.pipe_key.principal_2.to_string() == principal
}

/// Keep the better of two entries for the same pipe: higher nonce, then
/// fresher, then on-chain.
fn merge_entry(
    merged: &mut std::collections::HashMap<String, MergedPipeEntry>,
    key: String,
    entry: MergedPipeEntry,
) {
    match merged.get(&key) {
        None => {
            merged.insert(key, entry);
        }
        Some(existing) => {
            let existing_nonce = parse_u128(&existing.nonce).unwrap_or(0);
            let entry_nonce = parse_u128(&entry.nonce).unwrap_or(0);
            let replace = entry_nonce > existing_nonce
                || (entry_nonce == existing_nonce
                    && (entry.updated_at > existing.updated_at
                        || (entry.updated_at == existing.updated_at
                            && entry.source == "onchain"
                            && existing.source != "onchain")));
            if replace {
                merged.insert(key, entry);
            }
        }
    }
}

/// Build the closure record for a force-cancel / force-close event.
fn closure_from_event(event: &PipeEvent) -> Option<ClosureRecord> {
    let pipe_key = event.pipe_key.as_ref()?;
    let pipe = event.pipe.as_ref()?;
    let closer = pipe
        .closer
        .as_ref()
        .or(event.sender.as_ref())
        .map(|p| p.to_string());
    Some(ClosureRecord {
        pipe_id: pipe_key.pipe_id(),
        contract_id: event.contract_id.clone(),
        pipe_key: pipe_key.clone(),
        closer,
        expires_at: pipe.expires_at,
        nonce: pipe.nonce.to_string(),
        event_name: event.event_name.clone(),
        trigger_txid: event.txid.clone(),
        block_height: event.block_height,
        updated_at: now_rfc3339(),
    })
}
