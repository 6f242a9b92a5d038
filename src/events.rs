//! Chain-observer envelope parsing.
//!
//! Upstream node versions disagree on where print events live inside the
//! `/new_block` payload: some nest them under `contract_event`, older ones
//! under `contract_log`, and replayed feeds flatten them into the carrier
//! object. The walker tags each candidate with its shape, then a single
//! normalization path produces `PipeEvent`s.

use serde_json::Value as Json;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::address::PrincipalId;
use crate::clarity::ClarityValue;
use crate::types::{
    expires_at_from_uint, parse_u128, PendingDeposit, PipeEvent, PipeKey, PipeSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    ContractEvent,
    ContractLog,
    Flat,
}

struct Candidate<'a> {
    kind: CandidateKind,
    /// Object carrying `contract_identifier`, `topic` and the raw value.
    payload: &'a Json,
    /// Enclosing object carrying txid / event_index.
    carrier: &'a Json,
}

pub struct EventParser {
    watched_contracts: Vec<String>,
}

impl EventParser {
    pub fn new(watched_contracts: Vec<String>) -> Self {
        Self { watched_contracts }
    }

    /// Walk a received envelope and return the deduplicated, ordered pipe
    /// events it contains. Malformed candidates are skipped, never fatal.
    pub fn parse(&self, envelope: &Json) -> Vec<PipeEvent> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for candidate in collect_candidates(envelope) {
            let Some(contract_id) = contract_identifier(candidate.payload) else {
                continue;
            };
            if !self.contract_is_watched(&contract_id) {
                continue;
            }
            if let Some(topic) = candidate.payload.get("topic").and_then(Json::as_str) {
                if topic != "print" {
                    continue;
                }
            }
            match normalize_candidate(&candidate, &contract_id, envelope) {
                Some(event) => {
                    if seen.insert(event.dedupe_key()) {
                        events.push(event);
                    }
                }
                None => {
                    debug!(
                        contract_id,
                        kind = ?candidate.kind,
                        "skipping undecodable contract event"
                    );
                }
            }
        }
        events
    }

    /// Exact match against the configured set; with no configuration, accept
    /// the protocol's default contract family.
    fn contract_is_watched(&self, contract_id: &str) -> bool {
        if !self.watched_contracts.is_empty() {
            return self.watched_contracts.iter().any(|c| c == contract_id);
        }
        match contract_id.split_once('.') {
            Some((_, name)) => name == "stackflow" || name.starts_with("stackflow-"),
            None => false,
        }
    }
}

/// Breadth-first traversal visiting each node at most once.
fn collect_candidates(root: &Json) -> Vec<Candidate<'_>> {
    let mut candidates = Vec::new();
    let mut queue: VecDeque<&Json> = VecDeque::new();
    queue.push_back(root);

    while let Some(node) = queue.pop_front() {
        match node {
            Json::Object(map) => {
                let mut claimed: Option<&Json> = None;
                if let Some(sub) = map.get("contract_event").filter(|v| v.is_object()) {
                    candidates.push(Candidate {
                        kind: CandidateKind::ContractEvent,
                        payload: sub,
                        carrier: node,
                    });
                    claimed = Some(sub);
                } else if let Some(sub) = map.get("contract_log").filter(|v| v.is_object()) {
                    candidates.push(Candidate {
                        kind: CandidateKind::ContractLog,
                        payload: sub,
                        carrier: node,
                    });
                    claimed = Some(sub);
                } else if map.contains_key("contract_identifier")
                    && map.contains_key("topic")
                    && (map.contains_key("raw_value")
                        || map.contains_key("rawValue")
                        || map.contains_key("value"))
                {
                    candidates.push(Candidate {
                        kind: CandidateKind::Flat,
                        payload: node,
                        carrier: node,
                    });
                }
                for value in map.values() {
                    if claimed.is_some_and(|c| std::ptr::eq(c, value)) {
                        continue;
                    }
                    if value.is_object() || value.is_array() {
                        queue.push_back(value);
                    }
                }
            }
            Json::Array(items) => {
                for value in items {
                    if value.is_object() || value.is_array() {
                        queue.push_back(value);
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}

fn contract_identifier(payload: &Json) -> Option<String> {
    payload
        .get("contract_identifier")
        .or_else(|| payload.get("contractIdentifier"))
        .and_then(Json::as_str)
        .map(|s| s.to_string())
}

/// Decode the candidate's Clarity payload into plain JSON. Hex wins; a
/// Clarity-JSON `{type,value}` tree is unwrapped as a fallback.
fn decode_payload(payload: &Json) -> Option<Json> {
    for key in ["raw_value", "rawValue"] {
        if let Some(raw) = payload.get(key).and_then(Json::as_str) {
            return ClarityValue::from_hex(raw).ok().map(|v| v.to_plain_json());
        }
    }
    match payload.get("value") {
        Some(Json::String(raw)) => ClarityValue::from_hex(raw).ok().map(|v| v.to_plain_json()),
        Some(other) => Some(unwrap_clarity_json(other)),
        None => None,
    }
}

/// Strip `{type, value}` wrappers recursively, leaving plain values.
fn unwrap_clarity_json(value: &Json) -> Json {
    match value {
        Json::Object(map) => {
            if map.contains_key("type") && map.contains_key("value") {
                return unwrap_clarity_json(&map["value"]);
            }
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), unwrap_clarity_json(v));
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(unwrap_clarity_json).collect()),
        other => other.clone(),
    }
}

fn json_u128(value: &Json) -> Option<u128> {
    match value {
        Json::Number(n) => n.as_u64().map(|v| v as u128),
        Json::String(s) => parse_u128(s).ok(),
        _ => None,
    }
}

fn json_u64(value: &Json) -> Option<u64> {
    match value {
        Json::Number(n) => n.as_u64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_principal(value: &Json) -> Option<PrincipalId> {
    value.as_str().and_then(|s| PrincipalId::parse(s).ok())
}

/// Returns the canonical key plus whether canonicalization swapped the
/// principals relative to the payload; a swap means the snapshot's per-side
/// fields must flip too.
fn normalize_pipe_key(value: &Json) -> Option<(PipeKey, bool)> {
    let obj = value.as_object()?;
    let p1 = json_principal(obj.get("principal-1")?)?;
    let p2 = json_principal(obj.get("principal-2")?)?;
    let token = obj
        .get("token")
        .filter(|t| !t.is_null())
        .and_then(json_principal);
    let key = PipeKey::canonical(p1.clone(), p2, token).ok()?;
    let flipped = key.principal_1 != p1;
    Some((key, flipped))
}

fn normalize_pending(value: Option<&Json>) -> Option<PendingDeposit> {
    let obj = value?.as_object()?;
    Some(PendingDeposit {
        amount: json_u128(obj.get("amount")?)?,
        burn_height: json_u64(obj.get("burn-height")?)?,
    })
}

fn normalize_snapshot(value: &Json) -> Option<PipeSnapshot> {
    let obj = value.as_object()?;
    Some(PipeSnapshot {
        balance_1: json_u128(obj.get("balance-1")?)?,
        balance_2: json_u128(obj.get("balance-2")?)?,
        pending_1: normalize_pending(obj.get("pending-1")),
        pending_2: normalize_pending(obj.get("pending-2")),
        expires_at: obj
            .get("expires-at")
            .and_then(json_u128)
            .and_then(expires_at_from_uint),
        nonce: json_u128(obj.get("nonce")?)?,
        closer: obj
            .get("closer")
            .filter(|c| !c.is_null())
            .and_then(json_principal),
    })
}

fn normalize_candidate(
    candidate: &Candidate<'_>,
    contract_id: &str,
    envelope: &Json,
) -> Option<PipeEvent> {
    let decoded = decode_payload(candidate.payload)?;
    let event_name = decoded.get("event").and_then(Json::as_str)?.to_string();

    let sender = decoded
        .get("sender")
        .and_then(json_principal)
        .or_else(|| candidate.carrier.get("sender").and_then(json_principal));

    let txid = ["txid", "tx_id", "transaction_id"]
        .iter()
        .find_map(|k| candidate.carrier.get(*k).and_then(Json::as_str))
        .or_else(|| candidate.payload.get("txid").and_then(Json::as_str))
        .map(|s| s.to_string());

    let event_index = candidate
        .carrier
        .get("event_index")
        .or_else(|| candidate.payload.get("event_index"))
        .and_then(json_u64);

    let block_height = candidate
        .carrier
        .get("block_height")
        .and_then(json_u64)
        .or_else(|| envelope.get("block_height").and_then(json_u64))
        .or_else(|| envelope.get("blockHeight").and_then(json_u64));

    let block_hash = candidate
        .carrier
        .get("block_hash")
        .and_then(Json::as_str)
        .or_else(|| envelope.get("block_hash").and_then(Json::as_str))
        .or_else(|| envelope.get("index_block_hash").and_then(Json::as_str))
        .map(|s| s.to_string());

    let (pipe_key, flipped) = match decoded.get("pipe-key").and_then(normalize_pipe_key) {
        Some((key, flipped)) => (Some(key), flipped),
        None => (None, false),
    };
    let pipe = decoded.get("pipe").and_then(normalize_snapshot).map(|mut pipe| {
        if flipped {
            std::mem::swap(&mut pipe.balance_1, &mut pipe.balance_2);
            std::mem::swap(&mut pipe.pending_1, &mut pipe.pending_2);
        }
        pipe
    });

    Some(PipeEvent {
        contract_id: contract_id.to_string(),
        topic: "print".to_string(),
        txid,
        block_height,
        block_hash,
        event_index,
        event_name,
        sender,
        pipe_key,
        pipe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{c32check_encode, C32_VERSION_TESTNET};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn principal(seed: u8) -> PrincipalId {
        PrincipalId::parse(&c32check_encode(C32_VERSION_TESTNET, &[seed; 20])).unwrap()
    }

    fn contract_id() -> String {
        format!("{}.stackflow-0-5-0", principal(40).address())
    }

    fn print_tuple(event: &str, nonce: u128) -> ClarityValue {
        let mut pipe_key = BTreeMap::new();
        pipe_key.insert("token".to_string(), ClarityValue::OptionalNone);
        pipe_key.insert(
            "principal-1".to_string(),
            ClarityValue::Principal(principal(1)),
        );
        pipe_key.insert(
            "principal-2".to_string(),
            ClarityValue::Principal(principal(2)),
        );

        let mut pipe = BTreeMap::new();
        pipe.insert("balance-1".to_string(), ClarityValue::UInt(500));
        pipe.insert("balance-2".to_string(), ClarityValue::UInt(500));
        pipe.insert("pending-1".to_string(), ClarityValue::OptionalNone);
        pipe.insert("pending-2".to_string(), ClarityValue::OptionalNone);
        pipe.insert("expires-at".to_string(), ClarityValue::UInt(u128::MAX));
        pipe.insert("nonce".to_string(), ClarityValue::UInt(nonce));
        pipe.insert("closer".to_string(), ClarityValue::OptionalNone);

        let mut entries = BTreeMap::new();
        entries.insert(
            "event".to_string(),
            ClarityValue::StringAscii(event.to_string()),
        );
        entries.insert(
            "sender".to_string(),
            ClarityValue::Principal(principal(2)),
        );
        entries.insert("pipe-key".to_string(), ClarityValue::Tuple(pipe_key));
        entries.insert("pipe".to_string(), ClarityValue::Tuple(pipe));
        ClarityValue::Tuple(entries)
    }

    fn new_block_envelope(event: &str, nonce: u128) -> Json {
        json!({
            "block_height": 4100,
            "block_hash": "0xabc123",
            "events": [
                {
                    "txid": "0xdeadbeef",
                    "event_index": 0,
                    "committed": true,
                    "type": "contract_event",
                    "contract_event": {
                        "contract_identifier": contract_id(),
                        "topic": "print",
                        "raw_value": print_tuple(event, nonce).to_hex(),
                    }
                }
            ],
            "transactions": []
        })
    }

    #[test]
    fn parses_nested_contract_event() {
        let parser = EventParser::new(vec![]);
        let events = parser.parse(&new_block_envelope("fund-pipe", 3));
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.event_name, "fund-pipe");
        assert_eq!(event.contract_id, contract_id());
        assert_eq!(event.txid.as_deref(), Some("0xdeadbeef"));
        assert_eq!(event.block_height, Some(4100));
        assert_eq!(event.event_index, Some(0));
        assert_eq!(event.sender, Some(principal(2)));

        let pipe = event.pipe.as_ref().unwrap();
        assert_eq!(pipe.balance_1, 500);
        assert_eq!(pipe.nonce, 3);
        assert_eq!(pipe.expires_at, None, "sentinel expiry decodes to none");
        assert_eq!(
            event.pipe_key.as_ref().unwrap().pipe_id(),
            PipeKey::canonical(principal(1), principal(2), None)
                .unwrap()
                .pipe_id()
        );
    }

    #[test]
    fn parses_contract_log_variant() {
        let parser = EventParser::new(vec![]);
        let envelope = json!({
            "block_height": 4101,
            "events": [{
                "txid": "0xfeed",
                "event_index": 2,
                "contract_log": {
                    "contract_identifier": contract_id(),
                    "topic": "print",
                    "raw_value": print_tuple("withdraw", 9).to_hex(),
                }
            }]
        });
        let events = parser.parse(&envelope);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "withdraw");
        assert_eq!(events[0].event_index, Some(2));
    }

    #[test]
    fn parses_flat_variant_with_envelope_fallbacks() {
        let parser = EventParser::new(vec![]);
        let envelope = json!({
            "block_height": 4200,
            "index_block_hash": "0xidx",
            "items": [{
                "contract_identifier": contract_id(),
                "topic": "print",
                "txid": "0x1234",
                "value": print_tuple("deposit", 4).to_hex(),
            }]
        });
        let events = parser.parse(&envelope);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].txid.as_deref(), Some("0x1234"));
        assert_eq!(events[0].block_height, Some(4200));
        assert_eq!(events[0].block_hash.as_deref(), Some("0xidx"));
    }

    #[test]
    fn unwraps_clarity_json_values() {
        let parser = EventParser::new(vec![]);
        let envelope = json!({
            "events": [{
                "txid": "0x77",
                "event_index": 1,
                "contract_event": {
                    "contract_identifier": contract_id(),
                    "topic": "print",
                    "value": {
                        "type": "tuple",
                        "value": {
                            "event": {"type": "string-ascii", "value": "create-pipe"},
                            "sender": {"type": "principal", "value": principal(1).to_string()},
                            "pipe-key": {"type": "tuple", "value": {
                                "token": {"type": "optional", "value": null},
                                "principal-1": {"type": "principal", "value": principal(1).to_string()},
                                "principal-2": {"type": "principal", "value": principal(2).to_string()},
                            }},
                            "pipe": {"type": "tuple", "value": {
                                "balance-1": {"type": "uint", "value": "100"},
                                "balance-2": {"type": "uint", "value": "0"},
                                "nonce": {"type": "uint", "value": "0"},
                            }},
                        }
                    }
                }
            }]
        });
        let events = parser.parse(&envelope);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "create-pipe");
        assert_eq!(events[0].pipe.as_ref().unwrap().balance_1, 100);
    }

    #[test]
    fn filters_unwatched_contracts() {
        let other = format!("{}.some-other-app", principal(41).address());
        let mut envelope = new_block_envelope("fund-pipe", 1);
        envelope["events"][0]["contract_event"]["contract_identifier"] = json!(other);

        assert!(EventParser::new(vec![]).parse(&envelope).is_empty());

        // An explicit watch list overrides the default family matching.
        let events = EventParser::new(vec![other.clone()]).parse(&envelope);
        assert_eq!(events.len(), 1);
        assert!(EventParser::new(vec![contract_id()]).parse(&envelope).is_empty());
    }

    #[test]
    fn skips_non_print_topics() {
        let mut envelope = new_block_envelope("fund-pipe", 1);
        envelope["events"][0]["contract_event"]["topic"] = json!("burn");
        assert!(EventParser::new(vec![]).parse(&envelope).is_empty());
    }

    #[test]
    fn deduplicates_repeated_events() {
        let parser = EventParser::new(vec![]);
        let single = new_block_envelope("fund-pipe", 1);
        let envelope = json!({
            "block_height": 4100,
            "events": [single["events"][0], single["events"][0]],
        });
        assert_eq!(parser.parse(&envelope).len(), 1);
    }

    #[test]
    fn malformed_hex_is_skipped_silently() {
        let mut envelope = new_block_envelope("fund-pipe", 1);
        envelope["events"][0]["contract_event"]["raw_value"] = json!("0xzznotclarity");
        assert!(EventParser::new(vec![]).parse(&envelope).is_empty());
    }

    #[test]
    fn non_canonical_key_order_flips_snapshot_sides() {
        let mut pipe_key = BTreeMap::new();
        pipe_key.insert("token".to_string(), ClarityValue::OptionalNone);
        // Deliberately reversed relative to canonical byte order.
        pipe_key.insert(
            "principal-1".to_string(),
            ClarityValue::Principal(principal(2)),
        );
        pipe_key.insert(
            "principal-2".to_string(),
            ClarityValue::Principal(principal(1)),
        );
        let mut pipe = BTreeMap::new();
        pipe.insert("balance-1".to_string(), ClarityValue::UInt(700));
        pipe.insert("balance-2".to_string(), ClarityValue::UInt(300));
        pipe.insert("nonce".to_string(), ClarityValue::UInt(1));
        let mut entries = BTreeMap::new();
        entries.insert(
            "event".to_string(),
            ClarityValue::StringAscii("deposit".into()),
        );
        entries.insert("pipe-key".to_string(), ClarityValue::Tuple(pipe_key));
        entries.insert("pipe".to_string(), ClarityValue::Tuple(pipe));

        let envelope = json!({
            "events": [{
                "txid": "0x55",
                "event_index": 0,
                "contract_event": {
                    "contract_identifier": contract_id(),
                    "topic": "print",
                    "raw_value": ClarityValue::Tuple(entries).to_hex(),
                }
            }]
        });
        let events = EventParser::new(vec![]).parse(&envelope);
        assert_eq!(events.len(), 1);
        let key = events[0].pipe_key.as_ref().unwrap();
        assert_eq!(key.principal_1, principal(1));
        let pipe = events[0].pipe.as_ref().unwrap();
        // balance-1 belonged to principal(2); after canonicalization it sits
        // on the principal-2 side.
        assert_eq!(pipe.balance_1, 300);
        assert_eq!(pipe.balance_2, 700);
    }

    #[test]
    fn event_without_snapshot_still_normalizes() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "event".to_string(),
            ClarityValue::StringAscii("close-pipe".to_string()),
        );
        entries.insert(
            "sender".to_string(),
            ClarityValue::Principal(principal(1)),
        );
        let envelope = json!({
            "events": [{
                "txid": "0x99",
                "event_index": 0,
                "contract_event": {
                    "contract_identifier": contract_id(),
                    "topic": "print",
                    "raw_value": ClarityValue::Tuple(entries).to_hex(),
                }
            }]
        });
        let events = EventParser::new(vec![]).parse(&envelope);
        assert_eq!(events.len(), 1);
        assert!(events[0].pipe.is_none());
        assert!(events[0].pipe_key.is_none());
    }
}
