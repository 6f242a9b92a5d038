//! Single-signature contract-call transactions.
//!
//! Implements the slice of the transaction wire format the node needs to
//! broadcast disputes: standard auth, P2PKH spending condition with a
//! compressed key, deny-mode with no post-conditions, contract-call payload.
//! The sighash chain is: hash the cleared transaction, fold in auth type,
//! fee and nonce, sign, then store the recoverable signature as v||r||s.

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde_json::Value as Json;
use sha2::{Digest, Sha512_256};
use std::time::Duration;

use crate::clarity::ClarityValue;
use crate::error::WatchtowerError;

const AUTH_TYPE_STANDARD: u8 = 0x04;
const HASH_MODE_P2PKH: u8 = 0x00;
const KEY_ENCODING_COMPRESSED: u8 = 0x00;
const ANCHOR_MODE_ANY: u8 = 0x03;
const POST_CONDITION_MODE_DENY: u8 = 0x02;
const PAYLOAD_CONTRACT_CALL: u8 = 0x02;

/// Flat fee attached to watchtower transactions. Fee estimation is out of
/// scope; disputes are small fixed-size calls.
pub const DEFAULT_TX_FEE: u64 = 3000;

fn sha512_256(input: &[u8]) -> [u8; 32] {
    let digest = Sha512_256::digest(input);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Parse a signing key from hex. Accepts the 33-byte form with a trailing
/// compression marker.
pub fn secret_key_from_hex(raw: &str) -> Result<SecretKey, WatchtowerError> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw).trim();
    let bytes = hex::decode(stripped)
        .map_err(|_| WatchtowerError::Validation("signer key is not valid hex".into()))?;
    let key_bytes = match bytes.len() {
        32 => &bytes[..],
        33 if bytes[32] == 0x01 => &bytes[..32],
        other => {
            return Err(WatchtowerError::Validation(format!(
                "signer key must be 32 bytes, got {other}"
            )))
        }
    };
    SecretKey::from_slice(key_bytes)
        .map_err(|e| WatchtowerError::Validation(format!("invalid signer key: {e}")))
}

fn hash160(public_key: &PublicKey) -> [u8; 20] {
    let sha = sha2::Sha256::digest(public_key.serialize());
    let ripe = ripemd::Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

#[derive(Debug, Clone)]
pub struct ContractCall {
    /// Standard principal that published the contract.
    pub contract_address_version: u8,
    pub contract_address_hash: [u8; 20],
    pub contract_name: String,
    pub function_name: String,
    pub arguments: Vec<ClarityValue>,
}

/// A fully-signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub bytes: Vec<u8>,
    pub txid: String,
}

pub struct TransactionBuilder {
    version: u8,
    chain_id: u32,
}

impl TransactionBuilder {
    pub fn new(version: u8, chain_id: u32) -> Self {
        Self { version, chain_id }
    }

    pub fn sign_contract_call(
        &self,
        call: &ContractCall,
        secret_key: &SecretKey,
        nonce: u64,
        fee: u64,
    ) -> Result<SignedTransaction, WatchtowerError> {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, secret_key);
        let signer = hash160(&public_key);

        // Initial sighash over the cleared transaction.
        let cleared = self.serialize(call, &signer, 0, 0, &[0u8; 65]);
        let initial = sha512_256(&cleared);

        let mut presign_input = Vec::with_capacity(32 + 1 + 16);
        presign_input.extend_from_slice(&initial);
        presign_input.push(AUTH_TYPE_STANDARD);
        presign_input.extend_from_slice(&fee.to_be_bytes());
        presign_input.extend_from_slice(&nonce.to_be_bytes());
        let presign = sha512_256(&presign_input);

        let message = secp256k1::Message::from_digest(presign);
        let recoverable = secp.sign_ecdsa_recoverable(&message, secret_key);
        let (recovery_id, compact) = recoverable.serialize_compact();
        let mut signature = [0u8; 65];
        signature[0] = recovery_id.to_i32() as u8;
        signature[1..].copy_from_slice(&compact);

        let bytes = self.serialize(call, &signer, nonce, fee, &signature);
        let txid = format!("0x{}", hex::encode(sha512_256(&bytes)));
        Ok(SignedTransaction { bytes, txid })
    }

    fn serialize(
        &self,
        call: &ContractCall,
        signer: &[u8; 20],
        nonce: u64,
        fee: u64,
        signature: &[u8; 65],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.push(self.version);
        out.extend_from_slice(&self.chain_id.to_be_bytes());

        // Standard auth, single-sig spending condition.
        out.push(AUTH_TYPE_STANDARD);
        out.push(HASH_MODE_P2PKH);
        out.extend_from_slice(signer);
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&fee.to_be_bytes());
        out.push(KEY_ENCODING_COMPRESSED);
        out.extend_from_slice(signature);

        out.push(ANCHOR_MODE_ANY);
        out.push(POST_CONDITION_MODE_DENY);
        out.extend_from_slice(&0u32.to_be_bytes());

        out.push(PAYLOAD_CONTRACT_CALL);
        out.push(call.contract_address_version);
        out.extend_from_slice(&call.contract_address_hash);
        out.push(call.contract_name.len() as u8);
        out.extend_from_slice(call.contract_name.as_bytes());
        out.push(call.function_name.len() as u8);
        out.extend_from_slice(call.function_name.as_bytes());
        out.extend_from_slice(&(call.arguments.len() as u32).to_be_bytes());
        for argument in &call.arguments {
            out.extend_from_slice(&argument.serialize());
        }
        out
    }
}

/// Thin client for the two node endpoints the watchtower hits when
/// broadcasting: account nonce lookup and raw transaction submission.
pub struct StacksApiClient {
    api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct AccountResponse {
    nonce: u64,
}

impl StacksApiClient {
    pub fn new(api_url: &str) -> Result<Self, WatchtowerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| WatchtowerError::CoSigner(format!("http client: {e}")))?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn fetch_nonce(&self, address: &str) -> Result<u64, WatchtowerError> {
        let url = format!("{}/v2/accounts/{}?proof=0", self.api_url, address);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| WatchtowerError::Ingest(format!("account lookup failed: {e}")))?;
        let account: AccountResponse = response
            .json()
            .await
            .map_err(|e| WatchtowerError::Ingest(format!("account lookup unparseable: {e}")))?;
        Ok(account.nonce)
    }

    /// Returns the broadcast txid, or the node's rejection reason.
    pub async fn broadcast(&self, tx: &SignedTransaction) -> Result<String, WatchtowerError> {
        let url = format!("{}/v2/transactions", self.api_url);
        let response = self
            .http
            .post(&url)
            .header("content-type", "application/octet-stream")
            .body(tx.bytes.clone())
            .send()
            .await
            .map_err(|e| WatchtowerError::Ingest(format!("broadcast failed: {e}")))?;

        let body: Json = response
            .json()
            .await
            .map_err(|e| WatchtowerError::Ingest(format!("broadcast response unparseable: {e}")))?;
        match body {
            Json::String(txid) => {
                let txid = txid.trim().to_string();
                if txid.starts_with("0x") {
                    Ok(txid)
                } else {
                    Ok(format!("0x{txid}"))
                }
            }
            other => {
                let reason = other
                    .get("reason")
                    .and_then(Json::as_str)
                    .or_else(|| other.get("error").and_then(Json::as_str))
                    .unwrap_or("unknown broadcast rejection");
                Err(WatchtowerError::Ingest(format!(
                    "transaction rejected: {reason}"
                )))
            }
        }
    }
}
