//! Signature-state verification.
//!
//! Three policies: accept everything (trusted submitters), reject everything
//! (ingest-only deployments), or ask the pipe contract's read-only
//! `verify-signature-request` function. The contract checks the
//! counterparty's signature, so the read-only call sends `theirSignature`
//! with `withPrincipal` as the signer, balances in canonical order.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::address::PrincipalId;
use crate::clarity::ClarityValue;
use crate::error::WatchtowerError;
use crate::sip018::pipe_message_from_input;
use crate::types::SignatureStateInput;

#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Verification {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_signature_state(&self, input: &SignatureStateInput) -> Verification;
}

pub struct AcceptAllVerifier;

#[async_trait]
impl SignatureVerifier for AcceptAllVerifier {
    async fn verify_signature_state(&self, _input: &SignatureStateInput) -> Verification {
        Verification::valid()
    }
}

pub struct RejectAllVerifier;

#[async_trait]
impl SignatureVerifier for RejectAllVerifier {
    async fn verify_signature_state(&self, _input: &SignatureStateInput) -> Verification {
        Verification::invalid("invalid-signature")
    }
}

/// Calls the contract's read-only verifier through the Stacks API.
pub struct ReadonlyVerifier {
    api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CallReadResponse {
    #[serde(default)]
    okay: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    cause: Option<String>,
}

impl ReadonlyVerifier {
    pub fn new(api_url: &str) -> Result<Self, WatchtowerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WatchtowerError::CoSigner(format!("http client: {e}")))?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// The function's argument list, canonicalized. Ordering mirrors the
    /// contract signature.
    fn build_arguments(input: &SignatureStateInput) -> Result<Vec<String>, WatchtowerError> {
        let pipe_key = input.validate()?;
        let message = pipe_message_from_input(input, &pipe_key)?;
        let signature = crate::types::decode_hex_exact(&input.their_signature, 65, "theirSignature")?;

        let args = vec![
            ClarityValue::Buffer(signature),
            ClarityValue::Principal(input.with_principal.clone()),
            ClarityValue::optional(
                pipe_key
                    .token
                    .as_ref()
                    .map(|t| ClarityValue::Principal(t.clone())),
            ),
            ClarityValue::Principal(pipe_key.principal_1.clone()),
            ClarityValue::Principal(pipe_key.principal_2.clone()),
            ClarityValue::UInt(message.balance_1),
            ClarityValue::UInt(message.balance_2),
            ClarityValue::UInt(input.nonce),
            ClarityValue::UInt(input.action.as_u128()),
            ClarityValue::Principal(input.actor.clone()),
            ClarityValue::optional(
                message
                    .hashed_secret
                    .map(|h| ClarityValue::Buffer(h.to_vec())),
            ),
            ClarityValue::optional(input.valid_after.map(ClarityValue::UInt)),
        ];
        Ok(args.iter().map(|a| a.to_hex()).collect())
    }

    fn interpret_result(raw: &str) -> Verification {
        match ClarityValue::from_hex(raw) {
            Ok(ClarityValue::ResponseOk(_)) => Verification::valid(),
            Ok(ClarityValue::ResponseErr(inner)) => match *inner {
                ClarityValue::UInt(code) => {
                    Verification::invalid(format!("contract-error-u{code}"))
                }
                _ => Verification::invalid("unexpected-readonly-response"),
            },
            _ => Verification::invalid("unexpected-readonly-response"),
        }
    }
}

#[async_trait]
impl SignatureVerifier for ReadonlyVerifier {
    async fn verify_signature_state(&self, input: &SignatureStateInput) -> Verification {
        let contract = match PrincipalId::parse(&input.contract_id) {
            Ok(c) if c.is_contract() => c,
            _ => return Verification::invalid("invalid-contract-id"),
        };
        let arguments = match Self::build_arguments(input) {
            Ok(args) => args,
            Err(e) => return Verification::invalid(e.reason()),
        };

        let url = format!(
            "{}/v2/contracts/call-read/{}/{}/verify-signature-request",
            self.api_url,
            contract.address(),
            contract.contract_name.as_deref().unwrap_or_default(),
        );
        let body = json!({
            "sender": input.for_principal.to_string(),
            "arguments": arguments,
        });

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, url, "read-only verification call failed");
                return Verification::invalid(format!("readonly-call-failed: {e}"));
            }
        };
        let parsed: CallReadResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "read-only verification returned unparseable body");
                return Verification::invalid("unexpected-readonly-response");
            }
        };

        if !parsed.okay {
            debug!(cause = ?parsed.cause, "read-only verification not okay");
            return Verification::invalid("unexpected-readonly-response");
        }
        match parsed.result {
            Some(result) => Self::interpret_result(&result),
            None => Verification::invalid("unexpected-readonly-response"),
        }
    }
}
