//! Counterparty co-signing.
//!
//! The remote party proposes a transition oriented to OUR side of the pipe
//! (`myBalance` is this node's balance) together with their signature. The
//! service resolves the best-known baseline, enforces the signing policy,
//! verifies the counterparty signature, signs, and persists the resulting
//! state through the watchtower core. Composition is one-way: this module
//! knows the core, the core never knows us.

pub mod signer;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::address::PrincipalId;
use crate::error::{Result, WatchtowerError};
use crate::sip018::{domain_tuple, pipe_message_from_input, structured_data_hash};
use crate::types::{
    parse_u128, PipeAction, PipeKey, SignatureStateInput,
};
use crate::verifier::SignatureVerifier;
use crate::watchtower::{UpsertOutcome, Watchtower};
use signer::CosignerSigner;

/// A co-sign request as posted by the remote party.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub contract_id: String,
    /// Defaults to this node's signer principal; a mismatch is rejected.
    #[serde(default)]
    pub for_principal: Option<PrincipalId>,
    pub with_principal: PrincipalId,
    #[serde(default)]
    pub token: Option<PrincipalId>,
    #[serde(default, with = "crate::types::u128_dec")]
    pub amount: u128,
    #[serde(with = "crate::types::u128_dec")]
    pub my_balance: u128,
    #[serde(with = "crate::types::u128_dec")]
    pub their_balance: u128,
    /// The counterparty's signature over the proposed state.
    pub their_signature: String,
    #[serde(with = "crate::types::u128_dec")]
    pub nonce: u128,
    pub action: PipeAction,
    /// Defaults to the counterparty: they triggered the transition.
    #[serde(default)]
    pub actor: Option<PrincipalId>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, with = "crate::types::u128_dec_opt")]
    pub valid_after: Option<u128>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub request: SignatureStateInput,
    pub my_signature: String,
    pub upsert: UpsertOutcome,
}

/// Best-known prior state for the policy gates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub source: &'static str,
    pub nonce: u128,
    pub my_balance: u128,
    pub their_balance: u128,
    pub updated_at: String,
}

pub struct CoSignerService {
    tower: Arc<Watchtower>,
    signer: Arc<dyn CosignerSigner>,
    verifier: Arc<dyn SignatureVerifier>,
    /// Configured principal override; otherwise the signer's own.
    expected_principal: Option<PrincipalId>,
    message_version: String,
    chain_id: u128,
}

impl CoSignerService {
    pub fn new(
        tower: Arc<Watchtower>,
        signer: Arc<dyn CosignerSigner>,
        verifier: Arc<dyn SignatureVerifier>,
        expected_principal: Option<PrincipalId>,
        message_version: String,
        chain_id: u128,
    ) -> Self {
        Self {
            tower,
            signer,
            verifier,
            expected_principal,
            message_version,
            chain_id,
        }
    }

    /// `POST /counterparty/transfer`
    pub async fn sign_transfer(&self, request: SignRequest) -> Result<SignResponse> {
        self.sign(request, &[PipeAction::Transfer]).await
    }

    /// `POST /counterparty/signature-request`
    pub async fn sign_signature_request(&self, request: SignRequest) -> Result<SignResponse> {
        self.sign(
            request,
            &[PipeAction::Close, PipeAction::Deposit, PipeAction::Withdraw],
        )
        .await
    }

    async fn sign(&self, request: SignRequest, allowed: &[PipeAction]) -> Result<SignResponse> {
        if !self.signer.enabled() {
            return Err(WatchtowerError::CoSigner("signing not configured".into()));
        }
        self.signer.ensure_ready().await?;

        // 1. Parse and pin the signing identity.
        let my_principal = match &self.expected_principal {
            Some(p) => p.clone(),
            None => self.signer.principal().await?,
        };
        if let Some(requested) = &request.for_principal {
            if requested != &my_principal {
                return Err(WatchtowerError::Validation(format!(
                    "forPrincipal {requested} is not this co-signer ({my_principal})"
                )));
            }
        }
        if !allowed.contains(&request.action) {
            return Err(WatchtowerError::Validation(format!(
                "action {} not accepted on this endpoint",
                request.action
            )));
        }

        let actor = request
            .actor
            .clone()
            .unwrap_or_else(|| request.with_principal.clone());
        let mut input = SignatureStateInput {
            contract_id: request.contract_id.clone(),
            for_principal: my_principal.clone(),
            with_principal: request.with_principal.clone(),
            token: request.token.clone(),
            amount: request.amount,
            my_balance: request.my_balance,
            their_balance: request.their_balance,
            // Placeholder until we sign below; the verifier only inspects
            // the counterparty signature.
            my_signature: format!("0x{}", "00".repeat(65)),
            their_signature: request.their_signature.clone(),
            nonce: request.nonce,
            action: request.action,
            actor,
            secret: request.secret.clone(),
            valid_after: request.valid_after,
            beneficial_only: None,
        };
        let pipe_key = input.validate()?;

        // 2. Baseline.
        let baseline = self
            .resolve_baseline(&input.contract_id, &pipe_key, &my_principal)
            .await?
            .ok_or_else(|| WatchtowerError::conflict("unknown-pipe-state"))?;
        debug!(
            source = baseline.source,
            nonce = baseline.nonce,
            "baseline resolved for co-sign request"
        );

        // 3. Policy.
        if input.nonce <= baseline.nonce {
            return Err(WatchtowerError::conflict("nonce-too-low"));
        }
        if input.my_balance < baseline.my_balance {
            return Err(WatchtowerError::forbidden("counterparty-balance-decrease"));
        }
        if input.action == PipeAction::Transfer {
            let request_total = input.my_balance.checked_add(input.their_balance);
            let baseline_total = baseline.my_balance.checked_add(baseline.their_balance);
            if request_total.is_none() || request_total != baseline_total {
                return Err(WatchtowerError::forbidden("invalid-transfer-total"));
            }
            if input.my_balance <= baseline.my_balance {
                return Err(WatchtowerError::forbidden("transfer-not-beneficial"));
            }
        }

        // 4. The counterparty must have actually signed this transition.
        let verification = self.verifier.verify_signature_state(&input).await;
        if !verification.valid {
            return Err(WatchtowerError::SignatureInvalid(
                verification
                    .reason
                    .unwrap_or_else(|| "invalid-signature".to_string()),
            ));
        }

        // 5. Our signature over the canonical structured data.
        let message = pipe_message_from_input(&input, &pipe_key)?;
        let domain = domain_tuple(&input.contract_id, &self.message_version, self.chain_id);
        let hash = structured_data_hash(&domain, &message.to_tuple());
        let signature = self.signer.sign_message_hash(&hash).await?;
        input.my_signature = format!("0x{}", hex::encode(signature));

        // 6. Persist; verification already happened above.
        let upsert = self
            .tower
            .upsert_signature_state(input.clone(), true)
            .await?;
        info!(
            state_id = %upsert.state.state_id,
            nonce = %upsert.state.nonce,
            action = %input.action,
            "co-signed state stored"
        );

        Ok(SignResponse {
            my_signature: input.my_signature.clone(),
            request: input,
            upsert,
        })
    }

    /// Best baseline across the observed chain state and our own stored
    /// signature states: highest nonce, tie to the fresher row, tie to
    /// on-chain.
    async fn resolve_baseline(
        &self,
        contract_id: &str,
        pipe_key: &PipeKey,
        my_principal: &PrincipalId,
    ) -> Result<Option<Baseline>> {
        let pipe_id = pipe_key.pipe_id();
        let mut candidates: Vec<Baseline> = Vec::new();

        if let Some(observed) = self
            .tower
            .store()
            .get_observed_pipe(&format!("{contract_id}|{pipe_id}"))
            .await?
        {
            if let (Some(mine), Some(theirs)) = (
                observed.pipe.balance_for(&observed.pipe_key, my_principal),
                pipe_key
                    .other(my_principal)
                    .and_then(|other| observed.pipe.balance_for(&observed.pipe_key, other)),
            ) {
                candidates.push(Baseline {
                    source: "onchain",
                    nonce: observed.pipe.nonce,
                    my_balance: mine,
                    their_balance: theirs,
                    updated_at: observed.updated_at.clone(),
                });
            }
        }

        for state in self
            .tower
            .store()
            .signature_states_for_pipe(contract_id, &pipe_id)
            .await?
        {
            if state.for_principal != my_principal.to_string() {
                continue;
            }
            // Corrupt rows are skipped, not fatal.
            let (Ok(nonce), Ok(mine), Ok(theirs)) = (
                parse_u128(&state.nonce),
                parse_u128(&state.my_balance),
                parse_u128(&state.their_balance),
            ) else {
                continue;
            };
            candidates.push(Baseline {
                source: "signature-state",
                nonce,
                my_balance: mine,
                their_balance: theirs,
                updated_at: state.updated_at.clone(),
            });
        }

        Ok(candidates.into_iter().reduce(|best, next| {
            let replace = next.nonce > best.nonce
                || (next.nonce == best.nonce
                    && (next.updated_at > best.updated_at
                        || (next.updated_at == best.updated_at
                            && next.source == "onchain"
                            && best.source != "onchain")));
            if replace {
                next
            } else {
                best
            }
        }))
    }
}
