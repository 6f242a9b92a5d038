//! Dispute submission.
//!
//! When a counterparty forces a pipe closed against a superseded state, the
//! watchtower calls `dispute-closure-for` with the newer co-signed state.
//! Three executors: the real broadcaster, a disabled stub, and a counting
//! mock for tests.

use async_trait::async_trait;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::address::PrincipalId;
use crate::clarity::ClarityValue;
use crate::error::WatchtowerError;
use crate::stacks_tx::{
    ContractCall, SignedTransaction, StacksApiClient, TransactionBuilder, DEFAULT_TX_FEE,
};
use crate::types::{decode_hex_exact, parse_u128, ClosureRecord, SignatureStateRecord};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DisputeError(pub String);

#[derive(Debug, Clone)]
pub struct DisputeRequest {
    pub state: SignatureStateRecord,
    pub closure: ClosureRecord,
    pub trigger_txid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DisputeOutcome {
    pub txid: String,
}

#[async_trait]
pub trait DisputeExecutor: Send + Sync {
    async fn submit_dispute(&self, request: &DisputeRequest) -> Result<DisputeOutcome, DisputeError>;
}

/// Deployed without a signer key: every trigger records a failed attempt.
pub struct NoopDisputeExecutor;

#[async_trait]
impl DisputeExecutor for NoopDisputeExecutor {
    async fn submit_dispute(&self, _request: &DisputeRequest) -> Result<DisputeOutcome, DisputeError> {
        Err(DisputeError("dispute executor disabled".into()))
    }
}

/// Test double: monotonically increasing fake txids, call log by state id.
#[derive(Default)]
pub struct MockDisputeExecutor {
    counter: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl MockDisputeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock call log poisoned").len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock call log poisoned").clone()
    }
}

#[async_trait]
impl DisputeExecutor for MockDisputeExecutor {
    async fn submit_dispute(&self, request: &DisputeRequest) -> Result<DisputeOutcome, DisputeError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .lock()
            .expect("mock call log poisoned")
            .push(request.state.state_id.clone());
        Ok(DisputeOutcome {
            txid: format!("0xmock{n:08}"),
        })
    }
}

/// Builds, signs and broadcasts the dispute call with the configured key.
pub struct RealDisputeExecutor {
    builder: TransactionBuilder,
    api: StacksApiClient,
    secret_key: SecretKey,
    sender_address: String,
    fee: u64,
}

impl RealDisputeExecutor {
    pub fn new(
        api_url: &str,
        tx_version: u8,
        chain_id: u32,
        address_version: u8,
        secret_key: SecretKey,
    ) -> Result<Self, WatchtowerError> {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret_key);
        let sender_address = crate::address::address_from_public_key(address_version, &public);
        Ok(Self {
            builder: TransactionBuilder::new(tx_version, chain_id),
            api: StacksApiClient::new(api_url)?,
            secret_key,
            sender_address,
            fee: DEFAULT_TX_FEE,
        })
    }

    /// `dispute-closure-for` argument list, in contract order, from the
    /// stored state's own perspective.
    fn build_arguments(state: &SignatureStateRecord) -> Result<Vec<ClarityValue>, DisputeError> {
        let bad = |msg: String| DisputeError(msg);
        let for_principal = PrincipalId::parse(&state.for_principal)
            .map_err(|e| bad(format!("stored forPrincipal invalid: {e}")))?;
        let with_principal = PrincipalId::parse(&state.with_principal)
            .map_err(|e| bad(format!("stored withPrincipal invalid: {e}")))?;
        let token = state
            .token
            .as_deref()
            .map(PrincipalId::parse)
            .transpose()
            .map_err(|e| bad(format!("stored token invalid: {e}")))?;
        let my_balance = parse_u128(&state.my_balance)
            .map_err(|e| bad(format!("stored myBalance invalid: {e}")))?;
        let their_balance = parse_u128(&state.their_balance)
            .map_err(|e| bad(format!("stored theirBalance invalid: {e}")))?;
        let nonce = parse_u128(&state.nonce)
            .map_err(|e| bad(format!("stored nonce invalid: {e}")))?;
        let my_signature = decode_hex_exact(&state.my_signature, 65, "mySignature")
            .map_err(|e| bad(e.reason()))?;
        let their_signature = decode_hex_exact(&state.their_signature, 65, "theirSignature")
            .map_err(|e| bad(e.reason()))?;
        let secret = state
            .secret
            .as_deref()
            .map(|s| decode_hex_exact(s, 32, "secret"))
            .transpose()
            .map_err(|e| bad(e.reason()))?;
        let valid_after = state
            .valid_after
            .as_deref()
            .map(parse_u128)
            .transpose()
            .map_err(|e| bad(format!("stored validAfter invalid: {e}")))?;
        let actor = PrincipalId::parse(&state.actor)
            .map_err(|e| bad(format!("stored actor invalid: {e}")))?;

        Ok(vec![
            ClarityValue::Principal(for_principal),
            ClarityValue::optional(token.map(ClarityValue::Principal)),
            ClarityValue::Principal(with_principal),
            ClarityValue::UInt(my_balance),
            ClarityValue::UInt(their_balance),
            ClarityValue::Buffer(my_signature),
            ClarityValue::Buffer(their_signature),
            ClarityValue::UInt(nonce),
            ClarityValue::UInt(state.action as u128),
            ClarityValue::Principal(actor),
            ClarityValue::optional(secret.map(ClarityValue::Buffer)),
            ClarityValue::optional(valid_after.map(ClarityValue::UInt)),
        ])
    }

    fn build_call(state: &SignatureStateRecord) -> Result<ContractCall, DisputeError> {
        let contract = PrincipalId::parse(&state.contract_id)
            .map_err(|e| DisputeError(format!("stored contractId invalid: {e}")))?;
        let contract_name = contract
            .contract_name
            .clone()
            .ok_or_else(|| DisputeError("stored contractId is not a contract".into()))?;
        Ok(ContractCall {
            contract_address_version: contract.version,
            contract_address_hash: contract.hash160,
            contract_name,
            function_name: "dispute-closure-for".into(),
            arguments: Self::build_arguments(state)?,
        })
    }

    async fn sign(&self, state: &SignatureStateRecord) -> Result<SignedTransaction, DisputeError> {
        let call = Self::build_call(state)?;
        let nonce = self
            .api
            .fetch_nonce(&self.sender_address)
            .await
            .map_err(|e| DisputeError(e.reason()))?;
        self.builder
            .sign_contract_call(&call, &self.secret_key, nonce, self.fee)
            .map_err(|e| DisputeError(e.reason()))
    }
}

#[async_trait]
impl DisputeExecutor for RealDisputeExecutor {
    async fn submit_dispute(&self, request: &DisputeRequest) -> Result<DisputeOutcome, DisputeError> {
        let tx = self.sign(&request.state).await?;
        let txid = self
            .api
            .broadcast(&tx)
            .await
            .map_err(|e| DisputeError(e.reason()))?;
        info!(
            txid,
            pipe_id = %request.closure.pipe_id,
            trigger = ?request.trigger_txid,
            "dispute broadcast"
        );
        Ok(DisputeOutcome { txid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{c32check_encode, C32_VERSION_TESTNET};
    use crate::types::{now_rfc3339, PipeKey};

    fn principal(seed: u8) -> PrincipalId {
        PrincipalId::parse(&c32check_encode(C32_VERSION_TESTNET, &[seed; 20])).unwrap()
    }

    fn state() -> SignatureStateRecord {
        let mut contract = principal(40);
        contract.contract_name = Some("stackflow-0-5-0".into());
        let key = PipeKey::canonical(principal(1), principal(2), None).unwrap();
        SignatureStateRecord {
            state_id: format!("{}|{}|{}", contract, key.pipe_id(), principal(1)),
            contract_id: contract.to_string(),
            pipe_id: key.pipe_id(),
            for_principal: principal(1).to_string(),
            with_principal: principal(2).to_string(),
            token: None,
            amount: "0".into(),
            my_balance: "900".into(),
            their_balance: "100".into(),
            my_signature: format!("0x{}", "11".repeat(65)),
            their_signature: format!("0x{}", "22".repeat(65)),
            nonce: "5".into(),
            action: 1,
            actor: principal(1).to_string(),
            secret: None,
            valid_after: None,
            beneficial_only: false,
            updated_at: now_rfc3339(),
        }
    }

    fn closure() -> ClosureRecord {
        ClosureRecord {
            pipe_id: state().pipe_id,
            contract_id: state().contract_id,
            pipe_key: PipeKey::canonical(principal(1), principal(2), None).unwrap(),
            closer: Some(principal(2).to_string()),
            expires_at: Some(4200),
            nonce: "3".into(),
            event_name: "force-cancel".into(),
            trigger_txid: Some("0xforce1".into()),
            block_height: Some(4100),
            updated_at: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn noop_always_fails_with_disabled() {
        let request = DisputeRequest {
            state: state(),
            closure: closure(),
            trigger_txid: Some("0xforce1".into()),
        };
        let err = NoopDisputeExecutor
            .submit_dispute(&request)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "dispute executor disabled");
    }

    #[tokio::test]
    async fn mock_counts_and_numbers_txids() {
        let mock = MockDisputeExecutor::new();
        let request = DisputeRequest {
            state: state(),
            closure: closure(),
            trigger_txid: None,
        };
        let first = mock.submit_dispute(&request).await.unwrap();
        let second = mock.submit_dispute(&request).await.unwrap();
        assert_eq!(first.txid, "0xmock00000001");
        assert_eq!(second.txid, "0xmock00000002");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.calls()[0], state().state_id);
    }

    #[test]
    fn dispute_arguments_follow_contract_order() {
        let args = RealDisputeExecutor::build_arguments(&state()).unwrap();
        assert_eq!(args.len(), 12);
        assert_eq!(args[0], ClarityValue::Principal(principal(1)));
        assert_eq!(args[1], ClarityValue::OptionalNone);
        assert_eq!(args[2], ClarityValue::Principal(principal(2)));
        assert_eq!(args[3], ClarityValue::UInt(900));
        assert_eq!(args[4], ClarityValue::UInt(100));
        assert_eq!(args[5], ClarityValue::Buffer(vec![0x11; 65]));
        assert_eq!(args[7], ClarityValue::UInt(5));
        assert_eq!(args[8], ClarityValue::UInt(1));
        assert_eq!(args[11], ClarityValue::OptionalNone);
    }

    #[test]
    fn dispute_call_targets_stored_contract() {
        let call = RealDisputeExecutor::build_call(&state()).unwrap();
        assert_eq!(call.function_name, "dispute-closure-for");
        assert_eq!(call.contract_name, "stackflow-0-5-0");
        assert_eq!(call.contract_address_version, C32_VERSION_TESTNET);
    }

    #[test]
    fn corrupt_stored_state_is_a_dispute_error() {
        let mut bad = state();
        bad.my_signature = "0xdead".into();
        assert!(RealDisputeExecutor::build_arguments(&bad).is_err());

        let mut bad = state();
        bad.contract_id = principal(4).to_string();
        assert!(RealDisputeExecutor::build_call(&bad).is_err());
    }
}
