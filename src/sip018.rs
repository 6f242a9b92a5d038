//! Structured-data signing for off-chain pipe states.
//!
//! The signed byte string is `sha256("SIP018" || domain-hash || message-hash)`
//! where both hashes are sha256 of the consensus-serialized Clarity tuples.
//! The domain separates contracts and networks; the message carries the
//! transition in canonical principal orientation.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::address::PrincipalId;
use crate::clarity::ClarityValue;
use crate::error::WatchtowerError;
use crate::types::{PipeAction, PipeKey};

/// Byte prefix defined by the structured-data standard.
const STRUCTURED_DATA_PREFIX: &[u8; 6] = b"SIP018";

/// Chain id used in signature domains: 1 on mainnet, 2^31 otherwise.
pub fn domain_chain_id(mainnet: bool) -> u128 {
    if mainnet {
        1
    } else {
        1 << 31
    }
}

/// The domain tuple `{chain-id, name, version}`.
pub fn domain_tuple(contract_id: &str, message_version: &str, chain_id: u128) -> ClarityValue {
    let mut entries = BTreeMap::new();
    entries.insert("chain-id".to_string(), ClarityValue::UInt(chain_id));
    entries.insert(
        "name".to_string(),
        ClarityValue::StringAscii(contract_id.to_string()),
    );
    entries.insert(
        "version".to_string(),
        ClarityValue::StringAscii(message_version.to_string()),
    );
    ClarityValue::Tuple(entries)
}

/// Everything a pipe-state message commits to.
#[derive(Debug, Clone)]
pub struct PipeMessage {
    pub pipe_key: PipeKey,
    /// balance-1/balance-2 in canonical principal orientation.
    pub balance_1: u128,
    pub balance_2: u128,
    pub nonce: u128,
    pub action: PipeAction,
    pub actor: PrincipalId,
    pub hashed_secret: Option<[u8; 32]>,
    pub valid_after: Option<u128>,
}

impl PipeMessage {
    pub fn to_tuple(&self) -> ClarityValue {
        let mut entries = BTreeMap::new();
        entries.insert(
            "token".to_string(),
            ClarityValue::optional(
                self.pipe_key
                    .token
                    .as_ref()
                    .map(|t| ClarityValue::Principal(t.clone())),
            ),
        );
        entries.insert(
            "principal-1".to_string(),
            ClarityValue::Principal(self.pipe_key.principal_1.clone()),
        );
        entries.insert(
            "principal-2".to_string(),
            ClarityValue::Principal(self.pipe_key.principal_2.clone()),
        );
        entries.insert("balance-1".to_string(), ClarityValue::UInt(self.balance_1));
        entries.insert("balance-2".to_string(), ClarityValue::UInt(self.balance_2));
        entries.insert("nonce".to_string(), ClarityValue::UInt(self.nonce));
        entries.insert(
            "action".to_string(),
            ClarityValue::UInt(self.action.as_u128()),
        );
        entries.insert(
            "actor".to_string(),
            ClarityValue::Principal(self.actor.clone()),
        );
        entries.insert(
            "hashed-secret".to_string(),
            ClarityValue::optional(
                self.hashed_secret
                    .map(|h| ClarityValue::Buffer(h.to_vec())),
            ),
        );
        entries.insert(
            "valid-after".to_string(),
            ClarityValue::optional(self.valid_after.map(ClarityValue::UInt)),
        );
        ClarityValue::Tuple(entries)
    }
}

/// Hash an optional 32-byte secret preimage; the signed tuple commits to the
/// hash, never the preimage.
pub fn hashed_secret(secret: Option<&str>) -> Result<Option<[u8; 32]>, WatchtowerError> {
    match secret {
        None => Ok(None),
        Some(raw) => {
            let bytes = crate::types::decode_hex_exact(raw, 32, "secret")?;
            Ok(Some(sha256(&bytes)))
        }
    }
}

/// Build the canonical message for a submitted signature state.
pub fn pipe_message_from_input(
    input: &crate::types::SignatureStateInput,
    pipe_key: &PipeKey,
) -> Result<PipeMessage, WatchtowerError> {
    let (balance_1, balance_2) = input.canonical_balances(pipe_key);
    Ok(PipeMessage {
        pipe_key: pipe_key.clone(),
        balance_1,
        balance_2,
        nonce: input.nonce,
        action: input.action,
        actor: input.actor.clone(),
        hashed_secret: hashed_secret(input.secret.as_deref())?,
        valid_after: input.valid_after,
    })
}

pub fn sha256(input: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(input);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// The 32-byte hash both parties sign.
pub fn structured_data_hash(domain: &ClarityValue, message: &ClarityValue) -> [u8; 32] {
    let domain_hash = sha256(&domain.serialize());
    let message_hash = sha256(&message.serialize());
    let mut input = Vec::with_capacity(6 + 64);
    input.extend_from_slice(STRUCTURED_DATA_PREFIX);
    input.extend_from_slice(&domain_hash);
    input.extend_from_slice(&message_hash);
    sha256(&input)
}

/// Sign a 32-byte hash, emitting the 65-byte `r || s || v` form used by the
/// pipe contract.
pub fn sign_rsv(secret_key: &SecretKey, hash: &[u8; 32]) -> [u8; 65] {
    let secp = Secp256k1::new();
    let message = Message::from_digest(*hash);
    let signature = secp.sign_ecdsa_recoverable(&message, secret_key);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}

/// Recover the public key from a 65-byte `r || s || v` signature.
pub fn recover_rsv(signature: &[u8; 65], hash: &[u8; 32]) -> Result<PublicKey, WatchtowerError> {
    let secp = Secp256k1::new();
    let recovery_id = RecoveryId::from_i32(signature[64] as i32)
        .map_err(|_| WatchtowerError::Validation(format!("invalid recovery id {}", signature[64])))?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|e| WatchtowerError::Validation(format!("malformed signature: {e}")))?;
    let message = Message::from_digest(*hash);
    secp.recover_ecdsa(&message, &recoverable)
        .map_err(|e| WatchtowerError::SignatureInvalid(format!("recovery failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{c32check_encode, C32_VERSION_TESTNET};

    fn principal(seed: u8) -> PrincipalId {
        PrincipalId::parse(&c32check_encode(C32_VERSION_TESTNET, &[seed; 20])).unwrap()
    }

    fn sample_message() -> PipeMessage {
        let key = PipeKey::canonical(principal(1), principal(2), None).unwrap();
        PipeMessage {
            actor: key.principal_1.clone(),
            pipe_key: key,
            balance_1: 900,
            balance_2: 100,
            nonce: 5,
            action: PipeAction::Transfer,
            hashed_secret: None,
            valid_after: None,
        }
    }

    #[test]
    fn chain_id_by_network() {
        assert_eq!(domain_chain_id(true), 1);
        assert_eq!(domain_chain_id(false), 2147483648);
    }

    #[test]
    fn hash_is_deterministic_and_domain_separated() {
        let message = sample_message().to_tuple();
        let domain_a = domain_tuple("SP000000000000000000002Q6VF78.pipes", "1.0.0", 1);
        let domain_b = domain_tuple("SP000000000000000000002Q6VF78.pipes", "1.0.0", 1 << 31);

        let first = structured_data_hash(&domain_a, &message);
        let second = structured_data_hash(&domain_a, &message);
        assert_eq!(first, second);
        assert_ne!(first, structured_data_hash(&domain_b, &message));
    }

    #[test]
    fn message_commits_to_every_field() {
        let base = sample_message();
        let base_hash = sha256(&base.to_tuple().serialize());

        let mut changed = base.clone();
        changed.nonce += 1;
        assert_ne!(base_hash, sha256(&changed.to_tuple().serialize()));

        let mut changed = base.clone();
        changed.hashed_secret = Some([9u8; 32]);
        assert_ne!(base_hash, sha256(&changed.to_tuple().serialize()));

        let mut changed = base.clone();
        changed.valid_after = Some(4000);
        assert_ne!(base_hash, sha256(&changed.to_tuple().serialize()));

        let mut changed = base;
        changed.balance_1 -= 1;
        assert_ne!(base_hash, sha256(&changed.to_tuple().serialize()));
    }

    #[test]
    fn sign_and_recover_round_trip() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x17u8; 32]).unwrap();
        let public = PublicKey::from_secret_key(&secp, &secret);

        let domain = domain_tuple("ST000000000000000000002AMW42H.pipes", "1.0.0", 1 << 31);
        let hash = structured_data_hash(&domain, &sample_message().to_tuple());

        let signature = sign_rsv(&secret, &hash);
        let recovered = recover_rsv(&signature, &hash).unwrap();
        assert_eq!(recovered, public);

        // A different hash must not recover the same key.
        let other = structured_data_hash(&domain, &{
            let mut m = sample_message();
            m.nonce = 6;
            m.to_tuple()
        });
        let recovered = recover_rsv(&signature, &other).unwrap();
        assert_ne!(recovered, public);
    }

    #[test]
    fn recover_rejects_bad_recovery_id() {
        let mut signature = [0u8; 65];
        signature[64] = 9;
        assert!(recover_rsv(&signature, &[0u8; 32]).is_err());
    }
}
