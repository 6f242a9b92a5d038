//! Co-signer key backends.
//!
//! One capability set, three disjoint implementations: an in-process key, a
//! KMS-backed signer over an abstract transport, and the unsupported stub
//! used when nothing is configured. The KMS path owns the messy parts:
//! SPKI extraction, DER parsing, low-S normalization and the recovery-id
//! search (the Sign API returns only r and s, so v is found by trying each
//! candidate against the known public key).

use async_trait::async_trait;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use tokio::sync::OnceCell;

use crate::address::{address_from_public_key, PrincipalId};
use crate::error::WatchtowerError;

#[async_trait]
pub trait CosignerSigner: Send + Sync {
    /// Whether this node can co-sign at all.
    fn enabled(&self) -> bool;

    /// Resolve key material; cheap after the first call.
    async fn ensure_ready(&self) -> Result<(), WatchtowerError>;

    /// The principal this signer signs as.
    async fn principal(&self) -> Result<PrincipalId, WatchtowerError>;

    /// Produce a 65-byte `r || s || v` signature over a message hash.
    async fn sign_message_hash(&self, hash: &[u8; 32]) -> Result<[u8; 65], WatchtowerError>;
}

/// No key configured: every signing path fails with 503.
pub struct UnsupportedSigner;

#[async_trait]
impl CosignerSigner for UnsupportedSigner {
    fn enabled(&self) -> bool {
        false
    }

    async fn ensure_ready(&self) -> Result<(), WatchtowerError> {
        Err(WatchtowerError::CoSigner("signing not configured".into()))
    }

    async fn principal(&self) -> Result<PrincipalId, WatchtowerError> {
        Err(WatchtowerError::CoSigner("signing not configured".into()))
    }

    async fn sign_message_hash(&self, _hash: &[u8; 32]) -> Result<[u8; 65], WatchtowerError> {
        Err(WatchtowerError::CoSigner("signing not configured".into()))
    }
}

/// Signs with an in-process secret key.
pub struct LocalKeySigner {
    secret_key: SecretKey,
    principal: PrincipalId,
}

impl LocalKeySigner {
    pub fn new(secret_key: SecretKey, address_version: u8) -> Result<Self, WatchtowerError> {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret_key);
        let address = address_from_public_key(address_version, &public);
        let principal = PrincipalId::parse(&address)?;
        Ok(Self {
            secret_key,
            principal,
        })
    }
}

#[async_trait]
impl CosignerSigner for LocalKeySigner {
    fn enabled(&self) -> bool {
        true
    }

    async fn ensure_ready(&self) -> Result<(), WatchtowerError> {
        Ok(())
    }

    async fn principal(&self) -> Result<PrincipalId, WatchtowerError> {
        Ok(self.principal.clone())
    }

    async fn sign_message_hash(&self, hash: &[u8; 32]) -> Result<[u8; 65], WatchtowerError> {
        Ok(crate::sip018::sign_rsv(&self.secret_key, hash))
    }
}

/// Abstract KMS transport. The concrete SDK binding stays outside the crate;
/// anything that can return an SPKI public key and a DER ECDSA signature
/// over a digest plugs in here.
#[async_trait]
pub trait KmsApi: Send + Sync {
    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>, WatchtowerError>;
    async fn sign_digest(&self, key_id: &str, digest: &[u8; 32]) -> Result<Vec<u8>, WatchtowerError>;
}

pub struct KmsSigner<C: KmsApi> {
    api: C,
    key_id: String,
    address_version: u8,
    identity: OnceCell<(PublicKey, PrincipalId)>,
}

impl<C: KmsApi> KmsSigner<C> {
    pub fn new(api: C, key_id: String, address_version: u8) -> Self {
        Self {
            api,
            key_id,
            address_version,
            identity: OnceCell::new(),
        }
    }

    async fn identity(&self) -> Result<&(PublicKey, PrincipalId), WatchtowerError> {
        self.identity
            .get_or_try_init(|| async {
                let spki = self.api.get_public_key(&self.key_id).await?;
                let public = public_key_from_spki(&spki)?;
                let address = address_from_public_key(self.address_version, &public);
                let principal = PrincipalId::parse(&address)?;
                Ok::<_, WatchtowerError>((public, principal))
            })
            .await
    }
}

#[async_trait]
impl<C: KmsApi> CosignerSigner for KmsSigner<C> {
    fn enabled(&self) -> bool {
        true
    }

    async fn ensure_ready(&self) -> Result<(), WatchtowerError> {
        self.identity().await.map(|_| ())
    }

    async fn principal(&self) -> Result<PrincipalId, WatchtowerError> {
        Ok(self.identity().await?.1.clone())
    }

    async fn sign_message_hash(&self, hash: &[u8; 32]) -> Result<[u8; 65], WatchtowerError> {
        let (public, _) = self.identity().await?;
        let der = self.api.sign_digest(&self.key_id, hash).await?;
        rsv_from_der(&der, hash, public)
    }
}

/// KMS over its JSON protocol. Request authentication is delegated to the
/// configured endpoint (an authenticating proxy or an emulator); this client
/// only speaks the two operations the signer needs.
pub struct RestKmsApi {
    endpoint: String,
    http: reqwest::Client,
}

impl RestKmsApi {
    pub fn new(endpoint: &str) -> Result<Self, WatchtowerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| WatchtowerError::CoSigner(format!("http client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn call(
        &self,
        target: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, WatchtowerError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-amz-target", target)
            .header("content-type", "application/x-amz-json-1.1")
            .json(&body)
            .send()
            .await
            .map_err(|e| WatchtowerError::CoSigner(format!("kms unreachable: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| WatchtowerError::CoSigner(format!("kms response unparseable: {e}")))
    }

    fn field_b64(value: &serde_json::Value, field: &str) -> Result<Vec<u8>, WatchtowerError> {
        use base64::Engine as _;
        let raw = value
            .get(field)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| WatchtowerError::CoSigner(format!("kms returned no {field}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| WatchtowerError::CoSigner(format!("kms {field} not base64: {e}")))
    }
}

#[async_trait]
impl KmsApi for RestKmsApi {
    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>, WatchtowerError> {
        let response = self
            .call(
                "TrentService.GetPublicKey",
                serde_json::json!({ "KeyId": key_id }),
            )
            .await?;
        Self::field_b64(&response, "PublicKey")
    }

    async fn sign_digest(&self, key_id: &str, digest: &[u8; 32]) -> Result<Vec<u8>, WatchtowerError> {
        use base64::Engine as _;
        let response = self
            .call(
                "TrentService.Sign",
                serde_json::json!({
                    "KeyId": key_id,
                    "Message": base64::engine::general_purpose::STANDARD.encode(digest),
                    "MessageType": "DIGEST",
                    "SigningAlgorithm": "ECDSA_SHA_256",
                }),
            )
            .await?;
        Self::field_b64(&response, "Signature")
    }
}

/// Pull the uncompressed EC point out of an SPKI document and compress it.
/// The point is the trailing 65 bytes starting with 0x04.
pub fn public_key_from_spki(spki: &[u8]) -> Result<PublicKey, WatchtowerError> {
    if spki.len() < 65 {
        return Err(WatchtowerError::CoSigner(
            "kms public key too short for an EC point".into(),
        ));
    }
    let point = &spki[spki.len() - 65..];
    if point[0] != 0x04 {
        return Err(WatchtowerError::CoSigner(
            "kms public key is not an uncompressed EC point".into(),
        ));
    }
    PublicKey::from_slice(point)
        .map_err(|e| WatchtowerError::CoSigner(format!("kms public key invalid: {e}")))
}

/// Convert a DER ECDSA signature into the 65-byte `r || s || v` form.
/// `s` is normalized to the low half of the order first; without that, no
/// recovery id reproduces the signing key.
pub fn rsv_from_der(
    der: &[u8],
    hash: &[u8; 32],
    expected: &PublicKey,
) -> Result<[u8; 65], WatchtowerError> {
    let mut signature = Signature::from_der(der)
        .map_err(|e| WatchtowerError::CoSigner(format!("kms signature undecodable: {e}")))?;
    signature.normalize_s();
    let compact = signature.serialize_compact();

    let secp = Secp256k1::new();
    let message = Message::from_digest(*hash);
    for v in 0..4 {
        let Ok(recovery_id) = RecoveryId::from_i32(v) else {
            continue;
        };
        let Ok(recoverable) = RecoverableSignature::from_compact(&compact, recovery_id) else {
            continue;
        };
        if secp
            .recover_ecdsa(&message, &recoverable)
            .is_ok_and(|recovered| recovered == *expected)
        {
            let mut out = [0u8; 65];
            out[..64].copy_from_slice(&compact);
            out[64] = v as u8;
            return Ok(out);
        }
    }
    Err(WatchtowerError::CoSigner(
        "kms signature does not recover the configured public key".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::C32_VERSION_TESTNET;
    use crate::sip018::recover_rsv;

    fn secret() -> SecretKey {
        SecretKey::from_slice(&[0x33u8; 32]).unwrap()
    }

    fn public() -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &secret())
    }

    /// DER-encode an (r, s) pair the way a KMS would.
    fn der_encode(r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
        fn integer(bytes: &[u8; 32]) -> Vec<u8> {
            let mut trimmed: Vec<u8> = bytes.iter().copied().skip_while(|b| *b == 0).collect();
            if trimmed.is_empty() {
                trimmed.push(0);
            }
            if trimmed[0] & 0x80 != 0 {
                trimmed.insert(0, 0);
            }
            let mut out = vec![0x02, trimmed.len() as u8];
            out.extend_from_slice(&trimmed);
            out
        }
        let r = integer(r);
        let s = integer(s);
        let mut out = vec![0x30, (r.len() + s.len()) as u8];
        out.extend_from_slice(&r);
        out.extend_from_slice(&s);
        out
    }

    /// Curve order, for building deliberately high-S signatures.
    const ORDER: [u8; 32] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c,
        0xd0, 0x36, 0x41, 0x41,
    ];

    fn order_minus(s: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let diff = ORDER[i] as i16 - s[i] as i16 - borrow;
            if diff < 0 {
                out[i] = (diff + 256) as u8;
                borrow = 1;
            } else {
                out[i] = diff as u8;
                borrow = 0;
            }
        }
        out
    }

    struct FakeKms {
        secret: SecretKey,
        /// Flip s into the high half before answering, as some HSMs do.
        high_s: bool,
    }

    #[async_trait]
    impl KmsApi for FakeKms {
        async fn get_public_key(&self, _key_id: &str) -> Result<Vec<u8>, WatchtowerError> {
            // Minimal SPKI: any DER prefix followed by the uncompressed point.
            let public = PublicKey::from_secret_key(&Secp256k1::new(), &self.secret);
            let mut spki = vec![0x30, 0x56, 0x30, 0x10];
            spki.extend_from_slice(&public.serialize_uncompressed());
            Ok(spki)
        }

        async fn sign_digest(
            &self,
            _key_id: &str,
            digest: &[u8; 32],
        ) -> Result<Vec<u8>, WatchtowerError> {
            let secp = Secp256k1::new();
            let message = Message::from_digest(*digest);
            let signature = secp.sign_ecdsa(&message, &self.secret);
            let compact = signature.serialize_compact();
            let mut r = [0u8; 32];
            let mut s = [0u8; 32];
            r.copy_from_slice(&compact[..32]);
            s.copy_from_slice(&compact[32..]);
            if self.high_s {
                s = order_minus(&s);
            }
            Ok(der_encode(&r, &s))
        }
    }

    #[test]
    fn spki_extraction_compresses_the_point() {
        let public = public();
        let mut spki = vec![0x30, 0x56, 0x30, 0x10, 0x06, 0x07];
        spki.extend_from_slice(&public.serialize_uncompressed());
        assert_eq!(public_key_from_spki(&spki).unwrap(), public);

        assert!(public_key_from_spki(&[0x30, 0x02]).is_err());
        let mut compressed_only = vec![0u8; 65];
        compressed_only[0] = 0x02;
        assert!(public_key_from_spki(&compressed_only).is_err());
    }

    #[tokio::test]
    async fn local_signer_round_trips() {
        let signer = LocalKeySigner::new(secret(), C32_VERSION_TESTNET).unwrap();
        assert!(signer.enabled());
        signer.ensure_ready().await.unwrap();
        assert!(signer.principal().await.unwrap().to_string().starts_with("ST"));

        let hash = crate::sip018::sha256(b"state transition");
        let signature = signer.sign_message_hash(&hash).await.unwrap();
        assert_eq!(recover_rsv(&signature, &hash).unwrap(), public());
    }

    #[tokio::test]
    async fn kms_signer_handles_low_s_signatures() {
        let signer = KmsSigner::new(
            FakeKms {
                secret: secret(),
                high_s: false,
            },
            "alias/pipe-signer".into(),
            C32_VERSION_TESTNET,
        );
        signer.ensure_ready().await.unwrap();

        let hash = crate::sip018::sha256(b"transition");
        let signature = signer.sign_message_hash(&hash).await.unwrap();
        assert_eq!(recover_rsv(&signature, &hash).unwrap(), public());
    }

    #[tokio::test]
    async fn kms_signer_normalizes_high_s_signatures() {
        let signer = KmsSigner::new(
            FakeKms {
                secret: secret(),
                high_s: true,
            },
            "alias/pipe-signer".into(),
            C32_VERSION_TESTNET,
        );

        let hash = crate::sip018::sha256(b"high-s transition");
        let signature = signer.sign_message_hash(&hash).await.unwrap();
        assert_eq!(recover_rsv(&signature, &hash).unwrap(), public());
    }

    #[tokio::test]
    async fn kms_and_local_agree_on_principal() {
        let local = LocalKeySigner::new(secret(), C32_VERSION_TESTNET).unwrap();
        let kms = KmsSigner::new(
            FakeKms {
                secret: secret(),
                high_s: false,
            },
            "alias/pipe-signer".into(),
            C32_VERSION_TESTNET,
        );
        assert_eq!(
            local.principal().await.unwrap(),
            kms.principal().await.unwrap()
        );
    }

    #[tokio::test]
    async fn unsupported_signer_refuses() {
        let signer = UnsupportedSigner;
        assert!(!signer.enabled());
        let err = signer.sign_message_hash(&[0u8; 32]).await.unwrap_err();
        assert_eq!(err.status(), 503);
    }

    #[test]
    fn recovery_rejects_wrong_key() {
        let secp = Secp256k1::new();
        let other = SecretKey::from_slice(&[0x44u8; 32]).unwrap();
        let hash = crate::sip018::sha256(b"foreign");
        let message = Message::from_digest(hash);
        let signature = secp.sign_ecdsa(&message, &other);
        let compact = signature.serialize_compact();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&compact[..32]);
        s.copy_from_slice(&compact[32..]);
        let der = der_encode(&r, &s);

        assert!(rsv_from_der(&der, &hash, &public()).is_err());
    }
}
