//! Stacks principals and the c32check address codec.
//!
//! Addresses are a version byte plus a 20-byte hash160, rendered in the
//! Crockford-style c32 alphabet with a 4-byte double-sha256 checksum.
//! Contract principals append `.contract-name` to the standard form.

use ripemd::Ripemd160;
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::WatchtowerError;

const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Single-sig P2PKH address version bytes.
pub const C32_VERSION_MAINNET: u8 = 22;
pub const C32_VERSION_TESTNET: u8 = 26;

/// Maximum contract name length accepted on-chain.
const MAX_CONTRACT_NAME_LEN: usize = 40;

fn validation(msg: impl Into<String>) -> WatchtowerError {
    WatchtowerError::Validation(msg.into())
}

/// Encode bytes in the c32 alphabet. Leading zero bytes map to leading `0`
/// characters so round trips preserve length.
pub fn c32_encode(input: &[u8]) -> String {
    let total_bits = input.len() * 8;
    let mut digits: Vec<u8> = Vec::with_capacity(total_bits / 5 + 1);
    let mut bit = 0usize;
    while bit < total_bits {
        let mut value = 0u8;
        for offset in 0..5 {
            let idx = bit + offset;
            if idx >= total_bits {
                break;
            }
            let byte = input[input.len() - 1 - idx / 8];
            if (byte >> (idx % 8)) & 1 == 1 {
                value |= 1 << offset;
            }
        }
        digits.push(value);
        bit += 5;
    }
    while matches!(digits.last(), Some(0)) {
        digits.pop();
    }
    let leading_zero_bytes = input.iter().take_while(|b| **b == 0).count();
    let mut out = String::with_capacity(leading_zero_bytes + digits.len());
    for _ in 0..leading_zero_bytes {
        out.push('0');
    }
    for d in digits.iter().rev() {
        out.push(C32_ALPHABET[*d as usize] as char);
    }
    out
}

/// Value of a single c32 character. Normalizes lowercase and the
/// conventionally-ambiguous O/L/I forms.
fn c32_char_value(c: char) -> Option<u8> {
    let c = match c.to_ascii_uppercase() {
        'O' => '0',
        'L' | 'I' => '1',
        other => other,
    };
    C32_ALPHABET
        .iter()
        .position(|&a| a as char == c)
        .map(|p| p as u8)
}

/// Decode a c32 string back to bytes.
pub fn c32_decode(input: &str) -> Result<Vec<u8>, WatchtowerError> {
    let mut digits = Vec::with_capacity(input.len());
    for c in input.chars() {
        digits.push(c32_char_value(c).ok_or_else(|| validation(format!("invalid c32 character {c:?}")))?);
    }
    let total_bits = digits.len() * 5;
    let n_bytes = total_bits.div_ceil(8);
    let mut bytes = vec![0u8; n_bytes];
    for (i, d) in digits.iter().rev().enumerate() {
        for offset in 0..5 {
            if (d >> offset) & 1 == 1 {
                let bit = 5 * i + offset;
                bytes[n_bytes - 1 - bit / 8] |= 1 << (bit % 8);
            }
        }
    }
    let first_nonzero = bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(bytes.len());
    let leading_zero_chars = input.chars().take_while(|&c| c == '0').count();
    let mut out = vec![0u8; leading_zero_chars];
    out.extend_from_slice(&bytes[first_nonzero..]);
    Ok(out)
}

fn double_sha256_checksum(input: &[u8]) -> [u8; 4] {
    let once = Sha256::digest(input);
    let twice = Sha256::digest(once);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&twice[..4]);
    checksum
}

/// Encode a Stacks address from a version byte and hash160.
pub fn c32check_encode(version: u8, hash160: &[u8; 20]) -> String {
    let mut check_input = Vec::with_capacity(21);
    check_input.push(version);
    check_input.extend_from_slice(hash160);
    let checksum = double_sha256_checksum(&check_input);

    let mut payload = hash160.to_vec();
    payload.extend_from_slice(&checksum);
    format!(
        "S{}{}",
        C32_ALPHABET[(version & 0x1f) as usize] as char,
        c32_encode(&payload)
    )
}

/// Decode and checksum-verify a Stacks address into (version, hash160).
pub fn c32check_decode(addr: &str) -> Result<(u8, [u8; 20]), WatchtowerError> {
    let rest = addr
        .strip_prefix('S')
        .ok_or_else(|| validation(format!("address must start with S: {addr}")))?;
    let mut chars = rest.chars();
    let version_char = chars
        .next()
        .ok_or_else(|| validation("address too short"))?;
    let version = c32_char_value(version_char)
        .ok_or_else(|| validation(format!("invalid address version character {version_char:?}")))?;

    let payload = c32_decode(chars.as_str())?;
    if payload.len() != 24 {
        return Err(validation(format!(
            "address payload must be 24 bytes, got {}",
            payload.len()
        )));
    }
    let (data, checksum) = payload.split_at(20);

    let mut check_input = Vec::with_capacity(21);
    check_input.push(version);
    check_input.extend_from_slice(data);
    if double_sha256_checksum(&check_input) != checksum {
        return Err(validation(format!("address checksum mismatch: {addr}")));
    }

    let mut hash160 = [0u8; 20];
    hash160.copy_from_slice(data);
    Ok((version, hash160))
}

fn valid_contract_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_CONTRACT_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A parsed standard or contract principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrincipalId {
    pub version: u8,
    pub hash160: [u8; 20],
    pub contract_name: Option<String>,
}

impl PrincipalId {
    /// Parse `SP…` or `SP….contract-name`.
    pub fn parse(input: &str) -> Result<Self, WatchtowerError> {
        let (address_part, contract_name) = match input.split_once('.') {
            Some((addr, name)) => {
                if !valid_contract_name(name) {
                    return Err(validation(format!("invalid contract name in {input:?}")));
                }
                (addr, Some(name.to_string()))
            }
            None => (input, None),
        };
        let (version, hash160) = c32check_decode(address_part)?;
        Ok(Self {
            version,
            hash160,
            contract_name,
        })
    }

    /// True when this names a contract rather than a standard account.
    pub fn is_contract(&self) -> bool {
        self.contract_name.is_some()
    }

    /// The standard-principal portion (drops any contract name).
    pub fn address(&self) -> String {
        c32check_encode(self.version, &self.hash160)
    }

    /// Clarity consensus serialization (0x05 standard / 0x06 contract).
    /// Also the byte string pipe-key canonical ordering compares.
    pub fn serialize_clarity(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(26);
        match &self.contract_name {
            None => {
                out.push(0x05);
                out.push(self.version);
                out.extend_from_slice(&self.hash160);
            }
            Some(name) => {
                out.push(0x06);
                out.push(self.version);
                out.extend_from_slice(&self.hash160);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
        out
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())?;
        if let Some(name) = &self.contract_name {
            write!(f, ".{name}")?;
        }
        Ok(())
    }
}

/// Derive the single-sig address for a compressed public key.
pub fn address_from_public_key(version: u8, public_key: &PublicKey) -> String {
    let sha = Sha256::digest(public_key.serialize());
    let hash = Ripemd160::digest(sha);
    let mut hash160 = [0u8; 20];
    hash160.copy_from_slice(&hash);
    c32check_encode(version, &hash160)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c32_round_trips() {
        for input in [
            vec![],
            vec![0x00],
            vec![0x01],
            vec![0xff],
            vec![0x00, 0x01],
            vec![0x00, 0x00, 0xde, 0xad, 0xbe, 0xef],
            (0u8..=40).collect::<Vec<u8>>(),
        ] {
            let encoded = c32_encode(&input);
            let decoded = c32_decode(&encoded).unwrap();
            assert_eq!(decoded, input, "round trip failed for {encoded}");
        }
    }

    #[test]
    fn c32_known_values() {
        assert_eq!(c32_encode(&[0xff]), "7Z");
        assert_eq!(c32_encode(&[0x00, 0x01]), "01");
        assert_eq!(c32_decode("7Z").unwrap(), vec![0xff]);
    }

    #[test]
    fn c32_normalizes_ambiguous_characters() {
        assert_eq!(c32_decode("O").unwrap(), c32_decode("0").unwrap());
        assert_eq!(c32_decode("l").unwrap(), c32_decode("1").unwrap());
        assert_eq!(c32_decode("7z").unwrap(), vec![0xff]);
    }

    #[test]
    fn c32_rejects_invalid_characters() {
        assert!(c32_decode("U*").is_err());
    }

    #[test]
    fn c32check_round_trips() {
        let hash = [7u8; 20];
        for version in [C32_VERSION_MAINNET, C32_VERSION_TESTNET] {
            let addr = c32check_encode(version, &hash);
            let (v, h) = c32check_decode(&addr).unwrap();
            assert_eq!(v, version);
            assert_eq!(h, hash);
        }
    }

    #[test]
    fn burn_address_encodes_to_known_form() {
        // The zero-hash boot addresses are fixed on both networks.
        assert_eq!(
            c32check_encode(C32_VERSION_MAINNET, &[0u8; 20]),
            "SP000000000000000000002Q6VF78"
        );
        assert_eq!(
            c32check_encode(C32_VERSION_TESTNET, &[0u8; 20]),
            "ST000000000000000000002AMW42H"
        );
    }

    #[test]
    fn c32check_detects_corruption() {
        let addr = c32check_encode(C32_VERSION_MAINNET, &[7u8; 20]);
        let mut corrupted: Vec<char> = addr.chars().collect();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == '2' { '3' } else { '2' };
        let corrupted: String = corrupted.into_iter().collect();
        assert!(c32check_decode(&corrupted).is_err());
    }

    #[test]
    fn principal_parse_and_display() {
        let addr = c32check_encode(C32_VERSION_TESTNET, &[1u8; 20]);
        let standard = PrincipalId::parse(&addr).unwrap();
        assert!(!standard.is_contract());
        assert_eq!(standard.to_string(), addr);

        let contract = PrincipalId::parse(&format!("{addr}.stackflow-0-5-0")).unwrap();
        assert!(contract.is_contract());
        assert_eq!(contract.to_string(), format!("{addr}.stackflow-0-5-0"));
        assert_eq!(contract.address(), addr);
    }

    #[test]
    fn principal_rejects_bad_contract_names() {
        let addr = c32check_encode(C32_VERSION_TESTNET, &[1u8; 20]);
        assert!(PrincipalId::parse(&format!("{addr}.")).is_err());
        assert!(PrincipalId::parse(&format!("{addr}.9starts-with-digit")).is_err());
        assert!(PrincipalId::parse(&format!("{addr}.has space")).is_err());
        let too_long = "a".repeat(41);
        assert!(PrincipalId::parse(&format!("{addr}.{too_long}")).is_err());
    }

    #[test]
    fn clarity_serialization_distinguishes_forms() {
        let addr = c32check_encode(C32_VERSION_TESTNET, &[1u8; 20]);
        let standard = PrincipalId::parse(&addr).unwrap();
        let contract = PrincipalId::parse(&format!("{addr}.pipe")).unwrap();

        let standard_bytes = standard.serialize_clarity();
        assert_eq!(standard_bytes.len(), 22);
        assert_eq!(standard_bytes[0], 0x05);

        let contract_bytes = contract.serialize_clarity();
        assert_eq!(contract_bytes[0], 0x06);
        assert_eq!(contract_bytes.len(), 22 + 1 + 4);
    }

    #[test]
    fn address_from_key_is_network_scoped() {
        let secp = secp256k1::Secp256k1::new();
        let secret = secp256k1::SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let public = PublicKey::from_secret_key(&secp, &secret);

        let mainnet = address_from_public_key(C32_VERSION_MAINNET, &public);
        let testnet = address_from_public_key(C32_VERSION_TESTNET, &public);
        assert!(mainnet.starts_with("SP"));
        assert!(testnet.starts_with("ST"));
        assert_ne!(mainnet, testnet);
    }
}
