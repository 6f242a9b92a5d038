//! Environment configuration.
//!
//! Loads `.env` when present, then reads everything from the environment.
//! Key material never appears in Debug output.

use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::address::{PrincipalId, C32_VERSION_MAINNET, C32_VERSION_TESTNET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StacksNetwork {
    Mainnet,
    Testnet,
    Devnet,
    Mocknet,
}

impl StacksNetwork {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(StacksNetwork::Mainnet),
            "testnet" => Ok(StacksNetwork::Testnet),
            "devnet" => Ok(StacksNetwork::Devnet),
            "mocknet" => Ok(StacksNetwork::Mocknet),
            other => Err(eyre!(
                "STACKS_NETWORK must be mainnet|testnet|devnet|mocknet, got {other:?}"
            )),
        }
    }

    pub fn is_mainnet(self) -> bool {
        matches!(self, StacksNetwork::Mainnet)
    }

    /// Transaction wire version byte.
    pub fn transaction_version(self) -> u8 {
        if self.is_mainnet() {
            0x00
        } else {
            0x80
        }
    }

    /// Single-sig address version byte.
    pub fn address_version(self) -> u8 {
        if self.is_mainnet() {
            C32_VERSION_MAINNET
        } else {
            C32_VERSION_TESTNET
        }
    }

    /// Transaction chain id (the signature-domain chain id shares the same
    /// mainnet/other split).
    pub fn chain_id(self) -> u32 {
        if self.is_mainnet() {
            1
        } else {
            0x8000_0000
        }
    }

    pub fn default_api_url(self) -> &'static str {
        match self {
            StacksNetwork::Mainnet => "https://api.hiro.so",
            StacksNetwork::Testnet => "https://api.testnet.hiro.so",
            StacksNetwork::Devnet | StacksNetwork::Mocknet => "http://localhost:3999",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerMode {
    LocalKey,
    Kms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierMode {
    Readonly,
    AcceptAll,
    RejectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorMode {
    Auto,
    Noop,
    Mock,
}

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_file: PathBuf,
    pub max_recent_events: u32,
    pub log_raw_events: bool,
    pub watched_contracts: Vec<String>,
    pub watched_principals: Vec<PrincipalId>,
    pub network: StacksNetwork,
    pub stacks_api_url: String,
    pub signer_key: Option<String>,
    pub counterparty_key: Option<String>,
    pub counterparty_principal: Option<PrincipalId>,
    pub counterparty_signer_mode: SignerMode,
    pub counterparty_kms_key_id: Option<String>,
    pub counterparty_kms_region: Option<String>,
    pub counterparty_kms_endpoint: Option<String>,
    pub message_version: String,
    pub signature_verifier_mode: VerifierMode,
    pub dispute_executor_mode: ExecutorMode,
    pub dispute_only_beneficial: bool,
}

/// Keys are redacted; everything else is fair game for logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_file", &self.db_file)
            .field("max_recent_events", &self.max_recent_events)
            .field("log_raw_events", &self.log_raw_events)
            .field("watched_contracts", &self.watched_contracts)
            .field("watched_principals", &self.watched_principals)
            .field("network", &self.network)
            .field("stacks_api_url", &self.stacks_api_url)
            .field("signer_key", &self.signer_key.as_ref().map(|_| "<redacted>"))
            .field(
                "counterparty_key",
                &self.counterparty_key.as_ref().map(|_| "<redacted>"),
            )
            .field("counterparty_principal", &self.counterparty_principal)
            .field("counterparty_signer_mode", &self.counterparty_signer_mode)
            .field("counterparty_kms_key_id", &self.counterparty_kms_key_id)
            .field("counterparty_kms_region", &self.counterparty_kms_region)
            .field("counterparty_kms_endpoint", &self.counterparty_kms_endpoint)
            .field("message_version", &self.message_version)
            .field("signature_verifier_mode", &self.signature_verifier_mode)
            .field("dispute_executor_mode", &self.dispute_executor_mode)
            .field("dispute_only_beneficial", &self.dispute_only_beneficial)
            .finish()
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str) -> Result<bool> {
    match var(name) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(eyre!("{name} must be a boolean, got {other:?}")),
        },
    }
}

fn parse_list(name: &str) -> Vec<String> {
    var(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("loaded .env from {:?}", path);
        }
        Self::load_from_env()
    }

    pub fn load_from_env() -> Result<Self> {
        let network = match var("STACKS_NETWORK") {
            Some(raw) => StacksNetwork::parse(&raw)?,
            None => StacksNetwork::Testnet,
        };

        let mut watched_principals = Vec::new();
        for raw in parse_list("WATCHED_PRINCIPALS") {
            let principal = PrincipalId::parse(&raw)
                .map_err(|e| eyre!("WATCHED_PRINCIPALS entry {raw:?}: {e}"))?;
            if !watched_principals.contains(&principal) {
                watched_principals.push(principal);
            }
        }
        if watched_principals.len() > 100 {
            return Err(eyre!(
                "WATCHED_PRINCIPALS supports at most 100 principals, got {}",
                watched_principals.len()
            ));
        }

        let counterparty_signer_mode = match var("COUNTERPARTY_SIGNER_MODE").as_deref() {
            None | Some("local-key") => SignerMode::LocalKey,
            Some("kms") => SignerMode::Kms,
            Some(other) => {
                return Err(eyre!(
                    "COUNTERPARTY_SIGNER_MODE must be local-key|kms, got {other:?}"
                ))
            }
        };

        let signature_verifier_mode = match var("SIGNATURE_VERIFIER_MODE").as_deref() {
            None | Some("readonly") => VerifierMode::Readonly,
            Some("accept-all") => VerifierMode::AcceptAll,
            Some("reject-all") => VerifierMode::RejectAll,
            Some(other) => {
                return Err(eyre!(
                    "SIGNATURE_VERIFIER_MODE must be readonly|accept-all|reject-all, got {other:?}"
                ))
            }
        };

        let dispute_executor_mode = match var("DISPUTE_EXECUTOR_MODE").as_deref() {
            None | Some("auto") => ExecutorMode::Auto,
            Some("noop") => ExecutorMode::Noop,
            Some("mock") => ExecutorMode::Mock,
            Some(other) => {
                return Err(eyre!(
                    "DISPUTE_EXECUTOR_MODE must be auto|noop|mock, got {other:?}"
                ))
            }
        };

        let message_version =
            var("STACKFLOW_MESSAGE_VERSION").unwrap_or_else(|| "stackflow-0.5.0".to_string());
        if !message_version.is_ascii() {
            return Err(eyre!("STACKFLOW_MESSAGE_VERSION must be ASCII"));
        }

        let counterparty_principal = var("COUNTERPARTY_PRINCIPAL")
            .map(|raw| {
                PrincipalId::parse(&raw).map_err(|e| eyre!("COUNTERPARTY_PRINCIPAL {raw:?}: {e}"))
            })
            .transpose()?;

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: var("PORT")
                .map(|raw| raw.parse::<u16>().wrap_err("PORT must be a valid port"))
                .transpose()?
                .unwrap_or(3000),
            db_file: PathBuf::from(
                var("DB_FILE").unwrap_or_else(|| "watchtower-state.db".to_string()),
            ),
            max_recent_events: var("MAX_RECENT_EVENTS")
                .map(|raw| {
                    raw.parse::<u32>()
                        .wrap_err("MAX_RECENT_EVENTS must be an unsigned integer")
                })
                .transpose()?
                .unwrap_or(200),
            log_raw_events: parse_bool("LOG_RAW_EVENTS")?,
            watched_contracts: parse_list("WATCHED_CONTRACTS"),
            watched_principals,
            stacks_api_url: var("STACKS_API_URL")
                .unwrap_or_else(|| network.default_api_url().to_string()),
            network,
            signer_key: var("SIGNER_KEY"),
            counterparty_key: var("COUNTERPARTY_KEY"),
            counterparty_principal,
            counterparty_signer_mode,
            counterparty_kms_key_id: var("COUNTERPARTY_KMS_KEY_ID"),
            counterparty_kms_region: var("COUNTERPARTY_KMS_REGION"),
            counterparty_kms_endpoint: var("COUNTERPARTY_KMS_ENDPOINT"),
            message_version,
            signature_verifier_mode,
            dispute_executor_mode,
            dispute_only_beneficial: parse_bool("DISPUTE_ONLY_BENEFICIAL")?,
        })
    }
}
