use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use tracing::{info, warn};

use watchtower::api::{self, AppState};
use watchtower::config::{Config, ExecutorMode, SignerMode, VerifierMode};
use watchtower::cosigner::signer::{
    CosignerSigner, KmsSigner, LocalKeySigner, RestKmsApi, UnsupportedSigner,
};
use watchtower::cosigner::CoSignerService;
use watchtower::db::Store;
use watchtower::dispute::{
    DisputeExecutor, MockDisputeExecutor, NoopDisputeExecutor, RealDisputeExecutor,
};
use watchtower::events::EventParser;
use watchtower::metrics::Metrics;
use watchtower::sip018::domain_chain_id;
use watchtower::stacks_tx::secret_key_from_hex;
use watchtower::verifier::{
    AcceptAllVerifier, ReadonlyVerifier, RejectAllVerifier, SignatureVerifier,
};
use watchtower::watchtower::Watchtower;

fn main() -> Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_logging();

    info!("Starting Stackflow Watchtower");

    let config = Config::load()?;
    info!(
        network = ?config.network,
        api_url = %config.stacks_api_url,
        watched_contracts = config.watched_contracts.len(),
        watched_principals = config.watched_principals.len(),
        "Configuration loaded"
    );

    let store = Store::open(&config.db_file, config.max_recent_events)
        .await
        .wrap_err("failed to open state database")?;
    info!(db_file = ?config.db_file, "State database ready");

    let verifier = build_verifier(&config)?;
    let executor = build_executor(&config)?;

    let tower = Arc::new(Watchtower::new(
        store.clone(),
        EventParser::new(config.watched_contracts.clone()),
        verifier.clone(),
        executor,
        config.watched_principals.clone(),
        config.dispute_only_beneficial,
    ));

    let cosigner = build_cosigner(&config, tower.clone(), verifier)?;
    if cosigner.is_none() {
        info!("Co-signing disabled (no counterparty key configured)");
    }

    let state = AppState {
        tower,
        cosigner,
        metrics: Arc::new(Metrics::new()),
        log_raw_events: config.log_raw_events,
    };
    let app = api::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .wrap_err("HTTP server error")?;

    store.close().await;
    info!("Stackflow Watchtower stopped");
    Ok(())
}

fn build_verifier(config: &Config) -> Result<Arc<dyn SignatureVerifier>> {
    Ok(match config.signature_verifier_mode {
        VerifierMode::AcceptAll => {
            warn!("signature verification disabled: accepting all submitted states");
            Arc::new(AcceptAllVerifier)
        }
        VerifierMode::RejectAll => Arc::new(RejectAllVerifier),
        VerifierMode::Readonly => Arc::new(
            ReadonlyVerifier::new(&config.stacks_api_url)
                .map_err(|e| eyre!("failed to build read-only verifier: {e}"))?,
        ),
    })
}

fn build_executor(config: &Config) -> Result<Arc<dyn DisputeExecutor>> {
    Ok(match config.dispute_executor_mode {
        ExecutorMode::Mock => Arc::new(MockDisputeExecutor::new()),
        ExecutorMode::Noop => Arc::new(NoopDisputeExecutor),
        ExecutorMode::Auto => match &config.signer_key {
            None => {
                warn!("no SIGNER_KEY configured, disputes will be recorded but not broadcast");
                Arc::new(NoopDisputeExecutor)
            }
            Some(raw) => {
                let key = secret_key_from_hex(raw).map_err(|e| eyre!("SIGNER_KEY: {e}"))?;
                Arc::new(
                    RealDisputeExecutor::new(
                        &config.stacks_api_url,
                        config.network.transaction_version(),
                        config.network.chain_id(),
                        config.network.address_version(),
                        key,
                    )
                    .map_err(|e| eyre!("failed to build dispute executor: {e}"))?,
                )
            }
        },
    })
}

fn build_cosigner(
    config: &Config,
    tower: Arc<Watchtower>,
    verifier: Arc<dyn SignatureVerifier>,
) -> Result<Option<Arc<CoSignerService>>> {
    let signer: Arc<dyn CosignerSigner> = match config.counterparty_signer_mode {
        SignerMode::LocalKey => match &config.counterparty_key {
            None => Arc::new(UnsupportedSigner),
            Some(raw) => {
                let key = secret_key_from_hex(raw).map_err(|e| eyre!("COUNTERPARTY_KEY: {e}"))?;
                Arc::new(
                    LocalKeySigner::new(key, config.network.address_version())
                        .map_err(|e| eyre!("failed to build local signer: {e}"))?,
                )
            }
        },
        SignerMode::Kms => {
            let key_id = config
                .counterparty_kms_key_id
                .as_ref()
                .ok_or_else(|| eyre!("COUNTERPARTY_KMS_KEY_ID is required in kms mode"))?;
            let endpoint = config
                .counterparty_kms_endpoint
                .as_ref()
                .ok_or_else(|| eyre!("COUNTERPARTY_KMS_ENDPOINT is required in kms mode"))?;
            if let Some(region) = &config.counterparty_kms_region {
                info!(region, "KMS signer configured");
            }
            Arc::new(KmsSigner::new(
                RestKmsApi::new(endpoint).map_err(|e| eyre!("failed to build KMS client: {e}"))?,
                key_id.clone(),
                config.network.address_version(),
            ))
        }
    };

    if !signer.enabled() {
        return Ok(None);
    }
    Ok(Some(Arc::new(CoSignerService::new(
        tower,
        signer,
        verifier,
        config.counterparty_principal.clone(),
        config.message_version.clone(),
        domain_chain_id(config.network.is_mainnet()),
    ))))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,watchtower=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Shutdown drain deadline: once a signal lands, a wedged in-flight request
/// may not hold the process open longer than this.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Resolves on SIGINT or SIGTERM, arming the forced-exit deadline on the way
/// out. Handler installation failures degrade to whatever signal still works
/// instead of aborting startup.
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, interrupt only");
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<&str>();

    let signal_name = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "interrupt handler failed, shutting down anyway");
            }
            "SIGINT"
        }
        name = sigterm => name,
    };
    info!(signal = signal_name, "shutdown requested, draining HTTP server");

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        eprintln!("shutdown drain exceeded {}s, exiting now", SHUTDOWN_DEADLINE.as_secs());
        std::process::exit(1);
    });
}
