use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dbaas_control_plane::handlers::rbac::user_from_context;
use dbaas_control_plane::health::{HealthState, run_health_server};
use dbaas_control_plane::{
    ApiState, Config, ConfigMapPolicy, HttpVersionService, KubeClient, PolicySource,
    ReloadingPolicy, build_pipeline, run_api_server,
};

/// Grace period for in-flight requests to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(
            "Failed to install rustls crypto provider and no provider is available".into(),
        );
    }

    init_tracing()?;

    info!("Starting dbaas-control-plane");

    let config = Config::from_env()?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");
    let kube = KubeClient::new(client);

    let policy_source = Arc::new(ConfigMapPolicy::new(
        kube.clone(),
        &config.system_namespace,
        &config.rbac_configmap,
    ));
    let policy = policy_source.load().await?;
    if !policy.is_enabled() {
        warn!("RBAC is disabled, every authenticated user has full access");
    }
    let enforcer = Arc::new(ReloadingPolicy::new(policy));

    let versions = HttpVersionService::new(config.version_service_url.clone())?;

    let handler = build_pipeline(
        Arc::new(kube),
        Arc::new(versions),
        enforcer.clone(),
        user_from_context(),
        config.retry_policy(),
    );

    let health_state = Arc::new(HealthState::new());
    let shutdown = CancellationToken::new();

    let reload_handle = tokio::spawn(enforcer.run(
        policy_source,
        config.policy_reload_interval,
        shutdown.clone(),
    ));

    // Probes answer before the API is up
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let api_state = Arc::new(ApiState {
        handler,
        health: health_state.clone(),
        user_header: config.user_header.clone(),
        shutdown: shutdown.clone(),
    });

    let api_handle = {
        let tls = config.tls_enabled();
        if !tls {
            warn!(
                cert = %config.tls_cert_path.display(),
                key = %config.tls_key_path.display(),
                "TLS certificates not found, serving plain HTTP"
            );
        }
        let config = config.clone();
        tokio::spawn(async move {
            let tls_paths = tls.then(|| {
                (config.tls_cert_path.as_path(), config.tls_key_path.as_path())
            });
            if let Err(e) = run_api_server(api_state, config.listen_port, tls_paths).await {
                error!("API server error: {}", e);
            }
        })
    };

    health_state.set_ready(true).await;

    tokio::select! {
        result = api_handle => {
            if let Err(e) = result {
                error!("API server task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            health_state.set_ready(false).await;
            info!("Marked control plane as not ready");

            info!(
                "Waiting {}s for in-flight requests to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
            shutdown.cancel();

            info!("Grace period complete, shutting down");
        }
    }

    shutdown.cancel();
    if let Err(e) = reload_handle.await {
        error!("Policy reload task panicked: {}", e);
    }

    info!("Control plane stopped");
    Ok(())
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("dbaas_control_plane=info".parse()?)
        .add_directive("kube=info".parse()?);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
