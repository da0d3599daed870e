use kdi_k8s::cancel::{cancel_pair, wait_for_signal};
use kdi_k8s::cluster::{
    Connector, CredentialExchange, EksCredentialExchange, HttpCredentialExchange,
    KubeClientFactory,
};
use kdi_k8s::config::ServerConfig;
use kdi_k8s::server::{create_metrics, run_server, AppState, ReadinessState};
use kdi_k8s::update::UpdaterOptions;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting kdi-k8s deployment service");

    // kube and reqwest both sit on rustls; pick the ring provider once
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        port = config.port,
        tls_policy = ?config.tls_policy,
        probe_timeout = ?config.probe_timeout,
        blue_green_verify = config.blue_green_verify,
        "Configuration loaded"
    );

    let exchange: Arc<dyn CredentialExchange> = match &config.credential_broker_url {
        Some(url) => {
            info!(broker = %url, "Managed clusters go through the credential broker");
            Arc::new(HttpCredentialExchange::new(url.clone()))
        }
        None => {
            info!("Managed clusters go through EKS DescribeCluster");
            Arc::new(EksCredentialExchange)
        }
    };
    let connector = Connector::new(Arc::new(KubeClientFactory))
        .with_tls_policy(config.tls_policy)
        .with_probe_timeout(config.probe_timeout)
        .with_credential_exchange(exchange);

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let (canceller, cancel) = cancel_pair();
    let state = AppState {
        connector: Arc::new(connector),
        updater_options: UpdaterOptions {
            verify_green: config.blue_green_verify,
            ..Default::default()
        },
        readiness: readiness.clone(),
        metrics,
        cancel,
    };

    let port = config.port;
    // run_server flips readiness once the listener is bound
    let mut server_handle = tokio::spawn(async move { run_server(port, state).await });
    info!(port = port, "Server task spawned");

    let stopped_early = tokio::select! {
        result = &mut server_handle => Some(result),
        signal = wait_for_signal() => {
            let signal = signal?;
            info!(signal = signal, "Initiating graceful shutdown");
            None
        }
    };

    // Mark not ready so K8s stops sending traffic during shutdown
    readiness.set_not_ready();

    match stopped_early {
        Some(Ok(Ok(()))) => info!("Server stopped"),
        Some(Ok(Err(e))) => {
            error!(error = %e, "Server failed");
            return Err(e.into());
        }
        Some(Err(e)) => {
            error!(error = %e, "Server task panicked");
            return Err(e.into());
        }
        None => {
            // Aborts in-flight cluster probes and stops the listener
            canceller.cancel();
            if let Err(e) = server_handle.await {
                warn!(error = %e, "Server task ended abnormally");
            }
        }
    }

    info!("kdi-k8s shut down gracefully");
    Ok(())
}
