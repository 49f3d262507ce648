//! Infisical agent injector - mutating admission webhook

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agent_injector::bootstrap::{spawn_registration, WebhookConfigRegistrar};
use agent_injector::config::ConfigMapSource;
use agent_injector::pki::{self, ServingCertificate};
use agent_injector::webhook::{webhook_router, WebhookState};

/// Injects the Infisical agent into annotated pods
#[derive(Parser, Debug)]
#[command(name = "agent-injector", version, about, long_about = None)]
struct Cli {
    /// HTTPS port for the webhook
    #[arg(long, env = "PORT", default_value_t = agent_injector::DEFAULT_PORT)]
    port: u16,

    /// Directory the serving certificate and key are written to
    #[arg(long, env = "TLS_CERT_DIR", default_value = "/tmp/tls")]
    cert_dir: PathBuf,

    /// Namespace the injector runs in
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Service fronting the webhook; its DNS names go into the certificate
    #[arg(
        long,
        env = "SERVICE_NAME",
        default_value = "infisical-agent-injector-svc"
    )]
    service_name: String,

    /// MutatingWebhookConfiguration that receives the CA bundle
    #[arg(
        long,
        env = "WEBHOOK_CONFIG_NAME",
        default_value = "infisical-agent-injector-cfg"
    )]
    webhook_config_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before anything opens a TLS connection
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_injector=debug,kube=info,hyper=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let cert = ServingCertificate::generate(&cli.service_name, &cli.namespace)
        .context("failed to generate serving certificate")?;
    let cert_path = cert
        .write_to(&cli.cert_dir)
        .with_context(|| format!("failed to write TLS material to {}", cli.cert_dir.display()))?;

    let info = pki::inspect(cert.cert_pem()).context("generated certificate is unreadable")?;
    info!(
        dns_names = ?info.dns_names,
        not_after = %info.not_after,
        "Generated serving certificate"
    );

    // Registration is best effort and must not delay serving
    let registrar = WebhookConfigRegistrar::new(client.clone(), cli.webhook_config_name.clone());
    spawn_registration(Arc::new(registrar), cert.cert_pem().to_string());

    let state = Arc::new(WebhookState::new(
        Arc::new(ConfigMapSource::new(client)),
        cert_path,
    ));
    let app = webhook_router(state);

    let tls_config = RustlsConfig::from_pem(
        cert.cert_pem().as_bytes().to_vec(),
        cert.key_pem().as_bytes().to_vec(),
    )
    .await
    .context("invalid TLS configuration")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    info!(addr = %addr, namespace = %cli.namespace, "Starting agent injector webhook");

    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("webhook server on {addr} failed"))?;

    Ok(())
}
