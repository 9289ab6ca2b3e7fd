//! Chronos - multi-team countdown server
//!
//! Hosts timer sessions over TCP. Configuration comes from `chronos.toml`
//! (see [`config`]) and logging is controlled with `RUST_LOG`.

use std::sync::Arc;

use chronos_core::{CredentialDirectory, UserRole};
use chronos_net::{Server, SessionRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::ServerConfig;

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Chronos");

    let config = match ServerConfig::load_default() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    if let Err(e) = runtime.block_on(run(config)) {
        tracing::error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

/// Build the credential directory from configured users
fn credentials(config: &ServerConfig) -> CredentialDirectory {
    let directory = CredentialDirectory::new();
    for user in &config.users {
        let role = if user.admin { UserRole::Admin } else { UserRole::User };
        let identity = directory.register(user.token.clone(), user.alias.clone(), role);
        tracing::info!(alias = %identity.alias, user_id = %identity.user_id, "Registered user");
    }
    if directory.is_empty() {
        let (token, _) = directory.issue("admin", UserRole::Admin);
        tracing::warn!(token = %token, "No users configured, issued a one-off admin credential");
    }
    directory
}

async fn run(config: ServerConfig) -> chronos_net::Result<()> {
    let directory = Arc::new(credentials(&config));
    let registry = SessionRegistry::new(config.timing.clone());
    let sweep = registry.spawn_idle_sweep(config.idle_timeout(), config.sweep_interval());

    let server = Server::start(config.port, registry.clone(), directory).await?;
    tracing::info!(addr = %server.addr(), "Listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    server.shutdown();
    registry.shutdown().await;
    let _ = sweep.await;
    Ok(())
}
