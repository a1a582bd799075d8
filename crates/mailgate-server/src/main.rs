//! Mailgate - Mail server entry point

use anyhow::Result;
use mailgate_common::config::{Config, LoggingConfig};
use mailgate_core::smtp::SmtpAuthenticator;
use mailgate_core::{
    tls, AccountService, ImapBackend, ImapServer, Ingestor, SmtpContext, SmtpServer, TokenCache,
};
use mailgate_storage::{DatabasePool, Repositories};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!(hostname = %config.server.hostname, "Starting Mailgate mail server...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;
    let repos = Repositories::postgres(db_pool);

    let shutdown = CancellationToken::new();

    // Token cache and its pruner
    let token_cache = Arc::new(TokenCache::new(
        repos.tokens.clone(),
        Duration::from_secs(config.auth.token_cache_ttl_secs),
    ));
    let pruner_handle = token_cache.spawn_pruner(
        Duration::from_secs(config.auth.token_prune_interval_secs),
        shutdown.clone(),
    );

    let accounts = Arc::new(AccountService::new(repos.users.clone(), token_cache));
    let tls_acceptor = tls::acceptor_from_config(config.tls.as_ref());

    // Initialize SMTP server
    let smtp_context = SmtpContext {
        config: config.smtp.clone(),
        hostname: config.server.hostname.clone(),
        ingestor: Arc::new(Ingestor::new(repos.inboxes.clone(), repos.messages.clone())),
        authenticator: Arc::new(SmtpAuthenticator::new(accounts.clone())),
        tls_acceptor: tls_acceptor.clone(),
    };
    let smtp_server = Arc::new(SmtpServer::new(
        smtp_context,
        config.server.email_domain.clone(),
    ));

    info!(
        host = %config.smtp.host,
        port = config.smtp.port,
        submission_port = config.smtp.submission_port,
        "Starting SMTP server"
    );

    let smtp_handle = tokio::spawn(async move {
        if let Err(e) = smtp_server.run_dual_port().await {
            error!(error = %e, "SMTP server error");
        }
    });

    // Start IMAP server if enabled
    let imap_handle = if config.imap.enabled {
        let backend = Arc::new(ImapBackend::new(
            accounts.clone(),
            repos.inboxes.clone(),
            repos.messages.clone(),
        ));
        let imap_server = Arc::new(ImapServer::new(
            config.imap.clone(),
            config.server.hostname.clone(),
            backend,
            tls_acceptor,
        ));
        info!(bind = %config.imap.bind, "Starting IMAP server");

        Some(tokio::spawn(async move {
            if let Err(e) = imap_server.run().await {
                error!(error = %e, "IMAP server error");
            }
        }))
    } else {
        info!("IMAP server disabled");
        None
    };

    info!("Mailgate server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Cleanup
    shutdown.cancel();
    smtp_handle.abort();
    if let Some(handle) = imap_handle {
        handle.abort();
    }
    if let Err(e) = pruner_handle.await {
        error!(error = %e, "Token pruner task failed");
    }

    info!("Mailgate server shutdown complete");

    Ok(())
}

/// `RUST_LOG` takes precedence over the configured level
fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
