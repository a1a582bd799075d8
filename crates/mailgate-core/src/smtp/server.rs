//! SMTP server implementation

use super::handler::{SmtpContext, SmtpHandler};
use super::policy::{DeliveryPolicy, RelayPolicy, SubmissionPolicy};
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// SMTP service type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmtpServiceType {
    /// Port 25 - inbound mail for the local domain
    Smtp,
    /// Port 587 - mail submission (requires auth)
    Submission,
}

impl std::fmt::Display for SmtpServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtpServiceType::Smtp => write!(f, "SMTP"),
            SmtpServiceType::Submission => write!(f, "Submission"),
        }
    }
}

/// SMTP Server
pub struct SmtpServer {
    context: SmtpContext,
    email_domain: String,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(context: SmtpContext, email_domain: impl Into<String>) -> Self {
        Self {
            context,
            email_domain: email_domain.into(),
        }
    }

    /// Run both SMTP (port 25) and Submission (port 587) servers
    pub async fn run_dual_port(self: Arc<Self>) -> Result<()> {
        let smtp_server = self.clone();
        let submission_server = self.clone();

        let smtp_handle = tokio::spawn(async move {
            smtp_server.run_service(SmtpServiceType::Smtp).await
        });

        let submission_handle = tokio::spawn(async move {
            submission_server.run_service(SmtpServiceType::Submission).await
        });

        // Either listener stopping is fatal for the pair
        tokio::select! {
            result = smtp_handle => {
                match result {
                    Ok(Ok(())) => info!("SMTP service stopped"),
                    Ok(Err(e)) => error!(error = %e, "SMTP service error"),
                    Err(e) => error!(error = %e, "SMTP task panicked"),
                }
            }
            result = submission_handle => {
                match result {
                    Ok(Ok(())) => info!("Submission service stopped"),
                    Ok(Err(e)) => error!(error = %e, "Submission service error"),
                    Err(e) => error!(error = %e, "Submission task panicked"),
                }
            }
        }

        Ok(())
    }

    fn policy(&self, service_type: SmtpServiceType) -> Arc<dyn DeliveryPolicy> {
        match service_type {
            SmtpServiceType::Smtp => Arc::new(RelayPolicy::new(self.email_domain.clone())),
            SmtpServiceType::Submission => Arc::new(SubmissionPolicy),
        }
    }

    /// Run a specific SMTP service (SMTP or Submission)
    pub async fn run_service(&self, service_type: SmtpServiceType) -> Result<()> {
        let config = &self.context.config;
        let port = match service_type {
            SmtpServiceType::Smtp => config.port,
            SmtpServiceType::Submission => config.submission_port,
        };

        let addr = format!("{}:{}", config.host, port);
        let listener = TcpListener::bind(&addr).await?;
        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        let policy = self.policy(service_type);

        info!(
            service = %service_type,
            addr = %addr,
            starttls = self.context.tls_acceptor.is_some(),
            "SMTP server listening"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(service = %service_type, peer = %peer_addr, "Max connections reached, rejecting");
                            continue;
                        }
                    };

                    let handler = SmtpHandler::new(self.context.clone(), policy.clone(), peer_addr);

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            error!(service = %service_type, peer = %peer_addr, error = %e, "SMTP session error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(service = %service_type, error = %e, "Failed to accept connection");
                }
            }
        }
    }
}
