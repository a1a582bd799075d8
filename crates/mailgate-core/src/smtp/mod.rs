//! SMTP server module
//!
//! The relay listener accepts mail for the local domain without
//! authentication; the submission listener requires an API token. Both
//! store accepted mail through the [`Ingestor`](crate::delivery::Ingestor).

mod auth;
mod handler;
mod policy;
mod server;

pub use auth::{AuthOutcome, SmtpAuthenticator};
pub use handler::{SmtpContext, SmtpHandler};
pub use policy::{DeliveryPolicy, Rejection, RelayPolicy, SubmissionPolicy};
pub use server::{SmtpServer, SmtpServiceType};
