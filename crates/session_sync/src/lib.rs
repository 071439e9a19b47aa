//! Post-login bootstrap of the end-to-end encryption state.
//!
//! [`SessionBootstrap`] publishes the local identity keys once per
//! installation and then migrates the local session directory onto the
//! server's current view of each contact's sessions. Both steps run on a
//! single background task and record their completion in durable flags.

use async_trait::async_trait;
use shared::error::RemoteError;
use std::time::Duration;
use tracing::{error, warn};

mod bootstrap;
pub mod device_ordinal;
mod error;
mod provisioning;
pub mod remote;
pub mod retry;
mod sender_keys;
mod synchronizer;

pub use bootstrap::{BootstrapDependencies, BootstrapOptions, BootstrapReport, SessionBootstrap};
pub use device_ordinal::device_ordinal_for_session;
pub use error::SyncError;
pub use provisioning::ProvisionOutcome;
pub use remote::{HttpKeyService, KeyDistributionService};
pub use retry::{RetryController, Unauthorized, DEFAULT_RETRY_DELAY};
pub use synchronizer::{SyncOutcome, SyncReport};

/// Suspends the calling task between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sink for failures that are retried or aborted without surfacing to the user.
pub trait Diagnostics: Send + Sync {
    fn report_remote_error(&self, operation: &'static str, attempt: u64, error: &RemoteError);
    fn report_local_error(&self, operation: &'static str, error: &anyhow::Error);
}

pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report_remote_error(&self, operation: &'static str, attempt: u64, error: &RemoteError) {
        warn!(
            operation,
            attempt,
            code = error.code,
            message = %error.message,
            "sync: remote call failed"
        );
    }

    fn report_local_error(&self, operation: &'static str, error: &anyhow::Error) {
        error!(operation, error = %format!("{error:#}"), "sync: local persistence failed");
    }
}

/// Cookie jar of any embedded web views. Cleared once keys are published.
pub trait WebSessionCookies: Send + Sync {
    fn clear(&self);
}

pub struct NoWebSessionCookies;

impl WebSessionCookies for NoWebSessionCookies {
    fn clear(&self) {}
}

#[cfg(test)]
#[path = "tests/fakes.rs"]
pub(crate) mod fakes;
