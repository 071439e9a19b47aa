use keys::{DalekPreKeyGenerator, PreKeyGenerator, DEFAULT_ONE_TIME_PREKEY_COUNT};
use shared::domain::SyncFlags;
use std::{sync::Arc, time::Duration};
use storage::Storage;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    error::{LocalResultExt, SyncError},
    provisioning::ProvisionOutcome,
    retry::{RetryController, DEFAULT_RETRY_DELAY},
    synchronizer::SyncOutcome,
    Diagnostics, KeyDistributionService, NoWebSessionCookies, Sleeper, TokioSleeper,
    TracingDiagnostics, WebSessionCookies,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapOptions {
    pub retry_delay: Duration,
    pub one_time_prekey_count: usize,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            one_time_prekey_count: DEFAULT_ONE_TIME_PREKEY_COUNT,
        }
    }
}

/// Collaborators that tests and embedders swap out.
#[derive(Clone)]
pub struct BootstrapDependencies {
    pub sleeper: Arc<dyn Sleeper>,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub web_cookies: Arc<dyn WebSessionCookies>,
    pub prekey_generator: Arc<dyn PreKeyGenerator>,
}

impl Default for BootstrapDependencies {
    fn default() -> Self {
        Self {
            sleeper: Arc::new(TokioSleeper),
            diagnostics: Arc::new(TracingDiagnostics),
            web_cookies: Arc::new(NoWebSessionCookies),
            prekey_generator: Arc::new(DalekPreKeyGenerator),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub provisioning: ProvisionOutcome,
    pub synchronization: SyncOutcome,
}

/// Owns the post-login encryption bootstrap for one installation.
///
/// The flags are read once when the value is built and updated in memory
/// only after the matching durable write has succeeded.
pub struct SessionBootstrap {
    pub(crate) storage: Storage,
    pub(crate) remote: Arc<dyn KeyDistributionService>,
    pub(crate) retry: RetryController,
    pub(crate) diagnostics: Arc<dyn Diagnostics>,
    pub(crate) web_cookies: Arc<dyn WebSessionCookies>,
    pub(crate) prekey_generator: Arc<dyn PreKeyGenerator>,
    pub(crate) one_time_prekey_count: usize,
    pub(crate) flags: SyncFlags,
}

impl SessionBootstrap {
    pub async fn load(
        storage: Storage,
        remote: Arc<dyn KeyDistributionService>,
        options: BootstrapOptions,
    ) -> Result<Self, SyncError> {
        Self::load_with_dependencies(storage, remote, options, BootstrapDependencies::default()).await
    }

    pub async fn load_with_dependencies(
        storage: Storage,
        remote: Arc<dyn KeyDistributionService>,
        options: BootstrapOptions,
        dependencies: BootstrapDependencies,
    ) -> Result<Self, SyncError> {
        let flags = storage.load_sync_flags().await.local("load_sync_flags")?;
        info!(
            keys_provisioned = flags.keys_provisioned,
            sessions_synchronized = flags.sessions_synchronized,
            "sync: bootstrap state loaded"
        );
        Ok(Self {
            storage,
            remote,
            retry: RetryController::new(
                options.retry_delay,
                dependencies.sleeper,
                dependencies.diagnostics.clone(),
            ),
            diagnostics: dependencies.diagnostics,
            web_cookies: dependencies.web_cookies,
            prekey_generator: dependencies.prekey_generator,
            one_time_prekey_count: options.one_time_prekey_count,
            flags,
        })
    }

    pub fn flags(&self) -> SyncFlags {
        self.flags
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Provisions keys, then synchronizes sessions. A terminal auth failure
    /// during provisioning skips synchronization.
    pub async fn run(&mut self) -> Result<BootstrapReport, SyncError> {
        let provisioning = self.ensure_identity_provisioned().await?;
        let synchronization = self.synchronize_sessions().await?;
        Ok(BootstrapReport {
            provisioning,
            synchronization,
        })
    }

    /// Runs [`SessionBootstrap::run`] on a dedicated task.
    pub fn spawn(mut self) -> JoinHandle<Result<BootstrapReport, SyncError>> {
        tokio::spawn(async move {
            info!("sync: bootstrap worker started");
            let result = self.run().await;
            match &result {
                Ok(report) => info!(
                    provisioning = ?report.provisioning,
                    synchronization = ?report.synchronization,
                    "sync: bootstrap worker finished"
                ),
                Err(err) => warn!(error = %err, "sync: bootstrap worker aborted"),
            }
            result
        })
    }

    pub(crate) fn observe<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        if let Err(SyncError::LocalData { operation, source }) = &result {
            self.diagnostics.report_local_error(operation, source);
        }
        result
    }
}

#[cfg(test)]
#[path = "tests/bootstrap_tests.rs"]
mod tests;
