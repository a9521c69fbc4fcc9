//! Runs, lists, cancels and revokes the persisted renewals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::{
    acme::AcmeTransport,
    cache::CertificateCache,
    error::Error,
    executor::RenewalExecutor,
    model::{Renewal, RenewResult, RunFlags},
    notify::Notifier,
    plugins::PluginFactory,
    renewal_store::RenewalStore,
    settings::Settings,
};

pub struct RenewalManager {
    store: RenewalStore,
    cache: Arc<CertificateCache>,
    transport: Arc<dyn AcmeTransport>,
    settings: Arc<Settings>,
    executor: RenewalExecutor,
    notifier: Box<dyn Notifier>,
}

impl RenewalManager {
    pub fn new(
        store: RenewalStore,
        cache: Arc<CertificateCache>,
        transport: Arc<dyn AcmeTransport>,
        factory: Arc<dyn PluginFactory>,
        settings: Arc<Settings>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let executor = RenewalExecutor::new(
            Arc::clone(&transport),
            factory,
            Arc::clone(&cache),
            Arc::clone(&settings),
        );
        Self {
            store,
            cache,
            transport,
            settings,
            executor,
            notifier,
        }
    }

    pub fn with_executor(mut self, executor: RenewalExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn list(&self) -> Result<Vec<Renewal>, Error> {
        self.store.list()
    }

    fn find(&self, id: &str) -> Result<Renewal, Error> {
        find(&self.store, id)
    }

    /// Runs every renewal, or only the one named by `id`.
    pub async fn run_all(
        &self,
        flags: RunFlags,
        id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RenewResult>, Error> {
        let renewals = match id {
            Some(id) => vec![self.find(id)?],
            None => self.store.list()?,
        };

        let stale = self.cache.delete_stale_files(now)?;
        if stale > 0 && self.settings.cache.delete_stale_files {
            info!("Removed {} stale cache files", stale);
        }

        let mut results = Vec::with_capacity(renewals.len());
        for mut renewal in renewals {
            match self.run(&mut renewal, flags, now).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("Unable to record the run of {}: {}", renewal.display_name(), e);
                    results.push(RenewResult::failed(
                        now,
                        format!("Unable to save renewal: {}", e),
                    ));
                }
            }
        }
        Ok(results)
    }

    /// Executes one renewal, records the result in its history and saves it.
    pub async fn run(
        &self,
        renewal: &mut Renewal,
        flags: RunFlags,
        now: DateTime<Utc>,
    ) -> Result<RenewResult, Error> {
        info!("Running renewal {}", renewal.display_name());
        let result = self.executor.execute(renewal, flags, now).await;
        renewal.history.push(result.clone());
        renewal.updated = true;
        renewal.new = false;
        self.store.save(renewal)?;

        match result.success {
            Some(true) => self.notifier.notify_success(renewal, &result),
            Some(false) => self.notifier.notify_failure(renewal, &result),
            None => {}
        }
        Ok(result)
    }

    pub fn cancel(&self, id: &str) -> Result<(), Error> {
        cancel(&self.store, &self.cache, id)
    }

    /// Revokes every cached certificate of the renewal. The cache is cleared
    /// only when all revocations went through.
    pub async fn revoke(&self, id: &str) -> Result<usize, Error> {
        let renewal = self.find(id)?;
        let certificates = self.cache.all_certificates(&renewal)?;
        let mut revoked = 0;
        for certificate in &certificates {
            let der = certificate.certificate().to_der()?;
            match self.transport.revoke_certificate(&der).await {
                Ok(()) => {
                    info!("Revoked {}", certificate.friendly_name());
                    revoked += 1;
                }
                Err(e) => warn!("Unable to revoke {}: {}", certificate.friendly_name(), e),
            }
        }
        if revoked == certificates.len() {
            self.cache.delete(&renewal)?;
        }
        Ok(revoked)
    }
}

fn find(store: &RenewalStore, id: &str) -> Result<Renewal, Error> {
    store
        .load(id)?
        .ok_or_else(|| Error::Config(format!("no renewal with id {}", id)))
}

/// Removes the renewal and everything cached for it. Needs no connection to the CA.
pub fn cancel(store: &RenewalStore, cache: &CertificateCache, id: &str) -> Result<(), Error> {
    let mut renewal = find(store, id)?;
    renewal.deleted = true;
    let removed = cache.delete(&renewal)?;
    store.save(&renewal)?;
    info!(
        "Cancelled renewal {}, removed {} cache files",
        renewal.display_name(),
        removed
    );
    Ok(())
}
