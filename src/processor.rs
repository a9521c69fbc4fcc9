//! Resolves cached certificates, creates ACME orders and downloads what the CA issued.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use openssl::x509::X509Req;

use crate::{
    acme::AcmeTransport,
    cache::CertificateCache,
    certificate::{select_preferred_issuer, CertificateInfo, PFX_PASSWORD},
    error::Error,
    model::{OrderContext, Renewal, RunFlags},
    plugins::{CsrPlugin, PluginFactory},
    settings::Settings,
    types::{Identifier, StatusType},
};

pub struct OrderProcessor<'a> {
    transport: &'a dyn AcmeTransport,
    factory: &'a dyn PluginFactory,
    cache: &'a CertificateCache,
    settings: &'a Settings,
    flags: RunFlags,
}

impl<'a> OrderProcessor<'a> {
    pub fn new(
        transport: &'a dyn AcmeTransport,
        factory: &'a dyn PluginFactory,
        cache: &'a CertificateCache,
        settings: &'a Settings,
        flags: RunFlags,
    ) -> Self {
        Self {
            transport,
            factory,
            cache,
            settings,
            flags,
        }
    }

    /// Looks up the previous and the reusable cached certificate of every order.
    ///
    /// These are separate questions: the previous certificate is the latest one of
    /// the order's scope whatever it covers, the cached one must match the fingerprint.
    pub fn prepare(&self, renewal: &Renewal, contexts: &mut [OrderContext], now: DateTime<Utc>) {
        for context in contexts.iter_mut() {
            match self.cache.previous(renewal, &context.order) {
                Ok(previous) => context.previous_certificate = previous,
                Err(e) => warn!(
                    "Unable to read the previous certificate of {}: {}",
                    context.order.friendly_name, e
                ),
            }
            if self.flags.ignore_cache {
                continue;
            }
            match self.cache.lookup(renewal, &context.order, now) {
                Ok(Some(cached)) => {
                    info!(
                        "Reusing cached certificate {} for {}",
                        cached.friendly_name(),
                        context.order.friendly_name
                    );
                    context.cached_certificate = Some(cached);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Unable to read the cache of {}: {}",
                    context.order.friendly_name, e
                ),
            }
        }
    }

    /// Creates (or resumes) an ACME order for every context not served from the cache.
    pub async fn create_orders(&self, renewal: &Renewal, contexts: &mut [OrderContext]) {
        for context in contexts
            .iter_mut()
            .filter(|context| !context.from_cache() && !context.failed())
        {
            if let Err(e) = self.create_order(renewal, context).await {
                warn!("Unable to create order for {}: {}", context.order.friendly_name, e);
                context
                    .result
                    .add_error(format!("Unable to create order: {}", e));
            }
        }
    }

    async fn create_order(&self, renewal: &Renewal, context: &mut OrderContext) -> Result<(), Error> {
        if let Some(cached) = self.cache.cached_order(renewal, &context.order)? {
            match self.transport.get_order(&cached.url).await {
                Ok(existing) if matches!(existing.status, StatusType::Pending | StatusType::Ready) => {
                    info!("Resuming {} order {}", existing.status, existing.url);
                    context.order.details = Some(existing);
                    return Ok(());
                }
                Ok(existing) => debug!("Cached order {} is {}", existing.url, existing.status),
                Err(e) => debug!("Cached order {} is gone: {}", cached.url, e),
            }
            self.cache.delete_order(renewal, &context.order)?;
        }

        let identifiers: Vec<Identifier> = context
            .order
            .target
            .alternative_names()
            .into_iter()
            .map(Identifier::dns)
            .collect();
        let created = self.transport.create_order(&identifiers).await?;
        if created.status == StatusType::Invalid {
            let reason = created
                .error
                .as_ref()
                .map(|problem| problem.to_string())
                .unwrap_or_else(|| "order is invalid".to_owned());
            return Err(Error::Protocol(reason));
        }
        info!("Created order {} for {}", created.url, context.order.friendly_name);
        self.cache.store_order(renewal, &context.order, &created)?;
        context.order.details = Some(created);
        Ok(())
    }

    /// Finalizes and downloads every authorized order, all at once.
    pub async fn download(&self, renewal: &Renewal, contexts: &mut [OrderContext]) {
        let csr_plugin = self.factory.csr(&renewal.csr_plugin_options);
        let csr_plugin = csr_plugin.as_ref();
        join_all(
            contexts
                .iter_mut()
                .filter(|context| {
                    !context.failed() && !context.from_cache() && context.order.details.is_some()
                })
                .map(|context| async move {
                    if let Err(e) = self.download_one(renewal, csr_plugin, context).await {
                        warn!(
                            "Unable to get the certificate for {}: {}",
                            context.order.friendly_name, e
                        );
                        context
                            .result
                            .add_error(format!("Unable to get certificate: {}", e));
                    }
                }),
        )
        .await;
    }

    async fn download_one(
        &self,
        renewal: &Renewal,
        csr_plugin: &dyn CsrPlugin,
        context: &mut OrderContext,
    ) -> Result<(), Error> {
        let details = match &context.order.details {
            Some(details) => details.clone(),
            None => return Err(Error::Protocol("no ACME order".into())),
        };

        let target = &context.order.target;
        let (csr_der, private_key) = match &target.csr_bytes {
            Some(bytes) => (bytes.clone(), target.private_key.clone()),
            None => {
                let key_path = if renewal.csr_plugin_options.reuse_private_key() {
                    Some(self.cache.key_path(renewal, &context.order)?)
                } else {
                    None
                };
                let bundle = csr_plugin
                    .generate_csr(
                        key_path.as_deref(),
                        &target.common_name,
                        &target.alternative_names(),
                    )
                    .await?;
                (bundle.csr_der, Some(bundle.private_key))
            }
        };
        let csr_pem = X509Req::from_der(&csr_der)?.to_pem()?;
        self.cache.store_csr(renewal, &context.order, &csr_pem)?;

        let finalized = if details.status == StatusType::Valid {
            details
        } else {
            self.transport.submit_csr(&details, &csr_der).await?
        };
        if finalized.status != StatusType::Valid {
            let reason = finalized
                .error
                .as_ref()
                .map(|problem| problem.to_string())
                .unwrap_or_else(|| format!("order is {}", finalized.status));
            return Err(Error::Protocol(reason));
        }

        let downloaded = self.transport.get_certificate(&finalized).await?;
        let mut alternatives = vec![CertificateInfo::from_pem(
            &downloaded.chain_pem,
            private_key.clone(),
        )?];
        for url in &downloaded.alternates {
            let alternate = match self.transport.get_alternate(url).await {
                Ok(pem) => CertificateInfo::from_pem(&pem, private_key.clone()),
                Err(e) => Err(e),
            };
            match alternate {
                Ok(alternate) => alternatives.push(alternate),
                Err(e) => warn!("Ignoring alternate chain {}: {}", url, e),
            }
        }
        let selected = select_preferred_issuer(
            &alternatives,
            self.settings.acme.preferred_issuer.as_deref(),
        )
        .cloned()
        .ok_or_else(|| Error::Certificate("no certificate in the response".into()))?;
        let selected = csr_plugin.post_process(selected)?;

        let stored = self
            .cache
            .store(renewal, &context.order, &selected.to_pfx(PFX_PASSWORD)?)?;
        self.cache.delete_order(renewal, &context.order)?;
        info!(
            "Got certificate {} for {}",
            stored.friendly_name(),
            context.order.friendly_name
        );
        context.order.details = Some(finalized);
        context.new_certificate = Some(stored);
        Ok(())
    }
}
