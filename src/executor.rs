//! Runs one renewal end to end: target, orders, due dates, validation,
//! issuance, storage and installation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::{
    acme::AcmeTransport,
    cache::CertificateCache,
    due_date::{self, DueDatePolicy},
    error::Error,
    model::{OrderContext, Renewal, RenewResult, RunFlags},
    plugins::{PluginFactory, StoreInfo, StorePlugin},
    processor::OrderProcessor,
    script::ScriptRunner,
    settings::Settings,
    validator::Validator,
};

pub struct RenewalExecutor {
    transport: Arc<dyn AcmeTransport>,
    factory: Arc<dyn PluginFactory>,
    cache: Arc<CertificateCache>,
    settings: Arc<Settings>,
    due_date: Box<dyn DueDatePolicy>,
    scripts: ScriptRunner,
}

impl RenewalExecutor {
    /// An executor using the due date policy selected by the schedule settings.
    pub fn new(
        transport: Arc<dyn AcmeTransport>,
        factory: Arc<dyn PluginFactory>,
        cache: Arc<CertificateCache>,
        settings: Arc<Settings>,
    ) -> Self {
        let due_date = due_date::from_settings(&settings.schedule);
        let scripts = ScriptRunner::new(Duration::from_secs(
            settings.execution.script_timeout_secs,
        ));
        Self {
            transport,
            factory,
            cache,
            settings,
            due_date,
            scripts,
        }
    }

    pub fn with_due_date_policy(mut self, due_date: Box<dyn DueDatePolicy>) -> Self {
        self.due_date = due_date;
        self
    }

    /// Executes `renewal` once. Never fails: every problem ends up in the result.
    pub async fn execute(&self, renewal: &Renewal, flags: RunFlags, now: DateTime<Utc>) -> RenewResult {
        match self.run(renewal, flags, now).await {
            Ok(result) => result,
            Err(e) => {
                error!("Unexpected error renewing {}: {}", renewal.display_name(), e);
                RenewResult::failed(now, format!("Unexpected error: {}", e))
            }
        }
    }

    async fn run(&self, renewal: &Renewal, flags: RunFlags, now: DateTime<Utc>) -> Result<RenewResult, Error> {
        let run_everything = renewal.new || flags.force;
        if !run_everything && !self.due_date.should_run_renewal(renewal, now) {
            info!("Renewal {} is not due", renewal.display_name());
            return Ok(RenewResult::aborted(now));
        }

        let target_plugin = self.factory.target(&renewal.target_plugin_options);
        if let Some(reason) = target_plugin.disabled() {
            return Ok(RenewResult::failed(
                now,
                format!(
                    "Target plugin {} is disabled: {}",
                    renewal.target_plugin_options.name(),
                    reason
                ),
            ));
        }
        let target = match target_plugin.generate().await {
            Ok(target) => target,
            Err(e) => return Ok(RenewResult::failed(now, format!("Unable to generate target: {}", e))),
        };
        if !target.is_valid() {
            return Ok(RenewResult::failed(
                now,
                format!("Target {} is not valid", target.common_name),
            ));
        }

        let orders = self
            .factory
            .order(&renewal.order_plugin_options)
            .split(renewal, target);
        if orders.is_empty() {
            return Ok(RenewResult::failed(now, "Order plugin produced no orders"));
        }
        let mut contexts: Vec<OrderContext> = orders.into_iter().map(OrderContext::new).collect();

        let processor = OrderProcessor::new(
            self.transport.as_ref(),
            self.factory.as_ref(),
            &self.cache,
            &self.settings,
            flags,
        );
        processor.prepare(renewal, &mut contexts, now);
        if self.due_date.wants_renewal_info() {
            self.fetch_renewal_windows(&mut contexts).await;
        }

        let mut due: Vec<OrderContext> = if run_everything {
            contexts
        } else {
            contexts
                .into_iter()
                .filter(|context| self.due_date.should_run_order(renewal, context, now))
                .collect()
        };
        if due.is_empty() {
            info!("No orders of {} are due", renewal.display_name());
            return Ok(RenewResult::aborted(now));
        }

        let pre_script = renewal
            .pre_execution_script
            .as_ref()
            .or(self.settings.execution.default_pre_execution_script.as_ref());
        if let Some(script) = pre_script {
            self.run_hook("Pre-execution", script).await;
        }

        let result = self.process(renewal, &processor, &mut due, flags, now).await;

        let post_script = renewal
            .post_execution_script
            .as_ref()
            .or(self.settings.execution.default_post_execution_script.as_ref());
        if let Some(script) = post_script {
            self.run_hook("Post-execution", script).await;
        }

        Ok(result)
    }

    /// Runs a pre or post execution command line. Failures are only logged.
    async fn run_hook(&self, kind: &str, command: &str) {
        if let Err(e) = self.scripts.run_command_line(command).await {
            warn!("{} script failed: {}", kind, e);
        }
    }

    async fn fetch_renewal_windows(&self, contexts: &mut [OrderContext]) {
        for context in contexts.iter_mut() {
            let previous = match &context.previous_certificate {
                Some(previous) => previous,
                None => continue,
            };
            match self.transport.renewal_info(previous).await {
                Ok(window) => context.renewal_window = window,
                Err(e) => debug!(
                    "No renewal information for {}: {}",
                    context.order.friendly_name, e
                ),
            }
        }
    }

    async fn process(
        &self,
        renewal: &Renewal,
        processor: &OrderProcessor<'_>,
        contexts: &mut [OrderContext],
        flags: RunFlags,
        now: DateTime<Utc>,
    ) -> RenewResult {
        processor.create_orders(renewal, contexts).await;
        Validator::new(
            self.transport.as_ref(),
            self.factory.as_ref(),
            &self.settings,
            flags,
        )
        .authorize(renewal, contexts)
        .await;
        processor.download(renewal, contexts).await;

        let mut result = RenewResult::new(now);
        for context in contexts.iter_mut() {
            if !context.failed() {
                self.store_and_install(renewal, context).await;
            }
            let stop = context.result.success != Some(true);
            result.add_order_result(context.result.clone());
            if stop {
                break;
            }
        }
        result
    }

    async fn store_and_install(&self, renewal: &Renewal, context: &mut OrderContext) {
        let certificate = match context.certificate() {
            Some(certificate) => certificate.clone(),
            None => {
                context.result.add_error("No certificate available");
                return;
            }
        };

        let mut stores: Vec<Box<dyn StorePlugin>> = Vec::new();
        let mut infos: Vec<StoreInfo> = Vec::new();
        for options in &renewal.store_plugin_options {
            let plugin = self.factory.store(options);
            if let Some(reason) = plugin.disabled() {
                context
                    .result
                    .add_error(format!("Store plugin {} is disabled: {}", options.name(), reason));
                return;
            }
            match plugin.save(&certificate).await {
                Ok(info) => infos.extend(info),
                Err(e) => {
                    error!("Store {} failed for {}: {}", options.name(), context.order.friendly_name, e);
                    context
                        .result
                        .add_error(format!("Store plugin {} failed: {}", options.name(), e));
                    return;
                }
            }
            stores.push(plugin);
        }

        for options in &renewal.installation_plugin_options {
            let plugin = self.factory.installation(options);
            if let Some(reason) = plugin.disabled() {
                context.result.add_error(format!(
                    "Installation plugin {} is disabled: {}",
                    options.name(),
                    reason
                ));
                return;
            }
            let installed = plugin
                .install(&infos, &certificate, context.previous_certificate.as_ref())
                .await;
            match installed {
                Ok(true) => {}
                Ok(false) => context
                    .result
                    .add_error(format!("Installation plugin {} failed", options.name())),
                Err(e) => context
                    .result
                    .add_error(format!("Installation plugin {} failed: {}", options.name(), e)),
            }
        }
        if context.failed() {
            return;
        }

        context.result.success = Some(true);
        context.result.set_certificate(&certificate);
        info!(
            "Installed {} for {}",
            certificate.friendly_name(),
            context.order.friendly_name
        );

        let previous = match &context.previous_certificate {
            Some(previous) if previous.thumbprint != certificate.thumbprint => previous.clone(),
            _ => return,
        };
        if renewal.keep_existing {
            return;
        }
        for (plugin, options) in stores.iter().zip(renewal.store_plugin_options.iter()) {
            if let Err(e) = plugin.delete(&previous).await {
                warn!(
                    "Unable to remove {} from {}: {}",
                    previous.friendly_name(),
                    options.name(),
                    e
                );
                context.result.warnings.push(format!(
                    "Unable to remove previous certificate from {}: {}",
                    options.name(),
                    e
                ));
            }
        }
    }
}
