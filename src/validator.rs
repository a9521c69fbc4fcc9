//! Drives the authorizations of a batch of orders to `valid`.
//!
//! Authorizations are grouped by the validation options that handle them. Each
//! group gets one plugin instance and runs prepare, commit, answer and cleanup,
//! concurrently where the plugin allows it.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info, warn};

use crate::{
    acme::{poll, AcmeTransport},
    model::{OrderContext, Renewal, RunFlags},
    options::ValidationOptions,
    plugins::{Parallelism, PluginFactory, ValidationContext, ValidationPlugin},
    settings::Settings,
    types::{Authorization, Challenge, StatusType},
};

/// One authorization on its way through a validation group.
struct AuthorizationContext {
    /// Index of the owning order context.
    order: usize,
    authorization: Authorization,
    challenge: Option<Challenge>,
    error: Option<String>,
}

impl AuthorizationContext {
    fn new(order: usize, authorization: Authorization) -> Self {
        Self {
            order,
            authorization,
            challenge: None,
            error: None,
        }
    }

    fn identifier(&self) -> String {
        self.authorization.display_identifier()
    }

    fn fail<T: Into<String>>(&mut self, message: T) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }
}

struct ValidationGroup {
    options: Arc<ValidationOptions>,
    members: Vec<AuthorizationContext>,
}

pub struct Validator<'a> {
    transport: &'a dyn AcmeTransport,
    factory: &'a dyn PluginFactory,
    settings: &'a Settings,
    flags: RunFlags,
}

impl<'a> Validator<'a> {
    pub fn new(
        transport: &'a dyn AcmeTransport,
        factory: &'a dyn PluginFactory,
        settings: &'a Settings,
        flags: RunFlags,
    ) -> Self {
        Self {
            transport,
            factory,
            settings,
            flags,
        }
    }

    /// Authorizes every order that still needs a certificate from the CA.
    ///
    /// Failures are recorded on the order they belong to; the other orders carry on.
    pub async fn authorize(&self, renewal: &Renewal, contexts: &mut [OrderContext]) {
        let fetched = self.fetch_authorizations(contexts).await;
        let groups = self.group(renewal, contexts, fetched);
        if groups.is_empty() {
            debug!("Nothing to authorize for {}", renewal.id);
            return;
        }
        info!(
            "Authorizing {} identifier(s) for {} in {} group(s)",
            groups.iter().map(|group| group.members.len()).sum::<usize>(),
            renewal.id,
            groups.len()
        );

        let finished: Vec<Vec<AuthorizationContext>> =
            if self.settings.validation.disable_multi_threading {
                let mut finished = Vec::with_capacity(groups.len());
                for group in groups {
                    finished.push(self.run_group(group).await);
                }
                finished
            } else {
                join_all(groups.into_iter().map(|group| self.run_group(group))).await
            };

        for member in finished.into_iter().flatten() {
            if let Some(message) = member.error {
                error!("{}", message);
                contexts[member.order].result.add_error(message);
            }
        }
    }

    fn needs_authorization(&self, context: &OrderContext) -> bool {
        if context.failed() || context.from_cache() {
            return false;
        }
        match &context.order.details {
            Some(details) => {
                !matches!(details.status, StatusType::Ready | StatusType::Valid)
                    || self.flags.bypass_valid_authorizations()
            }
            None => false,
        }
    }

    /// Fetches all authorizations of all orders at once. An order with a failed fetch
    /// gets the error and none of its authorizations are returned.
    async fn fetch_authorizations(
        &self,
        contexts: &mut [OrderContext],
    ) -> Vec<(usize, Authorization)> {
        let mut requests = Vec::new();
        for (index, context) in contexts.iter().enumerate() {
            if !self.needs_authorization(context) {
                continue;
            }
            if let Some(details) = &context.order.details {
                for url in &details.authorizations {
                    requests.push((index, url.clone()));
                }
            }
        }

        let responses = join_all(requests.iter().map(|(index, url)| async move {
            (*index, url, self.transport.get_authorization(url).await)
        }))
        .await;

        let mut fetched = Vec::new();
        for (index, url, response) in responses {
            match response {
                Ok(authorization) => fetched.push((index, authorization)),
                Err(e) => {
                    let context = &mut contexts[index];
                    warn!(
                        "Unable to get authorization {} for {}: {}",
                        url, context.order.friendly_name, e
                    );
                    context
                        .result
                        .add_error(format!("Unable to get authorization details: {}", e));
                }
            }
        }
        fetched.retain(|(index, _)| !contexts[*index].failed());
        fetched
    }

    /// Groups authorizations by the options instance that validates them.
    fn group(
        &self,
        renewal: &Renewal,
        contexts: &mut [OrderContext],
        fetched: Vec<(usize, Authorization)>,
    ) -> Vec<ValidationGroup> {
        let mut groups: Vec<ValidationGroup> = Vec::new();
        for (index, authorization) in fetched {
            let identifier = authorization.display_identifier();
            match authorization.status {
                StatusType::Valid if !self.flags.bypass_valid_authorizations() => {
                    debug!("Authorization for {} is still valid", identifier);
                    continue;
                }
                StatusType::Valid | StatusType::Pending => {}
                status => {
                    contexts[index]
                        .result
                        .add_error(format!("Authorization for {} is {}", identifier, status));
                    continue;
                }
            }

            let options = self
                .settings
                .validation
                .pinned_for(&identifier)
                .unwrap_or_else(|| Arc::clone(&renewal.validation_plugin_options));
            let member = AuthorizationContext::new(index, authorization);
            match groups
                .iter_mut()
                .find(|group| Arc::ptr_eq(&group.options, &options))
            {
                Some(group) => group.members.push(member),
                None => groups.push(ValidationGroup {
                    options,
                    members: vec![member],
                }),
            }
        }
        groups
    }

    async fn run_group(&self, group: ValidationGroup) -> Vec<AuthorizationContext> {
        let ValidationGroup {
            options,
            mut members,
        } = group;
        let plugin = self.factory.validation(&options);

        if let Some(reason) = plugin.disabled() {
            for member in members.iter_mut() {
                member.fail(format!(
                    "Validation plugin {} is disabled: {}",
                    options.name(),
                    reason
                ));
            }
            return members;
        }

        let parallelism = if self.settings.validation.disable_multi_threading {
            Parallelism::None
        } else {
            plugin.parallelism()
        };

        if parallelism == Parallelism::None {
            for member in members.iter_mut() {
                self.run_single(plugin.as_ref(), &options, member).await;
            }
        } else {
            self.run_phased(plugin.as_ref(), &options, parallelism, &mut members)
                .await;
        }
        members
    }

    /// Prepare, commit, answer and clean up one authorization.
    async fn run_single(
        &self,
        plugin: &dyn ValidationPlugin,
        options: &ValidationOptions,
        member: &mut AuthorizationContext,
    ) {
        self.prepare(plugin, options, member).await;
        if member.error.is_none() {
            if let Err(e) = plugin.commit().await {
                member.fail(format!("Commit failed: {}", e));
            } else {
                self.answer(member).await;
            }
        }
        cleanup(plugin, options).await;
    }

    async fn run_phased(
        &self,
        plugin: &dyn ValidationPlugin,
        options: &ValidationOptions,
        parallelism: Parallelism,
        members: &mut [AuthorizationContext],
    ) {
        if parallelism.prepare() {
            join_all(
                members
                    .iter_mut()
                    .map(|member| self.prepare(plugin, options, member)),
            )
            .await;
        } else {
            for member in members.iter_mut() {
                self.prepare(plugin, options, member).await;
                if member.error.is_some() {
                    break;
                }
            }
        }

        if members.iter().any(|member| member.error.is_some()) {
            for member in members.iter_mut() {
                member.fail("Validation skipped, another challenge of the group failed");
            }
            cleanup(plugin, options).await;
            return;
        }

        if let Err(e) = plugin.commit().await {
            for member in members.iter_mut() {
                member.fail(format!("Commit failed: {}", e));
            }
            cleanup(plugin, options).await;
            return;
        }

        if parallelism.answer() {
            join_all(members.iter_mut().map(|member| self.answer(member))).await;
        } else {
            for member in members.iter_mut() {
                self.answer(member).await;
            }
        }

        cleanup(plugin, options).await;
    }

    /// Picks the challenge and hands it to the plugin.
    async fn prepare(
        &self,
        plugin: &dyn ValidationPlugin,
        options: &ValidationOptions,
        member: &mut AuthorizationContext,
    ) {
        let challenge_type = options.challenge_type();
        let identifier = member.identifier();
        let challenge = match member
            .authorization
            .challenges
            .iter()
            .find(|challenge| challenge.is_type(challenge_type))
        {
            Some(challenge) => challenge.clone(),
            None => {
                member.fail(format!(
                    "No {} challenge offered for {}",
                    challenge_type, identifier
                ));
                return;
            }
        };

        if challenge.status == StatusType::Valid {
            debug!("Challenge for {} is already valid", identifier);
            member.challenge = Some(challenge);
            return;
        }

        let key_authorization = match self.transport.key_authorization(&challenge.token) {
            Ok(key_authorization) => key_authorization,
            Err(e) => {
                member.fail(format!("Unable to compute key authorization: {}", e));
                return;
            }
        };
        let context = ValidationContext {
            identifier: identifier.clone(),
            challenge_type,
            token: challenge.token.clone(),
            key_authorization,
        };
        match plugin.prepare_challenge(&context).await {
            Ok(()) => member.challenge = Some(challenge),
            Err(e) => member.fail(format!(
                "Preparing {} challenge for {} failed: {}",
                challenge_type, identifier, e
            )),
        }
    }

    /// Submits the answer and waits a bounded time for the CA to check it.
    async fn answer(&self, member: &mut AuthorizationContext) {
        let challenge = match &member.challenge {
            Some(challenge) if member.error.is_none() => challenge.clone(),
            _ => return,
        };
        let identifier = member.identifier();
        if challenge.status == StatusType::Valid && !self.flags.bypass_valid_authorizations() {
            return;
        }

        let mut current = match self.transport.answer_challenge(&challenge).await {
            Ok(current) => current,
            Err(e) => {
                member.fail(format!("Answering challenge for {} failed: {}", identifier, e));
                return;
            }
        };
        if current.status.is_transient() {
            let url = current.url.clone();
            current = match poll(
                &format!("Challenge for {}", identifier),
                self.settings.acme.max_poll_attempts,
                self.settings.acme.poll_interval(),
                || self.transport.get_challenge(&url),
                |challenge: &Challenge| !challenge.status.is_transient(),
            )
            .await
            {
                Ok(current) => current,
                Err(e) => {
                    member.fail(format!("Validation of {} failed: {}", identifier, e));
                    return;
                }
            };
        }

        match current.status {
            StatusType::Valid => {
                info!("Authorization for {} is valid", identifier);
                member.challenge = Some(current);
            }
            status => {
                let reason = current
                    .error
                    .as_ref()
                    .map(|problem| problem.to_string())
                    .unwrap_or_else(|| format!("challenge is {}", status));
                member.fail(format!("Authorization for {} failed: {}", identifier, reason));
            }
        }
    }
}

async fn cleanup(plugin: &dyn ValidationPlugin, options: &ValidationOptions) {
    if let Err(e) = plugin.cleanup().await {
        warn!("Cleanup of {} validation failed: {}", options.name(), e);
    }
}
