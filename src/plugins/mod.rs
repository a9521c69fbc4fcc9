//! The capabilities the engine calls into, one trait per plugin category.
//!
//! Concrete plugins are created from their persisted option bundles by a
//! [`PluginFactory`]; [`DefaultPluginFactory`] knows the built-in ones.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use openssl::pkey::{PKey, Private};

use crate::{
    certificate::CertificateInfo,
    error::Error,
    model::{Order, Renewal, Target},
    options::{
        CsrOptions, InstallationOptions, OrderOptions, StoreOptions, TargetOptions,
        ValidationOptions,
    },
    script::ScriptRunner,
    settings::Settings,
    types::ChallengeType,
    util::b64,
};

pub mod csr;
pub mod installation;
pub mod order;
pub mod store;
pub mod target;
pub mod validation;

#[async_trait]
pub trait TargetPlugin: Send + Sync {
    /// The reason this plugin cannot run, if any.
    fn disabled(&self) -> Option<String> {
        None
    }

    async fn generate(&self) -> Result<Target, Error>;
}

pub trait OrderPlugin: Send + Sync {
    fn split(&self, renewal: &Renewal, target: Target) -> Vec<Order>;
}

/// A signing request and the key that signed it.
pub struct CsrBundle {
    pub csr_der: Vec<u8>,
    pub private_key: PKey<Private>,
}

#[async_trait]
pub trait CsrPlugin: Send + Sync {
    /// Creates a CSR over `identifiers`.
    ///
    /// An existing key at `key_path` is reused, otherwise a fresh key is generated and
    /// written there when a path is given.
    async fn generate_csr(
        &self,
        key_path: Option<&Path>,
        common_name: &str,
        identifiers: &[String],
    ) -> Result<CsrBundle, Error>;

    fn post_process(&self, certificate: CertificateInfo) -> Result<CertificateInfo, Error> {
        Ok(certificate)
    }
}

/// Which phases of a validation group may run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    None,
    Prepare,
    Answer,
    PrepareAndAnswer,
}

impl Parallelism {
    pub fn prepare(self) -> bool {
        matches!(self, Parallelism::Prepare | Parallelism::PrepareAndAnswer)
    }

    pub fn answer(self) -> bool {
        matches!(self, Parallelism::Answer | Parallelism::PrepareAndAnswer)
    }
}

/// Everything needed to satisfy one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    /// As shown to the user, with a `*.` prefix for wildcard authorizations.
    pub identifier: String,
    pub challenge_type: ChallengeType,
    pub token: String,
    pub key_authorization: String,
}

impl ValidationContext {
    /// http-01 request path
    pub fn http_path(&self) -> String {
        format!("/.well-known/acme-challenge/{}", self.token)
    }

    pub fn http_content(&self) -> &str {
        &self.key_authorization
    }

    /// dns-01 TXT record name
    pub fn dns_record_name(&self) -> String {
        format!("_acme-challenge.{}", self.identifier.trim_start_matches("*."))
    }

    /// dns-01 TXT record value, the base64url SHA-256 of the key authorization
    pub fn dns_record_value(&self) -> String {
        b64(&openssl::sha::sha256(self.key_authorization.as_bytes()))
    }
}

#[async_trait]
pub trait ValidationPlugin: Send + Sync {
    fn parallelism(&self) -> Parallelism {
        Parallelism::None
    }

    fn disabled(&self) -> Option<String> {
        None
    }

    async fn prepare_challenge(&self, context: &ValidationContext) -> Result<(), Error>;

    /// Publishes everything prepared so far, once per group.
    async fn commit(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Undoes everything prepared so far.
    async fn cleanup(&self) -> Result<(), Error>;
}

/// Where a store plugin put a certificate, for the installation plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub name: String,
    pub path: Option<PathBuf>,
}

#[async_trait]
pub trait StorePlugin: Send + Sync {
    fn disabled(&self) -> Option<String> {
        None
    }

    async fn save(&self, certificate: &CertificateInfo) -> Result<Option<StoreInfo>, Error>;

    async fn delete(&self, certificate: &CertificateInfo) -> Result<(), Error>;
}

#[async_trait]
pub trait InstallationPlugin: Send + Sync {
    fn disabled(&self) -> Option<String> {
        None
    }

    /// Returns `false` when the installation did not succeed.
    async fn install(
        &self,
        stores: &[StoreInfo],
        new_certificate: &CertificateInfo,
        previous_certificate: Option<&CertificateInfo>,
    ) -> Result<bool, Error>;
}

/// Creates plugin instances from their option bundles.
pub trait PluginFactory: Send + Sync {
    fn target(&self, options: &TargetOptions) -> Box<dyn TargetPlugin>;
    fn order(&self, options: &OrderOptions) -> Box<dyn OrderPlugin>;
    fn csr(&self, options: &CsrOptions) -> Box<dyn CsrPlugin>;
    fn validation(&self, options: &ValidationOptions) -> Box<dyn ValidationPlugin>;
    fn store(&self, options: &StoreOptions) -> Box<dyn StorePlugin>;
    fn installation(&self, options: &InstallationOptions) -> Box<dyn InstallationPlugin>;
}

/// The built-in plugins.
pub struct DefaultPluginFactory {
    settings: Settings,
    scripts: ScriptRunner,
}

impl DefaultPluginFactory {
    pub fn new(settings: Settings) -> Self {
        let scripts = ScriptRunner::new(std::time::Duration::from_secs(
            settings.execution.script_timeout_secs,
        ));
        Self { settings, scripts }
    }
}

impl PluginFactory for DefaultPluginFactory {
    fn target(&self, options: &TargetOptions) -> Box<dyn TargetPlugin> {
        match options {
            TargetOptions::Manual {
                common_name,
                hosts,
                parts,
            } => Box::new(target::Manual::new(
                common_name.clone(),
                hosts.clone(),
                parts.clone(),
            )),
            TargetOptions::Csr { csr_file, pk_file } => {
                Box::new(target::CsrFile::new(csr_file.clone(), pk_file.clone()))
            }
        }
    }

    fn order(&self, options: &OrderOptions) -> Box<dyn OrderPlugin> {
        match options {
            OrderOptions::Single => Box::new(order::Single),
            OrderOptions::Host => Box::new(order::Host),
            OrderOptions::Site => Box::new(order::Site),
        }
    }

    fn csr(&self, options: &CsrOptions) -> Box<dyn CsrPlugin> {
        match options {
            CsrOptions::Rsa { key_bits, .. } => Box::new(csr::Rsa::new(*key_bits)),
            CsrOptions::Ec { curve, .. } => Box::new(csr::Ec::new(curve.as_deref())),
        }
    }

    fn validation(&self, options: &ValidationOptions) -> Box<dyn ValidationPlugin> {
        match options {
            ValidationOptions::SelfHosting { port } => {
                Box::new(validation::SelfHosting::new(*port))
            }
            ValidationOptions::FileSystem { web_root } => {
                Box::new(validation::FileSystem::new(web_root.clone()))
            }
            ValidationOptions::Script {
                create_script,
                create_arguments,
                delete_script,
                delete_arguments,
            } => Box::new(validation::Script::new(
                self.scripts.clone(),
                create_script.clone(),
                create_arguments.clone(),
                delete_script.clone(),
                delete_arguments.clone(),
            )),
        }
    }

    fn store(&self, options: &StoreOptions) -> Box<dyn StorePlugin> {
        match options {
            StoreOptions::PemFiles { path } => Box::new(store::PemFiles::new(
                path.clone()
                    .or_else(|| self.settings.store.default_pem_files_path.clone()),
            )),
            StoreOptions::PfxFile { path, password } => Box::new(store::PfxFile::new(
                path.clone()
                    .or_else(|| self.settings.store.default_pfx_path.clone()),
                password.clone(),
            )),
        }
    }

    fn installation(&self, options: &InstallationOptions) -> Box<dyn InstallationPlugin> {
        match options {
            InstallationOptions::Script { script, parameters } => Box::new(
                installation::Script::new(self.scripts.clone(), script.clone(), parameters.clone()),
            ),
            InstallationOptions::None => Box::new(installation::Nothing),
        }
    }
}
