use async_trait::async_trait;
use log::{error, info};

use super::{InstallationPlugin, StoreInfo};
use crate::{
    certificate::CertificateInfo,
    error::Error,
    script::{substitute, ScriptRunner},
};

/// Runs a user script after the certificate has been stored.
///
/// The parameters may use `{CertThumbprint}`, `{OldCertThumbprint}`, `{CommonName}`,
/// `{CacheFile}` and `{StorePath}`.
pub struct Script {
    runner: ScriptRunner,
    script: String,
    parameters: Option<String>,
}

impl Script {
    pub fn new(runner: ScriptRunner, script: String, parameters: Option<String>) -> Self {
        Self {
            runner,
            script,
            parameters,
        }
    }

    fn arguments(
        &self,
        stores: &[StoreInfo],
        new_certificate: &CertificateInfo,
        previous_certificate: Option<&CertificateInfo>,
    ) -> Option<String> {
        let parameters = self.parameters.as_deref()?;
        let cache_file = new_certificate
            .cache_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let store_path = stores
            .iter()
            .find_map(|store| store.path.as_ref())
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        Some(substitute(
            parameters,
            &[
                ("CertThumbprint", new_certificate.thumbprint.as_str()),
                (
                    "OldCertThumbprint",
                    previous_certificate
                        .map(|previous| previous.thumbprint.as_str())
                        .unwrap_or(""),
                ),
                (
                    "CommonName",
                    new_certificate.common_name.as_deref().unwrap_or(""),
                ),
                ("CacheFile", cache_file.as_str()),
                ("StorePath", store_path.as_str()),
            ],
        ))
    }
}

#[async_trait]
impl InstallationPlugin for Script {
    async fn install(
        &self,
        stores: &[StoreInfo],
        new_certificate: &CertificateInfo,
        previous_certificate: Option<&CertificateInfo>,
    ) -> Result<bool, Error> {
        let arguments = self.arguments(stores, new_certificate, previous_certificate);
        match self.runner.run(&self.script, arguments.as_deref()).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!("Installation script {} failed: {}", self.script, e);
                Ok(false)
            }
        }
    }
}

/// No installation step.
pub struct Nothing;

#[async_trait]
impl InstallationPlugin for Nothing {
    async fn install(
        &self,
        _stores: &[StoreInfo],
        new_certificate: &CertificateInfo,
        _previous_certificate: Option<&CertificateInfo>,
    ) -> Result<bool, Error> {
        info!("No installation steps for {}", new_certificate.friendly_name());
        Ok(true)
    }
}
