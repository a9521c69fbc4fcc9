use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};

use super::{StoreInfo, StorePlugin};
use crate::{
    cache::file_safe,
    certificate::CertificateInfo,
    error::Error,
};

fn base_name(certificate: &CertificateInfo) -> String {
    file_safe(
        certificate
            .common_name
            .as_deref()
            .unwrap_or(&certificate.thumbprint),
    )
}

async fn write_private(path: &Path, content: &[u8]) -> Result<(), Error> {
    tokio::fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Chain, leaf and key as PEM files.
pub struct PemFiles {
    path: Option<PathBuf>,
}

impl PemFiles {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn files(dir: &Path, certificate: &CertificateInfo) -> (PathBuf, PathBuf, PathBuf) {
        let name = base_name(certificate);
        (
            dir.join(format!("{}-chain.pem", name)),
            dir.join(format!("{}-crt.pem", name)),
            dir.join(format!("{}-key.pem", name)),
        )
    }
}

#[async_trait]
impl StorePlugin for PemFiles {
    fn disabled(&self) -> Option<String> {
        match &self.path {
            Some(_) => None,
            None => Some("no path configured for the PEM files".into()),
        }
    }

    async fn save(&self, certificate: &CertificateInfo) -> Result<Option<StoreInfo>, Error> {
        let dir = match &self.path {
            Some(dir) => dir,
            None => return Ok(None),
        };
        tokio::fs::create_dir_all(dir).await?;
        let (chain, leaf, key) = Self::files(dir, certificate);

        tokio::fs::write(&chain, certificate.chain_pem()?).await?;
        tokio::fs::write(&leaf, certificate.certificate().to_pem()?).await?;
        if let Some(private_key) = &certificate.private_key {
            write_private(&key, &private_key.private_key_to_pem_pkcs8()?).await?;
        }
        info!("Saved {} to {}", certificate.friendly_name(), chain.display());

        Ok(Some(StoreInfo {
            name: "PemFiles".into(),
            path: Some(dir.clone()),
        }))
    }

    async fn delete(&self, certificate: &CertificateInfo) -> Result<(), Error> {
        let dir = match &self.path {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let (chain, leaf, key) = Self::files(dir, certificate);
        // the files may already hold a newer certificate with the same name
        let stored = match tokio::fs::read(&leaf).await {
            Ok(pem) => CertificateInfo::from_pem(&pem, None)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if stored.thumbprint != certificate.thumbprint {
            debug!("{} holds another certificate, keeping it", leaf.display());
            return Ok(());
        }
        remove_if_exists(&chain).await?;
        remove_if_exists(&leaf).await?;
        remove_if_exists(&key).await
    }
}

/// A PKCS#12 file, optionally password protected.
pub struct PfxFile {
    path: Option<PathBuf>,
    password: Option<String>,
}

impl PfxFile {
    pub fn new(path: Option<PathBuf>, password: Option<String>) -> Self {
        Self { path, password }
    }

    fn password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

#[async_trait]
impl StorePlugin for PfxFile {
    fn disabled(&self) -> Option<String> {
        match &self.path {
            Some(_) => None,
            None => Some("no path configured for the PFX file".into()),
        }
    }

    async fn save(&self, certificate: &CertificateInfo) -> Result<Option<StoreInfo>, Error> {
        let dir = match &self.path {
            Some(dir) => dir,
            None => return Ok(None),
        };
        tokio::fs::create_dir_all(dir).await?;
        let file = dir.join(format!("{}.pfx", base_name(certificate)));
        write_private(&file, &certificate.to_pfx(self.password())?).await?;
        info!("Saved {} to {}", certificate.friendly_name(), file.display());

        Ok(Some(StoreInfo {
            name: "PfxFile".into(),
            path: Some(file),
        }))
    }

    async fn delete(&self, certificate: &CertificateInfo) -> Result<(), Error> {
        let dir = match &self.path {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let file = dir.join(format!("{}.pfx", base_name(certificate)));
        let stored = match tokio::fs::read(&file).await {
            Ok(der) => CertificateInfo::from_pfx(&der, self.password())?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if stored.thumbprint == certificate.thumbprint {
            remove_if_exists(&file).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn certificate() -> CertificateInfo {
        let c = test_support::chain("Root", "example.org", &["example.org"]);
        CertificateInfo::from_collection(vec![c.leaf, c.intermediate], Some(c.leaf_key)).unwrap()
    }

    #[tokio::test]
    async fn pem_files_are_written_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = PemFiles::new(Some(dir.path().to_path_buf()));
        let cert = certificate();

        let info = plugin.save(&cert).await.unwrap().unwrap();
        assert_eq!(info.path.as_deref(), Some(dir.path()));
        let chain = std::fs::read(dir.path().join("example.org-chain.pem")).unwrap();
        assert_eq!(CertificateInfo::from_pem(&chain, None).unwrap().chain.len(), 2);
        assert!(dir.path().join("example.org-key.pem").exists());

        plugin.delete(&cert).await.unwrap();
        assert!(!dir.path().join("example.org-crt.pem").exists());
    }

    #[tokio::test]
    async fn newer_files_survive_deleting_the_old_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = PfxFile::new(Some(dir.path().to_path_buf()), Some("secret".into()));
        let old = certificate();
        let new = certificate();

        plugin.save(&old).await.unwrap();
        plugin.save(&new).await.unwrap();
        plugin.delete(&old).await.unwrap();

        let der = std::fs::read(dir.path().join("example.org.pfx")).unwrap();
        let stored = CertificateInfo::from_pfx(&der, "secret").unwrap();
        assert_eq!(stored.thumbprint, new.thumbprint);
    }
}
