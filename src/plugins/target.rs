use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use openssl::{pkey::PKey, x509::X509Req};
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

use super::TargetPlugin;
use crate::{
    certificate,
    error::Error,
    model::{Target, TargetPart},
    options::ManualPart,
};

/// Identifiers entered by the user.
pub struct Manual {
    common_name: Option<String>,
    hosts: Vec<String>,
    parts: Vec<ManualPart>,
}

impl Manual {
    pub fn new(common_name: Option<String>, hosts: Vec<String>, parts: Vec<ManualPart>) -> Self {
        Self {
            common_name,
            hosts,
            parts,
        }
    }
}

#[async_trait]
impl TargetPlugin for Manual {
    async fn generate(&self) -> Result<Target, Error> {
        let parts: Vec<TargetPart> = if self.parts.is_empty() {
            vec![TargetPart {
                site_id: None,
                identifiers: self.hosts.clone(),
            }]
        } else {
            self.parts
                .iter()
                .map(|part| TargetPart {
                    site_id: Some(part.site_id),
                    identifiers: part.hosts.clone(),
                })
                .collect()
        };

        let common_name = self
            .common_name
            .clone()
            .or_else(|| {
                parts
                    .iter()
                    .flat_map(|part| part.identifiers.first())
                    .next()
                    .cloned()
            })
            .unwrap_or_default();
        Ok(Target::new(common_name, parts))
    }
}

/// A CSR prepared outside of this program; no CSR is generated for it.
pub struct CsrFile {
    csr_file: PathBuf,
    pk_file: Option<PathBuf>,
}

impl CsrFile {
    pub fn new(csr_file: PathBuf, pk_file: Option<PathBuf>) -> Self {
        Self { csr_file, pk_file }
    }
}

#[async_trait]
impl TargetPlugin for CsrFile {
    fn disabled(&self) -> Option<String> {
        if self.csr_file.exists() {
            None
        } else {
            Some(format!("CSR file {} not found", self.csr_file.display()))
        }
    }

    async fn generate(&self) -> Result<Target, Error> {
        let pem = tokio::fs::read(&self.csr_file).await?;
        let request = X509Req::from_pem(&pem)?;
        let der = request.to_der()?;

        let mut identifiers = dns_names(&der)?;
        let common_name = certificate::common_name(request.subject_name());
        if let Some(cn) = &common_name {
            if !identifiers.iter().any(|id| id.eq_ignore_ascii_case(cn)) {
                identifiers.insert(0, cn.clone());
            }
        }
        let common_name = common_name
            .or_else(|| identifiers.first().cloned())
            .unwrap_or_default();
        debug!(
            "CSR {} requests {} for {:?}",
            self.csr_file.display(),
            common_name,
            identifiers
        );

        let private_key = match &self.pk_file {
            Some(path) => Some(PKey::private_key_from_pem(&tokio::fs::read(path).await?)?),
            None => None,
        };

        let mut target = Target::new(
            common_name,
            vec![TargetPart {
                site_id: None,
                identifiers,
            }],
        );
        target.csr_bytes = Some(der);
        target.private_key = private_key;
        Ok(target)
    }
}

/// The DNS names of the subject alternative name extension of a DER CSR.
fn dns_names(der: &[u8]) -> Result<Vec<String>, Error> {
    let (_, request) = X509CertificationRequest::from_der(der)
        .map_err(|e| Error::Certificate(format!("unreadable CSR: {}", e)))?;
    let mut names = Vec::new();
    if let Some(extensions) = request.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support, util::request_csr};

    #[tokio::test]
    async fn manual_uses_first_host_as_common_name() {
        let plugin = Manual::new(None, vec!["www.example.org".into(), "example.org".into()], vec![]);
        let target = plugin.generate().await.unwrap();
        assert_eq!(target.common_name, "www.example.org");
        assert_eq!(target.parts.len(), 1);
        assert!(target.is_valid());
    }

    #[tokio::test]
    async fn manual_parts_keep_their_sites() {
        let plugin = Manual::new(
            Some("a.example.org".into()),
            vec![],
            vec![
                ManualPart {
                    site_id: 1,
                    hosts: vec!["a.example.org".into()],
                },
                ManualPart {
                    site_id: 2,
                    hosts: vec!["b.example.org".into()],
                },
            ],
        );
        let target = plugin.generate().await.unwrap();
        assert_eq!(target.site_ids(), vec![1, 2]);
        assert_eq!(target.alternative_names(), vec!["a.example.org", "b.example.org"]);
    }

    #[tokio::test]
    async fn csr_file_reads_names_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_support::key();
        let csr = request_csr(&key, "example.org", &["www.example.org".to_string()]).unwrap();
        let csr_path = dir.path().join("request.pem");
        std::fs::write(&csr_path, csr.to_pem().unwrap()).unwrap();
        let key_path = dir.path().join("request.key");
        std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();

        let plugin = CsrFile::new(csr_path, Some(key_path));
        assert!(plugin.disabled().is_none());
        let target = plugin.generate().await.unwrap();
        assert_eq!(target.common_name, "example.org");
        assert_eq!(target.alternative_names(), vec!["example.org", "www.example.org"]);
        assert_eq!(target.csr_bytes, Some(csr.to_der().unwrap()));
        assert!(target.private_key.is_some());
    }

    #[test]
    fn missing_csr_file_disables_the_plugin() {
        let plugin = CsrFile::new(PathBuf::from("/nonexistent/request.pem"), None);
        assert!(plugin.disabled().is_some());
    }
}
