use std::path::Path;

use async_trait::async_trait;
use log::{debug, info};
use openssl::{
    nid::Nid,
    pkey::{PKey, Private},
};

use super::{CsrBundle, CsrPlugin};
use crate::{
    error::Error,
    util::{generate_ec_key, generate_rsa_key, load_private_key, request_csr, save_private_key, KEY_WIDTH},
};

/// Loads the key at `key_path` if there is one, otherwise generates a new one and saves it there.
fn key_for(
    key_path: Option<&Path>,
    generate: impl FnOnce() -> Result<PKey<Private>, Error>,
) -> Result<PKey<Private>, Error> {
    match key_path {
        Some(path) if path.exists() => {
            debug!("Reusing private key {}", path.display());
            load_private_key(path)
        }
        Some(path) => {
            let key = generate()?;
            save_private_key(path, &key)?;
            info!("Saved new private key to {}", path.display());
            Ok(key)
        }
        None => generate(),
    }
}

fn bundle(key: PKey<Private>, common_name: &str, identifiers: &[String]) -> Result<CsrBundle, Error> {
    let csr = request_csr(&key, common_name, identifiers)?;
    Ok(CsrBundle {
        csr_der: csr.to_der()?,
        private_key: key,
    })
}

pub struct Rsa {
    bits: u32,
}

impl Rsa {
    pub fn new(bits: Option<u32>) -> Self {
        Self {
            bits: bits.unwrap_or(KEY_WIDTH),
        }
    }
}

#[async_trait]
impl CsrPlugin for Rsa {
    async fn generate_csr(
        &self,
        key_path: Option<&Path>,
        common_name: &str,
        identifiers: &[String],
    ) -> Result<CsrBundle, Error> {
        let key = key_for(key_path, || generate_rsa_key(self.bits))?;
        bundle(key, common_name, identifiers)
    }
}

pub struct Ec {
    curve: Nid,
}

impl Ec {
    pub fn new(curve: Option<&str>) -> Self {
        let curve = match curve {
            Some("P-384") | Some("secp384r1") => Nid::SECP384R1,
            _ => Nid::X9_62_PRIME256V1,
        };
        Self { curve }
    }
}

#[async_trait]
impl CsrPlugin for Ec {
    async fn generate_csr(
        &self,
        key_path: Option<&Path>,
        common_name: &str,
        identifiers: &[String],
    ) -> Result<CsrBundle, Error> {
        let key = key_for(key_path, || generate_ec_key(self.curve))?;
        bundle(key, common_name, identifiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::x509::X509Req;

    #[tokio::test]
    async fn key_file_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.keys");
        let plugin = Ec::new(None);
        let names = vec!["example.org".to_string()];

        let first = plugin
            .generate_csr(Some(&path), "example.org", &names)
            .await
            .unwrap();
        assert!(path.exists());
        let second = plugin
            .generate_csr(Some(&path), "example.org", &names)
            .await
            .unwrap();
        assert!(first.private_key.public_eq(&second.private_key));

        let request = X509Req::from_der(&second.csr_der).unwrap();
        assert!(request.verify(&second.private_key).unwrap());
    }

    #[tokio::test]
    async fn without_a_path_every_key_is_fresh() {
        let plugin = Ec::new(Some("P-384"));
        let names = vec!["example.org".to_string()];
        let first = plugin.generate_csr(None, "example.org", &names).await.unwrap();
        let second = plugin.generate_csr(None, "example.org", &names).await.unwrap();
        assert!(!first.private_key.public_eq(&second.private_key));
    }
}
