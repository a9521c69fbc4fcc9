//! Plugin option bundles stored with a renewal.
//!
//! Each category is a sum type tagged by a `"Plugin"` discriminator in the
//! persisted json, e.g. `{ "Plugin": "FileSystem", "web_root": "/var/www" }`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::ChallengeType;

/// One site (binding group) of a manually entered target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualPart {
    pub site_id: i64,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Plugin")]
pub enum TargetOptions {
    Manual {
        #[serde(default)]
        common_name: Option<String>,
        #[serde(default)]
        hosts: Vec<String>,
        #[serde(default)]
        parts: Vec<ManualPart>,
    },
    Csr {
        csr_file: PathBuf,
        #[serde(default)]
        pk_file: Option<PathBuf>,
    },
}

impl TargetOptions {
    pub fn name(&self) -> &'static str {
        match self {
            TargetOptions::Manual { .. } => "Manual",
            TargetOptions::Csr { .. } => "Csr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Plugin")]
pub enum OrderOptions {
    Single,
    Host,
    Site,
}

impl Default for OrderOptions {
    fn default() -> Self {
        OrderOptions::Single
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Plugin")]
pub enum CsrOptions {
    Rsa {
        #[serde(default)]
        key_bits: Option<u32>,
        #[serde(default)]
        reuse_private_key: bool,
    },
    Ec {
        /// `P-256` (default) or `P-384`
        #[serde(default)]
        curve: Option<String>,
        #[serde(default)]
        reuse_private_key: bool,
    },
}

impl Default for CsrOptions {
    fn default() -> Self {
        CsrOptions::Rsa {
            key_bits: None,
            reuse_private_key: false,
        }
    }
}

impl CsrOptions {
    pub fn reuse_private_key(&self) -> bool {
        match self {
            CsrOptions::Rsa {
                reuse_private_key, ..
            }
            | CsrOptions::Ec {
                reuse_private_key, ..
            } => *reuse_private_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Plugin")]
pub enum ValidationOptions {
    SelfHosting {
        #[serde(default)]
        port: Option<u16>,
    },
    FileSystem {
        web_root: PathBuf,
    },
    Script {
        create_script: String,
        #[serde(default)]
        create_arguments: Option<String>,
        #[serde(default)]
        delete_script: Option<String>,
        #[serde(default)]
        delete_arguments: Option<String>,
    },
}

impl ValidationOptions {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationOptions::SelfHosting { .. } => "SelfHosting",
            ValidationOptions::FileSystem { .. } => "FileSystem",
            ValidationOptions::Script { .. } => "Script",
        }
    }

    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            ValidationOptions::SelfHosting { .. } | ValidationOptions::FileSystem { .. } => {
                ChallengeType::Http01
            }
            ValidationOptions::Script { .. } => ChallengeType::Dns01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Plugin")]
pub enum StoreOptions {
    PemFiles {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    PfxFile {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        password: Option<String>,
    },
}

impl StoreOptions {
    pub fn name(&self) -> &'static str {
        match self {
            StoreOptions::PemFiles { .. } => "PemFiles",
            StoreOptions::PfxFile { .. } => "PfxFile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Plugin")]
pub enum InstallationOptions {
    Script {
        script: String,
        #[serde(default)]
        parameters: Option<String>,
    },
    None,
}

impl InstallationOptions {
    pub fn name(&self) -> &'static str {
        match self {
            InstallationOptions::Script { .. } => "Script",
            InstallationOptions::None => "None",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminator_selects_variant() {
        let options: ValidationOptions =
            serde_json::from_str(r#"{ "Plugin": "FileSystem", "web_root": "/var/www" }"#).unwrap();
        assert_eq!(
            options,
            ValidationOptions::FileSystem {
                web_root: PathBuf::from("/var/www")
            }
        );
        assert_eq!(options.challenge_type(), ChallengeType::Http01);
    }

    #[test]
    fn unknown_discriminator_is_an_error() {
        let parsed = serde_json::from_str::<StoreOptions>(r#"{ "Plugin": "CentralSsl" }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn unit_variants_round_through_the_tag() {
        let json = serde_json::to_string(&InstallationOptions::None).unwrap();
        assert_eq!(json, r#"{"Plugin":"None"}"#);
        let order: OrderOptions = serde_json::from_str(r#"{"Plugin":"Host"}"#).unwrap();
        assert_eq!(order, OrderOptions::Host);
    }
}
