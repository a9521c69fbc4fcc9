//! Renewals, targets, orders and their results.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use serde::{Deserialize, Serialize};

use crate::{
    certificate::CertificateInfo,
    options::{
        CsrOptions, InstallationOptions, OrderOptions, StoreOptions, TargetOptions,
        ValidationOptions,
    },
    types::{Order as AcmeOrder, RenewalWindow},
};

/// A persistent unit of work with its plugin options and run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Renewal {
    pub id: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    pub target_plugin_options: TargetOptions,
    #[serde(default)]
    pub order_plugin_options: OrderOptions,
    #[serde(default)]
    pub csr_plugin_options: CsrOptions,
    pub validation_plugin_options: Arc<ValidationOptions>,
    #[serde(default)]
    pub store_plugin_options: Vec<StoreOptions>,
    #[serde(default)]
    pub installation_plugin_options: Vec<InstallationOptions>,
    #[serde(default)]
    pub pre_execution_script: Option<String>,
    #[serde(default)]
    pub post_execution_script: Option<String>,
    /// Keep the previous certificate in the stores after a successful renewal.
    #[serde(default)]
    pub keep_existing: bool,
    #[serde(default)]
    pub history: Vec<RenewResult>,

    #[serde(skip)]
    pub new: bool,
    #[serde(skip)]
    pub updated: bool,
    #[serde(skip)]
    pub deleted: bool,
}

impl Renewal {
    pub fn new(
        id: String,
        target: TargetOptions,
        validation: ValidationOptions,
    ) -> Self {
        Self {
            id,
            friendly_name: None,
            target_plugin_options: target,
            order_plugin_options: OrderOptions::default(),
            csr_plugin_options: CsrOptions::default(),
            validation_plugin_options: Arc::new(validation),
            store_plugin_options: Vec::new(),
            installation_plugin_options: Vec::new(),
            pre_execution_script: None,
            post_execution_script: None,
            keep_existing: false,
            history: Vec::new(),
            new: true,
            updated: false,
            deleted: false,
        }
    }

    pub fn last_success(&self) -> Option<&RenewResult> {
        self.history
            .iter()
            .rev()
            .find(|result| result.success == Some(true))
    }

    /// Date of the first successful run that produced `thumbprint`.
    pub fn first_success_with(&self, thumbprint: &str) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .filter(|result| result.success == Some(true))
            .find(|result| {
                result.order_results.iter().any(|order| {
                    order.success == Some(true)
                        && order
                            .thumbprint
                            .as_deref()
                            .map(|t| t.eq_ignore_ascii_case(thumbprint))
                            .unwrap_or(false)
                })
            })
            .map(|result| result.date)
    }

    pub fn display_name(&self) -> String {
        self.friendly_name
            .clone()
            .unwrap_or_else(|| format!("[{}] {}", self.target_plugin_options.name(), self.id))
    }
}

/// A group of identifiers within a target, e.g. one web site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetPart {
    pub site_id: Option<i64>,
    pub identifiers: Vec<String>,
}

/// The identifiers a renewal resolves to at run time.
#[derive(Clone, Default)]
pub struct Target {
    pub friendly_name: Option<String>,
    pub common_name: String,
    pub parts: Vec<TargetPart>,
    /// Caller supplied CSR in DER form; skips CSR generation entirely.
    pub csr_bytes: Option<Vec<u8>>,
    pub private_key: Option<PKey<Private>>,
}

impl Target {
    pub fn new(common_name: String, parts: Vec<TargetPart>) -> Self {
        Self {
            common_name,
            parts,
            ..Default::default()
        }
    }

    /// All identifiers of all parts, lower cased, sorted and unique.
    pub fn alternative_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .parts
            .iter()
            .flat_map(|part| part.identifiers.iter())
            .map(|identifier| identifier.to_lowercase())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn site_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.parts.iter().filter_map(|part| part.site_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// A target needs a common name that is one of its identifiers.
    pub fn is_valid(&self) -> bool {
        let names = self.alternative_names();
        !names.is_empty()
            && !self.common_name.is_empty()
            && names.contains(&self.common_name.to_lowercase())
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("common_name", &self.common_name)
            .field("parts", &self.parts)
            .field("user_csr", &self.csr_bytes.is_some())
            .finish()
    }
}

pub const DEFAULT_CACHE_KEY_PART: &str = "main";

/// One ACME issuance derived from a target.
#[derive(Debug, Clone)]
pub struct Order {
    pub renewal_id: String,
    /// Distinguishes sibling orders of the same renewal.
    pub cache_key_part: Option<String>,
    pub friendly_name: String,
    pub target: Target,
    pub details: Option<AcmeOrder>,
}

impl Order {
    pub fn new(renewal: &Renewal, target: Target, cache_key_part: Option<String>) -> Self {
        let friendly_name = match &cache_key_part {
            Some(part) => format!("{} [{}]", renewal.display_name(), part),
            None => renewal.display_name(),
        };
        Self {
            renewal_id: renewal.id.clone(),
            cache_key_part,
            friendly_name,
            target,
            details: None,
        }
    }

    pub fn scope(&self) -> &str {
        self.cache_key_part.as_deref().unwrap_or(DEFAULT_CACHE_KEY_PART)
    }
}

/// Flags describing how a run was triggered.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Run every order regardless of due dates.
    pub force: bool,
    /// Never reuse cached certificates.
    pub ignore_cache: bool,
    /// Also answer authorizations the CA already considers valid.
    pub test: bool,
}

impl RunFlags {
    pub fn bypass_valid_authorizations(self) -> bool {
        self.force || self.ignore_cache || self.test
    }
}

/// Per-run state for one order.
#[derive(Debug)]
pub struct OrderContext {
    pub order: Order,
    /// Most recent certificate for this order's scope, used for install diffs.
    pub previous_certificate: Option<CertificateInfo>,
    /// Cached certificate with a matching fingerprint, reused instead of ordering.
    pub cached_certificate: Option<CertificateInfo>,
    pub new_certificate: Option<CertificateInfo>,
    pub renewal_window: Option<RenewalWindow>,
    pub result: OrderResult,
}

impl OrderContext {
    pub fn new(order: Order) -> Self {
        let result = OrderResult::new(order.friendly_name.clone());
        Self {
            order,
            previous_certificate: None,
            cached_certificate: None,
            new_certificate: None,
            renewal_window: None,
            result,
        }
    }

    pub fn failed(&self) -> bool {
        self.result.success == Some(false)
    }

    pub fn from_cache(&self) -> bool {
        self.cached_certificate.is_some()
    }

    pub fn certificate(&self) -> Option<&CertificateInfo> {
        self.new_certificate
            .as_ref()
            .or(self.cached_certificate.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderResult {
    pub name: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub thumbprint: Option<String>,
    #[serde(default)]
    pub expire_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_messages: Vec<String>,
    /// Problems that did not fail the order, e.g. removing an old certificate.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl OrderResult {
    pub fn new(name: String) -> Self {
        Self {
            name,
            success: None,
            thumbprint: None,
            expire_date: None,
            error_messages: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error<T: Into<String>>(&mut self, message: T) {
        self.success = Some(false);
        self.error_messages.push(message.into());
    }

    pub fn set_certificate(&mut self, certificate: &CertificateInfo) {
        self.thumbprint = Some(certificate.thumbprint.clone());
        self.expire_date = Some(certificate.not_after);
    }
}

/// The outcome of one executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RenewResult {
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub abort: bool,
    #[serde(default)]
    pub order_results: Vec<OrderResult>,
    #[serde(default)]
    pub error_messages: Vec<String>,
}

impl RenewResult {
    pub fn new(date: DateTime<Utc>) -> Self {
        Self {
            date,
            success: None,
            abort: false,
            order_results: Vec::new(),
            error_messages: Vec::new(),
        }
    }

    /// Nothing needed to be done; not an error.
    pub fn aborted(date: DateTime<Utc>) -> Self {
        Self {
            abort: true,
            ..Self::new(date)
        }
    }

    pub fn failed<T: Into<String>>(date: DateTime<Utc>, message: T) -> Self {
        let mut result = Self::new(date);
        result.add_error(message);
        result
    }

    pub fn add_error<T: Into<String>>(&mut self, message: T) {
        self.success = Some(false);
        self.error_messages.push(message.into());
    }

    /// Appends an order result, folding its outcome into the overall state.
    pub fn add_order_result(&mut self, order_result: OrderResult) {
        match order_result.success {
            Some(false) => self.success = Some(false),
            Some(true) if self.success.is_none() => self.success = Some(true),
            _ => {}
        }
        self.order_results.push(order_result);
    }

    pub fn all_errors(&self) -> Vec<String> {
        self.error_messages
            .iter()
            .cloned()
            .chain(
                self.order_results
                    .iter()
                    .flat_map(|order| order.error_messages.iter().cloned()),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_failed_order_fails_the_run() {
        let mut result = RenewResult::new(Utc::now());
        let mut ok = OrderResult::new("a".into());
        ok.success = Some(true);
        let mut bad = OrderResult::new("b".into());
        bad.add_error("authorization failed");
        result.add_order_result(ok);
        assert_eq!(result.success, Some(true));
        result.add_order_result(bad);
        assert_eq!(result.success, Some(false));
        assert_eq!(result.all_errors(), vec!["authorization failed".to_string()]);
    }

    #[test]
    fn abort_is_not_a_failure() {
        let result = RenewResult::aborted(Utc::now());
        assert!(result.abort);
        assert_eq!(result.success, None);
    }

    #[test]
    fn target_names_are_normalised() {
        let target = Target::new(
            "Example.org".into(),
            vec![
                TargetPart {
                    site_id: Some(2),
                    identifiers: vec!["www.example.org".into(), "Example.org".into()],
                },
                TargetPart {
                    site_id: Some(1),
                    identifiers: vec!["example.org".into()],
                },
            ],
        );
        assert_eq!(target.alternative_names(), vec!["example.org", "www.example.org"]);
        assert_eq!(target.site_ids(), vec![1, 2]);
        assert!(target.is_valid());
        assert!(!Target::new("other.org".into(), target.parts.clone()).is_valid());
    }
}
