use std::fmt;

use serde::{Deserialize, Serialize};

pub type Nonce = String;

/// Status of any ACME resource (order, authorization or challenge).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusType {
    #[serde(rename = "valid")]
    Valid,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "invalid")]
    Invalid,
    #[serde(rename = "deactivated")]
    Deactivated,
    #[serde(rename = "expired")]
    Expired,
    #[serde(rename = "revoked")]
    Revoked,
}

impl StatusType {
    /// Whether the server may still move the resource to another state.
    pub fn is_transient(self) -> bool {
        matches!(self, StatusType::Pending | StatusType::Processing)
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusType::Valid => "valid",
            StatusType::Pending => "pending",
            StatusType::Ready => "ready",
            StatusType::Processing => "processing",
            StatusType::Invalid => "invalid",
            StatusType::Deactivated => "deactivated",
            StatusType::Expired => "expired",
            StatusType::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl ChallengeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,
    #[serde(default)]
    pub key_change: Option<String>,
    /// Only present when the CA implements ACME Renewal Information.
    #[serde(default)]
    pub renewal_info: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub status: String,
    #[serde(default)]
    pub contact: Option<Vec<String>>,
    #[serde(default)]
    pub orders: Option<String>,
    #[serde(skip)]
    pub account_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub identifier_type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns<T: Into<String>>(value: T) -> Self {
        Self {
            identifier_type: "dns".to_owned(),
            value: value.into(),
        }
    }
}

/// RFC 7807 problem document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub problem_type: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detail, &self.problem_type) {
            (Some(detail), _) => f.write_str(detail),
            (None, Some(problem_type)) => f.write_str(problem_type),
            (None, None) => f.write_str("unknown problem"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: StatusType,
    #[serde(default)]
    pub expires: Option<String>,
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    /// The order location, taken from the `location` header on creation.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub url: String,
    pub status: StatusType,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub error: Option<Problem>,
    #[serde(default)]
    pub validated: Option<String>,
}

impl Challenge {
    pub fn is_type(&self, challenge_type: ChallengeType) -> bool {
        self.challenge_type == challenge_type.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: StatusType,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: Option<bool>,
    #[serde(skip)]
    pub url: String,
}

impl Authorization {
    /// The identifier as it needs to be validated, wildcard prefix restored.
    pub fn display_identifier(&self) -> String {
        if self.wildcard.unwrap_or(false) {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }
}

/// Suggested renewal window from the ACME Renewal Information extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalWindow {
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RenewalInfoResponse {
    pub suggested_window: RenewalWindow,
}

/// The downloaded certificate chain plus links to alternate chains.
#[derive(Debug, Clone, Default)]
pub struct DownloadedCertificate {
    pub chain_pem: Vec<u8>,
    pub alternates: Vec<String>,
}
