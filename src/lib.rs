//! This crate keeps `ACME` certificates renewed. It talks to the CA following the implementation details
//! specified in [RFC8555](https://tools.ietf.org/html/rfc8555).
//!
//! ## Features
//! - Renewals are persisted as json documents next to a certificate cache. Each run decides per order whether it is
//!   due (static, randomized or CA driven through ACME Renewal Information), reuses cached certificates where their
//!   fingerprint still matches and only creates a new ACME order otherwise.
//! - Authorizations are grouped by validation plugin, so one embedded http server or one DNS script run can answer
//!   every identifier of a group. Plugins say which phases may run in parallel.
//! - Failures stay with the order they happened in, sibling orders still get their certificates.
//!
//! # Usage
//! [`manager::RenewalManager`] is the entry point used by the binary cli that ships with this crate. For every due
//! renewal the [`executor::RenewalExecutor`] completes the following steps:
//! - Resolve the target and split it into orders.
//! - Look up the previous and the cached certificate of every order and check due dates.
//! - Create (or resume) the ACME orders and validate their authorizations.
//! - Finalize the orders, download and cache the certificates.
//! - Hand the certificates to the store and installation plugins.
//!
//! ## Example
//! ```ignore,rust
//! use std::sync::Arc;
//! use acme_renew::{acme::AcmeClient, cache::CertificateCache, manager::RenewalManager, model::RunFlags,
//!     notify::LogNotifier, plugins::DefaultPluginFactory, renewal_store::RenewalStore, settings::Settings};
//!
//! let base = std::path::Path::new("./acme-renew");
//! let settings = Settings::load(base)?;
//! let transport = AcmeClient::connect(&settings.acme, base).await?;
//! let manager = RenewalManager::new(
//!     RenewalStore::new(base)?,
//!     Arc::new(CertificateCache::new(&base.join("cache"), settings.cache.clone())?),
//!     Arc::new(transport),
//!     Arc::new(DefaultPluginFactory::new(settings.clone())),
//!     Arc::new(settings),
//!     Box::new(LogNotifier),
//! );
//! manager.run_all(RunFlags::default(), None, chrono::Utc::now()).await?;
//! ```

pub mod acme;
pub mod cache;
pub mod certificate;
pub mod due_date;
/// The error type of the crate.
pub mod error;
pub mod executor;
pub mod manager;
pub mod model;
pub mod notify;
pub mod options;
pub mod plugins;
pub mod processor;
pub mod renewal_store;
pub mod script;
pub mod settings;
/// ACME wire types.
pub mod types;
/// Helper methods for keys, JWS signing and CSRs.
pub mod util;
pub mod validator;

#[cfg(test)]
mod test_support;
