//! Parsed certificates and chain handling.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    hash::MessageDigest,
    nid::Nid,
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    stack::Stack,
    x509::{X509NameRef, X509},
};

use crate::error::Error;

/// Cache files are protected by the file system, not by the container password.
pub const PFX_PASSWORD: &str = "";

/// A certificate with its ordered chain (leaf first) and optionally its private key.
#[derive(Clone)]
pub struct CertificateInfo {
    pub chain: Vec<X509>,
    pub private_key: Option<PKey<Private>>,
    /// Uppercase hex SHA-1 of the leaf.
    pub thumbprint: String,
    pub common_name: Option<String>,
    pub san_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Set when the certificate was read from the cache.
    pub cache_file: Option<PathBuf>,
    pub cache_file_written: Option<DateTime<Utc>>,
}

impl CertificateInfo {
    /// Builds the info from an unordered collection of certificates.
    pub fn from_collection(
        certificates: Vec<X509>,
        private_key: Option<PKey<Private>>,
    ) -> Result<Self, Error> {
        let chain = resolve_chain(certificates)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate("empty certificate collection".into()))?;

        let thumbprint = hex::encode_upper(&leaf.digest(MessageDigest::sha1())?[..]);
        let common_name = common_name(leaf.subject_name());
        let san_names = leaf
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        let not_before = asn1_to_utc(leaf.not_before())?;
        let not_after = asn1_to_utc(leaf.not_after())?;

        Ok(Self {
            chain,
            private_key,
            thumbprint,
            common_name,
            san_names,
            not_before,
            not_after,
            cache_file: None,
            cache_file_written: None,
        })
    }

    /// Parses a PEM chain as sent by the CA.
    pub fn from_pem(pem: &[u8], private_key: Option<PKey<Private>>) -> Result<Self, Error> {
        Self::from_collection(X509::stack_from_pem(pem)?, private_key)
    }

    /// Parses a PKCS#12 container.
    pub fn from_pfx(der: &[u8], password: &str) -> Result<Self, Error> {
        let parsed = Pkcs12::from_der(der)?.parse2(password)?;
        let mut certificates = Vec::new();
        if let Some(cert) = parsed.cert {
            certificates.push(cert);
        }
        if let Some(ca) = parsed.ca {
            certificates.extend(ca);
        }
        Self::from_collection(certificates, parsed.pkey)
    }

    pub fn to_pfx(&self, password: &str) -> Result<Vec<u8>, Error> {
        let mut builder = Pkcs12::builder();
        builder.name(&self.friendly_name());
        if let Some(key) = &self.private_key {
            builder.pkey(key);
        }
        builder.cert(self.certificate());
        let mut ca = Stack::new()?;
        for cert in self.chain.iter().skip(1) {
            ca.push(cert.clone())?;
        }
        builder.ca(ca);
        Ok(builder.build2(password)?.to_der()?)
    }

    pub fn certificate(&self) -> &X509 {
        &self.chain[0]
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// Common name of the issuer of the topmost certificate in the chain.
    pub fn root_issuer(&self) -> Option<String> {
        self.chain
            .last()
            .and_then(|top| common_name(top.issuer_name()))
    }

    /// The SAN list, lower cased and sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> =
            self.san_names.iter().map(|name| name.to_lowercase()).collect();
        identifiers.sort();
        identifiers.dedup();
        identifiers
    }

    pub fn friendly_name(&self) -> String {
        format!(
            "{} @ {}",
            self.common_name.as_deref().unwrap_or("[no cn]"),
            self.not_before.format("%Y/%m/%d")
        )
    }

    pub fn chain_pem(&self) -> Result<Vec<u8>, Error> {
        let mut pem = Vec::new();
        for cert in &self.chain {
            pem.extend(cert.to_pem()?);
        }
        Ok(pem)
    }
}

impl fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("thumbprint", &self.thumbprint)
            .field("common_name", &self.common_name)
            .field("san_names", &self.san_names)
            .field("not_after", &self.not_after)
            .field("chain_length", &self.chain.len())
            .field("has_private_key", &self.has_private_key())
            .field("cache_file", &self.cache_file)
            .finish()
    }
}

/// Orders a collection of certificates from the leaf towards the root.
///
/// The leaf is the certificate that did not issue any other certificate in the
/// collection. From there each issuer is appended until none is found, so an
/// incomplete chain yields a shorter result instead of an error.
pub fn resolve_chain(certificates: Vec<X509>) -> Result<Vec<X509>, Error> {
    let mut remaining = Vec::with_capacity(certificates.len());
    for cert in certificates {
        let subject = name_key(cert.subject_name());
        let issuer = name_key(cert.issuer_name());
        remaining.push((cert, subject, issuer));
    }

    let issues_another = |candidate: usize| {
        remaining.iter().enumerate().any(|(other, (_, _, issuer))| {
            other != candidate && *issuer == remaining[candidate].1
        })
    };
    let self_signed = |candidate: usize| remaining[candidate].1 == remaining[candidate].2;
    // a self signed root only counts as the leaf when it is all there is
    let leaf_index = (0..remaining.len())
        .find(|&candidate| !issues_another(candidate) && !self_signed(candidate))
        .or_else(|| (0..remaining.len()).find(|&candidate| !issues_another(candidate)));
    let leaf_index = match leaf_index {
        Some(index) => index,
        // every certificate issued another one (a loop), take the input order
        None if !remaining.is_empty() => 0,
        None => return Ok(Vec::new()),
    };

    let (leaf, _, mut tail_issuer) = remaining.remove(leaf_index);
    let mut chain = vec![leaf];
    while let Some(next) = remaining
        .iter()
        .position(|(_, subject, _)| *subject == tail_issuer)
    {
        let (cert, _, issuer) = remaining.remove(next);
        tail_issuer = issuer;
        chain.push(cert);
    }
    Ok(chain)
}

/// Picks the alternate chain whose topmost issuer matches `preferred`.
pub fn select_preferred_issuer<'a>(
    alternatives: &'a [CertificateInfo],
    preferred: Option<&str>,
) -> Option<&'a CertificateInfo> {
    let preferred = match preferred.map(str::trim).filter(|p| !p.is_empty()) {
        Some(preferred) => preferred,
        None => return alternatives.first(),
    };

    let chosen = alternatives.iter().find(|alternative| {
        alternative
            .root_issuer()
            .map(|issuer| issuer.trim().eq_ignore_ascii_case(preferred))
            .unwrap_or(false)
    });
    if chosen.is_none() && !alternatives.is_empty() {
        warn!(
            "No alternate chain matches preferred issuer {}, using the default chain",
            preferred
        );
    }
    chosen.or_else(|| alternatives.first())
}

pub(crate) fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

fn name_key(name: &X509NameRef) -> Vec<(i32, Vec<u8>)> {
    name.entries()
        .map(|entry| (entry.object().nid().as_raw(), entry.data().as_slice().to_vec()))
        .collect()
}

pub(crate) fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, Error> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| Error::Certificate("certificate date out of range".into()))
}
