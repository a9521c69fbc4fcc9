//! Certificate fixtures for unit tests.

use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{
        extension::{BasicConstraints, SubjectAlternativeName},
        X509Builder, X509NameBuilder, X509,
    },
};

pub(crate) fn key() -> PKey<Private> {
    crate::util::generate_ec_key(Nid::X9_62_PRIME256V1).unwrap()
}

/// Builds a certificate for `cn`, self signed when `issuer` is `None`.
pub(crate) fn cert(
    cn: &str,
    sans: &[&str],
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    valid_from_unix: i64,
    valid_days: i64,
) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some((issuer_cert, _)) => builder.set_issuer_name(issuer_cert.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(valid_from_unix).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(valid_from_unix + valid_days * 86_400).unwrap())
        .unwrap();
    if sans.is_empty() {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
    } else {
        let mut san = SubjectAlternativeName::new();
        for name in sans {
            san.dns(name);
        }
        let extension = san
            .build(&builder.x509v3_context(issuer.map(|(c, _)| &**c), None))
            .unwrap();
        builder.append_extension(extension).unwrap();
    }
    let signing_key = issuer.map(|(_, k)| k).unwrap_or(key);
    builder.sign(signing_key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// A root, an intermediate and a leaf for `cn` with the given SANs.
pub(crate) struct Chain {
    pub root: X509,
    pub intermediate: X509,
    pub leaf: X509,
    pub leaf_key: PKey<Private>,
}

pub(crate) fn chain(root_cn: &str, cn: &str, sans: &[&str]) -> Chain {
    let now = chrono::Utc::now().timestamp();
    let root_key = key();
    let root = cert(root_cn, &[], &root_key, None, now - 86_400, 3650);
    let intermediate_key = key();
    let intermediate = cert(
        "Test Intermediate",
        &[],
        &intermediate_key,
        Some((&root, &root_key)),
        now - 86_400,
        1000,
    );
    let leaf_key = key();
    let leaf = cert(
        cn,
        sans,
        &leaf_key,
        Some((&intermediate, &intermediate_key)),
        now - 3600,
        90,
    );
    Chain {
        root,
        intermediate,
        leaf,
        leaf_key,
    }
}
