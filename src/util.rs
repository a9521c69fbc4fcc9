use std::path::Path;

use base64::encode_config;
use openssl::{
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::{Padding, Rsa},
    sign::Signer,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req, X509ReqBuilder},
};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::{error::Error, types::Nonce};

/// Key width of the account key and the default certificate key.
pub const KEY_WIDTH: u32 = 2048;

/// Generates a `RSA` private key.
pub fn generate_rsa_key(bits: u32) -> Result<PKey<Private>, Error> {
    Ok(PKey::from_rsa(Rsa::generate(bits)?)?)
}

/// Generates an elliptic curve private key on the given named curve.
pub fn generate_ec_key(curve: Nid) -> Result<PKey<Private>, Error> {
    let mut group = EcGroup::from_curve_name(curve)?;
    group.set_asn1_flag(openssl::ec::Asn1Flag::NAMED_CURVE);
    let key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(key)?)
}

/// Builds a json web key `JWK` (RFC7517) for a RSA private key.
/// The resulting object is key sorted which makes [`jwk_thumbprint`] canonical.
pub fn jwk(private_key: &PKey<Private>) -> Result<serde_json::Value, Error> {
    let rsa = private_key.rsa()?;
    let e = b64(&rsa.e().to_vec());
    let n = b64(&rsa.n().to_vec());

    Ok(json!({
        "e": e,
        "n": n,
        "kty": "RSA",
    }))
}

/// The RFC7638 thumbprint of the account key, used in key authorizations.
pub fn jwk_thumbprint(private_key: &PKey<Private>) -> Result<String, Error> {
    let jwk = jwk(private_key)?;
    Ok(b64(&openssl::sha::sha256(jwk.to_string().as_bytes())))
}

/// Constructs a json web signature `JWS` (RFC7515) in the flattened `JSON` form for a specified
/// payload. This involves signing the JWS with the RS256 algorithm.
/// # Example
/// ```rust
/// use acme_renew::util::{generate_rsa_key, jws};
/// use serde_json::json;
///
/// let priv_key = generate_rsa_key(2048).expect("Error while generating the private key");
/// let header = json!({
///    "alg": "RS256",
///    "nonce": "superRandom",
/// });
///
/// let payload = json!({
///    "termsOfServiceAgreed": true,
///    "contact": ["mailto:foo@bar.de"]
/// });
///
/// let jws = jws(payload, header, &priv_key).expect("Error while creating jws");
/// assert!(jws.get("signature").is_some());
/// ```
pub fn jws(
    payload: serde_json::Value,
    header: serde_json::Value,
    private_key: &PKey<Private>,
) -> Result<serde_json::Value, Error> {
    // edge case when the payload needs to be empty, e.g. for
    // fetching the challenges or downloading the certificate
    let empty_payload = payload == json!("");

    let payload64 = b64(serde_json::to_string_pretty(&payload)?.as_bytes());
    let header64 = b64(serde_json::to_string_pretty(&header)?.as_bytes());

    let mut signer = Signer::new(MessageDigest::sha256(), private_key)?;

    signer.set_rsa_padding(Padding::PKCS1)?;
    if empty_payload {
        signer.update(format!("{}.", header64).as_bytes())?;
    } else {
        signer.update(format!("{}.{}", header64, payload64).as_bytes())?;
    }

    let signature = b64(&signer.sign_to_vec()?);

    Ok(json!({
        "protected": header64,
        "payload": if empty_payload { "" } else { &payload64 },
        "signature": signature
    }))
}

/// Returns the `base64url` encoding of the input.
pub fn b64(to_encode: &[u8]) -> String {
    encode_config(to_encode, base64::URL_SAFE_NO_PAD)
}

/// Extracts the `replay-nonce` header field from a given http `Response`, if any.
#[inline]
pub(crate) fn extract_nonce(response: &Response) -> Result<Option<Nonce>, Error> {
    match response.headers().get("replay-nonce") {
        Some(value) => Ok(Some(value.to_str()?.to_owned())),
        None => Ok(None),
    }
}

/// Extracts the `location` header field from a given http `Response`.
#[inline]
pub(crate) fn extract_location(response: &Response) -> Result<String, Error> {
    Ok(response
        .headers()
        .get("location")
        .ok_or(Error::IncorrectResponse)?
        .to_str()?
        .to_owned())
}

/// Extracts all `Link` targets with the given relation, e.g. `alternate`.
pub(crate) fn extract_links(response: &Response, relation: &str) -> Vec<String> {
    let wanted = format!("rel=\"{}\"", relation);
    response
        .headers()
        .get_all("link")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter(|link| link.split(';').skip(1).any(|param| param.trim() == wanted))
        .filter_map(|link| {
            let target = link.split(';').next()?.trim();
            Some(target.trim_start_matches('<').trim_end_matches('>').to_owned())
        })
        .collect()
}

/// Deserializes the payload of a successful response.
#[inline]
pub(crate) async fn extract_payload<T>(response: Response) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    Ok(response.json().await?)
}

/// Builds a certificate signing request over the given identifiers, signed with `private_key`.
pub fn request_csr(
    private_key: &PKey<Private>,
    common_name: &str,
    identifiers: &[String],
) -> Result<X509Req, Error> {
    let mut request = X509ReqBuilder::new()?;
    request.set_version(0)?;
    let mut c_name = X509NameBuilder::new()?;

    c_name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = c_name.build();
    request.set_pubkey(private_key)?;
    request.set_subject_name(name.as_ref())?;

    let mut san = SubjectAlternativeName::new();
    for identifier in identifiers {
        san.dns(identifier);
    }
    let san = san.build(&request.x509v3_context(None))?;
    let mut extensions = Stack::new()?;
    extensions.push(san)?;
    request.add_extensions(&extensions)?;

    request.sign(private_key, MessageDigest::sha256())?;

    Ok(request.build())
}

/// Loads a PEM encoded private key from a file.
pub fn load_private_key(path: &Path) -> Result<PKey<Private>, Error> {
    let bytes = std::fs::read(path)?;

    Ok(PKey::private_key_from_pem(&bytes)?)
}

/// Saves a private key in PKCS#8 PEM form, readable by the owner only.
pub fn save_private_key(path: &Path, key: &PKey<Private>) -> Result<(), Error> {
    std::fs::write(path, key.private_key_to_pem_pkcs8()?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
