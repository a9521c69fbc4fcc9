//! The ACME protocol client.
//!
//! [`AcmeTransport`] is everything the renewal engine needs from a CA. [`AcmeClient`]
//! implements it over `reqwest`, signing every request with the account key (RS256).

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use openssl::pkey::{PKey, Private};
use reqwest::{Client, Response};
use serde_json::json;
use tokio::sync::Mutex;

use crate::{
    certificate::CertificateInfo,
    error::Error,
    settings::AcmeSettings,
    types::{
        Account, Authorization, Challenge, Directory, DownloadedCertificate, Identifier, Nonce,
        Order, Problem, RenewalInfoResponse, RenewalWindow,
    },
    util::{
        b64, extract_links, extract_location, extract_nonce, extract_payload, generate_rsa_key,
        jwk, jwk_thumbprint, jws, load_private_key, save_private_key, KEY_WIDTH,
    },
};

const ACCOUNT_KEY_FILE: &str = "account.pem";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

#[async_trait]
pub trait AcmeTransport: Send + Sync {
    async fn create_order(&self, identifiers: &[Identifier]) -> Result<Order, Error>;

    async fn get_order(&self, url: &str) -> Result<Order, Error>;

    async fn get_authorization(&self, url: &str) -> Result<Authorization, Error>;

    async fn get_challenge(&self, url: &str) -> Result<Challenge, Error>;

    /// Tells the CA the challenge is ready to be checked.
    async fn answer_challenge(&self, challenge: &Challenge) -> Result<Challenge, Error>;

    /// Finalizes the order and waits while the CA is processing it.
    async fn submit_csr(&self, order: &Order, csr_der: &[u8]) -> Result<Order, Error>;

    async fn get_certificate(&self, order: &Order) -> Result<DownloadedCertificate, Error>;

    async fn get_alternate(&self, url: &str) -> Result<Vec<u8>, Error>;

    async fn revoke_certificate(&self, der: &[u8]) -> Result<(), Error>;

    /// `token.thumbprint` as served for http-01 (and hashed for dns-01).
    fn key_authorization(&self, token: &str) -> Result<String, Error>;

    /// The suggested renewal window, `None` when the CA does not offer one.
    async fn renewal_info(
        &self,
        certificate: &CertificateInfo,
    ) -> Result<Option<RenewalWindow>, Error>;
}

/// Calls `fetch` until `done` holds for the result, at most `attempts` times.
pub(crate) async fn poll<T, F, Fut>(
    what: &str,
    attempts: u32,
    interval: Duration,
    mut fetch: F,
    done: impl Fn(&T) -> bool,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    for attempt in 0..attempts {
        let current = fetch().await?;
        if done(&current) {
            return Ok(current);
        }
        debug!("{} still pending (attempt {}/{})", what, attempt + 1, attempts);
        tokio::time::sleep(interval).await;
    }
    Err(Error::Timeout(format!(
        "{} still pending after {} attempts",
        what, attempts
    )))
}

/// A registered account on one ACME server.
pub struct AcmeClient {
    client: Client,
    directory: Directory,
    account_key: PKey<Private>,
    thumbprint: String,
    account: Account,
    nonce: Mutex<Option<Nonce>>,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl AcmeClient {
    /// Fetches the directory and registers (or looks up) the account for the key in
    /// `base_dir`, creating that key on first use.
    pub async fn connect(settings: &AcmeSettings, base_dir: &Path) -> Result<Self, Error> {
        // keep-alive is shared by every request of the run
        let client = Client::builder().user_agent(&settings.user_agent).build()?;
        let response = client.get(&settings.base_uri).send().await?;
        if !response.status().is_success() {
            return Err(Error::IncorrectResponse);
        }
        let directory: Directory = extract_payload(response).await?;
        debug!("Directory of {}: {:?}", settings.base_uri, directory);

        let key_path = base_dir.join(ACCOUNT_KEY_FILE);
        let account_key = if key_path.exists() {
            load_private_key(&key_path)?
        } else {
            info!("Creating a new account key at {}", key_path.display());
            let key = generate_rsa_key(KEY_WIDTH)?;
            save_private_key(&key_path, &key)?;
            key
        };
        let thumbprint = jwk_thumbprint(&account_key)?;

        let mut acme = Self {
            client,
            directory,
            account_key,
            thumbprint,
            account: Account {
                status: String::new(),
                contact: None,
                orders: None,
                account_location: String::new(),
            },
            nonce: Mutex::new(None),
            poll_interval: settings.poll_interval(),
            max_poll_attempts: settings.max_poll_attempts,
        };
        acme.account = acme.register(settings.contact_email.as_deref()).await?;
        info!("Using account {}", acme.account.account_location);
        Ok(acme)
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    async fn register(&self, email: Option<&str>) -> Result<Account, Error> {
        let contact: Vec<String> = email
            .map(|email| vec![format!("mailto:{}", email)])
            .unwrap_or_default();
        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": contact,
        });
        let url = self.directory.new_account.clone();
        let response = self.post(&url, payload, None).await?;
        let location = extract_location(&response)?;
        let mut account: Account = extract_payload(response).await?;
        account.account_location = location;
        Ok(account)
    }

    async fn next_nonce(&self) -> Result<Nonce, Error> {
        if let Some(nonce) = self.nonce.lock().await.take() {
            return Ok(nonce);
        }
        let response = self.client.head(&self.directory.new_nonce).send().await?;
        extract_nonce(&response)?.ok_or(Error::BadNonce)
    }

    /// Signs and sends `payload` to `url`, retrying once when the CA rejects the nonce.
    ///
    /// Until the account is registered the header carries the `jwk`, afterwards the `kid`.
    async fn post(
        &self,
        url: &str,
        payload: serde_json::Value,
        accept: Option<&str>,
    ) -> Result<Response, Error> {
        let mut retried = false;
        loop {
            let nonce = self.next_nonce().await?;
            let header = if self.account.account_location.is_empty() {
                let jwk = jwk(&self.account_key)?;
                json!({
                    "alg": "RS256",
                    "url": url,
                    "jwk": jwk,
                    "nonce": nonce,
                })
            } else {
                json!({
                    "alg": "RS256",
                    "url": url,
                    "kid": self.account.account_location,
                    "nonce": nonce,
                })
            };
            let body = jws(payload.clone(), header, &self.account_key)?;

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/jose+json");
            if let Some(accept) = accept {
                request = request.header("Accept", accept);
            }
            let response = request
                .body(serde_json::to_string_pretty(&body)?)
                .send()
                .await?;

            if let Some(nonce) = extract_nonce(&response)? {
                *self.nonce.lock().await = Some(nonce);
            }
            if response.status().is_success() {
                return Ok(response);
            }

            let status = response.status();
            let problem: Problem = response.json().await.unwrap_or_default();
            if !retried && problem.problem_type.as_deref() == Some(BAD_NONCE) {
                debug!("Nonce rejected for {}, retrying", url);
                retried = true;
                continue;
            }
            warn!("{} answered {}: {}", url, status, problem);
            return Err(Error::Protocol(problem.to_string()));
        }
    }

    /// POST-as-GET
    async fn fetch(&self, url: &str, accept: Option<&str>) -> Result<Response, Error> {
        self.post(url, json!(""), accept).await
    }
}

#[async_trait]
impl AcmeTransport for AcmeClient {
    async fn create_order(&self, identifiers: &[Identifier]) -> Result<Order, Error> {
        let url = self.directory.new_order.clone();
        let response = self
            .post(&url, json!({ "identifiers": identifiers }), None)
            .await?;
        let location = extract_location(&response)?;
        let mut order: Order = extract_payload(response).await?;
        order.url = location;
        debug!("Created order {} ({})", order.url, order.status);
        Ok(order)
    }

    async fn get_order(&self, url: &str) -> Result<Order, Error> {
        let mut order: Order = extract_payload(self.fetch(url, None).await?).await?;
        order.url = url.to_owned();
        Ok(order)
    }

    async fn get_authorization(&self, url: &str) -> Result<Authorization, Error> {
        let mut authorization: Authorization =
            extract_payload(self.fetch(url, None).await?).await?;
        authorization.url = url.to_owned();
        Ok(authorization)
    }

    async fn get_challenge(&self, url: &str) -> Result<Challenge, Error> {
        extract_payload(self.fetch(url, None).await?).await
    }

    async fn answer_challenge(&self, challenge: &Challenge) -> Result<Challenge, Error> {
        let response = self.post(&challenge.url, json!({}), None).await?;
        extract_payload(response).await
    }

    async fn submit_csr(&self, order: &Order, csr_der: &[u8]) -> Result<Order, Error> {
        let response = self
            .post(&order.finalize, json!({ "csr": b64(csr_der) }), None)
            .await?;
        let mut finalized: Order = extract_payload(response).await?;
        finalized.url = order.url.clone();
        if !finalized.status.is_transient() {
            return Ok(finalized);
        }

        poll(
            &format!("Order {}", order.url),
            self.max_poll_attempts,
            self.poll_interval,
            || self.get_order(&order.url),
            |current: &Order| !current.status.is_transient(),
        )
        .await
    }

    async fn get_certificate(&self, order: &Order) -> Result<DownloadedCertificate, Error> {
        let url = order
            .certificate
            .as_deref()
            .ok_or_else(|| Error::Protocol(format!("order {} has no certificate", order.url)))?;
        let response = self.fetch(url, Some(PEM_CHAIN)).await?;
        let alternates = extract_links(&response, "alternate");
        let chain_pem = response.bytes().await?.to_vec();
        Ok(DownloadedCertificate {
            chain_pem,
            alternates,
        })
    }

    async fn get_alternate(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self.fetch(url, Some(PEM_CHAIN)).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn revoke_certificate(&self, der: &[u8]) -> Result<(), Error> {
        let url = self.directory.revoke_cert.clone();
        self.post(&url, json!({ "certificate": b64(der) }), None)
            .await?;
        Ok(())
    }

    fn key_authorization(&self, token: &str) -> Result<String, Error> {
        Ok(format!("{}.{}", token, self.thumbprint))
    }

    async fn renewal_info(
        &self,
        certificate: &CertificateInfo,
    ) -> Result<Option<RenewalWindow>, Error> {
        let base = match &self.directory.renewal_info {
            Some(base) => base,
            None => return Ok(None),
        };
        let id = match renewal_info_id(certificate)? {
            Some(id) => id,
            None => return Ok(None),
        };

        let url = format!("{}/{}", base.trim_end_matches('/'), id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            debug!("No renewal information at {}: {}", url, response.status());
            return Ok(None);
        }
        let info: RenewalInfoResponse = extract_payload(response).await?;
        Ok(Some(info.suggested_window))
    }
}

/// `base64url(authority key id) "." base64url(serial)`, `None` without an AKI.
pub(crate) fn renewal_info_id(certificate: &CertificateInfo) -> Result<Option<String>, Error> {
    let leaf = certificate.certificate();
    let key_id = match leaf.authority_key_id() {
        Some(key_id) => key_id.as_slice().to_vec(),
        None => return Ok(None),
    };
    let mut serial = leaf.serial_number().to_bn()?.to_vec();
    // the DER integer keeps a leading zero for a set high bit
    if serial.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
        serial.insert(0, 0);
    }
    Ok(Some(format!("{}.{}", b64(&key_id), b64(&serial))))
}
