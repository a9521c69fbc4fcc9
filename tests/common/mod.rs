//! A fake in-process CA and the plugins the scenario tests run against.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use acme_renew::{
    acme::AcmeTransport,
    certificate::CertificateInfo,
    error::Error,
    model::Renewal,
    options::{CsrOptions, InstallationOptions, OrderOptions, StoreOptions, TargetOptions, ValidationOptions},
    plugins::{
        CsrPlugin, DefaultPluginFactory, InstallationPlugin, OrderPlugin, Parallelism,
        PluginFactory, StoreInfo, StorePlugin, TargetPlugin, ValidationContext, ValidationPlugin,
    },
    settings::Settings,
    types::{
        Authorization, Challenge, DownloadedCertificate, Identifier, Order, RenewalWindow,
        StatusType,
    },
};
use async_trait::async_trait;
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{
        extension::{BasicConstraints, SubjectAlternativeName},
        X509Builder, X509NameBuilder, X509Req, X509,
    },
};

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn serial() -> openssl::asn1::Asn1Integer {
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    serial.to_asn1_integer().unwrap()
}

/// Signs whatever it is asked to with a self signed root.
pub struct FakeCa {
    key: PKey<Private>,
    root: X509,
}

impl FakeCa {
    pub fn new(name: &str) -> Self {
        let key = ec_key();
        let mut subject = X509NameBuilder::new().unwrap();
        subject.append_entry_by_nid(Nid::COMMONNAME, name).unwrap();
        let subject = subject.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial()).unwrap();
        builder.set_subject_name(&subject).unwrap();
        builder.set_issuer_name(&subject).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(3650).unwrap()).unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        Self {
            key,
            root: builder.build(),
        }
    }

    /// Leaf followed by the root, as PEM.
    pub fn issue(&self, csr_der: &[u8], identifiers: &[String]) -> Vec<u8> {
        let request = X509Req::from_der(csr_der).unwrap();
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial()).unwrap();
        builder.set_subject_name(request.subject_name()).unwrap();
        builder.set_issuer_name(self.root.subject_name()).unwrap();
        builder.set_pubkey(&request.public_key().unwrap()).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(90).unwrap()).unwrap();
        let mut san = SubjectAlternativeName::new();
        for identifier in identifiers {
            san.dns(identifier);
        }
        let san = san
            .build(&builder.x509v3_context(Some(&self.root), None))
            .unwrap();
        builder.append_extension(san).unwrap();
        builder.sign(&self.key, MessageDigest::sha256()).unwrap();

        let mut pem = builder.build().to_pem().unwrap();
        pem.extend(self.root.to_pem().unwrap());
        pem
    }
}

#[derive(Default)]
struct CaState {
    orders: HashMap<String, Order>,
    certificates: HashMap<String, Vec<u8>>,
}

/// An [`AcmeTransport`] backed by a [`FakeCa`], with failure injection.
pub struct FakeTransport {
    ca: FakeCa,
    state: Mutex<CaState>,
    /// Identifiers whose authorization cannot be fetched.
    pub broken_authorizations: Mutex<HashSet<String>>,
    pub created_orders: AtomicUsize,
    pub revoked: AtomicUsize,
    /// Returned by every renewal information request.
    pub renewal_window: Mutex<Option<RenewalWindow>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            ca: FakeCa::new("Fake Root X1"),
            state: Mutex::new(CaState::default()),
            broken_authorizations: Mutex::new(HashSet::new()),
            created_orders: AtomicUsize::new(0),
            revoked: AtomicUsize::new(0),
            renewal_window: Mutex::new(None),
        }
    }

    pub fn suggest_window(&self, window: RenewalWindow) {
        *self.renewal_window.lock().unwrap() = Some(window);
    }

    pub fn break_authorization(&self, identifier: &str) {
        self.broken_authorizations
            .lock()
            .unwrap()
            .insert(identifier.to_owned());
    }

    pub fn created_orders(&self) -> usize {
        self.created_orders.load(Ordering::SeqCst)
    }

    fn identifier_of(url: &str) -> String {
        url.rsplit('/').next().unwrap_or_default().to_owned()
    }
}

#[async_trait]
impl AcmeTransport for FakeTransport {
    async fn create_order(&self, identifiers: &[Identifier]) -> Result<Order, Error> {
        let number = self.created_orders.fetch_add(1, Ordering::SeqCst) + 1;
        let url = format!("https://ca.test/order/{}", number);
        let order = Order {
            status: StatusType::Pending,
            expires: None,
            identifiers: identifiers.to_vec(),
            authorizations: identifiers
                .iter()
                .map(|identifier| format!("https://ca.test/authz/{}", identifier.value))
                .collect(),
            finalize: format!("{}/finalize", url),
            certificate: None,
            error: None,
            url: url.clone(),
        };
        self.state.lock().unwrap().orders.insert(url, order.clone());
        Ok(order)
    }

    async fn get_order(&self, url: &str) -> Result<Order, Error> {
        self.state
            .lock()
            .unwrap()
            .orders
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("no order at {}", url)))
    }

    async fn get_authorization(&self, url: &str) -> Result<Authorization, Error> {
        let identifier = Self::identifier_of(url);
        if self.broken_authorizations.lock().unwrap().contains(&identifier) {
            return Err(Error::Protocol(format!("authorization {} is unavailable", url)));
        }
        Ok(Authorization {
            identifier: Identifier::dns(identifier.clone()),
            status: StatusType::Pending,
            expires: None,
            challenges: vec![Challenge {
                challenge_type: "http-01".into(),
                url: format!("https://ca.test/chall/{}", identifier),
                status: StatusType::Pending,
                token: format!("token-{}", identifier),
                error: None,
                validated: None,
            }],
            wildcard: None,
            url: url.to_owned(),
        })
    }

    async fn get_challenge(&self, url: &str) -> Result<Challenge, Error> {
        Ok(Challenge {
            challenge_type: "http-01".into(),
            url: url.to_owned(),
            status: StatusType::Valid,
            token: format!("token-{}", Self::identifier_of(url)),
            error: None,
            validated: None,
        })
    }

    async fn answer_challenge(&self, challenge: &Challenge) -> Result<Challenge, Error> {
        Ok(Challenge {
            status: StatusType::Valid,
            ..challenge.clone()
        })
    }

    async fn submit_csr(&self, order: &Order, csr_der: &[u8]) -> Result<Order, Error> {
        let identifiers: Vec<String> = order
            .identifiers
            .iter()
            .map(|identifier| identifier.value.clone())
            .collect();
        let pem = self.ca.issue(csr_der, &identifiers);
        let certificate_url = format!("{}/cert", order.url);
        let finalized = Order {
            status: StatusType::Valid,
            certificate: Some(certificate_url.clone()),
            ..order.clone()
        };
        let mut state = self.state.lock().unwrap();
        state.certificates.insert(certificate_url, pem);
        state.orders.insert(order.url.clone(), finalized.clone());
        Ok(finalized)
    }

    async fn get_certificate(&self, order: &Order) -> Result<DownloadedCertificate, Error> {
        let url = order.certificate.clone().ok_or(Error::IncorrectResponse)?;
        let chain_pem = self
            .state
            .lock()
            .unwrap()
            .certificates
            .get(&url)
            .cloned()
            .ok_or(Error::IncorrectResponse)?;
        Ok(DownloadedCertificate {
            chain_pem,
            alternates: Vec::new(),
        })
    }

    async fn get_alternate(&self, url: &str) -> Result<Vec<u8>, Error> {
        Err(Error::Protocol(format!("no alternate at {}", url)))
    }

    async fn revoke_certificate(&self, _der: &[u8]) -> Result<(), Error> {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn key_authorization(&self, token: &str) -> Result<String, Error> {
        Ok(format!("{}.fake-thumbprint", token))
    }

    async fn renewal_info(
        &self,
        _certificate: &CertificateInfo,
    ) -> Result<Option<RenewalWindow>, Error> {
        Ok(*self.renewal_window.lock().unwrap())
    }
}

#[derive(Default)]
pub struct ValidationCalls {
    pub prepared: AtomicUsize,
    pub cleaned_up: AtomicUsize,
}

/// Accepts every challenge without serving anything.
struct RecordingValidation {
    calls: Arc<ValidationCalls>,
}

#[async_trait]
impl ValidationPlugin for RecordingValidation {
    fn parallelism(&self) -> Parallelism {
        Parallelism::PrepareAndAnswer
    }

    async fn prepare_challenge(&self, _context: &ValidationContext) -> Result<(), Error> {
        self.calls.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        self.calls.cleaned_up.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What the recording store saw, once switched on.
#[derive(Default)]
pub struct StoreCalls {
    pub recording: AtomicBool,
    pub fail_delete: AtomicBool,
    pub saved: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl StoreCalls {
    pub fn record(&self) {
        self.recording.store(true, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

/// Keeps thumbprints instead of files.
struct RecordingStore {
    calls: Arc<StoreCalls>,
}

#[async_trait]
impl StorePlugin for RecordingStore {
    async fn save(&self, certificate: &CertificateInfo) -> Result<Option<StoreInfo>, Error> {
        self.calls
            .saved
            .lock()
            .unwrap()
            .push(certificate.thumbprint.clone());
        Ok(Some(StoreInfo {
            name: "Recording".into(),
            path: None,
        }))
    }

    async fn delete(&self, certificate: &CertificateInfo) -> Result<(), Error> {
        if self.calls.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Script("store is read only".into()));
        }
        self.calls
            .deleted
            .lock()
            .unwrap()
            .push(certificate.thumbprint.clone());
        Ok(())
    }
}

/// The built-in plugins, except that validation is recorded instead of served.
/// Stores are recorded too once [`StoreCalls::record`] was called.
pub struct TestFactory {
    inner: DefaultPluginFactory,
    pub validation: Arc<ValidationCalls>,
    pub stores: Arc<StoreCalls>,
}

impl TestFactory {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: DefaultPluginFactory::new(settings),
            validation: Arc::new(ValidationCalls::default()),
            stores: Arc::new(StoreCalls::default()),
        }
    }
}

impl PluginFactory for TestFactory {
    fn target(&self, options: &TargetOptions) -> Box<dyn TargetPlugin> {
        self.inner.target(options)
    }

    fn order(&self, options: &OrderOptions) -> Box<dyn OrderPlugin> {
        self.inner.order(options)
    }

    fn csr(&self, options: &CsrOptions) -> Box<dyn CsrPlugin> {
        self.inner.csr(options)
    }

    fn validation(&self, _options: &ValidationOptions) -> Box<dyn ValidationPlugin> {
        Box::new(RecordingValidation {
            calls: Arc::clone(&self.validation),
        })
    }

    fn store(&self, options: &StoreOptions) -> Box<dyn StorePlugin> {
        if self.stores.recording.load(Ordering::SeqCst) {
            return Box::new(RecordingStore {
                calls: Arc::clone(&self.stores),
            });
        }
        self.inner.store(options)
    }

    fn installation(&self, options: &InstallationOptions) -> Box<dyn InstallationPlugin> {
        self.inner.installation(options)
    }
}

/// A renewal for `hosts` with EC keys (fast to generate) and PEM files under `store`.
pub fn renewal(id: &str, hosts: &[&str], order: OrderOptions, store: &Path) -> Renewal {
    let mut renewal = Renewal::new(
        id.into(),
        TargetOptions::Manual {
            common_name: None,
            hosts: hosts.iter().map(|host| host.to_string()).collect(),
            parts: Vec::new(),
        },
        ValidationOptions::SelfHosting { port: None },
    );
    renewal.order_plugin_options = order;
    renewal.csr_plugin_options = CsrOptions::Ec {
        curve: None,
        reuse_private_key: false,
    };
    renewal.store_plugin_options = vec![StoreOptions::PemFiles {
        path: Some(store.to_path_buf()),
    }];
    renewal
}
