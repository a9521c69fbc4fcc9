//! On-disk cache of issued certificates, keyed by a versioned order fingerprint.
//!
//! # Layout
//!
//! ```text
//! cache/
//! ├── {renewal}-{fingerprint}-temp.pfx    # issued certificate + key
//! ├── {renewal}-{fingerprint}-csr.pem     # the request it was issued for
//! ├── {renewal}-{fingerprint}-order.json  # pending ACME order, resumed on the next run
//! ├── {renewal}-{fingerprint}.keys        # reusable private key
//! └── {renewal}-cache.pfx                 # legacy, unversioned
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};

use crate::{
    certificate::{CertificateInfo, PFX_PASSWORD},
    error::Error,
    model::{Order, Renewal, DEFAULT_CACHE_KEY_PART},
    settings::CacheSettings,
    types::Order as AcmeOrder,
    util::b64,
};

/// Newest fingerprint generation. Older ones are still recognised on lookup.
pub const MAX_CACHE_KEY_VERSION: u32 = 4;

const PFX_POSTFIX: &str = "-temp.pfx";
const LEGACY_PFX_POSTFIX: &str = "-cache.pfx";
const CSR_POSTFIX: &str = "-csr.pem";
const ORDER_POSTFIX: &str = "-order.json";
const KEY_POSTFIX: &str = ".keys";
/// base64url of a SHA-1 digest, without padding
const HASH_LENGTH: usize = 27;

/// Derives the cache fingerprint of an order.
///
/// Identifiers are lower cased and sorted first, so their input order never
/// matters. Versions above 2 are prefixed with the order scope, version 4 and
/// up also cover the site ids of the target.
pub fn fingerprint(renewal: &Renewal, order: &Order, version: u32) -> Result<String, Error> {
    let common_name = order.target.common_name.to_lowercase();
    let identifiers = order.target.alternative_names().join(",");
    let csr = match &order.target.csr_bytes {
        Some(bytes) => base64::encode(bytes),
        None => serde_json::to_string(&renewal.csr_plugin_options)?,
    };

    let mut key = if version < 2 {
        format!("{}|{}|{}", common_name, identifiers, csr)
    } else {
        format!("{}|{}|{}|{}", order.scope(), common_name, identifiers, csr)
    };
    if version >= 4 {
        let sites: Vec<String> = order
            .target
            .site_ids()
            .iter()
            .map(|id| id.to_string())
            .collect();
        key.push('|');
        key.push_str(&sites.join(","));
    }

    let hash = b64(&openssl::sha::sha1(key.as_bytes()));
    if version > 2 {
        Ok(format!("{}-{}", file_safe(order.scope()), hash))
    } else {
        Ok(hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Certificate,
    LegacyCertificate,
    Request,
    PendingOrder,
    Key,
}

/// A cache file name split into its parts.
#[derive(Debug, PartialEq, Eq)]
struct CacheFileName<'a> {
    kind: FileKind,
    fingerprint: Option<&'a str>,
}

impl<'a> CacheFileName<'a> {
    /// Parses `name` as a cache file of the renewal `renewal_id`.
    ///
    /// Ids may contain dashes, so a bare prefix match would also claim the files
    /// of `shop-eu` for `shop`. The part after the id has to be one of the known
    /// shapes exactly.
    fn parse(name: &'a str, renewal_id: &str) -> Option<Self> {
        let rest = name.strip_prefix(renewal_id)?;
        match rest {
            LEGACY_PFX_POSTFIX => {
                return Some(Self {
                    kind: FileKind::LegacyCertificate,
                    fingerprint: None,
                })
            }
            KEY_POSTFIX => {
                return Some(Self {
                    kind: FileKind::Key,
                    fingerprint: None,
                })
            }
            _ => {}
        }

        let rest = rest.strip_prefix('-')?;
        let (kind, fingerprint) = [
            (FileKind::Certificate, PFX_POSTFIX),
            (FileKind::Request, CSR_POSTFIX),
            (FileKind::PendingOrder, ORDER_POSTFIX),
            (FileKind::Key, KEY_POSTFIX),
        ]
        .iter()
        .find_map(|(kind, postfix)| rest.strip_suffix(postfix).map(|fp| (*kind, fp)))?;

        if is_fingerprint(fingerprint) {
            Some(Self {
                kind,
                fingerprint: Some(fingerprint),
            })
        } else {
            None
        }
    }

    fn of(path: &'a Path, renewal_id: &str) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?, renewal_id)
    }

    /// The order scope encoded in fingerprints of version 3 and up.
    fn scope(&self) -> Option<&'a str> {
        let fingerprint = self.fingerprint?;
        if is_hash(fingerprint) {
            return None;
        }
        fingerprint.split_once('-').map(|(scope, _)| scope)
    }
}

fn is_hash(value: &str) -> bool {
    value.len() == HASH_LENGTH
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Either a bare hash (versions 1 and 2) or `{scope}-{hash}`.
fn is_fingerprint(value: &str) -> bool {
    if is_hash(value) {
        return true;
    }
    match value.split_once('-') {
        Some((scope, hash)) => {
            !scope.is_empty() && file_safe(scope) == scope && is_hash(hash)
        }
        None => false,
    }
}

pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

struct CacheEntry {
    written: SystemTime,
    info: CertificateInfo,
}

/// File backed certificate cache with an in-memory index of parsed files.
pub struct CertificateCache {
    cache_dir: PathBuf,
    settings: CacheSettings,
    index: DashMap<PathBuf, CacheEntry>,
}

impl CertificateCache {
    pub fn new(cache_dir: &Path, settings: CacheSettings) -> Result<Self, Error> {
        fs::create_dir_all(cache_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(cache_dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            settings,
            index: DashMap::new(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn pfx_path(&self, renewal: &Renewal, fingerprint: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}-{}{}", renewal.id, fingerprint, PFX_POSTFIX))
    }

    fn legacy_pfx_path(&self, renewal: &Renewal) -> PathBuf {
        self.cache_dir
            .join(format!("{}{}", renewal.id, LEGACY_PFX_POSTFIX))
    }

    pub fn csr_path(&self, renewal: &Renewal, order: &Order) -> Result<PathBuf, Error> {
        let fingerprint = fingerprint(renewal, order, MAX_CACHE_KEY_VERSION)?;
        Ok(self
            .cache_dir
            .join(format!("{}-{}{}", renewal.id, fingerprint, CSR_POSTFIX)))
    }

    fn order_path(&self, renewal: &Renewal, order: &Order) -> Result<PathBuf, Error> {
        let fingerprint = fingerprint(renewal, order, MAX_CACHE_KEY_VERSION)?;
        Ok(self
            .cache_dir
            .join(format!("{}-{}{}", renewal.id, fingerprint, ORDER_POSTFIX)))
    }

    /// Where a reusable private key for the order lives. The single key file
    /// of older versions is kept in use for the main scope.
    pub fn key_path(&self, renewal: &Renewal, order: &Order) -> Result<PathBuf, Error> {
        let legacy = self.cache_dir.join(format!("{}{}", renewal.id, KEY_POSTFIX));
        if order.scope() == DEFAULT_CACHE_KEY_PART && legacy.exists() {
            return Ok(legacy);
        }
        let fingerprint = fingerprint(renewal, order, MAX_CACHE_KEY_VERSION)?;
        Ok(self
            .cache_dir
            .join(format!("{}-{}{}", renewal.id, fingerprint, KEY_POSTFIX)))
    }

    /// All certificate files of a renewal with their last write time.
    fn pfx_files(&self, renewal: &Renewal) -> Result<Vec<(PathBuf, SystemTime)>, Error> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let certificate = matches!(
                CacheFileName::parse(&name, &renewal.id).map(|file| file.kind),
                Some(FileKind::Certificate) | Some(FileKind::LegacyCertificate)
            );
            if certificate {
                files.push((entry.path(), entry.metadata()?.modified()?));
            }
        }
        Ok(files)
    }

    /// Reads a cache file, using the index while the file is unchanged.
    fn read(&self, path: &Path) -> Result<CertificateInfo, Error> {
        let written = fs::metadata(path)?.modified()?;
        if let Some(entry) = self.index.get(path) {
            if entry.written == written {
                return Ok(entry.info.clone());
            }
        }

        let bytes = fs::read(path)?;
        let mut info = CertificateInfo::from_pfx(&bytes, PFX_PASSWORD)?;
        info.cache_file = Some(path.to_path_buf());
        info.cache_file_written = Some(DateTime::<Utc>::from(written));
        self.index.insert(
            path.to_path_buf(),
            CacheEntry {
                written,
                info: info.clone(),
            },
        );
        Ok(info)
    }

    /// Finds a reusable certificate for the order.
    ///
    /// Fingerprint versions are tried newest first. The legacy file is only
    /// accepted when its common name and SAN set equal the target exactly.
    pub fn lookup(
        &self,
        renewal: &Renewal,
        order: &Order,
        now: DateTime<Utc>,
    ) -> Result<Option<CertificateInfo>, Error> {
        let files = self.pfx_files(renewal)?;
        let mut found = None;
        for version in (1..=MAX_CACHE_KEY_VERSION).rev() {
            let path = self.pfx_path(renewal, &fingerprint(renewal, order, version)?);
            if files.iter().any(|(file, _)| *file == path) {
                debug!("Cache hit for {} with key version {}", order.friendly_name, version);
                found = Some(self.read(&path)?);
                break;
            }
        }

        if found.is_none() {
            let legacy = self.legacy_pfx_path(renewal);
            if files.iter().any(|(file, _)| *file == legacy) {
                let info = self.read(&legacy)?;
                let same_name = info
                    .common_name
                    .as_deref()
                    .map(|cn| cn.eq_ignore_ascii_case(&order.target.common_name))
                    .unwrap_or(false);
                if same_name && info.identifiers() == order.target.alternative_names() {
                    debug!("Legacy cache file matches {}", order.friendly_name);
                    found = Some(info);
                } else {
                    debug!("Legacy cache file does not match {}", order.friendly_name);
                }
            }
        }

        let info = match found {
            Some(info) => info,
            None => return Ok(None),
        };

        let written = info.cache_file_written.unwrap_or(info.not_before);
        if written < now - Duration::days(self.settings.reuse_days) {
            debug!(
                "Cached certificate {} is older than {} days",
                info.thumbprint, self.settings.reuse_days
            );
            return Ok(None);
        }
        if !info.has_private_key() {
            debug!("Cached certificate {} has no private key", info.thumbprint);
            return Ok(None);
        }
        Ok(Some(info))
    }

    /// The most recent certificate for the order's scope, whatever its shape.
    pub fn previous(
        &self,
        renewal: &Renewal,
        order: &Order,
    ) -> Result<Option<CertificateInfo>, Error> {
        let files = self.pfx_files(renewal)?;
        let scope = file_safe(order.scope());
        let mut candidates: Vec<_> = files
            .iter()
            .filter(|(path, _)| {
                CacheFileName::of(path, &renewal.id)
                    .and_then(|file| file.scope())
                    .map(|file_scope| file_scope == scope)
                    .unwrap_or(false)
            })
            .collect();
        // files from older generations carry no scope in their name
        if candidates.is_empty() && order.scope() == DEFAULT_CACHE_KEY_PART {
            candidates = files
                .iter()
                .filter(|(path, _)| {
                    CacheFileName::of(path, &renewal.id)
                        .map(|file| file.scope().is_none())
                        .unwrap_or(false)
                })
                .collect();
        }

        match candidates.into_iter().max_by_key(|(_, written)| *written) {
            Some((path, _)) => Ok(Some(self.read(path)?)),
            None => Ok(None),
        }
    }

    /// Writes a new certificate for the order, replacing older files of the
    /// same order. The result is read back from disk.
    pub fn store(
        &self,
        renewal: &Renewal,
        order: &Order,
        pfx: &[u8],
    ) -> Result<CertificateInfo, Error> {
        for version in 1..=MAX_CACHE_KEY_VERSION {
            self.remove(&self.pfx_path(renewal, &fingerprint(renewal, order, version)?))?;
        }
        self.remove(&self.legacy_pfx_path(renewal))?;

        let path = self.pfx_path(renewal, &fingerprint(renewal, order, MAX_CACHE_KEY_VERSION)?);
        fs::write(&path, pfx)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        info!("Cached certificate for {} at {}", order.friendly_name, path.display());
        self.read(&path)
    }

    pub fn store_csr(&self, renewal: &Renewal, order: &Order, pem: &[u8]) -> Result<(), Error> {
        fs::write(self.csr_path(renewal, order)?, pem)?;
        Ok(())
    }

    /// A previously created order that may still be pending at the CA.
    pub fn cached_order(&self, renewal: &Renewal, order: &Order) -> Result<Option<AcmeOrder>, Error> {
        let path = self.order_path(renewal, order)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(details) => Ok(Some(details)),
            Err(e) => {
                warn!("Ignoring unreadable order file {}: {}", path.display(), e);
                self.remove(&path)?;
                Ok(None)
            }
        }
    }

    pub fn store_order(&self, renewal: &Renewal, order: &Order, details: &AcmeOrder) -> Result<(), Error> {
        fs::write(self.order_path(renewal, order)?, serde_json::to_string_pretty(details)?)?;
        Ok(())
    }

    pub fn delete_order(&self, renewal: &Renewal, order: &Order) -> Result<(), Error> {
        self.remove(&self.order_path(renewal, order)?)
    }

    /// Every readable certificate of the renewal, e.g. for revocation.
    pub fn all_certificates(&self, renewal: &Renewal) -> Result<Vec<CertificateInfo>, Error> {
        let mut certificates = Vec::new();
        for (path, _) in self.pfx_files(renewal)? {
            match self.read(&path) {
                Ok(info) => certificates.push(info),
                Err(e) => warn!("Unable to read cache file {}: {}", path.display(), e),
            }
        }
        Ok(certificates)
    }

    /// Removes every cache artifact of a renewal.
    pub fn delete(&self, renewal: &Renewal) -> Result<usize, Error> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if CacheFileName::parse(&name, &renewal.id).is_some() {
                self.remove(&entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes (or, unless enabled, reports) files older than the retention window.
    pub fn delete_stale_files(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let threshold = now - Duration::days(self.settings.delete_stale_files_days);
        let mut stale = 0;
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let written = DateTime::<Utc>::from(entry.metadata()?.modified()?);
            if written >= threshold {
                continue;
            }
            stale += 1;
            if self.settings.delete_stale_files {
                info!("Deleting stale cache file {}", entry.path().display());
                self.remove(&entry.path())?;
            } else {
                warn!(
                    "Cache file {} is older than {} days, enable delete_stale_files to clean it up",
                    entry.path().display(),
                    self.settings.delete_stale_files_days
                );
            }
        }
        Ok(stale)
    }

    fn remove(&self, path: &Path) -> Result<(), Error> {
        self.index.remove(path);
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::{
        model::{Target, TargetPart},
        options::{CsrOptions, TargetOptions, ValidationOptions},
        test_support,
    };

    fn renewal() -> Renewal {
        Renewal::new(
            "renewal1".into(),
            TargetOptions::Manual {
                common_name: None,
                hosts: vec![],
                parts: vec![],
            },
            ValidationOptions::SelfHosting { port: None },
        )
    }

    fn order(renewal: &Renewal, ids: &[&str], site: Option<i64>) -> Order {
        let target = Target::new(
            ids[0].to_string(),
            vec![TargetPart {
                site_id: site,
                identifiers: ids.iter().map(|s| s.to_string()).collect(),
            }],
        );
        Order::new(renewal, target, None)
    }

    fn settings(reuse_days: i64) -> CacheSettings {
        CacheSettings {
            reuse_days,
            ..Default::default()
        }
    }

    fn write_pfx(path: &Path, cn: &str, sans: &[&str], with_key: bool, age_days: u64) {
        let c = test_support::chain("Root", cn, sans);
        let info = CertificateInfo::from_collection(
            vec![c.leaf, c.intermediate],
            if with_key { Some(c.leaf_key) } else { None },
        )
        .unwrap();
        fs::write(path, info.to_pfx(PFX_PASSWORD).unwrap()).unwrap();
        let written = SystemTime::now() - StdDuration::from_secs(age_days * 86_400);
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(written)
            .unwrap();
    }

    #[test]
    fn fingerprint_ignores_identifier_order() {
        let r = renewal();
        let a = order(&r, &["a.example.org", "b.example.org", "c.example.org"], None);
        let mut b = order(&r, &["a.example.org", "c.example.org", "B.example.org"], None);
        b.target.common_name = "a.example.org".into();
        for version in 1..=MAX_CACHE_KEY_VERSION {
            let first = fingerprint(&r, &a, version).unwrap();
            assert_eq!(first, fingerprint(&r, &a, version).unwrap());
            assert_eq!(first, fingerprint(&r, &b, version).unwrap());
        }
    }

    #[test]
    fn fingerprint_follows_inputs_that_change_the_certificate() {
        let r = renewal();
        let base = order(&r, &["a.example.org", "b.example.org"], Some(1));
        let v = MAX_CACHE_KEY_VERSION;
        let fp = fingerprint(&r, &base, v).unwrap();

        let other_ids = order(&r, &["a.example.org", "c.example.org"], Some(1));
        assert_ne!(fp, fingerprint(&r, &other_ids, v).unwrap());

        let other_site = order(&r, &["a.example.org", "b.example.org"], Some(2));
        assert_ne!(fp, fingerprint(&r, &other_site, v).unwrap());
        // site ids are not part of older keys
        assert_eq!(
            fingerprint(&r, &base, 3).unwrap(),
            fingerprint(&r, &other_site, 3).unwrap()
        );

        let mut other_csr = renewal();
        other_csr.csr_plugin_options = CsrOptions::Ec {
            curve: None,
            reuse_private_key: false,
        };
        assert_ne!(fp, fingerprint(&other_csr, &base, v).unwrap());

        let mut renamed = renewal();
        renamed.friendly_name = Some("Something else".into());
        assert_eq!(fp, fingerprint(&renamed, &base, v).unwrap());
    }

    #[test]
    fn scope_prefix_starts_at_version_three() {
        let r = renewal();
        let o = order(&r, &["a.example.org"], None);
        assert!(!fingerprint(&r, &o, 2).unwrap().starts_with("main-"));
        assert!(fingerprint(&r, &o, 3).unwrap().starts_with("main-"));
        assert!(fingerprint(&r, &o, 4).unwrap().starts_with("main-"));
    }

    #[test]
    fn newest_key_version_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let r = renewal();
        let o = order(&r, &["a.example.org"], None);

        let v2 = cache.pfx_path(&r, &fingerprint(&r, &o, 2).unwrap());
        let v4 = cache.pfx_path(&r, &fingerprint(&r, &o, 4).unwrap());
        write_pfx(&v2, "a.example.org", &["a.example.org"], true, 0);
        write_pfx(&v4, "a.example.org", &["a.example.org"], true, 0);

        let found = cache.lookup(&r, &o, Utc::now()).unwrap().unwrap();
        assert_eq!(found.cache_file.as_deref(), Some(v4.as_path()));
    }

    #[test]
    fn legacy_file_needs_an_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let r = renewal();
        let legacy = cache.legacy_pfx_path(&r);

        write_pfx(&legacy, "a.example.org", &["a.example.org", "b.example.org"], true, 0);
        let exact = order(&r, &["a.example.org", "b.example.org"], None);
        assert!(cache.lookup(&r, &exact, Utc::now()).unwrap().is_some());

        let subset = order(&r, &["a.example.org"], None);
        assert!(cache.lookup(&r, &subset, Utc::now()).unwrap().is_none());

        let superset = order(&r, &["a.example.org", "b.example.org", "c.example.org"], None);
        assert!(cache.lookup(&r, &superset, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn recent_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let r = renewal();
        let o = order(&r, &["a.example.org"], None);
        let path = cache.pfx_path(&r, &fingerprint(&r, &o, MAX_CACHE_KEY_VERSION).unwrap());
        write_pfx(&path, "a.example.org", &["a.example.org"], true, 2);
        assert!(cache.lookup(&r, &o, Utc::now()).unwrap().is_some());
    }

    #[test]
    fn old_file_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let r = renewal();
        let o = order(&r, &["a.example.org"], None);
        let path = cache.pfx_path(&r, &fingerprint(&r, &o, MAX_CACHE_KEY_VERSION).unwrap());
        write_pfx(&path, "a.example.org", &["a.example.org"], true, 10);
        assert!(cache.lookup(&r, &o, Utc::now()).unwrap().is_none());
        // it still counts as the previous certificate
        assert!(cache.previous(&r, &o).unwrap().is_some());
    }

    #[test]
    fn file_without_key_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let r = renewal();
        let o = order(&r, &["a.example.org"], None);
        let path = cache.pfx_path(&r, &fingerprint(&r, &o, MAX_CACHE_KEY_VERSION).unwrap());
        write_pfx(&path, "a.example.org", &["a.example.org"], false, 0);
        assert!(cache.lookup(&r, &o, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn store_replaces_older_generations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let r = renewal();
        let o = order(&r, &["a.example.org"], None);
        let v2 = cache.pfx_path(&r, &fingerprint(&r, &o, 2).unwrap());
        write_pfx(&v2, "a.example.org", &["a.example.org"], true, 1);
        write_pfx(&cache.legacy_pfx_path(&r), "a.example.org", &["a.example.org"], true, 1);

        let c = test_support::chain("Root", "a.example.org", &["a.example.org"]);
        let fresh = CertificateInfo::from_collection(vec![c.leaf], Some(c.leaf_key)).unwrap();
        let stored = cache
            .store(&r, &o, &fresh.to_pfx(PFX_PASSWORD).unwrap())
            .unwrap();

        assert_eq!(stored.thumbprint, fresh.thumbprint);
        assert!(stored.cache_file.is_some());
        assert!(!v2.exists());
        assert!(!cache.legacy_pfx_path(&r).exists());
        assert_eq!(
            cache.lookup(&r, &o, Utc::now()).unwrap().unwrap().thumbprint,
            fresh.thumbprint
        );
    }

    #[test]
    fn renewal_ids_sharing_a_prefix_keep_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let mut shop = renewal();
        shop.id = "shop".into();
        let mut shop_eu = renewal();
        shop_eu.id = "shop-eu".into();

        let o = order(&shop_eu, &["eu.example.org"], None);
        let c = test_support::chain("Root", "eu.example.org", &["eu.example.org"]);
        let info = CertificateInfo::from_collection(vec![c.leaf], Some(c.leaf_key)).unwrap();
        cache
            .store(&shop_eu, &o, &info.to_pfx(PFX_PASSWORD).unwrap())
            .unwrap();
        cache.store_csr(&shop_eu, &o, b"csr").unwrap();
        fs::write(dir.path().join("shop-eu-cache.pfx"), b"legacy").unwrap();

        let mine = order(&shop, &["eu.example.org"], None);
        assert!(cache.previous(&shop, &mine).unwrap().is_none());
        assert!(cache.all_certificates(&shop).unwrap().is_empty());
        assert_eq!(cache.delete(&shop).unwrap(), 0);

        assert!(cache.previous(&shop_eu, &o).unwrap().is_some());
        assert_eq!(cache.delete(&shop_eu).unwrap(), 3);
    }

    #[test]
    fn file_names_parse_by_shape() {
        let hash = "A".repeat(HASH_LENGTH);
        let scoped = format!("shop-main-{}-temp.pfx", hash);
        let file = CacheFileName::parse(&scoped, "shop").unwrap();
        assert_eq!(file.kind, FileKind::Certificate);
        assert_eq!(file.scope(), Some("main"));

        let bare = format!("shop-{}-csr.pem", hash);
        let file = CacheFileName::parse(&bare, "shop").unwrap();
        assert_eq!(file.kind, FileKind::Request);
        assert_eq!(file.scope(), None);

        assert_eq!(
            CacheFileName::parse("shop.keys", "shop").map(|file| file.kind),
            Some(FileKind::Key)
        );
        assert!(CacheFileName::parse(&scoped, "sho").is_none());
        assert!(CacheFileName::parse("shop-eu-cache.pfx", "shop").is_none());
        assert!(CacheFileName::parse("shop.renewal.json", "shop").is_none());
    }

    #[test]
    fn stale_files_are_only_reported_unless_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let r = renewal();
        let o = order(&r, &["a.example.org"], None);

        let keep = CertificateCache::new(dir.path(), settings(5)).unwrap();
        let path = keep.pfx_path(&r, &fingerprint(&r, &o, MAX_CACHE_KEY_VERSION).unwrap());
        write_pfx(&path, "a.example.org", &["a.example.org"], true, 200);
        assert_eq!(keep.delete_stale_files(Utc::now()).unwrap(), 1);
        assert!(path.exists());

        let purge = CertificateCache::new(
            dir.path(),
            CacheSettings {
                delete_stale_files: true,
                ..settings(5)
            },
        )
        .unwrap();
        assert_eq!(purge.delete_stale_files(Utc::now()).unwrap(), 1);
        assert!(!path.exists());
    }
}
