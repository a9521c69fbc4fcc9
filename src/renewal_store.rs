//! One `{id}.renewal.json` document per renewal.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::{error::Error, model::Renewal};

const EXTENSION: &str = ".renewal.json";

pub struct RenewalStore {
    dir: PathBuf,
}

impl RenewalStore {
    pub fn new(dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, EXTENSION))
    }

    /// Every readable renewal, sorted by id. Unreadable documents are skipped.
    pub fn list(&self) -> Result<Vec<Renewal>, Error> {
        let mut renewals = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_renewal = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(EXTENSION))
                .unwrap_or(false);
            if !is_renewal {
                continue;
            }
            match Self::read(&path) {
                Ok(renewal) => renewals.push(renewal),
                Err(e) => warn!("Skipping unreadable renewal {}: {}", path.display(), e),
            }
        }
        renewals.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(renewals)
    }

    pub fn load(&self, id: &str) -> Result<Option<Renewal>, Error> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn read(path: &Path) -> Result<Renewal, Error> {
        let json = fs::read(path)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Writes the renewal, or removes its document when it is marked deleted.
    pub fn save(&self, renewal: &Renewal) -> Result<(), Error> {
        let path = self.path(&renewal.id);
        if renewal.deleted {
            return match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed {}", path.display());
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        fs::write(&path, serde_json::to_vec_pretty(renewal)?)?;
        debug!("Saved {}", path.display());
        Ok(())
    }
}
