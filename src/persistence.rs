//! On-disk copy of a node's credential store.
//!
//! Layout below the configured data directory:
//!
//! ```text
//! <data_dir>/<node>/state.json                 mode, hostname, version, https flag,
//!                                              current generation, creation times
//! <data_dir>/<node>/gen-*/<mode>/key.pem       PKCS#8, permissions 0600
//! <data_dir>/<node>/gen-*/<mode>/csr.pem
//! <data_dir>/<node>/gen-*/<mode>/cert.pem
//! <data_dir>/<node>/gen-*/<mode>/chain.pem
//! ```
//!
//! A save writes every slot of both modes into a fresh generation directory,
//! then replaces `state.json` (temporary file + rename) to point at it. That
//! rename is the only commit point: a failure or crash before it leaves the
//! previous generation in charge, untouched. Older generations are removed
//! once the new one is committed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

use crate::credentials::{ProvisioningMode, Slot};
use crate::pem_codec;
use crate::store::{CredentialSet, NodeSnapshot};

const STATE_FILE: &str = "state.json";
const GENERATION_PREFIX: &str = "gen-";

/// Metadata that PEM does not carry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SetTimes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    csr_created_at: Option<DateTime<Utc>>,
}

impl SetTimes {
    fn of(set: &CredentialSet) -> Self {
        Self {
            key_created_at: set.key.as_ref().map(|k| k.created_at()),
            csr_created_at: set.csr.as_ref().map(|c| c.created_at()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    mode: ProvisioningMode,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    https_enabled: bool,
    /// Directory name of the committed generation.
    #[serde(default)]
    generation: Option<String>,
    #[serde(default)]
    automatic: SetTimes,
    #[serde(default)]
    manual: SetTimes,
}

impl PersistedState {
    fn times(&self, mode: ProvisioningMode) -> &SetTimes {
        match mode {
            ProvisioningMode::Automatic => &self.automatic,
            ProvisioningMode::Manual => &self.manual,
        }
    }
}

/// Writes and reads one node's snapshot below `<data_dir>/<node>`.
#[derive(Debug, Clone)]
pub struct Persistence {
    directory: PathBuf,
}

impl Persistence {
    pub fn new(data_dir: impl AsRef<Path>, node: &str) -> Result<Self> {
        let directory = data_dir.as_ref().join(node);
        fs::create_dir_all(&directory).with_context(|| {
            format!(
                "Failed to create credential directory: {}",
                directory.display()
            )
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn read_state(&self) -> Result<Option<PersistedState>> {
        let state_path = self.directory.join(STATE_FILE);
        let Some(state_json) = read_optional(&state_path)? else {
            return Ok(None);
        };
        let state = serde_json::from_slice(&state_json)
            .with_context(|| format!("Failed to parse {}", state_path.display()))?;
        Ok(Some(state))
    }

    /// Directory of the committed generation, if any.
    pub fn generation_dir(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .read_state()?
            .and_then(|state| state.generation)
            .map(|generation| self.directory.join(generation)))
    }

    /// Load the last committed snapshot, or `None` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<NodeSnapshot>> {
        let Some(state) = self.read_state()? else {
            return Ok(None);
        };

        let mut snapshot = NodeSnapshot::new(state.mode, state.hostname.clone());
        snapshot.version = state.version;
        snapshot.https_enabled = state.https_enabled;
        if let Some(generation) = &state.generation {
            let generation_dir = self.directory.join(generation);
            for mode in [ProvisioningMode::Automatic, ProvisioningMode::Manual] {
                *snapshot.set_mut(mode) =
                    load_set(&generation_dir.join(mode.as_str()), state.times(mode))?;
            }
        }

        info!(
            directory = %self.directory.display(),
            mode = %snapshot.mode,
            version = snapshot.version,
            "Loaded persisted credentials"
        );
        Ok(Some(snapshot))
    }

    /// Write `snapshot` to disk as a new generation and commit it.
    pub fn save(&self, snapshot: &NodeSnapshot) -> Result<()> {
        let staged = self.stage(snapshot)?;
        self.commit(staged, snapshot)
    }

    /// Write every slot of both modes into a fresh generation directory.
    /// Dropping the result before `commit` removes it again.
    fn stage(&self, snapshot: &NodeSnapshot) -> Result<TempDir> {
        let staged = tempfile::Builder::new()
            .prefix(GENERATION_PREFIX)
            .tempdir_in(&self.directory)
            .with_context(|| {
                format!("Failed to create generation in {}", self.directory.display())
            })?;

        for mode in [ProvisioningMode::Automatic, ProvisioningMode::Manual] {
            write_set(&staged.path().join(mode.as_str()), snapshot.set(mode))?;
        }
        Ok(staged)
    }

    fn commit(&self, staged: TempDir, snapshot: &NodeSnapshot) -> Result<()> {
        let generation = staged
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("Generation directory has no name")?;

        let state = PersistedState {
            mode: snapshot.mode,
            hostname: snapshot.hostname.clone(),
            version: snapshot.version,
            https_enabled: snapshot.https_enabled,
            generation: Some(generation.clone()),
            automatic: SetTimes::of(&snapshot.automatic),
            manual: SetTimes::of(&snapshot.manual),
        };
        let json = serde_json::to_vec_pretty(&state).context("Failed to serialize state")?;
        write_atomic(&self.directory.join(STATE_FILE), &json)?;

        // Committed: the generation now outlives the guard.
        let _ = staged.keep();
        self.prune(&generation);

        debug!(
            directory = %self.directory.display(),
            version = snapshot.version,
            generation = %generation,
            "Saved credentials"
        );
        Ok(())
    }

    /// Remove every generation except `current`. Failures only leave disk
    /// space behind, so they are logged and not returned.
    fn prune(&self, current: &str) {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(directory = %self.directory.display(), error = %e, "Failed to list generations");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(GENERATION_PREFIX) || name == current {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(generation = %name, error = %e, "Failed to remove old generation");
            }
        }
    }
}

fn load_set(dir: &Path, times: &SetTimes) -> Result<CredentialSet> {
    let mut set = CredentialSet::default();

    if let Some(bytes) = read_optional(&dir.join(file_name(Slot::Key)))? {
        let mut key = pem_codec::decode_key(&bytes).context("Stored private key is unreadable")?;
        if let Some(created_at) = times.key_created_at {
            key = key.with_created_at(created_at);
        }
        set.key = Some(Arc::new(key));
    }
    if let Some(bytes) = read_optional(&dir.join(file_name(Slot::Csr)))? {
        let mut csr = pem_codec::decode_csr(&bytes).context("Stored CSR is unreadable")?;
        if let Some(created_at) = times.csr_created_at {
            csr = csr.with_created_at(created_at);
        }
        set.csr = Some(Arc::new(csr));
    }
    if let Some(bytes) = read_optional(&dir.join(file_name(Slot::Certificate)))? {
        let cert =
            pem_codec::decode_certificate(&bytes).context("Stored certificate is unreadable")?;
        set.certificate = Some(Arc::new(cert));
    }
    if let Some(bytes) = read_optional(&dir.join(file_name(Slot::Chain)))? {
        let chain = pem_codec::decode_chain(&bytes).context("Stored chain is unreadable")?;
        set.chain = Some(Arc::new(chain));
    }
    Ok(set)
}

fn write_set(dir: &Path, set: &CredentialSet) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    for slot in Slot::ALL {
        let contents = match slot {
            Slot::Key => set.key.as_ref().map(|k| k.to_pem()),
            Slot::Csr => set.csr.as_ref().map(|c| c.to_pem().as_bytes().to_vec()),
            Slot::Certificate => set
                .certificate
                .as_ref()
                .map(|c| c.to_pem().as_bytes().to_vec()),
            Slot::Chain => set.chain.as_ref().map(|c| c.to_pem().into_bytes()),
        };
        if let Some(bytes) = contents {
            write_file(&dir.join(file_name(slot)), &bytes, slot == Slot::Key)?;
        }
    }
    Ok(())
}

fn file_name(slot: Slot) -> &'static str {
    match slot {
        Slot::Key => "key.pem",
        Slot::Csr => "csr.pem",
        Slot::Certificate => "cert.pem",
        Slot::Chain => "chain.pem",
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Create `path` inside a staged generation. The key is created 0600 so it
/// is never readable by others.
fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()?;
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;

    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.as_file().sync_all()?;
    file.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Certificate, CertificateChain, KeyMaterial};
    use crate::test_pki;

    fn populated_snapshot() -> NodeSnapshot {
        let root = test_pki::root_ca("Persisted Root");
        let pkey = test_pki::ec_key();
        let leaf = test_pki::leaf(&root, &pkey, "node.example");
        let created_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let mut snapshot =
            NodeSnapshot::new(ProvisioningMode::Manual, Some("node.example".to_string()));
        snapshot.version = 7;
        snapshot.https_enabled = true;
        snapshot.manual = CredentialSet {
            key: Some(Arc::new(KeyMaterial::from_pkey(&pkey, created_at).unwrap())),
            csr: None,
            certificate: Some(Arc::new(Certificate::from_x509(&leaf).unwrap())),
            chain: Some(Arc::new(CertificateChain::new(vec![
                Certificate::from_x509(&root.cert).unwrap(),
            ]))),
        };
        snapshot
    }

    fn generations(persistence: &Persistence) -> Vec<String> {
        fs::read_dir(persistence.directory())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(GENERATION_PREFIX))
            .collect()
    }

    #[test]
    fn test_load_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), "node-a").unwrap();
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), "node-a").unwrap();
        let snapshot = populated_snapshot();

        persistence.save(&snapshot).unwrap();
        let loaded = persistence.load().unwrap().unwrap();

        assert_eq!(loaded.mode, ProvisioningMode::Manual);
        assert_eq!(loaded.hostname.as_deref(), Some("node.example"));
        assert_eq!(loaded.version, 7);
        assert!(loaded.https_enabled);
        assert_eq!(loaded.manual.key, snapshot.manual.key);
        assert_eq!(loaded.manual.certificate, snapshot.manual.certificate);
        assert_eq!(loaded.manual.chain, snapshot.manual.chain);
        assert!(loaded.manual.csr.is_none());
        assert!(loaded.automatic.is_empty());
    }

    #[test]
    fn test_key_creation_time_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), "node-a").unwrap();
        let snapshot = populated_snapshot();
        persistence.save(&snapshot).unwrap();

        let loaded = persistence.load().unwrap().unwrap();
        let saved_key = snapshot.manual.key.as_ref().unwrap();
        let loaded_key = loaded.manual.key.as_ref().unwrap();
        assert_eq!(loaded_key.created_at(), saved_key.created_at());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), "node-a").unwrap();
        persistence.save(&populated_snapshot()).unwrap();

        let key_path = persistence
            .generation_dir()
            .unwrap()
            .unwrap()
            .join("manual")
            .join("key.pem");
        let mode = fs::metadata(key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_cleared_slots_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), "node-a").unwrap();
        let mut snapshot = populated_snapshot();
        persistence.save(&snapshot).unwrap();

        snapshot.set_mode(ProvisioningMode::Automatic);
        persistence.save(&snapshot).unwrap();

        let generation = persistence.generation_dir().unwrap().unwrap();
        assert!(!generation.join("manual").join("cert.pem").exists());
        assert_eq!(generations(&persistence).len(), 1);
        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded.mode, ProvisioningMode::Automatic);
        assert!(loaded.manual.is_empty());
    }

    #[test]
    fn test_uncommitted_generation_leaves_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), "node-a").unwrap();
        let snapshot = populated_snapshot();
        persistence.save(&snapshot).unwrap();

        let mut next = snapshot.clone();
        next.version += 1;
        next.manual.key = None;
        // A failure between staging and commit drops the staged generation.
        drop(persistence.stage(&next).unwrap());

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.manual.key, snapshot.manual.key);
        assert_eq!(generations(&persistence).len(), 1);
    }

    #[test]
    fn test_save_does_not_touch_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), "node-a").unwrap();
        let snapshot = populated_snapshot();
        persistence.save(&snapshot).unwrap();

        // Make a file of the committed generation impossible to overwrite.
        let old = persistence.generation_dir().unwrap().unwrap();
        let chain_path = old.join("manual").join("chain.pem");
        fs::remove_file(&chain_path).unwrap();
        fs::create_dir(&chain_path).unwrap();
        fs::write(chain_path.join("occupied"), b"x").unwrap();

        let mut next = snapshot.clone();
        next.version += 1;
        next.manual.key = None;
        persistence.save(&next).unwrap();

        let loaded = persistence.load().unwrap().unwrap();
        assert_eq!(loaded.version, 8);
        assert!(loaded.manual.key.is_none());
        assert_eq!(loaded.manual.chain, snapshot.manual.chain);
        assert!(!old.exists());
    }
}
