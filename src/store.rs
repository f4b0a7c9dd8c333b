//! Credential Store
//!
//! Holds one node's credentials: a [`CredentialSet`] per provisioning mode,
//! the active mode, the node hostname and whether HTTPS is being served.
//!
//! Readers get an immutable [`NodeSnapshot`] behind an `Arc`. Writers are
//! serialized by a mutex, work on a private copy, and publish it with a single
//! pointer swap, so a reader sees either the old set or the new one and never
//! a mix. A failed mutation publishes nothing.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::credentials::{
    Certificate, CertificateChain, CsrMaterial, KeyMaterial, ProvisioningMode, Slot,
};
use crate::error::{ConflictReason, StoreError};
use crate::persistence::Persistence;
use crate::validator::CryptoValidator;

/// A value for exactly one slot.
#[derive(Debug)]
pub enum SlotValue {
    Key(KeyMaterial),
    Csr(CsrMaterial),
    Certificate(Certificate),
    Chain(CertificateChain),
}

impl SlotValue {
    pub fn slot(&self) -> Slot {
        match self {
            SlotValue::Key(_) => Slot::Key,
            SlotValue::Csr(_) => Slot::Csr,
            SlotValue::Certificate(_) => Slot::Certificate,
            SlotValue::Chain(_) => Slot::Chain,
        }
    }
}

/// Key, CSR, certificate and chain of one provisioning mode.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    pub key: Option<Arc<KeyMaterial>>,
    pub csr: Option<Arc<CsrMaterial>>,
    pub certificate: Option<Arc<Certificate>>,
    pub chain: Option<Arc<CertificateChain>>,
}

impl CredentialSet {
    pub fn is_empty(&self) -> bool {
        Slot::ALL.iter().all(|slot| !self.contains(*slot))
    }

    pub fn contains(&self, slot: Slot) -> bool {
        match slot {
            Slot::Key => self.key.is_some(),
            Slot::Csr => self.csr.is_some(),
            Slot::Certificate => self.certificate.is_some(),
            Slot::Chain => self.chain.is_some(),
        }
    }

    /// Key and certificate present and belonging together.
    pub fn is_servable(&self, validator: &CryptoValidator) -> bool {
        match (&self.key, &self.certificate) {
            (Some(key), Some(cert)) => validator.matches(key, cert),
            _ => false,
        }
    }

    /// Replace one slot after checking the set stays consistent.
    ///
    /// - a key must match a present certificate; a CSR made for another key
    ///   is dropped
    /// - a CSR needs the key it was derived from
    /// - a certificate needs a matching key, must be inside its validity
    ///   window, and must still verify against a present chain
    /// - a chain needs a certificate it verifies against
    pub fn put(&mut self, value: SlotValue, validator: &CryptoValidator) -> Result<(), StoreError> {
        let artifact = value.slot().artifact();
        let conflict = |reason: ConflictReason| StoreError::Conflict { artifact, reason };

        match value {
            SlotValue::Key(key) => {
                if let Some(cert) = &self.certificate {
                    if !validator.matches(&key, cert) {
                        return Err(conflict(ConflictReason::KeyMismatch));
                    }
                }
                if self
                    .csr
                    .as_ref()
                    .is_some_and(|csr| csr.public_der() != key.public_der())
                {
                    self.csr = None;
                }
                self.key = Some(Arc::new(key));
            }
            SlotValue::Csr(csr) => {
                let key = self
                    .key
                    .as_ref()
                    .ok_or_else(|| conflict(ConflictReason::MissingKey))?;
                if csr.public_der() != key.public_der() {
                    return Err(conflict(ConflictReason::KeyMismatch));
                }
                self.csr = Some(Arc::new(csr));
            }
            SlotValue::Certificate(cert) => {
                let key = self
                    .key
                    .as_ref()
                    .ok_or_else(|| conflict(ConflictReason::MissingKey))?;
                if !validator.matches(key, &cert) {
                    return Err(conflict(ConflictReason::KeyMismatch));
                }
                validator
                    .check_validity(&cert)
                    .map_err(|e| conflict(e.into()))?;
                if let Some(chain) = &self.chain {
                    validator
                        .verify_chain(&cert, chain)
                        .map_err(|e| conflict(e.into()))?;
                }
                self.certificate = Some(Arc::new(cert));
            }
            SlotValue::Chain(chain) => {
                let cert = self
                    .certificate
                    .as_ref()
                    .ok_or_else(|| conflict(ConflictReason::MissingCertificate))?;
                validator
                    .verify_chain(cert, &chain)
                    .map_err(|e| conflict(e.into()))?;
                self.chain = Some(Arc::new(chain));
            }
        }
        Ok(())
    }

    /// Remove one slot. Removing the key also removes the CSR derived from it.
    ///
    /// Returns every slot that was removed.
    pub fn delete(&mut self, slot: Slot) -> Result<Vec<Slot>, StoreError> {
        if !self.contains(slot) {
            return Err(StoreError::NotFound(slot.artifact()));
        }

        let mut removed = vec![slot];
        match slot {
            Slot::Key => {
                self.key = None;
                if self.csr.take().is_some() {
                    removed.push(Slot::Csr);
                }
            }
            Slot::Csr => self.csr = None,
            Slot::Certificate => self.certificate = None,
            Slot::Chain => self.chain = None,
        }
        Ok(removed)
    }

    pub fn clear(&mut self) {
        *self = CredentialSet::default();
    }
}

/// Immutable view of a node's credentials at one version.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub mode: ProvisioningMode,
    pub hostname: Option<String>,
    pub https_enabled: bool,
    pub version: u64,
    pub automatic: CredentialSet,
    pub manual: CredentialSet,
}

impl NodeSnapshot {
    pub fn new(mode: ProvisioningMode, hostname: Option<String>) -> Self {
        Self {
            mode,
            hostname,
            https_enabled: false,
            version: 0,
            automatic: CredentialSet::default(),
            manual: CredentialSet::default(),
        }
    }

    /// The set of the active mode.
    pub fn active(&self) -> &CredentialSet {
        self.set(self.mode)
    }

    pub fn active_mut(&mut self) -> &mut CredentialSet {
        self.set_mut(self.mode)
    }

    pub fn set(&self, mode: ProvisioningMode) -> &CredentialSet {
        match mode {
            ProvisioningMode::Automatic => &self.automatic,
            ProvisioningMode::Manual => &self.manual,
        }
    }

    pub fn set_mut(&mut self, mode: ProvisioningMode) -> &mut CredentialSet {
        match mode {
            ProvisioningMode::Automatic => &mut self.automatic,
            ProvisioningMode::Manual => &mut self.manual,
        }
    }

    /// Activate `mode` and drop everything the other mode held.
    pub fn set_mode(&mut self, mode: ProvisioningMode) {
        self.mode = mode;
        self.set_mut(mode.opposite()).clear();
    }
}

/// One node's credential store.
pub struct CredentialStore {
    node: String,
    current: RwLock<Arc<NodeSnapshot>>,
    writer: Mutex<()>,
    persistence: Option<Persistence>,
}

impl CredentialStore {
    pub fn new(node: impl Into<String>, initial: NodeSnapshot) -> Self {
        Self {
            node: node.into(),
            current: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(()),
            persistence: None,
        }
    }

    /// Write every committed snapshot through `persistence`.
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn get(&self) -> Arc<NodeSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Run `f` on a private copy of the snapshot, already carrying the next
    /// version number, and publish the result if it succeeds. Mutations of one
    /// node never interleave.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut NodeSnapshot) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _writer = self.writer.lock();
        let mut draft = NodeSnapshot::clone(&self.get());
        draft.version += 1;
        let output = f(&mut draft)?;

        if let Some(persistence) = &self.persistence {
            persistence.save(&draft).map_err(|e| {
                warn!(node = %self.node, error = %format!("{:#}", e), "Failed to persist credentials");
                StoreError::Persistence(format!("{:#}", e))
            })?;
        }

        debug!(node = %self.node, version = draft.version, "Credential set committed");
        *self.current.write() = Arc::new(draft);
        Ok(output)
    }

    /// Replace one slot of the active set.
    pub fn put(&self, value: SlotValue, validator: &CryptoValidator) -> Result<(), StoreError> {
        self.transact(|draft| draft.active_mut().put(value, validator))
    }

    /// Delete one slot of the active set, cascading key → CSR.
    pub fn delete(&self, slot: Slot) -> Result<Vec<Slot>, StoreError> {
        self.transact(|draft| draft.active_mut().delete(slot))
    }

    pub fn set_mode(&self, mode: ProvisioningMode) -> Result<(), StoreError> {
        self.transact(|draft| {
            draft.set_mode(mode);
            Ok(())
        })
    }
}
