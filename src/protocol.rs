//! Protocol Module
//!
//! JSON bodies exchanged over the admin API: request payloads, artifact
//! metadata, node status and the error envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::{
    Certificate, CertificateChain, CsrMaterial, CsrSubject, KeyMaterial, ProvisioningMode,
};
use crate::error::{Artifact, CredentialError};
use crate::store::SlotValue;

/// Body of `PUT /admin/https/mode`.
///
/// The mode stays a plain string here so that an unknown value surfaces as
/// `InvalidMode` rather than a generic JSON error.
#[derive(Debug, Deserialize, Serialize)]
pub struct ModeRequest {
    pub mode: String,
}

/// Body of `PUT /admin/https/hostname`.
#[derive(Debug, Deserialize, Serialize)]
pub struct HostnameRequest {
    pub hostname: String,
}

/// Query string of `DELETE /admin/https/key`.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteKeyQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
}

impl From<&KeyMaterial> for KeyInfo {
    fn from(key: &KeyMaterial) -> Self {
        Self {
            key_id: key.key_id(),
            algorithm: key.algorithm().to_string(),
            created_at: key.created_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrInfo {
    pub id: String,
    pub common_name: Option<String>,
    pub subject: CsrSubject,
    pub created_at: DateTime<Utc>,
}

impl From<&CsrMaterial> for CsrInfo {
    fn from(csr: &CsrMaterial) -> Self {
        Self {
            id: csr.id(),
            common_name: csr.common_name().map(str::to_string),
            subject: csr.subject().clone(),
            created_at: csr.created_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub fingerprint: String,
}

impl From<&Certificate> for CertificateInfo {
    fn from(cert: &Certificate) -> Self {
        Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.serial().to_string(),
            not_before: cert.not_before(),
            not_after: cert.not_after(),
            fingerprint: cert.fingerprint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub length: usize,
    pub entries: Vec<CertificateInfo>,
}

impl From<&CertificateChain> for ChainInfo {
    fn from(chain: &CertificateChain) -> Self {
        Self {
            length: chain.len(),
            entries: chain.entries().iter().map(CertificateInfo::from).collect(),
        }
    }
}

/// Metadata of an artifact that was just generated or uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArtifactInfo {
    Key(KeyInfo),
    Csr(CsrInfo),
    Cert(CertificateInfo),
    Chain(ChainInfo),
}

impl From<&SlotValue> for ArtifactInfo {
    fn from(value: &SlotValue) -> Self {
        match value {
            SlotValue::Key(key) => ArtifactInfo::Key(key.into()),
            SlotValue::Csr(csr) => ArtifactInfo::Csr(csr.into()),
            SlotValue::Certificate(cert) => ArtifactInfo::Cert(cert.into()),
            SlotValue::Chain(chain) => ArtifactInfo::Chain(chain.into()),
        }
    }
}

/// Where a node's active credential set stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    NoKey,
    KeyOnly,
    KeyAndCsr,
    KeyAndCert,
    KeyCertAndChain,
}

/// Body of `GET /admin/https/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: String,
    pub mode: ProvisioningMode,
    pub state: LifecycleState,
    pub hostname: Option<String>,
    pub https_enabled: bool,
    pub https_port: u16,
    pub version: u64,
    pub key: Option<KeyInfo>,
    pub csr: Option<CsrInfo>,
    pub certificate: Option<CertificateInfo>,
    pub chain: Option<ChainInfo>,
}

/// Error envelope returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub artifact: String,
    pub reason: String,
    pub message: String,
}

impl From<&CredentialError> for ErrorResponse {
    fn from(err: &CredentialError) -> Self {
        let message = match err {
            // Internal details stay in the log.
            CredentialError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        Self {
            error: err.code().to_string(),
            artifact: err.artifact().as_str().to_string(),
            reason: err.reason(),
            message,
        }
    }
}

impl ErrorResponse {
    /// Envelope for a request body that is not valid JSON.
    pub fn invalid_json(artifact: Artifact, detail: impl Into<String>) -> Self {
        Self {
            error: "MalformedInput".to_string(),
            artifact: artifact.as_str().to_string(),
            reason: "invalid_json".to_string(),
            message: detail.into(),
        }
    }
}
