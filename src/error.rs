//! Error types for the HTTPS credential manager.
//!
//! Each layer reports its own structured error: the PEM codec returns
//! [`CodecError`], the validator [`ChainError`] / [`FieldError`], the store
//! [`StoreError`]. The lifecycle controller folds all of them into
//! [`CredentialError`], which is what the admin API turns into a status code
//! and a stable machine-readable reason.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The artifact an operation or failure refers to.
///
/// Serialized names match the admin API paths (`key`, `csr`, `cert`, `chain`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Artifact {
    Key,
    Csr,
    Cert,
    Chain,
    Mode,
    Hostname,
    Https,
    Node,
}

impl Artifact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Artifact::Key => "key",
            Artifact::Csr => "csr",
            Artifact::Cert => "cert",
            Artifact::Chain => "chain",
            Artifact::Mode => "mode",
            Artifact::Hostname => "hostname",
            Artifact::Https => "https",
            Artifact::Node => "node",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PEM decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("input is not valid UTF-8 text")]
    NotText,

    #[error("no PEM block found in input")]
    Empty,

    #[error("PEM input is truncated or corrupt")]
    Truncated,

    #[error("unsupported PEM block type '{0}'")]
    UnsupportedBlock(String),

    #[error("encrypted private keys are not supported")]
    EncryptedKey,

    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("expected {expected}, found {found}")]
    UnexpectedBlock {
        expected: &'static str,
        found: String,
    },

    #[error("input exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
}

impl CodecError {
    pub fn reason(&self) -> &'static str {
        match self {
            CodecError::NotText => "not_text",
            CodecError::Empty => "empty",
            CodecError::Truncated => "truncated",
            CodecError::UnsupportedBlock(_) => "unsupported_block",
            CodecError::EncryptedKey => "encrypted_key",
            CodecError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            CodecError::UnexpectedBlock { .. } => "unexpected_block",
            CodecError::TooLarge { .. } => "too_large",
        }
    }
}

/// Chain-of-trust failures reported by the validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("certificate chain is empty")]
    Empty,

    /// `position` is the index of the certificate whose issuer link failed,
    /// 0 being the leaf certificate.
    #[error("chain broken: certificate {position} is not signed by the next entry")]
    ChainBroken { position: usize },

    #[error("certificate '{subject}' is outside its validity window")]
    Expired { subject: String },

    #[error("chain does not end at a trusted root")]
    UntrustedRoot,
}

impl ChainError {
    pub fn reason(&self) -> &'static str {
        match self {
            ChainError::Empty | ChainError::ChainBroken { .. } => "chain_broken",
            ChainError::Expired { .. } => "expired",
            ChainError::UntrustedRoot => "untrusted_root",
        }
    }
}

/// A CSR subject (or hostname) field that failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid field '{field}': {reason}")]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Why a mutation conflicts with the current credential set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    #[error("public key does not match the stored private key")]
    KeyMismatch,

    #[error("a private key is required")]
    MissingKey,

    #[error("a certificate is required")]
    MissingCertificate,

    #[error("key and matching certificate are required to serve HTTPS")]
    Incomplete,

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl ConflictReason {
    pub fn reason(&self) -> &'static str {
        match self {
            ConflictReason::KeyMismatch => "key_mismatch",
            ConflictReason::MissingKey => "missing_key",
            ConflictReason::MissingCertificate => "missing_certificate",
            ConflictReason::Incomplete => "incomplete",
            ConflictReason::Chain(e) => e.reason(),
        }
    }
}

/// Credential store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(Artifact),

    #[error("{artifact} conflicts with the credential set: {reason}")]
    Conflict {
        artifact: Artifact,
        reason: ConflictReason,
    },

    #[error("failed to persist credential set: {0}")]
    Persistence(String),
}

/// Errors surfaced by the lifecycle controller and the admin API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("malformed {artifact}: {detail}")]
    MalformedInput {
        artifact: Artifact,
        reason: &'static str,
        detail: String,
    },

    #[error(transparent)]
    InvalidField(#[from] FieldError),

    #[error("{artifact} conflict: {reason}")]
    Conflict {
        artifact: Artifact,
        reason: ConflictReason,
    },

    #[error("{0} already exists")]
    AlreadyExists(Artifact),

    #[error("{0} not found")]
    NotFound(Artifact),

    #[error("no private key present")]
    NoKeyPresent,

    #[error("{0} is in use by the live HTTPS listener")]
    InUse(Artifact),

    #[error("invalid mode '{0}'")]
    InvalidMode(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CredentialError {
    pub fn malformed(artifact: Artifact, err: CodecError) -> Self {
        CredentialError::MalformedInput {
            artifact,
            reason: err.reason(),
            detail: err.to_string(),
        }
    }

    /// Stable error code reported to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::MalformedInput { .. } => "MalformedInput",
            CredentialError::InvalidField(_) => "InvalidField",
            CredentialError::Conflict { .. } => "Conflict",
            CredentialError::AlreadyExists(_) => "AlreadyExists",
            CredentialError::NotFound(_) => "NotFound",
            CredentialError::NoKeyPresent => "NoKeyPresent",
            CredentialError::InUse(_) => "InUse",
            CredentialError::InvalidMode(_) => "InvalidMode",
            CredentialError::UnknownNode(_) => "UnknownNode",
            CredentialError::Internal(_) => "Internal",
        }
    }

    /// The artifact the failure is about, so clients can target the right panel.
    pub fn artifact(&self) -> Artifact {
        match self {
            CredentialError::MalformedInput { artifact, .. }
            | CredentialError::Conflict { artifact, .. } => *artifact,
            CredentialError::InvalidField(e) if e.field == "hostname" => Artifact::Hostname,
            CredentialError::InvalidField(_) => Artifact::Csr,
            CredentialError::AlreadyExists(a)
            | CredentialError::NotFound(a)
            | CredentialError::InUse(a) => *a,
            CredentialError::NoKeyPresent => Artifact::Key,
            CredentialError::InvalidMode(_) => Artifact::Mode,
            CredentialError::UnknownNode(_) => Artifact::Node,
            CredentialError::Internal(_) => Artifact::Https,
        }
    }

    /// Machine-readable reason, finer grained than [`code`](Self::code).
    pub fn reason(&self) -> String {
        match self {
            CredentialError::MalformedInput { reason, .. } => (*reason).to_string(),
            CredentialError::InvalidField(e) => e.field.to_string(),
            CredentialError::Conflict { reason, .. } => reason.reason().to_string(),
            CredentialError::AlreadyExists(_) => "already_exists".to_string(),
            CredentialError::NotFound(_) => "not_found".to_string(),
            CredentialError::NoKeyPresent => "no_key_present".to_string(),
            CredentialError::InUse(_) => "in_use".to_string(),
            CredentialError::InvalidMode(_) => "invalid_mode".to_string(),
            CredentialError::UnknownNode(_) => "unknown_node".to_string(),
            CredentialError::Internal(_) => "internal".to_string(),
        }
    }
}

impl From<StoreError> for CredentialError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(artifact) => CredentialError::NotFound(artifact),
            StoreError::Conflict { artifact, reason } => {
                CredentialError::Conflict { artifact, reason }
            }
            StoreError::Persistence(detail) => CredentialError::Internal(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_conflict_reason() {
        let err = CredentialError::Conflict {
            artifact: Artifact::Chain,
            reason: ConflictReason::Chain(ChainError::ChainBroken { position: 0 }),
        };
        assert_eq!(err.code(), "Conflict");
        assert_eq!(err.reason(), "chain_broken");
        assert_eq!(err.artifact(), Artifact::Chain);
    }

    #[test]
    fn test_store_error_conversion() {
        let err: CredentialError = StoreError::NotFound(Artifact::Csr).into();
        assert_eq!(err, CredentialError::NotFound(Artifact::Csr));
        assert_eq!(err.to_string(), "csr not found");
    }

    #[test]
    fn test_field_error_targets_panel() {
        let csr: CredentialError = FieldError::new("country", "must be two letters").into();
        assert_eq!(csr.artifact(), Artifact::Csr);
        assert_eq!(csr.reason(), "country");

        let host: CredentialError = FieldError::new("hostname", "empty").into();
        assert_eq!(host.artifact(), Artifact::Hostname);
    }
}
