//! Crypto Validator
//!
//! Pure checks over parsed credential material:
//! - key / certificate correspondence (SubjectPublicKeyInfo comparison)
//! - chain-of-trust linkage, validity windows and root trust
//! - CSR subject field and hostname syntax
//!
//! Nothing here mutates state or coerces input. Root trust is configured
//! through [`TrustPolicy`]; no root is trusted implicitly.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use crate::configs::TrustConfig;
use crate::credentials::{Certificate, CertificateChain, CsrSubject, KeyMaterial};
use crate::error::{ChainError, FieldError};
use crate::pem_codec;

/// Upper bound for X.509 directory string attributes (RFC 5280 ub-*).
const MAX_FIELD_LEN: usize = 64;
const MAX_EMAIL_LEN: usize = 128;
const MAX_HOSTNAME_LEN: usize = 253;

/// Which roots a chain may end at.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    trusted_roots: Vec<Certificate>,
    allow_self_declared_root: bool,
}

impl TrustPolicy {
    pub fn new(trusted_roots: Vec<Certificate>, allow_self_declared_root: bool) -> Self {
        Self {
            trusted_roots,
            allow_self_declared_root,
        }
    }

    /// Load the trusted roots named in configuration.
    pub fn from_config(config: &TrustConfig) -> Result<Self> {
        let mut trusted_roots = Vec::new();
        for path in &config.trusted_roots {
            trusted_roots.extend(load_roots(path)?);
        }
        debug!(
            roots = trusted_roots.len(),
            allow_self_declared_root = config.allow_self_declared_root,
            "Trust policy loaded"
        );
        Ok(Self::new(trusted_roots, config.allow_self_declared_root))
    }

    pub fn trusted_roots(&self) -> &[Certificate] {
        &self.trusted_roots
    }
}

fn load_roots(path: &Path) -> Result<Vec<Certificate>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read trusted roots from {}", path.display()))?;
    let chain = pem_codec::decode_chain(&pem)
        .with_context(|| format!("Failed to parse trusted roots in {}", path.display()))?;
    Ok(chain.entries().to_vec())
}

/// Validates credential material against the configured trust policy.
#[derive(Debug, Clone, Default)]
pub struct CryptoValidator {
    policy: TrustPolicy,
}

impl CryptoValidator {
    pub fn new(policy: TrustPolicy) -> Self {
        Self { policy }
    }

    /// Does `certificate` carry the public half of `key`?
    pub fn matches(&self, key: &KeyMaterial, certificate: &Certificate) -> bool {
        key.public_der() == certificate.public_der()
    }

    /// Is `certificate` inside its validity window now?
    pub fn check_validity(&self, certificate: &Certificate) -> Result<(), ChainError> {
        self.check_validity_at(certificate, Utc::now())
    }

    pub fn check_validity_at(
        &self,
        certificate: &Certificate,
        at: DateTime<Utc>,
    ) -> Result<(), ChainError> {
        if certificate.is_valid_at(at) {
            Ok(())
        } else {
            Err(ChainError::Expired {
                subject: certificate.subject().to_string(),
            })
        }
    }

    /// Verify `certificate` → `chain[0]` → ... → root at the current time.
    pub fn verify_chain(
        &self,
        certificate: &Certificate,
        chain: &CertificateChain,
    ) -> Result<(), ChainError> {
        self.verify_chain_at(certificate, chain, Utc::now())
    }

    /// Verify the chain at an explicit instant.
    ///
    /// Linkage is checked first, then every validity window, then whether the
    /// final entry is (or is signed by) a trusted root.
    pub fn verify_chain_at(
        &self,
        certificate: &Certificate,
        chain: &CertificateChain,
        at: DateTime<Utc>,
    ) -> Result<(), ChainError> {
        if chain.is_empty() {
            return Err(ChainError::Empty);
        }

        let path: Vec<&Certificate> = std::iter::once(certificate)
            .chain(chain.entries().iter())
            .collect();
        let parsed: Vec<X509> = path
            .iter()
            .enumerate()
            .map(|(position, c)| {
                c.to_x509()
                    .map_err(|_| ChainError::ChainBroken { position })
            })
            .collect::<Result<_, _>>()?;

        for (position, pair) in parsed.windows(2).enumerate() {
            if !signed_by(&pair[0], &pair[1]) {
                return Err(ChainError::ChainBroken { position });
            }
        }

        for cert in &path {
            self.check_validity_at(cert, at)?;
        }

        // Non-empty chain: the path has at least two entries.
        let last = &parsed[parsed.len() - 1];
        let last_der = path[path.len() - 1].der();
        if signed_by(last, last) {
            let pinned = self
                .policy
                .trusted_roots
                .iter()
                .any(|root| root.der() == last_der);
            if pinned || self.policy.allow_self_declared_root {
                return Ok(());
            }
            return Err(ChainError::UntrustedRoot);
        }

        let anchored = self.policy.trusted_roots.iter().any(|root| {
            root.is_valid_at(at)
                && root
                    .to_x509()
                    .map(|root| signed_by(last, &root))
                    .unwrap_or(false)
        });
        if anchored {
            Ok(())
        } else {
            Err(ChainError::UntrustedRoot)
        }
    }

    /// Check CSR subject syntax. Country, city, company and email are required.
    pub fn validate_csr_fields(&self, fields: &CsrSubject) -> Result<(), FieldError> {
        let country = fields.country.as_str();
        if country.len() != 2 || !country.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(FieldError::new(
                "country",
                "must be a two-letter ISO 3166 code in upper case",
            ));
        }

        require_text("city", &fields.city)?;
        require_text("company", &fields.company)?;
        optional_text("province", &fields.province)?;
        optional_text("department", &fields.department)?;

        if fields.email.len() > MAX_EMAIL_LEN || !email_regex().is_match(&fields.email) {
            return Err(FieldError::new("email", "must be a valid e-mail address"));
        }
        Ok(())
    }

    /// Check that `hostname` is a syntactically valid DNS name.
    pub fn validate_hostname(&self, hostname: &str) -> Result<(), FieldError> {
        if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
            return Err(FieldError::new(
                "hostname",
                format!("must be 1 to {} characters", MAX_HOSTNAME_LEN),
            ));
        }
        if !hostname.split('.').all(|label| label_regex().is_match(label)) {
            return Err(FieldError::new("hostname", "is not a valid DNS name"));
        }
        Ok(())
    }
}

/// `child` names `parent` as issuer and carries a signature made by its key.
fn signed_by(child: &X509Ref, parent: &X509Ref) -> bool {
    if parent.issued(child) != X509VerifyResult::OK {
        return false;
    }
    parent
        .public_key()
        .and_then(|key| child.verify(&key))
        .unwrap_or(false)
}

fn require_text(field: &'static str, value: &str) -> Result<(), FieldError> {
    if value.trim().is_empty() {
        return Err(FieldError::new(field, "is required"));
    }
    optional_text(field, value)
}

fn optional_text(field: &'static str, value: &str) -> Result<(), FieldError> {
    if value.chars().count() > MAX_FIELD_LEN {
        return Err(FieldError::new(
            field,
            format!("must be at most {} characters", MAX_FIELD_LEN),
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(FieldError::new(field, "must not contain control characters"));
    }
    Ok(())
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)+$")
            .expect("static e-mail pattern")
    })
}

fn label_regex() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?$").expect("static DNS label pattern")
    })
}
