//! Credential material held for a node: private key, CSR, certificate, chain.
//!
//! Every type here is an immutable, already-parsed value. Construction goes
//! through `openssl` so a value that exists is structurally well formed; the
//! canonical PEM text is kept alongside so encoding never fails.
//!
//! Private key bytes live in a [`secrecy::Secret`] and are zeroized on drop.
//! They are never printed by `Debug`.

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private};
use openssl::x509::{X509NameRef, X509Ref, X509Req, X509ReqRef, X509};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Artifact, CodecError, CredentialError};

/// Minimum RSA modulus accepted for uploaded or generated keys.
pub const MIN_RSA_BITS: u32 = 2048;

/// Elliptic curves accepted for node keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcCurve {
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
}

impl EcCurve {
    pub fn nid(&self) -> Nid {
        match self {
            EcCurve::P256 => Nid::X9_62_PRIME256V1,
            EcCurve::P384 => Nid::SECP384R1,
        }
    }

    fn from_nid(nid: Nid) -> Option<Self> {
        match nid {
            Nid::X9_62_PRIME256V1 => Some(EcCurve::P256),
            Nid::SECP384R1 => Some(EcCurve::P384),
            _ => None,
        }
    }
}

/// Algorithm and size of a private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa { bits: u32 },
    Ec { curve: EcCurve },
}

impl KeyAlgorithm {
    /// Inspect a parsed key and reject anything the node cannot serve with.
    pub fn of<T: HasPublic>(pkey: &PKeyRef<T>) -> Result<Self, CodecError> {
        match pkey.id() {
            Id::RSA => {
                let bits = pkey.bits();
                if bits < MIN_RSA_BITS {
                    return Err(CodecError::UnsupportedAlgorithm(format!(
                        "RSA-{} is below the {}-bit minimum",
                        bits, MIN_RSA_BITS
                    )));
                }
                Ok(KeyAlgorithm::Rsa { bits })
            }
            Id::EC => {
                let ec = pkey
                    .ec_key()
                    .map_err(|_| CodecError::UnsupportedAlgorithm("EC".to_string()))?;
                ec.group()
                    .curve_name()
                    .and_then(EcCurve::from_nid)
                    .map(|curve| KeyAlgorithm::Ec { curve })
                    .ok_or_else(|| {
                        CodecError::UnsupportedAlgorithm("EC key on an unsupported curve".into())
                    })
            }
            other => Err(CodecError::UnsupportedAlgorithm(format!("{:?}", other))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa { bits } => write!(f, "RSA-{}", bits),
            KeyAlgorithm::Ec { curve: EcCurve::P256 } => f.write_str("EC-P256"),
            KeyAlgorithm::Ec { curve: EcCurve::P384 } => f.write_str("EC-P384"),
        }
    }
}

/// Provisioning mode of a node. Each mode owns its own credential set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    Automatic,
    Manual,
}

impl ProvisioningMode {
    pub fn opposite(self) -> Self {
        match self {
            ProvisioningMode::Automatic => ProvisioningMode::Manual,
            ProvisioningMode::Manual => ProvisioningMode::Automatic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningMode::Automatic => "automatic",
            ProvisioningMode::Manual => "manual",
        }
    }
}

impl fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningMode {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(ProvisioningMode::Automatic),
            "manual" => Ok(ProvisioningMode::Manual),
            other => Err(CredentialError::InvalidMode(other.to_string())),
        }
    }
}

/// One credential slot of a node's set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Key,
    Csr,
    Certificate,
    Chain,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Key, Slot::Csr, Slot::Certificate, Slot::Chain];

    pub fn artifact(self) -> Artifact {
        match self {
            Slot::Key => Artifact::Key,
            Slot::Csr => Artifact::Csr,
            Slot::Certificate => Artifact::Cert,
            Slot::Chain => Artifact::Chain,
        }
    }
}

// ================= Private key =================

/// The node's private key.
///
/// Stored as PKCS#8 PEM inside a zeroizing secret. Equality compares the key
/// material only; `created_at` is metadata and does not survive a PEM
/// round trip.
pub struct KeyMaterial {
    pem: Secret<Vec<u8>>,
    public_der: Vec<u8>,
    algorithm: KeyAlgorithm,
    created_at: DateTime<Utc>,
}

impl KeyMaterial {
    pub fn from_pkey(pkey: &PKeyRef<Private>, created_at: DateTime<Utc>) -> Result<Self, CodecError> {
        let algorithm = KeyAlgorithm::of(pkey)?;
        let pem = pkey
            .private_key_to_pem_pkcs8()
            .map_err(|_| CodecError::Truncated)?;
        let public_der = pkey.public_key_to_der().map_err(|_| CodecError::Truncated)?;

        Ok(Self {
            pem: Secret::new(pem),
            public_der,
            algorithm,
            created_at,
        })
    }

    /// Rebuild the openssl key for signing. Only held for the call's duration.
    pub fn private_key(&self) -> Result<PKey<Private>, ErrorStack> {
        PKey::private_key_from_pem(self.pem.expose_secret())
    }

    /// PKCS#8 PEM of the key. Callers must not log the result.
    pub fn to_pem(&self) -> Vec<u8> {
        self.pem.expose_secret().clone()
    }

    /// DER SubjectPublicKeyInfo of the matching public key.
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Replace the creation time, e.g. with the one recorded on disk.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// SHA-256 of the public key, used as a stable key identifier.
    pub fn key_id(&self) -> String {
        hex_digest(&self.public_der)
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.pem.expose_secret() == other.pem.expose_secret() && self.algorithm == other.algorithm
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id())
            .field("pem", &"<redacted>")
            .finish()
    }
}

// ================= CSR =================

/// Subject fields of a certificate signing request, as the admin enters them.
///
/// Missing JSON fields deserialize to empty strings so the validator, not the
/// JSON layer, decides which ones are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrSubject {
    pub country: String,
    pub province: String,
    pub city: String,
    pub company: String,
    pub department: String,
    pub email: String,
}

impl CsrSubject {
    fn from_name(name: &X509NameRef) -> Self {
        Self {
            country: name_entry(name, Nid::COUNTRYNAME).unwrap_or_default(),
            province: name_entry(name, Nid::STATEORPROVINCENAME).unwrap_or_default(),
            city: name_entry(name, Nid::LOCALITYNAME).unwrap_or_default(),
            company: name_entry(name, Nid::ORGANIZATIONNAME).unwrap_or_default(),
            department: name_entry(name, Nid::ORGANIZATIONALUNITNAME).unwrap_or_default(),
            email: name_entry(name, Nid::PKCS9_EMAILADDRESS).unwrap_or_default(),
        }
    }
}

/// A certificate signing request derived from the node key.
///
/// Two requests are equal when their DER is; `created_at` is not compared.
#[derive(Clone)]
pub struct CsrMaterial {
    pem: String,
    der: Vec<u8>,
    subject: CsrSubject,
    common_name: Option<String>,
    public_der: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl CsrMaterial {
    pub fn from_x509_req(req: &X509ReqRef, created_at: DateTime<Utc>) -> Result<Self, CodecError> {
        let der = req.to_der().map_err(|_| CodecError::Truncated)?;
        let pem = String::from_utf8(req.to_pem().map_err(|_| CodecError::Truncated)?)
            .map_err(|_| CodecError::NotText)?;
        let public_key = req.public_key().map_err(|_| CodecError::Truncated)?;
        KeyAlgorithm::of(&*public_key)?;
        let public_der = public_key
            .public_key_to_der()
            .map_err(|_| CodecError::Truncated)?;

        Ok(Self {
            pem,
            der,
            subject: CsrSubject::from_name(req.subject_name()),
            common_name: name_entry(req.subject_name(), Nid::COMMONNAME),
            public_der,
            created_at,
        })
    }

    pub fn to_x509_req(&self) -> Result<X509Req, ErrorStack> {
        X509Req::from_der(&self.der)
    }

    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    pub fn subject(&self) -> &CsrSubject {
        &self.subject
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// SHA-256 of the DER request.
    pub fn id(&self) -> String {
        hex_digest(&self.der)
    }
}

impl PartialEq for CsrMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for CsrMaterial {}

impl fmt::Debug for CsrMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrMaterial")
            .field("id", &self.id())
            .field("common_name", &self.common_name)
            .field("subject", &self.subject)
            .finish()
    }
}

// ================= Certificates =================

/// An X.509 certificate with the metadata the admin panel shows.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pem: String,
    der: Vec<u8>,
    subject: String,
    issuer: String,
    serial: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_der: Vec<u8>,
}

impl Certificate {
    pub fn from_x509(cert: &X509Ref) -> Result<Self, CodecError> {
        let der = cert.to_der().map_err(|_| CodecError::Truncated)?;
        let pem = String::from_utf8(cert.to_pem().map_err(|_| CodecError::Truncated)?)
            .map_err(|_| CodecError::NotText)?;
        let public_der = cert
            .public_key()
            .and_then(|k| k.public_key_to_der())
            .map_err(|_| CodecError::Truncated)?;
        let serial = cert
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
            .map_err(|_| CodecError::Truncated)?;
        let not_before = asn1_to_utc(cert.not_before()).map_err(|_| CodecError::Truncated)?;
        let not_after = asn1_to_utc(cert.not_after()).map_err(|_| CodecError::Truncated)?;

        Ok(Self {
            pem,
            der,
            subject: format_name(cert.subject_name()),
            issuer: format_name(cert.issuer_name()),
            serial,
            not_before,
            not_after,
            public_der,
        })
    }

    pub fn to_x509(&self) -> Result<X509, ErrorStack> {
        X509::from_der(&self.der)
    }

    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    /// SHA-256 fingerprint of the DER certificate.
    pub fn fingerprint(&self) -> String {
        hex_digest(&self.der)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Intermediates (and optionally the root) from the leaf's issuer upwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    entries: Vec<Certificate>,
}

impl CertificateChain {
    pub fn new(entries: Vec<Certificate>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Certificate] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Concatenated PEM of every entry, in chain order.
    pub fn to_pem(&self) -> String {
        self.entries.iter().map(Certificate::to_pem).collect()
    }
}

// ================= helpers =================

/// Text of the first `nid` entry. Interior NUL bytes are kept, so a value
/// like `a.example\0.evil` never compares equal to `a.example`.
pub(crate) fn name_entry(name: &X509NameRef, nid: Nid) -> Option<String> {
    name.entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}

fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let field = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .to_string()
                .map(|s| s.replace('\0', "\\0"))
                .unwrap_or_else(|_| "<invalid>".to_string());
            format!("{}={}", field, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, ErrorStack> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Ok(DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC))
}

fn hex_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
