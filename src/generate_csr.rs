//! Certificate Signing Request Generation Module
//!
//! Builds a PKCS#10 request for the node key. The subject carries the fields
//! the administrator entered; when the node has a hostname it becomes the
//! common name and a `subjectAltName` DNS entry.
//!
//! # Request Properties
//! - **Version**: PKCS#10 v1 (encoded as 0)
//! - **Signature Algorithm**: SHA-256 with the node key
//! - **Extensions**: subjectAltName (only with a hostname)
//!
//! # Example
//! ```rust,no_run
//! # use anyhow::Result;
//! # use https_credentials::credentials::{CsrSubject, KeyMaterial};
//! # use https_credentials::generate_csr::CsrBuilder;
//! # fn example(key: &KeyMaterial) -> Result<()> {
//! let csr = CsrBuilder::new(key)
//!     .common_name(Some("antani.gov".to_string()))
//!     .subject(CsrSubject {
//!         country: "IT".to_string(),
//!         city: "Genova".to_string(),
//!         company: "Internet Widgets LTD".to_string(),
//!         email: "nocontact@certs.may.hurt".to_string(),
//!         ..Default::default()
//!     })
//!     .build()?;
//! println!("{}", csr.to_pem());
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use chrono::Utc;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509Req};

use crate::credentials::{CsrMaterial, CsrSubject, KeyMaterial};

const X509_REQ_VERSION_1: i32 = 0; // PKCS#10 v1 is represented by 0

// ================= CSR Builder =================

/// Builder for a certificate signing request signed by the node key.
pub struct CsrBuilder<'a> {
    key: &'a KeyMaterial,
    subject: CsrSubject,
    common_name: Option<String>,
}

impl<'a> CsrBuilder<'a> {
    pub fn new(key: &'a KeyMaterial) -> Self {
        Self {
            key,
            subject: CsrSubject::default(),
            common_name: None,
        }
    }

    /// Set the subject fields entered by the administrator.
    ///
    /// Fields are expected to have passed
    /// [`CryptoValidator::validate_csr_fields`](crate::validator::CryptoValidator::validate_csr_fields);
    /// empty optional fields are left out of the subject.
    pub fn subject(mut self, subject: CsrSubject) -> Self {
        self.subject = subject;
        self
    }

    /// Set the common name (CN), normally the node hostname.
    pub fn common_name(mut self, common_name: Option<String>) -> Self {
        self.common_name = common_name;
        self
    }

    /// Build and sign the request.
    pub fn build(self) -> Result<CsrMaterial> {
        let private_key = self
            .key
            .private_key()
            .map_err(|e| anyhow!("Failed to load node key: {}", e))?;

        let mut builder =
            X509Req::builder().map_err(|e| anyhow!("Failed to create X509Req builder: {}", e))?;
        builder
            .set_version(X509_REQ_VERSION_1)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        let entries = [
            (Nid::COMMONNAME, self.common_name.as_deref().unwrap_or("")),
            (Nid::COUNTRYNAME, self.subject.country.as_str()),
            (Nid::STATEORPROVINCENAME, self.subject.province.as_str()),
            (Nid::LOCALITYNAME, self.subject.city.as_str()),
            (Nid::ORGANIZATIONNAME, self.subject.company.as_str()),
            (Nid::ORGANIZATIONALUNITNAME, self.subject.department.as_str()),
            (Nid::PKCS9_EMAILADDRESS, self.subject.email.as_str()),
        ];
        for (nid, value) in entries {
            if value.is_empty() {
                continue;
            }
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| anyhow!("Failed to set {:?}: {}", nid, e))?;
        }
        let subject_name = name_builder.build();
        builder
            .set_subject_name(&subject_name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;

        builder
            .set_pubkey(&private_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        if let Some(hostname) = &self.common_name {
            let san = SubjectAlternativeName::new()
                .dns(hostname)
                .build(&builder.x509v3_context(None))
                .map_err(|e| anyhow!("Failed to build subjectAltName: {}", e))?;
            let mut extensions =
                Stack::new().map_err(|e| anyhow!("Failed to create extension stack: {}", e))?;
            extensions
                .push(san)
                .map_err(|e| anyhow!("Failed to add subjectAltName: {}", e))?;
            builder
                .add_extensions(&extensions)
                .map_err(|e| anyhow!("Failed to add extensions: {}", e))?;
        }

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign request: {}", e))?;

        let req = builder.build();
        CsrMaterial::from_x509_req(&req, Utc::now())
            .map_err(|e| anyhow!("Generated request was rejected: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{EcCurve, KeyAlgorithm};
    use crate::generate_keypair::NodeKeyBuilder;
    use crate::pem_codec;

    fn node_key() -> KeyMaterial {
        NodeKeyBuilder::new()
            .algorithm(KeyAlgorithm::Ec {
                curve: EcCurve::P256,
            })
            .build()
            .unwrap()
    }

    fn subject() -> CsrSubject {
        CsrSubject {
            country: "IT".to_string(),
            province: "Liguria".to_string(),
            city: "Genova".to_string(),
            company: "Internet Widgets LTD".to_string(),
            department: "Suite reviews".to_string(),
            email: "nocontact@certs.may.hurt".to_string(),
        }
    }

    #[test]
    fn test_subject_round_trips_through_pem() {
        let key = node_key();
        let csr = CsrBuilder::new(&key)
            .subject(subject())
            .common_name(Some("antani.gov".to_string()))
            .build()
            .unwrap();

        let decoded = pem_codec::decode_csr(csr.to_pem().as_bytes()).unwrap();
        assert_eq!(decoded.subject(), &subject());
        assert_eq!(decoded.common_name(), Some("antani.gov"));
        assert_eq!(decoded.public_der(), key.public_der());
    }

    #[test]
    fn test_request_signature_verifies() {
        let key = node_key();
        let csr = CsrBuilder::new(&key).subject(subject()).build().unwrap();

        let req = csr.to_x509_req().unwrap();
        let public_key = req.public_key().unwrap();
        assert!(req.verify(&public_key).unwrap());
        assert_eq!(csr.common_name(), None);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let key = node_key();
        let mut fields = subject();
        fields.province.clear();
        fields.department.clear();

        let csr = CsrBuilder::new(&key).subject(fields.clone()).build().unwrap();
        assert_eq!(csr.subject(), &fields);
    }
}
