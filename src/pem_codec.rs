//! PEM Codec
//!
//! `rustls_pemfile` does the framing and base64 work; each section's DER is
//! then handed to `openssl`. Text outside of sections (the `subject=` and
//! `issuer=` lines that many CA bundles carry) is ignored.
//!
//! Decoding is pure: the codec never looks at the credential store.

use chrono::Utc;
use openssl::ec::EcKey;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Req, X509};
use regex::Regex;
use rustls_pemfile::Item;
use std::sync::OnceLock;

use crate::credentials::{Certificate, CertificateChain, CsrMaterial, KeyMaterial};
use crate::error::CodecError;

const SUPPORTED_LABELS: [&str; 5] = [
    "PRIVATE KEY",
    "RSA PRIVATE KEY",
    "EC PRIVATE KEY",
    "CERTIFICATE REQUEST",
    "CERTIFICATE",
];
const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const LEGACY_ENCRYPTED_HEADER: &str = "Proc-Type: 4,ENCRYPTED";

/// A decoded PEM object.
#[derive(Debug, PartialEq)]
pub enum PemObject {
    Key(KeyMaterial),
    Csr(CsrMaterial),
    Certificate(Certificate),
    /// Two or more certificate blocks in one input.
    Chain(CertificateChain),
}

impl PemObject {
    fn describe(&self) -> &'static str {
        match self {
            PemObject::Key(_) => "a private key",
            PemObject::Csr(_) => "a certificate request",
            PemObject::Certificate(_) => "a certificate",
            PemObject::Chain(_) => "a certificate bundle",
        }
    }
}

fn begin_label_regex() -> &'static Regex {
    static BEGIN: OnceLock<Regex> = OnceLock::new();
    BEGIN.get_or_init(|| {
        Regex::new(r"-----BEGIN ([A-Za-z0-9 ]+)-----").expect("static PEM label pattern")
    })
}

/// Labels of every section start in the input, in order.
///
/// `rustls_pemfile` skips labels it does not know, so they are collected
/// here to report encrypted keys and unsupported blocks by name.
fn section_labels(text: &str) -> Vec<&str> {
    begin_label_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|label| label.as_str())
        .collect()
}

fn check_labels(text: &str, labels: &[&str]) -> Result<(), CodecError> {
    for label in labels {
        if *label == ENCRYPTED_KEY_LABEL {
            return Err(CodecError::EncryptedKey);
        }
        if !SUPPORTED_LABELS.contains(label) {
            return Err(CodecError::UnsupportedBlock(label.to_string()));
        }
    }
    if text.contains(LEGACY_ENCRYPTED_HEADER) {
        return Err(CodecError::EncryptedKey);
    }
    Ok(())
}

/// Read every section of `text`. Each label found must produce one item,
/// otherwise a section was cut short by the next one.
fn read_items(text: &str, expected: usize) -> Result<Vec<Item>, CodecError> {
    let mut items = Vec::with_capacity(expected);
    let mut rest = text.as_bytes();
    while let Some((item, remainder)) =
        rustls_pemfile::read_one_from_slice(rest).map_err(|_| CodecError::Truncated)?
    {
        items.push(item);
        rest = remainder;
    }

    if items.len() != expected {
        return Err(CodecError::Truncated);
    }
    Ok(items)
}

fn decode_item(item: Item) -> Result<PemObject, CodecError> {
    let pkey = match item {
        Item::Pkcs8Key(der) => PKey::private_key_from_pkcs8(der.secret_pkcs8_der()),
        Item::Pkcs1Key(der) => {
            Rsa::private_key_from_der(der.secret_pkcs1_der()).and_then(PKey::from_rsa)
        }
        Item::Sec1Key(der) => {
            EcKey::private_key_from_der(der.secret_sec1_der()).and_then(PKey::from_ec_key)
        }
        Item::Csr(der) => {
            let req = X509Req::from_der(der.as_ref()).map_err(|_| CodecError::Truncated)?;
            return CsrMaterial::from_x509_req(&req, Utc::now()).map(PemObject::Csr);
        }
        Item::X509Certificate(der) => {
            let cert = X509::from_der(der.as_ref()).map_err(|_| CodecError::Truncated)?;
            return Certificate::from_x509(&cert).map(PemObject::Certificate);
        }
        Item::SubjectPublicKeyInfo(_) => {
            return Err(CodecError::UnsupportedBlock("PUBLIC KEY".to_string()))
        }
        Item::Crl(_) => return Err(CodecError::UnsupportedBlock("X509 CRL".to_string())),
        _ => return Err(CodecError::UnsupportedBlock("unknown".to_string())),
    }
    .map_err(|_| CodecError::Truncated)?;

    KeyMaterial::from_pkey(&pkey, Utc::now()).map(PemObject::Key)
}

/// Decode PEM input into a single object.
///
/// One block yields a key, request or certificate. Several blocks are only
/// accepted when all of them are certificates, and yield a chain.
pub fn decode(input: &[u8]) -> Result<PemObject, CodecError> {
    let text = std::str::from_utf8(input).map_err(|_| CodecError::NotText)?;
    // Netscape-era alias of the PKCS#10 label.
    let text = text.replace("NEW CERTIFICATE REQUEST-----", "CERTIFICATE REQUEST-----");

    let labels = section_labels(&text);
    if labels.is_empty() {
        return Err(CodecError::Empty);
    }
    check_labels(&text, &labels)?;
    let mut items = read_items(&text, labels.len())?;

    if items.len() == 1 {
        return decode_item(items.remove(0));
    }

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match decode_item(item)? {
            PemObject::Certificate(cert) => entries.push(cert),
            other => {
                return Err(CodecError::UnexpectedBlock {
                    expected: "only certificates in a multi-block input",
                    found: other.describe().to_string(),
                })
            }
        }
    }
    Ok(PemObject::Chain(CertificateChain::new(entries)))
}

/// Decode input that must hold exactly one private key.
pub fn decode_key(input: &[u8]) -> Result<KeyMaterial, CodecError> {
    match decode(input)? {
        PemObject::Key(key) => Ok(key),
        other => Err(CodecError::UnexpectedBlock {
            expected: "a private key",
            found: other.describe().to_string(),
        }),
    }
}

/// Decode input that must hold exactly one certificate request.
pub fn decode_csr(input: &[u8]) -> Result<CsrMaterial, CodecError> {
    match decode(input)? {
        PemObject::Csr(csr) => Ok(csr),
        other => Err(CodecError::UnexpectedBlock {
            expected: "a certificate request",
            found: other.describe().to_string(),
        }),
    }
}

/// Decode input that must hold exactly one certificate.
pub fn decode_certificate(input: &[u8]) -> Result<Certificate, CodecError> {
    match decode(input)? {
        PemObject::Certificate(cert) => Ok(cert),
        other => Err(CodecError::UnexpectedBlock {
            expected: "a single certificate",
            found: other.describe().to_string(),
        }),
    }
}

/// Decode a bundle of one or more certificates into a chain.
pub fn decode_chain(input: &[u8]) -> Result<CertificateChain, CodecError> {
    match decode(input)? {
        PemObject::Certificate(cert) => Ok(CertificateChain::new(vec![cert])),
        PemObject::Chain(chain) => Ok(chain),
        other => Err(CodecError::UnexpectedBlock {
            expected: "certificates",
            found: other.describe().to_string(),
        }),
    }
}

/// Encode an object back to PEM. Keys always come out as PKCS#8.
pub fn encode(object: &PemObject) -> Vec<u8> {
    match object {
        PemObject::Key(key) => key.to_pem(),
        PemObject::Csr(csr) => csr.to_pem().as_bytes().to_vec(),
        PemObject::Certificate(cert) => cert.to_pem().as_bytes().to_vec(),
        PemObject::Chain(chain) => chain.to_pem().into_bytes(),
    }
}

/// Reject inputs above `limit` bytes before any parsing happens.
pub fn check_size(input: &[u8], limit: usize) -> Result<(), CodecError> {
    if input.len() > limit {
        return Err(CodecError::TooLarge { limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pki;

    #[test]
    fn test_round_trip_key() {
        let pem = test_pki::key_pem(&test_pki::ec_key());
        let decoded = decode(&pem).unwrap();
        assert!(matches!(decoded, PemObject::Key(_)));
        assert_eq!(decode(&encode(&decoded)).unwrap(), decoded);
    }

    #[test]
    fn test_round_trip_traditional_rsa_key() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let traditional = rsa.private_key_to_pem().unwrap();
        assert!(String::from_utf8_lossy(&traditional).contains("BEGIN RSA PRIVATE KEY"));

        let key = decode_key(&traditional).unwrap();
        let encoded = encode(&PemObject::Key(key));
        assert!(String::from_utf8_lossy(&encoded).contains("BEGIN PRIVATE KEY"));
        assert!(matches!(decode(&encoded).unwrap(), PemObject::Key(_)));
    }

    #[test]
    fn test_round_trip_chain() {
        let root = test_pki::root_ca("Codec Root");
        let intermediate = test_pki::intermediate_ca(&root, "Codec Intermediate");
        let mut bundle = test_pki::cert_pem(&intermediate.cert);
        bundle.extend(test_pki::cert_pem(&root.cert));

        let decoded = decode(&bundle).unwrap();
        match &decoded {
            PemObject::Chain(chain) => assert_eq!(chain.len(), 2),
            other => panic!("expected chain, got {:?}", other),
        }
        assert_eq!(decode(&encode(&decoded)).unwrap(), decoded);
    }

    #[test]
    fn test_round_trip_certificate() {
        let root = test_pki::root_ca("Single Root");
        let decoded = decode(&test_pki::cert_pem(&root.cert)).unwrap();
        assert!(matches!(decoded, PemObject::Certificate(_)));
        assert_eq!(decode(&encode(&decoded)).unwrap(), decoded);
    }

    #[test]
    fn test_round_trip_csr() {
        let key = KeyMaterial::from_pkey(&test_pki::ec_key(), Utc::now()).unwrap();
        let csr = crate::generate_csr::CsrBuilder::new(&key)
            .common_name(Some("codec.example".to_string()))
            .build()
            .unwrap();

        let decoded = decode(csr.to_pem().as_bytes()).unwrap();
        match &decoded {
            PemObject::Csr(parsed) => {
                assert_eq!(parsed.id(), csr.id());
                assert_eq!(parsed.common_name(), Some("codec.example"));
            }
            other => panic!("expected csr, got {:?}", other),
        }
        assert_eq!(decode(&encode(&decoded)).unwrap(), decoded);
    }

    #[test]
    fn test_legacy_csr_label() {
        let key = KeyMaterial::from_pkey(&test_pki::ec_key(), Utc::now()).unwrap();
        let csr = crate::generate_csr::CsrBuilder::new(&key).build().unwrap();
        let legacy = csr
            .to_pem()
            .replace("CERTIFICATE REQUEST-----", "NEW CERTIFICATE REQUEST-----");

        assert_eq!(decode_csr(legacy.as_bytes()).unwrap().id(), csr.id());
    }

    #[test]
    fn test_sec1_ec_key() {
        let pkey = test_pki::ec_key();
        let sec1 = pkey.ec_key().unwrap().private_key_to_pem().unwrap();
        assert!(String::from_utf8_lossy(&sec1).contains("BEGIN EC PRIVATE KEY"));

        let key = decode_key(&sec1).unwrap();
        assert_eq!(key.public_der(), pkey.public_key_to_der().unwrap().as_slice());
    }

    #[test]
    fn test_legacy_encrypted_key_rejected() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let encrypted = rsa
            .private_key_to_pem_passphrase(openssl::symm::Cipher::aes_128_cbc(), b"passphrase")
            .unwrap();
        assert!(String::from_utf8_lossy(&encrypted).contains("Proc-Type: 4,ENCRYPTED"));
        assert_eq!(decode(&encrypted).unwrap_err(), CodecError::EncryptedKey);
    }

    #[test]
    fn test_explanatory_text_ignored() {
        let root = test_pki::root_ca("Annotated Root");
        let mut input = b"subject=CN = Annotated Root\nissuer=CN = Annotated Root\n".to_vec();
        input.extend(test_pki::cert_pem(&root.cert));

        let cert = decode_certificate(&input).unwrap();
        assert!(cert.subject().contains("Annotated Root"));
    }

    #[test]
    fn test_truncated_input() {
        let pem = test_pki::cert_pem(&test_pki::root_ca("Truncated").cert);
        let cut = &pem[..pem.len() / 2];
        assert_eq!(decode(cut).unwrap_err(), CodecError::Truncated);
    }

    #[test]
    fn test_first_block_cut_short() {
        let root = test_pki::root_ca("Cut Root");
        let pem = test_pki::cert_pem(&root.cert);
        let mut input = pem[..pem.len() / 2].to_vec();
        input.extend(&pem);
        assert_eq!(decode(&input).unwrap_err(), CodecError::Truncated);
    }

    #[test]
    fn test_unsupported_block() {
        let input = b"-----BEGIN PGP PUBLIC KEY BLOCK-----\nAAAA\n-----END PGP PUBLIC KEY BLOCK-----\n";
        assert_eq!(
            decode(input).unwrap_err(),
            CodecError::UnsupportedBlock("PGP PUBLIC KEY BLOCK".to_string())
        );
    }

    #[test]
    fn test_encrypted_key_rejected() {
        let pkey = test_pki::ec_key();
        let encrypted = pkey
            .private_key_to_pem_pkcs8_passphrase(
                openssl::symm::Cipher::aes_256_cbc(),
                b"passphrase",
            )
            .unwrap();
        assert_eq!(decode(&encrypted).unwrap_err(), CodecError::EncryptedKey);
    }

    #[test]
    fn test_empty_and_binary_input() {
        assert_eq!(decode(b"no pem here").unwrap_err(), CodecError::Empty);
        assert_eq!(decode(&[0xff, 0xfe, 0x00]).unwrap_err(), CodecError::NotText);
    }

    #[test]
    fn test_wrong_type_for_slot() {
        let key_pem = test_pki::key_pem(&test_pki::ec_key());
        let err = decode_certificate(&key_pem).unwrap_err();
        assert_eq!(err.reason(), "unexpected_block");

        let root = test_pki::root_ca("Mixed Root");
        let mut mixed = test_pki::cert_pem(&root.cert);
        mixed.extend(&key_pem);
        assert_eq!(decode_chain(&mixed).unwrap_err().reason(), "unexpected_block");
    }

    #[test]
    fn test_size_limit() {
        assert!(check_size(&[0u8; 16], 16).is_ok());
        assert_eq!(
            check_size(&[0u8; 17], 16).unwrap_err(),
            CodecError::TooLarge { limit: 16 }
        );
    }
}
