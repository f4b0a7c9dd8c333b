//! Throwaway PKI for tests: a root CA, intermediates and leaf certificates
//! built with `openssl`. Keys are EC P-256 so fixtures stay fast.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509NameRef, X509};

const X509_VERSION_3: i32 = 2;
const DAY: i64 = 86_400;

pub(crate) struct TestCa {
    pub key: PKey<Private>,
    pub cert: X509,
}

pub(crate) fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

pub(crate) fn key_pem(key: &PKeyRef<Private>) -> Vec<u8> {
    key.private_key_to_pem_pkcs8().unwrap()
}

pub(crate) fn cert_pem(cert: &X509) -> Vec<u8> {
    cert.to_pem().unwrap()
}

fn name(common_name: &str) -> X509Name {
    let mut builder = X509Name::builder().unwrap();
    builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    builder
        .append_entry_by_nid(Nid::ORGANIZATIONNAME, "Test PKI")
        .unwrap();
    builder.build()
}

/// Issue a certificate for `subject_key` valid from `from_days` to `to_days`
/// relative to now.
fn issue(
    subject: &X509NameRef,
    subject_key: &PKeyRef<Private>,
    issuer: Option<(&X509NameRef, &PKeyRef<Private>)>,
    is_ca: bool,
    from_days: i64,
    to_days: i64,
) -> X509 {
    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    builder.set_subject_name(subject).unwrap();
    let (issuer_name, signing_key) = issuer.unwrap_or((subject, subject_key));
    builder.set_issuer_name(issuer_name).unwrap();

    let now = chrono::Utc::now().timestamp();
    let not_before = Asn1Time::from_unix(now + from_days * DAY).unwrap();
    let not_after = Asn1Time::from_unix(now + to_days * DAY).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    builder.set_pubkey(subject_key).unwrap();

    let mut bc = BasicConstraints::new();
    bc.critical();
    if is_ca {
        bc.ca();
    }
    builder.append_extension(bc.build().unwrap()).unwrap();

    let mut ku = KeyUsage::new();
    ku.critical();
    if is_ca {
        ku.key_cert_sign().crl_sign();
    } else {
        ku.digital_signature().key_encipherment();
    }
    builder.append_extension(ku.build().unwrap()).unwrap();

    builder.sign(signing_key, MessageDigest::sha256()).unwrap();
    builder.build()
}

pub(crate) fn root_ca(common_name: &str) -> TestCa {
    let key = ec_key();
    let cert = issue(&name(common_name), &key, None, true, -1, 3650);
    TestCa { key, cert }
}

pub(crate) fn intermediate_ca(parent: &TestCa, common_name: &str) -> TestCa {
    let key = ec_key();
    let cert = issue(
        &name(common_name),
        &key,
        Some((parent.cert.subject_name(), &*parent.key)),
        true,
        -1,
        1825,
    );
    TestCa { key, cert }
}

/// A CA whose validity window closed a day ago.
pub(crate) fn expired_intermediate_ca(parent: &TestCa, common_name: &str) -> TestCa {
    let key = ec_key();
    let cert = issue(
        &name(common_name),
        &key,
        Some((parent.cert.subject_name(), &*parent.key)),
        true,
        -30,
        -1,
    );
    TestCa { key, cert }
}

pub(crate) fn leaf(issuer: &TestCa, key: &PKeyRef<Private>, common_name: &str) -> X509 {
    issue(
        &name(common_name),
        key,
        Some((issuer.cert.subject_name(), &*issuer.key)),
        false,
        -1,
        365,
    )
}

pub(crate) fn expired_leaf(issuer: &TestCa, key: &PKeyRef<Private>, common_name: &str) -> X509 {
    issue(
        &name(common_name),
        key,
        Some((issuer.cert.subject_name(), &*issuer.key)),
        false,
        -30,
        -1,
    )
}

/// Root → intermediate → leaf for `key`, as PEM: (leaf, chain bundle, root).
pub(crate) fn issued_pems(key: &PKeyRef<Private>, common_name: &str) -> (Vec<u8>, Vec<u8>, TestCa) {
    let root = root_ca("Test Root CA");
    let intermediate = intermediate_ca(&root, "Test Intermediate CA");
    let cert = leaf(&intermediate, key, common_name);

    let mut chain = cert_pem(&intermediate.cert);
    chain.extend(cert_pem(&root.cert));
    (cert_pem(&cert), chain, root)
}
