//! Shared fixtures: a throwaway CA and leaf certificates generated per
//! test run, written out as PEM files for the trust-store and local-cert
//! loading paths.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509, X509NameBuilder};
use std::io::Write;
use tempfile::NamedTempFile;

fn subject(cn: &str) -> openssl::x509::X509Name {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    name.build()
}

fn random_serial() -> openssl::asn1::Asn1Integer {
    let mut bn = BigNum::new().unwrap();
    bn.rand(159, MsbOption::MAYBE_ZERO, false).unwrap();
    bn.to_asn1_integer().unwrap()
}

/// Self-signed CA certificate and key
pub fn ca(cn: &str) -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let name = subject(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(7).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (builder.build(), key)
}

/// Leaf certificate signed by `ca`, with the given SAN DNS entries
pub fn issue(
    ca_cert: &X509,
    ca_key: &PKey<Private>,
    cn: &str,
    dns: &[&str],
) -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let name = subject(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(ca_cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(7).unwrap())
        .unwrap();

    if !dns.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for d in dns {
            san.dns(d);
        }
        let ext = san
            .build(&builder.x509v3_context(Some(ca_cert), None))
            .unwrap();
        builder.append_extension(ext).unwrap();
    }

    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Certificate + private key in one PEM file (the local-cert format)
pub fn combined_pem(cert: &X509, key: &PKey<Private>) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&cert.to_pem().unwrap()).unwrap();
    file.write_all(&key.private_key_to_pem_pkcs8().unwrap())
        .unwrap();
    file.flush().unwrap();
    file
}

/// Certificate-only PEM file (a CA bundle of one)
pub fn cert_pem(cert: &X509) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&cert.to_pem().unwrap()).unwrap();
    file.flush().unwrap();
    file
}
