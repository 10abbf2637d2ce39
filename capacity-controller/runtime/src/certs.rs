//! Self-signed serving certificates for the admission server.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use std::path::Path;
use tracing::info;

pub const CERT_FILE: &str = "tls.crt";
pub const KEY_FILE: &str = "tls.key";

const ORGANIZATION: &str = "capacity-controller";
const CA_VALIDITY_YEARS: i32 = 10;
const SERVER_VALIDITY_YEARS: i32 = 1;

/// A serving certificate and the CA that signed it.
#[derive(Clone, Debug)]
pub struct Issued {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Issues a serving certificate for `service` in `namespace`, writes it to
/// `dir`, and returns the PEM-encoded CA bundle.
///
/// The CA's private key is discarded once the certificate is signed.
pub fn write(service: &str, namespace: &str, dir: &Path) -> Result<String> {
    let issued = issue(service, namespace, Utc::now().date_naive())?;

    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let cert = dir.join(CERT_FILE);
    std::fs::write(&cert, &issued.cert_pem)
        .with_context(|| format!("writing {}", cert.display()))?;
    let key = dir.join(KEY_FILE);
    std::fs::write(&key, &issued.key_pem).with_context(|| format!("writing {}", key.display()))?;

    info!(dir = %dir.display(), "Wrote self-signed serving certificate");
    Ok(issued.ca_pem)
}

/// The names a service is reachable by from within the cluster.
pub fn dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ]
}

pub fn issue(service: &str, namespace: &str, today: NaiveDate) -> Result<Issued> {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::CommonName, format!("{service} CA"));
    ca_params.distinguished_name = dn;
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (y, m, d) = ymd(today);
    let not_before = rcgen::date_time_ymd(y, m, d);
    ca_params.not_before = not_before;
    let (y, m, d) = ymd(years_after(today, CA_VALIDITY_YEARS));
    ca_params.not_after = rcgen::date_time_ymd(y, m, d);

    let ca_key = KeyPair::generate().context("generating CA key")?;
    let ca = ca_params.self_signed(&ca_key).context("signing CA")?;

    let mut params = CertificateParams::new(dns_names(service, namespace))
        .context("invalid service name")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::CommonName, format!("{service}.{namespace}.svc"));
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = not_before;
    let (y, m, d) = ymd(years_after(today, SERVER_VALIDITY_YEARS));
    params.not_after = rcgen::date_time_ymd(y, m, d);

    let key = KeyPair::generate().context("generating serving key")?;
    let cert = params
        .signed_by(&key, &ca, &ca_key)
        .context("signing serving certificate")?;

    Ok(Issued {
        ca_pem: ca.pem(),
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn years_after(day: NaiveDate, years: i32) -> NaiveDate {
    // Feb 29 has no counterpart in most years.
    day.with_year(day.year() + years)
        .or_else(|| NaiveDate::from_ymd_opt(day.year() + years, day.month(), 28))
        .unwrap_or(day)
}

fn ymd(day: NaiveDate) -> (i32, u8, u8) {
    (day.year(), day.month() as u8, day.day() as u8)
}
