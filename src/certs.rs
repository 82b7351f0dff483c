//! Certificate discovery and selection.
//!
//! The TLS directory is scanned recursively; certificates are recognized by
//! *content* (PEM first, then DER), never by filename. Each certificate is
//! paired with a private key found in the same directory by comparing
//! public keys, and hosts are taken from the SAN list (falling back to the
//! subject CN). When several usable certificates name the same host the
//! one expiring last wins; the full candidate list is surfaced in a
//! [`ScanReport`] so the operator can see what was ignored.

use anyhow::{Context, Result};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{
    PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::sign::SigningKey as _;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// A usable certificate: a leaf plus the private key matched to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Leaf expiry as unix seconds.
    pub not_after: i64,
}

impl Certificate {
    /// Expiry rendered as RFC 3339 for log lines.
    pub fn expires_display(&self) -> String {
        time::OffsetDateTime::from_unix_timestamp(self.not_after)
            .ok()
            .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
            .unwrap_or_else(|| self.not_after.to_string())
    }
}

/// Host → selected certificate. Keys are lowercase DNS names, possibly
/// wildcards (`*.example.com`).
pub type CertMap = BTreeMap<String, Certificate>;

/// Candidates found for a host that had more than one usable certificate.
#[derive(Debug, Clone)]
pub struct MultiCertReport {
    /// Every usable candidate, in scan order.
    pub candidates: Vec<Certificate>,
    /// Index into `candidates` of the one that was selected.
    pub selected: usize,
}

/// What a scan saw beyond the winning selection.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Hosts with two or more usable candidates.
    pub multiple: BTreeMap<String, MultiCertReport>,
}

/// Scan `ssl_dir` and return the selection map together with the report.
///
/// Only certificates with a matching private key in the same directory are
/// eligible; a host without any usable pair simply does not appear in the
/// map. Unreadable or non-certificate files are skipped. An I/O error on
/// the directory walk itself is fatal.
pub fn scan_certificates(ssl_dir: &Path) -> Result<(CertMap, ScanReport)> {
    let abs_ssl_dir = ssl_dir
        .canonicalize()
        .with_context(|| format!("failed to resolve SSL directory {}", ssl_dir.display()))?;

    // Host → usable candidates in scan order.
    let mut candidates: BTreeMap<String, Vec<Certificate>> = BTreeMap::new();

    for entry in WalkDir::new(&abs_ssl_dir).sort_by_file_name() {
        let entry = entry.context("failed to scan SSL directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        let Some(parsed) = read_leaf_certificate(path) else {
            continue;
        };
        if parsed.hosts.is_empty() {
            continue;
        }

        let dir = path.parent().unwrap_or(&abs_ssl_dir);
        let Some(key_path) = find_matching_private_key(dir, &parsed.spki) else {
            debug!(cert = %path.display(), "certificate has no matching private key, skipping");
            continue;
        };

        let candidate = Certificate {
            cert_path: path.to_path_buf(),
            key_path,
            not_after: parsed.not_after,
        };
        for host in parsed.hosts {
            candidates.entry(host).or_default().push(candidate.clone());
        }
    }

    let mut map = CertMap::new();
    let mut report = ScanReport::default();
    for (host, list) in candidates {
        let mut selected = 0;
        for (i, cand) in list.iter().enumerate().skip(1) {
            if is_better_certificate(&list[selected], cand) {
                selected = i;
            }
        }
        if list.len() > 1 {
            for (i, cand) in list.iter().enumerate() {
                if i != selected {
                    warn!(
                        host = %host,
                        keep = %list[selected].cert_path.display(),
                        keep_expires = %list[selected].expires_display(),
                        ignore = %cand.cert_path.display(),
                        ignore_expires = %cand.expires_display(),
                        "multiple certificates for host, ignoring candidate"
                    );
                }
            }
            report.multiple.insert(
                host.clone(),
                MultiCertReport {
                    candidates: list.clone(),
                    selected,
                },
            );
        }
        map.insert(host, list[selected].clone());
    }

    info!(
        hosts = map.len(),
        "SSL scan completed: hosts with valid certificate+key pairs"
    );
    Ok((map, report))
}

/// Exact match first, then wildcard entries (`*.SUFFIX` matches any host
/// under `SUFFIX`, never the apex itself).
pub fn find_certificate(map: &CertMap, host: &str) -> Option<Certificate> {
    let host = host.trim().to_lowercase();
    if let Some(cert) = map.get(&host) {
        return Some(cert.clone());
    }
    for (pattern, cert) in map {
        if let Some(apex) = pattern.strip_prefix("*.") {
            let suffix = &pattern[1..]; // ".example.com"
            if host.ends_with(suffix) && host != apex {
                return Some(cert.clone());
            }
        }
    }
    None
}

/// Prefer the later expiry; on ties prefer `.pem` over `.crt` over other
/// extensions, then the lexicographically smallest paths.
fn is_better_certificate(existing: &Certificate, candidate: &Certificate) -> bool {
    if candidate.not_after != existing.not_after {
        return candidate.not_after > existing.not_after;
    }

    let existing_prio = extension_priority(&existing.cert_path);
    let candidate_prio = extension_priority(&candidate.cert_path);
    if candidate_prio != existing_prio {
        return candidate_prio > existing_prio;
    }

    let existing_cert = path_lower(&existing.cert_path);
    let candidate_cert = path_lower(&candidate.cert_path);
    if candidate_cert != existing_cert {
        return candidate_cert < existing_cert;
    }
    path_lower(&candidate.key_path) < path_lower(&existing.key_path)
}

fn extension_priority(path: &Path) -> u8 {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("pem") => 2,
        Some("crt") => 1,
        _ => 0,
    }
}

fn path_lower(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

struct ParsedLeaf {
    hosts: Vec<String>,
    not_after: i64,
    /// Raw SubjectPublicKeyInfo DER, the certificate's identity.
    spki: Vec<u8>,
}

/// Parse a file as one or more certificates and describe the leaf, or
/// `None` when the file is unreadable or not a certificate.
fn read_leaf_certificate(path: &Path) -> Option<ParsedLeaf> {
    let data = std::fs::read(path).ok()?;
    let ders = parse_certificate_ders(&data)?;

    let parsed: Vec<X509Certificate<'_>> = ders
        .iter()
        .filter_map(|der| X509Certificate::from_der(der).ok().map(|(_, c)| c))
        .collect();
    if parsed.is_empty() {
        return None;
    }
    let leaf = parsed.iter().find(|c| !is_ca(c)).unwrap_or(&parsed[0]);

    Some(ParsedLeaf {
        hosts: extract_hosts(leaf),
        not_after: leaf.validity().not_after.timestamp(),
        spki: leaf.tbs_certificate.subject_pki.raw.to_vec(),
    })
}

/// PEM blocks labeled as certificates, or the whole file as a single DER
/// certificate.
fn parse_certificate_ders(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut ders = Vec::new();
    for pem in Pem::iter_from_buffer(data).flatten() {
        if pem.label == "CERTIFICATE" || pem.label == "TRUSTED CERTIFICATE" {
            if X509Certificate::from_der(&pem.contents).is_ok() {
                ders.push(pem.contents.clone());
            }
        }
    }
    if !ders.is_empty() {
        return Some(ders);
    }

    if X509Certificate::from_der(data).is_ok() {
        return Some(vec![data.to_vec()]);
    }
    None
}

fn is_ca(cert: &X509Certificate<'_>) -> bool {
    cert.basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false)
}

/// SAN DNS names, lowercased and deduplicated; subject CN as fallback when
/// the SAN list is empty.
fn extract_hosts(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    fn add(out: &mut Vec<String>, s: &str) {
        let s = s.trim().to_lowercase();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                add(&mut out, dns);
            }
        }
    }
    if out.is_empty() {
        if let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
        {
            add(&mut out, cn);
        }
    }
    out
}

/// Look through every sibling file for a private key whose public key
/// equals the certificate's.
fn find_matching_private_key(dir: &Path, cert_spki: &[u8]) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    paths.sort();

    for path in paths {
        let Ok(data) = std::fs::read(&path) else {
            continue;
        };
        for key in parse_private_keys(&data) {
            if private_key_spki(&key).is_some_and(|spki| spki == cert_spki) {
                return Some(path);
            }
        }
    }
    None
}

/// Every private key found in the file: PEM blocks of any supported kind
/// first, then the raw bytes tried as PKCS#8, PKCS#1 and SEC1 DER.
fn parse_private_keys(data: &[u8]) -> Vec<PrivateKeyDer<'static>> {
    let mut keys: Vec<PrivateKeyDer<'static>> = Vec::new();

    let mut reader = std::io::BufReader::new(data);
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut reader) {
        match item {
            rustls_pemfile::Item::Pkcs1Key(key) => keys.push(key.into()),
            rustls_pemfile::Item::Pkcs8Key(key) => keys.push(key.into()),
            rustls_pemfile::Item::Sec1Key(key) => keys.push(key.into()),
            _ => continue,
        }
    }
    if !keys.is_empty() {
        return keys;
    }

    // DER fallbacks for files without PEM armour.
    let owned = data.to_vec();
    keys.push(PrivatePkcs8KeyDer::from(owned.clone()).into());
    keys.push(PrivatePkcs1KeyDer::from(owned.clone()).into());
    keys.push(PrivateSec1KeyDer::from(owned).into());
    keys
}

/// SubjectPublicKeyInfo DER derived from a private key, when the key is
/// well-formed and of a supported type.
fn private_key_spki(key: &PrivateKeyDer<'static>) -> Option<Vec<u8>> {
    let signer = any_supported_type(key).ok()?;
    signer.public_key().map(|spki| spki.as_ref().to_vec())
}
