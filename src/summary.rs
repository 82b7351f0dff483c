//! The per-apply domain summary.
//!
//! After every successful apply the orchestrator logs one structured block
//! grouping routes into success / no-cert / expired / multi-cert buckets,
//! each sorted by the TLD-first comparator so related domains cluster.

use crate::certs::{CertMap, ScanReport};
use crate::config::{split_domain_path, RoutingTable};
use crate::upstream::parse_upstream;
use std::cmp::Ordering;
use tracing::{info, warn};

/// TLD-first ordering on domains: labels are compared right to left by
/// Unicode order; when one domain is a label-suffix of the other, the
/// shorter sorts first.
///
/// ```text
/// abc.az < abc.de < abc.abc.de < aad.def < abc.def < abc.abc.def
/// ```
pub fn domain_order(a: &str, b: &str) -> Ordering {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return Ordering::Equal;
    }

    let ap: Vec<&str> = a.split('.').collect();
    let bp: Vec<&str> = b.split('.').collect();
    for (la, lb) in ap.iter().rev().zip(bp.iter().rev()) {
        match la.cmp(lb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    ap.len().cmp(&bp.len())
}

/// One summary line: a routed `host[/path]` with every upstream it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub host: String,
    pub path: String,
    /// `scheme://host:port[/path]` targets, in routing-table order.
    pub targets: Vec<String>,
}

impl SummaryEntry {
    fn render(&self) -> String {
        format!("{}{} -> {}", self.host, self.path, self.targets.join(", "))
    }
}

/// Bare host before the same host with a path; paths lexicographic.
fn entry_order(a: &SummaryEntry, b: &SummaryEntry) -> Ordering {
    domain_order(&a.host, &b.host).then_with(|| a.path.cmp(&b.path))
}

/// The four buckets of a domain summary.
#[derive(Debug, Default, Clone)]
pub struct DomainSummary {
    pub success: Vec<SummaryEntry>,
    pub no_cert: Vec<SummaryEntry>,
    pub expired: Vec<SummaryEntry>,
    pub multi_cert: Vec<SummaryEntry>,
}

impl DomainSummary {
    /// Classify every route of the (effective) routing table against the
    /// active certificate map. `now` is unix seconds.
    pub fn build(
        ports: &RoutingTable,
        active_certs: &CertMap,
        report: &ScanReport,
        now: i64,
    ) -> Self {
        // (host, path) → targets, first-seen order preserved for targets.
        let mut entries: Vec<SummaryEntry> = Vec::new();
        for (key, domain_paths) in ports {
            let upstream = parse_upstream(key);
            for domain_path in domain_paths {
                let (host, path) = split_domain_path(domain_path);
                let host = host.trim().to_lowercase();
                if host.is_empty() {
                    continue;
                }
                let target = upstream.display_target();
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.host == host && e.path == path)
                {
                    if !entry.targets.contains(&target) {
                        entry.targets.push(target);
                    }
                } else {
                    entries.push(SummaryEntry {
                        host,
                        path: path.to_string(),
                        targets: vec![target],
                    });
                }
            }
        }

        let mut summary = DomainSummary::default();
        for entry in entries {
            if report.multiple.contains_key(&entry.host) {
                summary.multi_cert.push(entry.clone());
            }
            match active_certs.get(&entry.host) {
                None => summary.no_cert.push(entry),
                Some(cert) if cert.not_after != 0 && cert.not_after <= now => {
                    summary.expired.push(entry)
                }
                Some(_) => summary.success.push(entry),
            }
        }

        summary.success.sort_by(entry_order);
        summary.no_cert.sort_by(entry_order);
        summary.expired.sort_by(entry_order);
        summary.multi_cert.sort_by(entry_order);
        summary
    }

    pub fn total(&self) -> usize {
        self.success.len() + self.no_cert.len() + self.expired.len()
    }

    /// Emit the summary through the logger, one block per non-empty bucket.
    pub fn log(&self) {
        info!(
            "Domain summary: total={} matched={} warning(no-cert)={} warning(expired)={}",
            self.total(),
            self.success.len(),
            self.no_cert.len(),
            self.expired.len()
        );
        if self.total() == 0 {
            return;
        }

        info!("{}", format_block("Success", &self.success));
        if !self.no_cert.is_empty() {
            warn!("{}", format_block("No-cert", &self.no_cert));
        }
        if !self.expired.is_empty() {
            warn!("{}", format_block("Expired", &self.expired));
        }
        if !self.multi_cert.is_empty() {
            warn!("{}", format_block("Multi-certs", &self.multi_cert));
        }
    }
}

fn format_block(title: &str, entries: &[SummaryEntry]) -> String {
    if entries.is_empty() {
        return format!("{title}: (none)");
    }
    let mut out = format!("{title} ({}):", entries.len());
    for entry in entries {
        out.push_str("\n  - ");
        out.push_str(&entry.render());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::Certificate;
    use std::path::PathBuf;

    fn sorted(mut domains: Vec<&str>) -> Vec<&str> {
        domains.sort_by(|a, b| domain_order(a, b));
        domains
    }

    #[test]
    fn test_domain_order_tld_first() {
        assert_eq!(
            sorted(vec![
                "abc.def",
                "abc.az",
                "abc.abc.def",
                "aad.def",
                "abc.de",
                "abc.abc.de",
            ]),
            vec![
                "abc.az",
                "abc.de",
                "abc.abc.de",
                "aad.def",
                "abc.def",
                "abc.abc.def",
            ]
        );
    }

    #[test]
    fn test_domain_order_is_strict() {
        let domains = ["a.com", "b.a.com", "a.org", "com"];
        for a in domains {
            assert_eq!(domain_order(a, a), Ordering::Equal);
            for b in domains {
                if a != b {
                    assert_eq!(domain_order(a, b), domain_order(b, a).reverse());
                }
            }
        }
    }

    fn cert(not_after: i64) -> Certificate {
        Certificate {
            cert_path: PathBuf::from("/runtime/current/certs/x.cert.pem"),
            key_path: PathBuf::from("/runtime/current/certs/x.key.key"),
            not_after,
        }
    }

    #[test]
    fn test_buckets_and_order() {
        let mut ports = RoutingTable::new();
        ports.insert("1234".to_string(), vec!["a.com".to_string(), "b.a.com".to_string()]);
        ports.insert("5678".to_string(), vec!["b.com".to_string()]);
        ports.insert(
            "192.168.50.2:9000/api".to_string(),
            vec!["a.com/api".to_string()],
        );

        let mut active = CertMap::new();
        active.insert("a.com".to_string(), cert(2_000_000_000));
        active.insert("b.com".to_string(), cert(1)); // long expired

        let summary = DomainSummary::build(&ports, &active, &ScanReport::default(), 1_700_000_000);

        assert_eq!(summary.total(), 4);
        let success: Vec<String> = summary.success.iter().map(|e| e.render()).collect();
        assert_eq!(
            success,
            vec![
                "a.com -> http://127.0.0.1:1234",
                "a.com/api -> http://192.168.50.2:9000/api",
            ]
        );
        let no_cert: Vec<String> = summary.no_cert.iter().map(|e| e.render()).collect();
        assert_eq!(no_cert, vec!["b.a.com -> http://127.0.0.1:1234"]);
        let expired: Vec<String> = summary.expired.iter().map(|e| e.render()).collect();
        assert_eq!(expired, vec!["b.com -> http://127.0.0.1:5678"]);
    }

    #[test]
    fn test_duplicate_route_merges_targets() {
        let mut ports = RoutingTable::new();
        ports.insert("1111".to_string(), vec!["dup.com".to_string()]);
        ports.insert("2222".to_string(), vec!["dup.com".to_string()]);

        let summary =
            DomainSummary::build(&ports, &CertMap::new(), &ScanReport::default(), 0);
        assert_eq!(summary.no_cert.len(), 1);
        assert_eq!(
            summary.no_cert[0].render(),
            "dup.com -> http://127.0.0.1:1111, http://127.0.0.1:2222"
        );
    }

    #[test]
    fn test_multi_cert_bucket_limited_to_configured_hosts() {
        let mut ports = RoutingTable::new();
        ports.insert("1234".to_string(), vec!["multi.com".to_string()]);

        let mut active = CertMap::new();
        active.insert("multi.com".to_string(), cert(2_000_000_000));

        let mut report = ScanReport::default();
        report.multiple.insert(
            "multi.com".to_string(),
            crate::certs::MultiCertReport {
                candidates: vec![cert(2_000_000_000), cert(1_900_000_000)],
                selected: 0,
            },
        );
        // A multi-cert host that no route references stays out of the summary.
        report.multiple.insert(
            "unrelated.com".to_string(),
            crate::certs::MultiCertReport {
                candidates: vec![cert(10), cert(20)],
                selected: 1,
            },
        );

        let summary = DomainSummary::build(&ports, &active, &report, 1_700_000_000);
        assert_eq!(summary.success.len(), 1);
        let multi: Vec<&str> = summary.multi_cert.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(multi, vec!["multi.com"]);
    }

    #[test]
    fn test_format_block() {
        assert_eq!(format_block("Success", &[]), "Success: (none)");
        let entries = vec![SummaryEntry {
            host: "a.com".to_string(),
            path: String::new(),
            targets: vec!["http://127.0.0.1:1234".to_string()],
        }];
        assert_eq!(
            format_block("Success", &entries),
            "Success (1):\n  - a.com -> http://127.0.0.1:1234"
        );
    }
}
