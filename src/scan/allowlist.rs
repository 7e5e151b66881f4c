//! Package-keyed vulnerability lists and the set operations used to gate images.
//!
//! A [`VulnerabilityList`] is parameterised by its record format: basic ECR
//! scans keep findings as ECR returns them, enhanced scans keep
//! [`AllowlistVulnerability`] records. Both formats share the same operations:
//! severity filtering on insert, equivalence-based membership, difference and
//! union.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::finding::{BasicFinding, ScanFindingsDocument};
use super::to_indented_json;
use super::vulnerability::AllowlistVulnerability;
use crate::error::CvegateError;
use crate::severity::CveSeverity;

/// Package key used for basic findings without a `package_name` attribute.
pub const UNKNOWN_PACKAGE: &str = "unknown";

/// Record format of a vulnerability list.
pub trait AllowlistFormat {
    type Record: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned;

    /// Short label used in logs and tables.
    const LABEL: &'static str;

    fn package_name(record: &Self::Record) -> String;

    /// Severity compared against the list threshold.
    fn severity(record: &Self::Record) -> CveSeverity;

    /// Vulnerability identifier used for sorting.
    fn record_name(record: &Self::Record) -> &str;

    fn are_equivalent(first: &Self::Record, second: &Self::Record) -> bool;

    /// Records contained in a raw ECR findings document.
    fn records_from_findings(document: &ScanFindingsDocument) -> Vec<Self::Record>;
}

/// ECR basic scanning.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicScan;

/// ECR enhanced scanning.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnhancedScan;

impl AllowlistFormat for BasicScan {
    type Record = BasicFinding;

    const LABEL: &'static str = "basic";

    fn package_name(record: &BasicFinding) -> String {
        record
            .package_name()
            .unwrap_or(UNKNOWN_PACKAGE)
            .to_string()
    }

    fn severity(record: &BasicFinding) -> CveSeverity {
        record.severity
    }

    fn record_name(record: &BasicFinding) -> &str {
        &record.name
    }

    fn are_equivalent(first: &BasicFinding, second: &BasicFinding) -> bool {
        if (&first.name, first.severity) != (&second.name, second.severity) {
            return false;
        }
        // package_version may date from when the CVE was first allowlisted
        first
            .attributes
            .iter()
            .filter(|attribute| attribute.key != "package_version")
            .all(|attribute| second.attributes.contains(attribute))
    }

    fn records_from_findings(document: &ScanFindingsDocument) -> Vec<BasicFinding> {
        document.image_scan_findings.findings.clone()
    }
}

impl AllowlistFormat for EnhancedScan {
    type Record = AllowlistVulnerability;

    const LABEL: &'static str = "enhanced";

    fn package_name(record: &AllowlistVulnerability) -> String {
        record.package_name.clone()
    }

    fn severity(record: &AllowlistVulnerability) -> CveSeverity {
        record.cvss_v3_severity
    }

    fn record_name(record: &AllowlistVulnerability) -> &str {
        &record.name
    }

    fn are_equivalent(first: &AllowlistVulnerability, second: &AllowlistVulnerability) -> bool {
        first.is_equivalent(second)
    }

    fn records_from_findings(document: &ScanFindingsDocument) -> Vec<AllowlistVulnerability> {
        document
            .image_scan_findings
            .enhanced_findings
            .iter()
            .flat_map(AllowlistVulnerability::from_enhanced_finding)
            .collect()
    }
}

pub type BasicScanList = VulnerabilityList<BasicScan>;
pub type EnhancedScanList = VulnerabilityList<EnhancedScan>;

/// Vulnerabilities grouped by package name, all at or above `minimum_severity`.
pub struct VulnerabilityList<F: AllowlistFormat> {
    minimum_severity: CveSeverity,
    packages: BTreeMap<String, Vec<F::Record>>,
}

impl<F: AllowlistFormat> Clone for VulnerabilityList<F> {
    fn clone(&self) -> Self {
        Self {
            minimum_severity: self.minimum_severity,
            packages: self.packages.clone(),
        }
    }
}

impl<F: AllowlistFormat> fmt::Debug for VulnerabilityList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulnerabilityList")
            .field("format", &F::LABEL)
            .field("minimum_severity", &self.minimum_severity)
            .field("packages", &self.packages)
            .finish()
    }
}

impl<F: AllowlistFormat> VulnerabilityList<F> {
    pub fn new(minimum_severity: CveSeverity) -> Self {
        Self {
            minimum_severity,
            packages: BTreeMap::new(),
        }
    }

    /// Load an allowlist-format report file.
    pub fn from_file<P: AsRef<Path>>(path: P, minimum_severity: CveSeverity) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read vulnerability list: {}", path.display()))?;
        Self::from_json_str(&content, minimum_severity)
            .with_context(|| format!("Failed to parse vulnerability list: {}", path.display()))
    }

    /// Records stay under the report's own package keys.
    pub fn from_json_str(content: &str, minimum_severity: CveSeverity) -> Result<Self> {
        let report: BTreeMap<String, Vec<F::Record>> = serde_json::from_str(content)?;
        let mut list = Self::new(minimum_severity);
        for (package_name, records) in report {
            for record in records {
                list.insert(package_name.clone(), record);
            }
        }
        Ok(list)
    }

    /// Build from a raw ECR findings document. The stored list is sorted.
    pub fn from_scan_findings(document: &ScanFindingsDocument, minimum_severity: CveSeverity) -> Self {
        let mut list = Self::new(minimum_severity);
        list.extend_from_records(F::records_from_findings(document));
        list.packages = list.sorted();
        list
    }

    /// Add allowlist-format records, skipping those below the threshold.
    pub fn extend_from_records<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = F::Record>,
    {
        for record in records {
            self.insert(F::package_name(&record), record);
        }
    }

    fn insert(&mut self, package_name: String, record: F::Record) {
        if F::severity(&record) < self.minimum_severity {
            return;
        }
        self.packages.entry(package_name).or_default().push(record);
    }

    pub fn minimum_severity(&self) -> CveSeverity {
        self.minimum_severity
    }

    pub fn packages(&self) -> &BTreeMap<String, Vec<F::Record>> {
        &self.packages
    }

    pub fn get(&self, package_name: &str) -> Option<&[F::Record]> {
        self.packages.get(package_name).map(Vec::as_slice)
    }

    pub fn package_names(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Number of records across all packages.
    pub fn len(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    pub fn flattened(&self) -> Vec<&F::Record> {
        self.packages.values().flatten().collect()
    }

    /// Per package: duplicates removed and records sorted by name.
    /// Packages come out in key order.
    pub fn sorted(&self) -> BTreeMap<String, Vec<F::Record>> {
        self.packages
            .iter()
            .map(|(package_name, records)| {
                let mut unique = uniquify(records.iter().cloned());
                unique.sort_by(|a, b| F::record_name(a).cmp(F::record_name(b)));
                (package_name.clone(), unique)
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        to_indented_json(&self.sorted())
    }

    /// Write the sorted list. An empty list is an error.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if self.is_empty() {
            return Err(CvegateError::EmptyVulnerabilityList(path.to_path_buf()).into());
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write vulnerability list: {}", path.display()))
    }

    /// Whether an equivalent record is present under the same package.
    pub fn contains(&self, record: &F::Record) -> bool {
        self.packages
            .get(&F::package_name(record))
            .is_some_and(|records| records.iter().any(|stored| F::are_equivalent(record, stored)))
    }

    /// Equivalence of two lists. A missing or empty `other` matches only an empty list.
    pub fn equivalent_to(&self, other: Option<&Self>) -> bool {
        let other = match other {
            Some(other) if !other.is_empty() => other,
            _ => return self.is_empty(),
        };

        if !self.packages.keys().eq(other.packages.keys()) {
            return false;
        }

        let ours = self.sorted();
        let theirs = other.sorted();
        self.packages.iter().all(|(package_name, records)| {
            // lengths before dedupe, pairs after
            records.len() == other.packages[package_name].len()
                && ours[package_name]
                    .iter()
                    .zip(&theirs[package_name])
                    .all(|(a, b)| F::are_equivalent(a, b))
        })
    }

    /// Records of `self` not contained in `other`, or `None` when nothing remains.
    pub fn difference(&self, other: Option<&Self>) -> Option<Self> {
        if self.is_empty() {
            return None;
        }
        let other = match other {
            Some(other) if !other.is_empty() => other,
            _ => return Some(self.clone()),
        };

        let missing: Vec<F::Record> = self
            .flattened()
            .into_iter()
            .filter(|record| !other.contains(record))
            .cloned()
            .collect();
        if missing.is_empty() {
            return None;
        }

        let mut difference = Self::new(self.minimum_severity);
        difference.extend_from_records(missing);
        Some(difference)
    }

    /// Deduplicated records of both lists, or `None` when both are empty.
    pub fn union(&self, other: &Self) -> Option<Self> {
        let all = self
            .flattened()
            .into_iter()
            .chain(other.flattened())
            .cloned();
        let unique = uniquify(all);
        if unique.is_empty() {
            return None;
        }

        let mut union = Self::new(self.minimum_severity);
        union.extend_from_records(unique);
        Some(union)
    }

    pub fn severity_counts(&self) -> BTreeMap<CveSeverity, usize> {
        let mut counts = BTreeMap::new();
        for record in self.packages.values().flatten() {
            *counts.entry(F::severity(record)).or_insert(0) += 1;
        }
        counts
    }

    pub fn label(&self) -> &'static str {
        F::LABEL
    }
}

/// Drop exact duplicates, keeping first occurrences in order.
fn uniquify<T: PartialEq>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut unique: Vec<T> = Vec::new();
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::finding::{FindingAttribute, Remediation};
    use crate::scan::vulnerability::PackageDetails;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn basic(name: &str, severity: CveSeverity, package: &str, version: &str) -> BasicFinding {
        BasicFinding {
            name: name.to_string(),
            description: None,
            uri: Some(format!("https://cve.mitre.org/{}", name)),
            severity,
            attributes: vec![
                FindingAttribute {
                    key: "package_version".to_string(),
                    value: Some(version.to_string()),
                },
                FindingAttribute {
                    key: "package_name".to_string(),
                    value: Some(package.to_string()),
                },
            ],
        }
    }

    fn enhanced(id: &str, package: &str, score: f64) -> AllowlistVulnerability {
        AllowlistVulnerability {
            description: format!("{} in {}", id, package),
            vulnerability_id: id.to_string(),
            name: id.to_string(),
            package_name: package.to_string(),
            package_details: PackageDetails {
                file_path: None,
                name: package.to_string(),
                package_manager: Some("OS".to_string()),
                version: "1.0.0".to_string(),
                release: Some("1ubuntu1".to_string()),
            },
            remediation: Remediation::default(),
            cvss_v3_score: score,
            cvss_v30_score: 0.0,
            cvss_v2_score: 0.0,
            cvss_v3_severity: CveSeverity::from_cvss_v3(score),
            source_url: format!("https://ubuntu.com/security/{}", id),
            source: "UBUNTU_CVE".to_string(),
            severity: "MEDIUM".to_string(),
            status: "ACTIVE".to_string(),
            title: format!("{} - {}", id, package),
        }
    }

    fn enhanced_list(records: Vec<AllowlistVulnerability>) -> EnhancedScanList {
        let mut list = EnhancedScanList::new(CveSeverity::Medium);
        list.extend_from_records(records);
        list
    }

    #[test]
    fn test_extend_filters_below_threshold_without_empty_keys() {
        let list = enhanced_list(vec![
            enhanced("CVE-2023-0001", "linux", 7.8),
            enhanced("CVE-2023-0002", "openssl", 3.1),
        ]);

        assert_eq!(list.len(), 1);
        assert_eq!(list.package_names(), vec!["linux".to_string()]);
        assert!(list.get("openssl").is_none());
    }

    #[test]
    fn test_basic_filtering_uses_vendor_severity() {
        let mut list = BasicScanList::new(CveSeverity::High);
        list.extend_from_records(vec![
            basic("CVE-2021-1", CveSeverity::Critical, "glibc", "2.27"),
            basic("CVE-2021-2", CveSeverity::Medium, "glibc", "2.27"),
        ]);

        assert_eq!(list.len(), 1);
        assert_eq!(list.get("glibc").unwrap()[0].name, "CVE-2021-1");
    }

    #[test]
    fn test_basic_equivalence_ignores_package_version() {
        let allowed = basic("CVE-2021-3520", CveSeverity::Medium, "lz4", "1.8.1");
        let current = basic("CVE-2021-3520", CveSeverity::Medium, "lz4", "1.9.2");
        let other_package = basic("CVE-2021-3520", CveSeverity::Medium, "liblz4-1", "1.8.1");

        assert!(BasicScan::are_equivalent(&current, &allowed));
        assert!(!BasicScan::are_equivalent(&other_package, &allowed));
    }

    #[test]
    fn test_contains_matches_across_versions() {
        let list = enhanced_list(vec![enhanced("CVE-2023-0001", "linux", 7.8)]);
        let mut newer = enhanced("CVE-2023-0001", "linux", 7.8);
        newer.package_details.version = "1.0.1".to_string();

        assert!(list.contains(&newer));
        assert!(!list.contains(&enhanced("CVE-2023-0009", "linux", 7.8)));
    }

    #[test]
    fn test_difference_semantics() {
        let scan = enhanced_list(vec![
            enhanced("CVE-2023-0001", "linux", 7.8),
            enhanced("CVE-2023-0002", "linux", 9.1),
            enhanced("CVE-2023-0003", "curl", 5.5),
        ]);
        let allowlist = enhanced_list(vec![
            enhanced("CVE-2023-0001", "linux", 7.8),
            enhanced("CVE-2023-0003", "curl", 5.5),
        ]);

        let remaining = scan.difference(Some(&allowlist)).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.get("linux").unwrap()[0].name, "CVE-2023-0002");
        assert_eq!(remaining.minimum_severity(), CveSeverity::Medium);

        assert!(allowlist.difference(Some(&scan)).is_none());
        assert_eq!(scan.difference(None).unwrap().len(), 3);
        assert!(EnhancedScanList::new(CveSeverity::Medium)
            .difference(Some(&scan))
            .is_none());
    }

    #[test]
    fn test_union_deduplicates() {
        let first = enhanced_list(vec![
            enhanced("CVE-2023-0001", "linux", 7.8),
            enhanced("CVE-2023-0002", "linux", 9.1),
        ]);
        let second = enhanced_list(vec![
            enhanced("CVE-2023-0002", "linux", 9.1),
            enhanced("CVE-2023-0003", "curl", 5.5),
        ]);

        let union = first.union(&second).unwrap();
        assert_eq!(union.len(), 3);
        assert_eq!(union.package_names(), vec!["curl".to_string(), "linux".to_string()]);

        let empty = EnhancedScanList::new(CveSeverity::Medium);
        assert!(empty.union(&empty).is_none());
    }

    #[test]
    fn test_sorted_dedupes_and_orders_by_name() {
        let list = enhanced_list(vec![
            enhanced("CVE-2023-0009", "linux", 7.8),
            enhanced("CVE-2023-0001", "linux", 7.8),
            enhanced("CVE-2023-0009", "linux", 7.8),
        ]);

        let sorted = list.sorted();
        let names: Vec<&str> = sorted["linux"].iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["CVE-2023-0001", "CVE-2023-0009"]);
        // stored list untouched
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_equivalent_to() {
        let first = enhanced_list(vec![enhanced("CVE-2023-0001", "linux", 7.8)]);
        let mut bumped = enhanced("CVE-2023-0001", "linux", 7.8);
        bumped.package_details.version = "2.0.0".to_string();
        let second = enhanced_list(vec![bumped]);
        let empty = EnhancedScanList::new(CveSeverity::Medium);

        assert!(first.equivalent_to(Some(&second)));
        assert!(!first.equivalent_to(None));
        assert!(empty.equivalent_to(None));
        assert!(empty.equivalent_to(Some(&EnhancedScanList::new(CveSeverity::High))));
        assert!(!first.equivalent_to(Some(&enhanced_list(vec![enhanced(
            "CVE-2023-0002",
            "linux",
            7.8
        )]))));
    }

    #[test]
    fn test_save_empty_list_fails() {
        let empty = EnhancedScanList::new(CveSeverity::Medium);
        let file = NamedTempFile::new().unwrap();

        let err = empty.save(file.path()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_save_and_reload() {
        let list = enhanced_list(vec![
            enhanced("CVE-2023-0002", "linux", 9.1),
            enhanced("CVE-2023-0003", "curl", 5.5),
        ]);
        let file = NamedTempFile::new().unwrap();
        list.save(file.path()).unwrap();

        let content = fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with("{\n    \"curl\""));

        let reloaded = EnhancedScanList::from_file(file.path(), CveSeverity::High).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get("linux").is_some());
    }

    #[test]
    fn test_basic_report_keeps_top_level_keys() {
        let mut unattributed = basic("CVE-2022-0778", CveSeverity::High, "openssl", "1.1.1f");
        unattributed.attributes.retain(|attribute| attribute.key != "package_name");
        let low = basic("CVE-2022-0001", CveSeverity::Low, "openssl", "1.1.1f");
        let report = serde_json::json!({ "openssl": [unattributed, low] }).to_string();

        let list = BasicScanList::from_json_str(&report, CveSeverity::Medium).unwrap();
        assert_eq!(list.package_names(), vec!["openssl"]);
        assert_eq!(list.len(), 1);

        let file = NamedTempFile::new().unwrap();
        list.save(file.path()).unwrap();
        let reloaded = BasicScanList::from_file(file.path(), CveSeverity::Medium).unwrap();
        assert_eq!(reloaded.package_names(), vec!["openssl"]);
    }

    #[test]
    fn test_from_file_rejects_malformed_report() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"linux": [{"name": "CVE-1"}]}"#).unwrap();

        assert!(EnhancedScanList::from_file(file.path(), CveSeverity::Medium).is_err());
    }

    #[test]
    fn test_severity_counts() {
        let list = enhanced_list(vec![
            enhanced("CVE-2023-0001", "linux", 7.8),
            enhanced("CVE-2023-0002", "linux", 9.1),
            enhanced("CVE-2023-0003", "curl", 7.0),
        ]);

        let counts = list.severity_counts();
        assert_eq!(counts[&CveSeverity::High], 2);
        assert_eq!(counts[&CveSeverity::Critical], 1);
        assert!(!counts.contains_key(&CveSeverity::Medium));
    }
}
