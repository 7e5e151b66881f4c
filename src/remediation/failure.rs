//! Failure routine for images whose scan shows vulnerabilities the allowlist does not cover.
//!
//! Three lists go in: the committed allowlist, the scan of the released
//! image, and the scan of the same image after `apt-get upgrade`. Out come
//! the files needed to refresh the allowlist and the apt upgrade list.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::image::{ImageUri, os_scan_allowlist_path};
use crate::scan::allowlist::{AllowlistFormat, VulnerabilityList};
use crate::scan::write_json;

/// ECR package names that apt knows under another name.
const APT_NAME_OVERRIDES: &[(&str, &str)] = &[
    ("cyrus-sasl2", "libsasl2-2"),
    ("glibc", "libc6"),
    ("libopenmpt", "libopenmpt-dev"),
    ("fribidi", "libfribidi-dev"),
];

/// A generated file and the repository file it replaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditedFile {
    pub output_file: PathBuf,
    pub repository_path: PathBuf,
}

/// Result of a failure routine run.
#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary<R> {
    pub image: String,
    pub generated_at: DateTime<Utc>,
    pub edited_files: Vec<EditedFile>,
    pub fixable_vulnerabilities: BTreeMap<String, Vec<R>>,
    pub non_fixable_vulnerabilities: BTreeMap<String, Vec<R>>,
    pub apt_upgrade_packages: Vec<String>,
    /// Every file written, in write order.
    pub output_files: Vec<PathBuf>,
}

impl<R> FailureSummary<R> {
    pub fn fixable_count(&self) -> usize {
        self.fixable_vulnerabilities.values().map(Vec::len).sum()
    }

    pub fn non_fixable_count(&self) -> usize {
        self.non_fixable_vulnerabilities.values().map(Vec::len).sum()
    }
}

/// Vulnerabilities that disappear once the image is upgraded, from both the
/// current scan and the allowlist.
pub fn fixable_by_upgrade<F: AllowlistFormat>(
    allowlist: &VulnerabilityList<F>,
    current: &VulnerabilityList<F>,
    upgraded: &VulnerabilityList<F>,
) -> Option<VulnerabilityList<F>> {
    let from_current = current.difference(Some(upgraded));
    let from_allowlist = allowlist.difference(Some(upgraded));

    match (from_current, from_allowlist) {
        (Some(current), Some(allowlist)) => current.union(&allowlist),
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}

/// Vulnerabilities that survive the upgrade and are not allowlisted yet.
pub fn non_fixable<F: AllowlistFormat>(
    allowlist: &VulnerabilityList<F>,
    upgraded: &VulnerabilityList<F>,
) -> Option<VulnerabilityList<F>> {
    upgraded.difference(Some(allowlist))
}

pub fn apt_package_name(ecr_package_name: &str) -> &str {
    APT_NAME_OVERRIDES
        .iter()
        .find(|(ecr, _)| *ecr == ecr_package_name)
        .map(|(_, apt)| *apt)
        .unwrap_or(ecr_package_name)
}

/// Union of an existing apt upgrade list (one package per line) and new ECR
/// package names, sorted.
pub fn merge_apt_upgrade_list<'a, I>(existing: &str, new_packages: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut packages: BTreeSet<String> = existing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    packages.extend(
        new_packages
            .into_iter()
            .map(|name| apt_package_name(name).to_string()),
    );
    packages.into_iter().collect()
}

/// Write every failure routine artifact for `image` into `output_dir`.
///
/// Files are named after [`ImageUri::processed_name`]. The apt upgrade list
/// next to `dockerfile` is merged with the fixable packages; a missing list
/// counts as empty.
pub fn run_failure_routine<F: AllowlistFormat>(
    image: &ImageUri,
    dockerfile: &Path,
    allowlist: &VulnerabilityList<F>,
    current: &VulnerabilityList<F>,
    upgraded: &VulnerabilityList<F>,
    output_dir: &Path,
) -> Result<FailureSummary<F::Record>> {
    let processor = image
        .processor()
        .ok_or_else(|| anyhow!("Cannot determine processor from image tag '{}'", image.tag))?;

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let processed = image.processed_name();
    let output_path = |suffix: &str| output_dir.join(format!("{}-{}", processed, suffix));
    let mut output_files = Vec::new();

    let repository_allowlist = os_scan_allowlist_path(dockerfile, image);
    let allowlist_file = output_path("allowlist.json");
    write_json(&allowlist_file, &upgraded.sorted())?;
    output_files.push(allowlist_file.clone());

    let current_file = output_path("current-ecr-scanlist.json");
    write_json(&current_file, &current.sorted())?;
    output_files.push(current_file);

    let fixable = fixable_by_upgrade(allowlist, current, upgraded);
    let non_fixable = non_fixable(allowlist, upgraded);

    let apt_list_name = format!("apt-upgrade-list-{}.txt", processor);
    let repository_apt_list = repository_allowlist
        .parent()
        .map(|dir| dir.join(&apt_list_name))
        .unwrap_or_else(|| PathBuf::from(&apt_list_name));
    let existing = read_apt_upgrade_list(&repository_apt_list)?;
    let fixable_packages = fixable
        .as_ref()
        .map(VulnerabilityList::package_names)
        .unwrap_or_default();
    let apt_upgrade_packages =
        merge_apt_upgrade_list(&existing, fixable_packages.iter().map(String::as_str));

    let apt_file = output_path(&apt_list_name);
    let content: String = apt_upgrade_packages
        .iter()
        .map(|package| format!("{}\n", package))
        .collect();
    fs::write(&apt_file, content)
        .with_context(|| format!("Failed to write apt upgrade list: {}", apt_file.display()))?;
    output_files.push(apt_file.clone());

    let fixable_vulnerabilities = fixable.map(|list| list.sorted()).unwrap_or_default();
    let non_fixable_vulnerabilities = non_fixable.map(|list| list.sorted()).unwrap_or_default();

    let fixable_file = output_path("fixable-vulnerability-list.json");
    write_json(&fixable_file, &fixable_vulnerabilities)?;
    output_files.push(fixable_file);

    let non_fixable_file = output_path("non-fixable-vulnerability-list.json");
    write_json(&non_fixable_file, &non_fixable_vulnerabilities)?;
    output_files.push(non_fixable_file);

    let summary = FailureSummary {
        image: image.to_string(),
        generated_at: Utc::now(),
        edited_files: vec![
            EditedFile {
                output_file: allowlist_file,
                repository_path: repository_allowlist,
            },
            EditedFile {
                output_file: apt_file,
                repository_path: repository_apt_list,
            },
        ],
        fixable_vulnerabilities,
        non_fixable_vulnerabilities,
        apt_upgrade_packages,
        output_files,
    };

    info!(
        image = %image,
        format = F::LABEL,
        fixable = summary.fixable_count(),
        non_fixable = summary.non_fixable_count(),
        apt_packages = summary.apt_upgrade_packages.len(),
        "Failure routine completed"
    );

    Ok(summary)
}

fn read_apt_upgrade_list(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "No apt upgrade list found, starting from empty");
            Ok(String::new())
        }
        Err(e) => Err(e)
            .with_context(|| format!("Failed to read apt upgrade list: {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::allowlist::BasicScanList;
    use crate::scan::finding::{BasicFinding, FindingAttribute};
    use crate::severity::CveSeverity;
    use tempfile::TempDir;

    fn basic(name: &str, package: &str) -> BasicFinding {
        BasicFinding {
            name: name.to_string(),
            description: None,
            uri: None,
            severity: CveSeverity::High,
            attributes: vec![
                FindingAttribute {
                    key: "package_version".to_string(),
                    value: Some("1.0".to_string()),
                },
                FindingAttribute {
                    key: "package_name".to_string(),
                    value: Some(package.to_string()),
                },
            ],
        }
    }

    fn list(records: Vec<BasicFinding>) -> BasicScanList {
        let mut list = BasicScanList::new(CveSeverity::Medium);
        list.extend_from_records(records);
        list
    }

    fn image() -> ImageUri {
        "123456789012.dkr.ecr.us-west-2.amazonaws.com/pr-pytorch-training:1.8.1-gpu-py36-cu111-ubuntu18.04"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_apt_package_name() {
        assert_eq!(apt_package_name("glibc"), "libc6");
        assert_eq!(apt_package_name("cyrus-sasl2"), "libsasl2-2");
        assert_eq!(apt_package_name("openssl"), "openssl");
    }

    #[test]
    fn test_merge_apt_upgrade_list() {
        let merged = merge_apt_upgrade_list("openssl\n\nlibc6\n", ["glibc", "curl", "fribidi"]);
        assert_eq!(merged, vec!["curl", "libc6", "libfribidi-dev", "openssl"]);
    }

    #[test]
    fn test_fixable_by_upgrade_combines_both_sides() {
        let allowlist = list(vec![basic("CVE-1", "glibc"), basic("CVE-2", "curl")]);
        let current = list(vec![basic("CVE-2", "curl"), basic("CVE-3", "openssl")]);
        let upgraded = list(vec![basic("CVE-2", "curl")]);

        let fixable = fixable_by_upgrade(&allowlist, &current, &upgraded).unwrap();
        let mut names: Vec<&str> = fixable.flattened().into_iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["CVE-1", "CVE-3"]);
    }

    #[test]
    fn test_fixable_by_upgrade_none_when_nothing_fixed() {
        let allowlist = list(vec![basic("CVE-2", "curl")]);
        let upgraded = list(vec![basic("CVE-2", "curl")]);

        assert!(fixable_by_upgrade(&allowlist, &upgraded, &upgraded).is_none());
    }

    #[test]
    fn test_non_fixable() {
        let allowlist = list(vec![basic("CVE-1", "glibc")]);
        let upgraded = list(vec![basic("CVE-1", "glibc"), basic("CVE-9", "tar")]);

        let remaining = non_fixable(&allowlist, &upgraded).unwrap();
        assert_eq!(remaining.package_names(), vec!["tar".to_string()]);
    }

    #[test]
    fn test_run_failure_routine_writes_all_files() {
        let repo = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let dockerfile = repo.path().join("Dockerfile.gpu");
        fs::write(repo.path().join("apt-upgrade-list-gpu.txt"), "zlib1g\n").unwrap();

        let allowlist = list(vec![basic("CVE-1", "glibc")]);
        let current = list(vec![basic("CVE-1", "glibc"), basic("CVE-4", "tar")]);
        let upgraded = list(vec![basic("CVE-4", "tar")]);

        let summary = run_failure_routine(
            &image(),
            &dockerfile,
            &allowlist,
            &current,
            &upgraded,
            output.path(),
        )
        .unwrap();

        assert_eq!(summary.output_files.len(), 5);
        assert!(summary.output_files.iter().all(|path| path.exists()));
        assert_eq!(summary.apt_upgrade_packages, vec!["libc6", "zlib1g"]);
        assert_eq!(summary.fixable_count(), 1);
        assert_eq!(summary.non_fixable_count(), 1);
        assert_eq!(
            summary.edited_files[0].repository_path,
            repo.path().join("Dockerfile.gpu.os_scan_allowlist.json")
        );

        let apt_file = &summary.edited_files[1].output_file;
        assert!(apt_file.to_string_lossy().ends_with("-apt-upgrade-list-gpu.txt"));
        assert_eq!(fs::read_to_string(apt_file).unwrap(), "libc6\nzlib1g\n");
    }

    #[test]
    fn test_run_failure_routine_writes_empty_lists() {
        let repo = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let same = list(vec![basic("CVE-1", "glibc")]);

        let summary = run_failure_routine(
            &image(),
            &repo.path().join("Dockerfile.gpu"),
            &same,
            &same,
            &same,
            output.path(),
        )
        .unwrap();

        assert!(summary.fixable_vulnerabilities.is_empty());
        let fixable_file = summary
            .output_files
            .iter()
            .find(|path| path.to_string_lossy().ends_with("-fixable-vulnerability-list.json"))
            .unwrap();
        assert_eq!(fs::read_to_string(fixable_file).unwrap(), "{}");
    }

    #[test]
    fn test_run_failure_routine_requires_processor() {
        let output = TempDir::new().unwrap();
        let image: ImageUri = "1.dkr.ecr.us-west-2.amazonaws.com/repo:latest".parse().unwrap();
        let empty = BasicScanList::new(CveSeverity::Medium);

        let result = run_failure_routine(
            &image,
            Path::new("Dockerfile"),
            &empty,
            &empty,
            &empty,
            output.path(),
        );
        assert!(result.is_err());
    }
}
