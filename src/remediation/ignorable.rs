//! OS packages whose remaining CVEs cannot be fixed by another apt upgrade.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scan::allowlist::EnhancedScanList;

const NOT_UPGRADABLE: &str = "Package and its binaries cannot be upgraded further.";

/// Output of `extract_apt_patch_data.py`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AptPatchEvaluation {
    /// Impacted package -> binaries apt can still upgrade.
    #[serde(default)]
    pub upgradable_packages_data_for_impacted_packages: BTreeMap<String, Vec<String>>,
}

impl AptPatchEvaluation {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read apt patch evaluation: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse apt patch evaluation: {}", path.display()))
    }

    fn upgradable_binaries(&self, package: &str) -> Option<&[String]> {
        self.upgradable_packages_data_for_impacted_packages
            .get(package)
            .map(Vec::as_slice)
    }
}

/// Packages with remaining vulnerabilities, split by package manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImpactedPackages {
    pub os: BTreeSet<String>,
    pub python: BTreeSet<String>,
}

impl ImpactedPackages {
    pub fn from_list(remaining: &EnhancedScanList) -> Self {
        let mut impacted = Self::default();
        for (package, records) in remaining.packages() {
            for record in records {
                if record.is_os_package() {
                    impacted.os.insert(package.clone());
                } else if record.is_python_package() {
                    impacted.python.insert(package.clone());
                }
            }
        }
        impacted
    }

    /// `--impacted-packages` argument for `extract_apt_patch_data.py`.
    pub fn os_argument(&self) -> String {
        self.os.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

/// Explain, per impacted OS package, why it can be ignored.
///
/// A package is ignorable when a fresh apt evaluation finds nothing left to
/// upgrade for it. When the evaluation embedded in the image lists binaries
/// for it, those were upgraded at patch time and are named in the message.
pub fn ignorable_packages(
    impacted: &ImpactedPackages,
    fresh: &AptPatchEvaluation,
    embedded: &AptPatchEvaluation,
) -> BTreeMap<String, String> {
    impacted
        .os
        .iter()
        .filter(|package| fresh.upgradable_binaries(package).is_none())
        .map(|package| {
            let message = match embedded.upgradable_binaries(package) {
                Some(binaries) => {
                    let mut binaries = binaries.to_vec();
                    binaries.sort();
                    format!("{} Packages: {} have been upgraded.", NOT_UPGRADABLE, binaries.join(","))
                }
                None => NOT_UPGRADABLE.to_string(),
            };
            (package.clone(), message)
        })
        .collect()
}
