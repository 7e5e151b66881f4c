//! Scan findings as returned by ECR `DescribeImageScanFindings`.

use serde::{Deserialize, Serialize};

use crate::severity::CveSeverity;

/// Whole findings document, as written by `cvegate fetch` or the AWS CLI.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFindingsDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<ImageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_scan_status: Option<ImageScanStatus>,
    #[serde(default)]
    pub image_scan_findings: ImageScanFindings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanFindings {
    #[serde(default)]
    pub findings: Vec<BasicFinding>,
    #[serde(default)]
    pub enhanced_findings: Vec<EnhancedFinding>,
}

/// Basic scan finding. Basic allowlists store findings in this same shape.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct BasicFinding {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub severity: CveSeverity,
    #[serde(default)]
    pub attributes: Vec<FindingAttribute>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FindingAttribute {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl BasicFinding {
    /// Value of the attribute with the given key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attribute| attribute.key == key)
            .and_then(|attribute| attribute.value.as_deref())
    }

    pub fn package_name(&self) -> Option<&str> {
        self.attribute("package_name")
    }

    pub fn package_version(&self) -> Option<&str> {
        self.attribute("package_version")
    }
}

/// Enhanced (Inspector) scan finding.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedFinding {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub package_vulnerability_details: PackageVulnerabilityDetails,
    #[serde(default)]
    pub remediation: Remediation,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVulnerabilityDetails {
    #[serde(default)]
    pub vulnerability_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub cvss: Vec<CvssScore>,
    #[serde(default)]
    pub vulnerable_packages: Vec<VulnerablePackage>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CvssScore {
    #[serde(default)]
    pub base_score: f64,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_vector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerablePackage {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

/// Remediation advice. Allowlist records keep ECR's lower-case keys.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Remediation {
    #[serde(default)]
    pub recommendation: Option<Recommendation>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Recommendation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl PackageVulnerabilityDetails {
    /// Base score for the given CVSS version, 0.0 when absent.
    pub fn cvss_score(&self, version: &str) -> f64 {
        self.cvss
            .iter()
            .find(|score| score.version == version)
            .map(|score| score.base_score)
            .unwrap_or(0.0)
    }
}
