//! ECR image URI parsing and the naming rules derived from it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use semver::{Version, VersionReq};

use crate::error::CvegateError;
use crate::severity::CveSeverity;

/// Frameworks recognised in repository names, checked in order.
const FRAMEWORKS: &[&str] = &[
    "pytorch",
    "tensorflow",
    "mxnet",
    "autogluon",
    "stabilityai",
    "djl",
];

/// Processor tokens that can appear in an image tag.
const PROCESSORS: &[&str] = &["cpu", "gpu", "eia", "neuronx", "neuron", "inf", "hpu"];

/// Images whose allowlists are compared at MEDIUM instead of HIGH.
const ALLOWLIST_FEATURE_IMAGES: &[(&str, &str)] = &[("mxnet", ">=1.8.0, <1.9.0")];

/// `<account>.dkr.ecr.<region>.amazonaws.com/<repository>:<tag>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUri {
    pub account_id: String,
    pub region: String,
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl FromStr for ImageUri {
    type Err = CvegateError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let invalid = || CvegateError::InvalidImageUri(uri.to_string());

        let (registry, rest) = uri.split_once('/').ok_or_else(invalid)?;
        let (repository, tag) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if repository.is_empty() || tag.is_empty() {
            return Err(invalid());
        }

        let parts: Vec<&str> = registry.split('.').collect();
        if parts.len() < 6 || parts[1] != "dkr" || parts[2] != "ecr" || parts[4] != "amazonaws" {
            return Err(invalid());
        }

        Ok(Self {
            account_id: parts[0].to_string(),
            region: parts[3].to_string(),
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl ImageUri {
    /// URI with `.`, `/` and `:` replaced by `-`, usable as a file name.
    pub fn processed_name(&self) -> String {
        self.to_string().replace(['.', '/', ':'], "-")
    }

    /// Same image pushed to another repository. The new tag keeps the old
    /// repository and tag so the origin stays recognisable.
    pub fn retarget(
        &self,
        account_id: &str,
        region: &str,
        repository: &str,
        append_tag: Option<&str>,
    ) -> ImageUri {
        let mut tag = match append_tag {
            Some(suffix) if !suffix.is_empty() => {
                format!("{}-{}-{}", self.repository, self.tag, suffix)
            }
            _ => format!("{}-{}", self.repository, self.tag),
        };

        // Hugging Face Neuron tags exceed docker's 128 character limit otherwise
        if self.contains("huggingface") && self.contains("neuron") {
            tag = tag
                .replace("-huggingface-", "-hf-")
                .replace("-pytorch-", "-pt-")
                .replace("-tensorflow-", "-tf-");
        }

        ImageUri {
            account_id: account_id.to_string(),
            region: region.to_string(),
            registry: format!("{}.dkr.ecr.{}.amazonaws.com", account_id, region),
            repository: repository.to_string(),
            tag,
        }
    }

    fn contains(&self, needle: &str) -> bool {
        self.repository.contains(needle) || self.tag.contains(needle)
    }

    pub fn is_example(&self) -> bool {
        self.contains("example")
    }

    /// Framework from the repository name and version from the leading tag token.
    pub fn framework_and_version(&self) -> Option<(&'static str, String)> {
        let framework = FRAMEWORKS
            .iter()
            .copied()
            .find(|framework| self.repository.contains(framework))?;
        let version = self.tag.split('-').next()?;
        if !version.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        Some((framework, version.to_string()))
    }

    /// Processor type encoded in the tag, e.g. `cpu` or `gpu`.
    pub fn processor(&self) -> Option<&'static str> {
        self.tag
            .split('-')
            .find_map(|token| PROCESSORS.iter().copied().find(|p| *p == token))
    }

    /// Whether the image is compared against its allowlist at MEDIUM.
    pub fn is_covered_by_allowlist_feature(&self) -> bool {
        if self.is_example() {
            return false;
        }
        let Some((framework, version)) = self.framework_and_version() else {
            return false;
        };
        let Some(version) = parse_loose_version(&version) else {
            return false;
        };

        ALLOWLIST_FEATURE_IMAGES
            .iter()
            .filter(|(name, _)| *name == framework)
            .filter_map(|(_, requirement)| VersionReq::parse(requirement).ok())
            .any(|requirement| requirement.matches(&version))
    }
}

/// Severity above which remaining vulnerabilities fail the image.
pub fn minimum_severity_threshold(image: &ImageUri, generic_image: bool) -> CveSeverity {
    if generic_image {
        return CveSeverity::High;
    }
    if image.is_covered_by_allowlist_feature() {
        return CveSeverity::Medium;
    }
    CveSeverity::High
}

/// OS scan allowlist committed next to the image's Dockerfile.
pub fn os_scan_allowlist_path(dockerfile: &Path, image: &ImageUri) -> PathBuf {
    let suffix = if image.is_example() {
        ".example.os_scan_allowlist.json"
    } else {
        ".os_scan_allowlist.json"
    };
    let mut path = dockerfile.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Python package allowlist that sits beside the OS scan allowlist.
pub fn py_scan_allowlist_path(dockerfile: &Path, image: &ImageUri) -> PathBuf {
    let os_path = os_scan_allowlist_path(dockerfile, image);
    PathBuf::from(os_path.to_string_lossy().replace(".os_", ".py_"))
}

/// Pads `1.8` to `1.8.0` so framework versions parse as semver.
fn parse_loose_version(version: &str) -> Option<Version> {
    let mut parts: Vec<&str> = version.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts[..3].join(".")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTORCH: &str =
        "123456789012.dkr.ecr.us-west-2.amazonaws.com/pr-pytorch-training:1.8.1-cpu-py36-ubuntu18.04";

    #[test]
    fn test_parse_image_uri() {
        let image: ImageUri = PYTORCH.parse().unwrap();

        assert_eq!(image.account_id, "123456789012");
        assert_eq!(image.region, "us-west-2");
        assert_eq!(image.repository, "pr-pytorch-training");
        assert_eq!(image.tag, "1.8.1-cpu-py36-ubuntu18.04");
        assert_eq!(image.to_string(), PYTORCH);
    }

    #[test]
    fn test_parse_rejects_non_ecr_uris() {
        assert!("pytorch:latest".parse::<ImageUri>().is_err());
        assert!("docker.io/library/ubuntu:22.04".parse::<ImageUri>().is_err());
        assert!("123.dkr.ecr.us-west-2.amazonaws.com/repo".parse::<ImageUri>().is_err());
    }

    #[test]
    fn test_processed_name() {
        let image: ImageUri = PYTORCH.parse().unwrap();
        assert_eq!(
            image.processed_name(),
            "123456789012-dkr-ecr-us-west-2-amazonaws-com-pr-pytorch-training-1-8-1-cpu-py36-ubuntu18-04"
        );
    }

    #[test]
    fn test_retarget_appends_tag() {
        let image: ImageUri = PYTORCH.parse().unwrap();
        let target = image.retarget("999999999999", "us-east-1", "ecr-enhanced-scanning", Some("ENHSCAN"));

        assert_eq!(
            target.to_string(),
            "999999999999.dkr.ecr.us-east-1.amazonaws.com/ecr-enhanced-scanning:pr-pytorch-training-1.8.1-cpu-py36-ubuntu18.04-ENHSCAN"
        );
    }

    #[test]
    fn test_retarget_shortens_huggingface_neuron_tags() {
        let image: ImageUri = "123456789012.dkr.ecr.us-west-2.amazonaws.com/beta-huggingface-pytorch-inference-neuron:1.10.2-transformers4.20.1-neuron-py37-sdk1.19.1-ubuntu18.04"
            .parse()
            .unwrap();
        let target = image.retarget("123456789012", "us-west-2", "upgraded", None);

        assert!(target.tag.starts_with("beta-hf-pt-inference-neuron-1.10.2"));
    }

    #[test]
    fn test_framework_version_and_processor() {
        let image: ImageUri = PYTORCH.parse().unwrap();
        assert_eq!(image.framework_and_version(), Some(("pytorch", "1.8.1".to_string())));
        assert_eq!(image.processor(), Some("cpu"));

        let gpu: ImageUri = "1.dkr.ecr.us-west-2.amazonaws.com/tensorflow-training:2.4-gpu-py37"
            .parse()
            .unwrap();
        assert_eq!(gpu.processor(), Some("gpu"));
    }

    #[test]
    fn test_minimum_severity_threshold() {
        let mxnet: ImageUri =
            "1.dkr.ecr.us-west-2.amazonaws.com/pr-mxnet-training:1.8.0-cpu-py37-ubuntu16.04"
                .parse()
                .unwrap();
        let mxnet_19: ImageUri = "1.dkr.ecr.us-west-2.amazonaws.com/pr-mxnet-training:1.9.0-cpu-py38"
            .parse()
            .unwrap();
        let example: ImageUri =
            "1.dkr.ecr.us-west-2.amazonaws.com/pr-mxnet-training:1.8.0-gpu-py37-example"
                .parse()
                .unwrap();

        assert_eq!(minimum_severity_threshold(&mxnet, false), CveSeverity::Medium);
        assert_eq!(minimum_severity_threshold(&mxnet, true), CveSeverity::High);
        assert_eq!(minimum_severity_threshold(&mxnet_19, false), CveSeverity::High);
        assert_eq!(minimum_severity_threshold(&example, false), CveSeverity::High);
    }

    #[test]
    fn test_allowlist_paths() {
        let dockerfile = Path::new("pytorch/training/docker/1.8/py3/Dockerfile.cpu");
        let image: ImageUri = PYTORCH.parse().unwrap();

        assert_eq!(
            os_scan_allowlist_path(dockerfile, &image),
            PathBuf::from("pytorch/training/docker/1.8/py3/Dockerfile.cpu.os_scan_allowlist.json")
        );
        assert_eq!(
            py_scan_allowlist_path(dockerfile, &image),
            PathBuf::from("pytorch/training/docker/1.8/py3/Dockerfile.cpu.py_scan_allowlist.json")
        );

        let example: ImageUri =
            "1.dkr.ecr.us-west-2.amazonaws.com/pr-pytorch-training:1.8.1-gpu-example"
                .parse()
                .unwrap();
        assert!(os_scan_allowlist_path(dockerfile, &example)
            .to_string_lossy()
            .ends_with("Dockerfile.cpu.example.os_scan_allowlist.json"));
    }

    #[test]
    fn test_parse_loose_version() {
        assert_eq!(parse_loose_version("1.8"), Some(Version::new(1, 8, 0)));
        assert_eq!(parse_loose_version("2.13.1"), Some(Version::new(2, 13, 1)));
        assert_eq!(parse_loose_version("latest"), None);
    }
}
