//! Custom error types for cvegate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while evaluating scan results or patching an image.
#[derive(Error, Debug)]
pub enum CvegateError {
    #[error("[{0}] {1}")]
    AwsSdk(String, String),

    #[error("[{0}] AWS credentials error: {1}")]
    AwsCredentials(String, String),

    #[error("[{0}] AWS region not configured: {1}")]
    AwsRegion(String, String),

    #[error("Invalid image URI: {0}")]
    InvalidImageUri(String),

    #[error("Invalid severity: {0}")]
    InvalidSeverity(String),

    #[error("Vulnerability list is empty, refusing to save {0}")]
    EmptyVulnerabilityList(PathBuf),

    #[error("ECR scan failed for {image}: {description}")]
    ScanFailed { image: String, description: String },

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("Directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("Patch step '{step}' failed: {details}")]
    StepFailed { step: String, details: String },
}

/// Lower-cased fragments of SDK errors caused by missing or rejected credentials.
const CREDENTIAL_PATTERNS: &[&str] = &[
    "no credentials",
    "credentials not found",
    "expired token",
    "expiredtoken",
    "the security token included in the request is",
    "unrecognizedclient",
    "invalidclienttokenid",
    "signaturedoesnotmatch",
    "access denied",
    "accessdenied",
    "not authorized",
];

const REGION_PATTERNS: &[&str] = &["no region", "region not found", "missing region"];

impl CvegateError {
    /// Classify an AWS SDK error for `component` into credentials, region or generic failures.
    pub fn aws<E: std::fmt::Debug + std::fmt::Display>(component: &str, err: E) -> Self {
        let err_debug = format!("{:?}", err);
        let err_display = err.to_string();
        let haystack = format!("{} {}", err_display, err_debug).to_lowercase();
        let matches_any = |patterns: &[&str]| patterns.iter().any(|p| haystack.contains(p));

        let component = component.to_string();
        let details = Self::extract_error_details(&err_debug, &err_display);

        if matches_any(CREDENTIAL_PATTERNS) {
            CvegateError::AwsCredentials(component, details)
        } else if matches_any(REGION_PATTERNS) {
            CvegateError::AwsRegion(component, details)
        } else {
            CvegateError::AwsSdk(component, details)
        }
    }

    /// Extract a single-line message from an AWS SDK error.
    fn extract_error_details(debug_str: &str, display_str: &str) -> String {
        // Pattern: message: Some("actual error message")
        if let Some(pos) = debug_str.find("message: Some(\"") {
            let start = pos + "message: Some(\"".len();
            let rest = &debug_str[start..];
            if let Some(end) = rest.find('"') {
                return rest[..end].to_string();
            }
        }

        if !display_str.to_lowercase().contains("service error") {
            return display_str.to_string();
        }

        "AWS API request failed".to_string()
    }
}
