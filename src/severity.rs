//! CVE severity levels and CVSS v3 score mapping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CvegateError;

/// Severity of a vulnerability, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CveSeverity {
    /// Also used when no score is available.
    Undefined,
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl CveSeverity {
    /// All severities, ascending.
    pub const ALL: [CveSeverity; 6] = [
        CveSeverity::Undefined,
        CveSeverity::Informational,
        CveSeverity::Low,
        CveSeverity::Medium,
        CveSeverity::High,
        CveSeverity::Critical,
    ];

    /// Qualitative rating for a CVSS v3 base score (FIRST CVSS v3.1, section 5).
    pub fn from_cvss_v3(score: f64) -> Self {
        if score >= 9.0 {
            CveSeverity::Critical
        } else if score >= 7.0 {
            CveSeverity::High
        } else if score >= 4.0 {
            CveSeverity::Medium
        } else if score >= 0.1 {
            CveSeverity::Low
        } else {
            CveSeverity::Undefined
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CveSeverity::Undefined => "UNDEFINED",
            CveSeverity::Informational => "INFORMATIONAL",
            CveSeverity::Low => "LOW",
            CveSeverity::Medium => "MEDIUM",
            CveSeverity::High => "HIGH",
            CveSeverity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for CveSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CveSeverity {
    type Err = CvegateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CveSeverity::ALL
            .into_iter()
            .find(|severity| severity.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CvegateError::InvalidSeverity(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(CveSeverity::Critical > CveSeverity::High);
        assert!(CveSeverity::High > CveSeverity::Medium);
        assert!(CveSeverity::Low > CveSeverity::Informational);
        assert!(CveSeverity::Informational > CveSeverity::Undefined);
    }

    #[test]
    fn test_from_cvss_v3_boundaries() {
        assert_eq!(CveSeverity::from_cvss_v3(9.0), CveSeverity::Critical);
        assert_eq!(CveSeverity::from_cvss_v3(8.9), CveSeverity::High);
        assert_eq!(CveSeverity::from_cvss_v3(7.0), CveSeverity::High);
        assert_eq!(CveSeverity::from_cvss_v3(6.9), CveSeverity::Medium);
        assert_eq!(CveSeverity::from_cvss_v3(4.0), CveSeverity::Medium);
        assert_eq!(CveSeverity::from_cvss_v3(3.9), CveSeverity::Low);
        assert_eq!(CveSeverity::from_cvss_v3(0.1), CveSeverity::Low);
        assert_eq!(CveSeverity::from_cvss_v3(0.0), CveSeverity::Undefined);
    }

    #[test]
    fn test_from_str_case_insensitive() {
        assert_eq!("high".parse::<CveSeverity>().unwrap(), CveSeverity::High);
        assert_eq!("MEDIUM".parse::<CveSeverity>().unwrap(), CveSeverity::Medium);
        assert_eq!(" Critical ".parse::<CveSeverity>().unwrap(), CveSeverity::Critical);
        assert!("UNTRIAGED".parse::<CveSeverity>().is_err());
    }

    #[test]
    fn test_serde_uses_upper_case_names() {
        let json = serde_json::to_string(&CveSeverity::Informational).unwrap();
        assert_eq!(json, "\"INFORMATIONAL\"");
        let parsed: CveSeverity = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(parsed, CveSeverity::Low);
    }
}
