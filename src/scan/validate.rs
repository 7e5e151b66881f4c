//! Schema checks for allowlist-format CVE reports.
//!
//! Works on untyped JSON so that every problem in a report is reported at
//! once instead of failing on the first field serde rejects.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::severity::CveSeverity;

const REQUIRED_STRING_FIELDS: &[&str] = &[
    "description",
    "vulnerability_id",
    "name",
    "package_name",
    "source_url",
    "source",
    "severity",
    "status",
    "title",
];

const SCORE_FIELDS: &[&str] = &["cvss_v3_score", "cvss_v30_score", "cvss_v2_score"];

/// A single problem found in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub package: String,
    /// Position of the record in its package list; `None` for package-level issues.
    pub index: Option<usize>,
    pub field: String,
    pub message: String,
}

/// Outcome of validating a whole report.
#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub packages: usize,
    pub records: usize,
    pub severity_counts: BTreeMap<CveSeverity, usize>,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    fn push(&mut self, package: &str, index: Option<usize>, field: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            package: package.to_string(),
            index,
            field: field.to_string(),
            message: message.into(),
        });
    }
}

/// Validate a parsed report.
pub fn validate_report(report: &Value) -> ValidationReport {
    let mut result = ValidationReport::default();

    let Some(packages) = report.as_object() else {
        result.push("", None, "", "report must be an object keyed by package name");
        return result;
    };

    result.packages = packages.len();

    for (package, records) in packages {
        let Some(records) = records.as_array() else {
            result.push(package, None, "", "package entry must be a list of records");
            continue;
        };

        for (index, record) in records.iter().enumerate() {
            result.records += 1;
            match record.as_object() {
                Some(record) => validate_record(&mut result, package, index, record),
                None => result.push(package, Some(index), "", "record must be an object"),
            }
        }
    }

    result
}

fn validate_record(result: &mut ValidationReport, package: &str, index: usize, record: &Map<String, Value>) {
    let at = Some(index);

    for field in REQUIRED_STRING_FIELDS {
        match record.get(*field) {
            None => result.push(package, at, field, "missing required field"),
            Some(Value::String(_)) => {}
            Some(_) => result.push(package, at, field, "must be a string"),
        }
    }

    let mut v3_score = None;
    for field in SCORE_FIELDS {
        match record.get(*field) {
            None => result.push(package, at, field, "missing required field"),
            Some(Value::Number(number)) => {
                let score = number.as_f64().unwrap_or(-1.0);
                if !(0.0..=10.0).contains(&score) {
                    result.push(package, at, field, format!("score {} outside 0.0..=10.0", number));
                } else if *field == "cvss_v3_score" {
                    v3_score = Some(score);
                }
            }
            Some(_) => result.push(package, at, field, "must be numeric"),
        }
    }

    match record.get("cvss_v3_severity") {
        None => result.push(package, at, "cvss_v3_severity", "missing required field"),
        Some(Value::String(text)) => match text.parse::<CveSeverity>() {
            Ok(severity) if text != severity.as_str() => result.push(
                package,
                at,
                "cvss_v3_severity",
                format!("'{}' must be upper case ({})", text, severity),
            ),
            Ok(severity) => {
                *result.severity_counts.entry(severity).or_insert(0) += 1;
                if let Some(score) = v3_score {
                    let expected = CveSeverity::from_cvss_v3(score);
                    if expected != severity {
                        result.push(
                            package,
                            at,
                            "cvss_v3_severity",
                            format!("{} does not match cvss_v3_score {} (expected {})", severity, score, expected),
                        );
                    }
                }
            }
            Err(_) => result.push(package, at, "cvss_v3_severity", format!("unknown severity '{}'", text)),
        },
        Some(_) => result.push(package, at, "cvss_v3_severity", "must be a string"),
    }

    if let Some(Value::String(package_name)) = record.get("package_name") {
        if package_name != package {
            result.push(
                package,
                at,
                "package_name",
                format!("'{}' does not match report key '{}'", package_name, package),
            );
        }
    }

    if let (Some(Value::String(name)), Some(Value::String(id))) =
        (record.get("name"), record.get("vulnerability_id"))
    {
        if name != id {
            result.push(package, at, "name", format!("'{}' differs from vulnerability_id '{}'", name, id));
        }
    }

    match record.get("package_details") {
        None => result.push(package, at, "package_details", "missing required field"),
        Some(Value::Object(details)) => {
            for field in ["name", "version"] {
                if !matches!(details.get(field), Some(Value::String(_))) {
                    result.push(package, at, &format!("package_details.{}", field), "missing or not a string");
                }
            }
            if let (Some(Value::String(details_name)), Some(Value::String(package_name))) =
                (details.get("name"), record.get("package_name"))
            {
                if details_name != package_name {
                    result.push(
                        package,
                        at,
                        "package_details.name",
                        format!("'{}' does not match package_name '{}'", details_name, package_name),
                    );
                }
            }
        }
        Some(_) => result.push(package, at, "package_details", "must be an object"),
    }

    match record.get("remediation") {
        None | Some(Value::Object(_)) => {}
        Some(_) => result.push(package, at, "remediation", "must be an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_record() -> Value {
        json!({
            "description": "A use-after-free flaw was found in the Linux kernel.",
            "vulnerability_id": "CVE-2023-3390",
            "name": "CVE-2023-3390",
            "package_name": "linux",
            "package_details": {
                "file_path": null,
                "name": "linux",
                "package_manager": "OS",
                "version": "5.15.0",
                "release": "1037.41"
            },
            "remediation": {"recommendation": {"text": "None Provided"}},
            "cvss_v3_score": 7.8,
            "cvss_v30_score": 0.0,
            "cvss_v2_score": 0.0,
            "cvss_v3_severity": "HIGH",
            "source_url": "https://people.canonical.com/~ubuntu-security/cve/2023/CVE-2023-3390.html",
            "source": "UBUNTU_CVE",
            "severity": "MEDIUM",
            "status": "ACTIVE",
            "title": "CVE-2023-3390 - linux"
        })
    }

    #[test]
    fn test_valid_report_has_no_issues() {
        let report = json!({"linux": [valid_record()]});
        let result = validate_report(&report);

        assert!(result.is_valid(), "{:?}", result.issues);
        assert_eq!(result.packages, 1);
        assert_eq!(result.records, 1);
        assert_eq!(result.severity_counts[&CveSeverity::High], 1);
    }

    #[test]
    fn test_non_object_report() {
        let result = validate_report(&json!([1, 2, 3]));
        assert_eq!(result.issues.len(), 1);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_collects_every_issue() {
        let mut record = valid_record();
        record.as_object_mut().unwrap().remove("title");
        record["cvss_v2_score"] = json!("4.3");
        record["cvss_v3_severity"] = json!("CRITICAL");

        let report = json!({"linux": [record], "openssl": {"not": "a list"}});
        let result = validate_report(&report);

        let fields: Vec<&str> = result.issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"title"));
        assert!(fields.contains(&"cvss_v2_score"));
        assert!(fields.contains(&"cvss_v3_severity"));
        assert!(result.issues.iter().any(|i| i.package == "openssl" && i.index.is_none()));
    }

    #[test]
    fn test_package_key_mismatch() {
        let report = json!({"linux-aws": [valid_record()]});
        let result = validate_report(&report);

        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].field, "package_name");
        assert_eq!(result.issues[0].index, Some(0));
    }

    #[test]
    fn test_score_out_of_range() {
        let mut record = valid_record();
        record["cvss_v30_score"] = json!(11.5);
        let result = validate_report(&json!({"linux": [record]}));

        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].message.contains("outside"));
    }

    #[test]
    fn test_missing_package_details_version() {
        let mut record = valid_record();
        record["package_details"]
            .as_object_mut()
            .unwrap()
            .remove("version");
        let result = validate_report(&json!({"linux": [record]}));

        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].field, "package_details.version");
    }

    #[test]
    fn test_lower_case_severity_rejected_like_loader() {
        let mut record = valid_record();
        record["cvss_v3_severity"] = json!("high");
        let report = json!({"linux": [record]});

        let result = validate_report(&report);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].field, "cvss_v3_severity");
        assert!(result.issues[0].message.contains("upper case"));

        let loaded = crate::scan::allowlist::EnhancedScanList::from_json_str(
            &report.to_string(),
            CveSeverity::Undefined,
        );
        assert!(loaded.is_err());
    }
}
