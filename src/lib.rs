//! cvegate - ECR scan allowlist gate and DLC patch bookkeeping.
//!
//! - Allowlist-format CVE reports: typed model, schema validation
//! - Vulnerability list engine for ECR basic and enhanced scans
//! - Scan failure routine and ignorable package evaluation
//! - Patch-info bookkeeping pipeline for released images

pub mod aws;
pub mod config;
pub mod error;
pub mod image;
pub mod logging;
pub mod output;
pub mod patching;
pub mod remediation;
pub mod scan;
pub mod severity;
