//! Table rendering for vulnerability lists, validation results and patch runs.

use std::collections::BTreeMap;

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::patching::steps::{StepRecord, StepStatus};
use crate::scan::allowlist::{AllowlistFormat, VulnerabilityList};
use crate::scan::validate::ValidationReport;
use crate::severity::CveSeverity;

#[derive(Tabled)]
struct VulnerabilityRow {
    #[tabled(rename = "PACKAGE")]
    package: String,
    #[tabled(rename = "VULNERABILITY")]
    vulnerability: String,
    #[tabled(rename = "SEVERITY")]
    severity: String,
}

#[derive(Tabled)]
struct IssueRow {
    #[tabled(rename = "PACKAGE")]
    package: String,
    #[tabled(rename = "INDEX")]
    index: String,
    #[tabled(rename = "FIELD")]
    field: String,
    #[tabled(rename = "PROBLEM")]
    message: String,
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "STEP")]
    step: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DURATION")]
    duration: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

#[derive(Tabled)]
struct IgnorableRow {
    #[tabled(rename = "PACKAGE")]
    package: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

pub fn colorize_severity(severity: CveSeverity) -> String {
    let label = severity.as_str();
    match severity {
        CveSeverity::Critical => label.red().bold().to_string(),
        CveSeverity::High => label.red().to_string(),
        CveSeverity::Medium => label.yellow().to_string(),
        CveSeverity::Low => label.blue().to_string(),
        CveSeverity::Informational | CveSeverity::Undefined => label.dimmed().to_string(),
    }
}

/// Print a vulnerability list, one row per record.
pub fn print_vulnerability_list<F: AllowlistFormat>(title: &str, list: &VulnerabilityList<F>) {
    if list.is_empty() {
        println!("{} {}: none", "✓".green(), title);
        return;
    }

    let rows = build_vulnerability_rows(list);
    println!(
        "{} ({} scan, {} records in {} packages, threshold {}):",
        title.bold(),
        list.label(),
        list.len(),
        list.packages().len(),
        list.minimum_severity()
    );

    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{}", table);
    print_severity_counts(&list.severity_counts());
}

fn build_vulnerability_rows<F: AllowlistFormat>(list: &VulnerabilityList<F>) -> Vec<VulnerabilityRow> {
    list.sorted()
        .iter()
        .flat_map(|(package, records)| {
            records.iter().map(move |record| VulnerabilityRow {
                package: package.clone(),
                vulnerability: F::record_name(record).to_string(),
                severity: colorize_severity(F::severity(record)),
            })
        })
        .collect()
}

pub fn print_severity_counts(counts: &BTreeMap<CveSeverity, usize>) {
    let parts: Vec<String> = counts
        .iter()
        .rev()
        .map(|(severity, count)| format!("{}: {}", colorize_severity(*severity), count))
        .collect();
    if !parts.is_empty() {
        println!("Summary: {}", parts.join(", "));
    }
}

pub fn print_validation_report(report: &ValidationReport) {
    println!(
        "{} packages, {} records",
        report.packages.to_string().bold(),
        report.records.to_string().bold()
    );
    print_severity_counts(&report.severity_counts);

    if report.is_valid() {
        println!("{} Report is valid", "✓".green());
        return;
    }

    let rows: Vec<IssueRow> = report
        .issues
        .iter()
        .map(|issue| IssueRow {
            package: issue.package.clone(),
            index: issue
                .index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".to_string()),
            field: issue.field.clone(),
            message: issue.message.clone(),
        })
        .collect();

    println!();
    println!("{} {} issue(s):", "✗".red(), report.issues.len());
    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{}", table);
}

pub fn print_patch_steps(records: &[StepRecord]) {
    let rows: Vec<StepRow> = records
        .iter()
        .map(|record| StepRow {
            step: record.step.name().to_string(),
            status: format_step_status(&record.status),
            duration: format!("{:.1}s", record.duration_seconds),
            detail: record.detail.clone(),
        })
        .collect();

    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{}", table);
}

fn format_step_status(status: &StepStatus) -> String {
    match status {
        StepStatus::Completed => "Completed".green().to_string(),
        StepStatus::Skipped => "Skipped".yellow().to_string(),
        StepStatus::Planned => "Planned".cyan().to_string(),
        StepStatus::Failed => "Failed".red().to_string(),
    }
}

pub fn print_ignorable(messages: &BTreeMap<String, String>) {
    if messages.is_empty() {
        println!("No ignorable OS packages.");
        return;
    }

    let rows: Vec<IgnorableRow> = messages
        .iter()
        .map(|(package, reason)| IgnorableRow {
            package: package.clone(),
            reason: reason.clone(),
        })
        .collect();

    println!("{}:", "Ignorable OS packages".bold());
    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{}", table);
}

/// kubectl-style: no borders, no separators, 2-space column gap.
fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}
