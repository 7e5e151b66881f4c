//! What to do with vulnerabilities left over after the allowlist is applied.

pub mod failure;
pub mod ignorable;

pub use failure::{
    EditedFile, FailureSummary, apt_package_name, fixable_by_upgrade, merge_apt_upgrade_list,
    non_fixable, run_failure_routine,
};
pub use ignorable::{AptPatchEvaluation, ImpactedPackages, ignorable_packages};
