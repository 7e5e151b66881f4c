//! CLI configuration and argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::logging::LogFormat;
use crate::patching::compliance::DEFAULT_BUNDLE_URL;
use crate::patching::layout::DEFAULT_BASE_PATH;
use crate::severity::CveSeverity;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// ECR scan allowlist gate and DLC patch bookkeeping CLI.
///
/// Converts ECR scan findings into allowlist reports, checks images against
/// their allowlists, and records patch details inside released images.
#[derive(Parser, Debug, Clone)]
#[command(name = "cvegate")]
#[command(about = "ECR scan allowlist gate and DLC patch bookkeeping CLI")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// AWS profile to use
    #[arg(long, global = true, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// AWS region
    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Show planned changes without executing
    #[arg(long, global = true, default_value = "false")]
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "CVEGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "pretty", env = "LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// ECR scanning mode the findings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScanFormat {
    Basic,
    Enhanced,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check an allowlist-format CVE report for schema problems
    Validate {
        /// Report to validate
        #[arg(value_name = "REPORT")]
        report: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Convert ECR scan findings into an allowlist-format report
    #[command(after_help = r#"Examples:
  cvegate convert findings.json -o Dockerfile.gpu.os_scan_allowlist.json
  cvegate convert findings.json --format basic --minimum-severity HIGH"#)]
    Convert {
        /// Findings JSON as written by `cvegate fetch` or `aws ecr describe-image-scan-findings`
        #[arg(value_name = "FINDINGS")]
        findings: PathBuf,

        #[arg(long, value_enum, default_value = "enhanced")]
        format: ScanFormat,

        /// Drop findings below this severity
        #[arg(long, default_value = "MEDIUM")]
        minimum_severity: CveSeverity,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download scan findings for an image from ECR
    Fetch {
        /// Image URI (<account>.dkr.ecr.<region>.amazonaws.com/<repo>:<tag>)
        #[arg(value_name = "IMAGE")]
        image: String,

        #[arg(long, value_enum, default_value = "enhanced")]
        format: ScanFormat,

        /// Start a basic scan before fetching (basic format only)
        #[arg(long)]
        start_scan: bool,

        /// Wait for the scan to finish before fetching
        #[arg(long)]
        wait: bool,

        /// Write findings here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fail when an image has vulnerabilities its allowlist does not cover
    #[command(after_help = r#"Examples:
  cvegate check <IMAGE> --findings findings.json --allowlist Dockerfile.gpu.os_scan_allowlist.json
  cvegate check <IMAGE> --dockerfile pytorch/training/docker/2.0/py3/Dockerfile.gpu"#)]
    Check {
        /// Image URI
        #[arg(value_name = "IMAGE")]
        image: String,

        /// Findings JSON; fetched from ECR when omitted
        #[arg(long)]
        findings: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "enhanced")]
        format: ScanFormat,

        /// Allowlist report
        #[arg(long, env = "ECR_SCAN_ALLOWLIST_PATH")]
        allowlist: Option<PathBuf>,

        /// Dockerfile the allowlist path is derived from when --allowlist is not set
        #[arg(long)]
        dockerfile: Option<PathBuf>,

        /// Treat the image as a generic image (threshold HIGH)
        #[arg(long, env = "CVEGATE_GENERIC_IMAGE")]
        generic_image: bool,

        /// Override the image-derived severity threshold
        #[arg(long)]
        minimum_severity: Option<CveSeverity>,

        /// Print remaining vulnerabilities as JSON
        #[arg(long)]
        json: bool,
    },

    /// Split vulnerabilities into fixable and non-fixable by apt upgrade
    Fixable {
        /// Image URI of the released image
        #[arg(value_name = "IMAGE")]
        image: String,

        #[arg(long, value_enum, default_value = "basic")]
        format: ScanFormat,

        /// Findings JSON of the released image
        #[arg(long)]
        current: PathBuf,

        /// Findings JSON of the image after apt-get upgrade
        #[arg(long)]
        upgraded: PathBuf,

        /// Dockerfile of the image in the repository
        #[arg(long)]
        dockerfile: PathBuf,

        /// Allowlist report; derived from --dockerfile when omitted
        #[arg(long, env = "ECR_SCAN_ALLOWLIST_PATH")]
        allowlist: Option<PathBuf>,

        /// Directory for the generated files
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Upload the generated files to this bucket
        #[arg(long, env = "CVEGATE_S3_BUCKET")]
        s3_bucket: Option<String>,

        #[arg(long, env = "CVEGATE_GENERIC_IMAGE")]
        generic_image: bool,
    },

    /// List impacted OS packages that cannot be upgraded any further
    Ignorable {
        /// Remaining vulnerabilities in allowlist format
        #[arg(value_name = "REMAINING")]
        remaining: PathBuf,

        /// Apt patch evaluation generated against the current package index
        #[arg(long)]
        fresh: PathBuf,

        /// Apt patch evaluation embedded in the image (patch-details/os_summary.json)
        #[arg(long)]
        embedded: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record patch details for a released image
    #[command(after_help = r#"Examples:
  cvegate patch sha256:0123abcd
  cvegate patch sha256:0123abcd --skip-compliance --dry-run"#)]
    Patch {
        /// SHA of the released image being patched
        #[arg(value_name = "RELEASED_IMAGE_SHA")]
        released_image_sha: String,

        #[arg(long, env = "PATCHING_INFO_PATH", default_value = DEFAULT_BASE_PATH)]
        base_path: PathBuf,

        /// Directory with derive_history.py and extract_apt_patch_data.py [default: base path]
        #[arg(long)]
        scripts_dir: Option<PathBuf>,

        #[arg(long, env = "PYTHON", default_value = "python3")]
        python: String,

        #[arg(long, env = "HOME", default_value = "/root")]
        home: PathBuf,

        /// Where the compliance test tool is installed
        #[arg(long, default_value = "/usr/local/bin")]
        install_dir: PathBuf,

        #[arg(long, default_value = DEFAULT_BUNDLE_URL)]
        compliance_url: String,

        #[arg(long)]
        skip_compliance: bool,

        /// Extra directory removed during cleanup (repeatable)
        #[arg(long = "temp-dir", value_name = "DIR")]
        temp_dirs: Vec<PathBuf>,
    },
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub profile: Option<String>,
    pub region: Option<String>,
    pub dry_run: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    pub command: Command,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Self {
        Self {
            profile: args.profile,
            region: args.region,
            dry_run: args.dry_run,
            log_level: args.log_level,
            log_format: args.log_format,
            command: args.command,
        }
    }

    /// Whether the command talks to AWS.
    pub fn needs_aws(&self) -> bool {
        match &self.command {
            Command::Fetch { .. } => true,
            Command::Check { findings, .. } => findings.is_none(),
            Command::Fixable { s3_bucket, .. } => s3_bucket.is_some(),
            _ => false,
        }
    }
}
