//! Directory layout under the patching-info base path and the moves between directories.
//!
//! ```text
//! <base>/patch-details-current/   staged by the image build
//! <base>/patch-details/           details of the patch applied to the image
//! <base>/patch-details-archive/   patch-details-0, patch-details-1, ...
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::error::CvegateError;

pub const DEFAULT_BASE_PATH: &str = "/opt/aws/dlc/patching-info";

const CURRENT_DIR: &str = "patch-details-current";
const DETAILS_DIR: &str = "patch-details";
const ARCHIVE_DIR: &str = "patch-details-archive";
const SHA_FILE: &str = "released_image_sha.txt";

/// What the archive and promote steps have to do for a given SHA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionState {
    /// `patch-details-current` is staged. `archive_existing` is set when a
    /// previous `patch-details` has to move out of the way first.
    Pending { archive_existing: bool },
    /// Already promoted for this SHA by an earlier run.
    AlreadyPromoted,
}

#[derive(Debug, Clone)]
pub struct PatchLayout {
    base: PathBuf,
}

impl PatchLayout {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn current_dir(&self) -> PathBuf {
        self.base.join(CURRENT_DIR)
    }

    pub fn details_dir(&self) -> PathBuf {
        self.base.join(DETAILS_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.base.join(ARCHIVE_DIR)
    }

    pub fn sha_file(&self) -> PathBuf {
        self.details_dir().join(SHA_FILE)
    }

    /// SHA recorded by the last promotion, if any.
    pub fn recorded_sha(&self) -> Result<Option<String>> {
        let path = self.sha_file();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Decide the promotion work without touching the filesystem.
    ///
    /// Fails with [`CvegateError::MissingDirectory`] when nothing is staged
    /// and the details on disk belong to another image.
    pub fn promotion_state(&self, released_image_sha: &str) -> Result<PromotionState> {
        if self.current_dir().is_dir() {
            return Ok(PromotionState::Pending {
                archive_existing: self.details_dir().exists(),
            });
        }

        if self.recorded_sha()?.as_deref() == Some(released_image_sha) {
            return Ok(PromotionState::AlreadyPromoted);
        }

        Err(CvegateError::MissingDirectory(self.current_dir()).into())
    }

    /// Next free `patch-details-<N>`, N starting at the number of archived entries.
    pub fn next_archive_path(&self) -> Result<PathBuf> {
        let archive_dir = self.archive_dir();
        let mut index = match fs::read_dir(&archive_dir) {
            Ok(entries) => entries.count(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", archive_dir.display()));
            }
        };

        loop {
            let candidate = archive_dir.join(format!("{}-{}", DETAILS_DIR, index));
            if !candidate.exists() {
                return Ok(candidate);
            }
            index += 1;
        }
    }

    /// Move `patch-details` into the archive. Returns the archive entry.
    pub fn archive_details(&self) -> Result<PathBuf> {
        let details = self.details_dir();
        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("Failed to create {}", archive_dir.display()))?;

        let target = self.next_archive_path()?;
        fs::rename(&details, &target).with_context(|| {
            format!("Failed to move {} to {}", details.display(), target.display())
        })?;

        info!(
            from = %details.display(),
            to = %target.display(),
            "Archived previous patch details"
        );
        Ok(target)
    }

    /// Record the SHA inside `patch-details-current`, then rename it to
    /// `patch-details`. The rename is the only step that commits.
    pub fn promote_current(&self, released_image_sha: &str) -> Result<()> {
        let current = self.current_dir();
        let details = self.details_dir();

        let staged_sha_file = current.join(SHA_FILE);
        fs::write(&staged_sha_file, format!("{}\n", released_image_sha))
            .with_context(|| format!("Failed to write {}", staged_sha_file.display()))?;

        fs::rename(&current, &details).with_context(|| {
            format!("Failed to move {} to {}", current.display(), details.display())
        })?;

        info!(
            details = %details.display(),
            released_image_sha = %released_image_sha,
            "Promoted current patch details"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> (TempDir, PatchLayout) {
        let dir = TempDir::new().unwrap();
        let layout = PatchLayout::new(dir.path());
        (dir, layout)
    }

    #[test]
    fn test_promotion_state_pending() {
        let (_dir, layout) = layout();
        fs::create_dir_all(layout.current_dir()).unwrap();

        assert_eq!(
            layout.promotion_state("sha256:abc").unwrap(),
            PromotionState::Pending {
                archive_existing: false
            }
        );

        fs::create_dir_all(layout.details_dir()).unwrap();
        assert_eq!(
            layout.promotion_state("sha256:abc").unwrap(),
            PromotionState::Pending {
                archive_existing: true
            }
        );
    }

    #[test]
    fn test_promotion_state_already_promoted() {
        let (_dir, layout) = layout();
        fs::create_dir_all(layout.details_dir()).unwrap();
        fs::write(layout.sha_file(), "sha256:abc\n").unwrap();

        assert_eq!(
            layout.promotion_state("sha256:abc").unwrap(),
            PromotionState::AlreadyPromoted
        );
    }

    #[test]
    fn test_promotion_state_missing_current() {
        let (_dir, layout) = layout();
        fs::create_dir_all(layout.details_dir()).unwrap();
        fs::write(layout.sha_file(), "sha256:old\n").unwrap();

        let err = layout.promotion_state("sha256:new").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CvegateError>(),
            Some(CvegateError::MissingDirectory(_))
        ));
    }

    #[test]
    fn test_archive_numbering() {
        let (_dir, layout) = layout();
        fs::create_dir_all(layout.archive_dir().join("patch-details-0")).unwrap();
        fs::create_dir_all(layout.archive_dir().join("patch-details-1")).unwrap();
        fs::create_dir_all(layout.details_dir()).unwrap();

        let archived = layout.archive_details().unwrap();
        assert_eq!(archived, layout.archive_dir().join("patch-details-2"));
        assert!(archived.is_dir());
        assert!(!layout.details_dir().exists());
    }

    #[test]
    fn test_next_archive_path_skips_taken_names() {
        let (_dir, layout) = layout();
        fs::create_dir_all(layout.archive_dir().join("patch-details-1")).unwrap();

        assert_eq!(
            layout.next_archive_path().unwrap(),
            layout.archive_dir().join("patch-details-2")
        );
    }

    #[test]
    fn test_promote_records_sha() {
        let (_dir, layout) = layout();
        fs::create_dir_all(layout.current_dir()).unwrap();
        fs::write(layout.current_dir().join("install_script_os.sh"), "true").unwrap();

        layout.promote_current("sha256:abc").unwrap();

        assert!(!layout.current_dir().exists());
        assert!(layout.details_dir().join("install_script_os.sh").exists());
        assert_eq!(layout.recorded_sha().unwrap().as_deref(), Some("sha256:abc"));
    }

    #[test]
    fn test_failed_sha_write_leaves_current_staged() {
        let (_dir, layout) = layout();
        // a directory where the marker goes makes the write fail
        fs::create_dir_all(layout.current_dir().join(SHA_FILE)).unwrap();

        assert!(layout.promote_current("sha256:abc").is_err());

        assert!(layout.current_dir().is_dir());
        assert!(!layout.details_dir().exists());
        assert_eq!(
            layout.promotion_state("sha256:abc").unwrap(),
            PromotionState::Pending {
                archive_existing: false
            }
        );

        fs::remove_dir(layout.current_dir().join(SHA_FILE)).unwrap();
        layout.promote_current("sha256:abc").unwrap();
        assert_eq!(
            layout.promotion_state("sha256:abc").unwrap(),
            PromotionState::AlreadyPromoted
        );
    }
}
