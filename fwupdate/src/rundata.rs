// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The resume marker. While an update is in flight the marker holds the
//! firmware image path; after an interruption a later run finds the chip in
//! boot-loader mode and resumes with that image.

use std::path::Path;
use std::path::PathBuf;

/// Default marker file, placed in the working directory.
pub const RUN_DATA_FILE: &str = "TPMFactoryUpd_RunData.txt";

pub struct RunData {
    path: PathBuf,
}

impl RunData {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Self {
        Self::new(RUN_DATA_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Record the image path; called once the chip has acknowledged the
    /// first data block. A write failure must not interrupt the running
    /// transfer, so it is only logged.
    pub fn write(&self, firmware_path: &Path) {
        let mut line = firmware_path.display().to_string();
        line.push('\n');
        if let Err(err) = fs_err::write(&self.path, line) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to write the run data file"
            );
        }
    }

    /// The image path recorded by an interrupted run.
    pub fn read(&self) -> Option<PathBuf> {
        let content = fs_err::read_to_string(&self.path).ok()?;
        let line = content.lines().next()?.trim();
        if line.is_empty() {
            return None;
        }
        Some(PathBuf::from(line))
    }

    /// Remove the marker after a successful update. Failure is cosmetic
    /// (e.g. missing permissions) and only logged.
    pub fn remove(&self) {
        if !self.exists() {
            return;
        }
        if let Err(err) = fs_err::remove_file(&self.path) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to remove the run data file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let run_data = RunData::new(dir.path().join(RUN_DATA_FILE));
        assert!(!run_data.exists());
        assert_eq!(run_data.read(), None);

        run_data.write(Path::new("/tmp/img.bin"));
        assert!(run_data.exists());
        assert_eq!(run_data.read(), Some(PathBuf::from("/tmp/img.bin")));

        run_data.remove();
        assert!(!run_data.exists());
    }

    #[test]
    fn empty_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RUN_DATA_FILE);
        fs_err::write(&path, "\n").unwrap();
        assert_eq!(RunData::new(path).read(), None);
    }
}
