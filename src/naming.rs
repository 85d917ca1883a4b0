//! Destination paths for new recordings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

/// Produces a fresh output path every time a recording starts.
pub trait FileNameFactory: Send + Sync {
    fn generate(&self) -> Result<PathBuf>;
}

/// `<prefix>/<YYYY-MM-DD>/<HH.MM.SS><extension>`, creating the date folder.
#[derive(Debug, Clone)]
pub struct DateFolderFactory {
    prefix: PathBuf,
    extension: String,
}

impl DateFolderFactory {
    pub fn new(prefix: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Path for a recording started at `now`.
    pub fn generate_at(&self, now: DateTime<Local>) -> Result<PathBuf> {
        let folder = self.prefix.join(now.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&folder)
            .with_context(|| format!("Failed to create {}", folder.display()))?;

        let stem = now.format("%H.%M.%S").to_string();
        let mut path = folder.join(format!("{stem}{}", self.extension));
        // several recordings may start within the same second
        let mut counter = 1;
        while path.exists() {
            path = folder.join(format!("{stem}-{counter}{}", self.extension));
            counter += 1;
        }
        Ok(path)
    }
}

impl FileNameFactory for DateFolderFactory {
    fn generate(&self) -> Result<PathBuf> {
        self.generate_at(Local::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_folder_layout() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DateFolderFactory::new(dir.path().join("recordings"), ".mkv");
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();

        let path = factory.generate_at(now).unwrap();
        assert_eq!(
            path,
            dir.path().join("recordings").join("2024-03-09").join("07.05.01.mkv")
        );
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_same_second_gets_new_name() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DateFolderFactory::new(dir.path(), ".mp4");
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();

        let first = factory.generate_at(now).unwrap();
        std::fs::write(&first, b"").unwrap();
        let second = factory.generate_at(now).unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("07.05.01-1.mp4"));
    }
}
