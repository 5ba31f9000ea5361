//! Retention of finalized log files and compressed artifacts

use crate::{
    compression::CompressionTag, config::RetentionPolicy, path::PathTemplate, Error, Result,
};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Applies a [`RetentionPolicy`] to the files produced by one sink
#[derive(Debug, Clone)]
pub struct RetentionManager {
    policy: RetentionPolicy,
    pattern: Regex,
}

impl RetentionManager {
    /// Create a retention manager matching the files of `template`
    pub fn new(policy: RetentionPolicy, template: &PathTemplate) -> Result<Self> {
        policy.validate()?;

        let pattern = Regex::new(&template.file_name_pattern()).map_err(|e| Error::Retention {
            message: format!(
                "Failed to build file pattern for '{}': {}",
                template.raw(),
                e
            ),
        })?;

        Ok(Self { policy, pattern })
    }

    /// Remove files beyond the age and count limits
    ///
    /// Files in `protected`, and artifacts being derived from them, are
    /// neither counted nor removed.
    pub fn perform_cleanup(
        &self,
        log_dir: &Path,
        protected: &HashSet<PathBuf>,
    ) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let mut log_files = LogFileManager::find_log_files(log_dir, &self.pattern, protected)?;
        report.initial_file_count = log_files.len();

        log_files.retain(|f| !f.is_protected);

        report.files_removed_by_age = self.remove_old_files(&mut log_files);
        report.files_removed_by_count = self.remove_excess_files(&mut log_files);

        let remaining = LogFileManager::find_log_files(log_dir, &self.pattern, protected)?;
        report.final_file_count = remaining.len();
        report.final_total_size = LogFileManager::calculate_total_size(&remaining);

        if report.total_files_removed() > 0 {
            info!(
                logsink.event = "retention_applied",
                log_dir = %log_dir.display(),
                initial_files = report.initial_file_count,
                final_files = report.final_file_count,
                final_total_size = report.final_total_size,
                files_removed_by_age = report.files_removed_by_age,
                files_removed_by_count = report.files_removed_by_count,
                "Log retention applied"
            );
        }

        Ok(report)
    }

    /// Remove files older than the maximum age
    fn remove_old_files(&self, log_files: &mut Vec<LogFileInfo>) -> u32 {
        let Some(max_age_days) = self.policy.max_age_days else {
            return 0;
        };
        let max_age_days = f64::from(max_age_days);

        let (expired, kept): (Vec<_>, Vec<_>) = log_files
            .drain(..)
            .partition(|f| f.age_days() > max_age_days);
        *log_files = kept;

        expired
            .iter()
            .filter(|file_info| remove_file(file_info, "Removed expired log file"))
            .count() as u32
    }

    /// Remove the oldest files beyond the maximum count
    fn remove_excess_files(&self, log_files: &mut Vec<LogFileInfo>) -> u32 {
        let Some(max_files) = self.policy.max_files else {
            return 0;
        };
        let max_files = max_files as usize;

        if log_files.len() <= max_files {
            return 0;
        }

        // Oldest first
        log_files.sort_by(|a, b| a.modified.cmp(&b.modified));
        let excess_count = log_files.len() - max_files;

        log_files
            .drain(..excess_count)
            .filter(|file_info| remove_file(file_info, "Removed excess log file"))
            .count() as u32
    }
}

fn remove_file(file_info: &LogFileInfo, message: &str) -> bool {
    match std::fs::remove_file(&file_info.path) {
        Ok(()) => {
            metrics::counter!("fennec.logsink.files_removed").increment(1);
            info!(
                logsink.event = "log_file_removed",
                file = %file_info.path.display(),
                age_days = file_info.age_days(),
                compressed = file_info.is_compressed(),
                "{}",
                message
            );
            true
        }
        Err(e) => {
            warn!(
                logsink.event = "file_removal_failed",
                file = %file_info.path.display(),
                error = %e,
                "Failed to remove log file"
            );
            false
        }
    }
}

/// Utility functions for log file discovery
pub struct LogFileManager;

impl LogFileManager {
    /// Get all files in a directory whose name matches `pattern`
    pub fn find_log_files(
        log_dir: &Path,
        pattern: &Regex,
        protected: &HashSet<PathBuf>,
    ) -> Result<Vec<LogFileInfo>> {
        let mut log_files = Vec::new();

        if !log_dir.exists() {
            return Ok(log_files);
        }

        for entry in std::fs::read_dir(log_dir)? {
            let entry = entry?;
            let path = entry.path();

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !pattern.is_match(file_name) {
                continue;
            }

            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            log_files.push(LogFileInfo {
                is_protected: is_protected(&path, protected),
                size: metadata.len(),
                modified: metadata.modified()?,
                path,
            });
        }

        // Newest first
        log_files.sort_by(|a, b| b.modified.cmp(&a.modified));

        Ok(log_files)
    }

    /// Calculate total disk usage of log files
    pub fn calculate_total_size(log_files: &[LogFileInfo]) -> u64 {
        log_files.iter().map(|f| f.size).sum()
    }
}

/// A protected file, or an artifact named after one (`<protected>.<suffix>`)
fn is_protected(path: &Path, protected: &HashSet<PathBuf>) -> bool {
    if protected.contains(path) {
        return true;
    }

    let Some(name) = path.file_name().map(|name| name.to_string_lossy()) else {
        return false;
    };
    protected.iter().any(|candidate| {
        candidate.parent() == path.parent()
            && candidate.file_name().map_or(false, |base| {
                name.starts_with(&format!("{}.", base.to_string_lossy()))
            })
    })
}

/// Information about a log file
#[derive(Debug, Clone)]
pub struct LogFileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub is_protected: bool,
}

impl LogFileInfo {
    /// Get the age of the log file in days
    pub fn age_days(&self) -> f64 {
        SystemTime::now()
            .duration_since(self.modified)
            .map(|age| age.as_secs_f64() / SECONDS_PER_DAY)
            .unwrap_or(0.0)
    }

    /// Check if this file carries a built-in compression extension
    pub fn is_compressed(&self) -> bool {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();

        CompressionTag::ALL
            .iter()
            .any(|tag| name.ends_with(&format!(".{}", tag.extension())))
    }
}

/// Report of cleanup operations performed
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub initial_file_count: usize,
    pub final_file_count: usize,
    pub final_total_size: u64,
    pub files_removed_by_age: u32,
    pub files_removed_by_count: u32,
}

impl CleanupReport {
    pub fn total_files_removed(&self) -> u32 {
        self.files_removed_by_age + self.files_removed_by_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn template(dir: &Path, name: &str) -> PathTemplate {
        PathTemplate::parse(dir.join(name).to_str().unwrap()).unwrap()
    }

    fn age_file(path: &Path, age: Duration) {
        let time = SystemTime::now() - age;
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(time)).unwrap();
    }

    #[test]
    fn test_cleanup_by_count() {
        let temp_dir = TempDir::new().unwrap();

        for i in 0..10u64 {
            let file_path = temp_dir.path().join(format!("test_{:02}.log.gz", i));
            std::fs::write(&file_path, format!("log content {}", i)).unwrap();
            age_file(&file_path, Duration::from_secs(i * 3600));
        }

        let policy = RetentionPolicy {
            max_files: Some(5),
            max_age_days: None,
        };
        let manager =
            RetentionManager::new(policy, &template(temp_dir.path(), "test_{n}.log")).unwrap();
        let report = manager.perform_cleanup(temp_dir.path(), &HashSet::new()).unwrap();

        assert_eq!(report.files_removed_by_count, 5);
        assert_eq!(report.final_file_count, 5);

        // The newest files survive
        for i in 0..5 {
            assert!(temp_dir
                .path()
                .join(format!("test_{:02}.log.gz", i))
                .exists());
        }
    }

    #[test]
    fn test_cleanup_by_age() {
        let temp_dir = TempDir::new().unwrap();

        for i in 0..5u64 {
            let file_path = temp_dir.path().join(format!("test_{}.log", i));
            std::fs::write(&file_path, "log content").unwrap();

            let days_old = if i < 3 { 40 } else { 5 };
            age_file(&file_path, Duration::from_secs(days_old * 24 * 3600));
        }

        let policy = RetentionPolicy {
            max_files: None,
            max_age_days: Some(30),
        };
        let manager =
            RetentionManager::new(policy, &template(temp_dir.path(), "test_{n}.log")).unwrap();
        let report = manager.perform_cleanup(temp_dir.path(), &HashSet::new()).unwrap();

        assert_eq!(report.files_removed_by_age, 3);
        assert_eq!(report.final_file_count, 2);
        assert_eq!(report.final_total_size, 2 * "log content".len() as u64);
    }

    #[test]
    fn test_active_and_foreign_files_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        let active = temp_dir.path().join("test.log");
        std::fs::write(&active, "active").unwrap();
        std::fs::write(temp_dir.path().join("other.log"), "other").unwrap();
        std::fs::write(temp_dir.path().join("test.ABCD1234.log.gz"), "old").unwrap();

        for path in std::fs::read_dir(temp_dir.path()).unwrap() {
            age_file(&path.unwrap().path(), Duration::from_secs(90 * 24 * 3600));
        }

        let policy = RetentionPolicy {
            max_files: Some(1),
            max_age_days: Some(1),
        };
        let manager =
            RetentionManager::new(policy, &template(temp_dir.path(), "test.log")).unwrap();
        let report = manager
            .perform_cleanup(temp_dir.path(), &HashSet::from([active.clone()]))
            .unwrap();

        assert_eq!(report.total_files_removed(), 1);
        assert!(active.exists());
        assert!(temp_dir.path().join("other.log").exists());
        assert!(!temp_dir.path().join("test.ABCD1234.log.gz").exists());
    }

    #[test]
    fn test_pending_sources_and_their_artifacts_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        let names = ["5.log.xz", "6.log.xz", "7.log", "7.log.xz", "8.log"];
        for (age, name) in names.iter().enumerate() {
            let path = temp_dir.path().join(name);
            std::fs::write(&path, "log content").unwrap();
            age_file(&path, Duration::from_secs((10 - age as u64) * 3600));
        }

        // 7.log is waiting on its compression job, 8.log is active
        let protected = HashSet::from([
            temp_dir.path().join("7.log"),
            temp_dir.path().join("8.log"),
        ]);

        let policy = RetentionPolicy {
            max_files: Some(1),
            max_age_days: None,
        };
        let manager =
            RetentionManager::new(policy, &template(temp_dir.path(), "{n}.log")).unwrap();
        let report = manager.perform_cleanup(temp_dir.path(), &protected).unwrap();

        assert_eq!(report.files_removed_by_count, 1);
        assert!(!temp_dir.path().join("5.log.xz").exists());
        for name in ["6.log.xz", "7.log", "7.log.xz", "8.log"] {
            assert!(temp_dir.path().join(name).exists(), "{} was removed", name);
        }
    }

    #[test]
    fn test_compressed_detection() {
        let info = |name: &str| LogFileInfo {
            path: PathBuf::from("/tmp").join(name),
            size: 0,
            modified: SystemTime::now(),
            is_protected: false,
        };

        assert!(info("1.log.gz").is_compressed());
        assert!(info("1.log.1.tar.xz").is_compressed());
        assert!(!info("1.log").is_compressed());
        assert!(!info("1.log.rar").is_compressed());
    }
}
