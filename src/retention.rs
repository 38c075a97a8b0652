use crate::errors::{AppError, AppResult};
use crate::models::ExportResponse;
use anyhow::Context;
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use zip::write::SimpleFileOptions;

static UNSAFE_FILENAME_CHARS: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"[^a-zA-Z0-9_-]").expect("valid filename regex"));

pub const DEBUG_ZIP_NAME: &str = "debug.zip";
const LOG_EXTENSION: &str = "log";
const MAX_ARGS_COMPONENT_LEN: usize = 120;

/// Raw output of a single run, one worker line per file line.
pub struct RunLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RunLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Keeps per-run log files in the debug directory under a count limit.
#[derive(Debug)]
pub struct LogRetention {
    debug_dir: PathBuf,
    limit: AtomicUsize,
}

impl LogRetention {
    /// `limit` of zero disables pruning.
    pub fn new(debug_dir: PathBuf, limit: usize) -> Self {
        Self {
            debug_dir,
            limit: AtomicUsize::new(limit),
        }
    }

    pub fn debug_dir(&self) -> &Path {
        &self.debug_dir
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    /// Creates the log for a new run, then prunes so the new file is
    /// always among the survivors.
    pub fn open_run_log(&self, args: &[String], started_at: DateTime<Local>) -> AppResult<RunLog> {
        std::fs::create_dir_all(&self.debug_dir)
            .map_err(|error| AppError::Io(format!("failed to create debug directory: {}", error)))?;
        let path = self.debug_dir.join(log_file_name(args, started_at));
        let run_log = RunLog::create(&path)
            .map_err(|error| AppError::Io(format!("failed to create log file {}: {}", path.display(), error)))?;
        self.prune();
        Ok(run_log)
    }

    /// Deletes the oldest logs past the limit. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let limit = self.limit();
        if limit == 0 {
            return 0;
        }
        let logs = match self.list_logs() {
            Ok(logs) => logs,
            Err(error) => {
                tracing::warn!(error = %error, dir = %self.debug_dir.display(), "failed to list run logs");
                return 0;
            }
        };
        if logs.len() <= limit {
            return 0;
        }

        let excess = logs.len() - limit;
        let mut removed = 0;
        for (path, _) in logs.into_iter().take(excess) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(error) => {
                    tracing::debug!(error = %error, path = %path.display(), "failed to delete old log file");
                }
            }
        }
        removed
    }

    /// Run logs sorted oldest first by modification time.
    pub fn list_logs(&self) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
        let mut logs = Vec::new();
        for entry in std::fs::read_dir(&self.debug_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            logs.push((path, modified));
        }
        logs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(logs)
    }

    /// Archives the whole debug directory as `debug.zip` next to it.
    pub fn export_debug_zip(&self) -> AppResult<ExportResponse> {
        let parent = self
            .debug_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.export_zip(&parent.join(DEBUG_ZIP_NAME))
    }

    pub fn export_zip(&self, destination: &Path) -> AppResult<ExportResponse> {
        if !self.debug_dir.is_dir() {
            return Err(AppError::Io(format!(
                "debug directory does not exist: {}",
                self.debug_dir.display()
            )));
        }
        write_zip(&self.debug_dir, destination)?;
        tracing::info!(path = %destination.display(), "debug archive saved");
        Ok(ExportResponse {
            path: destination.to_string_lossy().to_string(),
        })
    }
}

/// `<YYYYMMDD_HHMMSS>_<args>.log` with the args joined by `_` and reduced
/// to filename-safe characters.
pub fn log_file_name(args: &[String], started_at: DateTime<Local>) -> String {
    let timestamp = started_at.format("%Y%m%d_%H%M%S");
    let joined = args.join("_");
    let sanitized: String = UNSAFE_FILENAME_CHARS
        .replace_all(&joined, "")
        .chars()
        .take(MAX_ARGS_COMPONENT_LEN)
        .collect();
    format!("{}_{}.{}", timestamp, sanitized, LOG_EXTENSION)
}

fn write_zip(source_dir: &Path, destination: &Path) -> anyhow::Result<()> {
    let file = File::create(destination)
        .with_context(|| format!("failed to create zip file {}", destination.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut pending = vec![source_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.path());
        for entry in entries {
            let path = entry.path();
            if path == destination {
                continue;
            }
            if entry.file_type()?.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(source_dir)
                .with_context(|| format!("{} escaped the debug directory", path.display()))?;
            let name = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            writer.start_file(name, options)?;
            let mut source = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
            std::io::copy(&mut source, &mut writer)
                .with_context(|| format!("failed to archive {}", path.display()))?;
        }
    }

    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{log_file_name, LogRetention};
    use chrono::{Local, TimeZone};
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    fn touch(path: &std::path::Path, age_secs: u64) {
        let file = File::create(path).expect("create log");
        let modified = SystemTime::now() - Duration::from_secs(age_secs);
        file.set_modified(modified).expect("set mtime");
    }

    #[test]
    fn file_name_uses_timestamp_and_sanitized_args() {
        let started = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).single().expect("time");
        let args = vec!["AFKJourney".to_string(), "--log-level=DEBUG".to_string(), "a/b c".to_string()];
        assert_eq!(
            log_file_name(&args, started),
            "20240305_070809_AFKJourney_--log-levelDEBUG_abc.log"
        );
    }

    #[test]
    fn prunes_oldest_files_and_keeps_the_new_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let debug = dir.path().join("debug");
        std::fs::create_dir_all(&debug).expect("debug dir");
        for (index, age) in [500_u64, 400, 300, 200].iter().enumerate() {
            touch(&debug.join(format!("old_{}.log", index)), *age);
        }
        std::fs::write(debug.join("notes.txt"), "not a log").expect("write txt");

        let retention = LogRetention::new(debug.clone(), 3);
        let run_log = retention
            .open_run_log(&["Task".to_string()], Local::now())
            .expect("open run log");

        let remaining: Vec<String> = retention
            .list_logs()
            .expect("list")
            .into_iter()
            .map(|(path, _)| path.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&"old_2.log".to_string()));
        assert!(remaining.contains(&"old_3.log".to_string()));
        assert!(run_log.path().exists());
        assert!(debug.join("notes.txt").exists());
    }

    #[test]
    fn zero_limit_disables_pruning() {
        let dir = tempfile::tempdir().expect("tempdir");
        for index in 0..4 {
            touch(&dir.path().join(format!("{}.log", index)), 10);
        }
        let retention = LogRetention::new(dir.path().to_path_buf(), 0);
        assert_eq!(retention.prune(), 0);
        retention.set_limit(1);
        assert_eq!(retention.prune(), 3);
    }

    #[test]
    fn exports_debug_directory_with_relative_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let debug = dir.path().join("debug");
        std::fs::create_dir_all(debug.join("screens")).expect("dirs");
        std::fs::write(debug.join("run.log"), "line\n").expect("write log");
        std::fs::write(debug.join("screens").join("shot.txt"), "pixels").expect("write nested");

        let retention = LogRetention::new(debug, 5);
        let exported = retention.export_debug_zip().expect("export");
        assert!(exported.path.ends_with("debug.zip"));

        let file = File::open(&exported.path).expect("open zip");
        let mut archive = zip::ZipArchive::new(file).expect("read zip");
        let mut names: Vec<String> = (0..archive.len())
            .map(|index| archive.by_index(index).expect("entry").name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["run.log", "screens/shot.txt"]);
    }

    #[test]
    fn export_fails_without_debug_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let retention = LogRetention::new(dir.path().join("missing"), 5);
        assert!(retention.export_debug_zip().is_err());
    }
}
