//! Frame persistence.
//!
//! Completed loops are handed to a [`FrameSink`]. The CSV writer stores one
//! comma-delimited file per kinetic index, named
//! `{base}{file_number}{letter}.csv`, e.g. `ixon12a.csv`, `ixon12b.csv`. Each
//! file is written under a `_temp.csv` name first and renamed once complete so
//! that a watcher never picks up a half-written file.
//!
//! Save directories are `{root}/{YYYY}/{MM}/{YYYYMMDD}/{folder}/` when dated
//! subdirectories are enabled. The file number continues from the highest one
//! already present in the directory.

use crate::acquisition::AcquisitionOutput;
use crate::config::StorageSettings;
use crate::error::{CamError, CamResult};
use crate::status::StatusLog;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Receives every completed acquisition.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Store `output`; returns the written paths.
    async fn persist(&self, output: &AcquisitionOutput) -> CamResult<Vec<PathBuf>>;
}

/// CSV writer when saving is on, [`DiscardSink`] otherwise.
pub fn sink_from_settings(settings: &StorageSettings, status: StatusLog) -> Arc<dyn FrameSink> {
    if settings.save_files {
        Arc::new(CsvFrameWriter::new(settings.clone(), status))
    } else {
        Arc::new(DiscardSink::new(status))
    }
}

/// Sink used when saving is off.
#[derive(Clone, Default)]
pub struct DiscardSink {
    status: StatusLog,
}

impl DiscardSink {
    /// Sink reporting to `status`.
    pub fn new(status: StatusLog) -> Self {
        Self { status }
    }
}

#[async_trait]
impl FrameSink for DiscardSink {
    async fn persist(&self, _output: &AcquisitionOutput) -> CamResult<Vec<PathBuf>> {
        self.status.info("save", "Data saving is turned off.");
        Ok(Vec::new())
    }
}

// =============================================================================
// Naming helpers
// =============================================================================

/// Save directory for `date`.
pub fn save_directory(settings: &StorageSettings, date: NaiveDate) -> PathBuf {
    let mut dir = settings.save_root.clone();
    if settings.dated_subdirectories {
        dir.push(format!("{:04}", date.year()));
        dir.push(format!("{:02}", date.month()));
        dir.push(date.format("%Y%m%d").to_string());
    }
    dir.push(&settings.folder);
    dir
}

/// Letter suffix of a kinetic index: `a`..`z`, then `aa`, `ab`, ...
pub fn kinetic_letter(index: usize) -> String {
    let mut n = index;
    let mut letters = Vec::new();
    loop {
        letters.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// File number encoded in `name`, if it is one of our data files.
pub fn parse_file_number(name: &str, base: &str) -> Option<u32> {
    let stem = name.strip_prefix(base)?.strip_suffix(".csv")?;
    let digits: String = stem.chars().take_while(char::is_ascii_digit).collect();
    let rest = &stem[digits.len()..];
    let letters = rest.split('_').next().unwrap_or("");
    if digits.is_empty() || letters.is_empty() || !letters.chars().all(|c| c.is_ascii_lowercase())
    {
        return None;
    }
    if rest.ends_with("_temp") {
        return None;
    }
    digits.parse().ok()
}

/// One past the highest file number in `dir`; 0 for an empty or missing directory.
pub fn next_file_number(dir: &Path, base: &str) -> CamResult<u32> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut next = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(n) = entry
            .file_name()
            .to_str()
            .and_then(|name| parse_file_number(name, base))
        {
            next = next.max(n.saturating_add(1));
        }
    }
    Ok(next)
}

// =============================================================================
// CsvFrameWriter
// =============================================================================

#[cfg(feature = "storage_csv")]
struct WriterState {
    date: NaiveDate,
    dir: PathBuf,
    next_number: u32,
}

/// Writes completed loops as CSV files.
#[cfg(feature = "storage_csv")]
pub struct CsvFrameWriter {
    settings: StorageSettings,
    status: StatusLog,
    state: tokio::sync::Mutex<Option<WriterState>>,
}

#[cfg(feature = "storage_csv")]
impl CsvFrameWriter {
    /// Writer for `settings`. Nothing touches the disk until the first save.
    pub fn new(settings: StorageSettings, status: StatusLog) -> Self {
        Self {
            settings,
            status,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Directory and file number for a save on `date`, rolling over on a new day.
    async fn claim(&self, date: NaiveDate) -> CamResult<(PathBuf, u32)> {
        let mut guard = self.state.lock().await;
        let stale = guard.as_ref().map_or(true, |s| s.date != date);
        if stale {
            let dir = save_directory(&self.settings, date);
            std::fs::create_dir_all(&dir)
                .map_err(|e| CamError::Storage(format!("cannot create {}: {e}", dir.display())))?;
            let next_number = next_file_number(&dir, &self.settings.filename_base)?;
            tracing::info!(dir = %dir.display(), next_number, "save directory ready");
            *guard = Some(WriterState {
                date,
                dir,
                next_number,
            });
        }
        match guard.as_mut() {
            Some(state) => {
                let number = state.next_number;
                state.next_number += 1;
                Ok((state.dir.clone(), number))
            }
            None => Err(CamError::Storage("save directory unavailable".to_string())),
        }
    }

    /// Write `rows` to `path` via a `_temp.csv` sibling. The temp file never
    /// outlives a failed save.
    fn write_rows<T: ToString>(
        path: &Path,
        rows: impl Iterator<Item = Vec<T>>,
    ) -> CamResult<()> {
        let temp = path.with_file_name(format!(
            "{}_temp.csv",
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("frame")
        ));
        let written = Self::write_csv(&temp, rows)
            .and_then(|()| std::fs::rename(&temp, path).map_err(CamError::from));
        if written.is_err() && temp.exists() {
            if let Err(e) = std::fs::remove_file(&temp) {
                tracing::warn!(path = %temp.display(), error = %e, "could not remove partial save");
            }
        }
        written
    }

    fn write_csv<T: ToString>(path: &Path, rows: impl Iterator<Item = Vec<T>>) -> CamResult<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(|e| CamError::Storage(format!("Failed to create CSV file: {e}")))?;
        for row in rows {
            writer
                .write_record(row.iter().map(ToString::to_string))
                .map_err(|e| CamError::Storage(e.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Writes completed loops as CSV files. Disabled in this build.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvFrameWriter;

#[cfg(not(feature = "storage_csv"))]
impl CsvFrameWriter {
    /// Writer that refuses every save.
    pub fn new(_settings: StorageSettings, _status: StatusLog) -> Self {
        Self
    }
}

#[async_trait]
impl FrameSink for CsvFrameWriter {
    async fn persist(&self, output: &AcquisitionOutput) -> CamResult<Vec<PathBuf>> {
        #[cfg(not(feature = "storage_csv"))]
        return Err(CamError::FeatureNotEnabled("storage_csv".to_string()));

        #[cfg(feature = "storage_csv")]
        {
            let (dir, number) = self.claim(output.completed_at.date_naive()).await?;
            let base = format!("{}{}", self.settings.filename_base, number);
            let mut paths = Vec::new();

            for (k, stack) in output.raw.stacks().iter().enumerate() {
                let path = dir.join(format!("{base}{}.csv", kinetic_letter(k)));
                Self::write_rows(&path, stack.rows().into_iter().map(|r| r.to_vec()))?;
                paths.push(path);
            }

            if self.settings.save_derived {
                if let Some(derived) = &output.derived {
                    for frame in &derived.frames {
                        let path = dir.join(format!(
                            "{base}{}_{}.csv",
                            kinetic_letter(frame.species),
                            derived.mode.suffix()
                        ));
                        Self::write_rows(&path, frame.image.rows().into_iter().map(|r| r.to_vec()))?;
                        paths.push(path);
                    }
                }
            }

            self.status.info(
                "save",
                format!("Data saved as {base} ({} file(s)).", paths.len()),
            );
            Ok(paths)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinetic_letters() {
        assert_eq!(kinetic_letter(0), "a");
        assert_eq!(kinetic_letter(1), "b");
        assert_eq!(kinetic_letter(25), "z");
        assert_eq!(kinetic_letter(26), "aa");
        assert_eq!(kinetic_letter(27), "ab");
    }

    #[test]
    fn file_numbers_are_parsed_from_data_files_only() {
        assert_eq!(parse_file_number("ixon12a.csv", "ixon"), Some(12));
        assert_eq!(parse_file_number("ixon3b_od.csv", "ixon"), Some(3));
        assert_eq!(parse_file_number("ixon7a_temp.csv", "ixon"), None);
        assert_eq!(parse_file_number("ixon12.csv", "ixon"), None);
        assert_eq!(parse_file_number("other4a.csv", "ixon"), None);
        assert_eq!(parse_file_number("ixon4a.txt", "ixon"), None);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn failed_save_leaves_no_temp_file() {
        let temp = tempfile::TempDir::new().unwrap();
        // a non-empty directory in the way makes the final rename fail
        let target = temp.path().join("ixon0a.csv");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), "0").unwrap();

        let rows = vec![vec![1, 2], vec![3, 4]];
        assert!(CsvFrameWriter::write_rows(&target, rows.into_iter()).is_err());

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ixon0a.csv"]);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn completed_save_replaces_temp_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let target = temp.path().join("ixon0a.csv");
        CsvFrameWriter::write_rows(&target, vec![vec![5, 6]].into_iter()).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap().trim_end(), "5,6");
        assert!(!temp.path().join("ixon0a_temp.csv").exists());
    }

    #[test]
    fn dated_directory_layout() {
        let settings = StorageSettings {
            save_root: PathBuf::from("/data"),
            folder: "Andor".into(),
            ..StorageSettings::default()
        };
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            save_directory(&settings, date),
            PathBuf::from("/data/2024/03/20240307/Andor")
        );

        let flat = StorageSettings {
            dated_subdirectories: false,
            ..settings
        };
        assert_eq!(save_directory(&flat, date), PathBuf::from("/data/Andor"));
    }

    #[test]
    fn next_number_of_missing_directory_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_file_number(&dir.path().join("absent"), "ixon").unwrap(), 0);
        std::fs::write(dir.path().join("ixon4a.csv"), "1").unwrap();
        std::fs::write(dir.path().join("ixon9b.csv"), "1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "1").unwrap();
        assert_eq!(next_file_number(dir.path(), "ixon").unwrap(), 10);
    }
}
