//! Durable CSV tracking tables: the table IS the work queue.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rjp_core::{job_id, JobCategory, JobRecord, FIELD_NAMES};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rjp-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("table parse error: {0}")]
    Csv(#[from] csv::Error),
}

/// Counts reported by an append-only save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub written: usize,
    pub skipped_duplicate: usize,
    pub skipped_no_locator: usize,
}

/// A single CSV tracking table with a fixed header contract.
///
/// All writes rewrite the whole file through a temp-file + rename so a crash
/// mid-save leaves either the previous table or the new one, never a torn
/// file.
#[derive(Debug, Clone)]
pub struct JobTable {
    path: PathBuf,
}

impl JobTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header_matches(&self) -> Result<bool, StoreError> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?;
        Ok(headers.iter().eq(FIELD_NAMES.iter().copied()))
    }

    /// Load every row. A missing file is an empty table. A file whose header
    /// does not match the contract is a foreign schema: it is discarded on
    /// the spot and the load reports an empty table.
    pub fn load(&self) -> Result<Vec<JobRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        if !self.header_matches()? {
            warn!(path = %self.path.display(), "header mismatch, discarding table");
            fs::remove_file(&self.path)?;
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for result in reader.deserialize::<JobRecord>() {
            rows.push(result?);
        }
        Ok(rows)
    }

    /// Replace the whole table atomically.
    pub fn write_all(&self, rows: &[JobRecord]) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        {
            let file = File::create(&temp_path)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer.write_record(FIELD_NAMES)?;
            for row in rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
            let mut file = writer.into_inner().map_err(|e| e.into_error())?;
            file.flush()?;
        }

        match fs::rename(&temp_path, &self.path) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                Err(StoreError::Io(err))
            }
        }
    }

    /// Insert or replace a single row by id, keeping all other rows as-is.
    pub fn upsert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut rows = self.load()?;
        match rows.iter_mut().find(|row| row.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => rows.push(record.clone()),
        }
        self.write_all(&rows)
    }

    /// Append rows that are not already present, keyed by job id. Rows
    /// without an id get one derived from their locator; rows with no usable
    /// locator are dropped and counted.
    pub fn append_unique(
        &self,
        incoming: Vec<JobRecord>,
        default_category: JobCategory,
    ) -> Result<AppendOutcome, StoreError> {
        let mut rows = self.load()?;
        let mut seen: std::collections::HashSet<String> =
            rows.iter().map(|row| row.id.clone()).collect();

        let mut outcome = AppendOutcome::default();
        for mut record in incoming {
            if record.id.trim().is_empty() {
                match job_id(&record.source_url) {
                    Ok(id) => record.id = id,
                    Err(_) => {
                        outcome.skipped_no_locator += 1;
                        continue;
                    }
                }
            }
            if seen.contains(&record.id) {
                outcome.skipped_duplicate += 1;
                continue;
            }
            if record.category.trim().is_empty() {
                record.category = default_category.as_str().to_string();
            }
            seen.insert(record.id.clone());
            rows.push(record);
            outcome.written += 1;
        }

        self.write_all(&rows)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mk_record(url: &str, title: &str) -> JobRecord {
        let mut record = JobRecord::default();
        record.source_url = url.to_string();
        record.title = title.to_string();
        record
    }

    #[test]
    fn missing_file_loads_as_empty_table() {
        let dir = tempdir().expect("tempdir");
        let table = JobTable::new(dir.path().join("jobs.csv"));
        assert!(table.load().expect("load").is_empty());
    }

    #[test]
    fn rows_round_trip_through_the_table() {
        let dir = tempdir().expect("tempdir");
        let table = JobTable::new(dir.path().join("jobs.csv"));

        let mut record = mk_record("https://example.com/jobs/1", "后端工程师");
        record.id = job_id(&record.source_url).expect("id");
        record.created_at = "2026-08-20".to_string();
        table.write_all(std::slice::from_ref(&record)).expect("write");

        let rows = table.load().expect("load");
        assert_eq!(rows, vec![record]);
    }

    #[test]
    fn foreign_header_discards_the_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs.csv");
        fs::write(&path, "id,name\n1,foo\n").expect("seed");

        let table = JobTable::new(&path);
        let rows = table.load().expect("load");
        assert!(rows.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn append_unique_skips_existing_ids_and_fills_defaults() {
        let dir = tempdir().expect("tempdir");
        let table = JobTable::new(dir.path().join("jobs.csv"));

        let first = table
            .append_unique(
                vec![
                    mk_record("https://example.com/jobs/1", "a"),
                    mk_record("https://example.com/jobs/2", "b"),
                    mk_record("", "no locator"),
                ],
                JobCategory::Domestic,
            )
            .expect("first append");
        assert_eq!(first.written, 2);
        assert_eq!(first.skipped_no_locator, 1);

        let second = table
            .append_unique(
                vec![
                    mk_record("https://example.com/jobs/2?utm=x", "b again"),
                    mk_record("https://example.com/jobs/3", "c"),
                ],
                JobCategory::Web3,
            )
            .expect("second append");
        assert_eq!(second.written, 1);
        assert_eq!(second.skipped_duplicate, 1);

        let rows = table.load().expect("load");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].category, "国内");
        assert_eq!(rows[2].category, "web3");
    }

    #[test]
    fn upsert_replaces_matching_row_only() {
        let dir = tempdir().expect("tempdir");
        let table = JobTable::new(dir.path().join("jobs.csv"));

        let mut a = mk_record("https://example.com/jobs/1", "a");
        a.id = job_id(&a.source_url).expect("id");
        let mut b = mk_record("https://example.com/jobs/2", "b");
        b.id = job_id(&b.source_url).expect("id");
        table.write_all(&[a.clone(), b.clone()]).expect("seed");

        a.title_chinese = "后端工程师".to_string();
        a.is_remote = "1".to_string();
        table.upsert(&a).expect("upsert");

        let rows = table.load().expect("load");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].title_chinese, "后端工程师");
        assert_eq!(rows[1], b);
    }

    #[test]
    fn rewrites_leave_no_temp_files_behind() {
        let dir = tempdir().expect("tempdir");
        let table = JobTable::new(dir.path().join("jobs.csv"));
        table
            .write_all(&[mk_record("https://example.com/jobs/1", "a")])
            .expect("write");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
