//! Job persistence.
//!
//! At-least-once writes on status transitions; reads are eventually
//! consistent. The server never re-drives completed or failed jobs on
//! startup, only rows the store reports as still queued.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use thiserror::Error;

use super::error::JobErrorInfo;
use super::job::{Job, JobOptions, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct JobCounts {
    pub created: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl JobCounts {
    pub fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Created => self.created += 1,
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
        self.total += 1;
    }
}

pub trait JobStore: Send + Sync {
    fn save(&self, job: &Job) -> Result<(), StoreError>;
    fn load(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
    fn counts(&self, job_type: Option<&str>) -> Result<JobCounts, StoreError>;
    fn last(&self, job_type: &str, status: JobStatus) -> Result<Option<Job>, StoreError>;
    fn bulk_import(&self, jobs: &[Job]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    pub fn new(db_path: PathBuf) -> Result<Self, StoreError> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<(), StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "\
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT,
                options TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_type_status ON jobs(type, status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
        ",
        )?;
        Ok(())
    }

    fn save_with(conn: &Connection, job: &Job) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO jobs \
             (id, type, status, data, options, progress, result, error, attempts, created_at, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.job_type,
                job.status.as_str(),
                serde_json::to_string(&job.data)?,
                serde_json::to_string(&job.options)?,
                job.progress as i64,
                job.result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.error
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.attempts as i64,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn save(&self, job: &Job) -> Result<(), StoreError> {
        let conn = Connection::open(&self.db_path)?;
        Self::save_with(&conn, job)
    }

    fn load(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(job_type) = &filter.job_type {
            sql.push_str(" AND type = ?");
            args.push(job_type.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), job_from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    fn counts(&self, job_type: Option<&str>) -> Result<JobCounts, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        let (sql, args): (&str, Vec<String>) = match job_type {
            Some(t) => (
                "SELECT status, COUNT(*) FROM jobs WHERE type = ? GROUP BY status",
                vec![t.to_string()],
            ),
            None => ("SELECT status, COUNT(*) FROM jobs GROUP BY status", vec![]),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row?;
            if let Ok(status) = status.parse::<JobStatus>() {
                for _ in 0..count {
                    counts.bump(status);
                }
            }
        }
        Ok(counts)
    }

    fn last(&self, job_type: &str, status: JobStatus) -> Result<Option<Job>, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE type = ?1 AND status = ?2 \
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![job_type, status.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    fn bulk_import(&self, jobs: &[Job]) -> Result<usize, StoreError> {
        let mut conn = Connection::open(&self.db_path)?;
        let tx = conn.transaction()?;
        for job in jobs {
            Self::save_with(&tx, job)?;
        }
        tx.commit()?;
        Ok(jobs.len())
    }
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let parse_blob = |raw: Option<String>| -> Option<serde_json::Value> {
        raw.and_then(|raw| serde_json::from_str(&raw).ok())
    };
    let parse_time = |raw: Option<String>| -> Option<DateTime<Utc>> {
        raw.and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    };

    let status: String = row.get("status")?;
    let options: Option<String> = row.get("options")?;
    let error: Option<String> = row.get("error")?;

    Ok(Job {
        id: row.get("id")?,
        job_type: row.get("type")?,
        status: status.parse().unwrap_or(JobStatus::Failed),
        data: parse_blob(row.get("data")?).unwrap_or(serde_json::Value::Null),
        options: options
            .and_then(|raw| serde_json::from_str::<JobOptions>(&raw).ok())
            .unwrap_or_default(),
        progress: row.get::<_, i64>("progress").unwrap_or(0) as u8,
        result: parse_blob(row.get("result")?),
        error: error.and_then(|raw| serde_json::from_str::<JobErrorInfo>(&raw).ok()),
        created_at: parse_time(row.get("created_at")?).unwrap_or_else(Utc::now),
        started_at: parse_time(row.get("started_at")?),
        completed_at: parse_time(row.get("completed_at")?),
        attempts: row.get::<_, i64>("attempts").unwrap_or(0) as u32,
    })
}

/// In-memory store. Test support and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn save(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs
            .lock()
            .expect("store lock poisoned")
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn load(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|job| {
                filter
                    .job_type
                    .as_ref()
                    .map(|t| &job.job_type == t)
                    .unwrap_or(true)
                    && filter.status.map(|s| job.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn counts(&self, job_type: Option<&str>) -> Result<JobCounts, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            if job_type.map(|t| job.job_type == t).unwrap_or(true) {
                counts.bump(job.status);
            }
        }
        Ok(counts)
    }

    fn last(&self, job_type: &str, status: JobStatus) -> Result<Option<Job>, StoreError> {
        let filter = JobFilter {
            job_type: Some(job_type.to_string()),
            status: Some(status),
            limit: Some(1),
        };
        Ok(self.load(&filter)?.into_iter().next())
    }

    fn bulk_import(&self, jobs: &[Job]) -> Result<usize, StoreError> {
        for job in jobs {
            self.save(job)?;
        }
        Ok(jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::classifier::classify;
    use crate::jobs::error::HandlerError;
    use serde_json::json;

    fn sample_job(id: &str, status: JobStatus) -> Job {
        let mut job = Job::new(
            id.to_string(),
            "repomix".to_string(),
            json!({"repositoryPath": "/srv/repo"}),
            JobOptions {
                max_retries: 4,
                retry_delay_ms: Some(250),
                ..JobOptions::default()
            },
        );
        job.status = status;
        job
    }

    #[test]
    fn sqlite_round_trip_preserves_structure() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::new(dir.path().join("jobs.db")).unwrap();

        let mut job = sample_job("j1", JobStatus::Failed);
        job.started_at = Some(Utc::now());
        job.completed_at = Some(Utc::now());
        job.attempts = 2;
        job.error = Some(classify(&HandlerError::with_code("slow", "timed-out")));
        store.save(&job).unwrap();

        let loaded = store.load(&JobFilter::default()).unwrap();
        assert_eq!(loaded.len(), 1);
        let reloaded = &loaded[0];
        assert_eq!(reloaded.id, job.id);
        assert_eq!(reloaded.job_type, job.job_type);
        assert_eq!(reloaded.status, job.status);
        assert_eq!(reloaded.data, job.data);
        assert_eq!(reloaded.options, job.options);
        assert_eq!(reloaded.error, job.error);
        assert_eq!(reloaded.attempts, job.attempts);
        // rfc3339 keeps sub-second precision, so the timestamps compare equal
        assert_eq!(reloaded.created_at, job.created_at);
        assert_eq!(reloaded.started_at, job.started_at);
    }

    #[test]
    fn save_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::new(dir.path().join("jobs.db")).unwrap();

        let mut job = sample_job("j1", JobStatus::Queued);
        store.save(&job).unwrap();
        job.status = JobStatus::Completed;
        job.result = Some(json!({"ok": true}));
        store.save(&job).unwrap();

        let loaded = store.load(&JobFilter::default()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, JobStatus::Completed);
        assert_eq!(loaded[0].result, Some(json!({"ok": true})));
    }

    #[test]
    fn filter_by_status_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::new(dir.path().join("jobs.db")).unwrap();
        store.save(&sample_job("a", JobStatus::Queued)).unwrap();
        store.save(&sample_job("b", JobStatus::Completed)).unwrap();
        let mut other = sample_job("c", JobStatus::Queued);
        other.job_type = "git-activity".to_string();
        store.save(&other).unwrap();

        let queued = store
            .load(&JobFilter {
                status: Some(JobStatus::Queued),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(queued.len(), 2);

        let repomix_queued = store
            .load(&JobFilter {
                job_type: Some("repomix".to_string()),
                status: Some(JobStatus::Queued),
                ..JobFilter::default()
            })
            .unwrap();
        assert_eq!(repomix_queued.len(), 1);
        assert_eq!(repomix_queued[0].id, "a");
    }

    #[test]
    fn counts_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::new(dir.path().join("jobs.db")).unwrap();
        store.save(&sample_job("a", JobStatus::Completed)).unwrap();
        store.save(&sample_job("b", JobStatus::Completed)).unwrap();
        store.save(&sample_job("c", JobStatus::Failed)).unwrap();

        let counts = store.counts(Some("repomix")).unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total, 3);

        let last = store.last("repomix", JobStatus::Failed).unwrap().unwrap();
        assert_eq!(last.id, "c");
    }

    #[test]
    fn bulk_import_writes_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::new(dir.path().join("jobs.db")).unwrap();
        let jobs: Vec<Job> = (0..10)
            .map(|i| sample_job(&format!("j{i}"), JobStatus::Queued))
            .collect();
        assert_eq!(store.bulk_import(&jobs).unwrap(), 10);
        assert_eq!(store.counts(None).unwrap().queued, 10);
    }

    #[test]
    fn memory_store_matches_trait_contract() {
        let store = MemoryJobStore::new();
        store.save(&sample_job("a", JobStatus::Queued)).unwrap();
        store.save(&sample_job("b", JobStatus::Failed)).unwrap();

        assert_eq!(store.counts(None).unwrap().total, 2);
        assert_eq!(
            store.last("repomix", JobStatus::Failed).unwrap().unwrap().id,
            "b"
        );
    }
}
