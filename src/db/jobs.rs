use anyhow::{Context, Result};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::models::{Job, JobKind, JobStatus, JobStatusEntry, JobWithHistory};

const LATEST_STATUS: &str = "COALESCE((SELECT status FROM job_status_log
     WHERE job_id = j.id ORDER BY created_at DESC, id DESC LIMIT 1), 'Unknown')";

pub async fn create(conn: &Connection, job_id: &str, device_id: &str, kind: JobKind) -> Result<()> {
    let job_id = job_id.to_string();
    let device_id = device_id.to_string();

    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO jobs (id, device_id, kind) VALUES (?1, ?2, ?3)",
            params![&job_id, &device_id, kind.as_str()],
        )?;

        tx.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, ?3, 'Job created waiting for device')",
            params![
                Uuid::now_v7().to_string(),
                &job_id,
                JobStatus::Pending.as_str()
            ],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .context("Failed to create job")?;

    Ok(())
}

pub async fn update_status(
    conn: &Connection,
    job_id: &str,
    status: JobStatus,
    description: Option<String>,
) -> Result<()> {
    let job_id = job_id.to_string();

    conn.call(move |c| {
        c.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::now_v7().to_string(), job_id, status.as_str(), description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .context("Failed to update job status")?;

    Ok(())
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        device_id: row.get(1)?,
        kind: row.get(2)?,
        created_at: row.get(3)?,
        status: row.get(4)?,
    })
}

/// Newest jobs first, optionally only those whose latest status matches.
pub async fn list(
    conn: &Connection,
    limit: u32,
    offset: u32,
    status: Option<String>,
) -> Result<Vec<Job>> {
    conn.call(move |c| {
        let sql = format!(
            "SELECT id, device_id, kind, created_at, status FROM (
                 SELECT j.id, j.device_id, j.kind, j.created_at, {LATEST_STATUS} AS status
                 FROM jobs j
             )
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = c.prepare(&sql)?;
        let rows = stmt.query_map(params![status, limit, offset], job_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .context("Failed to list jobs")
}

pub async fn get_with_history(conn: &Connection, job_id: &str) -> Result<Option<JobWithHistory>> {
    let job_id = job_id.to_string();

    conn.call(move |c| {
        let sql = format!(
            "SELECT j.id, j.device_id, j.kind, j.created_at, {LATEST_STATUS}
             FROM jobs j WHERE j.id = ?1"
        );
        let Some(job) = c
            .query_row(&sql, params![&job_id], job_from_row)
            .optional()?
        else {
            return Ok(None);
        };

        let mut stmt = c.prepare(
            "SELECT status, description, created_at FROM job_status_log
             WHERE job_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let history = stmt
            .query_map(params![&job_id], |row| {
                Ok(JobStatusEntry {
                    status: row.get(0)?,
                    description: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok::<_, rusqlite::Error>(Some(JobWithHistory { job, history }))
    })
    .await
    .context("Failed to load job history")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn test_job_history_is_ordered() {
        let conn = db::open_in_memory().await.unwrap();
        create(&conn, "job-1", "R5CT1", JobKind::Backup).await.unwrap();
        update_status(&conn, "job-1", JobStatus::InProgress, None)
            .await
            .unwrap();
        update_status(
            &conn,
            "job-1",
            JobStatus::Failed,
            Some("device disconnected".to_string()),
        )
        .await
        .unwrap();

        let job = get_with_history(&conn, "job-1").await.unwrap().unwrap();
        assert_eq!(job.job.status, "Failed");
        assert_eq!(job.job.kind, "backup");
        let statuses: Vec<&str> = job.history.iter().map(|h| h.status.as_str()).collect();
        assert_eq!(statuses, vec!["Pending", "InProgress", "Failed"]);
        assert_eq!(
            job.history[2].description.as_deref(),
            Some("device disconnected")
        );
    }

    #[tokio::test]
    async fn test_unknown_job_is_none() {
        let conn = db::open_in_memory().await.unwrap();
        assert!(get_with_history(&conn, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_latest_status() {
        let conn = db::open_in_memory().await.unwrap();
        create(&conn, "job-a", "R5CT1", JobKind::Transfer).await.unwrap();
        create(&conn, "job-b", "R5CT1", JobKind::Screenshot)
            .await
            .unwrap();
        update_status(&conn, "job-b", JobStatus::Completed, None)
            .await
            .unwrap();

        let all = list(&conn, 10, 0, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let done = list(&conn, 10, 0, Some("Completed".to_string()))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "job-b");
    }

    #[tokio::test]
    async fn test_status_for_unknown_job_violates_foreign_key() {
        let conn = db::open_in_memory().await.unwrap();
        assert!(
            update_status(&conn, "nope", JobStatus::Completed, None)
                .await
                .is_err()
        );
    }
}
