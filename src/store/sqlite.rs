use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::{Mutex, MutexGuard};

use crate::domain::application::{ApplicationRecord, ApplicationStatus, ManualEdit};
use crate::domain::credential::StoredTokens;
use crate::store::repo::{ApplicationRepository, UserRepository};

pub struct SqliteRepo {
    conn: Mutex<Connection>,
}

impl SqliteRepo {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create database directory {parent:?}"))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("cannot open database {path:?}"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.migrate()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS users (
                id              TEXT PRIMARY KEY,
                email           TEXT NOT NULL,
                refresh_token   TEXT,
                access_token    TEXT,
                token_expiry    TEXT
            );

            CREATE TABLE IF NOT EXISTS applications (
                id                  INTEGER PRIMARY KEY,
                user_id             TEXT NOT NULL,
                source_message_id   TEXT NOT NULL,
                application_id      TEXT,
                status              TEXT NOT NULL,
                interview_date      TEXT,
                submission_date     TEXT NOT NULL,
                notes               TEXT NOT NULL DEFAULT '',
                UNIQUE(user_id, source_message_id)
            );
            "#,
        )?;
        Ok(())
    }
}

const APPLICATION_COLUMNS: &str = "user_id, source_message_id, application_id, status, \
     interview_date, submission_date, notes";

fn application_from_row(r: &Row<'_>) -> rusqlite::Result<ApplicationRecord> {
    let status: String = r.get(3)?;
    let status = status
        .parse::<ApplicationStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(ApplicationRecord {
        user_id: r.get(0)?,
        source_message_id: r.get(1)?,
        application_id: r.get(2)?,
        status,
        interview_date: r.get(4)?,
        submission_date: r.get(5)?,
        notes: r.get(6)?,
    })
}

fn find_application(
    conn: &Connection,
    user_id: &str,
    source_message_id: &str,
) -> Result<Option<ApplicationRecord>> {
    let sql = format!(
        "SELECT {APPLICATION_COLUMNS} FROM applications \
         WHERE user_id=?1 AND source_message_id=?2"
    );
    Ok(conn
        .query_row(&sql, params![user_id, source_message_id], application_from_row)
        .optional()?)
}

fn upsert_application(conn: &Connection, record: &ApplicationRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO applications
            (user_id, source_message_id, application_id, status,
             interview_date, submission_date, notes)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(user_id, source_message_id) DO UPDATE SET
          application_id=excluded.application_id,
          status=excluded.status,
          interview_date=excluded.interview_date,
          submission_date=excluded.submission_date,
          notes=excluded.notes
        "#,
        params![
            record.user_id,
            record.source_message_id,
            record.application_id,
            record.status.as_str(),
            record.interview_date,
            record.submission_date,
            record.notes,
        ],
    )?;
    Ok(())
}

impl UserRepository for SqliteRepo {
    fn load_tokens(&self, user_id: &str) -> Result<Option<StoredTokens>> {
        let conn = self.conn()?;
        let tokens = conn
            .query_row(
                "SELECT refresh_token, access_token, token_expiry FROM users WHERE id=?1",
                params![user_id],
                |r| {
                    Ok(StoredTokens {
                        refresh_token: r.get(0)?,
                        access_token: r.get(1)?,
                        expires_at: r.get::<_, Option<DateTime<Utc>>>(2)?,
                    })
                },
            )
            .optional()?;
        Ok(tokens)
    }

    fn save_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        refresh_token: Option<&str>,
    ) -> Result<()> {
        let updated = self.conn()?.execute(
            r#"
            UPDATE users SET
              access_token=?2,
              token_expiry=?3,
              refresh_token=COALESCE(?4, refresh_token)
            WHERE id=?1
            "#,
            params![user_id, access_token, expires_at, refresh_token],
        )?;
        if updated == 0 {
            return Err(anyhow!("user {user_id} not found"));
        }
        Ok(())
    }

    fn upsert_user(&self, user_id: &str, email: &str, refresh_token: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO users (id, email, refresh_token) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
              email=excluded.email,
              refresh_token=COALESCE(excluded.refresh_token, users.refresh_token)
            "#,
            params![user_id, email, refresh_token],
        )?;
        Ok(())
    }
}

impl ApplicationRepository for SqliteRepo {
    fn find_by_source(
        &self,
        user_id: &str,
        source_message_id: &str,
    ) -> Result<Option<ApplicationRecord>> {
        let conn = self.conn()?;
        find_application(&conn, user_id, source_message_id)
    }

    fn upsert(&self, record: &ApplicationRecord) -> Result<()> {
        let conn = self.conn()?;
        upsert_application(&conn, record)
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<ApplicationRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications \
             WHERE user_id=?1 ORDER BY submission_date DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], application_from_row)?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn apply_manual_edit(
        &self,
        user_id: &str,
        source_message_id: &str,
        edit: &ManualEdit,
    ) -> Result<Option<ApplicationRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(mut record) = find_application(&tx, user_id, source_message_id)? else {
            return Ok(None);
        };
        if let Some(status) = edit.status {
            record.status = status;
        }
        if let Some(date) = edit.interview_date {
            record.interview_date = Some(date);
        }
        if let Some(notes) = &edit.notes {
            record.notes = notes.clone();
        }
        upsert_application(&tx, &record)?;

        tx.commit()?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn record(user: &str, msg: &str) -> ApplicationRecord {
        ApplicationRecord {
            application_id: Some("AB123".into()),
            interview_date: NaiveDate::from_ymd_opt(2024, 5, 1),
            ..ApplicationRecord::new(user, msg, Utc.with_ymd_and_hms(2024, 4, 1, 9, 30, 0).unwrap())
        }
    }

    #[test]
    fn upsert_keeps_one_row_per_user_and_message() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        let mut rec = record("u1", "m1");
        repo.upsert(&rec).unwrap();

        rec.status = ApplicationStatus::Accepted;
        repo.upsert(&rec).unwrap();
        repo.upsert(&record("u2", "m1")).unwrap();

        let rows = repo.list_for_user("u1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ApplicationStatus::Accepted);
        assert_eq!(repo.find_by_source("u2", "m1").unwrap(), Some(record("u2", "m1")));
        assert_eq!(repo.find_by_source("u1", "nope").unwrap(), None);
    }

    #[test]
    fn manual_edit_touches_only_given_fields() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert(&record("u1", "m1")).unwrap();

        let edited = repo
            .apply_manual_edit(
                "u1",
                "m1",
                &ManualEdit {
                    notes: Some("called the department".into()),
                    ..ManualEdit::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(edited.notes, "called the department");
        assert_eq!(edited.application_id.as_deref(), Some("AB123"));
        assert_eq!(repo.find_by_source("u1", "m1").unwrap(), Some(edited));

        let missing = repo
            .apply_manual_edit("u1", "m2", &ManualEdit::default())
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn refreshed_tokens_keep_refresh_token_unless_rotated() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert_user("u1", "me@example.com", Some("refresh-1")).unwrap();
        assert_eq!(
            repo.load_tokens("u1").unwrap(),
            Some(StoredTokens {
                refresh_token: Some("refresh-1".into()),
                ..StoredTokens::default()
            })
        );

        let exp = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        repo.save_access_token("u1", "access-1", exp, None).unwrap();
        let t = repo.load_tokens("u1").unwrap().unwrap();
        assert_eq!(t.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(t.access_token.as_deref(), Some("access-1"));
        assert_eq!(t.expires_at, Some(exp));

        repo.save_access_token("u1", "access-2", exp + Duration::hours(1), Some("refresh-2"))
            .unwrap();
        let t = repo.load_tokens("u1").unwrap().unwrap();
        assert_eq!(t.refresh_token.as_deref(), Some("refresh-2"));

        assert!(repo.save_access_token("ghost", "a", exp, None).is_err());
        assert!(repo.load_tokens("ghost").unwrap().is_none());
    }

    #[test]
    fn records_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("applications.db");
        {
            let repo = SqliteRepo::open(&path).unwrap();
            repo.upsert(&record("u1", "m1")).unwrap();
        }
        let repo = SqliteRepo::open(&path).unwrap();
        assert_eq!(repo.find_by_source("u1", "m1").unwrap(), Some(record("u1", "m1")));
    }
}
