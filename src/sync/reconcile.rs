use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::application::{ApplicationRecord, ApplicationStatus, ExtractedRecord};
use crate::store::repo::ApplicationRepository;

/// Merges extracted records into the application store.
///
/// Lookup and write for the same (user, message) pair happen under one
/// per-key lock, so a message listed twice in a run cannot lose an update.
pub struct Reconciler<'a> {
    repo: &'a dyn ApplicationRepository,
    locks: KeyLocks,
}

impl<'a> Reconciler<'a> {
    pub fn new(repo: &'a dyn ApplicationRepository) -> Self {
        Self {
            repo,
            locks: KeyLocks::default(),
        }
    }

    pub fn reconcile(&self, user_id: &str, extracted: &ExtractedRecord) -> Result<ApplicationRecord> {
        self.reconcile_at(user_id, extracted, Utc::now())
    }

    pub fn reconcile_at(
        &self,
        user_id: &str,
        extracted: &ExtractedRecord,
        now: DateTime<Utc>,
    ) -> Result<ApplicationRecord> {
        let key = self.locks.get(user_id, &extracted.source_message_id);
        let _guard = key
            .lock()
            .map_err(|_| anyhow!("reconcile lock poisoned"))?;

        let existing = self
            .repo
            .find_by_source(user_id, &extracted.source_message_id)?;
        let created = existing.is_none();
        let merged = merge(existing, user_id, extracted, now);

        self.repo.upsert(&merged)?;
        debug!(
            "{} application record for message {} (status {})",
            if created { "created" } else { "updated" },
            merged.source_message_id,
            merged.status
        );
        Ok(merged)
    }
}

/// Pure merge step: starts from `existing` (or a fresh record stamped
/// `now`) and overwrites only what the email mentioned.
///
/// A status that is not one of the known values is dropped and the
/// previous (or default) status stays.
pub fn merge(
    existing: Option<ApplicationRecord>,
    user_id: &str,
    extracted: &ExtractedRecord,
    now: DateTime<Utc>,
) -> ApplicationRecord {
    let mut record = existing
        .unwrap_or_else(|| ApplicationRecord::new(user_id, &extracted.source_message_id, now));

    if let Some(id) = &extracted.application_id {
        record.application_id = Some(id.clone());
    }
    if let Some(raw) = &extracted.status {
        match raw.parse::<ApplicationStatus>() {
            Ok(status) => record.status = status,
            Err(e) => debug!(
                "message {}: {e}, keeping {}",
                extracted.source_message_id, record.status
            ),
        }
    }
    if let Some(date) = extracted.interview_date {
        record.interview_date = Some(date);
    }

    record
}

#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn get(&self, user_id: &str, source_message_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry((user_id.to_string(), source_message_id.to_string()))
            .or_default()
            .clone()
    }
}
