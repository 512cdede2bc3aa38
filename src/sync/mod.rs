pub mod reconcile;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::auth::oauth::TokenRefresher;
use crate::auth::token_manager::{SessionCredential, TokenManager};
use crate::domain::application::ApplicationRecord;
use crate::error::SyncError;
use crate::extract::extract;
use crate::mail::decoders::{decode_body, normalize_snippet};
use crate::mail::gmail_client::{ListQuery, Mailbox};
use crate::mail::message::MessageRef;
use crate::mail::pages::MessagePages;
use crate::store::repo::{ApplicationRepository, UserRepository};
use crate::sync::reconcile::Reconciler;

pub struct SyncOptions {
    pub query: ListQuery,
    /// Messages fetched at the same time; at least 1.
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            query: ListQuery::default(),
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every listed message was synced.
    Complete,
    /// Some pages or messages were skipped or failed.
    Partial,
    /// Listing failed before any message could be attempted.
    TotalFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub listed: usize,
    pub synced_count: usize,
    /// Messages that vanished between listing and fetching.
    pub skipped: usize,
    pub failed: usize,
    pub pages_failed: usize,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn outcome(&self) -> SyncOutcome {
        if self.listed == 0 && self.pages_failed > 0 {
            SyncOutcome::TotalFailure
        } else if self.skipped + self.failed + self.pages_failed == 0 && !self.cancelled {
            SyncOutcome::Complete
        } else {
            SyncOutcome::Partial
        }
    }
}

enum MessageOutcome {
    Synced(ApplicationRecord),
    Skipped,
    Failed(SyncError),
}

type Clock<'a> = Box<dyn Fn() -> DateTime<Utc> + Send + Sync + 'a>;

/// One on-demand mailbox to application-store synchronization.
pub struct Synchronizer<'a> {
    users: &'a dyn UserRepository,
    applications: &'a dyn ApplicationRepository,
    mailbox: &'a dyn Mailbox,
    refresher: &'a dyn TokenRefresher,
    options: SyncOptions,
    cancel: Arc<AtomicBool>,
    clock: Clock<'a>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        users: &'a dyn UserRepository,
        applications: &'a dyn ApplicationRepository,
        mailbox: &'a dyn Mailbox,
        refresher: &'a dyn TokenRefresher,
        options: SyncOptions,
    ) -> Self {
        Self {
            users,
            applications,
            mailbox,
            refresher,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            clock: Box::new(Utc::now),
        }
    }

    /// Replaces the wall clock used for token expiry and record timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Flag that, once set, stops new messages from being started.
    /// Messages already in flight finish normally.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Lists, fetches, decodes, extracts and reconciles every matching
    /// message of `user_id`.
    ///
    /// Only a missing credential at the start is an error; everything that
    /// goes wrong for a single page or message is counted in the report
    /// instead. `synced_count` is the number of distinct records created
    /// or updated, so an id listed twice counts once.
    pub fn sync_for_user(&self, user_id: &str) -> Result<SyncReport, SyncError> {
        let manager = TokenManager::new(self.users, self.refresher);
        let session = SessionCredential::start(manager, user_id, (self.clock)())?;
        let reconciler = Reconciler::new(self.applications);
        let mut report = SyncReport::default();
        let mut synced = HashSet::new();

        let mut pages = MessagePages::new(
            self.mailbox,
            &session.access_token_at((self.clock)())?,
            &self.options.query,
        );
        loop {
            if self.is_cancelled() {
                info!(
                    "user {user_id}: sync cancelled (next page token {:?})",
                    pages.next_page_token()
                );
                report.cancelled = true;
                break;
            }
            match session.access_token_at((self.clock)()) {
                Ok(token) => pages.set_access_token(&token),
                Err(e) => {
                    warn!("user {user_id}: listing stopped: {e}");
                    report.pages_failed += 1;
                    break;
                }
            }
            let Some(page) = pages.next() else {
                break;
            };
            match page {
                Ok(refs) => {
                    report.listed += refs.len();
                    self.process_page(
                        user_id,
                        &session,
                        &reconciler,
                        &refs,
                        &mut synced,
                        &mut report,
                    );
                }
                Err(e) => {
                    warn!("user {user_id}: listing stopped: {e}");
                    report.pages_failed += 1;
                }
            }
        }
        report.synced_count = synced.len();

        info!(
            "user {user_id}: synced {} of {} listed message(s) ({} skipped, {} failed, {} page(s) failed)",
            report.synced_count, report.listed, report.skipped, report.failed, report.pages_failed
        );
        Ok(report)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Runs the page in fixed-size concurrent batches.
    fn process_page(
        &self,
        user_id: &str,
        session: &SessionCredential<'_>,
        reconciler: &Reconciler<'_>,
        refs: &[MessageRef],
        synced: &mut HashSet<String>,
        report: &mut SyncReport,
    ) {
        for batch in refs.chunks(self.options.concurrency.max(1)) {
            if self.is_cancelled() {
                report.cancelled = true;
                return;
            }

            let outcomes: Vec<MessageOutcome> = thread::scope(|s| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|r| s.spawn(move || self.process_message(user_id, session, reconciler, r)))
                    .collect();
                handles
                    .into_iter()
                    .zip(batch)
                    .map(|(h, r)| {
                        h.join().unwrap_or_else(|_| {
                            MessageOutcome::Failed(SyncError::fetch_failed(
                                r.id.as_str(),
                                "worker thread panicked",
                            ))
                        })
                    })
                    .collect()
            });

            for outcome in outcomes {
                match outcome {
                    MessageOutcome::Synced(record) => {
                        debug!(
                            "message {} -> application {:?} ({})",
                            record.source_message_id, record.application_id, record.status
                        );
                        synced.insert(record.source_message_id);
                    }
                    MessageOutcome::Skipped => report.skipped += 1,
                    MessageOutcome::Failed(e) => {
                        warn!("user {user_id}: {:#}", anyhow::Error::from(e));
                        report.failed += 1;
                    }
                }
            }
        }
    }

    fn process_message(
        &self,
        user_id: &str,
        session: &SessionCredential<'_>,
        reconciler: &Reconciler<'_>,
        r: &MessageRef,
    ) -> MessageOutcome {
        let access_token = match session.access_token_at((self.clock)()) {
            Ok(t) => t,
            Err(e) => return MessageOutcome::Failed(e),
        };
        let msg = match self.mailbox.get(&access_token, &r.id) {
            Ok(m) => m,
            Err(SyncError::NotFound(id)) => {
                info!("message {id} disappeared before it could be fetched, skipping");
                return MessageOutcome::Skipped;
            }
            Err(e) => return MessageOutcome::Failed(e),
        };

        let text = decode_body(&msg);
        debug!(
            "message {} [{}] \"{}\": {}",
            msg.id,
            msg.received_at(),
            msg.subject(),
            normalize_snippet(&text, 80)
        );

        let extracted = extract(&msg.id, &text);
        match reconciler.reconcile_at(user_id, &extracted, (self.clock)()) {
            Ok(record) => MessageOutcome::Synced(record),
            Err(source) => MessageOutcome::Failed(SyncError::Reconcile {
                message_id: msg.id,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_distinguishes_total_failure_from_partial() {
        let total = SyncReport {
            pages_failed: 1,
            ..SyncReport::default()
        };
        assert_eq!(total.outcome(), SyncOutcome::TotalFailure);

        let partial = SyncReport {
            listed: 3,
            synced_count: 2,
            failed: 1,
            ..SyncReport::default()
        };
        assert_eq!(partial.outcome(), SyncOutcome::Partial);

        let later_page_failed = SyncReport {
            listed: 10,
            synced_count: 10,
            pages_failed: 1,
            ..SyncReport::default()
        };
        assert_eq!(later_page_failed.outcome(), SyncOutcome::Partial);

        assert_eq!(SyncReport::default().outcome(), SyncOutcome::Complete);
    }
}
