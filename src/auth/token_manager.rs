use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::sync::Mutex;

use crate::auth::oauth::TokenRefresher;
use crate::domain::credential::{Credential, StoredTokens, mask_token};
use crate::error::SyncError;
use crate::store::repo::UserRepository;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const FALLBACK_LIFETIME_SECS: i64 = 3500;

/// Hands out valid access credentials for a user, refreshing and
/// persisting them when the cached one has expired.
pub struct TokenManager<'a> {
    users: &'a dyn UserRepository,
    refresher: &'a dyn TokenRefresher,
}

impl<'a> TokenManager<'a> {
    pub fn new(users: &'a dyn UserRepository, refresher: &'a dyn TokenRefresher) -> Self {
        Self { users, refresher }
    }

    pub fn valid_credential(&self, user_id: &str) -> Result<Credential, SyncError> {
        self.valid_credential_at(user_id, Utc::now())
    }

    pub fn valid_credential_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Credential, SyncError> {
        let stored = self
            .users
            .load_tokens(user_id)
            .map_err(|e| SyncError::auth_unavailable(user_id, format!("cannot load tokens: {e:#}")))?
            .ok_or_else(|| SyncError::auth_unavailable(user_id, "unknown user"))?;

        // 1) cached & not expired
        if let Some(cached) = cached_credential(&stored)
            && !cached.is_expired(now)
        {
            debug!("using cached access token for user {user_id}");
            return Ok(cached);
        }

        // 2) refresh if possible
        let refresh_token = stored
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::auth_unavailable(user_id, "no refresh token on file"))?;

        info!(
            "access token for user {user_id} missing or expired; refreshing with {}",
            mask_token(&refresh_token)
        );
        let t = self
            .refresher
            .refresh(&refresh_token)
            .map_err(|e| SyncError::auth_unavailable(user_id, format!("refresh failed: {e:#}")))?;

        let expires_at = expiry_after(now, t.expires_in);

        self.users
            .save_access_token(user_id, &t.access_token, expires_at, t.refresh_token.as_deref())
            .map_err(|e| {
                SyncError::auth_unavailable(user_id, format!("cannot persist refreshed token: {e:#}"))
            })?;

        Ok(Credential {
            access_token: t.access_token,
            refresh_token: t.refresh_token.or(Some(refresh_token)),
            expires_at,
        })
    }
}

/// Credential of one sync run.
///
/// Expiry is re-checked every time a token is handed out, so a run that
/// outlives its token refreshes before the next mailbox call. Concurrent
/// workers wait on the same refresh instead of each starting one.
pub struct SessionCredential<'a> {
    manager: TokenManager<'a>,
    user_id: String,
    current: Mutex<Credential>,
}

impl<'a> SessionCredential<'a> {
    pub fn start(
        manager: TokenManager<'a>,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        let current = manager.valid_credential_at(user_id, now)?;
        Ok(Self {
            manager,
            user_id: user_id.to_string(),
            current: Mutex::new(current),
        })
    }

    pub fn access_token_at(&self, now: DateTime<Utc>) -> Result<String, SyncError> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| SyncError::auth_unavailable(&self.user_id, "credential lock poisoned"))?;
        if current.is_expired(now) {
            debug!("access token for user {} expired mid-run", self.user_id);
            *current = self.manager.valid_credential_at(&self.user_id, now)?;
        }
        Ok(current.access_token.clone())
    }
}

/// `now + expires_in`, or the fallback lifetime when the provider sent
/// nothing usable.
fn expiry_after(now: DateTime<Utc>, expires_in: Option<u64>) -> DateTime<Utc> {
    expires_in
        .and_then(|s| i64::try_from(s).ok())
        .and_then(Duration::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or_else(|| now + Duration::seconds(FALLBACK_LIFETIME_SECS))
}

fn cached_credential(stored: &StoredTokens) -> Option<Credential> {
    let (Some(access_token), Some(expires_at)) = (&stored.access_token, stored.expires_at) else {
        return None;
    };
    Some(Credential {
        access_token: access_token.clone(),
        refresh_token: stored.refresh_token.clone(),
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth::Tokens;
    use crate::store::sqlite::SqliteRepo;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeRefresher {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl TokenRefresher for FakeRefresher {
        fn refresh(&self, refresh_token: &str) -> anyhow::Result<Tokens> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("invalid_grant"));
            }
            Ok(Tokens {
                access_token: format!("fresh-for-{refresh_token}"),
                refresh_token: None,
                expires_in: Some(3600),
            })
        }
    }

    #[test]
    fn reuses_cached_token_until_expiry() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert_user("u1", "me@example.com", Some("rt")).unwrap();
        let now = Utc::now();
        repo.save_access_token("u1", "cached", now + Duration::hours(1), None)
            .unwrap();

        let refresher = FakeRefresher::new(false);
        let mgr = TokenManager::new(&repo, &refresher);
        let cred = mgr.valid_credential_at("u1", now).unwrap();

        assert_eq!(cred.access_token, "cached");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refreshes_expired_token_and_persists_it() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert_user("u1", "me@example.com", Some("rt")).unwrap();
        let now = Utc::now();
        repo.save_access_token("u1", "stale", now - Duration::minutes(5), None)
            .unwrap();

        let refresher = FakeRefresher::new(false);
        let mgr = TokenManager::new(&repo, &refresher);
        let cred = mgr.valid_credential_at("u1", now).unwrap();

        assert_eq!(cred.access_token, "fresh-for-rt");
        assert_eq!(cred.expires_at, now + Duration::seconds(3600));
        assert_eq!(cred.refresh_token.as_deref(), Some("rt"));

        let stored = repo.load_tokens("u1").unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh-for-rt"));
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));

        // second run reuses what the first one persisted
        mgr.valid_credential_at("u1", now).unwrap();
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_range_lifetime_falls_back() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, Some(60)), now + Duration::seconds(60));
        let fallback = now + Duration::seconds(FALLBACK_LIFETIME_SECS);
        assert_eq!(expiry_after(now, None), fallback);
        assert_eq!(expiry_after(now, Some(u64::MAX)), fallback);
        assert_eq!(expiry_after(now, Some(i64::MAX as u64)), fallback);
    }

    #[test]
    fn session_refreshes_once_token_lapses_mid_run() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert_user("u1", "me@example.com", Some("rt")).unwrap();
        let start = Utc::now();
        repo.save_access_token("u1", "cached", start + Duration::seconds(90), None)
            .unwrap();

        let refresher = FakeRefresher::new(false);
        let session =
            SessionCredential::start(TokenManager::new(&repo, &refresher), "u1", start).unwrap();
        assert_eq!(session.access_token_at(start).unwrap(), "cached");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);

        let later = start + Duration::seconds(45);
        assert_eq!(session.access_token_at(later).unwrap(), "fresh-for-rt");
        assert_eq!(session.access_token_at(later).unwrap(), "fresh-for-rt");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_refresh_token_is_auth_unavailable() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert_user("u1", "me@example.com", None).unwrap();
        let refresher = FakeRefresher::new(false);
        let mgr = TokenManager::new(&repo, &refresher);

        let err = mgr.valid_credential("u1").unwrap_err();
        assert!(matches!(err, SyncError::AuthUnavailable { .. }));
        let err = mgr.valid_credential("nobody").unwrap_err();
        assert!(matches!(err, SyncError::AuthUnavailable { .. }));
    }

    #[test]
    fn failed_refresh_is_auth_unavailable() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert_user("u1", "me@example.com", Some("revoked")).unwrap();
        let refresher = FakeRefresher::new(true);
        let mgr = TokenManager::new(&repo, &refresher);

        let err = mgr.valid_credential("u1").unwrap_err();
        assert!(matches!(err, SyncError::AuthUnavailable { .. }));
        assert!(err.to_string().contains("invalid_grant"));
    }
}
