use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::domain::application::{ApplicationRecord, ManualEdit};
use crate::domain::credential::StoredTokens;

pub trait UserRepository: Send + Sync {
    /// `None` when the user is unknown.
    fn load_tokens(&self, user_id: &str) -> Result<Option<StoredTokens>>;

    /// Stores a refreshed access token. A `refresh_token` of `None` keeps
    /// the one already on file.
    fn save_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        refresh_token: Option<&str>,
    ) -> Result<()>;

    fn upsert_user(&self, user_id: &str, email: &str, refresh_token: Option<&str>) -> Result<()>;
}

pub trait ApplicationRepository: Send + Sync {
    fn find_by_source(
        &self,
        user_id: &str,
        source_message_id: &str,
    ) -> Result<Option<ApplicationRecord>>;

    /// Insert or replace the row keyed by (user_id, source_message_id).
    fn upsert(&self, record: &ApplicationRecord) -> Result<()>;

    fn list_for_user(&self, user_id: &str) -> Result<Vec<ApplicationRecord>>;

    /// Returns the edited record, or `None` if it does not exist.
    fn apply_manual_edit(
        &self,
        user_id: &str,
        source_message_id: &str,
        edit: &ManualEdit,
    ) -> Result<Option<ApplicationRecord>>;
}
