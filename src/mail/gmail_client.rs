use log::debug;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use url::Url;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::mail::message::{ListResponse, MessagePage, MessageRef, RawMessage};

/// Filter and page size of a message listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub query: String,
    pub max_results: u32,
}

impl From<&SyncConfig> for ListQuery {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            query: cfg.query.clone(),
            max_results: cfg.max_results,
        }
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Read-only access to a user's mailbox.
pub trait Mailbox: Send + Sync {
    /// One page of references matching `query`. No retries.
    fn list(
        &self,
        access_token: &str,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, SyncError>;

    /// Full message: headers, bodies and MIME structure.
    fn get(&self, access_token: &str, message_id: &str) -> Result<RawMessage, SyncError>;
}

pub struct GmailClient {
    http: Client,
    api_base: Url,
}

impl GmailClient {
    pub fn new(api_base: &str) -> anyhow::Result<Self> {
        let api_base = Url::parse(api_base.trim_end_matches('/'))?;
        if api_base.cannot_be_a_base() {
            anyhow::bail!("gmail api base {api_base} cannot be used as a base url");
        }
        Ok(Self {
            http: Client::builder().build()?,
            api_base,
        })
    }

    fn messages_url(&self, message_id: Option<&str>) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["users", "me", "messages"]);
            if let Some(id) = message_id {
                segments.push(id);
            }
        }
        url
    }
}

/// How a 404 from the endpoint is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Missing {
    /// The message was deleted after listing.
    NotFound,
    /// Nothing can legitimately disappear; any 404 is a failure.
    Failed,
}

fn check_status(resp: Response, target: &str, missing: Missing) -> Result<Response, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(status_error(status, target, &body, missing))
}

fn status_error(status: StatusCode, target: &str, body: &str, missing: Missing) -> SyncError {
    if status == StatusCode::NOT_FOUND && missing == Missing::NotFound {
        return SyncError::NotFound(target.to_string());
    }
    let body: String = body.chars().take(200).collect();
    SyncError::fetch_failed(target, format!("status={status} body={body}"))
}

impl Mailbox for GmailClient {
    fn list(
        &self,
        access_token: &str,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> Result<MessagePage, SyncError> {
        let target = "message list";
        let mut url = self.messages_url(None);
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", &query.query)
                .append_pair("maxResults", &query.max_results.to_string());
            if let Some(pt) = page_token {
                pairs.append_pair("pageToken", pt);
            }
        }
        debug!("GET {}", url.path());

        let resp = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .map_err(|e| SyncError::fetch_failed(target, e))?;
        let list: ListResponse = check_status(resp, target, Missing::Failed)?
            .json()
            .map_err(|e| SyncError::fetch_failed(target, e))?;

        let page_token = page_token.map(str::to_string);
        Ok(MessagePage {
            refs: list
                .messages
                .into_iter()
                .map(|m| MessageRef {
                    id: m.id,
                    page_token: page_token.clone(),
                })
                .collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn get(&self, access_token: &str, message_id: &str) -> Result<RawMessage, SyncError> {
        let mut url = self.messages_url(Some(message_id));
        url.query_pairs_mut().append_pair("format", "full");
        debug!("GET {}", url.path());

        let resp = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .map_err(|e| SyncError::fetch_failed(message_id, e))?;
        check_status(resp, message_id, Missing::NotFound)?
            .json()
            .map_err(|e| SyncError::fetch_failed(message_id, e))
    }
}
