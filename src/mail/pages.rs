use log::debug;

use crate::error::SyncError;
use crate::mail::gmail_client::{ListQuery, Mailbox};
use crate::mail::message::MessageRef;

/// Lazily walks every page of a listing.
///
/// Yields one item per list call. The walk ends after a page without a
/// next-page token, or right after the first error: without the token of
/// the failed page there is nothing to continue from.
pub struct MessagePages<'a> {
    mailbox: &'a dyn Mailbox,
    access_token: String,
    query: &'a ListQuery,
    next: Option<String>,
    done: bool,
}

impl<'a> MessagePages<'a> {
    pub fn new(mailbox: &'a dyn Mailbox, access_token: &str, query: &'a ListQuery) -> Self {
        Self::resume(mailbox, access_token, query, None)
    }

    /// Continue a walk from a previously seen page token.
    pub fn resume(
        mailbox: &'a dyn Mailbox,
        access_token: &str,
        query: &'a ListQuery,
        page_token: Option<String>,
    ) -> Self {
        Self {
            mailbox,
            access_token: access_token.to_string(),
            query,
            next: page_token,
            done: false,
        }
    }

    /// Access token used for the following list calls.
    pub fn set_access_token(&mut self, access_token: &str) {
        self.access_token = access_token.to_string();
    }

    /// Token to pass to `resume` to pick up where this walk stopped.
    pub fn next_page_token(&self) -> Option<&str> {
        self.next.as_deref()
    }
}

impl Iterator for MessagePages<'_> {
    type Item = Result<Vec<MessageRef>, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self
            .mailbox
            .list(&self.access_token, self.query, self.next.as_deref())
        {
            Ok(page) => {
                debug!(
                    "listed {} message(s), next page: {}",
                    page.refs.len(),
                    page.next_page_token.is_some()
                );
                self.done = page.next_page_token.is_none();
                self.next = page.next_page_token;
                Some(Ok(page.refs))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
