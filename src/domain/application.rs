use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ApplicationStatus {
    #[default]
    Submitted,
    #[serde(rename = "Under Review")]
    UnderReview,
    Accepted,
    Rejected,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::UnderReview => "Under Review",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown application status {:?}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// Case-insensitive; `Under Review`, `under_review` and `UnderReview` are
/// all accepted.
impl FromStr for ApplicationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        match folded.as_str() {
            "submitted" => Ok(Self::Submitted),
            "underreview" => Ok(Self::UnderReview),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Output of the field extractor for one message.
///
/// Every optional slot means "not mentioned in this email" when `None`;
/// the reconciler leaves the stored value alone in that case.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedRecord {
    pub source_message_id: String,
    pub application_id: Option<String>,
    /// Taken verbatim from the email; validated against
    /// `ApplicationStatus` only at reconciliation time.
    pub status: Option<String>,
    pub interview_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl ExtractedRecord {
    pub fn is_empty(&self) -> bool {
        self.application_id.is_none()
            && self.status.is_none()
            && self.interview_date.is_none()
            && self.notes.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub user_id: String,
    pub application_id: Option<String>,
    pub status: ApplicationStatus,
    pub interview_date: Option<NaiveDate>,
    pub submission_date: DateTime<Utc>,
    pub notes: String,
    pub source_message_id: String,
}

impl ApplicationRecord {
    pub fn new(user_id: &str, source_message_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            application_id: None,
            status: ApplicationStatus::default(),
            interview_date: None,
            submission_date: now,
            notes: String::new(),
            source_message_id: source_message_id.to_string(),
        }
    }

    pub fn has_upcoming_interview(&self, today: NaiveDate) -> bool {
        self.interview_date.is_some_and(|d| d >= today)
    }
}

/// Manual changes made by the user outside of a sync run.
#[derive(Debug, Clone, Default)]
pub struct ManualEdit {
    pub status: Option<ApplicationStatus>,
    pub interview_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

/// "May 1, 2024"
pub fn format_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_leniently() {
        assert_eq!("Accepted".parse(), Ok(ApplicationStatus::Accepted));
        assert_eq!("rejected".parse(), Ok(ApplicationStatus::Rejected));
        assert_eq!("Under Review".parse(), Ok(ApplicationStatus::UnderReview));
        assert_eq!("under_review".parse(), Ok(ApplicationStatus::UnderReview));
        assert!("Pending".parse::<ApplicationStatus>().is_err());
        assert!("".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn status_display_uses_human_labels() {
        assert_eq!(ApplicationStatus::UnderReview.to_string(), "Under Review");
        assert_eq!(ApplicationStatus::default(), ApplicationStatus::Submitted);
    }

    #[test]
    fn formats_dates_long_form() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(format_date(d), "May 1, 2024");
    }

    #[test]
    fn upcoming_interview_includes_today() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut rec = ApplicationRecord::new("u1", "m1", Utc::now());
        assert!(!rec.has_upcoming_interview(today));

        rec.interview_date = Some(today);
        assert!(rec.has_upcoming_interview(today));

        rec.interview_date = today.pred_opt();
        assert!(!rec.has_upcoming_interview(today));
    }
}
