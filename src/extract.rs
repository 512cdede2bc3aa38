//! Label-based field extraction from decoded message text.
//!
//! Each rule looks for a literal label followed by a value on the same
//! line. Rules are independent; the first match of each wins. Markup
//! around the value is tolerated because values stop at the first
//! non-word character, so `<p>Status: Accepted</p>` still yields
//! `Accepted`.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::application::ExtractedRecord;

static APPLICATION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Application ID:[ \t]*(\w+)").expect("valid application id regex"));

// "Under Review" is the only status spelled with two words.
static STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Status:[ \t]*((?i:under[ \t]+review)|\w+)").expect("valid status regex")
});

static INTERVIEW_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Interview Date:[ \t]*(\d{4}-\d{2}-\d{2})").expect("valid interview date regex")
});

/// Applies every rule to `text` and returns what was found for the
/// message `source_message_id`. Never fails; missing labels simply leave
/// the field unset.
pub fn extract(source_message_id: &str, text: &str) -> ExtractedRecord {
    ExtractedRecord {
        source_message_id: source_message_id.to_string(),
        application_id: first_capture(&APPLICATION_ID, text),
        status: first_capture(&STATUS, text),
        interview_date: first_capture(&INTERVIEW_DATE, text)
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        notes: None,
    }
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_all_three_fields() {
        let rec = extract(
            "m1",
            "Application ID: AB123\nStatus: Accepted\nInterview Date: 2024-05-01",
        );
        assert_eq!(rec.source_message_id, "m1");
        assert_eq!(rec.application_id.as_deref(), Some("AB123"));
        assert_eq!(rec.status.as_deref(), Some("Accepted"));
        assert_eq!(rec.interview_date, NaiveDate::from_ymd_opt(2024, 5, 1));
        assert!(rec.notes.is_none());
    }

    #[test]
    fn ignores_surrounding_text() {
        let text = "Dear applicant,\n\nThanks for applying. Your Application ID: X9 is on file.\n\
                    Current Status: Rejected. We wish you luck.\n-- \nGraduate Office";
        let rec = extract("m1", text);
        assert_eq!(rec.application_id.as_deref(), Some("X9"));
        assert_eq!(rec.status.as_deref(), Some("Rejected"));
    }

    #[test]
    fn first_match_wins() {
        let rec = extract("m1", "Status: Submitted\nStatus: Accepted");
        assert_eq!(rec.status.as_deref(), Some("Submitted"));
    }

    #[test]
    fn missing_interview_label_leaves_date_unset() {
        let rec = extract("m1", "Application ID: AB123\nDate: 2024-05-01");
        assert_eq!(rec.interview_date, None);
        assert!(extract("m1", "").is_empty());
    }

    #[test]
    fn unparsable_interview_date_is_dropped() {
        let rec = extract("m1", "Interview Date: 2024-13-45");
        assert_eq!(rec.interview_date, None);
    }

    #[test]
    fn status_is_taken_verbatim() {
        assert_eq!(
            extract("m1", "Status: Waitlisted").status.as_deref(),
            Some("Waitlisted")
        );
        assert_eq!(
            extract("m1", "Status: Under Review").status.as_deref(),
            Some("Under Review")
        );
    }

    #[test]
    fn tolerates_html_markup() {
        let rec = extract(
            "m1",
            "<p>Application ID: <b>AB123</b></p><p>Status: Accepted</p>",
        );
        // the token after the label is markup, so no identifier is found
        assert_eq!(rec.application_id, None);
        assert_eq!(rec.status.as_deref(), Some("Accepted"));
    }

    #[test]
    fn value_must_be_on_the_label_line() {
        let rec = extract("m1", "Application ID:\nStatus: Accepted");
        assert_eq!(rec.application_id, None);
    }
}
