//! Bridge between assistant function calls and the booking review modal

use serde_json::Value;
use tracing::{debug, info};

use crate::config::REVIEW_BOOKING_DETAILS;
use crate::protocol::{FunctionCall, ToolResponse};

/// Heading shown above the draft.
pub const DRAFT_TITLE: &str = "Confirm Your Request";

/// Lead details collected by the assistant. Fields the assistant left out,
/// or sent as something other than a non-empty string, are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookingDraft {
    pub first_name: Option<String>,
    pub service_type: Option<String>,
    pub user_type: Option<String>,
    pub preferred_day: Option<String>,
    pub time_preference: Option<String>,
}

impl BookingDraft {
    pub fn from_args(args: &Value) -> Self {
        let field = |name: &str| {
            args.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            first_name: field("firstName"),
            service_type: field("serviceType"),
            user_type: field("userType"),
            preferred_day: field("preferredDay"),
            time_preference: field("timePreference"),
        }
    }

    /// Label/value pairs in display order, with placeholders for gaps.
    pub fn rows(&self) -> [(&'static str, &str); 5] {
        [
            ("Name", or(&self.first_name, "Not provided")),
            ("Service", or(&self.service_type, "Not specified")),
            ("Type", or(&self.user_type, "Not specified")),
            ("Timing", or(&self.preferred_day, "Not specified")),
            ("Preference", or(&self.time_preference, "Not specified")),
        ]
    }
}

fn or<'a>(value: &'a Option<String>, fallback: &'static str) -> &'a str {
    value.as_deref().unwrap_or(fallback)
}

/// A displayed draft awaiting the user's decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub draft: BookingDraft,
}

/// What to do about one inbound batch of function calls.
#[derive(Debug, Default, PartialEq)]
pub struct ToolCallOutcome {
    /// Draft to display, if the batch asked for a review.
    pub pending: Option<PendingToolCall>,
    /// Acknowledgment to send back, one entry per call in the batch.
    pub response: Option<ToolResponse>,
}

/// Decide how to answer a batch of function calls.
///
/// When any call is `reviewBookingDetails`, the first such call becomes the
/// pending draft and every call in the batch is acknowledged at once, before
/// the user has decided anything. Batches without a review call are left
/// unanswered.
pub fn bridge(calls: &[FunctionCall]) -> ToolCallOutcome {
    let Some(review) = calls.iter().find(|c| c.name == REVIEW_BOOKING_DETAILS) else {
        debug!(
            "No review call among {:?}",
            calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
        );
        return ToolCallOutcome::default();
    };

    info!("Displaying booking draft for call {}", review.id);
    ToolCallOutcome {
        pending: Some(PendingToolCall {
            id: review.id.clone(),
            draft: BookingDraft::from_args(&review.args),
        }),
        response: Some(ToolResponse::displayed(calls.iter().map(|c| c.id.as_str()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TOOL_RESULT_DISPLAYED;
    use serde_json::json;

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn test_review_call_shows_draft_and_acknowledges() {
        let outcome = bridge(&[call(
            "c1",
            REVIEW_BOOKING_DETAILS,
            json!({
                "firstName": "Ana",
                "serviceType": "Personal Tax",
                "userType": "Individual",
                "preferredDay": "This Week",
                "timePreference": "Morning"
            }),
        )]);

        let pending = outcome.pending.unwrap();
        assert_eq!(pending.id, "c1");
        assert_eq!(
            pending.draft.rows(),
            [
                ("Name", "Ana"),
                ("Service", "Personal Tax"),
                ("Type", "Individual"),
                ("Timing", "This Week"),
                ("Preference", "Morning"),
            ]
        );

        let response = outcome.response.unwrap();
        assert_eq!(response.function_responses.len(), 1);
        assert_eq!(response.function_responses[0].id, "c1");
        assert_eq!(response.function_responses[0].response.result, TOOL_RESULT_DISPLAYED);
    }

    #[test]
    fn test_missing_fields_use_placeholders() {
        let outcome = bridge(&[call("c1", REVIEW_BOOKING_DETAILS, json!({"firstName": "", "userType": 7}))]);
        let draft = outcome.pending.unwrap().draft;
        assert_eq!(draft.rows()[0], ("Name", "Not provided"));
        assert_eq!(draft.rows()[2], ("Type", "Not specified"));

        let no_args = bridge(&[call("c2", REVIEW_BOOKING_DETAILS, Value::Null)]);
        assert_eq!(no_args.pending.unwrap().draft, BookingDraft::default());
    }

    #[test]
    fn test_batch_acknowledged_together_first_review_wins() {
        let outcome = bridge(&[
            call("a", "lookupHours", json!({})),
            call("b", REVIEW_BOOKING_DETAILS, json!({"firstName": "First"})),
            call("c", REVIEW_BOOKING_DETAILS, json!({"firstName": "Second"})),
        ]);
        let pending = outcome.pending.unwrap();
        assert_eq!(pending.id, "b");
        assert_eq!(pending.draft.first_name.as_deref(), Some("First"));

        let ids: Vec<_> = outcome
            .response
            .unwrap()
            .function_responses
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_batch_without_review_is_unanswered() {
        assert_eq!(bridge(&[call("x", "somethingElse", json!({}))]), ToolCallOutcome::default());
        assert_eq!(bridge(&[]), ToolCallOutcome::default());
    }
}
