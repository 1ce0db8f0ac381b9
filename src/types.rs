//! # Core Types for the Ballot Core
//!
//! This module defines the records the rest of the crate reads and writes:
//! the poll definition (poll, questions, options), the allow-list used by
//! listed polls, and the ballot/vote records produced by voters.
//!
//! ## Lifecycle
//!
//! - A [`Poll`] is drafted by its owner, then frozen exactly once by commit.
//!   After commit its [`Question`] and [`PollOption`] set never changes.
//! - A [`Ballot`] is opened by the eligibility gate and submitted exactly once.
//! - A [`Vote`] is written only as part of a successful submission and is
//!   never updated.
//!
//! ## Usage Examples
//!
//! ```rust
//! use ballotbox::types::*;
//! use chrono::{Duration, Utc};
//! use uuid::Uuid;
//!
//! let now = Utc::now();
//! let poll = Poll {
//!     id: Uuid::new_v4(),
//!     owner_id: "owner-1".to_string(),
//!     title: "Team lunch".to_string(),
//!     description: None,
//!     visibility: Visibility::Public,
//!     identity_mode: IdentityMode::Anonymous,
//!     opens_at: Some(now + Duration::hours(1)),
//!     closes_at: None,
//!     committed_at: None,
//!     definition_hash: None,
//!     version: 1,
//!     created_at: now,
//! };
//!
//! assert!(!poll.is_committed());
//! assert_eq!(poll.window_state(now), WindowState::NotYetOpen);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::IpAddr;
use uuid::Uuid;
use validator::{Validate, ValidateEmail, ValidateLength, ValidationError};

pub type PollId = Uuid;
pub type QuestionId = Uuid;
pub type OptionId = Uuid;
pub type BallotId = Uuid;
pub type VoteId = Uuid;
pub type EligibilityListId = Uuid;
pub type EligibilityItemId = Uuid;

/// Stable owner identity handed out by the session provider
pub type OwnerId = String;

/// All persisted instants are UTC
pub type Timestamp = DateTime<Utc>;

/// Maximum stored length of a free-text answer, in characters
pub const MAX_FREE_TEXT_CHARS: usize = 4000;

/// Who may see and vote on a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Anyone with the link
    Public,
    /// Restricted to the poll's eligibility list
    Listed,
}

/// Whether ballots are tied to an email address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    Anonymous,
    Identified,
}

/// Shape of the answer a question accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    /// Zero or one option
    Single,
    /// Any subset of options
    Multi,
    /// Any subset of options; stored like `Multi`, not resolved as a ranking
    Ranked,
    /// Optional free text
    Text,
}

impl QuestionKind {
    /// Choice kinds carry options, `Text` does not
    pub fn is_choice(self) -> bool {
        !matches!(self, Self::Text)
    }
}

/// Where `now` falls relative to a poll's voting window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    NotYetOpen,
    Open,
    Closed,
}

/// A poll and its lifecycle metadata
///
/// A poll starts as a draft (`committed_at = None`). Commit sets
/// `committed_at` and `definition_hash` together, once; from then on the
/// question/option set is frozen and ballots may be opened inside the
/// `[opens_at, closes_at]` window. Either bound may be absent, meaning
/// unbounded on that side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Poll {
    pub id: PollId,

    /// Owner reference; only the owner may edit or commit
    pub owner_id: OwnerId,

    pub title: String,

    pub description: Option<String>,

    pub visibility: Visibility,

    pub identity_mode: IdentityMode,

    /// Voting opens at this instant (inclusive); `None` means already open
    pub opens_at: Option<Timestamp>,

    /// Voting closes at this instant (inclusive); `None` means never.
    /// Also drives the expiry sweep.
    pub closes_at: Option<Timestamp>,

    /// Set exactly once by commit
    pub committed_at: Option<Timestamp>,

    /// Content hash over the canonical definition, set at commit
    pub definition_hash: Option<String>,

    /// Bumped on every pre-commit definition change
    pub version: u32,

    pub created_at: Timestamp,
}

impl Poll {
    pub fn is_committed(&self) -> bool {
        self.committed_at.is_some()
    }

    /// Classify `now` against the voting window (both bounds inclusive)
    pub fn window_state(&self, now: Timestamp) -> WindowState {
        if self.opens_at.is_some_and(|opens| now < opens) {
            return WindowState::NotYetOpen;
        }
        if self.closes_at.is_some_and(|closes| now > closes) {
            return WindowState::Closed;
        }
        WindowState::Open
    }

    /// Expired polls are removed by the maintenance sweep
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.closes_at.is_some_and(|closes| closes < now)
    }
}

/// One question of a poll, ordered among siblings by `order_index`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: QuestionId,
    pub poll_id: PollId,
    pub kind: QuestionKind,
    pub prompt: String,
    pub order_index: u32,
}

/// A selectable option of a choice question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollOption {
    pub id: OptionId,
    pub question_id: QuestionId,
    pub label: String,
    pub order_index: u32,
}

/// Allow-list attached to a listed poll
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibilityList {
    pub id: EligibilityListId,
    pub poll_id: PollId,
    pub name: String,
    pub created_at: Timestamp,
}

/// One allowed email address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibilityItem {
    pub id: EligibilityItemId,
    pub list_id: EligibilityListId,
    /// Stored normalized (trimmed, lower-cased)
    pub email: String,
    pub display_name: Option<String>,
    /// An invitation was delivered at commit
    pub invited: bool,
    /// The address has submitted a ballot
    pub redeemed: bool,
    pub created_at: Timestamp,
}

/// Allow-list written together with a listed poll
#[derive(Debug, Clone, PartialEq)]
pub struct AllowList {
    pub list: EligibilityList,
    pub items: Vec<EligibilityItem>,
}

/// One attempt to vote on a poll by one voter identity
///
/// `submitted_at = None` means open; once set the ballot is terminal.
/// Fraud signals are stored only as salted hashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ballot {
    pub id: BallotId,
    pub poll_id: PollId,
    /// Voter email, present only for identified polls
    pub voter_ref: Option<String>,
    pub anonymous: bool,
    pub submitted_at: Option<Timestamp>,
    pub origin_ip_hash: Option<String>,
    pub device_token_hash: Option<String>,
    pub user_agent_hash: Option<String>,
    pub created_at: Timestamp,
}

impl Ballot {
    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

/// One normalized response unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vote {
    pub id: VoteId,
    pub ballot_id: BallotId,
    pub poll_id: PollId,
    pub question_id: QuestionId,
    /// Set for choice questions
    pub option_id: Option<OptionId>,
    /// Set for text questions, trimmed and bounded
    pub free_text: Option<String>,
    pub weight: u32,
}

/// Materialized count cache; never the source of truth
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoteAggregate {
    pub poll_id: PollId,
    pub question_id: QuestionId,
    pub option_id: Option<OptionId>,
    pub count: u64,
    pub updated_at: Timestamp,
}

/// Everything the eligibility gate learns about the caller.
///
/// Built by the transport layer from headers and cookies and passed in
/// explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RequesterContext {
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    /// Token persisted by the client from an earlier visit
    #[validate(length(min = 8, max = 128, message = "Device token must be between 8 and 128 characters"))]
    pub device_token: Option<String>,
    #[validate(length(max = 255, message = "User agent is too long"))]
    pub user_agent: Option<String>,
    pub source_ip: Option<IpAddr>,
}

impl RequesterContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_device_token(mut self, token: impl Into<String>) -> Self {
        self.device_token = Some(token.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }
}

/// Result of a successful `open_ballot`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BallotTicket {
    pub ballot_id: BallotId,
    pub poll_id: PollId,
    /// Plaintext token the client must persist; never stored server-side
    pub device_token: String,
    /// An existing open ballot was returned instead of a new one
    pub resumed: bool,
}

/// One answer in a submission
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub question_id: QuestionId,
    #[serde(default)]
    pub option_ids: Vec<OptionId>,
    #[serde(default)]
    pub free_text: Option<String>,
}

impl Response {
    pub fn choice(question_id: QuestionId, option_ids: impl IntoIterator<Item = OptionId>) -> Self {
        Self {
            question_id,
            option_ids: option_ids.into_iter().collect(),
            free_text: None,
        }
    }

    pub fn text(question_id: QuestionId, free_text: impl Into<String>) -> Self {
        Self {
            question_id,
            option_ids: Vec::new(),
            free_text: Some(free_text.into()),
        }
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReceipt {
    pub ballot_id: BallotId,
    pub poll_id: PollId,
    pub votes_recorded: usize,
    pub submitted_at: Timestamp,
}

/// Result of a successful commit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitReceipt {
    pub poll_id: PollId,
    pub definition_hash: String,
    pub committed_at: Timestamp,
    /// Eligibility items newly marked `invited`
    pub invitations_sent: usize,
}

/// Draft definition submitted by an owner
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_new_poll"))]
pub struct NewPoll {
    #[validate(length(min = 3, max = 200, message = "Title must be between 3 and 200 characters"))]
    pub title: String,
    #[validate(length(max = 2000, message = "Description must be at most 2000 characters"))]
    pub description: Option<String>,
    pub visibility: Visibility,
    pub identity_mode: IdentityMode,
    pub opens_at: Option<Timestamp>,
    pub closes_at: Option<Timestamp>,
    #[serde(default)]
    #[validate(custom(function = "validate_email_list"))]
    pub listed_emails: Vec<String>,
    #[serde(default)]
    #[validate(nested)]
    pub questions: Vec<NewQuestion>,
}

impl NewPoll {
    /// Public, anonymous, always-open draft with no questions
    pub fn public(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            visibility: Visibility::Public,
            identity_mode: IdentityMode::Anonymous,
            opens_at: None,
            closes_at: None,
            listed_emails: Vec::new(),
            questions: Vec::new(),
        }
    }

    pub fn question(mut self, question: NewQuestion) -> Self {
        self.questions.push(question);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_new_question"))]
pub struct NewQuestion {
    #[validate(length(min = 3, max = 2000, message = "Prompt must be between 3 and 2000 characters"))]
    pub prompt: String,
    pub kind: QuestionKind,
    #[serde(default)]
    #[validate(custom(function = "validate_option_labels"))]
    pub options: Vec<String>,
}

impl NewQuestion {
    pub fn new<L: Into<String>>(
        kind: QuestionKind,
        prompt: impl Into<String>,
        options: impl IntoIterator<Item = L>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            kind,
            options: options.into_iter().map(Into::into).collect(),
        }
    }
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Borrowed(message))
}

fn validate_new_poll(poll: &NewPoll) -> Result<(), ValidationError> {
    if let (Some(opens), Some(closes)) = (poll.opens_at, poll.closes_at) {
        if closes <= opens {
            return Err(invalid("window", "Poll must close after it opens"));
        }
    }
    if poll.visibility == Visibility::Listed && poll.listed_emails.is_empty() {
        return Err(invalid(
            "allow_list",
            "Provide at least one email for a listed poll",
        ));
    }
    Ok(())
}

fn validate_new_question(question: &NewQuestion) -> Result<(), ValidationError> {
    if question.kind == QuestionKind::Text && !question.options.is_empty() {
        return Err(invalid("text_options", "Text questions do not take options"));
    }
    Ok(())
}

/// Allow-list entries are checked in their normalized form
fn validate_email_list(emails: &[String]) -> Result<(), ValidationError> {
    if emails.iter().all(|email| normalize_email(email).validate_email()) {
        Ok(())
    } else {
        Err(invalid("email", "Invalid email address in allow-list"))
    }
}

fn validate_option_labels(labels: &[String]) -> Result<(), ValidationError> {
    labels.iter().try_for_each(|label| validate_option_label(label))
}

/// Option labels are 1 to 2000 characters
pub fn validate_option_label(label: &str) -> Result<(), ValidationError> {
    if label.validate_length(Some(1), Some(2000), None) {
        Ok(())
    } else {
        Err(invalid(
            "label",
            "Option label must be between 1 and 2000 characters",
        ))
    }
}

/// Lower-case and trim an email for allow-list matching and dedup
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn poll_with_window(opens: Option<Timestamp>, closes: Option<Timestamp>) -> Poll {
        Poll {
            id: Uuid::new_v4(),
            owner_id: "owner".into(),
            title: "Window".into(),
            description: None,
            visibility: Visibility::Public,
            identity_mode: IdentityMode::Anonymous,
            opens_at: opens,
            closes_at: closes,
            committed_at: None,
            definition_hash: None,
            version: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_window_state() {
        let now = Utc::now();

        let unbounded = poll_with_window(None, None);
        assert_eq!(unbounded.window_state(now), WindowState::Open);

        let future = poll_with_window(Some(now + Duration::minutes(5)), None);
        assert_eq!(future.window_state(now), WindowState::NotYetOpen);

        let closed = poll_with_window(None, Some(now - Duration::minutes(5)));
        assert_eq!(closed.window_state(now), WindowState::Closed);
        assert!(closed.is_expired(now));

        // Bounds are inclusive
        let exact = poll_with_window(Some(now), Some(now));
        assert_eq!(exact.window_state(now), WindowState::Open);
        assert!(!exact.is_expired(now));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn test_new_poll_validation() {
        let question = NewQuestion::new(QuestionKind::Single, "Pick one", ["A", "B"]);
        assert!(NewPoll::public("Lunch").question(question.clone()).validate().is_ok());
        assert!(NewPoll::public("Hi").validate().is_err());

        let long_description = NewPoll {
            description: Some("d".repeat(2001)),
            ..NewPoll::public("Lunch")
        };
        assert!(long_description.validate().is_err());

        let now = Utc::now();
        let backwards = NewPoll {
            opens_at: Some(now),
            closes_at: Some(now),
            ..NewPoll::public("Lunch")
        };
        assert!(backwards.validate().is_err());

        let listed = NewPoll {
            visibility: Visibility::Listed,
            ..NewPoll::public("Lunch")
        };
        assert!(listed.validate().is_err());
        let listed = NewPoll {
            listed_emails: vec![" Ana@Example.com ".into()],
            ..listed
        };
        assert!(listed.validate().is_ok());
        let listed = NewPoll {
            listed_emails: vec!["not an email".into()],
            ..listed
        };
        assert!(listed.validate().is_err());

        // Nested questions are checked too
        let bad_question = NewPoll::public("Lunch")
            .question(NewQuestion::new(QuestionKind::Single, "Pick one", [""]));
        assert!(bad_question.validate().is_err());
    }

    #[test]
    fn test_new_question_validation() {
        let short = NewQuestion::new(QuestionKind::Single, "Hi", ["A"]);
        assert!(short.validate().is_err());

        let text_with_options = NewQuestion::new(QuestionKind::Text, "Thoughts?", ["A"]);
        assert!(text_with_options.validate().is_err());

        let text = NewQuestion::new(QuestionKind::Text, "Thoughts?", Vec::<String>::new());
        assert!(text.validate().is_ok());

        assert!(validate_option_label("").is_err());
        assert!(validate_option_label(&"é".repeat(2000)).is_ok());
        assert!(validate_option_label(&"é".repeat(2001)).is_err());
    }

    #[test]
    fn test_requester_validation() {
        assert!(RequesterContext::anonymous().validate().is_ok());
        assert!(
            RequesterContext::anonymous()
                .with_device_token("short")
                .validate()
                .is_err()
        );
        assert!(
            RequesterContext::anonymous()
                .with_device_token("x".repeat(129))
                .validate()
                .is_err()
        );
        assert!(
            RequesterContext::anonymous()
                .with_user_agent("u".repeat(256))
                .validate()
                .is_err()
        );
        assert!(RequesterContext::anonymous().with_email("nope").validate().is_err());
        assert!(
            RequesterContext::anonymous()
                .with_email("voter@example.com")
                .with_device_token("0123456789abcdef")
                .with_user_agent("Mozilla/5.0")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_response_wire_shape() {
        let question_id = Uuid::new_v4();
        let json = format!(r#"{{"questionId":"{question_id}","freeText":"hi"}}"#);
        let response: Response = serde_json::from_str(&json).unwrap();

        assert_eq!(response.question_id, question_id);
        assert!(response.option_ids.is_empty());
        assert_eq!(response.free_text.as_deref(), Some("hi"));
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_string(&QuestionKind::Ranked).unwrap(), "\"ranked\"");
        assert!(QuestionKind::Multi.is_choice());
        assert!(!QuestionKind::Text.is_choice());
    }
}
