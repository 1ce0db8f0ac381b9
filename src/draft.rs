//! Pre-commit definition entry
//!
//! Owners create a poll and add questions and options while it is a draft.
//! Every append goes through [`PollStore::append_definition`], which refuses
//! committed polls in the same atomic step as the write, so a definition can
//! never grow after commit even if commit races an edit.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::config::RetryConfig;
use crate::invalid_input_error;
use crate::store::{PollStore, with_retry};
use crate::types::{
    AllowList, EligibilityItem, EligibilityList, NewPoll, NewQuestion, OwnerId, Poll, PollId,
    PollOption, Question, QuestionId, Timestamp, Visibility, normalize_email,
    validate_option_label,
};
use crate::{Error, Result};

const DEFAULT_LIST_NAME: &str = "Default list";

fn require_actor(actor: Option<&str>) -> Result<&str> {
    actor
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or(Error::Unauthorized)
}

/// Build the rows of an already validated question, with order indexes
/// starting at `order_index`
fn build_question(poll_id: PollId, order_index: u32, new: &NewQuestion) -> (Question, Vec<PollOption>) {
    let question = Question {
        id: Uuid::new_v4(),
        poll_id,
        kind: new.kind,
        prompt: new.prompt.clone(),
        order_index,
    };
    let options = new
        .options
        .iter()
        .enumerate()
        .map(|(i, label)| PollOption {
            id: Uuid::new_v4(),
            question_id: question.id,
            label: label.clone(),
            order_index: i as u32,
        })
        .collect();

    (question, options)
}

/// One item per distinct normalized email
fn build_allow_list(poll_id: PollId, emails: &[String], now: Timestamp) -> AllowList {
    let list = EligibilityList {
        id: Uuid::new_v4(),
        poll_id,
        name: DEFAULT_LIST_NAME.to_string(),
        created_at: now,
    };
    let mut seen = HashSet::new();
    let items = emails
        .iter()
        .map(|email| normalize_email(email))
        .filter(|email| seen.insert(email.clone()))
        .map(|email| EligibilityItem {
            id: Uuid::new_v4(),
            list_id: list.id,
            email,
            display_name: None,
            invited: false,
            redeemed: false,
            created_at: now,
        })
        .collect();
    AllowList { list, items }
}

/// Draft creation and editing
#[derive(Clone)]
pub struct PollDrafts {
    store: Arc<dyn PollStore>,
    retry: RetryConfig,
}

impl PollDrafts {
    pub fn new(store: Arc<dyn PollStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Create a draft poll owned by `owner`
    pub async fn create_poll(&self, owner: Option<&str>, new: NewPoll) -> Result<Poll> {
        let owner: OwnerId = require_actor(owner)?.to_string();

        new.validate()?;

        let now = Utc::now();
        let poll = Poll {
            id: Uuid::new_v4(),
            owner_id: owner,
            title: new.title,
            description: new.description,
            visibility: new.visibility,
            identity_mode: new.identity_mode,
            opens_at: new.opens_at,
            closes_at: new.closes_at,
            committed_at: None,
            definition_hash: None,
            version: 1,
            created_at: now,
        };

        let mut questions = Vec::with_capacity(new.questions.len());
        let mut options = Vec::new();
        for (index, question) in new.questions.iter().enumerate() {
            let (question, question_options) = build_question(poll.id, index as u32, question);
            questions.push(question);
            options.extend(question_options);
        }

        let allow_list = (poll.visibility == Visibility::Listed)
            .then(|| build_allow_list(poll.id, &new.listed_emails, now));
        self.store
            .insert_poll(&poll, &questions, &options, allow_list.as_ref())
            .await?;

        tracing::info!(
            poll_id = %poll.id,
            questions = questions.len(),
            options = options.len(),
            allowed = allow_list.as_ref().map_or(0, |a| a.items.len()),
            "draft poll created"
        );
        Ok(poll)
    }

    /// Append a question (with its options) to a draft
    pub async fn add_question(
        &self,
        poll_id: &PollId,
        actor: Option<&str>,
        new: NewQuestion,
    ) -> Result<Question> {
        new.validate()?;
        self.editable_poll(poll_id, actor).await?;

        let existing = with_retry(&self.retry, || self.store.list_questions(poll_id)).await?;
        let next_index = existing
            .iter()
            .map(|q| q.order_index + 1)
            .max()
            .unwrap_or(0);

        let (question, options) = build_question(*poll_id, next_index, &new);
        let version = self
            .store
            .append_definition(poll_id, std::slice::from_ref(&question), &options)
            .await?;

        tracing::debug!(%poll_id, question_id = %question.id, version, "question added");
        Ok(question)
    }

    /// Append an option to a choice question of a draft
    pub async fn add_option(
        &self,
        poll_id: &PollId,
        question_id: &QuestionId,
        actor: Option<&str>,
        label: impl Into<String>,
    ) -> Result<PollOption> {
        let label = label.into();
        validate_option_label(&label)?;
        self.editable_poll(poll_id, actor).await?;

        let questions = with_retry(&self.retry, || self.store.list_questions(poll_id)).await?;
        let question = questions
            .iter()
            .find(|q| q.id == *question_id)
            .ok_or_else(|| Error::not_found("Question"))?;
        if !question.kind.is_choice() {
            return Err(invalid_input_error!("Text questions do not take options"));
        }

        let existing = with_retry(&self.retry, || {
            self.store.list_options(std::slice::from_ref(question_id))
        })
        .await?;
        let option = PollOption {
            id: Uuid::new_v4(),
            question_id: *question_id,
            label,
            order_index: existing
                .iter()
                .map(|o| o.order_index + 1)
                .max()
                .unwrap_or(0),
        };

        let version = self
            .store
            .append_definition(poll_id, &[], std::slice::from_ref(&option))
            .await?;

        tracing::debug!(%poll_id, option_id = %option.id, version, "option added");
        Ok(option)
    }

    async fn editable_poll(&self, poll_id: &PollId, actor: Option<&str>) -> Result<Poll> {
        let actor = require_actor(actor)?;
        let poll = with_retry(&self.retry, || self.store.get_poll(poll_id))
            .await?
            .ok_or_else(|| Error::not_found("Poll"))?;

        if poll.owner_id != actor {
            return Err(Error::forbidden("Only the poll owner can edit it"));
        }
        if poll.is_committed() {
            return Err(Error::invalid_state("Poll is committed and can no longer change"));
        }
        Ok(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuestionKind;

    #[test]
    fn test_build_question_assigns_order() {
        let poll_id = Uuid::new_v4();
        let new = NewQuestion::new(QuestionKind::Multi, "Pick toppings", ["Ham", "Olives"]);
        let (question, options) = build_question(poll_id, 3, &new);

        assert_eq!(question.order_index, 3);
        assert_eq!(options.len(), 2);
        assert_eq!(options[1].order_index, 1);
        assert!(options.iter().all(|o| o.question_id == question.id));
    }

    #[test]
    fn test_allow_list_dedupes_normalized_emails() {
        let poll_id = Uuid::new_v4();
        let emails = ["Ana@Example.com".to_string(), " ana@example.com".into(), "ben@example.com".into()];
        let allow = build_allow_list(poll_id, &emails, Utc::now());

        assert_eq!(allow.list.poll_id, poll_id);
        let stored: Vec<_> = allow.items.iter().map(|i| i.email.as_str()).collect();
        assert_eq!(stored, vec!["ana@example.com", "ben@example.com"]);
        assert!(allow.items.iter().all(|i| i.list_id == allow.list.id && !i.invited && !i.redeemed));
    }

    #[test]
    fn test_require_actor() {
        assert!(matches!(require_actor(None), Err(Error::Unauthorized)));
        assert!(matches!(require_actor(Some("  ")), Err(Error::Unauthorized)));
        assert_eq!(require_actor(Some("owner")).unwrap(), "owner");
    }
}
