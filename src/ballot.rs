//! Ballot Lifecycle
//!
//! A ballot moves `Open -> Submitted` exactly once. Responses are validated
//! against the frozen definition before anything is written. Stores with
//! transactions write the vote batch and flip `submitted_at` in one step, so
//! a losing request writes nothing. Otherwise the batch is inserted first and
//! `submitted_at` is flipped with a compare-and-set; the request that loses
//! the flip deletes the rows it just wrote and republishes, so a ballot never
//! counts twice and never mixes two submissions.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::realtime::{PollEvent, PollEventSink};
use crate::store::{PollStore, SubmitWrite, with_retry};
use crate::types::{
    Ballot, BallotId, MAX_FREE_TEXT_CHARS, OptionId, PollId, PollOption, Question, QuestionId,
    QuestionKind, Response, SubmitReceipt, Timestamp, Visibility, Vote, VoteId, normalize_email,
};
use crate::{Error, Result, conflict_error, invalid_input_error};

/// Turn `responses` into vote rows for `ballot`.
///
/// Rejects the whole submission on any unknown question, unknown or foreign
/// option, repeated question or option, or more than one option on a single
/// choice question. Empty text and empty selections are skipped.
pub fn build_votes(
    ballot: &Ballot,
    questions: &[Question],
    options: &[PollOption],
    responses: &[Response],
) -> Result<Vec<Vote>> {
    let questions: HashMap<QuestionId, &Question> = questions.iter().map(|q| (q.id, q)).collect();
    let option_owner: HashMap<OptionId, QuestionId> =
        options.iter().map(|o| (o.id, o.question_id)).collect();

    let mut answered = HashSet::new();
    let mut votes = Vec::new();
    let vote = |question_id, option_id, free_text| Vote {
        id: Uuid::new_v4(),
        ballot_id: ballot.id,
        poll_id: ballot.poll_id,
        question_id,
        option_id,
        free_text,
        weight: 1,
    };

    for response in responses {
        let question = questions
            .get(&response.question_id)
            .ok_or_else(|| invalid_input_error!("Invalid question"))?;
        if !answered.insert(question.id) {
            return Err(invalid_input_error!("Question answered more than once"));
        }

        if question.kind == QuestionKind::Text {
            // Option ids sent for a text question carry no meaning
            let Some(text) = response.free_text.as_deref().map(str::trim) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            let bounded: String = text.chars().take(MAX_FREE_TEXT_CHARS).collect();
            votes.push(vote(question.id, None, Some(bounded)));
            continue;
        }

        let selected = &response.option_ids;
        if selected.is_empty() {
            continue;
        }
        if question.kind == QuestionKind::Single && selected.len() != 1 {
            return Err(invalid_input_error!("Select a single option"));
        }

        let mut chosen = HashSet::new();
        for option_id in selected {
            if option_owner.get(option_id) != Some(&question.id) {
                return Err(invalid_input_error!("Invalid option"));
            }
            if !chosen.insert(*option_id) {
                return Err(invalid_input_error!("Option selected more than once"));
            }
            votes.push(vote(question.id, Some(*option_id), None));
        }
    }

    if votes.is_empty() {
        return Err(invalid_input_error!("No responses provided"));
    }
    Ok(votes)
}

#[derive(Clone)]
pub struct BallotLifecycle {
    store: Arc<dyn PollStore>,
    events: Arc<dyn PollEventSink>,
    retry: RetryConfig,
}

impl BallotLifecycle {
    pub fn new(
        store: Arc<dyn PollStore>,
        events: Arc<dyn PollEventSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            events,
            retry,
        }
    }

    /// Submit `responses` for an open ballot
    pub async fn submit(
        &self,
        ballot_id: &BallotId,
        responses: &[Response],
    ) -> Result<SubmitReceipt> {
        let ballot = with_retry(&self.retry, || self.store.get_ballot(ballot_id))
            .await?
            .ok_or_else(|| Error::not_found("Ballot"))?;
        if ballot.is_submitted() {
            return Err(conflict_error!("Ballot already submitted"));
        }

        let poll_id = ballot.poll_id;
        let poll = with_retry(&self.retry, || self.store.get_poll(&poll_id))
            .await?
            .ok_or_else(|| Error::not_found("Poll"))?;

        let questions = with_retry(&self.retry, || self.store.list_questions(&poll_id)).await?;
        let question_ids: Vec<QuestionId> = questions.iter().map(|q| q.id).collect();
        let options = if question_ids.is_empty() {
            Vec::new()
        } else {
            with_retry(&self.retry, || self.store.list_options(&question_ids)).await?
        };

        let votes = build_votes(&ballot, &questions, &options, responses)?;
        let submitted_at = Utc::now();
        self.write_submission(&poll_id, ballot_id, &votes, submitted_at)
            .await?;

        tracing::info!(%poll_id, %ballot_id, votes = votes.len(), "ballot submitted");
        self.events.publish(&poll_id, PollEvent::VotesUpdated);

        if poll.visibility == Visibility::Listed {
            if let Some(voter_ref) = &ballot.voter_ref {
                self.redeem(&ballot, voter_ref).await;
            }
        }

        Ok(SubmitReceipt {
            ballot_id: *ballot_id,
            poll_id,
            votes_recorded: votes.len(),
            submitted_at,
        })
    }

    async fn write_submission(
        &self,
        poll_id: &PollId,
        ballot_id: &BallotId,
        votes: &[Vote],
        submitted_at: Timestamp,
    ) -> Result<()> {
        match self.store.submit_ballot(ballot_id, votes, submitted_at).await {
            Ok(SubmitWrite::Submitted) => Ok(()),
            Ok(SubmitWrite::AlreadySubmitted) => {
                tracing::warn!(%poll_id, %ballot_id, "lost submit race, nothing written");
                Err(conflict_error!("Ballot could not be marked as submitted"))
            }
            Ok(SubmitWrite::Unsupported) => {
                self.insert_then_flip(poll_id, ballot_id, votes, submitted_at)
                    .await
            }
            Err(err) => {
                // The transaction may have committed before the error surfaced
                if self.flip_landed(ballot_id, submitted_at).await {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Two-step write for stores without transactions
    async fn insert_then_flip(
        &self,
        poll_id: &PollId,
        ballot_id: &BallotId,
        votes: &[Vote],
        submitted_at: Timestamp,
    ) -> Result<()> {
        let vote_ids: Vec<VoteId> = votes.iter().map(|v| v.id).collect();
        self.store.insert_votes(votes).await?;

        let won = match self.store.mark_ballot_submitted(ballot_id, submitted_at).await {
            Ok(won) => won,
            Err(err) => {
                if self.flip_landed(ballot_id, submitted_at).await {
                    true
                } else {
                    self.compensate(poll_id, ballot_id, &vote_ids).await;
                    return Err(err);
                }
            }
        };

        if !won {
            tracing::warn!(%poll_id, %ballot_id, "lost submit race, discarding votes");
            self.compensate(poll_id, ballot_id, &vote_ids).await;
            return Err(conflict_error!("Ballot could not be marked as submitted"));
        }
        Ok(())
    }

    /// After an errored write, check whether our flip went through
    async fn flip_landed(&self, ballot_id: &BallotId, submitted_at: Timestamp) -> bool {
        match with_retry(&self.retry, || self.store.get_ballot(ballot_id)).await {
            Ok(Some(ballot)) => ballot.submitted_at == Some(submitted_at),
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(%ballot_id, "could not confirm submission state: {err}");
                false
            }
        }
    }

    /// Delete exactly the rows this request inserted.
    ///
    /// Viewers may have recomputed while the rows were visible, so a
    /// successful delete is published like any other change.
    async fn compensate(&self, poll_id: &PollId, ballot_id: &BallotId, vote_ids: &[VoteId]) {
        match with_retry(&self.retry, || self.store.delete_votes(vote_ids)).await {
            Ok(removed) => {
                tracing::debug!(%ballot_id, removed, "compensating delete completed");
                if removed > 0 {
                    self.events.publish(poll_id, PollEvent::VotesUpdated);
                }
            }
            Err(err) => {
                tracing::error!(
                    %ballot_id,
                    orphaned = vote_ids.len(),
                    "compensating delete failed: {err}"
                );
            }
        }
    }

    async fn redeem(&self, ballot: &Ballot, voter_ref: &str) {
        let email = normalize_email(voter_ref);
        match self.store.mark_redeemed(&ballot.poll_id, &email).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(poll_id = %ballot.poll_id, "no eligibility item to redeem");
            }
            Err(err) => {
                tracing::warn!(poll_id = %ballot.poll_id, "could not mark eligibility redeemed: {err}");
            }
        }
    }
}
