//! In-memory store
//!
//! Reference [`PollStore`] implementation used by tests and single-process
//! deployments. All tables sit behind one `RwLock`, so each call is atomic
//! and [`PollStore::submit_ballot`] is transactional unless the store was
//! built with [`MemoryStore::without_atomic_submit`]. Faults can be armed to
//! exercise transient-error, degraded-read and lost-race paths
//! deterministically.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::RwLock;

use super::{BallotFilter, PollStore, SubmitWrite};
use crate::types::{
    AllowList, Ballot, BallotId, EligibilityItem, EligibilityItemId, EligibilityList,
    EligibilityListId, OptionId, Poll, PollId, PollOption, Question, QuestionId, Timestamp, Vote,
    VoteAggregate, VoteId,
};
use crate::{Error, Result};

/// Store operations a fault can be armed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    InsertPoll,
    GetPoll,
    AppendDefinition,
    ListQuestions,
    ListOptions,
    MarkCommitted,
    DeletePolls,
    ListEligibility,
    MarkInvited,
    MarkRedeemed,
    InsertBallot,
    GetBallot,
    FindDuplicate,
    MarkSubmitted,
    CountBallots,
    InsertVotes,
    DeleteVotes,
    ListVotes,
    ListAggregates,
    ReplaceAggregates,
}

/// A one-shot failure armed on the store.
///
/// The transactional submit trips `InsertVotes` and `MarkSubmitted` faults
/// too, before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Next call to the op fails with a retryable store error
    Transient(StoreOp),
    /// Next call to the op fails with a permanent store error
    Fatal(StoreOp),
    /// Next `mark_ballot_submitted` or `submit_ballot` behaves as if another
    /// request won the compare-and-set a moment earlier
    LoseSubmitRace,
    /// Next `find_duplicate_ballots` answers as if a concurrent ballot insert
    /// had not landed yet
    StaleDuplicateRead,
}

#[derive(Debug, Default)]
struct Tables {
    polls: HashMap<PollId, Poll>,
    questions: HashMap<QuestionId, Question>,
    options: HashMap<OptionId, PollOption>,
    eligibility_lists: HashMap<EligibilityListId, EligibilityList>,
    eligibility_items: HashMap<EligibilityItemId, EligibilityItem>,
    ballots: HashMap<BallotId, Ballot>,
    votes: HashMap<VoteId, Vote>,
    aggregates: HashMap<PollId, Vec<VoteAggregate>>,
}

impl Tables {
    fn list_ids_for_poll(&self, poll_id: &PollId) -> Vec<EligibilityListId> {
        self.eligibility_lists
            .values()
            .filter(|list| list.poll_id == *poll_id)
            .map(|list| list.id)
            .collect()
    }

    fn cascade_delete(&mut self, poll_id: &PollId) {
        self.polls.remove(poll_id);

        let question_ids: Vec<QuestionId> = self
            .questions
            .values()
            .filter(|q| q.poll_id == *poll_id)
            .map(|q| q.id)
            .collect();
        self.options
            .retain(|_, option| !question_ids.contains(&option.question_id));
        self.questions.retain(|_, q| q.poll_id != *poll_id);

        let list_ids = self.list_ids_for_poll(poll_id);
        self.eligibility_items
            .retain(|_, item| !list_ids.contains(&item.list_id));
        self.eligibility_lists.retain(|_, list| list.poll_id != *poll_id);

        self.votes.retain(|_, vote| vote.poll_id != *poll_id);
        self.ballots.retain(|_, ballot| ballot.poll_id != *poll_id);
        self.aggregates.remove(poll_id);
    }
}

/// In-memory [`PollStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    faults: Mutex<Vec<Fault>>,
    unique_constraints: bool,
    split_submit: bool,
}

impl MemoryStore {
    /// Create a store without uniqueness constraints on ballots
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store enforcing one ballot per (poll, device hash) and per
    /// (poll, voter ref)
    pub fn with_unique_constraints() -> Self {
        Self {
            unique_constraints: true,
            ..Self::default()
        }
    }

    /// Report `SubmitWrite::Unsupported`, like a store without transactions
    pub fn without_atomic_submit(mut self) -> Self {
        self.split_submit = true;
        self
    }

    /// Arm a one-shot fault; faults trip in the order they were armed
    pub fn arm(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(fault);
        }
    }

    /// Number of armed faults that have not tripped yet
    pub fn pending_faults(&self) -> usize {
        self.faults.lock().map(|f| f.len()).unwrap_or_default()
    }

    /// Total vote rows across all polls
    pub async fn vote_count(&self) -> usize {
        self.tables.read().await.votes.len()
    }

    /// Clear all data
    pub async fn clear(&self) {
        *self.tables.write().await = Tables::default();
    }

    fn take_fault(&self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.lock().ok()?;
        let index = faults.iter().position(matches)?;
        Some(faults.remove(index))
    }

    fn take_lost_race(&self) -> bool {
        self.take_fault(|fault| matches!(fault, Fault::LoseSubmitRace))
            .is_some()
    }

    fn trip(&self, op: StoreOp) -> Result<()> {
        let fault = self.take_fault(|fault| match fault {
            Fault::Transient(target) | Fault::Fatal(target) => *target == op,
            Fault::LoseSubmitRace | Fault::StaleDuplicateRead => false,
        });

        match fault {
            Some(Fault::Transient(_)) => Err(Error::transient(format!("{op:?}: connection timed out"))),
            Some(Fault::Fatal(_)) => Err(Error::store(format!("{op:?}: storage failure"))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    // ==================== Definition ====================

    async fn insert_poll(
        &self,
        poll: &Poll,
        questions: &[Question],
        options: &[PollOption],
        allow_list: Option<&AllowList>,
    ) -> Result<()> {
        self.trip(StoreOp::InsertPoll)?;
        let mut tables = self.tables.write().await;

        if tables.polls.contains_key(&poll.id) {
            return Err(Error::UniqueViolation {
                constraint: "polls_pkey".to_string(),
            });
        }
        if let Some(allow) = allow_list {
            let mut seen = Vec::with_capacity(allow.items.len());
            for item in &allow.items {
                if seen.contains(&&item.email) {
                    return Err(Error::UniqueViolation {
                        constraint: "eligibility_email_unique".to_string(),
                    });
                }
                seen.push(&item.email);
            }
        }

        tables.polls.insert(poll.id, poll.clone());
        for question in questions {
            tables.questions.insert(question.id, question.clone());
        }
        for option in options {
            tables.options.insert(option.id, option.clone());
        }
        if let Some(allow) = allow_list {
            tables.eligibility_lists.insert(allow.list.id, allow.list.clone());
            for item in &allow.items {
                tables.eligibility_items.insert(item.id, item.clone());
            }
        }
        Ok(())
    }

    async fn get_poll(&self, poll_id: &PollId) -> Result<Option<Poll>> {
        self.trip(StoreOp::GetPoll)?;
        Ok(self.tables.read().await.polls.get(poll_id).cloned())
    }

    async fn append_definition(
        &self,
        poll_id: &PollId,
        questions: &[Question],
        options: &[PollOption],
    ) -> Result<u32> {
        self.trip(StoreOp::AppendDefinition)?;
        let mut tables = self.tables.write().await;

        let poll = tables
            .polls
            .get_mut(poll_id)
            .ok_or_else(|| Error::not_found("Poll"))?;
        if poll.is_committed() {
            return Err(Error::invalid_state("Poll definition is frozen"));
        }
        poll.version += 1;
        let version = poll.version;

        for question in questions {
            tables.questions.insert(question.id, question.clone());
        }
        for option in options {
            tables.options.insert(option.id, option.clone());
        }
        Ok(version)
    }

    async fn list_questions(&self, poll_id: &PollId) -> Result<Vec<Question>> {
        self.trip(StoreOp::ListQuestions)?;
        let tables = self.tables.read().await;

        let mut questions: Vec<Question> = tables
            .questions
            .values()
            .filter(|q| q.poll_id == *poll_id)
            .cloned()
            .collect();
        questions.sort_by_key(|q| (q.order_index, q.id));
        Ok(questions)
    }

    async fn list_options(&self, question_ids: &[QuestionId]) -> Result<Vec<PollOption>> {
        self.trip(StoreOp::ListOptions)?;
        let tables = self.tables.read().await;

        Ok(tables
            .options
            .values()
            .filter(|option| question_ids.contains(&option.question_id))
            .cloned()
            .collect())
    }

    async fn mark_committed(
        &self,
        poll_id: &PollId,
        committed_at: Timestamp,
        definition_hash: &str,
    ) -> Result<bool> {
        self.trip(StoreOp::MarkCommitted)?;
        let mut tables = self.tables.write().await;

        match tables.polls.get_mut(poll_id) {
            Some(poll) if !poll.is_committed() => {
                poll.committed_at = Some(committed_at);
                poll.definition_hash = Some(definition_hash.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_polls_closed_before(&self, cutoff: Timestamp) -> Result<Vec<PollId>> {
        self.trip(StoreOp::DeletePolls)?;
        let mut tables = self.tables.write().await;

        let expired: Vec<PollId> = tables
            .polls
            .values()
            .filter(|poll| poll.is_expired(cutoff))
            .map(|poll| poll.id)
            .collect();
        for poll_id in &expired {
            tables.cascade_delete(poll_id);
        }
        Ok(expired)
    }

    // ==================== Eligibility ====================

    async fn list_eligibility_items(&self, poll_id: &PollId) -> Result<Vec<EligibilityItem>> {
        self.trip(StoreOp::ListEligibility)?;
        let tables = self.tables.read().await;

        let list_ids = tables.list_ids_for_poll(poll_id);
        let mut items: Vec<EligibilityItem> = tables
            .eligibility_items
            .values()
            .filter(|item| list_ids.contains(&item.list_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.email.cmp(&b.email)));
        Ok(items)
    }

    async fn mark_invited(&self, item_ids: &[EligibilityItemId]) -> Result<()> {
        self.trip(StoreOp::MarkInvited)?;
        let mut tables = self.tables.write().await;

        for id in item_ids {
            if let Some(item) = tables.eligibility_items.get_mut(id) {
                item.invited = true;
            }
        }
        Ok(())
    }

    async fn mark_redeemed(&self, poll_id: &PollId, email: &str) -> Result<bool> {
        self.trip(StoreOp::MarkRedeemed)?;
        let mut tables = self.tables.write().await;

        let list_ids = tables.list_ids_for_poll(poll_id);
        let item = tables
            .eligibility_items
            .values_mut()
            .find(|item| list_ids.contains(&item.list_id) && item.email == email);
        match item {
            Some(item) => {
                item.redeemed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ==================== Ballots ====================

    async fn insert_ballot(&self, ballot: &Ballot) -> Result<()> {
        self.trip(StoreOp::InsertBallot)?;
        let mut tables = self.tables.write().await;

        if self.unique_constraints {
            for existing in tables.ballots.values().filter(|b| b.poll_id == ballot.poll_id) {
                if ballot.device_token_hash.is_some()
                    && existing.device_token_hash == ballot.device_token_hash
                {
                    return Err(Error::UniqueViolation {
                        constraint: "ballots_poll_device_unique".to_string(),
                    });
                }
                if ballot.voter_ref.is_some() && existing.voter_ref == ballot.voter_ref {
                    return Err(Error::UniqueViolation {
                        constraint: "ballots_poll_voter_unique".to_string(),
                    });
                }
            }
        }

        tables.ballots.insert(ballot.id, ballot.clone());
        Ok(())
    }

    async fn get_ballot(&self, ballot_id: &BallotId) -> Result<Option<Ballot>> {
        self.trip(StoreOp::GetBallot)?;
        Ok(self.tables.read().await.ballots.get(ballot_id).cloned())
    }

    async fn find_duplicate_ballots(
        &self,
        poll_id: &PollId,
        device_token_hash: &str,
        voter_ref: Option<&str>,
    ) -> Result<Vec<Ballot>> {
        self.trip(StoreOp::FindDuplicate)?;
        if self
            .take_fault(|fault| matches!(fault, Fault::StaleDuplicateRead))
            .is_some()
        {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().await;

        let mut matches: Vec<Ballot> = tables
            .ballots
            .values()
            .filter(|b| b.poll_id == *poll_id)
            .filter(|b| {
                b.device_token_hash.as_deref() == Some(device_token_hash)
                    || voter_ref.is_some_and(|v| b.voter_ref.as_deref() == Some(v))
            })
            .cloned()
            .collect();
        matches.sort_by_key(|b| (b.created_at, b.id));
        Ok(matches)
    }

    async fn mark_ballot_submitted(
        &self,
        ballot_id: &BallotId,
        submitted_at: Timestamp,
    ) -> Result<bool> {
        self.trip(StoreOp::MarkSubmitted)?;
        let lose_race = self.take_lost_race();
        let mut tables = self.tables.write().await;

        match tables.ballots.get_mut(ballot_id) {
            Some(ballot) if ballot.submitted_at.is_none() => {
                ballot.submitted_at = Some(submitted_at);
                Ok(!lose_race)
            }
            _ => Ok(false),
        }
    }

    async fn submit_ballot(
        &self,
        ballot_id: &BallotId,
        votes: &[Vote],
        submitted_at: Timestamp,
    ) -> Result<SubmitWrite> {
        if self.split_submit {
            return Ok(SubmitWrite::Unsupported);
        }
        self.trip(StoreOp::InsertVotes)?;
        self.trip(StoreOp::MarkSubmitted)?;
        let lose_race = self.take_lost_race();
        let mut tables = self.tables.write().await;

        let Some(ballot) = tables.ballots.get_mut(ballot_id) else {
            return Ok(SubmitWrite::AlreadySubmitted);
        };
        if ballot.submitted_at.is_some() {
            return Ok(SubmitWrite::AlreadySubmitted);
        }
        if lose_race {
            // The competing request's flip, with none of our rows
            ballot.submitted_at = Some(submitted_at);
            return Ok(SubmitWrite::AlreadySubmitted);
        }
        if votes.iter().any(|vote| tables.votes.contains_key(&vote.id)) {
            return Err(Error::UniqueViolation {
                constraint: "votes_pkey".to_string(),
            });
        }

        if let Some(ballot) = tables.ballots.get_mut(ballot_id) {
            ballot.submitted_at = Some(submitted_at);
        }
        for vote in votes {
            tables.votes.insert(vote.id, vote.clone());
        }
        Ok(SubmitWrite::Submitted)
    }

    async fn count_ballots(&self, poll_id: &PollId, filter: BallotFilter) -> Result<u64> {
        self.trip(StoreOp::CountBallots)?;
        let tables = self.tables.read().await;

        let count = tables
            .ballots
            .values()
            .filter(|b| b.poll_id == *poll_id)
            .filter(|b| match filter {
                BallotFilter::All => true,
                BallotFilter::Submitted => b.is_submitted(),
            })
            .count();
        Ok(count as u64)
    }

    // ==================== Votes ====================

    async fn insert_votes(&self, votes: &[Vote]) -> Result<()> {
        self.trip(StoreOp::InsertVotes)?;
        let mut tables = self.tables.write().await;

        if votes.iter().any(|vote| tables.votes.contains_key(&vote.id)) {
            return Err(Error::UniqueViolation {
                constraint: "votes_pkey".to_string(),
            });
        }
        for vote in votes {
            tables.votes.insert(vote.id, vote.clone());
        }
        Ok(())
    }

    async fn delete_votes(&self, vote_ids: &[VoteId]) -> Result<u64> {
        self.trip(StoreOp::DeleteVotes)?;
        let mut tables = self.tables.write().await;

        let removed = vote_ids
            .iter()
            .filter(|id| tables.votes.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn list_votes(&self, poll_id: &PollId) -> Result<Vec<Vote>> {
        self.trip(StoreOp::ListVotes)?;
        let tables = self.tables.read().await;

        Ok(tables
            .votes
            .values()
            .filter(|vote| vote.poll_id == *poll_id)
            .cloned()
            .collect())
    }

    // ==================== Aggregate cache ====================

    async fn list_aggregates(&self, poll_id: &PollId) -> Result<Vec<VoteAggregate>> {
        self.trip(StoreOp::ListAggregates)?;
        let tables = self.tables.read().await;
        Ok(tables.aggregates.get(poll_id).cloned().unwrap_or_default())
    }

    async fn replace_aggregates(&self, poll_id: &PollId, rows: &[VoteAggregate]) -> Result<()> {
        self.trip(StoreOp::ReplaceAggregates)?;
        let mut tables = self.tables.write().await;
        tables.aggregates.insert(*poll_id, rows.to_vec());
        Ok(())
    }
}
