//! Data store seam
//!
//! The ballot core talks to its relational store only through [`PollStore`].
//! Every method is a suspension point. Implementations must make each single
//! call atomic. Stores that can write a vote batch and flip the ballot's
//! submitted flag in one transaction do so in [`PollStore::submit_ballot`];
//! for the rest the caller pairs a compare-and-set with a compensating delete.

pub mod memory;
pub mod retry;

use async_trait::async_trait;

use crate::Result;
use crate::types::{
    AllowList, Ballot, BallotId, EligibilityItem, EligibilityItemId, Poll, PollId, PollOption,
    Question, QuestionId, Timestamp, Vote, VoteAggregate, VoteId,
};

pub use memory::{Fault, MemoryStore, StoreOp};
pub use retry::with_retry;

/// Which ballots a count covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotFilter {
    All,
    Submitted,
}

/// Outcome of [`PollStore::submit_ballot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitWrite {
    /// Votes stored and ballot flipped together
    Submitted,
    /// The ballot was missing or already submitted; nothing was written
    AlreadySubmitted,
    /// The store has no transactional path; use insert + compare-and-set
    Unsupported,
}

/// Storage interface required by the ballot core
#[async_trait]
pub trait PollStore: Send + Sync {
    // ==================== Definition ====================

    /// Insert a draft poll together with its questions, options and, for
    /// listed polls, its allow-list. All rows land or none do.
    async fn insert_poll(
        &self,
        poll: &Poll,
        questions: &[Question],
        options: &[PollOption],
        allow_list: Option<&AllowList>,
    ) -> Result<()>;

    async fn get_poll(&self, poll_id: &PollId) -> Result<Option<Poll>>;

    /// Append questions/options to a draft and bump its version.
    ///
    /// Fails `InvalidState` if the poll is committed, checked atomically with
    /// the write.
    async fn append_definition(
        &self,
        poll_id: &PollId,
        questions: &[Question],
        options: &[PollOption],
    ) -> Result<u32>;

    /// Questions of a poll ordered by `order_index`
    async fn list_questions(&self, poll_id: &PollId) -> Result<Vec<Question>>;

    /// Options belonging to any of the given questions, in no particular order
    async fn list_options(&self, question_ids: &[QuestionId]) -> Result<Vec<PollOption>>;

    /// Set `committed_at` and `definition_hash` if the poll is still a draft.
    ///
    /// Returns `false` when the poll was already committed.
    async fn mark_committed(
        &self,
        poll_id: &PollId,
        committed_at: Timestamp,
        definition_hash: &str,
    ) -> Result<bool>;

    /// Delete polls whose `closes_at` is before `cutoff`, cascading to
    /// everything they own. Returns the deleted ids.
    async fn delete_polls_closed_before(&self, cutoff: Timestamp) -> Result<Vec<PollId>>;

    // ==================== Eligibility ====================

    async fn list_eligibility_items(&self, poll_id: &PollId) -> Result<Vec<EligibilityItem>>;

    async fn mark_invited(&self, item_ids: &[EligibilityItemId]) -> Result<()>;

    /// Mark the item matching a normalized email as redeemed
    async fn mark_redeemed(&self, poll_id: &PollId, email: &str) -> Result<bool>;

    // ==================== Ballots ====================

    /// Insert an open ballot.
    ///
    /// Stores that enforce uniqueness on (poll, device hash) or
    /// (poll, voter ref) report violations as `Error::UniqueViolation`.
    async fn insert_ballot(&self, ballot: &Ballot) -> Result<()>;

    async fn get_ballot(&self, ballot_id: &BallotId) -> Result<Option<Ballot>>;

    /// Every ballot of the poll matching the device hash or, when given,
    /// the exact voter reference, oldest first
    async fn find_duplicate_ballots(
        &self,
        poll_id: &PollId,
        device_token_hash: &str,
        voter_ref: Option<&str>,
    ) -> Result<Vec<Ballot>>;

    /// Compare-and-set `submitted_at` from null to `submitted_at`.
    ///
    /// Returns `false` if the ballot is missing or already submitted.
    async fn mark_ballot_submitted(
        &self,
        ballot_id: &BallotId,
        submitted_at: Timestamp,
    ) -> Result<bool>;

    /// Insert `votes` and flip `submitted_at` from null in one transaction.
    ///
    /// The default reports [`SubmitWrite::Unsupported`].
    async fn submit_ballot(
        &self,
        _ballot_id: &BallotId,
        _votes: &[Vote],
        _submitted_at: Timestamp,
    ) -> Result<SubmitWrite> {
        Ok(SubmitWrite::Unsupported)
    }

    async fn count_ballots(&self, poll_id: &PollId, filter: BallotFilter) -> Result<u64>;

    // ==================== Votes ====================

    /// Insert all rows or none
    async fn insert_votes(&self, votes: &[Vote]) -> Result<()>;

    /// Delete the given rows, returning how many existed
    async fn delete_votes(&self, vote_ids: &[VoteId]) -> Result<u64>;

    async fn list_votes(&self, poll_id: &PollId) -> Result<Vec<Vote>>;

    // ==================== Aggregate cache ====================

    async fn list_aggregates(&self, poll_id: &PollId) -> Result<Vec<VoteAggregate>>;

    /// Replace every cached aggregate of the poll
    async fn replace_aggregates(&self, poll_id: &PollId, rows: &[VoteAggregate]) -> Result<()>;
}
