//! Process-scoped wiring of the ballot core
//!
//! [`PollEngine::start`] builds the single live update bus, the attempt
//! limiter and the salted hasher for this process and hands them to each
//! component explicitly. [`PollEngine::shutdown`] drops every live
//! subscription.

use chrono::Utc;
use std::sync::Arc;

use crate::Result;
use crate::ballot::BallotLifecycle;
use crate::config::Config;
use crate::crypto::{AttemptLimiter, SaltedHasher};
use crate::draft::PollDrafts;
use crate::eligibility::EligibilityGate;
use crate::freeze::{DefinitionFreeze, Mailer};
use crate::maintenance::prune_expired_polls;
use crate::realtime::feed::sse_retry_frame;
use crate::realtime::{LiveFeed, LiveUpdateBus};
use crate::stats::{PollStatistics, StatisticsEngine};
use crate::store::PollStore;
use crate::types::{
    BallotId, BallotTicket, CommitReceipt, NewPoll, NewQuestion, Poll, PollId, PollOption,
    Question, QuestionId, RequesterContext, Response, SubmitReceipt,
};

pub struct PollEngine {
    config: Config,
    store: Arc<dyn PollStore>,
    bus: LiveUpdateBus,
    limiter: Arc<AttemptLimiter>,
    drafts: PollDrafts,
    freeze: DefinitionFreeze,
    gate: EligibilityGate,
    ballots: BallotLifecycle,
    stats: StatisticsEngine,
}

impl PollEngine {
    /// Build the engine for this process
    pub fn start(config: Config, store: Arc<dyn PollStore>, mailer: Arc<dyn Mailer>) -> Result<Self> {
        let hasher = Arc::new(SaltedHasher::from_config(&config.security)?);
        let limiter = Arc::new(AttemptLimiter::from_config(&config.security));
        let bus = LiveUpdateBus::new();
        let retry = config.retry.clone();

        if !mailer.is_configured() {
            tracing::warn!("outbound mail not configured, listed polls will not be invited");
        }

        let engine = Self {
            drafts: PollDrafts::new(store.clone(), retry.clone()),
            freeze: DefinitionFreeze::new(store.clone(), mailer, retry.clone()),
            gate: EligibilityGate::new(store.clone(), hasher, limiter.clone(), retry.clone()),
            ballots: BallotLifecycle::new(store.clone(), Arc::new(bus.clone()), retry.clone()),
            stats: StatisticsEngine::new(store.clone(), retry),
            config,
            store,
            bus,
            limiter,
        };

        tracing::info!(
            version = crate::VERSION,
            ballot_attempts = engine.config.security.ballot_attempts,
            ballot_window_seconds = engine.config.security.ballot_window_seconds,
            "poll engine started"
        );
        Ok(engine)
    }

    /// Drop every live subscription; open feeds end
    pub fn shutdown(&self) {
        self.bus.clear();
        tracing::info!("poll engine stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &LiveUpdateBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn PollStore> {
        &self.store
    }

    // ==================== Definition ====================

    pub async fn create_poll(&self, owner: Option<&str>, new: NewPoll) -> Result<Poll> {
        self.drafts.create_poll(owner, new).await
    }

    pub async fn add_question(
        &self,
        poll_id: &PollId,
        actor: Option<&str>,
        new: NewQuestion,
    ) -> Result<Question> {
        self.drafts.add_question(poll_id, actor, new).await
    }

    pub async fn add_option(
        &self,
        poll_id: &PollId,
        question_id: &QuestionId,
        actor: Option<&str>,
        label: impl Into<String>,
    ) -> Result<PollOption> {
        self.drafts.add_option(poll_id, question_id, actor, label).await
    }

    pub async fn commit(&self, poll_id: &PollId, actor: Option<&str>) -> Result<CommitReceipt> {
        self.freeze.commit(poll_id, actor).await
    }

    pub async fn verify_definition(&self, poll_id: &PollId) -> Result<bool> {
        self.freeze.verify_definition(poll_id).await
    }

    // ==================== Voting ====================

    pub async fn open_ballot(
        &self,
        poll_id: &PollId,
        requester: RequesterContext,
    ) -> Result<BallotTicket> {
        self.gate.open_ballot(poll_id, requester).await
    }

    pub async fn submit(&self, ballot_id: &BallotId, responses: &[Response]) -> Result<SubmitReceipt> {
        self.ballots.submit(ballot_id, responses).await
    }

    // ==================== Results ====================

    pub async fn compute_statistics(&self, poll_id: &PollId) -> Result<PollStatistics> {
        self.stats.compute(poll_id).await
    }

    /// Open a push feed: snapshot first, then updates and heartbeats
    pub async fn live_feed(&self, poll_id: &PollId) -> Result<LiveFeed> {
        LiveFeed::open(
            *poll_id,
            self.stats.clone(),
            &self.bus,
            self.config.realtime.heartbeat_interval(),
        )
        .await
    }

    /// First frame to write on a new SSE response
    pub fn sse_prelude(&self) -> String {
        sse_retry_frame(self.config.realtime.sse_retry_ms)
    }

    // ==================== Maintenance ====================

    /// Remove expired polls and stale rate-limit windows
    pub async fn prune_expired(&self) -> Result<Vec<PollId>> {
        let removed = prune_expired_polls(self.store.as_ref(), &self.config.retry, Utc::now()).await?;
        let purged = self.limiter.purge_expired()?;
        if purged > 0 {
            tracing::debug!(purged, "expired rate-limit windows dropped");
        }
        Ok(removed)
    }
}
