//! Eligibility Gate
//!
//! Decides whether a requester may start a ballot. Checks run in a fixed
//! order and the first failure wins: poll exists, poll is committed, the
//! voting window is open, the request is well formed (and carries an email
//! when the poll is identified), the allow-list admits it, no submitted
//! ballot exists for the device or voter, and the attempt quota is not
//! exhausted.
//!
//! Only the requester's own open ballot is ever resumed: on identified polls
//! a device may also carry another voter's ballot, which is never handed out.
//!
//! Duplicate prevention is best effort. Two first visits from the same
//! device can both pass the duplicate check; stores with a uniqueness
//! constraint close that gap and the violation is translated back into a
//! resume or `Conflict` here.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::config::RetryConfig;
use crate::crypto::{AttemptLimiter, CryptoUtils, SaltedHasher, SignalPurpose};
use crate::invalid_input_error;
use crate::store::{PollStore, with_retry};
use crate::types::{
    Ballot, BallotTicket, IdentityMode, Poll, PollId, RequesterContext, Visibility, WindowState,
    normalize_email,
};
use crate::{Error, Result};

/// Hashed fraud signals for one request
struct Signals {
    device_token: String,
    device_hash: String,
    user_agent_hash: Option<String>,
    ip_hash: Option<String>,
}

#[derive(Clone)]
pub struct EligibilityGate {
    store: Arc<dyn PollStore>,
    hasher: Arc<SaltedHasher>,
    limiter: Arc<AttemptLimiter>,
    retry: RetryConfig,
}

impl EligibilityGate {
    pub fn new(
        store: Arc<dyn PollStore>,
        hasher: Arc<SaltedHasher>,
        limiter: Arc<AttemptLimiter>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            hasher,
            limiter,
            retry,
        }
    }

    /// Open a ballot for `poll_id`, or resume the requester's open one
    pub async fn open_ballot(
        &self,
        poll_id: &PollId,
        requester: RequesterContext,
    ) -> Result<BallotTicket> {
        let poll = with_retry(&self.retry, || self.store.get_poll(poll_id))
            .await?
            .ok_or_else(|| Error::not_found("Poll"))?;

        if !poll.is_committed() {
            return Err(Error::invalid_state("Poll is not committed"));
        }
        match poll.window_state(Utc::now()) {
            WindowState::NotYetOpen => return Err(Error::invalid_state("Poll is not open yet")),
            WindowState::Closed => return Err(Error::invalid_state("Poll has closed")),
            WindowState::Open => {}
        }

        requester.validate()?;
        let voter_ref = self.voter_ref(&poll, &requester).await?;

        let signals = self.signals(poll_id, &requester);

        if let Some(ticket) = self
            .resume_or_reject(poll_id, &signals, voter_ref.as_deref())
            .await?
        {
            return Ok(ticket);
        }

        let rate_key = format!("poll:{poll_id}:device:{}", signals.device_hash);
        if let Err(err) = self.limiter.check_and_increment(&rate_key) {
            tracing::warn!(
                %poll_id,
                device = &signals.device_hash[..12],
                "ballot creation rate limited"
            );
            return Err(err);
        }

        let ballot = Ballot {
            id: Uuid::new_v4(),
            poll_id: *poll_id,
            anonymous: poll.identity_mode != IdentityMode::Identified,
            voter_ref: voter_ref.clone(),
            submitted_at: None,
            origin_ip_hash: signals.ip_hash.clone(),
            device_token_hash: Some(signals.device_hash.clone()),
            user_agent_hash: signals.user_agent_hash.clone(),
            created_at: Utc::now(),
        };

        match self.store.insert_ballot(&ballot).await {
            Ok(()) => {}
            Err(Error::UniqueViolation { constraint }) => {
                tracing::info!(%poll_id, %constraint, "concurrent ballot creation detected");
                return self
                    .resume_or_reject(poll_id, &signals, voter_ref.as_deref())
                    .await?
                    .ok_or_else(|| Error::conflict("A ballot for this poll already exists"));
            }
            Err(err) => return Err(err),
        }

        tracing::info!(%poll_id, ballot_id = %ballot.id, "ballot opened");
        Ok(BallotTicket {
            ballot_id: ballot.id,
            poll_id: *poll_id,
            device_token: signals.device_token,
            resumed: false,
        })
    }

    /// The voter reference to record, enforcing identity and allow-list rules
    async fn voter_ref(&self, poll: &Poll, requester: &RequesterContext) -> Result<Option<String>> {
        if poll.identity_mode != IdentityMode::Identified {
            return Ok(None);
        }

        let email = requester
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| invalid_input_error!("Email is required for this poll"))?;

        if poll.visibility == Visibility::Listed {
            let normalized = normalize_email(email);
            let items =
                with_retry(&self.retry, || self.store.list_eligibility_items(&poll.id)).await?;
            if !items.iter().any(|item| item.email == normalized) {
                return Err(Error::forbidden("This email is not on the poll's list"));
            }
        }

        Ok(Some(email.to_string()))
    }

    fn signals(&self, poll_id: &PollId, requester: &RequesterContext) -> Signals {
        let device_token = requester
            .device_token
            .clone()
            .unwrap_or_else(CryptoUtils::generate_device_token);
        let device_hash = self
            .hasher
            .hash(&device_token, poll_id, SignalPurpose::Device);
        let user_agent_hash = requester
            .user_agent
            .as_deref()
            .filter(|ua| !ua.is_empty())
            .map(|ua| self.hasher.hash(ua, poll_id, SignalPurpose::UserAgent));
        let ip_hash = requester
            .source_ip
            .map(|ip| self.hasher.hash(&ip.to_string(), poll_id, SignalPurpose::Ip));

        Signals {
            device_token,
            device_hash,
            user_agent_hash,
            ip_hash,
        }
    }

    /// `Conflict` if any matching ballot is submitted, `Some` ticket for the
    /// requester's own open ballot, `None` when there is nothing to resume
    async fn resume_or_reject(
        &self,
        poll_id: &PollId,
        signals: &Signals,
        voter_ref: Option<&str>,
    ) -> Result<Option<BallotTicket>> {
        let existing = with_retry(&self.retry, || {
            self.store
                .find_duplicate_ballots(poll_id, &signals.device_hash, voter_ref)
        })
        .await?;

        if existing.iter().any(Ballot::is_submitted) {
            return Err(Error::conflict("You have already voted in this poll"));
        }

        let own = existing
            .into_iter()
            .find(|ballot| ballot.voter_ref.as_deref() == voter_ref);
        Ok(own.map(|ballot| {
            tracing::info!(%poll_id, ballot_id = %ballot.id, "open ballot resumed");
            BallotTicket {
                ballot_id: ballot.id,
                poll_id: *poll_id,
                device_token: signals.device_token.clone(),
                resumed: true,
            }
        }))
    }
}
