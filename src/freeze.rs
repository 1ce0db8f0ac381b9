//! Definition Freeze
//!
//! `commit` turns a draft poll into a votable one exactly once. It stamps
//! `committed_at` and a content hash over the canonical definition; the
//! store's compare-and-set makes a second commit fail `InvalidState` even
//! when two owners' requests race.
//!
//! For listed polls the allow-list is then invited by mail. Delivery is best
//! effort: failures are logged, never returned, and never undo the commit.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::{MailConfig, RetryConfig};
use crate::crypto::{CryptoUtils, Hash};
use crate::store::{PollStore, with_retry};
use crate::types::{
    CommitReceipt, EligibilityItemId, IdentityMode, Poll, PollId, PollOption, Question,
    QuestionKind, Timestamp, Visibility, normalize_email,
};
use crate::{Error, Result};

/// Domain prefix mixed into every definition hash
const DEFINITION_HASH_DOMAIN: &[u8] = b"ballotbox poll definition v1\0";

/// One outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail sender used for commit-time invitations
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Whether sending is possible at all
    fn is_configured(&self) -> bool;

    async fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Mailer for deployments without outbound mail
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    fn is_configured(&self) -> bool {
        false
    }

    async fn send(&self, _message: &MailMessage) -> Result<()> {
        Err(Error::internal("Mail delivery is not configured"))
    }
}

/// In-process outbox; keeps every delivered message for inspection
#[derive(Debug, Default)]
pub struct OutboxMailer {
    from: Option<String>,
    sent: Mutex<Vec<MailMessage>>,
    rejected: Mutex<HashSet<String>>,
}

impl OutboxMailer {
    pub fn new(config: &MailConfig) -> Self {
        Self {
            from: config.is_configured().then(|| config.from.clone()).flatten(),
            ..Self::default()
        }
    }

    /// Make delivery to `address` fail from now on
    pub fn reject(&self, address: &str) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.insert(normalize_email(address));
        }
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    fn is_configured(&self) -> bool {
        self.from.is_some()
    }

    async fn send(&self, message: &MailMessage) -> Result<()> {
        let rejected = self
            .rejected
            .lock()
            .map_err(|_| Error::internal("Outbox lock poisoned"))?
            .contains(&normalize_email(&message.to));
        if rejected {
            return Err(Error::internal("Recipient rejected"));
        }

        self.sent
            .lock()
            .map_err(|_| Error::internal("Outbox lock poisoned"))?
            .push(message.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct CanonicalDefinition<'a> {
    id: &'a PollId,
    owner_id: &'a str,
    title: &'a str,
    description: Option<&'a str>,
    visibility: Visibility,
    identity_mode: IdentityMode,
    opens_at: Option<Timestamp>,
    closes_at: Option<Timestamp>,
    questions: Vec<CanonicalQuestion<'a>>,
}

#[derive(Serialize)]
struct CanonicalQuestion<'a> {
    id: &'a uuid::Uuid,
    kind: QuestionKind,
    prompt: &'a str,
    order_index: u32,
    options: Vec<CanonicalOption<'a>>,
}

#[derive(Serialize)]
struct CanonicalOption<'a> {
    id: &'a uuid::Uuid,
    label: &'a str,
    order_index: u32,
}

/// Content hash over a poll's definition.
///
/// Questions and options are put in `(order_index, id)` order first, so the
/// result does not depend on the order rows come back from the store. Any
/// change to metadata, a prompt, a label, a kind or an order index changes it.
/// Options whose question is not in `questions` are ignored.
pub fn definition_hash(poll: &Poll, questions: &[Question], options: &[PollOption]) -> Result<String> {
    Ok(CryptoUtils::hash_to_hex(&definition_digest(poll, questions, options)?))
}

fn definition_digest(poll: &Poll, questions: &[Question], options: &[PollOption]) -> Result<Hash> {
    let mut by_question: BTreeMap<uuid::Uuid, Vec<&PollOption>> = BTreeMap::new();
    for option in options {
        by_question.entry(option.question_id).or_default().push(option);
    }

    let mut ordered: Vec<&Question> = questions.iter().collect();
    ordered.sort_by_key(|q| (q.order_index, q.id));

    let canonical = CanonicalDefinition {
        id: &poll.id,
        owner_id: &poll.owner_id,
        title: &poll.title,
        description: poll.description.as_deref(),
        visibility: poll.visibility,
        identity_mode: poll.identity_mode,
        opens_at: poll.opens_at,
        closes_at: poll.closes_at,
        questions: ordered
            .into_iter()
            .map(|question| {
                let mut question_options = by_question.remove(&question.id).unwrap_or_default();
                question_options.sort_by_key(|o| (o.order_index, o.id));
                CanonicalQuestion {
                    id: &question.id,
                    kind: question.kind,
                    prompt: &question.prompt,
                    order_index: question.order_index,
                    options: question_options
                        .into_iter()
                        .map(|o| CanonicalOption {
                            id: &o.id,
                            label: &o.label,
                            order_index: o.order_index,
                        })
                        .collect(),
                }
            })
            .collect(),
    };

    let encoded = serde_json::to_vec(&canonical)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(DEFINITION_HASH_DOMAIN);
    hasher.update(&encoded);
    Ok(hasher.finalize().into())
}

/// Commit and verification of poll definitions
#[derive(Clone)]
pub struct DefinitionFreeze {
    store: Arc<dyn PollStore>,
    mailer: Arc<dyn Mailer>,
    retry: RetryConfig,
}

impl DefinitionFreeze {
    pub fn new(store: Arc<dyn PollStore>, mailer: Arc<dyn Mailer>, retry: RetryConfig) -> Self {
        Self {
            store,
            mailer,
            retry,
        }
    }

    /// Freeze `poll_id` on behalf of `actor`
    pub async fn commit(&self, poll_id: &PollId, actor: Option<&str>) -> Result<CommitReceipt> {
        let actor = actor
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(Error::Unauthorized)?;

        let poll = with_retry(&self.retry, || self.store.get_poll(poll_id))
            .await?
            .ok_or_else(|| Error::not_found("Poll"))?;

        if poll.owner_id != actor {
            return Err(Error::forbidden("Only the poll owner can commit it"));
        }
        if poll.is_committed() {
            return Err(Error::invalid_state("Poll is already committed"));
        }

        let questions = with_retry(&self.retry, || self.store.list_questions(poll_id)).await?;
        if questions.is_empty() {
            return Err(Error::invalid_state("Poll has no questions"));
        }
        let question_ids: Vec<_> = questions.iter().map(|q| q.id).collect();
        let options = with_retry(&self.retry, || self.store.list_options(&question_ids)).await?;

        let hash = definition_hash(&poll, &questions, &options)?;
        let committed_at = Utc::now();

        // Not retried: a timed-out write may have landed, and a retry would
        // then report the poll as already committed.
        if !self.store.mark_committed(poll_id, committed_at, &hash).await? {
            return Err(Error::invalid_state("Poll is already committed"));
        }

        tracing::info!(%poll_id, definition_hash = %hash, questions = questions.len(), "poll committed");

        let invitations_sent = if poll.visibility == Visibility::Listed {
            self.send_invitations(&poll).await
        } else {
            0
        };

        Ok(CommitReceipt {
            poll_id: *poll_id,
            definition_hash: hash,
            committed_at,
            invitations_sent,
        })
    }

    /// Recompute the hash of a committed poll and compare it with the stored one
    pub async fn verify_definition(&self, poll_id: &PollId) -> Result<bool> {
        let poll = with_retry(&self.retry, || self.store.get_poll(poll_id))
            .await?
            .ok_or_else(|| Error::not_found("Poll"))?;
        let Some(stored) = poll.definition_hash.clone() else {
            return Err(Error::invalid_state("Poll is not committed"));
        };

        let questions = with_retry(&self.retry, || self.store.list_questions(poll_id)).await?;
        let question_ids: Vec<_> = questions.iter().map(|q| q.id).collect();
        let options = with_retry(&self.retry, || self.store.list_options(&question_ids)).await?;

        let actual = definition_digest(&poll, &questions, &options)?;
        let matches = match CryptoUtils::hex_to_hash(&stored) {
            Ok(expected) => CryptoUtils::constant_time_eq(&actual, &expected),
            Err(_) => false,
        };
        if !matches {
            tracing::warn!(%poll_id, "stored definition hash does not match poll contents");
        }
        Ok(matches)
    }

    /// Invite every not-yet-invited address once; returns items marked invited
    async fn send_invitations(&self, poll: &Poll) -> usize {
        let poll_id = poll.id;
        if !self.mailer.is_configured() {
            tracing::warn!(%poll_id, "mail is not configured, skipping invitations");
            return 0;
        }

        let items = match with_retry(&self.retry, || self.store.list_eligibility_items(&poll_id)).await
        {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(%poll_id, "could not load eligibility list for invitations: {err}");
                return 0;
            }
        };

        let mut recipients: BTreeMap<String, Vec<EligibilityItemId>> = BTreeMap::new();
        for item in items.iter().filter(|item| !item.invited) {
            recipients
                .entry(normalize_email(&item.email))
                .or_default()
                .push(item.id);
        }

        let mut delivered = Vec::new();
        let mut failed = 0usize;
        for (address, item_ids) in recipients {
            let message = invitation(poll, &address);
            match self.mailer.send(&message).await {
                Ok(()) => delivered.extend(item_ids),
                Err(err) => {
                    failed += 1;
                    tracing::warn!(%poll_id, "invitation delivery failed: {err}");
                }
            }
        }

        if delivered.is_empty() {
            return 0;
        }
        if let Err(err) = self.store.mark_invited(&delivered).await {
            tracing::warn!(%poll_id, "could not mark invitations as sent: {err}");
            return 0;
        }

        tracing::info!(%poll_id, invited = delivered.len(), failed, "invitations sent");
        delivered.len()
    }
}

fn invitation(poll: &Poll, address: &str) -> MailMessage {
    let mut body = format!("You have been invited to vote in \"{}\".\n", poll.title);
    if let Some(description) = &poll.description {
        body.push_str(&format!("\n{description}\n"));
    }
    if let Some(closes_at) = poll.closes_at {
        body.push_str(&format!("\nVoting closes at {}.\n", closes_at.to_rfc3339()));
    }
    body.push_str(&format!("\nPoll reference: {}\n", poll.id));

    MailMessage {
        to: address.to_string(),
        subject: format!("You're invited to vote: {}", poll.title),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fixture() -> (Poll, Vec<Question>, Vec<PollOption>) {
        let poll = Poll {
            id: Uuid::new_v4(),
            owner_id: "owner".into(),
            title: "Offsite".into(),
            description: Some("Where to?".into()),
            visibility: Visibility::Public,
            identity_mode: IdentityMode::Anonymous,
            opens_at: None,
            closes_at: None,
            committed_at: None,
            definition_hash: None,
            version: 1,
            created_at: Utc::now(),
        };
        let questions = vec![
            Question {
                id: Uuid::new_v4(),
                poll_id: poll.id,
                kind: QuestionKind::Single,
                prompt: "City".into(),
                order_index: 0,
            },
            Question {
                id: Uuid::new_v4(),
                poll_id: poll.id,
                kind: QuestionKind::Text,
                prompt: "Comments".into(),
                order_index: 1,
            },
        ];
        let options = ["Lisbon", "Porto", "Faro"]
            .iter()
            .enumerate()
            .map(|(i, label)| PollOption {
                id: Uuid::new_v4(),
                question_id: questions[0].id,
                label: label.to_string(),
                order_index: i as u32,
            })
            .collect();
        (poll, questions, options)
    }

    #[test]
    fn test_hash_ignores_row_order() {
        let (poll, questions, options) = fixture();
        let baseline = definition_hash(&poll, &questions, &options).unwrap();

        let mut shuffled_q = questions.clone();
        shuffled_q.reverse();
        let mut shuffled_o = options.clone();
        shuffled_o.rotate_left(1);

        assert_eq!(definition_hash(&poll, &shuffled_q, &shuffled_o).unwrap(), baseline);
        assert_eq!(baseline.len(), 64);
    }

    #[test]
    fn test_hash_tracks_content() {
        let (poll, questions, options) = fixture();
        let baseline = definition_hash(&poll, &questions, &options).unwrap();

        let mut relabeled = options.clone();
        relabeled[1].label = "Braga".into();
        assert_ne!(definition_hash(&poll, &questions, &relabeled).unwrap(), baseline);

        let mut reordered = options.clone();
        reordered[0].order_index = 5;
        assert_ne!(definition_hash(&poll, &questions, &reordered).unwrap(), baseline);

        let mut reworded = questions.clone();
        reworded[1].prompt = "Anything else?".into();
        assert_ne!(definition_hash(&poll, &reworded, &options).unwrap(), baseline);

        let mut retitled = poll.clone();
        retitled.title = "Offsite 2".into();
        assert_ne!(definition_hash(&retitled, &questions, &options).unwrap(), baseline);
    }

    #[test]
    fn test_hash_ignores_commit_stamp() {
        let (poll, questions, options) = fixture();
        let baseline = definition_hash(&poll, &questions, &options).unwrap();

        let mut committed = poll.clone();
        committed.committed_at = Some(Utc::now());
        committed.definition_hash = Some(baseline.clone());
        assert_eq!(definition_hash(&committed, &questions, &options).unwrap(), baseline);
    }

    #[tokio::test]
    async fn test_outbox_mailer() {
        let unconfigured = OutboxMailer::new(&MailConfig::default());
        assert!(!unconfigured.is_configured());

        let mailer = OutboxMailer::new(&MailConfig {
            from: Some("polls@example.test".into()),
        });
        assert!(mailer.is_configured());

        mailer.reject("Bounce@Example.test");
        let bounced = MailMessage {
            to: "bounce@example.test".into(),
            subject: "s".into(),
            body: "b".into(),
        };
        assert!(mailer.send(&bounced).await.is_err());
        assert!(mailer.sent().is_empty());
    }
}
