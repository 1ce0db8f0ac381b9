//! Aggregation Engine
//!
//! Statistics are recomputed from Vote and Ballot rows on every call, so the
//! output is a pure function of stored state. Only the poll lookup is
//! essential; every other read degrades to empty/zero on failure so
//! dashboards stay up through transient store trouble.
//!
//! The `VoteAggregate` cache is read-repaired after a clean computation and
//! is never read back into the statistics.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use crate::config::RetryConfig;
use crate::store::{BallotFilter, PollStore, with_retry};
use crate::types::{
    OptionId, PollId, PollOption, Question, QuestionId, QuestionKind, Vote, VoteAggregate,
};
use crate::{Error, Result};

/// Snapshot served to viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatistics {
    pub poll: PollHeader,
    pub ballots: BallotSnapshot,
    pub questions: Vec<QuestionStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollHeader {
    pub id: PollId,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotSnapshot {
    pub total_issued: u64,
    pub total_submitted: u64,
    /// Vote rows, not ballots
    pub total_votes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStat {
    pub id: QuestionId,
    pub prompt: String,
    pub kind: QuestionKind,
    /// Distinct ballots with at least one row for this question
    pub participants: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<OptionStat>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionStat {
    pub option_id: OptionId,
    pub label: String,
    pub count: u64,
    pub participants: u64,
    /// `count / participants * 100`, or 0 when nobody answered
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextStat {
    pub responses: u64,
}

impl PollStatistics {
    pub fn question(&self, question_id: &QuestionId) -> Option<&QuestionStat> {
        self.questions.iter().find(|q| q.id == *question_id)
    }
}

impl QuestionStat {
    pub fn option(&self, option_id: &OptionId) -> Option<&OptionStat> {
        self.options.as_ref()?.iter().find(|o| o.option_id == *option_id)
    }
}

/// Share of participants, defined as 0 when there are none
pub fn percentage(count: u64, participants: u64) -> f64 {
    if participants == 0 {
        0.0
    } else {
        count as f64 / participants as f64 * 100.0
    }
}

/// Computes [`PollStatistics`] on demand
#[derive(Clone)]
pub struct StatisticsEngine {
    store: Arc<dyn PollStore>,
    retry: RetryConfig,
}

impl StatisticsEngine {
    pub fn new(store: Arc<dyn PollStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Compute statistics for `poll_id` from current store state
    pub async fn compute(&self, poll_id: &PollId) -> Result<PollStatistics> {
        let poll = with_retry(&self.retry, || self.store.get_poll(poll_id))
            .await?
            .ok_or_else(|| Error::not_found("Poll"))?;

        let mut degraded = false;

        let total_issued = self
            .degrade(poll_id, "count issued ballots", &mut degraded, 0, || {
                self.store.count_ballots(poll_id, BallotFilter::All)
            })
            .await;
        let total_submitted = self
            .degrade(poll_id, "count submitted ballots", &mut degraded, 0, || {
                self.store.count_ballots(poll_id, BallotFilter::Submitted)
            })
            .await;
        let votes = self
            .degrade(poll_id, "list votes", &mut degraded, Vec::new(), || {
                self.store.list_votes(poll_id)
            })
            .await;
        let questions = self
            .degrade(poll_id, "list questions", &mut degraded, Vec::new(), || {
                self.store.list_questions(poll_id)
            })
            .await;

        let question_ids: Vec<QuestionId> = questions.iter().map(|q| q.id).collect();
        let options = if question_ids.is_empty() {
            Vec::new()
        } else {
            self.degrade(poll_id, "list options", &mut degraded, Vec::new(), || {
                self.store.list_options(&question_ids)
            })
            .await
        };

        let stats = PollStatistics {
            poll: PollHeader {
                id: poll.id,
                title: poll.title,
                description: poll.description,
            },
            ballots: BallotSnapshot {
                total_issued,
                total_submitted,
                total_votes: votes.len() as u64,
            },
            questions: aggregate_questions(questions, options, &votes),
        };

        if !degraded {
            self.repair_aggregate_cache(poll_id, &stats).await;
        }

        Ok(stats)
    }

    async fn degrade<T, F, Fut>(
        &self,
        poll_id: &PollId,
        what: &str,
        degraded: &mut bool,
        fallback: T,
        operation: F,
    ) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match with_retry(&self.retry, operation).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%poll_id, "statistics query '{what}' failed, using empty result: {err}");
                *degraded = true;
                fallback
            }
        }
    }

    /// Rewrite the cache when it disagrees with the freshly computed counts
    async fn repair_aggregate_cache(&self, poll_id: &PollId, stats: &PollStatistics) {
        let expected = expected_aggregates(stats);

        let cached = match self.store.list_aggregates(poll_id).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!(%poll_id, "aggregate cache unreadable, skipping repair: {err}");
                return;
            }
        };
        let cached: BTreeMap<(QuestionId, Option<OptionId>), u64> = cached
            .into_iter()
            .map(|row| ((row.question_id, row.option_id), row.count))
            .collect();

        if cached == expected {
            return;
        }

        let now = Utc::now();
        let rows: Vec<VoteAggregate> = expected
            .into_iter()
            .map(|((question_id, option_id), count)| VoteAggregate {
                poll_id: *poll_id,
                question_id,
                option_id,
                count,
                updated_at: now,
            })
            .collect();

        match self.store.replace_aggregates(poll_id, &rows).await {
            Ok(()) => tracing::info!(%poll_id, rows = rows.len(), "aggregate cache repaired"),
            Err(err) => tracing::warn!(%poll_id, "aggregate cache repair failed: {err}"),
        }
    }
}

fn expected_aggregates(stats: &PollStatistics) -> BTreeMap<(QuestionId, Option<OptionId>), u64> {
    let mut expected = BTreeMap::new();
    for question in &stats.questions {
        if let Some(options) = &question.options {
            for option in options {
                expected.insert((question.id, Some(option.option_id)), option.count);
            }
        }
        if let Some(text) = &question.text {
            expected.insert((question.id, None), text.responses);
        }
    }
    expected
}

fn aggregate_questions(
    questions: Vec<Question>,
    options: Vec<PollOption>,
    votes: &[Vote],
) -> Vec<QuestionStat> {
    let mut options_by_question: HashMap<QuestionId, Vec<PollOption>> = HashMap::new();
    for option in options {
        options_by_question
            .entry(option.question_id)
            .or_default()
            .push(option);
    }

    let mut votes_by_question: HashMap<QuestionId, Vec<&Vote>> = HashMap::new();
    for vote in votes {
        votes_by_question.entry(vote.question_id).or_default().push(vote);
    }

    questions
        .into_iter()
        .map(|question| {
            let responses = votes_by_question
                .get(&question.id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let participants = responses
                .iter()
                .map(|vote| vote.ballot_id)
                .collect::<HashSet<_>>()
                .len() as u64;

            if question.kind == QuestionKind::Text {
                let answered = responses
                    .iter()
                    .filter(|vote| vote.free_text.as_deref().is_some_and(|t| !t.trim().is_empty()))
                    .count() as u64;
                return QuestionStat {
                    id: question.id,
                    prompt: question.prompt,
                    kind: question.kind,
                    participants,
                    options: None,
                    text: Some(TextStat { responses: answered }),
                };
            }

            let mut question_options = options_by_question.remove(&question.id).unwrap_or_default();
            question_options.sort_by_key(|option| (option.order_index, option.id));

            let option_stats = question_options
                .into_iter()
                .map(|option| {
                    let count = responses
                        .iter()
                        .filter(|vote| vote.option_id == Some(option.id))
                        .count() as u64;
                    OptionStat {
                        option_id: option.id,
                        label: option.label,
                        count,
                        participants,
                        percentage: percentage(count, participants),
                    }
                })
                .collect();

            QuestionStat {
                id: question.id,
                prompt: question.prompt,
                kind: question.kind,
                participants,
                options: Some(option_stats),
                text: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BallotId;
    use uuid::Uuid;

    fn question(poll_id: PollId, kind: QuestionKind, order_index: u32) -> Question {
        Question {
            id: Uuid::new_v4(),
            poll_id,
            kind,
            prompt: format!("Question {order_index}"),
            order_index,
        }
    }

    fn option(question_id: QuestionId, label: &str, order_index: u32) -> PollOption {
        PollOption {
            id: Uuid::new_v4(),
            question_id,
            label: label.to_string(),
            order_index,
        }
    }

    fn vote(
        ballot_id: BallotId,
        question: &Question,
        option_id: Option<OptionId>,
        text: Option<&str>,
    ) -> Vote {
        Vote {
            id: Uuid::new_v4(),
            ballot_id,
            poll_id: question.poll_id,
            question_id: question.id,
            option_id,
            free_text: text.map(str::to_string),
            weight: 1,
        }
    }

    #[test]
    fn test_percentage_guard() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(3, 0), 0.0);
        assert_eq!(percentage(1, 4), 25.0);
    }

    #[test]
    fn test_multi_select_participants_are_distinct_ballots() {
        let poll_id = Uuid::new_v4();
        let q = question(poll_id, QuestionKind::Multi, 0);
        let a = option(q.id, "A", 0);
        let b = option(q.id, "B", 1);
        let c = option(q.id, "C", 2);

        let ballot_1 = Uuid::new_v4();
        let ballot_2 = Uuid::new_v4();
        let votes = vec![
            vote(ballot_1, &q, Some(a.id), None),
            vote(ballot_1, &q, Some(b.id), None),
            vote(ballot_2, &q, Some(a.id), None),
        ];

        let stats = aggregate_questions(vec![q.clone()], vec![c.clone(), a.clone(), b.clone()], &votes);
        let stat = &stats[0];

        assert_eq!(stat.participants, 2);
        let options = stat.options.as_ref().unwrap();
        // Ordered by order index regardless of input order
        assert_eq!(
            options.iter().map(|o| o.label.as_str()).collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert_eq!(options[0].count, 2);
        assert_eq!(options[0].percentage, 100.0);
        assert_eq!(options[1].count, 1);
        assert_eq!(options[1].percentage, 50.0);
        assert_eq!(options[2].count, 0);
        assert_eq!(options[2].percentage, 0.0);
    }

    #[test]
    fn test_unanswered_question_has_zero_percentages() {
        let poll_id = Uuid::new_v4();
        let q = question(poll_id, QuestionKind::Single, 0);
        let a = option(q.id, "A", 0);

        let stats = aggregate_questions(vec![q], vec![a], &[]);
        assert_eq!(stats[0].participants, 0);
        let options = stats[0].options.as_ref().unwrap();
        assert_eq!(options[0].percentage, 0.0);
        assert!(options[0].percentage.is_finite());
    }

    #[test]
    fn test_text_question_reports_response_count_only() {
        let poll_id = Uuid::new_v4();
        let q = question(poll_id, QuestionKind::Text, 0);
        let votes = vec![
            vote(Uuid::new_v4(), &q, None, Some("hello")),
            vote(Uuid::new_v4(), &q, None, Some("world")),
        ];

        let stats = aggregate_questions(vec![q], Vec::new(), &votes);
        assert_eq!(stats[0].participants, 2);
        assert!(stats[0].options.is_none());
        assert_eq!(stats[0].text, Some(TextStat { responses: 2 }));
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let poll_id = Uuid::new_v4();
        let q = question(poll_id, QuestionKind::Text, 0);
        let stats = PollStatistics {
            poll: PollHeader {
                id: poll_id,
                title: "T".into(),
                description: None,
            },
            ballots: BallotSnapshot::default(),
            questions: aggregate_questions(vec![q], Vec::new(), &[]),
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["ballots"]["totalIssued"], 0);
        assert_eq!(json["questions"][0]["text"]["responses"], 0);
        assert!(json["questions"][0].get("options").is_none());
    }
}
