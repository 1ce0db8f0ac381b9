use ballotbox::ballot::build_votes;
use ballotbox::crypto::{SaltedHasher, SignalPurpose};
use ballotbox::freeze::definition_hash;
use ballotbox::types::*;
use chrono::Utc;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use uuid::Uuid;

fn definition(questions: usize, options_per_question: usize) -> (Poll, Vec<Question>, Vec<PollOption>) {
    let poll = Poll {
        id: Uuid::new_v4(),
        owner_id: "bench-owner".into(),
        title: "Benchmark poll".into(),
        description: Some("Synthetic definition".into()),
        visibility: Visibility::Public,
        identity_mode: IdentityMode::Anonymous,
        opens_at: None,
        closes_at: None,
        committed_at: None,
        definition_hash: None,
        version: 1,
        created_at: Utc::now(),
    };
    let questions: Vec<Question> = (0..questions)
        .map(|i| Question {
            id: Uuid::new_v4(),
            poll_id: poll.id,
            kind: QuestionKind::Multi,
            prompt: format!("Question number {i}"),
            order_index: i as u32,
        })
        .collect();
    let options = questions
        .iter()
        .flat_map(|q| {
            (0..options_per_question).map(move |j| PollOption {
                id: Uuid::new_v4(),
                question_id: q.id,
                label: format!("Option {j}"),
                order_index: j as u32,
            })
        })
        .collect();
    (poll, questions, options)
}

/// Per-request fraud signal hashing
fn bench_signal_hashing(c: &mut Criterion) {
    let hasher = SaltedHasher::for_testing();
    let poll_id = Uuid::new_v4();

    let mut group = c.benchmark_group("signal_hash");
    group.warm_up_time(Duration::from_millis(100));

    for input_len in [32, 128, 255] {
        let value = "x".repeat(input_len);
        group.bench_with_input(BenchmarkId::new("input_len", input_len), &value, |b, value| {
            b.iter(|| hasher.hash(black_box(value), black_box(&poll_id), SignalPurpose::UserAgent))
        });
    }

    group.finish();
}

/// Commit-time canonical hashing
fn bench_definition_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("definition_hash");
    group.warm_up_time(Duration::from_millis(100));

    for questions in [1, 10, 50] {
        let (poll, qs, options) = definition(questions, 8);
        group.bench_with_input(BenchmarkId::new("questions", questions), &questions, |b, _| {
            b.iter(|| definition_hash(black_box(&poll), black_box(&qs), black_box(&options)).unwrap())
        });
    }

    group.finish();
}

/// Response validation against a frozen definition
fn bench_build_votes(c: &mut Criterion) {
    let (poll, questions, options) = definition(20, 6);
    let ballot = Ballot {
        id: Uuid::new_v4(),
        poll_id: poll.id,
        voter_ref: None,
        anonymous: true,
        submitted_at: None,
        origin_ip_hash: None,
        device_token_hash: None,
        user_agent_hash: None,
        created_at: Utc::now(),
    };
    let responses: Vec<Response> = questions
        .iter()
        .map(|q| {
            let chosen = options
                .iter()
                .filter(|o| o.question_id == q.id)
                .take(3)
                .map(|o| o.id);
            Response::choice(q.id, chosen)
        })
        .collect();

    c.bench_function("build_votes_20x3", |b| {
        b.iter(|| {
            build_votes(
                black_box(&ballot),
                black_box(&questions),
                black_box(&options),
                black_box(&responses),
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_signal_hashing, bench_definition_hash, bench_build_votes);
criterion_main!(benches);
