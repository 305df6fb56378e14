//! Process-wide counters for the consumption layer.
//!
//! [`ConsumerMetrics`] is the one resource shared by concurrent workers, so
//! every counter is atomic. Values live for the process lifetime, feed the
//! per-unit progress log, and are mirrored into prometheus counters served
//! at `/metrics`. They never gate business decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, Opts, TextEncoder};

use crate::config::CommitStrategy;

static MESSAGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| register_counter(
    "notification_consumer_messages_total",
    "Total messages seen by the notification consumer",
));

static COMMITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| register_counter(
    "notification_consumer_commits_total",
    "Total explicit offset commits issued",
));

static TRANSACTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| register_counter(
    "notification_consumer_transactions_total",
    "Total committed produce-consume transactions",
));

static DEAD_LETTERS_GENERIC_TOTAL: Lazy<IntCounter> = Lazy::new(|| register_counter(
    "notification_consumer_dead_letters_generic_total",
    "Messages routed to the generic dead-letter destination",
));

static DEAD_LETTERS_SMIR_TOTAL: Lazy<IntCounter> = Lazy::new(|| register_counter(
    "notification_consumer_dead_letters_smir_total",
    "Messages routed to the SMIR dead-letter destination",
));

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|_| panic!("failed to create {}", name));
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|_| panic!("failed to register {}", name));
    counter
}

/// Terminal-state tally for one delivery unit. Applied to the shared
/// counters only once the unit reaches its commit point, so an aborted
/// transaction contributes nothing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnitOutcome {
    pub succeeded: u64,
    pub generic_dead_letters: u64,
    pub smir_dead_letters: u64,
}

impl UnitOutcome {
    pub fn total(&self) -> u64 {
        self.succeeded + self.generic_dead_letters + self.smir_dead_letters
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_processed: u64,
    pub commits_issued: u64,
    pub transactions_completed: u64,
    pub generic_dead_letters: u64,
    pub smir_dead_letters: u64,
}

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    messages_processed: AtomicU64,
    commits_issued: AtomicU64,
    transactions_completed: AtomicU64,
    generic_dead_letters: AtomicU64,
    smir_dead_letters: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the processing-time clock, but only for the first unit since
    /// the counters were last zero.
    pub fn mark_unit_start(&self) {
        if self.messages_processed.load(Ordering::SeqCst) == 0 {
            let mut started = self.started_at.lock().unwrap_or_else(|e| e.into_inner());
            if started.is_none() {
                *started = Some(Instant::now());
            }
        }
    }

    pub fn apply(&self, outcome: &UnitOutcome) {
        self.messages_processed
            .fetch_add(outcome.total(), Ordering::SeqCst);
        self.generic_dead_letters
            .fetch_add(outcome.generic_dead_letters, Ordering::SeqCst);
        self.smir_dead_letters
            .fetch_add(outcome.smir_dead_letters, Ordering::SeqCst);
        MESSAGES_TOTAL.inc_by(outcome.total());
        DEAD_LETTERS_GENERIC_TOTAL.inc_by(outcome.generic_dead_letters);
        DEAD_LETTERS_SMIR_TOTAL.inc_by(outcome.smir_dead_letters);
    }

    pub fn record_commit(&self) {
        self.commits_issued.fetch_add(1, Ordering::SeqCst);
        COMMITS_TOTAL.inc();
    }

    pub fn record_transaction(&self) {
        self.transactions_completed.fetch_add(1, Ordering::SeqCst);
        TRANSACTIONS_TOTAL.inc();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_processed: self.messages_processed.load(Ordering::SeqCst),
            commits_issued: self.commits_issued.load(Ordering::SeqCst),
            transactions_completed: self.transactions_completed.load(Ordering::SeqCst),
            generic_dead_letters: self.generic_dead_letters.load(Ordering::SeqCst),
            smir_dead_letters: self.smir_dead_letters.load(Ordering::SeqCst),
        }
    }

    /// Per-unit progress log. Best-effort accounting, not part of
    /// correctness.
    pub fn log_progress(&self, strategy: CommitStrategy) {
        let snapshot = self.snapshot();
        tracing::info!(
            "Total time for {} notifications: {} ms",
            snapshot.messages_processed,
            self.elapsed().as_millis()
        );
        if strategy == CommitStrategy::Manual {
            tracing::info!("Total commits: {}", snapshot.commits_issued);
        }
        if strategy == CommitStrategy::Transactional {
            tracing::info!("Total transactions: {}", snapshot.transactions_completed);
        }
        tracing::info!("Total DLT: {}", snapshot.generic_dead_letters);
        tracing::info!("Total DLT SMIR: {}", snapshot.smir_dead_letters);
    }
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
