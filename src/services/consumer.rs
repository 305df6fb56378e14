//! Consumption coordinator: the per-mode delivery loop.
//!
//! A single [`NotificationConsumer`] is built from the resolved
//! [`RuntimeConfig`]; record vs. batch iteration and the acknowledgment
//! branch (auto / manual / transactional) are internal selections, not
//! separate listener types. The broker-free per-unit pipeline lives in
//! [`DeliveryPipeline`] so the failure/retry/routing semantics can be
//! exercised without a broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::{sleep, timeout, Instant};

use crate::config::{
    CommitStrategy, ConsumerMode, DeadLetterSinkKind, ExceptionStrategy, RuntimeConfig,
};
use crate::error::{ConsumerError, ProcessingError, Result};
use crate::metrics::{ConsumerMetrics, UnitOutcome};
use crate::models::{FailureClass, InboundMessage};
use crate::services::dead_letter::{DatabaseSink, DeadLetterRouter, DeadLetterSink, TopicSink};
use crate::services::error_store::ErrorStore;
use crate::services::processor::{EventProcessor, NotificationProcessor};
use crate::services::retry::RetryPolicy;
use crate::services::smir_client::SmirClient;

const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal state of one element of a delivery unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementTerminal {
    Succeeded,
    DeadLettered(FailureClass),
}

/// Broker-free processing of one delivery unit: dispatch, failure
/// classification, local retry and dead-letter routing.
pub struct DeliveryPipeline {
    processor: Arc<dyn EventProcessor>,
    router: DeadLetterRouter,
    retry: RetryPolicy,
    exception_strategy: ExceptionStrategy,
    exception_strategy_smir: ExceptionStrategy,
}

impl DeliveryPipeline {
    pub fn new(
        processor: Arc<dyn EventProcessor>,
        router: DeadLetterRouter,
        retry: RetryPolicy,
        exception_strategy: ExceptionStrategy,
        exception_strategy_smir: ExceptionStrategy,
    ) -> Self {
        DeliveryPipeline {
            processor,
            router,
            retry,
            exception_strategy,
            exception_strategy_smir,
        }
    }

    fn strategy_for(&self, class: FailureClass) -> ExceptionStrategy {
        match class {
            FailureClass::Generic => self.exception_strategy,
            FailureClass::DependencyRateLimited => self.exception_strategy_smir,
        }
    }

    /// Process every element of the unit to a terminal state. A failing
    /// element never aborts the rest of the unit; only a dead-letter sink
    /// failure does, because the commit strategy must decide what happens
    /// to the whole unit then.
    pub async fn handle_unit(&self, unit: &[InboundMessage]) -> Result<UnitOutcome> {
        let mut outcome = UnitOutcome::default();
        for msg in unit {
            match self.handle_element(msg).await? {
                ElementTerminal::Succeeded => outcome.succeeded += 1,
                ElementTerminal::DeadLettered(FailureClass::Generic) => {
                    outcome.generic_dead_letters += 1
                }
                ElementTerminal::DeadLettered(FailureClass::DependencyRateLimited) => {
                    outcome.smir_dead_letters += 1
                }
            }
        }
        Ok(outcome)
    }

    async fn handle_element(&self, msg: &InboundMessage) -> Result<ElementTerminal> {
        let mut error = match self.processor.process(&msg.payload).await {
            Ok(()) => return Ok(ElementTerminal::Succeeded),
            Err(e) => e,
        };
        let mut class = error.failure_class();

        // The silent strategy routes on first failure; redelivery only runs
        // when the failure would otherwise propagate. The SMIR class skips
        // redelivery entirely when exempted by configuration.
        if self.strategy_for(class) == ExceptionStrategy::Throw {
            let mut remaining = self.retry.redeliveries_for(class);
            while remaining > 0 {
                sleep(self.retry.interval()).await;
                tracing::warn!(
                    partition = msg.partition,
                    offset = msg.offset,
                    remaining,
                    "Redelivering failed message: {}",
                    error
                );
                match self.processor.process(&msg.payload).await {
                    Ok(()) => return Ok(ElementTerminal::Succeeded),
                    Err(e) => {
                        error = e;
                        class = error.failure_class();
                    }
                }
                remaining = remaining.min(self.retry.redeliveries_for(class)).saturating_sub(1);
            }
        }

        self.route_failure(msg, &error, class).await?;
        Ok(ElementTerminal::DeadLettered(class))
    }

    async fn route_failure(
        &self,
        msg: &InboundMessage,
        error: &ProcessingError,
        class: FailureClass,
    ) -> Result<()> {
        self.router.route(msg, &error.to_string(), class).await
    }
}

/// The delivery loop bound to one broker consumer.
pub struct NotificationConsumer {
    consumer: StreamConsumer,
    producer: Option<Arc<FutureProducer>>,
    pipeline: DeliveryPipeline,
    metrics: Arc<ConsumerMetrics>,
    config: Arc<RuntimeConfig>,
}

impl NotificationConsumer {
    /// Build one coordinator from the resolved configuration. `worker_id`
    /// keeps transactional producer ids unique across the worker pool.
    pub fn from_config(
        config: Arc<RuntimeConfig>,
        metrics: Arc<ConsumerMetrics>,
        pool: Option<sqlx::PgPool>,
        worker_id: usize,
    ) -> Result<Self> {
        let consumer = build_stream_consumer(&config)?;
        consumer.subscribe(&[config.topic.as_str()])?;
        tracing::info!(
            topic = %config.topic,
            group = %config.group_id,
            mode = ?config.mode,
            strategy = ?config.commit_strategy,
            "Subscribed notification consumer"
        );

        let needs_producer = config.dead_letter_sink == DeadLetterSinkKind::Topic
            || config.commit_strategy == CommitStrategy::Transactional;
        let producer = if needs_producer {
            Some(Arc::new(build_producer(&config, worker_id)?))
        } else {
            None
        };

        let sink: Arc<dyn DeadLetterSink> = match config.dead_letter_sink {
            DeadLetterSinkKind::Topic => Arc::new(TopicSink::new(
                producer.clone().expect("producer built for topic sink"),
                config.dead_letter_topic.clone(),
                config.dead_letter_topic_smir.clone(),
            )),
            DeadLetterSinkKind::Database => {
                let pool = pool.ok_or(crate::config::ConfigError::Missing("DATABASE_URL"))?;
                Arc::new(DatabaseSink::new(ErrorStore::new(pool)))
            }
        };

        let processor: Arc<dyn EventProcessor> = Arc::new(NotificationProcessor::new(
            SmirClient::new(config.smir_base_url.clone()),
        ));
        let pipeline = DeliveryPipeline::new(
            processor,
            DeadLetterRouter::new(sink),
            RetryPolicy::from_config(&config),
            config.exception_strategy,
            config.exception_strategy_smir,
        );

        Ok(NotificationConsumer {
            consumer,
            producer,
            pipeline,
            metrics,
            config,
        })
    }

    /// Run the delivery loop until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        if self.config.commit_strategy == CommitStrategy::Transactional {
            let producer = self.producer.as_ref().expect("transactional producer");
            producer.init_transactions(TRANSACTION_TIMEOUT)?;
            tracing::info!("Transactional producer initialized");
        }

        loop {
            let unit = self.next_unit().await;
            if unit.is_empty() {
                continue;
            }
            tracing::info!(
                size = unit.len(),
                strategy = ?self.config.commit_strategy,
                "Delivery unit received"
            );

            self.metrics.mark_unit_start();

            match self.config.commit_strategy {
                CommitStrategy::Auto | CommitStrategy::Manual => {
                    match self.pipeline.handle_unit(&unit).await {
                        Ok(outcome) => {
                            self.metrics.apply(&outcome);
                            if let Err(e) = self.acknowledge(&unit) {
                                tracing::error!(
                                    "Failed to acknowledge delivery unit, it will be redelivered: {}",
                                    e
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                "Delivery unit failed, not acknowledging, it will be redelivered: {}",
                                e
                            );
                        }
                    }
                }
                CommitStrategy::Transactional => {
                    if let Err(e) = self.run_in_transaction(&unit).await {
                        tracing::error!("Transactional delivery unit failed: {}", e);
                    }
                }
            }

            self.metrics.log_progress(self.config.commit_strategy);
        }
    }

    /// Assemble the next delivery unit: one message in record mode, or up
    /// to `max_batch_size` messages accumulated within `max_poll_interval`
    /// in batch mode.
    async fn next_unit(&self) -> Vec<InboundMessage> {
        let first = loop {
            match self.consumer.recv().await {
                Ok(msg) => break InboundMessage::from_borrowed(&msg),
                Err(e) => {
                    tracing::warn!("Kafka consumer error: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        };

        if self.config.mode == ConsumerMode::Record {
            return vec![first];
        }

        let mut unit = vec![first];
        let deadline = Instant::now() + self.config.max_poll_interval;
        while unit.len() < self.config.max_batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(msg)) => unit.push(InboundMessage::from_borrowed(&msg)),
                Ok(Err(e)) => {
                    tracing::warn!("Kafka consumer error while batching: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }
        unit
    }

    /// Acknowledge a fully terminal delivery unit per the active strategy.
    fn acknowledge(&self, unit: &[InboundMessage]) -> Result<()> {
        match self.config.commit_strategy {
            CommitStrategy::Auto => {
                tracing::debug!("Auto commit strategy, skipping explicit commit");
                Ok(())
            }
            CommitStrategy::Manual => match unit_offsets(unit) {
                Some(tpl) => {
                    let mode = if self.config.sync_commits {
                        CommitMode::Sync
                    } else {
                        CommitMode::Async
                    };
                    self.consumer.commit(&tpl, mode)?;
                    self.metrics.record_commit();
                    tracing::info!("Committed delivery unit offsets");
                    Ok(())
                }
                None => {
                    tracing::error!("Acknowledgment handle absent, skipping commit");
                    Ok(())
                }
            },
            CommitStrategy::Transactional => Ok(()),
        }
    }

    /// Wrap the whole unit in a produce-consume transaction: offset advance
    /// and any dead-letter produces become visible atomically. An escaping
    /// failure aborts the transaction and rewinds so the unit is redelivered
    /// in full, including elements that had already succeeded.
    async fn run_in_transaction(&self, unit: &[InboundMessage]) -> Result<()> {
        let producer = self.producer.as_ref().expect("transactional producer");
        producer.begin_transaction()?;

        let outcome = match self.pipeline.handle_unit(unit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Rolling back delivery unit: {}", e);
                self.abort_and_rewind(unit);
                return Err(e);
            }
        };

        if let Err(e) = self.commit_transaction(unit) {
            tracing::warn!("Transaction commit failed, rolling back: {}", e);
            self.abort_and_rewind(unit);
            return Err(e);
        }

        self.metrics.apply(&outcome);
        self.metrics.record_transaction();
        tracing::info!(size = unit.len(), "Kafka transaction committed for delivery unit");
        Ok(())
    }

    fn commit_transaction(&self, unit: &[InboundMessage]) -> Result<()> {
        let producer = self.producer.as_ref().expect("transactional producer");
        let tpl = unit_offsets(unit).ok_or(ConsumerError::MissingGroupMetadata)?;
        let group_metadata = self
            .consumer
            .group_metadata()
            .ok_or(ConsumerError::MissingGroupMetadata)?;
        producer.send_offsets_to_transaction(&tpl, &group_metadata, TRANSACTION_TIMEOUT)?;
        producer.commit_transaction(TRANSACTION_TIMEOUT)?;
        Ok(())
    }

    fn abort_and_rewind(&self, unit: &[InboundMessage]) {
        let producer = self.producer.as_ref().expect("transactional producer");
        if let Err(e) = producer.abort_transaction(TRANSACTION_TIMEOUT) {
            tracing::error!("Failed to abort Kafka transaction: {}", e);
        }
        // Seek back to the start of the unit so every element is redelivered.
        for ((topic, partition), offset) in first_offsets(unit) {
            if let Err(e) =
                self.consumer
                    .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
            {
                tracing::error!(
                    topic = %topic,
                    partition,
                    offset,
                    "Failed to rewind partition after rollback: {}",
                    e
                );
            }
        }
    }
}

/// Offsets to acknowledge for a unit: the highest offset plus one for every
/// partition it touched. `None` when the unit carries no offsets to commit.
pub fn unit_offsets(unit: &[InboundMessage]) -> Option<TopicPartitionList> {
    if unit.is_empty() {
        return None;
    }
    let mut highest: BTreeMap<(String, i32), i64> = BTreeMap::new();
    for msg in unit {
        let entry = highest
            .entry((msg.topic.clone(), msg.partition))
            .or_insert(msg.offset);
        *entry = (*entry).max(msg.offset);
    }
    let mut tpl = TopicPartitionList::new();
    for ((topic, partition), offset) in highest {
        tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
            .ok()?;
    }
    Some(tpl)
}

fn first_offsets(unit: &[InboundMessage]) -> BTreeMap<(String, i32), i64> {
    let mut lowest: BTreeMap<(String, i32), i64> = BTreeMap::new();
    for msg in unit {
        let entry = lowest
            .entry((msg.topic.clone(), msg.partition))
            .or_insert(msg.offset);
        *entry = (*entry).min(msg.offset);
    }
    lowest
}

fn build_stream_consumer(config: &RuntimeConfig) -> Result<StreamConsumer> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "30000")
        .set("heartbeat.interval.ms", "3000")
        .set(
            "enable.auto.commit",
            if config.commit_strategy == CommitStrategy::Auto {
                "true"
            } else {
                "false"
            },
        );

    if config.mode == ConsumerMode::Batch {
        client_config.set(
            "max.poll.interval.ms",
            config.max_poll_interval.as_millis().to_string(),
        );
    }
    if config.commit_strategy == CommitStrategy::Transactional {
        client_config.set("isolation.level", "read_committed");
    }

    Ok(client_config.create()?)
}

fn build_producer(config: &RuntimeConfig, worker_id: usize) -> Result<FutureProducer> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("message.timeout.ms", "30000");

    if config.commit_strategy == CommitStrategy::Transactional {
        client_config.set(
            "transactional.id",
            format!("{}-txn-{}", config.group_id, worker_id),
        );
    }

    Ok(client_config.create()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HeaderValue;
    use rdkafka::topic_partition_list::TopicPartitionListElem;

    fn message(partition: i32, offset: i64) -> InboundMessage {
        InboundMessage {
            topic: "notifications".to_string(),
            partition,
            offset,
            key: None,
            payload: String::new(),
            headers: Vec::<(String, HeaderValue)>::new(),
        }
    }

    fn offset_of(elem: TopicPartitionListElem<'_>) -> i64 {
        match elem.offset() {
            Offset::Offset(o) => o,
            other => panic!("unexpected offset {:?}", other),
        }
    }

    #[test]
    fn test_unit_offsets_empty_unit_has_no_handle() {
        assert!(unit_offsets(&[]).is_none());
    }

    #[test]
    fn test_unit_offsets_commits_next_offset_per_partition() {
        let unit = vec![message(0, 5), message(0, 6), message(1, 9)];
        let tpl = unit_offsets(&unit).unwrap();
        assert_eq!(tpl.count(), 2);
        let p0 = tpl.find_partition("notifications", 0).unwrap();
        assert_eq!(offset_of(p0), 7);
        let p1 = tpl.find_partition("notifications", 1).unwrap();
        assert_eq!(offset_of(p1), 10);
    }

    #[test]
    fn test_first_offsets_for_rewind() {
        let unit = vec![message(0, 5), message(0, 6), message(1, 9)];
        let lowest = first_offsets(&unit);
        assert_eq!(lowest[&("notifications".to_string(), 0)], 5);
        assert_eq!(lowest[&("notifications".to_string(), 1)], 9);
    }
}
