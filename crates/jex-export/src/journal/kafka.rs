//! librdkafka-backed journal
//!
//! Consumers never join a rebalancing group: partitions are assigned
//! manually, auto-commit is off and offsets are committed explicitly by the
//! worker once a batch is exported.

use jex_common::{JexError, Offset, PartitionId, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::topic_partition_list::{Offset as KafkaOffset, TopicPartitionList};
use rdkafka::Message;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{JournalClient, JournalFactory, JournalMessage, JournalMetadata, JournalPoll};

/// Upper bound for a single fetched message (500 MiB)
const MAX_MESSAGE_BYTES: &str = "524288000";

fn kafka_err(context: &str, err: KafkaError) -> JexError {
    JexError::journal(format!("{}: {}", context, err))
}

/// Kafka journal configured from a broker list and extra librdkafka properties
#[derive(Debug, Clone)]
pub struct KafkaJournal {
    brokers: String,
    properties: BTreeMap<String, String>,
    timeout: Duration,
}

impl KafkaJournal {
    pub fn new(brokers: impl Into<String>, properties: BTreeMap<String, String>, timeout: Duration) -> Self {
        Self {
            brokers: brokers.into(),
            properties,
            timeout,
        }
    }

    fn client_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "true")
            .set("message.max.bytes", MAX_MESSAGE_BYTES)
            .set("fetch.message.max.bytes", MAX_MESSAGE_BYTES);
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }

    fn consumer(&self, group_id: &str) -> Result<BaseConsumer> {
        self.client_config(group_id)
            .create()
            .map_err(|e| kafka_err("failed to create consumer", e))
    }
}

impl JournalFactory for KafkaJournal {
    fn metadata(&self) -> Result<Arc<dyn JournalMetadata>> {
        Ok(Arc::new(KafkaMetadata {
            consumer: self.consumer("jex-metadata")?,
            timeout: self.timeout,
        }))
    }

    fn client(&self, group_id: &str) -> Result<Box<dyn JournalClient>> {
        debug!(group_id = %group_id, brokers = %self.brokers, "Creating Kafka consumer");
        Ok(Box::new(KafkaClient {
            consumer: self.consumer(group_id)?,
            timeout: self.timeout,
            topic: None,
            positions: BTreeMap::new(),
        }))
    }
}

struct KafkaMetadata {
    consumer: BaseConsumer,
    timeout: Duration,
}

impl JournalMetadata for KafkaMetadata {
    fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), self.timeout)
            .map_err(|e| kafka_err("failed to fetch topic metadata", e))?;

        let topic_meta = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| JexError::journal(format!("unknown topic '{}'", topic)))?;
        if let Some(err) = topic_meta.error() {
            return Err(JexError::journal(format!("topic '{}' metadata error: {:?}", topic, err)));
        }

        Ok(topic_meta.partitions().iter().map(|p| p.id()).collect())
    }

    fn watermarks(&self, topic: &str, partition: PartitionId) -> Result<(Offset, Offset)> {
        self.consumer
            .fetch_watermarks(topic, partition, self.timeout)
            .map_err(|e| kafka_err("failed to fetch watermarks", e))
    }
}

struct KafkaClient {
    consumer: BaseConsumer,
    timeout: Duration,
    topic: Option<String>,
    /// Position (next offset) of every delivered partition
    positions: BTreeMap<PartitionId, Offset>,
}

impl KafkaClient {
    /// Position of a partition that just reported its end. The consumer has
    /// then moved past any trailing control records; without a position the
    /// high watermark is the end.
    fn end_position(&self, partition: PartitionId) -> Result<Offset> {
        let topic = self
            .topic
            .as_deref()
            .ok_or_else(|| JexError::journal("end of partition reported before any assignment"))?;
        let positions = self
            .consumer
            .position()
            .map_err(|e| kafka_err("failed to read consumer position", e))?;
        if let Some(KafkaOffset::Offset(position)) = positions
            .find_partition(topic, partition)
            .map(|elem| elem.offset())
        {
            return Ok(position);
        }
        let (_, high) = self
            .consumer
            .fetch_watermarks(topic, partition, self.timeout)
            .map_err(|e| kafka_err("failed to fetch watermarks", e))?;
        Ok(high)
    }
}

impl JournalClient for KafkaClient {
    fn assign(&mut self, topic: &str, partitions: &[PartitionId]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for &partition in partitions {
            let offset = match self.positions.get(&partition) {
                Some(&position) => KafkaOffset::Offset(position),
                None => KafkaOffset::Stored,
            };
            tpl.add_partition_offset(topic, partition, offset)
                .map_err(|e| kafka_err("invalid partition offset", e))?;
        }
        self.positions.retain(|p, _| partitions.contains(p));
        self.topic = Some(topic.to_string());

        if partitions.is_empty() {
            self.consumer
                .unassign()
                .map_err(|e| kafka_err("failed to unassign partitions", e))
        } else {
            self.consumer
                .assign(&tpl)
                .map_err(|e| kafka_err("failed to assign partitions", e))
        }
    }

    fn committed(
        &mut self,
        topic: &str,
        partitions: &[PartitionId],
    ) -> Result<Vec<(PartitionId, Option<Offset>)>> {
        let mut tpl = TopicPartitionList::new();
        for &partition in partitions {
            tpl.add_partition(topic, partition);
        }
        let committed = self
            .consumer
            .committed_offsets(tpl, self.timeout)
            .map_err(|e| kafka_err("failed to read committed offsets", e))?;

        Ok(committed
            .elements()
            .iter()
            .map(|elem| {
                let offset = match elem.offset() {
                    KafkaOffset::Offset(n) if n >= 0 => Some(n),
                    _ => None,
                };
                (elem.partition(), offset)
            })
            .collect())
    }

    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<JournalPoll> {
        let deadline = Instant::now() + timeout;
        let mut polled = JournalPoll::default();

        while polled.messages.len() < max_messages {
            let idle = polled.messages.is_empty() && polled.end_of_partition.is_empty();
            let wait = if idle {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            match self.consumer.poll(wait) {
                None => break,
                Some(Err(KafkaError::PartitionEOF(partition))) => {
                    let position = self.end_position(partition)?;
                    trace!(partition, position, "Reached end of partition");
                    self.positions.insert(partition, position);
                    polled.end_of_partition.push((partition, position));
                },
                Some(Err(e)) => return Err(kafka_err("failed to poll journal", e)),
                Some(Ok(message)) => {
                    self.positions
                        .insert(message.partition(), message.offset() + 1);
                    polled.messages.push(JournalMessage {
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(<[u8]>::to_vec),
                        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    });
                },
            }

            if polled.messages.is_empty() && Instant::now() >= deadline {
                break;
            }
        }

        Ok(polled)
    }

    fn commit(&mut self, topic: &str, positions: &BTreeMap<PartitionId, Offset>) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (&partition, &position) in positions {
            tpl.add_partition_offset(topic, partition, KafkaOffset::Offset(position))
                .map_err(|e| kafka_err("invalid commit offset", e))?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| kafka_err("failed to commit offsets", e))
    }
}
