//! An in-process store backing both the monitored and the lease container.
//!
//! Documents are hashed onto a 16-bit effective partition key space split across physical
//! partitions. Every write gets the next global LSN, which is also its etag in the change
//! feed. Partitions can be split and merged at runtime, and faults can be queued for the next
//! feed read or lease-container operation.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt::Display,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use twox_hash::XxHash64;

use crate::{
    classifier::MAX_ITEM_COUNT_TOO_LARGE_MESSAGE,
    error::{GONE, PARTITION_KEY_RANGE_GONE, StoreError},
    item::{ChangeFeedMetaData, ChangeFeedProcessorItem, OperationType},
    range::{MAX_EPK, MIN_EPK, PartitionKeyRange, Range},
    request::{ChangeFeedRequest, FeedType, RoutingMode},
    request_options::RequestOptions,
    time::{SystemProvider, TimeProvider},
};

use super::{ChangeFeedContextClient, FeedResponse, VersionedItem, WriteOutcome};

const BAD_REQUEST: u16 = 400;
const DEFAULT_PAGE_SIZE: u32 = 100;

/// Numeric upper bound of the EPK space, matching [`MAX_EPK`].
const EPK_SPACE: u32 = 0xFF00;

/// Effective partition key of `partition_key`: four upper-case hex digits below `FF00`.
pub fn effective_partition_key(partition_key: &str) -> String {
    let hash = XxHash64::oneshot(0, partition_key.as_bytes());
    format!("{:04X}", hash % u64::from(EPK_SPACE))
}

fn epk_to_num(epk: &str) -> u32 {
    if epk.is_empty() {
        return 0;
    }
    let padded = format!("{epk:0<4}");
    u32::from_str_radix(&padded[..4], 16).unwrap_or(EPK_SPACE)
}

fn num_to_epk(n: u32) -> String {
    match n {
        0 => MIN_EPK.to_string(),
        n if n >= EPK_SPACE => MAX_EPK.to_string(),
        n => format!("{n:04X}"),
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    lsn: u64,
    key: (String, String),
    epk: String,
    operation: OperationType,
    current: Value,
    previous: Option<Value>,
    previous_lsn: u64,
    timestamp_ms: i64,
    ttl_expired: bool,
}

#[derive(Debug, Default)]
struct MemState {
    lsn: u64,
    next_range_id: u64,
    partitions: Vec<PartitionKeyRange>,
    log: Vec<LogEntry>,
    documents: HashMap<(String, String), (Value, u64)>,
    items: BTreeMap<String, VersionedItem>,
    /// Partition key each item was created under.
    item_partition_keys: HashMap<String, Option<String>>,
    item_version: u64,
    item_latency: Option<Duration>,
    max_page_size: Option<u32>,
    feed_faults: VecDeque<StoreError>,
    item_faults: VecDeque<StoreError>,
    feed_reads: u64,
}

impl MemState {
    fn next_partition_id(&mut self) -> String {
        let id = self.next_range_id;
        self.next_range_id += 1;
        id.to_string()
    }

    fn overlapping(&self, range: &Range) -> Vec<PartitionKeyRange> {
        self.partitions
            .iter()
            .filter(|p| p.to_range().overlaps(range))
            .cloned()
            .collect()
    }

    fn is_superseded(&self, entry: &LogEntry) -> bool {
        self.documents
            .get(&entry.key)
            .is_none_or(|(_, lsn)| *lsn != entry.lsn)
    }

    fn next_item_etag(&mut self) -> String {
        self.item_version += 1;
        format!("\"{}\"", self.item_version)
    }

    fn item_fault(&mut self) -> Result<(), StoreError> {
        match self.item_faults.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether item `id` is addressable under `partition_key`. Requests without a key see
    /// every item.
    fn item_visible(&self, id: &str, partition_key: Option<&str>) -> bool {
        let Some(partition_key) = partition_key else {
            return self.items.contains_key(id);
        };
        self.item_partition_keys
            .get(id)
            .is_some_and(|stored| stored.as_deref() == Some(partition_key))
    }
}

#[derive(Debug)]
pub struct InMemoryContextClient {
    container_rid: String,
    time_provider: Arc<dyn TimeProvider>,
    default_end_to_end_timeout: Option<Duration>,
    state: Mutex<MemState>,
}

impl InMemoryContextClient {
    /// A container with `partition_count` (at least one) equally sized physical partitions.
    pub fn new(container_rid: impl Into<String>, partition_count: usize) -> Self {
        let partition_count = partition_count.clamp(1, EPK_SPACE as usize) as u32;
        let mut state = MemState::default();
        let width = EPK_SPACE / partition_count;
        for i in 0..partition_count {
            let min = i * width;
            let max = if i + 1 == partition_count {
                EPK_SPACE
            } else {
                (i + 1) * width
            };
            let id = state.next_partition_id();
            state
                .partitions
                .push(PartitionKeyRange::new(id, num_to_epk(min), num_to_epk(max)));
        }

        Self {
            container_rid: container_rid.into(),
            time_provider: Arc::new(SystemProvider::new()),
            default_end_to_end_timeout: None,
            state: Mutex::new(state),
        }
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    /// Latency budget for lease-container requests that keep the default latency policy.
    pub fn with_default_end_to_end_timeout(mut self, timeout: Duration) -> Self {
        self.default_end_to_end_timeout = Some(timeout);
        self
    }

    /// Create or replace the document `body["id"]` under `partition_key`. Returns its LSN.
    pub fn upsert_document(&self, partition_key: &str, body: Value) -> u64 {
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let timestamp_ms = self.time_provider.now().timestamp_millis();

        let mut state = self.state.lock();
        state.lsn += 1;
        let lsn = state.lsn;
        let key = (partition_key.to_string(), id);
        let previous = state.documents.insert(key.clone(), (body.clone(), lsn));
        let (operation, previous_lsn) = match &previous {
            Some((_, previous_lsn)) => (OperationType::Replace, *previous_lsn),
            None => (OperationType::Create, 0),
        };
        state.log.push(LogEntry {
            lsn,
            epk: effective_partition_key(partition_key),
            key,
            operation,
            current: body,
            previous: None,
            previous_lsn,
            timestamp_ms,
            ttl_expired: false,
        });
        lsn
    }

    /// Delete a document. Returns the LSN of the delete, `None` if there was no such document.
    pub fn delete_document(&self, partition_key: &str, id: &str) -> Option<u64> {
        self.remove_document(partition_key, id, false)
    }

    /// Delete a document as if its time-to-live had expired.
    pub fn expire_document(&self, partition_key: &str, id: &str) -> Option<u64> {
        self.remove_document(partition_key, id, true)
    }

    fn remove_document(&self, partition_key: &str, id: &str, ttl_expired: bool) -> Option<u64> {
        let timestamp_ms = self.time_provider.now().timestamp_millis();

        let mut state = self.state.lock();
        let key = (partition_key.to_string(), id.to_string());
        let (previous, previous_lsn) = state.documents.remove(&key)?;
        state.lsn += 1;
        let lsn = state.lsn;
        state.log.push(LogEntry {
            lsn,
            epk: effective_partition_key(partition_key),
            key,
            operation: OperationType::Delete,
            current: json!({}),
            previous: Some(previous),
            previous_lsn,
            timestamp_ms,
            ttl_expired,
        });
        Some(lsn)
    }

    /// Most recent LSN of the container.
    pub fn latest_lsn(&self) -> u64 {
        self.state.lock().lsn
    }

    pub fn partitions(&self) -> Vec<PartitionKeyRange> {
        self.state.lock().partitions.clone()
    }

    /// Split physical partition `id` in two at the middle of its range.
    pub fn split_partition(
        &self,
        id: &str,
    ) -> Result<(PartitionKeyRange, PartitionKeyRange), StoreError> {
        let mut state = self.state.lock();
        let index = state
            .partitions
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| StoreError::not_found(format!("partition {id}")))?;

        let parent = state.partitions[index].clone();
        let min = epk_to_num(&parent.min_inclusive);
        let max = epk_to_num(&parent.max_exclusive);
        if max - min < 2 {
            return Err(StoreError::status(
                BAD_REQUEST,
                0,
                format!("partition {id} is too small to split"),
            ));
        }
        let mid = num_to_epk(min + (max - min) / 2);

        let mut parents = parent.parents.clone();
        parents.push(parent.id.clone());

        let mut left = PartitionKeyRange::new(
            state.next_partition_id(),
            parent.min_inclusive.clone(),
            mid.clone(),
        );
        left.parents = parents.clone();
        let mut right =
            PartitionKeyRange::new(state.next_partition_id(), mid, parent.max_exclusive);
        right.parents = parents;

        state
            .partitions
            .splice(index..=index, [left.clone(), right.clone()]);
        Ok((left, right))
    }

    /// Merge two adjacent physical partitions.
    pub fn merge_partitions(
        &self,
        left_id: &str,
        right_id: &str,
    ) -> Result<PartitionKeyRange, StoreError> {
        let mut state = self.state.lock();
        let index = state
            .partitions
            .iter()
            .position(|p| p.id == left_id)
            .ok_or_else(|| StoreError::not_found(format!("partition {left_id}")))?;
        let adjacent = state
            .partitions
            .get(index + 1)
            .is_some_and(|p| p.id == right_id);
        if !adjacent {
            return Err(StoreError::status(
                BAD_REQUEST,
                0,
                format!("partitions {left_id} and {right_id} are not adjacent"),
            ));
        }

        let left = state.partitions[index].clone();
        let right = state.partitions[index + 1].clone();
        let mut merged = PartitionKeyRange::new(
            state.next_partition_id(),
            left.min_inclusive,
            right.max_exclusive,
        );
        merged.parents = vec![left.id, right.id];

        state
            .partitions
            .splice(index..=index + 1, [merged.clone()]);
        Ok(merged)
    }

    /// Fail change feed reads asking for more than `max` items with a page-size error.
    pub fn set_max_page_size(&self, max: Option<u32>) {
        self.state.lock().max_page_size = max;
    }

    /// Fail the next change feed read with `e`.
    pub fn inject_feed_fault(&self, e: StoreError) {
        self.state.lock().feed_faults.push_back(e);
    }

    /// Delay every lease-container operation by `latency`.
    pub fn set_item_latency(&self, latency: Option<Duration>) {
        self.state.lock().item_latency = latency;
    }

    /// Fail the next lease-container operation with `e`.
    pub fn inject_item_fault(&self, e: StoreError) {
        self.state.lock().item_faults.push_back(e);
    }

    /// Number of change feed reads served or failed so far.
    pub fn feed_read_count(&self) -> u64 {
        self.state.lock().feed_reads
    }

    /// Snapshot of the lease container.
    pub fn items(&self) -> Vec<VersionedItem> {
        self.state.lock().items.values().cloned().collect()
    }

    fn render(entry: &LogEntry, full_fidelity: bool) -> Result<String, StoreError> {
        if full_fidelity {
            let item = ChangeFeedProcessorItem {
                current: entry.current.clone(),
                previous: entry.previous.clone(),
                metadata: ChangeFeedMetaData {
                    lsn: entry.lsn,
                    previous_image_lsn: entry.previous_lsn,
                    conflict_resolution_timestamp: entry.timestamp_ms / 1_000,
                    operation_type: entry.operation,
                    time_to_live_expired: entry.ttl_expired,
                },
            };
            return Ok(serde_json::to_string(&item)?);
        }

        let mut document = entry.current.clone();
        if let Value::Object(map) = &mut document {
            map.insert("_lsn".to_string(), Value::from(entry.lsn));
            map.insert("_ts".to_string(), Value::from(entry.timestamp_ms / 1_000));
        }
        Ok(serde_json::to_string(&document)?)
    }
}

impl Display for InMemoryContextClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "in_memory({})", self.container_rid)
    }
}

fn parse_etag(etag: &str) -> Result<u64, StoreError> {
    etag.trim_matches('"').parse::<u64>().map_err(|_| {
        StoreError::status(BAD_REQUEST, 0, format!("malformed continuation {etag}"))
    })
}

impl InMemoryContextClient {
    /// Run a lease-container operation after the configured latency, within the request's
    /// latency budget.
    async fn item_op<T, F>(&self, options: &RequestOptions, op: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut MemState) -> Result<T, StoreError> + Send,
    {
        options
            .run_within_budget(self.default_end_to_end_timeout, async move {
                let latency = self.state.lock().item_latency;
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                let mut state = self.state.lock();
                state.item_fault()?;
                op(&mut state)
            })
            .await
    }
}

#[async_trait]
impl ChangeFeedContextClient for InMemoryContextClient {
    async fn read_container_rid(&self) -> Result<String, StoreError> {
        Ok(self.container_rid.clone())
    }

    async fn read_partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>, StoreError> {
        Ok(self.partitions())
    }

    async fn get_overlapping_ranges(
        &self,
        range: &Range,
        _force_refresh: bool,
    ) -> Result<Vec<PartitionKeyRange>, StoreError> {
        Ok(self.state.lock().overlapping(range))
    }

    async fn query_change_feed(
        &self,
        request: &ChangeFeedRequest,
    ) -> Result<FeedResponse, StoreError> {
        let mut state = self.state.lock();
        state.feed_reads += 1;
        if let Some(e) = state.feed_faults.pop_front() {
            return Err(e);
        }

        let page_size = request.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        if state.max_page_size.is_some_and(|max| page_size > max) {
            return Err(StoreError::status(
                BAD_REQUEST,
                0,
                format!("Response size too large. {MAX_ITEM_COUNT_TOO_LARGE_MESSAGE}"),
            ));
        }

        let range = request.effective_range().cloned().unwrap_or_else(Range::full);
        let overlapping = state.overlapping(&range);
        if overlapping.is_empty() {
            return Err(StoreError::not_found(format!("no partition serves {range}")));
        }
        if request.routing_mode == RoutingMode::Direct && overlapping.len() > 1 {
            return Err(StoreError::status(
                GONE,
                PARTITION_KEY_RANGE_GONE,
                format!("{range} spans {} partitions", overlapping.len()),
            ));
        }

        let full_fidelity = request.feed_type == Some(FeedType::FullFidelityFeed);
        let start_lsn = match request.if_none_match.as_deref() {
            Some("*") => state.lsn,
            Some(etag) => parse_etag(etag)?,
            None if full_fidelity => {
                return Err(StoreError::status(
                    BAD_REQUEST,
                    0,
                    "full fidelity change feed must start from now or a continuation",
                ));
            }
            None => 0,
        };
        let since_ms = request.if_modified_since.map(|t| t.timestamp_millis());

        let mut documents = vec![];
        let mut last_lsn = None;
        let mut more = false;
        let candidates = state
            .log
            .iter()
            .filter(|e| e.lsn > start_lsn && range.contains_key(&e.epk))
            .filter(|e| since_ms.is_none_or(|since| e.timestamp_ms >= since))
            .filter(|e| {
                full_fidelity || (e.operation != OperationType::Delete && !state.is_superseded(e))
            });
        for entry in candidates {
            if documents.len() == page_size as usize {
                more = true;
                break;
            }
            documents.push(Self::render(entry, full_fidelity)?);
            last_lsn = Some(entry.lsn);
        }

        let resume_lsn = match last_lsn {
            Some(lsn) if more => lsn,
            _ => state.lsn,
        };
        Ok(FeedResponse {
            documents,
            continuation: Some(format!("\"{resume_lsn}\"")),
            latest_lsn: Some(state.lsn),
        })
    }

    async fn create_item(
        &self,
        id: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<WriteOutcome, StoreError> {
        self.item_op(options, |state| {
            if state.items.contains_key(id) {
                return Ok(WriteOutcome::Conflict);
            }
            let item = VersionedItem {
                id: id.to_string(),
                etag: state.next_item_etag(),
                body,
            };
            state.items.insert(id.to_string(), item.clone());
            state
                .item_partition_keys
                .insert(id.to_string(), options.partition_key.clone());
            Ok(WriteOutcome::Applied(item))
        })
        .await
    }

    async fn read_item(
        &self,
        id: &str,
        options: &RequestOptions,
    ) -> Result<Option<VersionedItem>, StoreError> {
        self.item_op(options, |state| {
            if !state.item_visible(id, options.partition_key.as_deref()) {
                return Ok(None);
            }
            Ok(state.items.get(id).cloned())
        })
        .await
    }

    async fn replace_item(
        &self,
        id: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<WriteOutcome, StoreError> {
        self.item_op(options, |state| {
            let existing = match state.items.get(id) {
                Some(existing) if state.item_visible(id, options.partition_key.as_deref()) => {
                    existing
                }
                _ => return Err(StoreError::not_found(format!("item {id}"))),
            };
            if options
                .if_match
                .as_ref()
                .is_some_and(|etag| *etag != existing.etag)
            {
                return Ok(WriteOutcome::Conflict);
            }
            let item = VersionedItem {
                id: id.to_string(),
                etag: state.next_item_etag(),
                body,
            };
            state.items.insert(id.to_string(), item.clone());
            Ok(WriteOutcome::Applied(item))
        })
        .await
    }

    async fn delete_item(&self, id: &str, options: &RequestOptions) -> Result<(), StoreError> {
        self.item_op(options, |state| {
            if !state.item_visible(id, options.partition_key.as_deref()) {
                return Err(StoreError::not_found(format!("item {id}")));
            }
            state.items.remove(id);
            state.item_partition_keys.remove(id);
            Ok(())
        })
        .await
    }

    async fn query_items(
        &self,
        id_prefix: &str,
        options: &RequestOptions,
    ) -> Result<Vec<VersionedItem>, StoreError> {
        self.item_op(options, |state| {
            Ok(state
                .items
                .values()
                .filter(|item| item.id.starts_with(id_prefix))
                .filter(|item| state.item_visible(&item.id, options.partition_key.as_deref()))
                .cloned()
                .collect())
        })
        .await
    }
}
