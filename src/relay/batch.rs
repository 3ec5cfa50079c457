/**
 * ============================================================================
 * BATCH SENDER MODULE
 * ============================================================================
 *
 * PURPOSE: Move pending items from the durable queue to the collector
 *
 * ONE PASS:
 * 1. Require a session and a reachable server
 * 2. Scan the oldest `scan_window` items
 * 3. Greedy pack under the payload ceiling; drop items too big to ever fit
 * 4. Encode {"data": [...]}, gzip, POST with the bearer token
 *    (queue access, packing and gzip run on the blocking pool)
 * 5. Classify the response:
 *    - 2xx:      delete batch, adopt rotated token, mark reachable
 *    - 400/408:  delete batch (collector will never accept it), retry
 *    - 401/403:  clear session, keep batch
 *    - other:    keep batch, mark unreachable, back off
 *    - no reply: keep batch, mark unreachable, back off
 * 6. Recompute the polling interval
 *
 * STATE MACHINE:
 * Idle → Building → Sending → (Backoff | Idle)
 * Exactly one pass runs at a time; an overlapping trigger returns Busy.
 *
 * ============================================================================
 */

use crate::relay::auth::{AuthSession, SessionCredentials};
use crate::relay::client::Collector;
use crate::relay::config::RelayConfig;
use crate::relay::queue::DurableQueue;
use crate::relay::types::{ApplicationMessage, QueueItem, SenderState};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const ENVELOPE_PREFIX: &[u8] = b"{\"data\":[";
pub const ENVELOPE_SUFFIX: &[u8] = b"]}";
pub const ENVELOPE_OVERHEAD: usize = ENVELOPE_PREFIX.len() + ENVELOPE_SUFFIX.len();

/**
 * Batch sender settings, derived from RelayConfig
 */
#[derive(Debug, Clone, PartialEq)]
pub struct SenderConfig {
    pub max_payload_bytes: usize,
    pub scan_window: usize,
    pub min_interval: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub high_water_mark: usize,
    pub slow_round_trip: Duration,
    pub compress: bool,
}

impl From<&RelayConfig> for SenderConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            scan_window: config.scan_window,
            min_interval: Duration::from_millis(config.min_interval_ms),
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            high_water_mark: config.high_water_mark,
            slow_round_trip: Duration::from_millis(config.slow_round_trip_ms),
            compress: config.compress_batches,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

/// One element of the batch body's `data` array
#[derive(Debug, Serialize)]
struct WireRecord<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    message: &'a ApplicationMessage,
}

impl<'a> From<&'a QueueItem> for WireRecord<'a> {
    fn from(item: &'a QueueItem) -> Self {
        Self {
            id: &item.id,
            context: item.context.as_deref(),
            message: &item.message,
        }
    }
}

/**
 * Result of greedy packing
 * `size` is the exact byte length of `body()`
 */
#[derive(Debug, Default)]
pub struct PackedBatch {
    records: Vec<Vec<u8>>,
    pub keys: Vec<i64>,
    pub ids: Vec<String>,
    pub poison_keys: Vec<i64>,
    /// Scanned items either packed or dropped as poison
    pub considered: usize,
    pub size: usize,
}

impl PackedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Uncompressed `{"data":[...]}` body
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.size);
        body.extend_from_slice(ENVELOPE_PREFIX);
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(record);
        }
        body.extend_from_slice(ENVELOPE_SUFFIX);
        body
    }
}

/**
 * Pack items in key order until the next one would cross the ceiling
 * An item that cannot fit even alone is marked poison and skipped
 */
pub fn pack_batch(items: &[QueueItem], ceiling: usize) -> Result<PackedBatch, serde_json::Error> {
    let mut batch = PackedBatch {
        size: ENVELOPE_OVERHEAD,
        ..PackedBatch::default()
    };

    for item in items {
        let record = serde_json::to_vec(&WireRecord::from(item))?;
        if ENVELOPE_OVERHEAD + record.len() > ceiling {
            log::warn!(
                "Dropping oversized item {} ({}, {} bytes exceeds {} byte ceiling)",
                item.id,
                item.message.message_type,
                record.len(),
                ceiling
            );
            batch.poison_keys.push(item.storage_key);
            batch.considered += 1;
            continue;
        }

        let separator = usize::from(!batch.records.is_empty());
        if batch.size + separator + record.len() > ceiling {
            break;
        }
        batch.size += separator + record.len();
        batch.records.push(record);
        batch.keys.push(item.storage_key);
        batch.ids.push(item.id.clone());
        batch.considered += 1;
    }

    Ok(batch)
}

/**
 * Gzip a batch body
 */
pub fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// Gzipped body when enabled; falls back to the plain body if gzip fails
fn encode_body(plain: Vec<u8>, compress: bool) -> (Vec<u8>, bool) {
    if !compress {
        return (plain, false);
    }
    match gzip(&plain) {
        Ok(body) => (body, true),
        Err(e) => {
            log::warn!("Gzip failed, sending batch uncompressed: {}", e);
            (plain, false)
        }
    }
}

/**
 * Run SQLite or encoding work on the blocking pool
 * Errors (including a panicked task) come back as display strings
 */
async fn off_runtime<T, E, F>(work: F) -> Result<T, String>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("blocking task failed: {}", e)),
    }
}

/**
 * Adaptive polling interval
 * - backlog above the high-water mark: minimum
 * - slow round trip: double, capped at maximum
 * - otherwise: 90% (floored), not below minimum
 */
pub fn next_interval(
    current: Duration,
    pending: usize,
    round_trip: Duration,
    config: &SenderConfig,
) -> Duration {
    if pending > config.high_water_mark {
        return config.min_interval;
    }
    if round_trip > config.slow_round_trip {
        return current.saturating_mul(2).min(config.max_interval);
    }
    let decayed = Duration::from_millis((current.as_millis() as f64 * 0.9).floor() as u64);
    decayed.max(config.min_interval)
}

/**
 * How a pass ended
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was already running
    Busy,
    NotAuthenticated,
    Unreachable,
    Empty,
    /// Every scanned item was oversized and dropped
    PoisonOnly,
    Delivered,
    /// 400 or 408, batch dropped
    Rejected { status: u16 },
    /// 401 or 403, session cleared
    Unauthorized { status: u16 },
    ServerError { status: u16 },
    TransportFailure,
    /// The local store failed; nothing was sent
    StoreFailure,
}

/**
 * Summary of one pass for logging and the trigger loop
 */
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub outcome: PassOutcome,
    pub sent: usize,
    pub poisoned: usize,
    /// Run another pass soon instead of waiting a full interval
    pub follow_up: bool,
    pub interval: Duration,
}

/// Counters kept across passes
#[derive(Debug, Clone)]
pub struct SenderStats {
    pub state: SenderState,
    pub total_items_delivered: u64,
    pub last_delivery_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Delivery {
    outcome: PassOutcome,
    sent: usize,
    poisoned: usize,
    follow_up: bool,
}

impl Delivery {
    fn new(outcome: PassOutcome) -> Self {
        Self {
            outcome,
            sent: 0,
            poisoned: 0,
            follow_up: false,
        }
    }
}

/**
 * Single-flight batch sender
 */
pub struct BatchSender {
    queue: Arc<DurableQueue>,
    session: Arc<AuthSession>,
    collector: Arc<dyn Collector>,
    config: SenderConfig,
    busy: AtomicBool,
    reachable: AtomicBool,
    interval: Mutex<Duration>,
    stats: Mutex<SenderStats>,
}

impl BatchSender {
    pub fn new(
        queue: Arc<DurableQueue>,
        session: Arc<AuthSession>,
        collector: Arc<dyn Collector>,
        config: SenderConfig,
    ) -> Self {
        let interval = config.initial_interval;
        Self {
            queue,
            session,
            collector,
            config,
            busy: AtomicBool::new(false),
            reachable: AtomicBool::new(false),
            interval: Mutex::new(interval),
            stats: Mutex::new(SenderStats {
                state: SenderState::Idle,
                total_items_delivered: 0,
                last_delivery_time: None,
                last_error: None,
            }),
        }
    }

    fn stats_lock(&self) -> MutexGuard<'_, SenderStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SenderState) {
        self.stats_lock().state = state;
    }

    fn record_error(&self, error: String) {
        self.stats_lock().last_error = Some(error);
    }

    pub fn current_interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    pub fn set_reachable(&self, reachable: bool) {
        let was = self.reachable.swap(reachable, Ordering::AcqRel);
        if was != reachable {
            log::info!(
                "Collector marked {}",
                if reachable { "reachable" } else { "unreachable" }
            );
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SenderState {
        self.stats_lock().state
    }

    pub fn stats(&self) -> SenderStats {
        self.stats_lock().clone()
    }

    /**
     * Run one pass
     * Returns immediately with Busy if a pass is already in flight
     */
    pub async fn run_pass(&self) -> PassReport {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Batch pass already in flight, skipping trigger");
            return self.report_without_pass(PassOutcome::Busy);
        }
        let _busy = BusyGuard(&self.busy);

        let Some(credentials) = self.session.credentials() else {
            return self.report_without_pass(PassOutcome::NotAuthenticated);
        };
        if !self.is_reachable() {
            return self.report_without_pass(PassOutcome::Unreachable);
        }

        let started = Instant::now();
        let delivery = self.deliver(&credentials).await;
        let round_trip = started.elapsed();
        let interval = self.adjust_interval(round_trip);

        log::debug!(
            "Batch pass {:?}: sent {}, dropped {}, took {:?}, next interval {:?}",
            delivery.outcome,
            delivery.sent,
            delivery.poisoned,
            round_trip,
            interval
        );

        PassReport {
            outcome: delivery.outcome,
            sent: delivery.sent,
            poisoned: delivery.poisoned,
            follow_up: delivery.follow_up,
            interval,
        }
    }

    fn report_without_pass(&self, outcome: PassOutcome) -> PassReport {
        PassReport {
            outcome,
            sent: 0,
            poisoned: 0,
            follow_up: false,
            interval: self.current_interval(),
        }
    }

    fn adjust_interval(&self, round_trip: Duration) -> Duration {
        let pending = self.queue.pending_count();
        let mut interval = self.interval.lock().unwrap_or_else(PoisonError::into_inner);
        let next = next_interval(*interval, pending, round_trip, &self.config);
        if next != *interval {
            log::debug!("Batch interval {:?} -> {:?} ({} pending)", *interval, next, pending);
        }
        *interval = next;
        next
    }

    async fn remove_from_queue(&self, keys: Vec<i64>) -> Result<usize, String> {
        let queue = self.queue.clone();
        off_runtime(move || queue.delete_many(&keys)).await
    }

    async fn deliver(&self, credentials: &SessionCredentials) -> Delivery {
        self.set_state(SenderState::Building);

        let queue = self.queue.clone();
        let window = self.config.scan_window;
        let items = match off_runtime(move || queue.scan(window)).await {
            Ok(items) => items,
            Err(e) => {
                log::error!("Failed to scan queue: {}", e);
                self.record_error(e);
                self.set_state(SenderState::Idle);
                return Delivery::new(PassOutcome::StoreFailure);
            }
        };
        if items.is_empty() {
            self.set_state(SenderState::Idle);
            return Delivery::new(PassOutcome::Empty);
        }

        let scanned = items.len();
        let ceiling = self.config.max_payload_bytes;
        let compress = self.config.compress;
        let packed = off_runtime(move || -> Result<(PackedBatch, Vec<u8>, bool), serde_json::Error> {
            let batch = pack_batch(&items, ceiling)?;
            if batch.is_empty() {
                return Ok((batch, Vec::new(), false));
            }
            let (body, compressed) = encode_body(batch.body(), compress);
            Ok((batch, body, compressed))
        })
        .await;
        let (batch, body, compressed) = match packed {
            Ok(packed) => packed,
            Err(e) => {
                log::error!("Failed to encode batch records: {}", e);
                self.record_error(e);
                self.set_state(SenderState::Idle);
                return Delivery::new(PassOutcome::StoreFailure);
            }
        };

        let poisoned = batch.poison_keys.len();
        if poisoned > 0 {
            if let Err(e) = self.remove_from_queue(batch.poison_keys.clone()).await {
                log::error!("Failed to delete {} oversized items: {}", poisoned, e);
            }
        }

        if batch.is_empty() {
            self.set_state(SenderState::Idle);
            return Delivery {
                outcome: PassOutcome::PoisonOnly,
                sent: 0,
                poisoned,
                follow_up: poisoned > 0,
            };
        }

        let more_pending = scanned >= self.config.scan_window || batch.considered < scanned;

        log::info!(
            "Sending batch of {} items ({} bytes, {} on the wire)",
            batch.len(),
            batch.size,
            body.len()
        );
        self.set_state(SenderState::Sending);

        let reply = match self
            .collector
            .send_batch(&credentials.token, &credentials.username, body, compressed)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Batch delivery failed: {}", e);
                self.set_reachable(false);
                self.record_error(e.to_string());
                self.set_state(SenderState::Backoff);
                return Delivery {
                    outcome: PassOutcome::TransportFailure,
                    sent: 0,
                    poisoned,
                    follow_up: false,
                };
            }
        };

        let status = reply.status;
        match status {
            200..=299 => {
                if let Err(e) = self.remove_from_queue(batch.keys.clone()).await {
                    log::error!("Delivered batch could not be removed from queue: {}", e);
                    self.record_error(e);
                }
                if let Some(new_token) = reply.ack.new_token {
                    if let Err(e) = self.session.rotate(new_token, reply.ack.new_expires_at) {
                        log::warn!("Failed to persist rotated token: {}", e);
                    }
                }
                if !reply.ack.arrived_ids.is_empty() {
                    log::debug!("Collector acknowledged {} ids", reply.ack.arrived_ids.len());
                }
                self.set_reachable(true);
                {
                    let mut stats = self.stats_lock();
                    stats.total_items_delivered += batch.len() as u64;
                    stats.last_delivery_time = Some(Utc::now());
                    stats.last_error = None;
                    stats.state = SenderState::Idle;
                }
                log::info!("Delivered {} items", batch.len());
                Delivery {
                    outcome: PassOutcome::Delivered,
                    sent: batch.len(),
                    poisoned,
                    follow_up: more_pending,
                }
            }
            400 | 408 => {
                log::error!(
                    "Collector rejected batch with {}, dropping {} items",
                    status,
                    batch.len()
                );
                if let Err(e) = self.remove_from_queue(batch.keys.clone()).await {
                    log::error!("Rejected batch could not be removed from queue: {}", e);
                }
                self.record_error(format!("batch rejected with status {}", status));
                self.set_state(SenderState::Idle);
                Delivery {
                    outcome: PassOutcome::Rejected { status },
                    sent: 0,
                    poisoned,
                    follow_up: true,
                }
            }
            401 | 403 => {
                log::warn!("Collector refused session ({}), logging out", status);
                if let Err(e) = self.session.clear() {
                    log::error!("Failed to clear session: {}", e);
                }
                self.record_error(format!("session refused with status {}", status));
                self.set_state(SenderState::Idle);
                Delivery {
                    outcome: PassOutcome::Unauthorized { status },
                    sent: 0,
                    poisoned,
                    follow_up: false,
                }
            }
            _ => {
                log::warn!("Collector answered {}, keeping batch queued", status);
                self.set_reachable(false);
                self.record_error(format!("collector answered status {}", status));
                self.set_state(SenderState::Backoff);
                Delivery {
                    outcome: PassOutcome::ServerError { status },
                    sent: 0,
                    poisoned,
                    follow_up: false,
                }
            }
        }
    }
}
