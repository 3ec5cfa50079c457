/**
 * ============================================================================
 * CAPTURE PIPELINE MODULE
 * ============================================================================
 *
 * PURPOSE: Raw frame → decoded message → filter → durable queue
 *
 * At most one application message is captured per frame. Every drop is an
 * expected outcome, logged at debug level; only a store failure is logged
 * as a warning.
 *
 * Capture does not depend on the session: items are queued while logged
 * out and delivered after the next login.
 *
 * ============================================================================
 */

use crate::relay::decoder::decode_application_message;
use crate::relay::filter::{FilterOutcome, MessageFilter, MessagePolicy};
use crate::relay::queue::DurableQueue;
use crate::relay::transport::FrameHandler;
use crate::relay::types::ApplicationMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// What happened to one frame
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// No event packet with an application message
    NoMessage,
    /// Rejected by the filter (never `Accepted`)
    Dropped(FilterOutcome),
    /// Persisted under this item id
    Queued(String),
    StoreFailed(String),
}

pub struct CapturePipeline {
    filter: Mutex<MessageFilter>,
    queue: Arc<DurableQueue>,
    context: RwLock<Option<String>>,
}

impl CapturePipeline {
    pub fn new(queue: Arc<DurableQueue>, policy: MessagePolicy, dedup_ttl: Duration) -> Self {
        Self {
            filter: Mutex::new(MessageFilter::new(policy, dedup_ttl)),
            queue,
            context: RwLock::new(None),
        }
    }

    fn filter(&self) -> MutexGuard<'_, MessageFilter> {
        self.filter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /**
     * Capture the application message carried by one raw frame
     */
    pub fn ingest(&self, raw_frame: &str) -> CaptureOutcome {
        match decode_application_message(raw_frame) {
            Some(message) => self.ingest_message(message),
            None => CaptureOutcome::NoMessage,
        }
    }

    /**
     * Capture an already decoded message
     * The source context wins over one carried by the message itself
     */
    pub fn ingest_message(&self, message: ApplicationMessage) -> CaptureOutcome {
        let context = self.context().or_else(|| message.context.clone());
        let message_type = message.message_type.clone();

        let item = match self.filter().process(message, context) {
            FilterOutcome::Accepted(item) => item,
            dropped => {
                log::debug!("Dropped {}: {:?}", message_type, dropped);
                return CaptureOutcome::Dropped(dropped);
            }
        };

        match self.queue.enqueue(&item) {
            Ok(_) => {
                log::debug!("Captured {} as {}", item.message.message_type, item.id);
                CaptureOutcome::Queued(item.id)
            }
            Err(e) => {
                log::warn!("Failed to queue {}: {}", item.message.message_type, e);
                CaptureOutcome::StoreFailed(e.to_string())
            }
        }
    }

    pub fn set_context(&self, context: Option<String>) {
        if let Some(context) = &context {
            log::info!("Capture context set to {}", context);
        }
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = context;
    }

    pub fn context(&self) -> Option<String> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget recent fingerprints so identical payloads are captured again
    pub fn reset_dedup(&self) {
        self.filter().reset();
    }

    pub fn update_policy(&self, settings: HashMap<String, bool>) {
        self.filter().update_policy(settings);
    }

    pub fn policy_settings(&self) -> HashMap<String, bool> {
        self.filter().policy().settings().clone()
    }
}

impl FrameHandler for CapturePipeline {
    fn on_raw_frame(&self, frame: &str) {
        self.ingest(frame);
    }
}
