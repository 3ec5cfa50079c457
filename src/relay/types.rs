/**
 * ============================================================================
 * RELAY TYPES MODULE
 * ============================================================================
 *
 * PURPOSE: Define all data structures used across the relay
 *
 * TYPES DEFINED:
 * - PacketKind / SubPacket: Outer transport framing
 * - EventEnvelope: Inner event packet with name and JSON payload
 * - ApplicationMessage: Decoded game message
 * - CapturedItem / QueueItem: Items before and after persistence
 * - SenderState: Batch sender phase
 * - RelayStatus: Snapshot for status display
 * - RetryState: Reconnect backoff tracking for frame sources
 *
 * ============================================================================
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/**
 * Outer packet kinds, selected by the leading digit of each segment
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
    Unknown,
}

impl PacketKind {
    /**
     * Map a packet type character to its kind
     * Anything outside 0-6 is Unknown
     */
    pub fn from_char(c: char) -> Self {
        match c {
            '0' => PacketKind::Open,
            '1' => PacketKind::Close,
            '2' => PacketKind::Ping,
            '3' => PacketKind::Pong,
            '4' => PacketKind::Message,
            '5' => PacketKind::Upgrade,
            '6' => PacketKind::Noop,
            _ => PacketKind::Unknown,
        }
    }
}

/// One segment of a raw transport frame. The body borrows from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPacket<'a> {
    pub kind: PacketKind,
    pub body: &'a str,
}

/**
 * Parsed event packet carried inside a Message sub-packet
 */
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub packet_type: u32,
    pub namespace: Option<String>,
    pub ack_id: Option<u64>,
    pub event_name: String,
    pub payload: Value,
}

/**
 * Application-level message as emitted by the game server
 * Wire names are camelCase to match the collector contract
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMessage {
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/**
 * Message that passed the filter and is ready to persist
 * The id is producer-generated and unique among pending items
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedItem {
    pub id: String,
    pub context: Option<String>,
    pub message: ApplicationMessage,
    pub enqueued_at: DateTime<Utc>,
}

/**
 * Persisted item with its store-assigned key
 * Keys increase monotonically in insertion order
 */
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub storage_key: i64,
    pub id: String,
    pub context: Option<String>,
    pub message: ApplicationMessage,
    pub enqueued_at: DateTime<Utc>,
}

/**
 * Batch sender phase
 * Idle → Building → Sending → (Backoff | Idle)
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderState {
    Idle,
    Building,
    Sending,
    Backoff,
}

/**
 * Relay status snapshot for the command line and logging
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatus {
    pub authenticated: bool,
    pub username: Option<String>,
    pub server_reachable: bool,
    pub pending_items: usize,
    pub sender_state: SenderState,
    pub batch_interval_ms: u64,
    pub total_items_delivered: u64,
    pub last_delivery_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/**
 * Retry state tracking for exponential backoff
 * Used by frame sources when the upstream socket drops
 */
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub current_delay_ms: u64,
}

impl RetryState {
    /**
     * Calculate next retry delay using exponential backoff
     * delay = base_ms * multiplier^attempts, capped at max_delay_ms
     */
    pub fn calculate_next_delay(&self, base_ms: u64, multiplier: f64, max_delay_ms: u64) -> u64 {
        let delay_ms = (base_ms as f64 * multiplier.powi(self.attempts as i32)) as u64;
        delay_ms.min(max_delay_ms)
    }

    pub fn increment(&mut self, delay_ms: u64) {
        self.attempts += 1;
        self.current_delay_ms = delay_ms;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_kind_from_char() {
        assert_eq!(PacketKind::from_char('0'), PacketKind::Open);
        assert_eq!(PacketKind::from_char('4'), PacketKind::Message);
        assert_eq!(PacketKind::from_char('6'), PacketKind::Noop);
        assert_eq!(PacketKind::from_char('7'), PacketKind::Unknown);
        assert_eq!(PacketKind::from_char('x'), PacketKind::Unknown);
    }

    #[test]
    fn test_application_message_wire_names() {
        let message = ApplicationMessage {
            message_type: "USER_DATA".to_string(),
            payload: json!({"a": 1}),
            context: None,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"messageType":"USER_DATA","payload":{"a":1}}"#);

        let parsed: ApplicationMessage =
            serde_json::from_str(r#"{"messageType":"SHIP_SHIPS","context":"abc"}"#).unwrap();
        assert_eq!(parsed.payload, Value::Null);
        assert_eq!(parsed.context.as_deref(), Some("abc"));
    }

    #[test]
    fn test_retry_state_logic() {
        let mut retry_state = RetryState::default();

        let delay = retry_state.calculate_next_delay(1000, 2.0, 60_000);
        assert_eq!(delay, 1000);

        retry_state.increment(delay);
        assert_eq!(retry_state.attempts, 1);

        let delay2 = retry_state.calculate_next_delay(1000, 2.0, 60_000);
        assert_eq!(delay2, 2000);

        retry_state.attempts = 20;
        assert_eq!(retry_state.calculate_next_delay(1000, 2.0, 60_000), 60_000);

        retry_state.reset();
        assert_eq!(retry_state.attempts, 0);
    }
}
