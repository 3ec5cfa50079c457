/**
 * ============================================================================
 * MESSAGE FILTER MODULE
 * ============================================================================
 *
 * PURPOSE: Decide which decoded messages become queue items
 *
 * PIPELINE (per message):
 * 1. Unwrap ACTION_COMPLETED wrappers into their inner message
 * 2. Drop messages without a payload
 * 3. Drop repeats of the same type + payload within the dedup window
 * 4. Apply the message type policy (always-send, ignored, settings map)
 * 5. Assign a fresh id
 *
 * Every drop is an expected outcome, never an error.
 *
 * ============================================================================
 */

use crate::relay::types::{ApplicationMessage, CapturedItem};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Message type whose payload wraps another message
pub const WRAPPER_MESSAGE_TYPE: &str = "ACTION_COMPLETED";

pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(10);

/// Always forwarded regardless of user settings
pub static ALWAYS_SEND_MESSAGE_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "USER_DATA",
        "COMPANY_DATA",
        "SITE_SITES",
        "STORAGE_STORAGES",
        "WAREHOUSE_STORAGES",
        "SHIP_SHIPS",
        "WORKFORCE_WORKFORCES",
    ]
    .into_iter()
    .collect()
});

/// UI chatter and chat traffic, never forwarded
pub static IGNORED_MESSAGE_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "SYSTEM_TRAFFIC_SHIP",
        "CHANNEL_DATA",
        "CHANNEL_UNSEEN_MESSAGES_COUNT",
        "TUTORIAL_TUTORIALS",
        "ALERTS_ALERTS",
        "UI_STACKS_STACKS",
        "UI_DATA",
        "CHANNEL_USER_LIST",
        "CHANNEL_MESSAGE_LIST",
        "PRESENCE_LIST",
        "FCM_SUBSCRIPTION_UPDATE",
        "SYSTEM_DATA_UPDATED",
        "PLANET_DATA_UPDATED",
        "LEADERBOARD_UPDATED",
        "NOTIFICATIONS_CONFIG",
        "SYSTEM_TRAFFIC",
        "ALERTS_ALERT",
        "CONTRACT_DRAFTS_DRAFTS",
        "CONTRACTS_PARTNERS",
        "CHANNEL_CLIENT_MEMBERSHIP",
        "COMEX_TICKER_INVALID",
        "SHIP_FLIGHT_MISSION",
        "CHANNEL_STARTED_TYPING",
        "CHANNEL_STOPPED_TYPING",
        "CHANNEL_MESSAGE_ADDED",
        "UI_SCREENS_SET_STATE",
        "ALERTS_ALERTS_DELETED",
        "CHANNEL_USER_LEFT",
        "CONTRACT_DRAFTS_DRAFT",
        "CORPORATION_MANAGER_INVITE",
        "CORPORATION_MANAGER_INVITES",
        "CHANNEL_MESSAGE_DELETED",
        "UI_TILES_REMOVE",
        "UI_TILES_CHANGE_SIZE",
        "CHANNEL_USER_JOINED",
        "SYSTEM_TRAFFIC_SHIP_REMOVED",
    ]
    .into_iter()
    .collect()
});

/**
 * Result of running one message through the filter
 */
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Accepted(CapturedItem),
    Malformed(&'static str),
    Duplicate,
    PolicyDenied(String),
}

/**
 * Per message type allow policy
 * An empty settings map means settings are not loaded yet and allows everything
 */
#[derive(Debug, Clone, Default)]
pub struct MessagePolicy {
    settings: HashMap<String, bool>,
}

impl MessagePolicy {
    pub fn new(settings: HashMap<String, bool>) -> Self {
        Self { settings }
    }

    pub fn allows(&self, message_type: &str) -> bool {
        if ALWAYS_SEND_MESSAGE_TYPES.contains(message_type) {
            return true;
        }
        if IGNORED_MESSAGE_TYPES.contains(message_type) {
            return false;
        }
        if self.settings.is_empty() {
            return true;
        }
        self.settings.get(message_type).copied().unwrap_or(false)
    }

    /// Merge updated flags over the current map
    pub fn update(&mut self, settings: HashMap<String, bool>) {
        self.settings.extend(settings);
    }

    pub fn settings(&self) -> &HashMap<String, bool> {
        &self.settings
    }
}

/**
 * Short-window fingerprint set
 * Each fingerprint carries its own deadline; expired ones are dropped
 * individually when the window moves past them.
 */
#[derive(Debug)]
pub struct Deduper {
    ttl: Duration,
    deadlines: HashMap<String, Instant>,
    expiry_order: VecDeque<(Instant, String)>,
}

impl Deduper {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            deadlines: HashMap::new(),
            expiry_order: VecDeque::new(),
        }
    }

    /**
     * Record a fingerprint
     * Returns false if the same fingerprint is still inside its window
     */
    pub fn check_and_insert(&mut self, fingerprint: String, now: Instant) -> bool {
        self.expire(now);
        if self.deadlines.contains_key(&fingerprint) {
            return false;
        }
        let deadline = now + self.ttl;
        self.deadlines.insert(fingerprint.clone(), deadline);
        self.expiry_order.push_back((deadline, fingerprint));
        true
    }

    fn expire(&mut self, now: Instant) {
        // Deadlines are pushed in non-decreasing order since the ttl is fixed
        while let Some((deadline, _)) = self.expiry_order.front() {
            if *deadline > now {
                break;
            }
            if let Some((deadline, fingerprint)) = self.expiry_order.pop_front() {
                if self.deadlines.get(&fingerprint) == Some(&deadline) {
                    self.deadlines.remove(&fingerprint);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn reset(&mut self) {
        self.deadlines.clear();
        self.expiry_order.clear();
    }
}

/**
 * Dedup key: message type plus canonical JSON of the payload
 * Object keys are sorted at every level so key order never matters
 */
pub fn fingerprint(message_type: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(message_type.len() + 64);
    out.push_str(message_type);
    out.push('|');
    write_canonical(payload, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/**
 * Replace an ACTION_COMPLETED wrapper with the message it carries
 * The outer context is propagated to the inner message
 */
fn unwrap_wrapper(message: ApplicationMessage) -> Option<ApplicationMessage> {
    if message.message_type != WRAPPER_MESSAGE_TYPE {
        return Some(message);
    }
    let inner = message.payload.get("message")?;
    let message_type = inner.get("messageType")?.as_str()?.to_string();
    let payload = inner.get("payload").cloned().unwrap_or(Value::Null);
    Some(ApplicationMessage {
        message_type,
        payload,
        context: message.context,
    })
}

/**
 * Stateful filter owned by the capture pipeline
 */
#[derive(Debug)]
pub struct MessageFilter {
    deduper: Deduper,
    policy: MessagePolicy,
}

impl MessageFilter {
    pub fn new(policy: MessagePolicy, dedup_ttl: Duration) -> Self {
        Self {
            deduper: Deduper::new(dedup_ttl),
            policy,
        }
    }

    pub fn process(&mut self, message: ApplicationMessage, context: Option<String>) -> FilterOutcome {
        self.process_at(message, context, Instant::now())
    }

    pub fn process_at(
        &mut self,
        message: ApplicationMessage,
        context: Option<String>,
        now: Instant,
    ) -> FilterOutcome {
        let Some(message) = unwrap_wrapper(message) else {
            return FilterOutcome::Malformed("wrapper without inner message");
        };

        if message.payload.is_null() {
            return FilterOutcome::Malformed("missing payload");
        }

        if !self
            .deduper
            .check_and_insert(fingerprint(&message.message_type, &message.payload), now)
        {
            return FilterOutcome::Duplicate;
        }

        if !self.policy.allows(&message.message_type) {
            return FilterOutcome::PolicyDenied(message.message_type);
        }

        FilterOutcome::Accepted(CapturedItem {
            id: Uuid::new_v4().to_string(),
            context,
            message,
            enqueued_at: Utc::now(),
        })
    }

    pub fn policy(&self) -> &MessagePolicy {
        &self.policy
    }

    pub fn update_policy(&mut self, settings: HashMap<String, bool>) {
        self.policy.update(settings);
    }

    /// Forget every fingerprint in the window
    pub fn reset(&mut self) {
        self.deduper.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(message_type: &str, payload: Value) -> ApplicationMessage {
        ApplicationMessage {
            message_type: message_type.to_string(),
            payload,
            context: None,
        }
    }

    fn open_filter() -> MessageFilter {
        MessageFilter::new(MessagePolicy::default(), DEFAULT_DEDUP_TTL)
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(fingerprint("T", &a), fingerprint("T", &b));
        assert_ne!(fingerprint("T", &a), fingerprint("U", &a));
        assert_ne!(fingerprint("T", &json!([1, 2])), fingerprint("T", &json!([2, 1])));
    }

    #[test]
    fn test_accepts_and_assigns_unique_ids() {
        let mut filter = open_filter();
        let now = Instant::now();
        let first = filter.process_at(message("USER_DATA", json!({"a": 1})), Some("ctx".into()), now);
        let second = filter.process_at(message("USER_DATA", json!({"a": 2})), None, now);

        let (FilterOutcome::Accepted(first), FilterOutcome::Accepted(second)) = (first, second) else {
            panic!("both messages should be accepted");
        };
        assert_ne!(first.id, second.id);
        assert_eq!(first.context.as_deref(), Some("ctx"));
        assert_eq!(first.message.payload, json!({"a": 1}));
    }

    #[test]
    fn test_duplicate_within_window_then_accepted_after_ttl() {
        let mut filter = open_filter();
        let start = Instant::now();

        let outcome = filter.process_at(message("SHIP_SHIPS", json!({"s": 1})), None, start);
        assert!(matches!(outcome, FilterOutcome::Accepted(_)));

        let outcome = filter.process_at(
            message("SHIP_SHIPS", json!({"s": 1})),
            None,
            start + Duration::from_secs(9),
        );
        assert_eq!(outcome, FilterOutcome::Duplicate);

        let outcome = filter.process_at(
            message("SHIP_SHIPS", json!({"s": 1})),
            None,
            start + Duration::from_secs(10),
        );
        assert!(matches!(outcome, FilterOutcome::Accepted(_)));
    }

    #[test]
    fn test_deduper_expires_entries_individually() {
        let mut deduper = Deduper::new(Duration::from_secs(10));
        let start = Instant::now();
        assert!(deduper.check_and_insert("a".into(), start));
        assert!(deduper.check_and_insert("b".into(), start + Duration::from_secs(5)));
        assert_eq!(deduper.len(), 2);

        // "a" expired, "b" still live
        assert!(!deduper.check_and_insert("b".into(), start + Duration::from_secs(11)));
        assert_eq!(deduper.len(), 1);
        assert!(deduper.check_and_insert("a".into(), start + Duration::from_secs(11)));

        deduper.reset();
        assert!(deduper.is_empty());
    }

    #[test]
    fn test_wrapper_is_unwrapped_with_context() {
        let mut filter = open_filter();
        let wrapped = ApplicationMessage {
            message_type: WRAPPER_MESSAGE_TYPE.to_string(),
            payload: json!({"message": {"messageType": "STORAGE_CHANGE", "payload": {"id": 7}}}),
            context: Some("outer".to_string()),
        };
        let FilterOutcome::Accepted(item) = filter.process(wrapped, None) else {
            panic!("wrapped message should be accepted");
        };
        assert_eq!(item.message.message_type, "STORAGE_CHANGE");
        assert_eq!(item.message.payload, json!({"id": 7}));
        assert_eq!(item.message.context.as_deref(), Some("outer"));
    }

    #[test]
    fn test_wrapper_without_inner_message_is_dropped() {
        let mut filter = open_filter();
        let outcome = filter.process(message(WRAPPER_MESSAGE_TYPE, json!({"other": 1})), None);
        assert!(matches!(outcome, FilterOutcome::Malformed(_)));
    }

    #[test]
    fn test_null_payload_is_dropped() {
        let mut filter = open_filter();
        let outcome = filter.process(message("USER_DATA", Value::Null), None);
        assert_eq!(outcome, FilterOutcome::Malformed("missing payload"));
    }

    #[test]
    fn test_policy_rules() {
        let empty = MessagePolicy::default();
        assert!(empty.allows("ANYTHING"));
        assert!(!empty.allows("CHANNEL_DATA"));

        let mut settings = HashMap::new();
        settings.insert("STORAGE_CHANGE".to_string(), true);
        settings.insert("PLANET_DATA".to_string(), false);
        let policy = MessagePolicy::new(settings);

        assert!(policy.allows("USER_DATA"));
        assert!(policy.allows("STORAGE_CHANGE"));
        assert!(!policy.allows("PLANET_DATA"));
        assert!(!policy.allows("NOT_CONFIGURED"));
    }

    #[test]
    fn test_policy_denial_reports_type() {
        let mut settings = HashMap::new();
        settings.insert("STORAGE_CHANGE".to_string(), false);
        let mut filter = MessageFilter::new(MessagePolicy::new(settings), DEFAULT_DEDUP_TTL);

        let outcome = filter.process(message("STORAGE_CHANGE", json!({})), None);
        assert_eq!(outcome, FilterOutcome::PolicyDenied("STORAGE_CHANGE".to_string()));

        filter.update_policy(HashMap::from([("STORAGE_CHANGE".to_string(), true)]));
        let outcome = filter.process(message("STORAGE_CHANGE", json!({"n": 1})), None);
        assert!(matches!(outcome, FilterOutcome::Accepted(_)));
    }
}
