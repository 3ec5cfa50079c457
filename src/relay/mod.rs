/**
 * ============================================================================
 * RELAY MODULE
 * ============================================================================
 *
 * PURPOSE: Capture game transport frames, persist the decoded events and
 * deliver them in size-bounded batches to the collector server over HTTP.
 *
 * ARCHITECTURE:
 * - config: Configuration and message type settings persistence
 * - types: Data structures and models
 * - error: Typed error taxonomy
 * - decoder: Engine.IO frame splitting and Socket.IO event parsing
 * - filter: Wrapper unwrapping, dedup window and message type policy
 * - queue: SQLite-backed durable queue of pending items
 * - auth: Bearer session lifecycle and persistence
 * - client: Collector HTTP client (data plane + auth plane)
 * - batch: Single-flight batch sender with adaptive polling interval
 * - capture: Frame → filter → queue pipeline
 * - transport: Frame source adapters (WebSocket)
 * - manager: High-level orchestration of triggers and session
 *
 * ============================================================================
 */

pub mod config;
pub mod types;
pub mod error;
pub mod decoder;
pub mod filter;
pub mod queue;
pub mod auth;
pub mod client;
pub mod batch;
pub mod capture;
pub mod transport;
pub mod manager;
