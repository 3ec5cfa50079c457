/**
 * ============================================================================
 * RELAY MANAGER MODULE
 * ============================================================================
 *
 * PURPOSE: High-level orchestration of capture, session and delivery
 *
 * RESPONSIBILITIES:
 * - Assemble queue, session, collector client, sender and capture pipeline
 * - Restore the persisted session at startup
 * - Start the batch trigger and watchdog on login, stop them on logout
 * - Expose status, force send, queue clear and settings updates
 *
 * BACKGROUND TASKS (only while a session exists):
 * - Trigger: sleeps the sender's current interval, then runs a pass if the
 *   server is reachable and items are pending; follow-ups run after the
 *   retry delay
 * - Watchdog: probes the status endpoint every minute and runs a pass if
 *   the server answered and items are pending
 * Both exit as soon as the session is cleared, including by a 401/403.
 *
 * ============================================================================
 */

use crate::relay::auth::{AuthSession, SessionStore};
use crate::relay::batch::{BatchSender, PassReport, SenderConfig};
use crate::relay::capture::CapturePipeline;
use crate::relay::client::{Collector, HttpCollector};
use crate::relay::config::{
    self, QUEUE_FILE_NAME, RelayConfig, SESSION_FILE_NAME,
};
use crate::relay::error::RelayError;
use crate::relay::filter::MessagePolicy;
use crate::relay::queue::DurableQueue;
use crate::relay::types::RelayStatus;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct SenderTasks {
    shutdown: watch::Sender<bool>,
    trigger: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

impl SenderTasks {
    fn is_finished(&self) -> bool {
        self.trigger.is_finished() && self.watchdog.is_finished()
    }
}

/**
 * The assembled relay
 */
pub struct Relay {
    config: RelayConfig,
    data_dir: Option<PathBuf>,
    queue: Arc<DurableQueue>,
    session: Arc<AuthSession>,
    collector: Arc<dyn Collector>,
    sender: Arc<BatchSender>,
    capture: Arc<CapturePipeline>,
    tasks: Mutex<Option<SenderTasks>>,
}

impl Relay {
    /**
     * Open the relay over a data directory
     * Creates the queue database and loads message type settings
     */
    pub fn open(config: RelayConfig, data_dir: &Path) -> Result<Self, RelayError> {
        config.validate().map_err(RelayError::Config)?;

        let queue = Arc::new(DurableQueue::open(&data_dir.join(QUEUE_FILE_NAME))?);
        let session = Arc::new(AuthSession::new(SessionStore::new(
            data_dir.join(SESSION_FILE_NAME),
        )));
        let collector: Arc<dyn Collector> = Arc::new(HttpCollector::new(&config)?);
        let settings = config::load_message_settings(data_dir).map_err(RelayError::Config)?;

        Ok(Self::with_parts(
            config,
            Some(data_dir.to_path_buf()),
            queue,
            session,
            collector,
            settings,
        ))
    }

    /**
     * Assemble the relay from existing parts
     * Without a data directory, settings updates are kept in memory only
     */
    pub fn with_parts(
        config: RelayConfig,
        data_dir: Option<PathBuf>,
        queue: Arc<DurableQueue>,
        session: Arc<AuthSession>,
        collector: Arc<dyn Collector>,
        message_settings: HashMap<String, bool>,
    ) -> Self {
        let sender = Arc::new(BatchSender::new(
            queue.clone(),
            session.clone(),
            collector.clone(),
            SenderConfig::from(&config),
        ));
        let capture = Arc::new(CapturePipeline::new(
            queue.clone(),
            MessagePolicy::new(message_settings),
            config.dedup_ttl(),
        ));

        Self {
            config,
            data_dir,
            queue,
            session,
            collector,
            sender,
            capture,
            tasks: Mutex::new(None),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Option<SenderTasks>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /**
     * Startup sequence
     * 1. Restore persisted session
     * 2. Probe the collector
     * 3. Recount the queue
     * 4. Start the sender if a session was restored
     * Returns whether a session is active
     */
    pub async fn initialize(&self) -> Result<bool, RelayError> {
        let authenticated = self.restore_session();
        self.check_server_status().await;
        let pending = self.queue.recount()?;
        log::info!(
            "Relay initialized ({} pending, session: {})",
            pending,
            if authenticated { "restored" } else { "none" }
        );

        if authenticated {
            self.start_batch_sender();
        }
        Ok(authenticated)
    }

    /**
     * Reload the persisted session without starting any task
     * An unreadable session file counts as logged out
     */
    pub fn restore_session(&self) -> bool {
        match self.session.restore() {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Ignoring unreadable session file: {}", e);
                false
            }
        }
    }

    /**
     * Pick up a session saved by another process (e.g. `prun-relay login`)
     * Does nothing while a session is active; returns whether one was adopted
     */
    pub async fn adopt_persisted_session(&self) -> bool {
        if self.session.is_authenticated() || !self.restore_session() {
            return false;
        }
        log::info!(
            "Adopted session for {} saved by another process",
            self.session.username().unwrap_or_default()
        );
        self.check_server_status().await;
        self.start_batch_sender();
        true
    }

    /**
     * Log in and start delivering
     */
    pub async fn login(&self, username: &str, password: &str) -> Result<String, RelayError> {
        let credentials = self
            .session
            .login(self.collector.as_ref(), username, password)
            .await?;
        self.sender.set_reachable(true);
        self.start_batch_sender();
        Ok(credentials.username)
    }

    /**
     * Adopt a website session and start delivering
     */
    pub async fn sync_with_web_token(&self, web_token: &str) -> Result<String, RelayError> {
        let credentials = self
            .session
            .sync_with_web_token(self.collector.as_ref(), web_token)
            .await?;
        self.sender.set_reachable(true);
        self.start_batch_sender();
        Ok(credentials.username)
    }

    /**
     * Stop delivering and forget the session
     * Pending items stay queued for the next login
     */
    pub fn logout(&self) -> Result<(), RelayError> {
        self.stop_batch_sender();
        self.session.clear()?;
        Ok(())
    }

    /**
     * Probe the status endpoint and record reachability
     */
    pub async fn check_server_status(&self) -> bool {
        let reachable = self.collector.probe_status().await;
        self.sender.set_reachable(reachable);
        reachable
    }

    /**
     * Run one pass now
     * Returns Busy if the trigger is mid-pass
     */
    pub async fn force_send(&self) -> PassReport {
        self.sender.run_pass().await
    }

    /**
     * Drop every pending item and forget recent fingerprints
     */
    pub fn clear_queue(&self) -> Result<usize, RelayError> {
        let removed = self.queue.clear()?;
        self.capture.reset_dedup();
        Ok(removed)
    }

    /**
     * Merge new per-type settings into the policy and persist them
     */
    pub fn update_message_settings(&self, settings: HashMap<String, bool>) -> Result<(), RelayError> {
        self.capture.update_policy(settings);
        if let Some(data_dir) = &self.data_dir {
            config::save_message_settings(data_dir, &self.capture.policy_settings())
                .map_err(RelayError::Config)?;
        }
        Ok(())
    }

    pub fn message_settings(&self) -> HashMap<String, bool> {
        self.capture.policy_settings()
    }

    pub fn status(&self) -> RelayStatus {
        let credentials = self.session.credentials();
        let stats = self.sender.stats();
        RelayStatus {
            authenticated: credentials.is_some(),
            username: credentials.map(|c| c.username),
            server_reachable: self.sender.is_reachable(),
            pending_items: self.queue.pending_count(),
            sender_state: stats.state,
            batch_interval_ms: self.sender.current_interval().as_millis() as u64,
            total_items_delivered: stats.total_items_delivered,
            last_delivery_time: stats.last_delivery_time,
            last_error: stats.last_error,
        }
    }

    /// Frame handler to hand to a transport adapter
    pub fn capture(&self) -> Arc<CapturePipeline> {
        self.capture.clone()
    }

    /// Pending count updates
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.queue.subscribe()
    }

    pub fn is_sender_running(&self) -> bool {
        self.tasks()
            .as_ref()
            .map(|tasks| !tasks.is_finished())
            .unwrap_or(false)
    }

    /**
     * Spawn the trigger and watchdog tasks
     * No-op while they are already running; must be called inside a runtime
     */
    pub fn start_batch_sender(&self) {
        let mut tasks = self.tasks();
        if tasks.as_ref().is_some_and(|t| !t.is_finished()) {
            log::debug!("Batch sender already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let trigger = tokio::spawn(trigger_loop(
            self.sender.clone(),
            self.queue.clone(),
            self.session.subscribe(),
            shutdown_rx.clone(),
            Duration::from_millis(self.config.retry_delay_ms),
        ));
        let watchdog = tokio::spawn(watchdog_loop(
            self.sender.clone(),
            self.queue.clone(),
            self.collector.clone(),
            self.session.subscribe(),
            shutdown_rx,
            Duration::from_secs(self.config.watchdog_interval_seconds),
        ));

        *tasks = Some(SenderTasks {
            shutdown,
            trigger,
            watchdog,
        });
        log::info!("Batch sender started");
    }

    /**
     * Signal the background tasks to stop
     * A pass already in flight finishes
     */
    pub fn stop_batch_sender(&self) {
        if let Some(tasks) = self.tasks().take() {
            tasks.shutdown.send_replace(true);
            log::info!("Batch sender stopped");
        }
    }

    /**
     * Stop the background tasks and wait for them to exit
     */
    pub async fn shutdown(&self) {
        let tasks = self.tasks().take();
        if let Some(tasks) = tasks {
            tasks.shutdown.send_replace(true);
            let _ = tasks.trigger.await;
            let _ = tasks.watchdog.await;
        }
        log::info!("Relay shut down ({} items pending)", self.queue.pending_count());
    }
}

fn session_active(session_rx: &watch::Receiver<bool>) -> bool {
    *session_rx.borrow()
}

/**
 * Periodic trigger
 * Re-reads the sender interval before every sleep
 */
async fn trigger_loop(
    sender: Arc<BatchSender>,
    queue: Arc<DurableQueue>,
    mut session_rx: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    retry_delay: Duration,
) {
    log::debug!("Batch trigger started");
    'outer: loop {
        if !session_active(&session_rx) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(sender.current_interval()) => {}
            _ = shutdown.changed() => break,
            changed = session_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        if !sender.is_reachable() || queue.pending_count() == 0 {
            continue;
        }

        let mut report = sender.run_pass().await;
        while report.follow_up {
            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {}
                _ = shutdown.changed() => break 'outer,
            }
            if !session_active(&session_rx) {
                break 'outer;
            }
            report = sender.run_pass().await;
        }
    }
    log::debug!("Batch trigger stopped");
}

/**
 * Reachability watchdog
 * The first probe happens one period after start
 */
async fn watchdog_loop(
    sender: Arc<BatchSender>,
    queue: Arc<DurableQueue>,
    collector: Arc<dyn Collector>,
    mut session_rx: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    log::debug!("Watchdog started ({:?})", period);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if !session_active(&session_rx) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
            changed = session_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let reachable = collector.probe_status().await;
        sender.set_reachable(reachable);
        if reachable && queue.pending_count() > 0 {
            let report = sender.run_pass().await;
            log::debug!("Watchdog pass: {:?}", report.outcome);
        }
    }
    log::debug!("Watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::auth::SessionCredentials;
    use crate::relay::batch::PassOutcome;
    use crate::relay::client::{BatchReply, DeliveryAck};
    use crate::relay::decoder::RECORD_SEPARATOR;
    use crate::relay::error::{AuthError, DeliveryError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeCollector {
        reachable: AtomicBool,
        batch_status: AtomicU16,
        batches: AtomicUsize,
        probes: AtomicUsize,
    }

    impl FakeCollector {
        fn new() -> Self {
            Self {
                reachable: AtomicBool::new(true),
                batch_status: AtomicU16::new(200),
                batches: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Collector for FakeCollector {
        async fn send_batch(
            &self,
            _token: &str,
            _conn: &str,
            _body: Vec<u8>,
            _gzip: bool,
        ) -> Result<BatchReply, DeliveryError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(BatchReply {
                status: self.batch_status.load(Ordering::SeqCst),
                ack: DeliveryAck::default(),
            })
        }

        async fn probe_status(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.reachable.load(Ordering::SeqCst)
        }

        async fn login(&self, username: &str, password: &str) -> Result<SessionCredentials, AuthError> {
            if password != "secret" {
                return Err(AuthError::Rejected("Invalid credentials".to_string()));
            }
            Ok(SessionCredentials {
                token: "token-1".to_string(),
                username: username.to_string(),
                expires_at: None,
            })
        }

        async fn exchange_web_token(&self, _: &str) -> Result<SessionCredentials, AuthError> {
            Ok(SessionCredentials {
                token: "token-web".to_string(),
                username: "webuser".to_string(),
                expires_at: None,
            })
        }
    }

    fn relay_with(collector: Arc<FakeCollector>, data_dir: Option<&TempDir>) -> Relay {
        let queue = Arc::new(DurableQueue::open_in_memory().unwrap());
        let store = match data_dir {
            Some(dir) => SessionStore::new(dir.path().join(SESSION_FILE_NAME)),
            None => SessionStore::in_memory(),
        };
        Relay::with_parts(
            RelayConfig::default(),
            data_dir.map(|d| d.path().to_path_buf()),
            queue,
            Arc::new(AuthSession::new(store)),
            collector,
            HashMap::new(),
        )
    }

    fn frame(n: u64) -> String {
        format!(
            "4{}42[\"event\",{}]",
            RECORD_SEPARATOR,
            json!({"messageType": "USER_DATA", "payload": {"n": n}})
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_starts_delivery() {
        let collector = Arc::new(FakeCollector::new());
        let relay = relay_with(collector.clone(), None);
        relay.capture().ingest(&frame(1));
        relay.capture().ingest(&frame(2));

        assert!(!relay.is_sender_running());
        assert_eq!(relay.login("alice", "secret").await.unwrap(), "alice");
        assert!(relay.is_sender_running());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(relay.status().pending_items, 0);
        assert_eq!(collector.batches.load(Ordering::SeqCst), 1);

        let status = relay.status();
        assert!(status.authenticated);
        assert_eq!(status.username.as_deref(), Some("alice"));
        assert_eq!(status.total_items_delivered, 2);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_login_does_not_start_sender() {
        let relay = relay_with(Arc::new(FakeCollector::new()), None);
        assert!(matches!(
            relay.login("alice", "wrong").await,
            Err(RelayError::Auth(AuthError::Rejected(_)))
        ));
        assert!(!relay.is_sender_running());
        assert!(!relay.status().authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_response_stops_background_tasks() {
        let collector = Arc::new(FakeCollector::new());
        collector.batch_status.store(401, Ordering::SeqCst);
        let relay = relay_with(collector.clone(), None);
        relay.login("alice", "secret").await.unwrap();
        relay.capture().ingest(&frame(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!relay.status().authenticated);
        assert_eq!(relay.status().pending_items, 1);
        assert!(!relay.is_sender_running());

        // Nothing more is attempted while logged out
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(collector.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_keeps_queue_and_stops_sender() {
        let collector = Arc::new(FakeCollector::new());
        let relay = relay_with(collector.clone(), None);
        relay.login("alice", "secret").await.unwrap();

        relay.logout().unwrap();
        assert!(!relay.is_sender_running());
        assert!(!relay.status().authenticated);

        relay.capture().ingest(&frame(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(relay.status().pending_items, 1);
        assert_eq!(collector.batches.load(Ordering::SeqCst), 0);

        assert_eq!(relay.force_send().await.outcome, PassOutcome::NotAuthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_restores_reachability() {
        let collector = Arc::new(FakeCollector::new());
        let relay = relay_with(collector.clone(), None);
        relay.login("alice", "secret").await.unwrap();

        collector.reachable.store(false, Ordering::SeqCst);
        assert!(!relay.check_server_status().await);
        relay.capture().ingest(&frame(1));

        // The trigger skips passes while unreachable
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(collector.batches.load(Ordering::SeqCst), 0);

        collector.reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(relay.status().server_reachable);
        assert_eq!(relay.status().pending_items, 0);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_queue_resets_dedup() {
        let relay = relay_with(Arc::new(FakeCollector::new()), None);
        let mut pending = relay.subscribe_pending();
        let capture = relay.capture();
        capture.ingest(&frame(1));
        capture.ingest(&frame(2));
        assert_eq!(*pending.borrow_and_update(), 2);

        assert_eq!(relay.clear_queue().unwrap(), 2);
        assert_eq!(relay.status().pending_items, 0);
        assert!(pending.has_changed().unwrap());
        assert_eq!(*pending.borrow_and_update(), 0);

        capture.ingest(&frame(1));
        assert_eq!(relay.status().pending_items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_restores_session_and_starts_sender() {
        let dir = TempDir::new().unwrap();
        SessionStore::new(dir.path().join(SESSION_FILE_NAME))
            .save(&SessionCredentials {
                token: "persisted".to_string(),
                username: "bob".to_string(),
                expires_at: None,
            })
            .unwrap();

        let relay = relay_with(Arc::new(FakeCollector::new()), Some(&dir));
        assert!(relay.initialize().await.unwrap());
        assert!(relay.is_sender_running());
        let status = relay.status();
        assert_eq!(status.username.as_deref(), Some("bob"));
        assert!(status.server_reachable);

        relay.shutdown().await;
        assert!(!relay.is_sender_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_saved_later_is_adopted() {
        let dir = TempDir::new().unwrap();
        let relay = relay_with(Arc::new(FakeCollector::new()), Some(&dir));
        assert!(!relay.initialize().await.unwrap());
        assert!(!relay.adopt_persisted_session().await);

        // Written by a login in another process
        SessionStore::new(dir.path().join(SESSION_FILE_NAME))
            .save(&SessionCredentials {
                token: "from-cli".to_string(),
                username: "carol".to_string(),
                expires_at: None,
            })
            .unwrap();

        assert!(relay.adopt_persisted_session().await);
        assert!(relay.is_sender_running());
        assert_eq!(relay.status().username.as_deref(), Some("carol"));
        // Already active
        assert!(!relay.adopt_persisted_session().await);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_without_session_stays_idle() {
        let relay = relay_with(Arc::new(FakeCollector::new()), None);
        assert!(!relay.initialize().await.unwrap());
        assert!(!relay.is_sender_running());
    }

    #[tokio::test]
    async fn test_sync_with_web_token_logs_in() {
        let relay = relay_with(Arc::new(FakeCollector::new()), None);
        assert_eq!(relay.sync_with_web_token("web").await.unwrap(), "webuser");
        assert!(relay.is_sender_running());
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_message_settings_are_persisted() {
        let dir = TempDir::new().unwrap();
        let relay = relay_with(Arc::new(FakeCollector::new()), Some(&dir));
        relay
            .update_message_settings(HashMap::from([("STORAGE_CHANGE".to_string(), false)]))
            .unwrap();

        assert_eq!(relay.message_settings().get("STORAGE_CHANGE"), Some(&false));
        let saved = config::load_message_settings(dir.path()).unwrap();
        assert_eq!(saved.get("STORAGE_CHANGE"), Some(&false));
    }
}
