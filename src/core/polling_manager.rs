//! Background polling for adapters that refresh flags periodically.
//!
//! The polling manager runs one task per adapter that calls a poll callback
//! on a configurable interval with jitter and exponential backoff on errors.
//! Stopping aborts the task, so no callback runs after [`PollingManager::stop`]
//! returns.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Default jitter in milliseconds.
pub const DEFAULT_JITTER_MS: u64 = 0;

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default maximum interval in seconds.
pub const DEFAULT_MAX_INTERVAL_SECS: u64 = 600; // 10 minutes

/// Configuration for the polling manager.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,

    /// Maximum jitter added to each delay.
    pub jitter_ms: u64,

    /// Backoff multiplier on errors.
    pub backoff_multiplier: f64,

    /// Maximum interval after backoff.
    pub max_interval: Duration,
}

impl PollingConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jitter_ms: DEFAULT_JITTER_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_interval: Duration::from_secs(DEFAULT_MAX_INTERVAL_SECS).max(interval),
        }
    }

    pub fn builder(interval: Duration) -> PollingConfigBuilder {
        PollingConfigBuilder {
            config: Self::new(interval),
        }
    }
}

#[derive(Debug)]
pub struct PollingConfigBuilder {
    config: PollingConfig,
}

impl PollingConfigBuilder {
    pub fn jitter_ms(mut self, jitter: u64) -> Self {
        self.config.jitter_ms = jitter;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn max_interval(mut self, max: Duration) -> Self {
        self.config.max_interval = max;
        self
    }

    pub fn build(self) -> PollingConfig {
        self.config
    }
}

/// Callback invoked on each poll tick.
pub type PollCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

struct PollingTask {
    handle: JoinHandle<()>,
    poll_now_tx: mpsc::Sender<()>,
}

/// Runs a poll callback periodically until stopped.
pub struct PollingManager {
    config: Mutex<PollingConfig>,
    current_interval: Arc<Mutex<Duration>>,
    consecutive_errors: Arc<AtomicU32>,
    is_running: Arc<AtomicBool>,
    task: Mutex<Option<PollingTask>>,
}

impl PollingManager {
    pub fn new(config: PollingConfig) -> Self {
        let interval = config.interval;
        Self {
            config: Mutex::new(config),
            current_interval: Arc::new(Mutex::new(interval)),
            consecutive_errors: Arc::new(AtomicU32::new(0)),
            is_running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Replaces the configuration. Takes effect on the next start.
    pub fn set_config(&self, config: PollingConfig) {
        *self.current_interval.lock() = config.interval;
        *self.config.lock() = config;
    }

    /// Starts polling. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, on_poll: PollCallback) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (poll_now_tx, mut poll_now_rx) = mpsc::channel::<()>(10);
        self.is_running.store(true, Ordering::SeqCst);

        let config = self.config.lock().clone();
        let current_interval = Arc::clone(&self.current_interval);
        let consecutive_errors = Arc::clone(&self.consecutive_errors);
        let is_running = Arc::clone(&self.is_running);

        tracing::debug!("Polling started with interval {:?}", config.interval);

        let handle = tokio::spawn(async move {
            loop {
                let delay = Self::calculate_next_delay(&config, *current_interval.lock());

                tokio::select! {
                    Some(()) = poll_now_rx.recv() => {
                        tracing::debug!("Immediate poll requested");
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                if !is_running.load(Ordering::SeqCst) {
                    break;
                }

                Self::execute_poll(&on_poll, &config, &current_interval, &consecutive_errors)
                    .await;
            }
        });

        *task = Some(PollingTask {
            handle,
            poll_now_tx,
        });
    }

    async fn execute_poll(
        on_poll: &PollCallback,
        config: &PollingConfig,
        current_interval: &Mutex<Duration>,
        consecutive_errors: &AtomicU32,
    ) {
        match on_poll().await {
            Ok(()) => {
                consecutive_errors.store(0, Ordering::SeqCst);
                *current_interval.lock() = config.interval;
            }
            Err(e) => {
                let errors = consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                let next_interval = Self::calculate_backoff(config, errors);
                *current_interval.lock() = next_interval;
                tracing::warn!(
                    "Poll failed (consecutive errors: {}), backing off to {:?}: {}",
                    errors,
                    next_interval,
                    e
                );
            }
        }
    }

    fn calculate_backoff(config: &PollingConfig, consecutive_errors: u32) -> Duration {
        let base_ms = config.interval.as_millis() as f64;
        let backoff_ms = base_ms * config.backoff_multiplier.powi(consecutive_errors as i32);
        let capped_ms = backoff_ms.min(config.max_interval.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn calculate_next_delay(config: &PollingConfig, interval: Duration) -> Duration {
        if config.jitter_ms == 0 {
            return interval;
        }
        let jitter = (rand::random::<f64>() * config.jitter_ms as f64) as u64;
        interval + Duration::from_millis(jitter)
    }

    /// Stops polling and aborts an in-flight poll.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);

        if let Some(task) = self.task.lock().take() {
            task.handle.abort();
            tracing::debug!("Polling stopped");
        }
    }

    /// Triggers a poll without waiting for the interval.
    pub fn poll_now(&self) {
        if let Some(task) = self.task.lock().as_ref() {
            let _ = task.poll_now_tx.try_send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn current_interval(&self) -> Duration {
        *self.current_interval.lock()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        self.stop();
    }
}
