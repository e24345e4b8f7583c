//! Configuration lifecycle shared by adapters.
//!
//! Every adapter owns one [`AdapterLifecycle`]. It tracks the adapter status
//! in a `watch` channel, serializes configure/reconfigure calls, keeps the
//! last effective arguments and forwards events to the bound
//! [`AdapterEventHandlers`].

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};

use crate::core::config::{merge_args, AdapterArgs};
use crate::error::{FlagBridgeError, Result};
use crate::types::{
    AdapterConfiguration, AdapterConfigurationStatus, AdapterIdentifier, AdapterStatus,
    AdapterStatusChange, AdapterSubscriptionStatus, Flags, FlagsChange, PartialAdapterStatus,
    ReconfigurationOptions,
};

/// Notification sent upward by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    FlagsStateChange(FlagsChange),
    StatusStateChange(AdapterStatusChange),
}

/// Producer side of the channel an adapter reports through.
///
/// Cloning yields another producer for the same consumer.
#[derive(Debug, Clone)]
pub struct AdapterEventHandlers {
    sender: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterEventHandlers {
    /// Creates handlers together with the receiver consuming their events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn on_flags_state_change(&self, change: FlagsChange) {
        if self.sender.send(AdapterEvent::FlagsStateChange(change)).is_err() {
            tracing::debug!("Flags change dropped, receiver is gone");
        }
    }

    pub fn on_status_state_change(&self, change: AdapterStatusChange) {
        if self.sender.send(AdapterEvent::StatusStateChange(change)).is_err() {
            tracing::debug!("Status change dropped, receiver is gone");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Waits for the configuration lock, reporting a conflict when another call
/// holds it.
pub async fn acquire_configuration_lock<'a>(
    lock: &'a Mutex<()>,
    id: &AdapterIdentifier,
) -> MutexGuard<'a, ()> {
    match lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            tracing::warn!("{}", FlagBridgeError::reconfiguration_conflict(id));
            lock.lock().await
        }
    }
}

pub struct AdapterLifecycle {
    id: AdapterIdentifier,
    status: watch::Sender<AdapterStatus>,
    configuration: Mutex<()>,
    handlers: RwLock<Option<AdapterEventHandlers>>,
    args: RwLock<Option<AdapterArgs>>,
    generation: AtomicU64,
}

impl AdapterLifecycle {
    pub fn new(id: AdapterIdentifier) -> Self {
        let (status, _) = watch::channel(AdapterStatus::default());
        Self {
            id,
            status,
            configuration: Mutex::new(()),
            handlers: RwLock::new(None),
            args: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &AdapterIdentifier {
        &self.id
    }

    pub fn status(&self) -> AdapterStatus {
        *self.status.borrow()
    }

    pub fn is_configuration_status(&self, status: AdapterConfigurationStatus) -> bool {
        self.status().configuration_status == status
    }

    pub fn is_configured(&self) -> bool {
        self.status().is_configured()
    }

    pub fn is_subscribed(&self) -> bool {
        self.status().is_subscribed()
    }

    pub fn watch_status(&self) -> watch::Receiver<AdapterStatus> {
        self.status.subscribe()
    }

    /// Resolves once the adapter is configured, immediately if it already is.
    pub async fn wait_until_configured(&self) {
        let mut receiver = self.status.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = receiver
            .wait_for(|status| status.is_configured())
            .await;
    }

    /// Serializes configuration calls of this adapter in call order.
    pub async fn lock_configuration(&self) -> MutexGuard<'_, ()> {
        acquire_configuration_lock(&self.configuration, &self.id).await
    }

    /// Takes the configuration lock without reporting a conflict. Background
    /// refreshes hold it while applying a fetched result so that they cannot
    /// interleave with a reconfiguration.
    pub async fn lock_for_refresh(&self) -> MutexGuard<'_, ()> {
        self.configuration.lock().await
    }

    /// Changes whenever the effective arguments change or the adapter is
    /// reset. A background fetch started under one generation must not be
    /// applied under another.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn next_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Starts a first-time configuration: binds handlers and arguments and
    /// moves to `Configuring`.
    pub fn begin_configuration(&self, handlers: AdapterEventHandlers, args: AdapterArgs) -> Result<()> {
        if self.is_configured() {
            return Err(FlagBridgeError::already_configured(&self.id));
        }

        self.bind_handlers(handlers);
        *self.args.write() = Some(args);
        self.next_generation();
        self.set_configuration_status(AdapterConfigurationStatus::Configuring);
        Ok(())
    }

    /// Computes the arguments a reconfiguration applies. Nothing is stored:
    /// the adapter calls [`AdapterLifecycle::commit_reconfiguration`] once
    /// the provider accepted them.
    pub fn begin_reconfiguration(
        &self,
        args: AdapterArgs,
        options: ReconfigurationOptions,
    ) -> Result<AdapterArgs> {
        self.require_configured("reconfigure")?;

        let merged = merge_args(&self.id, self.args.read().as_ref(), args, options)?;
        Ok(merged)
    }

    /// Makes the arguments of a successful reconfiguration effective.
    pub fn commit_reconfiguration(&self, handlers: AdapterEventHandlers, args: AdapterArgs) {
        self.bind_handlers(handlers);
        self.bind_args(args);
    }

    pub fn require_configured(&self, operation: &str) -> Result<()> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(FlagBridgeError::not_configured(&self.id, operation))
        }
    }

    pub fn bind_handlers(&self, handlers: AdapterEventHandlers) {
        *self.handlers.write() = Some(handlers);
    }

    pub fn args(&self) -> Option<AdapterArgs> {
        self.args.read().clone()
    }

    /// Replaces the effective arguments without a reconfiguration, e.g. after
    /// a user attribute update.
    pub fn bind_args(&self, args: AdapterArgs) {
        *self.args.write() = Some(args);
        self.next_generation();
    }

    /// Moves the configuration status forward. Regressions are ignored;
    /// only [`AdapterLifecycle::reset`] returns to `Unconfigured`.
    pub fn set_configuration_status(&self, next: AdapterConfigurationStatus) {
        let changed = self.status.send_if_modified(|status| {
            let current = status.configuration_status;
            let allowed = matches!(
                (current, next),
                (AdapterConfigurationStatus::Unconfigured, AdapterConfigurationStatus::Configuring)
                    | (AdapterConfigurationStatus::Configuring, AdapterConfigurationStatus::Configured)
                    | (AdapterConfigurationStatus::Unconfigured, AdapterConfigurationStatus::Configured)
            );

            if allowed {
                status.configuration_status = next;
            } else if current != next {
                tracing::warn!(
                    "Adapter '{}' ignored configuration status change {:?} -> {:?}",
                    self.id,
                    current,
                    next
                );
            }
            allowed
        });

        if changed {
            tracing::debug!("Adapter '{}' is now {:?}", self.id, next);
            self.emit_status(PartialAdapterStatus {
                configuration_status: Some(next),
                subscription_status: None,
            });
        }
    }

    pub fn set_subscription_status(&self, next: AdapterSubscriptionStatus) {
        let changed = self.status.send_if_modified(|status| {
            if status.subscription_status == next {
                false
            } else {
                status.subscription_status = next;
                true
            }
        });

        if changed {
            tracing::debug!("Adapter '{}' is now {:?}", self.id, next);
            self.emit_status(PartialAdapterStatus {
                configuration_status: None,
                subscription_status: Some(next),
            });
        }
    }

    /// Returns to `Unconfigured` and forgets the bound arguments.
    pub fn reset(&self) {
        *self.args.write() = None;
        self.next_generation();

        let changed = self.status.send_if_modified(|status| {
            let changed = status.configuration_status != AdapterConfigurationStatus::Unconfigured;
            status.configuration_status = AdapterConfigurationStatus::Unconfigured;
            changed
        });

        if changed {
            tracing::debug!("Adapter '{}' was reset", self.id);
            self.emit_status(PartialAdapterStatus {
                configuration_status: Some(AdapterConfigurationStatus::Unconfigured),
                subscription_status: None,
            });
        }
    }

    /// Reports the adapter's complete flag set.
    pub fn emit_flags(&self, flags: Flags) {
        if let Some(handlers) = self.handlers.read().as_ref() {
            handlers.on_flags_state_change(FlagsChange {
                id: Some(self.id.clone()),
                flags,
            });
        }
    }

    /// Reports flags that originate from a live provider update. Dropped while
    /// unsubscribed.
    pub fn emit_live_flags(&self, flags: Flags) {
        if self.is_subscribed() {
            self.emit_flags(flags);
        } else {
            tracing::debug!("Adapter '{}' is unsubscribed, live update dropped", self.id);
        }
    }

    fn emit_status(&self, status: PartialAdapterStatus) {
        if let Some(handlers) = self.handlers.read().as_ref() {
            handlers.on_status_state_change(AdapterStatusChange {
                id: Some(self.id.clone()),
                status,
            });
        }
    }

    /// Applies the failure policy of a failed provider handshake: an error
    /// when the caller opted into it, a `Failed` configuration otherwise.
    pub fn initialization_failure(
        &self,
        throw_on_initialization_failure: bool,
        cause: FlagBridgeError,
    ) -> Result<AdapterConfiguration> {
        let error = FlagBridgeError::initialization_failed(&self.id, cause);
        tracing::warn!("{}", error);

        if throw_on_initialization_failure {
            Err(error)
        } else {
            Ok(AdapterConfiguration::failed())
        }
    }
}
