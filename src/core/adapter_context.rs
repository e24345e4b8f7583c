//! The consumer side of an adapter.
//!
//! An [`AdapterContext`] owns the event channel of one adapter (usually a
//! combined one), keeps the last reported flags and status for synchronous
//! reads and `watch` subscriptions, and routes reconfiguration calls to the
//! adapter one at a time. Once the adapter is configured it is registered in
//! the optional [`AdapterRegistry`]; a reset removes it again.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use crate::core::adapter::Adapter;
use crate::core::config::AdapterArgs;
use crate::core::event_pump::{self, EventPump, EventReceiver};
use crate::core::lifecycle::{acquire_configuration_lock, AdapterEvent, AdapterEventHandlers};
use crate::core::registry::AdapterRegistry;
use crate::error::Result;
use crate::types::{
    get_flag_variation, AdapterConfiguration, AdapterIdentifier, AdapterStatus, FlagVariation,
    Flags, ReconfigurationOptions,
};

struct ContextState {
    adapter: Arc<dyn Adapter>,
    registry: Option<Arc<AdapterRegistry>>,
    flags: watch::Sender<Flags>,
    status: watch::Sender<AdapterStatus>,
    flags_updated_at: RwLock<Option<DateTime<Utc>>>,
}

impl ContextState {
    fn handle_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::FlagsStateChange(change) => {
                self.flags.send_replace(change.flags);
                *self.flags_updated_at.write() = Some(Utc::now());
            }
            AdapterEvent::StatusStateChange(change) => {
                let mut next = *self.status.borrow();
                change.status.apply_to(&mut next);
                self.set_status(next);
            }
        }
    }

    fn set_status(&self, next: AdapterStatus) {
        let previous = self.status.send_replace(next);
        if previous == next {
            return;
        }

        tracing::debug!("Adapter '{}' reported {:?}", self.adapter.id(), next);
        match (previous.is_configured(), next.is_configured()) {
            (false, true) => self.register(),
            (true, false) => self.unregister(),
            _ => {}
        }
    }

    fn register(&self) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.register(Arc::clone(&self.adapter)) {
                tracing::warn!("Could not register adapter: {}", e);
            }
        }
    }

    fn unregister(&self) {
        if let Some(registry) = &self.registry {
            registry.remove(self.adapter.id().as_str());
        }
    }
}

/// Flags and status of one adapter, kept current from its events.
pub struct AdapterContext {
    state: Arc<ContextState>,
    handlers: AdapterEventHandlers,
    configuration: tokio::sync::Mutex<()>,
    idle_receiver: Mutex<Option<EventReceiver>>,
    pump: Mutex<Option<EventPump>>,
}

impl AdapterContext {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self::build(adapter, None)
    }

    /// Creates a context that registers the adapter in `registry` once it is
    /// configured.
    pub fn with_registry(adapter: Arc<dyn Adapter>, registry: Arc<AdapterRegistry>) -> Self {
        Self::build(adapter, Some(registry))
    }

    fn build(adapter: Arc<dyn Adapter>, registry: Option<Arc<AdapterRegistry>>) -> Self {
        let (handlers, receiver) = AdapterEventHandlers::channel();
        let (flags, _) = watch::channel(Flags::new());
        let (status, _) = watch::channel(adapter.status());

        Self {
            state: Arc::new(ContextState {
                adapter,
                registry,
                flags,
                status,
                flags_updated_at: RwLock::new(None),
            }),
            handlers,
            configuration: tokio::sync::Mutex::new(()),
            idle_receiver: Mutex::new(Some(receiver)),
            pump: Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.state.adapter
    }

    /// Identifiers whose flags take precedence in the adapter.
    pub fn adapter_effect_identifiers(&self) -> Vec<AdapterIdentifier> {
        self.state.adapter.effect_ids()
    }

    /// Configures the adapter. Every event emitted while configuring is
    /// reflected by [`AdapterContext::flags`] and [`AdapterContext::status`]
    /// once this returns.
    pub async fn configure(&self, args: impl Into<AdapterArgs>) -> Result<AdapterConfiguration> {
        let adapter = Arc::clone(&self.state.adapter);
        let handlers = self.handlers.clone();
        let args = args.into();

        self.run_serialized(async move { adapter.configure(args, handlers).await })
            .await
    }

    /// Reconfigures the adapter. Calls queue behind each other, so each
    /// merge applies on top of the previous call's result.
    pub async fn reconfigure(
        &self,
        args: impl Into<AdapterArgs>,
        options: ReconfigurationOptions,
    ) -> Result<AdapterConfiguration> {
        let adapter = Arc::clone(&self.state.adapter);
        let handlers = self.handlers.clone();
        let args = args.into();

        self.run_serialized(async move { adapter.reconfigure(args, options, handlers).await })
            .await
    }

    /// Resets the adapter and removes it from the registry.
    pub async fn reset(&self) -> Result<()> {
        let adapter = Arc::clone(&self.state.adapter);
        let result = self.run_serialized(async move { adapter.reset() }).await;

        self.state.unregister();
        result
    }

    async fn run_serialized<T>(&self, work: impl std::future::Future<Output = T>) -> T {
        let _guard = acquire_configuration_lock(&self.configuration, &self.state.adapter.id()).await;

        let mut receiver = match self.take_receiver().await {
            Some(receiver) => receiver,
            None => {
                tracing::warn!("Event channel of adapter '{}' is closed", self.state.adapter.id());
                return work.await;
            }
        };

        let state = &self.state;
        let output = event_pump::drive(&mut receiver, work, |event| state.handle_event(event)).await;
        state.set_status(state.adapter.status());

        self.spawn_pump(receiver);
        output
    }

    async fn take_receiver(&self) -> Option<EventReceiver> {
        if let Some(receiver) = self.idle_receiver.lock().take() {
            return Some(receiver);
        }
        let pump = self.pump.lock().take()?;
        pump.stop().await
    }

    fn spawn_pump(&self, receiver: EventReceiver) {
        let weak: Weak<ContextState> = Arc::downgrade(&self.state);
        let pump = EventPump::spawn(receiver, move |event| match weak.upgrade() {
            Some(state) => {
                state.handle_event(event);
                true
            }
            None => false,
        });

        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
    }

    pub fn flags(&self) -> Flags {
        self.state.flags.borrow().clone()
    }

    /// Value of a flag, `false` when unknown.
    pub fn get_flag(&self, flag_name: &str) -> FlagVariation {
        get_flag_variation(&self.state.flags.borrow(), flag_name)
    }

    pub fn status(&self) -> AdapterStatus {
        *self.state.status.borrow()
    }

    pub fn watch_flags(&self) -> watch::Receiver<Flags> {
        self.state.flags.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<AdapterStatus> {
        self.state.status.subscribe()
    }

    /// When flags were last reported, if ever.
    pub fn flags_updated_at(&self) -> Option<DateTime<Utc>> {
        *self.state.flags_updated_at.read()
    }

    pub async fn wait_until_configured(&self) {
        self.state.adapter.wait_until_configured().await
    }

    pub fn subscribe(&self) {
        self.state.adapter.subscribe();
    }

    pub fn unsubscribe(&self) {
        self.state.adapter.unsubscribe();
    }
}

impl Drop for AdapterContext {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
