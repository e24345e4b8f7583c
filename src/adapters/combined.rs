//! Presents several adapters as one.
//!
//! Constituents report into one internal event channel. The combiner keeps
//! each constituent's flags apart in a [`FlagsContext`] and emits one
//! flattened view upward on every flags change, with effect adapters
//! overlaid last. Its status is the pointwise aggregate of the constituents'
//! statuses and is only re-emitted when that aggregate changes.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use crate::core::event_pump::{self, EventPump, EventReceiver};
use crate::core::{
    acquire_configuration_lock, merge_args, Adapter, AdapterArgs, AdapterEvent,
    AdapterEventHandlers,
};
use crate::error::{ErrorCode, FlagBridgeError, Result};
use crate::types::{
    AdapterConfiguration, AdapterIdentifier, AdapterStatus, AdapterStatusChange, FlagVariation,
    Flags, FlagsChange, FlagsContext, InitializationStatus, PartialAdapterStatus,
    ReconfigurationOptions, UpdateFlagsOptions, User,
};

/// Merges per-adapter flags into one view: adapters in `order`, then the
/// effect adapters again so that their values win on collisions.
pub fn flatten_flags(
    order: &[AdapterIdentifier],
    effect_ids: &[AdapterIdentifier],
    context: &FlagsContext,
) -> Flags {
    let (effects, regular): (Vec<_>, Vec<_>) =
        order.iter().partition(|id| effect_ids.contains(*id));

    let mut flags = Flags::new();
    for id in regular.into_iter().chain(effects) {
        if let Some(adapter_flags) = context.get(id) {
            flags.extend(adapter_flags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    flags
}

struct CombinedInner {
    id: AdapterIdentifier,
    adapters: Vec<Arc<dyn Adapter>>,
    order: Vec<AdapterIdentifier>,
    effect_ids: Vec<AdapterIdentifier>,
    configuration: tokio::sync::Mutex<()>,
    handlers: RwLock<Option<AdapterEventHandlers>>,
    constituent_handlers: RwLock<Option<AdapterEventHandlers>>,
    args: RwLock<Option<AdapterArgs>>,
    context: RwLock<FlagsContext>,
    flags: RwLock<Flags>,
    published_status: watch::Sender<AdapterStatus>,
    pump: Mutex<Option<EventPump>>,
}

impl CombinedInner {
    fn aggregate_status(&self) -> AdapterStatus {
        AdapterStatus::aggregate(self.adapters.iter().map(|adapter| adapter.status()))
    }

    fn handle_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::FlagsStateChange(FlagsChange { id, flags }) => {
                let Some(id) = id else {
                    tracing::warn!("Ignoring flags change without adapter identifier");
                    return;
                };

                let flattened = {
                    let mut context = self.context.write();
                    context.insert(id, flags);
                    flatten_flags(&self.order, &self.effect_ids, &context)
                };
                *self.flags.write() = flattened.clone();

                if let Some(handlers) = self.handlers.read().as_ref() {
                    handlers.on_flags_state_change(FlagsChange {
                        id: Some(self.id.clone()),
                        flags: flattened,
                    });
                }
            }
            AdapterEvent::StatusStateChange(_) => self.publish_status(),
        }
    }

    /// Emits the aggregate status if it differs from the last one emitted.
    fn publish_status(&self) {
        let aggregate = self.aggregate_status();
        let changed = self.published_status.send_if_modified(|published| {
            if *published == aggregate {
                false
            } else {
                *published = aggregate;
                true
            }
        });

        if changed {
            tracing::debug!("Combined adapter status is now {:?}", aggregate);
            if let Some(handlers) = self.handlers.read().as_ref() {
                handlers.on_status_state_change(AdapterStatusChange {
                    id: Some(self.id.clone()),
                    status: PartialAdapterStatus::from(aggregate),
                });
            }
        }
    }

    fn spawn_pump(inner: &Arc<Self>, receiver: EventReceiver) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let pump = EventPump::spawn(receiver, move |event| match weak.upgrade() {
            Some(inner) => {
                inner.handle_event(event);
                true
            }
            None => false,
        });

        if let Some(previous) = inner.pump.lock().replace(pump) {
            previous.abort();
        }
    }

    async fn take_receiver(&self) -> Option<EventReceiver> {
        let pump = self.pump.lock().take()?;
        pump.stop().await
    }

    fn emit_flags(&self) {
        if let Some(handlers) = self.handlers.read().as_ref() {
            handlers.on_flags_state_change(FlagsChange {
                id: Some(self.id.clone()),
                flags: self.flags.read().clone(),
            });
        }
    }

    /// Turns per-constituent results into the combined outcome.
    fn conclude(
        &self,
        results: Vec<(AdapterIdentifier, Result<AdapterConfiguration>)>,
    ) -> Result<AdapterConfiguration> {
        let mut failures = Vec::new();
        let mut initialization_failed = false;

        for (id, result) in results {
            match result {
                Ok(configuration) => {
                    if configuration.initialization_status == Some(InitializationStatus::Failed) {
                        initialization_failed = true;
                    }
                }
                Err(e) => {
                    tracing::warn!("Constituent '{}' of combined adapter failed: {}", id, e);
                    failures.push((id, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(FlagBridgeError::combined_partial_failure(failures));
        }

        Ok(if initialization_failed {
            AdapterConfiguration::failed()
        } else {
            AdapterConfiguration::succeeded()
        })
    }

    /// Calls `operation` on every constituent. All are called even if some
    /// fail.
    fn fan_out(&self, operation: impl Fn(&dyn Adapter) -> Result<()>) -> Result<()> {
        let failures: Vec<_> = self
            .adapters
            .iter()
            .filter_map(|adapter| {
                operation(adapter.as_ref()).err().map(|e| {
                    tracing::warn!("Constituent '{}' of combined adapter failed: {}", adapter.id(), e);
                    (adapter.id(), e)
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlagBridgeError::combined_partial_failure(failures))
        }
    }
}

pub struct CombinedAdapter {
    inner: Arc<CombinedInner>,
}

/// Combines `adapters` into one adapter. Flags of adapters listed in
/// `effect_ids` take precedence over the others.
pub fn combine(
    adapters: Vec<Arc<dyn Adapter>>,
    effect_ids: Vec<AdapterIdentifier>,
) -> CombinedAdapter {
    CombinedAdapter::new(adapters, effect_ids)
}

impl CombinedAdapter {
    pub fn new(adapters: Vec<Arc<dyn Adapter>>, effect_ids: Vec<AdapterIdentifier>) -> Self {
        let order: Vec<_> = adapters.iter().map(|adapter| adapter.id()).collect();

        for (index, id) in order.iter().enumerate() {
            if order[..index].contains(id) {
                tracing::warn!("Adapter '{}' is combined more than once", id);
            }
        }
        for id in effect_ids.iter().filter(|id| !order.contains(id)) {
            tracing::warn!("Effect adapter '{}' is not part of the combination", id);
        }

        let (published_status, _) = watch::channel(AdapterStatus::default());
        Self {
            inner: Arc::new(CombinedInner {
                id: AdapterIdentifier::combined(),
                adapters,
                order,
                effect_ids,
                configuration: tokio::sync::Mutex::new(()),
                handlers: RwLock::new(None),
                constituent_handlers: RwLock::new(None),
                args: RwLock::new(None),
                context: RwLock::new(FlagsContext::new()),
                flags: RwLock::new(Flags::new()),
                published_status,
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.inner.adapters
    }

    /// Flags of each constituent before flattening.
    pub fn flags_context(&self) -> FlagsContext {
        self.inner.context.read().clone()
    }

    /// The aggregate status as last emitted upward.
    pub fn watch_status(&self) -> watch::Receiver<AdapterStatus> {
        self.inner.published_status.subscribe()
    }
}

impl Drop for CombinedAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl Adapter for CombinedAdapter {
    fn id(&self) -> AdapterIdentifier {
        self.inner.id.clone()
    }

    fn effect_ids(&self) -> Vec<AdapterIdentifier> {
        self.inner.effect_ids.clone()
    }

    async fn configure(
        &self,
        args: AdapterArgs,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let inner = &self.inner;
        let args = args.into_combined(&inner.id)?;
        if inner.adapters.is_empty() {
            return Err(FlagBridgeError::config_error(
                ErrorCode::ConfigMissingRequired,
                "Combined adapter has no adapters to configure",
            )
            .for_adapter(&inner.id));
        }

        let _guard = acquire_configuration_lock(&inner.configuration, &inner.id).await;
        if inner.aggregate_status().is_configured() {
            return Err(FlagBridgeError::already_configured(&inner.id));
        }

        if let Some(pump) = inner.pump.lock().take() {
            pump.abort();
        }
        inner.context.write().clear();
        inner.flags.write().clear();
        *inner.handlers.write() = Some(handlers);
        *inner.args.write() = Some(args.clone().into());

        let (constituent_handlers, mut receiver) = AdapterEventHandlers::channel();
        *inner.constituent_handlers.write() = Some(constituent_handlers.clone());

        let configure_all = join_all(inner.adapters.iter().map(|adapter| {
            let id = adapter.id();
            let adapter_args = args.args_for(&id);
            let handlers = constituent_handlers.clone();
            async move {
                let result = match adapter_args {
                    Some(adapter_args) => adapter.configure(adapter_args, handlers).await,
                    None => Err(FlagBridgeError::config_error(
                        ErrorCode::ConfigMissingRequired,
                        format!("No arguments given for adapter '{}'", id),
                    )
                    .for_adapter(&id)),
                };
                (id, result)
            }
        }));

        let results =
            event_pump::drive(&mut receiver, configure_all, |event| inner.handle_event(event)).await;
        if inner.context.read().is_empty() {
            inner.emit_flags();
        }
        inner.publish_status();
        CombinedInner::spawn_pump(inner, receiver);

        inner.conclude(results)
    }

    async fn reconfigure(
        &self,
        args: AdapterArgs,
        options: ReconfigurationOptions,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let inner = &self.inner;
        let _guard = acquire_configuration_lock(&inner.configuration, &inner.id).await;

        let Some(constituent_handlers) = inner.constituent_handlers.read().clone() else {
            return Err(FlagBridgeError::not_configured(&inner.id, "reconfigure"));
        };
        let delta = args.clone().into_combined(&inner.id)?;

        let merged = merge_args(&inner.id, inner.args.read().as_ref(), args, options)?;
        *inner.args.write() = Some(merged);
        *inner.handlers.write() = Some(handlers);

        let reconfigure_all = join_all(inner.adapters.iter().filter_map(|adapter| {
            let id = adapter.id();
            let adapter_args = delta.args_for(&id).or_else(|| {
                // A shared user change reaches every constituent.
                (!delta.user.is_empty()).then(|| adapter.args()).flatten().map(|current| {
                    let user = current.user().merge(&delta.user);
                    current.with_user(user)
                })
            })?;
            let handlers = constituent_handlers.clone();
            Some(async move {
                let result = adapter.reconfigure(adapter_args, options, handlers).await;
                (id, result)
            })
        }));

        let results = match inner.take_receiver().await {
            Some(mut receiver) => {
                let results = event_pump::drive(&mut receiver, reconfigure_all, |event| {
                    inner.handle_event(event)
                })
                .await;
                CombinedInner::spawn_pump(inner, receiver);
                results
            }
            None => reconfigure_all.await,
        };
        inner.publish_status();

        inner.conclude(results)
    }

    fn status(&self) -> AdapterStatus {
        self.inner.aggregate_status()
    }

    async fn wait_until_configured(&self) {
        join_all(
            self.inner
                .adapters
                .iter()
                .map(|adapter| adapter.wait_until_configured()),
        )
        .await;
    }

    fn subscribe(&self) {
        for adapter in &self.inner.adapters {
            adapter.subscribe();
        }
    }

    fn unsubscribe(&self) {
        for adapter in &self.inner.adapters {
            adapter.unsubscribe();
        }
    }

    fn update_flags(&self, flags: Flags, options: UpdateFlagsOptions) -> Result<()> {
        self.inner
            .fan_out(|adapter| adapter.update_flags(flags.clone(), options))
    }

    fn get_flag(&self, flag_name: &str) -> Option<FlagVariation> {
        self.inner.flags.read().get(flag_name).cloned()
    }

    fn get_user(&self) -> Option<User> {
        self.inner.args.read().as_ref().map(|args| args.user().clone())
    }

    fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let result = inner.fan_out(|adapter| adapter.reset());

        inner.context.write().clear();
        inner.flags.write().clear();
        *inner.args.write() = None;
        inner.emit_flags();
        inner.publish_status();
        result
    }

    fn args(&self) -> Option<AdapterArgs> {
        self.inner.args.read().clone()
    }
}
