use async_trait::async_trait;
use std::sync::{Arc, Weak};

use crate::core::cache::{self, Cache, CacheIdentifier, CacheOptions};
use crate::core::config::DEFAULT_FLAGS_CACHE_NAME;
use crate::core::{
    Adapter, AdapterArgs, AdapterEventHandlers, AdapterLifecycle, FlagStore, PollCallback,
    PollingConfig, PollingManager,
};
use crate::error::Result;
use crate::types::{
    AdapterConfiguration, AdapterConfigurationStatus, AdapterIdentifier, AdapterStatus,
    AdapterSubscriptionStatus, FlagVariation, Flags, ReconfigurationOptions, UpdateFlagsOptions,
    User,
};

struct LocalStorageInner {
    lifecycle: AdapterLifecycle,
    store: FlagStore,
    cache: Arc<dyn Cache>,
    key: String,
    polling: PollingManager,
}

impl LocalStorageInner {
    fn read_storage(&self) -> Flags {
        cache::read_flags(self.cache.as_ref(), &self.key).unwrap_or_default()
    }

    /// Picks up writes made to the storage by someone else.
    fn sync_from_storage(&self) {
        if self.store.replace_remote(self.read_storage()) {
            self.lifecycle.emit_live_flags(self.store.all());
        }
    }

    fn start_polling(inner: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let on_poll: PollCallback = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.sync_from_storage();
                }
                Ok(())
            })
        });
        inner.polling.start(on_poll);
    }
}

/// Adapter persisting flags in a local cache, by default a file-backed one.
///
/// Flags written through [`Adapter::update_flags`] survive restarts. The
/// storage is polled so that writes by other processes sharing it are
/// picked up.
pub struct LocalStorageAdapter {
    inner: Arc<LocalStorageInner>,
}

impl Default for LocalStorageAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStorageAdapter {
    pub fn new() -> Self {
        Self::with_cache(cache::create_cache(
            CacheIdentifier::Local,
            CacheOptions::default(),
        ))
    }

    pub fn with_cache(cache: Arc<dyn Cache>) -> Self {
        let args = crate::core::LocalStorageAdapterArgs::default();
        Self {
            inner: Arc::new(LocalStorageInner {
                lifecycle: AdapterLifecycle::new(AdapterIdentifier::localstorage()),
                store: FlagStore::new(),
                cache,
                key: cache::cache_key(CacheIdentifier::Local, DEFAULT_FLAGS_CACHE_NAME),
                polling: PollingManager::new(PollingConfig::new(args.effective_polling_interval())),
            }),
        }
    }

    /// Removes persisted flags.
    pub fn clear_storage(&self) {
        self.inner.cache.unset(&self.inner.key);
    }
}

impl Drop for LocalStorageAdapter {
    fn drop(&mut self) {
        self.inner.polling.stop();
    }
}

#[async_trait]
impl Adapter for LocalStorageAdapter {
    fn id(&self) -> AdapterIdentifier {
        self.inner.lifecycle.id().clone()
    }

    async fn configure(
        &self,
        args: AdapterArgs,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let inner = &self.inner;
        let args = args.into_local_storage(inner.lifecycle.id())?;
        args.validate()?;

        let _guard = inner.lifecycle.lock_configuration().await;
        inner.lifecycle.begin_configuration(handlers, args.clone().into())?;

        inner.store.replace_remote(inner.read_storage());
        inner.lifecycle.emit_flags(inner.store.all());
        inner
            .lifecycle
            .set_configuration_status(AdapterConfigurationStatus::Configured);

        inner
            .polling
            .set_config(PollingConfig::new(args.effective_polling_interval()));
        if inner.lifecycle.is_subscribed() {
            LocalStorageInner::start_polling(inner);
        }

        Ok(AdapterConfiguration::succeeded())
    }

    async fn reconfigure(
        &self,
        args: AdapterArgs,
        options: ReconfigurationOptions,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock_configuration().await;

        let merged = inner
            .lifecycle
            .begin_reconfiguration(args, options)?
            .into_local_storage(inner.lifecycle.id())?;
        merged.validate()?;
        inner
            .lifecycle
            .commit_reconfiguration(handlers, merged.clone().into());

        let was_polling = inner.polling.is_running();
        inner.polling.stop();
        inner
            .polling
            .set_config(PollingConfig::new(merged.effective_polling_interval()));
        if was_polling {
            LocalStorageInner::start_polling(inner);
        }

        inner.lifecycle.emit_flags(inner.store.all());
        Ok(AdapterConfiguration::succeeded())
    }

    fn status(&self) -> AdapterStatus {
        self.inner.lifecycle.status()
    }

    async fn wait_until_configured(&self) {
        self.inner.lifecycle.wait_until_configured().await
    }

    fn subscribe(&self) {
        self.inner
            .lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Subscribed);
        if self.inner.lifecycle.is_configured() {
            LocalStorageInner::start_polling(&self.inner);
        }
    }

    fn unsubscribe(&self) {
        self.inner
            .lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Unsubscribed);
        self.inner.polling.stop();
    }

    fn update_flags(&self, flags: Flags, options: UpdateFlagsOptions) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.require_configured("update_flags")?;

        let all = inner.store.apply_local(&flags, options);
        cache::write_flags(inner.cache.as_ref(), &inner.key, &all);
        inner.lifecycle.emit_flags(all);
        Ok(())
    }

    fn get_flag(&self, flag_name: &str) -> Option<FlagVariation> {
        self.inner.store.get(flag_name)
    }

    fn get_user(&self) -> Option<User> {
        self.inner.lifecycle.args().map(|args| args.user().clone())
    }

    /// Forgets the in-memory flags. Persisted flags stay in the storage and
    /// are read again by the next configuration.
    fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        inner.polling.stop();
        inner.store.clear();
        inner.lifecycle.reset();
        inner.lifecycle.emit_flags(Flags::new());
        Ok(())
    }

    fn args(&self) -> Option<AdapterArgs> {
        self.inner.lifecycle.args()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AdapterEvent, LocalStorageAdapterArgs, MemoryCache};
    use std::time::Duration;

    #[tokio::test]
    async fn test_configure_reads_persisted_flags() {
        let cache = Arc::new(MemoryCache::default());
        cache.set("local/flags", serde_json::json!({"persisted": true}));
        let adapter = LocalStorageAdapter::with_cache(cache);
        let (handlers, mut events) = AdapterEventHandlers::channel();

        adapter
            .configure(
                LocalStorageAdapterArgs::default()
                    .polling_interval(Duration::from_secs(60))
                    .into(),
                handlers,
            )
            .await
            .unwrap();

        assert_eq!(adapter.get_flag("persisted"), Some(FlagVariation::Bool(true)));

        let flags_events: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                AdapterEvent::FlagsStateChange(change) => Some(change.flags),
                _ => None,
            })
            .collect();
        assert_eq!(flags_events.len(), 1);
        assert_eq!(flags_events[0]["persisted"], FlagVariation::Bool(true));
    }

    #[tokio::test]
    async fn test_update_flags_writes_through() {
        let cache = Arc::new(MemoryCache::default());
        let adapter = LocalStorageAdapter::with_cache(cache.clone());
        let (handlers, _events) = AdapterEventHandlers::channel();
        adapter
            .configure(LocalStorageAdapterArgs::default().into(), handlers)
            .await
            .unwrap();

        let mut flags = Flags::new();
        flags.insert("written".to_string(), FlagVariation::from("yes"));
        adapter.update_flags(flags, UpdateFlagsOptions::default()).unwrap();

        assert_eq!(
            cache.get("local/flags"),
            Some(serde_json::json!({"written": "yes"}))
        );
    }

    fn flags_events(events: &mut tokio::sync::mpsc::UnboundedReceiver<AdapterEvent>) -> Vec<Flags> {
        std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                AdapterEvent::FlagsStateChange(change) => Some(change.flags),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_polling_storage() {
        let cache = Arc::new(MemoryCache::default());
        let adapter = LocalStorageAdapter::with_cache(cache.clone());
        let (handlers, mut events) = AdapterEventHandlers::channel();
        adapter
            .configure(
                LocalStorageAdapterArgs::default()
                    .polling_interval(Duration::from_millis(20))
                    .into(),
                handlers,
            )
            .await
            .unwrap();
        flags_events(&mut events);

        cache.set("local/flags", serde_json::json!({"shared": "first"}));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!flags_events(&mut events).is_empty());
        assert_eq!(adapter.get_flag("shared"), Some(FlagVariation::from("first")));

        adapter.unsubscribe();
        cache.set("local/flags", serde_json::json!({"shared": "second"}));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(flags_events(&mut events).is_empty());
        assert_eq!(adapter.get_flag("shared"), Some(FlagVariation::from("first")));
    }

    #[tokio::test]
    async fn test_reset_returns_to_unconfigured() {
        let cache = Arc::new(MemoryCache::default());
        cache.set("local/flags", serde_json::json!({"persisted": true}));
        let adapter = LocalStorageAdapter::with_cache(cache.clone());
        let (handlers, mut events) = AdapterEventHandlers::channel();
        adapter
            .configure(LocalStorageAdapterArgs::default().into(), handlers)
            .await
            .unwrap();
        flags_events(&mut events);

        adapter.reset().unwrap();

        assert!(!adapter.status().is_configured());
        assert!(adapter.get_flag("persisted").is_none());
        assert_eq!(flags_events(&mut events), vec![Flags::new()]);
        assert!(cache.get("local/flags").is_some());
    }
}
