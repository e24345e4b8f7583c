use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

use crate::core::cache::{self, Cache, CacheIdentifier, CacheOptions};
use crate::core::config::DEFAULT_FLAGS_CACHE_NAME;
use crate::core::{
    Adapter, AdapterArgs, AdapterEventHandlers, AdapterLifecycle, FlagStore, GraphQlAdapterArgs,
    PollCallback, PollingConfig, PollingManager, DEFAULT_POLLING_INTERVAL,
};
use crate::error::Result;
use crate::http::{default_parse_flags, FlagsFetcher, FlagsRequest, HttpFlagsFetcher};
use crate::types::{
    AdapterConfiguration, AdapterConfigurationStatus, AdapterIdentifier, AdapterStatus,
    AdapterSubscriptionStatus, FlagVariation, Flags, ReconfigurationOptions, UpdateFlagsOptions,
    User,
};

struct FlagsCache {
    cache: Arc<dyn Cache>,
    key: String,
}

struct GraphQlInner {
    lifecycle: AdapterLifecycle,
    store: FlagStore,
    fetcher: Arc<dyn FlagsFetcher>,
    cache_options: CacheOptions,
    cache_override: Option<Arc<dyn Cache>>,
    cache: RwLock<Option<FlagsCache>>,
    polling: PollingManager,
}

impl GraphQlInner {
    fn current_args(&self) -> Option<GraphQlAdapterArgs> {
        match self.lifecycle.args() {
            Some(AdapterArgs::GraphQl(args)) => Some(args),
            _ => None,
        }
    }

    fn bind_cache(&self, identifier: Option<CacheIdentifier>) {
        *self.cache.write() = identifier.map(|identifier| FlagsCache {
            cache: self
                .cache_override
                .clone()
                .unwrap_or_else(|| cache::create_cache(identifier, self.cache_options.clone())),
            key: cache::cache_key(identifier, DEFAULT_FLAGS_CACHE_NAME),
        });
    }

    fn read_cache(&self) -> Option<Flags> {
        let cache = self.cache.read();
        let cache = cache.as_ref()?;
        cache::read_flags(cache.cache.as_ref(), &cache.key)
    }

    fn write_cache(&self, flags: &Flags) {
        if let Some(cache) = self.cache.read().as_ref() {
            cache::write_flags(cache.cache.as_ref(), &cache.key, flags);
        }
    }

    async fn fetch_flags(&self, args: &GraphQlAdapterArgs) -> Result<Flags> {
        let request = FlagsRequest {
            uri: args.uri.clone(),
            headers: args.request_headers.clone(),
            query: args.query.clone(),
            variables: args.effective_query_variables(),
        };

        let data = self.fetcher.fetch(&request).await?;
        match &args.parse_flags {
            Some(parse) => parse(&data),
            None => default_parse_flags(&data),
        }
    }

    /// Stores freshly fetched flags and reports them when they changed.
    fn apply_fetched(&self, flags: Flags) {
        let changed = self.store.replace_remote(flags);
        self.write_cache(&self.store.all());
        if changed {
            self.lifecycle.emit_live_flags(self.store.all());
        }
        self.lifecycle
            .set_configuration_status(AdapterConfigurationStatus::Configured);
    }

    async fn poll(&self) -> Result<()> {
        let generation = self.lifecycle.generation();
        let Some(args) = self.current_args() else {
            return Ok(());
        };
        let flags = self.fetch_flags(&args).await?;

        let _guard = self.lifecycle.lock_for_refresh().await;
        if self.lifecycle.generation() != generation {
            tracing::debug!("Dropping flags polled for outdated arguments");
            return Ok(());
        }
        self.apply_fetched(flags);
        Ok(())
    }

    fn start_polling(inner: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let on_poll: PollCallback = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.poll().await,
                    None => Ok(()),
                }
            })
        });
        inner.polling.start(on_poll);
    }

    fn restart_polling(inner: &Arc<Self>, args: &GraphQlAdapterArgs) {
        inner.polling.stop();
        inner
            .polling
            .set_config(PollingConfig::new(args.effective_polling_interval()));
        if inner.lifecycle.is_subscribed() {
            Self::start_polling(inner);
        }
    }
}

/// Adapter polling a GraphQL endpoint for flags.
///
/// When a cache identifier is configured, cached flags are emitted before
/// the first request completes and every successful fetch is written back.
/// A failed initial fetch keeps the adapter `Configuring` and polling; the
/// first successful poll completes the configuration.
pub struct GraphQlAdapter {
    inner: Arc<GraphQlInner>,
}

impl GraphQlAdapter {
    /// Creates an adapter fetching over HTTP.
    pub fn new() -> Result<Self> {
        Ok(Self::with_fetcher(Arc::new(HttpFlagsFetcher::new()?)))
    }

    pub fn with_fetcher(fetcher: Arc<dyn FlagsFetcher>) -> Self {
        Self::build(fetcher, CacheOptions::default(), None)
    }

    /// Options for the caches created from `cache_identifier`.
    pub fn cache_options(self, options: CacheOptions) -> Self {
        let (fetcher, _, cache_override) = self.into_parts();
        Self::build(fetcher, options, cache_override)
    }

    /// Uses `cache` instead of creating one from `cache_identifier`. Caching
    /// still only happens when a cache identifier is configured.
    pub fn cache(self, cache: Arc<dyn Cache>) -> Self {
        let (fetcher, cache_options, _) = self.into_parts();
        Self::build(fetcher, cache_options, Some(cache))
    }

    fn build(
        fetcher: Arc<dyn FlagsFetcher>,
        cache_options: CacheOptions,
        cache_override: Option<Arc<dyn Cache>>,
    ) -> Self {
        Self {
            inner: Arc::new(GraphQlInner {
                lifecycle: AdapterLifecycle::new(AdapterIdentifier::graphql()),
                store: FlagStore::new(),
                fetcher,
                cache_options,
                cache_override,
                cache: RwLock::new(None),
                polling: PollingManager::new(PollingConfig::new(DEFAULT_POLLING_INTERVAL)),
            }),
        }
    }

    fn into_parts(self) -> (Arc<dyn FlagsFetcher>, CacheOptions, Option<Arc<dyn Cache>>) {
        (
            Arc::clone(&self.inner.fetcher),
            self.inner.cache_options.clone(),
            self.inner.cache_override.clone(),
        )
    }

    /// Fetches immediately instead of waiting for the next poll.
    pub fn refresh(&self) {
        self.inner.polling.poll_now();
    }
}

impl Drop for GraphQlAdapter {
    fn drop(&mut self) {
        self.inner.polling.stop();
    }
}

#[async_trait]
impl Adapter for GraphQlAdapter {
    fn id(&self) -> AdapterIdentifier {
        self.inner.lifecycle.id().clone()
    }

    async fn configure(
        &self,
        args: AdapterArgs,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let inner = &self.inner;
        let args = args.into_graphql(inner.lifecycle.id())?;
        args.validate()?;

        let _guard = inner.lifecycle.lock_configuration().await;
        inner.lifecycle.begin_configuration(handlers, args.clone().into())?;
        inner.bind_cache(args.cache_identifier);

        if let Some(cached) = inner.read_cache() {
            tracing::debug!("Emitting {} cached flags before fetching", cached.len());
            inner.store.replace_remote(cached);
            inner.lifecycle.emit_flags(inner.store.all());
        }

        match inner.fetch_flags(&args).await {
            Ok(flags) => {
                inner.store.replace_remote(flags);
                inner.write_cache(&inner.store.all());
                inner.lifecycle.emit_flags(inner.store.all());
                inner
                    .lifecycle
                    .set_configuration_status(AdapterConfigurationStatus::Configured);
                GraphQlInner::restart_polling(inner, &args);
                Ok(AdapterConfiguration::succeeded())
            }
            Err(e) => {
                let throw = args.throw_on_initialization_failure.unwrap_or(false);
                let configuration = inner.lifecycle.initialization_failure(throw, e)?;

                inner.lifecycle.emit_flags(inner.store.all());
                GraphQlInner::restart_polling(inner, &args);
                Ok(configuration)
            }
        }
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
            .into_graphql(inner.lifecycle.id())?;
        merged.validate()?;

        let flags = inner.fetch_flags(&merged).await?;
        inner
            .lifecycle
            .commit_reconfiguration(handlers, merged.clone().into());
        inner.bind_cache(merged.cache_identifier);
        inner.store.replace_remote(flags);
        inner.write_cache(&inner.store.all());
        inner.lifecycle.emit_flags(inner.store.all());
        GraphQlInner::restart_polling(inner, &merged);

        Ok(AdapterConfiguration::succeeded())
    }

    fn status(&self) -> AdapterStatus {
        self.inner.lifecycle.status()
    }

    async fn wait_until_configured(&self) {
        self.inner.lifecycle.wait_until_configured().await
    }

    fn subscribe(&self) {
        let inner = &self.inner;
        inner
            .lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Subscribed);
        if inner.current_args().is_some() {
            GraphQlInner::start_polling(inner);
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
        inner.write_cache(&all);
        inner.lifecycle.emit_flags(all);
        Ok(())
    }

    fn get_flag(&self, flag_name: &str) -> Option<FlagVariation> {
        self.inner.store.get(flag_name)
    }

    fn get_user(&self) -> Option<User> {
        self.inner.current_args().map(|args| args.user)
    }

    fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        inner.polling.stop();
        inner.store.clear();
        inner.lifecycle.reset();
        *inner.cache.write() = None;
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
    use crate::core::{AdapterEvent, MemoryCache};
    use crate::error::{ErrorCode, FlagBridgeError};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeFetcher {
        fail: AtomicBool,
        calls: AtomicU32,
        data: parking_lot::Mutex<serde_json::Value>,
    }

    impl FakeFetcher {
        fn new(data: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                calls: AtomicU32::new(0),
                data: parking_lot::Mutex::new(data),
            })
        }
    }

    #[async_trait]
    impl FlagsFetcher for FakeFetcher {
        async fn fetch(&self, _request: &FlagsRequest) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FlagBridgeError::network_error(ErrorCode::NetworkError, "offline"));
            }
            Ok(self.data.lock().clone())
        }
    }

    /// Answers with the requested user id, slowly for `slow_user`.
    #[derive(Default)]
    struct EchoUserFetcher {
        slow_user: parking_lot::Mutex<Option<String>>,
    }

    #[async_trait]
    impl FlagsFetcher for EchoUserFetcher {
        async fn fetch(&self, request: &FlagsRequest) -> Result<serde_json::Value> {
            let user = request.variables["userId"].as_str().unwrap_or_default().to_string();
            let slow = self.slow_user.lock().as_deref() == Some(user.as_str());
            if slow {
                tokio::time::sleep(std::time::Duration::from_millis(80)).await;
            }
            Ok(json!({ "owner": user }))
        }
    }

    fn args() -> GraphQlAdapterArgs {
        GraphQlAdapterArgs::new(User::new("u1"), "https://flags.example.com/graphql", "{ flags }")
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
    async fn test_configure_fetches_flags() {
        let fetcher = FakeFetcher::new(json!({"new-checkout": true}));
        let adapter = GraphQlAdapter::with_fetcher(fetcher.clone());
        let (handlers, mut events) = AdapterEventHandlers::channel();

        let configuration = adapter.configure(args().into(), handlers).await.unwrap();

        assert_eq!(configuration, AdapterConfiguration::succeeded());
        assert!(adapter.status().is_configured());
        assert_eq!(adapter.get_flag("newCheckout"), Some(FlagVariation::Bool(true)));
        assert_eq!(flags_events(&mut events).len(), 1);
    }

    #[tokio::test]
    async fn test_cached_flags_emitted_first_when_fetch_fails() {
        let cache = Arc::new(MemoryCache::default());
        cache.set("local/flags", json!({"flagZ": "on"}));
        let fetcher = FakeFetcher::new(json!({}));
        fetcher.fail.store(true, Ordering::SeqCst);
        let adapter = GraphQlAdapter::with_fetcher(fetcher).cache(cache);
        let (handlers, mut events) = AdapterEventHandlers::channel();

        let configuration = adapter
            .configure(args().cache_identifier(CacheIdentifier::Local).into(), handlers)
            .await
            .unwrap();

        assert_eq!(configuration, AdapterConfiguration::failed());
        assert!(adapter.get_is_configuration_status(AdapterConfigurationStatus::Configuring));
        let emitted = flags_events(&mut events);
        assert_eq!(emitted[0]["flagZ"], FlagVariation::from("on"));
    }

    #[tokio::test]
    async fn test_throw_on_initialization_failure() {
        let fetcher = FakeFetcher::new(json!({}));
        fetcher.fail.store(true, Ordering::SeqCst);
        let adapter = GraphQlAdapter::with_fetcher(fetcher);
        let (handlers, _events) = AdapterEventHandlers::channel();

        let error = adapter
            .configure(args().throw_on_initialization_failure(true).into(), handlers)
            .await
            .unwrap_err();

        assert_eq!(error.code, ErrorCode::InitFailed);
        assert!(!adapter.status().is_configured());
    }

    #[tokio::test]
    async fn test_successful_fetch_is_cached() {
        let cache = Arc::new(MemoryCache::default());
        let adapter =
            GraphQlAdapter::with_fetcher(FakeFetcher::new(json!({"a": 1}))).cache(cache.clone());
        let (handlers, _events) = AdapterEventHandlers::channel();

        adapter
            .configure(args().cache_identifier(CacheIdentifier::Session).into(), handlers)
            .await
            .unwrap();

        assert_eq!(cache.get("session/flags"), Some(json!({"a": 1.0})));
    }

    #[tokio::test]
    async fn test_failed_start_recovers_on_poll() {
        let fetcher = FakeFetcher::new(json!({"a": true}));
        fetcher.fail.store(true, Ordering::SeqCst);
        let adapter = GraphQlAdapter::with_fetcher(fetcher.clone());
        let (handlers, _events) = AdapterEventHandlers::channel();
        adapter
            .configure(
                args()
                    .polling_interval(std::time::Duration::from_millis(10))
                    .into(),
                handlers,
            )
            .await
            .unwrap();

        fetcher.fail.store(false, Ordering::SeqCst);
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            adapter.wait_until_configured(),
        )
        .await
        .unwrap();

        assert_eq!(adapter.get_flag("a"), Some(FlagVariation::Bool(true)));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_polling() {
        let fetcher = FakeFetcher::new(json!({"a": true}));
        let adapter = GraphQlAdapter::with_fetcher(fetcher.clone());
        let (handlers, _events) = AdapterEventHandlers::channel();
        adapter
            .configure(
                args()
                    .polling_interval(std::time::Duration::from_millis(10))
                    .into(),
                handlers,
            )
            .await
            .unwrap();

        adapter.unsubscribe();
        let calls = fetcher.calls.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_poll_for_previous_user_is_discarded() {
        let fetcher = Arc::new(EchoUserFetcher::default());
        let adapter = GraphQlAdapter::with_fetcher(fetcher.clone());
        let (handlers, _events) = AdapterEventHandlers::channel();
        adapter.configure(args().into(), handlers.clone()).await.unwrap();
        assert_eq!(adapter.get_flag("owner"), Some(FlagVariation::from("u1")));

        *fetcher.slow_user.lock() = Some("u1".to_string());
        let inner = Arc::clone(&adapter.inner);
        let poll = tokio::spawn(async move { inner.poll().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        adapter
            .reconfigure(
                GraphQlAdapterArgs::new(User::new("u2"), "https://flags.example.com/graphql", "{ flags }")
                    .into(),
                ReconfigurationOptions::default(),
                handlers,
            )
            .await
            .unwrap();
        poll.await.unwrap().unwrap();

        assert_eq!(adapter.get_flag("owner"), Some(FlagVariation::from("u2")));
        assert_eq!(adapter.get_user().and_then(|user| user.key), Some("u2".to_string()));
    }

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_previous_arguments() {
        let fetcher = FakeFetcher::new(json!({"a": true}));
        let adapter = GraphQlAdapter::with_fetcher(fetcher.clone());
        let (handlers, _events) = AdapterEventHandlers::channel();
        adapter.configure(args().into(), handlers.clone()).await.unwrap();

        fetcher.fail.store(true, Ordering::SeqCst);
        let result = adapter
            .reconfigure(
                GraphQlAdapterArgs::new(User::new("u2"), "https://flags.example.com/graphql", "{ flags }")
                    .into(),
                ReconfigurationOptions::default(),
                handlers,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(adapter.get_user().and_then(|user| user.key), Some("u1".to_string()));
        assert_eq!(adapter.get_flag("a"), Some(FlagVariation::Bool(true)));
    }
}
