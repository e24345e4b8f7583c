mod adapter;
mod adapter_context;
pub mod cache;
pub mod config;
pub mod event_pump;
mod flag_store;
mod lifecycle;
mod polling_manager;
mod registry;

pub use adapter::Adapter;
pub use adapter_context::AdapterContext;
pub use cache::{
    cache_key, create_cache, Cache, CacheIdentifier, CacheOptions, FileCache, MemoryCache,
    DEFAULT_CACHE_PREFIX,
};
pub use config::{
    merge_args, AdapterArgs, ArgsMergeError, CombinedAdapterArgs, FlagsParser,
    GraphQlAdapterArgs, LaunchDarklyAdapterArgs, LocalStorageAdapterArgs, MemoryAdapterArgs,
    SplitioAdapterArgs, DEFAULT_FLAGS_CACHE_NAME, DEFAULT_POLLING_INTERVAL,
};
pub use flag_store::FlagStore;
pub use lifecycle::{
    acquire_configuration_lock, AdapterEvent, AdapterEventHandlers, AdapterLifecycle,
};
pub use polling_manager::{
    PollCallback, PollingConfig, PollingConfigBuilder, PollingManager,
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_JITTER_MS, DEFAULT_MAX_INTERVAL_SECS,
};
pub use registry::{AdapterRegistry, RegistryEntry};
