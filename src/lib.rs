//! flagbridge
//!
//! Provider-agnostic feature flag adapters and the engine that combines
//! them into one flag surface.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use flagbridge::{
//!     combine, Adapter, AdapterContext, AdapterIdentifier, AdapterRegistry, CombinedAdapterArgs,
//!     MemoryAdapter, MemoryAdapterArgs, User,
//! };
//!
//! #[tokio::main]
//! async fn main() -> flagbridge::Result<()> {
//!     let defaults: Arc<dyn Adapter> = Arc::new(MemoryAdapter::with_id("defaults"));
//!     let overrides: Arc<dyn Adapter> = Arc::new(MemoryAdapter::with_id("overrides"));
//!
//!     // Flags of `overrides` win over `defaults`.
//!     let combined = combine(
//!         vec![defaults, overrides],
//!         vec![AdapterIdentifier::new("overrides")],
//!     );
//!
//!     let registry = Arc::new(AdapterRegistry::new());
//!     let context = AdapterContext::with_registry(Arc::new(combined), registry.clone());
//!
//!     let user = User::new("user-123");
//!     context
//!         .configure(
//!             CombinedAdapterArgs::new(user.clone())
//!                 .adapter("defaults", MemoryAdapterArgs::new(user.clone()))
//!                 .adapter("overrides", MemoryAdapterArgs::new(user)),
//!         )
//!         .await?;
//!
//!     let dark_mode = context.get_flag("dark-mode");
//!     println!("dark mode: {:?}", dark_mode);
//!
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod core;
pub mod error;
pub mod http;
pub mod types;

pub use types::{
    get_flag_variation, normalize_flag_name, AdapterConfiguration, AdapterConfigurationStatus,
    AdapterIdentifier, AdapterStatus, AdapterStatusChange, AdapterSubscriptionStatus, FlagName,
    FlagVariation, Flags, FlagsChange, FlagsContext, InitializationStatus, PartialAdapterStatus,
    ReconfigurationOptions, UpdateFlagsOptions, User,
};

pub use error::{ErrorCode, FlagBridgeError, Result};

pub use core::{
    Adapter, AdapterArgs, AdapterContext, AdapterEvent, AdapterEventHandlers, AdapterRegistry,
    Cache, CacheIdentifier, CacheOptions, CombinedAdapterArgs, FileCache, GraphQlAdapterArgs,
    LaunchDarklyAdapterArgs, LocalStorageAdapterArgs, MemoryAdapterArgs, MemoryCache,
    PollingConfig, RegistryEntry, SplitioAdapterArgs, DEFAULT_CACHE_PREFIX,
    DEFAULT_POLLING_INTERVAL,
};

pub use adapters::{
    combine, CombinedAdapter, GraphQlAdapter, LaunchDarklyAdapter, LaunchDarklyClient,
    LocalStorageAdapter, MemoryAdapter, SplitClient, SplitioAdapter,
};

pub use http::{FlagsFetcher, FlagsRequest, HttpFlagsFetcher};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
