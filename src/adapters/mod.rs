//! Concrete adapters.

mod combined;
mod graphql;
mod launchdarkly;
mod local_storage;
mod memory;
mod splitio;

pub use combined::{combine, flatten_flags, CombinedAdapter};
pub use graphql::GraphQlAdapter;
pub use launchdarkly::{LaunchDarklyAdapter, LaunchDarklyClient};
pub use local_storage::LocalStorageAdapter;
pub use memory::MemoryAdapter;
pub use splitio::{treatments_to_flags, SplitClient, SplitioAdapter, Treatments};
