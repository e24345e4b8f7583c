use async_trait::async_trait;

use crate::core::config::AdapterArgs;
use crate::core::lifecycle::AdapterEventHandlers;
use crate::error::Result;
use crate::types::{
    AdapterConfiguration, AdapterConfigurationStatus, AdapterIdentifier, AdapterStatus,
    FlagVariation, Flags, ReconfigurationOptions, UpdateFlagsOptions, User,
};

/// A flag provider binding.
///
/// Adapters report upward exclusively through the [`AdapterEventHandlers`]
/// passed to `configure`/`reconfigure`. Configuration calls on one adapter
/// are serialized: a call issued while another is pending waits for it.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn id(&self) -> AdapterIdentifier;

    /// Adapters whose flags take precedence when this adapter is combined.
    fn effect_ids(&self) -> Vec<AdapterIdentifier> {
        Vec::new()
    }

    /// First-time setup. Emits the initial flag set before resolving.
    async fn configure(
        &self,
        args: AdapterArgs,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration>;

    /// Applies new arguments to a configured adapter, merging them onto the
    /// previous ones unless `options.should_overwrite` is set.
    async fn reconfigure(
        &self,
        args: AdapterArgs,
        options: ReconfigurationOptions,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration>;

    fn status(&self) -> AdapterStatus;

    fn get_is_configuration_status(&self, status: AdapterConfigurationStatus) -> bool {
        self.status().configuration_status == status
    }

    async fn wait_until_configured(&self);

    fn subscribe(&self);

    fn unsubscribe(&self);

    /// Overrides flags locally. Fails when the adapter is not configured.
    fn update_flags(&self, flags: Flags, options: UpdateFlagsOptions) -> Result<()>;

    fn get_flag(&self, _flag_name: &str) -> Option<FlagVariation> {
        None
    }

    fn get_user(&self) -> Option<User> {
        None
    }

    /// Returns to `Unconfigured` and drops local flag state. Adapters without
    /// ephemeral state keep the default no-op.
    fn reset(&self) -> Result<()> {
        tracing::debug!("Adapter '{}' has nothing to reset", self.id());
        Ok(())
    }

    /// Arguments currently in effect.
    fn args(&self) -> Option<AdapterArgs>;
}
