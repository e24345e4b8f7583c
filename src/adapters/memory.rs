use async_trait::async_trait;

use crate::core::{Adapter, AdapterArgs, AdapterEventHandlers, AdapterLifecycle, FlagStore};
use crate::error::Result;
use crate::types::{
    AdapterConfiguration, AdapterConfigurationStatus, AdapterIdentifier, AdapterStatus,
    AdapterSubscriptionStatus, FlagVariation, Flags, ReconfigurationOptions, UpdateFlagsOptions,
    User,
};

/// Adapter keeping flags in memory only. Useful for tests, fixtures and
/// local overrides.
pub struct MemoryAdapter {
    lifecycle: AdapterLifecycle,
    store: FlagStore,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::with_id(AdapterIdentifier::memory())
    }

    /// Creates a memory adapter registered under a custom identifier, e.g. to
    /// combine several in-memory sources.
    pub fn with_id(id: impl Into<AdapterIdentifier>) -> Self {
        Self {
            lifecycle: AdapterLifecycle::new(id.into()),
            store: FlagStore::new(),
        }
    }

    /// Simulates a provider push. Ignored for locked flags and dropped while
    /// unsubscribed.
    pub fn push_flags(&self, flags: Flags) {
        if !self.lifecycle.is_subscribed() {
            tracing::debug!("Adapter '{}' is unsubscribed, push ignored", self.lifecycle.id());
            return;
        }
        if self.store.apply_remote(flags) {
            self.lifecycle.emit_live_flags(self.store.all());
        }
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn id(&self) -> AdapterIdentifier {
        self.lifecycle.id().clone()
    }

    async fn configure(
        &self,
        args: AdapterArgs,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let args = args.into_memory(self.lifecycle.id())?;
        let _guard = self.lifecycle.lock_configuration().await;

        self.lifecycle.begin_configuration(handlers, args.into())?;
        self.lifecycle.emit_flags(self.store.all());
        self.lifecycle
            .set_configuration_status(AdapterConfigurationStatus::Configured);

        Ok(AdapterConfiguration::succeeded())
    }

    async fn reconfigure(
        &self,
        args: AdapterArgs,
        options: ReconfigurationOptions,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let _guard = self.lifecycle.lock_configuration().await;

        let merged = self.lifecycle.begin_reconfiguration(args, options)?;
        self.lifecycle.commit_reconfiguration(handlers, merged);
        self.lifecycle.emit_flags(self.store.all());

        Ok(AdapterConfiguration::succeeded())
    }

    fn status(&self) -> AdapterStatus {
        self.lifecycle.status()
    }

    async fn wait_until_configured(&self) {
        self.lifecycle.wait_until_configured().await
    }

    fn subscribe(&self) {
        self.lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Subscribed);
    }

    fn unsubscribe(&self) {
        self.lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Unsubscribed);
    }

    fn update_flags(&self, flags: Flags, options: UpdateFlagsOptions) -> Result<()> {
        self.lifecycle.require_configured("update_flags")?;

        let all = self.store.apply_local(&flags, options);
        self.lifecycle.emit_flags(all);
        Ok(())
    }

    fn get_flag(&self, flag_name: &str) -> Option<FlagVariation> {
        self.store.get(flag_name)
    }

    fn get_user(&self) -> Option<User> {
        self.lifecycle.args().map(|args| args.user().clone())
    }

    fn reset(&self) -> Result<()> {
        self.store.clear();
        self.lifecycle.reset();
        self.lifecycle.emit_flags(Flags::new());
        Ok(())
    }

    fn args(&self) -> Option<AdapterArgs> {
        self.lifecycle.args()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AdapterEvent, MemoryAdapterArgs};
    use crate::error::ErrorCode;

    fn flags(name: &str, value: impl Into<FlagVariation>) -> Flags {
        let mut flags = Flags::new();
        flags.insert(name.to_string(), value.into());
        flags
    }

    #[tokio::test]
    async fn test_configure_emits_initial_flags() {
        let adapter = MemoryAdapter::new();
        let (handlers, mut events) = AdapterEventHandlers::channel();

        assert!(!adapter.get_is_configuration_status(AdapterConfigurationStatus::Configured));
        adapter
            .configure(MemoryAdapterArgs::default().into(), handlers)
            .await
            .unwrap();
        assert!(adapter.get_is_configuration_status(AdapterConfigurationStatus::Configured));

        let mut saw_flags = false;
        while let Ok(event) = events.try_recv() {
            if let AdapterEvent::FlagsStateChange(change) = event {
                assert_eq!(change.id, Some(AdapterIdentifier::memory()));
                saw_flags = true;
            }
        }
        assert!(saw_flags);
    }

    #[test]
    fn test_update_flags_before_configure_fails() {
        let adapter = MemoryAdapter::new();

        let error = adapter
            .update_flags(flags("a", true), UpdateFlagsOptions::default())
            .unwrap_err();

        assert_eq!(error.code, ErrorCode::AdapterNotConfigured);
    }

    #[tokio::test]
    async fn test_configure_twice_fails() {
        let adapter = MemoryAdapter::new();
        let (handlers, _events) = AdapterEventHandlers::channel();
        adapter
            .configure(MemoryAdapterArgs::default().into(), handlers.clone())
            .await
            .unwrap();

        let error = adapter
            .configure(MemoryAdapterArgs::default().into(), handlers)
            .await
            .unwrap_err();

        assert_eq!(error.code, ErrorCode::AdapterAlreadyConfigured);
    }

    #[tokio::test]
    async fn test_reset_clears_flags() {
        let adapter = MemoryAdapter::new();
        let (handlers, _events) = AdapterEventHandlers::channel();
        adapter
            .configure(MemoryAdapterArgs::default().into(), handlers)
            .await
            .unwrap();
        adapter
            .update_flags(flags("a", true), UpdateFlagsOptions::default())
            .unwrap();

        adapter.reset().unwrap();

        assert!(adapter.get_flag("a").is_none());
        assert!(adapter.get_is_configuration_status(AdapterConfigurationStatus::Unconfigured));
    }

    #[tokio::test]
    async fn test_wrong_args_rejected() {
        let adapter = MemoryAdapter::new();
        let (handlers, _events) = AdapterEventHandlers::channel();

        let error = adapter
            .configure(
                crate::core::LocalStorageAdapterArgs::default().into(),
                handlers,
            )
            .await
            .unwrap_err();

        assert_eq!(error.code, ErrorCode::ConfigInvalidArgs);
        assert!(adapter.get_is_configuration_status(AdapterConfigurationStatus::Unconfigured));
    }
}
