use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::{
    Adapter, AdapterArgs, AdapterEventHandlers, AdapterLifecycle, FlagStore,
    LaunchDarklyAdapterArgs,
};
use crate::error::Result;
use crate::types::{
    normalize_flag_name, AdapterConfiguration, AdapterConfigurationStatus, AdapterIdentifier,
    AdapterStatus, AdapterSubscriptionStatus, FlagVariation, Flags, ReconfigurationOptions,
    UpdateFlagsOptions, User,
};

/// The LaunchDarkly client SDK as seen by the adapter.
#[async_trait]
pub trait LaunchDarklyClient: Send + Sync {
    /// Connects for `user` and resolves once the first flag set is known.
    async fn initialize(&self, client_side_id: &str, user: &User) -> Result<()>;

    /// Switches the evaluated user.
    async fn identify(&self, user: &User) -> Result<()>;

    /// Current variation of every flag, keyed by provider flag key.
    fn all_flags(&self) -> Flags;

    /// Streamed flag changes, keyed by provider flag key.
    fn flag_changes(&self) -> broadcast::Receiver<Flags>;
}

/// Normalizes provider keys and restricts them to the requested flags,
/// falling back to the requested defaults.
fn select_flags(args: &LaunchDarklyAdapterArgs, raw: Flags) -> Flags {
    let normalized: Flags = raw
        .into_iter()
        .map(|(name, value)| (normalize_flag_name(&name), value))
        .collect();

    if args.flags.is_empty() {
        return normalized;
    }

    args.flags
        .iter()
        .map(|(name, default)| {
            let name = normalize_flag_name(name);
            let value = normalized.get(&name).cloned().unwrap_or_else(|| default.clone());
            (name, value)
        })
        .collect()
}

/// Like [`select_flags`] for a partial change set: no defaults are filled in.
fn select_changes(args: &LaunchDarklyAdapterArgs, raw: Flags) -> Flags {
    raw.into_iter()
        .map(|(name, value)| (normalize_flag_name(&name), value))
        .filter(|(name, _)| {
            args.flags.is_empty() || args.flags.keys().any(|f| normalize_flag_name(f) == *name)
        })
        .collect()
}

struct LaunchDarklyInner {
    lifecycle: AdapterLifecycle,
    store: FlagStore,
    client: Arc<dyn LaunchDarklyClient>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl LaunchDarklyInner {
    fn current_args(&self) -> Option<LaunchDarklyAdapterArgs> {
        match self.lifecycle.args() {
            Some(AdapterArgs::LaunchDarkly(args)) => Some(args),
            _ => None,
        }
    }

    fn apply_changes(&self, changes: Flags) {
        let Some(args) = self.current_args() else {
            return;
        };
        let changes = select_changes(&args, changes);
        if !changes.is_empty() && self.store.apply_remote(changes) {
            self.lifecycle.emit_live_flags(self.store.all());
        }
    }

    /// Forwards streamed changes until stopped. Holds the adapter weakly so
    /// that dropping the adapter ends the stream.
    fn start_forwarding(inner: &Arc<Self>, mut changes: broadcast::Receiver<Flags>) {
        let mut forwarder = inner.forwarder.lock();
        if forwarder.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(inner);
        *forwarder = Some(tokio::spawn(async move {
            loop {
                let flags = match changes.recv().await {
                    Ok(flags) => flags,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Skipped {} LaunchDarkly flag change batches", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let delay = match weak.upgrade() {
                    Some(inner) => inner.current_args().and_then(|args| args.flags_update_delay),
                    None => break,
                };
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                match weak.upgrade() {
                    Some(inner) => inner.apply_changes(flags),
                    None => break,
                }
            }
        }));
        tracing::debug!("Forwarding LaunchDarkly flag changes");
    }

    fn stop_forwarding(&self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
            tracing::debug!("Stopped forwarding LaunchDarkly flag changes");
        }
    }

    /// `changes` must have been obtained before the flags it complements
    /// were read, so that no change falls in between.
    fn maybe_start_forwarding(
        inner: &Arc<Self>,
        args: &LaunchDarklyAdapterArgs,
        changes: broadcast::Receiver<Flags>,
    ) {
        if args.should_subscribe_to_flag_changes() && inner.lifecycle.is_subscribed() {
            Self::start_forwarding(inner, changes);
        }
    }
}

pub struct LaunchDarklyAdapter {
    inner: Arc<LaunchDarklyInner>,
}

impl LaunchDarklyAdapter {
    pub fn new(client: Arc<dyn LaunchDarklyClient>) -> Self {
        Self {
            inner: Arc::new(LaunchDarklyInner {
                lifecycle: AdapterLifecycle::new(AdapterIdentifier::launchdarkly()),
                store: FlagStore::new(),
                client,
                forwarder: Mutex::new(None),
            }),
        }
    }

    /// Overlays `attributes` onto the current user and re-identifies.
    pub async fn update_user_context(
        &self,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock_configuration().await;
        inner.lifecycle.require_configured("update_user_context")?;

        let Some(mut args) = inner.current_args() else {
            return Ok(());
        };
        args.user.attributes.extend(attributes);
        inner.client.identify(&args.user).await?;

        let flags = select_flags(&args, inner.client.all_flags());
        inner.lifecycle.bind_args(args.into());
        inner.store.replace_remote(flags);
        inner.lifecycle.emit_flags(inner.store.all());
        Ok(())
    }
}

impl Drop for LaunchDarklyAdapter {
    fn drop(&mut self) {
        self.inner.stop_forwarding();
    }
}

#[async_trait]
impl Adapter for LaunchDarklyAdapter {
    fn id(&self) -> AdapterIdentifier {
        self.inner.lifecycle.id().clone()
    }

    async fn configure(
        &self,
        args: AdapterArgs,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let inner = &self.inner;
        let args = args.into_launchdarkly(inner.lifecycle.id())?;
        args.validate()?;

        let _guard = inner.lifecycle.lock_configuration().await;
        inner.lifecycle.begin_configuration(handlers, args.clone().into())?;

        let changes = inner.client.flag_changes();
        if let Err(e) = inner.client.initialize(&args.client_side_id, &args.user).await {
            let throw = args.throw_on_initialization_failure.unwrap_or(false);
            let configuration = inner.lifecycle.initialization_failure(throw, e)?;

            inner.store.replace_remote(select_flags(&args, Flags::new()));
            inner.lifecycle.emit_flags(inner.store.all());
            return Ok(configuration);
        }

        inner
            .store
            .replace_remote(select_flags(&args, inner.client.all_flags()));
        inner.lifecycle.emit_flags(inner.store.all());
        inner
            .lifecycle
            .set_configuration_status(AdapterConfigurationStatus::Configured);
        LaunchDarklyInner::maybe_start_forwarding(inner, &args, changes);

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

        let previous_user = inner.current_args().map(|args| args.user);
        let merged = inner
            .lifecycle
            .begin_reconfiguration(args, options)?
            .into_launchdarkly(inner.lifecycle.id())?;

        let changes = inner.client.flag_changes();
        if previous_user.as_ref() != Some(&merged.user) {
            tracing::debug!("Re-identifying LaunchDarkly user");
            inner.client.identify(&merged.user).await?;
        }
        inner
            .lifecycle
            .commit_reconfiguration(handlers, merged.clone().into());

        inner
            .store
            .replace_remote(select_flags(&merged, inner.client.all_flags()));
        inner.lifecycle.emit_flags(inner.store.all());

        if merged.should_subscribe_to_flag_changes() {
            LaunchDarklyInner::maybe_start_forwarding(inner, &merged, changes);
        } else {
            inner.stop_forwarding();
        }

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
        if let Some(args) = inner.current_args().filter(|_| inner.lifecycle.is_configured()) {
            LaunchDarklyInner::maybe_start_forwarding(inner, &args, inner.client.flag_changes());
        }
    }

    fn unsubscribe(&self) {
        self.inner
            .lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Unsubscribed);
        self.inner.stop_forwarding();
    }

    fn update_flags(&self, flags: Flags, options: UpdateFlagsOptions) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.require_configured("update_flags")?;

        let flags = flags
            .into_iter()
            .map(|(name, value)| (normalize_flag_name(&name), value))
            .collect();
        let all = inner.store.apply_local(&flags, options);
        inner.lifecycle.emit_flags(all);
        Ok(())
    }

    fn get_flag(&self, flag_name: &str) -> Option<FlagVariation> {
        self.inner.store.get(&normalize_flag_name(flag_name))
    }

    fn get_user(&self) -> Option<User> {
        self.inner.current_args().map(|args| args.user)
    }

    fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        inner.stop_forwarding();
        inner.store.clear();
        inner.lifecycle.reset();
        inner.lifecycle.emit_flags(Flags::new());
        Ok(())
    }

    fn args(&self) -> Option<AdapterArgs> {
        self.inner.lifecycle.args()
    }
}
