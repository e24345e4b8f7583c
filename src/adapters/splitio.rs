use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::{
    Adapter, AdapterArgs, AdapterEventHandlers, AdapterLifecycle, FlagStore, SplitioAdapterArgs,
};
use crate::error::Result;
use crate::types::{
    normalize_flag_name, AdapterConfiguration, AdapterConfigurationStatus, AdapterIdentifier,
    AdapterStatus, AdapterSubscriptionStatus, FlagVariation, Flags, ReconfigurationOptions,
    UpdateFlagsOptions, User,
};

pub type Treatments = HashMap<String, String>;

/// The Split client SDK as seen by the adapter.
#[async_trait]
pub trait SplitClient: Send + Sync {
    /// Resolves once the client has loaded its split definitions for `user`.
    async fn ready(&self, authorization_key: &str, user: &User) -> Result<()>;

    /// Treatment of every split for `user`.
    async fn treatments(
        &self,
        user: &User,
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Treatments>;

    /// Fires whenever split definitions changed.
    fn updates(&self) -> broadcast::Receiver<()>;
}

fn treatment_to_variation(treatment: String) -> FlagVariation {
    match treatment.as_str() {
        "on" => FlagVariation::Bool(true),
        "off" => FlagVariation::Bool(false),
        _ => FlagVariation::String(treatment),
    }
}

pub fn treatments_to_flags(treatments: Treatments) -> Flags {
    treatments
        .into_iter()
        .map(|(name, treatment)| (normalize_flag_name(&name), treatment_to_variation(treatment)))
        .collect()
}

struct SplitioInner {
    lifecycle: AdapterLifecycle,
    store: FlagStore,
    client: Arc<dyn SplitClient>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SplitioInner {
    fn current_args(&self) -> Option<SplitioAdapterArgs> {
        match self.lifecycle.args() {
            Some(AdapterArgs::Splitio(args)) => Some(args),
            _ => None,
        }
    }

    async fn fetch_flags(&self, args: &SplitioAdapterArgs) -> Result<Flags> {
        let treatments = self
            .client
            .treatments(&args.user, &args.treatment_attributes)
            .await?;
        Ok(treatments_to_flags(treatments))
    }

    async fn refresh(&self) {
        let generation = self.lifecycle.generation();
        let Some(args) = self.current_args() else {
            return;
        };
        match self.fetch_flags(&args).await {
            Ok(flags) => {
                let _guard = self.lifecycle.lock_for_refresh().await;
                if self.lifecycle.generation() != generation {
                    tracing::debug!("Dropping Split treatments fetched for outdated arguments");
                    return;
                }
                if self.store.replace_remote(flags) {
                    self.lifecycle.emit_live_flags(self.store.all());
                }
            }
            Err(e) => tracing::warn!("Failed to refresh Split treatments: {}", e),
        }
    }

    fn start_listening(inner: &Arc<Self>) {
        let mut listener = inner.listener.lock();
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let mut updates = inner.client.updates();
        let weak: Weak<Self> = Arc::downgrade(inner);
        *listener = Some(tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                match weak.upgrade() {
                    Some(inner) => inner.refresh().await,
                    None => break,
                }
            }
        }));
    }

    fn stop_listening(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

pub struct SplitioAdapter {
    inner: Arc<SplitioInner>,
}

impl SplitioAdapter {
    pub fn new(client: Arc<dyn SplitClient>) -> Self {
        Self {
            inner: Arc::new(SplitioInner {
                lifecycle: AdapterLifecycle::new(AdapterIdentifier::splitio()),
                store: FlagStore::new(),
                client,
                listener: Mutex::new(None),
            }),
        }
    }
}

impl Drop for SplitioAdapter {
    fn drop(&mut self) {
        self.inner.stop_listening();
    }
}

#[async_trait]
impl Adapter for SplitioAdapter {
    fn id(&self) -> AdapterIdentifier {
        self.inner.lifecycle.id().clone()
    }

    async fn configure(
        &self,
        args: AdapterArgs,
        handlers: AdapterEventHandlers,
    ) -> Result<AdapterConfiguration> {
        let inner = &self.inner;
        let args = args.into_splitio(inner.lifecycle.id())?;
        args.validate()?;

        let _guard = inner.lifecycle.lock_configuration().await;
        inner.lifecycle.begin_configuration(handlers, args.clone().into())?;

        let ready = inner.client.ready(&args.authorization_key, &args.user).await;
        let flags = match ready {
            Ok(()) => inner.fetch_flags(&args).await,
            Err(e) => Err(e),
        };

        match flags {
            Ok(flags) => {
                inner.store.replace_remote(flags);
                inner.lifecycle.emit_flags(inner.store.all());
                inner
                    .lifecycle
                    .set_configuration_status(AdapterConfigurationStatus::Configured);
                if inner.lifecycle.is_subscribed() {
                    SplitioInner::start_listening(inner);
                }
                Ok(AdapterConfiguration::succeeded())
            }
            Err(e) => {
                let throw = args.throw_on_initialization_failure.unwrap_or(false);
                let configuration = inner.lifecycle.initialization_failure(throw, e)?;
                inner.lifecycle.emit_flags(inner.store.all());
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
            .into_splitio(inner.lifecycle.id())?;

        let flags = inner.fetch_flags(&merged).await?;
        inner.lifecycle.commit_reconfiguration(handlers, merged.into());
        inner.store.replace_remote(flags);
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
        let inner = &self.inner;
        inner
            .lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Subscribed);
        if inner.lifecycle.is_configured() {
            SplitioInner::start_listening(inner);
        }
    }

    fn unsubscribe(&self) {
        self.inner
            .lifecycle
            .set_subscription_status(AdapterSubscriptionStatus::Unsubscribed);
        self.inner.stop_listening();
    }

    fn update_flags(&self, flags: Flags, options: UpdateFlagsOptions) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.require_configured("update_flags")?;

        let flags: Flags = flags
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
        inner.stop_listening();
        inner.store.clear();
        inner.lifecycle.reset();
        inner.lifecycle.emit_flags(Flags::new());
        Ok(())
    }

    fn args(&self) -> Option<AdapterArgs> {
        self.inner.lifecycle.args()
    }
}
