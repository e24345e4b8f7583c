use async_trait::async_trait;
use flagbridge::{
    combine, Adapter, AdapterConfigurationStatus, AdapterEvent, AdapterEventHandlers,
    AdapterIdentifier, CombinedAdapter, CombinedAdapterArgs, ErrorCode, FlagBridgeError,
    FlagVariation, Flags, FlagsFetcher, FlagsRequest, GraphQlAdapter, GraphQlAdapterArgs,
    MemoryAdapter, MemoryAdapterArgs, ReconfigurationOptions, UpdateFlagsOptions, User,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn flags(entries: &[(&str, FlagVariation)]) -> Flags {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn drain(events: &mut UnboundedReceiver<AdapterEvent>) -> Vec<AdapterEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

struct DelayedFetcher {
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl FlagsFetcher for DelayedFetcher {
    async fn fetch(&self, _request: &FlagsRequest) -> flagbridge::Result<serde_json::Value> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            Err(FlagBridgeError::network_error(
                ErrorCode::NetworkError,
                "connection refused",
            ))
        } else {
            Ok(serde_json::json!({"remoteFlag": true}))
        }
    }
}

fn graphql_args(user: User) -> GraphQlAdapterArgs {
    GraphQlAdapterArgs::new(user, "https://flags.example.com/graphql", "{ flags }")
}

struct Fixture {
    remote: Arc<MemoryAdapter>,
    overrides: Arc<MemoryAdapter>,
    combined: CombinedAdapter,
    events: UnboundedReceiver<AdapterEvent>,
}

async fn configured_fixture() -> Fixture {
    let remote = Arc::new(MemoryAdapter::with_id("remote"));
    let overrides = Arc::new(MemoryAdapter::with_id("overrides"));
    let combined = combine(
        vec![remote.clone() as Arc<dyn Adapter>, overrides.clone()],
        vec![AdapterIdentifier::new("overrides")],
    );

    let user = User::new("u1");
    let (handlers, events) = AdapterEventHandlers::channel();
    combined
        .configure(
            CombinedAdapterArgs::new(user.clone())
                .adapter("remote", MemoryAdapterArgs::new(user.clone()))
                .adapter("overrides", MemoryAdapterArgs::new(user))
                .into(),
            handlers,
        )
        .await
        .unwrap();

    Fixture {
        remote,
        overrides,
        combined,
        events,
    }
}

#[tokio::test]
async fn test_configure_reports_aggregate_configured() {
    let mut fixture = configured_fixture().await;

    assert!(fixture.combined.status().is_configured());
    assert!(fixture.remote.status().is_configured());
    assert!(fixture.overrides.status().is_configured());

    let events = drain(&mut fixture.events);
    assert!(events.iter().any(|event| matches!(
        event,
        AdapterEvent::StatusStateChange(change)
            if change.status.configuration_status == Some(AdapterConfigurationStatus::Configured)
    )));
    assert!(events.iter().all(|event| match event {
        AdapterEvent::FlagsStateChange(change) => change.id == Some(AdapterIdentifier::combined()),
        AdapterEvent::StatusStateChange(change) => change.id == Some(AdapterIdentifier::combined()),
    }));
}

#[tokio::test]
async fn test_reset_of_one_constituent_leaves_aggregate_configuring() {
    let fixture = configured_fixture().await;
    let mut status = fixture.combined.watch_status();
    let _ = status.borrow_and_update();

    fixture.remote.reset().unwrap();

    tokio::time::timeout(Duration::from_secs(1), status.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        status.borrow().configuration_status,
        AdapterConfigurationStatus::Configuring
    );
    assert_eq!(
        fixture.combined.status().configuration_status,
        AdapterConfigurationStatus::Configuring
    );
}

mod effect_precedence {
    use super::*;

    #[tokio::test]
    async fn test_effect_emitted_last_wins() {
        let fixture = configured_fixture().await;

        fixture
            .remote
            .update_flags(flags(&[("flagX", FlagVariation::Bool(false))]), UpdateFlagsOptions::default())
            .unwrap();
        fixture
            .overrides
            .update_flags(flags(&[("flagX", FlagVariation::Bool(true))]), UpdateFlagsOptions::default())
            .unwrap();
        settle().await;

        assert_eq!(fixture.combined.get_flag("flagX"), Some(FlagVariation::Bool(true)));
    }

    #[tokio::test]
    async fn test_effect_emitted_first_wins() {
        let fixture = configured_fixture().await;

        fixture
            .overrides
            .update_flags(flags(&[("flagX", FlagVariation::Bool(true))]), UpdateFlagsOptions::default())
            .unwrap();
        settle().await;
        fixture
            .remote
            .update_flags(flags(&[("flagX", FlagVariation::Bool(false))]), UpdateFlagsOptions::default())
            .unwrap();
        settle().await;

        assert_eq!(fixture.combined.get_flag("flagX"), Some(FlagVariation::Bool(true)));
    }

    #[tokio::test]
    async fn test_non_colliding_flags_pass_through() {
        let fixture = configured_fixture().await;

        fixture
            .remote
            .update_flags(flags(&[("onlyRemote", FlagVariation::from("v1"))]), UpdateFlagsOptions::default())
            .unwrap();
        settle().await;

        assert_eq!(
            fixture.combined.get_flag("onlyRemote"),
            Some(FlagVariation::from("v1"))
        );
        let context = fixture.combined.flags_context();
        assert!(context[&AdapterIdentifier::new("remote")].contains_key("onlyRemote"));
        assert!(!context[&AdapterIdentifier::new("overrides")].contains_key("onlyRemote"));
    }
}

#[tokio::test]
async fn test_identical_reemission_changes_nothing() {
    let mut fixture = configured_fixture().await;
    let update = flags(&[("flagA", FlagVariation::Bool(true))]);

    fixture
        .remote
        .update_flags(update.clone(), UpdateFlagsOptions::default())
        .unwrap();
    settle().await;
    let before = fixture.combined.get_flag("flagA");
    drain(&mut fixture.events);

    fixture
        .remote
        .update_flags(update, UpdateFlagsOptions::default())
        .unwrap();
    settle().await;

    assert_eq!(fixture.combined.get_flag("flagA"), before);
    let events = drain(&mut fixture.events);
    assert!(events
        .iter()
        .all(|event| matches!(event, AdapterEvent::FlagsStateChange(_))));
}

#[tokio::test]
async fn test_constituent_failure_is_attributed() {
    let memory = Arc::new(MemoryAdapter::new());
    let graphql = Arc::new(GraphQlAdapter::with_fetcher(Arc::new(DelayedFetcher {
        delay: Duration::ZERO,
        fail: true,
    })));
    let combined = combine(vec![memory.clone() as Arc<dyn Adapter>, graphql.clone()], vec![]);

    let user = User::new("u1");
    let (handlers, _events) = AdapterEventHandlers::channel();
    let error = combined
        .configure(
            CombinedAdapterArgs::new(user.clone())
                .adapter(AdapterIdentifier::memory(), MemoryAdapterArgs::new(user.clone()))
                .adapter(
                    AdapterIdentifier::graphql(),
                    graphql_args(user).throw_on_initialization_failure(true),
                )
                .into(),
            handlers,
        )
        .await
        .unwrap_err();

    assert_eq!(error.code, ErrorCode::CombinedPartialFailure);
    assert_eq!(error.adapter_ids, vec![AdapterIdentifier::graphql()]);
    assert!(memory.status().is_configured());
    assert!(!graphql.status().is_configured());
    assert!(!combined.status().is_configured());
}

#[tokio::test]
async fn test_missing_constituent_args_are_reported() {
    let combined = combine(
        vec![Arc::new(MemoryAdapter::with_id("first")) as Arc<dyn Adapter>],
        vec![],
    );
    let (handlers, _events) = AdapterEventHandlers::channel();

    let error = combined
        .configure(CombinedAdapterArgs::new(User::new("u1")).into(), handlers)
        .await
        .unwrap_err();

    assert_eq!(error.code, ErrorCode::CombinedPartialFailure);
    assert_eq!(error.adapter_ids, vec![AdapterIdentifier::new("first")]);
}

#[tokio::test]
async fn test_slow_constituent_does_not_block_fast_one() {
    let memory = Arc::new(MemoryAdapter::new());
    let graphql = Arc::new(GraphQlAdapter::with_fetcher(Arc::new(DelayedFetcher {
        delay: Duration::from_millis(200),
        fail: false,
    })));
    let combined = Arc::new(combine(
        vec![memory.clone() as Arc<dyn Adapter>, graphql.clone()],
        vec![],
    ));

    let user = User::new("u1");
    let (handlers, mut events) = AdapterEventHandlers::channel();
    let args = CombinedAdapterArgs::new(user.clone())
        .adapter(AdapterIdentifier::memory(), MemoryAdapterArgs::new(user.clone()))
        .adapter(AdapterIdentifier::graphql(), graphql_args(user));
    let configuring = {
        let combined = Arc::clone(&combined);
        tokio::spawn(async move { combined.configure(args.into(), handlers).await })
    };

    tokio::time::timeout(Duration::from_millis(150), async {
        while let Some(event) = events.recv().await {
            if matches!(event, AdapterEvent::FlagsStateChange(_)) {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert!(memory.status().is_configured());
    assert_eq!(
        graphql.status().configuration_status,
        AdapterConfigurationStatus::Configuring
    );
    assert_eq!(
        combined.status().configuration_status,
        AdapterConfigurationStatus::Configuring
    );

    configuring.await.unwrap().unwrap();
    assert!(combined.status().is_configured());
    assert_eq!(combined.get_flag("remoteFlag"), Some(FlagVariation::Bool(true)));
}

#[tokio::test]
async fn test_reconfigure_shares_user_with_every_constituent() {
    let fixture = configured_fixture().await;
    let (handlers, _events) = AdapterEventHandlers::channel();

    fixture
        .combined
        .reconfigure(
            CombinedAdapterArgs::new(User::anonymous().attribute("plan", "pro")).into(),
            ReconfigurationOptions::merge(),
            handlers,
        )
        .await
        .unwrap();

    for adapter in [&fixture.remote, &fixture.overrides] {
        let user = adapter.get_user().unwrap();
        assert_eq!(user.key.as_deref(), Some("u1"));
        assert_eq!(user.attributes.get("plan"), Some(&serde_json::json!("pro")));
    }
    let combined_user = fixture.combined.get_user().unwrap();
    assert_eq!(combined_user.attributes.get("plan"), Some(&serde_json::json!("pro")));
}

#[tokio::test]
async fn test_unsubscribe_reaches_every_constituent() {
    let fixture = configured_fixture().await;

    fixture.combined.unsubscribe();
    fixture
        .remote
        .push_flags(flags(&[("pushed", FlagVariation::Bool(true))]));
    settle().await;

    assert!(!fixture.remote.status().is_subscribed());
    assert!(!fixture.overrides.status().is_subscribed());
    assert!(!fixture.combined.status().is_subscribed());
    assert_eq!(fixture.combined.get_flag("pushed"), None);
}
