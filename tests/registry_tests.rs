use flagbridge::{
    combine, Adapter, AdapterContext, AdapterIdentifier, AdapterRegistry, CombinedAdapterArgs,
    ErrorCode, FlagVariation, Flags, MemoryAdapter, MemoryAdapterArgs, UpdateFlagsOptions, User,
};
use std::sync::Arc;
use std::time::Duration;

fn flags(name: &str, value: impl Into<FlagVariation>) -> Flags {
    Flags::from([(name.to_string(), value.into())])
}

#[test]
fn test_register_requires_configured_adapter() {
    let registry = AdapterRegistry::new();

    let error = registry
        .register(Arc::new(MemoryAdapter::new()))
        .unwrap_err();

    assert_eq!(error.code, ErrorCode::AdapterNotConfigured);
    assert!(registry.is_empty());
}

#[test]
fn test_update_unknown_adapter_is_reported() {
    let registry = AdapterRegistry::new();

    let error = registry
        .update_flags("memory", flags("a", true), UpdateFlagsOptions::default())
        .unwrap_err();

    assert_eq!(error.code, ErrorCode::AdapterNotRegistered);
}

#[tokio::test]
async fn test_context_registers_and_routes_updates() {
    let registry = Arc::new(AdapterRegistry::new());
    let adapter = Arc::new(MemoryAdapter::new());
    let context = AdapterContext::with_registry(adapter.clone(), registry.clone());

    context.configure(MemoryAdapterArgs::new(User::new("u1"))).await.unwrap();
    assert_eq!(registry.ids(), vec![AdapterIdentifier::memory()]);

    let mut watched = context.watch_flags();
    registry
        .update_flags("memory", flags("viaRegistry", "yes"), UpdateFlagsOptions::default())
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), watched.changed())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(context.get_flag("viaRegistry"), FlagVariation::from("yes"));
    assert_eq!(
        registry.get("memory").unwrap().get_flag("viaRegistry"),
        Some(FlagVariation::from("yes"))
    );
}

#[tokio::test]
async fn test_combined_adapter_is_registered_under_combined_id() {
    let registry = Arc::new(AdapterRegistry::new());
    let combined = combine(
        vec![Arc::new(MemoryAdapter::new()) as Arc<dyn Adapter>],
        vec![],
    );
    let context = AdapterContext::with_registry(Arc::new(combined), registry.clone());

    let user = User::new("u1");
    context
        .configure(
            CombinedAdapterArgs::new(user.clone())
                .adapter(AdapterIdentifier::memory(), MemoryAdapterArgs::new(user)),
        )
        .await
        .unwrap();

    assert!(registry.contains("combined"));
    assert_eq!(registry.len(), 1);

    context.reset().await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_context_reflects_status_of_reset_adapter() {
    let registry = Arc::new(AdapterRegistry::new());
    let adapter = Arc::new(MemoryAdapter::new());
    let context = AdapterContext::with_registry(adapter.clone(), registry.clone());
    context.configure(MemoryAdapterArgs::default()).await.unwrap();
    let mut status = context.watch_status();

    adapter.reset().unwrap();

    tokio::time::timeout(Duration::from_secs(1), status.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(!context.status().is_configured());
    assert!(!registry.contains("memory"));
}
