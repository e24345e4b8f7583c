//! flagbridge lab
//!
//! Verification script exercising the memory and combined adapters.
//! Run with: cargo run --bin sdk-lab

use flagbridge::{
    combine, Adapter, AdapterContext, AdapterIdentifier, AdapterRegistry, CombinedAdapterArgs,
    FlagVariation, Flags, MemoryAdapter, MemoryAdapterArgs, ReconfigurationOptions,
    UpdateFlagsOptions, User,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PASS: &str = "\x1b[32m[PASS]\x1b[0m";
const FAIL: &str = "\x1b[31m[FAIL]\x1b[0m";

fn flags(entries: &[(&str, FlagVariation)]) -> Flags {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    println!("=== flagbridge lab ===\n");

    let mut passed = 0;
    let mut failed = 0;

    macro_rules! check {
        ($test:expr, $condition:expr) => {{
            if $condition {
                println!("{} {}", PASS, $test);
                passed += 1;
            } else {
                println!("{} {}", FAIL, $test);
                failed += 1;
            }
        }};
    }

    println!("Testing configuration...");
    let remote = Arc::new(MemoryAdapter::with_id("remote"));
    let overrides = Arc::new(MemoryAdapter::with_id("overrides"));
    let combined = combine(
        vec![remote.clone() as Arc<dyn Adapter>, overrides.clone()],
        vec![AdapterIdentifier::new("overrides")],
    );
    let registry = Arc::new(AdapterRegistry::new());
    let context = AdapterContext::with_registry(Arc::new(combined), registry.clone());

    let user = User::new("lab-user");
    let configured = context
        .configure(
            CombinedAdapterArgs::new(user.clone())
                .adapter("remote", MemoryAdapterArgs::new(user.clone()))
                .adapter("overrides", MemoryAdapterArgs::new(user)),
        )
        .await;
    check!("Combined adapter configures", configured.is_ok());
    check!("Aggregate status is configured", context.status().is_configured());
    check!("Adapter is registered", registry.contains("combined"));

    println!("\nTesting flag precedence...");
    remote.push_flags(flags(&[
        ("lab-bool", FlagVariation::Bool(false)),
        ("lab-string", FlagVariation::from("Hello Lab")),
    ]));
    let _ = overrides.update_flags(
        flags(&[("lab-bool", FlagVariation::Bool(true))]),
        UpdateFlagsOptions::default(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    check!(
        "Effect adapter wins",
        context.get_flag("lab-bool") == FlagVariation::Bool(true)
    );
    check!(
        "Other flags pass through",
        context.get_flag("lab-string") == FlagVariation::from("Hello Lab")
    );
    check!(
        "Unknown flags default to false",
        context.get_flag("lab-missing") == FlagVariation::Bool(false)
    );

    println!("\nTesting locks and subscriptions...");
    let _ = remote.update_flags(
        flags(&[("lab-locked", FlagVariation::Bool(true))]),
        UpdateFlagsOptions::locked(),
    );
    remote.push_flags(flags(&[("lab-locked", FlagVariation::Bool(false))]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    check!(
        "Locked flag ignores provider push",
        context.get_flag("lab-locked") == FlagVariation::Bool(true)
    );

    context.unsubscribe();
    remote.push_flags(flags(&[("lab-string", FlagVariation::from("changed"))]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    check!(
        "Unsubscribed adapter ignores pushes",
        context.get_flag("lab-string") == FlagVariation::from("Hello Lab")
    );
    context.subscribe();

    println!("\nTesting reconfiguration...");
    let reconfigured = context
        .reconfigure(
            CombinedAdapterArgs::new(User::new("lab-user").attribute("plan", "pro")),
            ReconfigurationOptions::merge(),
        )
        .await;
    check!("Reconfigure succeeds", reconfigured.is_ok());
    check!(
        "User attributes are merged",
        remote
            .get_user()
            .and_then(|user| user.attributes.get("plan").cloned())
            == Some(serde_json::json!("pro"))
    );

    println!("\nTesting cleanup...");
    let reset = context.reset().await;
    check!("Reset succeeds", reset.is_ok());
    check!("Adapter is unregistered", !registry.contains("combined"));

    println!("\n{}", "=".repeat(40));
    println!("Results: {} passed, {} failed", passed, failed);
    println!("{}", "=".repeat(40));

    if failed > 0 {
        println!("\n\x1b[31mSome verifications failed!\x1b[0m");
        std::process::exit(1);
    }
    println!("\n\x1b[32mAll verifications passed!\x1b[0m");
}
