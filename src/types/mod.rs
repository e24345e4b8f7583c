use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

/// Name of a flag as surfaced to application code.
pub type FlagName = String;

/// Evaluated flags keyed by their name.
pub type Flags = HashMap<FlagName, FlagVariation>;

/// Flags retained per source adapter before they are flattened.
pub type FlagsContext = HashMap<AdapterIdentifier, Flags>;

/// Identifies an adapter kind. Known kinds have constructors, custom adapters
/// may use any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterIdentifier(String);

impl AdapterIdentifier {
    pub const LAUNCHDARKLY: &'static str = "launchdarkly";
    pub const LOCALSTORAGE: &'static str = "localstorage";
    pub const MEMORY: &'static str = "memory";
    pub const SPLITIO: &'static str = "splitio";
    pub const GRAPHQL: &'static str = "graphql";
    pub const COMBINED: &'static str = "combined";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn launchdarkly() -> Self {
        Self::new(Self::LAUNCHDARKLY)
    }

    pub fn localstorage() -> Self {
        Self::new(Self::LOCALSTORAGE)
    }

    pub fn memory() -> Self {
        Self::new(Self::MEMORY)
    }

    pub fn splitio() -> Self {
        Self::new(Self::SPLITIO)
    }

    pub fn graphql() -> Self {
        Self::new(Self::GRAPHQL)
    }

    pub fn combined() -> Self {
        Self::new(Self::COMBINED)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdapterIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AdapterIdentifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for AdapterIdentifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The evaluated value of a single flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagVariation {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<serde_json::Value>),
    Record(serde_json::Map<String, serde_json::Value>),
}

impl FlagVariation {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagVariation::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagVariation::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FlagVariation::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[serde_json::Value]> {
        match self {
            FlagVariation::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            FlagVariation::Record(map) => Some(map),
            _ => None,
        }
    }

    /// Converts a JSON value, returning `None` for `null` which is not a
    /// valid variation.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(FlagVariation::Bool(b)),
            serde_json::Value::Number(n) => n.as_f64().map(FlagVariation::Number),
            serde_json::Value::String(s) => Some(FlagVariation::String(s)),
            serde_json::Value::Array(items) => Some(FlagVariation::List(items)),
            serde_json::Value::Object(map) => Some(FlagVariation::Record(map)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FlagVariation::Bool(b) => serde_json::Value::Bool(*b),
            FlagVariation::Number(n) => serde_json::json!(n),
            FlagVariation::String(s) => serde_json::Value::String(s.clone()),
            FlagVariation::List(items) => serde_json::Value::Array(items.clone()),
            FlagVariation::Record(map) => serde_json::Value::Object(map.clone()),
        }
    }
}

impl From<bool> for FlagVariation {
    fn from(value: bool) -> Self {
        FlagVariation::Bool(value)
    }
}

impl From<String> for FlagVariation {
    fn from(value: String) -> Self {
        FlagVariation::String(value)
    }
}

impl From<&str> for FlagVariation {
    fn from(value: &str) -> Self {
        FlagVariation::String(value.to_string())
    }
}

impl From<f64> for FlagVariation {
    fn from(value: f64) -> Self {
        FlagVariation::Number(value)
    }
}

impl From<i64> for FlagVariation {
    fn from(value: i64) -> Self {
        FlagVariation::Number(value as f64)
    }
}

impl From<i32> for FlagVariation {
    fn from(value: i32) -> Self {
        FlagVariation::Number(value as f64)
    }
}

/// Converts a provider flag key into the camelCase form flags are exposed
/// under, e.g. `enable-new-checkout` becomes `enableNewCheckout`.
pub fn normalize_flag_name(flag_name: &str) -> FlagName {
    let mut normalized = String::with_capacity(flag_name.len());

    let words = flag_name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty());

    for (index, word) in words.enumerate() {
        let word = if word.chars().all(|c| !c.is_lowercase()) {
            word.to_lowercase()
        } else {
            word.to_string()
        };

        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            if index == 0 {
                normalized.extend(first.to_lowercase());
            } else {
                normalized.extend(first.to_uppercase());
            }
            normalized.push_str(chars.as_str());
        }
    }

    normalized
}

/// Looks up a flag by name, falling back to `false` when it is unknown.
pub fn get_flag_variation(flags: &Flags, flag_name: &str) -> FlagVariation {
    flags
        .get(&normalize_flag_name(flag_name))
        .or_else(|| flags.get(flag_name))
        .cloned()
        .unwrap_or(FlagVariation::Bool(false))
}

/// Identity the provider evaluates flags for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl User {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.attributes.is_empty()
    }

    /// Overlays `next` onto this user: its key wins when present and its
    /// attributes replace same-named ones.
    pub fn merge(&self, next: &User) -> User {
        let mut attributes = self.attributes.clone();
        for (name, value) in &next.attributes {
            attributes.insert(name.clone(), value.clone());
        }

        User {
            key: next.key.clone().or_else(|| self.key.clone()),
            attributes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterConfigurationStatus {
    Unconfigured,
    Configuring,
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterSubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitializationStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub configuration_status: AdapterConfigurationStatus,
    pub subscription_status: AdapterSubscriptionStatus,
}

impl Default for AdapterStatus {
    fn default() -> Self {
        Self {
            configuration_status: AdapterConfigurationStatus::Unconfigured,
            subscription_status: AdapterSubscriptionStatus::Subscribed,
        }
    }
}

impl AdapterStatus {
    pub fn is_configured(&self) -> bool {
        self.configuration_status == AdapterConfigurationStatus::Configured
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription_status == AdapterSubscriptionStatus::Subscribed
    }

    /// Pointwise aggregate of several statuses: configured only when every
    /// status is configured, subscribed only when every status is subscribed.
    /// An empty set aggregates to the default status.
    pub fn aggregate(statuses: impl IntoIterator<Item = AdapterStatus>) -> AdapterStatus {
        let statuses: Vec<AdapterStatus> = statuses.into_iter().collect();
        if statuses.is_empty() {
            return AdapterStatus::default();
        }

        let configuration_status = if statuses.iter().all(|s| s.is_configured()) {
            AdapterConfigurationStatus::Configured
        } else if statuses
            .iter()
            .any(|s| s.configuration_status != AdapterConfigurationStatus::Unconfigured)
        {
            AdapterConfigurationStatus::Configuring
        } else {
            AdapterConfigurationStatus::Unconfigured
        };

        let subscription_status = if statuses.iter().all(|s| s.is_subscribed()) {
            AdapterSubscriptionStatus::Subscribed
        } else {
            AdapterSubscriptionStatus::Unsubscribed
        };

        AdapterStatus {
            configuration_status,
            subscription_status,
        }
    }
}

/// A status report carrying only the axes that changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialAdapterStatus {
    pub configuration_status: Option<AdapterConfigurationStatus>,
    pub subscription_status: Option<AdapterSubscriptionStatus>,
}

impl PartialAdapterStatus {
    pub fn apply_to(&self, status: &mut AdapterStatus) {
        if let Some(configuration_status) = self.configuration_status {
            status.configuration_status = configuration_status;
        }
        if let Some(subscription_status) = self.subscription_status {
            status.subscription_status = subscription_status;
        }
    }
}

impl From<AdapterStatus> for PartialAdapterStatus {
    fn from(status: AdapterStatus) -> Self {
        Self {
            configuration_status: Some(status.configuration_status),
            subscription_status: Some(status.subscription_status),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlagsChange {
    pub id: Option<AdapterIdentifier>,
    pub flags: Flags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterStatusChange {
    pub id: Option<AdapterIdentifier>,
    pub status: PartialAdapterStatus,
}

/// Result of a configure or reconfigure call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterConfiguration {
    pub initialization_status: Option<InitializationStatus>,
}

impl AdapterConfiguration {
    pub fn succeeded() -> Self {
        Self {
            initialization_status: Some(InitializationStatus::Succeeded),
        }
    }

    pub fn failed() -> Self {
        Self {
            initialization_status: Some(InitializationStatus::Failed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlagsOptions {
    /// Keep these values until they are updated again without a lock.
    pub lock_flags: bool,
    /// Ignore all future provider updates for these keys.
    pub unsubscribe_flags: bool,
}

impl UpdateFlagsOptions {
    pub fn locked() -> Self {
        Self {
            lock_flags: true,
            unsubscribe_flags: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconfigurationOptions {
    /// Discard previous arguments instead of merging onto them.
    pub should_overwrite: bool,
}

impl ReconfigurationOptions {
    pub fn overwrite() -> Self {
        Self {
            should_overwrite: true,
        }
    }

    pub fn merge() -> Self {
        Self {
            should_overwrite: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_flag_name() {
        assert_eq!(normalize_flag_name("enable-new-checkout"), "enableNewCheckout");
        assert_eq!(normalize_flag_name("SOME_FLAG"), "someFlag");
        assert_eq!(normalize_flag_name("alreadyCamel"), "alreadyCamel");
        assert_eq!(normalize_flag_name("__x__"), "x");
    }

    #[test]
    fn test_get_flag_variation_defaults_to_false() {
        let mut flags = Flags::new();
        flags.insert("darkMode".to_string(), FlagVariation::Bool(true));

        assert_eq!(get_flag_variation(&flags, "dark-mode"), FlagVariation::Bool(true));
        assert_eq!(get_flag_variation(&flags, "missing"), FlagVariation::Bool(false));
    }

    #[test]
    fn test_variation_deserializes_untagged() {
        let flags: Flags = serde_json::from_value(serde_json::json!({
            "a": true,
            "b": "on",
            "c": 3,
            "d": [1, 2],
            "e": {"nested": true}
        }))
        .unwrap();

        assert_eq!(flags["a"], FlagVariation::Bool(true));
        assert_eq!(flags["b"].as_str(), Some("on"));
        assert_eq!(flags["c"].as_number(), Some(3.0));
        assert_eq!(flags["d"].as_list().map(|l| l.len()), Some(2));
        assert!(flags["e"].as_record().is_some());
    }

    #[test]
    fn test_user_merge_keeps_previous_attributes() {
        let previous = User::new("user-1").attribute("a", 1);
        let next = User::anonymous().attribute("b", 2);

        let merged = previous.merge(&next);

        assert_eq!(merged.key.as_deref(), Some("user-1"));
        assert_eq!(merged.attributes["a"], serde_json::json!(1));
        assert_eq!(merged.attributes["b"], serde_json::json!(2));
    }

    #[test]
    fn test_aggregate_status() {
        let configured = AdapterStatus {
            configuration_status: AdapterConfigurationStatus::Configured,
            subscription_status: AdapterSubscriptionStatus::Subscribed,
        };
        let configuring = AdapterStatus {
            configuration_status: AdapterConfigurationStatus::Configuring,
            subscription_status: AdapterSubscriptionStatus::Unsubscribed,
        };

        let all_configured = AdapterStatus::aggregate([configured, configured]);
        assert!(all_configured.is_configured());
        assert!(all_configured.is_subscribed());

        let mixed = AdapterStatus::aggregate([configured, configuring]);
        assert_eq!(mixed.configuration_status, AdapterConfigurationStatus::Configuring);
        assert_eq!(mixed.subscription_status, AdapterSubscriptionStatus::Unsubscribed);
    }
}
