use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::CacheIdentifier;
use crate::error::{ErrorCode, FlagBridgeError, Result};
use crate::types::{AdapterIdentifier, Flags, ReconfigurationOptions, User};

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FLAGS_CACHE_NAME: &str = "flags";

/// Turns the `data` of a GraphQL response into flags.
pub type FlagsParser = Arc<dyn Fn(&serde_json::Value) -> Result<Flags> + Send + Sync>;

fn validate_polling_interval(interval: Option<Duration>) -> Result<()> {
    if interval.is_some_and(|i| i.is_zero()) {
        return Err(FlagBridgeError::config_error(
            ErrorCode::ConfigInvalidPollingInterval,
            "Polling interval must be positive",
        ));
    }
    Ok(())
}

fn non_empty_or(next: String, previous: &str) -> String {
    if next.is_empty() {
        previous.to_string()
    } else {
        next
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAdapterArgs {
    pub user: User,
}

impl MemoryAdapterArgs {
    pub fn new(user: User) -> Self {
        Self { user }
    }

    pub fn merge(&self, next: Self) -> Self {
        Self {
            user: self.user.merge(&next.user),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalStorageAdapterArgs {
    pub user: User,
    pub polling_interval: Option<Duration>,
}

impl LocalStorageAdapterArgs {
    pub fn new(user: User) -> Self {
        Self {
            user,
            polling_interval: None,
        }
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn effective_polling_interval(&self) -> Duration {
        self.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL)
    }

    pub fn validate(&self) -> Result<()> {
        validate_polling_interval(self.polling_interval)
    }

    pub fn merge(&self, next: Self) -> Self {
        Self {
            user: self.user.merge(&next.user),
            polling_interval: next.polling_interval.or(self.polling_interval),
        }
    }
}

#[derive(Clone, Default)]
pub struct GraphQlAdapterArgs {
    pub user: User,
    pub uri: String,
    pub query: String,
    pub polling_interval: Option<Duration>,
    /// Variables sent with the query. Defaults to `{"userId": <user key>}`.
    pub query_variables: Option<serde_json::Value>,
    pub request_headers: HashMap<String, String>,
    pub parse_flags: Option<FlagsParser>,
    pub cache_identifier: Option<CacheIdentifier>,
    pub throw_on_initialization_failure: Option<bool>,
}

impl fmt::Debug for GraphQlAdapterArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphQlAdapterArgs")
            .field("user", &self.user)
            .field("uri", &self.uri)
            .field("query", &self.query)
            .field("polling_interval", &self.polling_interval)
            .field("query_variables", &self.query_variables)
            .field("request_headers", &self.request_headers.keys().collect::<Vec<_>>())
            .field("parse_flags", &self.parse_flags.as_ref().map(|_| "<fn>"))
            .field("cache_identifier", &self.cache_identifier)
            .field(
                "throw_on_initialization_failure",
                &self.throw_on_initialization_failure,
            )
            .finish()
    }
}

impl GraphQlAdapterArgs {
    pub fn new(user: User, uri: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user,
            uri: uri.into(),
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn query_variables(mut self, variables: serde_json::Value) -> Self {
        self.query_variables = Some(variables);
        self
    }

    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    pub fn parse_flags(
        mut self,
        parser: impl Fn(&serde_json::Value) -> Result<Flags> + Send + Sync + 'static,
    ) -> Self {
        self.parse_flags = Some(Arc::new(parser));
        self
    }

    pub fn cache_identifier(mut self, identifier: CacheIdentifier) -> Self {
        self.cache_identifier = Some(identifier);
        self
    }

    pub fn throw_on_initialization_failure(mut self, throw: bool) -> Self {
        self.throw_on_initialization_failure = Some(throw);
        self
    }

    pub fn effective_polling_interval(&self) -> Duration {
        self.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL)
    }

    pub fn effective_query_variables(&self) -> serde_json::Value {
        self.query_variables
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "userId": self.user.key }))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.uri.starts_with("http://") || self.uri.starts_with("https://")) {
            return Err(FlagBridgeError::config_error(
                ErrorCode::ConfigInvalidUrl,
                format!("GraphQL uri must be an http(s) URL, got '{}'", self.uri),
            ));
        }

        if self.query.trim().is_empty() {
            return Err(FlagBridgeError::config_error(
                ErrorCode::ConfigMissingRequired,
                "GraphQL query is required",
            ));
        }

        validate_polling_interval(self.polling_interval)
    }

    pub fn merge(&self, next: Self) -> Self {
        let mut request_headers = self.request_headers.clone();
        request_headers.extend(next.request_headers);

        Self {
            user: self.user.merge(&next.user),
            uri: non_empty_or(next.uri, &self.uri),
            query: non_empty_or(next.query, &self.query),
            polling_interval: next.polling_interval.or(self.polling_interval),
            query_variables: next.query_variables.or_else(|| self.query_variables.clone()),
            request_headers,
            parse_flags: next.parse_flags.or_else(|| self.parse_flags.clone()),
            cache_identifier: next.cache_identifier.or(self.cache_identifier),
            throw_on_initialization_failure: next
                .throw_on_initialization_failure
                .or(self.throw_on_initialization_failure),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchDarklyAdapterArgs {
    pub user: User,
    pub client_side_id: String,
    /// Flags to surface together with their defaults. When empty every flag
    /// the provider knows about is surfaced.
    pub flags: Flags,
    pub subscribe_to_flag_changes: Option<bool>,
    pub throw_on_initialization_failure: Option<bool>,
    /// Delay applied before streamed changes are forwarded.
    pub flags_update_delay: Option<Duration>,
}

impl LaunchDarklyAdapterArgs {
    pub fn new(user: User, client_side_id: impl Into<String>) -> Self {
        Self {
            user,
            client_side_id: client_side_id.into(),
            ..Default::default()
        }
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn subscribe_to_flag_changes(mut self, subscribe: bool) -> Self {
        self.subscribe_to_flag_changes = Some(subscribe);
        self
    }

    pub fn throw_on_initialization_failure(mut self, throw: bool) -> Self {
        self.throw_on_initialization_failure = Some(throw);
        self
    }

    pub fn flags_update_delay(mut self, delay: Duration) -> Self {
        self.flags_update_delay = Some(delay);
        self
    }

    pub fn should_subscribe_to_flag_changes(&self) -> bool {
        self.subscribe_to_flag_changes.unwrap_or(true)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_side_id.is_empty() {
            return Err(FlagBridgeError::config_error(
                ErrorCode::ConfigMissingRequired,
                "LaunchDarkly client side id is required",
            ));
        }
        Ok(())
    }

    pub fn merge(&self, next: Self) -> Self {
        Self {
            user: self.user.merge(&next.user),
            client_side_id: non_empty_or(next.client_side_id, &self.client_side_id),
            flags: if next.flags.is_empty() {
                self.flags.clone()
            } else {
                next.flags
            },
            subscribe_to_flag_changes: next
                .subscribe_to_flag_changes
                .or(self.subscribe_to_flag_changes),
            throw_on_initialization_failure: next
                .throw_on_initialization_failure
                .or(self.throw_on_initialization_failure),
            flags_update_delay: next.flags_update_delay.or(self.flags_update_delay),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SplitioAdapterArgs {
    pub user: User,
    pub authorization_key: String,
    pub treatment_attributes: serde_json::Map<String, serde_json::Value>,
    pub throw_on_initialization_failure: Option<bool>,
}

impl SplitioAdapterArgs {
    pub fn new(user: User, authorization_key: impl Into<String>) -> Self {
        Self {
            user,
            authorization_key: authorization_key.into(),
            ..Default::default()
        }
    }

    pub fn treatment_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.treatment_attributes.insert(name.into(), value.into());
        self
    }

    pub fn throw_on_initialization_failure(mut self, throw: bool) -> Self {
        self.throw_on_initialization_failure = Some(throw);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.authorization_key.is_empty() {
            return Err(FlagBridgeError::config_error(
                ErrorCode::ConfigMissingRequired,
                "Split authorization key is required",
            ));
        }
        Ok(())
    }

    pub fn merge(&self, next: Self) -> Self {
        let mut treatment_attributes = self.treatment_attributes.clone();
        treatment_attributes.extend(next.treatment_attributes);

        Self {
            user: self.user.merge(&next.user),
            authorization_key: non_empty_or(next.authorization_key, &self.authorization_key),
            treatment_attributes,
            throw_on_initialization_failure: next
                .throw_on_initialization_failure
                .or(self.throw_on_initialization_failure),
        }
    }
}

/// Arguments of a combined adapter: a shared user plus the arguments of each
/// constituent keyed by its identifier.
#[derive(Debug, Clone, Default)]
pub struct CombinedAdapterArgs {
    pub user: User,
    pub adapters: HashMap<AdapterIdentifier, AdapterArgs>,
}

impl CombinedAdapterArgs {
    pub fn new(user: User) -> Self {
        Self {
            user,
            adapters: HashMap::new(),
        }
    }

    pub fn adapter(mut self, id: impl Into<AdapterIdentifier>, args: impl Into<AdapterArgs>) -> Self {
        self.adapters.insert(id.into(), args.into());
        self
    }

    /// Arguments for one constituent, carrying the shared user when one is set.
    pub fn args_for(&self, id: &AdapterIdentifier) -> Option<AdapterArgs> {
        let args = self.adapters.get(id)?.clone();
        if self.user.is_empty() {
            Some(args)
        } else {
            let user = args.user().merge(&self.user);
            Some(args.with_user(user))
        }
    }

    pub fn merge(&self, next: Self) -> Self {
        let mut adapters = self.adapters.clone();
        for (id, args) in next.adapters {
            let merged = match adapters.get(&id) {
                Some(previous) => merge_args(&id, Some(previous), args, ReconfigurationOptions::merge())
                    .unwrap_or_else(|e| {
                        tracing::warn!("Replacing arguments of '{}': {}", id, e);
                        e.into_replacement()
                    }),
                None => args,
            };
            adapters.insert(id, merged);
        }

        Self {
            user: self.user.merge(&next.user),
            adapters,
        }
    }
}

/// Provider specific arguments of any known adapter.
#[derive(Debug, Clone)]
pub enum AdapterArgs {
    Memory(MemoryAdapterArgs),
    LocalStorage(LocalStorageAdapterArgs),
    GraphQl(GraphQlAdapterArgs),
    LaunchDarkly(LaunchDarklyAdapterArgs),
    Splitio(SplitioAdapterArgs),
    Combined(CombinedAdapterArgs),
}

macro_rules! adapter_args_variant {
    ($variant:ident, $args:ty, $into:ident) => {
        impl From<$args> for AdapterArgs {
            fn from(args: $args) -> Self {
                AdapterArgs::$variant(args)
            }
        }

        impl AdapterArgs {
            pub fn $into(self, id: &AdapterIdentifier) -> Result<$args> {
                match self {
                    AdapterArgs::$variant(args) => Ok(args),
                    other => Err(FlagBridgeError::invalid_args(id, other.kind())),
                }
            }
        }
    };
}

adapter_args_variant!(Memory, MemoryAdapterArgs, into_memory);
adapter_args_variant!(LocalStorage, LocalStorageAdapterArgs, into_local_storage);
adapter_args_variant!(GraphQl, GraphQlAdapterArgs, into_graphql);
adapter_args_variant!(LaunchDarkly, LaunchDarklyAdapterArgs, into_launchdarkly);
adapter_args_variant!(Splitio, SplitioAdapterArgs, into_splitio);
adapter_args_variant!(Combined, CombinedAdapterArgs, into_combined);

impl AdapterArgs {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterArgs::Memory(_) => AdapterIdentifier::MEMORY,
            AdapterArgs::LocalStorage(_) => AdapterIdentifier::LOCALSTORAGE,
            AdapterArgs::GraphQl(_) => AdapterIdentifier::GRAPHQL,
            AdapterArgs::LaunchDarkly(_) => AdapterIdentifier::LAUNCHDARKLY,
            AdapterArgs::Splitio(_) => AdapterIdentifier::SPLITIO,
            AdapterArgs::Combined(_) => AdapterIdentifier::COMBINED,
        }
    }

    pub fn user(&self) -> &User {
        match self {
            AdapterArgs::Memory(args) => &args.user,
            AdapterArgs::LocalStorage(args) => &args.user,
            AdapterArgs::GraphQl(args) => &args.user,
            AdapterArgs::LaunchDarkly(args) => &args.user,
            AdapterArgs::Splitio(args) => &args.user,
            AdapterArgs::Combined(args) => &args.user,
        }
    }

    pub fn with_user(mut self, user: User) -> Self {
        match &mut self {
            AdapterArgs::Memory(args) => args.user = user,
            AdapterArgs::LocalStorage(args) => args.user = user,
            AdapterArgs::GraphQl(args) => args.user = user,
            AdapterArgs::LaunchDarkly(args) => args.user = user,
            AdapterArgs::Splitio(args) => args.user = user,
            AdapterArgs::Combined(args) => args.user = user,
        }
        self
    }
}

/// Computes the arguments a reconfiguration applies.
///
/// With `should_overwrite` the previous arguments are discarded, otherwise
/// `next` is merged onto them. Both inputs are left untouched.
pub fn merge_args(
    id: &AdapterIdentifier,
    previous: Option<&AdapterArgs>,
    next: AdapterArgs,
    options: ReconfigurationOptions,
) -> std::result::Result<AdapterArgs, ArgsMergeError> {
    let previous = match previous {
        Some(previous) if !options.should_overwrite => previous,
        _ => return Ok(next),
    };

    let merged = match (previous, next) {
        (AdapterArgs::Memory(p), AdapterArgs::Memory(n)) => AdapterArgs::Memory(p.merge(n)),
        (AdapterArgs::LocalStorage(p), AdapterArgs::LocalStorage(n)) => {
            AdapterArgs::LocalStorage(p.merge(n))
        }
        (AdapterArgs::GraphQl(p), AdapterArgs::GraphQl(n)) => AdapterArgs::GraphQl(p.merge(n)),
        (AdapterArgs::LaunchDarkly(p), AdapterArgs::LaunchDarkly(n)) => {
            AdapterArgs::LaunchDarkly(p.merge(n))
        }
        (AdapterArgs::Splitio(p), AdapterArgs::Splitio(n)) => AdapterArgs::Splitio(p.merge(n)),
        (AdapterArgs::Combined(p), AdapterArgs::Combined(n)) => AdapterArgs::Combined(p.merge(n)),
        (previous, next) => {
            return Err(ArgsMergeError {
                error: FlagBridgeError::invalid_args(id, next.kind()),
                previous_kind: previous.kind(),
                next,
            })
        }
    };

    Ok(merged)
}

/// Arguments of a different kind than the previous ones cannot be merged.
#[derive(Debug)]
pub struct ArgsMergeError {
    pub error: FlagBridgeError,
    pub previous_kind: &'static str,
    next: AdapterArgs,
}

impl ArgsMergeError {
    /// The rejected arguments, for callers that fall back to replacing.
    pub fn into_replacement(self) -> AdapterArgs {
        self.next
    }
}

impl fmt::Display for ArgsMergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (previously {})", self.error, self.previous_kind)
    }
}

impl From<ArgsMergeError> for FlagBridgeError {
    fn from(error: ArgsMergeError) -> Self {
        error.error
    }
}
