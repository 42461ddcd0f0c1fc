//! Applications (tenants).
//!
//! Every connection, channel and statistic belongs to exactly one app. Apps
//! are loaded once at startup and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// A credentialed tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    /// Application ID, used by the REST API and statistics.
    pub id: String,
    /// Public key, used by clients to connect.
    pub key: String,
    /// Secret used to sign and verify requests.
    pub secret: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Maximum number of concurrent connections, unlimited if unset.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Whether `client-*` events are relayed.
    #[serde(default)]
    pub enable_client_messages: bool,
    /// Whether statistics are recorded for this app.
    #[serde(default = "default_true")]
    pub enable_statistics: bool,
    /// Hosts allowed to open connections. Empty means any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl App {
    /// Create an app with default flags.
    #[must_use]
    pub fn new(id: impl Into<String>, key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            secret: secret.into(),
            name: None,
            capacity: None,
            enable_client_messages: false,
            enable_statistics: true,
            allowed_origins: Vec::new(),
        }
    }

    /// Set the connection capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Enable or disable client events.
    #[must_use]
    pub fn with_client_messages(mut self, enabled: bool) -> Self {
        self.enable_client_messages = enabled;
        self
    }

    /// Enable or disable statistics.
    #[must_use]
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.enable_statistics = enabled;
        self
    }

    /// Restrict connections to the given origin hosts.
    #[must_use]
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Check the `Origin` header of an incoming connection.
    ///
    /// With an empty allow-list every origin passes. Otherwise the host part
    /// of the header must be listed (or the list must contain `*`).
    #[must_use]
    pub fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }

        let Some(host) = origin.and_then(origin_host) else {
            return false;
        };

        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(&host))
    }
}

/// Extract the host from an `Origin` header value.
fn origin_host(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    url.host_str().map(str::to_string)
}

/// Source of application credentials.
pub trait AppProvider: Send + Sync {
    /// Find an app by its ID.
    fn find_by_id(&self, id: &str) -> Option<Arc<App>>;

    /// Find an app by its public key.
    fn find_by_key(&self, key: &str) -> Option<Arc<App>>;

    /// Every known app.
    fn all(&self) -> Vec<Arc<App>>;
}

/// Apps loaded from configuration.
#[derive(Debug, Default)]
pub struct ConfigAppProvider {
    apps: Vec<Arc<App>>,
    by_id: HashMap<String, Arc<App>>,
    by_key: HashMap<String, Arc<App>>,
}

impl ConfigAppProvider {
    /// Index the given apps.
    ///
    /// When several apps share an ID or key, the first one wins.
    #[must_use]
    pub fn new(apps: impl IntoIterator<Item = App>) -> Self {
        let mut provider = Self::default();
        for app in apps {
            let app = Arc::new(app);
            if provider.by_key.contains_key(&app.key) {
                warn!(key = %app.key, "Duplicate app key ignored");
                continue;
            }
            provider
                .by_id
                .entry(app.id.clone())
                .or_insert_with(|| Arc::clone(&app));
            provider.by_key.insert(app.key.clone(), Arc::clone(&app));
            provider.apps.push(app);
        }
        provider
    }
}

impl AppProvider for ConfigAppProvider {
    fn find_by_id(&self, id: &str) -> Option<Arc<App>> {
        self.by_id.get(id).cloned()
    }

    fn find_by_key(&self, key: &str) -> Option<Arc<App>> {
        self.by_key.get(key).cloned()
    }

    fn all(&self) -> Vec<Arc<App>> {
        self.apps.clone()
    }
}
