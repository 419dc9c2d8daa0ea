//! Client configuration and per-request options.

use std::time::Duration;

use crate::{ErrorCode, NimbusError};

/// Endpoint used when no server URL is configured.
pub const DEFAULT_SERVER_URL: &str = "https://api.parse.com/1";

/// Identifiers and endpoint for one backend application.
///
/// Built once and handed to [`crate::Client::new`]; every operation reads it
/// from the client that captured it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    application_id: String,
    client_key: Option<String>,
    master_key: Option<String>,
    server_url: String,
    timeout: Option<Duration>,
}

impl ClientConfig {
    /// Start a configuration for the given application id.
    pub fn builder(application_id: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: ClientConfig {
                application_id: application_id.into(),
                client_key: None,
                master_key: None,
                server_url: DEFAULT_SERVER_URL.to_string(),
                timeout: None,
            },
        }
    }

    /// Read the configuration from `NIMBUS_*` environment variables.
    ///
    /// `NIMBUS_APP_ID` is required; `NIMBUS_CLIENT_KEY`, `NIMBUS_MASTER_KEY`
    /// and `NIMBUS_SERVER_URL` are optional.
    pub fn from_env() -> Result<Self, NimbusError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, NimbusError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let application_id = non_empty("NIMBUS_APP_ID").ok_or_else(|| {
            NimbusError::invalid(ErrorCode::NotInitialized, "NIMBUS_APP_ID is not set")
        })?;

        let mut builder = Self::builder(application_id);
        if let Some(key) = non_empty("NIMBUS_CLIENT_KEY") {
            builder = builder.client_key(key);
        }
        if let Some(key) = non_empty("NIMBUS_MASTER_KEY") {
            builder = builder.master_key(key);
        }
        if let Some(url) = non_empty("NIMBUS_SERVER_URL") {
            builder = builder.server_url(url);
        }
        Ok(builder.build())
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn client_key(&self) -> Option<&str> {
        self.client_key.as_deref()
    }

    pub fn master_key(&self) -> Option<&str> {
        self.master_key.as_deref()
    }

    /// Base URL with no trailing slash.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn client_key(mut self, key: impl Into<String>) -> Self {
        self.config.client_key = Some(key.into());
        self
    }

    /// Elevated-privilege key. Only sent on requests that opt in with
    /// [`RequestOptions::use_master_key`].
    pub fn master_key(mut self, key: impl Into<String>) -> Self {
        self.config.master_key = Some(key.into());
        self
    }

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Per-request timeout. Requests have none unless this is set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Options recognized by every remote-call-backed operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Send the master key and bypass access control.
    pub use_master_key: bool,
    /// Session token to use instead of the current user's.
    pub session_token: Option<String>,
    /// Emit record events only after the server confirms.
    pub wait: bool,
    /// Emit no record events.
    pub silent: bool,
}

impl RequestOptions {
    pub fn master() -> Self {
        Self {
            use_master_key: true,
            ..Self::default()
        }
    }

    pub fn with_session_token(token: impl Into<String>) -> Self {
        Self {
            session_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::builder("app").build();
        assert_eq!(config.application_id(), "app");
        assert_eq!(config.server_url(), DEFAULT_SERVER_URL);
        assert_eq!(config.client_key(), None);
        assert_eq!(config.master_key(), None);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_builder_trims_trailing_slash() {
        let config = ClientConfig::builder("app")
            .server_url("http://localhost:1337/parse/")
            .build();
        assert_eq!(config.server_url(), "http://localhost:1337/parse");
    }

    #[test]
    fn test_from_lookup_reads_all_values() {
        let env: HashMap<&str, &str> = [
            ("NIMBUS_APP_ID", "my-app"),
            ("NIMBUS_CLIENT_KEY", "client"),
            ("NIMBUS_MASTER_KEY", "master"),
            ("NIMBUS_SERVER_URL", "http://example.test/1"),
        ]
        .into_iter()
        .collect();

        let config =
            ClientConfig::from_lookup(|name| env.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.application_id(), "my-app");
        assert_eq!(config.client_key(), Some("client"));
        assert_eq!(config.master_key(), Some("master"));
        assert_eq!(config.server_url(), "http://example.test/1");
    }

    #[test]
    fn test_from_lookup_requires_app_id() {
        let err = ClientConfig::from_lookup(|_| None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInitialized);
    }

    #[test]
    fn test_request_options_helpers() {
        let options = RequestOptions::master().wait(true);
        assert!(options.use_master_key);
        assert!(options.wait);
        assert!(!options.silent);

        let options = RequestOptions::with_session_token("r:abc").silent(true);
        assert_eq!(options.session_token.as_deref(), Some("r:abc"));
        assert!(options.silent);
    }
}
