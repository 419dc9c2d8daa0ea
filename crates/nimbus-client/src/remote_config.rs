//! Application-wide parameters stored on the server.

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::client::Body;
use crate::record::escape_html;
use crate::{Client, Deferred, RequestOptions};

/// A snapshot of the server's config parameters.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    params: Map<String, Value>,
}

impl RemoteConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// The parameter as HTML-escaped text; empty when unset.
    pub fn escape(&self, key: &str) -> String {
        match self.params.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => escape_html(s),
            Some(other) => escape_html(&other.to_string()),
        }
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }
}

impl Client {
    /// Fetch the config and remember it as [`Client::current_config`].
    pub fn fetch_config(&self, options: RequestOptions) -> Deferred<RemoteConfig> {
        let client = self.clone();
        Deferred::spawn(async move {
            let config: RemoteConfig = client
                .request(Method::GET, "config", &[], Body::Empty, &options)
                .await?;
            client.set_current_config(config.clone()).await;
            Ok(config)
        })
    }
}
