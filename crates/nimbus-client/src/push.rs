//! Push notifications.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::info;

use crate::client::Body;
use crate::{Client, Deferred, ErrorCode, NimbusError, Query, RequestOptions};

/// A push notification and its audience.
///
/// Target either `channels` or installations matching `audience`.
#[derive(Debug, Clone, Default)]
pub struct PushData {
    pub channels: Vec<String>,
    /// Query over `_Installation`.
    pub audience: Option<Query>,
    pub push_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    /// Seconds after `push_time` (or now) when delivery stops.
    pub expiration_interval: Option<u64>,
    pub alert: Option<String>,
    pub badge: Option<Value>,
    pub sound: Option<String>,
    pub title: Option<String>,
    /// Extra payload fields.
    pub data: Map<String, Value>,
}

impl PushData {
    pub fn alert(message: &str) -> Self {
        Self {
            alert: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn to_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(channels.into_iter().map(Into::into));
        self
    }

    /// The `/push` request body.
    pub fn to_json(&self) -> Result<Value, NimbusError> {
        if self.expiration_time.is_some() && self.expiration_interval.is_some() {
            return Err(NimbusError::invalid(
                ErrorCode::PushMisconfigured,
                "expiration_time and expiration_interval cannot both be set",
            ));
        }

        let mut payload = self.data.clone();
        if let Some(alert) = &self.alert {
            payload.insert("alert".to_string(), Value::from(alert.as_str()));
        }
        if let Some(badge) = &self.badge {
            payload.insert("badge".to_string(), badge.clone());
        }
        if let Some(sound) = &self.sound {
            payload.insert("sound".to_string(), Value::from(sound.as_str()));
        }
        if let Some(title) = &self.title {
            payload.insert("title".to_string(), Value::from(title.as_str()));
        }

        let mut body = Map::new();
        body.insert("data".to_string(), Value::Object(payload));
        if !self.channels.is_empty() {
            body.insert("channels".to_string(), Value::from(self.channels.clone()));
        }
        if let Some(audience) = &self.audience {
            body.insert("where".to_string(), audience.where_clause());
        }
        if let Some(at) = self.push_time {
            body.insert("push_time".to_string(), iso(at));
        }
        if let Some(at) = self.expiration_time {
            body.insert("expiration_time".to_string(), iso(at));
        }
        if let Some(seconds) = self.expiration_interval {
            body.insert("expiration_interval".to_string(), Value::from(seconds));
        }
        Ok(Value::Object(body))
    }
}

fn iso(at: DateTime<Utc>) -> Value {
    Value::from(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl Client {
    /// Send a push notification. Always uses the master key.
    pub fn send_push(&self, push: PushData, options: RequestOptions) -> Deferred<()> {
        let body = match push.to_json() {
            Ok(body) => body,
            Err(e) => return Deferred::rejected(e),
        };
        let options = RequestOptions {
            use_master_key: true,
            ..options
        };
        let client = self.clone();
        Deferred::spawn(async move {
            let _: Value = client
                .request(Method::POST, "push", &[], Body::Json(body), &options)
                .await?;
            info!(channels = ?push.channels, "push queued");
            Ok(())
        })
    }
}
