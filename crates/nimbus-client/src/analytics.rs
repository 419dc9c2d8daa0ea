//! Custom analytics events.

use std::collections::BTreeMap;

use reqwest::Method;
use serde_json::{Value, json};

use crate::client::Body;
use crate::{Client, Deferred, ErrorCode, NimbusError, RequestOptions};

impl Client {
    /// Record an analytics event with optional string dimensions.
    pub fn track(
        &self,
        name: &str,
        dimensions: BTreeMap<String, String>,
        options: RequestOptions,
    ) -> Deferred<()> {
        let name = name.trim();
        if name.is_empty() {
            return Deferred::rejected(NimbusError::invalid(
                ErrorCode::InvalidEventName,
                "event name must not be empty",
            ));
        }

        let client = self.clone();
        let path = format!("events/{name}");
        Deferred::spawn(async move {
            let _: Value = client
                .request(
                    Method::POST,
                    &path,
                    &[],
                    Body::Json(json!({ "dimensions": dimensions })),
                    &options,
                )
                .await?;
            Ok(())
        })
    }
}
