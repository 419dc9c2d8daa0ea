//! Cloud function calls and outbound HTTP requests.

use std::collections::BTreeMap;

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::Body;
use crate::{Client, Deferred, NimbusError, RequestOptions};

/// Body of an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    Text(String),
    Json(Value),
    Bytes(Vec<u8>),
}

/// An outbound HTTP request made through [`Client::http_request`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub params: Vec<(String, String)>,
    pub body: Option<HttpBody>,
    /// Redirects are returned as-is unless this is set.
    pub follow_redirects: bool,
}

impl HttpOptions {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: BTreeMap::new(),
            params: Vec::new(),
            body: None,
            follow_redirects: false,
        }
    }

    pub fn post(url: impl Into<String>, body: HttpBody) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }
}

/// One `Set-Cookie` from a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<String>,
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
}

impl Cookie {
    /// Parse a `Set-Cookie` header value. Unknown attributes are ignored.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';').map(str::trim);
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            ..Cookie::default()
        };
        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attribute, None),
            };
            match (key.to_ascii_lowercase().as_str(), val) {
                ("domain", Some(v)) => cookie.domain = Some(v.to_string()),
                ("path", Some(v)) => cookie.path = Some(v.to_string()),
                ("expires", Some(v)) => cookie.expires = Some(v.to_string()),
                ("max-age", Some(v)) => cookie.max_age = v.parse().ok(),
                ("httponly", _) => cookie.http_only = true,
                ("secure", _) => cookie.secure = true,
                _ => {}
            }
        }
        Some(cookie)
    }
}

/// Response to an outbound HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub text: String,
    /// The body parsed as JSON, when it is JSON.
    pub data: Option<Value>,
    pub buffer: Vec<u8>,
    pub cookies: BTreeMap<String, Cookie>,
}

impl Client {
    /// Call a cloud function and resolve to its `result`.
    pub fn run(&self, name: &str, params: Value, options: RequestOptions) -> Deferred<Value> {
        #[derive(Deserialize)]
        struct RunResponse {
            #[serde(default)]
            result: Value,
        }

        let client = self.clone();
        let path = format!("functions/{name}");
        Deferred::spawn(async move {
            let response: RunResponse = client
                .request(Method::POST, &path, &[], Body::Json(params), &options)
                .await?;
            Ok(response.result)
        })
    }

    /// Make an HTTP request to an arbitrary URL.
    ///
    /// Non-2xx responses reject with [`NimbusError::HttpStatus`].
    pub fn http_request(&self, options: HttpOptions) -> Deferred<HttpResponse> {
        let client = self.clone();
        Deferred::spawn(async move { client.send_outbound(options).await })
    }

    #[tracing::instrument(skip(self, options), fields(method = %options.method, url = %options.url))]
    async fn send_outbound(&self, options: HttpOptions) -> Result<HttpResponse, NimbusError> {
        let http = self.outbound_http(options.follow_redirects);
        let mut request = http.request(options.method, &options.url);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if !options.params.is_empty() {
            request = request.query(&options.params);
        }
        request = match options.body {
            None => request,
            Some(HttpBody::Text(text)) => request.body(text),
            Some(HttpBody::Json(value)) => request.json(&value),
            Some(HttpBody::Bytes(bytes)) => request.body(bytes),
        };

        let response = request.send().await?;
        let status = response.status();

        let mut headers = BTreeMap::new();
        let mut cookies = BTreeMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                warn!(header = %name, "skipping non-text response header");
                continue;
            };
            if name == reqwest::header::SET_COOKIE {
                if let Some(cookie) = Cookie::parse(value) {
                    cookies.insert(cookie.name.clone(), cookie);
                }
            }
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let buffer = response.bytes().await?.to_vec();
        let text = String::from_utf8_lossy(&buffer).into_owned();
        debug!(status = status.as_u16(), size = buffer.len(), "outbound response");

        if !status.is_success() {
            return Err(NimbusError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            data: serde_json::from_slice(&buffer).ok(),
            text,
            buffer,
            cookies,
        })
    }
}
