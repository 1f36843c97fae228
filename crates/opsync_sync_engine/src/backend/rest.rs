//! PostgREST-style backend over an abstract HTTP client.
//!
//! The HTTP client is a trait so applications can plug in whatever
//! library they already use (reqwest, hyper, a platform bridge).

use super::{BackendError, Record, RemoteBackend};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        })
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL including query string.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

/// A response received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// Return `Err` only when no response was received (DNS failure,
/// connection refused, timeout). Error statuses are `Ok` responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// A [`RemoteBackend`] speaking the PostgREST dialect.
///
/// Rows are addressed as `/{table}?id=eq.{id}`; writes ask for the stored
/// row back with `Prefer: return=representation`.
pub struct RestBackend<C: HttpClient> {
    base_url: String,
    client: C,
    api_key: Option<String>,
}

impl<C: HttpClient> RestBackend<C> {
    /// Creates a backend rooted at `base_url` (e.g. `https://x.example/rest/v1`).
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            api_key: None,
        }
    }

    /// Sends `key` as both `apikey` and bearer token.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, table: &str, filter: Option<(&str, &str)>) -> String {
        let mut url = format!("{}/{}", self.base_url, encode_component(table));
        if let Some((column, value)) = filter {
            url.push_str(&format!(
                "?{}=eq.{}",
                encode_component(column),
                encode_component(value)
            ));
        }
        url
    }

    async fn call(
        &self,
        method: Method,
        url: String,
        body: Option<&Value>,
    ) -> Result<Option<Value>, BackendError> {
        let mut headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            ("Prefer".to_string(), "return=representation".to_string()),
        ];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        if let Some(key) = &self.api_key {
            headers.push(("apikey".to_string(), key.clone()));
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| BackendError::other(format!("failed to encode request: {e}")))?;

        tracing::trace!(%method, %url, "backend request");
        let response = self
            .client
            .send(HttpRequest {
                method,
                url,
                headers,
                body,
            })
            .await
            .map_err(BackendError::offline)?;

        let parsed = if response.body.is_empty() {
            None
        } else {
            serde_json::from_slice::<Value>(&response.body).ok()
        };

        if response.status >= 400 {
            let message = parsed
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("backend responded with status {}", response.status));
            let mut err = BackendError::status(response.status, message);
            if let Some(details) = parsed {
                err = err.with_details(details);
            }
            return Err(err);
        }

        if !response.body.is_empty() && parsed.is_none() {
            return Err(BackendError::other("backend response is not JSON"));
        }
        Ok(parsed)
    }

    fn first_row(rows: Option<Value>, table: &str, id: Option<&str>) -> Result<Record, BackendError> {
        match rows {
            Some(Value::Array(mut rows)) if !rows.is_empty() => Ok(rows.swap_remove(0)),
            Some(Value::Object(row)) => Ok(Value::Object(row)),
            _ => Err(BackendError::status(
                404,
                match id {
                    Some(id) => format!("no row {id} in {table}"),
                    None => format!("{table} returned no row"),
                },
            )),
        }
    }
}

#[async_trait]
impl<C: HttpClient> RemoteBackend for RestBackend<C> {
    async fn insert(&self, table: &str, data: Value) -> Result<Record, BackendError> {
        let rows = self.call(Method::Post, self.url(table, None), Some(&data)).await?;
        Self::first_row(rows, table, None)
    }

    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Record, BackendError> {
        let url = self.url(table, Some(("id", id)));
        let rows = self.call(Method::Patch, url, Some(&data)).await?;
        Self::first_row(rows, table, Some(id))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), BackendError> {
        let url = self.url(table, Some(("id", id)));
        match self.call(Method::Delete, url, None).await? {
            Some(Value::Array(rows)) if rows.is_empty() => {
                Err(BackendError::status(404, format!("no row {id} in {table}")))
            }
            _ => Ok(()),
        }
    }

    async fn select_one(&self, table: &str, id: &str) -> Result<Option<Record>, BackendError> {
        let url = format!("{}&limit=1", self.url(table, Some(("id", id))));
        match self.call(Method::Get, url, None).await? {
            Some(Value::Array(mut rows)) if !rows.is_empty() => Ok(Some(rows.swap_remove(0))),
            _ => Ok(None),
        }
    }

    async fn select_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<Record>, BackendError> {
        let url = self.url(table, Some((column, value)));
        match self.call(Method::Get, url, None).await? {
            Some(Value::Array(rows)) => Ok(rows),
            None => Ok(Vec::new()),
            Some(_) => Err(BackendError::other("expected a JSON array of rows")),
        }
    }
}

/// Percent-encodes everything except RFC 3986 unreserved characters.
fn encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    struct ScriptedClient {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
    }

    impl ScriptedClient {
        fn respond(&self, status: u16, body: Value) {
            self.responses.lock().push_back(Ok(HttpResponse {
                status,
                body: serde_json::to_vec(&body).unwrap(),
            }));
        }

        fn fail(&self, message: &str) {
            self.responses.lock().push_back(Err(message.to_string()));
        }
    }

    #[async_trait]
    impl HttpClient for Arc<ScriptedClient> {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err("no scripted response".into()))
        }
    }

    #[tokio::test]
    async fn insert_posts_json() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(201, json!([{"id": "s1", "name": "Main", "version": 1}]));
        let backend = RestBackend::new("https://db.example/rest/v1/", Arc::clone(&client)).with_api_key("k");

        let row = backend.insert("stores", json!({"name": "Main"})).await.unwrap();
        assert_eq!(row["id"], "s1");

        let requests = client.requests.lock();
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].url, "https://db.example/rest/v1/stores");
        assert!(requests[0]
            .headers
            .contains(&("Authorization".to_string(), "Bearer k".to_string())));
        let body: Value = serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"name": "Main"}));
    }

    #[tokio::test]
    async fn update_filters_by_id() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, json!([{"id": "a b", "version": 3}]));
        let backend = RestBackend::new("https://db.example", Arc::clone(&client));

        backend.update("products", "a b", json!({"price": 1})).await.unwrap();
        assert_eq!(
            client.requests.lock()[0].url,
            "https://db.example/products?id=eq.a%20b"
        );
    }

    #[tokio::test]
    async fn select_one_absent() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(200, json!([]));
        let backend = RestBackend::new("https://db.example", Arc::clone(&client));

        assert!(backend.select_one("products", "p1").await.unwrap().is_none());
        assert!(client.requests.lock()[0].url.ends_with("?id=eq.p1&limit=1"));
    }

    #[tokio::test]
    async fn error_status_carries_message() {
        let client = Arc::new(ScriptedClient::default());
        client.respond(409, json!({"message": "duplicate key", "code": "23505"}));
        let backend = RestBackend::new("https://db.example", Arc::clone(&client));

        let err = backend.insert("stores", json!({})).await.unwrap_err();
        assert_eq!(err.status, Some(409));
        assert_eq!(err.message, "duplicate key");
        assert_eq!(err.details.unwrap()["code"], "23505");
    }

    #[tokio::test]
    async fn transport_failure_is_offline() {
        let client = Arc::new(ScriptedClient::default());
        client.fail("connection refused");
        let backend = RestBackend::new("https://db.example", Arc::clone(&client));

        let err = backend.delete("stores", "s1").await.unwrap_err();
        assert!(err.offline);
        assert_eq!(err.classify(true), opsync_protocol::ErrorKind::Network);
    }

    #[test]
    fn component_encoding() {
        assert_eq!(encode_component("plain-id_1.~"), "plain-id_1.~");
        assert_eq!(encode_component("a&b=c"), "a%26b%3Dc");
        assert_eq!(encode_component("é"), "%C3%A9");
    }
}
