use crate::{error::CloudError, url_builder::encode_params};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{Client, Method, header::CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use trait_variant::make;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Outgoing cloud request
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: vec![],
            body: String::new(),
        }
    }

    pub fn header(mut self, (name, value): (String, String)) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn json(mut self, body: &Value) -> Self {
        self.headers
            .push((CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string()));
        self.body = body.to_string();
        self
    }

    pub fn form(mut self, params: &[(&str, &str)]) -> Self {
        self.headers
            .push((CONTENT_TYPE.to_string(), FORM_CONTENT_TYPE.to_string()));
        self.body = encode_params(params);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Response of a cloud request, fully read
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as a JSON object
    ///
    /// Anything that is not `application/json` with an object at the top
    /// level is reported as a malformed response.
    pub fn json(&self) -> Result<serde_json::Map<String, Value>, CloudError> {
        let mime = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();

        if mime != "application/json" {
            return Err(CloudError::MalformedResponse(format!(
                "unexpected content type '{}' (status {})",
                self.content_type, self.status
            )));
        }

        match serde_json::from_str(&self.body) {
            Ok(Value::Object(object)) => Ok(object),
            Ok(_) => Err(CloudError::MalformedResponse(
                "response is not a json object".to_string(),
            )),
            Err(e) => Err(CloudError::MalformedResponse(format!(
                "failed to parse response: {e}"
            ))),
        }
    }
}

/// Transport for all cloud calls
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CloudError>;
}

#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create http client: {e}"))?;

        Ok(Self { client })
    }
}

impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CloudError> {
        let mut builder = self.client.request(request.method, &request.url);

        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let res = builder
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        let status = res.status().as_u16();
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = res
            .text()
            .await
            .map_err(|e| CloudError::Transport(format!("failed to read response body: {e}")))?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}
