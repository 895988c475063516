use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Uri};

use crate::cli::config::RequestConfig;
use crate::error::{ConfigError, RequestError};

const VU_PLACEHOLDER: &str = "{{vu}}";
const ITER_PLACEHOLDER: &str = "{{iter}}";

/// Builds the request for one iteration of one virtual user.
pub trait RequestFactory: Send + Sync {
    fn build(&self, vu_id: u64, iteration: u64) -> Result<Request<String>, RequestError>;
}

/// Request template compiled from the scenario's `request` block.
///
/// Method and header names are validated up front. The url, header values
/// and body may contain `{{vu}}` and `{{iter}}`, so those are only checked
/// once with the placeholders filled in.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: Method,
    url: String,
    headers: Vec<(HeaderName, String)>,
    body: String,
}

impl RequestTemplate {
    pub fn from_config(config: &RequestConfig) -> Result<Self, ConfigError> {
        let url = config.url.clone().ok_or(ConfigError::MissingUrl)?;
        if url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }

        let has_body = config.body.is_some() || config.json.is_some();
        let method = match &config.method {
            Some(m) => Method::from_bytes(m.to_uppercase().as_bytes()).map_err(|_| {
                ConfigError::InvalidRequest {
                    field: "method",
                    reason: format!("'{}' is not an HTTP method", m),
                }
            })?,
            None if has_body => Method::POST,
            None => Method::GET,
        };

        let mut headers = Vec::with_capacity(config.headers.len() + 1);
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ConfigError::InvalidRequest {
                    field: "headers",
                    reason: format!("'{}' is not a valid header name", name),
                }
            })?;
            headers.push((name, value.clone()));
        }

        let body = match (&config.body, &config.json) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidRequest {
                    field: "body",
                    reason: "set either body or json, not both".to_string(),
                })
            }
            (Some(body), None) => body.clone(),
            (None, Some(json)) => {
                if !headers.iter().any(|(n, _)| *n == CONTENT_TYPE) {
                    headers.push((CONTENT_TYPE, "application/json".to_string()));
                }
                json.to_string()
            }
            (None, None) => String::new(),
        };

        let template = Self {
            method,
            url,
            headers,
            body,
        };
        // Catch static mistakes now instead of failing every iteration.
        template
            .build(1, 0)
            .map_err(|e| ConfigError::InvalidRequest {
                field: "url",
                reason: e.to_string(),
            })?;
        Ok(template)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn render(template: &str, vu: &str, iter: &str) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    template
        .replace(VU_PLACEHOLDER, vu)
        .replace(ITER_PLACEHOLDER, iter)
}

impl RequestFactory for RequestTemplate {
    fn build(&self, vu_id: u64, iteration: u64) -> Result<Request<String>, RequestError> {
        let vu = vu_id.to_string();
        let iter = iteration.to_string();

        let uri: Uri = render(&self.url, &vu, &iter)
            .parse()
            .map_err(|e: http::uri::InvalidUri| RequestError::InvalidRequest(e.to_string()))?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(RequestError::InvalidRequest(format!(
                "'{}' is not an absolute url",
                uri
            )));
        }

        let mut builder = Request::builder().method(self.method.clone()).uri(uri);
        for (name, value) in &self.headers {
            let value = HeaderValue::from_str(&render(value, &vu, &iter))
                .map_err(|e| RequestError::InvalidRequest(e.to_string()))?;
            builder = builder.header(name, value);
        }
        builder
            .body(render(&self.body, &vu, &iter))
            .map_err(|e| RequestError::InvalidRequest(e.to_string()))
    }
}
