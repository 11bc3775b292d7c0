//! JSON-over-HTTP oracle and sampler.
//!
//! Wire format:
//! - `POST {base_url}/score` with `{"prompts": [...], "completion": "..."}`,
//!   answered by `{"results": [...]}` where each entry is `{"logprob": x}`,
//!   `{"token_logprobs": [x, ...]}` or `null`.
//! - `POST {base_url}/sample` with `{"prompts": [...], "max_new_tokens": n}`,
//!   answered by `{"completions": [...]}`.
//!
//! A `null` result or `null` token log-probability becomes
//! [`LikelihoodResult::Undefined`].

use crate::config::{HttpOracleConfig, RetryConfig};
use crate::retry::with_retry;
use ablate_core::{LikelihoodOracle, LikelihoodResult, OracleError, Sampler};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Fallback delay when a 429 carries no usable retry hint.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Longest slice of an error body carried into an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Connection shared by the oracle and sampler of one server.
#[derive(Clone)]
struct Endpoint {
    client: Client,
    base_url: String,
    model: Option<String>,
    api_key: Option<String>,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Endpoint {
    fn new(config: &HttpOracleConfig, api_key: Option<String>) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OracleError::request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout_secs: config.request_timeout_secs,
            retry: config.retry.clone(),
        })
    }

    /// POST `body` to `path`, retrying transient failures.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, OracleError> {
        let url = format!("{}/{}", self.base_url, path);
        let url = url.as_str();
        with_retry(&self.retry, move || self.post_once(url, body)).await
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Value, OracleError> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(map_http_error(status, &headers, &text, self.timeout_secs));
        }

        serde_json::from_str(&text)
            .map_err(|e| OracleError::malformed(format!("response is not valid JSON: {e}")))
    }

    fn map_transport_error(&self, err: reqwest::Error) -> OracleError {
        if err.is_timeout() {
            OracleError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else if err.is_connect() {
            OracleError::Unavailable {
                message: format!("cannot reach {}: {err}", self.base_url),
            }
        } else {
            OracleError::request(err.to_string())
        }
    }
}

/// [`LikelihoodOracle`] backed by a remote scoring server.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    endpoint: Endpoint,
    name: String,
    concurrent: bool,
}

impl HttpOracle {
    /// Build from config, reading the bearer token from `api_key_env` if set.
    pub fn new(config: &HttpOracleConfig) -> Result<Self, OracleError> {
        let api_key = resolve_api_key(config)?;
        Self::with_api_key(config, api_key)
    }

    /// Build with an explicitly provided token (or none).
    pub fn with_api_key(
        config: &HttpOracleConfig,
        api_key: Option<String>,
    ) -> Result<Self, OracleError> {
        let endpoint = Endpoint::new(config, api_key)?;
        let name = match &endpoint.model {
            Some(model) => format!("http({model})"),
            None => format!("http({})", endpoint.base_url),
        };
        Ok(Self {
            endpoint,
            name,
            concurrent: config.concurrent,
        })
    }

    /// A sampler talking to the same server.
    pub fn sampler(&self) -> HttpSampler {
        HttpSampler {
            endpoint: self.endpoint.clone(),
        }
    }
}

#[async_trait]
impl LikelihoodOracle for HttpOracle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn score(
        &self,
        prompts: &[String],
        completion: &str,
    ) -> Result<Vec<LikelihoodResult>, OracleError> {
        let mut body = json!({
            "prompts": prompts,
            "completion": completion,
        });
        if let Some(model) = &self.endpoint.model {
            body["model"] = json!(model);
        }

        debug!(
            oracle = %self.name,
            prompts = prompts.len(),
            "Sending score request"
        );
        let response = self.endpoint.post("score", &body).await?;
        parse_score_response(&response, prompts.len())
    }

    fn supports_concurrent_scoring(&self) -> bool {
        self.concurrent
    }
}

/// [`Sampler`] backed by a remote generation endpoint.
#[derive(Debug, Clone)]
pub struct HttpSampler {
    endpoint: Endpoint,
}

impl HttpSampler {
    pub fn new(config: &HttpOracleConfig) -> Result<Self, OracleError> {
        let api_key = resolve_api_key(config)?;
        Ok(Self {
            endpoint: Endpoint::new(config, api_key)?,
        })
    }
}

#[async_trait]
impl Sampler for HttpSampler {
    async fn sample(
        &self,
        prompts: &[String],
        max_new_tokens: usize,
    ) -> Result<Vec<String>, OracleError> {
        let mut body = json!({
            "prompts": prompts,
            "max_new_tokens": max_new_tokens,
        });
        if let Some(model) = &self.endpoint.model {
            body["model"] = json!(model);
        }

        debug!(prompts = prompts.len(), max_new_tokens, "Sending sample request");
        let response = self.endpoint.post("sample", &body).await?;
        let completions = response["completions"]
            .as_array()
            .ok_or_else(|| OracleError::malformed("response has no 'completions' array"))?;
        if completions.len() != prompts.len() {
            return Err(OracleError::malformed(format!(
                "expected {} completions, got {}",
                prompts.len(),
                completions.len()
            )));
        }
        completions
            .iter()
            .enumerate()
            .map(|(i, c)| {
                c.as_str().map(str::to_string).ok_or_else(|| {
                    OracleError::malformed(format!("completion {i} is not a string"))
                })
            })
            .collect()
    }
}

fn resolve_api_key(config: &HttpOracleConfig) -> Result<Option<String>, OracleError> {
    match &config.api_key_env {
        Some(var) => std::env::var(var)
            .map(Some)
            .map_err(|_| OracleError::Unavailable {
                message: format!("API key environment variable '{var}' is not set"),
            }),
        None => Ok(None),
    }
}

/// Decode a `/score` response into one result per prompt.
fn parse_score_response(
    response: &Value,
    expected: usize,
) -> Result<Vec<LikelihoodResult>, OracleError> {
    let results = response["results"]
        .as_array()
        .ok_or_else(|| OracleError::malformed("response has no 'results' array"))?;
    if results.len() != expected {
        return Err(OracleError::malformed(format!(
            "expected {expected} results, got {}",
            results.len()
        )));
    }
    results
        .iter()
        .enumerate()
        .map(|(i, v)| parse_result(i, v))
        .collect()
}

fn parse_result(index: usize, value: &Value) -> Result<LikelihoodResult, OracleError> {
    let not_a_number =
        |field: &str| OracleError::malformed(format!("result {index}: '{field}' is not a number"));

    let Value::Object(map) = value else {
        return match value {
            Value::Null => Ok(LikelihoodResult::Undefined),
            _ => Err(OracleError::malformed(format!(
                "result {index} is neither an object nor null"
            ))),
        };
    };

    if let Some(tokens) = map.get("token_logprobs") {
        let tokens = tokens.as_array().ok_or_else(|| {
            OracleError::malformed(format!("result {index}: 'token_logprobs' is not an array"))
        })?;
        let mut logprobs = Vec::with_capacity(tokens.len());
        for token in tokens {
            if token.is_null() {
                return Ok(LikelihoodResult::Undefined);
            }
            logprobs.push(token.as_f64().ok_or_else(|| not_a_number("token_logprobs"))?);
        }
        return Ok(LikelihoodResult::PerToken(logprobs));
    }

    match map.get("logprob") {
        Some(Value::Null) => Ok(LikelihoodResult::Undefined),
        Some(v) => v
            .as_f64()
            .map(LikelihoodResult::Scalar)
            .ok_or_else(|| not_a_number("logprob")),
        None => Err(OracleError::malformed(format!(
            "result {index} has neither 'logprob' nor 'token_logprobs'"
        ))),
    }
}

/// Map a non-success HTTP status to the oracle error taxonomy.
fn map_http_error(
    status: reqwest::StatusCode,
    headers: &HeaderMap,
    body: &str,
    timeout_secs: u64,
) -> OracleError {
    let message = error_message(body);
    match status.as_u16() {
        429 => OracleError::RateLimited {
            retry_after_secs: parse_retry_after(headers, body),
        },
        408 | 504 => OracleError::Timeout { timeout_secs },
        413 | 507 => OracleError::ResourceExhausted { message },
        _ if message.to_lowercase().contains("out of memory") => {
            OracleError::ResourceExhausted { message }
        }
        503 => OracleError::Unavailable { message },
        code if code >= 500 => OracleError::request(format!("server error ({code}): {message}")),
        code => OracleError::Rejected {
            status: code,
            message,
        },
    }
}

/// Pull a readable message out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v["error"]["message"]
            .as_str()
            .or_else(|| v["error"].as_str())
            .or_else(|| v["detail"].as_str())
            .map(str::to_string)
    });
    message.unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY_CHARS).collect())
}

/// Seconds to wait before retrying a 429: `Retry-After` header, then
/// `error.retry_after_secs` in the body, then a fixed default.
fn parse_retry_after(headers: &HeaderMap, body: &str) -> u64 {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .or_else(|| {
            serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after_secs"].as_u64())
        })
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}
