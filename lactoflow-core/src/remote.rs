//! HTTP-backed ports for the prediction, attribution and advisory services.
//!
//! Every port posts JSON and expects JSON back. Per-call deadlines are applied
//! by the callers; the clients here only bound connection setup.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::dispatch::{Advice, Advisor, ContextBundle};
use crate::error::{AdvisoryError, ExplainError, InferenceError};
use crate::explain::{ExplainTarget, Explainer};
use crate::inference::{Prediction, Predictor};

/// Endpoints of external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub predictor_url: Option<String>,
    pub explainer_url: Option<String>,
    pub advisor_url: Option<String>,
    /// Environment variable holding a bearer token sent to every endpoint.
    pub api_key_env: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            predictor_url: None,
            explainer_url: None,
            advisor_url: None,
            api_key_env: None,
            connect_timeout_ms: 2_000,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, url) in [
            ("predictor_url", &self.predictor_url),
            ("explainer_url", &self.explainer_url),
            ("advisor_url", &self.advisor_url),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(format!("remote.{name} must be an http(s) URL, got '{url}'"));
                }
            }
        }
        if self.connect_timeout_ms == 0 {
            errors.push("remote.connect_timeout_ms must be positive".to_string());
        }
        errors
    }

    /// Bearer token from the configured environment variable, if set.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Shared JSON-over-POST client.
#[derive(Clone)]
struct JsonClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl JsonClient {
    fn new(url: &str, config: &RemoteConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            api_key: config.api_key(),
        })
    }

    async fn post<B, R>(&self, body: &B) -> Result<R, String>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned + Send,
    {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {text}"));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| format!("invalid response body: {e}"))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest<'a> {
    features: &'a [f64],
}

/// [`Predictor`] calling a remote model server.
pub struct HttpPredictor {
    inner: JsonClient,
}

impl HttpPredictor {
    pub fn new(url: &str, config: &RemoteConfig) -> Result<Self, InferenceError> {
        let inner = JsonClient::new(url, config).map_err(|e| InferenceError::Request {
            message: e.to_string(),
        })?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, features: &[f64]) -> Result<Prediction, InferenceError> {
        debug!(url = %self.inner.url, features = features.len(), "Requesting prediction");
        self.inner
            .post(&PredictRequest { features })
            .await
            .map_err(|message| InferenceError::Request { message })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExplainRequest<'a> {
    features: &'a [f64],
    target: ExplainTarget,
    model_version: &'a str,
}

#[derive(Deserialize)]
struct ExplainResponse {
    attributions: Vec<f64>,
}

/// [`Explainer`] calling a remote attribution service.
pub struct HttpExplainer {
    inner: JsonClient,
}

impl HttpExplainer {
    pub fn new(url: &str, config: &RemoteConfig) -> Result<Self, ExplainError> {
        let inner = JsonClient::new(url, config).map_err(|e| ExplainError::Request {
            message: e.to_string(),
        })?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Explainer for HttpExplainer {
    async fn explain(
        &self,
        features: &[f64],
        target: ExplainTarget,
        model_version: &str,
    ) -> Result<Vec<f64>, ExplainError> {
        let response: ExplainResponse = self
            .inner
            .post(&ExplainRequest {
                features,
                target,
                model_version,
            })
            .await
            .map_err(|message| ExplainError::Request { message })?;
        if response.attributions.len() != features.len() {
            return Err(ExplainError::Request {
                message: format!(
                    "expected {} attributions, got {}",
                    features.len(),
                    response.attributions.len()
                ),
            });
        }
        Ok(response.attributions)
    }
}

/// [`Advisor`] calling a remote recommendation service.
pub struct HttpAdvisor {
    inner: JsonClient,
}

impl HttpAdvisor {
    pub fn new(url: &str, config: &RemoteConfig) -> Result<Self, AdvisoryError> {
        let inner = JsonClient::new(url, config).map_err(|e| AdvisoryError::Request {
            message: e.to_string(),
        })?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn recommend(&self, bundle: &ContextBundle) -> Result<Advice, AdvisoryError> {
        self.inner.post(bundle).await.map_err(|message| {
            if message.starts_with("invalid response body") {
                AdvisoryError::ResponseParse { message }
            } else {
                AdvisoryError::Request { message }
            }
        })
    }
}
