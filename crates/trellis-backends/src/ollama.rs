use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::TextBackend;
use trellis_core::value::{value_to_string, VarMap};

/// Text backend calling a local Ollama instance over its HTTP API.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(flatten)]
    options: serde_json::Map<String, serde_json::Value>,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

impl TextBackend for OllamaBackend {
    fn generate(&self, prompt: &str, options: &VarMap) -> BoxFuture<'_, Result<String>> {
        // per-call overrides from the scope win over configured defaults
        let base_url = options
            .get("host")
            .map(value_to_string)
            .unwrap_or_else(|| self.base_url.clone());
        let model = options
            .get("model")
            .map(value_to_string)
            .unwrap_or_else(|| self.model.clone());

        let mut extra = serde_json::Map::new();
        for (key, value) in options {
            if key == "host" || key == "model" {
                continue;
            }
            extra.insert(key.clone(), value.clone());
        }

        let prompt = prompt.to_string();
        Box::pin(async move {
            let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
            debug!(url = %url, model = %model, "ollama generate");

            let request = GenerateRequest {
                model: &model,
                prompt: &prompt,
                stream: false,
                options: extra,
            };

            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| TrellisError::BackendFailed(format!("request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TrellisError::BackendFailed(format!(
                    "ollama returned {status}: {body}"
                )));
            }

            let payload: serde_json::Value = response
                .json()
                .await
                .map_err(|e| TrellisError::BackendFailed(format!("invalid response: {e}")))?;

            payload
                .get("response")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    TrellisError::BackendFailed(format!(
                        "response missing 'response' field: {}",
                        json!(payload)
                    ))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_shape() {
        let mut options = serde_json::Map::new();
        options.insert("temperature".to_string(), json!(0.5));
        let request = GenerateRequest {
            model: "demo",
            prompt: "ping",
            stream: false,
            options,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "demo");
        assert_eq!(value["stream"], false);
        assert_eq!(value["temperature"], 0.5);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_backend_fault() {
        let backend = OllamaBackend::new("http://127.0.0.1:9", "demo", 1);
        let result = backend.generate("ping", &VarMap::new()).await;
        assert!(matches!(result, Err(TrellisError::BackendFailed(_))));
    }
}
