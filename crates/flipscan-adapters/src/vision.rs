use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::AdapterError;

/// A classifier label with confidence on a 0-100 scale.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionLabel {
    pub label: String,
    pub confidence: f64,
}

#[async_trait]
pub trait VisionClassifier: Send + Sync {
    async fn classify(&self, image: &[u8]) -> Result<Vec<VisionLabel>, AdapterError>;
}

/// Image classification through Cloudflare Workers AI.
pub struct WorkersAiVisionClient {
    http: Client,
    endpoint: String,
    api_token: String,
}

impl WorkersAiVisionClient {
    pub const DEFAULT_MODEL: &'static str = "@cf/microsoft/resnet-50";

    pub fn new(http: Client, account_id: &str, api_token: String) -> Self {
        let endpoint = format!(
            "https://api.cloudflare.com/client/v4/accounts/{account_id}/ai/run/{}",
            Self::DEFAULT_MODEL
        );
        Self::with_endpoint(http, endpoint, api_token)
    }

    pub fn with_endpoint(http: Client, endpoint: impl Into<String>, api_token: String) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_token,
        }
    }
}

#[async_trait]
impl VisionClassifier for WorkersAiVisionClient {
    async fn classify(&self, image: &[u8]) -> Result<Vec<VisionLabel>, AdapterError> {
        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await?
            .error_for_status()?;

        let body: JsonValue = response.json().await?;
        let labels = labels_from_response(&body);
        debug!(labels = labels.len(), "image classified");
        Ok(labels)
    }
}

/// Reads `{"result": [{"label", "score"}]}`; scores in `0..=1` are scaled to percent.
pub fn labels_from_response(body: &JsonValue) -> Vec<VisionLabel> {
    let Some(items) = body.get("result").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let label = item.get("label")?.as_str()?.trim();
            if label.is_empty() {
                return None;
            }
            let score = item
                .get("score")
                .or_else(|| item.get("confidence"))
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            let confidence = if score <= 1.0 { score * 100.0 } else { score };
            Some(VisionLabel {
                label: label.to_string(),
                confidence,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scores_are_scaled_to_percent() {
        let body = json!({
            "result": [
                {"label": "TABLE LAMP", "score": 0.912},
                {"label": "lampshade", "score": 0.05},
                {"label": "", "score": 0.5}
            ],
            "success": true
        });
        let labels = labels_from_response(&body);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].label, "TABLE LAMP");
        assert!((labels[0].confidence - 91.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn classify_posts_base64_image_with_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let run = server
            .mock("POST", "/ai/run")
            .match_header("authorization", "Bearer secret-token")
            .match_body(mockito::Matcher::Json(json!({"image": "/9hqcGVn"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result":[{"label":"table lamp","score":0.88}],"success":true}"#)
            .create_async()
            .await;

        let client = WorkersAiVisionClient::with_endpoint(
            Client::new(),
            format!("{}/ai/run", server.url()),
            "secret-token".into(),
        );
        let labels = client.classify(b"\xff\xd8jpeg").await.expect("labels");

        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label, "table lamp");
        assert!((labels[0].confidence - 88.0).abs() < 1e-9);
        run.assert_async().await;
    }

    #[tokio::test]
    async fn classify_surfaces_http_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ai/run")
            .with_status(401)
            .create_async()
            .await;

        let client = WorkersAiVisionClient::with_endpoint(
            Client::new(),
            format!("{}/ai/run", server.url()),
            "wrong".into(),
        );
        let err = client.classify(b"img").await.unwrap_err();
        assert!(matches!(err, AdapterError::Http(_)));
    }

    #[test]
    fn percent_confidences_pass_through() {
        let body = json!({"result": [{"label": "Chair", "confidence": 97.5}]});
        assert_eq!(labels_from_response(&body)[0].confidence, 97.5);
        assert!(labels_from_response(&json!({"errors": []})).is_empty());
    }
}
