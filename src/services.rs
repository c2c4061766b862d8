//! HTTP clients for the detection, embedding and similarity-search services.

use std::{path::Path, time::Duration};

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::{AppConfig, ENV_DETECTION_URL, ENV_EMBEDDING_URL, ENV_SEARCH_URL},
    error::RelayError,
};

/// Most matches ever returned to the caller.
pub const MAX_SIMILAR_RESULTS: usize = 15;

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    #[serde(default)]
    polygons: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    features: Option<Value>,
}

/// The embedding is forwarded exactly as the embedding service produced it.
#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    features: &'a Value,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Option<Value>,
}

/// Calls out to the ML services. Cheap to clone; the connection pool is shared.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    detection_url: Option<String>,
    embedding_url: Option<String>,
    search_url: Option<String>,
    timeout: Duration,
}

impl InferenceClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            detection_url: config.detection_url.clone(),
            embedding_url: config.embedding_url.clone(),
            search_url: config.search_url.clone(),
            timeout: config.service_timeout,
        }
    }

    /// Sends an image to the detection service and returns its `polygons` payload verbatim.
    pub async fn detect(&self, image_path: &Path) -> Result<Value, RelayError> {
        let url = required(&self.detection_url, ENV_DETECTION_URL)?;
        let form = image_form(image_path).await?;

        let response = self
            .http
            .post(url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let body: DetectionResponse = response.json().await?;
        body.polygons.ok_or_else(|| {
            RelayError::Upstream("detection response has no polygons field".into())
        })
    }

    /// Sends an image to the embedding service.
    ///
    /// The `features` payload is opaque. A response where it is absent or `null` is a
    /// [`RelayError::FeatureExtraction`].
    pub async fn embed(&self, image_path: &Path) -> Result<Value, RelayError> {
        let url = required(&self.embedding_url, ENV_EMBEDDING_URL)?;
        let form = image_form(image_path).await?;

        let response = self
            .http
            .post(url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let body: EmbeddingResponse = response.json().await?;
        match body.features {
            Some(features) => {
                debug!("Embedding service returned features");
                Ok(features)
            }
            None => {
                warn!("Embedding service response has no features");
                Err(RelayError::FeatureExtraction)
            }
        }
    }

    /// Nearest-neighbour search for a feature vector, truncated to [`MAX_SIMILAR_RESULTS`].
    pub async fn search(&self, features: &Value) -> Result<Vec<Value>, RelayError> {
        let url = required(&self.search_url, ENV_SEARCH_URL)?;

        let response = self
            .http
            .post(url)
            .json(&SearchRequest { features })
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        let body: SearchResponse = response.json().await?;
        Ok(similar_results(body.results))
    }
}

/// Anything other than a JSON array counts as no matches.
fn similar_results(results: Option<Value>) -> Vec<Value> {
    match results {
        Some(Value::Array(mut results)) => {
            results.truncate(MAX_SIMILAR_RESULTS);
            results
        }
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            warn!("Search service returned non-array results: {}", other);
            Vec::new()
        }
    }
}

fn required<'a>(url: &'a Option<String>, key: &str) -> Result<&'a str, RelayError> {
    url.as_deref().ok_or_else(|| RelayError::missing_env(key))
}

/// Multipart form with the image in a `file` field.
async fn image_form(path: &Path) -> Result<Form, RelayError> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    let part = Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime_for(path))?;
    Ok(Form::new().part("file", part))
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_mime_for_extensions() {
        assert_eq!(mime_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a_polygon.png")), "image/png");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_search_request_shape() {
        let features = json!([[0.5, -1.25]]);
        let body = serde_json::to_value(SearchRequest {
            features: &features,
        })
        .unwrap();
        assert_eq!(body, json!({ "features": [[0.5, -1.25]] }));
    }

    #[test]
    fn test_missing_fields_deserialize_as_none() {
        let detection: DetectionResponse = serde_json::from_str("{}").unwrap();
        assert!(detection.polygons.is_none());

        let embedding: EmbeddingResponse =
            serde_json::from_str(r#"{"features": null}"#).unwrap();
        assert!(embedding.features.is_none());

        let search: SearchResponse = serde_json::from_str(r#"{"other": 1}"#).unwrap();
        assert!(search.results.is_none());
    }

    #[test]
    fn test_embedding_features_are_opaque() {
        let nested: EmbeddingResponse =
            serde_json::from_str(r#"{"features": [[0.1, 0.2]]}"#).unwrap();
        assert_eq!(nested.features, Some(json!([[0.1, 0.2]])));

        let keyed: EmbeddingResponse =
            serde_json::from_str(r#"{"features": {"vector": [1]}}"#).unwrap();
        assert_eq!(keyed.features, Some(json!({ "vector": [1] })));
    }

    #[test]
    fn test_similar_results_shapes() {
        let many: Vec<Value> = (0..20).map(|i| json!({ "id": i })).collect();
        let truncated = similar_results(Some(Value::Array(many)));
        assert_eq!(truncated.len(), MAX_SIMILAR_RESULTS);
        assert_eq!(truncated[14], json!({ "id": 14 }));

        assert!(similar_results(None).is_empty());
        assert!(similar_results(Some(Value::Null)).is_empty());
        assert!(similar_results(Some(json!({ "id": 1 }))).is_empty());
        assert!(similar_results(Some(json!("none"))).is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_service_is_configuration_error() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        let client = InferenceClient::new(&config);

        let err = client.search(&json!([1.0])).await.unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
        assert_eq!(
            err.to_string(),
            "FASTAPI_FAISS_URL environment variable not configured"
        );
    }
}
