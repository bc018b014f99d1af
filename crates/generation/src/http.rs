//! HTTP image generation provider.
//!
//! The provider either answers `POST /v1/generate` with the images inline
//! (base64) or with a provider job id that is polled on
//! `GET /v1/jobs/{id}` until it settles.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::{Artifact, GenerationAdapter, GenerationRequest, ProgressReporter};
use crate::error::GenerationError;
use crate::prompts::build_prompt;

const DEFAULT_API_URL: &str = "https://api.nanobanana.com";

/// Connection settings for [`HttpGenerator`].
#[derive(Debug, Clone)]
pub struct HttpGeneratorConfig {
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HttpGeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Provider reached over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: Client,
    config: HttpGeneratorConfig,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    generated_images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: String,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    generated_images: Vec<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

impl HttpGenerator {
    pub fn new(config: HttpGeneratorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn poll_until_settled(
        &self,
        provider_job_id: &str,
        deadline: Instant,
        timeout: Duration,
        progress: &ProgressReporter,
    ) -> Result<Vec<String>, GenerationError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GenerationError::Timeout(timeout));
            }

            let response = self
                .client
                .get(self.url(&format!("/v1/jobs/{provider_job_id}")))
                .bearer_auth(&self.config.api_key)
                .timeout(remaining)
                .send()
                .await
                .map_err(|e| classify_transport(e, timeout))?;
            let response = check_status(response).await?;
            let status: JobStatusResponse = response
                .json()
                .await
                .map_err(|e| GenerationError::Rejected(format!("malformed status response: {e}")))?;

            if let Some(p) = status.progress {
                progress.report(p);
            }

            match status.status.as_str() {
                "completed" | "succeeded" | "success" => return Ok(status.generated_images),
                "failed" | "error" => {
                    let message = status.error.unwrap_or_else(|| "unknown error".to_string());
                    return Err(match status.error_code.as_deref() {
                        Some("content_policy") => GenerationError::ContentPolicy(message),
                        Some("invalid_input") => GenerationError::InvalidInput(message),
                        Some("overloaded") => GenerationError::Unavailable(message),
                        _ => GenerationError::Rejected(message),
                    });
                }
                other => debug!(provider_job_id, status = other, "provider job still running"),
            }

            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }
}

#[async_trait]
impl GenerationAdapter for HttpGenerator {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Artifact>, GenerationError> {
        let deadline = Instant::now() + request.timeout;
        let params = &request.parameters;
        let body = serde_json::json!({
            "input_image": request.input_ref,
            "prompt": build_prompt(request.mode, params),
            "mode": request.mode.as_str(),
            "output_format": "png",
            "quality": "high",
            "shadow_option": params.shadow_option,
            "model_gender": params.model_gender,
            "scene_environment": params.scene_environment,
        });

        let response = self
            .client
            .post(self.url("/v1/generate"))
            .bearer_auth(&self.config.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, request.timeout))?;
        let response = check_status(response).await?;
        let created: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Rejected(format!("malformed generate response: {e}")))?;
        progress.report(10);

        let images = if !created.generated_images.is_empty() {
            created.generated_images
        } else if let Some(provider_job_id) = created.job_id.as_deref() {
            self.poll_until_settled(provider_job_id, deadline, request.timeout, &progress)
                .await?
        } else {
            Vec::new()
        };

        if images.is_empty() {
            return Err(GenerationError::Rejected("provider returned no images".to_string()));
        }

        let mut artifacts = Vec::with_capacity(images.len());
        for (idx, encoded) in images.iter().enumerate() {
            match STANDARD.decode(encoded.trim()) {
                Ok(bytes) => artifacts.push(Artifact::png(bytes)),
                Err(e) => warn!(job_id = %request.job_id, index = idx, error = %e, "skipping undecodable image"),
            }
        }
        if artifacts.is_empty() {
            return Err(GenerationError::Rejected("no decodable images in response".to_string()));
        }

        progress.report(90);
        Ok(artifacts)
    }
}

async fn check_status(response: Response) -> Result<Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    let message = format!("{}: {}", status.as_u16(), message);

    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => GenerationError::Unavailable(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            GenerationError::InvalidInput(message)
        }
        StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => GenerationError::ContentPolicy(message),
        s if s.is_server_error() => GenerationError::Unavailable(message),
        _ => GenerationError::Rejected(message),
    })
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        GenerationError::Unavailable(err.to_string())
    } else {
        GenerationError::Rejected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use productsnap_core::JobId;
    use productsnap_jobs::{GenerationParameters, JobMode};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator(server: &MockServer) -> HttpGenerator {
        HttpGenerator::new(HttpGeneratorConfig {
            base_url: server.uri(),
            api_key: "test-key".to_string(),
            poll_interval: Duration::from_millis(10),
            ..HttpGeneratorConfig::default()
        })
        .unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            job_id: JobId::new(),
            input_ref: "s3://uploads/mug.png".to_string(),
            mode: JobMode::StudioWhite,
            parameters: GenerationParameters::default(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn inline_images_are_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "job_id": "nb-1",
                "generated_images": [STANDARD.encode(b"png-1"), STANDARD.encode(b"png-2")],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (reporter, mut rx) = ProgressReporter::channel();
        let artifacts = generator(&server).generate(request(), reporter).await.unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].bytes, b"png-1");
        assert_eq!(artifacts[1].content_type, "image/png");
        assert_eq!(rx.recv().await, Some(10));
        assert_eq!(rx.recv().await, Some(90));
    }

    #[tokio::test]
    async fn provider_job_is_polled_until_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "job_id": "nb-7" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/jobs/nb-7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "succeeded",
                "progress": 100,
                "generated_images": [STANDARD.encode(b"done")],
            })))
            .mount(&server)
            .await;

        let artifacts = generator(&server)
            .generate(request(), ProgressReporter::detached())
            .await
            .unwrap();
        assert_eq!(artifacts, vec![Artifact::png(b"done".to_vec())]);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(request(), ProgressReporter::detached())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GenerationError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn status_codes_are_classified() {
        let cases = [
            (503, true),
            (422, false),
            (451, false),
            (401, false),
        ];
        for (code, transient) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/generate"))
                .respond_with(ResponseTemplate::new(code).set_body_string("nope"))
                .mount(&server)
                .await;

            let err = generator(&server)
                .generate(request(), ProgressReporter::detached())
                .await
                .unwrap_err();
            assert_eq!(err.is_transient(), transient, "status {code}: {err}");
        }
    }

    #[tokio::test]
    async fn failed_provider_job_maps_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "job_id": "nb-9" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/jobs/nb-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "failed",
                "error": "blocked",
                "error_code": "content_policy",
            })))
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(request(), ProgressReporter::detached())
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::ContentPolicy("blocked".to_string()));
    }

    #[tokio::test]
    async fn empty_response_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(request(), ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Rejected(_)));
    }
}
