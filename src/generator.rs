use async_trait::async_trait;
use reqwest::Url;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::GenerateError;
use crate::metrics::GENERATION_LATENCY;
use crate::models::GenerateRequest;

/// Produces raw image bytes for a prompt.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, req: &GenerateRequest) -> Result<Vec<u8>, GenerateError>;
}

/// Calls `{base}/{prompt}?width=&height=&model=[&seed=]` and downloads the body.
pub struct RemoteGenerator {
    client: reqwest::Client,
    base_url: String,
    max_timeout: Duration,
    permits: Semaphore,
}

impl RemoteGenerator {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        max_timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            max_timeout,
            permits: Semaphore::new(max_concurrent),
        }
    }

    pub fn request_url(&self, req: &GenerateRequest) -> Result<Url, GenerateError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| GenerateError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GenerateError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(&req.prompt);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("width", &req.width.to_string())
                .append_pair("height", &req.height.to_string())
                .append_pair("model", &req.model);
            if let Some(seed) = req.seed {
                query.append_pair("seed", &seed.to_string());
            }
        }
        Ok(url)
    }

    /// Larger images get longer, capped at the configured maximum.
    pub fn timeout_for(&self, req: &GenerateRequest) -> Duration {
        let area = u64::from(req.width) * u64::from(req.height);
        Duration::from_secs((area / 10_000).max(30)).min(self.max_timeout)
    }
}

#[async_trait]
impl ImageGenerator for RemoteGenerator {
    async fn generate(&self, req: &GenerateRequest) -> Result<Vec<u8>, GenerateError> {
        let url = self.request_url(req)?;
        let timeout = self.timeout_for(req);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GenerateError::InvalidRequest("generator is shutting down".into()))?;

        debug!(%url, ?timeout, "Calling image generator");
        let start = Instant::now();

        let res = self.client.get(url).timeout(timeout).send().await.map_err(|e| {
            if e.is_timeout() { GenerateError::Timeout(timeout) } else { GenerateError::Http(e) }
        })?;
        if !res.status().is_success() {
            return Err(GenerateError::Status(res.status().as_u16()));
        }
        let body = res.bytes().await.map_err(|e| {
            if e.is_timeout() { GenerateError::Timeout(timeout) } else { GenerateError::Http(e) }
        })?;
        if body.is_empty() {
            return Err(GenerateError::EmptyBody);
        }

        let elapsed = start.elapsed();
        GENERATION_LATENCY.observe(elapsed.as_secs_f64());
        info!(bytes = body.len(), elapsed = ?elapsed, "Image generated");
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator_with_max(max_timeout: Duration) -> RemoteGenerator {
        RemoteGenerator::new(reqwest::Client::new(), "https://images.example/p", max_timeout, 2)
    }

    fn generator() -> RemoteGenerator {
        generator_with_max(Duration::from_secs(120))
    }

    fn req(width: u32, height: u32, seed: Option<u64>) -> GenerateRequest {
        GenerateRequest { prompt: "a cat & a dog".into(), width, height, model: "flux".into(), seed }
    }

    #[test]
    fn url_encodes_prompt_and_params() {
        let url = generator().request_url(&req(1024, 768, Some(42))).unwrap();
        assert_eq!(
            url.as_str(),
            "https://images.example/p/a%20cat%20&%20a%20dog?width=1024&height=768&model=flux&seed=42"
        );
    }

    #[test]
    fn timeout_scales_with_area() {
        let g = generator_with_max(Duration::from_secs(300));
        assert_eq!(g.timeout_for(&req(256, 256, None)), Duration::from_secs(30));
        assert_eq!(g.timeout_for(&req(2048, 1024, None)), Duration::from_secs(209));
        assert_eq!(g.timeout_for(&req(2048, 2048, None)), Duration::from_secs(300));
    }

    #[test]
    fn timeout_capped_at_configured_max() {
        let g = generator();
        assert_eq!(g.timeout_for(&req(2048, 1024, None)), Duration::from_secs(120));
    }
}
