use async_trait::async_trait;
use reqwest::Client;

use crate::producer::{DefinitionProducer, ProduceRequest, ProducerError, Result};

const DISPATCH_TIMEOUT_SECS: u64 = 15;
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Reqwest-backed [`DefinitionProducer`] posting to the producer service.
pub struct HttpProducer {
    client: Client,
    endpoint: String,
}

impl HttpProducer {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DISPATCH_TIMEOUT_SECS))
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProducerError::Unavailable(e.to_string()))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl DefinitionProducer for HttpProducer {
    async fn produce(&self, request: &ProduceRequest) -> Result<()> {
        log::info!(
            "Producer: dispatching request {} ({} word(s), tag '{}')",
            request.id,
            request.words.len(),
            request.tag
        );

        let response = self
            .client
            .post(format!("{}/api/v1/definitions", self.endpoint))
            .json(request)
            .send()
            .await
            .map_err(|e| ProducerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProducerError::Rejected(format!(
                "{}: {}",
                status.as_u16(),
                message
            )));
        }
        Ok(())
    }
}
