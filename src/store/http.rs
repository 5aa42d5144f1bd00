use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::cards::{CardPayload, CardStatus, CardSummary, DeckId};
use crate::store::client::{
    FilteredSessionOptions, Result, StoreClient, StoreError, StudyAction,
};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Reqwest-backed [`StoreClient`] against the engine's REST surface.
pub struct HttpStoreClient {
    client: Client,
    base_url: String,
    username: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StudyRequestBody<'a> {
    username: &'a str,
    action: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudyReplyBody {
    #[serde(default)]
    card: Option<CardPayload>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilteredSessionReplyBody {
    scope_id: Option<DeckId>,
}

impl HttpStoreClient {
    /// Create a client for the engine at `base_url`, acting as `username`.
    pub fn new(base_url: impl Into<String>, username: impl Into<String>) -> Result<Self> {
        // Normalize URL - ensure no trailing slash
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url,
            username: username.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Maps engine status codes onto [`StoreError`]; 409/423 mark the
    /// single-writer session slot as taken.
    async fn check(response: Response, what: &str) -> Result<Response> {
        match response.status() {
            StatusCode::CONFLICT | StatusCode::LOCKED => Err(StoreError::SessionBusy),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(what.to_string())),
            status if !status.is_success() => Err(StoreError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl StoreClient for HttpStoreClient {
    async fn list_cards_by_tag(
        &self,
        tag: &str,
        state: Option<CardStatus>,
    ) -> Result<Vec<CardSummary>> {
        let mut query: Vec<(&str, String)> = vec![
            ("tag", tag.to_string()),
            ("username", self.username.clone()),
        ];
        if let Some(state) = state {
            query.push(("state", state.as_str().to_string()));
        }

        let response = self
            .client
            .get(self.url("api/v1/cards"))
            .query(&query)
            .send()
            .await?;
        let response = Self::check(response, tag).await?;

        Ok(response.json().await?)
    }

    async fn list_scope_cards(&self, scope_id: DeckId) -> Result<Vec<CardSummary>> {
        let response = self
            .client
            .get(self.url(&format!("api/v1/decks/{}/cards", scope_id)))
            .query(&[("username", self.username.as_str())])
            .send()
            .await?;
        let response = Self::check(response, &format!("deck {}", scope_id)).await?;

        Ok(response.json().await?)
    }

    async fn open_filtered_session(
        &self,
        scope_id: DeckId,
        options: &FilteredSessionOptions,
    ) -> Result<DeckId> {
        let response = self
            .client
            .post(self.url(&format!("api/v1/decks/{}/filtered-session", scope_id)))
            .query(&[("username", self.username.as_str())])
            .json(options)
            .send()
            .await?;
        let response = Self::check(response, &format!("deck {}", scope_id)).await?;

        let reply: FilteredSessionReplyBody = response.json().await?;
        reply.scope_id.ok_or_else(|| {
            StoreError::InvalidResponse("filtered-session reply carried no scope id".to_string())
        })
    }

    async fn study(&self, scope_id: DeckId, action: StudyAction) -> Result<Option<CardPayload>> {
        let body = StudyRequestBody {
            username: &self.username,
            action: action.as_str(),
        };

        let response = self
            .client
            .post(self.url(&format!("api/v1/decks/{}/study", scope_id)))
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response, &format!("deck {}", scope_id)).await?;

        let reply: StudyReplyBody = response.json().await?;
        if let Some(message) = &reply.message {
            log::debug!("Store: study '{}' on {}: {}", action.as_str(), scope_id, message);
        }
        Ok(reply.card)
    }
}
