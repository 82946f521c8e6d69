use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::models::search::SearchDocument;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchError>;

    async fn delete(&self, id: &str) -> Result<(), SearchError>;
}

/// Client for a Meilisearch-compatible document index.
pub struct MeiliSearchClient {
    http: Client,
    base_url: String,
    index: String,
    api_key: Option<String>,
}

impl MeiliSearchClient {
    pub fn new(
        base_url: &str,
        index: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
            api_key,
        })
    }

    fn documents_url(&self) -> String {
        format!("{}/indexes/{}/documents", self.base_url, self.index)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl SearchIndex for MeiliSearchClient {
    /// Add or replace the document; the engine applies it asynchronously.
    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchError> {
        let response = self
            .authorized(self.http.post(self.documents_url()))
            .query(&[("primaryKey", "id")])
            .json(&[document])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SearchError> {
        let response = self
            .authorized(self.http.delete(format!("{}/{}", self.documents_url(), id)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("HTTP request to search engine failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Search engine rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}
