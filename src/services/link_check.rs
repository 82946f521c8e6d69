use async_trait::async_trait;
use reqwest::{redirect, Client, StatusCode};
use std::time::Duration;

use crate::services::browser::USER_AGENT;

/// Result of probing one bookmarked URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkHealth {
    /// 2xx or 3xx response.
    Alive(u16),
    /// 4xx or 5xx response.
    Dead(u16),
    /// Timeout, DNS or connection failure.
    Unreachable(String),
}

impl LinkHealth {
    pub fn from_status(status: u16) -> Self {
        if (200..400).contains(&status) {
            LinkHealth::Alive(status)
        } else {
            LinkHealth::Dead(status)
        }
    }

    pub fn is_broken(&self) -> bool {
        !matches!(self, LinkHealth::Alive(_))
    }
}

#[async_trait]
pub trait LinkProber: Send + Sync {
    async fn probe(&self, url: &str) -> LinkHealth;
}

/// Liveness checks over plain HTTP. Redirects are not followed, so a 3xx
/// response counts as alive without chasing its target.
pub struct HttpLinkProber {
    http: Client,
}

impl HttpLinkProber {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl LinkProber for HttpLinkProber {
    async fn probe(&self, url: &str) -> LinkHealth {
        let head = match self.http.head(url).send().await {
            Ok(response) => response.status(),
            Err(e) => return LinkHealth::Unreachable(e.to_string()),
        };

        // Some servers refuse HEAD outright.
        if head != StatusCode::METHOD_NOT_ALLOWED && head != StatusCode::NOT_IMPLEMENTED {
            return LinkHealth::from_status(head.as_u16());
        }

        match self.http.get(url).send().await {
            Ok(response) => LinkHealth::from_status(response.status().as_u16()),
            Err(e) => LinkHealth::Unreachable(e.to_string()),
        }
    }
}
