use crate::errors::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Decides whether a presented credential may subscribe.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(false)` is a definite denial. `Err` means the decision could not be made.
    async fn authorize(&self, credential: &str) -> Result<bool>;
}

/// Validates credentials against an external HTTP endpoint. Only a 200
/// response authorizes.
#[derive(Debug, Clone)]
pub struct HttpAuthorizer {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthorizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, credential: &str) -> Result<bool> {
        let response = self.client.get(&self.url).bearer_auth(credential).send().await?;
        let status = response.status();
        debug!("Authorization endpoint answered {}", status);
        Ok(status == StatusCode::OK)
    }
}
