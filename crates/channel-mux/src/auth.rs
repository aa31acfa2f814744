//! Credential sources for the authentication frame.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::types::{BoxError, Error, TokenFuture, TokenProvider};

pub(crate) const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches a credential from a REST token endpoint.
///
/// The endpoint is called with `POST` and must answer with a JSON body of the
/// form `{"token": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    url: Url,
}

impl HttpTokenProvider {
    pub fn new(url: Url) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(TOKEN_FETCH_TIMEOUT)
            .build()?;
        Ok(Self { client, url })
    }

    pub async fn fetch(&self) -> Result<String, Error> {
        let resp = self
            .client
            .post(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json::<TokenResponse>()
            .await?;
        Ok(resp.token)
    }

    pub fn into_provider(self) -> TokenProvider {
        let this = Arc::new(self);
        Box::new(move || -> TokenFuture {
            let this = this.clone();
            Box::pin(async move { this.fetch().await.map_err(BoxError::from) })
        })
    }
}

/// A provider that hands out the same credential every time.
pub fn static_token(token: impl Into<String>) -> TokenProvider {
    let token: String = token.into();
    Box::new(move || -> TokenFuture {
        let token = token.clone();
        Box::pin(async move { Ok::<_, BoxError>(token) })
    })
}
