//! Thin JSON client for the REST-backed providers.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::ProviderError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Bearer-token authenticated API endpoint.
#[derive(Clone)]
pub(crate) struct ApiClient {
    base_url: String,
    token: String,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub(crate) fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        operation: &str,
    ) -> Result<T, ProviderError> {
        let body = self.send::<()>(Method::GET, path, None, operation).await?;
        parse(&body, operation)
    }

    pub(crate) async fn post<B, T>(
        &self,
        path: &str,
        payload: &B,
        operation: &str,
    ) -> Result<T, ProviderError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let body = self
            .send(Method::POST, path, Some(payload), operation)
            .await?;
        parse(&body, operation)
    }

    /// Issues a POST whose response body is ignored.
    pub(crate) async fn post_empty<B>(
        &self,
        path: &str,
        payload: &B,
        operation: &str,
    ) -> Result<(), ProviderError>
    where
        B: Serialize + Sync + ?Sized,
    {
        self.send(Method::POST, path, Some(payload), operation)
            .await
            .map(drop)
    }

    /// Deletes a resource. A 404 is reported as [`ProviderError::NotFound`]
    /// so callers can treat already-gone resources as deleted.
    pub(crate) async fn delete(&self, path: &str, operation: &str) -> Result<(), ProviderError> {
        self.send::<()>(Method::DELETE, path, None, operation)
            .await
            .map(drop)
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&B>,
        operation: &str,
    ) -> Result<Vec<u8>, ProviderError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let url = format!("{}{path}", self.base_url);
        let mut request = HTTP_CLIENT.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = payload {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| ProviderError::Api {
            operation: operation.to_owned(),
            message: err.to_string(),
        })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Api {
                operation: operation.to_owned(),
                message: err.to_string(),
            })?
            .to_vec();

        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                kind: operation.to_owned(),
                name: path.to_owned(),
            });
        }
        Err(ProviderError::Api {
            operation: operation.to_owned(),
            message: format!("HTTP {status}: {}", String::from_utf8_lossy(&body).trim()),
        })
    }
}

fn parse<T: DeserializeOwned>(body: &[u8], operation: &str) -> Result<T, ProviderError> {
    serde_json::from_slice(body).map_err(|err| ProviderError::Parse {
        resource: operation.to_owned(),
        message: err.to_string(),
    })
}

/// Fetches a plain-text document without authentication.
pub(crate) async fn fetch_text(url: &str, operation: &str) -> Result<String, ProviderError> {
    let api_error = |err: reqwest::Error| ProviderError::Api {
        operation: operation.to_owned(),
        message: err.to_string(),
    };
    let response = HTTP_CLIENT
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(api_error)?;
    response.text().await.map_err(api_error)
}
