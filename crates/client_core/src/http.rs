use std::sync::Arc;

use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    error::ApiFailure,
    protocol::{codes, Envelope},
};
use tracing::debug;

use crate::auth::{CredentialStore, TokenCoordinator};

/// Per-call-site request policy. Each endpoint declares the envelope codes
/// it considers successful; there is no global success constant.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub success_codes: Vec<&'static str>,
    pub retry_on_unauthorized: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            success_codes: vec![codes::OK, codes::CREATED, codes::SUCCESS],
            retry_on_unauthorized: true,
        }
    }
}

impl RequestOptions {
    pub fn with_success_codes(success_codes: &[&'static str]) -> Self {
        Self {
            success_codes: success_codes.to_vec(),
            ..Self::default()
        }
    }
}

/// Every HTTP call to the backend goes through here: bearer credential
/// attached, envelope decoded, and a credential-class failure recovered
/// once via the coordinator before it surfaces.
pub struct ApiClient {
    http: Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    tokens: Arc<TokenCoordinator>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        store: Arc<dyn CredentialStore>,
        tokens: Arc<TokenCoordinator>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
            tokens,
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiFailure> {
        self.request(Method::GET, path, None, options).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T, ApiFailure> {
        let body = encode_body(body)?;
        self.request(Method::POST, path, Some(body), options).await
    }

    /// For endpoints whose success envelope carries no payload.
    pub async fn patch_unit<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<(), ApiFailure> {
        let body = encode_body(body)?;
        self.send_with_refresh(Method::PATCH, path, Some(body), &options)
            .await?;
        Ok(())
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T, ApiFailure> {
        let (status, envelope) = self
            .send_with_refresh(method, path, body, &options)
            .await?;
        let data = envelope.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|_| ApiFailure::Http { status })
    }

    /// On a credential-class failure, refresh once and retry once with the
    /// retry disabled; a second failure of any kind surfaces unchanged.
    async fn send_with_refresh(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> Result<(u16, Envelope<Value>), ApiFailure> {
        match self
            .send_once(method.clone(), path, body.clone(), options)
            .await
        {
            Err(failure) if failure.is_auth_failure() && options.retry_on_unauthorized => {
                if !self.tokens.refresh().await {
                    return Err(failure);
                }
                debug!(path, "credential refreshed; retrying request once");
                self.send_once(method, path, body, options).await
            }
            outcome => outcome,
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> Result<(u16, Envelope<Value>), ApiFailure> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(tokens) = self.store.load().await {
            request = request.bearer_auth(&tokens.access_token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ApiFailure::Network(err.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ApiFailure::Network(err.to_string()))?;

        match serde_json::from_slice::<Envelope<Value>>(&bytes) {
            Ok(envelope) if envelope.is_success(&options.success_codes) => Ok((status, envelope)),
            Ok(envelope) => Err(ApiFailure::Business {
                code: envelope.code,
                message: envelope.message,
                payload: envelope.data,
            }),
            Err(_) => Err(ApiFailure::Http { status }),
        }
    }
}

fn encode_body<B: Serialize>(body: &B) -> Result<Value, ApiFailure> {
    serde_json::to_value(body).map_err(|err| ApiFailure::Network(err.to_string()))
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
