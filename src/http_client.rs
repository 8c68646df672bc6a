use anyhow::Context;
use reqwest::header::{self, HeaderValue};
use reqwest::{Client, Method, Request, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    token_data_from_payload, Identity, LoginRequest, LogoutOutcome, LogoutRequest, Navigator,
    RefreshCoordinator, Session, SessionStore, SessionTeardown, TeardownReason, TokenPayload,
};
use crate::config::{Config, Endpoints};
use crate::error::ApiError;

/// Per-call bookkeeping carried across the original attempt and its retry
#[derive(Debug, Clone)]
pub struct CallContext {
    pub method: Method,
    pub url: Url,
    /// Set once the call has been re-dispatched after a refresh
    pub retried: bool,
    /// The caller supplies its own Authorization header
    pub suppress_auth: bool,
}

/// A request ready for dispatch
pub struct ApiRequest {
    context: CallContext,
    request: Request,
}

impl ApiRequest {
    pub fn new(request: Request, suppress_auth: bool) -> Self {
        let context = CallContext {
            method: request.method().clone(),
            url: request.url().clone(),
            retried: false,
            suppress_auth,
        };
        Self { context, request }
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }
}

/// What the interceptor does with a failed response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the failure to the caller untouched
    Propagate,
    /// Refresh the session and retry once
    Refresh,
    /// End the session, then hand the failure to the caller
    Teardown,
}

/// Decide how to handle a failed response
///
/// Rules, first match wins: the logout call and public endpoints propagate;
/// calls carrying their own credentials propagate; a 401 refreshes if the call
/// has not been retried and the session can refresh, otherwise tears down;
/// everything else propagates.
pub fn classify(
    context: &CallContext,
    status: StatusCode,
    session: &Session,
    endpoints: &Endpoints,
) -> Disposition {
    let url = &context.url;
    if endpoints.is_logout(url) || endpoints.is_refresh(url) || endpoints.is_public(url) {
        return Disposition::Propagate;
    }
    if context.suppress_auth || status != StatusCode::UNAUTHORIZED {
        return Disposition::Propagate;
    }
    if context.retried || !session.can_refresh() {
        return Disposition::Teardown;
    }
    Disposition::Refresh
}

/// Successful response with its body already read
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    body: Vec<u8>,
}

impl ApiResponse {
    async fn read(response: reqwest::Response) -> Result<Self, ApiError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;
        Ok(Self {
            status,
            body: body.to_vec(),
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .context("Failed to parse response body")
            .map_err(ApiError::Internal)
    }

    /// Parse the body as the standard `{ data, customerMessage, responseCode }` envelope
    pub fn envelope<T: DeserializeOwned>(&self) -> Result<Envelope<T>, ApiError> {
        self.json()
    }
}

/// Standard response envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub customer_message: Option<String>,
    pub response_code: Option<serde_json::Value>,
}

/// Builder returned by [`ApiClient::request`]
pub struct ApiRequestBuilder<'a> {
    client: &'a ApiClient,
    builder: RequestBuilder,
    suppress_auth: bool,
}

impl<'a> ApiRequestBuilder<'a> {
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.builder = self.builder.header(key, value);
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        self.builder = self.builder.json(body);
        self
    }

    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> Self {
        self.builder = self.builder.query(query);
        self
    }

    /// Skip automatic bearer injection; the caller sets its own Authorization header
    pub fn suppress_auth(mut self) -> Self {
        self.suppress_auth = true;
        self
    }

    /// Set an explicit bearer credential; implies [`Self::suppress_auth`]
    pub fn bearer_auth(mut self, token: &str) -> Self {
        self.builder = self.builder.bearer_auth(token);
        self.suppress_auth = true;
        self
    }

    pub fn build(self) -> Result<ApiRequest, ApiError> {
        let request = self
            .builder
            .build()
            .context("Failed to build request")
            .map_err(ApiError::Internal)?;
        Ok(ApiRequest::new(request, self.suppress_auth))
    }

    pub async fn send(self) -> Result<ApiResponse, ApiError> {
        let client = self.client;
        let request = self.build()?;
        client.execute(request).await
    }
}

/// HTTP client that carries the session's credentials
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    endpoints: Endpoints,

    store: Arc<SessionStore>,

    refresher: RefreshCoordinator,

    teardown: SessionTeardown,

    /// Account type sent on login
    role: String,
}

impl ApiClient {
    /// Create a new client bound to `store`
    pub fn new(
        config: &Config,
        store: Arc<SessionStore>,
        navigator: Arc<dyn Navigator>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.http_max_connections)
            .connect_timeout(Duration::from_secs(config.http_connect_timeout))
            .timeout(Duration::from_secs(config.http_request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let endpoints = config.endpoints()?;
        let refresher =
            RefreshCoordinator::new(client.clone(), endpoints.refresh().clone(), store.clone());
        let teardown = SessionTeardown::new(store.clone(), navigator);

        Ok(Self {
            client,
            endpoints,
            store,
            refresher,
            teardown,
            role: config.role.clone(),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Start a request to `path`, relative to the base URL
    pub fn request(&self, method: Method, path: &str) -> ApiRequestBuilder<'_> {
        self.request_url(method, self.endpoints.resolve(path))
    }

    /// Start a request to an absolute URL
    pub fn request_url(&self, method: Method, url: impl reqwest::IntoUrl) -> ApiRequestBuilder<'_> {
        ApiRequestBuilder {
            client: self,
            builder: self.client.request(method, url),
            suppress_auth: false,
        }
    }

    pub fn get(&self, path: &str) -> ApiRequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> ApiRequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> ApiRequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> ApiRequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> ApiRequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    /// Dispatch a request, recovering an expired session at most once
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let ApiRequest {
            mut context,
            request,
        } = request;

        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        tracing::debug!(
            request_id = %request_id,
            method = %context.method,
            url = %context.url,
            "Sending HTTP request"
        );

        loop {
            let (attempt, bearer) = self.authorize(&context, &request)?;

            let response = match self.client.execute(attempt).await {
                Ok(response) => response,
                Err(e) => {
                    let error = ApiError::from_transport(&e);
                    tracing::warn!(
                        request_id = %request_id,
                        url = %context.url,
                        retried = context.retried,
                        error = %error,
                        "HTTP request error"
                    );
                    return Err(error);
                }
            };

            let status = response.status();
            if status.is_success() {
                tracing::debug!(request_id = %request_id, status = %status, "Request successful");
                return ApiResponse::read(response).await;
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(
                        request_id = %request_id,
                        status = status.as_u16(),
                        error = %e,
                        "Failed to read error response body"
                    );
                    Default::default()
                }
            };
            let session = self.store.get();
            let disposition = classify(&context, status, &session, &self.endpoints);

            tracing::debug!(
                request_id = %request_id,
                status = status.as_u16(),
                retried = context.retried,
                disposition = ?disposition,
                "Received error response"
            );

            match disposition {
                Disposition::Propagate => return Err(ApiError::from_status(status, &body)),

                Disposition::Teardown => {
                    tracing::warn!(
                        request_id = %request_id,
                        url = %context.url,
                        "Unauthorized and unrecoverable, ending session"
                    );
                    self.teardown
                        .run_if_current(&TeardownReason::SessionExpired, bearer.as_deref());
                    return Err(ApiError::from_status(status, &body));
                }

                Disposition::Refresh => {
                    context.retried = true;

                    // Another call already rotated the token this one was sent with
                    if bearer.is_some() && session.access_token.is_some() && bearer != session.access_token {
                        tracing::debug!(request_id = %request_id, "Token already rotated, retrying");
                        continue;
                    }

                    tracing::info!(request_id = %request_id, "Received 401, refreshing session and retrying");
                    if let Err(e) = self.refresher.refresh().await {
                        tracing::warn!(
                            request_id = %request_id,
                            status = ?e.status,
                            error = %e,
                            "Session refresh failed"
                        );
                        // Only the first waiter on a shared failed refresh ends the session
                        self.teardown
                            .run_if_current(&TeardownReason::RefreshFailed, bearer.as_deref());
                        return Err(ApiError::RefreshFailure(e.message));
                    }
                }
            }
        }
    }

    /// Copy the request for one attempt, attaching the current bearer token
    fn authorize(
        &self,
        context: &CallContext,
        request: &Request,
    ) -> Result<(Request, Option<String>), ApiError> {
        let mut attempt = request.try_clone().ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
        })?;

        if context.suppress_auth {
            return Ok((attempt, None));
        }

        let Some(token) = self.store.access_token() else {
            return Ok((attempt, None));
        };

        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Access token is not a valid header value")
            .map_err(ApiError::Internal)?;
        value.set_sensitive(true);
        attempt.headers_mut().insert(header::AUTHORIZATION, value);

        Ok((attempt, Some(token)))
    }

    /// Exchange credentials for a new session
    ///
    /// Failures, including a wrong password, are returned untouched and leave the
    /// current session as it was.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        tracing::info!(email = %email, role = %self.role, "Signing in...");

        let response = self
            .request_url(Method::POST, self.endpoints.login().clone())
            .suppress_auth()
            .header("x-role", self.role.as_str())
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let payload = TokenPayload::from_slice(response.bytes())
            .context("Failed to parse login response")
            .map_err(ApiError::Internal)?;

        let typed = Identity {
            email: Some(email.to_string()),
            ..Default::default()
        };
        let tokens = token_data_from_payload(payload, Some(typed))
            .map_err(|m| ApiError::Internal(anyhow::anyhow!(m)))?;

        self.store.begin(&tokens)?;
        tracing::info!(
            expires_at = ?tokens.expires_at.map(|t| t.to_rfc3339()),
            "Signed in"
        );

        Ok(self.store.get())
    }

    /// End the session
    ///
    /// The local session is always cleared and the navigator redirected. A 401 or
    /// 5xx from the backend does not stop the user from leaving; it only changes
    /// the message.
    pub async fn logout(&self) -> LogoutOutcome {
        let session = self.store.get();

        let outcome = match session.access_token.as_deref() {
            None => LogoutOutcome::AlreadyLoggedOut,
            Some(access_token) => {
                let result = self
                    .request_url(Method::POST, self.endpoints.logout().clone())
                    .bearer_auth(access_token)
                    .json(&LogoutRequest {
                        refresh_token: session.refresh_token.as_deref(),
                    })
                    .send()
                    .await;

                match result {
                    Ok(_) => LogoutOutcome::Completed,
                    Err(e) => {
                        tracing::warn!(error = %e, "Backend logout failed, signing out locally");
                        match e.status() {
                            Some(status) => LogoutOutcome::from_status(status),
                            None => LogoutOutcome::Degraded { status: None },
                        }
                    }
                }
            }
        };

        self.teardown.run(&TeardownReason::Logout(outcome.clone()));
        outcome
    }
}
