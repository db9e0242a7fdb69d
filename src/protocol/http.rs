//! Gateway orchestrator and the axum adapter that feeds it.
//!
//! One invocation walks `Resolving → Launching → WritingRequest → ParsingHeaders →
//! StreamingBody → Completed`, or drops to `Failed` from any of them. `Completed` is
//! reached inside the response body once the backend's stdout closes. The backend
//! process is created in `Launching` and from then on lives inside a `BackendProcess`,
//! so every early return, cancellation, or dropped response tears it down.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    core::{IdentityProvider, RepositoryResolver},
    headers::{CgiHeaderParser, HeaderOutcome},
    params::RequestHead,
    process::BackendProcess,
    pump::{pump_request, response_body},
    types::{BodyStream, GitRequestParameters, RequestMethod},
};
use crate::config::{GatewayConfig, PumpMode};
use crate::errors::GatewayError;

/// One inbound request: metadata plus the still-unread body.
pub struct GitHttpRequest {
    pub head: RequestHead,
    pub body: BodyStream,
}

/// Response head from the CGI header block and the streaming body behind it.
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Stage of a gateway invocation, recorded for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Resolving,
    Launching,
    WritingRequest,
    ParsingHeaders,
    StreamingBody,
    Completed,
    Failed,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Git smart HTTP gateway
///
/// Holds only read-only configuration and the two collaborators, so a single instance
/// is shared by all concurrent requests; each call owns its own backend process.
pub struct GitHttpGateway<R: RepositoryResolver, I: IdentityProvider> {
    config: Arc<GatewayConfig>,
    resolver: R,
    identity: I,
}

impl<R: RepositoryResolver, I: IdentityProvider> GitHttpGateway<R, I> {
    pub fn new(config: GatewayConfig, resolver: R, identity: I) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            identity,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run one invocation. The returned body keeps streaming from the backend after
    /// this resolves; dropping it kills the backend.
    pub async fn serve(&self, request: GitHttpRequest) -> Result<GatewayResponse, GatewayError> {
        self.serve_inner(request, None).await
    }

    /// Like [`serve`](Self::serve), but `cancel` aborts the invocation at any suspension
    /// point, including while the response body is still streaming.
    pub async fn serve_with_cancellation(
        &self,
        request: GitHttpRequest,
        cancel: CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!("git gateway request cancelled");
                Err(GatewayError::Cancelled)
            }
            result = self.serve_inner(request, Some(cancel.clone())) => result,
        }
    }

    async fn serve_inner(
        &self,
        request: GitHttpRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<GatewayResponse, GatewayError> {
        let span = tracing::info_span!(
            "git_gateway",
            request_id = %Uuid::new_v4(),
            repo = %request.head.repository,
            path_info = %request.head.path_info,
        );
        async move {
            let mut state = GatewayState::Resolving;
            let result = self.run(request, cancel, &mut state).await;
            if let Err(e) = &result {
                tracing::error!(stage = %state, "git gateway failed: {}", e);
                enter(&mut state, GatewayState::Failed);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: GitHttpRequest,
        cancel: Option<CancellationToken>,
        state: &mut GatewayState,
    ) -> Result<GatewayResponse, GatewayError> {
        let GitHttpRequest { head, body } = request;

        // Resolving: nothing is spawned until both collaborators have answered.
        head.endpoint()?;
        let repository = self.resolver.resolve_repository(&head.repository).await?;
        let identity = self.identity.current_identity(&head.headers).await?;
        let params = GitRequestParameters::from_request(&head, repository, identity);

        enter(state, GatewayState::Launching);
        let mut process = BackendProcess::spawn(&self.config, &params)?;
        let stdin = process.take_stdin()?;
        let mut stdout = process.take_stdout()?;

        enter(state, GatewayState::WritingRequest);
        match self.config.pump_mode {
            PumpMode::Sequential => {
                pump_request(body, stdin).await?;
            }
            PumpMode::Concurrent => {
                process.attach_request_pump(tokio::spawn(
                    pump_request(body, stdin).in_current_span(),
                ));
            }
        }

        enter(state, GatewayState::ParsingHeaders);
        let outcome = CgiHeaderParser::new()
            .read_from(
                &mut stdout,
                self.config.header_policy,
                self.config.read_buffer_size,
            )
            .await?;

        match outcome {
            HeaderOutcome::Complete {
                headers,
                body_prefix,
            } => {
                enter(state, GatewayState::StreamingBody);
                let body = response_body(
                    body_prefix,
                    stdout,
                    process,
                    self.config.read_buffer_size,
                    cancel,
                );
                Ok(GatewayResponse {
                    status: headers.status,
                    headers: headers.headers,
                    body,
                })
            }
            HeaderOutcome::Truncated { headers } => {
                // No terminator means no body; stop the backend instead of draining it.
                drop(stdout);
                process.kill();
                process.finish().await?;
                enter(state, GatewayState::Completed);
                Ok(GatewayResponse {
                    status: headers.status,
                    headers: headers.headers,
                    body: Box::pin(futures::stream::empty()),
                })
            }
        }
    }
}

fn enter(state: &mut GatewayState, next: GatewayState) {
    log_transition(*state, next);
    *state = next;
}

/// Also used by the response pump, which finishes the invocation after `run` returned.
pub(super) fn log_transition(from: GatewayState, to: GatewayState) {
    tracing::debug!(%from, %to, "git gateway transition");
}

/// Build the router for the inbound HTTP surface: every `/{repo}/...` path is handed to
/// the gateway, which validates it against the backend's endpoints.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` to populate
/// `REMOTE_ADDR`.
pub fn router<R, I>(gateway: Arc<GitHttpGateway<R, I>>) -> Router
where
    R: RepositoryResolver + 'static,
    I: IdentityProvider + 'static,
{
    Router::new()
        .route(
            "/{repo}/{*path}",
            get(serve_git::<R, I>).post(serve_git::<R, I>),
        )
        .with_state(gateway)
}

async fn serve_git<R, I>(
    State(gateway): State<Arc<GitHttpGateway<R, I>>>,
    Path((repo, path)): Path<(String, String)>,
    request: Request,
) -> Response
where
    R: RepositoryResolver + 'static,
    I: IdentityProvider + 'static,
{
    let (parts, body) = request.into_parts();
    let path_info = format!("/{path}");
    let method = match parts.method.as_str().parse::<RequestMethod>() {
        Ok(method) => method,
        Err(_) => {
            return GatewayError::MethodNotAllowed {
                method: parts.method.to_string(),
                path_info,
            }
            .into_response();
        }
    };

    let head = RequestHead {
        method,
        repository: repo,
        path_info,
        query: parts.uri.query().unwrap_or_default().to_string(),
        remote_addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0),
        headers: parts.headers,
    };
    let body: BodyStream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other)),
    );

    match gateway.serve(GitHttpRequest { head, body }).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}
