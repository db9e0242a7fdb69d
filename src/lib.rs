//! git-http-gateway: serve Git's smart HTTP protocol (clone, fetch, push) by bridging
//! HTTP requests to the `git http-backend` CGI program.
//!
//! Goals
//! - Stream request and response bodies end to end so pack transfers of any size pass
//!   through without being buffered.
//! - Parse the CGI header block incrementally, correct under any read chunking.
//! - Tie the backend process to the request: it never outlives the invocation.
//!
//! Modules
//! - `protocol::params`: request metadata → `GitRequestParameters` + CGI environment.
//! - `protocol::process`: launching `git http-backend` as a scoped `BackendProcess`.
//! - `protocol::pump`: request body → stdin, stdout → response body.
//! - `protocol::headers`: the CGI header state machine.
//! - `protocol::http`: the orchestrator and an axum router for the inbound surface.
//! - `protocol::core`: repository and identity collaborator traits.
//! - `config`, `errors`: configuration and the unified error type.
//!
//! Typical Usage
//! - Build a `GitHttpGateway` from a `GatewayConfig`, a `RepositoryResolver` and an
//!   `IdentityProvider`, then mount `protocol::router(Arc::new(gateway))` in an axum app.
//! - Or call `GitHttpGateway::serve` directly with a `GitHttpRequest` from another server.

pub mod config;
pub mod errors;
pub mod protocol;

pub use config::{GatewayConfig, HeaderPolicy, PumpMode};
pub use errors::GatewayError;
pub use protocol::{
    GatewayResponse, GitHttpGateway, GitHttpRequest, IdentityProvider, RepositoryResolver,
    router,
};
