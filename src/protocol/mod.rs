/// Git smart HTTP gateway module
///
/// This module bridges repository-scoped HTTP requests to the `git http-backend` CGI
/// program. Parameter building, process launch, both byte pumps and the CGI header
/// parser are separate pieces; `http` sequences them for one request.
pub mod core;
pub mod headers;
pub mod http;
pub mod params;
pub mod process;
pub mod pump;
pub mod types;

// Re-export main interfaces
pub use core::{
    AnonymousIdentity, FsRepositoryResolver, IdentityProvider, RepositoryResolver,
    StaticIdentityProvider,
};
pub use http::{GatewayResponse, GitHttpGateway, GitHttpRequest, router};
pub use types::*;
