//! Git smart HTTP server backed by `git http-backend`.
//!
//! Repositories are served from `{base_path}/{name}.git`. Configuration comes from an
//! optional JSON file given as the first argument, then `GIT_GATEWAY_BASE_PATH` and
//! `GIT_GATEWAY_GIT_BINARY` override it. Without either, `./repos` is served.
//!
//! Quick test (two terminals):
//! A) Prepare a bare repo and start the server:
//! ```bash
//! mkdir -p /tmp/git-http-demo && git init --bare /tmp/git-http-demo/demo.git
//! git -C /tmp/git-http-demo/demo.git config http.receivepack true
//! GIT_GATEWAY_BASE_PATH=/tmp/git-http-demo cargo run --example http_server
//! ```
//!
//! B) Verify info/refs, push, then clone:
//! ```bash
//! curl -i "http://127.0.0.1:3000/demo/info/refs?service=git-upload-pack"
//! mkdir -p /tmp/demo-src && cd /tmp/demo-src
//! git init && echo hello > README.md && git add README.md && git commit -m "init"
//! git remote add origin http://127.0.0.1:3000/demo
//! git push -u origin HEAD
//! git clone http://127.0.0.1:3000/demo /tmp/demo-clone
//! ```
//! `http.receivepack` is needed because the backend refuses anonymous pushes otherwise.
//!
//! Set `RUST_LOG=git_http_gateway=debug` to see state transitions per request.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use git_http_gateway::{
    GatewayConfig, GatewayError, GitHttpGateway,
    protocol::{AnonymousIdentity, FsRepositoryResolver, router},
};
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<GatewayConfig, GatewayError> {
    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_json_file(&PathBuf::from(path))?,
        None => GatewayConfig::default(),
    };
    config.with_env_overrides().validated()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let resolver = FsRepositoryResolver::new(&config.base_path);
    tracing::info!(base_path = %config.base_path.display(), "serving repositories");

    let gateway = Arc::new(GitHttpGateway::new(config, resolver, AnonymousIdentity));
    let app = router(gateway);

    let addr = "0.0.0.0:3000";
    println!("HTTP Git gateway on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
