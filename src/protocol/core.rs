//! Collaborator interfaces the gateway consumes.
//!
//! Repository lookup and identity resolution are owned by the surrounding
//! application; the gateway only needs the two narrow traits below. Filesystem and
//! static implementations are provided for servers that need nothing more.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::errors::GatewayError;
use crate::protocol::types::{Identity, RepositoryPath};

/// Repository lookup trait
///
/// Resolves a repository name taken from the request path to its on-disk location.
#[async_trait]
pub trait RepositoryResolver: Send + Sync {
    /// Resolve `name` or fail with `GatewayError::RepositoryNotFound`
    async fn resolve_repository(&self, name: &str) -> Result<RepositoryPath, GatewayError>;
}

/// Identity provider trait
///
/// Authentication has already happened by the time the gateway runs; this only maps
/// the authenticated request to the committer identity the backend should record.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self, headers: &HeaderMap) -> Result<Identity, GatewayError>;
}

/// Resolves `name` to `{base}/{name}.git` when that directory exists.
#[derive(Clone, Debug)]
pub struct FsRepositoryResolver {
    base_path: PathBuf,
}

impl FsRepositoryResolver {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl RepositoryResolver for FsRepositoryResolver {
    async fn resolve_repository(&self, name: &str) -> Result<RepositoryPath, GatewayError> {
        // Reject traversal before touching the filesystem.
        if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(GatewayError::invalid_request("invalid repository name"));
        }

        let path = RepositoryPath::under(&self.base_path, name);
        match tokio::fs::metadata(path.as_path()).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(GatewayError::repository_not_found(name)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GatewayError::repository_not_found(name))
            }
            Err(e) => Err(GatewayError::Io(e)),
        }
    }
}

/// Identity provider that returns the same identity for every request.
#[derive(Clone, Debug)]
pub struct StaticIdentityProvider {
    identity: Identity,
}

impl StaticIdentityProvider {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn current_identity(&self, _headers: &HeaderMap) -> Result<Identity, GatewayError> {
        Ok(self.identity.clone())
    }
}

/// Identity provider for anonymous access: empty login, placeholder committer.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousIdentity;

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn current_identity(&self, _headers: &HeaderMap) -> Result<Identity, GatewayError> {
        Ok(Identity::new("", "anonymous", "anonymous@localhost"))
    }
}
