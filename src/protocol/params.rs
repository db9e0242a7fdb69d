//! CGI parameter builder: turns the metadata of one inbound request plus the resolved
//! repository and identity into `GitRequestParameters` and the ordered environment the
//! backend is started with. Everything here is pure; nothing touches the filesystem.

use std::net::SocketAddr;

use axum::http::{HeaderMap, header};

use super::types::{
    GIT_PROTOCOL_HEADER, GitEndpoint, GitRequestParameters, Identity, RepositoryPath,
    RequestMethod,
};
use crate::errors::GatewayError;

/// Request metadata handed over by the routing layer; the body travels separately.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: RequestMethod,
    pub repository: String,
    /// Always starts with `/`, e.g. `/info/refs`.
    pub path_info: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestHead {
    /// Check that `path_info` names a backend endpoint and the method fits it.
    pub fn endpoint(&self) -> Result<GitEndpoint, GatewayError> {
        let endpoint = GitEndpoint::parse(&self.path_info).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("unknown git endpoint {}", self.path_info))
        })?;
        if endpoint.method() != self.method {
            return Err(GatewayError::MethodNotAllowed {
                method: self.method.to_string(),
                path_info: self.path_info.clone(),
            });
        }
        Ok(endpoint)
    }

    fn header_str(&self, name: impl header::AsHeaderName) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}

/// Ordered CGI environment for one backend invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnvironment {
    vars: Vec<(&'static str, String)>,
}

impl CgiEnvironment {
    fn set(&mut self, name: &'static str, value: impl Into<String>) {
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.vars.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl GitRequestParameters {
    pub fn from_request(
        head: &RequestHead,
        repository_path: RepositoryPath,
        identity: Identity,
    ) -> Self {
        let content_length = head
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            repository_name: head.repository.clone(),
            git_protocol_version: head.header_str(GIT_PROTOCOL_HEADER).to_string(),
            request_method: head.method,
            path_info: head.path_info.clone(),
            query_string: head.query.clone(),
            content_type: head.header_str(header::CONTENT_TYPE).to_string(),
            content_length,
            content_encoding: head.header_str(header::CONTENT_ENCODING).to_string(),
            remote_address: head
                .remote_addr
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default(),
            repository_path,
            identity,
        }
    }

    /// Build the CGI environment; `GIT_PROJECT_ROOT` is the repository directory that
    /// also serves as the backend's working directory.
    pub fn environment(&self) -> CgiEnvironment {
        let mut env = CgiEnvironment::default();
        env.set("GIT_HTTP_EXPORT_ALL", "1");
        env.set("HTTP_GIT_PROTOCOL", self.git_protocol_version.as_str());
        env.set("REQUEST_METHOD", self.request_method.as_str());
        env.set(
            "GIT_PROJECT_ROOT",
            self.repository_path.as_path().to_string_lossy(),
        );
        env.set("PATH_INFO", self.path_info.as_str());
        env.set("QUERY_STRING", self.query_string.as_str());
        env.set("CONTENT_TYPE", self.content_type.as_str());
        // git http-backend reads until EOF when CONTENT_LENGTH is empty, which is what a
        // chunked upload needs.
        env.set(
            "CONTENT_LENGTH",
            self.content_length
                .map(|len| len.to_string())
                .unwrap_or_default(),
        );
        env.set("HTTP_CONTENT_ENCODING", self.content_encoding.as_str());
        env.set("REMOTE_USER", self.identity.login.as_str());
        env.set("REMOTE_ADDR", self.remote_address.as_str());
        env.set("GIT_COMMITTER_NAME", self.identity.display_name.as_str());
        env.set("GIT_COMMITTER_EMAIL", self.identity.email.as_str());
        env
    }
}
