use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use futures::stream::Stream;

use crate::errors::GatewayError;

/// Byte stream used for both the inbound request body and the outbound response body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Request header carrying the client's wire protocol version (e.g. `version=2`).
pub const GIT_PROTOCOL_HEADER: &str = "git-protocol";

/// Suffix appended to a repository name to locate it under the base path.
pub const REPOSITORY_SUFFIX: &str = ".git";

/// HTTP methods accepted by the git CGI endpoints
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RequestMethod {
    Get,
    Post,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestMethod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(RequestMethod::Get),
            "POST" => Ok(RequestMethod::Post),
            _ => Err(GatewayError::MethodNotAllowed {
                method: s.to_string(),
                path_info: String::new(),
            }),
        }
    }
}

/// The fixed set of endpoints `git http-backend` serves below a repository.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum GitEndpoint {
    Head,
    InfoRefs,
    InfoPacks,
    LooseObject,
    Pack,
    PackIndex,
    UploadPack,
    UploadArchive,
    ReceivePack,
}

impl GitEndpoint {
    /// Classify a `PATH_INFO` value, validating the object and pack hash shapes.
    pub fn parse(path_info: &str) -> Option<Self> {
        match path_info {
            "/HEAD" => return Some(GitEndpoint::Head),
            "/info/refs" => return Some(GitEndpoint::InfoRefs),
            "/info/packs" => return Some(GitEndpoint::InfoPacks),
            "/git-upload-pack" => return Some(GitEndpoint::UploadPack),
            "/git-upload-archive" => return Some(GitEndpoint::UploadArchive),
            "/git-receive-pack" => return Some(GitEndpoint::ReceivePack),
            _ => {}
        }

        let rest = path_info.strip_prefix("/objects/")?;
        if let Some(file) = rest.strip_prefix("pack/") {
            let stem = file.strip_prefix("pack-")?;
            if let Some(hash) = stem.strip_suffix(".pack") {
                return is_pack_hash(hash).then_some(GitEndpoint::Pack);
            }
            if let Some(hash) = stem.strip_suffix(".idx") {
                return is_pack_hash(hash).then_some(GitEndpoint::PackIndex);
            }
            return None;
        }

        let (dir, file) = rest.split_once('/')?;
        let valid = dir.len() == 2
            && is_hex(dir)
            && (file.len() == 38 || file.len() == 62)
            && is_hex(file);
        valid.then_some(GitEndpoint::LooseObject)
    }

    /// The only method each endpoint accepts.
    pub fn method(&self) -> RequestMethod {
        match self {
            GitEndpoint::UploadPack | GitEndpoint::UploadArchive | GitEndpoint::ReceivePack => {
                RequestMethod::Post
            }
            _ => RequestMethod::Get,
        }
    }

    /// Whether the endpoint is one of the stateless RPC services.
    pub fn is_rpc(&self) -> bool {
        self.method() == RequestMethod::Post
    }
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_pack_hash(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && is_hex(s)
}

/// Resolved on-disk location of a repository: `{base}/{name}.git`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryPath(PathBuf);

impl RepositoryPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Location a repository name maps to under `base`, whether or not it exists.
    pub fn under(base: &Path, name: &str) -> Self {
        Self(base.join(format!("{name}{REPOSITORY_SUFFIX}")))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// Committer identity supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub login: String,
    pub display_name: String,
    pub email: String,
}

impl Identity {
    pub fn new(login: &str, display_name: &str, email: &str) -> Self {
        Self {
            login: login.to_string(),
            display_name: display_name.to_string(),
            email: email.to_string(),
        }
    }
}

/// Immutable description of one gateway invocation.
///
/// Built fresh per request by `GitRequestParameters::from_request` and discarded once the
/// invocation completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRequestParameters {
    pub repository_name: String,
    pub git_protocol_version: String,
    pub request_method: RequestMethod,
    pub path_info: String,
    pub query_string: String,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_encoding: String,
    pub remote_address: String,
    pub repository_path: RepositoryPath,
    pub identity: Identity,
}

impl GitRequestParameters {
    /// Declared request body length, `0` when the client sent none.
    pub fn content_length(&self) -> u64 {
        self.content_length.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fixed_endpoints() {
        assert_eq!(GitEndpoint::parse("/HEAD"), Some(GitEndpoint::Head));
        assert_eq!(GitEndpoint::parse("/info/refs"), Some(GitEndpoint::InfoRefs));
        assert_eq!(GitEndpoint::parse("/info/packs"), Some(GitEndpoint::InfoPacks));
        assert_eq!(
            GitEndpoint::parse("/git-receive-pack"),
            Some(GitEndpoint::ReceivePack)
        );
        assert_eq!(GitEndpoint::parse("/info"), None);
        assert_eq!(GitEndpoint::parse("info/refs"), None);
    }

    #[test]
    fn test_parse_object_paths() {
        let sha1 = "a".repeat(38);
        let sha256 = "b".repeat(62);
        assert_eq!(
            GitEndpoint::parse(&format!("/objects/ab/{sha1}")),
            Some(GitEndpoint::LooseObject)
        );
        assert_eq!(
            GitEndpoint::parse(&format!("/objects/0f/{sha256}")),
            Some(GitEndpoint::LooseObject)
        );
        assert_eq!(GitEndpoint::parse(&format!("/objects/zz/{sha1}")), None);
        assert_eq!(GitEndpoint::parse("/objects/ab/1234"), None);

        let pack = "c".repeat(40);
        assert_eq!(
            GitEndpoint::parse(&format!("/objects/pack/pack-{pack}.pack")),
            Some(GitEndpoint::Pack)
        );
        assert_eq!(
            GitEndpoint::parse(&format!("/objects/pack/pack-{}.idx", "d".repeat(64))),
            Some(GitEndpoint::PackIndex)
        );
        assert_eq!(
            GitEndpoint::parse(&format!("/objects/pack/pack-{pack}.rev")),
            None
        );
    }

    #[test]
    fn test_endpoint_methods() {
        assert_eq!(GitEndpoint::InfoRefs.method(), RequestMethod::Get);
        assert_eq!(GitEndpoint::UploadArchive.method(), RequestMethod::Post);
        assert!(GitEndpoint::UploadPack.is_rpc());
        assert!(!GitEndpoint::Pack.is_rpc());
        assert!("PUT".parse::<RequestMethod>().is_err());
        assert_eq!("POST".parse::<RequestMethod>().unwrap(), RequestMethod::Post);
    }

    #[test]
    fn test_repository_path_under_base() {
        let path = RepositoryPath::under(Path::new("/srv/git"), "demo");
        assert_eq!(path.as_path(), Path::new("/srv/git/demo.git"));
    }
}
