//! Shared-secret bearer token gate.
//!
//! The accepted token set is loaded once at startup and never changes while
//! the server runs. Tokens are held as SHA-256 digests so the raw secrets do
//! not sit in memory next to session state.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Query parameter carrying the token on the upgrade request.
pub const TOKEN_QUERY_PARAM: &str = "token";
/// Header consulted when the query parameter is absent.
pub const TOKEN_HEADER: &str = "x-terminal-token";

/// Immutable set of accepted tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenGate {
    digests: HashSet<[u8; 32]>,
}

impl TokenGate {
    /// Build a gate from the configured tokens. Blank entries are ignored.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests = tokens
            .into_iter()
            .filter(|t| !t.as_ref().is_empty())
            .map(|t| digest(t.as_ref()))
            .collect();
        Self { digests }
    }

    /// True iff the credential is present and in the accepted set.
    pub fn authorize(&self, credential: Option<&str>) -> bool {
        match credential {
            Some(token) if !token.is_empty() => self.digests.contains(&digest(token)),
            _ => false,
        }
    }

    /// Number of accepted tokens.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Extract the credential from an upgrade request: the `token` query
/// parameter wins, then the `x-terminal-token` header.
pub fn request_credential(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == TOKEN_QUERY_PARAM)
            .map(|(_, value)| value.into_owned())
    });

    from_query.or_else(|| {
        request
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}
