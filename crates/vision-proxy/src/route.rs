use std::borrow::Cow;
use std::fmt;

use axum::http::{Method, Uri};
use reqwest::Url;
use thiserror::Error;

const CHAT_COMPLETIONS_SUFFIX: &str = "/v1/chat/completions";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("path must embed an absolute http:// or https:// URL, got '{0}'")]
    MissingScheme(String),
    #[error("embedded URL '{url}' is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Transform,
    Passthrough,
}

impl RouteClass {
    /// Only `POST` to a chat-completions URL is rewritten.
    pub fn classify(method: &Method, target: &UpstreamTarget) -> Self {
        if *method == Method::POST && target.is_chat_completions() {
            Self::Transform
        } else {
            Self::Passthrough
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transform => "transform",
            Self::Passthrough => "passthrough",
        }
    }
}

/// Absolute upstream URL recovered from the inbound path, e.g.
/// `/http://10.0.0.1:7000/v1/models?limit=5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    url: Url,
}

impl UpstreamTarget {
    pub fn from_uri(uri: &Uri) -> Result<Self, RouteError> {
        Self::parse(uri.path(), uri.query())
    }

    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, RouteError> {
        let embedded = restore_scheme_separator(path.strip_prefix('/').unwrap_or(path));
        let lower = embedded.to_ascii_lowercase();
        if !lower.starts_with("http://") && !lower.starts_with("https://") {
            return Err(RouteError::MissingScheme(embedded.into_owned()));
        }

        let mut url = Url::parse(&embedded).map_err(|e| RouteError::InvalidUrl {
            url: embedded.to_string(),
            reason: e.to_string(),
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(RouteError::InvalidUrl {
                url: embedded.into_owned(),
                reason: "missing host".to_string(),
            });
        }
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.set_query(Some(query));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_chat_completions(&self) -> bool {
        self.url
            .path()
            .trim_end_matches('/')
            .ends_with(CHAT_COMPLETIONS_SUFFIX)
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.url, f)
    }
}

// Some clients and reverse proxies merge `//` in paths, turning
// `http://host` into `http:/host`.
fn restore_scheme_separator(embedded: &str) -> Cow<'_, str> {
    for scheme in ["http:", "https:"] {
        let Some(prefix) = embedded.get(..scheme.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(scheme) {
            continue;
        }
        let rest = &embedded[scheme.len()..];
        if rest.starts_with('/') && !rest.starts_with("//") {
            return Cow::Owned(format!("{scheme}/{rest}"));
        }
    }
    Cow::Borrowed(embedded)
}
