//! Publisher configuration
//!
//! Everything the client needs is passed in explicitly through [`WhipConfig`]
//! and the `publish` arguments; nothing is read from process globals.

use std::{fmt, str::FromStr, time::Duration};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WhipError};

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Settings bound to a [`crate::client::WhipClient`] at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhipConfig {
    /// WHIP endpoint the offer is POSTed to.
    pub url: String,
    /// Bearer token. Empty or missing means an unauthenticated endpoint.
    pub token: Option<String>,
    /// Deadline for each HTTP exchange.
    pub request_timeout_ms: u64,
    /// Deadline for ICE to connect after the answer was applied.
    pub connect_timeout_ms: u64,
    /// How long server-reflexive gathering may take.
    pub gather_timeout_ms: u64,
    /// Advertised video bandwidth in bits per second.
    pub video_bitrate: Option<u32>,
}

impl Default for WhipConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            gather_timeout_ms: 2_000,
            video_bitrate: None,
        }
    }
}

impl WhipConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> WhipConfig {
        WhipConfig {
            url: url.into(),
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn with_video_bitrate(mut self, bps: u32) -> WhipConfig {
        self.video_bitrate = Some(bps);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> WhipConfig {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> WhipConfig {
        self.gather_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// The token to send, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }

    /// Parses and checks the publish URL.
    pub fn publish_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| WhipError::Configuration(format!("publish url {:?}: {e}", self.url)))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(WhipError::Configuration(format!(
                "publish url must be http or https, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl IceScheme {
    fn default_port(self) -> u16 {
        match self {
            IceScheme::Stun | IceScheme::Turn => 3478,
            IceScheme::Stuns | IceScheme::Turns => 5349,
        }
    }

    pub fn is_turn(self) -> bool {
        matches!(self, IceScheme::Turn | IceScheme::Turns)
    }
}

/// One ICE server URL, e.g. `stun:stun.l.google.com:19302`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IceServer {
    url: String,
    scheme: IceScheme,
    host: String,
    port: u16,
}

impl IceServer {
    pub fn parse(url: &str) -> Result<IceServer> {
        let invalid = |reason: &str| {
            WhipError::Configuration(format!("invalid ICE server {url:?}: {reason}"))
        };

        let (scheme, rest) = url.split_once(':').ok_or_else(|| invalid("missing scheme"))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "stun" => IceScheme::Stun,
            "stuns" => IceScheme::Stuns,
            "turn" => IceScheme::Turn,
            "turns" => IceScheme::Turns,
            _ => return Err(invalid("scheme must be stun, stuns, turn or turns")),
        };

        // Query parameters such as ?transport=udp do not change the address.
        let rest = rest.split('?').next().unwrap_or_default();
        if rest.starts_with("//") {
            return Err(invalid("ICE server URLs have no authority part"));
        }

        let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(|| invalid("unclosed ["))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p),
                None if tail.is_empty() => None,
                None => return Err(invalid("garbage after IPv6 address")),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => scheme.default_port(),
        };

        Ok(IceServer {
            url: url.to_string(),
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// Parses a list, failing on the first invalid entry.
    pub fn parse_all<S: AsRef<str>>(urls: &[S]) -> Result<Vec<IceServer>> {
        urls.iter().map(|u| IceServer::parse(u.as_ref())).collect()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> IceScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` suitable for DNS resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for IceServer {
    type Err = WhipError;

    fn from_str(s: &str) -> Result<IceServer> {
        IceServer::parse(s)
    }
}

impl TryFrom<String> for IceServer {
    type Error = WhipError;

    fn try_from(s: String) -> Result<IceServer> {
        IceServer::parse(&s)
    }
}

impl From<IceServer> for String {
    fn from(s: IceServer) -> String {
        s.url
    }
}

impl fmt::Display for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}
