//! Challenge fetches through the overlay's SOCKS port

use async_trait::async_trait;
use std::time::Duration;
use tova_core::{Result, TovaError};
use tracing::debug;

use crate::tally::ERROR_PREFIX;

/// One vote-bearing fetch
///
/// Never fails: transport and HTTP errors come back as `ERR:<kind>` strings
/// and are tallied like any other result.
///
/// The stream a fetch opens must present `socks_user` as its SOCKS username;
/// the engine finds the fetch's stream, and so its exit, by that name.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, socks_user: &str) -> String;
}

/// Coarse classes of fetch failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    ConnError,
    HttpStatus(u16),
    Redirect,
    Body,
    Request,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timeout"),
            Self::ConnError => write!(f, "ConnError"),
            Self::HttpStatus(code) => write!(f, "HttpStatus:{}", code),
            Self::Redirect => write!(f, "Redirect"),
            Self::Body => write!(f, "Body"),
            Self::Request => write!(f, "Request"),
        }
    }
}

impl FetchErrorKind {
    pub fn of(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::ConnError
        } else if let Some(status) = error.status() {
            Self::HttpStatus(status.as_u16())
        } else if error.is_redirect() {
            Self::Redirect
        } else if error.is_body() || error.is_decode() {
            Self::Body
        } else {
            Self::Request
        }
    }

    /// The vote string for this failure
    pub fn result(&self) -> String {
        format!("{}{}", ERROR_PREFIX, self)
    }
}

/// SOCKS password sent alongside the per-fetch username
const SOCKS_PASSWORD: &str = "tova";

/// Fetcher routing every request through a SOCKS proxy with remote DNS
///
/// Each fetch gets its own client authenticating with its own SOCKS
/// username, which also keeps the overlay from sharing circuits between
/// fetches.
#[derive(Debug, Clone)]
pub struct OverlayFetcher {
    proxy: reqwest::Url,
    timeout: Duration,
}

impl OverlayFetcher {
    /// `proxy` is a `socks5h://host:port` URL; redirects are never followed
    pub fn new(proxy: &str, timeout: Duration) -> Result<Self> {
        let proxy = reqwest::Url::parse(proxy)
            .map_err(|e| TovaError::Other(format!("invalid proxy {}: {}", proxy, e)))?;
        let fetcher = Self { proxy, timeout };
        fetcher
            .client_for("tova")
            .map_err(|e| TovaError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(fetcher)
    }

    fn client_for(&self, socks_user: &str) -> std::result::Result<reqwest::Client, reqwest::Error> {
        let mut proxy = self.proxy.clone();
        // Only fails for URLs without a host, which Proxy::all rejects below
        let _ = proxy.set_username(socks_user);
        let _ = proxy.set_password(Some(SOCKS_PASSWORD));
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy)?)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .build()
    }

    async fn try_fetch(
        &self,
        url: &str,
        socks_user: &str,
    ) -> std::result::Result<String, reqwest::Error> {
        self.client_for(socks_user)?
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl Fetcher for OverlayFetcher {
    async fn fetch(&self, url: &str, socks_user: &str) -> String {
        match self.try_fetch(url, socks_user).await {
            Ok(body) => body,
            Err(e) => {
                let kind = FetchErrorKind::of(&e);
                debug!("Fetch of {} failed ({}): {}", url, kind, e);
                kind.result()
            }
        }
    }
}
