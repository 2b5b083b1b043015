//! Fetcher that plays back canned results over a [`MockControlLink`]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tova_control::MockControlLink;
use tova_core::StreamStatus;

use crate::fetch::{FetchErrorKind, Fetcher};

/// Each fetch opens a NEW stream on the mock link under its SOCKS username,
/// waits for the engine to attach it, then completes the stream and returns
/// the next scripted result
pub struct ScriptedFetcher {
    link: MockControlLink,
    results: Mutex<VecDeque<String>>,
    attach_timeout: Duration,
}

impl ScriptedFetcher {
    pub fn new(link: MockControlLink, results: &[&str]) -> Self {
        Self {
            link,
            results: Mutex::new(results.iter().map(|r| r.to_string()).collect()),
            attach_timeout: Duration::from_secs(2),
        }
    }

    /// How long a fetch waits for its stream to be attached
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Scripted results not consumed yet
    pub fn remaining(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn next_result(&self) -> Option<String> {
        self.results.lock().ok()?.pop_front()
    }
}

/// `scheme://host/path` → `host:port`
pub(crate) fn stream_target(url: &str) -> String {
    let (scheme, rest) = url.split_once("://").unwrap_or(("http", url));
    let host = rest.split('/').next().unwrap_or(rest);
    let port = if scheme == "https" { 443 } else { 80 };
    format!("{}:{}", host, port)
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, socks_user: &str) -> String {
        let stream = self.link.open_stream_as(&stream_target(url), socks_user);
        match self
            .link
            .wait_for_attachment(&stream, self.attach_timeout)
            .await
        {
            Some(_) => {
                self.link.set_stream_status(&stream, StreamStatus::Succeeded);
                self.next_result()
                    .unwrap_or_else(|| FetchErrorKind::Request.result())
            }
            None => FetchErrorKind::Timeout.result(),
        }
    }
}
