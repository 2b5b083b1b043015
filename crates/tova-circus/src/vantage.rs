//! Public IPv4 discovery for the guard prefix boost

use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, warn};

pub const DISCOVERY_URL: &str = "https://ipv4.icanhazip.com/";

const MAX_ATTEMPTS: u32 = 3;

/// Ask an echo service for this host's public IPv4 address
///
/// Tries up to three times, sleeping `2^attempt` seconds after each failure.
/// Returns `None` when every attempt fails.
pub async fn discover_vantage_ip(client: &reqwest::Client, url: &str) -> Option<Ipv4Addr> {
    for attempt in 1..=MAX_ATTEMPTS {
        match fetch_ip(client, url).await {
            Ok(ip) => {
                debug!("Vantage IP is {}", ip);
                return Some(ip);
            }
            Err(e) => {
                warn!(
                    "Vantage IP discovery failed (attempt {}/{}): {}",
                    attempt, MAX_ATTEMPTS, e
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }
    }
    None
}

async fn fetch_ip(client: &reqwest::Client, url: &str) -> Result<Ipv4Addr, String> {
    let body = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| format!("request failed: {}", e))?
        .text()
        .await
        .map_err(|e| format!("unreadable body: {}", e))?;
    parse_ip(&body)
}

fn parse_ip(body: &str) -> Result<Ipv4Addr, String> {
    body.trim()
        .parse()
        .map_err(|_| format!("not an IPv4 address: {:?}", body.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip("203.0.113.9\n"), Ok(Ipv4Addr::new(203, 0, 113, 9)));
        assert!(parse_ip("<html>").is_err());
        assert!(parse_ip("2001:db8::1").is_err());
    }
}
