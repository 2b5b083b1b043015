//! Parsers for control-port reply payloads

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tova_core::{
    Circuit, CircuitStatus, ControlError, Fingerprint, RelayDescriptor, RelayFlag, Stream,
    StreamId, StreamStatus,
};

/// Consensus identities are unpadded base64
const IDENTITY_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Parse the body of `GETINFO circuit-status`
///
/// One circuit per line: `<id> <status> [<path>] [KEY=VALUE ...]`.
pub fn parse_circuit_status(body: &str) -> Result<Vec<Circuit>, ControlError> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_circuit_line)
        .collect()
}

/// Parse a single circuit-status line
pub fn parse_circuit_line(line: &str) -> Result<Circuit, ControlError> {
    let mut tokens = line.split_whitespace();
    let id = tokens
        .next()
        .ok_or_else(|| ControlError::Protocol(format!("empty circuit line: {:?}", line)))?;
    let status = tokens
        .next()
        .ok_or_else(|| ControlError::Protocol(format!("circuit {} has no status", id)))?
        .parse::<CircuitStatus>()
        .map_err(ControlError::Protocol)?;

    // The path is the first positional token; keyword arguments follow it.
    let path = match tokens.next() {
        Some(token) if !token.contains('=') || token.starts_with('$') => {
            token.split(',').map(hop_fingerprint).collect()
        }
        _ => Vec::new(),
    };

    Ok(Circuit {
        id: id.to_string(),
        status,
        path,
    })
}

/// `$FP~nick`, `$FP=nick`, `$FP` or a bare nickname
fn hop_fingerprint(hop: &str) -> Fingerprint {
    match hop.strip_prefix('$') {
        Some(rest) => rest
            .split(['~', '='])
            .next()
            .unwrap_or(rest)
            .to_uppercase(),
        None => hop.to_string(),
    }
}

/// Parse the body of `GETINFO stream-status`
///
/// One stream per line: `<id> <status> <circuit id> <target>`, where a
/// circuit id of `0` means unattached.
pub fn parse_stream_status(body: &str) -> Result<Vec<Stream>, ControlError> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 4 {
                return Err(ControlError::Protocol(format!(
                    "malformed stream line: {:?}",
                    line
                )));
            }
            let status = tokens[1]
                .parse::<StreamStatus>()
                .map_err(ControlError::Protocol)?;
            let circuit_id = match tokens[2] {
                "0" => None,
                id => Some(id.to_string()),
            };
            Ok(Stream {
                id: tokens[0].to_string(),
                status,
                circuit_id,
                target: tokens[3].to_string(),
                socks_username: None,
            })
        })
        .collect()
}

/// The parts of an asynchronous `STREAM` event the link keeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub id: StreamId,
    pub status: StreamStatus,
    pub socks_username: Option<String>,
}

/// Parse `STREAM <id> <status> <circuit id> <target> [KEY=VALUE ...]`
///
/// Returns `None` for other event types and malformed lines.
pub fn parse_stream_event(text: &str) -> Option<StreamEvent> {
    let mut tokens = text.split_whitespace();
    if tokens.next()? != "STREAM" {
        return None;
    }
    let id = tokens.next()?.to_string();
    let status = tokens.next()?.parse::<StreamStatus>().ok()?;
    Some(StreamEvent {
        id,
        status,
        socks_username: quoted_value(text, "SOCKS_USERNAME"),
    })
}

/// Unescaped value of ` KEY="..."` in a reply or event line
fn quoted_value(line: &str, key: &str) -> Option<String> {
    let marker = format!(" {}=\"", key);
    let idx = line.find(&marker)?;
    let mut value = String::new();
    let mut chars = line[idx + marker.len()..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    value.push(escaped);
                }
            }
            '"' => break,
            other => value.push(other),
        }
    }
    Some(value)
}

/// Parse router status entries (`GETINFO ns/all` or `ns/id/<fp>`)
///
/// Entries start at an `r` line; `s` carries flags and `w` the bandwidth.
/// Unknown flags and unknown line types are skipped.
pub fn parse_router_status(body: &str) -> Result<Vec<RelayDescriptor>, ControlError> {
    let mut relays = Vec::new();
    let mut current: Option<RelayDescriptor> = None;

    for line in body.lines().map(str::trim) {
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        match keyword {
            "r" => {
                if let Some(relay) = current.take() {
                    relays.push(relay);
                }
                current = Some(parse_r_line(rest)?);
            }
            "s" => {
                if let Some(relay) = current.as_mut() {
                    relay.flags = rest
                        .split_whitespace()
                        .filter_map(|flag| flag.parse::<RelayFlag>().ok())
                        .collect();
                }
            }
            "w" => {
                if let Some(relay) = current.as_mut() {
                    relay.bandwidth = rest
                        .split_whitespace()
                        .find_map(|kv| kv.strip_prefix("Bandwidth="))
                        .and_then(|bw| bw.parse().ok())
                        .unwrap_or(0);
                }
            }
            _ => {}
        }
    }

    if let Some(relay) = current {
        relays.push(relay);
    }
    Ok(relays)
}

/// `nickname identity [digest] date time address orport dirport`
fn parse_r_line(rest: &str) -> Result<RelayDescriptor, ControlError> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 7 {
        return Err(ControlError::Protocol(format!("malformed r line: {:?}", rest)));
    }

    let identity = IDENTITY_B64
        .decode(tokens[1])
        .map_err(|e| ControlError::Protocol(format!("bad identity {}: {}", tokens[1], e)))?;

    // Microdescriptor consensuses omit the digest field, so locate the
    // address instead of indexing it.
    let address = tokens[2..]
        .iter()
        .find_map(|token| token.parse::<Ipv4Addr>().ok())
        .ok_or_else(|| ControlError::Protocol(format!("no address in r line: {:?}", rest)))?;

    Ok(RelayDescriptor {
        fingerprint: hex::encode_upper(identity),
        nickname: tokens[0].to_string(),
        address,
        bandwidth: 0,
        flags: BTreeSet::new(),
    })
}

/// Parse `AUTH METHODS=... [COOKIEFILE="..."]` from a PROTOCOLINFO reply
pub fn parse_auth_line(line: &str) -> (Vec<String>, Option<String>) {
    let mut methods = Vec::new();
    let rest = line.strip_prefix("AUTH ").unwrap_or(line);
    if let Some(value) = rest
        .split_whitespace()
        .find_map(|token| token.strip_prefix("METHODS="))
    {
        methods = value.split(',').map(str::to_string).collect();
    }
    let cookie_file = quoted_value(line, "COOKIEFILE");

    (methods, cookie_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_circuit_status() {
        let body = "\
7 BUILT $A1B2C3D4E5F60718293A4B5C6D7E8F9012345678~guardian,$0011223344556677889900AABBCCDDEEFF001122~exitnode BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL TIME_CREATED=2024-05-01T10:00:00.000000
8 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL
";
        let circuits = parse_circuit_status(body).unwrap();
        assert_eq!(circuits.len(), 2);
        assert_eq!(circuits[0].id, "7");
        assert!(circuits[0].is_built());
        assert_eq!(circuits[0].path.len(), 2);
        assert_eq!(
            circuits[0].exit().unwrap(),
            "0011223344556677889900AABBCCDDEEFF001122"
        );
        assert_eq!(circuits[1].status, CircuitStatus::Launched);
        assert!(circuits[1].path.is_empty());
    }

    #[test]
    fn test_parse_stream_status() {
        let body = "21 NEW 0 example.org:80\n22 SUCCEEDED 7 93.184.216.34:443\n";
        let streams = parse_stream_status(body).unwrap();
        assert_eq!(streams[0].circuit_id, None);
        assert_eq!(streams[0].target_address(), "example.org");
        assert_eq!(streams[1].circuit_id.as_deref(), Some("7"));
        assert_eq!(streams[1].status, StreamStatus::Succeeded);
    }

    #[test]
    fn test_parse_stream_event() {
        let event = parse_stream_event(
            r#"STREAM 21 NEW 0 example.org:80 SOURCE_ADDR=127.0.0.1:51234 PURPOSE=USER SOCKS_USERNAME="tova-0a1b" SOCKS_PASSWORD="x" CLIENT_PROTOCOL=SOCKS5"#,
        )
        .unwrap();
        assert_eq!(event.id, "21");
        assert_eq!(event.status, StreamStatus::New);
        assert_eq!(event.socks_username.as_deref(), Some("tova-0a1b"));

        let closed = parse_stream_event("STREAM 21 CLOSED 7 93.184.216.34:80 REASON=DONE").unwrap();
        assert_eq!(closed.status, StreamStatus::Closed);
        assert!(closed.socks_username.is_none());

        assert!(parse_stream_event("CIRC 7 BUILT $AAAA~g").is_none());
    }

    #[test]
    fn test_parse_router_status() {
        let body = "\
r moria1 lpXfw1/+uGEym58asExGOXAgzjE 2024-05-01 09:21:56 128.31.0.34 9101 9131
s Authority Fast Running Stable V2Dir Valid
w Bandwidth=20
r exitrelay AAoQ1DAR6kkoo19hBAX5K0QztNw 2024-05-01 08:00:00 185.220.101.7 443 0
s Exit Fast Guard Running Stable Valid SomeFutureFlag
w Bandwidth=12000 Unmeasured=1
";
        let relays = parse_router_status(body).unwrap();
        assert_eq!(relays.len(), 2);
        assert_eq!(
            relays[0].fingerprint,
            "9695DFC35FFEB861329B9F1AB04C46397020CE31"
        );
        assert_eq!(relays[0].address, Ipv4Addr::new(128, 31, 0, 34));
        assert!(relays[0].has_flag(RelayFlag::Authority));
        assert_eq!(relays[1].bandwidth, 12000);
        assert!(relays[1].has_flag(RelayFlag::Exit));
        assert_eq!(relays[1].flags.len(), 6);
    }

    #[test]
    fn test_parse_auth_line() {
        let (methods, cookie) = parse_auth_line(
            r#"AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/var/run/tor/control.authcookie""#,
        );
        assert_eq!(methods, vec!["COOKIE", "SAFECOOKIE"]);
        assert_eq!(cookie.as_deref(), Some("/var/run/tor/control.authcookie"));

        let (methods, cookie) = parse_auth_line("AUTH METHODS=NULL");
        assert_eq!(methods, vec!["NULL"]);
        assert!(cookie.is_none());
    }
}
