//! Tor control-port client
//!
//! Speaks the line-based control protocol over a single TCP connection.
//! Commands are serialized through one mutex; replies are read to completion
//! before the next command is written. Asynchronous `STREAM` events that
//! arrive in between are folded into a map of stream id to SOCKS username.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tova_core::{
    Circuit, CircuitId, ControlError, Fingerprint, RelayDescriptor, Stream, StreamId,
    StreamStatus,
};
use tracing::{debug, info, instrument, warn};

use crate::link::{ControlLink, ControlResult};
use crate::parse::{
    parse_auth_line, parse_circuit_status, parse_router_status, parse_stream_event,
    parse_stream_status,
};

/// Upper bound on waiting for one reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between connection attempts while the control port is down
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// One line of a (possibly multi-line) reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyLine {
    pub code: u16,
    pub text: String,
    /// Payload of a `+` data line
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Status code of the final line
    pub fn code(&self) -> u16 {
        self.lines.last().map(|l| l.code).unwrap_or(0)
    }

    pub fn is_ok(&self) -> bool {
        self.code() == 250
    }

    pub fn message(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Value of `key` in a GETINFO reply, from either a data or an inline line
    pub fn value(&self, key: &str) -> Option<String> {
        let prefix = format!("{}=", key);
        self.lines.iter().find_map(|line| {
            let rest = line.text.strip_prefix(&prefix)?;
            Some(line.data.clone().unwrap_or_else(|| rest.to_string()))
        })
    }
}

/// Which call a rejection belongs to; the same code means different things
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    GetInfo,
    Extend,
    Close,
    Attach,
    Auth,
    Other,
}

fn rejection(command: Command, reply: &Reply) -> ControlError {
    let message = format!("{} {}", reply.code(), reply.message());
    match (command, reply.code()) {
        (Command::Auth, _) | (_, 514) | (_, 515) => ControlError::Authentication(message),
        (Command::GetInfo, _) => ControlError::DescriptorUnavailable(message),
        (Command::Extend, 512) | (Command::Extend, 513) | (Command::Extend, 552) => {
            ControlError::InvalidRequest(message)
        }
        (Command::Extend, _) => ControlError::ExtensionFailed(message),
        (Command::Close, 552) | (Command::Attach, 552) => ControlError::InvalidArguments(message),
        (Command::Attach, 551) | (Command::Attach, 555) => ControlError::InvalidRequest(message),
        (_, 510) | (_, 512) | (_, 513) | (_, 553) | (_, 555) => {
            ControlError::InvalidRequest(message)
        }
        (_, 552) => ControlError::InvalidArguments(message),
        _ => ControlError::OperationFailed(message),
    }
}

fn socket_error(e: std::io::Error) -> ControlError {
    ControlError::Socket(e.to_string())
}

/// SOCKS usernames of streams the client still knows, keyed by stream id
#[derive(Clone, Default)]
struct StreamOwners(Arc<StdMutex<HashMap<StreamId, String>>>);

impl StreamOwners {
    fn lock(&self) -> MutexGuard<'_, HashMap<StreamId, String>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observe(&self, text: &str) {
        let Some(event) = parse_stream_event(text) else {
            return;
        };
        let mut owners = self.lock();
        match (event.status, event.socks_username) {
            (StreamStatus::Closed, _) => {
                owners.remove(&event.id);
            }
            (_, Some(username)) => {
                owners.insert(event.id, username);
            }
            _ => {}
        }
    }

    fn annotate(&self, streams: &mut [Stream]) {
        let owners = self.lock();
        for stream in streams {
            if stream.socks_username.is_none() {
                stream.socks_username = owners.get(&stream.id).cloned();
            }
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    owners: StreamOwners,
}

impl Connection {
    async fn send(&mut self, command: &str) -> ControlResult<Reply> {
        self.writer
            .write_all(format!("{}\r\n", command).as_bytes())
            .await
            .map_err(socket_error)?;
        self.writer.flush().await.map_err(socket_error)?;

        tokio::time::timeout(REPLY_TIMEOUT, self.read_reply())
            .await
            .map_err(|_| ControlError::Timeout(command.to_string()))?
    }

    async fn read_line(&mut self) -> ControlResult<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(socket_error)?;
        if n == 0 {
            return Err(ControlError::Socket("control connection closed".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> ControlResult<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
                return Err(ControlError::Protocol(format!("short reply line: {:?}", line)));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| ControlError::Protocol(format!("bad status code: {:?}", line)))?;
            let divider = &line[3..4];
            let text = line[4..].to_string();

            if code == 650 {
                if divider == "+" {
                    self.read_data().await?;
                } else {
                    self.owners.observe(&text);
                }
                continue;
            }

            match divider {
                "+" => {
                    let data = self.read_data().await?;
                    lines.push(ReplyLine {
                        code,
                        text,
                        data: Some(data),
                    });
                }
                "-" => lines.push(ReplyLine {
                    code,
                    text,
                    data: None,
                }),
                " " => {
                    lines.push(ReplyLine {
                        code,
                        text,
                        data: None,
                    });
                    return Ok(Reply { lines });
                }
                _ => {
                    return Err(ControlError::Protocol(format!(
                        "unknown reply divider: {:?}",
                        line
                    )))
                }
            }
        }
    }

    /// Read a dot-terminated data block
    async fn read_data(&mut self) -> ControlResult<String> {
        let mut data = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(data.join("\n"));
            }
            let unescaped = line.strip_prefix('.').filter(|l| l.starts_with('.'));
            data.push(unescaped.unwrap_or(line.as_str()).to_string());
        }
    }
}

/// Control link backed by a real Tor control port
#[derive(Clone)]
pub struct TorControl {
    addr: SocketAddr,
    conn: Arc<Mutex<Connection>>,
    owners: StreamOwners,
}

impl TorControl {
    /// Open the control port once, without authenticating
    pub async fn open(addr: SocketAddr) -> ControlResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(socket_error)?;
        let (read, write) = stream.into_split();
        let owners = StreamOwners::default();
        Ok(Self {
            addr,
            conn: Arc::new(Mutex::new(Connection {
                reader: BufReader::new(read),
                writer: write,
                owners: owners.clone(),
            })),
            owners,
        })
    }

    /// Open the control port, retrying every `backoff` until it accepts,
    /// then authenticate once
    ///
    /// Authentication failure is returned to the caller as fatal.
    pub async fn connect(
        addr: SocketAddr,
        password: Option<&str>,
        backoff: Duration,
    ) -> ControlResult<Self> {
        let link = loop {
            match Self::open(addr).await {
                Ok(link) => break link,
                Err(e) => {
                    warn!("Control port {} not reachable ({}), retrying", addr, e);
                    tokio::time::sleep(backoff).await;
                }
            }
        };
        link.authenticate(password).await?;
        info!("Authenticated to control port {}", addr);
        Ok(link)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, command: &str) -> ControlResult<Reply> {
        debug!("-> {}", command.split_whitespace().next().unwrap_or(command));
        let mut conn = self.conn.lock().await;
        conn.send(command).await
    }

    async fn expect_ok(&self, command: &str, kind: Command) -> ControlResult<Reply> {
        let reply = self.send(command).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(rejection(kind, &reply))
        }
    }

    async fn get_info(&self, key: &str) -> ControlResult<String> {
        let reply = self
            .expect_ok(&format!("GETINFO {}", key), Command::GetInfo)
            .await?;
        reply
            .value(key)
            .ok_or_else(|| ControlError::Protocol(format!("GETINFO {} returned no value", key)))
    }

    /// Authenticate using whichever method PROTOCOLINFO advertises
    pub async fn authenticate(&self, password: Option<&str>) -> ControlResult<()> {
        let reply = self.expect_ok("PROTOCOLINFO 1", Command::Auth).await?;
        let (methods, cookie_file) = reply
            .lines
            .iter()
            .find(|l| l.text.starts_with("AUTH "))
            .map(|l| parse_auth_line(&l.text))
            .unwrap_or_default();

        let has = |m: &str| methods.iter().any(|method| method == m);
        let command = if has("NULL") {
            "AUTHENTICATE".to_string()
        } else if let (true, Some(password)) = (has("HASHEDPASSWORD"), password) {
            format!("AUTHENTICATE \"{}\"", escape_quoted(password))
        } else if let (true, Some(path)) = (has("COOKIE"), cookie_file.as_deref()) {
            format!("AUTHENTICATE {}", read_cookie(Path::new(path)).await?)
        } else {
            return Err(ControlError::Authentication(format!(
                "no usable auth method among {:?}",
                methods
            )));
        };

        self.expect_ok(&command, Command::Auth).await?;
        Ok(())
    }

    /// `SETCONF key=value`
    pub async fn set_conf(&self, key: &str, value: &str) -> ControlResult<()> {
        self.expect_ok(&format!("SETCONF {}={}", key, value), Command::Other)
            .await?;
        Ok(())
    }

    /// Make the client hand new streams to the controller instead of
    /// attaching them itself
    pub async fn leave_streams_unattached(&self) -> ControlResult<()> {
        self.set_conf("__LeaveStreamsUnattached", "1").await
    }

    /// Subscribe to `STREAM` events so listed streams carry the SOCKS
    /// username they were opened with
    pub async fn watch_streams(&self) -> ControlResult<()> {
        self.expect_ok("SETEVENTS STREAM", Command::Other).await?;
        Ok(())
    }
}

async fn read_cookie(path: &Path) -> ControlResult<String> {
    let cookie = tokio::fs::read(path).await.map_err(|e| {
        ControlError::Authentication(format!("cannot read cookie {}: {}", path.display(), e))
    })?;
    Ok(hex::encode(cookie))
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[async_trait]
impl ControlLink for TorControl {
    #[instrument(skip(self), fields(control = %self.addr))]
    async fn list_circuits(&self) -> ControlResult<Vec<Circuit>> {
        parse_circuit_status(&self.get_info("circuit-status").await?)
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn get_circuit(&self, id: &str) -> ControlResult<Circuit> {
        self.list_circuits()
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ControlError::InvalidArguments(format!("unknown circuit {}", id)))
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn relay_status(&self, fingerprint: &str) -> ControlResult<RelayDescriptor> {
        let body = self.get_info(&format!("ns/id/{}", fingerprint)).await?;
        parse_router_status(&body)?
            .into_iter()
            .next()
            .ok_or_else(|| ControlError::DescriptorUnavailable(format!("no entry for {}", fingerprint)))
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn build_circuit(&self, path: &[Fingerprint]) -> ControlResult<CircuitId> {
        if path.is_empty() {
            return Err(ControlError::InvalidRequest("empty path".to_string()));
        }
        let hops: Vec<String> = path.iter().map(|fp| format!("${}", fp)).collect();
        let reply = self
            .expect_ok(
                &format!("EXTENDCIRCUIT 0 {}", hops.join(",")),
                Command::Extend,
            )
            .await?;

        // 250 EXTENDED <id>
        reply
            .lines
            .last()
            .and_then(|l| l.text.strip_prefix("EXTENDED "))
            .map(|id| id.trim().to_string())
            .ok_or_else(|| ControlError::Protocol(format!("unexpected reply: {}", reply.message())))
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn close_circuit(&self, id: &str) -> ControlResult<()> {
        self.expect_ok(&format!("CLOSECIRCUIT {}", id), Command::Close)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn list_streams(&self) -> ControlResult<Vec<Stream>> {
        let mut streams = parse_stream_status(&self.get_info("stream-status").await?)?;
        self.owners.annotate(&mut streams);
        Ok(streams)
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn attach_stream(&self, stream: &str, circuit: &str) -> ControlResult<()> {
        self.expect_ok(
            &format!("ATTACHSTREAM {} {}", stream, circuit),
            Command::Attach,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn close_stream(&self, stream: &str) -> ControlResult<()> {
        // Reason 1 = MISC
        self.expect_ok(&format!("CLOSESTREAM {} 1", stream), Command::Close)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(control = %self.addr))]
    async fn fetch_consensus(&self) -> ControlResult<Vec<RelayDescriptor>> {
        let relays = parse_router_status(&self.get_info("ns/all").await?)?;
        if relays.is_empty() {
            return Err(ControlError::DescriptorUnavailable(
                "consensus is empty".to_string(),
            ));
        }
        Ok(relays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serve canned replies, one per received command line
    async fn fake_tor(replies: Vec<&'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read);
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_null_auth_and_circuit_status() {
        let addr = fake_tor(vec![
            "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.8.10\"\r\n250 OK\r\n",
            "250 OK\r\n",
            "250+circuit-status=\r\n3 BUILT $AAAA~g,$BBBB~e PURPOSE=GENERAL\r\n4 EXTENDED $CCCC~g PURPOSE=GENERAL\r\n.\r\n250 OK\r\n",
        ])
        .await;

        let link = TorControl::connect(addr, None, Duration::from_millis(10))
            .await
            .unwrap();
        let circuits = link.list_circuits().await.unwrap();
        assert_eq!(circuits.len(), 2);
        assert_eq!(circuits[0].path, vec!["AAAA".to_string(), "BBBB".to_string()]);
    }

    #[tokio::test]
    async fn test_extend_circuit_returns_id() {
        let addr = fake_tor(vec!["250 EXTENDED 42\r\n"]).await;
        let link = TorControl::open(addr).await.unwrap();
        let id = link
            .build_circuit(&["AAAA".to_string(), "BBBB".to_string()])
            .await
            .unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn test_rejections_are_classified() {
        let addr = fake_tor(vec![
            "552 Unknown circuit \"99\"\r\n",
            "555 Connection is not managed by controller.\r\n",
            "552 No such router \"$FFFF\"\r\n",
            "551 Couldn't start circuit\r\n",
        ])
        .await;
        let link = TorControl::open(addr).await.unwrap();

        assert!(matches!(
            link.close_circuit("99").await,
            Err(ControlError::InvalidArguments(_))
        ));
        assert!(matches!(
            link.attach_stream("5", "7").await,
            Err(ControlError::InvalidRequest(_))
        ));
        assert!(matches!(
            link.build_circuit(&["FFFF".to_string()]).await,
            Err(ControlError::InvalidRequest(_))
        ));
        assert!(matches!(
            link.build_circuit(&["AAAA".to_string()]).await,
            Err(ControlError::ExtensionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_inline_getinfo_and_escaped_data() {
        let addr = fake_tor(vec![
            "250-stream-status=\r\n250 OK\r\n",
            "250+ns/id/AAAA=\r\nr relay AAoQ1DAR6kkoo19hBAX5K0QztNw 2024-05-01 08:00:00 10.1.2.3 443 0\r\ns Exit Running\r\nw Bandwidth=5\r\n.\r\n250 OK\r\n",
        ])
        .await;
        let link = TorControl::open(addr).await.unwrap();

        assert!(link.list_streams().await.unwrap().is_empty());
        let relay = link.relay_status("AAAA").await.unwrap();
        assert_eq!(relay.address.to_string(), "10.1.2.3");
        assert_eq!(relay.bandwidth, 5);
    }

    #[tokio::test]
    async fn test_stream_events_tag_listed_streams() {
        let addr = fake_tor(vec![
            "250 OK\r\n",
            "650 STREAM 21 NEW 0 example.org:80 SOURCE_ADDR=127.0.0.1:40000 PURPOSE=USER SOCKS_USERNAME=\"tova-ab\" SOCKS_PASSWORD=\"x\"\r\n650 STREAM 22 NEW 0 example.org:80 PURPOSE=USER\r\n250+stream-status=\r\n21 NEW 0 example.org:80\r\n22 NEW 0 example.org:80\r\n.\r\n250 OK\r\n",
            "650 STREAM 21 CLOSED 7 93.184.216.34:80 REASON=DONE\r\n250-stream-status=\r\n250 OK\r\n",
        ])
        .await;
        let link = TorControl::open(addr).await.unwrap();
        link.watch_streams().await.unwrap();

        let streams = link.list_streams().await.unwrap();
        assert_eq!(streams[0].socks_username.as_deref(), Some("tova-ab"));
        assert!(streams[1].socks_username.is_none());

        assert!(link.list_streams().await.unwrap().is_empty());
        assert!(link.owners.lock().is_empty());
    }

    #[test]
    fn test_escape_quoted() {
        assert_eq!(escape_quoted(r#"pa"ss\word"#), r#"pa\"ss\\word"#);
    }
}
