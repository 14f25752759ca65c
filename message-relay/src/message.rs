use std::{fmt, io};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Separator between the fields of a routed line.
pub const SEPARATOR: char = ':';

/// Prefix of the in-band control line that ends a session.
pub const DISCONNECT_PREFIX: &str = "DISCONNECT:";

/// One routed unit of communication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub receiver: String,
    pub body: String,
}

impl Envelope {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            body: body.into(),
        }
    }
}

/// Lines a client writes to the relay.
///
/// The registration line carries no marker on the wire: the relay takes the
/// first line of a connection verbatim as the username, so `Register` is only
/// ever encoded. Every later line goes through [`ClientFrame::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Register { username: String },
    Route { receiver: String, body: String },
    Disconnect { username: String },
}

impl ClientFrame {
    /// Decodes a line sent after registration.
    ///
    /// Splits on the first separator only, so the body may itself contain
    /// separators. Returns `None` for a line without any separator.
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(username) = line.strip_prefix(DISCONNECT_PREFIX) {
            return Some(ClientFrame::Disconnect {
                username: username.to_string(),
            });
        }

        let (receiver, body) = line.split_once(SEPARATOR)?;
        Some(ClientFrame::Route {
            receiver: receiver.to_string(),
            body: body.to_string(),
        })
    }
}

impl fmt::Display for ClientFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientFrame::Register { username } => f.write_str(username),
            ClientFrame::Route { receiver, body } => write!(f, "{receiver}{SEPARATOR}{body}"),
            ClientFrame::Disconnect { username } => write!(f, "{DISCONNECT_PREFIX}{username}"),
        }
    }
}

/// Lines the relay writes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Deliver(Envelope),
    Disconnect { username: String },
}

impl ServerFrame {
    /// Decodes a line pushed by the relay.
    ///
    /// A forwarded line splits into at most three fields; any further
    /// separators stay inside the body. Fewer than three fields is malformed.
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(username) = line.strip_prefix(DISCONNECT_PREFIX) {
            return Some(ServerFrame::Disconnect {
                username: username.to_string(),
            });
        }

        let mut fields = line.splitn(3, SEPARATOR);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(sender), Some(receiver), Some(body)) => {
                Some(ServerFrame::Deliver(Envelope::new(sender, receiver, body)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFrame::Deliver(Envelope {
                sender,
                receiver,
                body,
            }) => write!(f, "{sender}{SEPARATOR}{receiver}{SEPARATOR}{body}"),
            ServerFrame::Disconnect { username } => write!(f, "{DISCONNECT_PREFIX}{username}"),
        }
    }
}

/// True when `text` would break line framing if written verbatim.
pub fn contains_line_break(text: &str) -> bool {
    text.contains(LINE_ENDINGS)
}

/// Reads one line with its line ending stripped. `Ok(None)` means EOF.
///
/// Empty lines are returned as-is; whether they mean anything is up to the
/// caller's state. Invalid UTF-8 is replaced with U+FFFD rather than failing
/// the read, so one bad byte never ends a session.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let bytes = reader.read_until(b'\n', &mut raw).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let line = String::from_utf8_lossy(&raw);
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: fmt::Display,
{
    // One write per frame so concurrent routes to the same socket never interleave.
    let mut encoded = frame.to_string().into_bytes();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_splits_on_first_separator() {
        assert_eq!(
            ClientFrame::parse("bob:hi"),
            Some(ClientFrame::Route {
                receiver: "bob".into(),
                body: "hi".into()
            })
        );
        assert_eq!(
            ClientFrame::parse("bob:a:b"),
            Some(ClientFrame::Route {
                receiver: "bob".into(),
                body: "a:b".into()
            })
        );
        assert_eq!(
            ClientFrame::parse("bob:"),
            Some(ClientFrame::Route {
                receiver: "bob".into(),
                body: String::new()
            })
        );
    }

    #[test]
    fn client_line_without_separator_is_malformed() {
        assert_eq!(ClientFrame::parse("just text"), None);
        assert_eq!(ClientFrame::parse(""), None);
    }

    #[test]
    fn disconnect_signal_wins_over_routing() {
        assert_eq!(
            ClientFrame::parse("DISCONNECT:alice"),
            Some(ClientFrame::Disconnect {
                username: "alice".into()
            })
        );
        // Case matters; this one is an ordinary route to "disconnect".
        assert!(matches!(
            ClientFrame::parse("disconnect:alice"),
            Some(ClientFrame::Route { receiver, .. }) if receiver == "disconnect"
        ));
    }

    #[test]
    fn registration_encodes_bare_username() {
        let frame = ClientFrame::Register {
            username: "alice".into(),
        };
        assert_eq!(frame.to_string(), "alice");
    }

    #[test]
    fn forwarded_line_caps_at_three_fields() {
        assert_eq!(
            ServerFrame::parse("alice:bob:a:b"),
            Some(ServerFrame::Deliver(Envelope::new("alice", "bob", "a:b")))
        );
        assert_eq!(
            ServerFrame::parse("alice:bob:"),
            Some(ServerFrame::Deliver(Envelope::new("alice", "bob", "")))
        );
        assert_eq!(ServerFrame::parse("alice:bob"), None);
        assert_eq!(ServerFrame::parse("alice"), None);
    }

    #[test]
    fn server_disconnect_is_recognized_by_prefix() {
        assert_eq!(
            ServerFrame::parse("DISCONNECT:bob"),
            Some(ServerFrame::Disconnect {
                username: "bob".into()
            })
        );
    }

    #[test]
    fn frames_encode_to_wire_text() {
        assert_eq!(
            ClientFrame::Route {
                receiver: "bob".into(),
                body: "hi there".into()
            }
            .to_string(),
            "bob:hi there"
        );
        assert_eq!(
            ClientFrame::Disconnect {
                username: "alice".into()
            }
            .to_string(),
            "DISCONNECT:alice"
        );
        assert_eq!(
            ServerFrame::Deliver(Envelope::new("alice", "bob", "a:b")).to_string(),
            "alice:bob:a:b"
        );
    }

    #[test]
    fn line_breaks_are_detected() {
        assert!(contains_line_break("a\nb"));
        assert!(contains_line_break("a\r"));
        assert!(!contains_line_break("a:b"));
    }

    #[tokio::test]
    async fn read_line_strips_endings_and_reports_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"alice\r\n\nbob:hi\n").await.expect("write");
        drop(writer);

        assert_eq!(read_line(&mut reader).await.unwrap(), Some("alice".into()));
        assert_eq!(read_line(&mut reader).await.unwrap(), Some(String::new()));
        assert_eq!(read_line(&mut reader).await.unwrap(), Some("bob:hi".into()));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_and_reading_continues() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"bob:\xff\xfe bad\nbob:after\n").await.expect("write");
        drop(writer);

        assert_eq!(
            read_line(&mut reader).await.unwrap(),
            Some("bob:\u{FFFD}\u{FFFD} bad".into())
        );
        assert_eq!(read_line(&mut reader).await.unwrap(), Some("bob:after".into()));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn written_frame_is_one_terminated_line() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        let frame = ServerFrame::Deliver(Envelope::new("alice", "bob", "hello"));
        write_frame(&mut writer, &frame).await.expect("write frame");

        let line = read_line(&mut reader)
            .await
            .expect("read line")
            .expect("expected line");
        assert_eq!(ServerFrame::parse(&line), Some(frame));
    }
}
