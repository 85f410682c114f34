use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{PgWireError, Result};
use crate::protocol::messages::{ErrorResponse, ParameterStatus};

/// Protocol 3.0, sent as `int16 major` `int16 minor`.
pub const PROTOCOL_VERSION_3_0: i32 = 196608;

/// tag(1) + length(4)
pub const HEADER_LEN: usize = 5;

/// Largest length a backend may declare (the server's own allocation limit).
pub const MAX_FRAME_LEN: usize = 0x3fff_ffff;

/// A decoded backend frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// `'d'`: payload is a replication sub-message once streaming.
    CopyData(Bytes),
    /// `'S'`
    ParameterStatus(ParameterStatus),
    /// `'E'`
    ErrorResponse(ErrorResponse),
    /// `'R'`: the authentication request code, `0` for AuthenticationOk.
    Authentication(u32),
    /// Recognized but carries nothing for the caller: `'K'` backend key data,
    /// `'W'` copy-both response, `'Z'` ready for query.
    Ignored(u8),
}

type PayloadParser = fn(u8, Bytes) -> Result<BackendMessage>;

/// Tag byte to payload parser. Adding a frame type is adding a row.
const PARSERS: &[(u8, PayloadParser)] = &[
    (b'd', parse_copy_data_frame),
    (b'S', parse_parameter_status),
    (b'E', parse_error_response),
    (b'K', ignore),
    (b'R', parse_authentication),
    (b'W', ignore),
    (b'Z', ignore),
];

fn parse_copy_data_frame(_: u8, payload: Bytes) -> Result<BackendMessage> {
    Ok(BackendMessage::CopyData(payload))
}

fn parse_parameter_status(_: u8, payload: Bytes) -> Result<BackendMessage> {
    ParameterStatus::parse(&payload).map(BackendMessage::ParameterStatus)
}

fn parse_error_response(_: u8, payload: Bytes) -> Result<BackendMessage> {
    Ok(BackendMessage::ErrorResponse(ErrorResponse::parse(&payload)))
}

fn parse_authentication(_: u8, payload: Bytes) -> Result<BackendMessage> {
    let code = payload
        .get(..4)
        .ok_or_else(|| PgWireError::Protocol("authentication request too short".into()))?;
    Ok(BackendMessage::Authentication(u32::from_be_bytes([
        code[0], code[1], code[2], code[3],
    ])))
}

fn ignore(tag: u8, _: Bytes) -> Result<BackendMessage> {
    Ok(BackendMessage::Ignored(tag))
}

fn parser_for(tag: u8) -> Option<PayloadParser> {
    PARSERS
        .iter()
        .find_map(|&(t, parser)| (t == tag).then_some(parser))
}

/// Total size (header included) of the frame at the start of `buf`.
///
/// Returns [`PgWireError::MalformedFrame`] when `buf` holds less than that.
pub fn frame_len(buf: &[u8]) -> Result<usize> {
    if buf.len() < HEADER_LEN {
        return Err(PgWireError::MalformedFrame {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if !(4..=MAX_FRAME_LEN).contains(&len) {
        return Err(PgWireError::Protocol(format!(
            "invalid backend message length: {len}"
        )));
    }
    let total = len + 1;
    if buf.len() < total {
        return Err(PgWireError::MalformedFrame {
            needed: total,
            available: buf.len(),
        });
    }
    Ok(total)
}

/// Decode one complete frame (tag, length and exactly `length - 4` payload bytes).
pub fn decode_frame(mut frame: Bytes) -> Result<BackendMessage> {
    let total = frame_len(&frame)?;
    frame.truncate(total);
    let tag = frame.get_u8();
    frame.advance(4);
    let parser = parser_for(tag).ok_or(PgWireError::UnknownFrameType(tag))?;
    parser(tag, frame)
}

/// Cursor over the frames packed into one buffer.
///
/// Yields frames in wire order. After the first error (short buffer, unknown
/// tag) the cursor is exhausted and [`FrameCursor::consumed`] points at the
/// start of the offending frame.
#[derive(Debug, Clone)]
pub struct FrameCursor {
    buf: Bytes,
    pos: usize,
    failed: bool,
}

impl FrameCursor {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    /// Bytes belonging to frames already yielded.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Bytes not yet decoded.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

impl Iterator for FrameCursor {
    type Item = Result<BackendMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos == self.buf.len() {
            return None;
        }
        let res = frame_len(self.remaining()).and_then(|total| {
            let frame = self.buf.slice(self.pos..self.pos + total);
            let msg = decode_frame(frame)?;
            self.pos += total;
            Ok(msg)
        });
        if res.is_err() {
            self.failed = true;
        }
        Some(res)
    }
}

/// Decode every frame in `buf`, in order, dropping [`BackendMessage::Ignored`]
/// and [`BackendMessage::Authentication`] ones.
///
/// A buffer cut mid-frame yields [`PgWireError::MalformedFrame`]: buffer more
/// bytes and call again. Nothing is returned when any frame fails.
pub fn decode_frames(buf: impl Into<Bytes>) -> Result<Vec<BackendMessage>> {
    FrameCursor::new(buf.into())
        .filter(|m| {
            !matches!(
                m,
                Ok(BackendMessage::Ignored(_) | BackendMessage::Authentication(_))
            )
        })
        .collect()
}

/// Accumulates transport reads and hands out complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Spare space for the next transport read.
    pub fn read_target(&mut self, additional: usize) -> &mut BytesMut {
        self.buf.reserve(additional);
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Next complete frame, or `None` when the buffered bytes end mid-frame.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>> {
        match frame_len(&self.buf) {
            Ok(total) => decode_frame(self.buf.split_to(total).freeze()).map(Some),
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn encode_startup_message(protocol_version: i32, params: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(protocol_version);

    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf.freeze()
}

/// Startup packet for a logical replication connection (`replication=database`).
pub fn encode_startup_packet(user: &str, database: &str) -> Bytes {
    encode_startup_message(
        PROTOCOL_VERSION_3_0,
        &[
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ],
    )
}

fn encode_tagged(tag: u8, body: &[u8], nul_terminate: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 6);
    buf.put_u8(tag);
    buf.put_i32(0);
    buf.extend_from_slice(body);
    if nul_terminate {
        buf.put_u8(0);
    }

    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf.freeze()
}

/// Simple query (`'Q'`).
pub fn encode_simple_query(sql: &str) -> Bytes {
    encode_tagged(b'Q', sql.as_bytes(), true)
}

/// CopyData (`'d'`) wrapping an outbound replication payload.
pub fn encode_copy_data(payload: &[u8]) -> Bytes {
    encode_tagged(b'd', payload, false)
}

/// CopyDone (`'c'`), ends the client side of copy-both mode.
pub fn encode_copy_done() -> Bytes {
    encode_tagged(b'c', &[], false)
}

pub async fn write_message<W: AsyncWrite + Unpin>(wr: &mut W, msg: &[u8]) -> Result<()> {
    wr.write_all(msg).await?;
    wr.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![tag];
        v.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn startup_packet_shape() {
        let p = encode_startup_packet("testuser", "testdb");
        let len = u32::from_be_bytes([p[0], p[1], p[2], p[3]]) as usize;
        assert_eq!(len, p.len());
        assert_eq!(&p[4..8], &[0x00, 0x03, 0x00, 0x00]);
        assert_eq!(
            &p[8..],
            b"user\0testuser\0database\0testdb\0replication\0database\0\0"
        );
    }

    #[test]
    fn simple_query_layout() {
        let q = encode_simple_query("START_REPLICATION SLOT test LOGICAL 0/0");
        assert_eq!(q[0], b'Q');
        let len = u32::from_be_bytes([q[1], q[2], q[3], q[4]]) as usize;
        assert_eq!(len, "START_REPLICATION SLOT test LOGICAL 0/0".len() + 5);
        assert_eq!(len + 1, q.len());
        assert_eq!(q.last(), Some(&0));
    }

    #[test]
    fn copy_data_and_copy_done_layout() {
        let d = encode_copy_data(b"abc");
        assert_eq!(&d[..], &[b'd', 0, 0, 0, 7, b'a', b'b', b'c']);
        assert_eq!(&encode_copy_done()[..], &[b'c', 0, 0, 0, 4]);
    }

    #[test]
    fn decodes_concatenated_frames_in_order() {
        let mut buf = Vec::new();
        buf.extend(frame(b'R', &0i32.to_be_bytes()));
        buf.extend(frame(b'S', b"client_encoding\0UTF8\0"));
        buf.extend(frame(b'K', &[0u8; 8]));
        buf.extend(frame(b'd', b"payload"));
        buf.extend(frame(b'Z', b"I"));

        let msgs = decode_frames(buf).unwrap();
        assert_eq!(
            msgs,
            vec![
                BackendMessage::ParameterStatus(ParameterStatus {
                    name: "client_encoding".into(),
                    value: "UTF8".into(),
                }),
                BackendMessage::CopyData(Bytes::from_static(b"payload")),
            ]
        );
    }

    #[test]
    fn authentication_request_carries_its_code() {
        // AuthenticationMD5Password: code 5 followed by a 4-byte salt.
        let md5 = frame(b'R', &[0, 0, 0, 5, 1, 2, 3, 4]);
        assert_eq!(
            decode_frame(Bytes::from(md5.clone())).unwrap(),
            BackendMessage::Authentication(5)
        );
        assert!(decode_frames(md5).unwrap().is_empty());

        let err = decode_frame(Bytes::from(frame(b'R', &[0, 0]))).unwrap_err();
        assert!(matches!(err, PgWireError::Protocol(_)), "{err}");
    }

    #[test]
    fn cursor_consumes_whole_buffer() {
        let mut buf = frame(b'd', b"one");
        buf.extend(frame(b'W', &[0, 0, 0]));
        buf.extend(frame(b'd', b""));
        let total = buf.len();

        let mut cursor = FrameCursor::new(Bytes::from(buf));
        let msgs: Vec<_> = cursor.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1], BackendMessage::Ignored(b'W'));
        assert_eq!(cursor.consumed(), total);
        assert!(cursor.remaining().is_empty());
    }

    #[test]
    fn truncated_payload_is_incomplete_then_recovers() {
        let mut full = frame(b'S', b"TimeZone\0UTC\0");
        full.extend(frame(b'd', b"wxyz"));
        let expected = decode_frames(full.clone()).unwrap();

        let cut = full.len() - 2;
        let err = decode_frames(full[..cut].to_vec()).unwrap_err();
        assert!(err.is_incomplete());

        let mut fb = FrameBuffer::default();
        fb.extend_from_slice(&full[..cut]);
        let first = fb.next_message().unwrap().unwrap();
        assert!(fb.next_message().unwrap().is_none());
        fb.extend_from_slice(&full[cut..]);
        let second = fb.next_message().unwrap().unwrap();
        assert_eq!(vec![first, second], expected);
        assert!(fb.is_empty());
    }

    #[test]
    fn truncated_header_is_incomplete() {
        let err = decode_frames(vec![b'd', 0, 0]).unwrap_err();
        assert_eq!(
            err,
            PgWireError::MalformedFrame {
                needed: 5,
                available: 3
            }
        );
    }

    #[test]
    fn unknown_tag_fails_closed() {
        let mut buf = frame(b'X', b"junk");
        buf.extend(frame(b'd', b"after"));
        assert_eq!(
            decode_frames(buf.clone()).unwrap_err(),
            PgWireError::UnknownFrameType(b'X')
        );

        let mut cursor = FrameCursor::new(Bytes::from(buf));
        assert!(cursor.next().unwrap().is_err());
        assert!(cursor.next().is_none());
        assert_eq!(cursor.consumed(), 0);
    }

    #[test]
    fn unknown_tag_after_valid_frame_discards_all() {
        let mut buf = frame(b'd', b"ok");
        buf.extend(frame(b'N', b"notice"));
        assert_eq!(
            decode_frames(buf).unwrap_err(),
            PgWireError::UnknownFrameType(b'N')
        );
    }

    #[test]
    fn length_below_four_is_protocol_violation() {
        let err = decode_frames(vec![b'd', 0, 0, 0, 3]).unwrap_err();
        assert!(matches!(err, PgWireError::Protocol(_)));
        assert!(!err.is_incomplete());
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        assert!(decode_frames(Vec::new()).unwrap().is_empty());
    }
}
