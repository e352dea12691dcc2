//! Frame codec for the connection protocol.
//!
//! Everything here is sans-IO: encoding appends to owned buffers, decoding
//! walks caller-owned byte slices. The connection layer owns the sockets.
//!
//! # Wire Format
//!
//! Each frame is a little-endian length prefix followed by a message body:
//!
//! ```text
//! +0  length:         u32  - Body length in bytes (0 is never emitted)
//! +4  endpoint_magic: u32  - Which side's message namespace
//! +8  message_id:     u32  - Message discriminant within the namespace
//! +12 fd_count:       u32  - Descriptors attached to this message
//! +16 payload bytes
//! ```
//!
//! Descriptors travel out-of-band (SCM_RIGHTS) on the frame that references
//! them and are consumed in strict FIFO order.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the message body header (endpoint magic, message id, fd count).
pub const HEADER_SIZE: usize = 12;

/// Reserved message id for acknowledgements, defined on every endpoint.
pub const ACKNOWLEDGEMENT_ID: u32 = 0xFFFF_FFFF;

/// Reserved message id for the oversize-message envelope, defined on every
/// endpoint.
pub const LARGE_WRAPPER_ID: u32 = 0xFFFF_FFFE;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// An encoded message ready for transfer: body bytes plus the descriptors
/// the body references.
#[derive(Debug)]
pub struct MessageBuffer {
    data: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl MessageBuffer {
    /// Encodes a message body from its parts.
    ///
    /// The descriptor count is written into the header so the receiving
    /// connection can attribute descriptors without decoding the payload.
    pub fn new(endpoint_magic: u32, message_id: u32, payload: &[u8], fds: Vec<OwnedFd>) -> Self {
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.extend_from_slice(&endpoint_magic.to_le_bytes());
        data.extend_from_slice(&message_id.to_le_bytes());
        data.extend_from_slice(&(fds.len() as u32).to_le_bytes());
        data.extend_from_slice(payload);
        Self { data, fds }
    }

    pub(crate) fn from_data(data: Vec<u8>) -> Self {
        Self { data, fds: Vec::new() }
    }

    pub fn endpoint_magic(&self) -> u32 {
        read_u32(&self.data, 0)
    }

    pub fn message_id(&self) -> u32 {
        read_u32(&self.data, 4)
    }

    /// The encoded body, header included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }
}

/// Builds an acknowledgement reporting how many peer messages were parsed.
pub fn acknowledgement(endpoint_magic: u32, ack_count: u32) -> MessageBuffer {
    MessageBuffer::new(endpoint_magic, ACKNOWLEDGEMENT_ID, &ack_count.to_le_bytes(), Vec::new())
}

/// Wraps an oversized message in a [`LARGE_WRAPPER_ID`] envelope.
///
/// The wrapper's payload is the complete inner body and the inner message's
/// descriptors transfer to the wrapper. Both carry the same descriptor
/// count, which is what lets the receiver replay the descriptors to the
/// inner decode.
pub fn wrap_large_message(buffer: MessageBuffer) -> MessageBuffer {
    let endpoint_magic = buffer.endpoint_magic();
    MessageBuffer::new(endpoint_magic, LARGE_WRAPPER_ID, &buffer.data, buffer.fds)
}

/// A fully parsed inbound message.
#[derive(Debug)]
pub struct Message {
    endpoint_magic: u32,
    message_id: u32,
    payload: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl Message {
    pub fn endpoint_magic(&self) -> u32 {
        self.endpoint_magic
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Payload bytes after the body header.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Takes ownership of the descriptors delivered with this message.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Re-encodes the message, moving the descriptors into the buffer.
    pub fn into_buffer(self) -> MessageBuffer {
        MessageBuffer::new(self.endpoint_magic, self.message_id, &self.payload, self.fds)
    }
}

/// FIFO of received descriptors awaiting consumption by message decoding.
///
/// Supports returning descriptors to the front, used when a wrapper's
/// handoff must be replayed to the wrapped message's decode.
#[derive(Default)]
pub struct FdQueue {
    fds: VecDeque<OwnedFd>,
}

impl FdQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, fd: OwnedFd) {
        self.fds.push_back(fd);
    }

    /// Takes the next `count` descriptors in FIFO order, or `None` if fewer
    /// are available (the queue is left untouched in that case).
    pub fn take(&mut self, count: usize) -> Option<Vec<OwnedFd>> {
        if self.fds.len() < count {
            return None;
        }
        Some(self.fds.drain(..count).collect())
    }

    /// Returns descriptors to the front of the queue, preserving their
    /// original order.
    pub fn return_to_front(&mut self, fds: Vec<OwnedFd>) {
        for fd in fds.into_iter().rev() {
            self.fds.push_front(fd);
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

/// Errors that can occur while decoding a message body.
#[derive(Debug)]
pub enum ProtocolError {
    TruncatedHeader(usize),
    TruncatedPayload { message_id: u32, len: usize },
    MissingDescriptors { expected: usize, available: usize },
    AcknowledgementWithDescriptors(u32),
    WrappedAcknowledgement,
    WrapperFdCountMismatch { wrapper: usize, inner: usize },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TruncatedHeader(len) => write!(f, "body too short for header: {len} bytes"),
            Self::TruncatedPayload { message_id, len } => {
                write!(f, "truncated payload for message {message_id:#x}: {len} bytes")
            }
            Self::MissingDescriptors { expected, available } => {
                write!(f, "message expects {expected} descriptors, {available} available")
            }
            Self::AcknowledgementWithDescriptors(count) => {
                write!(f, "acknowledgement carries {count} descriptors")
            }
            Self::WrappedAcknowledgement => write!(f, "large-message wrapper contains an acknowledgement"),
            Self::WrapperFdCountMismatch { wrapper, inner } => {
                write!(f, "wrapper declares {wrapper} descriptors, wrapped message declares {inner}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A decoded message body, classified by envelope.
pub(crate) enum Envelope {
    Acknowledgement { endpoint_magic: u32, ack_count: u32 },
    Message(Message),
}

/// Decodes one message body, consuming descriptors from `fds` as the header
/// demands.
///
/// Large-message wrappers are collapsed transparently: the wrapper's
/// descriptor handoff is taken and returned to the front of the queue, then
/// the inner body is decoded in its place. The handoff count must match the
/// count the inner header declares, or descriptors would stay behind and be
/// attributed to an unrelated later message. A wrapper must not contain an
/// acknowledgement.
///
/// On error the descriptor queue is unchanged.
pub(crate) fn parse_body(body: &[u8], fds: &mut FdQueue) -> Result<Envelope, ProtocolError> {
    if body.len() < HEADER_SIZE {
        return Err(ProtocolError::TruncatedHeader(body.len()));
    }
    let endpoint_magic = read_u32(body, 0);
    let message_id = read_u32(body, 4);
    let fd_count = read_u32(body, 8) as usize;
    let payload = &body[HEADER_SIZE..];

    match message_id {
        ACKNOWLEDGEMENT_ID => {
            if fd_count != 0 {
                return Err(ProtocolError::AcknowledgementWithDescriptors(fd_count as u32));
            }
            if payload.len() != 4 {
                return Err(ProtocolError::TruncatedPayload { message_id, len: payload.len() });
            }
            Ok(Envelope::Acknowledgement { endpoint_magic, ack_count: read_u32(payload, 0) })
        }
        LARGE_WRAPPER_ID => {
            if payload.len() < HEADER_SIZE {
                return Err(ProtocolError::TruncatedHeader(payload.len()));
            }
            let inner_fd_count = read_u32(payload, 8) as usize;
            if inner_fd_count != fd_count {
                return Err(ProtocolError::WrapperFdCountMismatch { wrapper: fd_count, inner: inner_fd_count });
            }
            let Some(handoff) = fds.take(fd_count) else {
                return Err(ProtocolError::MissingDescriptors { expected: fd_count, available: fds.len() });
            };
            fds.return_to_front(handoff);
            match parse_body(payload, fds)? {
                Envelope::Acknowledgement { .. } => Err(ProtocolError::WrappedAcknowledgement),
                message => Ok(message),
            }
        }
        _ => {
            let Some(taken) = fds.take(fd_count) else {
                return Err(ProtocolError::MissingDescriptors { expected: fd_count, available: fds.len() });
            };
            Ok(Envelope::Message(Message {
                endpoint_magic,
                message_id,
                payload: payload.to_vec(),
                fds: taken,
            }))
        }
    }
}

/// Walks length-prefixed frames over a byte slice without consuming them.
///
/// `peek_frame` yields the next complete body; `advance` commits past it.
/// The walk stops at a zero length prefix or a partial frame, leaving
/// `consumed` at the start of the unconsumed tail.
pub(crate) struct FrameCursor<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> FrameCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, index: 0 }
    }

    pub fn peek_frame(&self) -> Option<&'a [u8]> {
        let remaining = &self.bytes[self.index..];
        if remaining.len() < LENGTH_PREFIX_SIZE {
            return None;
        }
        let length = read_u32(remaining, 0) as usize;
        if length == 0 || remaining.len() - LENGTH_PREFIX_SIZE < length {
            return None;
        }
        Some(&remaining[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length])
    }

    /// Commits past the frame `peek_frame` just returned. Does nothing if no
    /// complete frame is pending.
    pub fn advance(&mut self) {
        if let Some(body) = self.peek_frame() {
            self.index += LENGTH_PREFIX_SIZE + body.len();
        }
    }

    pub fn consumed(&self) -> usize {
        self.index
    }
}

/// Formats bytes for decode-failure logs, 16 to a line, capped at 256 bytes.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).take(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (j, byte) in chunk.iter().enumerate() {
            if j > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{byte:02x}");
        }
    }
    if bytes.len() > 256 {
        let _ = write!(out, "\n... {} more bytes", bytes.len() - 256);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    fn test_fd() -> OwnedFd {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    fn frame(buffer: &MessageBuffer) -> Vec<u8> {
        let mut bytes = (buffer.data().len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(buffer.data());
        bytes
    }

    #[test]
    fn buffer_header_round_trip() {
        let buffer = MessageBuffer::new(0xC0FFEE, 7, b"payload", Vec::new());
        assert_eq!(buffer.endpoint_magic(), 0xC0FFEE);
        assert_eq!(buffer.message_id(), 7);
        assert_eq!(&buffer.data()[HEADER_SIZE..], b"payload");
        assert_eq!(read_u32(buffer.data(), 8), 0);
    }

    #[test]
    fn parse_ordinary_message() {
        let buffer = MessageBuffer::new(1, 7, &[0xDE, 0xAD, 0xBE, 0xEF], Vec::new());
        let mut fds = FdQueue::new();
        let Envelope::Message(message) = parse_body(buffer.data(), &mut fds).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.endpoint_magic(), 1);
        assert_eq!(message.message_id(), 7);
        assert_eq!(message.payload(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(message.fds().is_empty());
    }

    #[test]
    fn parse_acknowledgement() {
        let buffer = acknowledgement(9, 3);
        let mut fds = FdQueue::new();
        let Envelope::Acknowledgement { endpoint_magic, ack_count } = parse_body(buffer.data(), &mut fds).unwrap()
        else {
            panic!("expected acknowledgement");
        };
        assert_eq!(endpoint_magic, 9);
        assert_eq!(ack_count, 3);
    }

    #[test]
    fn message_consumes_own_descriptors() {
        let buffer = MessageBuffer::new(1, 8, b"with fd", vec![test_fd()]);
        let mut fds = FdQueue::new();
        for fd in buffer.fds() {
            let raw = fd.as_raw_fd();
            fds.enqueue(unsafe { OwnedFd::from_raw_fd(libc::dup(raw)) });
        }
        let Envelope::Message(message) = parse_body(buffer.data(), &mut fds).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.fds().len(), 1);
        assert!(fds.is_empty());
    }

    #[test]
    fn missing_descriptors_leaves_queue_untouched() {
        let buffer = MessageBuffer::new(1, 8, b"", vec![test_fd(), test_fd()]);
        let mut fds = FdQueue::new();
        fds.enqueue(test_fd());
        assert!(matches!(
            parse_body(buffer.data(), &mut fds),
            Err(ProtocolError::MissingDescriptors { expected: 2, available: 1 })
        ));
        assert_eq!(fds.len(), 1);
    }

    #[test]
    fn wrapper_collapses_to_inner_message() {
        let inner = MessageBuffer::new(4, 21, b"big payload", Vec::new());
        let inner_data = inner.data().to_vec();
        let wrapper = wrap_large_message(inner);
        assert_eq!(wrapper.message_id(), LARGE_WRAPPER_ID);
        assert_eq!(wrapper.endpoint_magic(), 4);
        assert_eq!(&wrapper.data()[HEADER_SIZE..], &inner_data[..]);

        let mut fds = FdQueue::new();
        let Envelope::Message(message) = parse_body(wrapper.data(), &mut fds).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.message_id(), 21);
        assert_eq!(message.payload(), b"big payload");
    }

    #[test]
    fn wrapper_hands_descriptors_to_inner() {
        let inner = MessageBuffer::new(4, 22, b"fd payload", vec![test_fd(), test_fd()]);
        let wrapper = wrap_large_message(inner);
        assert_eq!(read_u32(wrapper.data(), 8), 2);

        let mut fds = FdQueue::new();
        for fd in wrapper.fds() {
            fds.enqueue(unsafe { OwnedFd::from_raw_fd(libc::dup(fd.as_raw_fd())) });
        }
        let Envelope::Message(message) = parse_body(wrapper.data(), &mut fds).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.fds().len(), 2);
        assert!(fds.is_empty());
    }

    #[test]
    fn wrapper_fd_count_mismatch_rejected() {
        // Forge a wrapper claiming one more descriptor than the inner
        // header declares; the surplus must not leak to a later message.
        let inner = MessageBuffer::new(4, 23, b"inner", Vec::new());
        let mut body = Vec::new();
        body.extend_from_slice(&4u32.to_le_bytes());
        body.extend_from_slice(&LARGE_WRAPPER_ID.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(inner.data());

        let mut fds = FdQueue::new();
        fds.enqueue(test_fd());
        assert!(matches!(
            parse_body(&body, &mut fds),
            Err(ProtocolError::WrapperFdCountMismatch { wrapper: 1, inner: 0 })
        ));
        assert_eq!(fds.len(), 1, "queue must be untouched on error");
    }

    #[test]
    fn wrapped_acknowledgement_rejected() {
        let wrapper = wrap_large_message(acknowledgement(4, 1));
        let mut fds = FdQueue::new();
        assert!(matches!(parse_body(wrapper.data(), &mut fds), Err(ProtocolError::WrappedAcknowledgement)));
    }

    #[test]
    fn parse_then_reencode_is_identity() {
        let original = MessageBuffer::new(3, 11, b"round trip", Vec::new());
        let mut fds = FdQueue::new();
        let Envelope::Message(message) = parse_body(original.data(), &mut fds).unwrap() else {
            panic!("expected message");
        };
        let reencoded = message.into_buffer();
        assert_eq!(reencoded.data(), original.data());
    }

    #[test]
    fn fd_queue_front_replay_preserves_order() {
        let mut queue = FdQueue::new();
        let fds: Vec<OwnedFd> = (0..3).map(|_| test_fd()).collect();
        let raws: Vec<i32> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        for fd in fds {
            queue.enqueue(fd);
        }

        let taken = queue.take(2).unwrap();
        assert_eq!(taken[0].as_raw_fd(), raws[0]);
        assert_eq!(taken[1].as_raw_fd(), raws[1]);

        queue.return_to_front(taken);
        let taken = queue.take(3).unwrap();
        let order: Vec<i32> = taken.iter().map(|fd| fd.as_raw_fd()).collect();
        assert_eq!(order, raws);
    }

    #[test]
    fn cursor_walks_frames_and_stops_on_partial() {
        let first = MessageBuffer::new(1, 7, b"one", Vec::new());
        let second = MessageBuffer::new(1, 8, b"two", Vec::new());
        let mut bytes = frame(&first);
        bytes.extend_from_slice(&frame(&second));
        let full_len = bytes.len();
        bytes.truncate(full_len - 2);

        let mut cursor = FrameCursor::new(&bytes);
        let body = cursor.peek_frame().unwrap();
        assert_eq!(&body[HEADER_SIZE..], b"one");
        cursor.advance();

        assert!(cursor.peek_frame().is_none());
        assert_eq!(cursor.consumed(), LENGTH_PREFIX_SIZE + first.data().len());
    }

    #[test]
    fn cursor_stops_on_zero_length() {
        let mut bytes = 0u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let cursor = FrameCursor::new(&bytes);
        assert!(cursor.peek_frame().is_none());
        assert_eq!(cursor.consumed(), 0);
    }

    #[test]
    fn cursor_split_at_every_boundary() {
        let first = MessageBuffer::new(1, 7, &[0xAA; 9], Vec::new());
        let second = MessageBuffer::new(1, 8, &[0xBB; 5], Vec::new());
        let mut bytes = frame(&first);
        bytes.extend_from_slice(&frame(&second));

        for split in 0..=bytes.len() {
            let head = &bytes[..split];
            let mut cursor = FrameCursor::new(head);
            let mut seen = Vec::new();
            while let Some(body) = cursor.peek_frame() {
                let mut fds = FdQueue::new();
                let Envelope::Message(message) = parse_body(body, &mut fds).unwrap() else {
                    panic!("expected message");
                };
                seen.push(message.message_id());
                cursor.advance();
            }

            // The tail must re-parse cleanly when the rest arrives.
            let mut replay = head[cursor.consumed()..].to_vec();
            replay.extend_from_slice(&bytes[split..]);
            let mut cursor = FrameCursor::new(&replay);
            while let Some(body) = cursor.peek_frame() {
                let mut fds = FdQueue::new();
                let Envelope::Message(message) = parse_body(body, &mut fds).unwrap() else {
                    panic!("expected message");
                };
                seen.push(message.message_id());
                cursor.advance();
            }
            assert_eq!(seen, vec![7, 8], "split at {split}");
        }
    }

    #[test]
    fn hex_dump_format() {
        assert_eq!(hex_dump(&[0xDE, 0xAD]), "de ad");
        let dump = hex_dump(&[0u8; 17]);
        assert_eq!(dump.lines().count(), 2);
        let dump = hex_dump(&[0u8; 300]);
        assert!(dump.ends_with("... 44 more bytes"));
    }
}
