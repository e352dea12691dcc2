//! Bidirectional, message-oriented IPC between cooperating processes on one
//! host, multiplexing typed messages and file descriptors over a single
//! unix stream socket.
//!
//! The crate is the connection core: framing, descriptor bookkeeping,
//! asynchronous send from any thread, synchronous request/reply waits,
//! in-band acknowledgements for flow tracking, oversize-message wrapping
//! and a liveness watchdog. Message *contents* stay opaque — an
//! application supplies a [`Stub`] that decodes and dispatches payloads
//! for its endpoint.
//!
//! # Wire Format
//!
//! Each frame is a little-endian length prefix followed by a message body:
//!
//! ```text
//! +0  length:         u32  - Body length in bytes (0 is never emitted)
//! +4  endpoint_magic: u32  - Which side's message namespace
//! +8  message_id:     u32  - Message discriminant
//! +12 fd_count:       u32  - Descriptors attached to this message
//! +16 payload bytes
//! ```
//!
//! Descriptors ride out-of-band via SCM_RIGHTS and are consumed in strict
//! FIFO order. Two message ids are reserved on every endpoint: batched
//! acknowledgements and the wrapper envelope for bodies larger than
//! [`SOCKET_BUFFER_SIZE`].
//!
//! # Examples
//!
//! A server handling one endpoint over a socketpair:
//!
//! ```ignore
//! struct Echo;
//!
//! impl Stub for Echo {
//!     fn handle(&mut self, message: Message) -> anyhow::Result<Option<MessageBuffer>> {
//!         let reply = MessageBuffer::new(SERVER_MAGIC, message.message_id() + 1, message.payload(), Vec::new());
//!         Ok(Some(reply))
//!     }
//! }
//!
//! let mut event_loop = EventLoop::new()?;
//! let transport = TransportSocket::new(socket)?;
//! let connection = Connection::attach(&mut event_loop, transport, Box::new(Echo), SERVER_MAGIC, CLIENT_MAGIC, Arc::new(()))?;
//! event_loop.run();
//! ```
//!
//! A client doing a synchronous call:
//!
//! ```ignore
//! connection.post_message(MessageBuffer::new(SERVER_MAGIC, 7, request, Vec::new()))?;
//! let reply = connection.wait_for_specific_endpoint_message(SERVER_MAGIC, 8);
//! ```

pub mod connection;
pub mod event_loop;
mod queue;
pub mod transport;
pub mod typed;
pub mod wire;

pub use connection::{Connection, ConnectionError, ConnectionHooks, RESPONSIVENESS_TIMEOUT, Stub};
pub use event_loop::{EventLoop, HookAction, LoopHandle, TimerHandle};
pub use queue::NeedsAcknowledgement;
pub use transport::{SOCKET_BUFFER_SIZE, TransportSocket};
pub use wire::{ACKNOWLEDGEMENT_ID, FdQueue, LARGE_WRAPPER_ID, Message, MessageBuffer};
