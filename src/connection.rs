//! Connection state machine between the transport and the endpoint stub.
//!
//! One connection owns one transport. The event-loop thread drains inbound
//! bytes and dispatches messages; a dedicated sender thread is the sole
//! writer of the transport; any thread may post. Every parsed message is
//! reported back to the peer through batched acknowledgements, and a
//! single-shot watchdog flags peers that go silent after outbound traffic.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::event_loop::{EventLoop, HookAction, LoopHandle, TimerHandle};
use crate::queue::{AcknowledgementWaitQueue, NeedsAcknowledgement, SendItem, SendQueue};
use crate::transport::{DrainStatus, SOCKET_BUFFER_SIZE, TransportSocket};
use crate::wire::{self, Envelope, FdQueue, FrameCursor, Message, MessageBuffer};

/// How long after posting a message the watchdog waits for inbound bytes
/// before reporting the peer unresponsive.
pub const RESPONSIVENESS_TIMEOUT: Duration = Duration::from_millis(3000);

/// Application-side handler for messages addressed to the local endpoint.
pub trait Stub: Send {
    /// Handles one inbound message. A returned buffer is posted back as a
    /// reply (encoded on the local endpoint magic, acknowledged).
    fn handle(&mut self, message: Message) -> anyhow::Result<Option<MessageBuffer>>;
}

/// Lifecycle and liveness callbacks injected by the connection owner.
///
/// Callbacks run on the thread driving the connection's drains and must not
/// reenter [`Connection::wait_for_specific_endpoint_message`].
pub trait ConnectionHooks: Send + Sync {
    /// The connection was shut down. Runs exactly once.
    fn die(&self) {}
    /// No inbound bytes within the responsiveness window after a post.
    fn may_have_become_unresponsive(&self) {}
    /// Inbound bytes arrived.
    fn did_become_responsive(&self) {}
}

impl ConnectionHooks for () {}

/// Errors surfaced by the connection facade.
#[derive(Debug)]
pub enum ConnectionError {
    /// Post attempted while the transport is closed.
    ShutdownInProgress,
    /// The peer closed the transport.
    PeerDisconnected,
    /// A drain left residual bytes while residue already existed.
    ResidualConflict,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShutdownInProgress => write!(f, "message posted during connection shutdown"),
            Self::PeerDisconnected => write!(f, "peer closed the connection"),
            Self::ResidualConflict => write!(f, "residual bytes left over from a previous drain"),
        }
    }
}

impl std::error::Error for ConnectionError {}

struct ReceiverState {
    stub: Option<Box<dyn Stub>>,
    unprocessed_bytes: Vec<u8>,
    unprocessed_fds: FdQueue,
    unprocessed_messages: VecDeque<Message>,
}

pub struct Connection {
    transport: Arc<TransportSocket>,
    send_queue: Arc<SendQueue>,
    acknowledgement_wait_queue: Arc<AcknowledgementWaitQueue>,
    local_endpoint_magic: u32,
    peer_endpoint_magic: u32,
    hooks: Arc<dyn ConnectionHooks>,
    responsiveness_timer: TimerHandle,
    loop_handle: LoopHandle,
    weak_self: Weak<Connection>,
    receiver: Mutex<ReceiverState>,
    died: AtomicBool,
}

impl Connection {
    /// Attaches a connection to the event loop: registers the readable
    /// hook, creates the responsiveness watchdog and spawns the sender
    /// thread. The transport must already be connected.
    pub fn attach(
        event_loop: &mut EventLoop,
        transport: TransportSocket,
        stub: Box<dyn Stub>,
        local_endpoint_magic: u32,
        peer_endpoint_magic: u32,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> io::Result<Arc<Connection>> {
        Self::attach_inner(
            event_loop,
            transport,
            stub,
            local_endpoint_magic,
            peer_endpoint_magic,
            hooks,
            RESPONSIVENESS_TIMEOUT,
        )
    }

    fn attach_inner(
        event_loop: &mut EventLoop,
        transport: TransportSocket,
        stub: Box<dyn Stub>,
        local_endpoint_magic: u32,
        peer_endpoint_magic: u32,
        hooks: Arc<dyn ConnectionHooks>,
        responsiveness_timeout: Duration,
    ) -> io::Result<Arc<Connection>> {
        let transport = Arc::new(transport);
        let transport_fd = transport.raw_fd();
        let send_queue = Arc::new(SendQueue::new());
        let acknowledgement_wait_queue = Arc::new(AcknowledgementWaitQueue::new());

        let connection = Arc::new_cyclic(|weak: &Weak<Connection>| {
            let timer_weak = weak.clone();
            let responsiveness_timer = event_loop.add_single_shot_timer(
                responsiveness_timeout,
                Box::new(move || {
                    let Some(connection) = timer_weak.upgrade() else {
                        return HookAction::Remove;
                    };
                    connection.hooks.may_have_become_unresponsive();
                    HookAction::Keep
                }),
            );

            Connection {
                transport: transport.clone(),
                send_queue: send_queue.clone(),
                acknowledgement_wait_queue: acknowledgement_wait_queue.clone(),
                local_endpoint_magic,
                peer_endpoint_magic,
                hooks,
                responsiveness_timer,
                loop_handle: event_loop.handle(),
                weak_self: weak.clone(),
                receiver: Mutex::new(ReceiverState {
                    stub: Some(stub),
                    unprocessed_bytes: Vec::new(),
                    unprocessed_fds: FdQueue::new(),
                    unprocessed_messages: VecDeque::new(),
                }),
                died: AtomicBool::new(false),
            }
        });

        // The sender thread owns clones of the shared handles, never the
        // connection itself, so it cannot keep a dead connection alive.
        {
            let send_queue = send_queue.clone();
            let acknowledgement_wait_queue = acknowledgement_wait_queue.clone();
            let transport = transport.clone();
            std::thread::spawn(move || {
                while let Some(SendItem { buffer, needs_acknowledgement }) = send_queue.pop_blocking() {
                    // Append before transmitting: an acknowledgement must
                    // never race past its own entry.
                    if needs_acknowledgement == NeedsAcknowledgement::Yes {
                        acknowledgement_wait_queue.append(MessageBuffer::from_data(buffer.data().to_vec()));
                    }
                    if let Err(err) = transport.write_frame(&buffer) {
                        kvlog::warn!("Failed to transfer message", ?err, message_id = buffer.message_id());
                        if needs_acknowledgement == NeedsAcknowledgement::Yes {
                            acknowledgement_wait_queue.remove_last();
                        }
                    }
                }
            });
        }

        let readable_weak = Arc::downgrade(&connection);
        event_loop.register_readable(
            transport_fd,
            Box::new(move || {
                // Strong self-reference for the duration of the callback;
                // a handler may release the owner's reference.
                let Some(connection) = readable_weak.upgrade() else {
                    return HookAction::Remove;
                };
                let _ = connection.drain_messages_from_peer();
                connection.handle_messages();
                if connection.is_open() { HookAction::Keep } else { HookAction::Remove }
            }),
        )?;

        Ok(connection)
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn local_endpoint_magic(&self) -> u32 {
        self.local_endpoint_magic
    }

    pub fn peer_endpoint_magic(&self) -> u32 {
        self.peer_endpoint_magic
    }

    /// Frames transferred but not yet acknowledged by the peer.
    pub fn pending_acknowledgement_count(&self) -> usize {
        self.acknowledgement_wait_queue.len()
    }

    /// Queues a message for asynchronous transfer (acknowledged).
    pub fn post_message(&self, buffer: MessageBuffer) -> Result<(), ConnectionError> {
        self.post_buffer(buffer, NeedsAcknowledgement::Yes)
    }

    /// Queues a message for asynchronous transfer and returns without
    /// waiting for transmission.
    ///
    /// Bodies larger than [`SOCKET_BUFFER_SIZE`] are wrapped in a
    /// large-message envelope; the descriptors transfer to the wrapper.
    pub fn post_buffer(
        &self,
        mut buffer: MessageBuffer,
        needs_acknowledgement: NeedsAcknowledgement,
    ) -> Result<(), ConnectionError> {
        // During shutdown the connection object can outlive the socket.
        if !self.transport.is_open() {
            return Err(ConnectionError::ShutdownInProgress);
        }

        if buffer.data().len() > SOCKET_BUFFER_SIZE {
            buffer = wire::wrap_large_message(buffer);
        }

        self.send_queue.push(SendItem { buffer, needs_acknowledgement });
        self.responsiveness_timer.start();
        Ok(())
    }

    /// Closes the transport and reports `die` to the hooks. Idempotent.
    pub fn shutdown(&self) {
        self.transport.close();
        // The watchdog's registration goes with the connection, not just
        // its arming.
        self.responsiveness_timer.remove();
        if !self.died.swap(true, Ordering::AcqRel) {
            self.hooks.die();
        }
    }

    pub fn shutdown_with_error(&self, err: &dyn std::fmt::Display) {
        kvlog::error!("Connection had an error, disconnecting", %err);
        self.shutdown();
    }

    /// Blocks until a message with the given endpoint magic and id arrives,
    /// draining the transport in place. Unrelated messages accumulate for
    /// the deferred dispatcher. Returns `None` once the connection closes.
    pub fn wait_for_specific_endpoint_message(&self, endpoint_magic: u32, message_id: u32) -> Option<Message> {
        loop {
            // The message may already be waiting; check before blocking.
            {
                let mut receiver = self.receiver.lock().unwrap();
                let position = receiver
                    .unprocessed_messages
                    .iter()
                    .position(|message| message.endpoint_magic() == endpoint_magic && message.message_id() == message_id);
                if let Some(position) = position {
                    return receiver.unprocessed_messages.remove(position);
                }
            }

            if !self.is_open() {
                return None;
            }

            self.transport.wait_until_readable();
            if self.drain_messages_from_peer().is_err() {
                return None;
            }
        }
    }

    /// Drains the transport once: reads everything available, parses whole
    /// frames, batches an acknowledgement, stashes any partial tail and
    /// defers dispatch.
    pub(crate) fn drain_messages_from_peer(&self) -> Result<(), ConnectionError> {
        let mut receiver_guard = self.receiver.lock().unwrap();
        let receiver = &mut *receiver_guard;

        // Residue from the previous drain is prepended to the new bytes.
        let mut bytes = std::mem::take(&mut receiver.unprocessed_bytes);
        let mut received_fds = Vec::new();
        let status = self.transport.read_as_much_as_possible(&mut bytes, &mut received_fds);
        for fd in received_fds {
            receiver.unprocessed_fds.enqueue(fd);
        }

        if status == DrainStatus::Eof {
            // Deferred so the current drain finishes before teardown.
            let weak = self.weak_self.clone();
            self.loop_handle.deferred_invoke(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.shutdown();
                }
            });
        }

        if !bytes.is_empty() {
            self.responsiveness_timer.stop();
            self.hooks.did_become_responsive();
        } else if status == DrainStatus::Eof {
            return Err(ConnectionError::PeerDisconnected);
        }

        let (consumed, pending_ack_count, received_ack_count) =
            Self::try_parse_messages(self.local_endpoint_magic, &bytes, receiver);

        if consumed < bytes.len() {
            if !receiver.unprocessed_bytes.is_empty() {
                drop(receiver_guard);
                self.shutdown_with_error(&ConnectionError::ResidualConflict);
                return Err(ConnectionError::ResidualConflict);
            }
            receiver.unprocessed_bytes = bytes[consumed..].to_vec();
        }

        let queued_messages = !receiver.unprocessed_messages.is_empty();
        drop(receiver_guard);

        if received_ack_count > 0 {
            self.acknowledgement_wait_queue.pop_acknowledged(received_ack_count);
        }

        if self.is_open() && pending_ack_count > 0 {
            let acknowledgement = wire::acknowledgement(self.peer_endpoint_magic, pending_ack_count);
            if let Err(err) = self.post_buffer(acknowledgement, NeedsAcknowledgement::No) {
                kvlog::warn!("Failed to post acknowledgement", %err);
            }
        }

        if queued_messages {
            let weak = self.weak_self.clone();
            self.loop_handle.deferred_invoke(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_messages();
                }
            });
        }

        Ok(())
    }

    /// Walks complete frames, classifying each body. Stops without
    /// consuming the offending frame on any decode failure.
    ///
    /// Returns the consumed byte count, how many messages were queued for
    /// dispatch (each owes the peer one acknowledgement) and how many of
    /// our own frames the peer acknowledged.
    fn try_parse_messages(local_endpoint_magic: u32, bytes: &[u8], receiver: &mut ReceiverState) -> (usize, u32, u32) {
        let mut pending_ack_count: u32 = 0;
        let mut received_ack_count: u32 = 0;
        let mut cursor = FrameCursor::new(bytes);
        while let Some(body) = cursor.peek_frame() {
            match wire::parse_body(body, &mut receiver.unprocessed_fds) {
                Ok(Envelope::Acknowledgement { endpoint_magic, ack_count }) => {
                    if endpoint_magic != local_endpoint_magic {
                        kvlog::error!(
                            "Acknowledgement for foreign endpoint",
                            endpoint_magic,
                            local = local_endpoint_magic
                        );
                        break;
                    }
                    received_ack_count += ack_count;
                }
                Ok(Envelope::Message(message)) => {
                    pending_ack_count += 1;
                    receiver.unprocessed_messages.push_back(message);
                }
                Err(err) => {
                    let dump = wire::hex_dump(body);
                    kvlog::error!("Failed to parse message", %err, %dump);
                    break;
                }
            }
            cursor.advance();
        }
        (cursor.consumed(), pending_ack_count, received_ack_count)
    }

    /// Dispatches everything queued for the local endpoint, posting any
    /// replies the stub produces. Messages for a foreign magic are dropped;
    /// synchronous waiters pull theirs out before this runs.
    pub(crate) fn handle_messages(&self) {
        let (mut stub, messages) = {
            let mut receiver = self.receiver.lock().unwrap();
            let Some(stub) = receiver.stub.take() else {
                return;
            };
            (stub, std::mem::take(&mut receiver.unprocessed_messages))
        };

        for message in messages {
            if message.endpoint_magic() != self.local_endpoint_magic {
                kvlog::debug!(
                    "Dropping message for foreign endpoint",
                    endpoint_magic = message.endpoint_magic(),
                    message_id = message.message_id()
                );
                continue;
            }
            match stub.handle(message) {
                Ok(Some(response)) => {
                    if let Err(err) = self.post_message(response) {
                        kvlog::warn!("Failed to post handler response", %err);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    kvlog::error!("Message handler failed", %err);
                }
            }
        }

        self.receiver.lock().unwrap().stub = Some(stub);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The sender thread exits on its next wakeup and drops its own
        // handles; pending sends are discarded. The watchdog registration
        // is dropped here too, for owners that release an open connection
        // without a shutdown.
        self.responsiveness_timer.remove();
        self.send_queue.stop();
    }
}
