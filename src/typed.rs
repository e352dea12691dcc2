//! Typed message helpers over jsony binary payloads.
//!
//! Generating typed message classes per endpoint is out of scope for this
//! crate; this module is the hand-rolled equivalent. A payload type binds
//! itself to a message id, encodes with jsony's binary format and decodes
//! straight out of a received [`Message`].

use std::os::fd::OwnedFd;

use crate::wire::{Message, MessageBuffer};

/// A payload type bound to a message id within an endpoint namespace.
pub trait TypedMessage: jsony::ToBinary {
    const MESSAGE_ID: u32;
}

/// Encodes a typed payload into a transferable buffer.
pub fn encode_message<T: TypedMessage>(endpoint_magic: u32, message: &T, fds: Vec<OwnedFd>) -> MessageBuffer {
    MessageBuffer::new(endpoint_magic, T::MESSAGE_ID, &jsony::to_binary(message), fds)
}

/// Failure to decode a received payload into its typed form.
#[derive(Debug)]
pub struct PayloadDecodeError {
    pub message_id: u32,
}

impl std::fmt::Display for PayloadDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to decode payload of message {:#x}", self.message_id)
    }
}

impl std::error::Error for PayloadDecodeError {}

/// Decodes a received message's payload, borrowing from the message.
pub fn decode_payload<'a, T: jsony::FromBinary<'a>>(message: &'a Message) -> Result<T, PayloadDecodeError> {
    jsony::from_binary(message.payload()).map_err(|_| PayloadDecodeError { message_id: message.message_id() })
}
