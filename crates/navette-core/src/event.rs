//! Internal events flowing from the I/O tasks to the connection's dispatch
//! loop. Only the sender and receiver tasks hold producers; when both exit,
//! the channel closes and the dispatch loop winds down.

use crate::error::CodecError;
use crate::message::Message;

#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// The receiver decoded a complete message.
    Received(Message),
    /// The receiver hit a framing or I/O fault and exited.
    ReceiverFault(CodecError),
    /// The receiver saw a clean end of stream.
    ReceiverClosed,
    /// The writer task hit an encode or I/O fault and exited.
    WriterFault(String),
}
