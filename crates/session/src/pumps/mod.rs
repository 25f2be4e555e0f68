//! Background tasks driving one gateway WebSocket.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
