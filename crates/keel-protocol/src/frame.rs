// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for the invocation stream.
//!
//! The stream carries a sequence of messages with the following frame format:
//! - 8 bytes: header (type, flags, payload length), see [`crate::header`]
//! - N bytes: protobuf payload
//!
//! Payloads are read into buffers rented from a [`BufferPool`].

use bytes::Bytes;
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::header::{HEADER_SIZE, MessageHeader, MessageType, UnknownMessageType};
use crate::messages::ProtocolMessage;
use crate::pool::{BufferPool, PooledBuffer};

/// Default maximum payload size (32 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Default payload size above which a warning is logged (10 MB)
pub const DEFAULT_MESSAGE_SIZE_WARNING: usize = 10 * 1024 * 1024;

/// Errors that can occur during message encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message too large: {size} bytes (max: {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    UnknownMessageType(#[from] UnknownMessageType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: MessageType,
    },

    #[error("connection closed")]
    ConnectionClosed,
}

/// Size limits applied while reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub max_message_size: usize,
    pub message_size_warning: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_size_warning: DEFAULT_MESSAGE_SIZE_WARNING,
        }
    }
}

/// A message as read from the wire: header plus an optional pooled payload.
///
/// The payload buffer is released when the message is dropped, unless it
/// was moved out with [`RawMessage::detach_payload`] first.
#[derive(Debug)]
pub struct RawMessage {
    header: MessageHeader,
    payload: Option<PooledBuffer>,
}

impl RawMessage {
    pub fn header(&self) -> MessageHeader {
        self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type()
    }

    /// Payload view, empty when there is none or it was detached.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Move the payload buffer out. Later calls return `None` and dropping
    /// the message no longer touches the buffer.
    pub fn detach_payload(&mut self) -> Option<PooledBuffer> {
        self.payload.take()
    }

    /// Decode the payload as a protobuf message
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload())?)
    }
}

/// Read one message from an async reader.
///
/// EOF before the first header byte is [`FrameError::ConnectionClosed`];
/// EOF anywhere inside a frame is an I/O error.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    pool: &BufferPool,
    config: &FrameConfig,
) -> Result<RawMessage, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete message header",
            )));
        }
        filled += n;
    }

    let header = MessageHeader::decode(u64::from_be_bytes(header))?;
    let length = header.payload_len() as usize;

    if length > config.max_message_size {
        return Err(FrameError::MessageTooLarge {
            size: length,
            limit: config.max_message_size,
        });
    }
    if length > config.message_size_warning {
        warn!(
            message_type = %header.message_type(),
            size = length,
            warning_threshold = config.message_size_warning,
            "Received unusually large message"
        );
    }

    if length == 0 {
        return Ok(RawMessage {
            header,
            payload: None,
        });
    }

    // On a short read the buffer is dropped here and goes back to the pool
    let mut payload = pool.rent(length);
    reader.read_exact(&mut payload).await?;

    Ok(RawMessage {
        header,
        payload: Some(payload),
    })
}

/// Write a message to an async writer
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ProtocolMessage,
) -> Result<(), FrameError> {
    let encoded: Bytes = message.encode();
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Framed codec for reading and writing protocol messages on a stream
pub struct FramedStream<S> {
    stream: S,
    pool: BufferPool,
    config: FrameConfig,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S, pool: BufferPool, config: FrameConfig) -> Self {
        Self {
            stream,
            pool,
            config,
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next raw message from the stream
    pub async fn read_raw(&mut self) -> Result<RawMessage, FrameError> {
        read_message(&mut self.stream, &self.pool, &self.config).await
    }

    /// Read and decode the next message from the stream
    pub async fn read_message(&mut self) -> Result<ProtocolMessage, FrameError> {
        ProtocolMessage::decode(self.read_raw().await?)
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a message to the stream and flush it
    pub async fn write_message(&mut self, message: &ProtocolMessage) -> Result<(), FrameError> {
        write_message(&mut self.stream, message).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Close the write direction; the peer reads EOF.
    pub async fn close(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
