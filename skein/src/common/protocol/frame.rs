// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Wire frames multiplexed over a connection's channel
//!
//! Every frame is a 13-byte header (`stream_id: u64`, `kind: u8`, `length: u32`, all
//! big-endian) followed by `length` payload bytes.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::stream::StreamId;
use crate::common::settings::ConnectionSettings;

pub const HEADER_LENGTH: usize = 8 + 1 + 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
  /// JSON-encoded [ConnectionSettings]; control stream only
  Settings = 0,
  Open = 1,
  Data = 2,
  /// The sender will send no more data on the stream
  Finish = 3,
  /// Abrupt termination carrying a `u32` code
  Reset = 4,
  /// Connection teardown; control stream only
  GoAway = 5,
  /// Grants the receiver of this frame `u32` more bytes of send credit on the stream
  WindowUpdate = 6,
}

impl TryFrom<u8> for FrameKind {
  type Error = FrameReadError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    Ok(match value {
      0 => FrameKind::Settings,
      1 => FrameKind::Open,
      2 => FrameKind::Data,
      3 => FrameKind::Finish,
      4 => FrameKind::Reset,
      5 => FrameKind::GoAway,
      6 => FrameKind::WindowUpdate,
      unknown => return Err(FrameReadError::UnknownKind(unknown)),
    })
  }
}

impl FrameKind {
  fn is_connection_level(&self) -> bool {
    matches!(self, FrameKind::Settings | FrameKind::GoAway)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  Header,
  Payload { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum FrameReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
  #[error("Unknown frame kind {0}")]
  UnknownKind(u8),
  #[error("Malformed {kind:?} frame on stream {stream_id}: {reason}")]
  Malformed {
    kind: FrameKind,
    stream_id: StreamId,
    reason: &'static str,
  },
  #[error("Failure deserializing settings from frame: {0}")]
  Settings(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum FrameWriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] std::io::Error),
  #[error("Frame payload of {produced} bytes exceeds the encodable maximum")]
  MaxLengthExceeded { produced: usize },
  #[error("Failure serializing settings for frame: {0}")]
  Settings(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub stream_id: StreamId,
  pub kind: FrameKind,
  pub payload: Bytes,
}

impl Frame {
  fn empty(stream_id: StreamId, kind: FrameKind) -> Self {
    Self {
      stream_id,
      kind,
      payload: Bytes::new(),
    }
  }

  pub fn settings(settings: &ConnectionSettings) -> Result<Self, FrameWriteError> {
    Ok(Self {
      stream_id: StreamId::CONTROL,
      kind: FrameKind::Settings,
      payload: Bytes::from(serde_json::to_vec(settings)?),
    })
  }

  pub fn open(stream_id: StreamId) -> Self {
    Self::empty(stream_id, FrameKind::Open)
  }

  pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
    Self {
      stream_id,
      kind: FrameKind::Data,
      payload,
    }
  }

  pub fn finish(stream_id: StreamId) -> Self {
    Self::empty(stream_id, FrameKind::Finish)
  }

  pub fn reset(stream_id: StreamId, code: u32) -> Self {
    Self {
      stream_id,
      kind: FrameKind::Reset,
      payload: Bytes::copy_from_slice(&code.to_be_bytes()),
    }
  }

  pub fn go_away() -> Self {
    Self::empty(StreamId::CONTROL, FrameKind::GoAway)
  }

  pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
    Self {
      stream_id,
      kind: FrameKind::WindowUpdate,
      payload: Bytes::copy_from_slice(&increment.to_be_bytes()),
    }
  }

  pub fn reset_code(&self) -> Option<u32> {
    match self.kind {
      FrameKind::Reset => <[u8; 4]>::try_from(self.payload.as_ref())
        .ok()
        .map(u32::from_be_bytes),
      _ => None,
    }
  }

  pub fn window_increment(&self) -> Option<u32> {
    match self.kind {
      FrameKind::WindowUpdate => <[u8; 4]>::try_from(self.payload.as_ref())
        .ok()
        .map(u32::from_be_bytes),
      _ => None,
    }
  }

  pub fn decode_settings(&self) -> Result<ConnectionSettings, FrameReadError> {
    if self.kind != FrameKind::Settings {
      return Err(self.malformed("expected a settings frame"));
    }
    Ok(serde_json::from_slice(&self.payload)?)
  }

  fn malformed(&self, reason: &'static str) -> FrameReadError {
    FrameReadError::Malformed {
      kind: self.kind,
      stream_id: self.stream_id,
      reason,
    }
  }

  /// Checks the stream and payload constraints of the frame's kind
  pub fn validate(&self) -> Result<(), FrameReadError> {
    if self.kind.is_connection_level() != self.stream_id.is_control() {
      return Err(self.malformed(if self.kind.is_connection_level() {
        "connection-level frame on a stream"
      } else {
        "stream-level frame on the control stream"
      }));
    }
    match self.kind {
      FrameKind::Reset if self.payload.len() != 4 => Err(self.malformed("reset code must be 4 bytes")),
      FrameKind::WindowUpdate if self.window_increment().unwrap_or(0) == 0 => {
        Err(self.malformed("window increment must be a non-zero u32"))
      }
      FrameKind::Open | FrameKind::Finish | FrameKind::GoAway if !self.payload.is_empty() => {
        Err(self.malformed("unexpected payload"))
      }
      _ => Ok(()),
    }
  }
}

/// Reads one frame, or `None` on a clean end-of-stream at a frame boundary
pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_payload: u32,
) -> Result<Option<Frame>, FrameReadError> {
  let mut header = [0u8; HEADER_LENGTH];
  let unexpected_header = |error| FrameReadError::UnexpectedEnd {
    expected: NextExpected::Header,
    error,
  };
  let first = s.read(&mut header).await.map_err(unexpected_header)?;
  if first == 0 {
    return Ok(None);
  }
  if first < HEADER_LENGTH {
    s.read_exact(&mut header[first..])
      .await
      .map_err(unexpected_header)?;
  }
  let (id_bytes, rest) = header.split_at(8);
  let (kind_byte, length_bytes) = rest.split_at(1);
  let stream_id = StreamId::new(u64::from_be_bytes(
    id_bytes.try_into().unwrap_or_default(),
  ));
  let kind = FrameKind::try_from(kind_byte[0])?;
  let length = u32::from_be_bytes(length_bytes.try_into().unwrap_or_default());
  if length > max_payload {
    return Err(FrameReadError::MaxLengthExceeded {
      expected: max_payload as usize,
      received: length as usize,
    });
  }
  let length = length as usize;
  let mut payload = BytesMut::zeroed(length);
  s.read_exact(&mut payload)
    .await
    .map_err(|error| FrameReadError::UnexpectedEnd {
      expected: NextExpected::Payload { length },
      error,
    })?;
  let frame = Frame {
    stream_id,
    kind,
    payload: payload.freeze(),
  };
  frame.validate()?;
  tracing::trace!(stream = %frame.stream_id, kind = ?frame.kind, length, "Frame read");
  Ok(Some(frame))
}

/// Writes one frame without flushing
pub async fn write_frame<T: AsyncWrite + Unpin>(
  mut s: T,
  frame: &Frame,
) -> Result<(), FrameWriteError> {
  let length = u32::try_from(frame.payload.len()).map_err(|_| FrameWriteError::MaxLengthExceeded {
    produced: frame.payload.len(),
  })?;
  let mut header = BytesMut::with_capacity(HEADER_LENGTH);
  header.put_u64(frame.stream_id.inner());
  header.put_u8(frame.kind as u8);
  header.put_u32(length);
  s.write_all(&header).await?;
  s.write_all(&frame.payload).await?;
  tracing::trace!(stream = %frame.stream_id, kind = ?frame.kind, length, "Frame written");
  Ok(())
}
