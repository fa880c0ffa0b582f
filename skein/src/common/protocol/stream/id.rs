// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::StreamError;
use crate::common::protocol::connection::ConnectionSide;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct StreamId(u64);

/// Largest identifier either side may assign
pub const MAX_STREAM_ID: u64 = (1 << 62) - 1;

impl StreamId {
  /// Identifier reserved for connection-level frames
  pub const CONTROL: StreamId = StreamId(0);

  pub const fn new(inner: u64) -> StreamId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }

  pub fn is_control(&self) -> bool {
    self.0 == 0
  }

  /// The side whose identifier space contains this id
  ///
  /// Connecting sides initiate odd identifiers, listening sides even ones.
  pub fn initiator(&self) -> Option<ConnectionSide> {
    match self.0 {
      0 => None,
      id if id % 2 == 1 => Some(ConnectionSide::Connect),
      _ => Some(ConnectionSide::Listen),
    }
  }
}

impl From<u64> for StreamId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<StreamId> for u64 {
  fn from(id: StreamId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("StreamId").field(&self.0).finish()
  }
}

impl std::fmt::Display for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hands out the identifiers of one side's space in increasing order, never reusing one
#[derive(Debug, Clone)]
pub struct StreamIdAllocator {
  initiator: ConnectionSide,
  next: u64,
}

impl StreamIdAllocator {
  pub fn for_initiator(initiator: ConnectionSide) -> Self {
    let next = match initiator {
      ConnectionSide::Connect => 1,
      ConnectionSide::Listen => 2,
    };
    Self { initiator, next }
  }

  pub fn initiator(&self) -> ConnectionSide {
    self.initiator
  }

  /// The identifier the next successful reservation will produce
  pub fn peek(&self) -> Result<StreamId, StreamError> {
    if self.next > MAX_STREAM_ID {
      Err(StreamError::StreamIdsExhausted)
    } else {
      Ok(StreamId(self.next))
    }
  }

  pub fn reserve(&mut self) -> Result<StreamId, StreamError> {
    let id = self.peek()?;
    self.next += 2;
    Ok(id)
  }

  /// Whether `id` belongs to this space and has not yet been passed
  pub fn can_accept(&self, id: StreamId) -> bool {
    id.initiator() == Some(self.initiator) && id.0 >= self.next && id.0 <= MAX_STREAM_ID
  }

  /// Accepts a peer-chosen identifier; skipped identifiers are never issued afterwards
  pub fn accept(&mut self, id: StreamId) -> bool {
    if !self.can_accept(id) {
      return false;
    }
    self.next = id.0 + 2;
    true
  }
}
