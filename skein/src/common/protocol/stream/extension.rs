// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use downcast_rs::{impl_downcast, DowncastSync};

use super::StreamCloseReason;

/// A higher-level session carried over a single stream
///
/// The stream holds the session until it closes, at which point the session is told
/// its carrier has gone and is released. Consumers recover their concrete session
/// type through downcasting.
pub trait ExtensionSession: DowncastSync + std::fmt::Debug {
  fn on_carrier_closed(&self, reason: &StreamCloseReason);
}
impl_downcast!(sync ExtensionSession);
