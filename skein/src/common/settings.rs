// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Connection-wide settings advertised to the peer
//!
//! Each side advertises its own settings; streams snapshot both sides at creation.
//! Values are validated against fixed ranges before they are ever applied.

use serde::{Deserialize, Serialize};

pub const MIN_WINDOW_SIZE: u32 = 1024;
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
pub const MIN_FRAME_SIZE: u32 = 16_384;
pub const MAX_FRAME_SIZE: u32 = 16_777_215;
pub const MIN_STREAM_BUFFER_SIZE: u32 = 1024;
pub const MAX_STREAM_BUFFER_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingName {
  MaxConcurrentStreams,
  InitialWindowSize,
  MaxFrameSize,
  StreamBufferSize,
}

impl std::fmt::Display for SettingName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      SettingName::MaxConcurrentStreams => "max_concurrent_streams",
      SettingName::InitialWindowSize => "initial_window_size",
      SettingName::MaxFrameSize => "max_frame_size",
      SettingName::StreamBufferSize => "stream_buffer_size",
    })
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
  #[error("Setting {setting} has value {value}, outside of the permitted range {min}..={max}")]
  OutOfRange {
    setting: SettingName,
    value: u32,
    min: u32,
    max: u32,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
  /// Streams the advertising side will accept from its peer at once
  pub max_concurrent_streams: u32,
  /// Advisory per-stream receive window, in bytes
  pub initial_window_size: u32,
  /// Largest frame payload the advertising side will accept
  pub max_frame_size: u32,
  /// Bytes buffered per stream between the connection and the stream's owner
  pub stream_buffer_size: u32,
  /// Whether streams may carry extension sessions
  pub enable_extension_sessions: bool,
}

impl Default for ConnectionSettings {
  fn default() -> Self {
    Self {
      max_concurrent_streams: 100,
      initial_window_size: 65_535,
      max_frame_size: MIN_FRAME_SIZE,
      stream_buffer_size: 64 * 1024,
      enable_extension_sessions: false,
    }
  }
}

fn check_range(setting: SettingName, value: u32, min: u32, max: u32) -> Result<(), SettingsError> {
  if (min..=max).contains(&value) {
    Ok(())
  } else {
    Err(SettingsError::OutOfRange {
      setting,
      value,
      min,
      max,
    })
  }
}

impl ConnectionSettings {
  pub fn validate(&self) -> Result<(), SettingsError> {
    check_range(
      SettingName::MaxConcurrentStreams,
      self.max_concurrent_streams,
      0,
      u32::MAX,
    )?;
    check_range(
      SettingName::InitialWindowSize,
      self.initial_window_size,
      MIN_WINDOW_SIZE,
      MAX_WINDOW_SIZE,
    )?;
    check_range(
      SettingName::MaxFrameSize,
      self.max_frame_size,
      MIN_FRAME_SIZE,
      MAX_FRAME_SIZE,
    )?;
    check_range(
      SettingName::StreamBufferSize,
      self.stream_buffer_size,
      MIN_STREAM_BUFFER_SIZE,
      MAX_STREAM_BUFFER_SIZE,
    )?;
    Ok(())
  }

  pub fn validated(self) -> Result<Self, SettingsError> {
    self.validate().map(|()| self)
  }

  pub fn with_max_concurrent_streams(self, max_concurrent_streams: u32) -> Self {
    Self {
      max_concurrent_streams,
      ..self
    }
  }

  pub fn with_extension_sessions(self, enable_extension_sessions: bool) -> Self {
    Self {
      enable_extension_sessions,
      ..self
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{ConnectionSettings, SettingName, SettingsError, MAX_FRAME_SIZE, MIN_WINDOW_SIZE};

  #[test]
  fn defaults_are_valid() {
    ConnectionSettings::default()
      .validate()
      .expect("Default settings must validate");
  }

  #[test]
  fn window_below_minimum_is_rejected() {
    let settings = ConnectionSettings {
      initial_window_size: MIN_WINDOW_SIZE - 1,
      ..Default::default()
    };
    assert_eq!(
      settings.validate(),
      Err(SettingsError::OutOfRange {
        setting: SettingName::InitialWindowSize,
        value: MIN_WINDOW_SIZE - 1,
        min: MIN_WINDOW_SIZE,
        max: super::MAX_WINDOW_SIZE,
      })
    );
  }

  #[test]
  fn frame_size_above_maximum_is_rejected() {
    let settings = ConnectionSettings {
      max_frame_size: MAX_FRAME_SIZE + 1,
      ..Default::default()
    };
    assert!(matches!(
      settings.validated(),
      Err(SettingsError::OutOfRange {
        setting: SettingName::MaxFrameSize,
        ..
      })
    ));
  }

  #[test]
  fn zero_concurrency_is_permitted() {
    ConnectionSettings::default()
      .with_max_concurrent_streams(0)
      .validate()
      .unwrap();
  }

  #[test]
  fn partial_json_fills_defaults() {
    let settings: ConnectionSettings =
      serde_json::from_str(r#"{ "max_concurrent_streams": 2 }"#).unwrap();
    assert_eq!(settings.max_concurrent_streams, 2);
    assert_eq!(
      settings.initial_window_size,
      ConnectionSettings::default().initial_window_size
    );
  }
}
