//! Channel identifiers.
//!
//! The link multiplexes sixteen logical channels. The core routes by id
//! and treats the assignment as opaque; which service talks on which
//! channel is the embedding application's business. The well-known
//! assignments below match the Android Auto service discovery layout.

use std::fmt;

/// Number of channel slots on the wire (4-bit id space).
pub const MAX_CHANNELS: usize = 16;

/// A 4-bit logical channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

/// Control channel: version exchange, TLS handshake, service discovery.
pub const CONTROL: ChannelId = ChannelId(0);
/// Touch and button input events.
pub const INPUT: ChannelId = ChannelId(1);
/// Vehicle sensor data (speed, gear, night mode).
pub const SENSOR: ChannelId = ChannelId(2);
/// H.264 video stream.
pub const VIDEO: ChannelId = ChannelId(3);
/// Media playback audio.
pub const MEDIA_AUDIO: ChannelId = ChannelId(4);
/// Assistant speech audio.
pub const SPEECH_AUDIO: ChannelId = ChannelId(5);
/// System notification audio.
pub const SYSTEM_AUDIO: ChannelId = ChannelId(6);
/// Microphone audio towards the device.
pub const AV_INPUT: ChannelId = ChannelId(7);
/// Bluetooth pairing service.
pub const BLUETOOTH: ChannelId = ChannelId(8);
/// Wireless projection service.
pub const WIFI: ChannelId = ChannelId(9);
/// Media browser service.
pub const MEDIA_BROWSER: ChannelId = ChannelId(10);

impl ChannelId {
    /// Construct from a wire byte. Returns `None` for ids outside the
    /// 4-bit channel space.
    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < MAX_CHANNELS {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// The wire byte.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Index into per-channel tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", channel_name(*self), self.0)
    }
}

/// Human-readable name for a channel id.
pub fn channel_name(id: ChannelId) -> &'static str {
    match id.0 {
        0 => "CONTROL",
        1 => "INPUT",
        2 => "SENSOR",
        3 => "VIDEO",
        4 => "MEDIA_AUDIO",
        5 => "SPEECH_AUDIO",
        6 => "SYSTEM_AUDIO",
        7 => "AV_INPUT",
        8 => "BLUETOOTH",
        9 => "WIFI",
        10 => "MEDIA_BROWSER",
        _ => "RESERVED",
    }
}
