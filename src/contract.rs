use std::num::NonZeroU32;
use std::time::Duration;
use std::{fmt, fmt::Display};

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    Mpeg2,
    H264,
    Vc1,
    Wmv3,
    Hevc,
    Vp9,
}

impl Display for StreamCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mpeg2 => f.write_str("mpeg2"),
            Self::H264 => f.write_str("h264"),
            Self::Vc1 => f.write_str("vc1"),
            Self::Wmv3 => f.write_str("wmv3"),
            Self::Hevc => f.write_str("hevc"),
            Self::Vp9 => f.write_str("vp9"),
        }
    }
}

/// Codec identifiers understood by the decoding device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCodec {
    Mpeg2,
    H264,
    Vc1,
    Wmv3,
}

impl Display for DeviceCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mpeg2 => f.write_str("mpeg2"),
            Self::H264 => f.write_str("h264"),
            Self::Vc1 => f.write_str("vc1"),
            Self::Wmv3 => f.write_str("wmv3"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp90k(pub i64);

impl Timestamp90k {
    pub const TICKS_PER_SECOND: i64 = 90_000;

    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        let ticks = duration.as_micros() * Self::TICKS_PER_SECOND as u128 / 1_000_000;
        Self(i64::try_from(ticks).unwrap_or(i64::MAX))
    }
}

impl Display for Timestamp90k {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@90k", self.0)
    }
}

/// One compressed access unit as delivered by the demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub dts: Option<Timestamp90k>,
    pub pts: Option<Timestamp90k>,
}

impl Packet {
    #[must_use]
    pub fn new(data: Vec<u8>, dts: Option<Timestamp90k>, pts: Option<Timestamp90k>) -> Self {
        Self { data, dts, pts }
    }
}

/// A decoded picture handed out by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub dims: Option<Dimensions>,
    pub pts: Option<Timestamp90k>,
    pub dts: Option<Timestamp90k>,
    /// Display duration reported by the device. Zero once the flow
    /// controller has taken ownership of the timing.
    pub duration: Duration,
    pub is_keyframe: bool,
    pub data: Vec<u8>,
}

bitflags! {
    /// Readiness signal returned to the driving loop on every submit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadinessFlags: u8 {
        /// Fetch another demuxer packet and submit it.
        const NEEDS_INPUT = 0b01;
        /// A decoded picture can be fetched.
        const PICTURE_READY = 0b10;
    }
}

impl Display for ReadinessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReadinessFlags(needs_input={}, picture_ready={})",
            self.contains(Self::NEEDS_INPUT),
            self.contains(Self::PICTURE_READY)
        )
    }
}

/// Queue thresholds and waits used by the flow controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTuning {
    /// Input is requested only while the device input queue is below this.
    pub input_low_watermark: u32,
    /// Drain mode stops requesting input once this many pictures are ready.
    pub drain_ready_ceiling: u32,
    /// After startup, input is requested only below this many ready pictures.
    pub started_ready_ceiling: u32,
    /// Pictures are signaled only once more than this many are ready.
    pub startup_ready_threshold: u32,
    pub fallback_pacing: Duration,
    pub input_retry_wait: Duration,
    pub drain_wait: Duration,
    pub default_frame_duration: Duration,
}

impl Default for FlowTuning {
    fn default() -> Self {
        Self {
            input_low_watermark: 2,
            drain_ready_ceiling: 6,
            started_ready_ceiling: 4,
            startup_ready_threshold: 4,
            fallback_pacing: Duration::from_millis(20),
            input_retry_wait: Duration::from_millis(10),
            drain_wait: Duration::from_millis(100),
            // 23.976 fps, nothing better is known until the first picture.
            default_frame_duration: Duration::from_nanos(1_001_000_000_000 / 24_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub codec: StreamCodec,
    /// Codec configuration record (extradata) as found in the container.
    pub codec_config: Option<Vec<u8>>,
    pub force_software: bool,
    pub tuning: FlowTuning,
}

impl DecoderConfig {
    #[must_use]
    pub fn new(codec: StreamCodec) -> Self {
        Self {
            codec,
            codec_config: None,
            force_software: false,
            tuning: FlowTuning::default(),
        }
    }

    #[must_use]
    pub fn with_codec_config(mut self, codec_config: impl Into<Vec<u8>>) -> Self {
        self.codec_config = Some(codec_config.into());
        self
    }

    #[must_use]
    pub fn with_tuning(mut self, tuning: FlowTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

impl Display for DecoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecoderConfig(codec={}, codec_config_len={:?}, force_software={})",
            self.codec,
            self.codec_config.as_ref().map(Vec::len),
            self.force_software
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed codec configuration record: {0}")]
    MalformedConfig(String),
    #[error("unsupported nal length field size: {0}")]
    UnsupportedLengthSize(u8),
    #[error(
        "truncated nal unit at offset {offset}: declared {declared} bytes, {remaining} remaining"
    )]
    TruncatedNalUnit {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("device input queue is full")]
    DeviceQueueFull,
    #[error("no decoded picture available")]
    NoPictureAvailable,
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(StreamCodec),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("codec configuration record is missing or too small")]
    MissingCodecConfig,
    #[error("failed to open device decoder: {0}")]
    DeviceOpen(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// The hardware decoder as seen by the flow controller.
///
/// Depth queries are live reads of queues the device drains on its own
/// threads; none of the calls may block longer than the timeout they are
/// given.
pub trait HardwareDevice {
    fn open_decoder(&mut self, codec: DeviceCodec, codec_config: &[u8]) -> Result<()>;

    fn close_decoder(&mut self);

    /// Enqueue one access unit. `false` means the input queue is full.
    fn add_input(
        &mut self,
        data: &[u8],
        dts: Option<Timestamp90k>,
        pts: Option<Timestamp90k>,
    ) -> bool;

    fn input_count(&self) -> u32;

    fn ready_count(&self) -> u32;

    /// Recycle output buffers already handed to the consumer.
    fn flush_completed(&mut self);

    fn fetch_picture(&mut self) -> Option<Picture>;

    /// Drop all pending input and output.
    fn reset(&mut self);

    fn set_drop_mode(&mut self, drop: bool);

    fn wait_for_input_capacity(&mut self, timeout: Duration);
}

impl<D: HardwareDevice + ?Sized> HardwareDevice for Box<D> {
    fn open_decoder(&mut self, codec: DeviceCodec, codec_config: &[u8]) -> Result<()> {
        (**self).open_decoder(codec, codec_config)
    }

    fn close_decoder(&mut self) {
        (**self).close_decoder();
    }

    fn add_input(
        &mut self,
        data: &[u8],
        dts: Option<Timestamp90k>,
        pts: Option<Timestamp90k>,
    ) -> bool {
        (**self).add_input(data, dts, pts)
    }

    fn input_count(&self) -> u32 {
        (**self).input_count()
    }

    fn ready_count(&self) -> u32 {
        (**self).ready_count()
    }

    fn flush_completed(&mut self) {
        (**self).flush_completed();
    }

    fn fetch_picture(&mut self) -> Option<Picture> {
        (**self).fetch_picture()
    }

    fn reset(&mut self) {
        (**self).reset();
    }

    fn set_drop_mode(&mut self, drop: bool) {
        (**self).set_drop_mode(drop);
    }

    fn wait_for_input_capacity(&mut self, timeout: Duration) {
        (**self).wait_for_input_capacity(timeout);
    }
}
