use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bitstream::{Reformatter, is_avcc_record};
use crate::device::{DeviceSession, lookup_codec};
use crate::{
    DecodeError, DecoderConfig, FlowTuning, HardwareDevice, Packet, Picture, ReadinessFlags,
    Result, StreamCodec,
};

/// Shortest H.264 codec configuration record the device will be opened with.
const MIN_H264_CODEC_CONFIG_LEN: usize = 7;

/// Where submission pacing pauses go.
pub trait Pacer {
    fn pause(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowState {
    pub decode_started: bool,
    pub drop_pictures: bool,
    pub last_picture_duration: Duration,
}

/// Turns device queue depths into readiness decisions for the driving loop.
///
/// One thread owns the controller and calls it sequentially. Every wait it
/// performs is bounded by [`FlowTuning`].
#[derive(Debug)]
pub struct DecodeFlowController<D: HardwareDevice, P: Pacer = ThreadPacer> {
    session: DeviceSession<D>,
    reformatter: Option<Reformatter>,
    pacer: P,
    tuning: FlowTuning,
    state: FlowState,
    format_name: &'static str,
}

impl<D: HardwareDevice> DecodeFlowController<D, ThreadPacer> {
    pub fn open(device: D, config: &DecoderConfig) -> Result<Self> {
        Self::open_with_pacer(device, config, ThreadPacer)
    }
}

impl<D: HardwareDevice, P: Pacer> DecodeFlowController<D, P> {
    pub fn open_with_pacer(device: D, config: &DecoderConfig, pacer: P) -> Result<Self> {
        if config.force_software {
            return Err(DecodeError::UnsupportedConfig(
                "software decoding requested for a hardware decoder".to_string(),
            ));
        }
        let mapping =
            lookup_codec(config.codec).ok_or(DecodeError::UnsupportedCodec(config.codec))?;

        let reformatter = if config.codec == StreamCodec::H264 {
            let record = config
                .codec_config
                .as_deref()
                .filter(|record| record.len() >= MIN_H264_CODEC_CONFIG_LEN)
                .ok_or(DecodeError::MissingCodecConfig)?;
            prepare_reformatter(record)
        } else {
            None
        };

        let codec_config = config.codec_config.as_deref().unwrap_or_default();
        let session = DeviceSession::open(device, mapping.device_codec, codec_config)?;

        info!(
            codec = %config.codec,
            format = mapping.format_name,
            reformat = reformatter.is_some(),
            "opened hardware decoder"
        );

        Ok(Self {
            session,
            reformatter,
            pacer,
            state: FlowState {
                decode_started: false,
                drop_pictures: false,
                last_picture_duration: config.tuning.default_frame_duration,
            },
            tuning: config.tuning.clone(),
            format_name: mapping.format_name,
        })
    }

    pub fn format_name(&self) -> &'static str {
        self.format_name
    }

    pub fn is_reformatting(&self) -> bool {
        self.reformatter.is_some()
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn tuning(&self) -> &FlowTuning {
        &self.tuning
    }

    pub fn device(&self) -> &D {
        self.session.device()
    }

    /// Offers one access unit to the device, or polls it when `packet` is
    /// `None`.
    ///
    /// `Err(DecodeError::DeviceQueueFull)` means the packet was not taken and
    /// must be offered again.
    pub fn submit(&mut self, packet: Option<&Packet>) -> Result<ReadinessFlags> {
        self.session.device_mut().flush_completed();

        let Some(packet) = packet else {
            return Ok(self.drain());
        };

        let rewind = self.reformatter.as_ref().map(Reformatter::first_idr_pending);
        let converted = match self.reformatter.as_mut() {
            Some(reformatter) => match reformatter.convert(&packet.data) {
                Ok(annexb) => Some(annexb),
                Err(err) => {
                    warn!(
                        error = %err,
                        len = packet.data.len(),
                        "submitting access unit unconverted"
                    );
                    None
                }
            },
            None => None,
        };
        let data = converted.as_deref().unwrap_or(&packet.data);

        let device = self.session.device_mut();
        if !device.add_input(data, packet.dts, packet.pts) {
            debug!(len = data.len(), "device input queue full");
            device.wait_for_input_capacity(self.tuning.input_retry_wait);
            // The retry must see the same injection state.
            if let (Some(reformatter), Some(pending)) = (self.reformatter.as_mut(), rewind) {
                reformatter.set_first_idr_pending(pending);
            }
            return Err(DecodeError::DeviceQueueFull);
        }

        self.pace();
        Ok(self.evaluate_readiness())
    }

    /// Takes one decoded picture. Only valid after `PICTURE_READY`.
    pub fn fetch(&mut self) -> Result<Picture> {
        let mut picture = self
            .session
            .device_mut()
            .fetch_picture()
            .ok_or(DecodeError::NoPictureAvailable)?;
        self.state.last_picture_duration = picture.duration;
        picture.duration = Duration::ZERO;
        Ok(picture)
    }

    pub fn reset(&mut self) {
        debug!("flushing decoder");
        self.state.decode_started = false;
        self.session.device_mut().reset();
    }

    pub fn set_drop_mode(&mut self, enabled: bool) {
        if self.state.drop_pictures != enabled {
            debug!(enabled, "drop mode changed");
        }
        self.state.drop_pictures = enabled;
        self.session.device_mut().set_drop_mode(enabled);
    }

    fn drain(&mut self) -> ReadinessFlags {
        let device = self.session.device_mut();
        let ready = device.ready_count();
        let input = device.input_count();

        let mut flags = ReadinessFlags::empty();
        if ready > 0 {
            flags |= ReadinessFlags::PICTURE_READY;
        }
        if input < self.tuning.input_low_watermark && ready < self.tuning.drain_ready_ceiling {
            flags |= ReadinessFlags::NEEDS_INPUT;
        }
        if flags.is_empty() {
            device.wait_for_input_capacity(self.tuning.drain_wait);
        }
        flags
    }

    fn pace(&mut self) {
        if self.state.drop_pictures {
            return;
        }
        let delay = if self.state.last_picture_duration.is_zero() {
            self.tuning.fallback_pacing
        } else {
            self.state.last_picture_duration / 2
        };
        self.pacer.pause(delay);
    }

    fn evaluate_readiness(&mut self) -> ReadinessFlags {
        let device = self.session.device();
        let ready = device.ready_count();
        let input = device.input_count();

        let mut flags = ReadinessFlags::empty();
        if self.state.decode_started {
            if ready > 0 {
                flags |= ReadinessFlags::PICTURE_READY;
            }
            if input < self.tuning.input_low_watermark && ready < self.tuning.started_ready_ceiling
            {
                flags |= ReadinessFlags::NEEDS_INPUT;
            }
        } else {
            if ready > self.tuning.startup_ready_threshold {
                debug!(ready, "decode started");
                self.state.decode_started = true;
                flags |= ReadinessFlags::PICTURE_READY;
            }
            if input < self.tuning.input_low_watermark {
                flags |= ReadinessFlags::NEEDS_INPUT;
            }
        }
        flags
    }
}

fn prepare_reformatter(record: &[u8]) -> Option<Reformatter> {
    if !is_avcc_record(record) {
        return None;
    }
    match Reformatter::new(record) {
        Ok(reformatter) => Some(reformatter),
        Err(err) => {
            warn!(error = %err, "avcC record rejected, passing access units through");
            None
        }
    }
}
