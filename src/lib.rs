//! Flow control and bitstream reformatting for queue-based hardware video
//! decoders.
//!
//! A [`DecodeFlowController`] sits between a demuxer-driven decode loop and a
//! [`HardwareDevice`]. It rewrites length-prefixed H.264 into Annex-B on the
//! way in and answers every submit with [`ReadinessFlags`] derived from the
//! device's queue depths.

pub mod bitstream;
mod contract;
pub mod device;
mod flow;
pub mod loopback;
pub mod packer;
mod pipeline;

pub use bitstream::{Reformatter, annexb_nal_units, is_avcc_record};
pub use contract::{
    DecodeError, DecoderConfig, DeviceCodec, Dimensions, FlowTuning, HardwareDevice, Packet,
    Picture, ReadinessFlags, Result, StreamCodec, Timestamp90k,
};
pub use device::{CodecMapping, DeviceSession, lookup_codec};
pub use flow::{DecodeFlowController, FlowState, Pacer, ThreadPacer};
pub use loopback::{LoopbackConfig, LoopbackDevice, LoopbackStats};
pub use packer::{
    AnnexBPacker, LengthPrefixedPacker, PackedSample, SamplePacker, build_avc_config_record,
};
pub use pipeline::{
    BoundedQueueRx, BoundedQueueTx, InFlightCredits, QueueRecvError, QueueSendError, QueueStats,
    bounded_queue,
};
