use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use video_hw_flow::{
    DecodeError, DecodeFlowController, DecoderConfig, LengthPrefixedPacker, LoopbackConfig,
    LoopbackDevice, Packet, ReadinessFlags, SamplePacker, StreamCodec, Timestamp90k,
    build_avc_config_record,
};

const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1e, 0xda, 0x02, 0x80, 0xbf, 0xe5, 0x84];
const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
const IDLE_LIMIT: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(about = "Drive a synthetic AVCC stream through the decode flow controller")]
struct Args {
    #[arg(long, default_value_t = 120)]
    frames: usize,
    #[arg(long, default_value_t = 30)]
    gop: usize,
    #[arg(long, default_value_t = 4)]
    length_size: u8,
    #[arg(long, default_value_t = 60)]
    fps: u32,
    /// Flush the decoder after this many packets and resume at the next IDR.
    #[arg(long)]
    seek_at: Option<usize>,
    #[arg(long, default_value_t = false)]
    drop: bool,
    #[arg(long, default_value_t = 4)]
    input_capacity: usize,
}

#[derive(Debug, Default)]
struct Summary {
    submitted: usize,
    retries: usize,
    fetched: usize,
    keyframes: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.fps > 0, "fps must be positive");
    let frame_duration = Duration::from_secs(1) / args.fps;

    let record = build_avc_config_record(args.length_size, &[SPS], &[PPS])
        .context("failed to build codec configuration record")?;
    let packets = synthesize_stream(&args, frame_duration)?;

    let device = LoopbackDevice::new(LoopbackConfig {
        input_capacity: args.input_capacity,
        frame_duration,
        ..LoopbackConfig::default()
    });
    let config = DecoderConfig::new(StreamCodec::H264).with_codec_config(record);
    info!(%config, frames = packets.len(), "starting decode");

    let mut controller =
        DecodeFlowController::open(device, &config).context("failed to open decoder")?;
    controller.set_drop_mode(args.drop);

    let mut summary = Summary::default();
    let mut source = packets.iter().enumerate().peekable();
    let mut flags = ReadinessFlags::NEEDS_INPUT;
    let mut last_progress = Instant::now();
    let mut seek_pending = args.seek_at;
    let gop = args.gop.max(1);

    loop {
        if flags.contains(ReadinessFlags::PICTURE_READY) {
            let picture = controller.fetch().context("fetch failed")?;
            summary.fetched += 1;
            summary.keyframes += usize::from(picture.is_keyframe);
            last_progress = Instant::now();
        }

        if seek_pending.is_some_and(|at| at <= summary.submitted) {
            seek_pending = None;
            controller.reset();
            while source.next_if(|(index, _)| index % gop != 0).is_some() {}
            debug!(at = summary.submitted, "seeked to next keyframe");
        }

        let next = if flags.contains(ReadinessFlags::NEEDS_INPUT) {
            source.peek().map(|(_, packet)| *packet)
        } else {
            None
        };

        flags = match next {
            Some(packet) => match controller.submit(Some(packet)) {
                Ok(flags) => {
                    source.next();
                    summary.submitted += 1;
                    last_progress = Instant::now();
                    flags
                }
                Err(DecodeError::DeviceQueueFull) => {
                    summary.retries += 1;
                    ReadinessFlags::NEEDS_INPUT
                }
                Err(err) => return Err(err).context("submit failed"),
            },
            None => {
                let flags = controller.submit(None).context("drain failed")?;
                if source.peek().is_none() && last_progress.elapsed() > IDLE_LIMIT {
                    break;
                }
                flags
            }
        };
    }

    let stats = controller.device().stats();
    println!(
        "format={}, submitted={}, retries={}, fetched={}, keyframes={}, device_decoded={}, device_dropped={}, peak_input={}, peak_ready={}",
        controller.format_name(),
        summary.submitted,
        summary.retries,
        summary.fetched,
        summary.keyframes,
        stats.decoded,
        stats.dropped,
        stats.input.peak_depth,
        stats.ready.peak_depth,
    );
    Ok(())
}

fn synthesize_stream(args: &Args, frame_duration: Duration) -> Result<Vec<Packet>> {
    let mut packer =
        LengthPrefixedPacker::new(args.length_size).context("unsupported length size")?;
    let gop = args.gop.max(1);
    let mut packets = Vec::with_capacity(args.frames);
    for index in 0..args.frames {
        let header = if index % gop == 0 { 0x65 } else { 0x41 };
        let mut slice = vec![header, 0x88];
        slice.extend_from_slice(&(index as u32).to_be_bytes());
        let sample = packer
            .pack(&[slice.as_slice()])
            .with_context(|| format!("failed to pack frame {index}"))?;
        let pts = Timestamp90k::from_duration(frame_duration * index as u32);
        packets.push(Packet::new(sample.data, Some(pts), Some(pts)));
    }
    Ok(packets)
}
