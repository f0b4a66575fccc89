use crate::{DeviceCodec, HardwareDevice, Result, StreamCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecMapping {
    pub device_codec: DeviceCodec,
    pub format_name: &'static str,
}

/// Maps a stream codec onto the device codec and the format label reported
/// for it. `None` means the device cannot decode the stream.
pub fn lookup_codec(codec: StreamCodec) -> Option<CodecMapping> {
    let (device_codec, format_name) = match codec {
        StreamCodec::Mpeg2 => (DeviceCodec::Mpeg2, "hw-mpeg2"),
        StreamCodec::H264 => (DeviceCodec::H264, "hw-h264"),
        StreamCodec::Vc1 => (DeviceCodec::Vc1, "hw-vc1"),
        StreamCodec::Wmv3 => (DeviceCodec::Wmv3, "hw-wmv3"),
        StreamCodec::Hevc | StreamCodec::Vp9 => return None,
    };
    Some(CodecMapping {
        device_codec,
        format_name,
    })
}

/// An opened decoder on a device. The decoder is closed when the session is
/// dropped.
#[derive(Debug)]
pub struct DeviceSession<D: HardwareDevice> {
    device: D,
    codec: DeviceCodec,
}

impl<D: HardwareDevice> DeviceSession<D> {
    pub fn open(mut device: D, codec: DeviceCodec, codec_config: &[u8]) -> Result<Self> {
        device.open_decoder(codec, codec_config)?;
        Ok(Self { device, codec })
    }

    pub fn codec(&self) -> DeviceCodec {
        self.codec
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: HardwareDevice> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.device.close_decoder();
    }
}
