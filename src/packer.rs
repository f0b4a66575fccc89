use crate::{DecodeError, Result};

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];
pub const SHORT_START_CODE: [u8; 3] = [0, 0, 1];

pub struct PackedSample {
    pub data: Vec<u8>,
}

pub trait SamplePacker {
    fn pack(&mut self, nalus: &[&[u8]]) -> Result<PackedSample>;
}

/// Packs NAL units into a length-prefixed (AVCC) sample.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedPacker {
    length_size: u8,
}

impl LengthPrefixedPacker {
    pub fn new(length_size: u8) -> Result<Self> {
        match length_size {
            1 | 2 | 4 => Ok(Self { length_size }),
            other => Err(DecodeError::UnsupportedLengthSize(other)),
        }
    }

    pub fn length_size(&self) -> u8 {
        self.length_size
    }
}

impl SamplePacker for LengthPrefixedPacker {
    fn pack(&mut self, nalus: &[&[u8]]) -> Result<PackedSample> {
        let prefix = usize::from(self.length_size);
        let total_size = nalus.iter().map(|nal| nal.len().saturating_add(prefix)).sum();
        let mut data = Vec::with_capacity(total_size);

        let limit = match self.length_size {
            1 => u8::MAX as usize,
            2 => u16::MAX as usize,
            _ => u32::MAX as usize,
        };
        for nal in nalus {
            if nal.len() > limit {
                return Err(DecodeError::UnsupportedConfig(format!(
                    "nal unit of {} bytes does not fit a {}-byte length field",
                    nal.len(),
                    self.length_size
                )));
            }
            let len = (nal.len() as u32).to_be_bytes();
            data.extend_from_slice(&len[4 - prefix..]);
            data.extend_from_slice(nal);
        }

        Ok(PackedSample { data })
    }
}

/// Packs NAL units into an Annex-B access unit: a 4-byte start code for the
/// first unit, 3-byte codes after it.
#[derive(Debug, Default)]
pub struct AnnexBPacker;

impl SamplePacker for AnnexBPacker {
    fn pack(&mut self, nalus: &[&[u8]]) -> Result<PackedSample> {
        let total_size = nalus
            .iter()
            .map(|nal| nal.len().saturating_add(START_CODE.len()))
            .sum();
        let mut data = Vec::with_capacity(total_size);

        for nal in nalus {
            push_annexb_nal(&mut data, &[], nal);
        }

        Ok(PackedSample { data })
    }
}

/// Appends `prefix` verbatim, then a start code, then `payload`. The start
/// code is 4 bytes only when `out` was empty before the call.
pub(crate) fn push_annexb_nal(out: &mut Vec<u8>, prefix: &[u8], payload: &[u8]) {
    let start_code: &[u8] = if out.is_empty() {
        &START_CODE
    } else {
        &SHORT_START_CODE
    };
    out.reserve(prefix.len() + start_code.len() + payload.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(start_code);
    out.extend_from_slice(payload);
}

/// Builds an AVC decoder configuration record (avcC) around the given
/// parameter sets. Profile and level are copied from the first SPS.
pub fn build_avc_config_record(
    length_size: u8,
    sps: &[&[u8]],
    pps: &[&[u8]],
) -> Result<Vec<u8>> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(DecodeError::UnsupportedLengthSize(length_size));
    }
    if sps.len() > 0x1f || pps.len() > u8::MAX as usize {
        return Err(DecodeError::MalformedConfig(format!(
            "too many parameter sets: sps={}, pps={}",
            sps.len(),
            pps.len()
        )));
    }

    let profile = sps
        .first()
        .filter(|first| first.len() >= 4)
        .map(|first| [first[1], first[2], first[3]])
        .unwrap_or([0, 0, 0]);

    let mut out = vec![1, profile[0], profile[1], profile[2]];
    out.push(0xfc | (length_size - 1));
    out.push(0xe0 | sps.len() as u8);
    push_config_units(&mut out, sps)?;
    out.push(pps.len() as u8);
    push_config_units(&mut out, pps)?;
    Ok(out)
}

fn push_config_units(out: &mut Vec<u8>, units: &[&[u8]]) -> Result<()> {
    for unit in units {
        let len = u16::try_from(unit.len()).map_err(|_| {
            DecodeError::MalformedConfig(format!("parameter set of {} bytes", unit.len()))
        })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(unit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefixed_packer_honors_field_width() {
        let mut packer = LengthPrefixedPacker::new(2).unwrap();
        let packed = packer.pack(&[&[0x65, 0x88], &[0x41]]).unwrap();
        assert_eq!(packed.data, vec![0, 2, 0x65, 0x88, 0, 1, 0x41]);
    }

    #[test]
    fn length_prefixed_packer_rejects_oversized_nal() {
        let mut packer = LengthPrefixedPacker::new(1).unwrap();
        let nal = vec![0x41; 300];
        assert!(matches!(
            packer.pack(&[&nal]),
            Err(DecodeError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn length_prefixed_packer_rejects_three_byte_field() {
        assert!(matches!(
            LengthPrefixedPacker::new(3),
            Err(DecodeError::UnsupportedLengthSize(3))
        ));
    }

    #[test]
    fn annexb_packer_uses_short_codes_after_first_unit() {
        let packed = AnnexBPacker.pack(&[&[0x65, 0x01], &[0x41, 0x02]]).unwrap();
        assert_eq!(
            packed.data,
            vec![0, 0, 0, 1, 0x65, 0x01, 0, 0, 1, 0x41, 0x02]
        );
    }

    #[test]
    fn avc_config_record_layout() {
        let sps: &[u8] = &[0x67, 0x42, 0x00, 0x1e];
        let pps: &[u8] = &[0x68, 0xce];
        let record = build_avc_config_record(4, &[sps], &[pps]).unwrap();
        assert_eq!(
            record,
            vec![
                1, 0x42, 0x00, 0x1e, 0xff, 0xe1, //
                0, 4, 0x67, 0x42, 0x00, 0x1e, //
                1, 0, 2, 0x68, 0xce
            ]
        );
    }
}
