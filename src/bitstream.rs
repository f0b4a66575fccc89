use crate::packer::{push_annexb_nal, START_CODE};
use crate::{DecodeError, Result};

pub const NAL_TYPE_SLICE: u8 = 1;
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

const CONFIG_HEADER_LEN: usize = 4;
const MIN_CONFIG_LEN: usize = 6;

/// An AVCC record always starts with configuration version 1.
pub fn is_avcc_record(data: &[u8]) -> bool {
    data.first() == Some(&1)
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    pub nal_type: Option<u8>,
    pub payload: &'a [u8],
}

impl NalUnit<'_> {
    pub fn is_idr(&self) -> bool {
        self.nal_type == Some(NAL_TYPE_IDR)
    }

    pub fn is_non_idr_slice(&self) -> bool {
        self.nal_type == Some(NAL_TYPE_SLICE)
    }
}

/// Walks the NAL units of one length-prefixed access unit. Stops after the
/// first error.
#[derive(Debug)]
pub struct LengthPrefixedNals<'a> {
    data: &'a [u8],
    offset: usize,
    length_size: usize,
    failed: bool,
}

impl<'a> LengthPrefixedNals<'a> {
    pub fn new(data: &'a [u8], length_size: u8) -> Self {
        Self {
            data,
            offset: 0,
            length_size: usize::from(length_size),
            failed: false,
        }
    }
}

impl<'a> Iterator for LengthPrefixedNals<'a> {
    type Item = Result<NalUnit<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let remaining = self.data.len() - self.offset;
        if remaining < self.length_size {
            self.failed = true;
            return Some(Err(DecodeError::TruncatedNalUnit {
                offset: self.offset,
                declared: self.length_size,
                remaining,
            }));
        }

        let field = &self.data[self.offset..self.offset + self.length_size];
        let nal_size = field
            .iter()
            .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
        let payload_start = self.offset + self.length_size;
        let remaining = self.data.len() - payload_start;
        if nal_size > remaining {
            self.failed = true;
            return Some(Err(DecodeError::TruncatedNalUnit {
                offset: self.offset,
                declared: nal_size,
                remaining,
            }));
        }

        let payload = &self.data[payload_start..payload_start + nal_size];
        self.offset = payload_start + nal_size;
        Some(Ok(NalUnit {
            nal_type: nal_type(payload),
            payload,
        }))
    }
}

/// SPS and PPS entries from a configuration record, each behind a 4-byte
/// start code, SPS first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSetBuffer {
    data: Vec<u8>,
    sps_count: usize,
    pps_count: usize,
}

impl ParameterSetBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sps_count(&self) -> usize {
        self.sps_count
    }

    pub fn pps_count(&self) -> usize {
        self.pps_count
    }
}

struct ConfigCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ConfigCursor<'a> {
    fn read_u8(&mut self, what: &str) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or_else(|| {
            DecodeError::MalformedConfig(format!("record ends before {what} at {}", self.pos))
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_unit(&mut self) -> Result<&'a [u8]> {
        let hi = self.read_u8("unit length")?;
        let lo = self.read_u8("unit length")?;
        let len = usize::from(u16::from_be_bytes([hi, lo]));
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(DecodeError::MalformedConfig(format!(
                "parameter set of {len} bytes at {} overruns record of {} bytes",
                self.pos,
                self.data.len()
            )));
        }
        let unit = &self.data[self.pos..end];
        self.pos = end;
        Ok(unit)
    }
}

/// Rewrites length-prefixed H.264 access units into Annex-B, injecting the
/// stream's parameter sets before IDR pictures.
#[derive(Debug, Clone)]
pub struct Reformatter {
    length_size: u8,
    parameter_sets: ParameterSetBuffer,
    first_idr_pending: bool,
}

impl Reformatter {
    pub fn new(config_record: &[u8]) -> Result<Self> {
        if config_record.len() < MIN_CONFIG_LEN {
            return Err(DecodeError::MalformedConfig(format!(
                "record of {} bytes is shorter than {MIN_CONFIG_LEN}",
                config_record.len()
            )));
        }

        let mut cursor = ConfigCursor {
            data: config_record,
            pos: CONFIG_HEADER_LEN,
        };
        let length_size = (cursor.read_u8("length size")? & 0x3) + 1;
        if length_size == 3 {
            return Err(DecodeError::UnsupportedLengthSize(length_size));
        }

        let mut parameter_sets = ParameterSetBuffer::default();
        let mut unit_count = cursor.read_u8("sps count")? & 0x1f;
        let mut sps_done = false;
        if unit_count == 0 {
            unit_count = cursor.read_u8("pps count")?;
            sps_done = true;
        }

        loop {
            for _ in 0..unit_count {
                let unit = cursor.read_unit()?;
                parameter_sets.data.extend_from_slice(&START_CODE);
                parameter_sets.data.extend_from_slice(unit);
                if sps_done {
                    parameter_sets.pps_count += 1;
                } else {
                    parameter_sets.sps_count += 1;
                }
            }
            if sps_done {
                break;
            }
            unit_count = cursor.read_u8("pps count")?;
            sps_done = true;
        }

        Ok(Self {
            length_size,
            parameter_sets,
            first_idr_pending: true,
        })
    }

    pub fn length_size(&self) -> u8 {
        self.length_size
    }

    pub fn parameter_sets(&self) -> &ParameterSetBuffer {
        &self.parameter_sets
    }

    pub fn first_idr_pending(&self) -> bool {
        self.first_idr_pending
    }

    pub(crate) fn set_first_idr_pending(&mut self, pending: bool) {
        self.first_idr_pending = pending;
    }

    /// Converts one access unit. On error nothing is emitted and the
    /// injection state is left as it was before the call.
    pub fn convert(&mut self, access_unit: &[u8]) -> Result<Vec<u8>> {
        if access_unit.is_empty() {
            return Err(DecodeError::TruncatedNalUnit {
                offset: 0,
                declared: usize::from(self.length_size),
                remaining: 0,
            });
        }

        let mut out = Vec::with_capacity(access_unit.len() + self.parameter_sets.len() + 8);
        let mut first_idr_pending = self.first_idr_pending;

        for nal in LengthPrefixedNals::new(access_unit, self.length_size) {
            let nal = nal?;
            if first_idr_pending && nal.is_idr() {
                push_annexb_nal(&mut out, self.parameter_sets.as_bytes(), nal.payload);
                first_idr_pending = false;
            } else {
                push_annexb_nal(&mut out, &[], nal.payload);
                if !first_idr_pending && nal.is_non_idr_slice() {
                    first_idr_pending = true;
                }
            }
        }

        self.first_idr_pending = first_idr_pending;
        Ok(out)
    }
}

/// Splits an Annex-B buffer into NAL payloads (start codes stripped).
pub fn annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let start_codes = find_start_codes(data);
    let mut nalus = Vec::with_capacity(start_codes.len());
    for (index, &(start, start_len)) in start_codes.iter().enumerate() {
        let payload_start = start + start_len;
        let end = start_codes
            .get(index + 1)
            .map_or(data.len(), |&(next, _)| next);
        if end > payload_start {
            nalus.push(&data[payload_start..end]);
        }
    }
    nalus
}

fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                out.push((i, 3));
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                out.push((i, 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::packer::{
        LengthPrefixedPacker, SHORT_START_CODE, SamplePacker, build_avc_config_record,
    };

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0xab];
    const PPS: &[u8] = &[0x68, 0xce, 0x06, 0xe2];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21];
    const NON_IDR: &[u8] = &[0x41, 0x9a, 0x22, 0x11];
    const SEI: &[u8] = &[0x06, 0x05, 0x01];

    fn reformatter() -> Reformatter {
        let record = build_avc_config_record(4, &[SPS], &[PPS]).unwrap();
        Reformatter::new(&record).unwrap()
    }

    fn avcc(nalus: &[&[u8]]) -> Vec<u8> {
        LengthPrefixedPacker::new(4).unwrap().pack(nalus).unwrap().data
    }

    fn expected_parameter_sets() -> Vec<u8> {
        [&START_CODE[..], SPS, &START_CODE[..], PPS].concat()
    }

    #[test]
    fn parameter_buffer_keeps_sps_then_pps_order() {
        let sps2: &[u8] = &[0x67, 0x64, 0x00, 0x28];
        let pps2: &[u8] = &[0x68, 0xee];
        let record = build_avc_config_record(4, &[SPS, sps2], &[PPS, pps2]).unwrap();
        let reformatter = Reformatter::new(&record).unwrap();

        let buffer = reformatter.parameter_sets();
        assert_eq!(buffer.sps_count(), 2);
        assert_eq!(buffer.pps_count(), 2);
        assert_eq!(
            buffer.as_bytes(),
            [
                &START_CODE[..],
                SPS,
                &START_CODE[..],
                sps2,
                &START_CODE[..],
                PPS,
                &START_CODE[..],
                pps2
            ]
            .concat()
            .as_slice()
        );
        let types: Vec<_> = annexb_nal_units(buffer.as_bytes())
            .into_iter()
            .map(nal_type)
            .collect();
        assert_eq!(
            types,
            [NAL_TYPE_SPS, NAL_TYPE_SPS, NAL_TYPE_PPS, NAL_TYPE_PPS].map(Some)
        );
        assert!(reformatter.first_idr_pending());
    }

    #[rstest]
    #[case(0xfc, Some(1))]
    #[case(0xfd, Some(2))]
    #[case(0xfe, None)]
    #[case(0xff, Some(4))]
    fn length_size_is_decoded_from_low_bits(#[case] control: u8, #[case] expected: Option<u8>) {
        let mut record = build_avc_config_record(4, &[SPS], &[PPS]).unwrap();
        record[4] = control;
        match (Reformatter::new(&record), expected) {
            (Ok(reformatter), Some(size)) => assert_eq!(reformatter.length_size(), size),
            (Err(DecodeError::UnsupportedLengthSize(3)), None) => {}
            (other, _) => panic!("unexpected result for control {control:#x}: {other:?}"),
        }
    }

    #[rstest]
    #[case(&[])]
    #[case(&[1, 0x42, 0, 0x1e, 0xff])]
    fn short_records_are_malformed(#[case] record: &[u8]) {
        assert!(matches!(
            Reformatter::new(record),
            Err(DecodeError::MalformedConfig(_))
        ));
    }

    #[test]
    fn overrunning_unit_length_is_malformed() {
        let mut record = build_avc_config_record(4, &[SPS], &[PPS]).unwrap();
        // SPS length field claims far more than the record holds.
        record[6] = 0x10;
        assert!(matches!(
            Reformatter::new(&record),
            Err(DecodeError::MalformedConfig(_))
        ));
    }

    #[test]
    fn missing_pps_count_is_malformed() {
        let record = [&[1, 0x42, 0x00, 0x1e, 0xff, 0xe1, 0, 5][..], SPS].concat();
        assert!(matches!(
            Reformatter::new(&record),
            Err(DecodeError::MalformedConfig(_))
        ));
    }

    #[test]
    fn zero_sps_count_reads_pps_count_from_next_byte() {
        let record = [&[1, 0x42, 0x00, 0x1e, 0xff, 0xe0, 1, 0, 4][..], PPS].concat();
        let reformatter = Reformatter::new(&record).unwrap();
        assert_eq!(reformatter.parameter_sets().sps_count(), 0);
        assert_eq!(reformatter.parameter_sets().pps_count(), 1);
        assert_eq!(
            reformatter.parameter_sets().as_bytes(),
            [&START_CODE[..], PPS].concat().as_slice()
        );
    }

    #[test]
    fn idr_then_non_idr_gets_parameter_sets_and_short_code() {
        let mut reformatter = reformatter();
        let out = reformatter.convert(&avcc(&[IDR, NON_IDR])).unwrap();

        let params = expected_parameter_sets();
        let expected = [
            &params[..],
            &START_CODE[..],
            IDR,
            &SHORT_START_CODE[..],
            NON_IDR,
        ]
        .concat();
        assert_eq!(out, expected);
        assert_eq!(out.len(), params.len() + 4 + IDR.len() + 3 + NON_IDR.len());
    }

    #[test]
    fn non_idr_slice_rearms_injection_for_next_idr() {
        let mut reformatter = reformatter();
        let params = expected_parameter_sets();

        let first = reformatter.convert(&avcc(&[IDR, NON_IDR])).unwrap();
        let second = reformatter.convert(&avcc(&[IDR])).unwrap();

        assert!(first.starts_with(&params));
        assert!(second.starts_with(&params));
    }

    #[test]
    fn consecutive_idrs_without_slice_only_inject_once() {
        let mut reformatter = reformatter();
        let params = expected_parameter_sets();

        let first = reformatter.convert(&avcc(&[IDR])).unwrap();
        let second = reformatter.convert(&avcc(&[IDR])).unwrap();

        assert!(first.starts_with(&params));
        assert_eq!(second, [&START_CODE[..], IDR].concat());
    }

    #[test]
    fn parameter_sets_follow_leading_sei_with_short_code() {
        let mut reformatter = reformatter();
        let out = reformatter.convert(&avcc(&[SEI, IDR])).unwrap();

        let params = expected_parameter_sets();
        let expected = [
            &START_CODE[..],
            SEI,
            &params[..],
            &SHORT_START_CODE[..],
            IDR,
        ]
        .concat();
        assert_eq!(out, expected);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn narrow_length_fields_are_honored(#[case] length_size: u8) {
        let record = build_avc_config_record(length_size, &[SPS], &[PPS]).unwrap();
        let mut reformatter = Reformatter::new(&record).unwrap();
        let sample = LengthPrefixedPacker::new(length_size)
            .unwrap()
            .pack(&[NON_IDR])
            .unwrap()
            .data;
        assert_eq!(
            reformatter.convert(&sample).unwrap(),
            [&START_CODE[..], NON_IDR].concat()
        );
    }

    #[test]
    fn truncated_nal_fails_without_touching_state() {
        let mut reformatter = reformatter();
        let mut sample = avcc(&[IDR, NON_IDR]);
        sample.truncate(sample.len() - 1);

        let err = reformatter.convert(&sample).unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedNalUnit { .. }));
        assert!(reformatter.first_idr_pending());

        let out = reformatter.convert(&avcc(&[IDR])).unwrap();
        assert!(out.starts_with(&expected_parameter_sets()));
    }

    #[test]
    fn trailing_partial_length_field_is_truncated() {
        let mut reformatter = reformatter();
        let mut sample = avcc(&[NON_IDR]);
        sample.extend_from_slice(&[0, 0]);
        assert!(matches!(
            reformatter.convert(&sample),
            Err(DecodeError::TruncatedNalUnit {
                declared: 4,
                remaining: 2,
                ..
            })
        ));
    }

    #[test]
    fn empty_access_unit_is_truncated() {
        assert!(matches!(
            reformatter().convert(&[]),
            Err(DecodeError::TruncatedNalUnit { .. })
        ));
    }

    #[test]
    fn annexb_split_handles_mixed_start_codes() {
        let data = [
            &START_CODE[..],
            SPS,
            &SHORT_START_CODE[..],
            PPS,
            &SHORT_START_CODE[..],
            IDR,
        ]
        .concat();
        let nalus = annexb_nal_units(&data);
        assert_eq!(nalus, vec![SPS, PPS, IDR]);
        assert_eq!(nal_type(nalus[2]), Some(NAL_TYPE_IDR));
    }

    #[test]
    fn avcc_record_detection() {
        assert!(is_avcc_record(&[1, 0x42]));
        assert!(!is_avcc_record(&START_CODE[..]));
        assert!(!is_avcc_record(&[]));
    }
}
