// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 streams, either Annex B or length-prefixed with an `avcC` record.

use std::io::Cursor;
use std::io::Read;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use log::debug;

use crate::backend::CodecStd;
use crate::backend::InitialInfo;
use crate::codec::aspect_ratio_from_idc;
use crate::codec::CodecError;
use crate::codec::CodecProfile;
use crate::codec::StreamFormat;
use crate::utils::UnitKind;
use crate::Fraction;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types relevant to access unit splitting.
#[derive(enumn::N, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum NaluType {
    Slice = 1,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
}

/// Contents of an `AVCDecoderConfigurationRecord`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile_idc: u8,
    pub level_idc: u8,
    /// Size in bytes of the NAL length prefixes.
    pub length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let invalid = |e: std::io::Error| CodecError::InvalidCodecData(format!("avcC: {}", e));
        let mut r = Cursor::new(data);

        let version = r.read_u8().map_err(invalid)?;
        if version != 1 {
            return Err(CodecError::InvalidCodecData(format!(
                "avcC: unsupported version {}",
                version
            )));
        }
        let profile_idc = r.read_u8().map_err(invalid)?;
        let _compat = r.read_u8().map_err(invalid)?;
        let level_idc = r.read_u8().map_err(invalid)?;
        let length_size = (r.read_u8().map_err(invalid)? & 0x3) as usize + 1;

        let num_sps = r.read_u8().map_err(invalid)? & 0x1f;
        let sps = (0..num_sps)
            .map(|_| read_parameter_set(&mut r))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        let num_pps = r.read_u8().map_err(invalid)?;
        let pps = (0..num_pps)
            .map(|_| read_parameter_set(&mut r))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;

        Ok(Self {
            profile_idc,
            level_idc,
            length_size,
            sps,
            pps,
        })
    }

    /// Parameter sets in Annex B form.
    pub fn annex_b(&self) -> Bytes {
        let mut out = BytesMut::new();
        for ps in self.sps.iter().chain(self.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(ps);
        }
        out.freeze()
    }
}

fn read_parameter_set(r: &mut Cursor<&[u8]>) -> std::io::Result<Bytes> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut ps = vec![0u8; len];
    r.read_exact(&mut ps)?;
    Ok(Bytes::from(ps))
}

pub struct H264Profile {
    config: Option<AvcConfig>,
}

impl H264Profile {
    pub fn new(format: &StreamFormat) -> Result<Self, CodecError> {
        let config = match &format.codec_data {
            Some(data) if !data.is_empty() => {
                let config = AvcConfig::parse(data)?;
                debug!(
                    "avcC: profile {} level {}, {} SPS, {} PPS, {}-byte lengths",
                    config.profile_idc,
                    config.level_idc,
                    config.sps.len(),
                    config.pps.len(),
                    config.length_size
                );
                Some(config)
            }
            _ => None,
        };
        Ok(Self { config })
    }

    /// Whether the access units are length-prefixed.
    pub fn is_avc(&self) -> bool {
        self.config.is_some()
    }
}

impl CodecProfile for H264Profile {
    fn std(&self) -> CodecStd {
        CodecStd::Avc
    }

    fn name(&self) -> &'static str {
        "H.264"
    }

    fn synthesize_header(&self) -> Result<Option<Bytes>, CodecError> {
        Ok(self.config.as_ref().map(AvcConfig::annex_b))
    }

    fn repack(&mut self, unit: &[u8], _pts: Option<u64>) -> Result<Bytes, CodecError> {
        let Some(config) = &self.config else {
            return Ok(Bytes::copy_from_slice(unit));
        };

        let mut out = BytesMut::with_capacity(unit.len() + 16);
        let mut pos = 0;
        while pos < unit.len() {
            let prefix = unit
                .get(pos..pos + config.length_size)
                .ok_or_else(|| CodecError::InvalidUnit(String::from("truncated NAL length")))?;
            let len = prefix.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
            pos += config.length_size;
            let nal = unit.get(pos..pos + len).ok_or_else(|| {
                CodecError::InvalidUnit(format!("NAL of {} bytes overruns the unit", len))
            })?;
            out.put_slice(&START_CODE);
            out.put_slice(nal);
            pos += len;
        }
        Ok(out.freeze())
    }

    fn realign<'a>(&self, unit: &'a [u8]) -> &'a [u8] {
        if self.is_avc() {
            return unit;
        }
        match crate::utils::find_start_code(unit, 0) {
            // Keep the leading zero of a 4-byte start code.
            Some(pos) if pos > 0 && unit[pos - 1] == 0 => &unit[pos - 1..],
            Some(pos) => &unit[pos..],
            None => unit,
        }
    }

    fn pixel_aspect_ratio(&self, info: &InitialInfo) -> Fraction {
        aspect_ratio_from_idc(info.aspect_code).unwrap_or(Fraction::new(1, 1))
    }

    fn classify_unit(&self, unit: &[u8]) -> UnitKind {
        let Some(header) = unit.first() else {
            return UnitKind::Other;
        };
        match NaluType::n(header & 0x1f) {
            Some(NaluType::Sps | NaluType::Pps | NaluType::AuDelimiter | NaluType::Sei) => {
                UnitKind::Header
            }
            // first_mb_in_slice is 0 exactly when its Exp-Golomb code is the single bit 1.
            Some(NaluType::Slice | NaluType::SliceIdr) => match unit.get(1) {
                Some(b) if b & 0x80 != 0 => UnitKind::Picture,
                _ => UnitKind::PictureContinuation,
            },
            None => UnitKind::Other,
        }
    }
}
