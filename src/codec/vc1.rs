// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VC-1 streams.
//!
//! Simple and main profile streams (WMV3) have no start codes at all. The engine expects them
//! wrapped the way RCV files store them: a sequence layer built from the container's `STRUCT_C`
//! and picture size, then an 8-byte header before every frame. Advanced profile streams (WVC1)
//! carry their sequence header and entry point in the codec data, and frames from ASF-like
//! containers lack the frame start code.

use bitreader::BitReader;
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
use crate::utils::find_start_code;
use crate::utils::UnitKind;
use crate::Fraction;
use crate::Resolution;

/// RCV version 2 with extension data, followed by an unknown number of frames.
const RCV_MAGIC: u32 = 0xc5ff_ffff;
const STRUCT_C_SIZE: u32 = 4;
const STRUCT_B_SIZE: u32 = 12;
const KEYFRAME_FLAG: u32 = 0x8000_0000;

const FRAME_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0x0d];

const SC_SLICE: u8 = 0x0b;
const SC_FIELD: u8 = 0x0c;
const SC_FRAME: u8 = 0x0d;
const SC_ENTRY_POINT: u8 = 0x0e;
const SC_SEQUENCE: u8 = 0x0f;

/// Fields of `STRUCT_C` needed to locate the picture type in frame headers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StructC {
    pub profile: u8,
    pub rangered: bool,
    pub max_b_frames: u8,
    pub finterpflag: bool,
}

impl StructC {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let invalid = |e: bitreader::BitReaderError| {
            CodecError::InvalidCodecData(format!("STRUCT_C: {}", e))
        };
        let mut r = BitReader::new(data);

        let profile = r.read_u8(4).map_err(invalid)?;
        // FRMRTQ_POSTPROC up to SYNCMARKER.
        r.skip(20).map_err(invalid)?;
        let rangered = r.read_bool().map_err(invalid)?;
        let max_b_frames = r.read_u8(3).map_err(invalid)?;
        r.skip(2).map_err(invalid)?;
        let finterpflag = r.read_bool().map_err(invalid)?;

        Ok(Self {
            profile,
            rangered,
            max_b_frames,
            finterpflag,
        })
    }

    /// Reads the picture type from the start of a simple or main profile frame.
    pub fn is_key_frame(&self, frame: &[u8]) -> bool {
        let mut r = BitReader::new(frame);
        let mut key = || -> Result<bool, bitreader::BitReaderError> {
            if self.finterpflag {
                r.skip(1)?;
            }
            // FRMCNT
            r.skip(2)?;
            if self.rangered {
                r.skip(1)?;
            }
            if self.max_b_frames == 0 {
                Ok(!r.read_bool()?)
            } else {
                Ok(!r.read_bool()? && r.read_bool()?)
            }
        };
        key().unwrap_or(false)
    }
}

enum Layout {
    /// Simple and main profiles, wrapped into RCV framing.
    Rcv { struct_c: StructC, raw: Bytes },
    /// Advanced profile.
    Advanced { header: Bytes },
}

pub struct Vc1Profile {
    layout: Layout,
    size: Resolution,
}

impl Vc1Profile {
    pub fn new(format: &StreamFormat) -> Result<Self, CodecError> {
        if format.version.is_some_and(|v| v != 3) {
            return Err(format.unsupported_version());
        }
        let codec_data = format
            .codec_data
            .clone()
            .ok_or(CodecError::MissingCodecData("VC-1"))?;

        let advanced = match format.fourcc.map(|f| f.to_string()) {
            Some(fourcc) if fourcc == "WVC1" || fourcc == "WVP2" => true,
            Some(fourcc) if fourcc == "WMV3" => false,
            Some(fourcc) => {
                return Err(CodecError::UnsupportedMime(format!(
                    "{} with fourcc {}",
                    format.mime, fourcc
                )))
            }
            // Without a fourcc, advanced profile codec data is recognizable by its start codes.
            None => find_start_code(&codec_data, 0).is_some(),
        };

        let layout = if advanced {
            let start = find_start_code(&codec_data, 0).ok_or_else(|| {
                CodecError::InvalidCodecData(String::from("no sequence header in WVC1 data"))
            })?;
            Layout::Advanced {
                header: codec_data.slice(start..),
            }
        } else {
            if !format.has_container_geometry() {
                return Err(CodecError::MissingGeometry("WMV3"));
            }
            let struct_c = StructC::parse(&codec_data)?;
            debug!("WMV3 STRUCT_C: {:?}", struct_c);
            Layout::Rcv {
                struct_c,
                raw: codec_data.slice(..STRUCT_C_SIZE as usize),
            }
        };

        Ok(Self {
            layout,
            size: format.size,
        })
    }

    pub fn is_advanced(&self) -> bool {
        matches!(self.layout, Layout::Advanced { .. })
    }
}

impl CodecProfile for Vc1Profile {
    fn std(&self) -> CodecStd {
        CodecStd::Vc1
    }

    fn name(&self) -> &'static str {
        "VC-1"
    }

    fn synthesize_header(&self) -> Result<Option<Bytes>, CodecError> {
        let (struct_c, raw) = match &self.layout {
            Layout::Advanced { header } => return Ok(Some(header.clone())),
            Layout::Rcv { struct_c, raw } => (struct_c, raw),
        };

        let mut out = BytesMut::with_capacity(36);
        out.put_u32_le(RCV_MAGIC);
        out.put_u32_le(STRUCT_C_SIZE);
        out.put_slice(raw);
        out.put_u32_le(self.size.height);
        out.put_u32_le(self.size.width);
        out.put_u32_le(STRUCT_B_SIZE);
        // STRUCT_B: LEVEL, CBR and HRD_BUFFER, then HRD_RATE and FRAMERATE left unspecified.
        let level = if struct_c.profile == 0 { 0 } else { 2 };
        out.put_u32_le((level << 29) | (1 << 28) | 0x00ff_ffff);
        out.put_u32_le(0);
        out.put_u32_le(0xffff_ffff);
        Ok(Some(out.freeze()))
    }

    fn repack(&mut self, unit: &[u8], pts: Option<u64>) -> Result<Bytes, CodecError> {
        match &self.layout {
            Layout::Rcv { struct_c, .. } => {
                let size = u32::try_from(unit.len())
                    .ok()
                    .filter(|&size| size & KEYFRAME_FLAG == 0)
                    .ok_or_else(|| CodecError::InvalidUnit(String::from("frame too large")))?;
                let key = if struct_c.is_key_frame(unit) {
                    KEYFRAME_FLAG
                } else {
                    0
                };
                let ts_ms = pts.map(|pts| pts / 1_000_000).unwrap_or(0) as u32;

                let mut out = BytesMut::with_capacity(unit.len() + 8);
                out.put_u32_le(size | key);
                out.put_u32_le(ts_ms);
                out.put_slice(unit);
                Ok(out.freeze())
            }
            Layout::Advanced { .. } => {
                if unit.starts_with(&FRAME_START_CODE[..3]) {
                    return Ok(Bytes::copy_from_slice(unit));
                }
                let mut out = BytesMut::with_capacity(unit.len() + 4);
                out.put_slice(&FRAME_START_CODE);
                out.put_slice(unit);
                Ok(out.freeze())
            }
        }
    }

    fn realign<'a>(&self, unit: &'a [u8]) -> &'a [u8] {
        // RCV frames and bare advanced profile frames have nothing to align on.
        unit
    }

    fn pixel_aspect_ratio(&self, info: &InitialInfo) -> Fraction {
        if !self.is_advanced() {
            return Fraction::new(1, 1);
        }
        aspect_ratio_from_idc(info.aspect_code)
            .filter(|_| info.aspect_code <= 13)
            .unwrap_or(Fraction::new(1, 1))
    }

    fn classify_unit(&self, unit: &[u8]) -> UnitKind {
        match unit.first() {
            Some(&SC_SEQUENCE) | Some(&SC_ENTRY_POINT) => UnitKind::Header,
            Some(&SC_FRAME) => UnitKind::Picture,
            Some(&SC_FIELD) | Some(&SC_SLICE) => UnitKind::PictureContinuation,
            _ => UnitKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Main profile, RANGERED off, MAXBFRAMES 1, FINTERPFLAG off.
    const STRUCT_C: [u8; 4] = [0x40, 0x00, 0x00, 0x10];

    fn wmv3_format() -> StreamFormat {
        StreamFormat::new("video/x-wmv")
            .with_version(3)
            .with_fourcc(b"WMV3")
            .with_size(320, 240)
            .with_codec_data(STRUCT_C.to_vec())
    }

    #[test]
    fn parse_struct_c() {
        let struct_c = StructC::parse(&STRUCT_C).unwrap();
        assert_eq!(
            struct_c,
            StructC {
                profile: 4,
                rangered: false,
                max_b_frames: 1,
                finterpflag: false,
            }
        );
        assert!(StructC::parse(&STRUCT_C[..2]).is_err());
    }

    #[test]
    fn key_frame_detection() {
        let struct_c = StructC::parse(&STRUCT_C).unwrap();
        // FRMCNT 00, then PTYPE 01 (I).
        assert!(struct_c.is_key_frame(&[0b0001_0000]));
        // PTYPE 1 (P).
        assert!(!struct_c.is_key_frame(&[0b0010_0000]));
        // PTYPE 00 (B).
        assert!(!struct_c.is_key_frame(&[0b0000_0000]));
        assert!(!struct_c.is_key_frame(&[]));

        let no_b = StructC {
            max_b_frames: 0,
            ..struct_c
        };
        assert!(no_b.is_key_frame(&[0b0000_0000]));
        assert!(!no_b.is_key_frame(&[0b0010_0000]));
    }

    #[test]
    fn rcv_sequence_layer() {
        let profile = Vc1Profile::new(&wmv3_format()).unwrap();
        let header = profile.synthesize_header().unwrap().unwrap();
        assert_eq!(header.len(), 36);
        assert_eq!(&header[..4], &[0xff, 0xff, 0xff, 0xc5]);
        assert_eq!(&header[4..8], &[4, 0, 0, 0]);
        assert_eq!(&header[8..12], &STRUCT_C);
        assert_eq!(&header[12..16], &240u32.to_le_bytes());
        assert_eq!(&header[16..20], &320u32.to_le_bytes());
        assert_eq!(&header[20..24], &12u32.to_le_bytes());
    }

    #[test]
    fn rcv_frame_header() {
        let mut profile = Vc1Profile::new(&wmv3_format()).unwrap();
        let frame = [0b0001_0000, 0xaa, 0xbb];
        let repacked = profile.repack(&frame, Some(40_000_000)).unwrap();
        assert_eq!(&repacked[..4], &(3u32 | KEYFRAME_FLAG).to_le_bytes());
        assert_eq!(&repacked[4..8], &40u32.to_le_bytes());
        assert_eq!(&repacked[8..], &frame);

        let repacked = profile.repack(&[0b0010_0000], None).unwrap();
        assert_eq!(&repacked[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn wmv3_needs_geometry() {
        let format = StreamFormat {
            size: Resolution::default(),
            ..wmv3_format()
        };
        assert!(matches!(
            Vc1Profile::new(&format),
            Err(CodecError::MissingGeometry(_))
        ));
    }

    #[test]
    fn advanced_profile() {
        let codec_data = [0x24, 0x00, 0x00, 0x01, 0x0f, 0xca, 0x00, 0x00, 0x01, 0x0e, 0x48];
        let format = StreamFormat::new("video/x-wmv")
            .with_version(3)
            .with_fourcc(b"WVC1")
            .with_codec_data(codec_data.to_vec());
        let mut profile = Vc1Profile::new(&format).unwrap();
        assert!(profile.is_advanced());
        assert_eq!(
            &profile.synthesize_header().unwrap().unwrap()[..],
            &codec_data[1..]
        );

        let repacked = profile.repack(&[0x12, 0x34], None).unwrap();
        assert_eq!(&repacked[..], &[0x00, 0x00, 0x01, 0x0d, 0x12, 0x34]);
        let framed = [0x00, 0x00, 0x01, 0x0d, 0x56];
        assert_eq!(&profile.repack(&framed, None).unwrap()[..], &framed);

        let info = InitialInfo {
            aspect_code: 3,
            ..Default::default()
        };
        assert_eq!(profile.pixel_aspect_ratio(&info), Fraction::new(10, 11));
    }

    #[test]
    fn missing_codec_data() {
        let format = StreamFormat::new("video/x-wmv")
            .with_version(3)
            .with_fourcc(b"WMV3")
            .with_size(320, 240);
        assert!(matches!(
            Vc1Profile::new(&format),
            Err(CodecError::MissingCodecData(_))
        ));
    }
}
