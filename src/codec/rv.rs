// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! RealVideo 8, 9 and 10.
//!
//! Demuxed RealVideo frames start with a slice table: one byte holding the slice count minus one,
//! then a little-endian `(valid, offset)` pair per slice. The engine instead wants a big-endian
//! frame header carrying the payload size, timestamp, sequence number and the same slice table.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::backend::CodecStd;
use crate::codec::CodecError;
use crate::codec::CodecProfile;
use crate::codec::StreamFormat;
use crate::Fourcc;
use crate::Fraction;
use crate::Resolution;

const SLICE_ENTRY_SIZE: usize = 8;
const SEQUENCE_HEADER_SIZE: usize = 24;

pub struct RvProfile {
    fourcc: Fourcc,
    size: Resolution,
    frame_rate: Fraction,
    codec_data: Bytes,
    sequence: u16,
}

impl RvProfile {
    pub fn new(format: &StreamFormat) -> Result<Self, CodecError> {
        let fourcc = match format.version {
            Some(3) => Fourcc::from(b"RV30"),
            Some(4) => Fourcc::from(b"RV40"),
            _ => return Err(format.unsupported_version()),
        };
        if !format.has_container_geometry() {
            return Err(CodecError::MissingGeometry("RealVideo"));
        }
        Ok(Self {
            fourcc,
            size: format.size,
            frame_rate: format.frame_rate.unwrap_or_default(),
            codec_data: format.codec_data.clone().unwrap_or_default(),
            sequence: 0,
        })
    }
}

impl CodecProfile for RvProfile {
    fn std(&self) -> CodecStd {
        CodecStd::Rv
    }

    fn name(&self) -> &'static str {
        "RealVideo"
    }

    fn synthesize_header(&self) -> Result<Option<Bytes>, CodecError> {
        let fps = if self.frame_rate.is_valid() {
            ((self.frame_rate.num as u64) << 16) / self.frame_rate.den as u64
        } else {
            0
        };
        let mut out = BytesMut::with_capacity(SEQUENCE_HEADER_SIZE + self.codec_data.len());
        out.put_u32((SEQUENCE_HEADER_SIZE + self.codec_data.len()) as u32);
        out.put_slice(b"VIDO");
        out.put_u32_le(self.fourcc.0);
        out.put_u16(self.size.width as u16);
        out.put_u16(self.size.height as u16);
        // 12 bits per pixel, then padding.
        out.put_u16(12);
        out.put_u16(0);
        out.put_u32(fps as u32);
        out.put_slice(&self.codec_data);
        Ok(Some(out.freeze()))
    }

    fn repack(&mut self, unit: &[u8], pts: Option<u64>) -> Result<Bytes, CodecError> {
        let (&count, rest) = unit
            .split_first()
            .ok_or_else(|| CodecError::InvalidUnit(String::from("empty RealVideo frame")))?;
        let num_slices = count as usize + 1;
        let table_size = num_slices * SLICE_ENTRY_SIZE;
        if rest.len() < table_size {
            return Err(CodecError::InvalidUnit(format!(
                "slice table of {} entries truncated",
                num_slices
            )));
        }
        let (table, payload) = rest.split_at(table_size);

        let mut out = BytesMut::with_capacity(12 + table_size + payload.len());
        out.put_u32(payload.len() as u32);
        out.put_u32(pts.map(|pts| pts / 1_000_000).unwrap_or(0) as u32);
        out.put_u16(self.sequence);
        out.put_u16(num_slices as u16);
        for entry in table.chunks_exact(SLICE_ENTRY_SIZE) {
            let offset = LittleEndian::read_u32(&entry[4..]);
            if offset as usize > payload.len() {
                return Err(CodecError::InvalidUnit(format!(
                    "slice offset {} past the end of the frame",
                    offset
                )));
            }
            out.put_u32(LittleEndian::read_u32(&entry[..4]));
            out.put_u32(offset);
        }
        out.put_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(out.freeze())
    }

    fn realign<'a>(&self, unit: &'a [u8]) -> &'a [u8] {
        unit
    }

    /// Frames must reach the engine one by one along with their slice table.
    fn required_file_play(&self) -> Option<bool> {
        Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rv40() -> RvProfile {
        let format = StreamFormat::new("video/x-pn-realvideo")
            .with_version(4)
            .with_size(352, 288)
            .with_frame_rate(25, 1)
            .with_codec_data(vec![0x10, 0x20]);
        RvProfile::new(&format).unwrap()
    }

    #[test]
    fn sequence_header() {
        let header = rv40().synthesize_header().unwrap().unwrap();
        assert_eq!(header.len(), 26);
        assert_eq!(&header[..4], &26u32.to_be_bytes());
        assert_eq!(&header[4..12], b"VIDORV40");
        assert_eq!(&header[12..14], &352u16.to_be_bytes());
        assert_eq!(&header[14..16], &288u16.to_be_bytes());
        assert_eq!(&header[20..24], &(25u32 << 16).to_be_bytes());
        assert_eq!(&header[24..], &[0x10, 0x20]);
    }

    #[test]
    fn slice_table_conversion() {
        let mut profile = rv40();
        let frame = [
            1, // two slices
            1, 0, 0, 0, 0, 0, 0, 0, // slice 0 at 0
            1, 0, 0, 0, 2, 0, 0, 0, // slice 1 at 2
            0xaa, 0xbb, 0xcc,
        ];
        let out = profile.repack(&frame, Some(80_000_000)).unwrap();
        assert_eq!(&out[..4], &3u32.to_be_bytes());
        assert_eq!(&out[4..8], &80u32.to_be_bytes());
        assert_eq!(&out[8..10], &0u16.to_be_bytes());
        assert_eq!(&out[10..12], &2u16.to_be_bytes());
        assert_eq!(&out[12..20], &[0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(&out[20..28], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&out[28..], &[0xaa, 0xbb, 0xcc]);

        let out = profile.repack(&frame, None).unwrap();
        assert_eq!(&out[8..10], &1u16.to_be_bytes());
    }

    #[test]
    fn malformed_frames() {
        let mut profile = rv40();
        assert!(profile.repack(&[], None).is_err());
        assert!(profile.repack(&[0, 1, 0, 0], None).is_err());
        assert!(profile
            .repack(&[0, 1, 0, 0, 0, 9, 0, 0, 0, 0xaa], None)
            .is_err());
    }

    #[test]
    fn needs_version_and_geometry() {
        let format = StreamFormat::new("video/x-pn-realvideo").with_version(2);
        assert!(matches!(
            RvProfile::new(&format.with_size(352, 288)),
            Err(CodecError::UnsupportedVersion { .. })
        ));
        let format = StreamFormat::new("video/x-pn-realvideo").with_version(3);
        assert!(matches!(
            RvProfile::new(&format),
            Err(CodecError::MissingGeometry(_))
        ));
    }
}
