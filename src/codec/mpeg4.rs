// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MPEG-4 Part 2 and its relatives: H.263 and the DivX family.

use bytes::Bytes;

use crate::backend::CodecStd;
use crate::backend::InitialInfo;
use crate::codec::CodecError;
use crate::codec::CodecProfile;
use crate::codec::StreamFormat;
use crate::utils::UnitKind;
use crate::Fraction;

const VOS_START_CODE: u8 = 0xb0;
const GOV_START_CODE: u8 = 0xb3;
const VO_START_CODE: u8 = 0xb5;
const VOP_START_CODE: u8 = 0xb6;
/// Video object and video object layer start codes.
const VOL_START_CODE_MAX: u8 = 0x2f;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mpeg4Variant {
    Mpeg4,
    H263,
    /// DivX 3.11, a variant of MPEG-4 without start codes.
    DivX3,
    DivX4,
    /// DivX 5 and later, including XviD.
    DivX5,
}

pub struct Mpeg4Profile {
    variant: Mpeg4Variant,
    codec_data: Option<Bytes>,
}

impl Mpeg4Profile {
    pub fn new(variant: Mpeg4Variant, format: &StreamFormat) -> Result<Self, CodecError> {
        // DivX 3 has no sequence header, the engine can only learn the picture size from us.
        if variant == Mpeg4Variant::DivX3 && !format.has_container_geometry() {
            return Err(CodecError::MissingGeometry("DivX 3"));
        }
        Ok(Self {
            variant,
            codec_data: format.codec_data.clone().filter(|data| !data.is_empty()),
        })
    }

    pub fn variant(&self) -> Mpeg4Variant {
        self.variant
    }
}

/// Offset of the first H.263 picture start code: 22 bits `0000 0000 0000 0000 1000 00`.
fn find_picture_start_code(data: &[u8]) -> Option<usize> {
    data.windows(3)
        .position(|w| w[0] == 0 && w[1] == 0 && w[2] & 0xfc == 0x80)
}

impl CodecProfile for Mpeg4Profile {
    fn std(&self) -> CodecStd {
        match self.variant {
            Mpeg4Variant::Mpeg4 | Mpeg4Variant::DivX4 | Mpeg4Variant::DivX5 => CodecStd::Mpeg4,
            Mpeg4Variant::H263 => CodecStd::H263,
            Mpeg4Variant::DivX3 => CodecStd::DivX3,
        }
    }

    fn name(&self) -> &'static str {
        match self.variant {
            Mpeg4Variant::Mpeg4 => "MPEG-4",
            Mpeg4Variant::H263 => "H.263",
            Mpeg4Variant::DivX3 => "DivX 3",
            Mpeg4Variant::DivX4 => "DivX 4",
            Mpeg4Variant::DivX5 => "DivX 5",
        }
    }

    /// The video object layer, for containers that keep it out of band.
    fn synthesize_header(&self) -> Result<Option<Bytes>, CodecError> {
        match self.variant {
            Mpeg4Variant::H263 | Mpeg4Variant::DivX3 => Ok(None),
            _ => Ok(self.codec_data.clone()),
        }
    }

    fn realign<'a>(&self, unit: &'a [u8]) -> &'a [u8] {
        let start = match self.variant {
            Mpeg4Variant::DivX3 => None,
            Mpeg4Variant::H263 => find_picture_start_code(unit),
            _ => crate::utils::find_start_code(unit, 0),
        };
        match start {
            Some(pos) => &unit[pos..],
            None => unit,
        }
    }

    fn pixel_aspect_ratio(&self, info: &InitialInfo) -> Fraction {
        match info.aspect_code {
            2 => Fraction::new(12, 11),
            3 => Fraction::new(10, 11),
            4 => Fraction::new(16, 11),
            5 => Fraction::new(40, 33),
            _ => Fraction::new(1, 1),
        }
    }

    fn mp4_class(&self) -> u32 {
        match self.variant {
            Mpeg4Variant::DivX5 => 1,
            Mpeg4Variant::DivX4 => 2,
            _ => 0,
        }
    }

    fn classify_unit(&self, unit: &[u8]) -> UnitKind {
        if matches!(self.variant, Mpeg4Variant::H263 | Mpeg4Variant::DivX3) {
            return UnitKind::Other;
        }
        match unit.first() {
            Some(0x00..=VOL_START_CODE_MAX)
            | Some(&VOS_START_CODE)
            | Some(&GOV_START_CODE)
            | Some(&VO_START_CODE) => UnitKind::Header,
            Some(&VOP_START_CODE) => UnitKind::Picture,
            _ => UnitKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::split_access_units;

    #[test]
    fn engine_flavours() {
        let format = StreamFormat::new("video/x-divx");
        let divx4 = Mpeg4Profile::new(Mpeg4Variant::DivX4, &format).unwrap();
        assert_eq!(divx4.std(), CodecStd::Mpeg4);
        assert_eq!(divx4.mp4_class(), 2);

        let h263 = Mpeg4Profile::new(Mpeg4Variant::H263, &format).unwrap();
        assert_eq!(h263.std(), CodecStd::H263);
        assert_eq!(h263.mp4_class(), 0);
    }

    #[test]
    fn vol_header_from_codec_data() {
        let vol = [0x00, 0x00, 0x01, 0x20, 0x08];
        let format = StreamFormat::new("video/mpeg")
            .with_version(4)
            .with_codec_data(vol.to_vec());
        let profile = Mpeg4Profile::new(Mpeg4Variant::Mpeg4, &format).unwrap();
        assert_eq!(&profile.synthesize_header().unwrap().unwrap()[..], &vol);

        let empty = StreamFormat::new("video/mpeg")
            .with_version(4)
            .with_codec_data(Vec::new());
        let profile = Mpeg4Profile::new(Mpeg4Variant::Mpeg4, &empty).unwrap();
        assert!(profile.synthesize_header().unwrap().is_none());
    }

    #[test]
    fn realignment() {
        let format = StreamFormat::new("video/x-h263");
        let h263 = Mpeg4Profile::new(Mpeg4Variant::H263, &format).unwrap();
        let data = [0xff, 0x00, 0x00, 0x82, 0x10];
        assert_eq!(h263.realign(&data), &data[1..]);

        let mpeg4 = Mpeg4Profile::new(Mpeg4Variant::Mpeg4, &format).unwrap();
        let data = [0xff, 0xfe, 0x00, 0x00, 0x01, 0xb6];
        assert_eq!(mpeg4.realign(&data), &data[2..]);

        let divx3 = Mpeg4Profile::new(
            Mpeg4Variant::DivX3,
            &StreamFormat::new("video/x-divx").with_size(320, 240),
        )
        .unwrap();
        assert_eq!(divx3.realign(&data), &data);
    }

    #[test]
    fn split_into_vops() {
        let format = StreamFormat::new("video/mpeg").with_version(4);
        let profile = Mpeg4Profile::new(Mpeg4Variant::Mpeg4, &format).unwrap();
        let stream = [
            0x00, 0x00, 0x01, 0xb0, 0x01, // VOS
            0x00, 0x00, 0x01, 0x20, 0x08, // VOL
            0x00, 0x00, 0x01, 0xb6, 0x10, // VOP
            0x00, 0x00, 0x01, 0xb6, 0x50, // VOP
        ];
        let units = split_access_units(&profile, &stream).collect::<Vec<_>>();
        assert_eq!(units, vec![&stream[..15], &stream[15..]]);
    }

    #[test]
    fn aspect_ratio_info() {
        let format = StreamFormat::new("video/mpeg").with_version(4);
        let profile = Mpeg4Profile::new(Mpeg4Variant::Mpeg4, &format).unwrap();
        let info = InitialInfo {
            aspect_code: 3,
            ..Default::default()
        };
        assert_eq!(profile.pixel_aspect_ratio(&info), Fraction::new(10, 11));
    }
}
