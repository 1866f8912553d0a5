// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-codec knowledge needed to drive the engine.
//!
//! The engine decodes every supported standard itself, but each of them comes with its own
//! conventions: headers carried out-of-band by the container that must be placed in-band, frame
//! headers to synthesize, alignment requirements on the first unit, cropping, interlacing and
//! aspect ratio signalling. [`CodecProfile`] gathers these, with one implementation per codec
//! family, and [`profile_for`] picks the right one for a [`StreamFormat`].

pub mod h264;
pub mod mjpeg;
pub mod mpeg2;
pub mod mpeg4;
pub mod rv;
pub mod vc1;

use bytes::Bytes;
use thiserror::Error;

use crate::backend::CodecStd;
use crate::backend::InitialInfo;
use crate::backend::OutputInfo;
use crate::utils::find_start_code;
use crate::utils::AccessUnitIterator;
use crate::utils::UnitKind;
use crate::Fourcc;
use crate::Fraction;
use crate::Rect;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported media type {0}")]
    UnsupportedMime(String),
    #[error("unsupported version {version:?} of {mime}")]
    UnsupportedVersion { mime: String, version: Option<u32> },
    #[error("{0} streams need codec data")]
    MissingCodecData(&'static str),
    #[error("invalid codec data: {0}")]
    InvalidCodecData(String),
    #[error("{0} streams need the picture size from the container")]
    MissingGeometry(&'static str),
    #[error("invalid access unit: {0}")]
    InvalidUnit(String),
}

/// Description of the compressed input, as given by the container or parser.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamFormat {
    pub mime: String,
    /// Codec revision: mpegversion, divxversion, wmvversion or the RealVideo version.
    pub version: Option<u32>,
    /// Fourcc of the bitstream, for containers that carry one.
    pub fourcc: Option<Fourcc>,
    /// Picture size from the container. Zero if unknown.
    pub size: Resolution,
    pub frame_rate: Option<Fraction>,
    pub pixel_aspect_ratio: Option<Fraction>,
    /// Out-of-band headers.
    pub codec_data: Option<Bytes>,
}

impl StreamFormat {
    pub fn new(mime: &str) -> Self {
        Self {
            mime: String::from(mime),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_fourcc(mut self, fourcc: &[u8; 4]) -> Self {
        self.fourcc = Some(Fourcc::from(fourcc));
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = Resolution::from((width, height));
        self
    }

    pub fn with_frame_rate(mut self, num: u32, den: u32) -> Self {
        self.frame_rate = Some(Fraction::new(num, den));
        self
    }

    pub fn with_codec_data<B: Into<Bytes>>(mut self, data: B) -> Self {
        self.codec_data = Some(data.into());
        self
    }

    /// Whether the container gave the picture size, meaning a parser is framing the input.
    pub fn has_container_geometry(&self) -> bool {
        !self.size.is_unknown()
    }

    fn unsupported_version(&self) -> CodecError {
        CodecError::UnsupportedVersion {
            mime: self.mime.clone(),
            version: self.version,
        }
    }
}

/// Behavior specific to one codec family.
pub trait CodecProfile: Send {
    fn std(&self) -> CodecStd;

    fn name(&self) -> &'static str;

    /// In-band header to write before the first access unit, built from the out-of-band codec
    /// data.
    fn synthesize_header(&self) -> Result<Option<Bytes>, CodecError> {
        Ok(None)
    }

    /// Converts one access unit to the layout the engine expects.
    fn repack(&mut self, unit: &[u8], _pts: Option<u64>) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(unit))
    }

    /// Skips whatever precedes the first start code of the stream.
    fn realign<'a>(&self, unit: &'a [u8]) -> &'a [u8] {
        match find_start_code(unit, 0) {
            Some(pos) => &unit[pos..],
            None => unit,
        }
    }

    /// Visible area of the pictures.
    fn crop(&self, info: &InitialInfo) -> Rect {
        info.crop
            .filter(|crop| !crop.is_empty())
            .unwrap_or_else(|| Rect::from_resolution(info.pic_size))
    }

    /// Whether a decoded picture is made of two fields.
    fn is_interlaced(&self, info: &InitialInfo, output: Option<&OutputInfo>) -> bool {
        info.interlaced || output.is_some_and(|o| o.interlaced)
    }

    fn pixel_aspect_ratio(&self, _info: &InitialInfo) -> Fraction {
        Fraction::new(1, 1)
    }

    /// Initialization failures tolerated before the stream is declared broken.
    fn init_retries(&self) -> u32 {
        0
    }

    fn min_resolution(&self) -> Resolution {
        Resolution::from((16, 16))
    }

    /// MPEG-4 flavour given to the engine.
    fn mp4_class(&self) -> u32 {
        0
    }

    /// Input delivery the codec needs regardless of the container, if any.
    fn required_file_play(&self) -> Option<bool> {
        None
    }

    /// Classifies the unit following a `00 00 01` start code, for access unit splitting.
    fn classify_unit(&self, _unit: &[u8]) -> UnitKind {
        UnitKind::Other
    }
}

/// Returns the profile handling `format`.
pub fn profile_for(format: &StreamFormat) -> Result<Box<dyn CodecProfile>, CodecError> {
    let profile: Box<dyn CodecProfile> = match format.mime.as_str() {
        "video/x-h264" => Box::new(h264::H264Profile::new(format)?),
        "video/x-wmv" => Box::new(vc1::Vc1Profile::new(format)?),
        "video/mpeg" => match format.version {
            Some(1) | Some(2) => Box::new(mpeg2::Mpeg2Profile),
            Some(4) => Box::new(mpeg4::Mpeg4Profile::new(
                mpeg4::Mpeg4Variant::Mpeg4,
                format,
            )?),
            _ => return Err(format.unsupported_version()),
        },
        "video/x-h263" => Box::new(mpeg4::Mpeg4Profile::new(mpeg4::Mpeg4Variant::H263, format)?),
        "video/x-divx" => match format.version {
            Some(3) => Box::new(mpeg4::Mpeg4Profile::new(mpeg4::Mpeg4Variant::DivX3, format)?),
            Some(4) => Box::new(mpeg4::Mpeg4Profile::new(mpeg4::Mpeg4Variant::DivX4, format)?),
            Some(5) | Some(6) => {
                Box::new(mpeg4::Mpeg4Profile::new(mpeg4::Mpeg4Variant::DivX5, format)?)
            }
            _ => return Err(format.unsupported_version()),
        },
        "video/x-xvid" => Box::new(mpeg4::Mpeg4Profile::new(mpeg4::Mpeg4Variant::DivX5, format)?),
        "video/x-pn-realvideo" => Box::new(rv::RvProfile::new(format)?),
        "image/jpeg" => Box::new(mjpeg::MjpegProfile),
        mime => return Err(CodecError::UnsupportedMime(String::from(mime))),
    };
    Ok(profile)
}

/// Splits a start-code delimited elementary stream into access units.
pub fn split_access_units<'a>(
    profile: &'a dyn CodecProfile,
    data: &'a [u8],
) -> impl Iterator<Item = &'a [u8]> + 'a {
    AccessUnitIterator::new(data, move |unit| profile.classify_unit(unit))
}

/// Pixel aspect ratios indexed by the `aspect_ratio_idc` of H.264 and the `ASPECT_RATIO` of VC-1.
const ASPECT_RATIO_TABLE: [(u32, u32); 16] = [
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// Looks up the pixel aspect ratio of code `idc`, 1-based. Returns `None` for unspecified or
/// reserved codes.
pub(crate) fn aspect_ratio_from_idc(idc: u32) -> Option<Fraction> {
    let index = idc.checked_sub(1)? as usize;
    ASPECT_RATIO_TABLE
        .get(index)
        .map(|&(num, den)| Fraction::new(num, den))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_selection() {
        let profile = profile_for(&StreamFormat::new("video/mpeg").with_version(2)).unwrap();
        assert_eq!(profile.std(), CodecStd::Mpeg2);
        assert_eq!(profile.init_retries(), 5);

        let profile = profile_for(&StreamFormat::new("video/x-divx").with_version(5)).unwrap();
        assert_eq!(profile.std(), CodecStd::Mpeg4);
        assert_eq!(profile.mp4_class(), 1);

        let profile = profile_for(&StreamFormat::new("image/jpeg")).unwrap();
        assert_eq!(profile.required_file_play(), Some(true));

        assert!(matches!(
            profile_for(&StreamFormat::new("video/x-vp8")),
            Err(CodecError::UnsupportedMime(_))
        ));
        assert!(matches!(
            profile_for(&StreamFormat::new("video/mpeg").with_version(3)),
            Err(CodecError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn divx3_needs_container_geometry() {
        let format = StreamFormat::new("video/x-divx").with_version(3);
        assert!(matches!(
            profile_for(&format),
            Err(CodecError::MissingGeometry(_))
        ));
        let profile = profile_for(&format.with_size(640, 480)).unwrap();
        assert_eq!(profile.std(), CodecStd::DivX3);
    }

    #[test]
    fn aspect_ratio_codes() {
        assert_eq!(aspect_ratio_from_idc(0), None);
        assert_eq!(aspect_ratio_from_idc(2), Some(Fraction::new(12, 11)));
        assert_eq!(aspect_ratio_from_idc(16), Some(Fraction::new(2, 1)));
        assert_eq!(aspect_ratio_from_idc(17), None);
    }

    #[test]
    fn split_mpeg2_stream() {
        let profile = mpeg2::Mpeg2Profile;
        let stream = [
            0x00, 0x00, 0x01, 0xb3, 0x14, // sequence header
            0x00, 0x00, 0x01, 0x00, 0x01, // picture
            0x00, 0x00, 0x01, 0x01, 0x02, // slice
            0x00, 0x00, 0x01, 0x00, 0x03, // picture
            0x00, 0x00, 0x01, 0x01, 0x04, // slice
        ];
        let units = split_access_units(&profile, &stream).collect::<Vec<_>>();
        assert_eq!(units, vec![&stream[..15], &stream[15..]]);
    }
}
