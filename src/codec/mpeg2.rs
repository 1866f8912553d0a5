// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::backend::CodecStd;
use crate::backend::InitialInfo;
use crate::codec::CodecProfile;
use crate::utils::UnitKind;
use crate::Fraction;

const PICTURE_START_CODE: u8 = 0x00;
const SLICE_START_CODE_MAX: u8 = 0xaf;
const SEQUENCE_HEADER_CODE: u8 = 0xb3;
const GROUP_START_CODE: u8 = 0xb8;

/// Streams that fail to initialize this many times are given up on. Some MPEG-2 streams start
/// with a partial sequence that takes a few attempts to get past.
const INIT_RETRIES: u32 = 5;

/// MPEG-1 and MPEG-2 video.
pub struct Mpeg2Profile;

impl CodecProfile for Mpeg2Profile {
    fn std(&self) -> CodecStd {
        CodecStd::Mpeg2
    }

    fn name(&self) -> &'static str {
        "MPEG-2"
    }

    /// Derives the pixel aspect ratio from the display aspect ratio code of the sequence header.
    fn pixel_aspect_ratio(&self, info: &InitialInfo) -> Fraction {
        let (dar_num, dar_den) = match info.aspect_code {
            2 => (4, 3),
            3 => (16, 9),
            4 => (221, 100),
            _ => return Fraction::new(1, 1),
        };
        let size = info.pic_size;
        if size.is_unknown() {
            return Fraction::new(1, 1);
        }
        Fraction::new(dar_num * size.height, dar_den * size.width).reduced()
    }

    fn init_retries(&self) -> u32 {
        INIT_RETRIES
    }

    fn classify_unit(&self, unit: &[u8]) -> UnitKind {
        match unit.first() {
            Some(&SEQUENCE_HEADER_CODE) | Some(&GROUP_START_CODE) => UnitKind::Header,
            Some(&PICTURE_START_CODE) => UnitKind::Picture,
            Some(0x01..=SLICE_START_CODE_MAX) => UnitKind::PictureContinuation,
            _ => UnitKind::Other,
        }
    }
}
