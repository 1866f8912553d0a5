// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::backend::CodecStd;
use crate::backend::InitialInfo;
use crate::backend::OutputInfo;
use crate::codec::CodecProfile;
use crate::video_frame::ChromaFormat;

const SOI: [u8; 2] = [0xff, 0xd8];

/// Motion JPEG: every picture is a standalone JPEG image.
pub struct MjpegProfile;

impl MjpegProfile {
    /// Chroma layouts the engine can decode. 4:2:2 output additionally needs the rotator to be
    /// converted to 4:2:0.
    pub fn supports_chroma(chroma: ChromaFormat) -> bool {
        matches!(
            chroma,
            ChromaFormat::Yuv420 | ChromaFormat::Yuv422Horizontal
        )
    }
}

impl CodecProfile for MjpegProfile {
    fn std(&self) -> CodecStd {
        CodecStd::Mjpeg
    }

    fn name(&self) -> &'static str {
        "MJPEG"
    }

    fn realign<'a>(&self, unit: &'a [u8]) -> &'a [u8] {
        match unit.windows(2).position(|w| w == SOI) {
            Some(pos) => &unit[pos..],
            None => unit,
        }
    }

    fn is_interlaced(&self, _info: &InitialInfo, _output: Option<&OutputInfo>) -> bool {
        false
    }

    /// Images are only known to be complete once the whole buffer is in, so they are always
    /// handed over one at a time.
    fn required_file_play(&self) -> Option<bool> {
        Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_on_start_of_image() {
        let data = [0x00, 0x12, 0xff, 0xd8, 0xff, 0xe0];
        assert_eq!(MjpegProfile.realign(&data), &data[2..]);
        assert_eq!(MjpegProfile.realign(&[0x00, 0x00]), &[0x00, 0x00]);
    }

    #[test]
    fn chroma_support() {
        assert!(MjpegProfile::supports_chroma(ChromaFormat::Yuv420));
        assert!(MjpegProfile::supports_chroma(ChromaFormat::Yuv422Horizontal));
        assert!(!MjpegProfile::supports_chroma(ChromaFormat::Yuv444));
    }
}
