// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output frame memory: layout of a hardware frame buffer, the DMA memory backing it, and the pool
//! tracking the lifecycle of every buffer.

pub mod dma;
pub mod frame_pool;

use enumn::N;

use crate::DecodedFormat;
use crate::Resolution;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

/// Chroma subsampling of the decoded pictures, as reported by the engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ChromaFormat {
    #[default]
    Yuv420 = 0,
    Yuv422Horizontal = 1,
    Yuv422Vertical = 2,
    Yuv444 = 3,
    Yuv400 = 4,
}

impl ChromaFormat {
    /// Size of one chroma plane for a luma plane of `luma_size` bytes.
    fn chroma_plane_size(&self, luma_size: usize) -> usize {
        match self {
            ChromaFormat::Yuv420 => luma_size / 4,
            ChromaFormat::Yuv422Horizontal | ChromaFormat::Yuv422Vertical => luma_size / 2,
            ChromaFormat::Yuv444 => luma_size,
            ChromaFormat::Yuv400 => 0,
        }
    }
}

/// Byte layout of one frame buffer: luma, two chroma planes (or one interleaved plane) and the
/// co-located motion vector area the hardware needs for every reference picture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    /// Padded size of the luma plane.
    pub size: Resolution,
    pub format: DecodedFormat,
    pub chroma: ChromaFormat,
    /// Offsets of the Y, Cb and Cr planes. For interleaved formats the Cr offset is the same as
    /// the Cb one.
    pub plane_offsets: [usize; 3],
    pub plane_pitches: [usize; 3],
    pub mv_offset: usize,
    pub frame_size: usize,
}

impl FrameLayout {
    pub fn new(size: Resolution, format: DecodedFormat, chroma: ChromaFormat) -> Self {
        let luma_size = size.get_area();
        let chroma_size = chroma.chroma_plane_size(luma_size);
        let width = size.width as usize;

        let (plane_offsets, plane_pitches) = if format.is_interleaved() {
            let cb = luma_size;
            ([0, cb, cb], [width, width, width])
        } else {
            let chroma_pitch = match chroma {
                ChromaFormat::Yuv444 | ChromaFormat::Yuv422Vertical => width,
                _ => width / 2,
            };
            (
                [0, luma_size, luma_size + chroma_size],
                [width, chroma_pitch, chroma_pitch],
            )
        };

        let mv_offset = luma_size + 2 * chroma_size;
        let mv_size = luma_size / 4;

        Self {
            size,
            format,
            chroma,
            plane_offsets,
            plane_pitches,
            mv_offset,
            frame_size: mv_offset + mv_size,
        }
    }

    /// Number of bytes of picture data, i.e. the frame without the motion vector area.
    pub fn picture_size(&self) -> usize {
        self.mv_offset
    }
}
