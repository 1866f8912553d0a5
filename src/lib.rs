// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame-buffer lifecycle and decode/display pipeline for VPU-style hardware video decoders.
//!
//! The hardware unit is programmed through the narrow [`backend::VpuEngine`] interface. On top of
//! it, [`decoder::session::DecodeSession`] owns the bitstream ring buffer and the hardware handle,
//! [`video_frame::frame_pool::FramePool`] tracks the state of every output buffer, and
//! [`decoder::controller::VpuDecoder`] drives both from a single pipeline stage, optionally
//! delegating the blocking hardware waits to a worker thread.

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod utils;
pub mod video_frame;

use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Whether either dimension is unknown.
    pub fn is_unknown(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Rounds both dimensions up to the given alignments.
    pub fn align(&self, width_alignment: u32, height_alignment: u32) -> Self {
        Self {
            width: utils::align_up(self.width, width_alignment),
            height: utils::align_up(self.height, height_alignment),
        }
    }

    /// Returns the resolution with width and height swapped.
    pub fn transposed(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A rectangle inside a frame, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_resolution(resolution: Resolution) -> Self {
        Self {
            x: 0,
            y: 0,
            width: resolution.width,
            height: resolution.height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<Rect> for Resolution {
    fn from(value: Rect) -> Self {
        Self {
            width: value.width,
            height: value.height,
        }
    }
}

/// A four character code, stored little-endian like V4L2 and GStreamer do.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl From<&[u8; 4]> for Fourcc {
    fn from(value: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*value))
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(value: Fourcc) -> Self {
        value.0.to_le_bytes()
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes: [u8; 4] = (*self).into();
        for b in bytes {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({self})")
    }
}

/// A rational number, used for frame rates and pixel aspect ratios.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Returns the fraction reduced to its lowest terms.
    pub fn reduced(&self) -> Self {
        let g = utils::gcd(self.num, self.den);
        if g == 0 {
            return *self;
        }
        Self {
            num: self.num / g,
            den: self.den / g,
        }
    }

    /// Duration of one period of this rate, in nanoseconds. Returns `None` for invalid rates.
    pub fn period_ns(&self) -> Option<u64> {
        if !self.is_valid() {
            return None;
        }
        Some(1_000_000_000u64 * self.den as u64 / self.num as u64)
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Chroma layout of the frames handed downstream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    /// Semi-planar 4:2:0, chroma interleaved.
    NV12,
    /// Planar 4:2:0.
    I420,
}

impl DecodedFormat {
    pub fn fourcc(&self) -> Fourcc {
        match self {
            DecodedFormat::NV12 => Fourcc::from(b"NV12"),
            DecodedFormat::I420 => Fourcc::from(b"I420"),
        }
    }

    /// Whether chroma samples are interleaved in a single plane.
    pub fn is_interleaved(&self) -> bool {
        matches!(self, DecodedFormat::NV12)
    }

    /// The other interleave convention, tried when the consumer refuses this one.
    pub fn alternate(&self) -> Self {
        match self {
            DecodedFormat::NV12 => DecodedFormat::I420,
            DecodedFormat::I420 => DecodedFormat::NV12,
        }
    }
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}
