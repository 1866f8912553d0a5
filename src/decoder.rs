// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode/display pipeline driving a [`VpuEngine`](crate::backend::VpuEngine).
//!
//! [`controller::VpuDecoder`] is the entry point: it receives compressed input, stream events and
//! state changes from the pipeline, and pushes decoded frames to a [`FrameSink`]. The blocking
//! hardware interaction is isolated in [`session::DecodeSession`] and executed either in-line or on
//! a worker thread through the [`relay::DecodeExecutor`] abstraction.

pub mod controller;
pub mod qos;
pub mod relay;
pub mod session;
pub mod timestamp;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::CodecError;
use crate::decoder::session::SessionError;
use crate::video_frame::dma::DmaBuffer;
use crate::video_frame::frame_pool::DisplayBuffer;
use crate::video_frame::frame_pool::PoolError;
use crate::DecodedFormat;
use crate::Fourcc;
use crate::Fraction;
use crate::Rect;
use crate::Resolution;

/// Default size of the bitstream ring buffer.
pub const DEFAULT_BITSTREAM_BUFFER_SIZE: usize = 1024 * 1024;

/// Rotation applied by the post-processor, clockwise.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }

    /// Whether the output has its width and height swapped.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

impl FromStr for Rotation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" | "none" => Ok(Rotation::None),
            "90" => Ok(Rotation::Rotate90),
            "180" => Ok(Rotation::Rotate180),
            "270" => Ok(Rotation::Rotate270),
            _ => Err("unrecognized rotation. Valid values: 0, 90, 180, 270"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mirror {
    #[default]
    None,
    Vertical,
    Horizontal,
    Both,
}

impl FromStr for Mirror {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Mirror::None),
            "vertical" => Ok(Mirror::Vertical),
            "horizontal" => Ok(Mirror::Horizontal),
            "both" => Ok(Mirror::Both),
            _ => Err("unrecognized mirror mode. Valid values: none, vertical, horizontal, both"),
        }
    }
}

/// Settings of a [`controller::VpuDecoder`].
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Preferred output format. The other interleave convention is tried if the consumer refuses
    /// it.
    pub output_format: DecodedFormat,
    pub rotation: Rotation,
    pub mirror: Mirror,
    /// Drop frames when QoS events report the pipeline is late.
    pub framedrop: bool,
    /// Run the blocking hardware waits on a worker thread.
    pub parallelization: bool,
    /// Force file-play (`Some(true)`) or streaming (`Some(false)`) input delivery. By default
    /// file-play is used when the container reports the picture size.
    pub file_play: Option<bool>,
    /// MPEG-4 deblocking filter.
    pub deblocking: bool,
    /// Frame buffers allocated on top of the minimum required by the stream.
    pub extra_buffers: usize,
    pub bitstream_buffer_size: usize,
    /// Number of frames dropped while looking for a keyframe after a flush before giving up and
    /// displaying whatever comes.
    pub max_keyframe_search: u32,
    /// Log decode statistics when the stream stops.
    pub profiling: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            output_format: DecodedFormat::I420,
            rotation: Rotation::None,
            mirror: Mirror::None,
            framedrop: true,
            parallelization: false,
            file_play: None,
            deblocking: false,
            extra_buffers: 2,
            bitstream_buffer_size: DEFAULT_BITSTREAM_BUFFER_SIZE,
            max_keyframe_search: 30,
            profiling: false,
        }
    }
}

impl DecoderConfig {
    /// Whether decoded pictures go through the post-processor before display.
    pub fn uses_rotator(&self) -> bool {
        self.rotation != Rotation::None || self.mirror != Mirror::None
    }
}

/// Output format agreed with the consumer before the first frame is pushed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputCaps {
    pub format: DecodedFormat,
    /// Size of the output buffers, including alignment padding.
    pub coded_size: Resolution,
    /// Padding added to the right and bottom of the picture.
    pub padding: (u32, u32),
    /// Visible area of the picture.
    pub crop: Rect,
    pub pixel_aspect_ratio: Fraction,
    pub frame_rate: Option<Fraction>,
    /// Number of buffers the decoder will cycle through.
    pub num_buffers: usize,
    pub interlaced: bool,
}

impl OutputCaps {
    pub fn fourcc(&self) -> Fourcc {
        self.format.fourcc()
    }
}

/// Pixel data of a decoded frame.
pub enum FrameData {
    /// The hardware buffer itself, returned to the pool when dropped.
    Direct(DisplayBuffer),
    /// A copy of the picture. The hardware buffer has already been returned.
    Copied(Vec<u8>),
}

/// A frame pushed to the consumer.
pub struct DisplayFrame {
    pub data: FrameData,
    pub pts: Option<u64>,
    pub duration: Option<u64>,
    pub interlaced: bool,
    pub top_field_first: bool,
}

impl DisplayFrame {
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            FrameData::Direct(buffer) => buffer.as_bytes(),
            FrameData::Copied(data) => data,
        }
    }

    /// Device address of the frame, for directly rendered frames.
    pub fn phys_addr(&self) -> Option<u64> {
        match &self.data {
            FrameData::Direct(buffer) => Some(buffer.phys_addr()),
            FrameData::Copied(_) => None,
        }
    }

    /// Pool index of the frame, for directly rendered frames.
    pub fn index(&self) -> Option<usize> {
        match &self.data {
            FrameData::Direct(buffer) => Some(buffer.index()),
            FrameData::Copied(_) => None,
        }
    }
}

impl fmt::Debug for DisplayFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayFrame")
            .field("index", &self.index())
            .field("pts", &self.pts)
            .field("duration", &self.duration)
            .field("interlaced", &self.interlaced)
            .finish()
    }
}

/// One chunk of compressed input.
#[derive(Clone, Debug, Default)]
pub struct InputBuffer {
    pub data: Bytes,
    pub pts: Option<u64>,
    pub discont: bool,
}

impl InputBuffer {
    pub fn new<B: Into<Bytes>>(data: B, pts: Option<u64>) -> Self {
        Self {
            data: data.into(),
            pts,
            discont: false,
        }
    }
}

/// Out-of-band events received from the pipeline.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum StreamEvent {
    NewSegment { rate: f64, start: u64 },
    FlushStart,
    FlushStop,
    EndOfStream,
    /// The pipeline clock is `lateness_ns` behind. Negative values mean early.
    Qos { lateness_ns: i64 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("the consumer is flushing")]
    Flushing,
    #[error("the consumer has not accepted an output format")]
    NotNegotiated,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Downstream consumer of decoded frames.
pub trait FrameSink {
    /// Proposes an output format. Returns `false` if the consumer cannot handle it.
    fn negotiate(&mut self, caps: &OutputCaps) -> bool;

    /// Returns a consumer-owned device-addressable buffer of at least `size` bytes, if the
    /// consumer provides its own memory.
    fn alloc_dma_buffer(&mut self, _size: usize) -> Option<DmaBuffer> {
        None
    }

    /// Whether frames can be handed out as hardware buffers rather than copies.
    fn supports_direct_render(&self) -> bool {
        true
    }

    fn push(&mut self, frame: DisplayFrame) -> Result<(), SinkError>;

    /// Forwards a stream event downstream.
    fn forward_event(&mut self, _event: &StreamEvent) {}

    /// Reports a fatal error of the stream.
    fn post_error(&mut self, category: ErrorCategory, message: &str);
}

/// Kind of a fatal stream error, as reported to the pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    UnsupportedFormat,
    HardwareOpen,
    HardwareInit,
    BufferAllocation,
    FatalHardwareTimeout,
    NotNegotiated,
    Decode,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::UnsupportedFormat => "unsupported format",
            ErrorCategory::HardwareOpen => "hardware open error",
            ErrorCategory::HardwareInit => "hardware initialization error",
            ErrorCategory::BufferAllocation => "buffer allocation error",
            ErrorCategory::FatalHardwareTimeout => "hardware timeout",
            ErrorCategory::NotNegotiated => "not negotiated",
            ErrorCategory::Decode => "decode error",
            ErrorCategory::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no input format has been set")]
    NoFormat,
    #[error("unsupported stream: {0}")]
    UnsupportedFormat(String),
    #[error("failed to allocate the frame buffer pool: {0}")]
    BufferAllocation(#[source] PoolError),
    #[error("the consumer refused every output format")]
    NotNegotiated,
    #[error("the decoder is flushing")]
    Flushing,
    #[error("the stream was halted after a fatal error")]
    Halted,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to push frame downstream: {0}")]
    Downstream(#[from] SinkError),
}

impl DecodeError {
    /// Whether the error ends the stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DecodeError::Flushing | DecodeError::Halted | DecodeError::Downstream(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DecodeError::UnsupportedFormat(_) | DecodeError::Codec(_) => {
                ErrorCategory::UnsupportedFormat
            }
            DecodeError::BufferAllocation(_) => ErrorCategory::BufferAllocation,
            DecodeError::NotNegotiated => ErrorCategory::NotNegotiated,
            DecodeError::Session(e) => e.category(),
            DecodeError::NoFormat
            | DecodeError::Flushing
            | DecodeError::Halted
            | DecodeError::Downstream(_) => ErrorCategory::Internal,
        }
    }
}

/// Counters collected while decoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub decoded: u64,
    pub rendered: u64,
    /// Frames dropped because of QoS or while looking for a keyframe.
    pub dropped: u64,
    /// Time spent waiting for the hardware.
    pub decode_time: Duration,
    pub recoveries: u32,
}

impl DecoderStats {
    /// Average decode rate in frames per second.
    pub fn decode_fps(&self) -> Option<f64> {
        let secs = self.decode_time.as_secs_f64();
        (secs > 0.0).then(|| self.decoded as f64 / secs)
    }
}
