// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the hardware decode engine.
//!
//! The engine is an opaque unit programmed through a handful of calls: open a decode instance on
//! a bitstream ring buffer, query the stream geometry once enough data has been written, register
//! the output frame buffers, then repeatedly start the decoding of one frame and collect its
//! output once the completion interrupt fired. [`VpuEngine`] captures exactly that surface so the
//! rest of the crate never depends on a particular driver.

#[cfg(any(test, feature = "dummy"))]
pub mod dummy;

use std::fmt;
use std::time::Duration;

use enumn::N;
use thiserror::Error;

use crate::decoder::Mirror;
use crate::decoder::Rotation;
use crate::video_frame::ChromaFormat;
use crate::Fraction;
use crate::Rect;
use crate::Resolution;

/// Error returned by engine calls.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("the engine is busy decoding")]
    Busy,
    #[error("not enough bitstream data to proceed")]
    NotEnoughData,
    #[error("invalid engine handle")]
    InvalidHandle,
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("engine call failed with code {0}")]
    Failure(i32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Bitstream standards understood by the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CodecStd {
    Mpeg4 = 0,
    H263 = 1,
    Avc = 2,
    Vc1 = 3,
    Mpeg2 = 4,
    DivX3 = 5,
    Rv = 6,
    Mjpeg = 7,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineVersion {
    pub firmware: (u8, u8, u16),
    pub library: String,
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, release) = self.firmware;
        write!(f, "firmware {major}.{minor}.{release}, library {}", self.library)
    }
}

/// Parameters of a decode instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenParams {
    pub std: CodecStd,
    /// Device address and size of the bitstream ring buffer.
    pub bitstream_addr: u64,
    pub bitstream_size: usize,
    /// AVC only: parameter set save area.
    pub ps_save_addr: Option<u64>,
    pub ps_save_size: usize,
    /// Each start command carries exactly one access unit instead of reading from a ring.
    pub file_play: bool,
    /// Output pictures in display order rather than decode order.
    pub reorder: bool,
    pub chroma_interleave: bool,
    pub mp4_deblock: bool,
    /// MPEG-4 flavour: 0 for MPEG-4, 1 for DivX 5 and up, 2 for older DivX 4.
    pub mp4_class: u32,
}

/// Stream properties reported by the engine once the sequence header has been parsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitialInfo {
    pub pic_size: Resolution,
    pub frame_rate: Option<Fraction>,
    pub min_frame_count: usize,
    /// Visible area as signalled in the bitstream, if any.
    pub crop: Option<Rect>,
    pub interlaced: bool,
    /// Codec-specific aspect ratio code.
    pub aspect_code: u32,
    pub chroma: ChromaFormat,
    pub profile: u32,
    pub level: u32,
}

/// Device addresses of one registered frame buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameBufferDesc {
    pub index: usize,
    pub y_addr: u64,
    pub cb_addr: u64,
    pub cr_addr: u64,
    pub mv_addr: u64,
}

/// Fill state of the bitstream ring buffer, offsets relative to its base.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BitstreamStatus {
    pub read_offset: usize,
    pub write_offset: usize,
    pub free: usize,
}

/// Pictures the engine should skip without decoding.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum SkipFrames {
    #[default]
    None = 0,
    B = 1,
    BAndP = 2,
}

/// Post-processing applied while the picture is written out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RotatorParams {
    pub output: FrameBufferDesc,
    pub stride: usize,
    pub rotation: Rotation,
    pub mirror: Mirror,
}

/// Parameters of a single start command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecParams {
    pub skip: SkipFrames,
    /// Discard everything until the next intra picture.
    pub iframe_search: bool,
    /// File-play mode only: size of the access unit placed at the start of the ring buffer.
    pub chunk_size: Option<usize>,
    /// Check that a whole picture is available before decoding it.
    pub prescan: bool,
    pub rotator: Option<RotatorParams>,
}

/// Frame buffer written by the last decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodedIndex {
    Frame(usize),
    /// Nothing was decoded, typically because no frame buffer was available.
    NoFrameBuffer,
    /// The picture was skipped as requested by [`DecParams::skip`].
    Skipped,
    /// The call only flushed pictures out of the reorder queue.
    None,
}

/// Frame buffer that became displayable after the last decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayIndex {
    Frame(usize),
    /// No picture is ready for display yet.
    None,
    /// The picture to display was skipped.
    Skipped,
    /// All pictures of the stream have been output.
    EndOfSequence,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    Success,
    /// The ring buffer ran dry before a picture could be started.
    NeedMoreData,
    /// Only part of a picture was present.
    FrameNotComplete,
    Error(i32),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum PicType {
    #[default]
    I = 0,
    P = 1,
    B = 2,
    Idr = 3,
    Bi = 4,
    Skip = 5,
}

impl PicType {
    pub fn is_intra(&self) -> bool {
        matches!(self, PicType::I | PicType::Idr)
    }
}

/// Result of a finished decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputInfo {
    pub status: DecodeStatus,
    pub decoded: DecodedIndex,
    pub display: DisplayIndex,
    pub pic_type: PicType,
    pub interlaced: bool,
    pub top_field_first: bool,
    /// MPEG-4 packed bitstream: the unit held a P and a B picture, the second of which is output
    /// by a follow-up start command that needs no new data.
    pub packed_pb: bool,
    pub consumed_bytes: usize,
    pub error_macroblocks: u32,
    pub crop: Option<Rect>,
}

impl Default for OutputInfo {
    fn default() -> Self {
        Self {
            status: DecodeStatus::Success,
            decoded: DecodedIndex::None,
            display: DisplayIndex::None,
            pic_type: PicType::I,
            interlaced: false,
            top_field_first: false,
            packed_pb: false,
            consumed_bytes: 0,
            error_macroblocks: 0,
            crop: None,
        }
    }
}

/// A hardware decode engine.
///
/// Implementations are driven from one thread at a time, but that thread may change between calls
/// when decoding is delegated to a worker.
pub trait VpuEngine: Send {
    /// Brings up the unit (firmware load, clocks). Called once before any instance is opened.
    fn init(&mut self) -> EngineResult<()>;

    /// Releases the unit. No instance may be open.
    fn uninit(&mut self);

    fn version(&self) -> EngineResult<EngineVersion>;

    fn open(&mut self, params: &OpenParams) -> EngineResult<()>;

    /// Closes the instance. Fails with [`EngineError::Busy`] while a decode is running.
    fn close(&mut self) -> EngineResult<()>;

    /// Parses the sequence header present in the ring buffer.
    fn initial_info(&mut self) -> EngineResult<InitialInfo>;

    /// Hands the decode targets to the engine. May only be called once per instance, after
    /// [`VpuEngine::initial_info`] succeeded.
    fn register_frame_buffers(&mut self, frames: &[FrameBufferDesc], stride: usize)
        -> EngineResult<()>;

    fn bitstream_status(&mut self) -> EngineResult<BitstreamStatus>;

    /// Notifies the engine that `size` bytes were written at the write offset. A size of zero
    /// signals the end of the stream.
    fn update_bitstream(&mut self, size: usize) -> EngineResult<()>;

    /// Discards all unconsumed bitstream and rewinds both offsets to the base of the ring.
    fn flush_bitstream(&mut self) -> EngineResult<()>;

    /// Starts decoding one picture. Only one decode may be running at a time.
    fn start_one_frame(&mut self, params: &DecParams) -> EngineResult<()>;

    fn is_busy(&mut self) -> bool;

    /// Blocks until the completion interrupt fires or `timeout` elapses. Returns whether the
    /// interrupt fired.
    fn wait_for_interrupt(&mut self, timeout: Duration) -> bool;

    /// Collects the result of the last decode. Fails with [`EngineError::Busy`] if it is still
    /// running.
    fn output_info(&mut self) -> EngineResult<OutputInfo>;

    /// Gives frame buffer `index` back to the engine after it has been displayed.
    fn clear_display_flag(&mut self, index: usize) -> EngineResult<()>;
}
