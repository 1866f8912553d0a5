// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware decode session: everything that talks to the engine.
//!
//! The session owns the engine, the bitstream ring buffer and a handle to the frame pool. Its
//! methods map one to one to the steps of the decode loop: feeding input, initializing the stream,
//! starting a decode and waiting for its result. Recovery (`reset`) and teardown (`close`) are
//! written to make progress whatever state the engine is left in.

use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use bytes::Bytes;
use log::debug;
use log::error;
use log::trace;
use log::warn;
use thiserror::Error;

use crate::backend::CodecStd;
use crate::backend::DecParams;
use crate::backend::EngineError;
use crate::backend::EngineVersion;
use crate::backend::InitialInfo;
use crate::backend::OpenParams;
use crate::backend::OutputInfo;
use crate::backend::VpuEngine;
use crate::codec::mjpeg::MjpegProfile;
use crate::decoder::ErrorCategory;
use crate::video_frame::dma::DmaAllocator;
use crate::video_frame::dma::DmaBuffer;
use crate::video_frame::dma::DmaError;
use crate::video_frame::frame_pool::FramePool;
use crate::video_frame::frame_pool::PoolError;
use crate::video_frame::ChromaFormat;
use crate::Resolution;

/// Duration of one interrupt wait, about one frame period.
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(33);
/// Consecutive interrupt timeouts after which a decode is declared stuck.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 100;
/// Consecutive interrupt timeouts after which a streaming decode gives control back to get more
/// input.
pub const YIELD_AFTER_TIMEOUTS: u32 = 1;

/// Size of the AVC parameter set save area.
const PS_SAVE_SIZE: usize = 512 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("failed to allocate the bitstream buffer: {0}")]
    Dma(#[from] DmaError),
    #[error("the engine refused to open the stream: {0}")]
    HardwareOpen(#[source] EngineError),
    #[error("the engine failed to initialize the stream after {attempts} attempts: {source}")]
    HardwareInit {
        attempts: u32,
        #[source]
        source: EngineError,
    },
    #[error("unsupported stream: {0}")]
    UnsupportedFormat(String),
    #[error("hardware decode timed out {0} times in a row")]
    FatalTimeout(u32),
    #[error("hardware decode failed with status {0}")]
    DecodeFailed(i32),
    #[error("access unit of {size} bytes does not fit in the {capacity} bytes bitstream buffer")]
    UnitTooLarge { size: usize, capacity: usize },
    #[error("the session is not open")]
    NotOpen,
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
    #[error("decode relay failure: {0}")]
    Relay(String),
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Pool(PoolError::Allocation { .. }) | SessionError::Dma(_) => {
                ErrorCategory::BufferAllocation
            }
            SessionError::HardwareOpen(_) => ErrorCategory::HardwareOpen,
            SessionError::HardwareInit { .. } => ErrorCategory::HardwareInit,
            SessionError::UnsupportedFormat(_) => ErrorCategory::UnsupportedFormat,
            SessionError::FatalTimeout(_) => ErrorCategory::FatalHardwareTimeout,
            SessionError::Engine(_)
            | SessionError::DecodeFailed(_)
            | SessionError::UnitTooLarge { .. } => ErrorCategory::Decode,
            SessionError::Pool(_)
            | SessionError::NotOpen
            | SessionError::InvalidState(_)
            | SessionError::Relay(_) => ErrorCategory::Internal,
        }
    }
}

/// Stream parameters of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub std: CodecStd,
    /// Every input chunk is one complete access unit.
    pub file_play: bool,
    pub bitstream_buffer_size: usize,
    pub chroma_interleave: bool,
    pub reorder: bool,
    pub mp4_deblock: bool,
    pub mp4_class: u32,
    /// Initialization failures tolerated before giving up.
    pub init_retries: u32,
    /// Smallest picture the engine can decode for this codec.
    pub min_resolution: Resolution,
}

/// Result of [`DecodeSession::initialize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitStatus {
    /// The sequence header has not been fully received yet.
    NeedMoreData,
    Ready(InitialInfo),
}

/// Result of [`DecodeSession::copy_input`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CopyOutcome {
    /// This many bytes were written to the ring buffer.
    Copied(usize),
    /// The ring buffer was full before the stream was initialized. It has been emptied.
    RingFlushed,
    /// The ring buffer was full with an initialized stream, meaning the engine is wedged. The
    /// session has been reset.
    SessionReset,
}

/// Result of collecting the output of a decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Output(OutputInfo),
    /// The decode is still running. It must be collected later.
    Yield,
}

pub struct DecodeSession<E: VpuEngine> {
    engine: E,
    allocator: Arc<dyn DmaAllocator>,
    config: Option<SessionConfig>,
    ring: Option<DmaBuffer>,
    ps_save: Option<DmaBuffer>,
    pool: Option<FramePool>,
    info: Option<InitialInfo>,
    open: bool,
    initialized: bool,
    /// Size of the access unit waiting in the ring buffer, in file-play mode.
    chunk: Option<usize>,
    decoding: bool,
    eos: bool,
    timeouts: u32,
    init_failures: u32,
}

impl<E: VpuEngine> DecodeSession<E> {
    pub fn new(engine: E, allocator: Arc<dyn DmaAllocator>) -> Self {
        Self {
            engine,
            allocator,
            config: None,
            ring: None,
            ps_save: None,
            pool: None,
            info: None,
            open: false,
            initialized: false,
            chunk: None,
            decoding: false,
            eos: false,
            timeouts: 0,
            init_failures: 0,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether a decode has been started and its output not collected yet.
    pub fn is_decoding(&self) -> bool {
        self.decoding
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn has_chunk(&self) -> bool {
        self.chunk.is_some()
    }

    pub fn info(&self) -> Option<&InitialInfo> {
        self.info.as_ref()
    }

    pub fn pool(&self) -> Option<&FramePool> {
        self.pool.as_ref()
    }

    fn is_file_play(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.file_play)
    }

    /// Brings up the engine and returns its version.
    pub fn init_system(&mut self) -> Result<EngineVersion, SessionError> {
        self.engine.init()?;
        let version = self.engine.version()?;
        debug!("VPU initialized: {version}");
        Ok(version)
    }

    pub fn uninit_system(&mut self) {
        self.engine.uninit();
        debug!("VPU released");
    }

    /// Allocates the bitstream buffers and opens a decode instance with `config`.
    pub fn open(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        if self.open {
            return Err(SessionError::InvalidState("session already open"));
        }
        if self
            .config
            .as_ref()
            .is_some_and(|c| c.bitstream_buffer_size != config.bitstream_buffer_size)
        {
            self.ring = None;
        }
        self.config = Some(config);
        self.open_engine()
    }

    fn open_engine(&mut self) -> Result<(), SessionError> {
        let config = self.config.clone().ok_or(SessionError::NotOpen)?;

        if self.ring.is_none() {
            self.ring = Some(self.allocator.allocate(config.bitstream_buffer_size)?);
        }
        if config.std == CodecStd::Avc && self.ps_save.is_none() {
            self.ps_save = Some(self.allocator.allocate(PS_SAVE_SIZE)?);
        }
        let ring = self.ring.as_ref().ok_or(SessionError::NotOpen)?;

        let params = OpenParams {
            std: config.std,
            bitstream_addr: ring.phys_addr(),
            bitstream_size: ring.size(),
            ps_save_addr: self.ps_save.as_ref().map(|b| b.phys_addr()),
            ps_save_size: self.ps_save.as_ref().map_or(0, |b| b.size()),
            file_play: config.file_play,
            reorder: config.reorder,
            chroma_interleave: config.chroma_interleave,
            mp4_deblock: config.mp4_deblock,
            mp4_class: config.mp4_class,
        };
        self.engine
            .open(&params)
            .map_err(SessionError::HardwareOpen)?;

        self.open = true;
        self.initialized = false;
        self.chunk = None;
        self.decoding = false;
        self.eos = false;
        self.timeouts = 0;
        debug!(
            "opened {:?} decode instance, {} bytes bitstream buffer, {}",
            config.std,
            ring.size(),
            if config.file_play {
                "file-play"
            } else {
                "streaming"
            }
        );
        Ok(())
    }

    /// Number of bytes written to the ring buffer and not consumed by the engine yet.
    pub fn data_in_vpu(&mut self) -> Result<usize, SessionError> {
        if !self.open {
            return Ok(0);
        }
        let capacity = self.ring.as_ref().map_or(0, |r| r.size());
        let status = self.engine.bitstream_status()?;
        Ok(capacity.saturating_sub(status.free))
    }

    /// Number of bytes that can be written to the ring buffer right now.
    pub fn free_space(&mut self) -> Result<usize, SessionError> {
        if !self.open {
            return Ok(0);
        }
        Ok(self.engine.bitstream_status()?.free)
    }

    /// Moves input into the ring buffer.
    ///
    /// In file-play mode `data` is one access unit, written at the start of the ring buffer and
    /// decoded by the next [`DecodeSession::begin_decode`]. In streaming mode the ring buffer is
    /// circular and as much of `data` as fits is written; the caller keeps the rest.
    pub fn copy_input(&mut self, data: &[u8]) -> Result<CopyOutcome, SessionError> {
        if !self.open {
            return Err(SessionError::NotOpen);
        }
        if data.is_empty() {
            return Ok(CopyOutcome::Copied(0));
        }

        if self.is_file_play() {
            if self.decoding {
                return Err(SessionError::InvalidState(
                    "cannot replace the access unit of a running decode",
                ));
            }
            let ring = self.ring.as_mut().ok_or(SessionError::NotOpen)?;
            if data.len() > ring.size() {
                return Err(SessionError::UnitTooLarge {
                    size: data.len(),
                    capacity: ring.size(),
                });
            }
            ring.as_mut_slice()[..data.len()].copy_from_slice(data);
            self.engine.update_bitstream(data.len())?;
            self.chunk = Some(data.len());
            trace!("copied {} bytes access unit", data.len());
            return Ok(CopyOutcome::Copied(data.len()));
        }

        let copied = self.copy_streaming(data)?;
        if copied > 0 {
            return Ok(CopyOutcome::Copied(copied));
        }

        if self.initialized {
            warn!("bitstream buffer full on an initialized stream, resetting the session");
            self.reset()?;
            Ok(CopyOutcome::SessionReset)
        } else {
            warn!("bitstream buffer full before initialization, flushing it");
            self.flush_ring()?;
            Ok(CopyOutcome::RingFlushed)
        }
    }

    /// Writes as much of `data` as fits at the write offset of the ring buffer, wrapping around
    /// its end. Returns the number of bytes written.
    fn copy_streaming(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        let status = self.engine.bitstream_status()?;
        let len = status.free.min(data.len());
        if len == 0 {
            return Ok(0);
        }

        let ring = self.ring.as_mut().ok_or(SessionError::NotOpen)?;
        let capacity = ring.size();
        let write = status.write_offset % capacity;
        let first = len.min(capacity - write);

        let memory = ring.as_mut_slice();
        memory[write..write + first].copy_from_slice(&data[..first]);
        if first < len {
            memory[..len - first].copy_from_slice(&data[first..len]);
        }

        self.engine.update_bitstream(len)?;
        trace!(
            "copied {} bytes at offset {}{}",
            len,
            write,
            if first < len { " (wrapped)" } else { "" }
        );
        Ok(len)
    }

    /// Tells the engine no more input will come.
    pub fn signal_eos(&mut self) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::NotOpen);
        }
        if !self.eos {
            self.engine.update_bitstream(0)?;
            self.eos = true;
            debug!("end of stream signalled to the engine");
        }
        Ok(())
    }

    /// Discards all the data of the ring buffer.
    pub fn flush_ring(&mut self) -> Result<(), SessionError> {
        if let Some(ring) = self.ring.as_mut() {
            ring.as_mut_slice().fill(0);
        }
        self.chunk = None;
        self.eos = false;
        if self.open {
            self.engine.flush_bitstream()?;
        }
        Ok(())
    }

    /// Queries the stream geometry from the data written so far.
    ///
    /// Failures are retried, with the instance closed in between, up to the number of retries of
    /// the session configuration. Once the stream is initialized, the frame pool is registered with
    /// the engine if one is already attached.
    pub fn initialize(&mut self) -> Result<InitStatus, SessionError> {
        if !self.open {
            return Err(SessionError::NotOpen);
        }
        if self.initialized {
            if let Some(info) = &self.info {
                return Ok(InitStatus::Ready(info.clone()));
            }
        }
        let config = self.config.clone().ok_or(SessionError::NotOpen)?;

        let info = match self.engine.initial_info() {
            Ok(info) => info,
            Err(EngineError::NotEnoughData) => return Ok(InitStatus::NeedMoreData),
            Err(e) => {
                self.init_failures += 1;
                if let Err(close_err) = self.close_engine() {
                    warn!("failed to close the engine after an initialization error: {close_err}");
                }
                if self.init_failures <= config.init_retries {
                    warn!(
                        "stream initialization failed ({}), attempt {} of {}",
                        e,
                        self.init_failures,
                        config.init_retries + 1
                    );
                    return Ok(InitStatus::NeedMoreData);
                }
                return Err(SessionError::HardwareInit {
                    attempts: self.init_failures,
                    source: e,
                });
            }
        };

        if let Err(e) = Self::check_stream(&config, &info) {
            if let Err(close_err) = self.close_engine() {
                warn!("failed to close the engine: {close_err}");
            }
            return Err(e);
        }

        debug!(
            "stream initialized: {} {:?}, {} frame buffers minimum, interlaced {}",
            info.pic_size, info.chroma, info.min_frame_count, info.interlaced
        );
        self.initialized = true;
        self.init_failures = 0;
        self.info = Some(info.clone());

        if let Some(pool) = &self.pool {
            pool.register_with_hardware(&mut self.engine)?;
        }

        Ok(InitStatus::Ready(info))
    }

    fn check_stream(config: &SessionConfig, info: &InitialInfo) -> Result<(), SessionError> {
        if info.pic_size.is_unknown() || !info.pic_size.can_contain(config.min_resolution) {
            return Err(SessionError::UnsupportedFormat(format!(
                "picture size {} below the {} minimum",
                info.pic_size, config.min_resolution
            )));
        }

        let chroma_supported = match config.std {
            CodecStd::Mjpeg => MjpegProfile::supports_chroma(info.chroma),
            _ => info.chroma == ChromaFormat::Yuv420,
        };
        if !chroma_supported {
            return Err(SessionError::UnsupportedFormat(format!(
                "{:?} chroma layout cannot be decoded for {:?}",
                info.chroma, config.std
            )));
        }

        Ok(())
    }

    /// Attaches `pool` to the session and registers it with the engine.
    pub fn attach_pool(&mut self, pool: FramePool) -> Result<(), SessionError> {
        if !self.initialized {
            return Err(SessionError::InvalidState(
                "frame buffers registered before initialization",
            ));
        }
        pool.register_with_hardware(&mut self.engine)?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Detaches the frame pool, e.g. to retire it.
    pub fn take_pool(&mut self) -> Option<FramePool> {
        self.pool.take()
    }

    /// Gives the buffers released by the consumer back to the engine.
    pub fn release_pending(&mut self) -> Result<usize, SessionError> {
        match &self.pool {
            Some(pool) if pool.is_registered() => Ok(pool.release_pending(&mut self.engine)?),
            _ => Ok(0),
        }
    }

    /// Gives a decoded picture that will not be displayed back to the engine.
    pub fn release_frame(&mut self, index: usize) -> Result<(), SessionError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or(SessionError::InvalidState("no frame pool"))?;
        Ok(pool.release(index, &mut self.engine)?)
    }

    /// Settles the frame pool after a flush.
    pub fn flush_frames(&mut self) -> Result<(), SessionError> {
        match &self.pool {
            Some(pool) if pool.is_registered() => Ok(pool.flush_states(&mut self.engine)?),
            _ => Ok(()),
        }
    }

    /// Starts decoding one picture. Buffers released by the consumer are handed back to the engine
    /// first.
    pub fn begin_decode(&mut self, mut params: DecParams) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::NotOpen);
        }
        if self.decoding {
            return Err(SessionError::InvalidState("a decode is already in flight"));
        }
        if !self.initialized || !self.pool.as_ref().is_some_and(|p| p.is_registered()) {
            return Err(SessionError::InvalidState("stream not initialized"));
        }

        self.release_pending()?;

        if self.is_file_play() {
            params.chunk_size = Some(self.chunk.take().unwrap_or(0));
        } else {
            params.prescan = true;
        }

        self.engine.start_one_frame(&params)?;
        self.decoding = true;
        self.timeouts = 0;
        trace!("decode started: {params:?}");
        Ok(())
    }

    /// Waits for the running decode and returns its output.
    ///
    /// While the engine is busy, bytes of `pending` are moved into the ring buffer in streaming
    /// mode, and `pending` is advanced accordingly. A streaming decode that keeps timing out while
    /// there is no more input to give it yields, so the caller can come back with more data.
    pub fn wait_and_get_output(&mut self, pending: &mut Bytes) -> Result<WaitOutcome, SessionError> {
        self.collect(pending, true)
    }

    /// Returns the output of the running decode if it already completed.
    pub fn poll_output(&mut self, pending: &mut Bytes) -> Result<WaitOutcome, SessionError> {
        self.collect(pending, false)
    }

    fn collect(&mut self, pending: &mut Bytes, blocking: bool) -> Result<WaitOutcome, SessionError> {
        if !self.decoding {
            return Err(SessionError::InvalidState("no decode in flight"));
        }
        let streaming = !self.is_file_play();

        loop {
            let timeout = if blocking { WAIT_TIMEOUT } else { Duration::ZERO };
            if self.engine.wait_for_interrupt(timeout) || !self.engine.is_busy() {
                break;
            }

            if streaming && !pending.is_empty() {
                let copied = self.copy_streaming(pending)?;
                pending.advance(copied);
            }
            if !blocking {
                return Ok(WaitOutcome::Yield);
            }

            self.timeouts += 1;
            if self.timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                let timeouts = self.timeouts;
                error!("hardware decode stuck after {timeouts} timeouts, closing the engine");
                if let Err(e) = self.close_engine() {
                    error!("failed to close the stuck engine: {e}");
                }
                return Err(SessionError::FatalTimeout(timeouts));
            }
            if streaming && self.timeouts > YIELD_AFTER_TIMEOUTS && pending.is_empty() && !self.eos
            {
                trace!("decode still busy after {} timeouts, yielding", self.timeouts);
                return Ok(WaitOutcome::Yield);
            }
        }

        self.decoding = false;
        self.timeouts = 0;
        let info = self.engine.output_info()?;
        trace!("decode output: {info:?}");
        Ok(WaitOutcome::Output(info))
    }

    /// Waits for the running decode, if any, and discards its output.
    pub fn drain(&mut self) -> Option<OutputInfo> {
        if !self.decoding {
            return None;
        }
        for _ in 0..MAX_CONSECUTIVE_TIMEOUTS {
            if self.engine.wait_for_interrupt(WAIT_TIMEOUT) || !self.engine.is_busy() {
                self.decoding = false;
                self.timeouts = 0;
                return self.engine.output_info().ok();
            }
        }
        warn!("running decode did not complete while draining");
        None
    }

    /// Closes and reopens the engine instance, keeping the frame buffers.
    ///
    /// Any running decode is drained and the ring buffer is emptied. The frame buffers must be
    /// registered again, which happens when the stream is initialized anew.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        debug!("resetting decode session");
        if let Some(info) = self.drain() {
            debug!("discarded output of the drained decode: {info:?}");
        }
        if let Err(e) = self.flush_ring() {
            warn!("failed to flush the bitstream buffer during reset: {e}");
        }
        self.close_engine()?;
        self.open_engine()
    }

    /// Closes the instance, tolerating a running decode: the decode is drained once, then the
    /// close is retried, and as a last resort the ring buffer is emptied before trying again.
    fn close_engine(&mut self) -> Result<(), SessionError> {
        if !self.open {
            return Ok(());
        }

        if self.decoding && self.engine.wait_for_interrupt(WAIT_TIMEOUT) {
            match self.engine.output_info() {
                Ok(info) => debug!("discarded output of the decode in flight: {info:?}"),
                Err(e) => debug!("no output for the decode in flight: {e}"),
            }
            self.decoding = false;
        }

        let mut result = self.engine.close();
        if matches!(result, Err(EngineError::Busy)) {
            debug!("engine busy on close, retrying");
            result = self.engine.close();
        }
        if matches!(result, Err(EngineError::Busy)) {
            warn!("engine still busy on close, emptying the bitstream buffer");
            if let Some(ring) = self.ring.as_mut() {
                ring.as_mut_slice().fill(0);
            }
            if let Err(e) = self.engine.flush_bitstream() {
                warn!("failed to flush the bitstream buffer before closing: {e}");
            }
            result = self.engine.close();
        }

        self.open = false;
        self.initialized = false;
        self.decoding = false;
        self.chunk = None;
        self.eos = false;
        self.timeouts = 0;
        if let Some(pool) = &self.pool {
            pool.unregister();
        }

        match result {
            Ok(()) => {
                debug!("decode instance closed");
                Ok(())
            }
            Err(e) => {
                error!("failed to close the decode instance: {e}");
                Err(e.into())
            }
        }
    }

    /// Closes the instance and releases the bitstream buffers. The frame pool stays attached.
    pub fn close(&mut self) -> Result<(), SessionError> {
        let result = self.close_engine();
        self.init_failures = 0;
        self.ring = None;
        self.ps_save = None;
        self.info = None;
        result
    }

    #[cfg(test)]
    fn ring_contents(&self) -> &[u8] {
        self.ring.as_ref().map_or(&[], |r| r.as_slice())
    }
}
