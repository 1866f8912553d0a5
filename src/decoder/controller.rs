// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode/display pipeline stage.
//!
//! [`VpuDecoder`] receives compressed input through [`VpuDecoder::chain`], out-of-band events
//! through [`VpuDecoder::handle_event`] and pipeline state changes through
//! [`VpuDecoder::change_state`]. For every chunk of input it opens and initializes the hardware
//! session if needed, negotiates the output format with the [`FrameSink`], then loops starting
//! decodes and routing their output until the engine needs more data.
//!
//! The blocking part of every decode runs through a [`DecodeExecutor`], either in-line or on the
//! relay worker thread. The decoder never holds the session lock while the executor runs nor
//! while a frame is pushed downstream.
//!
//! Input is delivered to the engine in one of two ways:
//!
//! * file-play: every chunk is one complete access unit, placed at the start of the ring buffer
//!   and decoded on its own. Used when a parser frames the input.
//! * streaming: the ring buffer is filled as a circular byte stream and the engine finds the
//!   picture boundaries itself.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;

use crate::backend::DecParams;
use crate::backend::DecodeStatus;
use crate::backend::DecodedIndex;
use crate::backend::DisplayIndex;
use crate::backend::InitialInfo;
use crate::backend::OutputInfo;
use crate::backend::PicType;
use crate::backend::RotatorParams;
use crate::backend::VpuEngine;
use crate::codec::profile_for;
use crate::codec::CodecError;
use crate::codec::CodecProfile;
use crate::codec::StreamFormat;
use crate::decoder::qos::QosController;
use crate::decoder::qos::SkipMode;
use crate::decoder::relay::Command;
use crate::decoder::relay::CommandOutput;
use crate::decoder::relay::DecodeExecutor;
use crate::decoder::relay::InlineExecutor;
use crate::decoder::relay::SharedSession;
use crate::decoder::relay::ThreadedRelay;
use crate::decoder::session::CopyOutcome;
use crate::decoder::session::DecodeSession;
use crate::decoder::session::InitStatus;
use crate::decoder::session::SessionConfig;
use crate::decoder::session::SessionError;
use crate::decoder::timestamp::TimestampManager;
use crate::decoder::timestamp::TimestampMode;
use crate::decoder::DecodeError;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderStats;
use crate::decoder::DisplayFrame;
use crate::decoder::FrameData;
use crate::decoder::FrameSink;
use crate::decoder::InputBuffer;
use crate::decoder::OutputCaps;
use crate::decoder::SinkError;
use crate::decoder::StateChange;
use crate::decoder::StreamEvent;
use crate::utils::lock;
use crate::video_frame::dma::DmaAllocator;
use crate::video_frame::frame_pool::FramePool;
use crate::video_frame::frame_pool::PoolRequest;
use crate::video_frame::ChromaFormat;
use crate::video_frame::FrameLayout;
use crate::DecodedFormat;
use crate::Fraction;
use crate::Rect;

/// Post-processing output slots, on top of the decode slots.
const POST_PROCESS_SLOTS: usize = 4;
/// Consecutive decodes reporting an error before the stream is given up on.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 5;
/// Consecutive decodes producing nothing after which the loop waits for new input.
const MAX_IDLE_OUTPUTS: u32 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Closed,
    Opening,
    /// Waiting for enough data to learn the stream geometry.
    Initializing,
    Ready,
    Decoding,
    Rendering,
    Flushing,
}

/// Lets another thread interrupt the decode loop the way a flush-start event does.
#[derive(Clone, Debug, Default)]
pub struct FlushHandle(Arc<AtomicBool>);

impl FlushHandle {
    pub fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_flushing(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What the decode loop does after handling one output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Step {
    Continue,
    /// Start one more decode even without new input.
    FollowUp,
    Stop,
}

fn concat(parts: &[Bytes]) -> Bytes {
    let mut out = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
    for part in parts {
        out.extend_from_slice(part);
    }
    out.freeze()
}

fn same_geometry(a: &InitialInfo, b: &InitialInfo) -> bool {
    a.pic_size == b.pic_size
        && a.min_frame_count == b.min_frame_count
        && a.interlaced == b.interlaced
        && a.chroma == b.chroma
}

fn transpose(rect: Rect) -> Rect {
    Rect {
        x: rect.y,
        y: rect.x,
        width: rect.height,
        height: rect.width,
    }
}

pub struct VpuDecoder<E: VpuEngine + 'static, S: FrameSink> {
    config: DecoderConfig,
    sink: S,
    allocator: Arc<dyn DmaAllocator>,
    session: SharedSession<E>,
    executor: Box<dyn DecodeExecutor>,
    state: ControllerState,

    format: Option<StreamFormat>,
    profile: Option<Box<dyn CodecProfile>>,
    file_play: bool,
    output_format: DecodedFormat,
    frame_duration: Option<u64>,

    /// Geometry the current pool was allocated for.
    stream_info: Option<InitialInfo>,
    caps: Option<OutputCaps>,
    pool: Option<FramePool>,

    timestamps: TimestampManager,
    qos: QosController,
    flush: FlushHandle,
    /// A flush-start has not been followed by its flush-stop yet.
    flush_pending: bool,
    /// Input or end of stream was processed since the last flush.
    dirty: bool,
    draining: bool,
    halted: bool,

    /// Streaming input not yet moved to the ring buffer.
    pending: Bytes,
    /// File-play timestamp of the access unit waiting in the ring buffer.
    chunk_pts: Option<u64>,
    /// The running file-play decode consumes an access unit whose timestamp is queued.
    unit_in_flight: bool,
    /// The next unit is the first of the session and needs realignment and headers.
    first_frame: bool,
    /// Input written since the instance was opened and before it was initialized, replayed when
    /// the instance has to be opened again.
    init_units: Vec<Bytes>,
    /// Frames dropped so far while waiting for a keyframe after a flush.
    keyframe_search: Option<u32>,
    rotator_target: Option<usize>,
    frame_counter: u64,
    decode_errors: u32,
    idle_outputs: u32,
    stats: DecoderStats,
}

impl<E: VpuEngine + 'static, S: FrameSink> VpuDecoder<E, S> {
    pub fn new(
        engine: E,
        sink: S,
        config: DecoderConfig,
        allocator: Arc<dyn DmaAllocator>,
    ) -> Result<Self, DecodeError> {
        let session = Arc::new(Mutex::new(DecodeSession::new(engine, Arc::clone(&allocator))));
        let executor: Box<dyn DecodeExecutor> = if config.parallelization {
            Box::new(ThreadedRelay::new(Arc::clone(&session))?)
        } else {
            Box::new(InlineExecutor::new(Arc::clone(&session)))
        };

        Ok(Self {
            output_format: config.output_format,
            config,
            sink,
            allocator,
            session,
            executor,
            state: ControllerState::Closed,
            format: None,
            profile: None,
            file_play: false,
            frame_duration: None,
            stream_info: None,
            caps: None,
            pool: None,
            timestamps: TimestampManager::default(),
            qos: QosController::default(),
            flush: FlushHandle::default(),
            flush_pending: false,
            dirty: false,
            draining: false,
            halted: false,
            pending: Bytes::new(),
            chunk_pts: None,
            unit_in_flight: false,
            first_frame: true,
            init_units: Vec::new(),
            keyframe_search: None,
            rotator_target: None,
            frame_counter: 0,
            decode_errors: 0,
            idle_outputs: 0,
            stats: Default::default(),
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Output format agreed with the sink, once the stream is initialized.
    pub fn output_caps(&self) -> Option<&OutputCaps> {
        self.caps.as_ref()
    }

    pub fn pool(&self) -> Option<&FramePool> {
        self.pool.as_ref()
    }

    pub fn timestamps(&self) -> &TimestampManager {
        &self.timestamps
    }

    pub fn skip_mode(&self) -> SkipMode {
        self.qos.mode()
    }

    pub fn is_file_play(&self) -> bool {
        self.file_play
    }

    /// Whether a fatal error stopped the stream.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn flush_handle(&self) -> FlushHandle {
        self.flush.clone()
    }

    /// Sets the format of the compressed input. A running stream is stopped first.
    pub fn set_format(&mut self, format: StreamFormat) -> Result<(), DecodeError> {
        let result = self.apply_format(format);
        self.report(result)
    }

    fn apply_format(&mut self, format: StreamFormat) -> Result<(), DecodeError> {
        if self.pool.is_some() || lock(&self.session).is_open() {
            debug!("new input format, stopping the current stream");
            self.stop_stream();
        }

        let profile = profile_for(&format)?;
        self.file_play = profile
            .required_file_play()
            .or(self.config.file_play)
            .unwrap_or_else(|| format.has_container_geometry());
        self.frame_duration = format.frame_rate.and_then(|rate| rate.period_ns());
        self.timestamps.set_frame_duration(self.frame_duration);
        debug!(
            "{} input, {} mode",
            profile.name(),
            if self.file_play {
                "file-play"
            } else {
                "streaming"
            }
        );

        self.profile = Some(profile);
        self.format = Some(format);
        Ok(())
    }

    /// Decodes one chunk of input, pushing every frame that becomes displayable.
    pub fn chain(&mut self, buffer: InputBuffer) -> Result<(), DecodeError> {
        if self.halted {
            return Err(DecodeError::Halted);
        }
        if self.flush.is_flushing() {
            return Err(DecodeError::Flushing);
        }
        let result = self.process(buffer);
        self.report(result)
    }

    pub fn handle_event(&mut self, event: StreamEvent) -> Result<(), DecodeError> {
        trace!("event {event:?}");
        let result = match event {
            StreamEvent::NewSegment { rate, start } => {
                let mode = if rate > 0.0 && rate <= 2.0 {
                    TimestampMode::Ascending
                } else {
                    TimestampMode::StrictFifo
                };
                self.timestamps.resync(Some(start), mode);
                self.qos.reset();
                self.sink.forward_event(&event);
                Ok(())
            }
            StreamEvent::FlushStart => {
                self.flush.start();
                self.flush_pending = true;
                self.sink.forward_event(&event);
                Ok(())
            }
            StreamEvent::FlushStop => {
                let result = self.flush_stop();
                self.sink.forward_event(&event);
                result
            }
            StreamEvent::EndOfStream => self.end_of_stream(),
            StreamEvent::Qos { lateness_ns } => {
                if self.config.framedrop {
                    self.qos.update(lateness_ns);
                }
                Ok(())
            }
        };
        self.report(result)
    }

    pub fn change_state(&mut self, transition: StateChange) -> Result<(), DecodeError> {
        debug!("state change {transition:?}");
        let result = match transition {
            StateChange::NullToReady => lock(&self.session)
                .init_system()
                .map(|_| ())
                .map_err(DecodeError::from),
            StateChange::ReadyToPaused => {
                self.stats = Default::default();
                self.qos.reset();
                self.timestamps.resync(None, TimestampMode::Ascending);
                self.frame_counter = 0;
                Ok(())
            }
            StateChange::PausedToPlaying | StateChange::PlayingToPaused => Ok(()),
            StateChange::PausedToReady => {
                self.stop_stream();
                Ok(())
            }
            StateChange::ReadyToNull => {
                self.stop_stream();
                lock(&self.session).uninit_system();
                Ok(())
            }
        };
        self.report(result)
    }

    /// Reports fatal errors to the sink, once, and halts the stream.
    fn report<T>(&mut self, result: Result<T, DecodeError>) -> Result<T, DecodeError> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.halted {
                let category = e.category();
                error!("{category}: {e}");
                self.sink.post_error(category, &e.to_string());
                self.halted = true;
            }
        }
        result
    }

    fn profile(&self) -> Result<&dyn CodecProfile, DecodeError> {
        self.profile.as_deref().ok_or(DecodeError::NoFormat)
    }

    fn session_config(&self) -> Result<SessionConfig, DecodeError> {
        let profile = self.profile()?;
        Ok(SessionConfig {
            std: profile.std(),
            file_play: self.file_play,
            bitstream_buffer_size: self.config.bitstream_buffer_size,
            chroma_interleave: self.output_format.is_interleaved(),
            reorder: true,
            mp4_deblock: self.config.deblocking,
            mp4_class: profile.mp4_class(),
            init_retries: profile.init_retries(),
            min_resolution: profile.min_resolution(),
        })
    }

    fn idle_state(&self) -> ControllerState {
        if self.stream_info.is_some() {
            ControllerState::Ready
        } else if lock(&self.session).is_open() {
            ControllerState::Initializing
        } else {
            ControllerState::Closed
        }
    }

    fn process(&mut self, buffer: InputBuffer) -> Result<(), DecodeError> {
        if buffer.data.is_empty() {
            trace!("empty input buffer");
            return Ok(());
        }
        if buffer.discont {
            debug!("discontinuity at {:?}", buffer.pts);
        }

        self.ensure_open()?;
        self.dirty = true;

        let Some(unit) = self.prepare_input(&buffer)? else {
            return Ok(());
        };
        if self.file_play {
            self.feed_file_play(unit, buffer.pts)
        } else {
            self.feed_streaming(unit, buffer.pts)
        }
    }

    fn ensure_open(&mut self) -> Result<(), DecodeError> {
        if lock(&self.session).is_open() {
            return Ok(());
        }
        let config = self.session_config()?;
        self.state = ControllerState::Opening;
        lock(&self.session).open(config)?;
        self.first_frame = true;
        self.init_units.clear();
        self.state = ControllerState::Initializing;
        Ok(())
    }

    /// Converts `buffer` to what the engine expects. The first unit of a session is realigned on
    /// its first start code and preceded by the codec headers.
    fn prepare_input(&mut self, buffer: &InputBuffer) -> Result<Option<Bytes>, DecodeError> {
        let first_frame = self.first_frame;
        let profile = self.profile.as_mut().ok_or(DecodeError::NoFormat)?;

        let data = if first_frame {
            profile.realign(&buffer.data[..])
        } else {
            &buffer.data[..]
        };
        let unit = match profile.repack(data, buffer.pts) {
            Ok(unit) => unit,
            Err(CodecError::InvalidUnit(reason)) => {
                warn!("dropping invalid {} access unit: {reason}", profile.name());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if !first_frame {
            return Ok(Some(unit));
        }

        let header = profile.synthesize_header()?;
        self.first_frame = false;
        Ok(Some(match header {
            Some(header) => {
                trace!("{} bytes of stream headers prepended", header.len());
                concat(&[header, unit])
            }
            None => unit,
        }))
    }

    fn feed_file_play(&mut self, unit: Bytes, pts: Option<u64>) -> Result<(), DecodeError> {
        if lock(&self.session).is_decoding() {
            self.decode_loop()?;
        }

        let outcome = lock(&self.session).copy_input(&unit)?;
        if !matches!(outcome, CopyOutcome::Copied(_)) {
            self.on_copy(outcome)?;
            return Ok(());
        }
        self.chunk_pts = pts;
        if !lock(&self.session).is_initialized() {
            self.init_units.push(unit);
        }

        if !self.ensure_initialized()? {
            return Ok(());
        }
        self.decode_loop()
    }

    fn feed_streaming(&mut self, unit: Bytes, pts: Option<u64>) -> Result<(), DecodeError> {
        self.timestamps.receive(pts);
        self.pending = if self.pending.is_empty() {
            unit
        } else {
            concat(&[self.pending.clone(), unit])
        };

        let outcome = lock(&self.session).copy_input(&self.pending)?;
        if !self.on_copy(outcome)? {
            return Ok(());
        }

        if !self.ensure_initialized()? {
            return Ok(());
        }
        self.decode_loop()
    }

    /// Moves streaming input to the ring buffer if it has room.
    fn copy_pending(&mut self) -> Result<(), DecodeError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let outcome = {
            let mut session = lock(&self.session);
            if session.free_space()? == 0 {
                return Ok(());
            }
            session.copy_input(&self.pending)?
        };
        self.on_copy(outcome).map(|_| ())
    }

    /// Accounts for a copy to the ring buffer. Returns whether the input is still flowing, as
    /// opposed to having been thrown away to recover from an overflow.
    fn on_copy(&mut self, outcome: CopyOutcome) -> Result<bool, DecodeError> {
        match outcome {
            CopyOutcome::Copied(len) => {
                if !self.file_play {
                    if !lock(&self.session).is_initialized() {
                        self.init_units.push(self.pending.slice(..len));
                    }
                    self.pending.advance(len);
                }
                Ok(true)
            }
            CopyOutcome::RingFlushed => {
                warn!("bitstream buffer overflowed before the stream could be initialized");
                self.restart_input();
                Ok(false)
            }
            CopyOutcome::SessionReset => {
                warn!("decoder stalled with a full bitstream buffer, session reset");
                self.stats.recoveries += 1;
                self.restart_input();
                if self.stream_info.is_some() {
                    self.keyframe_search = Some(0);
                }
                Ok(false)
            }
        }
    }

    /// Forgets all the input given to the engine so far.
    fn restart_input(&mut self) {
        self.pending = Bytes::new();
        self.chunk_pts = None;
        self.unit_in_flight = false;
        self.init_units.clear();
        self.first_frame = true;
        self.timestamps.resync(None, self.timestamps.mode());
    }

    /// Initializes the stream if it is not yet. Returns whether it is ready to decode.
    fn ensure_initialized(&mut self) -> Result<bool, DecodeError> {
        let status = {
            let mut session = lock(&self.session);
            if session.is_initialized() && session.pool().is_some_and(|p| p.is_registered()) {
                return Ok(true);
            }
            session.initialize()?
        };

        match status {
            InitStatus::NeedMoreData => {
                trace!("not enough data to initialize the stream");
                self.state = ControllerState::Initializing;
                Ok(false)
            }
            InitStatus::Ready(info) => self.on_initialized(info),
        }
    }

    fn on_initialized(&mut self, info: InitialInfo) -> Result<bool, DecodeError> {
        let Some(current) = &self.stream_info else {
            return self.setup_output(info);
        };

        // The session re-registered the pool as part of its initialization.
        if self.pool.is_some() && same_geometry(current, &info) {
            debug!("stream initialized again with unchanged geometry");
            self.init_units.clear();
            self.state = ControllerState::Ready;
            return Ok(true);
        }

        info!(
            "stream geometry changed from {} to {}, reallocating frame buffers",
            current.pic_size, info.pic_size
        );
        match self.restart_session()? {
            Some(info) => self.setup_output(info),
            None => Ok(false),
        }
    }

    /// Closes and opens the instance again with the current configuration, retiring the frame
    /// pool, and replays the input that preceded initialization. Returns the new geometry, if
    /// the replayed input is enough to get it.
    fn restart_session(&mut self) -> Result<Option<InitialInfo>, DecodeError> {
        let units = std::mem::take(&mut self.init_units);
        let replay = concat(&units);
        let config = self.session_config()?;

        let status = {
            let mut session = lock(&self.session);
            if let Err(e) = session.close() {
                warn!("failed to close the decode instance: {e}");
            }
            if let Some(pool) = session.take_pool() {
                pool.retire();
            }
            session.open(config)?;

            match session.copy_input(&replay)? {
                CopyOutcome::Copied(len) if len < replay.len() => {
                    self.pending = concat(&[replay.slice(len..), self.pending.clone()]);
                }
                CopyOutcome::Copied(_) => (),
                _ => {
                    return Err(SessionError::InvalidState(
                        "bitstream buffer full while replaying the stream headers",
                    )
                    .into())
                }
            }
            session.initialize()?
        };

        self.init_units = units;
        if let Some(pool) = self.pool.take() {
            pool.retire();
        }
        self.caps = None;
        self.stream_info = None;
        match status {
            InitStatus::Ready(info) => Ok(Some(info)),
            InitStatus::NeedMoreData => Ok(None),
        }
    }

    /// Negotiates the output with the sink, then allocates and registers the frame pool.
    fn setup_output(&mut self, mut info: InitialInfo) -> Result<bool, DecodeError> {
        let caps = self.negotiate(&info)?;
        if caps.format != self.output_format {
            debug!(
                "opening the decode instance again for {} output",
                caps.format.fourcc()
            );
            self.output_format = caps.format;
            info = match self.restart_session()? {
                Some(info) => info,
                None => return Ok(false),
            };
        }

        let request = self.pool_request(&info, self.output_format)?;
        let pool = {
            let sink = &mut self.sink;
            FramePool::allocate(request, self.allocator.as_ref(), |size| {
                sink.alloc_dma_buffer(size)
            })
            .map_err(DecodeError::BufferAllocation)?
        };
        lock(&self.session).attach_pool(pool.clone())?;

        if self.frame_duration.is_none() {
            self.frame_duration = info.frame_rate.and_then(|rate| rate.period_ns());
            self.timestamps.set_frame_duration(self.frame_duration);
        }
        info!(
            "decoding {} {} to {} with {} frame buffers",
            info.pic_size,
            self.profile()?.name(),
            caps.format.fourcc(),
            pool.len()
        );

        self.pool = Some(pool);
        self.caps = Some(caps);
        self.stream_info = Some(info);
        self.init_units.clear();
        self.state = ControllerState::Ready;
        Ok(true)
    }

    /// Proposes the preferred output format, then the other interleave convention.
    fn negotiate(&mut self, info: &InitialInfo) -> Result<OutputCaps, DecodeError> {
        let preferred = self.config.output_format;
        for format in [preferred, preferred.alternate()] {
            let request = self.pool_request(info, format)?;
            let caps = self.caps_for(info, &request)?;
            if self.sink.negotiate(&caps) {
                return Ok(caps);
            }
            debug!("consumer refused {} output", format.fourcc());
        }
        Err(DecodeError::NotNegotiated)
    }

    fn pool_request(
        &self,
        info: &InitialInfo,
        format: DecodedFormat,
    ) -> Result<PoolRequest, DecodeError> {
        let interlaced = self.profile()?.is_interlaced(info, None);
        let size = info.pic_size.align(16, if interlaced { 32 } else { 16 });
        let decode_layout = FrameLayout::new(size, format, info.chroma);

        // Chroma layouts other than 4:2:0 only get here for MJPEG, which the post-processor
        // converts.
        let post_process = self.config.uses_rotator() || info.chroma != ChromaFormat::Yuv420;
        let rotator = post_process.then(|| {
            let size = if self.config.rotation.swaps_dimensions() {
                size.transposed()
            } else {
                size
            };
            (
                FrameLayout::new(size, format, ChromaFormat::Yuv420),
                POST_PROCESS_SLOTS,
            )
        });

        Ok(PoolRequest {
            decode_layout,
            num_decode: info.min_frame_count + self.config.extra_buffers,
            rotator,
        })
    }

    fn caps_for(
        &self,
        info: &InitialInfo,
        request: &PoolRequest,
    ) -> Result<OutputCaps, DecodeError> {
        let profile = self.profile()?;
        let (layout, num_buffers) = request
            .rotator
            .unwrap_or((request.decode_layout, request.num_decode));

        let mut picture = info.pic_size;
        let mut crop = profile.crop(info);
        let mut pixel_aspect_ratio = self
            .format
            .as_ref()
            .and_then(|f| f.pixel_aspect_ratio)
            .unwrap_or_else(|| profile.pixel_aspect_ratio(info));
        if self.config.rotation.swaps_dimensions() {
            picture = picture.transposed();
            crop = transpose(crop);
            pixel_aspect_ratio = Fraction::new(pixel_aspect_ratio.den, pixel_aspect_ratio.num);
        }

        Ok(OutputCaps {
            format: layout.format,
            coded_size: layout.size,
            padding: (
                layout.size.width.saturating_sub(picture.width),
                layout.size.height.saturating_sub(picture.height),
            ),
            crop,
            pixel_aspect_ratio,
            frame_rate: self
                .format
                .as_ref()
                .and_then(|f| f.frame_rate)
                .or(info.frame_rate),
            num_buffers,
            interlaced: profile.is_interlaced(info, None),
        })
    }

    /// Starts decodes and handles their output until the engine runs out of input, a decode
    /// yields or a flush starts.
    fn decode_loop(&mut self) -> Result<(), DecodeError> {
        let mut follow_up = false;
        loop {
            if self.flush.is_flushing() {
                debug!("flushing, leaving the decode loop");
                return Ok(());
            }
            if !self.file_play {
                self.copy_pending()?;
            }

            let in_flight = lock(&self.session).is_decoding();
            let command = if in_flight {
                Command::WaitForPendingGetOutput {
                    pending: self.pending.clone(),
                }
            } else {
                match self.next_start(follow_up)? {
                    Some(params) => Command::StartFrameAndGetOutput {
                        params,
                        pending: self.pending.clone(),
                    },
                    None => {
                        self.state = self.idle_state();
                        return Ok(());
                    }
                }
            };

            let forced = follow_up;
            follow_up = false;
            self.state = ControllerState::Decoding;
            let started = Instant::now();
            let output = self.executor.execute(command);
            self.stats.decode_time += started.elapsed();

            match output? {
                CommandOutput::Output { info, copied } => {
                    self.pending.advance(copied);
                    match self.handle_output(info, forced)? {
                        Step::Continue => (),
                        Step::FollowUp => follow_up = true,
                        Step::Stop => {
                            self.state = self.idle_state();
                            return Ok(());
                        }
                    }
                }
                CommandOutput::Yield { copied } => {
                    self.pending.advance(copied);
                    trace!("decode still running, waiting for more input");
                    return Ok(());
                }
                other => {
                    return Err(SessionError::Relay(format!("unexpected reply {other:?}")).into())
                }
            }
        }
    }

    /// Parameters of the next decode, or `None` if no decode should start now.
    fn next_start(&mut self, force: bool) -> Result<Option<DecParams>, DecodeError> {
        let has_chunk = {
            let mut session = lock(&self.session);
            if !session.is_initialized() || !session.pool().is_some_and(|p| p.is_registered()) {
                return Ok(None);
            }
            let has_input = if self.file_play {
                session.has_chunk()
            } else {
                session.data_in_vpu()? > 0
            };
            if !has_input && !force && !self.draining {
                return Ok(None);
            }
            session.has_chunk()
        };

        let mut params = DecParams {
            iframe_search: self.keyframe_search.is_some(),
            ..Default::default()
        };
        if self.config.framedrop {
            params.skip = self.qos.skip_frames();
        }
        if self.pool.as_ref().is_some_and(|p| p.has_rotator_slots()) {
            let Some(rotator) = self.rotator_params()? else {
                debug!("all post-processing buffers are held downstream");
                return Ok(None);
            };
            self.rotator_target = Some(rotator.output.index);
            params.rotator = Some(rotator);
        }

        if self.file_play && has_chunk {
            self.timestamps.receive(self.chunk_pts.take());
        }
        // A follow-up decode outputs the picture whose timestamp the packed unit queued.
        self.unit_in_flight = self.file_play && (has_chunk || force);
        Ok(Some(params))
    }

    fn rotator_params(&mut self) -> Result<Option<RotatorParams>, DecodeError> {
        let Some(pool) = self.pool.clone() else {
            return Ok(None);
        };
        let mut output = pool.free_rotator_slot();
        if output.is_none() {
            self.executor.execute(Command::ReleasePendingBuffers)?;
            output = pool.free_rotator_slot();
        }
        let stride = pool
            .request()
            .rotator
            .map_or(0, |(layout, _)| layout.size.width as usize);

        Ok(output.map(|output| RotatorParams {
            output,
            stride,
            rotation: self.config.rotation,
            mirror: self.config.mirror,
        }))
    }

    fn handle_output(&mut self, info: OutputInfo, forced: bool) -> Result<Step, DecodeError> {
        let rotator_target = self.rotator_target.take();
        // Streaming timestamps are queued per input buffer, so any consumed picture owns one.
        let owns_timestamp = std::mem::take(&mut self.unit_in_flight)
            || (!self.file_play && !self.timestamps.is_empty());

        if let DecodeStatus::Error(code) = info.status {
            self.decode_errors += 1;
            warn!(
                "decode failed with status {code}, {} times in a row",
                self.decode_errors
            );
            if owns_timestamp {
                self.discard_picture("decode error");
            }
            if self.decode_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                return Err(SessionError::DecodeFailed(code).into());
            }
            return Ok(Step::Continue);
        }

        let pool = self
            .pool
            .clone()
            .ok_or(SessionError::InvalidState("decode output without frame pool"))?;
        let mut progressed = false;
        let mut lost = None;

        match info.decoded {
            DecodedIndex::Frame(index) => {
                pool.mark_decoded(index).map_err(SessionError::from)?;
                self.stats.decoded += 1;
                self.decode_errors = 0;
                progressed = true;
            }
            DecodedIndex::NoFrameBuffer => {
                debug!("no frame buffer available to decode into");
                // A streaming picture stays in the ring buffer, a file-play unit is gone.
                if self.file_play && owns_timestamp {
                    lost = Some("no frame buffer");
                }
            }
            DecodedIndex::Skipped => {
                trace!("{:?} picture skipped by the engine", info.pic_type);
                if owns_timestamp {
                    lost = Some("skipped by the engine");
                }
                progressed = true;
            }
            DecodedIndex::None => (),
        }

        match info.display {
            DisplayIndex::Frame(index) => {
                self.render(index, rotator_target, &info)?;
                progressed = true;
            }
            DisplayIndex::Skipped => {
                // Reported for the picture skipped by this very decode, if any.
                lost = None;
                self.discard_picture("display skipped");
                progressed = true;
            }
            DisplayIndex::EndOfSequence => {
                debug!("end of sequence reached");
                self.idle_outputs = 0;
                return Ok(Step::Stop);
            }
            DisplayIndex::None => (),
        }

        // Displayed pictures precede the lost one, so its timestamp goes last.
        if let Some(reason) = lost {
            self.discard_picture(reason);
        }

        if info.packed_pb && !forced {
            // The second picture of a packed unit comes out of a decode without input of its own.
            self.timestamps.receive(None);
            return Ok(Step::FollowUp);
        }

        if progressed {
            self.idle_outputs = 0;
        } else {
            self.idle_outputs += 1;
            if self.idle_outputs >= MAX_IDLE_OUTPUTS {
                trace!("{} decodes without output", self.idle_outputs);
                self.idle_outputs = 0;
                return Ok(Step::Stop);
            }
        }

        match info.status {
            DecodeStatus::NeedMoreData | DecodeStatus::FrameNotComplete => Ok(Step::Stop),
            _ => Ok(Step::Continue),
        }
    }

    /// Accounts for a picture that will never be displayed.
    fn discard_picture(&mut self, reason: &str) {
        let pts = self.timestamps.dequeue_for_display();
        trace!("picture dropped ({reason}), pts {pts:?}");
        self.stats.dropped += 1;
    }

    fn drop_reason(&mut self, counter: u64, pic_type: PicType) -> Option<&'static str> {
        if let Some(searched) = self.keyframe_search {
            if pic_type.is_intra() {
                debug!("keyframe found after dropping {searched} frames");
                self.keyframe_search = None;
            } else if searched >= self.config.max_keyframe_search {
                warn!("no keyframe after {searched} frames, displaying anyway");
                self.keyframe_search = None;
            } else {
                self.keyframe_search = Some(searched + 1);
                return Some("waiting for a keyframe");
            }
        }
        (self.config.framedrop && self.qos.should_drop(counter)).then_some("late")
    }

    /// Hands frame buffer `index` to the sink, or drops it.
    fn render(
        &mut self,
        index: usize,
        rotator_target: Option<usize>,
        output: &OutputInfo,
    ) -> Result<(), DecodeError> {
        let pts = self.timestamps.dequeue_for_display();
        let counter = self.frame_counter;
        self.frame_counter += 1;

        if let Some(reason) = self.drop_reason(counter, output.pic_type) {
            trace!("dropping frame {index} ({reason}), pts {pts:?}");
            lock(&self.session).release_frame(index)?;
            self.stats.dropped += 1;
            return Ok(());
        }

        let pool = self
            .pool
            .clone()
            .ok_or(SessionError::InvalidState("display without frame pool"))?;
        let display_index = match rotator_target {
            Some(target) => {
                lock(&self.session).release_frame(index)?;
                pool.mark_decoded(target).map_err(SessionError::from)?;
                target
            }
            None => index,
        };
        let buffer = pool
            .mark_displayed(display_index)
            .map_err(SessionError::from)?;

        let interlaced = match (&self.profile, &self.stream_info) {
            (Some(profile), Some(info)) => profile.is_interlaced(info, Some(output)),
            _ => output.interlaced,
        };
        let data = if self.sink.supports_direct_render() {
            FrameData::Direct(buffer)
        } else {
            let copy = buffer.as_bytes().to_vec();
            drop(buffer);
            lock(&self.session).release_frame(display_index)?;
            FrameData::Copied(copy)
        };

        let frame = DisplayFrame {
            data,
            pts,
            duration: self.frame_duration,
            interlaced,
            top_field_first: output.top_field_first,
        };
        trace!("pushing {frame:?}");
        self.state = ControllerState::Rendering;
        match self.sink.push(frame) {
            Ok(()) => {
                self.stats.rendered += 1;
                Ok(())
            }
            Err(SinkError::Flushing) => {
                debug!("consumer flushing, frame discarded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush_stop(&mut self) -> Result<(), DecodeError> {
        self.flush.stop();
        if !self.flush_pending && !self.dirty {
            debug!("nothing to flush");
            return Ok(());
        }
        self.flush_pending = false;
        self.dirty = false;
        self.state = ControllerState::Flushing;

        let initialized = {
            let mut session = lock(&self.session);
            if let Some(info) = session.drain() {
                debug!("discarded the output of the decode in flight: {info:?}");
            }
            if session.is_open() {
                // Decoded pictures are still referenced by the engine's reorder queue.
                let reordering = session.pool().is_some_and(|p| p.counts().decoded > 0);
                session.flush_frames()?;
                session.flush_ring()?;
                // The ring position of a streaming session cannot be rewound, and a decode that
                // did not drain leaves the engine unusable.
                if session.is_initialized()
                    && (!self.file_play || session.is_decoding() || reordering)
                {
                    session.reset()?;
                }
            }
            session.is_initialized()
        };

        self.pending = Bytes::new();
        self.chunk_pts = None;
        self.unit_in_flight = false;
        self.rotator_target = None;
        self.draining = false;
        self.idle_outputs = 0;
        self.timestamps.resync(None, self.timestamps.mode());
        if !initialized {
            self.init_units.clear();
            self.first_frame = true;
        }
        if self.stream_info.is_some() {
            self.keyframe_search = Some(0);
        }
        self.state = self.idle_state();
        debug!("flush done");
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<(), DecodeError> {
        let ready = !self.halted
            && self.stream_info.is_some()
            && lock(&self.session).is_initialized();
        if !ready {
            debug!("end of stream before the stream was initialized");
            self.sink.forward_event(&StreamEvent::EndOfStream);
            return Ok(());
        }
        self.dirty = true;

        // Whatever input is still waiting goes in before the end of stream marker.
        if !self.file_play {
            self.decode_loop()?;
        }
        lock(&self.session).signal_eos()?;

        self.draining = true;
        let result = self.decode_loop();
        self.draining = false;
        result?;

        self.timestamps.drain_remaining();
        self.sink.forward_event(&StreamEvent::EndOfStream);
        Ok(())
    }

    /// Closes the session and retires the frame pool.
    fn stop_stream(&mut self) {
        let active = {
            let mut session = lock(&self.session);
            if let Some(info) = session.drain() {
                debug!("discarded the output of the decode in flight: {info:?}");
            }
            let active = session.is_open() || self.pool.is_some();
            if session.is_open() {
                if let Err(e) = session.close() {
                    warn!("failed to close the decode instance: {e}");
                }
            }
            session.take_pool();
            active
        };
        if let Some(pool) = self.pool.take() {
            pool.retire();
        }

        if active && self.config.profiling {
            let stats = &self.stats;
            info!(
                "{} frames decoded in {:?} ({:.1} fps), {} rendered, {} dropped, {} recoveries",
                stats.decoded,
                stats.decode_time,
                stats.decode_fps().unwrap_or(0.0),
                stats.rendered,
                stats.dropped,
                stats.recoveries
            );
        }

        self.caps = None;
        self.stream_info = None;
        self.output_format = self.config.output_format;
        self.pending = Bytes::new();
        self.chunk_pts = None;
        self.unit_in_flight = false;
        self.init_units.clear();
        self.first_frame = true;
        self.keyframe_search = None;
        self.rotator_target = None;
        self.flush_pending = false;
        self.dirty = false;
        self.draining = false;
        self.halted = false;
        self.decode_errors = 0;
        self.idle_outputs = 0;
        self.flush.stop();
        self.state = ControllerState::Closed;
    }
}

impl<E: VpuEngine + 'static, S: FrameSink> Drop for VpuDecoder<E, S> {
    fn drop(&mut self) {
        let mut session = lock(&self.session);
        session.drain();
        if session.is_open() {
            if let Err(e) = session.close() {
                warn!("failed to close the decode instance: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyEngine;
    use crate::backend::dummy::ScriptedOutput;
    use crate::backend::SkipFrames;
    use crate::decoder::ErrorCategory;
    use crate::decoder::Rotation;
    use crate::video_frame::dma::SystemDmaAllocator;
    use crate::video_frame::frame_pool::FrameBufferState;
    use crate::Resolution;

    const FRAME_NS: u64 = 40_000_000;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Pushed {
        pts: Option<u64>,
        index: Option<usize>,
        len: usize,
    }

    struct TestSink {
        direct: bool,
        /// Keep the pushed frames instead of releasing them right away.
        hold: bool,
        refused: Vec<DecodedFormat>,
        proposed: Vec<OutputCaps>,
        pushed: Vec<Pushed>,
        held: Vec<DisplayFrame>,
        events: Vec<StreamEvent>,
        errors: Vec<(ErrorCategory, String)>,
    }

    impl Default for TestSink {
        fn default() -> Self {
            Self {
                direct: true,
                hold: false,
                refused: Vec::new(),
                proposed: Vec::new(),
                pushed: Vec::new(),
                held: Vec::new(),
                events: Vec::new(),
                errors: Vec::new(),
            }
        }
    }

    impl FrameSink for TestSink {
        fn negotiate(&mut self, caps: &OutputCaps) -> bool {
            self.proposed.push(caps.clone());
            !self.refused.contains(&caps.format)
        }

        fn supports_direct_render(&self) -> bool {
            self.direct
        }

        fn push(&mut self, frame: DisplayFrame) -> Result<(), SinkError> {
            self.pushed.push(Pushed {
                pts: frame.pts,
                index: frame.index(),
                len: frame.as_bytes().len(),
            });
            if self.hold {
                self.held.push(frame);
            }
            Ok(())
        }

        fn forward_event(&mut self, event: &StreamEvent) {
            self.events.push(*event);
        }

        fn post_error(&mut self, category: ErrorCategory, message: &str) {
            self.errors.push((category, String::from(message)));
        }
    }

    type TestDecoder = VpuDecoder<DummyEngine, TestSink>;

    fn test_config() -> DecoderConfig {
        DecoderConfig {
            bitstream_buffer_size: 4096,
            ..Default::default()
        }
    }

    fn file_play_format() -> StreamFormat {
        StreamFormat::new("video/mpeg")
            .with_version(2)
            .with_size(320, 240)
            .with_frame_rate(25, 1)
    }

    fn streaming_format() -> StreamFormat {
        StreamFormat::new("video/mpeg")
            .with_version(2)
            .with_frame_rate(25, 1)
    }

    fn unit() -> Vec<u8> {
        let mut unit = vec![0x00, 0x00, 0x01, 0xb3];
        unit.resize(64, 0x55);
        unit
    }

    fn new_decoder(
        engine: &DummyEngine,
        config: DecoderConfig,
        sink: TestSink,
        format: StreamFormat,
    ) -> TestDecoder {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut decoder = VpuDecoder::new(
            engine.clone(),
            sink,
            config,
            Arc::new(SystemDmaAllocator::new()),
        )
        .unwrap();
        decoder.change_state(StateChange::NullToReady).unwrap();
        decoder.change_state(StateChange::ReadyToPaused).unwrap();
        decoder.set_format(format).unwrap();
        decoder
    }

    fn feed(decoder: &mut TestDecoder, n: u64) -> Result<(), DecodeError> {
        decoder.chain(InputBuffer::new(unit(), Some(n * FRAME_NS)))
    }

    fn pts_of(sink: &TestSink) -> Vec<Option<u64>> {
        sink.pushed.iter().map(|p| p.pts).collect()
    }

    fn frame(n: u64) -> Option<u64> {
        Some(n * FRAME_NS)
    }

    #[test]
    fn initialization_allocates_pool_with_margin() {
        let engine = DummyEngine::new();
        engine.state().reorder_delay = 1;
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());
        assert!(decoder.is_file_play());

        feed(&mut decoder, 0).unwrap();

        let pool = decoder.pool().unwrap();
        assert_eq!(pool.num_decode_slots(), 6);
        assert!(!pool.has_rotator_slots());
        assert_eq!(engine.state().registered.len(), 6);
        let counts = pool.counts();
        assert_eq!(counts.display, 0);
        assert_eq!(counts.decoded, 1);
        assert_eq!(counts.allocated, 5);
        assert!(decoder.sink().pushed.is_empty());

        let caps = decoder.output_caps().unwrap();
        assert_eq!(caps.format, DecodedFormat::I420);
        assert_eq!(caps.coded_size, Resolution::from((320, 240)));
        assert_eq!(caps.padding, (0, 0));
        assert_eq!(caps.crop, Rect::from_resolution(Resolution::from((320, 240))));
        assert_eq!(caps.frame_rate, Some(Fraction::new(25, 1)));
        assert_eq!(caps.num_buffers, 6);
        assert_eq!(decoder.state(), ControllerState::Ready);
    }

    #[test]
    fn display_latency_keeps_first_timestamp() {
        let engine = DummyEngine::new();
        let decoded_only = OutputInfo {
            decoded: DecodedIndex::Frame(0),
            display: DisplayIndex::None,
            ..Default::default()
        };
        engine.push_script([
            ScriptedOutput::from(decoded_only.clone()),
            ScriptedOutput::from(decoded_only),
            ScriptedOutput::from(OutputInfo {
                decoded: DecodedIndex::Frame(1),
                display: DisplayIndex::Frame(0),
                ..Default::default()
            }),
        ]);
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        for n in 0..3 {
            feed(&mut decoder, n).unwrap();
        }

        assert_eq!(pts_of(decoder.sink()), vec![frame(0)]);
        assert_eq!(decoder.timestamps().len(), 2);
        assert_eq!(decoder.stats().decoded, 3);
    }

    #[test]
    fn ring_overflow_before_initialization() {
        let engine = DummyEngine::new();
        {
            let mut state = engine.state();
            state.init_threshold = 100_000;
            state.force_ring_full = true;
        }
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), streaming_format());
        assert!(!decoder.is_file_play());

        feed(&mut decoder, 0).unwrap();
        assert_eq!(engine.state().flush_count, 1);
        assert!(decoder.timestamps().is_empty());
        assert!(decoder.sink().errors.is_empty());
        assert!(!decoder.is_halted());

        {
            let mut state = engine.state();
            state.init_threshold = 1;
            state.force_ring_full = false;
        }
        feed(&mut decoder, 1).unwrap();
        assert_eq!(pts_of(decoder.sink()), vec![frame(1)]);
        assert!(decoder.timestamps().is_empty());
    }

    #[test]
    fn stuck_engine_halts_the_stream_once() {
        let engine = DummyEngine::new();
        engine.state().always_busy = true;
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        let err = feed(&mut decoder, 0).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Session(SessionError::FatalTimeout(_))
        ));
        assert!(decoder.is_halted());
        assert_eq!(decoder.sink().errors.len(), 1);
        assert_eq!(
            decoder.sink().errors[0].0,
            ErrorCategory::FatalHardwareTimeout
        );

        assert!(matches!(feed(&mut decoder, 1), Err(DecodeError::Halted)));
        decoder.handle_event(StreamEvent::EndOfStream).unwrap();
        assert_eq!(decoder.sink().errors.len(), 1);
        assert_eq!(decoder.sink().events, vec![StreamEvent::EndOfStream]);
        assert_eq!(engine.state().start_count, 1);
        assert!(!engine.state().open);
    }

    #[test]
    fn flush_during_decode() {
        let engine = DummyEngine::new();
        let sink = TestSink {
            hold: true,
            ..Default::default()
        };
        let mut decoder = new_decoder(&engine, test_config(), sink, streaming_format());

        feed(&mut decoder, 0).unwrap();
        let held = decoder.sink().held[0].index().unwrap();

        // The next decode is still running when the decoder gives control back.
        engine.state().busy_polls = 5;
        feed(&mut decoder, 1).unwrap();
        assert!(engine.state().decoding);
        assert_eq!(decoder.state(), ControllerState::Decoding);

        let flushes = engine.state().flush_count;
        decoder.handle_event(StreamEvent::FlushStart).unwrap();
        assert!(matches!(feed(&mut decoder, 2), Err(DecodeError::Flushing)));
        decoder.handle_event(StreamEvent::FlushStop).unwrap();

        let pool = decoder.pool().unwrap().clone();
        assert_eq!(pool.state(held), Some(FrameBufferState::Pending));
        assert_eq!(pool.counts().display, 0);
        assert_eq!(pool.counts().decoded, 0);
        let (flushes_after, opens) = {
            let state = engine.state();
            assert!(!state.decoding);
            assert_eq!(state.available, 0);
            assert!(state.flush_count > flushes);
            (state.flush_count, state.open_count)
        };
        assert!(decoder.timestamps().is_empty());

        // A second flush has nothing left to do.
        decoder.handle_event(StreamEvent::FlushStop).unwrap();
        assert_eq!(engine.state().flush_count, flushes_after);
        assert_eq!(engine.state().open_count, opens);
        assert_eq!(
            decoder.sink().events,
            vec![
                StreamEvent::FlushStart,
                StreamEvent::FlushStop,
                StreamEvent::FlushStop
            ]
        );

        decoder.sink_mut().held.clear();
        engine.state().busy_polls = 0;
        feed(&mut decoder, 3).unwrap();
        assert_eq!(pts_of(decoder.sink()), vec![frame(0), frame(3)]);
        assert!(engine.state().last_params.as_ref().unwrap().iframe_search);
        assert_eq!(pool.state(held), Some(FrameBufferState::Display));
    }

    #[test]
    fn qos_lateness_drops_frames() {
        let engine = DummyEngine::new();
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        decoder
            .handle_event(StreamEvent::Qos {
                lateness_ns: 250_000_000,
            })
            .unwrap();
        assert_eq!(decoder.skip_mode(), SkipMode::Aggressive);

        for n in 0..8 {
            feed(&mut decoder, n).unwrap();
        }

        assert_eq!(
            pts_of(decoder.sink()),
            [0, 1, 2, 4, 5, 6].map(frame).to_vec()
        );
        assert_eq!(decoder.stats().dropped, 2);
        assert_eq!(decoder.stats().rendered, 6);
        assert_eq!(
            engine.state().last_params.as_ref().unwrap().skip,
            SkipFrames::B
        );
        assert!(decoder.timestamps().is_empty());
        // QoS events are consumed here.
        assert!(decoder.sink().events.is_empty());
    }

    #[test]
    fn engine_skips_b_pictures_when_late() {
        let engine = DummyEngine::new();
        engine.state().b_frame_interval = Some(3);
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        decoder
            .handle_event(StreamEvent::Qos {
                lateness_ns: 50_000_000,
            })
            .unwrap();
        assert_eq!(decoder.skip_mode(), SkipMode::DropB);

        for n in 0..9 {
            feed(&mut decoder, n).unwrap();
        }

        assert_eq!(
            pts_of(decoder.sink()),
            [0, 1, 3, 4, 6, 7].map(frame).to_vec()
        );
        assert_eq!(decoder.stats().dropped, 3);
        assert_eq!(decoder.stats().decoded, 6);
        let timestamps = decoder.timestamps();
        assert!(timestamps.is_empty());
        assert_eq!(timestamps.received(), 9);
        assert_eq!(timestamps.received(), timestamps.dequeued());
    }

    #[test]
    fn engine_skips_b_and_p_pictures_while_catching_up() {
        let engine = DummyEngine::new();
        engine.state().b_frame_interval = Some(2);
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), streaming_format());

        for lateness_ns in [250_000_000, 50_000_000] {
            decoder
                .handle_event(StreamEvent::Qos { lateness_ns })
                .unwrap();
        }
        assert_eq!(decoder.skip_mode(), SkipMode::DropBP);

        for n in 0..4 {
            feed(&mut decoder, n).unwrap();
        }

        assert_eq!(pts_of(decoder.sink()), vec![frame(0)]);
        assert_eq!(decoder.stats().dropped, 3);
        assert_eq!(
            engine.state().last_params.as_ref().unwrap().skip,
            SkipFrames::BAndP
        );
        let timestamps = decoder.timestamps();
        assert!(timestamps.is_empty());
        assert_eq!(timestamps.received(), timestamps.dequeued());
    }

    #[test]
    fn failed_decode_consumes_its_timestamp() {
        let engine = DummyEngine::new();
        engine.push_script([ScriptedOutput::from(OutputInfo {
            status: DecodeStatus::Error(-3),
            ..Default::default()
        })]);
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        for n in 0..4 {
            feed(&mut decoder, n).unwrap();
        }

        assert_eq!(pts_of(decoder.sink()), vec![frame(1), frame(2), frame(3)]);
        assert_eq!(decoder.stats().dropped, 1);
        let timestamps = decoder.timestamps();
        assert!(timestamps.is_empty());
        assert_eq!(timestamps.received(), 4);
        assert_eq!(timestamps.received(), timestamps.dequeued());
    }

    #[test]
    fn undecoded_units_consume_their_timestamps() {
        let engine = DummyEngine::new();
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        feed(&mut decoder, 0).unwrap();
        engine.push_script([ScriptedOutput::from(OutputInfo {
            decoded: DecodedIndex::Skipped,
            display: DisplayIndex::None,
            pic_type: PicType::B,
            ..Default::default()
        })]);
        for n in 1..4 {
            feed(&mut decoder, n).unwrap();
        }
        assert_eq!(pts_of(decoder.sink()), vec![frame(0), frame(2), frame(3)]);

        // A file-play unit that found no frame buffer is not decoded later.
        engine.push_script([ScriptedOutput::from(OutputInfo {
            decoded: DecodedIndex::NoFrameBuffer,
            display: DisplayIndex::None,
            ..Default::default()
        })]);
        for n in 4..6 {
            feed(&mut decoder, n).unwrap();
        }

        assert_eq!(
            pts_of(decoder.sink()),
            [0, 2, 3, 5].map(frame).to_vec()
        );
        assert_eq!(decoder.stats().dropped, 2);
        let timestamps = decoder.timestamps();
        assert!(timestamps.is_empty());
        assert_eq!(timestamps.received(), 6);
        assert_eq!(timestamps.received(), timestamps.dequeued());
    }

    #[test]
    fn file_play_flush_with_pictures_awaiting_display() {
        let engine = DummyEngine::new();
        engine.state().reorder_delay = 1;
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        feed(&mut decoder, 0).unwrap();
        feed(&mut decoder, 1).unwrap();
        assert_eq!(decoder.pool().unwrap().counts().decoded, 1);

        let opens = engine.state().open_count;
        decoder.handle_event(StreamEvent::FlushStart).unwrap();
        decoder.handle_event(StreamEvent::FlushStop).unwrap();
        assert_eq!(engine.state().open_count, opens + 1);
        assert!(engine.state().reorder.is_empty());
        assert_eq!(decoder.pool().unwrap().counts().decoded, 0);
        assert!(decoder.timestamps().is_empty());

        for n in 2..8 {
            feed(&mut decoder, n).unwrap();
        }
        assert!(decoder.sink().errors.is_empty());
        assert!(!decoder.is_halted());
        assert_eq!(
            pts_of(decoder.sink()),
            [0, 2, 3, 4, 5, 6].map(frame).to_vec()
        );

        decoder.handle_event(StreamEvent::EndOfStream).unwrap();
        assert_eq!(
            pts_of(decoder.sink()),
            [0, 2, 3, 4, 5, 6, 7].map(frame).to_vec()
        );
        let timestamps = decoder.timestamps();
        assert_eq!(timestamps.received(), timestamps.dequeued());
    }

    #[test]
    fn packed_unit_displays_two_pictures() {
        let engine = DummyEngine::new();
        engine.push_script([
            ScriptedOutput::from(OutputInfo {
                decoded: DecodedIndex::Frame(0),
                display: DisplayIndex::Frame(0),
                pic_type: PicType::P,
                packed_pb: true,
                ..Default::default()
            }),
            ScriptedOutput::from(OutputInfo {
                decoded: DecodedIndex::Frame(1),
                display: DisplayIndex::Frame(1),
                pic_type: PicType::B,
                ..Default::default()
            }),
        ]);
        let format = StreamFormat::new("video/mpeg")
            .with_version(4)
            .with_size(320, 240)
            .with_frame_rate(25, 1);
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), format);

        let mut vop = vec![0x00, 0x00, 0x01, 0xb6];
        vop.resize(48, 0x11);
        decoder
            .chain(InputBuffer::new(vop, Some(1_000_000_000)))
            .unwrap();

        assert_eq!(
            pts_of(decoder.sink()),
            vec![Some(1_000_000_000), Some(1_000_000_000 + FRAME_NS)]
        );
        let state = engine.state();
        assert_eq!(state.start_count, 2);
        assert_eq!(state.last_params.as_ref().unwrap().chunk_size, Some(0));
        drop(state);
        assert!(decoder.timestamps().is_empty());
    }

    #[test]
    fn keyframe_search_after_flush_is_bounded() {
        let engine = DummyEngine::new();
        let config = DecoderConfig {
            max_keyframe_search: 2,
            ..test_config()
        };
        let mut decoder = new_decoder(&engine, config, Default::default(), file_play_format());

        feed(&mut decoder, 0).unwrap();
        decoder.handle_event(StreamEvent::FlushStart).unwrap();
        decoder.handle_event(StreamEvent::FlushStop).unwrap();

        let inter = OutputInfo {
            decoded: DecodedIndex::Frame(0),
            display: DisplayIndex::Frame(0),
            pic_type: PicType::P,
            ..Default::default()
        };
        engine.push_script(vec![ScriptedOutput::from(inter); 3]);
        for n in 1..=3 {
            feed(&mut decoder, n).unwrap();
            assert!(engine.state().last_params.as_ref().unwrap().iframe_search);
        }
        assert_eq!(pts_of(decoder.sink()), vec![frame(0), frame(3)]);
        assert_eq!(decoder.stats().dropped, 2);

        feed(&mut decoder, 4).unwrap();
        assert!(!engine.state().last_params.as_ref().unwrap().iframe_search);
        assert_eq!(decoder.sink().pushed.len(), 3);
    }

    #[test]
    fn output_format_fallback() {
        let engine = DummyEngine::new();
        let sink = TestSink {
            refused: vec![DecodedFormat::I420],
            ..Default::default()
        };
        let mut decoder = new_decoder(&engine, test_config(), sink, file_play_format());

        feed(&mut decoder, 0).unwrap();

        assert_eq!(decoder.output_caps().unwrap().format, DecodedFormat::NV12);
        assert_eq!(decoder.sink().proposed.len(), 2);
        assert_eq!(
            decoder.pool().unwrap().request().decode_layout.format,
            DecodedFormat::NV12
        );
        let state = engine.state();
        assert_eq!(state.open_count, 2);
        assert!(state.open_params.as_ref().unwrap().chroma_interleave);
        drop(state);
        assert_eq!(pts_of(decoder.sink()), vec![frame(0)]);
    }

    #[test]
    fn refused_output_is_fatal() {
        let engine = DummyEngine::new();
        let sink = TestSink {
            refused: vec![DecodedFormat::I420, DecodedFormat::NV12],
            ..Default::default()
        };
        let mut decoder = new_decoder(&engine, test_config(), sink, file_play_format());

        assert!(matches!(
            feed(&mut decoder, 0),
            Err(DecodeError::NotNegotiated)
        ));
        assert!(decoder.is_halted());
        assert_eq!(decoder.sink().errors.len(), 1);
        assert_eq!(decoder.sink().errors[0].0, ErrorCategory::NotNegotiated);
        assert_eq!(engine.state().start_count, 0);
    }

    #[test]
    fn copied_frames_return_buffers_immediately() {
        let engine = DummyEngine::new();
        let sink = TestSink {
            direct: false,
            ..Default::default()
        };
        let mut decoder = new_decoder(&engine, test_config(), sink, file_play_format());

        feed(&mut decoder, 0).unwrap();

        let pushed = &decoder.sink().pushed[0];
        assert_eq!(pushed.index, None);
        assert_eq!(pushed.len, 320 * 240 * 3 / 2);
        assert_eq!(decoder.pool().unwrap().counts().allocated, 6);
        assert_eq!(engine.state().cleared, vec![0]);
    }

    #[test]
    fn rotation_uses_post_processing_slots() {
        let engine = DummyEngine::new();
        let config = DecoderConfig {
            rotation: Rotation::Rotate90,
            ..test_config()
        };
        let mut decoder = new_decoder(&engine, config, Default::default(), file_play_format());

        for n in 0..3 {
            feed(&mut decoder, n).unwrap();
        }

        let caps = decoder.output_caps().unwrap();
        assert_eq!(caps.coded_size, Resolution::from((240, 320)));
        assert_eq!(caps.crop, Rect::from_resolution(Resolution::from((240, 320))));
        assert_eq!(caps.num_buffers, POST_PROCESS_SLOTS);

        let pool = decoder.pool().unwrap();
        assert_eq!(pool.num_decode_slots(), 6);
        assert!(pool.has_rotator_slots());
        assert_eq!(engine.state().registered.len(), 6);

        let indices = decoder
            .sink()
            .pushed
            .iter()
            .map(|p| p.index.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(indices.len(), 3);
        assert!(indices.iter().all(|&i| i >= 6));
        let rotator = engine.state().last_params.as_ref().unwrap().rotator.unwrap();
        assert_eq!(rotator.rotation, Rotation::Rotate90);
        assert_eq!(rotator.stride, 240);
    }

    #[test]
    fn end_of_stream_drains_every_picture() {
        let engine = DummyEngine::new();
        engine.state().reorder_delay = 1;
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        for n in 0..3 {
            feed(&mut decoder, n).unwrap();
        }
        assert_eq!(decoder.sink().pushed.len(), 2);

        decoder.handle_event(StreamEvent::EndOfStream).unwrap();
        assert_eq!(pts_of(decoder.sink()), vec![frame(0), frame(1), frame(2)]);
        assert_eq!(decoder.sink().events, vec![StreamEvent::EndOfStream]);
        let timestamps = decoder.timestamps();
        assert!(timestamps.is_empty());
        assert_eq!(timestamps.received(), timestamps.dequeued());
    }

    #[test]
    fn end_of_stream_before_initialization() {
        let engine = DummyEngine::new();
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        decoder.handle_event(StreamEvent::EndOfStream).unwrap();
        assert_eq!(decoder.sink().events, vec![StreamEvent::EndOfStream]);
        assert_eq!(engine.state().start_count, 0);
        assert!(!decoder.is_halted());
    }

    #[test]
    fn unsupported_input_is_reported() {
        let engine = DummyEngine::new();
        let mut decoder = VpuDecoder::new(
            engine,
            TestSink::default(),
            test_config(),
            Arc::new(SystemDmaAllocator::new()),
        )
        .unwrap();

        let err = decoder
            .set_format(StreamFormat::new("video/x-vp9"))
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Codec(CodecError::UnsupportedMime(_))
        ));
        assert_eq!(
            decoder.sink().errors[0].0,
            ErrorCategory::UnsupportedFormat
        );
    }

    #[test]
    fn repeated_decode_errors_are_fatal() {
        let engine = DummyEngine::new();
        let failed = OutputInfo {
            status: DecodeStatus::Error(-3),
            ..Default::default()
        };
        engine.push_script(vec![
            ScriptedOutput::from(failed);
            MAX_CONSECUTIVE_DECODE_ERRORS as usize + 1
        ]);
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), file_play_format());

        for n in 0..MAX_CONSECUTIVE_DECODE_ERRORS as u64 {
            feed(&mut decoder, n).unwrap();
        }
        let err = feed(&mut decoder, 99).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Session(SessionError::DecodeFailed(-3))
        ));
        assert_eq!(decoder.sink().errors[0].0, ErrorCategory::Decode);
    }

    #[test]
    fn geometry_change_reallocates_frame_buffers() {
        let engine = DummyEngine::new();
        let mut decoder = new_decoder(&engine, test_config(), Default::default(), streaming_format());

        feed(&mut decoder, 0).unwrap();
        let old_pool = decoder.pool().unwrap().clone();

        // The streaming flush resets the session, so the next input initializes it again.
        decoder.handle_event(StreamEvent::FlushStart).unwrap();
        decoder.handle_event(StreamEvent::FlushStop).unwrap();
        engine.state().geometry.pic_size = Resolution::from((640, 480));
        let opens = engine.state().open_count;
        feed(&mut decoder, 1).unwrap();

        assert_eq!(
            decoder.output_caps().unwrap().coded_size,
            Resolution::from((640, 480))
        );
        assert_eq!(old_pool.counts().free, old_pool.len());
        assert_eq!(engine.state().open_count, opens + 1);
        assert_eq!(pts_of(decoder.sink()), vec![frame(0), frame(1)]);
    }

    #[test]
    fn stopping_retires_the_pool() {
        let engine = DummyEngine::new();
        let config = DecoderConfig {
            profiling: true,
            ..test_config()
        };
        let sink = TestSink {
            hold: true,
            ..Default::default()
        };
        let mut decoder = new_decoder(&engine, config, sink, file_play_format());

        feed(&mut decoder, 0).unwrap();
        let pool = decoder.pool().unwrap().clone();
        decoder.change_state(StateChange::PausedToReady).unwrap();

        assert_eq!(decoder.state(), ControllerState::Closed);
        assert!(decoder.pool().is_none());
        assert!(decoder.output_caps().is_none());
        assert!(!engine.state().open);
        assert_eq!(pool.counts().free, pool.len());

        // Frames still held downstream remain readable.
        assert_eq!(decoder.sink().held[0].as_bytes().len(), 320 * 240 * 3 / 2);
        decoder.sink_mut().held.clear();

        decoder.change_state(StateChange::ReadyToNull).unwrap();
        assert!(!engine.state().initialized_system);
    }

    fn decode_six_frames(parallelization: bool) -> (Vec<Option<u64>>, u32) {
        let engine = DummyEngine::new();
        engine.state().reorder_delay = 2;
        let config = DecoderConfig {
            parallelization,
            ..test_config()
        };
        let mut decoder = new_decoder(&engine, config, Default::default(), file_play_format());
        for n in 0..6 {
            feed(&mut decoder, n).unwrap();
        }
        decoder.handle_event(StreamEvent::EndOfStream).unwrap();
        let start_count = engine.state().start_count;
        (pts_of(decoder.sink()), start_count)
    }

    #[test]
    fn threaded_relay_matches_inline_execution() {
        let inline = decode_six_frames(false);
        let threaded = decode_six_frames(true);
        assert_eq!(inline.0, (0..6).map(frame).collect::<Vec<_>>());
        assert_eq!(inline, threaded);
    }
}
