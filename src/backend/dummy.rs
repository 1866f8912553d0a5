// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy engine whose only purpose is to let the decoder run so we can test
//! it in isolation.
//!
//! The engine does not decode anything. It tracks the bitstream ring buffer offsets, hands out
//! frame buffer indices in the order a reordering decoder would, and can be configured to stall,
//! fail or report arbitrary output through a script. Clones share the same state, so a test can
//! keep one to inspect what the decoder did with the other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use crate::backend::BitstreamStatus;
use crate::backend::DecParams;
use crate::backend::DecodeStatus;
use crate::backend::DecodedIndex;
use crate::backend::DisplayIndex;
use crate::backend::EngineError;
use crate::backend::EngineResult;
use crate::backend::EngineVersion;
use crate::backend::FrameBufferDesc;
use crate::backend::InitialInfo;
use crate::backend::OpenParams;
use crate::backend::OutputInfo;
use crate::backend::PicType;
use crate::backend::SkipFrames;
use crate::backend::VpuEngine;
use crate::utils::lock;
use crate::video_frame::ChromaFormat;
use crate::Fraction;
use crate::Resolution;

/// Output reported by one decode, in place of the automatic behavior.
#[derive(Clone, Debug)]
pub struct ScriptedOutput {
    pub info: OutputInfo,
    /// Number of interrupt waits that time out before the decode completes.
    pub busy_polls: u32,
}

impl From<OutputInfo> for ScriptedOutput {
    fn from(info: OutputInfo) -> Self {
        Self {
            info,
            busy_polls: 0,
        }
    }
}

/// Configuration and observable state of a [`DummyEngine`].
#[derive(Debug)]
pub struct DummyState {
    // Configuration.
    pub geometry: InitialInfo,
    /// Bytes that must have been written since open before the stream geometry is known.
    pub init_threshold: usize,
    /// Number of initialization attempts that fail before one succeeds.
    pub init_failures: u32,
    pub fail_open: bool,
    /// Number of decoded pictures held back before the first one is displayed.
    pub reorder_delay: usize,
    /// Every n-th automatic picture is a B picture. All the others after the first are P.
    pub b_frame_interval: Option<u32>,
    /// Bytes consumed by one streaming-mode decode. `None` consumes everything available.
    pub bytes_per_frame: Option<usize>,
    /// Interrupt waits that time out before each automatic decode completes.
    pub busy_polls: u32,
    /// Decodes never complete.
    pub always_busy: bool,
    /// The ring buffer reports no free space.
    pub force_ring_full: bool,
    /// Number of close attempts rejected as busy even though no decode is running.
    pub close_busy_attempts: u32,
    /// Outputs returned by the next decodes, before falling back to the automatic behavior.
    pub script: VecDeque<ScriptedOutput>,

    // Observed state.
    pub initialized_system: bool,
    pub open: bool,
    pub open_params: Option<OpenParams>,
    pub open_count: u32,
    pub close_count: u32,
    pub stream_initialized: bool,
    pub initial_info_calls: u32,
    pub registered: Vec<FrameBufferDesc>,
    pub register_count: u32,
    pub start_count: u32,
    /// Start commands issued while a decode was already running.
    pub overlapping_starts: u32,
    pub last_params: Option<DecParams>,
    pub wait_calls: u32,
    pub flush_count: u32,
    /// Indices passed to `clear_display_flag`, in call order.
    pub cleared: Vec<usize>,
    /// Frame buffers written by the engine and not cleared yet.
    pub in_use: Vec<bool>,
    pub reorder: VecDeque<usize>,
    pub ring_capacity: usize,
    pub read_offset: usize,
    pub write_offset: usize,
    pub available: usize,
    /// Total number of bytes written since open.
    pub fed: usize,
    pub consumed: usize,
    pub eos: bool,
    pub decoding: bool,
    pub remaining_polls: u32,
    pub result: Option<OutputInfo>,
    pub decoded_frames: u32,
}

impl Default for DummyState {
    fn default() -> Self {
        Self {
            geometry: InitialInfo {
                pic_size: Resolution::from((320, 240)),
                frame_rate: Some(Fraction::new(30, 1)),
                min_frame_count: 4,
                crop: None,
                interlaced: false,
                aspect_code: 0,
                chroma: ChromaFormat::Yuv420,
                profile: 0,
                level: 0,
            },
            init_threshold: 1,
            init_failures: 0,
            fail_open: false,
            reorder_delay: 0,
            b_frame_interval: None,
            bytes_per_frame: None,
            busy_polls: 0,
            always_busy: false,
            force_ring_full: false,
            close_busy_attempts: 0,
            script: Default::default(),
            initialized_system: false,
            open: false,
            open_params: None,
            open_count: 0,
            close_count: 0,
            stream_initialized: false,
            initial_info_calls: 0,
            registered: Default::default(),
            register_count: 0,
            start_count: 0,
            overlapping_starts: 0,
            last_params: None,
            wait_calls: 0,
            flush_count: 0,
            cleared: Default::default(),
            in_use: Default::default(),
            reorder: Default::default(),
            ring_capacity: 0,
            read_offset: 0,
            write_offset: 0,
            available: 0,
            fed: 0,
            consumed: 0,
            eos: false,
            decoding: false,
            remaining_polls: 0,
            result: None,
            decoded_frames: 0,
        }
    }
}

impl DummyState {
    fn is_file_play(&self) -> bool {
        self.open_params.as_ref().is_some_and(|p| p.file_play)
    }

    fn consume(&mut self, len: usize) {
        let len = len.min(self.available);
        self.available -= len;
        self.consumed += len;
        if self.ring_capacity > 0 {
            self.read_offset = (self.read_offset + len) % self.ring_capacity;
        }
    }

    fn reset_stream(&mut self) {
        self.stream_initialized = false;
        self.registered.clear();
        self.in_use.clear();
        self.reorder.clear();
        self.read_offset = 0;
        self.write_offset = 0;
        self.available = 0;
        self.fed = 0;
        self.eos = false;
        self.decoding = false;
        self.result = None;
    }

    fn next_picture_type(&self, params: &DecParams) -> PicType {
        if self.decoded_frames == 0 || params.iframe_search {
            return PicType::I;
        }
        match self.b_frame_interval {
            Some(n) if n > 0 && self.decoded_frames % n == n - 1 => PicType::B,
            _ => PicType::P,
        }
    }

    /// Decodes one picture the way a reordering decoder with `reorder_delay` pictures of latency
    /// would.
    fn automatic_output(&mut self, params: &DecParams) -> OutputInfo {
        let mut info = OutputInfo::default();

        if self.available == 0 {
            if !self.eos {
                info.status = DecodeStatus::NeedMoreData;
                return info;
            }
            info.display = match self.reorder.pop_front() {
                Some(index) => DisplayIndex::Frame(index),
                None => DisplayIndex::EndOfSequence,
            };
            return info;
        }

        let pic_type = self.next_picture_type(params);
        let skipped = match params.skip {
            SkipFrames::None => false,
            SkipFrames::B => pic_type == PicType::B,
            SkipFrames::BAndP => matches!(pic_type, PicType::B | PicType::P),
        };

        let target = (0..self.registered.len()).find(|&i| !self.in_use[i]);
        if target.is_none() && !skipped {
            info.decoded = DecodedIndex::NoFrameBuffer;
            return info;
        }

        let len = params
            .chunk_size
            .or(self.bytes_per_frame)
            .unwrap_or(self.available);
        self.consume(len);
        info.consumed_bytes = len;
        info.pic_type = pic_type;
        self.decoded_frames += 1;

        let Some(target) = target.filter(|_| !skipped) else {
            info.decoded = DecodedIndex::Skipped;
            return info;
        };
        self.in_use[target] = true;
        self.reorder.push_back(target);
        info.decoded = DecodedIndex::Frame(target);
        info.interlaced = self.geometry.interlaced;

        if self.reorder.len() > self.reorder_delay {
            if let Some(index) = self.reorder.pop_front() {
                info.display = DisplayIndex::Frame(index);
            }
        }

        info
    }
}

/// Stand-in engine for tests and demos.
#[derive(Clone, Debug, Default)]
pub struct DummyEngine {
    state: Arc<Mutex<DummyState>>,
}

impl DummyEngine {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_state(state: DummyState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Shared configuration and state of this engine and all its clones.
    pub fn state(&self) -> MutexGuard<'_, DummyState> {
        lock(&self.state)
    }

    /// Queues `outputs` to be returned by the next decodes.
    pub fn push_script<I: IntoIterator<Item = ScriptedOutput>>(&self, outputs: I) {
        self.state().script.extend(outputs);
    }

    /// Puts the engine in the state it has after a successful initialization, with `frames` as
    /// the minimum number of frame buffers.
    pub fn prepare_for_registration(&mut self, frames: usize) {
        let mut state = self.state();
        state.open = true;
        state.stream_initialized = true;
        state.geometry.min_frame_count = frames;
    }
}

impl VpuEngine for DummyEngine {
    fn init(&mut self) -> EngineResult<()> {
        self.state().initialized_system = true;
        Ok(())
    }

    fn uninit(&mut self) {
        self.state().initialized_system = false;
    }

    fn version(&self) -> EngineResult<EngineVersion> {
        Ok(EngineVersion {
            firmware: (1, 4, 50),
            library: String::from("dummy-5.4"),
        })
    }

    fn open(&mut self, params: &OpenParams) -> EngineResult<()> {
        let mut state = self.state();
        if state.fail_open {
            return Err(EngineError::Failure(-2));
        }
        if state.open {
            return Err(EngineError::InvalidParam(String::from("instance already open")));
        }
        if params.bitstream_size == 0 {
            return Err(EngineError::InvalidParam(String::from("empty bitstream buffer")));
        }

        state.reset_stream();
        state.open = true;
        state.open_count += 1;
        state.ring_capacity = params.bitstream_size;
        state.decoded_frames = 0;
        state.open_params = Some(params.clone());
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(EngineError::InvalidHandle);
        }
        if state.decoding {
            return Err(EngineError::Busy);
        }
        if state.close_busy_attempts > 0 {
            state.close_busy_attempts -= 1;
            return Err(EngineError::Busy);
        }

        state.reset_stream();
        state.open = false;
        state.close_count += 1;
        Ok(())
    }

    fn initial_info(&mut self) -> EngineResult<InitialInfo> {
        let mut state = self.state();
        if !state.open {
            return Err(EngineError::InvalidHandle);
        }
        state.initial_info_calls += 1;
        if state.fed < state.init_threshold {
            return Err(EngineError::NotEnoughData);
        }
        if state.init_failures > 0 {
            state.init_failures -= 1;
            return Err(EngineError::Failure(-1));
        }

        state.stream_initialized = true;
        Ok(state.geometry.clone())
    }

    fn register_frame_buffers(
        &mut self,
        frames: &[FrameBufferDesc],
        _stride: usize,
    ) -> EngineResult<()> {
        let mut state = self.state();
        if !state.open || !state.stream_initialized {
            return Err(EngineError::InvalidHandle);
        }
        if !state.registered.is_empty() {
            return Err(EngineError::InvalidParam(String::from("frame buffers already registered")));
        }
        if frames.len() < state.geometry.min_frame_count {
            return Err(EngineError::InvalidParam(format!(
                "{} frame buffers registered, {} needed",
                frames.len(),
                state.geometry.min_frame_count
            )));
        }

        state.registered = frames.to_vec();
        state.in_use = vec![false; frames.len()];
        state.register_count += 1;
        Ok(())
    }

    fn bitstream_status(&mut self) -> EngineResult<BitstreamStatus> {
        let state = self.state();
        if !state.open {
            return Err(EngineError::InvalidHandle);
        }
        let free = if state.force_ring_full {
            0
        } else {
            state.ring_capacity - state.available
        };
        Ok(BitstreamStatus {
            read_offset: state.read_offset,
            write_offset: state.write_offset,
            free,
        })
    }

    fn update_bitstream(&mut self, size: usize) -> EngineResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(EngineError::InvalidHandle);
        }
        if size == 0 {
            state.eos = true;
            return Ok(());
        }

        if state.is_file_play() {
            // Every unit is written at the start of the buffer.
            state.read_offset = 0;
            state.available = 0;
            state.write_offset = 0;
        }
        if size > state.ring_capacity - state.available {
            return Err(EngineError::InvalidParam(format!(
                "{} bytes written with only {} free",
                size,
                state.ring_capacity - state.available
            )));
        }

        state.available += size;
        state.fed += size;
        state.write_offset = (state.write_offset + size) % state.ring_capacity;
        Ok(())
    }

    fn flush_bitstream(&mut self) -> EngineResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(EngineError::InvalidHandle);
        }
        state.read_offset = 0;
        state.write_offset = 0;
        state.available = 0;
        state.eos = false;
        state.flush_count += 1;
        if state.decoding {
            // Starved of data, the running decode gives up.
            state.decoding = false;
            state.result = None;
        }
        Ok(())
    }

    fn start_one_frame(&mut self, params: &DecParams) -> EngineResult<()> {
        let mut state = self.state();
        if !state.open || state.registered.is_empty() {
            return Err(EngineError::InvalidHandle);
        }
        if state.decoding {
            state.overlapping_starts += 1;
            return Err(EngineError::Busy);
        }

        state.start_count += 1;
        state.last_params = Some(params.clone());

        let (info, busy_polls) = match state.script.pop_front() {
            Some(scripted) => {
                if scripted.info.status != DecodeStatus::NeedMoreData {
                    let len = params
                        .chunk_size
                        .or(state.bytes_per_frame)
                        .unwrap_or(state.available);
                    state.consume(len);
                }
                if let DecodedIndex::Frame(index) = scripted.info.decoded {
                    if let Some(in_use) = state.in_use.get_mut(index) {
                        *in_use = true;
                    }
                }
                (scripted.info, scripted.busy_polls)
            }
            None => {
                let info = state.automatic_output(params);
                (info, state.busy_polls)
            }
        };

        state.result = Some(info);
        state.decoding = true;
        state.remaining_polls = busy_polls;
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        self.state().decoding
    }

    fn wait_for_interrupt(&mut self, _timeout: Duration) -> bool {
        let mut state = self.state();
        state.wait_calls += 1;
        if !state.decoding {
            return false;
        }
        if state.always_busy {
            return false;
        }
        if state.remaining_polls > 0 {
            state.remaining_polls -= 1;
            return false;
        }
        state.decoding = false;
        true
    }

    fn output_info(&mut self) -> EngineResult<OutputInfo> {
        let mut state = self.state();
        if state.decoding {
            return Err(EngineError::Busy);
        }
        state
            .result
            .take()
            .ok_or_else(|| EngineError::InvalidParam(String::from("no decode to report")))
    }

    fn clear_display_flag(&mut self, index: usize) -> EngineResult<()> {
        let mut state = self.state();
        if index >= state.in_use.len() {
            return Err(EngineError::InvalidParam(format!(
                "frame buffer {index} is not registered"
            )));
        }
        state.in_use[index] = false;
        state.cleared.push(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CodecStd;

    fn open_params(file_play: bool) -> OpenParams {
        OpenParams {
            std: CodecStd::Avc,
            bitstream_addr: 0x1000,
            bitstream_size: 1024,
            ps_save_addr: None,
            ps_save_size: 0,
            file_play,
            reorder: true,
            chroma_interleave: false,
            mp4_deblock: false,
            mp4_class: 0,
        }
    }

    fn frames(n: usize) -> Vec<FrameBufferDesc> {
        (0..n)
            .map(|index| FrameBufferDesc {
                index,
                y_addr: 0,
                cb_addr: 0,
                cr_addr: 0,
                mv_addr: 0,
            })
            .collect()
    }

    fn decode(engine: &mut DummyEngine) -> OutputInfo {
        decode_skipping(engine, SkipFrames::None)
    }

    fn decode_skipping(engine: &mut DummyEngine, skip: SkipFrames) -> OutputInfo {
        let params = DecParams {
            skip,
            ..Default::default()
        };
        engine.start_one_frame(&params).unwrap();
        while !engine.wait_for_interrupt(Duration::from_millis(33)) {}
        engine.output_info().unwrap()
    }

    #[test]
    fn reordering_latency() {
        let mut engine = DummyEngine::new();
        engine.state().reorder_delay = 1;
        engine.state().bytes_per_frame = Some(100);

        engine.open(&open_params(false)).unwrap();
        assert!(matches!(
            engine.register_frame_buffers(&frames(4), 320),
            Err(EngineError::InvalidHandle)
        ));
        engine.update_bitstream(300).unwrap();
        engine.initial_info().unwrap();
        engine.register_frame_buffers(&frames(4), 320).unwrap();

        let first = decode(&mut engine);
        assert_eq!(first.decoded, DecodedIndex::Frame(0));
        assert_eq!(first.display, DisplayIndex::None);

        let second = decode(&mut engine);
        assert_eq!(second.decoded, DecodedIndex::Frame(1));
        assert_eq!(second.display, DisplayIndex::Frame(0));

        engine.clear_display_flag(0).unwrap();
        let third = decode(&mut engine);
        assert_eq!(third.decoded, DecodedIndex::Frame(0));

        assert_eq!(decode(&mut engine).status, DecodeStatus::NeedMoreData);
        engine.update_bitstream(0).unwrap();
        assert_eq!(decode(&mut engine).display, DisplayIndex::Frame(0));
        assert_eq!(decode(&mut engine).display, DisplayIndex::EndOfSequence);
    }

    #[test]
    fn skipped_pictures_consume_input() {
        let mut engine = DummyEngine::new();
        engine.state().b_frame_interval = Some(2);
        engine.state().bytes_per_frame = Some(100);

        engine.open(&open_params(false)).unwrap();
        engine.update_bitstream(400).unwrap();
        engine.initial_info().unwrap();
        engine.register_frame_buffers(&frames(4), 320).unwrap();

        let intra = decode_skipping(&mut engine, SkipFrames::BAndP);
        assert_eq!(intra.pic_type, PicType::I);
        assert_eq!(intra.decoded, DecodedIndex::Frame(0));

        let b = decode_skipping(&mut engine, SkipFrames::B);
        assert_eq!(b.pic_type, PicType::B);
        assert_eq!(b.decoded, DecodedIndex::Skipped);
        assert_eq!(b.display, DisplayIndex::None);
        assert_eq!(b.consumed_bytes, 100);

        let p = decode_skipping(&mut engine, SkipFrames::B);
        assert_eq!(p.pic_type, PicType::P);
        assert_eq!(p.decoded, DecodedIndex::Frame(1));

        let b = decode_skipping(&mut engine, SkipFrames::BAndP);
        assert_eq!(b.decoded, DecodedIndex::Skipped);
        let state = engine.state();
        assert_eq!(state.available, 0);
        assert_eq!(state.in_use, vec![true, true, false, false]);
    }

    #[test]
    fn busy_engine_cannot_close() {
        let mut engine = DummyEngine::new();
        engine.state().always_busy = true;
        engine.open(&open_params(true)).unwrap();
        engine.update_bitstream(10).unwrap();
        engine.initial_info().unwrap();
        engine.register_frame_buffers(&frames(4), 320).unwrap();

        engine.start_one_frame(&Default::default()).unwrap();
        assert!(!engine.wait_for_interrupt(Duration::ZERO));
        assert!(matches!(engine.output_info(), Err(EngineError::Busy)));
        assert!(matches!(engine.close(), Err(EngineError::Busy)));
        assert!(matches!(
            engine.start_one_frame(&Default::default()),
            Err(EngineError::Busy)
        ));
        assert_eq!(engine.state().overlapping_starts, 1);

        engine.flush_bitstream().unwrap();
        engine.close().unwrap();
        assert_eq!(engine.state().close_count, 1);
    }
}
