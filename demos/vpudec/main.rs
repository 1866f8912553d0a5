// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vpudec, runs an elementary stream through the decode pipeline on top of the software engine.
//! Prints the negotiated output and optionally a checksum of every frame, and can write the raw
//! frames to a file.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use vpu_codecs::backend::dummy::DummyEngine;
use vpu_codecs::codec::profile_for;
use vpu_codecs::codec::split_access_units;
use vpu_codecs::decoder::controller::VpuDecoder;
use vpu_codecs::decoder::DisplayFrame;
use vpu_codecs::decoder::ErrorCategory;
use vpu_codecs::decoder::FrameSink;
use vpu_codecs::decoder::InputBuffer;
use vpu_codecs::decoder::OutputCaps;
use vpu_codecs::decoder::SinkError;
use vpu_codecs::decoder::StateChange;
use vpu_codecs::decoder::StreamEvent;
use vpu_codecs::video_frame::dma::SystemDmaAllocator;

use crate::util::Args;
use crate::util::Checksum;
use crate::util::InputCodec;

mod util;

const JPEG_SOI: [u8; 2] = [0xff, 0xd8];

struct OutputSink {
    direct: bool,
    checksum: Option<Checksum>,
    output: Option<File>,
    frames: usize,
}

impl FrameSink for OutputSink {
    fn negotiate(&mut self, caps: &OutputCaps) -> bool {
        println!(
            "output: {} {} (visible {}x{}), {} buffers",
            caps.fourcc(),
            caps.coded_size,
            caps.crop.width,
            caps.crop.height,
            caps.num_buffers
        );
        true
    }

    fn supports_direct_render(&self) -> bool {
        self.direct
    }

    fn push(&mut self, frame: DisplayFrame) -> Result<(), SinkError> {
        let data = frame.as_bytes();
        if let Some(output) = &mut self.output {
            output
                .write_all(data)
                .map_err(|e| SinkError::Other(e.into()))?;
        }

        let checksum = match self.checksum {
            None => String::new(),
            Some(Checksum::Md5) => format!(" md5 {:x}", md5::compute(data)),
            Some(Checksum::Crc32) => format!(" crc32 {:08x}", crc32fast::hash(data)),
        };
        println!(
            "frame {:4} pts {:?}{}",
            self.frames,
            frame.pts.map(|pts| pts / 1_000_000),
            checksum
        );
        self.frames += 1;
        Ok(())
    }

    fn post_error(&mut self, category: ErrorCategory, message: &str) {
        eprintln!("{category}: {message}");
    }
}

/// Splits a Motion JPEG stream on its start of image markers.
fn split_jpeg_images(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = data
        .windows(2)
        .enumerate()
        .filter(|(_, w)| **w == JPEG_SOI[..])
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    starts.push(data.len());
    starts.windows(2).map(|w| &data[w[0]..w[1]]).collect()
}

fn main() {
    env_logger::init();

    let mut args: Args = argh::from_env();

    let input = {
        let mut file = File::open(&args.input).expect("error opening input file");
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).expect("error reading input file");
        buf
    };
    let format = args.stream_format().expect("invalid stream description");
    let frame_ns = 1_000_000_000 / u64::from(args.fps.max(1));

    let profile = profile_for(&format).expect("unsupported stream");
    let units = if args.codec == InputCodec::Mjpeg {
        split_jpeg_images(&input)
    } else {
        split_access_units(profile.as_ref(), &input).collect()
    };

    let sink = OutputSink {
        direct: !args.copy,
        checksum: args.checksum.take(),
        output: args
            .output
            .as_ref()
            .map(|p| File::create(p).expect("error creating output file")),
        frames: 0,
    };

    let mut decoder = VpuDecoder::new(
        DummyEngine::new(),
        sink,
        args.decoder_config(),
        Arc::new(SystemDmaAllocator::new()),
    )
    .expect("failed to create decoder");

    decoder
        .change_state(StateChange::NullToReady)
        .expect("failed to bring up the engine");
    decoder
        .change_state(StateChange::ReadyToPaused)
        .expect("failed to start the pipeline");
    decoder.set_format(format).expect("unsupported stream");
    decoder
        .handle_event(StreamEvent::NewSegment {
            rate: 1.0,
            start: 0,
        })
        .expect("failed to start the segment");

    for (i, unit) in units.iter().enumerate() {
        let buffer = InputBuffer::new(unit.to_vec(), Some(i as u64 * frame_ns));
        if let Err(e) = decoder.chain(buffer) {
            eprintln!("decoding stopped at access unit {i}: {e}");
            break;
        }
    }

    decoder
        .handle_event(StreamEvent::EndOfStream)
        .expect("failed to drain the decoder");

    let stats = decoder.stats().clone();
    println!(
        "{} access units, {} decoded, {} rendered, {} dropped",
        units.len(),
        stats.decoded,
        stats.rendered,
        stats.dropped
    );

    decoder
        .change_state(StateChange::PausedToReady)
        .expect("failed to stop the pipeline");
    decoder
        .change_state(StateChange::ReadyToNull)
        .expect("failed to release the engine");
}
