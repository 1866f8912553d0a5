// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

use vpu_codecs::codec::StreamFormat;
use vpu_codecs::decoder::DecoderConfig;
use vpu_codecs::decoder::Mirror;
use vpu_codecs::decoder::Rotation;
use vpu_codecs::DecodedFormat;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum InputCodec {
    H264,
    Mpeg2,
    Mpeg4,
    H263,
    Mjpeg,
}

impl FromStr for InputCodec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(InputCodec::H264),
            "mpeg2" | "MPEG2" => Ok(InputCodec::Mpeg2),
            "mpeg4" | "MPEG4" => Ok(InputCodec::Mpeg4),
            "h263" | "H263" => Ok(InputCodec::H263),
            "mjpeg" | "MJPEG" => Ok(InputCodec::Mjpeg),
            _ => Err("unrecognized input codec. Valid values: h264, mpeg2, mpeg4, h263, mjpeg"),
        }
    }
}

#[derive(Debug)]
pub enum Checksum {
    Md5,
    Crc32,
}

impl FromStr for Checksum {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(Checksum::Md5),
            "crc32" => Ok(Checksum::Crc32),
            _ => Err("unrecognized checksum. Valid values: md5, crc32"),
        }
    }
}

/// Runs an elementary stream through the decode pipeline on the software engine
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file
    #[argh(positional)]
    pub input: PathBuf,

    /// codec of the input elementary stream.
    #[argh(option)]
    pub codec: InputCodec,

    /// picture size as reported by a container, e.g. 320x240. Enables file-play input.
    #[argh(option)]
    pub size: Option<String>,

    /// frame rate of the stream, in frames per second. Default: 25
    #[argh(option, default = "25")]
    pub fps: u32,

    /// pixel format to decode into. Default: i420
    #[argh(option, default = "DecodedFormat::I420")]
    pub output_format: DecodedFormat,

    /// rotation applied to the output (0, 90, 180 or 270). Default: 0
    #[argh(option, default = "Rotation::None")]
    pub rotation: Rotation,

    /// mirroring applied to the output (none, vertical, horizontal or both). Default: none
    #[argh(option, default = "Mirror::None")]
    pub mirror: Mirror,

    /// never drop frames, whatever the QoS feedback
    #[argh(switch)]
    pub no_framedrop: bool,

    /// run the hardware waits on a worker thread
    #[argh(switch)]
    pub threaded: bool,

    /// copy the frames out of the hardware buffers instead of rendering them directly
    #[argh(switch)]
    pub copy: bool,

    /// frame buffers allocated on top of the minimum required by the stream. Default: 2
    #[argh(option, default = "2")]
    pub extra_buffers: usize,

    /// output file to write the decoded frames to
    #[argh(option)]
    pub output: Option<PathBuf>,

    /// checksum printed for every frame (md5 or crc32)
    #[argh(option)]
    pub checksum: Option<Checksum>,

    /// log decode statistics at the end of the stream
    #[argh(switch)]
    pub profiling: bool,
}

impl Args {
    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            output_format: self.output_format,
            rotation: self.rotation,
            mirror: self.mirror,
            framedrop: !self.no_framedrop,
            parallelization: self.threaded,
            extra_buffers: self.extra_buffers,
            profiling: self.profiling,
            ..Default::default()
        }
    }

    pub fn stream_format(&self) -> Result<StreamFormat, String> {
        let format = match self.codec {
            InputCodec::H264 => StreamFormat::new("video/x-h264"),
            InputCodec::Mpeg2 => StreamFormat::new("video/mpeg").with_version(2),
            InputCodec::Mpeg4 => StreamFormat::new("video/mpeg").with_version(4),
            InputCodec::H263 => StreamFormat::new("video/x-h263"),
            InputCodec::Mjpeg => StreamFormat::new("image/jpeg"),
        }
        .with_frame_rate(self.fps, 1);

        match &self.size {
            None => Ok(format),
            Some(size) => {
                let (width, height) = parse_size(size)?;
                Ok(format.with_size(width, height))
            }
        }
    }
}

fn parse_size(size: &str) -> Result<(u32, u32), String> {
    let (width, height) = size
        .split_once('x')
        .ok_or_else(|| format!("malformed size {size}, expected WIDTHxHEIGHT"))?;
    let parse = |v: &str| {
        v.parse::<u32>()
            .map_err(|e| format!("malformed size {size}: {e}"))
    };
    Ok((parse(width)?, parse(height)?))
}
