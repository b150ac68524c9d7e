use rsmpeg::avcodec::AVCodec;
use rsmpeg::avformat::AVFormatContextInput;
use rsmpeg::ffi;

use crate::error::{CaptureError, Result};
use crate::MediaKind;

/// Immutable descriptor of one input stream. Built once per stream when the
/// demuxer opens; everything downstream (decoder, converters, encoder
/// defaults) configures itself from this instead of reaching back into the
/// format context.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub index: usize,
    pub codec_id: ffi::AVCodecID,
    pub time_base: ffi::AVRational,
    pub kind: KindParams,
}

#[derive(Debug, Clone)]
pub enum KindParams {
    Video {
        width: i32,
        height: i32,
        pix_fmt: ffi::AVPixelFormat,
        frame_rate: ffi::AVRational,
    },
    Audio {
        sample_rate: i32,
        sample_fmt: ffi::AVSampleFormat,
        nb_channels: i32,
    },
}

impl StreamParams {
    /// Fetch the descriptor of a stream in an opened input.
    ///
    /// Fails with `InvalidConfig` when the stream is neither video nor
    /// audio, since nothing else can travel through the pipeline.
    pub(crate) fn from_input(input: &AVFormatContextInput, stream_index: usize) -> Result<Self> {
        let stream = input.streams().get(stream_index).ok_or_else(|| {
            CaptureError::InvalidConfig(format!("no stream at index {}", stream_index))
        })?;
        let codecpar = stream.codecpar();

        let kind = match codecpar.codec_type {
            ffi::AVMEDIA_TYPE_VIDEO => KindParams::Video {
                width: codecpar.width,
                height: codecpar.height,
                pix_fmt: codecpar.format,
                frame_rate: stream
                    .guess_framerate()
                    .unwrap_or(ffi::AVRational { num: 30, den: 1 }),
            },
            ffi::AVMEDIA_TYPE_AUDIO => KindParams::Audio {
                sample_rate: codecpar.sample_rate,
                sample_fmt: codecpar.format,
                nb_channels: codecpar.ch_layout.nb_channels,
            },
            _ => {
                return Err(CaptureError::InvalidConfig(format!(
                    "stream {} is neither video nor audio",
                    stream_index
                )))
            }
        };

        Ok(Self {
            index: stream_index,
            codec_id: codecpar.codec_id,
            time_base: stream.time_base,
            kind,
        })
    }

    pub fn media_kind(&self) -> MediaKind {
        match self.kind {
            KindParams::Video { .. } => MediaKind::Video,
            KindParams::Audio { .. } => MediaKind::Audio,
        }
    }
}

impl std::fmt::Display for StreamParams {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let codec_name = AVCodec::find_decoder(self.codec_id)
            .map(|codec| codec.name().to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        match self.kind {
            KindParams::Video {
                width,
                height,
                frame_rate,
                ..
            } => write!(
                f,
                "StreamParams {{ index: {}, codec: {}, {}x{} @ {}/{} fps, time_base: {}/{} }}",
                self.index,
                codec_name,
                width,
                height,
                frame_rate.num,
                frame_rate.den,
                self.time_base.num,
                self.time_base.den,
            ),
            KindParams::Audio {
                sample_rate,
                nb_channels,
                ..
            } => write!(
                f,
                "StreamParams {{ index: {}, codec: {}, {} Hz x{}, time_base: {}/{} }}",
                self.index,
                codec_name,
                sample_rate,
                nb_channels,
                self.time_base.num,
                self.time_base.den,
            ),
        }
    }
}
