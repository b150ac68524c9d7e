pub mod convert;
pub mod decode;
pub mod demux;
pub mod encode;
pub mod error;
mod flags;
pub mod init;
pub mod mux;
pub mod options;
pub mod pipeline;
pub mod recorder;
pub mod stream;

pub use convert::{AudioConverter, VideoConverter};
pub use decode::Decoder;
pub use demux::{Demuxed, Demuxer, DemuxerBuilder};
pub use encode::{AudioSettings, Encoder, VideoSettings};
pub use error::{CaptureError, Result};
pub use init::init;
pub use mux::Muxer;
pub use options::Options;
pub use pipeline::{Pipeline, StepStatus};
pub use recorder::{CaptureInput, Recorder, RecorderBuilder};
pub use rsmpeg;
pub use rsmpeg::ffi;
pub use stream::{KindParams, StreamParams};

/// Re-export internal `AVFrame` for caller to use.
pub type RawFrame = rsmpeg::avutil::AVFrame;

/// The media kinds the pipeline transcodes. Packets from any other stream
/// kind are dropped at the demuxer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Slot index for the per-kind tables kept by the pipeline.
    pub(crate) fn index(self) -> usize {
        match self {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Outcome of pushing data into a codec-style stage. `Saturated` means the
/// stage wants its output side drained before the same input is retried;
/// it is never an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendState {
    Accepted,
    Saturated,
}

/// pixel format
pub const PIXEL_FORMAT_RGB24: ffi::AVPixelFormat = ffi::AV_PIX_FMT_RGB24;
pub const PIXEL_FORMAT_YUV420P: ffi::AVPixelFormat = ffi::AV_PIX_FMT_YUV420P;
