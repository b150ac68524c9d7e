use std::ffi::CString;
use std::path::Path;
use std::ptr;
use std::sync::Mutex;

use libc::c_uint;
use rsmpeg::avcodec::{AVCodecContext, AVPacket};
use rsmpeg::avformat::AVFormatContextOutput;
use rsmpeg::ffi;

use crate::error::{CaptureError, Result};
use crate::flags::AvFormatFlags;
use crate::MediaKind;

/// Muxer lifecycle. Streams can only be registered before the header is
/// written; packets only after; the trailer exactly once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Lifecycle {
    Built,
    StreamsAdded,
    HeaderWritten,
    TrailerWritten,
}

struct StreamEntry {
    index: usize,
    encoder_time_base: ffi::AVRational,
}

struct MuxerInner {
    output: Option<AVFormatContextOutput>,
    lifecycle: Lifecycle,
    /// The interleaver was flushed; required before the trailer.
    flushed: bool,
    video: Option<StreamEntry>,
    audio: Option<StreamEntry>,
}

/// Owns the output container and interleaves packets from both media kinds
/// into it.
///
/// All writes go through one mutex since the backend's interleaver is not
/// reentrant. Stream registration is part of setup and also runs under the
/// same lock.
pub struct Muxer {
    inner: Mutex<MuxerInner>,
    global_header: bool,
    destination: String,
}

impl Muxer {
    /// Create the output container for a filesystem path. The container
    /// format is derived from the path extension.
    pub fn new(destination: impl AsRef<Path>) -> Result<Self> {
        let destination = destination.as_ref().to_string_lossy().into_owned();
        let path = CString::new(destination.as_str())
            .map_err(|_| CaptureError::InvalidConfig("output path contains NUL".to_string()))?;
        let output = AVFormatContextOutput::create(&path, None).map_err(|e| {
            CaptureError::Io(format!("cannot create output file {}: {}", destination, e))
        })?;

        let global_header = AvFormatFlags::from_bits_truncate(output.oformat().flags as c_uint)
            .contains(AvFormatFlags::GLOBAL_HEADER);

        Ok(Self {
            inner: Mutex::new(MuxerInner {
                output: Some(output),
                lifecycle: Lifecycle::Built,
                flushed: false,
                video: None,
                audio: None,
            }),
            global_header,
            destination,
        })
    }

    /// Whether encoders feeding this container must emit global headers.
    #[inline]
    pub fn global_header(&self) -> bool {
        self.global_header
    }

    /// Register the video output stream from an opened encoder context.
    pub fn add_video_stream(&self, encode_ctx: &AVCodecContext) -> Result<()> {
        self.add_stream(MediaKind::Video, encode_ctx)
    }

    /// Register the audio output stream from an opened encoder context.
    pub fn add_audio_stream(&self, encode_ctx: &AVCodecContext) -> Result<()> {
        self.add_stream(MediaKind::Audio, encode_ctx)
    }

    fn add_stream(&self, kind: MediaKind, encode_ctx: &AVCodecContext) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.lifecycle {
            Lifecycle::Built | Lifecycle::StreamsAdded => {}
            _ => return Err(CaptureError::InvalidState("stream added after header")),
        }
        let slot_taken = match kind {
            MediaKind::Video => inner.video.is_some(),
            MediaKind::Audio => inner.audio.is_some(),
        };
        if slot_taken {
            return Err(CaptureError::InvalidState("stream registered twice"));
        }

        let output = inner.output.as_mut().unwrap();
        let index = {
            let mut stream = output.new_stream();
            stream.set_codecpar(encode_ctx.extract_codecpar());
            stream.set_time_base(encode_ctx.time_base);
            stream.index as usize
        };

        let entry = StreamEntry {
            index,
            encoder_time_base: encode_ctx.time_base,
        };
        match kind {
            MediaKind::Video => inner.video = Some(entry),
            MediaKind::Audio => inner.audio = Some(entry),
        }
        inner.lifecycle = Lifecycle::StreamsAdded;
        Ok(())
    }

    /// Write the container header. Valid once, after at least one stream
    /// was registered.
    pub fn open_file(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::StreamsAdded {
            return Err(CaptureError::InvalidState(
                "header requires registered streams and no prior header",
            ));
        }
        inner
            .output
            .as_mut()
            .unwrap()
            .write_header(&mut None)
            .map_err(|e| CaptureError::Io(format!("cannot write header: {}", e)))?;
        inner.lifecycle = Lifecycle::HeaderWritten;
        tracing::info!(destination = %self.destination, "output file opened");
        Ok(())
    }

    /// Rescale a packet from its encoder's time base into the output
    /// stream's time base and hand it to the interleaved writer.
    pub fn write_packet(&self, mut packet: AVPacket, kind: MediaKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::HeaderWritten {
            return Err(CaptureError::InvalidState("packet written outside header..trailer"));
        }
        let entry = match kind {
            MediaKind::Video => inner.video.as_ref(),
            MediaKind::Audio => inner.audio.as_ref(),
        }
        .ok_or(CaptureError::InvalidState("no output stream for packet kind"))?;
        let index = entry.index;
        let encoder_time_base = entry.encoder_time_base;

        let output = inner.output.as_mut().unwrap();
        let stream_time_base = output.streams()[index].time_base;
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet.set_stream_index(index as i32);
        packet.set_pos(-1);

        output
            .interleaved_write_frame(&mut packet)
            .map_err(|e| CaptureError::Io(format!("cannot write {} packet: {}", kind.label(), e)))?;
        // The interleaver holds this packet until the next flush.
        inner.flushed = false;
        Ok(())
    }

    /// Flush the interleaving queue to the file.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::HeaderWritten {
            return Err(CaptureError::InvalidState("flush outside header..trailer"));
        }
        let output = inner.output.as_mut().unwrap();
        let res = unsafe { ffi::av_interleaved_write_frame(output.as_mut_ptr(), ptr::null_mut()) };
        if res < 0 {
            return Err(CaptureError::Io(format!(
                "cannot flush interleaver (averror {})",
                res
            )));
        }
        inner.flushed = true;
        Ok(())
    }

    /// Write the trailer and close the file. Must run after the pipeline's
    /// flush, otherwise late packets would be rejected. Valid exactly once.
    pub fn close_file(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::HeaderWritten {
            return Err(CaptureError::InvalidState(
                "trailer requires a written header and no prior trailer",
            ));
        }
        if !inner.flushed {
            return Err(CaptureError::InvalidState(
                "trailer requires a flushed interleaver",
            ));
        }
        let mut output = inner.output.take().unwrap();
        output
            .write_trailer()
            .map_err(|e| CaptureError::Io(format!("cannot write trailer: {}", e)))?;
        inner.lifecycle = Lifecycle::TrailerWritten;
        tracing::info!(destination = %self.destination, "output file finalized");
        Ok(())
    }

    /// Time base of the video output stream, once registered.
    pub fn video_time_base(&self) -> Option<ffi::AVRational> {
        self.stream_time_base(MediaKind::Video)
    }

    /// Time base of the audio output stream, once registered.
    pub fn audio_time_base(&self) -> Option<ffi::AVRational> {
        self.stream_time_base(MediaKind::Audio)
    }

    fn stream_time_base(&self, kind: MediaKind) -> Option<ffi::AVRational> {
        let inner = self.inner.lock().unwrap();
        let entry = match kind {
            MediaKind::Video => inner.video.as_ref(),
            MediaKind::Audio => inner.audio.as_ref(),
        }?;
        let output = inner.output.as_ref()?;
        Some(output.streams()[entry.index].time_base)
    }
}

unsafe impl Send for Muxer {}
unsafe impl Sync for Muxer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{Encoder, VideoSettings};

    fn tmp_output(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn header_requires_streams() {
        let (_dir, path) = tmp_output("empty.mp4");
        let muxer = Muxer::new(&path).unwrap();
        assert!(matches!(
            muxer.open_file(),
            Err(CaptureError::InvalidState(_))
        ));
    }

    #[test]
    fn packet_rejected_before_header() {
        let (_dir, path) = tmp_output("early.mp4");
        let muxer = Muxer::new(&path).unwrap();
        assert!(matches!(
            muxer.write_packet(AVPacket::new(), MediaKind::Video),
            Err(CaptureError::InvalidState(_))
        ));
    }

    #[test]
    fn trailer_requires_a_prior_flush() {
        let (_dir, path) = tmp_output("unflushed.mp4");
        let muxer = Muxer::new(&path).unwrap();
        let encoder =
            Encoder::new_video(&VideoSettings::preset_h264_yuv420p(64, 64, 30), muxer.global_header())
                .unwrap();
        muxer.add_video_stream(encoder.codec_context()).unwrap();
        muxer.open_file().unwrap();
        assert!(matches!(
            muxer.close_file(),
            Err(CaptureError::InvalidState(_))
        ));
        muxer.flush().unwrap();
        muxer.close_file().unwrap();
    }

    #[test]
    fn trailer_written_exactly_once() {
        let (_dir, path) = tmp_output("lifecycle.mp4");
        let muxer = Muxer::new(&path).unwrap();
        let encoder =
            Encoder::new_video(&VideoSettings::preset_h264_yuv420p(64, 64, 30), muxer.global_header())
                .unwrap();
        muxer.add_video_stream(encoder.codec_context()).unwrap();
        muxer.open_file().unwrap();
        muxer.flush().unwrap();
        muxer.close_file().unwrap();
        assert!(matches!(
            muxer.close_file(),
            Err(CaptureError::InvalidState(_))
        ));
        assert!(path.metadata().unwrap().len() > 0);
    }

    #[test]
    fn streams_cannot_be_added_after_header() {
        let (_dir, path) = tmp_output("late_stream.mp4");
        let muxer = Muxer::new(&path).unwrap();
        let encoder =
            Encoder::new_video(&VideoSettings::preset_h264_yuv420p(64, 64, 30), muxer.global_header())
                .unwrap();
        muxer.add_video_stream(encoder.codec_context()).unwrap();
        muxer.open_file().unwrap();
        assert!(matches!(
            muxer.add_video_stream(encoder.codec_context()),
            Err(CaptureError::InvalidState(_))
        ));
        muxer.flush().unwrap();
        muxer.close_file().unwrap();
    }
}
