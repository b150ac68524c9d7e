use std::ffi::CString;

use rsmpeg::avcodec::{AVCodec, AVCodecContext, AVCodecRef, AVPacket};
use rsmpeg::avutil::{ra, AVChannelLayout, AVFrame};
use rsmpeg::error::RsmpegError;
use rsmpeg::ffi;

use crate::error::{CaptureError, Result};
use crate::flags::AvCodecFlags;
use crate::options::Options;
use crate::{MediaKind, SendState};

/// Holds a logical combination of video encoder settings.
#[derive(Debug, Clone)]
pub struct VideoSettings {
    width: i32,
    height: i32,
    pixel_format: ffi::AVPixelFormat,
    frame_rate: i32,
    bit_rate: i64,
    options: Options,
}

impl VideoSettings {
    /// Default bit rate, good for 480p captures. Callers recording larger
    /// regions should raise it.
    const BIT_RATE: i64 = 1_000_000;

    /// H264 with YUV420P, the most widely playable combination, tuned for
    /// real-time capture.
    pub fn preset_h264_yuv420p(width: i32, height: i32, frame_rate: i32) -> Self {
        Self {
            width,
            height,
            pixel_format: ffi::AV_PIX_FMT_YUV420P,
            frame_rate,
            bit_rate: Self::BIT_RATE,
            options: Options::preset_h264_realtime(),
        }
    }

    pub fn with_bit_rate(mut self, bit_rate: i64) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    /// Replace the encoder options wholesale.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    #[inline]
    pub fn frame_rate(&self) -> i32 {
        self.frame_rate
    }

    #[inline]
    pub fn dimensions(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    /// Try the libx264 encoder first, fall back to whatever default H264
    /// encoder the backend carries.
    fn codec(&self) -> Result<AVCodecRef<'static>> {
        AVCodec::find_encoder_by_name(&CString::new("libx264").unwrap())
            .or_else(|| AVCodec::find_encoder(ffi::AV_CODEC_ID_H264))
            .ok_or_else(|| {
                CaptureError::InvalidConfig("no H264 encoder available".to_string())
            })
    }
}

/// Holds a logical combination of audio encoder settings.
#[derive(Debug, Clone)]
pub struct AudioSettings {
    sample_rate: i32,
    nb_channels: i32,
    bit_rate: i64,
    options: Options,
}

impl AudioSettings {
    const BIT_RATE: i64 = 96_000;

    /// AAC at the capture sample rate.
    pub fn preset_aac(sample_rate: i32, nb_channels: i32) -> Self {
        let nb_channels = if nb_channels > 0 { nb_channels } else { 2 };
        Self {
            sample_rate,
            nb_channels,
            bit_rate: Self::BIT_RATE,
            options: Options::new(),
        }
    }

    pub fn with_bit_rate(mut self, bit_rate: i64) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    fn codec(&self) -> Result<AVCodecRef<'static>> {
        AVCodec::find_encoder(ffi::AV_CODEC_ID_AAC).ok_or_else(|| {
            CaptureError::InvalidConfig("no AAC encoder available".to_string())
        })
    }
}

/// Compresses converted frames into output packets. Video and audio share
/// the same send/receive contract; which one an instance speaks is fixed
/// at construction.
pub struct Encoder {
    encoder: AVCodecContext,
    kind: MediaKind,
    draining: bool,
}

impl Encoder {
    /// Open a video encoder. `global_header` must reflect the muxer's
    /// container requirements or the output will not be playable by dumb
    /// players.
    pub fn new_video(settings: &VideoSettings, global_header: bool) -> Result<Self> {
        let codec = settings.codec()?;
        let mut encode_ctx = AVCodecContext::new(&codec);
        encode_ctx.set_width(settings.width);
        encode_ctx.set_height(settings.height);
        encode_ctx.set_pix_fmt(settings.pixel_format);
        encode_ctx.set_bit_rate(settings.bit_rate);
        encode_ctx.set_framerate(ra(settings.frame_rate, 1));
        encode_ctx.set_time_base(ra(1, settings.frame_rate));
        if global_header {
            encode_ctx.set_flags(encode_ctx.flags | AvCodecFlags::GLOBAL_HEADER.bits() as i32);
        }

        encode_ctx.open(settings.options.to_avdict())?;

        tracing::debug!(
            codec = %codec.name().to_string_lossy(),
            width = settings.width,
            height = settings.height,
            frame_rate = settings.frame_rate,
            "opened video encoder"
        );

        Ok(Self {
            encoder: encode_ctx,
            kind: MediaKind::Video,
            draining: false,
        })
    }

    /// Open an audio encoder.
    pub fn new_audio(settings: &AudioSettings, global_header: bool) -> Result<Self> {
        let codec = settings.codec()?;
        let mut encode_ctx = AVCodecContext::new(&codec);
        encode_ctx.set_sample_rate(settings.sample_rate);
        encode_ctx
            .set_ch_layout(AVChannelLayout::from_nb_channels(settings.nb_channels).into_inner());
        // take first format from list of supported formats
        let sample_fmt = codec
            .sample_fmts()
            .and_then(|fmts| fmts.first().copied())
            .unwrap_or(ffi::AV_SAMPLE_FMT_FLTP);
        encode_ctx.set_sample_fmt(sample_fmt);
        encode_ctx.set_bit_rate(settings.bit_rate);
        encode_ctx.set_time_base(ra(1, settings.sample_rate));
        if global_header {
            encode_ctx.set_flags(encode_ctx.flags | AvCodecFlags::GLOBAL_HEADER.bits() as i32);
        }

        encode_ctx.open(settings.options.to_avdict())?;

        tracing::debug!(
            codec = %codec.name().to_string_lossy(),
            sample_rate = settings.sample_rate,
            channels = settings.nb_channels,
            "opened audio encoder"
        );

        Ok(Self {
            encoder: encode_ctx,
            kind: MediaKind::Audio,
            draining: false,
        })
    }

    /// Push a converted frame, or `None` to start the end-of-stream drain.
    pub fn send_frame(&mut self, frame: Option<&AVFrame>) -> Result<SendState> {
        if frame.is_none() && self.draining {
            return Err(CaptureError::Protocol("encoder drained twice"));
        }
        match self.encoder.send_frame(frame) {
            Ok(()) => {
                if frame.is_none() {
                    self.draining = true;
                }
                Ok(SendState::Accepted)
            }
            Err(RsmpegError::SendFrameAgainError) => Ok(SendState::Saturated),
            Err(RsmpegError::EncoderFlushedError) => {
                Err(CaptureError::Protocol("frame sent to a drained encoder"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next encoded packet, carrying PTS/DTS in the encoder's time base,
    /// or `None` when nothing is ready.
    pub fn receive_packet(&mut self) -> Result<Option<AVPacket>> {
        match self.encoder.receive_packet() {
            Ok(packet) => Ok(Some(packet)),
            Err(RsmpegError::EncoderDrainError) | Err(RsmpegError::EncoderFlushedError) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[inline]
    pub fn time_base(&self) -> ffi::AVRational {
        self.encoder.time_base
    }

    /// Samples per frame the codec expects; only meaningful for audio.
    #[inline]
    pub fn frame_size(&self) -> i32 {
        self.encoder.frame_size
    }

    #[inline]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The opened codec context, used to register output streams with the
    /// muxer and to configure converters.
    #[inline]
    pub fn codec_context(&self) -> &AVCodecContext {
        &self.encoder
    }
}

unsafe impl Send for Encoder {}
