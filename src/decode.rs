use rsmpeg::avcodec::{AVCodec, AVCodecContext, AVPacket};
use rsmpeg::avutil::AVFrame;
use rsmpeg::error::RsmpegError;
use rsmpeg::ffi;

use crate::demux::Demuxer;
use crate::error::{CaptureError, Result};
use crate::{MediaKind, SendState};

/// Single-stream decoder turning compressed capture packets into raw
/// frames.
///
/// `send_packet`/`receive_frame` form a producer/consumer pair with the
/// codec: a `Saturated` send means the caller must drain frames before
/// retrying the same packet. The decoder never drops packets.
pub struct Decoder {
    decoder: AVCodecContext,
    time_base: ffi::AVRational,
    kind: MediaKind,
    draining: bool,
}

impl Decoder {
    /// Create a decoder for the demuxer's stream of the given kind.
    pub fn from_capture(demuxer: &Demuxer, kind: MediaKind) -> Result<Self> {
        let (codecpar, time_base) = demuxer.codec_parameters(kind)?;

        let decoder = AVCodec::find_decoder(codecpar.codec_id).ok_or_else(|| {
            CaptureError::InvalidConfig(format!(
                "no decoder available for {} stream",
                kind.label()
            ))
        })?;

        let mut decode_ctx = AVCodecContext::new(&decoder);
        decode_ctx.apply_codecpar(&codecpar)?;
        decode_ctx.set_pkt_timebase(time_base);
        decode_ctx.open(None)?;

        tracing::debug!(
            kind = kind.label(),
            codec = %decoder.name().to_string_lossy(),
            "opened decoder"
        );

        Ok(Self {
            decoder: decode_ctx,
            time_base,
            kind,
            draining: false,
        })
    }

    /// Push a compressed packet, or `None` to start the end-of-stream
    /// drain. Draining twice is a contract violation.
    pub fn send_packet(&mut self, packet: Option<&AVPacket>) -> Result<SendState> {
        if packet.is_none() && self.draining {
            return Err(CaptureError::Protocol("decoder drained twice"));
        }
        match self.decoder.send_packet(packet) {
            Ok(()) => {
                if packet.is_none() {
                    self.draining = true;
                }
                Ok(SendState::Accepted)
            }
            Err(RsmpegError::SendPacketAgainError) => Ok(SendState::Saturated),
            Err(RsmpegError::DecoderFlushedError) => {
                Err(CaptureError::Protocol("packet sent to a drained decoder"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next available raw frame, or `None` when the decoder has nothing
    /// ready (needs more input, or the drain is complete).
    pub fn receive_frame(&mut self) -> Result<Option<AVFrame>> {
        match self.decoder.receive_frame() {
            Ok(frame) => Ok(Some(frame)),
            Err(RsmpegError::DecoderDrainError) | Err(RsmpegError::DecoderFlushedError) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[inline]
    pub fn time_base(&self) -> ffi::AVRational {
        self.time_base
    }

    #[inline]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// The opened codec context; converters configure themselves from it.
    #[inline]
    pub fn codec_context(&self) -> &AVCodecContext {
        &self.decoder
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        // Bound on receive calls while releasing whatever the codec still
        // holds queued.
        const MAX_DRAIN_ITERATIONS: u32 = 100;

        if !self.draining && self.decoder.send_packet(None).is_ok() {
            for _ in 0..MAX_DRAIN_ITERATIONS {
                if !matches!(self.decoder.receive_frame(), Ok(_)) {
                    break;
                }
            }
        }
    }
}

unsafe impl Send for Decoder {}
