use std::ffi::CString;
use std::ptr;

use cstr::cstr;
use libc::c_void;
use rsmpeg::avcodec::AVCodecContext;
use rsmpeg::avfilter::{AVFilter, AVFilterGraph, AVFilterInOut};
use rsmpeg::avutil::{AVAudioFifo, AVChannelLayout, AVFrame, AVSamples};
use rsmpeg::error::RsmpegError;
use rsmpeg::ffi;
use rsmpeg::swscale::SwsContext;

use crate::error::{CaptureError, Result};
use crate::SendState;

const AVERROR_EAGAIN: i32 = -libc::EAGAIN;

/// How many seconds of resampled audio the FIFO can hold before a write
/// fails with `FifoOverflow`.
const FIFO_CAPACITY_SECONDS: i32 = 3;

/// Reshapes raw video frames to the encoder's pixel format and resolution,
/// optionally cropping a region out of the capture first.
///
/// The crop runs through a filter graph built once at construction; the
/// scale/format conversion runs through a scale context. Output frames get
/// `pts = sequence_number`, the caller-owned monotonic count in the
/// encoder's time base.
pub struct VideoConverter {
    scaler: SwsContext,
    crop: Option<CropGraph>,
    /// Frames between send and receive when no crop graph exists.
    pending: std::collections::VecDeque<AVFrame>,
    scaled_width: i32,
    scaled_height: i32,
    out_width: i32,
    out_height: i32,
    out_pix_fmt: ffi::AVPixelFormat,
}

struct CropGraph {
    graph: AVFilterGraph,
    buffersrc: *mut ffi::AVFilterContext,
    buffersink: *mut ffi::AVFilterContext,
}

impl VideoConverter {
    /// Create a converter between a decoder and an encoder. `crop_offset`
    /// is the top-left corner of the encoded region within the capture
    /// frame; `None` disables cropping and scales the full frame.
    pub fn new(
        decode_ctx: &AVCodecContext,
        encode_ctx: &AVCodecContext,
        crop_offset: Option<(i32, i32)>,
    ) -> Result<Self> {
        let time_base = if decode_ctx.pkt_timebase.den != 0 {
            decode_ctx.pkt_timebase
        } else {
            decode_ctx.time_base
        };
        Self::from_params(
            decode_ctx.width,
            decode_ctx.height,
            decode_ctx.pix_fmt,
            time_base,
            decode_ctx.sample_aspect_ratio,
            encode_ctx.width,
            encode_ctx.height,
            encode_ctx.pix_fmt,
            crop_offset,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_params(
        in_width: i32,
        in_height: i32,
        in_pix_fmt: ffi::AVPixelFormat,
        in_time_base: ffi::AVRational,
        in_aspect_ratio: ffi::AVRational,
        out_width: i32,
        out_height: i32,
        out_pix_fmt: ffi::AVPixelFormat,
        crop_offset: Option<(i32, i32)>,
    ) -> Result<Self> {
        if out_width <= 0 || out_height <= 0 || out_width > in_width || out_height > in_height {
            return Err(CaptureError::InvalidConfig(format!(
                "cannot convert {}x{} frames into {}x{}",
                in_width, in_height, out_width, out_height
            )));
        }

        let crop = match crop_offset {
            Some((offset_x, offset_y)) => Some(CropGraph::new(
                in_width,
                in_height,
                in_pix_fmt,
                in_time_base,
                in_aspect_ratio,
                out_width,
                out_height,
                offset_x,
                offset_y,
            )?),
            None => None,
        };

        // With a crop graph in front, the scaler sees already-cropped
        // frames at the output resolution.
        let (scaled_width, scaled_height) = if crop.is_some() {
            (out_width, out_height)
        } else {
            (in_width, in_height)
        };

        let scaler = SwsContext::get_context(
            scaled_width,
            scaled_height,
            in_pix_fmt,
            out_width,
            out_height,
            out_pix_fmt,
            ffi::SWS_BICUBIC,
            None,
            None,
            None,
        )
        .ok_or_else(|| {
            CaptureError::InvalidConfig("cannot allocate a swscale context".to_string())
        })?;

        Ok(Self {
            scaler,
            crop,
            pending: std::collections::VecDeque::new(),
            scaled_width,
            scaled_height,
            out_width,
            out_height,
            out_pix_fmt,
        })
    }

    /// Push a decoded frame. The converter buffers internally, so a send
    /// is always accepted; callers should still drain between sends to
    /// keep memory bounded.
    pub fn send_frame(&mut self, frame: AVFrame) -> Result<SendState> {
        match self.crop.as_mut() {
            Some(crop) => crop.push(Some(frame))?,
            None => self.pending.push_back(frame),
        }
        Ok(SendState::Accepted)
    }

    /// Signal end-of-stream so remaining cropped frames can be pulled.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(crop) = self.crop.as_mut() {
            crop.push(None)?;
        }
        Ok(())
    }

    /// Pull the next converted frame, stamped with `sequence_number` as its
    /// PTS, or `None` when nothing is ready.
    pub fn receive_frame(&mut self, sequence_number: i64) -> Result<Option<AVFrame>> {
        let input = match self.crop.as_mut() {
            Some(crop) => crop.pull()?,
            None => self.pending.pop_front(),
        };
        let Some(input) = input else {
            return Ok(None);
        };

        if input.width != self.scaled_width || input.height != self.scaled_height {
            return Err(CaptureError::InvalidConfig(format!(
                "frame is {}x{}, converter expects {}x{}",
                input.width, input.height, self.scaled_width, self.scaled_height
            )));
        }

        let mut output = AVFrame::new();
        output.set_format(self.out_pix_fmt);
        output.set_width(self.out_width);
        output.set_height(self.out_height);
        output.alloc_buffer()?;

        let src_slice = input.data.as_ptr() as *const *const u8;
        let dst_slice = output.data.as_ptr() as *const *mut u8;
        unsafe {
            self.scaler.scale(
                src_slice,
                input.linesize.as_ptr(),
                0,
                input.height,
                dst_slice,
                output.linesize.as_ptr(),
            )?;
        }

        output.set_pts(sequence_number);
        Ok(Some(output))
    }
}

unsafe impl Send for VideoConverter {}

impl CropGraph {
    #[allow(clippy::too_many_arguments)]
    fn new(
        in_width: i32,
        in_height: i32,
        in_pix_fmt: ffi::AVPixelFormat,
        in_time_base: ffi::AVRational,
        in_aspect_ratio: ffi::AVRational,
        out_width: i32,
        out_height: i32,
        offset_x: i32,
        offset_y: i32,
    ) -> Result<Self> {
        let graph = AVFilterGraph::new();
        let buffersrc;
        let buffersink;
        {
            let buffer = AVFilter::get_by_name(cstr!("buffer")).ok_or_else(|| {
                CaptureError::InvalidConfig("buffer filter is not available".to_string())
            })?;
            let sink = AVFilter::get_by_name(cstr!("buffersink")).ok_or_else(|| {
                CaptureError::InvalidConfig("buffersink filter is not available".to_string())
            })?;

            let time_base = if in_time_base.den != 0 {
                in_time_base
            } else {
                ffi::AVRational { num: 1, den: 30 }
            };
            let args = format!(
                "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
                in_width,
                in_height,
                in_pix_fmt,
                time_base.num,
                time_base.den,
                in_aspect_ratio.num,
                in_aspect_ratio.den,
            );
            let args = CString::new(args).expect("filter args contain NUL");

            let mut buffersrc_ctx = graph.create_filter_context(&buffer, cstr!("in"), Some(&args))?;
            let mut buffersink_ctx = graph.create_filter_context(&sink, cstr!("out"), None)?;
            // Keep the sink in the decoder's pixel format; the scale
            // context owns the format conversion.
            buffersink_ctx.opt_set_bin(cstr!("pix_fmts"), &in_pix_fmt)?;

            let outputs = AVFilterInOut::new(cstr!("in"), &mut buffersrc_ctx, 0);
            let inputs = AVFilterInOut::new(cstr!("out"), &mut buffersink_ctx, 0);
            let filter_spec = CString::new(format!(
                "crop={}:{}:{}:{}",
                out_width, out_height, offset_x, offset_y
            ))
            .expect("crop filter args contain NUL");
            graph.parse_ptr(&filter_spec, Some(inputs), Some(outputs))?;
            graph.config()?;

            buffersrc = buffersrc_ctx.as_mut_ptr();
            buffersink = buffersink_ctx.as_mut_ptr();
        }

        // The graph owns both filter contexts; the raw endpoints stay
        // valid for as long as the graph lives.
        Ok(Self {
            graph,
            buffersrc,
            buffersink,
        })
    }

    fn push(&mut self, mut frame: Option<AVFrame>) -> Result<()> {
        // The frame must outlive the call; a null pointer signals EOF.
        let frame_ptr = match frame.as_mut() {
            Some(frame) => frame.as_mut_ptr(),
            None => ptr::null_mut(),
        };
        let res = unsafe { ffi::av_buffersrc_add_frame(self.buffersrc, frame_ptr) };
        if res < 0 {
            return Err(RsmpegError::AVError(res).into());
        }
        Ok(())
    }

    fn pull(&mut self) -> Result<Option<AVFrame>> {
        let mut frame = AVFrame::new();
        let res = unsafe { ffi::av_buffersink_get_frame(self.buffersink, frame.as_mut_ptr()) };
        match res {
            res if res >= 0 => Ok(Some(frame)),
            AVERROR_EAGAIN | ffi::AVERROR_EOF => Ok(None),
            e => Err(RsmpegError::AVError(e).into()),
        }
    }
}

/// Resamples raw audio into the encoder's sample format and repackages it
/// into frames of exactly `frame_size` samples through a sample FIFO.
///
/// Output frames get `pts = frame_size * sequence_number` in the encoder's
/// time base. A remainder smaller than `frame_size` at end-of-stream stays
/// in the FIFO and is discarded with the converter.
pub struct AudioConverter {
    resampler: SwrContextHandle,
    fifo: AVAudioFifo,
    frame_size: i32,
    out_sample_fmt: ffi::AVSampleFormat,
    out_sample_rate: i32,
    nb_channels: i32,
}

/// `SwrContext` allocated through the backend directly; the safe wrapper
/// has no channel-layout constructor matching every ffmpeg revision we
/// build against.
struct SwrContextHandle(*mut ffi::SwrContext);

impl Drop for SwrContextHandle {
    fn drop(&mut self) {
        unsafe { ffi::swr_free(&mut self.0) }
    }
}

impl AudioConverter {
    /// Create a converter between an audio decoder and an audio encoder.
    pub fn new(decode_ctx: &AVCodecContext, encode_ctx: &AVCodecContext) -> Result<Self> {
        Self::from_params(
            decode_ctx.sample_rate,
            decode_ctx.sample_fmt,
            decode_ctx.ch_layout.nb_channels,
            encode_ctx.sample_rate,
            encode_ctx.sample_fmt,
            encode_ctx.ch_layout.nb_channels,
            encode_ctx.frame_size,
            encode_ctx.sample_rate * FIFO_CAPACITY_SECONDS,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_params(
        in_sample_rate: i32,
        in_sample_fmt: ffi::AVSampleFormat,
        in_channels: i32,
        out_sample_rate: i32,
        out_sample_fmt: ffi::AVSampleFormat,
        out_channels: i32,
        frame_size: i32,
        fifo_capacity: i32,
    ) -> Result<Self> {
        if frame_size <= 0 {
            return Err(CaptureError::InvalidConfig(
                "audio encoder reports no frame size".to_string(),
            ));
        }

        let in_layout = AVChannelLayout::from_nb_channels(in_channels);
        let out_layout = AVChannelLayout::from_nb_channels(out_channels);

        let mut swr = ptr::null_mut();
        let res = unsafe {
            ffi::swr_alloc_set_opts2(
                &mut swr,
                out_layout.as_ptr(),
                out_sample_fmt,
                out_sample_rate,
                in_layout.as_ptr(),
                in_sample_fmt,
                in_sample_rate,
                0,
                ptr::null_mut(),
            )
        };
        if res < 0 || swr.is_null() {
            return Err(CaptureError::InvalidConfig(
                "cannot allocate a resampler".to_string(),
            ));
        }
        let resampler = SwrContextHandle(swr);
        let res = unsafe { ffi::swr_init(resampler.0) };
        if res < 0 {
            return Err(RsmpegError::AVError(res).into());
        }

        let fifo = AVAudioFifo::new(out_sample_fmt, out_channels, fifo_capacity);

        Ok(Self {
            resampler,
            fifo,
            frame_size,
            out_sample_fmt,
            out_sample_rate,
            nb_channels: out_channels,
        })
    }

    /// Resample one decoded frame and append it to the FIFO. Fails with
    /// `FifoOverflow` when the FIFO has less free space than the resampled
    /// batch needs.
    pub fn send_frame(&mut self, frame: AVFrame) -> Result<SendState> {
        let mut samples = AVSamples::new(
            self.nb_channels,
            frame.nb_samples,
            self.out_sample_fmt,
            0,
        )
        .map_err(|_| {
            CaptureError::InvalidConfig("cannot allocate a resample buffer".to_string())
        })?;

        let converted = unsafe {
            ffi::swr_convert(
                self.resampler.0,
                samples.audio_data.as_mut_ptr(),
                frame.nb_samples,
                frame.extended_data as *mut *const u8,
                frame.nb_samples,
            )
        };
        if converted < 0 {
            return Err(RsmpegError::AVError(converted).into());
        }
        if converted == 0 {
            return Ok(SendState::Accepted);
        }

        let space = unsafe { ffi::av_audio_fifo_space(self.fifo.as_mut_ptr()) };
        if space < converted {
            return Err(CaptureError::FifoOverflow);
        }
        let written = unsafe {
            ffi::av_audio_fifo_write(
                self.fifo.as_mut_ptr(),
                samples.audio_data.as_mut_ptr() as *mut *mut c_void,
                converted,
            )
        };
        if written < converted {
            return Err(CaptureError::Io(
                "short write into the audio fifo".to_string(),
            ));
        }
        Ok(SendState::Accepted)
    }

    /// Pull the next fixed-size frame when the FIFO holds at least
    /// `frame_size` samples; `None` otherwise.
    pub fn receive_frame(&mut self, sequence_number: i64) -> Result<Option<AVFrame>> {
        if self.buffered_samples() < self.frame_size {
            return Ok(None);
        }

        let mut frame = AVFrame::new();
        frame.set_nb_samples(self.frame_size);
        frame.set_ch_layout(AVChannelLayout::from_nb_channels(self.nb_channels).into_inner());
        frame.set_format(self.out_sample_fmt);
        frame.set_sample_rate(self.out_sample_rate);
        frame.alloc_buffer()?;

        let read = unsafe {
            ffi::av_audio_fifo_read(
                self.fifo.as_mut_ptr(),
                (*frame.as_mut_ptr()).data.as_mut_ptr() as *mut *mut c_void,
                self.frame_size,
            )
        };
        if read < self.frame_size {
            return Err(CaptureError::Io(
                "short read from the audio fifo".to_string(),
            ));
        }

        frame.set_pts(self.frame_size as i64 * sequence_number);
        Ok(Some(frame))
    }

    /// Samples currently buffered in the FIFO.
    pub fn buffered_samples(&mut self) -> i32 {
        unsafe { ffi::av_audio_fifo_size(self.fifo.as_mut_ptr()) }
    }

    #[inline]
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }
}

unsafe impl Send for AudioConverter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuv_frame(width: i32, height: i32) -> AVFrame {
        let mut frame = AVFrame::new();
        frame.set_format(ffi::AV_PIX_FMT_YUV420P);
        frame.set_width(width);
        frame.set_height(height);
        frame.alloc_buffer().unwrap();
        unsafe {
            let raw = frame.as_mut_ptr();
            for plane in 0..3 {
                let height = if plane == 0 { height } else { height / 2 };
                let size = ((*raw).linesize[plane] * height) as usize;
                std::ptr::write_bytes((*raw).data[plane], if plane == 0 { 64 } else { 128 }, size);
            }
        }
        frame
    }

    fn s16_frame(sample_rate: i32, nb_samples: i32) -> AVFrame {
        let mut frame = AVFrame::new();
        frame.set_format(ffi::AV_SAMPLE_FMT_S16);
        frame.set_sample_rate(sample_rate);
        frame.set_ch_layout(AVChannelLayout::from_nb_channels(2).into_inner());
        frame.set_nb_samples(nb_samples);
        frame.alloc_buffer().unwrap();
        unsafe {
            let raw = frame.as_mut_ptr();
            std::ptr::write_bytes((*raw).data[0], 0, (nb_samples * 2 * 2) as usize);
        }
        frame
    }

    fn audio_converter(frame_size: i32, fifo_capacity: i32) -> AudioConverter {
        AudioConverter::from_params(
            44100,
            ffi::AV_SAMPLE_FMT_S16,
            2,
            44100,
            ffi::AV_SAMPLE_FMT_FLTP,
            2,
            frame_size,
            fifo_capacity,
        )
        .unwrap()
    }

    #[test]
    fn video_scale_changes_resolution_and_stamps_pts() {
        let mut converter = VideoConverter::from_params(
            64,
            64,
            ffi::AV_PIX_FMT_YUV420P,
            ffi::AVRational { num: 1, den: 30 },
            ffi::AVRational { num: 0, den: 1 },
            32,
            32,
            ffi::AV_PIX_FMT_YUV420P,
            None,
        )
        .unwrap();

        assert_eq!(
            converter.send_frame(yuv_frame(64, 64)).unwrap(),
            SendState::Accepted
        );
        let frame = converter.receive_frame(7).unwrap().unwrap();
        assert_eq!(frame.width, 32);
        assert_eq!(frame.height, 32);
        assert_eq!(frame.pts, 7);
        assert!(converter.receive_frame(8).unwrap().is_none());
    }

    #[test]
    fn video_preserves_send_order() {
        let mut converter = VideoConverter::from_params(
            64,
            64,
            ffi::AV_PIX_FMT_YUV420P,
            ffi::AVRational { num: 1, den: 30 },
            ffi::AVRational { num: 0, den: 1 },
            64,
            64,
            ffi::AV_PIX_FMT_YUV420P,
            None,
        )
        .unwrap();

        converter.send_frame(yuv_frame(64, 64)).unwrap();
        converter.send_frame(yuv_frame(64, 64)).unwrap();
        assert_eq!(converter.receive_frame(0).unwrap().unwrap().pts, 0);
        assert_eq!(converter.receive_frame(1).unwrap().unwrap().pts, 1);
        assert!(converter.receive_frame(2).unwrap().is_none());
    }

    #[test]
    fn video_crop_produces_region_sized_frames() {
        let mut converter = VideoConverter::from_params(
            640,
            480,
            ffi::AV_PIX_FMT_YUV420P,
            ffi::AVRational { num: 1, den: 30 },
            ffi::AVRational { num: 0, den: 1 },
            320,
            240,
            ffi::AV_PIX_FMT_YUV420P,
            Some((16, 16)),
        )
        .unwrap();

        converter.send_frame(yuv_frame(640, 480)).unwrap();
        let frame = converter.receive_frame(0).unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!(frame.pts, 0);

        converter.flush().unwrap();
        assert!(converter.receive_frame(1).unwrap().is_none());
    }

    #[test]
    fn audio_batches_exact_frame_sizes_with_sample_counted_pts() {
        let mut converter = audio_converter(1024, 44100);

        converter.send_frame(s16_frame(44100, 1500)).unwrap();
        let first = converter.receive_frame(0).unwrap().unwrap();
        assert_eq!(first.nb_samples, 1024);
        assert_eq!(first.pts, 0);
        // 476 samples remain, not enough for a full frame.
        assert!(converter.receive_frame(1).unwrap().is_none());

        converter.send_frame(s16_frame(44100, 1500)).unwrap();
        let second = converter.receive_frame(1).unwrap().unwrap();
        assert_eq!(second.nb_samples, 1024);
        assert_eq!(second.pts, 1024);
    }

    #[test]
    fn audio_fifo_overflow_is_reported() {
        let mut converter = audio_converter(1024, 2048);

        converter.send_frame(s16_frame(44100, 1500)).unwrap();
        // 1500 buffered, 548 free: the next batch cannot fit.
        assert!(matches!(
            converter.send_frame(s16_frame(44100, 1500)),
            Err(CaptureError::FifoOverflow)
        ));
    }
}
