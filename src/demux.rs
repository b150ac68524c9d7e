use std::ffi::CString;
use std::ptr;

use rsmpeg::avcodec::AVPacket;
use rsmpeg::avformat::AVFormatContextInput;
use rsmpeg::ffi;

use crate::error::{CaptureError, Result};
use crate::options::Options;
use crate::stream::StreamParams;
use crate::{init, MediaKind};

const AVERROR_EAGAIN: i32 = -libc::EAGAIN;

/// One demuxer read. `Again` is the device saying "nothing yet, retry";
/// `Exhausted` only ever comes from file-backed sources, live devices keep
/// blocking instead.
#[derive(Debug)]
pub enum Demuxed {
    Video(AVPacket),
    Audio(AVPacket),
    /// Packet from a stream the pipeline does not transcode.
    Other,
    Again,
    Exhausted,
}

/// Builds a [`Demuxer`].
///
/// # Example
///
/// ```ignore
/// let options = Options::preset_x11grab(1920, 1080, 30);
/// let demuxer = DemuxerBuilder::new(":0.0+0,0")
///     .with_input_format("x11grab")
///     .with_options(&options)
///     .build()?;
/// ```
pub struct DemuxerBuilder<'a> {
    device: String,
    input_format: Option<&'a str>,
    options: Option<&'a Options>,
}

impl<'a> DemuxerBuilder<'a> {
    /// Create a demuxer builder for the given device or file name.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            input_format: None,
            options: None,
        }
    }

    /// Select the capture input format by name, e.g. `"x11grab"` or
    /// `"avfoundation"`. Without it the name is treated as a regular file
    /// or URL and the container format is probed.
    pub fn with_input_format(mut self, input_format: &'a str) -> Self {
        self.input_format = Some(input_format);
        self
    }

    /// Options to apply to the device, see [`Options`] presets.
    pub fn with_options(mut self, options: &'a Options) -> Self {
        self.options = Some(options);
        self
    }

    /// Build [`Demuxer`].
    pub fn build(self) -> Result<Demuxer> {
        init::init();

        let input = self.open_input()?;

        let mut video_index = None;
        let mut audio_index = None;
        for (index, stream) in input.streams().into_iter().enumerate() {
            match stream.codecpar().codec_type {
                ffi::AVMEDIA_TYPE_VIDEO if video_index.is_none() => video_index = Some(index),
                ffi::AVMEDIA_TYPE_AUDIO if audio_index.is_none() => audio_index = Some(index),
                _ => {}
            }
        }
        tracing::info!(
            device = %self.device,
            video = ?video_index,
            audio = ?audio_index,
            "opened capture input"
        );

        Ok(Demuxer {
            input,
            video_index,
            audio_index,
        })
    }

    fn open_input(&self) -> Result<AVFormatContextInput> {
        let device = CString::new(self.device.as_str())
            .map_err(|_| CaptureError::InvalidConfig("device name contains NUL".to_string()))?;

        // The plain-file case goes through the safe wrapper; opening a
        // capture device needs the input-format pointer the wrapper does
        // not take, so that path talks to the backend directly.
        let format = match self.input_format {
            None => {
                let mut dict = self.options.and_then(Options::to_avdict);
                return AVFormatContextInput::open(&device, None, &mut dict).map_err(|e| {
                    CaptureError::InvalidConfig(format!("cannot open {}: {}", self.device, e))
                });
            }
            Some(format) => CString::new(format)
                .map_err(|_| CaptureError::InvalidConfig("format name contains NUL".to_string()))?,
        };

        unsafe {
            let input_format = ffi::av_find_input_format(format.as_ptr());
            if input_format.is_null() {
                return Err(CaptureError::InvalidConfig(format!(
                    "input format {:?} is not available",
                    self.input_format.unwrap()
                )));
            }

            let mut opts = raw_dict(self.options);
            let mut ctx = ptr::null_mut();
            let res = ffi::avformat_open_input(&mut ctx, device.as_ptr(), input_format, &mut opts);
            ffi::av_dict_free(&mut opts);
            if res != 0 {
                return Err(CaptureError::InvalidConfig(format!(
                    "cannot open capture device {} (averror {})",
                    self.device, res
                )));
            }

            let res = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if res < 0 {
                ffi::avformat_close_input(&mut ctx);
                return Err(CaptureError::InvalidConfig(format!(
                    "cannot probe capture device {} (averror {})",
                    self.device, res
                )));
            }

            Ok(AVFormatContextInput::from_raw(ptr::NonNull::new(ctx).unwrap()))
        }
    }
}

/// Reads compressed packets from one capture device (or file) and
/// classifies each as video, audio or neither. A platform may deliver both
/// kinds from one demuxer or require one demuxer per kind; the pipeline
/// treats both arrangements the same way.
pub struct Demuxer {
    input: AVFormatContextInput,
    video_index: Option<usize>,
    audio_index: Option<usize>,
}

impl Demuxer {
    /// Read a single packet and classify it.
    ///
    /// Blocks on device i/o. Transient emptiness maps to `Demuxed::Again`;
    /// any other read failure is an i/o error.
    pub fn read_packet(&mut self) -> Result<Demuxed> {
        let mut packet = AVPacket::new();
        let res = unsafe { ffi::av_read_frame(self.input.as_mut_ptr(), packet.as_mut_ptr()) };
        match res {
            0 => {
                let index = packet.stream_index as usize;
                if Some(index) == self.video_index {
                    Ok(Demuxed::Video(packet))
                } else if Some(index) == self.audio_index {
                    Ok(Demuxed::Audio(packet))
                } else {
                    Ok(Demuxed::Other)
                }
            }
            AVERROR_EAGAIN => Ok(Demuxed::Again),
            ffi::AVERROR_EOF => Ok(Demuxed::Exhausted),
            e => Err(CaptureError::Io(format!(
                "cannot read from capture input (averror {})",
                e
            ))),
        }
    }

    /// Descriptor of the first video stream.
    pub fn video_params(&self) -> Result<StreamParams> {
        let index = self.video_index.ok_or_else(|| {
            CaptureError::InvalidConfig("capture input has no video stream".to_string())
        })?;
        StreamParams::from_input(&self.input, index)
    }

    /// Descriptor of the first audio stream.
    pub fn audio_params(&self) -> Result<StreamParams> {
        let index = self.audio_index.ok_or_else(|| {
            CaptureError::InvalidConfig("capture input has no audio stream".to_string())
        })?;
        StreamParams::from_input(&self.input, index)
    }

    /// Drop whatever the input has buffered. Used when recovering from a
    /// pause so the timeline realigns against a fresh packet instead of a
    /// stale one.
    pub fn flush_buffers(&mut self) {
        unsafe {
            ffi::avformat_flush(self.input.as_mut_ptr());
        }
    }

    pub fn has_video(&self) -> bool {
        self.video_index.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_index.is_some()
    }

    /// Stream descriptor for a media kind, when present.
    pub fn params(&self, kind: MediaKind) -> Result<StreamParams> {
        match kind {
            MediaKind::Video => self.video_params(),
            MediaKind::Audio => self.audio_params(),
        }
    }

    /// Codec parameters and time base of the stream backing a media kind,
    /// used to spin up the matching decoder.
    pub(crate) fn codec_parameters(
        &self,
        kind: MediaKind,
    ) -> Result<(rsmpeg::avcodec::AVCodecParameters, ffi::AVRational)> {
        let index = match kind {
            MediaKind::Video => self.video_index,
            MediaKind::Audio => self.audio_index,
        }
        .ok_or_else(|| {
            CaptureError::InvalidConfig(format!(
                "capture input has no {} stream",
                kind.label()
            ))
        })?;
        let stream = self.input.streams().get(index).ok_or_else(|| {
            CaptureError::InvalidConfig(format!("no stream at index {}", index))
        })?;
        Ok((stream.codecpar().to_owned(), stream.time_base))
    }
}

unsafe impl Send for Demuxer {}

fn raw_dict(options: Option<&Options>) -> *mut ffi::AVDictionary {
    let mut dict = ptr::null_mut();
    if let Some(options) = options {
        for (key, value) in options.iter() {
            let key = CString::new(key).expect("option key contains NUL");
            let value = CString::new(value).expect("option value contains NUL");
            unsafe {
                ffi::av_dict_set(&mut dict, key.as_ptr(), value.as_ptr(), 0);
            }
        }
    }
    dict
}
