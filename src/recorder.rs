use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::demux::{Demuxer, DemuxerBuilder};
use crate::encode::{AudioSettings, VideoSettings};
use crate::error::{CaptureError, Result};
use crate::mux::Muxer;
use crate::options::Options;
use crate::pipeline::{Pipeline, StepStatus};
use crate::stream::KindParams;

/// One capture source: an input format tag (`x11grab`, `avfoundation`,
/// ...), a device name and the device options. Without a format the device
/// name is treated as a regular file, which is how the test suite drives
/// the recorder.
#[derive(Debug, Clone)]
pub struct CaptureInput {
    device: String,
    format: Option<String>,
    options: Options,
}

impl CaptureInput {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            format: None,
            options: Options::new(),
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    fn open(&self) -> Result<Demuxer> {
        let mut builder = DemuxerBuilder::new(self.device.clone());
        if let Some(format) = self.format.as_deref() {
            builder = builder.with_input_format(format);
        }
        if !self.options.is_empty() {
            builder = builder.with_options(&self.options);
        }
        builder.build()
    }
}

/// Builds a [`Recorder`].
///
/// # Example
///
/// ```ignore
/// let video = CaptureInput::new(":0.0+0,0")
///     .with_format("x11grab")
///     .with_options(Options::preset_x11grab(1920, 1080, 30));
/// let mut recorder = RecorderBuilder::new(video)
///     .capture_audio(false)
///     .start("capture.mp4")?;
/// // ... later
/// recorder.stop()?;
/// ```
pub struct RecorderBuilder {
    video_input: CaptureInput,
    audio_input: Option<CaptureInput>,
    capture_audio: bool,
    frame_rate: i32,
    region: Option<(i32, i32, i32, i32)>,
    video_bit_rate: Option<i64>,
    audio_bit_rate: Option<i64>,
    encoder_options: Option<Options>,
}

impl RecorderBuilder {
    pub fn new(video_input: CaptureInput) -> Self {
        Self {
            video_input,
            audio_input: None,
            capture_audio: false,
            frame_rate: 30,
            region: None,
            video_bit_rate: None,
            audio_bit_rate: None,
            encoder_options: None,
        }
    }

    /// Record audio from the video demuxer. For platforms whose capture
    /// source delivers both kinds from one device.
    pub fn capture_audio(mut self, capture_audio: bool) -> Self {
        self.capture_audio = capture_audio;
        self
    }

    /// Record audio from a second capture source. For platforms that need
    /// one demuxer per kind; the audio source keeps its own clock.
    pub fn with_audio_input(mut self, audio_input: CaptureInput) -> Self {
        self.audio_input = Some(audio_input);
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: i32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Record only a region of the capture: `(width, height, offset_x,
    /// offset_y)` in screen pixels, as produced by a region selector.
    pub fn with_region(mut self, width: i32, height: i32, offset_x: i32, offset_y: i32) -> Self {
        self.region = Some((width, height, offset_x, offset_y));
        self
    }

    pub fn with_video_bit_rate(mut self, bit_rate: i64) -> Self {
        self.video_bit_rate = Some(bit_rate);
        self
    }

    pub fn with_audio_bit_rate(mut self, bit_rate: i64) -> Self {
        self.audio_bit_rate = Some(bit_rate);
        self
    }

    /// Replace the video encoder options (default: realtime H264 preset).
    pub fn with_encoder_options(mut self, options: Options) -> Self {
        self.encoder_options = Some(options);
        self
    }

    /// Open every device, build the pipelines, write the container header
    /// and start capturing on a background thread.
    pub fn start(self, destination: impl AsRef<Path>) -> Result<Recorder> {
        let muxer = Arc::new(Muxer::new(destination)?);
        let mut pipelines = Vec::new();

        let video_demuxer = self.video_input.open()?;
        let video_params = video_demuxer.video_params()?;
        tracing::info!(params = %video_params, "video capture stream");

        let KindParams::Video { width, height, .. } = video_params.kind else {
            return Err(CaptureError::InvalidConfig(
                "video capture stream has no video parameters".to_string(),
            ));
        };

        // H264 with YUV420P needs even dimensions; shave a row/column off
        // odd capture regions rather than failing.
        let (out_width, out_height, crop_offset) = match self.region {
            Some((w, h, x, y)) => (w & !1, h & !1, Some((x, y))),
            None => (width & !1, height & !1, None),
        };

        let mut video_settings =
            VideoSettings::preset_h264_yuv420p(out_width, out_height, self.frame_rate);
        if let Some(bit_rate) = self.video_bit_rate {
            video_settings = video_settings.with_bit_rate(bit_rate);
        }
        if let Some(options) = self.encoder_options.clone() {
            video_settings = video_settings.with_options(options);
        }

        // One demuxer feeding both kinds gets background workers so a slow
        // video encode cannot starve the audio reads.
        let audio_from_video_input =
            self.capture_audio && self.audio_input.is_none() && video_demuxer.has_audio();
        let shared_audio_settings = if audio_from_video_input {
            Some(audio_settings_for(&video_demuxer, self.audio_bit_rate)?)
        } else {
            None
        };

        let mut video_pipeline =
            Pipeline::new(video_demuxer, Arc::clone(&muxer), audio_from_video_input);
        video_pipeline.init_video(&video_settings, crop_offset)?;

        if self.capture_audio {
            if let Some(settings) = shared_audio_settings.as_ref() {
                video_pipeline.init_audio(settings)?;
            } else if let Some(audio_input) = self.audio_input.as_ref() {
                let audio_demuxer = audio_input.open()?;
                let audio_settings = audio_settings_for(&audio_demuxer, self.audio_bit_rate)?;
                let mut audio_pipeline = Pipeline::new(audio_demuxer, Arc::clone(&muxer), false);
                audio_pipeline.init_audio(&audio_settings)?;
                pipelines.push(audio_pipeline);
            } else {
                return Err(CaptureError::InvalidConfig(
                    "audio capture requested but no source provides audio".to_string(),
                ));
            }
        }
        pipelines.insert(0, video_pipeline);

        muxer.open_file()?;

        let control = Arc::new(Control {
            state: Mutex::new(RunState::Running),
            cv: Condvar::new(),
        });
        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name("screencast-capture".to_string())
            .spawn(move || capture_loop(thread_control, pipelines))
            .map_err(|e| CaptureError::Worker(format!("cannot spawn capture thread: {}", e)))?;

        Ok(Recorder {
            control,
            handle: Some(handle),
            muxer,
            stopped: false,
        })
    }
}

fn audio_settings_for(demuxer: &Demuxer, bit_rate: Option<i64>) -> Result<AudioSettings> {
    let params = demuxer.audio_params()?;
    tracing::info!(params = %params, "audio capture stream");
    let KindParams::Audio {
        sample_rate,
        nb_channels,
        ..
    } = params.kind
    else {
        return Err(CaptureError::InvalidConfig(
            "audio capture stream has no audio parameters".to_string(),
        ));
    };
    let mut settings = AudioSettings::preset_aac(sample_rate, nb_channels);
    if let Some(bit_rate) = bit_rate {
        settings = settings.with_bit_rate(bit_rate);
    }
    Ok(settings)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Stopped,
}

struct Control {
    state: Mutex<RunState>,
    cv: Condvar,
}

/// Records one capture session to one container file.
///
/// `pause`/`resume` splice the paused wall-clock span out of the output
/// timeline. `stop` is idempotent: the first call joins the capture
/// thread, drains the pipelines and finalizes the file.
pub struct Recorder {
    control: Arc<Control>,
    handle: Option<JoinHandle<(Vec<Pipeline>, Result<()>)>>,
    muxer: Arc<Muxer>,
    stopped: bool,
}

impl Recorder {
    /// Suspend capture. Packets keep accumulating device-side timestamps
    /// while paused; they are realigned on resume.
    pub fn pause(&self) {
        let mut state = self.control.state.lock().unwrap();
        if *state == RunState::Running {
            *state = RunState::Paused;
            self.control.cv.notify_all();
            tracing::info!("capture paused");
        }
    }

    /// Resume a paused capture. The first packet of every kind after
    /// resume realigns that kind's clock and is discarded.
    pub fn resume(&self) {
        let mut state = self.control.state.lock().unwrap();
        if *state == RunState::Paused {
            *state = RunState::Running;
            self.control.cv.notify_all();
            tracing::info!("capture resumed");
        }
    }

    /// Stop capturing, drain every pipeline stage and finalize the file.
    ///
    /// Must be called before the recorder is dropped for error reporting;
    /// dropping without `stop` still finalizes on a best-effort basis.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        {
            let mut state = self.control.state.lock().unwrap();
            *state = RunState::Stopped;
            self.control.cv.notify_all();
        }

        let (mut pipelines, capture_result) = self
            .handle
            .take()
            .expect("capture thread handle present until stop")
            .join()
            .map_err(|_| CaptureError::Worker("capture thread panicked".to_string()))?;

        // Even a failed capture drains and finalizes what it can, so a
        // partial recording stays playable.
        let mut first_error = capture_result.err();
        for pipeline in pipelines.iter_mut() {
            if let Err(e) = pipeline.flush() {
                first_error.get_or_insert(e);
            }
        }
        drop(pipelines);
        if let Err(e) = self.muxer.close_file() {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => {
                tracing::error!(error = %e, "capture finished with error");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn capture_loop(
    control: Arc<Control>,
    mut pipelines: Vec<Pipeline>,
) -> (Vec<Pipeline>, Result<()>) {
    let mut recovering = vec![false; pipelines.len()];
    let mut was_paused = false;

    loop {
        {
            let mut state = control.state.lock().unwrap();
            while *state == RunState::Paused {
                was_paused = true;
                state = control.cv.wait(state).unwrap();
            }
            if *state == RunState::Stopped {
                return (pipelines, Ok(()));
            }
        }
        if was_paused {
            was_paused = false;
            for flag in recovering.iter_mut() {
                *flag = true;
            }
        }

        let mut read_any = false;
        let mut all_exhausted = true;
        for (i, pipeline) in pipelines.iter_mut().enumerate() {
            match pipeline.step(recovering[i]) {
                Ok(StepStatus::Processed) => {
                    recovering[i] = false;
                    read_any = true;
                    all_exhausted = false;
                }
                Ok(StepStatus::Empty) => {
                    all_exhausted = false;
                }
                Ok(StepStatus::Exhausted) => {}
                Err(e) => return (pipelines, Err(e)),
            }
        }

        if all_exhausted {
            // File-backed inputs only: everything was transcoded.
            return (pipelines, Ok(()));
        }
        if !read_any {
            // Devices reported EAGAIN across the board; back off briefly
            // instead of spinning on the ioctl.
            thread::sleep(Duration::from_millis(1));
        }
    }
}
