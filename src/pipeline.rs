use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rsmpeg::avcodec::AVPacket;
use rsmpeg::avutil::av_rescale_q;
use rsmpeg::ffi;

use crate::convert::{AudioConverter, VideoConverter};
use crate::decode::Decoder;
use crate::demux::{Demuxed, Demuxer};
use crate::encode::{AudioSettings, Encoder, VideoSettings};
use crate::error::{CaptureError, Result};
use crate::mux::Muxer;
use crate::{MediaKind, SendState};

/// Outcome of one [`Pipeline::step`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    /// A packet was read (processed, or consumed for pause resynch).
    Processed,
    /// Nothing to read right now, or the packet belonged to no
    /// transcoded stream.
    Empty,
    /// The input reported end-of-stream; only file-backed sources do.
    Exhausted,
}

/// Per-kind presentation clock. Capture timestamps keep running while the
/// recording is paused; subtracting a maintained offset from every packet
/// splices the pause out of the output timeline.
///
/// Offsets live in the *input* stream's time base of their kind; two
/// demuxers never share a clock, and audio gaps are measured with audio
/// packet durations rather than a video frame period.
struct PtsAligner {
    offset: i64,
    last_pts: i64,
    last_duration: i64,
    fallback_duration: i64,
}

impl PtsAligner {
    fn new(fallback_duration: i64) -> Self {
        Self {
            offset: 0,
            last_pts: 0,
            last_duration: 0,
            fallback_duration: fallback_duration.max(1),
        }
    }

    /// Shift a packet's timestamps back by the accumulated pause offset.
    fn rebase(&mut self, packet: &mut AVPacket) {
        if packet.pts != ffi::AV_NOPTS_VALUE {
            packet.set_pts(packet.pts - self.offset);
            self.last_pts = packet.pts;
        }
        if packet.dts != ffi::AV_NOPTS_VALUE {
            packet.set_dts(packet.dts - self.offset);
        }
        if packet.duration > 0 {
            self.last_duration = packet.duration;
        }
    }

    fn expected_duration(&self) -> i64 {
        if self.last_duration > 0 {
            self.last_duration
        } else {
            self.fallback_duration
        }
    }

    /// Fold the pause gap into the offset, using the first packet read
    /// after resume. The packet itself is discarded by the caller; its
    /// notional slot sits one frame period after the last pre-pause
    /// packet, so the timeline continues without a visible gap.
    fn resync(&mut self, raw_pts: i64) {
        if raw_pts == ffi::AV_NOPTS_VALUE {
            return;
        }
        // Compare in rebased space, or a second pause would double-count
        // the offset accumulated by the first.
        let rebased = raw_pts - self.offset;
        self.offset += (rebased - self.last_pts) - self.expected_duration();
    }
}

/// The decode → convert → encode chain of one media kind, ending at the
/// shared muxer. Exactly one thread touches a chain at a time: the capture
/// thread in synchronous mode, the kind's worker in worker mode.
struct MediaChain {
    kind: MediaKind,
    decoder: Decoder,
    converter: Converter,
    encoder: Encoder,
    frame_count: i64,
    muxer: Arc<Muxer>,
}

enum Converter {
    Video(VideoConverter),
    Audio(AudioConverter),
}

impl Converter {
    fn send_frame(&mut self, frame: rsmpeg::avutil::AVFrame) -> Result<SendState> {
        match self {
            Converter::Video(converter) => converter.send_frame(frame),
            Converter::Audio(converter) => converter.send_frame(frame),
        }
    }

    fn receive_frame(&mut self, sequence_number: i64) -> Result<Option<rsmpeg::avutil::AVFrame>> {
        match self {
            Converter::Video(converter) => converter.receive_frame(sequence_number),
            Converter::Audio(converter) => converter.receive_frame(sequence_number),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Converter::Video(converter) => converter.flush(),
            // The audio FIFO needs no end-of-stream signal; whole frames
            // are pulled out below and a sub-frame remainder is dropped.
            Converter::Audio(_) => Ok(()),
        }
    }
}

impl MediaChain {
    /// Run one packet (or the end-of-stream marker) through the chain to
    /// completion, writing every resulting packet to the muxer.
    fn process_packet(&mut self, packet: Option<&AVPacket>) -> Result<()> {
        loop {
            let state = self.decoder.send_packet(packet)?;
            self.drain_decoder()?;
            if state == SendState::Accepted {
                return Ok(());
            }
            // Saturated: output drained above, retry the same packet.
        }
    }

    fn drain_decoder(&mut self) -> Result<()> {
        while let Some(frame) = self.decoder.receive_frame()? {
            self.converter.send_frame(frame)?;
            self.drain_converter()?;
        }
        Ok(())
    }

    fn drain_converter(&mut self) -> Result<()> {
        while let Some(frame) = self.converter.receive_frame(self.frame_count)? {
            self.frame_count += 1;
            self.encode_frame(Some(&frame))?;
        }
        Ok(())
    }

    fn encode_frame(&mut self, frame: Option<&rsmpeg::avutil::AVFrame>) -> Result<()> {
        loop {
            let state = self.encoder.send_frame(frame)?;
            self.drain_encoder()?;
            if state == SendState::Accepted {
                return Ok(());
            }
        }
    }

    fn drain_encoder(&mut self) -> Result<()> {
        while let Some(packet) = self.encoder.receive_packet()? {
            self.muxer.write_packet(packet, self.kind)?;
        }
        Ok(())
    }

    /// Decoder drain, converter drain, encoder drain, in that order.
    fn flush(&mut self) -> Result<()> {
        self.process_packet(None)?;
        self.converter.flush()?;
        self.drain_converter()?;
        self.encode_frame(None)?;
        tracing::debug!(kind = self.kind.label(), frames = self.frame_count, "chain flushed");
        Ok(())
    }
}

unsafe impl Send for MediaChain {}

/// One-slot handoff between the capture thread and a kind's worker. The
/// producer blocks while the slot is full, the worker while it is empty;
/// both wait on the same condition variable.
struct Mailbox {
    state: Mutex<MailboxState>,
    cv: Condvar,
}

struct MailboxState {
    packet: Option<AVPacket>,
    stop: bool,
    /// First error from the worker, re-raised by the next `step`/`flush`.
    error: Option<CaptureError>,
    /// The chain comes back here when the worker exits, so `flush` can
    /// drain it on the capture thread.
    chain: Option<MediaChain>,
}

unsafe impl Send for MailboxState {}

enum Lane {
    Inline(MediaChain),
    Worker(WorkerLane),
}

struct WorkerLane {
    mailbox: Arc<Mailbox>,
    handle: Option<JoinHandle<()>>,
}

fn worker_loop(mailbox: Arc<Mailbox>, mut chain: MediaChain) {
    let kind = chain.kind;
    loop {
        let packet = {
            let mut state = mailbox.state.lock().unwrap();
            loop {
                if let Some(packet) = state.packet.take() {
                    // Slot freed, wake a possibly blocked producer.
                    mailbox.cv.notify_all();
                    break packet;
                }
                if state.stop {
                    state.chain = Some(chain);
                    mailbox.cv.notify_all();
                    return;
                }
                state = mailbox.cv.wait(state).unwrap();
            }
        };

        if let Err(e) = chain.process_packet(Some(&packet)) {
            tracing::error!(kind = kind.label(), error = %e, "background worker failed");
            let mut state = mailbox.state.lock().unwrap();
            state.error = Some(e);
            state.chain = Some(chain);
            mailbox.cv.notify_all();
            return;
        }
    }
}

/// Orchestrates the capture-to-mux chain: reads packets from one demuxer,
/// rebases their timestamps across pauses and routes them through the
/// per-kind chains into the shared muxer.
///
/// With `use_background_workers` every kind gets its own worker thread fed
/// through a one-slot mailbox — recommended when a single demuxer delivers
/// both kinds, so a slow video encode cannot starve audio reads.
pub struct Pipeline {
    demuxer: Demuxer,
    muxer: Arc<Muxer>,
    use_background_workers: bool,
    lanes: [Option<Lane>; 2],
    aligners: [Option<PtsAligner>; 2],
    resync_pending: [bool; 2],
    recovery_armed: bool,
}

impl Pipeline {
    pub fn new(demuxer: Demuxer, muxer: Arc<Muxer>, use_background_workers: bool) -> Self {
        Self {
            demuxer,
            muxer,
            use_background_workers,
            lanes: [None, None],
            aligners: [None, None],
            resync_pending: [false, false],
            recovery_armed: false,
        }
    }

    /// Set up the video chain: decoder for the capture stream, converter
    /// cropping to `crop_offset` and scaling to the settings' resolution,
    /// H264 encoder, output stream registration.
    pub fn init_video(
        &mut self,
        settings: &VideoSettings,
        crop_offset: Option<(i32, i32)>,
    ) -> Result<()> {
        let decoder = Decoder::from_capture(&self.demuxer, MediaKind::Video)?;
        let encoder = Encoder::new_video(settings, self.muxer.global_header())?;
        let converter = VideoConverter::new(
            decoder.codec_context(),
            encoder.codec_context(),
            crop_offset,
        )?;
        self.muxer.add_video_stream(encoder.codec_context())?;

        let params = self.demuxer.video_params()?;
        // One output frame period, expressed in the input stream's clock.
        let frame_duration = av_rescale_q(1, encoder.time_base(), params.time_base);

        self.install(
            MediaKind::Video,
            MediaChain {
                kind: MediaKind::Video,
                decoder,
                converter: Converter::Video(converter),
                encoder,
                frame_count: 0,
                muxer: Arc::clone(&self.muxer),
            },
            frame_duration,
        )
    }

    /// Set up the audio chain: decoder, resampler + FIFO converter, AAC
    /// encoder, output stream registration.
    pub fn init_audio(&mut self, settings: &AudioSettings) -> Result<()> {
        let decoder = Decoder::from_capture(&self.demuxer, MediaKind::Audio)?;
        let encoder = Encoder::new_audio(settings, self.muxer.global_header())?;
        let converter = AudioConverter::new(decoder.codec_context(), encoder.codec_context())?;
        self.muxer.add_audio_stream(encoder.codec_context())?;

        let params = self.demuxer.audio_params()?;
        let frame_duration =
            av_rescale_q(encoder.frame_size() as i64, encoder.time_base(), params.time_base);

        self.install(
            MediaKind::Audio,
            MediaChain {
                kind: MediaKind::Audio,
                decoder,
                converter: Converter::Audio(converter),
                encoder,
                frame_count: 0,
                muxer: Arc::clone(&self.muxer),
            },
            frame_duration,
        )
    }

    fn install(&mut self, kind: MediaKind, chain: MediaChain, frame_duration: i64) -> Result<()> {
        let slot = kind.index();
        if self.lanes[slot].is_some() {
            return Err(CaptureError::InvalidState("media kind initialized twice"));
        }
        self.aligners[slot] = Some(PtsAligner::new(frame_duration));

        let lane = if self.use_background_workers {
            let mailbox = Arc::new(Mailbox {
                state: Mutex::new(MailboxState {
                    packet: None,
                    stop: false,
                    error: None,
                    chain: None,
                }),
                cv: Condvar::new(),
            });
            let worker_mailbox = Arc::clone(&mailbox);
            let handle = thread::Builder::new()
                .name(format!("screencast-{}", kind.label()))
                .spawn(move || worker_loop(worker_mailbox, chain))
                .map_err(|e| CaptureError::Worker(format!("cannot spawn worker: {}", e)))?;
            Lane::Worker(WorkerLane {
                mailbox,
                handle: Some(handle),
            })
        } else {
            Lane::Inline(chain)
        };

        self.lanes[slot] = Some(lane);
        Ok(())
    }

    /// Read one packet from the demuxer and run it through its chain.
    ///
    /// With `recovering_from_pause` set, the next packet of each active
    /// kind is not processed; it realigns that kind's clock and is
    /// discarded, so the output resumes one frame period after the last
    /// pre-pause packet.
    pub fn step(&mut self, recovering_from_pause: bool) -> Result<StepStatus> {
        self.raise_worker_error()?;

        if recovering_from_pause && !self.recovery_armed {
            self.recovery_armed = true;
            self.demuxer.flush_buffers();
            for (slot, lane) in self.lanes.iter().enumerate() {
                self.resync_pending[slot] = lane.is_some();
            }
        } else if !recovering_from_pause {
            self.recovery_armed = false;
        }

        let (mut packet, kind) = match self.demuxer.read_packet()? {
            Demuxed::Video(packet) => (packet, MediaKind::Video),
            Demuxed::Audio(packet) => (packet, MediaKind::Audio),
            Demuxed::Other => return Ok(StepStatus::Empty),
            Demuxed::Again => return Ok(StepStatus::Empty),
            Demuxed::Exhausted => return Ok(StepStatus::Exhausted),
        };

        let slot = kind.index();
        if self.lanes[slot].is_none() {
            // Stream kind present in the capture but not transcoded.
            return Ok(StepStatus::Empty);
        }

        if self.resync_pending[slot] {
            self.resync_pending[slot] = false;
            if let Some(aligner) = self.aligners[slot].as_mut() {
                aligner.resync(packet.pts);
            }
            return Ok(StepStatus::Processed);
        }

        if let Some(aligner) = self.aligners[slot].as_mut() {
            aligner.rebase(&mut packet);
        }

        self.dispatch(kind, packet)?;
        Ok(StepStatus::Processed)
    }

    fn dispatch(&mut self, kind: MediaKind, packet: AVPacket) -> Result<()> {
        match self.lanes[kind.index()].as_mut().unwrap() {
            Lane::Inline(chain) => chain.process_packet(Some(&packet)),
            Lane::Worker(worker) => {
                let mut state = worker.mailbox.state.lock().unwrap();
                loop {
                    if let Some(e) = state.error.take() {
                        return Err(e);
                    }
                    if state.chain.is_some() {
                        return Err(CaptureError::Worker(format!(
                            "{} worker is no longer running",
                            kind.label()
                        )));
                    }
                    if state.packet.is_none() {
                        state.packet = Some(packet);
                        worker.mailbox.cv.notify_all();
                        return Ok(());
                    }
                    state = worker.mailbox.cv.wait(state).unwrap();
                }
            }
        }
    }

    fn raise_worker_error(&mut self) -> Result<()> {
        for lane in self.lanes.iter_mut().flatten() {
            if let Lane::Worker(worker) = lane {
                let mut state = worker.mailbox.state.lock().unwrap();
                if let Some(e) = state.error.take() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stop the workers, drain every stage of every chain and flush the
    /// muxer's interleaver. Must run before the muxer's `close_file`.
    ///
    /// A chain that already failed is skipped; the remaining kinds still
    /// drain completely so the file can be finalized. The first error
    /// encountered is returned after all kinds were attempted.
    pub fn flush(&mut self) -> Result<()> {
        let mut first_error: Option<CaptureError> = None;

        for slot in 0..self.lanes.len() {
            let Some(lane) = self.lanes[slot].take() else {
                continue;
            };
            let chain = match lane {
                Lane::Inline(chain) => Some(chain),
                Lane::Worker(mut worker) => {
                    {
                        let mut state = worker.mailbox.state.lock().unwrap();
                        state.stop = true;
                        worker.mailbox.cv.notify_all();
                    }
                    if let Some(handle) = worker.handle.take() {
                        let _ = handle.join();
                    }
                    let mut state = worker.mailbox.state.lock().unwrap();
                    if let Some(e) = state.error.take() {
                        // The chain died mid-packet; its codecs are in an
                        // undefined state, do not drain it.
                        first_error.get_or_insert(e);
                        state.chain.take();
                        None
                    } else {
                        state.chain.take()
                    }
                }
            };

            if let Some(mut chain) = chain {
                if let Err(e) = chain.flush() {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.muxer.flush() {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether a kind was initialized on this pipeline.
    pub fn handles(&self, kind: MediaKind) -> bool {
        self.lanes[kind.index()].is_some()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Workers must not outlive the pipeline even when flush was never
        // reached.
        for lane in self.lanes.iter_mut() {
            if let Some(Lane::Worker(worker)) = lane {
                {
                    let mut state = worker.mailbox.state.lock().unwrap();
                    state.stop = true;
                    worker.mailbox.cv.notify_all();
                }
                if let Some(handle) = worker.handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}
