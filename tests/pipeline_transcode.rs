//! End-to-end pipeline runs against file-backed capture sources. The
//! input media is synthesized with the crate's own encoder and muxer, so
//! the suite needs no binary assets.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use screencast::rsmpeg::avutil::{AVChannelLayout, AVFrame};
use screencast::{
    ffi, AudioSettings, CaptureInput, Demuxed, DemuxerBuilder, Encoder, MediaKind, Muxer, Pipeline,
    RecorderBuilder, SendState, StepStatus, VideoSettings,
};

const WIDTH: i32 = 640;
const HEIGHT: i32 = 480;
const FPS: i32 = 30;
const SAMPLE_RATE: i32 = 44100;

fn video_frame(width: i32, height: i32, index: i64) -> AVFrame {
    let mut frame = AVFrame::new();
    frame.set_format(ffi::AV_PIX_FMT_YUV420P);
    frame.set_width(width);
    frame.set_height(height);
    frame.alloc_buffer().unwrap();
    unsafe {
        let raw = frame.as_mut_ptr();
        // A moving luma gradient keeps the encoder honest without costing
        // anything to generate.
        for row in 0..height {
            let line = (*raw).data[0].offset((row * (*raw).linesize[0]) as isize);
            std::ptr::write_bytes(line, ((row + index as i32) & 0xff) as u8, width as usize);
        }
        for plane in 1..3 {
            let size = ((*raw).linesize[plane] * height / 2) as usize;
            std::ptr::write_bytes((*raw).data[plane], 128, size);
        }
    }
    frame.set_pts(index);
    frame
}

fn audio_frame(nb_samples: i32, index: i64) -> AVFrame {
    let mut frame = AVFrame::new();
    frame.set_format(ffi::AV_SAMPLE_FMT_FLTP);
    frame.set_sample_rate(SAMPLE_RATE);
    frame.set_ch_layout(AVChannelLayout::from_nb_channels(2).into_inner());
    frame.set_nb_samples(nb_samples);
    frame.alloc_buffer().unwrap();
    unsafe {
        let raw = frame.as_mut_ptr();
        for channel in 0..2 {
            let plane = (*raw).data[channel] as *mut f32;
            for i in 0..nb_samples {
                let t = (index * nb_samples as i64 + i as i64) as f32 / SAMPLE_RATE as f32;
                *plane.offset(i as isize) = (t * 440.0 * std::f32::consts::TAU).sin() * 0.2;
            }
        }
    }
    frame.set_pts(index * nb_samples as i64);
    frame
}

fn encode_all(encoder: &mut Encoder, frame: Option<&AVFrame>, muxer: &Muxer, kind: MediaKind) {
    loop {
        let state = encoder.send_frame(frame).unwrap();
        while let Some(packet) = encoder.receive_packet().unwrap() {
            muxer.write_packet(packet, kind).unwrap();
        }
        if state == SendState::Accepted {
            break;
        }
    }
}

/// Synthesize an H264/MP4 file, optionally with an AAC track.
fn write_capture_file(path: &Path, frames: i64, with_audio: bool) {
    let muxer = Muxer::new(path).unwrap();
    let mut video = Encoder::new_video(
        &VideoSettings::preset_h264_yuv420p(WIDTH, HEIGHT, FPS),
        muxer.global_header(),
    )
    .unwrap();
    muxer.add_video_stream(video.codec_context()).unwrap();

    let mut audio = if with_audio {
        let encoder = Encoder::new_audio(
            &AudioSettings::preset_aac(SAMPLE_RATE, 2),
            muxer.global_header(),
        )
        .unwrap();
        muxer.add_audio_stream(encoder.codec_context()).unwrap();
        Some(encoder)
    } else {
        None
    };

    muxer.open_file().unwrap();

    let audio_frames = if audio.is_some() {
        // Cover the same wall-clock span as the video track.
        let samples = frames * SAMPLE_RATE as i64 / FPS as i64;
        let frame_size = audio.as_ref().unwrap().frame_size() as i64;
        samples / frame_size
    } else {
        0
    };

    for i in 0..frames.max(audio_frames) {
        if i < frames {
            let frame = video_frame(WIDTH, HEIGHT, i);
            encode_all(&mut video, Some(&frame), &muxer, MediaKind::Video);
        }
        if let Some(encoder) = audio.as_mut() {
            if i < audio_frames {
                let frame = audio_frame(encoder.frame_size(), i);
                encode_all(encoder, Some(&frame), &muxer, MediaKind::Audio);
            }
        }
    }

    encode_all(&mut video, None, &muxer, MediaKind::Video);
    if let Some(encoder) = audio.as_mut() {
        encode_all(encoder, None, &muxer, MediaKind::Audio);
    }
    muxer.flush().unwrap();
    muxer.close_file().unwrap();
}

struct FileStats {
    video_pts: Vec<i64>,
    video_dts: Vec<i64>,
    audio_pts: Vec<i64>,
    has_audio_stream: bool,
    video_time_base: ffi::AVRational,
}

fn read_stats(path: &Path) -> FileStats {
    let mut demuxer = DemuxerBuilder::new(path.to_str().unwrap()).build().unwrap();
    let video_time_base = demuxer.video_params().unwrap().time_base;
    let has_audio_stream = demuxer.has_audio();
    let mut stats = FileStats {
        video_pts: Vec::new(),
        video_dts: Vec::new(),
        audio_pts: Vec::new(),
        has_audio_stream,
        video_time_base,
    };
    loop {
        match demuxer.read_packet().unwrap() {
            Demuxed::Video(packet) => {
                stats.video_pts.push(packet.pts);
                stats.video_dts.push(packet.dts);
            }
            Demuxed::Audio(packet) => stats.audio_pts.push(packet.pts),
            Demuxed::Other | Demuxed::Again => {}
            Demuxed::Exhausted => break,
        }
    }
    stats
}

fn assert_monotonic(values: &[i64], what: &str) {
    for window in values.windows(2) {
        assert!(
            window[1] >= window[0],
            "{} timestamps went backwards: {} after {}",
            what,
            window[1],
            window[0]
        );
    }
}

/// Drive a pipeline over a file-backed source to completion.
fn run_to_exhaustion(pipeline: &mut Pipeline) {
    for _ in 0..1_000_000 {
        match pipeline.step(false).unwrap() {
            StepStatus::Exhausted => return,
            StepStatus::Processed | StepStatus::Empty => {}
        }
    }
    panic!("pipeline never exhausted its input");
}

#[test]
fn video_only_file_has_expected_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("video_only.mp4");
    write_capture_file(&path, 90, false);

    let stats = read_stats(&path);
    assert!(!stats.has_audio_stream, "no audio stream was written");
    assert_eq!(stats.video_pts.len(), 90);
    assert_monotonic(&stats.video_dts, "video dts");

    let mut sorted = stats.video_pts.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, stats.video_pts, "realtime preset must not reorder");

    // Last frame sits at (N-1)/fps seconds, in the stream's time base.
    let tb = stats.video_time_base;
    let expected =
        (89.0 / FPS as f64 * tb.den as f64 / tb.num as f64).round();
    let last = *stats.video_pts.last().unwrap() as f64;
    assert!(
        (last - expected).abs() <= 1.0,
        "last pts {} should be about {}",
        last,
        expected
    );

    assert!(path.metadata().unwrap().len() > 0);
}

#[test]
fn synchronous_pipeline_transcodes_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.mp4");
    let output = dir.path().join("copy.mp4");
    write_capture_file(&source, 60, false);

    let demuxer = DemuxerBuilder::new(source.to_str().unwrap()).build().unwrap();
    let muxer = Arc::new(Muxer::new(&output).unwrap());
    let mut pipeline = Pipeline::new(demuxer, Arc::clone(&muxer), false);
    pipeline
        .init_video(&VideoSettings::preset_h264_yuv420p(WIDTH, HEIGHT, FPS), None)
        .unwrap();
    muxer.open_file().unwrap();

    run_to_exhaustion(&mut pipeline);
    pipeline.flush().unwrap();
    muxer.close_file().unwrap();

    let stats = read_stats(&output);
    assert_eq!(stats.video_pts.len(), 60);
    assert_monotonic(&stats.video_pts, "video pts");
}

#[test]
fn worker_pipeline_interleaves_both_streams() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source_av.mp4");
    let output = dir.path().join("copy_av.mp4");
    write_capture_file(&source, 60, true);

    let demuxer = DemuxerBuilder::new(source.to_str().unwrap()).build().unwrap();
    let audio_params = demuxer.audio_params().unwrap();
    let audio_settings = match audio_params.kind {
        screencast::KindParams::Audio {
            sample_rate,
            nb_channels,
            ..
        } => AudioSettings::preset_aac(sample_rate, nb_channels),
        _ => unreachable!(),
    };

    let muxer = Arc::new(Muxer::new(&output).unwrap());
    let mut pipeline = Pipeline::new(demuxer, Arc::clone(&muxer), true);
    pipeline
        .init_video(&VideoSettings::preset_h264_yuv420p(WIDTH, HEIGHT, FPS), None)
        .unwrap();
    pipeline.init_audio(&audio_settings).unwrap();
    muxer.open_file().unwrap();

    run_to_exhaustion(&mut pipeline);
    pipeline.flush().unwrap();
    muxer.close_file().unwrap();

    let stats = read_stats(&output);
    assert!(stats.has_audio_stream);
    assert!(stats.video_pts.len() >= 55, "video survived the transcode");
    assert!(!stats.audio_pts.is_empty(), "audio survived the transcode");
    assert_monotonic(&stats.video_pts, "video pts");
    assert_monotonic(&stats.audio_pts, "audio pts");

    // Audio frames are repackaged to the encoder's frame size, so every
    // packet lands on a frame-size boundary of the 1/sample_rate clock.
    let frame_size = 1024;
    for pts in &stats.audio_pts {
        assert_eq!(pts.rem_euclid(frame_size), 0, "audio pts {} off-grid", pts);
    }
}

#[test]
fn cropped_pipeline_outputs_region_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source_crop.mp4");
    let output = dir.path().join("cropped.mp4");
    write_capture_file(&source, 30, false);

    let demuxer = DemuxerBuilder::new(source.to_str().unwrap()).build().unwrap();
    let muxer = Arc::new(Muxer::new(&output).unwrap());
    let mut pipeline = Pipeline::new(demuxer, Arc::clone(&muxer), false);
    pipeline
        .init_video(
            &VideoSettings::preset_h264_yuv420p(320, 240, FPS),
            Some((32, 16)),
        )
        .unwrap();
    muxer.open_file().unwrap();

    run_to_exhaustion(&mut pipeline);
    pipeline.flush().unwrap();
    muxer.close_file().unwrap();

    let params = {
        let demuxer = DemuxerBuilder::new(output.to_str().unwrap()).build().unwrap();
        demuxer.video_params().unwrap()
    };
    match params.kind {
        screencast::KindParams::Video { width, height, .. } => {
            assert_eq!((width, height), (320, 240));
        }
        _ => unreachable!(),
    }
}

#[test]
fn recorder_stop_is_idempotent_and_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("session_source.mp4");
    let output = dir.path().join("session.mp4");
    write_capture_file(&source, 60, true);

    let input = CaptureInput::new(source.to_str().unwrap());
    let mut recorder = RecorderBuilder::new(input)
        .capture_audio(true)
        .with_frame_rate(FPS)
        .start(&output)
        .unwrap();

    // Exercise the pause path; with a file-backed source the capture may
    // already have drained, which must be harmless.
    std::thread::sleep(Duration::from_millis(50));
    recorder.pause();
    std::thread::sleep(Duration::from_millis(20));
    recorder.resume();

    recorder.stop().unwrap();
    recorder.stop().unwrap();

    let stats = read_stats(&output);
    assert!(!stats.video_pts.is_empty());
    assert_monotonic(&stats.video_pts, "video pts");
    assert!(output.metadata().unwrap().len() > 0);
}
