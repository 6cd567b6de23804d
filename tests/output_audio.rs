mod common;

use common::*;
use myy_sdiout::audio::smpte337;
use myy_sdiout::core::{OutputConfig, SdiError};
use myy_sdiout::SdiStream;

/// 每帧 40ms 的音频采样数
const BLOCK: usize = 1920;

fn send_audio(stream: &mut SdiStream, value: i16, channels: usize, blocks: i64, start_us: i64) {
    for k in 0..blocks {
        stream
            .send(pcm_block(value, channels, BLOCK, start_us + k * FRAME_US))
            .expect("send audio");
    }
}

fn samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
}

#[test]
fn preroll_waits_for_audio_target() {
    let h = open(OutputConfig::default());
    let mut video = h.stream(&video_es(1));
    let mut audio = h.stream(&pcm_es(2, 2));

    send_frames(&mut video, 0, 5, 1_000_000);
    assert!(wait_for(|| h.stats().video_scheduled == 5));
    settle();
    // 视频够了但还没有音频
    assert!(!h.sim.is_playing());

    send_audio(&mut audio, 1000, 2, 6, 1_000_000);
    assert!(wait_for(|| h.sim.is_playing()));
    assert_eq!(h.sim.playback_start(), Some(1_000_000));

    let submitted = h.sim.take_audio();
    assert_eq!(submitted[0].time, 1_000_000);
    let total: u32 = submitted.iter().map(|a| a.frames).sum();
    assert!(total >= 9600);
    assert!(samples(&submitted[0].data).iter().all(|&s| s == 1000));
}

#[test]
fn audio_before_stream_start_is_truncated() {
    let h = open(OutputConfig::default());
    let mut video = h.stream(&video_es(1));
    let mut audio = h.stream(&pcm_es(2, 2));

    send_frames(&mut video, 0, 5, 1_000_000);
    // 音频比视频早 100ms
    send_audio(&mut audio, 500, 2, 8, 900_000);
    assert!(wait_for(|| h.sim.is_playing()));

    let submitted = h.sim.take_audio();
    assert!(!submitted.is_empty());
    assert_eq!(submitted[0].time, 1_000_000);
    assert!(submitted.iter().all(|a| a.time >= 1_000_000));
    // 提交的时间连续
    for pair in submitted.windows(2) {
        let end = pair[0].time + pair[0].frames as i64 * 1_000_000 / 48_000;
        assert_eq!(pair[1].time, end);
    }
}

#[test]
fn declared_sources_share_the_multiplex() {
    let h = open(OutputConfig {
        channels: 8,
        audio: "1=0,1;2=4,5".into(),
        ..Default::default()
    });
    let mut video = h.stream(&video_es(10));
    let mut first = h.stream(&pcm_es(1, 2));
    let mut second = h.stream(&pcm_es(2, 2));
    // 未声明的流在仅声明模式下被拒绝
    assert!(matches!(h.output.add(&pcm_es(3, 2)), Err(SdiError::Unsupported(_))));
    assert_eq!(h.sim.audio_enabled(), Some((48000, 8)));

    send_frames(&mut video, 0, 5, 0);
    send_audio(&mut first, 1000, 2, 6, 0);
    settle();
    // 第二个源还没有数据，复用器不能输出
    assert!(h.sim.take_audio().is_empty());

    send_audio(&mut second, -2000, 2, 6, 0);
    assert!(wait_for(|| h.sim.is_playing()));

    let submitted = h.sim.take_audio();
    let s = samples(&submitted[0].data);
    assert_eq!(s.len(), submitted[0].frames as usize * 8);
    assert_eq!(&s[..8], &[1000, 1000, 0, 0, -2000, -2000, 0, 0]);
}

#[test]
fn compressed_stream_is_passed_through_as_bursts() {
    let h = open(OutputConfig {
        audio: "embed:3".into(),
        ..Default::default()
    });
    let mut video = h.stream(&video_es(1));
    let mut ac3 = h.stream(&ac3_es(3));
    assert!(matches!(ac3, SdiStream::Compressed(_)));

    send_frames(&mut video, 0, 5, 0);
    // 1536 采样 = 32ms
    for k in 0..8 {
        ac3.send(ac3_frame(k * 32_000)).unwrap();
    }
    assert!(wait_for(|| h.sim.is_playing()));

    let submitted = h.sim.take_audio();
    assert_eq!(submitted[0].time, 0);
    // 每次提交都是整数个突发
    assert!(submitted.iter().all(|a| a.frames % 1536 == 0));
    let (data_type, payload) = smpte337::parse_burst(&submitted[0].data).unwrap();
    assert_eq!(data_type, 1);
    assert_eq!(payload, ac3_frame(0).data);
}

#[test]
fn audio_submission_failure_is_counted_and_dropped() {
    let h = open(OutputConfig::default());
    h.sim.fail_next_audio(1);
    let mut video = h.stream(&video_es(1));
    let mut audio = h.stream(&pcm_es(2, 2));

    send_frames(&mut video, 0, 5, 0);
    send_audio(&mut audio, 100, 2, 10, 0);
    assert!(wait_for(|| h.sim.is_playing()));

    let stats = h.stats();
    assert_eq!(stats.audio_submit_failures, 1);
    let submitted = h.sim.take_audio();
    // 失败的块不会重试
    assert!(submitted[0].time > 0);
}

#[test]
fn drained_audio_does_not_block_preroll() {
    let h = open(OutputConfig::default());
    let mut video = h.stream(&video_es(1));
    let mut audio = h.stream(&pcm_es(2, 2));

    send_frames(&mut video, 0, 5, 0);
    settle();
    assert!(!h.sim.is_playing());

    audio.drain().unwrap();
    h.output.wake();
    assert!(wait_for(|| h.sim.is_playing()));
    assert!(audio.is_eos());
}

#[test]
fn stereo_source_is_downmixed_to_its_mapping() {
    let h = open(OutputConfig {
        channels: 8,
        audio: "1=6".into(),
        ..Default::default()
    });
    let mut video = h.stream(&video_es(10));
    let mut mono = h.stream(&pcm_es(1, 2));

    send_frames(&mut video, 0, 5, 0);
    // 左右声道求平均后写入单个槽位
    for k in 0..6 {
        let data: Vec<u8> = std::iter::repeat([400i16.to_le_bytes(), 800i16.to_le_bytes()].concat())
            .take(BLOCK)
            .flatten()
            .collect();
        mono.send(myy_sdiout::core::EsBlock::new(
            data,
            myy_sdiout::core::TimePoint::from_micros(k * FRAME_US),
        ))
        .unwrap();
    }
    assert!(wait_for(|| h.sim.is_playing()));

    let submitted = h.sim.take_audio();
    let s = samples(&submitted[0].data);
    assert_eq!(&s[..8], &[0, 0, 0, 0, 0, 0, 600, 0]);
}

#[test]
fn wide_layouts_are_submitted_in_bounded_blocks() {
    let h = open(OutputConfig {
        channels: 16,
        ..Default::default()
    });
    let mut video = h.stream(&video_es(1));
    let mut audio = h.stream(&pcm_es(2, 2));
    assert_eq!(h.sim.audio_enabled(), Some((48000, 16)));

    send_frames(&mut video, 0, 5, 0);
    send_audio(&mut audio, 700, 2, 6, 0);
    assert!(wait_for(|| h.sim.is_playing()));

    let submitted = h.sim.take_audio();
    // 16 声道 × 2 字节：64 KiB 最多 2048 帧
    assert!(submitted.len() > 1);
    assert!(submitted.iter().all(|a| a.frames <= 2048));
    assert!(submitted.iter().all(|a| a.data.len() == a.frames as usize * 32));
    let total: u32 = submitted.iter().map(|a| a.frames).sum();
    assert!(total >= 9600);
}
