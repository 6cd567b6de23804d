mod common;

use common::*;
use myy_sdiout::core::{CaptionFormat, EsBlock, EsFormat, EsKind, OutputConfig, TimePoint};
use myy_sdiout::hw::simulated::DisplayedFrame;
use myy_sdiout::hw::HwPixelFormat;
use myy_sdiout::sdi::ancillary::{parse_cdp, Afd, Data10bitPacket};
use myy_sdiout::sdi::v210;

const CC: [u8; 3] = [0xFC, 0x94, 0x2C];

fn video_only(config: OutputConfig) -> OutputConfig {
    OutputConfig { channels: 0, ..config }
}

fn vanc_packet(frame: &DisplayedFrame, line: u32) -> Option<Data10bitPacket> {
    let anc = frame.frame.ancillary.as_ref()?;
    let words = v210::unpack_words(anc.line(line)?, 96);
    Data10bitPacket::parse(&words)
}

/// 播放 5 帧并取回显示结果
fn play_five(h: &Harness) -> Vec<DisplayedFrame> {
    assert!(wait_for(|| h.sim.is_playing()));
    h.advance(TimePoint::from_micros(5 * FRAME_US));
    let mut shown = Vec::new();
    assert!(wait_for(|| {
        shown.extend(h.sim.take_displayed());
        shown.len() >= 5
    }));
    shown
}

#[test]
fn ten_bit_frames_carry_afd_and_captions() {
    let h = open(video_only(OutputConfig {
        afd: 10,
        ar: 1,
        ..Default::default()
    }));
    let mut video = h.stream(&video_es(1));
    for n in 0..5 {
        let block = EsBlock::new(picture(100, 128, 128), TimePoint::from_micros(n * FRAME_US)).with_captions(CC.to_vec());
        video.send(block).unwrap();
    }

    let shown = play_five(&h);
    for (i, f) in shown.iter().take(5).enumerate() {
        assert_eq!(f.frame.format, HwPixelFormat::Yuv10);

        let afd = vanc_packet(f, 16).and_then(|p| Afd::parse(&p)).expect("AFD packet");
        assert_eq!((afd.code, afd.aspect_ratio), (10, 1));

        let packet = vanc_packet(f, 15).expect("caption packet");
        assert_eq!((packet.did(), packet.sdid()), (0x61, 0x01));
        let cdp = parse_cdp(&packet.payload()).expect("valid CDP");
        assert_eq!(cdp.cc_data, CC);
        // 25 fps
        assert_eq!(cdp.rate_code, 3);
        assert_eq!(cdp.counter, i as u16);

        let pic = v210::unpack_picture(&f.frame.data, f.frame.row_bytes, WIDTH, HEIGHT).unwrap();
        assert_eq!(pic.planes[0].sample16(0, 0), 400);
        assert_eq!(pic.planes[1].sample16(0, 0), 512);
    }
}

#[test]
fn frames_without_captions_only_carry_afd() {
    let h = open(video_only(OutputConfig::default()));
    let mut video = h.stream(&video_es(1));
    send_frames(&mut video, 0, 5, 0);

    let shown = play_five(&h);
    assert!(vanc_packet(&shown[0], 16).is_some());
    assert!(vanc_packet(&shown[0], 15).is_none());
}

#[test]
fn separate_captions_stream_is_associated_by_timestamp() {
    let h = open(video_only(OutputConfig::default()));
    let mut video = h.stream(&video_es(1));
    let mut captions = h.stream(&EsFormat {
        id: 2,
        kind: EsKind::Captions(CaptionFormat::Cea608),
    });

    // 第 2 帧的字幕早到，两组数据合并进同一帧
    captions
        .send(EsBlock::new(vec![0xFC, 0x80, 0x80], TimePoint::from_micros(2 * FRAME_US)))
        .unwrap();
    captions
        .send(EsBlock::new(vec![0xFD, 0x80, 0x80], TimePoint::from_micros(2 * FRAME_US + 10_000)))
        .unwrap();
    send_frames(&mut video, 0, 5, 0);

    let shown = play_five(&h);
    let with_cc: Vec<_> = shown.iter().filter(|f| vanc_packet(f, 15).is_some()).collect();
    assert_eq!(with_cc.len(), 1);
    assert_eq!(with_cc[0].time, 2 * FRAME_US);
    let cdp = parse_cdp(&vanc_packet(with_cc[0], 15).unwrap().payload()).unwrap();
    assert_eq!(cdp.cc_data, vec![0xFC, 0x80, 0x80, 0xFD, 0x80, 0x80]);
}

#[test]
fn eight_bit_output_copies_uyvy_rows() {
    let h = open(video_only(OutputConfig {
        tenbits: false,
        ..Default::default()
    }));
    let mut video = h.stream(&video_es(1));
    let (_, flags) = h.sim.video_enabled().unwrap();
    assert!(!flags.vanc);

    for n in 0..5 {
        video
            .send(EsBlock::new(picture(100, 50, 200), TimePoint::from_micros(n * FRAME_US)))
            .unwrap();
    }
    let shown = play_five(&h);
    let f = &shown[0].frame;
    assert_eq!(f.format, HwPixelFormat::Yuv8);
    assert!(f.ancillary.is_none());
    assert_eq!(&f.data[..4], &[50, 100, 200, 100]);
    assert_eq!(f.data.len(), WIDTH as usize * 2 * HEIGHT as usize);
}

#[test]
fn nosignal_picture_fills_gaps_after_delay() {
    let path = std::env::temp_dir().join(format!("myy_sdiout_nosignal_{}.png", std::process::id()));
    image::RgbImage::from_pixel(WIDTH, HEIGHT, image::Rgb([255, 255, 255]))
        .save(&path)
        .unwrap();

    let h = open(video_only(OutputConfig {
        nosignal_delay: 1,
        nosignal_image: Some(path.clone()),
        ..Default::default()
    }));
    let mut video = h.stream(&video_es(1));
    send_frames(&mut video, 0, 5, 0);
    assert!(wait_for(|| h.sim.is_playing()));

    // 延迟未到：不补帧
    h.advance(TimePoint::from_micros(FRAME_US));
    settle();
    assert_eq!(h.stats().nosignal_frames, 0);

    h.clock.advance(TimePoint::from_millis(2000));
    h.sim.advance(TimePoint::from_micros(FRAME_US));
    assert!(wait_for(|| h.stats().nosignal_frames >= 2));

    h.sim.advance(TimePoint::from_micros(5 * FRAME_US));
    let mut shown = Vec::new();
    assert!(wait_for(|| {
        shown.extend(h.sim.take_displayed());
        shown.iter().any(|f| f.time == 5 * FRAME_US)
    }));
    let filler = shown.iter().find(|f| f.time == 5 * FRAME_US).unwrap();
    let pic = v210::unpack_picture(&filler.frame.data, filler.frame.row_bytes, WIDTH, HEIGHT).unwrap();
    assert_eq!(pic.planes[0].sample16(0, 0), 940);

    let _ = std::fs::remove_file(path);
}

#[test]
fn missing_nosignal_image_does_not_fail_open() {
    let h = open(OutputConfig {
        nosignal_image: Some("/nonexistent/nosignal.png".into()),
        ..Default::default()
    });
    assert!(h.output.add(&video_es(1)).is_ok());
}
