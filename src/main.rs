use anyhow::Result;
use log::{info, warn};
use myy_sdiout::core::{
    AudioCodec, AudioFormat, ChromaFormat, EsBlock, EsFormat, EsKind, MonotonicClock, OutputConfig, TimePoint,
    VideoFormat, VideoFrame,
};
use myy_sdiout::hw::simulated::{SimulatedCard, SimulatedDriver};
use myy_sdiout::stream::BuiltinDecoders;
use myy_sdiout::{SdiOutput, SdiStream};
use std::f32::consts::PI;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 演示时长（帧）
const DEMO_FRAMES: i64 = 250;
const TONE_HZ: f32 = 1000.0;

/// 8 条 75% 彩条（BT.709 8 位），随帧号水平滚动
fn color_bars(fmt: &VideoFormat, n: i64) -> Vec<u8> {
    const BARS: [(u8, u8, u8); 8] = [
        (180, 128, 128),
        (168, 44, 136),
        (145, 147, 44),
        (133, 63, 52),
        (63, 193, 204),
        (51, 109, 212),
        (28, 212, 120),
        (16, 128, 128),
    ];
    let mut frame = VideoFrame::new(fmt.width, fmt.height, fmt.chroma);
    let w = fmt.width as usize;
    let bar_width = (w / BARS.len()).max(1);
    let shift = (n as usize * 8) % w;
    let bar = |x: usize| BARS[((x + shift) % w / bar_width).min(BARS.len() - 1)];

    for y in 0..fmt.height as usize {
        let row = frame.planes[0].row_mut(y);
        for (x, px) in row.iter_mut().enumerate().take(w) {
            *px = bar(x).0;
        }
    }
    for plane in 1..3 {
        let p = &mut frame.planes[plane];
        for y in 0..p.lines {
            let pitch = p.pitch;
            for (cx, px) in p.row_mut(y).iter_mut().enumerate().take(pitch) {
                let (_, u, v) = bar(cx * 2);
                *px = if plane == 1 { u } else { v };
            }
        }
    }
    frame.planes.into_iter().flat_map(|p| p.data).collect()
}

/// 一帧时长的 1 kHz 正弦（-20 dBFS，立体声 S16 小端）
fn tone(first_sample: i64, samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| {
            let t = (first_sample + i as i64) as f32 / 48000.0;
            let v = ((2.0 * PI * TONE_HZ * t).sin() * 0.1 * i16::MAX as f32) as i16;
            [v.to_le_bytes(), v.to_le_bytes()].concat()
        })
        .collect()
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("📺 MYY SDI 输出演示启动");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("读取配置文件 {}", path);
            OutputConfig::from_json_file(&path).map_err(|e| anyhow::anyhow!("配置加载失败: {}", e))?
        }
        None => OutputConfig::default(),
    };

    let card = SimulatedCard::new("Simulated SDI 4K");
    let simulated = card.simulated_output();
    let driver = SimulatedDriver::new().with_card(card);
    let output = SdiOutput::open(&driver, config.clone(), Arc::new(MonotonicClock::new()))
        .map_err(|e| anyhow::anyhow!("无法打开 SDI 输出: {}", e))?;
    info!("✅ 已打开 {}", output.card_name());

    let vf = VideoFormat::new(1920, 1080, 25, 1, ChromaFormat::I420);
    let af = AudioFormat {
        codec: AudioCodec::PcmS16Le,
        rate: 48000,
        channels: 2,
    };
    let mut video = SdiStream::create(&output, &EsFormat { id: 1, kind: EsKind::Video(vf) }, &BuiltinDecoders)?;
    let mut audio = if config.channels > 0 {
        Some(SdiStream::create(&output, &EsFormat { id: 2, kind: EsKind::Audio(af) }, &BuiltinDecoders)?)
    } else {
        None
    };

    let frame_time = vf.frame_duration();
    let samples_per_frame = frame_time.to_samples(48000) as usize;
    let lead = TimePoint::from_millis(config.preroll_ms as i64);
    let started = Instant::now();
    let mut advanced = Duration::ZERO;
    let (mut shown, mut with_vanc) = (0usize, 0usize);
    // 模拟板卡只保留最近的显示记录，边播边取
    let mut advance_hw = || {
        let now = started.elapsed();
        simulated.advance(TimePoint::from_micros((now - advanced).as_micros() as i64));
        advanced = now;
        for f in simulated.take_displayed() {
            shown += 1;
            if f.frame.ancillary.as_ref().is_some_and(|a| a.line(config.afd_line).is_some()) {
                with_vanc += 1;
            }
        }
    };

    for n in 0..DEMO_FRAMES {
        let pts = TimePoint::from_micros(n * frame_time.as_micros());
        // 每帧一对 CEA-608 空字节
        let block = EsBlock::new(color_bars(&vf, n), pts).with_captions(vec![0xFC, 0x80, 0x80]);
        if let Err(e) = video.send(block) {
            warn!("视频帧 {} 发送失败: {}", n, e);
        }
        if let Some(audio) = audio.as_mut() {
            let data = tone(n * samples_per_frame as i64, samples_per_frame);
            if let Err(e) = audio.send(EsBlock::new(data, pts)) {
                warn!("音频块 {} 发送失败: {}", n, e);
            }
        }

        // 解码端最多领先播放一个预卷时长
        while TimePoint::from_micros(started.elapsed().as_micros() as i64) + lead < pts {
            advance_hw();
            thread::sleep(Duration::from_millis(5));
        }
        advance_hw();
    }

    video.drain()?;
    if let Some(audio) = audio.as_mut() {
        audio.drain()?;
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while !output.is_drained() && Instant::now() < deadline {
        advance_hw();
        thread::sleep(Duration::from_millis(5));
    }

    advance_hw();
    let stats = output.stats();
    info!(
        "🎬 播放结束: 显示 {} 帧（{} 帧带 AFD），统计 {}",
        shown,
        with_vanc,
        serde_json::to_string(&stats)?
    );

    output.close().map_err(|e| anyhow::anyhow!("关闭输出失败: {}", e))?;
    Ok(())
}
