#![allow(dead_code)]

use myy_sdiout::core::{
    AudioCodec, AudioFormat, ChromaFormat, EsBlock, EsFormat, EsKind, ManualClock, OutputConfig, OutputStats,
    TimePoint, VideoFormat,
};
use myy_sdiout::hw::simulated::{standard_modes, SimulatedCard, SimulatedDriver, SimulatedOutput};
use myy_sdiout::hw::DisplayMode;
use myy_sdiout::stream::BuiltinDecoders;
use myy_sdiout::{SdiOutput, SdiStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const WIDTH: u32 = 96;
pub const HEIGHT: u32 = 32;
/// 25 fps
pub const FRAME_US: i64 = 40_000;

/// 一个小尺寸 25p 模式，加上标准模式表
pub fn test_modes() -> Vec<DisplayMode> {
    let mut modes = vec![DisplayMode::new(b"tiny", "tiny 25p", WIDTH, HEIGHT, 1000, 25000)];
    modes.extend(standard_modes());
    modes
}

pub struct Harness {
    pub sim: Arc<SimulatedOutput>,
    pub clock: Arc<ManualClock>,
    pub output: Arc<SdiOutput>,
}

pub fn open(config: OutputConfig) -> Harness {
    let card = SimulatedCard::with_modes("sim", test_modes());
    let sim = card.simulated_output();
    let driver = SimulatedDriver::new().with_card(card);
    let clock = Arc::new(ManualClock::new());
    let output = SdiOutput::open(&driver, config, clock.clone()).expect("open output");
    Harness { sim, clock, output }
}

pub fn video_format() -> VideoFormat {
    VideoFormat::new(WIDTH, HEIGHT, 25, 1, ChromaFormat::I420)
}

pub fn video_es(id: i32) -> EsFormat {
    EsFormat {
        id,
        kind: EsKind::Video(video_format()),
    }
}

pub fn pcm_es(id: i32, channels: u16) -> EsFormat {
    EsFormat {
        id,
        kind: EsKind::Audio(AudioFormat {
            codec: AudioCodec::PcmS16Le,
            rate: 48000,
            channels,
        }),
    }
}

pub fn ac3_es(id: i32) -> EsFormat {
    EsFormat {
        id,
        kind: EsKind::Audio(AudioFormat {
            codec: AudioCodec::Ac3,
            rate: 48000,
            channels: 6,
        }),
    }
}

impl Harness {
    pub fn stream(&self, fmt: &EsFormat) -> SdiStream {
        SdiStream::create(&self.output, fmt, &BuiltinDecoders).expect("create stream")
    }

    pub fn stats(&self) -> OutputStats {
        self.output.stats()
    }

    /// 推进硬件和系统时钟
    pub fn advance(&self, d: TimePoint) {
        self.clock.advance(d);
        self.sim.advance(d);
    }
}

/// 纯色 I420 帧
pub fn picture(y: u8, u: u8, v: u8) -> Vec<u8> {
    let luma = (WIDTH * HEIGHT) as usize;
    let chroma = luma / 4;
    let mut data = vec![y; luma];
    data.extend(std::iter::repeat(u).take(chroma));
    data.extend(std::iter::repeat(v).take(chroma));
    data
}

pub fn send_frames(stream: &mut SdiStream, first: i64, count: i64, start_us: i64) {
    for n in first..first + count {
        let pts = TimePoint::from_micros(start_us + n * FRAME_US);
        stream.send(EsBlock::new(picture(100, 128, 128), pts)).expect("send picture");
    }
}

/// 常量值的 S16 PCM 块
pub fn pcm_block(value: i16, channels: usize, samples: usize, pts_us: i64) -> EsBlock {
    let data: Vec<u8> = std::iter::repeat(value.to_le_bytes())
        .take(samples * channels)
        .flatten()
        .collect();
    EsBlock::new(data, TimePoint::from_micros(pts_us))
}

/// 一个 AC-3 帧：同步字 + 填充
pub fn ac3_frame(pts_us: i64) -> EsBlock {
    let mut data = vec![0x0B, 0x77];
    data.extend((0..254u32).map(|i| i as u8));
    EsBlock::new(data, TimePoint::from_micros(pts_us))
}

/// 轮询直到条件成立（最多约 2 秒）
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// 给喂帧线程一点时间，确认某件事没有发生
pub fn settle() {
    thread::sleep(Duration::from_millis(60));
}
