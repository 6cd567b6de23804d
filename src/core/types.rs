use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// 时钟频率：1 MHz（所有时间戳均为微秒刻度）
pub const CLOCK_FREQ: i64 = 1_000_000;

/// 时间点 - 固定 1 MHz 时钟域内的单调刻度
///
/// 所有缓冲区都按时间点寻址，而不是按序号，所以早到/晚到的源会自动对齐。
/// "无效"时间点用 `Option<TimePoint>::None` 表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TimePoint(i64);

impl TimePoint {
    pub const ZERO: TimePoint = TimePoint(0);

    pub const fn from_micros(us: i64) -> Self {
        TimePoint(us)
    }

    pub const fn from_millis(ms: i64) -> Self {
        TimePoint(ms * 1000)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn as_millis(self) -> i64 {
        self.0 / 1000
    }

    /// 采样数 -> 时长
    pub fn from_samples(samples: i64, rate: u32) -> Self {
        TimePoint(samples * CLOCK_FREQ / rate as i64)
    }

    /// 时长 -> 采样数（截断）
    pub fn to_samples(self, rate: u32) -> i64 {
        self.0 * rate as i64 / CLOCK_FREQ
    }

    /// 以 `timescale` 为单位的时长 -> 时钟刻度
    pub fn from_scaled(value: i64, timescale: i64) -> Self {
        TimePoint(value * CLOCK_FREQ / timescale)
    }

    pub fn abs(self) -> Self {
        TimePoint(self.0.abs())
    }
}

impl Add for TimePoint {
    type Output = TimePoint;
    fn add(self, rhs: TimePoint) -> TimePoint {
        TimePoint(self.0 + rhs.0)
    }
}

impl Sub for TimePoint {
    type Output = TimePoint;
    fn sub(self, rhs: TimePoint) -> TimePoint {
        TimePoint(self.0 - rhs.0)
    }
}

impl AddAssign for TimePoint {
    fn add_assign(&mut self, rhs: TimePoint) {
        self.0 += rhs.0;
    }
}

impl SubAssign for TimePoint {
    fn sub_assign(&mut self, rhs: TimePoint) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// 色度格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChromaFormat {
    /// 8 位 4:2:0 平面
    I420,
    /// 8 位 4:2:2 平面
    I422,
    /// 10 位 4:2:2 平面（每采样 2 字节小端）
    I422_10L,
    /// 8 位 4:2:2 打包 (U Y V Y)
    UYVY,
}

impl ChromaFormat {
    /// 平面数量
    pub fn plane_count(&self) -> usize {
        match self {
            ChromaFormat::UYVY => 1,
            _ => 3,
        }
    }

    /// 每个采样的字节数
    pub fn sample_size(&self) -> usize {
        match self {
            ChromaFormat::I422_10L => 2,
            _ => 1,
        }
    }

    /// 色度平面水平/垂直下采样因子
    pub fn chroma_subsampling(&self) -> (usize, usize) {
        match self {
            ChromaFormat::I420 => (2, 2),
            ChromaFormat::I422 | ChromaFormat::I422_10L => (2, 1),
            ChromaFormat::UYVY => (1, 1),
        }
    }
}

/// 图像平面
#[derive(Debug, Clone, Default)]
pub struct Plane {
    pub data: Vec<u8>,
    /// 行跨度（字节）
    pub pitch: usize,
    pub lines: usize,
}

impl Plane {
    pub fn new(pitch: usize, lines: usize) -> Self {
        Self {
            data: vec![0; pitch * lines],
            pitch,
            lines,
        }
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.pitch..(y + 1) * self.pitch]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.data[y * self.pitch..(y + 1) * self.pitch]
    }

    /// 读取 16 位小端采样（10 位格式）
    pub fn sample16(&self, x: usize, y: usize) -> u16 {
        let i = y * self.pitch + x * 2;
        u16::from_le_bytes([self.data[i], self.data[i + 1]])
    }

    pub fn set_sample16(&mut self, x: usize, y: usize, v: u16) {
        let i = y * self.pitch + x * 2;
        self.data[i..i + 2].copy_from_slice(&v.to_le_bytes());
    }
}

/// 视频帧数据
///
/// 入队后归调度器独占，直到提交给硬件后释放。
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: TimePoint,
    /// 帧持续时间
    pub duration: TimePoint,
    pub width: u32,
    pub height: u32,
    pub chroma: ChromaFormat,
    pub planes: Vec<Plane>,
}

impl VideoFrame {
    /// 分配一张空白图像（黑场）
    pub fn new(width: u32, height: u32, chroma: ChromaFormat) -> Self {
        let (sx, sy) = chroma.chroma_subsampling();
        let w = width as usize;
        let h = height as usize;
        let planes = match chroma {
            ChromaFormat::UYVY => {
                let mut p = Plane::new(w * 2, h);
                for px in p.data.chunks_exact_mut(2) {
                    px[0] = 0x80;
                    px[1] = 0x10;
                }
                vec![p]
            }
            _ => {
                let ss = chroma.sample_size();
                let (black, mid) = if ss == 2 { (64u16, 512u16) } else { (16, 128) };
                (0..3)
                    .map(|i| {
                        let (pw, ph) = if i == 0 { (w, h) } else { (w.div_ceil(sx), h.div_ceil(sy)) };
                        let mut p = Plane::new(pw * ss, ph);
                        let v = if i == 0 { black } else { mid };
                        if ss == 2 {
                            for s in p.data.chunks_exact_mut(2) {
                                s.copy_from_slice(&v.to_le_bytes());
                            }
                        } else {
                            p.data.fill(v as u8);
                        }
                        p
                    })
                    .collect()
            }
        };
        Self {
            pts: TimePoint::ZERO,
            duration: TimePoint::ZERO,
            width,
            height,
            chroma,
            planes,
        }
    }
}

/// 解码后的音频帧（解码器输出，f32 交错）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: TimePoint,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

impl AudioFrame {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// 音频数据块（S16 交错，或已封装的压缩流突发）
#[derive(Debug, Clone, Default)]
pub struct AudioBlock {
    pub data: Vec<u8>,
    pub pts: Option<TimePoint>,
    pub nb_samples: u32,
}

/// 字幕数据块（cc_data 三元组）
#[derive(Debug, Clone)]
pub struct CaptionBlock {
    pub pts: TimePoint,
    pub data: Vec<u8>,
}

/// 编码数据块（解码器输入）
#[derive(Debug, Clone, Default)]
pub struct EsBlock {
    pub data: Vec<u8>,
    pub pts: Option<TimePoint>,
    pub duration: Option<TimePoint>,
    /// 随画面携带的字幕数据（cc_data 三元组）
    pub captions: Vec<u8>,
}

impl EsBlock {
    pub fn new(data: Vec<u8>, pts: TimePoint) -> Self {
        Self {
            data,
            pts: Some(pts),
            duration: None,
            captions: Vec::new(),
        }
    }

    pub fn with_captions(mut self, cc_data: Vec<u8>) -> Self {
        self.captions = cc_data;
        self
    }
}

/// 视频格式描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub visible_width: u32,
    pub visible_height: u32,
    pub frame_rate: u32,
    pub frame_rate_base: u32,
    pub chroma: ChromaFormat,
}

impl VideoFormat {
    pub fn new(width: u32, height: u32, frame_rate: u32, frame_rate_base: u32, chroma: ChromaFormat) -> Self {
        Self {
            width,
            height,
            visible_width: width,
            visible_height: height,
            frame_rate,
            frame_rate_base,
            chroma,
        }
    }

    /// 帧时长（时钟刻度）
    pub fn frame_duration(&self) -> TimePoint {
        if self.frame_rate == 0 {
            return TimePoint::ZERO;
        }
        TimePoint::from_micros(CLOCK_FREQ * self.frame_rate_base as i64 / self.frame_rate as i64)
    }
}

/// 音频编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioCodec {
    /// 16 位有符号小端 PCM
    PcmS16Le,
    /// 32 位浮点 PCM
    PcmF32,
    Ac3,
    EAc3,
}

impl AudioCodec {
    pub fn is_pcm(&self) -> bool {
        matches!(self, AudioCodec::PcmS16Le | AudioCodec::PcmF32)
    }
}

/// 音频格式描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub rate: u32,
    pub channels: u16,
}

/// 字幕格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptionFormat {
    Cea608,
    Cea708,
}

/// 基本流类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsKind {
    Video(VideoFormat),
    Audio(AudioFormat),
    Captions(CaptionFormat),
}

/// 基本流格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsFormat {
    /// 上游分配的基本流 ID
    pub id: i32,
    pub kind: EsKind,
}

/// 流标识：上游 ES ID + 输出内单调递增的序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub es_id: i32,
    pub sequence: u64,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "es#{}/{}", self.es_id, self.sequence)
    }
}

/// 流 ID 分配器（由输出上下文持有，不使用全局计数器）
#[derive(Debug, Default)]
pub struct StreamIdAllocator {
    next: u64,
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, es_id: i32) -> StreamId {
        let id = StreamId {
            es_id,
            sequence: self.next,
        };
        self.next += 1;
        id
    }
}

/// 输出状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    Idle,
    Configuring,
    Prerolling,
    Running,
    Draining,
    Closed,
}

/// 输出统计信息（用于监控和调试）
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutputStats {
    pub video_scheduled: u64,
    pub video_dropped: u64,
    pub video_late: u64,
    pub video_submit_failures: u64,
    pub audio_blocks_scheduled: u64,
    pub audio_samples_scheduled: u64,
    pub audio_submit_failures: u64,
    pub nosignal_frames: u64,
    /// 当前时钟偏移（微秒）
    pub clock_offset: i64,
}
