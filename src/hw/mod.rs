// 硬件调度接口（由板卡驱动实现）

pub mod simulated;

use crate::core::{TimePoint, VideoFormat, CLOCK_FREQ};
use crossbeam_channel::{Sender, TrySendError};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HwError {
    #[error("设备索引超出范围: {0}")]
    NoDevice(u32),

    #[error("不支持的显示模式: {0}")]
    ModeNotSupported(ModeCode),

    #[error("不支持的连接类型: {0:?}")]
    ConnectionNotSupported(VideoConnection),

    #[error("{0} 输出未启用")]
    NotEnabled(&'static str),

    #[error("提交被拒绝: {0}")]
    Rejected(String),

    #[error("缓冲区分配失败: {0} 字节")]
    OutOfMemory(usize),

    #[error("硬件故障: {0}")]
    Failed(String),
}

pub type HwResult<T> = std::result::Result<T, HwError>;

/// 四字符显示模式代码
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeCode(pub [u8; 4]);

impl ModeCode {
    pub const fn new(code: &[u8; 4]) -> Self {
        ModeCode(*code)
    }
}

impl FromStr for ModeCode {
    type Err = HwError;

    /// 最多 4 个 ASCII 字符，不足用空格补齐
    fn from_str(s: &str) -> HwResult<Self> {
        if s.is_empty() || s.len() > 4 || !s.is_ascii() {
            return Err(HwError::Failed(format!("无效的模式代码: {:?}", s)));
        }
        let mut code = [b' '; 4];
        code[..s.len()].copy_from_slice(s.as_bytes());
        Ok(ModeCode(code))
    }
}

impl fmt::Display for ModeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(String::from_utf8_lossy(&self.0).trim_end())
    }
}

impl fmt::Debug for ModeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModeCode({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// 显示模式描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub code: ModeCode,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// 帧时长，以 `timescale` 为单位
    pub frame_duration: i64,
    pub timescale: i64,
}

impl DisplayMode {
    pub fn new(code: &[u8; 4], name: &str, width: u32, height: u32, frame_duration: i64, timescale: i64) -> Self {
        Self {
            code: ModeCode::new(code),
            name: name.to_string(),
            width,
            height,
            frame_duration,
            timescale,
        }
    }

    /// 帧率是否精确相等：rate × frameduration == base × timescale
    pub fn frame_rate_matches(&self, fmt: &VideoFormat) -> bool {
        fmt.frame_rate as i64 * self.frame_duration == fmt.frame_rate_base as i64 * self.timescale
    }

    /// 帧时长（时钟刻度）
    pub fn frame_time(&self) -> TimePoint {
        TimePoint::from_scaled(self.frame_duration, self.timescale)
    }

    /// 标清 NTSC/PAL 需要额外打开 VITC
    pub fn is_standard_definition(&self) -> bool {
        self.width == 720 && (self.height == 486 || self.height == 576)
    }
}

/// 硬件像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwPixelFormat {
    /// 8 位 UYVY
    Yuv8,
    /// 10 位 v210
    Yuv10,
}

impl HwPixelFormat {
    pub fn row_bytes(&self, width: u32) -> usize {
        match self {
            HwPixelFormat::Yuv8 => width as usize * 2,
            HwPixelFormat::Yuv10 => crate::sdi::v210::row_bytes(width),
        }
    }
}

/// 视频输出开关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoOutputFlags {
    pub vanc: bool,
    pub vitc: bool,
}

/// 视频输出连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoConnection {
    Sdi,
    Hdmi,
    OpticalSdi,
    Component,
    Composite,
    #[serde(rename = "svideo")]
    SVideo,
}

/// 已完成帧的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    DisplayedLate,
    Dropped,
    Flushed,
}

/// 硬件事件（通过有界通道送到喂帧线程）
#[derive(Debug, Clone, PartialEq)]
pub enum HwEvent {
    FrameCompleted { status: CompletionStatus },
    PlaybackStopped,
    FormatChanged { mode: ModeCode, flags: VideoOutputFlags },
}

/// 事件出口：硬件侧只持有发送端，满了就丢弃，不阻塞回调上下文
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<HwEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<HwEvent>) -> Self {
        Self { tx }
    }

    /// 投递事件；通道满或已关闭时返回 false
    pub fn send(&self, event: HwEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                warn!("硬件事件通道已满，丢弃 {:?}", ev);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// 硬件参考时钟读数（以请求的 timescale 为单位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareClock {
    pub time: i64,
    pub time_in_frame: i64,
    pub ticks_per_frame: i64,
}

impl HardwareClock {
    pub fn as_time_point(&self) -> TimePoint {
        TimePoint::from_micros(self.time)
    }
}

/// 垂直消隐区辅助数据，每行一个缓冲区
#[derive(Debug, Clone, PartialEq)]
pub struct AncillaryData {
    pub format: HwPixelFormat,
    pub row_bytes: usize,
    lines: BTreeMap<u32, Vec<u8>>,
}

impl AncillaryData {
    pub fn new(format: HwPixelFormat, row_bytes: usize) -> Self {
        Self {
            format,
            row_bytes,
            lines: BTreeMap::new(),
        }
    }

    /// 取得某一行的缓冲区（不存在时分配并清零）
    pub fn buffer_for_line(&mut self, line: u32) -> &mut [u8] {
        let row_bytes = self.row_bytes;
        self.lines.entry(line).or_insert_with(|| vec![0; row_bytes])
    }

    pub fn line(&self, line: u32) -> Option<&[u8]> {
        self.lines.get(&line).map(|l| l.as_slice())
    }

    pub fn lines(&self) -> impl Iterator<Item = u32> + '_ {
        self.lines.keys().copied()
    }
}

/// 硬件视频帧缓冲区
#[derive(Debug, Clone, PartialEq)]
pub struct HwVideoFrame {
    pub width: u32,
    pub height: u32,
    pub row_bytes: usize,
    pub format: HwPixelFormat,
    pub data: Vec<u8>,
    pub ancillary: Option<AncillaryData>,
}

impl HwVideoFrame {
    /// 分配帧缓冲区；分配失败返回错误而不是中止
    pub fn allocate(width: u32, height: u32, row_bytes: usize, format: HwPixelFormat) -> HwResult<Self> {
        let size = row_bytes * height as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| HwError::OutOfMemory(size))?;
        data.resize(size, 0);
        Ok(Self {
            width,
            height,
            row_bytes,
            format,
            data,
            ancillary: None,
        })
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.data[y * self.row_bytes..(y + 1) * self.row_bytes]
    }

    pub fn set_ancillary(&mut self, anc: AncillaryData) {
        self.ancillary = Some(anc);
    }
}

/// 设备枚举
pub trait Driver: Send + Sync {
    fn card_count(&self) -> u32;
    fn card(&self, index: u32) -> HwResult<Arc<dyn Card>>;
}

/// 一块板卡；能力接口可能缺失
pub trait Card: Send + Sync {
    fn model_name(&self) -> String;
    fn output(&self) -> Option<Arc<dyn CardOutput>>;
    fn configuration(&self) -> Option<Arc<dyn CardConfiguration>>;
}

pub trait CardConfiguration: Send + Sync {
    fn supported_connections(&self) -> Vec<VideoConnection>;
    fn set_video_output_connection(&self, connection: VideoConnection) -> HwResult<()>;
}

/// 调度输出接口；时间参数都以调用方给出的 timescale 为单位
pub trait CardOutput: Send + Sync {
    fn display_modes(&self) -> Vec<DisplayMode>;
    fn supports_mode(&self, code: ModeCode, format: HwPixelFormat) -> bool;

    fn enable_video_output(&self, code: ModeCode, flags: VideoOutputFlags) -> HwResult<()>;
    fn disable_video_output(&self) -> HwResult<()>;
    fn enable_audio_output(&self, sample_rate: u32, channels: u32) -> HwResult<()>;
    fn disable_audio_output(&self) -> HwResult<()>;

    fn create_video_frame(&self, width: u32, height: u32, row_bytes: usize, format: HwPixelFormat) -> HwResult<HwVideoFrame>;
    fn create_ancillary_data(&self, format: HwPixelFormat) -> HwResult<AncillaryData>;

    fn schedule_video_frame(&self, frame: HwVideoFrame, time: i64, duration: i64, timescale: i64) -> HwResult<()>;
    /// 返回实际接受的采样帧数
    fn schedule_audio_samples(&self, data: &[u8], frames: u32, time: i64, timescale: i64) -> HwResult<u32>;

    fn buffered_video_frame_count(&self) -> HwResult<u32>;
    fn buffered_audio_sample_frame_count(&self) -> HwResult<u32>;

    fn start_scheduled_playback(&self, start_time: i64, timescale: i64, speed: f64) -> HwResult<()>;
    fn stop_scheduled_playback(&self) -> HwResult<()>;
    fn hardware_reference_clock(&self, timescale: i64) -> HwResult<HardwareClock>;

    /// 注册事件出口；None 注销
    fn set_event_sink(&self, sink: Option<EventSink>);
}

/// 调度使用的统一 timescale
pub const TIMESCALE: i64 = CLOCK_FREQ;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChromaFormat;

    #[test]
    fn mode_code_parsing() {
        let code: ModeCode = "pal".parse().unwrap();
        assert_eq!(code.0, *b"pal ");
        assert_eq!(code.to_string(), "pal");
        assert!("toolong".parse::<ModeCode>().is_err());
        assert!("".parse::<ModeCode>().is_err());
    }

    #[test]
    fn frame_rate_equality_is_exact() {
        let mode = DisplayMode::new(b"Hp59", "1080p59.94", 1920, 1080, 1001, 60000);
        let ntsc_rate = VideoFormat::new(1920, 1080, 60000, 1001, ChromaFormat::I420);
        let integer_rate = VideoFormat::new(1920, 1080, 60, 1, ChromaFormat::I420);
        assert!(mode.frame_rate_matches(&ntsc_rate));
        assert!(!mode.frame_rate_matches(&integer_rate));
        assert_eq!(mode.frame_time(), TimePoint::from_micros(16683));
    }

    #[test]
    fn connection_names() {
        let c: VideoConnection = serde_json::from_str("\"optical_sdi\"").unwrap();
        assert_eq!(c, VideoConnection::OpticalSdi);
        let c: VideoConnection = serde_json::from_str("\"svideo\"").unwrap();
        assert_eq!(c, VideoConnection::SVideo);
    }

    #[test]
    fn event_sink_never_blocks() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sink = EventSink::new(tx);
        assert!(sink.send(HwEvent::PlaybackStopped));
        assert!(!sink.send(HwEvent::PlaybackStopped));
        drop(rx);
        assert!(!sink.send(HwEvent::PlaybackStopped));
    }

    #[test]
    fn ancillary_lines_are_allocated_on_demand() {
        let mut anc = AncillaryData::new(HwPixelFormat::Yuv10, 128);
        anc.buffer_for_line(16)[0] = 1;
        assert_eq!(anc.line(16).map(|l| l.len()), Some(128));
        assert!(anc.line(15).is_none());
        assert_eq!(anc.lines().collect::<Vec<_>>(), vec![16]);
    }
}
