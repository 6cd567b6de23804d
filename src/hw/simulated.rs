//! 模拟板卡
//!
//! 实现全部硬件接口，时间由调用方手动推进（`advance`）。已显示的帧和提交的音频
//! 记录在定长的无锁环形队列里，测试可以逐个取出检查；没人取的旧记录被覆盖。

use super::*;
use crate::core::log_ctx;
use crossbeam::queue::ArrayQueue;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// 显示记录最多保留的帧数
pub const DISPLAYED_LOG_CAPACITY: usize = 32;
/// 音频提交记录最多保留的条数
pub const AUDIO_LOG_CAPACITY: usize = 256;

/// 常用显示模式表（逐行模式排在隔行之前）
pub fn standard_modes() -> Vec<DisplayMode> {
    vec![
        DisplayMode::new(b"ntsc", "NTSC", 720, 486, 1001, 30000),
        DisplayMode::new(b"pal ", "PAL", 720, 576, 1000, 25000),
        DisplayMode::new(b"hp50", "HD 720p50", 1280, 720, 1000, 50000),
        DisplayMode::new(b"hp59", "HD 720p59.94", 1280, 720, 1001, 60000),
        DisplayMode::new(b"hp60", "HD 720p60", 1280, 720, 1000, 60000),
        DisplayMode::new(b"23ps", "HD 1080p23.98", 1920, 1080, 1001, 24000),
        DisplayMode::new(b"24ps", "HD 1080p24", 1920, 1080, 1000, 24000),
        DisplayMode::new(b"Hp25", "HD 1080p25", 1920, 1080, 1000, 25000),
        DisplayMode::new(b"Hp29", "HD 1080p29.97", 1920, 1080, 1001, 30000),
        DisplayMode::new(b"Hp30", "HD 1080p30", 1920, 1080, 1000, 30000),
        DisplayMode::new(b"Hp50", "HD 1080p50", 1920, 1080, 1000, 50000),
        DisplayMode::new(b"Hp59", "HD 1080p59.94", 1920, 1080, 1001, 60000),
        DisplayMode::new(b"Hp60", "HD 1080p60", 1920, 1080, 1000, 60000),
        DisplayMode::new(b"Hi50", "HD 1080i50", 1920, 1080, 1000, 25000),
        DisplayMode::new(b"Hi59", "HD 1080i59.94", 1920, 1080, 1001, 30000),
    ]
}

/// 已经离开硬件队列的帧
#[derive(Debug, Clone)]
pub struct DisplayedFrame {
    /// 调度时间（TIMESCALE 单位）
    pub time: i64,
    pub duration: i64,
    pub status: CompletionStatus,
    pub frame: HwVideoFrame,
}

/// 一次音频提交
#[derive(Debug, Clone)]
pub struct AudioSubmission {
    pub time: i64,
    pub frames: u32,
    pub data: Vec<u8>,
}

struct QueuedFrame {
    time: i64,
    duration: i64,
    frame: HwVideoFrame,
}

struct QueuedAudio {
    time: i64,
    frames: u32,
    consumed: u32,
}

struct Playback {
    start_time: i64,
    /// 开始播放时的硬件时间
    started_at: i64,
}

struct OutputInner {
    video: Option<(ModeCode, VideoOutputFlags)>,
    audio: Option<(u32, u32)>,
    video_queue: VecDeque<QueuedFrame>,
    audio_queue: VecDeque<QueuedAudio>,
    playback: Option<Playback>,
    hw_time: i64,
}

impl OutputInner {
    fn stream_time(&self) -> Option<i64> {
        self.playback
            .as_ref()
            .map(|p| p.start_time + (self.hw_time - p.started_at))
    }
}

/// 模拟的调度输出
pub struct SimulatedOutput {
    modes: Vec<DisplayMode>,
    inner: Mutex<OutputInner>,
    sink: Mutex<Option<EventSink>>,
    displayed: ArrayQueue<DisplayedFrame>,
    audio_log: ArrayQueue<AudioSubmission>,
    /// 被覆盖的记录数
    log_overflow: AtomicU64,
    fail_video: AtomicU32,
    fail_audio: AtomicU32,
}

impl SimulatedOutput {
    fn new(modes: Vec<DisplayMode>) -> Self {
        Self {
            modes,
            inner: Mutex::new(OutputInner {
                video: None,
                audio: None,
                video_queue: VecDeque::new(),
                audio_queue: VecDeque::new(),
                playback: None,
                hw_time: 0,
            }),
            sink: Mutex::new(None),
            displayed: ArrayQueue::new(DISPLAYED_LOG_CAPACITY),
            audio_log: ArrayQueue::new(AUDIO_LOG_CAPACITY),
            log_overflow: AtomicU64::new(0),
            fail_video: AtomicU32::new(0),
            fail_audio: AtomicU32::new(0),
        }
    }

    fn emit(&self, event: HwEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.send(event);
        }
    }

    fn record_displayed(&self, frame: DisplayedFrame) {
        if self.displayed.force_push(frame).is_some() {
            self.log_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_audio(&self, submission: AudioSubmission) {
        if self.audio_log.force_push(submission).is_some() {
            self.log_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn mode(&self, code: ModeCode) -> Option<&DisplayMode> {
        self.modes.iter().find(|m| m.code == code)
    }

    /// 推进硬件时钟；播放中到期的帧和音频被消费
    pub fn advance(&self, d: TimePoint) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.hw_time += d.as_micros();
            let Some(now) = inner.stream_time() else {
                return;
            };
            while inner
                .video_queue
                .front()
                .is_some_and(|f| f.time + f.duration <= now)
            {
                if let Some(f) = inner.video_queue.pop_front() {
                    self.record_displayed(DisplayedFrame {
                        time: f.time,
                        duration: f.duration,
                        status: CompletionStatus::Completed,
                        frame: f.frame,
                    });
                    events.push(HwEvent::FrameCompleted {
                        status: CompletionStatus::Completed,
                    });
                }
            }
            while let Some(a) = inner.audio_queue.front_mut() {
                let played = TimePoint::from_micros(now - a.time).to_samples(48000).max(0);
                if played >= a.frames as i64 {
                    inner.audio_queue.pop_front();
                } else {
                    a.consumed = played as u32;
                    break;
                }
            }
        }
        for ev in events {
            self.emit(ev);
        }
    }

    /// 让接下来 n 次视频提交失败
    pub fn fail_next_video(&self, n: u32) {
        self.fail_video.store(n, Ordering::SeqCst);
    }

    /// 让接下来 n 次音频提交失败
    pub fn fail_next_audio(&self, n: u32) {
        self.fail_audio.store(n, Ordering::SeqCst);
    }

    /// 模拟输入格式变化回调
    pub fn signal_format_change(&self, mode: ModeCode, flags: VideoOutputFlags) {
        self.emit(HwEvent::FormatChanged { mode, flags });
    }

    pub fn take_displayed(&self) -> Vec<DisplayedFrame> {
        std::iter::from_fn(|| self.displayed.pop()).collect()
    }

    pub fn take_audio(&self) -> Vec<AudioSubmission> {
        std::iter::from_fn(|| self.audio_log.pop()).collect()
    }

    /// 因为没人取走而被覆盖的记录数（帧和音频合计）
    pub fn log_overflow(&self) -> u64 {
        self.log_overflow.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().playback.is_some()
    }

    /// 开始播放时请求的起始时间
    pub fn playback_start(&self) -> Option<i64> {
        self.inner.lock().playback.as_ref().map(|p| p.start_time)
    }

    pub fn video_enabled(&self) -> Option<(ModeCode, VideoOutputFlags)> {
        self.inner.lock().video
    }

    pub fn audio_enabled(&self) -> Option<(u32, u32)> {
        self.inner.lock().audio
    }

    pub fn has_event_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CardOutput for SimulatedOutput {
    fn display_modes(&self) -> Vec<DisplayMode> {
        self.modes.clone()
    }

    fn supports_mode(&self, code: ModeCode, _format: HwPixelFormat) -> bool {
        self.mode(code).is_some()
    }

    fn enable_video_output(&self, code: ModeCode, flags: VideoOutputFlags) -> HwResult<()> {
        if self.mode(code).is_none() {
            return Err(HwError::ModeNotSupported(code));
        }
        self.inner.lock().video = Some((code, flags));
        Ok(())
    }

    fn disable_video_output(&self) -> HwResult<()> {
        self.inner.lock().video = None;
        Ok(())
    }

    fn enable_audio_output(&self, sample_rate: u32, channels: u32) -> HwResult<()> {
        if sample_rate != 48000 || !matches!(channels, 2 | 8 | 16) {
            return Err(HwError::Rejected(format!("音频配置 {} Hz / {} 声道", sample_rate, channels)));
        }
        self.inner.lock().audio = Some((sample_rate, channels));
        Ok(())
    }

    fn disable_audio_output(&self) -> HwResult<()> {
        let mut inner = self.inner.lock();
        inner.audio = None;
        inner.audio_queue.clear();
        Ok(())
    }

    fn create_video_frame(&self, width: u32, height: u32, row_bytes: usize, format: HwPixelFormat) -> HwResult<HwVideoFrame> {
        HwVideoFrame::allocate(width, height, row_bytes, format)
    }

    fn create_ancillary_data(&self, format: HwPixelFormat) -> HwResult<AncillaryData> {
        let inner = self.inner.lock();
        let (code, flags) = inner.video.ok_or(HwError::NotEnabled("视频"))?;
        if !flags.vanc {
            return Err(HwError::Rejected("VANC 未启用".to_string()));
        }
        let width = self.mode(code).map(|m| m.width).unwrap_or(0);
        Ok(AncillaryData::new(format, format.row_bytes(width)))
    }

    fn schedule_video_frame(&self, frame: HwVideoFrame, time: i64, duration: i64, timescale: i64) -> HwResult<()> {
        if Self::take_failure(&self.fail_video) {
            return Err(HwError::Rejected("模拟的视频提交失败".to_string()));
        }
        let time = time * TIMESCALE / timescale;
        let duration = duration * TIMESCALE / timescale;
        let mut inner = self.inner.lock();
        if inner.video.is_none() {
            return Err(HwError::NotEnabled("视频"));
        }
        if !inner.stream_time().is_some_and(|now| time + duration <= now) {
            inner.video_queue.push_back(QueuedFrame { time, duration, frame });
            return Ok(());
        }
        drop(inner);

        debug!("{} 模拟输出: 帧 {} 已过期，丢弃", log_ctx(), time);
        self.record_displayed(DisplayedFrame {
            time,
            duration,
            status: CompletionStatus::Dropped,
            frame,
        });
        self.emit(HwEvent::FrameCompleted {
            status: CompletionStatus::Dropped,
        });
        Ok(())
    }

    fn schedule_audio_samples(&self, data: &[u8], frames: u32, time: i64, timescale: i64) -> HwResult<u32> {
        if Self::take_failure(&self.fail_audio) {
            return Err(HwError::Rejected("模拟的音频提交失败".to_string()));
        }
        let time = time * TIMESCALE / timescale;
        let mut inner = self.inner.lock();
        if inner.audio.is_none() {
            return Err(HwError::NotEnabled("音频"));
        }
        inner.audio_queue.push_back(QueuedAudio { time, frames, consumed: 0 });
        self.record_audio(AudioSubmission {
            time,
            frames,
            data: data.to_vec(),
        });
        Ok(frames)
    }

    fn buffered_video_frame_count(&self) -> HwResult<u32> {
        Ok(self.inner.lock().video_queue.len() as u32)
    }

    fn buffered_audio_sample_frame_count(&self) -> HwResult<u32> {
        Ok(self
            .inner
            .lock()
            .audio_queue
            .iter()
            .map(|a| a.frames - a.consumed)
            .sum())
    }

    fn start_scheduled_playback(&self, start_time: i64, timescale: i64, _speed: f64) -> HwResult<()> {
        let mut inner = self.inner.lock();
        if inner.video.is_none() {
            return Err(HwError::NotEnabled("视频"));
        }
        let started_at = inner.hw_time;
        inner.playback = Some(Playback {
            start_time: start_time * TIMESCALE / timescale,
            started_at,
        });
        info!("{} 模拟输出: 从 {} 开始播放", log_ctx(), start_time);
        Ok(())
    }

    fn stop_scheduled_playback(&self) -> HwResult<()> {
        let flushed: Vec<QueuedFrame> = {
            let mut inner = self.inner.lock();
            inner.playback = None;
            inner.audio_queue.clear();
            inner.video_queue.drain(..).collect()
        };
        for f in flushed {
            self.record_displayed(DisplayedFrame {
                time: f.time,
                duration: f.duration,
                status: CompletionStatus::Flushed,
                frame: f.frame,
            });
            self.emit(HwEvent::FrameCompleted {
                status: CompletionStatus::Flushed,
            });
        }
        self.emit(HwEvent::PlaybackStopped);
        Ok(())
    }

    fn hardware_reference_clock(&self, timescale: i64) -> HwResult<HardwareClock> {
        let inner = self.inner.lock();
        let ticks_per_frame = inner
            .video
            .and_then(|(code, _)| self.mode(code))
            .map(|m| m.frame_duration * timescale / m.timescale)
            .unwrap_or(timescale / 60)
            .max(1);
        let time = inner.hw_time * timescale / TIMESCALE;
        Ok(HardwareClock {
            time,
            time_in_frame: time % ticks_per_frame,
            ticks_per_frame,
        })
    }

    fn set_event_sink(&self, sink: Option<EventSink>) {
        *self.sink.lock() = sink;
    }
}

pub struct SimulatedConfiguration {
    connections: Vec<VideoConnection>,
    current: Mutex<Option<VideoConnection>>,
}

impl SimulatedConfiguration {
    pub fn current(&self) -> Option<VideoConnection> {
        *self.current.lock()
    }
}

impl CardConfiguration for SimulatedConfiguration {
    fn supported_connections(&self) -> Vec<VideoConnection> {
        self.connections.clone()
    }

    fn set_video_output_connection(&self, connection: VideoConnection) -> HwResult<()> {
        if !self.connections.contains(&connection) {
            return Err(HwError::ConnectionNotSupported(connection));
        }
        *self.current.lock() = Some(connection);
        Ok(())
    }
}

/// 模拟板卡
pub struct SimulatedCard {
    name: String,
    output: Arc<SimulatedOutput>,
    configuration: Arc<SimulatedConfiguration>,
    has_output: bool,
    has_configuration: bool,
}

impl SimulatedCard {
    pub fn new(name: &str) -> Self {
        Self::with_modes(name, standard_modes())
    }

    pub fn with_modes(name: &str, modes: Vec<DisplayMode>) -> Self {
        Self {
            name: name.to_string(),
            output: Arc::new(SimulatedOutput::new(modes)),
            configuration: Arc::new(SimulatedConfiguration {
                connections: vec![VideoConnection::Sdi, VideoConnection::Hdmi, VideoConnection::OpticalSdi],
                current: Mutex::new(None),
            }),
            has_output: true,
            has_configuration: true,
        }
    }

    /// 去掉输出接口（用于测试能力缺失）
    pub fn without_output(mut self) -> Self {
        self.has_output = false;
        self
    }

    pub fn without_configuration(mut self) -> Self {
        self.has_configuration = false;
        self
    }

    /// 直接访问模拟输出（推进时钟、注入故障、检查日志）
    pub fn simulated_output(&self) -> Arc<SimulatedOutput> {
        Arc::clone(&self.output)
    }

    pub fn simulated_configuration(&self) -> Arc<SimulatedConfiguration> {
        Arc::clone(&self.configuration)
    }
}

impl Card for SimulatedCard {
    fn model_name(&self) -> String {
        self.name.clone()
    }

    fn output(&self) -> Option<Arc<dyn CardOutput>> {
        self.has_output
            .then(|| Arc::clone(&self.output) as Arc<dyn CardOutput>)
    }

    fn configuration(&self) -> Option<Arc<dyn CardConfiguration>> {
        self.has_configuration
            .then(|| Arc::clone(&self.configuration) as Arc<dyn CardConfiguration>)
    }
}

/// 模拟驱动：持有若干模拟板卡
#[derive(Default)]
pub struct SimulatedDriver {
    cards: Vec<Arc<SimulatedCard>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_card(mut self, card: SimulatedCard) -> Self {
        self.cards.push(Arc::new(card));
        self
    }

    pub fn simulated_card(&self, index: usize) -> Option<Arc<SimulatedCard>> {
        self.cards.get(index).cloned()
    }
}

impl Driver for SimulatedDriver {
    fn card_count(&self) -> u32 {
        self.cards.len() as u32
    }

    fn card(&self, index: u32) -> HwResult<Arc<dyn Card>> {
        self.cards
            .get(index as usize)
            .map(|c| Arc::clone(c) as Arc<dyn Card>)
            .ok_or(HwError::NoDevice(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_output() -> Arc<SimulatedOutput> {
        let card = SimulatedCard::new("sim");
        let out = card.simulated_output();
        out.enable_video_output(ModeCode::new(b"Hp50"), VideoOutputFlags { vanc: true, vitc: false })
            .unwrap();
        out.enable_audio_output(48000, 2).unwrap();
        out
    }

    fn frame(out: &SimulatedOutput) -> HwVideoFrame {
        out.create_video_frame(1920, 1080, HwPixelFormat::Yuv10.row_bytes(1920), HwPixelFormat::Yuv10)
            .unwrap()
    }

    #[test]
    fn frames_complete_as_time_advances() {
        let out = enabled_output();
        let (tx, rx) = crossbeam_channel::bounded(16);
        out.set_event_sink(Some(EventSink::new(tx)));

        for i in 0..3 {
            out.schedule_video_frame(frame(&out), i * 20_000, 20_000, TIMESCALE).unwrap();
        }
        assert_eq!(out.buffered_video_frame_count().unwrap(), 3);
        out.start_scheduled_playback(0, TIMESCALE, 1.0).unwrap();
        out.advance(TimePoint::from_millis(40));
        assert_eq!(out.buffered_video_frame_count().unwrap(), 1);
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(out.take_displayed().len(), 2);
    }

    #[test]
    fn late_frames_are_dropped() {
        let out = enabled_output();
        out.start_scheduled_playback(100_000, TIMESCALE, 1.0).unwrap();
        out.schedule_video_frame(frame(&out), 0, 20_000, TIMESCALE).unwrap();
        let shown = out.take_displayed();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].status, CompletionStatus::Dropped);
        assert_eq!(out.buffered_video_frame_count().unwrap(), 0);
    }

    #[test]
    fn audio_is_consumed_while_playing() {
        let out = enabled_output();
        out.schedule_audio_samples(&[0; 4 * 4800], 4800, 0, TIMESCALE).unwrap();
        assert_eq!(out.buffered_audio_sample_frame_count().unwrap(), 4800);
        out.start_scheduled_playback(0, TIMESCALE, 1.0).unwrap();
        out.advance(TimePoint::from_millis(50));
        assert_eq!(out.buffered_audio_sample_frame_count().unwrap(), 2400);
    }

    #[test]
    fn injected_failures_are_one_shot() {
        let out = enabled_output();
        out.fail_next_video(1);
        assert!(out.schedule_video_frame(frame(&out), 0, 20_000, TIMESCALE).is_err());
        assert!(out.schedule_video_frame(frame(&out), 0, 20_000, TIMESCALE).is_ok());
    }

    #[test]
    fn stop_flushes_queue() {
        let out = enabled_output();
        let (tx, rx) = crossbeam_channel::bounded(16);
        out.set_event_sink(Some(EventSink::new(tx)));
        out.schedule_video_frame(frame(&out), 0, 20_000, TIMESCALE).unwrap();
        out.start_scheduled_playback(0, TIMESCALE, 1.0).unwrap();
        out.stop_scheduled_playback().unwrap();
        assert_eq!(out.buffered_video_frame_count().unwrap(), 0);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&HwEvent::PlaybackStopped));
    }

    #[test]
    fn displayed_log_keeps_only_recent_frames() {
        let out = enabled_output();
        out.start_scheduled_playback(10_000_000, TIMESCALE, 1.0).unwrap();
        let row_bytes = HwPixelFormat::Yuv10.row_bytes(48);
        for i in 0..100 {
            let small = out.create_video_frame(48, 2, row_bytes, HwPixelFormat::Yuv10).unwrap();
            out.schedule_video_frame(small, i * 20_000, 20_000, TIMESCALE).unwrap();
        }
        let shown = out.take_displayed();
        assert_eq!(shown.len(), DISPLAYED_LOG_CAPACITY);
        assert_eq!(shown[0].time, (100 - DISPLAYED_LOG_CAPACITY as i64) * 20_000);
        assert_eq!(shown.last().map(|f| f.time), Some(99 * 20_000));
        assert_eq!(out.log_overflow(), 100 - DISPLAYED_LOG_CAPACITY as u64);
        assert!(out.take_displayed().is_empty());
    }

    #[test]
    fn audio_log_is_bounded() {
        let out = enabled_output();
        for i in 0..(AUDIO_LOG_CAPACITY as i64 + 10) {
            out.schedule_audio_samples(&[0; 4 * 48], 48, i * 1000, TIMESCALE).unwrap();
        }
        let submitted = out.take_audio();
        assert_eq!(submitted.len(), AUDIO_LOG_CAPACITY);
        assert_eq!(submitted[0].time, 10_000);
        assert_eq!(out.log_overflow(), 10);
    }

    #[test]
    fn missing_interfaces() {
        let driver = SimulatedDriver::new().with_card(SimulatedCard::new("a").without_output());
        let card = driver.card(0).unwrap();
        assert!(card.output().is_none());
        assert!(card.configuration().is_some());
        assert!(driver.card(1).is_err());
    }
}
