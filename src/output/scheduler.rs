//! SDI 输出调度器
//!
//! 每个输出一个喂帧线程。解码线程只做入队和唤醒；喂帧线程是唯一向硬件提交数据、
//! 也是唯一修改时钟偏移的线程。唤醒来源只有四个：入队、硬件事件、超时（一帧时长，
//! 协商前 1/60 秒）、取消。

use super::display_mode::{match_display_mode, ModeMatch};
use super::nosignal;
use super::queue::{OutputQueue, Waker};
use crate::audio::{MultiplexConfig, SdiAudioMultiplex, StreamMapping, AES3_SAMPLE_RATE};
use crate::core::{
    log_ctx, AudioBlock, CaptionBlock, ChromaFormat, ClockState, EsFormat, EsKind, OutputConfig, OutputState,
    OutputStats, Result, SdiError, StreamId, StreamIdAllocator, SystemClock, TimePoint, VideoFormat, VideoFrame,
    CLOCK_FREQ,
};
use crate::hw::{
    CardConfiguration, CardOutput, CompletionStatus, DisplayMode, Driver, EventSink, HwEvent, HwPixelFormat,
    ModeCode, VideoOutputFlags, TIMESCALE,
};
use crate::sdi::ancillary::MAX_CC_COUNT;
use crate::sdi::{v210, Afd, Captions};
use crossbeam_channel::{select, Receiver, Sender};
use image::RgbImage;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 硬件事件通道容量
const EVENT_CAPACITY: usize = 64;
/// 协商前的喂帧超时
const DEFAULT_TIMEOUT: Duration = Duration::from_micros(16_667);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_POLL_ATTEMPTS: u32 = 50;
/// 单次音频提交的交织缓冲区上限
const MAX_AUDIO_BLOCK_BYTES: usize = 64 * 1024;

/// 预卷目标帧数：ceil(preroll × timescale / (CLOCK_FREQ × frameduration))，至少 1
pub fn video_target_frames(preroll: TimePoint, mode: &DisplayMode) -> u32 {
    let num = preroll.as_micros() * mode.timescale;
    let den = CLOCK_FREQ * mode.frame_duration;
    if den <= 0 {
        return 1;
    }
    ((num + den - 1) / den).max(1) as u32
}

/// 预卷目标采样帧数
pub fn audio_target_samples(preroll: TimePoint) -> u32 {
    preroll.to_samples(AES3_SAMPLE_RATE).max(0) as u32
}

/// 丢掉块中早于 `start` 的采样；整块都早于 `start` 时清空
pub fn truncate_before(block: &mut AudioBlock, start: TimePoint, subframes: usize) {
    let Some(pts) = block.pts else { return };
    if pts >= start {
        return;
    }
    let skip = (start - pts).to_samples(AES3_SAMPLE_RATE) as usize;
    if skip >= block.nb_samples as usize {
        block.data.clear();
        block.nb_samples = 0;
        return;
    }
    block.data.drain(..skip * subframes * 2);
    block.nb_samples -= skip as u32;
    block.pts = Some(pts + TimePoint::from_samples(skip as i64, AES3_SAMPLE_RATE));
}

/// 协商好的视频输出
#[derive(Debug, Clone)]
pub struct VideoSetup {
    pub stream: StreamId,
    pub format: VideoFormat,
    pub matched: ModeMatch,
    pub pixel_format: HwPixelFormat,
}

impl VideoSetup {
    pub fn mode(&self) -> &DisplayMode {
        &self.matched.mode
    }

    /// 送入调度器的图像格式
    pub fn output_chroma(&self) -> ChromaFormat {
        match self.pixel_format {
            HwPixelFormat::Yuv10 => ChromaFormat::I422_10L,
            HwPixelFormat::Yuv8 => ChromaFormat::UYVY,
        }
    }
}

/// `add` 的结果：流在输出中承担的角色
#[derive(Debug, Clone)]
pub enum StreamBinding {
    Video(VideoSetup),
    Audio { id: StreamId, mapping: StreamMapping },
    Captions { id: StreamId },
}

impl StreamBinding {
    pub fn id(&self) -> StreamId {
        match self {
            StreamBinding::Video(v) => v.stream,
            StreamBinding::Audio { id, .. } => *id,
            StreamBinding::Captions { id } => *id,
        }
    }
}

struct OutputContext {
    ids: StreamIdAllocator,
    video: Option<VideoSetup>,
    captions: Option<StreamId>,
    audio_streams: Vec<StreamId>,
    audio_enabled: bool,
    /// CDP 序号
    cdp_counter: u16,
}

/// 时间戳状态（独立的锁，避免与队列锁形成环）
#[derive(Debug, Default)]
struct PtsState {
    /// 第一帧视频的硬件时间
    stream_start: Option<TimePoint>,
    /// 最后提交的视频时间戳（软件时钟域）
    last_scheduled: Option<TimePoint>,
    /// 预卷期间提交的最早视频时间（硬件时钟域）
    first_scheduled: Option<TimePoint>,
    /// 最后一帧真实画面入队的系统时间
    last_frame_at: Option<TimePoint>,
}

struct Shared {
    config: OutputConfig,
    card_name: String,
    output: Arc<dyn CardOutput>,
    card_config: Arc<dyn CardConfiguration>,
    clock: Arc<dyn SystemClock>,
    state: Mutex<OutputState>,
    ctx: Mutex<OutputContext>,
    pictures: OutputQueue<VideoFrame>,
    captions: OutputQueue<CaptionBlock>,
    audio: Mutex<SdiAudioMultiplex>,
    pts: Mutex<PtsState>,
    stats: Mutex<OutputStats>,
    nosignal_image: Option<RgbImage>,
    waker: Waker,
    playing: AtomicBool,
    drained: AtomicBool,
}

impl Shared {
    fn set_state(&self, from: &[OutputState], to: OutputState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&state) {
            info!("{} 输出状态 {:?} -> {:?}", log_ctx(), *state, to);
            *state = to;
            true
        } else {
            false
        }
    }
}

/// 一个 SDI 输出设备
pub struct SdiOutput {
    shared: Arc<Shared>,
    cancel: Mutex<Option<Sender<()>>>,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl SdiOutput {
    /// 打开设备、取得能力接口并启动喂帧线程；任何一步失败都不会留下半配置的设备
    pub fn open(driver: &dyn Driver, config: OutputConfig, clock: Arc<dyn SystemClock>) -> Result<Arc<Self>> {
        config.validate()?;

        if driver.card_count() == 0 {
            return Err(SdiError::DeviceNotFound("没有可用的板卡".to_string()));
        }
        let card = driver
            .card(config.card_index)
            .map_err(|e| SdiError::DeviceNotFound(format!("索引 {}: {}", config.card_index, e)))?;
        let card_name = card.model_name();
        let output = card.output().ok_or(SdiError::MissingInterface("视频输出"))?;
        let card_config = card.configuration().ok_or(SdiError::MissingInterface("设备配置"))?;

        let mut mux_config = MultiplexConfig::new(config.channels);
        mux_config.parse_configuration(&config.audio)?;

        let nosignal_image = match &config.nosignal_image {
            Some(path) => match nosignal::load_image(path) {
                Ok(img) => Some(img),
                Err(e) => {
                    warn!("{} 无法加载无信号画面 {}: {}", log_ctx(), path.display(), e);
                    None
                }
            },
            None => None,
        };

        let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let (waker, wake_rx) = Waker::pair();
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);

        let shared = Arc::new(Shared {
            config,
            card_name,
            output: Arc::clone(&output),
            card_config,
            clock,
            state: Mutex::new(OutputState::Idle),
            ctx: Mutex::new(OutputContext {
                ids: StreamIdAllocator::new(),
                video: None,
                captions: None,
                audio_streams: Vec::new(),
                audio_enabled: false,
                cdp_counter: 0,
            }),
            pictures: OutputQueue::new(),
            captions: OutputQueue::new(),
            audio: Mutex::new(SdiAudioMultiplex::new(mux_config)),
            pts: Mutex::new(PtsState::default()),
            stats: Mutex::new(OutputStats::default()),
            nosignal_image,
            waker,
            playing: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        });

        output.set_event_sink(Some(EventSink::new(event_tx)));

        let feeder = Feeder {
            shared: Arc::clone(&shared),
            clock_state: ClockState::new(),
            nosignal: None,
        };
        let handle = thread::Builder::new()
            .name("sdi-feeder".to_string())
            .spawn(move || feeder.run(event_rx, wake_rx, cancel_rx))
            .map_err(|e| {
                output.set_event_sink(None);
                SdiError::Thread(format!("无法启动喂帧线程: {}", e))
            })?;

        info!("{} 打开 SDI 输出: {}", log_ctx(), shared.card_name);
        Ok(Arc::new(Self {
            shared,
            cancel: Mutex::new(Some(cancel_tx)),
            feeder: Mutex::new(Some(handle)),
        }))
    }

    pub fn card_name(&self) -> &str {
        &self.shared.card_name
    }

    pub fn config(&self) -> &OutputConfig {
        &self.shared.config
    }

    pub fn state(&self) -> OutputState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> OutputStats {
        *self.shared.stats.lock()
    }

    /// 排空完成（硬件已停止）
    pub fn is_drained(&self) -> bool {
        self.shared.drained.load(Ordering::SeqCst)
    }

    pub fn video_setup(&self) -> Option<VideoSetup> {
        self.shared.ctx.lock().video.clone()
    }

    /// 注册一个基本流
    ///
    /// 视频和字幕各只有一个；音频在没有映射声明时第一个获胜，有声明时每个声明过的流都接受。
    pub fn add(&self, fmt: &EsFormat) -> Result<StreamBinding> {
        if self.state() == OutputState::Closed {
            return Err(SdiError::Unsupported("输出已关闭".to_string()));
        }
        match fmt.kind {
            EsKind::Video(vf) => self.add_video(fmt.id, vf),
            EsKind::Audio(af) => {
                let mut ctx = self.shared.ctx.lock();
                if self.shared.config.channels == 0 {
                    return Err(SdiError::Unsupported("音频输出已禁用".to_string()));
                }
                let mut audio = self.shared.audio.lock();
                if !audio.config().has_declarations() && !ctx.audio_streams.is_empty() {
                    return Err(SdiError::Unsupported(format!("已有音频流，拒绝 es#{}", fmt.id)));
                }
                if !ctx.audio_enabled {
                    self.configure_audio()?;
                    ctx.audio_enabled = true;
                }
                let mut mapping = audio
                    .config_mut()
                    .add_mapping(fmt.id, &af)
                    .ok_or_else(|| SdiError::Unsupported(format!("es#{} 无法映射到音频子帧", fmt.id)))?;
                let id = ctx.ids.allocate(fmt.id);
                audio.config_mut().bind_stream(fmt.id, id);
                mapping.stream = Some(id);
                ctx.audio_streams.push(id);
                info!("{} 添加音频流 {} -> 子帧 {:?}", log_ctx(), id, mapping.slots);
                Ok(StreamBinding::Audio { id, mapping })
            }
            EsKind::Captions(_) => {
                let mut ctx = self.shared.ctx.lock();
                if ctx.captions.is_some() {
                    return Err(SdiError::Unsupported(format!("已有字幕流，拒绝 es#{}", fmt.id)));
                }
                let id = ctx.ids.allocate(fmt.id);
                ctx.captions = Some(id);
                info!("{} 添加字幕流 {}", log_ctx(), id);
                Ok(StreamBinding::Captions { id })
            }
        }
    }

    fn add_video(&self, es_id: i32, vf: VideoFormat) -> Result<StreamBinding> {
        let mut ctx = self.shared.ctx.lock();
        if ctx.video.is_some() {
            return Err(SdiError::Unsupported(format!("已有视频流，拒绝 es#{}", es_id)));
        }
        self.shared
            .set_state(&[OutputState::Idle], OutputState::Configuring);
        let (matched, pixel_format) = match self.configure_video(&vf) {
            Ok(v) => v,
            Err(e) => {
                self.shared
                    .set_state(&[OutputState::Configuring], OutputState::Idle);
                return Err(e);
            }
        };
        let setup = VideoSetup {
            stream: ctx.ids.allocate(es_id),
            format: vf,
            matched,
            pixel_format,
        };
        ctx.video = Some(setup.clone());
        drop(ctx);

        *self.shared.pts.lock() = PtsState::default();
        self.shared.drained.store(false, Ordering::SeqCst);
        self.shared
            .set_state(&[OutputState::Configuring], OutputState::Prerolling);
        info!(
            "{} 添加视频流 {}: {}x{} -> {} ({})",
            log_ctx(),
            setup.stream,
            vf.width,
            vf.height,
            setup.mode().code,
            setup.mode().name
        );
        self.shared.waker.wake();
        Ok(StreamBinding::Video(setup))
    }

    /// 协商显示模式并打开视频输出
    fn configure_video(&self, vf: &VideoFormat) -> Result<(ModeMatch, HwPixelFormat)> {
        let cfg = &self.shared.config;
        let out = &self.shared.output;
        let forced = cfg.forced_mode()?;

        let modes = out.display_modes();
        let matched = match_display_mode(&modes, vf, forced).ok_or_else(|| {
            SdiError::NoDisplayMode(format!(
                "{}x{} (可见 {}x{}) @ {}/{}",
                vf.width, vf.height, vf.visible_width, vf.visible_height, vf.frame_rate, vf.frame_rate_base
            ))
        })?;
        let pixel_format = if cfg.tenbits { HwPixelFormat::Yuv10 } else { HwPixelFormat::Yuv8 };
        if !out.supports_mode(matched.mode.code, pixel_format) {
            return Err(SdiError::NoDisplayMode(format!(
                "设备不支持 {} / {:?}",
                matched.mode.code, pixel_format
            )));
        }

        self.shared
            .card_config
            .set_video_output_connection(cfg.video_connection)?;
        let flags = VideoOutputFlags {
            vanc: cfg.tenbits,
            vitc: matched.mode.is_standard_definition(),
        };
        out.enable_video_output(matched.mode.code, flags)?;
        debug!(
            "{} 视频输出已启用: {} {:?} {:?}",
            log_ctx(),
            matched.mode.code,
            pixel_format,
            flags
        );
        Ok((matched, pixel_format))
    }

    /// 48 kHz / 16 位 / 配置的声道数
    fn configure_audio(&self) -> Result<()> {
        let channels = self.shared.config.channels;
        if !matches!(channels, 2 | 8 | 16) {
            return Err(SdiError::UnsupportedChannels(channels));
        }
        self.shared
            .output
            .enable_audio_output(AES3_SAMPLE_RATE, channels as u32)?;
        debug!("{} 音频输出已启用: {} 声道", log_ctx(), channels);
        Ok(())
    }

    /// 移除一个流
    pub fn del(&self, id: StreamId) {
        let mut ctx = self.shared.ctx.lock();
        if ctx.video.as_ref().is_some_and(|v| v.stream == id) {
            ctx.video = None;
            let n = self.shared.pictures.flush();
            info!("{} 移除视频流 {} (丢弃 {} 帧)", log_ctx(), id, n);
        } else if ctx.captions == Some(id) {
            ctx.captions = None;
            self.shared.captions.flush();
            info!("{} 移除字幕流 {}", log_ctx(), id);
        } else if let Some(pos) = ctx.audio_streams.iter().position(|s| *s == id) {
            ctx.audio_streams.remove(pos);
            let mut audio = self.shared.audio.lock();
            if let Some(buffer) = audio.config().buffer_for_stream(id.es_id) {
                buffer.flush();
            }
            audio.config_mut().remove_mapping(id.es_id);
            info!("{} 移除音频流 {}", log_ctx(), id);
        } else {
            warn!("{} 移除未知的流 {}", log_ctx(), id);
        }
    }

    /// 丢弃某个流已入队但尚未调度的数据
    pub fn flush_stream(&self, id: StreamId) {
        let ctx = self.shared.ctx.lock();
        if ctx.video.as_ref().is_some_and(|v| v.stream == id) {
            let n = self.shared.pictures.flush();
            debug!("{} 清空视频队列: {} 帧", log_ctx(), n);
        } else if ctx.captions == Some(id) {
            self.shared.captions.flush();
        } else if let Some(buffer) = self.shared.audio.lock().config().buffer_for_stream(id.es_id) {
            buffer.flush();
        }
    }

    /// 入队一帧已转换的画面
    pub fn enqueue_picture(&self, frame: VideoFrame) {
        self.shared.pictures.push(frame);
        self.shared.pts.lock().last_frame_at = Some(self.shared.clock.now());
        self.shared.waker.wake();
    }

    /// 入队字幕数据，按时间戳与画面关联
    pub fn enqueue_captions(&self, block: CaptionBlock) {
        self.shared.captions.push(block);
        self.shared.waker.wake();
    }

    /// 唤醒喂帧线程（音频源写入后调用）
    pub fn wake(&self) {
        self.shared.waker.wake();
    }

    /// 视频流结束：排空剩余帧后停止硬件
    pub fn drain(&self) {
        self.shared.pictures.mark_eos();
        self.shared.set_state(
            &[OutputState::Prerolling, OutputState::Running],
            OutputState::Draining,
        );
        self.shared.waker.wake();
    }

    /// 停止播放、等待在途帧清空、结束喂帧线程并关闭硬件输入输出
    pub fn close(&self) -> Result<()> {
        if self.state() == OutputState::Closed {
            return Ok(());
        }
        let out = &self.shared.output;

        if self.shared.playing.swap(false, Ordering::SeqCst) {
            if let Err(e) = out.stop_scheduled_playback() {
                warn!("{} 停止播放失败: {}", log_ctx(), e);
            }
        }
        for _ in 0..DRAIN_POLL_ATTEMPTS {
            match out.buffered_video_frame_count() {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    debug!("{} 等待 {} 帧离开硬件队列", log_ctx(), n);
                    thread::sleep(DRAIN_POLL_INTERVAL);
                }
            }
        }

        drop(self.cancel.lock().take());
        if let Some(handle) = self.feeder.lock().take() {
            handle
                .join()
                .map_err(|_| SdiError::Thread("喂帧线程异常退出".to_string()))?;
        }

        let (video, audio) = {
            let ctx = self.shared.ctx.lock();
            (ctx.video.is_some(), ctx.audio_enabled)
        };
        if video {
            if let Err(e) = out.disable_video_output() {
                warn!("{} 关闭视频输出失败: {}", log_ctx(), e);
            }
        }
        if audio {
            if let Err(e) = out.disable_audio_output() {
                warn!("{} 关闭音频输出失败: {}", log_ctx(), e);
            }
        }
        out.set_event_sink(None);
        *self.shared.state.lock() = OutputState::Closed;
        info!("{} SDI 输出已关闭: {}", log_ctx(), self.shared.card_name);
        Ok(())
    }
}

impl Drop for SdiOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{} 关闭 SDI 输出失败: {}", log_ctx(), e);
        }
    }
}

/// 喂帧线程的私有状态
struct Feeder {
    shared: Arc<Shared>,
    clock_state: ClockState,
    /// 按显示模式准备好的无信号画面
    nosignal: Option<(ModeCode, VideoFrame)>,
}

impl Feeder {
    fn run(mut self, mut events: Receiver<HwEvent>, wake: Receiver<()>, cancel: Receiver<()>) {
        info!("{} 喂帧线程启动", log_ctx());
        loop {
            let timeout = self.timeout();
            let mut sink_gone = false;
            select! {
                recv(cancel) -> _ => break,
                recv(events) -> ev => match ev {
                    Ok(ev) => self.handle_event(ev),
                    Err(_) => sink_gone = true,
                },
                recv(wake) -> _ => {},
                default(timeout) => {},
            }
            if sink_gone {
                // 硬件已释放事件通道
                events = crossbeam_channel::never();
            }
            self.do_schedule();
        }
        info!("{} 喂帧线程退出", log_ctx());
    }

    fn timeout(&self) -> Duration {
        self.shared
            .ctx
            .lock()
            .video
            .as_ref()
            .map(|v| Duration::from_micros(v.mode().frame_time().as_micros().max(1) as u64))
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    fn handle_event(&mut self, ev: HwEvent) {
        match ev {
            HwEvent::FrameCompleted { status } => match status {
                CompletionStatus::Dropped => {
                    self.shared.stats.lock().video_dropped += 1;
                    warn!("{} 硬件丢弃了一帧", log_ctx());
                }
                CompletionStatus::DisplayedLate => {
                    self.shared.stats.lock().video_late += 1;
                    debug!("{} 帧显示延迟", log_ctx());
                }
                CompletionStatus::Completed | CompletionStatus::Flushed => {}
            },
            HwEvent::PlaybackStopped => info!("{} 硬件播放已停止", log_ctx()),
            HwEvent::FormatChanged { mode, flags } => {
                info!("{} 硬件报告格式变化: {} {:?}", log_ctx(), mode, flags)
            }
        }
    }

    fn do_schedule(&mut self) {
        let state = *self.shared.state.lock();
        if !matches!(
            state,
            OutputState::Prerolling | OutputState::Running | OutputState::Draining
        ) {
            return;
        }
        let Some(video) = self.shared.ctx.lock().video.clone() else {
            return;
        };
        let preroll = TimePoint::from_millis(self.shared.config.preroll_ms as i64);
        let video_target = video_target_frames(preroll, video.mode());
        let audio_target = audio_target_samples(preroll);

        let mut buffered = match self.shared.output.buffered_video_frame_count() {
            Ok(n) => n,
            Err(e) => {
                warn!("{} 无法读取硬件视频缓冲: {}", log_ctx(), e);
                return;
            }
        };
        while buffered < video_target {
            let Some(pic) = self.shared.pictures.pop() else { break };
            if self.process_video(&video, &pic, state) {
                buffered += 1;
            }
        }
        if buffered < video_target && state == OutputState::Running {
            buffered += self.schedule_nosignal(&video, video_target - buffered);
        }

        let audio_ready = self.schedule_audio(audio_target, state);
        let playing = self.shared.playing.load(Ordering::SeqCst);

        if state == OutputState::Prerolling && buffered >= video_target && audio_ready {
            self.start_playback();
        } else if state == OutputState::Draining {
            if !playing && buffered > 0 && self.shared.pictures.is_eos() {
                // 流比预卷目标短：直接开始播放已缓冲的帧
                self.start_playback();
            } else if buffered == 0 && self.shared.pictures.is_eos() && !self.shared.drained.load(Ordering::SeqCst) {
                if self.shared.playing.swap(false, Ordering::SeqCst) {
                    if let Err(e) = self.shared.output.stop_scheduled_playback() {
                        warn!("{} 停止播放失败: {}", log_ctx(), e);
                    }
                }
                self.shared.drained.store(true, Ordering::SeqCst);
                info!("{} 输出排空完成", log_ctx());
            }
        }
    }

    fn start_playback(&mut self) {
        let Some(start) = self.shared.pts.lock().first_scheduled else {
            return;
        };
        if let Err(e) = self
            .shared
            .output
            .start_scheduled_playback(start.as_micros(), TIMESCALE, 1.0)
        {
            error!("{} 无法开始播放: {}", log_ctx(), e);
            return;
        }
        self.shared.playing.store(true, Ordering::SeqCst);
        self.shared
            .set_state(&[OutputState::Prerolling], OutputState::Running);
        info!("{} 从 {} 开始硬件播放", log_ctx(), start);
    }

    /// 软硬件时钟漂移校正（仅在播放中）
    fn update_drift(&mut self) {
        let hw = match self.shared.output.hardware_reference_clock(TIMESCALE) {
            Ok(c) => c.as_time_point(),
            Err(e) => {
                debug!("{} 无法读取硬件时钟: {}", log_ctx(), e);
                return;
            }
        };
        let now = self.shared.clock.now();
        if self.clock_state.update(now, hw) {
            let offset = self.clock_state.offset();
            self.shared.stats.lock().clock_offset = offset.as_micros();
            info!("{} 时钟偏移更新为 {}", log_ctx(), offset);
        }
    }

    /// 收集不晚于画面半帧之后的字幕数据
    fn collect_captions(&self, pts: TimePoint, frame_time: TimePoint) -> Option<Vec<u8>> {
        let limit = pts + TimePoint::from_micros(frame_time.as_micros() / 2);
        let mut data = Vec::new();
        while let Some(cc) = self.shared.captions.pop_if(|c| c.pts <= limit) {
            let whole = cc.data.len() / 3 * 3;
            data.extend_from_slice(&cc.data[..whole]);
        }
        if data.len() > MAX_CC_COUNT * 3 {
            warn!("{} 一帧的字幕数据过多 ({} 组)，截断", log_ctx(), data.len() / 3);
            data.truncate(MAX_CC_COUNT * 3);
        }
        (!data.is_empty()).then_some(data)
    }

    fn process_video(&mut self, video: &VideoSetup, pic: &VideoFrame, state: OutputState) -> bool {
        let mode = video.mode();
        if pic.width != mode.width || pic.height != mode.height || pic.chroma != video.output_chroma() {
            warn!(
                "{} 画面格式不符: {}x{} {:?}，需要 {}x{} {:?}",
                log_ctx(),
                pic.width,
                pic.height,
                pic.chroma,
                mode.width,
                mode.height,
                video.output_chroma()
            );
            self.shared.stats.lock().video_dropped += 1;
            return false;
        }
        if state == OutputState::Running {
            self.update_drift();
        }
        let frame_time = mode.frame_time();
        let time = self.clock_state.adjust(pic.pts);
        {
            let mut pts = self.shared.pts.lock();
            if pts.stream_start.is_none() {
                info!("{} 流起始时间 {}", log_ctx(), time);
                pts.stream_start = Some(time);
            }
        }

        let captions = self.collect_captions(pic.pts, frame_time);
        match self.submit_picture(video, pic, captions.as_deref(), time, frame_time) {
            Ok(()) => {
                let mut pts = self.shared.pts.lock();
                pts.last_scheduled = Some(pic.pts);
                if !self.shared.playing.load(Ordering::SeqCst) {
                    pts.first_scheduled = Some(pts.first_scheduled.map_or(time, |t| t.min(time)));
                }
                drop(pts);
                self.shared.stats.lock().video_scheduled += 1;
                debug!("{} 提交视频帧 {} -> {}", log_ctx(), pic.pts, time);
                true
            }
            Err(e) => {
                error!("{} 视频帧提交失败 ({}): {}", log_ctx(), pic.pts, e);
                self.shared.stats.lock().video_submit_failures += 1;
                false
            }
        }
    }

    fn submit_picture(
        &mut self,
        video: &VideoSetup,
        pic: &VideoFrame,
        captions: Option<&[u8]>,
        time: TimePoint,
        frame_time: TimePoint,
    ) -> Result<()> {
        let out = &self.shared.output;
        let cfg = &self.shared.config;
        let mode = video.mode();
        let format = video.pixel_format;
        let row_bytes = format.row_bytes(mode.width);
        let mut hw = out.create_video_frame(mode.width, mode.height, row_bytes, format)?;

        match format {
            HwPixelFormat::Yuv10 => {
                v210::convert_picture(pic, row_bytes, &mut hw.data)?;
                let mut anc = out.create_ancillary_data(format)?;
                Afd::new(cfg.afd, cfg.ar).fill_buffer(anc.buffer_for_line(cfg.afd_line));
                if let Some(cc) = captions {
                    let counter = {
                        let mut ctx = self.shared.ctx.lock();
                        let c = ctx.cdp_counter;
                        ctx.cdp_counter = c.wrapping_add(1);
                        c
                    };
                    Captions::new(cc, mode.timescale as u32, mode.frame_duration as u32, counter)
                        .fill_buffer(anc.buffer_for_line(cfg.captions_line));
                }
                hw.set_ancillary(anc);
            }
            HwPixelFormat::Yuv8 => {
                let width = mode.width as usize * 2;
                for y in 0..mode.height as usize {
                    hw.row_mut(y)[..width].copy_from_slice(&pic.planes[0].row(y)[..width]);
                }
            }
        }

        out.schedule_video_frame(hw, time.as_micros(), frame_time.as_micros(), TIMESCALE)?;
        Ok(())
    }

    /// 长时间没有新画面时重复提交无信号画面，返回提交的帧数
    fn schedule_nosignal(&mut self, video: &VideoSetup, needed: u32) -> u32 {
        let Some(img) = self.shared.nosignal_image.as_ref() else {
            return 0;
        };
        if !self.shared.pictures.is_empty() {
            return 0;
        }
        let (last_at, last_pts) = {
            let pts = self.shared.pts.lock();
            (pts.last_frame_at, pts.last_scheduled)
        };
        let (Some(last_at), Some(mut pts)) = (last_at, last_pts) else {
            return 0;
        };
        let delay = TimePoint::from_micros(self.shared.config.nosignal_delay as i64 * CLOCK_FREQ);
        if self.shared.clock.now() - last_at < delay {
            return 0;
        }

        let mode = video.mode().clone();
        if self.nosignal.as_ref().map(|(code, _)| *code) != Some(mode.code) {
            match nosignal::prepare_picture(img, mode.width, mode.height, video.output_chroma()) {
                Ok(frame) => self.nosignal = Some((mode.code, frame)),
                Err(e) => {
                    warn!("{} 无法准备无信号画面: {}", log_ctx(), e);
                    return 0;
                }
            }
        }
        let Some((_, frame)) = self.nosignal.take() else {
            return 0;
        };

        let frame_time = mode.frame_time();
        let mut submitted = 0;
        for _ in 0..needed {
            pts += frame_time;
            let time = self.clock_state.adjust(pts);
            match self.submit_picture(video, &frame, None, time, frame_time) {
                Ok(()) => {
                    submitted += 1;
                    self.shared.pts.lock().last_scheduled = Some(pts);
                }
                Err(e) => {
                    error!("{} 无信号画面提交失败: {}", log_ctx(), e);
                    self.shared.stats.lock().video_submit_failures += 1;
                    break;
                }
            }
        }
        if submitted > 0 {
            debug!("{} 提交 {} 帧无信号画面", log_ctx(), submitted);
            self.shared.stats.lock().nosignal_frames += submitted as u64;
        }
        self.nosignal = Some((mode.code, frame));
        submitted
    }

    /// 把硬件音频缓冲补到目标；达到目标（或没有音频可等）时返回 true
    fn schedule_audio(&mut self, target: u32, state: OutputState) -> bool {
        if !self.shared.ctx.lock().audio_enabled {
            return true;
        }
        let mut scheduled = match self.shared.output.buffered_audio_sample_frame_count() {
            Ok(n) => n,
            Err(e) => {
                warn!("{} 无法读取硬件音频缓冲: {}", log_ctx(), e);
                return true;
            }
        };
        let stream_start = self.shared.pts.lock().stream_start;
        if state == OutputState::Prerolling && stream_start.is_none() {
            // 等第一帧视频确定流起始时间
            return false;
        }

        while scheduled < target {
            let block = {
                let mut audio = self.shared.audio.lock();
                if audio.config().mappings().is_empty() || audio.is_eos() {
                    return true;
                }
                match self.next_audio_block(&mut audio, target - scheduled, state, stream_start) {
                    Some(b) => b,
                    None => break,
                }
            };
            let time = self.clock_state.adjust(block.pts.unwrap_or(TimePoint::ZERO));
            match self
                .shared
                .output
                .schedule_audio_samples(&block.data, block.nb_samples, time.as_micros(), TIMESCALE)
            {
                Ok(written) => {
                    if written < block.nb_samples {
                        debug!("{} 硬件只接受了 {}/{} 个采样", log_ctx(), written, block.nb_samples);
                    }
                    scheduled += written;
                    let mut stats = self.shared.stats.lock();
                    stats.audio_blocks_scheduled += 1;
                    stats.audio_samples_scheduled += written as u64;
                }
                Err(e) => {
                    error!("{} 音频块提交失败 ({}): {}", log_ctx(), time, e);
                    self.shared.stats.lock().audio_submit_failures += 1;
                    break;
                }
            }
        }
        scheduled >= target
    }

    /// 从复用器取下一个块；预卷期间丢弃流起始时间之前的采样
    fn next_audio_block(
        &self,
        audio: &mut SdiAudioMultiplex,
        wanted: u32,
        state: OutputState,
        stream_start: Option<TimePoint>,
    ) -> Option<AudioBlock> {
        let subframes = audio.config().subframes();
        let cap = audio.config().max_samples_for_block_size(MAX_AUDIO_BLOCK_BYTES);
        loop {
            let start = audio.next_block_start()?;
            let available = audio.available_virtual_samples(start);
            let mut n = audio.aligned_interleave_in_samples(start, available.min(wanted).min(cap));
            if n == 0 && available > wanted {
                // 第一个突发就比缺口长：整块提交，允许略超目标
                n = audio.aligned_interleave_in_samples(start, available.min(cap));
                if n == 0 {
                    n = audio.aligned_interleave_in_samples(start, available);
                }
            }
            if n == 0 {
                return None;
            }
            let mut block = audio.extract(n)?;
            if state == OutputState::Prerolling {
                if let Some(start) = stream_start {
                    // stream_start 在硬件时钟域，块时间戳在软件时钟域
                    truncate_before(&mut block, start + self.clock_state.offset(), subframes);
                }
            }
            if block.nb_samples > 0 {
                return Some(block);
            }
            debug!("{} 丢弃流起始时间之前的音频块", log_ctx());
        }
    }
}
