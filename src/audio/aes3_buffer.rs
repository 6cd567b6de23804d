use crate::core::{AudioBlock, TimePoint};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// 硬件音频采样率
pub const AES3_SAMPLE_RATE: u32 = 48000;
/// 每个子帧在缓冲区中的字节数（S16）
pub const BYTES_PER_SUBFRAME: usize = 2;

fn ticks_to_frames(t: TimePoint) -> i64 {
    t.to_samples(AES3_SAMPLE_RATE)
}

fn frames_to_duration(frames: i64) -> TimePoint {
    TimePoint::from_samples(frames, AES3_SAMPLE_RATE)
}

/// 缓冲区中的一个数据块（总是整帧）
struct Chunk {
    pts: TimePoint,
    data: Vec<u8>,
}

struct Inner {
    chain: VecDeque<Chunk>,
    /// 头部块中已消费的字节
    offset: usize,
    /// 链上未消费的字节总数
    remaining: usize,
    /// 已标记待丢弃的字节
    toconsume: usize,
    draining: bool,
}

impl Inner {
    fn start(&self, frame_bytes: usize) -> Option<TimePoint> {
        self.chain
            .front()
            .map(|c| c.pts + frames_to_duration((self.offset / frame_bytes) as i64))
    }

    /// `from` 相对缓冲区起点的有符号帧偏移
    fn offset_frames(&self, from: TimePoint, frame_bytes: usize) -> i64 {
        match self.start(frame_bytes) {
            None => 0,
            Some(start) if from >= start => ticks_to_frames(from - start),
            Some(start) => -ticks_to_frames(start - from),
        }
    }

    fn skip(&mut self, mut bytes: usize) {
        bytes = bytes.min(self.remaining);
        self.remaining -= bytes;
        while bytes > 0 {
            let Some(head) = self.chain.front() else { break };
            let avail = head.data.len() - self.offset;
            if bytes >= avail {
                bytes -= avail;
                self.chain.pop_front();
                self.offset = 0;
            } else {
                self.offset += bytes;
                bytes = 0;
            }
        }
    }

    /// 从当前读位置开始逐帧迭代
    fn frames(&self, frame_bytes: usize) -> impl Iterator<Item = &[u8]> {
        let offset = self.offset;
        self.chain
            .iter()
            .enumerate()
            .flat_map(move |(i, c)| {
                let data = if i == 0 { &c.data[offset..] } else { &c.data[..] };
                data.chunks_exact(frame_bytes)
            })
    }
}

/// 单个音频源的按时间寻址环形缓冲区
///
/// 解码线程 `push`，喂帧线程按时间点读取；所有偏移运算都用帧数，避免刻度取整带来的漂移。
pub struct Aes3AudioBuffer {
    subframes: usize,
    /// 块是压缩流突发，块边界才是合法的交织点
    compressed: bool,
    inner: Mutex<Inner>,
}

impl Aes3AudioBuffer {
    pub fn new(subframes: usize, compressed: bool) -> Self {
        Self {
            subframes: subframes.max(1),
            compressed,
            inner: Mutex::new(Inner {
                chain: VecDeque::new(),
                offset: 0,
                remaining: 0,
                toconsume: 0,
                draining: false,
            }),
        }
    }

    pub fn subframes(&self) -> usize {
        self.subframes
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    fn frame_bytes(&self) -> usize {
        self.subframes * BYTES_PER_SUBFRAME
    }

    /// 追加新解码的 PCM
    pub fn push(&self, block: AudioBlock) {
        let Some(pts) = block.pts else {
            warn!("丢弃没有时间戳的音频块 ({} 字节)", block.data.len());
            return;
        };
        let fb = self.frame_bytes();
        let mut data = block.data;
        if data.len() % fb != 0 {
            debug!("音频块末尾有不完整帧，截断 {} 字节", data.len() % fb);
            data.truncate(data.len() - data.len() % fb);
        }
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.remaining += data.len();
        inner.draining = false;
        inner.chain.push_back(Chunk { pts, data });
    }

    /// 最早未消费采样的时间点；缓冲区为空时返回 None
    pub fn buffer_start(&self) -> Option<TimePoint> {
        self.inner.lock().start(self.frame_bytes())
    }

    /// 以 `from` 为基准可读取的帧数
    ///
    /// 缓冲区晚于 `from` 开始时，之前的空档按静音计入；早于 `from` 时扣掉过期部分。
    pub fn available_samples(&self, from: TimePoint) -> u32 {
        let fb = self.frame_bytes();
        let inner = self.inner.lock();
        if inner.chain.is_empty() {
            return 0;
        }
        let remaining = (inner.remaining / fb) as i64;
        let offset = inner.offset_frames(from, fb);
        if offset > 0 && offset >= remaining {
            return 0;
        }
        (remaining - offset).clamp(0, u32::MAX as i64) as u32
    }

    /// 从 `from` 开始读 `count` 帧中的 `src_slot` 子帧，写入交织目标的 `dst_slot` 位置
    ///
    /// `dst_width` 是目标每帧的子帧数；`from` 之后缓冲区尚未开始的部分保持原样（静音）。
    pub fn read(
        &self,
        dst: &mut [u8],
        count: usize,
        from: TimePoint,
        src_slot: usize,
        dst_slot: usize,
        dst_width: usize,
    ) {
        if src_slot >= self.subframes || dst_slot >= dst_width || dst.len() < count * dst_width * BYTES_PER_SUBFRAME {
            warn!(
                "无效的子帧读取: src {} / {}, dst {} / {}",
                src_slot, self.subframes, dst_slot, dst_width
            );
            return;
        }
        let fb = self.frame_bytes();
        let inner = self.inner.lock();
        let offset = inner.offset_frames(from, fb);
        let lead = (-offset).max(0) as usize;
        let skip = offset.max(0) as usize;

        let s = src_slot * BYTES_PER_SUBFRAME;
        for (i, frame) in (lead..count).zip(inner.frames(fb).skip(skip)) {
            let d = (i * dst_width + dst_slot) * BYTES_PER_SUBFRAME;
            dst[d..d + BYTES_PER_SUBFRAME].copy_from_slice(&frame[s..s + BYTES_PER_SUBFRAME]);
        }
    }

    /// 计算接下来 `samples` 帧里真正落在缓冲区内的部分，标记为待消费
    pub fn tag_virtual_consumed(&self, from: TimePoint, samples: u32) {
        let fb = self.frame_bytes();
        let mut inner = self.inner.lock();
        if inner.chain.is_empty() {
            return;
        }
        let offset = inner.offset_frames(from, fb);
        let mut samples = samples as i64;
        if offset > 0 {
            samples += offset;
        } else if offset < 0 {
            let invalid = -offset;
            if invalid >= samples {
                inner.toconsume = 0;
                return;
            }
            samples -= invalid;
        }
        inner.toconsume = samples as usize * fb;
    }

    /// 丢弃已标记消费的字节
    pub fn flush_consumed(&self) {
        let mut inner = self.inner.lock();
        if inner.toconsume > 0 {
            let bytes = inner.toconsume;
            inner.skip(bytes);
            inner.toconsume = 0;
        }
    }

    /// 强制跳到 `t`（源落后时恢复用）
    pub fn forward_to(&self, t: TimePoint) {
        let fb = self.frame_bytes();
        let mut inner = self.inner.lock();
        if inner.chain.is_empty() {
            return;
        }
        let offset = inner.offset_frames(t, fb);
        if offset > 0 {
            debug!("音频缓冲区前跳 {} 帧", offset);
            inner.skip(offset as usize * fb);
        }
    }

    /// 把 `wanted` 缩小到压缩流的块边界
    ///
    /// PCM 源不受限制。压缩源的边界是缓冲区起点和每个块的末尾；
    /// 取不超过 `from + wanted` 的最远边界，没有这样的边界时返回 0（等待更多需求）。
    /// 空缓冲区不会被读取，因此不约束 `wanted`。
    pub fn aligned_interleave_in_samples(&self, from: TimePoint, wanted: u32) -> u32 {
        if !self.compressed {
            return wanted;
        }
        let fb = self.frame_bytes();
        let inner = self.inner.lock();
        if inner.chain.is_empty() {
            return wanted;
        }

        let limit = wanted as i64;
        let mut best = 0i64;
        let mut boundary = -inner.offset_frames(from, fb);
        if boundary > 0 && boundary <= limit {
            best = boundary;
        }
        for (i, c) in inner.chain.iter().enumerate() {
            let len = if i == 0 { c.data.len() - inner.offset } else { c.data.len() };
            boundary += (len / fb) as i64;
            if boundary > limit {
                break;
            }
            if boundary > 0 {
                best = boundary;
            }
        }
        best as u32
    }

    /// 标记流结束
    pub fn drain(&self) {
        self.inner.lock().draining = true;
    }

    /// 已结束且数据读完
    pub fn is_eos(&self) -> bool {
        let inner = self.inner.lock();
        inner.draining && inner.remaining == 0
    }

    /// 丢弃所有缓冲数据
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.chain.clear();
        inner.offset = 0;
        inner.remaining = 0;
        inner.toconsume = 0;
    }

    /// 剩余帧数
    pub fn buffered_frames(&self) -> usize {
        self.inner.lock().remaining / self.frame_bytes()
    }
}
