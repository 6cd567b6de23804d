use super::aes3_buffer::{Aes3AudioBuffer, AES3_SAMPLE_RATE, BYTES_PER_SUBFRAME};
use super::multiplex_config::MultiplexConfig;
use crate::core::{AudioBlock, TimePoint};
use log::{debug, warn};
use std::sync::Arc;

/// 一个子帧位置的数据来源
#[derive(Clone)]
struct SlotSource {
    buffer: Arc<Aes3AudioBuffer>,
    /// 源缓冲区内的子帧序号
    src_slot: usize,
}

/// 一个立体声对：{subframe0, subframe1}
#[derive(Clone, Default)]
struct FrameSource {
    subframe: [Option<SlotSource>; 2],
}

impl FrameSource {
    fn buffers(&self) -> impl Iterator<Item = &Arc<Aes3AudioBuffer>> {
        self.subframe.iter().flatten().map(|s| &s.buffer)
    }

    fn is_occupied(&self) -> bool {
        self.subframe.iter().any(Option::is_some)
    }

    /// 所有来源都已结束并读空
    fn is_finished(&self) -> bool {
        self.buffers().all(|b| b.is_eos())
    }
}

/// 把多个音频源按槽位交织成固定声道数的 S16 块
///
/// 输出块的起始时间单调不减：源的起点落后于 `head` 时先被强制前跳到 `head`。
pub struct SdiAudioMultiplex {
    config: MultiplexConfig,
    head: Option<TimePoint>,
}

impl SdiAudioMultiplex {
    pub fn new(config: MultiplexConfig) -> Self {
        Self { config, head: None }
    }

    pub fn config(&self) -> &MultiplexConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut MultiplexConfig {
        &mut self.config
    }

    /// 上一个输出块的结束时间
    pub fn head(&self) -> Option<TimePoint> {
        self.head
    }

    fn frame_sources(&self) -> Vec<FrameSource> {
        let mut sources = vec![FrameSource::default(); self.config.frame_width()];
        for m in self.config.mappings() {
            for (src_slot, &slot) in m.slots.iter().enumerate() {
                let slot = slot as usize;
                if let Some(pair) = sources.get_mut(slot / 2) {
                    pair.subframe[slot % 2] = Some(SlotSource {
                        buffer: Arc::clone(&m.buffer),
                        src_slot,
                    });
                }
            }
        }
        sources
    }

    /// 参与交织的缓冲区（去重，不含已读空结束的）
    fn active_buffers(&self) -> Vec<Arc<Aes3AudioBuffer>> {
        let mut out: Vec<Arc<Aes3AudioBuffer>> = Vec::new();
        for m in self.config.mappings() {
            if !m.buffer.is_eos() && !out.iter().any(|b| Arc::ptr_eq(b, &m.buffer)) {
                out.push(Arc::clone(&m.buffer));
            }
        }
        out
    }

    /// 以 `from` 为基准，所有有效立体声对都能提供的帧数
    pub fn available_virtual_samples(&self, from: TimePoint) -> u32 {
        self.frame_sources()
            .iter()
            .filter(|pair| pair.is_occupied() && !pair.is_finished())
            .map(|pair| {
                pair.buffers()
                    .filter(|b| !b.is_eos())
                    .map(|b| b.available_samples(from))
                    .min()
                    .unwrap_or(0)
            })
            .min()
            .unwrap_or(0)
    }

    /// 把 `wanted` 缩到所有压缩源都合法的交织点
    pub fn aligned_interleave_in_samples(&self, from: TimePoint, wanted: u32) -> u32 {
        self.active_buffers()
            .iter()
            .map(|b| b.aligned_interleave_in_samples(from, wanted))
            .min()
            .unwrap_or(wanted)
    }

    /// 所有有效源中最早的缓冲起点
    pub fn buffer_start(&self) -> Option<TimePoint> {
        self.active_buffers().iter().filter_map(|b| b.buffer_start()).min()
    }

    /// 下一个块的起始时间（不修改状态）
    pub fn next_block_start(&self) -> Option<TimePoint> {
        let start = self.buffer_start()?;
        Some(match self.head {
            Some(head) if start < head => head,
            _ => start,
        })
    }

    /// 交织输出 `samples` 帧
    pub fn extract(&mut self, samples: u32) -> Option<AudioBlock> {
        if samples == 0 {
            return None;
        }
        let mut start = self.buffer_start()?;
        let buffers = self.active_buffers();

        if let Some(head) = self.head {
            if start < head {
                debug!("音频源起点 {} 落后于 {}，前跳", start, head);
                for b in &buffers {
                    b.forward_to(head);
                }
                start = head;
            }
        }

        let width = self.config.subframes();
        let size = samples as usize * width * BYTES_PER_SUBFRAME;
        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            warn!("音频块分配失败: {} 字节", size);
            return None;
        }
        data.resize(size, 0);

        for (pair_index, pair) in self.frame_sources().iter().enumerate() {
            for (i, source) in pair.subframe.iter().enumerate() {
                if let Some(s) = source {
                    s.buffer
                        .read(&mut data, samples as usize, start, s.src_slot, pair_index * 2 + i, width);
                }
            }
        }

        for b in &buffers {
            b.tag_virtual_consumed(start, samples);
            b.flush_consumed();
        }

        self.head = Some(start + TimePoint::from_samples(samples as i64, AES3_SAMPLE_RATE));
        Some(AudioBlock {
            data,
            pts: Some(start),
            nb_samples: samples,
        })
    }

    /// 丢弃所有源的数据并重置 head
    pub fn flush(&mut self) {
        for m in self.config.mappings() {
            m.buffer.flush();
        }
        self.head = None;
    }

    /// 所有映射的源都已结束并读空
    pub fn is_eos(&self) -> bool {
        self.config.mappings().iter().all(|m| m.buffer.is_eos())
    }
}
