use super::aes3_buffer::{Aes3AudioBuffer, BYTES_PER_SUBFRAME};
use crate::core::{AudioFormat, Result, SdiError, StreamId};
use log::{debug, info, warn};
use std::sync::Arc;

/// 一个基本流到子帧槽位的映射
#[derive(Clone)]
pub struct StreamMapping {
    pub es_id: i32,
    /// 绑定的输出流（add 成功后设置）
    pub stream: Option<StreamId>,
    /// 占用的子帧槽位，按源声道顺序
    pub slots: Vec<u8>,
    /// false 表示压缩流直通（SMPTE 337 封装）
    pub decode: bool,
    pub format: Option<AudioFormat>,
    pub buffer: Arc<Aes3AudioBuffer>,
}

impl std::fmt::Debug for StreamMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMapping")
            .field("es_id", &self.es_id)
            .field("stream", &self.stream)
            .field("slots", &self.slots)
            .field("decode", &self.decode)
            .finish()
    }
}

/// 配置串中声明的一项
#[derive(Debug, Clone, PartialEq)]
struct Declared {
    es_id: i32,
    slots: Vec<u8>,
    embed: bool,
}

/// 子帧槽位分配
///
/// 配置语法：`entry (';' entry)*`，`entry := '*' | ['embed:'] es_id ['=' slot (',' slot)*]`。
/// 出现任何声明项后只接受声明过的流，除非同时出现 `*`。
/// 槽位首次适配分配，在流的生命周期内不会改变。
#[derive(Debug)]
pub struct MultiplexConfig {
    subframes: usize,
    declared: Vec<Declared>,
    declared_only: bool,
    mappings: Vec<StreamMapping>,
}

impl MultiplexConfig {
    pub fn new(channels: u8) -> Self {
        Self {
            subframes: channels as usize,
            declared: Vec::new(),
            declared_only: false,
            mappings: Vec::new(),
        }
    }

    /// 硬件音频帧中的子帧总数
    pub fn subframes(&self) -> usize {
        self.subframes
    }

    /// 立体声对的数量
    pub fn frame_width(&self) -> usize {
        self.subframes / 2
    }

    pub fn is_declared_only(&self) -> bool {
        self.declared_only
    }

    pub fn has_declarations(&self) -> bool {
        !self.declared.is_empty()
    }

    pub fn is_declared(&self, es_id: i32) -> bool {
        self.declared.iter().any(|d| d.es_id == es_id)
    }

    /// 解析映射配置；出错时保持原状态
    pub fn parse_configuration(&mut self, grammar: &str) -> Result<()> {
        let mut declared: Vec<Declared> = Vec::new();
        let mut wildcard = false;

        for entry in grammar.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                wildcard = true;
                continue;
            }
            let (embed, rest) = match entry.strip_prefix("embed:") {
                Some(rest) => (true, rest),
                None => (false, entry),
            };
            let (id, slots) = match rest.split_once('=') {
                Some((id, slots)) => (id, Some(slots)),
                None => (rest, None),
            };
            let es_id: i32 = id
                .trim()
                .parse()
                .map_err(|_| SdiError::Config(format!("无效的流 ID: {:?}", entry)))?;
            let slots = match slots {
                None => Vec::new(),
                Some(list) => list
                    .split(',')
                    .map(|s| {
                        s.trim()
                            .parse::<u8>()
                            .ok()
                            .filter(|&v| (v as usize) < self.subframes)
                            .ok_or_else(|| SdiError::Config(format!("无效的子帧槽位 {:?} (共 {} 个)", s, self.subframes)))
                    })
                    .collect::<Result<Vec<u8>>>()?,
            };
            if has_duplicates(&slots) {
                return Err(SdiError::Config(format!("槽位重复: {:?}", entry)));
            }
            if embed && !slots.is_empty() && !is_aligned_pair(&slots) {
                return Err(SdiError::Config(format!("直通流必须占用对齐的一对槽位: {:?}", entry)));
            }
            if declared.iter().any(|d| d.es_id == es_id) {
                return Err(SdiError::Config(format!("流 {} 重复声明", es_id)));
            }
            declared.push(Declared { es_id, slots, embed });
        }

        self.declared_only = !declared.is_empty() && !wildcard;
        debug!(
            "音频映射配置: {} 项声明, 仅声明模式 {}",
            declared.len(),
            self.declared_only
        );
        self.declared = declared;
        Ok(())
    }

    /// 按声明或按声道数为流分配槽位
    pub fn add_mapping(&mut self, es_id: i32, fmt: &AudioFormat) -> Option<StreamMapping> {
        if fmt.channels == 0 {
            warn!("流 {} 没有声道", es_id);
            return None;
        }
        let compressed = !fmt.codec.is_pcm();

        let mapping = match self.declared.iter().find(|d| d.es_id == es_id).cloned() {
            Some(d) => {
                let decode = !(compressed && d.embed);
                if !compressed && d.embed {
                    debug!("流 {} 是 PCM，忽略 embed 标记", es_id);
                }
                if !d.slots.is_empty() {
                    self.add_mapping_slots(es_id, &d.slots, decode)
                } else if !decode {
                    self.add_mapping_channels(es_id, 2, true, false)
                } else {
                    let n = (fmt.channels as usize).min(self.free_subframe_slots(false).len());
                    self.add_mapping_channels(es_id, n, false, true)
                }
            }
            None if self.declared_only => {
                info!("流 {} 未在音频映射中声明，拒绝", es_id);
                None
            }
            None if compressed => self.add_mapping_channels(es_id, 2, true, false),
            None => {
                let n = (fmt.channels as usize).min(self.free_subframe_slots(false).len());
                self.add_mapping_channels(es_id, n, false, true)
            }
        };

        let Some(mapping) = mapping else {
            warn!("流 {} 无法分配子帧槽位", es_id);
            return None;
        };
        info!("流 {} 映射到子帧 {:?} (解码 {})", es_id, mapping.slots, mapping.decode);
        let m = self.mappings.iter_mut().find(|m| m.es_id == es_id)?;
        m.format = Some(*fmt);
        Some(m.clone())
    }

    /// 按显式槽位列表分配；任何槽位越界、重复或被占用都拒绝
    pub fn add_mapping_slots(&mut self, es_id: i32, slots: &[u8], decode: bool) -> Option<StreamMapping> {
        if slots.is_empty() || self.configuration_for_stream(es_id).is_some() || has_duplicates(slots) {
            return None;
        }
        if slots
            .iter()
            .any(|&s| s as usize >= self.subframes || self.subframe_slot_used(s))
        {
            return None;
        }
        if !decode && !is_aligned_pair(slots) {
            return None;
        }
        let mapping = StreamMapping {
            es_id,
            stream: None,
            slots: slots.to_vec(),
            decode,
            format: None,
            buffer: Arc::new(Aes3AudioBuffer::new(slots.len(), !decode)),
        };
        self.mappings.push(mapping.clone());
        Some(mapping)
    }

    /// 取前 `channels` 个空闲槽位；`aligned` 时只取对齐的立体声对
    pub fn add_mapping_channels(&mut self, es_id: i32, channels: usize, aligned: bool, decode: bool) -> Option<StreamMapping> {
        if channels == 0 {
            return None;
        }
        let free = self.free_subframe_slots(aligned);
        if free.len() < channels {
            return None;
        }
        let slots = free[..channels].to_vec();
        self.add_mapping_slots(es_id, &slots, decode)
    }

    /// 绑定输出流 ID
    pub fn bind_stream(&mut self, es_id: i32, stream: StreamId) {
        if let Some(m) = self.mappings.iter_mut().find(|m| m.es_id == es_id) {
            m.stream = Some(stream);
        }
    }

    pub fn remove_mapping(&mut self, es_id: i32) -> bool {
        let before = self.mappings.len();
        self.mappings.retain(|m| m.es_id != es_id);
        before != self.mappings.len()
    }

    /// 空闲槽位；`aligned` 时返回空闲的对齐立体声对（展开成两个槽位）
    pub fn free_subframe_slots(&self, aligned: bool) -> Vec<u8> {
        let subframes = self.subframes as u8;
        if aligned {
            (0..subframes)
                .step_by(2)
                .filter(|&s| s + 1 < subframes && !self.subframe_slot_used(s) && !self.subframe_slot_used(s + 1))
                .flat_map(|s| [s, s + 1])
                .collect()
        } else {
            (0..subframes).filter(|&s| !self.subframe_slot_used(s)).collect()
        }
    }

    pub fn subframe_slot_used(&self, slot: u8) -> bool {
        self.mappings.iter().any(|m| m.slots.contains(&slot))
    }

    /// 所有已分配的槽位（升序）
    pub fn configured_slots(&self) -> Vec<u8> {
        let mut slots: Vec<u8> = self.mappings.iter().flat_map(|m| m.slots.iter().copied()).collect();
        slots.sort_unstable();
        slots
    }

    pub fn buffer_for_stream(&self, es_id: i32) -> Option<Arc<Aes3AudioBuffer>> {
        self.configuration_for_stream(es_id).map(|m| Arc::clone(&m.buffer))
    }

    pub fn configuration_for_stream(&self, es_id: i32) -> Option<&StreamMapping> {
        self.mappings.iter().find(|m| m.es_id == es_id)
    }

    pub fn mappings(&self) -> &[StreamMapping] {
        &self.mappings
    }

    /// 给定字节数的交织缓冲区最多容纳的采样帧数
    pub fn max_samples_for_block_size(&self, bytes: usize) -> u32 {
        if self.subframes == 0 {
            return 0;
        }
        (bytes / (self.subframes * BYTES_PER_SUBFRAME)) as u32
    }
}

fn has_duplicates(slots: &[u8]) -> bool {
    slots
        .iter()
        .enumerate()
        .any(|(i, s)| slots[i + 1..].contains(s))
}

fn is_aligned_pair(slots: &[u8]) -> bool {
    slots.len() == 2 && slots[0] % 2 == 0 && slots[1] == slots[0] + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AudioCodec;

    fn pcm(channels: u16) -> AudioFormat {
        AudioFormat {
            codec: AudioCodec::PcmS16Le,
            rate: 48000,
            channels,
        }
    }

    fn ac3() -> AudioFormat {
        AudioFormat {
            codec: AudioCodec::Ac3,
            rate: 48000,
            channels: 6,
        }
    }

    fn assert_disjoint(cfg: &MultiplexConfig) {
        let slots = cfg.configured_slots();
        let mut dedup = slots.clone();
        dedup.dedup();
        assert_eq!(slots, dedup);
    }

    #[test]
    fn channel_count_mapping_is_first_fit() {
        let mut cfg = MultiplexConfig::new(8);
        assert_eq!(cfg.add_mapping(1, &pcm(2)).unwrap().slots, vec![0, 1]);
        assert_eq!(cfg.add_mapping(2, &pcm(3)).unwrap().slots, vec![2, 3, 4]);
        // 剩下 3 个槽位：6 声道缩混到 3
        assert_eq!(cfg.add_mapping(3, &pcm(6)).unwrap().slots, vec![5, 6, 7]);
        assert!(cfg.add_mapping(4, &pcm(2)).is_none());
        assert_disjoint(&cfg);
    }

    #[test]
    fn passthrough_takes_aligned_pair() {
        let mut cfg = MultiplexConfig::new(8);
        cfg.add_mapping(1, &pcm(1)).unwrap();
        let m = cfg.add_mapping(2, &ac3()).unwrap();
        assert_eq!(m.slots, vec![2, 3]);
        assert!(!m.decode);
        assert!(m.buffer.is_compressed());
        assert_eq!(cfg.free_subframe_slots(false), vec![1, 4, 5, 6, 7]);
        assert_eq!(cfg.free_subframe_slots(true), vec![4, 5, 6, 7]);
    }

    #[test]
    fn explicit_slots_reject_overlap_without_side_effects() {
        let mut cfg = MultiplexConfig::new(8);
        assert!(cfg.add_mapping_slots(1, &[0, 1], true).is_some());
        let before = cfg.configured_slots();
        assert!(cfg.add_mapping_slots(2, &[1, 2], true).is_none());
        assert!(cfg.add_mapping_slots(3, &[8], true).is_none());
        assert!(cfg.add_mapping_slots(4, &[3, 3], true).is_none());
        assert!(cfg.add_mapping_slots(5, &[3, 4], false).is_none());
        assert_eq!(cfg.configured_slots(), before);
        assert_eq!(cfg.mappings().len(), 1);
    }

    #[test]
    fn declared_only_rejects_unknown_streams() {
        let mut cfg = MultiplexConfig::new(16);
        cfg.parse_configuration("3=4,5;embed:7;9").unwrap();
        assert!(cfg.is_declared_only());
        assert_eq!(cfg.add_mapping(3, &pcm(2)).unwrap().slots, vec![4, 5]);
        let embedded = cfg.add_mapping(7, &ac3()).unwrap();
        assert_eq!(embedded.slots, vec![0, 1]);
        assert!(!embedded.decode);
        assert_eq!(cfg.add_mapping(9, &pcm(2)).unwrap().slots, vec![2, 3]);
        assert!(cfg.add_mapping(11, &pcm(2)).is_none());
        assert_disjoint(&cfg);
    }

    #[test]
    fn wildcard_keeps_accepting() {
        let mut cfg = MultiplexConfig::new(8);
        cfg.parse_configuration("2=6,7; *").unwrap();
        assert!(!cfg.is_declared_only());
        assert!(cfg.is_declared(2));
        assert_eq!(cfg.add_mapping(5, &pcm(2)).unwrap().slots, vec![0, 1]);
        assert_eq!(cfg.add_mapping(2, &pcm(2)).unwrap().slots, vec![6, 7]);
    }

    #[test]
    fn bad_grammar_leaves_state_unchanged() {
        let mut cfg = MultiplexConfig::new(8);
        cfg.parse_configuration("1=0,1").unwrap();
        assert!(cfg.parse_configuration("x=1").is_err());
        assert!(cfg.parse_configuration("1=9").is_err());
        assert!(cfg.parse_configuration("1=2,2").is_err());
        assert!(cfg.parse_configuration("embed:1=1,2").is_err());
        assert!(cfg.parse_configuration("1;1").is_err());
        assert!(cfg.is_declared(1));
        assert!(cfg.is_declared_only());
    }

    #[test]
    fn remove_frees_slots() {
        let mut cfg = MultiplexConfig::new(2);
        cfg.add_mapping(1, &pcm(2)).unwrap();
        assert!(cfg.add_mapping(2, &pcm(2)).is_none());
        assert!(cfg.remove_mapping(1));
        assert!(!cfg.remove_mapping(1));
        assert!(cfg.add_mapping(2, &pcm(2)).is_some());
        assert!(cfg.buffer_for_stream(2).is_some());
        assert!(cfg.buffer_for_stream(1).is_none());
    }

    #[test]
    fn block_size_in_samples() {
        let cfg = MultiplexConfig::new(8);
        assert_eq!(cfg.frame_width(), 4);
        assert_eq!(cfg.max_samples_for_block_size(16 * 100), 100);
    }
}
