// SMPTE 337 压缩音频封装：每个压缩帧一个突发，按立体声 S16 子帧承载

use crate::core::{AudioBlock, AudioCodec, TimePoint};
use log::warn;

const PA: u16 = 0xF872;
const PB: u16 = 0x4E1F;
/// AC-3 / E-AC-3 同步字
const SYNC_WORD: [u8; 2] = [0x0B, 0x77];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstType {
    Ac3,
    EAc3,
}

impl BurstType {
    pub fn from_codec(codec: AudioCodec) -> Option<Self> {
        match codec {
            AudioCodec::Ac3 => Some(BurstType::Ac3),
            AudioCodec::EAc3 => Some(BurstType::EAc3),
            _ => None,
        }
    }

    /// Pc 中的数据类型
    pub fn data_type(&self) -> u16 {
        match self {
            BurstType::Ac3 => 1,
            BurstType::EAc3 => 21,
        }
    }

    /// 突发重复周期（采样帧）
    pub fn period(&self) -> u32 {
        match self {
            BurstType::Ac3 => 1536,
            BurstType::EAc3 => 6144,
        }
    }

    /// Pd：AC-3 以位计，E-AC-3 以字节计
    fn length_code(&self, payload_len: usize) -> u16 {
        match self {
            BurstType::Ac3 => (payload_len * 8) as u16,
            BurstType::EAc3 => payload_len as u16,
        }
    }

    /// 一个突发最多承载的负载字节数
    pub fn max_payload(&self) -> usize {
        (self.period() as usize * 2 - 4) * 2
    }
}

/// 把一个压缩帧封装成一个突发块（立体声 S16 小端，补零到周期长度）
pub fn encapsulate(kind: BurstType, payload: &[u8], pts: TimePoint) -> Option<AudioBlock> {
    if payload.len() < 2 || payload[..2] != SYNC_WORD {
        warn!("压缩帧缺少同步字，丢弃 {} 字节", payload.len());
        return None;
    }
    if payload.len() > kind.max_payload() {
        warn!("压缩帧过长: {} 字节（上限 {}）", payload.len(), kind.max_payload());
        return None;
    }

    let period = kind.period();
    let mut data = vec![0u8; period as usize * 4];
    let mut words = [PA, PB, kind.data_type(), kind.length_code(payload.len())]
        .into_iter()
        .chain(payload.chunks(2).map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)])));
    for slot in data.chunks_exact_mut(2) {
        match words.next() {
            Some(w) => slot.copy_from_slice(&w.to_le_bytes()),
            None => break,
        }
    }

    Some(AudioBlock {
        data,
        pts: Some(pts),
        nb_samples: period,
    })
}

/// 解析突发头，返回 (数据类型, 负载)
pub fn parse_burst(data: &[u8]) -> Option<(u16, Vec<u8>)> {
    let word = |i: usize| -> Option<u16> {
        data.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    };
    if word(0)? != PA || word(1)? != PB {
        return None;
    }
    let data_type = word(2)? & 0x1F;
    let len = match data_type {
        1 => word(3)? as usize / 8,
        21 => word(3)? as usize,
        _ => return None,
    };
    let mut payload = Vec::with_capacity(len + 1);
    for i in 0..len.div_ceil(2) {
        payload.extend_from_slice(&word(4 + i)?.to_be_bytes());
    }
    payload.truncate(len);
    Some((data_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ac3_frame(len: usize) -> Vec<u8> {
        let mut f: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        f[..2].copy_from_slice(&SYNC_WORD);
        f
    }

    #[test]
    fn ac3_burst_layout() {
        let frame = ac3_frame(769);
        let block = encapsulate(BurstType::Ac3, &frame, TimePoint::from_millis(32)).unwrap();
        assert_eq!(block.nb_samples, 1536);
        assert_eq!(block.data.len(), 1536 * 4);
        assert_eq!(&block.data[..4], &[0x72, 0xF8, 0x1F, 0x4E]);
        assert_eq!(u16::from_le_bytes([block.data[6], block.data[7]]), 769 * 8);
        // 负载按大端 16 位字存放
        assert_eq!(&block.data[8..10], &[0x77, 0x0B]);

        let (kind, payload) = parse_burst(&block.data).unwrap();
        assert_eq!(kind, 1);
        assert_eq!(payload, frame);
        assert!(block.data[8 + 770..].iter().all(|&b| b == 0));
    }

    #[test]
    fn eac3_uses_byte_length_and_longer_period() {
        let frame = ac3_frame(1000);
        let block = encapsulate(BurstType::EAc3, &frame, TimePoint::ZERO).unwrap();
        assert_eq!(block.nb_samples, 6144);
        let (kind, payload) = parse_burst(&block.data).unwrap();
        assert_eq!(kind, 21);
        assert_eq!(payload.len(), 1000);
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(encapsulate(BurstType::Ac3, &[0u8; 100], TimePoint::ZERO).is_none());
        assert!(encapsulate(BurstType::Ac3, &ac3_frame(7000), TimePoint::ZERO).is_none());
        assert!(parse_burst(&[0u8; 16]).is_none());
    }
}
