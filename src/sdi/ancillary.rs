//! VANC 辅助数据包（SMPTE 291）：AFD 与 CEA-708 字幕分发包（CDP）
//!
//! 包结构：`[0x000, 0x3FF, 0x3FF, DID, SDID, DC, UDW..., CS]`，
//! DID/SDID/DC/UDW 的 bit8 是 bit0..7 的偶校验，bit9 是 bit8 取反；
//! 校验和是 DID 到最后一个 UDW 的 9 位累加和，bit9 = !bit8。

use super::v210;
use log::warn;

/// v210 对齐填充字
pub const PAD_WORD: u16 = 0x040;

pub const AFD_DID: u8 = 0x41;
pub const AFD_SDID: u8 = 0x05;
pub const CAPTIONS_DID: u8 = 0x61;
pub const CAPTIONS_SDID: u8 = 0x01;

const CDP_HEADER_ID: [u8; 2] = [0x96, 0x69];
const CDP_CCDATA_ID: u8 = 0x72;
const CDP_FOOTER_ID: u8 = 0x74;
/// cc_count 只有 5 位
pub const MAX_CC_COUNT: usize = 0x1F;

/// 给 8 位值加上奇偶位（bit8 = 偶校验，bit9 = !bit8）
pub fn with_parity(v: u8) -> u16 {
    let v = v as u16;
    if v.count_ones() % 2 == 1 {
        v | 0x100
    } else {
        v | 0x200
    }
}

fn parity_ok(w: u16) -> bool {
    w <= 0x3FF && with_parity((w & 0xFF) as u8) == w
}

/// 计算 9 位校验和字
fn checksum_word(words: &[u16]) -> u16 {
    let sum = words.iter().fold(0u16, |acc, w| (acc + (w & 0x1FF)) & 0x1FF);
    sum | ((!sum & 0x100) << 1)
}

/// 10 位辅助数据包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data10bitPacket {
    words: Vec<u16>,
    /// 未填充的有效长度
    len: usize,
}

impl Data10bitPacket {
    /// 用 DID/SDID 和 8 位负载构建一个包（负载最多 255 字节）
    pub fn new(did: u8, sdid: u8, payload: &[u8]) -> Self {
        let payload = if payload.len() > 255 {
            warn!("辅助数据负载过长 ({} 字节)，截断到 255", payload.len());
            &payload[..255]
        } else {
            payload
        };
        let mut words = Vec::with_capacity(7 + payload.len() + 5);
        words.extend_from_slice(&[0x000, 0x3FF, 0x3FF]);
        words.push(with_parity(did));
        words.push(with_parity(sdid));
        words.push(with_parity(payload.len() as u8));
        words.extend(payload.iter().map(|&b| with_parity(b)));
        let cs = checksum_word(&words[3..]);
        words.push(cs);
        let len = words.len();
        Self { words, len }
    }

    /// 以固定填充字补齐到 6 字对齐
    pub fn pad(&mut self) {
        let aligned = self.words.len().div_ceil(6) * 6;
        self.words.resize(aligned, PAD_WORD);
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// 不含填充的包长度（字）
    pub fn packet_len(&self) -> usize {
        self.len
    }

    pub fn did(&self) -> u8 {
        (self.words[3] & 0xFF) as u8
    }

    pub fn sdid(&self) -> u8 {
        (self.words[4] & 0xFF) as u8
    }

    pub fn payload(&self) -> Vec<u8> {
        let dc = (self.words[5] & 0xFF) as usize;
        self.words[6..6 + dc].iter().map(|w| (w & 0xFF) as u8).collect()
    }

    pub fn checksum(&self) -> u16 {
        self.words[self.len - 1]
    }

    /// 解析并校验一个包；头、奇偶位、长度或校验和不对时返回 None
    pub fn parse(words: &[u16]) -> Option<Self> {
        if words.len() < 7 || words[..3] != [0x000, 0x3FF, 0x3FF] {
            return None;
        }
        if !words[3..6].iter().all(|&w| parity_ok(w)) {
            return None;
        }
        let dc = (words[5] & 0xFF) as usize;
        let len = 7 + dc;
        if words.len() < len {
            return None;
        }
        if !words[6..6 + dc].iter().all(|&w| parity_ok(w)) {
            return None;
        }
        if checksum_word(&words[3..len - 1]) != words[len - 1] {
            return None;
        }
        Some(Self {
            words: words[..len].to_vec(),
            len,
        })
    }

    /// 转换为 v210 写入一条 VANC 行缓冲区
    pub fn fill_buffer(&self, buf: &mut [u8]) -> bool {
        let mut padded = self.clone();
        padded.pad();
        match v210::convert_words(&padded.words, buf) {
            Some(_) => true,
            None => {
                warn!("VANC 行缓冲区太小: {} 字节", buf.len());
                false
            }
        }
    }
}

/// 主动格式描述符（SMPTE 2016-1）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Afd {
    pub code: u8,
    /// 0 = 4:3, 1 = 16:9
    pub aspect_ratio: u8,
    pub bar_data_flags: u8,
    pub bar_data_value1: u16,
    pub bar_data_value2: u16,
}

impl Afd {
    pub fn new(code: u8, aspect_ratio: u8) -> Self {
        Self {
            code,
            aspect_ratio,
            ..Default::default()
        }
    }

    /// 8 字节负载
    pub fn body(&self) -> [u8; 8] {
        [
            ((self.code & 0x0F) << 3) | ((self.aspect_ratio & 0x01) << 2),
            0,
            0,
            (self.bar_data_flags & 0x0F) << 4,
            (self.bar_data_value1 >> 8) as u8,
            (self.bar_data_value1 & 0xFF) as u8,
            (self.bar_data_value2 >> 8) as u8,
            (self.bar_data_value2 & 0xFF) as u8,
        ]
    }

    pub fn packet(&self) -> Data10bitPacket {
        Data10bitPacket::new(AFD_DID, AFD_SDID, &self.body())
    }

    pub fn fill_buffer(&self, buf: &mut [u8]) -> bool {
        self.packet().fill_buffer(buf)
    }

    pub fn parse(packet: &Data10bitPacket) -> Option<Self> {
        if packet.did() != AFD_DID || packet.sdid() != AFD_SDID {
            return None;
        }
        let b = packet.payload();
        if b.len() != 8 {
            return None;
        }
        Some(Self {
            code: (b[0] >> 3) & 0x0F,
            aspect_ratio: (b[0] >> 2) & 0x01,
            bar_data_flags: b[3] >> 4,
            bar_data_value1: u16::from_be_bytes([b[4], b[5]]),
            bar_data_value2: u16::from_be_bytes([b[6], b[7]]),
        })
    }
}

/// 帧率 -> CDP 帧率代码
///
/// 帧率按千分之一帧四舍五入后匹配，未知帧率回退为 1（23.976）。
pub fn frame_rate_code(num: u32, den: u32) -> u8 {
    if den == 0 {
        return 1;
    }
    let milli = (1000 * num as u64 + den as u64 / 2) / den as u64;
    match milli {
        23976 => 1,
        24000 => 2,
        25000 => 3,
        29970 => 4,
        30000 => 5,
        50000 => 6,
        59940 => 7,
        60000 => 8,
        _ => 1,
    }
}

/// 构建 CDP 字节序列；没有完整的 cc 三元组时返回 None
pub fn build_cdp(cc_data: &[u8], rate_code: u8, counter: u16) -> Option<Vec<u8>> {
    let mut cc_count = cc_data.len() / 3;
    if cc_count == 0 {
        return None;
    }
    if cc_count > MAX_CC_COUNT {
        warn!("字幕三元组过多 ({})，截断到 {}", cc_count, MAX_CC_COUNT);
        cc_count = MAX_CC_COUNT;
    }
    let len = 9 + 3 * cc_count + 4;
    let [hi, lo] = counter.to_be_bytes();

    let mut cdp = Vec::with_capacity(len);
    cdp.extend_from_slice(&CDP_HEADER_ID);
    cdp.push(len as u8);
    cdp.push((rate_code << 4) | 0x0F);
    // ccdata_present | caption_service_active | reserved
    cdp.push(0x43);
    cdp.push(hi);
    cdp.push(lo);
    cdp.push(CDP_CCDATA_ID);
    cdp.push(0xE0 | cc_count as u8);
    cdp.extend_from_slice(&cc_data[..3 * cc_count]);
    cdp.push(CDP_FOOTER_ID);
    cdp.push(hi);
    cdp.push(lo);
    let sum = cdp.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    cdp.push(sum.wrapping_neg());
    Some(cdp)
}

/// 解析后的 CDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cdp {
    pub rate_code: u8,
    pub counter: u16,
    pub cc_data: Vec<u8>,
}

/// 解析并校验 CDP；截断或任一校验失败返回 None
pub fn parse_cdp(bytes: &[u8]) -> Option<Cdp> {
    if bytes.len() < 13 || bytes[..2] != CDP_HEADER_ID {
        return None;
    }
    let len = bytes[2] as usize;
    if len < 13 || bytes.len() < len {
        return None;
    }
    let cdp = &bytes[..len];
    if cdp.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
        return None;
    }
    let counter = u16::from_be_bytes([cdp[5], cdp[6]]);
    if cdp[7] != CDP_CCDATA_ID || cdp[8] & 0xE0 != 0xE0 {
        return None;
    }
    let cc_count = (cdp[8] & 0x1F) as usize;
    let footer = 9 + 3 * cc_count;
    if footer + 4 != len {
        return None;
    }
    if cdp[footer] != CDP_FOOTER_ID || u16::from_be_bytes([cdp[footer + 1], cdp[footer + 2]]) != counter {
        return None;
    }
    Some(Cdp {
        rate_code: cdp[3] >> 4,
        counter,
        cc_data: cdp[9..footer].to_vec(),
    })
}

/// 字幕辅助数据
pub struct Captions<'a> {
    cc_data: &'a [u8],
    rate_code: u8,
    counter: u16,
}

impl<'a> Captions<'a> {
    /// `num/den` 为帧率（timescale / frame duration）
    pub fn new(cc_data: &'a [u8], num: u32, den: u32, counter: u16) -> Self {
        Self {
            cc_data,
            rate_code: frame_rate_code(num, den),
            counter,
        }
    }

    pub fn packet(&self) -> Option<Data10bitPacket> {
        let cdp = build_cdp(self.cc_data, self.rate_code, self.counter)?;
        Some(Data10bitPacket::new(CAPTIONS_DID, CAPTIONS_SDID, &cdp))
    }

    pub fn fill_buffer(&self, buf: &mut [u8]) -> bool {
        match self.packet() {
            Some(p) => p.fill_buffer(buf),
            None => false,
        }
    }
}
