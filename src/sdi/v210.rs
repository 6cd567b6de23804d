//! v210 像素编解码
//!
//! 6 个 4:2:2 像素（6 Y + 3 Cb + 3 Cr，每个 10 位）打包成 4 个 32 位小端字：
//!
//! ```text
//! w0 = Cb0 | Y0 << 10 | Cr0 << 20
//! w1 = Y1  | Cb1 << 10 | Y2 << 20
//! w2 = Cr1 | Y3 << 10 | Cb2 << 20
//! w3 = Y4  | Cr2 << 10 | Y5 << 20
//! ```

use crate::core::{ChromaFormat, Result, SdiError, VideoFrame};

/// 画面采样的合法范围（0..3 与 1020..1023 保留给定时参考信号）
pub const SAMPLE_MIN: u16 = 4;
pub const SAMPLE_MAX: u16 = 1019;

#[inline]
fn clip(v: u16) -> u32 {
    v.clamp(SAMPLE_MIN, SAMPLE_MAX) as u32
}

#[inline]
fn pack(a: u16, b: u16, c: u16) -> u32 {
    clip(a) | (clip(b) << 10) | (clip(c) << 20)
}

/// 一行 v210 的硬件行字节数（48 像素对齐到 128 字节）
pub fn row_bytes(width: u32) -> usize {
    (width as usize).div_ceil(48) * 128
}

/// 把 32 位字以小端写入目标行
fn write_words(words: &mut [u32], dst: &mut [u8]) {
    for w in words.iter_mut() {
        *w = w.to_le();
    }
    let bytes: &[u8] = bytemuck::cast_slice(words);
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[bytes.len()..].fill(0);
}

/// 将 I422_10L 图像转换为 v210，按 `dst_stride` 补齐每行
pub fn convert_picture(frame: &VideoFrame, dst_stride: usize, dst: &mut [u8]) -> Result<()> {
    if frame.chroma != ChromaFormat::I422_10L || frame.planes.len() < 3 {
        return Err(SdiError::Unsupported(format!("v210 只接受 I422_10L，收到 {:?}", frame.chroma)));
    }
    let width = frame.width as usize;
    let height = frame.height as usize;
    let used = width.div_ceil(6) * 16;
    if dst_stride < used || dst.len() < dst_stride * height {
        return Err(SdiError::Unsupported(format!(
            "v210 目标缓冲区太小: stride {} / 需要 {}",
            dst_stride, used
        )));
    }

    let [py, pu, pv] = [&frame.planes[0], &frame.planes[1], &frame.planes[2]];
    let mut words: Vec<u32> = Vec::with_capacity(used / 4);

    for h in 0..height {
        words.clear();
        let (mut yi, mut ui, mut vi) = (0usize, 0usize, 0usize);
        let mut y = || {
            yi += 1;
            py.sample16(yi - 1, h)
        };
        let mut u = || {
            ui += 1;
            pu.sample16(ui - 1, h)
        };
        let mut v = || {
            vi += 1;
            pv.sample16(vi - 1, h)
        };

        let mut w = 0;
        while w + 5 < width {
            words.push(pack(u(), y(), v()));
            words.push(pack(y(), u(), y()));
            words.push(pack(v(), y(), u()));
            words.push(pack(y(), v(), y()));
            w += 6;
        }
        if w + 1 < width {
            words.push(pack(u(), y(), v()));
            let mut val = clip(y());
            if w + 2 == width {
                words.push(val);
            }
            if w + 3 < width {
                val |= (clip(u()) << 10) | (clip(y()) << 20);
                words.push(val);
                val = clip(v()) | (clip(y()) << 10);
                words.push(val);
            }
        }

        write_words(&mut words, &mut dst[h * dst_stride..(h + 1) * dst_stride]);
    }
    Ok(())
}

/// 将 10 位字序列（辅助数据行）写入 v210 的亮度位置
///
/// 每 6 个字占 4 个 32 位字，色度位置填 0，不做裁剪以保留 0x000/0x3FF 标志。
/// 输入长度必须是 6 的倍数；返回写入的字节数。
pub fn convert_words(src: &[u16], dst: &mut [u8]) -> Option<usize> {
    if src.len() % 6 != 0 {
        return None;
    }
    let bytes = src.len() / 6 * 16;
    if dst.len() < bytes {
        return None;
    }
    let mut words: Vec<u32> = Vec::with_capacity(src.len() / 6 * 4);
    for g in src.chunks_exact(6) {
        let s = |i: usize| (g[i] & 0x3FF) as u32;
        words.push(s(0) << 10);
        words.push(s(1) | (s(2) << 20));
        words.push(s(3) << 10);
        words.push(s(4) | (s(5) << 20));
    }
    for w in words.iter_mut() {
        *w = w.to_le();
    }
    dst[..bytes].copy_from_slice(bytemuck::cast_slice(&words));
    Some(bytes)
}

fn read_le32(src: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([src[i * 4], src[i * 4 + 1], src[i * 4 + 2], src[i * 4 + 3]])
}

/// `convert_words` 的逆过程：读出亮度位置上的 `count` 个 10 位字
pub fn unpack_words(src: &[u8], count: usize) -> Vec<u16> {
    let groups = (count.div_ceil(6)).min(src.len() / 16);
    let mut out = Vec::with_capacity(groups * 6);
    for g in 0..groups {
        let w = |i: usize| read_le32(src, g * 4 + i);
        out.push(((w(0) >> 10) & 0x3FF) as u16);
        out.push((w(1) & 0x3FF) as u16);
        out.push(((w(1) >> 20) & 0x3FF) as u16);
        out.push(((w(2) >> 10) & 0x3FF) as u16);
        out.push((w(3) & 0x3FF) as u16);
        out.push(((w(3) >> 20) & 0x3FF) as u16);
    }
    out.truncate(count);
    out
}

/// `convert_picture` 的逆过程（宽度必须是 6 的倍数）
pub fn unpack_picture(src: &[u8], stride: usize, width: u32, height: u32) -> Option<VideoFrame> {
    if width % 6 != 0 || src.len() < stride * height as usize {
        return None;
    }
    let mut frame = VideoFrame::new(width, height, ChromaFormat::I422_10L);
    for h in 0..height as usize {
        let row = &src[h * stride..(h + 1) * stride];
        for g in 0..width as usize / 6 {
            let f = |w: u32, i: u32| ((w >> (10 * i)) & 0x3FF) as u16;
            let [w0, w1, w2, w3] = [0, 1, 2, 3].map(|i| read_le32(row, g * 4 + i));
            let (x, c) = (g * 6, g * 3);
            frame.planes[1].set_sample16(c, h, f(w0, 0));
            frame.planes[0].set_sample16(x, h, f(w0, 1));
            frame.planes[2].set_sample16(c, h, f(w0, 2));
            frame.planes[0].set_sample16(x + 1, h, f(w1, 0));
            frame.planes[1].set_sample16(c + 1, h, f(w1, 1));
            frame.planes[0].set_sample16(x + 2, h, f(w1, 2));
            frame.planes[2].set_sample16(c + 1, h, f(w2, 0));
            frame.planes[0].set_sample16(x + 3, h, f(w2, 1));
            frame.planes[1].set_sample16(c + 2, h, f(w2, 2));
            frame.planes[0].set_sample16(x + 4, h, f(w3, 0));
            frame.planes[2].set_sample16(c + 2, h, f(w3, 1));
            frame.planes[0].set_sample16(x + 5, h, f(w3, 2));
        }
    }
    Some(frame)
}
