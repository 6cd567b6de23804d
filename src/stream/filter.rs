//! 图像格式转换
//!
//! 把解码器输出（I420 / I422 / I422_10L / UYVY）转换成输出格式（v210 前的 I422_10L，或 8 位 UYVY），
//! 按匹配结果裁剪到使用区域、必要时 2 倍放大，并居中放进显示模式大小的画面。

use crate::core::{ChromaFormat, Result, SdiError, VideoFrame};
use crate::output::display_mode::ModeMatch;

/// 源图像的 10 位采样读取
struct Source<'a> {
    frame: &'a VideoFrame,
}

impl<'a> Source<'a> {
    fn luma(&self, x: usize, y: usize) -> u16 {
        let f = self.frame;
        match f.chroma {
            ChromaFormat::I422_10L => f.planes[0].sample16(x, y),
            ChromaFormat::UYVY => (f.planes[0].data[y * f.planes[0].pitch + x * 2 + 1] as u16) << 2,
            _ => (f.planes[0].data[y * f.planes[0].pitch + x] as u16) << 2,
        }
    }

    /// 第 `cx` 个色度对（4:2:2 水平位置）
    fn chroma(&self, cx: usize, y: usize) -> (u16, u16) {
        let f = self.frame;
        match f.chroma {
            ChromaFormat::I422_10L => (f.planes[1].sample16(cx, y), f.planes[2].sample16(cx, y)),
            ChromaFormat::UYVY => {
                let i = y * f.planes[0].pitch + cx * 4;
                let d = &f.planes[0].data;
                ((d[i] as u16) << 2, (d[i + 2] as u16) << 2)
            }
            ChromaFormat::I422 => {
                let i = y * f.planes[1].pitch + cx;
                ((f.planes[1].data[i] as u16) << 2, (f.planes[2].data[i] as u16) << 2)
            }
            ChromaFormat::I420 => {
                let i = (y / 2) * f.planes[1].pitch + cx;
                ((f.planes[1].data[i] as u16) << 2, (f.planes[2].data[i] as u16) << 2)
            }
        }
    }
}

/// 输出画面写入
fn put(dst: &mut VideoFrame, x: usize, y: usize, luma: [u16; 2], u: u16, v: u16) {
    match dst.chroma {
        ChromaFormat::I422_10L => {
            dst.planes[0].set_sample16(x, y, luma[0]);
            dst.planes[0].set_sample16(x + 1, y, luma[1]);
            dst.planes[1].set_sample16(x / 2, y, u);
            dst.planes[2].set_sample16(x / 2, y, v);
        }
        _ => {
            let row = dst.planes[0].row_mut(y);
            let i = x * 2;
            row[i] = (u >> 2) as u8;
            row[i + 1] = (luma[0] >> 2) as u8;
            row[i + 2] = (v >> 2) as u8;
            row[i + 3] = (luma[1] >> 2) as u8;
        }
    }
}

/// 按显示模式转换图像
#[derive(Debug, Clone)]
pub struct PictureConverter {
    target: ChromaFormat,
    width: u32,
    height: u32,
    source_width: u32,
    source_height: u32,
    scale: u32,
}

impl PictureConverter {
    pub fn new(m: &ModeMatch, tenbits: bool) -> Self {
        Self {
            target: if tenbits { ChromaFormat::I422_10L } else { ChromaFormat::UYVY },
            width: m.mode.width,
            height: m.mode.height,
            source_width: m.source_width,
            source_height: m.source_height,
            scale: if m.upscale { 2 } else { 1 },
        }
    }

    /// 同尺寸的色度转换
    pub fn same_size(width: u32, height: u32, target: ChromaFormat) -> Self {
        Self {
            target,
            width,
            height,
            source_width: width,
            source_height: height,
            scale: 1,
        }
    }

    pub fn target(&self) -> ChromaFormat {
        self.target
    }

    pub fn convert(&self, frame: &VideoFrame) -> Result<VideoFrame> {
        if frame.planes.len() < frame.chroma.plane_count() {
            return Err(SdiError::DecodeError(format!("图像平面数不足: {:?}", frame.chroma)));
        }
        if frame.width == 0 || frame.height == 0 {
            return Err(SdiError::DecodeError("空图像".to_string()));
        }
        let mut out = VideoFrame::new(self.width, self.height, self.target);
        out.pts = frame.pts;
        out.duration = frame.duration;

        let scale = self.scale as usize;
        let sw = (self.source_width.min(frame.width) as usize) & !1;
        let sh = self.source_height.min(frame.height) as usize;
        let (w, h) = (self.width as usize, self.height as usize);
        let off_x = (w.saturating_sub(sw * scale) / 2) & !1;
        let off_y = h.saturating_sub(sh * scale) / 2;
        let src = Source { frame };

        for y in off_y..h.min(off_y + sh * scale) {
            let sy = (y - off_y) / scale;
            let mut x = off_x;
            while x + 1 < w.min(off_x + sw * scale) {
                let sx0 = (x - off_x) / scale;
                let sx1 = (x + 1 - off_x) / scale;
                let (u, v) = src.chroma(sx0 / 2, sy);
                put(&mut out, x, y, [src.luma(sx0, sy), src.luma(sx1, sy)], u, v);
                x += 2;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::DisplayMode;

    fn i420(w: u32, h: u32, y: u8, u: u8, v: u8) -> VideoFrame {
        let mut f = VideoFrame::new(w, h, ChromaFormat::I420);
        f.planes[0].data.fill(y);
        f.planes[1].data.fill(u);
        f.planes[2].data.fill(v);
        f
    }

    fn mode_match(w: u32, h: u32, sw: u32, sh: u32, upscale: bool) -> ModeMatch {
        ModeMatch {
            mode: DisplayMode::new(b"test", "test", w, h, 1000, 25000),
            source_width: sw,
            source_height: sh,
            upscale,
        }
    }

    #[test]
    fn i420_to_ten_bit() {
        let conv = PictureConverter::new(&mode_match(8, 4, 8, 4, false), true);
        let out = conv.convert(&i420(8, 4, 100, 50, 200)).unwrap();
        assert_eq!(out.chroma, ChromaFormat::I422_10L);
        assert_eq!(out.planes[0].sample16(7, 3), 400);
        assert_eq!(out.planes[1].sample16(3, 3), 200);
        assert_eq!(out.planes[2].sample16(0, 0), 800);
    }

    #[test]
    fn ten_bit_to_uyvy() {
        let conv = PictureConverter::same_size(4, 1, ChromaFormat::UYVY);
        let mut src = VideoFrame::new(4, 1, ChromaFormat::I422_10L);
        src.planes[0].set_sample16(0, 0, 400);
        src.planes[1].set_sample16(0, 0, 600);
        let out = conv.convert(&src).unwrap();
        assert_eq!(&out.planes[0].data[..4], &[150, 100, 128, 16]);
    }

    #[test]
    fn half_resolution_is_doubled() {
        let conv = PictureConverter::new(&mode_match(8, 4, 4, 2, true), true);
        let mut src = i420(4, 2, 10, 128, 128);
        src.planes[0].data[1] = 20;
        let out = conv.convert(&src).unwrap();
        assert_eq!(out.planes[0].sample16(1, 0), 40);
        assert_eq!(out.planes[0].sample16(2, 1), 80);
        assert_eq!(out.planes[0].sample16(3, 1), 80);
    }

    #[test]
    fn smaller_source_is_centered_on_black() {
        let conv = PictureConverter::new(&mode_match(8, 4, 4, 2, false), true);
        let out = conv.convert(&i420(4, 2, 200, 128, 128)).unwrap();
        // 黑场边框
        assert_eq!(out.planes[0].sample16(0, 0), 64);
        assert_eq!(out.planes[0].sample16(2, 1), 800);
        assert_eq!(out.planes[0].sample16(6, 1), 64);
    }

    #[test]
    fn crop_to_visible_area() {
        let conv = PictureConverter::new(&mode_match(4, 2, 4, 2, false), false);
        let out = conv.convert(&i420(4, 4, 50, 128, 128)).unwrap();
        assert_eq!(out.height, 2);
        assert_eq!(out.planes[0].data.len(), 4 * 2 * 2);
    }
}
