use crate::core::{log_ctx, ChromaFormat, Result, VideoFrame};
use crate::stream::filter::PictureConverter;
use image::imageops::FilterType;
use image::RgbImage;
use log::info;
use std::path::Path;

/// 读取无信号备用图像
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let img = image::open(path)?.to_rgb8();
    info!(
        "{} 加载无信号画面 {} ({}x{})",
        log_ctx(),
        path.display(),
        img.width(),
        img.height()
    );
    Ok(img)
}

/// BT.709 有限范围 10 位
fn rgb_to_ycbcr(p: &[u8]) -> (f32, f32, f32) {
    let [r, g, b] = [p[0], p[1], p[2]].map(|c| c as f32 / 255.0);
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let cb = (b - y) / 1.8556;
    let cr = (r - y) / 1.5748;
    (64.0 + 876.0 * y, 512.0 + 896.0 * cb, 512.0 + 896.0 * cr)
}

/// 缩放到显示模式大小并转换成输出色度格式
pub fn prepare_picture(img: &RgbImage, width: u32, height: u32, target: ChromaFormat) -> Result<VideoFrame> {
    let scaled = if img.width() == width && img.height() == height {
        img.clone()
    } else {
        image::imageops::resize(img, width, height, FilterType::Triangle)
    };

    let mut frame = VideoFrame::new(width, height, ChromaFormat::I422_10L);
    for (y, row) in scaled.rows().enumerate() {
        let px: Vec<(f32, f32, f32)> = row.map(|p| rgb_to_ycbcr(&p.0)).collect();
        for (x, pair) in px.chunks(2).enumerate() {
            let (y0, cb0, cr0) = pair[0];
            let (y1, cb1, cr1) = pair.get(1).copied().unwrap_or(pair[0]);
            frame.planes[0].set_sample16(2 * x, y, y0.round() as u16);
            if 2 * x + 1 < width as usize {
                frame.planes[0].set_sample16(2 * x + 1, y, y1.round() as u16);
            }
            frame.planes[1].set_sample16(x, y, ((cb0 + cb1) / 2.0).round() as u16);
            frame.planes[2].set_sample16(x, y, ((cr0 + cr1) / 2.0).round() as u16);
        }
    }

    if target == ChromaFormat::I422_10L {
        return Ok(frame);
    }
    PictureConverter::same_size(width, height, target).convert(&frame)
}
