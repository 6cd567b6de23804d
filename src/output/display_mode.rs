use crate::core::VideoFormat;
use crate::hw::{DisplayMode, ModeCode};
use log::{debug, info};

/// 显示模式匹配结果
#[derive(Debug, Clone, PartialEq)]
pub struct ModeMatch {
    pub mode: DisplayMode,
    /// 源图像中实际使用的区域（从左上角裁剪）
    pub source_width: u32,
    pub source_height: u32,
    /// 源是模式的一半分辨率，需要 2 倍放大
    pub upscale: bool,
}

/// 依次尝试：原始尺寸、可见尺寸、原始尺寸的一半、可见尺寸的一半
///
/// 每一轮都要求帧率精确相等。强制模式代码优先于匹配，只要设备支持就直接使用。
pub fn match_display_mode(modes: &[DisplayMode], fmt: &VideoFormat, forced: Option<ModeCode>) -> Option<ModeMatch> {
    if let Some(code) = forced {
        let mode = modes.iter().find(|m| m.code == code)?;
        let upscale = fmt.visible_width * 2 == mode.width && fmt.visible_height * 2 == mode.height;
        info!("使用强制显示模式 {} ({})", mode.code, mode.name);
        return Some(ModeMatch {
            mode: mode.clone(),
            source_width: fmt.visible_width,
            source_height: fmt.visible_height,
            upscale,
        });
    }

    let rounds = [
        (fmt.width, fmt.height, false),
        (fmt.visible_width, fmt.visible_height, false),
        (fmt.width, fmt.height, true),
        (fmt.visible_width, fmt.visible_height, true),
    ];
    for (round, &(w, h, half)) in rounds.iter().enumerate() {
        let scale = if half { 2 } else { 1 };
        let found = modes
            .iter()
            .find(|m| m.width == w * scale && m.height == h * scale && m.frame_rate_matches(fmt));
        if let Some(mode) = found {
            debug!("第 {} 轮匹配到显示模式 {} ({})", round + 1, mode.code, mode.name);
            return Some(ModeMatch {
                mode: mode.clone(),
                source_width: w,
                source_height: h,
                upscale: half,
            });
        }
    }
    None
}
