use super::error::{Result, SdiError};
use crate::hw::{ModeCode, VideoConnection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// SDI 输出配置（由外部配置加载器提供）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// 设备索引（枚举顺序）
    pub card_index: u32,
    /// 视频连接类型
    pub video_connection: VideoConnection,
    /// 强制显示模式（四字符代码）
    pub mode: Option<String>,
    /// 10 位输出（v210 + VANC），否则 8 位 UYVY
    pub tenbits: bool,
    /// 音频声道数：0（禁用）/ 2 / 8 / 16
    pub channels: u8,
    /// 音频到子帧的映射配置
    pub audio: String,
    /// AFD 代码
    pub afd: u8,
    /// 宽高比位（0 = 4:3, 1 = 16:9）
    pub ar: u8,
    /// AFD 所在 VANC 行
    pub afd_line: u32,
    /// 字幕所在 VANC 行
    pub captions_line: u32,
    /// 无信号延迟（秒）
    pub nosignal_delay: u64,
    /// 无信号备用画面
    pub nosignal_image: Option<PathBuf>,
    /// 预卷缓冲目标（毫秒）
    pub preroll_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            card_index: 0,
            video_connection: VideoConnection::Sdi,
            mode: None,
            tenbits: true,
            channels: 2,
            audio: String::new(),
            afd: 8,
            ar: 1,
            afd_line: 16,
            captions_line: 15,
            nosignal_delay: 5,
            nosignal_image: None,
            preroll_ms: 200,
        }
    }
}

impl OutputConfig {
    /// 从 JSON 文件读取配置
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: OutputConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 检查配置取值
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.channels, 0 | 2 | 8 | 16) {
            return Err(SdiError::UnsupportedChannels(self.channels));
        }
        self.forced_mode()?;
        if self.afd > 0x0F {
            return Err(SdiError::Config(format!("AFD 代码超出范围: {}", self.afd)));
        }
        if self.ar > 1 {
            return Err(SdiError::Config(format!("宽高比位只能是 0 或 1: {}", self.ar)));
        }
        if self.afd_line == self.captions_line {
            return Err(SdiError::Config(format!(
                "AFD 行与字幕行不能相同: {}",
                self.afd_line
            )));
        }
        if self.preroll_ms == 0 {
            return Err(SdiError::Config("预卷时长不能为 0".to_string()));
        }
        Ok(())
    }

    /// 解析强制显示模式
    pub fn forced_mode(&self) -> Result<Option<ModeCode>> {
        match self.mode.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => s
                .parse::<ModeCode>()
                .map(Some)
                .map_err(|_| SdiError::Config(format!("无效的显示模式: {}", s))),
        }
    }
}
