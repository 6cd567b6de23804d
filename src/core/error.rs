use crate::hw::HwError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdiError {
    #[error("未找到 SDI 设备: {0}")]
    DeviceNotFound(String),

    #[error("设备缺少能力接口: {0}")]
    MissingInterface(&'static str),

    #[error("无法协商显示模式: {0}")]
    NoDisplayMode(String),

    #[error("不支持的声道数: {0}")]
    UnsupportedChannels(u8),

    #[error("不支持的流: {0}")]
    Unsupported(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("硬件错误: {0}")]
    Hardware(#[from] HwError),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("线程错误: {0}")]
    Thread(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("图像错误: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("JSON 错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SdiError>;
