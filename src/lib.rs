//! SDI 广播输出管线
//!
//! 把解码后的图像、多路音频和字幕调度到 SDI 板卡：v210 打包、VANC 辅助数据（AFD / CEA-708 CDP）、
//! AES3 子帧复用与 SMPTE 337 压缩直通，由每个输出一个的喂帧线程按硬件时钟预卷和提交。

pub mod audio;
pub mod core;
pub mod hw;
pub mod output;
pub mod sdi;
pub mod stream;

pub use crate::core::{OutputConfig, Result, SdiError};
pub use output::SdiOutput;
pub use stream::SdiStream;
