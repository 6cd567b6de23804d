// SDI 线路格式：v210 像素编解码与 VANC 辅助数据

pub mod ancillary;
pub mod v210;

pub use ancillary::{Afd, Captions, Data10bitPacket};
