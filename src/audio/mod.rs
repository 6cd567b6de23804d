// 音频：按时间寻址的源缓冲区、子帧复用、压缩流封装与 PCM 转换

pub mod aes3_buffer;
pub mod convert;
pub mod multiplex;
pub mod multiplex_config;
pub mod smpte337;

pub use aes3_buffer::{Aes3AudioBuffer, AES3_SAMPLE_RATE};
pub use multiplex::SdiAudioMultiplex;
pub use multiplex_config::{MultiplexConfig, StreamMapping};
