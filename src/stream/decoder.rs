//! 解码器接口
//!
//! 真正的解码器在外部实现；这里只定义流外观使用的接口，并内置两个原始格式解码器
//! （平面原始图像和 PCM），演示程序和测试都用它们。

use crate::core::{
    log_ctx, AudioCodec, AudioFormat, AudioFrame, CaptionBlock, EsBlock, Result, SdiError, TimePoint, VideoFormat,
    VideoFrame,
};
use log::{debug, info, warn};

/// 视频解码器输出
#[derive(Debug, Clone)]
pub enum VideoOutput {
    Picture(VideoFrame),
    /// 带外字幕数据
    Captions(CaptionBlock),
}

pub trait VideoDecoder: Send {
    /// 按格式初始化；不支持时返回 false
    fn init(&mut self, format: &VideoFormat) -> bool;

    fn decode(&mut self, block: EsBlock, sink: &mut dyn FnMut(VideoOutput)) -> Result<()>;

    /// 丢弃内部缓冲
    fn flush(&mut self);

    /// 输出所有缓冲的帧
    fn drain(&mut self, sink: &mut dyn FnMut(VideoOutput)) -> Result<()>;

    fn name(&self) -> &str;
}

pub trait AudioDecoder: Send {
    fn init(&mut self, format: &AudioFormat) -> bool;

    fn decode(&mut self, block: EsBlock, sink: &mut dyn FnMut(AudioFrame)) -> Result<()>;

    fn flush(&mut self);

    fn drain(&mut self, sink: &mut dyn FnMut(AudioFrame)) -> Result<()>;

    fn name(&self) -> &str;
}

/// 按格式创建解码器
pub trait DecoderFactory: Send + Sync {
    fn video_decoder(&self, format: &VideoFormat) -> Option<Box<dyn VideoDecoder>>;
    fn audio_decoder(&self, format: &AudioFormat) -> Option<Box<dyn AudioDecoder>>;
}

/// 内置的原始格式解码器
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinDecoders;

impl DecoderFactory for BuiltinDecoders {
    fn video_decoder(&self, format: &VideoFormat) -> Option<Box<dyn VideoDecoder>> {
        let mut dec = RawVideoDecoder::default();
        dec.init(format).then(|| Box::new(dec) as Box<dyn VideoDecoder>)
    }

    fn audio_decoder(&self, format: &AudioFormat) -> Option<Box<dyn AudioDecoder>> {
        let mut dec = PcmDecoder::default();
        dec.init(format).then(|| Box::new(dec) as Box<dyn AudioDecoder>)
    }
}

/// 原始平面图像：各平面按紧密行跨度依次拼接
#[derive(Debug, Default)]
pub struct RawVideoDecoder {
    format: Option<VideoFormat>,
    frame_size: usize,
}

impl VideoDecoder for RawVideoDecoder {
    fn init(&mut self, format: &VideoFormat) -> bool {
        if format.width == 0 || format.height == 0 {
            return false;
        }
        let blank = VideoFrame::new(format.width, format.height, format.chroma);
        self.frame_size = blank.planes.iter().map(|p| p.data.len()).sum();
        self.format = Some(*format);
        info!(
            "{} 原始视频解码器: {}x{} {:?} ({} 字节/帧)",
            log_ctx(),
            format.width,
            format.height,
            format.chroma,
            self.frame_size
        );
        true
    }

    fn decode(&mut self, block: EsBlock, sink: &mut dyn FnMut(VideoOutput)) -> Result<()> {
        let fmt = self
            .format
            .ok_or_else(|| SdiError::DecodeError("解码器未初始化".to_string()))?;
        let pts = block
            .pts
            .ok_or_else(|| SdiError::DecodeError("图像没有时间戳".to_string()))?;
        if block.data.len() < self.frame_size {
            return Err(SdiError::DecodeError(format!(
                "图像数据不足: {} < {}",
                block.data.len(),
                self.frame_size
            )));
        }

        let mut frame = VideoFrame::new(fmt.width, fmt.height, fmt.chroma);
        frame.pts = pts;
        frame.duration = block.duration.unwrap_or_else(|| fmt.frame_duration());
        let mut offset = 0;
        for plane in &mut frame.planes {
            let len = plane.data.len();
            plane.data.copy_from_slice(&block.data[offset..offset + len]);
            offset += len;
        }

        if !block.captions.is_empty() {
            sink(VideoOutput::Captions(CaptionBlock {
                pts,
                data: block.captions,
            }));
        }
        sink(VideoOutput::Picture(frame));
        Ok(())
    }

    fn flush(&mut self) {}

    fn drain(&mut self, _sink: &mut dyn FnMut(VideoOutput)) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "rawvideo"
    }
}

/// 交错 PCM（S16 小端或 f32 小端）
#[derive(Debug, Default)]
pub struct PcmDecoder {
    format: Option<AudioFormat>,
    /// 下一块的预期时间戳（块没有时间戳时使用）
    next_pts: Option<TimePoint>,
}

impl PcmDecoder {
    fn bytes_per_sample(codec: AudioCodec) -> usize {
        match codec {
            AudioCodec::PcmF32 => 4,
            _ => 2,
        }
    }
}

impl AudioDecoder for PcmDecoder {
    fn init(&mut self, format: &AudioFormat) -> bool {
        if !format.codec.is_pcm() || format.channels == 0 || format.rate == 0 {
            return false;
        }
        self.format = Some(*format);
        self.next_pts = None;
        true
    }

    fn decode(&mut self, block: EsBlock, sink: &mut dyn FnMut(AudioFrame)) -> Result<()> {
        let fmt = self
            .format
            .ok_or_else(|| SdiError::DecodeError("解码器未初始化".to_string()))?;
        let Some(pts) = block.pts.or(self.next_pts) else {
            warn!("{} 丢弃没有时间戳的音频块", log_ctx());
            return Ok(());
        };

        let bps = Self::bytes_per_sample(fmt.codec);
        let frame_bytes = bps * fmt.channels as usize;
        let frames = block.data.len() / frame_bytes;
        if block.data.len() % frame_bytes != 0 {
            debug!("{} 音频块末尾有不完整的采样帧，截断", log_ctx());
        }
        let body = &block.data[..frames * frame_bytes];

        let data: Vec<f32> = match fmt.codec {
            AudioCodec::PcmF32 => body
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            _ => body
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect(),
        };

        self.next_pts = Some(pts + TimePoint::from_samples(frames as i64, fmt.rate));
        if frames > 0 {
            sink(AudioFrame {
                pts,
                sample_rate: fmt.rate,
                channels: fmt.channels,
                data,
            });
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.next_pts = None;
    }

    fn drain(&mut self, _sink: &mut dyn FnMut(AudioFrame)) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "pcm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChromaFormat;

    #[test]
    fn raw_video_planes_and_captions() {
        let fmt = VideoFormat::new(4, 2, 25, 1, ChromaFormat::I420);
        let mut dec = BuiltinDecoders.video_decoder(&fmt).unwrap();
        // 4x2 亮度 + 2x1 + 2x1 色度
        let data: Vec<u8> = (0..12).collect();
        let block = EsBlock::new(data, TimePoint::from_millis(40)).with_captions(vec![0xFC, 0x94, 0x2C]);

        let mut out = Vec::new();
        dec.decode(block, &mut |o| out.push(o)).unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], VideoOutput::Captions(c) if c.data == [0xFC, 0x94, 0x2C]));
        let VideoOutput::Picture(pic) = &out[1] else { panic!("expected picture") };
        assert_eq!(pic.planes[0].data, (0..8).collect::<Vec<u8>>());
        assert_eq!(pic.planes[2].data, vec![10, 11]);
        assert_eq!(pic.duration, TimePoint::from_millis(40));
    }

    #[test]
    fn raw_video_rejects_short_block() {
        let fmt = VideoFormat::new(4, 2, 25, 1, ChromaFormat::I420);
        let mut dec = BuiltinDecoders.video_decoder(&fmt).unwrap();
        let res = dec.decode(EsBlock::new(vec![0; 5], TimePoint::ZERO), &mut |_| {});
        assert!(res.is_err());
    }

    #[test]
    fn pcm_s16_decodes_and_continues_pts() {
        let fmt = AudioFormat {
            codec: AudioCodec::PcmS16Le,
            rate: 48000,
            channels: 2,
        };
        let mut dec = BuiltinDecoders.audio_decoder(&fmt).unwrap();
        let samples: Vec<i16> = vec![16384, -16384, 0, 32767];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut frames = Vec::new();
        dec.decode(EsBlock::new(bytes.clone(), TimePoint::ZERO), &mut |f| frames.push(f))
            .unwrap();
        let no_pts = EsBlock {
            data: bytes,
            ..Default::default()
        };
        dec.decode(no_pts, &mut |f| frames.push(f)).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data[..2], [0.5, -0.5]);
        assert_eq!(frames[0].frames(), 2);
        assert_eq!(frames[1].pts, TimePoint::from_samples(2, 48000));
    }

    #[test]
    fn compressed_audio_has_no_builtin_decoder() {
        let fmt = AudioFormat {
            codec: AudioCodec::Ac3,
            rate: 48000,
            channels: 6,
        };
        assert!(BuiltinDecoders.audio_decoder(&fmt).is_none());
    }
}
