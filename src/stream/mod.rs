// 流外观：每个基本流一个对象，负责解码、转换并送入输出

pub mod decoder;
pub mod filter;

pub use decoder::{
    AudioDecoder, BuiltinDecoders, DecoderFactory, PcmDecoder, RawVideoDecoder, VideoDecoder, VideoOutput,
};
pub use filter::PictureConverter;

use crate::audio::convert::PcmConverter;
use crate::audio::smpte337::{self, BurstType};
use crate::audio::{Aes3AudioBuffer, StreamMapping};
use crate::core::{log_ctx, CaptionBlock, EsBlock, EsFormat, EsKind, Result, SdiError, StreamId};
use crate::output::{SdiOutput, StreamBinding};
use log::{debug, info, warn};
use std::sync::Arc;

/// 视频：解码 -> 图像转换 -> 画面队列；带外字幕进字幕队列
pub struct VideoDecodedStream {
    output: Arc<SdiOutput>,
    id: StreamId,
    decoder: Box<dyn VideoDecoder>,
    converter: PictureConverter,
    eos: bool,
}

impl VideoDecodedStream {
    fn sink<'a>(output: &'a SdiOutput, converter: &'a PictureConverter) -> impl FnMut(VideoOutput) + 'a {
        move |out| match out {
            VideoOutput::Picture(frame) => match converter.convert(&frame) {
                Ok(pic) => output.enqueue_picture(pic),
                Err(e) => warn!("{} 图像转换失败，丢弃 {}: {}", log_ctx(), frame.pts, e),
            },
            VideoOutput::Captions(cc) => output.enqueue_captions(cc),
        }
    }

    pub fn send(&mut self, block: EsBlock) -> Result<()> {
        self.eos = false;
        let mut sink = Self::sink(&self.output, &self.converter);
        self.decoder.decode(block, &mut sink)
    }

    pub fn flush(&mut self) {
        self.decoder.flush();
        self.output.flush_stream(self.id);
    }

    pub fn drain(&mut self) -> Result<()> {
        let mut sink = Self::sink(&self.output, &self.converter);
        self.decoder.drain(&mut sink)?;
        self.eos = true;
        self.output.drain();
        Ok(())
    }
}

/// PCM 音频：解码 -> 声道映射/重采样 -> 映射的源缓冲区
pub struct AudioDecodedStream {
    output: Arc<SdiOutput>,
    id: StreamId,
    decoder: Box<dyn AudioDecoder>,
    converter: PcmConverter,
    buffer: Arc<Aes3AudioBuffer>,
}

impl AudioDecodedStream {
    pub fn send(&mut self, block: EsBlock) -> Result<()> {
        let converter = &mut self.converter;
        let buffer = &self.buffer;
        let mut pushed = 0;
        self.decoder.decode(block, &mut |frame| {
            if let Some(b) = converter.convert(&frame) {
                buffer.push(b);
                pushed += 1;
            }
        })?;
        if pushed > 0 {
            self.output.wake();
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        self.decoder.flush();
        self.converter.reset();
        self.buffer.flush();
    }

    pub fn drain(&mut self) -> Result<()> {
        let converter = &mut self.converter;
        let buffer = &self.buffer;
        self.decoder.drain(&mut |frame| {
            if let Some(b) = converter.convert(&frame) {
                buffer.push(b);
            }
        })?;
        if let Some(tail) = self.converter.flush() {
            self.buffer.push(tail);
        }
        self.buffer.drain();
        self.output.wake();
        Ok(())
    }
}

/// 压缩音频直通：每个压缩帧封装成一个 SMPTE 337 突发
pub struct AudioCompressedStream {
    output: Arc<SdiOutput>,
    id: StreamId,
    kind: BurstType,
    buffer: Arc<Aes3AudioBuffer>,
}

impl AudioCompressedStream {
    pub fn send(&mut self, block: EsBlock) -> Result<()> {
        let Some(pts) = block.pts else {
            warn!("{} 压缩音频帧没有时间戳，丢弃", log_ctx());
            return Ok(());
        };
        match smpte337::encapsulate(self.kind, &block.data, pts) {
            Some(burst) => {
                self.buffer.push(burst);
                self.output.wake();
            }
            None => debug!("{} 压缩音频帧无法封装: {}", log_ctx(), self.id),
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        self.buffer.flush();
    }

    pub fn drain(&mut self) {
        self.buffer.drain();
        self.output.wake();
    }
}

/// 独立的字幕流
pub struct CaptionsStream {
    output: Arc<SdiOutput>,
    id: StreamId,
}

impl CaptionsStream {
    pub fn send(&mut self, block: EsBlock) -> Result<()> {
        let Some(pts) = block.pts else {
            warn!("{} 字幕数据没有时间戳，丢弃", log_ctx());
            return Ok(());
        };
        if block.data.len() % 3 != 0 {
            debug!("{} 字幕数据不是完整的三元组: {} 字节", log_ctx(), block.data.len());
        }
        self.output.enqueue_captions(CaptionBlock { pts, data: block.data });
        Ok(())
    }
}

/// 一个已注册到输出的基本流
pub enum SdiStream {
    Video(VideoDecodedStream),
    Audio(AudioDecodedStream),
    Compressed(AudioCompressedStream),
    Captions(CaptionsStream),
}

impl SdiStream {
    /// 在输出上注册流并创建对应的解码链；解码器不可用时撤销注册
    pub fn create(output: &Arc<SdiOutput>, fmt: &EsFormat, decoders: &dyn DecoderFactory) -> Result<Self> {
        let binding = output.add(fmt)?;
        let id = binding.id();
        match Self::build(output, fmt, binding, decoders) {
            Ok(stream) => Ok(stream),
            Err(e) => {
                output.del(id);
                Err(e)
            }
        }
    }

    fn build(
        output: &Arc<SdiOutput>,
        fmt: &EsFormat,
        binding: StreamBinding,
        decoders: &dyn DecoderFactory,
    ) -> Result<Self> {
        match (binding, fmt.kind) {
            (StreamBinding::Video(setup), EsKind::Video(vf)) => {
                let decoder = decoders
                    .video_decoder(&vf)
                    .ok_or_else(|| SdiError::Unsupported(format!("没有 {:?} 视频解码器", vf.chroma)))?;
                info!("{} 视频流 {} 使用解码器 {}", log_ctx(), setup.stream, decoder.name());
                Ok(SdiStream::Video(VideoDecodedStream {
                    output: Arc::clone(output),
                    id: setup.stream,
                    decoder,
                    converter: PictureConverter::new(&setup.matched, output.config().tenbits),
                    eos: false,
                }))
            }
            (StreamBinding::Audio { id, mapping }, EsKind::Audio(af)) => {
                Self::build_audio(output, id, mapping, &af, decoders)
            }
            (StreamBinding::Captions { id }, EsKind::Captions(_)) => Ok(SdiStream::Captions(CaptionsStream {
                output: Arc::clone(output),
                id,
            })),
            (binding, _) => Err(SdiError::Unsupported(format!("流 {} 的角色与格式不符", binding.id()))),
        }
    }

    fn build_audio(
        output: &Arc<SdiOutput>,
        id: StreamId,
        mapping: StreamMapping,
        af: &crate::core::AudioFormat,
        decoders: &dyn DecoderFactory,
    ) -> Result<Self> {
        if !mapping.decode {
            let kind = BurstType::from_codec(af.codec)
                .ok_or_else(|| SdiError::Unsupported(format!("无法直通 {:?}", af.codec)))?;
            info!("{} 音频流 {} 直通 ({:?})", log_ctx(), id, kind);
            return Ok(SdiStream::Compressed(AudioCompressedStream {
                output: Arc::clone(output),
                id,
                kind,
                buffer: mapping.buffer,
            }));
        }
        let decoder = decoders
            .audio_decoder(af)
            .ok_or_else(|| SdiError::Unsupported(format!("没有 {:?} 音频解码器", af.codec)))?;
        info!("{} 音频流 {} 使用解码器 {}", log_ctx(), id, decoder.name());
        Ok(SdiStream::Audio(AudioDecodedStream {
            output: Arc::clone(output),
            id,
            decoder,
            converter: PcmConverter::new(af.rate, af.channels as usize, mapping.slots.len())?,
            buffer: mapping.buffer,
        }))
    }

    pub fn id(&self) -> StreamId {
        match self {
            SdiStream::Video(s) => s.id,
            SdiStream::Audio(s) => s.id,
            SdiStream::Compressed(s) => s.id,
            SdiStream::Captions(s) => s.id,
        }
    }

    /// 送入一个编码块；从不阻塞解码线程
    pub fn send(&mut self, block: EsBlock) -> Result<()> {
        match self {
            SdiStream::Video(s) => s.send(block),
            SdiStream::Audio(s) => s.send(block),
            SdiStream::Compressed(s) => s.send(block),
            SdiStream::Captions(s) => s.send(block),
        }
    }

    /// 丢弃已缓冲但尚未调度的数据
    pub fn flush(&mut self) {
        match self {
            SdiStream::Video(s) => s.flush(),
            SdiStream::Audio(s) => s.flush(),
            SdiStream::Compressed(s) => s.flush(),
            SdiStream::Captions(s) => s.output.flush_stream(s.id),
        }
    }

    /// 流结束：输出剩余数据并标记 EOS
    pub fn drain(&mut self) -> Result<()> {
        match self {
            SdiStream::Video(s) => s.drain(),
            SdiStream::Audio(s) => s.drain(),
            SdiStream::Compressed(s) => {
                s.drain();
                Ok(())
            }
            SdiStream::Captions(_) => Ok(()),
        }
    }

    pub fn is_eos(&self) -> bool {
        match self {
            SdiStream::Video(s) => s.eos && s.output.is_drained(),
            SdiStream::Audio(s) => s.buffer.is_eos(),
            SdiStream::Compressed(s) => s.buffer.is_eos(),
            SdiStream::Captions(_) => false,
        }
    }

    /// 从输出注销
    pub fn close(self) {
        let (output, id) = match &self {
            SdiStream::Video(s) => (&s.output, s.id),
            SdiStream::Audio(s) => (&s.output, s.id),
            SdiStream::Compressed(s) => (&s.output, s.id),
            SdiStream::Captions(s) => (&s.output, s.id),
        };
        output.del(id);
    }
}
