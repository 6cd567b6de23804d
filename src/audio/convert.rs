//! PCM 转换：声道选择/缩混、sinc 重采样到 48 kHz、f32 -> S16

use super::aes3_buffer::AES3_SAMPLE_RATE;
use crate::core::{AudioBlock, AudioFrame, Result, SdiError, TimePoint};
use log::{debug, warn};
use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// 每次送入 sinc 重采样器的输入帧数
const CHUNK_FRAMES: usize = 1024;
/// 输入时间戳偏离预期超过该值时重新对齐
const DISCONTINUITY_MS: i64 = 10;

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// 交错多声道重采样器
///
/// 输入按声道缓存，凑够一个块才送进 rubato，滤波器状态跨块保留。
/// 开头的滤波器延迟被丢弃，`flush` 补齐尾部，输出总长度等于 输入 × 比率。
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    /// 采样率相同时为 None（直通）
    inner: Option<SincFixedIn<f32>>,
    /// 尚未送入重采样器的输入（按声道）
    pending: Vec<Vec<f32>>,
    /// 还要丢弃的延迟输出帧数
    skip: usize,
    input_frames: u64,
    output_frames: u64,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || channels == 0 {
            return Err(SdiError::Config(format!(
                "无效的重采样参数: {} Hz -> {} Hz, {} 声道",
                from_rate, to_rate, channels
            )));
        }
        let inner = if from_rate == to_rate {
            None
        } else {
            let ratio = to_rate as f64 / from_rate as f64;
            let r = SincFixedIn::<f32>::new(ratio, 1.0, sinc_parameters(), CHUNK_FRAMES, channels)
                .map_err(|e| SdiError::Config(format!("无法创建重采样器: {}", e)))?;
            Some(r)
        };
        let skip = inner.as_ref().map_or(0, |r| r.output_delay());
        Ok(Self {
            from_rate,
            to_rate,
            channels,
            inner,
            pending: vec![Vec::new(); channels],
            skip,
            input_frames: 0,
            output_frames: 0,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// 到目前为止的输入应当产生的输出帧数
    fn expected_output(&self) -> u64 {
        (self.input_frames * self.to_rate as u64 + self.from_rate as u64 / 2) / self.from_rate as u64
    }

    /// 把平面输出去掉延迟后追加为交错样本，最多追加到 `limit` 帧
    fn emit(&mut self, planar: &[Vec<f32>], limit: u64, out: &mut Vec<f32>) {
        let frames = planar.first().map_or(0, |c| c.len());
        let skipped = self.skip.min(frames);
        self.skip -= skipped;
        for i in skipped..frames {
            if self.output_frames >= limit {
                break;
            }
            out.extend(planar.iter().map(|c| c[i]));
            self.output_frames += 1;
        }
    }

    /// 处理一段交错输入，返回已经可以输出的交错样本
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let ch = self.channels;
        let frames = input.len() / ch;
        if self.inner.is_none() {
            return Ok(input[..frames * ch].to_vec());
        }

        for frame in input.chunks_exact(ch) {
            for (c, &v) in frame.iter().enumerate() {
                self.pending[c].push(v);
            }
        }
        self.input_frames += frames as u64;

        let mut out = Vec::new();
        loop {
            let Some(inner) = self.inner.as_mut() else { break };
            let needed = inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self.pending.iter_mut().map(|p| p.drain(..needed).collect()).collect();
            let planar = inner
                .process(&chunk, None)
                .map_err(|e| SdiError::DecodeError(format!("重采样失败: {}", e)))?;
            self.emit(&planar, u64::MAX, &mut out);
        }
        Ok(out)
    }

    /// 输入结束：送出缓存的输入和滤波器尾部
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        if self.inner.is_none() {
            return Ok(out);
        }
        let target = self.expected_output();
        let rest: Vec<Vec<f32>> = self.pending.iter_mut().map(std::mem::take).collect();
        let mut first = true;
        // 每轮至少产生 CHUNK_FRAMES × 比率 帧，几轮之内就能覆盖延迟
        for _ in 0..8 {
            if self.output_frames >= target {
                break;
            }
            let Some(inner) = self.inner.as_mut() else { break };
            let planar = if first && !rest[0].is_empty() {
                inner.process_partial(Some(rest.as_slice()), None)
            } else {
                inner.process_partial(None::<&[Vec<f32>]>, None)
            }
            .map_err(|e| SdiError::DecodeError(format!("重采样失败: {}", e)))?;
            first = false;
            self.emit(&planar, target, &mut out);
        }
        Ok(out)
    }

    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
            self.skip = inner.output_delay();
        }
        self.pending.iter_mut().for_each(Vec::clear);
        self.input_frames = 0;
        self.output_frames = 0;
    }
}

/// 把 `src` 声道的交错样本映射到 `dst` 声道
///
/// 声道足够时按顺序复制（多余的目标声道静音）；5.1 -> 立体声按 ITU 系数缩混；
/// 其余情况把源声道 i 折叠到目标声道 i % dst 并取平均。
pub fn remap_channels(input: &[f32], src: usize, dst: usize) -> Vec<f32> {
    if src == 0 || dst == 0 {
        return Vec::new();
    }
    let frames = input.len() / src;
    if src == dst {
        return input[..frames * src].to_vec();
    }

    let mut out = vec![0.0f32; frames * dst];
    for (i, frame) in input.chunks_exact(src).enumerate() {
        let o = &mut out[i * dst..(i + 1) * dst];
        if src < dst {
            o[..src].copy_from_slice(frame);
        } else if src == 6 && dst == 2 {
            // FL FR C LFE SL SR
            const K: f32 = std::f32::consts::FRAC_1_SQRT_2;
            o[0] = frame[0] + K * frame[2] + K * frame[4];
            o[1] = frame[1] + K * frame[2] + K * frame[5];
        } else {
            let mut counts = vec![0u32; dst];
            for (c, s) in frame.iter().enumerate() {
                o[c % dst] += s;
                counts[c % dst] += 1;
            }
            for (v, n) in o.iter_mut().zip(counts) {
                *v /= n.max(1) as f32;
            }
        }
    }
    out
}

#[inline]
pub fn f32_to_s16(v: f32) -> i16 {
    (v.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// 一个映射的 PCM 转换状态
pub struct PcmConverter {
    out_channels: usize,
    src_rate: u32,
    src_channels: usize,
    resampler: Resampler,
    /// 重采样时下一个输出样本的时间戳
    next_pts: Option<TimePoint>,
    /// 下一帧输入的预期时间戳，用于检测不连续
    expected_input: Option<TimePoint>,
}

impl PcmConverter {
    pub fn new(src_rate: u32, src_channels: usize, out_channels: usize) -> Result<Self> {
        if src_rate != AES3_SAMPLE_RATE {
            debug!("音频重采样 {} Hz -> {} Hz", src_rate, AES3_SAMPLE_RATE);
        }
        Ok(Self {
            out_channels,
            src_rate,
            src_channels,
            resampler: Resampler::new(src_rate, AES3_SAMPLE_RATE, out_channels)?,
            next_pts: None,
            expected_input: None,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn block(&mut self, samples: &[f32], pts: TimePoint) -> Option<AudioBlock> {
        if samples.is_empty() {
            return None;
        }
        let samples: Vec<i16> = samples.iter().map(|&v| f32_to_s16(v).to_le()).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&samples);

        let mut data = Vec::new();
        if data.try_reserve_exact(bytes.len()).is_err() {
            warn!("音频块分配失败: {} 字节", bytes.len());
            return None;
        }
        data.extend_from_slice(bytes);
        let nb_samples = (samples.len() / self.out_channels) as u32;
        self.next_pts = Some(pts + TimePoint::from_samples(nb_samples as i64, AES3_SAMPLE_RATE));
        Some(AudioBlock {
            data,
            pts: Some(pts),
            nb_samples,
        })
    }

    /// 转换一帧解码音频；格式变化时重建内部状态
    ///
    /// 重采样的输出有一个块的延迟，时间戳从第一帧开始连续推算；输入时间戳跳变时重新对齐。
    pub fn convert(&mut self, frame: &AudioFrame) -> Option<AudioBlock> {
        let channels = frame.channels as usize;
        if channels == 0 || frame.sample_rate == 0 {
            return None;
        }
        if frame.sample_rate != self.src_rate || channels != self.src_channels {
            debug!(
                "音频格式变化: {} Hz / {} 声道 -> {} Hz / {} 声道",
                self.src_rate, self.src_channels, frame.sample_rate, channels
            );
            match PcmConverter::new(frame.sample_rate, channels, self.out_channels) {
                Ok(c) => *self = c,
                Err(e) => {
                    warn!("无法重建音频转换: {}", e);
                    return None;
                }
            }
        }

        let mapped = remap_channels(&frame.data, channels, self.out_channels);
        let frames = (mapped.len() / self.out_channels) as i64;
        if self.resampler.is_passthrough() {
            return self.block(&mapped, frame.pts);
        }

        let discontinuity = self
            .expected_input
            .is_some_and(|t| (frame.pts - t).abs() > TimePoint::from_millis(DISCONTINUITY_MS));
        if discontinuity {
            debug!("音频时间戳跳变到 {}，重新对齐", frame.pts);
            self.resampler.reset();
            self.next_pts = None;
        }
        self.expected_input = Some(frame.pts + TimePoint::from_samples(frames, self.src_rate));
        let pts = *self.next_pts.get_or_insert(frame.pts);

        match self.resampler.process(&mapped) {
            Ok(out) => self.block(&out, pts),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// 流结束：取出重采样器里剩余的样本
    pub fn flush(&mut self) -> Option<AudioBlock> {
        let pts = self.next_pts?;
        match self.resampler.flush() {
            Ok(out) => self.block(&out, pts),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
        self.next_pts = None;
        self.expected_input = None;
    }
}
