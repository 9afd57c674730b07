use crate::core::{AudioFormat, PlayerConfig, PlayerError, Result, SampleKind};
use crate::player::audio_sink::{ring_capacity, AudioSink};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;

/// 设备不支持请求的格式时依次尝试的配置（采样率, 声道）
const FALLBACK_CONFIGS: [(u32, u16); 6] = [
    (48000, 2), // 最常见
    (44100, 2), // CD 音质
    (48000, 1),
    (44100, 1),
    (22050, 1),
    (22050, 2),
];

struct StreamHandle(Stream);

// cpal::Stream 在部分平台上不是 Send；它只在持有 `stream` 锁时被创建、控制和释放
unsafe impl Send for StreamHandle {}

struct CpalState {
    producer: HeapProd<u8>,
    consumer: HeapCons<u8>,
    /// 当前输出的源采样帧
    current: Vec<f32>,
    /// 变速时累计的源帧推进量
    phase: f64,
    consumed: usize,
    start_point: f64,
    volume: f32,
    speed: f64,
    running: bool,
}

impl CpalState {
    /// 从环形缓冲区取出一个采样帧；不足一帧时返回 false
    fn pop_frame(&mut self, frame_bytes: usize) -> bool {
        if self.consumer.occupied_len() < frame_bytes {
            return false;
        }
        let mut raw = vec![0u8; frame_bytes];
        self.consumer.pop_slice(&mut raw);
        self.consumed += frame_bytes;
        self.current.clear();
        self.current.extend(
            raw.chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        );
        true
    }

    /// 按播放速度就近取样填充一个输出帧，缓冲区耗尽时输出静音
    fn fill(&mut self, out: &mut [f32], frame_bytes: usize) {
        if !self.running {
            out.fill(0.0);
            return;
        }
        self.phase += self.speed;
        while self.phase >= 1.0 {
            if !self.pop_frame(frame_bytes) {
                self.phase = 0.0;
                out.fill(0.0);
                return;
            }
            self.phase -= 1.0;
        }
        for (sample, value) in out.iter_mut().zip(self.current.iter()) {
            *sample = value * self.volume;
        }
    }
}

/// 音频设备输出 - 使用 cpal 播放环形缓冲区中的 f32 PCM
pub struct CpalSink {
    device: Device,
    config: StreamConfig,
    format: AudioFormat,
    min_capacity: usize,
    state: Arc<Mutex<CpalState>>,
    stream: Mutex<Option<StreamHandle>>,
}

impl CpalSink {
    /// 打开默认输出设备（支持非标准配置自动回退）
    pub fn new(config: &PlayerConfig) -> Result<Self> {
        let wanted = config.output_format;
        info!("初始化音频输出: {} Hz, {} 声道", wanted.sample_rate, wanted.channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let stream_config = Self::choose_config(&device, wanted.sample_rate, wanted.channels)?;
        let format = AudioFormat::new(
            SampleKind::F32,
            stream_config.sample_rate.0,
            stream_config.channels,
        );

        let min_capacity = 2 * config.max_audio_frame_bytes;
        let capacity = ring_capacity(&format, min_capacity, 1.0);
        let (producer, consumer) = HeapRb::<u8>::new(capacity.max(1)).split();

        Ok(Self {
            device,
            config: stream_config,
            format,
            min_capacity,
            state: Arc::new(Mutex::new(CpalState {
                producer,
                consumer,
                current: vec![0.0; format.channels as usize],
                phase: 0.0,
                consumed: 0,
                start_point: 0.0,
                volume: 1.0,
                speed: 1.0,
                running: false,
            })),
            stream: Mutex::new(None),
        })
    }

    fn choose_config(device: &Device, sample_rate: u32, channels: u16) -> Result<StreamConfig> {
        let make = |rate: u32, channels: u16| StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let requested = make(sample_rate, channels);
        if Self::is_supported(device, &requested)? {
            return Ok(requested);
        }

        warn!("⚠️  音频设备不支持 {} Hz, {} 声道配置，回退到标准配置", sample_rate, channels);
        for (rate, fb_channels) in FALLBACK_CONFIGS {
            let candidate = make(rate, fb_channels);
            if Self::is_supported(device, &candidate)? {
                info!("✅ 使用回退配置: {} Hz, {} 声道", rate, fb_channels);
                return Ok(candidate);
            }
        }

        Err(PlayerError::AudioError(format!(
            "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
            sample_rate, channels
        )))
    }

    fn is_supported(device: &Device, config: &StreamConfig) -> Result<bool> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
        Ok(supported.any(|range| Self::is_config_compatible(config, &range)))
    }

    /// 检查配置是否兼容
    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range && config.channels == supported.channels()
    }

    fn build_stream(&self) -> Result<Stream> {
        let state = self.state.clone();
        let channels = self.format.channels as usize;
        let frame_bytes = self.format.bytes_per_frame();

        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut state = state.lock();
                    for out in data.chunks_mut(channels) {
                        state.fill(out, frame_bytes);
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))
    }
}

impl AudioSink for CpalSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock();
        let len = self
            .format
            .align_down(data.len().min(state.producer.vacant_len()));
        state.producer.push_slice(&data[..len])
    }

    fn free_bytes(&self) -> usize {
        self.state.lock().producer.vacant_len()
    }

    fn buffered_bytes(&self) -> usize {
        self.state.lock().consumer.occupied_len()
    }

    /// 开始播放（首次调用时创建设备流）
    fn start(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.is_none() {
            *stream = Some(StreamHandle(self.build_stream()?));
        }
        if let Some(handle) = stream.as_ref() {
            handle
                .0
                .play()
                .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;
        }
        self.state.lock().running = true;
        info!("音频输出已启动");
        Ok(())
    }

    fn pause(&self) {
        self.state.lock().running = false;
        if let Some(handle) = self.stream.lock().as_ref() {
            if let Err(e) = handle.0.pause() {
                warn!("⚠️ 暂停音频流失败: {}", e);
            }
        }
    }

    /// 释放设备流并丢弃缓冲数据
    fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.running = false;
            let pending = state.consumer.occupied_len();
            state.consumer.skip(pending);
            state.consumed = 0;
            state.phase = 0.0;
        }
        if self.stream.lock().take().is_some() {
            info!("音频输出已停止");
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        let pending = state.consumer.occupied_len();
        state.consumer.skip(pending);
        state.phase = 0.0;
    }

    fn set_start_point(&self, secs: f64) {
        let mut state = self.state.lock();
        state.start_point = secs;
        state.consumed = 0;
    }

    fn set_volume(&self, volume: f64) {
        self.state.lock().volume = volume.clamp(0.0, 1.0) as f32;
    }

    fn set_speed(&self, speed: f64) {
        let mut state = self.state.lock();
        state.speed = speed.max(0.0);

        let wanted = ring_capacity(&self.format, self.min_capacity, state.speed);
        if wanted > state.producer.capacity().get() {
            debug!("🔧 播放速度 {}，环形缓冲区扩容到 {} 字节", state.speed, wanted);
            let mut pending = vec![0u8; state.consumer.occupied_len()];
            let len = state.consumer.pop_slice(&mut pending);
            let (mut producer, consumer) = HeapRb::<u8>::new(wanted.max(len)).split();
            producer.push_slice(&pending[..len]);
            state.producer = producer;
            state.consumer = consumer;
        }
    }

    fn processed_secs(&self, backward: bool) -> f64 {
        let state = self.state.lock();
        let played = self.format.duration_of_bytes(state.consumed);
        if backward {
            state.start_point - played
        } else {
            state.start_point + played
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(frames: &[f32], speed: f64) -> CpalState {
        let (mut producer, consumer) = HeapRb::<u8>::new(1024).split();
        for v in frames {
            producer.push_slice(&v.to_ne_bytes());
        }
        CpalState {
            producer,
            consumer,
            current: vec![0.0],
            phase: 0.0,
            consumed: 0,
            start_point: 0.0,
            volume: 1.0,
            speed,
            running: true,
        }
    }

    fn render(state: &mut CpalState, count: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; count];
        for sample in out.chunks_mut(1) {
            state.fill(sample, 4);
        }
        out
    }

    #[test]
    fn test_double_speed_takes_every_second_frame() {
        let mut state = state(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2.0);
        assert_eq!(render(&mut state, 3), vec![2.0, 4.0, 6.0]);
        assert_eq!(state.consumed, 24);
    }

    #[test]
    fn test_half_speed_repeats_frames() {
        let mut state = state(&[1.0, 2.0], 0.5);
        assert_eq!(render(&mut state, 4), vec![0.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_underrun_outputs_silence_with_volume() {
        let mut state = state(&[0.5], 1.0);
        state.volume = 0.5;
        assert_eq!(render(&mut state, 2), vec![0.25, 0.0]);
    }
}
