use crate::core::{AudioFormat, PlaybackClock, PlayerConfig, Result};
use log::debug;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// 音频输出：同步器写入 PCM 字节并查询已播放位置
///
/// 实现内部自行加锁，所有方法可在任意线程调用。
pub trait AudioSink: Send + Sync {
    fn format(&self) -> AudioFormat;

    /// 写入 PCM 数据，返回实际写入的字节数（按采样帧对齐）
    fn write(&self, data: &[u8]) -> usize;

    /// 环形缓冲区剩余空间（字节）
    fn free_bytes(&self) -> usize;

    /// 尚未播放的字节数
    fn buffered_bytes(&self) -> usize;

    fn start(&self) -> Result<()>;

    fn pause(&self);

    /// 停止播放并丢弃缓冲数据
    fn stop(&self);

    /// 丢弃缓冲数据
    fn clear(&self);

    /// 设置起点，已播放字节数归零
    fn set_start_point(&self, secs: f64);

    fn set_volume(&self, volume: f64);

    fn set_speed(&self, speed: f64);

    /// 当前播放位置（秒）：起点加上（倒放时减去）已播放数据的时长
    fn processed_secs(&self, backward: bool) -> f64;
}

/// 按播放速度确定的环形缓冲区容量
pub fn ring_capacity(format: &AudioFormat, min_bytes: usize, speed: f64) -> usize {
    format.align_down(format.suggested_ring_buffer(speed).max(min_bytes))
}

struct SinkState {
    producer: HeapProd<u8>,
    consumer: HeapCons<u8>,
    clock: PlaybackClock,
    last_clock: f64,
    carry: f64,
    consumed: usize,
    start_point: f64,
    volume: f64,
    speed: f64,
    running: bool,
}

impl SinkState {
    /// 按媒体时钟推进消费位置；缓冲区耗尽时位置停止前进
    fn update(&mut self, format: &AudioFormat) {
        let now = self.clock.now();
        let elapsed = (now - self.last_clock).max(0.0);
        self.last_clock = now;
        if !self.running {
            return;
        }

        let due = elapsed * format.bytes_per_second() as f64 + self.carry;
        let whole = format.align_down(due as usize);
        self.carry = due - whole as f64;

        let played = self.consumer.skip(whole.min(self.consumer.occupied_len()));
        self.consumed += played;
        if self.consumer.occupied_len() == 0 {
            self.carry = 0.0;
        }
    }

    fn resize(&mut self, capacity: usize) {
        let mut pending = vec![0u8; self.consumer.occupied_len()];
        let len = self.consumer.pop_slice(&mut pending);
        let (mut producer, consumer) = HeapRb::<u8>::new(capacity.max(len).max(1)).split();
        producer.push_slice(&pending[..len]);
        self.producer = producer;
        self.consumer = consumer;
    }
}

/// 虚拟音频输出：不接设备，按实时速率 × 播放速度消费环形缓冲区
///
/// 用于无头运行和测试，也作为没有音频设备时的回退。
pub struct VirtualSink {
    format: AudioFormat,
    min_capacity: usize,
    state: Mutex<SinkState>,
}

impl VirtualSink {
    pub fn new(format: AudioFormat, min_capacity: usize) -> Self {
        let capacity = ring_capacity(&format, min_capacity, 1.0);
        let (producer, consumer) = HeapRb::<u8>::new(capacity.max(1)).split();
        debug!("虚拟音频输出: {:?}，缓冲区 {} 字节", format, capacity);
        Self {
            format,
            min_capacity,
            state: Mutex::new(SinkState {
                producer,
                consumer,
                clock: PlaybackClock::new(),
                last_clock: 0.0,
                carry: 0.0,
                consumed: 0,
                start_point: 0.0,
                volume: 1.0,
                speed: 1.0,
                running: false,
            }),
        }
    }

    /// 缓冲区至少容纳两个最大音频帧
    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(config.output_format, 2 * config.max_audio_frame_bytes)
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().producer.capacity().get()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn volume(&self) -> f64 {
        self.state.lock().volume
    }
}

impl AudioSink for VirtualSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock();
        state.update(&self.format);
        let len = self
            .format
            .align_down(data.len().min(state.producer.vacant_len()));
        if len == 0 {
            return 0;
        }
        if (state.volume - 1.0).abs() < f64::EPSILON {
            state.producer.push_slice(&data[..len])
        } else {
            let mut scaled = data[..len].to_vec();
            self.format.sample_kind.scale_volume(&mut scaled, state.volume);
            state.producer.push_slice(&scaled)
        }
    }

    fn free_bytes(&self) -> usize {
        let mut state = self.state.lock();
        state.update(&self.format);
        state.producer.vacant_len()
    }

    fn buffered_bytes(&self) -> usize {
        let mut state = self.state.lock();
        state.update(&self.format);
        state.consumer.occupied_len()
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.update(&self.format);
        state.running = true;
        state.clock.play();
        Ok(())
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        state.update(&self.format);
        state.running = false;
        state.clock.pause();
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.update(&self.format);
        state.running = false;
        state.clock.pause();
        let pending = state.consumer.occupied_len();
        state.consumer.skip(pending);
        state.consumed = 0;
        state.carry = 0.0;
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.update(&self.format);
        let pending = state.consumer.occupied_len();
        state.consumer.skip(pending);
        state.carry = 0.0;
    }

    fn set_start_point(&self, secs: f64) {
        let mut state = self.state.lock();
        state.update(&self.format);
        state.start_point = secs;
        state.consumed = 0;
    }

    fn set_volume(&self, volume: f64) {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    fn set_speed(&self, speed: f64) {
        let mut state = self.state.lock();
        state.update(&self.format);
        state.speed = speed.max(0.0);
        state.clock.set_rate(state.speed);

        let wanted = ring_capacity(&self.format, self.min_capacity, state.speed);
        if wanted > state.producer.capacity().get() {
            debug!("🔧 播放速度 {}，环形缓冲区扩容到 {} 字节", state.speed, wanted);
            state.resize(wanted);
        }
    }

    fn processed_secs(&self, backward: bool) -> f64 {
        let mut state = self.state.lock();
        state.update(&self.format);
        let played = self.format.duration_of_bytes(state.consumed);
        if backward {
            state.start_point - played
        } else {
            state.start_point + played
        }
    }
}
