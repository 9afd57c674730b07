use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 媒体时钟 - 按播放速率推进的时间基准（秒）
///
/// 虚拟音频输出用它计算已消耗的数据量；没有音轨时，同步器用它代替音频时钟。
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_secs: f64,         // 基准位置（秒）
    base_instant: Instant,  // 基准时刻
    playback_rate: f64,     // 播放速率（1.0 = 正常）
    backward: bool,         // 倒放时时间递减
    paused: bool,
    paused_at: f64,         // 暂停时的位置
}

impl ClockInner {
    fn now(&self) -> f64 {
        if self.paused {
            self.paused_at
        } else {
            let elapsed = self.base_instant.elapsed().as_secs_f64() * self.playback_rate;
            if self.backward {
                self.base_secs - elapsed
            } else {
                self.base_secs + elapsed
            }
        }
    }

    fn rebase(&mut self) {
        let current = self.now();
        self.base_secs = current;
        self.base_instant = Instant::now();
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_secs: 0.0,
                base_instant: Instant::now(),
                playback_rate: 1.0,
                backward: false,
                paused: true,
                paused_at: 0.0,
            })),
        }
    }

    /// 获取当前播放时间（秒）
    pub fn now(&self) -> f64 {
        self.inner.lock().now()
    }

    /// 设置播放位置
    pub fn set_time(&self, secs: f64) {
        let mut inner = self.inner.lock();
        inner.base_secs = secs;
        inner.base_instant = Instant::now();
        inner.paused_at = secs;
    }

    /// 开始计时
    pub fn play(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            inner.base_secs = inner.paused_at;
            inner.base_instant = Instant::now();
            inner.paused = false;
        }
    }

    /// 暂停计时
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.paused_at = inner.now();
            inner.paused = true;
        }
    }

    /// 设置播放速率
    pub fn set_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.rebase();
        }
        inner.playback_rate = rate.max(0.0);
    }

    /// 设置时间推进方向
    pub fn set_backward(&self, backward: bool) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.rebase();
        }
        inner.backward = backward;
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().playback_rate
    }

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}
