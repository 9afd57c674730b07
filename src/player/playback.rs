//! 音画同步播放循环
//!
//! 在专用播放线程上取视频帧交给渲染端、补充音频输出缓冲区，并按参考时钟
//! （有音轨时为音频输出的已播放位置，否则为内部媒体时钟）睡眠到下一帧的显示时刻。

use crate::core::{PlaybackClock, PlaybackState, PlayerConfig, Result, VideoFrame};
use crate::player::audio_sink::AudioSink;
use crate::player::demuxer::Demuxer;
use crate::player::log_ctx;
use crate::player::worker_thread::WorkerThread;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 渲染端：接收要显示的画面，帧的所有权随调用转移
pub trait VideoSink: Send + Sync {
    fn set_video_frame(&self, frame: VideoFrame);
}

/// 播放循环发出的通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// 没有更多可播放的数据
    ResourcesEnd,
    StateChanged(PlaybackState),
}

/// 播放过程中由循环线程执行的控制请求
#[derive(Debug, Clone, Copy)]
enum Request {
    Volume(f64),
    Speed(f64),
}

/// 一批音频写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioFeed {
    Fed,
    Ended,
    Interrupted,
}

struct Shared {
    demuxer: Arc<Demuxer>,
    sink: Arc<dyn AudioSink>,
    video_sink: Arc<dyn VideoSink>,
    config: PlayerConfig,
    interrupt: AtomicBool,
    playing: AtomicBool,
    /// 循环运行期间持有，保证 clear / 请求处理不与写入交错
    work_lock: Mutex<()>,
    sleep_lock: Mutex<()>,
    wake: Condvar,
    speed: Mutex<f64>,
    clock: PlaybackClock,
    events: Sender<PlaybackEvent>,
    requests_tx: Sender<Request>,
    requests_rx: Receiver<Request>,
}

/// 音画同步器
pub struct Playback {
    shared: Arc<Shared>,
    events: Receiver<PlaybackEvent>,
    worker: WorkerThread,
}

impl Playback {
    pub fn new(
        demuxer: Arc<Demuxer>,
        sink: Arc<dyn AudioSink>,
        video_sink: Arc<dyn VideoSink>,
    ) -> Result<Self> {
        let config = demuxer.config().clone();
        let (events_tx, events_rx) = unbounded();
        let (requests_tx, requests_rx) = unbounded();
        let worker = WorkerThread::start("playback")?;

        Ok(Self {
            shared: Arc::new(Shared {
                demuxer,
                sink,
                video_sink,
                config,
                interrupt: AtomicBool::new(true),
                playing: AtomicBool::new(false),
                work_lock: Mutex::new(()),
                sleep_lock: Mutex::new(()),
                wake: Condvar::new(),
                speed: Mutex::new(1.0),
                clock: PlaybackClock::new(),
                events: events_tx,
                requests_tx,
                requests_rx,
            }),
            events: events_rx,
            worker,
        })
    }

    /// 事件流（ResourcesEnd、状态变化）
    pub fn events(&self) -> Receiver<PlaybackEvent> {
        self.events.clone()
    }

    /// 开始播放循环（非阻塞）
    pub fn start(&self) {
        if !self.shared.demuxer.is_file_open() {
            warn!("⚠️ 播放: 没有打开的文件");
            return;
        }
        if self.shared.playing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.interrupt.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        if let Err(e) = self.worker.post(move || shared.on_work()) {
            error!("❌ 提交播放任务失败: {}", e);
            self.shared.playing.store(false, Ordering::SeqCst);
        }
    }

    /// 暂停播放，返回时播放循环已经退出
    pub fn pause(&self) {
        self.shared.interrupt.store(true, Ordering::SeqCst);
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wake.notify_all();
        }
        if let Err(e) = self.worker.call(|| ()) {
            warn!("⚠️ 等待播放线程失败: {}", e);
        }
    }

    /// 停止：暂停后丢弃缓冲的音频并把起点归零
    pub fn stop(&self) {
        self.pause();
        self.shared.sink.stop();
        self.set_start_point(0.0);
        self.clear();
        info!("{} ⏹ 播放已停止", log_ctx());
    }

    /// 丢弃音频输出缓冲区，等待正在进行的写入完成
    pub fn clear(&self) {
        let _guard = self.shared.work_lock.lock();
        self.shared.sink.clear();
    }

    /// 设置播放起点（seek 或切换方向后调用）
    pub fn set_start_point(&self, secs: f64) {
        self.shared.sink.set_start_point(secs);
        self.shared.clock.set_time(secs);
        debug!("播放起点: {:.3}s", secs);
    }

    pub fn set_volume(&self, volume: f64) {
        self.request(Request::Volume(volume));
    }

    pub fn set_speed(&self, speed: f64) {
        if !(speed.is_finite() && speed > 0.0) {
            warn!("⚠️ 忽略无效的播放速度: {}", speed);
            return;
        }
        self.request(Request::Speed(speed));
    }

    /// 请求交给播放循环处理；循环空闲时立即执行
    fn request(&self, request: Request) {
        if self.shared.requests_tx.send(request).is_err() {
            return;
        }
        if let Some(_guard) = self.shared.work_lock.try_lock() {
            self.shared.process_requests();
        }
    }

    /// 当前播放位置（秒）
    pub fn position(&self) -> f64 {
        self.shared.reference_time(self.shared.demuxer.is_backward())
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn speed(&self) -> f64 {
        *self.shared.speed.lock()
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.pause();
        self.worker.stop();
    }
}

impl Shared {
    fn on_work(&self) {
        let _work = match self.work_lock.try_lock() {
            Some(guard) => guard,
            None => {
                warn!("⚠️ 播放循环已在运行");
                return;
            }
        };
        if self.interrupt.load(Ordering::SeqCst) {
            self.playing.store(false, Ordering::SeqCst);
            return;
        }

        info!("{} ▶ 播放循环开始", log_ctx());
        self.emit(PlaybackEvent::StateChanged(PlaybackState::Playing));
        self.process_requests();

        let backward = self.demuxer.is_backward();
        let has_video = self.demuxer.has_video();
        let has_audio = self.demuxer.has_audio();
        self.clock.set_backward(backward);

        let mut audio_ended = !has_audio;
        if !audio_ended && self.write_audio(self.config.prefill_audio_batch) == AudioFeed::Ended {
            audio_ended = true;
        }
        if let Err(e) = self.sink.start() {
            error!("❌ 启动音频输出失败: {}", e);
        }
        if !has_audio {
            self.clock.play();
        }

        let mut shown: usize = 0;
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                break;
            }

            let frame = match self.demuxer.wait_picture(&self.interrupt) {
                Some(frame) => frame,
                None => {
                    if !self.interrupt.load(Ordering::SeqCst) {
                        info!("📄 视频播放完毕（显示 {} 帧）", shown);
                        self.emit(PlaybackEvent::ResourcesEnd);
                    }
                    break;
                }
            };
            if !frame.is_placeholder() {
                self.video_sink.set_video_frame(frame);
                shown += 1;
            }

            if !audio_ended {
                match self.write_audio(self.config.audio_batch) {
                    AudioFeed::Ended => {
                        debug!("音频流结束");
                        audio_ended = true;
                    }
                    AudioFeed::Interrupted => break,
                    AudioFeed::Fed => {}
                }
            }
            // 音频流结束且已写入的数据播放完毕，即使还有视频也结束
            if has_audio && audio_ended && self.sink.buffered_bytes() == 0 {
                info!("📄 音频播放完毕（显示 {} 帧）", shown);
                self.emit(PlaybackEvent::ResourcesEnd);
                break;
            }

            let next = match self.demuxer.wait_front_picture(&self.interrupt) {
                Some(pts) => pts,
                None if self.interrupt.load(Ordering::SeqCst) => break,
                // 没有下一帧，下一轮取帧时报告结束
                None => continue,
            };

            self.process_requests();
            self.sync_to(next, backward);
        }

        self.sink.pause();
        self.clock.pause();
        self.process_requests();
        self.playing.store(false, Ordering::SeqCst);
        self.emit(PlaybackEvent::StateChanged(PlaybackState::Paused));
        info!("{} ⏸ 播放循环退出", log_ctx());
    }

    /// 写入最多 `batch` 个音频帧，输出缓冲区剩余空间不足一个最大帧时停止
    fn write_audio(&self, batch: usize) -> AudioFeed {
        for _ in 0..batch {
            if self.sink.free_bytes() <= self.config.max_audio_frame_bytes {
                return AudioFeed::Fed;
            }
            let frame = match self.demuxer.wait_sample(&self.interrupt) {
                Some(frame) => frame,
                None if self.interrupt.load(Ordering::SeqCst) => return AudioFeed::Interrupted,
                None => return AudioFeed::Ended,
            };
            let written = self.sink.write(&frame.data);
            if written < frame.len() {
                warn!(
                    "⚠️ 音频输出缓冲区不足，丢弃 {} 字节（pts {:.3}）",
                    frame.len() - written,
                    frame.pts
                );
            }
        }
        AudioFeed::Fed
    }

    fn reference_time(&self, backward: bool) -> f64 {
        if !self.demuxer.has_audio() {
            self.clock.now()
        } else {
            self.sink.processed_secs(backward)
        }
    }

    /// 睡眠到 `next` 帧的显示时刻；占位帧按固定帧率
    fn sync_to(&self, next: f64, backward: bool) {
        let speed = *self.speed.lock();
        let wait = if next.is_nan() {
            1.0 / self.config.placeholder_fps
        } else {
            let reference = self.reference_time(backward);
            let diff = if backward { reference - next } else { next - reference };
            diff / speed
        };

        if !wait.is_finite() || wait <= 0.0 {
            return;
        }
        if wait > self.config.long_sleep_warn_secs {
            warn!("⚠️ 同步等待 {:.3}s（下一帧 {:.3}s）", wait, next);
        }

        let mut guard = self.sleep_lock.lock();
        if self.interrupt.load(Ordering::SeqCst) {
            return;
        }
        self.wake.wait_for(&mut guard, Duration::from_secs_f64(wait));
    }

    fn process_requests(&self) {
        while let Ok(request) = self.requests_rx.try_recv() {
            match request {
                Request::Volume(volume) => {
                    self.sink.set_volume(volume);
                    debug!("🔊 音量: {:.2}", volume);
                }
                Request::Speed(speed) => {
                    self.sink.set_speed(speed);
                    self.clock.set_rate(speed);
                    *self.speed.lock() = speed;
                    info!("⏩ 播放速度: {}", speed);
                }
            }
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        // 接收端可能已经不存在
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OpenFileResult;
    use crate::player::audio_sink::VirtualSink;
    use crate::player::test_pattern::TestPatternOpener;
    use std::time::Instant;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<f64>>,
    }

    impl VideoSink for CollectingSink {
        fn set_video_frame(&self, frame: VideoFrame) {
            self.frames.lock().push(frame.pts);
        }
    }

    struct Fixture {
        demuxer: Arc<Demuxer>,
        sink: Arc<VirtualSink>,
        video: Arc<CollectingSink>,
        playback: Playback,
    }

    fn fixture(path: &str) -> Fixture {
        let config = PlayerConfig::default();
        let demuxer =
            Arc::new(Demuxer::new(config.clone(), Arc::new(TestPatternOpener)).unwrap());
        assert_eq!(demuxer.open_file(path), OpenFileResult::Success);
        let sink = Arc::new(VirtualSink::from_config(&config));
        let video = Arc::new(CollectingSink::default());
        let playback = Playback::new(demuxer.clone(), sink.clone(), video.clone()).unwrap();
        Fixture {
            demuxer,
            sink,
            video,
            playback,
        }
    }

    fn wait_for_end(events: &Receiver<PlaybackEvent>) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(PlaybackEvent::ResourcesEnd) => return true,
                Ok(_) | Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_plays_to_end_in_order() {
        let f = fixture("testsrc?duration=0.5");
        let events = f.playback.events();
        f.demuxer.seek(0.0).unwrap();
        f.demuxer.start();
        f.playback.start();

        assert!(wait_for_end(&events));
        f.playback.pause();
        f.demuxer.pause();

        let frames = f.video.frames.lock().clone();
        assert_eq!(frames.len(), 15);
        assert!(frames.windows(2).all(|w| w[0] < w[1]));
        assert!(!f.playback.is_playing());
    }

    #[test]
    fn test_audio_only_file_ends() {
        let f = fixture("testsrc?duration=0.3&video=0");
        let events = f.playback.events();
        f.demuxer.seek(0.0).unwrap();
        f.demuxer.start();
        f.playback.start();

        assert!(wait_for_end(&events));
        f.playback.pause();
        assert!(f.video.frames.lock().is_empty());
        assert!(f.playback.position() >= 0.25);
    }

    #[test]
    fn test_pause_leaves_loop_idle_before_clear() {
        let f = fixture("testsrc?duration=5");
        f.demuxer.seek(0.0).unwrap();
        f.demuxer.start();
        f.playback.start();
        std::thread::sleep(Duration::from_millis(100));

        f.playback.pause();
        assert!(!f.playback.is_playing());
        assert!(!f.sink.is_running());
        f.playback.clear();
        assert_eq!(f.sink.buffered_bytes(), 0);

        let shown = f.video.frames.lock().len();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(f.video.frames.lock().len(), shown);
        f.demuxer.pause();
    }

    #[test]
    fn test_requests_apply_while_idle() {
        let f = fixture("testsrc");
        f.playback.set_speed(2.0);
        f.playback.set_volume(0.25);
        f.playback.set_speed(-1.0);
        assert_eq!(f.playback.speed(), 2.0);
        assert_eq!(f.sink.volume(), 0.25);
    }

    #[test]
    fn test_stop_resets_start_point() {
        let f = fixture("testsrc");
        f.playback.set_start_point(4.0);
        assert_eq!(f.playback.position(), 4.0);
        f.playback.stop();
        assert_eq!(f.playback.position(), 0.0);
    }

    #[test]
    fn test_audio_end_finishes_playback_before_video() {
        let f = fixture("testsrc?duration=3&audio_duration=0.3");
        let events = f.playback.events();
        f.demuxer.seek(0.0).unwrap();
        f.demuxer.start();
        let started = Instant::now();
        f.playback.start();

        assert!(wait_for_end(&events));
        f.playback.pause();
        f.demuxer.pause();
        assert!(started.elapsed() < Duration::from_secs(2));

        let frames = f.video.frames.lock().clone();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|pts| *pts < 0.6), "frames = {:?}", frames);
        assert!(f.playback.position() >= 0.25);
    }
}
