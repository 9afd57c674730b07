use crate::core::{
    AudioFormat, AudioFrame, Direction, MediaInfo, OpenFileResult, PlayerConfig, PlayerError,
    Result, TrackInfo, VideoFrame,
};
use crate::illegal_state;
use crate::player::dispatcher::{Dispatcher, ForwardDispatcher, StepResult};
use crate::player::frame_queue::FrameQueue;
use crate::player::log_ctx;
use crate::player::reverse::ReverseDispatcher;
use crate::player::source::MediaOpener;
use crate::player::worker_thread::WorkerThread;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 一个已打开文件的全部解码状态
///
/// 正放和倒放分发器同时创建、同时销毁，`active` 标记当前使用哪一个。
struct Session {
    filename: String,
    info: MediaInfo,
    forward: ForwardDispatcher,
    backward: ReverseDispatcher,
    active: Direction,
}

impl Session {
    fn active(&self) -> &dyn Dispatcher {
        match self.active {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    fn active_mut(&mut self) -> &mut dyn Dispatcher {
        match self.active {
            Direction::Forward => &mut self.forward,
            Direction::Backward => &mut self.backward,
        }
    }

    fn dispatcher_mut(&mut self, direction: Direction) -> &mut dyn Dispatcher {
        match direction {
            Direction::Forward => &mut self.forward,
            Direction::Backward => &mut self.backward,
        }
    }

    fn queues(&self) -> (Arc<FrameQueue<VideoFrame>>, Arc<FrameQueue<AudioFrame>>) {
        let active = self.active();
        (active.video_queue().clone(), active.audio_queue().clone())
    }
}

/// 视频帧来源
enum Pictures {
    Closed,
    /// 没有视频轨，返回占位帧
    NoVideo,
    Queue(Arc<FrameQueue<VideoFrame>>),
}

/// 解封装门面：持有当前文件的正放 / 倒放分发器，对外提供统一的取帧和控制接口
///
/// 所有操作先获取同一把协调锁再委托给活动分发器。解码循环运行在专用解码线程上，
/// 每处理一个数据包释放一次锁；阻塞取帧在锁外等待。
pub struct Demuxer {
    config: PlayerConfig,
    opener: Arc<dyn MediaOpener>,
    session: Arc<Mutex<Option<Session>>>,
    worker: WorkerThread,
    interrupt: Arc<AtomicBool>,
    working: Arc<AtomicBool>,
    output_format: Mutex<AudioFormat>,
}

impl Demuxer {
    pub fn new(config: PlayerConfig, opener: Arc<dyn MediaOpener>) -> Result<Self> {
        config.validate()?;
        let worker = WorkerThread::start("decoder")?;
        Ok(Self {
            output_format: Mutex::new(config.output_format),
            config,
            opener,
            session: Arc::new(Mutex::new(None)),
            worker,
            interrupt: Arc::new(AtomicBool::new(true)),
            working: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    // ========================================================================
    // 文件生命周期
    // ========================================================================

    /// 打开文件；已有文件打开或探测失败时返回对应结果，不会 panic
    pub fn open_file(&self, path: &str) -> OpenFileResult {
        let mut guard = self.session.lock();
        if let Some(session) = guard.as_ref() {
            warn!("⚠️ 已有文件打开: {}，请先关闭", session.filename);
            return OpenFileResult::AlreadyOpen;
        }

        match self.create_session(path) {
            Ok(session) => {
                info!(
                    "{} ✅ 文件已打开: {}（时长 {:.2}s，视频 {}，音频 {}）",
                    log_ctx(),
                    path,
                    session.info.duration,
                    session.info.video_codec,
                    session.info.audio_codec
                );
                *guard = Some(session);
                OpenFileResult::Success
            }
            Err(e) => {
                error!("❌ 打开文件失败 {}: {}", path, e);
                OpenFileResult::Failed
            }
        }
    }

    fn create_session(&self, path: &str) -> Result<Session> {
        let mut config = self.config.clone();
        config.output_format = *self.output_format.lock();

        // 正放和倒放各自读取一个数据源
        let forward = ForwardDispatcher::new(self.opener.open(path)?, &config)?;
        let backward = ReverseDispatcher::new(self.opener.open(path)?, &config)?;
        let info = MediaInfo::from_streams(forward.tracks().streams().to_vec());
        debug!("数据源: {}", forward.tracks().description());

        Ok(Session {
            filename: path.to_string(),
            info,
            forward,
            backward,
            active: Direction::Forward,
        })
    }

    /// 关闭文件；没有打开的文件时只记录日志
    pub fn close(&self) {
        if !self.is_file_open() {
            warn!("⚠️ close(): 没有打开的文件");
            return;
        }
        self.pause();

        let session = self.session.lock().take();
        if let Some(mut session) = session {
            // 禁用队列，唤醒阻塞在取帧上的消费者
            session.forward.flush();
            session.backward.flush();
            info!("{} ⏹ 文件已关闭: {}", log_ctx(), session.filename);
        }
    }

    pub fn is_file_open(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn filename(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.filename.clone())
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.session.lock().as_ref().map(|s| s.info.clone())
    }

    // ========================================================================
    // 解码循环控制
    // ========================================================================

    /// 请求在解码线程上开始解码（非阻塞）
    pub fn start(&self) {
        {
            let mut guard = self.session.lock();
            match guard.as_mut() {
                Some(session) => session.active_mut().resume(),
                None => {
                    warn!("⚠️ start(): 没有打开的文件");
                    return;
                }
            }
        }

        self.interrupt.store(false, Ordering::SeqCst);
        if self.working.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = self.session.clone();
        let interrupt = self.interrupt.clone();
        let working = self.working.clone();
        let poll = self.config.consumer_poll();
        if let Err(e) = self
            .worker
            .post(move || Self::decode_loop(&session, &interrupt, &working, poll))
        {
            error!("❌ 提交解码任务失败: {}", e);
            self.working.store(false, Ordering::SeqCst);
        }
    }

    /// 请求暂停解码，返回时解码循环已经退出
    pub fn pause(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some((video, audio)) = self.session.lock().as_ref().map(Session::queues) {
            video.wake_producers();
            audio.wake_producers();
        }
        // 解码线程按顺序执行任务，同步调用返回即说明解码循环已结束
        if let Err(e) = self.worker.call(|| ()) {
            warn!("⚠️ 等待解码线程失败: {}", e);
        }
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// 解码循环（在解码线程中运行）
    fn decode_loop(
        session: &Mutex<Option<Session>>,
        interrupt: &AtomicBool,
        working: &AtomicBool,
        poll: Duration,
    ) {
        info!("{} ▶ 解码循环开始", log_ctx());
        let mut steps: usize = 0;

        loop {
            if interrupt.load(Ordering::SeqCst) {
                break;
            }

            // 在锁外等待队列空间
            let (video, audio) = match session.lock().as_ref() {
                Some(s) => s.queues(),
                None => break,
            };
            if !Self::ready_for_step(&video, &audio) {
                if video.is_eof() {
                    audio.wait_space_for(poll);
                } else {
                    video.wait_space_for(poll);
                }
                continue;
            }

            let result = match session.lock().as_mut() {
                Some(s) => s.active_mut().step(),
                None => break,
            };
            steps += 1;
            if result == StepResult::Eof {
                info!("{} 📄 解码到达流末尾", log_ctx());
                break;
            }
        }

        working.store(false, Ordering::SeqCst);
        info!("{} ⏸ 解码循环退出（处理 {} 个数据包）", log_ctx(), steps);
    }

    /// 任意一条未结束的流低于容量上限即可继续解码（容量是软上限）
    fn ready_for_step(video: &FrameQueue<VideoFrame>, audio: &FrameQueue<AudioFrame>) -> bool {
        let video_open = !video.is_eof();
        let audio_open = !audio.is_eof();
        if !video_open && !audio_open {
            return true;
        }
        let video_room = video_open && video.is_enabled() && video.len() < video.capacity();
        let audio_room = audio_open && audio.is_enabled() && audio.len() < audio.capacity();
        video_room || audio_room
    }

    /// 清空活动分发器的队列和解码器缓存
    pub fn flush(&self) {
        if let Some(session) = self.session.lock().as_mut() {
            session.active_mut().flush();
        }
    }

    /// 定位；正放返回时每条流的下一帧都不早于目标，倒放从目标位置重新开始
    pub fn seek(&self, secs: f64) -> Result<()> {
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| PlayerError::IllegalState("seek(): 没有打开的文件".to_string()))?;
        session.active_mut().seek(secs)
    }

    // ========================================================================
    // 方向切换
    // ========================================================================

    /// 切换到正放，清空倒放分发器
    pub fn forward(&self) {
        self.switch_direction(Direction::Forward);
    }

    /// 切换到倒放，清空正放分发器
    ///
    /// 倒放起点需要随后通过 `seek` 交接当前位置。
    pub fn backward(&self) {
        self.switch_direction(Direction::Backward);
    }

    fn switch_direction(&self, target: Direction) {
        let mut guard = self.session.lock();
        let session = match guard.as_mut() {
            Some(session) => session,
            None => {
                warn!("⚠️ 切换方向: 没有打开的文件");
                return;
            }
        };
        if session.active == target {
            return;
        }
        session.dispatcher_mut(session.active).flush();
        session.active = target;
        session.active_mut().resume();
        info!("🔁 播放方向切换为 {:?}", target);
    }

    pub fn is_backward(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |s| s.active == Direction::Backward)
    }

    // ========================================================================
    // 流信息与音轨
    // ========================================================================

    pub fn has_video(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |s| s.active().tracks().has_video())
    }

    pub fn has_audio(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |s| s.active().tracks().has_audio())
    }

    pub fn video_duration(&self) -> f64 {
        self.session
            .lock()
            .as_ref()
            .map_or(0.0, |s| s.active().tracks().video_duration())
    }

    pub fn audio_duration(&self) -> f64 {
        self.session
            .lock()
            .as_ref()
            .map_or(0.0, |s| s.active().tracks().audio_duration())
    }

    pub fn get_tracks(&self) -> Vec<TrackInfo> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.active().tracks().track_infos())
            .unwrap_or_default()
    }

    pub fn audio_track(&self) -> Option<usize> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.active().tracks().audio_track())
    }

    /// 按音轨序号切换音轨，前置条件：解码已暂停
    ///
    /// 两个分发器要么都切换成功，要么都保持原音轨。
    pub fn set_track(&self, track: usize) -> Result<()> {
        if self.is_working() {
            return Err(illegal_state!("set_track({}): 解码循环仍在运行", track));
        }
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| PlayerError::IllegalState("set_track(): 没有打开的文件".to_string()))?;
        if session.forward.tracks().audio_stream(track).is_none() {
            return Err(PlayerError::StreamNotFound(track));
        }

        let previous = session.forward.tracks().audio_track();
        session.forward.set_audio_track(track)?;
        if let Err(e) = session.backward.set_audio_track(track) {
            error!("❌ 倒放分发器切换音轨 {} 失败: {}", track, e);
            if let Some(previous) = previous {
                if let Err(e) = session.forward.set_audio_track(previous) {
                    error!("❌ 恢复音轨 {} 失败: {}", previous, e);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// 按容器流索引切换音轨
    pub fn set_audio_index(&self, stream_index: usize) -> Result<()> {
        let track = self
            .get_tracks()
            .iter()
            .find(|t| t.stream_index == stream_index)
            .map(|t| t.track)
            .ok_or(PlayerError::StreamNotFound(stream_index))?;
        self.set_track(track)
    }

    /// 当前音轨的原始格式
    pub fn input_format(&self) -> Option<AudioFormat> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.active().tracks().input_format())
    }

    pub fn output_format(&self) -> AudioFormat {
        *self.output_format.lock()
    }

    /// 切换音频输出格式，前置条件：解码已暂停且队列为空
    pub fn set_output_format(&self, format: AudioFormat) -> Result<()> {
        if self.is_working() {
            return Err(illegal_state!("set_output_format(): 解码循环仍在运行"));
        }
        if let Some(session) = self.session.lock().as_mut() {
            session.forward.set_output_format(&format)?;
            session.backward.set_output_format(&format)?;
        }
        *self.output_format.lock() = format;
        debug!("🔧 音频输出格式: {:?}", format);
        Ok(())
    }

    // ========================================================================
    // 取帧（任意线程）
    // ========================================================================

    fn pictures(&self) -> Pictures {
        match self.session.lock().as_ref() {
            None => Pictures::Closed,
            Some(s) if !s.active().tracks().has_video() => Pictures::NoVideo,
            Some(s) => Pictures::Queue(s.active().video_queue().clone()),
        }
    }

    fn samples(&self) -> Option<Arc<FrameQueue<AudioFrame>>> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.active().audio_queue().clone())
    }

    /// 取出下一帧画面；没有视频轨时返回占位帧，流结束或队列被禁用时返回 None
    pub fn get_picture(&self, blocking: bool) -> Option<VideoFrame> {
        match self.pictures() {
            Pictures::Closed => None,
            Pictures::NoVideo => Some(VideoFrame::placeholder()),
            Pictures::Queue(queue) => queue.remove(blocking),
        }
    }

    /// 阻塞取帧，`interrupt` 置位时提前返回 None
    pub fn wait_picture(&self, interrupt: &AtomicBool) -> Option<VideoFrame> {
        match self.pictures() {
            Pictures::Closed => None,
            Pictures::NoVideo => Some(VideoFrame::placeholder()),
            Pictures::Queue(queue) => {
                queue.remove_interruptible(interrupt, self.config.consumer_poll())
            }
        }
    }

    /// 下一帧画面的时间戳（不取出），占位帧为 NaN
    pub fn front_picture(&self, blocking: bool) -> Option<f64> {
        match self.pictures() {
            Pictures::Closed => None,
            Pictures::NoVideo => Some(f64::NAN),
            Pictures::Queue(queue) => queue.front(blocking, |frame| frame.pts),
        }
    }

    pub fn wait_front_picture(&self, interrupt: &AtomicBool) -> Option<f64> {
        match self.pictures() {
            Pictures::Closed => None,
            Pictures::NoVideo => Some(f64::NAN),
            Pictures::Queue(queue) => {
                queue.front_interruptible(interrupt, self.config.consumer_poll(), |frame| frame.pts)
            }
        }
    }

    /// 丢弃时间戳满足条件的队首画面
    pub fn skip_picture(&self, mut predicate: impl FnMut(f64) -> bool) -> usize {
        match self.pictures() {
            Pictures::Queue(queue) => queue.skip_while(|frame| predicate(frame.pts), drop),
            _ => 0,
        }
    }

    pub fn get_sample(&self, blocking: bool) -> Option<AudioFrame> {
        self.samples()?.remove(blocking)
    }

    pub fn wait_sample(&self, interrupt: &AtomicBool) -> Option<AudioFrame> {
        self.samples()?
            .remove_interruptible(interrupt, self.config.consumer_poll())
    }

    /// 下一个音频帧的时间戳（不取出）
    pub fn front_sample(&self, blocking: bool) -> Option<f64> {
        self.samples()?.front(blocking, |frame| frame.pts)
    }

    pub fn skip_sample(&self, mut predicate: impl FnMut(f64) -> bool) -> usize {
        match self.samples() {
            Some(queue) => queue.skip_while(|frame| predicate(frame.pts), drop),
            None => 0,
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        if self.is_file_open() {
            self.close();
        }
        self.worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_pattern::TestPatternOpener;

    fn demuxer() -> Demuxer {
        Demuxer::new(PlayerConfig::default(), Arc::new(TestPatternOpener)).unwrap()
    }

    #[test]
    fn test_open_twice_and_close_twice() {
        let demuxer = demuxer();
        assert_eq!(demuxer.open_file("not-a-media-file"), OpenFileResult::Failed);
        assert!(!demuxer.is_file_open());

        assert_eq!(demuxer.open_file("testsrc"), OpenFileResult::Success);
        assert_eq!(demuxer.open_file("testsrc"), OpenFileResult::AlreadyOpen);
        assert_eq!(demuxer.filename().as_deref(), Some("testsrc"));

        demuxer.close();
        demuxer.close();
        assert!(!demuxer.is_file_open());
        assert_eq!(demuxer.get_picture(false), None);
        assert_eq!(demuxer.open_file("testsrc"), OpenFileResult::Success);
    }

    #[test]
    fn test_seek_scenario() {
        let demuxer = demuxer();
        assert_eq!(
            demuxer.open_file("testsrc?duration=10&fps=30&sample_rate=44100&channels=2"),
            OpenFileResult::Success
        );
        assert_eq!(demuxer.video_duration(), 10.0);
        demuxer.seek(5.0).unwrap();

        let pts = demuxer.front_picture(false).unwrap();
        let picture = demuxer.get_picture(false).unwrap();
        assert_eq!(picture.pts, pts);
        assert!(picture.pts >= 5.0 && picture.pts < 5.0 + 1.0 / 30.0);

        let sample = demuxer.get_sample(false).unwrap();
        assert!(sample.pts >= 5.0 && sample.pts < 5.0 + sample.duration);
    }

    #[test]
    fn test_backward_right_after_open_is_eof() {
        let demuxer = demuxer();
        demuxer.open_file("testsrc");
        demuxer.backward();
        assert!(demuxer.is_backward());
        demuxer.start();
        assert_eq!(demuxer.get_picture(true), None);
        assert_eq!(demuxer.get_sample(true), None);
        demuxer.pause();
        assert!(!demuxer.is_working());
    }

    #[test]
    fn test_decode_loop_feeds_blocking_consumer() {
        let demuxer = demuxer();
        demuxer.open_file("testsrc?duration=2");
        demuxer.start();
        demuxer.start();

        let mut last = f64::NEG_INFINITY;
        for _ in 0..45 {
            let picture = demuxer.get_picture(true).unwrap();
            assert!(picture.pts > last);
            last = picture.pts;
        }
        demuxer.pause();
        assert!(!demuxer.is_working());

        // 暂停后队列可以安全清空
        demuxer.flush();
        assert_eq!(demuxer.get_picture(false), None);
    }

    #[test]
    fn test_forward_after_backward_hands_off_position() {
        let demuxer = demuxer();
        demuxer.open_file("testsrc");
        demuxer.seek(3.0).unwrap();
        demuxer.backward();
        demuxer.seek(3.0).unwrap();
        let picture = demuxer.get_picture(false).unwrap();
        assert!(picture.pts < 3.0);

        demuxer.forward();
        assert!(!demuxer.is_backward());
        demuxer.seek(picture.pts).unwrap();
        assert_eq!(demuxer.get_picture(false).map(|p| p.pts), Some(picture.pts));
    }

    #[test]
    fn test_audio_only_file_gives_placeholders() {
        let demuxer = demuxer();
        demuxer.open_file("testsrc?video=0");
        assert!(!demuxer.has_video());
        assert!(demuxer.get_picture(false).unwrap().is_placeholder());
        assert!(demuxer.front_picture(false).unwrap().is_nan());
    }

    #[test]
    fn test_track_switch_and_output_format() {
        let demuxer = demuxer();
        demuxer.open_file("testsrc?audio_tracks=3");
        let tracks = demuxer.get_tracks();
        assert_eq!(tracks.len(), 3);

        demuxer.set_audio_index(tracks[2].stream_index).unwrap();
        assert_eq!(demuxer.audio_track(), Some(2));
        assert!(matches!(demuxer.set_track(7), Err(PlayerError::StreamNotFound(7))));
        demuxer.backward();
        assert_eq!(demuxer.audio_track(), Some(2));
        demuxer.forward();

        let mono = AudioFormat::new(crate::core::SampleKind::F32, 48000, 1);
        demuxer.set_output_format(mono).unwrap();
        demuxer.seek(1.0).unwrap();
        let sample = demuxer.get_sample(false).unwrap();
        assert_eq!(sample.data.len() % mono.bytes_per_frame(), 0);
        assert_eq!(demuxer.input_format().map(|f| f.channels), Some(2));
    }

    #[test]
    fn test_skip_stale_pictures() {
        let demuxer = demuxer();
        demuxer.open_file("testsrc");
        demuxer.seek(0.0).unwrap();
        demuxer.start();
        while demuxer.front_picture(true).map_or(false, |pts| pts < 0.3) {
            demuxer.skip_picture(|pts| pts < 0.3);
        }
        demuxer.pause();
        assert!(demuxer.get_picture(false).unwrap().pts >= 0.3 - 1e-9);
    }

    #[test]
    fn test_seek_after_eof_restores_flow_control() {
        let demuxer = demuxer();
        demuxer.open_file("testsrc?duration=10");
        demuxer.start();
        let mut shown = 0;
        while demuxer.get_picture(true).is_some() {
            shown += 1;
        }
        assert_eq!(shown, 300);
        demuxer.pause();

        demuxer.seek(0.0).unwrap();
        demuxer.start();
        std::thread::sleep(Duration::from_millis(300));
        let (video, audio) = demuxer.session.lock().as_ref().map(Session::queues).unwrap();
        assert!(!video.is_eof());
        assert!(!audio.is_eof());
        // 音频队列满后停止解码，不会把整个文件读进内存
        assert!(video.len() < 100, "video queue = {}", video.len());

        for _ in 0..60 {
            assert!(demuxer.get_picture(true).is_some());
        }
        demuxer.pause();
    }
}
