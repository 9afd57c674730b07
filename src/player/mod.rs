// 播放器核心模块

pub mod audio_sink;
#[cfg(feature = "audio-device")]
pub mod audio_output;
pub mod decoder;
pub mod demuxer;
pub mod dispatcher;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source;
pub mod frame_queue;
pub mod manager;
pub mod playback;
pub mod reverse;
pub mod source;
pub mod test_pattern;
pub mod worker_thread;

pub use audio_sink::{AudioSink, VirtualSink};
#[cfg(feature = "audio-device")]
pub use audio_output::CpalSink;
pub use decoder::{AudioDecoder, DecodeStatus, TrackDecoder, VideoDecoder};
pub use demuxer::Demuxer;
pub use dispatcher::{Dispatcher, ForwardDispatcher, StepResult, Tracks};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_source::{FfmpegOpener, FfmpegSource};
pub use frame_queue::FrameQueue;
pub use manager::Player;
pub use playback::{Playback, PlaybackEvent, VideoSink};
pub use reverse::ReverseDispatcher;
pub use source::{Codec, MediaOpener, MediaSource, Packet, RawFrame, Received};
pub use test_pattern::{TestPatternOpener, TestPatternSource};
pub use worker_thread::WorkerThread;

use std::process;
use std::thread;

/// 日志前缀：进程号和线程号
pub(crate) fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}
