//! 播放器解码调度与音视频同步核心

pub mod core;
pub mod player;

pub use crate::core::{PlayerConfig, PlayerError, Result};
pub use crate::player::Player;
