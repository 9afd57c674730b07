// 核心数据结构和类型定义

pub mod audio_format;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use audio_format::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use types::*;
