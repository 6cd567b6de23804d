// SDI 输出：显示模式协商、喂帧调度、无信号画面

pub mod display_mode;
pub mod nosignal;
pub mod queue;
pub mod scheduler;

pub use display_mode::{match_display_mode, ModeMatch};
pub use queue::{OutputQueue, Waker};
pub use scheduler::{SdiOutput, StreamBinding, VideoSetup};
