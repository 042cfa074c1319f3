//! Live update（热重启）状态转移
//!
//! 驱动重载跨代次传递每 GPU 状态：blob 位级布局在 [`blob`]，
//! 加载 / 校验 / 匹配 / 导出的生命周期在 [`manager`]。

pub mod blob;
pub mod manager;

pub use blob::{default_capacity, FILE_HEADER_SIZE, HEADER_VERSION, RECORD_SIZE};
pub use manager::{ImportStatus, LiveUpdateManager, StateWindow};
