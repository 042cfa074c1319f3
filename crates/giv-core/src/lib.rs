//! GIV 核心类型
//!
//! SR-IOV GPU 虚拟化宿主 shim 的共享底层：PCI 抽象、引擎能力接口、
//! 配置存取、故障环形缓冲、统一错误类型。

pub mod config;
pub mod engine;
pub mod error;
pub mod faultlog;
pub mod pci;

pub use config::{ConfigOverrides, ConfigSnapshot, ConfigStore, MemConfigStore, TomlConfigStore};
pub use engine::{
    DevInfoKey, EngineHandle, FiniOptions, FunctionInfo, GpuEngine, InitData, InitOptions,
    MAX_GPU, MAX_VF,
};
pub use error::{GivError, Result};
pub use faultlog::{put_error, FaultCode, FaultEntry, FaultRing, FAULT_RING_CAPACITY};
pub use pci::{sriov_enabled, BarRegion, Bdf, MappedBar, PciFunction, PciTopology};
