//! 虚拟化引擎能力接口
//!
//! 引擎（调度、固件加载、逐 VF 记账）对本核心完全不透明，
//! 只通过句柄 + 最小能力接口交互。

use crate::error::Result;
use crate::pci::{BarRegion, Bdf};

/// 单次驱动加载可管理的 GPU 上限，决定状态文件的固定容量
pub const MAX_GPU: usize = 32;

/// 单 GPU 可使能的 VF 上限
pub const MAX_VF: usize = 31;

/// 引擎侧设备句柄，对 shim 不透明
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EngineHandle(pub u64);

/// get_dev_info 查询键
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DevInfoKey {
    /// 当前已使能的 VF 数量
    EnabledVfNum,
    /// 帧缓冲总大小（字节）
    FbSize,
}

/// PF 的 PCI 身份与已映射资源，传给引擎 device_init
#[derive(Debug, Clone, Default)]
pub struct FunctionInfo {
    pub bdf: Bdf,
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_device_id: u16,

    pub sriov_cap_pos: u16,
    pub sriov_vf_offset: u16,
    pub sriov_vf_stride: u16,
    pub sriov_vf_devid: u16,

    pub fb: BarRegion,
    pub doorbell: BarRegion,
    pub io_mem: Option<BarRegion>,
    pub mmio: BarRegion,
}

/// 合并后的配置快照 + 热重启控制位
///
/// 由 ConfigSnapshot::merge 构造；live update import 命中时会覆盖
/// 其中的持久化字段并置 skip_hw_init。
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub total_vf_num: u32,
    pub sched_policy: u32,
    pub fw_load_type: u32,
    pub log_level: u32,
    pub perf_mon_enable: bool,
    pub fullaccess_timeout: u32,
    pub memory_partition_mode: u32,
    pub accelerator_partition_mode: u32,
    pub partition_full_access_enable: bool,
    pub ras_vf_telemetry_policy: u32,
    pub pf_fb_size_mb: u32,

    /// 热重启：跳过硬件初始化，引擎重新挂接而非复位
    pub skip_hw_init: bool,
    /// 热重启命中的状态记录槽位索引
    pub live_record: Option<u32>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            total_vf_num: 1,
            sched_policy: 0,
            fw_load_type: 0,
            log_level: 2,
            perf_mon_enable: false,
            fullaccess_timeout: 0,
            memory_partition_mode: crate::config::MEMORY_PARTITION_NPS1,
            accelerator_partition_mode: 0,
            partition_full_access_enable: true,
            ras_vf_telemetry_policy: 0,
            pf_fb_size_mb: 256,
            skip_hw_init: false,
            live_record: None,
        }
    }
}

/// device_init 的完整入参
#[derive(Debug, Clone)]
pub struct InitData {
    pub info: FunctionInfo,
    pub opt: InitOptions,
}

/// device_fini 选项，引擎可在 fini 中回写实际结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiniOptions {
    /// 交接给 live update：不做硬件 finalize
    pub skip_hw_fini: bool,
    /// 引擎确认状态已导出就绪
    pub export_status: bool,
}

/// 虚拟化引擎能力接口
pub trait GpuEngine: Send + Sync {
    /// 初始化设备，失败时该 GPU 的 worker 单独中止
    fn device_init(&self, data: &InitData) -> Result<EngineHandle>;

    /// 逆向 finalize；引擎通过 opt 回报是否真的跳过了硬件 fini
    fn device_fini(&self, handle: EngineHandle, opt: &mut FiniOptions) -> Result<()>;

    fn dev_info(&self, handle: EngineHandle, key: DevInfoKey) -> Result<u64>;

    /// 第 index 个已使能 VF 的 BDF
    fn vf_bdf(&self, handle: EngineHandle, index: u32) -> Result<Bdf>;

    /// 推送最新的设备邻接表（多 GPU 链路分组用）
    fn adapt_list_update(&self, handle: EngineHandle, list: &[Option<EngineHandle>; MAX_GPU]);

    /// 设备是否处于整卡复位流程中
    fn in_whole_gpu_reset(&self, handle: EngineHandle) -> bool;

    fn enabled_vf_count(&self, handle: EngineHandle) -> u32 {
        match self.dev_info(handle, DevInfoKey::EnabledVfNum) {
            Ok(n) => n as u32,
            Err(_) => 0,
        }
    }
}
