//! 每 GPU 设备上下文
//!
//! probe worker 成功后的产物：PCI 句柄、已映射 BAR、引擎句柄、
//! VF 映射表。BAR 映射随上下文 drop 自动解除。

use std::sync::Arc;

use parking_lot::Mutex;

use giv_core::pci::PCI_VENDOR_ID_GPU;
use giv_core::{
    Bdf, EngineHandle, FunctionInfo, GivError, GpuEngine, InitOptions, MappedBar, PciFunction,
    PciTopology, Result,
};

/// 单个已使能 VF 的登记项
#[derive(Clone)]
pub struct VfRecord {
    pub index: u32,
    pub bdf: Bdf,
    pub function: Arc<dyn PciFunction>,
}

/// 一块受管 GPU 的全部运行态
pub struct DeviceContext {
    pub gpu_index: u32,
    pub bdf: Bdf,
    pub info: FunctionInfo,
    pub opt: InitOptions,
    pub handle: EngineHandle,

    pub pci: Arc<dyn PciFunction>,
    /// PF 到根的同厂商桥链（多卡链路分组、整卡复位范围判定用）
    pub upstream: Vec<Bdf>,

    /// 空表示 VF 解析失败或尚未使能
    pub vf_map: Mutex<Vec<VfRecord>>,
    /// 串行化对该设备的管理面操作
    pub dev_lock: Mutex<()>,

    // drop 顺序：先 vf_map/引擎句柄的使用者退出，再解除 BAR 映射
    #[allow(dead_code)]
    bars: Vec<MappedBar>,
}

impl DeviceContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gpu_index: u32,
        info: FunctionInfo,
        opt: InitOptions,
        handle: EngineHandle,
        pci: Arc<dyn PciFunction>,
        upstream: Vec<Bdf>,
        vf_map: Vec<VfRecord>,
        bars: Vec<MappedBar>,
    ) -> Self {
        Self {
            gpu_index,
            bdf: info.bdf,
            info,
            opt,
            handle,
            pci,
            upstream,
            vf_map: Mutex::new(vf_map),
            dev_lock: Mutex::new(()),
            bars,
        }
    }

    /// 任一已登记 VF 仍被持有即视为设备在用
    pub fn any_vf_in_use(&self) -> bool {
        self.vf_map.lock().iter().any(|vf| vf.function.is_enabled())
    }

    /// 按 BDF 反查 VF 序号
    pub fn vf_index_of(&self, bdf: Bdf) -> Option<u32> {
        self.vf_map
            .lock()
            .iter()
            .find(|vf| vf.bdf == bdf)
            .map(|vf| vf.index)
    }
}

/// 逐个解析已使能 VF 的 BDF 并定位其 PCI 功能
///
/// 全有或全无：任何一个 VF 解析失败就丢弃整张表，调用方
/// 记故障后以空表继续（PF 仍可管理）。
pub fn build_vf_map(
    engine: &dyn GpuEngine,
    handle: EngineHandle,
    topology: &dyn PciTopology,
    pf_bdf: Bdf,
) -> Result<Vec<VfRecord>> {
    let count = engine.enabled_vf_count(handle);
    let mut map = Vec::with_capacity(count as usize);

    for index in 0..count {
        let bdf = engine.vf_bdf(handle, index).map_err(|e| {
            log::warn!("{}: VF{} bdf query failed: {}", pf_bdf, index, e);
            GivError::VfResolution { bdf: pf_bdf, index }
        })?;

        let function = topology
            .function_at(bdf)
            .ok_or(GivError::VfResolution { bdf: pf_bdf, index })?;

        map.push(VfRecord {
            index,
            bdf,
            function,
        });
    }

    Ok(map)
}

/// 从 PF 向根走同厂商桥链
///
/// 碰到非本厂商的桥即停，得到的是整张物理卡的上游路径。
pub fn upstream_chain(dev: &dyn PciFunction) -> Vec<Bdf> {
    let mut chain = Vec::new();
    let mut cursor = dev.upstream_bridge();

    while let Some(bridge) = cursor {
        if bridge.vendor_id() != PCI_VENDOR_ID_GPU {
            break;
        }
        chain.push(bridge.bdf());
        cursor = bridge.upstream_bridge();
    }

    chain
}
