//! SR-IOV GPU 宿主 shim
//!
//! 把 OS 的 PCI 事件翻译成虚拟化引擎调用：并发 probe 编排、
//! 设备登记、live update（热重启）粘合。引擎与 PCI 后端都是
//! 注入的 trait 对象，本 crate 不含任何硬件代码。
//!
//! ```text
//! Shim::init ─▶ probe × N（每 GPU 一个线程）─▶ wait_probes
//!                      │
//!                      ▼
//!               DeviceRegistry ◀── remove / shutdown_all
//!                      │
//! Shim::exit ─▶ UsageGate 等待 ─▶ 逐台拆除 ─▶ manager.fini
//! ```

pub mod device;
pub mod orchestrator;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use giv_core::{Bdf, ConfigStore, GpuEngine, PciTopology, Result};
use giv_live_update::LiveUpdateManager;

pub use device::{build_vf_map, upstream_chain, DeviceContext, VfRecord};
pub use orchestrator::{InitBarrier, Orchestrator, ShimOptions, UsageGate};
pub use registry::DeviceRegistry;

/// 模块生命周期的外壳
///
/// init 装配依赖、逐台 probe、等全部收尾；exit 对称拆除。
pub struct Shim {
    orch: Arc<Orchestrator>,
}

impl Shim {
    /// 装配并接管 `functions` 列出的设备
    ///
    /// 返回时所有 probe worker 均已退出；个别 GPU 的失败不影响
    /// 返回值，通过登记表与故障环观察。
    pub fn init(
        engine: Arc<dyn GpuEngine>,
        topology: Arc<dyn PciTopology>,
        store: Arc<dyn ConfigStore>,
        live: LiveUpdateManager,
        options: ShimOptions,
        functions: &[Bdf],
    ) -> Result<Self> {
        let orch = Orchestrator::new(engine, topology, store, live, options);

        for bdf in functions {
            if let Err(e) = orch.probe(*bdf) {
                log::warn!("{}: not taken over: {}", bdf, e);
            }
        }
        orch.wait_probes();

        log::info!("shim ready, {} GPU(s) registered", orch.registry().len());
        Ok(Self { orch })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orch
    }

    /// 拆除全部设备并释放 live update 后端
    pub fn exit(self) {
        self.orch.exit();
        log::info!("shim exited");
    }
}
