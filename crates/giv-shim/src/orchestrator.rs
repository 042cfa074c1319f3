//! 设备编排器
//!
//! 每块通过准入检查的 GPU 由独立工作线程完成 probe，互不等待。
//! 任一 GPU 的失败只中止它自己的 worker，兄弟设备不受影响。
//!
//! 两道可观察屏障取代轮询：
//! - [`InitBarrier`]：模块初始化等待所有在途 probe 收尾；
//! - [`UsageGate`]：模块退出等待所有 VF 释放、复位流程排空
//!   （live update 交接时跳过，guest 继续跑）。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use giv_core::config::{self, ConfigOverrides, ConfigSnapshot, ConfigStore};
use giv_core::pci::{
    BAR_DOORBELL, BAR_FB, BAR_IO, BAR_MMIO, PCI_EXT_CAP_ID_SRIOV, PCI_SRIOV_VF_DID,
    PCI_SRIOV_VF_OFFSET, PCI_SRIOV_VF_STRIDE,
};
use giv_core::{
    put_error, Bdf, FaultCode, FaultRing, FiniOptions, FunctionInfo, GivError, GpuEngine, InitData,
    InitOptions, MappedBar, PciFunction, PciTopology, Result, MAX_GPU,
};
use giv_live_update::{ImportStatus, LiveUpdateManager};

use crate::device::{build_vf_map, upstream_chain, DeviceContext};
use crate::registry::DeviceRegistry;

/// 在途 probe 计数屏障
#[derive(Default)]
pub struct InitBarrier {
    pending: Mutex<u32>,
    cond: Condvar,
}

impl InitBarrier {
    fn enter(&self) {
        *self.pending.lock() += 1;
    }

    fn leave(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.cond.notify_all();
        }
    }

    /// 阻塞到所有在途 probe 退出；无超时，probe 自身保证会收尾
    pub fn wait_idle(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.cond.wait(&mut pending);
        }
    }
}

#[derive(Default)]
struct GateState {
    vf_busy: u32,
    resets: u32,
}

/// 退出屏障：VF 占用与整卡复位都归零才放行
#[derive(Default)]
pub struct UsageGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl UsageGate {
    pub fn vf_get(&self) {
        self.state.lock().vf_busy += 1;
    }

    pub fn vf_put(&self) {
        let mut state = self.state.lock();
        state.vf_busy = state.vf_busy.saturating_sub(1);
        if state.vf_busy == 0 && state.resets == 0 {
            self.cond.notify_all();
        }
    }

    pub fn reset_begin(&self) {
        self.state.lock().resets += 1;
    }

    pub fn reset_end(&self) {
        let mut state = self.state.lock();
        state.resets = state.resets.saturating_sub(1);
        if state.vf_busy == 0 && state.resets == 0 {
            self.cond.notify_all();
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.vf_busy == 0 && state.resets == 0
    }

    /// 阻塞到完全空闲；不设上限，guest 数据优先于关机时限
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.vf_busy > 0 || state.resets > 0 {
            self.cond.wait(&mut state);
        }
    }
}

/// 模块级选项
#[derive(Debug, Clone, Default)]
pub struct ShimOptions {
    /// 分号分隔的 BDF 允许名单；None 表示接管全部
    pub enabled_devices: Option<String>,
    pub overrides: ConfigOverrides,
}

fn parse_allow_list(raw: &str) -> Vec<Bdf> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<Bdf>() {
            Ok(bdf) => Some(bdf),
            Err(e) => {
                log::warn!("ignoring bad entry in enabled device list: {}", e);
                None
            }
        })
        .collect()
}

pub struct Orchestrator {
    engine: Arc<dyn GpuEngine>,
    topology: Arc<dyn PciTopology>,
    store: Arc<dyn ConfigStore>,
    faults: Arc<FaultRing>,
    live: Mutex<LiveUpdateManager>,
    registry: DeviceRegistry,

    allow_list: Option<Vec<Bdf>>,
    overrides: ConfigOverrides,

    next_gpu_index: AtomicU32,
    barrier: InitBarrier,
    gate: UsageGate,
    live_handoff: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn GpuEngine>,
        topology: Arc<dyn PciTopology>,
        store: Arc<dyn ConfigStore>,
        live: LiveUpdateManager,
        options: ShimOptions,
    ) -> Arc<Self> {
        let allow_list = options
            .enabled_devices
            .as_deref()
            .map(parse_allow_list)
            .filter(|list| !list.is_empty());

        Arc::new(Self {
            engine,
            topology,
            store,
            faults: Arc::new(FaultRing::new()),
            live: Mutex::new(live),
            registry: DeviceRegistry::new(),
            allow_list,
            overrides: options.overrides,
            next_gpu_index: AtomicU32::new(0),
            barrier: InitBarrier::default(),
            gate: UsageGate::default(),
            live_handoff: AtomicBool::new(false),
        })
    }

    pub fn faults(&self) -> &FaultRing {
        &self.faults
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &UsageGate {
        &self.gate
    }

    /// 已分配出去的 GPU 序号数（也是 export 时落盘的 gpu_num）
    pub fn probed_count(&self) -> u32 {
        self.next_gpu_index.load(Ordering::SeqCst)
    }

    /// 模块卸载时交接给 live update，而非硬件 finalize
    pub fn request_live_handoff(&self) {
        self.live_handoff.store(true, Ordering::SeqCst);
    }

    pub fn live_handoff_requested(&self) -> bool {
        self.live_handoff.load(Ordering::SeqCst)
    }

    /// 准入检查 + 启动该设备的 probe 工作线程
    ///
    /// 返回 Ok 只表示 worker 已启动（或设备被名单过滤）；
    /// 结果通过登记表与故障环观察。
    pub fn probe(self: &Arc<Self>, bdf: Bdf) -> Result<()> {
        if let Some(list) = &self.allow_list {
            if !list.contains(&bdf) {
                log::info!("{}: not in enabled device list, ignored", bdf);
                return Ok(());
            }
        }

        let dev = self
            .topology
            .function_at(bdf)
            .ok_or(GivError::FunctionNotFound(bdf))?;

        if dev.find_ext_capability(PCI_EXT_CAP_ID_SRIOV).is_none() {
            put_error(Some(self.faults.as_ref()), FaultCode::NoSriovSupport, bdf.0 as u64);
            return Err(GivError::NoSriovSupport(bdf));
        }

        let gpu_index = self.next_gpu_index.fetch_add(1, Ordering::SeqCst);
        if gpu_index as usize >= MAX_GPU {
            self.next_gpu_index.fetch_sub(1, Ordering::SeqCst);
            log::warn!("{}: GPU limit {} reached, not probing", bdf, MAX_GPU);
            return Err(GivError::TooManyDevices(MAX_GPU));
        }

        self.barrier.enter();
        let orch = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("giv-probe-{}", gpu_index))
            .spawn(move || {
                if let Err(e) = orch.probe_worker(dev, gpu_index) {
                    log::error!("{}: probe failed: {}", bdf, e);
                }
                orch.barrier.leave();
            });

        if let Err(e) = spawned {
            self.barrier.leave();
            return Err(e.into());
        }
        Ok(())
    }

    /// 阻塞到所有在途 probe 完成
    pub fn wait_probes(&self) {
        self.barrier.wait_idle();
    }

    fn map_bar_logged(&self, dev: &dyn PciFunction, index: usize) -> Result<MappedBar> {
        dev.map_bar(index).map_err(|e| {
            put_error(
                Some(self.faults.as_ref()),
                FaultCode::ResourceMapping,
                index as u64,
            );
            e
        })
    }

    fn probe_worker(&self, dev: Arc<dyn PciFunction>, gpu_index: u32) -> Result<()> {
        let bdf = dev.bdf();
        let faults = Some(self.faults.as_ref());
        log::info!("{}: probing as GPU{}", bdf, gpu_index);

        // 作用域持有：之后任一失败分支都会按序解除已映射的 BAR
        let fb = self.map_bar_logged(&*dev, BAR_FB)?;
        let doorbell = self.map_bar_logged(&*dev, BAR_DOORBELL)?;
        let io_mem = match dev.bar_region(BAR_IO) {
            Some(_) => Some(self.map_bar_logged(&*dev, BAR_IO)?),
            None => None,
        };
        let mmio = self.map_bar_logged(&*dev, BAR_MMIO)?;

        let cap_pos = dev
            .find_ext_capability(PCI_EXT_CAP_ID_SRIOV)
            .ok_or(GivError::NoSriovSupport(bdf))?;
        let vf_offset = dev.read_config_word(cap_pos + PCI_SRIOV_VF_OFFSET)?;
        let vf_stride = dev.read_config_word(cap_pos + PCI_SRIOV_VF_STRIDE)?;
        let vf_devid = dev.read_config_word(cap_pos + PCI_SRIOV_VF_DID)?;

        let mut opt =
            ConfigSnapshot::merge(self.store.as_ref(), gpu_index, &self.overrides, faults);

        dev.enable().map_err(|e| {
            put_error(faults, FaultCode::PciEnable, bdf.0 as u64);
            e
        })?;
        dev.set_master();

        match self.live.lock().import(&*dev, gpu_index, &mut opt, faults) {
            ImportStatus::Ok => {}
            ImportStatus::Corrupted => {
                dev.disable();
                return Err(GivError::LiveUpdateCorrupted);
            }
        }

        if opt.skip_hw_init {
            self.restore_persisted(&opt);
        }

        let info = FunctionInfo {
            bdf,
            vendor_id: dev.vendor_id(),
            device_id: dev.device_id(),
            revision_id: dev.revision_id(),
            subsystem_vendor_id: dev.subsystem_vendor_id(),
            subsystem_device_id: dev.subsystem_device_id(),
            sriov_cap_pos: cap_pos,
            sriov_vf_offset: vf_offset,
            sriov_vf_stride: vf_stride,
            sriov_vf_devid: vf_devid,
            fb: fb.region(),
            doorbell: doorbell.region(),
            io_mem: io_mem.as_ref().map(|bar| bar.region()),
            mmio: mmio.region(),
        };

        let handle = match self.engine.device_init(&InitData {
            info: info.clone(),
            opt: opt.clone(),
        }) {
            Ok(handle) => handle,
            Err(e) => {
                put_error(faults, FaultCode::EngineInit, bdf.0 as u64);
                dev.disable();
                return Err(e);
            }
        };

        let vf_map =
            match build_vf_map(self.engine.as_ref(), handle, self.topology.as_ref(), bdf) {
                Ok(map) => map,
                Err(e) => {
                    log::warn!("{}: VF map discarded: {}", bdf, e);
                    put_error(faults, FaultCode::VfResolution, bdf.0 as u64);
                    Vec::new()
                }
            };

        let upstream = upstream_chain(&*dev);

        let mut bars = vec![fb, doorbell, mmio];
        if let Some(io) = io_mem {
            bars.push(io);
        }

        let vf_count = vf_map.len();
        let ctx = Arc::new(DeviceContext::new(
            gpu_index, info, opt, handle, dev, upstream, vf_map, bars,
        ));
        self.registry.register(ctx);
        self.registry.broadcast_adapt_list(self.engine.as_ref());

        log::info!("{}: GPU{} ready, {} VFs mapped", bdf, gpu_index, vf_count);
        Ok(())
    }

    /// live update 命中后把持久化配置回写存储，
    /// 下一代次冷启动时与硬件现状保持一致
    fn restore_persisted(&self, opt: &InitOptions) {
        let pairs = [
            (config::VF_NUM.key, opt.total_vf_num as i64),
            (
                config::ACCELERATOR_PARTITION_MODE.key,
                opt.accelerator_partition_mode as i64,
            ),
            (
                config::MEMORY_PARTITION_MODE.key,
                opt.memory_partition_mode as i64,
            ),
            (
                config::PARTITION_FULL_ACCESS_ENABLE.key,
                opt.partition_full_access_enable as i64,
            ),
        ];
        for (key, value) in pairs {
            if let Err(e) = self.store.set(key, value) {
                log::warn!("failed to persist {} after live update: {}", key, e);
            }
        }
    }

    /// 拆除 / 关机共用的 fini 选项
    ///
    /// 有交接请求且后端可用才跳过硬件 finalize；整卡复位进行中的
    /// 设备状态不自洽，拒绝交接，按普通 fini 处理。
    fn fini_options_for(&self, ctx: &DeviceContext) -> FiniOptions {
        let mut handoff =
            self.live_handoff.load(Ordering::SeqCst) && !self.live.lock().is_disabled();
        if handoff && self.engine.in_whole_gpu_reset(ctx.handle) {
            log::warn!(
                "{}: whole GPU reset in flight, refusing live update handoff",
                ctx.bdf
            );
            handoff = false;
        }
        FiniOptions {
            skip_hw_fini: handoff,
            export_status: false,
        }
    }

    /// 逆序拆除：注销、fini、export、视情况释放 PCI
    pub fn remove(&self, bdf: Bdf) -> Result<()> {
        let ctx = self
            .registry
            .unregister(bdf)
            .ok_or(GivError::FunctionNotFound(bdf))?;
        self.registry.broadcast_adapt_list(self.engine.as_ref());

        let _guard = ctx.dev_lock.lock();

        let mut fini = self.fini_options_for(&ctx);
        if let Err(e) = self.engine.device_fini(ctx.handle, &mut fini) {
            log::warn!("{}: engine fini failed: {}", bdf, e);
        }

        let record_idx = ctx.opt.live_record.unwrap_or(ctx.gpu_index);
        let gpu_count = self.probed_count();
        self.live
            .lock()
            .export(&*ctx.pci, record_idx, &ctx.opt, &fini, gpu_count);

        if !fini.skip_hw_fini {
            ctx.pci.disable();
        }
        ctx.vf_map.lock().clear();
        log::info!("{}: GPU{} removed", bdf, ctx.gpu_index);
        Ok(())
    }

    /// 系统关机路径：fini + export，但不释放 PCI 资源
    pub fn shutdown_all(&self) {
        for ctx in self.registry.snapshot() {
            let _guard = ctx.dev_lock.lock();
            let mut fini = self.fini_options_for(&ctx);
            if let Err(e) = self.engine.device_fini(ctx.handle, &mut fini) {
                log::warn!("{}: engine fini failed on shutdown: {}", ctx.bdf, e);
            }
            let record_idx = ctx.opt.live_record.unwrap_or(ctx.gpu_index);
            let gpu_count = self.probed_count();
            self.live
                .lock()
                .export(&*ctx.pci, record_idx, &ctx.opt, &fini, gpu_count);
        }
    }

    /// 模块退出收尾：等屏障（交接时跳过）、拆所有设备、释放后端
    pub fn exit(&self) {
        self.wait_probes();

        if !self.live_handoff_requested() {
            self.gate.wait_idle();
        }

        for ctx in self.registry.snapshot() {
            if let Err(e) = self.remove(ctx.bdf) {
                log::warn!("{}: remove on exit failed: {}", ctx.bdf, e);
            }
        }

        self.live.lock().fini();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allow_list_skips_bad_entries() {
        let list = parse_allow_list("0000:41:00.0; 0000:61:00.0 ;;bogus");
        assert_eq!(
            list,
            vec![Bdf::new(0, 0x41, 0, 0), Bdf::new(0, 0x61, 0, 0)]
        );
    }

    #[test]
    fn test_usage_gate_tracks_busy_counts() {
        let gate = UsageGate::default();
        assert!(gate.is_idle());
        gate.vf_get();
        gate.reset_begin();
        assert!(!gate.is_idle());
        gate.vf_put();
        assert!(!gate.is_idle());
        gate.reset_end();
        assert!(gate.is_idle());
        // put below zero saturates instead of wrapping
        gate.vf_put();
        assert!(gate.is_idle());
    }

    #[test]
    fn test_usage_gate_wait_unblocks_on_release() {
        let gate = Arc::new(UsageGate::default());
        gate.vf_get();

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_idle())
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        gate.vf_put();
        waiter.join().expect("waiter join");
        assert!(gate.is_idle());
    }

    #[test]
    fn test_init_barrier_waits_for_all_workers() {
        let barrier = Arc::new(InitBarrier::default());
        for _ in 0..4 {
            barrier.enter();
            let b = Arc::clone(&barrier);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                b.leave();
            });
        }
        barrier.wait_idle();
        assert_eq!(*barrier.pending.lock(), 0);
    }
}
