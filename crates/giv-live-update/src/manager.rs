//! Live update（热重启）管理器
//!
//! 驱动重载时不复位硬件、不打断在跑的 guest：卸载侧把每 GPU 状态
//! 导出到文件或调用方提供的物理内存窗口，加载侧校验、按 BDF 匹配
//! 并回灌。后端在启动时一次性选定，之后不再切换。
//!
//! 并发：只会被 probe / remove / shutdown / module init / fini 这些
//! 已串行化的调用点触达，内部不加锁；调用方负责把 export 与关机
//! 屏障串行化。

use std::path::{Path, PathBuf};

use giv_core::config::MEMORY_PARTITION_NPS1;
use giv_core::faultlog::{put_error, FaultCode, FaultRing};
use giv_core::pci::sriov_enabled;
use giv_core::{FiniOptions, InitOptions, PciFunction};

use crate::blob::{
    self, pack_version, read_file_header, read_record, record_crc, record_fits, record_offset,
    stamp_record_hash, wipe_file_header, write_file_header, write_record, FILE_HEADER_SIZE,
    HEADER_VERSION, RECORD_SIZE, SCRATCH_HASH_ADDR,
};

/// import 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    /// 正常（冷启动、陈旧数据跳过、或热重启命中）
    Ok,
    /// blob 整体作废，本次及后续 import 全部拒绝
    Corrupted,
}

/// 调用方提供的物理内存窗口
///
/// 真实实现映射一段保留物理内存；窗口本身就是状态的权威副本，
/// fini 时直接解除映射、不回写。
pub trait StateWindow: Send {
    fn phys_addr(&self) -> u64;
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

enum Backing {
    Disabled,
    File { path: PathBuf, buf: Vec<u8> },
    Memory { window: Box<dyn StateWindow> },
}

/// 每 GPU 状态 blob 的属主
pub struct LiveUpdateManager {
    backing: Backing,
    gpu_num: u32,
    is_valid_crc: bool,
    is_valid_update: bool,
    exported: bool,
}

impl LiveUpdateManager {
    pub fn disabled() -> Self {
        Self {
            backing: Backing::Disabled,
            gpu_num: 0,
            is_valid_crc: false,
            is_valid_update: false,
            exported: false,
        }
    }

    /// 文件后端：路径存在则读入，否则保持零填充
    pub fn file_backed(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut buf = vec![0u8; blob::default_capacity()];

        match std::fs::read(&path) {
            Ok(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("live update file read failure: {}", e);
            }
        }

        let mut mgr = Self {
            backing: Backing::File { path, buf },
            gpu_num: 0,
            is_valid_crc: false,
            is_valid_update: false,
            exported: false,
        };
        mgr.finish_load();
        mgr
    }

    /// 内存窗口后端
    ///
    /// 物理地址必须按 RECORD_SIZE 对齐且至少放得下 1 个 GPU 的
    /// 记录，否则回退到文件后端。
    pub fn memory_backed(window: Box<dyn StateWindow>, fallback_path: &Path) -> Self {
        if window.phys_addr() & (RECORD_SIZE as u64 - 1) != 0 {
            log::warn!("live update memory address not 1MB aligned");
            return Self::file_backed(fallback_path);
        }

        if window.bytes().len() < FILE_HEADER_SIZE + RECORD_SIZE {
            log::warn!("live update memory size is not enough for 1 GPU");
            return Self::file_backed(fallback_path);
        }

        let mut mgr = Self {
            backing: Backing::Memory { window },
            gpu_num: 0,
            is_valid_crc: false,
            is_valid_update: false,
            exported: false,
        };
        mgr.finish_load();
        mgr
    }

    fn finish_load(&mut self) {
        let (valid, gpu_num) = blob::validate(self.bytes());
        self.gpu_num = gpu_num;
        self.is_valid_crc = valid;
        self.is_valid_update = true;
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.backing, Backing::Disabled)
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::File { .. })
    }

    pub fn is_memory_backed(&self) -> bool {
        matches!(self.backing, Backing::Memory { .. })
    }

    pub fn is_valid_crc(&self) -> bool {
        self.is_valid_crc
    }

    pub fn exported(&self) -> bool {
        self.exported
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Disabled => &[],
            Backing::File { buf, .. } => buf,
            Backing::Memory { window } => window.bytes(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Disabled => &mut [],
            Backing::File { buf, .. } => buf,
            Backing::Memory { window } => window.bytes_mut(),
        }
    }

    /// 第 idx 个记录槽的可变视图，作为引擎的工作状态区
    pub fn record_mut(&mut self, idx: u32) -> Option<&mut [u8]> {
        if !record_fits(self.bytes().len(), idx) {
            return None;
        }
        let off = record_offset(idx);
        Some(&mut self.bytes_mut()[off..off + RECORD_SIZE])
    }

    /// 按 (blob CRC 有效?, 该 PF 的 SR-IOV 当前使能?) 的 2×2 矩阵决策:
    ///
    /// 1. 无效 + 未使能: 普通冷启动，什么都不导入
    /// 2. 无效 + 使能:   硬件状态与存档矛盾，blob 作废
    /// 3. 有效 + 使能前次残留（未使能）: 陈旧数据，跳过导入
    /// 4. 有效 + 使能:   候选热重启，按 BDF 匹配记录
    ///
    /// 命中时覆盖快照中的持久化字段、置 skip_hw_init、
    /// 记下匹配槽位；未命中同样使 blob 作废。
    pub fn import(
        &mut self,
        dev: &dyn PciFunction,
        gpu_index: u32,
        opt: &mut InitOptions,
        faults: Option<&FaultRing>,
    ) -> ImportStatus {
        let bdf = dev.bdf();

        // 默认按普通冷启动处理
        opt.skip_hw_init = false;
        opt.live_record = None;

        if self.is_disabled() {
            log::info!("{}: live update is disabled", bdf);
            return ImportStatus::Ok;
        }

        if !self.is_valid_update {
            log::warn!("{}: live update data has been rejected", bdf);
            return self.import_status(bdf, faults);
        }

        if !record_fits(self.bytes().len(), gpu_index) {
            log::warn!("{}: reserved data size is not enough, or corrupted", bdf);
            self.is_valid_update = false;
            return self.import_status(bdf, faults);
        }

        let sriov = sriov_enabled(dev);
        match (self.is_valid_crc, sriov) {
            (false, false) => {
                log::info!("{}: live update is skipped", bdf);
            }
            (false, true) => {
                log::warn!("{}: live update data is corrupted", bdf);
                self.is_valid_update = false;
            }
            (true, false) => {
                log::warn!("{}: live update data is old", bdf);
                put_error(faults, FaultCode::LiveUpdateStale, bdf.0 as u64);
            }
            (true, true) => {
                self.try_match(dev, gpu_index, opt);
            }
        }

        self.import_status(bdf, faults)
    }

    fn import_status(&self, bdf: giv_core::Bdf, faults: Option<&FaultRing>) -> ImportStatus {
        if self.is_valid_update {
            ImportStatus::Ok
        } else {
            put_error(faults, FaultCode::LiveUpdateCorrupted, bdf.0 as u64);
            ImportStatus::Corrupted
        }
    }

    /// 扫描记录找本 PF；BDF 相等（完整 32 位或去 domain 的 16 位）
    /// 即为命中。暂存寄存器里的 hash 只作旁证：读出后立即清零，
    /// 不一致仅记异常，不推翻命中。
    fn try_match(&mut self, dev: &dyn PciFunction, gpu_index: u32, opt: &mut InitOptions) {
        let bdf = dev.bdf();
        let header_version = read_file_header(self.bytes()).version;

        for i in 0..self.gpu_num {
            let rec = read_record(self.bytes(), i);

            let full_match = bdf.0 == rec.bdf;
            let masked_match = bdf.masked16() == rec.bdf;
            if !full_match && !masked_match {
                continue;
            }

            if !full_match {
                log::warn!(
                    "{}: domain mismatch but bdf validation passed, continue live update",
                    bdf
                );
            }

            self.check_scratch_hash(dev, &rec);

            let mut rec = rec;
            // 旧版头缺字段，按 2.0 之前的默认值补齐
            if header_version <= pack_version(2, 0) {
                rec.partition_full_access_enable = 1;
                rec.memory_partition_mode = MEMORY_PARTITION_NPS1;
                rec.accelerator_partition_mode = rec.num_vf;
                write_record(self.bytes_mut(), i, &rec);
            }

            // 持久化的配置覆盖本次启动的快照
            opt.total_vf_num = rec.num_vf;
            opt.accelerator_partition_mode = rec.accelerator_partition_mode;
            opt.memory_partition_mode = rec.memory_partition_mode;
            opt.partition_full_access_enable = rec.partition_full_access_enable != 0;

            opt.skip_hw_init = true;
            opt.live_record = Some(i);

            log::info!("{}: proceed to live update", bdf);
            return;
        }

        log::warn!("{}: failed to find live update data for GPU{}", bdf, gpu_index);
        self.is_valid_update = false;
    }

    /// 暂存寄存器单次读取后清零；比较结果仅作诊断
    fn check_scratch_hash(&self, dev: &dyn PciFunction, rec: &blob::RecordHeader) {
        let bdf = dev.bdf();

        if rec.hash_addr > u16::MAX as u64 {
            log::warn!("{}: scratch register offset {:#x} out of config space", bdf, rec.hash_addr);
            return;
        }
        let addr = rec.hash_addr as u16;

        let scratch = match dev.read_config_dword(addr) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{}: scratch register read failed: {}", bdf, e);
                return;
            }
        };
        if let Err(e) = dev.write_config_dword(addr, 0) {
            log::warn!("{}: scratch register clear failed: {}", bdf, e);
        }

        log::info!("{}: header hash {:#x}, pci hash {:#x}", bdf, rec.hash, scratch);
        if scratch != rec.hash {
            log::warn!(
                "{}: scratch hash mismatch ({:#x} != {:#x}), bdf match is authoritative",
                bdf,
                scratch,
                rec.hash
            );
        }
    }

    /// 导出本 GPU 的记录
    ///
    /// 只有 (skip_hw_fini, export_status) 同时成立才真正导出；
    /// 否则抹掉头部签名，防止下次冷启动误读残留数据。
    pub fn export(
        &mut self,
        dev: &dyn PciFunction,
        record_idx: u32,
        opt: &InitOptions,
        fini: &FiniOptions,
        gpu_count: u32,
    ) {
        if self.is_disabled() {
            return;
        }

        let bdf = dev.bdf();

        if !(fini.skip_hw_fini && fini.export_status) {
            wipe_file_header(self.bytes_mut());
            return;
        }

        if !record_fits(self.bytes().len(), record_idx) {
            log::warn!("{}: no record slot for export at index {}", bdf, record_idx);
            return;
        }

        write_file_header(self.bytes_mut(), HEADER_VERSION, gpu_count);

        let mut rec = read_record(self.bytes(), record_idx);
        rec.idx = 0; // not used, probe is parallel
        rec.bdf = bdf.0;
        if rec.hash_addr == 0 {
            rec.hash_addr = SCRATCH_HASH_ADDR;
        }
        // 引擎负责填 payload 和 size；size 至少要盖住参数块
        let min_size = (blob::REC_PAYLOAD_OFFSET - blob::REC_OFF_SIZE) as u32;
        if rec.size < min_size {
            rec.size = min_size;
        }
        rec.num_vf = opt.total_vf_num;
        rec.accelerator_partition_mode = opt.accelerator_partition_mode;
        rec.memory_partition_mode = opt.memory_partition_mode;
        rec.partition_full_access_enable = opt.partition_full_access_enable as u32;
        write_record(self.bytes_mut(), record_idx, &rec);

        match record_crc(self.bytes(), record_idx) {
            Some(hash) => {
                stamp_record_hash(self.bytes_mut(), record_idx, hash);
                if rec.hash_addr <= u16::MAX as u64 {
                    if let Err(e) = dev.write_config_dword(rec.hash_addr as u16, hash) {
                        log::warn!("{}: scratch register write failed: {}", bdf, e);
                    }
                }
            }
            None => {
                log::warn!("{}: record size inconsistent, hash not stamped", bdf);
            }
        }

        self.gpu_num = gpu_count;
        self.exported = true;
        log::info!("{}: live update data exported", bdf);
    }

    /// 释放后端
    ///
    /// 文件后端仅在发生过导出、且记录的大小自洽时落盘；
    /// 内存窗口直接解除映射，不回写（窗口即权威副本）。
    pub fn fini(&mut self) {
        let backing = std::mem::replace(&mut self.backing, Backing::Disabled);

        if let Backing::File { path, buf } = backing {
            if !self.exported {
                return;
            }

            let header = read_file_header(&buf);
            if header.gpu_num == 0 || !record_fits(buf.len(), header.gpu_num - 1) {
                log::warn!("live update file size incorrect");
                return;
            }

            let size = FILE_HEADER_SIZE + header.gpu_num as usize * RECORD_SIZE;
            if let Err(e) = std::fs::write(&path, &buf[..size]) {
                log::warn!("live update file write failure: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use giv_core::pci::{
        BarRegion, MappedBar, PCI_EXT_CAP_ID_SRIOV, PCI_SRIOV_CTRL, PCI_SRIOV_CTRL_MSE,
        PCI_SRIOV_CTRL_VFE,
    };
    use giv_core::{Bdf, FaultCode, FaultRing, GivError};

    use super::*;
    use crate::blob::{
        default_capacity, read_record, write_file_header, write_record, RecordHeader,
        HEADER_VERSION, REC_OFF_SIZE, REC_PAYLOAD_OFFSET,
    };

    const SRIOV_CAP_POS: u16 = 0x160;

    struct MockPf {
        bdf: Bdf,
        sriov_on: bool,
        config: Mutex<HashMap<u16, u32>>,
    }

    impl MockPf {
        fn new(bdf: Bdf, sriov_on: bool) -> Self {
            Self {
                bdf,
                sriov_on,
                config: Mutex::new(HashMap::new()),
            }
        }

        fn set_scratch(&self, offset: u16, value: u32) {
            self.config.lock().unwrap().insert(offset, value);
        }

        fn scratch(&self, offset: u16) -> u32 {
            self.config.lock().unwrap().get(&offset).copied().unwrap_or(0)
        }
    }

    impl PciFunction for MockPf {
        fn bdf(&self) -> Bdf {
            self.bdf
        }
        fn vendor_id(&self) -> u16 {
            0x1002
        }
        fn device_id(&self) -> u16 {
            0x74a0
        }
        fn revision_id(&self) -> u8 {
            0
        }
        fn subsystem_vendor_id(&self) -> u16 {
            0x1002
        }
        fn subsystem_device_id(&self) -> u16 {
            0
        }
        fn find_ext_capability(&self, cap_id: u16) -> Option<u16> {
            (cap_id == PCI_EXT_CAP_ID_SRIOV).then_some(SRIOV_CAP_POS)
        }
        fn read_config_word(&self, offset: u16) -> Result<u16, GivError> {
            Ok(self.read_config_dword(offset)? as u16)
        }
        fn read_config_dword(&self, offset: u16) -> Result<u32, GivError> {
            if offset == SRIOV_CAP_POS + PCI_SRIOV_CTRL {
                return Ok(if self.sriov_on {
                    PCI_SRIOV_CTRL_VFE | PCI_SRIOV_CTRL_MSE
                } else {
                    0
                });
            }
            Ok(self.scratch(offset))
        }
        fn write_config_dword(&self, offset: u16, value: u32) -> Result<(), GivError> {
            self.config.lock().unwrap().insert(offset, value);
            Ok(())
        }
        fn bar_region(&self, _index: usize) -> Option<BarRegion> {
            None
        }
        fn map_bar(&self, index: usize) -> Result<MappedBar, GivError> {
            Err(GivError::ResourceMapping {
                bdf: self.bdf,
                index,
            })
        }
        fn enable(&self) -> Result<(), GivError> {
            Ok(())
        }
        fn disable(&self) {}
        fn set_master(&self) {}
        fn is_enabled(&self) -> bool {
            false
        }
        fn upstream_bridge(&self) -> Option<Arc<dyn PciFunction>> {
            None
        }
    }

    struct VecWindow {
        phys_addr: u64,
        buf: Vec<u8>,
    }

    impl StateWindow for VecWindow {
        fn phys_addr(&self) -> u64 {
            self.phys_addr
        }
        fn bytes(&self) -> &[u8] {
            &self.buf
        }
        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.buf
        }
    }

    fn seal_record(buf: &mut [u8], idx: u32, bdf: u32, num_vf: u32) {
        let rec = RecordHeader {
            idx,
            hash: 0,
            hash_addr: SCRATCH_HASH_ADDR,
            size: (REC_PAYLOAD_OFFSET - REC_OFF_SIZE) as u32 + 128,
            bdf,
            num_vf,
            accelerator_partition_mode: num_vf,
            memory_partition_mode: 1,
            partition_full_access_enable: 1,
        };
        write_record(buf, idx, &rec);
        let crc = record_crc(buf, idx).expect("crc region");
        stamp_record_hash(buf, idx, crc);
    }

    fn valid_blob_file(dir: &std::path::Path, version: u32, bdfs: &[u32]) -> std::path::PathBuf {
        let mut buf = vec![0u8; default_capacity()];
        write_file_header(&mut buf, version, bdfs.len() as u32);
        for (i, bdf) in bdfs.iter().enumerate() {
            seal_record(&mut buf, i as u32, *bdf, 4);
        }
        let path = dir.join("giv_live_data");
        std::fs::write(&path, &buf).expect("write blob");
        path
    }

    fn base_opt() -> InitOptions {
        InitOptions::default()
    }

    #[test]
    fn test_disabled_backend_is_plain_boot() {
        let mut mgr = LiveUpdateManager::disabled();
        let dev = MockPf::new(Bdf::new(0, 0x41, 0, 0), true);
        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 0, &mut opt, None), ImportStatus::Ok);
        assert!(!opt.skip_hw_init);
        assert_eq!(opt.live_record, None);
    }

    #[test]
    fn test_missing_file_cold_boot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = LiveUpdateManager::file_backed(dir.path().join("absent"));
        assert!(mgr.is_file_backed());
        assert!(!mgr.is_valid_crc());

        let dev = MockPf::new(Bdf::new(0, 0x41, 0, 0), false);
        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 0, &mut opt, None), ImportStatus::Ok);
        assert!(!opt.skip_hw_init);
    }

    #[test]
    fn test_invalid_data_with_sriov_enabled_is_corrupted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = LiveUpdateManager::file_backed(dir.path().join("absent"));
        let ring = FaultRing::new();

        let dev = MockPf::new(Bdf::new(0, 0x41, 0, 0), true);
        let mut opt = base_opt();
        assert_eq!(
            mgr.import(&dev, 0, &mut opt, Some(&ring)),
            ImportStatus::Corrupted
        );
        assert_eq!(ring.read().expect("fault").code, FaultCode::LiveUpdateCorrupted);

        // once rejected, every later import is rejected too
        let dev2 = MockPf::new(Bdf::new(0, 0x61, 0, 0), false);
        let mut opt2 = base_opt();
        assert_eq!(mgr.import(&dev2, 1, &mut opt2, None), ImportStatus::Corrupted);
    }

    #[test]
    fn test_valid_data_without_sriov_is_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bdf = Bdf::new(0, 0x41, 0, 0);
        let path = valid_blob_file(dir.path(), HEADER_VERSION, &[bdf.0]);
        let mut mgr = LiveUpdateManager::file_backed(path);
        assert!(mgr.is_valid_crc());

        let ring = FaultRing::new();
        let dev = MockPf::new(bdf, false);
        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 0, &mut opt, Some(&ring)), ImportStatus::Ok);
        assert!(!opt.skip_hw_init);
        assert_eq!(ring.read().expect("fault").code, FaultCode::LiveUpdateStale);
    }

    #[test]
    fn test_warm_restart_match_applies_persisted_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bdf = Bdf::new(0, 0x41, 0, 0);
        let path = valid_blob_file(dir.path(), HEADER_VERSION, &[0x9999, bdf.0]);
        let mut mgr = LiveUpdateManager::file_backed(path);

        let dev = MockPf::new(bdf, true);
        dev.set_scratch(SCRATCH_HASH_ADDR as u16, read_record(mgr.bytes(), 1).hash);

        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 1, &mut opt, None), ImportStatus::Ok);
        assert!(opt.skip_hw_init);
        assert_eq!(opt.live_record, Some(1));
        assert_eq!(opt.total_vf_num, 4);
        assert_eq!(opt.accelerator_partition_mode, 4);
        assert_eq!(opt.memory_partition_mode, 1);
        assert!(opt.partition_full_access_enable);
        // scratch register is single-use: cleared after the read
        assert_eq!(dev.scratch(SCRATCH_HASH_ADDR as u16), 0);
    }

    #[test]
    fn test_masked_bdf_match_and_hash_mismatch_still_proceed() {
        let dir = tempfile::tempdir().expect("tempdir");
        // stored without domain, probed with domain 2
        let stored = Bdf::new(0, 0x41, 0, 0);
        let probed = Bdf::new(2, 0x41, 0, 0);
        let path = valid_blob_file(dir.path(), HEADER_VERSION, &[stored.0]);
        let mut mgr = LiveUpdateManager::file_backed(path);

        let dev = MockPf::new(probed, true);
        dev.set_scratch(SCRATCH_HASH_ADDR as u16, 0xdead_beef);

        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 0, &mut opt, None), ImportStatus::Ok);
        assert!(opt.skip_hw_init);
        assert_eq!(opt.live_record, Some(0));
    }

    #[test]
    fn test_no_matching_record_rejects_blob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = valid_blob_file(dir.path(), HEADER_VERSION, &[Bdf::new(0, 0x41, 0, 0).0]);
        let mut mgr = LiveUpdateManager::file_backed(path);

        let dev = MockPf::new(Bdf::new(0, 0x61, 0, 0), true);
        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 0, &mut opt, None), ImportStatus::Corrupted);
        assert!(!opt.skip_hw_init);
    }

    #[test]
    fn test_pre_2_0_header_backfills_partition_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bdf = Bdf::new(0, 0x41, 0, 0);
        let mut buf = vec![0u8; default_capacity()];
        write_file_header(&mut buf, pack_version(2, 0), 1);
        let mut rec = RecordHeader {
            hash_addr: SCRATCH_HASH_ADDR,
            size: (REC_PAYLOAD_OFFSET - REC_OFF_SIZE) as u32,
            bdf: bdf.0,
            num_vf: 8,
            ..Default::default()
        };
        write_record(&mut buf, 0, &rec);
        rec.hash = record_crc(&buf, 0).expect("crc");
        stamp_record_hash(&mut buf, 0, rec.hash);
        let path = dir.path().join("giv_live_data");
        std::fs::write(&path, &buf).expect("write blob");

        let mut mgr = LiveUpdateManager::file_backed(path);
        let dev = MockPf::new(bdf, true);
        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 0, &mut opt, None), ImportStatus::Ok);
        assert_eq!(opt.total_vf_num, 8);
        assert_eq!(opt.memory_partition_mode, MEMORY_PARTITION_NPS1);
        assert_eq!(opt.accelerator_partition_mode, 8);
        assert!(opt.partition_full_access_enable);
    }

    #[test]
    fn test_memory_window_misaligned_falls_back_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let window = Box::new(VecWindow {
            phys_addr: 0x1000, // not 1MB aligned
            buf: vec![0u8; default_capacity()],
        });
        let mgr = LiveUpdateManager::memory_backed(window, &dir.path().join("fallback"));
        assert!(mgr.is_file_backed());
    }

    #[test]
    fn test_memory_window_too_small_falls_back_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let window = Box::new(VecWindow {
            phys_addr: 0x10_0000,
            buf: vec![0u8; RECORD_SIZE],
        });
        let mgr = LiveUpdateManager::memory_backed(window, &dir.path().join("fallback"));
        assert!(mgr.is_file_backed());
    }

    #[test]
    fn test_memory_window_accepted_when_aligned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let window = Box::new(VecWindow {
            phys_addr: 0x10_0000,
            buf: vec![0u8; FILE_HEADER_SIZE + 2 * RECORD_SIZE],
        });
        let mgr = LiveUpdateManager::memory_backed(window, &dir.path().join("fallback"));
        assert!(mgr.is_memory_backed());
    }

    #[test]
    fn test_export_skipped_wipes_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bdf = Bdf::new(0, 0x41, 0, 0);
        let path = valid_blob_file(dir.path(), HEADER_VERSION, &[bdf.0]);
        let mut mgr = LiveUpdateManager::file_backed(path);
        assert!(mgr.is_valid_crc());

        let dev = MockPf::new(bdf, true);
        let fini = FiniOptions {
            skip_hw_fini: false,
            export_status: false,
        };
        mgr.export(&dev, 0, &base_opt(), &fini, 1);
        assert!(!mgr.exported());
        assert!(!read_file_header(mgr.bytes()).signature_ok);
        // records survive the wipe
        assert_eq!(read_record(mgr.bytes(), 0).bdf, bdf.0);
    }

    #[test]
    fn test_fini_without_export_leaves_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("giv_live_data");
        let mut mgr = LiveUpdateManager::file_backed(&path);
        mgr.fini();
        assert!(!path.exists());
        assert!(mgr.is_disabled());
    }

    #[test]
    fn test_export_fini_import_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("giv_live_data");
        let bdf = Bdf::new(0, 0x41, 0, 0);

        // unload side: export one GPU, flush on fini
        {
            let mut mgr = LiveUpdateManager::file_backed(&path);
            let dev = MockPf::new(bdf, true);
            let opt = InitOptions {
                total_vf_num: 12,
                accelerator_partition_mode: 4,
                memory_partition_mode: 1,
                partition_full_access_enable: true,
                ..Default::default()
            };
            let fini = FiniOptions {
                skip_hw_fini: true,
                export_status: true,
            };
            mgr.export(&dev, 0, &opt, &fini, 1);
            assert!(mgr.exported());
            assert_eq!(dev.scratch(SCRATCH_HASH_ADDR as u16), read_record(mgr.bytes(), 0).hash);
            mgr.fini();
        }
        assert!(path.exists());

        // reload side: fresh manager validates and matches by bdf
        let mut mgr = LiveUpdateManager::file_backed(&path);
        assert!(mgr.is_valid_crc());

        let dev = MockPf::new(bdf, true);
        let mut opt = base_opt();
        assert_eq!(mgr.import(&dev, 0, &mut opt, None), ImportStatus::Ok);
        assert!(opt.skip_hw_init);
        assert_eq!(opt.live_record, Some(0));
        assert_eq!(opt.total_vf_num, 12);
    }

    #[test]
    fn test_record_mut_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = LiveUpdateManager::file_backed(dir.path().join("absent"));
        assert!(mgr.record_mut(0).is_some());
        assert!(mgr.record_mut((giv_core::MAX_GPU - 1) as u32).is_some());
        assert!(mgr.record_mut(giv_core::MAX_GPU as u32).is_none());
        assert!(LiveUpdateManager::disabled().record_mut(0).is_none());
    }
}
