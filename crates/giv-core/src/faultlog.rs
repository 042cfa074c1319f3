//! 故障环形缓冲
//!
//! 进程级固定容量循环日志，管理面通过 read 消费。
//! 环形缓冲只是日志的补充，put_error 总是同时输出可读日志行。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// 容量必须是 2 的幂，槽位索引 = 计数 & (N-1)
pub const FAULT_RING_CAPACITY: usize = 128;

const IDX_MASK: u32 = (FAULT_RING_CAPACITY as u32) - 1;

/// 故障码
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum FaultCode {
    ResourceMapping,
    PciEnable,
    NoSriovSupport,
    EngineInit,
    VfResolution,
    LiveUpdateCorrupted,
    LiveUpdateStale,
    ConfigOutOfRange,
    /// read 侧合成：data 为被覆盖的未读条目数
    BufferOverflow,
}

impl FaultCode {
    pub fn describe(&self) -> &'static str {
        match self {
            FaultCode::ResourceMapping => "cannot map PCI resource",
            FaultCode::PciEnable => "cannot enable PCI device",
            FaultCode::NoSriovSupport => "device has no SR-IOV support",
            FaultCode::EngineInit => "engine device init failed",
            FaultCode::VfResolution => "cannot resolve VF PCI device",
            FaultCode::LiveUpdateCorrupted => "live update data is corrupted",
            FaultCode::LiveUpdateStale => "live update data is stale",
            FaultCode::ConfigOutOfRange => "config value out of range",
            FaultCode::BufferOverflow => "fault ring buffer overflow",
        }
    }
}

/// 一条故障记录，可直接序列化给管理面消费
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct FaultEntry {
    /// 微秒时间戳
    pub timestamp_us: u64,
    pub code: FaultCode,
    pub data: u64,
}

impl FaultEntry {
    fn now(code: FaultCode, data: u64) -> Self {
        Self {
            timestamp_us: chrono::Utc::now().timestamp_micros() as u64,
            code,
            data,
        }
    }
}

const EMPTY_SLOT: FaultEntry = FaultEntry {
    timestamp_us: 0,
    code: FaultCode::BufferOverflow,
    data: 0,
};

/// 进程级故障环形缓冲
///
/// 写计数在 slot 锁内推进（Release），读侧在拿读锁之前采样写计数。
/// 写入从不因为“满”而阻塞或失败，最老的未读条目允许被覆盖；
/// 覆盖发生时 read 合成一条 BufferOverflow 记录并跳过失效槽位。
pub struct FaultRing {
    write_count: AtomicU32,
    /// 读游标，串行化所有读者
    read_cursor: Mutex<u32>,
    /// 槽位数组，串行化所有写者
    slots: Mutex<Box<[FaultEntry; FAULT_RING_CAPACITY]>>,
}

impl FaultRing {
    pub fn new() -> Self {
        Self {
            write_count: AtomicU32::new(0),
            read_cursor: Mutex::new(0),
            slots: Mutex::new(Box::new([EMPTY_SLOT; FAULT_RING_CAPACITY])),
        }
    }

    /// 写入一条记录，覆盖写，从不失败
    pub fn write(&self, entry: FaultEntry) {
        let mut slots = self.slots.lock();
        let wc = self.write_count.load(Ordering::Relaxed);
        slots[(wc & IDX_MASK) as usize] = entry;
        self.write_count.store(wc.wrapping_add(1), Ordering::Release);
    }

    /// 取出最老的未读记录
    ///
    /// 写计数在拿读锁之前采样。若在采样与消费之间发生覆盖，
    /// 损坏会在下一次 read 里以 overflow 记录的形式报告出来。
    pub fn read(&self) -> Option<FaultEntry> {
        let write_count = self.write_count.load(Ordering::Acquire);

        let mut cursor = self.read_cursor.lock();

        let backlog = write_count.wrapping_sub(*cursor);
        if backlog == 0 {
            return None;
        }

        if backlog > FAULT_RING_CAPACITY as u32 {
            let lost = backlog - FAULT_RING_CAPACITY as u32;
            *cursor = write_count.wrapping_sub(FAULT_RING_CAPACITY as u32);
            return Some(FaultEntry::now(FaultCode::BufferOverflow, lost as u64));
        }

        let entry = self.slots.lock()[(*cursor & IDX_MASK) as usize];
        *cursor = cursor.wrapping_add(1);
        Some(entry)
    }
}

impl Default for FaultRing {
    fn default() -> Self {
        Self::new()
    }
}

/// 记录一条故障：打时间戳，尽力写环形缓冲（缓冲可以不存在），
/// 并无条件输出一条人类可读日志。
pub fn put_error(ring: Option<&FaultRing>, code: FaultCode, data: u64) {
    let entry = FaultEntry::now(code, data);

    if let Some(ring) = ring {
        ring.write(entry);
    }

    log::error!("[giv] {} (code={:?}, data={:#x})", code.describe(), code, data);
}
