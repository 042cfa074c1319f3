//! 状态 blob 的位级布局
//!
//! 文件 / 内存窗口共用同一份布局：
//!
//! ```text
//! [ file header ][ record 0 ][ record 1 ] ... [ record MAX_GPU-1 ]
//! ```
//!
//! 所有整数为小端。总容量固定为 header + RECORD_SIZE × MAX_GPU，
//! 与实际在位的 GPU 数无关，保证文件格式在机群扩容时保持稳定。
//!
//! 文件头（24 字节）:
//!   signature[9]  @ 0    固定 ASCII 串 "GPU DATA\0"
//!   version  u32  @ 12   高 16 位 major | 低 16 位 minor
//!   gpu_num  u32  @ 16
//!   reserved      @ 20..24
//!
//! 记录槽（每槽 RECORD_SIZE = 1 MiB）:
//!   idx       u32 @ 0
//!   hash      u32 @ 4    CRC32，见下
//!   hash_addr u64 @ 8    暂存寄存器的配置空间偏移
//!   size      u32 @ 16   被哈希区域的字节数
//!   bdf       u32 @ 20
//!   num_vf    u32 @ 24   ┐
//!   accel     u32 @ 28   │ 持久化模块参数，热重启时
//!   mem_mode  u32 @ 32   │ 覆盖本次启动的配置快照
//!   full_acc  u32 @ 36   ┘
//!   payload       @ 40   引擎不透明工作状态
//!
//! CRC32 覆盖从记录自身 size 字段起的 size 个字节；size 字段
//! 之前的内容（idx/hash/hash_addr）不参与哈希。

use giv_core::MAX_GPU;

/// 固定签名，含结尾 NUL
pub const SIGNATURE: [u8; 9] = *b"GPU DATA\0";

pub const FILE_HEADER_SIZE: usize = 24;

/// 每个 GPU 的记录槽大小；内存窗口的物理地址必须按它对齐
pub const RECORD_SIZE: usize = 1 << 20;

pub const VERSION_MAJOR: u32 = 2;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_MAJOR_MASK: u32 = 0xffff_0000;

/// 暂存寄存器的默认配置空间偏移
pub const SCRATCH_HASH_ADDR: u64 = 0x108;

const OFF_VERSION: usize = 12;
const OFF_GPU_NUM: usize = 16;

pub const REC_OFF_IDX: usize = 0;
pub const REC_OFF_HASH: usize = 4;
pub const REC_OFF_HASH_ADDR: usize = 8;
pub const REC_OFF_SIZE: usize = 16;
pub const REC_OFF_BDF: usize = 20;
pub const REC_OFF_NUM_VF: usize = 24;
pub const REC_OFF_ACCEL_MODE: usize = 28;
pub const REC_OFF_MEM_MODE: usize = 32;
pub const REC_OFF_FULL_ACCESS: usize = 36;
/// 引擎工作状态区起点
pub const REC_PAYLOAD_OFFSET: usize = 40;

pub const fn pack_version(major: u32, minor: u32) -> u32 {
    (major << 16) | (minor & 0xffff)
}

/// 当前驱动编译出的头版本
pub const HEADER_VERSION: u32 = pack_version(VERSION_MAJOR, VERSION_MINOR);

/// 默认 blob 容量（与在位 GPU 数无关）
pub const fn default_capacity() -> usize {
    FILE_HEADER_SIZE + MAX_GPU * RECORD_SIZE
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub signature_ok: bool,
    pub version: u32,
    pub gpu_num: u32,
}

pub fn read_file_header(buf: &[u8]) -> FileHeader {
    if buf.len() < FILE_HEADER_SIZE {
        return FileHeader {
            signature_ok: false,
            version: 0,
            gpu_num: 0,
        };
    }
    FileHeader {
        signature_ok: buf[..SIGNATURE.len()] == SIGNATURE,
        version: get_u32(buf, OFF_VERSION),
        gpu_num: get_u32(buf, OFF_GPU_NUM),
    }
}

pub fn write_file_header(buf: &mut [u8], version: u32, gpu_num: u32) {
    buf[..SIGNATURE.len()].copy_from_slice(&SIGNATURE);
    put_u32(buf, OFF_VERSION, version);
    put_u32(buf, OFF_GPU_NUM, gpu_num);
}

/// 只清头部即可防止下次冷启动误读
pub fn wipe_file_header(buf: &mut [u8]) {
    let n = FILE_HEADER_SIZE.min(buf.len());
    for b in &mut buf[..n] {
        *b = 0;
    }
}

pub fn record_offset(idx: u32) -> usize {
    FILE_HEADER_SIZE + idx as usize * RECORD_SIZE
}

/// 容量是否足以放下第 idx 个记录槽
pub fn record_fits(buf_len: usize, idx: u32) -> bool {
    buf_len >= FILE_HEADER_SIZE + (idx as usize + 1) * RECORD_SIZE
}

/// 记录槽头部字段（payload 不在此列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    pub idx: u32,
    pub hash: u32,
    pub hash_addr: u64,
    pub size: u32,
    pub bdf: u32,
    pub num_vf: u32,
    pub accelerator_partition_mode: u32,
    pub memory_partition_mode: u32,
    pub partition_full_access_enable: u32,
}

pub fn read_record(buf: &[u8], idx: u32) -> RecordHeader {
    let off = record_offset(idx);
    RecordHeader {
        idx: get_u32(buf, off + REC_OFF_IDX),
        hash: get_u32(buf, off + REC_OFF_HASH),
        hash_addr: get_u64(buf, off + REC_OFF_HASH_ADDR),
        size: get_u32(buf, off + REC_OFF_SIZE),
        bdf: get_u32(buf, off + REC_OFF_BDF),
        num_vf: get_u32(buf, off + REC_OFF_NUM_VF),
        accelerator_partition_mode: get_u32(buf, off + REC_OFF_ACCEL_MODE),
        memory_partition_mode: get_u32(buf, off + REC_OFF_MEM_MODE),
        partition_full_access_enable: get_u32(buf, off + REC_OFF_FULL_ACCESS),
    }
}

pub fn write_record(buf: &mut [u8], idx: u32, rec: &RecordHeader) {
    let off = record_offset(idx);
    put_u32(buf, off + REC_OFF_IDX, rec.idx);
    put_u32(buf, off + REC_OFF_HASH, rec.hash);
    put_u64(buf, off + REC_OFF_HASH_ADDR, rec.hash_addr);
    put_u32(buf, off + REC_OFF_SIZE, rec.size);
    put_u32(buf, off + REC_OFF_BDF, rec.bdf);
    put_u32(buf, off + REC_OFF_NUM_VF, rec.num_vf);
    put_u32(buf, off + REC_OFF_ACCEL_MODE, rec.accelerator_partition_mode);
    put_u32(buf, off + REC_OFF_MEM_MODE, rec.memory_partition_mode);
    put_u32(buf, off + REC_OFF_FULL_ACCESS, rec.partition_full_access_enable);
}

/// 写入记录的 hash 字段
pub fn stamp_record_hash(buf: &mut [u8], idx: u32, hash: u32) {
    put_u32(buf, record_offset(idx) + REC_OFF_HASH, hash);
}

/// 按记录声明的 size 计算 CRC32
///
/// 区域从记录自身的 size 字段开始，长度为 size。
/// size 超出槽位或缓冲时返回 None。
pub fn record_crc(buf: &[u8], idx: u32) -> Option<u32> {
    let off = record_offset(idx);
    if buf.len() < off + REC_OFF_SIZE + 4 {
        return None;
    }

    let size = get_u32(buf, off + REC_OFF_SIZE) as usize;
    let start = off + REC_OFF_SIZE;
    if size < 4 || REC_OFF_SIZE + size > RECORD_SIZE || start + size > buf.len() {
        return None;
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[start..start + size]);
    Some(hasher.finalize())
}

/// blob 整体校验
///
/// 签名逐字节相等、头部 major 版本等于编译版本、gpu_num > 0、
/// 且前 gpu_num 个记录的 CRC32 全部与存储的 hash 一致。
/// 任何一项不满足都使整个 blob 无效。
///
/// 返回 (是否有效, 头部 gpu_num)。
pub fn validate(buf: &[u8]) -> (bool, u32) {
    let header = read_file_header(buf);
    if !header.signature_ok {
        return (false, header.gpu_num);
    }

    if header.version & VERSION_MAJOR_MASK != HEADER_VERSION & VERSION_MAJOR_MASK {
        return (false, header.gpu_num);
    }

    if header.gpu_num == 0 {
        return (false, 0);
    }

    for i in 0..header.gpu_num {
        if !record_fits(buf.len(), i) {
            return (false, header.gpu_num);
        }
        let stored = read_record(buf, i).hash;
        match record_crc(buf, i) {
            Some(crc) if crc == stored => {}
            _ => return (false, header.gpu_num),
        }
    }

    (true, header.gpu_num)
}
