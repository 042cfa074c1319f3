//! PCI 设备抽象
//!
//! 为上层 orchestrator 提供 PCI 物理功能（PF）的最小能力接口：
//! 配置空间访问、BAR 映射、SR-IOV 扩展能力查询。
//! 真实实现由宿主 OS 层提供，测试使用 mock。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::GivError;

/// 受管 GPU 及其板载桥的厂商 ID
pub const PCI_VENDOR_ID_GPU: u16 = 0x1002;

/// SR-IOV 扩展能力 ID
pub const PCI_EXT_CAP_ID_SRIOV: u16 = 0x0010;
/// SR-IOV 控制寄存器偏移（相对能力起点）
pub const PCI_SRIOV_CTRL: u16 = 0x08;
/// VF Enable
pub const PCI_SRIOV_CTRL_VFE: u32 = 0x01;
/// VF Memory Space Enable
pub const PCI_SRIOV_CTRL_MSE: u32 = 0x08;
/// First VF offset
pub const PCI_SRIOV_VF_OFFSET: u16 = 0x14;
/// VF stride
pub const PCI_SRIOV_VF_STRIDE: u16 = 0x16;
/// VF device ID
pub const PCI_SRIOV_VF_DID: u16 = 0x1a;

/// 帧缓冲 BAR 索引
pub const BAR_FB: usize = 0;
/// 门铃 BAR 索引
pub const BAR_DOORBELL: usize = 2;
/// I/O 端口 BAR 索引（可选）
pub const BAR_IO: usize = 4;
/// 寄存器 MMIO BAR 索引
pub const BAR_MMIO: usize = 5;

/// PCI Bus:Device.Function 地址，打包为单个 u32
///
/// 布局: domain(16) | bus(8) | dev(5) | fn(3)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Bdf(pub u32);

impl Bdf {
    pub fn new(domain: u16, bus: u8, dev: u8, func: u8) -> Self {
        Bdf((domain as u32) << 16
            | (bus as u32) << 8
            | ((dev as u32) & 0x1f) << 3
            | (func as u32) & 0x7)
    }

    pub fn domain(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn dev(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn func(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    /// 去掉 domain 的 16 位形式（跨 domain 重编号时用于身份比较）
    pub fn masked16(&self) -> u32 {
        self.0 & 0xffff
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain(),
            self.bus(),
            self.dev(),
            self.func()
        )
    }
}

impl fmt::Debug for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bdf({})", self)
    }
}

impl FromStr for Bdf {
    type Err = GivError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || GivError::InvalidAddress(s.to_string());

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(bad());
        }

        let domain = u16::from_str_radix(parts[0], 16).map_err(|_| bad())?;
        let bus = u8::from_str_radix(parts[1], 16).map_err(|_| bad())?;

        let dev_func: Vec<&str> = parts[2].split('.').collect();
        if dev_func.len() != 2 {
            return Err(bad());
        }

        let dev = u8::from_str_radix(dev_func[0], 16).map_err(|_| bad())?;
        let func = u8::from_str_radix(dev_func[1], 16).map_err(|_| bad())?;

        Ok(Bdf::new(domain, bus, dev, func))
    }
}

/// BAR 描述的物理窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarRegion {
    pub phys_addr: u64,
    pub size: u64,
}

/// 已映射的 BAR，drop 时自动解除映射
///
/// probe 路径上的每个资源都以作用域方式持有，任何失败分支
/// 只回收已经拿到的部分。
pub struct MappedBar {
    region: BarRegion,
    index: usize,
    unmap: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl MappedBar {
    pub fn new(
        region: BarRegion,
        index: usize,
        unmap: Option<Box<dyn FnOnce() + Send + Sync>>,
    ) -> Self {
        Self {
            region,
            index,
            unmap,
        }
    }

    pub fn region(&self) -> BarRegion {
        self.region
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap();
        }
    }
}

impl fmt::Debug for MappedBar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBar")
            .field("index", &self.index)
            .field("region", &self.region)
            .finish()
    }
}

/// PCI 物理功能的能力接口
///
/// 对应宿主内核的 pci_dev。核心层只依赖该接口，从不实现它。
pub trait PciFunction: Send + Sync {
    fn bdf(&self) -> Bdf;
    fn vendor_id(&self) -> u16;
    fn device_id(&self) -> u16;
    fn revision_id(&self) -> u8;
    fn subsystem_vendor_id(&self) -> u16;
    fn subsystem_device_id(&self) -> u16;

    /// 查找扩展能力，返回其配置空间偏移
    fn find_ext_capability(&self, cap_id: u16) -> Option<u16>;

    fn read_config_word(&self, offset: u16) -> Result<u16, GivError>;
    fn read_config_dword(&self, offset: u16) -> Result<u32, GivError>;
    fn write_config_dword(&self, offset: u16, value: u32) -> Result<(), GivError>;

    /// 查询 BAR 物理窗口，未实现的 BAR 返回 None
    fn bar_region(&self, index: usize) -> Option<BarRegion>;

    /// 映射 BAR，失败返回 ResourceMapping 类错误
    fn map_bar(&self, index: usize) -> Result<MappedBar, GivError>;

    fn enable(&self) -> Result<(), GivError>;
    fn disable(&self);
    fn set_master(&self);

    /// 该功能当前是否被持有（VF 在用检查）
    fn is_enabled(&self) -> bool;

    /// 上游桥，根节点返回 None
    fn upstream_bridge(&self) -> Option<Arc<dyn PciFunction>>;
}

/// 按 BDF 解析 PCI 功能（对应 pci_get_domain_bus_and_slot）
pub trait PciTopology: Send + Sync {
    fn function_at(&self, bdf: Bdf) -> Option<Arc<dyn PciFunction>>;
}

/// 读取 SR-IOV 控制寄存器，VFE 与 MSE 同时置位才视为已使能
pub fn sriov_enabled(dev: &dyn PciFunction) -> bool {
    let Some(pos) = dev.find_ext_capability(PCI_EXT_CAP_ID_SRIOV) else {
        return false;
    };

    match dev.read_config_dword(pos + PCI_SRIOV_CTRL) {
        Ok(ctrl) => {
            (ctrl & (PCI_SRIOV_CTRL_VFE | PCI_SRIOV_CTRL_MSE))
                == (PCI_SRIOV_CTRL_VFE | PCI_SRIOV_CTRL_MSE)
        }
        Err(_) => false,
    }
}
