//! 单元测试桩

use std::sync::Arc;

use giv_core::{BarRegion, Bdf, GivError, MappedBar, PciFunction};

struct NullFunction {
    bdf: Bdf,
}

impl PciFunction for NullFunction {
    fn bdf(&self) -> Bdf {
        self.bdf
    }
    fn vendor_id(&self) -> u16 {
        0
    }
    fn device_id(&self) -> u16 {
        0
    }
    fn revision_id(&self) -> u8 {
        0
    }
    fn subsystem_vendor_id(&self) -> u16 {
        0
    }
    fn subsystem_device_id(&self) -> u16 {
        0
    }
    fn find_ext_capability(&self, _cap_id: u16) -> Option<u16> {
        None
    }
    fn read_config_word(&self, offset: u16) -> Result<u16, GivError> {
        Err(GivError::ConfigAccess {
            bdf: self.bdf,
            offset,
        })
    }
    fn read_config_dword(&self, offset: u16) -> Result<u32, GivError> {
        Err(GivError::ConfigAccess {
            bdf: self.bdf,
            offset,
        })
    }
    fn write_config_dword(&self, offset: u16, _value: u32) -> Result<(), GivError> {
        Err(GivError::ConfigAccess {
            bdf: self.bdf,
            offset,
        })
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

pub fn null_function(bdf: Bdf) -> Arc<dyn PciFunction> {
    Arc::new(NullFunction { bdf })
}
