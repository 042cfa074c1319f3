//! 设备登记表
//!
//! 登记表锁只保护表本身。遍历时先在锁内拷贝句柄快照，
//! 释放锁后再调引擎，引擎回调永远见不到登记表锁。

use std::sync::Arc;

use parking_lot::Mutex;

use giv_core::{Bdf, EngineHandle, GpuEngine, MAX_GPU};

use crate::device::DeviceContext;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<DeviceContext>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ctx: Arc<DeviceContext>) {
        let mut devices = self.devices.lock();
        devices.push(ctx);
        devices.sort_by_key(|d| d.gpu_index);
    }

    pub fn unregister(&self, bdf: Bdf) -> Option<Arc<DeviceContext>> {
        let mut devices = self.devices.lock();
        let pos = devices.iter().position(|d| d.bdf == bdf)?;
        Some(devices.remove(pos))
    }

    pub fn find(&self, bdf: Bdf) -> Option<Arc<DeviceContext>> {
        self.devices.lock().iter().find(|d| d.bdf == bdf).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// 锁内拷贝 Arc，锁外使用
    pub fn snapshot(&self) -> Vec<Arc<DeviceContext>> {
        self.devices.lock().clone()
    }

    /// 按 gpu_index 展开的引擎句柄邻接表
    pub fn adapt_list(&self) -> [Option<EngineHandle>; MAX_GPU] {
        let mut list = [None; MAX_GPU];
        for dev in self.devices.lock().iter() {
            if let Some(slot) = list.get_mut(dev.gpu_index as usize) {
                *slot = Some(dev.handle);
            }
        }
        list
    }

    /// 把最新邻接表推给每台在册设备；引擎调用发生在锁外
    pub fn broadcast_adapt_list(&self, engine: &dyn GpuEngine) {
        let list = self.adapt_list();
        for dev in self.snapshot() {
            engine.adapt_list_update(dev.handle, &list);
        }
    }
}
