//! 持久化配置存取与快照合并
//!
//! 每个可调项带一组 {min, default, max} 编译期边界。越界值
//! 一律收敛到默认值并告警，从不拒绝加载（probe 不能因配置挂掉）。
//!
//! 存储后端是键值对：toml 文件（数组按 GPU 索引展开）或测试用内存表。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::engine::{InitOptions, MAX_VF};
use crate::error::{GivError, Result};
use crate::faultlog::{put_error, FaultCode, FaultRing};

/// NPS1 内存分区模式（默认）
pub const MEMORY_PARTITION_NPS1: u32 = 1;

/// 一个可调项的编译期边界
#[derive(Debug, Clone, Copy)]
pub struct Tunable {
    pub key: &'static str,
    pub min: i64,
    pub default: i64,
    pub max: i64,
}

pub const VF_NUM: Tunable = Tunable {
    key: "vf_num",
    min: 1,
    default: 1,
    max: MAX_VF as i64,
};
pub const SCH_POLICY: Tunable = Tunable {
    key: "sch_policy",
    min: 0,
    default: 0,
    max: 7,
};
pub const FW_LOAD_TYPE: Tunable = Tunable {
    key: "fw_load_type",
    min: 0,
    default: 0,
    max: 3,
};
pub const LOG_LEVEL: Tunable = Tunable {
    key: "log_level",
    min: 0,
    default: 2,
    max: 6,
};
pub const PERF_MON_ENABLE: Tunable = Tunable {
    key: "perf_mon_enable",
    min: 0,
    default: 0,
    max: 1,
};
pub const FULLACCESS_TIMEOUT: Tunable = Tunable {
    key: "fullaccess_timeout",
    min: 0,
    default: 0,
    max: 500_000,
};
pub const MEMORY_PARTITION_MODE: Tunable = Tunable {
    key: "memory_partition_mode",
    min: 1,
    default: MEMORY_PARTITION_NPS1 as i64,
    max: 8,
};
pub const ACCELERATOR_PARTITION_MODE: Tunable = Tunable {
    key: "accelerator_partition_mode",
    min: 0,
    default: 0,
    max: 8,
};
pub const PARTITION_FULL_ACCESS_ENABLE: Tunable = Tunable {
    key: "partition_full_access_enable",
    min: 0,
    default: 1,
    max: 1,
};
pub const RAS_VF_TELEMETRY_POLICY: Tunable = Tunable {
    key: "ras_vf_telemetry_policy",
    min: 0,
    default: 0,
    max: 2,
};
pub const PF_FB_SIZE_MB: Tunable = Tunable {
    key: "pf_fb_size_mb",
    min: 0,
    default: 256,
    max: 4096,
};

impl Tunable {
    /// 越界收敛到默认值，告警 + 环形缓冲记录
    pub fn clamp(&self, value: i64, faults: Option<&FaultRing>) -> i64 {
        if value < self.min || value > self.max {
            log::warn!(
                "config {} = {} out of range [{}, {}], change to default value: {}",
                self.key,
                value,
                self.min,
                self.max,
                self.default
            );
            put_error(faults, FaultCode::ConfigOutOfRange, value as u64);
            return self.default;
        }
        value
    }
}

/// 持久化键值存储；per-GPU 数组键按索引取值
pub trait ConfigStore: Send + Sync {
    fn get(&self, gpu_index: u32, key: &str) -> Option<i64>;

    /// 回写全局值（live update import 后恢复持久化配置用）
    fn set(&self, key: &str, value: i64) -> Result<()>;
}

/// 测试 / 内嵌场景的内存存储
#[derive(Default)]
pub struct MemConfigStore {
    values: Mutex<HashMap<String, Vec<i64>>>,
}

impl MemConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, values: &[i64]) -> Self {
        self.values.lock().insert(key.to_string(), values.to_vec());
        self
    }
}

impl ConfigStore for MemConfigStore {
    fn get(&self, gpu_index: u32, key: &str) -> Option<i64> {
        let values = self.values.lock();
        let row = values.get(key)?;
        row.get(gpu_index as usize).or_else(|| row.first()).copied()
    }

    fn set(&self, key: &str, value: i64) -> Result<()> {
        self.values.lock().insert(key.to_string(), vec![value]);
        Ok(())
    }
}

/// toml 文件存储
///
/// 标量键对所有 GPU 生效，数组键按 GPU 索引取值（越界取第 0 项）。
pub struct TomlConfigStore {
    path: PathBuf,
    values: Mutex<HashMap<String, Vec<i64>>>,
}

impl TomlConfigStore {
    pub fn load(path: &Path) -> Result<Self> {
        let mut values = HashMap::new();

        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let table: toml::Table = text
                .parse()
                .map_err(|e: toml::de::Error| GivError::ConfigParse(e.to_string()))?;

            for (key, value) in table {
                match value {
                    toml::Value::Integer(v) => {
                        values.insert(key, vec![v]);
                    }
                    toml::Value::Array(arr) => {
                        let row: Vec<i64> =
                            arr.iter().filter_map(|v| v.as_integer()).collect();
                        if row.len() != arr.len() {
                            return Err(GivError::ConfigParse(format!(
                                "non-integer entry in array option {}",
                                key
                            )));
                        }
                        values.insert(key, row);
                    }
                    other => {
                        return Err(GivError::ConfigParse(format!(
                            "unsupported value for {}: {}",
                            key, other
                        )));
                    }
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    fn flush_locked(&self, values: &HashMap<String, Vec<i64>>) -> Result<()> {
        let mut table = toml::Table::new();
        for (key, row) in values {
            let value = if row.len() == 1 {
                toml::Value::Integer(row[0])
            } else {
                toml::Value::Array(row.iter().map(|v| toml::Value::Integer(*v)).collect())
            };
            table.insert(key.clone(), value);
        }
        std::fs::write(&self.path, table.to_string())?;
        Ok(())
    }
}

impl ConfigStore for TomlConfigStore {
    fn get(&self, gpu_index: u32, key: &str) -> Option<i64> {
        let values = self.values.lock();
        let row = values.get(key)?;
        row.get(gpu_index as usize).or_else(|| row.first()).copied()
    }

    fn set(&self, key: &str, value: i64) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), vec![value]);
        self.flush_locked(&values)
    }
}

/// 模块级覆盖，probe 时叠加在持久化配置之上
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub vf_num: Option<i64>,
    pub sched_policy: Option<i64>,
    pub log_level: Option<i64>,
    pub perf_mon_enable: Option<i64>,
}

/// 配置快照合并
pub struct ConfigSnapshot;

impl ConfigSnapshot {
    /// 读取该 GPU 的全部可调项，叠加模块覆盖，逐项夹取，产出 InitOptions
    pub fn merge(
        store: &dyn ConfigStore,
        gpu_index: u32,
        overrides: &ConfigOverrides,
        faults: Option<&FaultRing>,
    ) -> InitOptions {
        let fetch = |t: &Tunable, over: Option<i64>| -> i64 {
            let raw = over
                .or_else(|| store.get(gpu_index, t.key))
                .unwrap_or(t.default);
            t.clamp(raw, faults)
        };

        InitOptions {
            total_vf_num: fetch(&VF_NUM, overrides.vf_num) as u32,
            sched_policy: fetch(&SCH_POLICY, overrides.sched_policy) as u32,
            fw_load_type: fetch(&FW_LOAD_TYPE, None) as u32,
            log_level: fetch(&LOG_LEVEL, overrides.log_level) as u32,
            perf_mon_enable: fetch(&PERF_MON_ENABLE, overrides.perf_mon_enable) != 0,
            fullaccess_timeout: fetch(&FULLACCESS_TIMEOUT, None) as u32,
            memory_partition_mode: fetch(&MEMORY_PARTITION_MODE, None) as u32,
            accelerator_partition_mode: fetch(&ACCELERATOR_PARTITION_MODE, None) as u32,
            partition_full_access_enable: fetch(&PARTITION_FULL_ACCESS_ENABLE, None) != 0,
            ras_vf_telemetry_policy: fetch(&RAS_VF_TELEMETRY_POLICY, None) as u32,
            pf_fb_size_mb: fetch(&PF_FB_SIZE_MB, None) as u32,
            skip_hw_init: false,
            live_record: None,
        }
    }
}
