//! Unified error type for the GIV shim.

use thiserror::Error;

use crate::pci::Bdf;

/// Errors surfaced by the shim core.
///
/// Probe-path variants are per-GPU: they abort a single worker and never
/// propagate to sibling devices.
#[derive(Error, Debug)]
pub enum GivError {
    #[error("invalid PCI address: {0}")]
    InvalidAddress(String),

    #[error("no PCI function at {0}")]
    FunctionNotFound(Bdf),

    #[error("config space access failed at {bdf} offset {offset:#x}")]
    ConfigAccess { bdf: Bdf, offset: u16 },

    #[error("BAR {index} mapping failed on {bdf}")]
    ResourceMapping { bdf: Bdf, index: usize },

    #[error("failed to enable PCI function {0}")]
    PciEnable(Bdf),

    #[error("no SR-IOV capability on {0}")]
    NoSriovSupport(Bdf),

    #[error("GPU limit of {0} devices reached")]
    TooManyDevices(usize),

    #[error("engine device init failed for {0}")]
    EngineInit(Bdf),

    #[error("VF {index} of {bdf} could not be resolved")]
    VfResolution { bdf: Bdf, index: u32 },

    #[error("live update data corrupted")]
    LiveUpdateCorrupted,

    #[error("live update data is stale")]
    LiveUpdateStale,

    #[error("config value out of range for {key}: {value}")]
    ConfigOutOfRange { key: &'static str, value: i64 },

    #[error("config store parse failure: {0}")]
    ConfigParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GivError>;
