use serde::{Deserialize, Serialize};

use crate::common::Gas;

// Protocol parameters. Changing any of these is a network-wide upgrade.

pub const MAX_CALL_DEPTH: usize = 8;
pub const MAX_FRAMES: usize = 1024;
/// 64KiB pages.
pub const MAX_MEMORY_PAGES: u32 = 256;
pub const WASM_PAGE_SIZE: u64 = 0x10000;

/// Number of interpreter steps that make up one unit of gas.
pub const STEP_MULTIPLIER: u64 = 1024;
/// Extra steps charged on top of the single step of every host call.
pub const HOST_CALL_STEPS: u64 = 64;

pub const GAS_TRANSFER: Gas = 10;
pub const GAS_BUILTIN_CALL: Gas = 10;
pub const GAS_PAYLOAD_BYTE: Gas = 1;

/// Name of the constructor export. Never callable directly.
pub const INIT_METHOD: &str = "init";
/// Allocator export every module taking or returning pointer types must provide.
pub const MALLOC_EXPORT: &str = "__malloc";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_frames: usize,
    pub max_memory_pages: u32,
    pub step_multiplier: u64,
    pub host_call_steps: u64,
    /// Hard cap on steps regardless of gas; 0 disables it.
    pub max_steps: u64,
    pub transfer_gas: Gas,
    pub builtin_call_gas: Gas,
    pub payload_byte_gas: Gas,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: MAX_CALL_DEPTH,
            max_frames: MAX_FRAMES,
            max_memory_pages: MAX_MEMORY_PAGES,
            step_multiplier: STEP_MULTIPLIER,
            host_call_steps: HOST_CALL_STEPS,
            max_steps: 0,
            transfer_gas: GAS_TRANSFER,
            builtin_call_gas: GAS_BUILTIN_CALL,
            payload_byte_gas: GAS_PAYLOAD_BYTE,
        }
    }
}

impl VmConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        let config: Self = serde_json::from_str(s)?;
        if config.step_multiplier == 0 {
            return Err(serde::de::Error::custom(
                "stepMultiplier must be positive",
            ))
        }
        Ok(config)
    }
}

#[test]
fn test_config_from_json() {
    let c = VmConfig::from_json(r#"{"maxCallDepth": 4, "maxSteps": 100}"#)
        .unwrap();
    assert_eq!(c.max_call_depth, 4);
    assert_eq!(c.max_steps, 100);
    assert_eq!(c.step_multiplier, STEP_MULTIPLIER);
    assert_eq!(c.transfer_gas, GAS_TRANSFER);
    assert!(VmConfig::from_json(r#"{"stepMultiplier": 0}"#).is_err());
    assert_eq!(VmConfig::from_json("{}").unwrap(), VmConfig::default());
}
