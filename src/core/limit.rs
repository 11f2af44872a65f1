use log::trace;

use super::params::VmConfig;
use super::ExecError;
use crate::common::Gas;

/// Gas meter of one top-level transaction. Every frame of the call tree borrows the same instance,
/// so the budget is cumulative across nested calls.
///
/// Gas is `initial_gas + steps / multiplier`. The budget is checked at step granularity.
#[derive(Debug)]
pub struct Limit {
    steps: u64,
    step_budget: u64,
    initial_gas: Gas,
    gas_limit: Gas,
    multiplier: u64,
    host_call_steps: u64,
    max_steps: u64,
    max_pages: u32,
    max_frames: usize,
    frames: usize,
    unlimited: bool,
}

impl Limit {
    pub fn new(gas_limit: Gas, config: &VmConfig) -> Self {
        let mut limit = Self {
            steps: 0,
            step_budget: 0,
            initial_gas: 0,
            gas_limit,
            multiplier: config.step_multiplier.max(1),
            host_call_steps: config.host_call_steps,
            max_steps: config.max_steps,
            max_pages: config.max_memory_pages,
            max_frames: config.max_frames,
            frames: 0,
            unlimited: false,
        };
        limit.update_budget();
        limit
    }

    /// A meter that only enforces the memory and frame caps. Used for coinbase processing, which
    /// runs regardless of user-supplied gas.
    pub fn unlimited(config: &VmConfig) -> Self {
        let mut limit = Self::new(Gas::MAX, config);
        limit.unlimited = true;
        limit
    }

    fn update_budget(&mut self) {
        self.step_budget = self
            .gas_limit
            .saturating_sub(self.initial_gas)
            .saturating_mul(self.multiplier);
    }

    /// Charge the fixed per-byte cost of the transaction payload.
    pub fn set_initial_gas(
        &mut self, payload_size: usize, per_byte: Gas,
    ) -> Result<(), ExecError> {
        let gas = (payload_size as Gas)
            .checked_mul(per_byte)
            .ok_or(ExecError::GasIntOverflow)?;
        self.initial_gas = 0;
        self.add_gas(gas)
    }

    /// Charge a fixed amount of gas outside of interpretation.
    pub fn add_gas(&mut self, gas: Gas) -> Result<(), ExecError> {
        self.initial_gas = self
            .initial_gas
            .checked_add(gas)
            .ok_or(ExecError::GasIntOverflow)?;
        self.update_budget();
        if !self.unlimited && self.gas() > self.gas_limit {
            return Err(ExecError::OutOfGas)
        }
        Ok(())
    }

    fn charge(&mut self, steps: u64) -> Result<(), ExecError> {
        self.steps = self.steps.saturating_add(steps);
        if self.max_steps != 0 && self.steps > self.max_steps {
            return Err(ExecError::StepLimit)
        }
        if !self.unlimited && self.steps > self.step_budget {
            return Err(ExecError::OutOfGas)
        }
        Ok(())
    }

    #[inline(always)]
    pub fn on_instruction(&mut self) -> Result<(), ExecError> {
        self.charge(1)
    }

    #[inline]
    pub fn on_host_call(&mut self) -> Result<(), ExecError> {
        trace!("host call at step {}", self.steps);
        self.charge(1 + self.host_call_steps)
    }

    /// Check a memory size (in pages) the interpreter is about to commit to.
    pub fn on_memory_grow(&mut self, pages: u32) -> Result<(), ExecError> {
        if pages > self.max_pages {
            return Err(ExecError::MemoryLimit)
        }
        Ok(())
    }

    pub fn on_frame_enter(&mut self) -> Result<(), ExecError> {
        self.frames += 1;
        if self.frames > self.max_frames {
            return Err(ExecError::FrameLimit)
        }
        Ok(())
    }

    pub fn on_frame_exit(&mut self) {
        self.frames = self.frames.saturating_sub(1);
    }

    pub fn gas(&self) -> Gas {
        self.initial_gas.saturating_add(self.steps / self.multiplier)
    }

    /// Gas to bill. Never more than the limit, even when the abort overshoots it.
    pub fn gas_used(&self) -> Gas {
        if self.unlimited {
            return 0
        }
        self.gas().min(self.gas_limit)
    }

    pub fn gas_limit(&self) -> Gas {
        self.gas_limit
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VmConfig {
        VmConfig {
            step_multiplier: 4,
            host_call_steps: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_steps_to_gas() {
        let mut l = Limit::new(10, &config());
        for _ in 0..7 {
            l.on_instruction().unwrap();
        }
        assert_eq!(l.gas(), 1);
        l.on_host_call().unwrap();
        assert_eq!(l.steps(), 11);
        assert_eq!(l.gas(), 2);
    }

    #[test]
    fn test_budget() {
        let mut l = Limit::new(3, &config());
        l.set_initial_gas(2, 1).unwrap();
        // (3 - 2) * 4 steps left
        for _ in 0..4 {
            l.on_instruction().unwrap();
        }
        assert_eq!(l.on_instruction(), Err(ExecError::OutOfGas));
        assert!(l.gas_used() <= 3);
    }

    #[test]
    fn test_initial_gas_exceeds_limit() {
        let mut l = Limit::new(3, &config());
        assert_eq!(l.set_initial_gas(4, 1), Err(ExecError::OutOfGas));
        assert_eq!(l.gas_used(), 3);
        let mut l = Limit::new(3, &config());
        l.add_gas(3).unwrap();
        assert_eq!(l.add_gas(1), Err(ExecError::OutOfGas));
    }

    #[test]
    fn test_caps() {
        let c = VmConfig {
            max_frames: 2,
            max_memory_pages: 4,
            max_steps: 5,
            ..config()
        };
        let mut l = Limit::unlimited(&c);
        l.on_memory_grow(4).unwrap();
        assert_eq!(l.on_memory_grow(5), Err(ExecError::MemoryLimit));
        l.on_frame_enter().unwrap();
        l.on_frame_enter().unwrap();
        assert_eq!(l.on_frame_enter(), Err(ExecError::FrameLimit));
        l.on_frame_exit();
        for _ in 0..5 {
            l.on_instruction().unwrap();
        }
        assert_eq!(l.on_instruction(), Err(ExecError::StepLimit));
        assert_eq!(l.gas_used(), 0);
    }
}
