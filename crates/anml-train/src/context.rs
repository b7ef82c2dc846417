//! Per-run execution context.

use tch::Device;

use crate::config::TrainingConfig;
use crate::error::ConfigError;

/// Settings every stage of a run needs, passed explicitly instead of read
/// from globals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunContext {
    /// Seed for libtorch and the sampler RNG.
    pub seed: u64,
    /// Device for parameters and episode tensors.
    pub device: Device,
    /// Report progress on every iteration instead of every tenth.
    pub verbose: bool,
}

impl RunContext {
    /// Build a context and seed libtorch's global generator.
    pub fn new(seed: u64, device: Device, verbose: bool) -> Self {
        tch::manual_seed(seed as i64);
        RunContext { seed, device, verbose }
    }

    /// CPU context, the usual choice in tests.
    pub fn cpu(seed: u64) -> Self {
        Self::new(seed, Device::Cpu, false)
    }

    /// Context for a resolved training configuration.
    ///
    /// # Errors
    ///
    /// Fails when the configured device is unavailable.
    pub fn from_config(config: &TrainingConfig, verbose: bool) -> Result<Self, ConfigError> {
        Ok(Self::new(config.seed, config.device.resolve()?, verbose))
    }

    /// Outer iterations between progress reports.
    pub fn log_every(&self) -> usize {
        if self.verbose {
            1
        } else {
            10
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_logs_every_iteration() {
        assert_eq!(RunContext::new(0, Device::Cpu, true).log_every(), 1);
        assert_eq!(RunContext::cpu(0).log_every(), 10);
    }
}
