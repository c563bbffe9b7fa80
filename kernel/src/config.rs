// kernel/src/config.rs
//
// 役割:
// - カーネルインスタンスの規模（CPU 数・環境数・物理フレーム数）を 1 箇所で決める。
//
// 設計方針:
// - 既定値はテストで扱いやすい小さな規模にする。
// - 不正な組合せは KernelState::new の入口で拒否する（途中で壊れない）。

use thiserror::Error;

use crate::types::ENVGENSHIFT;

/// 1 つのカーネルが扱える CPU 数の上限（GDT の TSS スロット数と一致）
pub const MAX_CPUS: usize = 8;

/// 環境数の上限（世代ビットと衝突しない範囲）
pub const MAX_ENVS: usize = 1 << ENVGENSHIFT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub ncpu: usize,
    pub nenv: usize,
    pub nframes: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ncpu out of range: {0}")]
    CpuCount(usize),
    #[error("nenv must be a power of two within the id space: {0}")]
    EnvCount(usize),
    #[error("nframes must be non-zero")]
    NoFrames,
}

impl KernelConfig {
    pub const fn new(ncpu: usize, nenv: usize, nframes: usize) -> Self {
        KernelConfig { ncpu, nenv, nframes }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncpu == 0 || self.ncpu > MAX_CPUS {
            return Err(ConfigError::CpuCount(self.ncpu));
        }
        if !self.nenv.is_power_of_two() || self.nenv > MAX_ENVS {
            return Err(ConfigError::EnvCount(self.nenv));
        }
        if self.nframes == 0 {
            return Err(ConfigError::NoFrames);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig::new(2, 64, 1024)
    }
}
