// kernel/src/panic.rs
//
// カーネル panic（致命的エラー）の記録。
// - 挙動は「記録をラッチ → 以後どの CPU の trap も停止に倒す」に固定する。
// - ラッチは最初の 1 回だけ。二重 panic は最初の記録を上書きしない。
// - ホスト上のテストで観測できるよう、Rust の panic ではなく値として残す。

use alloc::string::String;
use core::fmt;

use crate::types::CpuId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelPanic {
    pub cpu: CpuId,
    pub message: String,
}

impl fmt::Display for KernelPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel panic on CPU {}: {}", self.cpu, self.message)
    }
}

/// 最初の panic だけを保持するラッチ
#[derive(Debug, Default)]
pub struct PanicLatch {
    record: Option<KernelPanic>,
}

impl PanicLatch {
    pub const fn new() -> Self {
        PanicLatch { record: None }
    }

    /// 記録する。既にラッチ済みなら false。
    pub fn latch(&mut self, cpu: CpuId, message: String) -> bool {
        if self.record.is_some() {
            return false;
        }
        self.record = Some(KernelPanic { cpu, message });
        true
    }

    pub fn is_latched(&self) -> bool {
        self.record.is_some()
    }

    pub fn record(&self) -> Option<&KernelPanic> {
        self.record.as_ref()
    }
}
