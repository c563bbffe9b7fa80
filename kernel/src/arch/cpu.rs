// src/arch/cpu.rs
// CPU ごとの状態。ハードウェアレジスタ（CR2 / RFLAGS.IF / TR）と
// カーネルの per-CPU 変数（curenv / 最後の trap フレーム）をまとめて持つ。

use crate::arch::gdt::CpuTaskState;
use crate::arch::trapframe::TrapFrame;
use crate::types::{CpuId, EnvId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStatus {
    Unused,
    Started,
    /// sched_halt で停止中。次の割り込みでカーネルロックを取り直す。
    Halted,
}

#[derive(Debug)]
pub struct CpuInfo {
    pub id: CpuId,
    pub status: CpuStatus,
    pub task_state: Option<CpuTaskState>,
    pub curenv: Option<EnvId>,
    /// 最後の #PF の fault アドレス
    pub cr2: u64,
    /// RFLAGS.IF
    pub interrupts_enabled: bool,
    /// LAPIC に送った EOI の回数
    pub lapic_eoi_count: u64,
    /// print_trapframe が cr2 を出すかどうかの判定用
    pub last_tf: Option<TrapFrame>,
}

impl CpuInfo {
    pub fn new(id: CpuId) -> Self {
        CpuInfo {
            id,
            status: CpuStatus::Unused,
            task_state: None,
            curenv: None,
            cr2: 0,
            interrupts_enabled: false,
            lapic_eoi_count: 0,
            last_tf: None,
        }
    }

    pub fn lapic_eoi(&mut self) {
        self.lapic_eoi_count += 1;
    }
}
