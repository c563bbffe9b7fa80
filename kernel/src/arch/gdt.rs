// kernel/src/arch/gdt.rs
//
// 役割:
// - GDT のセグメントセレクタ（カーネル / ユーザのコード・データ, TSS）を固定する。
// - CPU ごとの TSS（RSP0 + SS0）を組み立て、TSS スロットの busy 状態を管理する。
//
// やること:
// - build_task_state(): CPU i の RSP0 = KSTACKTOP - (KSTKSIZE + KSTKGAP) * i
// - Gdt::load_tss(): busy なスロットの再ロードはハードウェア上は triple fault なのでエラーにする
//
// やらないこと:
// - IST（このカーネルでは全ベクタが RSP0 上で処理される）
//
// 設計方針:
// - TSS スロットは GD_TSS0 から CPU 番号順に 1 つずつ並ぶ

use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::config::MAX_CPUS;
use crate::mem::layout::{KSTACKTOP, KSTKGAP, KSTKSIZE};
use crate::types::CpuId;

pub const GD_KT: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0); // 0x08
pub const GD_KD: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0); // 0x10
pub const GD_UT: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3); // 0x18 | 3
pub const GD_UD: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3); // 0x20 | 3

/// CPU0 の TSS スロット index
pub const GD_TSS0_INDEX: u16 = 5;

/// CPU ごとのタスク状態（TSS 本体 + それを指すセレクタ）
#[derive(Debug, Clone, Copy)]
pub struct CpuTaskState {
    pub tss: TaskStateSegment,
    /// ring3 -> ring0 遷移時に使うスタックセグメント
    pub ss0: SegmentSelector,
    pub selector: SegmentSelector,
}

impl CpuTaskState {
    pub fn rsp0(&self) -> u64 {
        let stacks = self.tss.privilege_stack_table;
        stacks[0].as_u64()
    }
}

pub fn kernel_stack_top(cpu: CpuId) -> u64 {
    KSTACKTOP - (KSTKSIZE + KSTKGAP) * cpu.0 as u64
}

pub fn tss_selector(cpu: CpuId) -> SegmentSelector {
    SegmentSelector::new(GD_TSS0_INDEX + cpu.0 as u16, PrivilegeLevel::Ring0)
}

pub fn build_task_state(cpu: CpuId) -> CpuTaskState {
    let mut tss = TaskStateSegment::new();
    tss.privilege_stack_table[0] = VirtAddr::new(kernel_stack_top(cpu));
    CpuTaskState {
        tss,
        ss0: GD_KD,
        selector: tss_selector(cpu),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GdtError {
    /// 既に busy な TSS をロードしようとした（ハードウェア上は triple fault）
    TssBusy(u16),
    NoSuchSlot(u16),
}

/// TSS スロットの busy ビットだけを持つ GDT モデル
pub struct Gdt {
    tss_busy: [bool; MAX_CPUS],
}

impl Gdt {
    pub const fn new() -> Self {
        Gdt {
            tss_busy: [false; MAX_CPUS],
        }
    }

    fn slot(selector: SegmentSelector) -> Result<usize, GdtError> {
        let index = selector.index();
        index
            .checked_sub(GD_TSS0_INDEX)
            .map(|i| i as usize)
            .filter(|&i| i < MAX_CPUS)
            .ok_or(GdtError::NoSuchSlot(index))
    }

    /// ltr 相当。ロード後そのスロットは busy になる。
    pub fn load_tss(&mut self, selector: SegmentSelector) -> Result<(), GdtError> {
        let slot = Self::slot(selector)?;
        if self.tss_busy[slot] {
            return Err(GdtError::TssBusy(selector.index()));
        }
        self.tss_busy[slot] = true;
        Ok(())
    }

    pub fn is_busy(&self, selector: SegmentSelector) -> bool {
        Self::slot(selector)
            .map(|slot| self.tss_busy[slot])
            .unwrap_or(false)
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Gdt::new()
    }
}
