// kernel/src/arch/interrupts.rs
//
// 役割:
// - ベクタ番号の定義と、256 エントリのゲートテーブルを構築する。
// - ゲートの DPL / present をもとに「その trap が実際にどのベクタとして届くか」を決める。
//
// 設計方針:
// - ゲートテーブルは一度だけ構築し、全 CPU で共有する（spin::Once）。
// - 全ゲートは割り込みゲート（入口で IF が落ちる）。
// - ユーザが int 命令で直接呼べるのは DPL=3 のゲートだけ。
//   #PF だけは DPL=0 にして、ユーザが偽の page fault を作れないようにする。
// - DPL 違反・non-present は #GP（err = vector << 3 | IDT ビット）に変換する。

use spin::Once;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::PrivilegeLevel;

use crate::arch::gdt;

// ---- CPU 例外 ----
pub const T_DIVIDE: u8 = 0;
pub const T_DEBUG: u8 = 1;
pub const T_NMI: u8 = 2;
pub const T_BRKPT: u8 = 3;
pub const T_OFLOW: u8 = 4;
pub const T_BOUND: u8 = 5;
pub const T_ILLOP: u8 = 6;
pub const T_DEVICE: u8 = 7;
pub const T_DBLFLT: u8 = 8;
pub const T_TSS: u8 = 10;
pub const T_SEGNP: u8 = 11;
pub const T_STACK: u8 = 12;
pub const T_GPFLT: u8 = 13;
pub const T_PGFLT: u8 = 14;
pub const T_FPERR: u8 = 16;
pub const T_ALIGN: u8 = 17;
pub const T_MCHK: u8 = 18;
pub const T_SIMDERR: u8 = 19;

// ---- ハードウェア IRQ（IRQ_OFFSET + n）----
pub const IRQ_OFFSET: u8 = 32;
pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KBD: u8 = 1;
pub const IRQ_SERIAL: u8 = 4;
pub const IRQ_SPURIOUS: u8 = 7;
pub const IRQ_IDE: u8 = 14;
pub const IRQ_ERROR: u8 = 19;

/// 8259 が扱う IRQ 本数
pub const NIRQ: u8 = 16;

pub const T_SYSCALL: u8 = 48;

pub const IDT_ENTRIES: usize = 256;

/// 例外エラーコードの IDT ビット（セレクタ形式のエラーコードで IDT を指す）
const ERR_IDT: u64 = 1 << 1;

static EXCNAMES: [&str; 20] = [
    "Divide error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "(unknown trap)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine-Check",
    "SIMD Floating-Point Exception",
];

/// ベクタの人間向け名称
pub fn trapname(trapno: u64) -> &'static str {
    if (trapno as usize) < EXCNAMES.len() {
        return EXCNAMES[trapno as usize];
    }
    if trapno == T_SYSCALL as u64 {
        return "System call";
    }
    if trapno >= IRQ_OFFSET as u64 && trapno < (IRQ_OFFSET + NIRQ) as u64 {
        return "Hardware Interrupt";
    }
    "(unknown trap)"
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gate {
    pub present: bool,
    /// 入口スタブの（モデル上の）アドレス
    pub entry: u64,
    pub selector: SegmentSelector,
    pub dpl: PrivilegeLevel,
}

impl Gate {
    const MISSING: Gate = Gate {
        present: false,
        entry: 0,
        selector: gdt::GD_KT,
        dpl: PrivilegeLevel::Ring0,
    };
}

/// 入口スタブ群が並ぶ（モデル上の）カーネルテキスト領域
pub const TRAP_STUB_BASE: u64 = 0xffff_ffff_8010_0000;
const TRAP_STUB_STRIDE: u64 = 16;

pub fn stub_address(vector: u8) -> u64 {
    TRAP_STUB_BASE + vector as u64 * TRAP_STUB_STRIDE
}

pub struct GateTable {
    gates: [Gate; IDT_ENTRIES],
}

impl GateTable {
    fn build() -> Self {
        let mut gates = [Gate::MISSING; IDT_ENTRIES];
        let mut install = |vector: u8, dpl: PrivilegeLevel| {
            gates[vector as usize] = Gate {
                present: true,
                entry: stub_address(vector),
                selector: gdt::GD_KT,
                dpl,
            };
        };

        for vector in T_DIVIDE..=T_SIMDERR {
            match vector {
                9 | 15 => {}
                T_PGFLT => install(vector, PrivilegeLevel::Ring0),
                _ => install(vector, PrivilegeLevel::Ring3),
            }
        }
        for irq in 0..NIRQ {
            install(IRQ_OFFSET + irq, PrivilegeLevel::Ring3);
        }
        install(IRQ_OFFSET + IRQ_ERROR, PrivilegeLevel::Ring3);
        install(T_SYSCALL, PrivilegeLevel::Ring3);

        GateTable { gates }
    }

    pub fn gate(&self, vector: u8) -> &Gate {
        &self.gates[vector as usize]
    }

    /// 実際に届くベクタとエラーコードを決める。
    /// - gate が無い: #GP
    /// - int 命令で DPL < CPL のゲートを叩いた: #GP
    pub fn resolve(&self, entry: TrapEntry, cpl: PrivilegeLevel) -> TrapEntry {
        let gate = self.gate(entry.vector);
        let denied = entry.source == TrapSource::Software && (gate.dpl as u8) < (cpl as u8);
        if !gate.present || denied {
            return TrapEntry::exception(T_GPFLT, ((entry.vector as u64) << 3) | ERR_IDT);
        }
        entry
    }
}

static GATE_TABLE: Once<GateTable> = Once::new();

/// 共有ゲートテーブル（初回呼び出しで構築）
pub fn gate_table() -> &'static GateTable {
    GATE_TABLE.call_once(GateTable::build)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapSource {
    /// CPU 例外・外部割り込み
    Hardware,
    /// int 命令
    Software,
}

/// ハードウェア境界で発生した trap の記述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapEntry {
    pub vector: u8,
    pub err: u64,
    /// #PF のときだけ CR2 に入る値
    pub cr2: Option<u64>,
    pub source: TrapSource,
}

impl TrapEntry {
    pub fn exception(vector: u8, err: u64) -> Self {
        TrapEntry {
            vector,
            err,
            cr2: None,
            source: TrapSource::Hardware,
        }
    }

    pub fn page_fault(va: u64, err: PageFaultErrorCode) -> Self {
        TrapEntry {
            vector: T_PGFLT,
            err: err.bits(),
            cr2: Some(va),
            source: TrapSource::Hardware,
        }
    }

    pub fn irq(irq: u8) -> Self {
        TrapEntry::exception(IRQ_OFFSET + irq, 0)
    }

    /// int $vector
    pub fn software(vector: u8) -> Self {
        TrapEntry {
            vector,
            err: 0,
            cr2: None,
            source: TrapSource::Software,
        }
    }

    pub fn syscall() -> Self {
        TrapEntry::software(T_SYSCALL)
    }
}
