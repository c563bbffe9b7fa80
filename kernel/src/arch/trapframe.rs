// kernel/src/arch/trapframe.rs
//
// 役割:
// - trap 入口で保存されるレジスタ状態（TrapFrame）を定義する。
// - ユーザ例外スタックに積む UTrapframe と、そのバイト列表現を定義する。
//
// 設計方針:
// - syscall ABI: rax = 番号, rdx/rcx/rbx/rdi/rsi = 引数 1..5, 戻り値は rax。
// - UTrapframe は 8 バイト little-endian の語の並びとして固定する
//   （fault_va, err, 汎用レジスタ 15 語, rip, rflags, rsp の順）。

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use crate::arch::gdt;

/// RFLAGS.IF
pub const FL_IF: u64 = 1 << 9;
/// RFLAGS.TF（シングルステップ）
pub const FL_TF: u64 = 1 << 8;

/// 汎用レジスタ（push 順とは無関係に、この並びでシリアライズする）
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

impl PushRegs {
    pub const WORDS: usize = 15;

    pub const NAMES: [&'static str; Self::WORDS] = [
        "r15", "r14", "r13", "r12", "r11", "r10", "r9", "r8", "rdi", "rsi", "rbp", "rbx", "rdx",
        "rcx", "rax",
    ];

    pub fn words(&self) -> [u64; Self::WORDS] {
        [
            self.r15, self.r14, self.r13, self.r12, self.r11, self.r10, self.r9, self.r8,
            self.rdi, self.rsi, self.rbp, self.rbx, self.rdx, self.rcx, self.rax,
        ]
    }

    pub fn from_words(w: &[u64; Self::WORDS]) -> Self {
        PushRegs {
            r15: w[0],
            r14: w[1],
            r13: w[2],
            r12: w[3],
            r11: w[4],
            r10: w[5],
            r9: w[6],
            r8: w[7],
            rdi: w[8],
            rsi: w[9],
            rbp: w[10],
            rbx: w[11],
            rdx: w[12],
            rcx: w[13],
            rax: w[14],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    /// ring 遷移があったときだけ意味を持つ
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// ユーザモードで entry から走り始める初期フレーム
    pub fn new_user(entry: u64, stack_top: u64) -> Self {
        TrapFrame {
            rip: entry,
            rsp: stack_top,
            cs: gdt::GD_UT.0 as u64,
            ss: gdt::GD_UD.0 as u64,
            rflags: FL_IF,
            ..TrapFrame::default()
        }
    }

    /// カーネルモードのフレーム（テストや idle 中の割り込み用）
    pub fn new_kernel(rip: u64, rsp: u64) -> Self {
        TrapFrame {
            rip,
            rsp,
            cs: gdt::GD_KT.0 as u64,
            ss: gdt::GD_KD.0 as u64,
            ..TrapFrame::default()
        }
    }

    /// trap 直前の特権レベル（保存された CS の RPL）
    pub fn privilege(&self) -> PrivilegeLevel {
        SegmentSelector(self.cs as u16).rpl()
    }

    pub fn is_from_user(&self) -> bool {
        self.privilege() == PrivilegeLevel::Ring3
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.rflags & FL_IF != 0
    }

    /// syscall 番号と引数 1..5
    pub fn syscall_args(&self) -> (u64, [u64; 5]) {
        let r = &self.regs;
        (r.rax, [r.rdx, r.rcx, r.rbx, r.rdi, r.rsi])
    }

    pub fn set_syscall_args(&mut self, num: u64, args: [u64; 5]) {
        self.regs.rax = num;
        self.regs.rdx = args[0];
        self.regs.rcx = args[1];
        self.regs.rbx = args[2];
        self.regs.rdi = args[3];
        self.regs.rsi = args[4];
    }
}

/// ユーザ例外スタックに積まれる fault 記述
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u64,
    pub err: u64,
    pub regs: PushRegs,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

impl UTrapframe {
    pub const WORDS: usize = 2 + PushRegs::WORDS + 3;
    pub const SIZE: usize = Self::WORDS * 8;

    pub fn from_trapframe(tf: &TrapFrame, fault_va: u64) -> Self {
        UTrapframe {
            fault_va,
            err: tf.err,
            regs: tf.regs,
            rip: tf.rip,
            rflags: tf.rflags,
            rsp: tf.rsp,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut words = [0u64; Self::WORDS];
        words[0] = self.fault_va;
        words[1] = self.err;
        words[2..2 + PushRegs::WORDS].copy_from_slice(&self.regs.words());
        words[Self::WORDS - 3] = self.rip;
        words[Self::WORDS - 2] = self.rflags;
        words[Self::WORDS - 1] = self.rsp;

        let mut out = [0u8; Self::SIZE];
        for (chunk, w) in out.chunks_exact_mut(8).zip(words.iter()) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut words = [0u64; Self::WORDS];
        for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            *w = u64::from_le_bytes(b);
        }
        let mut regs = [0u64; PushRegs::WORDS];
        regs.copy_from_slice(&words[2..2 + PushRegs::WORDS]);
        Some(UTrapframe {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs::from_words(&regs),
            rip: words[Self::WORDS - 3],
            rflags: words[Self::WORDS - 2],
            rsp: words[Self::WORDS - 1],
        })
    }
}
