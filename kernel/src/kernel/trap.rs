// kernel/src/kernel/trap.rs
//
// 役割:
// - ハードウェア境界（raise）: ゲート検査・CR2・IF クリアを行ってから trap に入る。
// - trap(): ロック取得・curenv の frame 保存・dispatch・再開先の決定。
//
// 設計方針:
// - panic がラッチされていたら、どの CPU も何もせず停止する。
// - sched_halt で停止していた CPU は、ここでロックを取り直してから処理する。
// - 入口で IF が立っているのはゲート設定の破綻なので致命的エラー。
// - dispatch が既に再開先を決めた場合（yield / destroy / upcall）はそれを返す。
//   そうでなければ curenv が Running ならそれを、でなければスケジューラを選ぶ。

use alloc::string::String;
use core::fmt::Write;

use x86_64::structures::idt::PageFaultErrorCode;

use crate::arch::cpu::CpuStatus;
use crate::arch::interrupts::{
    gate_table, trapname, TrapEntry, IRQ_OFFSET, IRQ_SPURIOUS, IRQ_TIMER, T_BRKPT, T_DEBUG,
    T_PGFLT, T_SYSCALL,
};
use crate::arch::trapframe::{PushRegs, TrapFrame};
use crate::kernel::{trace, EnvStatus, KernelState, LogEvent, Resumption};
use crate::types::CpuId;

impl KernelState {
    /// CPU が trap を受けたときのハードウェア動作。
    /// frame は trap 直前のレジスタ状態（trapno / err はここで埋める）。
    pub fn raise(&mut self, cpu: CpuId, mut frame: TrapFrame, entry: TrapEntry) -> Resumption {
        let entry = gate_table().resolve(entry, frame.privilege());
        frame.trapno = entry.vector as u64;
        frame.err = entry.err;

        let Some(info) = self.cpus.get_mut(cpu.0) else {
            return self.unknown_cpu(cpu);
        };
        if let Some(va) = entry.cr2 {
            info.cr2 = va;
        }
        // 割り込みゲートなので IF は落ちる
        info.interrupts_enabled = false;

        self.trap(cpu, frame)
    }

    /// trap の共通入口
    pub fn trap(&mut self, cpu: CpuId, tf: TrapFrame) -> Resumption {
        if cpu.0 >= self.cpus.len() {
            return self.unknown_cpu(cpu);
        }
        if self.panic.is_latched() {
            self.cpus[cpu.0].status = CpuStatus::Halted;
            return Resumption::Panicked;
        }

        if self.cpus[cpu.0].status == CpuStatus::Halted {
            if let Err(e) = self.lock.acquire(cpu) {
                return self.lock_violation(cpu, e);
            }
            self.cpus[cpu.0].status = CpuStatus::Started;
        }

        if self.cpus[cpu.0].interrupts_enabled {
            return self.fatal(cpu, format_args!("trap entered with interrupts enabled"));
        }

        let from_user = tf.is_from_user();
        self.counters.traps += 1;
        self.push_event(LogEvent::TrapEntered { cpu, trapno: tf.trapno, from_user });
        trace::trace_trap(cpu, tf.trapno, from_user);

        if from_user {
            if let Err(e) = self.lock.acquire(cpu) {
                return self.lock_violation(cpu, e);
            }
            let Some(cur) = self.cpus[cpu.0].curenv else {
                return self.fatal(cpu, format_args!("trap from user mode without curenv"));
            };
            let Some(env) = self.envs.get_mut(cur) else {
                return self.fatal(cpu, format_args!("curenv {} is not a live environment", cur));
            };
            if env.status == EnvStatus::Dying {
                // 他 CPU から破棄されていた
                self.env_free(cpu, cur);
                self.cpus[cpu.0].curenv = None;
                return self.sched_yield(cpu);
            }
            env.tf = tf;
        } else if !self.lock.is_held_by(cpu) {
            // カーネルモードで動いていたコンテキストはロックを持っていた
            if let Err(e) = self.lock.acquire(cpu) {
                return self.lock_violation(cpu, e);
            }
        }

        self.cpus[cpu.0].last_tf = Some(tf);

        if let Some(r) = self.trap_dispatch(cpu, &tf) {
            return r;
        }

        let running = self.cpus[cpu.0]
            .curenv
            .filter(|&id| self.envs.get(id).map(|e| e.status) == Some(EnvStatus::Running));
        match running {
            Some(id) => self.env_run(cpu, id),
            None => self.sched_yield(cpu),
        }
    }

    fn trap_dispatch(&mut self, cpu: CpuId, tf: &TrapFrame) -> Option<Resumption> {
        let from_user = tf.is_from_user();
        let trapno = tf.trapno;

        if trapno == T_PGFLT as u64 {
            return Some(self.page_fault_handler(cpu, tf));
        }
        if trapno == T_BRKPT as u64 || trapno == T_DEBUG as u64 {
            self.enter_monitor(cpu, tf);
            return None;
        }
        if trapno == T_SYSCALL as u64 && from_user {
            return self.dispatch_syscall(cpu);
        }
        if trapno == (IRQ_OFFSET + IRQ_SPURIOUS) as u64 {
            self.counters.spurious_irqs += 1;
            self.push_event(LogEvent::SpuriousIrq { cpu });
            self.cprintf(format_args!("Spurious interrupt on irq 7"));
            self.print_trapframe(cpu, tf);
            return None;
        }
        if trapno == (IRQ_OFFSET + IRQ_TIMER) as u64 {
            self.cpus[cpu.0].lapic_eoi();
            self.counters.timer_ticks += 1;
            self.push_event(LogEvent::TimerAck { cpu });
            return Some(self.sched_yield(cpu));
        }

        // 想定外の trap: カーネル内なら panic、ユーザなら環境を破棄
        self.print_trapframe(cpu, tf);
        if !from_user {
            return Some(self.fatal(cpu, format_args!("unhandled trap in kernel")));
        }
        let cur = self.cpus[cpu.0].curenv?;
        Some(
            self.env_destroy(cpu, cur)
                .unwrap_or_else(|| self.sched_yield(cpu)),
        )
    }

    /// print_trapframe をコンソールに出す
    pub(crate) fn print_trapframe(&mut self, cpu: CpuId, tf: &TrapFrame) {
        let show_cr2 = self.cpus[cpu.0].last_tf.as_ref() == Some(tf) && tf.trapno == T_PGFLT as u64;
        let cr2 = show_cr2.then_some(self.cpus[cpu.0].cr2);
        let text = format_trapframe(cpu, tf, cr2);
        self.cprintf(format_args!("{}", text));
    }
}

/// print_trapframe の整形。cr2 は直近の #PF フレームのときだけ渡す。
pub fn format_trapframe(cpu: CpuId, tf: &TrapFrame, cr2: Option<u64>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "TRAP frame on CPU {}", cpu);
    let words = tf.regs.words();
    for (name, value) in PushRegs::NAMES.iter().zip(words.iter()) {
        let _ = writeln!(out, "  {:<4} 0x{:016x}", name, value);
    }
    let _ = writeln!(out, "  trap 0x{:08x} {}", tf.trapno, trapname(tf.trapno));
    if let Some(cr2) = cr2 {
        let _ = writeln!(out, "  cr2  0x{:016x}", cr2);
    }
    let _ = write!(out, "  err  0x{:08x}", tf.err);
    if tf.trapno == T_PGFLT as u64 {
        let err = PageFaultErrorCode::from_bits_truncate(tf.err);
        let _ = write!(
            out,
            " [{}, {}, {}]",
            if err.contains(PageFaultErrorCode::USER_MODE) { "user" } else { "kernel" },
            if err.contains(PageFaultErrorCode::CAUSED_BY_WRITE) { "write" } else { "read" },
            if err.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
                "protection"
            } else {
                "not-present"
            },
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "  rip  0x{:016x}", tf.rip);
    let _ = writeln!(out, "  cs   0x----{:04x}", tf.cs);
    let _ = writeln!(out, "  flag 0x{:016x}", tf.rflags);
    if tf.is_from_user() {
        let _ = writeln!(out, "  rsp  0x{:016x}", tf.rsp);
        let _ = writeln!(out, "  ss   0x----{:04x}", tf.ss);
    }
    out
}
