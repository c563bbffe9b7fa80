// kernel/src/kernel/upcall.rs
//
// 役割:
// - ユーザモードの page fault を、ユーザ登録のハンドラ（upcall）へ反射する。
//
// やること:
// - 例外スタック上に UTrapframe を置く場所を決める（入れ子なら 1 語の隙間を空けて下に積む）。
// - 置き場所がユーザから書けることを検査してから書き込み、rsp / rip を付け替えて再開する。
//
// やらないこと:
// - カーネルモードの page fault の回復（常に panic）。
//
// 設計方針:
// - 隙間の 1 語は、ユーザ側 trampoline が「戻り先 rip を積む」ために使う。
// - 失敗（upcall 未登録・例外スタック溢れ・書けない）はどれも環境の破棄で終わる。

use crate::arch::trapframe::{TrapFrame, UTrapframe};
use crate::kernel::{KernelState, LogEvent, Resumption};
use crate::logging;
use crate::mem::addr::PAGE_SIZE;
use crate::mem::layout::UXSTACKTOP;
use crate::mem::paging::PageFlags;
use crate::types::{CpuId, EnvId};

/// 入れ子の upcall で、前のフレームとの間に空ける語
pub const UPCALL_SLACK: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpcallError {
    /// ハンドラが登録されていない
    NoUpcall,
    /// 例外スタックの下端を越える
    Overflow,
    /// フレームの置き場所がユーザから書けない
    NotWritable(u64),
}

/// ユーザ例外スタック [bottom, top)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionStack {
    pub bottom: u64,
    pub top: u64,
}

impl ExceptionStack {
    pub const fn user() -> Self {
        ExceptionStack {
            bottom: UXSTACKTOP - PAGE_SIZE,
            top: UXSTACKTOP,
        }
    }

    pub fn contains(&self, rsp: u64) -> bool {
        rsp >= self.bottom && rsp < self.top
    }

    /// trap 時の rsp から、size バイトのフレームを置くアドレスを決める。
    pub fn place(&self, trap_rsp: u64, size: usize) -> Result<u64, UpcallError> {
        let cursor = if self.contains(trap_rsp) {
            trap_rsp.checked_sub(UPCALL_SLACK).ok_or(UpcallError::Overflow)?
        } else {
            self.top
        };
        cursor
            .checked_sub(size as u64)
            .filter(|&frame| frame >= self.bottom)
            .ok_or(UpcallError::Overflow)
    }
}

impl KernelState {
    pub(crate) fn page_fault_handler(&mut self, cpu: CpuId, tf: &TrapFrame) -> Resumption {
        let fault_va = self.cpus[cpu.0].cr2;
        self.counters.page_faults += 1;

        if !tf.is_from_user() {
            self.print_trapframe(cpu, tf);
            return self.fatal(cpu, format_args!("page fault in kernel mode at va {:#x}", fault_va));
        }

        let Some(cur) = self.cpus[cpu.0].curenv else {
            return self.fatal(cpu, format_args!("user page fault without curenv"));
        };

        match self.reflect_to_user(cur, fault_va, tf) {
            Ok(frame_va) => {
                self.counters.upcalls_delivered += 1;
                self.push_event(LogEvent::UpcallDelivered { env: cur, fault_va, frame_va });
                self.env_run(cpu, cur)
            }
            Err(e) => {
                logging::warn("page fault upcall failed");
                logging::info_fmt(format_args!("reason = {:?}", e));
                self.cprintf(format_args!(
                    "[{}] user fault va {:08x} ip {:08x}",
                    cur, fault_va, tf.rip
                ));
                self.print_trapframe(cpu, tf);
                self.counters.user_faults_killed += 1;
                self.push_event(LogEvent::UserFaultKilled { env: cur, fault_va });
                self.env_destroy(cpu, cur)
                    .unwrap_or_else(|| self.sched_yield(cpu))
            }
        }
    }

    /// UTrapframe を例外スタックに書き、env の rsp / rip をハンドラ入口に付け替える。
    fn reflect_to_user(&mut self, env: EnvId, fault_va: u64, tf: &TrapFrame) -> Result<u64, UpcallError> {
        let upcall = self
            .envs
            .get(env)
            .and_then(|e| e.pgfault_upcall)
            .ok_or(UpcallError::NoUpcall)?;

        let frame_va = ExceptionStack::user().place(tf.rsp, UTrapframe::SIZE)?;
        let writable = PageFlags::USER_PRESENT | PageFlags::WRITABLE;
        self.user_mem_check(env, frame_va, UTrapframe::SIZE, writable)
            .map_err(UpcallError::NotWritable)?;

        let utf = UTrapframe::from_trapframe(tf, fault_va);
        self.copy_to_user(env, frame_va, &utf.to_bytes())
            .map_err(|_| UpcallError::NotWritable(frame_va))?;

        if let Some(e) = self.envs.get_mut(env) {
            e.tf.rsp = frame_va;
            e.tf.rip = upcall;
        }
        Ok(frame_va)
    }
}
