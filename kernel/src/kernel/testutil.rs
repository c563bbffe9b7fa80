// kernel/src/kernel/testutil.rs
//
// 単体テスト用の小道具。CPU0 で env を動かし、syscall を trap 経由で発行する。

use alloc::vec::Vec;

use crate::arch::interrupts::TrapEntry;
use crate::arch::mmu::Fault;
use crate::arch::trapframe::TrapFrame;
use crate::config::KernelConfig;
use crate::kernel::syscall::SYS_YIELD;
use crate::kernel::{Env, EnvType, KernelState, Resumption, UserImage};
use crate::mem::paging::Pte;
use crate::types::{CpuId, EnvId};
use crate::ulib::{Access, EnvView, Sys, UserError};

pub const CPU0: CpuId = CpuId(0);
pub const CPU1: CpuId = CpuId(1);

pub fn kernel() -> KernelState {
    KernelState::new(KernelConfig::default()).expect("default config is valid")
}

/// n 個の最小 env を作り、CPU0 を起動した状態（ids[0] が CPU0 で走っている）
pub fn booted(n: usize) -> (KernelState, Vec<EnvId>) {
    let mut k = kernel();
    let ids = (0..n)
        .map(|_| k.env_create(&UserImage::minimal(), EnvType::User).expect("env_create"))
        .collect();
    k.start_cpu(CPU0);
    (k, ids)
}

/// env の現在の frame から syscall を発行し、trap の出口をそのまま返す
pub fn raw_syscall(k: &mut KernelState, cpu: CpuId, env: EnvId, num: u64, args: [u64; 5]) -> Resumption {
    let mut frame = k.env(env).expect("syscall from a dead env").tf;
    frame.set_syscall_args(num, args);
    k.raise(cpu, frame, TrapEntry::syscall())
}

/// syscall を発行し、env の rax に書き戻された値を返す
pub fn syscall(k: &mut KernelState, cpu: CpuId, env: EnvId, num: u64, args: [u64; 5]) -> i64 {
    raw_syscall(k, cpu, env, num, args);
    k.env(env).map(|e| e.tf.regs.rax as i64).unwrap_or(0)
}

pub fn yield_now(k: &mut KernelState, env: EnvId) -> Resumption {
    raw_syscall(k, CPU0, env, SYS_YIELD, [0; 5])
}

impl KernelState {
    pub(crate) fn env_mut_for_test(&mut self, id: EnvId) -> &mut Env {
        self.envs.get_mut(id).expect("live env")
    }
}

/// 1 スレッドで env を直接動かす Sys（CPU0 固定）。
/// 他の env に切り替わったら、呼び出し側がその env 用の KernelSys を作って続ける。
pub struct KernelSys<'a> {
    pub k: &'a mut KernelState,
    pub env: EnvId,
    pub regs: TrapFrame,
}

impl<'a> KernelSys<'a> {
    pub fn new(k: &'a mut KernelState, env: EnvId) -> Self {
        let regs = k.env(env).expect("live env").tf;
        KernelSys { k, env, regs }
    }

    /// trap の出口を受けて、自分が再開されたかを返す
    fn resumed(&mut self, r: Resumption) -> Result<bool, UserError> {
        match r {
            Resumption::Run { env, frame, .. } if env == self.env => {
                self.regs = frame;
                Ok(true)
            }
            _ => match self.k.env(self.env) {
                Some(e) => {
                    self.regs = e.tf;
                    Ok(false)
                }
                None => Err(UserError::Killed),
            },
        }
    }

    /// CPU0 で走っているのが自分でなければ、もう trap は起こせない
    fn on_cpu(&self) -> bool {
        self.k.curenv(CPU0) == Some(self.env)
    }

    fn fault(&mut self, fault: Fault) -> Access {
        if !self.on_cpu() {
            return Access::Killed;
        }
        let r = self.k.raise(CPU0, self.regs, TrapEntry::page_fault(fault.va, fault.err));
        match self.resumed(r) {
            Ok(true) => Access::Upcall,
            _ => Access::Killed,
        }
    }
}

impl Sys for KernelSys<'_> {
    fn regs(&self) -> &TrapFrame {
        &self.regs
    }

    fn regs_mut(&mut self) -> &mut TrapFrame {
        &mut self.regs
    }

    fn syscall(&mut self, num: u64, args: [u64; 5]) -> Result<i64, UserError> {
        if !self.on_cpu() {
            return Err(UserError::Killed);
        }
        let mut frame = self.regs;
        frame.set_syscall_args(num, args);
        self.regs = frame;
        let r = self.k.raise(CPU0, frame, TrapEntry::syscall());
        self.resumed(r)?;
        Ok(self.regs.regs.rax as i64)
    }

    fn load(&mut self, va: u64, buf: &mut [u8]) -> Access {
        match self.k.user_load(self.env, va, buf) {
            Ok(()) => Access::Done,
            Err(f) => self.fault(f),
        }
    }

    fn store(&mut self, va: u64, data: &[u8]) -> Access {
        match self.k.user_store(self.env, va, data) {
            Ok(()) => Access::Done,
            Err(f) => self.fault(f),
        }
    }

    fn uvpd(&self, pdx: usize) -> bool {
        self.k.uvpd(self.env, pdx)
    }

    fn uvpt(&self, va: u64) -> Option<Pte> {
        self.k.pte(self.env, va)
    }

    fn nenv(&self) -> usize {
        self.k.nenv()
    }

    fn env_slot(&self, index: usize) -> Option<EnvView> {
        self.k.envs().slot(index).filter(|e| e.is_live()).map(|e| EnvView {
            id: e.id,
            parent_id: e.parent_id,
            status: e.status,
            env_type: e.env_type,
            ipc: e.ipc,
        })
    }
}
