// kernel/src/kernel/syscall.rs
//
// syscall 境界
// - 番号は rax、引数は rdx / rcx / rbx / rdi / rsi。戻り値は rax（負なら -E_*）。
// - 入口で Syscall に decode し、以降は型付きで扱う。未知の番号は -E_INVAL。
// - yield / recv / 自身の destroy は「戻らない」syscall。Switched で再開先をそのまま返す。
//
// トレース（feature で切替）
// - ipc_trace_syscall: IPC syscall の入口を trace する

use alloc::string::String;
use alloc::vec;

use crate::kernel::{trace, EnvStatus, KernelError, KernelState, LogEvent, Resumption};
use crate::mem::addr;
use crate::mem::layout::UTOP;
use crate::mem::paging::PageFlags;
use crate::types::{CpuId, EnvId};

pub const SYS_CPUTS: u64 = 0;
pub const SYS_GETENVID: u64 = 2;
pub const SYS_ENV_DESTROY: u64 = 3;
pub const SYS_PAGE_ALLOC: u64 = 4;
pub const SYS_PAGE_MAP: u64 = 5;
pub const SYS_PAGE_UNMAP: u64 = 6;
pub const SYS_EXOFORK: u64 = 7;
pub const SYS_ENV_SET_STATUS: u64 = 8;
pub const SYS_ENV_SET_PGFAULT_UPCALL: u64 = 9;
pub const SYS_YIELD: u64 = 10;
pub const SYS_IPC_TRY_SEND: u64 = 11;
pub const SYS_IPC_RECV: u64 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    Cputs { va: u64, len: u64 },
    GetEnvId,
    EnvDestroy { env: EnvId },
    PageAlloc { env: EnvId, va: u64, perm: PageFlags },
    PageMap { src_env: EnvId, src_va: u64, dst_env: EnvId, dst_va: u64, perm: PageFlags },
    PageUnmap { env: EnvId, va: u64 },
    Exofork,
    EnvSetStatus { env: EnvId, status: u64 },
    EnvSetPgfaultUpcall { env: EnvId, func: u64 },
    Yield,
    IpcTrySend { env: EnvId, value: u64, srcva: u64, perm: PageFlags },
    IpcRecv { dstva: u64 },
}

fn env_arg(raw: u64) -> EnvId {
    EnvId(raw as u32)
}

fn perm_arg(raw: u64) -> PageFlags {
    PageFlags::from_bits_retain(raw)
}

impl Syscall {
    pub fn decode(num: u64, a: [u64; 5]) -> Result<Syscall, KernelError> {
        let sc = match num {
            SYS_CPUTS => Syscall::Cputs { va: a[0], len: a[1] },
            SYS_GETENVID => Syscall::GetEnvId,
            SYS_ENV_DESTROY => Syscall::EnvDestroy { env: env_arg(a[0]) },
            SYS_PAGE_ALLOC => Syscall::PageAlloc { env: env_arg(a[0]), va: a[1], perm: perm_arg(a[2]) },
            SYS_PAGE_MAP => Syscall::PageMap {
                src_env: env_arg(a[0]),
                src_va: a[1],
                dst_env: env_arg(a[2]),
                dst_va: a[3],
                perm: perm_arg(a[4]),
            },
            SYS_PAGE_UNMAP => Syscall::PageUnmap { env: env_arg(a[0]), va: a[1] },
            SYS_EXOFORK => Syscall::Exofork,
            SYS_ENV_SET_STATUS => Syscall::EnvSetStatus { env: env_arg(a[0]), status: a[1] },
            SYS_ENV_SET_PGFAULT_UPCALL => Syscall::EnvSetPgfaultUpcall { env: env_arg(a[0]), func: a[1] },
            SYS_YIELD => Syscall::Yield,
            SYS_IPC_TRY_SEND => Syscall::IpcTrySend {
                env: env_arg(a[0]),
                value: a[1],
                srcva: a[2],
                perm: perm_arg(a[3]),
            },
            SYS_IPC_RECV => Syscall::IpcRecv { dstva: a[0] },
            _ => return Err(KernelError::Inval),
        };
        Ok(sc)
    }
}

/// syscall の結果
pub(crate) enum SyscallOutcome {
    /// rax に入れて呼び出し元へ戻る
    Return(i64),
    /// 呼び出し元には（今は）戻らない
    Switched(Resumption),
}

impl From<Result<u64, KernelError>> for SyscallOutcome {
    fn from(r: Result<u64, KernelError>) -> Self {
        match r {
            Ok(v) => SyscallOutcome::Return(v as i64),
            Err(e) => SyscallOutcome::Return(e.to_return()),
        }
    }
}

/// ユーザが syscall で指すアドレスの検査（UTOP 未満かつページ境界）
pub(crate) fn check_user_va(va: u64) -> Result<(), KernelError> {
    if va >= UTOP || !addr::is_page_aligned(va) {
        return Err(KernelError::Inval);
    }
    Ok(())
}

impl KernelState {
    /// curenv の保存済み frame から syscall を取り出して実行する。
    pub(super) fn dispatch_syscall(&mut self, cpu: CpuId) -> Option<Resumption> {
        let cur = self.cpus[cpu.0].curenv?;
        let (num, args) = self.envs.get(cur)?.tf.syscall_args();
        self.counters.syscalls += 1;

        let outcome = match Syscall::decode(num, args) {
            Ok(sc) => self.handle_syscall(cpu, cur, sc),
            Err(e) => SyscallOutcome::Return(e.to_return()),
        };

        match outcome {
            SyscallOutcome::Return(ret) => {
                if let Some(env) = self.envs.get_mut(cur) {
                    env.tf.regs.rax = ret as u64;
                }
                self.push_event(LogEvent::SyscallHandled { env: cur, num, ret });
                None
            }
            SyscallOutcome::Switched(r) => {
                self.push_event(LogEvent::SyscallHandled { env: cur, num, ret: 0 });
                Some(r)
            }
        }
    }

    fn handle_syscall(&mut self, cpu: CpuId, cur: EnvId, sc: Syscall) -> SyscallOutcome {
        match sc {
            Syscall::Cputs { va, len } => self.sys_cputs(cpu, cur, va, len as usize),
            Syscall::GetEnvId => SyscallOutcome::Return(cur.0 as i64),
            Syscall::EnvDestroy { env } => self.sys_env_destroy(cpu, cur, env),
            Syscall::PageAlloc { env, va, perm } => self.sys_page_alloc(cpu, env, va, perm).into(),
            Syscall::PageMap { src_env, src_va, dst_env, dst_va, perm } => {
                self.sys_page_map(cpu, src_env, src_va, dst_env, dst_va, perm).into()
            }
            Syscall::PageUnmap { env, va } => self.sys_page_unmap(cpu, env, va).into(),
            Syscall::Exofork => self.sys_exofork(cur).into(),
            Syscall::EnvSetStatus { env, status } => self.sys_env_set_status(cpu, env, status).into(),
            Syscall::EnvSetPgfaultUpcall { env, func } => {
                self.sys_env_set_pgfault_upcall(cpu, env, func).into()
            }
            Syscall::Yield => {
                if let Some(e) = self.envs.get_mut(cur) {
                    e.tf.regs.rax = 0;
                }
                SyscallOutcome::Switched(self.sched_yield(cpu))
            }
            Syscall::IpcTrySend { env, value, srcva, perm } => {
                trace::trace_ipc_syscall_try_send(cur, env, value);
                self.sys_ipc_try_send(cpu, cur, env, value, srcva, perm).into()
            }
            Syscall::IpcRecv { dstva } => {
                trace::trace_ipc_syscall_recv(cur, dstva);
                match self.sys_ipc_recv(cpu, cur, dstva) {
                    Ok(r) => SyscallOutcome::Switched(r),
                    Err(e) => SyscallOutcome::Return(e.to_return()),
                }
            }
        }
    }

    fn sys_cputs(&mut self, cpu: CpuId, cur: EnvId, va: u64, len: usize) -> SyscallOutcome {
        if let Err(bad) = self.user_mem_check(cur, va, len, PageFlags::USER) {
            self.cprintf(format_args!(
                "[{}] user_mem_check assertion failure for va {:08x}",
                cur, bad
            ));
            return match self.env_destroy(cpu, cur) {
                Some(r) => SyscallOutcome::Switched(r),
                None => SyscallOutcome::Return(KernelError::Fault.to_return()),
            };
        }
        let mut buf = vec![0u8; len];
        if self.copy_from_user(cur, va, &mut buf).is_err() {
            return SyscallOutcome::Return(KernelError::Fault.to_return());
        }
        let text = String::from_utf8_lossy(&buf).into_owned();
        self.cprintf(format_args!("{}", text));
        SyscallOutcome::Return(0)
    }

    fn sys_env_destroy(&mut self, cpu: CpuId, cur: EnvId, target: EnvId) -> SyscallOutcome {
        let id = match self.envid2env(cpu, target, true) {
            Ok(id) => id,
            Err(e) => return SyscallOutcome::Return(e.to_return()),
        };
        if id == cur {
            self.cprintf(format_args!("[{}] exiting gracefully", cur));
        } else {
            self.cprintf(format_args!("[{}] destroying {}", cur, id));
        }
        match self.env_destroy(cpu, id) {
            Some(r) => SyscallOutcome::Switched(r),
            None => SyscallOutcome::Return(0),
        }
    }

    fn sys_page_alloc(&mut self, cpu: CpuId, env: EnvId, va: u64, perm: PageFlags) -> Result<u64, KernelError> {
        let id = self.envid2env(cpu, env, true)?;
        check_user_va(va)?;
        perm.check_user_perm().map_err(|_| KernelError::Inval)?;
        let frame = self.phys_mem.allocate_frame().ok_or(KernelError::NoMem)?;
        if let Err(e) = self.page_insert(id, va, frame, perm) {
            self.phys_mem.free_unreferenced(frame);
            return Err(e);
        }
        Ok(0)
    }

    fn sys_page_map(
        &mut self,
        cpu: CpuId,
        src_env: EnvId,
        src_va: u64,
        dst_env: EnvId,
        dst_va: u64,
        perm: PageFlags,
    ) -> Result<u64, KernelError> {
        let src = self.envid2env(cpu, src_env, true)?;
        let dst = self.envid2env(cpu, dst_env, true)?;
        check_user_va(src_va)?;
        check_user_va(dst_va)?;
        let pte = self.pte(src, src_va).ok_or(KernelError::Inval)?;
        perm.check_user_perm().map_err(|_| KernelError::Inval)?;
        if perm.contains(PageFlags::WRITABLE) && !pte.is_writable() {
            return Err(KernelError::Inval);
        }
        self.page_insert(dst, dst_va, pte.frame, perm)?;
        Ok(0)
    }

    fn sys_page_unmap(&mut self, cpu: CpuId, env: EnvId, va: u64) -> Result<u64, KernelError> {
        let id = self.envid2env(cpu, env, true)?;
        check_user_va(va)?;
        self.page_remove(id, va);
        Ok(0)
    }

    /// 子環境を作る。子は NotRunnable、レジスタは親のコピーで rax だけ 0。
    fn sys_exofork(&mut self, cur: EnvId) -> Result<u64, KernelError> {
        let parent_tf = self.envs.get(cur).ok_or(KernelError::BadEnv)?.tf;
        let child = self.envs.alloc(cur)?;
        if let Some(e) = self.envs.get_mut(child) {
            e.status = EnvStatus::NotRunnable;
            e.tf = parent_tf;
            e.tf.regs.rax = 0;
        }
        self.push_event(LogEvent::EnvCreated { env: child });
        Ok(child.0 as u64)
    }

    fn sys_env_set_status(&mut self, cpu: CpuId, env: EnvId, raw: u64) -> Result<u64, KernelError> {
        let status = match EnvStatus::from_raw(raw) {
            Some(s @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => s,
            _ => return Err(KernelError::Inval),
        };
        let id = self.envid2env(cpu, env, true)?;
        if let Some(e) = self.envs.get_mut(id) {
            e.status = status;
        }
        Ok(0)
    }

    fn sys_env_set_pgfault_upcall(&mut self, cpu: CpuId, env: EnvId, func: u64) -> Result<u64, KernelError> {
        let id = self.envid2env(cpu, env, true)?;
        if let Some(e) = self.envs.get_mut(id) {
            e.pgfault_upcall = Some(func);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::*;
    use crate::mem::layout::{UTEMP, UTEXT};

    fn rw() -> u64 {
        (PageFlags::USER_PRESENT | PageFlags::WRITABLE).bits()
    }

    #[test]
    fn unknown_syscall_is_inval() {
        let (mut k, ids) = booted(1);
        assert_eq!(syscall(&mut k, CPU0, ids[0], 99, [0; 5]), KernelError::Inval.to_return());
        assert_eq!(syscall(&mut k, CPU0, ids[0], 1, [0; 5]), KernelError::Inval.to_return());
    }

    #[test]
    fn page_alloc_validates_arguments() {
        let (mut k, ids) = booted(1);
        let e = ids[0];
        let inval = KernelError::Inval.to_return();
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0, UTOP, rw(), 0, 0]), inval);
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0, UTEMP + 8, rw(), 0, 0]), inval);
        assert_eq!(
            syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0, UTEMP, PageFlags::PRESENT.bits(), 0, 0]),
            inval
        );
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0, UTEMP, rw() | 1 << 3, 0, 0]), inval);
        assert_eq!(
            syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0x7777, UTEMP, rw(), 0, 0]),
            KernelError::BadEnv.to_return()
        );

        let free = k.free_frames();
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0, UTEMP, rw(), 0, 0]), 0);
        assert_eq!(k.free_frames(), free - 1);
        let mut buf = [0xffu8; 16];
        k.user_load(e, UTEMP, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        // 同じ va への再 alloc は古いフレームを解放する
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0, UTEMP, rw(), 0, 0]), 0);
        assert_eq!(k.free_frames(), free - 1);
        k.check_invariants().unwrap();
    }

    #[test]
    fn page_map_rules() {
        let (mut k, ids) = booted(1);
        let e = ids[0];
        let inval = KernelError::Inval.to_return();
        let ro = PageFlags::USER_PRESENT.bits();
        let cow = (PageFlags::USER_PRESENT | PageFlags::COW).bits();

        // 未マップの src
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_MAP, [0, UTEMP, 0, UTEMP + 0x1000, ro]), inval);

        // テキストは読み取り専用: W 付きで張り直せない
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_MAP, [0, UTEXT, 0, UTEMP, rw()]), inval);
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_MAP, [0, UTEXT, 0, UTEMP, ro]), 0);

        // COW と W の同時指定は拒否
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_ALLOC, [0, UTEMP + 0x1000, rw(), 0, 0]), 0);
        assert_eq!(
            syscall(&mut k, CPU0, e, SYS_PAGE_MAP, [0, UTEMP + 0x1000, 0, UTEMP + 0x2000, rw() | cow]),
            inval
        );
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_MAP, [0, UTEMP + 0x1000, 0, UTEMP + 0x2000, cow]), 0);

        let a = k.pte(e, UTEMP + 0x1000).unwrap();
        let b = k.pte(e, UTEMP + 0x2000).unwrap();
        assert_eq!(a.frame, b.frame);
        assert_eq!(k.frame_refcount(a.frame), 2);
        assert!(b.is_cow());

        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_UNMAP, [0, UTEMP + 0x2000, 0, 0, 0]), 0);
        assert_eq!(k.frame_refcount(a.frame), 1);
        // 無いものの unmap は成功扱い
        assert_eq!(syscall(&mut k, CPU0, e, SYS_PAGE_UNMAP, [0, UTEMP + 0x2000, 0, 0, 0]), 0);
        k.check_invariants().unwrap();
    }

    #[test]
    fn exofork_child_is_not_runnable_with_zero_rax() {
        let (mut k, ids) = booted(1);
        let parent = ids[0];
        let ret = syscall(&mut k, CPU0, parent, SYS_EXOFORK, [0; 5]);
        assert!(ret > 0);
        let child = EnvId(ret as u32);

        let c = k.env(child).unwrap();
        assert_eq!(c.status, EnvStatus::NotRunnable);
        assert_eq!(c.parent_id, parent);
        assert_eq!(c.tf.regs.rax, 0);
        assert_eq!(c.tf.rip, k.env(parent).unwrap().tf.rip);
        assert_eq!(c.address_space.mapping_count(), 0);
        assert_eq!(c.pgfault_upcall, None);

        // 子は親からだけ操作できる
        assert_eq!(
            syscall(&mut k, CPU0, parent, SYS_ENV_SET_STATUS, [child.0 as u64, 7, 0, 0, 0]),
            KernelError::Inval.to_return()
        );
        let running = EnvStatus::Running.to_raw();
        assert_eq!(
            syscall(&mut k, CPU0, parent, SYS_ENV_SET_STATUS, [child.0 as u64, running, 0, 0, 0]),
            KernelError::Inval.to_return()
        );
        let runnable = EnvStatus::Runnable.to_raw();
        assert_eq!(syscall(&mut k, CPU0, parent, SYS_ENV_SET_STATUS, [child.0 as u64, runnable, 0, 0, 0]), 0);
        assert_eq!(k.env(child).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn permission_is_parent_or_self_only() {
        let (mut k, ids) = booted(2);
        assert_eq!(
            syscall(&mut k, CPU0, ids[0], SYS_PAGE_ALLOC, [ids[1].0 as u64, UTEMP, rw(), 0, 0]),
            KernelError::BadEnv.to_return()
        );
        assert_eq!(
            syscall(&mut k, CPU0, ids[0], SYS_ENV_DESTROY, [ids[1].0 as u64, 0, 0, 0, 0]),
            KernelError::BadEnv.to_return()
        );
    }

    #[test]
    fn cputs_prints_or_kills() {
        let (mut k, ids) = booted(2);
        let e = ids[0];
        let data = UTEXT + 0x1000;
        k.user_store(e, data, b"hello, world").unwrap();
        assert_eq!(syscall(&mut k, CPU0, e, SYS_CPUTS, [data, 12, 0, 0, 0]), 0);
        assert!(k.console_contains("hello, world"));

        let frame = {
            let mut f = k.env(e).unwrap().tf;
            f.set_syscall_args(SYS_CPUTS, [0x10, 4, 0, 0, 0]);
            f
        };
        k.raise(CPU0, frame, crate::arch::interrupts::TrapEntry::syscall());
        assert!(k.env(e).is_none());
        assert!(k.console_contains("user_mem_check assertion failure for va 00000010"));
    }

    #[test]
    fn self_destroy_says_goodbye() {
        let (mut k, ids) = booted(1);
        let mut frame = k.env(ids[0]).unwrap().tf;
        frame.set_syscall_args(SYS_ENV_DESTROY, [0; 5]);
        let r = k.raise(CPU0, frame, crate::arch::interrupts::TrapEntry::syscall());
        assert_eq!(r, Resumption::Halted { cpu: CPU0 });
        assert!(k.console_contains(&format!("[{}] exiting gracefully", ids[0])));
        assert!(k.console_contains(&format!("[{}] free env {}", ids[0], ids[0])));
        assert_eq!(k.free_frames(), k.config().nframes);
    }
}
