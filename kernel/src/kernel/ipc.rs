// kernel/src/kernel/ipc.rs
//
// IPC（カーネル側: 非ブロッキング try_send と、受信待ちの登録）
// - 受信側は recv で「待っている」ことと、ページを受け取る dstva を公開して眠る。
// - 送信側は try_send を繰り返す。受信側が待っていなければ即 -E_IPC_NOT_RECV。
// - 届けた時点で受信側の待ちは解除され、Runnable に戻り、recv は 0 を返したことになる。
//
// 設計メモ:
// - 同時に複数の送信者が来ても、ロック下の try_send は 1 つずつ処理されるので
//   勝つのは最初の 1 つだけ（2 番目は recving が落ちているので NOT_RECV）。
// - ページ転送は「送信側が UTOP 未満を指定」かつ「受信側が UTOP 未満で待っている」ときだけ。
//   受信側がページを望んでいなければ、値だけ届けて perm は空にする。
//
// ★fastpath/slowpath の代わりに counters:
// - delivered / not_recv / rejected を数える（ログ量は増やさない）

use crate::kernel::trace::{self, IpcPathEvent};
use crate::kernel::{EnvStatus, KernelError, KernelState, LogEvent, Resumption};
use crate::mem::addr;
use crate::mem::layout::UTOP;
use crate::mem::paging::PageFlags;
use crate::types::{CpuId, EnvId};

impl KernelState {
    pub(crate) fn sys_ipc_try_send(
        &mut self,
        cpu: CpuId,
        cur: EnvId,
        target: EnvId,
        value: u64,
        srcva: u64,
        perm: PageFlags,
    ) -> Result<u64, KernelError> {
        match self.ipc_try_send_inner(cpu, cur, target, value, srcva, perm) {
            Ok(()) => Ok(0),
            Err(KernelError::IpcNotRecv) => {
                self.counters.ipc_try_send_not_recv += 1;
                self.push_event(LogEvent::IpcTrySendNotRecv { from: cur, to: target });
                trace::trace_ipc_path(IpcPathEvent::TrySendNotRecv);
                Err(KernelError::IpcNotRecv)
            }
            Err(err) => {
                self.counters.ipc_try_send_rejected += 1;
                self.push_event(LogEvent::IpcTrySendRejected { from: cur, to: target, err });
                trace::trace_ipc_path(IpcPathEvent::TrySendRejected);
                Err(err)
            }
        }
    }

    fn ipc_try_send_inner(
        &mut self,
        cpu: CpuId,
        cur: EnvId,
        target: EnvId,
        value: u64,
        srcva: u64,
        perm: PageFlags,
    ) -> Result<(), KernelError> {
        let dst = self.envid2env(cpu, target, false)?;
        let mailbox = self.envs.get(dst).ok_or(KernelError::BadEnv)?.ipc;
        if !mailbox.recving {
            return Err(KernelError::IpcNotRecv);
        }

        let mut transferred = PageFlags::empty();
        if srcva < UTOP {
            if !addr::is_page_aligned(srcva) {
                return Err(KernelError::Inval);
            }
            perm.check_user_perm().map_err(|_| KernelError::Inval)?;
            let pte = self.pte(cur, srcva).ok_or(KernelError::Inval)?;
            if perm.contains(PageFlags::WRITABLE) && !pte.is_writable() {
                return Err(KernelError::Inval);
            }
            if mailbox.dstva < UTOP {
                self.page_insert(dst, mailbox.dstva, pte.frame, perm)?;
                transferred = perm;
            }
        }

        if let Some(env) = self.envs.get_mut(dst) {
            env.ipc.recving = false;
            env.ipc.from = cur;
            env.ipc.value = value;
            env.ipc.perm = transferred;
            env.status = EnvStatus::Runnable;
            // 受信側の recv は 0 を返す
            env.tf.regs.rax = 0;
        }

        self.counters.ipc_try_send_delivered += 1;
        self.push_event(LogEvent::IpcDelivered { from: cur, to: dst, value, perm: transferred });
        trace::trace_ipc_path(IpcPathEvent::Delivered);
        Ok(())
    }

    /// 受信待ちを登録して眠る。成功時は戻らない（Resumption を返す）。
    pub(crate) fn sys_ipc_recv(&mut self, cpu: CpuId, cur: EnvId, dstva: u64) -> Result<Resumption, KernelError> {
        if dstva < UTOP && !addr::is_page_aligned(dstva) {
            return Err(KernelError::Inval);
        }
        let Some(env) = self.envs.get_mut(cur) else {
            return Err(KernelError::BadEnv);
        };
        env.ipc.recving = true;
        env.ipc.dstva = dstva;
        env.status = EnvStatus::NotRunnable;
        env.tf.regs.rax = 0;

        self.counters.ipc_recv_posted += 1;
        self.push_event(LogEvent::IpcRecvPosted { env: cur, dstva });
        trace::trace_ipc_path(IpcPathEvent::RecvPosted);
        Ok(self.sched_yield(cpu))
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::syscall::{SYS_IPC_RECV, SYS_IPC_TRY_SEND, SYS_PAGE_ALLOC};
    use crate::kernel::testutil::*;
    use crate::kernel::{EnvStatus, KernelError, Resumption};
    use crate::mem::layout::{UTEMP, UTOP};
    use crate::mem::paging::PageFlags;

    fn rw() -> PageFlags {
        PageFlags::USER_PRESENT | PageFlags::WRITABLE
    }

    #[test]
    fn send_without_receiver_is_not_recv() {
        let (mut k, ids) = booted(2);
        let r = syscall(&mut k, CPU0, ids[0], SYS_IPC_TRY_SEND, [ids[1].0 as u64, 5, UTOP, 0, 0]);
        assert_eq!(r, KernelError::IpcNotRecv.to_return());
        assert_eq!(k.counters().ipc_try_send_not_recv, 1);
        assert_eq!(k.env(ids[1]).unwrap().ipc.value, 0);
    }

    #[test]
    fn recv_then_send_delivers_value_only() {
        let (mut k, ids) = booted(2);
        let (s, r) = (ids[1], ids[0]);

        // 受信側 (ids[0]) が先に待つ -> ids[1] に切り替わる
        let res = raw_syscall(&mut k, CPU0, r, SYS_IPC_RECV, [UTOP, 0, 0, 0, 0]);
        assert!(matches!(res, Resumption::Run { env, .. } if env == s));
        assert_eq!(k.env(r).unwrap().status, EnvStatus::NotRunnable);
        assert!(k.env(r).unwrap().ipc.recving);

        let ret = syscall(&mut k, CPU0, s, SYS_IPC_TRY_SEND, [r.0 as u64, 42, UTOP, 0, 0]);
        assert_eq!(ret, 0);
        let mb = k.env(r).unwrap().ipc;
        assert!(!mb.recving);
        assert_eq!(mb.value, 42);
        assert_eq!(mb.from, s);
        assert_eq!(mb.perm, PageFlags::empty());
        assert_eq!(k.env(r).unwrap().status, EnvStatus::Runnable);
        assert_eq!(k.env(r).unwrap().tf.regs.rax, 0);

        // 2 回目は待っていないので失敗
        let again = syscall(&mut k, CPU0, s, SYS_IPC_TRY_SEND, [r.0 as u64, 43, UTOP, 0, 0]);
        assert_eq!(again, KernelError::IpcNotRecv.to_return());
        assert_eq!(k.env(r).unwrap().ipc.value, 42);
    }

    #[test]
    fn page_is_shared_when_both_sides_ask() {
        let (mut k, ids) = booted(2);
        let (r, s) = (ids[0], ids[1]);
        raw_syscall(&mut k, CPU0, r, SYS_IPC_RECV, [UTEMP, 0, 0, 0, 0]);

        assert_eq!(syscall(&mut k, CPU0, s, SYS_PAGE_ALLOC, [0, UTEMP + 0x3000, rw().bits(), 0, 0]), 0);
        k.user_store(s, UTEMP + 0x3000, b"shared").unwrap();

        let ret = syscall(&mut k, CPU0, s, SYS_IPC_TRY_SEND, [r.0 as u64, 1, UTEMP + 0x3000, rw().bits(), 0]);
        assert_eq!(ret, 0);
        assert_eq!(k.env(r).unwrap().ipc.perm, rw());

        let mut buf = [0u8; 6];
        k.user_load(r, UTEMP, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
        let frame = k.pte(s, UTEMP + 0x3000).unwrap().frame;
        assert_eq!(k.frame_refcount(frame), 2);
        k.check_invariants().unwrap();
    }

    #[test]
    fn bad_page_arguments_are_rejected_and_receiver_keeps_waiting() {
        let (mut k, ids) = booted(2);
        let (r, s) = (ids[0], ids[1]);
        raw_syscall(&mut k, CPU0, r, SYS_IPC_RECV, [UTEMP, 0, 0, 0, 0]);

        let inval = KernelError::Inval.to_return();
        // 未マップ
        assert_eq!(syscall(&mut k, CPU0, s, SYS_IPC_TRY_SEND, [r.0 as u64, 1, UTEMP, rw().bits(), 0]), inval);
        // 境界ずれ
        assert_eq!(syscall(&mut k, CPU0, s, SYS_IPC_TRY_SEND, [r.0 as u64, 1, UTEMP + 4, rw().bits(), 0]), inval);
        // 読み取り専用ページを W で送る
        let text = crate::mem::layout::UTEXT;
        assert_eq!(syscall(&mut k, CPU0, s, SYS_IPC_TRY_SEND, [r.0 as u64, 1, text, rw().bits(), 0]), inval);
        // 存在しない相手
        assert_eq!(
            syscall(&mut k, CPU0, s, SYS_IPC_TRY_SEND, [0x5555, 1, UTOP, 0, 0]),
            KernelError::BadEnv.to_return()
        );
        assert!(k.env(r).unwrap().ipc.recving);
        assert_eq!(k.counters().ipc_try_send_rejected, 4);
    }

    #[test]
    fn recv_rejects_unaligned_destination() {
        let (mut k, ids) = booted(1);
        let ret = syscall(&mut k, CPU0, ids[0], SYS_IPC_RECV, [UTEMP + 1, 0, 0, 0, 0]);
        assert_eq!(ret, KernelError::Inval.to_return());
        assert!(!k.env(ids[0]).unwrap().ipc.recving);
    }

    #[test]
    fn lone_receiver_halts_the_cpu() {
        let (mut k, ids) = booted(1);
        let res = raw_syscall(&mut k, CPU0, ids[0], SYS_IPC_RECV, [UTOP, 0, 0, 0, 0]);
        assert_eq!(res, Resumption::Halted { cpu: CPU0 });
        assert_eq!(k.curenv(CPU0), None);
        k.check_invariants().unwrap();
    }
}
