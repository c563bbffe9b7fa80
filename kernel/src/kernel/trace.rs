// kernel/src/kernel/trace.rs
//
// 低コスト trace（観測性）を 1 箇所に集約する。
// - syscall 境界（ipc_try_send / ipc_recv の入口）を trace できる
// - IPC 内部の delivered / not_recv / rejected / recv_posted の “経路” を trace できる
// - trap 入口（ベクタ番号と発生元）を trace できる
//
// feature:
// - ipc_trace_syscall: syscall 境界 trace を有効化
// - ipc_trace_paths:   経路 trace を有効化（ipc_trace_syscall を内包）
// - trap_trace:        trap 入口 trace を有効化
//
// feature off のときは何も出さない（引数は捨てる）。

use crate::types::{CpuId, EnvId};

#[cfg(feature = "ipc_trace_syscall")]
#[derive(Clone, Copy)]
enum IpcSyscallKind {
    TrySend,
    Recv,
}

// ★重要：IpcPathEvent は “常に存在” させる（feature off でもコンパイル可能にする）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcPathEvent {
    Delivered,
    TrySendNotRecv,
    TrySendRejected,
    RecvPosted,
}

/// syscall 境界 trace（入口）: try_send
#[inline(always)]
pub fn trace_ipc_syscall_try_send(from: EnvId, to: EnvId, value: u64) {
    #[cfg(feature = "ipc_trace_syscall")]
    trace_ipc_syscall(IpcSyscallKind::TrySend, from, Some(to), value);
    #[cfg(not(feature = "ipc_trace_syscall"))]
    {
        let _ = from;
        let _ = to;
        let _ = value;
    }
}

/// syscall 境界 trace（入口）: recv
#[inline(always)]
pub fn trace_ipc_syscall_recv(env: EnvId, dstva: u64) {
    #[cfg(feature = "ipc_trace_syscall")]
    trace_ipc_syscall(IpcSyscallKind::Recv, env, None, dstva);
    #[cfg(not(feature = "ipc_trace_syscall"))]
    {
        let _ = env;
        let _ = dstva;
    }
}

/// IPC 内部の経路 trace（出口）
/// - ipc_trace_paths feature の時だけ 1 行を必ず出す
#[inline(always)]
pub fn trace_ipc_path(ev: IpcPathEvent) {
    #[cfg(feature = "ipc_trace_paths")]
    {
        match ev {
            IpcPathEvent::Delivered => crate::logging::info("ipc_trace_paths send=delivered"),
            IpcPathEvent::TrySendNotRecv => crate::logging::info("ipc_trace_paths send=not_recv"),
            IpcPathEvent::TrySendRejected => crate::logging::info("ipc_trace_paths send=rejected"),
            IpcPathEvent::RecvPosted => crate::logging::info("ipc_trace_paths recv=posted"),
        }
    }
    #[cfg(not(feature = "ipc_trace_paths"))]
    {
        let _ = ev;
    }
}

/// trap 入口 trace
#[inline(always)]
pub fn trace_trap(cpu: CpuId, trapno: u64, from_user: bool) {
    #[cfg(feature = "trap_trace")]
    crate::logging::trace_fmt(format_args!(
        "trap_trace cpu={} trapno={} from_user={}",
        cpu, trapno, from_user
    ));
    #[cfg(not(feature = "trap_trace"))]
    {
        let _ = cpu;
        let _ = trapno;
        let _ = from_user;
    }
}

#[cfg(feature = "ipc_trace_syscall")]
fn trace_ipc_syscall(kind: IpcSyscallKind, env: EnvId, to: Option<EnvId>, arg: u64) {
    match kind {
        IpcSyscallKind::TrySend => crate::logging::info("ipc_trace kind=ipc_try_send"),
        IpcSyscallKind::Recv => crate::logging::info("ipc_trace kind=ipc_recv"),
    }

    crate::logging::info_hex("env", env.0 as u64);
    if let Some(to) = to {
        crate::logging::info_hex("to", to.0 as u64);
    }
    crate::logging::info_u64("arg", arg);
}
