// kernel/src/ulib/ipc.rs
//
// 役割:
// - IPC ランデブーのユーザ側。
//
// 設計方針:
// - 送信は try_send を -E_IPC_NOT_RECV の間だけ yield しながら再試行する。
// - それ以外の負値は送信側にとって致命的（panic）。資源不足も例外にしない。
// - 受信は sys_ipc_recv でブロックし、recving が落ちるまで yield してから
//   thisenv の公開 IPC 状態を読む。

use crate::kernel::{EnvType, KernelError};
use crate::mem::layout::UTOP;
use crate::mem::paging::PageFlags;
use crate::types::EnvId;
use crate::ulib::{Sys, UserEnv, UserError};

/// 受信結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    pub value: u64,
    pub from: EnvId,
    /// ページを受け取ったときだけ非空
    pub perm: PageFlags,
}

/// 受信する。pg が Some ならそこにページを受け取る。
/// 早く起こされた（誰かが Runnable にした）ときは、届くまで譲り続ける。
pub fn ipc_recv<S: Sys>(u: &mut UserEnv<S>, pg: Option<u64>) -> Result<Received, UserError> {
    u.sys_ipc_recv(pg.unwrap_or(UTOP))?;

    let me = u.thisenv();
    let slot = me.index(u.sys.nenv());
    loop {
        let Some(view) = u.sys.env_slot(slot).filter(|v| v.id == me) else {
            return Err(UserError::Killed);
        };
        if !view.ipc.recving {
            return Ok(Received {
                value: view.ipc.value,
                from: view.ipc.from,
                perm: view.ipc.perm,
            });
        }
        u.sys_yield()?;
    }
}

/// 送信する。相手が受信待ちになるまで yield して再試行する。
pub fn ipc_send<S: Sys>(
    u: &mut UserEnv<S>,
    to: EnvId,
    value: u64,
    pg: Option<u64>,
    perm: PageFlags,
) -> Result<(), UserError> {
    let srcva = pg.unwrap_or(UTOP);
    loop {
        match u.sys_ipc_try_send(to, value, srcva, perm) {
            Ok(()) => return Ok(()),
            Err(UserError::Sys(KernelError::IpcNotRecv)) => u.sys_yield()?,
            Err(UserError::Sys(_)) => return Err(u.panic("ipc_send: send failed")),
            Err(e) => return Err(e),
        }
    }
}

/// 指定種別の最初の環境を探す。無ければ EnvId::NULL。
pub fn ipc_find_env<S: Sys>(u: &UserEnv<S>, env_type: EnvType) -> EnvId {
    (0..u.sys.nenv())
        .filter_map(|i| u.sys.env_slot(i))
        .find(|v| v.env_type == env_type)
        .map(|v| v.id)
        .unwrap_or(EnvId::NULL)
}
