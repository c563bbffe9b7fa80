// kernel/src/ulib/mod.rs
//
// 役割:
// - ユーザ環境側のライブラリ（lib/ 相当）。カーネルには Sys トレイト越しにだけ触れる。
//
// やること:
// - syscall ラッパ（syscall.rs）
// - ページフォルトの trampoline とハンドラ登録（pgfault.rs）
// - copy-on-write fork（fork.rs）
// - IPC の送受信と ipc_find_env（ipc.rs）
//
// やらないこと:
// - 実際の命令実行・スレッド切り替え（Sys の実装側＝シミュレータの責務）。
//
// 設計方針:
// - load / store は MMU 検査つき。fault したら Sys はカーネルの trap を起こし、
//   upcall されたら Access::Upcall を返す。UserEnv が trampoline を回してから再試行する。
// - 環境が破棄されたら Access::Killed / UserError::Killed でユーザコードを巻き戻す。

pub mod fork;
pub mod ipc;
pub mod pgfault;
pub mod syscall;

use alloc::format;
use thiserror::Error;

use crate::arch::trapframe::{TrapFrame, UTrapframe};
use crate::kernel::{EnvStatus, EnvType, IpcMailbox, KernelError};
use crate::mem::paging::Pte;
use crate::types::EnvId;

pub use fork::{child_start, fork};
pub use ipc::{ipc_find_env, ipc_recv, ipc_send, Received};
pub use pgfault::{set_pgfault_handler, PGFAULT_UPCALL};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UserError {
    #[error("system call failed: {0}")]
    Sys(#[from] KernelError),
    #[error("user panic: {0}")]
    Panicked(&'static str),
    #[error("environment was destroyed")]
    Killed,
}

/// MMU 経由のアクセス結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Done,
    /// fault がユーザハンドラへ反映された（regs は trampoline 入口を指す）
    Upcall,
    Killed,
}

/// 読み取り専用の環境表（UENVS）の 1 スロット
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvView {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    pub env_type: EnvType,
    pub ipc: IpcMailbox,
}

/// ユーザ環境から見たマシン
pub trait Sys: Sized {
    /// 現在のユーザレジスタ
    fn regs(&self) -> &TrapFrame;
    fn regs_mut(&mut self) -> &mut TrapFrame;

    /// int $T_SYSCALL。戻ってきたときの rax を返す。
    fn syscall(&mut self, num: u64, args: [u64; 5]) -> Result<i64, UserError>;

    fn load(&mut self, va: u64, buf: &mut [u8]) -> Access;
    fn store(&mut self, va: u64, data: &[u8]) -> Access;

    /// uvpd: ディレクトリスロットが存在するか
    fn uvpd(&self, pdx: usize) -> bool;
    /// uvpt: va の PTE
    fn uvpt(&self, va: u64) -> Option<Pte>;

    fn nenv(&self) -> usize;
    /// 空きスロットは None
    fn env_slot(&self, index: usize) -> Option<EnvView>;

    /// fork が子を作り終えた（子を走らせる準備はここで）
    fn child_forked(&mut self, _child: EnvId, _inherited: Inherited<Self>) {}
}

pub type PgfaultHandler<S> = fn(&mut UserEnv<S>, &UTrapframe) -> Result<(), UserError>;

/// 子がそのまま受け継ぐユーザ側の状態（データセグメント相当）
pub struct Inherited<S: Sys> {
    pub pgfault_handler: Option<PgfaultHandler<S>>,
}

impl<S: Sys> Clone for Inherited<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Sys> Copy for Inherited<S> {}

pub struct UserEnv<S: Sys> {
    pub sys: S,
    thisenv: EnvId,
    pgfault_handler: Option<PgfaultHandler<S>>,
    panicking: bool,
}

impl<S: Sys> UserEnv<S> {
    /// libmain: thisenv を決めてからユーザコードに入る
    pub fn libmain(sys: S) -> Result<Self, UserError> {
        let mut u = UserEnv {
            sys,
            thisenv: EnvId::NULL,
            pgfault_handler: None,
            panicking: false,
        };
        u.thisenv = u.sys_getenvid()?;
        Ok(u)
    }

    /// fork の子。thisenv は child_start で決まる。
    pub fn from_inherited(sys: S, inherited: Inherited<S>) -> Self {
        UserEnv {
            sys,
            thisenv: EnvId::NULL,
            pgfault_handler: inherited.pgfault_handler,
            panicking: false,
        }
    }

    pub fn thisenv(&self) -> EnvId {
        self.thisenv
    }

    pub fn inherit(&self) -> Inherited<S> {
        Inherited {
            pgfault_handler: self.pgfault_handler,
        }
    }

    pub fn read_bytes(&mut self, va: u64, buf: &mut [u8]) -> Result<(), UserError> {
        loop {
            match self.sys.load(va, buf) {
                Access::Done => return Ok(()),
                Access::Upcall => pgfault::pgfault_upcall(self)?,
                Access::Killed => return Err(UserError::Killed),
            }
        }
    }

    pub fn write_bytes(&mut self, va: u64, data: &[u8]) -> Result<(), UserError> {
        loop {
            match self.sys.store(va, data) {
                Access::Done => return Ok(()),
                Access::Upcall => pgfault::pgfault_upcall(self)?,
                Access::Killed => return Err(UserError::Killed),
            }
        }
    }

    pub fn read_u64(&mut self, va: u64) -> Result<u64, UserError> {
        let mut b = [0u8; 8];
        self.read_bytes(va, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u64(&mut self, va: u64, value: u64) -> Result<(), UserError> {
        self.write_bytes(va, &value.to_le_bytes())
    }

    /// 文字列をスタック上に置いて sys_cputs で出す
    pub fn puts(&mut self, s: &str) -> Result<(), UserError> {
        if s.is_empty() {
            return Ok(());
        }
        let va = (self.sys.regs().rsp - s.len() as u64 - 128) & !0xf;
        self.write_bytes(va, s.as_bytes())?;
        self.sys_cputs(va, s.len())
    }

    /// ユーザ panic: メッセージを出して自分を破棄する。
    /// メッセージ出力中の fault で再度 panic したら、出力は諦めて破棄だけ行う。
    pub fn panic(&mut self, msg: &'static str) -> UserError {
        if !self.panicking {
            self.panicking = true;
            let line = format!("user panic: {}", msg);
            let _ = self.puts(&line);
        }
        let _ = self.sys_env_destroy(EnvId::NULL);
        UserError::Panicked(msg)
    }

    /// exit(): 自分を破棄する。戻ってこない。
    pub fn exit(&mut self) {
        let _ = self.sys_env_destroy(EnvId::NULL);
    }
}
