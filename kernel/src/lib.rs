// kernel/src/lib.rs
//
// trapcore: マルチ CPU 教育用カーネルの trap / fault コア
//
// - arch:   TrapFrame / ゲートテーブル / per-CPU TSS / MMU アクセス判定
// - mem/mm: 論理ページテーブルと参照カウント付き物理フレーム arena
// - kernel: trap dispatch, page-fault upcall, syscall, 環境表, スケジューラ, IPC(kernel 側)
// - ulib:   ユーザ側ライブラリ（COW fork, IPC ランデブー, pgfault trampoline）
//
// ホスト上で決定的に動かせるよう、ハードウェアは「モデル」として表現する。
// trap 入口は KernelState::raise / KernelState::trap の 2 つだけ。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod kernel;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod panic;
pub mod types;
pub mod ulib;

pub use config::KernelConfig;
pub use kernel::{KernelError, KernelState, Resumption};
pub use types::{CpuId, EnvId};
