// kernel/src/mem/layout.rs
//
// 仮想アドレスレイアウト（ユーザから見える固定アドレス群）
//
//   0 .. UTEMP               : 未使用
//   UTEMP .. UTEXT           : 一時マップ用（PFTEMP は最後のページ）
//   UTEXT ..                 : ユーザプログラム
//   .. USTACKTOP             : 通常ユーザスタック（下向き）
//   USTACKTOP .. UXSTACKTOP  : ガードページ 1 枚 + 例外スタック 1 枚
//   UTOP                     : ユーザが syscall で触れる範囲の上限
//
//   KSTACKTOP 以下 : CPU ごとのカーネルスタック（KSTKSIZE + KSTKGAP 間隔）

use crate::mem::addr::{PAGE_SIZE, PTSIZE};

/// ユーザ空間の上限（この値以上は「ページなし」の番兵として使われる）
pub const UTOP: u64 = 0x8000_0000;

/// ユーザ例外スタックの上端（1 ページ）
pub const UXSTACKTOP: u64 = UTOP;

/// 通常ユーザスタックの上端（例外スタックとの間にガードページ 1 枚）
pub const USTACKTOP: u64 = UTOP - 2 * PAGE_SIZE;

pub const UTEMP: u64 = PTSIZE;

/// COW 解決で使う一時ページ
pub const PFTEMP: u64 = UTEMP + PTSIZE - PAGE_SIZE;

pub const UTEXT: u64 = 2 * PTSIZE;

/// CPU0 のカーネルスタック上端（canonical high half）
pub const KSTACKTOP: u64 = 0xffff_ffff_f000_0000;
pub const KSTKSIZE: u64 = 8 * PAGE_SIZE;
pub const KSTKGAP: u64 = 8 * PAGE_SIZE;
