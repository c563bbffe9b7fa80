// src/mem/addr.rs
//
// 役割:
// - 仮想ページ番号と 2 段ページテーブルの index 計算を定義する。
// やること:
// - u64 の生アドレス値から「どのディレクトリスロット / どのエントリか」を求める。
// - ページ境界への丸め。
// やらないこと:
// - エントリの中身（PTE）の解釈は paging.rs に任せる。

use core::fmt;

/// ページサイズ（4KiB 固定）
pub const PAGE_SIZE: u64 = 4096;

/// バッファ長として使う版
pub const PGSIZE: usize = PAGE_SIZE as usize;

/// 1 つの葉テーブルが持つエントリ数
pub const PTE_COUNT: usize = 512;

/// 1 つのディレクトリスロットが覆う範囲（2MiB）
pub const PTSIZE: u64 = PAGE_SIZE * PTE_COUNT as u64;

pub const PTXSHIFT: u32 = 12;
pub const PDXSHIFT: u32 = 21;

/// 仮想ページ（4KiB ごとの番号）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtPage {
    pub number: u64, // page index = virt_addr / PAGE_SIZE
}

impl VirtPage {
    /// va を含むページ
    pub const fn containing(va: u64) -> Self {
        VirtPage {
            number: va / PAGE_SIZE,
        }
    }

    /// ページ先頭の仮想アドレスを返す。
    pub const fn start_address(self) -> u64 {
        self.number * PAGE_SIZE
    }

    /// インデックスから直接仮想ページを作る。
    pub const fn from_index(number: u64) -> Self {
        VirtPage { number }
    }

    /// ディレクトリスロット番号
    pub const fn pdx(self) -> usize {
        (self.number >> (PDXSHIFT - PTXSHIFT)) as usize
    }

    /// 葉テーブル内の index
    pub const fn ptx(self) -> usize {
        (self.number as usize) & (PTE_COUNT - 1)
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPage({:#x})", self.start_address())
    }
}

pub const fn pdx(va: u64) -> usize {
    (va >> PDXSHIFT) as usize
}

pub const fn ptx(va: u64) -> usize {
    ((va >> PTXSHIFT) as usize) & (PTE_COUNT - 1)
}

/// (pdx, ptx) からページ先頭アドレスを組み立てる。
pub const fn page_address(pdx: usize, ptx: usize) -> u64 {
    ((pdx as u64) << PDXSHIFT) | ((ptx as u64) << PTXSHIFT)
}

pub const fn round_down(va: u64, align: u64) -> u64 {
    va & !(align - 1)
}

pub const fn round_up(va: u64, align: u64) -> u64 {
    round_down(va + align - 1, align)
}

pub const fn is_page_aligned(va: u64) -> bool {
    va & (PAGE_SIZE - 1) == 0
}
