// kernel/src/mem/paging.rs
//
// 役割:
// - PTE の属性ビットと、ページ単位のメモリ操作イベントを定義する。
// - ユーザが syscall で指定できる権限の検査もここに置く。

use x86_64::structures::paging::PageTableFlags;

use crate::mem::addr::VirtPage;
use crate::mm::FrameId;

bitflags::bitflags! {
    /// ページ属性
    ///
    /// - PRESENT / WRITABLE / USER: ハードウェア定義
    /// - AVAIL: ソフトウェアが自由に使える 3 bit（9..11）
    /// - COW: AVAIL のうち bit 11 を copy-on-write の印に使う
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const AVAIL = 0b111 << 9;
        const COW = 1 << 11;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermError {
    /// PRESENT|USER が欠けている
    MissingRequired,
    /// syscall で指定できないビットが立っている
    Disallowed,
    /// WRITABLE と COW を同時に指定した
    WritableCow,
}

impl PageFlags {
    /// ユーザが syscall で指定してよいビット全体
    pub const SYSCALL: PageFlags = PageFlags::PRESENT
        .union(PageFlags::WRITABLE)
        .union(PageFlags::USER)
        .union(PageFlags::AVAIL);

    /// ユーザマッピングとして最低限必要なビット
    pub const USER_PRESENT: PageFlags = PageFlags::PRESENT.union(PageFlags::USER);

    pub fn check_user_perm(self) -> Result<(), PermError> {
        if !self.contains(PageFlags::USER_PRESENT) {
            return Err(PermError::MissingRequired);
        }
        if !PageFlags::SYSCALL.contains(self) {
            return Err(PermError::Disallowed);
        }
        if self.contains(PageFlags::WRITABLE | PageFlags::COW) {
            return Err(PermError::WritableCow);
        }
        Ok(())
    }

    /// ハードウェア PTE 表現への変換（モニタ表示用）
    pub fn to_x86(self) -> PageTableFlags {
        let mut hw = PageTableFlags::empty();
        if self.contains(PageFlags::PRESENT) {
            hw |= PageTableFlags::PRESENT;
        }
        if self.contains(PageFlags::WRITABLE) {
            hw |= PageTableFlags::WRITABLE;
        }
        if self.contains(PageFlags::USER) {
            hw |= PageTableFlags::USER_ACCESSIBLE;
        }
        if self.contains(PageFlags::COW) {
            hw |= PageTableFlags::BIT_11;
        }
        hw
    }
}

/// ページテーブルエントリ（present なものだけを保持する）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PageFlags,
}

impl Pte {
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }

    pub fn is_cow(&self) -> bool {
        self.flags.contains(PageFlags::COW)
    }

    pub fn is_user(&self) -> bool {
        self.flags.contains(PageFlags::USER)
    }

    /// 物理アドレス | 属性ビット の生 PTE 値
    pub fn raw(&self) -> u64 {
        self.frame.start_address() | self.flags.bits()
    }
}

/// ページ単位のメモリ操作を表現する抽象イベント。
///
/// - Map: 「この仮想ページを、この物理フレームに、この属性でマップした」
/// - Unmap: 「この仮想ページのマッピングを解除した」
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemAction {
    Map {
        page: VirtPage,
        frame: FrameId,
        flags: PageFlags,
    },
    Unmap {
        page: VirtPage,
    },
}
