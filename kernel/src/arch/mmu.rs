// kernel/src/arch/mmu.rs
//
// 役割:
// - ユーザモードのメモリアクセスを PTE で検査し、失敗時に #PF エラーコードを作る。
//
// 設計方針:
// - エラーコードのビットは x86_64 crate の PageFaultErrorCode をそのまま使う。
// - ページ跨ぎのアクセスは、先頭から順に最初に失敗したページで fault する。

use x86_64::structures::idt::PageFaultErrorCode;

use crate::mem::addr::{self, PAGE_SIZE};
use crate::mem::address_space::AddressSpace;
use crate::mem::paging::{PageFlags, Pte};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    pub va: u64,
    pub err: PageFaultErrorCode,
}

/// 1 ページ分のユーザアクセス判定
pub fn check_user_page(aspace: &AddressSpace, va: u64, kind: AccessKind) -> Result<Pte, Fault> {
    let mut err = PageFaultErrorCode::USER_MODE;
    if kind == AccessKind::Write {
        err |= PageFaultErrorCode::CAUSED_BY_WRITE;
    }
    let Some(pte) = aspace.pte(va) else {
        return Err(Fault { va, err });
    };
    let allowed = pte.flags.contains(PageFlags::USER)
        && (kind == AccessKind::Read || pte.flags.contains(PageFlags::WRITABLE));
    if !allowed {
        err |= PageFaultErrorCode::PROTECTION_VIOLATION;
        return Err(Fault { va, err });
    }
    Ok(pte)
}

/// [va, va+len) 全体のユーザアクセス判定
pub fn check_user_range(
    aspace: &AddressSpace,
    va: u64,
    len: usize,
    kind: AccessKind,
) -> Result<(), Fault> {
    if len == 0 {
        return Ok(());
    }
    let end = va.saturating_add(len as u64);
    let mut page = addr::round_down(va, PAGE_SIZE);
    while page < end {
        check_user_page(aspace, page.max(va), kind)?;
        page += PAGE_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::FrameId;

    fn space() -> AddressSpace {
        let mut aspace = AddressSpace::new();
        let rw = PageFlags::USER_PRESENT | PageFlags::WRITABLE;
        aspace.insert(0x1000, Pte { frame: FrameId(1), flags: rw });
        aspace.insert(
            0x2000,
            Pte { frame: FrameId(2), flags: PageFlags::USER_PRESENT | PageFlags::COW },
        );
        aspace.insert(0x3000, Pte { frame: FrameId(3), flags: PageFlags::PRESENT });
        aspace
    }

    #[test]
    fn write_to_cow_page_is_protection_fault() {
        let aspace = space();
        assert!(check_user_page(&aspace, 0x2000, AccessKind::Read).is_ok());
        let f = check_user_page(&aspace, 0x2008, AccessKind::Write).unwrap_err();
        assert_eq!(f.va, 0x2008);
        assert!(f.err.contains(
            PageFaultErrorCode::PROTECTION_VIOLATION
                | PageFaultErrorCode::CAUSED_BY_WRITE
                | PageFaultErrorCode::USER_MODE
        ));
    }

    #[test]
    fn missing_and_supervisor_pages_fault() {
        let aspace = space();
        let f = check_user_page(&aspace, 0x9000, AccessKind::Read).unwrap_err();
        assert!(!f.err.contains(PageFaultErrorCode::PROTECTION_VIOLATION));
        let f = check_user_page(&aspace, 0x3000, AccessKind::Read).unwrap_err();
        assert!(f.err.contains(PageFaultErrorCode::PROTECTION_VIOLATION));
    }

    #[test]
    fn range_reports_first_failing_page() {
        let aspace = space();
        assert!(check_user_range(&aspace, 0x1ff0, 0x10, AccessKind::Write).is_ok());
        let f = check_user_range(&aspace, 0x1ff0, 0x20, AccessKind::Write).unwrap_err();
        assert_eq!(f.va, 0x2000);
    }
}
