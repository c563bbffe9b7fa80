// kernel/src/ulib/pgfault.rs
//
// 役割:
// - ユーザレベルのページフォルトハンドラを登録する（set_pgfault_handler）。
// - カーネルが upcall で飛んでくる入口（pgfault_upcall trampoline）を持つ。
//
// trampoline の流れ:
// 1. rsp が指す UTrapframe を読む
// 2. 登録済みハンドラを呼ぶ
// 3. trap 時の rip を trap 時スタックの 1 語下（utf.rsp - 8）に積む
// 4. 汎用レジスタと rflags を戻し、rsp = utf.rsp - 8 にして ret
//
// 再帰 fault のときは trap 時スタック＝例外スタックなので、
// カーネルが空けておいた 1 語に rip が入る。

use crate::arch::trapframe::UTrapframe;
use crate::mem::addr::PAGE_SIZE;
use crate::mem::layout::{UTEXT, UXSTACKTOP};
use crate::mem::paging::PageFlags;
use crate::types::EnvId;
use crate::ulib::{PgfaultHandler, Sys, UserEnv, UserError};

/// trampoline の（ユーザテキスト上の）入口アドレス
pub const PGFAULT_UPCALL: u64 = UTEXT + 0x800;

/// ハンドラを登録する。初回だけ例外スタックを確保して upcall を登録する。
pub fn set_pgfault_handler<S: Sys>(u: &mut UserEnv<S>, handler: PgfaultHandler<S>) -> Result<(), UserError> {
    if u.pgfault_handler.is_none() {
        let perm = PageFlags::USER_PRESENT | PageFlags::WRITABLE;
        if u.sys_page_alloc(EnvId::NULL, UXSTACKTOP - PAGE_SIZE, perm).is_err() {
            return Err(u.panic("set_pgfault_handler: no exception stack"));
        }
        if u.sys_env_set_pgfault_upcall(EnvId::NULL, PGFAULT_UPCALL).is_err() {
            return Err(u.panic("set_pgfault_handler: cannot register upcall"));
        }
    }
    u.pgfault_handler = Some(handler);
    Ok(())
}

pub(crate) fn pgfault_upcall<S: Sys>(u: &mut UserEnv<S>) -> Result<(), UserError> {
    if u.sys.regs().rip != PGFAULT_UPCALL {
        return Err(u.panic("page fault upcall to an unknown entry"));
    }

    let frame_va = u.sys.regs().rsp;
    let mut bytes = [0u8; UTrapframe::SIZE];
    u.read_bytes(frame_va, &mut bytes)?;
    let Some(utf) = UTrapframe::from_bytes(&bytes) else {
        return Err(u.panic("malformed exception frame"));
    };

    let Some(handler) = u.pgfault_handler else {
        return Err(u.panic("page fault upcall without a handler"));
    };
    handler(u, &utf)?;

    // trap 時スタックへ戻り先を積む
    let ret_slot = utf.rsp - 8;
    u.write_u64(ret_slot, utf.rip)?;

    let regs = u.sys.regs_mut();
    regs.regs = utf.regs;
    regs.rflags = utf.rflags;
    regs.rsp = ret_slot;

    // ret
    let rip = u.read_u64(ret_slot)?;
    let regs = u.sys.regs_mut();
    regs.rip = rip;
    regs.rsp = ret_slot + 8;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::*;
    use crate::mem::addr;
    use crate::mem::layout::USTACKTOP;

    const FAR: u64 = 0x1000_0000;

    fn alloc_on_fault(u: &mut UserEnv<KernelSys<'_>>, utf: &UTrapframe) -> Result<(), UserError> {
        let page = addr::round_down(utf.fault_va, PAGE_SIZE);
        u.sys_page_alloc(EnvId::NULL, page, PageFlags::USER_PRESENT | PageFlags::WRITABLE)
    }

    fn refuse(_u: &mut UserEnv<KernelSys<'_>>, _utf: &UTrapframe) -> Result<(), UserError> {
        Err(UserError::Panicked("refused"))
    }

    #[test]
    fn handler_maps_the_page_and_the_store_is_retried() {
        let (mut k, ids) = booted(1);
        let mut u = UserEnv::libmain(KernelSys::new(&mut k, ids[0])).unwrap();
        set_pgfault_handler(&mut u, alloc_on_fault).unwrap();
        let xstack = u.sys.uvpt(UXSTACKTOP - PAGE_SIZE).unwrap();

        u.write_u64(FAR + 0x10, 7).unwrap();
        assert_eq!(u.read_u64(FAR + 0x10).unwrap(), 7);

        // trampoline から戻った後のレジスタ
        assert_eq!(u.sys.regs().rsp, USTACKTOP);
        assert_ne!(u.sys.regs().rip, PGFAULT_UPCALL);
        // 戻り先は trap 時スタックの 1 語下に積まれていた
        assert_eq!(u.read_u64(USTACKTOP - 8).unwrap(), u.sys.regs().rip);

        // 2 回目の登録では例外スタックを作り直さない
        set_pgfault_handler(&mut u, alloc_on_fault).unwrap();
        assert_eq!(u.sys.uvpt(UXSTACKTOP - PAGE_SIZE), Some(xstack));
        u.sys.k.check_invariants().unwrap();
    }

    #[test]
    fn handler_error_unwinds_the_access() {
        let (mut k, ids) = booted(1);
        let mut u = UserEnv::libmain(KernelSys::new(&mut k, ids[0])).unwrap();
        set_pgfault_handler(&mut u, refuse).unwrap();
        assert_eq!(u.write_u64(FAR, 1), Err(UserError::Panicked("refused")));
        assert!(u.sys.uvpt(FAR).is_none());
    }
}
