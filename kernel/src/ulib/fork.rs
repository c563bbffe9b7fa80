// kernel/src/ulib/fork.rs
//
// 役割:
// - copy-on-write fork をユーザ空間だけで実装する。
//
// やること:
// - exofork で空の子を作り、UTOP 未満の全ページを uvpd / uvpt で列挙して duppage する。
// - 書き込み可能 / COW のページは親子とも COW で張り直す（親が既に COW でも張り直す）。
// - 読み取り専用ページはそのまま共有する。
// - 例外スタックは共有せず、子には新しいページを与える。
// - 書き込み fault を受けたら PFTEMP に複製してから張り替える（cow_fault）。
//
// やらないこと:
// - sfork（共有メモリ fork）。
//
// 設計方針:
// - 資源不足（-E_NO_MEM / -E_NO_FREE_ENV）は呼び出し元の環境にとって致命的（panic）。

use alloc::vec;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::arch::trapframe::UTrapframe;
use crate::kernel::EnvStatus;
use crate::logging;
use crate::mem::addr::{self, PAGE_SIZE, PGSIZE, PTE_COUNT};
use crate::mem::layout::{PFTEMP, UTOP, UXSTACKTOP};
use crate::mem::paging::{PageFlags, Pte};
use crate::types::EnvId;
use crate::ulib::pgfault::{set_pgfault_handler, PGFAULT_UPCALL};
use crate::ulib::{Sys, UserEnv, UserError};

/// fork。親には子の ID、子には EnvId::NULL を返す。
///
/// Sys の実装が子を別の実行主体で走らせる場合、子は child_start から始まる。
pub fn fork<S: Sys>(u: &mut UserEnv<S>) -> Result<EnvId, UserError> {
    set_pgfault_handler(u, cow_fault::<S>)?;

    let child = match u.sys_exofork() {
        Ok(id) => id,
        Err(UserError::Killed) => return Err(UserError::Killed),
        Err(_) => return Err(u.panic("fork: sys_exofork failed")),
    };
    if child.is_null() {
        child_start(u)?;
        return Ok(EnvId::NULL);
    }

    for pdx in 0..addr::pdx(UTOP) {
        if !u.sys.uvpd(pdx) {
            continue;
        }
        for ptx in 0..PTE_COUNT {
            let va = addr::page_address(pdx, ptx);
            if va == UXSTACKTOP - PAGE_SIZE {
                continue;
            }
            let Some(pte) = u.sys.uvpt(va) else {
                continue;
            };
            if pte.flags.contains(PageFlags::USER_PRESENT) {
                duppage(u, child, va, pte)?;
            }
        }
    }

    let perm = PageFlags::USER_PRESENT | PageFlags::WRITABLE;
    if u.sys_page_alloc(child, UXSTACKTOP - PAGE_SIZE, perm).is_err() {
        return Err(u.panic("fork: cannot allocate the child's exception stack"));
    }
    if u.sys_env_set_pgfault_upcall(child, PGFAULT_UPCALL).is_err() {
        return Err(u.panic("fork: cannot set the child's upcall"));
    }

    let inherited = u.inherit();
    u.sys.child_forked(child, inherited);

    if u.sys_env_set_status(child, EnvStatus::Runnable).is_err() {
        return Err(u.panic("fork: cannot start the child"));
    }
    Ok(child)
}

/// 子側の fork の続き: thisenv を自分に向け直す
pub fn child_start<S: Sys>(u: &mut UserEnv<S>) -> Result<(), UserError> {
    u.thisenv = u.sys_getenvid()?;
    Ok(())
}

fn duppage<S: Sys>(u: &mut UserEnv<S>, child: EnvId, va: u64, pte: Pte) -> Result<(), UserError> {
    if pte.is_writable() || pte.is_cow() {
        let perm = PageFlags::USER_PRESENT | PageFlags::COW;
        // 子を先に COW にしてから親を張り直す
        if u.sys_page_map(EnvId::NULL, va, child, va, perm).is_err() {
            return Err(u.panic("duppage: cannot map into the child"));
        }
        if u.sys_page_map(EnvId::NULL, va, EnvId::NULL, va, perm).is_err() {
            return Err(u.panic("duppage: cannot remap the parent"));
        }
    } else if u.sys_page_map(EnvId::NULL, va, child, va, PageFlags::USER_PRESENT).is_err() {
        return Err(u.panic("duppage: cannot share a read-only page"));
    }
    Ok(())
}

/// COW ページへの書き込み fault を解決する
pub fn cow_fault<S: Sys>(u: &mut UserEnv<S>, utf: &UTrapframe) -> Result<(), UserError> {
    let va = utf.fault_va;
    let err = PageFaultErrorCode::from_bits_truncate(utf.err);
    let write = err.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let pte = u.sys.uvpt(va);

    match pte {
        // 既に解決済み（同じ fault が二度届いた）
        Some(p) if write && p.is_writable() => {
            logging::info_hex("cow_fault: already writable", va);
            return Ok(());
        }
        _ if !write => return Err(u.panic("cow_fault: not a write access")),
        Some(p) if p.is_cow() => {}
        _ => return Err(u.panic("cow_fault: not a copy-on-write page")),
    }

    let page = addr::round_down(va, PAGE_SIZE);
    let perm = PageFlags::USER_PRESENT | PageFlags::WRITABLE;
    if u.sys_page_alloc(EnvId::NULL, PFTEMP, perm).is_err() {
        return Err(u.panic("cow_fault: out of memory"));
    }

    let mut buf = vec![0u8; PGSIZE];
    u.read_bytes(page, &mut buf)?;
    u.write_bytes(PFTEMP, &buf)?;

    if u.sys_page_map(EnvId::NULL, PFTEMP, EnvId::NULL, page, perm).is_err() {
        return Err(u.panic("cow_fault: cannot map the private copy"));
    }
    if u.sys_page_unmap(EnvId::NULL, PFTEMP).is_err() {
        return Err(u.panic("cow_fault: cannot unmap PFTEMP"));
    }
    Ok(())
}
