// kernel/src/ulib/syscall.rs
//
// syscall ラッパ。負の戻り値は KernelError に戻して返す。

use crate::kernel::syscall::{
    SYS_CPUTS, SYS_ENV_DESTROY, SYS_ENV_SET_PGFAULT_UPCALL, SYS_ENV_SET_STATUS, SYS_EXOFORK,
    SYS_GETENVID, SYS_IPC_RECV, SYS_IPC_TRY_SEND, SYS_PAGE_ALLOC, SYS_PAGE_MAP, SYS_PAGE_UNMAP,
    SYS_YIELD,
};
use crate::kernel::{EnvStatus, KernelError};
use crate::mem::paging::PageFlags;
use crate::types::EnvId;
use crate::ulib::{Sys, UserEnv, UserError};

impl<S: Sys> UserEnv<S> {
    fn syscall(&mut self, num: u64, args: [u64; 5]) -> Result<u64, UserError> {
        let ret = self.sys.syscall(num, args)?;
        Ok(KernelError::decode_return(ret)?)
    }

    pub fn sys_cputs(&mut self, va: u64, len: usize) -> Result<(), UserError> {
        self.syscall(SYS_CPUTS, [va, len as u64, 0, 0, 0]).map(|_| ())
    }

    pub fn sys_getenvid(&mut self) -> Result<EnvId, UserError> {
        self.syscall(SYS_GETENVID, [0; 5]).map(|v| EnvId(v as u32))
    }

    pub fn sys_env_destroy(&mut self, env: EnvId) -> Result<(), UserError> {
        self.syscall(SYS_ENV_DESTROY, [env.0 as u64, 0, 0, 0, 0]).map(|_| ())
    }

    pub fn sys_page_alloc(&mut self, env: EnvId, va: u64, perm: PageFlags) -> Result<(), UserError> {
        self.syscall(SYS_PAGE_ALLOC, [env.0 as u64, va, perm.bits(), 0, 0])
            .map(|_| ())
    }

    pub fn sys_page_map(
        &mut self,
        src_env: EnvId,
        src_va: u64,
        dst_env: EnvId,
        dst_va: u64,
        perm: PageFlags,
    ) -> Result<(), UserError> {
        self.syscall(
            SYS_PAGE_MAP,
            [src_env.0 as u64, src_va, dst_env.0 as u64, dst_va, perm.bits()],
        )
        .map(|_| ())
    }

    pub fn sys_page_unmap(&mut self, env: EnvId, va: u64) -> Result<(), UserError> {
        self.syscall(SYS_PAGE_UNMAP, [env.0 as u64, va, 0, 0, 0]).map(|_| ())
    }

    /// 親には子の ID、子には EnvId::NULL が返る
    pub fn sys_exofork(&mut self) -> Result<EnvId, UserError> {
        self.syscall(SYS_EXOFORK, [0; 5]).map(|v| EnvId(v as u32))
    }

    pub fn sys_env_set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), UserError> {
        self.syscall(SYS_ENV_SET_STATUS, [env.0 as u64, status.to_raw(), 0, 0, 0])
            .map(|_| ())
    }

    pub fn sys_env_set_pgfault_upcall(&mut self, env: EnvId, func: u64) -> Result<(), UserError> {
        self.syscall(SYS_ENV_SET_PGFAULT_UPCALL, [env.0 as u64, func, 0, 0, 0])
            .map(|_| ())
    }

    pub fn sys_yield(&mut self) -> Result<(), UserError> {
        self.syscall(SYS_YIELD, [0; 5]).map(|_| ())
    }

    pub fn sys_ipc_try_send(
        &mut self,
        env: EnvId,
        value: u64,
        srcva: u64,
        perm: PageFlags,
    ) -> Result<(), UserError> {
        self.syscall(SYS_IPC_TRY_SEND, [env.0 as u64, value, srcva, perm.bits(), 0])
            .map(|_| ())
    }

    pub fn sys_ipc_recv(&mut self, dstva: u64) -> Result<(), UserError> {
        self.syscall(SYS_IPC_RECV, [dstva, 0, 0, 0, 0]).map(|_| ())
    }
}
