// kernel/src/kernel/monitor.rs
//
// カーネルモニタとの接点。
// - ブレークポイント / デバッグ例外で enter_monitor が呼ばれ、Monitor が再開方法を決める。
// - continue は TF を落として再開、step は TF を立てて 1 命令だけ進める。
// - showmappings / setperm は KernelState の操作として公開する（対話シェルは持たない）。

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::trapframe::{TrapFrame, FL_TF};
use crate::kernel::trap::format_trapframe;
use crate::kernel::{KernelError, KernelState, LogEvent};
use crate::mem::addr::{self, PAGE_SIZE};
use crate::mem::address_space::PteLookup;
use crate::mem::paging::PageFlags;
use crate::types::{CpuId, EnvId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorCommand {
    /// TF を落として再開
    Continue,
    /// TF を立てて再開（次の命令の後で T_DEBUG）
    Step,
}

pub trait Monitor: Send {
    /// trap frame の表示文字列を受け取り、再開方法を返す。
    fn enter(&mut self, cpu: CpuId, tf: &TrapFrame, report: &str) -> MonitorCommand;
}

/// 何もせずに続行するモニタ（既定）
#[derive(Debug, Default)]
pub struct ResumeMonitor {
    pub entries: u64,
}

impl Monitor for ResumeMonitor {
    fn enter(&mut self, _cpu: CpuId, _tf: &TrapFrame, _report: &str) -> MonitorCommand {
        self.entries += 1;
        MonitorCommand::Continue
    }
}

impl KernelState {
    pub(crate) fn enter_monitor(&mut self, cpu: CpuId, tf: &TrapFrame) {
        self.push_event(LogEvent::MonitorEntered { cpu, trapno: tf.trapno });
        self.cprintf(format_args!("Welcome to the kernel monitor!"));
        let report = format_trapframe(cpu, tf, None);
        self.cprintf(format_args!("{}", report));

        let cmd = self.monitor.enter(cpu, tf, &report);

        let Some(cur) = self.cpus[cpu.0].curenv.filter(|_| tf.is_from_user()) else {
            return;
        };
        if let Some(env) = self.envs.get_mut(cur) {
            match cmd {
                MonitorCommand::Continue => env.tf.rflags &= !FL_TF,
                MonitorCommand::Step => env.tf.rflags |= FL_TF,
            }
        }
    }

    /// showmappings: [start, end] の各ページのマッピングを 1 行ずつ返す。
    pub fn monitor_show_mappings(&self, env: EnvId, start: u64, end: u64) -> Result<Vec<String>, KernelError> {
        let e = self.envs.get(env).ok_or(KernelError::BadEnv)?;
        let mut lines = Vec::new();
        let mut va = addr::round_down(start, PAGE_SIZE);
        while va <= end {
            let line = match e.address_space.lookup(va) {
                PteLookup::NoDirectory => format!("{:#014x}: no page table", va),
                PteLookup::NotMapped => format!("{:#014x}: not mapped", va),
                PteLookup::Entry(pte) => format!(
                    "{:#014x}: pa {:#014x} {}{}{}{} refs {} hw {:?}",
                    va,
                    pte.frame.start_address(),
                    if pte.flags.contains(PageFlags::PRESENT) { "P" } else { "-" },
                    if pte.flags.contains(PageFlags::WRITABLE) { "W" } else { "-" },
                    if pte.flags.contains(PageFlags::USER) { "U" } else { "-" },
                    if pte.flags.contains(PageFlags::COW) { " COW" } else { "" },
                    self.phys_mem.refcount(pte.frame),
                    pte.flags.to_x86(),
                ),
            };
            lines.push(line);
            match va.checked_add(PAGE_SIZE) {
                Some(next) => va = next,
                None => break,
            }
        }
        Ok(lines)
    }

    /// setperm: 1 ページの属性を書き換える（フレームは変えない）。
    /// W と COW は同時に立てられない。
    pub fn monitor_set_permissions(&mut self, env: EnvId, va: u64, flags: PageFlags) -> Result<(), KernelError> {
        if flags.contains(PageFlags::WRITABLE | PageFlags::COW) {
            return Err(KernelError::Inval);
        }
        let e = self.envs.get_mut(env).ok_or(KernelError::BadEnv)?;
        e.address_space
            .set_flags(va, flags | PageFlags::PRESENT)
            .map(|_| ())
            .map_err(|_| KernelError::Inval)
    }
}
