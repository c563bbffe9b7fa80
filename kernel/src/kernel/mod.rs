// src/kernel/mod.rs
//
// trapcore: マルチ CPU・ビッグカーネルロック・環境（プロセス）表を持つ教育用カーネルの中核
//
// - KernelState: 物理メモリ / 環境表 / CPU 群 / GDT / ロック / panic ラッチ / コンソール
// - trap 入口（raise / trap）から dispatch → 再開先の決定（Resumption）までを持つ
// - 再開は戻り値で表す。Resumption::Run は「この CPU はこの frame で iret した」を意味する
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. ロック
//    - カーネル内にいる CPU は高々 1 つ。env_run / sched_halt で必ず解放してから戻る。
//    - panic 時だけはロックを保持したまま停止する。
//
// 2. 環境と CPU
//    - Running な環境は、ちょうど 1 つの CPU の curenv になっている。
//
// 3. 参照カウント
//    - 各フレームの参照カウント = そのフレームを指す PTE の総数。
//
// これらは check_invariants() で検証できる（テストから毎ステップ呼ぶ）。

pub mod env;
pub mod error;
pub mod ipc;
pub mod lock;
pub mod monitor;
pub mod sched;
pub mod syscall;
pub mod trace;
pub mod trap;
pub mod upcall;

#[cfg(test)]
pub(crate) mod testutil;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use x86_64::structures::idt::PageFaultErrorCode;

use crate::arch::cpu::{CpuInfo, CpuStatus};
use crate::arch::gdt::{self, Gdt};
use crate::arch::interrupts::gate_table;
use crate::arch::mmu::{self, AccessKind, Fault};
use crate::arch::trapframe::TrapFrame;
use crate::config::{ConfigError, KernelConfig};
use crate::logging;
use crate::mem::addr::{VirtPage, PAGE_SIZE, PGSIZE};
use crate::mem::paging::{MemAction, PageFlags, Pte};
use crate::mm::{FrameId, PhysicalMemoryManager};
use crate::panic::{KernelPanic, PanicLatch};
use crate::types::{CpuId, EnvId};

pub use env::{Env, EnvStatus, EnvTable, EnvType, IpcMailbox, Segment, UserImage};
pub use error::KernelError;
pub use lock::{BigKernelLock, LockError};
pub use monitor::{Monitor, MonitorCommand, ResumeMonitor};

const EVENT_LOG_CAP: usize = 1024;
const CONSOLE_CAP: usize = 4096;

//
// ──────────────────────────────────────────────
// Resumption（trap の出口）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resumption {
    /// env を frame の状態で再開した（iret 相当）
    Run {
        cpu: CpuId,
        env: EnvId,
        frame: TrapFrame,
    },
    /// CPU は割り込み待ちで停止した
    Halted { cpu: CpuId },
    /// kernel panic がラッチされている
    Panicked,
}

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    TrapEntered { cpu: CpuId, trapno: u64, from_user: bool },
    SyscallHandled { env: EnvId, num: u64, ret: i64 },
    EnvCreated { env: EnvId },
    EnvFreed { env: EnvId },
    EnvRun { cpu: CpuId, env: EnvId },

    /// どの環境の空間に、どんな MemAction を起こしたか。
    MemActionApplied { env: EnvId, action: MemAction },

    UpcallDelivered { env: EnvId, fault_va: u64, frame_va: u64 },
    UserFaultKilled { env: EnvId, fault_va: u64 },

    IpcRecvPosted { env: EnvId, dstva: u64 },
    IpcTrySendNotRecv { from: EnvId, to: EnvId },
    IpcTrySendRejected { from: EnvId, to: EnvId, err: KernelError },
    IpcDelivered { from: EnvId, to: EnvId, value: u64, perm: PageFlags },

    TimerAck { cpu: CpuId },
    SpuriousIrq { cpu: CpuId },
    MonitorEntered { cpu: CpuId, trapno: u64 },
    CpuHalted { cpu: CpuId },
    KernelPanicked { cpu: CpuId },
}

/// 観測用カウンタ
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelCounters {
    pub traps: u64,
    pub syscalls: u64,
    pub page_faults: u64,
    pub upcalls_delivered: u64,
    pub user_faults_killed: u64,
    pub envs_destroyed: u64,
    pub ipc_recv_posted: u64,
    pub ipc_try_send_delivered: u64,
    pub ipc_try_send_not_recv: u64,
    pub ipc_try_send_rejected: u64,
    pub timer_ticks: u64,
    pub spurious_irqs: u64,
    pub halts: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    RefcountMismatch { frame: FrameId, expected: u32, actual: u32 },
    RunningNotCurrent(EnvId),
    CurenvNotLive { cpu: CpuId },
    LockHeldOutsideKernel(CpuId),
}

//
// ──────────────────────────────────────────────
// KernelState（OS全体の状態）
// ──────────────────────────────────────────────
//

pub struct KernelState {
    config: KernelConfig,
    phys_mem: PhysicalMemoryManager,
    envs: EnvTable,
    cpus: Vec<CpuInfo>,
    gdt: Gdt,
    lock: BigKernelLock,
    panic: PanicLatch,
    monitor: Box<dyn Monitor>,

    console: Vec<String>,

    // 抽象イベントログ（古いものから捨てる）
    event_log: VecDeque<LogEvent>,
    counters: KernelCounters,
}

impl KernelState {
    pub fn new(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        // ゲートテーブルは全 CPU 共有。ここで構築しておく。
        let _ = gate_table();

        let cpus = (0..config.ncpu).map(|i| CpuInfo::new(CpuId(i))).collect();

        logging::info("kernel: state initialized");
        logging::info_kv("ncpu", config.ncpu as u64);
        logging::info_kv("nenv", config.nenv as u64);
        logging::info_kv("nframes", config.nframes as u64);

        Ok(KernelState {
            config,
            phys_mem: PhysicalMemoryManager::new(config.nframes),
            envs: EnvTable::new(config.nenv),
            cpus,
            gdt: Gdt::new(),
            lock: BigKernelLock::new(),
            panic: PanicLatch::new(),
            monitor: Box::new(ResumeMonitor::default()),
            console: Vec::new(),
            event_log: VecDeque::with_capacity(EVENT_LOG_CAP),
            counters: KernelCounters::default(),
        })
    }

    pub fn set_monitor(&mut self, monitor: Box<dyn Monitor>) {
        self.monitor = monitor;
    }

    /// CPU ごとの TSS を組み立ててロードする。
    /// 同じ TSS スロットを二度ロードするのは（実機なら triple fault の）致命的エラー。
    pub fn trap_init_percpu(&mut self, cpu: CpuId) -> Result<(), KernelPanic> {
        if cpu.0 >= self.cpus.len() {
            self.unknown_cpu(cpu);
            return Err(self.latched_panic(cpu, "trap_init_percpu"));
        }
        let ts = gdt::build_task_state(cpu);
        if let Err(e) = self.gdt.load_tss(ts.selector) {
            self.fatal(cpu, format_args!("trap_init_percpu: {:?}", e));
            return Err(self.latched_panic(cpu, "trap_init_percpu"));
        }
        let info = &mut self.cpus[cpu.0];
        info.task_state = Some(ts);
        info.interrupts_enabled = false;
        logging::info_kv("trap_init_percpu: cpu", cpu.0 as u64);
        logging::info_hex("trap_init_percpu: rsp0", ts.rsp0());
        Ok(())
    }

    /// CPU を起動してスケジューラに入る（BSP の i386_init / AP の mp_main 相当）。
    pub fn start_cpu(&mut self, cpu: CpuId) -> Resumption {
        if self.panic.is_latched() {
            return Resumption::Panicked;
        }
        if cpu.0 >= self.cpus.len() {
            return self.unknown_cpu(cpu);
        }
        if self.cpus[cpu.0].task_state.is_none() && self.trap_init_percpu(cpu).is_err() {
            return Resumption::Panicked;
        }
        if let Err(e) = self.lock.acquire(cpu) {
            return self.lock_violation(cpu, e);
        }
        self.cpus[cpu.0].status = CpuStatus::Started;
        self.sched_yield(cpu)
    }

    //
    // ──────────────────────────────────────────────
    // 観測 API
    // ──────────────────────────────────────────────
    //

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id)
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn nenv(&self) -> usize {
        self.envs.len()
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<&CpuInfo> {
        self.cpus.get(cpu.0)
    }

    pub fn curenv(&self, cpu: CpuId) -> Option<EnvId> {
        self.cpus.get(cpu.0).and_then(|c| c.curenv)
    }

    pub fn lock_holder(&self) -> Option<CpuId> {
        self.lock.holder()
    }

    pub fn panic_record(&self) -> Option<&KernelPanic> {
        self.panic.record()
    }

    pub fn counters(&self) -> &KernelCounters {
        &self.counters
    }

    pub fn events(&self) -> impl Iterator<Item = &LogEvent> {
        self.event_log.iter()
    }

    pub fn console(&self) -> &[String] {
        &self.console
    }

    pub fn console_contains(&self, needle: &str) -> bool {
        self.console.iter().any(|line| line.contains(needle))
    }

    pub fn free_frames(&self) -> usize {
        self.phys_mem.free_count()
    }

    pub fn frame_refcount(&self, frame: FrameId) -> u32 {
        self.phys_mem.refcount(frame)
    }

    pub fn pte(&self, env: EnvId, va: u64) -> Option<Pte> {
        self.envs.get(env)?.address_space.pte(va)
    }

    //
    // ──────────────────────────────────────────────
    // 内部ヘルパ
    // ──────────────────────────────────────────────
    //

    pub(crate) fn push_event(&mut self, ev: LogEvent) {
        if self.event_log.len() == EVENT_LOG_CAP {
            self.event_log.pop_front();
        }
        self.event_log.push_back(ev);
    }

    /// コンソール出力（cprintf）。複数行はそのまま行ごとに残す。
    pub(crate) fn cprintf(&mut self, args: fmt::Arguments<'_>) {
        let text = args.to_string();
        for line in text.lines() {
            logging::info(line);
            if self.console.len() == CONSOLE_CAP {
                self.console.remove(0);
            }
            self.console.push(line.to_string());
        }
    }

    /// 致命的エラー。panic をラッチし、この CPU を止める。
    pub(crate) fn fatal(&mut self, cpu: CpuId, args: fmt::Arguments<'_>) -> Resumption {
        let message = args.to_string();
        logging::error(&message);
        if self.panic.latch(cpu, message.clone()) {
            self.cprintf(format_args!("kernel panic on CPU {}: {}", cpu, message));
            self.push_event(LogEvent::KernelPanicked { cpu });
        }
        if let Some(info) = self.cpus.get_mut(cpu.0) {
            info.status = CpuStatus::Halted;
        }
        Resumption::Panicked
    }

    /// 設定にない CPU からの入口は致命的エラー
    pub(crate) fn unknown_cpu(&mut self, cpu: CpuId) -> Resumption {
        let ncpu = self.cpus.len();
        self.fatal(cpu, format_args!("unknown cpu {} (ncpu {})", cpu, ncpu))
    }

    fn latched_panic(&self, cpu: CpuId, what: &str) -> KernelPanic {
        self.panic_record().cloned().unwrap_or(KernelPanic {
            cpu,
            message: String::from(what),
        })
    }

    pub(crate) fn lock_violation(&mut self, cpu: CpuId, e: LockError) -> Resumption {
        self.fatal(cpu, format_args!("{}", e))
    }

    /// フレームを env の va にマップする（既存マッピングは置き換え）。
    /// 同じフレームを張り直す場合でも先に incref するので解放されない。
    pub(crate) fn page_insert(
        &mut self,
        env: EnvId,
        va: u64,
        frame: FrameId,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        let Some(e) = self.envs.get_mut(env) else {
            return Err(KernelError::BadEnv);
        };
        self.phys_mem.incref(frame);
        let page = VirtPage::containing(va);
        let action = MemAction::Map { page, frame, flags };
        if let Ok(Some(old)) = e.address_space.apply(action) {
            self.phys_mem.decref(old.frame);
        }
        self.push_event(LogEvent::MemActionApplied { env, action });
        Ok(())
    }

    pub(crate) fn page_remove(&mut self, env: EnvId, va: u64) {
        let Some(e) = self.envs.get_mut(env) else {
            return;
        };
        let action = MemAction::Unmap { page: VirtPage::containing(va) };
        // 未マップなら何もしない
        if let Ok(Some(old)) = e.address_space.apply(action) {
            self.phys_mem.decref(old.frame);
            self.push_event(LogEvent::MemActionApplied { env, action });
        }
    }

    /// カーネルによるユーザ空間への書き込み（権限は呼び出し側で検査済み）
    pub(crate) fn copy_to_user(&mut self, env: EnvId, va: u64, data: &[u8]) -> Result<(), KernelError> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = va + done as u64;
            let off = (cur & (PAGE_SIZE - 1)) as usize;
            let n = (PGSIZE - off).min(data.len() - done);
            let pte = self
                .envs
                .get(env)
                .and_then(|e| e.address_space.pte(cur))
                .ok_or(KernelError::Fault)?;
            let page = self.phys_mem.data_mut(pte.frame).ok_or(KernelError::Fault)?;
            page[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn copy_from_user(&self, env: EnvId, va: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va + done as u64;
            let off = (cur & (PAGE_SIZE - 1)) as usize;
            let n = (PGSIZE - off).min(buf.len() - done);
            let pte = self
                .envs
                .get(env)
                .and_then(|e| e.address_space.pte(cur))
                .ok_or(KernelError::Fault)?;
            let page = self.phys_mem.data(pte.frame).ok_or(KernelError::Fault)?;
            buf[done..done + n].copy_from_slice(&page[off..off + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn user_mem_check(&self, env: EnvId, va: u64, len: usize, perm: PageFlags) -> Result<(), u64> {
        match self.envs.get(env) {
            Some(e) => e.address_space.user_mem_check(va, len, perm | PageFlags::PRESENT),
            None => Err(va),
        }
    }

    //
    // ──────────────────────────────────────────────
    // ユーザモードの命令が行うメモリアクセス（MMU 経由）
    // ──────────────────────────────────────────────
    //

    /// env のユーザコードによる読み出し。失敗時は #PF の内容を返す。
    pub fn user_load(&self, env: EnvId, va: u64, buf: &mut [u8]) -> Result<(), Fault> {
        let aspace = match self.envs.get(env) {
            Some(e) => &e.address_space,
            None => return Err(Fault { va, err: PageFaultErrorCode::USER_MODE }),
        };
        mmu::check_user_range(aspace, va, buf.len(), AccessKind::Read)?;
        self.copy_from_user(env, va, buf)
            .map_err(|_| Fault { va, err: PageFaultErrorCode::USER_MODE })
    }

    /// env のユーザコードによる書き込み。全ページが書けるときだけ書く。
    pub fn user_store(&mut self, env: EnvId, va: u64, data: &[u8]) -> Result<(), Fault> {
        let fault = Fault {
            va,
            err: PageFaultErrorCode::USER_MODE | PageFaultErrorCode::CAUSED_BY_WRITE,
        };
        let aspace = match self.envs.get(env) {
            Some(e) => &e.address_space,
            None => return Err(fault),
        };
        mmu::check_user_range(aspace, va, data.len(), AccessKind::Write)?;
        self.copy_to_user(env, va, data).map_err(|_| fault)
    }

    /// uvpd 相当: ディレクトリスロットが存在するか
    pub fn uvpd(&self, env: EnvId, pdx: usize) -> bool {
        self.envs
            .get(env)
            .map(|e| e.address_space.directory_present(pdx))
            .unwrap_or(false)
    }

    //
    // ──────────────────────────────────────────────
    // 不変条件チェック
    // ──────────────────────────────────────────────
    //

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        // 1. 参照カウント = PTE の数
        let mut expected: BTreeMap<FrameId, u32> = BTreeMap::new();
        for env in self.envs.iter().filter(|e| e.is_live()) {
            for (_, pte) in env.address_space.mappings() {
                *expected.entry(pte.frame).or_insert(0) += 1;
            }
        }
        for (&frame, &count) in &expected {
            let actual = self.phys_mem.refcount(frame);
            if actual != count {
                logging::error("INVARIANT VIOLATION: frame refcount mismatch");
                return Err(InvariantViolation::RefcountMismatch { frame, expected: count, actual });
            }
        }

        // 2. Running な環境は自分の CPU の curenv
        for env in self.envs.iter().filter(|e| e.status == EnvStatus::Running) {
            let ok = env
                .cpu
                .map(|c| self.cpus[c.0].curenv == Some(env.id))
                .unwrap_or(false);
            if !ok {
                logging::error("INVARIANT VIOLATION: running env is not current on its cpu");
                return Err(InvariantViolation::RunningNotCurrent(env.id));
            }
        }

        for cpu in &self.cpus {
            if let Some(cur) = cpu.curenv {
                if self.envs.get(cur).is_none() {
                    logging::error("INVARIANT VIOLATION: curenv has been freed");
                    return Err(InvariantViolation::CurenvNotLive { cpu: cpu.id });
                }
            }
        }

        // 3. panic していなければ、trap の外でロックは解放されている
        if !self.panic.is_latched() {
            if let Some(holder) = self.lock.holder() {
                logging::error("INVARIANT VIOLATION: kernel lock held outside the kernel");
                return Err(InvariantViolation::LockHeldOutsideKernel(holder));
            }
        }
        Ok(())
    }

    /// イベントログの内容をログに流す（デバッグ用）
    pub fn dump_events(&self) {
        logging::info("=== KernelState Event Log Dump ===");
        for ev in self.event_log.iter() {
            logging::info_fmt(format_args!("{:?}", ev));
        }
        logging::info("=== End of Event Log ===");
        logging::info_fmt(format_args!("{:?}", self.counters));
    }
}
