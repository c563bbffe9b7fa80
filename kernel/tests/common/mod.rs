// kernel/tests/common/mod.rs
//
// 統合テスト用のシミュレータ。
// - 環境ごとに std スレッドを 1 本立て、CPU0 上で「カーネルが再開した環境」だけが進む。
// - カーネル状態は Mutex に入れ、trap の出口（Resumption）を Condvar で全スレッドに知らせる。
// - fork された子は Sys::child_forked で新しいスレッドとして生まれ、同じプログラムを
//   Start::ForkChild から実行する。

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use trapcore::arch::interrupts::TrapEntry;
use trapcore::arch::mmu::Fault;
use trapcore::arch::trapframe::TrapFrame;
use trapcore::kernel::{EnvType, UserImage};
use trapcore::mem::paging::Pte;
use trapcore::ulib::{self, Access, EnvView, Inherited, Sys, UserEnv, UserError};
use trapcore::{CpuId, EnvId, KernelConfig, KernelState, Resumption};

pub const CPU0: CpuId = CpuId(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Start {
    Boot,
    ForkChild,
}

pub type Program =
    Arc<dyn Fn(&mut UserEnv<UserProc>, Start) -> Result<(), UserError> + Send + Sync + 'static>;

pub fn program<F>(f: F) -> Program
where
    F: Fn(&mut UserEnv<UserProc>, Start) -> Result<(), UserError> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Shared {
    k: KernelState,
    /// CPU0 で今走っている環境と、その再開 frame
    running: Option<(EnvId, TrapFrame)>,
    halted: bool,
    aborted: bool,
    pending: Vec<(EnvId, Program)>,
    outcomes: BTreeMap<EnvId, Result<(), UserError>>,
}

pub struct Machine {
    state: Mutex<Shared>,
    turn: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Machine {
    pub fn new() -> Arc<Machine> {
        Machine::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Arc<Machine> {
        let k = KernelState::new(config).expect("valid config");
        Arc::new(Machine {
            state: Mutex::new(Shared {
                k,
                running: None,
                halted: false,
                aborted: false,
                pending: Vec::new(),
                outcomes: BTreeMap::new(),
            }),
            turn: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().expect("machine state poisoned")
    }

    /// boot 時に環境を作る（run までは走らない）
    pub fn spawn(&self, env_type: EnvType, prog: Program) -> EnvId {
        let mut s = self.lock();
        let id = s
            .k
            .env_create(&UserImage::minimal(), env_type)
            .expect("env_create");
        s.pending.push((id, prog));
        id
    }

    /// CPU0 を起動し、全環境のスレッドが終わるまで待つ
    pub fn run(self: &Arc<Self>) {
        let pending = {
            let mut s = self.lock();
            let r = s.k.start_cpu(CPU0);
            Self::publish(&mut s, r);
            std::mem::take(&mut s.pending)
        };
        for (env, prog) in pending {
            self.start_thread(env, prog, None);
        }
        self.turn.notify_all();

        loop {
            let handle = self.threads.lock().expect("threads poisoned").pop();
            match handle {
                Some(h) => h.join().expect("user thread panicked"),
                None => break,
            }
        }
    }

    fn start_thread(self: &Arc<Self>, env: EnvId, prog: Program, inherited: Option<Inherited<UserProc>>) {
        let m = Arc::clone(self);
        let handle = thread::spawn(move || {
            let _guard = ExitGuard { m: Arc::clone(&m), env };
            let outcome = run_env(&m, env, prog, inherited);
            m.lock().outcomes.insert(env, outcome);
        });
        self.threads.lock().expect("threads poisoned").push(handle);
    }

    fn publish(s: &mut Shared, r: Resumption) {
        match r {
            Resumption::Run { env, frame, .. } => s.running = Some((env, frame)),
            Resumption::Halted { .. } => {
                s.running = None;
                s.halted = true;
            }
            Resumption::Panicked => {
                s.running = None;
                s.halted = true;
            }
        }
    }

    /// env の番が来るまで待つ。環境が消えた / CPU が止まったら Killed。
    fn wait_turn(&self, mut s: MutexGuard<'_, Shared>, env: EnvId) -> Result<TrapFrame, UserError> {
        self.turn.notify_all();
        s = self
            .turn
            .wait_while(s, |s| {
                let mine = matches!(s.running, Some((e, _)) if e == env);
                !mine && s.k.env(env).is_some() && !s.halted && !s.aborted
            })
            .expect("machine state poisoned");
        match s.running {
            Some((e, frame)) if e == env && !s.aborted => Ok(frame),
            _ => Err(UserError::Killed),
        }
    }

    pub fn with_kernel<R>(&self, f: impl FnOnce(&KernelState) -> R) -> R {
        f(&self.lock().k)
    }

    pub fn with_kernel_mut<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        f(&mut self.lock().k)
    }

    pub fn outcome(&self, env: EnvId) -> Option<Result<(), UserError>> {
        self.lock().outcomes.get(&env).copied()
    }

    pub fn outcomes(&self) -> BTreeMap<EnvId, Result<(), UserError>> {
        self.lock().outcomes.clone()
    }

    pub fn console_contains(&self, needle: &str) -> bool {
        self.lock().k.console_contains(needle)
    }
}

fn run_env(
    m: &Arc<Machine>,
    env: EnvId,
    prog: Program,
    inherited: Option<Inherited<UserProc>>,
) -> Result<(), UserError> {
    let regs = {
        let s = m.lock();
        m.wait_turn(s, env)?
    };
    let proc = UserProc {
        m: Arc::clone(m),
        env,
        regs,
        prog: Arc::clone(&prog),
        killed: false,
    };

    let (mut u, start) = match inherited {
        None => (UserEnv::libmain(proc)?, Start::Boot),
        Some(inh) => {
            let mut u = UserEnv::from_inherited(proc, inh);
            ulib::child_start(&mut u)?;
            (u, Start::ForkChild)
        }
    };

    let result = prog(&mut u, start);
    match result {
        Ok(()) | Err(UserError::Sys(_)) => u.exit(),
        Err(UserError::Panicked(_)) | Err(UserError::Killed) => {}
    }
    result
}

/// スレッド終了時に他スレッドを起こす（panic で抜けたらマシンを止める）
struct ExitGuard {
    m: Arc<Machine>,
    env: EnvId,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Ok(mut s) = self.m.state.lock() {
            if thread::panicking() {
                s.aborted = true;
                s.outcomes.insert(self.env, Err(UserError::Killed));
            }
        }
        self.m.turn.notify_all();
    }
}

/// 1 つの環境を実行するスレッドから見たマシン
pub struct UserProc {
    m: Arc<Machine>,
    env: EnvId,
    regs: TrapFrame,
    prog: Program,
    /// 環境が破棄された後は二度と trap を起こさない
    killed: bool,
}

impl UserProc {
    pub fn env(&self) -> EnvId {
        self.env
    }

    pub fn with_kernel<R>(&self, f: impl FnOnce(&KernelState) -> R) -> R {
        self.m.with_kernel(f)
    }

    /// trap を起こし、再びこの環境の番になるまで待つ
    fn trap(&mut self, frame: TrapFrame, entry: TrapEntry) -> Result<(), UserError> {
        if self.killed {
            return Err(UserError::Killed);
        }
        let mut s = self.m.lock();
        let r = s.k.raise(CPU0, frame, entry);
        Machine::publish(&mut s, r);
        match self.m.wait_turn(s, self.env) {
            Ok(frame) => {
                self.regs = frame;
                Ok(())
            }
            Err(e) => {
                self.killed = true;
                Err(e)
            }
        }
    }

    /// ソフトウェア割り込み（int $vector）
    pub fn int(&mut self, vector: u8) -> Result<(), UserError> {
        self.trap(self.regs, TrapEntry::software(vector))
    }

    fn fault(&mut self, f: Fault) -> Access {
        match self.trap(self.regs, TrapEntry::page_fault(f.va, f.err)) {
            Ok(()) => Access::Upcall,
            Err(_) => Access::Killed,
        }
    }
}

impl Sys for UserProc {
    fn regs(&self) -> &TrapFrame {
        &self.regs
    }

    fn regs_mut(&mut self) -> &mut TrapFrame {
        &mut self.regs
    }

    fn syscall(&mut self, num: u64, args: [u64; 5]) -> Result<i64, UserError> {
        let mut frame = self.regs;
        frame.set_syscall_args(num, args);
        self.trap(frame, TrapEntry::syscall())?;
        Ok(self.regs.regs.rax as i64)
    }

    fn load(&mut self, va: u64, buf: &mut [u8]) -> Access {
        if self.killed {
            return Access::Killed;
        }
        let r = self.m.lock().k.user_load(self.env, va, buf);
        match r {
            Ok(()) => Access::Done,
            Err(f) => self.fault(f),
        }
    }

    fn store(&mut self, va: u64, data: &[u8]) -> Access {
        if self.killed {
            return Access::Killed;
        }
        let r = self.m.lock().k.user_store(self.env, va, data);
        match r {
            Ok(()) => Access::Done,
            Err(f) => self.fault(f),
        }
    }

    fn uvpd(&self, pdx: usize) -> bool {
        self.m.lock().k.uvpd(self.env, pdx)
    }

    fn uvpt(&self, va: u64) -> Option<Pte> {
        self.m.lock().k.pte(self.env, va)
    }

    fn nenv(&self) -> usize {
        self.m.lock().k.nenv()
    }

    fn env_slot(&self, index: usize) -> Option<EnvView> {
        let s = self.m.lock();
        s.k.envs().slot(index).filter(|e| e.is_live()).map(|e| EnvView {
            id: e.id,
            parent_id: e.parent_id,
            status: e.status,
            env_type: e.env_type,
            ipc: e.ipc,
        })
    }

    fn child_forked(&mut self, child: EnvId, inherited: Inherited<Self>) {
        let prog = Arc::clone(&self.prog);
        self.m.start_thread(child, prog, Some(inherited));
    }
}
