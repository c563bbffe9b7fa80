// kernel/src/kernel/sched.rs
//
// ラウンドロビンスケジューラと env_run。
// - 探索は curenv の次のスロットから環境表を一周する（curenv が無ければ 0 から）。
// - 他に Runnable が無く、curenv がこの CPU で Running ならそのまま続行。
// - それも無ければ CPU を停止する（sched_halt）。
// - どの経路でもロックを解放してから戻る。

use crate::arch::cpu::CpuStatus;
use crate::kernel::{EnvStatus, KernelState, LogEvent, Resumption};
use crate::logging;
use crate::types::{CpuId, EnvId};

impl KernelState {
    pub(crate) fn sched_yield(&mut self, cpu: CpuId) -> Resumption {
        let nenv = self.envs.len();
        let cur = self.cpus[cpu.0].curenv;
        let start = cur.map(|id| self.envs.index_of(id) + 1).unwrap_or(0);

        for i in 0..nenv {
            let index = (start + i) % nenv;
            let candidate = self
                .envs
                .slot(index)
                .filter(|e| e.status == EnvStatus::Runnable)
                .map(|e| e.id);
            if let Some(id) = candidate {
                return self.env_run(cpu, id);
            }
        }

        if let Some(id) = cur {
            let keep = self
                .envs
                .get(id)
                .map(|e| e.status == EnvStatus::Running && e.cpu == Some(cpu))
                .unwrap_or(false);
            if keep {
                return self.env_run(cpu, id);
            }
        }

        self.sched_halt(cpu)
    }

    /// 走らせるものが無い CPU を停止する。
    fn sched_halt(&mut self, cpu: CpuId) -> Resumption {
        let any_alive = self.envs.iter().any(|e| {
            matches!(
                e.status,
                EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying
            )
        });
        if !any_alive {
            self.cprintf(format_args!("No runnable environments in the system!"));
        }

        let info = &mut self.cpus[cpu.0];
        info.curenv = None;
        info.status = CpuStatus::Halted;
        // sti; hlt
        info.interrupts_enabled = true;

        if let Err(e) = self.lock.release(cpu) {
            return self.lock_violation(cpu, e);
        }
        self.counters.halts += 1;
        self.push_event(LogEvent::CpuHalted { cpu });
        logging::info_kv("sched_halt: cpu", cpu.0 as u64);
        Resumption::Halted { cpu }
    }

    /// env に切り替えて（iret で）再開する。
    pub(crate) fn env_run(&mut self, cpu: CpuId, id: EnvId) -> Resumption {
        if let Some(cur) = self.cpus[cpu.0].curenv {
            if cur != id {
                if let Some(prev) = self.envs.get_mut(cur) {
                    if prev.status == EnvStatus::Running {
                        prev.status = EnvStatus::Runnable;
                    }
                }
            }
        }

        let Some(env) = self.envs.get_mut(id) else {
            return self.fatal(cpu, format_args!("env_run: no such environment {}", id));
        };
        env.status = EnvStatus::Running;
        env.runs += 1;
        env.cpu = Some(cpu);
        let frame = env.tf;

        let info = &mut self.cpus[cpu.0];
        info.curenv = Some(id);
        // iret で RFLAGS が戻る
        info.interrupts_enabled = frame.interrupts_enabled();

        if let Err(e) = self.lock.release(cpu) {
            return self.lock_violation(cpu, e);
        }
        self.push_event(LogEvent::EnvRun { cpu, env: id });
        Resumption::Run { cpu, env: id, frame }
    }
}
