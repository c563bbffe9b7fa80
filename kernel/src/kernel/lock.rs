// kernel/src/kernel/lock.rs
//
// ビッグカーネルロック。
// - カーネルに入っている CPU は常に高々 1 つ。
// - 保持者を記録し、二重取得・他 CPU 保持中の取得・非保持者の解放を検出する。
//   （どれもカーネルの不変条件違反なので、呼び出し側は panic に倒す）

use thiserror::Error;

use crate::types::CpuId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("CPU {0} already holds the kernel lock")]
    Recursive(CpuId),
    #[error("kernel lock is held by CPU {holder}, CPU {cpu} cannot enter")]
    HeldElsewhere { holder: CpuId, cpu: CpuId },
    #[error("CPU {0} released a kernel lock it does not hold")]
    NotHolder(CpuId),
}

#[derive(Debug, Default)]
pub struct BigKernelLock {
    holder: Option<CpuId>,
    acquisitions: u64,
}

impl BigKernelLock {
    pub const fn new() -> Self {
        BigKernelLock {
            holder: None,
            acquisitions: 0,
        }
    }

    pub fn acquire(&mut self, cpu: CpuId) -> Result<(), LockError> {
        match self.holder {
            Some(h) if h == cpu => Err(LockError::Recursive(cpu)),
            Some(holder) => Err(LockError::HeldElsewhere { holder, cpu }),
            None => {
                self.holder = Some(cpu);
                self.acquisitions += 1;
                Ok(())
            }
        }
    }

    pub fn release(&mut self, cpu: CpuId) -> Result<(), LockError> {
        if self.holder != Some(cpu) {
            return Err(LockError::NotHolder(cpu));
        }
        self.holder = None;
        Ok(())
    }

    pub fn holder(&self) -> Option<CpuId> {
        self.holder
    }

    pub fn is_held_by(&self, cpu: CpuId) -> bool {
        self.holder == Some(cpu)
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_holder() {
        let mut lock = BigKernelLock::new();
        assert_eq!(lock.acquire(CpuId(0)), Ok(()));
        assert_eq!(lock.acquire(CpuId(0)), Err(LockError::Recursive(CpuId(0))));
        assert_eq!(
            lock.acquire(CpuId(1)),
            Err(LockError::HeldElsewhere { holder: CpuId(0), cpu: CpuId(1) })
        );
        assert_eq!(lock.release(CpuId(1)), Err(LockError::NotHolder(CpuId(1))));
        assert_eq!(lock.release(CpuId(0)), Ok(()));
        assert_eq!(lock.holder(), None);
        assert_eq!(lock.acquisitions(), 1);
    }
}
