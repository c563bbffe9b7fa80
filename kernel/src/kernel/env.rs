// kernel/src/kernel/env.rs
//
// 役割:
// - 環境（ユーザプロセス）と環境表を定義する。
// - 環境のライフサイクル（生成 / 解放 / 破棄）を KernelState に実装する。
//
// 設計方針:
// - 環境表は固定長。空きスロットは LIFO（直前に解放されたスロットから再利用）。
// - EnvId はスロット index + 世代。解放済みスロットの古い ID は必ず無効になる。
// - 他 CPU で走っている環境は即座に解放できないので Dying にして、
//   その CPU が次に trap したときに解放させる。

use alloc::vec::Vec;

use crate::arch::trapframe::TrapFrame;
use crate::kernel::{KernelError, KernelState, LogEvent, Resumption};
use crate::mem::addr::{self, PAGE_SIZE};
use crate::mem::address_space::AddressSpace;
use crate::mem::layout::{USTACKTOP, UTEXT};
use crate::mem::paging::PageFlags;
use crate::types::{CpuId, EnvId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Dying,
    Runnable,
    Running,
    NotRunnable,
}

impl EnvStatus {
    pub const fn to_raw(self) -> u64 {
        match self {
            EnvStatus::Free => 0,
            EnvStatus::Dying => 1,
            EnvStatus::Runnable => 2,
            EnvStatus::Running => 3,
            EnvStatus::NotRunnable => 4,
        }
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => EnvStatus::Free,
            1 => EnvStatus::Dying,
            2 => EnvStatus::Runnable,
            3 => EnvStatus::Running,
            4 => EnvStatus::NotRunnable,
            _ => return None,
        })
    }
}

/// 特別扱いされる環境の種別（ipc_find_env で探す）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EnvType {
    #[default]
    User,
    FileServer,
    NetServer,
}

/// 受信側が公開する IPC 状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcMailbox {
    /// 受信待ち中か
    pub recving: bool,
    /// ページを受け取るアドレス（UTOP 以上なら受け取らない）
    pub dstva: u64,
    pub value: u64,
    pub from: EnvId,
    /// 受け取ったページの権限（ページ転送が無ければ空）
    pub perm: PageFlags,
}

impl Default for IpcMailbox {
    fn default() -> Self {
        IpcMailbox {
            recving: false,
            dstva: 0,
            value: 0,
            from: EnvId::NULL,
            perm: PageFlags::empty(),
        }
    }
}

pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub env_type: EnvType,
    pub status: EnvStatus,
    /// 最後に trap したときのレジスタ
    pub tf: TrapFrame,
    pub pgfault_upcall: Option<u64>,
    pub ipc: IpcMailbox,
    pub address_space: AddressSpace,
    /// 走っている（最後に走った）CPU
    pub cpu: Option<CpuId>,
    pub runs: u64,
}

impl Env {
    fn empty() -> Self {
        Env {
            id: EnvId::NULL,
            parent_id: EnvId::NULL,
            env_type: EnvType::User,
            status: EnvStatus::Free,
            tf: TrapFrame::default(),
            pgfault_upcall: None,
            ipc: IpcMailbox::default(),
            address_space: AddressSpace::new(),
            cpu: None,
            runs: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != EnvStatus::Free
    }
}

pub struct EnvTable {
    envs: Vec<Env>,
    /// 末尾から取り出す
    free_list: Vec<usize>,
}

impl EnvTable {
    pub fn new(nenv: usize) -> Self {
        let envs = (0..nenv).map(|_| Env::empty()).collect();
        let free_list = (0..nenv).rev().collect();
        EnvTable { envs, free_list }
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    /// 空きスロットを 1 つ取り、新しい世代の ID を割り当てる（状態は Runnable）。
    pub fn alloc(&mut self, parent: EnvId) -> Result<EnvId, KernelError> {
        let index = self.free_list.pop().ok_or(KernelError::NoFreeEnv)?;
        let nenv = self.envs.len();
        let env = &mut self.envs[index];
        env.id = EnvId::next_generation(env.id, index, nenv);
        env.parent_id = parent;
        env.env_type = EnvType::User;
        env.status = EnvStatus::Runnable;
        env.tf = TrapFrame::new_user(UTEXT, USTACKTOP);
        env.pgfault_upcall = None;
        env.ipc = IpcMailbox::default();
        env.cpu = None;
        env.runs = 0;
        Ok(env.id)
    }

    /// スロットを空きに戻す。アドレス空間は呼び出し側が先に解体しておく。
    fn release(&mut self, id: EnvId) {
        let index = id.index(self.envs.len());
        let env = &mut self.envs[index];
        if env.id != id || env.status == EnvStatus::Free {
            return;
        }
        env.status = EnvStatus::Free;
        env.pgfault_upcall = None;
        env.ipc = IpcMailbox::default();
        env.cpu = None;
        self.free_list.push(index);
    }

    /// 生きている環境だけを返す（古い世代の ID は None）
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.envs
            .get(id.index(self.envs.len()))
            .filter(|e| e.id == id && e.is_live())
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let nenv = self.envs.len();
        self.envs
            .get_mut(id.index(nenv))
            .filter(|e| e.id == id && e.is_live())
    }

    pub fn slot(&self, index: usize) -> Option<&Env> {
        self.envs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter()
    }

    pub fn index_of(&self, id: EnvId) -> usize {
        id.index(self.envs.len())
    }
}

/// ユーザプログラムのロード単位
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub va: u64,
    pub data: Vec<u8>,
    /// data より長ければ残りはゼロ埋め（bss）
    pub mem_size: usize,
    pub writable: bool,
}

/// env_create に渡すプログラムイメージ
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserImage {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

impl UserImage {
    pub fn new(entry: u64) -> Self {
        UserImage {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn with_segment(mut self, va: u64, data: &[u8], mem_size: usize, writable: bool) -> Self {
        self.segments.push(Segment {
            va,
            data: data.to_vec(),
            mem_size: mem_size.max(data.len()),
            writable,
        });
        self
    }

    /// テキスト 1 ページ + データ 1 ページだけの小さなプログラム
    pub fn minimal() -> Self {
        UserImage::new(UTEXT)
            .with_segment(UTEXT, &[0xcc, 0xeb, 0xfe], 3, false)
            .with_segment(UTEXT + PAGE_SIZE, &[], PAGE_SIZE as usize, true)
    }
}

impl KernelState {
    /// 新しい環境を作り、イメージをロードしてユーザスタックを用意する（boot 時専用）。
    pub fn env_create(&mut self, image: &UserImage, env_type: EnvType) -> Result<EnvId, KernelError> {
        let id = self.envs.alloc(EnvId::NULL)?;
        if let Err(e) = self.load_icode(id, image) {
            self.env_free_silently(id);
            return Err(e);
        }
        if let Some(env) = self.envs.get_mut(id) {
            env.env_type = env_type;
            env.tf = TrapFrame::new_user(image.entry, USTACKTOP);
        }
        self.push_event(LogEvent::EnvCreated { env: id });
        Ok(id)
    }

    fn load_icode(&mut self, id: EnvId, image: &UserImage) -> Result<(), KernelError> {
        for seg in &image.segments {
            let start = addr::round_down(seg.va, PAGE_SIZE);
            let end = addr::round_up(seg.va + seg.mem_size as u64, PAGE_SIZE);
            let mut flags = PageFlags::USER_PRESENT;
            if seg.writable {
                flags |= PageFlags::WRITABLE;
            }
            let mut va = start;
            while va < end {
                self.map_loader_page(id, va, flags)?;
                va += PAGE_SIZE;
            }
            self.copy_to_user(id, seg.va, &seg.data)?;
        }
        self.map_loader_page(
            id,
            USTACKTOP - PAGE_SIZE,
            PageFlags::USER_PRESENT | PageFlags::WRITABLE,
        )
    }

    fn map_loader_page(&mut self, id: EnvId, va: u64, flags: PageFlags) -> Result<(), KernelError> {
        let existing = self.envs.get(id).and_then(|e| e.address_space.pte(va));
        if let Some(pte) = existing {
            // 同じページを共有するセグメントは属性を和にする
            if let Some(env) = self.envs.get_mut(id) {
                let _ = env.address_space.set_flags(va, pte.flags | flags);
            }
            return Ok(());
        }
        let frame = self.phys_mem.allocate_frame().ok_or(KernelError::NoMem)?;
        self.page_insert(id, va, frame, flags)
    }

    /// アドレス空間を解体してスロットを空きに戻す。
    pub(crate) fn env_free(&mut self, cpu: CpuId, id: EnvId) {
        let cur = self.cpus[cpu.0].curenv.unwrap_or(EnvId::NULL);
        self.cprintf(format_args!("[{}] free env {}", cur, id));
        self.env_free_silently(id);
    }

    fn env_free_silently(&mut self, id: EnvId) {
        let Some(env) = self.envs.get_mut(id) else {
            return;
        };
        let ptes = env.address_space.drain();
        for pte in ptes {
            self.phys_mem.decref(pte.frame);
        }
        self.envs.release(id);
        self.push_event(LogEvent::EnvFreed { env: id });
    }

    /// 環境を破棄する。
    /// - 他 CPU で実行中なら Dying にするだけ（その CPU の次の trap で解放）。
    /// - 破棄したのがこの CPU の curenv なら、スケジューラに制御を渡す（Some）。
    pub(crate) fn env_destroy(&mut self, cpu: CpuId, id: EnvId) -> Option<Resumption> {
        let (status, on_cpu) = match self.envs.get(id) {
            Some(env) => (env.status, env.cpu),
            None => return None,
        };
        if status == EnvStatus::Running && on_cpu != Some(cpu) {
            if let Some(env) = self.envs.get_mut(id) {
                env.status = EnvStatus::Dying;
            }
            return None;
        }

        self.env_free(cpu, id);
        self.counters.envs_destroyed += 1;

        if self.cpus[cpu.0].curenv == Some(id) {
            self.cpus[cpu.0].curenv = None;
            return Some(self.sched_yield(cpu));
        }
        None
    }

    /// envid -> 環境。
    /// - EnvId::NULL は curenv。
    /// - checkperm のときは curenv 自身かその直接の子だけを許す。
    pub(crate) fn envid2env(&self, cpu: CpuId, id: EnvId, checkperm: bool) -> Result<EnvId, KernelError> {
        let cur = self.cpus[cpu.0].curenv;
        if id.is_null() {
            return cur.ok_or(KernelError::BadEnv);
        }
        let env = self.envs.get(id).ok_or(KernelError::BadEnv)?;
        if checkperm {
            let cur = cur.ok_or(KernelError::BadEnv)?;
            if env.id != cur && env.parent_id != cur {
                return Err(KernelError::BadEnv);
            }
        }
        Ok(env.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused_with_new_generation() {
        let mut table = EnvTable::new(4);
        let a = table.alloc(EnvId::NULL).unwrap();
        let b = table.alloc(a).unwrap();
        assert_eq!(a, EnvId(0x1000));
        assert_eq!(b, EnvId(0x1001));
        assert_eq!(table.get(b).unwrap().parent_id, a);

        table.release(a);
        assert!(table.get(a).is_none());
        let c = table.alloc(EnvId::NULL).unwrap();
        assert_eq!(c.index(4), 0);
        assert_ne!(c, a);
        assert!(table.get(a).is_none());
        assert!(table.get(c).is_some());
    }

    #[test]
    fn table_exhaustion() {
        let mut table = EnvTable::new(2);
        table.alloc(EnvId::NULL).unwrap();
        table.alloc(EnvId::NULL).unwrap();
        assert_eq!(table.alloc(EnvId::NULL), Err(KernelError::NoFreeEnv));
    }

    #[test]
    fn status_raw_values() {
        for s in [
            EnvStatus::Free,
            EnvStatus::Dying,
            EnvStatus::Runnable,
            EnvStatus::Running,
            EnvStatus::NotRunnable,
        ] {
            assert_eq!(EnvStatus::from_raw(s.to_raw()), Some(s));
        }
        assert_eq!(EnvStatus::from_raw(9), None);
    }
}
