// src/mm/mod.rs
//
// 物理メモリ管理の入り口。
// - 固定個数の 4KiB フレームを持つ arena と、フレームごとの参照カウントを管理する。
// - 参照カウントは「このフレームを指している PTE の数」。0 になった時点で free list に戻す。
// - フレームの中身は確保時にだけ実体化する（未使用フレームはメモリを消費しない）。
// - 状態は構造体 + カウンタに閉じ込め、外部 API はすべて safe にする。

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::mem::addr::{PAGE_SIZE, PGSIZE};

/// 物理フレーム番号
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    /// フレーム先頭の物理アドレス
    pub const fn start_address(self) -> u64 {
        self.0 as u64 * PAGE_SIZE
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({:#x})", self.start_address())
    }
}

pub type FrameData = [u8; PGSIZE];

struct FrameSlot {
    refcount: u32,
    data: Option<Box<FrameData>>,
}

/// カーネル側から見える「物理メモリマネージャ」。
pub struct PhysicalMemoryManager {
    slots: Vec<FrameSlot>,
    /// 末尾から取り出す（= 小さい番号から順に使われる）
    free_list: Vec<FrameId>,
}

impl PhysicalMemoryManager {
    pub fn new(nframes: usize) -> Self {
        let mut slots = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            slots.push(FrameSlot {
                refcount: 0,
                data: None,
            });
        }
        let free_list = (0..nframes as u32).rev().map(FrameId).collect();
        PhysicalMemoryManager { slots, free_list }
    }

    /// ゼロ埋めされたフレームを 1 つ確保する。
    /// - 参照カウントは 0 のまま返す（マップした側が incref する）。
    /// - 空きが無い: None
    pub fn allocate_frame(&mut self) -> Option<FrameId> {
        let frame = self.free_list.pop()?;
        let slot = &mut self.slots[frame.0 as usize];
        slot.refcount = 0;
        slot.data = Some(Box::new([0u8; PGSIZE]));
        Some(frame)
    }

    /// 参照 0 のまま使われなかったフレームを返却する。
    pub fn free_unreferenced(&mut self, frame: FrameId) {
        if self.refcount(frame) == 0 && self.is_allocated(frame) {
            self.release(frame);
        }
    }

    pub fn incref(&mut self, frame: FrameId) {
        if let Some(slot) = self.slots.get_mut(frame.0 as usize) {
            slot.refcount += 1;
        }
    }

    /// 参照を 1 つ外す。0 になったら free list に戻して true を返す。
    pub fn decref(&mut self, frame: FrameId) -> bool {
        let Some(slot) = self.slots.get_mut(frame.0 as usize) else {
            return false;
        };
        if slot.refcount == 0 {
            return false;
        }
        slot.refcount -= 1;
        if slot.refcount == 0 {
            self.release(frame);
            return true;
        }
        false
    }

    fn release(&mut self, frame: FrameId) {
        self.slots[frame.0 as usize].data = None;
        self.free_list.push(frame);
    }

    pub fn refcount(&self, frame: FrameId) -> u32 {
        self.slots
            .get(frame.0 as usize)
            .map(|s| s.refcount)
            .unwrap_or(0)
    }

    pub fn is_allocated(&self, frame: FrameId) -> bool {
        self.slots
            .get(frame.0 as usize)
            .map(|s| s.data.is_some())
            .unwrap_or(false)
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn total_frames(&self) -> usize {
        self.slots.len()
    }

    pub fn data(&self, frame: FrameId) -> Option<&FrameData> {
        self.slots.get(frame.0 as usize)?.data.as_deref()
    }

    pub fn data_mut(&mut self, frame: FrameId) -> Option<&mut FrameData> {
        self.slots.get_mut(frame.0 as usize)?.data.as_deref_mut()
    }
}
