// kernel/src/mem/address_space.rs
//
// 役割:
// - 1 つの環境の論理アドレス空間（2 段ページテーブル）を表現する。
// - どの仮想ページがどの物理フレームにどの権限でマップされているかを保持する。
//
// 設計方針:
// - ディレクトリは va >> 21 をキーにした BTreeMap。葉テーブルは 512 エントリ固定。
// - lookup は「ディレクトリ自体が無い」「エントリが無い」「エントリ」の 3 値を区別する
//   （ユーザ側の uvpd / uvpt 読み出しがこの区別をそのまま使う）。
// - 参照カウントは持たない。insert / remove が置き換えた PTE を返し、呼び出し側が
//   PhysicalMemoryManager の incref / decref を行う。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::mem::addr::{self, VirtPage, PAGE_SIZE, PTE_COUNT};
use crate::mem::paging::{MemAction, PageFlags, Pte};

struct PageTable {
    entries: Box<[Option<Pte>; PTE_COUNT]>,
}

impl PageTable {
    fn new() -> Self {
        PageTable {
            entries: Box::new([None; PTE_COUNT]),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PteLookup {
    /// 上位（ディレクトリ）に対応するテーブルが無い
    NoDirectory,
    /// テーブルはあるがエントリが無い
    NotMapped,
    Entry(Pte),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    NoDirectory,
    NotMapped,
}

#[derive(Default)]
pub struct AddressSpace {
    directory: BTreeMap<usize, PageTable>,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            directory: BTreeMap::new(),
        }
    }

    pub fn lookup(&self, va: u64) -> PteLookup {
        let page = VirtPage::containing(va);
        match self.directory.get(&page.pdx()) {
            None => PteLookup::NoDirectory,
            Some(table) => match table.entries[page.ptx()] {
                None => PteLookup::NotMapped,
                Some(pte) => PteLookup::Entry(pte),
            },
        }
    }

    /// va を含むページの PTE（無ければ None）
    pub fn pte(&self, va: u64) -> Option<Pte> {
        match self.lookup(va) {
            PteLookup::Entry(pte) => Some(pte),
            _ => None,
        }
    }

    pub fn directory_present(&self, pdx: usize) -> bool {
        self.directory.contains_key(&pdx)
    }

    /// マップする。既存のエントリがあれば置き換え、それを返す。
    pub fn insert(&mut self, va: u64, pte: Pte) -> Option<Pte> {
        let page = VirtPage::containing(va);
        let table = self.directory.entry(page.pdx()).or_insert_with(PageTable::new);
        table.entries[page.ptx()].replace(pte)
    }

    /// マッピングを外し、外した PTE を返す。葉テーブル自体は残す。
    pub fn remove(&mut self, va: u64) -> Option<Pte> {
        let page = VirtPage::containing(va);
        self.directory
            .get_mut(&page.pdx())
            .and_then(|table| table.entries[page.ptx()].take())
    }

    /// 既存マッピングの属性だけを書き換える（フレームは変えない）。
    pub fn set_flags(&mut self, va: u64, flags: PageFlags) -> Result<Pte, AddressSpaceError> {
        let page = VirtPage::containing(va);
        let table = self
            .directory
            .get_mut(&page.pdx())
            .ok_or(AddressSpaceError::NoDirectory)?;
        let slot = table.entries[page.ptx()]
            .as_mut()
            .ok_or(AddressSpaceError::NotMapped)?;
        slot.flags = flags;
        Ok(*slot)
    }

    /// 論理イベントとしてのマップ / アンマップを適用する。
    pub fn apply(&mut self, action: MemAction) -> Result<Option<Pte>, AddressSpaceError> {
        match action {
            MemAction::Map { page, frame, flags } => {
                Ok(self.insert(page.start_address(), Pte { frame, flags }))
            }
            MemAction::Unmap { page } => self
                .remove(page.start_address())
                .map(Some)
                .ok_or(AddressSpaceError::NotMapped),
        }
    }

    /// [va, va+len) の全ページが perm を含む PTE を持つか。
    /// 失敗時は最初に条件を満たさなかったアドレスを返す。
    pub fn user_mem_check(&self, va: u64, len: usize, perm: PageFlags) -> Result<(), u64> {
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len as u64).ok_or(va)?;
        let mut cur = addr::round_down(va, PAGE_SIZE);
        while cur < end {
            let ok = self
                .pte(cur)
                .map(|pte| pte.flags.contains(perm))
                .unwrap_or(false);
            if !ok {
                return Err(cur.max(va));
            }
            cur += PAGE_SIZE;
        }
        Ok(())
    }

    /// present なマッピングをアドレス順に列挙する。
    pub fn mappings(&self) -> impl Iterator<Item = (u64, Pte)> + '_ {
        self.directory.iter().flat_map(|(&pdx, table)| {
            table
                .entries
                .iter()
                .enumerate()
                .filter_map(move |(ptx, e)| e.map(|pte| (addr::page_address(pdx, ptx), pte)))
        })
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings().count()
    }

    /// 全マッピングを取り外し、外した PTE を返す（環境破棄用）。
    pub fn drain(&mut self) -> Vec<Pte> {
        let out = self.mappings().map(|(_, pte)| pte).collect();
        self.directory.clear();
        out
    }
}
