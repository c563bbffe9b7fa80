// kernel/src/mem/mod.rs
//
// 仮想メモリ側のモデル。
// - addr:          ページ番号と pdx / ptx
// - layout:        ユーザ / カーネルの固定アドレス
// - paging:        PTE 属性（COW を含む）と権限検査
// - address_space: 環境ごとの 2 段ページテーブル（uvpd / uvpt の実体）

pub mod addr;
pub mod address_space;
pub mod layout;
pub mod paging;
