// kernel/src/arch/mod.rs
//
// アーキ依存部（x86_64 のモデル）。
// - trapframe: trap 時に保存されるレジスタ状態と、ユーザ例外スタックに積むフレーム
// - interrupts: ベクタ番号とゲートテーブル
// - gdt: セグメントセレクタと CPU ごとの TSS
// - cpu: CPU ごとの状態（curenv / cr2 / IF / LAPIC EOI）
// - mmu: ユーザアクセスの可否判定と #PF エラーコード生成

pub mod cpu;
pub mod gdt;
pub mod interrupts;
pub mod mmu;
pub mod trapframe;
