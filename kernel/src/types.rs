/*!
 * types
 *
 * 役割:
 *   - カーネル全体で共有する素朴な ID 型を集約する。
 *
 * やること:
 *   - EnvId（世代 + スロット index）と CpuId の定義。
 *
 * やらないこと:
 *   - 環境表そのものの管理（kernel::env の責務）。
 *
 * 設計方針:
 *   - EnvId(0) は「自分自身 / 該当なし」を表す予約値。実 ID は必ず世代ビットを持つ。
 */

use core::fmt;

/// 世代番号を置くビット位置。これより下位が環境表のスロット index。
pub const ENVGENSHIFT: u32 = 12;

/// 環境（プロセス）ID
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(pub u32);

impl EnvId {
    /// 「自分自身」および「見つからない」を表す null ID
    pub const NULL: EnvId = EnvId(0);

    /// 環境表のスロット index（nenv は 2 の冪）
    pub fn index(self, nenv: usize) -> usize {
        (self.0 as usize) & (nenv - 1)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 前の ID から次の世代の ID を作る。
    pub fn next_generation(prev: EnvId, index: usize, nenv: usize) -> EnvId {
        let mut generation = prev.0.wrapping_add(1 << ENVGENSHIFT) & !((nenv as u32) - 1);
        if generation == 0 {
            generation = 1 << ENVGENSHIFT;
        }
        EnvId(generation | index as u32)
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// CPU 番号（0 = BSP）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub usize);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
