// kernel/src/logging/mod.rs
//
// ログ出力の入口。
// - 出力先は log クレートのファサードに任せる（ホストではテスト側の logger、
//   実機ではシリアル logger を差し込む想定）。
// - カーネル内の呼び出し側は info / warn / error と key = value 形式の info_* を使う。

use core::fmt;

/// すべてのカーネルログに付ける target
pub const TARGET: &str = "trapcore";

pub fn info(msg: &str) {
    log::info!(target: TARGET, "{}", msg);
}

pub fn warn(msg: &str) {
    log::warn!(target: TARGET, "{}", msg);
}

pub fn error(msg: &str) {
    log::error!(target: TARGET, "{}", msg);
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

pub fn info_kv(key: &str, value: u64) {
    if key.is_empty() {
        log::info!(target: TARGET, "{}", value);
        return;
    }
    log::info!(target: TARGET, "{} = {}", key, value);
}

/// アドレス類は 16 進で出す
pub fn info_hex(key: &str, value: u64) {
    log::info!(target: TARGET, "{} = {:#x}", key, value);
}

pub fn info_fmt(args: fmt::Arguments<'_>) {
    log::info!(target: TARGET, "{}", args);
}

pub fn trace_fmt(args: fmt::Arguments<'_>) {
    log::trace!(target: TARGET, "{}", args);
}
