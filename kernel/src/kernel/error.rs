// kernel/src/kernel/error.rs
//
// syscall 境界で返すエラー。
// - ユーザには負のエラーコード（-E_*）として rax で返る。
// - 番号は固定（ユーザライブラリ側もこの値で decode する）。

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("unspecified error")]
    Unspecified,
    #[error("bad environment")]
    BadEnv,
    #[error("invalid parameter")]
    Inval,
    #[error("out of memory")]
    NoMem,
    #[error("out of environments")]
    NoFreeEnv,
    #[error("segmentation fault")]
    Fault,
    #[error("env is not recving")]
    IpcNotRecv,
}

impl KernelError {
    /// 正のエラー番号（E_*）
    pub const fn code(self) -> i64 {
        match self {
            KernelError::Unspecified => 1,
            KernelError::BadEnv => 2,
            KernelError::Inval => 3,
            KernelError::NoMem => 4,
            KernelError::NoFreeEnv => 5,
            KernelError::Fault => 6,
            KernelError::IpcNotRecv => 7,
        }
    }

    /// rax に入れる値
    pub const fn to_return(self) -> i64 {
        -self.code()
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let e = match code.unsigned_abs() {
            1 => KernelError::Unspecified,
            2 => KernelError::BadEnv,
            3 => KernelError::Inval,
            4 => KernelError::NoMem,
            5 => KernelError::NoFreeEnv,
            6 => KernelError::Fault,
            7 => KernelError::IpcNotRecv,
            _ => return None,
        };
        Some(e)
    }

    /// syscall の戻り値を Result に戻す。未知の負値は Unspecified。
    pub fn decode_return(ret: i64) -> Result<u64, KernelError> {
        if ret >= 0 {
            return Ok(ret as u64);
        }
        Err(KernelError::from_code(ret).unwrap_or(KernelError::Unspecified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_values_round_trip_through_rax() {
        for e in [
            KernelError::Unspecified,
            KernelError::BadEnv,
            KernelError::Inval,
            KernelError::NoMem,
            KernelError::NoFreeEnv,
            KernelError::Fault,
            KernelError::IpcNotRecv,
        ] {
            assert_eq!(KernelError::decode_return(e.to_return()), Err(e));
        }
        assert_eq!(KernelError::decode_return(0x1003), Ok(0x1003));
        assert_eq!(KernelError::decode_return(-99), Err(KernelError::Unspecified));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(KernelError::Inval.to_return(), -3);
        assert_eq!(KernelError::IpcNotRecv.code(), 7);
    }
}
