use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidUsage,
    NotSupported,
    UnhandledDeviceError,
    SystemError,
    InternalError,
    RemoteError,
}

impl ErrorKind {
    /// 后端报告的、需要记录为通信域粘滞异步错误的错误类型。
    #[inline]
    pub const fn is_sticky(self) -> bool {
        matches!(
            self,
            Self::UnhandledDeviceError | Self::SystemError | Self::RemoteError
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::InvalidUsage => "invalid usage",
            Self::NotSupported => "not supported",
            Self::UnhandledDeviceError => "unhandled device error",
            Self::SystemError => "system error",
            Self::InternalError => "internal error",
            Self::RemoteError => "remote process exited or there was a network error",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CclError {
    pub kind: ErrorKind,
    pub info: String,
}

impl fmt::Display for CclError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.info.is_empty() {
            write!(f, "{}", self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.info)
        }
    }
}

impl Error for CclError {}

pub type Result<T> = std::result::Result<T, CclError>;

/// 非阻塞查询的结果。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Progress {
    Complete,
    InProgress,
}

pub(super) mod functions {
    use super::{CclError, ErrorKind::*};

    macro_rules! builder {
        ($name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> CclError {
                CclError {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(invalid_argument       InvalidArgument     );
    builder!(invalid_usage          InvalidUsage        );
    builder!(not_supported          NotSupported        );
    builder!(unhandled_device_error UnhandledDeviceError);
    builder!(system_error           SystemError         );
    builder!(internal_error         InternalError       );
    builder!(remote_error           RemoteError         );
}

#[test]
fn test_display() {
    use functions::*;

    assert_eq!(not_supported("").to_string(), "not supported");
    assert_eq!(
        invalid_usage("group depth is 2").to_string(),
        "invalid usage: group depth is 2"
    );
    assert!(remote_error("").kind.is_sticky());
    assert!(!invalid_argument("").kind.is_sticky());
}
