mod config;
mod data;
mod error;
mod unique_id;

pub use config::{Config, ENV_ADAPTOR, ENV_BOOTSTRAP_TIMEOUT, ENV_LOCAL_RANK};
pub use data::{DataType, ReduceOp};
pub use error::{functions::*, CclError, ErrorKind, Progress, Result};
pub use unique_id::{UniqueId, UNIQUE_ID_BYTES};

/// 定义由具体后端填充内容的不透明句柄。
///
/// 句柄只在创建它的后端内部被还原为具体类型，调用者只能看到句柄本身。
macro_rules! opaque {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        $vis struct $name(std::sync::Arc<dyn std::any::Any + Send + Sync>);

        impl $name {
            #[inline]
            pub fn new<T: std::any::Any + Send + Sync>(raw: T) -> Self {
                Self(std::sync::Arc::new(raw))
            }

            /// 还原为后端内部的具体类型。
            pub fn native<T: std::any::Any>(&self) -> $crate::Result<&T> {
                self.0.downcast_ref().ok_or_else(|| {
                    $crate::invalid_argument(concat!(
                        stringify!($name),
                        " was created by another backend"
                    ))
                })
            }

            /// 判断两个句柄是否指向同一个后端对象。
            #[inline]
            pub fn same_as(&self, other: &Self) -> bool {
                std::ptr::addr_eq(
                    std::sync::Arc::as_ptr(&self.0),
                    std::sync::Arc::as_ptr(&other.0),
                )
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(
                    f,
                    concat!(stringify!($name), "({:p})"),
                    std::sync::Arc::as_ptr(&self.0)
                )
            }
        }
    };
}

pub(crate) use opaque;
