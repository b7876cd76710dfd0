use super::{invalid_argument, CclError};
use digit_layout::{types as ty, DigitLayout};

/// 集合通信的元素类型标记。
///
/// 缓冲区大小总是以元素数量表示，由这个标记决定元素宽度。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum DataType {
    Int8,
    Uint8,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float16,
    Float32,
    Float64,
    Bfloat16,
}

impl DataType {
    /// 单个元素的字节数。
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Float16 | Self::Bfloat16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    #[inline]
    pub const fn nbytes(self, count: usize) -> usize {
        self.size() * count
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
    Avg,
}

impl From<DataType> for DigitLayout {
    fn from(dt: DataType) -> Self {
        match dt {
            DataType::Int8 => ty::I8,
            DataType::Uint8 => ty::U8,
            DataType::Int32 => ty::I32,
            DataType::Uint32 => ty::U32,
            DataType::Int64 => ty::I64,
            DataType::Uint64 => ty::U64,
            DataType::Float16 => ty::F16,
            DataType::Float32 => ty::F32,
            DataType::Float64 => ty::F64,
            DataType::Bfloat16 => ty::BF16,
        }
    }
}

impl TryFrom<DigitLayout> for DataType {
    type Error = CclError;

    fn try_from(dt: DigitLayout) -> Result<Self, Self::Error> {
        Ok(match dt {
            ty::I8 => Self::Int8,
            ty::U8 | ty::Bool => Self::Uint8,
            ty::I32 => Self::Int32,
            ty::U32 => Self::Uint32,
            ty::I64 => Self::Int64,
            ty::U64 => Self::Uint64,
            ty::F16 => Self::Float16,
            ty::F32 => Self::Float32,
            ty::F64 => Self::Float64,
            ty::BF16 => Self::Bfloat16,
            _ => {
                return Err(invalid_argument(format!(
                    "{dt:?} is not a collective data type"
                )))
            }
        })
    }
}

#[test]
fn test_digit_layout() {
    for dt in [
        DataType::Int8,
        DataType::Uint8,
        DataType::Int32,
        DataType::Uint32,
        DataType::Int64,
        DataType::Uint64,
        DataType::Float16,
        DataType::Float32,
        DataType::Float64,
        DataType::Bfloat16,
    ] {
        assert_eq!(DataType::try_from(DigitLayout::from(dt)).unwrap(), dt);
    }
    assert_eq!(DataType::try_from(ty::Bool).unwrap(), DataType::Uint8);
    assert_eq!(DataType::Bfloat16.nbytes(3), 6);
}
