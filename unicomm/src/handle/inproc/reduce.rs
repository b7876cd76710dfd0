use crate::{DataType, ReduceOp};
use half::{bf16, f16};
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::{ParallelSlice, ParallelSliceMut},
};
use std::{iter::zip, mem::size_of};

/// 每个并行任务处理的元素数。
const BLOCK: usize = 1 << 12;

trait Element: Copy + Send + Sync {
    const SIZE: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
    fn combine(self, rhs: Self, op: ReduceOp) -> Self;
    fn div(self, n: usize) -> Self;
}

macro_rules! bytes {
    ($ty:ty) => {
        const SIZE: usize = size_of::<$ty>();

        #[inline]
        fn load(bytes: &[u8]) -> Self {
            let mut buf = [0; size_of::<$ty>()];
            buf.copy_from_slice(bytes);
            <$ty>::from_ne_bytes(buf)
        }

        #[inline]
        fn store(self, bytes: &mut [u8]) {
            bytes.copy_from_slice(&self.to_ne_bytes())
        }
    };
}

macro_rules! int {
    ($( $ty:ty )+) => {
        $(
            impl Element for $ty {
                bytes!($ty);

                #[inline]
                fn combine(self, rhs: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg => self.wrapping_add(rhs),
                        ReduceOp::Prod => self.wrapping_mul(rhs),
                        ReduceOp::Max => self.max(rhs),
                        ReduceOp::Min => self.min(rhs),
                    }
                }

                #[inline]
                fn div(self, n: usize) -> Self {
                    (self as i128 / n as i128) as _
                }
            }
        )+
    };
}

macro_rules! float {
    ($( $ty:ty )+) => {
        $(
            impl Element for $ty {
                bytes!($ty);

                #[inline]
                fn combine(self, rhs: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg => self + rhs,
                        ReduceOp::Prod => self * rhs,
                        ReduceOp::Max => self.max(rhs),
                        ReduceOp::Min => self.min(rhs),
                    }
                }

                #[inline]
                fn div(self, n: usize) -> Self {
                    self / n as $ty
                }
            }
        )+
    };
}

macro_rules! half_float {
    ($( $ty:ty )+) => {
        $(
            impl Element for $ty {
                bytes!($ty);

                #[inline]
                fn combine(self, rhs: Self, op: ReduceOp) -> Self {
                    <$ty>::from_f32(self.to_f32().combine(rhs.to_f32(), op))
                }

                #[inline]
                fn div(self, n: usize) -> Self {
                    <$ty>::from_f32(self.to_f32() / n as f32)
                }
            }
        )+
    };
}

int!(i8 u8 i32 u32 i64 u64);
float!(f32 f64);
half_float!(f16 bf16);

fn combine<T: Element>(dst: &mut [u8], src: &[u8], op: ReduceOp) {
    dst.par_chunks_mut(T::SIZE * BLOCK)
        .zip(src.par_chunks(T::SIZE * BLOCK))
        .for_each(|(dst, src)| {
            for (dst, src) in zip(dst.chunks_exact_mut(T::SIZE), src.chunks_exact(T::SIZE)) {
                T::load(dst).combine(T::load(src), op).store(dst)
            }
        })
}

fn average<T: Element>(dst: &mut [u8], n: usize) {
    dst.par_chunks_mut(T::SIZE * BLOCK).for_each(|dst| {
        for dst in dst.chunks_exact_mut(T::SIZE) {
            T::load(dst).div(n).store(dst)
        }
    })
}

macro_rules! dispatch {
    ($dt:expr, $f:ident($($arg:expr),*)) => {
        match $dt {
            DataType::Int8     => $f::<i8  >($($arg),*),
            DataType::Uint8    => $f::<u8  >($($arg),*),
            DataType::Int32    => $f::<i32 >($($arg),*),
            DataType::Uint32   => $f::<u32 >($($arg),*),
            DataType::Int64    => $f::<i64 >($($arg),*),
            DataType::Uint64   => $f::<u64 >($($arg),*),
            DataType::Float16  => $f::<f16 >($($arg),*),
            DataType::Float32  => $f::<f32 >($($arg),*),
            DataType::Float64  => $f::<f64 >($($arg),*),
            DataType::Bfloat16 => $f::<bf16>($($arg),*),
        }
    };
}

/// 按序号顺序把所有成员的贡献归约到 `dst`，每个成员上的结果逐位相同。
pub(super) fn fold<'a>(
    dst: &mut [u8],
    mut parts: impl Iterator<Item = &'a [u8]>,
    dt: DataType,
    op: ReduceOp,
) {
    let mut n = 0;
    if let Some(first) = parts.next() {
        dst.copy_from_slice(first);
        n += 1
    }
    for part in parts {
        dispatch!(dt, combine(dst, part, op));
        n += 1
    }
    if op == ReduceOp::Avg && n > 1 {
        dispatch!(dt, average(dst, n))
    }
}

#[cfg(test)]
fn bytes_of<T: Copy>(vals: &[T]) -> Vec<u8> {
    let len = std::mem::size_of_val(vals);
    unsafe { std::slice::from_raw_parts(vals.as_ptr().cast::<u8>(), len) }.to_vec()
}

#[test]
fn test_ops() {
    let parts = [bytes_of(&[1i32, -4, 6]), bytes_of(&[3i32, 2, 6])];
    let check = |op, expect: [i32; 3]| {
        let mut dst = vec![0; 12];
        fold(&mut dst, parts.iter().map(Vec::as_slice), DataType::Int32, op);
        assert_eq!(dst, bytes_of(&expect));
    };
    check(ReduceOp::Sum, [4, -2, 12]);
    check(ReduceOp::Prod, [3, -8, 36]);
    check(ReduceOp::Max, [3, 2, 6]);
    check(ReduceOp::Min, [1, -4, 6]);
    check(ReduceOp::Avg, [2, -1, 6]);
}

#[test]
fn test_half() {
    let parts = [
        bytes_of(&[f16::from_f32(1.5), f16::from_f32(-2.)]),
        bytes_of(&[f16::from_f32(0.5), f16::from_f32(4.)]),
    ];
    let mut dst = vec![0; 4];
    fold(&mut dst, parts.iter().map(Vec::as_slice), DataType::Float16, ReduceOp::Avg);
    assert_eq!(dst, bytes_of(&[f16::from_f32(1.), f16::from_f32(1.)]));
}

#[test]
fn test_large() {
    let n = BLOCK * 3 + 5;
    let a = (0..n).map(|i| i as f64).collect::<Vec<_>>();
    let b = vec![1.; n];
    let mut dst = vec![0; n * 8];
    fold(
        &mut dst,
        [bytes_of(&a), bytes_of(&b)].iter().map(Vec::as_slice),
        DataType::Float64,
        ReduceOp::Sum,
    );
    let expect = (0..n).map(|i| i as f64 + 1.).collect::<Vec<_>>();
    assert_eq!(dst, bytes_of(&expect));
}
