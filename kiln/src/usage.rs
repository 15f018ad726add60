use bytemuck::Contiguous;
use std::ops::{BitOr, BitOrAssign};

macro_rules! usage_impl {
    ($usage:ident, $usage_bit:ident, $usage_bit_iter:ident, [$($name:ident),+ $(,)?]) => {
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Contiguous)]
        #[allow(non_camel_case_types)]
        pub(crate) enum $usage_bit {
            $($name),+
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $usage(u32);

        impl $usage {
            $(pub const $name: $usage = $usage(1 << ($usage_bit::$name as u32));)+

            pub fn empty() -> Self {
                Self(0)
            }

            pub fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub(crate) fn iter_set_bits(self) -> $usage_bit_iter {
                $usage_bit_iter(self)
            }
        }

        impl BitOr for $usage {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $usage {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        pub(crate) struct $usage_bit_iter($usage);

        impl Iterator for $usage_bit_iter {
            type Item = $usage_bit;

            fn next(&mut self) -> Option<Self::Item> {
                let pos = self.0 .0.trailing_zeros();
                if pos < 32 {
                    let bit = 1 << pos;
                    self.0 .0 &= !bit;
                    $usage_bit::from_integer(pos)
                } else {
                    None
                }
            }
        }
    };
}

usage_impl!(
    BufferUsage,
    BufferUsageBit,
    BufferUsageBitIterator,
    [
        TRANSFER_SRC,
        TRANSFER_DST,
        UNIFORM,
        STORAGE,
        ACCELERATION_STRUCTURE_BUILD_INPUT,
        ACCELERATION_STRUCTURE_STORAGE,
        SHADER_BINDING_TABLE,
    ]
);

usage_impl!(
    TextureUsage,
    TextureUsageBit,
    TextureUsageBitIterator,
    [TRANSFER_SRC, TRANSFER_DST, SAMPLED, STORAGE]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bits() {
        let usage = BufferUsage::TRANSFER_DST | BufferUsage::STORAGE;
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(!usage.contains(BufferUsage::UNIFORM));
        let bits: Vec<_> = usage.iter_set_bits().collect();
        assert_eq!(bits, vec![BufferUsageBit::TRANSFER_DST, BufferUsageBit::STORAGE]);
        assert_eq!(TextureUsage::empty().iter_set_bits().count(), 0);
    }
}
