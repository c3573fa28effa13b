use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the hardware page sizes.
///
/// Sealed: only [`Size4K`], [`Size2M`] and [`Size1G`] implement it.
pub trait PageSize:
    sealed::Sealed + Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + 'static
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`, i.e. the number of offset bits.
    const SHIFT: u32;
    /// Number of 4 KiB frames covered by one page of this size.
    const FRAMES: u64 = Self::SIZE >> 12;
    /// Short human-readable name (`"4K"`, `"2M"`, `"1G"`).
    const NAME: &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $ty:ident, $shift:literal, $name:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $ty;

        impl sealed::Sealed for $ty {}

        impl PageSize for $ty {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $name;
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, mapped by a PTE. Also the frame size of the allocator.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page, mapped by a PDE with `PS=1`.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page, mapped by a PDPTE with `PS=1`.
    Size1G, 30, "1G"
);

const _: () = {
    assert!(Size4K::SIZE == 4096);
    assert!(Size2M::FRAMES == 512);
    assert!(Size1G::FRAMES == 512 * 512);
};
