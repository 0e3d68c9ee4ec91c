//! Little-endian encoding of the on-disk structures through `scroll`

use scroll::{
    ctx::{
        SizeWith,
        TryFromCtx,
        TryIntoCtx,
    },
    Endian,
    Pread,
    Pwrite,
    LE,
};

/// Encoded size of `T`
#[inline]
pub(crate) fn size_of<T: SizeWith<Endian>>() -> usize {
    T::size_with(&LE)
}

/// Decode a `T` at the start of `bytes`. `None` if there are not enough bytes.
pub(crate) fn decode<'a, T>(bytes: &'a [u8]) -> Option<T>
where
    T: TryFromCtx<'a, Endian, Error = scroll::Error>,
{
    bytes.pread_with::<T>(0, LE).ok()
}

/// Append the encoding of `value` to `out`
pub(crate) fn append<T>(out: &mut Vec<u8>, value: T)
where
    T: TryIntoCtx<Endian, Error = scroll::Error> + SizeWith<Endian>,
{
    let start = out.len();
    out.resize(start + size_of::<T>(), 0);
    let written = out[start..].pwrite_with(value, 0, LE);
    debug_assert_eq!(written.ok(), Some(out.len() - start));
}

/// Encode a fixed size structure
pub(crate) fn encode<T>(value: T) -> Vec<u8>
where
    T: TryIntoCtx<Endian, Error = scroll::Error> + SizeWith<Endian>,
{
    let mut out = Vec::with_capacity(size_of::<T>());
    append(&mut out, value);
    out
}

/// Pad `out` with zeros until its length is a multiple of `align`
pub(crate) fn pad(out: &mut Vec<u8>, align: usize) {
    let len = round_up(out.len() as u64, align as u64) as usize;
    out.resize(len, 0);
}

/// Round `value` up to the next multiple of `align` (which must be a power of two)
#[inline]
pub fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_stops_at_end() {
        assert_eq!(decode::<u16>(&[1, 0]), Some(1));
        assert_eq!(decode::<u32>(&[2, 0, 0]), None);
    }

    #[test]
    fn append_and_pad() {
        let mut out = Vec::new();
        append(&mut out, 1u8);
        pad(&mut out, 4);
        assert_eq!(out.len(), 4);
        pad(&mut out, 4);
        assert_eq!(out.len(), 4);
        append(&mut out, u64::MAX);
        pad(&mut out, 8);
        assert_eq!(out, [1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(0, 4), 0);
        assert_eq!(round_up(5, 4), 8);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
