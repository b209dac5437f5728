use anyhow::anyhow;


// NB: bytes::Buf has its own try_get_* family in newer versions - the 'checked_' prefix keeps
//      these from clashing with it

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow: need {} bytes, {} remaining", size_of::<$ty>(), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}


/// All DECI4 numbers are little endian, so there are only LE getters here
pub trait BufExt: bytes::Buf {
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_u16_le, u16, get_u16_le);
    get_checked_impl!(checked_get_u32_le, u32, get_u32_le);
    get_checked_impl!(checked_get_u64_le, u64, get_u64_le);

    get_checked_impl!(checked_get_i8, i8, get_i8);
    get_checked_impl!(checked_get_i16_le, i16, get_i16_le);
    get_checked_impl!(checked_get_i32_le, i32, get_i32_le);
    get_checked_impl!(checked_get_i64_le, i64, get_i64_le);

    fn checked_advance(&mut self, len: usize) -> anyhow::Result<()> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: cannot skip {} bytes, {} remaining", len, self.remaining()));
        }
        self.advance(len);
        Ok(())
    }

    fn checked_copy_to_bytes(&mut self, len: usize) -> anyhow::Result<bytes::Bytes> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: need {} bytes, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }

    /// Look at the next four bytes as a signed LE number without consuming them. This relies on
    ///  the buffer being contiguous, which holds for the `Bytes` and `&[u8]` buffers frames are
    ///  parsed from.
    fn peek_i32_le(&self) -> Option<i32> {
        let chunk = self.chunk();
        if chunk.len() < 4 {
            return None;
        }
        Some(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

impl <T: bytes::Buf> BufExt for T {
}
