use bytes::{Buf, BufMut};

use crate::varint;

/// Error indicating that the provided buffer ended before the value did
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Infallible encoding and decoding of wire primitives
pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

macro_rules! int_codec {
    ($($ty:ty => $get:ident / $put:ident;)*) => {$(
        impl Codec for $ty {
            fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
                if buf.remaining() < std::mem::size_of::<$ty>() {
                    return Err(UnexpectedEnd);
                }
                Ok(buf.$get())
            }
            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }
        }
    )*};
}

int_codec! {
    u8 => get_u8 / put_u8;
    u16 => get_u16 / put_u16;
    u32 => get_u32 / put_u32;
    u64 => get_u64 / put_u64;
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    fn get_var(&mut self) -> Result<u64>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        varint::read(self).ok_or(UnexpectedEnd)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    fn write_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_var(&mut self, x: u64) {
        varint::write(x, self).expect("value too large for varint encoding");
    }
}
