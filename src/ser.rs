use anyhow::{Result, bail};
use byteorder::{BE, LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::instrument;

use crate::version::{VER_LATEST_ENGINE, VER_LATEST_ENGINE_LICENSEE};

/// State every package archive carries alongside its byte stream.
pub trait ArchiveState {
    fn byte_swapping(&self) -> bool;
    fn set_byte_swapping(&mut self, swap: bool);
    fn ver(&self) -> i32;
    fn licensee_ver(&self) -> i32;
    fn set_ver(&mut self, ver: i32, licensee_ver: i32);
}
impl<A: ArchiveState + ?Sized> ArchiveState for &mut A {
    fn byte_swapping(&self) -> bool {
        (**self).byte_swapping()
    }
    fn set_byte_swapping(&mut self, swap: bool) {
        (**self).set_byte_swapping(swap)
    }
    fn ver(&self) -> i32 {
        (**self).ver()
    }
    fn licensee_ver(&self) -> i32 {
        (**self).licensee_ver()
    }
    fn set_ver(&mut self, ver: i32, licensee_ver: i32) {
        (**self).set_ver(ver, licensee_ver)
    }
}

pub trait ArchiveRead: Read + ArchiveState {}
impl<T: Read + ArchiveState> ArchiveRead for T {}
pub trait ArchiveWrite: Write + ArchiveState {}
impl<T: Write + ArchiveState> ArchiveWrite for T {}

/// Byte stream plus the endian and version state of a package file.
///
/// Little endian is canonical. When byte swapping is on every scalar is
/// read and written big endian.
#[derive(Debug)]
pub struct Archive<S> {
    inner: S,
    swap: bool,
    ver: i32,
    licensee_ver: i32,
    pub filter_editor_only: bool,
}
impl<S> Archive<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            swap: false,
            ver: VER_LATEST_ENGINE,
            licensee_ver: VER_LATEST_ENGINE_LICENSEE,
            filter_editor_only: false,
        }
    }
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
    pub fn into_inner(self) -> S {
        self.inner
    }
    /// Replace the underlying stream, keeping endian and version state.
    pub fn replace_inner(&mut self, inner: S) -> S {
        std::mem::replace(&mut self.inner, inner)
    }
}
impl<S> ArchiveState for Archive<S> {
    fn byte_swapping(&self) -> bool {
        self.swap
    }
    fn set_byte_swapping(&mut self, swap: bool) {
        self.swap = swap;
    }
    fn ver(&self) -> i32 {
        self.ver
    }
    fn licensee_ver(&self) -> i32 {
        self.licensee_ver
    }
    fn set_ver(&mut self, ver: i32, licensee_ver: i32) {
        self.ver = ver;
        self.licensee_ver = licensee_ver;
    }
}
impl<S: Read> Read for Archive<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}
impl<S: Write> Write for Archive<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
impl<S: Seek> Seek for Archive<S> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

pub trait Readable {
    fn de<S: ArchiveRead>(stream: &mut S) -> Result<Self>
    where
        Self: Sized;
    fn de_vec<S: ArchiveRead>(len: usize, stream: &mut S) -> Result<Vec<Self>>
    where
        Self: Sized,
    {
        read_array(len, stream, Self::de)
    }
}
pub trait Writeable {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()>;
    fn ser_array<S: ArchiveWrite, T: AsRef<[Self]>>(this: T, stream: &mut S) -> Result<()>
    where
        Self: Sized,
    {
        for i in this.as_ref() {
            Self::ser(i, stream)?;
        }
        Ok(())
    }
}
pub trait ReadableCtx<C> {
    fn de<S: ArchiveRead>(stream: &mut S, ctx: C) -> Result<Self>
    where
        Self: Sized;
}
pub trait WriteableCtx<C> {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S, ctx: C) -> Result<()>;
}

impl<T> ReadExt for T where T: ArchiveRead {}
pub trait ReadExt: ArchiveRead {
    #[instrument(skip_all)]
    fn de<T: Readable>(&mut self) -> Result<T>
    where
        Self: Sized,
    {
        T::de(self)
    }
    #[instrument(skip_all)]
    fn de_ctx<T: ReadableCtx<C>, C>(&mut self, ctx: C) -> Result<T>
    where
        Self: Sized,
    {
        T::de(self, ctx)
    }
}
impl<T> WriteExt for T where T: ArchiveWrite {}
pub trait WriteExt: ArchiveWrite {
    #[instrument(skip_all)]
    fn ser<T: Writeable>(&mut self, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        value.ser(self)
    }
    #[instrument(skip_all)]
    fn ser_ctx<T: WriteableCtx<C>, C>(&mut self, value: &T, ctx: C) -> Result<()>
    where
        Self: Sized,
    {
        value.ser(self, ctx)
    }
    /// Serialize &[T] without length prefix
    #[instrument(skip_all)]
    fn ser_no_length<T: Writeable, S: AsRef<[T]>>(&mut self, value: &S) -> Result<()>
    where
        Self: Sized,
    {
        T::ser_array(value.as_ref(), self)
    }
}

impl Readable for String {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        let len: i32 = s.de()?;
        read_string_data(len, s)
    }
}
impl Writeable for String {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()> {
        write_string(stream, self)
    }
}
impl Writeable for &str {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()> {
        write_string(stream, self)
    }
}

impl<T: Readable> Readable for Vec<T> {
    fn de<S: ArchiveRead>(stream: &mut S) -> Result<Self> {
        let len = read_count(stream)?;
        T::de_vec(len, stream)
    }
}
impl<T: Readable> ReadableCtx<usize> for Vec<T> {
    fn de<S: ArchiveRead>(stream: &mut S, ctx: usize) -> Result<Self> {
        T::de_vec(ctx, stream)
    }
}
impl<T: Writeable> Writeable for Vec<T> {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&(self.len() as i32))?;
        T::ser_array(self, stream)
    }
}

impl Readable for bool {
    fn de<S: ArchiveRead>(stream: &mut S) -> Result<Self> {
        Ok(stream.de::<u32>()? != 0)
    }
}
impl Writeable for bool {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&(*self as u32))
    }
}

impl Readable for u8 {
    fn de<S: ArchiveRead>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_u8()?)
    }
    fn de_vec<S: ArchiveRead>(len: usize, stream: &mut S) -> Result<Vec<Self>> {
        let mut buf = vec![0; len];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }
}
impl Writeable for u8 {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_u8(*self)?)
    }
    fn ser_array<S: ArchiveWrite, T: AsRef<[Self]>>(this: T, stream: &mut S) -> Result<()> {
        Ok(stream.write_all(this.as_ref())?)
    }
}

macro_rules! scalar {
    ($ty:ty, $read:ident, $write:ident) => {
        impl Readable for $ty {
            fn de<S: ArchiveRead>(stream: &mut S) -> Result<Self> {
                Ok(if stream.byte_swapping() {
                    stream.$read::<BE>()?
                } else {
                    stream.$read::<LE>()?
                })
            }
        }
        impl Writeable for $ty {
            fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()> {
                if stream.byte_swapping() {
                    stream.$write::<BE>(*self)?
                } else {
                    stream.$write::<LE>(*self)?
                }
                Ok(())
            }
        }
    };
}
scalar!(u16, read_u16, write_u16);
scalar!(i16, read_i16, write_i16);
scalar!(u32, read_u32, write_u32);
scalar!(i32, read_i32, write_i32);
scalar!(u64, read_u64, write_u64);
scalar!(i64, read_i64, write_i64);
scalar!(f32, read_f32, write_f32);

/// Largest element count accepted from an array prefix before the data is
/// considered corrupt.
const MAX_SERIALIZED_COUNT: i32 = 1 << 26;

pub fn read_count<S: ArchiveRead>(stream: &mut S) -> Result<usize> {
    let len: i32 = stream.de()?;
    if !(0..=MAX_SERIALIZED_COUNT).contains(&len) {
        bail!("invalid array count {len}");
    }
    Ok(len as usize)
}

#[instrument(skip_all)]
pub fn read_array<S: ArchiveRead, T, F>(len: usize, stream: &mut S, mut f: F) -> Result<Vec<T>>
where
    F: FnMut(&mut S) -> Result<T>,
{
    let mut array = Vec::with_capacity(len.min(4096));
    for _ in 0..len {
        array.push(f(stream)?);
    }
    Ok(array)
}

#[instrument(skip_all)]
pub fn read_string_data<S: ArchiveRead>(len: i32, stream: &mut S) -> Result<String> {
    if !(-MAX_SERIALIZED_COUNT..=MAX_SERIALIZED_COUNT).contains(&len) {
        bail!("invalid string length {len}");
    }
    if len < 0 {
        let chars = read_array((-len) as usize, stream, |r| r.de::<u16>())?;
        let length = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
        Ok(String::from_utf16(&chars[..length])?)
    } else {
        let mut chars = vec![0; len as usize];
        stream.read_exact(&mut chars)?;
        let length = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
        Ok(String::from_utf8_lossy(&chars[..length]).into_owned())
    }
}

pub fn write_string<S: ArchiveWrite>(stream: &mut S, value: &str) -> Result<()> {
    if value.is_empty() {
        stream.ser(&0i32)?;
    } else if value.is_ascii() {
        stream.ser(&(value.len() as i32 + 1))?;
        stream.write_all(value.as_bytes())?;
        stream.write_u8(0)?;
    } else {
        let chars: Vec<u16> = value.encode_utf16().collect();
        stream.ser(&-(chars.len() as i32 + 1))?;
        for c in chars {
            stream.ser(&c)?;
        }
        stream.ser(&0u16)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_swapped_scalars() -> Result<()> {
        let mut ar = Archive::new(Cursor::new(vec![]));
        ar.set_byte_swapping(true);
        ar.ser(&0x11223344u32)?;
        ar.ser(&-2i16)?;
        assert_eq!(ar.get_ref().get_ref(), &vec![0x11, 0x22, 0x33, 0x44, 0xff, 0xfe]);

        ar.get_mut().set_position(0);
        assert_eq!(ar.de::<u32>()?, 0x11223344);
        assert_eq!(ar.de::<i16>()?, -2);
        Ok(())
    }

    #[test]
    fn test_strings() -> Result<()> {
        let mut ar = Archive::new(Cursor::new(vec![]));
        ar.ser(&"Engine")?;
        ar.ser(&"")?;
        ar.ser(&"Grüße")?;
        ar.get_mut().set_position(0);
        assert_eq!(ar.de::<String>()?, "Engine");
        assert_eq!(ar.de::<String>()?, "");
        assert_eq!(ar.de::<String>()?, "Grüße");
        Ok(())
    }

    #[test]
    fn test_rejects_corrupt_counts() {
        let mut ar = Archive::new(Cursor::new((-5i32).to_le_bytes().to_vec()));
        assert!(ar.de::<Vec<u32>>().is_err());
    }
}
