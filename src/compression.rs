use anyhow::{Result, bail};
use bitflags::bitflags;
use rayon::prelude::*;
use std::io::{Read as _, Write};
use strum::{AsRefStr, EnumString};
use tracing::instrument;

use crate::error::LinkerError;
use crate::ser::*;
use crate::version::{PACKAGE_FILE_TAG, PACKAGE_FILE_TAG_SWAPPED};

/// Block size used when splitting data into independently compressed blocks.
pub const COMPRESSION_CHUNK_SIZE: usize = 128 * 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ECompressionFlags: u32 {
        const ZLIB = 0x01;
        const LZO = 0x02;
        const LZX = 0x04;
        const BIAS_MEMORY = 0x10;
        const BIAS_SPEED = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum CompressionMethod {
    Zlib,
}
impl CompressionMethod {
    pub fn from_flags(flags: ECompressionFlags) -> Result<Self> {
        let method = flags & (ECompressionFlags::ZLIB | ECompressionFlags::LZO | ECompressionFlags::LZX);
        if method == ECompressionFlags::ZLIB {
            Ok(CompressionMethod::Zlib)
        } else {
            Err(LinkerError::UnsupportedCompression(flags.bits()).into())
        }
    }
    pub fn flags(self) -> ECompressionFlags {
        match self {
            CompressionMethod::Zlib => ECompressionFlags::ZLIB,
        }
    }
}

pub fn compress<S: Write>(compression: CompressionMethod, input: &[u8], output: S) -> Result<()> {
    match compression {
        CompressionMethod::Zlib => {
            let mut encoder = flate2::write::ZlibEncoder::new(output, flate2::Compression::best());
            encoder.write_all(input)?;
            encoder.finish()?;
        }
    }
    Ok(())
}

pub fn decompress(compression: CompressionMethod, input: &[u8], output: &mut [u8]) -> Result<()> {
    match compression {
        CompressionMethod::Zlib => {
            flate2::read::ZlibDecoder::new(input).read_exact(output)?;
        }
    }
    Ok(())
}

/// Size pair describing one compressed block (or the whole stream).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCompressedChunkInfo {
    pub compressed_size: i32,
    pub uncompressed_size: i32,
}
impl Readable for FCompressedChunkInfo {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            compressed_size: s.de()?,
            uncompressed_size: s.de()?,
        })
    }
}
impl Writeable for FCompressedChunkInfo {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.compressed_size)?;
        s.ser(&self.uncompressed_size)?;
        Ok(())
    }
}

/// Entry of the summary's compressed chunk map. Offsets on the uncompressed
/// side are the virtual offsets the rest of the package uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCompressedChunk {
    pub uncompressed_offset: i32,
    pub uncompressed_size: i32,
    pub compressed_offset: i32,
    pub compressed_size: i32,
}
impl Readable for FCompressedChunk {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            uncompressed_offset: s.de()?,
            uncompressed_size: s.de()?,
            compressed_offset: s.de()?,
            compressed_size: s.de()?,
        })
    }
}
impl Writeable for FCompressedChunk {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.uncompressed_offset)?;
        s.ser(&self.uncompressed_size)?;
        s.ser(&self.compressed_offset)?;
        s.ser(&self.compressed_size)?;
        Ok(())
    }
}

/// Decompress a fully compressed package whose expected size comes from the
/// `.uncompressed_size` sidecar.
pub fn decompress_whole(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut ar = Archive::new(std::io::Cursor::new(data));
    let output = read_compressed(&mut ar, ECompressionFlags::ZLIB)?;
    if output.len() != expected_size {
        bail!("decompressed {} bytes, sidecar expects {expected_size}", output.len());
    }
    Ok(output)
}

pub fn compress_whole(data: &[u8]) -> Result<Vec<u8>> {
    let mut ar = Archive::new(std::io::Cursor::new(vec![]));
    write_compressed(&mut ar, ECompressionFlags::ZLIB, data)?;
    Ok(ar.into_inner().into_inner())
}

pub fn parse_uncompressed_size(sidecar: &[u8]) -> Result<usize> {
    let text = String::from_utf8_lossy(sidecar);
    Ok(text.trim().parse::<usize>()?)
}

/// Write `data` as a block-compressed stream:
/// `{tag, block_size} {total} {block}[n] payload[n]`.
#[instrument(skip_all)]
pub fn write_compressed<S: ArchiveWrite>(s: &mut S, flags: ECompressionFlags, data: &[u8]) -> Result<()> {
    let method = CompressionMethod::from_flags(flags)?;
    let blocks = data
        .par_chunks(COMPRESSION_CHUNK_SIZE)
        .map(|block| -> Result<(usize, Vec<u8>)> {
            let mut out = vec![];
            compress(method, block, &mut out)?;
            Ok((block.len(), out))
        })
        .collect::<Result<Vec<_>>>()?;

    s.ser(&PACKAGE_FILE_TAG)?;
    s.ser(&(COMPRESSION_CHUNK_SIZE as i32))?;
    let total = FCompressedChunkInfo {
        compressed_size: blocks.iter().map(|(_, c)| c.len() as i32).sum(),
        uncompressed_size: data.len() as i32,
    };
    s.ser(&total)?;
    for (uncompressed, compressed) in &blocks {
        s.ser(&FCompressedChunkInfo {
            compressed_size: compressed.len() as i32,
            uncompressed_size: *uncompressed as i32,
        })?;
    }
    for (_, compressed) in &blocks {
        s.write_all(compressed)?;
    }
    Ok(())
}

/// Inverse of [`write_compressed`]. The leading tag decides the byte order of
/// the block table independently of the outer archive.
#[instrument(skip_all)]
pub fn read_compressed<S: ArchiveRead>(s: &mut S, flags: ECompressionFlags) -> Result<Vec<u8>> {
    let method = CompressionMethod::from_flags(flags)?;
    let outer_swap = s.byte_swapping();
    let tag: u32 = s.de()?;
    let swap = match tag {
        PACKAGE_FILE_TAG => outer_swap,
        PACKAGE_FILE_TAG_SWAPPED => !outer_swap,
        _ => bail!("bad compressed block tag {tag:#010x}"),
    };
    s.set_byte_swapping(swap);
    let result = read_blocks(s, method);
    s.set_byte_swapping(outer_swap);
    result
}

fn read_blocks<S: ArchiveRead>(s: &mut S, method: CompressionMethod) -> Result<Vec<u8>> {
    let block_size: i32 = s.de()?;
    if block_size <= 0 {
        bail!("bad compression block size {block_size}");
    }
    let total: FCompressedChunkInfo = s.de()?;
    if total.uncompressed_size < 0 || total.compressed_size < 0 {
        bail!("bad compressed stream sizes {total:?}");
    }
    let count = (total.uncompressed_size as usize).div_ceil(block_size as usize);
    let infos: Vec<FCompressedChunkInfo> = s.de_ctx(count)?;
    let payloads = infos
        .iter()
        .map(|info| -> Result<Vec<u8>> {
            if info.compressed_size < 0 || info.uncompressed_size < 0 {
                bail!("bad compressed block sizes {info:?}");
            }
            s.de_ctx(info.compressed_size as usize)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut output = vec![0; total.uncompressed_size as usize];
    let mut slices = vec![];
    let mut rest = output.as_mut_slice();
    for info in &infos {
        let size = info.uncompressed_size as usize;
        if size > rest.len() {
            bail!("compressed block overruns stream ({size} > {})", rest.len());
        }
        let (head, tail) = rest.split_at_mut(size);
        slices.push(head);
        rest = tail;
    }
    slices
        .into_par_iter()
        .zip(payloads.par_iter())
        .try_for_each(|(out, input)| decompress(method, input, out))?;
    Ok(output)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_multi_block_stream() -> Result<()> {
        let data = sample(COMPRESSION_CHUNK_SIZE * 2 + 1234);
        let mut ar = Archive::new(Cursor::new(vec![]));
        write_compressed(&mut ar, ECompressionFlags::ZLIB, &data)?;
        ar.get_mut().set_position(0);
        assert_eq!(read_compressed(&mut ar, ECompressionFlags::ZLIB)?, data);
        Ok(())
    }

    #[test]
    fn test_swapped_block_table() -> Result<()> {
        let data = sample(5000);
        let mut ar = Archive::new(Cursor::new(vec![]));
        ar.set_byte_swapping(true);
        write_compressed(&mut ar, ECompressionFlags::ZLIB, &data)?;

        // reader starts out unswapped and must pick the order up from the tag
        let mut reader = Archive::new(Cursor::new(ar.into_inner().into_inner()));
        assert_eq!(read_compressed(&mut reader, ECompressionFlags::ZLIB)?, data);
        assert!(!reader.byte_swapping());
        Ok(())
    }

    #[test]
    fn test_whole_file_with_sidecar() -> Result<()> {
        let data = sample(300_000);
        let packed = compress_whole(&data)?;
        let size = parse_uncompressed_size(format!("{}\r\n", data.len()).as_bytes())?;
        assert_eq!(decompress_whole(&packed, size)?, data);
        assert!(decompress_whole(&packed, size + 1).is_err());
        Ok(())
    }

    #[test]
    fn test_unsupported_method() {
        let err = CompressionMethod::from_flags(ECompressionFlags::LZO).unwrap_err();
        assert_eq!(crate::error::error_kind(&err), crate::error::ErrorKind::Format);
    }
}
