use anyhow::Result;
use tracing::instrument;

use crate::FGuid;
use crate::compression::{ECompressionFlags, FCompressedChunk};
use crate::error::LinkerError;
use crate::resources::EPackageFlags;
use crate::ser::*;
use crate::version::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FGenerationInfo {
    pub export_count: i32,
    pub name_count: i32,
    pub net_object_count: i32,
}
impl Readable for FGenerationInfo {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            export_count: s.de()?,
            name_count: s.de()?,
            net_object_count: s.de()?,
        })
    }
}
impl Writeable for FGenerationInfo {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.export_count)?;
        s.ser(&self.name_count)?;
        s.ser(&self.net_object_count)?;
        Ok(())
    }
}

/// Textures of one size and format whose memory can be reserved before the
/// exports using them are created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FTextureType {
    pub size_x: i32,
    pub size_y: i32,
    pub num_mips: i32,
    pub format: u32,
    pub tex_create_flags: u32,
    pub export_indices: Vec<i32>,
}
impl Readable for FTextureType {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            size_x: s.de()?,
            size_y: s.de()?,
            num_mips: s.de()?,
            format: s.de()?,
            tex_create_flags: s.de()?,
            export_indices: s.de()?,
        })
    }
}
impl Writeable for FTextureType {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.size_x)?;
        s.ser(&self.size_y)?;
        s.ser(&self.num_mips)?;
        s.ser(&self.format)?;
        s.ser(&self.tex_create_flags)?;
        s.ser(&self.export_indices)?;
        Ok(())
    }
}

/// Fixed header at the start of every package file.
#[derive(Debug, Clone, PartialEq)]
pub struct FPackageFileSummary {
    pub tag: u32,
    pub file_version: i32,
    pub licensee_version: i32,
    pub total_header_size: i32,
    pub folder_name: String,
    pub package_flags: EPackageFlags,
    pub name_count: i32,
    pub name_offset: i32,
    pub export_count: i32,
    pub export_offset: i32,
    pub import_count: i32,
    pub import_offset: i32,
    pub depends_offset: i32,
    pub import_export_guids_offset: i32,
    pub import_guids_count: i32,
    pub export_guids_count: i32,
    pub thumbnail_table_offset: i32,
    pub guid: FGuid,
    pub generations: Vec<FGenerationInfo>,
    pub engine_version: i32,
    pub cooked_content_version: i32,
    pub compression_flags: ECompressionFlags,
    pub compressed_chunks: Vec<FCompressedChunk>,
    pub package_source: u32,
    pub additional_packages_to_cook: Vec<String>,
    pub texture_allocations: Vec<FTextureType>,
}
impl Default for FPackageFileSummary {
    fn default() -> Self {
        Self {
            tag: PACKAGE_FILE_TAG,
            file_version: VER_LATEST_ENGINE,
            licensee_version: VER_LATEST_ENGINE_LICENSEE,
            total_header_size: 0,
            folder_name: "None".into(),
            package_flags: EPackageFlags::empty(),
            name_count: 0,
            name_offset: 0,
            export_count: 0,
            export_offset: 0,
            import_count: 0,
            import_offset: 0,
            depends_offset: 0,
            import_export_guids_offset: -1,
            import_guids_count: 0,
            export_guids_count: 0,
            thumbnail_table_offset: 0,
            guid: FGuid::default(),
            generations: vec![],
            engine_version: ENGINE_VERSION,
            cooked_content_version: 0,
            compression_flags: ECompressionFlags::empty(),
            compressed_chunks: vec![],
            package_source: 0,
            additional_packages_to_cook: vec![],
            texture_allocations: vec![],
        }
    }
}

impl FPackageFileSummary {
    /// Read the summary, switching `s` to the byte order selected by the tag
    /// and to the file's versions. A tag that is neither canonical nor
    /// swapped fails before anything else is read.
    #[instrument(skip_all, name = "FPackageFileSummary")]
    pub fn read<S: ArchiveRead>(s: &mut S, filename: &str) -> Result<Self> {
        let mut tag: u32 = s.de()?;
        if tag == PACKAGE_FILE_TAG_SWAPPED {
            s.set_byte_swapping(!s.byte_swapping());
            tag = PACKAGE_FILE_TAG;
        } else if tag != PACKAGE_FILE_TAG {
            return Err(LinkerError::BinaryFormat {
                filename: filename.to_string(),
                tag,
            }
            .into());
        }
        let packed: i32 = s.de()?;
        let (file_version, licensee_version) = split_file_version(packed);
        s.set_ver(file_version, licensee_version);

        let mut sum = FPackageFileSummary {
            tag,
            file_version,
            licensee_version,
            total_header_size: s.de()?,
            folder_name: s.de()?,
            package_flags: EPackageFlags::from_bits_retain(s.de()?),
            name_count: s.de()?,
            name_offset: s.de()?,
            export_count: s.de()?,
            export_offset: s.de()?,
            import_count: s.de()?,
            import_offset: s.de()?,
            depends_offset: s.de()?,
            ..Default::default()
        };
        if file_version >= VER_ADDED_CROSSLEVEL_REFERENCES {
            sum.import_export_guids_offset = s.de()?;
            sum.import_guids_count = s.de()?;
            sum.export_guids_count = s.de()?;
        }
        if file_version >= VER_ASSET_THUMBNAILS_IN_PACKAGES {
            sum.thumbnail_table_offset = s.de()?;
        }
        sum.guid = s.de()?;
        sum.generations = s.de()?;
        sum.engine_version = s.de()?;
        sum.cooked_content_version = s.de()?;
        sum.compression_flags = ECompressionFlags::from_bits_retain(s.de()?);
        sum.compressed_chunks = s.de()?;
        sum.package_source = s.de()?;
        if file_version >= VER_ADDITIONAL_COOK_PACKAGE_SUMMARY {
            sum.additional_packages_to_cook = s.de()?;
        }
        if file_version >= VER_TEXTURE_PREALLOCATION {
            sum.texture_allocations = s.de()?;
        }
        Ok(sum)
    }

    /// Reject counts and offsets that can't describe a file of `total_size`
    /// bytes.
    pub fn validate(&self, filename: &str, total_size: u64) -> Result<()> {
        let check = |field: &'static str, value: i32, limit: i64| -> Result<()> {
            if value < 0 || value as i64 > limit {
                return Err(LinkerError::SummaryOutOfBounds {
                    filename: filename.to_string(),
                    field,
                    value: value as i64,
                }
                .into());
            }
            Ok(())
        };
        let size = total_size as i64;
        check("NameCount", self.name_count, size)?;
        check("ImportCount", self.import_count, size)?;
        check("ExportCount", self.export_count, size)?;
        if self.name_count > 0 {
            check("NameOffset", self.name_offset, size)?;
        }
        if self.import_count > 0 {
            check("ImportOffset", self.import_offset, size)?;
        }
        if self.export_count > 0 {
            check("ExportOffset", self.export_offset, size)?;
        }
        check("TotalHeaderSize", self.total_header_size, size)?;
        if self.import_export_guids_offset != -1 {
            check("ImportExportGuidsOffset", self.import_export_guids_offset, size)?;
        }
        Ok(())
    }

    pub fn export_count_at_generation(&self) -> i32 {
        self.generations.last().map(|g| g.export_count).unwrap_or(self.export_count)
    }
}

impl Writeable for FPackageFileSummary {
    #[instrument(skip_all, name = "FPackageFileSummary")]
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        let ver = self.file_version;
        s.ser(&self.tag)?;
        s.ser(&pack_file_version(ver, self.licensee_version))?;
        s.ser(&self.total_header_size)?;
        s.ser(&self.folder_name)?;
        s.ser(&self.package_flags.bits())?;
        s.ser(&self.name_count)?;
        s.ser(&self.name_offset)?;
        s.ser(&self.export_count)?;
        s.ser(&self.export_offset)?;
        s.ser(&self.import_count)?;
        s.ser(&self.import_offset)?;
        s.ser(&self.depends_offset)?;
        if ver >= VER_ADDED_CROSSLEVEL_REFERENCES {
            s.ser(&self.import_export_guids_offset)?;
            s.ser(&self.import_guids_count)?;
            s.ser(&self.export_guids_count)?;
        }
        if ver >= VER_ASSET_THUMBNAILS_IN_PACKAGES {
            s.ser(&self.thumbnail_table_offset)?;
        }
        s.ser(&self.guid)?;
        s.ser(&self.generations)?;
        s.ser(&self.engine_version)?;
        s.ser(&self.cooked_content_version)?;
        s.ser(&self.compression_flags.bits())?;
        s.ser(&self.compressed_chunks)?;
        s.ser(&self.package_source)?;
        if ver >= VER_ADDITIONAL_COOK_PACKAGE_SUMMARY {
            s.ser(&self.additional_packages_to_cook)?;
        }
        if ver >= VER_TEXTURE_PREALLOCATION {
            s.ser(&self.texture_allocations)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{ErrorKind, error_kind};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn sample() -> FPackageFileSummary {
        FPackageFileSummary {
            folder_name: "Content".into(),
            package_flags: EPackageFlags::ALLOW_DOWNLOAD | EPackageFlags::CONTAINS_SCRIPT,
            name_count: 3,
            name_offset: 200,
            generations: vec![FGenerationInfo {
                export_count: 2,
                name_count: 3,
                net_object_count: 1,
            }],
            additional_packages_to_cook: vec!["Extra".into()],
            texture_allocations: vec![FTextureType {
                size_x: 256,
                size_y: 256,
                num_mips: 9,
                format: 3,
                tex_create_flags: 0,
                export_indices: vec![1, 4],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_swapped_summary_sets_archive_state() -> Result<()> {
        let summary = sample();
        let mut writer = Archive::new(Cursor::new(vec![]));
        writer.set_byte_swapping(true);
        writer.ser(&summary)?;

        let mut reader = Archive::new(Cursor::new(writer.into_inner().into_inner()));
        let read = FPackageFileSummary::read(&mut reader, "Swapped.upk")?;
        assert!(reader.byte_swapping());
        assert_eq!(reader.ver(), VER_LATEST_ENGINE);
        assert_eq!(read, summary);
        Ok(())
    }

    #[test]
    fn test_bad_tag_stops_reading() {
        let mut reader = Archive::new(Cursor::new(0xdeadbeefu32.to_le_bytes().to_vec()));
        let err = FPackageFileSummary::read(&mut reader, "Bad.upk").unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Format);
        assert_eq!(reader.get_ref().position(), 4);
    }

    #[test]
    fn test_old_layout_skips_gated_fields() -> Result<()> {
        let summary = FPackageFileSummary {
            file_version: VER_MIN_PACKAGE,
            ..sample()
        };
        let mut writer = Archive::new(Cursor::new(vec![]));
        writer.ser(&summary)?;
        let mut reader = Archive::new(Cursor::new(writer.into_inner().into_inner()));
        let read = FPackageFileSummary::read(&mut reader, "Old.upk")?;
        assert_eq!(read.import_export_guids_offset, -1);
        assert!(read.additional_packages_to_cook.is_empty());
        assert!(read.texture_allocations.is_empty());
        assert_eq!(read.folder_name, "Content");
        Ok(())
    }

    #[test]
    fn test_validate_bounds() {
        let summary = FPackageFileSummary {
            name_offset: 5000,
            ..sample()
        };
        assert!(summary.validate("A.upk", 1000).is_err());
        assert!(sample().validate("A.upk", 1000).is_ok());
    }
}
