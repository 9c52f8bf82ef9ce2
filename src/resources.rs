use std::fmt::{Display, Formatter};

use anyhow::Result;
use bitflags::bitflags;
use tracing::instrument;

use crate::FGuid;
use crate::name_map::{FName, NAME_NONE, NameIndexer};
use crate::object_store::ObjectRef;
use crate::ser::*;
use crate::version::VER_REMOVED_COMPONENT_MAP;

/// Signed reference into a linker's tables: `0` is null (the root package),
/// `+i` export `i-1`, `-i` import `i-1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FPackageIndex(pub i32);
impl FPackageIndex {
    pub const NULL: FPackageIndex = FPackageIndex(0);

    pub fn from_import(index: usize) -> Self {
        Self(-(index as i32) - 1)
    }
    pub fn from_export(index: usize) -> Self {
        Self(index as i32 + 1)
    }
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
    pub fn is_import(self) -> bool {
        self.0 < 0
    }
    pub fn is_export(self) -> bool {
        self.0 > 0
    }
    pub fn to_import(self) -> Option<usize> {
        self.is_import().then(|| (-self.0 - 1) as usize)
    }
    pub fn to_export(self) -> Option<usize> {
        self.is_export().then(|| (self.0 - 1) as usize)
    }
}
impl Display for FPackageIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.to_import(), self.to_export()) {
            (Some(i), _) => write!(f, "Import({i})"),
            (_, Some(i)) => write!(f, "Export({i})"),
            _ => write!(f, "Null"),
        }
    }
}
impl Readable for FPackageIndex {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self(s.de()?))
    }
}
impl Writeable for FPackageIndex {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EObjectFlags: u64 {
        const IN_SINGULAR_FUNC = 0x0000_0000_0000_0002;
        const PROTECTED = 0x0000_0000_0000_0100;
        const CLASS_DEFAULT_OBJECT = 0x0000_0000_0000_0200;
        const ARCHETYPE_OBJECT = 0x0000_0000_0000_0400;
        const FORCE_TAG_EXP = 0x0000_0000_0000_0800;
        const ROOT_SET = 0x0000_0000_0000_4000;
        const LOCALIZED_RESOURCE = 0x0000_0000_0008_0000;
        const PENDING_FIELD_PATCHES = 0x0000_0000_0020_0000;
        const IS_CROSS_LEVEL_REFERENCED = 0x0000_0000_0040_0000;
        const SAVED = 0x0000_0000_8000_0000;
        const TRANSACTIONAL = 0x0000_0001_0000_0000;
        const PUBLIC = 0x0000_0004_0000_0000;
        const TAG_IMP = 0x0000_0008_0000_0000;
        const TAG_EXP = 0x0000_0010_0000_0000;
        const OBSOLETE = 0x0000_0020_0000_0000;
        const PER_OBJECT_LOCALIZED = 0x0000_0100_0000_0000;
        const NEED_LOAD = 0x0000_0200_0000_0000;
        const ASYNC_LOADING = 0x0000_0400_0000_0000;
        const NEED_POST_LOAD_SUBOBJECTS = 0x0000_0800_0000_0000;
        const TRANSIENT = 0x0000_4000_0000_0000;
        const COOKED = 0x0000_8000_0000_0000;
        const LOAD_FOR_CLIENT = 0x0001_0000_0000_0000;
        const LOAD_FOR_SERVER = 0x0002_0000_0000_0000;
        const LOAD_FOR_EDIT = 0x0004_0000_0000_0000;
        const STANDALONE = 0x0008_0000_0000_0000;
        const NOT_FOR_CLIENT = 0x0010_0000_0000_0000;
        const NOT_FOR_SERVER = 0x0020_0000_0000_0000;
        const NOT_FOR_EDIT = 0x0040_0000_0000_0000;
        const NEED_POST_LOAD = 0x0100_0000_0000_0000;
        const HAS_STACK = 0x0200_0000_0000_0000;
        const NATIVE = 0x0400_0000_0000_0000;
        const MARKED = 0x0800_0000_0000_0000;
        const PENDING_KILL = 0x2000_0000_0000_0000;

        const CONTEXT_FLAGS = Self::NOT_FOR_CLIENT.bits() | Self::NOT_FOR_SERVER.bits() | Self::NOT_FOR_EDIT.bits();
        const LOAD_CONTEXT_FLAGS = Self::LOAD_FOR_CLIENT.bits() | Self::LOAD_FOR_SERVER.bits() | Self::LOAD_FOR_EDIT.bits();
        /// Flags carried from an export onto the object created for it.
        const LOAD = Self::CONTEXT_FLAGS.bits()
            | Self::LOAD_CONTEXT_FLAGS.bits()
            | Self::PUBLIC.bits()
            | Self::STANDALONE.bits()
            | Self::NATIVE.bits()
            | Self::OBSOLETE.bits()
            | Self::PROTECTED.bits()
            | Self::TRANSACTIONAL.bits()
            | Self::HAS_STACK.bits()
            | Self::PER_OBJECT_LOCALIZED.bits()
            | Self::CLASS_DEFAULT_OBJECT.bits()
            | Self::ARCHETYPE_OBJECT.bits()
            | Self::LOCALIZED_RESOURCE.bits();
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EExportFlags: u32 {
        const FORCED_EXPORT = 0x1;
        const SCRIPT_PATCHER_EXPORT = 0x2;
        const MEMBER_FIELD_PATCH_PENDING = 0x4;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EPackageFlags: u32 {
        const ALLOW_DOWNLOAD = 0x0000_0001;
        const CLIENT_OPTIONAL = 0x0000_0002;
        const SERVER_SIDE_ONLY = 0x0000_0004;
        const COOKED = 0x0000_0008;
        const UNSECURE = 0x0000_0010;
        const SAVED_WITH_NEWER_VERSION = 0x0000_0020;
        const NEED = 0x0000_8000;
        const COMPILING = 0x0001_0000;
        const CONTAINS_MAP = 0x0002_0000;
        const TRASH = 0x0004_0000;
        const DISALLOW_LAZY_LOADING = 0x0008_0000;
        const PLAY_IN_EDITOR = 0x0010_0000;
        const CONTAINS_SCRIPT = 0x0020_0000;
        const CONTAINS_DEBUG_INFO = 0x0040_0000;
        const REQUIRE_IMPORTS_ALREADY_LOADED = 0x0080_0000;
        const STORE_COMPRESSED = 0x0200_0000;
        const STORE_FULLY_COMPRESSED = 0x0400_0000;
        const CONTAINS_FACE_FX_DATA = 0x1000_0000;
        const NO_EXPORT_ALLOWED = 0x2000_0000;
        const STRIPPED_SOURCE = 0x4000_0000;
        const FILTER_EDITOR_ONLY = 0x8000_0000;
    }
}

/// Reference to an object stored in another package.
#[derive(Debug, Clone, PartialEq)]
pub struct FObjectImport {
    pub class_package: FName,
    pub class_name: FName,
    pub outer_index: FPackageIndex,
    pub object_name: FName,

    /// Linker of the package the import resolved to.
    pub source_linker: Option<crate::LinkerId>,
    /// Export index inside `source_linker`.
    pub source_index: Option<usize>,
    pub x_object: Option<ObjectRef>,
}
impl FObjectImport {
    pub fn new(class_package: FName, class_name: FName, outer_index: FPackageIndex, object_name: FName) -> Self {
        Self {
            class_package,
            class_name,
            outer_index,
            object_name,
            source_linker: None,
            source_index: None,
            x_object: None,
        }
    }
    /// Identity used to reject duplicate imports.
    pub fn same_as(&self, other: &FObjectImport) -> bool {
        self.object_name == other.object_name
            && self.outer_index == other.outer_index
            && self.class_package == other.class_package
            && self.class_name == other.class_name
            && self.source_index == other.source_index
    }
}
impl ReadableCtx<&[FName]> for FObjectImport {
    #[instrument(skip_all, name = "FObjectImport")]
    fn de<S: ArchiveRead>(s: &mut S, names: &[FName]) -> Result<Self> {
        Ok(Self::new(s.de_ctx(names)?, s.de_ctx(names)?, s.de()?, s.de_ctx(names)?))
    }
}
impl WriteableCtx<&dyn NameIndexer> for FObjectImport {
    fn ser<S: ArchiveWrite>(&self, s: &mut S, names: &dyn NameIndexer) -> Result<()> {
        s.ser_ctx(&self.class_package, names)?;
        s.ser_ctx(&self.class_name, names)?;
        s.ser(&self.outer_index)?;
        s.ser_ctx(&self.object_name, names)?;
        Ok(())
    }
}

/// Object stored in this package.
#[derive(Debug, Clone, PartialEq)]
pub struct FObjectExport {
    pub class_index: FPackageIndex,
    pub super_index: FPackageIndex,
    pub outer_index: FPackageIndex,
    pub object_name: FName,
    pub archetype_index: FPackageIndex,
    pub object_flags: EObjectFlags,
    pub serial_size: i32,
    pub serial_offset: i32,
    pub export_flags: EExportFlags,
    pub generation_net_object_count: Vec<i32>,
    pub package_guid: FGuid,
    pub package_flags: EPackageFlags,

    pub object: Option<ObjectRef>,
    pub hash_next: Option<usize>,
}
impl Default for FObjectExport {
    fn default() -> Self {
        Self {
            class_index: FPackageIndex::NULL,
            super_index: FPackageIndex::NULL,
            outer_index: FPackageIndex::NULL,
            object_name: NAME_NONE,
            archetype_index: FPackageIndex::NULL,
            object_flags: EObjectFlags::empty(),
            serial_size: 0,
            serial_offset: 0,
            export_flags: EExportFlags::empty(),
            generation_net_object_count: vec![],
            package_guid: FGuid::default(),
            package_flags: EPackageFlags::empty(),
            object: None,
            hash_next: None,
        }
    }
}
impl FObjectExport {
    pub fn is_forced(&self) -> bool {
        self.export_flags.contains(EExportFlags::FORCED_EXPORT)
    }
    pub fn is_patched(&self) -> bool {
        self.export_flags.contains(EExportFlags::SCRIPT_PATCHER_EXPORT)
    }
    /// Identity used to reject duplicate exports.
    pub fn same_as(&self, other: &FObjectExport) -> bool {
        self.object_name == other.object_name
            && self.outer_index == other.outer_index
            && self.class_index == other.class_index
            && self.super_index == other.super_index
            && self.archetype_index == other.archetype_index
    }
}
impl ReadableCtx<&[FName]> for FObjectExport {
    #[instrument(skip_all, name = "FObjectExport")]
    fn de<S: ArchiveRead>(s: &mut S, names: &[FName]) -> Result<Self> {
        let mut export = FObjectExport {
            class_index: s.de()?,
            super_index: s.de()?,
            outer_index: s.de()?,
            object_name: s.de_ctx(names)?,
            archetype_index: s.de()?,
            object_flags: EObjectFlags::from_bits_retain(s.de()?),
            serial_size: s.de()?,
            ..Default::default()
        };
        if export.serial_size > 0 {
            export.serial_offset = s.de()?;
        }
        if s.ver() < VER_REMOVED_COMPONENT_MAP {
            // legacy component map, no longer used
            let count = read_count(s)?;
            for _ in 0..count {
                let _name: FName = s.de_ctx(names)?;
                let _index: i32 = s.de()?;
            }
        }
        export.export_flags = EExportFlags::from_bits_retain(s.de()?);
        export.generation_net_object_count = s.de()?;
        export.package_guid = s.de()?;
        export.package_flags = EPackageFlags::from_bits_retain(s.de()?);
        Ok(export)
    }
}
impl WriteableCtx<&dyn NameIndexer> for FObjectExport {
    fn ser<S: ArchiveWrite>(&self, s: &mut S, names: &dyn NameIndexer) -> Result<()> {
        s.ser(&self.class_index)?;
        s.ser(&self.super_index)?;
        s.ser(&self.outer_index)?;
        s.ser_ctx(&self.object_name, names)?;
        s.ser(&self.archetype_index)?;
        s.ser(&self.object_flags.bits())?;
        s.ser(&self.serial_size)?;
        if self.serial_size > 0 {
            s.ser(&self.serial_offset)?;
        }
        if s.ver() < VER_REMOVED_COMPONENT_MAP {
            s.ser(&0i32)?;
        }
        s.ser(&self.export_flags.bits())?;
        s.ser(&self.generation_net_object_count)?;
        s.ser(&self.package_guid)?;
        s.ser(&self.package_flags.bits())?;
        Ok(())
    }
}

/// GUIDs of objects in another level that this package references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FLevelGuids {
    pub level_name: FName,
    pub guids: Vec<FGuid>,
}
impl Readable for FLevelGuids {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        let level_name: String = s.de()?;
        Ok(Self {
            level_name: FName::new(&level_name),
            guids: s.de()?,
        })
    }
}
impl Writeable for FLevelGuids {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.level_name.to_string())?;
        s.ser(&self.guids)?;
        Ok(())
    }
}

/// GUID of an export that other levels may reference, with its 1-based
/// export index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FExportGuid {
    pub guid: FGuid,
    pub export_index: i32,
}
impl Readable for FExportGuid {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            guid: s.de()?,
            export_index: s.de()?,
        })
    }
}
impl Writeable for FExportGuid {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.guid)?;
        s.ser(&self.export_index)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FObjectThumbnail {
    pub image_width: i32,
    pub image_height: i32,
    pub compressed_image_data: Vec<u8>,
}
impl Readable for FObjectThumbnail {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            image_width: s.de()?,
            image_height: s.de()?,
            compressed_image_data: s.de()?,
        })
    }
}
impl Writeable for FObjectThumbnail {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.image_width)?;
        s.ser(&self.image_height)?;
        s.ser(&self.compressed_image_data)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FThumbnailEntry {
    pub class_name: String,
    pub object_path_without_package: String,
    pub file_offset: i32,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::version::VER_MIN_PACKAGE;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Cursor;

    struct Names(HashMap<FName, i32>);
    impl NameIndexer for Names {
        fn name_index(&self, name: FName) -> Result<i32> {
            self.0.get(&name.base()).copied().ok_or_else(|| anyhow::anyhow!("unmapped {name}"))
        }
    }

    #[test]
    fn test_package_index() {
        assert_eq!(FPackageIndex::from_import(0), FPackageIndex(-1));
        assert_eq!(FPackageIndex::from_export(0), FPackageIndex(1));
        assert_eq!(FPackageIndex(-3).to_import(), Some(2));
        assert_eq!(FPackageIndex(3).to_export(), Some(2));
        assert_eq!(FPackageIndex(0).to_export(), None);
        assert_eq!(FPackageIndex(-1).to_string(), "Import(0)");
    }

    #[test]
    fn test_export_with_legacy_component_map() -> Result<()> {
        let names = vec![NAME_NONE, FName::new("Widget")];
        let indexer = Names(names.iter().enumerate().map(|(i, n)| (*n, i as i32)).collect());
        let export = FObjectExport {
            class_index: FPackageIndex(-1),
            outer_index: FPackageIndex::NULL,
            object_name: FName::with_number("Widget", 3),
            object_flags: EObjectFlags::PUBLIC | EObjectFlags::LOAD_FOR_CLIENT,
            serial_size: 12,
            serial_offset: 400,
            generation_net_object_count: vec![1, 2],
            ..Default::default()
        };

        let mut ar = Archive::new(Cursor::new(vec![]));
        ar.set_ver(VER_MIN_PACKAGE, 0);
        ar.ser_ctx(&export, &indexer as &dyn NameIndexer)?;
        ar.get_mut().set_position(0);
        let read: FObjectExport = ar.de_ctx(names.as_slice())?;
        assert_eq!(read, export);
        assert_eq!(read.object_name.to_string(), "Widget_2");
        Ok(())
    }

    #[test]
    fn test_bad_name_index() {
        let mut ar = Archive::new(Cursor::new([9i32.to_le_bytes(), 0i32.to_le_bytes()].concat()));
        let names = [NAME_NONE];
        assert!(FName::de(&mut ar, &names[..]).is_err());
    }
}
