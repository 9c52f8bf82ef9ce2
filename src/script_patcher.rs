//! Script patch overlays: extra names, imports and exports plus bytecode,
//! default object and enum replacements merged into a linker after its
//! tables are read.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use fs_err as fs;
use tracing::{debug, instrument, warn};

use crate::FGuid;
use crate::archive::Loader;
use crate::error::LinkerError;
use crate::linker_load::LinkerLoad;
use crate::name_map::*;
use crate::resources::*;
use crate::ser::*;

pub const PATCH_MAGIC: u32 = 0x5041_5443;
pub const PATCH_EXTENSION: &str = "patch";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchImport {
    pub class_package: String,
    pub class_name: String,
    pub outer_index: FPackageIndex,
    pub object_name: String,
}
impl Readable for PatchImport {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            class_package: s.de()?,
            class_name: s.de()?,
            outer_index: s.de()?,
            object_name: s.de()?,
        })
    }
}
impl Writeable for PatchImport {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.class_package)?;
        s.ser(&self.class_name)?;
        s.ser(&self.outer_index)?;
        s.ser(&self.object_name)?;
        Ok(())
    }
}
impl PatchImport {
    fn to_import(&self) -> FObjectImport {
        FObjectImport::new(
            FName::new(&self.class_package),
            FName::new(&self.class_name),
            self.outer_index,
            FName::new(&self.object_name),
        )
    }
}

/// Export record of a patch. Serial offset and size come from the paired
/// body blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchExport {
    pub class_index: FPackageIndex,
    pub super_index: FPackageIndex,
    pub outer_index: FPackageIndex,
    pub object_name: String,
    pub archetype_index: FPackageIndex,
    pub object_flags: EObjectFlags,
    pub export_flags: EExportFlags,
    pub package_guid: FGuid,
    pub package_flags: EPackageFlags,
}
impl Readable for PatchExport {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            class_index: s.de()?,
            super_index: s.de()?,
            outer_index: s.de()?,
            object_name: s.de()?,
            archetype_index: s.de()?,
            object_flags: EObjectFlags::from_bits_retain(s.de()?),
            export_flags: EExportFlags::from_bits_retain(s.de()?),
            package_guid: s.de()?,
            package_flags: EPackageFlags::from_bits_retain(s.de()?),
        })
    }
}
impl Writeable for PatchExport {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.class_index)?;
        s.ser(&self.super_index)?;
        s.ser(&self.outer_index)?;
        s.ser(&self.object_name)?;
        s.ser(&self.archetype_index)?;
        s.ser(&self.object_flags.bits())?;
        s.ser(&self.export_flags.bits())?;
        s.ser(&self.package_guid)?;
        s.ser(&self.package_flags.bits())?;
        Ok(())
    }
}
impl PatchExport {
    fn to_export(&self) -> FObjectExport {
        FObjectExport {
            class_index: self.class_index,
            super_index: self.super_index,
            outer_index: self.outer_index,
            object_name: FName::new(&self.object_name),
            archetype_index: self.archetype_index,
            object_flags: self.object_flags,
            export_flags: self.export_flags,
            package_guid: self.package_guid,
            package_flags: self.package_flags,
            ..Default::default()
        }
    }
}

/// Replacement bytecode for a function or state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptPatch {
    pub struct_name: String,
    /// Full path of the patched export.
    pub data_name: String,
    pub data: Vec<u8>,
}
impl Readable for ScriptPatch {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            struct_name: s.de()?,
            data_name: s.de()?,
            data: s.de()?,
        })
    }
}
impl Writeable for ScriptPatch {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.struct_name)?;
        s.ser(&self.data_name)?;
        s.ser(&self.data)?;
        Ok(())
    }
}

/// Replacement body for a class default object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultsPatch {
    pub data_name: String,
    pub data: Vec<u8>,
}
impl Readable for DefaultsPatch {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            data_name: s.de()?,
            data: s.de()?,
        })
    }
}
impl Writeable for DefaultsPatch {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.data_name)?;
        s.ser(&self.data)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnumPatch {
    pub enum_name: String,
    pub enum_path: String,
    pub values: Vec<String>,
}
impl Readable for EnumPatch {
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            enum_name: s.de()?,
            enum_path: s.de()?,
            values: s.de()?,
        })
    }
}
impl Writeable for EnumPatch {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.enum_name)?;
        s.ser(&self.enum_path)?;
        s.ser(&self.values)?;
        Ok(())
    }
}

/// Everything a patch file adds to one package.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkerPatchData {
    pub package_name: String,
    pub package_suffix: String,
    pub names: Vec<String>,
    pub imports: Vec<PatchImport>,
    pub exports: Vec<PatchExport>,
    pub export_data: Vec<Vec<u8>>,
    pub script_patches: Vec<ScriptPatch>,
    pub modified_class_default_objects: Vec<DefaultsPatch>,
    pub modified_enums: Vec<EnumPatch>,
}
impl Readable for LinkerPatchData {
    #[instrument(skip_all, name = "LinkerPatchData")]
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        let magic: u32 = s.de()?;
        if magic != PATCH_MAGIC {
            bail!("bad script patch magic {magic:#010x}");
        }
        let patch = Self {
            package_name: s.de()?,
            package_suffix: s.de()?,
            names: s.de()?,
            imports: s.de()?,
            exports: s.de()?,
            export_data: s.de()?,
            script_patches: s.de()?,
            modified_class_default_objects: s.de()?,
            modified_enums: s.de()?,
        };
        if patch.exports.len() != patch.export_data.len() {
            bail!(
                "script patch for {} has {} exports but {} bodies",
                patch.package_name,
                patch.exports.len(),
                patch.export_data.len()
            );
        }
        Ok(patch)
    }
}
impl Writeable for LinkerPatchData {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&PATCH_MAGIC)?;
        s.ser(&self.package_name)?;
        s.ser(&self.package_suffix)?;
        s.ser(&self.names)?;
        s.ser(&self.imports)?;
        s.ser(&self.exports)?;
        s.ser(&self.export_data)?;
        s.ser(&self.script_patches)?;
        s.ser(&self.modified_class_default_objects)?;
        s.ser(&self.modified_enums)?;
        Ok(())
    }
}
impl LinkerPatchData {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Archive::new(Cursor::new(data)).de()
    }
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut ar = Archive::new(Cursor::new(vec![]));
        ar.ser(self)?;
        Ok(ar.into_inner().into_inner())
    }
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
            && self.imports.is_empty()
            && self.exports.is_empty()
            && self.script_patches.is_empty()
            && self.modified_class_default_objects.is_empty()
            && self.modified_enums.is_empty()
    }
}

/// Registry of patch overlays keyed by package name.
#[derive(Debug, Default)]
pub struct ScriptPatcher {
    package_suffix: String,
    patches: HashMap<FName, Arc<LinkerPatchData>>,
}
impl ScriptPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `<Package>.patch` in `dirs`.
    #[instrument(skip_all)]
    pub fn from_dirs(dirs: &[PathBuf]) -> Result<Self> {
        let mut patcher = Self::new();
        for dir in dirs {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e.eq_ignore_ascii_case(PATCH_EXTENSION)) {
                    patcher.load_file(&path)?;
                }
            }
        }
        Ok(patcher)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        let patch = LinkerPatchData::from_bytes(&data).with_context(|| format!("failed to parse {}", path.display()))?;
        debug!("loaded script patch {} for {}", path.display(), patch.package_name);
        self.add(patch);
        Ok(())
    }

    pub fn add(&mut self, patch: LinkerPatchData) {
        if self.package_suffix.is_empty() && !patch.package_suffix.is_empty() {
            self.package_suffix = patch.package_suffix.clone();
        }
        self.patches.insert(FName::new(&patch.package_name), Arc::new(patch));
    }

    /// Suffix appended to the names of patched packages, empty if none.
    pub fn package_suffix(&self) -> &str {
        &self.package_suffix
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Patch for `package`. A package loaded under its suffixed name finds
    /// the patch of its base name.
    pub fn linker_patch(&self, package: FName) -> Option<Arc<LinkerPatchData>> {
        if let Some(patch) = self.patches.get(&package) {
            return Some(patch.clone());
        }
        if self.package_suffix.is_empty() {
            return None;
        }
        let name = package.to_string();
        let len = name.len().checked_sub(self.package_suffix.len())?;
        if !name.is_char_boundary(len) || !name[len..].eq_ignore_ascii_case(&self.package_suffix) {
            return None;
        }
        self.patches.get(&FName::new(&name[..len])).cloned()
    }
}

/// Patch integration state of one linker.
#[derive(Debug, Default)]
pub struct LinkerPatches {
    pub(crate) data: Option<Arc<LinkerPatchData>>,
    looked_up: bool,
    /// Sub-steps completed so far, in [`PATCH_STEPS`] order.
    completed: usize,
    /// Export index to replacement bytecode.
    pub functions: HashMap<usize, Vec<u8>>,
    /// Export index to the default object body range in the patch archive.
    pub defaults: HashMap<usize, (u64, u64)>,
    pub enums: HashMap<usize, Vec<FName>>,
}
impl LinkerPatches {
    pub fn is_active(&self) -> bool {
        self.data.is_some()
    }
    pub fn is_done(&self) -> bool {
        self.completed == PATCH_STEPS.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchStep {
    Names,
    Imports,
    Exports,
    Functions,
    Defaults,
    Enums,
}
const PATCH_STEPS: [PatchStep; 6] = [
    PatchStep::Names,
    PatchStep::Imports,
    PatchStep::Exports,
    PatchStep::Functions,
    PatchStep::Defaults,
    PatchStep::Enums,
];

impl LinkerLoad {
    /// Merge this package's patch, if `patcher` has one. Each sub-step runs
    /// once; the time budget is checked between them.
    #[instrument(skip_all, fields(filename = %self.filename))]
    pub(crate) fn integrate_script_patches(&mut self, patcher: Option<&ScriptPatcher>) -> Result<bool> {
        if !self.patches.looked_up {
            self.patches.data = patcher.and_then(|p| p.linker_patch(self.root_name));
            self.patches.looked_up = true;
        }
        let Some(data) = self.patches.data.clone() else {
            self.patches.completed = PATCH_STEPS.len();
            return Ok(true);
        };
        while let Some(&step) = PATCH_STEPS.get(self.patches.completed) {
            match step {
                PatchStep::Names => self.append_names(&data),
                PatchStep::Imports => self.append_imports(&data)?,
                PatchStep::Exports => self.append_exports(&data)?,
                PatchStep::Functions => self.find_function_patches(&data),
                PatchStep::Defaults => self.find_defaults_patches(&data),
                PatchStep::Enums => self.find_enum_patches(&data),
            }
            self.patches.completed += 1;
            if self.time.is_exceeded() {
                break;
            }
        }
        if !self.patches.is_done() {
            return Ok(false);
        }
        if self.patch_loader.is_none() && !self.patch_data.is_empty() {
            let reader = std::mem::take(&mut self.patch_data);
            let mut ar = Archive::new(Box::new(reader) as Box<dyn Loader>);
            ar.set_ver(self.summary.file_version, self.summary.licensee_version);
            self.patch_loader = Some(ar);
        }
        Ok(true)
    }

    /// Duplicates are kept; patched exports may already refer to the later
    /// index.
    fn append_names(&mut self, data: &LinkerPatchData) {
        self.name_map.extend(data.names.iter().map(|n| FName::with_number(n, 0)));
    }

    fn append_imports(&mut self, data: &LinkerPatchData) -> Result<()> {
        for patch in &data.imports {
            let import = patch.to_import();
            if self.import_map.iter().any(|i| i.same_as(&import)) {
                return Err(LinkerError::PatchDuplicateImport {
                    package: self.root_name.to_string(),
                    import: format!("{} {}", import.class_name, import.object_name),
                }
                .into());
            }
            self.import_map.push(import);
        }
        Ok(())
    }

    fn append_exports(&mut self, data: &LinkerPatchData) -> Result<()> {
        for (patch, body) in data.exports.iter().zip(&data.export_data) {
            let mut export = patch.to_export();
            if self.export_map.iter().any(|e| e.same_as(&export)) {
                return Err(LinkerError::PatchDuplicateExport {
                    package: self.root_name.to_string(),
                    export: export.object_name.to_string(),
                }
                .into());
            }
            export.export_flags |= EExportFlags::SCRIPT_PATCHER_EXPORT;
            export.serial_offset = self.patch_data.add_patch(body) as i32;
            export.serial_size = body.len() as i32;
            let outer = export.outer_index.to_export();
            let index = self.export_map.len();
            self.export_map.push(export);

            // the outer class has to wait for its new members before linking
            let Some(outer) = outer.filter(|&o| o < self.export_map.len()) else {
                continue;
            };
            if self.export_map[outer].is_patched() {
                continue;
            }
            let class = self.export_class_name(index);
            if class == NAME_FUNCTION || class.is_property_class() {
                self.export_map[outer].export_flags |= EExportFlags::MEMBER_FIELD_PATCH_PENDING;
            }
        }
        Ok(())
    }

    fn find_function_patches(&mut self, data: &LinkerPatchData) {
        for patch in &data.script_patches {
            let struct_name = FName::new(&patch.struct_name);
            let found = (0..self.export_map.len()).find(|&i| {
                self.export_map[i].object_name == struct_name && self.export_path_name(i, None, true).eq_ignore_ascii_case(&patch.data_name)
            });
            match found {
                Some(i) => {
                    self.patches.functions.insert(i, patch.data.clone());
                }
                None => warn!("{}: no export for function patch {}", self.filename, patch.data_name),
            }
        }
    }

    fn find_defaults_patches(&mut self, data: &LinkerPatchData) {
        for patch in &data.modified_class_default_objects {
            let name = FName::new(&patch.data_name);
            let found = self
                .export_map
                .iter()
                .position(|e| e.object_flags.contains(EObjectFlags::CLASS_DEFAULT_OBJECT) && e.object_name == name);
            match found {
                Some(i) => {
                    let offset = self.patch_data.add_patch(&patch.data);
                    self.patches.defaults.insert(i, (offset, patch.data.len() as u64));
                }
                None => warn!("{}: no default object for patch {}", self.filename, patch.data_name),
            }
        }
    }

    fn find_enum_patches(&mut self, data: &LinkerPatchData) {
        for patch in &data.modified_enums {
            let enum_name = FName::new(&patch.enum_name);
            let found = (0..self.export_map.len()).find(|&i| {
                self.export_map[i].object_name == enum_name && self.export_path_name(i, None, false).eq_ignore_ascii_case(&patch.enum_path)
            });
            match found {
                Some(i) => {
                    let values = patch.values.iter().map(|v| FName::new(v)).collect();
                    self.patches.enums.insert(i, values);
                }
                None => warn!("{}: no enum for patch {}", self.filename, patch.enum_path),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::LinkerId;
    use crate::linker_load::LoadFlags;
    use crate::object_store::ObjectStore;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Seek, SeekFrom};

    fn linker() -> LinkerLoad {
        let store = ObjectStore::new();
        let mut linker = LinkerLoad::new(LinkerId(0), store.core().core, FName::new("Game"), "Game.u", LoadFlags::empty(), 100);
        linker.import_map.push(FObjectImport::new(NAME_CORE, NAME_PACKAGE, FPackageIndex::NULL, NAME_CORE));
        linker
            .import_map
            .push(FObjectImport::new(NAME_CORE, NAME_CLASS, FPackageIndex::from_import(0), NAME_FUNCTION));
        linker
            .import_map
            .push(FObjectImport::new(NAME_CORE, NAME_CLASS, FPackageIndex::from_import(0), FName::new("IntProperty")));
        linker.export_map.push(FObjectExport {
            object_name: FName::new("Pawn"),
            ..Default::default()
        });
        linker.export_map.push(FObjectExport {
            object_name: FName::new("Tick"),
            class_index: FPackageIndex::from_import(1),
            outer_index: FPackageIndex::from_export(0),
            ..Default::default()
        });
        linker.export_map.push(FObjectExport {
            object_name: FName::new("Default__Pawn"),
            class_index: FPackageIndex::from_export(0),
            object_flags: EObjectFlags::CLASS_DEFAULT_OBJECT,
            ..Default::default()
        });
        linker
    }

    fn patch() -> LinkerPatchData {
        LinkerPatchData {
            package_name: "Game".into(),
            names: vec!["Health".into(), "Health".into()],
            imports: vec![PatchImport {
                class_package: "Core".into(),
                class_name: "Class".into(),
                outer_index: FPackageIndex::from_import(0),
                object_name: "FloatProperty".into(),
            }],
            exports: vec![PatchExport {
                class_index: FPackageIndex::from_import(2),
                outer_index: FPackageIndex::from_export(0),
                object_name: "Health".into(),
                object_flags: EObjectFlags::PUBLIC,
                ..Default::default()
            }],
            export_data: vec![vec![1, 2, 3, 4]],
            script_patches: vec![ScriptPatch {
                struct_name: "Tick".into(),
                data_name: "Game.Pawn.Tick".into(),
                data: vec![0x0b, 0x53],
            }],
            modified_class_default_objects: vec![DefaultsPatch {
                data_name: "Default__Pawn".into(),
                data: vec![9, 9],
            }],
            modified_enums: vec![],
            ..Default::default()
        }
    }

    #[test]
    fn test_patch_file_format() -> Result<()> {
        let data = patch();
        let bytes = data.to_bytes()?;
        assert_eq!(&bytes[..4], &PATCH_MAGIC.to_le_bytes());
        assert_eq!(LinkerPatchData::from_bytes(&bytes)?, data);

        let mut bad = bytes.clone();
        bad[0] = 0;
        assert!(LinkerPatchData::from_bytes(&bad).is_err());
        Ok(())
    }

    #[test]
    fn test_integrate_appends_and_maps() -> Result<()> {
        let mut patcher = ScriptPatcher::new();
        patcher.add(patch());
        let mut linker = linker();
        let names_before = linker.name_map.len();
        assert!(linker.integrate_script_patches(Some(&patcher))?);

        assert_eq!(linker.name_map.len(), names_before + 2);
        assert_eq!(linker.import_map.len(), 4);
        let added = &linker.export_map[3];
        assert!(added.is_patched());
        assert_eq!((added.serial_offset, added.serial_size), (0, 4));
        // IntProperty member of an unpatched class
        assert!(linker.export_map[0].export_flags.contains(EExportFlags::MEMBER_FIELD_PATCH_PENDING));

        assert_eq!(linker.patches.functions.get(&1), Some(&vec![0x0b, 0x53]));
        assert_eq!(linker.patches.defaults.get(&2), Some(&(4, 2)));

        let loader = linker.patch_loader.as_mut().unwrap();
        loader.seek(SeekFrom::Start(4))?;
        let mut buf = [0; 2];
        loader.read_exact(&mut buf)?;
        assert_eq!(buf, [9, 9]);
        Ok(())
    }

    #[test]
    fn test_duplicate_export_is_fatal() {
        let mut data = patch();
        data.exports[0].object_name = "Tick".into();
        data.exports[0].class_index = FPackageIndex::from_import(1);
        let mut patcher = ScriptPatcher::new();
        patcher.add(data);
        let err = linker().integrate_script_patches(Some(&patcher)).unwrap_err();
        assert_eq!(crate::error::error_kind(&err), crate::error::ErrorKind::Patcher);
    }

    #[test]
    fn test_duplicate_import_is_fatal() {
        let mut data = patch();
        data.imports[0].object_name = "Function".into();
        let mut patcher = ScriptPatcher::new();
        patcher.add(data);
        let err = linker().integrate_script_patches(Some(&patcher)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkerError>(),
            Some(LinkerError::PatchDuplicateImport { .. })
        ));
    }

    #[test]
    fn test_no_patch_leaves_linker_untouched() -> Result<()> {
        let patcher = ScriptPatcher::new();
        let mut linker = linker();
        assert!(linker.integrate_script_patches(Some(&patcher))?);
        assert!(!linker.patches.is_active());
        assert_eq!(linker.export_map.len(), 3);
        assert!(linker.patch_loader.is_none());
        Ok(())
    }

    #[test]
    fn test_suffixed_package_finds_base_patch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut data = patch();
        data.package_suffix = "_Patched".into();
        fs::write(dir.path().join("Game.patch"), data.to_bytes()?)?;
        fs::write(dir.path().join("readme.txt"), b"ignored")?;

        let patcher = ScriptPatcher::from_dirs(&[dir.path().to_path_buf()])?;
        assert_eq!(patcher.package_suffix(), "_Patched");
        assert!(patcher.linker_patch(FName::new("Game_Patched")).is_some());
        assert!(patcher.linker_patch(FName::new("Other")).is_none());
        Ok(())
    }
}
