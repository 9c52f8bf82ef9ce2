//! Per-package load linker: its tables, its loader and the table reading
//! steps of the creation state machine.
//!
//! The steps here only touch the linker itself. Steps that need the object
//! store, the package source or other linkers are driven from
//! [`crate::context`].

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use bitflags::bitflags;
use strum::AsRefStr;
use tracing::{instrument, trace, warn};

use crate::LinkerId;
use crate::archive::{BoxedLoader, Loader, PatchReader};
use crate::error::LinkerError;
use crate::export_hash::EXPORT_HASH_COUNT;
use crate::name_map::*;
use crate::object_store::ObjectRef;
use crate::resources::*;
use crate::ser::*;
use crate::summary::FPackageFileSummary;
use crate::version::*;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadFlags: u32 {
        const NO_WARN = 0x0000_0001;
        const QUIET = 0x0000_0002;
        const NO_VERIFY = 0x0000_0004;
        const FIND_IF_FAIL = 0x0000_0008;
        const NO_REDIRECTS = 0x0000_0010;
        const SEEK_FREE = 0x0000_0020;
        const MEMORY_READER = 0x0000_0040;
        /// The package was renamed by the script patcher suffix remap.
        const REMAPPED_PACKAGE = 0x0000_0080;
    }
}

/// Creation steps in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsRefStr)]
pub enum LinkerStep {
    CreateLoader,
    Summary,
    NameMap,
    ImportMap,
    ExportMap,
    ScriptPatches,
    FixupImportMap,
    RemapClasses,
    RemapPackageNames,
    FixupExportMap,
    RemapLocalizedPackageNames,
    DependsMap,
    GuidMaps,
    Thumbnails,
    ExportHash,
    FindExistingExports,
    Finalize,
    Done,
}
impl LinkerStep {
    pub fn next(self) -> LinkerStep {
        use LinkerStep::*;
        match self {
            CreateLoader => Summary,
            Summary => NameMap,
            NameMap => ImportMap,
            ImportMap => ExportMap,
            ExportMap => ScriptPatches,
            ScriptPatches => FixupImportMap,
            FixupImportMap => RemapClasses,
            RemapClasses => RemapPackageNames,
            RemapPackageNames => FixupExportMap,
            FixupExportMap => RemapLocalizedPackageNames,
            RemapLocalizedPackageNames => DependsMap,
            DependsMap => GuidMaps,
            GuidMaps => Thumbnails,
            Thumbnails => ExportHash,
            ExportHash => FindExistingExports,
            FindExistingExports => Finalize,
            Finalize | Done => Done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkerStatus {
    Done,
    TimedOut,
}

/// Soft time budget of one tick. The clock is only sampled every
/// `granularity` checks and an exceeded budget stays exceeded until the
/// next tick.
#[derive(Debug, Clone)]
pub(crate) struct TimeLimit {
    use_limit: bool,
    budget: Duration,
    start: Instant,
    granularity: u32,
    calls: u32,
    exceeded: bool,
}
impl TimeLimit {
    fn new(granularity: u32) -> Self {
        Self {
            use_limit: false,
            budget: Duration::ZERO,
            start: Instant::now(),
            granularity: granularity.max(1),
            calls: 0,
            exceeded: false,
        }
    }
    pub(crate) fn begin_tick(&mut self, budget: Option<Duration>) {
        self.use_limit = budget.is_some();
        self.budget = budget.unwrap_or_default();
        self.start = Instant::now();
        self.calls = 0;
        self.exceeded = false;
    }
    pub(crate) fn is_exceeded(&mut self) -> bool {
        self.calls += 1;
        if !self.exceeded && self.use_limit && self.calls % self.granularity == 0 {
            self.exceeded = self.start.elapsed() > self.budget;
        }
        self.exceeded
    }
    pub(crate) fn uses_limit(&self) -> bool {
        self.use_limit
    }
}

/// Progress of the resumable steps.
#[derive(Debug, Default, Clone)]
pub(crate) struct StepCursors {
    pub name: usize,
    pub import: usize,
    pub export: usize,
    pub depends: usize,
    pub import_guids: usize,
    pub export_guids: usize,
    pub fixup_export: usize,
    pub find_existing: usize,
    /// Loader position to continue from when a step resumes.
    pub resume_pos: Option<u64>,
}

/// Bulk payload stored in this package and owned by a live object.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDataAttachment {
    pub owner: ObjectRef,
    pub offset: u64,
    pub size: u64,
    pub data: Option<Vec<u8>>,
}

pub struct LinkerLoad {
    pub id: LinkerId,
    pub root: ObjectRef,
    pub root_name: FName,
    pub filename: String,
    pub load_flags: LoadFlags,
    pub context_flags: EObjectFlags,

    pub summary: FPackageFileSummary,
    pub name_map: Vec<FName>,
    pub import_map: Vec<FObjectImport>,
    pub export_map: Vec<FObjectExport>,
    pub depends_map: Vec<Vec<FPackageIndex>>,
    pub export_hash: [Option<usize>; EXPORT_HASH_COUNT],
    pub import_guids: Vec<FLevelGuids>,
    /// Export GUIDs not yet bound to live objects; indices are 1-based.
    pub export_guids_awaiting_lookup: Vec<FExportGuid>,
    pub thumbnails: BTreeMap<String, FObjectThumbnail>,
    /// Thumbnails were saved before rectangular thumbnails existed.
    pub thumbnails_outdated: bool,
    pub bulk_data: Vec<BulkDataAttachment>,

    pub(crate) loader: Option<BoxedLoader>,
    pub(crate) patch_loader: Option<BoxedLoader>,
    /// Patch bodies collected while the script patch is integrated.
    pub(crate) patch_data: PatchReader,
    pub(crate) reading_patch: bool,
    pub(crate) patches: crate::script_patcher::LinkerPatches,

    pub(crate) step: LinkerStep,
    pub(crate) cursors: StepCursors,
    pub(crate) time: TimeLimit,
    pub(crate) summary_loaded: bool,
    pub(crate) fixup_imports_done: bool,
    pub(crate) imports_verified: bool,
    pub(crate) finished: bool,
}

fn no_loader() -> anyhow::Error {
    anyhow::anyhow!("linker has no loader")
}

/// Bytes the summary step asks to have resident before reading.
const SUMMARY_PRECACHE_SIZE: u64 = 4096;

impl LinkerLoad {
    pub fn new(id: LinkerId, root: ObjectRef, root_name: FName, filename: impl Into<String>, load_flags: LoadFlags, granularity: u32) -> Self {
        Self {
            id,
            root,
            root_name,
            filename: filename.into(),
            load_flags,
            context_flags: EObjectFlags::LOAD_CONTEXT_FLAGS,
            summary: FPackageFileSummary::default(),
            name_map: vec![],
            import_map: vec![],
            export_map: vec![],
            depends_map: vec![],
            export_hash: [None; EXPORT_HASH_COUNT],
            import_guids: vec![],
            export_guids_awaiting_lookup: vec![],
            thumbnails: BTreeMap::new(),
            thumbnails_outdated: false,
            bulk_data: vec![],
            loader: None,
            patch_loader: None,
            patch_data: PatchReader::new(),
            reading_patch: false,
            patches: Default::default(),
            step: LinkerStep::CreateLoader,
            cursors: StepCursors::default(),
            time: TimeLimit::new(granularity),
            summary_loaded: false,
            fixup_imports_done: false,
            imports_verified: false,
            finished: false,
        }
    }

    pub fn step(&self) -> LinkerStep {
        self.step
    }
    pub fn is_finished(&self) -> bool {
        self.finished
    }
    /// Tables are complete enough for other linkers to resolve against.
    pub fn has_tables(&self) -> bool {
        self.step >= LinkerStep::FindExistingExports
    }
    pub fn imports_verified(&self) -> bool {
        self.imports_verified
    }
    pub fn is_cooked(&self) -> bool {
        self.summary.package_flags.contains(EPackageFlags::COOKED)
    }
    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    pub(crate) fn set_loader(&mut self, loader: Box<dyn Loader>) {
        self.loader = Some(Archive::new(loader));
    }

    /// The archive bodies are currently read from: the patch archive while a
    /// script patcher export is being preloaded, the package otherwise.
    pub(crate) fn active_loader(&mut self) -> Result<&mut BoxedLoader> {
        if self.reading_patch {
            self.patch_loader.as_mut().context("script patch archive missing")
        } else {
            self.loader.as_mut().ok_or_else(no_loader)
        }
    }

    fn precache(&mut self, offset: i64, size: i64) -> Result<bool> {
        let use_limit = self.time.uses_limit();
        let loader = self.loader.as_mut().ok_or_else(no_loader)?;
        let ready = loader.get_mut().precache(offset.max(0) as u64, size.max(0) as u64)?;
        Ok(ready || !use_limit)
    }

    fn resume_at(&mut self, start: i64, first: bool) -> Result<()> {
        let pos = match (first, self.cursors.resume_pos) {
            (false, Some(pos)) => pos,
            _ => start.max(0) as u64,
        };
        self.loader.as_mut().ok_or_else(no_loader)?.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn save_resume_pos(&mut self) -> Result<()> {
        self.cursors.resume_pos = Some(self.loader.as_mut().ok_or_else(no_loader)?.stream_position()?);
        Ok(())
    }

    /// Read and check the summary. `reopen` supplies a loader able to
    /// translate the compressed chunk map when the current one can't.
    #[instrument(skip_all, fields(filename = %self.filename))]
    pub(crate) fn serialize_summary(&mut self, reopen: impl FnOnce(&str) -> Result<Box<dyn Loader>>) -> Result<bool> {
        if self.summary_loaded {
            return Ok(true);
        }
        if !self.precache(0, SUMMARY_PRECACHE_SIZE as i64)? {
            return Ok(false);
        }
        let filename = self.filename.clone();
        let loader = self.loader.as_mut().ok_or_else(no_loader)?;
        loader.seek(SeekFrom::Start(0))?;
        let summary = FPackageFileSummary::read(loader, &filename)?;

        if summary.file_version < VER_MIN_PACKAGE {
            return Err(LinkerError::OldVersionFile {
                filename,
                version: summary.file_version,
                min: VER_MIN_PACKAGE,
            }
            .into());
        }
        if summary.file_version > VER_LATEST_ENGINE || summary.licensee_version > VER_LATEST_ENGINE_LICENSEE {
            return Err(LinkerError::FileVersionDump {
                filename,
                version: summary.file_version,
                licensee: summary.licensee_version,
                engine: VER_LATEST_ENGINE,
                engine_licensee: VER_LATEST_ENGINE_LICENSEE,
            }
            .into());
        }
        loader.filter_editor_only = summary.package_flags.contains(EPackageFlags::FILTER_EDITOR_ONLY);

        if summary.package_flags.contains(EPackageFlags::STORE_COMPRESSED) && !summary.compressed_chunks.is_empty() {
            let chunks = summary.compressed_chunks.clone();
            if !loader.get_mut().set_compression_map(&chunks, summary.compression_flags)? {
                trace!("{filename}: switching to a loader that understands compressed chunks");
                let mut replacement = reopen(&filename)?;
                if !replacement.set_compression_map(&chunks, summary.compression_flags)? {
                    anyhow::bail!("{filename}: no loader can read compressed chunks");
                }
                let (swap, ver, licensee) = (loader.byte_swapping(), loader.ver(), loader.licensee_ver());
                let filter = loader.filter_editor_only;
                let mut old = loader.replace_inner(replacement);
                old.close()?;
                loader.set_byte_swapping(swap);
                loader.set_ver(ver, licensee);
                loader.filter_editor_only = filter;
            }
        }
        let total_size = loader.get_mut().total_size()?;
        summary.validate(&filename, total_size)?;

        self.name_map.reserve(summary.name_count as usize);
        self.import_map.reserve(summary.import_count as usize);
        self.export_map.reserve(summary.export_count as usize);
        self.summary = summary;
        self.summary_loaded = true;
        self.cursors.resume_pos = None;
        Ok(true)
    }

    #[instrument(skip_all)]
    pub(crate) fn serialize_name_map(&mut self) -> Result<bool> {
        let count = self.summary.name_count as usize;
        if self.cursors.name == 0 && count > 0 {
            let size = (self.summary.total_header_size - self.summary.name_offset) as i64;
            if !self.precache(self.summary.name_offset as i64, size)? {
                return Ok(false);
            }
        }
        if self.cursors.name < count {
            self.resume_at(self.summary.name_offset as i64, self.cursors.name == 0)?;
            let loader = self.loader.as_mut().ok_or_else(no_loader)?;
            while self.cursors.name < count && !self.time.is_exceeded() {
                let entry: FNameEntry = loader.de()?;
                self.name_map.push(FName::with_number(&entry.name, 0));
                self.cursors.name += 1;
            }
            self.save_resume_pos()?;
        }
        Ok(self.cursors.name == count)
    }

    #[instrument(skip_all)]
    pub(crate) fn serialize_import_map(&mut self) -> Result<bool> {
        let count = self.summary.import_count as usize;
        if self.cursors.import < count {
            self.resume_at(self.summary.import_offset as i64, self.cursors.import == 0)?;
            let loader = self.loader.as_mut().ok_or_else(no_loader)?;
            while self.cursors.import < count && !self.time.is_exceeded() {
                let import: FObjectImport = loader.de_ctx(self.name_map.as_slice())?;
                self.import_map.push(import);
                self.cursors.import += 1;
            }
            self.save_resume_pos()?;
        }
        Ok(self.cursors.import == count)
    }

    #[instrument(skip_all)]
    pub(crate) fn serialize_export_map(&mut self) -> Result<bool> {
        let count = self.summary.export_count as usize;
        if self.cursors.export < count {
            self.resume_at(self.summary.export_offset as i64, self.cursors.export == 0)?;
            let loader = self.loader.as_mut().ok_or_else(no_loader)?;
            while self.cursors.export < count && !self.time.is_exceeded() {
                let export: FObjectExport = loader.de_ctx(self.name_map.as_slice())?;
                self.export_map.push(export);
                self.cursors.export += 1;
            }
            self.save_resume_pos()?;
        }
        Ok(self.cursors.export == count)
    }

    /// Dependency lists, only wanted by the editor for packages that aren't
    /// seek-free.
    #[instrument(skip_all)]
    pub(crate) fn serialize_depends_map(&mut self, wanted: bool) -> Result<bool> {
        let count = self.summary.export_count as usize;
        if !wanted || self.load_flags.contains(LoadFlags::SEEK_FREE) || self.summary.depends_offset <= 0 {
            self.cursors.depends = count;
            return Ok(true);
        }
        if self.cursors.depends < count {
            self.resume_at(self.summary.depends_offset as i64, self.cursors.depends == 0)?;
            let loader = self.loader.as_mut().ok_or_else(no_loader)?;
            while self.cursors.depends < count && !self.time.is_exceeded() {
                let depends: Vec<FPackageIndex> = loader.de()?;
                self.depends_map.push(depends);
                self.cursors.depends += 1;
            }
            self.save_resume_pos()?;
        }
        Ok(self.cursors.depends == count)
    }

    #[instrument(skip_all)]
    pub(crate) fn serialize_guid_maps(&mut self) -> Result<bool> {
        let offset = self.summary.import_export_guids_offset;
        if offset <= 0 || self.summary.file_version < VER_ADDED_CROSSLEVEL_REFERENCES {
            return Ok(true);
        }
        let import_count = self.summary.import_guids_count.max(0) as usize;
        let export_count = self.summary.export_guids_count.max(0) as usize;
        let first = self.cursors.import_guids == 0 && self.cursors.export_guids == 0;
        if self.cursors.import_guids < import_count || self.cursors.export_guids < export_count {
            self.resume_at(offset as i64, first)?;
            let loader = self.loader.as_mut().ok_or_else(no_loader)?;
            while self.cursors.import_guids < import_count && !self.time.is_exceeded() {
                let level: FLevelGuids = loader.de()?;
                self.import_guids.push(level);
                self.cursors.import_guids += 1;
            }
            while self.cursors.import_guids == import_count && self.cursors.export_guids < export_count && !self.time.is_exceeded() {
                let guid: FExportGuid = loader.de()?;
                self.export_guids_awaiting_lookup.push(guid);
                self.cursors.export_guids += 1;
            }
            self.save_resume_pos()?;
        }
        Ok(self.cursors.import_guids == import_count && self.cursors.export_guids == export_count)
    }

    /// Read the thumbnail table. A table that doesn't parse is skipped with
    /// a warning.
    #[instrument(skip_all)]
    pub(crate) fn serialize_thumbnails(&mut self, wanted: bool) -> Result<bool> {
        if !wanted || self.summary.thumbnail_table_offset <= 0 || self.summary.file_version < VER_ASSET_THUMBNAILS_IN_PACKAGES {
            return Ok(true);
        }
        let offset = self.summary.thumbnail_table_offset as u64;
        let ver = self.summary.file_version;
        let loader = self.loader.as_mut().ok_or_else(no_loader)?;
        let saved = loader.stream_position()?;
        match read_thumbnails(loader, offset, ver) {
            Ok(thumbnails) => {
                self.thumbnails = thumbnails;
                self.thumbnails_outdated = ver < VER_RECTANGULAR_THUMBNAILS;
            }
            Err(err) => warn!("{}: skipping bad thumbnail table: {err:#}", self.filename),
        }
        loader.seek(SeekFrom::Start(saved))?;
        Ok(true)
    }

    pub fn export_class_name(&self, index: usize) -> FName {
        self.index_name(self.export_map[index].class_index).unwrap_or(NAME_CLASS)
    }

    pub fn export_class_package(&self, index: usize) -> FName {
        let class_index = self.export_map[index].class_index;
        if let Some(i) = class_index.to_import() {
            let Some(import) = self.import_map.get(i) else {
                return NAME_NONE;
            };
            match import.outer_index.to_import() {
                Some(outer) => self.import_map.get(outer).map(|o| o.object_name).unwrap_or(NAME_NONE),
                None => NAME_NONE,
            }
        } else if class_index.is_export() {
            self.root_name
        } else {
            NAME_CORE
        }
    }

    /// Object name of the import or export at `index`, `None` for the root.
    pub fn index_name(&self, index: FPackageIndex) -> Option<FName> {
        if let Some(i) = index.to_import() {
            self.import_map.get(i).map(|i| i.object_name)
        } else if let Some(i) = index.to_export() {
            self.export_map.get(i).map(|e| e.object_name)
        } else {
            None
        }
    }

    pub fn index_to_name(&self, index: FPackageIndex) -> FName {
        self.index_name(index).unwrap_or(NAME_NONE)
    }

    pub fn check_index(&self, index: FPackageIndex) -> Result<()> {
        let valid = match (index.to_import(), index.to_export()) {
            (Some(i), _) => i < self.import_map.len(),
            (_, Some(i)) => i < self.export_map.len(),
            _ => true,
        };
        if !valid {
            return Err(LinkerError::BadPackageIndex {
                filename: self.filename.clone(),
                index: index.0,
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn bad_serial_range(&self, index: usize) -> LinkerError {
        let export = &self.export_map[index];
        LinkerError::BadSerialRange {
            filename: self.filename.clone(),
            export: self.export_full_name(index),
            offset: export.serial_offset,
            size: export.serial_size,
        }
    }

    /// Reject export bodies that lie outside the file, then check the
    /// object graph.
    pub(crate) fn validate_tables(&mut self) -> Result<()> {
        let total_size = self.loader.as_mut().ok_or_else(no_loader)?.get_mut().total_size()? as i64;
        for (i, export) in self.export_map.iter().enumerate() {
            let (offset, size) = (export.serial_offset as i64, export.serial_size as i64);
            if size < 0 || (size > 0 && (offset < 0 || offset + size > total_size)) {
                return Err(self.bad_serial_range(i).into());
            }
        }
        self.check_object_graph()
    }

    /// Every index in range, and no export or import reachable from itself
    /// through the references resolved before it is constructed: outers,
    /// classes and archetypes of exports, outers of imports.
    pub(crate) fn check_object_graph(&self) -> Result<()> {
        let exports = self.export_map.len();
        let node = |index: FPackageIndex| match (index.to_export(), index.to_import()) {
            (Some(i), _) => Some(i),
            (_, Some(i)) => Some(exports + i),
            _ => None,
        };
        let mut graph: Vec<Vec<usize>> = Vec::with_capacity(exports + self.import_map.len());
        for (i, export) in self.export_map.iter().enumerate() {
            for index in [export.class_index, export.super_index, export.outer_index, export.archetype_index] {
                self.check_index(index)?;
            }
            let mut edges: Vec<usize> = [export.outer_index, export.class_index].into_iter().filter_map(node).collect();
            // an export that is its own archetype is reported when it is created
            if export.archetype_index != FPackageIndex::from_export(i) {
                edges.extend(node(export.archetype_index));
            }
            graph.push(edges);
        }
        for import in &self.import_map {
            self.check_index(import.outer_index)?;
            graph.push(import.outer_index.to_import().map(|i| exports + i).into_iter().collect());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Visit {
            New,
            Active,
            Done,
        }
        let mut visit = vec![Visit::New; graph.len()];
        for start in 0..graph.len() {
            if visit[start] != Visit::New {
                continue;
            }
            visit[start] = Visit::Active;
            let mut stack = vec![(start, 0)];
            while let Some(&(n, edge)) = stack.last() {
                let Some(&next) = graph[n].get(edge) else {
                    visit[n] = Visit::Done;
                    stack.pop();
                    continue;
                };
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match visit[next] {
                    Visit::New => {
                        visit[next] = Visit::Active;
                        stack.push((next, 0));
                    }
                    Visit::Active => {
                        let object = match next.checked_sub(exports) {
                            Some(i) => self.import_full_name(i),
                            None => self.export_full_name(next),
                        };
                        return Err(LinkerError::CircularReference {
                            filename: self.filename.clone(),
                            object,
                        }
                        .into());
                    }
                    Visit::Done => {}
                }
            }
        }
        Ok(())
    }

    fn is_package_export(&self, index: usize) -> bool {
        self.export_class_name(index) == NAME_PACKAGE
    }

    /// Path of an export, e.g. `Pkg.Group.Obj:Sub`. Forced exports resolve to
    /// their own top-level package when `resolve_forced` is set and no
    /// `fake_root` replaces the linker root.
    pub fn export_path_name(&self, index: usize, fake_root: Option<&str>, resolve_forced: bool) -> String {
        let mut result = String::new();
        let mut forced = false;
        let mut current = Some(index);
        let mut steps = 0;
        while let Some(i) = current {
            let Some(export) = self.export_map.get(i) else {
                break;
            };
            if !result.is_empty() {
                let outer_is_package = match export.outer_index.to_export() {
                    Some(outer) => self.is_package_export(outer),
                    None => export.outer_index.is_null(),
                };
                let delimiter = if outer_is_package && !self.is_package_export(i) { ":" } else { "." };
                result.insert_str(0, delimiter);
            }
            result.insert_str(0, &export.object_name.to_string());
            forced |= export.is_forced();
            current = export.outer_index.to_export();
            steps += 1;
            if steps > self.export_map.len() {
                break;
            }
        }
        if forced && fake_root.is_none() && resolve_forced {
            return result;
        }
        format!("{}.{result}", fake_root.map(str::to_string).unwrap_or_else(|| self.root_name.to_string()))
    }

    pub fn export_full_name(&self, index: usize) -> String {
        format!("{} {}", self.export_class_name(index), self.export_path_name(index, None, false))
    }

    pub fn import_path_name(&self, index: usize) -> String {
        let mut result = String::new();
        let mut current = Some(index);
        let mut steps = 0;
        while let Some(i) = current {
            let Some(import) = self.import_map.get(i) else {
                break;
            };
            if !result.is_empty() {
                let outer_is_package = match import.outer_index.to_import() {
                    Some(outer) => self.import_map.get(outer).is_some_and(|o| o.class_name == NAME_PACKAGE),
                    None => false,
                };
                let delimiter = if outer_is_package && import.class_name != NAME_PACKAGE { ":" } else { "." };
                result.insert_str(0, delimiter);
            }
            result.insert_str(0, &import.object_name.to_string());
            current = import.outer_index.to_import();
            steps += 1;
            if steps > self.import_map.len() {
                break;
            }
        }
        result
    }

    pub fn import_full_name(&self, index: usize) -> String {
        let class = self.import_map.get(index).map(|i| i.class_name).unwrap_or(NAME_NONE);
        format!("{class} {}", self.import_path_name(index))
    }

    /// Top-level package import of `index`'s outer chain.
    pub fn import_top_level(&self, index: usize) -> usize {
        let mut current = index;
        for _ in 0..=self.import_map.len() {
            match self.import_map[current].outer_index.to_import() {
                Some(outer) => current = outer,
                None => break,
            }
        }
        current
    }

    /// Register a bulk payload at `[offset, offset + size)` owned by `owner`.
    pub fn attach_bulk_data(&mut self, owner: ObjectRef, offset: u64, size: u64) {
        self.bulk_data.push(BulkDataAttachment {
            owner,
            offset,
            size,
            data: None,
        });
    }

    /// Sever the payloads owned by `owner`, reading them first when
    /// `ensure_loaded` is set.
    pub fn detach_bulk_data(&mut self, owner: ObjectRef, ensure_loaded: bool) -> Result<Vec<BulkDataAttachment>> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.bulk_data).into_iter().partition(|b| b.owner == owner);
        self.bulk_data = rest;
        self.finish_bulk_detach(mine, ensure_loaded)
    }

    pub fn detach_all_bulk_data(&mut self, ensure_loaded: bool) -> Result<Vec<BulkDataAttachment>> {
        let all = std::mem::take(&mut self.bulk_data);
        self.finish_bulk_detach(all, ensure_loaded)
    }

    fn finish_bulk_detach(&mut self, mut attachments: Vec<BulkDataAttachment>, ensure_loaded: bool) -> Result<Vec<BulkDataAttachment>> {
        if ensure_loaded {
            let loader = self.loader.as_mut().ok_or_else(no_loader)?;
            let saved = loader.stream_position()?;
            for attachment in attachments.iter_mut().filter(|a| a.data.is_none()) {
                loader.seek(SeekFrom::Start(attachment.offset))?;
                let mut buf = vec![0; attachment.size as usize];
                loader.read_exact(&mut buf)?;
                attachment.data = Some(buf);
            }
            loader.seek(SeekFrom::Start(saved))?;
        }
        Ok(attachments)
    }

    /// Close the loaders, running any deferred integrity check.
    pub(crate) fn close_loaders(&mut self) -> Result<()> {
        self.patch_loader = None;
        if let Some(mut loader) = self.loader.take() {
            loader.get_mut().close()?;
        }
        Ok(())
    }

    /// Drop every table.
    pub(crate) fn clear_tables(&mut self) {
        self.name_map.clear();
        self.import_map.clear();
        self.export_map.clear();
        self.depends_map.clear();
        self.import_guids.clear();
        self.export_guids_awaiting_lookup.clear();
        self.thumbnails.clear();
        self.export_hash = [None; EXPORT_HASH_COUNT];
    }
}

fn read_thumbnails<S: ArchiveRead + Seek>(s: &mut S, offset: u64, ver: i32) -> Result<BTreeMap<String, FObjectThumbnail>> {
    s.seek(SeekFrom::Start(offset))?;
    let count = read_count(s)?;
    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let class_name = if ver >= VER_CONTENT_BROWSER_FULL_NAMES {
            s.de::<String>()?
        } else {
            "???".to_string()
        };
        entries.push(FThumbnailEntry {
            class_name,
            object_path_without_package: s.de()?,
            file_offset: s.de()?,
        });
    }
    let mut thumbnails = BTreeMap::new();
    for entry in entries {
        if entry.file_offset <= 0 {
            continue;
        }
        s.seek(SeekFrom::Start(entry.file_offset as u64))?;
        let thumbnail = if ver < VER_RECTANGULAR_THUMBNAILS {
            let size: i32 = s.de()?;
            FObjectThumbnail {
                image_width: size,
                image_height: size,
                compressed_image_data: s.de()?,
            }
        } else {
            s.de()?
        };
        thumbnails.insert(format!("{} {}", entry.class_name, entry.object_path_without_package), thumbnail);
    }
    Ok(thumbnails)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::MemoryLoader;
    use crate::object_store::ObjectStore;
    use pretty_assertions::assert_eq;

    fn linker_with(exports: Vec<(&str, i32, i32)>, imports: Vec<(&str, &str, &str, i32)>) -> LinkerLoad {
        let store = ObjectStore::new();
        let root = store.core().core;
        let mut linker = LinkerLoad::new(LinkerId(0), root, FName::new("Pkg"), "Pkg.upk", LoadFlags::empty(), 100);
        for (class_package, class_name, name, outer) in imports {
            linker
                .import_map
                .push(FObjectImport::new(FName::new(class_package), FName::new(class_name), FPackageIndex(outer), FName::new(name)));
        }
        for (name, class, outer) in exports {
            linker.export_map.push(FObjectExport {
                object_name: FName::new(name),
                class_index: FPackageIndex(class),
                outer_index: FPackageIndex(outer),
                ..Default::default()
            });
        }
        linker
    }

    #[test]
    fn test_export_path_names() {
        // 0: Group (Package), 1: Mesh in Group, 2: Component of Mesh, 3: Actor at root, 4: Comp of Actor
        let linker = linker_with(
            vec![("Group", -2, 0), ("Mesh", -3, 1), ("Component", -3, 2), ("Actor", -3, 0), ("Comp", -3, 4)],
            vec![("Core", "Package", "Core", 0), ("Core", "Class", "Package", -1), ("Core", "Class", "Widget", -1)],
        );
        assert_eq!(linker.export_path_name(1, None, false), "Pkg.Group.Mesh");
        assert_eq!(linker.export_path_name(2, None, false), "Pkg.Group.Mesh:Component");
        assert_eq!(linker.export_path_name(4, None, false), "Pkg.Actor:Comp");
        assert_eq!(linker.export_path_name(3, Some("Fake"), false), "Fake.Actor");
        assert_eq!(linker.export_full_name(0), "Package Pkg.Group");
        assert_eq!(linker.export_class_package(1), NAME_CORE);
    }

    #[test]
    fn test_forced_export_path_resolves_to_own_package() {
        let mut linker = linker_with(
            vec![("ModPkg", -2, 0), ("ModClass", 0, 1)],
            vec![("Core", "Package", "Core", 0), ("Core", "Class", "Package", -1)],
        );
        linker.export_map[0].export_flags = EExportFlags::FORCED_EXPORT;
        assert_eq!(linker.export_path_name(1, None, true), "ModPkg.ModClass");
        assert_eq!(linker.export_path_name(1, None, false), "Pkg.ModPkg.ModClass");
    }

    #[test]
    fn test_import_path_names() {
        let linker = linker_with(
            vec![],
            vec![("Core", "Package", "Engine", 0), ("Core", "Class", "Actor", -1), ("Engine", "Actor", "Default__Actor", -1), ("Engine", "Component", "Sub", -3)],
        );
        assert_eq!(linker.import_path_name(1), "Engine.Actor");
        assert_eq!(linker.import_path_name(3), "Engine.Default__Actor:Sub");
        assert_eq!(linker.import_full_name(3), "Component Engine.Default__Actor:Sub");
        assert_eq!(linker.import_top_level(3), 0);
    }

    #[test]
    fn test_time_limit_is_sticky_and_sampled() {
        let mut time = TimeLimit::new(3);
        time.begin_tick(Some(Duration::ZERO));
        assert!(!time.is_exceeded());
        assert!(!time.is_exceeded());
        std::thread::sleep(Duration::from_millis(1));
        assert!(time.is_exceeded());
        assert!(time.is_exceeded());
        time.begin_tick(None);
        for _ in 0..10 {
            assert!(!time.is_exceeded());
        }
    }

    #[test]
    fn test_bulk_data_detach_reads_payload() -> Result<()> {
        let store = ObjectStore::new();
        let owner = store.core().object;
        let mut linker = linker_with(vec![], vec![]);
        linker.set_loader(Box::new(MemoryLoader::new("Pkg.upk", (0..32u8).collect())));
        linker.attach_bulk_data(owner, 4, 3);
        linker.attach_bulk_data(store.core().class, 0, 1);
        let detached = linker.detach_bulk_data(owner, true)?;
        assert_eq!(detached[0].data.as_deref(), Some(&[4u8, 5, 6][..]));
        assert_eq!(linker.bulk_data.len(), 1);
        assert!(linker.detach_all_bulk_data(false)?[0].data.is_none());
        Ok(())
    }
}
