//! Writing a package from live objects.
//!
//! Saving runs in two passes over the object bodies. The first only collects
//! the names and objects each body refers to, which fixes the name, import
//! and export tables. The second encodes the bodies against those tables.
//! The summary and export map are written with placeholder offsets and
//! rewritten in place once the bodies have been laid out.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Seek, SeekFrom, Write};

use anyhow::{Context as _, Result};
use indexmap::IndexSet;
use tracing::{debug, instrument, warn};

use crate::compression::{ECompressionFlags, FCompressedChunk, write_compressed};
use crate::context::LoadContext;
use crate::cross_level::{CrossLevelRegistry, encode_token};
use crate::name_map::*;
use crate::object_body::{BodyArchiveWrite, write_body};
use crate::object_store::{ObjectData, ObjectRef, ObjectStore};
use crate::resources::{EExportFlags, EObjectFlags, EPackageFlags, FExportGuid, FLevelGuids, FObjectExport, FObjectImport, FPackageIndex};
use crate::ser::*;
use crate::summary::{FGenerationInfo, FPackageFileSummary};
use crate::version::*;
use crate::{FGuid, package_source_crc};

/// Uncompressed bytes per entry of a compressed package's chunk map.
const PACKAGE_CHUNK_SIZE: usize = 1024 * 1024;

/// Package flags that only describe the in-memory package.
const TRANSIENT_PACKAGE_FLAGS: EPackageFlags = EPackageFlags::TRASH
    .union(EPackageFlags::NO_EXPORT_ALLOWED)
    .union(EPackageFlags::SAVED_WITH_NEWER_VERSION)
    .union(EPackageFlags::STORE_COMPRESSED);

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Write every multi-byte value in the opposite byte order.
    pub force_byte_swapping: bool,
    /// Store everything after the summary as zlib chunks.
    pub compress: bool,
    /// Top-level packages copied into this one as forced exports.
    pub forced_packages: Vec<ObjectRef>,
}

/// Name table of the package being saved, keyed by base name.
#[derive(Default)]
struct NameTable {
    names: IndexSet<FName>,
}
impl NameTable {
    fn add(&mut self, name: FName) {
        self.names.insert(name.base());
    }
}
impl NameIndexer for NameTable {
    fn name_index(&self, name: FName) -> Result<i32> {
        self.names
            .get_index_of(&name.base())
            .map(|i| i as i32)
            .with_context(|| format!("name {name} missing from the name table"))
    }
}

/// Records the names and objects a body refers to without keeping bytes.
struct ReferenceCollector<'a> {
    names: &'a mut NameTable,
    objects: Vec<ObjectRef>,
    cross_level: Vec<ObjectRef>,
    sink: Archive<std::io::Sink>,
}
impl Write for ReferenceCollector<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sink.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
impl ArchiveState for ReferenceCollector<'_> {
    fn byte_swapping(&self) -> bool {
        self.sink.byte_swapping()
    }
    fn set_byte_swapping(&mut self, swap: bool) {
        self.sink.set_byte_swapping(swap)
    }
    fn ver(&self) -> i32 {
        self.sink.ver()
    }
    fn licensee_ver(&self) -> i32 {
        self.sink.licensee_ver()
    }
    fn set_ver(&mut self, ver: i32, licensee_ver: i32) {
        self.sink.set_ver(ver, licensee_ver)
    }
}
impl BodyArchiveWrite for ReferenceCollector<'_> {
    fn write_object(&mut self, object: Option<ObjectRef>) -> Result<()> {
        self.objects.extend(object);
        self.ser(&0i32)
    }
    fn write_cross_level_object(&mut self, object: Option<ObjectRef>) -> Result<()> {
        self.cross_level.extend(object);
        self.ser(&0i32)
    }
    fn write_name(&mut self, name: FName) -> Result<()> {
        self.names.add(name);
        self.ser(&0i64)
    }
}

/// Encodes a body against the final tables.
struct BodyWriter<'a> {
    tables: &'a SaveTables,
    ar: Archive<Cursor<Vec<u8>>>,
}
impl Write for BodyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.ar.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
impl ArchiveState for BodyWriter<'_> {
    fn byte_swapping(&self) -> bool {
        self.ar.byte_swapping()
    }
    fn set_byte_swapping(&mut self, swap: bool) {
        self.ar.set_byte_swapping(swap)
    }
    fn ver(&self) -> i32 {
        self.ar.ver()
    }
    fn licensee_ver(&self) -> i32 {
        self.ar.licensee_ver()
    }
    fn set_ver(&mut self, ver: i32, licensee_ver: i32) {
        self.ar.set_ver(ver, licensee_ver)
    }
}
impl BodyArchiveWrite for BodyWriter<'_> {
    fn write_object(&mut self, object: Option<ObjectRef>) -> Result<()> {
        let index = self.tables.index_of(object);
        self.ar.ser(&index)
    }
    fn write_cross_level_object(&mut self, object: Option<ObjectRef>) -> Result<()> {
        match object.and_then(|o| self.tables.tokens.get(&o)) {
            Some(token) => self.ar.ser(token),
            None => self.write_object(object),
        }
    }
    fn write_name(&mut self, name: FName) -> Result<()> {
        self.ar.ser_ctx(&name, &self.tables.names as &dyn NameIndexer)
    }
}

/// Tables of the package being saved.
#[derive(Default)]
struct SaveTables {
    names: NameTable,
    exports: Vec<ObjectRef>,
    indices: HashMap<ObjectRef, FPackageIndex>,
    imports: Vec<FObjectImport>,
    import_guids: Vec<FLevelGuids>,
    tokens: HashMap<ObjectRef, i32>,
}
impl SaveTables {
    fn index_of(&self, object: Option<ObjectRef>) -> FPackageIndex {
        object.and_then(|o| self.indices.get(&o).copied()).unwrap_or(FPackageIndex::NULL)
    }
}

struct Saver<'a> {
    store: &'a ObjectStore,
    registry: &'a CrossLevelRegistry,
    root: ObjectRef,
    forced: HashSet<ObjectRef>,
    tables: SaveTables,
}

impl<'a> Saver<'a> {
    /// Every saveable object in `root` and the forced packages, outers
    /// before the objects inside them.
    fn collect_exports(&mut self, forced_packages: &[ObjectRef]) {
        let mut children: HashMap<ObjectRef, Vec<ObjectRef>> = HashMap::new();
        for (object, data) in self.store.iter() {
            if data.flags.intersects(EObjectFlags::TRANSIENT | EObjectFlags::PENDING_KILL) {
                continue;
            }
            if let Some(outer) = data.outer {
                children.entry(outer).or_default().push(object);
            }
        }
        fn visit(children: &HashMap<ObjectRef, Vec<ObjectRef>>, object: ObjectRef, out: &mut Vec<ObjectRef>) {
            out.push(object);
            for &child in children.get(&object).into_iter().flatten() {
                visit(children, child, out);
            }
        }
        let mut exports = vec![];
        for &child in children.get(&self.root).into_iter().flatten() {
            visit(&children, child, &mut exports);
        }
        for &package in forced_packages {
            if package != self.root && self.store.is_alive(package) && self.forced.insert(package) {
                visit(&children, package, &mut exports);
            }
        }
        for (i, &object) in exports.iter().enumerate() {
            self.tables.indices.insert(object, FPackageIndex::from_export(i));
        }
        self.tables.exports = exports;
    }

    /// The archetype an object gets when none is saved for it.
    fn default_archetype(&self, object: ObjectRef) -> Option<ObjectRef> {
        let class = self.store.class_of(object)?;
        let class_default = |class: ObjectRef| self.store.get(class).ok()?.class_data()?.default_object;
        if self.store.flags(object).contains(EObjectFlags::CLASS_DEFAULT_OBJECT) {
            self.store.super_struct(class).and_then(class_default)
        } else {
            class_default(class)
        }
    }

    /// Objects export `object`'s table entry refers to.
    fn header_references(&self, object: ObjectRef) -> Vec<ObjectRef> {
        let core_class = self.store.core().class;
        let mut refs = vec![];
        refs.extend(self.store.class_of(object).filter(|&c| c != core_class));
        refs.extend(self.store.super_struct(object));
        refs.extend(self.store.outer_of(object).filter(|&o| o != self.root));
        if let Ok(obj) = self.store.get(object) {
            refs.extend(obj.archetype.filter(|&a| Some(a) != self.default_archetype(object)));
        }
        refs
    }

    /// Build the name, import and cross-level tables. Returns the objects
    /// each export depends on.
    fn collect_references(&mut self) -> Result<Vec<Vec<ObjectRef>>> {
        let root_name = self.store.name(self.root);
        self.tables.names.add(root_name);
        self.tables.names.add(NAME_NONE);
        if let Some(package) = self.store.get(self.root)?.package() {
            self.tables.import_guids = package.import_guids.clone();
        }

        let mut depends = Vec::with_capacity(self.tables.exports.len());
        for object in self.tables.exports.clone() {
            self.tables.names.add(self.store.name(object));
            let mut collector = ReferenceCollector {
                names: &mut self.tables.names,
                objects: vec![],
                cross_level: vec![],
                sink: Archive::new(std::io::sink()),
            };
            write_body(&mut collector, &self.store.get(object)?.data)?;
            let (mut refs, cross_level) = (collector.objects, collector.cross_level);
            for target in cross_level {
                if !self.add_cross_level_token(target) {
                    refs.push(target);
                }
            }
            refs.extend(self.header_references(object));
            depends.push(refs);
        }

        for refs in &depends {
            for &object in refs {
                self.import_index(object);
            }
        }
        for import in &self.tables.imports {
            self.tables.names.add(import.class_package);
            self.tables.names.add(import.class_name);
            self.tables.names.add(import.object_name);
        }
        Ok(depends)
    }

    /// Assign a cross-level token to `target`. `false` when it has to be
    /// saved as an ordinary reference.
    fn add_cross_level_token(&mut self, target: ObjectRef) -> bool {
        if self.tables.tokens.contains_key(&target) {
            return true;
        }
        if self.tables.indices.get(&target).is_some_and(|i| i.is_export()) || self.store.outermost(target) == self.root {
            return false;
        }
        let Some(guid) = self.registry.guid_of(target) else {
            return false;
        };
        let level_name = self.store.name(self.store.outermost(target));
        let levels = &mut self.tables.import_guids;
        let level = match levels.iter().position(|l| l.level_name == level_name) {
            Some(level) => level,
            None => {
                levels.push(FLevelGuids {
                    level_name,
                    guids: vec![],
                });
                levels.len() - 1
            }
        };
        let guids = &mut levels[level].guids;
        let index = match guids.iter().position(|g| *g == guid) {
            Some(index) => index,
            None => {
                guids.push(guid);
                guids.len() - 1
            }
        };
        match encode_token(level, index) {
            Some(token) => {
                self.tables.tokens.insert(target, token);
                true
            }
            None => {
                warn!("too many cross-level references to fit {}", self.store.path_name(target));
                false
            }
        }
    }

    /// Index of `object`, adding it and its outers to the import table
    /// when it lives in another package.
    fn import_index(&mut self, object: ObjectRef) -> FPackageIndex {
        if let Some(&index) = self.tables.indices.get(&object) {
            return index;
        }
        if object == self.root || !self.store.is_alive(object) {
            return FPackageIndex::NULL;
        }
        let outer_index = match self.store.outer_of(object) {
            Some(outer) => self.import_index(outer),
            None => FPackageIndex::NULL,
        };
        let (class_name, class_package) = match self.store.class_of(object) {
            Some(class) => (self.store.name(class), self.store.name(self.store.outermost(class))),
            None => (NAME_CLASS, NAME_CORE),
        };
        let index = FPackageIndex::from_import(self.tables.imports.len());
        self.tables
            .imports
            .push(FObjectImport::new(class_package, class_name, outer_index, self.store.name(object)));
        self.tables.indices.insert(object, index);
        index
    }

    fn export_entry(&self, object: ObjectRef) -> Result<FObjectExport> {
        let core_class = self.store.core().class;
        let obj = self.store.get(object)?;
        let index_of = |o: Option<ObjectRef>| self.tables.index_of(o);
        let archetype = obj.archetype.filter(|&a| Some(a) != self.default_archetype(object));
        let mut export = FObjectExport {
            class_index: index_of(Some(obj.class).filter(|&c| c != core_class)),
            super_index: index_of(self.store.super_struct(object)),
            outer_index: index_of(obj.outer.filter(|&o| o != self.root)),
            object_name: obj.name,
            archetype_index: index_of(archetype),
            object_flags: saved_object_flags(obj.flags),
            ..Default::default()
        };
        if self.forced.contains(&object) {
            export.export_flags |= EExportFlags::FORCED_EXPORT;
        }
        if let ObjectData::Package(package) = &obj.data {
            export.package_guid = package.guid;
            export.package_flags = package.package_flags - TRANSIENT_PACKAGE_FLAGS;
        }
        Ok(export)
    }

    fn export_guids(&self) -> Result<Vec<FExportGuid>> {
        let mut guids: Vec<FExportGuid> = vec![];
        let mut add = |guid: FGuid, object: ObjectRef| {
            if let Some(i) = self.tables.indices.get(&object).and_then(|i| i.to_export()) {
                if !guids.iter().any(|g| g.guid == guid) {
                    guids.push(FExportGuid {
                        guid,
                        export_index: i as i32 + 1,
                    });
                }
            }
        };
        for &object in &self.tables.exports {
            if let Some(guid) = self.registry.guid_of(object) {
                add(guid, object);
            }
        }
        if let Some(package) = self.store.get(self.root)?.package() {
            for (&guid, &object) in &package.export_guids {
                add(guid, object);
            }
        }
        guids.sort_by_key(|g| g.export_index);
        Ok(guids)
    }

    fn encode_body(&self, object: ObjectRef, swap: bool) -> Result<Vec<u8>> {
        let mut writer = BodyWriter {
            tables: &self.tables,
            ar: Archive::new(Cursor::new(vec![])),
        };
        writer.set_byte_swapping(swap);
        writer.set_ver(VER_LATEST_ENGINE, VER_LATEST_ENGINE_LICENSEE);
        write_body(&mut writer, &self.store.get(object)?.data)
            .with_context(|| format!("failed to serialize {}", self.store.full_name(object)))?;
        Ok(writer.ar.into_inner().into_inner())
    }
}

/// Object flags as stored in an export, with the load-for flags derived
/// from the not-for flags.
fn saved_object_flags(flags: EObjectFlags) -> EObjectFlags {
    let mut saved = flags & EObjectFlags::LOAD;
    for (not_for, load_for) in [
        (EObjectFlags::NOT_FOR_CLIENT, EObjectFlags::LOAD_FOR_CLIENT),
        (EObjectFlags::NOT_FOR_SERVER, EObjectFlags::LOAD_FOR_SERVER),
        (EObjectFlags::NOT_FOR_EDIT, EObjectFlags::LOAD_FOR_EDIT),
    ] {
        saved.set(load_for, !flags.contains(not_for));
    }
    saved
}

/// Serialize the package `root` and everything in it. `filename` is only
/// used to stamp the summary's package source.
#[instrument(skip(ctx, options))]
pub fn save_package(ctx: &mut LoadContext, root: ObjectRef, filename: &str, options: SaveOptions) -> Result<Vec<u8>> {
    // bodies still on disk have to be read before they can be written out
    for package in std::iter::once(root).chain(options.forced_packages.iter().copied()) {
        if let Some(id) = ctx.linker_for(package) {
            ctx.load_scope(|ctx| ctx.load_all_objects(id, true))?;
        }
    }

    let mut saver = Saver {
        store: &ctx.store,
        registry: &ctx.cross_level,
        root,
        forced: HashSet::new(),
        tables: SaveTables::default(),
    };
    saver.collect_exports(&options.forced_packages);
    let depends = saver.collect_references()?;
    let swap = options.force_byte_swapping;

    let mut export_map = vec![];
    let mut bodies = vec![];
    for &object in &saver.tables.exports {
        let body = saver.encode_body(object, swap)?;
        let mut export = saver.export_entry(object)?;
        export.serial_size = body.len() as i32;
        export_map.push(export);
        bodies.push(body);
    }
    let depends_map: Vec<Vec<FPackageIndex>> = depends
        .iter()
        .enumerate()
        .map(|(i, refs)| {
            let own = FPackageIndex::from_export(i);
            let mut indices: Vec<FPackageIndex> = vec![];
            for index in refs.iter().map(|&r| saver.tables.index_of(Some(r))) {
                if !index.is_null() && index != own && !indices.contains(&index) {
                    indices.push(index);
                }
            }
            indices
        })
        .collect();
    let export_guids = saver.export_guids()?;

    let package = ctx.store.get(root)?.package().context("save root is not a package")?;
    let tables = &saver.tables;
    let cooked = package.package_flags.contains(EPackageFlags::COOKED);
    let mut summary = FPackageFileSummary {
        folder_name: package.folder_name.clone(),
        package_flags: package.package_flags - TRANSIENT_PACKAGE_FLAGS,
        name_count: tables.names.names.len() as i32,
        import_count: tables.imports.len() as i32,
        export_count: export_map.len() as i32,
        guid: package.guid,
        generations: vec![FGenerationInfo {
            export_count: export_map.len() as i32,
            name_count: tables.names.names.len() as i32,
            net_object_count: export_map.len() as i32,
        }],
        cooked_content_version: if cooked { VER_LATEST_COOKED_PACKAGE } else { 0 },
        package_source: package_source_crc(filename),
        ..Default::default()
    };

    let mut ar = Archive::new(Cursor::new(vec![]));
    ar.set_byte_swapping(swap);
    ar.set_ver(VER_LATEST_ENGINE, VER_LATEST_ENGINE_LICENSEE);
    ar.ser(&summary)?;
    let summary_end = ar.stream_position()?;

    summary.name_offset = ar.stream_position()? as i32;
    for &name in &tables.names.names {
        ar.ser(&FNameEntry {
            name: name.plain().to_string(),
            flags: EObjectFlags::LOAD_CONTEXT_FLAGS.bits(),
        })?;
    }
    summary.import_offset = ar.stream_position()? as i32;
    for import in &tables.imports {
        ar.ser_ctx(import, &tables.names as &dyn NameIndexer)?;
    }
    summary.export_offset = ar.stream_position()? as i32;
    for export in &export_map {
        ar.ser_ctx(export, &tables.names as &dyn NameIndexer)?;
    }
    summary.depends_offset = ar.stream_position()? as i32;
    for depends in &depends_map {
        ar.ser(depends)?;
    }
    summary.import_export_guids_offset = ar.stream_position()? as i32;
    summary.import_guids_count = tables.import_guids.len() as i32;
    summary.export_guids_count = export_guids.len() as i32;
    for level in &tables.import_guids {
        ar.ser(level)?;
    }
    for guid in &export_guids {
        ar.ser(guid)?;
    }
    if !package.thumbnails.is_empty() {
        let mut entries = vec![];
        for (key, thumbnail) in &package.thumbnails {
            entries.push((key, ar.stream_position()? as i32));
            ar.ser(thumbnail)?;
        }
        summary.thumbnail_table_offset = ar.stream_position()? as i32;
        ar.ser(&(entries.len() as i32))?;
        for (key, offset) in entries {
            let (class_name, path) = key.split_once(' ').unwrap_or(("???", key.as_str()));
            ar.ser(&class_name.to_string())?;
            ar.ser(&path.to_string())?;
            ar.ser(&offset)?;
        }
    }
    summary.total_header_size = ar.stream_position()? as i32;

    for (export, body) in export_map.iter_mut().zip(&bodies) {
        if !body.is_empty() {
            export.serial_offset = ar.stream_position()? as i32;
            ar.write_all(body)?;
        }
    }
    ar.seek(SeekFrom::Start(summary.export_offset as u64))?;
    for export in &export_map {
        ar.ser_ctx(export, &tables.names as &dyn NameIndexer)?;
    }
    ar.seek(SeekFrom::Start(0))?;
    ar.ser(&summary)?;
    let data = ar.into_inner().into_inner();
    debug!(
        "saved {} names, {} imports, {} exports ({} bytes)",
        tables.names.names.len(),
        tables.imports.len(),
        export_map.len(),
        data.len()
    );

    if options.compress {
        return compress_package(&data, summary, summary_end as usize, swap);
    }
    Ok(data)
}

/// Rewrite an uncompressed package as a raw summary followed by zlib
/// chunks of everything after the summary.
#[instrument(skip_all)]
fn compress_package(data: &[u8], mut summary: FPackageFileSummary, summary_end: usize, swap: bool) -> Result<Vec<u8>> {
    let mut chunks = vec![];
    let mut payloads = vec![];
    for (n, piece) in data[summary_end..].chunks(PACKAGE_CHUNK_SIZE).enumerate() {
        let mut chunk = Archive::new(Cursor::new(vec![]));
        chunk.set_byte_swapping(swap);
        write_compressed(&mut chunk, ECompressionFlags::ZLIB, piece)?;
        chunks.push(FCompressedChunk {
            uncompressed_offset: (summary_end + n * PACKAGE_CHUNK_SIZE) as i32,
            uncompressed_size: piece.len() as i32,
            ..Default::default()
        });
        payloads.push(chunk.into_inner().into_inner());
    }
    summary.package_flags |= EPackageFlags::STORE_COMPRESSED;
    summary.compression_flags = ECompressionFlags::ZLIB;
    summary.compressed_chunks = chunks;

    let mut ar = Archive::new(Cursor::new(vec![]));
    ar.set_byte_swapping(swap);
    ar.ser(&summary)?;
    let mut offset = ar.stream_position()? as i32;
    for (chunk, payload) in summary.compressed_chunks.iter_mut().zip(&payloads) {
        chunk.compressed_offset = offset;
        chunk.compressed_size = payload.len() as i32;
        offset += payload.len() as i32;
    }
    ar.seek(SeekFrom::Start(0))?;
    ar.ser(&summary)?;
    for payload in &payloads {
        ar.write_all(payload)?;
    }
    Ok(ar.into_inner().into_inner())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::linker_load::LinkerStatus;
    use crate::object_store::{EClassFlags, Property, PropertyValue};
    use crate::resources::FObjectThumbnail;
    use crate::script_patcher::ScriptPatcher;
    use crate::{Config, FGuid, LinkerId, LoadFlags, LoadMode, MemoryPackageSource};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(mode: LoadMode, source: MemoryPackageSource) -> Result<LoadContext> {
        LoadContext::new(
            Config {
                mode,
                ..Default::default()
            },
            Arc::new(source),
        )
    }

    fn class(ctx: &mut LoadContext, outer: ObjectRef, name: &str) -> Result<ObjectRef> {
        let core = *ctx.store.core();
        let class = ctx
            .store
            .construct_object(core.class, Some(outer), FName::new(name), EObjectFlags::PUBLIC, None)?;
        if let Some(data) = ctx.store.get_mut(class)?.class_data_mut() {
            data.base.super_struct = Some(core.object);
        }
        Ok(class)
    }

    fn set_props(ctx: &mut LoadContext, object: ObjectRef, props: Vec<Property>) -> Result<()> {
        *ctx.store.get_mut(object)?.properties_mut().context("not a generic object")? = props;
        Ok(())
    }

    fn prop(ctx: &LoadContext, object: ObjectRef, name: &str) -> Option<PropertyValue> {
        let props = ctx.store.get(object).ok()?.properties();
        props.iter().find(|p| p.name == FName::new(name)).map(|p| p.value.clone())
    }

    /// Class, outer chain and name of every object in `package`, sorted.
    fn graph(ctx: &LoadContext, package: ObjectRef) -> Vec<(String, String, Vec<Property>)> {
        let mut graph: Vec<_> = ctx
            .store
            .iter()
            .filter(|(r, _)| *r != package && ctx.store.outermost(*r) == package)
            .map(|(r, o)| {
                let class = ctx.store.class_of(r).map(|c| ctx.store.path_name(c)).unwrap_or_default();
                (class, ctx.store.path_name(r), o.properties().to_vec())
            })
            .collect();
        graph.sort_by(|a, b| a.1.cmp(&b.1));
        graph
    }

    /// `Pkg` with class `Foo`, its default object, and an instance `Bar`.
    fn foo_package(options: SaveOptions) -> Result<MemoryPackageSource> {
        let mut ctx = context(LoadMode::Editor, MemoryPackageSource::new())?;
        let pkg = ctx.store.create_package(None, FName::new("Pkg"))?;
        let foo = class(&mut ctx, pkg, "Foo")?;
        let cdo = ctx.store.class_default_object(foo)?;
        set_props(&mut ctx, cdo, vec![Property::new("Count", PropertyValue::Int(1))])?;
        let bar = ctx.store.construct_object(foo, Some(pkg), FName::new("Bar"), EObjectFlags::PUBLIC, Some(cdo))?;
        set_props(
            &mut ctx,
            bar,
            vec![
                Property::new("Count", PropertyValue::Int(7)),
                Property::new("Label", PropertyValue::Str("hello".into())),
                Property::new("Self", PropertyValue::Object(Some(bar))),
                Property::new("Kind", PropertyValue::Name(FName::with_number("Kind", 3))),
            ],
        )?;
        if let Some(package) = ctx.store.get_mut(pkg)?.package_mut() {
            package.thumbnails.insert(
                "Foo Bar".into(),
                FObjectThumbnail {
                    image_width: 2,
                    image_height: 1,
                    compressed_image_data: vec![1, 2, 3],
                },
            );
        }
        let mut source = MemoryPackageSource::new();
        source.insert("Pkg.upk", save_package(&mut ctx, pkg, "Pkg.upk", options)?);
        Ok(source)
    }

    fn load_graph(source: MemoryPackageSource) -> Result<Vec<(String, String, Vec<Property>)>> {
        let mut ctx = context(LoadMode::Editor, source)?;
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        Ok(graph(&ctx, root))
    }

    #[test]
    fn test_class_and_instance_round_trip() -> Result<()> {
        let mut ctx = context(LoadMode::Editor, foo_package(SaveOptions::default())?)?;
        ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "Pkg", LoadFlags::empty())?;
            let linker = ctx.linker(id)?;
            assert_eq!(linker.export_map[0].object_name, FName::new("Foo"));
            assert!(linker.export_map[0].class_index.is_null());
            assert_eq!(linker.export_map[2].class_index, FPackageIndex::from_export(0));

            let foo = ctx.index_to_object(id, FPackageIndex(1))?.unwrap();
            assert!(ctx.store.is_class(foo));
            let bar = ctx.index_to_object(id, FPackageIndex(3))?.unwrap();
            assert_eq!(ctx.store.class_of(bar), Some(foo));
            ctx.preload(bar)?;
            assert!(!ctx.store.flags(bar).contains(EObjectFlags::NEED_LOAD));
            assert_eq!(prop(ctx, bar, "Count"), Some(PropertyValue::Int(7)));
            assert_eq!(prop(ctx, bar, "Self"), Some(PropertyValue::Object(Some(bar))));
            assert_eq!(prop(ctx, bar, "Kind"), Some(PropertyValue::Name(FName::with_number("Kind", 3))));
            Ok(())
        })
    }

    #[test]
    fn test_every_body_reads_exactly() -> Result<()> {
        // a size mismatch fails the preload
        let mut ctx = context(LoadMode::Editor, foo_package(SaveOptions::default())?)?;
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        let id = ctx.linker_for(root).unwrap();
        let linker = ctx.linker(id)?;
        assert!(linker.export_map.iter().all(|e| e.object.is_some()));
        assert_eq!(linker.thumbnails.len(), 1);
        assert_eq!(linker.thumbnails["Foo Bar"].compressed_image_data, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_byte_swapped_and_compressed_load_the_same() -> Result<()> {
        let plain = load_graph(foo_package(SaveOptions::default())?)?;
        assert_eq!(plain.len(), 3);
        let swapped = load_graph(foo_package(SaveOptions {
            force_byte_swapping: true,
            ..Default::default()
        })?)?;
        assert_eq!(swapped, plain);
        let compressed = load_graph(foo_package(SaveOptions {
            compress: true,
            ..Default::default()
        })?)?;
        assert_eq!(compressed, plain);
        let both = load_graph(foo_package(SaveOptions {
            force_byte_swapping: true,
            compress: true,
            ..Default::default()
        })?)?;
        assert_eq!(both, plain);
        Ok(())
    }

    #[test]
    fn test_resave_is_stable() -> Result<()> {
        let source = foo_package(SaveOptions::default())?;
        let original = source.get("Pkg.upk").unwrap().to_vec();
        let mut ctx = context(LoadMode::Editor, source)?;
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        let resaved = save_package(&mut ctx, root, "Pkg.upk", SaveOptions::default())?;
        assert_eq!(resaved.len(), original.len());
        Ok(())
    }

    #[test]
    fn test_time_sliced_tick_matches_single_tick() -> Result<()> {
        fn tables(ctx: &LoadContext, id: LinkerId) -> Result<impl PartialEq + std::fmt::Debug> {
            let linker = ctx.linker(id)?;
            Ok((
                linker.summary.clone(),
                linker.name_map.clone(),
                linker.import_map.iter().map(|i| (i.class_package, i.class_name, i.outer_index, i.object_name)).collect::<Vec<_>>(),
                linker.export_map.iter().map(|e| (e.object_name, e.class_index, e.serial_offset, e.serial_size)).collect::<Vec<_>>(),
                linker.depends_map.clone(),
            ))
        }
        let mut sliced = context(LoadMode::Editor, foo_package(SaveOptions::default())?)?;
        let id = sliced.create_linker_async(None, "Pkg", LoadFlags::empty())?;
        let mut ticks = 0;
        while sliced.tick(id, Some(Duration::ZERO))? == LinkerStatus::TimedOut {
            ticks += 1;
            assert!(ticks < 1000);
        }

        let mut whole = context(LoadMode::Editor, foo_package(SaveOptions::default())?)?;
        let whole_id = whole.create_linker_async(None, "Pkg", LoadFlags::empty())?;
        assert_eq!(whole.tick(whole_id, None)?, LinkerStatus::Done);
        assert_eq!(tables(&sliced, id)?, tables(&whole, whole_id)?);
        Ok(())
    }

    #[test]
    fn test_empty_patcher_changes_nothing() -> Result<()> {
        let plain = load_graph(foo_package(SaveOptions::default())?)?;
        let mut ctx = context(LoadMode::Editor, foo_package(SaveOptions::default())?)?.with_patcher(ScriptPatcher::new());
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        assert_eq!(graph(&ctx, root), plain);
        Ok(())
    }

    #[test]
    fn test_localized_sound_cue_import_binds_to_sound_cue() -> Result<()> {
        let mut source = MemoryPackageSource::new();
        let mut ctx = context(LoadMode::Editor, MemoryPackageSource::new())?;
        let engine = ctx.store.create_package(None, NAME_ENGINE)?;
        class(&mut ctx, engine, "SoundCue")?;
        source.insert("Engine.upk", save_package(&mut ctx, engine, "Engine.upk", SaveOptions::default())?);

        let mut ctx = context(LoadMode::Editor, MemoryPackageSource::new())?;
        let localized = ctx
            .store
            .register_native_class(NAME_ENGINE, NAME_SOUND_CUE_LOCALIZED, None, EClassFlags::empty())?;
        let a = ctx.store.create_package(None, FName::new("A"))?;
        let object = ctx.store.core().object;
        let holder = ctx.store.construct_object(object, Some(a), FName::new("Holder"), EObjectFlags::PUBLIC, None)?;
        set_props(&mut ctx, holder, vec![Property::new("Cue", PropertyValue::Object(Some(localized)))])?;
        source.insert("A.upk", save_package(&mut ctx, a, "A.upk", SaveOptions::default())?);

        let mut ctx = context(LoadMode::Editor, source)?;
        let root = ctx.load_package("A", LoadFlags::empty())?;
        let id = ctx.linker_for(root).unwrap();
        let linker = ctx.linker(id)?;
        let import = linker.import_map.iter().find(|i| i.class_name == NAME_CLASS).unwrap();
        assert_eq!(import.object_name, NAME_SOUND_CUE);
        let engine = ctx.linker(import.source_linker.unwrap())?;
        assert_eq!(engine.export_map[import.source_index.unwrap()].object_name, NAME_SOUND_CUE);
        let holder = ctx.store.find_object(None, Some(root), FName::new("Holder"), false).unwrap();
        let cue = ctx.store.find_object(None, Some(engine.root), NAME_SOUND_CUE, false);
        assert_eq!(prop(&ctx, holder, "Cue"), Some(PropertyValue::Object(cue)));
        Ok(())
    }

    #[test]
    fn test_import_follows_redirector() -> Result<()> {
        let mut source = MemoryPackageSource::new();
        let mut ctx = context(LoadMode::Editor, MemoryPackageSource::new())?;
        let core = *ctx.store.core();
        let new_pkg = ctx.store.create_package(None, FName::new("NewPkg"))?;
        let widget = ctx
            .store
            .construct_object(core.object, Some(new_pkg), FName::new("Widget"), EObjectFlags::PUBLIC, None)?;
        source.insert("NewPkg.upk", save_package(&mut ctx, new_pkg, "NewPkg.upk", SaveOptions::default())?);

        let old_pkg = ctx.store.create_package(None, FName::new("OldPkg"))?;
        let redirector = ctx
            .store
            .construct_object(core.redirector, Some(old_pkg), FName::new("Widget"), EObjectFlags::PUBLIC, None)?;
        ctx.store.get_mut(redirector)?.data = ObjectData::Redirector {
            destination: Some(widget),
        };
        source.insert("OldPkg.upk", save_package(&mut ctx, old_pkg, "OldPkg.upk", SaveOptions::default())?);

        // A was saved while the widget still lived in OldPkg
        let mut ctx = context(LoadMode::Editor, MemoryPackageSource::new())?;
        let old_pkg = ctx.store.create_package(None, FName::new("OldPkg"))?;
        let stale = ctx
            .store
            .construct_object(core.object, Some(old_pkg), FName::new("Widget"), EObjectFlags::PUBLIC, None)?;
        let a = ctx.store.create_package(None, FName::new("A"))?;
        let holder = ctx
            .store
            .construct_object(core.object, Some(a), FName::new("Holder"), EObjectFlags::PUBLIC, None)?;
        set_props(&mut ctx, holder, vec![Property::new("Widget", PropertyValue::Object(Some(stale)))])?;
        source.insert("A.upk", save_package(&mut ctx, a, "A.upk", SaveOptions::default())?);

        let mut ctx = context(LoadMode::Editor, source)?;
        let root = ctx.load_package("A", LoadFlags::empty())?;
        let id = ctx.linker_for(root).unwrap();
        let index = ctx
            .linker(id)?
            .import_map
            .iter()
            .position(|i| i.object_name == FName::new("Widget"))
            .unwrap();
        let import = ctx.linker(id)?.import_map[index].clone();
        let widget = import.x_object.unwrap();
        assert_eq!(ctx.store.path_name(widget), "NewPkg.Widget");
        assert_eq!(import.class_name, NAME_OBJECT);
        assert_eq!(ctx.linker(import.source_linker.unwrap())?.root_name, FName::new("NewPkg"));
        let holder = ctx.store.find_object(None, Some(root), FName::new("Holder"), false).unwrap();
        assert_eq!(prop(&ctx, holder, "Widget"), Some(PropertyValue::Object(Some(widget))));

        ctx.load_scope(|ctx| ctx.verify_import(id, index))?;
        assert_eq!(ctx.linker(id)?.import_map[index].x_object, Some(widget));
        Ok(())
    }

    #[test]
    fn test_forced_export_lands_in_its_own_package() -> Result<()> {
        let mut ctx = context(LoadMode::Editor, MemoryPackageSource::new())?;
        let mod_pkg = ctx.store.create_package(None, FName::new("ModPkg"))?;
        let mod_class = class(&mut ctx, mod_pkg, "ModClass")?;
        let a = ctx.store.create_package(None, FName::new("A"))?;
        let holder = ctx
            .store
            .construct_object(ctx.store.core().object, Some(a), FName::new("Holder"), EObjectFlags::PUBLIC, None)?;
        set_props(&mut ctx, holder, vec![Property::new("Class", PropertyValue::Object(Some(mod_class)))])?;
        let options = SaveOptions {
            forced_packages: vec![mod_pkg],
            ..Default::default()
        };
        let mut source = MemoryPackageSource::new();
        source.insert("A.upk", save_package(&mut ctx, a, "A.upk", options)?);

        let mut ctx = context(LoadMode::Game, source)?;
        ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "A", LoadFlags::empty())?;
            let forced = ctx.linker(id)?.export_map.iter().filter(|e| e.is_forced()).count();
            assert_eq!(forced, 1);
            ctx.load_all_objects(id, true)?;
            assert_eq!(ctx.forced_export_count(), 1);

            let mod_pkg = ctx
                .store
                .find_object(Some(ctx.store.core().package), None, FName::new("ModPkg"), true)
                .unwrap();
            let mod_class = ctx.store.find_object(None, Some(mod_pkg), FName::new("ModClass"), false).unwrap();
            assert!(ctx.store.is_class(mod_class));
            let root = ctx.linker(id)?.root;
            assert_eq!(ctx.store.find_object(None, Some(root), FName::new("ModClass"), false), None);
            let holder = ctx.store.find_object(None, Some(root), FName::new("Holder"), false).unwrap();
            assert_eq!(prop(ctx, holder, "Class"), Some(PropertyValue::Object(Some(mod_class))));
            Ok(())
        })
    }

    /// Level `B` holding `Door`, and level `A` whose `Trigger` points at it
    /// across levels.
    fn levels(guid: FGuid) -> Result<MemoryPackageSource> {
        let mut ctx = context(LoadMode::Editor, MemoryPackageSource::new())?;
        let object = ctx.store.core().object;
        let b = ctx.store.create_package(None, FName::new("B"))?;
        let door = ctx.store.construct_object(object, Some(b), FName::new("Door"), EObjectFlags::PUBLIC, None)?;
        ctx.cross_level.register(&mut ctx.store, guid, door)?;

        let a = ctx.store.create_package(None, FName::new("A"))?;
        if let Some(package) = ctx.store.get_mut(a)?.package_mut() {
            package.import_guids = vec![FLevelGuids {
                level_name: FName::new("B"),
                guids: vec![FGuid::new(9, 0, 0, 1), FGuid::new(9, 0, 0, 2), FGuid::new(9, 0, 0, 3)],
            }];
        }
        let trigger = ctx.store.construct_object(object, Some(a), FName::new("Trigger"), EObjectFlags::PUBLIC, None)?;
        set_props(&mut ctx, trigger, vec![Property::new("Target", PropertyValue::CrossLevelObject(Some(door)))])?;

        let mut source = MemoryPackageSource::new();
        source.insert("A.umap", save_package(&mut ctx, a, "A.umap", SaveOptions::default())?);
        source.insert("B.umap", save_package(&mut ctx, b, "B.umap", SaveOptions::default())?);
        Ok(source)
    }

    fn target(ctx: &LoadContext, level: ObjectRef) -> Option<PropertyValue> {
        let trigger = ctx.store.find_object(None, Some(level), FName::new("Trigger"), false)?;
        prop(ctx, trigger, "Target")
    }

    #[test]
    fn test_cross_level_reference_waits_for_its_level() -> Result<()> {
        let guid = FGuid::new(1, 2, 3, 4);
        let mut ctx = context(LoadMode::Editor, levels(guid)?)?;
        let a = ctx.load_package("A", LoadFlags::empty())?;
        let a_id = ctx.linker_for(a).unwrap();
        assert_eq!(ctx.linker(a_id)?.import_guids[0].guids[3], guid);
        assert_eq!(target(&ctx, a), Some(PropertyValue::CrossLevelObject(None)));
        assert_eq!(ctx.cross_level.pending_count(), 1);

        let b = ctx.load_package("B", LoadFlags::empty())?;
        let door = ctx.store.find_object(None, Some(b), FName::new("Door"), false).unwrap();
        assert_eq!(target(&ctx, a), Some(PropertyValue::CrossLevelObject(Some(door))));
        assert!(ctx.store.flags(door).contains(EObjectFlags::IS_CROSS_LEVEL_REFERENCED));
        assert_eq!(ctx.cross_level.pending_count(), 0);

        ctx.unload_package(b)?;
        assert_eq!(target(&ctx, a), Some(PropertyValue::CrossLevelObject(None)));
        assert_eq!(ctx.cross_level.pending_count(), 1);
        Ok(())
    }

    #[test]
    fn test_cross_level_reference_is_order_independent() -> Result<()> {
        let guid = FGuid::new(1, 2, 3, 4);
        let mut a_first = context(LoadMode::Editor, levels(guid)?)?;
        let a = a_first.load_package("A", LoadFlags::empty())?;
        a_first.load_package("B", LoadFlags::empty())?;
        let first = target(&a_first, a).and_then(|v| match v {
            PropertyValue::CrossLevelObject(Some(o)) => Some(a_first.store.path_name(o)),
            _ => None,
        });

        let mut b_first = context(LoadMode::Editor, levels(guid)?)?;
        b_first.load_package("B", LoadFlags::empty())?;
        let a = b_first.load_package("A", LoadFlags::empty())?;
        let second = target(&b_first, a).and_then(|v| match v {
            PropertyValue::CrossLevelObject(Some(o)) => Some(b_first.store.path_name(o)),
            _ => None,
        });
        assert_eq!(first, Some("B.Door".to_string()));
        assert_eq!(second, first);
        Ok(())
    }
}
