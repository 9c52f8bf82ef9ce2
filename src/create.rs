//! Realizing exports and imports as live objects, and reading their bodies.

use std::io::{Cursor, Read, Seek, SeekFrom};

use anyhow::{Context as _, Result, bail};
use tracing::{debug, instrument, trace, warn};

use crate::context::{LoadContext, linker_entry};
use crate::cross_level::{CrossLevelSlot, decode_token};
use crate::error::LinkerError;
use crate::linker_load::LinkerLoad;
use crate::name_map::*;
use crate::object_body::{BodyArchive, read_body};
use crate::object_store::{DataKind, EClassFlags, ObjectData, ObjectRef};
use crate::resources::{EExportFlags, EObjectFlags, EPackageFlags, FPackageIndex};
use crate::ser::*;
use crate::{FGuid, LinkerId, LoadFlags};

impl LinkerLoad {
    /// Raw body bytes of export `i`, taken from the script patch archive
    /// when the export or its default properties were patched.
    fn read_export_bytes(&mut self, i: usize) -> Result<(Vec<u8>, bool, i32, i32)> {
        let export = &self.export_map[i];
        let patched_defaults = export
            .object_flags
            .contains(EObjectFlags::CLASS_DEFAULT_OBJECT)
            .then(|| self.patches.defaults.get(&i).copied())
            .flatten();
        let serial_range = match (u64::try_from(export.serial_offset), u64::try_from(export.serial_size)) {
            (Ok(offset), Ok(size)) => Some((offset, size)),
            _ => None,
        };
        let (from_patch, offset, size) = match (patched_defaults, serial_range) {
            (_, Some((offset, size))) if export.is_patched() => (true, offset, size),
            (Some((offset, size)), _) if !export.is_patched() => (true, offset, size),
            (None, Some((offset, size))) => (false, offset, size),
            _ => return Err(self.bad_serial_range(i).into()),
        };
        let len = usize::try_from(size).map_err(|_| self.bad_serial_range(i))?;
        self.reading_patch = from_patch;
        let result = (|| -> Result<_> {
            let ar = self.active_loader()?;
            let total_size = ar.get_mut().total_size()?;
            if offset.checked_add(size).is_none_or(|end| end > total_size) {
                return Ok(None);
            }
            // a blocking read waits for anything not yet resident
            ar.get_mut().precache(offset, size)?;
            ar.seek(SeekFrom::Start(offset))?;
            let mut bytes = vec![0; len];
            ar.read_exact(&mut bytes)?;
            Ok(Some((bytes, ar.byte_swapping(), ar.ver(), ar.licensee_ver())))
        })();
        self.reading_patch = false;
        match result.with_context(|| format!("{}: failed to read {}", self.filename, self.export_full_name(i)))? {
            Some(read) => Ok(read),
            None => Err(self.bad_serial_range(i).into()),
        }
    }
}

/// Body archive over the bytes of one export, resolving references through
/// its linker.
struct LinkerReader<'a> {
    ctx: &'a mut LoadContext,
    id: LinkerId,
    holder: ObjectRef,
    ar: Archive<Cursor<Vec<u8>>>,
}
impl Read for LinkerReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.ar.read(buf)
    }
}
impl ArchiveState for LinkerReader<'_> {
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
impl BodyArchive for LinkerReader<'_> {
    fn read_object(&mut self) -> Result<Option<ObjectRef>> {
        let index: i32 = self.ar.de()?;
        self.ctx.index_to_object(self.id, FPackageIndex(index))
    }
    fn read_cross_level_object(&mut self, slot: usize) -> Result<Option<ObjectRef>> {
        let index: i32 = self.ar.de()?;
        match decode_token(index) {
            Some((level, guid)) => self.ctx.resolve_cross_level(self.id, level, guid, CrossLevelSlot { holder: self.holder, slot }),
            None => self.ctx.index_to_object(self.id, FPackageIndex(index)),
        }
    }
    fn read_name(&mut self) -> Result<FName> {
        let names = &self.ctx.linker(self.id)?.name_map;
        self.ar.de_ctx(names.as_slice())
    }
}

impl LoadContext {
    /// Run `resolve` with `holder` marked as under construction. Reaching
    /// `holder` again from inside means its references form a cycle.
    pub(crate) fn while_resolving<T>(
        &mut self,
        id: LinkerId,
        holder: FPackageIndex,
        resolve: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if !self.resolving.insert((id, holder)) {
            let linker = self.linker(id)?;
            let object = match (holder.to_export(), holder.to_import()) {
                (Some(i), _) => linker.export_full_name(i),
                (_, Some(i)) => linker.import_full_name(i),
                _ => linker.root_name.to_string(),
            };
            return Err(LinkerError::CircularReference {
                filename: linker.filename.clone(),
                object,
            }
            .into());
        }
        let result = resolve(self);
        self.resolving.remove(&(id, holder));
        result
    }

    /// Resolve an import or export index of linker `id` to a live object.
    pub(crate) fn index_to_object(&mut self, id: LinkerId, index: FPackageIndex) -> Result<Option<ObjectRef>> {
        self.linker(id)?.check_index(index)?;
        if let Some(i) = index.to_export() {
            self.create_export(id, i)
        } else if let Some(i) = index.to_import() {
            self.create_import(id, i)
        } else {
            Ok(None)
        }
    }

    /// Create (or find) the object for export `i` without reading its body.
    /// `None` when the export isn't wanted in this context or a dependency is
    /// missing.
    #[instrument(skip(self), level = "trace")]
    pub fn create_export(&mut self, id: LinkerId, i: usize) -> Result<Option<ObjectRef>> {
        let mode = self.config.mode;
        let patcher_active = self.patcher_active();
        let core = *self.store.core();
        let linker = self.linker(id)?;
        linker.check_index(FPackageIndex::from_export(i))?;
        let export = linker.export_map[i].clone();
        if let Some(object) = export.object.filter(|&o| self.store.is_alive(o)) {
            return Ok(Some(object));
        }
        if !export.object_flags.intersects(linker.context_flags) {
            return Ok(None);
        }
        let (filename, root, cooked) = (linker.filename.clone(), linker.root, linker.is_cooked());
        let quiet = linker.load_flags.intersects(LoadFlags::NO_WARN | LoadFlags::QUIET);

        if export.is_forced() && mode.is_editor() && !patcher_active {
            return self.create_forced_export_from_source(id, i);
        }

        let holder = FPackageIndex::from_export(i);
        let class = match export.class_index.is_null() {
            true => Some(core.class),
            false => self.while_resolving(id, holder, |ctx| ctx.index_to_object(id, export.class_index))?,
        };
        let Some(class) = class else {
            let linker = self.linker(id)?;
            let class_name = linker.export_class_name(i).to_string();
            let ignored = self.config.ignore_missing_classes.iter().any(|c| c.eq_ignore_ascii_case(&class_name));
            if !quiet && !ignored {
                let err = LinkerError::MissingClass {
                    filename,
                    export: linker.export_full_name(i),
                };
                warn!("{err}");
            }
            return Ok(None);
        };

        let mut object_flags = export.object_flags;
        if object_flags.contains(EObjectFlags::NATIVE) && !self.store.is_child_of(class, core.field) {
            warn!(
                "{filename}: stripping native flag from {} whose class {} is not a field",
                export.object_name,
                self.store.name(class)
            );
            object_flags.remove(EObjectFlags::NATIVE);
        }
        if !self.store.is_intrinsic(class) {
            self.preload(class)?;
        }
        let is_cdo = object_flags.contains(EObjectFlags::CLASS_DEFAULT_OBJECT);
        if mode.is_interactive_editor() && !is_cdo && self.store.class_flags(class).contains(EClassFlags::DEPRECATED) {
            warn!("{filename}: {} is an instance of deprecated class {}", export.object_name, self.store.name(class));
        }

        let outer = if export.outer_index.is_null() {
            if export.is_forced() {
                let package = self.store.create_package(None, export.object_name)?;
                if let Some(data) = self.store.get_mut(package)?.package_mut() {
                    data.guid = export.package_guid;
                    data.package_flags = export.package_flags;
                }
                self.linker_mut(id)?.export_map[i].object = Some(package);
                self.forced_export_count += 1;
                return Ok(Some(package));
            }
            root
        } else {
            match self.while_resolving(id, holder, |ctx| ctx.index_to_object(id, export.outer_index))? {
                Some(outer) => outer,
                None => {
                    if !quiet {
                        warn!("{filename}: missing outer for {}", self.linker(id)?.export_full_name(i));
                    }
                    return Ok(None);
                }
            }
        };

        if export.archetype_index == FPackageIndex::from_export(i) {
            let err = LinkerError::CircularArchetype {
                filename,
                export: self.linker(id)?.export_full_name(i),
            };
            warn!("{err}");
            return Ok(None);
        }
        if !cooked && !mode.is_game() {
            if let Some(archetype) = export.archetype_index.to_import() {
                self.verify_import(id, archetype)?;
            }
        }
        let template = self.export_template(id, i, class, is_cdo)?;
        if let Some(template) = template {
            self.preload(template)?;
        }

        if cooked || mode.is_game() || export.is_forced() || patcher_active {
            let existing = self.store.find_object(Some(class), Some(outer), export.object_name, true);
            if let Some(existing) = existing {
                let relink = self
                    .store
                    .get(existing)?
                    .class_data()
                    .is_some_and(|c| c.needs_property_link);
                if !relink {
                    if export.is_forced() {
                        self.forced_export_count += 1;
                    } else {
                        let obj = self.store.get_mut(existing)?;
                        obj.linker = Some(id);
                        obj.linker_index = Some(i);
                    }
                    self.linker_mut(id)?.export_map[i].object = Some(existing);
                    trace!("reusing {}", self.store.path_name(existing));
                    return Ok(Some(existing));
                }
            }
        }

        let previous_constructor = self
            .store
            .find_object(Some(core.class), Some(outer), export.object_name, true)
            .and_then(|c| self.store.get(c).ok())
            .and_then(|c| c.class_data())
            .and_then(|c| c.constructor.clone());
        let flags = (object_flags & EObjectFlags::LOAD)
            | EObjectFlags::NEED_LOAD
            | EObjectFlags::NEED_POST_LOAD
            | EObjectFlags::NEED_POST_LOAD_SUBOBJECTS;
        let object = self
            .store
            .construct_object(class, Some(outer), export.object_name, flags, template)?;
        {
            let obj = self.store.get_mut(object)?;
            obj.linker = Some(id);
            obj.linker_index = Some(i);
        }
        self.linker_mut(id)?.export_map[i].object = Some(object);
        self.objects_loaded.push(object);
        if export.is_forced() {
            self.forced_export_count += 1;
        }

        let super_struct = match export.super_index.is_null() {
            true => None,
            false => self.index_to_object(id, export.super_index)?,
        };
        let pending_patches = export.export_flags.contains(EExportFlags::MEMBER_FIELD_PATCH_PENDING);
        let obj = self.store.get_mut(object)?;
        if let Some(data) = obj.struct_data_mut() {
            data.super_struct = super_struct;
        }
        if let Some(data) = obj.class_data_mut() {
            data.bound = true;
            data.needs_property_link = pending_patches;
            if previous_constructor.is_some() {
                data.constructor = previous_constructor;
            }
        }
        if pending_patches {
            obj.flags |= EObjectFlags::PENDING_FIELD_PATCHES;
        }
        debug!("created {}", self.store.full_name(object));
        Ok(Some(object))
    }

    /// Object the new export copies its defaults from.
    fn export_template(&mut self, id: LinkerId, i: usize, class: ObjectRef, is_cdo: bool) -> Result<Option<ObjectRef>> {
        let archetype_index = self.linker(id)?.export_map[i].archetype_index;
        if !archetype_index.is_null() {
            let template = self.while_resolving(id, FPackageIndex::from_export(i), |ctx| ctx.index_to_object(id, archetype_index))?;
            if template.is_none() {
                let linker = self.linker(id)?;
                warn!("{}: missing archetype for {}", linker.filename, linker.export_full_name(i));
            }
            return Ok(template);
        }
        if !matches!(self.store.data_kind(class), DataKind::Generic) {
            return Ok(None);
        }
        if !is_cdo {
            return Ok(Some(self.store.class_default_object(class)?));
        }
        let object = self.store.core().object;
        match self.store.super_struct(class) {
            Some(parent) if class != object && parent != class => Ok(Some(self.store.class_default_object(parent)?)),
            _ => Ok(None),
        }
    }

    /// A forced export opened in the editor comes from its own package
    /// rather than the copy baked into this one.
    fn create_forced_export_from_source(&mut self, id: LinkerId, i: usize) -> Result<Option<ObjectRef>> {
        let core = *self.store.core();
        let linker = self.linker(id)?;
        let export = linker.export_map[i].clone();
        if export.outer_index.is_null() {
            return Ok(None);
        }
        let class_name = linker.export_class_name(i);
        let path = linker.export_path_name(i, None, true);
        let filename = linker.filename.clone();

        let outer_is_package = match export.outer_index.to_export() {
            Some(o) => linker.export_class_name(o) == NAME_PACKAGE,
            None => false,
        };
        let class = self.store.find_class(class_name);
        let found = if class_name == NAME_PACKAGE || !outer_is_package {
            let Some(outer) = self.index_to_object(id, export.outer_index)? else {
                return Ok(None);
            };
            self.preload(outer)?;
            self.store.find_object_fast(class, Some(outer), export.object_name, false, false)
        } else {
            match self.load_object(class.or(Some(core.object)), &path, LoadFlags::NO_WARN) {
                Ok(object) => Some(object),
                Err(err) => {
                    warn!("{filename}: failed to load forced export {path}: {err:#}");
                    None
                }
            }
        };
        if let Some(object) = found {
            self.linker_mut(id)?.export_map[i].object = Some(object);
        }
        Ok(found)
    }

    /// Resolve import `i`, loading its source package if needed.
    #[instrument(skip(self), level = "trace")]
    pub fn create_import(&mut self, id: LinkerId, i: usize) -> Result<Option<ObjectRef>> {
        let mode = self.config.mode;
        let patcher_active = self.patcher_active();
        let linker = self.linker(id)?;
        linker.check_index(FPackageIndex::from_import(i))?;
        let requires_loaded = linker
            .summary
            .package_flags
            .contains(EPackageFlags::REQUIRE_IMPORTS_ALREADY_LOADED);
        let import = linker.import_map[i].clone();
        if let Some(object) = import.x_object.filter(|&o| self.store.is_alive(o)) {
            return Ok(Some(object));
        }

        let mut found = None;
        if mode.is_game() || patcher_active {
            found = self.find_import_in_memory(id, i)?;
        }
        if found.is_none() && (!requires_loaded || patcher_active) {
            if import.source_linker.is_none() {
                self.verify_import(id, i)?;
            }
            let import = self.import(id, i)?;
            found = match (import.x_object, import.source_linker, import.source_index) {
                (Some(object), _, _) if self.store.is_alive(object) => Some(object),
                (_, Some(source), Some(j)) => self.create_export(source, j)?,
                _ => None,
            };
        }
        if found.is_none() && import.outer_index.is_null() && import.class_name == NAME_PACKAGE {
            found = Some(self.store.create_package(None, import.object_name)?);
        }
        if let Some(object) = found {
            self.linker_mut(id)?.import_map[i].x_object = Some(object);
            self.import_count += 1;
        }
        Ok(found)
    }

    fn find_import_in_memory(&mut self, id: LinkerId, i: usize) -> Result<Option<ObjectRef>> {
        let core = *self.store.core();
        let import = self.import(id, i)?.clone();
        let class = self
            .store
            .find_object(Some(core.package), None, import.class_package, false)
            .and_then(|package| self.store.find_object(Some(core.class), Some(package), import.class_name, false));
        let Some(class) = class else {
            return Ok(None);
        };
        if import.outer_index.is_null() {
            return Ok(self.store.find_object(Some(class), None, import.object_name, false));
        }
        let Some(outer) = self.index_to_object(id, import.outer_index)? else {
            return Ok(None);
        };
        Ok(self.store.find_object_fast(Some(class), Some(outer), import.object_name, false, false))
    }

    /// Read the body of `object` from its linker. Objects without a linker
    /// or already loaded are left alone.
    pub fn preload(&mut self, object: ObjectRef) -> Result<()> {
        if !self.store.is_alive(object) || !self.store.flags(object).contains(EObjectFlags::NEED_LOAD) {
            return Ok(());
        }
        let (id, i) = {
            let obj = self.store.get(object)?;
            match (obj.linker, obj.linker_index) {
                (Some(id), Some(i)) => (id, i),
                _ => return Ok(()),
            }
        };
        if !self.linkers.contains_key(&id) {
            return Ok(());
        }
        if let Some(parent) = self.store.super_struct(object).filter(|&p| p != object) {
            self.preload(parent)?;
            if !self.store.flags(object).contains(EObjectFlags::NEED_LOAD) {
                return Ok(());
            }
        }

        let linker = linker_entry(&mut self.linkers, id)?;
        let expected = linker.export_map[i].serial_size as i64;
        let (bytes, swap, ver, licensee_ver) = linker.read_export_bytes(i)?;
        self.store.clear_flags(object, EObjectFlags::NEED_LOAD);

        let mut data = std::mem::replace(&mut self.store.get_mut(object)?.data, ObjectData::Generic(vec![]));
        let mut reader = LinkerReader {
            ctx: self,
            id,
            holder: object,
            ar: Archive::new(Cursor::new(bytes)),
        };
        reader.ar.set_byte_swapping(swap);
        reader.ar.set_ver(ver, licensee_ver);
        let result = read_body(&mut reader, &mut data);
        let actual = reader.ar.get_ref().position() as i64;
        self.store.get_mut(object)?.data = data;
        let linker = self.linker(id)?;
        result.with_context(|| format!("{}: failed to serialize {}", linker.filename, linker.export_full_name(i)))?;
        if actual != expected {
            return Err(LinkerError::SerialSizeMismatch {
                filename: linker.filename.clone(),
                object: linker.export_full_name(i),
                actual,
                expected,
            }
            .into());
        }

        self.apply_patches(id, i, object)?;
        let flags = self.store.flags(object);
        if flags.contains(EObjectFlags::CLASS_DEFAULT_OBJECT) {
            self.hooks.load_config(&mut self.store, object);
            self.hooks.load_localized(&mut self.store, object);
        }
        let default_object = self.store.get(object)?.class_data().and_then(|c| c.default_object);
        if let Some(default_object) = default_object {
            self.preload(default_object)?;
        }
        trace!("preloaded {}", self.store.path_name(object));
        Ok(())
    }

    /// Overlay script patches onto a freshly read export.
    fn apply_patches(&mut self, id: LinkerId, i: usize, object: ObjectRef) -> Result<()> {
        let linker = self.linker(id)?;
        let script = linker.patches.functions.get(&i).cloned();
        let values = linker.patches.enums.get(&i).cloned();
        let members: Vec<usize> = match self.store.flags(object).contains(EObjectFlags::PENDING_FIELD_PATCHES) {
            true => (0..linker.export_map.len())
                .filter(|&j| linker.export_map[j].is_patched() && linker.export_map[j].outer_index == FPackageIndex::from_export(i))
                .collect(),
            false => vec![],
        };
        let obj = self.store.get_mut(object)?;
        if let (Some(script), Some(data)) = (script, obj.struct_data_mut()) {
            data.script = script;
        }
        if let (Some(values), ObjectData::Enum(names)) = (values, &mut obj.data) {
            *names = values;
        }
        if members.is_empty() {
            return Ok(());
        }
        for j in members {
            if let Some(member) = self.create_export(id, j)? {
                self.preload(member)?;
            }
        }
        self.store.clear_flags(object, EObjectFlags::PENDING_FIELD_PATCHES);
        if let Some(data) = self.store.get_mut(object)?.class_data_mut() {
            data.needs_property_link = false;
        }
        Ok(())
    }

    /// Resolve cross-level token `(level, guid)` read into `slot`. Targets
    /// not loaded yet are queued and filled in when they arrive.
    pub(crate) fn resolve_cross_level(&mut self, id: LinkerId, level: usize, guid_index: usize, slot: CrossLevelSlot) -> Result<Option<ObjectRef>> {
        let linker = self.linker(id)?;
        let Some((level_name, guid)) = linker
            .import_guids
            .get(level)
            .and_then(|l| l.guids.get(guid_index).map(|g| (l.level_name, *g)))
        else {
            warn!("{}: cross-level reference ({level}, {guid_index}) out of range", linker.filename);
            return Ok(None);
        };
        let target = match self.cross_level.resolve(guid).filter(|&t| self.store.is_alive(t)) {
            Some(target) => Some(target),
            None => self.find_awaiting_export(level_name, guid)?,
        };
        match target {
            Some(target) => {
                self.cross_level.add_holder(&mut self.store, target, slot);
                Ok(Some(target))
            }
            None => {
                self.cross_level.add_pending(guid, slot);
                Ok(None)
            }
        }
    }

    /// Look for `guid` among the exports of an open level that haven't been
    /// bound yet.
    fn find_awaiting_export(&mut self, level_name: FName, guid: FGuid) -> Result<Option<ObjectRef>> {
        let found = self.linkers.values().find_map(|l| {
            if l.root_name != level_name {
                return None;
            }
            let entry = l.export_guids_awaiting_lookup.iter().find(|e| e.guid == guid)?;
            Some((l.id, usize::try_from(entry.export_index - 1).ok()?))
        });
        let Some((level, index)) = found else {
            return Ok(None);
        };
        let Some(object) = self.create_export(level, index)? else {
            return Ok(None);
        };
        self.register_export_guid(level, guid, object)?;
        Ok(Some(object))
    }

    fn register_export_guid(&mut self, id: LinkerId, guid: FGuid, object: ObjectRef) -> Result<()> {
        self.cross_level.register(&mut self.store, guid, object)?;
        let root = self.linker(id)?.root;
        if let Some(package) = self.store.get_mut(root)?.package_mut() {
            package.export_guids.insert(guid, object);
        }
        Ok(())
    }

    /// Publish the GUIDs of every loaded export of linker `id`.
    pub(crate) fn bind_export_guids(&mut self, id: LinkerId) -> Result<()> {
        let linker = self.linker(id)?;
        let ready: Vec<(FGuid, ObjectRef)> = linker
            .export_guids_awaiting_lookup
            .iter()
            .filter_map(|entry| {
                let index = usize::try_from(entry.export_index - 1).ok()?;
                let object = linker.export_map.get(index)?.object?;
                let loaded = self.store.is_alive(object) && !self.store.flags(object).contains(EObjectFlags::NEED_LOAD);
                (loaded && self.cross_level.resolve(entry.guid) != Some(object)).then_some((entry.guid, object))
            })
            .collect();
        for (guid, object) in ready {
            self.register_export_guid(id, guid, object)?;
        }
        Ok(())
    }

    /// Create every export of linker `id`, preloading classes and default
    /// objects (or everything when `force` is set or the package is
    /// seek-free).
    #[instrument(skip(self))]
    pub fn load_all_objects(&mut self, id: LinkerId, force: bool) -> Result<()> {
        let linker = self.linker(id)?;
        let force = force || linker.load_flags.contains(LoadFlags::SEEK_FREE);
        let (count, root) = (linker.export_map.len(), linker.root);
        for i in 0..count {
            let Some(object) = self.create_export(id, i)? else {
                continue;
            };
            let flags = self.store.flags(object);
            if force || self.store.is_class(object) || flags.intersects(EObjectFlags::CLASS_DEFAULT_OBJECT | EObjectFlags::ARCHETYPE_OBJECT) {
                self.preload(object)?;
            }
        }
        if let Some(package) = self.store.get_mut(root)?.package_mut() {
            package.fully_loaded = true;
        }
        Ok(())
    }

    /// Index of the export named `name` whose class is `class` or a subclass.
    pub fn find_export_index(&mut self, id: LinkerId, class: ObjectRef, name: FName, outer: Option<i32>) -> Result<Option<usize>> {
        let class_name = self.store.name(class);
        let class_package = self.store.name(self.store.outermost(class));
        let linker = self.linker(id)?;
        if let Some(i) = linker.find_export_index_hashed(class_name, class_package, name, outer) {
            return Ok(Some(i));
        }
        let candidates: Vec<usize> = (0..linker.export_map.len())
            .filter(|&j| {
                let export = &linker.export_map[j];
                export.object_name == name && outer.is_none_or(|o| export.outer_index.0 == o)
            })
            .collect();
        let core_class = self.store.core().class;
        for j in candidates {
            let class_index = self.linker(id)?.export_map[j].class_index;
            let export_class = match class_index.is_null() {
                true => Some(core_class),
                false => self.index_to_object(id, class_index)?,
            };
            if export_class.is_some_and(|c| self.store.is_child_of(c, class)) {
                return Ok(Some(j));
            }
        }
        Ok(None)
    }

    /// Create the export `name` inside `outer`, following a redirector left
    /// in its place. Fails with [`LinkerError::FailedCreate`] when `checked`.
    pub fn create(&mut self, id: LinkerId, class: ObjectRef, name: FName, outer: ObjectRef, checked: bool) -> Result<Option<ObjectRef>> {
        let linker = self.linker(id)?;
        let outer_index = match outer == linker.root {
            true => 0,
            false => match self.store.get(outer)? {
                o if o.linker == Some(id) => o.linker_index.map_or(0, |i| i as i32 + 1),
                _ => {
                    if checked {
                        return Err(self.failed_create(class, outer, name));
                    }
                    return Ok(None);
                }
            },
        };
        self.create_by_outer_index(id, class, name, outer, outer_index, checked)
    }

    fn create_by_outer_index(
        &mut self,
        id: LinkerId,
        class: ObjectRef,
        name: FName,
        outer: ObjectRef,
        outer_index: i32,
        checked: bool,
    ) -> Result<Option<ObjectRef>> {
        if let Some(i) = self.find_export_index(id, class, name, Some(outer_index))? {
            if let Some(object) = self.create_export(id, i)? {
                return Ok(Some(object));
            }
        }
        if !self.linker(id)?.load_flags.contains(LoadFlags::NO_REDIRECTS) {
            let redirector_class = self.store.core().redirector;
            if let Some(i) = self.find_export_index(id, redirector_class, name, Some(outer_index))? {
                if let Some(redirector) = self.create_export(id, i)? {
                    self.preload(redirector)?;
                    let destination = match &self.store.get(redirector)?.data {
                        ObjectData::Redirector { destination } => *destination,
                        _ => None,
                    };
                    if let Some(destination) = destination.filter(|&d| self.store.is_alive(d) && self.store.is_a(d, class)) {
                        debug!("{} redirected to {}", self.store.path_name(redirector), self.store.path_name(destination));
                        return Ok(Some(destination));
                    }
                }
            }
        }
        if checked {
            return Err(self.failed_create(class, outer, name));
        }
        Ok(None)
    }

    fn failed_create(&self, class: ObjectRef, outer: ObjectRef, name: FName) -> anyhow::Error {
        LinkerError::FailedCreate {
            class: self.store.name(class).to_string(),
            path: format!("{}.{name}", self.store.path_name(outer)),
        }
        .into()
    }

    /// Load the object at `Package.Outer.Name` (`:` also separates
    /// subobjects), opening its package as needed, and read its body.
    pub fn load_object(&mut self, class: Option<ObjectRef>, path: &str, flags: LoadFlags) -> Result<ObjectRef> {
        let object_class = self.store.core().object;
        let class = class.unwrap_or(object_class);
        let segments: Vec<FName> = path.split(['.', ':']).filter(|s| !s.is_empty()).map(FName::new).collect();
        let Some((&package_name, rest)) = segments.split_first() else {
            bail!("empty object path");
        };
        if let Some(object) = self.find_loaded_path(class, package_name, rest) {
            return Ok(object);
        }
        self.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, &package_name.to_string(), flags)?;
            let mut object = ctx.linker(id)?.root;
            for (n, &name) in rest.iter().enumerate() {
                let segment_class = if n + 1 == rest.len() { class } else { object_class };
                object = ctx
                    .create(id, segment_class, name, object, true)?
                    .with_context(|| format!("failed to find {path}"))?;
            }
            ctx.preload(object)?;
            Ok(object)
        })
    }

    fn find_loaded_path(&self, class: ObjectRef, package: FName, rest: &[FName]) -> Option<ObjectRef> {
        let package_class = self.store.core().package;
        let mut object = self.store.find_object(Some(package_class), None, package, true)?;
        for (n, &name) in rest.iter().enumerate() {
            let segment_class = (n + 1 == rest.len()).then_some(class);
            object = self.store.find_object(segment_class, Some(object), name, false)?;
        }
        let loaded = !self.store.flags(object).contains(EObjectFlags::NEED_LOAD);
        (loaded && !rest.is_empty()).then_some(object)
    }

    /// Bind export `i` to an object of the same name already in memory,
    /// from an earlier load of this package.
    fn find_existing_export(&mut self, id: LinkerId, i: usize) -> Result<Option<ObjectRef>> {
        let linker = self.linker(id)?;
        let export = &linker.export_map[i];
        if let Some(object) = export.object.filter(|&o| self.store.is_alive(o)) {
            return Ok(Some(object));
        }
        let (name, outer_index, root) = (export.object_name, export.outer_index, linker.root);
        let class_name = linker.export_class_name(i);
        let outer = if outer_index.is_null() {
            Some(root)
        } else if let Some(o) = outer_index.to_export() {
            self.find_existing_export(id, o)?
        } else {
            None
        };
        // class members are rebuilt with their class
        let Some(outer) = outer.filter(|&o| !self.store.is_class(o)) else {
            return Ok(None);
        };
        let found = self
            .store
            .find_object(None, Some(outer), name, false)
            .filter(|&o| self.store.class_of(o).map(|c| self.store.name(c)) == Some(class_name));
        if let Some(object) = found {
            self.linker_mut(id)?.export_map[i].object = Some(object);
            let obj = self.store.get_mut(object)?;
            if obj.linker.is_none() {
                obj.linker = Some(id);
                obj.linker_index = Some(i);
            }
        }
        Ok(found)
    }

    /// Editor-only step binding exports to objects left over from a
    /// previous load of the same package.
    pub(crate) fn find_existing_exports(&mut self, id: LinkerId) -> Result<bool> {
        let linker = self.linker(id)?;
        if !self.config.mode.is_editor() || linker.summary.package_flags.contains(EPackageFlags::CONTAINS_MAP) {
            return Ok(true);
        }
        loop {
            let linker = self.linker_mut(id)?;
            let i = linker.cursors.find_existing;
            if i >= linker.export_map.len() {
                return Ok(true);
            }
            self.find_existing_export(id, i)?;
            let linker = self.linker_mut(id)?;
            linker.cursors.find_existing += 1;
            if linker.cursors.find_existing < linker.export_map.len() && linker.time.is_exceeded() {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{ErrorKind, error_kind};
    use crate::linker_save::{SaveOptions, save_package};
    use crate::object_store::{Property, PropertyValue};
    use crate::summary::FPackageFileSummary;
    use crate::{Config, LoadMode, MemoryPackageSource};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ctx(mode: LoadMode, source: MemoryPackageSource) -> Result<LoadContext> {
        LoadContext::new(
            Config {
                mode,
                ..Default::default()
            },
            Arc::new(source),
        )
    }

    /// `Game` holding a class `Pawn`, its default object, and an instance
    /// `Hero` with a property overriding the default.
    fn game_package() -> Result<MemoryPackageSource> {
        let mut ctx = ctx(LoadMode::Editor, MemoryPackageSource::new())?;
        let core = *ctx.store.core();
        let game = ctx.store.create_package(None, FName::new("Game"))?;
        let pawn = ctx.store.construct_object(core.class, Some(game), FName::new("Pawn"), EObjectFlags::PUBLIC, None)?;
        if let Some(class) = ctx.store.get_mut(pawn)?.class_data_mut() {
            class.base.super_struct = Some(core.object);
        }
        let cdo = ctx.store.class_default_object(pawn)?;
        ctx.store
            .get_mut(cdo)?
            .properties_mut()
            .unwrap()
            .extend([Property::new("Health", PropertyValue::Int(100)), Property::new("Speed", PropertyValue::Int(5))]);
        let hero = ctx.store.construct_object(pawn, Some(game), FName::new("Hero"), EObjectFlags::PUBLIC, Some(cdo))?;
        let props = ctx.store.get_mut(hero)?.properties_mut().unwrap();
        props.clear();
        props.push(Property::new("Health", PropertyValue::Int(250)));

        let mut source = MemoryPackageSource::new();
        source.insert("Game.upk", save_package(&mut ctx, game, "Game.upk", SaveOptions::default())?);
        Ok(source)
    }

    #[test]
    fn test_load_object_reads_body_over_defaults() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        let hero = ctx.load_object(None, "Game.Hero", LoadFlags::empty())?;
        assert!(!ctx.store.flags(hero).contains(EObjectFlags::NEED_LOAD));
        let props = ctx.store.get(hero)?.properties();
        let health = props.iter().find(|p| p.name == FName::new("Health")).unwrap();
        assert_eq!(health.value, PropertyValue::Int(250));
        let speed = props.iter().find(|p| p.name == FName::new("Speed")).unwrap();
        assert_eq!(speed.value, PropertyValue::Int(5));

        let class = ctx.store.class_of(hero).unwrap();
        assert_eq!(ctx.store.path_name(class), "Game.Pawn");
        assert_eq!(ctx.store.super_struct(class), Some(ctx.store.core().object));
        Ok(())
    }

    #[test]
    fn test_create_export_is_idempotent() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "Game", LoadFlags::empty())?;
            let first = ctx.create_export(id, 0)?;
            assert!(first.is_some());
            assert_eq!(ctx.create_export(id, 0)?, first);
            let object = first.unwrap();
            assert_eq!(ctx.store.get(object)?.linker, Some(id));
            assert_eq!(ctx.store.get(object)?.linker_index, Some(0));
            Ok(())
        })?;
        Ok(())
    }

    #[test]
    fn test_missing_export_fails_create() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        let err = ctx.load_object(None, "Game.Villain", LoadFlags::empty()).unwrap_err();
        assert!(matches!(err.downcast_ref::<LinkerError>(), Some(LinkerError::FailedCreate { .. })));
        Ok(())
    }

    #[test]
    fn test_load_all_objects_marks_package_loaded() -> Result<()> {
        let mut ctx = ctx(LoadMode::Commandlet, game_package()?)?;
        let root = ctx.load_package("Game", LoadFlags::empty())?;
        assert!(ctx.store.get(root)?.package().unwrap().fully_loaded);
        let pending: Vec<_> = ctx
            .store
            .iter()
            .filter(|(r, o)| ctx.store.outermost(*r) == root && o.flags.contains(EObjectFlags::NEED_LOAD))
            .map(|(r, _)| ctx.store.path_name(r))
            .collect();
        assert_eq!(pending, Vec::<String>::new());
        Ok(())
    }

    fn export_named(ctx: &LoadContext, id: LinkerId, name: &str) -> Result<usize> {
        let linker = ctx.linker(id)?;
        linker
            .export_map
            .iter()
            .position(|e| e.object_name == FName::new(name))
            .context("no such export")
    }

    fn assert_format_error<T: std::fmt::Debug>(result: Result<T>) {
        let err = result.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Format, "{err:#}");
    }

    #[test]
    fn test_negative_serial_size_fails_preload() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        let result = ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "Game", LoadFlags::empty())?;
            let hero = export_named(ctx, id, "Hero")?;
            ctx.linker_mut(id)?.export_map[hero].serial_size = -1;
            let object = ctx.create_export(id, hero)?.context("hero not created")?;
            ctx.preload(object)
        });
        assert_format_error(result);
        Ok(())
    }

    #[test]
    fn test_serial_range_past_end_fails_preload() -> Result<()> {
        let source = game_package()?;
        let total = source.get("Game.upk").unwrap().len() as i32;
        let mut ctx = ctx(LoadMode::Editor, source)?;
        let result = ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "Game", LoadFlags::empty())?;
            let hero = export_named(ctx, id, "Hero")?;
            let export = &mut ctx.linker_mut(id)?.export_map[hero];
            export.serial_offset = total - 2;
            export.serial_size = 64;
            let object = ctx.create_export(id, hero)?.context("hero not created")?;
            ctx.preload(object)
        });
        let err = result.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Format);
        assert!(matches!(err.downcast_ref::<LinkerError>(), Some(LinkerError::BadSerialRange { .. })));
        Ok(())
    }

    #[test]
    fn test_own_outer_fails_create() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        let result = ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "Game", LoadFlags::empty())?;
            let hero = export_named(ctx, id, "Hero")?;
            ctx.linker_mut(id)?.export_map[hero].outer_index = FPackageIndex::from_export(hero);
            ctx.create_export(id, hero)
        });
        assert_format_error(result);
        // nothing stays marked once the cycle is reported
        assert!(ctx.resolving.is_empty());
        Ok(())
    }

    #[test]
    fn test_class_cycle_fails_create() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        let result = ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "Game", LoadFlags::empty())?;
            let (pawn, hero) = (export_named(ctx, id, "Pawn")?, export_named(ctx, id, "Hero")?);
            ctx.linker_mut(id)?.export_map[pawn].class_index = FPackageIndex::from_export(hero);
            ctx.create_export(id, hero)
        });
        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<LinkerError>(), Some(LinkerError::CircularReference { .. })));
        Ok(())
    }

    #[test]
    fn test_own_import_outer_fails_verify() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        let result = ctx.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, "Game", LoadFlags::empty())?;
            let i = ctx
                .linker(id)?
                .import_map
                .iter()
                .position(|i| !i.outer_index.is_null())
                .context("no nested import")?;
            let import = &mut ctx.linker_mut(id)?.import_map[i];
            import.outer_index = FPackageIndex::from_import(i);
            import.source_linker = None;
            import.source_index = None;
            import.x_object = None;
            ctx.verify_import(id, i)
        });
        assert_format_error(result);
        Ok(())
    }

    #[test]
    fn test_table_validation() -> Result<()> {
        let mut ctx = ctx(LoadMode::Editor, game_package()?)?;
        let id = ctx.load_scope(|ctx| ctx.get_package_linker(None, "Game", LoadFlags::empty()))?;
        let (pawn, hero) = (export_named(&ctx, id, "Pawn")?, export_named(&ctx, id, "Hero")?);
        let linker = ctx.linker_mut(id)?;
        linker.validate_tables()?;
        let (exports, imports) = (linker.export_map.clone(), linker.import_map.clone());

        type Edit = Box<dyn Fn(&mut LinkerLoad)>;
        fn edit(f: impl Fn(&mut LinkerLoad) + 'static) -> Edit {
            Box::new(f)
        }
        let edits: Vec<(&str, Edit)> = vec![
            ("negative size", edit(move |l| l.export_map[hero].serial_size = -4)),
            ("negative offset", edit(move |l| l.export_map[hero].serial_offset = -1)),
            (
                "past the end",
                edit(move |l| l.export_map[hero].serial_offset = l.summary.total_header_size + 1_000_000),
            ),
            ("class out of range", edit(move |l| l.export_map[hero].class_index = FPackageIndex(100))),
            ("super out of range", edit(move |l| l.export_map[pawn].super_index = FPackageIndex(-100))),
            ("outer out of range", edit(move |l| l.export_map[hero].outer_index = FPackageIndex(100))),
            ("own outer", edit(move |l| l.export_map[pawn].outer_index = FPackageIndex::from_export(pawn))),
            (
                "outer cycle",
                edit(move |l| {
                    l.export_map[pawn].outer_index = FPackageIndex::from_export(hero);
                    l.export_map[hero].outer_index = FPackageIndex::from_export(pawn);
                }),
            ),
            ("class cycle", edit(move |l| l.export_map[pawn].class_index = FPackageIndex::from_export(hero))),
            ("own import outer", edit(|l| l.import_map[0].outer_index = FPackageIndex::from_import(0))),
        ];
        for (what, apply) in edits {
            let linker = ctx.linker_mut(id)?;
            linker.export_map = exports.clone();
            linker.import_map = imports.clone();
            apply(linker);
            let err = linker.validate_tables().unwrap_err();
            assert_eq!(error_kind(&err), ErrorKind::Format, "{what}: {err:#}");
        }

        // an export that is its own archetype is reported at creation instead
        let linker = ctx.linker_mut(id)?;
        linker.export_map = exports;
        linker.import_map = imports;
        linker.export_map[hero].archetype_index = FPackageIndex::from_export(hero);
        linker.validate_tables()?;
        Ok(())
    }

    #[test]
    fn test_corrupt_outer_in_file_fails_linker() -> Result<()> {
        let mut data = game_package()?.get("Game.upk").unwrap().to_vec();
        let summary = FPackageFileSummary::read(&mut Archive::new(Cursor::new(data.clone())), "Game.upk")?;
        // the first export points at itself as its outer
        let outer = summary.export_offset as usize + 8;
        data[outer..outer + 4].copy_from_slice(&1i32.to_le_bytes());
        let mut source = MemoryPackageSource::new();
        source.insert("Game.upk", data);

        let mut ctx = ctx(LoadMode::Editor, source)?;
        let result = ctx.load_scope(|ctx| ctx.get_package_linker(None, "Game", LoadFlags::empty()));
        assert_format_error(result);
        Ok(())
    }
}
