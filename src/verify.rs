//! Import verification: bind every import to an export of its source
//! linker, follow redirectors left behind by renames, and fall back to
//! native objects already in memory.

use anyhow::{Context as _, Result, bail};
use tracing::{debug, instrument, warn};

use crate::context::LoadContext;
use crate::error::LinkerError;
use crate::name_map::*;
use crate::object_store::{EClassFlags, ObjectData, ObjectRef};
use crate::resources::{EObjectFlags, EPackageFlags, FObjectImport, FPackageIndex};
use crate::{LinkerId, LoadFlags};

/// Where the in-memory fallback lookup of an import searches.
#[derive(Debug, Clone, Copy)]
enum SearchScope {
    Package(ObjectRef),
    AnyPackage,
}

enum SourceMatch {
    Found(usize),
    /// A private export only this package's dead references point at.
    SafeReplace,
    Missing,
}

impl LoadContext {
    /// Verify every import unless the package is cooked, the process is the
    /// cooked game, or the package expects its imports to be loaded already.
    #[instrument(skip(self))]
    pub fn verify(&mut self, id: LinkerId) -> Result<()> {
        let mode = self.config.mode;
        let patcher_active = self.patcher_active();
        let linker = self.linker(id)?;
        let requires_loaded = linker
            .summary
            .package_flags
            .contains(EPackageFlags::REQUIRE_IMPORTS_ALREADY_LOADED);
        let skip = linker.is_cooked() || mode.is_game() || linker.imports_verified() || (requires_loaded && !patcher_active);
        if !skip {
            let count = linker.import_map.len();
            for i in 0..count {
                self.verify_import(id, i)?;
            }
        }
        self.linker_mut(id)?.imports_verified = true;
        Ok(())
    }

    /// Resolve import `i`, trying a redirector of the same name when the
    /// source package has no such export.
    pub fn verify_import(&mut self, id: LinkerId, i: usize) -> Result<()> {
        let crash = self.verify_import_inner(id, i)?;
        let original = self.import(id, i)?.clone();
        if original.source_linker.is_none()
            || original.source_index.is_some()
            || original.x_object.is_some()
            || original.outer_index.is_null()
            || original.object_name == NAME_OBJECT_REDIRECTOR
        {
            return Ok(());
        }

        let import = &mut self.linker_mut(id)?.import_map[i];
        import.class_name = NAME_OBJECT_REDIRECTOR;
        import.class_package = NAME_CORE;
        self.verify_import_inner(id, i)?;
        let destination = self.follow_redirector(id, i, original.class_name)?;

        let import = &mut self.linker_mut(id)?.import_map[i];
        import.class_name = original.class_name;
        import.class_package = original.class_package;
        if let Some(destination) = destination {
            let (linker, index) = {
                let obj = self.store.get(destination)?;
                (obj.linker, obj.linker_index)
            };
            let import = &mut self.linker_mut(id)?.import_map[i];
            import.x_object = Some(destination);
            import.source_linker = linker;
            import.source_index = index;
            self.import_count += 1;
            return Ok(());
        }

        let linker = self.linker_mut(id)?;
        linker.import_map[i] = original;
        let (filename, full_name, quiet) = (
            linker.filename.clone(),
            linker.import_full_name(i),
            linker.load_flags.intersects(LoadFlags::NO_WARN | LoadFlags::QUIET),
        );
        let class_name = linker.import_map[i].class_name;
        if crash {
            return Err(LinkerError::FailedImport {
                filename,
                import: full_name,
                class: class_name.to_string(),
            }
            .into());
        }
        let ignored = self
            .config
            .ignore_missing_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&class_name.to_string()));
        let deprecated = self
            .store
            .find_class(class_name)
            .is_some_and(|c| self.store.class_flags(c).contains(EClassFlags::DEPRECATED));
        if !quiet && !ignored && !deprecated {
            warn!("{filename}: missing {full_name}");
        }
        Ok(())
    }

    pub(crate) fn import(&self, id: LinkerId, i: usize) -> Result<&FObjectImport> {
        let linker = self.linker(id)?;
        linker.import_map.get(i).ok_or_else(|| {
            LinkerError::BadPackageIndex {
                filename: linker.filename.clone(),
                index: FPackageIndex::from_import(i).0,
            }
            .into()
        })
    }

    /// Load the redirector import `i` now points at and return its
    /// destination, if the destination is usable in place of an object of
    /// class `class_name`.
    fn follow_redirector(&mut self, id: LinkerId, i: usize, class_name: FName) -> Result<Option<ObjectRef>> {
        let import = self.import(id, i)?;
        let (Some(source), Some(index)) = (import.source_linker, import.source_index) else {
            return Ok(None);
        };
        let redirector_class = self.store.core().redirector;
        let Some(redirector) = self.create_export(source, index)? else {
            return Ok(None);
        };
        if !self.store.is_a(redirector, redirector_class) {
            return Ok(None);
        }
        self.preload(redirector)?;
        let destination = match &self.store.get(redirector)?.data {
            ObjectData::Redirector { destination } => destination.filter(|d| self.store.is_alive(*d)),
            _ => None,
        };
        let Some(destination) = destination else {
            return Ok(None);
        };
        let destination_class = self.store.class_of(destination).map(|c| self.store.name(c));
        if destination_class != Some(class_name)
            && !self.store.flags(destination).contains(EObjectFlags::CLASS_DEFAULT_OBJECT)
        {
            if self.store.is_a(destination, redirector_class) {
                warn!("circular redirector {}", self.store.path_name(redirector));
            }
            return Ok(None);
        }
        debug!(
            "followed redirector {} to {}",
            self.store.path_name(redirector),
            self.store.path_name(destination)
        );
        Ok(Some(destination))
    }

    /// Returns whether a failure to resolve import `i` should be fatal.
    fn verify_import_inner(&mut self, id: LinkerId, i: usize) -> Result<bool> {
        let linker = self.linker(id)?;
        let import = self.import(id, i)?.clone();
        if (import.source_linker.is_some() && import.source_index.is_some())
            || import.class_package.is_none()
            || import.class_name.is_none()
            || import.object_name.is_none()
        {
            return Ok(false);
        }
        let load_flags = linker.load_flags;
        let cooked = linker.is_cooked();
        let core = *self.store.core();
        let mut safe_replace = false;
        let mut scope = None;

        if import.outer_index.is_null() {
            let package = self.store.create_package(None, import.object_name)?;
            let compiling = self
                .store
                .get(package)?
                .package()
                .is_some_and(|p| p.package_flags.contains(EPackageFlags::COMPILING));
            if compiling {
                return Ok(false);
            }
            let flags = load_flags & (LoadFlags::REMAPPED_PACKAGE | LoadFlags::NO_VERIFY | LoadFlags::NO_WARN | LoadFlags::QUIET);
            let source_linker = match self.get_package_linker(Some(package), &import.object_name.to_string(), flags) {
                Ok(source) => Some(source),
                Err(err) if is_open_failed(&err) && self.is_native_package(package) => None,
                Err(_) if load_flags.contains(LoadFlags::FIND_IF_FAIL) => None,
                Err(err) => return Err(err),
            };
            self.linker_mut(id)?.import_map[i].source_linker = source_linker;
        } else {
            let Some(outer) = import.outer_index.to_import() else {
                if cooked {
                    return Ok(false);
                }
                let linker = self.linker(id)?;
                bail!("{}: outer of import {} is not an import", linker.filename, linker.import_full_name(i));
            };
            self.check_import_index(id, outer)?;
            self.while_resolving(id, FPackageIndex::from_import(i), |ctx| ctx.verify_import(id, outer))?;
            let outer_import = self.import(id, outer)?.clone();
            self.linker_mut(id)?.import_map[i].source_linker = outer_import.source_linker;

            let linker = self.linker(id)?;
            let top_name = linker.import_map[linker.import_top_level(i)].object_name;
            if let Some(source) = outer_import.source_linker {
                scope = Some(SearchScope::Package(self.store.create_package(None, top_name)?));
                match self.find_source_export(id, i, source, &outer_import)? {
                    SourceMatch::Found(j) => self.linker_mut(id)?.import_map[i].source_index = Some(j),
                    SourceMatch::SafeReplace => safe_replace = true,
                    SourceMatch::Missing => {}
                }
            } else if let Some(package) = self
                .store
                .find_object(Some(core.package), None, top_name, true)
                .filter(|&p| self.is_native_package(p))
            {
                scope = Some(SearchScope::Package(package));
            }
        }

        if scope.is_none() && load_flags.contains(LoadFlags::FIND_IF_FAIL) {
            scope = Some(SearchScope::AnyPackage);
        }
        let import = self.import(id, i)?.clone();
        let Some(scope) = scope.filter(|_| import.source_index.is_none()) else {
            return Ok(false);
        };

        if let Some(class_package) = self.store.find_object(Some(core.package), None, import.class_package, false) {
            match self.store.find_object(Some(core.class), Some(class_package), import.class_name, false) {
                Some(class) => {
                    let outer_object = import
                        .outer_index
                        .to_import()
                        .and_then(|o| self.import(id, o).ok())
                        .and_then(|o| o.x_object);
                    let found = match (outer_object, scope) {
                        (Some(outer), _) | (None, SearchScope::Package(outer)) => {
                            let found = self.store.find_object(Some(class), Some(outer), import.object_name, false);
                            match found {
                                None if self.is_native_package(self.store.outermost(class))
                                    && import.object_name.to_string() == format!("Default__{}", import.class_name) =>
                                {
                                    Some(self.store.class_default_object(class)?)
                                }
                                found => found,
                            }
                        }
                        (None, SearchScope::AnyPackage) => self.store.find_object_any_package(Some(class), import.object_name, false),
                    };
                    match found {
                        Some(object) if load_flags.contains(LoadFlags::FIND_IF_FAIL) || self.is_native_bindable(object) => {
                            self.linker_mut(id)?.import_map[i].x_object = Some(object);
                            self.import_count += 1;
                        }
                        _ => safe_replace = true,
                    }
                }
                None => safe_replace = true,
            }
        }
        let resolved = self.import(id, i)?.x_object.is_some();
        Ok(!resolved && !safe_replace)
    }

    fn check_import_index(&self, id: LinkerId, i: usize) -> Result<()> {
        self.linker(id)?.check_index(FPackageIndex::from_import(i))
    }

    /// Look the import up in its source linker's export hash, checking the
    /// outer chain lines up with the outer import's match.
    fn find_source_export(&self, id: LinkerId, i: usize, source: LinkerId, outer_import: &FObjectImport) -> Result<SourceMatch> {
        let linker = self.linker(id)?;
        let import = &linker.import_map[i];
        let source_linker = self.linker(source)?;
        for j in source_linker.export_hash_chain(import.object_name, import.class_name, import.class_package) {
            let export = &source_linker.export_map[j];
            if export.object_name != import.object_name
                || source_linker.export_class_name(j) != import.class_name
                || source_linker.export_class_package(j) != import.class_package
            {
                continue;
            }
            if outer_import.source_linker.is_some() {
                let expected_outer = outer_import.source_index.map(FPackageIndex::from_export).unwrap_or(FPackageIndex::NULL);
                if export.outer_index != expected_outer {
                    continue;
                }
            }
            if export.object_flags.contains(EObjectFlags::PUBLIC) {
                return Ok(SourceMatch::Found(j));
            }

            let found = FPackageIndex::from_import(i);
            let referencing_export = linker.export_map.iter().find(|e| {
                e.super_index == found || e.class_index == found || e.outer_index == found || e.archetype_index == found
            });
            let referencing_import = linker.import_map.iter().enumerate().find(|(k, o)| *k != i && o.outer_index == found);
            if let Some(export) = referencing_export {
                debug!("private import {} is referenced by export {}", import.object_name, export.object_name);
            }
            if let Some((_, other)) = referencing_import {
                debug!("private import {} is the outer of import {}", import.object_name, other.object_name);
            }
            let safe = self.config.mode.is_interactive_editor() && referencing_export.is_none() && referencing_import.is_none();
            if !safe {
                return Err(LinkerError::FailedImportPrivate {
                    filename: linker.filename.clone(),
                    import: linker.import_full_name(i),
                }
                .into());
            }
            return Ok(SourceMatch::SafeReplace);
        }
        Ok(SourceMatch::Missing)
    }

    /// A package registered by the host with no file behind it, like `Core`.
    pub(crate) fn is_native_package(&self, package: ObjectRef) -> bool {
        self.store.flags(package).contains(EObjectFlags::ROOT_SET) && self.linker_for(package).is_none()
    }

    /// Whether an in-memory object may stand in for an import that no
    /// linker provides.
    fn is_native_bindable(&self, object: ObjectRef) -> bool {
        let native_transient = EObjectFlags::PUBLIC | EObjectFlags::NATIVE | EObjectFlags::TRANSIENT;
        let flags = self.store.flags(object);
        let class_flags = self.store.class_of(object).map(|c| self.store.flags(c)).unwrap_or_default();
        let is_cdo = flags.contains(EObjectFlags::CLASS_DEFAULT_OBJECT);
        if flags.contains(native_transient) || (is_cdo && class_flags.contains(native_transient)) {
            return true;
        }
        let native = flags.contains(EObjectFlags::NATIVE) || (is_cdo && class_flags.contains(EObjectFlags::NATIVE));
        native && self.is_native_package(self.store.outermost(object))
    }
}

fn is_open_failed(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<LinkerError>(), Some(LinkerError::OpenFailed(_)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryPackageSource;
    use crate::linker_save::{SaveOptions, save_package};
    use crate::object_store::{Property, PropertyValue};
    use crate::{Config, LoadMode};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn editor() -> Config {
        Config {
            mode: LoadMode::Editor,
            ..Default::default()
        }
    }

    /// `Engine` with a public `Texture2D` class and a private `Secret` object.
    fn engine_package(source: &mut MemoryPackageSource) -> Result<()> {
        let mut ctx = LoadContext::new(editor(), Arc::new(MemoryPackageSource::new()))?;
        let core = *ctx.store.core();
        let engine = ctx.store.create_package(None, NAME_ENGINE)?;
        let texture = ctx.store.construct_object(core.class, Some(engine), NAME_TEXTURE_2D, EObjectFlags::PUBLIC, None)?;
        if let Some(class) = ctx.store.get_mut(texture)?.class_data_mut() {
            class.base.super_struct = Some(core.object);
        }
        ctx.store
            .construct_object(core.object, Some(engine), FName::new("Secret"), EObjectFlags::empty(), None)?;
        source.insert("Engine.upk", save_package(&mut ctx, engine, "Engine.upk", SaveOptions::default())?);
        Ok(())
    }

    #[test]
    fn test_import_binds_to_source_export() -> Result<()> {
        let mut source = MemoryPackageSource::new();
        engine_package(&mut source)?;

        let mut ctx = LoadContext::new(editor(), Arc::new(MemoryPackageSource::new()))?;
        let a = ctx.store.create_package(None, FName::new("A"))?;
        let texture_class = ctx
            .store
            .register_native_class(NAME_ENGINE, NAME_TEXTURE_2D, None, EClassFlags::empty())?;
        let object = ctx.store.core().object;
        let holder = ctx.store.construct_object(object, Some(a), FName::new("Holder"), EObjectFlags::PUBLIC, None)?;
        ctx.store
            .get_mut(holder)?
            .properties_mut()
            .unwrap()
            .push(Property::new("Class", PropertyValue::Object(Some(texture_class))));
        source.insert("A.upk", save_package(&mut ctx, a, "A.upk", SaveOptions::default())?);

        let mut ctx = LoadContext::new(editor(), Arc::new(source))?;
        let id = ctx.load_scope(|ctx| ctx.get_package_linker(None, "A", LoadFlags::empty()))?;
        let linker = ctx.linker(id)?;
        let import = linker
            .import_map
            .iter()
            .find(|i| i.object_name == NAME_TEXTURE_2D)
            .unwrap();
        let engine = ctx.linker(import.source_linker.unwrap())?;
        assert_eq!(engine.root_name, NAME_ENGINE);
        assert_eq!(engine.export_map[import.source_index.unwrap()].object_name, NAME_TEXTURE_2D);
        assert!(linker.imports_verified());

        // verifying again changes nothing
        let before = ctx.linker(id)?.import_map.clone();
        ctx.load_scope(|ctx| {
            for i in 0..before.len() {
                ctx.verify_import(id, i)?;
            }
            Ok(())
        })?;
        let after = &ctx.linker(id)?.import_map;
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after) {
            assert_eq!((b.source_linker, b.source_index, b.x_object), (a.source_linker, a.source_index, a.x_object));
        }
        Ok(())
    }

    #[test]
    fn test_private_import_is_fatal_outside_editor_ui() -> Result<()> {
        let mut source = MemoryPackageSource::new();
        engine_package(&mut source)?;

        let mut ctx = LoadContext::new(editor(), Arc::new(MemoryPackageSource::new()))?;
        let a = ctx.store.create_package(None, FName::new("A"))?;
        let engine = ctx.store.create_package(None, NAME_ENGINE)?;
        let object = ctx.store.core().object;
        let secret = ctx
            .store
            .construct_object(object, Some(engine), FName::new("Secret"), EObjectFlags::PUBLIC, None)?;
        // the archetype reference keeps the private import alive
        ctx.store
            .construct_object(object, Some(a), FName::new("User"), EObjectFlags::PUBLIC, Some(secret))?;
        source.insert("A.upk", save_package(&mut ctx, a, "A.upk", SaveOptions::default())?);

        let mut ctx = LoadContext::new(
            Config {
                mode: LoadMode::Commandlet,
                ..Default::default()
            },
            Arc::new(source),
        )?;
        let err = ctx
            .load_scope(|ctx| ctx.get_package_linker(None, "A", LoadFlags::empty()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkerError>(),
            Some(LinkerError::FailedImportPrivate { .. })
        ));
        assert!(ctx.linkers().all(|l| l.root_name != FName::new("A")));
        Ok(())
    }

    #[test]
    fn test_cooked_game_skips_verify() -> Result<()> {
        let mut source = MemoryPackageSource::new();
        engine_package(&mut source)?;
        let mut ctx = LoadContext::new(
            Config {
                mode: LoadMode::Game,
                ..Default::default()
            },
            Arc::new(source),
        )?;
        let id = ctx.load_scope(|ctx| ctx.get_package_linker(None, "Engine", LoadFlags::empty()))?;
        let linker = ctx.linker(id)?;
        assert!(linker.imports_verified());
        assert!(linker.import_map.iter().all(|i| i.source_linker.is_none()));
        Ok(())
    }
}
