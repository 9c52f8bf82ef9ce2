//! Load-time state shared by every linker: the object store, the linker
//! registry, the begin/end load scope and the cross-level registry.
//!
//! [`LoadContext::tick`] drives a linker through its [`LinkerStep`]s. Steps
//! that only touch the linker's own tables live in [`crate::linker_load`];
//! the ones needing the store, the package source or other linkers are
//! dispatched from here.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use strum::AsRefStr;
use tracing::{debug, instrument, trace, warn};

use crate::archive::{Loader, MemoryLoader};
use crate::compression::{decompress_whole, parse_uncompressed_size};
use crate::cross_level::CrossLevelRegistry;
use crate::error::LinkerError;
use crate::fixup::ClassRedirects;
use crate::linker_load::{BulkDataAttachment, LinkerStatus, LinkerStep};
use crate::name_map::FName;
use crate::object_store::{ObjectRef, ObjectStore};
use crate::resources::{EObjectFlags, EPackageFlags, FPackageIndex};
use crate::script_patcher::ScriptPatcher;
use crate::version::ENGINE_VERSION;
use crate::{Config, LinkerId, LinkerLoad, LoadFlags, PackageSourceTrait, package_name_of, package_source_crc};

/// Host callbacks run at fixed points of the load.
pub trait LoadHooks: Send {
    /// A class default object finished serializing; apply config values.
    fn load_config(&mut self, _store: &mut ObjectStore, _object: ObjectRef) {}
    fn load_localized(&mut self, _store: &mut ObjectStore, _object: ObjectRef) {}
    fn post_load(&mut self, _store: &mut ObjectStore, _object: ObjectRef) {}
    /// One of `holder`'s cross-level references was filled in.
    fn post_cross_level_fixup(&mut self, _store: &mut ObjectStore, _holder: ObjectRef) {}
}

pub struct NoHooks;
impl LoadHooks for NoHooks {}

/// Coarse progress points reported while a linker is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsRefStr)]
#[repr(u8)]
pub enum Milestone {
    LoaderCreated = 1,
    SummaryRead,
    ImportsFixedUp,
    PatchesIntegrated,
    ExistingExportsFound,
    Finalized,
}
impl Milestone {
    pub const COUNT: u64 = 6;

    fn after(step: LinkerStep) -> Option<Milestone> {
        Some(match step {
            LinkerStep::CreateLoader => Milestone::LoaderCreated,
            LinkerStep::Summary => Milestone::SummaryRead,
            LinkerStep::FixupImportMap => Milestone::ImportsFixedUp,
            LinkerStep::RemapPackageNames => Milestone::PatchesIntegrated,
            LinkerStep::FindExistingExports => Milestone::ExistingExportsFound,
            LinkerStep::Finalize => Milestone::Finalized,
            _ => return None,
        })
    }
}

pub type ProgressSink = Box<dyn FnMut(&str, Milestone) + Send>;

enum PrecacheState {
    Pending,
    Ready(Result<Vec<u8>, String>),
}
type PrecacheMap = Arc<(Mutex<HashMap<String, PrecacheState>>, Condvar)>;

enum Precached {
    Missing,
    Pending,
    Ready(Vec<u8>),
}

pub struct LoadContext {
    pub store: ObjectStore,
    pub config: Config,
    pub cross_level: CrossLevelRegistry,
    source: Arc<dyn PackageSourceTrait>,
    pub(crate) redirects: ClassRedirects,
    pub(crate) patcher: Option<ScriptPatcher>,

    pub(crate) linkers: BTreeMap<LinkerId, LinkerLoad>,
    by_root: HashMap<ObjectRef, LinkerId>,
    /// Linkers that finished creation, in the order they did.
    loaders: Vec<LinkerId>,
    next_id: usize,
    /// Linkers with a tick on the call stack.
    ticking: HashSet<LinkerId>,
    /// Exports and imports whose outer, class or archetype is being resolved.
    pub(crate) resolving: HashSet<(LinkerId, FPackageIndex)>,

    /// Objects created during the current load scope, waiting for preload.
    pub(crate) objects_loaded: Vec<ObjectRef>,
    begin_load_count: u32,
    pub(crate) forced_export_count: usize,
    pub(crate) import_count: usize,

    shutdown: Arc<AtomicBool>,
    precached: PrecacheMap,
    progress: Option<ProgressSink>,
    pub(crate) hooks: Box<dyn LoadHooks>,
}

pub(crate) fn linker_entry(linkers: &mut BTreeMap<LinkerId, LinkerLoad>, id: LinkerId) -> Result<&mut LinkerLoad> {
    linkers.get_mut(&id).with_context(|| format!("{id} is not registered"))
}

impl LoadContext {
    pub fn new(config: Config, source: Arc<dyn PackageSourceTrait>) -> Result<Self> {
        let redirects = ClassRedirects::from_config(&config)?;
        let patcher = if config.script_patch_dirs.is_empty() {
            None
        } else {
            Some(ScriptPatcher::from_dirs(&config.script_patch_dirs)?)
        };
        Ok(Self {
            store: ObjectStore::new(),
            config,
            cross_level: CrossLevelRegistry::new(),
            source,
            redirects,
            patcher,
            linkers: BTreeMap::new(),
            by_root: HashMap::new(),
            loaders: vec![],
            next_id: 0,
            ticking: HashSet::new(),
            resolving: HashSet::new(),
            objects_loaded: vec![],
            begin_load_count: 0,
            forced_export_count: 0,
            import_count: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
            precached: Arc::new((Mutex::new(HashMap::new()), Condvar::new())),
            progress: None,
            hooks: Box::new(NoHooks),
        })
    }

    pub fn with_patcher(mut self, patcher: ScriptPatcher) -> Self {
        self.set_patcher(Some(patcher));
        self
    }
    pub fn set_patcher(&mut self, patcher: Option<ScriptPatcher>) {
        self.patcher = patcher;
    }
    pub fn set_hooks(&mut self, hooks: Box<dyn LoadHooks>) {
        self.hooks = hooks;
    }
    pub fn set_progress(&mut self, progress: Option<ProgressSink>) {
        self.progress = progress;
    }
    /// Flag checked between steps; setting it cancels every running load.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn linker(&self, id: LinkerId) -> Result<&LinkerLoad> {
        self.linkers.get(&id).with_context(|| format!("{id} is not registered"))
    }
    pub fn linker_mut(&mut self, id: LinkerId) -> Result<&mut LinkerLoad> {
        linker_entry(&mut self.linkers, id)
    }
    pub fn linker_for(&self, root: ObjectRef) -> Option<LinkerId> {
        self.by_root.get(&root).copied()
    }
    pub fn linkers(&self) -> impl Iterator<Item = &LinkerLoad> {
        self.linkers.values()
    }
    /// Linkers that completed creation.
    pub fn loaders(&self) -> &[LinkerId] {
        &self.loaders
    }
    pub fn forced_export_count(&self) -> usize {
        self.forced_export_count
    }
    pub fn import_count(&self) -> usize {
        self.import_count
    }

    pub(crate) fn patcher_active(&self) -> bool {
        self.patcher.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Register a linker for package `name` without running any step.
    pub fn create_linker_async(&mut self, package: Option<ObjectRef>, name: &str, flags: LoadFlags) -> Result<LinkerId> {
        let filename = self
            .source
            .find_package(name)
            .ok_or_else(|| LinkerError::OpenFailed(name.to_string()))?;
        let root = match package {
            Some(package) => package,
            None => self.store.create_package(None, FName::new(package_name_of(name)))?,
        };
        if self.by_root.contains_key(&root) {
            return Err(LinkerError::LinkerExists(self.store.name(root).to_string()).into());
        }
        let id = LinkerId(self.next_id);
        self.next_id += 1;
        let root_name = self.store.name(root);
        let mut linker = LinkerLoad::new(id, root, root_name, filename, flags, self.config.time_slice_granularity);
        linker.context_flags = self.config.mode.context_flags();
        debug!("{id}: created for {} ({})", root_name, linker.filename);
        self.by_root.insert(root, id);
        self.linkers.insert(id, linker);
        Ok(id)
    }

    /// The finished linker for a package, created and ticked to completion
    /// if needed.
    pub fn get_package_linker(&mut self, package: Option<ObjectRef>, name: &str, flags: LoadFlags) -> Result<LinkerId> {
        let root = package.or_else(|| {
            let class = self.store.core().package;
            self.store.find_object(Some(class), None, FName::new(package_name_of(name)), true)
        });
        if let Some(id) = root.and_then(|r| self.linker_for(r)) {
            if !self.linker(id)?.is_finished() && !self.ticking.contains(&id) {
                self.tick(id, None)?;
            }
            return Ok(id);
        }
        let id = self.create_linker_async(package, name, flags)?;
        self.tick(id, None)?;
        Ok(id)
    }

    /// Run creation steps until done or until `budget` runs out. Without a
    /// budget this runs to completion. A failing step drops the linker.
    #[instrument(skip(self), name = "tick_linker")]
    pub fn tick(&mut self, id: LinkerId, budget: Option<Duration>) -> Result<LinkerStatus> {
        let outermost = self.ticking.insert(id);
        let result = self.run_steps(id, budget);
        if outermost {
            self.ticking.remove(&id);
        }
        match result {
            Ok(status) => Ok(status),
            Err(err) => {
                let filename = self.linker(id).map(|l| l.filename.clone()).unwrap_or_default();
                self.discard(id);
                Err(err.context(format!("failed to create linker for {filename}")))
            }
        }
    }

    fn run_steps(&mut self, id: LinkerId, budget: Option<Duration>) -> Result<LinkerStatus> {
        self.linker_mut(id)?.time.begin_tick(budget);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(LinkerError::Cancelled.into());
            }
            let step = self.linker(id)?.step;
            if step == LinkerStep::Done {
                return Ok(LinkerStatus::Done);
            }
            trace!("{id}: {}", step.as_ref());
            if !self.run_step(id, step)? {
                return Ok(LinkerStatus::TimedOut);
            }
            let linker = self.linker_mut(id)?;
            linker.step = step.next();
            if let (Some(milestone), Some(progress)) = (Milestone::after(step), self.progress.as_mut()) {
                let filename = self.linkers.get(&id).map(|l| l.filename.as_str()).unwrap_or_default();
                progress(filename, milestone);
            }
            if self.linker_mut(id)?.time.is_exceeded() {
                return Ok(LinkerStatus::TimedOut);
            }
        }
    }

    fn run_step(&mut self, id: LinkerId, step: LinkerStep) -> Result<bool> {
        use LinkerStep::*;
        match step {
            CreateLoader => self.create_loader(id),
            Summary => {
                let source = self.source.clone();
                let reopen = |filename: &str| -> Result<Box<dyn Loader>> { Ok(Box::new(source.open_async(filename)?)) };
                if !self.linker_mut(id)?.serialize_summary(reopen)? {
                    return Ok(false);
                }
                self.apply_summary(id)?;
                Ok(true)
            }
            NameMap => self.linker_mut(id)?.serialize_name_map(),
            ImportMap => self.linker_mut(id)?.serialize_import_map(),
            ExportMap => {
                let linker = linker_entry(&mut self.linkers, id)?;
                if !linker.serialize_export_map()? {
                    return Ok(false);
                }
                linker.validate_tables()?;
                Ok(true)
            }
            ScriptPatches => linker_entry(&mut self.linkers, id)?.integrate_script_patches(self.patcher.as_ref()),
            FixupImportMap => {
                let linker = linker_entry(&mut self.linkers, id)?;
                linker.fixup_import_map(&self.redirects);
                linker.fixup_imports_done = true;
                Ok(true)
            }
            RemapClasses => {
                let linker = linker_entry(&mut self.linkers, id)?;
                if linker.remap_classes() {
                    let root = linker.root;
                    if let Some(package) = self.store.get_mut(root)?.package_mut() {
                        package.dirty = true;
                    }
                }
                Ok(true)
            }
            RemapPackageNames => {
                let suffix = self.patcher.as_ref().map(|p| p.package_suffix()).unwrap_or_default();
                if !suffix.is_empty() {
                    linker_entry(&mut self.linkers, id)?.remap_package_names(suffix);
                }
                Ok(true)
            }
            FixupExportMap => {
                let linker = linker_entry(&mut self.linkers, id)?;
                linker.fixup_export_map(&self.redirects);
                // patched and fixed-up entries are checked again
                linker.check_object_graph()?;
                Ok(true)
            }
            RemapLocalizedPackageNames => {
                let linker = linker_entry(&mut self.linkers, id)?;
                if linker.wants_localized_remap(&self.config.language) {
                    linker.remap_localized_package_names(&self.config.language);
                }
                Ok(true)
            }
            DependsMap => {
                let wanted = self.config.mode.is_editor();
                self.linker_mut(id)?.serialize_depends_map(wanted)
            }
            GuidMaps => {
                let linker = linker_entry(&mut self.linkers, id)?;
                if !linker.serialize_guid_maps()? {
                    return Ok(false);
                }
                let (root, guids) = (linker.root, linker.import_guids.clone());
                if let Some(package) = self.store.get_mut(root)?.package_mut() {
                    package.import_guids = guids;
                }
                Ok(true)
            }
            Thumbnails => {
                let wanted = self.config.mode.is_editor() || self.config.load_thumbnails;
                let linker = linker_entry(&mut self.linkers, id)?;
                if !linker.serialize_thumbnails(wanted)? {
                    return Ok(false);
                }
                let (root, thumbnails, outdated) = (linker.root, linker.thumbnails.clone(), linker.thumbnails_outdated);
                if let Some(package) = self.store.get_mut(root)?.package_mut() {
                    package.thumbnails = thumbnails;
                    package.dirty |= outdated;
                }
                Ok(true)
            }
            ExportHash => {
                self.linker_mut(id)?.build_export_hash();
                Ok(true)
            }
            FindExistingExports => self.find_existing_exports(id),
            Finalize => self.finalize(id),
            Done => Ok(true),
        }
    }

    #[instrument(skip(self))]
    fn create_loader(&mut self, id: LinkerId) -> Result<bool> {
        let linker = self.linker(id)?;
        if linker.has_loader() {
            return Ok(true);
        }
        let filename = linker.filename.clone();
        let flags = linker.load_flags;
        let wait = !linker.time.uses_limit();
        let expected = self.config.expected_hash(&filename)?;
        let memory = |data: Vec<u8>| -> Box<dyn Loader> {
            match expected {
                Some(sha) => Box::new(MemoryLoader::with_sha(filename.as_str(), data, sha)),
                None => Box::new(MemoryLoader::new(filename.as_str(), data)),
            }
        };
        let loader = match self.take_precached(&filename, wait)? {
            Precached::Pending => return Ok(false),
            Precached::Ready(data) => memory(data),
            Precached::Missing => match read_uncompressed(&*self.source, &filename)? {
                Some(data) => memory(data),
                None if flags.contains(LoadFlags::MEMORY_READER) || expected.is_some() => memory(self.source.read(&filename)?),
                None if flags.contains(LoadFlags::SEEK_FREE) => Box::new(self.source.open_async(&filename)?),
                None => self.source.open(&filename)?,
            },
        };
        self.linker_mut(id)?.set_loader(loader);
        Ok(true)
    }

    /// Carry summary state over to the root package.
    fn apply_summary(&mut self, id: LinkerId) -> Result<()> {
        let mode = self.config.mode;
        let linker = linker_entry(&mut self.linkers, id)?;
        if mode.is_editor() {
            linker.summary.package_flags.remove(EPackageFlags::REQUIRE_IMPORTS_ALREADY_LOADED);
        }
        let mut flags = linker.summary.package_flags - EPackageFlags::TRASH;
        if linker.summary.engine_version > ENGINE_VERSION {
            warn!(
                "{}: saved with engine version {} which is newer than {ENGINE_VERSION}",
                linker.filename, linker.summary.engine_version
            );
            flags |= EPackageFlags::SAVED_WITH_NEWER_VERSION;
        }
        let marker = self.config.trash_dir_marker.as_str();
        if !marker.is_empty() && linker.filename.contains(marker) {
            flags |= EPackageFlags::TRASH;
        }
        let cooked = linker.is_cooked();
        let (root, folder_name, guid) = (linker.root, linker.summary.folder_name.clone(), linker.summary.guid);
        let package = self.store.get_mut(root)?.package_mut().context("linker root is not a package")?;
        package.package_flags = flags;
        package.folder_name = folder_name;
        package.guid = guid;
        package.allow_lazy_loading = !(flags.contains(EPackageFlags::DISALLOW_LAZY_LOADING) && !(mode.is_editor() && cooked));
        Ok(())
    }

    #[instrument(skip(self))]
    fn finalize(&mut self, id: LinkerId) -> Result<bool> {
        if !self.loaders.contains(&id) {
            self.loaders.push(id);
        }
        let linker = linker_entry(&mut self.linkers, id)?;
        let mut net_counts: Vec<i32> = linker.summary.generations.iter().map(|g| g.net_object_count).collect();

        // patched exports get net indices after everything saved with the package
        if let Some(first) = linker.export_map.iter().position(|e| e.is_patched()) {
            let mut global = 0;
            for i in first..linker.export_map.len() {
                let top = top_export(linker, i);
                let top_export = &mut linker.export_map[top];
                if top == i || !top_export.is_forced() || top_export.generation_net_object_count.is_empty() {
                    global += 1;
                } else if let Some(last) = top_export.generation_net_object_count.last_mut() {
                    *last += 1;
                }
            }
            match net_counts.last_mut() {
                Some(last) => *last += global,
                None => net_counts.push(global),
            }
        }

        let user_created = linker.summary.package_source != package_source_crc(&linker.filename);
        let (root, verify) = (linker.root, !linker.load_flags.contains(LoadFlags::NO_VERIFY));
        let package = self.store.get_mut(root)?.package_mut().context("linker root is not a package")?;
        package.generation_net_object_count = net_counts;
        if user_created {
            package.user_created = true;
        } else {
            package.package_flags |= EPackageFlags::NO_EXPORT_ALLOWED;
        }

        if verify {
            self.verify(id)?;
        }
        self.linker_mut(id)?.finished = true;
        Ok(true)
    }

    fn take_precached(&self, filename: &str, wait: bool) -> Result<Precached> {
        let (map, ready) = &*self.precached;
        let mut map = map.lock().unwrap();
        loop {
            match map.remove(filename) {
                None => return Ok(Precached::Missing),
                Some(PrecacheState::Ready(result)) => return result.map(Precached::Ready).map_err(anyhow::Error::msg),
                Some(PrecacheState::Pending) => {
                    map.insert(filename.to_string(), PrecacheState::Pending);
                    if !wait {
                        return Ok(Precached::Pending);
                    }
                    map = ready.wait(map).unwrap();
                }
            }
        }
    }

    /// Start reading `filename` into memory on the rayon pool. The linker
    /// created for it later takes the buffer instead of opening the file.
    pub fn async_preload_package(&self, filename: &str) {
        let key = filename.to_string();
        {
            let mut map = self.precached.0.lock().unwrap();
            if map.contains_key(&key) {
                return;
            }
            map.insert(key.clone(), PrecacheState::Pending);
        }
        let source = self.source.clone();
        let precached = self.precached.clone();
        rayon::spawn(move || {
            let result = match read_uncompressed(&*source, &key) {
                Ok(Some(data)) => Ok(data),
                Ok(None) => source.read(&key),
                Err(err) => Err(err),
            };
            let (map, ready) = &*precached;
            map.lock()
                .unwrap()
                .insert(key, PrecacheState::Ready(result.map_err(|e| format!("{e:#}"))));
            ready.notify_all();
        });
    }

    pub fn begin_load(&mut self) {
        self.begin_load_count += 1;
    }

    /// Close a load scope. The outermost one preloads everything created
    /// inside it, runs post-load and binds cross-level GUIDs.
    #[instrument(skip(self))]
    pub fn end_load(&mut self) -> Result<()> {
        match self.begin_load_count {
            0 => bail!("end_load without a matching begin_load"),
            1 => {}
            _ => {
                self.begin_load_count -= 1;
                return Ok(());
            }
        }
        let result = self.flush_loaded();
        self.begin_load_count = 0;
        self.reset_load_counters();
        result
    }

    fn abort_load(&mut self) {
        self.begin_load_count = self.begin_load_count.saturating_sub(1);
        if self.begin_load_count == 0 {
            self.reset_load_counters();
        }
    }

    fn reset_load_counters(&mut self) {
        self.objects_loaded.clear();
        self.forced_export_count = 0;
        self.import_count = 0;
    }

    fn flush_loaded(&mut self) -> Result<()> {
        let mut loaded = vec![];
        while !self.objects_loaded.is_empty() {
            let batch = std::mem::take(&mut self.objects_loaded);
            for object in batch {
                if self.store.is_alive(object) {
                    self.preload(object)?;
                    loaded.push(object);
                }
            }
        }
        for object in loaded {
            let flags = self.store.flags(object);
            if flags.intersects(EObjectFlags::NEED_POST_LOAD | EObjectFlags::NEED_POST_LOAD_SUBOBJECTS) {
                self.store
                    .clear_flags(object, EObjectFlags::NEED_POST_LOAD | EObjectFlags::NEED_POST_LOAD_SUBOBJECTS);
                self.hooks.post_load(&mut self.store, object);
            }
        }
        let ids: Vec<LinkerId> = self.linkers.keys().copied().collect();
        for id in ids {
            self.bind_export_guids(id)?;
        }
        for holder in self.cross_level.take_notified() {
            if self.store.is_alive(holder) {
                self.hooks.post_cross_level_fixup(&mut self.store, holder);
            }
        }
        Ok(())
    }

    /// Run `f` inside a load scope. An error aborts the scope without
    /// flushing it.
    pub fn load_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin_load();
        match f(self) {
            Ok(value) => {
                self.end_load()?;
                Ok(value)
            }
            Err(err) => {
                self.abort_load();
                Err(err)
            }
        }
    }

    /// Load a package and every object in it.
    pub fn load_package(&mut self, name: &str, flags: LoadFlags) -> Result<ObjectRef> {
        self.load_scope(|ctx| {
            let id = ctx.get_package_linker(None, name, flags)?;
            ctx.load_all_objects(id, false)?;
            Ok(ctx.linker(id)?.root)
        })
    }

    /// Detach the package's linker and destroy every object in it.
    pub fn unload_package(&mut self, root: ObjectRef) -> Result<()> {
        self.reset_loaders(Some(root))?;
        let doomed: Vec<ObjectRef> = self
            .store
            .iter()
            .map(|(r, _)| r)
            .filter(|&r| self.store.outermost(r) == root)
            .collect();
        for &object in &doomed {
            self.cross_level.object_destroyed(&mut self.store, object)?;
            self.cross_level.holder_destroyed(object);
        }
        self.store.destroy_package(root);
        debug!("unloaded {} objects", doomed.len());
        Ok(())
    }

    /// Detach every linker, or only the one whose root is `package`.
    pub fn reset_loaders(&mut self, package: Option<ObjectRef>) -> Result<()> {
        let ids: Vec<LinkerId> = self
            .linkers
            .values()
            .filter(|l| package.is_none_or(|p| l.root == p))
            .map(|l| l.id)
            .collect();
        for id in ids {
            self.detach(id, true)?;
        }
        Ok(())
    }

    /// Sever the linker from its objects, close its loader and unregister
    /// it. Returns the bulk payloads it owned.
    #[instrument(skip(self))]
    pub fn detach(&mut self, id: LinkerId, ensure_bulk_loaded: bool) -> Result<Vec<BulkDataAttachment>> {
        let linker = linker_entry(&mut self.linkers, id)?;
        let ensure = ensure_bulk_loaded && linker.has_loader();
        let bulk = linker.detach_all_bulk_data(ensure)?;

        let mut owned = vec![];
        for (i, export) in linker.export_map.iter().enumerate() {
            let Some(object) = export.object.filter(|o| self.store.is_alive(*o)) else {
                continue;
            };
            let obj = self.store.get(object)?;
            if export.is_forced() && obj.linker != Some(id) {
                continue;
            }
            if obj.linker != Some(id) {
                return Err(LinkerError::DetachMislinked {
                    filename: linker.filename.clone(),
                    object: self.store.full_name(object),
                }
                .into());
            }
            if obj.linker_index != Some(i) {
                return Err(LinkerError::DetachMisindexed {
                    filename: linker.filename.clone(),
                    object: self.store.full_name(object),
                    actual: obj.linker_index.unwrap_or(usize::MAX),
                    expected: i,
                }
                .into());
            }
            owned.push(object);
        }
        for export in linker.export_map.iter_mut() {
            export.object = None;
        }
        for object in owned {
            let obj = self.store.get_mut(object)?;
            obj.linker = None;
            obj.linker_index = None;
        }
        let closed = linker.close_loaders();
        linker.clear_tables();
        self.forget_linker(id);
        closed?;
        Ok(bulk)
    }

    fn discard(&mut self, id: LinkerId) {
        if let Some(linker) = self.linkers.get_mut(&id) {
            if let Err(err) = linker.close_loaders() {
                debug!("{id}: closing discarded loader: {err:#}");
            }
        }
        self.forget_linker(id);
    }

    fn forget_linker(&mut self, id: LinkerId) {
        if let Some(linker) = self.linkers.remove(&id) {
            self.by_root.remove(&linker.root);
        }
        self.loaders.retain(|l| *l != id);
        for other in self.linkers.values_mut() {
            for import in other.import_map.iter_mut().filter(|i| i.source_linker == Some(id)) {
                import.source_linker = None;
                import.source_index = None;
                import.x_object = None;
            }
        }
    }
}

/// Top-most export in the outer chain of export `index`.
fn top_export(linker: &LinkerLoad, index: usize) -> usize {
    let mut current = index;
    for _ in 0..linker.export_map.len() {
        match linker.export_map[current].outer_index.to_export() {
            Some(outer) if outer < linker.export_map.len() => current = outer,
            _ => break,
        }
    }
    current
}

/// Contents of a fully compressed package with an `.uncompressed_size`
/// sidecar, decompressed. `None` when there is no sidecar.
fn read_uncompressed(source: &dyn PackageSourceTrait, filename: &str) -> Result<Option<Vec<u8>>> {
    let Some(sidecar) = source.read_opt(&format!("{filename}.uncompressed_size"))? else {
        return Ok(None);
    };
    let size = parse_uncompressed_size(&sidecar)?;
    let data = source.read(filename)?;
    let data = decompress_whole(&data, size).with_context(|| format!("failed to decompress {filename}"))?;
    Ok(Some(data))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compression::compress_whole;
    use crate::error::{ErrorKind, error_kind};
    use crate::linker_save::{SaveOptions, save_package};
    use crate::{FSPackageSource, MemoryPackageSource};
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};

    /// Package `name` holding one object, `Thing`.
    fn saved_package(name: &str) -> Result<Vec<u8>> {
        let mut ctx = LoadContext::new(Config::default(), Arc::new(MemoryPackageSource::new()))?;
        let package = ctx.store.create_package(None, FName::new(name))?;
        let object = ctx.store.core().object;
        ctx.store
            .construct_object(object, Some(package), FName::new("Thing"), EObjectFlags::PUBLIC, None)?;
        save_package(&mut ctx, package, &format!("{name}.upk"), SaveOptions::default())
    }

    fn memory_context(config: Config, files: Vec<(&str, Vec<u8>)>) -> Result<LoadContext> {
        let mut source = MemoryPackageSource::new();
        for (filename, data) in files {
            source.insert(filename, data);
        }
        LoadContext::new(config, Arc::new(source))
    }

    fn thing(ctx: &LoadContext, root: ObjectRef) -> Option<ObjectRef> {
        ctx.store.find_object(None, Some(root), FName::new("Thing"), false)
    }

    #[test]
    fn test_second_linker_for_package_is_rejected() -> Result<()> {
        let mut ctx = memory_context(Config::default(), vec![("Pkg.upk", saved_package("Pkg")?)])?;
        ctx.create_linker_async(None, "Pkg", LoadFlags::empty())?;
        let err = ctx.create_linker_async(None, "Pkg", LoadFlags::empty()).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Logic);
        assert_eq!(ctx.linkers().count(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_package_is_io_error() -> Result<()> {
        let mut ctx = memory_context(Config::default(), vec![])?;
        let err = ctx.load_package("Nowhere", LoadFlags::empty()).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Io);
        Ok(())
    }

    #[test]
    fn test_shutdown_cancels_and_drops_linker() -> Result<()> {
        let mut ctx = memory_context(Config::default(), vec![("Pkg.upk", saved_package("Pkg")?)])?;
        let id = ctx.create_linker_async(None, "Pkg", LoadFlags::empty())?;
        ctx.shutdown_flag().store(true, Ordering::Relaxed);
        let err = ctx.tick(id, None).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Logic);
        assert!(ctx.linker(id).is_err());
        Ok(())
    }

    #[test]
    fn test_sidecar_package_loads_decompressed() -> Result<()> {
        let data = saved_package("Pkg")?;
        let sidecar = data.len().to_string().into_bytes();
        let mut ctx = memory_context(
            Config::default(),
            vec![("Pkg.upk", compress_whole(&data)?), ("Pkg.upk.uncompressed_size", sidecar)],
        )?;
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        assert!(thing(&ctx, root).is_some());
        Ok(())
    }

    #[test]
    fn test_hash_checked_when_linker_detaches() -> Result<()> {
        let data = saved_package("Pkg")?;
        let good = hex::encode(Sha1::digest(&data));

        let mut config = Config::default();
        config.package_hashes.insert("Pkg.upk".into(), good);
        let mut ctx = memory_context(config.clone(), vec![("Pkg.upk", data.clone())])?;
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        ctx.unload_package(root)?;

        config.package_hashes.insert("Pkg.upk".into(), "00".repeat(20));
        let mut ctx = memory_context(config, vec![("Pkg.upk", data)])?;
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        let err = ctx.unload_package(root).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Integrity);
        Ok(())
    }

    #[test]
    fn test_precached_package_is_taken_over() -> Result<()> {
        let mut ctx = memory_context(Config::default(), vec![("Pkg.upk", saved_package("Pkg")?)])?;
        ctx.async_preload_package("Pkg.upk");
        let root = ctx.load_package("Pkg", LoadFlags::empty())?;
        assert!(thing(&ctx, root).is_some());
        Ok(())
    }

    #[test]
    fn test_disk_package_through_async_reader() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("Pkg.upk"), saved_package("Pkg")?)?;
        let mut ctx = LoadContext::new(Config::default(), Arc::new(FSPackageSource::new(dir.path())))?;
        let root = ctx.load_package("pkg", LoadFlags::SEEK_FREE)?;
        assert!(thing(&ctx, root).is_some());
        ctx.unload_package(root)?;
        assert_eq!(ctx.linkers().count(), 0);
        Ok(())
    }

    #[test]
    fn test_progress_reports_every_milestone() -> Result<()> {
        let mut ctx = memory_context(Config::default(), vec![("Pkg.upk", saved_package("Pkg")?)])?;
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        ctx.set_progress(Some(Box::new(move |_: &str, milestone: Milestone| {
            sink.lock().unwrap().push(milestone);
        })));
        ctx.load_package("Pkg", LoadFlags::empty())?;
        use Milestone::*;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![LoaderCreated, SummaryRead, ImportsFixedUp, PatchesIntegrated, ExistingExportsFound, Finalized]
        );
        Ok(())
    }

    #[test]
    fn test_renamed_file_is_user_created() -> Result<()> {
        let data = saved_package("Pkg")?;
        let mut ctx = memory_context(Config::default(), vec![("Pkg.upk", data.clone()), ("Copy.upk", data)])?;
        let shipped = ctx.load_package("Pkg", LoadFlags::empty())?;
        let package = ctx.store.get(shipped)?.package().unwrap();
        assert!(!package.user_created);
        assert!(package.package_flags.contains(EPackageFlags::NO_EXPORT_ALLOWED));

        let copy = ctx.load_package("Copy", LoadFlags::empty())?;
        let package = ctx.store.get(copy)?.package().unwrap();
        assert!(package.user_created);
        assert!(!package.package_flags.contains(EPackageFlags::NO_EXPORT_ALLOWED));
        Ok(())
    }
}
