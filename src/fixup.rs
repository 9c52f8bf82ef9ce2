//! Compatibility rewrites applied to a linker's tables between reading them
//! and resolving anything.

use std::collections::HashMap;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Config;
use crate::linker_load::LinkerLoad;
use crate::name_map::*;
use crate::resources::{FObjectImport, FPackageIndex};
use crate::version::*;

/// One `ActiveClassRedirects` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassRedirect {
    pub old_class_name: String,
    /// `Class` or `Package.Class`.
    pub new_class_name: String,
    pub instance_only: bool,
    /// `Package.Object` this redirect is limited to.
    pub object_name: Option<String>,
}
impl ClassRedirect {
    /// Parse `ActiveClassRedirects=(OldClassName=A,NewClassName=B,InstanceOnly=true)`.
    pub fn parse_ini(line: &str) -> Result<Self> {
        let value = line
            .trim()
            .strip_prefix("ActiveClassRedirects=")
            .unwrap_or(line.trim())
            .trim();
        let body = value
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .with_context(|| format!("malformed class redirect {line:?}"))?;
        let mut redirect = ClassRedirect::default();
        for field in body.split(',') {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim().to_ascii_lowercase().as_str() {
                "oldclassname" => redirect.old_class_name = value.to_string(),
                "newclassname" => redirect.new_class_name = value.to_string(),
                "instanceonly" => redirect.instance_only = matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
                "objectname" => redirect.object_name = Some(value.to_string()),
                _ => {}
            }
        }
        if redirect.new_class_name.is_empty() {
            bail!("class redirect without NewClassName: {line:?}");
        }
        Ok(redirect)
    }
}

/// The three redirect maps built from configuration.
#[derive(Debug, Default, Clone)]
pub struct ClassRedirects {
    /// Old class name to new class, for imports.
    pub full: HashMap<FName, String>,
    /// Old class name to new class, for export instances only.
    pub instance_only: HashMap<FName, String>,
    /// `Package.Object` to new class, for single exports.
    pub object_only: HashMap<FName, String>,
}
impl ClassRedirects {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut redirects = ClassRedirects::default();
        let ini = config
            .ini_class_redirects
            .iter()
            .map(|line| ClassRedirect::parse_ini(line))
            .collect::<Result<Vec<_>>>()?;
        for redirect in config.class_redirects.iter().chain(ini.iter()) {
            redirects.add(redirect);
        }
        Ok(redirects)
    }

    pub fn add(&mut self, redirect: &ClassRedirect) {
        let new = redirect.new_class_name.clone();
        let old = FName::new(&redirect.old_class_name);
        if redirect.instance_only {
            self.instance_only.insert(old, new);
        } else if let Some(object) = redirect.object_name.as_deref().filter(|o| !o.is_empty() && *o != "None") {
            self.object_only.insert(FName::new(object), new);
        } else {
            self.full.insert(old, new);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.instance_only.is_empty() && self.object_only.is_empty()
    }
}

/// Split `Package.Class` into its parts.
fn split_redirect(redirect: &str) -> (Option<&str>, &str) {
    match redirect.split_once('.') {
        Some((package, class)) => (Some(package), class),
        None => (None, redirect),
    }
}

fn is_default_object_name(name: FName) -> bool {
    name.starts_with("Default__")
}

fn replace_ignore_case(haystack: &str, needle: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    let lower = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (start, _) in lower.match_indices(&needle) {
        out.push_str(&haystack[last..start]);
        last = start + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

impl LinkerLoad {
    /// Hard-coded renames, then configured class redirects. Appending a
    /// package import restarts the pass.
    pub(crate) fn fixup_import_map(&mut self, redirects: &ClassRedirects) {
        'restart: loop {
            for i in 0..self.import_map.len() {
                self.fixup_known_renames(i);
                if self.redirect_import(i, redirects) {
                    continue 'restart;
                }
            }
            break;
        }
    }

    fn fixup_known_renames(&mut self, i: usize) {
        let outer_is_engine = self.import_map[i]
            .outer_index
            .to_import()
            .and_then(|o| self.import_map.get(o))
            .is_some_and(|o| o.object_name == NAME_ENGINE);
        let import = &mut self.import_map[i];
        if import.object_name == NAME_SOUND_CUE_LOCALIZED && import.class_name == NAME_CLASS {
            // a licensee class of the same name lives outside Engine
            if outer_is_engine {
                import.object_name = NAME_SOUND_CUE;
            }
        } else if import.class_name == NAME_SOUND_CUE_LOCALIZED && import.class_package == NAME_ENGINE {
            import.class_name = NAME_SOUND_CUE;
        }

        if import.object_name == NAME_SEQUENCE_OBJECTS && import.class_name == NAME_PACKAGE {
            import.object_name = NAME_ENGINE;
        }
        if import.class_package == NAME_SEQUENCE_OBJECTS {
            import.class_package = NAME_ENGINE;
        }
    }

    /// Apply the configured redirect to import `i`. Returns `true` when a
    /// package import was appended and the pass has to start over.
    fn redirect_import(&mut self, i: usize, redirects: &ClassRedirects) -> bool {
        let import = self.import_map[i].clone();
        let redirect_obj = redirects.full.get(&import.object_name).filter(|_| import.class_name == NAME_CLASS);
        let redirect_class = redirects.full.get(&import.class_name);
        let (redirect, mut update_outer) = match (redirect_class, redirect_obj) {
            (Some(r), _) if import.class_package != NAME_CORE => (r, false),
            (Some(r), Some(_)) => (r, false),
            (None, Some(r)) => (r, true),
            _ => return false,
        };

        let (result_package, result_class) = match split_redirect(redirect) {
            (Some(package), class) => (FName::new(package), FName::new(class)),
            (None, class) => {
                update_outer = false;
                (import.class_package, FName::new(class))
            }
        };

        let old_outer = self
            .import_map
            .iter()
            .position(|o| o.class_name == NAME_PACKAGE && o.object_name == import.class_package)
            .unwrap_or(0);
        if !import.outer_index.is_null() && import.outer_index == FPackageIndex::from_import(old_outer) && result_package != import.class_package {
            // default object or archetype owned by the class package
            update_outer = true;
        }

        let mut new = import.clone();
        if update_outer && !result_package.is_none() {
            let existing = self
                .import_map
                .iter()
                .position(|o| o.class_name == NAME_PACKAGE && o.object_name == result_package);
            match existing {
                Some(package) => new.outer_index = FPackageIndex::from_import(package),
                None if result_package != NAME_CORE => {
                    debug!("{}: adding package import {result_package} for class redirect", self.filename);
                    self.import_map
                        .push(FObjectImport::new(NAME_CORE, NAME_PACKAGE, FPackageIndex::NULL, result_package));
                    return true;
                }
                None => {}
            }
        }

        if redirect_class.is_some() && import.class_package != NAME_CORE {
            new.class_package = result_package;
            new.class_name = result_class;
        }
        if redirect_obj.is_some() && new.class_name == NAME_CLASS {
            new.object_name = result_class;
        }
        if is_default_object_name(import.object_name) {
            new.object_name = FName::new(&format!("Default__{result_class}"));
        }

        if new.object_name != import.object_name
            || new.class_name != import.class_name
            || new.class_package != import.class_package
            || new.outer_index != import.outer_index
        {
            debug!(
                "{}: import [{} {} {} {}] -> [{} {} {} {}]",
                self.root_name,
                import.object_name,
                import.class_name,
                import.class_package,
                import.outer_index,
                new.object_name,
                new.class_name,
                new.class_package,
                new.outer_index
            );
        }
        self.import_map[i] = new;
        false
    }

    /// Version-gated class and package remaps. Returns whether the package
    /// was changed in a way that needs resaving.
    pub(crate) fn remap_classes(&mut self) -> bool {
        let ver = self.summary.file_version;
        if ver < VER_RENAME_MOBILEGAME_TO_SIMPLEGAME {
            for import in &mut self.import_map {
                if ver < VER_FIXUP_MOBILEGAME_REFS {
                    let is_mobile = |n: FName| n == NAME_MOBILE_GAME || n == NAME_CASTLE_GAME;
                    if import.class_name == NAME_PACKAGE && is_mobile(import.object_name) {
                        import.object_name = NAME_UDK_BASE;
                    }
                    if is_mobile(import.class_package) {
                        import.class_package = NAME_UDK_BASE;
                    }
                }
                if import.object_name == NAME_MOBILE_GAME {
                    import.object_name = NAME_SIMPLE_GAME;
                }
            }
        }
        if ver < VER_FIXED_PREFAB_SEQUENCES {
            return self.convert_prefab_sequences();
        }
        false
    }

    /// Old prefab content stored its sequences as plain `Sequence` objects.
    fn convert_prefab_sequences(&mut self) -> bool {
        let has_prefabs = self
            .import_map
            .iter()
            .any(|i| i.class_name == NAME_CLASS && (i.object_name == NAME_PREFAB || i.object_name == NAME_PREFAB_INSTANCE));
        if !has_prefabs {
            return false;
        }

        let mut engine = None;
        let mut sequence_class = None;
        let mut container_class = None;
        let mut prefab_sequence_class = None;
        let mut prefab_class = None;
        for (i, import) in self.import_map.iter().enumerate() {
            let index = FPackageIndex::from_import(i);
            if import.class_name == NAME_CLASS {
                match import.object_name {
                    n if n == NAME_PREFAB_SEQUENCE_CONTAINER => container_class = Some(index),
                    n if n == NAME_PREFAB_SEQUENCE => prefab_sequence_class = Some(index),
                    n if n == NAME_SEQUENCE => sequence_class = Some(index),
                    n if n == NAME_PREFAB => prefab_class = Some(index),
                    _ => {}
                }
            } else if import.class_name == NAME_PACKAGE && import.object_name == NAME_ENGINE {
                engine = Some(index);
            }
        }

        // prefabs without sequences never import the class
        let Some(sequence_class) = sequence_class else {
            return false;
        };
        let Some(engine) = engine else {
            warn!("{}: prefab sequences without an Engine import, skipping conversion", self.filename);
            return false;
        };
        warn!("Performing sequence class fixup for {}", self.filename);

        let mut add_class = |map: &mut Vec<FObjectImport>, class: FName| {
            let index = FPackageIndex::from_import(map.len());
            map.push(FObjectImport::new(NAME_CORE, NAME_CLASS, engine, class));
            map.push(FObjectImport::new(NAME_ENGINE, class, engine, FName::new(&format!("Default__{class}"))));
            index
        };
        let container_class = container_class.unwrap_or_else(|| add_class(&mut self.import_map, NAME_PREFAB_SEQUENCE_CONTAINER));
        let prefab_sequence_class = prefab_sequence_class.unwrap_or_else(|| add_class(&mut self.import_map, NAME_PREFAB_SEQUENCE));

        let mut dirty = false;
        for i in 0..self.export_map.len() {
            let export = &self.export_map[i];
            if export.class_index != sequence_class {
                continue;
            }
            if export.object_name == NAME_PREFABS {
                warn!("\tchanging class of {} to PrefabSequenceContainer", self.export_path_name(i, None, false));
                self.export_map[i].class_index = container_class;
                dirty = true;
            } else if let Some(outer) = export.outer_index.to_export() {
                let outer = &self.export_map[outer];
                if outer.object_name == NAME_PREFABS || Some(outer.class_index) == prefab_class {
                    warn!("\tchanging class of {} to PrefabSequence", self.export_path_name(i, None, false));
                    self.export_map[i].class_index = prefab_sequence_class;
                    dirty = true;
                }
            }
        }
        dirty
    }

    /// Rename external package references to carry `suffix`, so patched
    /// content can coexist with the unpatched packages.
    pub(crate) fn remap_package_names(&mut self, suffix: &str) {
        if suffix.is_empty() {
            return;
        }
        let has_suffix = |name: FName| name.contains(suffix);
        let with_suffix = |name: FName| FName::new(&format!("{name}{suffix}"));
        for import in &mut self.import_map {
            if import.class_package != NAME_CORE {
                if !has_suffix(import.class_package) {
                    import.class_package = with_suffix(import.class_package);
                }
            } else if import.class_name == NAME_PACKAGE && import.outer_index.is_null() && import.object_name != NAME_CORE && !has_suffix(import.object_name) {
                import.object_name = with_suffix(import.object_name);
            }
        }
        for i in 0..self.export_map.len() {
            if self.is_forced_top_level_package(i) && !has_suffix(self.export_map[i].object_name) {
                self.export_map[i].object_name = with_suffix(self.export_map[i].object_name);
            }
        }
    }

    /// Strip the `_<LANG>` suffix from forced-export top-level packages of a
    /// localized seek-free cook.
    pub(crate) fn remap_localized_package_names(&mut self, language: &str) {
        let search = format!("_{language}");
        for i in 0..self.export_map.len() {
            let name = self.export_map[i].object_name;
            if self.is_forced_top_level_package(i) && name.contains(&search) {
                self.export_map[i].object_name = FName::new(&replace_ignore_case(&name.to_string(), &search));
            }
        }
    }

    /// Whether the localized package remap applies to this linker.
    pub(crate) fn wants_localized_remap(&self, language: &str) -> bool {
        !language.eq_ignore_ascii_case("INT")
            && self.load_flags.contains(crate::LoadFlags::SEEK_FREE)
            && self
                .filename
                .to_ascii_lowercase()
                .contains(&format!("_loc_{}.", language.to_ascii_lowercase()))
    }

    fn is_forced_top_level_package(&self, i: usize) -> bool {
        let export = &self.export_map[i];
        export.outer_index.is_null() && export.is_forced() && self.export_class_name(i) == NAME_PACKAGE
    }

    /// Convert export classes through the instance-only and object-only
    /// redirect maps.
    pub(crate) fn fixup_export_map(&mut self, redirects: &ClassRedirects) {
        if self.is_cooked() || (redirects.instance_only.is_empty() && redirects.object_only.is_empty()) {
            return;
        }
        for i in 0..self.export_map.len() {
            let class_name = self.export_class_name(i);
            let class_package = self.export_class_package(i);
            let object_name = self.export_map[i].object_name;
            let (redirect, default_package) = match redirects.instance_only.get(&class_name) {
                Some(redirect) => (redirect, Some(class_package)),
                None => {
                    let key = FName::new(&format!("{}.{object_name}", self.root_name));
                    match redirects.object_only.get(&key) {
                        Some(redirect) => (redirect, None),
                        None => continue,
                    }
                }
            };
            if is_default_object_name(object_name) {
                continue;
            }
            let (package, class) = split_redirect(redirect);
            let package = package.map(FName::new).or(default_package).unwrap_or(NAME_NONE);
            let class = FName::new(class);
            let (class_index, _) = self.create_import_class_and_package(class, package);
            self.export_map[i].class_index = class_index;
            debug!(
                "{}: export [{object_name} {class_name} {class_package}] -> [{object_name} {class} {package}]",
                self.root_name
            );
        }
    }

    /// `(class import, its outer)` of the class import named `class_name`.
    pub fn find_import_class_and_package(&self, class_name: FName) -> Option<(FPackageIndex, FPackageIndex)> {
        self.import_map
            .iter()
            .position(|i| i.object_name == class_name && i.class_name == NAME_CLASS)
            .map(|i| (FPackageIndex::from_import(i), self.import_map[i].outer_index))
    }

    /// Like [`Self::find_import_class_and_package`], appending the package
    /// and class imports when missing.
    pub fn create_import_class_and_package(&mut self, class_name: FName, package_name: FName) -> (FPackageIndex, FPackageIndex) {
        let mut package = None;
        for (i, import) in self.import_map.iter().enumerate() {
            if !package_name.is_none() && import.class_name == NAME_PACKAGE && import.object_name == package_name {
                package = Some(FPackageIndex::from_import(i));
            }
            if import.object_name == class_name && import.class_name == NAME_CLASS {
                return (FPackageIndex::from_import(i), import.outer_index);
            }
        }
        let package = match package {
            Some(package) => package,
            None => {
                self.import_map
                    .push(FObjectImport::new(NAME_CORE, NAME_PACKAGE, FPackageIndex::NULL, package_name));
                FPackageIndex::from_import(self.import_map.len() - 1)
            }
        };
        self.import_map.push(FObjectImport::new(NAME_CORE, NAME_CLASS, package, class_name));
        (FPackageIndex::from_import(self.import_map.len() - 1), package)
    }
}
