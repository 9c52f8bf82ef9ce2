pub mod archive;
pub mod compression;
pub mod context;
pub mod create;
pub mod cross_level;
pub mod error;
pub mod export_hash;
pub mod file_pool;
pub mod fixup;
pub mod linker_load;
pub mod linker_save;
pub mod name_map;
pub mod object_body;
pub mod object_store;
pub mod resources;
pub mod script_patcher;
pub mod ser;
pub mod summary;
pub mod verify;
pub mod version;

use anyhow::{Context as _, Result};
use fs_err as fs;
use ser::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::{AsRefStr, EnumString};

use archive::{AsyncLoader, AsyncSource, FileLoader, Loader, MemoryLoader};
use fixup::ClassRedirect;
use resources::EObjectFlags;

pub use context::LoadContext;
pub use linker_load::{LinkerLoad, LoadFlags};

/// Handle of a linker registered with a [`LoadContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkerId(pub usize);
impl Display for LinkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "linker#{}", self.0)
    }
}

#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FGuid {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}
impl FGuid {
    pub fn new(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self { a, b, c, d }
    }
    pub fn is_valid(&self) -> bool {
        (self.a | self.b | self.c | self.d) != 0
    }
}
impl Display for FGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}{:08X}", self.a, self.b, self.c, self.d)
    }
}
impl Debug for FGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FGuid({self})")
    }
}
impl Readable for FGuid {
    fn de<S: ArchiveRead>(stream: &mut S) -> Result<Self> {
        Ok(Self {
            a: stream.de()?,
            b: stream.de()?,
            c: stream.de()?,
            d: stream.de()?,
        })
    }
}
impl Writeable for FGuid {
    fn ser<S: ArchiveWrite>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&self.a)?;
        stream.ser(&self.b)?;
        stream.ser(&self.c)?;
        stream.ser(&self.d)?;
        Ok(())
    }
}

/// Which process flavour the linker runs in. Gates editor-only behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum LoadMode {
    /// Interactive editor.
    #[default]
    Editor,
    /// Editor build running a commandlet.
    Commandlet,
    /// Cooked game.
    Game,
}
impl LoadMode {
    pub fn is_editor(self) -> bool {
        matches!(self, LoadMode::Editor | LoadMode::Commandlet)
    }
    pub fn is_commandlet(self) -> bool {
        self == LoadMode::Commandlet
    }
    pub fn is_game(self) -> bool {
        self == LoadMode::Game
    }
    /// Editor without a commandlet.
    pub fn is_interactive_editor(self) -> bool {
        self == LoadMode::Editor
    }
    /// Export flags an object needs for this mode to load it.
    pub fn context_flags(self) -> EObjectFlags {
        let mut flags = EObjectFlags::LOAD_FOR_CLIENT | EObjectFlags::LOAD_FOR_SERVER;
        if self.is_editor() {
            flags |= EObjectFlags::LOAD_FOR_EDIT;
        }
        flags
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: LoadMode,
    pub language: String,
    pub class_redirects: Vec<ClassRedirect>,
    /// `ActiveClassRedirects=(OldClassName=..,NewClassName=..)` lines.
    pub ini_class_redirects: Vec<String>,
    /// Package filename to hex SHA1.
    pub package_hashes: HashMap<String, String>,
    pub script_patch_dirs: Vec<PathBuf>,
    pub trash_dir_marker: String,
    pub time_slice_granularity: u32,
    pub load_thumbnails: bool,
    /// Class names whose absence is not reported.
    pub ignore_missing_classes: Vec<String>,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            mode: LoadMode::default(),
            language: "INT".into(),
            class_redirects: vec![],
            ini_class_redirects: vec![],
            package_hashes: HashMap::new(),
            script_patch_dirs: vec![],
            trash_dir_marker: "__Trashcan".into(),
            time_slice_granularity: 100,
            load_thumbnails: false,
            ignore_missing_classes: vec![],
        }
    }
}
impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        serde_json::from_slice(&data).with_context(|| format!("failed to parse config {}", path.display()))
    }
    pub fn expected_hash(&self, filename: &str) -> Result<Option<[u8; 20]>> {
        let key = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());
        let Some(hash) = self
            .package_hashes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&key) || name.as_str() == filename)
            .map(|(_, hash)| hash)
        else {
            return Ok(None);
        };
        let mut out = [0; 20];
        hex::decode_to_slice(hash, &mut out).with_context(|| format!("bad SHA1 for {filename}"))?;
        Ok(Some(out))
    }
}

pub const PACKAGE_EXTENSIONS: [&str; 3] = ["upk", "u", "umap"];

/// Where package files come from.
pub trait PackageSourceTrait: Send + Sync {
    /// Filename of the package called `name`, if there is one.
    fn find_package(&self, name: &str) -> Option<String>;
    fn open(&self, filename: &str) -> Result<Box<dyn Loader>>;
    fn open_async(&self, filename: &str) -> Result<AsyncLoader>;
    fn read_opt(&self, filename: &str) -> Result<Option<Vec<u8>>>;
    fn read(&self, filename: &str) -> Result<Vec<u8>> {
        self.read_opt(filename)?
            .ok_or_else(|| error::LinkerError::OpenFailed(filename.to_string()).into())
    }
}

fn package_name_of(filename: &str) -> &str {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    name.split('.').next().unwrap_or(name)
}

/// CRC32 of the upper-cased base filename, as stamped into the summary.
pub fn package_source_crc(filename: &str) -> u32 {
    crc32fast::hash(package_name_of(filename).to_uppercase().as_bytes())
}

pub struct FSPackageSource {
    dirs: Vec<PathBuf>,
}
impl FSPackageSource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dirs: vec![dir.into()] }
    }
    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}
impl PackageSourceTrait for FSPackageSource {
    fn find_package(&self, name: &str) -> Option<String> {
        if Path::new(name).is_file() {
            return Some(name.to_string());
        }
        for dir in &self.dirs {
            for ext in PACKAGE_EXTENSIONS {
                let path = dir.join(format!("{name}.{ext}"));
                if path.is_file() {
                    return Some(path.display().to_string());
                }
            }
            // case-insensitive fallback
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let is_package = Path::new(&file_name)
                    .extension()
                    .is_some_and(|e| PACKAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)));
                if is_package && package_name_of(&file_name).eq_ignore_ascii_case(name) {
                    return Some(entry.path().display().to_string());
                }
            }
        }
        None
    }
    fn open(&self, filename: &str) -> Result<Box<dyn Loader>> {
        Ok(Box::new(FileLoader::open(filename)?))
    }
    fn open_async(&self, filename: &str) -> Result<AsyncLoader> {
        AsyncLoader::open(filename)
    }
    fn read_opt(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(filename) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Packages held in memory, keyed by filename.
#[derive(Default, Clone)]
pub struct MemoryPackageSource {
    files: HashMap<String, Arc<Vec<u8>>>,
}
impl MemoryPackageSource {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, filename: impl Into<String>, data: Vec<u8>) {
        self.files.insert(filename.into(), Arc::new(data));
    }
    pub fn get(&self, filename: &str) -> Option<&[u8]> {
        self.files.get(filename).map(|d| d.as_slice())
    }
    fn lookup(&self, filename: &str) -> Result<Arc<Vec<u8>>> {
        self.files
            .get(filename)
            .cloned()
            .ok_or_else(|| error::LinkerError::OpenFailed(filename.to_string()).into())
    }
}
impl PackageSourceTrait for MemoryPackageSource {
    fn find_package(&self, name: &str) -> Option<String> {
        if self.files.contains_key(name) {
            return Some(name.to_string());
        }
        let mut candidates: Vec<&String> = self
            .files
            .keys()
            .filter(|f| {
                Path::new(f.as_str())
                    .extension()
                    .is_some_and(|e| PACKAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
                    && package_name_of(f).eq_ignore_ascii_case(name)
            })
            .collect();
        candidates.sort();
        candidates.first().map(|f| f.to_string())
    }
    fn open(&self, filename: &str) -> Result<Box<dyn Loader>> {
        Ok(Box::new(MemoryLoader::new(filename, self.lookup(filename)?.to_vec())))
    }
    fn open_async(&self, filename: &str) -> Result<AsyncLoader> {
        Ok(AsyncLoader::new(filename, AsyncSource::Memory(self.lookup(filename)?)))
    }
    fn read_opt(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(filename).map(|d| d.to_vec()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_memory_source_lookup() -> Result<()> {
        let mut source = MemoryPackageSource::new();
        source.insert("Content/Engine.upk", vec![1, 2, 3]);
        source.insert("Content/Engine.upk.uncompressed_size", b"3".to_vec());
        assert_eq!(source.find_package("engine").as_deref(), Some("Content/Engine.upk"));
        assert_eq!(source.find_package("Missing"), None);
        assert!(source.read_opt("Nope.upk")?.is_none());
        let err = source.read("Nope.upk").unwrap_err();
        assert_eq!(error::error_kind(&err), error::ErrorKind::Io);
        Ok(())
    }

    #[test]
    fn test_config_defaults_and_hashes() -> Result<()> {
        let config: Config = serde_json::from_str(
            r#"{"mode": "game", "package_hashes": {"Engine.upk": "00112233445566778899aabbccddeeff00112233"}}"#,
        )?;
        assert_eq!(config.mode, LoadMode::Game);
        assert_eq!(config.language, "INT");
        assert_eq!(config.time_slice_granularity, 100);
        assert!(!config.mode.context_flags().contains(EObjectFlags::LOAD_FOR_EDIT));
        let hash = config.expected_hash("C:/Game/engine.upk")?.unwrap();
        assert_eq!(hash[1], 0x11);
        assert!(config.expected_hash("Core.u")?.is_none());
        Ok(())
    }

    #[test]
    fn test_package_source_crc_ignores_dir_and_case() {
        assert_eq!(package_source_crc("Content/Maps/Foo.umap"), package_source_crc("FOO.upk"));
        assert_ne!(package_source_crc("Foo.upk"), package_source_crc("Bar.upk"));
    }

    #[test]
    fn test_guid_display() {
        assert_eq!(FGuid::new(1, 2, 0xAB, 0).to_string(), "0000000100000002000000AB00000000");
        assert!(!FGuid::default().is_valid());
    }
}
