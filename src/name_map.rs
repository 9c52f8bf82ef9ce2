use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{LazyLock, RwLock};

use anyhow::Result;
use tracing::instrument;

use crate::error::LinkerError;
use crate::ser::*;

/// Interned, case insensitive name with an instance number.
///
/// `number == 0` means no suffix; `number == n` prints as `Base_{n-1}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FName {
    index: u32,
    number: i32,
}

struct NamePool {
    entries: Vec<&'static str>,
    lookup: HashMap<String, u32>,
}
impl NamePool {
    fn intern(&mut self, name: &str) -> u32 {
        let key = name.to_ascii_lowercase();
        if let Some(&index) = self.lookup.get(&key) {
            return index;
        }
        let index = self.entries.len() as u32;
        self.entries.push(Box::leak(name.to_owned().into_boxed_str()));
        self.lookup.insert(key, index);
        index
    }
}

macro_rules! hardcoded_names {
    ($($ident:ident = $index:literal => $name:literal,)*) => {
        $(pub const $ident: FName = FName { index: $index, number: 0 };)*
        const HARDCODED: &[(u32, &str)] = &[$(($index, $name)),*];
    };
}

// Property classes come first so that `is_property_class` is an index compare.
hardcoded_names! {
    NAME_NONE = 0 => "None",
    NAME_BYTE_PROPERTY = 1 => "ByteProperty",
    NAME_INT_PROPERTY = 2 => "IntProperty",
    NAME_BOOL_PROPERTY = 3 => "BoolProperty",
    NAME_FLOAT_PROPERTY = 4 => "FloatProperty",
    NAME_OBJECT_PROPERTY = 5 => "ObjectProperty",
    NAME_NAME_PROPERTY = 6 => "NameProperty",
    NAME_DELEGATE_PROPERTY = 7 => "DelegateProperty",
    NAME_CLASS_PROPERTY = 8 => "ClassProperty",
    NAME_ARRAY_PROPERTY = 9 => "ArrayProperty",
    NAME_STRUCT_PROPERTY = 10 => "StructProperty",
    NAME_VECTOR_PROPERTY = 11 => "VectorProperty",
    NAME_ROTATOR_PROPERTY = 12 => "RotatorProperty",
    NAME_STR_PROPERTY = 13 => "StrProperty",
    NAME_MAP_PROPERTY = 14 => "MapProperty",
    NAME_INTERFACE_PROPERTY = 15 => "InterfaceProperty",
    NAME_COMPONENT_PROPERTY = 16 => "ComponentProperty",
    NAME_CORE = 20 => "Core",
    NAME_ENGINE = 21 => "Engine",
    NAME_OBJECT = 22 => "Object",
    NAME_FIELD = 23 => "Field",
    NAME_STRUCT = 24 => "Struct",
    NAME_FUNCTION = 25 => "Function",
    NAME_STATE = 26 => "State",
    NAME_CLASS = 27 => "Class",
    NAME_ENUM = 28 => "Enum",
    NAME_PROPERTY = 29 => "Property",
    NAME_PACKAGE = 30 => "Package",
    NAME_OBJECT_REDIRECTOR = 31 => "ObjectRedirector",
    NAME_LEVEL = 32 => "Level",
    NAME_SOUND_CUE = 33 => "SoundCue",
    NAME_SOUND_CUE_LOCALIZED = 34 => "SoundCueLocalized",
    NAME_SEQUENCE_OBJECTS = 35 => "SequenceObjects",
    NAME_SEQUENCE = 36 => "Sequence",
    NAME_PREFAB = 37 => "Prefab",
    NAME_PREFAB_INSTANCE = 38 => "PrefabInstance",
    NAME_PREFAB_SEQUENCE = 39 => "PrefabSequence",
    NAME_PREFAB_SEQUENCE_CONTAINER = 40 => "PrefabSequenceContainer",
    NAME_PREFABS = 41 => "Prefabs",
    NAME_MOBILE_GAME = 42 => "MobileGame",
    NAME_CASTLE_GAME = 43 => "CastleGame",
    NAME_UDK_BASE = 44 => "UDKBase",
    NAME_SIMPLE_GAME = 45 => "SimpleGame",
    NAME_TEXTURE_2D = 46 => "Texture2D",
}

static POOL: LazyLock<RwLock<NamePool>> = LazyLock::new(|| {
    let mut pool = NamePool {
        entries: vec![],
        lookup: HashMap::new(),
    };
    let len = HARDCODED.iter().map(|(i, _)| *i as usize + 1).max().unwrap_or(0);
    pool.entries.resize(len, "");
    for &(index, name) in HARDCODED {
        pool.entries[index as usize] = name;
        pool.lookup.insert(name.to_ascii_lowercase(), index);
    }
    // fill holes so every index maps to a unique entry
    for (index, entry) in pool.entries.iter_mut().enumerate() {
        if entry.is_empty() {
            let filler = format!("__Reserved{index}");
            *entry = Box::leak(filler.clone().into_boxed_str());
            pool.lookup.insert(filler.to_ascii_lowercase(), index as u32);
        }
    }
    RwLock::new(pool)
});

impl FName {
    /// Intern `name`, splitting a trailing `_<n>` into the instance number.
    pub fn new(name: &str) -> Self {
        let (base, number) = break_down_name(name);
        Self::with_number(base, number)
    }
    /// Intern `base` verbatim with an explicit internal instance number.
    pub fn with_number(base: &str, number: i32) -> Self {
        if base.is_empty() {
            return NAME_NONE;
        }
        let index = {
            let pool = POOL.read().unwrap();
            pool.lookup.get(&base.to_ascii_lowercase()).copied()
        };
        let index = index.unwrap_or_else(|| POOL.write().unwrap().intern(base));
        Self { index, number }
    }
    pub fn index(self) -> u32 {
        self.index
    }
    pub fn number(self) -> i32 {
        self.number
    }
    pub fn is_none(self) -> bool {
        self.index == NAME_NONE.index
    }
    /// Same name ignoring the instance number.
    pub fn base(self) -> FName {
        FName { index: self.index, number: 0 }
    }
    /// The interned base string without number suffix.
    pub fn plain(self) -> &'static str {
        POOL.read().unwrap().entries.get(self.index as usize).copied().unwrap_or("None")
    }
    pub fn is_property_class(self) -> bool {
        self.index > NAME_NONE.index && self.index < NAME_CORE.index
    }
    pub fn starts_with(self, prefix: &str) -> bool {
        self.plain().to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase())
    }
    pub fn contains(self, needle: &str) -> bool {
        self.to_string().to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
    }
}
impl Display for FName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.number > 0 {
            write!(f, "{}_{}", self.plain(), self.number - 1)
        } else {
            f.write_str(self.plain())
        }
    }
}
impl Debug for FName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FName({self})")
    }
}
impl From<&str> for FName {
    fn from(value: &str) -> Self {
        FName::new(value)
    }
}

/// Split `Foo_12` into `("Foo", 13)`. Suffixes with leading zeros are part
/// of the base name.
pub fn break_down_name(name: &str) -> (&str, i32) {
    if let Some((base, suffix)) = name.rsplit_once('_') {
        let numeric = !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit());
        if numeric && !base.is_empty() && (suffix == "0" || !suffix.starts_with('0')) {
            if let Ok(n) = suffix.parse::<i32>() {
                if n < i32::MAX {
                    return (base, n + 1);
                }
            }
        }
    }
    (name, 0)
}

/// Entry of a package name table.
#[derive(Debug, Clone, PartialEq)]
pub struct FNameEntry {
    pub name: String,
    pub flags: u64,
}
impl Readable for FNameEntry {
    #[instrument(skip_all, name = "FNameEntry")]
    fn de<S: ArchiveRead>(s: &mut S) -> Result<Self> {
        Ok(Self {
            name: s.de()?,
            flags: s.de()?,
        })
    }
}
impl Writeable for FNameEntry {
    fn ser<S: ArchiveWrite>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.name)?;
        s.ser(&self.flags)?;
        Ok(())
    }
}

/// Read a serialized `(index, number)` pair through a linker's name map.
impl ReadableCtx<&[FName]> for FName {
    fn de<S: ArchiveRead>(s: &mut S, names: &[FName]) -> Result<Self> {
        let index: i32 = s.de()?;
        let number: i32 = s.de()?;
        let name = usize::try_from(index)
            .ok()
            .and_then(|i| names.get(i))
            .ok_or(LinkerError::BadNameIndex { index, count: names.len() })?;
        if name.is_none() {
            return Ok(NAME_NONE);
        }
        Ok(FName { index: name.index, number })
    }
}

/// Maps interned names to indices of the name table being saved.
pub trait NameIndexer {
    fn name_index(&self, name: FName) -> Result<i32>;
}
impl WriteableCtx<&dyn NameIndexer> for FName {
    fn ser<S: ArchiveWrite>(&self, s: &mut S, names: &dyn NameIndexer) -> Result<()> {
        s.ser(&names.name_index(*self)?)?;
        s.ser(&self.number)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interning() {
        assert_eq!(FName::new("core"), NAME_CORE);
        assert_eq!(FName::new("None"), NAME_NONE);
        assert!(NAME_INT_PROPERTY.is_property_class());
        assert!(!NAME_CLASS.is_property_class());
        let a = FName::new("SomeUniqueName");
        let b = FName::new("SOMEUNIQUENAME");
        assert_eq!(a, b);
    }

    #[test]
    fn test_number_suffix() {
        let name = FName::new("Actor_3");
        assert_eq!(name.number(), 4);
        assert_eq!(name.plain(), "Actor");
        assert_eq!(name.to_string(), "Actor_3");
        assert_eq!(break_down_name("Actor_03"), ("Actor_03", 0));
        assert_eq!(break_down_name("Actor_"), ("Actor_", 0));
        assert_eq!(FName::new("Actor_0").to_string(), "Actor_0");
    }
}
