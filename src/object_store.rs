//! Minimal in-memory object model the linker binds packages to.
//!
//! Objects live in an arena and refer to each other through generational
//! [`ObjectRef`] handles, so outer/archetype/cross-level cycles need no
//! ownership. The store knows just enough about classes to resolve
//! `IsA`, default objects and which body layout an object uses.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use anyhow::{Result, bail};
use bitflags::bitflags;

use crate::FGuid;
use crate::LinkerId;
use crate::error::LinkerError;
use crate::name_map::*;
use crate::resources::{EObjectFlags, EPackageFlags, FLevelGuids, FObjectThumbnail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    index: u32,
    serial: u32,
}
impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.serial)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EClassFlags: u32 {
        const ABSTRACT = 0x0000_0001;
        const COMPILED = 0x0000_0002;
        const CONFIG = 0x0000_0004;
        const TRANSIENT = 0x0000_0008;
        const LOCALIZED = 0x0000_0020;
        const NATIVE = 0x0000_0080;
        const DEPRECATED = 0x0000_2000;
        const INTRINSIC = 0x1000_0000;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int(i32),
    Float(f32),
    Name(FName),
    Str(String),
    Object(Option<ObjectRef>),
    /// Object reference that may point into another level.
    CrossLevelObject(Option<ObjectRef>),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: FName,
    pub value: PropertyValue,
}
impl Property {
    pub fn new(name: impl Into<FName>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageData {
    pub package_flags: EPackageFlags,
    pub folder_name: String,
    pub guid: FGuid,
    pub import_guids: Vec<FLevelGuids>,
    /// Objects of this level reachable through cross-level references.
    pub export_guids: HashMap<FGuid, ObjectRef>,
    pub generation_net_object_count: Vec<i32>,
    pub fully_loaded: bool,
    pub dirty: bool,
    pub allow_lazy_loading: bool,
    pub user_created: bool,
    pub thumbnails: BTreeMap<String, FObjectThumbnail>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructData {
    pub super_struct: Option<ObjectRef>,
    pub script: Vec<u8>,
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassData {
    pub base: StructData,
    pub class_flags: EClassFlags,
    pub default_object: Option<ObjectRef>,
    /// Set once the class is bound to its runtime constructor.
    pub bound: bool,
    pub constructor: Option<String>,
    pub needs_property_link: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectData {
    Package(PackageData),
    Class(ClassData),
    Struct(StructData),
    Enum(Vec<FName>),
    Redirector { destination: Option<ObjectRef> },
    Generic(Vec<Property>),
}

/// Which body layout objects of a class use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Package,
    Class,
    Struct,
    Enum,
    Redirector,
    Generic,
}

#[derive(Debug, Clone)]
pub struct UObject {
    pub name: FName,
    pub class: ObjectRef,
    pub outer: Option<ObjectRef>,
    pub archetype: Option<ObjectRef>,
    pub flags: EObjectFlags,
    pub linker: Option<LinkerId>,
    pub linker_index: Option<usize>,
    pub data: ObjectData,
}
impl UObject {
    pub fn package(&self) -> Option<&PackageData> {
        match &self.data {
            ObjectData::Package(p) => Some(p),
            _ => None,
        }
    }
    pub fn package_mut(&mut self) -> Option<&mut PackageData> {
        match &mut self.data {
            ObjectData::Package(p) => Some(p),
            _ => None,
        }
    }
    pub fn class_data(&self) -> Option<&ClassData> {
        match &self.data {
            ObjectData::Class(c) => Some(c),
            _ => None,
        }
    }
    pub fn class_data_mut(&mut self) -> Option<&mut ClassData> {
        match &mut self.data {
            ObjectData::Class(c) => Some(c),
            _ => None,
        }
    }
    pub fn struct_data(&self) -> Option<&StructData> {
        match &self.data {
            ObjectData::Class(c) => Some(&c.base),
            ObjectData::Struct(s) => Some(s),
            _ => None,
        }
    }
    pub fn struct_data_mut(&mut self) -> Option<&mut StructData> {
        match &mut self.data {
            ObjectData::Class(c) => Some(&mut c.base),
            ObjectData::Struct(s) => Some(s),
            _ => None,
        }
    }
    pub fn properties(&self) -> &[Property] {
        match &self.data {
            ObjectData::Generic(props) => props,
            ObjectData::Class(c) => &c.base.properties,
            ObjectData::Struct(s) => &s.properties,
            _ => &[],
        }
    }
    pub fn properties_mut(&mut self) -> Option<&mut Vec<Property>> {
        match &mut self.data {
            ObjectData::Generic(props) => Some(props),
            ObjectData::Class(c) => Some(&mut c.base.properties),
            ObjectData::Struct(s) => Some(&mut s.properties),
            _ => None,
        }
    }
    pub fn has_any_flags(&self, flags: EObjectFlags) -> bool {
        self.flags.intersects(flags)
    }
}

/// Handles of the classes every store starts out with.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub core: ObjectRef,
    pub object: ObjectRef,
    pub field: ObjectRef,
    pub struct_: ObjectRef,
    pub function: ObjectRef,
    pub state: ObjectRef,
    pub class: ObjectRef,
    pub enum_: ObjectRef,
    pub property: ObjectRef,
    pub package: ObjectRef,
    pub redirector: ObjectRef,
    pub level: ObjectRef,
}

struct Slot {
    serial: u32,
    object: Option<UObject>,
}

pub struct ObjectStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_outer: HashMap<(Option<ObjectRef>, FName), Vec<ObjectRef>>,
    by_name: HashMap<FName, Vec<ObjectRef>>,
    core: CoreClasses,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        let placeholder = ObjectRef { index: 0, serial: 0 };
        let mut store = ObjectStore {
            slots: vec![],
            free: vec![],
            by_outer: HashMap::new(),
            by_name: HashMap::new(),
            core: CoreClasses {
                core: placeholder,
                object: placeholder,
                field: placeholder,
                struct_: placeholder,
                function: placeholder,
                state: placeholder,
                class: placeholder,
                enum_: placeholder,
                property: placeholder,
                package: placeholder,
                redirector: placeholder,
                level: placeholder,
            },
        };
        store.bootstrap();
        store
    }

    fn bootstrap(&mut self) {
        let intrinsic = EObjectFlags::PUBLIC | EObjectFlags::NATIVE | EObjectFlags::STANDALONE | EObjectFlags::ROOT_SET;
        // Class is its own class; patched to point at itself after insertion
        let class = self.insert(UObject {
            name: NAME_CLASS,
            class: ObjectRef { index: 0, serial: 0 },
            outer: None,
            archetype: None,
            flags: intrinsic,
            linker: None,
            linker_index: None,
            data: ObjectData::Class(ClassData {
                class_flags: EClassFlags::NATIVE | EClassFlags::INTRINSIC,
                bound: true,
                constructor: Some("Class".into()),
                ..Default::default()
            }),
        });
        if let Some(obj) = self.slot_mut(class) {
            obj.class = class;
        }
        self.core.class = class;

        let package = self.insert_intrinsic_class(NAME_PACKAGE, None, None);
        self.core.package = package;
        let core = self.insert(UObject {
            name: NAME_CORE,
            class: package,
            outer: None,
            archetype: None,
            flags: EObjectFlags::PUBLIC | EObjectFlags::ROOT_SET,
            linker: None,
            linker_index: None,
            data: ObjectData::Package(PackageData::default()),
        });
        self.core.core = core;
        // reparent the two classes created before Core existed
        self.reparent(class, Some(core));
        self.reparent(package, Some(core));

        let object = self.insert_intrinsic_class(NAME_OBJECT, Some(core), None);
        let field = self.insert_intrinsic_class(NAME_FIELD, Some(core), Some(object));
        let struct_ = self.insert_intrinsic_class(NAME_STRUCT, Some(core), Some(field));
        let function = self.insert_intrinsic_class(NAME_FUNCTION, Some(core), Some(struct_));
        let state = self.insert_intrinsic_class(NAME_STATE, Some(core), Some(struct_));
        let enum_ = self.insert_intrinsic_class(NAME_ENUM, Some(core), Some(field));
        let property = self.insert_intrinsic_class(NAME_PROPERTY, Some(core), Some(field));
        let redirector = self.insert_intrinsic_class(NAME_OBJECT_REDIRECTOR, Some(core), Some(object));
        let level = self.insert_intrinsic_class(NAME_LEVEL, Some(core), Some(object));
        self.set_super(class, Some(state));
        self.set_super(package, Some(object));
        self.core = CoreClasses {
            core,
            object,
            field,
            struct_,
            function,
            state,
            class,
            enum_,
            property,
            package,
            redirector,
            level,
        };
    }

    fn insert_intrinsic_class(&mut self, name: FName, outer: Option<ObjectRef>, super_struct: Option<ObjectRef>) -> ObjectRef {
        self.insert(UObject {
            name,
            class: self.core.class,
            outer,
            archetype: None,
            flags: EObjectFlags::PUBLIC | EObjectFlags::NATIVE | EObjectFlags::STANDALONE | EObjectFlags::ROOT_SET,
            linker: None,
            linker_index: None,
            data: ObjectData::Class(ClassData {
                base: StructData {
                    super_struct,
                    ..Default::default()
                },
                class_flags: EClassFlags::NATIVE | EClassFlags::INTRINSIC,
                bound: true,
                constructor: Some(name.to_string()),
                ..Default::default()
            }),
        })
    }

    fn set_super(&mut self, class: ObjectRef, super_struct: Option<ObjectRef>) {
        if let Some(data) = self.slot_mut(class).and_then(|o| o.struct_data_mut()) {
            data.super_struct = super_struct;
        }
    }

    fn reparent(&mut self, obj: ObjectRef, outer: Option<ObjectRef>) {
        let Some(name) = self.slot(obj).map(|o| o.name) else {
            return;
        };
        let old_outer = self.slot(obj).and_then(|o| o.outer);
        if let Some(list) = self.by_outer.get_mut(&(old_outer, name)) {
            list.retain(|r| *r != obj);
        }
        self.by_outer.entry((outer, name)).or_default().push(obj);
        if let Some(o) = self.slot_mut(obj) {
            o.outer = outer;
        }
    }

    fn insert(&mut self, object: UObject) -> ObjectRef {
        let key = (object.outer, object.name);
        let name = object.name;
        let r = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            ObjectRef {
                index,
                serial: slot.serial,
            }
        } else {
            self.slots.push(Slot {
                serial: 1,
                object: Some(object),
            });
            ObjectRef {
                index: self.slots.len() as u32 - 1,
                serial: 1,
            }
        };
        self.by_outer.entry(key).or_default().push(r);
        self.by_name.entry(name).or_default().push(r);
        r
    }

    fn slot(&self, r: ObjectRef) -> Option<&UObject> {
        self.slots
            .get(r.index as usize)
            .filter(|s| s.serial == r.serial)
            .and_then(|s| s.object.as_ref())
    }
    fn slot_mut(&mut self, r: ObjectRef) -> Option<&mut UObject> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|s| s.serial == r.serial)
            .and_then(|s| s.object.as_mut())
    }

    pub fn core(&self) -> &CoreClasses {
        &self.core
    }
    pub fn is_alive(&self, r: ObjectRef) -> bool {
        self.slot(r).is_some()
    }
    pub fn get(&self, r: ObjectRef) -> Result<&UObject> {
        Ok(self.slot(r).ok_or(LinkerError::StaleObject)?)
    }
    pub fn get_mut(&mut self, r: ObjectRef) -> Result<&mut UObject> {
        Ok(self.slot_mut(r).ok_or(LinkerError::StaleObject)?)
    }
    pub fn name(&self, r: ObjectRef) -> FName {
        self.slot(r).map(|o| o.name).unwrap_or(NAME_NONE)
    }
    pub fn class_of(&self, r: ObjectRef) -> Option<ObjectRef> {
        self.slot(r).map(|o| o.class)
    }
    pub fn outer_of(&self, r: ObjectRef) -> Option<ObjectRef> {
        self.slot(r).and_then(|o| o.outer)
    }
    pub fn flags(&self, r: ObjectRef) -> EObjectFlags {
        self.slot(r).map(|o| o.flags).unwrap_or_default()
    }
    pub fn set_flags(&mut self, r: ObjectRef, flags: EObjectFlags) {
        if let Some(o) = self.slot_mut(r) {
            o.flags |= flags;
        }
    }
    pub fn clear_flags(&mut self, r: ObjectRef, flags: EObjectFlags) {
        if let Some(o) = self.slot_mut(r) {
            o.flags &= !flags;
        }
    }
    pub fn iter(&self) -> impl Iterator<Item = (ObjectRef, &UObject)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.object.as_ref().map(|o| {
                (
                    ObjectRef {
                        index: i as u32,
                        serial: s.serial,
                    },
                    o,
                )
            })
        })
    }

    /// Top-most outer, the package an object lives in.
    pub fn outermost(&self, r: ObjectRef) -> ObjectRef {
        let mut current = r;
        while let Some(outer) = self.outer_of(current) {
            current = outer;
        }
        current
    }

    pub fn super_struct(&self, r: ObjectRef) -> Option<ObjectRef> {
        self.slot(r).and_then(|o| o.struct_data()).and_then(|s| s.super_struct)
    }

    pub fn is_child_of(&self, class: ObjectRef, parent: ObjectRef) -> bool {
        let mut current = Some(class);
        let mut steps = 0;
        while let Some(c) = current {
            if c == parent {
                return true;
            }
            steps += 1;
            if steps > 256 {
                return false;
            }
            current = self.super_struct(c);
        }
        false
    }
    pub fn is_a(&self, obj: ObjectRef, class: ObjectRef) -> bool {
        self.class_of(obj).is_some_and(|c| self.is_child_of(c, class))
    }
    pub fn is_class(&self, obj: ObjectRef) -> bool {
        self.is_a(obj, self.core.class)
    }
    pub fn is_package(&self, obj: ObjectRef) -> bool {
        self.class_of(obj) == Some(self.core.package)
    }
    pub fn class_flags(&self, class: ObjectRef) -> EClassFlags {
        self.slot(class).and_then(|o| o.class_data()).map(|c| c.class_flags).unwrap_or_default()
    }
    pub fn is_intrinsic(&self, class: ObjectRef) -> bool {
        self.class_flags(class).contains(EClassFlags::INTRINSIC)
    }

    pub fn data_kind(&self, class: ObjectRef) -> DataKind {
        let core = self.core;
        if self.is_child_of(class, core.class) {
            DataKind::Class
        } else if self.is_child_of(class, core.struct_) {
            DataKind::Struct
        } else if self.is_child_of(class, core.enum_) {
            DataKind::Enum
        } else if self.is_child_of(class, core.redirector) {
            DataKind::Redirector
        } else if self.is_child_of(class, core.package) {
            DataKind::Package
        } else {
            DataKind::Generic
        }
    }

    /// Path such as `Pkg.Group.Object:Subobject`.
    pub fn path_name(&self, r: ObjectRef) -> String {
        let Some(obj) = self.slot(r) else {
            return "None".into();
        };
        match obj.outer {
            None => obj.name.to_string(),
            Some(outer) => {
                let outer_is_package = self.is_package(outer);
                let outer_outer_is_package = self.outer_of(outer).is_none_or(|oo| self.is_package(oo));
                let delimiter = if !outer_is_package && outer_outer_is_package { ":" } else { "." };
                format!("{}{delimiter}{}", self.path_name(outer), obj.name)
            }
        }
    }
    pub fn full_name(&self, r: ObjectRef) -> String {
        let class = self.class_of(r).map(|c| self.name(c)).unwrap_or(NAME_NONE);
        format!("{class} {}", self.path_name(r))
    }

    /// Find an object by outer and name. `class` filters with `IsA`, or
    /// exact class equality when `exact_class` is set.
    pub fn find_object(&self, class: Option<ObjectRef>, outer: Option<ObjectRef>, name: FName, exact_class: bool) -> Option<ObjectRef> {
        self.by_outer
            .get(&(outer, name))?
            .iter()
            .copied()
            .find(|&r| self.class_matches(r, class, exact_class))
    }
    /// Find an object by name in any package.
    pub fn find_object_any_package(&self, class: Option<ObjectRef>, name: FName, exact_class: bool) -> Option<ObjectRef> {
        self.by_name
            .get(&name)?
            .iter()
            .copied()
            .find(|&r| self.class_matches(r, class, exact_class))
    }
    pub fn find_object_fast(
        &self,
        class: Option<ObjectRef>,
        outer: Option<ObjectRef>,
        name: FName,
        exact_class: bool,
        any_package: bool,
    ) -> Option<ObjectRef> {
        if any_package {
            self.find_object_any_package(class, name, exact_class)
        } else {
            self.find_object(class, outer, name, exact_class)
        }
    }
    fn class_matches(&self, r: ObjectRef, class: Option<ObjectRef>, exact: bool) -> bool {
        let Some(obj) = self.slot(r) else {
            return false;
        };
        if obj.flags.contains(EObjectFlags::PENDING_KILL) {
            return false;
        }
        match class {
            None => true,
            Some(c) if exact => obj.class == c,
            Some(c) => self.is_child_of(obj.class, c),
        }
    }

    /// Find a class by name in any package.
    pub fn find_class(&self, name: FName) -> Option<ObjectRef> {
        self.find_object_any_package(Some(self.core.class), name, false)
    }

    /// Find or create a top-level package.
    pub fn create_package(&mut self, outer: Option<ObjectRef>, name: FName) -> Result<ObjectRef> {
        if name.is_none() {
            bail!("attempted to create a package named None");
        }
        if let Some(existing) = self.find_object(Some(self.core.package), outer, name, true) {
            return Ok(existing);
        }
        let package = self.core.package;
        Ok(self.insert(UObject {
            name,
            class: package,
            outer,
            archetype: None,
            flags: EObjectFlags::PUBLIC,
            linker: None,
            linker_index: None,
            data: ObjectData::Package(PackageData {
                allow_lazy_loading: true,
                folder_name: "None".into(),
                ..Default::default()
            }),
        }))
    }

    pub fn default_data(&self, class: ObjectRef) -> ObjectData {
        match self.data_kind(class) {
            DataKind::Package => ObjectData::Package(PackageData {
                allow_lazy_loading: true,
                ..Default::default()
            }),
            DataKind::Class => ObjectData::Class(ClassData::default()),
            DataKind::Struct => ObjectData::Struct(StructData::default()),
            DataKind::Enum => ObjectData::Enum(vec![]),
            DataKind::Redirector => ObjectData::Redirector { destination: None },
            DataKind::Generic => ObjectData::Generic(vec![]),
        }
    }

    /// Create an object, or reinitialize the existing one with the same
    /// outer and name in place so outstanding handles stay valid.
    pub fn construct_object(
        &mut self,
        class: ObjectRef,
        outer: Option<ObjectRef>,
        name: FName,
        flags: EObjectFlags,
        template: Option<ObjectRef>,
    ) -> Result<ObjectRef> {
        let mut data = self.default_data(class);
        if let (Some(template), ObjectData::Generic(props)) = (template, &mut data) {
            props.extend_from_slice(self.get(template)?.properties());
        }
        if let Some(existing) = self.find_object(None, outer, name, false) {
            let obj = self.get_mut(existing)?;
            obj.class = class;
            obj.flags = flags;
            obj.archetype = template;
            obj.data = data;
            obj.linker = None;
            obj.linker_index = None;
            return Ok(existing);
        }
        Ok(self.insert(UObject {
            name,
            class,
            outer,
            archetype: template,
            flags,
            linker: None,
            linker_index: None,
            data,
        }))
    }

    /// Register a host-provided native class in `package`.
    pub fn register_native_class(
        &mut self,
        package: FName,
        name: FName,
        super_class: Option<ObjectRef>,
        class_flags: EClassFlags,
    ) -> Result<ObjectRef> {
        let package = self.create_package(None, package)?;
        self.set_flags(package, EObjectFlags::ROOT_SET);
        let class = self.core.class;
        let r = self.construct_object(
            class,
            Some(package),
            name,
            EObjectFlags::PUBLIC | EObjectFlags::NATIVE | EObjectFlags::STANDALONE | EObjectFlags::ROOT_SET,
            None,
        )?;
        let core_object = self.core.object;
        if let Some(data) = self.get_mut(r)?.class_data_mut() {
            data.base.super_struct = super_class.or(Some(core_object));
            data.class_flags = class_flags | EClassFlags::NATIVE;
            data.bound = true;
            data.constructor = Some(name.to_string());
        }
        Ok(r)
    }

    /// The class default object, created on first use for classes that don't
    /// have one yet.
    pub fn class_default_object(&mut self, class: ObjectRef) -> Result<ObjectRef> {
        if let Some(cdo) = self.get(class)?.class_data().and_then(|c| c.default_object) {
            if self.is_alive(cdo) {
                return Ok(cdo);
            }
        }
        let parent = match self.super_struct(class) {
            Some(parent) if parent != class => Some(self.class_default_object(parent)?),
            _ => None,
        };
        let name = FName::new(&format!("Default__{}", self.name(class)));
        let outer = self.outer_of(class);
        let cdo = self.construct_object(
            class,
            outer,
            name,
            EObjectFlags::CLASS_DEFAULT_OBJECT | EObjectFlags::PUBLIC,
            parent,
        )?;
        if let Some(data) = self.get_mut(class)?.class_data_mut() {
            data.default_object = Some(cdo);
        }
        Ok(cdo)
    }

    /// Remove an object. Handles to it go stale.
    pub fn destroy(&mut self, r: ObjectRef) -> Option<UObject> {
        let slot = self.slots.get_mut(r.index as usize).filter(|s| s.serial == r.serial)?;
        let object = slot.object.take()?;
        slot.serial = slot.serial.wrapping_add(1);
        self.free.push(r.index);
        if let Some(list) = self.by_outer.get_mut(&(object.outer, object.name)) {
            list.retain(|o| *o != r);
        }
        if let Some(list) = self.by_name.get_mut(&object.name) {
            list.retain(|o| *o != r);
        }
        Some(object)
    }

    /// Destroy every object whose outermost is `package`, including the
    /// package itself.
    pub fn destroy_package(&mut self, package: ObjectRef) -> Vec<ObjectRef> {
        let doomed: Vec<ObjectRef> = self
            .iter()
            .map(|(r, _)| r)
            .filter(|&r| self.outermost(r) == package)
            .collect();
        for &r in &doomed {
            self.destroy(r);
        }
        doomed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_intrinsic_hierarchy() {
        let store = ObjectStore::new();
        let core = *store.core();
        assert!(store.is_class(core.class));
        assert!(store.is_child_of(core.class, core.struct_));
        assert!(store.is_child_of(core.function, core.field));
        assert_eq!(store.path_name(core.redirector), "Core.ObjectRedirector");
        assert_eq!(store.find_class(NAME_PACKAGE), Some(core.package));
        assert_eq!(store.data_kind(core.class), DataKind::Class);
        assert_eq!(store.data_kind(core.object), DataKind::Generic);
    }

    #[test]
    fn test_subobject_path_and_stale_handles() -> Result<()> {
        let mut store = ObjectStore::new();
        let object = store.core().object;
        let pkg = store.create_package(None, FName::new("Map"))?;
        let group = store.create_package(Some(pkg), FName::new("Group"))?;
        let actor = store.construct_object(object, Some(group), FName::new("Actor_1"), EObjectFlags::PUBLIC, None)?;
        let comp = store.construct_object(object, Some(actor), FName::new("Comp"), EObjectFlags::empty(), None)?;
        assert_eq!(store.path_name(comp), "Map.Group.Actor_1:Comp");
        assert_eq!(store.full_name(actor), "Object Map.Group.Actor_1");

        store.destroy_package(pkg);
        assert!(store.get(comp).is_err());
        let again = store.create_package(None, FName::new("Map"))?;
        assert_ne!(again, pkg);
        Ok(())
    }

    #[test]
    fn test_construct_copies_template_and_reuses_slot() -> Result<()> {
        let mut store = ObjectStore::new();
        let object = store.core().object;
        let pkg = store.create_package(None, FName::new("P"))?;
        let template = store.construct_object(object, Some(pkg), FName::new("T"), EObjectFlags::ARCHETYPE_OBJECT, None)?;
        store
            .get_mut(template)?
            .properties_mut()
            .unwrap()
            .push(Property::new("Health", PropertyValue::Int(100)));
        let a = store.construct_object(object, Some(pkg), FName::new("A"), EObjectFlags::empty(), Some(template))?;
        assert_eq!(store.get(a)?.properties(), &[Property::new("Health", PropertyValue::Int(100))][..]);

        let b = store.construct_object(object, Some(pkg), FName::new("A"), EObjectFlags::PUBLIC, None)?;
        assert_eq!(a, b);
        assert!(store.get(a)?.properties().is_empty());
        Ok(())
    }

    #[test]
    fn test_class_default_object_chain() -> Result<()> {
        let mut store = ObjectStore::new();
        let object = store.core().object;
        let base = store.register_native_class(FName::new("Engine"), FName::new("Actor"), None, EClassFlags::empty())?;
        let child = store.register_native_class(FName::new("Engine"), FName::new("Pawn"), Some(base), EClassFlags::empty())?;
        let cdo = store.class_default_object(child)?;
        assert_eq!(store.path_name(cdo), "Engine.Default__Pawn");
        let parent_cdo = store.get(cdo)?.archetype.unwrap();
        assert_eq!(store.name(parent_cdo).to_string(), "Default__Actor");
        assert!(store.is_a(cdo, object));
        Ok(())
    }

    #[test]
    fn test_native_class_defaults_to_object_super() -> Result<()> {
        let mut store = ObjectStore::new();
        let object = store.core().object;
        let class = store.register_native_class(FName::new("Engine"), FName::new("Actor"), None, EClassFlags::ABSTRACT)?;
        assert_eq!(store.super_struct(class), Some(object));
        let data = store.get(class)?.class_data().unwrap();
        assert_eq!(data.class_flags, EClassFlags::ABSTRACT | EClassFlags::NATIVE);
        assert!(data.bound);
        Ok(())
    }
}
