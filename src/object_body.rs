//! Per-kind object body layouts.
//!
//! Every object body is a fixed descriptor for its [`DataKind`]. Object and
//! name references go through the archive so the same code drives loading,
//! saving and the save-time reference collection pass.

use anyhow::{Result, bail};
use tracing::instrument;

use crate::name_map::{FName, NAME_NONE};
use crate::object_store::{ObjectData, ObjectRef, Property, PropertyValue};
use crate::ser::*;

/// Archive an object body is read from.
pub trait BodyArchive: ArchiveRead {
    fn read_object(&mut self) -> Result<Option<ObjectRef>>;
    /// Reference that may be a cross-level token. `slot` is the index of the
    /// property being read in the owning object's property list.
    fn read_cross_level_object(&mut self, slot: usize) -> Result<Option<ObjectRef>>;
    fn read_name(&mut self) -> Result<FName>;
}

/// Archive an object body is written to.
pub trait BodyArchiveWrite: ArchiveWrite {
    fn write_object(&mut self, object: Option<ObjectRef>) -> Result<()>;
    fn write_cross_level_object(&mut self, object: Option<ObjectRef>) -> Result<()>;
    fn write_name(&mut self, name: FName) -> Result<()>;
}

const TAG_INT: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_NAME: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_OBJECT: u8 = 4;
const TAG_CROSS_LEVEL_OBJECT: u8 = 5;
const TAG_BYTES: u8 = 6;

/// Read tagged properties up to the terminating `None`, merging them over
/// `props` (which starts out as the archetype's values).
#[instrument(skip_all)]
pub fn read_properties<A: BodyArchive>(ar: &mut A, props: &mut Vec<Property>) -> Result<()> {
    loop {
        let name = ar.read_name()?;
        if name.is_none() {
            break;
        }
        let slot = props.iter().position(|p| p.name == name).unwrap_or(props.len());
        let tag: u8 = ar.de()?;
        let value = match tag {
            TAG_INT => PropertyValue::Int(ar.de()?),
            TAG_FLOAT => PropertyValue::Float(ar.de()?),
            TAG_NAME => PropertyValue::Name(ar.read_name()?),
            TAG_STR => PropertyValue::Str(ar.de()?),
            TAG_OBJECT => PropertyValue::Object(ar.read_object()?),
            TAG_CROSS_LEVEL_OBJECT => PropertyValue::CrossLevelObject(ar.read_cross_level_object(slot)?),
            TAG_BYTES => PropertyValue::Bytes(ar.de()?),
            _ => bail!("unknown property tag {tag} for {name}"),
        };
        let property = Property { name, value };
        if slot < props.len() {
            props[slot] = property;
        } else {
            props.push(property);
        }
    }
    Ok(())
}

pub fn write_properties<A: BodyArchiveWrite>(ar: &mut A, props: &[Property]) -> Result<()> {
    for prop in props {
        ar.write_name(prop.name)?;
        match &prop.value {
            PropertyValue::Int(v) => {
                ar.ser(&TAG_INT)?;
                ar.ser(v)?;
            }
            PropertyValue::Float(v) => {
                ar.ser(&TAG_FLOAT)?;
                ar.ser(v)?;
            }
            PropertyValue::Name(v) => {
                ar.ser(&TAG_NAME)?;
                ar.write_name(*v)?;
            }
            PropertyValue::Str(v) => {
                ar.ser(&TAG_STR)?;
                ar.ser(v)?;
            }
            PropertyValue::Object(v) => {
                ar.ser(&TAG_OBJECT)?;
                ar.write_object(*v)?;
            }
            PropertyValue::CrossLevelObject(v) => {
                ar.ser(&TAG_CROSS_LEVEL_OBJECT)?;
                ar.write_cross_level_object(*v)?;
            }
            PropertyValue::Bytes(v) => {
                ar.ser(&TAG_BYTES)?;
                ar.ser(v)?;
            }
        }
    }
    ar.write_name(NAME_NONE)
}

/// Deserialize a body into `data`, whose variant selects the layout.
#[instrument(skip_all, name = "read_body")]
pub fn read_body<A: BodyArchive>(ar: &mut A, data: &mut ObjectData) -> Result<()> {
    match data {
        ObjectData::Package(_) => {}
        ObjectData::Struct(s) => {
            s.script = ar.de()?;
            read_properties(ar, &mut s.properties)?;
        }
        ObjectData::Class(c) => {
            c.base.script = ar.de()?;
            read_properties(ar, &mut c.base.properties)?;
            c.class_flags = crate::object_store::EClassFlags::from_bits_retain(ar.de()?);
            c.default_object = ar.read_object()?;
        }
        ObjectData::Enum(names) => {
            let count = read_count(ar)?;
            *names = read_array(count, ar, |ar| ar.read_name())?;
        }
        ObjectData::Redirector { destination } => {
            *destination = ar.read_object()?;
        }
        ObjectData::Generic(props) => read_properties(ar, props)?,
    }
    Ok(())
}

pub fn write_body<A: BodyArchiveWrite>(ar: &mut A, data: &ObjectData) -> Result<()> {
    match data {
        ObjectData::Package(_) => {}
        ObjectData::Struct(s) => {
            ar.ser(&s.script)?;
            write_properties(ar, &s.properties)?;
        }
        ObjectData::Class(c) => {
            ar.ser(&c.base.script)?;
            write_properties(ar, &c.base.properties)?;
            ar.ser(&c.class_flags.bits())?;
            ar.write_object(c.default_object)?;
        }
        ObjectData::Enum(names) => {
            ar.ser(&(names.len() as i32))?;
            for name in names {
                ar.write_name(*name)?;
            }
        }
        ObjectData::Redirector { destination } => ar.write_object(*destination)?,
        ObjectData::Generic(props) => write_properties(ar, props)?,
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object_store::{ClassData, ObjectStore, StructData};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    /// Encodes object handles as their position in a table and names as
    /// inline strings.
    struct TableArchive {
        inner: Archive<Cursor<Vec<u8>>>,
        objects: Vec<ObjectRef>,
        cross_level_slots: Vec<usize>,
    }
    impl std::io::Read for TableArchive {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }
    impl std::io::Write for TableArchive {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    impl ArchiveState for TableArchive {
        fn byte_swapping(&self) -> bool {
            self.inner.byte_swapping()
        }
        fn set_byte_swapping(&mut self, swap: bool) {
            self.inner.set_byte_swapping(swap)
        }
        fn ver(&self) -> i32 {
            self.inner.ver()
        }
        fn licensee_ver(&self) -> i32 {
            self.inner.licensee_ver()
        }
        fn set_ver(&mut self, ver: i32, licensee_ver: i32) {
            self.inner.set_ver(ver, licensee_ver)
        }
    }
    impl BodyArchive for TableArchive {
        fn read_object(&mut self) -> Result<Option<ObjectRef>> {
            let index: i32 = self.de()?;
            Ok(usize::try_from(index).ok().and_then(|i| self.objects.get(i).copied()))
        }
        fn read_cross_level_object(&mut self, slot: usize) -> Result<Option<ObjectRef>> {
            self.cross_level_slots.push(slot);
            self.read_object()
        }
        fn read_name(&mut self) -> Result<FName> {
            let s: String = self.de()?;
            Ok(FName::new(&s))
        }
    }
    impl BodyArchiveWrite for TableArchive {
        fn write_object(&mut self, object: Option<ObjectRef>) -> Result<()> {
            let index = object
                .and_then(|o| self.objects.iter().position(|x| *x == o))
                .map(|i| i as i32)
                .unwrap_or(-1);
            self.ser(&index)
        }
        fn write_cross_level_object(&mut self, object: Option<ObjectRef>) -> Result<()> {
            self.write_object(object)
        }
        fn write_name(&mut self, name: FName) -> Result<()> {
            self.ser(&name.to_string())
        }
    }

    fn archive(objects: Vec<ObjectRef>) -> TableArchive {
        TableArchive {
            inner: Archive::new(Cursor::new(vec![])),
            objects,
            cross_level_slots: vec![],
        }
    }

    #[test]
    fn test_properties_merge_over_archetype() -> Result<()> {
        let store = ObjectStore::new();
        let core = *store.core();
        let mut ar = archive(vec![core.object, core.class]);
        write_properties(
            &mut ar,
            &[
                Property::new("Health", PropertyValue::Int(5)),
                Property::new("Target", PropertyValue::CrossLevelObject(Some(core.class))),
            ],
        )?;
        ar.inner.get_mut().set_position(0);

        let mut props = vec![
            Property::new("Speed", PropertyValue::Float(1.5)),
            Property::new("Health", PropertyValue::Int(100)),
        ];
        read_properties(&mut ar, &mut props)?;
        assert_eq!(
            props,
            vec![
                Property::new("Speed", PropertyValue::Float(1.5)),
                Property::new("Health", PropertyValue::Int(5)),
                Property::new("Target", PropertyValue::CrossLevelObject(Some(core.class))),
            ]
        );
        assert_eq!(ar.cross_level_slots, vec![2]);
        Ok(())
    }

    #[test]
    fn test_class_body() -> Result<()> {
        let store = ObjectStore::new();
        let core = *store.core();
        let class = ObjectData::Class(ClassData {
            base: StructData {
                script: vec![0x0b, 0x53],
                ..Default::default()
            },
            class_flags: crate::object_store::EClassFlags::CONFIG,
            default_object: Some(core.object),
            ..Default::default()
        });
        let mut ar = archive(vec![core.object]);
        write_body(&mut ar, &class)?;
        ar.inner.get_mut().set_position(0);

        let mut read = ObjectData::Class(ClassData {
            bound: true,
            ..Default::default()
        });
        read_body(&mut ar, &mut read)?;
        let ObjectData::Class(c) = read else { unreachable!() };
        assert_eq!(c.base.script, vec![0x0b, 0x53]);
        assert_eq!(c.default_object, Some(core.object));
        assert!(c.bound);
        Ok(())
    }

    #[test]
    fn test_unknown_tag() {
        let mut ar = archive(vec![]);
        ar.ser(&"Broken").unwrap();
        ar.ser(&42u8).unwrap();
        ar.inner.get_mut().set_position(0);
        assert!(read_properties(&mut ar, &mut vec![]).is_err());
    }
}
