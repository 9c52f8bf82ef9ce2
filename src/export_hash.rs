use crate::linker_load::LinkerLoad;
use crate::name_map::FName;

pub const EXPORT_HASH_COUNT: usize = 256;

/// Bucket for `(object name, class name, class package)`.
pub fn hash_names(object: FName, class: FName, package: FName) -> usize {
    let h = object.index().wrapping_add(class.index().wrapping_mul(7)).wrapping_add(package.index().wrapping_mul(31));
    h as usize & (EXPORT_HASH_COUNT - 1)
}

impl LinkerLoad {
    /// Thread every export into its bucket chain. Later exports end up at
    /// the head of their chain.
    pub(crate) fn build_export_hash(&mut self) {
        self.export_hash = [None; EXPORT_HASH_COUNT];
        for i in 0..self.export_map.len() {
            let bucket = hash_names(
                self.export_map[i].object_name,
                self.export_class_name(i),
                self.export_class_package(i),
            );
            self.export_map[i].hash_next = self.export_hash[bucket];
            self.export_hash[bucket] = Some(i);
        }
    }

    /// Exports in the bucket for the given triple, most recent first. The
    /// caller still has to compare names; the bucket is shared.
    pub fn export_hash_chain(&self, object: FName, class: FName, package: FName) -> ExportHashChain<'_> {
        ExportHashChain {
            linker: self,
            next: self.export_hash[hash_names(object, class, package)],
        }
    }

    /// Exact `(class, package, name)` match, optionally constrained to an
    /// outer package index.
    pub fn find_export_index_hashed(
        &self,
        class_name: FName,
        class_package: FName,
        object_name: FName,
        outer_index: Option<i32>,
    ) -> Option<usize> {
        self.export_hash_chain(object_name, class_name, class_package).find(|&i| {
            let export = &self.export_map[i];
            export.object_name == object_name
                && outer_index.is_none_or(|o| export.outer_index.0 == o)
                && self.export_class_package(i) == class_package
                && self.export_class_name(i) == class_name
        })
    }
}

pub struct ExportHashChain<'a> {
    linker: &'a LinkerLoad,
    next: Option<usize>,
}
impl Iterator for ExportHashChain<'_> {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.linker.export_map.get(current).and_then(|e| e.hash_next);
        Some(current)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::name_map::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hash_matches_reference_formula() {
        let (a, b, c) = (FName::new("Foo"), NAME_CLASS, NAME_CORE);
        let expected = (a.index() + 7 * b.index() + 31 * c.index()) as usize & 255;
        assert_eq!(hash_names(a, b, c), expected);
        // numbers don't change the bucket
        assert_eq!(hash_names(FName::with_number("Foo", 3), b, c), expected);
    }
}
