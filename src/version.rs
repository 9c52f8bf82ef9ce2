//! Package file versions understood by the linker.

pub const PACKAGE_FILE_TAG: u32 = 0x9E2A83C1;
pub const PACKAGE_FILE_TAG_SWAPPED: u32 = 0xC1832A9E;

pub const VER_MIN_PACKAGE: i32 = 491;
pub const VER_LATEST_ENGINE: i32 = 868;
pub const VER_LATEST_ENGINE_LICENSEE: i32 = 0;
pub const ENGINE_VERSION: i32 = 10897;
/// Cooker version stamped into cooked packages.
pub const VER_LATEST_COOKED_PACKAGE: i32 = 136;

pub const VER_ADDITIONAL_COOK_PACKAGE_SUMMARY: i32 = 516;
pub const VER_FIXED_PREFAB_SEQUENCES: i32 = 541;
pub const VER_REMOVED_COMPONENT_MAP: i32 = 543;
pub const VER_RECTANGULAR_THUMBNAILS: i32 = 582;
pub const VER_ASSET_THUMBNAILS_IN_PACKAGES: i32 = 584;
pub const VER_CONTENT_BROWSER_FULL_NAMES: i32 = 603;
pub const VER_ADDED_CROSSLEVEL_REFERENCES: i32 = 623;
pub const VER_TEXTURE_PREALLOCATION: i32 = 767;
pub const VER_FIXUP_MOBILEGAME_REFS: i32 = 826;
pub const VER_RENAME_MOBILEGAME_TO_SIMPLEGAME: i32 = 828;

/// Split a packed file version into `(engine, licensee)`.
pub fn split_file_version(packed: i32) -> (i32, i32) {
    (packed & 0xffff, (packed >> 16) & 0xffff)
}

pub fn pack_file_version(ver: i32, licensee: i32) -> i32 {
    (ver & 0xffff) | ((licensee & 0xffff) << 16)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_version_packing() {
        let packed = pack_file_version(VER_LATEST_ENGINE, 7);
        assert_eq!(split_file_version(packed), (VER_LATEST_ENGINE, 7));
        assert_eq!(PACKAGE_FILE_TAG.swap_bytes(), PACKAGE_FILE_TAG_SWAPPED);
    }
}
