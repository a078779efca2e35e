//! Descriptor tables for the libraries the corpus exercises, embedded at
//! build time.

use crate::descriptor::{DescriptorError, LibraryDescriptor, Model};

const BUNDLED: &[(&str, &str)] = &[
    ("zlib", include_str!("../descriptors/zlib.toml")),
    ("sqlite", include_str!("../descriptors/sqlite.toml")),
    ("libpcap", include_str!("../descriptors/libpcap.toml")),
    ("cjson", include_str!("../descriptors/cjson.toml")),
    ("re2", include_str!("../descriptors/re2.toml")),
    ("lcms", include_str!("../descriptors/lcms.toml")),
];

pub fn names() -> impl Iterator<Item = &'static str> {
    BUNDLED.iter().map(|(name, _)| *name)
}

/// Raw TOML of a bundled descriptor.
pub fn source(name: &str) -> Option<&'static str> {
    BUNDLED
        .iter()
        .find(|(bundled, _)| bundled.eq_ignore_ascii_case(name))
        .map(|(_, text)| *text)
}

pub fn descriptor(name: &str) -> Result<LibraryDescriptor, DescriptorError> {
    let text = source(name).ok_or_else(|| DescriptorError::UnknownLibrary(name.to_string()))?;
    LibraryDescriptor::from_toml_str(text)
}

pub fn load(name: &str) -> Result<Model, DescriptorError> {
    descriptor(name)?.into_model()
}
