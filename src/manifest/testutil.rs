//! Shared helpers for tests that need manifests.  Building the text
//! form and parsing it back keeps the fixtures honest about the wire
//! format.

use super::structs::{FileRecord, FileKind, Lifecycle};
use super::{Manifest, Version};


/// A 64-char hash string of one repeated hex char.
pub(crate) fn hash(c: char) -> String
{
	assert!(c.is_ascii_hexdigit() && !c.is_uppercase());
	c.to_string().repeat(64)
}


/// MoM text for a version, from (bundle, last_change, manifest-hash).
pub(crate) fn mom_text(version: Version, bundles: &[(&str, Version, &str)])
		-> String
{
	let mut s = format!("MANIFEST\t1\nversion:\t{version}\n\n");
	for (name, lc, h) in bundles
	{
		s.push_str(&format!("M...\t{name}\t{lc}\t{h}\n"));
	}
	s
}


/// Bundle manifest text.  Lines are (flags, path, last_change, hash);
/// includes/also-add land in the header.
pub(crate) fn bundle_text(version: Version, includes: &[&str],
		also_add: &[&str], lines: &[(&str, &str, Version, &str)]) -> String
{
	let mut s = format!("MANIFEST\t1\nversion:\t{version}\n");
	for i in includes { s.push_str(&format!("includes:\t{i}\n")); }
	for a in also_add { s.push_str(&format!("also-add:\t{a}\n")); }
	s.push('\n');
	for (flags, path, lc, h) in lines
	{
		s.push_str(&format!("{flags}\t{path}\t{lc}\t{h}\n"));
	}
	s
}


/// Quick in-memory record.
pub(crate) fn rec(path: &str, kind: FileKind, state: Lifecycle,
		ver: Version, h: &str) -> FileRecord
{
	FileRecord {
		path: path.into(),
		kind, state,
		last_change: ver,
		hash: h.parse().unwrap(),
		..Default::default()
	}
}


/// And a quick in-memory manifest from records.
pub(crate) fn mf(version: Version, recs: Vec<FileRecord>) -> Manifest
{
	let mut m = Manifest::default();
	m.header.format = 1;
	m.header.version = version;
	m.files = recs;
	m.sort_files();
	m
}
