//! Manifest record structs.
//!
//! A record is one line of a manifest body.  The old-school encoding
//! packed everything into bitfields; we split it into what it really
//! is: a type, a lifecycle state, and an orthogonal pile of modifier
//! flags.  Sorting is by (path, deleted), and collections are keyed by
//! path, so the derives keep path first.

use std::path::{Path, PathBuf};

use crate::util::hash::Sha256Hash;
use super::Version;


/// What kind of thing a record describes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) enum FileKind
{
	#[default]
	File,
	Dir,
	Link,

	/// MoM entries: the "path" is a bundle name and the hash names the
	/// bundle manifest blob.
	Manifest,
}


/// Where a record is in its life.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) enum Lifecycle
{
	#[default]
	Live,

	/// Gone as of this record's last_change.  May carry a zeros hash.
	Deleted,

	/// Present on disk but no longer managed; never touch it.
	Ghosted,
}


/// The orthogonal modifier flags, limited to the ones that change
/// client behavior.  The wire format also carries mix and exported
/// marks; the parser accepts those and drops them, since nothing on
/// this side keys off them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct Modifier
{
	pub(crate) config: bool,
	pub(crate) state: bool,
	pub(crate) boot: bool,
	pub(crate) orphan: bool,
	pub(crate) experimental: bool,
}


/// One manifest line.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct FileRecord
{
	/// Absolute path (or bundle name, for Manifest records)
	pub(crate) path: PathBuf,

	/// Deleted sorts after live at the same path; consolidation
	/// depends on it, so keep this field second.
	pub(crate) state: Lifecycle,

	pub(crate) kind: FileKind,
	pub(crate) flags: Modifier,

	/// Version this record last changed at
	pub(crate) last_change: Version,

	/// Content hash; zeros means unknown/absent
	pub(crate) hash: Sha256Hash,
}


impl FileRecord
{
	pub(crate) fn is_deleted(&self) -> bool
	{ self.state == Lifecycle::Deleted }

	pub(crate) fn is_ghosted(&self) -> bool
	{ self.state == Lifecycle::Ghosted }

	pub(crate) fn is_live(&self) -> bool
	{ self.state == Lifecycle::Live }


	/// Build a record from what's on disk.  lstat-based; symlinks are
	/// seen as themselves.  The hash is left zeroed; hashing is a
	/// separate (and much more expensive) step the caller decides on.
	pub(crate) fn populate(relpath: &Path, ondisk: &Path)
			-> Result<Self, crate::util::fs::LstatErr>
	{
		use crate::util::fs;

		let st = fs::lstat(ondisk)?;
		let kind = match () {
			_ if st.is_dir()  => FileKind::Dir,
			_ if st.is_link() => FileKind::Link,
			_                 => FileKind::File,
		};

		Ok(FileRecord {
			path: relpath.to_path_buf(),
			kind,
			..Default::default()
		})
	}
}


/// The header block of a manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct Header
{
	/// Manifest format this document speaks
	pub(crate) format: u32,

	/// Content version it describes
	pub(crate) version: Version,

	/// The previous content version, when there was one
	pub(crate) previous: Option<Version>,

	/// Live-file count, for sanity checks
	pub(crate) filecount: u64,

	/// Sum of sizes over live files, for disk-space checks
	pub(crate) contentsize: u64,

	/// Oldest client format that may consume this
	pub(crate) minversion: Option<u32>,

	/// Required included bundles
	pub(crate) includes: Vec<String>,

	/// Optional included bundles
	pub(crate) also_add: Vec<String>,
}


/// A parsed manifest: header plus the body records, sorted by
/// (path, deleted).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Manifest
{
	pub(crate) header: Header,
	pub(crate) files: Vec<FileRecord>,
}


impl Manifest
{
	/// Look up a bundle entry in a MoM.
	pub(crate) fn bundle(&self, name: &str) -> Option<&FileRecord>
	{
		self.files.iter().find(|f| {
			f.kind == FileKind::Manifest && f.path == Path::new(name)
		})
	}

	/// All the bundle names a MoM carries (live ones).
	pub(crate) fn bundle_names(&self) -> Vec<&str>
	{
		self.files.iter()
				.filter(|f| f.kind == FileKind::Manifest && f.is_live())
				.filter_map(|f| f.path.to_str())
				.collect()
	}

	/// Binary-search a record by path.  The file list invariant (sorted
	/// by path) makes this legit.
	pub(crate) fn find(&self, path: &Path) -> Option<&FileRecord>
	{
		let idx = self.files
				.binary_search_by(|f| f.path.as_path().cmp(path)).ok()?;
		Some(&self.files[idx])
	}

	/// Fix up the body sort after assembling records by hand.  The
	/// parser calls this; so do tests.
	pub(crate) fn sort_files(&mut self)
	{
		self.files.sort_by(|a, b| {
			(&a.path, a.is_deleted()).cmp(&(&b.path, b.is_deleted()))
		});
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	pub(crate) fn rec(path: &str, kind: FileKind, state: Lifecycle,
			ver: Version, hash: &str) -> FileRecord
	{
		FileRecord {
			path: path.into(),
			kind, state,
			last_change: ver,
			hash: hash.repeat(64).parse().unwrap(),
			..Default::default()
		}
	}

	#[test]
	fn bundle_lookup()
	{
		let mut mom = Manifest::default();
		mom.files.push(rec("os-core", FileKind::Manifest,
				Lifecycle::Live, 10, "a"));
		mom.files.push(rec("editors", FileKind::Manifest,
				Lifecycle::Live, 20, "b"));
		mom.sort_files();

		assert_eq!(mom.bundle("os-core").unwrap().last_change, 10);
		assert!(mom.bundle("nope").is_none());
		assert_eq!(mom.bundle_names(), vec!["editors", "os-core"]);
	}

	#[test]
	fn find_by_path()
	{
		let mut m = Manifest::default();
		m.files.push(rec("/usr/bin/vim", FileKind::File,
				Lifecycle::Live, 100, "1"));
		m.files.push(rec("/usr/bin", FileKind::Dir,
				Lifecycle::Live, 20, "2"));
		m.sort_files();

		assert!(m.find(Path::new("/usr/bin/vim")).is_some());
		assert!(m.find(Path::new("/usr/bin/emacs")).is_none());
	}

	#[test]
	fn populate_kinds()
	{
		let tmp = tempfile::tempdir().unwrap();
		let f = tmp.path().join("f");
		std::fs::write(&f, "x").unwrap();
		let r = FileRecord::populate(Path::new("/f"), &f).unwrap();
		assert_eq!(r.kind, FileKind::File);
		assert!(r.hash.is_zeros());

		let r = FileRecord::populate(Path::new("/"), tmp.path()).unwrap();
		assert_eq!(r.kind, FileKind::Dir);
	}
}
