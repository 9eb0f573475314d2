//! The staging & rename engine.
//!
//! Input is a consolidated, path-sorted record list whose live entries
//! all have verified blobs sitting in the staged cache.  We put
//! directories in place first (path order makes parents precede
//! children), then build every file/link next to its final path as a
//! `.update.<name>` dot-tmp, then rename each into place.  rename(2)
//! is the whole atomicity story: any path is the old version or the
//! new version, never half of either.  Deletions run after the
//! renames, children before parents; the markers and the version file
//! belong to the caller, after we return success.
//!
//! This phase is deliberately not cancellable.  Once renames start,
//! stopping early just means a half-updated system with no record of
//! which half.

use std::path::{Path, PathBuf};

use crate::manifest::{FileKind, FileRecord};
use crate::core::StateDirs;
use crate::util::{fs as ufs, path_join};

use thiserror::Error;


#[derive(Debug)]
#[derive(Error)]
pub(crate) enum StageErr
{
	#[error("no staged blob for {0} (hash {1})")]
	NotStaged(PathBuf, String),

	#[error("staging {0}: {1}")]
	Stage(PathBuf, std::io::Error),

	#[error("renaming into {0}: {1}")]
	Rename(PathBuf, std::io::Error),

	#[error("creating directory {0}: {1}")]
	Dir(PathBuf, std::io::Error),
}


/// What a run did.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StageStats
{
	pub(crate) dirs: u32,
	pub(crate) files: u32,
	pub(crate) links: u32,
	pub(crate) deleted: u32,
	pub(crate) not_deleted: u32,
}


/// The engine's knobs.
pub(crate) struct Stager<'a>
{
	pub(crate) dirs: &'a StateDirs,
	pub(crate) prefix: &'a Path,

	/// Skip the fdatasync/sync calls.  Faster, less crash-proof.
	pub(crate) no_sync: bool,
}


impl<'a> Stager<'a>
{
	/// Install a record list.  `records` must be path-sorted and
	/// pre-filtered: no ignored paths, no MoM pointers.  Deleted
	/// records are removed from disk; everything else gets put in
	/// place.
	pub(crate) fn run(&self, records: &[FileRecord])
			-> Result<StageStats, StageErr>
	{
		let mut stats = StageStats::default();

		// Phase 1: directories, in path order.
		for rec in records
		{
			if rec.kind != FileKind::Dir || !rec.is_live() { continue; }
			self.place_dir(rec)?;
			stats.dirs += 1;
		}

		// Phase 2: stage files and links as dot-tmps.
		let mut renames: Vec<(PathBuf, PathBuf, &FileRecord)> = Vec::new();
		let staged_root = self.dirs.staged();
		for rec in records
		{
			if !rec.is_live() { continue; }
			let (is_file, is_link) = match rec.kind {
				FileKind::File => (true, false),
				FileKind::Link => (false, true),
				_ => continue,
			};

			let blob = staged_root.join(rec.hash.to_buf().as_ref());
			if !blob_present(&blob)
			{
				// Abort before anything's renamed; unwind the tmps.
				let e = StageErr::NotStaged(rec.path.clone(),
						rec.hash.to_string());
				self.unwind(&renames);
				return Err(e);
			}

			let finalp = path_join(self.prefix, &rec.path);
			let tmp = dot_tmp(&finalp);
			self.ensure_parent(&finalp, records)?;

			let res = match (is_file, is_link) {
				(true, _) => stage_file(&blob, &tmp),
				(_, true) => stage_link(&blob, &tmp),
				_ => unreachable!(),
			};
			if let Err(e) = res
			{
				self.unwind(&renames);
				let _ = std::fs::remove_file(&tmp);
				return Err(StageErr::Stage(rec.path.clone(), e));
			}

			match rec.kind {
				FileKind::File => stats.files += 1,
				FileKind::Link => stats.links += 1,
				_ => (),
			}
			renames.push((tmp, finalp, rec));
		}

		// Phase 3: rename into place, same order.  From here on we
		// don't unwind; each completed rename is a completed file.
		for (tmp, finalp, rec) in &renames
		{
			// A path that changed type from dir needs the old dir
			// gone first; rename won't replace a directory.
			if finalp.is_dir() && !finalp.is_symlink()
			{
				let _ = std::fs::remove_dir(finalp);
			}
			std::fs::rename(tmp, finalp)
					.map_err(|e| StageErr::Rename(rec.path.clone(), e))?;
			if !self.no_sync && rec.kind == FileKind::File
			{ let _ = ufs::fdatasync(finalp); }
		}

		// Phase 4: deletions, children before parents.
		for rec in records.iter().rev()
		{
			if !rec.is_deleted() { continue; }
			let finalp = path_join(self.prefix, &rec.path);

			// The root never goes, no matter what a manifest says.
			if finalp == self.prefix { continue; }

			let st = match ufs::lstat(&finalp) {
				Ok(st) => st,
				Err(_) => continue,  // correctly absent already
			};

			let res = match st.is_dir() {
				true  => std::fs::remove_dir(&finalp),
				false => std::fs::remove_file(&finalp),
			};
			match res {
				Ok(_) => stats.deleted += 1,
				Err(e) => {
					// Non-empty dirs are the usual cause; somebody
					// put files there and that's their call.
					println!("Couldn't remove {}: {e}", finalp.display());
					stats.not_deleted += 1;
				},
			}
		}

		// Phase 5: flush it all down.
		if !self.no_sync { ufs::sync(); }

		Ok(stats)
	}


	/// Put one directory record in place: create if missing, then
	/// make mode/ownership match the staged blob when we have one.
	fn place_dir(&self, rec: &FileRecord) -> Result<(), StageErr>
	{
		let finalp = path_join(self.prefix, &rec.path);
		let derr = |e| StageErr::Dir(rec.path.clone(), e);

		if !finalp.is_dir()
		{
			// A file where a dir should be loses.
			if finalp.exists() || finalp.is_symlink()
			{ std::fs::remove_file(&finalp).map_err(derr)?; }
			std::fs::create_dir_all(&finalp).map_err(derr)?;
		}

		let blob = self.dirs.staged().join(rec.hash.to_buf().as_ref());
		if let Ok(st) = ufs::lstat(&blob)
		{
			if st.is_dir()
			{
				ufs::apply_stat(&finalp, st.perms, st.uid, st.gid)
						.map_err(derr)?;
			}
		}
		Ok(())
	}


	/// Make sure a final path's parent exists.  Normally phase 1 has
	/// already handled it; when a parent isn't on disk and isn't ours
	/// to place (not in the record list), build the chain 0755 --
	/// that's the verify-fix of last resort.
	fn ensure_parent(&self, finalp: &Path, records: &[FileRecord])
			-> Result<(), StageErr>
	{
		let Some(parent) = finalp.parent() else { return Ok(()) };
		if parent.is_dir() { return Ok(()) }

		// If some record owns the parent, place it properly (and its
		// ancestors, recursively through the same path).
		let rel = match parent.strip_prefix(self.prefix) {
			Ok(r) => Path::new("/").join(r),
			Err(_) => PathBuf::from("/"),
		};
		if let Some(owner) = records.iter().find(|r| {
			r.kind == FileKind::Dir && r.is_live() && r.path == rel })
		{
			let ofinal = path_join(self.prefix, &owner.path);
			self.ensure_parent(&ofinal, records)?;
			return self.place_dir(owner);
		}

		std::fs::create_dir_all(parent)
				.map_err(|e| StageErr::Dir(parent.to_path_buf(), e))
	}


	/// Toss any dot-tmps we made before an abort.
	fn unwind(&self, renames: &[(PathBuf, PathBuf, &FileRecord)])
	{
		for (tmp, _f, _r) in renames
		{
			let _ = std::fs::remove_file(tmp);
		}
	}
}


/// The `.update.<name>` sibling of a final path.
fn dot_tmp(finalp: &Path) -> PathBuf
{
	let name = finalp.file_name().unwrap_or_default();
	let mut tmpname = std::ffi::OsString::from(".update.");
	tmpname.push(name);
	match finalp.parent() {
		Some(p) => p.join(tmpname),
		None => PathBuf::from(tmpname),
	}
}


fn blob_present(blob: &Path) -> bool
{
	// Symlink blobs are staged as symlinks, which exists() would
	// deref, so lstat it is.
	ufs::lstat(blob).is_ok()
}


/// Stage a regular file: hardlink from the cache (keeps stat and
/// costs nothing), copy if the cache is on another filesystem.
fn stage_file(blob: &Path, tmp: &Path) -> Result<(), std::io::Error>
{
	let _ = std::fs::remove_file(tmp);
	ufs::link_or_copy(blob, tmp)?;

	// A copy loses the blob's stat; put it back.
	let bst = ufs::lstat(blob)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other,
					e.to_string()))?;
	let tst = ufs::lstat(tmp)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other,
					e.to_string()))?;
	if bst.ino != tst.ino
	{
		ufs::apply_stat(tmp, bst.perms, bst.uid, bst.gid)?;
	}
	Ok(())
}


/// Stage a symlink: recreate it with the staged link's target.
fn stage_link(blob: &Path, tmp: &Path) -> Result<(), std::io::Error>
{
	let target = std::fs::read_link(blob)?;
	let _ = std::fs::remove_file(tmp);
	std::os::unix::fs::symlink(&target, tmp)?;
	Ok(())
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::testutil::{hash, rec};
	use crate::manifest::Lifecycle;
	use crate::util::hash::hash_of;

	/// A little world: a state dir with staged blobs, and a prefix to
	/// install into.
	struct World
	{
		_tmp: tempfile::TempDir,
		dirs: StateDirs,
		prefix: PathBuf,
	}

	fn mk_world() -> World
	{
		let tmp = tempfile::tempdir().unwrap();
		let dirs = StateDirs::init(&tmp.path().join("state")).unwrap();
		let prefix = tmp.path().join("root");
		std::fs::create_dir(&prefix).unwrap();
		World { _tmp: tmp, dirs, prefix }
	}

	/// Stage a file blob whose name is its real canonical hash;
	/// returns the record for it.
	fn stage_blob(w: &World, relpath: &str, contents: &[u8])
			-> FileRecord
	{
		// Hash it from a scratch copy first
		let scratch = w.dirs.download().join("scratch");
		std::fs::write(&scratch, contents).unwrap();
		let h = hash_of(&scratch, false).unwrap();
		std::fs::rename(&scratch,
				w.dirs.staged().join(h.to_buf().as_ref())).unwrap();

		rec(relpath, FileKind::File, Lifecycle::Live, 10,
				h.to_buf().as_ref())
	}

	fn stager(w: &World) -> Stager
	{
		Stager { dirs: &w.dirs, prefix: &w.prefix, no_sync: true }
	}

	#[test]
	fn files_dirs_links_land()
	{
		let w = mk_world();

		let mut recs = vec![
			rec("/usr", FileKind::Dir, Lifecycle::Live, 1, &hash('0')),
			rec("/usr/bin", FileKind::Dir, Lifecycle::Live, 1, &hash('0')),
			stage_blob(&w, "/usr/bin/vim", b"#!/bin/vim"),
		];

		// A symlink blob
		let lh: crate::util::hash::Sha256Hash =
				hash('c').parse().unwrap();
		std::os::unix::fs::symlink("vim",
				w.dirs.staged().join(lh.to_buf().as_ref())).unwrap();
		recs.push(rec("/usr/bin/vi", FileKind::Link, Lifecycle::Live,
				1, &hash('c')));

		recs.sort_by(|a, b| a.path.cmp(&b.path));
		let stats = stager(&w).run(&recs).unwrap();

		assert_eq!(stats.dirs, 2);
		assert_eq!(stats.files, 1);
		assert_eq!(stats.links, 1);

		let vim = w.prefix.join("usr/bin/vim");
		assert_eq!(std::fs::read(&vim).unwrap(), b"#!/bin/vim");
		let vi = w.prefix.join("usr/bin/vi");
		assert_eq!(std::fs::read_link(&vi).unwrap(),
				PathBuf::from("vim"));

		// No dot-tmps left behind
		assert!(!w.prefix.join("usr/bin/.update.vim").exists());
	}

	#[test]
	fn existing_file_replaced_atomically()
	{
		let w = mk_world();
		std::fs::create_dir_all(w.prefix.join("usr/bin")).unwrap();
		std::fs::write(w.prefix.join("usr/bin/foo"), b"old").unwrap();

		let recs = vec![
			stage_blob(&w, "/usr/bin/foo", b"new contents"),
		];
		stager(&w).run(&recs).unwrap();
		assert_eq!(std::fs::read(w.prefix.join("usr/bin/foo")).unwrap(),
				b"new contents");
	}

	#[test]
	fn staged_blob_survives_rename()
	{
		// The staged cache owns its blobs; installing one must not
		// consume it.
		let w = mk_world();
		let r = stage_blob(&w, "/usr/file", b"cached");
		let blob = w.dirs.staged().join(r.hash.to_buf().as_ref());

		stager(&w).run(&[r]).unwrap();
		assert!(blob.exists(), "blob still cached after install");
	}

	#[test]
	fn missing_blob_aborts_before_renames()
	{
		let w = mk_world();
		std::fs::write(w.prefix.join("existing"), b"untouched").unwrap();

		let recs = vec![
			rec("/existing", FileKind::File, Lifecycle::Live, 1,
					&hash('d')),  // no blob staged for this
		];
		let err = stager(&w).run(&recs).unwrap_err();
		assert!(matches!(err, StageErr::NotStaged(..)));

		// The old file wasn't touched
		assert_eq!(std::fs::read(w.prefix.join("existing")).unwrap(),
				b"untouched");
	}

	#[test]
	fn deletions_children_first()
	{
		let w = mk_world();
		std::fs::create_dir_all(w.prefix.join("old/dir")).unwrap();
		std::fs::write(w.prefix.join("old/dir/f"), b"x").unwrap();

		let z = hash('0');
		let mut recs = vec![
			rec("/old", FileKind::Dir, Lifecycle::Deleted, 9, &z),
			rec("/old/dir", FileKind::Dir, Lifecycle::Deleted, 9, &z),
			rec("/old/dir/f", FileKind::File, Lifecycle::Deleted, 9, &z),
		];
		recs.sort_by(|a, b| a.path.cmp(&b.path));

		let stats = stager(&w).run(&recs).unwrap();
		assert_eq!(stats.deleted, 3);
		assert_eq!(stats.not_deleted, 0);
		assert!(!w.prefix.join("old").exists());
	}

	#[test]
	fn nonempty_dir_not_force_deleted()
	{
		let w = mk_world();
		std::fs::create_dir_all(w.prefix.join("old")).unwrap();
		std::fs::write(w.prefix.join("old/keepme"), b"x").unwrap();

		let recs = vec![
			rec("/old", FileKind::Dir, Lifecycle::Deleted, 9, &hash('0')),
		];
		let stats = stager(&w).run(&recs).unwrap();
		assert_eq!(stats.deleted, 0);
		assert_eq!(stats.not_deleted, 1);
		assert!(w.prefix.join("old/keepme").exists());
	}

	#[test]
	fn missing_parent_fixed_from_records()
	{
		let w = mk_world();

		// Record list owns /a but files skip ahead; the parent chain
		// gets placed on demand.
		let mut recs = vec![
			rec("/a", FileKind::Dir, Lifecycle::Live, 1, &hash('0')),
			stage_blob(&w, "/a/b/c", b"deep"),
		];
		recs.sort_by(|a, b| a.path.cmp(&b.path));

		stager(&w).run(&recs).unwrap();
		assert_eq!(std::fs::read(w.prefix.join("a/b/c")).unwrap(),
				b"deep");
	}
}
