//! State-directory layout.
//!
//! Everything we cache or stage lives under one state dir:
//!
//!   <state>/staged/<hash>        content-addressed staged blobs
//!   <state>/delta/<from>-<to>    extracted delta binaries
//!   <state>/download/            scratch for in-flight downloads
//!   <state>/telemetry/           drop dir for telemetry records
//!   <state>/<version>/           manifest tree for a version
//!
//! This module owns the layout and the GC over it; nobody else builds
//! these paths by hand.

use std::path::{Path, PathBuf};

use crate::manifest::Version;
use crate::util::hash::Sha256Hash;


/// Runtime state-dir handle.  Creating it ensures the skeleton exists.
#[derive(Debug, Clone)]
pub(crate) struct StateDirs
{
	state: PathBuf,
}


impl StateDirs
{
	/// Set up the state dir skeleton.  0755 for the shareable bits;
	/// staged gets 0700 since blobs pass through with their final
	/// permissions before landing.
	pub(crate) fn init(state: &Path) -> Result<Self, std::io::Error>
	{
		use crate::util::fs::dodir;

		dodir(state, Some(0o755))?;
		let sd = StateDirs { state: state.to_path_buf() };
		dodir(&sd.staged(), Some(0o700))?;
		dodir(&sd.delta(), Some(0o755))?;
		dodir(&sd.download(), Some(0o755))?;
		dodir(&sd.telemetry(), Some(0o755))?;
		Ok(sd)
	}

	pub(crate) fn root(&self) -> &Path { &self.state }
	pub(crate) fn staged(&self) -> PathBuf { self.state.join("staged") }
	pub(crate) fn delta(&self) -> PathBuf { self.state.join("delta") }
	pub(crate) fn download(&self) -> PathBuf { self.state.join("download") }
	pub(crate) fn telemetry(&self) -> PathBuf { self.state.join("telemetry") }

	/// A staged blob's path.
	pub(crate) fn staged_path(&self, hash: &Sha256Hash) -> PathBuf
	{
		self.staged().join(hash.to_buf().as_ref())
	}

	/// An extracted delta binary's path.
	pub(crate) fn delta_path(&self, from: &Sha256Hash, to: &Sha256Hash)
			-> PathBuf
	{
		self.delta().join(format!("{}-{}", from.to_buf(), to.to_buf()))
	}

	/// The manifest tree for a version, created on demand.
	pub(crate) fn version_dir(&self, v: Version)
			-> Result<PathBuf, std::io::Error>
	{
		let d = self.state.join(v.to_string());
		crate::util::fs::dodir(&d, Some(0o755))?;
		Ok(d)
	}

	/// Where a downloaded pack tarball goes (and its zero-length
	/// marker stays after extraction).
	pub(crate) fn pack_path(&self, to: Version, bundle: &str, from: Version)
			-> Result<PathBuf, std::io::Error>
	{
		let d = self.version_dir(to)?;
		Ok(d.join(format!("pack-{bundle}-from-{from}.tar")))
	}

	/// Empty the download scratch dir.  Its contents are always
	/// disposable; leftover junk is only ever half a download.
	pub(crate) fn clear_download(&self) -> Result<(), std::io::Error>
	{
		let dl = self.download();
		for ent in std::fs::read_dir(&dl)?
		{
			let p = ent?.path();
			match p.is_dir() {
				true  => std::fs::remove_dir_all(&p)?,
				false => std::fs::remove_file(&p)?,
			}
		}
		Ok(())
	}
}



/*
 * The cache cleaner.
 */

/// What a clean run did (or would do).
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CleanStats
{
	pub(crate) files_removed: u64,
	pub(crate) bytes_removed: u64,
}


/// Is a name a bare 64-hex-char hash?
fn is_hash_name(name: &str) -> bool
{
	name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Is a name a <from>-<to> delta key?
fn is_delta_name(name: &str) -> bool
{
	match name.split_once('-') {
		Some((f, t)) => is_hash_name(f) && is_hash_name(t),
		None => false,
	}
}

/// Is a name a pack tarball/marker?
fn is_pack_name(name: &str) -> bool
{
	name.starts_with("pack-") && name.ends_with(".tar")
}


impl StateDirs
{
	/// GC the cache.
	///
	/// Everything reconstructible goes: staged blobs, pack markers,
	/// delta binaries, manifest-delta leftovers, and version trees --
	/// except manifests the current MoM still references (so the next
	/// operation against the running version needs no downloads),
	/// unless `all` says otherwise.  dry_run just reports.
	///
	/// Byte accounting counts only files whose link count was 1; a
	/// staged blob hardlinked into the system frees nothing when
	/// unlinked here.
	pub(crate) fn clean(&self, all: bool, dry_run: bool,
			keep: Option<&KeepSet>) -> Result<CleanStats, std::io::Error>
	{
		let mut stats = CleanStats::default();

		// Staged blobs
		self.clean_dir_matching(&self.staged(), dry_run, &mut stats,
				&|n| is_hash_name(n))?;

		// Delta binaries
		self.clean_dir_matching(&self.delta(), dry_run, &mut stats,
				&|n| is_delta_name(n))?;

		// Download scratch: all of it
		self.clean_dir_matching(&self.download(), dry_run, &mut stats,
				&|_| true)?;

		// Pack markers and manifest-delta leftovers at the top
		self.clean_dir_matching(&self.state, dry_run, &mut stats,
				&|n| is_pack_name(n) || n.starts_with("Manifest-"))?;

		// Version dirs
		for ent in std::fs::read_dir(&self.state)?
		{
			let ent = ent?;
			let name = ent.file_name();
			let name = name.to_string_lossy();
			if !name.bytes().all(|b| b.is_ascii_digit()) { continue; }
			if !ent.path().is_dir() { continue; }

			let vdir = ent.path();
			self.clean_dir_matching(&vdir, dry_run, &mut stats,
					&|n| {
						if is_pack_name(n) { return true; }
						if !n.starts_with("Manifest") { return false; }
						if all { return true; }
						// No keep-set means we couldn't read the
						// current MoM; keeping every manifest beats
						// breaking the one invariant clean has.
						match keep {
							Some(k) => !k.keeps(&name, n),
							None => false,
						}
					})?;

			// And drop the dir itself if now empty
			let empty = std::fs::read_dir(&vdir)?.next().is_none();
			if empty && !dry_run
			{ let _ = std::fs::remove_dir(&vdir); }
		}

		Ok(stats)
	}


	fn clean_dir_matching(&self, dir: &Path, dry_run: bool,
			stats: &mut CleanStats, pred: &dyn Fn(&str) -> bool)
			-> Result<(), std::io::Error>
	{
		let rd = match std::fs::read_dir(dir) {
			Ok(rd) => rd,
			// A skeleton dir somebody removed isn't worth failing a
			// clean over.
			Err(_) => return Ok(()),
		};

		for ent in rd
		{
			let ent = ent?;
			let name = ent.file_name();
			let name = name.to_string_lossy();
			if !pred(&name) { continue; }

			let p = ent.path();
			if p.is_dir() { continue; }

			// Only lone inodes actually free bytes.
			let size = match crate::util::fs::lstat(&p) {
				Ok(st) if st.nlink == 1 => st.size,
				_ => 0,
			};

			match dry_run {
				true => println!("{}", p.display()),
				false => {
					if let Err(e) = std::fs::remove_file(&p)
					{
						eprintln!("Warning: couldn't remove {}: {e}",
								p.display());
						continue;
					}
				},
			}
			stats.files_removed += 1;
			stats.bytes_removed += size;
		}
		Ok(())
	}
}


/// What the cleaner must not remove: the manifests the current MoM
/// still references, named by (version-dir, manifest filename).
#[derive(Debug, Default)]
pub(crate) struct KeepSet
{
	keep: std::collections::HashSet<(String, String)>,
}

impl KeepSet
{
	/// Build from the running version's MoM.
	pub(crate) fn from_mom(cur_version: Version,
			mom: &crate::manifest::Manifest) -> Self
	{
		let mut keep = std::collections::HashSet::new();

		// The MoM itself and its signature
		let vdir = cur_version.to_string();
		keep.insert((vdir.clone(), "Manifest.MoM".to_string()));
		keep.insert((vdir.clone(), "Manifest.MoM.sig".to_string()));

		// Each referenced bundle manifest, in the version dir its
		// last_change says, under its hash-hinted name (and the bare
		// legacy name, which is the same content).
		for f in &mom.files
		{
			if f.kind != crate::manifest::FileKind::Manifest { continue; }
			let Some(name) = f.path.to_str() else { continue };
			let bdir = f.last_change.to_string();
			keep.insert((bdir.clone(),
					format!("Manifest.{}.{}", name, f.hash.to_buf())));
			keep.insert((bdir, format!("Manifest.{}", name)));
		}

		KeepSet { keep }
	}

	fn keeps(&self, vdir: &str, fname: &str) -> bool
	{
		self.keep.contains(&(vdir.to_string(), fname.to_string()))
	}
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::testutil;

	fn mk_state() -> (tempfile::TempDir, StateDirs)
	{
		let tmp = tempfile::tempdir().unwrap();
		let sd = StateDirs::init(&tmp.path().join("state")).unwrap();
		(tmp, sd)
	}

	#[test]
	fn skeleton()
	{
		let (_tmp, sd) = mk_state();
		assert!(sd.staged().is_dir());
		assert!(sd.delta().is_dir());
		assert!(sd.download().is_dir());
		assert!(sd.telemetry().is_dir());
	}

	#[test]
	fn name_preds()
	{
		let h = testutil::hash('a');
		assert!(is_hash_name(&h));
		assert!(!is_hash_name("Manifest.MoM"));
		assert!(!is_hash_name(&h[..60]));

		assert!(is_delta_name(&format!("{}-{}",
				testutil::hash('a'), testutil::hash('b'))));
		assert!(!is_delta_name(&h));

		assert!(is_pack_name("pack-editors-from-90.tar"));
		assert!(!is_pack_name("Manifest.editors.tar"));
	}

	#[test]
	fn cleaning_sweeps_and_keeps()
	{
		let (_tmp, sd) = mk_state();

		// A staged blob, a delta, download junk
		let h_a = testutil::hash('a');
		let h_b = testutil::hash('b');
		std::fs::write(sd.staged().join(&h_a), "blob").unwrap();
		std::fs::write(sd.delta().join(format!("{h_a}-{h_b}")),
				"delta").unwrap();
		std::fs::write(sd.download().join("partial.tar"), "junk").unwrap();

		// Version dir with a MoM + a bundle manifest + a pack marker
		let vd = sd.version_dir(100).unwrap();
		std::fs::write(vd.join("Manifest.MoM"), "mom").unwrap();
		std::fs::write(vd.join("Manifest.MoM.sig"), "sig").unwrap();
		std::fs::write(vd.join(format!("Manifest.editors.{h_b}")),
				"bman").unwrap();
		std::fs::write(vd.join("pack-editors-from-90.tar"), "").unwrap();

		// Current MoM references editors@100 with hash b
		let mom = testutil::mf(100, vec![testutil::rec("editors",
				crate::manifest::FileKind::Manifest,
				crate::manifest::Lifecycle::Live, 100, &h_b)]);
		let keep = KeepSet::from_mom(100, &mom);

		// Dry run removes nothing
		let st = sd.clean(false, true, Some(&keep)).unwrap();
		assert!(st.files_removed > 0);
		assert!(sd.staged().join(&h_a).exists());

		// Real run: staged/delta/download/pack go, kept manifests stay
		let _st = sd.clean(false, false, Some(&keep)).unwrap();
		assert!(!sd.staged().join(&h_a).exists());
		assert!(!sd.download().join("partial.tar").exists());
		assert!(!vd.join("pack-editors-from-90.tar").exists());
		assert!(vd.join("Manifest.MoM").exists());
		assert!(vd.join(format!("Manifest.editors.{h_b}")).exists());

		// --all: everything goes, empty version dir gets rmdir'd
		let _st = sd.clean(true, false, Some(&keep)).unwrap();
		assert!(!vd.join("Manifest.MoM").exists());
		assert!(!vd.exists(), "emptied version dir removed");
	}
}
