//! Delta application pool.
//!
//! Each unit takes a local source file (whose canonical hash matched
//! the delta's from-side), applies a bsdiff patch, carries the source's
//! stat over, and verifies the result hashes to the to-side before
//! letting it into the staged cache.  A mismatch is a "miss", which
//! isn't an error exactly; the caller just falls back to fetching the
//! fullfile.

use std::path::PathBuf;

use crate::util::hash::Sha256Hash;


/// Control for the delta pool.
#[derive(Debug, Clone)]
pub(crate) struct Control
{
	/// Where verified results land (as <staged>/<to-hash>)
	pub(crate) staged: PathBuf,

	/// Hash xattrs when verifying
	pub(crate) use_xattrs: bool,
}


/// One delta to apply.
#[derive(Debug)]
pub(crate) struct Req
{
	/// The local file serving as the patch base
	pub(crate) src: PathBuf,

	/// The extracted delta binary
	pub(crate) patch: PathBuf,

	/// What the output must hash to
	pub(crate) to: Sha256Hash,
}

/// A hit.
#[derive(Debug)]
pub(crate) struct Res
{
	pub(crate) to: Sha256Hash,
}

/// A not-hit.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum DeltaErr
{
	/// Patch applied but the output hashed wrong.  Fall back to the
	/// fullfile; the local base probably wasn't what we thought.
	#[error("delta produced wrong hash for {0}")]
	Miss(Sha256Hash),

	/// Couldn't even try.
	#[error("delta apply I/O error: {0}")]
	IO(#[from] std::io::Error),
}


/// The pool itself: racks up hit/miss counts.
#[derive(Debug, Default)]
pub(crate) struct Deltas
{
	pub(crate) hits: u32,
	pub(crate) misses: u32,
}

/// Final tallies.
#[derive(Debug, Default)]
pub(crate) struct PoolResult
{
	pub(crate) hits: u32,
	pub(crate) misses: u32,
}


impl crate::core::pool::Pool for Deltas
{
	type Control = Control;
	type UnitControl = Control;
	fn mk_unitcontrol(c: &Control) -> Control { c.clone() }

	type PoolResult = PoolResult;

	type WorkRequest = Req;
	type WorkResult  = Res;
	type WorkErr     = DeltaErr;
	fn work(ctrl: &Control, req: Req) -> Result<Res, DeltaErr>
	{
		apply_one(ctrl, req)
	}

	// Patching is CPU work
	fn nthreads(&self) -> u32 { crate::core::pool::jobs_cpu() }

	fn work_result(&mut self, resp: Result<Res, DeltaErr>)
	{
		match resp
		{
			Ok(_) => self.hits += 1,
			Err(_) => self.misses += 1,
		}
	}

	fn finalize(self) -> PoolResult
	{
		PoolResult { hits: self.hits, misses: self.misses }
	}
}


fn apply_one(ctrl: &Control, req: Req) -> Result<Res, DeltaErr>
{
	use crate::util::{bspatch, fs as ufs, hash};

	let to_name = req.to.to_buf();
	let out = ctrl.staged.join(to_name.as_ref());
	let tmp = ctrl.staged.join(format!(".delta.{to_name}"));

	// Apply the patch into the dot-tmp
	if let Err(e) = bspatch::patch(&req.src, &tmp, &req.patch)
	{
		let _ = std::fs::remove_file(&tmp);
		return Err(e.into());
	}

	// The canonical hash covers stat fields, so carry the base's
	// over; a version that also changed mode/ownership just won't
	// verify, and that's a miss by design of the format.
	let srcstat = match ufs::lstat(&req.src) {
		Ok(st) => st,
		Err(e) => {
			let _ = std::fs::remove_file(&tmp);
			use std::io::{Error, ErrorKind as EK};
			return Err(Error::new(EK::Other, e.to_string()).into());
		},
	};
	ufs::apply_stat(&tmp, srcstat.perms, srcstat.uid, srcstat.gid)?;

	// And the gate: does it hash right?
	let got = match hash::hash_of(&tmp, ctrl.use_xattrs) {
		Ok(h) => h,
		Err(_) => Sha256Hash::zeros(),
	};
	if got != req.to
	{
		let _ = std::fs::remove_file(&tmp);
		return Err(DeltaErr::Miss(req.to));
	}

	std::fs::rename(&tmp, &out)?;
	Ok(Res { to: req.to })
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::core::pool::Pool as _;
	use crate::util::hash;

	fn mk_delta(oldb: &[u8], newb: &[u8], dst: &std::path::Path)
	{
		use qbsdiff::Bsdiff;
		let mut patb = Vec::new();
		Bsdiff::new(oldb, newb).compare(std::io::Cursor::new(&mut patb))
				.unwrap();
		std::fs::write(dst, &patb).unwrap();
	}

	#[test]
	fn hit_and_miss()
	{
		let tmp = tempfile::tempdir().unwrap();
		let staged = tmp.path().join("staged");
		std::fs::create_dir(&staged).unwrap();

		// The base file on "disk"
		let src = tmp.path().join("foo");
		std::fs::write(&src, b"old contents of foo").unwrap();

		// Figure what the patched result will hash to, by building it
		let want = tmp.path().join("want");
		std::fs::write(&want, b"new contents of foo").unwrap();
		// Stat fields must match what apply_one will produce
		let sst = crate::util::fs::lstat(&src).unwrap();
		crate::util::fs::apply_stat(&want, sst.perms, sst.uid, sst.gid)
				.unwrap();
		let to = hash::hash_of(&want, false).unwrap();

		let patch = tmp.path().join("patch");
		mk_delta(b"old contents of foo", b"new contents of foo", &patch);

		let ctrl = Control { staged: staged.clone(), use_xattrs: false };

		// The hit
		let reqs = vec![Req { src: src.clone(), patch: patch.clone(), to }];
		let res = Deltas::default().run(&ctrl, reqs).unwrap();
		assert_eq!(res.hits, 1);
		assert_eq!(res.misses, 0);
		let blob = staged.join(to.to_buf().as_ref());
		assert_eq!(hash::hash_of(&blob, false).unwrap(), to);

		// The miss: expect a hash the patch won't produce
		let wrong: Sha256Hash = crate::manifest::testutil::hash('e')
				.parse().unwrap();
		let reqs = vec![Req { src, patch, to: wrong }];
		let res = Deltas::default().run(&ctrl, reqs).unwrap();
		assert_eq!(res.hits, 0);
		assert_eq!(res.misses, 1);
		assert!(!staged.join(wrong.to_buf().as_ref()).exists());
	}
}
