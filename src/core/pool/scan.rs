//! Filesystem hash scanning.
//!
//! Verify wants the canonical hash of everything the manifests name,
//! and a system tree is tens of thousands of files, so this is the
//! pool that makes verify not take all afternoon.  Missing files come
//! back as the zeros hash, same as everywhere else.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::util::hash::Sha256Hash;


/// Control for a scan.
#[derive(Debug, Clone)]
pub(crate) struct Control
{
	/// The tree the relative paths live under
	pub(crate) prefix: PathBuf,

	/// Hash xattrs too
	pub(crate) use_xattrs: bool,
}


/// One path to hash (manifest-relative).
#[derive(Debug)]
pub(crate) struct Req
{
	pub(crate) rel: PathBuf,
}

/// Its hash.
#[derive(Debug)]
pub(crate) struct Res
{
	pub(crate) rel: PathBuf,
	pub(crate) hash: Sha256Hash,
}

/// Or its refusal.
#[derive(Debug)]
pub(crate) struct ScanErr
{
	pub(crate) rel: PathBuf,
	pub(crate) err: String,
}


/// The scan pool: collects path -> hash.
#[derive(Debug, Default)]
pub(crate) struct Scan
{
	hashes: HashMap<PathBuf, Sha256Hash>,
	errs: Vec<ScanErr>,
}

/// Everything a scan learned.
#[derive(Debug, Default)]
pub(crate) struct PoolResult
{
	pub(crate) hashes: HashMap<PathBuf, Sha256Hash>,
	pub(crate) errs: Vec<ScanErr>,
}


impl crate::core::pool::Pool for Scan
{
	type Control = Control;
	type UnitControl = Control;
	fn mk_unitcontrol(c: &Control) -> Control { c.clone() }

	type PoolResult = PoolResult;

	type WorkRequest = Req;
	type WorkResult  = Res;
	type WorkErr     = ScanErr;
	fn work(ctrl: &Control, req: Req) -> Result<Res, ScanErr>
	{
		let disk = crate::util::path_join(&ctrl.prefix, &req.rel);
		match crate::util::hash::hash_of(&disk, ctrl.use_xattrs) {
			Ok(hash) => Ok(Res { rel: req.rel, hash }),
			Err(e) => Err(ScanErr { rel: req.rel, err: e.to_string() }),
		}
	}

	fn nthreads(&self) -> u32 { crate::core::pool::jobs_cpu() }

	fn work_result(&mut self, resp: Result<Res, ScanErr>)
	{
		match resp
		{
			Ok(r)  => { self.hashes.insert(r.rel, r.hash); },
			Err(e) => self.errs.push(e),
		}
	}

	fn finalize(self) -> PoolResult
	{
		PoolResult { hashes: self.hashes, errs: self.errs }
	}
}


/// The convenient front door: hash these paths under that prefix.
pub(crate) fn scan(prefix: PathBuf, use_xattrs: bool, rels: Vec<PathBuf>)
		-> Result<PoolResult, anyhow::Error>
{
	use crate::core::pool::Pool as _;

	let ctrl = Control { prefix, use_xattrs };
	let reqs = rels.into_iter().map(|rel| Req { rel }).collect();
	Scan::default().run(&ctrl, reqs)
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn scanning()
	{
		let tmp = tempfile::tempdir().unwrap();
		let prefix = tmp.path();
		std::fs::create_dir_all(prefix.join("usr/bin")).unwrap();
		std::fs::write(prefix.join("usr/bin/vim"), "im a vim").unwrap();

		let rels: Vec<PathBuf> = vec![
			"/usr/bin/vim".into(),
			"/usr/bin/missing".into(),
		];
		let res = scan(prefix.to_path_buf(), false, rels).unwrap();
		assert!(res.errs.is_empty());

		let vim = &res.hashes[&PathBuf::from("/usr/bin/vim")];
		assert!(!vim.is_zeros());
		assert_eq!(*vim, crate::util::hash::hash_of(
				&prefix.join("usr/bin/vim"), false).unwrap());

		let missing = &res.hashes[&PathBuf::from("/usr/bin/missing")];
		assert!(missing.is_zeros(), "missing file scans as zeros");
	}
}
