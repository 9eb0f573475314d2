//! The manifest store: getting manifest documents into memory,
//! with all the verification that implies.
//!
//! The MoM is signature-checked against the pinned cert before it is
//! ever parsed; bundle manifests are hash-checked against their MoM
//! entry before they are ever parsed.  Parsed manifests are memoized
//! per (version, bundle) for the operation, and the text forms are
//! cached under `<state>/<version>/` so the next operation can skip
//! the downloads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{Manifest, Version};
use super::parse;
use crate::core::StateDirs;
use crate::server::{Server, FetchErr};
use crate::signature::{Verifier, VerifyFlags};

use thiserror::Error;


#[derive(Debug)]
#[derive(Error)]
pub(crate) enum StoreErr
{
	#[error("downloading {0}: {1}")]
	Download(String, FetchErr),

	#[error("extracting {0}: {1}")]
	Untar(String, String),

	#[error("MoM signature verification failed for version {0}")]
	Signature(Version),

	#[error("manifest hash mismatch for bundle '{0}'")]
	BadHash(String),

	#[error("parsing manifest {0}: {1}")]
	Parse(String, String),

	#[error("manifest format {got} is newer than this client's {ours}")]
	Incompatible { got: u32, ours: u32 },

	#[error("manifest requires format {min}; this client speaks {ours}")]
	MinVersion { min: u32, ours: u32 },

	#[error("no such bundle '{0}' in the MoM")]
	UnknownBundle(String),

	#[error("manifest cache I/O: {0}")]
	IO(#[from] std::io::Error),
}


/// The store.  One per operation; memoization dies with it.
pub(crate) struct Store<'a>
{
	server: &'a Server,
	dirs: &'a StateDirs,

	/// None means --nosigcheck
	verifier: Option<&'a Verifier>,

	/// The format this client speaks
	format: u32,

	memo: Mutex<HashMap<(Version, String), Arc<Manifest>>>,
}


impl<'a> Store<'a>
{
	pub(crate) fn new(server: &'a Server, dirs: &'a StateDirs,
			verifier: Option<&'a Verifier>, format: u32) -> Self
	{
		Store {
			server, dirs, verifier, format,
			memo: Mutex::new(HashMap::new()),
		}
	}


	/*
	 * MoM handling
	 */

	/// Load the MoM for a version: cache or download, verify
	/// signature, parse, gate on format.
	pub(crate) fn load_mom(&self, version: Version)
			-> Result<Arc<Manifest>, StoreErr>
	{
		let key = (version, "MoM".to_string());
		if let Some(m) = self.memo.lock().unwrap().get(&key)
		{ return Ok(m.clone()); }

		let vdir = self.dirs.version_dir(version)?;
		let mom_file = vdir.join("Manifest.MoM");
		let sig_file = vdir.join("Manifest.MoM.sig");

		// Take the cache if it's complete, else fetch fresh.
		let cached = mom_file.is_file()
				&& (sig_file.is_file() || self.verifier.is_none());
		let (bytes, sig) = match cached {
			true => {
				let b = std::fs::read(&mom_file)?;
				let s = match sig_file.is_file() {
					true  => std::fs::read(&sig_file)?,
					false => Vec::new(),
				};
				(b, s)
			},
			false => self.fetch_mom(version)?,
		};

		// The signature gate.  An unverified MoM never reaches the
		// parser.
		if let Some(ver) = self.verifier
		{
			let flags = VerifyFlags { print_errors: true,
					..Default::default() };
			if !ver.verify_detached(&bytes, &sig, flags)
			{
				// A stale cache shouldn't wedge us; retry with fresh
				// bytes once before giving up.
				let fresh = match cached {
					true  => self.fetch_mom(version)?,
					false => return Err(StoreErr::Signature(version)),
				};
				if !ver.verify_detached(&fresh.0, &fresh.1, flags)
				{ return Err(StoreErr::Signature(version)); }
				self.cache_mom(version, &fresh.0, &fresh.1)?;
				return self.parse_gated(&fresh.0, "MoM", key);
			}
		}

		if !cached
		{ self.cache_mom(version, &bytes, &sig)?; }

		self.parse_gated(&bytes, "MoM", key)
	}


	/// Download the MoM tar + its signature for a version.
	fn fetch_mom(&self, version: Version)
			-> Result<(Vec<u8>, Vec<u8>), StoreErr>
	{
		use crate::server::http;
		use crate::util::archive;

		let relname = format!("{version}/Manifest.MoM.tar");
		let url = self.server.content(&relname)
				.map_err(|e| StoreErr::Download(relname.clone(), e.into()))?;
		let dl = self.dirs.download().join("Manifest.MoM.tar");
		http::fetch_to_file(&self.server.agent, &url, &dl, false)
				.map_err(|e| StoreErr::Download(relname.clone(), e))?;

		let bytes = archive::read_entry(&dl, "Manifest.MoM")
				.map_err(|e| StoreErr::Untar(relname.clone(), e.to_string()))?;
		let _ = std::fs::remove_file(&dl);

		// Signature: bare .sig preferred, .sig.tar as the legacy
		// wrapping.
		let sig = match self.verifier {
			None => Vec::new(),
			Some(_) => {
				let signame = format!("{version}/Manifest.MoM.sig");
				let sigurl = self.server.content(&signame)
						.map_err(|e| StoreErr::Download(signame.clone(),
								e.into()))?;
				match http::get_bytes(&self.server.agent, &sigurl) {
					Ok(s) => s,
					Err(FetchErr::NotFound) => {
						let tname = format!("{signame}.tar");
						let turl = self.server.content(&tname)
								.map_err(|e| StoreErr::Download(tname.clone(),
										e.into()))?;
						let tdl = self.dirs.download()
								.join("Manifest.MoM.sig.tar");
						http::fetch_to_file(&self.server.agent, &turl,
								&tdl, false)
								.map_err(|e| StoreErr::Download(tname.clone(), e))?;
						let s = crate::util::archive::read_entry(&tdl,
								"Manifest.MoM.sig")
								.map_err(|e| StoreErr::Untar(tname,
										e.to_string()))?;
						let _ = std::fs::remove_file(&tdl);
						s
					},
					Err(e) => return Err(StoreErr::Download(signame, e)),
				}
			},
		};

		Ok((bytes, sig))
	}


	fn cache_mom(&self, version: Version, bytes: &[u8], sig: &[u8])
			-> Result<(), StoreErr>
	{
		use crate::util::fs::atomic_write;

		let vdir = self.dirs.version_dir(version)?;
		atomic_write(&vdir.join("Manifest.MoM"), bytes)?;
		if !sig.is_empty()
		{ atomic_write(&vdir.join("Manifest.MoM.sig"), sig)?; }
		Ok(())
	}


	/*
	 * Bundle manifests
	 */

	/// Load a bundle manifest through its MoM entry.
	pub(crate) fn load_bundle(&self, bundle: &str, mom: &Manifest)
			-> Result<Arc<Manifest>, StoreErr>
	{
		let ent = mom.bundle(bundle)
				.ok_or_else(|| StoreErr::UnknownBundle(bundle.to_string()))?;
		let bver = ent.last_change;
		let want = ent.hash;

		let key = (bver, bundle.to_string());
		if let Some(m) = self.memo.lock().unwrap().get(&key)
		{ return Ok(m.clone()); }

		let bytes = fetch_bundle_bytes(self.server, self.dirs,
				bundle, bver, &want)?;
		self.parse_gated(&bytes, bundle, key)
	}


	/// Load every subscription's bundle manifest, in parallel.
	/// Results come back in the same order as the input subs.
	pub(crate) fn recurse(&self, mom: &Manifest,
			subs: &[crate::subscription::Subscription])
			-> Result<Vec<Arc<Manifest>>, StoreErr>
	{
		use crate::core::pool::Pool as _;

		// Figure which ones actually need loading
		let mut work: Vec<BundleReq> = Vec::new();
		for s in subs
		{
			let ent = mom.bundle(&s.name)
					.ok_or_else(|| StoreErr::UnknownBundle(s.name.clone()))?;
			let key = (ent.last_change, s.name.clone());
			if self.memo.lock().unwrap().contains_key(&key) { continue; }
			work.push(BundleReq {
				bundle: s.name.clone(),
				version: ent.last_change,
				hash: ent.hash,
			});
		}

		if !work.is_empty()
		{
			let ctrl = BundleCtrl {
				server: self.server.clone(),
				dirs: self.dirs.clone(),
			};
			let pool = BundlePool { format: self.format,
					oks: Vec::new(), errs: Vec::new() };
			let got = pool.run(&ctrl, work)
					.map_err(|e| StoreErr::Parse("recurse".to_string(),
							e.to_string()))?;

			let (oks, mut errs) = got;
			if let Some(e) = errs.drain(..).next()
			{ return Err(e); }
			let mut memo = self.memo.lock().unwrap();
			for (ver, name, mf) in oks
			{
				memo.insert((ver, name), Arc::new(mf));
			}
		}

		// Hand back in subs order
		let memo = self.memo.lock().unwrap();
		let mut ret = Vec::with_capacity(subs.len());
		for s in subs
		{
			let ent = mom.bundle(&s.name)
					.ok_or_else(|| StoreErr::UnknownBundle(s.name.clone()))?;
			let m = memo.get(&(ent.last_change, s.name.clone()))
					.expect("just loaded it").clone();
			ret.push(m);
		}
		Ok(ret)
	}


	/*
	 * Common tail: parse + format gates + memoize
	 */

	fn parse_gated(&self, bytes: &[u8], what: &str,
			key: (Version, String)) -> Result<Arc<Manifest>, StoreErr>
	{
		let mf = parse::parse(bytes).map_err(|errs| {
			let joined = errs.iter().map(|e| e.to_string())
					.collect::<Vec<_>>().join("; ");
			StoreErr::Parse(what.to_string(), joined)
		})?;

		if mf.header.format > self.format
		{
			return Err(StoreErr::Incompatible {
				got: mf.header.format, ours: self.format,
			});
		}
		if let Some(min) = mf.header.minversion
		{
			if self.format < min
			{ return Err(StoreErr::MinVersion { min, ours: self.format }); }
		}

		let mf = Arc::new(mf);
		self.memo.lock().unwrap().insert(key, mf.clone());
		Ok(mf)
	}
}


/// Fetch a bundle manifest's verified bytes: cache hit if the cached
/// copy still hashes right, else download (hash-hinted name first,
/// bare name for older servers), hash-gate, cache.
fn fetch_bundle_bytes(server: &Server, dirs: &StateDirs, bundle: &str,
		bver: Version, want: &crate::util::hash::Sha256Hash)
		-> Result<Vec<u8>, StoreErr>
{
	use crate::server::http;
	use crate::util::{archive, hash};

	let vdir = dirs.version_dir(bver)?;
	let hinted = vdir.join(format!("Manifest.{}.{}", bundle, want.to_buf()));
	let bare = vdir.join(format!("Manifest.{}", bundle));

	// Cache, but never trust it blind.
	for cand in [&hinted, &bare]
	{
		if !cand.is_file() { continue; }
		if let Ok(b) = std::fs::read(cand)
		{
			if hash::sha256_buf(&b) == *want { return Ok(b); }
		}
		// Stale or corrupt; sweep it so we re-cache cleanly.
		let _ = std::fs::remove_file(cand);
	}

	// Download.  Hash-hinted is canonical; bare is the legacy name.
	let names = [
		format!("{bver}/Manifest.{bundle}.{}.tar", want.to_buf()),
		format!("{bver}/Manifest.{bundle}.tar"),
	];
	let entname = format!("Manifest.{bundle}");
	let mut lasterr = None;
	for relname in names
	{
		let url = match server.content(&relname) {
			Ok(u) => u,
			Err(e) => {
				lasterr = Some(StoreErr::Download(relname, e.into()));
				continue;
			},
		};
		let dl = dirs.download().join(format!("Manifest.{bundle}.tar"));
		match http::fetch_to_file(&server.agent, &url, &dl, false)
		{
			Ok(_) => (),
			Err(FetchErr::NotFound) => {
				lasterr = Some(StoreErr::Download(relname,
						FetchErr::NotFound));
				continue;
			},
			Err(e) => return Err(StoreErr::Download(relname, e)),
		}

		let bytes = archive::read_entry(&dl, &entname)
				.map_err(|e| StoreErr::Untar(relname, e.to_string()))?;
		let _ = std::fs::remove_file(&dl);

		// The hash gate: disagreement with the MoM means nobody
		// parses this.
		if hash::sha256_buf(&bytes) != *want
		{ return Err(StoreErr::BadHash(bundle.to_string())); }

		crate::util::fs::atomic_write(&hinted, &bytes)?;
		return Ok(bytes);
	}

	Err(lasterr.unwrap_or_else(|| StoreErr::UnknownBundle(
			bundle.to_string())))
}


/*
 * The parallel bundle-loading pool
 */

#[derive(Clone)]
struct BundleCtrl
{
	server: Server,
	dirs: StateDirs,
}

struct BundleReq
{
	bundle: String,
	version: Version,
	hash: crate::util::hash::Sha256Hash,
}

struct BundlePool
{
	format: u32,
	oks: Vec<(Version, String, Manifest)>,
	errs: Vec<StoreErr>,
}

impl crate::core::pool::Pool for BundlePool
{
	type Control = BundleCtrl;
	type UnitControl = BundleCtrl;
	fn mk_unitcontrol(c: &BundleCtrl) -> BundleCtrl { c.clone() }

	type PoolResult = (Vec<(Version, String, Manifest)>, Vec<StoreErr>);

	type WorkRequest = BundleReq;
	type WorkResult  = (Version, String, Vec<u8>);
	type WorkErr     = StoreErr;
	fn work(ctrl: &BundleCtrl, req: BundleReq)
			-> Result<Self::WorkResult, StoreErr>
	{
		let bytes = fetch_bundle_bytes(&ctrl.server, &ctrl.dirs,
				&req.bundle, req.version, &req.hash)?;
		Ok((req.version, req.bundle, bytes))
	}

	fn nthreads(&self) -> u32 { crate::core::pool::jobs_net() }

	fn work_result(&mut self,
			resp: Result<Self::WorkResult, StoreErr>)
	{
		match resp
		{
			Ok((ver, name, bytes)) => {
				// Parse on the driving thread; it's cheap next to the
				// download, and keeps the gate logic in one place.
				match parse::parse(&bytes) {
					Ok(mf) => {
						if mf.header.format > self.format
						{
							self.errs.push(StoreErr::Incompatible {
								got: mf.header.format, ours: self.format });
							return;
						}
						self.oks.push((ver, name, mf));
					},
					Err(errs) => {
						let joined = errs.iter().map(|e| e.to_string())
								.collect::<Vec<_>>().join("; ");
						self.errs.push(StoreErr::Parse(name, joined));
					},
				}
			},
			Err(e) => self.errs.push(e),
		}
	}

	fn finalize(self) -> Self::PoolResult
	{
		(self.oks, self.errs)
	}
}



/*
 * Consolidation
 */

/// Squash a pile of bundle manifests into one file list.
///
/// Identity is (path, deleted).  A live record beats any deleted
/// record at the same path; among records on the same side, the
/// newest last_change wins.  MoM-pointer records don't belong in a
/// consolidated list and are dropped.  Output is path-sorted, which
/// later stages rely on for parent-before-child ordering.
pub(crate) fn consolidate(manifests: &[Arc<Manifest>])
		-> Vec<super::FileRecord>
{
	use std::collections::HashMap;
	use super::{FileKind, FileRecord};

	let mut best: HashMap<&std::path::Path, &FileRecord> = HashMap::new();
	for m in manifests
	{
		for f in &m.files
		{
			if f.kind == FileKind::Manifest { continue; }
			match best.get(f.path.as_path())
			{
				None => { best.insert(&f.path, f); },
				Some(cur) => {
					let f_del = f.is_deleted();
					let c_del = cur.is_deleted();
					let wins = match (f_del, c_del) {
						(false, true) => true,
						(true, false) => false,
						_ => f.last_change > cur.last_change,
					};
					if wins { best.insert(&f.path, f); }
				},
			}
		}
	}

	let mut out: Vec<FileRecord> = best.into_values().cloned().collect();
	out.sort_by(|a, b| a.path.cmp(&b.path));
	out
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::testutil::{self, rec, mf};
	use crate::manifest::{FileKind, Lifecycle};

	#[test]
	fn consolidation_rules()
	{
		let ha = testutil::hash('a');
		let hb = testutil::hash('b');
		let hc = testutil::hash('c');

		// Bundle 1: has /usr/bin/foo at v10, /shared deleted at v20
		let m1 = Arc::new(mf(20, vec![
			rec("/usr/bin/foo", FileKind::File, Lifecycle::Live, 10, &ha),
			rec("/shared", FileKind::File, Lifecycle::Deleted, 20,
					&testutil::hash('0')),
		]));
		// Bundle 2: newer /usr/bin/foo at v20, /shared live at v5
		let m2 = Arc::new(mf(20, vec![
			rec("/usr/bin/foo", FileKind::File, Lifecycle::Live, 20, &hb),
			rec("/shared", FileKind::File, Lifecycle::Live, 5, &hc),
			rec("some-bundle", FileKind::Manifest, Lifecycle::Live, 20,
					&testutil::hash('d')),
		]));

		let con = consolidate(&[m1, m2]);

		// MoM pointer dropped, two paths survive, sorted
		assert_eq!(con.len(), 2);
		assert_eq!(con[0].path, std::path::Path::new("/shared"));
		assert_eq!(con[1].path, std::path::Path::new("/usr/bin/foo"));

		// Live beats deleted even when deleted is newer
		assert!(con[0].is_live());
		assert_eq!(con[0].hash.to_buf().as_ref(), hc);

		// Newest last_change wins among live dups
		assert_eq!(con[1].last_change, 20);
		assert_eq!(con[1].hash.to_buf().as_ref(), hb);
	}

	#[test]
	fn consolidation_deleted_only()
	{
		// With only deleted records at a path, newest deleted wins
		let z = testutil::hash('0');
		let m1 = Arc::new(mf(20, vec![
			rec("/gone", FileKind::File, Lifecycle::Deleted, 10, &z),
		]));
		let m2 = Arc::new(mf(20, vec![
			rec("/gone", FileKind::File, Lifecycle::Deleted, 15, &z),
		]));
		let con = consolidate(&[m1, m2]);
		assert_eq!(con.len(), 1);
		assert!(con[0].is_deleted());
		assert_eq!(con[0].last_change, 15);
	}
}
