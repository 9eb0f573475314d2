//! Content acquisition: realizing staged blobs.
//!
//! Given (from, to) hash pairs to make real, work cheapest-first:
//! already staged, then whatever pack downloads populate in bulk, then
//! binary deltas against local files, then fullfile downloads as the
//! always-available slow path.  Packs failing is fine (they're an
//! optimization and aren't generated for every hop); a fullfile
//! failing after retries means that target just can't be realized,
//! and the caller decides how fatal that is.

use std::path::{Path, PathBuf};

use crate::core::StateDirs;
use crate::core::pool::fetch::Fetcher;
use crate::manifest::{FileKind, Version};
use crate::server::Server;
use crate::subscription::Subscription;
use crate::util::hash::{self, Sha256Hash};


/// One blob to realize.
#[derive(Debug, Clone)]
pub(crate) struct Target
{
	/// Final path (manifest-relative); deltas read the local copy.
	pub(crate) rel: PathBuf,

	pub(crate) kind: FileKind,

	/// Hash of the previous version's record; zeros when there wasn't
	/// one.
	pub(crate) from: Sha256Hash,

	/// What must exist at <staged>/<to> when we're done.
	pub(crate) to: Sha256Hash,

	/// The record's last_change; names the /files/ dir on the server.
	pub(crate) version: Version,
}


/// The tallies, for the end-of-run statistics line.
#[derive(Debug, Default)]
pub(crate) struct AcquireStats
{
	pub(crate) already_staged: u32,
	pub(crate) packs: u32,
	pub(crate) delta_hits: u32,
	pub(crate) delta_misses: u32,
	pub(crate) fullfiles: u32,

	/// Targets nothing could realize.
	pub(crate) failed: Vec<Target>,
}


pub(crate) struct Acquirer<'a>
{
	pub(crate) server: &'a Server,
	pub(crate) dirs: &'a StateDirs,
	pub(crate) prefix: &'a Path,
	pub(crate) use_xattrs: bool,
	pub(crate) max_retries: u32,
	pub(crate) retry_delay: u32,
}


impl<'a> Acquirer<'a>
{
	/// The main event.  `subs` drives which packs to try; pass the
	/// empty slice to skip packs entirely (verify --fix does).
	pub(crate) fn acquire(&self, subs: &[Subscription], targets: &[Target],
			zero_packs: bool) -> Result<AcquireStats, anyhow::Error>
	{
		let mut stats = AcquireStats::default();

		// Step 1: what's already in hand?
		let mut todo: Vec<&Target> = Vec::new();
		let mut seen = std::collections::HashSet::new();
		for t in targets
		{
			if !seen.insert(t.to) { continue; }
			match self.staged_ok(&t.to) {
				true  => stats.already_staged += 1,
				false => todo.push(t),
			}
		}
		if todo.is_empty() { return Ok(stats) }

		// Step 2: packs.  Zero-packs on the install path, delta packs
		// when moving between versions.
		stats.packs = self.fetch_packs(subs, zero_packs)?;
		if stats.packs > 0
		{
			todo.retain(|t| !self.staged_ok(&t.to));
		}

		// Step 3: deltas, for targets with a usable local base and an
		// extracted delta binary.
		if todo.iter().any(|t| self.delta_candidate(t))
		{
			let (hits, misses) = self.apply_deltas(&todo)?;
			stats.delta_hits = hits;
			stats.delta_misses = misses;
			if hits > 0
			{ todo.retain(|t| !self.staged_ok(&t.to)); }
		}

		// Step 4: fullfiles for whatever's left.
		if !todo.is_empty()
		{
			stats.fullfiles = self.fetch_fullfiles(&todo)?;
			for t in todo
			{
				if !self.staged_ok(&t.to)
				{ stats.failed.push(t.clone()); }
			}
		}

		Ok(stats)
	}


	/// Is a verified blob already sitting in the cache?  Verified
	/// means verified; the staged-name-equals-hash invariant is load
	/// bearing for everything downstream.
	fn staged_ok(&self, to: &Sha256Hash) -> bool
	{
		let blob = self.dirs.staged_path(to);
		match hash::hash_of(&blob, self.use_xattrs) {
			Ok(h) => h == *to,
			Err(_) => false,
		}
	}


	/*
	 * Packs
	 */

	/// Download + extract packs for the subscriptions that moved.
	/// Returns how many packs landed.  Missing packs are expected
	/// (the server doesn't generate every combination) and only rate
	/// a telemetry record.
	fn fetch_packs(&self, subs: &[Subscription], zero_packs: bool)
			-> Result<u32, anyhow::Error>
	{
		let state_root = self.dirs.root().to_path_buf();
		let mut fetcher = Fetcher::new(&self.server.agent,
				self.max_retries, self.retry_delay);

		for sub in subs
		{
			let from = match zero_packs {
				true  => 0,
				false => sub.from_version,
			};
			if sub.from_version == sub.to_version && !zero_packs
			{ continue; }
			if sub.to_version == 0 { continue; }

			let marker = self.dirs.pack_path(sub.to_version, &sub.name,
					from)?;
			// A zero-size marker means already downloaded+extracted.
			if let Ok(md) = std::fs::metadata(&marker)
			{
				if md.len() == 0 { continue; }
			}

			let rel = format!("{}/pack-{}-from-{}.tar",
					sub.to_version, sub.name, from);
			let url = self.server.content(&rel)?;
			let key = format!("pack-{}-from-{}-to-{}",
					sub.name, from, sub.to_version);
			fetcher.enqueue(url, marker, key);
		}

		if fetcher.len() == 0 { return Ok(0) }
		println!("Downloading {} pack{}...", fetcher.len(),
				crate::util::plural(fetcher.len()));

		// Extraction runs on the driving thread as packs arrive; the
		// pack tar carries staged/ and delta/ subtrees that unpack
		// straight into the state dir.
		let mut extracted: u32 = 0;
		fetcher.on_done(|res| {
			match crate::util::archive::extract_to(&res.dest, &state_root)
			{
				Ok(_) => {
					// Truncate to a zero-size marker so the next run
					// skips the download.
					let _ = std::fs::File::create(&res.dest);
					extracted += 1;
					true
				},
				Err(e) => {
					eprintln!("Extracting pack {}: {e}",
							res.dest.display());
					false
				},
			}
		});

		let summary = fetcher.run();
		for f in &summary.failed
		{
			use crate::server::FetchErr;
			match f.err {
				FetchErr::NotFound => {
					crate::telemetry::record(&self.dirs.telemetry(),
							crate::telemetry::Level::Warn, "packmissing",
							&format!("url={}", f.req.url));
				},
				_ => eprintln!("Pack download failed: {}: {}",
						f.req.url, f.err),
			}
			let _ = std::fs::remove_file(&f.req.dest);
		}

		Ok(extracted)
	}


	/*
	 * Deltas
	 */

	fn delta_candidate(&self, t: &Target) -> bool
	{
		t.kind == FileKind::File
				&& !t.from.is_zeros()
				&& t.from != t.to
				&& self.dirs.delta_path(&t.from, &t.to).is_file()
	}

	fn apply_deltas(&self, todo: &[&Target])
			-> Result<(u32, u32), anyhow::Error>
	{
		use crate::core::pool::Pool as _;
		use crate::core::pool::delta;

		let reqs: Vec<delta::Req> = todo.iter()
				.filter(|t| self.delta_candidate(t))
				.map(|t| delta::Req {
					src: crate::util::path_join(self.prefix, &t.rel),
					patch: self.dirs.delta_path(&t.from, &t.to),
					to: t.to,
				})
				.collect();
		if reqs.is_empty() { return Ok((0, 0)) }

		let ctrl = delta::Control {
			staged: self.dirs.staged(),
			use_xattrs: self.use_xattrs,
		};
		let res = delta::Deltas::default().run(&ctrl, reqs)?;
		Ok((res.hits, res.misses))
	}


	/*
	 * Fullfiles
	 */

	fn fetch_fullfiles(&self, todo: &[&Target])
			-> Result<u32, anyhow::Error>
	{
		let staged = self.dirs.staged();
		let mut fetcher = Fetcher::new(&self.server.agent,
				self.max_retries, self.retry_delay);

		for t in todo
		{
			let hb = t.to.to_buf();
			let rel = format!("{}/files/{}.tar", t.version, hb);
			let url = self.server.content(&rel)?;
			let dest = self.dirs.download().join(format!("{hb}.tar"));
			fetcher.enqueue(url, dest, hb.to_string());
		}
		if fetcher.len() == 0 { return Ok(0) }

		println!("Downloading {} file{}...", fetcher.len(),
				crate::util::plural(fetcher.len()));

		let use_xattrs = self.use_xattrs;
		let mut landed: u32 = 0;
		fetcher.on_done(|res| {
			// Fullfile tar: one entry named by the hash.  Extract
			// into the staged dir, then the mandatory re-hash.
			let ok = match crate::util::archive::extract_to(&res.dest,
					&staged)
			{
				Ok(_) => {
					let want: Sha256Hash = match res.key.parse() {
						Ok(h) => h,
						Err(_) => return false,
					};
					let blob = staged.join(&res.key);
					match hash::hash_of(&blob, use_xattrs) {
						Ok(h) if h == want => true,
						_ => {
							// Poisoned blob must not stay under the
							// name the invariant promises about.
							let _ = std::fs::remove_file(&blob);
							eprintln!("Downloaded file hashed wrong: {}",
									res.key);
							false
						},
					}
				},
				Err(e) => {
					eprintln!("Extracting {}: {e}", res.dest.display());
					false
				},
			};
			let _ = std::fs::remove_file(&res.dest);
			if ok { landed += 1; }
			ok
		});

		let summary = fetcher.run();
		for f in &summary.failed
		{
			eprintln!("Failed to download: {}: {}", f.req.url, f.err);
		}

		Ok(landed)
	}
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::testutil;

	/// A local content store served over file://, which exercises the
	/// whole acquisition path without a network.
	struct World
	{
		_tmp: tempfile::TempDir,
		dirs: StateDirs,
		prefix: PathBuf,
		server: Server,
		content: PathBuf,
	}

	fn mk_world() -> World
	{
		let tmp = tempfile::tempdir().unwrap();
		let dirs = StateDirs::init(&tmp.path().join("state")).unwrap();
		let prefix = tmp.path().join("root");
		std::fs::create_dir(&prefix).unwrap();
		let content = tmp.path().join("content");
		std::fs::create_dir(&content).unwrap();

		let url = url::Url::from_directory_path(&content).unwrap();
		let server = Server {
			agent: ureq::AgentBuilder::new().build(),
			version_url: url.clone(),
			content_url: url,
		};
		World { _tmp: tmp, dirs, prefix, server, content }
	}

	fn acq(w: &World) -> Acquirer
	{
		Acquirer {
			server: &w.server,
			dirs: &w.dirs,
			prefix: &w.prefix,
			use_xattrs: false,
			max_retries: 0,
			retry_delay: 1,
		}
	}

	/// Drop a fullfile tarball for some content into the content
	/// store; returns its canonical hash.
	fn serve_fullfile(w: &World, version: Version, contents: &[u8])
			-> Sha256Hash
	{
		// Build the blob in scratch to learn its hash
		let scratch = w.dirs.download().join("mk");
		std::fs::write(&scratch, contents).unwrap();
		let h = hash::hash_of(&scratch, false).unwrap();

		let fdir = w.content.join(format!("{version}/files"));
		std::fs::create_dir_all(&fdir).unwrap();
		let tarpath = fdir.join(format!("{}.tar", h.to_buf()));

		let fh = std::fs::File::create(&tarpath).unwrap();
		let mut tb = tar::Builder::new(fh);
		tb.append_path_with_name(&scratch, h.to_buf().as_ref()).unwrap();
		tb.into_inner().unwrap();
		std::fs::remove_file(&scratch).unwrap();
		h
	}

	fn target(rel: &str, from: Sha256Hash, to: Sha256Hash, v: Version)
			-> Target
	{
		Target {
			rel: rel.into(),
			kind: FileKind::File,
			from, to, version: v,
		}
	}

	#[test]
	fn fullfile_fallback()
	{
		let w = mk_world();
		let h = serve_fullfile(&w, 100, b"vim contents");

		let t = target("/usr/bin/vim", Sha256Hash::zeros(), h, 100);
		let stats = acq(&w).acquire(&[], &[t], false).unwrap();

		assert_eq!(stats.fullfiles, 1);
		assert!(stats.failed.is_empty());
		assert_eq!(hash::hash_of(&w.dirs.staged_path(&h), false).unwrap(),
				h);
	}

	#[test]
	fn already_staged_short_circuits()
	{
		let w = mk_world();
		let h = serve_fullfile(&w, 100, b"some stuff");

		let t = target("/f", Sha256Hash::zeros(), h, 100);
		let stats = acq(&w).acquire(&[], &[t.clone()], false).unwrap();
		assert_eq!(stats.fullfiles, 1);

		// Second acquire of the same thing touches nothing
		let stats = acq(&w).acquire(&[], &[t], false).unwrap();
		assert_eq!(stats.already_staged, 1);
		assert_eq!(stats.fullfiles, 0);
	}

	#[test]
	fn zero_pack_populates()
	{
		let w = mk_world();

		// Build a staged blob and pack it as staged/<hash>
		let scratch = w.dirs.download().join("mk");
		std::fs::write(&scratch, b"from the pack").unwrap();
		let h = hash::hash_of(&scratch, false).unwrap();

		let vdir = w.content.join("100");
		std::fs::create_dir_all(&vdir).unwrap();
		let fh = std::fs::File::create(
				vdir.join("pack-editors-from-0.tar")).unwrap();
		let mut tb = tar::Builder::new(fh);
		tb.append_path_with_name(&scratch,
				format!("staged/{}", h.to_buf())).unwrap();
		tb.into_inner().unwrap();

		let subs = vec![Subscription {
			name: "editors".to_string(),
			from_version: 0, to_version: 100, optional: false,
		}];
		let t = target("/usr/bin/ed", Sha256Hash::zeros(), h, 100);
		let stats = acq(&w).acquire(&subs, &[t], true).unwrap();

		assert_eq!(stats.packs, 1);
		assert_eq!(stats.fullfiles, 0, "pack covered it");
		assert!(stats.failed.is_empty());

		// And the marker is a zero-size file now
		let marker = w.dirs.pack_path(100, "editors", 0).unwrap();
		assert_eq!(std::fs::metadata(&marker).unwrap().len(), 0);
	}

	#[test]
	fn missing_pack_tolerated()
	{
		let w = mk_world();
		let h = serve_fullfile(&w, 100, b"fallback wins");

		let subs = vec![Subscription {
			name: "ghost-bundle".to_string(),
			from_version: 0, to_version: 100, optional: false,
		}];
		let t = target("/g", Sha256Hash::zeros(), h, 100);
		let stats = acq(&w).acquire(&subs, &[t], true).unwrap();

		assert_eq!(stats.packs, 0);
		assert_eq!(stats.fullfiles, 1);
		assert!(stats.failed.is_empty());
	}

	#[test]
	fn delta_path_over_fullfile()
	{
		let w = mk_world();

		// Local file at its "from" state
		std::fs::create_dir_all(w.prefix.join("usr")).unwrap();
		let local = w.prefix.join("usr/foo");
		std::fs::write(&local, b"old contents here").unwrap();
		let from = hash::hash_of(&local, false).unwrap();

		// The "to" blob: same stat, new contents
		let scratch = w.dirs.download().join("mk");
		std::fs::write(&scratch, b"new contents here").unwrap();
		let lst = crate::util::fs::lstat(&local).unwrap();
		crate::util::fs::apply_stat(&scratch, lst.perms, lst.uid,
				lst.gid).unwrap();
		let to = hash::hash_of(&scratch, false).unwrap();
		std::fs::remove_file(&scratch).unwrap();

		// Drop the delta binary where a pack would have put it
		use qbsdiff::Bsdiff;
		let mut patb = Vec::new();
		Bsdiff::new(b"old contents here", b"new contents here")
				.compare(std::io::Cursor::new(&mut patb)).unwrap();
		std::fs::write(w.dirs.delta_path(&from, &to), &patb).unwrap();

		let t = target("/usr/foo", from, to, 100);
		let stats = acq(&w).acquire(&[], &[t], false).unwrap();

		assert_eq!(stats.delta_hits, 1);
		assert_eq!(stats.delta_misses, 0);
		assert_eq!(stats.fullfiles, 0, "no fullfile needed");
		assert!(stats.failed.is_empty());
	}

	#[test]
	fn delta_miss_falls_through()
	{
		let w = mk_world();

		std::fs::create_dir_all(w.prefix.join("usr")).unwrap();
		let local = w.prefix.join("usr/foo");
		std::fs::write(&local, b"old contents here").unwrap();
		let from = hash::hash_of(&local, false).unwrap();

		// Serve the real to-file, and plant a delta that produces
		// SOMETHING ELSE (diff against different base).
		let to = serve_fullfile(&w, 100, b"the real new contents");

		use qbsdiff::Bsdiff;
		let mut patb = Vec::new();
		Bsdiff::new(b"old contents here", b"wrong output entirely")
				.compare(std::io::Cursor::new(&mut patb)).unwrap();
		std::fs::write(w.dirs.delta_path(&from, &to), &patb).unwrap();

		let t = target("/usr/foo", from, to, 100);
		let stats = acq(&w).acquire(&[], &[t], false).unwrap();

		assert_eq!(stats.delta_misses, 1);
		assert_eq!(stats.fullfiles, 1, "fullfile fallback kicked in");
		assert!(stats.failed.is_empty());
		assert_eq!(hash::hash_of(&w.dirs.staged_path(&to),
				false).unwrap(), to);
	}

	#[test]
	fn unrealizable_target_reported()
	{
		let w = mk_world();
		let ghost: Sha256Hash = testutil::hash('9').parse().unwrap();

		let t = target("/nowhere", Sha256Hash::zeros(), ghost, 100);
		let stats = acq(&w).acquire(&[], &[t], false).unwrap();
		assert_eq!(stats.failed.len(), 1);
	}
}
