//! $0 verify / repair / diagnose
//!
//! Compare the subscription closure against disk; with fix, drive
//! acquisition+staging+rename per mismatch.  Unlike update, which
//! stages a whole validated change set before any rename, this path
//! corrects file-by-file as it walks -- it exists to rescue systems
//! that update can no longer run on, so each file fixed is strictly
//! better than none.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::core::Counts;
use crate::error::UpdaterErr;
use crate::manifest::{self, FileRecord};
use crate::server::version as sv;

use regex_lite::Regex;


const DEFAULT_PICKY_TREE: &str = "/usr";
const DEFAULT_WHITELIST: &str =
		"/usr/lib/modules|/usr/lib/kernel|/usr/local|/usr/src";


pub(crate) fn run(carg: &CmdArg, force_fix: bool) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::Verify(a) | CrCmds::Repair(a) | CrCmds::Diagnose(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;
	let fixing = args.fix || force_fix;

	// -B only means something against a pinned version; against
	// "whatever's current" it silently verifies the wrong subset.
	if !args.bundles.is_empty() && args.version.is_none()
	{
		return Err(UpdaterErr::InvalidOption(
				"--bundles requires an explicit --version".to_string()));
	}

	// The picky pass removes files on its own, so it needs the lock
	// even when the main walk is read-only.
	let picky = args.picky || args.extra_files_only;
	let op = super::op_begin(carg, fixing || picky)?;

	let version = match args.version {
		Some(v) => v,
		None => sv::current_version(config.path_prefix())
				.map_err(|_| UpdaterErr::CurrentVersionUnknown)?,
	};
	println!("Verifying version {version}");

	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let mom = store.load_mom(version)
			.map_err(|e| super::store_err(e, true))?;

	// The subscription set: requested bundles, or the system's.
	let tracking = config.tracking_dir();
	let seeds = match args.bundles.is_empty() {
		true  => crate::subscription::seeds_for_system(&tracking),
		false => crate::subscription::seeds_from_requested(&args.bundles),
	};
	let res = crate::subscription::resolve(&seeds, &mom, &store, false)
			.map_err(|e| super::store_err(e, false))?;
	for inv in &res.invalid
	{
		println!("Warning: bundle \"{inv}\" is invalid, skipping it...");
	}
	let mut subs = res.subs;
	crate::subscription::set_versions(&mut subs, &mom, Some(&mom),
			&tracking);

	let mfs = store.recurse(&mom, &subs)
			.map_err(|e| super::store_err(e, false))?;
	let files = manifest::consolidate(&mfs);

	let heur = crate::heuristics::Heuristics::new(config.path_prefix());
	let mut counts = Counts::default();

	// Restrict to --file if given
	let keep_path = |rec: &FileRecord| -> bool {
		match &args.file {
			None => true,
			Some(f) => rec.path == *f || rec.path.starts_with(f),
		}
	};

	if !args.extra_files_only
	{
		verify_tree(&op, config, &heur, &files, &subs, fixing, args.quick,
				args.force, keep_path, &mut counts)?;
	}

	// The picky pass: on-disk files no manifest claims get removed
	// (that's what asking for picky means, fix or no fix).
	if picky
	{
		picky_pass(config, args, &files, &mut counts)?;
	}

	counts.report(fixing);

	// Fix/install always schedules the boot homework; a repaired
	// system can't know what was stale.
	if fixing
	{
		let needs = crate::scripts::Needs {
			update_boot: true,
			update_bootloader: true,
			systemd_reexec: false,
		};
		crate::scripts::run(&needs, config.path_prefix(),
				config.no_scripts).join();
		crate::util::fs::sync();
	}

	// Picky extras it managed to delete aren't failures; unfixed or
	// unremovable things are.
	let issues = counts.missing + counts.mismatch + counts.extraneous;
	match fixing {
		true => match counts.clean() {
			true  => { println!("Fix successful"); Ok(()) },
			false => Err(UpdaterErr::VerifyFailed),
		},
		false => match issues == 0 && counts.not_deleted == 0 {
			true  => { println!("Verify successful"); Ok(()) },
			false => Err(UpdaterErr::VerifyFailed),
		},
	}
}


/// The main comparison walk (and repair driver).
fn verify_tree(op: &super::Op, config: &crate::config::Config,
		heur: &crate::heuristics::Heuristics, files: &[FileRecord],
		subs: &[crate::subscription::Subscription], fixing: bool,
		quick: bool, force: bool, keep_path: impl Fn(&FileRecord) -> bool,
		counts: &mut Counts) -> Result<(), UpdaterErr>
{
	// What are we even looking at?
	let live: Vec<&FileRecord> = files.iter()
			.filter(|r| r.is_live() && !heur.ignore(r) && keep_path(r))
			.collect();

	// Hash the live set (or just existence-check it for --quick).
	let mut missing: Vec<&FileRecord> = Vec::new();
	let mut mismatched: Vec<&FileRecord> = Vec::new();
	match quick
	{
		true => {
			// Quick skips hashing; presence and type are still worth
			// knowing, which is what a disk-populated record gives.
			for rec in &live
			{
				counts.checked += 1;
				let disk = crate::util::path_join(config.path_prefix(),
						&rec.path);
				match FileRecord::populate(&rec.path, &disk) {
					Ok(ondisk) if ondisk.kind == rec.kind => (),
					Ok(_) => {
						// Wrong type counts as missing; quick's
						// promise is "the right kind of thing is
						// there".
						missing.push(rec);
					},
					Err(_) => missing.push(rec),
				}
			}
		},
		false => {
			let rels: Vec<PathBuf> = live.iter()
					.map(|r| r.path.clone()).collect();
			let scanned = crate::core::pool::scan::scan(
					config.path_prefix().to_path_buf(),
					config.use_xattrs, rels)
					.map_err(|e| UpdaterErr::ComputeHash(e.to_string()))?;
			for e in &scanned.errs
			{
				eprintln!("Couldn't hash {}: {}", e.rel.display(), e.err);
			}

			for rec in &live
			{
				counts.checked += 1;
				let got = match scanned.hashes.get(&rec.path) {
					Some(h) => *h,
					None => continue,  // hash error, already reported
				};
				if got == rec.hash { continue; }
				match got.is_zeros() {
					true  => missing.push(rec),
					false => {
						println!("Hash mismatch for file: {}",
								rec.path.display());
						mismatched.push(rec);
					},
				}
			}
		},
	}
	counts.missing = missing.len() as u32;
	counts.mismatch = mismatched.len() as u32;
	for rec in &missing
	{
		if fixing { continue; }  // fixing prints fixed/not fixed instead
		println!("Missing file: {}", rec.path.display());
	}

	if !fixing
	{
		// Plain verify also counts would-be deletions
		for rec in files.iter().filter(|r| r.is_deleted())
		{
			if heur.ignore(rec) || !keep_path(rec) { continue; }
			let disk = crate::util::path_join(config.path_prefix(),
					&rec.path);
			if crate::util::fs::lstat(&disk).is_ok()
			{ counts.extraneous += 1; }
		}
		return Ok(());
	}

	/*
	 * Repair mode from here down.
	 */

	// Acquire everything broken in one go (fullfiles; no packs on
	// the repair path).
	let wanted: Vec<crate::core::acquire::Target> = missing.iter()
			.chain(mismatched.iter())
			.map(|r| crate::core::acquire::Target {
				rel: r.path.clone(),
				kind: r.kind,
				from: crate::util::hash::Sha256Hash::zeros(),
				to: r.hash,
				version: r.last_change,
			})
			.collect();
	let acq = crate::core::acquire::Acquirer {
		server: &op.server,
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		use_xattrs: config.use_xattrs,
		max_retries: config.max_retries,
		retry_delay: config.retry_delay,
	};
	let astats = acq.acquire(subs, &wanted, false)
			.map_err(|e| UpdaterErr::Download(e.to_string()))?;
	let unrealized: HashSet<&Path> = astats.failed.iter()
			.map(|t| t.rel.as_path()).collect();

	// Fix one file at a time: missing first (adding files is the
	// safest thing we do), then mismatches.
	let stager = crate::core::stage::Stager {
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		no_sync: false,
	};
	let mut fix_one = |rec: &FileRecord, was_missing: bool| {
		let (good, bad): (&mut u32, &mut u32) = match was_missing {
			true  => (&mut counts.replaced, &mut counts.not_replaced),
			false => (&mut counts.fixed, &mut counts.not_fixed),
		};

		if unrealized.contains(rec.path.as_path())
		{
			*bad += 1;
			println!("\tnot fixed (no content): {}", rec.path.display());
			return;
		}

		let one = [rec.clone()];
		match stager.run(&one) {
			Ok(_) => (),
			Err(e) => {
				*bad += 1;
				println!("\tnot fixed ({e}): {}", rec.path.display());
				return;
			},
		}

		// Judge success by re-hashing, not by optimism.
		let disk = crate::util::path_join(config.path_prefix(),
				&rec.path);
		match crate::util::hash::hash_of(&disk, config.use_xattrs) {
			Ok(h) if h == rec.hash => {
				*good += 1;
				println!("\tfixed: {}", rec.path.display());
			},
			_ => {
				*bad += 1;
				println!("\tnot fixed: {}", rec.path.display());
			},
		}
	};

	println!("Adding any missing files");
	for rec in &missing { fix_one(rec, true); }

	if !quick
	{
		println!("Fixing modified files");
		for rec in &mismatched { fix_one(rec, false); }
	}

	// Removing files could be risky, so only do it if the prior
	// phases had no problems (or the user forced our hand).
	if (counts.not_fixed == 0 && counts.not_replaced == 0) || force
	{
		for rec in files.iter().rev()
		{
			if !rec.is_deleted() || heur.ignore(rec) || !keep_path(rec)
			{ continue; }
			let disk = crate::util::path_join(config.path_prefix(),
					&rec.path);
			let st = match crate::util::fs::lstat(&disk) {
				Ok(st) => st,
				Err(_) => continue,  // correctly absent
			};

			counts.extraneous += 1;
			let res = match st.is_dir() {
				true  => std::fs::remove_dir(&disk),
				false => std::fs::remove_file(&disk),
			};
			match res {
				Ok(_) => {
					counts.deleted += 1;
					println!("Deleted {}", disk.display());
				},
				Err(e) => {
					counts.not_deleted += 1;
					println!("Failed to remove {}: {e}", disk.display());
				},
			}
		}
	}

	Ok(())
}


/// The picky pass: walk a subtree and flag (or remove) what no
/// manifest owns.
fn picky_pass(config: &crate::config::Config,
		args: &crate::command::line::CrCmdVerify, files: &[FileRecord],
		counts: &mut Counts) -> Result<(), UpdaterErr>
{
	let tree = args.picky_tree.clone()
			.unwrap_or_else(|| PathBuf::from(DEFAULT_PICKY_TREE));
	let wl = args.picky_whitelist.as_deref()
			.unwrap_or(DEFAULT_WHITELIST);
	let wl = Regex::new(&format!("^({wl})"))
			.map_err(|e| UpdaterErr::InvalidOption(
					format!("bad whitelist regex: {e}")))?;

	let known: HashSet<&Path> = files.iter()
			.map(|r| r.path.as_path()).collect();

	println!("Checking for extra files under {}", tree.display());
	let root = crate::util::path_join(config.path_prefix(), &tree);
	let mut extras: Vec<PathBuf> = Vec::new();
	walk_extras(&root, config.path_prefix(), &known, &wl, &mut extras);

	// The bundle-tracking dir is our own bookkeeping, not bundle
	// content; picky doesn't get to eat it.
	extras.retain(|p| !p.starts_with("/usr/share/clear/bundles"));

	// Deepest first, so emptied dirs can go too.
	extras.sort();
	extras.reverse();
	for rel in extras
	{
		counts.picky_extraneous += 1;
		let disk = crate::util::path_join(config.path_prefix(), &rel);
		let isdir = crate::util::fs::lstat(&disk)
				.map(|st| st.is_dir()).unwrap_or(false);
		let res = match isdir {
			true  => std::fs::remove_dir(&disk),
			false => std::fs::remove_file(&disk),
		};
		match res {
			Ok(_) => {
				counts.deleted += 1;
				println!(" -> deleted {}", rel.display());
			},
			Err(e) => {
				counts.not_deleted += 1;
				println!(" -> couldn't delete {}: {e}", rel.display());
			},
		}
	}
	Ok(())
}


/// Recursive walk collecting manifest-unknown paths (prefix-relative).
fn walk_extras(dir: &Path, prefix: &Path, known: &HashSet<&Path>,
		wl: &Regex, out: &mut Vec<PathBuf>)
{
	let rd = match std::fs::read_dir(dir) {
		Ok(rd) => rd,
		Err(_) => return,
	};

	for ent in rd.flatten()
	{
		let disk = ent.path();
		let rel = match disk.strip_prefix(prefix) {
			Ok(r) => Path::new("/").join(r),
			Err(_) => continue,
		};

		// Whitelist matches prune whole subtrees.
		if wl.is_match(&rel.to_string_lossy()) { continue; }

		let isdir = ent.file_type().map(|t| t.is_dir())
				.unwrap_or(false);
		if !known.contains(rel.as_path())
		{ out.push(rel.clone()); }
		if isdir
		{ walk_extras(&disk, prefix, known, wl, out); }
	}
}
