//! $0 os-install
use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;
use crate::manifest;
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::OsInstall(a) => a,
		_ => unreachable!(),
	};
	// The positional target is the prefix for everything below.
	let config = carg.config.with_path_prefix(&args.path);
	std::fs::create_dir_all(&args.path)
			.map_err(|e| UpdaterErr::CreateDir(
					format!("{}: {e}", args.path.display())))?;

	let op = super::op_begin_config(&config, true)?;

	// Version: asked-for or latest.
	let target = match args.version {
		Some(v) => v,
		None => sv::server_latest(&op.server, config.format,
				op.verifier.as_ref())
				.map_err(super::update::latest_err)?,
	};
	super::format_gate(&op.server, target, config.format)?;
	println!("Installing OS version {target} into {}",
			args.path.display());

	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let mom = store.load_mom(target)
			.map_err(|e| super::store_err(e, true))?;

	// The requested set, plus os-core which is never optional.
	let mut requested = args.bundles.clone();
	if !requested.iter().any(|b| b == "os-core")
	{ requested.push("os-core".to_string()); }

	let seeds = crate::subscription::seeds_from_requested(&requested);
	let res = crate::subscription::resolve(&seeds, &mom, &store,
			args.skip_optional)
			.map_err(|e| super::store_err(e, false))?;
	for inv in &res.invalid
	{
		println!("Warning: bundle \"{inv}\" is invalid, skipping it...");
	}
	let mut subs = res.subs;
	crate::subscription::set_versions(&mut subs, &mom, None,
			&config.tracking_dir());

	// Everything's new on install: from-version 0, zero-packs.
	for s in &mut subs { s.from_version = 0; }

	let mfs = store.recurse(&mom, &subs)
			.map_err(|e| super::store_err(e, false))?;
	let files = manifest::consolidate(&mfs);

	// Install ignores nothing on the target but still skips records
	// flagged away (ghosted et al), and it trusts absence: no hash
	// rechecks of what's already there ("quick" is implicit).
	let heur = crate::heuristics::Heuristics::new(config.path_prefix());
	let mut install: Vec<manifest::FileRecord> = Vec::new();
	let mut targets: Vec<crate::core::acquire::Target> = Vec::new();
	for rec in files
	{
		if !rec.is_live() { continue; }
		if heur.ignore(&rec) { continue; }
		targets.push(crate::core::acquire::Target {
			rel: rec.path.clone(),
			kind: rec.kind,
			from: crate::util::hash::Sha256Hash::zeros(),
			to: rec.hash,
			version: rec.last_change,
		});
		install.push(rec);
	}
	println!("Installing {} file{} from {} bundle{}", install.len(),
			crate::util::plural(install.len()), subs.len(),
			crate::util::plural(subs.len()));

	// A sibling statedir can seed our cache for free.
	if let Some(cache) = &args.statedir_cache
	{
		seed_from_statedir(&op.dirs, cache, &targets, config.use_xattrs);
	}

	let acq = crate::core::acquire::Acquirer {
		server: &op.server,
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		use_xattrs: config.use_xattrs,
		max_retries: config.max_retries,
		retry_delay: config.retry_delay,
	};
	let stats = acq.acquire(&subs, &targets, true)
			.map_err(|e| UpdaterErr::PackDownload(e.to_string()))?;
	if !stats.failed.is_empty() && !args.force
	{
		return Err(UpdaterErr::Download(format!(
				"{} file{} could not be downloaded",
				stats.failed.len(),
				crate::util::plural(stats.failed.len()))));
	}

	if args.download
	{
		println!("Download complete; nothing installed (--download)");
		return Ok(());
	}

	let stager = crate::core::stage::Stager {
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		no_sync: false,
	};
	stager.run(&install).map_err(super::update::stage_err)?;

	// Markers: the whole installed closure becomes tracked, but only
	// after its files are all in place.
	let tracking = config.tracking_dir();
	for s in &subs
	{
		super::write_marker(&tracking, &s.name)?;
	}

	sv::pivot_version_file(config.path_prefix(), target)
			.map_err(|e| UpdaterErr::WriteFile(e.to_string()))?;

	println!("Installation complete: version {target}, {} bundle{}",
			subs.len(), crate::util::plural(subs.len()));

	// Invalid requested bundles surface in the exit code even though
	// the rest of the install went through.
	match res.invalid.is_empty() {
		true => Ok(()),
		false => Err(UpdaterErr::InvalidBundle(res.invalid.join(", "))),
	}
}


/// Hardlink verified blobs over from another statedir's cache.
fn seed_from_statedir(dirs: &crate::core::StateDirs,
		cache: &std::path::Path,
		targets: &[crate::core::acquire::Target], use_xattrs: bool)
{
	let cstaged = cache.join("staged");
	if !cstaged.is_dir() { return; }

	let mut seeded = 0usize;
	for t in targets
	{
		let name = t.to.to_buf();
		let src = cstaged.join(name.as_ref());
		let dst = dirs.staged_path(&t.to);
		if dst.exists() { continue; }
		if crate::util::fs::lstat(&src).is_err() { continue; }

		if crate::util::fs::link_or_copy(&src, &dst).is_err() { continue; }
		// Trust nothing, even a sibling cache.
		match crate::util::hash::hash_of(&dst, use_xattrs) {
			Ok(h) if h == t.to => seeded += 1,
			_ => { let _ = std::fs::remove_file(&dst); },
		}
	}
	if seeded > 0
	{
		println!("Seeded {seeded} file{} from {}",
				crate::util::plural(seeded), cache.display());
	}
}
