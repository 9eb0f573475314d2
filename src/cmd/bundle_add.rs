//! $0 bundle-add
use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;
use crate::manifest;
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::BundleAdd(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;

	let op = super::op_begin(carg, true)?;
	let tracking = config.tracking_dir();

	// Anything already here is a no-op, not an error.
	let mut wanted: Vec<String> = Vec::new();
	for b in &args.bundles
	{
		match crate::subscription::is_installed(&tracking, b) {
			true  => println!("Bundle \"{b}\" is already installed"),
			false => wanted.push(b.clone()),
		}
	}
	if wanted.is_empty()
	{
		println!("Nothing to do");
		return Ok(());
	}

	let version = sv::current_version(config.path_prefix())
			.map_err(|_| UpdaterErr::CurrentVersionUnknown)?;

	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let mom = store.load_mom(version)
			.map_err(|e| super::store_err(e, true))?;

	let seeds = crate::subscription::seeds_from_requested(&wanted);
	let res = crate::subscription::resolve(&seeds, &mom, &store,
			args.skip_optional)
			.map_err(|e| super::store_err(e, false))?;
	for inv in &res.invalid
	{
		println!("Warning: bundle \"{inv}\" is invalid, skipping it...");
	}

	// Only the not-yet-installed slice of the closure needs work;
	// installed deps already have their files.
	let mut subs: Vec<_> = res.subs.into_iter()
			.filter(|s| !crate::subscription::is_installed(&tracking,
					&s.name))
			.collect();
	crate::subscription::set_versions(&mut subs, &mom, None, &tracking);
	for s in &mut subs { s.from_version = 0; }

	if subs.is_empty()
	{
		println!("Nothing new to install");
		return finish(&res.invalid);
	}

	let mfs = store.recurse(&mom, &subs)
			.map_err(|e| super::store_err(e, false))?;

	// Rough space need, from the manifests' own declarations.
	if !args.skip_diskspace_check
	{
		let need: u64 = mfs.iter()
				.map(|m| m.header.contentsize).sum();
		super::check_diskspace(config.path_prefix(), need)?;
	}

	let files = manifest::consolidate(&mfs);
	let heur = crate::heuristics::Heuristics::new(config.path_prefix());

	let mut install: Vec<manifest::FileRecord> = Vec::new();
	let mut targets: Vec<crate::core::acquire::Target> = Vec::new();
	for rec in files
	{
		if !rec.is_live() || heur.ignore(&rec) { continue; }
		targets.push(crate::core::acquire::Target {
			rel: rec.path.clone(),
			kind: rec.kind,
			from: crate::util::hash::Sha256Hash::zeros(),
			to: rec.hash,
			version: rec.last_change,
		});
		install.push(rec);
	}

	println!("Installing {} bundle{} ({} file{})", subs.len(),
			crate::util::plural(subs.len()), install.len(),
			crate::util::plural(install.len()));

	let acq = crate::core::acquire::Acquirer {
		server: &op.server,
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		use_xattrs: config.use_xattrs,
		max_retries: config.max_retries,
		retry_delay: config.retry_delay,
	};
	let stats = acq.acquire(&subs, &targets, true)
			.map_err(|e| UpdaterErr::Download(e.to_string()))?;
	if !stats.failed.is_empty()
	{
		// A bundle with even one unresolved file doesn't get its
		// marker; no half-tracked bundles.
		return Err(UpdaterErr::Download(format!(
				"{} file{} could not be downloaded",
				stats.failed.len(),
				crate::util::plural(stats.failed.len()))));
	}

	let stager = crate::core::stage::Stager {
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		no_sync: false,
	};
	stager.run(&install).map_err(super::update::stage_err)?;

	for s in &subs
	{
		super::write_marker(&tracking, &s.name)?;
		println!("Added bundle \"{}\"", s.name);
	}

	finish(&res.invalid)
}


fn finish(invalid: &[String]) -> Result<(), UpdaterErr>
{
	match invalid.is_empty() {
		true => Ok(()),
		false => Err(UpdaterErr::InvalidBundle(invalid.join(", "))),
	}
}
