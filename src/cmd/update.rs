//! $0 update
use std::collections::HashMap;
use std::path::PathBuf;

use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;
use crate::manifest;
use crate::progress::{self, Event};
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::Update(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;

	// Third-party repos are somebody else's department, by design.
	if let Some(repo) = &args.repo
	{
		return Err(UpdaterErr::InvalidRepository(format!(
				"'{repo}': third-party repositories are managed by \
				their own tooling")));
	}

	let op = super::op_begin(carg, !args.status)?;
	let mut sink = progress::sink_for(carg.clargs.json_output);
	let step = |sink: &mut Box<dyn progress::Sink>, s: &str| {
		sink.event(&Event::StepStart { step: s.to_string() });
	};

	// Where are we, where could we go?
	let cur = sv::current_version(config.path_prefix())
			.map_err(|_| UpdaterErr::CurrentVersionUnknown)?;
	let target = match args.version {
		Some(v) => v,
		None => sv::server_latest(&op.server, config.format,
				op.verifier.as_ref())
				.map_err(latest_err)?,
	};

	if args.status
	{
		sink.info(&format!("Current OS version: {cur}"));
		sink.info(&format!("Latest server version: {target}"));
		match target > cur {
			true  => { sink.info(&format!("There is a new OS version \
					available: {target}")); Ok(()) },
			false => Err(UpdaterErr::No(String::new())),
		}?;
		return Ok(());
	}

	if target <= cur
	{
		sink.info(&format!("Version on server ({target}) is not newer \
				than system version ({cur})"));
		return Ok(());
	}

	sink.info(&format!("Preparing to update from {cur} to {target}"));
	super::format_gate(&op.server, target, config.format)?;

	// Fresh scratch space; stale half-downloads help nobody.
	op.dirs.clear_download()
			.map_err(|e| UpdaterErr::CreateDir(e.to_string()))?;

	// Manifests.  The old MoM is best-effort (no deltas without it);
	// the new one is load-bearing and signature-gated.
	step(&mut sink, "Querying manifests");
	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let old_mom = store.load_mom(cur).ok();
	let new_mom = store.load_mom(target)
			.map_err(|e| super::store_err(e, true))?;

	// Subscriptions: what's tracked here, closed over includes.
	let tracking = config.tracking_dir();
	let seeds = crate::subscription::seeds_for_system(&tracking);
	let res = crate::subscription::resolve(&seeds, &new_mom, &store, false)
			.map_err(|e| super::store_err(e, false))?;
	for inv in &res.invalid
	{
		sink.info(&format!("Warning: tracked bundle \"{inv}\" is not \
				in the new release; skipping it"));
	}
	let mut subs = res.subs;
	crate::subscription::set_versions(&mut subs, &new_mom,
			old_mom.as_deref(), &tracking);

	// Pull the bundle manifests (in parallel) on both sides and
	// consolidate.
	let new_mfs = store.recurse(&new_mom, &subs)
			.map_err(|e| super::store_err(e, false))?;
	let new_files = manifest::consolidate(&new_mfs);

	let old_files: HashMap<PathBuf, crate::util::hash::Sha256Hash> =
			match &old_mom {
		None => HashMap::new(),
		Some(om) => {
			// Only the subs the old MoM actually knows
			let old_subs: Vec<_> = subs.iter()
					.filter(|s| om.bundle(&s.name).is_some())
					.cloned().collect();
			let old_mfs = store.recurse(om, &old_subs)
					.map_err(|e| super::store_err(e, false))?;
			manifest::consolidate(&old_mfs).into_iter()
					.filter(|r| r.is_live())
					.map(|r| (r.path, r.hash))
					.collect()
		},
	};

	// Figure the actual change list.
	let heur = crate::heuristics::Heuristics::new(config.path_prefix());
	let mut changed: Vec<manifest::FileRecord> = Vec::new();
	let mut targets: Vec<crate::core::acquire::Target> = Vec::new();
	for rec in new_files
	{
		if heur.ignore(&rec) { continue; }
		match rec.is_deleted() || rec.is_ghosted()
		{
			true => {
				// Deletions only matter if something's there
				let disk = crate::util::path_join(config.path_prefix(),
						&rec.path);
				if rec.is_deleted()
						&& crate::util::fs::lstat(&disk).is_ok()
				{ changed.push(rec); }
			},
			false => {
				let from = old_files.get(&rec.path).copied()
						.unwrap_or_else(
							crate::util::hash::Sha256Hash::zeros);
				if from == rec.hash { continue; }
				targets.push(crate::core::acquire::Target {
					rel: rec.path.clone(),
					kind: rec.kind,
					from,
					to: rec.hash,
					version: rec.last_change,
				});
				changed.push(rec);
			},
		}
	}

	if changed.is_empty()
	{
		sink.info(&format!("Nothing to do; system matches version \
				{target}"));
		sv::pivot_version_file(config.path_prefix(), target)
				.map_err(|e| UpdaterErr::WriteFile(e.to_string()))?;
		return Ok(());
	}
	let ndel = changed.iter().filter(|r| r.is_deleted()).count();
	sink.info(&format!("Update will change {} file{} and remove {ndel}",
			changed.len() - ndel,
			crate::util::plural(changed.len() - ndel)));

	// Anything the release wants run before files move.
	crate::scripts::pre_update(config.path_prefix(), config.no_scripts);

	// Content: packs first, deltas, fullfiles.
	step(&mut sink, "Downloading required content");
	let acq = crate::core::acquire::Acquirer {
		server: &op.server,
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		use_xattrs: config.use_xattrs,
		max_retries: config.max_retries,
		retry_delay: config.retry_delay,
	};
	let stats = acq.acquire(&subs, &targets, false)
			.map_err(|e| UpdaterErr::Download(e.to_string()))?;
	if !stats.failed.is_empty()
	{
		crate::telemetry::record(&op.dirs.telemetry(),
				crate::telemetry::Level::Crit, "updatefail",
				&format!("version={target} missing={}", stats.failed.len()));
		return Err(UpdaterErr::Download(format!(
				"{} file{} could not be downloaded", stats.failed.len(),
				crate::util::plural(stats.failed.len()))));
	}

	if args.download
	{
		sink.info(&format!("Download complete; staged content is \
				ready under {}", op.dirs.staged().display()));
		return Ok(());
	}

	// The critical section: stage and rename.
	step(&mut sink, "Staging file content");
	let stager = crate::core::stage::Stager {
		dirs: &op.dirs,
		prefix: config.path_prefix(),
		no_sync: false,
	};
	let sstats = stager.run(&changed)
			.map_err(stage_err)?;

	// Version pivot only after every rename landed.
	sv::pivot_version_file(config.path_prefix(), target)
			.map_err(|e| UpdaterErr::WriteFile(e.to_string()))?;

	// Post-update homework, never blocking the part that matters.
	let needs = super::needs_for(changed.iter()
			.map(|r| r.path.as_path()));
	let kids = crate::scripts::run(&needs, config.path_prefix(),
			config.no_scripts);

	sink.event(&Event::StepEnd { step: "Staging file content".into() });
	sink.info(&format!("Update was applied: {} file{} changed, {} \
			removed (delta hits {}, misses {}; {} fullfile{})",
			sstats.files + sstats.links + sstats.dirs,
			crate::util::plural((sstats.files + sstats.links
					+ sstats.dirs) as usize),
			sstats.deleted, stats.delta_hits, stats.delta_misses,
			stats.fullfiles, crate::util::plural(stats.fullfiles as usize)));
	sink.info(&format!("System updated from version {cur} to version \
			{target}"));

	if !args.keepcache
	{
		let _ = op.dirs.clear_download();
	}

	kids.join();
	Ok(())
}


pub(super) fn latest_err(e: sv::VersionErr) -> UpdaterErr
{
	use sv::VersionErr as VE;
	match e {
		VE::Signature => UpdaterErr::Signature(
				"latest-version endpoint".to_string()),
		VE::Fetch(f) => UpdaterErr::ServerConnection(f.to_string()),
		e => UpdaterErr::Unexpected(e.to_string()),
	}
}

pub(super) fn stage_err(e: crate::core::stage::StageErr) -> UpdaterErr
{
	use crate::core::stage::StageErr as SE;
	match &e {
		SE::NotStaged(..) => UpdaterErr::Download(e.to_string()),
		SE::Stage(..) => UpdaterErr::CreateFile(e.to_string()),
		SE::Rename(..) => UpdaterErr::RenameFile(e.to_string()),
		SE::Dir(..) => UpdaterErr::CreateDir(e.to_string()),
	}
}
