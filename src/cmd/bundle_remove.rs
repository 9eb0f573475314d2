//! $0 bundle-remove
//!
//! The delicate part is ownership: a file leaves the disk only when
//! no bundle that's staying references it.  Everything else is
//! reverse-dependency bookkeeping.
use std::collections::HashSet;
use std::path::Path;

use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;
use crate::manifest;
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::BundleRemove(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;

	let op = super::op_begin(carg, true)?;
	let tracking = config.tracking_dir();

	let version = sv::current_version(config.path_prefix())
			.map_err(|_| UpdaterErr::CurrentVersionUnknown)?;
	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let mom = store.load_mom(version)
			.map_err(|e| super::store_err(e, true))?;

	let rs = crate::subscription::resolve_remove(&args.bundles, &mom,
			&store, &tracking, args.force, args.recursive)
			.map_err(|e| super::store_err(e, false))?;

	// Safety refusals first, with the whole story, before anything
	// gets touched.
	if !rs.required_by.is_empty()
	{
		for (b, needers) in &rs.required_by
		{
			println!("Bundle \"{b}\" is required by: {}",
					needers.join(", "));
		}
		println!("Use --force to remove anyway, or --recursive to \
				also remove exclusive dependencies");
		return Err(UpdaterErr::RequiredBundle(
				rs.required_by.iter().map(|(b, _)| b.clone())
						.collect::<Vec<_>>().join(", ")));
	}
	for b in &rs.not_tracked
	{
		println!("Bundle \"{b}\" is not installed");
	}
	if rs.remove.is_empty()
	{
		return match rs.not_tracked.is_empty() {
			true  => Ok(()),
			false => Err(UpdaterErr::NotTracked(
					rs.not_tracked.join(", "))),
		};
	}

	// What the survivors still own.  os-core and friends are always
	// in here, so shared files survive by construction.
	let survivors: Vec<String> = crate::subscription::installed_bundles(
			&tracking).into_iter()
			.filter(|b| !rs.remove.contains(b))
			.collect();
	let sseeds: Vec<(String, bool)> = survivors.into_iter()
			.map(|b| (b, false)).collect();
	let sres = crate::subscription::resolve(&sseeds, &mom, &store, false)
			.map_err(|e| super::store_err(e, false))?;
	let smfs = store.recurse(&mom, &sres.subs)
			.map_err(|e| super::store_err(e, false))?;
	let keep: HashSet<&Path> = smfs.iter()
			.flat_map(|m| m.files.iter())
			.filter(|r| r.is_live())
			.map(|r| r.path.as_path())
			.collect();

	// And what the victims own exclusively.
	let vseeds: Vec<(String, bool)> = rs.remove.iter()
			.map(|b| (b.clone(), false)).collect();
	let vres = crate::subscription::resolve(&vseeds, &mom, &store, false)
			.map_err(|e| super::store_err(e, false))?;
	let vsubs: Vec<_> = vres.subs.into_iter()
			.filter(|s| rs.remove.contains(&s.name))
			.collect();
	let vmfs = store.recurse(&mom, &vsubs)
			.map_err(|e| super::store_err(e, false))?;
	let mut victims_files = manifest::consolidate(&vmfs);
	victims_files.retain(|r| r.is_live()
			&& !keep.contains(r.path.as_path()));

	// Take the files off, children before parents.
	let heur = crate::heuristics::Heuristics::new(config.path_prefix());
	let mut removed = 0u32;
	let mut kept = 0u32;
	for rec in victims_files.iter().rev()
	{
		if heur.ignore(rec) { continue; }
		let disk = crate::util::path_join(config.path_prefix(),
				&rec.path);
		let st = match crate::util::fs::lstat(&disk) {
			Ok(st) => st,
			Err(_) => continue,
		};
		let res = match st.is_dir() {
			true  => std::fs::remove_dir(&disk),
			false => std::fs::remove_file(&disk),
		};
		match res {
			Ok(_) => removed += 1,
			Err(_) => kept += 1,  // non-empty dirs, mostly
		}
	}

	// Markers last: a bundle stays tracked until its files are
	// actually gone.
	for b in &rs.remove
	{
		super::remove_marker(&tracking, b);
		println!("Removed bundle \"{b}\"");
	}

	println!("Removed {removed} file{}; {kept} left behind",
			crate::util::plural(removed as usize));

	match rs.not_tracked.is_empty() {
		true  => Ok(()),
		false => Err(UpdaterErr::NotTracked(rs.not_tracked.join(", "))),
	}
}
