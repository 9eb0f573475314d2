//! $0 bundle-list
use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;
use crate::manifest;
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::BundleList(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;
	let tracking = config.tracking_dir();
	let installed = crate::subscription::installed_bundles(&tracking);

	// The plain local listing needs no network at all.
	let plain = !args.all && args.has_dep.is_none() && args.deps.is_none();
	if plain
	{
		emit(carg, installed.iter().map(|b| (b.clone(), true)).collect());
		return Ok(());
	}

	// Everything else wants the MoM.
	let op = super::op_begin(carg, false)?;
	let version = sv::current_version(config.path_prefix())
			.map_err(|_| UpdaterErr::CurrentVersionUnknown)?;
	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let mom = store.load_mom(version)
			.map_err(|e| super::store_err(e, true))?;

	if let Some(b) = &args.deps
	{
		// What does b pull in?
		let seeds = vec![(b.clone(), false)];
		let res = crate::subscription::resolve(&seeds, &mom, &store,
				false).map_err(|e| super::store_err(e, false))?;
		if res.invalid.iter().any(|i| i == b)
		{ return Err(UpdaterErr::InvalidBundle(b.clone())); }

		let list = res.subs.into_iter()
				.filter(|s| s.name != *b)
				.map(|s| {
					let inst = crate::subscription::is_installed(
							&tracking, &s.name);
					(s.name, inst)
				})
				.collect();
		emit(carg, list);
		return Ok(());
	}

	if let Some(b) = &args.has_dep
	{
		if mom.bundle(b).is_none()
		{ return Err(UpdaterErr::InvalidBundle(b.clone())); }

		// Who pulls b in?  Walk everyone's closure; the store memoizes
		// so this is one manifest load per bundle, not per pair.
		let candidates: Vec<String> = match args.all {
			true  => mom.bundle_names().iter()
					.map(|s| s.to_string()).collect(),
			false => installed.clone(),
		};
		let mut needers: Vec<(String, bool)> = Vec::new();
		for cand in candidates
		{
			if cand == *b { continue; }
			let seeds = vec![(cand.clone(), false)];
			let res = crate::subscription::resolve(&seeds, &mom,
					&store, false)
					.map_err(|e| super::store_err(e, false))?;
			if res.subs.iter().any(|s| s.name == *b)
			{
				let inst = crate::subscription::is_installed(&tracking,
						&cand);
				needers.push((cand, inst));
			}
		}
		emit(carg, needers);
		return Ok(());
	}

	// --all
	let list = mom.bundle_names().into_iter()
			.map(|b| {
				let inst = crate::subscription::is_installed(&tracking, b);
				(b.to_string(), inst)
			})
			.collect();
	emit(carg, list);
	Ok(())
}


/// Print a (bundle, installed) listing, honoring --status and
/// --json-output.
fn emit(carg: &CmdArg, mut list: Vec<(String, bool)>)
{
	list.sort();

	let args = match &carg.clargs.command {
		CrCmds::BundleList(a) => a,
		_ => unreachable!(),
	};

	if carg.clargs.json_output
	{
		let js: Vec<_> = list.iter().map(|(b, inst)| {
			serde_json::json!({ "name": b, "installed": inst })
		}).collect();
		println!("{}", serde_json::Value::Array(js));
		return;
	}

	for (b, inst) in list
	{
		match args.status {
			true => {
				let tag = match inst { true => "[installed]", false => "" };
				println!("{b} {tag}");
			},
			false => println!("{b}"),
		}
	}
}
