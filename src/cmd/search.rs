//! $0 search
//!
//! "Which bundle has <thing>?"  Answered the only honest way: by
//! walking every bundle manifest in the MoM.  The store's disk cache
//! makes run two cheap; run one downloads the lot and says so.
use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;
use crate::manifest::{self, FileKind};
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::Search(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;

	let op = super::op_begin(carg, false)?;
	let version = sv::current_version(config.path_prefix())
			.map_err(|_| UpdaterErr::CurrentVersionUnknown)?;

	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let mom = store.load_mom(version)
			.map_err(|e| super::store_err(e, true))?;

	let names = mom.bundle_names();
	println!("Searching {} bundle manifest{} for '{}'", names.len(),
			crate::util::plural(names.len()), args.term);

	// The whole MoM as one subscription list gets us the parallel
	// fetch for free.
	let seeds: Vec<crate::subscription::Subscription> = names.iter()
			.map(|n| crate::subscription::Subscription {
				name: n.to_string(),
				from_version: 0, to_version: 0, optional: false,
			})
			.collect();
	let mfs = store.recurse(&mom, &seeds)
			.map_err(|e| super::store_err(e, false))?;

	let mut hits = 0usize;
	for (sub, mf) in seeds.iter().zip(mfs.iter())
	{
		let mut shown = false;
		for r in &mf.files
		{
			if !r.is_live() || r.kind == FileKind::Manifest { continue; }
			if !r.path.to_string_lossy().contains(&args.term) { continue; }
			if !shown
			{
				println!("\nBundle {}:", sub.name);
				shown = true;
			}
			println!("  {}", r.path.display());
			hits += 1;
		}
	}

	match hits {
		0 => {
			println!("No matches for '{}'", args.term);
			Err(UpdaterErr::No(String::new()))
		},
		n => {
			println!("\n{n} match{}", match n { 1 => "", _ => "es" });
			Ok(())
		},
	}
}
