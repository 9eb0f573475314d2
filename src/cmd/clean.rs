//! $0 clean
use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::core::statedir::KeepSet;
use crate::error::UpdaterErr;
use crate::manifest;
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::Clean(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;

	let op = super::op_begin(carg, !args.dry_run)?;

	// Figure what the running version still references, so we don't
	// saw off the branch the next update sits on.  Best-effort: if
	// the MoM isn't loadable we keep all manifests rather than guess.
	let keep = match args.all {
		true => None,
		false => {
			let mom = sv::current_version(config.path_prefix()).ok()
					.and_then(|cur| {
						let store = manifest::Store::new(&op.server,
								&op.dirs, op.verifier.as_ref(),
								config.format);
						store.load_mom(cur).ok().map(|m| (cur, m))
					});
			mom.map(|(cur, m)| KeepSet::from_mom(cur, &m))
		},
	};

	let stats = op.dirs.clean(args.all, args.dry_run, keep.as_ref())
			.map_err(|e| UpdaterErr::ListDir(e.to_string()))?;

	let verb = match args.dry_run { true => "would remove",
			false => "removed" };
	println!("{} {} file{}, {} bytes", verb, stats.files_removed,
			crate::util::plural(stats.files_removed as usize),
			stats.bytes_removed);
	Ok(())
}
