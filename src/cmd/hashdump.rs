//! $0 hashdump
use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::Hashdump(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;

	let disk = crate::util::path_join(config.path_prefix(),
			&args.target);
	let h = crate::util::hash::hash_of(&disk, config.use_xattrs)
			.map_err(|e| UpdaterErr::ComputeHash(
					format!("{}: {e}", disk.display())))?;

	match h.is_zeros()
	{
		true => Err(UpdaterErr::InvalidFile(format!(
				"{} does not exist", disk.display()))),
		false => {
			println!("{h}");
			Ok(())
		},
	}
}
