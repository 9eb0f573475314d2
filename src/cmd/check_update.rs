//! $0 check-update
use crate::command::CmdArg;
use crate::error::UpdaterErr;
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let config = &carg.config;
	let op = super::op_begin(carg, false)?;

	let cur = sv::current_version(config.path_prefix())
			.map_err(|_| UpdaterErr::CurrentVersionUnknown)?;
	let latest = sv::server_latest(&op.server, config.format,
			op.verifier.as_ref())
			.map_err(super::update::latest_err)?;

	println!("Current OS version: {cur}");
	println!("Latest server version: {latest}");

	match latest > cur
	{
		true => {
			println!("There is a new OS version available: {latest}");
			Ok(())
		},
		// The classic cron answer: exit 1, say nothing more.
		false => Err(UpdaterErr::No(String::new())),
	}
}
