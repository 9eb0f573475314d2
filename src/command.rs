//! General command handling.  This is sorta the central dispatch for
//! everything that goes on.

/// Command-line parsing and handling
pub(crate) mod line;
pub(crate) use line::CrArgs;
pub(crate) use line::CrCmds;
pub use line::parse;

use crate::error::UpdaterErr;


/// Pass a bunch of info to the individual command runners as a block
#[derive(Debug)]
pub(crate) struct CmdArg
{
	/// The command-line args
	pub(crate) clargs: CrArgs,

	/// The working config
	pub(crate) config: crate::config::Config,
}


/// Dispatch a command
pub fn run(clargs: CrArgs) -> std::process::ExitCode
{
	match run_inner(clargs)
	{
		Ok(_) => std::process::ExitCode::SUCCESS,
		Err(e) => {
			// The "no" answer isn't a complaint, just an exit code.
			match &e {
				UpdaterErr::No(msg) if !msg.is_empty() =>
					println!("{msg}"),
				UpdaterErr::No(_) => (),
				e => eprintln!("Error: {e}"),
			}
			std::process::ExitCode::from(e.code())
		},
	}
}


fn run_inner(clargs: CrArgs) -> Result<(), UpdaterErr>
{
	use crate::cmd;

	// Load up config
	let config = crate::config::build(&clargs)
			.map_err(|e| UpdaterErr::InvalidOption(e.to_string()))?;

	// Any early initialization
	init(&clargs);

	let carg = CmdArg { clargs, config };

	use line::CrCmds as CC;
	match &carg.clargs.command
	{
		// The big mutators
		CC::OsInstall{..}    => cmd::os_install::run(&carg),
		CC::Update{..}       => cmd::update::run(&carg),
		CC::Verify{..}       => cmd::verify::run(&carg, false),
		CC::Repair{..}       => cmd::verify::run(&carg, true),
		CC::Diagnose{..}     => cmd::verify::run(&carg, false),
		CC::BundleAdd{..}    => cmd::bundle_add::run(&carg),
		CC::BundleRemove{..} => cmd::bundle_remove::run(&carg),

		// Show
		CC::BundleList{..} => cmd::bundle_list::run(&carg),
		CC::BundleInfo{..} => cmd::bundle_info::run(&carg),
		CC::CheckUpdate    => cmd::check_update::run(&carg),
		CC::Info           => cmd::info::run(&carg),
		CC::Mirror         => cmd::info::run_mirror(&carg),
		CC::Autoupdate     => cmd::autoupdate::run(&carg),
		CC::Search{..}     => cmd::search::run(&carg),

		// Misc
		CC::Clean{..}    => cmd::clean::run(&carg),
		CC::Hashdump{..} => cmd::hashdump::run(&carg),

		// Fake
		#[cfg(test)]
		CC::Dummy => unreachable!("Not a real thing"),
	}
}


/// Do any initialization we care about
fn init(_clargs: &CrArgs)
{
	// Init cached euid; we don't change perms during the run, so...
	crate::util::set_euid();
}
