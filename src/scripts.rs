//! Post-update helper runs.
//!
//! The file walk flags what housekeeping a change implies (new kernel,
//! new bootloader bits, systemd itself replaced); after the rename
//! phase we kick the matching helpers.  They're fire-and-forget
//! children that get joined at the very end, so they never delay the
//! critical rename path, and a missing helper binary is a warning, not
//! a failure.

use std::path::Path;
use std::process::{Child, Command};


/// What the heuristics walk decided needs running.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Needs
{
	pub(crate) update_boot: bool,
	pub(crate) update_bootloader: bool,
	pub(crate) systemd_reexec: bool,
}

impl Needs
{
	pub(crate) fn merge(&mut self, o: &Needs)
	{
		self.update_boot |= o.update_boot;
		self.update_bootloader |= o.update_bootloader;
		self.systemd_reexec |= o.systemd_reexec;
	}

	pub(crate) fn any(&self) -> bool
	{
		self.update_boot || self.update_bootloader || self.systemd_reexec
	}
}


/// Running children, to be joined at operation end.
#[derive(Debug, Default)]
pub(crate) struct Running
{
	kids: Vec<(String, Child)>,
}

impl Running
{
	/// Wait for everything we spawned.  Helper failures are reported
	/// and swallowed; the update itself already happened.
	pub(crate) fn join(mut self)
	{
		for (name, mut kid) in self.kids.drain(..)
		{
			match kid.wait() {
				Ok(st) if st.success() => (),
				Ok(st) => eprintln!("Warning: {name} exited {st}"),
				Err(e) => eprintln!("Warning: couldn't wait for {name}: {e}"),
			}
		}
	}
}


/// The release's pre-update hook, run before any file moves.  Waited
/// on (unlike the post hooks) since it exists to prepare the ground;
/// a missing script just means the release doesn't ship one.
pub(crate) fn pre_update(prefix: &Path, no_scripts: bool)
{
	if no_scripts { return; }

	let script = crate::util::path_join(prefix,
			"/usr/bin/clr-pre-update.sh");
	if !script.is_file() { return; }

	match Command::new(&script).status() {
		Ok(st) if st.success() => (),
		Ok(st) => eprintln!("Warning: pre-update script exited {st}"),
		Err(e) => eprintln!("Warning: couldn't run pre-update script: {e}"),
	}
}


/// Kick off the helpers a Needs asks for.  Only makes sense against
/// the live root; with a --path prefix the helpers would stomp the
/// wrong system, so we skip them and say so.
pub(crate) fn run(needs: &Needs, prefix: &Path, no_scripts: bool) -> Running
{
	let mut running = Running::default();

	if no_scripts || !needs.any() { return running; }

	if prefix != Path::new("/")
	{
		println!("Note: not running post-update helpers against prefix {}",
				prefix.display());
		return running;
	}

	let mut spawn = |name: &str, mut cmd: Command| {
		match cmd.spawn() {
			Ok(kid) => running.kids.push((name.to_string(), kid)),
			Err(e) => eprintln!("Warning: couldn't run {name}: {e}"),
		}
	};

	if needs.update_boot || needs.update_bootloader
	{
		let mut c = Command::new("/usr/bin/clr-boot-manager");
		c.arg("update");
		spawn("clr-boot-manager", c);
	}

	if needs.systemd_reexec
	{
		let mut c = Command::new("/usr/bin/systemctl");
		c.arg("daemon-reexec");
		spawn("systemctl daemon-reexec", c);
	}

	running
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn needs_merging()
	{
		let mut a = Needs::default();
		assert!(!a.any());

		let b = Needs { update_boot: true, ..Default::default() };
		a.merge(&b);
		assert!(a.update_boot);
		assert!(!a.systemd_reexec);
		assert!(a.any());
	}

	#[test]
	fn prefix_skips_helpers()
	{
		let needs = Needs {
			update_boot: true, update_bootloader: true,
			systemd_reexec: true,
		};
		let r = run(&needs, Path::new("/some/prefix"), false);
		assert!(r.kids.is_empty());

		let r = run(&needs, Path::new("/"), true);
		assert!(r.kids.is_empty(), "no-scripts wins");
	}
}
