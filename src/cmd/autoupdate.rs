//! $0 autoupdate
//!
//! Reports whether automatic updating is enabled.  The timer itself
//! belongs to systemd; what we can answer portably (including against
//! a --path tree) is whether the unit has been masked away.
use crate::command::CmdArg;
use crate::error::UpdaterErr;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let config = &carg.config;

	let masked = ["swupd-update.service", "swupd-update.timer"]
			.iter().any(|unit| {
		let p = crate::util::path_join(config.path_prefix(),
				format!("/etc/systemd/system/{unit}"));
		match std::fs::read_link(&p) {
			Ok(tgt) => tgt == std::path::Path::new("/dev/null"),
			Err(_) => false,
		}
	});

	match masked
	{
		true => Err(UpdaterErr::No("Disabled".to_string())),
		false => {
			println!("Enabled");
			Ok(())
		},
	}
}



#[cfg(test)]
mod tests
{
	#[test]
	fn mask_detection()
	{
		// The masked shape: unit symlinked to /dev/null
		let tmp = tempfile::tempdir().unwrap();
		let sysd = tmp.path().join("etc/systemd/system");
		std::fs::create_dir_all(&sysd).unwrap();
		std::os::unix::fs::symlink("/dev/null",
				sysd.join("swupd-update.timer")).unwrap();

		let p = crate::util::path_join(tmp.path(),
				"/etc/systemd/system/swupd-update.timer");
		let tgt = std::fs::read_link(&p).unwrap();
		assert_eq!(tgt, std::path::PathBuf::from("/dev/null"));
	}
}
