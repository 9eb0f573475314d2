//! $0 info / mirror
use crate::command::CmdArg;
use crate::error::UpdaterErr;
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let config = &carg.config;

	let cur = sv::current_version(config.path_prefix()).ok();

	if carg.clargs.json_output
	{
		let js = serde_json::json!({
			"version": cur,
			"version_url": config.version_url().as_str(),
			"content_url": config.content_url().as_str(),
			"format": config.format,
			"path": config.path_prefix(),
			"state_dir": config.state_dir(),
		});
		println!("{js}");
		return Ok(());
	}

	match cur {
		Some(v) => println!("Installed version: {v}"),
		None => println!("Installed version: unknown"),
	}
	println!("Version URL: {}", config.version_url());
	println!("Content URL: {}", config.content_url());
	println!("Format: {}", config.format);
	println!("Path prefix: {}", config.path_prefix().display());
	println!("State directory: {}", config.state_dir().display());

	Ok(())
}


/// The mirror listing: which URLs we'd use and whether a local mirror
/// override supplies them.  (Setting mirrors is the distro tooling's
/// job; we just tell the truth about what's configured.)
pub(crate) fn run_mirror(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let config = &carg.config;

	let mirror_v = crate::util::path_join(config.path_prefix(),
			"/etc/swupd/mirror_versionurl");
	let mirror_c = crate::util::path_join(config.path_prefix(),
			"/etc/swupd/mirror_contenturl");
	let mirrored = mirror_v.is_file() || mirror_c.is_file();

	println!("Version URL: {}", config.version_url());
	println!("Content URL: {}", config.content_url());
	match mirrored {
		true => println!("A mirror override is configured under \
				/etc/swupd"),
		false => println!("No mirror configured; using the default \
				upstream"),
	}
	Ok(())
}
