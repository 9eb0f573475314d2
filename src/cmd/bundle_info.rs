//! $0 bundle-info
use crate::command::CmdArg;
use crate::command::CrCmds;
use crate::error::UpdaterErr;
use crate::manifest::{self, FileKind};
use crate::server::version as sv;


pub(crate) fn run(carg: &CmdArg) -> Result<(), UpdaterErr>
{
	let args = match &carg.clargs.command {
		CrCmds::BundleInfo(a) => a,
		_ => unreachable!(),
	};
	let config = &carg.config;

	let op = super::op_begin(carg, false)?;
	let version = match args.version {
		Some(v) => v,
		None => sv::current_version(config.path_prefix())
				.map_err(|_| UpdaterErr::CurrentVersionUnknown)?,
	};

	let store = manifest::Store::new(&op.server, &op.dirs,
			op.verifier.as_ref(), config.format);
	let mom = store.load_mom(version)
			.map_err(|e| super::store_err(e, true))?;

	let ent = mom.bundle(&args.bundle)
			.ok_or_else(|| UpdaterErr::InvalidBundle(args.bundle.clone()))?;
	if ent.is_deleted()
	{ return Err(UpdaterErr::InvalidBundle(args.bundle.clone())); }

	let mf = store.load_bundle(&args.bundle, &mom)
			.map_err(|e| super::store_err(e, false))?;

	let tracking = config.tracking_dir();
	let installed = crate::subscription::is_installed(&tracking,
			&args.bundle);

	let nfiles = mf.files.iter()
			.filter(|r| r.is_live() && r.kind != FileKind::Manifest)
			.count();

	if carg.clargs.json_output
	{
		let js = serde_json::json!({
			"name": args.bundle,
			"version": ent.last_change,
			"installed": installed,
			"experimental": ent.flags.experimental,
			"files": nfiles,
			"contentsize": mf.header.contentsize,
			"includes": mf.header.includes,
			"also_add": mf.header.also_add,
		});
		println!("{js}");
		return Ok(());
	}

	println!("Bundle: {}{}", args.bundle,
			match ent.flags.experimental {
				true => " (experimental)", false => "" });
	println!("Version: {}", ent.last_change);
	println!("Status: {}", match installed {
			true => "installed", false => "not installed" });
	println!("Files: {nfiles}");
	println!("Size on disk: {} bytes", mf.header.contentsize);

	if args.dependencies
	{
		for i in &mf.header.includes
		{ println!("Requires: {i}"); }
		for a in &mf.header.also_add
		{ println!("Optionally adds: {a}"); }
	}

	if args.files
	{
		println!("\nFile list:");
		for r in &mf.files
		{
			if !r.is_live() || r.kind == FileKind::Manifest { continue; }
			println!("  {}", r.path.display());
		}
	}

	Ok(())
}
