//! CLI command runners, one module per subcommand, plus the shared
//! operation plumbing they all lean on.

pub(crate) mod os_install;
pub(crate) mod update;
pub(crate) mod verify;
pub(crate) mod bundle_add;
pub(crate) mod bundle_remove;
pub(crate) mod bundle_list;
pub(crate) mod bundle_info;
pub(crate) mod check_update;
pub(crate) mod info;
pub(crate) mod autoupdate;
pub(crate) mod search;
pub(crate) mod clean;
pub(crate) mod hashdump;


use crate::command::CmdArg;
use crate::core::StateDirs;
use crate::error::UpdaterErr;
use crate::lock::{Lock, LockErr};
use crate::manifest::StoreErr;
use crate::server::Server;
use crate::signature::Verifier;


/// The stood-up machinery most operations want: state dirs, the
/// server handle, the signature verifier (unless --nosigcheck), and
/// the lock when the operation mutates anything.
pub(crate) struct Op
{
	pub(crate) dirs: StateDirs,
	pub(crate) server: Server,
	pub(crate) verifier: Option<Verifier>,

	// Held for our lifetime; dropping releases.
	_lock: Option<Lock>,
}


pub(crate) fn op_begin(carg: &CmdArg, mutates: bool)
		-> Result<Op, UpdaterErr>
{
	op_begin_config(&carg.config, mutates)
}

/// Same, for runners that had to rework the config first (os-install
/// swaps the prefix in).
pub(crate) fn op_begin_config(config: &crate::config::Config,
		mutates: bool) -> Result<Op, UpdaterErr>
{
	let dirs = StateDirs::init(config.state_dir())
			.map_err(|e| UpdaterErr::CreateDir(
					format!("{}: {e}", config.state_dir().display())))?;

	let lock = match mutates {
		false => None,
		true => Some(Lock::take(config.state_dir())
				.map_err(|e| match e {
					LockErr::Held => UpdaterErr::Lock(
							"another update operation is running".to_string()),
					LockErr::IO(e) => UpdaterErr::Lock(e.to_string()),
				})?),
	};

	let server = Server::new(config)
			.map_err(|e| UpdaterErr::NetworkInit(e.to_string()))?;

	let verifier = match config.sigcheck {
		false => None,
		true => {
			let alt = config.alt_cert_path();
			let v = Verifier::init(&config.cert_path, Some(&alt),
					None, config.timecheck)
					.map_err(|e| UpdaterErr::BadCert(e.to_string()))?;
			Some(v)
		},
	};

	Ok(Op { dirs, server, verifier, _lock: lock })
}


/// Turn a store failure into the right public error kind.  MoM
/// trouble and bundle-manifest trouble get different codes, and
/// signature trouble always wins.
pub(crate) fn store_err(e: StoreErr, mom: bool) -> UpdaterErr
{
	use StoreErr as SE;
	match e
	{
		SE::Signature(v) =>
			UpdaterErr::Signature(format!("MoM for version {v}")),
		SE::UnknownBundle(b) => UpdaterErr::InvalidBundle(b),
		SE::BadHash(b) => UpdaterErr::LoadManifest(
				format!("bundle '{b}' hash disagrees with the MoM")),
		e => match mom {
			true  => UpdaterErr::LoadMom(e.to_string()),
			false => UpdaterErr::LoadManifest(e.to_string()),
		},
	}
}


/// The format gate: refuse content published past what we speak.
pub(crate) fn format_gate(server: &Server, version: u32, ours: u32)
		-> Result<(), UpdaterErr>
{
	use crate::server::version as sv;
	match sv::server_format(server, version) {
		Ok(f) if f > ours => Err(UpdaterErr::LoadMom(format!(
				"version {version} is published in format {f}; this \
				client speaks {ours}"))),
		// An absent format file is an old server; let the manifest
		// header's own gate catch real mismatches.
		_ => Ok(()),
	}
}


/// Free-space check against a statvfs of the target.  Rough on
/// purpose; contentsize is an upper bound and we pad it, since
/// running a filesystem to 0 helps nobody.
pub(crate) fn check_diskspace(target: &std::path::Path, need: u64)
		-> Result<(), UpdaterErr>
{
	use std::os::unix::ffi::OsStrExt as _;

	let cpath = std::ffi::CString::new(target.as_os_str().as_bytes())
			.map_err(|e| UpdaterErr::Unexpected(e.to_string()))?;
	let mut sv: libc::statvfs = unsafe { std::mem::zeroed() };
	let ret = unsafe { libc::statvfs(cpath.as_ptr(), &mut sv) };
	if ret != 0
	{
		// Can't tell how much room there is?  That reports as a
		// disk-space problem, not a green light.
		return Err(UpdaterErr::DiskSpace(format!(
				"cannot statvfs {}", target.display())));
	}

	let avail = (sv.f_bavail as u64).saturating_mul(sv.f_bsize as u64);
	// 10% margin over the declared content size
	let need = need.saturating_add(need / 10);
	match avail >= need {
		true => Ok(()),
		false => Err(UpdaterErr::DiskSpace(format!(
				"{need} bytes needed, {avail} available under {}",
				target.display()))),
	}
}


/// Bundle tracking markers.
pub(crate) fn write_marker(tracking: &std::path::Path, bundle: &str)
		-> Result<(), UpdaterErr>
{
	std::fs::create_dir_all(tracking)
			.map_err(|e| UpdaterErr::CreateDir(e.to_string()))?;
	std::fs::write(tracking.join(bundle), b"")
			.map_err(|e| UpdaterErr::CreateFile(
					format!("marker for {bundle}: {e}")))
}

pub(crate) fn remove_marker(tracking: &std::path::Path, bundle: &str)
{
	let _ = std::fs::remove_file(tracking.join(bundle));
}


/// Sum up the post-update helper needs over a pile of changed paths.
pub(crate) fn needs_for<'a>(paths: impl Iterator<Item = &'a std::path::Path>)
		-> crate::scripts::Needs
{
	let mut needs = crate::scripts::Needs::default();
	for p in paths
	{
		needs.merge(&crate::heuristics::hook_needs(p));
	}
	needs
}
