//! Version discovery, on both ends of the wire.
//!
//! The system's own version comes out of os-release; the server's
//! latest comes from a signed endpoint under the version URL.  The
//! format number gates everything: content published in a newer format
//! than this client speaks is refused, not misparsed.

use std::path::{Path, PathBuf};

use crate::manifest::Version;
use crate::server::Server;
use crate::signature::{Verifier, VerifyFlags};

use thiserror::Error;


#[derive(Debug)]
#[derive(Error)]
pub(crate) enum VersionErr
{
	#[error("cannot determine current version under {0}")]
	NoCurrent(PathBuf),

	#[error("os-release I/O error: {0}")]
	IO(#[from] std::io::Error),

	#[error("unparseable version '{0}'")]
	Parse(String),

	#[error("fetching version info: {0}")]
	Fetch(#[from] super::FetchErr),

	#[error("signature on latest-version did not verify")]
	Signature,
}


/// The os-release files we'll look at, in order.
fn osrelease_paths(prefix: &Path) -> [PathBuf; 2]
{
	use crate::util::path_join;
	[
		path_join(prefix, "/usr/lib/os-release"),
		path_join(prefix, "/etc/os-release"),
	]
}


/// Dig VERSION_ID out of an os-release blob.
fn parse_version_id(text: &str) -> Option<&str>
{
	for l in text.lines()
	{
		let l = l.trim();
		if let Some(v) = l.strip_prefix("VERSION_ID=")
		{
			// Quoted or bare both show up in the wild.
			return Some(v.trim_matches('"'));
		}
	}
	None
}


/// What version is the system at?
pub(crate) fn current_version(prefix: &Path) -> Result<Version, VersionErr>
{
	for p in osrelease_paths(prefix)
	{
		let text = match std::fs::read_to_string(&p) {
			Ok(t) => t,
			Err(_) => continue,
		};
		if let Some(v) = parse_version_id(&text)
		{
			return v.parse()
					.map_err(|_| VersionErr::Parse(v.to_string()));
		}
	}
	Err(VersionErr::NoCurrent(prefix.to_path_buf()))
}


/// Pivot the version file to a new version.  This is the last step of
/// a successful install/update: rewrite os-release with the new
/// VERSION_ID, atomically, leaving every other line alone.
pub(crate) fn pivot_version_file(prefix: &Path, newver: Version)
		-> Result<(), VersionErr>
{
	// usr/lib is home; only follow an existing etc override, and a
	// fresh tree gets usr/lib created.
	let [usrlib, etc] = osrelease_paths(prefix);
	let target = match !usrlib.is_file() && etc.is_file() {
		true  => etc,
		false => usrlib,
	};

	let old = match std::fs::read_to_string(&target) {
		Ok(t) => t,
		// A fresh install may have no os-release at all yet.
		Err(_) => String::new(),
	};

	let mut out = String::with_capacity(old.len() + 32);
	let mut replaced = false;
	for l in old.lines()
	{
		match l.trim_start().starts_with("VERSION_ID=")
		{
			true => {
				out.push_str(&format!("VERSION_ID={newver}\n"));
				replaced = true;
			},
			false => {
				out.push_str(l);
				out.push('\n');
			},
		}
	}
	if !replaced
	{
		out.push_str(&format!("VERSION_ID={newver}\n"));
	}

	if let Some(parent) = target.parent()
	{
		std::fs::create_dir_all(parent)?;
	}
	crate::util::fs::atomic_write(&target, out.as_bytes())?;
	Ok(())
}


/// Parse a smallish integer out of fetched bytes.
fn int_from_bytes(buf: &[u8]) -> Result<u32, VersionErr>
{
	let s = std::str::from_utf8(buf)
			.map_err(|_| VersionErr::Parse("non-UTF8".to_string()))?;
	let s = s.trim();
	s.parse().map_err(|_| VersionErr::Parse(s.to_string()))
}


/// Ask the server for the latest version in our format.
///
/// The answer is signed, and we check it -- with expiration ignored,
/// because a machine with a badly wrong clock is exactly the machine
/// that most needs to be able to update its way out.
pub(crate) fn server_latest(server: &Server, format: u32,
		verifier: Option<&Verifier>) -> Result<Version, VersionErr>
{
	let url = server.version(&format!("version/format{format}/latest"))
			.map_err(super::FetchErr::from)?;
	let data = super::http::get_bytes(&server.agent, &url)?;

	if let Some(ver) = verifier
	{
		let sigurl = server.version(&format!(
				"version/format{format}/latest.sig"))
				.map_err(super::FetchErr::from)?;
		let sig = super::http::get_bytes(&server.agent, &sigurl)?;

		let flags = VerifyFlags { ignore_expiration: true,
				..Default::default() };
		if !ver.verify_detached(&data, &sig, flags)
		{
			return Err(VersionErr::Signature);
		}
	}

	int_from_bytes(&data)
}


/// What format is some server version published in?
pub(crate) fn server_format(server: &Server, version: Version)
		-> Result<u32, VersionErr>
{
	let url = server.version(&format!("{version}/format"))
			.map_err(super::FetchErr::from)?;
	let data = super::http::get_bytes(&server.agent, &url)?;
	int_from_bytes(&data)
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn version_id_parses()
	{
		let osr = "NAME=\"Some Linux\"\nVERSION_ID=31880\nID=some\n";
		assert_eq!(parse_version_id(osr), Some("31880"));

		let osr = "VERSION_ID=\"100\"\n";
		assert_eq!(parse_version_id(osr), Some("100"));

		assert_eq!(parse_version_id("NAME=x\n"), None);
	}

	#[test]
	fn current_version_lookup()
	{
		let tmp = tempfile::tempdir().unwrap();
		let prefix = tmp.path();

		// Nothing there yet
		current_version(prefix).unwrap_err();

		// etc fallback
		std::fs::create_dir_all(prefix.join("etc")).unwrap();
		std::fs::write(prefix.join("etc/os-release"),
				"VERSION_ID=90\n").unwrap();
		assert_eq!(current_version(prefix).unwrap(), 90);

		// usr/lib wins when both exist
		std::fs::create_dir_all(prefix.join("usr/lib")).unwrap();
		std::fs::write(prefix.join("usr/lib/os-release"),
				"VERSION_ID=100\n").unwrap();
		assert_eq!(current_version(prefix).unwrap(), 100);
	}

	#[test]
	fn pivoting()
	{
		let tmp = tempfile::tempdir().unwrap();
		let prefix = tmp.path();
		std::fs::create_dir_all(prefix.join("usr/lib")).unwrap();
		std::fs::write(prefix.join("usr/lib/os-release"),
				"NAME=\"Some Linux\"\nVERSION_ID=90\nID=some\n").unwrap();

		pivot_version_file(prefix, 100).unwrap();
		assert_eq!(current_version(prefix).unwrap(), 100);

		// Other lines survived
		let text = std::fs::read_to_string(
				prefix.join("usr/lib/os-release")).unwrap();
		assert!(text.contains("NAME=\"Some Linux\""));
		assert!(text.contains("ID=some"));
	}

	#[test]
	fn pivot_from_empty()
	{
		// Fresh install: no os-release at all yet; lands in usr/lib
		let tmp = tempfile::tempdir().unwrap();
		pivot_version_file(tmp.path(), 100).unwrap();
		assert_eq!(current_version(tmp.path()).unwrap(), 100);
		assert!(tmp.path().join("usr/lib/os-release").is_file());
	}
}
