//! The runtime config handle.
//!
//! Everything that used to be ambient (URLs, prefix, state dir, cert,
//! knobs) lives in one immutable Config that gets passed to whoever
//! needs it.  It's assembled in layers: baked-in defaults, then the
//! distro default files under the prefix, then command-line overrides.
//! Nothing rewrites it after that; the one runtime-mutable thing
//! (falling back to serial downloads) lives with the fetch pool, not
//! here.

use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;


/// Where the distro drops its defaults, relative to the path prefix.
const DEF_VERSIONURL: &str = "usr/share/defaults/swupd/versionurl";
const DEF_CONTENTURL: &str = "usr/share/defaults/swupd/contenturl";
const DEF_FORMAT: &str     = "usr/share/defaults/swupd/format";

/// And our baked-in last resorts.
const FALLBACK_URL: &str = "https://cdn.download.clearlinux.org/update/";
const DEF_CERT: &str = "/usr/share/clearlinux/update-ca/Swupd_Root.pem";

/// The manifest format this build understands.
pub(crate) const SUPPORTED_FORMAT: u32 = 1;


#[derive(Debug, Clone)]
#[derive(derivative::Derivative)]
#[derivative(Default)]
pub struct Config
{
	/// Version-discovery URL base
	pub(crate) version_url: Option<Url>,

	/// Content URL base
	pub(crate) content_url: Option<Url>,

	/// Format this client speaks
	#[derivative(Default(value="SUPPORTED_FORMAT"))]
	pub(crate) format: u32,

	/// The tree we're operating on ("/" for the running system)
	#[derivative(Default(value="\"/\".into()"))]
	path_prefix: PathBuf,

	/// Where downloads, staged blobs, and manifest caches live
	#[derivative(Default(value="\"/var/lib/swupd\".into()"))]
	state_dir: PathBuf,

	/// Pinned signing certificate
	#[derivative(Default(value="DEF_CERT.into()"))]
	pub(crate) cert_path: PathBuf,

	/// Verify MoM/latest signatures (--nosigcheck turns off)
	#[derivative(Default(value="true"))]
	pub(crate) sigcheck: bool,

	/// Care about certificate validity times (--ignore-time turns off)
	#[derivative(Default(value="true"))]
	pub(crate) timecheck: bool,

	/// http:// URLs allowed?  Off unless somebody really means it.
	pub(crate) allow_insecure_http: bool,

	/// Hash xattrs too.  Matches what the server did when building
	/// manifests, so it's a property of the stream, not a preference.
	pub(crate) use_xattrs: bool,

	/// Skip the post-update helper scripts
	pub(crate) no_scripts: bool,

	/// Download retry ceiling per item
	#[derivative(Default(value="3"))]
	pub(crate) max_retries: u32,

	/// Initial retry delay, seconds (doubles per retry, capped)
	#[derivative(Default(value="10"))]
	pub(crate) retry_delay: u32,
}


impl Config
{
	// Kept hidden so derived paths can't drift from under us.
	pub(crate) fn path_prefix(&self) -> &Path { &self.path_prefix }
	pub(crate) fn state_dir(&self) -> &Path { &self.state_dir }

	/// The bundle-tracking dir, under the prefix.
	pub(crate) fn tracking_dir(&self) -> PathBuf
	{
		crate::util::path_join(&self.path_prefix, "/usr/share/clear/bundles")
	}

	/// The resolved version URL.
	pub(crate) fn version_url(&self) -> &Url
	{
		self.version_url.as_ref().expect("Config::build sets this")
	}

	/// The resolved content URL.
	pub(crate) fn content_url(&self) -> &Url
	{
		self.content_url.as_ref().expect("Config::build sets this")
	}

	/// A copy with a different prefix; os-install points at its
	/// target this way rather than mutating shared config.
	pub(crate) fn with_path_prefix(&self, prefix: &Path) -> Self
	{
		let mut c = self.clone();
		c.path_prefix = prefix.to_path_buf();
		c
	}

	/// The alternate cert, tried when the primary fails.
	pub(crate) fn alt_cert_path(&self) -> PathBuf
	{
		let mut p = self.cert_path.as_os_str().to_os_string();
		p.push(".alt");
		p.into()
	}
}


/// Problems putting together a usable config
#[derive(Debug)]
#[derive(Error)]
pub enum ConfigErr
{
	/// File I/O error of some sort
	#[error("Config file I/O error: {0}")]
	IO(#[from] std::io::Error),

	/// An unusable URL
	#[error("Bad URL '{0}': {1}")]
	Url(String, String),

	/// https-only, and somebody gave us http
	#[error("Insecure URL '{0}' (pass --allow-insecure-http if you \
			really mean it)")]
	Insecure(String),

	/// Unusable format value
	#[error("Bad format value: {0}")]
	Format(String),
}


/// Read a one-line default file if it's there.
fn read_default(prefix: &Path, rel: &str) -> Option<String>
{
	let p = prefix.join(rel);
	let s = std::fs::read_to_string(p).ok()?;
	let s = s.trim();
	match s.is_empty() {
		true  => None,
		false => Some(s.to_string()),
	}
}


/// Parse and vet a URL string.
fn mk_url(s: &str, allow_http: bool) -> Result<Url, ConfigErr>
{
	// Trailing slash matters for Url::join; put one on.
	let canon = match s.ends_with('/') {
		true  => s.to_string(),
		false => format!("{s}/"),
	};
	let u = Url::parse(&canon)
			.map_err(|e| ConfigErr::Url(s.to_string(), e.to_string()))?;
	match u.scheme()
	{
		"https" => (),
		"http" if allow_http => (),
		"file" => (),  // local content store; same semantics as a server
		_ => return Err(ConfigErr::Insecure(s.to_string())),
	}
	Ok(u)
}


/// Build the working config from defaults and command-line args.
pub(crate) fn build(clargs: &crate::command::CrArgs)
		-> Result<Config, ConfigErr>
{
	let mut conf = Config::default();

	// Simple field overrides from the command line
	macro_rules! or {
		( $fld:ident ) => {
			conf.$fld = match &clargs.$fld {
				Some(x) => x.clone(),
				None    => conf.$fld,
			};
		};
	}
	or!(path_prefix);
	or!(state_dir);
	or!(cert_path);

	// Flag-ish toggles
	if clargs.nosigcheck { conf.sigcheck = false; }
	if clargs.ignore_time { conf.timecheck = false; }
	if clargs.allow_insecure_http { conf.allow_insecure_http = true; }
	if clargs.no_scripts { conf.no_scripts = true; }
	if let Some(n) = clargs.max_retries { conf.max_retries = n; }
	if let Some(n) = clargs.retry_delay { conf.retry_delay = n; }

	// The format: CLI, else the distro default file, else baked-in.
	conf.format = match &clargs.format {
		Some(f) => f.parse()
				.map_err(|_| ConfigErr::Format(f.clone()))?,
		None => match read_default(&conf.path_prefix, DEF_FORMAT) {
			Some(f) => f.parse()
					.map_err(|_| ConfigErr::Format(f.clone()))?,
			None => SUPPORTED_FORMAT,
		},
	};

	// URLs: -u sets both, -v/-c win over it, default files next, then
	// the baked-in fallback.
	let ah = conf.allow_insecure_http;
	let from_u = clargs.url.as_deref();
	let vstr = clargs.version_url.as_deref()
			.or(from_u)
			.map(str::to_string)
			.or_else(|| read_default(&conf.path_prefix, DEF_VERSIONURL))
			.unwrap_or_else(|| FALLBACK_URL.to_string());
	let cstr = clargs.content_url.as_deref()
			.or(from_u)
			.map(str::to_string)
			.or_else(|| read_default(&conf.path_prefix, DEF_CONTENTURL))
			.unwrap_or_else(|| FALLBACK_URL.to_string());
	conf.version_url = Some(mk_url(&vstr, ah)?);
	conf.content_url = Some(mk_url(&cstr, ah)?);

	Ok(conf)
}



#[cfg(test)]
mod tests
{
	use super::*;

	fn make_fake_clargs() -> crate::command::CrArgs
	{
		crate::command::CrArgs::default()
	}

	#[test]
	fn defaults()
	{
		let args = make_fake_clargs();
		let conf = build(&args).unwrap();

		use std::ffi::OsStr;
		assert_eq!(conf.path_prefix(), OsStr::new("/"));
		assert_eq!(conf.state_dir(), OsStr::new("/var/lib/swupd"));
		assert!(conf.sigcheck);
		assert!(conf.timecheck);
		assert_eq!(conf.max_retries, 3);
		assert_eq!(conf.retry_delay, 10);
		assert_eq!(conf.version_url().as_str(), FALLBACK_URL);
	}

	#[test]
	fn cli_overrides()
	{
		let mut args = make_fake_clargs();
		args.path_prefix = Some("/tmp/sysroot".into());
		args.url = Some("https://example.org/update".into());
		args.nosigcheck = true;
		args.max_retries = Some(7);

		let conf = build(&args).unwrap();
		assert_eq!(conf.path_prefix(), std::ffi::OsStr::new("/tmp/sysroot"));
		assert_eq!(conf.version_url().as_str(),
				"https://example.org/update/");
		assert_eq!(conf.content_url().as_str(),
				"https://example.org/update/");
		assert!(!conf.sigcheck);
		assert_eq!(conf.max_retries, 7);
	}

	#[test]
	fn split_urls()
	{
		let mut args = make_fake_clargs();
		args.url = Some("https://example.org/both".into());
		args.content_url = Some("https://cdn.example.org/c".into());

		let conf = build(&args).unwrap();
		assert_eq!(conf.version_url().as_str(), "https://example.org/both/");
		assert_eq!(conf.content_url().as_str(), "https://cdn.example.org/c/");
	}

	#[test]
	fn insecure_needs_optin()
	{
		let mut args = make_fake_clargs();
		args.url = Some("http://example.org/u".into());
		build(&args).unwrap_err();

		args.allow_insecure_http = true;
		let conf = build(&args).unwrap();
		assert_eq!(conf.version_url().scheme(), "http");
	}

	#[test]
	fn default_files_read()
	{
		let tmp = tempfile::tempdir().unwrap();
		let defdir = tmp.path().join("usr/share/defaults/swupd");
		std::fs::create_dir_all(&defdir).unwrap();
		std::fs::write(defdir.join("versionurl"),
				"https://mirror.example.org/v\n").unwrap();
		std::fs::write(defdir.join("contenturl"),
				"https://mirror.example.org/c\n").unwrap();
		std::fs::write(defdir.join("format"), "2\n").unwrap();

		let mut args = make_fake_clargs();
		args.path_prefix = Some(tmp.path().to_path_buf());
		let conf = build(&args).unwrap();

		assert_eq!(conf.version_url().as_str(),
				"https://mirror.example.org/v/");
		assert_eq!(conf.content_url().as_str(),
				"https://mirror.example.org/c/");
		assert_eq!(conf.format, 2);
	}
}
