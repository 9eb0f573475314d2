//! Command line handling
//!
//! General invocation:
//! $0 [global options] <command> [command-opts]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Add extra default'ing to make config tests easier

/// Main arg entry point
#[cfg_attr(test, derive(Default))]
#[derive(Debug)]
#[derive(Parser)]
#[command(about = "Keep your content-addressed OS in one piece.")]
#[command(version)]
pub struct CrArgs
{
	#[command(subcommand)]
	pub(crate) command: CrCmds,

	/// Base URL for both version and content downloads.
	///
	/// Handy shorthand when they live on one server; the split
	/// --versionurl/--contenturl args win over this if given.
	#[arg(short = 'u', long)]
	pub(crate) url: Option<String>,

	/// URL for version string downloads
	#[arg(id = "versionurl", short = 'v', long)]
	pub(crate) version_url: Option<String>,

	/// URL for content file downloads
	#[arg(id = "contenturl", short = 'c', long)]
	pub(crate) content_url: Option<String>,

	/// Manifest format this client should speak (numeric)
	#[arg(short = 'F', long)]
	pub(crate) format: Option<String>,

	/// Operate on a system mounted at this path instead of /.
	///
	/// Useful for chroots, images under construction, or containers'
	/// root trees.
	#[arg(id = "path", short = 'p', long)]
	pub(crate) path_prefix: Option<PathBuf>,

	/// Where downloads, staged content, and manifest caches live
	#[arg(id = "statedir", short = 'S', long)]
	pub(crate) state_dir: Option<PathBuf>,

	/// Certificate used to verify signed content
	#[arg(id = "certpath", short = 'C', long)]
	pub(crate) cert_path: Option<PathBuf>,

	/// Don't verify certificate signatures on the MoM or version info.
	///
	/// You'd better have some other reason to trust the server.
	#[arg(short = 'n', long)]
	pub(crate) nosigcheck: bool,

	/// Ignore certificate validity times.
	///
	/// For systems whose clock is wrong enough that nothing verifies;
	/// an update usually fixes the clock too.
	#[arg(short = 'I', long = "ignore-time")]
	pub(crate) ignore_time: bool,

	/// Allow plain-http URLs.  Off unless you really mean it.
	#[arg(long = "allow-insecure-http")]
	pub(crate) allow_insecure_http: bool,

	/// How many times to retry a failed download
	#[arg(long = "max-retries")]
	pub(crate) max_retries: Option<u32>,

	/// Initial delay between download retries, seconds (doubles per
	/// retry)
	#[arg(long = "retry-delay")]
	pub(crate) retry_delay: Option<u32>,

	/// Machine-readable JSON progress/output
	#[arg(short = 'j', long = "json-output")]
	pub(crate) json_output: bool,

	/// Don't run post-update helper scripts (boot manager, systemd
	/// re-exec)
	#[arg(long = "no-scripts")]
	pub(crate) no_scripts: bool,

	/// How many downloads to run in parallel (default 4)
	#[arg(long = "jobs-net")]
	pub(crate) jobs_net: Option<u32>,

	/// How many CPU-bound threads (hashing, patching; default numcpu
	/// up to 6)
	#[arg(long = "jobs-cpu")]
	pub(crate) jobs_cpu: Option<u32>,
}



/// Individual subcommands and their args
#[cfg_attr(test, derive(Default))]
#[derive(Debug)]
#[derive(Subcommand)]
pub(crate) enum CrCmds
{
	/// Dummy value (mostly to make derive(Default) happy...)
	#[cfg(test)]
	#[cfg_attr(test, default)]
	#[command(skip)]
	Dummy,

	/// Install the OS into a path.
	///
	/// Fills an empty (or half-filled) target with the requested
	/// bundles at the requested version, from zero-packs.  This is
	/// the image-builder and recovery entry point; it assumes nothing
	/// about what's already there.
	OsInstall(CrCmdOsInstall),

	/// Update the system to a newer version.
	Update(CrCmdUpdate),

	/// Check system files against their manifests.
	///
	/// By default just reports differences.  With --fix, repairs
	/// them: missing files are added, mismatched files replaced,
	/// files deleted upstream removed.  Ignored paths (config,
	/// state, mounted trees) are never touched either way.
	Verify(CrCmdVerify),

	/// Repair system files (verify --fix, under its better-known
	/// name).
	Repair(CrCmdVerify),

	/// Report differences without changing anything (alias of plain
	/// verify).
	Diagnose(CrCmdVerify),

	/// Add one or more bundles to the system.
	BundleAdd(CrCmdBundleAdd),

	/// Remove one or more bundles from the system.
	///
	/// Refuses to remove a bundle some other installed bundle
	/// requires (see --force and --recursive), and will never remove
	/// os-core.
	BundleRemove(CrCmdBundleRemove),

	/// List bundles, installed or available.
	BundleList(CrCmdBundleList),

	/// Show details about a bundle.
	BundleInfo(CrCmdBundleInfo),

	/// Quick check for whether a newer version exists.
	///
	/// Exits 0 if there's an update, 1 if you're current.  Cheap
	/// enough for cron.
	CheckUpdate,

	/// Show the updater's configuration and system state.
	Info,

	/// Show the configured upstream and mirror URLs.
	Mirror,

	/// Report whether automatic updating is enabled.
	Autoupdate,

	/// Search bundle manifests for a path fragment.
	///
	/// Says which bundle(s) ship files matching the given string.
	/// Downloads any manifests not already cached, which on first run
	/// is not small.
	Search(CrCmdSearch),

	/// Remove cached update content from the state directory.
	Clean(CrCmdClean),

	/// Print the manifest hash of a file on disk.  (DEV)
	///
	/// This computes the same canonical hash the manifests carry, so
	/// you can eyeball why verify thinks a file differs.
	#[clap(hide(true))]
	Hashdump(CrCmdHashdump),
}



/*
 * Individual [sub]command args
 */

/// OsInstall args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdOsInstall
{
	/// Where to install (becomes the target's /)
	pub(crate) path: PathBuf,

	/// Version to install (default: latest the server offers)
	#[arg(short = 'V', long)]
	pub(crate) version: Option<u32>,

	/// Bundles to install, comma separated (os-core always comes)
	#[arg(short = 'B', long, value_delimiter = ',', num_args = 1..)]
	pub(crate) bundles: Vec<String>,

	/// Download and stage content but don't touch the target
	#[arg(long)]
	pub(crate) download: bool,

	/// Don't pull in optional (also-add) bundles
	#[arg(long = "skip-optional")]
	pub(crate) skip_optional: bool,

	/// Keep going past non-critical errors
	#[arg(short = 'x', long)]
	pub(crate) force: bool,

	/// Reuse another state dir's staged content (hardlinked in when
	/// the hashes check out)
	#[arg(long = "statedir-cache")]
	pub(crate) statedir_cache: Option<PathBuf>,
}

/// Update args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdUpdate
{
	/// Update to a specific version instead of the latest
	#[arg(short = 'V', long)]
	pub(crate) version: Option<u32>,

	/// Download and stage everything, but don't install it
	#[arg(long)]
	pub(crate) download: bool,

	/// Keep downloaded packs and scratch files afterward
	#[arg(short = 'k', long)]
	pub(crate) keepcache: bool,

	/// Just report whether an update is available
	#[arg(short = 's', long)]
	pub(crate) status: bool,

	/// Update a third-party repository (managed externally; not
	/// supported by this binary)
	#[arg(short = 'R', long)]
	pub(crate) repo: Option<String>,
}

/// Verify/Repair args
#[derive(Debug, Default)]
#[derive(Parser)]
pub(crate) struct CrCmdVerify
{
	/// Verify against this version (default: current)
	#[arg(short = 'V', long)]
	pub(crate) version: Option<u32>,

	/// Fix what doesn't match (this is what `repair` means)
	#[arg(long)]
	pub(crate) fix: bool,

	/// Keep going past non-critical errors
	#[arg(short = 'x', long)]
	pub(crate) force: bool,

	/// Don't compare hashes, only look for missing files
	#[arg(short = 'q', long)]
	pub(crate) quick: bool,

	/// Restrict to these bundles' files (requires --version)
	#[arg(short = 'B', long, value_delimiter = ',', num_args = 1..)]
	pub(crate) bundles: Vec<String>,

	/// Also hunt files no manifest knows about
	#[arg(short = 'Y', long)]
	pub(crate) picky: bool,

	/// Tree the picky hunt walks (default /usr)
	#[arg(short = 'X', long = "picky-tree")]
	pub(crate) picky_tree: Option<PathBuf>,

	/// Regex of paths the picky hunt leaves alone
	#[arg(short = 'w', long = "picky-whitelist")]
	pub(crate) picky_whitelist: Option<String>,

	/// Only do the picky pass
	#[arg(long = "extra-files-only")]
	pub(crate) extra_files_only: bool,

	/// Restrict to one path (or everything under it)
	#[arg(long)]
	pub(crate) file: Option<PathBuf>,
}

/// BundleAdd args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdBundleAdd
{
	/// Bundle name[s] to add
	#[arg(required = true)]
	pub(crate) bundles: Vec<String>,

	/// Don't pull in optional (also-add) bundles
	#[arg(long = "skip-optional")]
	pub(crate) skip_optional: bool,

	/// Skip the free-space check
	#[arg(long = "skip-diskspace-check")]
	pub(crate) skip_diskspace_check: bool,
}

/// BundleRemove args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdBundleRemove
{
	/// Bundle name[s] to remove
	#[arg(required = true)]
	pub(crate) bundles: Vec<String>,

	/// Remove even if other bundles depend on it
	#[arg(short = 'x', long)]
	pub(crate) force: bool,

	/// Also remove dependencies nothing else needs
	#[arg(short = 'R', long)]
	pub(crate) recursive: bool,
}

/// BundleList args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdBundleList
{
	/// All available bundles, not just installed ones
	#[arg(short = 'a', long)]
	pub(crate) all: bool,

	/// List bundles that (transitively) require the given bundle
	#[arg(short = 'D', long = "has-dep")]
	pub(crate) has_dep: Option<String>,

	/// List what the given bundle (transitively) requires
	#[arg(long)]
	pub(crate) deps: Option<String>,

	/// Mark each listed bundle installed / not installed
	#[arg(long)]
	pub(crate) status: bool,
}

/// BundleInfo args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdBundleInfo
{
	/// The bundle
	pub(crate) bundle: String,

	/// Look at this version instead of the current one
	#[arg(short = 'V', long)]
	pub(crate) version: Option<u32>,

	/// Show the include graph edges too
	#[arg(long)]
	pub(crate) dependencies: bool,

	/// Show the file list too
	#[arg(long)]
	pub(crate) files: bool,
}

/// Search args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdSearch
{
	/// Substring to look for in file paths
	pub(crate) term: String,
}

/// Clean args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdClean
{
	/// Remove everything, including metadata for the running version
	#[arg(long)]
	pub(crate) all: bool,

	/// Just print what would be removed
	#[arg(long = "dry-run")]
	pub(crate) dry_run: bool,
}

/// Hashdump args
#[derive(Debug)]
#[derive(Parser)]
pub(crate) struct CrCmdHashdump
{
	/// File to hash (interpreted under --path)
	pub(crate) target: PathBuf,
}




/*
 * Misc impls and utils
 */

impl std::fmt::Display for CrCmds
{
	fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error>
	{
		match self
		{
			Self::OsInstall{..} => f.write_str("os-install"),
			Self::Update{..}   => f.write_str("update"),
			Self::Verify{..}   => f.write_str("verify"),
			Self::Repair{..}   => f.write_str("repair"),
			Self::Diagnose{..} => f.write_str("diagnose"),
			Self::BundleAdd{..}    => f.write_str("bundle-add"),
			Self::BundleRemove{..} => f.write_str("bundle-remove"),
			Self::BundleList{..}   => f.write_str("bundle-list"),
			Self::BundleInfo{..}   => f.write_str("bundle-info"),
			Self::CheckUpdate  => f.write_str("check-update"),
			Self::Info         => f.write_str("info"),
			Self::Mirror       => f.write_str("mirror"),
			Self::Autoupdate   => f.write_str("autoupdate"),
			Self::Search{..}   => f.write_str("search"),
			Self::Clean{..}    => f.write_str("clean"),

			// More dev/debug-ish stuff
			Self::Hashdump{..} => f.write_str("hashdump"),

			// Shouldn't really be possible
			#[cfg(test)]
			Self::Dummy => f.write_str("dummy"),
		}
	}
}


pub fn parse() -> CrArgs
{
	let ret = CrArgs::parse();

	// Setup the parallelism bits from the parse
	crate::core::pool::init_jobs(&ret.jobs_net, &ret.jobs_cpu);

	ret
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parses_basic_commands()
	{
		let a = CrArgs::try_parse_from(["x", "update"]).unwrap();
		assert!(matches!(a.command, CrCmds::Update(_)));

		let a = CrArgs::try_parse_from(["x", "-S", "/tmp/st",
				"os-install", "/tmp/root", "-V", "100",
				"-B", "editors,os-core"]).unwrap();
		assert_eq!(a.state_dir, Some("/tmp/st".into()));
		match a.command {
			CrCmds::OsInstall(oi) => {
				assert_eq!(oi.path, PathBuf::from("/tmp/root"));
				assert_eq!(oi.version, Some(100));
				assert_eq!(oi.bundles, vec!["editors", "os-core"]);
			},
			c => panic!("wrong command {c}"),
		}
	}

	#[test]
	fn verify_flags()
	{
		let a = CrArgs::try_parse_from(["x", "verify", "--fix", "-Y",
				"-X", "/usr", "-w", "/usr/local"]).unwrap();
		match a.command {
			CrCmds::Verify(v) => {
				assert!(v.fix && v.picky);
				assert_eq!(v.picky_tree, Some("/usr".into()));
				assert_eq!(v.picky_whitelist, Some("/usr/local".into()));
			},
			c => panic!("wrong command {c}"),
		}

		// repair is verify-with-fix; the runner forces fix on
		let a = CrArgs::try_parse_from(["x", "repair"]).unwrap();
		assert!(matches!(a.command, CrCmds::Repair(_)));
	}

	#[test]
	fn global_flags()
	{
		let a = CrArgs::try_parse_from(["x", "-u",
				"https://example.org/u", "-n", "-I", "-j",
				"--max-retries", "5", "check-update"]).unwrap();
		assert_eq!(a.url, Some("https://example.org/u".to_string()));
		assert!(a.nosigcheck && a.ignore_time && a.json_output);
		assert_eq!(a.max_retries, Some(5));
	}

	#[test]
	fn remove_needs_bundles()
	{
		CrArgs::try_parse_from(["x", "bundle-remove"]).unwrap_err();
		let a = CrArgs::try_parse_from(["x", "bundle-remove", "editors",
				"-R"]).unwrap();
		match a.command {
			CrCmds::BundleRemove(br) => {
				assert_eq!(br.bundles, vec!["editors"]);
				assert!(br.recursive && !br.force);
			},
			c => panic!("wrong command {c}"),
		}
	}
}
