//! Path classification and the ignore policy.
//!
//! Manifests carry flags, but we don't take their word for it: every
//! record gets re-classified on every operation, because an ignored
//! path that gets touched is a much worse bug than a few string
//! compares.  The walk also notices the paths that imply post-update
//! work (kernel staging, bootloader, systemd re-exec).

use std::path::{Path, PathBuf};

use crate::manifest::FileRecord;
use crate::scripts::Needs;


/// The classifier.  Holds the mount table snapshot so the "under a
/// mounted-away subtree" rule doesn't reparse /proc per file.
#[derive(Debug)]
pub(crate) struct Heuristics
{
	/// Mount points inside the tree we're updating (the tree root
	/// itself doesn't count).
	mounted: Vec<PathBuf>,

	/// Stateless OS: config lives in /etc only when the admin put it
	/// there, so update never writes under /etc.  This is the
	/// default and there's currently no knob, but the logic keys off
	/// the field rather than assuming.
	stateless: bool,
}


impl Heuristics
{
	pub(crate) fn new(prefix: &Path) -> Self
	{
		Heuristics {
			mounted: read_mounts(prefix),
			stateless: true,
		}
	}

	#[cfg(test)]
	pub(crate) fn bare() -> Self
	{
		Heuristics { mounted: Vec::new(), stateless: true }
	}


	/// Is this record one we must never touch on disk?
	pub(crate) fn ignore(&self, rec: &FileRecord) -> bool
	{
		let path = &rec.path;

		// Config, on a stateless OS.  Manifest flag or the path
		// heuristic; we recheck the path since flags come from the
		// server.
		if self.stateless && (rec.flags.config || is_config(path))
		{ return true; }

		// State-ish paths
		if rec.flags.state || self.is_state(path)
		{ return true; }

		// Never remove boot artifacts
		if rec.flags.boot && rec.is_deleted()
		{ return true; }

		if rec.flags.orphan || rec.is_ghosted()
		{ return true; }

		false
	}


	/// State check: mounted-away or on the static list.
	fn is_state(&self, path: &Path) -> bool
	{
		if self.mounted.iter().any(|m| path == m || path.starts_with(m))
		{ return true; }

		is_state_path(path)
	}
}


fn is_config(path: &Path) -> bool
{
	path.starts_with("/etc")
}


/// The static state list.  /usr/src is state except the debug tree
/// and the kernel source dirs, which updates do own.
fn is_state_path(path: &Path) -> bool
{
	if path.starts_with("/usr/src")
	{
		if path == Path::new("/usr/src/debug")
				|| path.starts_with("/usr/src/debug")
		{ return false; }
		let under_kernel = path.strip_prefix("/usr/src").ok()
				.and_then(|r| r.components().next())
				.and_then(|c| c.as_os_str().to_str())
				.map(|s| s.starts_with("kernel"))
				.unwrap_or(false);
		if under_kernel { return false; }
		return true;
	}

	const STATE: &[&str] = &[
		"/data", "/dev", "/home", "/lost+found", "/proc", "/root",
		"/run", "/sys", "/tmp", "/var",
	];
	STATE.iter().any(|s| path.starts_with(s))
}


/// What post-update helpers does touching this path imply?
pub(crate) fn hook_needs(path: &Path) -> Needs
{
	let mut needs = Needs::default();

	if path.starts_with("/usr/lib/kernel")
	{ needs.update_boot = true; }

	if path == Path::new("/usr/lib/systemd/systemd")
	{ needs.systemd_reexec = true; }

	let pstr = path.to_string_lossy();
	let bootloaderish = pstr.starts_with("/usr/lib/gummiboot")
			|| pstr.starts_with("/usr/bin/gummiboot")
			|| pstr == "/usr/bin/bootctl"
			|| pstr.starts_with("/usr/lib/systemd/boot")
			|| pstr == "/usr/bin/clr-boot-manager"
			|| pstr == "/usr/share/syslinux/ldlinux.c32";
	if bootloaderish
	{ needs.update_bootloader = true; }

	needs
}


/// Snapshot the mount points strictly inside the prefix.  Only useful
/// against the live root; a build prefix has no mounts of its own and
/// gets an empty list.
fn read_mounts(prefix: &Path) -> Vec<PathBuf>
{
	let mounts = match std::fs::read_to_string("/proc/self/mounts") {
		Ok(m) => m,
		Err(_) => return Vec::new(),
	};

	let mut ret = Vec::new();
	for l in mounts.lines()
	{
		let mut fields = l.split_whitespace();
		let _dev = fields.next();
		let Some(mp) = fields.next() else { continue };
		let mp = Path::new(mp);

		// Inside the tree, not the tree itself
		let rel = match mp.strip_prefix(prefix) {
			Ok(r) if !r.as_os_str().is_empty() => r,
			_ => continue,
		};
		ret.push(Path::new("/").join(rel));
	}
	ret
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::testutil::rec;
	use crate::manifest::{FileKind, Lifecycle};

	fn h() -> Heuristics { Heuristics::bare() }

	fn frec(path: &str) -> FileRecord
	{
		rec(path, FileKind::File, Lifecycle::Live, 10,
				&crate::manifest::testutil::hash('1'))
	}

	#[test]
	fn config_ignored()
	{
		assert!(h().ignore(&frec("/etc/fstab")));

		// Flagged config outside /etc also counts
		let mut r = frec("/usr/share/defaults/thing.conf");
		assert!(!h().ignore(&r));
		r.flags.config = true;
		assert!(h().ignore(&r));
	}

	#[test]
	fn state_paths_ignored()
	{
		for p in ["/var/lib/thing", "/home/user/x", "/tmp/y", "/proc/1",
				"/run/foo", "/root/.bashrc", "/data/db", "/sys/kernel",
				"/dev/null", "/lost+found/x", "/usr/src/elsewhere"]
		{
			assert!(h().ignore(&frec(p)), "{p} should be ignored");
		}

		// The carve-outs under /usr/src
		for p in ["/usr/src/debug/foo.c", "/usr/src/debug",
				"/usr/src/kernel/Makefile", "/usr/src/kernel-5.x/x"]
		{
			assert!(!h().ignore(&frec(p)), "{p} should NOT be ignored");
		}
	}

	#[test]
	fn updatable_not_ignored()
	{
		for p in ["/usr/bin/vim", "/usr/lib/libc.so.6", "/boot/loader",
				"/usr/share/man/man1/x.1"]
		{
			assert!(!h().ignore(&frec(p)), "{p} should be updatable");
		}
	}

	#[test]
	fn deleted_boot_kept()
	{
		let mut r = frec("/usr/lib/kernel/org.clearlinux.native");
		r.flags.boot = true;
		assert!(!h().ignore(&r), "live boot file is updatable");

		r.state = Lifecycle::Deleted;
		assert!(h().ignore(&r), "deleted boot file is never removed");
	}

	#[test]
	fn ghosted_and_orphan()
	{
		let mut r = frec("/usr/lib/kernel/old-img");
		r.state = Lifecycle::Ghosted;
		assert!(h().ignore(&r));

		let mut r = frec("/usr/bin/leftover");
		r.flags.orphan = true;
		assert!(h().ignore(&r));
	}

	#[test]
	fn hook_flags()
	{
		let n = hook_needs(Path::new("/usr/lib/kernel/some-img"));
		assert!(n.update_boot && !n.update_bootloader);

		let n = hook_needs(Path::new("/usr/lib/systemd/systemd"));
		assert!(n.systemd_reexec);

		for p in ["/usr/bin/bootctl", "/usr/lib/systemd/boot/efi.img",
				"/usr/bin/clr-boot-manager",
				"/usr/share/syslinux/ldlinux.c32",
				"/usr/lib/gummiboot/whatever"]
		{
			assert!(hook_needs(Path::new(p)).update_bootloader,
					"{p} should flag the bootloader");
		}

		let n = hook_needs(Path::new("/usr/bin/vim"));
		assert!(!n.any());
	}
}
