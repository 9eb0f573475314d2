//! Misc util funcs

/// SHA256 hashing utils
pub(crate) mod hash;

/// Tarball handling
pub(crate) mod archive;

/// Binary patching
pub(crate) mod bspatch;

/// Filesystem stuff (lstat, xattrs, syncing)
pub(crate) mod fs;



// XXX Is caching worth it?  geteuid() may not even be an actual syscall
// now, so may be cheaper than eating the atomic...
use std::sync::atomic::AtomicU32;
static EUID: AtomicU32 = AtomicU32::new(0);

pub(crate) fn set_euid()
{
	use std::sync::atomic::Ordering::Relaxed;
	let e = unsafe { libc::geteuid() };
	EUID.store(e, Relaxed);
}

/// We'll care about euid for things like chown() calls.
pub(crate) fn euid() -> u32
{
	use std::sync::atomic::Ordering::Relaxed;
	EUID.load(Relaxed)
}



/// For writing out files, we may want some buffering.  In a little quick
/// sampling, over 99% of the files are sub-1 meg, and 4 megs gets us to
/// something like 99.8%.  So that's a good working number for a buffer
/// size to cut down on syscalls etc...
pub(crate) static FILE_BUFSZ: usize = 4 * 1024 * 1024;



use std::path::{Path, PathBuf};

/// Append paths.
///
/// It's not trivial to just use Path::join() because it treats join'ing
/// an "absolute" path as _replacing_ the base, not appending to.
/// Presumably there are usecases where that's the sensible behavior.
/// For us, though, it pretty much never is; we're always treating the
/// path prefix as a sort of "chroot".  So to avoid repeating ourselves
/// too often, just make a util func for it.
pub(crate) fn path_join(base: impl AsRef<Path>, sub: impl AsRef<Path>)
		-> PathBuf
{
	// So for our subpath, strip off the leading absoluteness if it has
	// it.
	let sub = match sub.as_ref().strip_prefix("/") {
		Ok(x) => x,
		Err(_) => sub.as_ref(),
	};
	// Then .join will do what we want.
	base.as_ref().join(sub)
}


/// Pluralize for a number
pub(crate) fn plural(n: usize) -> &'static str
{
	if n == 1 { "" } else { "s" }
}
