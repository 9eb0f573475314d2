//! Process-wide mutual exclusion.
//!
//! One advisory fcntl write-lock on `<state>/swupd_lock`.  Holding it
//! is the precondition for anything that mutates the state dir or the
//! system.  The file is never unlinked (that would open a race where
//! two processes each lock a different inode); dropping the handle is
//! enough to release.

use std::fs::File;
use std::path::Path;

use thiserror::Error;


#[derive(Debug)]
#[derive(Error)]
pub(crate) enum LockErr
{
	/// Somebody else has it.
	#[error("lock is held by another process")]
	Held,

	/// Couldn't even get to the lockfile.
	#[error("lockfile I/O error: {0}")]
	IO(#[from] std::io::Error),
}


/// The held lock.  Keep it alive for the whole operation.
#[derive(Debug)]
pub(crate) struct Lock
{
	// Held only for its fd; the kernel drops the region lock when this
	// closes.
	_fh: File,
}


impl Lock
{
	/// Take the lock, or say we can't.
	pub(crate) fn take(state_dir: &Path) -> Result<Self, LockErr>
	{
		use std::os::fd::AsRawFd as _;
		use std::os::unix::fs::OpenOptionsExt as _;

		crate::util::fs::dodir(state_dir, Some(0o755))?;
		let lockfile = state_dir.join("swupd_lock");

		let fh = std::fs::OpenOptions::new()
				.read(true).write(true).create(true).mode(0o600)
				.open(&lockfile)?;

		// Write-lock the whole file.
		let fl = libc::flock {
			l_type: libc::F_WRLCK as i16,
			l_whence: libc::SEEK_SET as i16,
			l_start: 0,
			l_len: 0,
			l_pid: 0,
		};
		let ret = unsafe { libc::fcntl(fh.as_raw_fd(), libc::F_SETLK, &fl) };
		if ret == -1
		{
			let e = std::io::Error::last_os_error();
			return match e.raw_os_error() {
				Some(libc::EAGAIN) | Some(libc::EACCES) => Err(LockErr::Held),
				_ => Err(e.into()),
			};
		}

		// Speculatively dump our pid in there; handy for debugging who
		// holds it.
		use std::io::Write as _;
		let mut fh = fh;
		let _ = fh.set_len(0);
		let _ = write!(fh, "{}", std::process::id());

		Ok(Lock { _fh: fh })
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn take_and_release()
	{
		let tmp = tempfile::tempdir().unwrap();

		let l1 = Lock::take(tmp.path()).unwrap();
		drop(l1);

		// Released, so takeable again.  (fcntl locks don't exclude
		// within one process, so contention can't be unit tested here;
		// the Held arm is exercised by running two of us for real.)
		let _l2 = Lock::take(tmp.path()).unwrap();

		// And the pid breadcrumb landed
		let pid = std::fs::read_to_string(tmp.path().join("swupd_lock"))
				.unwrap();
		assert_eq!(pid, std::process::id().to_string());
	}
}
