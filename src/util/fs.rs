//! Filesystem-related funcs.
//!
//! This is mostly just some wrappers over low-level stuff we need that
//! isn't available in std: lstat without the io::Error guessing games,
//! xattr listing for the canonical hash, and the various sync calls the
//! rename engine leans on.

use std::path::{PathBuf, Path};
use std::ffi::{self, CString};



/*
 * Lower-level bits
 */

/// My stat(2) (lstat(2)) return, broken out rustily
#[derive(Debug, Default, Clone)]
pub(crate) struct Stat
{
	pub(crate) dev:   u64,
	pub(crate) ino:   u64,
	pub(crate) nlink: u64,
	pub(crate) uid:   u32,
	pub(crate) gid:   u32,
	pub(crate) rdev:  u64,
	pub(crate) size:  u64,

	// Raw stat() mode (type bits included).
	pub(crate) mode:  u32,

	// File permissions
	pub(crate) perms: u32,
}

impl Stat
{
	pub(crate) fn is_dir(&self)  -> bool
	{ (self.mode & libc::S_IFMT) == libc::S_IFDIR }
	pub(crate) fn is_file(&self) -> bool
	{ (self.mode & libc::S_IFMT) == libc::S_IFREG }
	pub(crate) fn is_link(&self) -> bool
	{ (self.mode & libc::S_IFMT) == libc::S_IFLNK }
}


/// Give some useful-ish erroring
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum LstatErr
{
	/// Couldn't build the filename; should be impossible.
	#[error("CString error: {0}")]
	CString(#[from] ffi::NulError),

	/// File not found
	#[error("File not found: {0}")]
	Nonexistent(PathBuf),

	/// Unknown stat(2) error
	#[error("libc stat(2): error {0}: {1}")]
	Lstat(i32, String),
}


fn path_cstring(file: &Path) -> Result<CString, ffi::NulError>
{
	let fnbytes = file.as_os_str().as_encoded_bytes();
	CString::new(fnbytes)
}

fn errno() -> i32
{
	// Thread-local on any libc we'd run on.
	unsafe { *libc::__errno_location() }
}

fn errno_str(errno: i32) -> String
{
	let estr = unsafe {
		let ce_cchar = libc::strerror(errno);
		let ce_cstr  = ffi::CStr::from_ptr(ce_cchar);
		ce_cstr.to_string_lossy()
	};
	estr.into_owned()
}


/// lstat(2).  This is a pretty thin wrapper.
///
/// Returns err on failing to find a file to work with.
pub(crate) fn lstat(file: &Path) -> Result<Stat, LstatErr>
{
	let f = path_cstring(file)?;

	let mut lcst: libc::stat;
	let errn = unsafe {
		use std::mem;

		lcst = mem::zeroed();
		let ret = libc::lstat(f.as_ptr(), &mut lcst);
		match ret {
			0 => 0i32,
			_ => errno(),
		}
	};

	// errno != 0 means some failure.
	use libc::{ENOENT, ENOTDIR};
	use LstatErr as LE;
	match errn {
		0 => {
			// Success!
			let myst = Stat {
				dev:   lcst.st_dev,
				ino:   lcst.st_ino,
				nlink: lcst.st_nlink,
				uid:   lcst.st_uid,
				gid:   lcst.st_gid,
				rdev:  lcst.st_rdev,
				size:  lcst.st_size as u64,
				mode:  lcst.st_mode,
				perms: lcst.st_mode & 0o7777,
			};
			Ok(myst)
		},
		ENOENT | ENOTDIR => {
			// These are roughly "file not found"-ish, so treat 'em
			// as such.
			Err(LE::Nonexistent(file.to_path_buf()))
		},
		e => {
			// Anything else, whoTF knows...
			Err(LE::Lstat(e, errno_str(e)))
		},
	}
}



/*
 * xattrs, for the hash canonical stream
 */

/// List the xattr names on a path (not following links).  Missing
/// support or an empty list both come back as an empty Vec.
pub(crate) fn list_xattrs(file: &Path) -> Result<Vec<Vec<u8>>, std::io::Error>
{
	let f = path_cstring(file)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

	// Ask for the size first, then the data.  Racy in principle, but a
	// growing xattr list mid-call just gets us an ERANGE and a caller
	// retry at worst.
	let sz = unsafe {
		libc::llistxattr(f.as_ptr(), std::ptr::null_mut(), 0)
	};
	if sz < 0
	{
		let e = errno();
		// No xattr support on this fs == no xattrs.
		if e == libc::ENOTSUP { return Ok(Vec::new()); }
		return Err(std::io::Error::from_raw_os_error(e));
	}
	if sz == 0 { return Ok(Vec::new()); }

	let mut buf: Vec<u8> = vec![0; sz as usize];
	let sz = unsafe {
		libc::llistxattr(f.as_ptr(), buf.as_mut_ptr() as *mut i8,
				buf.len())
	};
	if sz < 0 { return Err(std::io::Error::from_raw_os_error(errno())); }
	buf.truncate(sz as usize);

	// NUL-separated name list
	let names = buf.split(|b| *b == 0)
			.filter(|n| !n.is_empty())
			.map(|n| n.to_vec())
			.collect();
	Ok(names)
}


/// Get a single xattr value.
pub(crate) fn get_xattr(file: &Path, name: &[u8])
		-> Result<Vec<u8>, std::io::Error>
{
	let f = path_cstring(file)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
	let n = CString::new(name)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

	let sz = unsafe {
		libc::lgetxattr(f.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0)
	};
	if sz < 0 { return Err(std::io::Error::from_raw_os_error(errno())); }

	let mut buf: Vec<u8> = vec![0; sz as usize];
	let sz = unsafe {
		libc::lgetxattr(f.as_ptr(), n.as_ptr(),
				buf.as_mut_ptr() as *mut libc::c_void, buf.len())
	};
	if sz < 0 { return Err(std::io::Error::from_raw_os_error(errno())); }
	buf.truncate(sz as usize);
	Ok(buf)
}



/*
 * Some higher-level wrappers the staging/rename engine uses
 */

/// Apply mode and ownership to a path (not following links; symlink
/// modes are noise, so those only get ownership).  Ownership is only
/// attempted when we're root, since it can't work otherwise and the
/// failure would just drown out real problems.
pub(crate) fn apply_stat(file: &Path, mode: u32, uid: u32, gid: u32)
		-> Result<(), std::io::Error>
{
	let f = path_cstring(file)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

	if crate::util::euid() == 0
	{
		let ret = unsafe { libc::lchown(f.as_ptr(), uid, gid) };
		if ret != 0 { return Err(std::io::Error::from_raw_os_error(errno())); }
	}

	// chmod follows links, and link modes don't matter anyway.
	let st = lstat(file)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
	if !st.is_link()
	{
		let ret = unsafe { libc::chmod(f.as_ptr(), mode & 0o7777) };
		if ret != 0 { return Err(std::io::Error::from_raw_os_error(errno())); }
	}

	Ok(())
}


/// Hardlink src to dst, falling back to a byte copy when the link
/// fails (e.g., staged dir on another filesystem than the target).
pub(crate) fn link_or_copy(src: &Path, dst: &Path)
		-> Result<(), std::io::Error>
{
	match std::fs::hard_link(src, dst) {
		Ok(_) => Ok(()),
		Err(_) => {
			// EXDEV or whatever; copying gets the same bytes there.
			std::fs::copy(src, dst)?;
			Ok(())
		},
	}
}


/// fdatasync a file by path.  Data-only is all we need; the metadata
/// lands with the later rename+sync anyway.
pub(crate) fn fdatasync(file: &Path) -> Result<(), std::io::Error>
{
	use std::os::fd::AsRawFd as _;

	let fh = std::fs::File::open(file)?;
	let ret = unsafe { libc::fdatasync(fh.as_raw_fd()) };
	match ret {
		0 => Ok(()),
		_ => Err(std::io::Error::from_raw_os_error(errno())),
	}
}


/// Global sync(2).  Can't fail, in the "won't tell you" sense.
pub(crate) fn sync()
{
	unsafe { libc::sync() };
}


/// Write a file out "atomically": dump to a dot-tmp next to it, fsync,
/// rename over.  Readers see the old bytes or the new bytes, never a
/// torn middle.
pub(crate) fn atomic_write(file: &Path, contents: &[u8])
		-> Result<(), std::io::Error>
{
	use std::io::Write as _;

	let mut tmp = file.as_os_str().to_os_string();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);

	let mut fh = std::fs::File::create(&tmp)?;
	fh.write_all(contents)?;
	fh.sync_all()?;
	drop(fh);

	std::fs::rename(&tmp, file)?;
	Ok(())
}


/// Make a dir (and not its parents) with a mode, tolerating it already
/// being there as a dir.
pub(crate) fn dodir(dir: &Path, mode: Option<u32>)
		-> Result<(), std::io::Error>
{
	if !dir.exists()
	{
		use std::fs::DirBuilder;
		use std::os::unix::fs::DirBuilderExt;
		let mut db = DirBuilder::new();
		if let Some(m) = mode { db.mode(m); }
		db.create(dir)?;
	}

	// Should be a dir (in case it already existed as something else)
	if !dir.is_dir()
	{
		use std::io::{Error, ErrorKind as EK};
		let d_s = dir.to_string_lossy();
		let ioe = Error::new(EK::AlreadyExists, d_s);
		Err(ioe)?;
	}

	// If it pre-existed with another mode, I'm gonna assume that was
	// the user's intention.
	Ok(())
}
