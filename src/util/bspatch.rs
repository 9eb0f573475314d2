//! Apply bspatches.
//!
//! Delta-packs carry bsdiff-format binaries named
//! `delta/<from-hash>-<to-hash>`; applying one takes the local file
//! whose hash is <from> and produces a staged blob that should hash to
//! <to>.  The "should" is checked by the caller; a miss isn't fatal,
//! it just falls through to a fullfile download.
use std::path::Path;


/// Patch an input file into an output file.
pub(crate) fn patch(src: &Path, dst: &Path, patch: &Path)
		-> Result<(), std::io::Error>
{
	use std::fs::{self, File};
	use qbsdiff::Bspatch;

	// let srcf = File::open(src)?;
	// https://github.com/hucsmn/qbsdiff/pull/8
	// Until then...
	let srcb = fs::read(src)?;
	let mut dstf = File::create(dst)?;
	let patchb = fs::read(patch)?;

	let patcher = Bspatch::new(&patchb)?;
	patcher.apply(&srcb, &mut dstf).and_then(|_| Ok(()))
}



#[cfg(test)]
mod tests
{
	#[test]
	fn roundtrip()
	{
		use qbsdiff::Bsdiff;

		let tmp = tempfile::tempdir().unwrap();
		let old = tmp.path().join("old");
		let new = tmp.path().join("new");
		let pat = tmp.path().join("patch");
		let out = tmp.path().join("out");

		let oldb = b"the quick brown fox jumps over the lazy dog";
		let newb = b"the quick brown fox jumps over the lazy cat";
		std::fs::write(&old, oldb).unwrap();
		std::fs::write(&new, newb).unwrap();

		// Diff 'em
		let mut patb = Vec::new();
		Bsdiff::new(oldb, newb).compare(std::io::Cursor::new(&mut patb))
				.unwrap();
		std::fs::write(&pat, &patb).unwrap();

		// And patch should get us back to new
		super::patch(&old, &out, &pat).unwrap();
		assert_eq!(std::fs::read(&out).unwrap(), newb);
	}
}
