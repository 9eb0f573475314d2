//! Tarball handling.
//!
//! Everything the server hands us (manifests, packs, fullfiles) is a
//! tarball, sometimes gzip'd.  We don't trust filename extensions for
//! the compression; we sniff the magic instead, since mirrors have been
//! known to re-serve .tar names with gzip'd bytes.

use std::io::Read;
use std::path::Path;


#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum ArchiveErr
{
	#[error("archive I/O error: {0}")]
	IO(#[from] std::io::Error),

	#[error("unexpected archive contents: {0}")]
	Contents(String),
}


/// Open a tar reader over a file, transparently ungzipping.
fn open_reader(src: &Path) -> Result<Box<dyn Read>, ArchiveErr>
{
	use std::fs::File;
	use std::io::BufReader;

	let mut fh = File::open(src)?;

	// Sniff the first couple bytes for the gzip magic.
	let mut magic = [0u8; 2];
	let got = fh.read(&mut magic)?;
	use std::io::Seek as _;
	fh.seek(std::io::SeekFrom::Start(0))?;

	let brd = BufReader::with_capacity(crate::util::FILE_BUFSZ, fh);
	let rdr: Box<dyn Read> = match got == 2 && magic == [0x1f, 0x8b] {
		true  => Box::new(flate2::read::GzDecoder::new(brd)),
		false => Box::new(brd),
	};
	Ok(rdr)
}


/// Extract a tarball into a directory.
///
/// Permissions come along; ownership and xattrs only when we're root,
/// since they can't apply otherwise.
pub(crate) fn extract_to(src: &Path, dstdir: &Path) -> Result<(), ArchiveErr>
{
	let rdr = open_reader(src)?;
	let mut arch = tar::Archive::new(rdr);

	let root = crate::util::euid() == 0;
	arch.set_preserve_permissions(true);
	arch.set_preserve_ownerships(root);
	arch.set_unpack_xattrs(root);
	arch.set_overwrite(true);

	arch.unpack(dstdir)?;
	Ok(())
}


/// Read a single named entry out of a tarball into memory.  Used for
/// manifest tarballs, where we want the bytes for hash-checking before
/// anything lands in the cache dir.
pub(crate) fn read_entry(src: &Path, name: &str)
		-> Result<Vec<u8>, ArchiveErr>
{
	let rdr = open_reader(src)?;
	let mut arch = tar::Archive::new(rdr);

	for ent in arch.entries()?
	{
		let mut ent = ent?;
		let epath = ent.path()?;
		if epath.as_ref() == Path::new(name)
		{
			let mut buf = Vec::with_capacity(ent.size() as usize);
			ent.read_to_end(&mut buf)?;
			return Ok(buf);
		}
	}

	Err(ArchiveErr::Contents(format!("no '{name}' entry in \
			{}", src.display())))
}



#[cfg(test)]
pub(crate) mod tests
{
	use super::*;
	use std::path::PathBuf;

	/// Build a little tarball for tests.  Other modules' tests use this
	/// too; it's easier than hauling fixture files around.
	pub(crate) fn mk_tar(dst: &Path, files: &[(&str, &[u8])]) -> PathBuf
	{
		let fh = std::fs::File::create(dst).unwrap();
		let mut tb = tar::Builder::new(fh);
		for (name, data) in files
		{
			let mut hdr = tar::Header::new_gnu();
			hdr.set_size(data.len() as u64);
			hdr.set_mode(0o644);
			hdr.set_uid(0);
			hdr.set_gid(0);
			hdr.set_cksum();
			tb.append_data(&mut hdr, name, *data).unwrap();
		}
		tb.into_inner().unwrap();
		dst.to_path_buf()
	}

	#[test]
	fn extract()
	{
		let tmp = tempfile::tempdir().unwrap();
		let tarf = tmp.path().join("test.tar");
		mk_tar(&tarf, &[("one", b"first file"), ("sub/two", b"second")]);

		let out = tmp.path().join("out");
		std::fs::create_dir(&out).unwrap();
		extract_to(&tarf, &out).unwrap();

		assert_eq!(std::fs::read(out.join("one")).unwrap(), b"first file");
		assert_eq!(std::fs::read(out.join("sub/two")).unwrap(), b"second");
	}

	#[test]
	fn entry_read()
	{
		let tmp = tempfile::tempdir().unwrap();
		let tarf = tmp.path().join("test.tar");
		mk_tar(&tarf, &[("Manifest.MoM", b"MANIFEST\t1\n")]);

		let got = read_entry(&tarf, "Manifest.MoM").unwrap();
		assert_eq!(got, b"MANIFEST\t1\n");

		read_entry(&tarf, "nope").unwrap_err();
	}

	#[test]
	fn gz_sniffing()
	{
		use std::io::Write as _;

		let tmp = tempfile::tempdir().unwrap();
		let tarf = tmp.path().join("plain.tar");
		mk_tar(&tarf, &[("file", b"data data")]);

		// gzip it up, but name it .tar like a lying mirror would
		let gzf = tmp.path().join("lying.tar");
		let raw = std::fs::read(&tarf).unwrap();
		let out = std::fs::File::create(&gzf).unwrap();
		let mut enc = flate2::write::GzEncoder::new(out,
				flate2::Compression::fast());
		enc.write_all(&raw).unwrap();
		enc.finish().unwrap();

		let got = read_entry(&gzf, "file").unwrap();
		assert_eq!(got, b"data data");
	}
}
