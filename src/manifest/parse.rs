//! Full parse of a manifest document.
//!
//! The layout is a small tab-separated header block ending at the
//! first blank line, then one record per line:
//!
//!   MANIFEST<TAB>1
//!   version:<TAB>100
//!   previous:<TAB>90
//!   filecount:<TAB>123
//!   contentsize:<TAB>456789
//!   includes:<TAB>os-core
//!
//!   F...<TAB>/usr/bin/vim<TAB>100<TAB><64 hex chars>
//!
//! Flags are four positional chars: type (F/D/L/M), lifecycle
//! (./d/g), modifier (./C/s/b/o/m/e/x), and a reserved fourth we
//! accept and ignore.

use std::str::FromStr;

use anyhow::anyhow;

use super::structs::{FileRecord, FileKind, Lifecycle, Modifier};
use super::structs::{Manifest, Header};


/// Error from parsing a manifest.  We collect them all rather than
/// bailing at the first; a truncated download tends to produce a pile
/// of these, and seeing the pile makes that obvious.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum ParseErr
{
	#[error("line {0}: {1}")]
	Line(u32, anyhow::Error),

	#[error("header: {0}")]
	Header(String),
}


/// Parse a whole manifest out of a byte buffer.
pub(crate) fn parse(buf: &[u8]) -> Result<Manifest, Vec<ParseErr>>
{
	let text = match std::str::from_utf8(buf) {
		Ok(t) => t,
		Err(e) => {
			let pe = ParseErr::Header(format!("not UTF-8: {e}"));
			return Err(vec![pe]);
		},
	};

	let mut lines = text.lines();
	let mut lnum: u32 = 0;
	let mut errs: Vec<ParseErr> = Vec::new();

	// First line carries the format.
	let hdr1 = lines.next().unwrap_or("");
	lnum += 1;
	let format = match hdr1.split_once('\t') {
		Some(("MANIFEST", f)) => match f.trim().parse::<u32>() {
			Ok(f) => f,
			Err(_) => {
				errs.push(ParseErr::Header(
						format!("bad MANIFEST format '{f}'")));
				0
			},
		},
		_ => {
			errs.push(ParseErr::Header(
					"missing MANIFEST keyword".to_string()));
			0
		},
	};

	// The rest of the header block, up to the blank line.
	let mut header = Header { format, ..Default::default() };
	let mut saw_version = false;
	for l in lines.by_ref()
	{
		lnum += 1;
		if l.trim().is_empty() { break; }

		let (key, val) = match l.split_once('\t') {
			Some((k, v)) => (k, v.trim()),
			None => {
				errs.push(ParseErr::Line(lnum,
						anyhow!("malformed header line '{l}'")));
				continue;
			},
		};

		// Unknown keys are skipped; formats grow keys over time and
		// old clients must keep parsing what they do know.
		let num = |what: &str| -> Result<u64, ParseErr> {
			val.parse::<u64>().map_err(|_| ParseErr::Line(lnum,
					anyhow!("bad {what} value '{val}'")))
		};
		match key
		{
			"version:" => match num("version") {
				Ok(v) => { header.version = v as u32; saw_version = true; },
				Err(e) => errs.push(e),
			},
			"previous:" => match num("previous") {
				Ok(v) => header.previous = Some(v as u32),
				Err(e) => errs.push(e),
			},
			"filecount:" => match num("filecount") {
				Ok(v) => header.filecount = v,
				Err(e) => errs.push(e),
			},
			"contentsize:" => match num("contentsize") {
				Ok(v) => header.contentsize = v,
				Err(e) => errs.push(e),
			},
			"minversion:" => match num("minversion") {
				Ok(v) => header.minversion = Some(v as u32),
				Err(e) => errs.push(e),
			},
			"includes:" => header.includes.push(val.to_string()),
			"also-add:" => header.also_add.push(val.to_string()),
			_ => continue,
		}
	}

	if !saw_version
	{
		errs.push(ParseErr::Header("no version: in header".to_string()));
	}

	// Body records
	let mut mf = Manifest { header, ..Default::default() };
	for l in lines
	{
		lnum += 1;
		if l.trim().is_empty() { continue; }

		match l.parse()
		{
			Ok(rec) => mf.files.push(rec),
			Err(e)  => errs.push(ParseErr::Line(lnum, e)),
		}
	}

	match errs.is_empty()
	{
		true => {
			mf.sort_files();
			Ok(mf)
		},
		false => Err(errs),
	}
}


impl FromStr for FileRecord
{
	type Err = anyhow::Error;

	/// One body line: flags, path, last-change, hash.
	fn from_str(l: &str) -> Result<Self, Self::Err>
	{
		let mut fields = l.split('\t');
		let flags = fields.next()
				.ok_or_else(|| anyhow!("empty record line"))?;
		let path = fields.next()
				.ok_or_else(|| anyhow!("record missing path"))?;
		let lc = fields.next()
				.ok_or_else(|| anyhow!("record missing last-change"))?;
		let hash = fields.next()
				.ok_or_else(|| anyhow!("record missing hash"))?;
		if fields.next().is_some()
		{ Err(anyhow!("trailing fields on record line"))? }

		// Flags: exactly 4 chars
		let fc: Vec<char> = flags.chars().collect();
		if fc.len() != 4
		{ Err(anyhow!("bad flags field '{flags}'"))? }

		let kind = match fc[0] {
			'F' => FileKind::File,
			'D' => FileKind::Dir,
			'L' => FileKind::Link,
			'M' => FileKind::Manifest,
			c => Err(anyhow!("unknown type flag '{c}'"))?,
		};
		let state = match fc[1] {
			'.' => Lifecycle::Live,
			'd' => Lifecycle::Deleted,
			'g' => Lifecycle::Ghosted,
			c => Err(anyhow!("unknown lifecycle flag '{c}'"))?,
		};
		let mut flags = Modifier::default();
		match fc[2] {
			'.' => (),
			'C' => flags.config = true,
			's' => flags.state = true,
			'b' => flags.boot = true,
			'o' => flags.orphan = true,
			'e' => flags.experimental = true,
			// mix and exported marks don't drive anything client-side
			'm' | 'x' => (),
			c => Err(anyhow!("unknown modifier flag '{c}'"))?,
		}
		// 4th position is the old rename flag; accepted, unused.

		// Paths: absolute and .-.-free for real files; bundle names
		// for MoM entries.
		match kind
		{
			FileKind::Manifest => {
				if path.is_empty() || path.starts_with('/')
				{ Err(anyhow!("bad bundle name '{path}'"))? }
			},
			_ => {
				if !path.starts_with('/')
				{ Err(anyhow!("relative path '{path}'"))? }
				let dotdot = std::path::Path::new(path).components()
						.any(|c| c == std::path::Component::ParentDir);
				if dotdot
				{ Err(anyhow!("path escape in '{path}'"))? }
			},
		}

		let last_change = lc.parse()
				.map_err(|_| anyhow!("bad last-change '{lc}'"))?;
		let hash = hash.parse()?;

		Ok(FileRecord {
			path: path.into(),
			kind, state, flags, last_change, hash,
		})
	}
}



#[cfg(test)]
mod tests
{
	use super::*;
	use crate::manifest::testutil;

	#[test]
	fn header_and_records()
	{
		let text = testutil::mom_text(100, &[
			("os-core", 10, &testutil::hash('a')),
			("editors", 20, &testutil::hash('b')),
		]);
		let m = parse(text.as_bytes()).unwrap();
		assert_eq!(m.header.format, 1);
		assert_eq!(m.header.version, 100);
		assert_eq!(m.files.len(), 2);
		assert!(m.bundle("editors").is_some());
	}

	#[test]
	fn full_header()
	{
		let text = "MANIFEST\t1\n\
				version:\t30\n\
				previous:\t20\n\
				filecount:\t123\n\
				timestamp:\t1700000000\n\
				contentsize:\t789\n\
				includes:\tos-core\n\
				also-add:\tdev-tools\n\
				minversion:\t10\n\
				\n";
		let m = parse(text.as_bytes()).unwrap();
		assert_eq!(m.header.version, 30);
		assert_eq!(m.header.previous, Some(20));
		assert_eq!(m.header.filecount, 123);
		assert_eq!(m.header.contentsize, 789);
		assert_eq!(m.header.minversion, Some(10));
		assert_eq!(m.header.includes, vec!["os-core"]);
		assert_eq!(m.header.also_add, vec!["dev-tools"]);
		// timestamp: is an unknown key to us; skipped, not fatal
	}

	#[test]
	fn record_flags()
	{
		let h = testutil::hash('1');

		let r: FileRecord = format!("F...\t/usr/bin/vim\t100\t{h}")
				.parse().unwrap();
		assert_eq!(r.kind, FileKind::File);
		assert!(r.is_live());

		let r: FileRecord = format!("Dd..\t/old/dir\t90\t{h}")
				.parse().unwrap();
		assert_eq!(r.kind, FileKind::Dir);
		assert!(r.is_deleted());

		let r: FileRecord = format!("Lg..\t/some/link\t90\t{h}")
				.parse().unwrap();
		assert!(r.is_ghosted());

		let r: FileRecord = format!("F.b.\t/usr/lib/kernel/img\t5\t{h}")
				.parse().unwrap();
		assert!(r.flags.boot);

		let r: FileRecord = format!("F.C.\t/etc/fstab\t5\t{h}")
				.parse().unwrap();
		assert!(r.flags.config);

		let r: FileRecord = format!("M...\tos-core\t10\t{h}")
				.parse().unwrap();
		assert_eq!(r.kind, FileKind::Manifest);
	}

	#[test]
	fn record_rejects()
	{
		let h = testutil::hash('1');

		// relative path
		format!("F...\tusr/bin/vim\t10\t{h}")
				.parse::<FileRecord>().unwrap_err();
		// path escape
		format!("F...\t/usr/../../etc\t10\t{h}")
				.parse::<FileRecord>().unwrap_err();
		// bogus flags
		format!("Z...\t/usr/bin/vim\t10\t{h}")
				.parse::<FileRecord>().unwrap_err();
		format!("F.\t/usr/bin/vim\t10\t{h}")
				.parse::<FileRecord>().unwrap_err();
		// short hash
		"F...\t/usr/bin/vim\t10\tdeadbeef"
				.parse::<FileRecord>().unwrap_err();
		// MoM entry with a path for a name
		format!("M...\t/os-core\t10\t{h}")
				.parse::<FileRecord>().unwrap_err();
	}

	#[test]
	fn missing_bits_are_fatal()
	{
		// No MANIFEST line
		let text = "version:\t10\n\nF...\t/a\t1\tx\n";
		parse(text.as_bytes()).unwrap_err();

		// No version
		let text = "MANIFEST\t1\n\n";
		parse(text.as_bytes()).unwrap_err();

		// Bad records collect errors but don't stop the parse run
		let text = "MANIFEST\t1\nversion:\t10\n\n\
				F...\tbadpath\t1\tffff\n\
				Q...\t/fine\t1\tffff\n";
		let errs = parse(text.as_bytes()).unwrap_err();
		assert_eq!(errs.len(), 2);
	}

	#[test]
	fn body_gets_sorted()
	{
		let h = testutil::hash('2');
		let text = format!("MANIFEST\t1\nversion:\t10\n\n\
				F...\t/zebra\t1\t{h}\n\
				F...\t/apple\t1\t{h}\n");
		let m = parse(text.as_bytes()).unwrap();
		assert_eq!(m.files[0].path, std::path::Path::new("/apple"));
		assert_eq!(m.files[1].path, std::path::Path::new("/zebra"));
	}
}
