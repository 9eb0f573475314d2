//! Telemetry drop records.
//!
//! We don't talk to any telemetry daemon ourselves; we just drop
//! records into `<state>/telemetry/` and whatever collector the system
//! runs picks them up (or nobody does, and clean sweeps them).  Record
//! files are `<class>.<pid>.<seq>` with a small JSON body.

use std::path::Path;

use serde::Serialize;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Level
{
	Info,
	Warn,
	Crit,
}


#[derive(Debug, Serialize)]
struct Record<'a>
{
	level: Level,
	class: &'a str,
	msg: &'a str,
}


static SEQ: std::sync::atomic::AtomicU32 =
		std::sync::atomic::AtomicU32::new(0);

/// Drop a record.  Failures here are swallowed; telemetry must never
/// make an update worse.
pub(crate) fn record(teldir: &Path, level: Level, class: &str, msg: &str)
{
	use std::sync::atomic::Ordering::Relaxed;

	if !teldir.is_dir() { return; }

	let seq = SEQ.fetch_add(1, Relaxed);
	let name = format!("{}.{}.{}", class, std::process::id(), seq);
	let rec = Record { level, class, msg };
	let body = match serde_json::to_vec(&rec) {
		Ok(b) => b,
		Err(_) => return,
	};
	let _ = crate::util::fs::atomic_write(&teldir.join(name), &body);
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn drops_records()
	{
		let tmp = tempfile::tempdir().unwrap();
		record(tmp.path(), Level::Warn, "packmissing", "url=whatever");

		let ents: Vec<_> = std::fs::read_dir(tmp.path()).unwrap()
				.map(|e| e.unwrap()).collect();
		assert_eq!(ents.len(), 1);
		let body = std::fs::read_to_string(ents[0].path()).unwrap();
		let js: serde_json::Value = serde_json::from_str(&body).unwrap();
		assert_eq!(js["level"], "warn");
		assert_eq!(js["class"], "packmissing");
	}

	#[test]
	fn no_dir_no_cry()
	{
		// Shouldn't panic or create anything
		let p = Path::new("/nonexistent/telemetry/dir");
		record(p, Level::Crit, "x", "y");
	}
}
