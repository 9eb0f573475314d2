//! The lower-level HTTP bits.
use std::path::Path;
use std::time::Duration;

use url::Url;


/// How a single transfer can go wrong.  The retry machinery upstairs
/// keys off these variants, so keep the classification honest.
#[derive(Debug)]
#[derive(thiserror::Error)]
pub(crate) enum FetchErr
{
	/// Server answered with an HTTP error status.  4xx is permanent,
	/// 5xx transient; 404 and 416 get their own variants since
	/// callers care.
	#[error("HTTP status {0}")]
	Status(u16),

	/// Plain old not-there.  Fatal for manifests and fullfiles,
	/// expected for packs that were never generated.
	#[error("not found")]
	NotFound,

	/// Server rejected our resume range; retry without resuming.
	#[error("range not satisfiable")]
	Range,

	/// Transport-level trouble: connect failure, timeout, TLS, stalled
	/// reads.  Worth retrying.
	#[error("transfer error: {0}")]
	Transport(String),

	/// Local disk trouble.  Never retried; the disk won't get better.
	#[error("write error: {0}")]
	Write(#[from] std::io::Error),

	/// URL building error; a config problem really.
	#[error("URL building error: {0}")]
	Url(#[from] url::ParseError),
}

impl FetchErr
{
	/// Is retrying worth anything?
	pub(crate) fn transient(&self) -> bool
	{
		use FetchErr as F;
		match self {
			F::Status(s) => *s >= 500,
			F::Range => true,  // retried with resume off
			F::Transport(_) => true,
			F::NotFound | F::Write(_) | F::Url(_) => false,
		}
	}
}

fn local_path(url: &Url) -> Result<std::path::PathBuf, FetchErr>
{
	url.to_file_path().map_err(|_| FetchErr::Transport(
			format!("unusable file url {url}")))
}


fn classify(e: ureq::Error) -> FetchErr
{
	match e {
		ureq::Error::Status(404, _) => FetchErr::NotFound,
		ureq::Error::Status(416, _) => FetchErr::Range,
		ureq::Error::Status(s, _) => FetchErr::Status(s),
		ureq::Error::Transport(t) => FetchErr::Transport(t.to_string()),
	}
}


/// Creating an Agent for our use.  Centralized so the timeouts and
/// proxy handling live in one place.
///
/// The read timeout doubles as our low-speed floor; ureq can't watch
/// bytes/sec, but a transfer that produces nothing for this long is
/// just as dead.
pub(crate) fn mk_agent(content_url: &Url) -> ureq::Agent
{
	let mut ab = ureq::AgentBuilder::new()
		.timeout_connect(Duration::from_secs(10))
		.timeout_read(Duration::from_secs(30));

	// Proxy env vars, unless the target's excluded by NO_PROXY.
	let host = content_url.host_str().unwrap_or("");
	if !no_proxy_match(host)
	{
		let pvar = match content_url.scheme() {
			"https" => std::env::var("HTTPS_PROXY").ok(),
			_ => std::env::var("HTTP_PROXY").ok(),
		};
		if let Some(p) = pvar
		{
			if let Ok(proxy) = ureq::Proxy::new(&p)
			{ ab = ab.proxy(proxy); }
		}
	}

	ab.build()
}


/// Does NO_PROXY exclude a host?  Comma-separated suffix matches, with
/// "*" meaning everyone.
fn no_proxy_match(host: &str) -> bool
{
	let np = match std::env::var("NO_PROXY") {
		Ok(v) => v,
		Err(_) => return false,
	};
	np.split(',').map(str::trim).any(|pat| {
		!pat.is_empty() && (pat == "*" || host == pat
				|| host.ends_with(&format!(".{}", pat.trim_start_matches('.'))))
	})
}


/// Do a GET and dump the results into a Vec<u8>.
///
/// This is intended as a simple util for fetching "small" files (the
/// version string, format number, signatures) that we're just going to
/// be poking through.  It's not built for fetching big files; that
/// goes through fetch_to_file below.
pub(crate) fn get_bytes(agent: &ureq::Agent, url: &Url)
		-> Result<Vec<u8>, FetchErr>
{
	// Small files to directly poke at, so set a limit big enough to
	// easily fit anything we expect, but not blow out memory if
	// somebody messes with us.
	const LIMIT: u64 = 10 * 1024 * 1024;

	// Local content stores look like any other server, just spelled
	// file://.
	if url.scheme() == "file"
	{
		let p = local_path(url)?;
		return match std::fs::read(&p) {
			Ok(b) => Ok(b),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound =>
				Err(FetchErr::NotFound),
			Err(e) => Err(e.into()),
		};
	}

	let resp = agent.request_url("GET", url).call()
			.map_err(classify)?;

	let clen: Option<usize> = resp.header("Content-Length")
			.and_then(|l| l.parse().ok());
	let mut data: Vec<u8> = match clen {
		Some(b) => Vec::with_capacity(b),
		None    => Vec::new(),
	};

	use std::io::Read;
	resp.into_reader().take(LIMIT).read_to_end(&mut data)?;
	Ok(data)
}


/// GET a URL out to a file, optionally resuming a partial download
/// already sitting at dest.
///
/// Returns the total bytes now on disk.  A failed transfer leaves
/// whatever partial bytes arrived, so a retry can pick up with
/// resume=true.
pub(crate) fn fetch_to_file(agent: &ureq::Agent, url: &Url, dest: &Path,
		resume: bool) -> Result<u64, FetchErr>
{
	use std::{fs, io};

	// Like get_bytes, keep _some_ ceiling so a broken or malicious
	// server can't fill the disk.  Biggest legit fetches are zero
	// packs, which run to a few hundred megs; a couple gigs is
	// generous.
	const LIMIT: u64 = 2 * 1024 * 1024 * 1024;

	// Local content store: hardlink into place (or copy across
	// devices), which gets the identical staged outcome for free.
	if url.scheme() == "file"
	{
		let p = local_path(url)?;
		if !p.is_file() { return Err(FetchErr::NotFound); }
		let _ = fs::remove_file(dest);
		crate::util::fs::link_or_copy(&p, dest)?;
		let md = fs::metadata(dest)?;
		return Ok(md.len());
	}

	// Got a partial already?
	let got: u64 = match resume {
		true => match fs::metadata(dest) {
			Ok(md) => md.len(),
			Err(_) => 0,
		},
		false => 0,
	};

	let req = agent.request_url("GET", url);
	let req = match got > 0 {
		true  => req.set("Range", &format!("bytes={got}-")),
		false => req,
	};
	let resp = req.call().map_err(classify)?;

	// 206 means our range was honored and we append; anything else
	// means we got the whole thing and start over.
	let append = resp.status() == 206 && got > 0;
	let outfh = match append {
		true  => fs::OpenOptions::new().append(true).open(dest)?,
		false => fs::File::create(dest)?,
	};
	let mut outwrite = io::BufWriter::with_capacity(
			crate::util::FILE_BUFSZ, outfh);

	use io::Read;
	let mut rdr = resp.into_reader().take(LIMIT);
	let wrote = io::copy(&mut rdr, &mut outwrite)?;

	let outfh = outwrite.into_inner().map_err(|e| e.into_error())?;
	outfh.sync_all()?;

	let total = match append {
		true  => got + wrote,
		false => wrote,
	};
	Ok(total)
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn transience()
	{
		assert!(FetchErr::Status(500).transient());
		assert!(FetchErr::Status(503).transient());
		assert!(!FetchErr::Status(403).transient());
		assert!(!FetchErr::NotFound.transient());
		assert!(FetchErr::Transport("timed out".into()).transient());

		let werr = std::io::Error::from(std::io::ErrorKind::WriteZero);
		assert!(!FetchErr::Write(werr).transient());
	}

	#[test]
	fn no_proxy()
	{
		// Env fiddling is process-global, so one test owns it.
		std::env::set_var("NO_PROXY", "example.org, .internal.net");
		assert!(no_proxy_match("example.org"));
		assert!(no_proxy_match("foo.internal.net"));
		assert!(!no_proxy_match("example.com"));
		std::env::set_var("NO_PROXY", "*");
		assert!(no_proxy_match("anything.at.all"));
		std::env::remove_var("NO_PROXY");
		assert!(!no_proxy_match("example.org"));
	}
}
