//! Parallel download driving.
//!
//! The Fetch pool itself is a thin Pool impl: N workers each running
//! one blocking transfer, with the bounded request channel keeping at
//! most max_xfer in flight.  The Fetcher wrapper on top owns the
//! protocol-y behavior: dedup by hash key, per-item completion
//! callbacks on the driving thread (that's our single "post-download
//! worker" -- tar extraction isn't something we want N of anyway),
//! retry rounds with exponential backoff, resume handling including
//! the 416 opt-out, and the drop to serial once a round has seen
//! failures.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use url::Url;

use crate::server::FetchErr;


/// Ceiling for the backoff delay, seconds.
const MAX_DELAY: u64 = 60;


/// A single transfer request.
#[derive(Debug, Clone)]
pub(crate) struct Req
{
	/// Where from
	pub(crate) url: Url,

	/// Where to
	pub(crate) dest: PathBuf,

	/// Dedup key; transfers sharing one are enqueued at most once.
	/// Usually the content hash, sometimes a synthesized name.
	pub(crate) key: String,
}

/// A completed transfer.  Carries the url along so a postprocess
/// failure can turn straight back into a Req.
#[derive(Debug)]
pub(crate) struct Res
{
	pub(crate) key: String,
	pub(crate) dest: PathBuf,
	pub(crate) url: Url,
}

/// A transfer that's out of chances.
#[derive(Debug)]
pub(crate) struct Failed
{
	pub(crate) req: Req,
	pub(crate) err: FetchErr,
}


/// Control for the fetch pool workers.
#[derive(Clone)]
pub(crate) struct Control
{
	pub(crate) agent: ureq::Agent,

	/// Try Range-resuming partials this round
	pub(crate) resume: bool,

	/// Cooperative cancel: pending work returns immediately.
	pub(crate) cancel: Arc<AtomicBool>,
}


/// The pool state for one round of transfers.
struct Fetch
{
	pb: indicatif::ProgressBar,
	nthreads: u32,
	oks: Vec<Res>,
	errs: Vec<Failed>,
}

impl crate::core::pool::Pool for Fetch
{
	type Control = Control;
	type UnitControl = Control;
	fn mk_unitcontrol(c: &Control) -> Control { c.clone() }

	type PoolResult = (Vec<Res>, Vec<Failed>);

	type WorkRequest = Req;
	type WorkResult  = Res;
	type WorkErr     = Failed;
	fn work(ctrl: &Control, req: Req) -> Result<Res, Failed>
	{
		if ctrl.cancel.load(Ordering::Relaxed)
		{
			let err = FetchErr::Transport("cancelled".to_string());
			return Err(Failed { req, err });
		}

		use crate::server::http;
		match http::fetch_to_file(&ctrl.agent, &req.url, &req.dest,
				ctrl.resume)
		{
			Ok(_bytes) => Ok(Res {
				key: req.key, dest: req.dest, url: req.url,
			}),
			Err(err) => {
				// A failed fresh start leaves nothing worth keeping;
				// a failed resume keeps its partial for next round.
				if !ctrl.resume { let _ = std::fs::remove_file(&req.dest); }
				Err(Failed { req, err })
			},
		}
	}

	fn nthreads(&self) -> u32 { self.nthreads }

	// Zero slack: with the workers all busy, enqueue blocks.  That's
	// the in-flight ceiling the resource model promises.
	fn queue_slack(&self) -> u32 { 0 }

	fn work_result(&mut self, resp: Result<Res, Failed>)
	{
		self.pb.inc(1);
		match resp
		{
			Ok(r)  => self.oks.push(r),
			Err(e) => self.errs.push(e),
		}
	}

	fn finalize(self) -> Self::PoolResult
	{
		self.pb.finish_and_clear();
		(self.oks, self.errs)
	}
}



/// The outer driver.
pub(crate) struct Fetcher<'cb>
{
	agent: ureq::Agent,
	max_retries: u32,
	retry_delay: u64,

	reqs: Vec<Req>,
	seen: HashSet<String>,

	cancel: Arc<AtomicBool>,

	/// Per-success callback, run on the driving thread as transfers
	/// complete.  Returning false marks the item failed (e.g. the
	/// downloaded tarball didn't extract), which queues it for retry
	/// like a transport error would.
	on_done: Option<Box<dyn FnMut(&Res) -> bool + 'cb>>,
}


/// What came of the whole run.
#[derive(Debug, Default)]
pub(crate) struct Summary
{
	pub(crate) ok: Vec<Res>,
	pub(crate) failed: Vec<Failed>,
}


impl<'cb> Fetcher<'cb>
{
	pub(crate) fn new(agent: &ureq::Agent, max_retries: u32,
			retry_delay: u32) -> Self
	{
		Fetcher {
			agent: agent.clone(),
			max_retries,
			retry_delay: retry_delay.into(),
			reqs: Vec::new(),
			seen: HashSet::new(),
			cancel: Arc::new(AtomicBool::new(false)),
			on_done: None,
		}
	}


	/// Completion callback; see the field docs.
	pub(crate) fn on_done(&mut self,
			cb: impl FnMut(&Res) -> bool + 'cb)
	{
		self.on_done = Some(Box::new(cb));
	}


	/// A handle that makes some later enqueue-er able to cancel us
	/// cooperatively: pending transfers get dropped, in-flight ones
	/// finish and are discarded by the caller.
	pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool>
	{
		self.cancel.clone()
	}


	/// Queue a transfer.  Duplicate keys collapse to one transfer.
	pub(crate) fn enqueue(&mut self, url: Url, dest: PathBuf, key: String)
	{
		if !self.seen.insert(key.clone()) { return; }
		self.reqs.push(Req { url, dest, key });
	}

	pub(crate) fn len(&self) -> usize { self.reqs.len() }


	/// Run everything to completion (or exhaustion).
	///
	/// Round zero goes wide at jobs_net().  Anything transient that
	/// failed gets retried after a backoff sleep -- serially, since a
	/// connection that's dropping transfers isn't going to be helped
	/// by hammering it in parallel.  Resume is attempted on retries
	/// until any server answers 416, which turns it off for the rest
	/// of this Fetcher's life.
	pub(crate) fn run(mut self) -> Summary
	{
		let mut summary = Summary::default();
		let mut todo = std::mem::take(&mut self.reqs);
		let mut delay = self.retry_delay;
		let mut resume_ok = true;
		let mut round: u32 = 0;

		while !todo.is_empty()
		{
			let serial = round > 0;
			let nthreads = match serial {
				true  => 1,
				false => crate::core::pool::jobs_net(),
			};

			let ctrl = Control {
				agent: self.agent.clone(),
				resume: round > 0 && resume_ok,
				cancel: self.cancel.clone(),
			};
			let pool = Fetch {
				pb: indicatif::ProgressBar::new(todo.len() as u64),
				nthreads,
				oks: Vec::with_capacity(todo.len()),
				errs: Vec::new(),
			};

			use crate::core::pool::Pool as _;
			let (oks, errs) = match pool.run(&ctrl, todo) {
				Ok(r) => r,
				Err(e) => {
					// Machinery failure; call the whole rest failed.
					eprintln!("Download pool fell over: {e}");
					break;
				},
			};

			// Completion processing on this thread, one at a time.
			let mut retry: Vec<Req> = Vec::new();
			for r in oks
			{
				let good = match &mut self.on_done {
					Some(cb) => cb(&r),
					None => true,
				};
				match good {
					true => summary.ok.push(r),
					false => {
						// Postprocess failed; the bytes are suspect,
						// so scrap and refetch.
						let _ = std::fs::remove_file(&r.dest);
						retry.push(Req {
							url: r.url.clone(),
							dest: r.dest.clone(),
							key: r.key.clone(),
						});
					},
				}
			}

			// Sort the failures into retryable and done-for.
			for f in errs
			{
				if matches!(f.err, FetchErr::Range) { resume_ok = false; }
				let retryable = f.err.transient()
						&& round < self.max_retries
						&& !self.cancel.load(Ordering::Relaxed);
				match retryable {
					true  => retry.push(f.req),
					false => summary.failed.push(f),
				}
			}

			todo = retry;
			if todo.is_empty() || self.cancel.load(Ordering::Relaxed)
			{
				// Cancelled leftovers count as failed.
				for req in todo.drain(..)
				{
					let err = FetchErr::Transport("cancelled".to_string());
					summary.failed.push(Failed { req, err });
				}
				break;
			}

			round += 1;
			if round > self.max_retries
			{
				for req in todo.drain(..)
				{
					let err = FetchErr::Transport(
							"retries exhausted".to_string());
					summary.failed.push(Failed { req, err });
				}
				break;
			}

			println!("Download retry #{round} for {} file{}, waiting \
					{delay}s...", todo.len(),
					crate::util::plural(todo.len()));
			std::thread::sleep(std::time::Duration::from_secs(delay));
			delay = std::cmp::min(delay * 2, MAX_DELAY);
		}

		summary
	}
}


#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn dedup_by_key()
	{
		let agent = ureq::AgentBuilder::new().build();
		let mut f = Fetcher::new(&agent, 0, 1);
		let u: Url = "https://example.invalid/f/aa.tar".parse().unwrap();
		f.enqueue(u.clone(), "/tmp/x".into(), "aa".to_string());
		f.enqueue(u.clone(), "/tmp/y".into(), "aa".to_string());
		f.enqueue(u, "/tmp/z".into(), "bb".to_string());
		assert_eq!(f.len(), 2);
	}

	#[test]
	fn failures_reported()
	{
		// .invalid never resolves, so these fail at the transport
		// layer without touching a network.
		let agent = ureq::AgentBuilder::new().build();
		let tmp = tempfile::tempdir().unwrap();

		let mut f = Fetcher::new(&agent, 0, 1);
		let u: Url = "https://example.invalid/f/aa.tar".parse().unwrap();
		f.enqueue(u, tmp.path().join("aa.tar"), "aa".to_string());

		let sum = f.run();
		assert!(sum.ok.is_empty());
		assert_eq!(sum.failed.len(), 1);
		assert!(sum.failed[0].err.transient());
	}

	#[test]
	fn cancel_drops_pending()
	{
		let agent = ureq::AgentBuilder::new().build();
		let tmp = tempfile::tempdir().unwrap();

		let mut f = Fetcher::new(&agent, 3, 1);
		let u: Url = "https://example.invalid/f/aa.tar".parse().unwrap();
		f.enqueue(u, tmp.path().join("aa.tar"), "aa".to_string());

		// Pre-cancelled: no retries should happen, and the item comes
		// back failed rather than hanging through backoff sleeps.
		f.cancel_flag().store(true, Ordering::Relaxed);
		let sum = f.run();
		assert_eq!(sum.failed.len(), 1);
	}
}
