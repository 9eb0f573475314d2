//! Genericized threadpool.  This gets used to set up specialized pools
//! for the parallel work we do: HTTP fetches, delta application, and
//! hashing trees of files for verify.


/// Parallel downloading
pub(crate) mod fetch;

/// Delta application
pub(crate) mod delta;

/// On-disk hash scanning
pub(crate) mod scan;


// Settings for parallelism level.  Really, this is command-line stuff,
// but pool setup is usually a long way removed from having that, so we
// stash the two numbers globally.  Rust doesn't love that for mostly
// good reasons, but atomics of little numbers are fine.
use std::sync::atomic::{AtomicU32, Ordering};

/// How many concurrent transfers for network workloads.  This is the
/// spec'd max_xfer; enqueueing blocks once this many are in flight.
static JOBS_NET: AtomicU32 = AtomicU32::new(4);

/// How many threads for CPU-bound work (hashing, patching).
static JOBS_CPU: AtomicU32 = AtomicU32::new(4);

/// Read the network job limit
pub(crate) fn jobs_net() -> u32 { JOBS_NET.load(Ordering::Relaxed) }
/// Read the CPU job limit
pub(crate) fn jobs_cpu() -> u32 { JOBS_CPU.load(Ordering::Relaxed) }


/// Initialize parallelism levels, once, up front.
///
/// Network default is 4: enough to hide latency without leaning on the
/// mirrors.  CPU default is the core count capped at 6, because
/// hashing a whole /usr goes plenty fast by then and the machine
/// should stay usable.
pub(crate) fn init_jobs(net: &Option<u32>, cpu: &Option<u32>)
{
	let newnet = net.unwrap_or(4);
	let newcpu = match cpu {
		Some(c) => *c,
		None => {
			let def: std::num::NonZeroUsize = 1.try_into().unwrap();
			let def: Result<_, std::io::Error> = Ok(def);
			let mut ncpu = std::thread::available_parallelism().or(def)
					.unwrap().get().try_into().unwrap();
			if ncpu > 6 { ncpu = 6; }
			ncpu
		},
	};

	// Guard against somebody setting 0
	if newnet < 1 { panic!("{newnet} network transfers is insane."); }
	if newcpu < 1 { panic!("{newcpu} cpu threads is insane."); }

	JOBS_NET.store(newnet, Ordering::Relaxed);
	JOBS_CPU.store(newcpu, Ordering::Relaxed);
}




/// The overarching trait that implements pools.  Individual users
/// define the types for their case and fill in the functions that do
/// the varying steps of the process.
pub(crate) trait Pool: Sized
{
	/// The finalized return.  May be as simple as a Vec of results,
	/// but usually gets some post-processing in finalize().
	type PoolResult;

	/// General data the pool needs in a particular instance: the HTTP
	/// fetcher needs the agent and URLs, the scanner needs the basedir
	/// the paths are under.  Each worker gets one made from this via
	/// mk_unitcontrol().
	type Control;

	/// The per-worker copy of the control data.  In practice it's been
	/// the same struct every time, made by .clone().
	type UnitControl: Send;

	/// Make a worker's UnitControl from the Control.
	fn mk_unitcontrol(ctrl: &Self::Control) -> Self::UnitControl;


	/// A single unit of work.
	type WorkRequest: Send + Sync + 'static;
	/// What a worker hands back for a successful unit.
	type WorkResult: Send;
	/// Or for a failed one.
	type WorkErr: Send;

	/// Process one request.  Runs on a worker thread; gets the
	/// UnitControl for context and one WorkRequest to chew on.
	fn work(ctrl: &Self::UnitControl, req: Self::WorkRequest)
			-> Result<Self::WorkResult, Self::WorkErr>;


	/// Aggregate one worker return.  Runs on the driving thread as
	/// results come in, so it sees Ok/Err in completion order.
	fn work_result(&mut self, resp: Result<Self::WorkResult, Self::WorkErr>);


	/// Called after every request has been worked and aggregated, and
	/// the threads have spun down; crafts the PoolResult.
	fn finalize(self) -> Self::PoolResult;


	/// How many threads to spin off.  Impls are expected to wrap
	/// jobs_net() or jobs_cpu() as appropriate, unless they really
	/// know better.
	fn nthreads(&self) -> u32 { 4 }


	/// How much work to let queue up beyond what's running.  The
	/// fetch pool keeps this at zero so "enqueue" genuinely blocks at
	/// the in-flight ceiling; CPU pools can leave the default slack.
	fn queue_slack(&self) -> u32 { 64 }


	/// The main runner, tying the pieces together.  An error return
	/// from here is only an error in the machinery; individual unit
	/// failures travel through work_result() into the PoolResult.
	fn run(mut self, ctrl: &Self::Control, items: Vec<Self::WorkRequest>)
			-> Result<Self::PoolResult, anyhow::Error>
	{
		// Spawn off a thread scope for all the fun details
		std::thread::scope(|s|
				-> Result<Self::PoolResult, anyhow::Error> {

			// Prep channels for passing requests and results around.
			// The request channel is bounded: nthreads+slack pending
			// items is where the feeding loop blocks, which is what
			// bounds our in-flight work.
			use crossbeam::channel;
			let nthr = self.nthreads();
			if nthr == 0 { panic!("nthreads {nthr} is insane"); }
			let cap = (nthr + self.queue_slack()) as usize;
			let (req_snd, req_rcv) = channel::bounded(cap);
			let (res_snd, res_rcv) = channel::unbounded();

			// Spawn off the threadpool
			for _ in 1..=nthr
			{
				let uctrl = Self::mk_unitcontrol(&ctrl);
				let reqs = req_rcv.clone();
				let ress = res_snd.clone();
				s.spawn(move || {
					// Loop over requests until we run out
					while let Ok(req) = reqs.recv()
					{
						let res = Self::work(&uctrl, req);
						// Should be impossible for send to fail; that'd
						// only happen if the response channel were
						// closed
						ress.send(res)
								.expect("Response channel shouldn't be closed");
					}

					// Falls off the end when the reqs channel closes,
					// which means every piece of work has been handed
					// out.
				});
			}

			// Only refs to these channels should be down in the
			// workers now.
			drop(req_rcv);
			drop(res_snd);

			// Feed in the work items, draining results as they show
			// up so the result channel never backs up while we block
			// on a full request queue.
			for i in items.into_iter()
			{
				let mut item = Some(i);
				while let Some(it) = item.take()
				{
					use channel::TrySendError as TSE;
					match req_snd.try_send(it) {
						Ok(_) => (),
						Err(TSE::Full(back)) => {
							// Queue's at the ceiling; soak up a result
							// (blocking), then retry the same item.
							item = Some(back);
							if let Ok(resp) = res_rcv.recv()
							{ self.work_result(resp); }
						},
						Err(TSE::Disconnected(_)) =>
							anyhow::bail!("workers all died"),
					}
				}
			}

			// All the work is handed out; close our send side so the
			// workers fall out of their receive loops as they finish.
			drop(req_snd);

			// And drain the rest of the results.
			while let Ok(resp) = res_rcv.recv()
			{
				self.work_result(resp);
			}

			// Call the finalizer, and that's what we give back.
			let ret = self.finalize();
			Ok(ret)
		})
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	/// A trivial pool that doubles numbers, erroring on odd ones.
	struct Doubler
	{
		oks: Vec<u64>,
		errs: u32,
	}

	impl Pool for Doubler
	{
		type PoolResult = (Vec<u64>, u32);
		type Control = ();
		type UnitControl = ();
		fn mk_unitcontrol(_c: &()) -> () { () }

		type WorkRequest = u64;
		type WorkResult = u64;
		type WorkErr = u64;
		fn work(_c: &(), req: u64) -> Result<u64, u64>
		{
			match req % 2 {
				0 => Ok(req * 2),
				_ => Err(req),
			}
		}

		fn nthreads(&self) -> u32 { 3 }

		fn work_result(&mut self, resp: Result<u64, u64>)
		{
			match resp {
				Ok(v) => self.oks.push(v),
				Err(_) => self.errs += 1,
			}
		}

		fn finalize(mut self) -> Self::PoolResult
		{
			self.oks.sort_unstable();
			(self.oks, self.errs)
		}
	}

	#[test]
	fn doubling()
	{
		let p = Doubler { oks: Vec::new(), errs: 0 };
		let reqs: Vec<u64> = (0..100).collect();
		let (oks, errs) = p.run(&(), reqs).unwrap();

		assert_eq!(errs, 50);
		assert_eq!(oks.len(), 50);
		assert_eq!(oks[0], 0);
		assert_eq!(oks[49], 196);
	}

	#[test]
	fn bounded_queue_still_finishes()
	{
		// More items than capacity; the try_send/drain dance has to
		// cycle plenty of times.
		struct Tiny { n: u64 }
		impl Pool for Tiny
		{
			type PoolResult = u64;
			type Control = ();
			type UnitControl = ();
			fn mk_unitcontrol(_c: &()) -> () { () }
			type WorkRequest = u64;
			type WorkResult = u64;
			type WorkErr = std::convert::Infallible;
			fn work(_c: &(), req: u64)
					-> Result<u64, std::convert::Infallible>
			{ Ok(req) }
			fn nthreads(&self) -> u32 { 2 }
			fn queue_slack(&self) -> u32 { 0 }
			fn work_result(&mut self,
					r: Result<u64, std::convert::Infallible>)
			{ self.n += r.unwrap(); }
			fn finalize(self) -> u64 { self.n }
		}

		let total = Tiny { n: 0 }.run(&(), (1..=500).collect()).unwrap();
		assert_eq!(total, 125250);
	}
}
