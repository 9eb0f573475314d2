//! Progress reporting.
//!
//! The engine narrates what it's doing as a stream of events; what
//! happens to them is the sink's problem.  The human sink prints step
//! lines and runs a byte-progress bar; the JSON sink emits one record
//! per event for tooling to chew on.  Commands pick one up front based
//! on --json-output.

use std::io::Write as _;


/// What the engine reports.
#[derive(Debug, Clone)]
#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Event
{
	/// A named phase began ("Downloading packs", etc.)
	StepStart { step: String },

	/// ...and ended.
	StepEnd { step: String },

	/// Bytes moved within the current step.
	Bytes { current: u64, total: u64 },
}


/// Somewhere for events to go.
pub(crate) trait Sink
{
	fn event(&mut self, ev: &Event);

	/// A free-form informational line.  Mostly phase summaries.
	fn info(&mut self, msg: &str);
}


/// The human-facing sink: step prints and a progress bar.
pub(crate) struct Human
{
	bar: Option<indicatif::ProgressBar>,
}

impl Human
{
	pub(crate) fn new() -> Self
	{
		Self { bar: None }
	}
}

impl Sink for Human
{
	fn event(&mut self, ev: &Event)
	{
		use Event as E;
		match ev
		{
			E::StepStart { step } => {
				println!("{step}...");
			},
			E::StepEnd { .. } => {
				if let Some(pb) = self.bar.take() { pb.finish_and_clear(); }
			},
			E::Bytes { current, total } => {
				let pb = self.bar.get_or_insert_with(|| {
					indicatif::ProgressBar::new(*total)
				});
				pb.set_length(*total);
				pb.set_position(*current);
			},
		}
	}

	fn info(&mut self, msg: &str)
	{
		println!("{msg}");
	}
}


/// The machine-facing sink: one JSON object per line on stdout.
pub(crate) struct Json;

impl Sink for Json
{
	fn event(&mut self, ev: &Event)
	{
		// If stdout's gone there's nobody to tell anyway.
		let mut so = std::io::stdout();
		if let Ok(js) = serde_json::to_string(ev)
		{
			let _ = writeln!(so, "{js}");
		}
	}

	fn info(&mut self, msg: &str)
	{
		let mut so = std::io::stdout();
		let js = serde_json::json!({ "type": "info", "msg": msg });
		let _ = writeln!(so, "{js}");
	}
}


/// Build the right sink for the args.
pub(crate) fn sink_for(json: bool) -> Box<dyn Sink>
{
	match json {
		true  => Box::new(Json),
		false => Box::new(Human::new()),
	}
}
