//! The aggregate counters every operation reports.
//!
//! One struct, bumped all over the operator layer, summarized in one
//! block at the end.  The "not_" counters are what decide whether an
//! operation gets to call itself a success.

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize)]
pub(crate) struct Counts
{
	pub(crate) checked: u32,
	pub(crate) missing: u32,
	pub(crate) replaced: u32,
	pub(crate) not_replaced: u32,
	pub(crate) mismatch: u32,
	pub(crate) fixed: u32,
	pub(crate) not_fixed: u32,
	pub(crate) extraneous: u32,
	pub(crate) deleted: u32,
	pub(crate) not_deleted: u32,
	pub(crate) picky_extraneous: u32,
}


impl Counts
{
	/// Did everything that needed doing get done?
	pub(crate) fn clean(&self) -> bool
	{
		self.not_fixed == 0 && self.not_replaced == 0
				&& self.not_deleted == 0
	}


	/// The end-of-operation report.  `fixing` says whether this run
	/// was allowed to change anything (fix/install), which decides
	/// which sub-lines mean anything.
	pub(crate) fn report(&self, fixing: bool)
	{
		println!("Inspected {} file{}", self.checked,
				crate::util::plural(self.checked as usize));

		if self.missing > 0
		{
			println!("  {} file{} were missing", self.missing,
					crate::util::plural(self.missing as usize));
			if fixing
			{
				println!("    {} of {} missing files were replaced",
						self.replaced, self.missing);
				println!("    {} of {} missing files were not replaced",
						self.not_replaced, self.missing);
			}
		}

		if self.mismatch > 0
		{
			println!("  {} file{} did not match", self.mismatch,
					crate::util::plural(self.mismatch as usize));
			if fixing
			{
				println!("    {} of {} files were fixed",
						self.fixed, self.mismatch);
				println!("    {} of {} files were not fixed",
						self.not_fixed, self.mismatch);
			}
		}

		if self.extraneous > 0
		{
			println!("  {} file{} found which should be deleted",
					self.extraneous,
					crate::util::plural(self.extraneous as usize));
			if fixing
			{
				println!("    {} of {} files were deleted",
						self.deleted, self.extraneous);
				println!("    {} of {} files were not deleted",
						self.not_deleted, self.extraneous);
			}
		}

		if self.picky_extraneous > 0
		{
			println!("  {} file{} outside any manifest", self.picky_extraneous,
					crate::util::plural(self.picky_extraneous as usize));
		}
	}
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn cleanliness()
	{
		let mut c = Counts::default();
		assert!(c.clean());

		c.mismatch = 3;
		c.fixed = 3;
		assert!(c.clean(), "fixed mismatches are clean");

		c.not_fixed = 1;
		assert!(!c.clean());
	}
}
