//! clr-rustdate: the binary shim.  All the meat is in the lib.
use std::process::ExitCode;


fn main() -> ExitCode
{
	let clargs = clr_rustdate::command::parse();
	clr_rustdate::command::run(clargs)
}
