//! The errors commands finish with.
//!
//! Unlike most internal errors, these numbers are a stable public
//! interface; scripts switch on them.  Every command runner funnels
//! down to one of these, and the dispatch layer turns it into the
//! process exit code.  Add new kinds at the end, never renumber.

use thiserror::Error;


#[derive(Debug)]
#[derive(Error)]
pub enum UpdaterErr
{
	/// The "no" answer: no update available, autoupdate disabled,
	/// queried property absent.  Not really an error, but scripts want
	/// to distinguish it from success.
	#[error("{0}")]
	No(String),

	#[error("bundle is required by others: {0}")]
	RequiredBundle(String),

	#[error("invalid bundle: {0}")]
	InvalidBundle(String),

	#[error("cannot load MoM: {0}")]
	LoadMom(String),

	#[error("cannot remove file: {0}")]
	RemoveFile(String),

	#[error("cannot rename directory: {0}")]
	RenameDir(String),

	#[error("cannot create file: {0}")]
	CreateFile(String),

	#[error("error recursing manifests: {0}")]
	RecurseManifest(String),

	#[error("cannot take the update lock: {0}")]
	Lock(String),

	#[error("cannot rename file: {0}")]
	RenameFile(String),

	#[error("cannot initialize network agent: {0}")]
	NetworkInit(String),

	#[error("bundle not tracked: {0}")]
	NotTracked(String),

	#[error("cannot load manifest: {0}")]
	LoadManifest(String),

	#[error("invalid option: {0}")]
	InvalidOption(String),

	#[error("cannot reach update server: {0}")]
	ServerConnection(String),

	#[error("file download failed: {0}")]
	Download(String),

	#[error("cannot extract archive: {0}")]
	Untar(String),

	#[error("cannot create directory: {0}")]
	CreateDir(String),

	#[error("cannot determine current OS version")]
	CurrentVersionUnknown,

	#[error("signature verification failed: {0}")]
	Signature(String),

	#[error("system time is wrong: {0}")]
	BadTime(String),

	#[error("pack download failed: {0}")]
	PackDownload(String),

	#[error("bad certificate: {0}")]
	BadCert(String),

	#[error("insufficient disk space: {0}")]
	DiskSpace(String),

	#[error("path not found in any manifest: {0}")]
	PathNotInManifest(String),

	#[error("unexpected condition: {0}")]
	Unexpected(String),

	#[error("subprocess failed: {0}")]
	Subprocess(String),

	#[error("cannot list directory: {0}")]
	ListDir(String),

	#[error("cannot compute hash: {0}")]
	ComputeHash(String),

	#[error("cannot read system time")]
	TimeUnknown,

	#[error("cannot write file: {0}")]
	WriteFile(String),

	#[error("verify could not fix all issues")]
	VerifyFailed,

	#[error("invalid binary: {0}")]
	InvalidBinary(String),

	#[error("invalid repository: {0}")]
	InvalidRepository(String),

	#[error("invalid file: {0}")]
	InvalidFile(String),
}


impl UpdaterErr
{
	/// The stable exit code.
	pub fn code(&self) -> u8
	{
		use UpdaterErr as E;
		match self
		{
			E::No(_)                => 1,
			E::RequiredBundle(_)    => 2,
			E::InvalidBundle(_)     => 3,
			E::LoadMom(_)           => 4,
			E::RemoveFile(_)        => 5,
			E::RenameDir(_)         => 6,
			E::CreateFile(_)        => 7,
			E::RecurseManifest(_)   => 8,
			E::Lock(_)              => 9,
			E::RenameFile(_)        => 10,
			E::NetworkInit(_)       => 12,
			E::NotTracked(_)        => 13,
			E::LoadManifest(_)      => 14,
			E::InvalidOption(_)     => 15,
			E::ServerConnection(_)  => 16,
			E::Download(_)          => 17,
			E::Untar(_)             => 18,
			E::CreateDir(_)         => 19,
			E::CurrentVersionUnknown => 20,
			E::Signature(_)         => 21,
			E::BadTime(_)           => 22,
			E::PackDownload(_)      => 23,
			E::BadCert(_)           => 24,
			E::DiskSpace(_)         => 25,
			E::PathNotInManifest(_) => 26,
			E::Unexpected(_)        => 27,
			E::Subprocess(_)        => 28,
			E::ListDir(_)           => 29,
			E::ComputeHash(_)       => 30,
			E::TimeUnknown          => 31,
			E::WriteFile(_)         => 32,
			E::VerifyFailed         => 35,
			E::InvalidBinary(_)     => 36,
			E::InvalidRepository(_) => 37,
			E::InvalidFile(_)       => 38,
		}
	}
}


// anyhow errors out of lower layers that never got classified are, by
// definition, unexpected conditions.
impl From<anyhow::Error> for UpdaterErr
{
	fn from(e: anyhow::Error) -> Self
	{
		Self::Unexpected(format!("{e:#}"))
	}
}


#[cfg(test)]
mod tests
{
	use super::UpdaterErr as E;

	#[test]
	fn codes_are_stable()
	{
		// Spot checks against the published table; these can never
		// change.
		assert_eq!(E::No("".into()).code(), 1);
		assert_eq!(E::RequiredBundle("".into()).code(), 2);
		assert_eq!(E::InvalidBundle("".into()).code(), 3);
		assert_eq!(E::LoadMom("".into()).code(), 4);
		assert_eq!(E::Lock("".into()).code(), 9);
		assert_eq!(E::NetworkInit("".into()).code(), 12);
		assert_eq!(E::LoadManifest("".into()).code(), 14);
		assert_eq!(E::ServerConnection("".into()).code(), 16);
		assert_eq!(E::Download("".into()).code(), 17);
		assert_eq!(E::Untar("".into()).code(), 18);
		assert_eq!(E::CurrentVersionUnknown.code(), 20);
		assert_eq!(E::Signature("".into()).code(), 21);
		assert_eq!(E::PackDownload("".into()).code(), 23);
		assert_eq!(E::ComputeHash("".into()).code(), 30);
		assert_eq!(E::VerifyFailed.code(), 35);
		assert_eq!(E::InvalidFile("".into()).code(), 38);
	}
}
