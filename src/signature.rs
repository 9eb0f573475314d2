//! Signature checking for the things the server signs.
//!
//! The MoM and the latest-version endpoint come with detached PKCS#7
//! signatures made against one pinned certificate.  There's no chain
//! walking: the trust store contains exactly that cert (and nothing
//! the system trusts otherwise), so either the blob was signed by the
//! key we were built to trust, or it wasn't.  If a `<cert>.alt` file
//! sits next to the pinned cert, a failed verification gets one retry
//! against it; that's the escape hatch for key rollover.

use std::path::{Path, PathBuf};

use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::X509;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;

use thiserror::Error;


#[derive(Debug)]
#[derive(Error)]
pub(crate) enum SigErr
{
	#[error("cannot read certificate {0}: {1}")]
	CertRead(PathBuf, std::io::Error),

	#[error("cannot parse certificate {0}: {1}")]
	CertParse(PathBuf, openssl::error::ErrorStack),

	#[error("certificate {path} not valid now (notBefore {not_before}, \
			notAfter {not_after})")]
	CertExpired { path: PathBuf, not_before: String, not_after: String },

	#[error("certificate {0} is revoked by the CRL")]
	CertRevoked(PathBuf),

	#[error("cannot read CRL {0}: {1}")]
	CrlRead(PathBuf, std::io::Error),

	#[error("OpenSSL error: {0}")]
	OpenSSL(#[from] openssl::error::ErrorStack),
}


/// Verification knobs, per call site.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct VerifyFlags
{
	/// Don't care about cert validity times.  Used on the
	/// latest-version check, since a wrong clock mustn't brick
	/// updating.
	pub(crate) ignore_expiration: bool,

	/// Grumble to stderr about why a verification failed.
	pub(crate) print_errors: bool,
}


/// One loaded trust anchor: the store built around it, plus where it
/// came from for error chat.
struct Anchor
{
	path: PathBuf,
	store: X509Store,
	certs: Stack<X509>,
}


/// The verifier.  Build one per operation; it's read-only after init.
pub(crate) struct Verifier
{
	primary: Anchor,
	alt: Option<Anchor>,
}

// openssl's X509Store/Stack types don't implement Debug, so this can't
// be derived; it exists only so `Result<Verifier, _>::unwrap_err()`
// type-checks in tests.
impl std::fmt::Debug for Verifier
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("Verifier").finish_non_exhaustive()
	}
}


impl Verifier
{
	/// Load up the pinned cert (and the alternate, and CRL, if given)
	/// into verify-ready form.
	///
	/// Time validity is checked here so the caller can distinguish
	/// "expired" (code: bad system time, maybe) from "garbage".
	/// Unknown critical extensions (e.g. a critical AIA demanding
	/// OCSP, which we don't do) make OpenSSL reject the cert at
	/// verify time on its own.  The alt cert is best-effort: present
	/// and loadable, or ignored.
	pub(crate) fn init(cert_path: &Path, alt_path: Option<&Path>,
			crl_path: Option<&Path>, timecheck: bool)
			-> Result<Self, SigErr>
	{
		let primary = mk_anchor(cert_path, crl_path, timecheck)?;

		let alt = match alt_path {
			Some(ap) if ap.is_file() =>
				mk_anchor(ap, crl_path, timecheck).ok(),
			_ => None,
		};

		Ok(Verifier { primary, alt })
	}


	/// Verify a detached signature over a data blob.  Primary cert
	/// first; one retry against the alt if that fails.
	pub(crate) fn verify_detached(&self, data: &[u8], sig: &[u8],
			flags: VerifyFlags) -> bool
	{
		if verify_one(&self.primary, data, sig, flags)
		{ return true; }

		if let Some(alt) = &self.alt
		{
			if flags.print_errors
			{ eprintln!("Retrying signature against {}", alt.path.display()); }
			if verify_one(alt, data, sig, flags)
			{ return true; }
		}

		false
	}
}


fn mk_anchor(cert_path: &Path, crl_path: Option<&Path>, timecheck: bool)
		-> Result<Anchor, SigErr>
{
	use SigErr as SE;

	let pem = std::fs::read(cert_path)
			.map_err(|e| SE::CertRead(cert_path.to_path_buf(), e))?;
	let cert = X509::from_pem(&pem)
			.map_err(|e| SE::CertParse(cert_path.to_path_buf(), e))?;

	// Explicit validity-window check, so the error can say so.
	if timecheck
	{
		let now = openssl::asn1::Asn1Time::days_from_now(0)?;
		let nb = cert.not_before();
		let na = cert.not_after();
		let early = nb.compare(&now)? == std::cmp::Ordering::Greater;
		let late = na.compare(&now)? == std::cmp::Ordering::Less;
		if early || late
		{
			return Err(SE::CertExpired {
				path: cert_path.to_path_buf(),
				not_before: nb.to_string(),
				not_after: na.to_string(),
			});
		}
	}

	// CRL handling: with exactly one pinned cert in play, "is the
	// cert on the list" is the entire check, so do it directly
	// rather than wiring lookups into the store.
	if let Some(crl) = crl_path
	{
		let crlpem = std::fs::read(crl)
				.map_err(|e| SE::CrlRead(crl.to_path_buf(), e))?;
		let crl = openssl::x509::X509Crl::from_pem(&crlpem)?;
		use openssl::x509::CrlStatus;
		if let CrlStatus::Revoked(_) = crl.get_by_cert(&cert)
		{
			return Err(SE::CertRevoked(cert_path.to_path_buf()));
		}
	}

	let mut sb = X509StoreBuilder::new()?;
	sb.add_cert(cert.clone())?;

	let mut vflags = X509VerifyFlags::empty();
	if !timecheck { vflags |= X509VerifyFlags::NO_CHECK_TIME; }
	sb.set_flags(vflags)?;

	let store = sb.build();
	let mut certs = Stack::new()?;
	certs.push(cert)?;

	Ok(Anchor { path: cert_path.to_path_buf(), store, certs })
}


fn verify_one(anchor: &Anchor, data: &[u8], sig: &[u8], flags: VerifyFlags)
		-> bool
{
	// Signatures come as raw DER; some tooling PEM-wraps them, so try
	// both before deciding it's junk.
	let p7 = match Pkcs7::from_der(sig).or_else(|_| Pkcs7::from_pem(sig)) {
		Ok(p) => p,
		Err(e) => {
			if flags.print_errors
			{ eprintln!("Unparseable signature: {e}"); }
			return false;
		},
	};

	// NOINTERN + the explicit cert stack pins which signer cert is
	// considered; NOCHAIN stops the sig's embedded certs acting as
	// intermediates.
	let mut p7f = Pkcs7Flags::BINARY | Pkcs7Flags::NOINTERN
			| Pkcs7Flags::NOCHAIN;
	if flags.ignore_expiration
	{
		// Pkcs7 verify consults the store's own flags; NO_CHECK_TIME
		// there would be stickier than we want, so skip straight to
		// signature-only checking for this call.
		p7f |= Pkcs7Flags::NOVERIFY;
	}

	let ret = p7.verify(&anchor.certs, &anchor.store, Some(data),
			None, p7f);
	match ret {
		Ok(_) => true,
		Err(e) => {
			if flags.print_errors
			{
				eprintln!("Signature verification against {} failed: {e}",
						anchor.path.display());
			}
			false
		},
	}
}


#[cfg(test)]
mod tests
{
	use super::*;
	use openssl::hash::MessageDigest;
	use openssl::pkey::PKey;
	use openssl::rsa::Rsa;
	use openssl::x509::X509NameBuilder;

	/// Gin up a self-signed cert + key for testing.
	fn mk_cert() -> (X509, PKey<openssl::pkey::Private>)
	{
		let rsa = Rsa::generate(2048).unwrap();
		let pkey = PKey::from_rsa(rsa).unwrap();

		let mut name = X509NameBuilder::new().unwrap();
		name.append_entry_by_text("CN", "update-test").unwrap();
		let name = name.build();

		let mut cb = X509::builder().unwrap();
		cb.set_version(2).unwrap();
		cb.set_subject_name(&name).unwrap();
		cb.set_issuer_name(&name).unwrap();
		cb.set_pubkey(&pkey).unwrap();
		let nb = openssl::asn1::Asn1Time::days_from_now(0).unwrap();
		let na = openssl::asn1::Asn1Time::days_from_now(30).unwrap();
		cb.set_not_before(&nb).unwrap();
		cb.set_not_after(&na).unwrap();
		cb.sign(&pkey, MessageDigest::sha256()).unwrap();
		(cb.build(), pkey)
	}

	fn sign(data: &[u8], cert: &X509, key: &PKey<openssl::pkey::Private>)
			-> Vec<u8>
	{
		let certs = Stack::new().unwrap();
		let p7 = Pkcs7::sign(cert, key, &certs, data,
				Pkcs7Flags::BINARY | Pkcs7Flags::DETACHED).unwrap();
		p7.to_der().unwrap()
	}

	#[test]
	fn good_and_bad_sigs()
	{
		let tmp = tempfile::tempdir().unwrap();
		let (cert, key) = mk_cert();
		let certfile = tmp.path().join("root.pem");
		std::fs::write(&certfile, cert.to_pem().unwrap()).unwrap();

		let ver = Verifier::init(&certfile, None, None, true).unwrap();
		let data = b"MANIFEST\t1\nversion:\t100\n";
		let sig = sign(data, &cert, &key);

		assert!(ver.verify_detached(data, &sig,
				VerifyFlags::default()));

		// Tampered data fails
		let tampered = b"MANIFEST\t1\nversion:\t999\n";
		assert!(!ver.verify_detached(tampered, &sig,
				VerifyFlags::default()));

		// Garbage sig fails, doesn't panic
		assert!(!ver.verify_detached(data, b"not a signature",
				VerifyFlags::default()));
	}

	#[test]
	fn wrong_cert_rejected_until_alt()
	{
		let tmp = tempfile::tempdir().unwrap();
		let (signing_cert, key) = mk_cert();
		let (pinned_cert, _k2) = mk_cert();

		// Pin a DIFFERENT cert than we sign with
		let certfile = tmp.path().join("root.pem");
		std::fs::write(&certfile, pinned_cert.to_pem().unwrap()).unwrap();

		let data = b"some signed data";
		let sig = sign(data, &signing_cert, &key);

		let altfile = tmp.path().join("root.pem.alt");
		let ver = Verifier::init(&certfile, Some(&altfile), None, true)
				.unwrap();
		assert!(!ver.verify_detached(data, &sig, VerifyFlags::default()));

		// Now drop the signing cert in as the .alt, and the fallback
		// should save us.
		std::fs::write(&altfile, signing_cert.to_pem().unwrap()).unwrap();
		let ver = Verifier::init(&certfile, Some(&altfile), None, true)
				.unwrap();
		assert!(ver.verify_detached(data, &sig, VerifyFlags::default()));
	}

	#[test]
	fn expired_cert_reported()
	{
		let tmp = tempfile::tempdir().unwrap();
		let rsa = Rsa::generate(2048).unwrap();
		let pkey = PKey::from_rsa(rsa).unwrap();
		let mut name = X509NameBuilder::new().unwrap();
		name.append_entry_by_text("CN", "stale").unwrap();
		let name = name.build();

		let mut cb = X509::builder().unwrap();
		cb.set_subject_name(&name).unwrap();
		cb.set_issuer_name(&name).unwrap();
		cb.set_pubkey(&pkey).unwrap();
		// Valid window entirely in the future
		let nb = openssl::asn1::Asn1Time::days_from_now(10).unwrap();
		let na = openssl::asn1::Asn1Time::days_from_now(20).unwrap();
		cb.set_not_before(&nb).unwrap();
		cb.set_not_after(&na).unwrap();
		cb.sign(&pkey, MessageDigest::sha256()).unwrap();
		let cert = cb.build();

		let certfile = tmp.path().join("root.pem");
		std::fs::write(&certfile, cert.to_pem().unwrap()).unwrap();

		let err = Verifier::init(&certfile, None, None, true)
				.unwrap_err();
		assert!(matches!(err, SigErr::CertExpired { .. }));

		// With timecheck off, it loads fine
		Verifier::init(&certfile, None, None, false).unwrap();
	}
}
