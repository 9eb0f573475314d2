//! Dealing with the update servers themselves.
//!
//! One Server handle per operation: it owns the HTTP agent and the
//! resolved URL bases.  Everything network-shaped funnels through
//! here, so the pools just clone the handle (the agent is internally
//! shared) and go.

use url::Url;


/// Various http stuff
pub(crate) mod http;
pub(crate) use http::FetchErr;

/// Version discovery and the format gate
pub(crate) mod version;


/// The server handle.
#[derive(Debug, Clone)]
pub(crate) struct Server
{
	/// HTTP agent (cheaply cloneable; connections are shared)
	pub(crate) agent: ureq::Agent,

	/// Where version info lives
	pub(crate) version_url: Url,

	/// Where content (manifests, packs, fullfiles) lives
	pub(crate) content_url: Url,
}


impl Server
{
	/// Build a handle from the config.
	pub(crate) fn new(config: &crate::config::Config)
			-> Result<Self, anyhow::Error>
	{
		let version_url = config.version_url().clone();
		let content_url = config.content_url().clone();
		let agent = http::mk_agent(&content_url);

		Ok(Server { agent, version_url, content_url })
	}


	/// URL for a path under the content base.
	pub(crate) fn content(&self, rel: &str) -> Result<Url, url::ParseError>
	{
		self.content_url.join(rel)
	}

	/// URL for a path under the version base.
	pub(crate) fn version(&self, rel: &str) -> Result<Url, url::ParseError>
	{
		self.version_url.join(rel)
	}


	/// A cheap are-you-there probe, used to distinguish "server is
	/// down" from "that particular thing is missing" before starting
	/// an operation that wants the network.
	pub(crate) fn check_connection(&self) -> Result<(), FetchErr>
	{
		// The content root itself may 404/403 on some CDNs; any
		// HTTP-level answer still means the server's talking to us.
		let url = self.content_url.clone();
		match http::get_bytes(&self.agent, &url) {
			Ok(_) => Ok(()),
			Err(FetchErr::Status(_)) => Ok(()),
			Err(e) => Err(e),
		}
	}
}
