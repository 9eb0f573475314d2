//! Subscription graph resolution.
//!
//! A subscription says "this bundle participates in the operation,
//! moving from version X to version Y".  The set is built fresh per
//! operation from whatever was requested plus what's already tracked
//! on disk, closed over the includes/also-add graph in the manifests.
//! Required-ness joins upward: reached by any required path means
//! required, no matter how many optional paths also reach it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::manifest::{Manifest, Store, StoreErr, Version};


/// One bundle's participation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subscription
{
	pub(crate) name: String,

	/// 0 = not installed
	pub(crate) from_version: Version,

	pub(crate) to_version: Version,

	/// Pulled in only via also-add edges
	pub(crate) optional: bool,
}


/// What resolution produced.
#[derive(Debug, Default)]
pub(crate) struct Resolution
{
	/// Sorted by bundle name, unique.
	pub(crate) subs: Vec<Subscription>,

	/// Requested names that don't exist (or are deleted) in the MoM.
	/// Non-fatal; the operation reports them and its exit code says
	/// so.
	pub(crate) invalid: Vec<String>,
}



/*
 * Installed-bundle markers
 */

/// What's tracked on this system: the names of the regular files in
/// the tracking dir.  Contents are ignored; dotfiles too.
pub(crate) fn installed_bundles(tracking_dir: &Path) -> Vec<String>
{
	let rd = match std::fs::read_dir(tracking_dir) {
		Ok(rd) => rd,
		Err(_) => return Vec::new(),
	};

	let mut ret: Vec<String> = rd.filter_map(|e| {
		let e = e.ok()?;
		let name = e.file_name().to_str()?.to_string();
		if name.starts_with('.') { return None; }
		if !e.file_type().ok()?.is_file() { return None; }
		Some(name)
	}).collect();
	ret.sort_unstable();
	ret
}


pub(crate) fn is_installed(tracking_dir: &Path, bundle: &str) -> bool
{
	tracking_dir.join(bundle).is_file()
}



/*
 * The closure builder
 */

/// Close a seed set over the manifest include graph.
///
/// `skip_optional` drops also-add edges entirely.  A bundle reached
/// only while some optional ancestor is on the path stays optional;
/// reached by any fully-required path, it's required, and its own
/// subtree gets re-walked so the upgrade propagates.
pub(crate) fn resolve(seeds: &[(String, bool)], mom: &Manifest,
		store: &Store, skip_optional: bool)
		-> Result<Resolution, StoreErr>
{
	let mut res = Resolution::default();

	// name -> optional-ness so far
	let mut state: HashMap<String, bool> = HashMap::new();
	let mut queue: VecDeque<(String, bool)> = VecDeque::new();

	for (name, opt) in seeds
	{ queue.push_back((name.clone(), *opt)); }

	let mut badnames: HashSet<String> = HashSet::new();

	while let Some((name, optional)) = queue.pop_front()
	{
		// Known bundle?  Live?
		let ent = mom.bundle(&name);
		let ok = matches!(ent, Some(e) if !e.is_deleted());
		if !ok
		{
			if badnames.insert(name.clone())
			{ res.invalid.push(name); }
			continue;
		}

		// Visited already?  Only a required re-visit of an optional
		// node changes anything, and then the subtree gets re-walked
		// so the join propagates down required edges.
		match state.get(&name).copied()
		{
			Some(false) => continue,  // already required; done
			Some(true) if optional => continue,
			_ => (),
		}
		state.insert(name.clone(), optional);

		let mf = store.load_bundle(&name, mom)?;
		for inc in &mf.header.includes
		{
			// Required edge, but under an optional parent the whole
			// subtree stays optional.
			queue.push_back((inc.clone(), optional));
		}
		if !skip_optional
		{
			for add in &mf.header.also_add
			{ queue.push_back((add.clone(), true)); }
		}
	}

	res.subs = state.into_iter()
			.map(|(name, optional)| Subscription {
				name, optional,
				from_version: 0, to_version: 0,
			})
			.collect();
	res.subs.sort_by(|a, b| a.name.cmp(&b.name));
	res.invalid.sort_unstable();
	Ok(res)
}


/// Fill in from/to versions from the MoMs.  `to` versions come from
/// the target MoM; `from` versions from the currently-installed MoM
/// for bundles that have markers (0 otherwise).
pub(crate) fn set_versions(subs: &mut [Subscription], to_mom: &Manifest,
		from_mom: Option<&Manifest>, tracking_dir: &Path)
{
	for s in subs
	{
		if let Some(e) = to_mom.bundle(&s.name)
		{ s.to_version = e.last_change; }

		s.from_version = 0;
		if is_installed(tracking_dir, &s.name)
		{
			if let Some(fm) = from_mom
			{
				if let Some(e) = fm.bundle(&s.name)
				{ s.from_version = e.last_change; }
			}
		}
	}
}


/// The usual seed sets.
pub(crate) fn seeds_for_system(tracking_dir: &Path) -> Vec<(String, bool)>
{
	// Installed set plus os-core, which is always along for the ride.
	let mut names = installed_bundles(tracking_dir);
	if !names.iter().any(|n| n == "os-core")
	{ names.push("os-core".to_string()); }
	names.into_iter().map(|n| (n, false)).collect()
}

pub(crate) fn seeds_from_requested(bundles: &[String]) -> Vec<(String, bool)>
{
	bundles.iter().map(|b| (b.clone(), false)).collect()
}



/*
 * bundle-remove safety
 */

/// What remove resolution decided.
#[derive(Debug, Default)]
pub(crate) struct RemoveSet
{
	/// Bundles whose markers (and exclusive files) go away.
	pub(crate) remove: Vec<String>,

	/// Requested bundles refused because something still installed
	/// requires them: (bundle, the installed bundles needing it).
	pub(crate) required_by: Vec<(String, Vec<String>)>,

	/// Requested but not tracked here.
	pub(crate) not_tracked: Vec<String>,
}


/// Work out what a bundle-remove may take off the system.
///
/// os-core is never removable.  A requested bundle that some other
/// installed bundle (transitively, via required includes) depends on
/// is refused unless `force` unpins it.  With `recursive`, the
/// victims' exclusive dependency closure comes along: everything they
/// pull in that no surviving bundle also needs.
pub(crate) fn resolve_remove(requested: &[String], mom: &Manifest,
		store: &Store, tracking_dir: &Path, force: bool, recursive: bool)
		-> Result<RemoveSet, StoreErr>
{
	let mut rs = RemoveSet::default();
	let installed = installed_bundles(tracking_dir);

	let mut victims: Vec<String> = Vec::new();
	for name in requested
	{
		if name == "os-core"
		{
			rs.required_by.push((name.clone(),
					vec!["the OS itself".to_string()]));
			continue;
		}
		match is_installed(tracking_dir, name) {
			true  => victims.push(name.clone()),
			false => rs.not_tracked.push(name.clone()),
		}
	}

	// Whose required closure mentions a victim?
	let victimset: HashSet<&String> = victims.iter().collect();
	let survivors: Vec<String> = installed.iter()
			.filter(|b| !victimset.contains(b))
			.cloned().collect();

	let mut keep_closure: HashSet<String> = HashSet::new();
	let mut required_by: HashMap<String, Vec<String>> = HashMap::new();
	for surv in &survivors
	{
		let cl = includes_closure(surv, mom, store)?;
		for c in &cl
		{
			if victimset.contains(c)
			{
				required_by.entry(c.clone()).or_default()
						.push(surv.clone());
			}
		}
		keep_closure.extend(cl);
		keep_closure.insert(surv.clone());
	}

	for v in victims
	{
		match required_by.get(&v)
		{
			Some(needers) if !force => {
				rs.required_by.push((v, needers.clone()));
			},
			_ => {
				rs.remove.push(v.clone());
				if recursive
				{
					// Exclusive deps: pulled in by the victim, needed
					// by no survivor, actually installed, and not
					// os-core.
					for dep in includes_closure(&v, mom, store)?
					{
						if dep == "os-core" { continue; }
						if keep_closure.contains(&dep) { continue; }
						if !is_installed(tracking_dir, &dep) { continue; }
						if !rs.remove.contains(&dep)
						{ rs.remove.push(dep); }
					}
				}
			},
		}
	}

	rs.remove.sort_unstable();
	rs.remove.dedup();
	Ok(rs)
}


/// The transitive closure of a bundle's required includes (the bundle
/// itself not included).
fn includes_closure(bundle: &str, mom: &Manifest, store: &Store)
		-> Result<HashSet<String>, StoreErr>
{
	let mut seen: HashSet<String> = HashSet::new();
	let mut queue: VecDeque<String> = VecDeque::new();
	queue.push_back(bundle.to_string());

	while let Some(name) = queue.pop_front()
	{
		// Unknown-in-MoM deps of installed bundles just get skipped;
		// remove safety shouldn't die on a stale tracking file.
		if mom.bundle(&name).is_none() { continue; }
		let mf = store.load_bundle(&name, mom)?;
		for inc in &mf.header.includes
		{
			if seen.insert(inc.clone())
			{ queue.push_back(inc.clone()); }
		}
	}

	seen.remove(bundle);
	Ok(seen)
}



#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn marker_listing()
	{
		let tmp = tempfile::tempdir().unwrap();
		let td = tmp.path();
		std::fs::write(td.join("os-core"), "").unwrap();
		std::fs::write(td.join("editors"), "").unwrap();
		std::fs::write(td.join(".MoM"), "").unwrap();
		std::fs::create_dir(td.join("a-dir")).unwrap();

		let got = installed_bundles(td);
		assert_eq!(got, vec!["editors", "os-core"]);
		assert!(is_installed(td, "editors"));
		assert!(!is_installed(td, "a-dir"));
		assert!(!is_installed(td, "nope"));
	}

	#[test]
	fn system_seeds_have_os_core()
	{
		let tmp = tempfile::tempdir().unwrap();
		let seeds = seeds_for_system(tmp.path());
		assert_eq!(seeds, vec![("os-core".to_string(), false)]);
	}

	// Graph-walking tests live in tests with a live Store; see
	// cmd-level tests.  The pure bits are covered here.
	#[test]
	fn version_tagging()
	{
		use crate::manifest::testutil::{self, rec, mf};
		use crate::manifest::{FileKind, Lifecycle};

		let tmp = tempfile::tempdir().unwrap();
		std::fs::write(tmp.path().join("editors"), "").unwrap();

		let newmom = mf(100, vec![
			rec("os-core", FileKind::Manifest, Lifecycle::Live, 100,
					&testutil::hash('a')),
			rec("editors", FileKind::Manifest, Lifecycle::Live, 95,
					&testutil::hash('b')),
		]);
		let oldmom = mf(90, vec![
			rec("os-core", FileKind::Manifest, Lifecycle::Live, 90,
					&testutil::hash('c')),
			rec("editors", FileKind::Manifest, Lifecycle::Live, 85,
					&testutil::hash('d')),
		]);

		let mut subs = vec![
			Subscription { name: "os-core".into(), from_version: 0,
					to_version: 0, optional: false },
			Subscription { name: "editors".into(), from_version: 0,
					to_version: 0, optional: false },
		];
		set_versions(&mut subs, &newmom, Some(&oldmom), tmp.path());

		// os-core has no marker in this tmp dir: from stays 0
		assert_eq!(subs[0].to_version, 100);
		assert_eq!(subs[0].from_version, 0);

		// editors has a marker: from comes from the old MoM
		assert_eq!(subs[1].to_version, 95);
		assert_eq!(subs[1].from_version, 85);
	}
}
