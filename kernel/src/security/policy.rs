// SPDX-License-Identifier: GPL-2.0

//! Policy engine with an access-vector cache
//!
//! A replaceable, ordered rule table over interned security identifiers.
//! The first rule matching a (source, target, class) triple decides the
//! whole permission vector: an allow rule grants exactly its listed
//! permissions, a deny rule revokes exactly its listed permissions.
//! Decisions are cached in the AVC until they age out or the policy is
//! reloaded; permissive mode logs denials but lets them pass.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::security::audit::{self, AuditType};
use crate::sysctl;
use crate::time::{self, NSEC_PER_MSEC};
use crate::types::SubjectId;

/// AVC slot count
pub const AVC_CAPACITY: usize = 512;

/// Default entry lifetime in milliseconds
pub const DEFAULT_AVC_TTL_MS: u64 = 5000;

/// Maximum distinct permission names
pub const MAX_PERMS: u32 = 32;

/// Wildcard marker in rule specifications
pub const WILDCARD: &str = "*";

/// Access decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Allow,
	Deny,
}

/// One rule as loaded by the host
#[derive(Debug, Clone)]
pub struct RuleSpec {
	pub source: String,
	pub target: String,
	pub class: String,
	pub perms: Vec<String>,
	pub allow: bool,
}

impl RuleSpec {
	pub fn allow(source: &str, target: &str, class: &str, perms: &[&str]) -> Self {
		Self {
			source: source.into(),
			target: target.into(),
			class: class.into(),
			perms: perms.iter().map(|p| (*p).into()).collect(),
			allow: true,
		}
	}

	pub fn deny(source: &str, target: &str, class: &str, perms: &[&str]) -> Self {
		Self {
			source: source.into(),
			target: target.into(),
			class: class.into(),
			perms: perms.iter().map(|p| (*p).into()).collect(),
			allow: false,
		}
	}
}

struct Rule {
	source: Option<u32>,
	target: Option<u32>,
	class: Option<u32>,
	perms: u32,
	allow: bool,
}

struct Interner {
	map: HashMap<String, u32>,
	next: u32,
}

impl Interner {
	fn new() -> Self {
		Self {
			map: HashMap::new(),
			next: 1,
		}
	}

	fn intern(&mut self, name: &str) -> u32 {
		if let Some(&id) = self.map.get(name) {
			return id;
		}
		let id = self.next;
		self.next += 1;
		self.map.insert(name.into(), id);
		id
	}
}

#[derive(Debug, Clone, Copy)]
struct AvcEntry {
	ssid: u32,
	tsid: u32,
	class: u32,
	allowed: u32,
	denied: u32,
	timestamp_ns: u64,
	policy_seq: u64,
}

/// Engine counters
#[derive(Debug, Clone, Default)]
pub struct PolicyStats {
	pub lookups: u64,
	pub hits: u64,
	pub misses: u64,
	pub allows: u64,
	pub denials: u64,
	pub evictions: u64,
	pub reloads: u64,
}

struct PolicyCore {
	sids: Interner,
	classes: Interner,
	perms: Interner,
	rules: Vec<Rule>,
	avc: VecDeque<AvcEntry>,
	permissive: bool,
	policy_seq: u64,
	stats: PolicyStats,
}

static CORE: Lazy<SpinLock<PolicyCore>> = Lazy::new(|| {
	SpinLock::new(PolicyCore {
		sids: Interner::new(),
		classes: Interner::new(),
		perms: Interner::new(),
		rules: Vec::new(),
		avc: VecDeque::with_capacity(AVC_CAPACITY),
		permissive: false,
		policy_seq: 0,
		stats: PolicyStats::default(),
	})
});

static AVC_TTL_MS: Lazy<Arc<AtomicU64>> =
	Lazy::new(|| Arc::new(AtomicU64::new(DEFAULT_AVC_TTL_MS)));

/// Initialize the engine and publish its tunables
pub fn init() -> Result<()> {
	Lazy::force(&CORE);
	let entry = sysctl::CtlEntry::new(
		"kernel.avc_ttl_ms",
		"Access-vector cache entry lifetime",
		sysctl::CtlFlags::RW,
		sysctl::CtlValue::U64(AVC_TTL_MS.clone()),
	)
	.with_bounds(1, 3_600_000);
	match sysctl::register(entry) {
		Ok(()) | Err(Error::Busy) => Ok(()),
		Err(e) => Err(e),
	}
}

fn perm_mask(core: &mut PolicyCore, perm: &str) -> Result<u32> {
	if perm == WILDCARD {
		return Ok(u32::MAX);
	}
	let id = core.perms.intern(perm);
	if id > MAX_PERMS {
		return Err(Error::NoMemory);
	}
	Ok(1u32 << (id - 1))
}

/// Replace the rule table; clears the AVC
pub fn load_policy(specs: Vec<RuleSpec>) -> Result<()> {
	let mut core = CORE.lock();
	let mut rules = Vec::with_capacity(specs.len());
	for spec in &specs {
		let source = if spec.source == WILDCARD {
			None
		} else {
			Some(core.sids.intern(&spec.source))
		};
		let target = if spec.target == WILDCARD {
			None
		} else {
			Some(core.sids.intern(&spec.target))
		};
		let class = if spec.class == WILDCARD {
			None
		} else {
			Some(core.classes.intern(&spec.class))
		};
		let mut perms = 0u32;
		for perm in &spec.perms {
			perms |= perm_mask(&mut core, perm)?;
		}
		rules.push(Rule {
			source,
			target,
			class,
			perms,
			allow: spec.allow,
		});
	}
	core.rules = rules;
	core.policy_seq += 1;
	core.avc.clear();
	core.stats.reloads += 1;
	let (count, seq) = (core.rules.len(), core.policy_seq);
	drop(core);
	crate::info!(target: "policy", "policy loaded, {} rules, generation {}", count, seq);
	Ok(())
}

/// Switch permissive mode on or off
pub fn set_permissive(permissive: bool) {
	CORE.lock().permissive = permissive;
	crate::notice!(target: "policy", "permissive mode {}", permissive);
}

/// Whether the engine is permissive
pub fn permissive() -> bool {
	CORE.lock().permissive
}

fn rule_masks(rule: &Rule) -> (u32, u32) {
	if rule.allow {
		(rule.perms, !rule.perms)
	} else {
		(!rule.perms, rule.perms)
	}
}

/// Check one access vector
pub fn check(scontext: &str, tcontext: &str, class: &str, perm: &str) -> Decision {
	let mut core = CORE.lock();
	core.stats.lookups += 1;
	let ssid = core.sids.intern(scontext);
	let tsid = core.sids.intern(tcontext);
	let class_id = core.classes.intern(class);
	let perm_bit = match perm_mask(&mut core, perm) {
		Ok(mask) => mask,
		Err(_) => {
			core.stats.denials += 1;
			return Decision::Deny;
		}
	};
	let now = time::time_ns();
	let ttl_ns = AVC_TTL_MS.load(Ordering::Relaxed) * NSEC_PER_MSEC;
	let seq = core.policy_seq;

	let cached = core
		.avc
		.iter()
		.find(|entry| {
			entry.ssid == ssid
				&& entry.tsid == tsid
				&& entry.class == class_id
				&& entry.policy_seq == seq
				&& now.saturating_sub(entry.timestamp_ns) <= ttl_ns
		})
		.map(|entry| (entry.allowed, entry.denied));

	let (allowed, denied) = match cached {
		Some(masks) => {
			core.stats.hits += 1;
			masks
		}
		None => {
			core.stats.misses += 1;
			let masks = core
				.rules
				.iter()
				.find(|rule| {
					rule.source.map_or(true, |sid| sid == ssid)
						&& rule.target.map_or(true, |sid| sid == tsid)
						&& rule.class.map_or(true, |id| id == class_id)
				})
				.map(rule_masks)
				// No rule matches: everything is denied.
				.unwrap_or((0, u32::MAX));
			if core.avc.len() >= AVC_CAPACITY {
				core.avc.pop_front();
				core.stats.evictions += 1;
			}
			core.avc.push_back(AvcEntry {
				ssid,
				tsid,
				class: class_id,
				allowed: masks.0,
				denied: masks.1,
				timestamp_ns: now,
				policy_seq: seq,
			});
			masks
		}
	};
	let _ = denied;

	if allowed & perm_bit == perm_bit {
		core.stats.allows += 1;
		return Decision::Allow;
	}
	core.stats.denials += 1;
	let permissive = core.permissive;
	drop(core);
	audit::log_event(
		AuditType::Avc,
		SubjectId(0),
		&format!(
			"avc: denied {{ {} }} scontext={} tcontext={} tclass={} permissive={}",
			perm, scontext, tcontext, class, permissive as u32
		),
	);
	if permissive {
		Decision::Allow
	} else {
		Decision::Deny
	}
}

/// Engine counter snapshot
pub fn stats() -> PolicyStats {
	CORE.lock().stats.clone()
}

/// Drop every cached decision without touching the rules
pub fn flush_avc() {
	CORE.lock().avc.clear();
}

#[cfg(test)]
mod tests {
	use super::*;

	// The engine is a process-wide singleton; these tests reload policy
	// and must not interleave.
	static TEST_LOCK: SpinLock<()> = SpinLock::new(());

	fn base_rules() -> Vec<RuleSpec> {
		vec![
			RuleSpec::allow("user_t", "user_home_t", "file", &["read", "write"]),
			RuleSpec::allow("init_t", WILDCARD, WILDCARD, &[WILDCARD]),
		]
	}

	#[test]
	fn first_matching_rule_decides() {
		let _guard = TEST_LOCK.lock();
		load_policy(base_rules()).unwrap();
		assert_eq!(
			check("user_t", "user_home_t", "file", "read"),
			Decision::Allow
		);
		assert_eq!(
			check("user_t", "user_home_t", "file", "execute"),
			Decision::Deny
		);
		assert_eq!(check("user_t", "system_t", "file", "read"), Decision::Deny);
		assert_eq!(
			check("init_t", "anything_t", "process", "fork"),
			Decision::Allow
		);
	}

	#[test]
	fn unmatched_access_defaults_to_deny() {
		let _guard = TEST_LOCK.lock();
		load_policy(base_rules()).unwrap();
		assert_eq!(check("ghost_t", "ghost_t", "socket", "bind"), Decision::Deny);
	}

	#[test]
	fn reload_invalidates_cache_and_applies_new_rules() {
		let _guard = TEST_LOCK.lock();
		load_policy(base_rules()).unwrap();
		assert_eq!(
			check("user_t", "user_home_t", "file", "read"),
			Decision::Allow
		);
		let before = stats();
		// Same vector again: served from the AVC.
		assert_eq!(
			check("user_t", "user_home_t", "file", "read"),
			Decision::Allow
		);
		let after = stats();
		assert_eq!(after.hits, before.hits + 1);

		load_policy(Vec::new()).unwrap();
		let miss_base = stats().misses;
		assert_eq!(
			check("user_t", "user_home_t", "file", "read"),
			Decision::Deny
		);
		assert_eq!(check("init_t", "anything_t", "process", "fork"), Decision::Deny);
		assert_eq!(stats().misses, miss_base + 2);
	}

	#[test]
	fn deny_rules_revoke_listed_perms() {
		let _guard = TEST_LOCK.lock();
		load_policy(vec![
			RuleSpec::deny("guest_t", "vault_t", "file", &["write"]),
			RuleSpec::allow("guest_t", WILDCARD, "file", &[WILDCARD]),
		])
		.unwrap();
		assert_eq!(check("guest_t", "vault_t", "file", "write"), Decision::Deny);
		assert_eq!(check("guest_t", "vault_t", "file", "read"), Decision::Allow);
		assert_eq!(check("guest_t", "other_t", "file", "write"), Decision::Allow);
	}

	#[test]
	fn permissive_mode_converts_denials() {
		let _guard = TEST_LOCK.lock();
		load_policy(Vec::new()).unwrap();
		set_permissive(true);
		assert_eq!(
			check("perm_t", "perm_target_t", "file", "read"),
			Decision::Allow
		);
		set_permissive(false);
		assert_eq!(
			check("perm_t", "perm_target_t", "file", "read"),
			Decision::Deny
		);
	}
}
