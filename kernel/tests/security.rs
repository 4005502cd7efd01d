// SPDX-License-Identifier: GPL-2.0

//! Security core scenarios

use kos_kernel::boot;
use kos_kernel::error::Error;
use kos_kernel::security::audit::{self, AuditType};
use kos_kernel::security::capability::{self, cap_mask, CapSet, CAP_KILL, CAP_NET_ADMIN};
use kos_kernel::security::policy::{self, Decision, RuleSpec};
use kos_kernel::security::seccomp::{
	self, ArgCmp, ArgOp, FilterAction, SeccompMode, SyscallFilter, EACCES,
};
use kos_kernel::types::SubjectId;

fn boot_fabric() {
	static BOOT: std::sync::Once = std::sync::Once::new();
	BOOT.call_once(|| {
		boot::boot(&boot::default_modules(), &boot::AutoContinue).unwrap();
	});
}

// Policy state is engine-global; the tests that reload it run under one
// lock.
static POLICY_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[test]
fn policy_scenario_allow_deny_and_reload() {
	boot_fabric();
	let _guard = POLICY_LOCK.lock().unwrap();
	policy::load_policy(vec![
		RuleSpec::allow("user_t", "user_home_t", "file", &["read", "write"]),
		RuleSpec::allow("init_t", "*", "*", &["*"]),
	])
	.unwrap();

	assert_eq!(
		policy::check("user_t", "user_home_t", "file", "read"),
		Decision::Allow
	);
	assert_eq!(
		policy::check("user_t", "system_t", "file", "read"),
		Decision::Deny
	);
	assert_eq!(
		policy::check("init_t", "anything", "process", "fork"),
		Decision::Allow
	);

	// Reload with the empty policy: everything becomes deny.
	policy::load_policy(Vec::new()).unwrap();
	assert_eq!(
		policy::check("user_t", "user_home_t", "file", "read"),
		Decision::Deny
	);
	assert_eq!(
		policy::check("user_t", "system_t", "file", "read"),
		Decision::Deny
	);
	assert_eq!(
		policy::check("init_t", "anything", "process", "fork"),
		Decision::Deny
	);
}

#[test]
fn policy_reload_invalidates_every_cached_vector() {
	boot_fabric();
	let _guard = POLICY_LOCK.lock().unwrap();
	policy::load_policy(vec![RuleSpec::allow("a_t", "b_t", "file", &["read"])]).unwrap();

	let vectors = [
		("a_t", "b_t", "file", "read"),
		("a_t", "c_t", "file", "read"),
		("x_t", "b_t", "dir", "search"),
	];
	for (s, t, c, p) in vectors {
		policy::check(s, t, c, p);
	}
	// Warm: these all hit.
	let before = policy::stats();
	for (s, t, c, p) in vectors {
		policy::check(s, t, c, p);
	}
	let warmed = policy::stats();
	assert_eq!(warmed.hits, before.hits + vectors.len() as u64);

	// After a reload every vector misses exactly once again.
	policy::load_policy(vec![RuleSpec::allow("a_t", "b_t", "file", &["read"])]).unwrap();
	let base = policy::stats();
	for (s, t, c, p) in vectors {
		policy::check(s, t, c, p);
	}
	let after = policy::stats();
	assert_eq!(after.misses, base.misses + vectors.len() as u64);
	assert_eq!(after.hits, base.hits);
}

#[test]
fn permissive_mode_allows_but_audits() {
	boot_fabric();
	let _guard = POLICY_LOCK.lock().unwrap();
	policy::load_policy(Vec::new()).unwrap();
	audit::clear_rules();
	policy::set_permissive(true);
	let decision = policy::check("perm_user_t", "perm_obj_t", "file", "unlink");
	policy::set_permissive(false);
	assert_eq!(decision, Decision::Allow);
	let denial_logged = audit::events().iter().any(|event| {
		event.ty == AuditType::Avc && event.message.contains("perm_user_t")
	});
	assert!(denial_logged);
}

#[test]
fn capability_lattice_holds_across_transitions() {
	boot_fabric();
	let subject = SubjectId(4001);

	let mut narrowed = CapSet::root();
	narrowed.permitted = cap_mask(CAP_KILL) | cap_mask(CAP_NET_ADMIN);
	narrowed.effective = cap_mask(CAP_KILL);
	narrowed.inheritable = cap_mask(CAP_KILL);
	narrowed.bounding = narrowed.permitted;
	capability::set(subject, narrowed).unwrap();

	// effective ⊆ permitted after every accepted set.
	let current = capability::get(subject);
	assert_eq!(current.effective & !current.permitted, 0);

	capability::raise(subject, CAP_NET_ADMIN).unwrap();
	assert!(capability::capable(subject, CAP_NET_ADMIN));

	capability::drop_cap(subject, CAP_NET_ADMIN).unwrap();
	assert!(!capability::capable(subject, CAP_NET_ADMIN));
	assert_eq!(capability::raise(subject, CAP_NET_ADMIN), Err(Error::Permission));

	capability::exec_transition(subject, false).unwrap();
	let after = capability::get(subject);
	assert_eq!(after.permitted, after.inheritable & narrowed.bounding);
	assert_eq!(after.effective & !after.permitted, 0);
	capability::remove_subject(subject);
}

#[test]
fn seccomp_scenarios() {
	boot_fabric();
	let subject = SubjectId(4002);

	// Disabled allows anything.
	assert_eq!(seccomp::check(subject, 321, &[]), FilterAction::Allow);

	seccomp::set_mode(subject, SeccompMode::Filter).unwrap();
	assert_eq!(
		seccomp::set_mode(subject, SeccompMode::Disabled),
		Err(Error::Permission)
	);

	seccomp::add_filter(
		subject,
		SyscallFilter {
			nr: 2, // open
			action: FilterAction::Allow,
			args: vec![ArgCmp {
				index: 1,
				op: ArgOp::Eq,
				value: 0, // O_RDONLY
			}],
		},
	)
	.unwrap();
	seccomp::add_filter(
		subject,
		SyscallFilter {
			nr: 2,
			action: FilterAction::Errno(30), // EROFS
			args: Vec::new(),
		},
	)
	.unwrap();

	assert_eq!(seccomp::check(subject, 2, &[0, 0]), FilterAction::Allow);
	assert_eq!(seccomp::check(subject, 2, &[0, 1]), FilterAction::Errno(30));
	// No filter at all for this syscall: default errno.
	assert_eq!(
		seccomp::check(subject, 41, &[]),
		FilterAction::Errno(EACCES)
	);
	seccomp::remove_subject(subject);

	// Strict mode on a fresh subject.
	let strict = SubjectId(4003);
	seccomp::set_mode(strict, SeccompMode::Strict).unwrap();
	assert_eq!(seccomp::check(strict, 1, &[]), FilterAction::Allow);
	assert_eq!(seccomp::check(strict, 2, &[]), FilterAction::KillProcess);
	seccomp::remove_subject(strict);
}

#[test]
fn audit_file_sink_writes_formatted_lines() {
	boot_fabric();
	let path = std::env::temp_dir().join(format!("kos-audit-{}.log", std::process::id()));
	let _ = std::fs::remove_file(&path);
	audit::enable_file_sink(&path).unwrap();
	audit::log_event(AuditType::User, SubjectId(77), "sink check");
	audit::disable_file_sink();

	let contents = std::fs::read_to_string(&path).unwrap();
	let line = contents
		.lines()
		.find(|line| line.contains("sink check"))
		.expect("event line written");
	assert!(line.starts_with("type=USER msg=audit("));
	assert!(line.contains("pid=77"));
	assert!(line.contains("msg=\"sink check\""));
	let _ = std::fs::remove_file(&path);
}
