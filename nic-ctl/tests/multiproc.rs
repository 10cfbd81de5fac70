//! Cross-process coordination properties, exercised with several
//! coordinators attached to the same segment from one test process. Each
//! coordinator models one process; each carries its own aux channel, the
//! way every process would.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use nic_ctl::mp::{Coordinator, Role};
use nic_ctl::sim::SimAuxChannel;
use serial_test::serial;

fn unique_name(tag: &str) -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    format!(
        "/nic_ctl_mp_test_{tag}_{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn coordinator(segment: &str, aux_tag: &str) -> (Coordinator, Arc<SimAuxChannel>) {
    let aux = Arc::new(SimAuxChannel::new(aux_tag));
    let coord = Coordinator::new(segment, aux.clone()).unwrap();
    (coord, aux)
}

#[test]
#[serial]
fn attach_detach_sequences_keep_counters_sane() {
    let segment = unique_name("counters");
    let (mut primary, primary_aux) = coordinator(&segment, &segment[1..]);
    assert_eq!(primary.role(), Role::Primary);

    // The primary attaches three ports.
    for _ in 0..3 {
        assert_eq!(primary.ensure_initialized().unwrap(), Role::Primary);
    }
    // Global init ran exactly once despite three attachments.
    assert_eq!(primary_aux.primary_inits(), 1);
    assert_eq!(primary.counts(), (3, 0));

    // Two "processes" attach as secondaries, two ports each.
    let (mut sec_a, aux_a) = coordinator(&segment, &format!("{}_a", &segment[1..]));
    let (mut sec_b, aux_b) = coordinator(&segment, &format!("{}_b", &segment[1..]));
    assert_eq!(sec_a.role(), Role::Secondary);
    assert_eq!(sec_b.role(), Role::Secondary);
    for _ in 0..2 {
        sec_a.ensure_initialized().unwrap();
        sec_b.ensure_initialized().unwrap();
    }
    assert_eq!(primary.counts(), (3, 4));
    // Local one-time init ran once per process.
    assert_eq!(aux_a.secondary_inits(), 1);
    assert_eq!(aux_b.secondary_inits(), 1);

    // Detach in a mixed order; counters stay consistent throughout.
    sec_a.release().unwrap();
    primary.release().unwrap();
    sec_a.release().unwrap();
    assert!(!aux_a.is_secondary_up());
    sec_b.release().unwrap();
    sec_b.release().unwrap();
    assert!(!aux_b.is_secondary_up());
    assert_eq!(primary.counts(), (2, 0));

    primary.release().unwrap();
    assert!(primary_aux.is_primary_up());
    primary.release().unwrap();
    // Last primary detach tore the channel down and unlinked the segment.
    assert!(!primary_aux.is_primary_up());
}

#[test]
#[serial]
fn secondary_local_teardown_then_reinit() {
    let segment = unique_name("reinit");
    let (mut primary, _paux) = coordinator(&segment, &segment[1..]);
    primary.ensure_initialized().unwrap();

    let (mut sec, aux) = coordinator(&segment, &format!("{}_s", &segment[1..]));
    sec.ensure_initialized().unwrap();
    sec.release().unwrap();
    assert_eq!(aux.secondary_inits(), 1);
    assert!(!aux.is_secondary_up());

    // Attaching again after a full local detach re-runs the local init.
    sec.ensure_initialized().unwrap();
    assert_eq!(aux.secondary_inits(), 2);
    assert!(aux.is_secondary_up());
    sec.release().unwrap();
    primary.release().unwrap();
}

#[test]
#[serial]
#[should_panic(expected = "primary refcount underflow")]
fn release_below_zero_panics() {
    let segment = unique_name("underflow");
    let (mut primary, _aux) = coordinator(&segment, &segment[1..]);
    // Never attached; the shared count is zero.
    let _ = primary.release();
}

#[test]
#[serial]
fn unlink_happens_outside_the_lock() {
    // The last primary decrements under the lock but unlinks the name after
    // dropping it. Between those two steps a fresh process can create a new
    // segment under the same name and become primary while the old mapping
    // still exists. This pins down that window's observable effect: the
    // late-arriving coordinator sees a fresh segment, not the torn-down one.
    let segment = unique_name("window");
    let (mut first, first_aux) = coordinator(&segment, &segment[1..]);
    first.ensure_initialized().unwrap();
    first.release().unwrap();
    assert!(!first_aux.is_primary_up());

    let (mut second, second_aux) = coordinator(&segment, &format!("{}_2", &segment[1..]));
    assert_eq!(second.role(), Role::Primary);
    second.ensure_initialized().unwrap();
    assert_eq!(second.counts(), (1, 0));
    assert_eq!(second_aux.primary_inits(), 1);
    second.release().unwrap();
}
