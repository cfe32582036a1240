//! Vector migration, move cleanup and CPU hotplug scenarios.

use core::sync::atomic::Ordering;

use hvirq_abi::{Errno, FIRST_DYNAMIC_VECTOR, IRQ_MOVE_CLEANUP_VECTOR, Irq, LAST_DYNAMIC_VECTOR};

use crate::config::{IrqConfig, VectorGrouping, VectorMapPolicy};
use crate::controller::Controller;
use crate::desc::{IrqStatus, MoveState, UsedVectors};
use crate::manager::IrqManager;
use crate::pirq::DomainKind;
use crate::test_fixtures::{
    MockPlatform, assert_vector_tables_consistent, counting_handler, manager, manager_with,
    mask_of, vector_of,
};
use crate::vector::VectorSlot;

const LEVEL_EOI: Controller = Controller::IoApicLevel { move_aware: true };

fn move_state(mgr: &IrqManager, irq: Irq) -> MoveState {
    mgr.with_desc(irq, |d| d.arch.move_state()).unwrap()
}

fn old_vector(mgr: &IrqManager, irq: Irq) -> Option<u8> {
    mgr.with_desc(irq, |d| d.arch.old_vector).unwrap()
}

/// Move `irq` onto `cpu` and run the move to completion.
fn settle_on(hw: &MockPlatform, mgr: &IrqManager, irq: Irq, cpu: usize) -> u8 {
    let old = mgr.irq_vector(irq).unwrap().unwrap().1;
    let vector = mgr.assign_irq_vector(irq, Some(&mask_of(&[cpu]))).unwrap();
    mgr.do_irq(cpu, vector);
    for c in old.iter() {
        mgr.process_inbox(c);
    }
    hw.clear_log();
    assert_eq!(move_state(mgr, irq), MoveState::Stable);
    vector
}

#[test]
fn test_assign_reuses_vector_while_mask_intersects() {
    let (_hw, mgr) = manager();
    let vector = mgr.assign_irq_vector(40, Some(&mask_of(&[0, 1]))).unwrap();
    assert!((FIRST_DYNAMIC_VECTOR..=LAST_DYNAMIC_VECTOR).contains(&vector));
    let (_, cpus) = mgr.irq_vector(40).unwrap().unwrap();
    assert!(cpus.is_subset(&mask_of(&[0, 1])));
    assert_eq!(mgr.vector_slot(0, vector), VectorSlot::Owned(40));

    let again = mgr.assign_irq_vector(40, Some(&mask_of(&[0, 1, 2]))).unwrap();
    assert_eq!(again, vector);
    assert_eq!(move_state(&mgr, 40), MoveState::Stable);
}

#[test]
fn test_move_completes_after_first_delivery_on_new_vector() {
    let (hw, mgr) = manager();
    let old = mgr.setup_gsi(40, Controller::IoApicEdge).unwrap();
    let (hits, handler) = counting_handler();
    mgr.request_irq(40, "nic", handler).unwrap();

    let new = mgr.assign_irq_vector(40, Some(&mask_of(&[2, 3]))).unwrap();
    assert_ne!(new, old);
    assert_eq!(mgr.irq_vector(40).unwrap(), Some((new, mask_of(&[2]))));
    assert_eq!(move_state(&mgr, 40), MoveState::MoveInProgress);
    assert!(hw.log().routes.contains(&(40, new, mask_of(&[2]))));
    // Both bindings stay live until the switch-over is proven.
    assert_eq!(mgr.vector_slot(0, old), VectorSlot::Owned(40));
    assert_eq!(mgr.vector_slot(2, new), VectorSlot::Owned(40));
    assert_vector_tables_consistent(&mgr);

    assert_eq!(
        mgr.assign_irq_vector(40, Some(&mask_of(&[1]))),
        Err(Errno::EAGAIN)
    );

    // A delivery racing the move still reaches the handler on the old vector.
    hw.set_irr(0, old, true);
    mgr.do_irq(0, old);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(move_state(&mgr, 40), MoveState::MoveInProgress);

    mgr.do_irq(2, new);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(move_state(&mgr, 40), MoveState::CleanupPending);
    assert!(hw.log().ipis.contains(&(0, IRQ_MOVE_CLEANUP_VECTOR)));

    // The old vector is latched in cpu0's IRR: cleanup keeps it and retries.
    mgr.do_irq(0, IRQ_MOVE_CLEANUP_VECTOR);
    assert_eq!(mgr.vector_slot(0, old), VectorSlot::Owned(40));
    assert_eq!(old_vector(&mgr, 40), Some(old));
    assert_eq!(move_state(&mgr, 40), MoveState::CleanupPending);

    hw.set_irr(0, old, false);
    mgr.process_inbox(0);
    assert_eq!(mgr.vector_slot(0, old), VectorSlot::Stale(40));
    assert_eq!(old_vector(&mgr, 40), None);
    assert_eq!(move_state(&mgr, 40), MoveState::Stable);
    assert_vector_tables_consistent(&mgr);
}

#[test]
fn test_deferred_affinity_applies_on_ack() {
    let (hw, mgr) = manager();
    let old = mgr.setup_gsi(40, Controller::IoApicEdge).unwrap();
    mgr.irq_set_affinity(40, &mask_of(&[3])).unwrap();
    assert_eq!(vector_of(&mgr, 40), old);
    assert!(
        mgr.with_desc(40, |d| d.status.contains(IrqStatus::MOVE_PENDING))
            .unwrap()
    );

    mgr.do_irq(0, old);
    let (new, cpus) = mgr.irq_vector(40).unwrap().unwrap();
    assert_eq!(cpus, mask_of(&[3]));
    assert_ne!(new, old);
    assert!(
        !mgr.with_desc(40, |d| d.status.contains(IrqStatus::MOVE_PENDING))
            .unwrap()
    );
    assert!(hw.log().routes.contains(&(40, new, mask_of(&[3]))));
    assert_eq!(move_state(&mgr, 40), MoveState::MoveInProgress);
}

#[test]
fn test_set_affinity_rejects_bad_requests() {
    let (_hw, mgr) = manager();
    mgr.setup_gsi(40, Controller::IoApicEdge).unwrap();
    assert_eq!(mgr.irq_set_affinity(40, &mask_of(&[])), Err(Errno::EINVAL));
    // Legacy PIC lines cannot be retargeted.
    assert_eq!(mgr.irq_set_affinity(4, &mask_of(&[1])), Err(Errno::EINVAL));
    assert_eq!(mgr.irq_set_affinity(4096, &mask_of(&[1])), Err(Errno::EINVAL));
}

#[test]
fn test_cpu_down_moves_sole_target() {
    let (hw, mgr) = manager();
    mgr.setup_gsi(40, Controller::IoApicEdge).unwrap();
    let on_cpu1 = settle_on(&hw, &mgr, 40, 1);

    mgr.cpu_down(1).unwrap();
    assert!(!mgr.is_cpu_online(1));
    let (_, cpus) = mgr.irq_vector(40).unwrap().unwrap();
    assert!(!cpus.is_empty());
    assert!(cpus.is_subset(&mgr.online_mask()));
    assert_eq!(move_state(&mgr, 40), MoveState::Stable);
    assert_eq!(mgr.vector_slot(1, on_cpu1), VectorSlot::Unmapped);
    assert_vector_tables_consistent(&mgr);
}

#[test]
fn test_cpu_down_releases_cleanup_it_owed() {
    let (hw, mgr) = manager();
    mgr.setup_gsi(40, Controller::IoApicEdge).unwrap();
    settle_on(&hw, &mgr, 40, 1);

    let new = mgr.assign_irq_vector(40, Some(&mask_of(&[2]))).unwrap();
    mgr.do_irq(2, new);
    assert_eq!(move_state(&mgr, 40), MoveState::CleanupPending);

    // cpu1 never runs its cleanup.
    mgr.cpu_down(1).unwrap();
    assert_eq!(move_state(&mgr, 40), MoveState::Stable);
    assert_eq!(old_vector(&mgr, 40), None);
    assert_eq!(mgr.irq_vector(40).unwrap(), Some((new, mask_of(&[2]))));
    assert_vector_tables_consistent(&mgr);
}

#[test]
fn test_cpu_down_after_own_cleanup_keeps_waiting_for_peers() {
    let (_hw, mgr) = manager_with(IrqConfig {
        grouping: VectorGrouping::Cluster(2),
        ..IrqConfig::default()
    });
    let old = mgr.setup_gsi(40, Controller::IoApicEdge).unwrap();
    assert_eq!(mgr.irq_vector(40).unwrap(), Some((old, mask_of(&[0, 1]))));

    let new = mgr.assign_irq_vector(40, Some(&mask_of(&[2, 3]))).unwrap();
    mgr.do_irq(2, new);
    assert_eq!(move_state(&mgr, 40), MoveState::CleanupPending);

    mgr.process_inbox(0);
    assert_eq!(mgr.vector_slot(0, old), VectorSlot::Stale(40));

    // cpu0 already confirmed; cpu1 still owes its cleanup.
    mgr.cpu_down(0).unwrap();
    assert_eq!(move_state(&mgr, 40), MoveState::CleanupPending);
    assert_eq!(old_vector(&mgr, 40), Some(old));
    assert_eq!(mgr.vector_slot(1, old), VectorSlot::Owned(40));
    assert_vector_tables_consistent(&mgr);

    mgr.process_inbox(1);
    assert_eq!(mgr.vector_slot(1, old), VectorSlot::Stale(40));
    assert_eq!(move_state(&mgr, 40), MoveState::Stable);
    assert_eq!(old_vector(&mgr, 40), None);
    assert_vector_tables_consistent(&mgr);
}

#[test]
fn test_cpu_down_of_move_target_falls_back() {
    let (hw, mgr) = manager();
    let old = mgr.setup_gsi(40, Controller::IoApicEdge).unwrap();
    let new = mgr.assign_irq_vector(40, Some(&mask_of(&[1]))).unwrap();
    assert_eq!(move_state(&mgr, 40), MoveState::MoveInProgress);
    hw.clear_log();

    mgr.cpu_down(1).unwrap();
    assert_eq!(mgr.irq_vector(40).unwrap(), Some((old, mask_of(&[0]))));
    assert_eq!(move_state(&mgr, 40), MoveState::Stable);
    assert_eq!(mgr.vector_slot(1, new), VectorSlot::Unmapped);
    assert!(hw.log().routes.contains(&(40, old, mask_of(&[0]))));
    assert_vector_tables_consistent(&mgr);
}

#[test]
fn test_cpu_hotplug_errors_and_rejoin() {
    let (_hw, mgr) = manager();
    assert_eq!(mgr.cpu_down(9), Err(Errno::EINVAL));
    for cpu in 1..4 {
        mgr.cpu_down(cpu).unwrap();
    }
    assert_eq!(mgr.cpu_down(1), Err(Errno::EINVAL));
    // The last online CPU stays.
    assert_eq!(mgr.cpu_down(0), Err(Errno::EBUSY));
    assert_eq!(mgr.online_mask(), mask_of(&[0]));

    assert_eq!(mgr.cpu_up(99), Err(Errno::EINVAL));
    mgr.cpu_up(3).unwrap();
    assert!(mgr.is_cpu_online(3));
    let vector = mgr.assign_irq_vector(40, Some(&mask_of(&[3]))).unwrap();
    assert_eq!(mgr.vector_slot(3, vector), VectorSlot::Owned(40));
}

#[test]
fn test_cpu_down_narrows_shared_group() {
    let (_hw, mgr) = manager_with(IrqConfig {
        grouping: VectorGrouping::Cluster(2),
        ..IrqConfig::default()
    });
    let irq = mgr.create_irq(false).unwrap();
    let vector = mgr.assign_irq_vector(irq, Some(&mask_of(&[2]))).unwrap();
    assert_eq!(mgr.irq_vector(irq).unwrap(), Some((vector, mask_of(&[2, 3]))));

    mgr.cpu_down(3).unwrap();
    assert_eq!(mgr.vector_slot(3, vector), VectorSlot::Unmapped);
    assert_eq!(mgr.irq_vector(irq).unwrap(), Some((vector, mask_of(&[2]))));
    assert_eq!(mgr.vector_slot(2, vector), VectorSlot::Owned(irq));
}

#[test]
fn test_cluster_grouping_shares_vector() {
    let (_hw, mgr) = manager_with(IrqConfig {
        grouping: VectorGrouping::Cluster(2),
        ..IrqConfig::default()
    });
    let irq = mgr.create_irq(false).unwrap();
    let vector = mgr.assign_irq_vector(irq, Some(&mask_of(&[1]))).unwrap();
    assert_eq!(mgr.irq_vector(irq).unwrap(), Some((vector, mask_of(&[0, 1]))));
    assert_eq!(mgr.vector_slot(0, vector), VectorSlot::Owned(irq));
    assert_eq!(mgr.vector_slot(1, vector), VectorSlot::Owned(irq));
    assert_vector_tables_consistent(&mgr);
}

#[test]
fn test_empty_cluster_allocates_per_cpu() {
    let (_hw, mgr) = manager_with(IrqConfig {
        grouping: VectorGrouping::Cluster(0),
        ..IrqConfig::default()
    });
    let irq = mgr.create_irq(false).unwrap();
    let vector = mgr.assign_irq_vector(irq, Some(&mask_of(&[1]))).unwrap();
    assert_eq!(mgr.irq_vector(irq).unwrap(), Some((vector, mask_of(&[1]))));
}

#[test]
fn test_global_vector_map_tracks_lifetime() {
    let (_hw, mgr) = manager_with(IrqConfig {
        vector_map: VectorMapPolicy::Global,
        ..IrqConfig::default()
    });
    let a = mgr.create_irq(true).unwrap();
    let b = mgr.create_irq(true).unwrap();
    let (va, vb) = (vector_of(&mgr, a), vector_of(&mgr, b));
    assert_ne!(va, vb);
    {
        let vs = mgr.vectors.lock();
        let used = vs.used_map(UsedVectors::Global).unwrap();
        assert!(used.test(va) && used.test(vb));
    }

    mgr.destroy_irq(a).unwrap();
    let vs = mgr.vectors.lock();
    let used = vs.used_map(UsedVectors::Global).unwrap();
    assert!(!used.test(va));
    assert!(used.test(vb));
}

#[test]
fn test_cpu_down_drains_owed_eois() {
    let (hw, mgr) = manager();
    mgr.setup_gsi(21, LEVEL_EOI).unwrap();
    let dom = mgr.new_domain(1, DomainKind::Pv, 64);
    let pirq = {
        let mut irqs = dom.irqs().write();
        let pirq = mgr.allocate_and_map_gsi_pirq(&mut irqs, 21, None).unwrap();
        mgr.pirq_guest_bind(&mut irqs, pirq, 1, false).unwrap();
        pirq
    };
    let vector = vector_of(&mgr, 21);
    assert_eq!(mgr.irq_vector(21).unwrap(), Some((vector, mask_of(&[1]))));

    mgr.do_irq(1, vector);
    mgr.process_inbox(0);
    assert_eq!(move_state(&mgr, 21), MoveState::Stable);
    assert_eq!(mgr.pending_eoi(1).len(), 1);
    assert_eq!(hw.eoi_count(1), 0);

    mgr.cpu_down(1).unwrap();
    assert_eq!(hw.eoi_count(1), 1);
    assert!(mgr.pending_eoi(1).is_empty());
    let (_, cpus) = mgr.irq_vector(21).unwrap().unwrap();
    assert!(cpus.is_subset(&mgr.online_mask()));
    assert!(
        mgr.with_desc(21, |d| d.guest_action().unwrap().cpu_eoi_map.is_empty())
            .unwrap()
    );

    // The guest's late EOI owes nothing further.
    mgr.pirq_guest_eoi(0, &dom.irqs().read(), pirq).unwrap();
    assert_eq!(hw.eoi_count(0) + hw.eoi_count(1), 1);
    assert_vector_tables_consistent(&mgr);
}
