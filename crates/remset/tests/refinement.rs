//! Concurrent refinement: background threads, mutator assistance in the red
//! zone, the from-card cache, and suspension around pauses.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use remset::{
    Address, CardState, ConcurrentRefine, RefWidth, RegionKind, RemSetConfig, RemSetContext,
};

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Objects of `slots` wide slots filling `regions` fresh old regions.
fn populate(ctx: &RemSetContext, regions: usize, per_region: usize, slots: usize) -> Vec<Address> {
    let mut objects = Vec::new();
    for _ in 0..regions {
        let region = ctx.allocate_region(RegionKind::Old).unwrap();
        for _ in 0..per_region {
            objects.push(ctx.heap().allocate(region, slots, RefWidth::Wide).unwrap());
        }
    }
    objects
}

#[test]
fn test_background_refinement_keeps_sets_sound() {
    let config = {
        let mut c = RemSetConfig::new(16, 32).with_zones(0);
        c.set_refinement_threads(2);
        c.set_dirty_buffer_capacity(4);
        c
    };
    let ctx = Arc::new(RemSetContext::new(config).unwrap());
    let objects = Arc::new(populate(&ctx, 8, 64, 16));
    let refine = ConcurrentRefine::start(&ctx).unwrap();
    assert_eq!(refine.threads(), 2);

    let mutators: Vec<_> = (0..4u64)
        .map(|t| {
            let ctx = Arc::clone(&ctx);
            let objects = Arc::clone(&objects);
            thread::spawn(move || {
                let queue = ctx.new_mutator_queue();
                let mut x = 0x9e37_79b9_7f4a_7c15 ^ (t + 1);
                for _ in 0..3_000 {
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    let obj = objects[(x % objects.len() as u64) as usize];
                    let target = objects[((x >> 20) % objects.len() as u64) as usize];
                    ctx.write_ref(&queue, obj, ((x >> 40) % 16) as usize, Some(target));
                }
            })
        })
        .collect();
    for m in mutators {
        m.join().unwrap();
    }

    // Stop the threads and finish what they left behind.
    refine.suspend();
    assert_eq!(refine.active_workers(), 0);
    ctx.refine_pending_buffers();

    assert!(ctx.find_unremembered_refs().is_empty());
    assert!(ctx.stats().snapshot().cards_refined > 0);
    for region in ctx.heap().regions().filter(|r| !r.is_free()) {
        assert_eq!(
            ctx.card_table().count_in_state(region.index(), CardState::Dirty),
            0
        );
    }
    drop(refine);
}

#[test]
fn test_red_zone_mutator_refines_own_buffer() {
    let config = {
        let mut c = RemSetConfig::new(16, 8).with_zones(0);
        c.set_refinement_threads(0);
        c.set_dirty_buffer_capacity(2);
        c
    };
    let ctx = RemSetContext::new(config).unwrap();
    let source = ctx.allocate_region(RegionKind::Old).unwrap();
    let owner = ctx.allocate_region(RegionKind::Old).unwrap();
    let target = ctx.heap().allocate(owner, 0, RefWidth::Wide).unwrap();
    // One slot per card over eight cards.
    let obj = ctx.heap().allocate(source, 8 * 64, RefWidth::Wide).unwrap();
    let queue = ctx.new_mutator_queue();
    for card in 0..8 {
        ctx.write_ref(&queue, obj, card * 64, Some(target));
    }

    let stats = ctx.stats().snapshot();
    assert!(stats.buffers_by_mutators >= 1, "{stats:?}");
    // The first full buffer was published; later ones were refined in place.
    assert_eq!(ctx.dirty_card_queue_set().completed_buffers(), 1);
    assert!(ctx.rem_set(owner).occupied() >= 2);

    drop(queue);
    ctx.refine_pending_buffers();
    assert_eq!(ctx.rem_set(owner).occupied(), 8);
}

#[test]
fn test_from_card_cache_skips_repeated_insert() {
    let mut config = RemSetConfig::new(16, 8);
    config.set_refinement_threads(0);
    let ctx = RemSetContext::new(config).unwrap();
    let source = ctx.allocate_region(RegionKind::Old).unwrap();
    let owner = ctx.allocate_region(RegionKind::Old).unwrap();
    let target = ctx.heap().allocate(owner, 0, RefWidth::Wide).unwrap();
    let obj = ctx.heap().allocate(source, 2, RefWidth::Wide).unwrap();

    let queue = ctx.new_mutator_queue();
    ctx.write_ref(&queue, obj, 0, Some(target));
    ctx.write_ref(&queue, obj, 1, Some(target));
    assert_eq!(queue.pending(), 1, "second store hits an already dirty card");
    drop(queue);
    ctx.refine_pending_buffers();

    let stats = ctx.stats().snapshot();
    assert_eq!(stats.refs_recorded, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cards_refined, 1);
    assert_eq!(ctx.rem_set(owner).occupied(), 1);
}

#[test]
fn test_pause_invalidates_from_card_cache() {
    let mut config = RemSetConfig::new(16, 8);
    config.set_refinement_threads(0);
    let ctx = RemSetContext::new(config).unwrap();
    let source = ctx.allocate_region(RegionKind::Old).unwrap();
    let owner = ctx.allocate_region(RegionKind::Old).unwrap();
    let obj = ctx.heap().allocate(source, 1, RefWidth::Wide).unwrap();
    let card = ctx.card_table().card_for(obj);
    let slot = ctx.config().mutator_cache_slot();

    assert!(!ctx.from_card_cache().contains_or_replace(slot, owner, card));
    assert!(ctx.from_card_cache().contains_or_replace(slot, owner, card));

    ctx.enter_safepoint();
    ctx.prepare_for_scan(&[]);
    ctx.cleanup_after_scan();
    ctx.leave_safepoint();
    assert!(!ctx.from_card_cache().contains_or_replace(slot, owner, card));

    // After reclaiming the owner the cached card must not suppress a new
    // insert into the reused region.
    ctx.enter_safepoint();
    ctx.reclaim_region(owner).unwrap();
    ctx.leave_safepoint();
    let reused = ctx.allocate_region(RegionKind::Old).unwrap();
    assert_eq!(reused, owner);
    let fresh = ctx.heap().allocate(reused, 0, RefWidth::Wide).unwrap();
    let queue = ctx.new_mutator_queue();
    ctx.write_ref(&queue, obj, 0, Some(fresh));
    drop(queue);
    ctx.refine_pending_buffers();
    assert!(ctx.rem_set(reused).contains(card));
    assert!(ctx.rem_set(reused).representation_of(source).is_some());
}

#[test]
fn test_suspend_holds_back_refinement() {
    let config = {
        let mut c = RemSetConfig::new(16, 8).with_zones(0);
        c.set_refinement_threads(1);
        c.set_dirty_buffer_capacity(1);
        c
    };
    let ctx = Arc::new(RemSetContext::new(config).unwrap());
    let source = ctx.allocate_region(RegionKind::Old).unwrap();
    let owner = ctx.allocate_region(RegionKind::Old).unwrap();
    let target = ctx.heap().allocate(owner, 0, RefWidth::Wide).unwrap();
    let obj = ctx.heap().allocate(source, 4 * 64, RefWidth::Wide).unwrap();
    let refine = ConcurrentRefine::start(&ctx).unwrap();

    refine.suspend();
    assert_eq!(refine.active_workers(), 0);
    // Publish directly so no store ends up refined by the mutator.
    let dcqs = ctx.dirty_card_queue_set();
    for card in 0..4 {
        let addr = ctx.heap().store_ref(obj, card * 64, Some(target));
        let idx = ctx.card_table().dirty(addr).unwrap();
        dcqs.enqueue_cards([idx]);
    }
    thread::sleep(Duration::from_millis(20));
    assert_eq!(dcqs.completed_buffers(), 4, "suspended threads must not refine");

    refine.resume();
    wait_until("refinement to drain", || dcqs.completed_buffers() == 0);
    refine.suspend();
    // Suspension may have cut the last buffer short.
    ctx.refine_pending_buffers();
    assert_eq!(ctx.rem_set(owner).occupied(), 4);
    assert!(ctx.stats().snapshot().buffers_by_workers >= 1);
    refine.resume();
}

#[test]
fn test_should_abort_stops_workers() {
    let config = {
        let mut c = RemSetConfig::new(16, 8).with_zones(0);
        c.set_refinement_threads(1);
        c.set_dirty_buffer_capacity(1);
        c
    };
    let ctx = Arc::new(RemSetContext::new(config).unwrap());
    let source = ctx.allocate_region(RegionKind::Old).unwrap();
    let owner = ctx.allocate_region(RegionKind::Old).unwrap();
    let target = ctx.heap().allocate(owner, 0, RefWidth::Wide).unwrap();
    let obj = ctx.heap().allocate(source, 1, RefWidth::Wide).unwrap();
    ctx.set_should_abort(true);
    let refine = ConcurrentRefine::start(&ctx).unwrap();

    let addr = ctx.heap().store_ref(obj, 0, Some(target));
    let card = ctx.card_table().dirty(addr).unwrap();
    ctx.dirty_card_queue_set().enqueue_cards([card]);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(ctx.card_table().state(card), CardState::Dirty);

    ctx.set_should_abort(false);
    // Workers only re-check on a notification.
    ctx.dirty_card_queue_set().enqueue_cards([card]);
    wait_until("card cleaned", || {
        ctx.card_table().state(card) == CardState::Clean
    });
    assert!(ctx.rem_set(owner).contains(card));
    drop(refine);
}
