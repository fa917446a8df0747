//! Invariant checks over states reachable through the public API,
//! driven by seeded randomized workloads.

use merkle_refs::{Flags, Hash, IterAction, MemoryPack, Pack, Refs, RootRecord};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn h(seed: u8) -> Hash {
    Hash::digest(&[seed])
}

fn hashes(n: u8) -> Vec<Hash> {
    (0..n).map(h).collect()
}

/// Collect the full element sequence by ascending.
fn sequence<P: merkle_refs::Pack>(refs: &mut Refs, pack: &P) -> Vec<Hash> {
    let mut out = Vec::new();
    refs.ascend(pack, |_, _, hash| {
        out.push(hash);
        Ok(IterAction::Continue)
    })
    .unwrap();
    out
}

/// Apply a seeded random workload of appends, sets and deletes while
/// mirroring it against a plain Vec model.
fn random_workload(pack: &MemoryPack, degree: usize, seed: u64, steps: usize) -> (Refs, Vec<Hash>) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut refs = Refs::with_degree(degree);
    let mut model: Vec<Hash> = Vec::new();

    for _ in 0..steps {
        match rng.gen_range(0..4u8) {
            0 => {
                let count = rng.gen_range(1..6u8);
                let batch: Vec<Hash> = (0..count).map(|_| h(rng.gen())).collect();
                refs.append_hashes(pack, &batch).unwrap();
                model.extend_from_slice(&batch);
            }
            1 if !model.is_empty() => {
                let i = rng.gen_range(0..model.len());
                refs.delete_by_index(pack, i).unwrap();
                model.remove(i);
            }
            2 if !model.is_empty() => {
                let i = rng.gen_range(0..model.len());
                let hash = h(rng.gen());
                refs.set_hash_by_index(pack, i, hash).unwrap();
                model[i] = hash;
            }
            _ => {
                let hash = h(rng.gen());
                refs.append_hashes(pack, &[hash]).unwrap();
                model.push(hash);
            }
        }
    }
    (refs, model)
}

/// Length conservation: the reported length always equals the number of
/// elements a traversal yields, and every index resolves.
#[test]
fn length_conservation_under_random_workload() {
    for seed in 0..4u64 {
        let pack = MemoryPack::new();
        let (mut refs, model) = random_workload(&pack, 3, seed, 60);

        assert_eq!(refs.len(&pack).unwrap(), model.len());
        assert_eq!(sequence(&mut refs, &pack), model);
        for (i, want) in model.iter().enumerate() {
            assert_eq!(refs.hash_by_index(&pack, i).unwrap(), *want);
        }
    }
}

/// Content addressing: the reported root hash names a canonical record
/// describing exactly the current state.
#[test]
fn root_hash_names_current_state() {
    let pack = MemoryPack::new();
    let (mut refs, model) = random_workload(&pack, 4, 7, 50);
    if model.is_empty() {
        return;
    }

    let bytes = pack.get(&refs.hash()).unwrap();
    let record = RootRecord::decode(&bytes).unwrap();
    assert_eq!(record.degree, 4);
    assert_eq!(record.length as usize, model.len());
    assert_eq!(record.depth as usize + 1, refs.depth(&pack).unwrap());
}

/// Round-trip: rehydrating from the root hash reproduces the vector.
#[test]
fn round_trip_through_the_pack() {
    for seed in [3u64, 11, 42] {
        let pack = MemoryPack::new();
        let (mut refs, model) = random_workload(&pack, 3, seed, 40);

        let mut fresh = Refs::from_hash(refs.hash());
        assert_eq!(fresh.len(&pack).unwrap(), model.len());
        assert_eq!(sequence(&mut fresh, &pack), model);
        assert_eq!(fresh.hash(), refs.hash());
        assert_eq!(fresh.degree(&pack).unwrap(), refs.degree(&pack).unwrap());
        assert_eq!(fresh.depth(&pack).unwrap(), refs.depth(&pack).unwrap());
    }
}

/// Determinism: the same mutation applied to the original and to a
/// rehydrated copy produces the same root hash.
#[test]
fn identical_mutations_converge() {
    let pack = MemoryPack::new();
    let mut refs = Refs::with_degree(4);
    refs.append_hashes(&pack, &hashes(20)).unwrap();

    let mut copy = Refs::from_hash(refs.hash());
    refs.delete_by_index(&pack, 9).unwrap();
    copy.delete_by_index(&pack, 9).unwrap();
    assert_eq!(refs.hash(), copy.hash());

    refs.append_hashes(&pack, &[h(99)]).unwrap();
    copy.append_hashes(&pack, &[h(99)]).unwrap();
    assert_eq!(refs.hash(), copy.hash());
}

/// Ascend and descend visit the same elements at mirrored indices.
#[test]
fn ascend_descend_symmetry() {
    let pack = MemoryPack::new();
    let (mut refs, model) = random_workload(&pack, 5, 13, 60);

    let mut up = Vec::new();
    refs.ascend(&pack, |_, i, hash| {
        up.push((i, hash));
        Ok(IterAction::Continue)
    })
    .unwrap();
    let mut down = Vec::new();
    refs.descend(&pack, |_, i, hash| {
        down.push((i, hash));
        Ok(IterAction::Continue)
    })
    .unwrap();

    let expected_up: Vec<(usize, Hash)> = model.iter().copied().enumerate().collect();
    assert_eq!(up, expected_up);
    down.reverse();
    assert_eq!(down, expected_up);
}

/// Rebuild idempotence: a second rebuild is a no-op on the root hash.
#[test]
fn rebuild_twice_is_stable() {
    let pack = MemoryPack::new();
    let (mut refs, model) = random_workload(&pack, 3, 21, 50);

    refs.rebuild(&pack).unwrap();
    let first = refs.hash();
    refs.rebuild(&pack).unwrap();
    assert_eq!(refs.hash(), first);
    assert_eq!(sequence(&mut refs, &pack), model);
}

/// Index fidelity: with the hash index on, every live element is
/// reachable through it and deleted elements never appear.
#[test]
fn index_matches_tree_exactly() {
    let pack = MemoryPack::with_flags(Flags::HASH_TABLE_INDEX);
    let (mut refs, model) = random_workload(&pack, 3, 33, 60);

    for (i, hash) in model.iter().enumerate() {
        assert!(refs.has_hash(&pack, hash).unwrap());
        let indices = refs.indices_by_hash(&pack, hash).unwrap();
        assert!(indices.contains(&i));
        for &j in &indices {
            assert_eq!(refs.hash_by_index(&pack, j).unwrap(), *hash);
        }
    }
}

/// The lazy, eager and indexed initializations agree on a randomly
/// built vector.
#[test]
fn initialization_policies_agree() {
    let seed_pack = MemoryPack::new();
    let (built, model) = random_workload(&seed_pack, 3, 55, 60);
    let root = built.hash();

    let mut roots = Vec::new();
    for flags in [Flags::NONE, Flags::ENTIRE_REFS, Flags::HASH_TABLE_INDEX] {
        let pack = seed_pack.view_with_flags(flags);
        let mut view = Refs::from_hash(root);
        assert_eq!(sequence(&mut view, &pack), model);
        roots.push(view.hash());
    }
    assert!(roots.iter().all(|r| *r == root));
}

/// A full-range slice of a compact vector reproduces its root hash.
#[test]
fn full_slice_of_compact_vector_is_identical() {
    let pack = MemoryPack::new();
    let mut refs = Refs::with_degree(4);
    refs.append_hashes(&pack, &hashes(23)).unwrap();

    let length = refs.len(&pack).unwrap();
    let cut = refs.slice(&pack, 0, length).unwrap();
    assert_eq!(cut.hash(), refs.hash());
}

/// Appending one vector to another matches appending the raw sequence.
#[test]
fn append_refs_matches_append_hashes() {
    let pack = MemoryPack::new();
    let mut left = Refs::with_degree(4);
    left.append_hashes(&pack, &hashes(9)).unwrap();
    let mut right = Refs::with_degree(4);
    right.append_hashes(&pack, &[h(30), h(31), h(32)]).unwrap();

    let mut joined = Refs::with_degree(4);
    joined.append_hashes(&pack, &hashes(9)).unwrap();
    joined
        .append_hashes(&pack, &[h(30), h(31), h(32)])
        .unwrap();

    left.append_refs(&pack, &mut right).unwrap();
    assert_eq!(left.hash(), joined.hash());
}

/// Deleting a range is equivalent to deleting its indices one by one.
#[test]
fn delete_slice_matches_individual_deletes() {
    let pack = MemoryPack::new();
    let mut ranged = Refs::with_degree(3);
    ranged.append_hashes(&pack, &hashes(20)).unwrap();
    let mut single = Refs::with_degree(3);
    single.append_hashes(&pack, &hashes(20)).unwrap();

    ranged.delete_slice_by_indices(&pack, 5, 12).unwrap();
    for i in (5..12).rev() {
        single.delete_by_index(&pack, i).unwrap();
    }

    assert_eq!(ranged.len(&pack).unwrap(), 13);
    assert_eq!(
        sequence(&mut ranged, &pack),
        sequence(&mut single, &pack)
    );
    assert_eq!(ranged.hash(), single.hash());
}
