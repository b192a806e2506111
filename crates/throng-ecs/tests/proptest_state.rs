//! Property tests for entity and row storage.
//!
//! Random sequences of create/destroy operations are replayed against a
//! simple model and the state manager's invariants are checked after every
//! step.

use std::collections::HashMap;

use proptest::prelude::*;
use throng_ecs::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Mass(u32);

#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Pos {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone)]
enum StateOp {
    MakeA(u32, u32),
    MakeB(u32),
    Destroy(usize),
    Clear,
}

fn state_op_strategy() -> impl Strategy<Value = StateOp> {
    prop_oneof![
        4 => (0..4u32, any::<u32>()).prop_map(|(w, m)| StateOp::MakeA(w, m)),
        3 => (0..4u32).prop_map(StateOp::MakeB),
        2 => (0..64usize).prop_map(StateOp::Destroy),
        1 => Just(StateOp::Clear),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn random_ops_preserve_invariants(ops in prop::collection::vec(state_op_strategy(), 1..80)) {
        let config = StateConfig {
            num_worlds: 4,
            max_rows_per_table: 256,
            max_entities: 256,
            ..StateConfig::default()
        };
        let mut state = StateManager::new(config).unwrap();
        let mass = state.register_component_type::<Mass>().unwrap();
        let pos = state.register_component_type::<Pos>().unwrap();
        let a = state.register_archetype(&[mass, pos]).unwrap();
        let b = state.register_archetype(&[pos]).unwrap();

        let mut live: Vec<(Entity, u32, Option<u32>)> = Vec::new();
        let mut dead: Vec<Entity> = Vec::new();
        let mut rows: HashMap<ArchetypeId, u32> = HashMap::new();

        for op in ops {
            match op {
                StateOp::MakeA(w, m) => {
                    let e = state.make_entity(a, WorldId(w)).unwrap();
                    state.set_component(e, mass, Mass(m)).unwrap();
                    *rows.entry(a).or_default() += 1;
                    live.push((e, w, Some(m)));
                }
                StateOp::MakeB(w) => {
                    let e = state.make_entity(b, WorldId(w)).unwrap();
                    *rows.entry(b).or_default() += 1;
                    live.push((e, w, None));
                }
                StateOp::Destroy(i) => {
                    if !live.is_empty() {
                        let (e, _, _) = live.remove(i % live.len());
                        prop_assert!(state.destroy_entity(e));
                        dead.push(e);
                    }
                }
                StateOp::Clear => {
                    // Rows are dropped, so every entity living in them goes too.
                    for (e, _, _) in live.drain(..) {
                        prop_assert!(state.destroy_entity(e));
                        dead.push(e);
                    }
                    state.clear_temporaries(a).unwrap();
                    state.clear_temporaries(b).unwrap();
                    rows.clear();
                }
            }

            prop_assert_eq!(state.num_entities(), live.len());
            prop_assert_eq!(state.num_rows(a).unwrap(), rows.get(&a).copied().unwrap_or(0));
            prop_assert_eq!(state.num_rows(b).unwrap(), rows.get(&b).copied().unwrap_or(0));

            for &(e, w, m) in &live {
                prop_assert!(state.is_valid(e));
                prop_assert_eq!(state.get_component::<Entity>(e, ComponentId::ENTITY).unwrap(), e);
                prop_assert_eq!(
                    state.get_component::<WorldId>(e, ComponentId::WORLD_ID).unwrap(),
                    WorldId(w)
                );
                match m {
                    Some(m) => prop_assert_eq!(state.get_component::<Mass>(e, mass).unwrap(), Mass(m)),
                    None => prop_assert!(state.get_component::<Mass>(e, mass).is_err()),
                }
            }
            for &e in &dead {
                prop_assert!(!state.is_valid(e));
            }
        }
    }

    #[test]
    fn concurrent_row_allocation_partitions_rows(
        threads in 1..8usize,
        per_thread in 1..64u32,
    ) {
        let config = StateConfig {
            num_worlds: 3,
            max_rows_per_table: 1024,
            ..StateConfig::default()
        };
        let mut state = StateManager::new(config).unwrap();
        let mass = state.register_component_type::<Mass>().unwrap();
        let arch = state.register_archetype(&[mass]).unwrap();
        let table = state.archetype(arch).unwrap().table();

        let mut all: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| s.spawn(|| {
                    (0..per_thread).map(|_| table.alloc_row().unwrap()).collect::<Vec<_>>()
                }))
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        all.sort_unstable();
        let expected: Vec<u32> = (0..threads as u32 * per_thread).collect();
        prop_assert_eq!(all, expected);
        prop_assert_eq!(table.num_rows(), threads as u32 * per_thread);
    }
}
