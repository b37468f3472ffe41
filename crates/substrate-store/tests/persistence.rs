//! A tenant's engine survives a restart through its on-disk database.

use substrate_core::{
    AsOf, EdgeSpec, EngineConfig, EngineInstance, NodeId, NodeSpec, ProposalOutcome,
};
use substrate_store::TenantDirectory;

#[test]
fn engine_resumes_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = TenantDirectory::new(Some(tmp.path()));

    let (ids, v, tick, energy) = {
        let store = dir.open("dana").unwrap();
        let mut engine = EngineInstance::new("dana", EngineConfig::default());
        let ids: Vec<NodeId> = (0..4)
            .map(|i| {
                engine
                    .upsert_node(NodeSpec::new(format!("k{i}")), None, 0)
                    .unwrap()
            })
            .collect();
        for pair in ids.windows(2) {
            engine
                .upsert_edge(EdgeSpec::new(pair[0], pair[1], 0.7), None, 0)
                .unwrap();
        }
        let ProposalOutcome::Created(v) = engine.propose_entity("chain", &ids, 0).unwrap() else {
            panic!("expected create");
        };
        engine.inject_energy(v, ids[0], 0.9, "test", 0).unwrap();
        let setup = engine.drain();
        store.commit(&engine.state(), &setup).unwrap();

        let mut now = 0;
        for _ in 0..3 {
            now = engine.schedule(now).due_at;
            let report = engine.run_tick(now).unwrap();
            store.commit(&engine.state(), &report.batch).unwrap();
        }
        let energy = engine.graph().node(ids[1]).unwrap().energy(v);
        (ids, v, engine.tick_count(), energy)
    };

    let store = dir.open("dana").unwrap();
    let engine = EngineInstance::restore(EngineConfig::default(), store.load_partition().unwrap());
    assert_eq!(engine.tenant(), "dana");
    assert_eq!(engine.tick_count(), tick);
    assert!(energy > 0.0);
    assert_eq!(engine.graph().node(ids[1]).unwrap().energy(v), energy);
    assert!(engine.registry().get(v).unwrap().is_live());

    // the restored partition keeps allocating fresh ids
    let mut engine = engine;
    let fresh = engine.upsert_node(NodeSpec::new("new"), None, 1).unwrap();
    assert!(!ids.contains(&fresh));

    assert_eq!(
        store.get_node_as_of(ids[0], AsOf::at(0)).unwrap().map(|n| n.key),
        Some("k0".to_string())
    );
    assert_eq!(store.deltas_since(0).unwrap().iter().map(|(t, _)| *t).max(), Some(tick));
}
