use std::collections::HashMap;

use radixjoin::{
    DataGen, Error, JoinConfig, Materialized, OutputShape, OutputTriple, PartitionAlgorithm,
    QueueKind, Row, Table, run_join,
};

/// R = keys 0..999 with payload = key, S[i].key = i % 1000 with payload i.
fn scenario_a() -> (Table, Table) {
    let r = Table::from_pairs((0..1000).map(|k| (k, k)));
    let s = Table::from_pairs((0..2000).map(|i| (i % 1000, i)));
    (r, s)
}

fn scenario_a_config() -> JoinConfig {
    JoinConfig::default()
        .with_nthreads(4)
        .with_radix_bits(Some(4))
}

/// Every variant of the pipeline a caller can select.
fn variants(base: JoinConfig) -> Vec<JoinConfig> {
    let mut out = Vec::new();
    for partition in [PartitionAlgorithm::Scalar, PartitionAlgorithm::WriteCombining] {
        for queue in [QueueKind::LockFree, QueueKind::Mutex] {
            for two_passes in [false, true] {
                out.push(
                    base.clone()
                        .with_partition(partition)
                        .with_queue(queue)
                        .with_force_two_passes(two_passes),
                );
            }
        }
    }
    out
}

fn expected_matches(r: &Table, s: &Table) -> u64 {
    let mut counts: HashMap<u32, u64> = HashMap::new();
    for row in &r.rows {
        *counts.entry(row.key).or_default() += 1;
    }
    s.rows.iter().map(|row| counts.get(&row.key).copied().unwrap_or(0)).sum()
}

fn sorted_triples(output: Materialized) -> Vec<OutputTriple> {
    let mut triples = output.into_triples();
    triples.sort_unstable();
    triples
}

#[test]
fn scenario_a_counts_every_match() {
    let (r, s) = scenario_a();
    for config in variants(scenario_a_config()) {
        for algorithm in ["RHO", "RHT"] {
            let result = run_join(&r, &s, algorithm, &config).unwrap();
            assert_eq!(result.total_matches, 2000, "{algorithm} {config:?}");
            assert_eq!(result.nthreads, 4);
            assert_eq!(result.per_thread.len(), 4);
            assert_eq!(result.plan.radix_bits, 4);
            assert!(matches!(result.output, Materialized::None));
        }
    }
}

#[test]
fn scenario_b_empty_build_side() {
    let r = Table::default();
    let s = Table::from_pairs((0..100).map(|i| (i, i)));
    for config in variants(scenario_a_config()) {
        for algorithm in ["RHO", "RHT"] {
            let config = config.clone().with_materialize(true);
            let result = run_join(&r, &s, algorithm, &config).unwrap();
            assert_eq!(result.total_matches, 0);
            assert!(result.output.is_empty());
        }
    }
}

#[test]
fn empty_probe_side_and_single_rows() {
    let one = Table::from_pairs([(7, 1)]);
    let config = JoinConfig::default().with_nthreads(3);
    assert_eq!(
        run_join(&one, &Table::default(), "RHO", &config).unwrap().total_matches,
        0
    );
    assert_eq!(run_join(&one, &one, "RHT", &config).unwrap().total_matches, 1);
}

#[test]
fn scenario_c_materialized_triples() {
    let (r, s) = scenario_a();
    let shapes = [
        OutputShape::LinkedList,
        OutputShape::Chunked { prealloc: false },
        OutputShape::Chunked { prealloc: true },
    ];
    for shape in shapes {
        for algorithm in ["RHO", "RHT"] {
            let config = scenario_a_config().with_materialize(true).with_output(shape);
            let result = run_join(&r, &s, algorithm, &config).unwrap();
            assert_eq!(result.total_matches, 2000);

            match (&result.output, shape) {
                (Materialized::LinkedLists(lists), OutputShape::LinkedList) => {
                    assert_eq!(lists.len(), 4);
                    for (t, stats) in lists.iter().zip(&result.per_thread) {
                        assert_eq!(t.thread_id, stats.thread_id);
                        assert_eq!(t.matches, stats.matches);
                        assert_eq!(t.list.len() as u64, t.matches);
                    }
                }
                (Materialized::Chunked(table), OutputShape::Chunked { .. }) => {
                    assert_eq!(table.len(), 2000);
                }
                _ => panic!("output shape does not match {shape:?}"),
            }
            assert_eq!(result.output.len(), 2000);

            let triples = result.output.into_triples();
            assert_eq!(triples.len(), 2000);
            let mut s_payloads: Vec<u32> = triples.iter().map(|t| t.s_payload).collect();
            s_payloads.sort_unstable();
            assert!(s_payloads.into_iter().eq(0..2000));
            for t in &triples {
                assert_eq!(t.key, t.r_payload);
                assert_eq!(t.key, t.s_payload % 1000);
            }
        }
    }
}

#[test]
fn rerun_is_idempotent() {
    let mut data = DataGen::new(5);
    let r = data.foreign_keys(5_000, 1_000);
    let s = data.foreign_keys(20_000, 1_500);
    for algorithm in ["RHO", "RHT"] {
        let config = JoinConfig::default()
            .with_nthreads(1)
            .with_materialize(true)
            .with_output(OutputShape::LinkedList);
        let first = run_join(&r, &s, algorithm, &config).unwrap();
        let second = run_join(&r, &s, algorithm, &config).unwrap();
        assert_eq!(first.total_matches, second.total_matches);
        assert_eq!(first.total_matches, expected_matches(&r, &s));
        assert_eq!(sorted_triples(first.output), sorted_triples(second.output));
    }
}

#[test]
fn padding_is_never_joined() {
    // One R row and 64 S rows carry the fill key. The real pairs give 64
    // extra matches; a kernel reading padding on either side would add more.
    let mut r_rows: Vec<Row> = (0..1000).map(|k| Row::new(k, k)).collect();
    r_rows.push(Row::new(Row::FILL.key, 9000));
    let r = Table::new(r_rows);
    let mut s_rows: Vec<Row> = (0..2000).map(|i| Row::new(i % 1000, i)).collect();
    s_rows.extend((0..64).map(|i| Row::new(Row::FILL.key, 5000 + i)));
    let s = Table::new(s_rows);

    for config in variants(scenario_a_config().with_prefault(true)) {
        for algorithm in ["RHO", "RHT"] {
            let counted = run_join(&r, &s, algorithm, &config).unwrap();
            assert_eq!(counted.total_matches, 2064, "{algorithm} {config:?}");

            let config = config.clone().with_materialize(true);
            let result = run_join(&r, &s, algorithm, &config).unwrap();
            assert_eq!(result.total_matches, 2064, "{algorithm} {config:?}");
            let mut fill_matches = 0;
            result.output.for_each(|t| {
                if t.key == Row::FILL.key {
                    assert_eq!(t.r_payload, 9000);
                    assert!((5000..5064).contains(&t.s_payload));
                    fill_matches += 1;
                } else {
                    assert_ne!(t.r_payload, Row::FILL.payload);
                }
            });
            assert_eq!(fill_matches, 64);
        }
    }
}

#[test]
fn kernels_agree_on_generated_data() {
    let mut data = DataGen::new(77);
    let r = data.primary_keys(50_000);
    let cases = [
        data.foreign_keys(200_000, 50_000),
        data.foreign_keys_selectivity(100_000, 50_000, 30),
        data.zipf_keys(100_000, 50_000, 0.9),
    ];
    for s in &cases {
        let expected = expected_matches(&r, s);
        for config in variants(JoinConfig::default().with_nthreads(4)) {
            let rho = run_join(&r, s, "RHO", &config).unwrap();
            let rht = run_join(&r, s, "RHT", &config).unwrap();
            assert_eq!(rho.total_matches, expected);
            assert_eq!(rht.total_matches, expected);
        }
    }
}

#[test]
fn sorted_inputs_and_duplicate_build_keys() {
    let r = DataGen::new(1).sorted(true).foreign_keys(30_000, 10_000);
    let s = DataGen::new(2).sorted(true).foreign_keys(60_000, 12_000);
    let expected = expected_matches(&r, &s);
    let config = JoinConfig::default().with_nthreads(3).with_radix_bits(Some(7));
    assert_eq!(run_join(&r, &s, "RHO", &config).unwrap().total_matches, expected);
    assert_eq!(run_join(&r, &s, "RHT", &config).unwrap().total_matches, expected);
}

#[test]
fn automatic_two_pass_plan() {
    let r = DataGen::new(3).primary_keys(20_000);
    let s = DataGen::new(4).foreign_keys(40_000, 20_000);
    // 14 bits exceed the single-pass histogram limit.
    let config = JoinConfig::default().with_nthreads(2).with_radix_bits(Some(14));
    let result = run_join(&r, &s, "RHO", &config).unwrap();
    assert_eq!(result.plan.num_passes, 2);
    assert_eq!(result.total_matches, 40_000);
    let split: usize = result.per_thread.iter().map(|t| t.parts_partitioned).sum();
    assert_eq!(split, 128);
}

#[test]
fn more_threads_than_rows() {
    let r = Table::from_pairs([(1, 1), (2, 2), (3, 3)]);
    let s = Table::from_pairs([(3, 0), (1, 1), (9, 2)]);
    let config = JoinConfig::default().with_nthreads(8);
    let result = run_join(&r, &s, "RHO", &config).unwrap();
    assert_eq!(result.total_matches, 2);
    assert!(result.plan.fanout() >= 8);
}

#[test]
fn timers_and_throughput_are_reported() {
    let (r, s) = scenario_a();
    let result = run_join(&r, &s, "RHO", &scenario_a_config()).unwrap();
    let t = result.timers;
    assert!(t.total >= t.join);
    assert!(t.total >= t.partition);
    assert!(t.partition >= t.pass_1);
    assert!(result.throughput >= 0.0);
    for stats in &result.per_thread {
        assert!(stats.timers.total <= t.total);
        assert_eq!(
            stats.timers.partition_r + stats.timers.partition_s,
            stats.timers.pass_1
        );
    }
    let joined: usize = result.per_thread.iter().map(|t| t.parts_joined).sum();
    assert_eq!(joined, 16);
}

#[test]
fn unknown_algorithm() {
    let (r, s) = scenario_a();
    match run_join(&r, &s, "NPO", &JoinConfig::default()) {
        Err(Error::UnknownAlgorithm(name)) => assert_eq!(name, "NPO"),
        other => panic!("unexpected {:?}", other.map(|r| r.total_matches)),
    }
}
