mod fixtures;

use fixtures::*;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

use bloomgen::tokenizer::chunk_token_key;
use bloomgen::{
    Block, Bloom, BloomError, CancellationToken, ChunkRef, DirectoryBlockStorage,
    GeneratorConfig, GeneratorEvent, GeneratorState, Result, Series, SeriesWithBloom,
    SimpleBloomGenerator, StatsHandle,
};

fn assert_ordered_and_disjoint(blocks: &[Block]) {
    let mut last: Option<u64> = None;
    for block in blocks {
        for entry in block.querier().unwrap() {
            let fp = entry.unwrap().fingerprint();
            if let Some(prev) = last {
                assert!(fp > prev, "{} does not follow {}", fp, prev);
            }
            last = Some(fp);
        }
    }
}

#[test]
fn test_skips_incompatible_schemas() {
    let (source_blocks, data) = blocks_from_schema(2, opts(3, LARGE_BLOCK));
    let loader = Arc::new(CountingChunkLoader::default());
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        series_stream(&data),
        source_blocks,
        loader.clone(),
        GeneratorConfig::default(),
    );

    let (skipped, blocks) = run_to_completion(gen);
    assert_eq!(skipped.len(), 2);
    assert_eq!(blocks.len(), 1);

    let out = collect_entries(&blocks);
    assert_eq!(out.len(), data.len());
    for (expected, got) in data.iter().zip(&out) {
        assert_eq!(expected.series, got.series);
    }
    // Every series was rebuilt from its chunk.
    assert_eq!(loader.calls(), 100);
    assert!(out[0].bloom.test(b"time"));
}

#[test]
fn test_combines_blocks() {
    let (source_blocks, data) = blocks_from_schema(2, opts(4, LARGE_BLOCK));
    let loader = Arc::new(CountingChunkLoader::default());
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        series_stream(&data),
        source_blocks,
        loader.clone(),
        GeneratorConfig::default(),
    );

    let (skipped, blocks) = run_to_completion(gen);
    assert!(skipped.is_empty());
    assert_eq!(blocks.len(), 1);

    let out = collect_entries(&blocks);
    assert_eq!(out, data, "blooms must be reused verbatim");
    assert_eq!(loader.calls(), 0);
}

#[test]
fn test_max_block_size() {
    let (source_blocks, data) = blocks_from_schema(2, opts(4, LARGE_BLOCK));
    let gen = dummy_bloom_gen(
        opts(4, 1 << 10),
        series_stream(&data),
        source_blocks,
        Arc::new(DummyChunkLoader),
        GeneratorConfig::default(),
    );

    let (skipped, blocks) = run_to_completion(gen);
    assert!(skipped.is_empty());
    assert_eq!(blocks.len(), 3);
    for block in &blocks {
        assert!(block.payload_size().unwrap() <= 1 << 10);
        assert_eq!(block.options().unwrap(), opts(4, 1 << 10));
    }

    let out = collect_entries(&blocks);
    assert_eq!(out, data);
    assert_ordered_and_disjoint(&blocks);
}

#[test]
fn test_skipped_list_preserves_input_order() {
    let (old, data) = blocks_from_schema(4, opts(3, LARGE_BLOCK));
    let (current, _) = blocks_from_schema(4, opts(4, LARGE_BLOCK));
    let sources = vec![
        old[0].clone(),
        current[1].clone(),
        old[2].clone(),
        current[3].clone(),
    ];
    let listener = Arc::new(RecordingListener::default());
    let loader = Arc::new(CountingChunkLoader::default());
    let config = GeneratorConfig {
        event_listener: listener.clone(),
        ..GeneratorConfig::default()
    };
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        series_stream(&data),
        sources,
        loader.clone(),
        config,
    );

    let (skipped, blocks) = run_to_completion(gen);
    assert_eq!(skipped.len(), 2);
    assert!(skipped[0].ptr_eq(&old[0]));
    assert!(skipped[1].ptr_eq(&old[2]));

    // Only the series covered by skipped blocks were rebuilt.
    assert_eq!(loader.calls(), 50);
    let out = collect_entries(&blocks);
    assert_eq!(out.len(), 100);
    assert_eq!(out[25..50], data[25..50]);
    assert_eq!(out[75..], data[75..]);

    let skipped_positions: Vec<usize> = listener
        .events()
        .into_iter()
        .filter_map(|e| match e {
            GeneratorEvent::BlockSkipped { position, .. } => Some(position),
            _ => None,
        })
        .collect();
    assert_eq!(skipped_positions, vec![0, 2]);
}

#[test]
fn test_overlapping_donors_are_unioned() {
    let data = mk_basic_series_with_blooms(100, 0, 0xffff);
    // A second block re-indexes series 40..60 with extra content.
    let extra: Vec<SeriesWithBloom> = data[40..60]
        .iter()
        .map(|e| {
            let mut bloom = Bloom::with_capacity(4, 0.01);
            bloom.insert(format!("extra-{}", e.fingerprint()).as_bytes());
            SeriesWithBloom::new(e.series.clone(), bloom)
        })
        .collect();
    let sources = vec![
        build_block(opts(4, LARGE_BLOCK), &data),
        build_block(opts(4, LARGE_BLOCK), &extra),
    ];
    let loader = Arc::new(CountingChunkLoader::default());
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        series_stream(&data),
        sources,
        loader.clone(),
        GeneratorConfig::default(),
    );

    let (_, blocks) = run_to_completion(gen);
    let out = collect_entries(&blocks);
    assert_eq!(out.len(), 100);
    assert_eq!(loader.calls(), 0);
    for (i, entry) in out.iter().enumerate() {
        let fp = entry.fingerprint();
        assert!(entry.bloom.test(format!("series-{}-key-0", fp).as_bytes()));
        let has_extra = entry.bloom.test(format!("extra-{}", fp).as_bytes());
        if (40..60).contains(&i) {
            assert!(has_extra, "series {} lost the second donor's bloom", fp);
        }
    }
}

#[test]
fn test_tops_up_chunks_missing_from_reused_blooms() {
    let (source_blocks, data) = blocks_from_schema(2, opts(4, LARGE_BLOCK));
    let new_chunk = |fp: u64| ChunkRef::new(20_000, 30_000, fp as u32 + 1);
    let stream: Vec<Result<Series>> = data
        .iter()
        .map(|e| {
            let mut chunks = e.series.chunks.clone();
            chunks.push(new_chunk(e.fingerprint()));
            Ok(Series::new(e.fingerprint(), chunks))
        })
        .collect();

    let loader = Arc::new(CountingChunkLoader::default());
    let stats = StatsHandle::new();
    let config = GeneratorConfig {
        stats: stats.clone(),
        ..GeneratorConfig::default()
    };
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        stream.into_iter(),
        source_blocks,
        loader.clone(),
        config,
    );
    let (_, blocks) = run_to_completion(gen);
    let out = collect_entries(&blocks);

    // Exactly one chunk per series was fetched: the one no source block covered.
    assert_eq!(loader.calls(), 100);
    assert_eq!(loader.chunks(), 100);
    for (fp, chunks) in loader.requested.lock().unwrap().iter() {
        assert_eq!(chunks, &vec![new_chunk(*fp)]);
    }
    for entry in &out {
        let fp = entry.fingerprint();
        assert_eq!(entry.series.chunks.len(), 2);
        assert!(entry.bloom.test(format!("series-{}-key-3", fp).as_bytes()));
        assert!(entry.bloom.test(&chunk_token_key(&new_chunk(fp), "time")));
    }

    let s = stats.get().unwrap();
    assert_eq!(s.chunks_requested(), 200);
    assert_eq!(s.chunks_filtered(), 100);
    assert_eq!(s.filter_ratio(), 0.5);
}

#[test]
fn test_batched_and_sequential_runs_agree() {
    let data = mk_basic_series_with_blooms(100, 0, 0xffff);
    let run = |batch: usize| {
        let config = GeneratorConfig {
            load_batch_size: batch,
            ..GeneratorConfig::default()
        };
        let gen = dummy_bloom_gen(
            opts(4, 2048),
            series_stream(&data),
            Vec::new(),
            Arc::new(CountingChunkLoader::default()),
            config,
        );
        let (_, blocks) = run_to_completion(gen);
        (blocks.len(), collect_entries(&blocks))
    };

    let sequential = run(1);
    assert_eq!(sequential.1.len(), 100);
    assert_eq!(run(7), sequential);
    assert_eq!(run(64), sequential);
}

#[test]
fn test_cancellation_stops_the_run() {
    let (source_blocks, data) = blocks_from_schema(2, opts(3, LARGE_BLOCK));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);
    let stream = series_stream(&data).inspect(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 50 {
            trigger.cancel();
        }
    });

    let listener = Arc::new(RecordingListener::default());
    let config = GeneratorConfig {
        load_batch_size: 1,
        event_listener: listener.clone(),
        ..GeneratorConfig::default()
    };
    let gen = dummy_bloom_gen(
        opts(4, 1 << 10),
        stream,
        source_blocks,
        Arc::new(DummyChunkLoader),
        config,
    );
    let (_, mut results) = gen.generate(cancel).unwrap();

    let mut finalized = 0;
    let err = loop {
        match results.next() {
            Some(Ok(_)) => finalized += 1,
            Some(Err(e)) => break e,
            None => panic!("run completed despite cancellation"),
        }
    };
    assert!(matches!(err, BloomError::Cancelled));
    assert!(results.next().is_none());
    assert_eq!(results.state(), GeneratorState::Failed);
    // Nothing is pulled after the signal is observed.
    assert_eq!(pulled.load(Ordering::SeqCst), 50);
    assert!(finalized < 3);
    assert!(listener
        .events()
        .contains(&GeneratorEvent::GenerationCancelled { series: 50 }));
}

#[test]
fn test_cancelled_before_start_builds_nothing() {
    let data = mk_basic_series_with_blooms(10, 0, 1000);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        series_stream(&data),
        Vec::new(),
        Arc::new(DummyChunkLoader),
        GeneratorConfig::default(),
    );
    let (_, mut results) = gen.generate(cancel).unwrap();
    assert!(matches!(results.next(), Some(Err(BloomError::Cancelled))));
    assert!(results.next().is_none());
    assert_eq!(results.blocks_finalized(), 0);
}

#[test]
fn test_chunk_load_failure_aborts_the_run() {
    let data = mk_basic_series_with_blooms(100, 0, 0xffff);
    let fail_on = data[42].fingerprint();
    let listener = Arc::new(RecordingListener::default());
    let config = GeneratorConfig {
        event_listener: listener.clone(),
        ..GeneratorConfig::default()
    };
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        series_stream(&data),
        Vec::new(),
        Arc::new(FailingChunkLoader { fail_on }),
        config,
    );
    let (_, mut results) = gen.generate(CancellationToken::new()).unwrap();

    match results.next() {
        Some(Err(BloomError::ChunkLoad { fingerprint, .. })) => assert_eq!(fingerprint, fail_on),
        other => panic!("expected a chunk load error, got {:?}", other),
    }
    assert!(results.next().is_none());
    assert_eq!(results.state(), GeneratorState::Failed);
    assert!(listener
        .events()
        .iter()
        .any(|e| matches!(e, GeneratorEvent::GenerationFailed { .. })));
}

#[test]
fn test_unordered_series_stream_is_rejected() {
    let data = mk_basic_series_with_blooms(10, 0, 1000);
    let mut stream: Vec<Result<Series>> = series_stream(&data).collect();
    stream.swap(4, 5);
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        stream.into_iter(),
        Vec::new(),
        Arc::new(DummyChunkLoader),
        GeneratorConfig::default(),
    );
    let (_, results) = gen.generate(CancellationToken::new()).unwrap();
    let res: Result<Vec<Block>> = results.collect();
    assert!(matches!(
        res,
        Err(BloomError::OrderingViolation {
            stream: "series stream",
            ..
        })
    ));
}

#[test]
fn test_upstream_stream_errors_are_fatal() {
    let data = mk_basic_series_with_blooms(10, 0, 1000);
    let mut stream: Vec<Result<Series>> = series_stream(&data).collect();
    stream[3] = Err(BloomError::Internal("index gateway timeout".to_string()));
    let gen = dummy_bloom_gen(
        opts(4, LARGE_BLOCK),
        stream.into_iter(),
        Vec::new(),
        Arc::new(DummyChunkLoader),
        GeneratorConfig::default(),
    );
    let (_, results) = gen.generate(CancellationToken::new()).unwrap();
    let res: Result<Vec<Block>> = results.collect();
    assert!(matches!(res, Err(BloomError::Internal(_))));
}

#[test]
fn test_directory_storage_round_trip() {
    let dir = tempdir().unwrap();
    let data = mk_basic_series_with_blooms(100, 0, 0xffff);

    let gen = SimpleBloomGenerator::new(
        "fake",
        opts(4, 1 << 10),
        series_stream(&data),
        Arc::new(CountingChunkLoader::default()),
        Vec::new(),
        DirectoryBlockStorage::open(dir.path()).unwrap(),
        GeneratorConfig::default(),
    );
    let (_, first_run) = run_to_completion(gen);
    assert!(first_run.len() > 1);

    // A second pass over the persisted blocks reuses every bloom.
    let persisted = DirectoryBlockStorage::open(dir.path())
        .unwrap()
        .existing_blocks()
        .unwrap();
    assert_eq!(persisted.len(), first_run.len());
    let loader = Arc::new(CountingChunkLoader::default());
    let gen = SimpleBloomGenerator::new(
        "fake",
        opts(4, LARGE_BLOCK),
        series_stream(&data),
        loader.clone(),
        persisted,
        DirectoryBlockStorage::open(dir.path().join("compacted")).unwrap(),
        GeneratorConfig::default(),
    );
    let (skipped, second_run) = run_to_completion(gen);
    assert!(skipped.is_empty());
    assert_eq!(second_run.len(), 1);
    assert_eq!(loader.calls(), 0);
    assert_eq!(collect_entries(&second_run), collect_entries(&first_run));
}

#[test]
fn test_generation_emits_lifecycle_events() {
    let (source_blocks, data) = blocks_from_schema(2, opts(4, LARGE_BLOCK));
    let listener = Arc::new(RecordingListener::default());
    let config = GeneratorConfig {
        event_listener: listener.clone(),
        ..GeneratorConfig::default()
    };
    let gen = dummy_bloom_gen(
        opts(4, 1 << 10),
        series_stream(&data),
        source_blocks,
        Arc::new(DummyChunkLoader),
        config,
    );
    run_to_completion(gen);

    let events = listener.events();
    assert!(matches!(
        events.first(),
        Some(GeneratorEvent::QueriersOpened {
            compatible: 2,
            skipped: 0,
            ..
        })
    ));
    let finalized = events
        .iter()
        .filter(|e| matches!(e, GeneratorEvent::BlockFinalized { .. }))
        .count();
    assert_eq!(finalized, 3);
    let reused = events
        .iter()
        .filter(|e| matches!(e, GeneratorEvent::SeriesReused { donors: 1, .. }))
        .count();
    assert_eq!(reused, 100);
    assert!(matches!(
        events.last(),
        Some(GeneratorEvent::GenerationCompleted {
            series: 100,
            blocks: 3,
            ..
        })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 1000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_output_is_complete_ordered_and_bounded(
        partitions in prop::sample::select(vec![1usize, 2, 4, 5, 10]),
        same_schema in any::<bool>(),
        max_block in 128u64..4096,
        batch in 1usize..32,
    ) {
        let source_version = if same_schema { 4 } else { 3 };
        let (source_blocks, data) = blocks_from_schema(partitions, opts(source_version, LARGE_BLOCK));
        let config = GeneratorConfig {
            load_batch_size: batch,
            ..GeneratorConfig::default()
        };
        let gen = dummy_bloom_gen(
            opts(4, max_block),
            series_stream(&data),
            source_blocks,
            Arc::new(DummyChunkLoader),
            config,
        );
        let (skipped, blocks) = run_to_completion(gen);
        prop_assert_eq!(skipped.len(), if same_schema { 0 } else { partitions });

        let out = collect_entries(&blocks);
        prop_assert_eq!(out.len(), data.len());
        for (expected, got) in data.iter().zip(&out) {
            prop_assert_eq!(&expected.series, &got.series);
        }
        for block in &blocks {
            prop_assert!(block.payload_size().unwrap() <= max_block);
            prop_assert!(!block.is_empty().unwrap());
        }
        assert_ordered_and_disjoint(&blocks);
    }
}
