//! End-to-end scenarios against the deterministic tiny model: single
//! sentence, mixed-length batches, cache hits, pivoting and worker-pool
//! shutdown.

mod common;

use skiff::config::Config;
use skiff::response::Options;
use skiff::service::{Async, Blocking};

use common::{init_tracing, tiny_model};

fn tiny_config() -> Config {
    Config {
        encoder_layers: 6,
        decoder_layers: 2,
        num_heads: 8,
        tgt_length_limit_factor: 2.0,
        ..Config::default()
    }
}

#[test]
fn test_single_sentence_greedy() {
    init_tracing();
    let model = tiny_model(tiny_config(), 11);
    let service = Blocking::new(tiny_config()).expect("service");

    let responses = service
        .translate(&model, vec!["1 2".to_string()], &Options::default())
        .expect("translate");

    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert_eq!(response.source.text, "1 2");
    assert_eq!(response.source.sentence_count(), 1);
    assert_eq!(response.target.sentence_count(), 1);
    assert_eq!(response.alignments.len(), 1);

    // Each decoded token carries an alignment distribution over the true
    // source length (2 tokens + EOS), summing to one.
    let source_tokens = response.source.word_count(0);
    assert_eq!(source_tokens, 3);
    for row in &response.alignments[0] {
        assert_eq!(row.len(), source_tokens);
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "alignment row sums to {sum}");
    }

    // Target length respects the limit factor: at most 2 · source tokens.
    assert!(response.target.word_count(0) <= 2 * source_tokens);
}

#[test]
fn test_two_lengths_translate_in_order() {
    let model = tiny_model(tiny_config(), 12);
    let service = Blocking::new(tiny_config()).expect("service");

    // Lengths 3 and 4 after EOS: two buckets, two batches.
    let responses = service
        .translate(
            &model,
            vec!["1 2".to_string(), "1 2 3".to_string()],
            &Options::default(),
        )
        .expect("translate");

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].source.text, "1 2");
    assert_eq!(responses[1].source.text, "1 2 3");
    for response in &responses {
        assert_eq!(response.source.sentence_count(), 1);
        assert_eq!(response.target.sentence_count(), 1);
    }
}

#[test]
fn test_deterministic_outputs_across_calls() {
    let model = tiny_model(tiny_config(), 13);
    let service = Blocking::new(tiny_config()).expect("service");

    let options = Options::default();
    let first = service
        .translate(&model, vec!["4 5 6".to_string()], &options)
        .expect("translate");
    let second = service
        .translate(&model, vec!["4 5 6".to_string()], &options)
        .expect("translate");

    assert_eq!(first[0].target.text, second[0].target.text);
    assert_eq!(first[0].alignments, second[0].alignments);
}

#[test]
fn test_cache_round_trip_matches_fresh_translation() {
    let config = Config {
        cache_size: 128,
        ..tiny_config()
    };
    let model = tiny_model(config.clone(), 14);
    let service = Blocking::new(config).expect("service");

    let options = Options::default();
    let fresh = service
        .translate(&model, vec!["7 8".to_string()], &options)
        .expect("translate");
    // Second submission is answered from the cache before any decoder
    // step runs; histories are the same shared objects, so outputs match
    // exactly.
    let cached = service
        .translate(&model, vec!["7 8".to_string()], &options)
        .expect("translate");

    assert_eq!(fresh[0].target.text, cached[0].target.text);
    assert_eq!(fresh[0].alignments, cached[0].alignments);
}

#[test]
fn test_empty_input_empty_response() {
    let model = tiny_model(tiny_config(), 15);
    let service = Blocking::new(tiny_config()).expect("service");

    let responses = service
        .translate(&model, vec!["   ".to_string()], &Options::default())
        .expect("translate");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].size(), 0);
    assert_eq!(responses[0].target.text, "");
}

#[test]
fn test_multi_sentence_gaps_survive() {
    let model = tiny_model(tiny_config(), 16);
    let service = Blocking::new(tiny_config()).expect("service");

    let responses = service
        .translate(&model, vec!["1 2. 3 4.".to_string()], &Options::default())
        .expect("translate");

    let response = &responses[0];
    assert_eq!(response.source.sentence_count(), 2);
    assert_eq!(response.target.sentence_count(), 2);
    // The inter-sentence whitespace from the source reappears between
    // translated sentences.
    assert_eq!(response.target.gap(1), " ");
}

#[test]
fn test_blocking_pivot_combines_hops() {
    let model = tiny_model(tiny_config(), 17);
    let service = Blocking::new(tiny_config()).expect("service");

    let options = Options {
        alignment: true,
        html: false,
    };
    let responses = service
        .pivot(&model, &model, vec!["1 2. 3 4.".to_string()], &options)
        .expect("pivot");

    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    // Source side belongs to the first hop, target side to the second.
    assert_eq!(response.source.text, "1 2. 3 4.");
    assert_eq!(response.source.sentence_count(), 2);
    assert_eq!(response.target.sentence_count(), 2);
    assert_eq!(response.alignments.len(), 2);

    // Marginalizing the pivot out preserves probability mass.
    for alignment in &response.alignments {
        for row in alignment {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-3, "remapped row sums to {sum}");
        }
    }
}

#[test]
fn test_async_translates_and_reports_progress() {
    let config = Config {
        workers: 2,
        ..tiny_config()
    };
    let model = tiny_model(config.clone(), 18);
    let service = Async::new(config).expect("service");

    let handle = service
        .translate(&model, "1 2 3".to_string(), &Options::default())
        .expect("enqueue");
    assert_eq!(handle.parts(), 1);
    let (_, total_words) = handle.words();
    assert_eq!(total_words, 4); // 3 tokens + EOS

    let response = handle.wait().expect("response");
    assert_eq!(response.source.text, "1 2 3");
    assert_eq!(response.target.sentence_count(), 1);
}

#[test]
fn test_async_pivot_chains_requests() {
    let config = Config {
        workers: 2,
        ..tiny_config()
    };
    let model = tiny_model(config.clone(), 19);
    let service = Async::new(config).expect("service");

    let handle = service
        .pivot(
            &model,
            &model,
            "5 6.".to_string(),
            &Options {
                alignment: true,
                html: false,
            },
        )
        .expect("enqueue");
    assert_eq!(handle.parts(), 2);

    let response = handle.wait().expect("response");
    assert_eq!(response.source.text, "5 6.");
    assert_eq!(response.target.sentence_count(), 1);
    assert_eq!(response.alignments.len(), 1);
}

#[test]
fn test_shutdown_completes_all_pending() {
    let config = Config {
        workers: 4,
        ..tiny_config()
    };
    let model = tiny_model(config.clone(), 20);
    let service = Async::new(config).expect("service");

    let mut handles = Vec::new();
    for i in 0..100 {
        let source = format!("{} {}", i % 9, (i + 1) % 9);
        handles.push(
            service
                .translate(&model, source, &Options::default())
                .expect("enqueue"),
        );
    }

    // Dropping the service shuts the monitor down; workers drain every
    // pending batch before joining, so no handle is left unfulfilled.
    drop(service);

    let mut completed = 0;
    for handle in handles {
        let response = handle.wait().expect("response after shutdown");
        assert_eq!(response.target.sentence_count(), response.source.sentence_count());
        completed += 1;
    }
    assert_eq!(completed, 100);
}

#[tokio::test]
async fn test_handle_is_awaitable() {
    let config = Config {
        workers: 1,
        ..tiny_config()
    };
    let model = tiny_model(config.clone(), 21);
    let service = Async::new(config).expect("service");

    let handle = service
        .translate(&model, "2 3".to_string(), &Options::default())
        .expect("enqueue");
    let response = handle.response().await.expect("await response");
    assert_eq!(response.source.text, "2 3");
}

#[test]
fn test_models_share_one_async_pool() {
    let config = Config {
        workers: 2,
        ..tiny_config()
    };
    let first = tiny_model(config.clone(), 22);
    let second = tiny_model(config.clone(), 23);
    let service = Async::new(config).expect("service");

    let a = service
        .translate(&first, "1 2".to_string(), &Options::default())
        .expect("enqueue");
    let b = service
        .translate(&second, "3 4".to_string(), &Options::default())
        .expect("enqueue");

    assert_eq!(a.wait().expect("first").source.text, "1 2");
    assert_eq!(b.wait().expect("second").source.text, "3 4");
}
