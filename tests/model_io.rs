//! Loading a model package from disk: memory-mapped weights, a serialized
//! `tokenizers` vocabulary and a binary shortlist, then a shortlisted
//! translation through the blocking frontend.

mod common;

use std::path::PathBuf;

use serde_json::json;

use skiff::config::Config;
use skiff::model::{Model, Package};
use skiff::response::Options;
use skiff::service::Blocking;
use skiff::shortlist::write_shortlist;

use common::{tiny_model_blob, VOCAB};

fn tiny_config() -> Config {
    Config {
        encoder_layers: 2,
        decoder_layers: 2,
        num_heads: 8,
        tgt_length_limit_factor: 2.0,
        ..Config::default()
    }
}

/// Minimal serialized word-level tokenizer covering ids 0..VOCAB.
fn tokenizer_json() -> String {
    let mut vocab = serde_json::Map::new();
    vocab.insert("<pad>".to_string(), json!(0));
    vocab.insert("</s>".to_string(), json!(1));
    vocab.insert("<unk>".to_string(), json!(2));
    for i in 3..VOCAB {
        vocab.insert(format!("{}", i - 3), json!(i));
    }
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"},
        "post_processor": null,
        "decoder": null
    })
    .to_string()
}

/// Every word's row points at a couple of mid-range ids.
fn shortlist_blob() -> Vec<u8> {
    let mut word_to_offset = Vec::new();
    let mut shortlist: Vec<u32> = Vec::new();
    for word in 0..VOCAB {
        word_to_offset.push(shortlist.len() as u64);
        shortlist.push((16 + word % 8) as u32);
    }
    word_to_offset.push(shortlist.len() as u64);
    write_shortlist(8, 8, &word_to_offset, &shortlist)
}

#[test]
fn test_load_package_from_disk_and_translate() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let write = |name: &str, bytes: &[u8]| -> std::io::Result<PathBuf> {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    };

    let config = tiny_config();
    let package = Package {
        model: write("model.bin", &tiny_model_blob(&config, 33))?,
        vocabulary: write("vocab.json", tokenizer_json().as_bytes())?,
        shortlist: Some(write("lex.bin", &shortlist_blob())?),
    };

    let model = Model::load(config.clone(), &package)?;
    let service = Blocking::new(config)?;

    let responses =
        service.translate(&model, vec!["3 4 5".to_string()], &Options::default())?;

    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert_eq!(response.source.text, "3 4 5");
    assert_eq!(response.source.sentence_count(), 1);
    assert_eq!(response.target.sentence_count(), 1);

    // Shortlisted decoding still yields a distribution per decoded token.
    for row in &response.alignments[0] {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }
    Ok(())
}

#[test]
fn test_missing_model_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let package = Package {
        model: dir.path().join("absent.bin"),
        vocabulary: dir.path().join("absent.json"),
        shortlist: None,
    };
    assert!(Model::load(tiny_config(), &package).is_err());
}
