use std::fs;

use tempfile::TempDir;

use docvector_core::chunker::{chunk, ChunkStrategy, Chunker};
use docvector_core::config::{expand_path, Settings, StoreMode, Transport, VectorStoreSettings};
use docvector_core::documents::load_directory;
use docvector_core::types::Provider;
use docvector_core::Error;

#[test]
fn fixed_chunks_step_by_size_minus_overlap() {
    let doc = "x".repeat(2500);
    let chunks: Vec<_> = chunk(&doc, "doc", ChunkStrategy::Fixed, 1000, 200).expect("chunker").collect();

    let starts: Vec<usize> = chunks.iter().map(|c| c.start_offset).collect();
    assert_eq!(starts, vec![0, 800, 1600, 2400]);
    assert_eq!(chunks[0].end_offset, 1000);
    let last = chunks.last().expect("last chunk");
    assert_eq!(last.end_offset, 2500, "last chunk is truncated to the document end");
    assert_eq!(last.text.len(), 100);
}

#[test]
fn adjacent_fixed_chunks_share_overlap() {
    let doc: String = (0..300).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let c = Chunker::new(ChunkStrategy::Fixed, 100, 20).expect("chunker");
    let chunks: Vec<_> = c.chunk(&doc, "doc").collect();
    for pair in chunks.windows(2) {
        let tail = &pair[0].text[pair[0].text.len() - 20..];
        assert!(pair[1].text.starts_with(tail));
    }
}

#[test]
fn chunking_is_restartable() {
    let doc = "One sentence here. Another one follows.\n\nA new paragraph starts. ".repeat(40);
    let c = Chunker::new(ChunkStrategy::Semantic, 200, 40).expect("chunker");
    let first: Vec<_> = c.chunk(&doc, "doc").collect();
    let second: Vec<_> = c.chunk(&doc, "doc").collect();
    assert_eq!(first, second);
}

#[test]
fn semantic_prefers_paragraph_then_sentence_boundaries() {
    let para = format!("{}\n\n{}", "a".repeat(90), "b".repeat(200));
    let c = Chunker::new(ChunkStrategy::Semantic, 100, 0).expect("chunker");
    let first = c.chunk(&para, "doc").next().expect("chunk");
    assert_eq!(first.end_offset, 92, "cut right after the blank line");

    let sent = format!("{}. {}", "a".repeat(85), "b".repeat(200));
    let first = c.chunk(&sent, "doc").next().expect("chunk");
    assert_eq!(first.end_offset, 87, "cut after the sentence end");

    let none = "c".repeat(300);
    let first = c.chunk(&none, "doc").next().expect("chunk");
    assert_eq!(first.end_offset, 100, "falls back to a fixed cut");
}

#[test]
fn semantic_chunks_cover_the_whole_document() {
    let doc = "Short line. ".repeat(100);
    let c = Chunker::new(ChunkStrategy::Semantic, 120, 30).expect("chunker");
    let chunks: Vec<_> = c.chunk(&doc, "doc").collect();
    assert_eq!(chunks[0].start_offset, 0);
    assert_eq!(chunks.last().map(|c| c.end_offset), Some(doc.chars().count()));
    for pair in chunks.windows(2) {
        assert!(pair[1].start_offset > pair[0].start_offset);
        assert!(pair[1].start_offset <= pair[0].end_offset, "no gaps between chunks");
    }
}

#[test]
fn overlap_must_be_smaller_than_size() {
    let err = chunk("abc", "doc", ChunkStrategy::Fixed, 10, 10).err().expect("error");
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn settings_defaults() {
    let s = Settings::default();
    assert_eq!(s.embedding.model, "sentence-transformers/all-MiniLM-L6-v2");
    assert_eq!(s.embedding.batch_size, 32);
    assert!(s.embedding.cache_enabled);
    assert_eq!(s.search.min_score, 0.1);
    assert_eq!((s.search.vector_weight, s.search.keyword_weight), (0.7, 0.3));
    assert_eq!((s.chunking.size, s.chunking.overlap), (1000, 200));
    assert_eq!(s.vector_store.mode, StoreMode::Local);
    assert_eq!(s.vector_store.qdrant_port, 6333);
    s.validate().expect("defaults are valid");
}

#[test]
fn settings_layer_files_and_env() {
    figment::Jail::expect_with(|jail| {
        jail.create_file(
            "config.toml",
            r#"
            [embedding]
            model = "BAAI/bge-base-en-v1.5"
            batch_size = 8

            [vector_store]
            mode = "hybrid"
            transport = "grpc"
            "#,
        )?;
        jail.create_file("config.test.toml", "[search]\nmin_score = 0.25\n")?;
        jail.set_env("DOCVECTOR_EMBEDDING__PROVIDER", "local");
        jail.set_env("DOCVECTOR_CHUNKING__OVERLAP", "50");

        let s = Settings::load_for_env(Some("test")).map_err(|e| e.to_string())?;
        assert_eq!(s.embedding.model, "BAAI/bge-base-en-v1.5");
        assert_eq!(s.embedding.batch_size, 8);
        assert_eq!(s.embedding.provider, Some(Provider::Local));
        assert_eq!(s.search.min_score, 0.25);
        assert_eq!(s.chunking.overlap, 50);
        assert_eq!(s.chunking.size, 1000);
        assert_eq!(s.vector_store.mode, StoreMode::Hybrid);
        assert_eq!(s.vector_store.transport, Transport::Grpc);
        Ok(())
    });
}

#[test]
fn settings_reject_bad_chunking_and_modes() {
    figment::Jail::expect_with(|jail| {
        jail.create_file("config.toml", "[chunking]\nsize = 100\noverlap = 100\n")?;
        let err = Settings::load_for_env(Some("dev")).expect_err("overlap >= size");
        assert!(matches!(err, Error::InvalidConfig(_)));

        jail.create_file("config.toml", "[vector_store]\nmode = \"edge\"\n")?;
        let err = Settings::load_for_env(Some("dev")).expect_err("unknown mode");
        assert!(matches!(err, Error::InvalidConfig(_)));
        Ok(())
    });
}

#[test]
fn load_directory_reads_text_files_in_order() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::create_dir_all(dir.join("guide")).unwrap();
    fs::write(dir.join("guide/b.md"), "# Getting started\nInstall it.").unwrap();
    fs::write(dir.join("a.txt"), "alpha bravo").unwrap();
    fs::write(dir.join("image.png"), [0u8, 1, 2]).unwrap();

    let docs = load_directory(dir, None).expect("load");
    let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
    assert_eq!(ids, vec!["a.txt", "guide/b.md"]);
    assert_eq!(docs[1].metadata["title"], "Getting started");
    assert_eq!(docs[0].metadata["title"], "a");

    let limited = load_directory(dir, Some(1)).expect("load limited");
    assert_eq!(limited.len(), 1);
}

#[test]
fn configured_directories_expand_env_and_stay_relative() {
    figment::Jail::expect_with(|jail| {
        jail.set_env("DOCVECTOR_TEST_ROOT", "/srv/docvector");
        let s = VectorStoreSettings { persist_directory: "${DOCVECTOR_TEST_ROOT}/lance".into(), ..Default::default() };
        assert_eq!(s.persist_path(), std::path::PathBuf::from("/srv/docvector/lance"));
        assert_eq!(expand_path("./data/lance"), std::path::PathBuf::from("./data/lance"));
        Ok(())
    });
}
