use std::collections::HashMap;
use std::collections::HashSet;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

use hypersearch::document::Document;
use hypersearch::hypercube;
use hypersearch::index::InvertedIndex;
use hypersearch::shard::HashRing;
use hypersearch::tokenizer::Tokenizer;
use hypersearch::vectorize::{VectorBundle, VectorizerSet};

fn bench_tokenizer(c: &mut Criterion) {
    let tokenizer = Tokenizer::default();
    let text = "distributed document search systems partition their inverted \
                indexes across many nodes and answer queries by fanning out to \
                the replicas that hold candidate postings"
        .repeat(8);

    c.bench_function("tokenize_1kb", |b| {
        b.iter(|| tokenizer.tokenize(black_box(&text)))
    });
}

fn bench_hash_ring(c: &mut Criterion) {
    let ring = HashRing::new(16, 150);

    c.bench_function("ring_get_shard", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(1);
            ring.get_shard(black_box(&format!("term-{}", i)))
        })
    });
}

fn bench_hypercube_routing(c: &mut Criterion) {
    let dims = 16;
    let active: HashSet<u64> = (0..4096).collect();

    c.bench_function("route_path_16d", |b| {
        b.iter(|| hypercube::route_path(black_box(0), black_box(0b1010_1010_1010), &active, dims, None))
    });
}

fn bench_index_search(c: &mut Criterion) {
    let mut index = InvertedIndex::new();
    for i in 0..1000 {
        let doc = Document::new(
            Uuid::new_v4(),
            format!(
                "benchmark document {} covering search indexing replication \
                 consensus partitions and routing topic{}",
                i,
                i % 50
            ),
            HashMap::new(),
            0,
            1,
            VectorBundle::default(),
        );
        index.add_document(doc);
    }

    c.bench_function("index_search_1000_docs", |b| {
        b.iter(|| index.search(black_box("search consensus topic7"), 10))
    });
}

fn bench_vectorize(c: &mut Criterion) {
    let vectorizers = VectorizerSet::standard();
    let text = "quorum replication places each document on the primary and its \
                closest hypercube neighbors";

    c.bench_function("vectorize_query", |b| {
        b.iter(|| vectorizers.bundle(black_box(text)))
    });
}

criterion_group!(
    benches,
    bench_tokenizer,
    bench_hash_ring,
    bench_hypercube_routing,
    bench_index_search,
    bench_vectorize
);
criterion_main!(benches);
