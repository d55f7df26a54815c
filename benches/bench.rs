use abow::{Database, Desc, Vocabulary, VocabularyParams};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn images(n_images: usize, per_image: usize, seed: u64) -> Vec<Vec<Desc>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n_images)
        .map(|_| (0..per_image).map(|_| rng.gen()).collect())
        .collect()
}

/// Benchmark for Vocabulary::build()
fn build(c: &mut Criterion) {
    let training = images(10, 200, 1);
    c.bench_function("build k=9 L=3", |b| {
        b.iter(|| Vocabulary::build(black_box(&training), VocabularyParams::new(9, 3)).unwrap())
    });
}

/// Benchmark for Vocabulary::transform()
fn transform(c: &mut Criterion) {
    let voc = Vocabulary::build(&images(20, 300, 2), VocabularyParams::new(9, 3)).unwrap();
    let features = images(1, 500, 3).remove(0);
    c.bench_function("transform 500 features", |b| {
        b.iter(|| voc.transform(black_box(&features)).unwrap())
    });
}

/// Benchmark for Database::query()
fn query(c: &mut Criterion) {
    let training = images(20, 300, 4);
    let voc = Vocabulary::build(&training, VocabularyParams::new(9, 3)).unwrap();
    let mut db = Database::new(voc, None).unwrap();
    for image in images(200, 300, 5) {
        db.add(&image).unwrap();
    }
    let features = images(1, 300, 6).remove(0);
    c.bench_function("query 200 images", |b| {
        b.iter(|| db.query(black_box(&features), 10).unwrap())
    });
}

criterion_group!(benches, build, transform, query);
criterion_main!(benches);
