use burrowctl::cache::{fingerprint, normalize_sql};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

const SHORT: &str = "SELECT id, name FROM users WHERE id = $1";
const LONG: &str = "WITH active AS (
    SELECT u.id, u.name, u.email, o.total -- join orders
    FROM users u
    JOIN orders o ON o.user_id = u.id
    WHERE o.created_at > $1 AND o.status = 'paid'
) SELECT * FROM active ORDER BY total DESC LIMIT 50";

fn bench_normalize(c: &mut Criterion) {
    c.bench_function("normalize_short", |b| {
        b.iter(|| normalize_sql(black_box(SHORT)))
    });
    c.bench_function("normalize_long", |b| {
        b.iter(|| normalize_sql(black_box(LONG)))
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let params = vec![json!(42), json!("2026-01-01T00:00:00Z"), json!(true)];
    c.bench_function("fingerprint_no_params", |b| {
        b.iter(|| fingerprint(black_box(SHORT), black_box(&[])))
    });
    c.bench_function("fingerprint_with_params", |b| {
        b.iter(|| fingerprint(black_box(LONG), black_box(&params)))
    });
}

criterion_group!(benches, bench_normalize, bench_fingerprint);
criterion_main!(benches);
