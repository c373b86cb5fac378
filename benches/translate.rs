use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use docql::engine::MemoryEngine;
use docql::mapper::FieldMapper;
use docql::schema::SchemaRegistry;
use docql::sql::parse;
use docql::translate::SqlTranslator;

const SIMPLE: &str = "SELECT * FROM users WHERE age > 25 AND name LIKE 'a%' ORDER BY age DESC LIMIT 10";

const JOINED: &str = "SELECT u.name, COUNT(*) AS c FROM users u \
                      LEFT JOIN orders o ON o.user_id = u.id \
                      GROUP BY u.name HAVING c >= 3 ORDER BY c DESC";

fn bench_parse(c: &mut Criterion) {
  c.bench_function("parse_simple_select", |b| {
    b.iter(|| parse(black_box(SIMPLE)).unwrap())
  });
  c.bench_function("parse_join_group_having", |b| {
    b.iter(|| parse(black_box(JOINED)).unwrap())
  });
}

fn bench_translate(c: &mut Criterion) {
  let rt = tokio::runtime::Runtime::new().unwrap();
  let registry = Arc::new(SchemaRegistry::new());
  let mapper = FieldMapper::new(registry, Arc::new(MemoryEngine::new()));
  let simple = parse(SIMPLE).unwrap();
  let joined = parse(JOINED).unwrap();

  c.bench_function("translate_simple_select", |b| {
    b.to_async(&rt).iter(|| async {
      let translator = SqlTranslator::new(&mapper);
      translator.translate(black_box(&simple), &[]).await.unwrap()
    })
  });
  c.bench_function("translate_join_group_having", |b| {
    b.to_async(&rt).iter(|| async {
      let translator = SqlTranslator::new(&mapper);
      translator.translate(black_box(&joined), &[]).await.unwrap()
    })
  });
}

criterion_group!(benches, bench_parse, bench_translate);
criterion_main!(benches);
