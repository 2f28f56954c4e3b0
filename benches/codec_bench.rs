//! Benchmarks for kindkv key codec operations

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kindkv::codec::{
    composite_key, composite_prefix, encode_path, encode_value, index_key, reverse_lex, split_composite_key,
};
use kindkv::{Direction, Key, PropertyValue};

fn sample_key() -> Key {
    Key::with_name("bench", "Account", "acme")
        .child_with_id("Person", 42)
        .child_with_id("Address", 7)
}

fn codec_benchmarks(c: &mut Criterion) {
    let key = sample_key();
    let text = PropertyValue::String("a string with \u{0} a null and some length".to_string());
    let integer = PropertyValue::Integer(-1_234_567);

    c.bench_function("encode_value/string", |b| b.iter(|| encode_value(black_box(&text))));
    c.bench_function("encode_value/integer", |b| b.iter(|| encode_value(black_box(&integer))));

    let encoded = encode_value(&text);
    c.bench_function("reverse_lex", |b| b.iter(|| reverse_lex(black_box(&encoded))));

    c.bench_function("encode_path/depth_3", |b| b.iter(|| encode_path(black_box(&key.path))));

    c.bench_function("index_key/descending", |b| {
        b.iter(|| index_key(black_box(&key), "name", black_box(&text), Direction::Descending))
    });

    let prefix = composite_prefix("bench", "", 99);
    let values = vec![encode_value(&integer), reverse_lex(&encode_value(&text))];
    let row_key = composite_key(&prefix, None, &values, &key.path);
    let directions = [Direction::Ascending, Direction::Descending];
    c.bench_function("split_composite_key", |b| {
        b.iter(|| split_composite_key(black_box(&row_key), &directions, false))
    });
}

criterion_group!(benches, codec_benchmarks);
criterion_main!(benches);
