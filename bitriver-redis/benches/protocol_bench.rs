use bitriver_redis::protocol::{FrameReader, RespDecoder, RespEncoder};
use bitriver_redis::{Client, ConnectionConfig, RespValue};
use bitriver_redis_stub::{Options, Server};
use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;

/// Reply to `XREADGROUP ... COUNT n` carrying `n` two-field entries
fn stream_reply(entries: usize) -> BytesMut {
    let entries = (0..entries)
        .map(|i| {
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from(format!("1700000000000-{i}"))),
                RespValue::Array(vec![
                    RespValue::BulkString(Bytes::from("user")),
                    RespValue::BulkString(Bytes::from("alice")),
                    RespValue::BulkString(Bytes::from("msg")),
                    RespValue::BulkString(Bytes::from(format!("message number {i}"))),
                ]),
            ])
        })
        .collect();
    let reply = RespValue::Array(vec![RespValue::Array(vec![
        RespValue::BulkString(Bytes::from("chat:42")),
        RespValue::Array(entries),
    ])]);

    let mut buf = BytesMut::new();
    RespEncoder::encode(&reply, &mut buf).unwrap();
    buf
}

fn bench_encode_xadd(c: &mut Criterion) {
    c.bench_function("encode_xadd", |b| {
        let args = vec![
            Bytes::from("chat:42"),
            Bytes::from("*"),
            Bytes::from("user"),
            Bytes::from("alice"),
            Bytes::from("msg"),
            Bytes::from("hi"),
        ];
        b.iter(|| black_box(RespEncoder::encode_command(black_box("XADD"), black_box(&args))));
    });
}

fn bench_encode_incr(c: &mut Criterion) {
    c.bench_function("encode_incr", |b| {
        let args = vec![Bytes::from("rl:alice")];
        b.iter(|| black_box(RespEncoder::encode_command(black_box("INCR"), black_box(&args))));
    });
}

fn bench_decode_integer(c: &mut Criterion) {
    c.bench_function("decode_integer", |b| {
        let data = b":1000\r\n";
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(&data[..]));
            RespDecoder::decode(&mut cursor).unwrap();
        });
    });
}

fn bench_decode_stream_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_stream_reply");
    for entries in [1, 32, 256] {
        let data = stream_reply(entries);
        group.bench_function(entries.to_string(), |b| {
            b.iter(|| {
                let mut cursor = Cursor::new(black_box(&data[..]));
                RespDecoder::decode(&mut cursor).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_decode_split_reply(c: &mut Criterion) {
    c.bench_function("decode_split_reply", |b| {
        let data = stream_reply(32);
        let (head, tail) = data.split_at(data.len() / 2);
        b.iter(|| {
            let mut reader = FrameReader::new();
            let mut buf = BytesMut::from(head);
            assert!(reader.next_value(&mut buf).unwrap().is_none());
            buf.extend_from_slice(tail);
            black_box(reader.next_value(&mut buf).unwrap());
        });
    });
}

fn bench_stub_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (_server, client) = rt.block_on(async {
        let server = Server::start(Options::default()).await.unwrap();
        let client = Client::connect(ConnectionConfig::new(server.url()))
            .await
            .unwrap();
        (server, client)
    });

    c.bench_function("stub_increment", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(client.increment("bench").await.unwrap()) });
    });
}

criterion_group!(
    benches,
    bench_encode_xadd,
    bench_encode_incr,
    bench_decode_integer,
    bench_decode_stream_reply,
    bench_decode_split_reply,
    bench_stub_round_trip
);
criterion_main!(benches);
