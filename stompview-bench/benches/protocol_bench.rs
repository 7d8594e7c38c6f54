//! Frame and payload codec benchmarks.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stompview_protocol::{Command, DataRequest, Decoder, Encoder, Frame, FrameDecoder};

fn snapshot_body(rows: usize) -> Bytes {
    let records: Vec<_> = (0..rows)
        .map(|i| {
            serde_json::json!({
                "id": i,
                "symbol": format!("SYM{}", i % 50),
                "price": 100.0 + i as f64 / 8.0,
                "size": i * 10,
                "side": if i % 2 == 0 { "BUY" } else { "SELL" },
            })
        })
        .collect();
    Bytes::from(serde_json::to_vec(&records).unwrap())
}

fn message_frame(body: Bytes) -> Frame {
    Frame::new(Command::Message)
        .with_header("destination", "/user/queue/response")
        .with_header("subscription", "sub-1")
        .with_header("message-id", "m-1")
        .with_header("content-type", "application/json")
        .with_body(body)
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for rows in [10, 100, 1000] {
        let frame = message_frame(snapshot_body(rows));

        group.throughput(Throughput::Bytes(frame.body.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for rows in [10, 100, 1000] {
        let encoded = message_frame(snapshot_body(rows)).encode().unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

/// Frames without `content-length` arriving in read-sized chunks.
fn bench_frame_decode_chunked(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_chunked");

    for rows in [100, 1000, 10_000] {
        let mut encoded = b"MESSAGE\ndestination:/user/queue/response\n\n".to_vec();
        encoded.extend_from_slice(&snapshot_body(rows));
        encoded.push(0);

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                let mut buf = BytesMut::new();
                let mut frame = None;
                for chunk in encoded.chunks(8 * 1024) {
                    buf.extend_from_slice(chunk);
                    frame = decoder.decode(&mut buf).unwrap();
                }
                black_box(frame)
            });
        });
    }

    group.finish();
}

fn bench_payload_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_read");

    for rows in [10, 100, 1000] {
        let body = snapshot_body(rows);

        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("snapshot", rows), &body, |b, body| {
            b.iter(|| black_box(Decoder::read(body).unwrap()));
        });
    }

    let upsert = Bytes::from_static(br#"{"id":42,"price":101.25,"size":300}"#);
    group.bench_function("upsert", |b| {
        b.iter(|| black_box(Decoder::read(&upsert).unwrap()));
    });

    group.finish();
}

fn bench_request_encode(c: &mut Criterion) {
    let request = DataRequest::from_input("TRADER001", "OWNER001, OWNER002, OWNER003");

    c.bench_function("request_encode", |b| {
        b.iter(|| black_box(Encoder::encode_request(&request.to_payload()).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_frame_decode_chunked,
    bench_payload_read,
    bench_request_encode
);
criterion_main!(benches);
