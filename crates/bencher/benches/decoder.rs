use std::hint::black_box;

use bencher::Capture;
use bytes::BytesMut;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use http::Method;
use intercept_http::codec::{PayloadDecoder, RequestHeadDecoder, ResponseHeadDecoder};
use intercept_http::protocol::PayloadItem;
use tokio_util::codec::Decoder;

static SMALL_REQUEST: Capture = Capture::new("get_small", include_bytes!("../resources/request/get_small.txt"));
static LARGE_REQUEST: Capture = Capture::new("get_large", include_bytes!("../resources/request/get_large.txt"));
static CHUNKED_RESPONSE: Capture = Capture::new("ok_chunked", include_bytes!("../resources/response/ok_chunked.txt"));

fn benchmark_head_decoders(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("head_decoder");

    for capture in [SMALL_REQUEST, LARGE_REQUEST] {
        group.throughput(Throughput::Bytes(capture.len() as u64));
        group.bench_with_input(BenchmarkId::new("request", capture.name()), &capture, |b, capture| {
            b.iter_batched_ref(
                || BytesMut::from(capture.content()),
                |bytes_mut| {
                    let head = RequestHeadDecoder.decode(bytes_mut).expect("capture should be a valid request head").unwrap();
                    black_box(head);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.throughput(Throughput::Bytes(CHUNKED_RESPONSE.len() as u64));
    group.bench_function(BenchmarkId::new("response", CHUNKED_RESPONSE.name()), |b| {
        b.iter_batched_ref(
            || BytesMut::from(CHUNKED_RESPONSE.content()),
            |bytes_mut| {
                let mut decoder = ResponseHeadDecoder::for_request(&Method::GET);
                let head = decoder.decode(bytes_mut).expect("capture should be a valid response head").unwrap();
                black_box(head);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn benchmark_chunked_decoder(criterion: &mut Criterion) {
    let body = bencher::html_body(2_000);
    let mut group = criterion.benchmark_group("chunked_decoder");
    group.throughput(Throughput::Bytes(body.len() as u64));

    for chunk_size in [256, 4 * 1024, 32 * 1024] {
        let wire = bencher::chunked(&body, chunk_size);
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &wire, |b, wire| {
            b.iter_batched_ref(
                || BytesMut::from(&wire[..]),
                |bytes_mut| {
                    let mut decoder = PayloadDecoder::chunked();
                    let mut size = 0;
                    loop {
                        match decoder.decode(bytes_mut).expect("generated body should be valid chunked coding") {
                            Some(PayloadItem::Chunk(bytes)) => size += bytes.len(),
                            Some(PayloadItem::Eof) | None => break,
                        }
                    }
                    black_box((size, decoder.take_trailers()));
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_head_decoders, benchmark_chunked_decoder);
criterion_main!(decoder);
