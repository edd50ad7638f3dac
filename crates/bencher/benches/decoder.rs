use std::hint::black_box;
use bencher::{TestCase, TestFile};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use micro_http_client::codec::ResponseParser;
use tokio_util::bytes::BytesMut;

static SMALL_RESPONSE: TestFile = TestFile::new("small.txt", include_str!("../resources/response/small.txt"));
static LARGE_RESPONSE: TestFile = TestFile::new("large.txt", include_str!("../resources/response/large.txt"));

fn create_test_cases() -> Vec<TestCase> {
    vec![
        TestCase::small("small_response_parser", SMALL_RESPONSE),
        TestCase::normal("large_response_parser", LARGE_RESPONSE),
    ]
}

fn benchmark_response_parser(criterion: &mut Criterion) {
    let test_cases = create_test_cases();
    let mut group = criterion.benchmark_group("response_parser");

    for case in test_cases {
        group.throughput(Throughput::Bytes(case.file().content().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(case.name()), &case, |b, case| {
            let mut parser = ResponseParser::default();
            b.iter_batched_ref(
                || BytesMut::from(case.file().content()),
                |bytes_mut| {
                    parser.reset(true);
                    parser.parse(bytes_mut).expect("input should be a valid http response");
                    assert!(parser.is_complete(), "{} should hold a whole response", case.file_name());
                    black_box(parser.response());
                },
                BatchSize::SmallInput,
            );
        });
    }

    // the same responses, one byte at a time
    for case in create_test_cases() {
        group.bench_with_input(BenchmarkId::new("byte_by_byte", case.name()), &case, |b, case| {
            let mut parser = ResponseParser::default();
            b.iter(|| {
                parser.reset(true);
                let mut buffer = BytesMut::new();
                for byte in case.file().content().as_bytes() {
                    buffer.extend_from_slice(std::slice::from_ref(byte));
                    parser.parse(&mut buffer).expect("input should be a valid http response");
                }
                black_box(parser.is_complete())
            });
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_response_parser);
criterion_main!(decoder);
