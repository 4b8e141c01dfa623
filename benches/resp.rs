use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ferrule::buffer;
use ferrule::bufio::{Reader, Writer};
use ferrule::resp::Resp;
use std::io::Cursor;

fn bench_resp_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp");
    let mut frame = Vec::new();
    for i in 0..1000 {
        frame.extend_from_slice(format!("*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n${}\r\nval{}\r\n", 3 + i.to_string().len(), i).as_bytes());
    }
    group.bench_function("decode_1k_sets", |b| {
        b.iter(|| {
            let mut r = Reader::new(Cursor::new(frame.clone()), buffer::get(4096));
            r.read().unwrap();
            let mut n = 0;
            loop {
                let mut resp = Resp::new();
                match resp.decode(&mut r) {
                    Ok(()) => n += 1,
                    Err(_) => break,
                }
            }
            black_box(n)
        });
    });
    group.finish();
}

fn bench_resp_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp");
    group.bench_function("encode_1k_bulks", |b| {
        let mut resp = Resp::new();
        resp.resp_type = b'$';
        resp.data = b"value".to_vec();
        b.iter(|| {
            let mut out = Vec::new();
            let mut w = Writer::new(&mut out);
            for _ in 0..1000 {
                resp.encode(&mut w).unwrap();
            }
            w.flush().unwrap();
            black_box(out.len())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_resp_decode, bench_resp_encode);
criterion_main!(benches);
