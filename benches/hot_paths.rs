use criterion::{black_box, criterion_group, criterion_main, Criterion};

use apm_collector::analysis::heartbeat::ServiceName;
use apm_collector::cluster::selector::select;
use apm_collector::cluster::{ClusterView, Member};
use apm_collector::data::StreamData;
use apm_collector::worker::KeyedWindow;

fn beat(i: usize, time: i64) -> ServiceName {
    ServiceName {
        service_id: i as i32,
        service_name: format!("/api/v1/orders/{}", i % 64),
        application_id: (i % 8) as i32,
        src_span_type: 0,
        heartbeat_time: time,
    }
}

fn members(n: usize) -> Vec<Member> {
    (0..n).map(|i| Member::new(format!("10.0.0.{i}:11800"))).collect()
}

fn bench_suite(c: &mut Criterion) {
    let records: Vec<ServiceName> = (0..1_024).map(|i| beat(i, i as i64)).collect();

    c.bench_function("window/merge_1k_records_64_keys", |b| {
        b.iter(|| {
            let window = KeyedWindow::new(64);
            for record in &records {
                window.merge(record.clone()).expect("merge");
            }
            black_box(window.drain())
        })
    });

    c.bench_function("service_name/merge", |b| {
        let newer = beat(1, 200);
        b.iter(|| {
            let mut state = beat(1, 100);
            state.merge(black_box(&newer));
            black_box(state)
        })
    });

    let keys: Vec<String> = records.iter().map(StreamData::id).collect();

    for n in [3, 16] {
        let view = members(n);
        c.bench_function(&format!("selector/select_{n}_members"), |b| {
            b.iter(|| {
                for key in &keys {
                    black_box(select(&view, key));
                }
            })
        });
    }

    let cluster = ClusterView::new(Member::new("10.0.0.0:11800"), members(16));
    c.bench_function("cluster/place_16_members", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(cluster.place(key));
            }
        })
    });
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
