//! Benchmarks for the submit/retrieve reconcile path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pipe_stage::pipe::RunningFrameTable;
use pipe_stage::{Frame, MockNode, Pipe, PipeConfig, PipeId, PipeInfo};

const PIPE: PipeId = PipeId(1);

fn bench_table_in_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("running_table_in_order");

    for capacity in [4usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*capacity as u64));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            let mut table = RunningFrameTable::new(capacity);
            b.iter(|| {
                for index in 0..capacity {
                    if table.insert(index, Frame::new(index as u64)).is_err() {
                        unreachable!("slot {} occupied", index);
                    }
                }
                for index in 0..capacity {
                    black_box(table.remove(index).ok());
                }
            });
        });
    }

    group.finish();
}

fn bench_table_out_of_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("running_table_out_of_order");

    for capacity in [4usize, 16, 64].iter() {
        // return every other buffer first, then the rest in reverse
        let order: Vec<usize> = (0..capacity)
            .step_by(2)
            .chain((1..capacity).step_by(2).rev())
            .collect();
        group.throughput(Throughput::Elements(*capacity as u64));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &order, |b, order| {
            let mut table = RunningFrameTable::new(*capacity);
            b.iter(|| {
                for &index in order.iter().rev() {
                    if table.insert(index, Frame::new(index as u64)).is_err() {
                        unreachable!("slot {} occupied", index);
                    }
                }
                for &index in order {
                    black_box(table.remove(index).ok());
                }
            });
        });
    }

    group.finish();
}

fn bench_instant_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("instant_round_trip");
    group.throughput(Throughput::Elements(1));

    let node = MockNode::new("bench-node");
    let mut pipe = Pipe::new(PipeConfig::new(PIPE, "PIPE_BENCH"), Box::new(node)).unwrap();
    let (tx, _rx) = crossbeam_channel::unbounded();
    pipe.set_output_queue(tx).unwrap();
    pipe.create().unwrap();
    pipe.setup(PipeInfo::new(64, 32, "NV21", 2)).unwrap();
    pipe.instant_on().unwrap();
    let pool = pipe.buffer_pool();

    group.bench_function("submit_retrieve", |b| {
        let mut sequence = 0;
        b.iter(|| {
            sequence += 1;
            let buffer = pool.acquire().unwrap();
            let frame = Frame::new(sequence).with_buffer(PIPE, buffer);
            pipe.instant_submit(frame).unwrap();
            let mut done = pipe.instant_retrieve().unwrap().unwrap();
            if let Some(buffer) = done.take_buffer(PIPE) {
                pool.release(buffer);
            }
        });
    });

    group.finish();
    pipe.instant_off().unwrap();
}

criterion_group!(
    benches,
    bench_table_in_order,
    bench_table_out_of_order,
    bench_instant_round_trip
);
criterion_main!(benches);
