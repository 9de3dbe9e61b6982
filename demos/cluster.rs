//! Estimates pi on a small in-process cluster.
//!
//! Run with `RUST_LOG=mikomi=debug cargo run --example cluster --features logging`.

use mikomi::{Cluster, Config, Future, Range};

const SLICES: u64 = 1 << 20;

fn main() -> anyhow::Result<()> {
    mikomi::init_logging()?;

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::new(),
    };

    let cluster = Cluster::new(4, config)?;
    let quarter = cluster.register_task("quarter", |(rank, ranks): (u64, u64)| {
        let per = SLICES / ranks;
        let start = rank * per;
        (start..start + per)
            .map(|i| {
                let x = (i as f64 + 0.5) / SLICES as f64;
                4.0 / (1.0 + x * x)
            })
            .sum::<f64>()
            / SLICES as f64
    })?;

    let taskq = cluster.world(0).taskq();
    let ranks = cluster.size() as u64;
    let parts: Vec<Future<f64>> = (0..ranks)
        .map(|rank| {
            let args = (Future::ready(rank), Future::ready(ranks));
            taskq.add_on(rank as usize, &quarter, args)
        })
        .collect();

    let pi = taskq.add(parts, |parts| parts.into_iter().sum::<f64>());
    println!("pi ~ {:.10}", pi.get());

    let squares = taskq.reduce(Range::with_chunksize(1u64..1001, 64), |x| x * x, |a, b| a + b);
    println!("sum of squares 1..=1000 = {}", squares.get());

    taskq.fence();
    Ok(())
}
