use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::path::Path;

use colflow_core::ops;
use colflow_core::{
    AggregateOp, ColflowConfig, ColumnData, ColumnSpec, ColumnType, Materializer,
    PartitionSource, PipelineBuilder, ReadOptions, Schema, TypedReader,
};

fn schema() -> Schema {
    Schema::new(vec![
        ColumnSpec::new("STATION", ColumnType::Text),
        ColumnSpec::new("VALUE", ColumnType::Integer).with_sentinel("-9999"),
        ColumnSpec::new("TEMP", ColumnType::Float),
    ])
    .unwrap()
}

fn partition_csv(rows: usize, seed: usize) -> String {
    let mut csv = String::from("STATION,VALUE,TEMP\n");
    for i in 0..rows {
        let value = if (i + seed) % 17 == 0 {
            "-9999".to_string()
        } else {
            ((i * 31 + seed) % 1000).to_string()
        };
        csv.push_str(&format!("S{},{},{}.5\n", i % 50, value, (i + seed) % 40));
    }
    csv
}

fn bench_reader(c: &mut Criterion) {
    let reader = TypedReader::new(ReadOptions::default());
    let schema = schema();
    let csv = partition_csv(10_000, 0);

    c.bench_function("read_partition_10k_rows", |b| {
        b.iter(|| {
            reader
                .read_from(0, Path::new("bench.csv"), black_box(csv.as_bytes()), &schema)
                .unwrap()
        })
    });
}

fn bench_aggregates(c: &mut Criterion) {
    let column = ColumnData::from((0..100_000).map(|i| Some(i as f64 * 0.5)).collect::<Vec<_>>());

    for op in [AggregateOp::Mean, AggregateOp::Std, AggregateOp::Distinct] {
        c.bench_function(&format!("aggregate_{op:?}_100k").to_lowercase(), |b| {
            b.iter(|| {
                let mut state =
                    colflow_core::aggregate::AggregateState::new(op, ColumnType::Float).unwrap();
                state.update(black_box(&column)).unwrap();
                state.finish()
            })
        });
    }
}

fn bench_materialize(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    for i in 0..8 {
        std::fs::write(
            dir.path().join(format!("p{i}.csv")),
            partition_csv(5_000, i),
        )
        .unwrap();
    }
    let pattern = format!("{}/*.csv", dir.path().display());

    let mut builder = PipelineBuilder::new(schema());
    builder.add(ops::drop_missing(&["VALUE"])).unwrap();
    builder.add_all(ops::standardize("TEMP", "TEMP_z")).unwrap();
    builder.add_all(ops::categorify("STATION", "STATION_id")).unwrap();
    let graph = builder.build().unwrap();
    let source = PartitionSource::discover(&pattern, schema()).unwrap();
    let materializer = Materializer::new(&ColflowConfig::default());
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("materialize_8x5k_with_barrier", |b| {
        b.iter(|| {
            runtime
                .block_on(materializer.evaluate(black_box(&graph), &source))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_reader, bench_aggregates, bench_materialize);
criterion_main!(benches);
