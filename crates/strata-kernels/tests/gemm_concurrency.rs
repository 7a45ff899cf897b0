mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use strata_kernels::{BackendRegistry, ExecutorOptions, ExecutorTable, GemmStaticParams};
use strata_lowered::KernelDispatch;

const M: usize = 64;
const N: usize = 256;
const K: usize = 128;
const THREADS: usize = 8;

fn table(params: &Arc<GemmStaticParams>) -> ExecutorTable {
    let backends = Arc::new(BackendRegistry::default());
    let mut table = ExecutorTable::new();
    table
        .register(executor(copy_b_expr(params.n_block), params, &backends, ExecutorOptions::default()))
        .unwrap();
    table
        .register(executor(gemm_expr(0.0), params, &backends, ExecutorOptions::default()))
        .unwrap();
    table
}

fn run(table: &ExecutorTable, params: &GemmStaticParams) -> Vec<f32> {
    let mut memory = matmul_memory(M, N, K, params);
    table.dispatch(&copy_b_expr(params.n_block), &mut memory).unwrap();
    table.dispatch(&gemm_expr(0.0), &mut memory).unwrap();
    memory.data(C).unwrap().to_vec()
}

#[test]
fn concurrent_requests_match_single_threaded_result() {
    // One task covering every row is the single-threaded baseline.
    let serial_params = Arc::new(GemmStaticParams::new(16, M).unwrap());
    let serial = run(&table(&serial_params), &serial_params);

    let memory = matmul_memory(M, N, K, &serial_params);
    let naive = naive_matmul(memory.data(A).unwrap(), memory.data(B).unwrap(), M, N, K);
    assert_eq!(bits(&serial), bits(&naive));

    let params = Arc::new(GemmStaticParams::new(16, 4).unwrap());
    let shared = table(&params);
    let results: Vec<Vec<f32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS).map(|_| scope.spawn(|| run(&shared, &params))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in &results {
        assert_eq!(bits(result), bits(&serial));
    }
    for (_, stats) in shared.stats() {
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.cache_hits, THREADS as u64 - 1);
    }
}
