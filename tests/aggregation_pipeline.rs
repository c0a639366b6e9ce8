//! End-to-end exercises of the Compute -> Distribute -> Merge pipeline across
//! simulated cluster nodes, each kernel on its own thread and all nodes
//! sharing one `InProcessTransport`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arrow::array::{Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use clusteragg::cache::CacheMachine;
use clusteragg::config::{CacheConfig, ExecutorConfig};
use clusteragg::context::{Context, NodeId, QueryTokens};
use clusteragg::executor::TaskExecutor;
use clusteragg::kernels::{ComputeAggregateKernel, DistributeAggregateKernel, MergeAggregateKernel};
use clusteragg::primitives::ArrowAggregatePrimitives;
use clusteragg::transport::InProcessTransport;
use clusteragg::{Batch, CacheData, Kernel, Result};

fn int_batch(k: &[i64], v: &[i64]) -> Batch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(k.to_vec())),
            Arc::new(Int64Array::from(v.to_vec())),
        ],
    )
    .unwrap()
}

/// One simulated node's three-kernel chain, constructed (and thus
/// transport-registered) up front; `spawn` starts each kernel's `run()` on
/// its own thread, mirroring the "each kernel owns a thread" scheduling
/// model.
struct NodePipeline {
    compute_input: Arc<CacheMachine>,
    merge_output: Arc<CacheMachine>,
    compute: Arc<ComputeAggregateKernel>,
    distribute: Arc<DistributeAggregateKernel>,
    merge: Arc<MergeAggregateKernel>,
    executor: Arc<TaskExecutor>,
}

impl NodePipeline {
    fn new(
        node: NodeId,
        master: NodeId,
        all_nodes: Vec<NodeId>,
        expr: &str,
        query_id: &str,
        transport: Arc<InProcessTransport>,
    ) -> Self {
        let tokens = QueryTokens {
            query_id: query_id.into(),
            step: 0,
            substep: 0,
        };
        let ctx = Arc::new(Context::new(node, master, all_nodes, tokens));
        let executor = TaskExecutor::new(
            ExecutorConfig::new().thread_count(2),
            Arc::new(ArrowAggregatePrimitives),
        );

        let compute_input = Arc::new(CacheMachine::new(format!("{node}-compute-in"), CacheConfig::new()));
        let compute_output = Arc::new(CacheMachine::new(format!("{node}-compute-out"), CacheConfig::new()));
        let distribute_output = Arc::new(CacheMachine::new(format!("{node}-distribute-out"), CacheConfig::new()));
        let merge_output = Arc::new(CacheMachine::new(format!("{node}-merge-out"), CacheConfig::new()));

        let compute = Arc::new(
            ComputeAggregateKernel::new(0, expr, ctx.clone(), compute_input.clone(), compute_output.clone(), None)
                .unwrap(),
        );
        // Constructing DistributeAggregateKernel registers this node's
        // transport inbox -- must happen for every node before any node's
        // kernels start running.
        let distribute = Arc::new(
            DistributeAggregateKernel::new(
                1,
                expr,
                ctx.clone(),
                compute_output,
                distribute_output.clone(),
                transport,
                query_id,
            )
            .unwrap(),
        );
        let merge = Arc::new(MergeAggregateKernel::new(2, expr, ctx, distribute_output, merge_output.clone()).unwrap());

        NodePipeline {
            compute_input,
            merge_output,
            compute,
            distribute,
            merge,
            executor,
        }
    }

    fn spawn(&self) -> Vec<JoinHandle<Result<()>>> {
        let mut handles = Vec::new();
        {
            let compute = self.compute.clone();
            let executor = self.executor.clone();
            handles.push(thread::spawn(move || compute.run(&executor)));
        }
        {
            let distribute = self.distribute.clone();
            let executor = self.executor.clone();
            handles.push(thread::spawn(move || distribute.run(&executor)));
        }
        {
            let merge = self.merge.clone();
            let executor = self.executor.clone();
            handles.push(thread::spawn(move || merge.run(&executor)));
        }
        handles
    }

    fn feed(&self, batches: Vec<Batch>) {
        for batch in batches {
            self.compute_input.add_to_cache(CacheData::from_batch(batch), true).unwrap();
        }
        self.compute_input.finish();
    }

    fn drain_merge_output(&self) -> Vec<Batch> {
        std::iter::from_fn(|| self.merge_output.pull_cache_data())
            .map(|cd| cd.materialize().unwrap())
            .collect()
    }
}

fn join_all(handles: Vec<JoinHandle<Result<()>>>) {
    for h in handles {
        h.join().expect("kernel thread panicked").expect("kernel returned an error");
    }
}

#[test]
fn scalar_sum_funnels_to_master_only() {
    let transport = InProcessTransport::new();
    let all_nodes = vec![NodeId(0), NodeId(1)];
    let master = NodeId(0);
    let expr = "|SUM(1)|total";
    let query_id = "scalar-sum";

    let node0 = NodePipeline::new(NodeId(0), master, all_nodes.clone(), expr, query_id, transport.clone());
    let node1 = NodePipeline::new(NodeId(1), master, all_nodes, expr, query_id, transport);

    let mut handles = node0.spawn();
    handles.extend(node1.spawn());

    node0.feed(vec![int_batch(&[0, 0], &[1, 2]), int_batch(&[0], &[3])]);
    node1.feed(vec![int_batch(&[0], &[10])]);

    join_all(handles);

    let master_result = node0.drain_merge_output();
    let total: f64 = master_result
        .iter()
        .flat_map(|b| {
            b.column_by_name("total")
                .unwrap()
                .as_any()
                .downcast_ref::<Float64Array>()
                .unwrap()
                .values()
                .to_vec()
        })
        .sum();
    assert_eq!(total, 16.0);

    // Non-master never re-aggregates; it only ever sees its own placeholder.
    let peer_result = node1.drain_merge_output();
    assert!(peer_result.iter().all(|b| b.num_rows() == 0));
}

#[test]
fn group_by_sum_partitions_keys_across_nodes_without_duplication() {
    let transport = InProcessTransport::new();
    let all_nodes = vec![NodeId(0), NodeId(1)];
    let master = NodeId(0);
    let expr = "0|SUM(1)|total";
    let query_id = "grouped-sum";

    let node0 = NodePipeline::new(NodeId(0), master, all_nodes.clone(), expr, query_id, transport.clone());
    let node1 = NodePipeline::new(NodeId(1), master, all_nodes, expr, query_id, transport);

    let mut handles = node0.spawn();
    handles.extend(node1.spawn());

    // Same key 7 appears in input fed to both nodes -- hash-partitioning
    // must still resolve it to exactly one destination cluster-wide.
    node0.feed(vec![int_batch(&[1, 7, 2], &[10, 1, 20])]);
    node1.feed(vec![int_batch(&[7, 3], &[2, 30])]);

    join_all(handles);

    let mut totals_by_key: HashMap<i64, f64> = HashMap::new();
    let mut seen_keys: HashSet<i64> = HashSet::new();
    let mut grand_total = 0.0;

    for node_result in [node0.drain_merge_output(), node1.drain_merge_output()] {
        for batch in node_result {
            if batch.num_rows() == 0 {
                continue;
            }
            let keys = batch.column_by_name("k").unwrap().as_any().downcast_ref::<Int64Array>().unwrap();
            let totals = batch
                .column_by_name("total")
                .unwrap()
                .as_any()
                .downcast_ref::<Float64Array>()
                .unwrap();
            for row in 0..batch.num_rows() {
                let k = keys.value(row);
                assert!(seen_keys.insert(k), "key {k} appeared in more than one node's output");
                totals_by_key.insert(k, totals.value(row));
                grand_total += totals.value(row);
            }
        }
    }

    assert_eq!(seen_keys, HashSet::from([1, 2, 3, 7]));
    assert_eq!(totals_by_key[&7], 3.0);
    assert_eq!(grand_total, 10.0 + 1.0 + 20.0 + 2.0 + 30.0);
}

#[test]
fn no_input_batches_still_terminates_with_empty_output() {
    let transport = InProcessTransport::new();
    let all_nodes = vec![NodeId(0)];
    let expr = "0|SUM(1)|total";
    let query_id = "empty-query";

    let node0 = NodePipeline::new(NodeId(0), NodeId(0), all_nodes, expr, query_id, transport);
    let handles = node0.spawn();

    node0.feed(vec![]);
    join_all(handles);

    assert!(node0.drain_merge_output().is_empty());
}
