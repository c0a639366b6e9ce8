//! The "physical GPU primitives" capability interface (spec ยง6) plus a CPU
//! reference implementation used by tests and by any deployment without a
//! real device backend.
//!
//! The reference implementation (`ArrowAggregatePrimitives`) deliberately
//! covers a reduced type surface -- group columns are read as `Int64`,
//! aggregate inputs as `Float64` -- since the real physical primitives are
//! out of this repository's scope (spec ยง1) and this implementation exists
//! only to make the pipeline's invariants (spec ยง8) testable end-to-end.
//! See DESIGN.md for the scope note.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHasher;
use arrow::array::{
    ArrayRef, Float64Array, Float64Builder, Int64Array, Int64Builder, ListArray, ListBuilder,
};
use arrow::compute::{cast, concat_batches, take};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::hash::{Hash, Hasher};

use crate::batch::Batch;
use crate::errors::{Error, Result};
use crate::operators::{mod_groupby_parameters_for_merge, AggregationType, OperatorDescriptor};

/// Capability interface the compute/merge kernels depend on. A real
/// deployment backs this with device-resident hashing, partitioning and
/// columnar aggregation kernels; this crate ships only the CPU reference
/// implementation below.
pub trait AggregatePrimitives: Send + Sync {
    fn compute_groupby_without_aggregations(
        &self,
        batch: &Batch,
        group_indices: &[usize],
    ) -> Result<Batch>;

    fn compute_aggregations_without_groupby(
        &self,
        batch: &Batch,
        descriptor: &OperatorDescriptor,
    ) -> Result<Batch>;

    fn compute_aggregations_with_groupby(
        &self,
        batch: &Batch,
        descriptor: &OperatorDescriptor,
    ) -> Result<Batch>;

    fn hash_partition(
        &self,
        batch: &Batch,
        hash_columns: &[usize],
        num_partitions: usize,
    ) -> Result<(Batch, Vec<usize>)>;

    fn split(&self, batch: &Batch, split_indexes: &[usize]) -> Result<Vec<Batch>>;

    fn concat_tables(&self, batches: &[Batch]) -> Result<Batch>;

    fn check_if_concatenating_strings_will_overflow(&self, batches: &[Batch]) -> bool;

    fn create_empty_table(&self, schema: SchemaRef) -> Batch;

    /// Provided: delegates to the pure rewrite function in `operators`.
    fn mod_group_by_parameters_for_merge(
        &self,
        descriptor: &OperatorDescriptor,
        concatenated_column_names: &[String],
    ) -> Result<OperatorDescriptor> {
        mod_groupby_parameters_for_merge(descriptor, concatenated_column_names)
    }
}

/// Applies `descriptor` to `batch` by selecting the behavior named in spec
/// ยง4.4's operator-shape table. Shared by `ComputeAggregateKernel` and
/// `MergeAggregateKernel`, which the spec requires apply operators "exactly
/// as ComputeAggregate applies them".
pub fn apply_operator(
    batch: &Batch,
    descriptor: &OperatorDescriptor,
    primitives: &dyn AggregatePrimitives,
) -> Result<Batch> {
    if descriptor.is_standard_groupby() {
        primitives.compute_aggregations_with_groupby(batch, descriptor)
    } else if descriptor.is_scalar_aggregate() {
        primitives.compute_aggregations_without_groupby(batch, descriptor)
    } else if descriptor.is_group_only() {
        primitives.compute_groupby_without_aggregations(batch, &descriptor.group_column_indices)
    } else {
        Err(Error::parse(
            "operator descriptor has neither group columns nor aggregations",
        ))
    }
}

/// Resolves a textual aggregate-input expression to a column: an index
/// (emitted by the parser for compute-stage expressions) or a column name
/// (emitted by the merge rewrite, which only knows post-concat aliases).
fn resolve_column(batch: &Batch, expr: &str) -> Result<ArrayRef> {
    if let Ok(idx) = expr.parse::<usize>() {
        if idx >= batch.num_columns() {
            return Err(Error::schema_mismatch(format!(
                "column index {} out of range (batch has {} columns)",
                idx,
                batch.num_columns()
            )));
        }
        return Ok(batch.column(idx).clone());
    }
    let idx = batch
        .schema()
        .index_of(expr)
        .map_err(|_| Error::schema_mismatch(format!("no column named {:?}", expr)))?;
    Ok(batch.column(idx).clone())
}

fn group_key_columns(batch: &Batch, group_indices: &[usize]) -> Result<Vec<Int64Array>> {
    group_indices
        .iter()
        .map(|&idx| {
            if idx >= batch.num_columns() {
                return Err(Error::schema_mismatch(format!(
                    "group column index {} out of range",
                    idx
                )));
            }
            let col = batch.column(idx);
            let casted = cast(col, &DataType::Int64)?;
            Ok(casted.as_any().downcast_ref::<Int64Array>().unwrap().clone())
        })
        .collect()
}

/// Buckets row indices by composite group key, preserving first-appearance
/// order across groups (spec ยง5 notes Merge's concatenation is
/// order-insensitive, but a deterministic group order makes tests easy to
/// assert against).
fn group_rows(keys: &[Int64Array], num_rows: usize) -> (Vec<Vec<i64>>, Vec<Vec<usize>>) {
    let mut order: Vec<Vec<i64>> = Vec::new();
    let mut index_of: HashMap<Vec<i64>, usize> = HashMap::new();
    let mut rows_by_group: Vec<Vec<usize>> = Vec::new();
    for row in 0..num_rows {
        let key: Vec<i64> = keys.iter().map(|c| c.value(row)).collect();
        let group = match index_of.entry(key.clone()) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                let g = order.len();
                order.push(key);
                rows_by_group.push(Vec::new());
                e.insert(g);
                g
            }
        };
        rows_by_group[group].push(row);
    }
    (order, rows_by_group)
}

fn f64_value(arr: &ArrayRef, row: usize) -> Option<f64> {
    let arr = arr.as_any().downcast_ref::<Float64Array>()?;
    if arr.is_valid(row) {
        Some(arr.value(row))
    } else {
        None
    }
}

fn bits_key(v: f64) -> u64 {
    v.to_bits()
}

struct Accumulated {
    field: Field,
    array: ArrayRef,
}

fn accumulate(
    ty: AggregationType,
    alias: &str,
    values: &ArrayRef,
    rows_by_group: &[Vec<usize>],
) -> Result<Vec<Accumulated>> {
    match ty {
        AggregationType::Sum | AggregationType::Sum0 => {
            let mut b = Float64Builder::with_capacity(rows_by_group.len());
            for rows in rows_by_group {
                let mut acc = 0.0;
                let mut any_valid = false;
                for &r in rows {
                    if let Some(v) = f64_value(values, r) {
                        acc += v;
                        any_valid = true;
                    }
                }
                if any_valid || matches!(ty, AggregationType::Sum0) {
                    b.append_value(acc);
                } else {
                    b.append_null();
                }
            }
            Ok(vec![Accumulated {
                field: Field::new(alias, DataType::Float64, true),
                array: Arc::new(b.finish()),
            }])
        }
        AggregationType::Min | AggregationType::Max => {
            let mut b = Float64Builder::with_capacity(rows_by_group.len());
            for rows in rows_by_group {
                let mut best: Option<f64> = None;
                for &r in rows {
                    if let Some(v) = f64_value(values, r) {
                        best = Some(match (best, ty) {
                            (None, _) => v,
                            (Some(cur), AggregationType::Min) => cur.min(v),
                            (Some(cur), _) => cur.max(v),
                        });
                    }
                }
                match best {
                    Some(v) => b.append_value(v),
                    None => b.append_null(),
                }
            }
            Ok(vec![Accumulated {
                field: Field::new(alias, DataType::Float64, true),
                array: Arc::new(b.finish()),
            }])
        }
        AggregationType::CountValid => {
            let mut b = Int64Builder::with_capacity(rows_by_group.len());
            for rows in rows_by_group {
                let n = rows.iter().filter(|&&r| f64_value(values, r).is_some()).count();
                b.append_value(n as i64);
            }
            Ok(vec![Accumulated {
                field: Field::new(alias, DataType::Int64, false),
                array: Arc::new(b.finish()),
            }])
        }
        AggregationType::CountAll => {
            let mut b = Int64Builder::with_capacity(rows_by_group.len());
            for rows in rows_by_group {
                b.append_value(rows.len() as i64);
            }
            Ok(vec![Accumulated {
                field: Field::new(alias, DataType::Int64, false),
                array: Arc::new(b.finish()),
            }])
        }
        AggregationType::Mean => {
            let mut sums = Float64Builder::with_capacity(rows_by_group.len());
            let mut counts = Int64Builder::with_capacity(rows_by_group.len());
            for rows in rows_by_group {
                let mut acc = 0.0;
                let mut n = 0i64;
                for &r in rows {
                    if let Some(v) = f64_value(values, r) {
                        acc += v;
                        n += 1;
                    }
                }
                sums.append_value(acc);
                counts.append_value(n);
            }
            Ok(vec![
                Accumulated {
                    field: Field::new(format!("{alias}__sum"), DataType::Float64, false),
                    array: Arc::new(sums.finish()),
                },
                Accumulated {
                    field: Field::new(format!("{alias}__count"), DataType::Int64, false),
                    array: Arc::new(counts.finish()),
                },
            ])
        }
        AggregationType::NthElement(n) => {
            let mut b = Float64Builder::with_capacity(rows_by_group.len());
            for rows in rows_by_group {
                match rows.get(n as usize).and_then(|&r| f64_value(values, r)) {
                    Some(v) => b.append_value(v),
                    None => b.append_null(),
                }
            }
            Ok(vec![Accumulated {
                field: Field::new(alias, DataType::Float64, true),
                array: Arc::new(b.finish()),
            }])
        }
        AggregationType::CountDistinct => {
            if matches!(values.data_type(), DataType::List(_)) {
                // Merge-time re-aggregation: flatten each group's partial
                // distinct-value lists and count the union.
                let list = values.as_any().downcast_ref::<ListArray>().unwrap();
                let mut b = Int64Builder::with_capacity(rows_by_group.len());
                for rows in rows_by_group {
                    let mut seen = std::collections::HashSet::new();
                    for &r in rows {
                        if list.is_valid(r) {
                            let inner = list.value(r);
                            let inner = inner.as_any().downcast_ref::<Float64Array>().unwrap();
                            for i in 0..inner.len() {
                                if inner.is_valid(i) {
                                    seen.insert(bits_key(inner.value(i)));
                                }
                            }
                        }
                    }
                    b.append_value(seen.len() as i64);
                }
                Ok(vec![Accumulated {
                    field: Field::new(alias, DataType::Int64, false),
                    array: Arc::new(b.finish()),
                }])
            } else {
                // Compute-time partial pass: emit the set of distinct
                // values seen in this group *within this batch*, so merge
                // can later recombine sets instead of summing counts.
                let mut b = ListBuilder::new(Float64Builder::new());
                for rows in rows_by_group {
                    let mut seen = std::collections::HashSet::new();
                    for &r in rows {
                        if let Some(v) = f64_value(values, r) {
                            seen.insert(bits_key(v));
                        }
                    }
                    for bits in seen {
                        b.values().append_value(f64::from_bits(bits));
                    }
                    b.append(true);
                }
                Ok(vec![Accumulated {
                    field: Field::new(
                        alias,
                        DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
                        true,
                    ),
                    array: Arc::new(b.finish()),
                }])
            }
        }
    }
}

/// Resolves one aggregation term against `batch` and accumulates it per
/// group. Handles the merge-time MEAN encoding (spec ยง4.6
/// "pair-wise SUM/SUM0 then divide"): `expr` of the form `"sum_col,count_col"`
/// divides the two summed columns back into a single mean, rather than
/// re-deriving `__sum`/`__count` partials from a nonexistent raw column.
fn aggregate_term(
    batch: &Batch,
    ty: AggregationType,
    expr: &str,
    alias: &str,
    rows_by_group: &[Vec<usize>],
) -> Result<Vec<Accumulated>> {
    if ty == AggregationType::Mean {
        if let Some((sum_expr, count_expr)) = expr.split_once(',') {
            let sums = cast(&resolve_column(batch, sum_expr.trim())?, &DataType::Float64)?;
            let counts = cast(&resolve_column(batch, count_expr.trim())?, &DataType::Float64)?;
            let mut b = Float64Builder::with_capacity(rows_by_group.len());
            for rows in rows_by_group {
                let mut sum_acc = 0.0;
                let mut count_acc = 0.0;
                for &r in rows {
                    if let Some(v) = f64_value(&sums, r) {
                        sum_acc += v;
                    }
                    if let Some(v) = f64_value(&counts, r) {
                        count_acc += v;
                    }
                }
                if count_acc > 0.0 {
                    b.append_value(sum_acc / count_acc);
                } else {
                    b.append_null();
                }
            }
            return Ok(vec![Accumulated {
                field: Field::new(alias, DataType::Float64, true),
                array: Arc::new(b.finish()),
            }]);
        }
    }
    let values = resolve_column(batch, expr)?;
    // Compute/merge both hand this whatever numeric type the upstream column
    // happens to be (Int64 input columns, Int64 COUNT_VALID/COUNT_ALL
    // partials folded back through SUM, ...); `accumulate` only reads
    // Float64 via `f64_value`, so normalize here -- except the COUNT_DISTINCT
    // partial-list column, which is a `List<Float64>` `accumulate` inspects
    // directly and casting would reject.
    let values = if matches!(values.data_type(), DataType::List(_)) {
        values
    } else {
        cast(&values, &DataType::Float64)?
    };
    accumulate(ty, alias, &values, rows_by_group)
}

fn build_group_key_fields(batch: &Batch, group_indices: &[usize]) -> Vec<Field> {
    group_indices
        .iter()
        .map(|&idx| Field::new(batch.schema().field(idx).name(), DataType::Int64, true))
        .collect()
}

fn group_key_arrays(order: &[Vec<i64>], num_groups: usize, num_keys: usize) -> Vec<ArrayRef> {
    (0..num_keys)
        .map(|k| {
            let mut b = Int64Builder::with_capacity(num_groups);
            for key in order {
                b.append_value(key[k]);
            }
            Arc::new(b.finish()) as ArrayRef
        })
        .collect()
}

/// Hashes a composite `i64` key the way `hash_partition` buckets rows.
fn hash_key(key: &[i64]) -> u64 {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct ArrowAggregatePrimitives;

impl AggregatePrimitives for ArrowAggregatePrimitives {
    fn compute_groupby_without_aggregations(
        &self,
        batch: &Batch,
        group_indices: &[usize],
    ) -> Result<Batch> {
        let keys = group_key_columns(batch, group_indices)?;
        let (order, _rows_by_group) = group_rows(&keys, batch.num_rows());
        let fields = build_group_key_fields(batch, group_indices);
        let arrays = group_key_arrays(&order, order.len(), group_indices.len());
        let schema = Arc::new(Schema::new(fields));
        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    fn compute_aggregations_without_groupby(
        &self,
        batch: &Batch,
        descriptor: &OperatorDescriptor,
    ) -> Result<Batch> {
        let rows_by_group = vec![(0..batch.num_rows()).collect::<Vec<usize>>()];
        let mut fields = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::new();
        for ((ty, expr), alias) in descriptor
            .aggregation_types
            .iter()
            .zip(descriptor.aggregation_input_expressions.iter())
            .zip(descriptor.aggregation_column_assigned_aliases.iter())
        {
            for acc in aggregate_term(batch, *ty, expr, alias, &rows_by_group)? {
                fields.push(acc.field);
                arrays.push(acc.array);
            }
        }
        let schema = Arc::new(Schema::new(fields));
        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    fn compute_aggregations_with_groupby(
        &self,
        batch: &Batch,
        descriptor: &OperatorDescriptor,
    ) -> Result<Batch> {
        let keys = group_key_columns(batch, &descriptor.group_column_indices)?;
        let (order, rows_by_group) = group_rows(&keys, batch.num_rows());

        let mut fields = build_group_key_fields(batch, &descriptor.group_column_indices);
        let mut arrays = group_key_arrays(&order, order.len(), descriptor.group_column_indices.len());

        for ((ty, expr), alias) in descriptor
            .aggregation_types
            .iter()
            .zip(descriptor.aggregation_input_expressions.iter())
            .zip(descriptor.aggregation_column_assigned_aliases.iter())
        {
            for acc in aggregate_term(batch, *ty, expr, alias, &rows_by_group)? {
                fields.push(acc.field);
                arrays.push(acc.array);
            }
        }
        let schema = Arc::new(Schema::new(fields));
        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    fn hash_partition(
        &self,
        batch: &Batch,
        hash_columns: &[usize],
        num_partitions: usize,
    ) -> Result<(Batch, Vec<usize>)> {
        if num_partitions == 0 {
            return Err(Error::compute("hash_partition requires num_partitions > 0"));
        }
        let keys = group_key_columns(batch, hash_columns)?;
        let num_rows = batch.num_rows();

        let mut partition_of_row = Vec::with_capacity(num_rows);
        for row in 0..num_rows {
            let key: Vec<i64> = keys.iter().map(|c| c.value(row)).collect();
            let p = (hash_key(&key) as usize) % num_partitions;
            partition_of_row.push(p);
        }

        // Stable-partition row indices by bucket, preserving original order
        // within a bucket.
        let mut indices: Vec<u32> = Vec::with_capacity(num_rows);
        let mut offsets = vec![0usize; num_partitions];
        for p in 0..num_partitions {
            let start = indices.len();
            offsets[p] = start;
            for row in 0..num_rows {
                if partition_of_row[row] == p {
                    indices.push(row as u32);
                }
            }
        }

        let indices_array = arrow::array::UInt32Array::from(indices);
        let columns = batch
            .columns()
            .iter()
            .map(|c| take(c, &indices_array, None).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        let reordered = RecordBatch::try_new(batch.schema(), columns)?;
        Ok((reordered, offsets))
    }

    fn split(&self, batch: &Batch, split_indexes: &[usize]) -> Result<Vec<Batch>> {
        let mut out = Vec::with_capacity(split_indexes.len() + 1);
        let mut prev = 0usize;
        for &idx in split_indexes {
            out.push(batch.slice(prev, idx.saturating_sub(prev)));
            prev = idx;
        }
        out.push(batch.slice(prev, batch.num_rows() - prev));
        Ok(out)
    }

    fn concat_tables(&self, batches: &[Batch]) -> Result<Batch> {
        if batches.is_empty() {
            return Err(Error::compute("concat_tables requires at least one batch"));
        }
        let schema = batches[0].schema();
        Ok(concat_batches(&schema, batches)?)
    }

    fn check_if_concatenating_strings_will_overflow(&self, batches: &[Batch]) -> bool {
        for (col_idx, field) in batches
            .first()
            .map(|b| b.schema().fields().clone())
            .unwrap_or_default()
            .iter()
            .enumerate()
        {
            if *field.data_type() != DataType::Utf8 {
                continue;
            }
            let total_bytes: usize = batches
                .iter()
                .filter_map(|b| b.column(col_idx).as_any().downcast_ref::<arrow::array::StringArray>())
                .map(|a| a.value_data().len())
                .sum();
            if total_bytes > i32::MAX as usize {
                return true;
            }
        }
        false
    }

    fn create_empty_table(&self, schema: SchemaRef) -> Batch {
        RecordBatch::new_empty(schema)
    }
}
