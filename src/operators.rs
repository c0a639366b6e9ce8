//! The parsed `GROUP BY` expression (spec ยง3 "Operator descriptor") and the
//! merge-side operator rewrite rule (spec ยง4.6, ยง9 "Dynamic operator
//! dispatch"). Aggregation operators are a closed tagged variant: no open
//! extensibility at this layer, matching the design note that ruled out a
//! trait-object-per-operator approach.

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationType {
    Sum,
    CountValid,
    CountAll,
    Min,
    Max,
    Mean,
    Sum0,
    NthElement(u32),
    CountDistinct,
}

impl AggregationType {
    fn name(&self) -> &'static str {
        match self {
            AggregationType::Sum => "SUM",
            AggregationType::CountValid => "COUNT_VALID",
            AggregationType::CountAll => "COUNT_ALL",
            AggregationType::Min => "MIN",
            AggregationType::Max => "MAX",
            AggregationType::Mean => "MEAN",
            AggregationType::Sum0 => "SUM0",
            AggregationType::NthElement(_) => "NTH_ELEMENT",
            AggregationType::CountDistinct => "COUNT_DISTINCT",
        }
    }

    /// The operator this one becomes when re-applied over already-partial
    /// results concatenated from multiple batches/nodes (spec ยง4.6).
    ///
    /// Every variant maps to a fixed point of this function, which is what
    /// makes the rewrite idempotent (spec ยง8 invariant 7): rewriting an
    /// already-rewritten descriptor is a no-op.
    fn merge_counterpart(&self) -> AggregationType {
        match self {
            AggregationType::CountValid | AggregationType::CountAll => AggregationType::Sum,
            other => *other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorDescriptor {
    pub group_column_indices: Vec<usize>,
    pub aggregation_input_expressions: Vec<String>,
    pub aggregation_types: Vec<AggregationType>,
    pub aggregation_column_assigned_aliases: Vec<String>,
}

impl OperatorDescriptor {
    /// Standard GROUP BY: both group columns and aggregations present.
    pub fn is_standard_groupby(&self) -> bool {
        !self.group_column_indices.is_empty() && !self.aggregation_types.is_empty()
    }

    /// Distinct/group-only: group columns present, no aggregations.
    pub fn is_group_only(&self) -> bool {
        !self.group_column_indices.is_empty() && self.aggregation_types.is_empty()
    }

    /// Scalar aggregate: aggregations present, no GROUP BY.
    pub fn is_scalar_aggregate(&self) -> bool {
        self.group_column_indices.is_empty() && !self.aggregation_types.is_empty()
    }
}

/// Parses the small concrete grammar this expansion defines for the
/// otherwise-external planner contract (SPEC_FULL ยง6): a `|`-delimited
/// triple `groups|aggs|aliases`, e.g. `0|SUM(1),COUNT_ALL()|total_v,n`.
pub fn parse_group_by_expression(expr: &str) -> Result<OperatorDescriptor> {
    let parts: Vec<&str> = expr.split('|').collect();
    if parts.len() != 3 {
        return Err(Error::parse(format!(
            "expected 3 `|`-delimited sections (groups|aggs|aliases), got {}",
            parts.len()
        )));
    }
    let (groups_str, aggs_str, aliases_str) = (parts[0].trim(), parts[1].trim(), parts[2].trim());

    let group_column_indices = if groups_str.is_empty() {
        Vec::new()
    } else {
        groups_str
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<usize>()
                    .map_err(|e| Error::parse(format!("bad group column index {:?}: {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let (aggregation_types, aggregation_input_expressions) = if aggs_str.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        let mut types = Vec::new();
        let mut exprs = Vec::new();
        for term in aggs_str.split(',') {
            let term = term.trim();
            let open = term
                .find('(')
                .ok_or_else(|| Error::parse(format!("malformed aggregate term {:?}", term)))?;
            if !term.ends_with(')') {
                return Err(Error::parse(format!("malformed aggregate term {:?}", term)));
            }
            let name = &term[..open];
            let inner = &term[open + 1..term.len() - 1];
            let ty = match name {
                "SUM" => AggregationType::Sum,
                "COUNT_VALID" => AggregationType::CountValid,
                "COUNT_ALL" => AggregationType::CountAll,
                "MIN" => AggregationType::Min,
                "MAX" => AggregationType::Max,
                "MEAN" => AggregationType::Mean,
                "SUM0" => AggregationType::Sum0,
                "COUNT_DISTINCT" => AggregationType::CountDistinct,
                "NTH_ELEMENT" => {
                    let mut args = inner.split(',');
                    let _expr_arg = args.next();
                    let n: u32 = args
                        .next()
                        .ok_or_else(|| Error::parse("NTH_ELEMENT requires (expr, n)"))?
                        .trim()
                        .parse()
                        .map_err(|e| Error::parse(format!("bad NTH_ELEMENT index: {}", e)))?;
                    types.push(AggregationType::NthElement(n));
                    exprs.push(inner.split(',').next().unwrap_or("").trim().to_string());
                    continue;
                }
                other => return Err(Error::parse(format!("unknown aggregation type {:?}", other))),
            };
            types.push(ty);
            exprs.push(inner.trim().to_string());
        }
        (types, exprs)
    };

    let aggregation_column_assigned_aliases = if aliases_str.is_empty() {
        Vec::new()
    } else {
        aliases_str.split(',').map(|s| s.trim().to_string()).collect()
    };

    if aggregation_types.is_empty() != aggregation_column_assigned_aliases.is_empty()
        || (!aggregation_types.is_empty()
            && aggregation_types.len() != aggregation_column_assigned_aliases.len())
    {
        return Err(Error::parse(
            "number of aliases must match number of aggregations",
        ));
    }

    let descriptor = OperatorDescriptor {
        group_column_indices,
        aggregation_input_expressions,
        aggregation_types,
        aggregation_column_assigned_aliases,
    };

    if descriptor.group_column_indices.is_empty() && descriptor.aggregation_types.is_empty() {
        // Spec ยง9: unreachable by current planner output; treat constructing
        // a kernel for this shape as a programming error rather than a
        // silent no-op.
        return Err(Error::parse(
            "GROUP BY expression has neither group columns nor aggregations",
        ));
    }

    Ok(descriptor)
}

/// The merge-side operator rewrite (spec ยง4.6): maps each original operator
/// to its merging counterpart, and points its input expression at the alias
/// the compute stage assigned it (the only thing merge sees is `alias`
/// columns on the concatenated partials, not the original input schema).
pub fn mod_groupby_parameters_for_merge(
    descriptor: &OperatorDescriptor,
    concatenated_column_names: &[String],
) -> Result<OperatorDescriptor> {
    let mut aggregation_types = Vec::with_capacity(descriptor.aggregation_types.len());
    let mut aggregation_input_expressions = Vec::with_capacity(descriptor.aggregation_types.len());

    for (ty, alias) in descriptor
        .aggregation_types
        .iter()
        .zip(descriptor.aggregation_column_assigned_aliases.iter())
    {
        let rewritten = ty.merge_counterpart();
        let expr = match ty {
            AggregationType::Mean => {
                let sum_col = format!("{alias}__sum");
                let count_col = format!("{alias}__count");
                if !concatenated_column_names.contains(&sum_col)
                    || !concatenated_column_names.contains(&count_col)
                {
                    return Err(Error::schema_mismatch(format!(
                        "MEAN merge expected columns {:?} and {:?}",
                        sum_col, count_col
                    )));
                }
                // Encodes the pair-wise SUM/SUM0-then-divide merge (spec
                // ยง4.6); `accumulate` splits this back into two columns.
                format!("{sum_col},{count_col}")
            }
            _ => {
                if !concatenated_column_names.contains(alias) {
                    return Err(Error::schema_mismatch(format!(
                        "merge expected column {:?} (aggregate type {})",
                        alias,
                        ty.name()
                    )));
                }
                alias.clone()
            }
        };
        aggregation_types.push(rewritten);
        aggregation_input_expressions.push(expr);
    }

    // Group columns survive concatenation under their original aliases
    // (ComputeAggregate names the group-key output columns after the input
    // schema's own column names); re-grouping at merge time uses the same
    // ordinal positions in the concatenated batch.
    Ok(OperatorDescriptor {
        group_column_indices: descriptor.group_column_indices.clone(),
        aggregation_input_expressions,
        aggregation_types,
        aggregation_column_assigned_aliases: descriptor.aggregation_column_assigned_aliases.clone(),
    })
}
