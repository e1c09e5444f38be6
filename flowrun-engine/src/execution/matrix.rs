// Matrix Strategy Expansion
// Expands matrix axes into concrete job instances

use crate::definition::{JobDefinition, MatrixAxis};
use crate::error::{EngineError, EngineResult};
use crate::execution::report::RunId;

use indexmap::IndexMap;

use std::sync::Arc;

/// One concrete combination of matrix values for a job
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub run_id: RunId,
    pub definition: Arc<JobDefinition>,
    /// Position within the job's matrix (0-based)
    pub index: usize,
    /// Number of instances of the job
    pub total: usize,
    /// One value per axis, in axis declaration order
    pub values: IndexMap<String, String>,
}

impl JobInstance {
    /// Human readable label, e.g. `test (./a)`
    pub fn label(&self) -> String {
        if self.values.is_empty() {
            return self.definition.display_name().to_string();
        }
        let values: Vec<&str> = self.values.values().map(String::as_str).collect();
        format!("{} ({})", self.definition.display_name(), values.join(", "))
    }

    /// Unique key of the instance within its run
    pub fn key(&self) -> String {
        format!("{}-{}", self.definition.id, self.index)
    }
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Cartesian product of the axes.
    ///
    /// The first axis varies slowest and values keep their declared order.
    /// No axes yields a single empty combination.
    pub fn combinations(axes: &[MatrixAxis]) -> Vec<IndexMap<String, String>> {
        let mut combinations = vec![IndexMap::new()];

        for axis in axes {
            let mut next = Vec::with_capacity(combinations.len() * axis.values.len());
            for partial in &combinations {
                for value in &axis.values {
                    let mut combination = partial.clone();
                    combination.insert(axis.name.clone(), value.clone());
                    next.push(combination);
                }
            }
            combinations = next;
        }

        combinations
    }

    /// Expand one job into its instances
    pub fn expand(definition: &Arc<JobDefinition>, run_id: &RunId) -> EngineResult<Vec<JobInstance>> {
        if let Some(axis) = definition
            .strategy
            .axes
            .iter()
            .find(|axis| axis.values.is_empty())
        {
            return Err(EngineError::EmptyAxis {
                job: definition.id.clone(),
                axis: axis.name.clone(),
            });
        }

        let combinations = Self::combinations(&definition.strategy.axes);
        let total = combinations.len();

        Ok(combinations
            .into_iter()
            .enumerate()
            .map(|(index, values)| JobInstance {
                run_id: run_id.clone(),
                definition: Arc::clone(definition),
                index,
                total,
                values,
            })
            .collect())
    }

    /// Expand every job, failing before anything is returned if any job
    /// has an empty axis
    pub fn expand_all(
        definitions: &[Arc<JobDefinition>],
        run_id: &RunId,
    ) -> EngineResult<Vec<JobInstance>> {
        let mut instances = Vec::new();
        for definition in definitions {
            instances.extend(Self::expand(definition, run_id)?);
        }
        Ok(instances)
    }
}
