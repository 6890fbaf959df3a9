//! Training state that travels with an internal snapshot.
//!
//! This module defines the progress counters, optimizer state and EMA state
//! persisted next to the model weights, and the traits through which the
//! training loop hands that state to the checkpoint engine.

use kiln_tensor::{Tensor, TensorMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Position of a training run.
///
/// Only `global_step` is strictly increasing over a run; the other counters
/// reset at epoch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrainProgress {
    /// Completed epochs.
    pub epoch: u64,
    /// Step within the current epoch.
    pub epoch_step: u64,
    /// Sample within the current epoch.
    pub epoch_sample: u64,
    /// Steps since the start of training.
    pub global_step: u64,
}

impl TrainProgress {
    /// Creates progress counters.
    pub fn new(epoch: u64, epoch_step: u64, epoch_sample: u64, global_step: u64) -> Self {
        Self {
            epoch,
            epoch_step,
            epoch_sample,
            global_step,
        }
    }
}

/// Hyperparameters of one optimizer parameter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroupState {
    /// Group name, e.g. `"transformer"`.
    pub name: String,

    /// Learning rate at checkpoint time.
    pub learning_rate: f64,

    /// Weight decay coefficient.
    pub weight_decay: f64,

    /// Parameters belonging to this group.
    pub params: Vec<String>,
}

impl ParamGroupState {
    /// Create a parameter group with no weight decay.
    pub fn new(name: impl Into<String>, learning_rate: f64) -> Self {
        Self {
            name: name.into(),
            learning_rate,
            weight_decay: 0.0,
            params: Vec::new(),
        }
    }

    /// Set the weight decay.
    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Add parameters to the group.
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }
}

/// Serializable optimizer state.
///
/// `state` maps each parameter name to its buffers (for Adam-like optimizers
/// `exp_avg` and `exp_avg_sq`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Name of the optimizer (e.g., "adamw", "sgd").
    pub optimizer_type: String,

    /// Optimizer steps taken.
    pub step: u64,

    /// Parameter groups with their hyperparameters.
    pub param_groups: Vec<ParamGroupState>,

    /// Per-parameter buffers.
    pub state: BTreeMap<String, TensorMap>,
}

impl OptimizerState {
    /// Create an empty optimizer state.
    pub fn new(optimizer_type: impl Into<String>) -> Self {
        Self {
            optimizer_type: optimizer_type.into(),
            step: 0,
            param_groups: Vec::new(),
            state: BTreeMap::new(),
        }
    }

    /// Set the step counter.
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Add a parameter group.
    pub fn add_param_group(&mut self, group: ParamGroupState) {
        self.param_groups.push(group);
    }

    /// Set one buffer of one parameter.
    pub fn set_buffer(&mut self, param: impl Into<String>, buffer: impl Into<String>, value: Tensor) {
        self.state
            .entry(param.into())
            .or_default()
            .insert(buffer, value);
    }

    /// Get one buffer of one parameter.
    pub fn buffer(&self, param: &str, buffer: &str) -> Option<&Tensor> {
        self.state.get(param).and_then(|buffers| buffers.get(buffer))
    }

    /// Total number of buffered tensors.
    pub fn num_buffers(&self) -> usize {
        self.state.values().map(TensorMap::len).sum()
    }
}

/// Serializable exponential-moving-average state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    /// Smoothing factor.
    pub decay: f64,

    /// Number of EMA updates applied.
    pub update_step: u64,

    /// Shadow weights, keyed like the model they track.
    pub shadow: TensorMap,
}

impl EmaState {
    /// Create EMA state from shadow weights.
    pub fn new(decay: f64, shadow: TensorMap) -> Self {
        Self {
            decay,
            update_step: 0,
            shadow,
        }
    }

    /// Set the update counter.
    pub fn with_update_step(mut self, update_step: u64) -> Self {
        self.update_step = update_step;
        self
    }
}

/// Source of optimizer state for a snapshot.
pub trait OptimizerHandle: Send {
    /// Returns the current optimizer state.
    fn state_dict(&self) -> OptimizerState;
}

/// Source of EMA state for a snapshot.
pub trait EmaHandle: Send {
    /// Returns the current EMA state.
    fn state_dict(&self) -> EmaState;
}

impl OptimizerHandle for OptimizerState {
    fn state_dict(&self) -> OptimizerState {
        self.clone()
    }
}

impl EmaHandle for EmaState {
    fn state_dict(&self) -> EmaState {
        self.clone()
    }
}
