use ndarray::{Array4, ArrayView4};
use shared::{ClassProbability, ClassificationResult, UNRELATED_CLASS, UNRELATED_DESCRIPTION};
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use super::labels::LabelTable;
use super::runtime::InferenceRuntime;
use super::ModelError;

/// What to apply to raw model outputs before they are read as probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputActivation {
    /// The exported graph already ends in a softmax.
    Identity,
    Softmax,
}

impl FromStr for OutputActivation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" => Ok(OutputActivation::Identity),
            "softmax" => Ok(OutputActivation::Softmax),
            other => Err(format!("unknown output activation '{}'", other)),
        }
    }
}

impl OutputActivation {
    fn apply(self, scores: Vec<f32>) -> Vec<f32> {
        match self {
            OutputActivation::Identity => scores,
            OutputActivation::Softmax => {
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f32 = exps.iter().sum();
                exps.into_iter().map(|e| e / sum).collect()
            }
        }
    }
}

/// Owns the process-wide model artifact and turns score vectors into
/// labelled results.
///
/// The runtime is installed at most once and never replaced. Calls into it
/// are serialized behind a mutex because not every inference runtime
/// tolerates concurrent invocation.
pub struct ModelHandler {
    runtime: OnceLock<Mutex<Box<dyn InferenceRuntime>>>,
    labels: LabelTable,
    threshold: Option<f32>,
    activation: OutputActivation,
    input_shape: [usize; 4],
}

impl ModelHandler {
    pub fn new(labels: LabelTable, threshold: Option<f32>, input_shape: [usize; 4]) -> Self {
        Self {
            runtime: OnceLock::new(),
            labels,
            threshold,
            activation: OutputActivation::Identity,
            input_shape,
        }
    }

    pub fn with_activation(mut self, activation: OutputActivation) -> Self {
        self.activation = activation;
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.runtime.get().is_some()
    }

    /// Installs the runtime after probing it with a zero tensor. A model whose
    /// output cardinality disagrees with the label table is rejected.
    pub fn install(&self, mut runtime: Box<dyn InferenceRuntime>) -> Result<(), ModelError> {
        if self.is_loaded() {
            return Err(ModelError::AlreadyLoaded);
        }

        let probe = Array4::<f32>::zeros(self.input_shape);
        let scores = runtime.run(probe.view())?;
        self.check_cardinality(scores.len())?;

        log::info!(
            "Model '{}' ready: {} classes, input shape {:?}, {:?} outputs, threshold {:?}",
            runtime.name(),
            self.labels.len(),
            self.input_shape,
            self.activation,
            self.threshold
        );
        self.runtime
            .set(Mutex::new(runtime))
            .map_err(|_| ModelError::AlreadyLoaded)
    }

    pub fn predict(&self, tensor: ArrayView4<'_, f32>) -> Result<ClassificationResult, ModelError> {
        let runtime = self.runtime.get().ok_or(ModelError::NotLoaded)?;

        if tensor.shape() != &self.input_shape[..] {
            return Err(ModelError::ShapeMismatch {
                expected: self.input_shape.to_vec(),
                got: tensor.shape().to_vec(),
            });
        }

        let scores = {
            let mut guard = runtime.lock().map_err(|_| ModelError::Poisoned)?;
            guard.run(tensor)?
        };
        self.check_cardinality(scores.len())?;
        self.classify(&self.activation.apply(scores))
    }

    fn check_cardinality(&self, outputs: usize) -> Result<(), ModelError> {
        if outputs != self.labels.len() {
            return Err(ModelError::LabelMismatch {
                outputs,
                labels: self.labels.len(),
            });
        }
        Ok(())
    }

    fn classify(&self, scores: &[f32]) -> Result<ClassificationResult, ModelError> {
        let (index, score) = argmax(scores).ok_or(ModelError::NoScores)?;
        let confidence = clamp_unit(score);
        let label = self.labels.get(index).ok_or(ModelError::LabelMismatch {
            outputs: scores.len(),
            labels: self.labels.len(),
        })?;

        let probabilities = self
            .labels
            .iter()
            .zip(scores)
            .map(|(label, &score)| ClassProbability {
                class: label.code.clone(),
                probability: round4(clamp_unit(score)),
            })
            .collect();

        let gated = self.threshold.is_some_and(|threshold| confidence < threshold);
        let (predicted_class, description) = if gated {
            log::debug!(
                "Top score {:.4} for '{}' is below threshold, reporting unrelated",
                confidence,
                label.code
            );
            (UNRELATED_CLASS.to_string(), UNRELATED_DESCRIPTION.to_string())
        } else {
            (label.code.clone(), label.description.clone())
        };

        Ok(ClassificationResult {
            predicted_class,
            description,
            confidence,
            probabilities,
        })
    }
}

/// Index and value of the largest finite score; the first index wins ties.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| !score.is_nan())
        .fold(None, |best, (index, score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((index, score)),
        })
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn round4(value: f32) -> f32 {
    (value * 10_000.0).round() / 10_000.0
}
