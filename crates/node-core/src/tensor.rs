//! Layered model tensors and the weighted running average over them
//!
//! A model update is an ordered list of layers, each an n-dimensional array
//! of floats. On the wire a layer is a nested JSON list (or a bare number
//! for a scalar layer).

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{AggregatorError, Error, Result};

/// Ordered model layers
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelTensors {
    layers: Vec<ArrayD<f64>>,
}

impl ModelTensors {
    pub fn new(layers: Vec<ArrayD<f64>>) -> Self {
        Self { layers }
    }

    /// Decode the nested-list JSON form
    pub fn from_json(value: &Value) -> Result<Self> {
        let items = value.as_array().ok_or_else(|| Error::Deserialization {
            message: "model tensors must be a list of layers".to_string(),
        })?;

        let layers = items
            .iter()
            .enumerate()
            .map(|(index, layer)| decode_layer(layer).map_err(|message| Error::Deserialization {
                message: format!("layer {index}: {message}"),
            }))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { layers })
    }

    /// Encode back into the nested-list JSON form
    pub fn to_json(&self) -> Value {
        Value::Array(self.layers.iter().map(|l| encode_layer(l.view())).collect())
    }

    pub fn layers(&self) -> &[ArrayD<f64>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Total number of scalar values across all layers
    pub fn num_elements(&self) -> usize {
        self.layers.iter().map(|l| l.len()).sum()
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.layers.iter().map(|l| l.shape().to_vec()).collect()
    }

    /// Same layer count and per-layer shape
    pub fn is_compatible(&self, other: &ModelTensors) -> bool {
        self.layers.len() == other.layers.len()
            && self
                .layers
                .iter()
                .zip(&other.layers)
                .all(|(a, b)| a.shape() == b.shape())
    }

    /// Fold `other` (weight `omega`) into `self` (accumulated weight `sigma`):
    /// `A := (A·Σ + v·ω) / (Σ+ω)`, element-wise.
    pub fn weighted_fold(
        &mut self,
        sigma: f64,
        other: &ModelTensors,
        omega: f64,
    ) -> std::result::Result<(), AggregatorError> {
        if !self.is_compatible(other) {
            return Err(AggregatorError::ShapeMismatch {
                message: format!("expected {:?}, got {:?}", self.shapes(), other.shapes()),
            });
        }

        let total = sigma + omega;
        for (acc, layer) in self.layers.iter_mut().zip(&other.layers) {
            acc.zip_mut_with(layer, |a, &v| *a = (*a * sigma + v * omega) / total);
        }
        Ok(())
    }

    /// Largest absolute element-wise difference, `None` if incompatible
    pub fn max_abs_diff(&self, other: &ModelTensors) -> Option<f64> {
        if !self.is_compatible(other) {
            return None;
        }
        Some(
            self.layers
                .iter()
                .zip(&other.layers)
                .flat_map(|(a, b)| a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()))
                .fold(0.0, f64::max),
        )
    }
}

/// Batch weighted mean `Σ(v·ω)/Σω`, `None` when the inputs are empty,
/// incompatible or carry no weight
pub fn weighted_mean(updates: &[(ModelTensors, f64)]) -> Option<ModelTensors> {
    let (first, _) = updates.first()?;
    if updates.iter().any(|(u, _)| !first.is_compatible(u)) {
        return None;
    }

    let total: f64 = updates.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }

    let layers = (0..first.len())
        .map(|i| {
            let mut sum = ArrayD::<f64>::zeros(first.layers[i].raw_dim());
            for (update, weight) in updates {
                sum.scaled_add(*weight, &update.layers[i]);
            }
            sum / total
        })
        .collect();

    Some(ModelTensors { layers })
}

fn decode_layer(value: &Value) -> std::result::Result<ArrayD<f64>, String> {
    let shape = infer_shape(value);
    let mut data = Vec::with_capacity(shape.iter().product());
    collect_values(value, &shape, 0, &mut data)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| e.to_string())
}

// Shape is read down the first-element path; every other element must agree
fn infer_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut current = value;
    while let Value::Array(items) = current {
        shape.push(items.len());
        match items.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

fn collect_values(
    value: &Value,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<f64>,
) -> std::result::Result<(), String> {
    match value {
        Value::Number(n) if depth == shape.len() => {
            let x = n.as_f64().ok_or_else(|| format!("unrepresentable number {n}"))?;
            out.push(x);
            Ok(())
        }
        Value::Array(items) if depth < shape.len() && items.len() == shape[depth] => items
            .iter()
            .try_for_each(|item| collect_values(item, shape, depth + 1, out)),
        Value::Array(_) | Value::Number(_) => Err(format!("ragged array at depth {depth}")),
        other => Err(format!("non-numeric value {other}")),
    }
}

fn encode_layer(view: ArrayViewD<'_, f64>) -> Value {
    if view.ndim() == 0 {
        return view.iter().next().map(|&x| Value::from(x)).unwrap_or(Value::Null);
    }
    Value::Array(view.outer_iter().map(encode_layer).collect())
}

impl Serialize for ModelTensors {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ModelTensors {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ModelTensors::from_json(&value).map_err(de::Error::custom)
    }
}
