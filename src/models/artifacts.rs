//! Inference-only model artifacts.
//!
//! Training exports plain JSON; each format is validated once at load time
//! and then exposed through [`ProbabilityModel`].

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("Input has {actual} features, model expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Model produced a non-finite probability")]
    NonFinite,
}

/// Anything that scores a feature vector with P(positive class).
pub trait ProbabilityModel: Send + Sync {
    fn predict_probability(&self, features: &[f64]) -> Result<f64, InferenceError>;

    fn predict_label(&self, features: &[f64]) -> Result<u8, InferenceError> {
        Ok(u8::from(self.predict_probability(features)? > 0.5))
    }

    fn name(&self) -> &str;
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn check_width(expected: usize, features: &[f64]) -> Result<(), InferenceError> {
    if features.len() != expected {
        return Err(InferenceError::ShapeMismatch { expected, actual: features.len() });
    }
    Ok(())
}

fn finite(p: f64) -> Result<f64, InferenceError> {
    if p.is_finite() { Ok(p) } else { Err(InferenceError::NonFinite) }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogisticModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    pub fn validate(&self) -> Result<(), String> {
        if self.coefficients.is_empty() {
            return Err("logistic model has no coefficients".to_string());
        }
        Ok(())
    }
}

impl ProbabilityModel for LogisticModel {
    fn predict_probability(&self, features: &[f64]) -> Result<f64, InferenceError> {
        check_width(self.coefficients.len(), features)?;
        let z: f64 = self.coefficients
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.intercept;
        finite(sigmoid(z))
    }

    fn name(&self) -> &str {
        "logistic"
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        /// Branch taken for NaN inputs; defaults to `left`
        #[serde(default)]
        missing: Option<usize>,
    },
    Leaf {
        leaf: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    fn margin(&self, features: &[f64]) -> f64 {
        let mut idx = 0;
        // Validated trees are acyclic, so the walk is bounded by the node count
        for _ in 0..=self.nodes.len() {
            match &self.nodes[idx] {
                TreeNode::Leaf { leaf } => return *leaf,
                TreeNode::Split { feature, threshold, left, right, missing } => {
                    let x = features[*feature];
                    idx = if x.is_nan() {
                        missing.unwrap_or(*left)
                    } else if x < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
        f64::NAN
    }
}

/// Boosted tree ensemble with a logistic link.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TreeEnsemble {
    #[serde(default)]
    pub base_margin: f64,
    pub num_features: usize,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    pub fn validate(&self) -> Result<(), String> {
        if self.trees.is_empty() {
            return Err("tree ensemble has no trees".to_string());
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(format!("tree {} is empty", t));
            }
            for (n, node) in tree.nodes.iter().enumerate() {
                if let TreeNode::Split { feature, left, right, missing, .. } = node {
                    if *feature >= self.num_features {
                        return Err(format!("tree {} node {} splits on feature {} of {}", t, n, feature, self.num_features));
                    }
                    // Children must point forward, which also rules out cycles
                    for child in [Some(*left), Some(*right), *missing].into_iter().flatten() {
                        if child <= n || child >= tree.nodes.len() {
                            return Err(format!("tree {} node {} has invalid child {}", t, n, child));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl ProbabilityModel for TreeEnsemble {
    fn predict_probability(&self, features: &[f64]) -> Result<f64, InferenceError> {
        check_width(self.num_features, features)?;
        let margin = self.base_margin + self.trees.iter().map(|t| t.margin(features)).sum::<f64>();
        finite(sigmoid(margin))
    }

    fn name(&self) -> &str {
        "tree_ensemble"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Linear,
}

impl Activation {
    fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Linear => x,
        }
    }
}

/// Fully-connected layer; `weights[j]` holds the input weights of unit `j`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DenseNetwork {
    pub layers: Vec<DenseLayer>,
}

impl DenseNetwork {
    pub fn input_width(&self) -> usize {
        self.layers
            .first()
            .and_then(|l| l.weights.first())
            .map(|w| w.len())
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.layers.is_empty() {
            return Err("network has no layers".to_string());
        }
        let mut width = self.input_width();
        if width == 0 {
            return Err("network input layer has no weights".to_string());
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.is_empty() || layer.weights.len() != layer.bias.len() {
                return Err(format!("layer {} has {} units but {} biases", i, layer.weights.len(), layer.bias.len()));
            }
            if layer.weights.iter().any(|w| w.len() != width) {
                return Err(format!("layer {} expects {} inputs per unit", i, width));
            }
            width = layer.weights.len();
        }
        if width != 1 {
            return Err(format!("output layer has {} units, expected 1", width));
        }
        if self.layers.last().map(|l| l.activation) != Some(Activation::Sigmoid) {
            return Err("output layer must use a sigmoid activation".to_string());
        }
        Ok(())
    }
}

impl ProbabilityModel for DenseNetwork {
    fn predict_probability(&self, features: &[f64]) -> Result<f64, InferenceError> {
        check_width(self.input_width(), features)?;
        let mut activations = features.to_vec();
        for layer in &self.layers {
            activations = layer.weights
                .iter()
                .zip(&layer.bias)
                .map(|(w, b)| {
                    let z: f64 = w.iter().zip(&activations).map(|(w, x)| w * x).sum::<f64>() + b;
                    layer.activation.apply(z)
                })
                .collect();
        }
        finite(activations.first().copied().unwrap_or(f64::NAN))
    }

    fn name(&self) -> &str {
        "dense_network"
    }
}

/// Standardisation fitted during training: `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    pub fn validate(&self, width: usize) -> Result<(), String> {
        if self.mean.len() != width || self.scale.len() != width {
            return Err(format!(
                "scaler has {}/{} columns, schema has {}",
                self.mean.len(), self.scale.len(), width
            ));
        }
        Ok(())
    }

    pub fn transform(&self, features: &mut [f64]) {
        for ((x, mean), scale) in features.iter_mut().zip(&self.mean).zip(&self.scale) {
            *x -= mean;
            // Constant columns were fitted with zero variance
            if *scale != 0.0 {
                *x /= scale;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logistic_probability() {
        let model = LogisticModel { coefficients: vec![1.0, -1.0], intercept: 0.0 };
        assert_eq!(model.predict_probability(&[0.3, 0.3]).unwrap(), 0.5);
        assert!(model.predict_probability(&[2.0, 0.0]).unwrap() > 0.85);
        assert_eq!(model.predict_label(&[2.0, 0.0]).unwrap(), 1);
        assert_eq!(model.predict_label(&[0.3, 0.3]).unwrap(), 0);
    }

    #[test]
    fn test_logistic_shape_mismatch() {
        let model = LogisticModel { coefficients: vec![1.0, -1.0], intercept: 0.0 };
        assert_eq!(
            model.predict_probability(&[1.0]),
            Err(InferenceError::ShapeMismatch { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_tree_ensemble_from_json() {
        let json = r#"{
            "base_margin": 0.0,
            "num_features": 2,
            "trees": [
                {"nodes": [
                    {"feature": 0, "threshold": 0.5, "left": 1, "right": 2},
                    {"leaf": -1.0},
                    {"leaf": 1.0}
                ]},
                {"nodes": [{"leaf": 0.5}]}
            ]
        }"#;
        let model: TreeEnsemble = serde_json::from_str(json).unwrap();
        model.validate().unwrap();

        let high = model.predict_probability(&[0.9, 0.0]).unwrap();
        let low = model.predict_probability(&[0.1, 0.0]).unwrap();
        assert!((high - sigmoid(1.5)).abs() < 1e-12);
        assert!((low - sigmoid(-0.5)).abs() < 1e-12);

        // NaN follows the left branch unless a missing branch is given
        let nan = model.predict_probability(&[f64::NAN, 0.0]).unwrap();
        assert!((nan - sigmoid(-0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_tree_ensemble_rejects_cycles_and_bad_features() {
        let cyclic = TreeEnsemble {
            base_margin: 0.0,
            num_features: 1,
            trees: vec![Tree {
                nodes: vec![TreeNode::Split { feature: 0, threshold: 0.5, left: 0, right: 0, missing: None }],
            }],
        };
        assert!(cyclic.validate().is_err());

        let bad_feature = TreeEnsemble {
            base_margin: 0.0,
            num_features: 1,
            trees: vec![Tree {
                nodes: vec![
                    TreeNode::Split { feature: 3, threshold: 0.5, left: 1, right: 2, missing: None },
                    TreeNode::Leaf { leaf: 0.0 },
                    TreeNode::Leaf { leaf: 0.0 },
                ],
            }],
        };
        assert!(bad_feature.validate().unwrap_err().contains("feature 3"));
    }

    #[test]
    fn test_dense_network_forward() {
        let json = r#"{"layers": [
            {"weights": [[1.0, 0.0], [0.0, 1.0]], "bias": [0.0, 0.0], "activation": "relu"},
            {"weights": [[1.0, -1.0]], "bias": [0.0], "activation": "sigmoid"}
        ]}"#;
        let net: DenseNetwork = serde_json::from_str(json).unwrap();
        net.validate().unwrap();
        assert_eq!(net.input_width(), 2);

        // relu clips the negative input, leaving 2.0 - 0.0
        let p = net.predict_probability(&[2.0, -3.0]).unwrap();
        assert!((p - sigmoid(2.0)).abs() < 1e-12);
        assert!(net.predict_probability(&[1.0]).is_err());
    }

    #[test]
    fn test_dense_network_rejects_ragged_layers() {
        let net = DenseNetwork {
            layers: vec![DenseLayer {
                weights: vec![vec![1.0, 2.0], vec![1.0]],
                bias: vec![0.0, 0.0],
                activation: Activation::Sigmoid,
            }],
        };
        assert!(net.validate().is_err());
    }

    #[test]
    fn test_scaler_transform() {
        let scaler = Scaler { mean: vec![1.0, 2.0], scale: vec![2.0, 0.0] };
        scaler.validate(2).unwrap();
        assert!(scaler.validate(3).is_err());

        let mut x = vec![3.0, 5.0];
        scaler.transform(&mut x);
        assert_eq!(x, vec![1.0, 3.0]);
    }
}
