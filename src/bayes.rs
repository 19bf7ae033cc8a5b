//! Gaussian naive Bayes over fixed-length feature vectors.

use log::info;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{EventError, Result};

/// Variances are never smaller than this.
pub const MIN_VARIANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassInfo {
    pub class_id: usize,
    pub prob: f64,
    /// Mean Gaussian kernel similarity of the features to the class.
    pub stat_sig: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bayes {
    num_features: usize,
    /// Per class, per feature.
    mean: Vec<Vec<f64>>,
    variance: Vec<Vec<f64>>,
    class_freq: Vec<u64>,
    feature_names: Vec<String>,
    class_names: Vec<String>,
}

impl Bayes {
    pub fn new(num_features: usize, num_classes: usize) -> Self {
        Self {
            num_features,
            mean: vec![vec![0.0; num_features]; num_classes],
            variance: vec![vec![0.0; num_features]; num_classes],
            class_freq: vec![0; num_classes],
            feature_names: vec![String::new(); num_features],
            class_names: (0..num_classes).map(|c| format!("class{}", c)).collect(),
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_classes(&self) -> usize {
        self.class_freq.len()
    }

    fn check_features(&self, fv: &[f64]) -> Result<()> {
        if fv.len() != self.num_features {
            return Err(EventError::FeatureLength {
                expected: self.num_features,
                actual: fv.len(),
            });
        }
        Ok(())
    }

    fn check_class(&self, cls: usize) -> Result<()> {
        if cls >= self.num_classes() {
            return Err(EventError::model(format!(
                "class {} out of range ({} classes)",
                cls,
                self.num_classes()
            )));
        }
        Ok(())
    }

    /// Fold `fv` into the running mean and variance of class `cls`.
    pub fn learn(&mut self, fv: &[f64], cls: usize) -> Result<()> {
        self.check_features(fv)?;
        self.check_class(cls)?;

        let n = (self.class_freq[cls] + 1) as f64;
        for (i, &x) in fv.iter().enumerate() {
            let old_mean = self.mean[cls][i];
            let new_mean = old_mean + (x - old_mean) / n;
            let var = self.variance[cls][i];
            self.variance[cls][i] = var + ((x - old_mean) * (x - new_mean) - var) / n;
            self.mean[cls][i] = new_mean;
        }
        self.class_freq[cls] += 1;
        Ok(())
    }

    /// `learn` by class name, adding the class if it is new.
    pub fn learn_named(&mut self, fv: &[f64], name: &str) -> Result<()> {
        self.check_features(fv)?;
        let cls = self.add_class(name);
        self.learn(fv, cls)
    }

    /// Id of the class called `name`, added if missing.
    pub fn add_class(&mut self, name: &str) -> usize {
        if let Some(id) = self.class_id(name) {
            return id;
        }
        self.mean.push(vec![0.0; self.num_features]);
        self.variance.push(vec![0.0; self.num_features]);
        self.class_freq.push(0);
        self.class_names.push(name.to_string());
        self.class_names.len() - 1
    }

    pub fn class_id(&self, name: &str) -> Option<usize> {
        self.class_names.iter().position(|n| n == name)
    }

    pub fn class_name(&self, id: usize) -> Option<&str> {
        self.class_names.get(id).map(String::as_str)
    }

    pub fn set_feature_name(&mut self, index: usize, name: &str) -> Result<()> {
        match self.feature_names.get_mut(index) {
            Some(slot) => {
                *slot = name.to_string();
                Ok(())
            }
            None => Err(EventError::FeatureLength {
                expected: self.num_features,
                actual: index + 1,
            }),
        }
    }

    pub fn feature_name(&self, index: usize) -> Option<&str> {
        self.feature_names.get(index).map(String::as_str)
    }

    pub fn mean(&self, cls: usize, i: usize) -> Option<f64> {
        self.mean.get(cls)?.get(i).copied()
    }

    pub fn variance(&self, cls: usize, i: usize) -> Option<f64> {
        self.variance.get(cls)?.get(i).copied()
    }

    pub fn set_mean(&mut self, cls: usize, i: usize, val: f64) -> Result<()> {
        self.check_class(cls)?;
        match self.mean[cls].get_mut(i) {
            Some(m) => {
                *m = val;
                Ok(())
            }
            None => Err(EventError::model(format!("feature {} out of range", i))),
        }
    }

    pub fn set_variance(&mut self, cls: usize, i: usize, val: f64) -> Result<()> {
        self.check_class(cls)?;
        match self.variance[cls].get_mut(i) {
            Some(v) => {
                *v = val;
                Ok(())
            }
            None => Err(EventError::model(format!("feature {} out of range", i))),
        }
    }

    pub fn class_freq(&self, cls: usize) -> u64 {
        self.class_freq.get(cls).copied().unwrap_or(0)
    }

    /// Prior of `cls` from training frequencies; uniform before any training.
    pub fn class_prior(&self, cls: usize) -> f64 {
        let total: u64 = self.class_freq.iter().sum();
        if cls >= self.num_classes() {
            0.0
        } else if total == 0 {
            1.0 / self.num_classes() as f64
        } else {
            self.class_freq[cls] as f64 / total as f64
        }
    }

    /// Normal density with variance `variance` (floored).
    pub fn gauss(x: f64, mean: f64, variance: f64) -> f64 {
        Self::log_gauss(x, mean, variance).exp()
    }

    fn log_gauss(x: f64, mean: f64, variance: f64) -> f64 {
        let v = variance.max(MIN_VARIANCE);
        let d = x - mean;
        -d * d / (2.0 * v) - 0.5 * (2.0 * PI * v).ln()
    }

    fn log_joint(&self, fv: &[f64], cls: usize) -> f64 {
        let prior = self.class_prior(cls);
        if prior <= 0.0 {
            return f64::NEG_INFINITY;
        }
        fv.iter()
            .zip(self.mean[cls].iter().zip(&self.variance[cls]))
            .map(|(&x, (&m, &v))| Self::log_gauss(x, m, v))
            .sum::<f64>()
            + prior.ln()
    }

    /// Posterior probability of every class, normalized to sum to one.
    pub fn class_probs(&self, fv: &[f64]) -> Result<Vec<f64>> {
        self.check_features(fv)?;
        let n = self.num_classes();
        let logs: Vec<f64> = (0..n).map(|c| self.log_joint(fv, c)).collect();
        let max = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Ok(vec![1.0 / n as f64; n]);
        }
        let weights: Vec<f64> = logs.iter().map(|l| (l - max).exp()).collect();
        let sum: f64 = weights.iter().sum();
        Ok(weights.into_iter().map(|w| w / sum).collect())
    }

    /// Most probable class and its posterior probability.
    pub fn classify(&self, fv: &[f64]) -> Result<(usize, f64)> {
        let probs = self.class_probs(fv)?;
        probs
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (c, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((c, p)),
            })
            .ok_or_else(|| EventError::model("classifier has no classes"))
    }

    /// Every class with its probability and significance, most probable
    /// first when `sort` is set.
    pub fn classify_range(&self, fv: &[f64], sort: bool) -> Result<Vec<ClassInfo>> {
        let probs = self.class_probs(fv)?;
        let mut infos = probs
            .into_iter()
            .enumerate()
            .map(|(class_id, prob)| {
                Ok(ClassInfo {
                    class_id,
                    prob,
                    stat_sig: self.stat_sig(fv, class_id)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if sort {
            infos.sort_by(|a, b| b.prob.partial_cmp(&a.prob).unwrap_or(Ordering::Equal));
        }
        Ok(infos)
    }

    /// Mean of exp(-z^2 / 2) over the features, 1 for a perfect match.
    pub fn stat_sig(&self, fv: &[f64], cls: usize) -> Result<f64> {
        self.check_features(fv)?;
        self.check_class(cls)?;
        if fv.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = fv
            .iter()
            .zip(self.mean[cls].iter().zip(&self.variance[cls]))
            .map(|(&x, (&m, &v))| {
                let d = x - m;
                (-d * d / (2.0 * v.max(MIN_VARIANCE))).exp()
            })
            .sum();
        Ok(total / fv.len() as f64)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        info!("Saved classifier with {} classes to {:?}", self.num_classes(), path.as_ref());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let bayes: Bayes = serde_json::from_reader(reader).map_err(|e| EventError::model(e.to_string()))?;
        bayes.validate()?;
        info!(
            "Loaded classifier with {} features and {} classes from {:?}",
            bayes.num_features,
            bayes.num_classes(),
            path.as_ref()
        );
        Ok(bayes)
    }

    fn validate(&self) -> Result<()> {
        let n = self.class_freq.len();
        if self.mean.len() != n || self.variance.len() != n || self.class_names.len() != n {
            return Err(EventError::model("class tables have different lengths"));
        }
        if self.feature_names.len() != self.num_features
            || self
                .mean
                .iter()
                .chain(&self.variance)
                .any(|row| row.len() != self.num_features)
        {
            return Err(EventError::model("feature tables do not match the feature count"));
        }
        Ok(())
    }
}
