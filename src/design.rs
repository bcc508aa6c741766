use crate::error::{HsslError, Result};
use ndarray::{s, Array2};
use std::collections::{BTreeMap, BTreeSet};

/// Categorical covariates per sample, values already coerced to strings.
#[derive(Debug, Clone, Default)]
pub struct DesignTable {
    samples: Vec<String>,
    columns: BTreeMap<String, Vec<String>>,
}

impl DesignTable {
    pub fn new<S: ToString>(samples: impl IntoIterator<Item = S>) -> Self {
        Self {
            samples: samples.into_iter().map(|s| s.to_string()).collect(),
            columns: BTreeMap::new(),
        }
    }

    /// Add a covariate column; one value per sample.
    pub fn with_covariate<V: ToString>(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Result<Self> {
        let values: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
        if values.len() != self.samples.len() {
            return Err(HsslError::DimensionMismatch {
                what: "design covariate length",
                expected: vec![self.samples.len()],
                found: vec![values.len()],
            });
        }
        self.columns.insert(name.to_string(), values);
        Ok(self)
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }
}

/// A covariate together with the categories it may take.
#[derive(Debug, Clone)]
pub struct CovariateSpec {
    pub name: String,
    pub categories: BTreeSet<String>,
}

impl CovariateSpec {
    pub fn new<S: ToString>(name: &str, categories: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.to_string(),
            categories: categories.into_iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// One-hot encoding of a single covariate, shaped (categories x samples).
#[derive(Debug, Clone)]
pub struct CovariateEncoding {
    pub name: String,
    pub categories: Vec<String>,
    pub matrix: Array2<f32>,
}

/// Per-covariate one-hot encodings stacked along the category axis.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    encodings: Vec<CovariateEncoding>,
    num_samples: usize,
}

impl DesignMatrix {
    pub fn encodings(&self) -> &[CovariateEncoding] {
        &self.encodings
    }

    pub fn get(&self, covariate: &str) -> Option<&CovariateEncoding> {
        self.encodings.iter().find(|e| e.name == covariate)
    }

    pub fn num_rows(&self) -> usize {
        self.encodings.iter().map(|e| e.categories.len()).sum()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// (covariate, category) label of every row of [`Self::to_dense`].
    pub fn row_labels(&self) -> Vec<(String, String)> {
        self.encodings
            .iter()
            .flat_map(|e| e.categories.iter().map(|c| (e.name.clone(), c.clone())))
            .collect()
    }

    /// All encodings stacked into one (rows x samples) matrix.
    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros((self.num_rows(), self.num_samples));
        let mut row = 0;
        for encoding in &self.encodings {
            let rows = encoding.matrix.nrows();
            dense
                .slice_mut(s![row..row + rows, ..])
                .assign(&encoding.matrix);
            row += rows;
        }
        dense
    }
}

/// Encode the covariates of `design` as one-hot matrices.
///
/// Without `covariates` every column is encoded with its observed
/// categories. With `covariates` the listed columns are encoded against the
/// allowed categories only; a sample whose value is not allowed gets an
/// all-zero column.
pub fn design_matrix_from(
    design: &DesignTable,
    covariates: Option<&[CovariateSpec]>,
) -> Result<DesignMatrix> {
    let num_samples = design.num_samples();
    if design.columns.is_empty() {
        return Ok(DesignMatrix {
            encodings: Vec::new(),
            num_samples,
        });
    }

    let selected: Vec<(&str, Vec<String>)> = match covariates {
        Some(covariates) => {
            let missing: Vec<String> = covariates
                .iter()
                .filter(|c| !design.columns.contains_key(&c.name))
                .map(|c| c.name.clone())
                .collect();
            if !missing.is_empty() {
                return Err(HsslError::MissingCovariate(missing));
            }
            covariates
                .iter()
                .map(|c| (c.name.as_str(), c.categories.iter().cloned().collect()))
                .collect()
        }
        None => design
            .columns
            .iter()
            .map(|(name, values)| {
                let observed: BTreeSet<&String> = values.iter().collect();
                (name.as_str(), observed.into_iter().cloned().collect())
            })
            .collect(),
    };

    let encodings = selected
        .into_iter()
        .map(|(name, categories)| encode(name, categories, &design.columns[name]))
        .collect();

    Ok(DesignMatrix {
        encodings,
        num_samples,
    })
}

fn encode(name: &str, categories: Vec<String>, values: &[String]) -> CovariateEncoding {
    tracing::info!(
        "encoding design covariate \"{}\" with {} categories: {}",
        name,
        categories.len(),
        categories.join(", ")
    );
    let mut matrix = Array2::zeros((categories.len(), values.len()));
    for (sample, value) in values.iter().enumerate() {
        if let Ok(code) = categories.binary_search(value) {
            matrix[[code, sample]] = 1.0;
        }
    }
    CovariateEncoding {
        name: name.to_string(),
        categories,
        matrix,
    }
}
