//! Parameter declarations: the named, bounded, typed scalars that span the search space.
//!
//! Entries follow the grammar `name [:] [value] [min max] [i|f]`:
//!
//! - `name value min max [i|f]` sets value and both bounds.
//! - `name min max` is a range; the initial value is the midpoint.
//! - `name value min i|f` sets the value and only the lower bound.
//! - `name value [i|f]` is a fixed parameter.
//! - `name` alone is a fixed parameter with value 0.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Numeric kind of a parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ParameterKind {
    /// Real-valued.
    #[default]
    Continuous,
    /// Integer-valued; always holds an integral value.
    Integer,
}

impl ParameterKind {
    /// Parse a kind flag token (`i` or `f`).
    fn from_flag(token: &str) -> Option<Self> {
        match token {
            "i" | "I" => Some(Self::Integer),
            "f" | "F" => Some(Self::Continuous),
            _ => None,
        }
    }

    /// Flag token used when formatting.
    fn flag(self) -> &'static str {
        match self {
            Self::Continuous => "f",
            Self::Integer => "i",
        }
    }
}

/// A named scalar with optional inclusive bounds.
///
/// Name, bounds and kind are fixed at construction; only the value may change,
/// and every change goes through [`Parameter::set_value`], which keeps the value
/// inside the bounds and integral for integer parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    name: String,
    value: f64,
    minv: Option<f64>,
    maxv: Option<f64>,
    kind: ParameterKind,
}

impl Parameter {
    /// Create a validated parameter.
    pub fn new(
        name: impl Into<String>,
        value: f64,
        minv: Option<f64>,
        maxv: Option<f64>,
        kind: ParameterKind,
    ) -> Result<Self, ParameterSpecError> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(ParameterSpecError::InvalidName {
                entry: name.clone(),
                name,
            });
        }
        if let (Some(lo), Some(hi)) = (minv, maxv)
            && lo > hi
        {
            return Err(ParameterSpecError::InvertedBounds {
                name,
                minv: lo,
                maxv: hi,
            });
        }
        if kind == ParameterKind::Integer {
            if value.fract() != 0.0 {
                return Err(ParameterSpecError::NonIntegral { name, value });
            }
            let lo = minv.map_or(f64::NEG_INFINITY, f64::ceil);
            let hi = maxv.map_or(f64::INFINITY, f64::floor);
            if lo > hi {
                return Err(ParameterSpecError::NoIntegerInRange {
                    name,
                    minv: minv.unwrap_or(f64::NEG_INFINITY),
                    maxv: maxv.unwrap_or(f64::INFINITY),
                });
            }
        }
        let below = minv.is_some_and(|lo| value < lo);
        let above = maxv.is_some_and(|hi| value > hi);
        if below || above {
            return Err(ParameterSpecError::ValueOutOfBounds {
                name,
                value,
                minv: minv.unwrap_or(f64::NEG_INFINITY),
                maxv: maxv.unwrap_or(f64::INFINITY),
            });
        }

        Ok(Self {
            name,
            value,
            minv,
            maxv,
            kind,
        })
    }

    /// A fixed continuous parameter.
    pub fn fixed(name: impl Into<String>, value: f64) -> Result<Self, ParameterSpecError> {
        Self::new(name, value, None, None, ParameterKind::Continuous)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn minv(&self) -> Option<f64> {
        self.minv
    }

    pub fn maxv(&self) -> Option<f64> {
        self.maxv
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    /// Both bounds, when the parameter has them.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.minv.zip(self.maxv)
    }

    /// Whether the optimizer is allowed to vary this parameter.
    ///
    /// Only parameters with both bounds and a non-empty range are searched.
    pub fn is_free(&self) -> bool {
        self.bounds().is_some_and(|(lo, hi)| hi > lo)
    }

    /// Bring an arbitrary value into the parameter's domain.
    ///
    /// Integer parameters round to the nearest integer within the bounds.
    pub fn clamp(&self, value: f64) -> f64 {
        let (lo, hi) = self.effective_bounds();
        let value = if value.is_nan() { self.value } else { value };
        match self.kind {
            ParameterKind::Continuous => value.clamp(lo, hi),
            ParameterKind::Integer => value.round().clamp(lo, hi),
        }
    }

    /// Assign a new value, clamped into the domain. Returns the stored value.
    pub fn set_value(&mut self, value: f64) -> f64 {
        self.value = self.clamp(value);
        self.value
    }

    /// Bounds usable for clamping; integer bounds are tightened to integers.
    fn effective_bounds(&self) -> (f64, f64) {
        let lo = self.minv.unwrap_or(f64::NEG_INFINITY);
        let hi = self.maxv.unwrap_or(f64::INFINITY);
        match self.kind {
            ParameterKind::Continuous => (lo, hi),
            ParameterKind::Integer => (lo.ceil(), hi.floor()),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.value)?;
        match (self.minv, self.maxv) {
            (Some(lo), Some(hi)) => write!(f, " {lo} {hi}")?,
            (Some(lo), None) => write!(f, " {lo}")?,
            _ => {}
        }
        write!(f, " {}", self.kind.flag())
    }
}

impl FromStr for Parameter {
    type Err = ParameterSpecError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        parse_parameter(entry)
    }
}

/// Parse one parameter entry.
pub fn parse_parameter(entry: &str) -> Result<Parameter, ParameterSpecError> {
    let mut words: Vec<&str> = entry.split_whitespace().collect();
    if words.is_empty() {
        return Err(ParameterSpecError::Empty);
    }

    let name = words.remove(0).trim_end_matches(':');
    if words.first() == Some(&":") {
        words.remove(0);
    }
    if !is_valid_name(name) {
        return Err(ParameterSpecError::InvalidName {
            entry: entry.to_string(),
            name: name.to_string(),
        });
    }

    let flag = words.last().and_then(|w| ParameterKind::from_flag(w));
    if flag.is_some() {
        words.pop();
    }
    let kind = flag.unwrap_or_default();

    let numbers = words
        .iter()
        .map(|token| {
            token
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ParameterSpecError::NonNumeric {
                    entry: entry.to_string(),
                    token: token.to_string(),
                })
        })
        .collect::<Result<Vec<f64>, _>>()?;

    let (value, minv, maxv) = match (numbers.as_slice(), flag) {
        ([], _) => (0.0, None, None),
        ([value], _) => (*value, None, None),
        ([lo, hi], None) => {
            if lo > hi {
                return Err(ParameterSpecError::InvertedBounds {
                    name: name.to_string(),
                    minv: *lo,
                    maxv: *hi,
                });
            }
            (0.5 * (lo + hi), Some(*lo), Some(*hi))
        }
        ([value, lo], Some(_)) => (*value, Some(*lo), None),
        ([value, lo, hi], _) => (*value, Some(*lo), Some(*hi)),
        (more, _) => {
            return Err(ParameterSpecError::TooManyNumbers {
                entry: entry.to_string(),
                count: more.len(),
            });
        }
    };

    Parameter::new(name, value, minv, maxv, kind)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// The ordered, name-indexed collection of parameters for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSpace {
    parameters: Vec<Parameter>,
}

impl ParameterSpace {
    /// Build from already-constructed parameters, rejecting duplicate names.
    pub fn new(parameters: Vec<Parameter>) -> Result<Self, ParameterSpecError> {
        let mut seen = HashSet::new();
        for p in &parameters {
            if !seen.insert(p.name()) {
                return Err(ParameterSpecError::DuplicateName(p.name().to_string()));
            }
        }
        Ok(Self { parameters })
    }

    /// Parse a list of entries.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ParameterSpecError> {
        let parameters = entries
            .iter()
            .map(|e| parse_parameter(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parameters)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Parameter> {
        self.parameters.get(index)
    }

    /// Look up a parameter by name.
    pub fn by_name(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(Parameter::name).collect()
    }

    /// Values as declared in the configuration.
    pub fn nominal(&self) -> Vec<f64> {
        self.parameters.iter().map(Parameter::value).collect()
    }

    /// Indices of parameters the optimizer varies.
    pub fn free_indices(&self) -> Vec<usize> {
        self.parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_free())
            .map(|(i, _)| i)
            .collect()
    }

    /// Clamp every entry of a value vector into its parameter's domain.
    pub fn clamp_vector(&self, values: &mut [f64]) {
        for (value, p) in values.iter_mut().zip(&self.parameters) {
            *value = p.clamp(*value);
        }
    }

    /// Whether a value vector satisfies every bound and integrality constraint.
    pub fn contains(&self, values: &[f64]) -> bool {
        values.len() == self.parameters.len()
            && values
                .iter()
                .zip(&self.parameters)
                .all(|(v, p)| p.clamp(*v) == *v)
    }

    /// Pair each parameter name with a value.
    pub fn assign<'a>(&'a self, values: &'a [f64]) -> impl Iterator<Item = (&'a str, f64)> + 'a {
        self.parameters
            .iter()
            .zip(values.iter().copied())
            .map(|(p, v)| (p.name(), v))
    }
}

/// Format a parameter assignment in the `current.par` layout.
pub fn format_parameter_file(space: &ParameterSpace, values: &[f64], header: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(header) = header {
        out.push('#');
        out.push_str(header);
        out.push('\n');
    }
    for (name, value) in space.assign(values) {
        out.push_str(&format!("{name:>20}  {value}\n"));
    }
    out
}

/// Parameter grammar errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterSpecError {
    #[error("Empty parameter entry")]
    Empty,
    #[error("Parameter entry '{entry}': invalid name '{name}' (letters, digits and '_' only)")]
    InvalidName { entry: String, name: String },
    #[error("Parameter entry '{entry}': token '{token}' is neither a number nor a kind flag (i|f)")]
    NonNumeric { entry: String, token: String },
    #[error("Parameter entry '{entry}': expected at most 3 numbers (value min max), found {count}")]
    TooManyNumbers { entry: String, count: usize },
    #[error("Parameter '{name}': lower bound {minv} exceeds upper bound {maxv}")]
    InvertedBounds { name: String, minv: f64, maxv: f64 },
    #[error("Parameter '{name}': value {value} lies outside [{minv}, {maxv}]")]
    ValueOutOfBounds {
        name: String,
        value: f64,
        minv: f64,
        maxv: f64,
    },
    #[error("Parameter '{name}': integer parameter has non-integral value {value}")]
    NonIntegral { name: String, value: f64 },
    #[error("Parameter '{name}': no integer lies within [{minv}, {maxv}]")]
    NoIntegerInRange { name: String, minv: f64, maxv: f64 },
    #[error("Parameter '{0}' declared more than once")]
    DuplicateName(String),
}
