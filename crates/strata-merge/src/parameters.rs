//! Scoped parameter resolution.
//!
//! A parameter can be set in six places. From most to least specific:
//!
//! 1. tensor + model: a filtered entry in the model's own parameters
//! 2. tensor + global: a filtered entry in the slice or top-level parameters
//! 3. slice + model: the slice source's parameters
//! 4. slice + global: the slice's parameters
//! 5. top-level + model: the `models` entry's parameters
//! 6. top-level + global: the configuration's parameters
//!
//! followed by the method's static default. Gradients are evaluated at the
//! layer's interpolation fraction `t`.

use std::collections::BTreeMap;

use crate::{
    InputSliceDefinition, MergeConfig, MergeError, ModelReference, OutputSliceDefinition,
    ParameterMap, Result, SettingValue,
};

/// A resolved parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterValue {
    /// Scalar.
    Number(f64),
    /// Flag.
    Bool(bool),
}

impl ParameterValue {
    /// Numeric view. Booleans map to 0 and 1.
    pub fn as_f32(&self) -> f32 {
        match self {
            Self::Number(v) => *v as f32,
            Self::Bool(b) => f32::from(u8::from(*b)),
        }
    }

    /// Boolean view. Numbers are true when non-zero.
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Number(v) => *v != 0.0,
            Self::Bool(b) => *b,
        }
    }
}

/// A parameter a merge method declares.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDef {
    /// Parameter name as written in configuration.
    pub name: &'static str,
    /// Fail planning when no scope defines it and there is no default.
    pub required: bool,
    /// Static default.
    pub default: Option<ParameterValue>,
}

impl ParameterDef {
    /// A parameter that must be configured somewhere.
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
            default: None,
        }
    }

    /// A parameter with a fallback value.
    pub const fn optional(name: &'static str, default: Option<ParameterValue>) -> Self {
        Self {
            name,
            required: false,
            default,
        }
    }
}

/// Resolved parameters for one tensor (global) or one tensor and model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBag {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterBag {
    /// Empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value.
    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.values.insert(name.into(), value);
    }

    /// Raw value.
    pub fn get(&self, name: &str) -> Option<ParameterValue> {
        self.values.get(name).copied()
    }

    /// Numeric value.
    pub fn f32(&self, name: &str) -> Option<f32> {
        self.get(name).map(|v| v.as_f32())
    }

    /// Boolean value.
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| v.as_bool())
    }

    /// Number of values present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no values are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<const N: usize> From<[(&str, ParameterValue); N]> for ParameterBag {
    fn from(entries: [(&str, ParameterValue); N]) -> Self {
        let mut bag = ParameterBag::new();
        for (name, value) in entries {
            bag.insert(name, value);
        }
        bag
    }
}

/// Looks up parameter values in the configuration for one slice context.
#[derive(Debug, Clone, Copy)]
pub struct ParameterResolver<'a> {
    config: &'a MergeConfig,
    slice: Option<&'a OutputSliceDefinition>,
    t: f64,
}

impl<'a> ParameterResolver<'a> {
    /// Resolver outside any slice (pre and post weights).
    pub fn new(config: &'a MergeConfig, t: f64) -> Self {
        Self {
            config,
            slice: None,
            t,
        }
    }

    /// Resolver for a layer within `slice`.
    pub fn for_slice(config: &'a MergeConfig, slice: &'a OutputSliceDefinition, t: f64) -> Self {
        Self {
            config,
            slice: Some(slice),
            t,
        }
    }

    /// Same context at a different interpolation fraction.
    pub fn with_t(self, t: f64) -> Self {
        Self { t, ..self }
    }

    /// Interpolation fraction in effect.
    pub fn t(&self) -> f64 {
        self.t
    }

    /// Resolve one parameter.
    ///
    /// `model` is `None` for global parameters, which skips the model scopes.
    pub fn resolve(
        &self,
        name: &str,
        tensor: &str,
        model: Option<&ModelReference>,
        required: bool,
        default: Option<ParameterValue>,
    ) -> Result<Option<ParameterValue>> {
        if let Some(value) = self.lookup(name, tensor, model) {
            return Ok(Some(self.evaluate(value)));
        }
        if default.is_none() && required {
            return Err(MergeError::MissingParameter {
                parameter: name.to_string(),
                tensor: tensor.to_string(),
                model: model.map_or_else(|| "global".to_string(), |m| m.to_string()),
            });
        }
        Ok(default)
    }

    /// Resolve every declared parameter into a bag.
    pub fn resolve_all(
        &self,
        defs: &[ParameterDef],
        tensor: &str,
        model: Option<&ModelReference>,
    ) -> Result<ParameterBag> {
        let mut bag = ParameterBag::new();
        for def in defs {
            if let Some(value) = self.resolve(def.name, tensor, model, def.required, def.default)? {
                bag.insert(def.name, value);
            }
        }
        Ok(bag)
    }

    fn lookup(
        &self,
        name: &str,
        tensor: &str,
        model: Option<&ModelReference>,
    ) -> Option<&'a SettingValue> {
        let source_params = model.and_then(|m| self.source_for(m)).map(|s| &s.parameters);
        let model_params = model.and_then(|m| self.model_entry(m));
        let slice_params = self.slice.map(|s| &s.parameters);
        let global_params = &self.config.parameters;

        let filtered = |map: Option<&'a ParameterMap>| -> Option<&'a SettingValue> {
            map.and_then(|m| m.get(name)).and_then(|s| s.for_tensor(tensor))
        };
        let unfiltered = |map: Option<&'a ParameterMap>| -> Option<&'a SettingValue> {
            map.and_then(|m| m.get(name)).and_then(|s| s.unfiltered())
        };

        filtered(source_params)
            .or_else(|| filtered(model_params))
            .or_else(|| filtered(slice_params))
            .or_else(|| filtered(Some(global_params)))
            .or_else(|| unfiltered(source_params))
            .or_else(|| unfiltered(slice_params))
            .or_else(|| unfiltered(model_params))
            .or_else(|| unfiltered(Some(global_params)))
    }

    fn source_for(&self, model: &ModelReference) -> Option<&'a InputSliceDefinition> {
        self.slice?.sources.iter().find(|s| &s.model == model)
    }

    fn model_entry(&self, model: &ModelReference) -> Option<&'a ParameterMap> {
        self.config
            .models
            .iter()
            .find(|m| &m.model == model)
            .map(|m| &m.parameters)
    }

    fn evaluate(&self, value: &SettingValue) -> ParameterValue {
        match value {
            SettingValue::Bool(b) => ParameterValue::Bool(*b),
            SettingValue::Number(v) => ParameterValue::Number(*v),
            SettingValue::Gradient(points) => ParameterValue::Number(interpolate(points, self.t)),
        }
    }
}

/// Piecewise-linear interpolation of evenly spaced `points` at `t` in [0, 1].
pub fn interpolate(points: &[f64], t: f64) -> f64 {
    match points.len() {
        0 => 0.0,
        1 => points[0],
        n => {
            let pos = t.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = (pos.floor() as usize).min(n - 2);
            let frac = pos - lo as f64;
            points[lo] * (1.0 - frac) + points[lo + 1] * frac
        }
    }
}
