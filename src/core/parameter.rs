//! Parameter system for module configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Parameter value container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    IntVector(Vec<i64>),
    FloatVector(Vec<f64>),
}

/// Parameter type information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterType {
    Int { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    String,
    Bool,
    IntVector,
    FloatVector,
    /// String parameter restricted to a fixed choice list.
    Choice,
}

/// Parameter definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub description: String,
    pub value: ParameterValue,
    pub param_type: ParameterType,
    pub choices: Vec<String>,
}

impl Parameter {
    pub fn new(name: &str, description: &str, value: ParameterValue) -> Self {
        let param_type = match &value {
            ParameterValue::Int(_) => ParameterType::Int { min: None, max: None },
            ParameterValue::Float(_) => ParameterType::Float { min: None, max: None },
            ParameterValue::String(_) => ParameterType::String,
            ParameterValue::Bool(_) => ParameterType::Bool,
            ParameterValue::IntVector(_) => ParameterType::IntVector,
            ParameterValue::FloatVector(_) => ParameterType::FloatVector,
        };

        Self {
            name: name.to_string(),
            description: description.to_string(),
            value,
            param_type,
            choices: Vec::new(),
        }
    }

    pub fn choice(name: &str, description: &str, choices: Vec<String>, initial: usize) -> Self {
        let value = choices.get(initial).cloned().unwrap_or_default();
        Self {
            name: name.to_string(),
            description: description.to_string(),
            value: ParameterValue::String(value),
            param_type: ParameterType::Choice,
            choices,
        }
    }
}

/// Collection of parameters for a module.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    parameters: HashMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, param: Parameter) {
        self.parameters.insert(param.name.clone(), param);
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn set_value(&mut self, name: &str, value: ParameterValue) -> Result<(), String> {
        let param = self
            .parameters
            .get_mut(name)
            .ok_or_else(|| format!("parameter {} not found", name))?;

        match (&param.param_type, &value) {
            (ParameterType::Int { .. }, ParameterValue::Int(_)) => {}
            (ParameterType::Float { .. }, ParameterValue::Float(_)) => {}
            (ParameterType::String, ParameterValue::String(_)) => {}
            (ParameterType::Bool, ParameterValue::Bool(_)) => {}
            (ParameterType::IntVector, ParameterValue::IntVector(_)) => {}
            (ParameterType::FloatVector, ParameterValue::FloatVector(_)) => {}
            (ParameterType::Choice, ParameterValue::String(s)) => {
                if !param.choices.iter().any(|c| c == s) {
                    return Err(format!("{} is not a valid choice for {}", s, name));
                }
            }
            _ => return Err(format!("type mismatch for parameter {}", name)),
        }
        param.value = value;
        Ok(())
    }

    /// Replace the choice list; the current value resets to the first entry
    /// when it is no longer valid.
    pub fn set_choices(&mut self, name: &str, choices: Vec<String>) -> Result<(), String> {
        let param = self
            .parameters
            .get_mut(name)
            .ok_or_else(|| format!("parameter {} not found", name))?;
        if param.param_type != ParameterType::Choice {
            return Err(format!("parameter {} is not a choice parameter", name));
        }
        if let ParameterValue::String(current) = &param.value {
            if !choices.iter().any(|c| c == current) {
                param.value = ParameterValue::String(choices.first().cloned().unwrap_or_default());
            }
        }
        param.choices = choices;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.parameters.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_checked_set() {
        let mut params = ParameterSet::new();
        params.add(Parameter::new("iso", "isovalue", ParameterValue::Float(0.0)));

        assert!(params.set_value("iso", ParameterValue::Float(0.5)).is_ok());
        assert!(params.set_value("iso", ParameterValue::Int(1)).is_err());
        assert!(params.set_value("missing", ParameterValue::Int(1)).is_err());
        assert_eq!(
            params.get("iso").unwrap().value,
            ParameterValue::Float(0.5)
        );
    }

    #[test]
    fn choices_constrain_and_reset() {
        let mut params = ParameterSet::new();
        params.add(Parameter::choice(
            "mapping",
            "color map",
            vec!["rainbow".into(), "viridis".into()],
            0,
        ));

        assert!(params
            .set_value("mapping", ParameterValue::String("viridis".into()))
            .is_ok());
        assert!(params
            .set_value("mapping", ParameterValue::String("plasma".into()))
            .is_err());

        params
            .set_choices("mapping", vec!["plasma".into(), "magma".into()])
            .unwrap();
        assert_eq!(
            params.get("mapping").unwrap().value,
            ParameterValue::String("plasma".into())
        );
    }
}
