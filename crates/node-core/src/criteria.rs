//! Session criteria parsing
//!
//! Criteria arrive as loosely typed `{type, value}` objects. They are parsed
//! once when a session starts; an unrecognised type or out-of-range value is
//! a configuration error and the session never starts.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, Round};

/// Criteria as received on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCriteria {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl RawCriteria {
    pub fn new(kind: &str, value: Option<f64>) -> Self {
        Self {
            kind: kind.to_string(),
            value,
        }
    }

    fn required_value(&self, criteria: &'static str) -> Result<f64> {
        match self.value {
            Some(v) if v.is_finite() => Ok(v),
            Some(v) => Err(Error::InvalidCriteria {
                criteria,
                message: format!("value {v} is not a finite number"),
            }),
            None => Err(Error::InvalidCriteria {
                criteria,
                message: format!("{} requires a value", self.kind),
            }),
        }
    }
}

/// Which registered clients take part in a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionCriteria {
    /// Every registered LIBRARY client
    AllNodes,
}

impl TryFrom<&RawCriteria> for SelectionCriteria {
    type Error = Error;

    fn try_from(raw: &RawCriteria) -> Result<Self> {
        match raw.kind.as_str() {
            "ALL_NODES" => Ok(SelectionCriteria::AllNodes),
            other => Err(unknown_type("selection", other)),
        }
    }
}

/// When the current round is considered complete
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContinuationCriteria {
    /// A fraction of the cohort has been averaged
    PercentageAveraged { value: f64 },
}

impl TryFrom<&RawCriteria> for ContinuationCriteria {
    type Error = Error;

    fn try_from(raw: &RawCriteria) -> Result<Self> {
        match raw.kind.as_str() {
            "PERCENTAGE_AVERAGED" => {
                let value = raw.required_value("continuation")?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(Error::InvalidCriteria {
                        criteria: "continuation",
                        message: format!("PERCENTAGE_AVERAGED value {value} outside [0, 1]"),
                    });
                }
                Ok(ContinuationCriteria::PercentageAveraged { value })
            }
            other => Err(unknown_type("continuation", other)),
        }
    }
}

/// When the whole session is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCriteria {
    /// Stop once the round counter passes `value`
    MaxRound { value: Round },
}

impl TryFrom<&RawCriteria> for TerminationCriteria {
    type Error = Error;

    fn try_from(raw: &RawCriteria) -> Result<Self> {
        match raw.kind.as_str() {
            "MAX_ROUND" => {
                let value = raw.required_value("termination")?;
                if value < 1.0 || value.fract() != 0.0 {
                    return Err(Error::InvalidCriteria {
                        criteria: "termination",
                        message: format!("MAX_ROUND value {value} must be a positive integer"),
                    });
                }
                Ok(TerminationCriteria::MaxRound {
                    value: value as Round,
                })
            }
            other => Err(unknown_type("termination", other)),
        }
    }
}

fn unknown_type(criteria: &'static str, kind: &str) -> Error {
    let message = if kind.is_empty() {
        "missing type".to_string()
    } else {
        format!("unrecognised type {kind}")
    };
    Error::InvalidCriteria { criteria, message }
}
