//! Evaluation of a single atomic comparison.

use tracing::trace;

use crate::model::{Atom, AtomCondition, Fulfillment, ParameterValue};

/// Strip wrapping `"` characters from a string reference value.
///
/// Reference values occasionally arrive JSON-quoted from upstream editors;
/// comparison happens on the bare text.
pub fn normalize_string_reference(reference: &str) -> &str {
    reference.trim_matches('"')
}

/// Evaluate `atom` against the instance's current value of its parameter.
///
/// Absent values, values of a different type than the reference value and
/// non-finite numbers yield [`Fulfillment::Unknown`]; nothing here fails.
pub fn evaluate_atom(atom: &Atom, current: Option<&ParameterValue>) -> Fulfillment {
    let Some(current) = current else {
        trace!(
            parameter_id = atom.sd_parameter_id,
            "No snapshot for parameter, atom is unknown"
        );
        return Fulfillment::Unknown;
    };

    let outcome = match (&atom.condition, current) {
        (AtomCondition::BooleanEq(reference), ParameterValue::Boolean(value)) => {
            Some(value == reference)
        }
        (AtomCondition::StringEq(reference), ParameterValue::String(value)) => {
            Some(value.as_str() == normalize_string_reference(reference))
        }
        (AtomCondition::NumericEq(reference), ParameterValue::Number(value)) => {
            compare(*value, *reference, |v, r| v == r)
        }
        (AtomCondition::NumericGt(reference), ParameterValue::Number(value)) => {
            compare(*value, *reference, |v, r| v > r)
        }
        (AtomCondition::NumericGeq(reference), ParameterValue::Number(value)) => {
            compare(*value, *reference, |v, r| v >= r)
        }
        (AtomCondition::NumericLt(reference), ParameterValue::Number(value)) => {
            compare(*value, *reference, |v, r| v < r)
        }
        (AtomCondition::NumericLeq(reference), ParameterValue::Number(value)) => {
            compare(*value, *reference, |v, r| v <= r)
        }
        (condition, value) => {
            trace!(
                parameter_id = atom.sd_parameter_id,
                expected = %condition.reference_type(),
                actual = %value.parameter_type(),
                "Type mismatch, atom is unknown"
            );
            None
        }
    };

    Fulfillment::from(outcome)
}

fn compare(value: f64, reference: f64, relation: impl Fn(f64, f64) -> bool) -> Option<bool> {
    if value.is_finite() && reference.is_finite() {
        Some(relation(value, reference))
    } else {
        None
    }
}
