//! Output wiring
//!
//! Settled producers publish their outputs here; consumers resolve output
//! references against them at execution time. Reading a producer that has
//! not settled is an ordering violation and never returns a placeholder.

use crate::descriptor::{InputValue, OutputRef};
use crate::error::WiringError;
use crate::types::{NodeKey, ValueMap};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct OutputWiring {
    settled: DashMap<NodeKey, Arc<ValueMap>>,
}

impl OutputWiring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a producer as settled. Outputs are frozen from here on.
    pub fn publish(&self, key: NodeKey, outputs: ValueMap) {
        self.settled.insert(key, Arc::new(outputs));
    }

    pub fn is_settled(&self, key: &NodeKey) -> bool {
        self.settled.contains_key(key)
    }

    pub fn outputs(&self, key: &NodeKey) -> Option<Arc<ValueMap>> {
        self.settled.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn resolve(&self, reference: &OutputRef) -> Result<Value, WiringError> {
        let outputs =
            self.outputs(&reference.node)
                .ok_or_else(|| WiringError::OrderingViolation {
                    producer: reference.node.clone(),
                    reference: reference.to_string(),
                })?;
        outputs
            .get(&reference.output)
            .cloned()
            .ok_or_else(|| WiringError::MissingOutput {
                producer: reference.node.clone(),
                output: reference.output.clone(),
            })
    }

    /// Replace every reference in `inputs` with the producer's settled value.
    pub fn materialize(
        &self,
        inputs: &BTreeMap<String, InputValue>,
    ) -> Result<ValueMap, WiringError> {
        inputs
            .iter()
            .map(|(name, input)| {
                let value = match input {
                    InputValue::Literal(v) => v.clone(),
                    InputValue::Ref(r) => self.resolve(r)?,
                };
                Ok((name.clone(), value))
            })
            .collect()
    }
}

/// Resolve inputs against an arbitrary output lookup, typically recorded
/// state. Returns `None` when any reference cannot be resolved.
pub fn resolve_with<'a, F>(inputs: &BTreeMap<String, InputValue>, lookup: F) -> Option<ValueMap>
where
    F: Fn(&NodeKey) -> Option<&'a ValueMap>,
{
    inputs
        .iter()
        .map(|(name, input)| {
            let value = match input {
                InputValue::Literal(v) => v.clone(),
                InputValue::Ref(r) => lookup(&r.node)?.get(&r.output)?.clone(),
            };
            Some((name.clone(), value))
        })
        .collect()
}
