//! Values composition for one release
//!
//! Precedence, lowest first: chart defaults, watch override values, values
//! declared on the custom resource.

use std::sync::Arc;

use crate::chart::LoadedChart;
use crate::error::Result;
use crate::schema::SchemaValidator;
use crate::values::Values;

/// Composed values together with their canonical digest
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedValues {
    pub values: Values,
    pub digest: String,
}

/// Merges the three value layers of a watched kind
#[derive(Debug, Clone)]
pub struct ValuesComposer {
    chart_defaults: Values,
    overrides: Values,
    validator: Option<Arc<SchemaValidator>>,
}

impl ValuesComposer {
    pub fn new(chart_defaults: Values, overrides: Values) -> Self {
        Self {
            chart_defaults,
            overrides,
            validator: None,
        }
    }

    /// Composer for a loaded chart, validating against its schema if present
    pub fn for_chart(chart: &LoadedChart, overrides: Values) -> Self {
        Self {
            chart_defaults: chart.values.clone(),
            overrides,
            validator: chart.schema.clone(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Compose the values declared on a resource with the lower layers
    pub fn compose(&self, declared: &Values) -> Result<ComposedValues> {
        let mut values = self.chart_defaults.clone();
        values.merge(&self.overrides)?;
        values.merge(declared)?;

        if let Some(validator) = &self.validator {
            validator.validate(values.inner())?;
        }

        let digest = values.digest();
        Ok(ComposedValues { values, digest })
    }
}
