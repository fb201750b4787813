use serde_json::Value;

/// A composition's externally addressable input or output.
///
/// Descriptors are built once per connection from the names, type names
/// and details the composition reports, then shared as `Arc`s.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedPort {
    name: String,
    type_name: String,
    details: Value,
}

impl PublishedPort {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, details: Value) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            details,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Empty for ports that carry only events.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_event_only(&self) -> bool {
        self.type_name.is_empty()
    }

    /// The raw metadata object; `Value::Null` when the composition sent none.
    pub fn details(&self) -> &Value {
        &self.details
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.details.get("default")
    }

    /// `(value, label)` pairs for enumerated inputs.
    pub fn menu_items(&self) -> Vec<(Value, String)> {
        let Some(items) = self.details.get("menuItems").and_then(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let value = item.get("value")?.clone();
                let label = item
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                Some((value, label))
            })
            .collect()
    }

    pub fn suggested_min(&self) -> Option<&Value> {
        self.details.get("suggestedMin")
    }

    pub fn suggested_max(&self) -> Option<&Value> {
        self.details.get("suggestedMax")
    }

    pub fn suggested_step(&self) -> Option<&Value> {
        self.details.get("suggestedStep")
    }
}
