use serde_json::{json, Map, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array(Box<FieldKind>),
    Object,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array(item) => {
                value.as_array().is_some_and(|items| items.iter().all(|entry| item.accepts(entry)))
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "string".to_owned(),
            Self::Number => "number".to_owned(),
            Self::Integer => "integer".to_owned(),
            Self::Boolean => "boolean".to_owned(),
            Self::Object => "object".to_owned(),
            Self::Array(item) => format!("array<{}>", item.describe()),
        }
    }

    fn to_json_schema(&self) -> Value {
        match self {
            Self::Array(item) => json!({ "type": "array", "items": item.to_json_schema() }),
            Self::String => json!({ "type": "string" }),
            Self::Number => json!({ "type": "number" }),
            Self::Integer => json!({ "type": "integer" }),
            Self::Boolean => json!({ "type": "boolean" }),
            Self::Object => json!({ "type": "object" }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    /// Strings must be non-blank and arrays must hold at least one item.
    pub non_empty: bool,
    pub description: String,
}

/// Object schema for capability input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputSchema {
    fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.push(name, kind, true, false, description)
    }

    pub fn required_non_empty(self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.push(name, kind, true, true, description)
    }

    pub fn optional(self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.push(name, kind, false, false, description)
    }

    fn push(
        mut self,
        name: &str,
        kind: FieldKind,
        required: bool,
        non_empty: bool,
        description: &str,
    ) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_owned(),
            kind,
            required,
            non_empty,
            description: description.to_owned(),
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn validate(&self, input: &Value) -> Result<(), String> {
        let Some(object) = input.as_object() else {
            return Err("input must be a JSON object".to_owned());
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field `{}`", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(format!(
                        "field `{}` must be {}",
                        field.name,
                        field.kind.describe()
                    ));
                }
                Some(value) if field.non_empty && is_empty(value) => {
                    return Err(format!("field `{}` must not be empty", field.name));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for field in &self.fields {
            let mut property = field.kind.to_json_schema();
            if let Some(object) = property.as_object_mut() {
                object.insert("description".to_owned(), json!(field.description));
                if field.non_empty {
                    let key = if matches!(field.kind, FieldKind::Array(_)) {
                        "minItems"
                    } else {
                        "minLength"
                    };
                    object.insert(key.to_owned(), json!(1));
                }
            }
            properties.insert(field.name.clone(), property);
            if field.required {
                required.push(json!(field.name));
            }
        }

        json!({ "type": "object", "properties": properties, "required": required })
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FieldKind, InputSchema};

    fn score_schema() -> InputSchema {
        InputSchema::new()
            .required("definition_id", FieldKind::String, "assessment definition")
            .required_non_empty(
                "answers",
                FieldKind::Array(Box::new(FieldKind::Number)),
                "answers on a 0-5 scale",
            )
            .optional("note", FieldKind::String, "free text")
    }

    #[test]
    fn accepts_well_formed_input() {
        let schema = score_schema();
        assert_eq!(schema.validate(&json!({ "definition_id": "burnout_v1", "answers": [1, 2.5] })), Ok(()));
    }

    #[test]
    fn reports_the_first_offending_field() {
        let schema = score_schema();

        assert_eq!(
            schema.validate(&json!({ "answers": [1] })),
            Err("missing required field `definition_id`".to_string())
        );
        assert_eq!(
            schema.validate(&json!({ "definition_id": "x", "answers": ["high"] })),
            Err("field `answers` must be array<number>".to_string())
        );
        assert_eq!(
            schema.validate(&json!({ "definition_id": "x", "answers": [] })),
            Err("field `answers` must not be empty".to_string())
        );
        assert!(schema.validate(&json!("not an object")).is_err());
    }

    #[test]
    fn renders_json_schema_for_prompts() {
        let rendered = score_schema().to_json_schema();

        assert_eq!(rendered["required"], json!(["definition_id", "answers"]));
        assert_eq!(rendered["properties"]["answers"]["items"]["type"], "number");
        assert_eq!(rendered["properties"]["answers"]["minItems"], 1);
    }
}
