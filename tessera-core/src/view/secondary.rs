//! Secondary view key and value derivation

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::key::RowKey;
use crate::schema::{DimensionDesc, Dimensions, KeyType};
use crate::{Datum, Result, RowId, TesseraError};

/// Field of the stored value holding the source row's key
pub const PRIMARY_KEY_FIELD: &str = "primaryKey";

/// Field holding a computed-column result that is not a struct
pub const COMPUTED_FIELD: &str = "computed";

/// One key dimension of a secondary view and the source field it reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyField {
    pub field: String,
    #[serde(flatten)]
    pub desc: DimensionDesc,
}

impl KeyField {
    pub fn new(field: impl Into<String>, desc: DimensionDesc) -> Self {
        Self {
            field: field.into(),
            desc,
        }
    }
}

/// Computed columns: an expression run by a registered evaluator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedColumns {
    pub evaluator: String,
    pub expression: String,
}

/// Definition of a secondary view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryViewSpec {
    pub name: String,
    pub key_fields: Vec<KeyField>,
    /// Fields copied from the source row; only the primary key when empty
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedColumns>,
    /// Skip derived rows with a nil key component
    #[serde(default)]
    pub exclude_nil_keys: bool,
}

/// Evaluates computed-column expressions against a source row
pub trait ColumnEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, row: &Datum) -> Result<Datum>;
}

/// Named column evaluators available to secondary views
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<String, Arc<dyn ColumnEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, evaluator: Arc<dyn ColumnEvaluator>) {
        self.evaluators.insert(name.into(), evaluator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ColumnEvaluator>> {
        self.evaluators.get(name).cloned()
    }
}

impl fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.evaluators.keys()).finish()
    }
}

/// A row to write into a secondary view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedRow {
    pub key: RowKey,
    /// Serialized value; empty for a tombstone
    pub value: Bytes,
}

impl SecondaryViewSpec {
    /// Key schema of the view: the declared dimensions plus the row id
    pub fn dimensions(&self) -> Result<Dimensions> {
        let declared: Vec<DimensionDesc> = self.key_fields.iter().map(|k| k.desc).collect();
        Dimensions::secondary(&declared)
    }

    /// Check the definition before any view is created from it
    pub fn validate(&self, evaluators: &EvaluatorRegistry) -> Result<()> {
        if self.name.is_empty() {
            return Err(TesseraError::Schema("secondary view needs a name".into()));
        }
        self.dimensions()?;
        if let Some(field) = self.key_fields.iter().find(|k| k.field.is_empty()) {
            return Err(TesseraError::Schema(format!(
                "key field of type {} has no field name",
                field.desc.key_type
            )));
        }
        if let Some(computed) = &self.computed {
            if evaluators.get(&computed.evaluator).is_none() {
                return Err(TesseraError::Evaluation(format!(
                    "unknown evaluator: {}",
                    computed.evaluator
                )));
            }
        }
        Ok(())
    }

    /// Keys the source row produces in this view.
    ///
    /// A list field contributes one component per element (a nil component
    /// for an empty list); every combination of components becomes a key.
    pub fn derive_keys(&self, dims: &Dimensions, data: &Datum, row_id: RowId) -> Result<Vec<RowKey>> {
        let mut combos: Vec<Vec<Datum>> = vec![Vec::with_capacity(self.key_fields.len())];
        for key_field in &self.key_fields {
            let components = components(key_field, data);
            let mut next = Vec::with_capacity(combos.len() * components.len());
            for combo in &combos {
                for component in &components {
                    let mut extended = combo.clone();
                    extended.push(component.clone());
                    next.push(extended);
                }
            }
            combos = next;
        }

        let mut keys = Vec::with_capacity(combos.len());
        for combo in combos {
            if self.exclude_nil_keys && combo.iter().any(Datum::is_nil) {
                continue;
            }
            let key = RowKey::encode_with_row_id(dims, &combo, row_id)?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Value stored under every key the source row produces
    pub fn derive_value(
        &self,
        evaluators: &EvaluatorRegistry,
        primary_dims: &Dimensions,
        primary_key: &RowKey,
        data: &Datum,
    ) -> Result<Datum> {
        let mut value = Datum::structure(
            self.columns
                .iter()
                .map(|c| (c.clone(), data.field(c).cloned().unwrap_or_default())),
        );
        value.set_field(PRIMARY_KEY_FIELD, primary_key.to_datum(primary_dims)?);

        if let Some(computed) = &self.computed {
            let evaluator = evaluators.get(&computed.evaluator).ok_or_else(|| {
                TesseraError::Evaluation(format!("unknown evaluator: {}", computed.evaluator))
            })?;
            match evaluator.evaluate(&computed.expression, data)? {
                Datum::Struct(fields) => {
                    for (name, field) in fields {
                        value.set_field(name, field);
                    }
                }
                Datum::Nil => {}
                other => value.set_field(COMPUTED_FIELD, other),
            }
        }
        Ok(value)
    }

    /// Rows to write for a new version of a source row
    pub fn derive_rows(
        &self,
        dims: &Dimensions,
        evaluators: &EvaluatorRegistry,
        primary_dims: &Dimensions,
        primary_key: &RowKey,
        data: &Datum,
        row_id: RowId,
    ) -> Result<Vec<DerivedRow>> {
        let keys = self.derive_keys(dims, data, row_id)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let value = Bytes::from(
            self.derive_value(evaluators, primary_dims, primary_key, data)?
                .to_bytes()?,
        );
        Ok(keys
            .into_iter()
            .map(|key| DerivedRow {
                key,
                value: value.clone(),
            })
            .collect())
    }

    /// Tombstones for the rows an older version of a source row produced
    pub fn derive_tombstones(&self, dims: &Dimensions, data: &Datum, row_id: RowId) -> Result<Vec<DerivedRow>> {
        Ok(self
            .derive_keys(dims, data, row_id)?
            .into_iter()
            .map(|key| DerivedRow {
                key,
                value: Bytes::new(),
            })
            .collect())
    }
}

fn components(key_field: &KeyField, data: &Datum) -> Vec<Datum> {
    let value = data.field(&key_field.field).cloned().unwrap_or_default();
    match (key_field.desc.key_type, value) {
        (KeyType::ListUtf8, Datum::Array(items)) if items.is_empty() => vec![Datum::Nil],
        (KeyType::ListUtf8, Datum::Array(items)) => items,
        (_, value) => vec![value],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl ColumnEvaluator for Upper {
        fn evaluate(&self, expression: &str, row: &Datum) -> Result<Datum> {
            let text = row
                .field(expression)
                .and_then(Datum::as_str)
                .ok_or_else(|| TesseraError::Evaluation(format!("no string field {}", expression)))?;
            Ok(Datum::from(text.to_uppercase()))
        }
    }

    fn primary_dims() -> Dimensions {
        Dimensions::primary(vec![DimensionDesc::new(KeyType::Utf8)]).unwrap()
    }

    fn by_tag() -> SecondaryViewSpec {
        SecondaryViewSpec {
            name: "byTag".into(),
            key_fields: vec![
                KeyField::new("tags", DimensionDesc::new(KeyType::ListUtf8)),
                KeyField::new("owner", DimensionDesc::new(KeyType::Utf8)),
            ],
            columns: vec!["title".into()],
            computed: None,
            exclude_nil_keys: false,
        }
    }

    fn row(tags: Vec<&str>, owner: Option<&str>) -> Datum {
        let mut row = Datum::structure([
            ("title", Datum::from("Report")),
            ("tags", Datum::Array(tags.into_iter().map(Datum::from).collect())),
        ]);
        if let Some(owner) = owner {
            row.set_field("owner", Datum::from(owner));
        }
        row
    }

    #[test]
    fn test_list_field_fans_out() {
        let spec = by_tag();
        let dims = spec.dimensions().unwrap();
        assert_eq!(dims.len(), 3);
        let keys = spec.derive_keys(&dims, &row(vec!["b", "a"], Some("kim")), 42).unwrap();
        let decoded: Vec<_> = keys.iter().map(|k| k.decode(&dims).unwrap()).collect();
        assert_eq!(
            decoded,
            vec![
                vec![Datum::from("b"), Datum::from("kim"), Datum::Int64(42)],
                vec![Datum::from("a"), Datum::from("kim"), Datum::Int64(42)],
            ]
        );
    }

    #[test]
    fn test_empty_list_and_nil_keys() {
        let mut spec = by_tag();
        let dims = spec.dimensions().unwrap();
        let keys = spec.derive_keys(&dims, &row(vec![], None), 7).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].has_null_dimensions(&dims).unwrap());

        spec.exclude_nil_keys = true;
        assert!(spec.derive_keys(&dims, &row(vec![], None), 7).unwrap().is_empty());
        assert_eq!(spec.derive_keys(&dims, &row(vec!["x"], Some("kim")), 7).unwrap().len(), 1);
    }

    #[test]
    fn test_derived_value() {
        let spec = by_tag();
        let key = RowKey::encode(&primary_dims(), &[Datum::from("doc-1")]).unwrap();
        let value = spec
            .derive_value(&EvaluatorRegistry::new(), &primary_dims(), &key, &row(vec!["a"], None))
            .unwrap();
        assert_eq!(value.field("title"), Some(&Datum::from("Report")));
        assert_eq!(
            value.field(PRIMARY_KEY_FIELD),
            Some(&Datum::Array(vec![Datum::from("doc-1")]))
        );
        assert_eq!(value.count(), 2);
    }

    #[test]
    fn test_computed_columns() {
        let mut registry = EvaluatorRegistry::new();
        registry.register("upper", Arc::new(Upper));
        let mut spec = by_tag();
        spec.columns.clear();
        spec.computed = Some(ComputedColumns {
            evaluator: "upper".into(),
            expression: "title".into(),
        });
        spec.validate(&registry).unwrap();

        let key = RowKey::encode(&primary_dims(), &[Datum::from("doc-1")]).unwrap();
        let value = spec
            .derive_value(&registry, &primary_dims(), &key, &row(vec![], None))
            .unwrap();
        assert_eq!(value.field(COMPUTED_FIELD), Some(&Datum::from("REPORT")));

        spec.computed = Some(ComputedColumns {
            evaluator: "missing".into(),
            expression: String::new(),
        });
        assert!(matches!(spec.validate(&registry), Err(TesseraError::Evaluation(_))));
    }

    #[test]
    fn test_tombstones_match_derived_keys() {
        let spec = by_tag();
        let dims = spec.dimensions().unwrap();
        let data = row(vec!["a", "b"], Some("kim"));
        let key = RowKey::encode(&primary_dims(), &[Datum::from("doc-1")]).unwrap();
        let rows = spec
            .derive_rows(&dims, &EvaluatorRegistry::new(), &primary_dims(), &key, &data, 3)
            .unwrap();
        let tombstones = spec.derive_tombstones(&dims, &data, 3).unwrap();
        assert_eq!(rows.len(), tombstones.len());
        for (row, tombstone) in rows.iter().zip(&tombstones) {
            assert_eq!(row.key, tombstone.key);
            assert!(tombstone.value.is_empty());
            assert!(!row.value.is_empty());
        }
    }

    #[test]
    fn test_spec_json() {
        let json = r#"{"name":"byOwner","keyFields":[{"field":"owner","keyType":"utf8","sort":"descending"}],"excludeNilKeys":true}"#;
        let spec: SecondaryViewSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.key_fields[0].desc, DimensionDesc::descending(KeyType::Utf8));
        assert!(spec.columns.is_empty());
        assert!(spec.exclude_nil_keys);
    }
}
