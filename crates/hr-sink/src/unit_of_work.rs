//! Unit of Work
//!
//! Collects create/update/delete operations for a single all-or-none commit.
//! Each registered operation gets a `ReferenceId`; a later operation in the
//! same unit may use `UnitOfWork::reference(&id)` as a field value to point
//! at the record the earlier operation will produce.

use std::collections::HashSet;

use hr_common::{Fields, ReferenceId, SinkError, SinkRecord};
use serde_json::Value;

/// A pending operation inside a unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create {
        reference_id: ReferenceId,
        record: SinkRecord,
    },
    Update {
        reference_id: ReferenceId,
        object_type: String,
        id: String,
        fields: Fields,
    },
    Delete {
        reference_id: ReferenceId,
        object_type: String,
        id: String,
    },
}

impl Operation {
    pub fn reference_id(&self) -> &ReferenceId {
        match self {
            Operation::Create { reference_id, .. }
            | Operation::Update { reference_id, .. }
            | Operation::Delete { reference_id, .. } => reference_id,
        }
    }

    pub fn object_type(&self) -> &str {
        match self {
            Operation::Create { record, .. } => &record.object_type,
            Operation::Update { object_type, .. } | Operation::Delete { object_type, .. } => object_type,
        }
    }

    /// Record id targeted by update/delete; `None` for creates
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Operation::Create { .. } => None,
            Operation::Update { id, .. } | Operation::Delete { id, .. } => Some(id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    operations: Vec<Operation>,
    references: HashSet<ReferenceId>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field value that resolves to the id produced by `reference` at commit time
    pub fn reference(reference: &ReferenceId) -> Value {
        Value::String(format!("@{{{}.id}}", reference))
    }

    pub fn register_create(&mut self, record: SinkRecord) -> Result<ReferenceId, SinkError> {
        let reference_id = self.next_reference();
        self.register_create_as(reference_id, record)
    }

    /// Register a create under a caller-chosen reference id
    pub fn register_create_as(
        &mut self,
        reference_id: impl Into<ReferenceId>,
        record: SinkRecord,
    ) -> Result<ReferenceId, SinkError> {
        let reference_id = reference_id.into();
        self.check_new_reference(&reference_id)?;
        self.check_field_references(&record.fields)?;

        self.push(Operation::Create {
            reference_id: reference_id.clone(),
            record,
        });
        Ok(reference_id)
    }

    pub fn register_update(
        &mut self,
        object_type: impl Into<String>,
        id: impl Into<String>,
        fields: Fields,
    ) -> Result<ReferenceId, SinkError> {
        let id = id.into();
        self.check_value_reference(&id)?;
        self.check_field_references(&fields)?;

        let reference_id = self.next_reference();
        self.push(Operation::Update {
            reference_id: reference_id.clone(),
            object_type: object_type.into(),
            id,
            fields,
        });
        Ok(reference_id)
    }

    pub fn register_delete(
        &mut self,
        object_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<ReferenceId, SinkError> {
        let id = id.into();
        self.check_value_reference(&id)?;

        let reference_id = self.next_reference();
        self.push(Operation::Delete {
            reference_id: reference_id.clone(),
            object_type: object_type.into(),
            id,
        });
        Ok(reference_id)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn contains(&self, reference_id: &ReferenceId) -> bool {
        self.references.contains(reference_id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn push(&mut self, operation: Operation) {
        self.references.insert(operation.reference_id().clone());
        self.operations.push(operation);
    }

    fn next_reference(&self) -> ReferenceId {
        let mut n = self.operations.len() + 1;
        loop {
            let candidate = ReferenceId::new(format!("ref{}", n));
            if !self.references.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn check_new_reference(&self, reference_id: &ReferenceId) -> Result<(), SinkError> {
        let name = reference_id.as_str();
        let well_formed = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !well_formed {
            return Err(SinkError::InvalidReference(format!(
                "'{}' must start with a letter and contain only letters, digits and underscores",
                name
            )));
        }
        if self.references.contains(reference_id) {
            return Err(SinkError::InvalidReference(format!("'{}' is already registered", name)));
        }
        Ok(())
    }

    fn check_field_references(&self, fields: &Fields) -> Result<(), SinkError> {
        for value in fields.values() {
            if let Value::String(s) = value {
                self.check_value_reference(s)?;
            }
        }
        Ok(())
    }

    /// A value of the form `@{name.field}` must name an operation registered earlier
    fn check_value_reference(&self, value: &str) -> Result<(), SinkError> {
        match referenced_name(value) {
            Some(name) if !self.references.contains(&ReferenceId::from(name)) => {
                Err(SinkError::InvalidReference(format!(
                    "'{}' refers to '{}', which is not registered earlier in this unit of work",
                    value, name
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Reference name inside an `@{name.field}` placeholder
fn referenced_name(value: &str) -> Option<&str> {
    let inner = value.strip_prefix("@{")?.strip_suffix('}')?;
    let (name, _field) = inner.split_once('.')?;
    Some(name)
}
