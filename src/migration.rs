// Migration engine
// Compares the keyspace definition in force with a new one and lists the DDL
// that brings the store up to date. Only additive changes are ever applied:
// new types, new indexes and new fields. Removals and retyped parts are
// conflicts unless forced, and forced ones are skipped, never dropped. A
// skipped retype or index redefinition keeps its current version in the
// definition that ends up in force, so it always matches the tables on disk.

use crate::error::{Error, Result};
use crate::query::generator;
use crate::query::statement::Statement;
use crate::schema::{KeyspaceDefinition, ObjectDefinition};

/// The statements a migration runs, plus what it had to leave alone
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    statements: Vec<Statement>,
    ignored: Vec<String>,
    target: KeyspaceDefinition,
}

impl MigrationPlan {
    pub fn diff(
        current: &KeyspaceDefinition,
        next: &KeyspaceDefinition,
        force: bool,
    ) -> Result<Self> {
        if current.name() != next.name() {
            return Err(Error::MigrationConflict(format!(
                "cannot migrate keyspace `{}` to a definition of `{}`",
                current.name(),
                next.name()
            )));
        }

        let mut plan = MigrationPlan {
            statements: Vec::new(),
            ignored: Vec::new(),
            target: next.clone(),
        };
        let mut conflicts = Vec::new();

        if current.replication_class() != next.replication_class()
            || current.replication_factors() != next.replication_factors()
        {
            plan.statements.push(generator::alter_keyspace(next));
        }

        for old in current.definitions() {
            if next.definition(old.name()).is_none() {
                conflicts.push(format!("object type `{}` was removed", old.name()));
            }
        }

        for def in next.definitions() {
            match current.definition(def.name()) {
                None => plan.statements.extend(generator::create_object_tables(def)),
                Some(old) if old == def => {}
                Some(old) => {
                    if let Some(kept) = plan.diff_type(old, def, &mut conflicts)? {
                        plan.target = plan.target.with_definition(kept);
                    }
                }
            }
        }

        if !conflicts.is_empty() {
            if !force {
                return Err(Error::MigrationConflict(conflicts.join("; ")));
            }
            plan.ignored = conflicts;
        }
        Ok(plan)
    }

    /// Collect the additive DDL between two versions of a type
    ///
    /// Returns the definition to keep in force when a retyped field or a
    /// redefined index has to stay at its current version.
    fn diff_type(
        &mut self,
        old: &ObjectDefinition,
        new: &ObjectDefinition,
        conflicts: &mut Vec<String>,
    ) -> Result<Option<ObjectDefinition>> {
        let name = new.name();
        let mut reverted = false;

        for field in old.fields() {
            match new.field(&field.name) {
                None => conflicts.push(format!("field `{name}.{}` was removed", field.name)),
                Some(changed) if changed.data_type != field.data_type => {
                    conflicts.push(format!(
                        "field `{name}.{}` changed type from {} to {}",
                        field.name, field.data_type, changed.data_type
                    ));
                    reverted = true;
                }
                Some(_) => {}
            }
        }
        for field in new.fields() {
            if old.field(&field.name).is_none() {
                self.statements.push(generator::add_field(new, field));
            }
        }

        for index in old.indexes() {
            match new.index(index.name()) {
                None => conflicts.push(format!("index `{name}.{}` was removed", index.name())),
                Some(changed) if changed != index => {
                    conflicts.push(format!("index `{name}.{}` was redefined", index.name()));
                    reverted = true;
                }
                Some(_) => {}
            }
        }
        let kept = if reverted {
            Some(Self::keep_current(old, new)?)
        } else {
            None
        };
        let target = kept.as_ref().unwrap_or(new);
        for index in target.indexes() {
            if old.index(index.name()).is_none() {
                self.statements.push(generator::create_index_table(target, index));
            }
        }
        Ok(kept)
    }

    /// `new` with retyped fields and redefined indexes back at their `old` version
    fn keep_current(old: &ObjectDefinition, new: &ObjectDefinition) -> Result<ObjectDefinition> {
        let indexes: Vec<_> = new
            .indexes()
            .map(|index| old.index(index.name()).unwrap_or(index).clone())
            .collect();
        let mut fields: Vec<_> = new
            .fields()
            .map(|field| old.field(&field.name).unwrap_or(field).clone())
            .collect();
        // a kept index may still name a field the new version dropped
        for index in &indexes {
            for key in index.fields() {
                if fields.iter().any(|f| &f.name == key) {
                    continue;
                }
                if let Some(field) = old.field(key) {
                    fields.push(field.clone());
                }
            }
        }
        ObjectDefinition::new(new.name(), fields, indexes, new.allow_null_primary_key_inserts())
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Non-additive differences a forced migration skipped
    pub fn ignored(&self) -> &[String] {
        &self.ignored
    }

    /// The definition in force once the plan has run
    pub fn target(&self) -> &KeyspaceDefinition {
        &self.target
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
