//! Operation and variable validation against the router schema.

use graphql_parser::Pos;
use graphql_parser::query::{Directive, Selection, SelectionSet, TypeCondition, Value};
use serde_json::{Map, Value as Json};
use std::collections::HashSet;

use super::normalize::NormalizedOperation;
use crate::error::GraphQLError;
use crate::schema::{OperationKind, SchemaModel, TypeKind, TypeRef};

/// Validate a normalized operation. All errors are collected, not just the first.
pub fn validate_operation(
    operation: &NormalizedOperation<'_>,
    schema: &SchemaModel,
    introspection: bool,
) -> Result<(), Vec<GraphQLError>> {
    let mut validator = Validator {
        schema,
        introspection,
        defined: operation
            .variable_definitions
            .iter()
            .map(|definition| definition.name.clone())
            .collect(),
        errors: Vec::new(),
    };

    for definition in &operation.variable_definitions {
        let ty = TypeRef::from_ast(&definition.var_type);
        if !schema.is_input_type(ty.named()) {
            validator.errors.push(
                GraphQLError::new(format!(
                    "Variable \"${}\" cannot be non-input type \"{}\".",
                    definition.name, ty
                ))
                .at(definition.position),
            );
        }
    }
    validator.check_directives(&operation.directives);

    let Some(root) = schema.root_type(operation.kind) else {
        validator.errors.push(
            GraphQLError::new(format!(
                "Schema is not configured for {}s.",
                operation.kind.as_str()
            ))
            .at(operation.position),
        );
        return Err(validator.errors);
    };

    if operation.kind == OperationKind::Subscription {
        let mut root_fields = Vec::new();
        collect_root_fields(&operation.selection_set, &mut root_fields);
        if root_fields.len() != 1 {
            let name = operation
                .name
                .as_deref()
                .map(|name| format!("Subscription \"{}\"", name))
                .unwrap_or_else(|| "Anonymous Subscription".to_string());
            validator.errors.push(
                GraphQLError::new(format!("{} must select only one top level field.", name))
                    .at(operation.position),
            );
        }
    }

    validator.check_selection_set(&operation.selection_set, root, true);

    if validator.errors.is_empty() {
        Ok(())
    } else {
        Err(validator.errors)
    }
}

fn collect_root_fields<'a, 'b>(selection_set: &'b SelectionSet<'a, String>, out: &mut Vec<&'b str>) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => out.push(field.alias.as_deref().unwrap_or(&field.name)),
            Selection::InlineFragment(fragment) => collect_root_fields(&fragment.selection_set, out),
            Selection::FragmentSpread(_) => {}
        }
    }
}

struct Validator<'s> {
    schema: &'s SchemaModel,
    introspection: bool,
    defined: HashSet<String>,
    errors: Vec<GraphQLError>,
}

impl Validator<'_> {
    fn check_selection_set(&mut self, selection_set: &SelectionSet<'_, String>, parent: &str, is_root: bool) {
        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) => {
                    self.check_directives(&field.directives);
                    for (_, value) in &field.arguments {
                        self.check_value_variables(value, field.position);
                    }

                    if field.name == "__typename" {
                        if !field.selection_set.items.is_empty() {
                            self.leaf_with_selection(&field.name, "String", field.position);
                        }
                        continue;
                    }
                    if is_root && (field.name == "__schema" || field.name == "__type") {
                        if !self.introspection {
                            self.errors.push(
                                GraphQLError::new("GraphQL introspection is not allowed.")
                                    .at(field.position),
                            );
                        } else if field.selection_set.items.is_empty() {
                            let ty = if field.name == "__schema" { "__Schema" } else { "__Type" };
                            self.errors.push(
                                GraphQLError::new(format!(
                                    "Field \"{}\" of type \"{}\" must have a selection of subfields.",
                                    field.name, ty
                                ))
                                .at(field.position),
                            );
                        }
                        continue;
                    }

                    let Some(definition) = self.schema.field(parent, &field.name) else {
                        let hint = match self.schema.get(parent).map(|ty| ty.kind) {
                            Some(TypeKind::Union) => " Did you mean to use an inline fragment?",
                            _ => "",
                        };
                        self.errors.push(
                            GraphQLError::new(format!(
                                "Cannot query field \"{}\" on type \"{}\".{}",
                                field.name, parent, hint
                            ))
                            .at(field.position),
                        );
                        continue;
                    };

                    for (name, _) in &field.arguments {
                        if definition.arg(name).is_none() {
                            self.errors.push(
                                GraphQLError::new(format!(
                                    "Unknown argument \"{}\" on field \"{}.{}\".",
                                    name, parent, field.name
                                ))
                                .at(field.position),
                            );
                        }
                    }
                    for arg in &definition.args {
                        let provided = field.arguments.iter().any(|(name, _)| name == &arg.name);
                        if arg.ty.is_non_null() && arg.default_value.is_none() && !provided {
                            self.errors.push(
                                GraphQLError::new(format!(
                                    "Field \"{}\" argument \"{}\" of type \"{}\" is required, but it was not provided.",
                                    field.name, arg.name, arg.ty
                                ))
                                .at(field.position),
                            );
                        }
                    }

                    let child = definition.ty.named();
                    if self.schema.is_leaf(child) {
                        if !field.selection_set.items.is_empty() {
                            self.leaf_with_selection(&field.name, child, field.position);
                        }
                    } else if field.selection_set.items.is_empty() {
                        self.errors.push(
                            GraphQLError::new(format!(
                                "Field \"{}\" of type \"{}\" must have a selection of subfields.",
                                field.name, definition.ty
                            ))
                            .at(field.position),
                        );
                    } else {
                        self.check_selection_set(&field.selection_set, child, false);
                    }
                }
                Selection::InlineFragment(fragment) => {
                    self.check_directives(&fragment.directives);
                    let condition = match &fragment.type_condition {
                        Some(TypeCondition::On(name)) => name.as_str(),
                        None => parent,
                    };
                    match self.schema.get(condition) {
                        None => self.errors.push(
                            GraphQLError::new(format!("Unknown type \"{}\".", condition))
                                .at(fragment.position),
                        ),
                        Some(ty) if !ty.is_composite() => self.errors.push(
                            GraphQLError::new(format!(
                                "Fragment cannot condition on non composite type \"{}\".",
                                condition
                            ))
                            .at(fragment.position),
                        ),
                        Some(_) if !self.schema.fragment_applies(parent, condition) => {
                            self.errors.push(
                                GraphQLError::new(format!(
                                    "Fragment cannot be spread here as objects of type \"{}\" can never be of type \"{}\".",
                                    parent, condition
                                ))
                                .at(fragment.position),
                            )
                        }
                        Some(_) => self.check_selection_set(&fragment.selection_set, condition, is_root),
                    }
                }
                // Normalization inlines every spread.
                Selection::FragmentSpread(_) => {}
            }
        }
    }

    fn leaf_with_selection(&mut self, field: &str, ty: &str, pos: Pos) {
        self.errors.push(
            GraphQLError::new(format!(
                "Field \"{}\" must not have a selection since type \"{}\" has no subfields.",
                field, ty
            ))
            .at(pos),
        );
    }

    fn check_directives(&mut self, directives: &[Directive<'_, String>]) {
        for directive in directives {
            for (_, value) in &directive.arguments {
                self.check_value_variables(value, directive.position);
            }
        }
    }

    fn check_value_variables(&mut self, value: &Value<'_, String>, pos: Pos) {
        match value {
            Value::Variable(name) if !self.defined.contains(name) => {
                self.errors.push(
                    GraphQLError::new(format!("Variable \"${}\" is not defined.", name)).at(pos),
                );
            }
            Value::List(items) => items.iter().for_each(|item| self.check_value_variables(item, pos)),
            Value::Object(fields) => fields
                .values()
                .for_each(|field| self.check_value_variables(field, pos)),
            _ => {}
        }
    }
}

/// Validate supplied and extracted variable values against their definitions.
pub fn validate_variables(
    operation: &NormalizedOperation<'_>,
    schema: &SchemaModel,
    variables: &Map<String, Json>,
) -> Result<(), Vec<GraphQLError>> {
    let mut errors = Vec::new();
    for definition in &operation.variable_definitions {
        let ty = TypeRef::from_ast(&definition.var_type);
        match variables.get(&definition.name) {
            None if ty.is_non_null() && definition.default_value.is_none() => {
                errors.push(
                    GraphQLError::new(format!(
                        "Variable \"${}\" of required type \"{}\" was not provided.",
                        definition.name, ty
                    ))
                    .at(definition.position),
                );
            }
            None => {}
            Some(value) => {
                if let Some(problem) = check_value(value, &ty, schema) {
                    errors.push(
                        GraphQLError::new(format!(
                            "Variable \"${}\" got invalid value {}; {}",
                            definition.name, value, problem
                        ))
                        .at(definition.position),
                    );
                }
            }
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Input coercion check. Returns a description of the first problem found.
fn check_value(value: &Json, ty: &TypeRef, schema: &SchemaModel) -> Option<String> {
    match ty {
        TypeRef::NonNull(inner) => {
            if value.is_null() {
                Some(format!("Expected non-nullable type \"{}\" not to be null.", ty))
            } else {
                check_value(value, inner, schema)
            }
        }
        TypeRef::List(inner) => match value {
            Json::Null => None,
            Json::Array(items) => items.iter().find_map(|item| check_value(item, inner, schema)),
            single => check_value(single, inner, schema),
        },
        TypeRef::Named(name) => {
            if value.is_null() {
                return None;
            }
            let valid = match name.as_str() {
                "Int" => value.as_i64().is_some_and(|n| i32::try_from(n).is_ok()),
                "Float" => value.is_number(),
                "String" => value.is_string(),
                "Boolean" => value.is_boolean(),
                "ID" => value.is_string() || value.is_i64() || value.is_u64(),
                _ => return check_named(value, name, schema),
            };
            if valid {
                None
            } else {
                Some(format!("Expected type \"{}\".", name))
            }
        }
    }
}

fn check_named(value: &Json, name: &str, schema: &SchemaModel) -> Option<String> {
    let Some(def) = schema.get(name) else {
        return Some(format!("Unknown type \"{}\".", name));
    };
    match def.kind {
        TypeKind::Scalar => None,
        TypeKind::Enum => match value.as_str() {
            Some(v) if def.enum_values.iter().any(|e| e.name == v) => None,
            _ => Some(format!("Value does not exist in \"{}\" enum.", name)),
        },
        TypeKind::InputObject => {
            let Some(fields) = value.as_object() else {
                return Some(format!("Expected type \"{}\" to be an object.", name));
            };
            for key in fields.keys() {
                if def.input_field(key).is_none() {
                    return Some(format!(
                        "Field \"{}\" is not defined by type \"{}\".",
                        key, name
                    ));
                }
            }
            for field in &def.input_fields {
                match fields.get(&field.name) {
                    None if field.ty.is_non_null() && field.default_value.is_none() => {
                        return Some(format!(
                            "Field \"{}\" of required type \"{}\" was not provided.",
                            field.name, field.ty
                        ));
                    }
                    None => {}
                    Some(inner) => {
                        if let Some(problem) = check_value(inner, &field.ty, schema) {
                            return Some(problem);
                        }
                    }
                }
            }
            None
        }
        _ => Some(format!("Type \"{}\" is not an input type.", name)),
    }
}
