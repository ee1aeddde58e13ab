//! Introspection data source.
//!
//! The router schema is rendered once per executor into the JSON shape of `__Schema`;
//! queries are answered by projecting that document through the requested selection.

use serde_json::{Map, Value as Json, json};

use super::query_planner::Projection;
use crate::schema::{EnumValueDef, FieldDef, InputValueDef, SchemaModel, TypeDef, TypeRef};

/// Render `schema` as an `__Schema` object
pub fn schema_json(schema: &SchemaModel) -> Json {
    let types: Vec<Json> = schema.types.values().map(type_json).collect();
    let root = |name: Option<&str>| match name {
        Some(name) => json!({ "__typename": "__Type", "kind": "OBJECT", "name": name }),
        None => Json::Null,
    };

    let mut value = json!({
        "__typename": "__Schema",
        "description": null,
        "queryType": root(Some(schema.query_type.as_str())),
        "mutationType": root(schema.mutation_type.as_deref()),
        "subscriptionType": root(schema.subscription_type.as_deref()),
        "types": types,
        "directives": builtin_directives(),
    });
    resolve_ref_kinds(&mut value, schema);
    value
}

fn type_json(ty: &TypeDef) -> Json {
    use crate::schema::TypeKind::*;
    let fields = match ty.kind {
        Object | Interface => Json::Array(ty.fields.iter().map(field_json).collect()),
        _ => Json::Null,
    };
    let interfaces = match ty.kind {
        Object | Interface => Json::Array(ty.interfaces.iter().map(|name| named_ref(name)).collect()),
        _ => Json::Null,
    };
    let possible_types = match ty.kind {
        Union => Json::Array(ty.members.iter().map(|name| named_ref(name)).collect()),
        _ => Json::Null,
    };
    let enum_values = match ty.kind {
        Enum => Json::Array(ty.enum_values.iter().map(enum_value_json).collect()),
        _ => Json::Null,
    };
    let input_fields = match ty.kind {
        InputObject => Json::Array(ty.input_fields.iter().map(input_value_json).collect()),
        _ => Json::Null,
    };

    json!({
        "__typename": "__Type",
        "kind": ty.kind.as_str(),
        "name": ty.name,
        "description": ty.description,
        "fields": fields,
        "interfaces": interfaces,
        "possibleTypes": possible_types,
        "enumValues": enum_values,
        "inputFields": input_fields,
        "ofType": null,
        "specifiedByURL": null,
    })
}

fn field_json(field: &FieldDef) -> Json {
    json!({
        "__typename": "__Field",
        "name": field.name,
        "description": field.description,
        "args": field.args.iter().map(input_value_json).collect::<Vec<_>>(),
        "type": type_ref_json(&field.ty),
        "isDeprecated": field.deprecation_reason.is_some(),
        "deprecationReason": field.deprecation_reason,
    })
}

fn input_value_json(value: &InputValueDef) -> Json {
    json!({
        "__typename": "__InputValue",
        "name": value.name,
        "description": value.description,
        "type": type_ref_json(&value.ty),
        "defaultValue": value.default_value,
    })
}

fn enum_value_json(value: &EnumValueDef) -> Json {
    json!({
        "__typename": "__EnumValue",
        "name": value.name,
        "description": value.description,
        "isDeprecated": value.deprecation_reason.is_some(),
        "deprecationReason": value.deprecation_reason,
    })
}

fn named_ref(name: &str) -> Json {
    json!({ "__typename": "__Type", "kind": null, "name": name, "ofType": null })
}

fn type_ref_json(ty: &TypeRef) -> Json {
    match ty {
        TypeRef::Named(name) => named_ref(name),
        TypeRef::List(inner) => {
            json!({ "__typename": "__Type", "kind": "LIST", "name": null, "ofType": type_ref_json(inner) })
        }
        TypeRef::NonNull(inner) => {
            json!({ "__typename": "__Type", "kind": "NON_NULL", "name": null, "ofType": type_ref_json(inner) })
        }
    }
}

/// Named references are rendered before the kind of their target is looked up
fn resolve_ref_kinds(value: &mut Json, schema: &SchemaModel) {
    match value {
        Json::Object(object) => {
            let unresolved = object.get("kind").is_some_and(Json::is_null);
            if unresolved {
                let kind = object
                    .get("name")
                    .and_then(Json::as_str)
                    .and_then(|name| schema.get(name))
                    .map(|ty| Json::from(ty.kind.as_str()))
                    .unwrap_or(Json::Null);
                object.insert("kind".to_string(), kind);
            }
            for child in object.values_mut() {
                resolve_ref_kinds(child, schema);
            }
        }
        Json::Array(items) => items.iter_mut().for_each(|item| resolve_ref_kinds(item, schema)),
        _ => {}
    }
}

fn builtin_directives() -> Json {
    let condition = |name: &str, description: &str| {
        json!({
            "__typename": "__Directive",
            "name": name,
            "description": description,
            "isRepeatable": false,
            "locations": ["FIELD", "FRAGMENT_SPREAD", "INLINE_FRAGMENT"],
            "args": [{
                "__typename": "__InputValue",
                "name": "if",
                "description": null,
                "type": { "__typename": "__Type", "kind": "NON_NULL", "name": null, "ofType": named_ref("Boolean") },
                "defaultValue": null,
            }],
        })
    };
    json!([
        condition("include", "Directs the executor to include this field or fragment only when the `if` argument is true."),
        condition("skip", "Directs the executor to skip this field or fragment when the `if` argument is true."),
        {
            "__typename": "__Directive",
            "name": "deprecated",
            "description": "Marks an element of a GraphQL schema as no longer supported.",
            "isRepeatable": false,
            "locations": ["FIELD_DEFINITION", "ARGUMENT_DEFINITION", "INPUT_FIELD_DEFINITION", "ENUM_VALUE"],
            "args": [{
                "__typename": "__InputValue",
                "name": "reason",
                "description": null,
                "type": named_ref("String"),
                "defaultValue": "\"No longer supported\"",
            }],
        },
    ])
}

/// Resolve the root fields the gateway answers itself.
///
/// `schema` is `None` when introspection is disabled; validation rejects `__schema` and
/// `__type` in that case, so only `__typename` reaches here.
pub fn resolve_local_fields(
    fields: &[Projection],
    root_type: &str,
    schema: Option<&Json>,
    variables: &Map<String, Json>,
) -> Map<String, Json> {
    let mut data = Map::new();
    for field in fields {
        let value = match field.field_name.as_str() {
            "__typename" => Json::from(root_type),
            "__schema" => schema
                .map(|schema| project(schema, &field.children, variables))
                .unwrap_or(Json::Null),
            "__type" => {
                let wanted = field.argument("name", variables);
                schema
                    .and_then(|schema| schema.get("types"))
                    .and_then(Json::as_array)
                    .and_then(|types| types.iter().find(|ty| ty.get("name") == wanted.as_ref()))
                    .map(|ty| project(ty, &field.children, variables))
                    .unwrap_or(Json::Null)
            }
            _ => Json::Null,
        };
        data.insert(field.response_key.clone(), value);
    }
    data
}

fn project(value: &Json, selections: &[Projection], variables: &Map<String, Json>) -> Json {
    match value {
        Json::Array(items) => Json::Array(
            items
                .iter()
                .map(|item| project(item, selections, variables))
                .collect(),
        ),
        Json::Object(object) => {
            let typename = object.get("__typename").and_then(Json::as_str);
            let mut out = Map::new();
            for selection in selections {
                if let (Some(condition), Some(typename)) = (&selection.type_condition, typename) {
                    if condition != typename {
                        continue;
                    }
                }
                let raw = object.get(&selection.field_name).unwrap_or(&Json::Null);
                let include_deprecated = selection
                    .argument("includeDeprecated", variables)
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false);
                let value = match (selection.field_name.as_str(), raw) {
                    ("fields" | "enumValues", Json::Array(items)) if !include_deprecated => Json::Array(
                        items
                            .iter()
                            .filter(|item| item.get("isDeprecated") != Some(&Json::Bool(true)))
                            .cloned()
                            .collect(),
                    ),
                    _ => raw.clone(),
                };
                let projected = if selection.children.is_empty() {
                    value
                } else {
                    project(&value, &selection.children, variables)
                };
                out.insert(selection.response_key.clone(), projected);
            }
            Json::Object(out)
        }
        other => other.clone(),
    }
}
