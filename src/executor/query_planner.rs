use graphql_parser::query::{Field, Selection, SelectionSet, TypeCondition, Value};
use serde_json::{Map, Value as Json};
use std::collections::HashSet;

use super::normalize::{NormalizedOperation, build_document, collect_selection_variables};
use crate::composition::ComposedConfiguration;
use crate::error::{Error, Result};
use crate::schema::{OperationKind, value_to_json};

/// Root fields resolved by the gateway itself
pub const LOCAL_ROOT_FIELDS: [&str; 3] = ["__typename", "__schema", "__type"];

/// Produces an execution plan for a normalized, validated operation.
///
/// Planning is CPU-bound and must not block on I/O.
pub trait QueryPlanner: Send + Sync {
    fn plan(&self, operation: &NormalizedOperation<'_>, config: &ComposedConfiguration) -> Result<ExecutionPlan>;
}

/// An argument as written in the operation, with variables left unresolved
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    Variable(String),
    Literal(Json),
    List(Vec<ArgumentValue>),
    Object(Vec<(String, ArgumentValue)>),
}

impl ArgumentValue {
    fn from_ast(value: &Value<'_, String>) -> Self {
        match value {
            Value::Variable(name) => ArgumentValue::Variable(name.clone()),
            Value::List(items) => ArgumentValue::List(items.iter().map(ArgumentValue::from_ast).collect()),
            Value::Object(fields) => ArgumentValue::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), ArgumentValue::from_ast(value)))
                    .collect(),
            ),
            literal => ArgumentValue::Literal(value_to_json(literal, &Map::new())),
        }
    }

    pub fn resolve(&self, variables: &Map<String, Json>) -> Json {
        match self {
            ArgumentValue::Variable(name) => variables.get(name).cloned().unwrap_or(Json::Null),
            ArgumentValue::Literal(value) => value.clone(),
            ArgumentValue::List(items) => Json::Array(items.iter().map(|item| item.resolve(variables)).collect()),
            ArgumentValue::Object(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.resolve(variables)))
                    .collect(),
            ),
        }
    }
}

/// A selected field, flattened out of the operation AST
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub response_key: String,
    pub field_name: String,
    pub arguments: Vec<(String, ArgumentValue)>,
    /// Set when the field was selected inside `... on Type`
    pub type_condition: Option<String>,
    pub children: Vec<Projection>,
}

impl Projection {
    pub fn argument(&self, name: &str, variables: &Map<String, Json>) -> Option<Json> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value.resolve(variables))
    }

    fn from_field(field: &Field<'_, String>, type_condition: Option<String>) -> Self {
        Projection {
            response_key: field.alias.clone().unwrap_or_else(|| field.name.clone()),
            field_name: field.name.clone(),
            arguments: field
                .arguments
                .iter()
                .map(|(name, value)| (name.clone(), ArgumentValue::from_ast(value)))
                .collect(),
            type_condition,
            children: projections(&field.selection_set, None),
        }
    }
}

fn projections(selection_set: &SelectionSet<'_, String>, type_condition: Option<&str>) -> Vec<Projection> {
    let mut out = Vec::new();
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => {
                out.push(Projection::from_field(field, type_condition.map(str::to_string)))
            }
            Selection::InlineFragment(fragment) => {
                let condition = match &fragment.type_condition {
                    Some(TypeCondition::On(name)) => Some(name.as_str()),
                    None => type_condition,
                };
                out.extend(projections(&fragment.selection_set, condition));
            }
            Selection::FragmentSpread(_) => {}
        }
    }
    out
}

/// One request to one subgraph
#[derive(Debug, Clone, PartialEq)]
pub struct FetchNode {
    pub subgraph: String,
    pub url: String,
    /// Printed sub-operation containing only this subgraph's root fields
    pub operation: String,
    pub operation_name: Option<String>,
    /// Variables the sub-operation declares
    pub variables: Vec<String>,
    pub response_keys: Vec<String>,
}

impl FetchNode {
    /// The subset of `all` this fetch declares
    pub fn variables_from(&self, all: &Map<String, Json>) -> Map<String, Json> {
        self.variables
            .iter()
            .filter_map(|name| all.get(name).map(|value| (name.clone(), value.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub kind: OperationKind,
    pub root_type: String,
    /// Subgraph fetches. Query fetches run concurrently, mutation fetches in order.
    pub fetches: Vec<FetchNode>,
    /// Root fields answered by the gateway (`__typename`, introspection)
    pub local_fields: Vec<Projection>,
    /// Root response keys in document order
    pub response_keys: Vec<String>,
}

impl ExecutionPlan {
    /// Subscriptions that need a subgraph stream
    pub fn is_async(&self) -> bool {
        self.kind == OperationKind::Subscription && !self.fetches.is_empty()
    }
}

/// Routes every root field to the subgraph that owns it.
///
/// Query fields of one subgraph are batched into a single fetch; mutation fields are only
/// batched while consecutive fields share an owner, so execution order is preserved.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootFieldPlanner;

impl RootFieldPlanner {
    pub fn new() -> Self {
        RootFieldPlanner
    }
}

struct Group<'a> {
    subgraph: String,
    url: String,
    fields: Vec<Field<'a, String>>,
}

impl QueryPlanner for RootFieldPlanner {
    fn plan(&self, operation: &NormalizedOperation<'_>, config: &ComposedConfiguration) -> Result<ExecutionPlan> {
        let root_type = config
            .schema
            .root_type(operation.kind)
            .ok_or_else(|| Error::Planning(format!("schema has no {} root", operation.kind.as_str())))?
            .to_string();

        let mut root_fields = Vec::new();
        flatten_root(&operation.selection_set, &mut root_fields);

        let mut groups: Vec<Group<'_>> = Vec::new();
        let mut local_fields = Vec::new();
        let mut response_keys: Vec<String> = Vec::new();

        for field in root_fields {
            let key = field.alias.as_deref().unwrap_or(&field.name).to_string();
            if !response_keys.contains(&key) {
                response_keys.push(key);
            }

            if LOCAL_ROOT_FIELDS.contains(&field.name.as_str()) {
                local_fields.push(Projection::from_field(&field, None));
                continue;
            }

            let owner = config.owner_of(operation.kind, &field.name).ok_or_else(|| {
                Error::Planning(format!("no subgraph serves {}.{}", root_type, field.name))
            })?;

            let existing = match operation.kind {
                OperationKind::Mutation => groups.last_mut().filter(|group| group.subgraph == owner.name),
                _ => groups.iter_mut().find(|group| group.subgraph == owner.name),
            };
            match existing {
                Some(group) => group.fields.push(field),
                None => groups.push(Group {
                    subgraph: owner.name.clone(),
                    url: owner.url.clone(),
                    fields: vec![field],
                }),
            }
        }

        let fetches = groups
            .into_iter()
            .map(|group| fetch_node(operation, group))
            .collect();

        Ok(ExecutionPlan {
            kind: operation.kind,
            root_type,
            fetches,
            local_fields,
            response_keys,
        })
    }
}

/// Root-level inline fragments can only target the root type; their fields are hoisted
/// and the fragment's directives move onto each of them.
fn flatten_root<'a>(selection_set: &SelectionSet<'a, String>, out: &mut Vec<Field<'a, String>>) {
    for selection in &selection_set.items {
        match selection {
            Selection::Field(field) => out.push(field.clone()),
            Selection::InlineFragment(fragment) => {
                let start = out.len();
                flatten_root(&fragment.selection_set, out);
                for field in &mut out[start..] {
                    field.directives.extend(fragment.directives.iter().cloned());
                }
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn fetch_node<'a>(operation: &NormalizedOperation<'a>, group: Group<'a>) -> FetchNode {
    let selection_set = SelectionSet {
        span: operation.selection_set.span,
        items: group.fields.iter().cloned().map(Selection::Field).collect(),
    };

    let mut used = HashSet::new();
    collect_selection_variables(&selection_set, &mut used);
    let variable_definitions: Vec<_> = operation
        .variable_definitions
        .iter()
        .filter(|definition| used.contains(&definition.name))
        .cloned()
        .collect();
    let variables = variable_definitions
        .iter()
        .map(|definition| definition.name.clone())
        .collect();
    let response_keys = group
        .fields
        .iter()
        .map(|field| field.alias.clone().unwrap_or_else(|| field.name.clone()))
        .collect();

    let document = build_document(
        operation.kind,
        operation.name.clone(),
        operation.position,
        variable_definitions,
        Vec::new(),
        selection_set,
    );

    FetchNode {
        subgraph: group.subgraph,
        url: group.url,
        operation: document.to_string(),
        operation_name: operation.name.clone(),
        variables,
        response_keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubgraphConfig;
    use crate::composition::compose;
    use crate::executor::normalize::{extract_variables, normalize};
    use graphql_parser::query::parse_query;
    use pretty_assertions::assert_eq;

    fn config() -> ComposedConfiguration {
        compose(&[
            SubgraphConfig {
                name: "accounts".into(),
                url: "http://accounts/graphql".into(),
                schema: "type Query { me: User, user(id: ID!): User } type Mutation { login(name: String!): User } type User { id: ID!, name: String }".into(),
            },
            SubgraphConfig {
                name: "products".into(),
                url: "http://products/graphql".into(),
                schema: "type Query { topProducts(first: Int): [Product] } type Mutation { addProduct(upc: String!): Product } type Product { upc: String!, price: Int }".into(),
            },
        ])
        .unwrap()
    }

    fn plan(query: &str) -> ExecutionPlan {
        let config = config();
        let mut operation = normalize(parse_query::<String>(query).unwrap(), None).unwrap();
        let mut variables = Map::new();
        extract_variables(&mut operation, &config.schema, &mut variables);
        RootFieldPlanner::new().plan(&operation, &config).unwrap()
    }

    #[test]
    fn test_routes_root_fields_by_owner() {
        let plan = plan("query Home { me { name } topProducts(first: 2) { upc } user(id: 1) { id } }");
        assert_eq!(plan.fetches.len(), 2);
        assert_eq!(plan.fetches[0].subgraph, "accounts");
        assert_eq!(plan.fetches[0].response_keys, vec!["me", "user"]);
        assert_eq!(plan.fetches[0].variables, vec!["b"]);
        assert!(plan.fetches[0].operation.starts_with("query Home($b: ID!)"));
        assert!(!plan.fetches[0].operation.contains("topProducts"));
        assert_eq!(plan.fetches[1].subgraph, "products");
        assert_eq!(plan.fetches[1].variables, vec!["a"]);
        assert_eq!(plan.response_keys, vec!["me", "topProducts", "user"]);
    }

    #[test]
    fn test_mutations_keep_their_order() {
        let plan = plan(
            "mutation { first: login(name: \"a\") { id } addProduct(upc: \"x\") { upc } second: login(name: \"b\") { id } }",
        );
        let owners: Vec<&str> = plan.fetches.iter().map(|f| f.subgraph.as_str()).collect();
        assert_eq!(owners, vec!["accounts", "products", "accounts"]);
    }

    #[test]
    fn test_introspection_fields_stay_local() {
        let plan = plan("{ __typename __schema { queryType { name } } me { id } }");
        assert_eq!(plan.fetches.len(), 1);
        let local: Vec<&str> = plan.local_fields.iter().map(|p| p.field_name.as_str()).collect();
        assert_eq!(local, vec!["__typename", "__schema"]);
        assert_eq!(plan.local_fields[1].children[0].children[0].field_name, "name");
    }

    #[test]
    fn test_projection_flattens_fragments() {
        let document = parse_query::<String>("{ __type(name: \"User\") { name ... on __Type { kind } } }").unwrap();
        let operation = normalize(document, None).unwrap();
        let plan = RootFieldPlanner::new().plan(&operation, &config()).unwrap();
        let ty = &plan.local_fields[0];
        assert_eq!(ty.argument("name", &Map::new()), Some(Json::from("User")));
        assert_eq!(ty.children[1].field_name, "kind");
        assert_eq!(ty.children[1].type_condition.as_deref(), Some("__Type"));
    }

    #[test]
    fn test_unowned_field_fails_planning() {
        let config = config();
        let operation = normalize(parse_query::<String>("{ reviews { id } }").unwrap(), None).unwrap();
        let result = RootFieldPlanner::new().plan(&operation, &config);
        assert!(matches!(result, Err(Error::Planning(_))));
    }
}
